/*
Copyright 2024-2025 The Spice.ai OSS Authors

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

     https://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Side-channel RPCs: session schema introspection, table refresh/drop, the
//! connection registry CRUD, and session creation.

use std::sync::Arc;

use arrow_flight::{Action, ActionType};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use rand::Rng;
use serde::Deserialize;
use tonic::{Request, Response, Status};

use super::util::string_cell;
use super::Service;
use crate::command::DEFAULT_SESSION_ID;
use crate::registry;
use crate::session::Session;

type DoActionStream = BoxStream<'static, Result<arrow_flight::Result, Status>>;
type ListActionsStream = BoxStream<'static, Result<ActionType, Status>>;

const ACTIONS: &[(&str, &str)] = &[
    ("get_schema", "Tables and columns visible in a session"),
    ("refresh_table", "Probe a session table for liveness"),
    ("drop_table", "Drop a session table or view"),
    ("refresh_all", "Refresh all session tables"),
    ("list_connections", "List registered external connections"),
    ("save_connection", "Register an external connection"),
    ("delete_connection", "Delete a non-system connection"),
    ("create_session", "Create a fresh isolated session"),
];

pub(crate) async fn list() -> Response<ListActionsStream> {
    let actions: Vec<Result<ActionType, Status>> = ACTIONS
        .iter()
        .map(|(name, description)| {
            Ok(ActionType {
                r#type: (*name).to_string(),
                description: (*description).to_string(),
            })
        })
        .collect();
    Response::new(stream::iter(actions).boxed())
}

pub(crate) async fn do_action(
    service: &Service,
    request: Request<Action>,
) -> Result<Response<DoActionStream>, Status> {
    let action = request.into_inner();
    let body = match action.r#type.as_str() {
        "get_schema" => get_schema(service, &action.body).await?,
        "refresh_table" => refresh_table(service, &action.body).await?,
        "drop_table" => drop_table(service, &action.body).await?,
        "refresh_all" => refresh_all(service, &action.body)?,
        "list_connections" => list_connections(service).await?,
        "save_connection" => save_connection(service, &action.body).await?,
        "delete_connection" => delete_connection(service, &action.body).await?,
        "create_session" => create_session(service)?,
        other => return Err(Status::invalid_argument(format!("Unknown action: {other}"))),
    };

    let result = arrow_flight::Result { body: body.into() };
    Ok(Response::new(stream::iter(vec![Ok(result)]).boxed()))
}

fn default_session() -> String {
    DEFAULT_SESSION_ID.to_string()
}

#[derive(Deserialize)]
struct SessionBody {
    #[serde(default = "default_session")]
    session_id: String,
}

#[derive(Deserialize)]
struct TableBody {
    #[serde(default = "default_session")]
    session_id: String,
    table_name: String,
    #[serde(default)]
    table_type: String,
}

#[derive(Deserialize)]
struct SaveConnectionBody {
    name: String,
    #[serde(rename = "type")]
    connection_type: String,
    connection_string: String,
}

#[derive(Deserialize)]
struct DeleteConnectionBody {
    id: serde_json::Value,
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, Status> {
    serde_json::from_slice(body)
        .map_err(|e| Status::invalid_argument(format!("Invalid action body: {e}")))
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// `information_schema` dump of the session: tables and views with their
/// columns, excluding the engine's own catalogs.
async fn get_schema(service: &Service, body: &[u8]) -> Result<Vec<u8>, Status> {
    let body: SessionBody = parse_body(body)?;
    let session = service.runtime.sessions.get_or_create(&body.session_id);

    let tables = session
        .context
        .collect(
            "SELECT table_schema, table_name, table_type
             FROM information_schema.tables
             WHERE table_schema NOT IN ('information_schema', 'pg_catalog')
             ORDER BY table_name",
        )
        .await
        .map_err(|e| Status::internal(format!("Failed to fetch schema: {e}")))?;

    let mut tables_json = Vec::new();
    for batch in &tables {
        for row in 0..batch.num_rows() {
            let table_schema = string_cell(batch, 0, row);
            let table_name = string_cell(batch, 1, row);
            let table_type = string_cell(batch, 2, row);

            let columns = session
                .context
                .collect(&format!(
                    "SELECT column_name, data_type
                     FROM information_schema.columns
                     WHERE table_name = '{}' AND table_schema = '{}'
                     ORDER BY ordinal_position",
                    escape_literal(&table_name),
                    escape_literal(&table_schema),
                ))
                .await
                .map_err(|e| Status::internal(format!("Failed to fetch schema: {e}")))?;

            let mut columns_json = Vec::new();
            for column_batch in &columns {
                for column_row in 0..column_batch.num_rows() {
                    columns_json.push(serde_json::json!({
                        "name": string_cell(column_batch, 0, column_row),
                        "type": string_cell(column_batch, 1, column_row),
                        "primaryKey": false,
                        "fk": null,
                    }));
                }
            }

            tables_json.push(serde_json::json!({
                "name": table_name,
                "type": table_type,
                "columns": columns_json,
            }));
        }
    }

    let schema = serde_json::json!({
        "name": format!("Session : {}", body.session_id),
        "models": [],
        "tables": tables_json,
    });
    Ok(serde_json::to_vec(&schema).unwrap_or_default())
}

/// Probe with `SELECT 1 ... LIMIT 1`; failures come back as
/// `{success: false, message}` instead of a Flight error so the UI stays up.
async fn refresh_table(service: &Service, body: &[u8]) -> Result<Vec<u8>, Status> {
    let body: TableBody = parse_body(body)?;
    let session = service.runtime.sessions.get_or_create(&body.session_id);
    tracing::info!(
        "Refreshing table '{}' for session {}",
        body.table_name,
        body.session_id
    );

    let probe = session
        .context
        .collect(&format!("SELECT 1 FROM {} LIMIT 1", body.table_name))
        .await;
    let response = match probe {
        Ok(_) => serde_json::json!({"success": true}),
        Err(e) => {
            tracing::warn!("Table refresh failed for {}: {e}", body.table_name);
            serde_json::json!({"success": false, "message": e.to_string()})
        }
    };
    Ok(serde_json::to_vec(&response).unwrap_or_default())
}

async fn drop_table(service: &Service, body: &[u8]) -> Result<Vec<u8>, Status> {
    let body: TableBody = parse_body(body)?;
    let session = service.runtime.sessions.get_or_create(&body.session_id);
    let table_type = body.table_type.to_uppercase();
    tracing::info!(
        "Dropping {table_type} '{}' for session {}",
        body.table_name,
        body.session_id
    );

    let safe_name = format!("\"{}\"", body.table_name.replace('"', "\"\""));
    let statements: Vec<String> = match table_type.as_str() {
        "VIEW" => vec![format!("DROP VIEW IF EXISTS {safe_name}")],
        "TABLE" | "BASE TABLE" => vec![format!("DROP TABLE IF EXISTS {safe_name}")],
        // Ambiguous type: drop whichever binding exists.
        _ => vec![
            format!("DROP VIEW IF EXISTS {safe_name}"),
            format!("DROP TABLE IF EXISTS {safe_name}"),
        ],
    };
    for statement in statements {
        session
            .context
            .collect(&statement)
            .await
            .map_err(|e| Status::internal(format!("Failed to drop table: {e}")))?;
    }

    Ok(serde_json::to_vec(&serde_json::json!({"success": true})).unwrap_or_default())
}

fn refresh_all(service: &Service, body: &[u8]) -> Result<Vec<u8>, Status> {
    let body: SessionBody = parse_body(body)?;
    let _ = service.runtime.sessions.get_or_create(&body.session_id);
    Ok(serde_json::to_vec(&serde_json::json!({"success": true})).unwrap_or_default())
}

async fn list_connections(service: &Service) -> Result<Vec<u8>, Status> {
    let registry = Arc::clone(&service.runtime.registry);
    let records = tokio::task::spawn_blocking(move || registry.list())
        .await
        .map_err(|e| Status::internal(e.to_string()))?
        .map_err(registry_error_to_status)?;
    Ok(serde_json::to_vec(&records).unwrap_or_default())
}

async fn save_connection(service: &Service, body: &[u8]) -> Result<Vec<u8>, Status> {
    let body: SaveConnectionBody = parse_body(body)?;
    let registry = Arc::clone(&service.runtime.registry);
    let id = tokio::task::spawn_blocking(move || {
        registry.save(&body.name, &body.connection_type, &body.connection_string)
    })
    .await
    .map_err(|e| Status::internal(e.to_string()))?
    .map_err(registry_error_to_status)?;

    Ok(serde_json::to_vec(&serde_json::json!({"success": true, "id": id})).unwrap_or_default())
}

async fn delete_connection(service: &Service, body: &[u8]) -> Result<Vec<u8>, Status> {
    let body: DeleteConnectionBody = parse_body(body)?;
    let id = match body.id {
        serde_json::Value::String(id) => id,
        other => other.to_string(),
    };

    let registry = Arc::clone(&service.runtime.registry);
    tokio::task::spawn_blocking(move || registry.delete(&id))
        .await
        .map_err(|e| Status::internal(e.to_string()))?
        .map_err(registry_error_to_status)?;

    Ok(serde_json::to_vec(&serde_json::json!({"success": true})).unwrap_or_default())
}

/// Generates `Session_HHMMSS_<3 uppercase letters>`, retrying on collision,
/// and eagerly instantiates the context.
fn create_session(service: &Service) -> Result<Vec<u8>, Status> {
    let session = create_unique_session(service);
    let response = serde_json::json!({"success": true, "session_id": session.id});
    Ok(serde_json::to_vec(&response).unwrap_or_default())
}

fn create_unique_session(service: &Service) -> Arc<Session> {
    loop {
        let now = chrono::Local::now().format("%H%M%S");
        let mut rng = rand::thread_rng();
        let suffix: String = (0..3)
            .map(|_| char::from(rng.gen_range(b'A'..=b'Z')))
            .collect();
        let session_id = format!("Session_{now}_{suffix}");

        if !service.runtime.sessions.exists(&session_id) {
            return service.runtime.sessions.get_or_create(&session_id);
        }
    }
}

fn registry_error_to_status(error: registry::Error) -> Status {
    match &error {
        registry::Error::DuplicateConnection { .. } => Status::already_exists(error.to_string()),
        registry::Error::ProtectedConnection => Status::permission_denied(error.to_string()),
        registry::Error::ConnectionNotFound { .. } => Status::not_found(error.to_string()),
        _ => Status::internal(error.to_string()),
    }
}
