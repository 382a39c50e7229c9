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

use std::sync::Arc;

use arrow::datatypes::Schema;
use arrow_flight::{FlightDescriptor, FlightEndpoint, FlightInfo, Ticket};
use bytes::Bytes;
use tonic::{Request, Response, Status};

use super::util::{internal_error, placeholder_schema};
use super::Service;
use crate::command::QueryCommand;
use crate::pipeline;

pub(crate) async fn handle(
    service: &Service,
    request: Request<FlightDescriptor>,
) -> Result<Response<FlightInfo>, Status> {
    let descriptor = request.into_inner();
    let cmd = QueryCommand::from_descriptor_bytes(&descriptor.cmd)
        .map_err(|e| Status::invalid_argument(e.to_string()))?;

    // Direct external execution: schema discovery is deferred to the external
    // executor, so hand back a placeholder and echo the command as the ticket.
    if cmd.targets_external_connection() {
        let connection_id = cmd.connection_id.clone().unwrap_or_default();
        if service
            .runtime
            .registry
            .connection_by_id(&connection_id)
            .is_some()
        {
            let info = flight_info(&Schema::empty(), descriptor.clone(), descriptor.cmd.clone())?;
            return Ok(Response::new(info));
        }
    }

    let session = service.runtime.sessions.get_or_create(cmd.session());
    let lock = session.execution_lock();
    let _guard = lock.lock().await;

    // Schema-inference render: tags fetch only enough to know their shapes.
    let ctx = service.runtime.request_context(&session, true);
    let rendered = pipeline::render_command(
        Arc::clone(&service.runtime.templates),
        Arc::clone(&ctx),
        cmd.clone(),
    )
    .await
    .map_err(super::render_error_to_status)?;

    // No side effects and non-empty SQL: the ticket carries the rendered SQL
    // so do_get skips the second render. Side effects force a re-render to
    // reproduce them at execution time.
    let ticket_payload: Bytes = if !ctx.has_side_effects() && !rendered.trim().is_empty() {
        cmd.clone().into_rendered(rendered.clone()).to_ticket_bytes().into()
    } else {
        let mut echo = cmd.clone();
        echo.session_id = Some(cmd.session().to_string());
        echo.to_ticket_bytes().into()
    };

    if rendered.trim().is_empty() || pipeline::is_effectively_empty(&rendered) {
        tracing::info!("Empty or comment-only SQL after rendering; returning placeholder schema");
        let info = flight_info(&placeholder_schema("Result"), descriptor, ticket_payload)?;
        return Ok(Response::new(info));
    }

    if pipeline::is_modification_sql(&rendered) {
        tracing::info!(
            "Skipping schema inference for modification query: {:.50}...",
            rendered.trim_start()
        );
        let info = flight_info(&placeholder_schema("result"), descriptor, ticket_payload)?;
        return Ok(Response::new(info));
    }

    match session.context.schema_of(&rendered).await {
        Ok(schema) => {
            let info = flight_info(&schema, descriptor, ticket_payload)?;
            Ok(Response::new(info))
        }
        Err(e) => {
            // Planning may legitimately fail here (e.g. the table appears only
            // after re-rendered side effects); defer the real failure to do_get.
            tracing::info!("Schema inference failed ({e}); returning placeholder schema");
            let info = flight_info(&placeholder_schema("result"), descriptor, ticket_payload)?;
            Ok(Response::new(info))
        }
    }
}

fn flight_info(
    schema: &Schema,
    descriptor: FlightDescriptor,
    ticket: impl Into<Bytes>,
) -> Result<FlightInfo, Status> {
    Ok(FlightInfo::new()
        .try_with_schema(schema)
        .map_err(internal_error)?
        .with_descriptor(descriptor)
        .with_endpoint(FlightEndpoint::new().with_ticket(Ticket {
            ticket: ticket.into(),
        }))
        .with_total_records(-1)
        .with_total_bytes(-1))
}
