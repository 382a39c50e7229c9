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

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

pub const DEFAULT_SESSION_ID: &str = "default";

/// Connection id that keeps execution on the embedded engine.
pub const DEFAULT_CONNECTION_ID: &str = "default";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid query command payload: {source}"))]
    InvalidCommandPayload { source: serde_json::Error },

    #[snafu(display("Query command payload is not valid UTF-8"))]
    CommandPayloadNotUtf8,
}

/// The client request envelope carried in Flight descriptors and tickets.
///
/// Either `template` or `query` is non-empty. Tickets re-serialized by the
/// server set `already_rendered` so `do_get` can skip a second render when the
/// first one had no side effects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryCommand {
    #[serde(default)]
    pub template: String,

    #[serde(default)]
    pub query: String,

    #[serde(default)]
    pub criteria: serde_json::Map<String, serde_json::Value>,

    #[serde(default, alias = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, alias = "connectionId", skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,

    #[serde(default, alias = "alreadyRendered")]
    pub already_rendered: bool,
}

impl QueryCommand {
    /// Strict parse for `get_flight_info` descriptors: the payload must be a
    /// JSON `QueryCommand` object.
    ///
    /// # Errors
    ///
    /// Fails on non-UTF-8 or non-JSON payloads.
    pub fn from_descriptor_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes).map_err(|_| Error::CommandPayloadNotUtf8)?;
        serde_json::from_str(text).context(InvalidCommandPayloadSnafu)
    }

    /// Lenient parse for `do_get` tickets: accepts the JSON command object
    /// (snake_case or camelCase keys), a JSON string, or bare SQL text.
    #[must_use]
    pub fn from_ticket_bytes(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(serde_json::Value::Object(_)) => serde_json::from_str(&text).unwrap_or_else(|_| {
                QueryCommand {
                    query: text.into_owned(),
                    ..QueryCommand::default()
                }
            }),
            Ok(serde_json::Value::String(sql)) => QueryCommand {
                query: sql,
                ..QueryCommand::default()
            },
            _ => QueryCommand {
                query: text.into_owned(),
                ..QueryCommand::default()
            },
        }
    }

    #[must_use]
    pub fn session(&self) -> &str {
        self.session_id.as_deref().unwrap_or(DEFAULT_SESSION_ID)
    }

    /// Whether execution should bypass the embedded engine and run on the
    /// named external connection.
    #[must_use]
    pub fn targets_external_connection(&self) -> bool {
        self.connection_id
            .as_deref()
            .is_some_and(|id| !id.is_empty() && id != DEFAULT_CONNECTION_ID)
    }

    /// The optimized ticket built by `get_flight_info` when rendering produced
    /// no side effects: the rendered SQL replaces the template so `do_get`
    /// does not render twice.
    #[must_use]
    pub fn into_rendered(self, sql: String) -> Self {
        QueryCommand {
            template: String::new(),
            query: sql,
            criteria: serde_json::Map::new(),
            session_id: Some(self.session().to_string()),
            connection_id: self.connection_id,
            already_rendered: true,
        }
    }

    #[must_use]
    pub fn to_ticket_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_case_aliases() {
        let cmd = QueryCommand::from_ticket_bytes(
            br#"{"query": "SELECT 1", "sessionId": "s9", "connectionId": "5"}"#,
        );
        assert_eq!(cmd.session(), "s9");
        assert_eq!(cmd.connection_id.as_deref(), Some("5"));
        assert!(cmd.targets_external_connection());
    }

    #[test]
    fn bare_sql_tickets_fall_back_to_query() {
        let cmd = QueryCommand::from_ticket_bytes(b"SELECT * FROM t");
        assert_eq!(cmd.query, "SELECT * FROM t");
        assert_eq!(cmd.session(), DEFAULT_SESSION_ID);
        assert!(!cmd.targets_external_connection());
    }

    #[test]
    fn json_string_tickets_are_sql() {
        let cmd = QueryCommand::from_ticket_bytes(br#""SELECT 2""#);
        assert_eq!(cmd.query, "SELECT 2");
    }

    #[test]
    fn default_connection_is_not_external() {
        let cmd = QueryCommand::from_ticket_bytes(br#"{"query": "SELECT 1", "connection_id": "default"}"#);
        assert!(!cmd.targets_external_connection());
    }

    #[test]
    fn rendered_ticket_round_trips() {
        let cmd = QueryCommand {
            template: "a.yaml".to_string(),
            session_id: Some("s1".to_string()),
            ..QueryCommand::default()
        };
        let optimized = cmd.into_rendered("SELECT 1".to_string());
        let parsed = QueryCommand::from_ticket_bytes(&optimized.to_ticket_bytes());
        assert!(parsed.already_rendered);
        assert_eq!(parsed.query, "SELECT 1");
        assert_eq!(parsed.session(), "s1");
        assert!(parsed.template.is_empty());
    }
}
