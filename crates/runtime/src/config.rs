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

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::session::DEFAULT_MAX_SESSIONS;

#[derive(Debug, Clone, Parser)]
pub struct Config {
    /// Address the Flight (gRPC) server binds to.
    #[arg(
        long = "flight",
        value_name = "BIND_ADDRESS",
        default_value = "0.0.0.0:8815",
        help_heading = "Flight"
    )]
    pub flight_bind_address: SocketAddr,

    /// Location advertised in flight endpoints; derived from the bind address
    /// when unset.
    #[arg(long, value_name = "URI", help_heading = "Flight")]
    pub advertised_location: Option<String>,

    /// Directories scanned for *.yaml query templates, in priority order.
    #[arg(
        long = "templates",
        value_name = "DIR",
        value_delimiter = ',',
        default_value = "templates",
        help_heading = "Templates"
    )]
    pub template_dirs: Vec<PathBuf>,

    /// SQLite file holding the connection registry.
    #[arg(
        long = "metadata-db",
        value_name = "PATH",
        default_value = "data.db",
        help_heading = "Storage"
    )]
    pub metadata_db_path: PathBuf,

    /// Directory where python-block binary artifacts are published.
    #[arg(
        long = "downloads-dir",
        value_name = "DIR",
        default_value = "temp_downloads",
        help_heading = "Storage"
    )]
    pub downloads_dir: PathBuf,

    /// Web path prefix emitted in download markers.
    #[arg(
        long = "download-prefix",
        value_name = "PREFIX",
        default_value = "/temp_downloads",
        help_heading = "Storage"
    )]
    pub public_download_prefix: String,

    /// Cap on live sessions; the oldest session is evicted beyond this.
    #[arg(
        long = "max-sessions",
        value_name = "COUNT",
        default_value_t = DEFAULT_MAX_SESSIONS,
        help_heading = "Sessions"
    )]
    pub max_sessions: usize,

    /// Seed external connections, repeatable: --connection name=uri
    #[arg(
        long = "connection",
        value_name = "NAME=URI",
        help_heading = "Connections"
    )]
    pub seed_connections: Vec<String>,
}

impl Config {
    #[must_use]
    pub fn location(&self) -> String {
        self.advertised_location
            .clone()
            .unwrap_or_else(|| format!("grpc://{}", self.flight_bind_address))
    }

    /// `--connection name=uri` pairs as a map; malformed entries are skipped
    /// with a warning.
    #[must_use]
    pub fn seed_connection_map(&self) -> HashMap<String, String> {
        let mut seeds = HashMap::new();
        for entry in &self.seed_connections {
            match entry.split_once('=') {
                Some((name, uri)) if !name.is_empty() && !uri.is_empty() => {
                    seeds.insert(name.to_string(), uri.to_string());
                }
                _ => {
                    tracing::warn!("Ignoring malformed --connection entry: {entry}");
                }
            }
        }
        seeds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_wire_contract() {
        let config = Config::parse_from(["sqlgated"]);
        assert_eq!(config.location(), "grpc://0.0.0.0:8815");
        assert_eq!(config.metadata_db_path, PathBuf::from("data.db"));
        assert_eq!(config.max_sessions, DEFAULT_MAX_SESSIONS);
    }

    #[test]
    fn seed_connections_parse_as_pairs() {
        let config = Config::parse_from([
            "sqlgated",
            "--connection",
            "warehouse=mssql://u:p@h/db",
            "--connection",
            "broken",
        ]);
        let seeds = config.seed_connection_map();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds.get("warehouse").map(String::as_str), Some("mssql://u:p@h/db"));
    }
}
