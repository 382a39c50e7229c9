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

//! Named external connections persisted in the metadata SQLite file.
//!
//! The table is the source of truth; an in-memory snapshot (`connections` by
//! stringified id, `connection_map` by name) is refreshed after every
//! mutation. All access goes through short-lived connections, serialized by
//! SQLite's file lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Serialize;
use snafu::prelude::*;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unable to open metadata database {path:?}: {source}"))]
    UnableToOpenMetadataDb {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[snafu(display("Metadata query failed: {source}"))]
    MetadataQuery { source: rusqlite::Error },

    #[snafu(display("Connection with name '{name}' already exists."))]
    DuplicateConnection { name: String },

    #[snafu(display("Connection ID {id} not found."))]
    ConnectionNotFound { id: String },

    #[snafu(display("Cannot delete system connections."))]
    ProtectedConnection,
}

/// One row of `_meta_connections`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub connection_type: String,
    pub connection_string: String,
}

pub struct ConnectionRegistry {
    db_path: PathBuf,
    /// Stringified row id → connection string.
    connections: RwLock<HashMap<String, String>>,
    /// Connection name → connection string.
    connection_map: RwLock<HashMap<String, String>>,
}

impl ConnectionRegistry {
    /// Opens (creating if needed) the metadata database, upserts the seed
    /// connections with type `system`, and loads the in-memory snapshot.
    ///
    /// # Errors
    ///
    /// Fails when the database file cannot be opened or initialized.
    pub fn open(db_path: &Path, seeds: &HashMap<String, String>) -> Result<Self> {
        let registry = ConnectionRegistry {
            db_path: db_path.to_path_buf(),
            connections: RwLock::new(HashMap::new()),
            connection_map: RwLock::new(HashMap::new()),
        };

        let conn = registry.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _meta_connections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL,
                type TEXT NOT NULL,
                connection_string TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .context(MetadataQuerySnafu)?;

        for (name, connection_string) in seeds {
            conn.execute(
                "INSERT OR IGNORE INTO _meta_connections (name, type, connection_string)
                 VALUES (?1, ?2, ?3)",
                (name, "system", connection_string),
            )
            .context(MetadataQuerySnafu)?;
        }
        drop(conn);

        registry.refresh()?;
        Ok(registry)
    }

    fn connect(&self) -> Result<rusqlite::Connection> {
        rusqlite::Connection::open(&self.db_path).context(UnableToOpenMetadataDbSnafu {
            path: self.db_path.clone(),
        })
    }

    /// Reloads the in-memory snapshot from the table.
    ///
    /// # Errors
    ///
    /// Fails when the table cannot be read.
    pub fn refresh(&self) -> Result<()> {
        let records = self.list()?;
        let mut by_id = HashMap::with_capacity(records.len());
        let mut by_name = HashMap::with_capacity(records.len());
        for record in records {
            by_id.insert(record.id.clone(), record.connection_string.clone());
            by_name.insert(record.name, record.connection_string);
        }
        if let Ok(mut connections) = self.connections.write() {
            *connections = by_id;
        }
        if let Ok(mut connection_map) = self.connection_map.write() {
            *connection_map = by_name;
        }
        Ok(())
    }

    /// All registry rows.
    ///
    /// # Errors
    ///
    /// Fails when the table cannot be read.
    pub fn list(&self) -> Result<Vec<ConnectionRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT id, name, type, connection_string FROM _meta_connections")
            .context(MetadataQuerySnafu)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ConnectionRecord {
                    id: row.get::<_, i64>(0)?.to_string(),
                    name: row.get(1)?,
                    connection_type: row.get(2)?,
                    connection_string: row.get(3)?,
                })
            })
            .context(MetadataQuerySnafu)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context(MetadataQuerySnafu)
    }

    /// Inserts a connection and returns its new stringified id.
    ///
    /// # Errors
    ///
    /// `DuplicateConnection` when the name is taken; otherwise metadata
    /// errors.
    pub fn save(&self, name: &str, connection_type: &str, connection_string: &str) -> Result<String> {
        let conn = self.connect()?;
        let result = conn.execute(
            "INSERT INTO _meta_connections (name, type, connection_string) VALUES (?1, ?2, ?3)",
            (name, connection_type, connection_string),
        );
        match result {
            Ok(_) => {
                let id = conn.last_insert_rowid().to_string();
                drop(conn);
                self.refresh()?;
                Ok(id)
            }
            Err(e) if is_unique_violation(&e) => DuplicateConnectionSnafu {
                name: name.to_string(),
            }
            .fail(),
            Err(e) => Err(Error::MetadataQuery { source: e }),
        }
    }

    /// Deletes a connection by id. Ids prefixed `sys_` are immutable.
    ///
    /// # Errors
    ///
    /// `ProtectedConnection` for `sys_` ids, `ConnectionNotFound` for unknown
    /// ids.
    pub fn delete(&self, id: &str) -> Result<()> {
        ensure!(!id.starts_with("sys_"), ProtectedConnectionSnafu);

        let conn = self.connect()?;
        let deleted = conn
            .execute("DELETE FROM _meta_connections WHERE id = ?1", [id])
            .context(MetadataQuerySnafu)?;
        drop(conn);
        ensure!(deleted > 0, ConnectionNotFoundSnafu { id: id.to_string() });
        self.refresh()?;
        Ok(())
    }

    /// Connection string for a stringified row id, from the snapshot.
    #[must_use]
    pub fn connection_by_id(&self, id: &str) -> Option<String> {
        self.connections
            .read()
            .ok()
            .and_then(|map| map.get(id).cloned())
    }

    /// Case-insensitive name lookup straight from the table, used as the
    /// fallback when the session's map snapshot misses.
    #[must_use]
    pub fn connection_by_name_nocase(&self, name: &str) -> Option<String> {
        let conn = self.connect().ok()?;
        conn.query_row(
            "SELECT connection_string FROM _meta_connections WHERE name = ?1 COLLATE NOCASE",
            [name],
            |row| row.get::<_, String>(0),
        )
        .ok()
    }

    /// Snapshot of name → connection string for one request.
    #[must_use]
    pub fn connection_map_snapshot(&self) -> HashMap<String, String> {
        self.connection_map
            .read()
            .map(|map| map.clone())
            .unwrap_or_default()
    }
}

fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_registry(seeds: &HashMap<String, String>) -> (tempfile::TempDir, ConnectionRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ConnectionRegistry::open(&dir.path().join("data.db"), seeds).expect("open");
        (dir, registry)
    }

    #[test]
    fn seeds_are_upserted_as_system() {
        let seeds = HashMap::from([("warehouse".to_string(), "sqlite://w.db".to_string())]);
        let (_dir, registry) = temp_registry(&seeds);

        let records = registry.list().expect("list");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].connection_type, "system");
        assert_eq!(
            registry.connection_map_snapshot().get("warehouse"),
            Some(&"sqlite://w.db".to_string())
        );

        // Re-opening with the same seed does not duplicate.
        let registry2 =
            ConnectionRegistry::open(&registry.db_path, &seeds).expect("reopen");
        assert_eq!(registry2.list().expect("list").len(), 1);
    }

    #[test]
    fn save_rejects_duplicates() {
        let (_dir, registry) = temp_registry(&HashMap::new());
        let id = registry.save("prod", "mssql", "mssql://u:p@h/db").expect("save");
        assert_eq!(registry.connection_by_id(&id).as_deref(), Some("mssql://u:p@h/db"));

        let err = registry.save("prod", "mssql", "mssql://other").expect_err("dup");
        assert!(matches!(err, Error::DuplicateConnection { .. }));
    }

    #[test]
    fn delete_protects_system_prefix_and_updates_maps() {
        let (_dir, registry) = temp_registry(&HashMap::new());
        let id = registry.save("tmp", "sqlite", "sqlite://t.db").expect("save");

        let err = registry.delete("sys_1").expect_err("protected");
        assert!(matches!(err, Error::ProtectedConnection));

        registry.delete(&id).expect("delete");
        assert!(registry.connection_by_id(&id).is_none());
        assert!(registry.connection_map_snapshot().get("tmp").is_none());

        let err = registry.delete("9999").expect_err("missing");
        assert!(matches!(err, Error::ConnectionNotFound { .. }));
    }

    #[test]
    fn nocase_lookup_hits_the_table() {
        let (_dir, registry) = temp_registry(&HashMap::new());
        registry.save("Warehouse", "sqlite", "sqlite://w.db").expect("save");
        assert_eq!(
            registry.connection_by_name_nocase("WAREHOUSE").as_deref(),
            Some("sqlite://w.db")
        );
    }
}
