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

use arrow_convert::Cell;
use rusqlite::types::ValueRef;
use tokio::sync::{mpsc, oneshot};

use crate::cursor::{await_columns, RowBatch, CHANNEL_DEPTH};
use crate::{clean_driver_message, Error, Result, SqlCursor};

/// Opens a local SQLite file and executes `sql` on a dedicated thread;
/// `rusqlite` connections are not `Send`, so the whole statement lifecycle
/// stays on that thread and row batches cross over a channel.
pub(crate) async fn open(path: &str, sql: &str, batch_size: usize) -> Result<SqlCursor> {
    let (meta_tx, meta_rx) = oneshot::channel();
    let (row_tx, row_rx) = mpsc::channel(CHANNEL_DEPTH);

    let path = path.to_string();
    let sql = sql.to_string();
    std::thread::Builder::new()
        .name("sqlite-cursor".to_string())
        .spawn(move || run_statement(&path, &sql, batch_size, meta_tx, &row_tx))
        .map_err(|e| Error::UnableToConnect {
            message: e.to_string(),
        })?;

    await_columns(meta_rx, row_rx).await
}

fn run_statement(
    path: &str,
    sql: &str,
    batch_size: usize,
    meta_tx: oneshot::Sender<Result<Vec<String>>>,
    row_tx: &mpsc::Sender<Result<RowBatch>>,
) {
    let conn = match rusqlite::Connection::open(path) {
        Ok(conn) => conn,
        Err(e) => {
            let _ = meta_tx.send(Err(Error::UnableToConnect {
                message: clean_driver_message(&e.to_string()),
            }));
            return;
        }
    };

    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(e) => {
            let _ = meta_tx.send(Err(Error::QueryFailed {
                message: clean_driver_message(&e.to_string()),
            }));
            return;
        }
    };

    let columns: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();
    let column_count = columns.len();
    if meta_tx.send(Ok(columns)).is_err() {
        return;
    }

    let mut rows = match stmt.query([]) {
        Ok(rows) => rows,
        Err(e) => {
            let _ = row_tx.blocking_send(Err(Error::QueryFailed {
                message: clean_driver_message(&e.to_string()),
            }));
            return;
        }
    };

    let mut batch: RowBatch = Vec::with_capacity(batch_size);
    loop {
        match rows.next() {
            Ok(Some(row)) => {
                let mut cells = Vec::with_capacity(column_count);
                for idx in 0..column_count {
                    cells.push(match row.get_ref(idx) {
                        Ok(value) => value_to_cell(value),
                        Err(_) => Cell::Null,
                    });
                }
                batch.push(cells);
                if batch.len() >= batch_size {
                    if row_tx
                        .blocking_send(Ok(std::mem::take(&mut batch)))
                        .is_err()
                    {
                        // Receiver dropped: the request was cancelled.
                        return;
                    }
                    batch.reserve(batch_size);
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = row_tx.blocking_send(Err(Error::QueryFailed {
                    message: clean_driver_message(&e.to_string()),
                }));
                return;
            }
        }
    }

    if !batch.is_empty() {
        let _ = row_tx.blocking_send(Ok(batch));
    }
}

fn value_to_cell(value: ValueRef<'_>) -> Cell {
    match value {
        ValueRef::Null => Cell::Null,
        ValueRef::Integer(i) => Cell::Int(i),
        ValueRef::Real(f) => Cell::Float(f),
        ValueRef::Text(bytes) => Cell::Str(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Cell::Bytes(bytes.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_db() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        let conn = rusqlite::Connection::open(file.path()).expect("open");
        conn.execute_batch(
            "CREATE TABLE ACCOUNTS (ID INTEGER PRIMARY KEY, NAME TEXT, BALANCE REAL);
             INSERT INTO ACCOUNTS VALUES (1, 'alice', 10.5), (2, 'bob', NULL), (3, 'carol', 7.0);",
        )
        .expect("seed");
        file
    }

    #[tokio::test]
    async fn streams_rows_in_batches() {
        let db = seeded_db();
        let path = db.path().to_string_lossy().to_string();
        let mut cursor = open(&path, "SELECT ID, NAME, BALANCE FROM ACCOUNTS ORDER BY ID", 2)
            .await
            .expect("cursor");
        assert_eq!(cursor.columns(), ["ID", "NAME", "BALANCE"]);
        assert_eq!(
            cursor.normalized_columns(),
            vec!["id".to_string(), "name".to_string(), "balance".to_string()]
        );

        let first = cursor.next_batch().await.expect("batch").expect("rows");
        assert_eq!(first.len(), 2);
        assert_eq!(first[0][0], Cell::Int(1));
        assert_eq!(first[0][1], Cell::Str("alice".into()));
        assert_eq!(first[1][2], Cell::Null);

        let second = cursor.next_batch().await.expect("batch").expect("rows");
        assert_eq!(second.len(), 1);
        assert!(cursor.next_batch().await.expect("batch").is_none());
    }

    #[tokio::test]
    async fn bad_sql_surfaces_as_query_error() {
        let db = seeded_db();
        let path = db.path().to_string_lossy().to_string();
        let err = open(&path, "SELECT * FROM missing_table", 10)
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::QueryFailed { .. }));
    }

    #[tokio::test]
    async fn zero_rows_still_reports_columns() {
        let db = seeded_db();
        let path = db.path().to_string_lossy().to_string();
        let mut cursor = open(&path, "SELECT ID FROM ACCOUNTS WHERE ID > 100", 10)
            .await
            .expect("cursor");
        assert_eq!(cursor.columns(), ["ID"]);
        assert!(cursor.next_batch().await.expect("batch").is_none());
    }
}
