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

//! Direct execution on a named external connection, bypassing the embedded
//! engine. The first fetch infers the Arrow schema; subsequent batches are
//! coerced onto it. The source connection closes when the stream is dropped.

use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::{Schema, SchemaRef};
use futures::stream::BoxStream;
use futures::StreamExt;
use snafu::prelude::*;

pub const EXTERNAL_BATCH_SIZE: usize = 1000;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    Source { source: sql_sources::Error },

    #[snafu(display("Unable to build result batch: {source}"))]
    Convert { source: arrow_convert::Error },
}

pub struct ExternalStream {
    pub schema: SchemaRef,
    pub batches: BoxStream<'static, Result<RecordBatch>>,
}

impl std::fmt::Debug for ExternalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalStream")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Executes fully rendered SQL on the external connection and streams the
/// result. Zero-column results (non-query statements) produce an empty stream
/// with an empty schema; zero rows produce an all-string schema from the
/// column names alone.
///
/// # Errors
///
/// Fails when the connection cannot be opened or the statement is rejected.
pub async fn execute(connection_string: &str, sql: &str) -> Result<ExternalStream> {
    let mut cursor = sql_sources::open(connection_string, sql, EXTERNAL_BATCH_SIZE)
        .await
        .context(SourceSnafu)?;
    let columns = cursor.normalized_columns();

    if columns.is_empty() {
        return Ok(ExternalStream {
            schema: Arc::new(Schema::empty()),
            batches: futures::stream::empty().boxed(),
        });
    }

    // The first batch fixes the schema for the rest of the stream.
    let first_rows = cursor.next_batch().await.context(SourceSnafu)?;
    let Some(first_rows) = first_rows else {
        let stub = arrow_convert::empty_string_batch(&columns);
        return Ok(ExternalStream {
            schema: stub.schema(),
            batches: futures::stream::empty().boxed(),
        });
    };

    let first_batch = arrow_convert::rows_to_batch(&columns, &first_rows).context(ConvertSnafu)?;
    let schema = first_batch.schema();

    let stream_schema = Arc::clone(&schema);
    let batches = async_stream::try_stream! {
        yield first_batch;
        while let Some(rows) = cursor.next_batch().await.context(SourceSnafu)? {
            let batch = arrow_convert::rows_to_batch_with_schema(&stream_schema, &rows)
                .context(ConvertSnafu)?;
            yield batch;
        }
        // Dropping the cursor here closes the source connection.
    }
    .boxed();

    Ok(ExternalStream { schema, batches })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn seeded_db() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        let conn = rusqlite::Connection::open(file.path()).expect("open");
        conn.execute_batch(
            "CREATE TABLE T (ID INTEGER, NAME TEXT);
             WITH RECURSIVE seq(value) AS (
                 SELECT 1 UNION ALL SELECT value + 1 FROM seq WHERE value < 2500
             )
             INSERT INTO T SELECT value, 'row' || value FROM seq;",
        )
        .expect("seed");
        file
    }

    #[tokio::test]
    async fn streams_batches_with_lowercased_columns() {
        let db = seeded_db();
        let uri = format!("sqlite://{}", db.path().display());
        let result = execute(&uri, "SELECT ID, NAME FROM T ORDER BY ID").await.expect("stream");

        let names: Vec<&str> = result
            .schema
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .collect();
        assert_eq!(names, vec!["id", "name"]);

        let batches: Vec<RecordBatch> = result.batches.try_collect().await.expect("collect");
        let total: usize = batches.iter().map(RecordBatch::num_rows).sum();
        assert_eq!(total, 2500);
        assert!(batches[0].num_rows() <= EXTERNAL_BATCH_SIZE);
    }

    #[tokio::test]
    async fn empty_result_keeps_string_schema() {
        let db = seeded_db();
        let uri = format!("sqlite://{}", db.path().display());
        let result = execute(&uri, "SELECT ID FROM T WHERE ID < 0").await.expect("stream");
        assert_eq!(result.schema.fields().len(), 1);
        let batches: Vec<RecordBatch> = result.batches.try_collect().await.expect("collect");
        assert!(batches.is_empty());
    }

    #[tokio::test]
    async fn unsupported_scheme_is_invalid_connection() {
        let err = execute("redis://h/0", "SELECT 1").await.expect_err("fail");
        assert!(matches!(
            err,
            Error::Source {
                source: sql_sources::Error::UnsupportedScheme { .. }
            }
        ));
    }
}
