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

//! `{% reader 'table', 'connection'[, use_parquet] %} sql {% endreader %}`
//!
//! Executes the inner SQL on an external source and registers the result as a
//! named table in the session's analytical context. Failures degrade to
//! `-- Error ...` comments so the surrounding SQL still renders and the
//! missing table surfaces as an ordinary catalog miss.

use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use minijinja::value::{Kwargs, Value};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use snafu::prelude::*;
use template_engine::BlockTag;
use tokio::runtime::Handle;

use crate::request::RequestContext;

/// Rows fetched from the source per batch.
pub const READER_BATCH_SIZE: usize = 10_000;

const PARQUET_PAGE_SIZE: usize = 1024 * 1024;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("{source}"))]
    Source { source: sql_sources::Error },

    #[snafu(display("{source}"))]
    Convert { source: arrow_convert::Error },

    #[snafu(display("{source}"))]
    Register { source: crate::analytical::Error },

    #[snafu(display("Unable to write parquet cache: {source}"))]
    ParquetWrite { source: parquet::errors::ParquetError },

    #[snafu(display("Unable to create parquet cache file: {source}"))]
    ParquetFile { source: std::io::Error },
}

pub struct ReaderTag {
    ctx: Arc<RequestContext>,
    handle: Handle,
}

impl ReaderTag {
    #[must_use]
    pub fn new(ctx: Arc<RequestContext>, handle: Handle) -> Self {
        ReaderTag { ctx, handle }
    }
}

impl BlockTag for ReaderTag {
    fn name(&self) -> &'static str {
        "reader"
    }

    fn call(
        &self,
        args: &[Value],
        _kwargs: &Kwargs,
        body: &str,
    ) -> Result<String, minijinja::Error> {
        if args.len() < 2 {
            return Ok("-- Error: Reader tag requires table_name and connection_string".to_string());
        }
        let table_name = args[0].to_string();
        let conn_ref = args[1].to_string();
        let use_parquet = args.get(2).is_some_and(Value::is_true);

        let inner_sql = body.trim();
        if inner_sql.is_empty() {
            return Ok("-- Error: Reader block is empty".to_string());
        }

        // Any reader run mutates the session namespace, so the optimized
        // ticket path is off the table for this command.
        self.ctx.mark_side_effects();

        let connection_string = self.ctx.resolve_connection(&conn_ref);
        let outcome = self.handle.block_on(materialize(
            &self.ctx,
            &table_name,
            &connection_string,
            inner_sql,
            use_parquet,
        ));

        match outcome {
            Ok(emitted) => Ok(emitted),
            Err(e) => {
                tracing::error!("Error in reader tag: {e}");
                Ok(format!("-- Error in reader tag: {e}\n"))
            }
        }
    }
}

async fn materialize(
    ctx: &RequestContext,
    table_name: &str,
    connection_string: &str,
    inner_sql: &str,
    use_parquet: bool,
) -> Result<String> {
    let mut cursor = sql_sources::open(connection_string, inner_sql, READER_BATCH_SIZE)
        .await
        .context(SourceSnafu)?;
    let columns = cursor.normalized_columns();

    if use_parquet && !ctx.schema_inference {
        return write_parquet(ctx, table_name, &columns, &mut cursor).await;
    }

    let mut schema: Option<SchemaRef> = None;
    let mut batches = Vec::new();
    while let Some(rows) = cursor.next_batch().await.context(SourceSnafu)? {
        let batch = match &schema {
            None => {
                let batch = arrow_convert::rows_to_batch(&columns, &rows).context(ConvertSnafu)?;
                schema = Some(batch.schema());
                batch
            }
            Some(schema) => {
                arrow_convert::rows_to_batch_with_schema(schema, &rows).context(ConvertSnafu)?
            }
        };
        batches.push(batch);

        if ctx.schema_inference {
            // Schema inference only needs the first batch.
            break;
        }
    }

    if batches.is_empty() {
        batches.push(arrow_convert::empty_string_batch(&columns));
    }
    let schema = batches[0].schema();
    let batch_count = batches.len();
    ctx.session
        .context
        .register_batches(table_name, schema, batches)
        .context(RegisterSnafu)?;

    if ctx.schema_inference {
        tracing::info!(
            "[{}] Schema-only registration for '{table_name}' (1 batch)",
            ctx.session_id
        );
    } else {
        tracing::info!(
            "[{}] Dynamically registered table '{table_name}' in-memory with {batch_count} batches",
            ctx.session_id
        );
    }
    Ok(String::new())
}

/// Streams the cursor into a session-owned temporary Parquet file and
/// registers a view over it. A source with zero rows still produces a cache
/// file (with the all-string stub schema) and the same registered view.
async fn write_parquet(
    ctx: &RequestContext,
    table_name: &str,
    columns: &[String],
    cursor: &mut sql_sources::SqlCursor,
) -> Result<String> {
    let mut writer: Option<ArrowWriter<std::fs::File>> = None;
    let mut schema: Option<SchemaRef> = None;
    let mut temp_file = None;

    while let Some(rows) = cursor.next_batch().await.context(SourceSnafu)? {
        let batch = match &schema {
            None => {
                let batch = arrow_convert::rows_to_batch(columns, &rows).context(ConvertSnafu)?;
                schema = Some(batch.schema());
                batch
            }
            Some(schema) => {
                arrow_convert::rows_to_batch_with_schema(schema, &rows).context(ConvertSnafu)?
            }
        };

        if writer.is_none() {
            let (new_writer, file) = new_cache_writer(table_name, batch.schema())?;
            writer = Some(new_writer);
            temp_file = Some(file);
        }
        if let Some(w) = writer.as_mut() {
            w.write(&batch).context(ParquetWriteSnafu)?;
        }
    }

    let (writer, temp_file) = match (writer, temp_file) {
        (Some(writer), Some(temp_file)) => (writer, temp_file),
        _ => {
            // Zero rows: write the empty stub so the cache file, the view and
            // the emitted comment match the populated path.
            let stub = arrow_convert::empty_string_batch(columns);
            let (mut writer, file) = new_cache_writer(table_name, stub.schema())?;
            writer.write(&stub).context(ParquetWriteSnafu)?;
            (writer, file)
        }
    };
    writer.close().context(ParquetWriteSnafu)?;

    let temp_path = temp_file.into_temp_path();
    let path_display = temp_path.to_string_lossy().into_owned();
    ctx.session
        .context
        .register_parquet_view(table_name, &path_display)
        .await
        .context(RegisterSnafu)?;
    ctx.session.track_parquet_file(temp_path);

    let message = format!(
        "[{}] Cached '{table_name}' to disk: {path_display}",
        ctx.session_id
    );
    tracing::info!("{message}");
    Ok(format!("-- {message}"))
}

fn new_cache_writer(
    table_name: &str,
    schema: SchemaRef,
) -> Result<(ArrowWriter<std::fs::File>, tempfile::NamedTempFile)> {
    let file = tempfile::Builder::new()
        .prefix(&format!("{table_name}_"))
        .suffix(".parquet")
        .tempfile()
        .context(ParquetFileSnafu)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_dictionary_enabled(true)
        .set_data_page_size_limit(PARQUET_PAGE_SIZE)
        .build();
    let handle = file.as_file().try_clone().context(ParquetFileSnafu)?;
    let writer =
        ArrowWriter::try_new(handle, schema, Some(props)).context(ParquetWriteSnafu)?;
    Ok((writer, file))
}
