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

use arrow::array::RecordBatch;
use arrow::datatypes::{Schema, SchemaRef};
use datafusion::datasource::MemTable;
use datafusion::error::DataFusionError;
use datafusion::execution::context::{SessionConfig, SessionContext};
use datafusion::execution::SendableRecordBatchStream;
use datafusion::prelude::ParquetReadOptions;
use snafu::prelude::*;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unable to register table '{table_name}': {source}"))]
    UnableToRegisterTable {
        table_name: String,
        source: DataFusionError,
    },

    #[snafu(display("Unable to drop table '{table_name}': {source}"))]
    UnableToDropTable {
        table_name: String,
        source: DataFusionError,
    },
}

/// A session-private namespace in the embedded engine.
///
/// Tables registered here are invisible to every other session; the context
/// dies with its session. Names are normalized to lowercase on registration,
/// which is the form unquoted SQL identifiers resolve to.
pub struct AnalyticalContext {
    ctx: SessionContext,
}

impl Default for AnalyticalContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalyticalContext {
    #[must_use]
    pub fn new() -> Self {
        let config = SessionConfig::new().with_information_schema(true);
        AnalyticalContext {
            ctx: SessionContext::new_with_config(config),
        }
    }

    /// Registers an in-memory Arrow table, replacing any existing binding of
    /// the same name.
    ///
    /// # Errors
    ///
    /// Fails when the engine rejects the batches (e.g. schema mismatch).
    pub fn register_batches(
        &self,
        table_name: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<()> {
        let normalized = table_name.to_lowercase();
        self.drop_binding(&normalized)?;
        let table =
            MemTable::try_new(schema, vec![batches]).context(UnableToRegisterTableSnafu {
                table_name: normalized.clone(),
            })?;
        self.ctx
            .register_table(normalized.as_str(), Arc::new(table))
            .map(|_| ())
            .context(UnableToRegisterTableSnafu {
                table_name: normalized,
            })
    }

    /// Registers a view over a Parquet file, replacing any existing binding.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened as Parquet.
    pub async fn register_parquet_view(&self, table_name: &str, path: &str) -> Result<()> {
        let normalized = table_name.to_lowercase();
        self.drop_binding(&normalized)?;
        self.ctx
            .register_parquet(normalized.as_str(), path, ParquetReadOptions::default())
            .await
            .context(UnableToRegisterTableSnafu {
                table_name: normalized,
            })
    }

    /// Removes a table or view binding if present.
    ///
    /// # Errors
    ///
    /// Fails only on catalog-level errors, not on a missing binding.
    pub fn drop_binding(&self, table_name: &str) -> Result<()> {
        let normalized = table_name.to_lowercase();
        self.ctx
            .deregister_table(normalized.as_str())
            .map(|_| ())
            .context(UnableToDropTableSnafu {
                table_name: normalized,
            })
    }

    /// Streams the results of `sql`.
    ///
    /// # Errors
    ///
    /// Surfaces the engine's planning or execution error.
    pub async fn query_stream(
        &self,
        sql: &str,
    ) -> Result<SendableRecordBatchStream, DataFusionError> {
        let df = self.ctx.sql(sql).await?;
        df.execute_stream().await
    }

    /// Executes `sql` and collects all batches, for small internal queries and
    /// log-mode previews.
    ///
    /// # Errors
    ///
    /// Surfaces the engine's planning or execution error.
    pub async fn collect(&self, sql: &str) -> Result<Vec<RecordBatch>, DataFusionError> {
        let df = self.ctx.sql(sql).await?;
        df.collect().await
    }

    /// The result schema of `sql` from the logical plan alone: the cheap
    /// equivalent of probing with `LIMIT 0`.
    ///
    /// # Errors
    ///
    /// Surfaces the engine's planning error.
    pub async fn schema_of(&self, sql: &str) -> Result<Schema, DataFusionError> {
        let state = self.ctx.state();
        let plan = state.create_logical_plan(sql).await?;
        Ok(plan.schema().as_arrow().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field};

    fn sample_batch() -> (SchemaRef, RecordBatch) {
        let schema: SchemaRef = Arc::new(Schema::new(vec![Field::new(
            "id",
            DataType::Int64,
            true,
        )]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![Arc::new(Int64Array::from(vec![1_i64, 2, 3]))],
        )
        .expect("batch");
        (schema, batch)
    }

    #[tokio::test]
    async fn registers_and_queries_batches() {
        let ctx = AnalyticalContext::new();
        let (schema, batch) = sample_batch();
        ctx.register_batches("Ext", schema, vec![batch]).expect("register");

        let batches = ctx.collect("SELECT COUNT(*) AS c FROM ext").await.expect("query");
        assert_eq!(batches[0].num_rows(), 1);
    }

    #[tokio::test]
    async fn reregistration_replaces_the_table() {
        let ctx = AnalyticalContext::new();
        let (schema, batch) = sample_batch();
        ctx.register_batches("t", Arc::clone(&schema), vec![batch.clone()])
            .expect("register");
        ctx.register_batches("t", schema, vec![batch]).expect("register again");

        let batches = ctx.collect("SELECT COUNT(*) AS c FROM t").await.expect("query");
        let col = batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("count column");
        assert_eq!(col.value(0), 3);
    }

    #[tokio::test]
    async fn schema_probe_does_not_execute() {
        let ctx = AnalyticalContext::new();
        let (schema, batch) = sample_batch();
        ctx.register_batches("t", schema, vec![batch]).expect("register");
        let probed = ctx.schema_of("SELECT id FROM t").await.expect("schema");
        assert_eq!(probed.fields().len(), 1);
        assert_eq!(probed.field(0).name(), "id");
    }
}
