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

use arrow::array::{Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::error::DataFusionError;
use tonic::Status;

use crate::request::LogLine;

/// The localized success sentinel emitted for statements with no result grid.
pub const SUCCESS_MESSAGE: &str = "İşlem başarıyla tamamlandı.";

/// Row-count threshold under which log-mode summaries include a textual
/// preview of the result.
pub const LOG_PREVIEW_MAX_ROWS: usize = 50;

/// Wraps encoder and schema-serialization failures, which carry no richer
/// classification, into the generic internal status.
pub fn internal_error(error: impl std::fmt::Display) -> Status {
    Status::internal(error.to_string())
}

#[allow(clippy::needless_pass_by_value)]
pub fn handle_datafusion_error(e: DataFusionError) -> Status {
    match e {
        DataFusionError::Plan(message) | DataFusionError::Execution(message) => {
            Status::invalid_argument(strip_engine_prefixes(&message))
        }
        DataFusionError::SQL(sql_err, _) => Status::invalid_argument(sql_err.to_string()),
        DataFusionError::SchemaError(schema_err, _) => {
            Status::invalid_argument(format!("{schema_err}"))
        }
        other => Status::internal(strip_engine_prefixes(&other.to_string())),
    }
}

/// Strips the engine's noise prefixes and Python-traceback tails from an
/// error message before it reaches the client.
#[must_use]
pub fn strip_engine_prefixes(message: &str) -> String {
    let mut cleaned = message.to_string();
    for prefix in [
        "Binder Error: ",
        "Catalog Error: ",
        "Parser Error: ",
        "Constraint Error: ",
        "Conversion Error: ",
        "Data Error: ",
        "Transaction Error: ",
        "IO Error: ",
        "Connection Error: ",
        "Internal Error: ",
        "Standard Error: ",
        "Sequence Error: ",
        "Error during planning: ",
        "Execution error: ",
        "Schema error: ",
        "External error: ",
        "SQL error: ",
    ] {
        if cleaned.contains(prefix) {
            cleaned = cleaned.replace(prefix, "");
        }
    }
    if let Some(index) = cleaned.find("Detail: Python exception") {
        cleaned.truncate(index);
        cleaned = cleaned.trim_end().to_string();
    }
    cleaned
}

/// The immutable two-column schema used for the whole response once any log
/// item is observed.
#[must_use]
pub fn log_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("stream_type", DataType::Utf8, false),
        Field::new("stream_content", DataType::Utf8, false),
    ]))
}

#[must_use]
pub fn log_batch(line: &LogLine) -> RecordBatch {
    let schema = log_schema();
    RecordBatch::try_new(
        Arc::clone(&schema),
        vec![
            Arc::new(StringArray::from(vec![line.stream_type()])),
            Arc::new(StringArray::from(vec![line.content()])),
        ],
    )
    .unwrap_or_else(|_| RecordBatch::new_empty(schema))
}

/// Single-column placeholder schema (`Result` for empty renders, `result`
/// for statements the schema probe skips).
#[must_use]
pub fn placeholder_schema(field_name: &str) -> Schema {
    Schema::new(vec![Field::new(field_name, DataType::Utf8, true)])
}

/// One-row, one-column message batch.
#[must_use]
pub fn message_batch(field_name: &str, message: &str) -> RecordBatch {
    let schema = Arc::new(placeholder_schema(field_name));
    RecordBatch::try_new(
        Arc::clone(&schema),
        vec![Arc::new(StringArray::from(vec![message]))],
    )
    .unwrap_or_else(|_| RecordBatch::new_empty(schema))
}

/// Reads a string cell out of a batch, tolerating nulls and non-string
/// columns.
#[must_use]
pub fn string_cell(batch: &RecordBatch, column: usize, row: usize) -> String {
    batch
        .column(column)
        .as_any()
        .downcast_ref::<StringArray>()
        .filter(|array| row < array.len() && !array.is_null(row))
        .map(|array| array.value(row).to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_known_prefixes_and_python_tails() {
        assert_eq!(
            strip_engine_prefixes("Catalog Error: Table 'x' does not exist"),
            "Table 'x' does not exist"
        );
        assert_eq!(
            strip_engine_prefixes("boom Detail: Python exception ..."),
            "boom"
        );
        assert_eq!(
            strip_engine_prefixes("Error during planning: bad column"),
            "bad column"
        );
    }

    #[test]
    fn log_batches_use_the_fixed_schema() {
        let batch = log_batch(&LogLine::Stdout("hello".to_string()));
        assert_eq!(batch.schema(), log_schema());
        assert_eq!(string_cell(&batch, 0, 0), "stdout");
        assert_eq!(string_cell(&batch, 1, 0), "hello");
    }

    #[test]
    fn message_batches_are_single_cell() {
        let batch = message_batch("Result", SUCCESS_MESSAGE);
        assert_eq!(batch.num_rows(), 1);
        assert_eq!(string_cell(&batch, 0, 0), SUCCESS_MESSAGE);
    }
}
