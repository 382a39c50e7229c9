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

//! Conversion of loosely-typed values into Arrow record batches.
//!
//! Two producers feed this crate: database cursors yielding rows of [`Cell`]s,
//! and user scripts yielding records ([`RecordValue`]). Both end up as Arrow
//! batches with inferred schemas and a string fallback for columns that refuse
//! their inferred type.

use snafu::prelude::*;

mod cells;
mod records;

pub use cells::{empty_string_batch, rows_to_batch, rows_to_batch_with_schema, Cell};
pub use records::{records_to_batches, RecordValue, CONVERSION_BATCH_SIZE, SCHEMA_SAMPLE_SIZE};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unable to build record batch: {source}"))]
    UnableToBuildRecordBatch { source: arrow::error::ArrowError },

    #[snafu(display("Row has {actual} cells, expected {expected}"))]
    RowWidthMismatch { expected: usize, actual: usize },
}
