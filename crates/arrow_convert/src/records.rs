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
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use indexmap::IndexMap;

use crate::cells::{infer_type, Cell};
use crate::{rows_to_batch_with_schema, Result};

/// Records sampled for schema inference.
pub const SCHEMA_SAMPLE_SIZE: usize = 100;

/// Rows per batch while converting records.
pub const CONVERSION_BATCH_SIZE: usize = 10_000;

/// One record returned by a user script: either a field map or a bare scalar.
/// Scalars land in a single column named `value`.
#[derive(Debug, Clone)]
pub enum RecordValue {
    Map(IndexMap<String, Cell>),
    Scalar(Cell),
}

/// Converts a materialized list of records into Arrow batches.
///
/// Field names are unioned across the first [`SCHEMA_SAMPLE_SIZE`] records in
/// first-seen order. Each field gets the narrowest type admitting its sampled
/// non-null values; a field whose remaining values disagree with that type is
/// demoted to utf8 before any batch is built, so every batch shares one schema.
///
/// # Errors
///
/// Fails only when Arrow rejects the assembled columns.
pub fn records_to_batches(records: &[RecordValue]) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    if records.is_empty() {
        let schema: SchemaRef = Arc::new(Schema::empty());
        return Ok((schema, Vec::new()));
    }

    let field_names = collect_field_names(records);

    // Flatten every record into a row once, so demotion can scan the full set.
    let rows: Vec<Vec<Cell>> = records
        .iter()
        .map(|record| record_to_row(record, &field_names))
        .collect();

    let mut fields = Vec::with_capacity(field_names.len());
    for (idx, name) in field_names.iter().enumerate() {
        let sampled = rows
            .iter()
            .take(SCHEMA_SAMPLE_SIZE)
            .map(move |r| &r[idx]);
        let mut data_type = infer_type(sampled);
        if !column_fits(&data_type, rows.iter().map(|r| &r[idx])) {
            data_type = DataType::Utf8;
        }
        fields.push(Field::new(name, data_type, true));
    }
    let schema: SchemaRef = Arc::new(Schema::new(fields));

    let mut batches = Vec::with_capacity(rows.len().div_ceil(CONVERSION_BATCH_SIZE));
    for chunk in rows.chunks(CONVERSION_BATCH_SIZE) {
        batches.push(rows_to_batch_with_schema(&schema, chunk)?);
    }

    Ok((schema, batches))
}

fn collect_field_names(records: &[RecordValue]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut saw_map = false;
    for record in records.iter().take(SCHEMA_SAMPLE_SIZE) {
        if let RecordValue::Map(map) = record {
            saw_map = true;
            for key in map.keys() {
                if !names.iter().any(|n| n == key) {
                    names.push(key.clone());
                }
            }
        }
    }
    if !saw_map {
        names.push("value".to_string());
    }
    names
}

fn record_to_row(record: &RecordValue, field_names: &[String]) -> Vec<Cell> {
    match record {
        RecordValue::Map(map) => field_names
            .iter()
            .map(|name| map.get(name).cloned().unwrap_or(Cell::Null))
            .collect(),
        RecordValue::Scalar(cell) => {
            let mut row = vec![Cell::Null; field_names.len()];
            if let Some(first) = row.first_mut() {
                *first = cell.clone();
            }
            row
        }
    }
}

fn column_fits<'a>(data_type: &DataType, mut cells: impl Iterator<Item = &'a Cell>) -> bool {
    cells.all(|cell| match (cell, data_type) {
        (Cell::Null, _) | (_, DataType::Utf8) => true,
        (Cell::Bool(_), DataType::Boolean)
        | (Cell::Int(_), DataType::Int64 | DataType::Float64)
        | (Cell::Float(_), DataType::Float64)
        | (Cell::Date(_), DataType::Date32)
        | (Cell::Bytes(_), DataType::Binary) => true,
        (Cell::Timestamp(_), DataType::Timestamp(_, _)) => true,
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, Cell)]) -> RecordValue {
        RecordValue::Map(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn unions_field_names_in_first_seen_order() {
        let records = vec![
            map(&[("a", Cell::Int(1))]),
            map(&[("b", Cell::Str("x".into())), ("a", Cell::Int(2))]),
        ];
        let (schema, batches) = records_to_batches(&records).expect("convert");
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].num_rows(), 2);
        assert!(batches[0].column(1).is_null(0));
    }

    #[test]
    fn scalars_become_value_column() {
        let records = vec![
            RecordValue::Scalar(Cell::Int(1)),
            RecordValue::Scalar(Cell::Int(2)),
        ];
        let (schema, batches) = records_to_batches(&records).expect("convert");
        assert_eq!(schema.field(0).name(), "value");
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(batches[0].num_rows(), 2);
    }

    #[test]
    fn late_disagreement_demotes_to_string() {
        // The sample window sees only ints; a later string demotes the column.
        let mut records: Vec<RecordValue> = (0..SCHEMA_SAMPLE_SIZE)
            .map(|i| map(&[("v", Cell::Int(i as i64))]))
            .collect();
        records.push(map(&[("v", Cell::Str("surprise".into()))]));
        let (schema, batches) = records_to_batches(&records).expect("convert");
        assert_eq!(schema.field(0).data_type(), &DataType::Utf8);
        assert_eq!(batches[0].num_rows(), records.len());
    }

    #[test]
    fn empty_input_yields_empty_schema() {
        let (schema, batches) = records_to_batches(&[]).expect("convert");
        assert_eq!(schema.fields().len(), 0);
        assert!(batches.is_empty());
    }

    #[test]
    fn batches_are_chunked() {
        let records: Vec<RecordValue> = (0..(CONVERSION_BATCH_SIZE + 5))
            .map(|i| map(&[("v", Cell::Int(i as i64))]))
            .collect();
        let (_, batches) = records_to_batches(&records).expect("convert");
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].num_rows(), 5);
    }
}
