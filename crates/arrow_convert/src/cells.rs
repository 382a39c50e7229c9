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

use std::fmt;
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Date32Builder, Float64Builder, Int64Builder,
    RecordBatch, StringBuilder, TimestampMicrosecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use chrono::{NaiveDate, NaiveDateTime};
use snafu::prelude::*;

use crate::{Result, RowWidthMismatchSnafu, UnableToBuildRecordBatchSnafu};

/// A single loosely-typed value produced by a database driver or a script.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Cell {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => Ok(()),
            Cell::Bool(b) => write!(f, "{b}"),
            Cell::Int(i) => write!(f, "{i}"),
            Cell::Float(v) => write!(f, "{v}"),
            Cell::Str(s) => write!(f, "{s}"),
            Cell::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            Cell::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Cell::Timestamp(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S%.6f")),
        }
    }
}

/// Picks the narrowest Arrow type that admits every non-null value.
///
/// Priority order: bool, int64, float64, timestamp(µs), date32, binary, utf8.
pub(crate) fn infer_type<'a>(values: impl Iterator<Item = &'a Cell> + Clone) -> DataType {
    let mut non_null = values.filter(|c| !c.is_null()).peekable();
    if non_null.peek().is_none() {
        return DataType::Utf8;
    }

    if non_null.clone().all(|c| matches!(c, Cell::Bool(_))) {
        return DataType::Boolean;
    }
    if non_null.clone().all(|c| matches!(c, Cell::Int(_))) {
        return DataType::Int64;
    }
    if non_null
        .clone()
        .all(|c| matches!(c, Cell::Int(_) | Cell::Float(_)))
    {
        return DataType::Float64;
    }
    if non_null.clone().all(|c| matches!(c, Cell::Timestamp(_))) {
        return DataType::Timestamp(TimeUnit::Microsecond, None);
    }
    if non_null.clone().all(|c| matches!(c, Cell::Date(_))) {
        return DataType::Date32;
    }
    if non_null.all(|c| matches!(c, Cell::Bytes(_))) {
        return DataType::Binary;
    }
    DataType::Utf8
}

fn unix_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_else(|| unreachable!("1970-01-01 is a valid date"))
}

/// Builds one column of `data_type` from the given cells, returning `None`
/// when a non-null cell cannot be represented in that type. Callers fall back
/// to a string column in that case.
fn try_build_column<'a>(
    data_type: &DataType,
    cells: impl Iterator<Item = &'a Cell>,
) -> Option<ArrayRef> {
    match data_type {
        DataType::Boolean => {
            let mut b = BooleanBuilder::new();
            for cell in cells {
                match cell {
                    Cell::Null => b.append_null(),
                    Cell::Bool(v) => b.append_value(*v),
                    _ => return None,
                }
            }
            Some(Arc::new(b.finish()))
        }
        DataType::Int64 => {
            let mut b = Int64Builder::new();
            for cell in cells {
                match cell {
                    Cell::Null => b.append_null(),
                    Cell::Int(v) => b.append_value(*v),
                    _ => return None,
                }
            }
            Some(Arc::new(b.finish()))
        }
        DataType::Float64 => {
            let mut b = Float64Builder::new();
            for cell in cells {
                match cell {
                    Cell::Null => b.append_null(),
                    Cell::Int(v) => b.append_value(*v as f64),
                    Cell::Float(v) => b.append_value(*v),
                    _ => return None,
                }
            }
            Some(Arc::new(b.finish()))
        }
        DataType::Timestamp(TimeUnit::Microsecond, None) => {
            let mut b = TimestampMicrosecondBuilder::new();
            for cell in cells {
                match cell {
                    Cell::Null => b.append_null(),
                    Cell::Timestamp(v) => b.append_value(v.and_utc().timestamp_micros()),
                    _ => return None,
                }
            }
            Some(Arc::new(b.finish()))
        }
        DataType::Date32 => {
            let mut b = Date32Builder::new();
            for cell in cells {
                match cell {
                    Cell::Null => b.append_null(),
                    Cell::Date(v) => {
                        let days = v.signed_duration_since(unix_epoch_date()).num_days();
                        b.append_value(i32::try_from(days).ok()?);
                    }
                    _ => return None,
                }
            }
            Some(Arc::new(b.finish()))
        }
        DataType::Binary => {
            let mut b = BinaryBuilder::new();
            for cell in cells {
                match cell {
                    Cell::Null => b.append_null(),
                    Cell::Bytes(v) => b.append_value(v),
                    _ => return None,
                }
            }
            Some(Arc::new(b.finish()))
        }
        _ => Some(build_string_column(cells)),
    }
}

fn build_string_column<'a>(cells: impl Iterator<Item = &'a Cell>) -> ArrayRef {
    let mut b = StringBuilder::new();
    for cell in cells {
        if cell.is_null() {
            b.append_null();
        } else {
            b.append_value(cell.to_string());
        }
    }
    Arc::new(b.finish())
}

/// Builds a record batch from row-major cells, inferring the column types from
/// the rows themselves. A column whose cells do not agree with the inferred
/// type is demoted to utf8.
///
/// # Errors
///
/// Fails when a row has a different width than `names`, or when Arrow rejects
/// the assembled columns.
pub fn rows_to_batch(names: &[String], rows: &[Vec<Cell>]) -> Result<RecordBatch> {
    for row in rows {
        ensure!(
            row.len() == names.len(),
            RowWidthMismatchSnafu {
                expected: names.len(),
                actual: row.len(),
            }
        );
    }

    let mut fields = Vec::with_capacity(names.len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(names.len());
    for (idx, name) in names.iter().enumerate() {
        let column_cells = rows.iter().map(move |r| &r[idx]);
        let inferred = infer_type(column_cells.clone());
        let array = try_build_column(&inferred, column_cells.clone())
            .unwrap_or_else(|| build_string_column(column_cells));
        fields.push(Field::new(name, array.data_type().clone(), true));
        columns.push(array);
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .context(UnableToBuildRecordBatchSnafu)
}

/// Builds a record batch shaped by an existing schema (subsequent batches of a
/// stream reuse the schema inferred from the first). Cells that do not fit the
/// column type become nulls, or their string rendering for utf8 columns.
///
/// # Errors
///
/// Fails when a row width differs from the schema, or when Arrow rejects the
/// assembled columns.
pub fn rows_to_batch_with_schema(schema: &SchemaRef, rows: &[Vec<Cell>]) -> Result<RecordBatch> {
    for row in rows {
        ensure!(
            row.len() == schema.fields().len(),
            RowWidthMismatchSnafu {
                expected: schema.fields().len(),
                actual: row.len(),
            }
        );
    }

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for (idx, field) in schema.fields().iter().enumerate() {
        let coerced: Vec<Cell> = rows
            .iter()
            .map(|r| coerce_cell(&r[idx], field.data_type()))
            .collect();
        let array = try_build_column(field.data_type(), coerced.iter())
            .unwrap_or_else(|| build_string_column(coerced.iter()));
        columns.push(array);
    }

    RecordBatch::try_new(Arc::clone(schema), columns).context(UnableToBuildRecordBatchSnafu)
}

fn coerce_cell(cell: &Cell, target: &DataType) -> Cell {
    match (cell, target) {
        (Cell::Null, _) => Cell::Null,
        (Cell::Bool(_), DataType::Boolean)
        | (Cell::Int(_), DataType::Int64 | DataType::Float64)
        | (Cell::Float(_), DataType::Float64)
        | (Cell::Timestamp(_), DataType::Timestamp(TimeUnit::Microsecond, None))
        | (Cell::Date(_), DataType::Date32)
        | (Cell::Bytes(_), DataType::Binary) => cell.clone(),
        (_, DataType::Utf8) => Cell::Str(cell.to_string()),
        _ => Cell::Null,
    }
}

/// Zero-row batch with an all-string schema, used to register a stub for
/// sources that produced no rows.
#[must_use]
pub fn empty_string_batch(names: &[String]) -> RecordBatch {
    let fields: Vec<Field> = names
        .iter()
        .map(|n| Field::new(n, DataType::Utf8, true))
        .collect();
    let schema = Arc::new(Schema::new(fields));
    let columns: Vec<ArrayRef> = names
        .iter()
        .map(|_| Arc::new(StringBuilder::new().finish()) as ArrayRef)
        .collect();
    RecordBatch::try_new(schema.clone(), columns)
        .unwrap_or_else(|_| RecordBatch::new_empty(schema))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn infers_int_column() {
        let rows = vec![
            vec![Cell::Int(1), Cell::Str("a".into())],
            vec![Cell::Int(2), Cell::Null],
        ];
        let batch = rows_to_batch(&names(&["id", "name"]), &rows).expect("batch");
        assert_eq!(batch.schema().field(0).data_type(), &DataType::Int64);
        assert_eq!(batch.schema().field(1).data_type(), &DataType::Utf8);
        assert_eq!(batch.num_rows(), 2);
    }

    #[test]
    fn mixed_ints_and_floats_widen_to_float() {
        let rows = vec![vec![Cell::Int(1)], vec![Cell::Float(2.5)]];
        let batch = rows_to_batch(&names(&["v"]), &rows).expect("batch");
        assert_eq!(batch.schema().field(0).data_type(), &DataType::Float64);
    }

    #[test]
    fn disagreeing_column_falls_back_to_string() {
        let rows = vec![vec![Cell::Int(1)], vec![Cell::Int(2)]];
        let schema = rows_to_batch(&names(&["v"]), &rows).expect("batch").schema();
        let mixed = vec![vec![Cell::Str("x".into())], vec![Cell::Int(3)]];
        let batch = rows_to_batch(&names(&["v"]), &mixed).expect("batch");
        assert_eq!(batch.schema().field(0).data_type(), &DataType::Utf8);
        // A fixed schema coerces instead of demoting.
        let coerced = rows_to_batch_with_schema(&schema, &mixed).expect("batch");
        assert_eq!(coerced.schema().field(0).data_type(), &DataType::Int64);
        assert!(coerced.column(0).is_null(0));
    }

    #[test]
    fn empty_stub_has_string_fields() {
        let batch = empty_string_batch(&names(&["a", "b"]));
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.num_columns(), 2);
        assert_eq!(batch.schema().field(0).data_type(), &DataType::Utf8);
    }

    #[test]
    fn all_null_column_is_string() {
        let rows = vec![vec![Cell::Null], vec![Cell::Null]];
        let batch = rows_to_batch(&names(&["v"]), &rows).expect("batch");
        assert_eq!(batch.schema().field(0).data_type(), &DataType::Utf8);
        assert!(batch.column(0).is_null(0));
    }
}
