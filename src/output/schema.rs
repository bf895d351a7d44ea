//! Arrow schema inference and record conversion
//!
//! Column types are taken from the row values themselves: the first
//! non-null value of a column fixes its type, and conflicting values widen
//! it (integers and doubles to `Float64`, dates and timestamps to
//! `Timestamp`, anything else to `Utf8`).

use crate::database::SqlValue;
use crate::error::{Error, Result};
use crate::querier::SourceRecord;
use arrow::array::{
    ArrayRef, BinaryArray, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use std::sync::Arc;

/// Infer an Arrow schema from a set of records
///
/// Columns keep the order in which they are first seen. All fields are
/// nullable; a column that is null in every record becomes `Utf8`.
pub fn infer_schema(records: &[SourceRecord]) -> Schema {
    let mut columns: Vec<(String, Option<DataType>)> = Vec::new();

    for record in records {
        for (name, value) in record.row.columns().iter().zip(record.row.values()) {
            let index = match columns.iter().position(|(n, _)| n == name) {
                Some(index) => index,
                None => {
                    columns.push((name.clone(), None));
                    columns.len() - 1
                }
            };

            if let Some(inferred) = infer_type(value) {
                let slot = &mut columns[index].1;
                *slot = Some(match slot.take() {
                    Some(existing) => merge_types(&existing, &inferred),
                    None => inferred,
                });
            }
        }
    }

    let fields: Vec<Field> = columns
        .into_iter()
        .map(|(name, dtype)| Field::new(name, dtype.unwrap_or(DataType::Utf8), true))
        .collect();
    Schema::new(fields)
}

/// Convert records to an Arrow RecordBatch
///
/// Uses the provided schema or infers one from the records.
pub fn records_to_arrow(records: &[SourceRecord], schema: Option<&Schema>) -> Result<RecordBatch> {
    let schema = match schema {
        Some(schema) => schema.clone(),
        None => infer_schema(records),
    };

    if records.is_empty() {
        return Ok(RecordBatch::new_empty(Arc::new(schema)));
    }

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let values: Vec<Option<&SqlValue>> = records
            .iter()
            .map(|record| record.row.get_by_name(field.name()).filter(|v| !v.is_null()))
            .collect();
        columns.push(build_array(&values, field.data_type())?);
    }

    RecordBatch::try_new(Arc::new(schema), columns).map_err(|e| Error::Output {
        message: format!("Failed to create RecordBatch: {e}"),
    })
}

fn infer_type(value: &SqlValue) -> Option<DataType> {
    let dtype = match value {
        SqlValue::Null => return None,
        SqlValue::Bool(_) => DataType::Boolean,
        SqlValue::Int(_) => DataType::Int64,
        SqlValue::Double(_) => DataType::Float64,
        SqlValue::Text(_) => DataType::Utf8,
        SqlValue::Bytes(_) => DataType::Binary,
        SqlValue::Date(_) => DataType::Date32,
        SqlValue::Timestamp(_) => DataType::Timestamp(TimeUnit::Microsecond, None),
    };
    Some(dtype)
}

fn merge_types(a: &DataType, b: &DataType) -> DataType {
    match (a, b) {
        (a, b) if a == b => a.clone(),
        (DataType::Int64, DataType::Float64) | (DataType::Float64, DataType::Int64) => {
            DataType::Float64
        }
        (DataType::Date32, DataType::Timestamp(..)) | (DataType::Timestamp(..), DataType::Date32) => {
            DataType::Timestamp(TimeUnit::Microsecond, None)
        }
        _ => DataType::Utf8,
    }
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    (date - NaiveDate::default()).num_days() as i32
}

fn text_value(value: &SqlValue) -> String {
    match value {
        SqlValue::Text(s) => s.clone(),
        other => match other.to_json() {
            serde_json::Value::String(s) => s,
            json => json.to_string(),
        },
    }
}

fn build_array(values: &[Option<&SqlValue>], data_type: &DataType) -> Result<ArrayRef> {
    let array: ArrayRef = match data_type {
        DataType::Boolean => Arc::new(BooleanArray::from(
            values
                .iter()
                .map(|v| match v {
                    Some(SqlValue::Bool(b)) => Some(*b),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Int64 => Arc::new(Int64Array::from(
            values
                .iter()
                .map(|v| v.and_then(SqlValue::as_i64))
                .collect::<Vec<_>>(),
        )),
        DataType::Float64 => Arc::new(Float64Array::from(
            values
                .iter()
                .map(|v| match v {
                    Some(SqlValue::Double(f)) => Some(*f),
                    Some(SqlValue::Int(i)) => Some(*i as f64),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Binary => Arc::new(BinaryArray::from_opt_vec(
            values
                .iter()
                .map(|v| match v {
                    Some(SqlValue::Bytes(b)) => Some(b.as_slice()),
                    _ => None,
                })
                .collect(),
        )),
        DataType::Date32 => Arc::new(Date32Array::from(
            values
                .iter()
                .map(|v| match v {
                    Some(SqlValue::Date(d)) => Some(days_since_epoch(*d)),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Timestamp(TimeUnit::Microsecond, None) => Arc::new(
            TimestampMicrosecondArray::from(
                values
                    .iter()
                    .map(|v| {
                        v.and_then(SqlValue::as_timestamp)
                            .map(|ts| ts.and_utc().timestamp_micros())
                    })
                    .collect::<Vec<_>>(),
            ),
        ),
        DataType::Utf8 => Arc::new(StringArray::from(
            values
                .iter()
                .map(|v| v.map(text_value))
                .collect::<Vec<_>>(),
        )),
        other => {
            return Err(Error::output(format!("unsupported column type {other}")));
        }
    };
    Ok(array)
}
