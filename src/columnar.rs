//! Row <-> Arrow conversion and Parquet I/O.
//!
//! The engine stores schemaless rows, so the Arrow schema is inferred per
//! write: integer columns widen to `Float64` when mixed with floats, and a
//! column that is null in every row falls back to `Utf8`.

use crate::error::{Error, Result};
use crate::value::{Record, ScalarValue};

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder, Int64Array,
    Int64Builder, StringArray, StringBuilder,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Per-column summary computed at write time and stored by the index.
#[derive(Debug, Clone)]
pub struct ColumnSummary {
    pub min: Option<ScalarValue>,
    pub max: Option<ScalarValue>,
    pub null_count: u64,
    /// Exact distinct values, only when the cardinality stayed under the cap.
    pub distinct: Option<Vec<ScalarValue>>,
}

/// Infer an Arrow schema from a set of rows.
///
/// The column set is the union across rows; every field is nullable because
/// rows are not required to agree on columns.
pub fn infer_schema(rows: &[Record]) -> Result<Arc<Schema>> {
    if rows.is_empty() {
        return Err(Error::InvalidSchema("cannot infer schema from zero rows".to_string()));
    }

    let mut columns: BTreeSet<&str> = BTreeSet::new();
    for row in rows {
        for key in row.keys() {
            columns.insert(key.as_str());
        }
    }

    let mut fields = Vec::with_capacity(columns.len());
    for column in columns {
        let mut dtype: Option<DataType> = None;
        for row in rows {
            let candidate = match row.get(column) {
                None | Some(ScalarValue::Null) => continue,
                Some(ScalarValue::Bool(_)) => DataType::Boolean,
                Some(ScalarValue::Int(_)) => DataType::Int64,
                Some(ScalarValue::Float(_)) => DataType::Float64,
                Some(ScalarValue::Str(_)) => DataType::Utf8,
            };
            dtype = Some(match (dtype.take(), candidate) {
                (None, c) => c,
                (Some(existing), c) if existing == c => existing,
                // Mixed int/float widens to float
                (Some(DataType::Int64), DataType::Float64)
                | (Some(DataType::Float64), DataType::Int64) => DataType::Float64,
                (Some(existing), c) => {
                    return Err(Error::InvalidSchema(format!(
                        "column '{}' mixes {} and {}",
                        column, existing, c
                    )));
                }
            });
        }
        fields.push(Field::new(column, dtype.unwrap_or(DataType::Utf8), true));
    }

    Ok(Arc::new(Schema::new(fields)))
}

/// Convert rows into a single [`RecordBatch`] under the given schema.
pub fn rows_to_batch(schema: Arc<Schema>, rows: &[Record]) -> Result<RecordBatch> {
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());

    for field in schema.fields() {
        let name = field.name().as_str();
        let array: ArrayRef = match field.data_type() {
            DataType::Int64 => {
                let mut builder = Int64Builder::with_capacity(rows.len());
                for row in rows {
                    match row.get(name) {
                        Some(ScalarValue::Int(v)) => builder.append_value(*v),
                        Some(ScalarValue::Null) | None => builder.append_null(),
                        Some(other) => {
                            return Err(Error::InvalidSchema(format!(
                                "column '{}' expected int, found {}",
                                name,
                                other.type_name()
                            )));
                        }
                    }
                }
                Arc::new(builder.finish())
            }
            DataType::Float64 => {
                let mut builder = Float64Builder::with_capacity(rows.len());
                for row in rows {
                    match row.get(name) {
                        Some(ScalarValue::Float(v)) => builder.append_value(*v),
                        Some(ScalarValue::Int(v)) => builder.append_value(*v as f64),
                        Some(ScalarValue::Null) | None => builder.append_null(),
                        Some(other) => {
                            return Err(Error::InvalidSchema(format!(
                                "column '{}' expected float, found {}",
                                name,
                                other.type_name()
                            )));
                        }
                    }
                }
                Arc::new(builder.finish())
            }
            DataType::Boolean => {
                let mut builder = BooleanBuilder::with_capacity(rows.len());
                for row in rows {
                    match row.get(name) {
                        Some(ScalarValue::Bool(v)) => builder.append_value(*v),
                        Some(ScalarValue::Null) | None => builder.append_null(),
                        Some(other) => {
                            return Err(Error::InvalidSchema(format!(
                                "column '{}' expected bool, found {}",
                                name,
                                other.type_name()
                            )));
                        }
                    }
                }
                Arc::new(builder.finish())
            }
            DataType::Utf8 => {
                let mut builder = StringBuilder::new();
                for row in rows {
                    match row.get(name) {
                        Some(ScalarValue::Str(v)) => builder.append_value(v),
                        Some(ScalarValue::Null) | None => builder.append_null(),
                        Some(other) => {
                            return Err(Error::InvalidSchema(format!(
                                "column '{}' expected string, found {}",
                                name,
                                other.type_name()
                            )));
                        }
                    }
                }
                Arc::new(builder.finish())
            }
            other => {
                return Err(Error::InvalidSchema(format!(
                    "unsupported column type {} for '{}'",
                    other, name
                )));
            }
        };
        arrays.push(array);
    }

    RecordBatch::try_new(schema, arrays).map_err(Error::from)
}

/// Convert a [`RecordBatch`] back into rows.
pub fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<Record>> {
    let schema = batch.schema();
    let mut rows: Vec<Record> = vec![Record::new(); batch.num_rows()];

    for (col_idx, field) in schema.fields().iter().enumerate() {
        let name = field.name();
        let array = batch.column(col_idx);
        match field.data_type() {
            DataType::Int64 => {
                let typed = array
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .ok_or_else(|| Error::Internal(format!("column '{}' downcast failed", name)))?;
                for (i, row) in rows.iter_mut().enumerate() {
                    let value = if typed.is_null(i) {
                        ScalarValue::Null
                    } else {
                        ScalarValue::Int(typed.value(i))
                    };
                    row.insert(name.clone(), value);
                }
            }
            DataType::Float64 => {
                let typed = array
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| Error::Internal(format!("column '{}' downcast failed", name)))?;
                for (i, row) in rows.iter_mut().enumerate() {
                    let value = if typed.is_null(i) {
                        ScalarValue::Null
                    } else {
                        ScalarValue::Float(typed.value(i))
                    };
                    row.insert(name.clone(), value);
                }
            }
            DataType::Boolean => {
                let typed = array
                    .as_any()
                    .downcast_ref::<BooleanArray>()
                    .ok_or_else(|| Error::Internal(format!("column '{}' downcast failed", name)))?;
                for (i, row) in rows.iter_mut().enumerate() {
                    let value = if typed.is_null(i) {
                        ScalarValue::Null
                    } else {
                        ScalarValue::Bool(typed.value(i))
                    };
                    row.insert(name.clone(), value);
                }
            }
            DataType::Utf8 => {
                let typed = array
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| Error::Internal(format!("column '{}' downcast failed", name)))?;
                for (i, row) in rows.iter_mut().enumerate() {
                    let value = if typed.is_null(i) {
                        ScalarValue::Null
                    } else {
                        ScalarValue::Str(typed.value(i).to_string())
                    };
                    row.insert(name.clone(), value);
                }
            }
            other => {
                return Err(Error::InvalidSchema(format!(
                    "unsupported column type {} for '{}'",
                    other, name
                )));
            }
        }
    }

    Ok(rows)
}

/// Serialize rows to Parquet bytes with ZSTD compression and page statistics.
pub fn rows_to_parquet(rows: &[Record]) -> Result<Bytes> {
    let schema = infer_schema(rows)?;
    let batch = rows_to_batch(schema.clone(), rows)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(
            ZstdLevel::try_new(3).map_err(Error::from)?,
        ))
        .set_dictionary_enabled(true)
        .set_statistics_enabled(EnabledStatistics::Page)
        .build();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(Bytes::from(buffer))
}

/// Deserialize Parquet bytes back into rows.
pub fn parquet_to_rows(bytes: Bytes) -> Result<Vec<Record>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
    let mut rows = Vec::new();
    for batch in reader {
        rows.extend(batch_to_rows(&batch?)?);
    }
    Ok(rows)
}

/// Summarize one column of a row set for indexing.
///
/// The distinct set is dropped (left `None`) once it would exceed
/// `cardinality_cap` values.
pub fn summarize_column(rows: &[Record], column: &str, cardinality_cap: usize) -> ColumnSummary {
    let mut min: Option<ScalarValue> = None;
    let mut max: Option<ScalarValue> = None;
    let mut null_count = 0u64;
    let mut distinct_keys: BTreeSet<String> = BTreeSet::new();
    let mut distinct_values: Vec<ScalarValue> = Vec::new();
    let mut capped = false;

    for row in rows {
        let value = match row.get(column) {
            Some(v) if !v.is_null() => v,
            _ => {
                null_count += 1;
                continue;
            }
        };

        let smaller = match &min {
            None => true,
            Some(m) => matches!(value.partial_cmp(m), Some(std::cmp::Ordering::Less)),
        };
        if smaller {
            min = Some(value.clone());
        }
        let larger = match &max {
            None => true,
            Some(m) => matches!(value.partial_cmp(m), Some(std::cmp::Ordering::Greater)),
        };
        if larger {
            max = Some(value.clone());
        }

        if !capped {
            // BTreeSet over the display form; ScalarValue itself is not Ord
            if distinct_keys.insert(format!("{}:{}", value.type_name(), value)) {
                distinct_values.push(value.clone());
                if distinct_values.len() > cardinality_cap {
                    capped = true;
                    distinct_values.clear();
                    distinct_keys.clear();
                }
            }
        }
    }

    ColumnSummary {
        min,
        max,
        null_count,
        distinct: if capped { None } else { Some(distinct_values) },
    }
}

/// Time range of a row set, read from `time_column`.
///
/// Integer values are epoch milliseconds; strings are parsed as RFC 3339.
/// Unparseable values are ignored.
pub fn time_range(rows: &[Record], time_column: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let mut min: Option<DateTime<Utc>> = None;
    let mut max: Option<DateTime<Utc>> = None;

    for row in rows {
        let ts = match row.get(time_column) {
            Some(ScalarValue::Int(ms)) => Utc.timestamp_millis_opt(*ms).single(),
            Some(ScalarValue::Float(ms)) => Utc.timestamp_millis_opt(*ms as i64).single(),
            Some(ScalarValue::Str(s)) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        };
        if let Some(ts) = ts {
            min = Some(min.map_or(ts, |m| m.min(ts)));
            max = Some(max.map_or(ts, |m| m.max(ts)));
        }
    }

    match (min, max) {
        (Some(lo), Some(hi)) => Some((lo, hi)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, ScalarValue)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn schema_inference_widens_numeric() {
        let rows = vec![
            row(&[("v", ScalarValue::Int(1))]),
            row(&[("v", ScalarValue::Float(2.5))]),
        ];
        let schema = infer_schema(&rows).unwrap();
        assert_eq!(schema.field(0).data_type(), &DataType::Float64);
    }

    #[test]
    fn schema_inference_rejects_mixed_types() {
        let rows = vec![
            row(&[("v", ScalarValue::Int(1))]),
            row(&[("v", ScalarValue::from("two"))]),
        ];
        assert!(infer_schema(&rows).is_err());
    }

    #[test]
    fn parquet_round_trip_preserves_rows() {
        let rows = vec![
            row(&[
                ("region", ScalarValue::from("west")),
                ("count", ScalarValue::Int(10)),
            ]),
            row(&[
                ("region", ScalarValue::from("east")),
                ("count", ScalarValue::Null),
            ]),
        ];

        let bytes = rows_to_parquet(&rows).unwrap();
        let back = parquet_to_rows(bytes).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].get("region"), Some(&ScalarValue::from("west")));
        assert_eq!(back[0].get("count"), Some(&ScalarValue::Int(10)));
        assert!(back[1].get("count").unwrap().is_null());
    }

    #[test]
    fn summary_tracks_min_max_and_distinct() {
        let rows: Vec<Record> = (0..10)
            .map(|i| row(&[("v", ScalarValue::Int(i % 3))]))
            .chain(std::iter::once(row(&[("v", ScalarValue::Null)])))
            .collect();

        let summary = summarize_column(&rows, "v", 100);
        assert_eq!(summary.min, Some(ScalarValue::Int(0)));
        assert_eq!(summary.max, Some(ScalarValue::Int(2)));
        assert_eq!(summary.null_count, 1);
        assert_eq!(summary.distinct.as_ref().map(|d| d.len()), Some(3));
    }

    #[test]
    fn summary_drops_distinct_over_cap() {
        let rows: Vec<Record> = (0..50)
            .map(|i| row(&[("v", ScalarValue::Int(i))]))
            .collect();
        let summary = summarize_column(&rows, "v", 10);
        assert!(summary.distinct.is_none());
        assert_eq!(summary.min, Some(ScalarValue::Int(0)));
        assert_eq!(summary.max, Some(ScalarValue::Int(49)));
    }

    #[test]
    fn time_range_mixes_epoch_and_rfc3339() {
        let rows = vec![
            row(&[("ts", ScalarValue::Int(1_700_000_000_000))]),
            row(&[("ts", ScalarValue::from("2024-01-01T00:00:00Z"))]),
            row(&[("ts", ScalarValue::from("not a time"))]),
        ];
        let (lo, hi) = time_range(&rows, "ts").unwrap();
        assert!(lo < hi);
    }
}
