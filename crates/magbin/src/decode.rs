// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data line decoding.
//!
//! A batch payload is a `;`-separated list of records; each record is a
//! `,`-separated list of 7 timestamp components (year, month, day, hour,
//! minute, second, microsecond) followed by one value per header key.
//! Numeric keys are divided by their multiplier, text keys pass through,
//! unknown and time-like keys are dropped. Malformed records are skipped
//! individually.

use crate::header::{format_number, Header};
use crate::keys::{slot_kind, SlotKind};
use crate::packcode::TIMESTAMP_FIELDS;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Record separator in a batch payload.
pub const RECORD_SEPARATOR: char = ';';

/// Field separator within a record.
pub const FIELD_SEPARATOR: char = ',';

/// Per-record decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record has {found} fields, expected {expected}")]
    FieldCount { expected: usize, found: usize },

    #[error("invalid timestamp component '{0}'")]
    TimestampField(String),

    #[error("timestamp {0:?} is not a valid date")]
    InvalidDate([i64; 7]),

    #[error("value '{value}' for key '{key}' is not numeric")]
    NotNumeric { key: String, value: String },
}

/// One decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    Number(f64),
    Text(String),
}

impl SampleValue {
    /// Numeric value, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SampleValue::Number(v) => Some(*v),
            SampleValue::Text(_) => None,
        }
    }
}

impl fmt::Display for SampleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleValue::Number(v) => write!(f, "{}", v),
            SampleValue::Text(s) => f.write_str(s),
        }
    }
}

/// One observation: timestamp plus values aligned to the decoded keys.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub timestamp: DateTime<Utc>,
    pub values: Vec<SampleValue>,
}

impl SampleRecord {
    /// Milliseconds since the Unix epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Comma-joined values.
    pub fn values_csv(&self) -> String {
        join_values(&self.values)
    }

    /// Timestamp as the 7 wire components.
    pub fn timestamp_fields(&self) -> [i64; 7] {
        timestamp_fields(&self.timestamp)
    }
}

/// A decoded column of the header.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Slot key.
    pub key: String,
    /// Value kind.
    pub kind: SlotKind,
    /// Position among the record's value fields.
    pub position: usize,
    /// Divisor for numeric values.
    pub multiplier: f64,
}

/// Columns of `header` that survive decoding, in header order.
pub fn columns(header: &Header) -> Vec<Column> {
    header
        .keys
        .iter()
        .enumerate()
        .filter_map(|(position, key)| {
            slot_kind(key).map(|kind| Column {
                key: key.clone(),
                kind,
                position,
                multiplier: header.multiplier(position),
            })
        })
        .collect()
}

/// Result of decoding one batch payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedBatch {
    /// Keys the record values are aligned to.
    pub keys: Vec<String>,
    /// Records, in payload order.
    pub records: Vec<SampleRecord>,
    /// Records skipped as malformed.
    pub skipped: usize,
}

impl DecodedBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Values of one key across all records.
    pub fn column(&self, key: &str) -> Option<Vec<&SampleValue>> {
        let index = self.keys.iter().position(|k| k == key)?;
        Some(
            self.records
                .iter()
                .filter_map(|r| r.values.get(index))
                .collect(),
        )
    }

    /// Timestamps of all records.
    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.records.iter().map(|r| r.timestamp).collect()
    }
}

/// Decode a full batch payload against `header`.
pub fn decode_batch(header: &Header, payload: &str) -> DecodedBatch {
    let columns = columns(header);
    let mut batch = DecodedBatch {
        keys: columns.iter().map(|c| c.key.clone()).collect(),
        ..Default::default()
    };

    for line in payload.split(RECORD_SEPARATOR) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match decode_line(header, &columns, line) {
            Ok(record) => batch.records.push(record),
            Err(e) => {
                debug!(sensor = %header.sensor_id, "skipping record '{}': {}", line, e);
                batch.skipped += 1;
            }
        }
    }
    batch
}

/// Decode a single record line against `header`.
pub fn decode_record(header: &Header, line: &str) -> Result<SampleRecord, DecodeError> {
    decode_line(header, &columns(header), line.trim())
}

fn decode_line(
    header: &Header,
    columns: &[Column],
    line: &str,
) -> Result<SampleRecord, DecodeError> {
    let fields: Vec<&str> = line.split(FIELD_SEPARATOR).map(str::trim).collect();
    let expected = TIMESTAMP_FIELDS + header.keys.len();
    if fields.len() != expected {
        return Err(DecodeError::FieldCount {
            expected,
            found: fields.len(),
        });
    }

    let mut parts = [0i64; 7];
    for (slot, field) in parts.iter_mut().zip(&fields[..TIMESTAMP_FIELDS]) {
        *slot = field
            .parse::<i64>()
            .map_err(|_| DecodeError::TimestampField(field.to_string()))?;
    }
    let timestamp = timestamp_from_fields(parts).ok_or(DecodeError::InvalidDate(parts))?;

    let data = &fields[TIMESTAMP_FIELDS..];
    let mut values = Vec::with_capacity(columns.len());
    for column in columns {
        let raw = data[column.position];
        let value = match column.kind {
            SlotKind::Numeric => {
                let v = raw.parse::<f64>().map_err(|_| DecodeError::NotNumeric {
                    key: column.key.clone(),
                    value: raw.to_string(),
                })?;
                SampleValue::Number(v / column.multiplier)
            }
            SlotKind::Text => SampleValue::Text(raw.to_string()),
        };
        values.push(value);
    }

    Ok(SampleRecord { timestamp, values })
}

/// Build a UTC timestamp from the 7 wire components.
pub fn timestamp_from_fields(parts: [i64; 7]) -> Option<DateTime<Utc>> {
    let [year, month, day, hour, minute, second, micro] = parts;
    let date = NaiveDate::from_ymd_opt(
        i32::try_from(year).ok()?,
        u32::try_from(month).ok()?,
        u32::try_from(day).ok()?,
    )?;
    let naive = date.and_hms_micro_opt(
        u32::try_from(hour).ok()?,
        u32::try_from(minute).ok()?,
        u32::try_from(second).ok()?,
        u32::try_from(micro).ok()?,
    )?;
    Utc.from_local_datetime(&naive).single()
}

/// Split a timestamp into the 7 wire components.
pub fn timestamp_fields(ts: &DateTime<Utc>) -> [i64; 7] {
    [
        ts.year() as i64,
        ts.month() as i64,
        ts.day() as i64,
        ts.hour() as i64,
        ts.minute() as i64,
        ts.second() as i64,
        (ts.nanosecond() / 1000).min(999_999) as i64,
    ]
}

/// Comma-join values, integral numbers without a fraction.
pub fn join_values(values: &[SampleValue]) -> String {
    values
        .iter()
        .map(|v| match v {
            SampleValue::Number(n) => format_number(*n),
            SampleValue::Text(s) => s.clone(),
        })
        .collect::<Vec<_>>()
        .join(",")
}
