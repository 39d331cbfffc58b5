// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Binary frame codec and buffer files.
//!
//! # Frame Format
//!
//! ```text
//! +--------------------------------------------------------------+
//! | year | month | day | hour | min | sec  (6 x i16)  | usec (u32) |
//! | value[0] | value[1] | ...           (typed per pack code)      |
//! +--------------------------------------------------------------+
//! ```
//!
//! All fields are little-endian and unaligned.
//!
//! # Buffer File
//!
//! ```text
//! # MagPyBin <sensor> [..] [..] [..] [..] <pack> <len>\n
//! <frame>\n
//! <frame>\n
//! ```

use crate::decode::{columns, timestamp_from_fields, SampleRecord, SampleValue};
use crate::header::{Header, HeaderError};
use crate::keys::SlotKind;
use crate::packcode::{FieldType, Layout, PackCode, TIMESTAMP_FIELDS};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Value written when a field cannot be coerced to its type.
pub const SENTINEL: i64 = 999_999;

/// Frame encoding errors.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("pack code expects {expected} fields, got {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Frame and buffer file decoding errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is {found} bytes, pack code needs {expected}")]
    Truncated { expected: usize, found: usize },

    #[error("frame timestamp {0:?} is not a valid date")]
    InvalidTimestamp([i64; 7]),

    #[error("frame field #{0} has the wrong type for its key")]
    TypeMismatch(usize),

    #[error("buffer file has no header line")]
    MissingHeader,

    #[error("header: {0}")]
    Header(#[from] HeaderError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A value read back from a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FrameValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            FrameValue::Integer(v) => Some(*v as f64),
            FrameValue::Float(v) => Some(*v),
            FrameValue::Text(_) => None,
        }
    }
}

/// Encode one frame from its 7 timestamp fields and wire values.
pub fn encode(pack: &PackCode, timestamp: &[&str], values: &[&str]) -> Result<Vec<u8>, EncodeError> {
    let found = timestamp.len() + values.len();
    if timestamp.len() != TIMESTAMP_FIELDS || found != pack.field_count() {
        return Err(EncodeError::FieldCount {
            expected: pack.field_count(),
            found,
        });
    }

    let mut buf = Vec::with_capacity(pack.frame_width());
    let mut fields = timestamp.iter().chain(values.iter());
    for item in pack.layout() {
        match item {
            Layout::Pad(n) => buf.extend(std::iter::repeat(0u8).take(*n)),
            Layout::Field(ty) => {
                // field count checked above
                let raw = fields.next().copied().unwrap_or_default();
                write_field(&mut buf, *ty, raw)?;
            }
        }
    }
    Ok(buf)
}

/// Encode one data line (`,`-separated, timestamp first).
pub fn encode_line(pack: &PackCode, line: &str) -> Result<Vec<u8>, EncodeError> {
    let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
    let split = fields.len().min(TIMESTAMP_FIELDS);
    encode(pack, &fields[..split], &fields[split..])
}

fn write_field(buf: &mut Vec<u8>, ty: FieldType, raw: &str) -> io::Result<()> {
    match ty {
        FieldType::F32 => buf.write_f32::<LittleEndian>(coerce_float(raw) as f32),
        FieldType::F64 => buf.write_f64::<LittleEndian>(coerce_float(raw)),
        FieldType::Str(len) => {
            let mut bytes = raw.as_bytes().to_vec();
            bytes.resize(len, 0);
            buf.write_all(&bytes)
        }
        FieldType::Char => buf.write_u8(raw.as_bytes().first().copied().unwrap_or(0)),
        _ => {
            let v = coerce_integer(ty, raw);
            match ty {
                FieldType::I8 => buf.write_i8(v as i8),
                FieldType::U8 | FieldType::Bool => buf.write_u8(v as u8),
                FieldType::I16 => buf.write_i16::<LittleEndian>(v as i16),
                FieldType::U16 => buf.write_u16::<LittleEndian>(v as u16),
                FieldType::I32 => buf.write_i32::<LittleEndian>(v as i32),
                FieldType::U32 => buf.write_u32::<LittleEndian>(v as u32),
                FieldType::I64 => buf.write_i64::<LittleEndian>(v as i64),
                _ => buf.write_u64::<LittleEndian>(v as u64),
            }
        }
    }
}

/// Coerce a wire value to an integer of `ty`, degrading to the sentinel.
fn coerce_integer(ty: FieldType, raw: &str) -> i128 {
    let (min, max) = ty.integer_range().unwrap_or((i64::MIN as i128, i64::MAX as i128));
    let parsed = raw.parse::<i128>().ok().or_else(|| {
        raw.parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|f| f.trunc() as i128)
    });
    match parsed {
        Some(v) if (min..=max).contains(&v) => v,
        _ => (SENTINEL as i128).clamp(min, max),
    }
}

fn coerce_float(raw: &str) -> f64 {
    raw.parse::<f64>().unwrap_or(SENTINEL as f64)
}

/// Decode the fields of one frame.
pub fn decode_frame(pack: &PackCode, frame: &[u8]) -> Result<Vec<FrameValue>, FrameError> {
    if frame.len() < pack.frame_width() {
        return Err(FrameError::Truncated {
            expected: pack.frame_width(),
            found: frame.len(),
        });
    }

    let mut cursor = Cursor::new(frame);
    let mut values = Vec::with_capacity(pack.field_count());
    for item in pack.layout() {
        let ty = match item {
            Layout::Pad(n) => {
                cursor.set_position(cursor.position() + *n as u64);
                continue;
            }
            Layout::Field(ty) => *ty,
        };
        let value = match ty {
            FieldType::I8 => FrameValue::Integer(cursor.read_i8()? as i64),
            FieldType::U8 | FieldType::Bool => FrameValue::Integer(cursor.read_u8()? as i64),
            FieldType::I16 => FrameValue::Integer(cursor.read_i16::<LittleEndian>()? as i64),
            FieldType::U16 => FrameValue::Integer(cursor.read_u16::<LittleEndian>()? as i64),
            FieldType::I32 => FrameValue::Integer(cursor.read_i32::<LittleEndian>()? as i64),
            FieldType::U32 => FrameValue::Integer(cursor.read_u32::<LittleEndian>()? as i64),
            FieldType::I64 => FrameValue::Integer(cursor.read_i64::<LittleEndian>()?),
            FieldType::U64 => FrameValue::Integer(cursor.read_u64::<LittleEndian>()? as i64),
            FieldType::F32 => FrameValue::Float(cursor.read_f32::<LittleEndian>()? as f64),
            FieldType::F64 => FrameValue::Float(cursor.read_f64::<LittleEndian>()?),
            FieldType::Char => FrameValue::Text((cursor.read_u8()? as char).to_string()),
            FieldType::Str(len) => {
                let mut bytes = vec![0u8; len];
                cursor.read_exact(&mut bytes)?;
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(len);
                FrameValue::Text(String::from_utf8_lossy(&bytes[..end]).into_owned())
            }
        };
        values.push(value);
    }
    Ok(values)
}

/// Decode a frame into a record scaled by the header multipliers.
pub fn decode_frame_record(header: &Header, frame: &[u8]) -> Result<SampleRecord, FrameError> {
    let values = decode_frame(&header.pack_code, frame)?;

    let mut parts = [0i64; 7];
    for (index, slot) in parts.iter_mut().enumerate() {
        *slot = match values.get(index) {
            Some(FrameValue::Integer(v)) => *v,
            _ => return Err(FrameError::TypeMismatch(index)),
        };
    }
    let timestamp = timestamp_from_fields(parts).ok_or(FrameError::InvalidTimestamp(parts))?;

    let data = &values[TIMESTAMP_FIELDS.min(values.len())..];
    let mut out = Vec::new();
    for column in columns(header) {
        let field = TIMESTAMP_FIELDS + column.position;
        let value = data
            .get(column.position)
            .ok_or(FrameError::TypeMismatch(field))?;
        out.push(match column.kind {
            SlotKind::Numeric => {
                let v = value.as_f64().ok_or(FrameError::TypeMismatch(field))?;
                SampleValue::Number(v / column.multiplier)
            }
            SlotKind::Text => match value {
                FrameValue::Text(s) => SampleValue::Text(s.clone()),
                FrameValue::Integer(v) => SampleValue::Text(v.to_string()),
                FrameValue::Float(v) => SampleValue::Text(v.to_string()),
            },
        });
    }

    Ok(SampleRecord {
        timestamp,
        values: out,
    })
}

/// The header comment line written once per buffer file.
pub fn file_header_line(header_line: &str) -> String {
    let mut line = header_line.trim_end().to_string();
    line.push('\n');
    line
}

/// Append one frame and its newline terminator.
pub fn write_frame<W: Write>(w: &mut W, frame: &[u8]) -> io::Result<()> {
    w.write_all(frame)?;
    w.write_all(b"\n")
}

/// A buffer file read back from disk.
#[derive(Debug, Clone)]
pub struct BufferFile {
    pub header: Header,
    pub frames: Vec<Vec<u8>>,
}

impl BufferFile {
    /// Read a buffer file.
    pub fn read(path: &Path) -> Result<Self, FrameError> {
        Self::from_bytes(&fs::read(path)?)
    }

    /// Parse buffer file contents.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let newline = bytes
            .iter()
            .position(|b| *b == b'\n')
            .ok_or(FrameError::MissingHeader)?;
        let header = Header::parse(&String::from_utf8_lossy(&bytes[..newline]))?;
        let width = header.pack_code.frame_width();

        let mut frames = Vec::new();
        let mut rest = &bytes[newline + 1..];
        while !rest.is_empty() {
            if rest.len() < width {
                return Err(FrameError::Truncated {
                    expected: width,
                    found: rest.len(),
                });
            }
            frames.push(rest[..width].to_vec());
            rest = &rest[width..];
            if rest.first() == Some(&b'\n') {
                rest = &rest[1..];
            }
        }
        Ok(Self { header, frames })
    }

    /// Decode every frame into a record.
    pub fn records(&self) -> Result<Vec<SampleRecord>, FrameError> {
        self.frames
            .iter()
            .map(|frame| decode_frame_record(&self.header, frame))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packcode::PackCodeError;

    fn pack() -> PackCode {
        PackCode::parse("<6hLll").unwrap()
    }

    #[test]
    fn test_encode_layout() {
        let frame = encode_line(&pack(), "2024,1,2,3,4,5,6,21350,-48900").unwrap();
        assert_eq!(frame.len(), 24);
        assert_eq!(&frame[0..2], &2024i16.to_le_bytes());
        assert_eq!(&frame[12..16], &6u32.to_le_bytes());
        assert_eq!(&frame[16..20], &21350i32.to_le_bytes());
        assert_eq!(&frame[20..24], &(-48900i32).to_le_bytes());
    }

    #[test]
    fn test_field_count_mismatch() {
        let err = encode_line(&pack(), "2024,1,2,3,4,5,6,1").unwrap_err();
        assert!(matches!(err, EncodeError::FieldCount { expected: 9, found: 8 }));
    }

    #[test]
    fn test_uncoercible_value_becomes_sentinel() {
        let frame = encode_line(&pack(), "2024,1,2,3,4,5,6,nan?,12.7").unwrap();
        let values = decode_frame(&pack(), &frame).unwrap();
        assert_eq!(values[7], FrameValue::Integer(SENTINEL));
        assert_eq!(values[8], FrameValue::Integer(12));
    }

    #[test]
    fn test_out_of_range_is_clamped_sentinel() {
        let frame = encode_line(&pack(), "99999,1,2,3,4,5,6,1,2").unwrap();
        let values = decode_frame(&pack(), &frame).unwrap();
        assert_eq!(values[0], FrameValue::Integer(i16::MAX as i64));
    }

    #[test]
    fn test_string_field_padded_and_truncated() {
        let pack = PackCode::parse("<6hL4s").unwrap();
        let frame = encode_line(&pack, "2024,1,1,0,0,0,0,ab").unwrap();
        assert_eq!(&frame[16..20], b"ab\0\0");
        let frame = encode_line(&pack, "2024,1,1,0,0,0,0,abcdef").unwrap();
        assert_eq!(&frame[16..20], b"abcd");
        let values = decode_frame(&pack, &frame).unwrap();
        assert_eq!(values[7], FrameValue::Text("abcd".into()));
    }

    #[test]
    fn test_truncated_frame() {
        let err = decode_frame(&pack(), &[0u8; 10]).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { expected: 24, found: 10 }));
    }

    #[test]
    fn test_frame_record_is_scaled() {
        let header = Header::parse("# MAGBIN 1 S1 [t1,x] [T,X] [degC,nT] [1000,1000] <6hLll 24").unwrap();
        let frame = encode_line(&header.pack_code, "2024,01,01,00,00,00,0,21350,48900").unwrap();
        let record = decode_frame_record(&header, &frame).unwrap();
        assert_eq!(record.values, vec![SampleValue::Number(21.35), SampleValue::Number(48.9)]);
    }

    #[test]
    fn test_buffer_file_with_newline_bytes_in_frames() {
        let header = "# MagPyBin S1 [x] [X] [nT] [1] <6hLl 20";
        let code = PackCode::parse("<6hLl").unwrap();
        let mut bytes = file_header_line(header).into_bytes();
        // 10 encodes as a newline byte inside the frame
        for line in ["2024,1,1,0,0,0,0,10", "2024,1,1,0,0,1,0,266"] {
            let frame = encode_line(&code, line).unwrap();
            write_frame(&mut bytes, &frame).unwrap();
        }

        let file = BufferFile::from_bytes(&bytes).unwrap();
        assert_eq!(file.frames.len(), 2);
        let records = file.records().unwrap();
        assert_eq!(records[0].values, vec![SampleValue::Number(10.0)]);
        assert_eq!(records[1].values, vec![SampleValue::Number(266.0)]);
    }

    #[test]
    fn test_buffer_file_without_header() {
        assert!(matches!(
            BufferFile::from_bytes(b"no newline"),
            Err(FrameError::MissingHeader)
        ));
    }

    #[test]
    fn test_buffer_file_with_zero_width_pack_code() {
        let bytes = b"# MagPyBin S1 [x] [X] [nT] [1] <0s0s0s0s0s0s0s 0\n\n\n";
        assert!(matches!(
            BufferFile::from_bytes(bytes),
            Err(FrameError::Header(HeaderError::PackCode(PackCodeError::ZeroWidth)))
        ));
    }
}
