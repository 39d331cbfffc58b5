// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pack codes: compact struct-layout descriptors for binary frames.
//!
//! A pack code is a little-endian, unaligned layout string such as
//! `<6hLll`: a byte-order marker followed by format characters, each
//! optionally prefixed by a repeat count. For `s` the count is the string
//! length in bytes, for `x` it is the number of padding bytes.
//!
//! Device headers that omit the `<` marker use the legacy layout: the
//! marker is assumed and a trailing `B` status byte is appended. That
//! status byte counts towards the declared frame width but is never part
//! of the encoded frame.

use std::fmt;
use thiserror::Error;

/// Little-endian byte-order marker.
pub const LITTLE_ENDIAN_MARKER: char = '<';

/// Suffix appended to legacy pack codes.
pub const LEGACY_SUFFIX: char = 'B';

/// Number of leading timestamp fields (6 shorts + 1 long).
pub const TIMESTAMP_FIELDS: usize = 7;

/// Largest repeat count accepted before a format character.
pub const MAX_REPEAT: usize = 4096;

/// Largest encoded frame, in bytes.
pub const MAX_FRAME_WIDTH: usize = 65_536;

/// Pack code parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PackCodeError {
    #[error("empty pack code")]
    Empty,

    #[error("unsupported format character '{0}' in pack code")]
    UnsupportedFormat(char),

    #[error("repeat count without format character in pack code")]
    DanglingCount,

    #[error("pack code declares {0} fields, fewer than the 7 timestamp fields")]
    TooFewFields(usize),

    #[error("repeat count in pack code exceeds {max}", max = MAX_REPEAT)]
    CountTooLarge,

    #[error("pack code frame exceeds {max} bytes", max = MAX_FRAME_WIDTH)]
    FrameTooWide,

    #[error("pack code encodes zero-width frames")]
    ZeroWidth,
}

/// Primitive field type of a pack code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Char,
    Bool,
    /// Fixed-length byte string.
    Str(usize),
}

impl FieldType {
    /// Encoded width in bytes.
    pub fn width(&self) -> usize {
        match self {
            FieldType::I8 | FieldType::U8 | FieldType::Char | FieldType::Bool => 1,
            FieldType::I16 | FieldType::U16 => 2,
            FieldType::I32 | FieldType::U32 | FieldType::F32 => 4,
            FieldType::I64 | FieldType::U64 | FieldType::F64 => 8,
            FieldType::Str(len) => *len,
        }
    }

    /// Whether the field holds an integer.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            FieldType::I8
                | FieldType::U8
                | FieldType::I16
                | FieldType::U16
                | FieldType::I32
                | FieldType::U32
                | FieldType::I64
                | FieldType::U64
                | FieldType::Bool
        )
    }

    /// Whether the field holds a float.
    pub fn is_float(&self) -> bool {
        matches!(self, FieldType::F32 | FieldType::F64)
    }

    /// Inclusive integer range of the field type.
    pub fn integer_range(&self) -> Option<(i128, i128)> {
        let range = match self {
            FieldType::I8 => (i8::MIN as i128, i8::MAX as i128),
            FieldType::U8 => (0, u8::MAX as i128),
            FieldType::I16 => (i16::MIN as i128, i16::MAX as i128),
            FieldType::U16 => (0, u16::MAX as i128),
            FieldType::I32 => (i32::MIN as i128, i32::MAX as i128),
            FieldType::U32 => (0, u32::MAX as i128),
            FieldType::I64 => (i64::MIN as i128, i64::MAX as i128),
            FieldType::U64 => (0, u64::MAX as i128),
            FieldType::Bool => (0, 1),
            _ => return None,
        };
        Some(range)
    }

    fn from_char(c: char) -> Option<Self> {
        let ty = match c {
            'b' => FieldType::I8,
            'B' => FieldType::U8,
            'h' => FieldType::I16,
            'H' => FieldType::U16,
            'i' | 'l' => FieldType::I32,
            'I' | 'L' => FieldType::U32,
            'q' => FieldType::I64,
            'Q' => FieldType::U64,
            'f' => FieldType::F32,
            'd' => FieldType::F64,
            'c' => FieldType::Char,
            '?' => FieldType::Bool,
            _ => return None,
        };
        Some(ty)
    }
}

/// One element of a parsed layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// A value-carrying field.
    Field(FieldType),
    /// Padding bytes, no value.
    Pad(usize),
}

impl Layout {
    fn width(&self) -> usize {
        match self {
            Layout::Field(ty) => ty.width(),
            Layout::Pad(n) => *n,
        }
    }
}

/// A parsed pack code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackCode {
    source: String,
    layout: Vec<Layout>,
    legacy_suffix: bool,
}

impl PackCode {
    /// Parse a frame pack code (leading `<` optional, no legacy handling).
    pub fn parse(code: &str) -> Result<Self, PackCodeError> {
        let body = code.trim().trim_start_matches(LITTLE_ENDIAN_MARKER);
        let layout = parse_layout(body)?;
        let fields = layout
            .iter()
            .filter(|l| matches!(l, Layout::Field(_)))
            .count();
        if fields < TIMESTAMP_FIELDS {
            return Err(PackCodeError::TooFewFields(fields));
        }
        if layout.iter().all(|l| l.width() == 0) {
            return Err(PackCodeError::ZeroWidth);
        }
        Ok(Self {
            source: body.to_string(),
            layout,
            legacy_suffix: false,
        })
    }

    /// Parse the pack-code token of a device header.
    ///
    /// Without the `<` marker the legacy layout is assumed: the marker is
    /// added and a trailing `B` status byte is declared.
    pub fn from_header_token(token: &str) -> Result<Self, PackCodeError> {
        let token = token.trim();
        if token.starts_with(LITTLE_ENDIAN_MARKER) {
            Self::parse(token)
        } else {
            let mut code = Self::parse(token)?;
            code.legacy_suffix = true;
            Ok(code)
        }
    }

    /// Layout used to encode frames.
    pub fn layout(&self) -> &[Layout] {
        &self.layout
    }

    /// Value-carrying fields, in order.
    pub fn fields(&self) -> impl Iterator<Item = FieldType> + '_ {
        self.layout.iter().filter_map(|l| match l {
            Layout::Field(ty) => Some(*ty),
            Layout::Pad(_) => None,
        })
    }

    /// Number of value-carrying fields, timestamp included.
    pub fn field_count(&self) -> usize {
        self.fields().count()
    }

    /// Number of data values after the timestamp.
    pub fn value_count(&self) -> usize {
        self.field_count().saturating_sub(TIMESTAMP_FIELDS)
    }

    /// Width in bytes of an encoded frame.
    pub fn frame_width(&self) -> usize {
        self.layout.iter().map(Layout::width).sum()
    }

    /// Width the header should declare (frame plus legacy status byte).
    pub fn declared_width(&self) -> usize {
        self.frame_width() + usize::from(self.legacy_suffix)
    }

    /// Whether the legacy status byte was assumed.
    pub fn is_legacy(&self) -> bool {
        self.legacy_suffix
    }

    /// Canonical header form: `<` + layout, plus `B` for legacy codes.
    pub fn header_code(&self) -> String {
        let mut s = String::with_capacity(self.source.len() + 2);
        s.push(LITTLE_ENDIAN_MARKER);
        s.push_str(&self.source);
        if self.legacy_suffix {
            s.push(LEGACY_SUFFIX);
        }
        s
    }

    /// Frame layout without marker or legacy suffix.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for PackCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header_code())
    }
}

fn parse_layout(body: &str) -> Result<Vec<Layout>, PackCodeError> {
    if body.is_empty() {
        return Err(PackCodeError::Empty);
    }

    let mut layout = Vec::new();
    let mut count: Option<usize> = None;
    let mut width = 0usize;

    for c in body.chars() {
        if let Some(digit) = c.to_digit(10) {
            let next = count.unwrap_or(0) * 10 + digit as usize;
            if next > MAX_REPEAT {
                return Err(PackCodeError::CountTooLarge);
            }
            count = Some(next);
            continue;
        }
        if c.is_whitespace() {
            continue;
        }
        let n = count.take().unwrap_or(1);
        let (item, repeat) = match c {
            's' => (Layout::Field(FieldType::Str(n)), 1),
            'x' => (Layout::Pad(n), 1),
            _ => {
                let ty = FieldType::from_char(c).ok_or(PackCodeError::UnsupportedFormat(c))?;
                (Layout::Field(ty), n)
            }
        };
        width += item.width() * repeat;
        if width > MAX_FRAME_WIDTH {
            return Err(PackCodeError::FrameTooWide);
        }
        layout.extend(std::iter::repeat(item).take(repeat));
    }

    if count.is_some() {
        return Err(PackCodeError::DanglingCount);
    }
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_standard_code() {
        let code = PackCode::parse("<6hLll").unwrap();
        assert_eq!(code.field_count(), 9);
        assert_eq!(code.value_count(), 2);
        assert_eq!(code.frame_width(), 24);
        assert_eq!(code.declared_width(), 24);
        assert!(!code.is_legacy());
        assert_eq!(code.to_string(), "<6hLll");
    }

    #[test]
    fn test_legacy_header_token() {
        let code = PackCode::from_header_token("6hLLl").unwrap();
        assert!(code.is_legacy());
        assert_eq!(code.frame_width(), 24);
        assert_eq!(code.declared_width(), 25);
        assert_eq!(code.header_code(), "<6hLLlB");
        assert_eq!(code.as_str(), "6hLLl");
    }

    #[test]
    fn test_string_and_padding() {
        let code = PackCode::parse("<6hL10sxl").unwrap();
        assert_eq!(code.value_count(), 2);
        assert_eq!(code.frame_width(), 16 + 10 + 1 + 4);
        let fields: Vec<_> = code.fields().skip(7).collect();
        assert_eq!(fields, vec![FieldType::Str(10), FieldType::I32]);
    }

    #[test]
    fn test_multi_digit_count() {
        let code = PackCode::parse("<6hL12q").unwrap();
        assert_eq!(code.value_count(), 12);
        assert_eq!(code.frame_width(), 16 + 96);
    }

    #[test]
    fn test_errors() {
        assert_eq!(PackCode::parse("<"), Err(PackCodeError::Empty));
        assert_eq!(
            PackCode::parse("<6hLz"),
            Err(PackCodeError::UnsupportedFormat('z'))
        );
        assert_eq!(PackCode::parse("<6hL3"), Err(PackCodeError::DanglingCount));
        assert_eq!(PackCode::parse("<3h"), Err(PackCodeError::TooFewFields(3)));
    }

    #[test]
    fn test_oversized_counts_are_rejected() {
        assert_eq!(
            PackCode::parse("<6hL99999999999999999999l"),
            Err(PackCodeError::CountTooLarge)
        );
        assert_eq!(
            PackCode::parse("<6hL4000000000l"),
            Err(PackCodeError::CountTooLarge)
        );
        assert_eq!(
            PackCode::parse("<6hL4096s4096s4096s4096s4096s4096s4096s4096s4096s4096s4096s4096s4096s4096s4096s4096s4096s"),
            Err(PackCodeError::FrameTooWide)
        );
        let code = PackCode::parse("<6hL4096s").unwrap();
        assert_eq!(code.frame_width(), 16 + 4096);
    }

    #[test]
    fn test_zero_width_frame_is_rejected() {
        assert_eq!(
            PackCode::parse("<0s0s0s0s0s0s0s"),
            Err(PackCodeError::ZeroWidth)
        );
        assert_eq!(
            PackCode::from_header_token("0s0s0s0s0s0s0s0x"),
            Err(PackCodeError::ZeroWidth)
        );
    }

    #[test]
    fn test_integer_range() {
        assert_eq!(FieldType::I16.integer_range(), Some((-32768, 32767)));
        assert_eq!(FieldType::U32.integer_range(), Some((0, 4294967295)));
        assert_eq!(FieldType::F32.integer_range(), None);
    }
}
