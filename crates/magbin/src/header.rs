// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Meta header lines.
//!
//! ```text
//! # MagPyBin LEMI036_1_0002 [x,y,z] [X,Y,Z] [nT,nT,nT] [1000,1000,1000] <6hLlll 28
//! ^marker    ^sensor id     ^keys   ^elements ^units  ^multipliers     ^pack  ^bytes
//! ```
//!
//! Everything between the marker and the sensor id is kept as version
//! tokens. The header is also the first line of every buffer file.

use crate::packcode::{PackCode, PackCodeError};
use std::fmt;
use thiserror::Error;

/// Marker used by headers this crate produces.
pub const HEADER_MARKER: &str = "# MagPyBin";

/// Substitutions applied to device headers before tokenising.
const CLEANUPS: [(&str, &str); 3] = [(", ", ","), ("deg C", "deg"), ("T (out", "T(out")];

/// Header parsing errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HeaderError {
    #[error("header has no bracketed key list")]
    MissingKeys,

    #[error("header has no sensor id before the key list")]
    MissingSensor,

    #[error("header list #{0} is not bracketed")]
    MissingList(usize),

    #[error("header lists differ in length: {keys} keys, {elements} elements, {units} units, {multipliers} multipliers")]
    UnbalancedLists {
        keys: usize,
        elements: usize,
        units: usize,
        multipliers: usize,
    },

    #[error("invalid multiplier '{0}'")]
    InvalidMultiplier(String),

    #[error("header has no pack code")]
    MissingPackCode,

    #[error("invalid declared length '{0}'")]
    InvalidLength(String),

    #[error("pack code: {0}")]
    PackCode(#[from] PackCodeError),
}

/// A parsed meta header.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    raw: String,
    /// First token, e.g. `#`.
    pub marker: String,
    /// Tokens between marker and sensor id.
    pub version: Vec<String>,
    /// Sensor id embedded in the header.
    pub sensor_id: String,
    /// Slot keys, in column order.
    pub keys: Vec<String>,
    /// Element names, aligned with `keys`.
    pub elements: Vec<String>,
    /// Units, aligned with `keys`.
    pub units: Vec<String>,
    /// Multipliers, aligned with `keys`.
    pub multipliers: Vec<f64>,
    /// Binary layout.
    pub pack_code: PackCode,
    /// Byte length declared by the device.
    pub declared_length: Option<usize>,
}

impl Header {
    /// Parse a header line.
    pub fn parse(line: &str) -> Result<Self, HeaderError> {
        let cleaned = clean(line);
        let text = cleaned.trim();

        let open = text.find('[').ok_or(HeaderError::MissingKeys)?;
        let mut prefix: Vec<&str> = text[..open].split_whitespace().collect();
        let sensor_id = prefix.pop().ok_or(HeaderError::MissingSensor)?.to_string();
        let marker = if prefix.is_empty() {
            String::new()
        } else {
            prefix.remove(0).to_string()
        };
        let version = prefix.into_iter().map(str::to_string).collect();

        let mut rest = &text[open..];
        let mut lists = Vec::with_capacity(4);
        for index in 0..4 {
            let (items, tail) = take_list(rest).ok_or(HeaderError::MissingList(index))?;
            lists.push(items);
            rest = tail;
        }

        let mut tail = rest.split_whitespace();
        let pack_token = tail.next().ok_or(HeaderError::MissingPackCode)?;
        let pack_code = PackCode::from_header_token(pack_token)?;
        let declared_length = match tail.next() {
            Some(token) => Some(
                token
                    .parse::<usize>()
                    .map_err(|_| HeaderError::InvalidLength(token.to_string()))?,
            ),
            None => None,
        };

        let mut lists = lists.into_iter();
        let keys = lists.next().unwrap_or_default();
        let elements = lists.next().unwrap_or_default();
        let units = lists.next().unwrap_or_default();
        let multipliers = lists
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(|m| {
                m.parse::<f64>()
                    .map_err(|_| HeaderError::InvalidMultiplier(m.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if elements.len() != keys.len()
            || units.len() != keys.len()
            || multipliers.len() != keys.len()
        {
            return Err(HeaderError::UnbalancedLists {
                keys: keys.len(),
                elements: elements.len(),
                units: units.len(),
                multipliers: multipliers.len(),
            });
        }

        Ok(Self {
            raw: text.to_string(),
            marker,
            version,
            sensor_id,
            keys,
            elements,
            units,
            multipliers,
            pack_code,
            declared_length,
        })
    }

    /// Build a header for a derived channel.
    pub fn synthetic(
        sensor_id: &str,
        keys: Vec<String>,
        elements: Vec<String>,
        units: Vec<String>,
        multipliers: Vec<f64>,
        pack_code: PackCode,
    ) -> Self {
        let declared_length = Some(pack_code.declared_width());
        let mut header = Self {
            raw: String::new(),
            marker: "#".to_string(),
            version: vec!["MagPyBin".to_string()],
            sensor_id: sensor_id.to_string(),
            keys,
            elements,
            units,
            multipliers,
            pack_code,
            declared_length,
        };
        header.raw = header.to_string();
        header
    }

    /// Header line as received (after cleanup).
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Declared and computed widths, when they disagree.
    pub fn length_mismatch(&self) -> Option<(usize, usize)> {
        let computed = self.pack_code.declared_width();
        match self.declared_length {
            Some(declared) if declared != computed => Some((declared, computed)),
            _ => None,
        }
    }

    /// Multiplier for column `index`; zero is treated as one.
    pub fn multiplier(&self, index: usize) -> f64 {
        match self.multipliers.get(index) {
            Some(m) if *m != 0.0 => *m,
            _ => 1.0,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.marker.is_empty() {
            write!(f, "{} ", self.marker)?;
        }
        for token in &self.version {
            write!(f, "{} ", token)?;
        }
        let multipliers: Vec<String> = self.multipliers.iter().map(|m| format_number(*m)).collect();
        write!(
            f,
            "{} [{}] [{}] [{}] [{}] {}",
            self.sensor_id,
            self.keys.join(","),
            self.elements.join(","),
            self.units.join(","),
            multipliers.join(","),
            self.pack_code
        )?;
        if let Some(length) = self.declared_length {
            write!(f, " {}", length)?;
        }
        Ok(())
    }
}

/// Pack code of a header line, with the legacy default applied.
pub fn derive_header_pack_code(line: &str) -> Result<PackCode, HeaderError> {
    Ok(Header::parse(line)?.pack_code)
}

/// Apply the device header substitutions.
pub fn clean(line: &str) -> String {
    CLEANUPS
        .iter()
        .fold(line.to_string(), |acc, (from, to)| acc.replace(from, to))
}

/// Render a number without a trailing `.0` when integral.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Split one `[a,b,c]` group off the front of `text`.
fn take_list(text: &str) -> Option<(Vec<String>, &str)> {
    let text = text.trim_start();
    let body = text.strip_prefix('[')?;
    let close = body.find(']')?;
    let inner = body[..close].trim();
    let items = if inner.is_empty() {
        Vec::new()
    } else {
        inner.split(',').map(|s| s.trim().to_string()).collect()
    };
    Some((items, &body[close + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = "# MAGBIN 1 S1 [t1,x] [T,X] [degC,nT] [1000,1000] <6hLll 24";

    #[test]
    fn test_parse_header() {
        let header = Header::parse(LINE).unwrap();
        assert_eq!(header.marker, "#");
        assert_eq!(header.version, vec!["MAGBIN", "1"]);
        assert_eq!(header.sensor_id, "S1");
        assert_eq!(header.keys, vec!["t1", "x"]);
        assert_eq!(header.elements, vec!["T", "X"]);
        assert_eq!(header.units, vec!["degC", "nT"]);
        assert_eq!(header.multipliers, vec![1000.0, 1000.0]);
        assert_eq!(header.pack_code.value_count(), 2);
        assert_eq!(header.declared_length, Some(24));
        assert_eq!(header.length_mismatch(), None);
    }

    #[test]
    fn test_cleanup_before_tokenising() {
        let line = "# MagPyBin ENV_1_0001 [t1, var1] [T (out),RH] [deg C,per] [100,100] <6hLll 24";
        let header = Header::parse(line).unwrap();
        assert_eq!(header.keys, vec!["t1", "var1"]);
        assert_eq!(header.elements, vec!["T(out)", "RH"]);
        assert_eq!(header.units, vec!["deg", "per"]);
    }

    #[test]
    fn test_legacy_pack_code() {
        let line = "# MagPyBin GSM19_1_0001 [f,var1] [f,err] [nT,none] [1000,1000] 6hLLl 25";
        let code = derive_header_pack_code(line).unwrap();
        assert!(code.is_legacy());
        assert_eq!(code.header_code(), "<6hLLlB");
        assert_eq!(Header::parse(line).unwrap().length_mismatch(), None);
    }

    #[test]
    fn test_length_mismatch_is_reported() {
        let line = "# MagPyBin S1 [x] [X] [nT] [1000] <6hLl 99";
        let header = Header::parse(line).unwrap();
        assert_eq!(header.length_mismatch(), Some((99, 20)));
    }

    #[test]
    fn test_unbalanced_lists() {
        let line = "# MagPyBin S1 [x,y] [X] [nT,nT] [1000,1000] <6hLll 24";
        assert!(matches!(
            Header::parse(line),
            Err(HeaderError::UnbalancedLists { keys: 2, elements: 1, .. })
        ));
    }

    #[test]
    fn test_missing_parts() {
        assert_eq!(Header::parse("# MagPyBin S1"), Err(HeaderError::MissingKeys));
        assert_eq!(
            Header::parse("[x] [X] [nT] [1] <6hLl 20"),
            Err(HeaderError::MissingSensor)
        );
        assert_eq!(
            Header::parse("# S1 [x] [X] [nT] [1]"),
            Err(HeaderError::MissingPackCode)
        );
        assert_eq!(
            Header::parse("# S1 [x] [X] [nT] [abc] <6hLl 20"),
            Err(HeaderError::InvalidMultiplier("abc".into()))
        );
    }

    #[test]
    fn test_synthetic_header_renders() {
        let pack = PackCode::parse("<6hLll").unwrap();
        let keys = vec!["x".to_string(), "y".to_string()];
        let header = Header::synthetic(
            "Diff_AB_0001",
            keys.clone(),
            keys,
            vec!["arb".into(), "arb".into()],
            vec![1000.0, 1000.0],
            pack,
        );
        assert_eq!(
            header.raw(),
            "# MagPyBin Diff_AB_0001 [x,y] [x,y] [arb,arb] [1000,1000] <6hLll 24"
        );
        assert_eq!(Header::parse(header.raw()).unwrap(), header);
    }

    #[test]
    fn test_multiplier_zero_is_one() {
        let header = Header::parse("# S1 [x] [X] [nT] [0] <6hLl 20").unwrap();
        assert_eq!(header.multiplier(0), 1.0);
        assert_eq!(header.multiplier(5), 1.0);
    }
}
