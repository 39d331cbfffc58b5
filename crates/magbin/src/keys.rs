// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed slot vocabulary of the MagPy time-series container.
//!
//! Every sensor header names its columns with keys from this list. Keys
//! outside the vocabulary are dropped while decoding.

/// All slot keys, in container order. `time` is always slot 0.
pub const KEYS: [&str; 24] = [
    "time", "x", "y", "z", "f", "t1", "t2", "var1", "var2", "var3", "var4", "var5", "dx", "dy",
    "dz", "df", "str1", "str2", "str3", "str4", "flag", "comment", "typ", "sectime",
];

/// Keys that carry numeric, multiplier-scaled values.
pub const NUMERIC_KEYS: [&str; 15] = [
    "x", "y", "z", "f", "t1", "t2", "var1", "var2", "var3", "var4", "var5", "dx", "dy", "dz", "df",
];

/// Kind of value a slot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Scaled by the header multiplier.
    Numeric,
    /// Passed through unscaled.
    Text,
}

/// Position of `key` in the container vocabulary.
pub fn slot_index(key: &str) -> Option<usize> {
    KEYS.iter().position(|k| *k == key)
}

/// Whether `key` is a numeric slot.
pub fn is_numeric(key: &str) -> bool {
    NUMERIC_KEYS.contains(&key)
}

/// Classify a header key.
///
/// Returns `None` for keys the decoder drops: unknown keys and the
/// time-like slots (`time`, `sectime`), which are carried by the
/// timestamp fields instead.
pub fn slot_kind(key: &str) -> Option<SlotKind> {
    if slot_index(key).is_none() || key.ends_with("time") {
        return None;
    }
    if is_numeric(key) {
        Some(SlotKind::Numeric)
    } else {
        Some(SlotKind::Text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_keys_are_in_vocabulary() {
        for key in NUMERIC_KEYS {
            assert!(slot_index(key).is_some(), "{} missing", key);
        }
    }

    #[test]
    fn test_slot_kind() {
        assert_eq!(slot_kind("x"), Some(SlotKind::Numeric));
        assert_eq!(slot_kind("var5"), Some(SlotKind::Numeric));
        assert_eq!(slot_kind("str1"), Some(SlotKind::Text));
        assert_eq!(slot_kind("comment"), Some(SlotKind::Text));
        assert_eq!(slot_kind("sectime"), None);
        assert_eq!(slot_kind("time"), None);
        assert_eq!(slot_kind("humidity"), None);
    }

    #[test]
    fn test_slot_index_order() {
        assert_eq!(slot_index("time"), Some(0));
        assert_eq!(slot_index("x"), Some(1));
        assert_eq!(slot_index("sectime"), Some(23));
    }
}
