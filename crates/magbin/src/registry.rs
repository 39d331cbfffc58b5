// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol state store.
//!
//! One [`ChannelRegistry`] is owned per collector session. A channel moves
//! from unregistered to registered on its first meta header and to
//! described once a dict line has been merged. The first header wins;
//! later headers for the same sensor are ignored.

use crate::header::{Header, HeaderError};
use crate::keys::KEYS;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Dict value meaning "unset".
pub const UNSET: &str = "-";

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("topic sensor '{topic}' differs from header sensor '{header}'")]
    SensorMismatch { topic: String, header: String },

    #[error("sensor '{0}' has no registered header")]
    NotRegistered(String),

    #[error("invalid header for '{sensor}': {source}")]
    Header {
        sensor: String,
        #[source]
        source: HeaderError,
    },
}

/// Lifecycle state of a sensor channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unregistered,
    Registered,
    Described,
}

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The channel was created.
    New,
    /// The channel already existed; nothing changed.
    AlreadyRegistered,
}

/// A registered sensor channel.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Station the header arrived on.
    pub station: String,
    /// Schema of the channel.
    pub header: Header,
    /// Descriptive fields (header seeded, dict merged).
    pub fields: BTreeMap<String, String>,
    described: bool,
}

impl Channel {
    pub fn state(&self) -> ChannelState {
        if self.described {
            ChannelState::Described
        } else {
            ChannelState::Registered
        }
    }

    /// Descriptive field by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Registry of all sensor channels seen by a session.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sensor_id` from a meta header line.
    pub fn register(
        &mut self,
        station: &str,
        sensor_id: &str,
        header_line: &str,
    ) -> Result<Registration, RegistryError> {
        if self.channels.contains_key(sensor_id) {
            debug!(sensor = %sensor_id, "header already registered");
            return Ok(Registration::AlreadyRegistered);
        }

        let header = Header::parse(header_line).map_err(|source| RegistryError::Header {
            sensor: sensor_id.to_string(),
            source,
        })?;
        if header.sensor_id != sensor_id {
            return Err(RegistryError::SensorMismatch {
                topic: sensor_id.to_string(),
                header: header.sensor_id,
            });
        }

        Ok(self.register_header(station, header, BTreeMap::new()))
    }

    /// Register an already parsed header, merging `extra` descriptive
    /// fields over the seeded ones.
    pub fn register_header(
        &mut self,
        station: &str,
        header: Header,
        extra: BTreeMap<String, String>,
    ) -> Registration {
        if self.channels.contains_key(&header.sensor_id) {
            return Registration::AlreadyRegistered;
        }

        if let Some((declared, computed)) = header.length_mismatch() {
            warn!(
                sensor = %header.sensor_id,
                "declared frame length {} differs from pack code width {}",
                declared, computed
            );
        }

        let mut fields = seed_fields(station, &header);
        fields.extend(extra);
        info!(sensor = %header.sensor_id, keys = ?header.keys, "registered channel");

        let sensor_id = header.sensor_id.clone();
        self.channels.insert(
            sensor_id,
            Channel {
                station: station.to_string(),
                header,
                fields,
                described: false,
            },
        );
        Registration::New
    }

    /// Merge a dict line (`Key:Value,...`) into the channel's fields.
    ///
    /// Returns the number of fields set. `-` values are skipped.
    pub fn describe(&mut self, sensor_id: &str, dict_line: &str) -> Result<usize, RegistryError> {
        let channel = self
            .channels
            .get_mut(sensor_id)
            .ok_or_else(|| RegistryError::NotRegistered(sensor_id.to_string()))?;

        let mut merged = 0;
        for (key, value) in parse_dict(dict_line) {
            channel.fields.insert(key, value);
            merged += 1;
        }
        channel.described = true;
        debug!(sensor = %sensor_id, merged, "merged dict fields");
        Ok(merged)
    }

    pub fn get(&self, sensor_id: &str) -> Option<&Channel> {
        self.channels.get(sensor_id)
    }

    pub fn header(&self, sensor_id: &str) -> Option<&Header> {
        self.channels.get(sensor_id).map(|c| &c.header)
    }

    pub fn state(&self, sensor_id: &str) -> ChannelState {
        self.channels
            .get(sensor_id)
            .map(Channel::state)
            .unwrap_or(ChannelState::Unregistered)
    }

    pub fn is_registered(&self, sensor_id: &str) -> bool {
        self.channels.contains_key(sensor_id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Registered sensor ids, sorted.
    pub fn sensor_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.channels.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Parse a dict line into its set `(key, value)` pairs.
pub fn parse_dict(line: &str) -> Vec<(String, String)> {
    line.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once(':')?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value == UNSET {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

/// Descriptive fields derived from the header itself.
fn seed_fields(station: &str, header: &Header) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    fields.insert("SensorID".to_string(), header.sensor_id.clone());

    let mut parts = header.sensor_id.split('_');
    let names = ["SensorName", "SensorSerialNum", "SensorRevision"];
    for name in names {
        if let Some(part) = parts.next() {
            fields.insert(name.to_string(), part.to_string());
        }
    }

    fields.insert("SensorKeys".to_string(), header.keys.join(","));
    fields.insert("SensorElements".to_string(), header.elements.join(","));
    fields.insert("StationID".to_string(), station.to_uppercase());

    let mut contents = Vec::with_capacity(KEYS.len() - 1);
    let mut units = Vec::with_capacity(KEYS.len() - 1);
    for slot in KEYS.iter().skip(1) {
        match header.keys.iter().position(|k| k == slot) {
            Some(i) => {
                contents.push(header.elements[i].as_str());
                units.push(header.units[i].as_str());
            }
            None => {
                contents.push("");
                units.push("");
            }
        }
    }
    fields.insert("ColumnContents".to_string(), contents.join(","));
    fields.insert("ColumnUnits".to_string(), units.join(","));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    const META: &str = "# MagPyBin LEMI036_1_0002 [x,y] [X,Y] [nT,nT] [1000,1000] <6hLll 24";

    #[test]
    fn test_register_and_seed_fields() {
        let mut registry = ChannelRegistry::new();
        assert_eq!(
            registry.register("wic", "LEMI036_1_0002", META),
            Ok(Registration::New)
        );
        let channel = registry.get("LEMI036_1_0002").unwrap();
        assert_eq!(channel.state(), ChannelState::Registered);
        assert_eq!(channel.field("SensorName"), Some("LEMI036"));
        assert_eq!(channel.field("SensorSerialNum"), Some("1"));
        assert_eq!(channel.field("SensorRevision"), Some("0002"));
        assert_eq!(channel.field("StationID"), Some("WIC"));
        assert_eq!(channel.field("SensorKeys"), Some("x,y"));
        assert!(channel.field("ColumnContents").unwrap().starts_with("X,Y,,"));
    }

    #[test]
    fn test_first_registration_wins() {
        let mut registry = ChannelRegistry::new();
        registry.register("wic", "LEMI036_1_0002", META).unwrap();
        let other = "# MagPyBin LEMI036_1_0002 [z] [Z] [nT] [1] <6hLl 20";
        assert_eq!(
            registry.register("wic", "LEMI036_1_0002", other),
            Ok(Registration::AlreadyRegistered)
        );
        assert_eq!(registry.header("LEMI036_1_0002").unwrap().keys, vec!["x", "y"]);
    }

    #[test]
    fn test_sensor_mismatch() {
        let mut registry = ChannelRegistry::new();
        let err = registry.register("wic", "OTHER_1_0001", META).unwrap_err();
        assert_eq!(
            err,
            RegistryError::SensorMismatch {
                topic: "OTHER_1_0001".into(),
                header: "LEMI036_1_0002".into()
            }
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_describe_merges_and_skips_unset() {
        let mut registry = ChannelRegistry::new();
        registry.register("wic", "LEMI036_1_0002", META).unwrap();
        let merged = registry
            .describe("LEMI036_1_0002", "PierID:A2,Module:-")
            .unwrap();
        assert_eq!(merged, 1);
        registry.describe("LEMI036_1_0002", "Group: mag ").unwrap();

        let channel = registry.get("LEMI036_1_0002").unwrap();
        assert_eq!(channel.state(), ChannelState::Described);
        assert_eq!(channel.field("PierID"), Some("A2"));
        assert_eq!(channel.field("Group"), Some("mag"));
        assert_eq!(channel.field("Module"), None);
    }

    #[test]
    fn test_describe_before_meta() {
        let mut registry = ChannelRegistry::new();
        assert_eq!(
            registry.describe("S1", "PierID:A2"),
            Err(RegistryError::NotRegistered("S1".into()))
        );
        assert_eq!(registry.state("S1"), ChannelState::Unregistered);
    }

    #[test]
    fn test_parse_dict_ignores_garbage() {
        let pairs = parse_dict("A:1,novalue,:x,B:-,C: 3 ");
        assert_eq!(
            pairs,
            vec![("A".to_string(), "1".to_string()), ("C".to_string(), "3".to_string())]
        );
    }
}
