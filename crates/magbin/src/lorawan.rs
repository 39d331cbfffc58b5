// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! LoRaWAN uplink plugin.
//!
//! Handles network-server uplinks published on `application/<id>/node/<eui>/rx`:
//!
//! ```json
//! {"applicationName":"Temperature-and-Humidity","deviceName":"TITEC-Multisensor",
//!  "devEUI":"0018b2200000034a",
//!  "rxInfo":[{"gatewayID":"00800000a0001285","name":"MTCDT_AEPGW2",
//!             "location":{"latitude":48.24,"longitude":16.35,"altitude":0}}],
//!  "data":"QgASEzQVIg/HVA=="}
//! ```
//!
//! The base64 `data` carries a temperature/humidity node frame: bytes 3..6
//! hold the temperature, bytes 7..10 the relative humidity, each a 24-bit
//! big-endian count scaled by 6.25e-5 and offset.

use crate::header::Header;
use crate::packcode::PackCode;
use crate::plugin::{PayloadPlugin, PluginError, PluginPayload, TopicIdentifier};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

/// Configuration name of the plugin.
pub const NAME: &str = "lorawan";

const IDENTIFIER: TopicIdentifier = TopicIdentifier {
    starts_with: "application",
    ends_with: "rx",
};

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

const MULTIPLIER: f64 = 1000.0;

/// Measurement name, slot key, unit, byte offset and value offset.
const MEASUREMENTS: [(&str, &str, &str, usize, f64); 2] = [
    ("tl", "t1", "degC", 3, 55.0),
    ("rf", "var1", "per", 7, 25.0),
];

/// Decoder for network-server uplinks.
#[derive(Debug, Clone)]
pub struct LorawanPlugin {
    now: fn() -> DateTime<Utc>,
}

impl LorawanPlugin {
    pub fn new() -> Self {
        Self { now: Utc::now }
    }

    /// Use `now` for uplinks without a timestamp.
    pub fn with_clock(now: fn() -> DateTime<Utc>) -> Self {
        Self { now }
    }
}

impl Default for LorawanPlugin {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert three bytes to a physical value.
fn bytes_to_value(b1: u8, b2: u8, b3: u8, offset: f64) -> f64 {
    let raw = ((b1 as u32) << 16) + ((b2 as u32) << 8) + b3 as u32;
    raw as f64 / 100000.0 * 6.25 - offset
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl PayloadPlugin for LorawanPlugin {
    fn name(&self) -> &'static str {
        NAME
    }

    fn matches(&self, topic: &str) -> bool {
        IDENTIFIER.matches(topic)
    }

    fn decode(&self, _topic: &str, payload: &[u8]) -> Result<PluginPayload, PluginError> {
        let uplink: Value =
            serde_json::from_slice(payload).map_err(|e| PluginError::Json(e.to_string()))?;

        let rx = uplink
            .get("rxInfo")
            .or_else(|| uplink.get("rxinfo"))
            .and_then(|v| v.get(0))
            .ok_or(PluginError::MissingField("rxInfo"))?;
        let location = rx.get("location");

        let device_name = text(uplink.get("deviceName")).unwrap_or_else(|| "LORA".to_string());
        let serial = text(uplink.get("devEUI")).unwrap_or_default();
        let sensor_id = format!(
            "{}_{}_0001",
            device_name.split(' ').next().unwrap_or_default(),
            serial
        );

        let mut fields = BTreeMap::new();
        fields.insert("SensorName".to_string(), device_name.clone());
        fields.insert(
            "SensorDescription".to_string(),
            text(uplink.get("applicationName")).unwrap_or_else(|| "not specified".to_string()),
        );
        fields.insert("SensorSerialNum".to_string(), serial);
        fields.insert("SensorGroup".to_string(), device_name);
        fields.insert("SensorID".to_string(), sensor_id.clone());
        fields.insert(
            "StationID".to_string(),
            text(rx.get("gatewayID")).unwrap_or_else(|| "undefined".to_string()),
        );
        fields.insert(
            "StationName".to_string(),
            text(rx.get("name")).unwrap_or_else(|| "undefined".to_string()),
        );
        if let Some(location) = location {
            let longitude = text(location.get("longitude")).unwrap_or_default();
            let latitude = text(location.get("latitude")).unwrap_or_default();
            if !longitude.is_empty() {
                fields.insert(
                    "StationLocationReference".to_string(),
                    "WGS84, EPSG: 4326".to_string(),
                );
            }
            fields.insert("StationLongitude".to_string(), longitude);
            fields.insert("StationLatitude".to_string(), latitude);
            let altitude = text(location.get("altitude"))
                .filter(|a| !a.is_empty() && a != "0")
                .unwrap_or_default();
            if !altitude.is_empty() {
                fields.insert("StationElevationRef".to_string(), "m NN".to_string());
            }
            fields.insert("StationElevation".to_string(), altitude);
        }

        let encoded = uplink
            .get("data")
            .and_then(Value::as_str)
            .ok_or(PluginError::MissingField("data"))?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| PluginError::Base64(e.to_string()))?;
        if bytes.len() < 10 {
            return Err(PluginError::TooShort(bytes.len()));
        }

        let time = ["DateTime", "DatumSec"]
            .iter()
            .filter_map(|k| uplink.get(*k).and_then(Value::as_str))
            .find(|s| !s.is_empty())
            .and_then(|s| NaiveDateTime::parse_from_str(s, TIME_FORMAT).ok())
            .map(|naive| naive.and_utc())
            .unwrap_or_else(self.now);

        let mut keys = Vec::new();
        let mut elements = Vec::new();
        let mut units = Vec::new();
        let mut values = Vec::new();
        for (element, key, unit, at, offset) in MEASUREMENTS {
            let value = bytes_to_value(bytes[at], bytes[at + 1], bytes[at + 2], offset);
            keys.push(key.to_string());
            elements.push(element.to_string());
            units.push(unit.to_string());
            values.push(((value * MULTIPLIER) as i64).to_string());
        }

        let pack = PackCode::parse(&format!("<6hL{}", "l".repeat(keys.len())))
            .map_err(|e| PluginError::Json(e.to_string()))?;
        let multipliers = vec![MULTIPLIER; keys.len()];
        let header = Header::synthetic(&sensor_id, keys, elements, units, multipliers, pack);

        let timestamp = crate::decode::timestamp_fields(&time);
        let mut data: Vec<String> = timestamp.iter().map(i64::to_string).collect();
        data.extend(values);

        Ok(PluginPayload {
            sensor_id,
            header_line: header.raw().to_string(),
            fields,
            data: data.join(","),
        })
    }
}
