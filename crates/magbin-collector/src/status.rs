// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Status envelopes relayed on `<station>/statuslog/<hostname>`.
//!
//! The payload is a flat JSON object of status names to states. Each entry
//! is logged as `host: name - state` and the latest envelope per host is
//! kept for inspection.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

/// Status parsing errors.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status payload is not JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("status payload is not a JSON object")]
    NotAnObject,
}

/// Latest status per host.
#[derive(Debug, Default)]
pub struct StatusHandler {
    hosts: BTreeMap<String, BTreeMap<String, String>>,
}

impl StatusHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an envelope from `host`; returns the logged lines.
    pub fn handle(&mut self, host: &str, payload: &[u8]) -> Result<Vec<String>, StatusError> {
        let value: Value = serde_json::from_slice(payload)?;
        let Value::Object(map) = value else {
            return Err(StatusError::NotAnObject);
        };

        let entries = flatten(map);
        let lines: Vec<String> = entries
            .iter()
            .map(|(name, state)| format!("{}: {} - {}", host, name, state))
            .collect();
        for line in &lines {
            info!("{}", line);
        }
        self.hosts.insert(host.to_string(), entries);
        Ok(lines)
    }

    /// Latest envelope of `host`.
    pub fn latest(&self, host: &str) -> Option<&BTreeMap<String, String>> {
        self.hosts.get(host)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }
}

fn flatten(map: Map<String, Value>) -> BTreeMap<String, String> {
    map.into_iter()
        .map(|(name, value)| {
            let state = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (name, state)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_lines_and_latest() {
        let mut handler = StatusHandler::new();
        let lines = handler
            .handle("obs1", br#"{"disk": "ok", "load": 0.5}"#)
            .unwrap();
        assert_eq!(lines, vec!["obs1: disk - ok", "obs1: load - 0.5"]);

        handler.handle("obs1", br#"{"disk": "full"}"#).unwrap();
        let latest = handler.latest("obs1").unwrap();
        assert_eq!(latest.get("disk").map(String::as_str), Some("full"));
        assert!(latest.get("load").is_none());
        assert_eq!(handler.hosts().collect::<Vec<_>>(), vec!["obs1"]);
    }

    #[test]
    fn test_invalid_payloads() {
        let mut handler = StatusHandler::new();
        assert!(matches!(handler.handle("h", b"not json"), Err(StatusError::Json(_))));
        assert!(matches!(handler.handle("h", b"[1,2]"), Err(StatusError::NotAnObject)));
        assert!(handler.latest("h").is_none());
    }
}
