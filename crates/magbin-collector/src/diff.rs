// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Differential stream between two sensors.
//!
//! Channels whose id contains the configured fragment are buffered in
//! arrival order, keeping the last `window` records each. Once two such
//! channels exist the engine is armed; every N-th qualifying message then
//! subtracts the latest records of the first two channels and publishes a
//! synthetic sensor:
//!
//! ```text
//! <station>/Diff_<p1><p2>_0001/meta   # MagPyBin Diff_.. [x,y] [x,y] [arb,arb] [1000,1000] <6hLll 24
//! <station>/Diff_<p1><p2>_0001/data   2024,1,1,0,0,0,0,1250,-300
//! ```
//!
//! `p1`/`p2` are the second `_`-separated parts of the two sensor ids.

use crate::config::{DifferentialConfig, Destination};
use crate::mqtt::{Publisher, QoS};
use crate::sink::{Sink, SinkBatch, SinkError};
use chrono::{DateTime, Utc};
use magbin::decode::timestamp_fields;
use magbin::keys::is_numeric;
use magbin::packcode::PackCodeError;
use magbin::{Header, PackCode, SampleRecord};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, info};

/// Amplitude scale of published differences.
pub const DIFF_SCALE: f64 = 1000.0;

/// Unit of published differences.
pub const DIFF_UNIT: &str = "arb";

/// Subtraction failures; the attempt is abandoned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubtractError {
    #[error("no buffered records")]
    Empty,

    #[error("latest records are {delta_ms} ms apart")]
    Misaligned { delta_ms: i64 },

    #[error("no common numeric keys")]
    NoCommonKeys,

    #[error("invalid pack code: {0}")]
    PackCode(#[from] PackCodeError),
}

/// Engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffState {
    /// Fewer than two channels seen.
    Collecting,
    /// Two channels buffered.
    Armed,
}

/// A computed difference ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Difference {
    pub name: String,
    pub header: Header,
    pub timestamp: DateTime<Utc>,
    pub values: Vec<f64>,
}

impl Difference {
    /// Data line with values scaled to wire integers.
    pub fn data_line(&self) -> String {
        let mut parts: Vec<String> = timestamp_fields(&self.timestamp)
            .iter()
            .map(i64::to_string)
            .collect();
        parts.extend(
            self.values
                .iter()
                .map(|v| ((v * DIFF_SCALE).round() as i64).to_string()),
        );
        parts.join(",")
    }
}

#[derive(Debug)]
struct Buffered {
    sensor_id: String,
    keys: Vec<String>,
    records: VecDeque<SampleRecord>,
}

/// Differential stream engine.
///
/// Once two qualifying channels are buffered the engine is armed. Every
/// qualifying message from then on counts toward `every`, the message that
/// armed the engine included, so with `every = N` the first difference is
/// published on the (N-1)th message after arming. The counter restarts
/// after each attempt, whether or not the records were aligned.
#[derive(Debug)]
pub struct DifferentialEngine {
    fragment: String,
    every: u32,
    window: usize,
    tolerance_ms: i64,
    qos: QoS,
    channels: Vec<Buffered>,
    counter: u32,
    emitted: u64,
}

impl DifferentialEngine {
    pub fn new(config: &DifferentialConfig, qos: QoS) -> Self {
        Self {
            fragment: config.sensors.clone(),
            every: config.every.max(1),
            window: config.window.max(1),
            tolerance_ms: config.tolerance_ms,
            qos,
            channels: Vec::new(),
            counter: 0,
            emitted: 0,
        }
    }

    pub fn state(&self) -> DiffState {
        if self.channels.len() >= 2 {
            DiffState::Armed
        } else {
            DiffState::Collecting
        }
    }

    /// Number of differences published.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Whether `sensor_id` takes part in the difference.
    pub fn qualifies(&self, sensor_id: &str) -> bool {
        !self.fragment.is_empty() && sensor_id.contains(&self.fragment)
    }

    fn buffer(&mut self, sensor_id: &str, keys: &[String], records: &[SampleRecord]) {
        let index = match self.channels.iter().position(|c| c.sensor_id == sensor_id) {
            Some(index) => index,
            None => {
                debug!(sensor = %sensor_id, "differential channel added");
                self.channels.push(Buffered {
                    sensor_id: sensor_id.to_string(),
                    keys: keys.to_vec(),
                    records: VecDeque::with_capacity(self.window),
                });
                self.channels.len() - 1
            }
        };
        let channel = &mut self.channels[index];
        for record in records {
            channel.records.push_back(record.clone());
        }
        while channel.records.len() > self.window {
            channel.records.pop_front();
        }
    }

    /// Subtract the latest records of the first two channels.
    pub fn subtract(&self) -> Result<Difference, SubtractError> {
        let (a, b) = match (self.channels.first(), self.channels.get(1)) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(SubtractError::Empty),
        };
        let (ra, rb) = match (a.records.back(), b.records.back()) {
            (Some(ra), Some(rb)) => (ra, rb),
            _ => return Err(SubtractError::Empty),
        };

        let delta_ms = (ra.timestamp - rb.timestamp).num_milliseconds().abs();
        if delta_ms > self.tolerance_ms {
            return Err(SubtractError::Misaligned { delta_ms });
        }

        let mut keys = Vec::new();
        let mut values = Vec::new();
        for (ia, key) in a.keys.iter().enumerate() {
            if !is_numeric(key) {
                continue;
            }
            let Some(ib) = b.keys.iter().position(|k| k == key) else {
                continue;
            };
            let va = ra.values.get(ia).and_then(|v| v.as_f64());
            let vb = rb.values.get(ib).and_then(|v| v.as_f64());
            if let (Some(va), Some(vb)) = (va, vb) {
                keys.push(key.clone());
                values.push(va - vb);
            }
        }
        if keys.is_empty() {
            return Err(SubtractError::NoCommonKeys);
        }

        let name = diff_name(&a.sensor_id, &b.sensor_id);
        let pack_code = PackCode::parse(&format!("<6hL{}", "l".repeat(keys.len())))?;
        let header = Header::synthetic(
            &name,
            keys.clone(),
            keys.clone(),
            vec![DIFF_UNIT.to_string(); keys.len()],
            vec![DIFF_SCALE; keys.len()],
            pack_code,
        );
        Ok(Difference {
            name,
            header,
            timestamp: ra.timestamp,
            values,
        })
    }
}

/// Synthetic sensor name of the pair.
pub fn diff_name(first: &str, second: &str) -> String {
    let part = |id: &str| id.split('_').nth(1).unwrap_or("unknown").to_string();
    format!("Diff_{}{}_0001", part(first), part(second))
}

impl Sink for DifferentialEngine {
    fn destination(&self) -> Destination {
        Destination::Differential
    }

    fn write(&mut self, batch: &SinkBatch<'_>, out: &mut dyn Publisher) -> Result<(), SinkError> {
        if !self.qualifies(batch.sensor_id) {
            return Ok(());
        }
        self.buffer(batch.sensor_id, &batch.batch.keys, &batch.batch.records);
        if self.state() == DiffState::Collecting {
            debug!("not enough channels for a difference yet");
            return Ok(());
        }

        self.counter += 1;
        if self.counter < self.every {
            return Ok(());
        }
        self.counter = 0;

        match self.subtract() {
            Ok(diff) => {
                let topic = format!("{}/{}", batch.station, diff.name);
                out.publish(
                    &format!("{}/meta", topic),
                    diff.header.raw().as_bytes(),
                    self.qos,
                );
                out.publish(
                    &format!("{}/data", topic),
                    diff.data_line().as_bytes(),
                    self.qos,
                );
                self.emitted += 1;
                info!(name = %diff.name, "differential published");
            }
            Err(e) => debug!(error = %e, "differential skipped"),
        }
        Ok(())
    }
}
