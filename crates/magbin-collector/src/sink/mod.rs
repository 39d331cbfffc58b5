// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sink adapters.
//!
//! Every decoded batch is handed to the active sinks in a fixed order:
//!
//! ```text
//! File -> Websocket -> Differential -> Stdout -> Database -> StringBuffer
//! ```
//!
//! A sink failure is reported to the caller, which logs it and moves on
//! to the next sink.

pub mod database;
pub mod file;
pub mod stdout;
pub mod string_buffer;
pub mod websocket;

pub use database::{DatabaseClient, DatabaseSink, InfluxClient};
pub use file::FileSink;
pub use stdout::StdoutSink;
pub use string_buffer::{StringBuffer, StringBufferSink};
pub use websocket::{Broadcaster, WebsocketSink};

use crate::config::Destination;
use crate::mqtt::Publisher;
use magbin::frame::EncodeError;
use magbin::{DecodedBatch, Header};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Sink errors.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("destination {0} is not accessible")]
    Location(PathBuf),

    #[error("{failed} record(s) of {sensor} could not be encoded: {source}")]
    Encode {
        sensor: String,
        failed: usize,
        #[source]
        source: EncodeError,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("broadcast error: {0}")]
    Broadcast(String),
}

/// One decoded message as seen by the sinks.
#[derive(Debug, Clone, Copy)]
pub struct SinkBatch<'a> {
    /// Station namespace of the message.
    pub station: &'a str,
    /// Bare sensor id.
    pub sensor_id: &'a str,
    /// Registered header of the channel.
    pub header: &'a Header,
    /// Descriptive fields of the channel.
    pub fields: &'a BTreeMap<String, String>,
    /// Raw batch payload as received.
    pub payload: &'a str,
    /// Decoded records.
    pub batch: &'a DecodedBatch,
}

/// A destination for decoded samples.
pub trait Sink: Send {
    /// Slot of this sink in the fan-out order.
    fn destination(&self) -> Destination;

    /// Called once when a channel is first registered.
    fn on_register(&mut self, _sensor_id: &str, _header: &Header) -> Result<(), SinkError> {
        Ok(())
    }

    /// Handle one decoded batch.
    fn write(&mut self, batch: &SinkBatch<'_>, out: &mut dyn Publisher) -> Result<(), SinkError>;
}

/// Position of `dest` in the fan-out order.
pub fn order_index(dest: Destination) -> usize {
    Destination::ORDER
        .iter()
        .position(|d| *d == dest)
        .unwrap_or(Destination::ORDER.len())
}

/// Sort sinks into fan-out order.
pub fn sort_sinks(sinks: &mut [Box<dyn Sink>]) {
    sinks.sort_by_key(|s| order_index(s.destination()));
}
