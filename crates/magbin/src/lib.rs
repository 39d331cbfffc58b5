// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MagPyBin topic protocol
//!
//! Sensors publish three kinds of messages per channel:
//!
//! ```text
//! <station>/<sensor>meta  --> ChannelRegistry::register  (schema)
//! <station>/<sensor>dict  --> ChannelRegistry::describe  (descriptive fields)
//! <station>/<sensor>data  --> decode_batch               (samples)
//! ```
//!
//! This crate provides:
//! - Topic classification with a station filter
//! - Meta header parsing and pack-code layouts
//! - The little-endian binary frame codec and buffer file reader
//! - The per-session channel registry
//! - Data line decoding into scaled sample records
//! - Payload plugins for vendor formats (LoRaWAN uplinks)

pub mod decode;
pub mod frame;
pub mod header;
pub mod keys;
#[cfg(feature = "lorawan")]
pub mod lorawan;
pub mod packcode;
pub mod plugin;
pub mod registry;
pub mod topic;

pub use decode::{decode_batch, DecodedBatch, SampleRecord, SampleValue};
pub use frame::{encode, encode_line, BufferFile, SENTINEL};
pub use header::{derive_header_pack_code, Header};
pub use packcode::PackCode;
pub use plugin::{PayloadPlugin, PluginPayload, PluginRegistry};
pub use registry::{ChannelRegistry, ChannelState, Registration, RegistryError};
pub use topic::{MessageKind, StationFilter, Topic};
