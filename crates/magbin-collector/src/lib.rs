// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MagPyBin telemetry collector
//!
//! Subscribes to a station's topics on an MQTT broker, rebuilds each
//! sensor channel from its meta/dict/data messages and fans decoded
//! samples out to the configured sinks.
//!
//! # Features
//!
//! - **Broker session**: MQTT 3.1.1 over plain TCP, TLS or TLS-PSK with
//!   reconnect and re-subscription
//! - **Sinks**: daily binary buffer files, InfluxDB, websocket broadcast,
//!   stdout and an in-memory string buffer
//! - **Differential stream**: republishes the difference of two sensors
//!   as a new channel
//! - **Status channel**: remote host status envelopes
//!
//! # Example
//!
//! ```rust,ignore
//! use magbin_collector::{build_sinks, Collector, CollectorConfig};
//! use magbin_collector::credentials::MemoryCredentialStore;
//! use magbin_collector::mqtt::Outbox;
//! use magbin::StationFilter;
//!
//! let config = CollectorConfig::from_file("collector.yaml".as_ref())?;
//! let sinks = build_sinks(&config, &MemoryCredentialStore::new(), None)?;
//! let mut collector = Collector::builder(StationFilter::new(&config.station))
//!     .sinks(sinks.sinks)
//!     .build();
//!
//! let mut outbox = Outbox::new();
//! collector.handle_message("wic/S1meta", b"# MagPyBin S1 [x] [X] [nT] [1] <6hLl 20", &mut outbox)?;
//! ```

pub mod collector;
pub mod config;
pub mod credentials;
pub mod diff;
pub mod mqtt;
pub mod sink;
pub mod status;
pub mod web;

pub use collector::{
    build_sinks, session_config, Collector, CollectorBuilder, CollectorError, CollectorStats,
    SinkSet,
};
pub use config::{CollectorConfig, ConfigError, Destination};
pub use diff::DifferentialEngine;
pub use status::StatusHandler;
pub use web::{WebConfig, WebServers, WsHub};
