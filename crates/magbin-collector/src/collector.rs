// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message dispatch.
//!
//! ```text
//! topic ──► station filter ──► plugin? ──► kind
//!                                   meta ─► registry.register ─► sink.on_register
//!                                   dict ─► registry.describe
//!                                   data ─► decode_batch ─► sinks (fixed order)
//!                                 status ─► StatusHandler
//! ```
//!
//! The collector owns all per-session state. Only a header naming another
//! sensor than its topic can end the session, and only when configured to.

use crate::config::{CollectorConfig, Destination, TransportSecurity};
use crate::credentials::{resolve, CredentialStore};
use crate::diff::DifferentialEngine;
use crate::mqtt::{client_identity, hostname, Publisher, QoS, Security, SessionConfig};
use crate::sink::{
    self, Broadcaster, DatabaseSink, FileSink, InfluxClient, Sink, SinkBatch, SinkError,
    StdoutSink, StringBuffer, StringBufferSink, WebsocketSink,
};
use crate::status::StatusHandler;
use magbin::topic::TopicError;
use magbin::{
    decode_batch, ChannelRegistry, Header, MessageKind, PluginPayload, PluginRegistry,
    Registration, RegistryError, StationFilter,
};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Collector errors.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// A header names another sensor than its topic.
    #[error("sensor mismatch: {0}")]
    SensorMismatch(RegistryError),

    #[error("setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Dispatch counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectorStats {
    pub received: u64,
    pub ignored: u64,
    pub dropped: u64,
    pub registered: u64,
    pub records_decoded: u64,
    pub records_skipped: u64,
    pub sink_failures: u64,
    pub status_updates: u64,
}

/// The collector's message handler.
pub struct Collector {
    filter: StationFilter,
    registry: ChannelRegistry,
    plugins: PluginRegistry,
    sinks: Vec<Box<dyn Sink>>,
    status: StatusHandler,
    instrument: Option<String>,
    blacklist: HashSet<String>,
    abort_on_mismatch: bool,
    uninterpreted: HashSet<String>,
    stats: CollectorStats,
}

/// Builder for [`Collector`].
pub struct CollectorBuilder {
    filter: StationFilter,
    plugins: PluginRegistry,
    sinks: Vec<Box<dyn Sink>>,
    instrument: Option<String>,
    blacklist: HashSet<String>,
    abort_on_mismatch: bool,
}

impl CollectorBuilder {
    pub fn new(filter: StationFilter) -> Self {
        Self {
            filter,
            plugins: PluginRegistry::new(),
            sinks: Vec::new(),
            instrument: None,
            blacklist: HashSet::new(),
            abort_on_mismatch: true,
        }
    }

    pub fn sink(mut self, sink: Box<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sinks(mut self, sinks: Vec<Box<dyn Sink>>) -> Self {
        self.sinks.extend(sinks);
        self
    }

    pub fn plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    /// Only collect sensors whose id contains `fragment`.
    pub fn instrument(mut self, fragment: Option<String>) -> Self {
        self.instrument = fragment.filter(|f| !f.is_empty());
        self
    }

    pub fn blacklist<I: IntoIterator<Item = String>>(mut self, ids: I) -> Self {
        self.blacklist.extend(ids);
        self
    }

    pub fn abort_on_sensor_mismatch(mut self, abort: bool) -> Self {
        self.abort_on_mismatch = abort;
        self
    }

    pub fn build(mut self) -> Collector {
        sink::sort_sinks(&mut self.sinks);
        Collector {
            filter: self.filter,
            registry: ChannelRegistry::new(),
            plugins: self.plugins,
            sinks: self.sinks,
            status: StatusHandler::new(),
            instrument: self.instrument,
            blacklist: self.blacklist,
            abort_on_mismatch: self.abort_on_mismatch,
            uninterpreted: HashSet::new(),
            stats: CollectorStats::default(),
        }
    }
}

impl Collector {
    pub fn builder(filter: StationFilter) -> CollectorBuilder {
        CollectorBuilder::new(filter)
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn status(&self) -> &StatusHandler {
        &self.status
    }

    pub fn stats(&self) -> CollectorStats {
        self.stats
    }

    /// Active sinks in fan-out order.
    pub fn destinations(&self) -> Vec<Destination> {
        self.sinks.iter().map(|s| s.destination()).collect()
    }

    /// Handle one broker message.
    ///
    /// Only a fatal sensor mismatch is returned as an error; everything
    /// else is logged and counted.
    pub fn handle_message(
        &mut self,
        topic: &str,
        payload: &[u8],
        out: &mut dyn Publisher,
    ) -> Result<(), CollectorError> {
        self.stats.received += 1;

        if !self.filter.accepts(topic) {
            self.stats.ignored += 1;
            return Ok(());
        }

        let plugin_result = self.plugins.find(topic).map(|p| (p.name(), p.decode(topic, payload)));
        if let Some((name, result)) = plugin_result {
            match result {
                Ok(decoded) => self.on_plugin_payload(topic, decoded, out),
                Err(e) => {
                    warn!(plugin = name, topic, error = %e, "plugin could not decode payload");
                    self.stats.dropped += 1;
                }
            }
            return Ok(());
        }

        let parsed = match self.filter.parse(topic) {
            Ok(parsed) => parsed,
            Err(TopicError::OtherStation(_)) => {
                self.stats.ignored += 1;
                return Ok(());
            }
            Err(e) => {
                debug!(error = %e, "ignoring topic");
                self.stats.ignored += 1;
                return Ok(());
            }
        };

        if parsed.kind == MessageKind::Status {
            match self.status.handle(&parsed.sensor_id, payload) {
                Ok(_) => self.stats.status_updates += 1,
                Err(e) => {
                    warn!(host = %parsed.sensor_id, error = %e, "invalid status envelope");
                    self.stats.dropped += 1;
                }
            }
            return Ok(());
        }

        if !self.accepts_sensor(&parsed.sensor_id) {
            self.stats.ignored += 1;
            return Ok(());
        }

        let text = match std::str::from_utf8(payload) {
            Ok(text) => text.trim(),
            Err(_) => {
                warn!(topic, "payload is not UTF-8");
                self.stats.dropped += 1;
                return Ok(());
            }
        };

        match parsed.kind {
            MessageKind::Meta => self.on_meta(&parsed.station, &parsed.sensor_id, text)?,
            MessageKind::Dict => self.on_dict(&parsed.sensor_id, text),
            MessageKind::Data => self.on_data(&parsed.station, &parsed.sensor_id, text, out),
            MessageKind::Status => {}
        }
        Ok(())
    }

    fn accepts_sensor(&self, sensor_id: &str) -> bool {
        if self.blacklist.contains(sensor_id) {
            return false;
        }
        match &self.instrument {
            Some(fragment) => sensor_id.contains(fragment.as_str()),
            None => true,
        }
    }

    fn on_meta(&mut self, station: &str, sensor_id: &str, line: &str) -> Result<(), CollectorError> {
        match self.registry.register(station, sensor_id, line) {
            Ok(Registration::New) => {
                self.stats.registered += 1;
                self.notify_registered(sensor_id);
                Ok(())
            }
            Ok(Registration::AlreadyRegistered) => Ok(()),
            Err(e @ RegistryError::SensorMismatch { .. }) => {
                if self.abort_on_mismatch {
                    error!(error = %e, "sensor ids differ between topic and header, aborting");
                    return Err(CollectorError::SensorMismatch(e));
                }
                warn!(error = %e, "sensor ids differ between topic and header");
                self.stats.dropped += 1;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "meta header rejected");
                self.stats.dropped += 1;
                Ok(())
            }
        }
    }

    fn notify_registered(&mut self, sensor_id: &str) {
        let Some(header) = self.registry.header(sensor_id) else {
            return;
        };
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.on_register(sensor_id, header) {
                warn!(sink = %sink.destination(), sensor = %sensor_id, error = %e, "sink registration failed");
                self.stats.sink_failures += 1;
            }
        }
    }

    fn on_dict(&mut self, sensor_id: &str, line: &str) {
        if let Err(e) = self.registry.describe(sensor_id, line) {
            debug!(error = %e, "dict dropped");
            self.stats.dropped += 1;
        }
    }

    fn on_data(&mut self, station: &str, sensor_id: &str, payload: &str, out: &mut dyn Publisher) {
        let Some(channel) = self.registry.get(sensor_id) else {
            if self.uninterpreted.insert(sensor_id.to_string()) {
                info!(sensor = %sensor_id, "non-interpreted data: no meta header received yet");
            } else {
                debug!(sensor = %sensor_id, "non-interpreted data");
            }
            self.stats.dropped += 1;
            return;
        };

        let decoded = decode_batch(&channel.header, payload);
        self.stats.records_decoded += decoded.len() as u64;
        self.stats.records_skipped += decoded.skipped as u64;
        if decoded.is_empty() {
            return;
        }

        let batch = SinkBatch {
            station,
            sensor_id,
            header: &channel.header,
            fields: &channel.fields,
            payload,
            batch: &decoded,
        };
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.write(&batch, out) {
                warn!(sink = %sink.destination(), sensor = %sensor_id, error = %e, "sink failed");
                self.stats.sink_failures += 1;
            }
        }
    }

    fn on_plugin_payload(&mut self, topic: &str, decoded: PluginPayload, out: &mut dyn Publisher) {
        let station = match self.filter.station() {
            Some(station) => station.to_string(),
            None => topic.split('/').next().unwrap_or_default().to_string(),
        };
        if !self.accepts_sensor(&decoded.sensor_id) {
            self.stats.ignored += 1;
            return;
        }
        match Header::parse(&decoded.header_line) {
            Ok(header) => {
                let registration = self.registry.register_header(&station, header, decoded.fields);
                if registration == Registration::New {
                    self.stats.registered += 1;
                    self.notify_registered(&decoded.sensor_id);
                }
            }
            Err(e) => {
                warn!(sensor = %decoded.sensor_id, error = %e, "plugin header rejected");
                self.stats.dropped += 1;
                return;
            }
        }
        self.on_data(&station, &decoded.sensor_id, &decoded.data, out);
    }
}

/// Sinks built from configuration.
pub struct SinkSet {
    pub sinks: Vec<Box<dyn Sink>>,
    /// Handle of the in-memory buffer, when `stringio` is active.
    pub string_buffer: Option<StringBuffer>,
}

/// Build the configured sinks.
///
/// `broadcaster` is required when the websocket destination is active.
pub fn build_sinks(
    config: &CollectorConfig,
    store: &dyn CredentialStore,
    broadcaster: Option<Arc<dyn Broadcaster>>,
) -> Result<SinkSet, CollectorError> {
    let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
    let mut string_buffer = None;
    let mut seen = HashSet::new();
    let qos = QoS::from_u8(config.effective_qos()).unwrap_or_default();

    for dest in &config.destination {
        if !seen.insert(*dest) {
            continue;
        }
        let sink: Box<dyn Sink> = match dest {
            Destination::File => Box::new(FileSink::new(&config.filepath)),
            Destination::Websocket => {
                let broadcaster = broadcaster.clone().ok_or_else(|| {
                    CollectorError::Setup("websocket destination without a server".into())
                })?;
                Box::new(WebsocketSink::new(broadcaster))
            }
            Destination::Differential => {
                Box::new(DifferentialEngine::new(&config.differential, qos))
            }
            Destination::Stdout => Box::new(StdoutSink::new()),
            Destination::Database => {
                let db = config.database.as_ref().ok_or_else(|| {
                    CollectorError::Setup("db destination without database settings".into())
                })?;
                let token = resolve(
                    db.token.as_deref(),
                    store,
                    db.credentials.as_deref(),
                    "passwd",
                );
                let client = InfluxClient::new(db, token)?;
                Box::new(DatabaseSink::new(Box::new(client), config.revision))
            }
            Destination::StringBuffer => {
                let buffer = StringBuffer::new();
                string_buffer = Some(buffer.clone());
                Box::new(StringBufferSink::new(buffer))
            }
        };
        sinks.push(sink);
    }
    sink::sort_sinks(&mut sinks);
    Ok(SinkSet {
        sinks,
        string_buffer,
    })
}

/// Broker session settings from configuration and the credential store.
pub fn session_config(
    config: &CollectorConfig,
    store: &dyn CredentialStore,
) -> Result<SessionConfig, CollectorError> {
    let filter = StationFilter::new(&config.station);
    let client_id = client_identity(&config.broker, &hostname(), &config.client_suffix);
    let mut session = SessionConfig::new(
        &config.broker,
        config.port,
        &client_id,
        &filter.subscription(),
    );
    session.keep_alive = config.keepalive_secs;
    session.qos = QoS::from_u8(config.effective_qos()).unwrap_or_default();
    session.username = resolve(
        config.user.as_deref(),
        store,
        config.credentials.as_deref(),
        "user",
    );
    session.password = resolve(
        config.password.as_deref(),
        store,
        config.credentials.as_deref(),
        "passwd",
    );

    session.security = match config.transport_security() {
        TransportSecurity::Plain => Security::Plain,
        TransportSecurity::Tls => Security::Tls {
            ca_cert: config.ca_cert.clone(),
        },
        TransportSecurity::Psk => {
            let entry = config.psk.as_deref();
            let identity = resolve(None, store, entry, "user");
            let key = resolve(None, store, entry, "passwd");
            match (identity, key) {
                (Some(identity), Some(key)) => Security::psk(&identity, &key)
                    .map_err(|e| CollectorError::Setup(e.to_string()))?,
                _ => {
                    return Err(CollectorError::Setup(format!(
                        "psk credential entry '{}' lacks user or passwd",
                        entry.unwrap_or_default()
                    )))
                }
            }
        }
    };
    info!(
        client_id = %session.client_id,
        subscription = %session.subscription,
        security = session.security.name(),
        "session configured"
    );
    Ok(session)
}
