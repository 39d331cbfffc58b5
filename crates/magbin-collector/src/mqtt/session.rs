// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker session.
//!
//! ```text
//!   connect --CONNACK--> subscribe --> serve ----stop----> DISCONNECT
//!      ^                                 |
//!      +------- backoff <-- lost --------+
//! ```
//!
//! Every successful CONNACK is followed by a fresh SUBSCRIBE, so the
//! subscription survives broker restarts. Messages are handed to the
//! handler one at a time on the calling thread.

use super::codec::{connack_reason, Connect, MqttError, Packet, PacketReader, Publish};
use super::transport::{self, Security, Transport, TransportError};
use super::{Outbox, QoS};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Read timeout of the serve loop; bounds the reaction time to a stop
/// request.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("connection refused: {reason} (code {code})")]
    Refused { code: u8, reason: &'static str },

    #[error("no CONNACK within {0:?}")]
    ConnectTimeout(Duration),

    #[error("no PINGRESP within the keep-alive interval")]
    PingTimeout,

    #[error("message handler failed: {0}")]
    Handler(String),
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Mqtt(MqttError::Io(e))
    }
}

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic filter subscribed after every CONNACK.
    pub subscription: String,
    pub qos: QoS,
    pub security: Security,
    pub connect_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl SessionConfig {
    pub fn new(host: &str, port: u16, client_id: &str, subscription: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            client_id: client_id.to_string(),
            keep_alive: 60,
            clean_session: false,
            username: None,
            password: None,
            subscription: subscription.to_string(),
            qos: QoS::AtMostOnce,
            security: Security::Plain,
            connect_timeout: Duration::from_secs(10),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
        }
    }
}

/// Local host name, "unknown" when unavailable.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = vec![0u8; 256];
        let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if ret == 0 {
            let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            buf.truncate(len);
            return String::from_utf8_lossy(&buf).into_owned();
        }
        "unknown".to_string()
    }
    #[cfg(not(unix))]
    {
        "unknown".to_string()
    }
}

/// Client identity unique per broker, host and destination.
pub fn client_identity(broker: &str, host: &str, suffix: &str) -> String {
    format!("{}{}{}", broker, host, suffix)
}

/// Counters of one session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub connects: u64,
    pub received: u64,
    pub published: u64,
}

/// MQTT session driving a message handler.
pub struct Session {
    config: SessionConfig,
    next_packet_id: u16,
    stats: SessionStats,
}

struct Connection {
    transport: Transport,
    reader: PacketReader,
    last_sent: Instant,
    ping_sent: Option<Instant>,
    /// QoS 2 ids received but not yet released.
    incoming_qos2: HashSet<u16>,
    /// Outgoing ids awaiting acknowledgement.
    outgoing: HashMap<u16, QoS>,
}

impl Connection {
    fn send(&mut self, packet: &Packet) -> Result<(), SessionError> {
        let bytes = packet.encode()?;
        self.transport.write_all(&bytes)?;
        self.transport.flush()?;
        self.last_sent = Instant::now();
        Ok(())
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            next_packet_id: 0,
            stats: SessionStats::default(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    fn packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        self.next_packet_id
    }

    /// Run until `stop` is set or the handler fails.
    ///
    /// Lost connections are re-established with exponential backoff.
    pub fn run<F, E>(&mut self, stop: &AtomicBool, mut handler: F) -> Result<(), SessionError>
    where
        F: FnMut(&str, &[u8], &mut Outbox) -> Result<(), E>,
        E: fmt::Display,
    {
        let mut backoff = self.config.reconnect_min;
        while !stop.load(Ordering::Relaxed) {
            match self.connect() {
                Ok(mut conn) => {
                    backoff = self.config.reconnect_min;
                    let result = self.serve(&mut conn, stop, &mut handler);
                    if stop.load(Ordering::Relaxed) || matches!(result, Err(SessionError::Handler(_)))
                    {
                        let _ = conn.send(&Packet::Disconnect);
                        conn.transport.shutdown();
                        info!("disconnected from broker");
                        return result;
                    }
                    conn.transport.shutdown();
                    if let Err(e) = result {
                        warn!(error = %e, "broker connection lost");
                    }
                }
                Err(e) => {
                    warn!(
                        broker = %self.config.host,
                        port = self.config.port,
                        error = %e,
                        retry_in = ?backoff,
                        "broker connection failed"
                    );
                }
            }
            sleep_unless_stopped(backoff, stop);
            backoff = (backoff * 2).min(self.config.reconnect_max);
        }
        Ok(())
    }

    fn connect(&mut self) -> Result<Connection, SessionError> {
        let transport = transport::connect(
            &self.config.host,
            self.config.port,
            &self.config.security,
            self.config.connect_timeout,
        )?;
        let mut conn = Connection {
            transport,
            reader: PacketReader::default(),
            last_sent: Instant::now(),
            ping_sent: None,
            incoming_qos2: HashSet::new(),
            outgoing: HashMap::new(),
        };

        conn.send(&Packet::Connect(Connect {
            client_id: self.config.client_id.clone(),
            keep_alive: self.config.keep_alive,
            clean_session: self.config.clean_session,
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        }))?;

        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(SessionError::ConnectTimeout(self.config.connect_timeout));
            }
            match conn.reader.read_packet(&mut conn.transport)? {
                Some(Packet::ConnAck { code: 0, session_present }) => {
                    debug!(session_present, "CONNACK");
                    break;
                }
                Some(Packet::ConnAck { code, .. }) => {
                    return Err(SessionError::Refused {
                        code,
                        reason: connack_reason(code),
                    })
                }
                Some(other) => debug!(packet = ?other, "ignoring packet before CONNACK"),
                None => {}
            }
        }

        self.stats.connects += 1;
        info!(
            broker = %self.config.host,
            port = self.config.port,
            client_id = %self.config.client_id,
            security = self.config.security.name(),
            "connected to broker"
        );

        let packet_id = self.packet_id();
        conn.send(&Packet::Subscribe {
            packet_id,
            topics: vec![(self.config.subscription.clone(), self.config.qos)],
        })?;
        info!(topic = %self.config.subscription, qos = self.config.qos.as_u8(), "subscribed");

        conn.transport.set_read_timeout(Some(POLL_INTERVAL))?;
        Ok(conn)
    }

    fn serve<F, E>(
        &mut self,
        conn: &mut Connection,
        stop: &AtomicBool,
        handler: &mut F,
    ) -> Result<(), SessionError>
    where
        F: FnMut(&str, &[u8], &mut Outbox) -> Result<(), E>,
        E: fmt::Display,
    {
        let keep_alive = Duration::from_secs(u64::from(self.config.keep_alive));
        while !stop.load(Ordering::Relaxed) {
            if let Some(packet) = conn.reader.read_packet(&mut conn.transport)? {
                self.on_packet(conn, packet, handler)?;
            }

            if keep_alive.is_zero() {
                continue;
            }
            match conn.ping_sent {
                Some(sent) if sent.elapsed() >= keep_alive => return Err(SessionError::PingTimeout),
                Some(_) => {}
                None if conn.last_sent.elapsed() >= keep_alive / 2 => {
                    conn.send(&Packet::PingReq)?;
                    conn.ping_sent = Some(Instant::now());
                }
                None => {}
            }
        }
        Ok(())
    }

    fn on_packet<F, E>(
        &mut self,
        conn: &mut Connection,
        packet: Packet,
        handler: &mut F,
    ) -> Result<(), SessionError>
    where
        F: FnMut(&str, &[u8], &mut Outbox) -> Result<(), E>,
        E: fmt::Display,
    {
        match packet {
            Packet::Publish(publish) => self.on_publish(conn, publish, handler)?,
            Packet::PubRel(id) => {
                conn.incoming_qos2.remove(&id);
                conn.send(&Packet::PubComp(id))?;
            }
            Packet::PubAck(id) | Packet::PubComp(id) => {
                conn.outgoing.remove(&id);
            }
            Packet::PubRec(id) => conn.send(&Packet::PubRel(id))?,
            Packet::SubAck { packet_id, codes } => {
                if codes.iter().any(|c| *c == 0x80) {
                    error!(packet_id, topic = %self.config.subscription, "subscription rejected");
                } else {
                    debug!(packet_id, ?codes, "SUBACK");
                }
            }
            Packet::PingResp => conn.ping_sent = None,
            other => debug!(packet = ?other, "unexpected packet"),
        }
        Ok(())
    }

    fn on_publish<F, E>(
        &mut self,
        conn: &mut Connection,
        publish: Publish,
        handler: &mut F,
    ) -> Result<(), SessionError>
    where
        F: FnMut(&str, &[u8], &mut Outbox) -> Result<(), E>,
        E: fmt::Display,
    {
        let duplicate = match (publish.qos, publish.packet_id) {
            (QoS::ExactlyOnce, Some(id)) => !conn.incoming_qos2.insert(id),
            _ => false,
        };

        let mut outbox = Outbox::new();
        let outcome = if duplicate {
            debug!(topic = %publish.topic, "duplicate QoS 2 delivery");
            Ok(())
        } else {
            self.stats.received += 1;
            handler(&publish.topic, &publish.payload, &mut outbox)
        };

        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(id)) => conn.send(&Packet::PubAck(id))?,
            (QoS::ExactlyOnce, Some(id)) => conn.send(&Packet::PubRec(id))?,
            _ => {}
        }

        for publication in outbox.drain() {
            let packet_id = match publication.qos {
                QoS::AtMostOnce => None,
                qos => {
                    let id = self.packet_id();
                    conn.outgoing.insert(id, qos);
                    Some(id)
                }
            };
            conn.send(&Packet::Publish(Publish {
                topic: publication.topic,
                packet_id,
                qos: publication.qos,
                retain: publication.retain,
                dup: false,
                payload: publication.payload,
            }))?;
            self.stats.published += 1;
        }

        outcome.map_err(|e| SessionError::Handler(e.to_string()))
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(POLL_INTERVAL));
    }
}
