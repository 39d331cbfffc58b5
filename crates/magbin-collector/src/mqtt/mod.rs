// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT 3.1.1 client.
//!
//! ```text
//! transport (plain | rustls | openssl-PSK)
//!     -> codec (fixed header + remaining length framing)
//!     -> session (CONNECT, SUBSCRIBE, keep-alive, acks, reconnect)
//!     -> message handler + Outbox
//! ```
//!
//! The handler never writes to the socket itself. Anything it wants to
//! publish goes into an [`Outbox`] which the session flushes after the
//! handler returns.

pub mod codec;
pub mod session;
pub mod transport;

pub use codec::{MqttError, Packet, PacketReader};
pub use session::{client_identity, hostname, Session, SessionConfig, SessionError, SessionStats};
pub use transport::{Security, Transport, TransportError};

/// Delivery guarantee of a publication or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A message queued for publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Something messages can be published to.
pub trait Publisher {
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS);
}

/// Publications collected while a message is handled.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Vec<Publication>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the queued publications in publish order.
    pub fn drain(&mut self) -> Vec<Publication> {
        std::mem::take(&mut self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Publication> {
        self.queue.iter()
    }
}

impl Publisher for Outbox {
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) {
        self.queue.push(Publication {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain: false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QoS::from_u8(2), Some(QoS::ExactlyOnce));
        assert_eq!(QoS::from_u8(3), None);
        assert_eq!(QoS::AtLeastOnce.as_u8(), 1);
    }

    #[test]
    fn test_outbox_keeps_order() {
        let mut outbox = Outbox::new();
        outbox.publish("wic/a/data", b"1", QoS::AtMostOnce);
        outbox.publish("wic/a/meta", b"2", QoS::AtLeastOnce);
        assert_eq!(outbox.len(), 2);
        let drained = outbox.drain();
        assert_eq!(drained[0].topic, "wic/a/data");
        assert_eq!(drained[1].qos, QoS::AtLeastOnce);
        assert!(outbox.is_empty());
    }
}
