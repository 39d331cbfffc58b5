// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT 3.1.1 packet codec.
//!
//! Every control packet starts with a fixed header:
//!
//! ```text
//! +-----------------+---------------------------+------------------+
//! | type(4) flags(4)| remaining length (1-4 B)  | variable header  |
//! |                 | 7 bits per byte, LSB first| + payload        |
//! +-----------------+---------------------------+------------------+
//! ```
//!
//! Multi-byte integers are big-endian; strings are a `u16` length followed
//! by UTF-8 bytes.

use super::QoS;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read};
use thiserror::Error;

/// Largest remaining length the encoding can express.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default limit on incoming packets (1 MiB).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const PUBREC: u8 = 5;
const PUBREL: u8 = 6;
const PUBCOMP: u8 = 7;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

/// Codec errors.
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("malformed remaining length")]
    MalformedLength,

    #[error("packet of {0} bytes exceeds the limit")]
    PacketTooLarge(usize),

    #[error("unsupported packet type {0}")]
    UnknownPacketType(u8),

    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("string is not valid UTF-8")]
    Utf8,
}

/// CONNECT contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// PUBLISH contents; `packet_id` is present for QoS 1 and 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub packet_id: Option<u16>,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub payload: Vec<u8>,
}

/// MQTT control packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck { session_present: bool, code: u8 },
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe { packet_id: u16, topics: Vec<(String, QoS)> },
    SubAck { packet_id: u16, codes: Vec<u8> },
    PingReq,
    PingResp,
    Disconnect,
}

/// Human-readable CONNACK return code.
pub fn connack_reason(code: u8) -> &'static str {
    match code {
        0 => "accepted",
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown return code",
    }
}

impl Packet {
    /// Serialize the packet with its fixed header.
    pub fn encode(&self) -> Result<Vec<u8>, MqttError> {
        let mut body = Vec::new();
        let first = match self {
            Packet::Connect(c) => {
                write_str(&mut body, PROTOCOL_NAME)?;
                body.push(PROTOCOL_LEVEL);
                let mut flags = 0u8;
                if c.username.is_some() {
                    flags |= 0x80;
                }
                if c.password.is_some() {
                    flags |= 0x40;
                }
                if c.clean_session {
                    flags |= 0x02;
                }
                body.push(flags);
                body.write_u16::<BigEndian>(c.keep_alive)?;
                write_str(&mut body, &c.client_id)?;
                if let Some(user) = &c.username {
                    write_str(&mut body, user)?;
                }
                if let Some(password) = &c.password {
                    write_str(&mut body, password)?;
                }
                CONNECT << 4
            }
            Packet::ConnAck {
                session_present,
                code,
            } => {
                body.push(u8::from(*session_present));
                body.push(*code);
                CONNACK << 4
            }
            Packet::Publish(p) => {
                write_str(&mut body, &p.topic)?;
                if p.qos != QoS::AtMostOnce {
                    let id = p.packet_id.ok_or(MqttError::Malformed("missing packet id"))?;
                    body.write_u16::<BigEndian>(id)?;
                }
                body.extend_from_slice(&p.payload);
                (PUBLISH << 4)
                    | (u8::from(p.dup) << 3)
                    | (p.qos.as_u8() << 1)
                    | u8::from(p.retain)
            }
            Packet::PubAck(id) => {
                body.write_u16::<BigEndian>(*id)?;
                PUBACK << 4
            }
            Packet::PubRec(id) => {
                body.write_u16::<BigEndian>(*id)?;
                PUBREC << 4
            }
            Packet::PubRel(id) => {
                body.write_u16::<BigEndian>(*id)?;
                (PUBREL << 4) | 0x02
            }
            Packet::PubComp(id) => {
                body.write_u16::<BigEndian>(*id)?;
                PUBCOMP << 4
            }
            Packet::Subscribe { packet_id, topics } => {
                body.write_u16::<BigEndian>(*packet_id)?;
                for (filter, qos) in topics {
                    write_str(&mut body, filter)?;
                    body.push(qos.as_u8());
                }
                (SUBSCRIBE << 4) | 0x02
            }
            Packet::SubAck { packet_id, codes } => {
                body.write_u16::<BigEndian>(*packet_id)?;
                body.extend_from_slice(codes);
                SUBACK << 4
            }
            Packet::PingReq => PINGREQ << 4,
            Packet::PingResp => PINGRESP << 4,
            Packet::Disconnect => DISCONNECT << 4,
        };

        let mut frame = Vec::with_capacity(body.len() + 5);
        frame.push(first);
        write_remaining_length(&mut frame, body.len())?;
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Parse a packet from its first header byte and body.
    pub fn decode(first: u8, body: &[u8]) -> Result<Packet, MqttError> {
        let mut cur = Cursor::new(body);
        let packet = match first >> 4 {
            CONNECT => {
                let name = read_str(&mut cur)?;
                if name != PROTOCOL_NAME {
                    return Err(MqttError::Malformed("protocol name"));
                }
                let _level = cur.read_u8()?;
                let flags = cur.read_u8()?;
                let keep_alive = cur.read_u16::<BigEndian>()?;
                let client_id = read_str(&mut cur)?;
                let username = if flags & 0x80 != 0 {
                    Some(read_str(&mut cur)?)
                } else {
                    None
                };
                let password = if flags & 0x40 != 0 {
                    Some(read_str(&mut cur)?)
                } else {
                    None
                };
                Packet::Connect(Connect {
                    client_id,
                    keep_alive,
                    clean_session: flags & 0x02 != 0,
                    username,
                    password,
                })
            }
            CONNACK => {
                let flags = cur.read_u8()?;
                let code = cur.read_u8()?;
                Packet::ConnAck {
                    session_present: flags & 0x01 != 0,
                    code,
                }
            }
            PUBLISH => {
                let qos = QoS::from_u8((first >> 1) & 0x03)
                    .ok_or(MqttError::Malformed("publish qos"))?;
                let topic = read_str(&mut cur)?;
                let packet_id = if qos != QoS::AtMostOnce {
                    Some(cur.read_u16::<BigEndian>()?)
                } else {
                    None
                };
                let start = cur.position() as usize;
                Packet::Publish(Publish {
                    topic,
                    packet_id,
                    qos,
                    retain: first & 0x01 != 0,
                    dup: first & 0x08 != 0,
                    payload: body[start..].to_vec(),
                })
            }
            PUBACK => Packet::PubAck(cur.read_u16::<BigEndian>()?),
            PUBREC => Packet::PubRec(cur.read_u16::<BigEndian>()?),
            PUBREL => Packet::PubRel(cur.read_u16::<BigEndian>()?),
            PUBCOMP => Packet::PubComp(cur.read_u16::<BigEndian>()?),
            SUBSCRIBE => {
                let packet_id = cur.read_u16::<BigEndian>()?;
                let mut topics = Vec::new();
                while (cur.position() as usize) < body.len() {
                    let filter = read_str(&mut cur)?;
                    let qos = QoS::from_u8(cur.read_u8()?)
                        .ok_or(MqttError::Malformed("subscription qos"))?;
                    topics.push((filter, qos));
                }
                Packet::Subscribe { packet_id, topics }
            }
            SUBACK => {
                let packet_id = cur.read_u16::<BigEndian>()?;
                let start = cur.position() as usize;
                Packet::SubAck {
                    packet_id,
                    codes: body[start..].to_vec(),
                }
            }
            PINGREQ => Packet::PingReq,
            PINGRESP => Packet::PingResp,
            DISCONNECT => Packet::Disconnect,
            other => return Err(MqttError::UnknownPacketType(other)),
        };
        Ok(packet)
    }
}

fn write_str(buf: &mut Vec<u8>, s: &str) -> Result<(), MqttError> {
    let len = u16::try_from(s.len()).map_err(|_| MqttError::Malformed("string too long"))?;
    buf.write_u16::<BigEndian>(len)?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_str(cur: &mut Cursor<&[u8]>) -> Result<String, MqttError> {
    let len = cur.read_u16::<BigEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cur.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| MqttError::Utf8)
}

/// Append the variable-length encoding of `len`.
pub fn write_remaining_length(buf: &mut Vec<u8>, mut len: usize) -> Result<(), MqttError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(MqttError::PacketTooLarge(len));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Decode a remaining length from the start of `bytes`.
///
/// Returns `(length, bytes used)`, or `None` when more input is needed.
pub fn read_remaining_length(bytes: &[u8]) -> Result<Option<(usize, usize)>, MqttError> {
    let mut value = 0usize;
    for (i, byte) in bytes.iter().enumerate() {
        if i >= 4 {
            return Err(MqttError::MalformedLength);
        }
        value |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if bytes.len() >= 4 {
        return Err(MqttError::MalformedLength);
    }
    Ok(None)
}

/// Incremental packet reader.
///
/// Bytes are accumulated across reads so a read timeout in the middle of
/// a packet loses nothing.
#[derive(Debug)]
pub struct PacketReader {
    buffer: Vec<u8>,
    max_size: usize,
}

impl Default for PacketReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl PacketReader {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            max_size,
        }
    }

    /// Read the next packet.
    ///
    /// Returns `Ok(None)` when the read timed out before a full packet
    /// arrived.
    pub fn read_packet<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<Packet>, MqttError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(packet) = self.try_parse()? {
                return Ok(Some(packet));
            }
            match reader.read(&mut chunk) {
                Ok(0) => return Err(MqttError::ConnectionClosed),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(None)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn try_parse(&mut self) -> Result<Option<Packet>, MqttError> {
        if self.buffer.len() < 2 {
            return Ok(None);
        }
        let Some((len, used)) = read_remaining_length(&self.buffer[1..])? else {
            return Ok(None);
        };
        if len > self.max_size {
            return Err(MqttError::PacketTooLarge(len));
        }
        let total = 1 + used + len;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let packet = Packet::decode(self.buffer[0], &self.buffer[1 + used..total])?;
        self.buffer.drain(..total);
        Ok(Some(packet))
    }

    /// Drop any partial packet.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_length_boundaries() {
        for (len, encoded) in [
            (0usize, vec![0x00]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (16_383, vec![0xFF, 0x7F]),
            (2_097_152, vec![0x80, 0x80, 0x80, 0x01]),
        ] {
            let mut buf = Vec::new();
            write_remaining_length(&mut buf, len).unwrap();
            assert_eq!(buf, encoded);
            assert_eq!(read_remaining_length(&buf).unwrap(), Some((len, buf.len())));
        }
        assert!(read_remaining_length(&[0x80, 0x80]).unwrap().is_none());
        assert!(matches!(
            read_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(MqttError::MalformedLength)
        ));
    }

    #[test]
    fn test_connect_wire_format() {
        let packet = Packet::Connect(Connect {
            client_id: "c".into(),
            keep_alive: 60,
            clean_session: true,
            username: Some("u".into()),
            password: None,
        });
        let bytes = packet.encode().unwrap();
        assert_eq!(
            bytes,
            vec![
                0x10, 16, 0, 4, b'M', b'Q', b'T', b'T', 4, 0x82, 0, 60, 0, 1, b'c', 0, 1, b'u'
            ]
        );
        assert_eq!(Packet::decode(bytes[0], &bytes[2..]).unwrap(), packet);
    }

    #[test]
    fn test_publish_qos1_flags() {
        let packet = Packet::Publish(Publish {
            topic: "wic/S1data".into(),
            packet_id: Some(7),
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
            payload: b"2024,1,1".to_vec(),
        });
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes[0], 0x32);
        assert_eq!(Packet::decode(bytes[0], &bytes[2..]).unwrap(), packet);
    }

    #[test]
    fn test_publish_without_id_is_rejected() {
        let packet = Packet::Publish(Publish {
            topic: "t".into(),
            packet_id: None,
            qos: QoS::ExactlyOnce,
            retain: false,
            dup: false,
            payload: Vec::new(),
        });
        assert!(matches!(packet.encode(), Err(MqttError::Malformed(_))));
    }

    #[test]
    fn test_reader_handles_split_and_coalesced_packets() {
        let mut stream = Vec::new();
        stream.extend(Packet::PingResp.encode().unwrap());
        stream.extend(Packet::PubRel(9).encode().unwrap());
        stream.extend(
            Packet::SubAck {
                packet_id: 1,
                codes: vec![0x01],
            }
            .encode()
            .unwrap(),
        );

        // One byte per read.
        struct Trickle(Vec<u8>, usize);
        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.1 >= self.0.len() {
                    return Err(io::Error::new(io::ErrorKind::WouldBlock, "empty"));
                }
                buf[0] = self.0[self.1];
                self.1 += 1;
                Ok(1)
            }
        }

        let mut reader = PacketReader::default();
        let mut src = Trickle(stream, 0);
        assert_eq!(reader.read_packet(&mut src).unwrap(), Some(Packet::PingResp));
        assert_eq!(reader.read_packet(&mut src).unwrap(), Some(Packet::PubRel(9)));
        assert_eq!(
            reader.read_packet(&mut src).unwrap(),
            Some(Packet::SubAck {
                packet_id: 1,
                codes: vec![0x01]
            })
        );
        assert_eq!(reader.read_packet(&mut src).unwrap(), None);
    }

    #[test]
    fn test_reader_rejects_oversized_packet() {
        let mut reader = PacketReader::new(4);
        let mut src: &[u8] = &[0x30, 0x10, 0, 0];
        assert!(matches!(
            reader.read_packet(&mut src),
            Err(MqttError::PacketTooLarge(16))
        ));
    }

    #[test]
    fn test_eof_is_connection_closed() {
        let mut reader = PacketReader::default();
        let mut src: &[u8] = &[];
        assert!(matches!(
            reader.read_packet(&mut src),
            Err(MqttError::ConnectionClosed)
        ));
    }
}
