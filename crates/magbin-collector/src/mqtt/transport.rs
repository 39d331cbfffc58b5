// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker transports.
//!
//! - `Plain`: bare TCP.
//! - `Tls`: rustls client, roots from the configured CA certificate or the
//!   bundled web PKI roots (feature `tls`).
//! - `Psk`: OpenSSL client with a pre-shared key installed through the
//!   PSK client callback, TLS 1.2 PSK cipher suites only (feature
//!   `tls-psk`).

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("PSK key is not valid hex: {0}")]
    InvalidPskKey(#[from] hex::FromHexError),

    #[error("{0} support is not compiled in")]
    Unsupported(&'static str),
}

/// Transport security with its key material.
#[derive(Clone, PartialEq, Eq)]
pub enum Security {
    Plain,
    Tls { ca_cert: Option<PathBuf> },
    Psk { identity: String, key: Vec<u8> },
}

impl Security {
    /// PSK security from an identity and a hex-encoded key.
    pub fn psk(identity: &str, hex_key: &str) -> Result<Self, TransportError> {
        Ok(Security::Psk {
            identity: identity.to_string(),
            key: hex::decode(hex_key.trim())?,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Security::Plain => "plain",
            Security::Tls { .. } => "tls",
            Security::Psk { .. } => "psk",
        }
    }
}

impl fmt::Debug for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Security::Plain => f.write_str("Plain"),
            Security::Tls { ca_cert } => f.debug_struct("Tls").field("ca_cert", ca_cert).finish(),
            Security::Psk { identity, .. } => f
                .debug_struct("Psk")
                .field("identity", identity)
                .field("key", &"<redacted>")
                .finish(),
        }
    }
}

/// Byte stream usable as a transport.
pub trait Stream: Read + Write + Send {}

impl<T: Read + Write + Send> Stream for T {}

/// Connected transport.
pub struct Transport {
    stream: Box<dyn Stream>,
    socket: TcpStream,
}

impl Transport {
    /// Wrap an already secured stream over `socket`.
    pub fn new(stream: Box<dyn Stream>, socket: TcpStream) -> Self {
        Self { stream, socket }
    }

    /// Timeout of a single read; `None` blocks.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    /// Close both directions of the socket.
    pub fn shutdown(&self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.socket.peer_addr().ok())
            .finish()
    }
}

/// Open a TCP connection to `host:port` and secure it.
pub fn connect(
    host: &str,
    port: u16,
    security: &Security,
    timeout: Duration,
) -> Result<Transport, TransportError> {
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|_| TransportError::Resolve(format!("{}:{}", host, port)))?
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::Resolve(format!("{}:{}", host, port)));
    }

    let mut last_err = None;
    let mut socket = None;
    for addr in &addrs {
        match TcpStream::connect_timeout(addr, timeout) {
            Ok(s) => {
                socket = Some(s);
                break;
            }
            Err(e) => {
                debug!(%addr, error = %e, "connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    let socket = match socket {
        Some(s) => s,
        None => {
            return Err(last_err
                .map(TransportError::Io)
                .unwrap_or_else(|| TransportError::Resolve(host.to_string())))
        }
    };
    socket.set_nodelay(true)?;
    // Handshakes run with a bounded read timeout.
    socket.set_read_timeout(Some(timeout))?;

    let io_socket = socket.try_clone()?;
    let stream: Box<dyn Stream> = match security {
        Security::Plain => Box::new(io_socket),
        Security::Tls { ca_cert } => tls_stream(host, io_socket, ca_cert.as_deref())?,
        Security::Psk { identity, key } => psk_stream(host, io_socket, identity, key)?,
    };
    debug!(host, port, security = security.name(), "transport connected");
    Ok(Transport::new(stream, socket))
}

#[cfg(any(feature = "tls", feature = "tls-psk"))]
fn tls_err(e: impl fmt::Display) -> TransportError {
    TransportError::Tls(e.to_string())
}

#[cfg(feature = "tls")]
fn tls_stream(
    host: &str,
    socket: TcpStream,
    ca_cert: Option<&std::path::Path>,
) -> Result<Box<dyn Stream>, TransportError> {
    use rustls::pki_types::pem::PemObject;
    use rustls::pki_types::{CertificateDer, ServerName};
    use std::sync::Arc;

    let mut roots = rustls::RootCertStore::empty();
    match ca_cert {
        Some(path) => {
            let pem = std::fs::read(path)?;
            for cert in CertificateDer::pem_slice_iter(&pem) {
                let cert = cert.map_err(tls_err)?;
                roots.add(cert).map_err(tls_err)?;
            }
            if roots.is_empty() {
                return Err(TransportError::Tls(format!(
                    "no certificates found in {}",
                    path.display()
                )));
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .with_root_certificates(roots)
        .with_no_client_auth();

    let server_name = ServerName::try_from(host.to_string()).map_err(tls_err)?;
    let mut conn =
        rustls::ClientConnection::new(Arc::new(config), server_name).map_err(tls_err)?;

    let mut socket = socket;
    while conn.is_handshaking() {
        conn.complete_io(&mut socket)?;
    }
    Ok(Box::new(rustls::StreamOwned::new(conn, socket)))
}

#[cfg(not(feature = "tls"))]
fn tls_stream(
    _host: &str,
    _socket: TcpStream,
    _ca_cert: Option<&std::path::Path>,
) -> Result<Box<dyn Stream>, TransportError> {
    Err(TransportError::Unsupported("tls"))
}

#[cfg(feature = "tls-psk")]
fn psk_stream(
    host: &str,
    socket: TcpStream,
    identity: &str,
    key: &[u8],
) -> Result<Box<dyn Stream>, TransportError> {
    use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode, SslVersion};

    let mut builder = SslConnector::builder(SslMethod::tls_client()).map_err(tls_err)?;
    builder.set_cipher_list("PSK").map_err(tls_err)?;
    builder
        .set_max_proto_version(Some(SslVersion::TLS1_2))
        .map_err(tls_err)?;
    builder.set_verify(SslVerifyMode::NONE);

    let identity = identity.as_bytes().to_vec();
    let key = key.to_vec();
    builder.set_psk_client_callback(move |_ssl, _hint, identity_out, psk_out| {
        // identity is NUL-terminated
        if identity.len() >= identity_out.len() || key.len() > psk_out.len() {
            return Err(openssl::error::ErrorStack::get());
        }
        identity_out[..identity.len()].copy_from_slice(&identity);
        identity_out[identity.len()] = 0;
        psk_out[..key.len()].copy_from_slice(&key);
        Ok(key.len())
    });

    let connector = builder.build();
    let config = connector
        .configure()
        .map_err(tls_err)?
        .verify_hostname(false);
    let stream = config.connect(host, socket).map_err(tls_err)?;
    Ok(Box::new(stream))
}

#[cfg(not(feature = "tls-psk"))]
fn psk_stream(
    _host: &str,
    _socket: TcpStream,
    _identity: &str,
    _key: &[u8],
) -> Result<Box<dyn Stream>, TransportError> {
    Err(TransportError::Unsupported("tls-psk"))
}
