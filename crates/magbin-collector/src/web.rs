// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Websocket broadcast server and static web server.
//!
//! Both run on a tokio runtime owned by a background thread, so the
//! collector's dispatch loop stays synchronous:
//!
//! ```text
//! dispatch thread --WsHub::send_to_all--> broadcast::Sender
//!                                              |
//! web thread (tokio) ---- /ws clients <--------+
//!                    ---- ServeDir(webpath) on webport
//! ```

use crate::sink::{Broadcaster, SinkError};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Messages buffered per client before it starts lagging.
pub const CLIENT_BACKLOG: usize = 1024;

/// Web server errors.
#[derive(Debug, Error)]
pub enum WebError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Fan-out point between the dispatch loop and websocket clients.
#[derive(Debug)]
pub struct WsHub {
    sender: broadcast::Sender<String>,
    clients: AtomicUsize,
}

impl WsHub {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(CLIENT_BACKLOG)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            sender,
            clients: AtomicUsize::new(0),
        })
    }

    /// New receiver for a connecting client.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Number of connected websocket clients.
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }
}

impl Broadcaster for WsHub {
    fn send_to_all(&self, message: &str) -> Result<(), SinkError> {
        // No receivers is not an error: nobody is listening yet.
        if self.sender.receiver_count() == 0 {
            return Ok(());
        }
        self.sender
            .send(message.to_string())
            .map(|_| ())
            .map_err(|e| SinkError::Broadcast(e.to_string()))
    }
}

/// Addresses and content of the servers to start.
#[derive(Debug, Clone)]
pub struct WebConfig {
    /// Websocket endpoint, served together with the hub.
    pub socket: Option<SocketAddr>,
    /// Static web server address and document root.
    pub web: Option<(SocketAddr, PathBuf)>,
}

/// Handle of the running servers.
pub struct WebServers {
    thread: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    socket_addr: Option<SocketAddr>,
    web_addr: Option<SocketAddr>,
}

impl WebServers {
    /// Bind the configured listeners and start serving.
    ///
    /// Binding happens on the calling thread so address errors surface
    /// before the collector connects to the broker.
    pub fn start(config: &WebConfig, hub: Arc<WsHub>) -> Result<Self, WebError> {
        let socket_listener = config.socket.map(bind).transpose()?;
        let web_listener = match &config.web {
            Some((addr, root)) => Some((bind(*addr)?, root.clone())),
            None => None,
        };
        let socket_addr = socket_listener
            .as_ref()
            .map(std::net::TcpListener::local_addr)
            .transpose()?;
        let web_addr = web_listener
            .as_ref()
            .map(|(l, _)| l.local_addr())
            .transpose()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("magbin-web")
            .enable_all()
            .build()?;
        let (shutdown, watcher) = watch::channel(false);

        let thread = std::thread::Builder::new()
            .name("magbin-web".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let mut tasks = Vec::new();
                    if let Some(listener) = socket_listener {
                        let app = websocket_router(hub);
                        tasks.push(tokio::spawn(serve(listener, app, watcher.clone())));
                    }
                    if let Some((listener, root)) = web_listener {
                        let app = static_router(root);
                        tasks.push(tokio::spawn(serve(listener, app, watcher.clone())));
                    }
                    for task in tasks {
                        if let Err(e) = task.await {
                            error!("web server task failed: {}", e);
                        }
                    }
                });
            })?;

        if let Some(addr) = socket_addr {
            info!("websocket endpoint: ws://{}/", addr);
        }
        if let Some(addr) = web_addr {
            info!("web server: http://{}/", addr);
        }

        Ok(Self {
            thread: Some(thread),
            shutdown,
            socket_addr,
            web_addr,
        })
    }

    /// Bound websocket address.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.socket_addr
    }

    /// Bound static web server address.
    pub fn web_addr(&self) -> Option<SocketAddr> {
        self.web_addr
    }

    /// Stop both servers and wait for the web thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("web thread panicked");
            }
        }
    }
}

impl Drop for WebServers {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind(addr: SocketAddr) -> Result<std::net::TcpListener, WebError> {
    let listener =
        std::net::TcpListener::bind(addr).map_err(|source| WebError::Bind { addr, source })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| WebError::Bind { addr, source })?;
    Ok(listener)
}

async fn serve(listener: std::net::TcpListener, app: Router, mut shutdown: watch::Receiver<bool>) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot register listener: {}", e);
            return;
        }
    };
    let stopped = async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(stopped)
        .await
    {
        error!("web server error: {}", e);
    }
}

fn websocket_router(hub: Arc<WsHub>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(ws_health))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

fn static_router(root: PathBuf) -> Router {
    Router::new()
        .route("/health", get(static_health))
        .fallback_service(ServeDir::new(root))
        .layer(TraceLayer::new_for_http())
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<WsHub>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<WsHub>) {
    let count = hub.clients.fetch_add(1, Ordering::Relaxed) + 1;
    info!("websocket client connected, total: {}", count);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut rx = hub.subscribe();
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Ok(text) => {
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        debug!("websocket send failed, closing");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("websocket client lagged {} messages", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("websocket error: {}", e);
                    break;
                }
            },
        }
    }

    let count = hub.clients.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
    info!("websocket client disconnected, total: {}", count);
}

async fn ws_health(State(hub): State<Arc<WsHub>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "clients": hub.client_count(),
    }))
}

async fn static_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_hub_without_clients_is_ok() {
        let hub = WsHub::new();
        assert!(hub.send_to_all("1700000000000,1.5").is_ok());
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn test_hub_delivers_to_receivers() {
        let hub = WsHub::with_capacity(4);
        let mut rx = hub.subscribe();
        hub.send_to_all("# x,X,nT").unwrap();
        assert_eq!(rx.try_recv().unwrap(), "# x,X,nT");
    }

    #[test]
    fn test_health_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let config = WebConfig {
            socket: Some(local),
            web: Some((local, dir.path().to_path_buf())),
        };
        let servers = WebServers::start(&config, WsHub::new()).unwrap();
        let addr = servers.socket_addr().unwrap();
        assert!(servers.web_addr().is_some());

        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"clients\":0"));

        servers.shutdown();
    }
}
