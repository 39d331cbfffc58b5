// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MagPyBin collector CLI
//!
//! Subscribe to a station on an MQTT broker and store or forward its
//! sensor data.
//!
//! # Usage
//!
//! ```bash
//! # Print everything station "wic" publishes
//! magbin-collector --broker broker.example.org --station wic
//!
//! # Write daily buffer files and serve a websocket stream
//! magbin-collector -c collector.yaml --destination file,websocket --filepath /srv/mqtt
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use magbin::{PluginRegistry, StationFilter};
use magbin_collector::config::{CollectorConfig, Destination};
use magbin_collector::credentials::YamlCredentialStore;
use magbin_collector::mqtt::Session;
use magbin_collector::sink::Broadcaster;
use magbin_collector::{build_sinks, session_config, Collector, WebConfig, WebServers, WsHub};
use std::fs::OpenOptions;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "magbin-collector")]
#[command(author = "naskel.com")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Collect MagPyBin sensor data from an MQTT broker")]
#[command(long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker address
    #[arg(short, long)]
    broker: Option<String>,

    /// Broker port
    #[arg(short, long)]
    port: Option<u16>,

    /// Station to collect ("all" for every station)
    #[arg(short, long)]
    station: Option<String>,

    /// Sinks, comma separated (file, websocket, diff, stdout, db, stringio)
    #[arg(short, long, value_delimiter = ',')]
    destination: Vec<Destination>,

    /// Directory of the daily buffer files
    #[arg(short, long)]
    filepath: Option<PathBuf>,

    /// Subscription QoS
    #[arg(short, long)]
    qos: Option<u8>,

    /// Credential store entry holding broker user and password
    #[arg(long)]
    credentials: Option<String>,

    /// Only collect sensors whose id contains this fragment
    #[arg(short, long)]
    instrument: Option<String>,

    /// Log destination: "stdout" or a file path
    #[arg(short, long)]
    logging: Option<String>,

    /// Verbose mode (debug logs)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;
    init_tracing(&config.logging, cli.verbose);

    config.validate().context("Invalid configuration")?;

    tracing::info!(
        broker = %config.broker,
        port = config.port,
        station = %config.station,
        destinations = ?config.destination,
        "Starting MagPyBin collector"
    );

    let store = YamlCredentialStore::load_or_empty(config.credential_file.as_deref());

    let hub = WsHub::new();
    let web = if config.has(Destination::Websocket) {
        Some(start_web(&config, hub.clone())?)
    } else {
        None
    };
    let broadcaster: Option<Arc<dyn Broadcaster>> = web.as_ref().map(|_| {
        let hub: Arc<dyn Broadcaster> = hub.clone();
        hub
    });

    let sinks = build_sinks(&config, &store, broadcaster).context("Failed to set up sinks")?;
    let plugins =
        PluginRegistry::from_names(&config.plugins).context("Failed to load payload plugins")?;
    let mut collector = Collector::builder(StationFilter::new(&config.station))
        .sinks(sinks.sinks)
        .plugins(plugins)
        .instrument(config.instrument.clone())
        .blacklist(config.blacklist.iter().cloned())
        .abort_on_sensor_mismatch(config.abort_on_sensor_mismatch)
        .build();

    let mut session = Session::new(
        session_config(&config, &store).context("Failed to configure broker session")?,
    );

    let stop = Arc::new(AtomicBool::new(false));
    ctrlc_handler(stop.clone());

    let result = session.run(&stop, |topic, payload, out| {
        collector.handle_message(topic, payload, out)
    });

    if let Some(web) = web {
        web.shutdown();
    }

    let stats = collector.stats();
    let session_stats = session.stats();
    tracing::info!(
        connects = session_stats.connects,
        received = stats.received,
        ignored = stats.ignored,
        dropped = stats.dropped,
        registered = stats.registered,
        records_decoded = stats.records_decoded,
        records_skipped = stats.records_skipped,
        sink_failures = stats.sink_failures,
        published = session_stats.published,
        "Collector shutdown complete"
    );

    result.context("Broker session ended with an error")?;
    Ok(())
}

fn build_config(cli: &Cli) -> Result<CollectorConfig> {
    let mut config = match &cli.config {
        Some(path) => CollectorConfig::from_file(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?,
        None => CollectorConfig::default(),
    };

    if let Some(broker) = &cli.broker {
        config.broker = broker.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(station) = &cli.station {
        config.station = station.clone();
    }
    if !cli.destination.is_empty() {
        config.destination = cli.destination.clone();
    }
    if let Some(filepath) = &cli.filepath {
        config.filepath = filepath.clone();
    }
    if let Some(qos) = cli.qos {
        config.qos = qos;
    }
    if let Some(credentials) = &cli.credentials {
        config.credentials = Some(credentials.clone());
    }
    if let Some(instrument) = &cli.instrument {
        config.instrument = Some(instrument.clone());
    }
    if let Some(logging) = &cli.logging {
        config.logging = logging.clone();
    }
    Ok(config)
}

/// Install the tracing subscriber, writing to stdout or appending to a file.
fn init_tracing(logging: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("magbin=debug,magbin_collector=debug")
    } else {
        EnvFilter::new("magbin=info,magbin_collector=info")
    };

    if logging.is_empty() || logging == "stdout" {
        fmt().with_env_filter(filter).with_target(false).init();
        return;
    }

    match OpenOptions::new().create(true).append(true).open(logging) {
        Ok(file) => {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        Err(e) => {
            fmt().with_env_filter(filter).with_target(false).init();
            tracing::warn!("Cannot open log file {}: {}, logging to stdout", logging, e);
        }
    }
}

fn start_web(config: &CollectorConfig, hub: Arc<WsHub>) -> Result<WebServers> {
    let any = Ipv4Addr::UNSPECIFIED;
    let web = if config.webpath.is_dir() {
        Some((SocketAddr::from((any, config.webport)), config.webpath.clone()))
    } else {
        tracing::warn!(
            "Web path {} is not a directory, static web server disabled",
            config.webpath.display()
        );
        None
    };
    if config.socketport == config.webport && web.is_some() {
        bail!("socketport and webport must differ ({})", config.socketport);
    }
    let web_config = WebConfig {
        socket: Some(SocketAddr::from((any, config.socketport))),
        web,
    };
    WebServers::start(&web_config, hub).context("Failed to start web servers")
}

/// Setup Ctrl+C handler.
fn ctrlc_handler(stop: Arc<AtomicBool>) {
    let _ = ctrlc::set_handler(move || {
        tracing::info!("Received Ctrl+C, shutting down...");
        stop.store(true, Ordering::Relaxed);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from([
            "magbin-collector",
            "--broker",
            "broker.example.org",
            "--station",
            "all",
            "--destination",
            "file,stdout",
            "--qos",
            "1",
        ]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.broker, "broker.example.org");
        assert_eq!(config.station, "all");
        assert_eq!(config.destination, vec![Destination::File, Destination::Stdout]);
        assert_eq!(config.qos, 1);
        assert_eq!(config.port, 1883);
    }

    #[test]
    fn test_config_file_then_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.yaml");
        std::fs::write(&path, "broker: mqtt.local\nport: 8883\nstation: gam\n").unwrap();
        let cli = Cli::parse_from([
            "magbin-collector",
            "-c",
            path.to_str().unwrap(),
            "--port",
            "1884",
        ]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.broker, "mqtt.local");
        assert_eq!(config.port, 1884);
        assert_eq!(config.station, "gam");
    }
}
