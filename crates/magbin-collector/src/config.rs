// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Collector configuration.
//!
//! Loaded from YAML and then overridden by command line flags:
//!
//! ```yaml
//! broker: broker.example.org
//! port: 8883
//! station: wic
//! destination: [file, websocket, stdout]
//! filepath: /srv/mqtt
//! differential:
//!   sensors: G823
//!   every: 10
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A sink target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    #[serde(rename = "file")]
    File,
    #[serde(rename = "websocket")]
    Websocket,
    #[serde(rename = "diff")]
    Differential,
    #[serde(rename = "stdout")]
    Stdout,
    #[serde(rename = "db")]
    Database,
    #[serde(rename = "stringio")]
    StringBuffer,
}

impl Destination {
    /// Fan-out order of the sinks.
    pub const ORDER: [Destination; 6] = [
        Destination::File,
        Destination::Websocket,
        Destination::Differential,
        Destination::Stdout,
        Destination::Database,
        Destination::StringBuffer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::File => "file",
            Destination::Websocket => "websocket",
            Destination::Differential => "diff",
            Destination::Stdout => "stdout",
            Destination::Database => "db",
            Destination::StringBuffer => "stringio",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Destination {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Destination::ORDER
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown destination '{}'", s)))
    }
}

/// Requested broker transport security.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Decide from the port and PSK settings.
    #[default]
    Auto,
    None,
    Tls,
    Psk,
}

impl FromStr for SecurityMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(SecurityMode::Auto),
            "none" => Ok(SecurityMode::None),
            "tls" => Ok(SecurityMode::Tls),
            "psk" => Ok(SecurityMode::Psk),
            other => Err(ConfigError::Invalid(format!(
                "unknown security mode '{}'",
                other
            ))),
        }
    }
}

/// Transport actually used for the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSecurity {
    Plain,
    Tls,
    Psk,
}

/// Database table naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Revision {
    /// Table `<sensor>_0001`.
    Fixed,
    /// Table `<sensor>`.
    #[default]
    Free,
}

/// Time-series database settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Server URL (e.g. "http://localhost:8086").
    pub url: String,
    /// Organization.
    #[serde(default)]
    pub org: String,
    /// Bucket receiving the samples.
    pub bucket: String,
    /// API token.
    #[serde(default)]
    pub token: Option<String>,
    /// Credential store entry holding the token as `passwd`.
    #[serde(default)]
    pub credentials: Option<String>,
}

/// Differential stream settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferentialConfig {
    /// Sensor-name fragment selecting the two channels.
    #[serde(default = "default_diff_sensors")]
    pub sensors: String,
    /// Emit every N qualifying messages.
    #[serde(default = "default_diff_every")]
    pub every: u32,
    /// Records kept per channel.
    #[serde(default = "default_diff_window")]
    pub window: usize,
    /// Maximum timestamp difference of subtracted records.
    #[serde(default = "default_diff_tolerance")]
    pub tolerance_ms: i64,
}

fn default_diff_sensors() -> String {
    "G823".to_string()
}

fn default_diff_every() -> u32 {
    1
}

fn default_diff_window() -> usize {
    5
}

fn default_diff_tolerance() -> i64 {
    1000
}

impl Default for DifferentialConfig {
    fn default() -> Self {
        Self {
            sensors: default_diff_sensors(),
            every: default_diff_every(),
            window: default_diff_window(),
            tolerance_ms: default_diff_tolerance(),
        }
    }
}

/// Top-level collector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Broker host.
    #[serde(default = "default_broker")]
    pub broker: String,
    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// MQTT keep-alive interval.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
    /// Station filter ("all" subscribes to every station).
    #[serde(default = "default_station")]
    pub station: String,
    /// Subscription QoS.
    #[serde(default)]
    pub qos: u8,
    /// Broker user (overrides `credentials`).
    #[serde(default)]
    pub user: Option<String>,
    /// Broker password (overrides `credentials`).
    #[serde(default)]
    pub password: Option<String>,
    /// Credential store entry for user/password.
    #[serde(default)]
    pub credentials: Option<String>,
    /// Destination id appended to the client identity.
    #[serde(default)]
    pub client_suffix: String,
    /// Transport security.
    #[serde(default)]
    pub security: SecurityMode,
    /// CA certificate (PEM) for TLS.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    /// Credential store entry holding the PSK identity and hex key.
    #[serde(default)]
    pub psk: Option<String>,
    /// Active sinks.
    #[serde(default = "default_destination")]
    pub destination: Vec<Destination>,
    /// Root directory of the buffer files.
    #[serde(default = "default_filepath")]
    pub filepath: PathBuf,
    /// Database settings.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Database table naming.
    #[serde(default)]
    pub revision: Revision,
    /// Websocket server port.
    #[serde(default = "default_socketport")]
    pub socketport: u16,
    /// Static web server port.
    #[serde(default = "default_webport")]
    pub webport: u16,
    /// Directory served by the static web server.
    #[serde(default = "default_webpath")]
    pub webpath: PathBuf,
    /// Only collect sensors whose id contains this fragment.
    #[serde(default)]
    pub instrument: Option<String>,
    /// Sensor ids never collected.
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Differential stream settings.
    #[serde(default)]
    pub differential: DifferentialConfig,
    /// End the session when a header names another sensor than its topic.
    #[serde(default = "default_true")]
    pub abort_on_sensor_mismatch: bool,
    /// Log destination: "stdout" or a file path.
    #[serde(default = "default_logging")]
    pub logging: String,
    /// Credential store file.
    #[serde(default = "default_credential_file")]
    pub credential_file: Option<PathBuf>,
    /// Payload plugins to enable.
    #[serde(default)]
    pub plugins: Vec<String>,
}

fn default_broker() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive() -> u16 {
    60
}

fn default_station() -> String {
    "wic".to_string()
}

fn default_destination() -> Vec<Destination> {
    vec![Destination::Stdout]
}

fn default_filepath() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_socketport() -> u16 {
    5000
}

fn default_webport() -> u16 {
    8080
}

fn default_webpath() -> PathBuf {
    PathBuf::from("./web")
}

fn default_true() -> bool {
    true
}

fn default_logging() -> String {
    "stdout".to_string()
}

fn default_credential_file() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".magbin/credentials.yaml"))
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            port: default_port(),
            keepalive_secs: default_keepalive(),
            station: default_station(),
            qos: 0,
            user: None,
            password: None,
            credentials: None,
            client_suffix: String::new(),
            security: SecurityMode::Auto,
            ca_cert: None,
            psk: None,
            destination: default_destination(),
            filepath: default_filepath(),
            database: None,
            revision: Revision::Free,
            socketport: default_socketport(),
            webport: default_webport(),
            webpath: default_webpath(),
            instrument: None,
            blacklist: Vec::new(),
            differential: DifferentialConfig::default(),
            abort_on_sensor_mismatch: true,
            logging: default_logging(),
            credential_file: default_credential_file(),
            plugins: Vec::new(),
        }
    }
}

impl CollectorConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Parse configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Whether `dest` is an active sink.
    pub fn has(&self, dest: Destination) -> bool {
        self.destination.contains(&dest)
    }

    /// QoS actually requested; out-of-range values fall back to 1.
    pub fn effective_qos(&self) -> u8 {
        if self.qos > 2 {
            1
        } else {
            self.qos
        }
    }

    /// Transport selected by the security mode and port.
    pub fn transport_security(&self) -> TransportSecurity {
        let has_psk = self.psk.as_deref().is_some_and(|p| !p.is_empty());
        match self.security {
            SecurityMode::None => TransportSecurity::Plain,
            SecurityMode::Tls => TransportSecurity::Tls,
            SecurityMode::Psk => TransportSecurity::Psk,
            SecurityMode::Auto => match (self.port, has_psk) {
                (8883, false) => TransportSecurity::Tls,
                (8883 | 8884, true) => TransportSecurity::Psk,
                _ => TransportSecurity::Plain,
            },
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.trim().is_empty() {
            return Err(ConfigError::Invalid("broker address is empty".into()));
        }
        if self.has(Destination::File) && !self.filepath.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "file destination path {} is not an existing directory",
                self.filepath.display()
            )));
        }
        if self.has(Destination::Database) && self.database.is_none() {
            return Err(ConfigError::Invalid(
                "db destination requires database settings".into(),
            ));
        }
        if self.transport_security() == TransportSecurity::Psk && self.psk.is_none() {
            return Err(ConfigError::Invalid(
                "psk security requires a psk credential entry".into(),
            ));
        }
        if self.differential.every == 0 {
            return Err(ConfigError::Invalid(
                "differential.every must be at least 1".into(),
            ));
        }
        if self.differential.window == 0 {
            return Err(ConfigError::Invalid(
                "differential.window must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_YAML: &str = r#"
broker: broker.example.org
port: 8883
station: gam
qos: 7
credentials: mqtt
client_suffix: backup
destination: [file, websocket, diff, db]
filepath: /tmp
database:
  url: "http://localhost:8086"
  org: obs
  bucket: magnetism
  credentials: influx
revision: fixed
instrument: LEMI
blacklist: [BM35_1_0001]
differential:
  sensors: G823
  every: 10
abort_on_sensor_mismatch: false
plugins: [lorawan]
"#;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config = CollectorConfig::from_yaml("").unwrap();
        assert_eq!(config.broker, "localhost");
        assert_eq!(config.port, 1883);
        assert_eq!(config.station, "wic");
        assert_eq!(config.destination, vec![Destination::Stdout]);
        assert_eq!(config.socketport, 5000);
        assert_eq!(config.differential, DifferentialConfig::default());
        assert!(config.abort_on_sensor_mismatch);
        assert_eq!(config.transport_security(), TransportSecurity::Plain);
    }

    #[test]
    fn test_full_yaml() {
        let config = CollectorConfig::from_yaml(FULL_YAML).unwrap();
        assert_eq!(config.broker, "broker.example.org");
        assert_eq!(config.effective_qos(), 1);
        assert!(config.has(Destination::Differential));
        assert!(!config.has(Destination::Stdout));
        assert_eq!(config.revision, Revision::Fixed);
        assert_eq!(config.differential.every, 10);
        assert_eq!(config.differential.window, 5);
        assert_eq!(config.database.as_ref().unwrap().credentials.as_deref(), Some("influx"));
        assert!(!config.abort_on_sensor_mismatch);
        assert_eq!(config.plugins, vec!["lorawan"]);
        assert_eq!(config.transport_security(), TransportSecurity::Tls);
        config.validate().unwrap();
    }

    #[test]
    fn test_port_rule_for_psk() {
        let mut config = CollectorConfig {
            port: 8884,
            psk: Some("mqttpsk".into()),
            ..Default::default()
        };
        assert_eq!(config.transport_security(), TransportSecurity::Psk);
        config.port = 8883;
        assert_eq!(config.transport_security(), TransportSecurity::Psk);
        config.psk = None;
        assert_eq!(config.transport_security(), TransportSecurity::Tls);
        config.security = SecurityMode::None;
        assert_eq!(config.transport_security(), TransportSecurity::Plain);
    }

    #[test]
    fn test_validate_rejects_missing_settings() {
        let config = CollectorConfig {
            destination: vec![Destination::Database],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = CollectorConfig {
            destination: vec![Destination::File],
            filepath: PathBuf::from("/nonexistent/magbin/path"),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_destination_from_str() {
        assert_eq!("DB".parse::<Destination>().unwrap(), Destination::Database);
        assert_eq!(
            "stringio".parse::<Destination>().unwrap(),
            Destination::StringBuffer
        );
        assert!("printer".parse::<Destination>().is_err());
    }

    #[test]
    fn test_unknown_destination_in_yaml() {
        assert!(matches!(
            CollectorConfig::from_yaml("destination: [printer]"),
            Err(ConfigError::Yaml(_))
        ));
    }
}
