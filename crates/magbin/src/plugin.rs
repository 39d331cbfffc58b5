// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload plugins for vendor formats.
//!
//! A plugin claims topics outside the meta/data/dict protocol and turns
//! their payload into a header line, descriptive fields and a data line.
//! Plugins are selected by name from static configuration.

use std::collections::BTreeMap;
use thiserror::Error;

/// Plugin errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    #[error("unknown payload plugin '{0}'")]
    UnknownPlugin(String),

    #[error("payload is not valid JSON: {0}")]
    Json(String),

    #[error("payload lacks field '{0}'")]
    MissingField(&'static str),

    #[error("payload data is not valid base64: {0}")]
    Base64(String),

    #[error("payload data is {0} bytes, too short")]
    TooShort(usize),
}

/// Output of a plugin: everything the collector needs to treat the
/// message like a meta + data pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginPayload {
    /// Sensor id the payload belongs to.
    pub sensor_id: String,
    /// Meta header line for the sensor.
    pub header_line: String,
    /// Descriptive fields to merge into the channel.
    pub fields: BTreeMap<String, String>,
    /// Data line (batch payload).
    pub data: String,
}

/// Capability interface of a payload plugin.
pub trait PayloadPlugin: Send {
    /// Configuration name.
    fn name(&self) -> &'static str;

    /// Whether this plugin handles `topic`.
    fn matches(&self, topic: &str) -> bool;

    /// Decode a payload of a matching topic.
    fn decode(&self, topic: &str, payload: &[u8]) -> Result<PluginPayload, PluginError>;
}

/// Topic prefix/suffix pair identifying a plugin's topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicIdentifier {
    pub starts_with: &'static str,
    pub ends_with: &'static str,
}

impl TopicIdentifier {
    pub fn matches(&self, topic: &str) -> bool {
        topic.starts_with(self.starts_with) && topic.ends_with(self.ends_with)
    }
}

/// Names of the built-in plugins available in this build.
pub fn builtin_names() -> Vec<&'static str> {
    let mut names = Vec::new();
    #[cfg(feature = "lorawan")]
    names.push(crate::lorawan::NAME);
    names
}

fn builtin(name: &str) -> Option<Box<dyn PayloadPlugin>> {
    match name {
        #[cfg(feature = "lorawan")]
        crate::lorawan::NAME => Some(Box::new(crate::lorawan::LorawanPlugin::new())),
        _ => None,
    }
}

/// Ordered set of active plugins. The first match wins.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn PayloadPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate built-in plugins by name.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, PluginError> {
        let mut registry = Self::new();
        for name in names {
            let name = name.as_ref().trim().to_ascii_lowercase();
            let plugin = builtin(&name).ok_or(PluginError::UnknownPlugin(name))?;
            registry.register(plugin);
        }
        Ok(registry)
    }

    pub fn register(&mut self, plugin: Box<dyn PayloadPlugin>) {
        self.plugins.push(plugin);
    }

    /// First plugin handling `topic`.
    pub fn find(&self, topic: &str) -> Option<&dyn PayloadPlugin> {
        self.plugins
            .iter()
            .find(|p| p.matches(topic))
            .map(|p| p.as_ref())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}
