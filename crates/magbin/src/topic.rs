// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic parsing for the per-sensor publish/subscribe protocol.
//!
//! ```text
//! <station>/<sensorId>meta        header line (schema)
//! <station>/<sensorId>dict        descriptive Key:Value pairs
//! <station>/<sensorId>data        batch payload
//! <station>/<sensorId>/data       same, slash-separated form
//! <station>/statuslog/<hostname>  JSON status envelope
//! ```

use std::fmt;
use thiserror::Error;

/// Kind suffixes stripped from the sensor segment.
const KIND_SUFFIXES: [&str; 3] = ["meta", "data", "dict"];

/// Path segment marking a status envelope topic.
const STATUS_SEGMENT: &str = "statuslog";

/// Topic parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic '{0}' is outside the subscribed station")]
    OtherStation(String),

    #[error("topic '{0}' carries no sensor id")]
    MissingSensor(String),

    #[error("topic '{0}' has no meta/data/dict suffix")]
    UnknownKind(String),
}

/// Message kind carried by a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Header line registering the channel.
    Meta,
    /// Batch payload.
    Data,
    /// Descriptive fields.
    Dict,
    /// Remote station status envelope.
    Status,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Meta => "meta",
            MessageKind::Data => "data",
            MessageKind::Dict => "dict",
            MessageKind::Status => "status",
        };
        f.write_str(s)
    }
}

/// A classified topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    /// Station namespace (first path segment).
    pub station: String,
    /// Bare sensor id, or the hostname for status topics.
    pub sensor_id: String,
    /// Message kind.
    pub kind: MessageKind,
}

/// Station filter applied before any parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationFilter {
    station: Option<String>,
}

impl StationFilter {
    /// Build a filter; `"all"` (any case) accepts every station.
    pub fn new(station: &str) -> Self {
        let station = station.trim();
        if station.is_empty() || station.eq_ignore_ascii_case("all") {
            Self { station: None }
        } else {
            Self {
                station: Some(station.to_string()),
            }
        }
    }

    /// Filter accepting every station.
    pub fn all() -> Self {
        Self { station: None }
    }

    /// Station this filter is pinned to, if any.
    pub fn station(&self) -> Option<&str> {
        self.station.as_deref()
    }

    /// Wildcard subscription for this filter: `<station>/#` or `#`.
    pub fn subscription(&self) -> String {
        match &self.station {
            Some(station) => format!("{}/#", station),
            None => "#".to_string(),
        }
    }

    /// Whether `topic` belongs to the filtered station.
    pub fn accepts(&self, topic: &str) -> bool {
        match &self.station {
            Some(station) => topic
                .strip_prefix(station.as_str())
                .map(|rest| rest.is_empty() || rest.starts_with('/'))
                .unwrap_or(false),
            None => true,
        }
    }

    /// Classify `topic`.
    pub fn parse(&self, topic: &str) -> Result<Topic, TopicError> {
        if !self.accepts(topic) {
            return Err(TopicError::OtherStation(topic.to_string()));
        }

        let station = match &self.station {
            Some(station) => station.clone(),
            None => topic.split('/').next().unwrap_or_default().to_string(),
        };

        if let Some(hostname) = status_hostname(topic) {
            return Ok(Topic {
                station,
                sensor_id: hostname.to_string(),
                kind: MessageKind::Status,
            });
        }

        let kind = if topic.ends_with("meta") {
            MessageKind::Meta
        } else if topic.ends_with("data") {
            MessageKind::Data
        } else if topic.ends_with("dict") {
            MessageKind::Dict
        } else {
            return Err(TopicError::UnknownKind(topic.to_string()));
        };

        let segment = match topic.split('/').nth(1) {
            Some(segment) => segment,
            None => topic.strip_prefix(station.as_str()).unwrap_or(topic),
        };
        let sensor_id = strip_kind_suffixes(segment);
        if sensor_id.is_empty() {
            return Err(TopicError::MissingSensor(topic.to_string()));
        }

        Ok(Topic {
            station,
            sensor_id: sensor_id.to_string(),
            kind,
        })
    }
}

impl Default for StationFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Hostname of a `.../statuslog/<hostname>` topic.
pub fn status_hostname(topic: &str) -> Option<&str> {
    let mut segments = topic.split('/');
    // statuslog is never the first segment
    segments.next()?;
    if segments.any(|s| s == STATUS_SEGMENT) {
        topic.rsplit('/').next().filter(|h| !h.is_empty())
    } else {
        None
    }
}

/// Strip every trailing meta/data/dict suffix, in any order.
pub fn strip_kind_suffixes(segment: &str) -> &str {
    let mut rest = segment;
    loop {
        match KIND_SUFFIXES.iter().find(|suffix| rest.ends_with(*suffix)) {
            Some(suffix) => rest = &rest[..rest.len() - suffix.len()],
            None => return rest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta_topic() {
        let filter = StationFilter::new("wic");
        let topic = filter.parse("wic/LEMI036_1_0002meta").unwrap();
        assert_eq!(topic.station, "wic");
        assert_eq!(topic.sensor_id, "LEMI036_1_0002");
        assert_eq!(topic.kind, MessageKind::Meta);
    }

    #[test]
    fn test_parse_slash_form() {
        let filter = StationFilter::new("wic");
        let topic = filter.parse("wic/Diff_AB_0001/data").unwrap();
        assert_eq!(topic.sensor_id, "Diff_AB_0001");
        assert_eq!(topic.kind, MessageKind::Data);
    }

    #[test]
    fn test_other_station_is_ignored() {
        let filter = StationFilter::new("wic");
        assert_eq!(
            filter.parse("gam/S1data"),
            Err(TopicError::OtherStation("gam/S1data".into()))
        );
        assert!(!filter.accepts("wicx/S1data"));
    }

    #[test]
    fn test_all_mode_takes_station_from_topic() {
        let filter = StationFilter::new("ALL");
        let topic = filter.parse("gam/S1dict").unwrap();
        assert_eq!(topic.station, "gam");
        assert_eq!(topic.sensor_id, "S1");
        assert_eq!(topic.kind, MessageKind::Dict);
        assert_eq!(filter.subscription(), "#");
    }

    #[test]
    fn test_subscription_for_station() {
        assert_eq!(StationFilter::new("wic").subscription(), "wic/#");
    }

    #[test]
    fn test_strip_suffixes_in_any_order() {
        assert_eq!(strip_kind_suffixes("S1data"), "S1");
        assert_eq!(strip_kind_suffixes("S1metadata"), "S1");
        assert_eq!(strip_kind_suffixes("S1datameta"), "S1");
        assert_eq!(strip_kind_suffixes("S1dictdata"), "S1");
        assert_eq!(strip_kind_suffixes("S1"), "S1");
    }

    #[test]
    fn test_status_topic() {
        let filter = StationFilter::new("wic");
        let topic = filter.parse("wic/statuslog/raspberry").unwrap();
        assert_eq!(topic.kind, MessageKind::Status);
        assert_eq!(topic.sensor_id, "raspberry");
        assert_eq!(status_hostname("statuslog/host"), None);
    }

    #[test]
    fn test_unknown_kind() {
        let filter = StationFilter::all();
        assert!(matches!(
            filter.parse("wic/S1/other"),
            Err(TopicError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_missing_sensor() {
        let filter = StationFilter::all();
        assert!(matches!(
            filter.parse("wic/data"),
            Err(TopicError::MissingSensor(_))
        ));
    }
}
