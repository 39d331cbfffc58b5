// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Live websocket broadcast.
//!
//! Clients receive one descriptor per key when a channel is registered,
//! then one line per record:
//!
//! ```text
//! # {"sensorid":"S1","nr":0,"key":"x","elem":"X","unit":"nT"}
//! S1: 1704067200000,21.35,48.9
//! ```

use super::{Sink, SinkBatch, SinkError};
use crate::config::Destination;
use crate::mqtt::Publisher;
use magbin::Header;
use serde::Serialize;
use std::sync::Arc;

/// Fan-out of text messages to all connected clients.
pub trait Broadcaster: Send + Sync {
    /// Send `message` to every client.
    fn send_to_all(&self, message: &str) -> Result<(), SinkError>;
}

#[derive(Serialize)]
struct Descriptor<'a> {
    sensorid: &'a str,
    nr: usize,
    key: &'a str,
    elem: &'a str,
    unit: &'a str,
}

/// Descriptor lines of a header.
pub fn descriptor_lines(sensor_id: &str, header: &Header) -> Vec<String> {
    header
        .keys
        .iter()
        .enumerate()
        .map(|(nr, key)| {
            let descriptor = Descriptor {
                sensorid: sensor_id,
                nr,
                key,
                elem: header.elements.get(nr).map(String::as_str).unwrap_or(""),
                unit: header.units.get(nr).map(String::as_str).unwrap_or(""),
            };
            let json = serde_json::to_string(&descriptor).unwrap_or_default();
            format!("# {}", json)
        })
        .collect()
}

/// Websocket sink.
pub struct WebsocketSink {
    broadcaster: Arc<dyn Broadcaster>,
}

impl WebsocketSink {
    pub fn new(broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self { broadcaster }
    }
}

impl Sink for WebsocketSink {
    fn destination(&self) -> Destination {
        Destination::Websocket
    }

    fn on_register(&mut self, sensor_id: &str, header: &Header) -> Result<(), SinkError> {
        for line in descriptor_lines(sensor_id, header) {
            self.broadcaster.send_to_all(&line)?;
        }
        Ok(())
    }

    fn write(&mut self, batch: &SinkBatch<'_>, _out: &mut dyn Publisher) -> Result<(), SinkError> {
        for record in &batch.batch.records {
            let line = format!(
                "{}: {},{}",
                batch.sensor_id,
                record.timestamp_millis(),
                record.values_csv()
            );
            self.broadcaster.send_to_all(&line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::Outbox;
    use magbin::decode_batch;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Broadcaster for Recorder {
        fn send_to_all(&self, message: &str) -> Result<(), SinkError> {
            self.0.lock().push(message.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_descriptors_and_data_lines() {
        let header =
            Header::parse("# MAGBIN 1 S1 [t1,x] [T,X] [degC,nT] [1000,1000] <6hLll 24").unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut sink = WebsocketSink::new(recorder.clone());

        sink.on_register("S1", &header).unwrap();
        let payload = "2024,01,01,00,00,00,0,21350,48900";
        let decoded = decode_batch(&header, payload);
        let fields = BTreeMap::new();
        let batch = SinkBatch {
            station: "wic",
            sensor_id: "S1",
            header: &header,
            fields: &fields,
            payload,
            batch: &decoded,
        };
        sink.write(&batch, &mut Outbox::new()).unwrap();

        let sent = recorder.0.lock();
        assert_eq!(sent.len(), 3);
        assert_eq!(
            sent[0],
            r##"# {"sensorid":"S1","nr":0,"key":"t1","elem":"T","unit":"degC"}"##
        );
        assert_eq!(sent[2], "S1: 1704067200000,21.35,48.9");
    }
}
