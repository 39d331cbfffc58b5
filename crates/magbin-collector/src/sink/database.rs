// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time-series database sink.
//!
//! On the first batch of a channel in a session the table schema is
//! prepared from the header and descriptive fields, then records are
//! inserted. The bundled client writes InfluxDB v2 Line Protocol:
//!
//! ```text
//! measurement,tag1=val1 field1=val1,field2=val2 timestamp_ns
//! ```

use super::{Sink, SinkBatch, SinkError};
use crate::config::{DatabaseConfig, Destination, Revision};
use crate::mqtt::Publisher;
use magbin::{DecodedBatch, Header, SampleValue};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Measurement holding one metadata point per table.
pub const METADATA_MEASUREMENT: &str = "sensors";

/// Pooled database client, addressed by table name.
pub trait DatabaseClient: Send {
    /// Validate or create the schema of `table`.
    fn ensure_table(
        &mut self,
        table: &str,
        header: &Header,
        fields: &BTreeMap<String, String>,
    ) -> Result<(), SinkError>;

    /// Insert the records of `batch` into `table`.
    fn insert(&mut self, table: &str, batch: &DecodedBatch) -> Result<(), SinkError>;
}

/// Table name of a sensor under `revision`.
pub fn table_name(sensor_id: &str, revision: Revision) -> String {
    match revision {
        Revision::Fixed => format!("{}_0001", sensor_id),
        Revision::Free => sensor_id.to_string(),
    }
}

/// Database sink.
pub struct DatabaseSink {
    client: Box<dyn DatabaseClient>,
    revision: Revision,
    prepared: HashSet<String>,
}

impl DatabaseSink {
    pub fn new(client: Box<dyn DatabaseClient>, revision: Revision) -> Self {
        Self {
            client,
            revision,
            prepared: HashSet::new(),
        }
    }
}

impl Sink for DatabaseSink {
    fn destination(&self) -> Destination {
        Destination::Database
    }

    fn write(&mut self, batch: &SinkBatch<'_>, _out: &mut dyn Publisher) -> Result<(), SinkError> {
        if batch.batch.is_empty() {
            return Ok(());
        }
        let table = table_name(batch.sensor_id, self.revision);
        if !self.prepared.contains(&table) {
            self.client
                .ensure_table(&table, batch.header, batch.fields)?;
            info!(table = %table, "database table prepared");
            self.prepared.insert(table.clone());
        }
        self.client.insert(&table, batch.batch)
    }
}

/// A value that can be stored in a Line Protocol field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    String(String),
}

impl FieldValue {
    /// Format this value for Line Protocol.
    pub fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Float(v) => format!("{}", v),
            FieldValue::String(v) => {
                let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{}\"", escaped)
            }
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line_protocol())
    }
}

impl From<&SampleValue> for FieldValue {
    fn from(value: &SampleValue) -> Self {
        match value {
            SampleValue::Number(v) => FieldValue::Float(*v),
            SampleValue::Text(s) => FieldValue::String(s.clone()),
        }
    }
}

/// Line Protocol writer.
#[derive(Debug, Default)]
pub struct LineProtocolWriter {
    buffer: Vec<String>,
}

impl LineProtocolWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one point. Points without fields are skipped.
    pub fn write_point(
        &mut self,
        measurement: &str,
        tags: &[(&str, &str)],
        fields: &[(&str, FieldValue)],
        timestamp_ns: i64,
    ) {
        if fields.is_empty() {
            return;
        }

        let mut line = escape_measurement(measurement);

        let mut sorted_tags: Vec<_> = tags.iter().filter(|(_, v)| !v.is_empty()).collect();
        sorted_tags.sort_by_key(|(k, _)| *k);
        for (key, value) in sorted_tags {
            line.push(',');
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&escape_key(value));
        }

        line.push(' ');
        for (i, (key, value)) in fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&value.to_line_protocol());
        }

        line.push(' ');
        line.push_str(&timestamp_ns.to_string());
        self.buffer.push(line);
    }

    /// Take all buffered lines.
    pub fn flush(&mut self) -> Vec<String> {
        std::mem::take(&mut self.buffer)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Escape tag keys, tag values and field keys.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// Render the points of a batch for `table`.
pub fn batch_lines(table: &str, batch: &DecodedBatch) -> Vec<String> {
    let mut writer = LineProtocolWriter::new();
    for record in &batch.records {
        let fields: Vec<(&str, FieldValue)> = batch
            .keys
            .iter()
            .zip(&record.values)
            .map(|(key, value)| (key.as_str(), FieldValue::from(value)))
            .collect();
        let ts = record.timestamp.timestamp_micros() * 1000;
        writer.write_point(table, &[], &fields, ts);
    }
    writer.flush()
}

/// Render the metadata point of `table`.
pub fn metadata_line(
    table: &str,
    header: &Header,
    fields: &BTreeMap<String, String>,
    timestamp_ns: i64,
) -> Option<String> {
    let mut values: Vec<(&str, FieldValue)> = fields
        .iter()
        .map(|(k, v)| (k.as_str(), FieldValue::String(v.clone())))
        .collect();
    let units = header.units.join(",");
    values.push(("SensorUnits", FieldValue::String(units)));
    let mut writer = LineProtocolWriter::new();
    writer.write_point(METADATA_MEASUREMENT, &[("table", table)], &values, timestamp_ns);
    writer.flush().into_iter().next()
}

/// InfluxDB v2 client over the HTTP write API.
pub struct InfluxClient {
    http: reqwest::blocking::Client,
    write_url: String,
    org: String,
    bucket: String,
    token: Option<String>,
}

impl InfluxClient {
    /// Build a client; `token` is the resolved API token.
    pub fn new(config: &DatabaseConfig, token: Option<String>) -> Result<Self, SinkError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SinkError::Database(e.to_string()))?;
        Ok(Self {
            http,
            write_url: format!("{}/api/v2/write", config.url.trim_end_matches('/')),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token,
        })
    }

    fn post(&self, lines: Vec<String>) -> Result<(), SinkError> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut request = self
            .http
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .body(lines.join("\n"));
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Token {}", token));
        }
        let response = request
            .send()
            .map_err(|e| SinkError::Database(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| SinkError::Database(e.to_string()))?;
        debug!(lines = lines.len(), "database write");
        Ok(())
    }
}

impl DatabaseClient for InfluxClient {
    fn ensure_table(
        &mut self,
        table: &str,
        header: &Header,
        fields: &BTreeMap<String, String>,
    ) -> Result<(), SinkError> {
        let now = chrono::Utc::now().timestamp_micros() * 1000;
        match metadata_line(table, header, fields, now) {
            Some(line) => self.post(vec![line]),
            None => Ok(()),
        }
    }

    fn insert(&mut self, table: &str, batch: &DecodedBatch) -> Result<(), SinkError> {
        self.post(batch_lines(table, batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::Outbox;
    use magbin::decode_batch;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Calls {
        ensured: Vec<String>,
        inserted: Vec<(String, usize)>,
    }

    struct MemoryClient(Arc<Mutex<Calls>>);

    impl DatabaseClient for MemoryClient {
        fn ensure_table(
            &mut self,
            table: &str,
            _header: &Header,
            _fields: &BTreeMap<String, String>,
        ) -> Result<(), SinkError> {
            self.0.lock().ensured.push(table.to_string());
            Ok(())
        }

        fn insert(&mut self, table: &str, batch: &DecodedBatch) -> Result<(), SinkError> {
            self.0.lock().inserted.push((table.to_string(), batch.len()));
            Ok(())
        }
    }

    #[test]
    fn test_table_prepared_once() {
        let header = Header::parse("# MagPyBin S1 [x] [X] [nT] [1] <6hLl 20").unwrap();
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut sink = DatabaseSink::new(Box::new(MemoryClient(calls.clone())), Revision::Fixed);
        let fields = BTreeMap::new();

        for payload in ["2024,1,1,0,0,0,0,1", "2024,1,1,0,0,1,0,2;2024,1,1,0,0,2,0,3"] {
            let decoded = decode_batch(&header, payload);
            let batch = SinkBatch {
                station: "wic",
                sensor_id: "S1",
                header: &header,
                fields: &fields,
                payload,
                batch: &decoded,
            };
            sink.write(&batch, &mut Outbox::new()).unwrap();
        }

        let calls = calls.lock();
        assert_eq!(calls.ensured, vec!["S1_0001"]);
        assert_eq!(
            calls.inserted,
            vec![("S1_0001".to_string(), 1), ("S1_0001".to_string(), 2)]
        );
    }

    #[test]
    fn test_batch_lines() {
        let header =
            Header::parse("# MagPyBin S1 [x,str1] [X,S] [nT,-] [1000,1] <6hLl4s 24").unwrap();
        let batch = decode_batch(&header, "2024,1,1,0,0,0,0,21350,a b");
        let lines = batch_lines("S1", &batch);
        assert_eq!(lines, vec!["S1 x=21.35,str1=\"a b\" 1704067200000000000"]);
    }

    #[test]
    fn test_metadata_line() {
        let header = Header::parse("# MagPyBin S1 [x] [X] [nT] [1] <6hLl 20").unwrap();
        let mut fields = BTreeMap::new();
        fields.insert("PierID".to_string(), "A2".to_string());
        let line = metadata_line("S 1", &header, &fields, 5).unwrap();
        assert_eq!(line, "sensors,table=S\\ 1 PierID=\"A2\",SensorUnits=\"nT\" 5");
    }

    #[test]
    fn test_table_name() {
        assert_eq!(table_name("S1", Revision::Free), "S1");
        assert_eq!(table_name("S1", Revision::Fixed), "S1_0001");
    }

    #[test]
    fn test_field_value_formats() {
        assert_eq!(FieldValue::from(&SampleValue::Number(42.0)).to_line_protocol(), "42");
        assert_eq!(FieldValue::from(&SampleValue::Number(-1.25)).to_line_protocol(), "-1.25");
        assert_eq!(
            FieldValue::from(&SampleValue::Text("A2".into())),
            FieldValue::String("A2".into())
        );
        assert_eq!(
            FieldValue::String("say \"hi\"".into()).to_line_protocol(),
            "\"say \\\"hi\\\"\""
        );
    }
}
