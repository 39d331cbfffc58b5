// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Diagnostic output: one log line per record.

use super::{Sink, SinkBatch, SinkError};
use crate::config::Destination;
use crate::mqtt::Publisher;
use magbin::SampleRecord;
use tracing::info;

/// Format one record as `sensor: timestamp,v1,v2,...`.
pub fn format_record(sensor_id: &str, record: &SampleRecord) -> String {
    format!(
        "{}: {},{}",
        sensor_id,
        record.timestamp.format("%Y-%m-%d %H:%M:%S%.f"),
        record.values_csv()
    )
}

/// Logs every record through `tracing`.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        Self
    }
}

impl Sink for StdoutSink {
    fn destination(&self) -> Destination {
        Destination::Stdout
    }

    fn write(&mut self, batch: &SinkBatch<'_>, _out: &mut dyn Publisher) -> Result<(), SinkError> {
        for record in &batch.batch.records {
            info!("{}", format_record(batch.sensor_id, record));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magbin::{decode_batch, Header};

    #[test]
    fn test_format_record() {
        let header =
            Header::parse("# MagPyBin S1 [x,str1] [X,S] [nT,-] [10,1] <6hLl4s 24").unwrap();
        let batch = decode_batch(&header, "2024,6,1,12,30,15,250000,125,ok");
        assert_eq!(
            format_record("S1", &batch.records[0]),
            "S1: 2024-06-01 12:30:15.250,12.5,ok"
        );
    }
}
