// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory CSV buffer.
//!
//! Lines are `millis,date,v1,v2,...` terminated by `\r\n`. The buffer is
//! shared: the collector appends, any holder of a [`StringBuffer`] clone
//! reads or drains it.

use super::{Sink, SinkBatch, SinkError};
use crate::config::Destination;
use crate::mqtt::Publisher;
use parking_lot::Mutex;
use std::sync::Arc;

/// Line terminator of buffered lines.
pub const EOL: &str = "\r\n";

/// Shared handle to the buffered text.
#[derive(Debug, Clone, Default)]
pub struct StringBuffer {
    inner: Arc<Mutex<String>>,
}

impl StringBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the buffered text.
    pub fn contents(&self) -> String {
        self.inner.lock().clone()
    }

    /// Take the buffered text, leaving the buffer empty.
    pub fn take(&self) -> String {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn push_line(&self, line: &str) {
        let mut inner = self.inner.lock();
        inner.push_str(line);
        inner.push_str(EOL);
    }
}

/// Sink appending to a [`StringBuffer`].
#[derive(Debug, Clone, Default)]
pub struct StringBufferSink {
    buffer: StringBuffer,
}

impl StringBufferSink {
    pub fn new(buffer: StringBuffer) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> StringBuffer {
        self.buffer.clone()
    }
}

impl Sink for StringBufferSink {
    fn destination(&self) -> Destination {
        Destination::StringBuffer
    }

    fn write(&mut self, batch: &SinkBatch<'_>, _out: &mut dyn Publisher) -> Result<(), SinkError> {
        for record in &batch.batch.records {
            let mut line = format!(
                "{},{}",
                record.timestamp_millis(),
                record.timestamp.format("%Y-%m-%d %H:%M:%S%.6f")
            );
            let values = record.values_csv();
            if !values.is_empty() {
                line.push(',');
                line.push_str(&values);
            }
            self.buffer.push_line(&line);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::Outbox;
    use magbin::{decode_batch, Header};
    use std::collections::BTreeMap;

    #[test]
    fn test_lines_have_crlf() {
        let header = Header::parse("# MagPyBin S1 [x] [X] [nT] [100] <6hLl 20").unwrap();
        let payload = "2024,1,1,0,0,0,0,150;2024,1,1,0,0,1,0,250";
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

        let buffer = StringBuffer::new();
        let mut sink = StringBufferSink::new(buffer.clone());
        sink.write(&batch, &mut Outbox::new()).unwrap();

        assert_eq!(
            buffer.take(),
            "1704067200000,2024-01-01 00:00:00.000000,1.5\r\n\
             1704067201000,2024-01-01 00:00:01.000000,2.5\r\n"
        );
        assert!(buffer.is_empty());
    }
}
