// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-day binary buffer files.
//!
//! ```text
//! <root>/<sensor>/<sensor>_<YYYY-MM-DD>.bin
//! ```
//!
//! The day is the collector's current UTC day, not the sample time. The
//! header line is written when the file is created; frames are appended.
//! Only lines the decoder accepts become frames.

use super::{Sink, SinkBatch, SinkError};
use crate::config::Destination;
use crate::mqtt::Publisher;
use chrono::{DateTime, Utc};
use magbin::decode::{decode_record, RECORD_SEPARATOR};
use magbin::frame::{encode_line, file_header_line, write_frame, EncodeError};
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Clock used to pick the day of the file.
pub type Clock = Box<dyn Fn() -> DateTime<Utc> + Send>;

/// Buffer file sink.
pub struct FileSink {
    root: PathBuf,
    clock: Clock,
    location_reported: bool,
}

impl FileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_clock(root, Box::new(Utc::now))
    }

    /// Use `clock` instead of the system time.
    pub fn with_clock(root: impl Into<PathBuf>, clock: Clock) -> Self {
        Self {
            root: root.into(),
            clock,
            location_reported: false,
        }
    }

    /// Path of the buffer file for `sensor_id` on the day of `now`.
    pub fn path_for(&self, sensor_id: &str, now: &DateTime<Utc>) -> PathBuf {
        buffer_path(&self.root, sensor_id, now)
    }
}

/// Path of the buffer file for `sensor_id` on the day of `now` below `root`.
pub fn buffer_path(root: &Path, sensor_id: &str, now: &DateTime<Utc>) -> PathBuf {
    root.join(sensor_id)
        .join(format!("{}_{}.bin", sensor_id, now.format("%Y-%m-%d")))
}

impl Sink for FileSink {
    fn destination(&self) -> Destination {
        Destination::File
    }

    fn write(&mut self, batch: &SinkBatch<'_>, _out: &mut dyn Publisher) -> Result<(), SinkError> {
        if !self.root.is_dir() {
            if !self.location_reported {
                warn!(path = %self.root.display(), "file destination is not accessible");
                self.location_reported = true;
            }
            return Err(SinkError::Location(self.root.clone()));
        }
        self.location_reported = false;

        let pack = &batch.header.pack_code;
        let mut frames = Vec::new();
        let mut failed = 0;
        let mut first_error: Option<EncodeError> = None;
        for line in batch.payload.split(RECORD_SEPARATOR) {
            if line.trim().is_empty() || decode_record(batch.header, line).is_err() {
                continue;
            }
            match encode_line(pack, line) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        if !frames.is_empty() {
            let path = self.path_for(batch.sensor_id, &(self.clock)());
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let is_new = !path.exists();
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let mut writer = BufWriter::new(file);
            if is_new {
                debug!(path = %path.display(), "new buffer file");
                writer.write_all(file_header_line(batch.header.raw()).as_bytes())?;
            }
            for frame in &frames {
                write_frame(&mut writer, frame)?;
            }
            writer.flush()?;
        }

        match first_error {
            Some(source) => Err(SinkError::Encode {
                sensor: batch.sensor_id.to_string(),
                failed,
                source,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::Outbox;
    use chrono::TimeZone;
    use magbin::{decode_batch, BufferFile, Header};
    use std::collections::BTreeMap;

    const META: &str = "# MagPyBin S1_1_0001 [x,y] [X,Y] [nT,nT] [1000,1000] <6hLll 24";

    fn fixed_clock() -> Clock {
        Box::new(|| Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap())
    }

    fn write(sink: &mut FileSink, header: &Header, payload: &str) -> Result<(), SinkError> {
        let decoded = decode_batch(header, payload);
        let fields = BTreeMap::new();
        let batch = SinkBatch {
            station: "wic",
            sensor_id: "S1_1_0001",
            header,
            fields: &fields,
            payload,
            batch: &decoded,
        };
        sink.write(&batch, &mut Outbox::new())
    }

    #[test]
    fn test_two_batches_same_day_append_to_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let header = Header::parse(META).unwrap();
        let mut sink = FileSink::with_clock(dir.path(), fixed_clock());

        write(&mut sink, &header, "2024,1,1,0,0,0,0,1,2;2024,1,1,0,0,1,0,3,4").unwrap();
        write(&mut sink, &header, "2024,1,1,0,0,2,0,5,6").unwrap();

        let sensor_dir = dir.path().join("S1_1_0001");
        let files: Vec<_> = fs::read_dir(&sensor_dir).unwrap().collect();
        assert_eq!(files.len(), 1);

        let path = sensor_dir.join("S1_1_0001_2024-02-03.bin");
        let buffer = BufferFile::read(&path).unwrap();
        assert_eq!(buffer.header.raw(), META);
        assert_eq!(buffer.frames.len(), 3);
    }

    #[test]
    fn test_missing_location_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("absent");
        let header = Header::parse(META).unwrap();
        let mut sink = FileSink::with_clock(&root, fixed_clock());
        let err = write(&mut sink, &header, "2024,1,1,0,0,0,0,1,2").unwrap_err();
        assert!(matches!(err, SinkError::Location(_)));
        assert!(!root.exists());
    }

    #[test]
    fn test_rejected_records_are_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let header = Header::parse(META).unwrap();
        let mut sink = FileSink::with_clock(dir.path(), fixed_clock());
        write(
            &mut sink,
            &header,
            "2024,1,1,0,0,0,0,1,2;2024,13,1,0,0,0,0,5,6;2024,1,1,0,0,1,0,3;2024,1,1,0,0,2,0,x,4",
        )
        .unwrap();

        let path = dir.path().join("S1_1_0001/S1_1_0001_2024-02-03.bin");
        let buffer = BufferFile::read(&path).unwrap();
        assert_eq!(buffer.frames.len(), 1);
        let records = buffer.records().unwrap();
        assert_eq!(records, decode_batch(&header, "2024,1,1,0,0,0,0,1,2").records);
    }

    #[test]
    fn test_only_rejected_records_create_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let header = Header::parse(META).unwrap();
        let mut sink = FileSink::with_clock(dir.path(), fixed_clock());
        write(&mut sink, &header, "2024,13,1,0,0,0,0,5,6").unwrap();
        assert!(!dir.path().join("S1_1_0001").exists());
    }

    #[test]
    fn test_pack_code_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let header =
            Header::parse("# MagPyBin S1_1_0001 [x,y] [X,Y] [nT,nT] [1000,1000] <6hLlll 28").unwrap();
        let mut sink = FileSink::with_clock(dir.path(), fixed_clock());
        let err = write(&mut sink, &header, "2024,1,1,0,0,0,0,1,2;2024,1,1,0,0,1,0,3,4").unwrap_err();
        assert!(matches!(err, SinkError::Encode { failed: 2, .. }));
        assert!(!dir.path().join("S1_1_0001").exists());
    }
}
