// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Protocol scenarios: meta -> dict -> data through the public API,
// and buffer files written and read back from disk.

use magbin::frame::{encode_line, file_header_line, write_frame};
use magbin::header::HeaderError;
use magbin::packcode::PackCodeError;
use magbin::{
    decode_batch, BufferFile, ChannelRegistry, Header, MessageKind, Registration, RegistryError,
    SampleValue, StationFilter,
};
use std::fs::OpenOptions;
use std::io::Write;

const META: &str = "# MAGBIN 1 S1 [t1,x] [T,X] [degC,nT] [1000,1000] <6hLll 24";

#[test]
fn test_meta_then_data_decodes_physical_values() {
    let filter = StationFilter::new("wic");
    let mut registry = ChannelRegistry::new();

    let meta = filter.parse("wic/S1meta").unwrap();
    assert_eq!(meta.kind, MessageKind::Meta);
    assert_eq!(
        registry.register(&meta.station, &meta.sensor_id, META).unwrap(),
        Registration::New
    );

    let data = filter.parse("wic/S1data").unwrap();
    let header = registry.header(&data.sensor_id).unwrap();
    let batch = decode_batch(header, "2024,01,01,00,00,00,0,21350,48900");

    assert_eq!(batch.len(), 1);
    let record = &batch.records[0];
    assert_eq!(
        record.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string(),
        "2024-01-01T00:00:00"
    );
    assert_eq!(record.values[0], SampleValue::Number(21.35));
    assert_eq!(record.values[1], SampleValue::Number(48.9));
}

#[test]
fn test_dict_sets_and_skips_unset() {
    let mut registry = ChannelRegistry::new();
    registry.register("wic", "S1", META).unwrap();
    registry.describe("S1", "PierID:A2,Module:-").unwrap();

    let channel = registry.get("S1").unwrap();
    assert_eq!(channel.field("PierID"), Some("A2"));
    assert_eq!(channel.field("Module"), None);
}

#[test]
fn test_reregistration_keeps_original_schema() {
    let mut registry = ChannelRegistry::new();
    registry.register("wic", "S1", META).unwrap();
    let changed = "# MAGBIN 2 S1 [f] [F] [nT] [100] <6hLl 20";
    assert_eq!(
        registry.register("wic", "S1", changed).unwrap(),
        Registration::AlreadyRegistered
    );

    let header = registry.header("S1").unwrap();
    assert_eq!(header.keys, vec!["t1", "x"]);
    assert_eq!(header.raw(), META);
}

#[test]
fn test_one_malformed_record_among_five() {
    let mut registry = ChannelRegistry::new();
    registry.register("wic", "S1", META).unwrap();
    let header = registry.header("S1").unwrap();

    let payload = [
        "2024,01,01,00,00,00,0,1000,1000",
        "2024,01,01,00,00,01,0,2000,2000",
        "2024,01,01,00,00,02,0,oops,3000",
        "2024,01,01,00,00,03,0,4000,4000",
        "2024,01,01,00,00,04,0,5000,5000",
    ]
    .join(";");
    let batch = decode_batch(header, &payload);

    assert_eq!(batch.len(), 4);
    assert_eq!(batch.skipped, 1);
    let t1: Vec<f64> = batch
        .column("t1")
        .unwrap()
        .into_iter()
        .filter_map(SampleValue::as_f64)
        .collect();
    assert_eq!(t1, vec![1.0, 2.0, 4.0, 5.0]);
}

#[test]
fn test_encode_decode_round_trip_through_buffer_file() {
    let mut registry = ChannelRegistry::new();
    registry.register("wic", "S1", META).unwrap();
    let header = registry.header("S1").unwrap().clone();

    let lines = ["2024,01,01,00,00,00,0,21350,48900", "2024,01,01,00,00,01,500000,-2,7"];
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("S1_2024-01-01.bin");
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .unwrap();
    file.write_all(file_header_line(header.raw()).as_bytes()).unwrap();
    for line in lines {
        let frame = encode_line(&header.pack_code, line).unwrap();
        write_frame(&mut file, &frame).unwrap();
    }
    drop(file);

    let buffer = BufferFile::read(&path).unwrap();
    assert_eq!(buffer.header, header);
    let from_file = buffer.records().unwrap();
    let from_wire = decode_batch(&header, &lines.join(";")).records;
    assert_eq!(from_file, from_wire);
}

#[test]
fn test_buffer_round_trip_across_pack_codes() {
    use SampleValue::{Number, Text};

    // (meta header, data line, expected values)
    let cases: Vec<(&str, &str, Vec<SampleValue>)> = vec![
        (
            "# MagPyBin S1 [x,y] [X,Y] [nT,nT] [1,1] <6hLhH 20",
            "2024,5,6,7,8,9,123456,-32768,65535",
            vec![Number(-32768.0), Number(65535.0)],
        ),
        (
            "# MagPyBin S1 [x,y] [X,Y] [nT,nT] [10,10] <6hLlL 24",
            "2024,5,6,7,8,9,0,-2147483648,4294967295",
            vec![Number(-214748364.8), Number(429496729.5)],
        ),
        (
            "# MagPyBin S1 [var1,var2] [V1,V2] [arb,arb] [1,1] <6hLqQ 32",
            "2024,12,31,23,59,59,999999,-4611686018427387904,9007199254740992",
            vec![Number(-4611686018427387904.0), Number(9007199254740992.0)],
        ),
        (
            "# MagPyBin S1 [f,t1] [F,T] [nT,degC] [1,1] <6hLfd 28",
            "2024,2,29,0,0,0,0,21.5,-0.125",
            vec![Number(21.5), Number(-0.125)],
        ),
        (
            "# MagPyBin S1 [str1,x] [S,X] [-,nT] [1,1000] <6hL8sx2xl 31",
            "2024,1,1,0,0,0,0,LEMI,48900",
            vec![Text("LEMI".into()), Number(48.9)],
        ),
        (
            "# MagPyBin S1 [x,y,z] [X,Y,Z] [nT,nT,nT] [100,1000,1] <6hL3l 28",
            "2024,1,1,0,0,1,500000,-150,48900,7",
            vec![Number(-1.5), Number(48.9), Number(7.0)],
        ),
        (
            "# MagPyBin S1 [t1,x] [T,X] [degC,nT] [10,1] 6hLLl 25",
            "2024,1,1,0,0,0,0,215,-3",
            vec![Number(21.5), Number(-3.0)],
        ),
        (
            "# MagPyBin S1 [x,y] [X,Y] [nT,nT] [1,1] 6hL2h 21",
            "2024,1,1,0,0,0,0,-5,6",
            vec![Number(-5.0), Number(6.0)],
        ),
    ];

    for (meta, line, expected) in cases {
        let header = Header::parse(meta).unwrap();
        assert_eq!(header.length_mismatch(), None, "{}", meta);

        let mut bytes = file_header_line(header.raw()).into_bytes();
        let frame = encode_line(&header.pack_code, line).unwrap();
        assert_eq!(frame.len(), header.pack_code.frame_width(), "{}", meta);
        write_frame(&mut bytes, &frame).unwrap();

        let buffer = BufferFile::from_bytes(&bytes).unwrap();
        assert_eq!(buffer.header, header, "{}", meta);
        let records = buffer.records().unwrap();
        assert_eq!(records.len(), 1, "{}", meta);
        assert_eq!(records[0].values, expected, "{}", meta);
        assert_eq!(records, decode_batch(&header, line).records, "{}", meta);
    }
}

#[test]
fn test_oversized_pack_code_is_rejected_at_registration() {
    let mut registry = ChannelRegistry::new();
    for (code, cause) in [
        ("<6hL99999999999999999999l", PackCodeError::CountTooLarge),
        ("<6hL4000000000l", PackCodeError::CountTooLarge),
        ("<6hL4096s4096s4096s4096s4096s4096s4096s4096s4096s4096s4096s4096s4096s4096s4096s4096s4096s", PackCodeError::FrameTooWide),
        ("<0s0s0s0s0s0s0s", PackCodeError::ZeroWidth),
    ] {
        let meta = format!("# MAGBIN 1 S1 [x] [X] [nT] [1] {} 20", code);
        let err = registry.register("wic", "S1", &meta).unwrap_err();
        assert!(
            matches!(
                &err,
                RegistryError::Header { source: HeaderError::PackCode(found), .. } if *found == cause
            ),
            "{}: {}",
            code,
            err
        );
    }
    assert!(!registry.is_registered("S1"));
}
