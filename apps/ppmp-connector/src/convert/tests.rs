use super::{Conversion, ConversionError, Converter, Variant};
use crate::line_protocol::LineFormatError;
use chrono::{TimeZone, Utc};

pub(crate) const MACHINE_PAYLOAD: &str = r#"{
    "content-spec": "urn:spec://eclipse.org/unide/machine-message#v3",
    "device": {
        "additionalData": {
            "Company": "ABC GmbH",
            "InstalledVersion": "8.0.0.0",
            "hostname": "hostname_ID"
        },
        "id": "hostname_ID",
        "mode": "manual",
        "state": "OK"
    },
    "messages": [
        {
            "additionalData": { "firmware": "" },
            "code": "",
            "description": "",
            "hint": "",
            "origin": "",
            "severity": "",
            "title": "",
            "ts": "2019-04-16T13:48:27.826Z",
            "type": ""
        }
    ]
}"#;

const MEASUREMENT_PAYLOAD: &str = r#"{
    "content-spec": "urn:spec://eclipse.org/unide/measurement-message#v3",
    "device": { "id": "a4927dad-58d4-4580-b460-79cefd56775b" },
    "part": { "type": "SINGLE", "typeId": "F00VH07328", "id": "420003844" },
    "measurements": [
        {
            "ts": "2002-05-30T09:30:10.123+02:00",
            "code": "0000 EE01",
            "result": "OK",
            "series": {
                "time": [0, 23, 24],
                "temperature": [45.4231, 46.4222, 44.2432]
            }
        }
    ]
}"#;

const PROCESS_PAYLOAD: &str = r#"{
    "content-spec": "urn:spec://eclipse.org/unide/process-message#v3",
    "device": { "id": "a4927dad-58d4-4580-b460-79cefd56775b" },
    "part": { "id": "420003844", "type": "SINGLE" },
    "process": {
        "ts": "2002-05-30T09:30:10.123+02:00",
        "externalProcessId": "b4927dad-58d4-4580-b460-79cefd56775b",
        "result": "OK",
        "shutoffPhase": "phase 2",
        "program": { "id": "1", "name": "Programm 1", "lastChangedDate": "2002-05-30T09:30:10.123+02:00" }
    },
    "measurements": [
        {
            "ts": "2002-05-30T09:30:10.123+02:00",
            "phase": "phase 1",
            "series": {
                "time": [0, 23, 24],
                "force": [26, 23, 24],
                "pressure": [52.4, 46.32, 44.2432]
            }
        },
        {
            "ts": "2002-05-30T09:30:11.123+02:00",
            "phase": "phase 2",
            "series": {
                "time": [0, 30],
                "force": [26, 15],
                "temperature": [45.4243, 46.42342]
            }
        }
    ]
}"#;

fn record(conversion: Conversion) -> crate::line_protocol::WriteRecord {
    match conversion {
        Conversion::Record(record) => record,
        Conversion::Ignored => panic!("expected a record"),
    }
}

#[test]
fn machine_message_maps_device_state() {
    let converter = Converter::new();
    let record = record(converter.convert(MACHINE_PAYLOAD.as_bytes()).unwrap());
    assert_eq!(
        record.as_str(),
        r#"machine,device=hostname_ID mode="manual",state="OK",messages=1i 1555422507826000000"#
    );
    assert_eq!(record.measurement(), Variant::Machine.measurement_name());
}

#[test]
fn measurement_message_keeps_last_sample_of_each_series() {
    let converter = Converter::new();
    let record = record(converter.convert(MEASUREMENT_PAYLOAD.as_bytes()).unwrap());
    assert_eq!(
        record.as_str(),
        r"measurement,device=a4927dad-58d4-4580-b460-79cefd56775b,part=420003844,code=0000\ EE01,result=OK temperature=44.2432,samples=3i 1022743810147000000"
    );
}

#[test]
fn process_message_merges_phases() {
    let converter = Converter::new();
    let record = record(converter.convert(PROCESS_PAYLOAD.as_bytes()).unwrap());
    assert_eq!(record.measurement(), "process");
    assert_eq!(
        record.field_segment(),
        r#"result="OK",shutoff_phase="phase 2",external_process_id="b4927dad-58d4-4580-b460-79cefd56775b",force=15i,pressure=44.2432,temperature=46.42342,phases=2i"#
    );
    assert!(record.as_str().contains(r",program=Programm\ 1 "));
    assert_eq!(record.timestamp_ns(), 1_022_743_810_123_000_000);
}

#[test]
fn every_variant_yields_non_empty_fields_and_non_negative_timestamp() {
    let converter = Converter::new();
    for payload in [MACHINE_PAYLOAD, MEASUREMENT_PAYLOAD, PROCESS_PAYLOAD] {
        let record = record(converter.convert(payload.as_bytes()).unwrap());
        assert!(!record.field_segment().is_empty());
        assert!(record.timestamp_ns() >= 0);
    }
}

#[test]
fn missing_timestamp_uses_conversion_time() {
    let converter = Converter::new();
    let received_at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    let payload = r#"{
        "content-spec": "urn:spec://eclipse.org/unide/machine-message#v3",
        "device": { "id": "m1", "state": "ERROR" }
    }"#;
    let record = record(converter.convert_at(payload.as_bytes(), received_at).unwrap());
    assert_eq!(
        record.timestamp_ns(),
        received_at.timestamp_nanos_opt().unwrap()
    );
    assert_eq!(record.as_str(), format!(
        "machine,device=m1 state=\"ERROR\" {}",
        received_at.timestamp_nanos_opt().unwrap()
    ));
}

#[test]
fn pre_epoch_timestamp_falls_back_to_conversion_time() {
    let converter = Converter::new();
    let received_at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    let payload = r#"{
        "content-spec": "urn:spec://eclipse.org/unide/machine-message#v3",
        "device": { "id": "m1" },
        "messages": [{ "ts": "1960-01-01T00:00:00Z", "code": "E1" }]
    }"#;
    let record = record(converter.convert_at(payload.as_bytes(), received_at).unwrap());
    assert_eq!(
        record.timestamp_ns(),
        received_at.timestamp_nanos_opt().unwrap()
    );
}

#[test]
fn out_of_range_time_offset_falls_back_to_conversion_time() {
    let converter = Converter::new();
    let received_at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    for offset in ["-9223372036854775808", "-1e30", "1e30"] {
        let payload = format!(
            r#"{{
                "content-spec": "urn:spec://eclipse.org/unide/measurement-message#v3",
                "device": {{ "id": "d" }},
                "measurements": [{{
                    "ts": "2002-05-30T09:30:10.123+02:00",
                    "series": {{ "time": [0, {offset}], "force": [1.5, 2.5] }}
                }}]
            }}"#
        );
        let record = record(converter.convert_at(payload.as_bytes(), received_at).unwrap());
        assert_eq!(
            record.timestamp_ns(),
            received_at.timestamp_nanos_opt().unwrap(),
            "offset {offset}"
        );
        assert_eq!(record.field_segment(), "force=2.5,samples=2i");
    }
}

#[test]
fn measurement_series_named_like_sample_count_is_kept() {
    let converter = Converter::new();
    let payload = r#"{
        "content-spec": "urn:spec://eclipse.org/unide/measurement-message#v3",
        "device": { "id": "d" },
        "measurements": [{
            "ts": "2002-05-30T09:30:10.123+02:00",
            "series": { "time": [0, 1], "samples": [7.5, 8.5] }
        }]
    }"#;
    let record = record(converter.convert(payload.as_bytes()).unwrap());
    assert_eq!(record.field_segment(), "series_samples=8.5,samples=2i");
}

#[test]
fn process_series_named_like_process_fields_is_kept() {
    let converter = Converter::new();
    let payload = r#"{
        "content-spec": "urn:spec://eclipse.org/unide/process-message#v3",
        "device": { "id": "d" },
        "process": {
            "ts": "2002-05-30T09:30:10.123+02:00",
            "result": "OK",
            "shutoffPhase": "phase 1"
        },
        "measurements": [{
            "series": {
                "time": [0],
                "result": [1.5],
                "shutoff_phase": [2],
                "phases": [3]
            }
        }]
    }"#;
    let record = record(converter.convert(payload.as_bytes()).unwrap());
    assert_eq!(
        record.field_segment(),
        r#"result="OK",shutoff_phase="phase 1",series_phases=3i,series_result=1.5,series_shutoff_phase=2i,phases=1i"#
    );
}

#[test]
fn missing_discriminator_is_reported() {
    let converter = Converter::new();
    for payload in [
        r#"{"device": {"id": "x"}}"#,
        r#"{"content-spec": 3, "device": {"id": "x"}}"#,
        r#"[1, 2, 3]"#,
    ] {
        let err = converter.convert(payload.as_bytes()).unwrap_err();
        assert!(
            matches!(err, ConversionError::MissingDiscriminator { .. }),
            "unexpected error for {payload}: {err}"
        );
    }
}

#[test]
fn malformed_payload_is_reported() {
    let converter = Converter::new();
    for payload in ["", "{not json", "\u{0}\u{1}"] {
        let err = converter.convert(payload.as_bytes()).unwrap_err();
        assert!(matches!(err, ConversionError::MalformedPayload(_)));
    }
}

#[test]
fn unknown_content_spec_is_ignored() {
    let converter = Converter::new();
    let payload = r#"{
        "content-spec": "urn:spec://eclipse.org/unide/machine-message#v2",
        "device": { "deviceID": "x" }
    }"#;
    assert_eq!(
        converter.convert(payload.as_bytes()).unwrap(),
        Conversion::Ignored
    );
}

#[test]
fn record_without_fields_is_invalid_line_format() {
    let converter = Converter::new();
    let payload = r#"{
        "content-spec": "urn:spec://eclipse.org/unide/machine-message#v3",
        "device": { "id": "only-an-id" }
    }"#;
    match converter.convert(payload.as_bytes()).unwrap_err() {
        ConversionError::InvalidLineFormat {
            line,
            source_data,
            reason,
        } => {
            assert!(line.starts_with("machine,device=only-an-id  "));
            assert!(source_data.contains("only-an-id"));
            assert_eq!(reason, LineFormatError::EmptyFieldSegment);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn dispatch_table_covers_every_variant() {
    let converter = Converter::new();
    for variant in Variant::ALL {
        assert_eq!(converter.variant_for(variant.content_spec()), Some(variant));
    }
    assert_eq!(converter.variant_for("urn:unknown"), None);
}
