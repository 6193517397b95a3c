use super::fields::{array_at, object_at, offset_ms, parse_ts, series_fields, str_at, timestamp_ns};
use super::Candidate;
use crate::line_protocol::{FieldValue, LineBuilder};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub(super) const MEASUREMENT: &str = "measurement";

/// Fields this mapping writes itself.
const RESERVED: [&str; 1] = ["samples"];

/// Summarizes the newest entry of `measurements` as one point carrying the last
/// sample of each series, stamped at that sample's time.
pub(super) fn build(
    mut line: LineBuilder,
    envelope: &Map<String, Value>,
    received_at: DateTime<Utc>,
) -> Candidate {

    if let Some(id) = object_at(envelope, "device").and_then(|device| str_at(device, "id")) {
        line.tag("device", id);
    }
    if let Some(id) = object_at(envelope, "part").and_then(|part| str_at(part, "id")) {
        line.tag("part", id);
    }

    let latest = array_at(envelope, "measurements")
        .last()
        .and_then(Value::as_object);
    let mut ts = None;
    if let Some(entry) = latest {
        if let Some(code) = str_at(entry, "code") {
            line.tag("code", code);
        }
        if let Some(result) = str_at(entry, "result") {
            line.tag("result", result);
        }
        let mut last_offset = None;
        if let Some(series) = object_at(entry, "series") {
            let (offset, samples) = series_fields(&mut line, series, &RESERVED);
            last_offset = offset;
            if samples > 0 {
                line.field("samples", FieldValue::Integer(samples as i64));
            }
        }
        ts = offset_ms(parse_ts(str_at(entry, "ts")), last_offset);
    }

    Candidate {
        line,
        timestamp_ns: timestamp_ns(ts, received_at),
    }
}
