use super::fields::{array_at, object_at, parse_ts, str_at, string_fields, timestamp_ns};
use super::Candidate;
use crate::line_protocol::{FieldValue, LineBuilder};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub(super) const MEASUREMENT: &str = "machine";

const MESSAGE_FIELDS: [(&str, &str); 7] = [
    ("code", "code"),
    ("severity", "severity"),
    ("title", "title"),
    ("description", "description"),
    ("hint", "hint"),
    ("origin", "origin"),
    ("type", "type"),
];

/// Device state plus the newest entry of `messages`.
pub(super) fn build(
    mut line: LineBuilder,
    envelope: &Map<String, Value>,
    received_at: DateTime<Utc>,
) -> Candidate {

    if let Some(device) = object_at(envelope, "device") {
        if let Some(id) = str_at(device, "id") {
            line.tag("device", id);
        }
        string_fields(&mut line, device, &[("mode", "mode"), ("state", "state")]);
    }

    let messages = array_at(envelope, "messages");
    let latest = messages.last().and_then(Value::as_object);
    if let Some(message) = latest {
        string_fields(&mut line, message, &MESSAGE_FIELDS);
    }
    if !messages.is_empty() {
        line.field("messages", FieldValue::Integer(messages.len() as i64));
    }

    let ts = parse_ts(latest.and_then(|message| str_at(message, "ts")));
    Candidate {
        line,
        timestamp_ns: timestamp_ns(ts, received_at),
    }
}
