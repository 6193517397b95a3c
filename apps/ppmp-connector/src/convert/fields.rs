use crate::line_protocol::{FieldValue, LineBuilder};
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value};

pub(super) fn str_at<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub(super) fn object_at<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    obj.get(key).and_then(Value::as_object)
}

pub(super) fn array_at<'a>(obj: &'a Map<String, Value>, key: &str) -> &'a [Value] {
    obj.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

pub(super) fn field_value(value: &Value) -> Option<FieldValue> {
    match value {
        Value::Bool(b) => Some(FieldValue::Boolean(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(FieldValue::Integer(i))
            } else {
                n.as_f64()
                    .filter(|f| f.is_finite())
                    .map(FieldValue::Float)
            }
        }
        Value::String(s) => Some(FieldValue::String(s.clone())),
        _ => None,
    }
}

/// Copies non-empty string entries of `obj` named in `keys` into string fields.
pub(super) fn string_fields(line: &mut LineBuilder, obj: &Map<String, Value>, keys: &[(&str, &str)]) {
    for (source, target) in keys {
        if let Some(value) = str_at(obj, source) {
            line.field(target, FieldValue::String(value.to_string()));
        }
    }
}

/// Writes the last value of every non-`time` series as a field and returns the
/// last `time` offset in milliseconds together with the number of samples.
/// Series named like one of the variant's own fields in `reserved` are written
/// as `series_<name>`.
pub(super) fn series_fields(
    line: &mut LineBuilder,
    series: &Map<String, Value>,
    reserved: &[&str],
) -> (Option<i64>, usize) {
    for (name, values) in series {
        if name == "time" {
            continue;
        }
        let Some(last) = values.as_array().and_then(|values| values.last()) else {
            continue;
        };
        let Some(value) = field_value(last) else {
            continue;
        };
        if reserved.contains(&name.as_str()) {
            line.field(&format!("series_{name}"), value);
        } else {
            line.field(name, value);
        }
    }
    let times = series.get("time").and_then(Value::as_array);
    let last_offset = times
        .and_then(|times| times.last())
        .and_then(|offset| offset.as_i64().or_else(|| offset.as_f64().map(|v| v as i64)));
    (last_offset, times.map(Vec::len).unwrap_or(0))
}

pub(super) fn parse_ts(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// Nanoseconds since epoch for `ts`, falling back to `received_at` when absent,
/// unrepresentable, or before the epoch.
pub(super) fn timestamp_ns(ts: Option<DateTime<Utc>>, received_at: DateTime<Utc>) -> i64 {
    ts.and_then(|ts| ts.timestamp_nanos_opt())
        .filter(|ns| *ns >= 0)
        .or_else(|| received_at.timestamp_nanos_opt())
        .unwrap_or_default()
        .max(0)
}

/// `ts` shifted by `offset` milliseconds. An offset that does not fit a
/// `TimeDelta`, or a sum out of range, yields `None`.
pub(super) fn offset_ms(ts: Option<DateTime<Utc>>, offset: Option<i64>) -> Option<DateTime<Utc>> {
    match (ts, offset) {
        (Some(ts), Some(ms)) => {
            TimeDelta::try_milliseconds(ms).and_then(|delta| ts.checked_add_signed(delta))
        }
        (ts, _) => ts,
    }
}
