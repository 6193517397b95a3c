use super::fields::{array_at, object_at, parse_ts, series_fields, str_at, string_fields, timestamp_ns};
use super::Candidate;
use crate::line_protocol::{FieldValue, LineBuilder};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub(super) const MEASUREMENT: &str = "process";

/// Fields this mapping writes itself.
const RESERVED: [&str; 4] = ["result", "shutoff_phase", "external_process_id", "phases"];

/// One point per process run, stamped at `process.ts`. Series values from later
/// phases overwrite earlier phases with the same series name.
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

    let process = object_at(envelope, "process");
    if let Some(program) = process
        .and_then(|process| object_at(process, "program"))
        .and_then(|program| str_at(program, "name"))
    {
        line.tag("program", program);
    }
    if let Some(process) = process {
        string_fields(
            &mut line,
            process,
            &[
                ("result", "result"),
                ("shutoffPhase", "shutoff_phase"),
                ("externalProcessId", "external_process_id"),
            ],
        );
    }

    let phases = array_at(envelope, "measurements");
    for phase in phases.iter().filter_map(Value::as_object) {
        if let Some(series) = object_at(phase, "series") {
            series_fields(&mut line, series, &RESERVED);
        }
    }
    if !phases.is_empty() {
        line.field("phases", FieldValue::Integer(phases.len() as i64));
    }

    let ts = parse_ts(process.and_then(|process| str_at(process, "ts")));
    Candidate {
        line,
        timestamp_ns: timestamp_ns(ts, received_at),
    }
}
