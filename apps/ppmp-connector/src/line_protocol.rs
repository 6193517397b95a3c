use std::fmt;
use thiserror::Error;

/// A single validated line of InfluxDB line protocol:
/// `measurement[,tag=value...] field=value[,field=value...] timestamp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    line: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineFormatError {
    #[error("line has no measurement")]
    MissingMeasurement,
    #[error("line has an empty field segment")]
    EmptyFieldSegment,
    #[error("line has no timestamp")]
    MissingTimestamp,
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("line has {0} unescaped segments, expected 3")]
    SegmentCount(usize),
}

impl WriteRecord {
    /// Validates `line` and wraps it. The field segment must be non-empty and the
    /// trailing timestamp must be a non-negative integer.
    pub fn parse(line: impl Into<String>) -> Result<Self, LineFormatError> {
        let line = line.into();
        validate(&line)?;
        Ok(Self { line })
    }

    pub fn as_str(&self) -> &str {
        &self.line
    }

    pub fn measurement(&self) -> &str {
        let segments = split_segments(&self.line);
        let head = segments.first().copied().unwrap_or_default();
        match find_unescaped(head, b',') {
            Some(idx) => &head[..idx],
            None => head,
        }
    }

    pub fn timestamp_ns(&self) -> i64 {
        split_segments(&self.line)
            .last()
            .and_then(|ts| ts.parse::<i64>().ok())
            .unwrap_or_default()
    }

    pub fn field_segment(&self) -> &str {
        split_segments(&self.line).get(1).copied().unwrap_or_default()
    }

}

impl fmt::Display for WriteRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

fn validate(line: &str) -> Result<(), LineFormatError> {
    let segments = split_segments(line);
    match segments.as_slice() {
        [] => Err(LineFormatError::MissingMeasurement),
        [head, ..] if head.is_empty() || head.starts_with(',') => {
            Err(LineFormatError::MissingMeasurement)
        }
        [_] => Err(LineFormatError::EmptyFieldSegment),
        [_, fields] => {
            if fields.is_empty() {
                Err(LineFormatError::EmptyFieldSegment)
            } else {
                Err(LineFormatError::MissingTimestamp)
            }
        }
        [_, fields, ts] => {
            if fields.is_empty() {
                return Err(LineFormatError::EmptyFieldSegment);
            }
            match ts.parse::<i64>() {
                Ok(value) if value >= 0 => Ok(()),
                _ => Err(LineFormatError::InvalidTimestamp(ts.to_string())),
            }
        }
        other => Err(LineFormatError::SegmentCount(other.len())),
    }
}

/// Splits on spaces that are neither backslash-escaped nor inside a quoted field
/// value. Consecutive spaces produce empty segments.
fn split_segments(line: &str) -> Vec<&str> {
    let bytes = line.as_bytes();
    let mut segments = Vec::with_capacity(3);
    let mut start = 0;
    let mut in_quotes = false;
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'\\' => {
                idx += 2;
                continue;
            }
            b'"' => in_quotes = !in_quotes,
            b' ' if !in_quotes => {
                segments.push(&line[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
        idx += 1;
    }
    if start <= line.len() && !line.is_empty() {
        segments.push(&line[start.min(line.len())..]);
    }
    segments
}

fn find_unescaped(segment: &str, needle: u8) -> Option<usize> {
    let bytes = segment.as_bytes();
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'\\' {
            idx += 2;
            continue;
        }
        if bytes[idx] == needle {
            return Some(idx);
        }
        idx += 1;
    }
    None
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    String(String),
}

impl FieldValue {
    fn write_to(&self, out: &mut String) {
        match self {
            FieldValue::Float(value) => out.push_str(&value.to_string()),
            FieldValue::Integer(value) => {
                out.push_str(&value.to_string());
                out.push('i');
            }
            FieldValue::Boolean(value) => out.push_str(if *value { "true" } else { "false" }),
            FieldValue::String(value) => {
                out.push('"');
                for ch in value.chars() {
                    match ch {
                        '"' | '\\' => {
                            out.push('\\');
                            out.push(ch);
                        }
                        // Batches are newline-delimited, so line breaks become spaces.
                        '\n' | '\r' => out.push(' '),
                        _ => out.push(ch),
                    }
                }
                out.push('"');
            }
        }
    }
}

/// Assembles one point. Empty tag values and non-finite floats are skipped, so
/// a builder can end up with no fields; [`WriteRecord::parse`] rejects that.
#[derive(Debug, Clone)]
pub struct LineBuilder {
    measurement: String,
    tags: Vec<(String, String)>,
    fields: Vec<(String, FieldValue)>,
}

impl LineBuilder {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn tag(&mut self, key: &str, value: &str) -> &mut Self {
        let value = value.trim();
        if !key.is_empty() && !value.is_empty() {
            self.tags.push((key.to_string(), value.to_string()));
        }
        self
    }

    pub fn field(&mut self, key: &str, value: FieldValue) -> &mut Self {
        if key.is_empty() {
            return self;
        }
        if let FieldValue::Float(v) = value {
            if !v.is_finite() {
                return self;
            }
        }
        // Later values for the same key replace earlier ones.
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.fields.push((key.to_string(), value));
        }
        self
    }

    pub fn render(&self, timestamp_ns: i64) -> String {
        let mut out = String::with_capacity(64);
        escape_into(&mut out, &self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            out.push(',');
            escape_into(&mut out, key, &[',', '=', ' ']);
            out.push('=');
            escape_into(&mut out, value, &[',', '=', ' ']);
        }
        out.push(' ');
        for (idx, (key, value)) in self.fields.iter().enumerate() {
            if idx > 0 {
                out.push(',');
            }
            escape_into(&mut out, key, &[',', '=', ' ']);
            out.push('=');
            value.write_to(&mut out);
        }
        out.push(' ');
        out.push_str(&timestamp_ns.to_string());
        out
    }
}

fn escape_into(out: &mut String, raw: &str, special: &[char]) {
    for ch in raw.chars() {
        if ch == '\n' || ch == '\r' {
            out.push(' ');
            continue;
        }
        if special.contains(&ch) || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
}
