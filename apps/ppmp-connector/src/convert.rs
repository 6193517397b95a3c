//! PPMP v3 payload -> line protocol conversion.
//!
//! A payload is dispatched on its `content-spec` discriminator through a table
//! built once in [`Converter::new`]. Unknown discriminators are ignored rather
//! than reported so newer message types can share the topic.

mod fields;
mod machine;
mod measurement;
mod process;

#[cfg(test)]
pub(crate) mod tests;

use crate::line_protocol::{LineBuilder, LineFormatError, WriteRecord};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

pub const DISCRIMINATOR: &str = "content-spec";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Process,
    Measurement,
    Machine,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::Process, Variant::Measurement, Variant::Machine];

    pub fn content_spec(self) -> &'static str {
        match self {
            Variant::Process => "urn:spec://eclipse.org/unide/process-message#v3",
            Variant::Measurement => "urn:spec://eclipse.org/unide/measurement-message#v3",
            Variant::Machine => "urn:spec://eclipse.org/unide/machine-message#v3",
        }
    }

    pub fn measurement_name(self) -> &'static str {
        match self {
            Variant::Process => process::MEASUREMENT,
            Variant::Measurement => measurement::MEASUREMENT,
            Variant::Machine => machine::MEASUREMENT,
        }
    }

    fn build(self, envelope: &Map<String, Value>, received_at: DateTime<Utc>) -> Candidate {
        let line = LineBuilder::new(self.measurement_name());
        match self {
            Variant::Process => process::build(line, envelope, received_at),
            Variant::Measurement => measurement::build(line, envelope, received_at),
            Variant::Machine => machine::build(line, envelope, received_at),
        }
    }
}

/// Unvalidated output of a variant mapping.
pub(crate) struct Candidate {
    pub(crate) line: LineBuilder,
    pub(crate) timestamp_ns: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Conversion {
    Record(WriteRecord),
    /// Discriminator present but not one we handle. Not an error.
    Ignored,
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[source] simd_json::Error),
    #[error("invalid PPMP format, no content-spec: {payload}")]
    MissingDiscriminator { payload: String },
    #[error("invalid line protocol format: {line} from PPMP {source_data} ({reason})")]
    InvalidLineFormat {
        line: String,
        source_data: String,
        reason: LineFormatError,
    },
}

#[derive(Debug, Clone)]
pub struct Converter {
    variants: HashMap<&'static str, Variant>,
}

impl Default for Converter {
    fn default() -> Self {
        Self::new()
    }
}

impl Converter {
    pub fn new() -> Self {
        let variants = Variant::ALL
            .iter()
            .map(|variant| (variant.content_spec(), *variant))
            .collect();
        Self { variants }
    }

    pub fn variant_for(&self, content_spec: &str) -> Option<Variant> {
        self.variants.get(content_spec).copied()
    }

    pub fn convert(&self, raw: &[u8]) -> Result<Conversion, ConversionError> {
        self.convert_at(raw, Utc::now())
    }

    /// Like [`Converter::convert`], with `received_at` standing in for payloads
    /// that carry no usable timestamp.
    pub fn convert_at(
        &self,
        raw: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Conversion, ConversionError> {
        let mut buf = raw.to_vec();
        let parsed: Value =
            simd_json::serde::from_slice(&mut buf).map_err(ConversionError::MalformedPayload)?;

        let Some(envelope) = parsed.as_object() else {
            return Err(ConversionError::MissingDiscriminator {
                payload: parsed.to_string(),
            });
        };
        let Some(content_spec) = envelope.get(DISCRIMINATOR).and_then(Value::as_str) else {
            return Err(ConversionError::MissingDiscriminator {
                payload: parsed.to_string(),
            });
        };
        let Some(variant) = self.variant_for(content_spec.trim()) else {
            return Ok(Conversion::Ignored);
        };

        let candidate = variant.build(envelope, received_at);
        let line = candidate.line.render(candidate.timestamp_ns);
        match WriteRecord::parse(line.clone()) {
            Ok(record) => Ok(Conversion::Record(record)),
            Err(reason) => Err(ConversionError::InvalidLineFormat {
                line,
                source_data: parsed.to_string(),
                reason,
            }),
        }
    }
}
