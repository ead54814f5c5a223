//! Manages decoders
pub mod envelope;
pub mod flattened;

use std::sync::Arc;

use anyhow::anyhow;
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::event::{ChangeEvent, EntityType, LogMessage};

/// Decoder converts a raw message from Kafka into a normalized change event
pub trait Decoder {
    fn get_name(&self) -> String;
    fn decode(&self, message: &LogMessage, entity: EntityType) -> Result<ChangeEvent, DecodeError>;
}

/// Creates decoder of specified name.
/// If you add your own decoders, register them here
pub fn get_decoder(
    name: &str,
    decoder_settings: Option<toml::Value>,
) -> Result<Arc<dyn Decoder + Send + Sync>, anyhow::Error> {
    match name {
        "flattened" => match decoder_settings {
            Some(s) => Ok(Arc::new(flattened::Decoder::new(s.try_into()?))),
            None => Ok(Arc::new(flattened::Decoder::default())),
        },
        "envelope" => Ok(Arc::new(envelope::Decoder)),
        _ => Err(anyhow!("unknown decoder {}", name)),
    }
}

/// Returns message payload as text, or `None` for a tombstone
pub(crate) fn payload_text(message: &LogMessage) -> Result<Option<&str>, DecodeError> {
    match message.payload.as_deref() {
        None => Ok(None),
        Some(bytes) => {
            let text = std::str::from_utf8(bytes)?;
            if text.trim().is_empty() {
                Ok(None)
            } else {
                Ok(Some(text))
            }
        }
    }
}

pub(crate) fn parse_object(raw: &str) -> Result<Map<String, Value>, DecodeError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(doc) => Ok(doc),
        other => Err(DecodeError::NotAnObject(json_kind(&other))),
    }
}

/// Header value as text. JSON header converters quote strings, so quotes are stripped.
pub(crate) fn header_text<'a>(message: &'a LogMessage, name: &str) -> Option<&'a str> {
    let value = message.header(name)?;
    let text = std::str::from_utf8(value).ok()?.trim();
    Some(text.trim_matches('"'))
}

/// Integer millisecond timestamp from a json value; numeric strings are accepted
pub(crate) fn millis(field: &str, value: &Value) -> Result<Option<i64>, DecodeError> {
    let invalid = |reason: &str| DecodeError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    };
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => match n.as_i64() {
            Some(ms) => Ok(Some(ms)),
            None => Err(invalid("not an integer timestamp")),
        },
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| invalid("not an integer timestamp")),
        _ => Err(invalid("not an integer timestamp")),
    }
}

pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
