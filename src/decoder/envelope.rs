//! Decoder for the full Debezium change envelope
//! (`{before, after, op, ts_ms, source}`, optionally wrapped in `{schema, payload}`).
use std::collections::BTreeMap;

use serde_json::value::RawValue;

use super::{millis, parse_object, payload_text};
use crate::error::DecodeError;
use crate::event::{ChangeEvent, EntityType, LogMessage, Operation, Payload};

type Fields = BTreeMap<String, Box<RawValue>>;

pub struct Decoder;

fn fields(raw: &str) -> Result<Fields, DecodeError> {
    // validate shape first so scalars report as NotAnObject
    let trimmed = raw.trim_start();
    if !trimmed.starts_with('{') {
        parse_object(raw)?;
    }
    Ok(serde_json::from_str(raw)?)
}

fn is_null(value: &RawValue) -> bool {
    value.get().trim() == "null"
}

/// `after` is either an object (relational connectors) or a string of extended
/// JSON (MongoDB connector). Either way the document text is kept verbatim.
fn after_payload(value: &RawValue) -> Result<Option<Payload>, DecodeError> {
    if is_null(value) {
        return Ok(None);
    }
    let text = value.get().trim();
    let raw = if text.starts_with('"') {
        serde_json::from_str::<String>(text)?
    } else {
        text.to_string()
    };
    let document = parse_object(&raw)?;
    Ok(Some(Payload { raw, document }))
}

fn source_time(value: &RawValue) -> Result<Option<i64>, DecodeError> {
    if is_null(value) {
        return Ok(None);
    }
    match parse_object(value.get())?.get("ts_ms") {
        Some(ts) => millis("source.ts_ms", ts),
        None => Ok(None),
    }
}

impl super::Decoder for Decoder {
    fn get_name(&self) -> String {
        String::from("envelope")
    }

    fn decode(&self, message: &LogMessage, entity: EntityType) -> Result<ChangeEvent, DecodeError> {
        let tombstone = ChangeEvent {
            entity,
            operation: None,
            after_payload: None,
            event_time_ms: message.timestamp_ms.unwrap_or(0),
            is_tombstone: true,
            partition: message.partition,
            offset: message.offset,
        };

        let raw = match payload_text(message)? {
            Some(raw) => raw,
            None => return Ok(tombstone),
        };

        let mut envelope = fields(raw)?;
        if envelope.contains_key("schema") {
            match envelope.remove("payload") {
                Some(inner) if !is_null(&inner) => envelope = fields(inner.get())?,
                _ => return Ok(tombstone),
            }
        }

        let operation = match envelope.get("op") {
            Some(op) if !is_null(op) => {
                let code: String = serde_json::from_str(op.get()).map_err(|_| {
                    DecodeError::InvalidField {
                        field: "op".into(),
                        reason: "not a string".into(),
                    }
                })?;
                Operation::from_code(&code)
            }
            _ => None,
        };

        let after_payload = match (operation, envelope.get("after")) {
            (Some(Operation::Delete), _) | (_, None) => None,
            (_, Some(after)) => after_payload(after)?,
        };

        let mut event_time_ms = match envelope.get("source") {
            Some(source) => source_time(source)?,
            None => None,
        };
        if event_time_ms.is_none() {
            if let Some(ts) = envelope.get("ts_ms") {
                let ts: serde_json::Value = serde_json::from_str(ts.get())?;
                event_time_ms = millis("ts_ms", &ts)?;
            }
        }

        Ok(ChangeEvent {
            entity,
            operation,
            after_payload,
            event_time_ms: event_time_ms.or(message.timestamp_ms).unwrap_or(0),
            is_tombstone: false,
            partition: message.partition,
            offset: message.offset,
        })
    }
}
