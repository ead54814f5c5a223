//! Decoder for Debezium "new record state" messages.
//!
//! The unwrap transform replaces the change envelope with the document itself and
//! reports the operation through `__op`, deletes through `__deleted` and the source
//! time through `__source_ts_ms`, either as message headers or as extra fields.
use serde::Deserialize;

use super::{header_text, is_truthy, millis, parse_object, payload_text};
use crate::error::DecodeError;
use crate::event::{ChangeEvent, EntityType, LogMessage, Operation, Payload};

/// `custom` settings of the flattened decoder
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// header or field holding the operation code
    pub operation_field: String,
    /// header or field set to `true` for rewritten deletes
    pub deleted_field: String,
    /// headers or fields holding the event time, first match wins
    pub timestamp_fields: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            operation_field: String::from("__op"),
            deleted_field: String::from("__deleted"),
            timestamp_fields: vec![String::from("__source_ts_ms"), String::from("__ts_ms")],
        }
    }
}

#[derive(Default)]
pub struct Decoder {
    settings: Settings,
}

impl Decoder {
    pub fn new(settings: Settings) -> Decoder {
        Decoder { settings }
    }

    fn header_time(&self, message: &LogMessage) -> Result<Option<i64>, DecodeError> {
        for field in &self.settings.timestamp_fields {
            if let Some(text) = header_text(message, field) {
                let value = serde_json::Value::String(text.to_string());
                return millis(field, &value);
            }
        }
        Ok(None)
    }
}

impl super::Decoder for Decoder {
    fn get_name(&self) -> String {
        String::from("flattened")
    }

    fn decode(&self, message: &LogMessage, entity: EntityType) -> Result<ChangeEvent, DecodeError> {
        let header_op = header_text(message, &self.settings.operation_field).map(Operation::from_code);
        let header_deleted = header_text(message, &self.settings.deleted_field)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let header_time = self.header_time(message)?;

        let raw = match payload_text(message)? {
            Some(raw) => raw,
            None => {
                return Ok(ChangeEvent {
                    entity,
                    operation: if header_deleted {
                        Some(Operation::Delete)
                    } else {
                        header_op.flatten()
                    },
                    after_payload: None,
                    event_time_ms: header_time.or(message.timestamp_ms).unwrap_or(0),
                    is_tombstone: true,
                    partition: message.partition,
                    offset: message.offset,
                })
            }
        };

        let document = parse_object(raw)?;

        let mut operation = match header_op {
            Some(op) => op,
            None => document
                .get(&self.settings.operation_field)
                .and_then(|v| v.as_str())
                .and_then(Operation::from_code),
        };
        let deleted = header_deleted
            || document
                .get(&self.settings.deleted_field)
                .is_some_and(is_truthy);
        if deleted {
            operation = Some(Operation::Delete);
        }

        let mut event_time_ms = header_time;
        if event_time_ms.is_none() {
            for field in &self.settings.timestamp_fields {
                if let Some(value) = document.get(field) {
                    event_time_ms = millis(field, value)?;
                    if event_time_ms.is_some() {
                        break;
                    }
                }
            }
        }

        let after_payload = if deleted {
            None
        } else {
            Some(Payload {
                raw: raw.to_string(),
                document,
            })
        };

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
