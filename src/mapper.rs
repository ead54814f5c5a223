//! Maps change events onto destination rows.
//!
//! Mapping is a pure function of the event and the caller-supplied extraction
//! time, so replaying the same log always produces the same rows.
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::event::{ChangeEvent, DestinationRow, Operation};

/// Why an event produced no row. Skips are expected outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SkipReason {
    Tombstone,
    Deleted,
    UnknownOperation,
    MissingPayload,
    MissingIdentifier,
    MissingField(&'static str),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Tombstone => f.write_str("tombstone"),
            SkipReason::Deleted => f.write_str("delete"),
            SkipReason::UnknownOperation => f.write_str("unknown operation"),
            SkipReason::MissingPayload => f.write_str("missing payload"),
            SkipReason::MissingIdentifier => f.write_str("missing identifier"),
            SkipReason::MissingField(field) => write!(f, "missing {field}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mapped {
    Row(DestinationRow),
    Skip(SkipReason),
}

/// Identifier fields tried in order
const ID_FIELDS: [&str; 2] = ["_id", "id"];

pub fn map(event: &ChangeEvent, extracted_at: DateTime<Utc>) -> Mapped {
    if event.is_tombstone {
        return Mapped::Skip(SkipReason::Tombstone);
    }
    let operation = match event.operation {
        Some(Operation::Delete) => return Mapped::Skip(SkipReason::Deleted),
        Some(op) => op,
        None => return Mapped::Skip(SkipReason::UnknownOperation),
    };
    let payload = match &event.after_payload {
        Some(payload) => payload,
        None => return Mapped::Skip(SkipReason::MissingPayload),
    };

    let natural_id = match natural_id(&payload.document) {
        Some(id) => id,
        None => return Mapped::Skip(SkipReason::MissingIdentifier),
    };
    for &field in event.entity.required_fields() {
        if payload.document.get(field).and_then(identifier).is_none() {
            return Mapped::Skip(SkipReason::MissingField(field));
        }
    }

    Mapped::Row(DestinationRow {
        entity: event.entity,
        natural_id,
        raw_data: payload.raw.clone(),
        operation,
        event_timestamp_ms: event.event_time_ms,
        extracted_at,
        partition: event.partition,
        offset: event.offset,
    })
}

fn natural_id(document: &Map<String, Value>) -> Option<String> {
    ID_FIELDS
        .iter()
        .find_map(|field| document.get(*field).and_then(identifier))
}

/// Identifier text of a string, number or `{"$oid": ...}` value; empty counts as missing
fn identifier(value: &Value) -> Option<String> {
    let id = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Object(obj) => match obj.get("$oid") {
            Some(Value::String(s)) => s.trim().to_string(),
            _ => return None,
        },
        _ => return None,
    };
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}
