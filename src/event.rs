//! Change events and the types shared by every pipeline stage
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Upstream entity a topic carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Customer,
    Product,
    Order,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [EntityType::Customer, EntityType::Product, EntityType::Order];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Customer => "customer",
            EntityType::Product => "product",
            EntityType::Order => "order",
        }
    }

    /// Name of the natural identifier column in the destination table
    pub fn id_column(&self) -> &'static str {
        match self {
            EntityType::Customer => "customer_id",
            EntityType::Product => "product_id",
            EntityType::Order => "order_id",
        }
    }

    /// Topic written by the upstream connector for this entity
    pub fn default_topic(&self) -> &'static str {
        match self {
            EntityType::Customer => "mongo.ecom.ecom.customers",
            EntityType::Product => "mongo.ecom.ecom.products",
            EntityType::Order => "mongo.ecom.ecom.orders",
        }
    }

    pub fn default_table(&self) -> &'static str {
        match self {
            EntityType::Customer => "mongo_ecom_customers",
            EntityType::Product => "mongo_ecom_products",
            EntityType::Order => "mongo_ecom_orders",
        }
    }

    /// Payload fields besides the identifier that must be non-empty
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            EntityType::Order => &["customer_id"],
            _ => &[],
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Debezium operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Parses a Debezium operation code (`r`, `c`, `u`, `d`)
    pub fn from_code(code: &str) -> Option<Operation> {
        match code.trim() {
            "r" => Some(Operation::Read),
            "c" => Some(Operation::Create),
            "u" => Some(Operation::Update),
            "d" => Some(Operation::Delete),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Operation::Read => "r",
            Operation::Create => "c",
            Operation::Update => "u",
            Operation::Delete => "d",
        }
    }
}

/// Raw message pulled from one partition of the log
#[derive(Debug, Clone, PartialEq)]
pub struct LogMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
    /// broker/producer timestamp, if the message carries one
    pub timestamp_ms: Option<i64>,
}

impl LogMessage {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Next position to read once this message has been consumed
    pub fn next_position(&self) -> i64 {
        self.offset + 1
    }
}

/// Document extracted from a change event, kept both verbatim and parsed
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    /// exact text received from the log
    pub raw: String,
    pub document: Map<String, Value>,
}

/// Normalized change record produced by a decoder
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub entity: EntityType,
    /// `None` when the operation kind is missing or unknown
    pub operation: Option<Operation>,
    pub after_payload: Option<Payload>,
    pub event_time_ms: i64,
    pub is_tombstone: bool,
    pub partition: i32,
    pub offset: i64,
}

impl ChangeEvent {
    /// Deletes and tombstones are consumed but never written
    pub fn is_materializable(&self) -> bool {
        !self.is_tombstone
            && matches!(
                self.operation,
                Some(Operation::Read | Operation::Create | Operation::Update)
            )
    }
}

/// Row appended to an entity's destination table
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationRow {
    pub entity: EntityType,
    pub natural_id: String,
    pub raw_data: String,
    pub operation: Operation,
    pub event_timestamp_ms: i64,
    pub extracted_at: DateTime<Utc>,
    pub partition: i32,
    pub offset: i64,
}

/// One partition of one topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}
