//! Error taxonomy of the bridge
use crate::event::TopicPartition;

/// Message could not be turned into a change event.
/// The message is still consumed: logged, skipped, offset advanced.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a json object, found {0}")]
    NotAnObject(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

/// Failure to read from the event log
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("kafka: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("unknown topic {0}")]
    UnknownTopic(String),
}

/// Failure to write to the destination store
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("clickhouse: {0}")]
    ClickHouse(#[from] clickhouse_rs::errors::Error),

    #[error("no table configured for entity {0}")]
    UnknownEntity(crate::event::EntityType),

    #[error("{0}")]
    Rejected(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<WriteError> },
}

/// Failure of the checkpoint store
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("kafka: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("checkpoint store is bound to group {bound}, not {requested}")]
    WrongGroup { bound: String, requested: String },

    #[error("{0}")]
    Unavailable(String),
}

/// Why a partition worker gave up
#[derive(Debug, thiserror::Error)]
pub enum PartitionFailure {
    #[error("flush failed: {0}")]
    Write(#[from] WriteError),

    #[error("checkpoint commit failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("partition source failed: {0}")]
    Source(#[from] SourceError),

    #[error("worker task aborted: {0}")]
    Aborted(String),
}

/// Unrecoverable error for a single partition worker.
/// Offsets past `last_committed` were not committed and will be replayed on restart.
#[derive(Debug, thiserror::Error)]
#[error("partition {partition} halted at committed position {}: {cause}", position(.last_committed))]
pub struct FatalPartitionError {
    pub partition: TopicPartition,
    pub last_committed: Option<i64>,
    #[source]
    pub cause: PartitionFailure,
}

fn position(p: &Option<i64>) -> String {
    match p {
        Some(p) => p.to_string(),
        None => String::from("none"),
    }
}

/// Errors that stop the whole run before any worker starts
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("cannot determine resume point: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("destination store: {0}")]
    Store(#[from] WriteError),

    #[error("event log: {0}")]
    Source(#[from] SourceError),
}
