//! ## cdc-bridge
//! Change-data-capture ingestion from Kafka to ClickHouse.
//!
//! Debezium publishes row-level changes of the `customers`, `products` and `orders`
//! collections to Kafka. This service consumes them and appends one row per live
//! change into an append-only ClickHouse table per entity, keeping the original
//! document as `raw_data` for downstream SQL models.
//!
//! ## Configuration
//! Example config:
//! ```toml
//! [kafka]
//! brokers = "localhost:9092"
//! consumer_group = "clickhouse-bridge-group"
//!
//! [clickhouse]
//! url = "tcp://localhost:9000"
//!
//! [bridge]
//! decoder = "flattened"                 # Debezium unwrap output; "envelope" for full envelopes
//! batch_size = 100
//! flush_interval_seconds = 5
//! idle_timeout_seconds = 10
//! custom.operation_field = "__op"       # decoder-specific settings
//!
//! [[topics]]
//! name = "mongo.ecom.ecom.orders"
//! entity = "order"
//! table = "mongo_ecom_orders"
//! ```
//!
//! ## Run modes
//! * `realtime` streams until stopped by Ctrl+C / SIGTERM,
//! * `batch` catches up from the last committed offsets and exits,
//! * `reset` truncates the tables, rewinds the consumer group and replays the log.
//!
//! ## Kafka and ClickHouse
//! Every partition is consumed by its own worker. Offsets are only committed after
//! the rows of all messages below them were inserted into ClickHouse, so a crash
//! replays the last batch at worst. Tables are never updated in place: the latest
//! state of an entity is the row with the highest `_event_timestamp_ms` for its
//! identifier, which makes replayed duplicates harmless.
//!
//! Deletes and tombstones advance offsets but produce no rows, as do messages
//! that cannot be decoded or lack an identifier.
//!
//! ## Extending
//! Other message formats can be supported by implementing the [Decoder] trait
//! and registering it in [get_decoder].
//!
//! [Decoder]: decoder::Decoder
//! [get_decoder]: decoder::get_decoder

pub mod bridge;
pub mod checkpoint;
pub mod decoder;
pub mod error;
pub mod event;
pub mod ingester;
pub mod mapper;
pub mod settings;
pub mod source;
pub mod store;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;
