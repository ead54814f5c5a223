//! Event log access: one independent reader per topic partition
use std::future::Future;
use std::time::Duration;

use rdkafka::{
    config::ClientConfig,
    consumer::{BaseConsumer, Consumer, StreamConsumer},
    error::KafkaError,
    message::{BorrowedMessage, Headers},
    Message, Offset, TopicPartitionList,
};
use tracing::debug;

use crate::error::SourceError;
use crate::event::{LogMessage, TopicPartition};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Ordered reader over a single partition
pub trait PartitionSource: Send {
    /// Next message, or `None` if nothing arrived within `timeout`
    fn next_message(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<LogMessage>, SourceError>> + Send;
}

/// Partitioned, replayable log
pub trait EventLog: Send + Sync {
    type Partition: PartitionSource + 'static;

    fn partitions(&self) -> Result<Vec<TopicPartition>, SourceError>;

    /// Opens a reader positioned at `start`, or at the beginning of the log when `None`
    fn open(&self, partition: &TopicPartition, start: Option<i64>)
        -> Result<Self::Partition, SourceError>;
}

/// Kafka settings shared by log readers and the checkpoint store
pub fn client_config(brokers: &str, group: &str, session_timeout_ms: u64) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", brokers)
        .set("group.id", group)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "earliest")
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", session_timeout_ms.to_string());
    config
}

/// Lists partitions of the given topics from broker metadata
pub fn topic_partitions<C: Consumer>(
    consumer: &C,
    topics: &[String],
) -> Result<Vec<TopicPartition>, KafkaError> {
    let mut partitions = Vec::new();
    for topic in topics {
        let metadata = consumer.fetch_metadata(Some(topic), METADATA_TIMEOUT)?;
        for t in metadata.topics() {
            if let Some(err) = t.error() {
                return Err(KafkaError::MetadataFetch(err.into()));
            }
            for p in t.partitions() {
                partitions.push(TopicPartition::new(t.name(), p.id()));
            }
        }
    }
    partitions.sort();
    Ok(partitions)
}

pub struct KafkaLog {
    config: ClientConfig,
    topics: Vec<String>,
}

impl KafkaLog {
    pub fn new(config: ClientConfig, topics: Vec<String>) -> KafkaLog {
        KafkaLog { config, topics }
    }
}

impl EventLog for KafkaLog {
    type Partition = KafkaPartition;

    fn partitions(&self) -> Result<Vec<TopicPartition>, SourceError> {
        let consumer: BaseConsumer = self.config.create()?;
        Ok(topic_partitions(&consumer, &self.topics)?)
    }

    fn open(
        &self,
        partition: &TopicPartition,
        start: Option<i64>,
    ) -> Result<KafkaPartition, SourceError> {
        // every partition gets its own consumer with a manual assignment, so
        // workers never share a queue and no rebalance can move a partition
        let consumer: StreamConsumer = self.config.create()?;
        let offset = start.map_or(Offset::Beginning, Offset::Offset);
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&partition.topic, partition.partition, offset)?;
        consumer.assign(&tpl)?;
        debug!(topic = %partition.topic, partition = partition.partition, ?offset, "assigned");
        Ok(KafkaPartition { consumer })
    }
}

pub struct KafkaPartition {
    consumer: StreamConsumer,
}

impl PartitionSource for KafkaPartition {
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<LogMessage>, SourceError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(msg)) => Ok(Some(to_log_message(&msg))),
        }
    }
}

fn to_log_message(msg: &BorrowedMessage<'_>) -> LogMessage {
    let headers = msg
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| (h.key.to_string(), h.value.map(<[u8]>::to_vec).unwrap_or_default()))
                .collect()
        })
        .unwrap_or_default();
    LogMessage {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(<[u8]>::to_vec),
        payload: msg.payload().map(<[u8]>::to_vec),
        headers,
        timestamp_ms: msg.timestamp().to_millis(),
    }
}
