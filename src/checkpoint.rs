//! Consumer-group checkpoints.
//!
//! A position is the offset of the *next* message to read, i.e. the offset of the
//! last consumed message plus one. Positions are only committed after the rows of
//! every message below them have been flushed to the destination.
use std::time::Duration;

use rdkafka::{
    config::ClientConfig,
    consumer::{BaseConsumer, CommitMode, Consumer},
    Offset, TopicPartitionList,
};
use tracing::info;

use crate::error::CheckpointError;
use crate::event::TopicPartition;
use crate::source::topic_partitions;

/// Durable per-(group, partition) positions.
/// Implementations must let workers of different partitions commit concurrently.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, group: &str, partition: &TopicPartition) -> Result<Option<i64>, CheckpointError>;

    fn commit(
        &self,
        group: &str,
        partition: &TopicPartition,
        position: i64,
    ) -> Result<(), CheckpointError>;

    /// Forgets every position of `group`; the next load starts from the beginning of the log
    fn reset(&self, group: &str) -> Result<(), CheckpointError>;
}

/// Checkpoints kept as Kafka committed offsets
pub struct KafkaCheckpoints {
    consumer: BaseConsumer,
    group: String,
    topics: Vec<String>,
    timeout: Duration,
}

impl KafkaCheckpoints {
    /// `config` must carry the consumer group as `group.id`
    pub fn new(
        config: &ClientConfig,
        group: &str,
        topics: Vec<String>,
        timeout: Duration,
    ) -> Result<KafkaCheckpoints, CheckpointError> {
        Ok(KafkaCheckpoints {
            consumer: config.create()?,
            group: group.to_string(),
            topics,
            timeout,
        })
    }

    fn check_group(&self, group: &str) -> Result<(), CheckpointError> {
        if group == self.group {
            Ok(())
        } else {
            Err(CheckpointError::WrongGroup {
                bound: self.group.clone(),
                requested: group.to_string(),
            })
        }
    }
}

impl CheckpointStore for KafkaCheckpoints {
    fn load(&self, group: &str, partition: &TopicPartition) -> Result<Option<i64>, CheckpointError> {
        self.check_group(group)?;
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(&partition.topic, partition.partition);
        let committed = self.consumer.committed_offsets(tpl, self.timeout)?;
        let position = committed
            .find_partition(&partition.topic, partition.partition)
            .and_then(|elem| match elem.offset() {
                Offset::Offset(n) if n >= 0 => Some(n),
                _ => None,
            });
        Ok(position)
    }

    fn commit(
        &self,
        group: &str,
        partition: &TopicPartition,
        position: i64,
    ) -> Result<(), CheckpointError> {
        self.check_group(group)?;
        // a single-partition list never touches positions owned by other workers
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&partition.topic, partition.partition, Offset::Offset(position))?;
        self.consumer.commit(&tpl, CommitMode::Sync)?;
        Ok(())
    }

    fn reset(&self, group: &str) -> Result<(), CheckpointError> {
        self.check_group(group)?;
        let mut tpl = TopicPartitionList::new();
        for p in topic_partitions(&self.consumer, &self.topics)? {
            let (low, _high) = self
                .consumer
                .fetch_watermarks(&p.topic, p.partition, self.timeout)?;
            tpl.add_partition_offset(&p.topic, p.partition, Offset::Offset(low))?;
        }
        if tpl.count() > 0 {
            self.consumer.commit(&tpl, CommitMode::Sync)?;
        }
        info!(group, partitions = tpl.count(), "checkpoints rewound to log start");
        Ok(())
    }
}
