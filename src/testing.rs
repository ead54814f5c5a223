//! In-memory log, store and checkpoint doubles for tests
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::Value;

use crate::checkpoint::CheckpointStore;
use crate::error::{CheckpointError, SourceError, WriteError};
use crate::event::{DestinationRow, EntityType, LogMessage, Operation, TopicPartition};
use crate::source::{EventLog, PartitionSource};
use crate::store::Destination;

pub fn row(entity: EntityType, id: &str, ts: i64, offset: i64) -> DestinationRow {
    DestinationRow {
        entity,
        natural_id: id.to_string(),
        raw_data: format!(r#"{{"_id":"{id}"}}"#),
        operation: Operation::Create,
        event_timestamp_ms: ts,
        extracted_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        partition: 0,
        offset,
    }
}

/// Appendable log; readers see messages pushed after they were opened
#[derive(Clone, Default)]
pub struct MemoryLog {
    partitions: Arc<Mutex<BTreeMap<TopicPartition, Vec<LogMessage>>>>,
}

impl MemoryLog {
    /// Registers an empty partition
    pub fn add_partition(&self, topic: &str, partition: i32) {
        self.partitions
            .lock()
            .unwrap()
            .entry(TopicPartition::new(topic, partition))
            .or_default();
    }

    /// Appends a message and returns its offset
    pub fn push(&self, topic: &str, partition: i32, payload: Option<&str>) -> i64 {
        let mut partitions = self.partitions.lock().unwrap();
        let messages = partitions
            .entry(TopicPartition::new(topic, partition))
            .or_default();
        let offset = messages.len() as i64;
        messages.push(LogMessage {
            topic: topic.to_string(),
            partition,
            offset,
            key: None,
            payload: payload.map(|p| p.as_bytes().to_vec()),
            headers: vec![],
            timestamp_ms: Some(offset),
        });
        offset
    }

    pub fn push_json(&self, topic: &str, partition: i32, value: Value) -> i64 {
        self.push(topic, partition, Some(&value.to_string()))
    }

    fn get(&self, partition: &TopicPartition, offset: i64) -> Option<LogMessage> {
        let partitions = self.partitions.lock().unwrap();
        partitions.get(partition)?.get(offset as usize).cloned()
    }
}

impl EventLog for MemoryLog {
    type Partition = MemoryPartition;

    fn partitions(&self) -> Result<Vec<TopicPartition>, SourceError> {
        Ok(self.partitions.lock().unwrap().keys().cloned().collect())
    }

    fn open(
        &self,
        partition: &TopicPartition,
        start: Option<i64>,
    ) -> Result<MemoryPartition, SourceError> {
        if !self.partitions.lock().unwrap().contains_key(partition) {
            return Err(SourceError::UnknownTopic(partition.topic.clone()));
        }
        Ok(MemoryPartition {
            log: self.clone(),
            partition: partition.clone(),
            next: start.unwrap_or(0),
        })
    }
}

pub struct MemoryPartition {
    log: MemoryLog,
    partition: TopicPartition,
    next: i64,
}

impl PartitionSource for MemoryPartition {
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<LogMessage>, SourceError> {
        match self.log.get(&self.partition, self.next) {
            Some(msg) => {
                self.next = msg.offset + 1;
                Ok(Some(msg))
            }
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }
}

/// Injected outcome of the next insert
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// nothing written
    Reject,
    /// first n rows written, then an error
    Partial(usize),
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, Vec<DestinationRow>>>,
    failures: Mutex<VecDeque<Failure>>,
    inserts: Mutex<Vec<(String, usize)>>,
}

impl MemoryStore {
    pub fn fail_next(&self, failure: Failure) {
        self.failures.lock().unwrap().push_back(failure);
    }

    pub fn rows(&self, table: &str) -> Vec<DestinationRow> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Successful inserts as (table, rows)
    pub fn inserts(&self) -> Vec<(String, usize)> {
        self.inserts.lock().unwrap().clone()
    }

    /// Latest row per identifier, ranked by event time like the downstream layer does
    pub fn latest(&self, table: &str) -> BTreeMap<String, (i64, String)> {
        let mut latest: BTreeMap<String, (i64, String)> = BTreeMap::new();
        for row in self.rows(table) {
            let newer = latest
                .get(&row.natural_id)
                .map_or(true, |(ts, _)| row.event_timestamp_ms > *ts);
            if newer {
                latest.insert(row.natural_id, (row.event_timestamp_ms, row.raw_data));
            }
        }
        latest
    }
}

impl Destination for MemoryStore {
    async fn ensure_table(&self, _entity: EntityType, table: &str) -> Result<(), WriteError> {
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default();
        Ok(())
    }

    async fn insert(&self, table: &str, rows: &[DestinationRow]) -> Result<(), WriteError> {
        let failure = self.failures.lock().unwrap().pop_front();
        let mut tables = self.tables.lock().unwrap();
        let stored = tables.entry(table.to_string()).or_default();
        match failure {
            None => {
                stored.extend_from_slice(rows);
                self.inserts
                    .lock()
                    .unwrap()
                    .push((table.to_string(), rows.len()));
                Ok(())
            }
            Some(Failure::Reject) => Err(WriteError::Rejected("injected failure".into())),
            Some(Failure::Partial(n)) => {
                stored.extend_from_slice(&rows[..n.min(rows.len())]);
                Err(WriteError::Rejected("injected partial write".into()))
            }
        }
    }

    async fn truncate(&self, table: &str) -> Result<(), WriteError> {
        if let Some(rows) = self.tables.lock().unwrap().get_mut(table) {
            rows.clear();
        }
        Ok(())
    }

    async fn count(&self, table: &str) -> Result<u64, WriteError> {
        Ok(self.rows(table).len() as u64)
    }
}

#[derive(Default)]
pub struct MemoryCheckpoints {
    positions: Mutex<BTreeMap<(String, TopicPartition), i64>>,
    failing_commits: Mutex<u32>,
    failing_loads: Mutex<Option<Option<TopicPartition>>>,
    commits: Mutex<Vec<(TopicPartition, i64)>>,
}

impl MemoryCheckpoints {
    pub fn fail_commits(&self, n: u32) {
        *self.failing_commits.lock().unwrap() = n;
    }

    /// Every load fails
    pub fn fail_loads(&self) {
        *self.failing_loads.lock().unwrap() = Some(None);
    }

    /// Loads of `partition` fail, the others succeed
    pub fn fail_loads_of(&self, partition: TopicPartition) {
        *self.failing_loads.lock().unwrap() = Some(Some(partition));
    }

    pub fn position(&self, group: &str, partition: &TopicPartition) -> Option<i64> {
        self.positions
            .lock()
            .unwrap()
            .get(&(group.to_string(), partition.clone()))
            .copied()
    }

    /// Every successful commit in order
    pub fn commits(&self) -> Vec<(TopicPartition, i64)> {
        self.commits.lock().unwrap().clone()
    }
}

impl CheckpointStore for MemoryCheckpoints {
    fn load(&self, group: &str, partition: &TopicPartition) -> Result<Option<i64>, CheckpointError> {
        let failing = match &*self.failing_loads.lock().unwrap() {
            Some(None) => true,
            Some(Some(only)) => only == partition,
            None => false,
        };
        if failing {
            return Err(CheckpointError::Unavailable("injected load failure".into()));
        }
        Ok(self.position(group, partition))
    }

    fn commit(
        &self,
        group: &str,
        partition: &TopicPartition,
        position: i64,
    ) -> Result<(), CheckpointError> {
        {
            let mut failing = self.failing_commits.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(CheckpointError::Unavailable("injected commit failure".into()));
            }
        }
        // compare-and-set: positions only move forward
        let mut positions = self.positions.lock().unwrap();
        let current = positions
            .entry((group.to_string(), partition.clone()))
            .or_insert(position);
        *current = (*current).max(position);
        self.commits
            .lock()
            .unwrap()
            .push((partition.clone(), position));
        Ok(())
    }

    fn reset(&self, group: &str) -> Result<(), CheckpointError> {
        self.positions.lock().unwrap().retain(|(g, _), _| g != group);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoints_never_move_backwards() {
        let cp = MemoryCheckpoints::default();
        let tp = TopicPartition::new("t", 0);
        cp.commit("g", &tp, 5).unwrap();
        cp.commit("g", &tp, 3).unwrap();
        assert_eq!(cp.load("g", &tp).unwrap(), Some(5));
        assert_eq!(cp.load("other", &tp).unwrap(), None);

        cp.reset("g").unwrap();
        assert_eq!(cp.load("g", &tp).unwrap(), None);
    }
}
