//! Batching writer with bounded retries
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::WriteError;
use crate::event::{DestinationRow, EntityType};
use crate::store::Destination;

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// total attempts including the first one
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Last error of an operation that ran out of attempts
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: E,
}

impl RetryPolicy {
    /// Sleep before retry number `retry` (1 for the first retry)
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(30);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds or the attempt limit is reached
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, Exhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        error = %e,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "{what} failed, will retry"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Exhausted {
                        attempts: attempt,
                        last: e,
                    })
                }
            }
        }
    }
}

/// Accumulates rows per entity and writes them as whole batches
pub struct BatchWriter<D> {
    store: Arc<D>,
    tables: BTreeMap<EntityType, String>,
    batches: BTreeMap<EntityType, Vec<DestinationRow>>,
    batch_size: usize,
    retry: RetryPolicy,
}

impl<D: Destination> BatchWriter<D> {
    pub fn new(
        store: Arc<D>,
        tables: BTreeMap<EntityType, String>,
        batch_size: usize,
        retry: RetryPolicy,
    ) -> BatchWriter<D> {
        BatchWriter {
            store,
            tables,
            batches: BTreeMap::new(),
            batch_size: batch_size.max(1),
            retry,
        }
    }

    pub fn add(&mut self, row: DestinationRow) {
        self.batches.entry(row.entity).or_default().push(row);
    }

    /// Rows waiting for a flush
    pub fn len(&self) -> usize {
        self.batches.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.values().all(Vec::is_empty)
    }

    /// True once any entity batch reached the size threshold
    pub fn is_full(&self) -> bool {
        self.batches.values().any(|b| b.len() >= self.batch_size)
    }

    fn table(&self, entity: EntityType) -> Result<&str, WriteError> {
        self.tables
            .get(&entity)
            .map(String::as_str)
            .ok_or(WriteError::UnknownEntity(entity))
    }

    /// Writes every pending batch, retrying each as a unit.
    /// A batch is only discarded once the store accepted all of it.
    pub async fn flush(&mut self) -> Result<usize, WriteError> {
        let mut written = 0;
        let pending: Vec<EntityType> = self
            .batches
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(entity, _)| *entity)
            .collect();
        for entity in pending {
            let table = self.table(entity)?.to_string();
            let rows = &self.batches[&entity];
            let store = &self.store;
            self.retry
                .run("insert", || store.insert(&table, rows))
                .await
                .map_err(|e| WriteError::Exhausted {
                    attempts: e.attempts,
                    last: Box::new(e.last),
                })?;
            debug!(table, rows = rows.len(), "inserted batch");
            written += rows.len();
            if let Some(rows) = self.batches.get_mut(&entity) {
                rows.clear();
            }
        }
        Ok(written)
    }

    /// Clears the destination table of `entity`. Only used before the first flush of a reset run.
    pub async fn truncate(&self, entity: EntityType) -> Result<(), WriteError> {
        let table = self.table(entity)?;
        self.retry
            .run("truncate", || self.store.truncate(table))
            .await
            .map_err(|e| WriteError::Exhausted {
                attempts: e.attempts,
                last: Box::new(e.last),
            })
    }
}
