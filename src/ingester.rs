//! Per-partition consumer loop.
//!
//! One `Ingester` owns one partition: it pulls messages in offset order, decodes
//! and maps them, batches the rows, and commits the checkpoint only after the
//! batch holding every row below that position has been flushed.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::decoder::Decoder;
use crate::error::{FatalPartitionError, PartitionFailure};
use crate::event::{EntityType, LogMessage, TopicPartition};
use crate::mapper::{self, Mapped, SkipReason};
use crate::source::PartitionSource;
use crate::store::Destination;
use crate::writer::{BatchWriter, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    CatchingUp,
    Streaming,
    Stopped,
    Failed,
}

/// How a worker decides it is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// stop once the partition stays idle for `idle_timeout`
    CatchUp,
    /// run until cancelled
    Stream,
}

#[derive(Debug, Clone)]
pub struct IngesterSettings {
    pub group: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub poll_timeout: Duration,
    pub idle_timeout: Duration,
    pub stats_interval: Duration,
    /// catch-up runs stop after this many messages
    pub max_messages: Option<u64>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionStats {
    pub consumed: u64,
    pub decode_errors: u64,
    pub skipped: u64,
    pub unknown_operations: u64,
    pub rows_written: u64,
    pub flushes: u64,
    pub latest_event_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct PartitionReport {
    pub partition: TopicPartition,
    pub entity: EntityType,
    pub state: RunState,
    pub committed: Option<i64>,
    pub stats: PartitionStats,
}

pub struct Ingester<S, D, C> {
    partition: TopicPartition,
    entity: EntityType,
    source: S,
    writer: BatchWriter<D>,
    checkpoints: Arc<C>,
    decoder: Arc<dyn Decoder + Send + Sync>,
    settings: IngesterSettings,
    state: RunState,
    /// last durably committed position
    committed: Option<i64>,
    /// position after the last consumed message
    consumed: Option<i64>,
    stats: PartitionStats,
}

impl<S, D, C> Ingester<S, D, C>
where
    S: PartitionSource,
    D: Destination,
    C: CheckpointStore,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        partition: TopicPartition,
        entity: EntityType,
        source: S,
        writer: BatchWriter<D>,
        checkpoints: Arc<C>,
        decoder: Arc<dyn Decoder + Send + Sync>,
        settings: IngesterSettings,
        committed: Option<i64>,
    ) -> Ingester<S, D, C> {
        Ingester {
            partition,
            entity,
            source,
            writer,
            checkpoints,
            decoder,
            settings,
            state: RunState::Starting,
            committed,
            consumed: None,
            stats: PartitionStats::default(),
        }
    }

    pub async fn start(
        mut self,
        pace: Pace,
        cancel: CancellationToken,
    ) -> Result<PartitionReport, FatalPartitionError> {
        self.transition(match pace {
            Pace::CatchUp => RunState::CatchingUp,
            Pace::Stream => RunState::Streaming,
        });

        let started = Instant::now();
        let mut last_flush = Instant::now();
        let mut last_message = Instant::now();
        let mut last_stats = Instant::now();

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(topic = %self.partition.topic, partition = self.partition.partition, "stop requested, finishing batch");
                    break;
                }
                polled = self.source.next_message(self.settings.poll_timeout) => polled,
            };

            match polled {
                Ok(Some(msg)) => {
                    last_message = Instant::now();
                    self.process(msg);
                    if self.writer.is_full() {
                        self.flush_and_commit().await?;
                        last_flush = Instant::now();
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(topic = %self.partition.topic, partition = self.partition.partition, error = %e, "error receiving message");
                    tokio::time::sleep(self.settings.poll_timeout).await;
                }
            }

            if last_flush.elapsed() >= self.settings.flush_interval {
                self.flush_and_commit().await?;
                last_flush = Instant::now();
            }

            match pace {
                Pace::CatchUp => {
                    if last_message.elapsed() >= self.settings.idle_timeout {
                        info!(topic = %self.partition.topic, partition = self.partition.partition, "caught up");
                        break;
                    }
                    if self
                        .settings
                        .max_messages
                        .is_some_and(|max| self.stats.consumed >= max)
                    {
                        info!(topic = %self.partition.topic, partition = self.partition.partition, consumed = self.stats.consumed, "reached max messages limit");
                        break;
                    }
                }
                Pace::Stream => {
                    if last_stats.elapsed() >= self.settings.stats_interval {
                        self.log_stats(started.elapsed());
                        last_stats = Instant::now();
                    }
                }
            }
        }

        self.flush_and_commit().await?;
        self.transition(RunState::Stopped);
        Ok(self.report())
    }

    fn process(&mut self, msg: LogMessage) {
        self.stats.consumed += 1;
        self.consumed = Some(msg.next_position());

        let event = match self.decoder.decode(&msg, self.entity) {
            Ok(event) => event,
            Err(e) => {
                self.stats.decode_errors += 1;
                warn!(topic = %msg.topic, partition = msg.partition, offset = msg.offset, error = %e, "failed to decode message");
                return;
            }
        };
        self.stats.latest_event_ms = self.stats.latest_event_ms.max(Some(event.event_time_ms));

        match mapper::map(&event, Utc::now()) {
            Mapped::Row(row) => self.writer.add(row),
            Mapped::Skip(reason) => {
                self.stats.skipped += 1;
                if reason == SkipReason::UnknownOperation {
                    self.stats.unknown_operations += 1;
                    warn!(topic = %msg.topic, partition = msg.partition, offset = msg.offset, "message without a known operation, skipping");
                } else {
                    debug!(topic = %msg.topic, partition = msg.partition, offset = msg.offset, %reason, "skipping message");
                }
            }
        }
    }

    /// Flushes pending rows, then commits the position after the last consumed message.
    /// Nothing is committed unless the flush succeeded.
    async fn flush_and_commit(&mut self) -> Result<(), FatalPartitionError> {
        if !self.writer.is_empty() {
            match self.writer.flush().await {
                Ok(rows) => {
                    self.stats.rows_written += rows as u64;
                    self.stats.flushes += 1;
                    info!(topic = %self.partition.topic, partition = self.partition.partition, rows, "flushed batch");
                }
                Err(e) => return Err(self.fail(e.into())),
            }
        }

        let position = match self.consumed {
            Some(position) if self.committed.map_or(true, |c| position > c) => position,
            _ => return Ok(()),
        };
        let checkpoints = Arc::clone(&self.checkpoints);
        let group = self.settings.group.clone();
        let partition = self.partition.clone();
        let committed = self
            .settings
            .retry
            .run("checkpoint commit", || {
                std::future::ready(checkpoints.commit(&group, &partition, position))
            })
            .await;
        match committed {
            Ok(()) => {
                self.committed = Some(position);
                debug!(topic = %self.partition.topic, partition = self.partition.partition, position, "committed");
                Ok(())
            }
            Err(e) => Err(self.fail(e.last.into())),
        }
    }

    fn fail(&mut self, cause: PartitionFailure) -> FatalPartitionError {
        self.transition(RunState::Failed);
        error!(
            topic = %self.partition.topic,
            partition = self.partition.partition,
            last_committed = ?self.committed,
            pending_rows = self.writer.len(),
            error = %cause,
            "partition halted"
        );
        FatalPartitionError {
            partition: self.partition.clone(),
            last_committed: self.committed,
            cause,
        }
    }

    fn transition(&mut self, state: RunState) {
        debug!(topic = %self.partition.topic, partition = self.partition.partition, from = ?self.state, to = ?state, "state change");
        self.state = state;
    }

    fn log_stats(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            self.stats.consumed as f64 / secs
        } else {
            0.0
        };
        let lag_ms = self
            .stats
            .latest_event_ms
            .map(|ts| Utc::now().timestamp_millis() - ts);
        info!(
            topic = %self.partition.topic,
            partition = self.partition.partition,
            entity = %self.entity,
            consumed = self.stats.consumed,
            rows_written = self.stats.rows_written,
            skipped = self.stats.skipped,
            decode_errors = self.stats.decode_errors,
            rate = format!("{rate:.1}"),
            lag_ms = ?lag_ms,
            "real-time progress"
        );
    }

    fn report(&self) -> PartitionReport {
        PartitionReport {
            partition: self.partition.clone(),
            entity: self.entity,
            state: self.state,
            committed: self.committed,
            stats: self.stats.clone(),
        }
    }
}
