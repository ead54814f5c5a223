//! Run modes and the supervisor spawning one ingester per partition
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::decoder::Decoder;
use crate::error::{BridgeError, FatalPartitionError, PartitionFailure};
use crate::event::EntityType;
use crate::ingester::{Ingester, IngesterSettings, Pace, PartitionReport};
use crate::source::EventLog;
use crate::store::Destination;
use crate::writer::BatchWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RunMode {
    /// truncate tables and replay the log from the beginning, then exit
    Reset,
    /// catch up from the last checkpoint, then exit
    Batch,
    /// stream continuously until stopped
    Realtime,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunMode::Reset => "reset",
            RunMode::Batch => "batch",
            RunMode::Realtime => "realtime",
        })
    }
}

/// Where a topic's rows go
#[derive(Debug, Clone, PartialEq)]
pub struct TopicRoute {
    pub topic: String,
    pub entity: EntityType,
    pub table: String,
}

#[derive(Debug)]
pub struct RunReport {
    pub mode: RunMode,
    pub partitions: Vec<PartitionReport>,
    pub failures: Vec<FatalPartitionError>,
    /// final row count per destination table
    pub table_counts: Vec<(String, u64)>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Messages consumed per entity across partitions
    pub fn consumed_by_entity(&self) -> BTreeMap<EntityType, u64> {
        let mut totals = BTreeMap::new();
        for p in &self.partitions {
            *totals.entry(p.entity).or_default() += p.stats.consumed;
        }
        totals
    }
}

pub struct Bridge<L, D, C> {
    log: L,
    store: Arc<D>,
    checkpoints: Arc<C>,
    decoder: Arc<dyn Decoder + Send + Sync>,
    routes: Vec<TopicRoute>,
    settings: IngesterSettings,
}

impl<L, D, C> Bridge<L, D, C>
where
    L: EventLog,
    D: Destination + 'static,
    C: CheckpointStore + 'static,
{
    pub fn new(
        log: L,
        store: Arc<D>,
        checkpoints: Arc<C>,
        decoder: Arc<dyn Decoder + Send + Sync>,
        routes: Vec<TopicRoute>,
        settings: IngesterSettings,
    ) -> Bridge<L, D, C> {
        Bridge {
            log,
            store,
            checkpoints,
            decoder,
            routes,
            settings,
        }
    }

    fn tables(&self) -> BTreeMap<EntityType, String> {
        self.routes
            .iter()
            .map(|r| (r.entity, r.table.clone()))
            .collect()
    }

    fn writer(&self) -> BatchWriter<D> {
        BatchWriter::new(
            Arc::clone(&self.store),
            self.tables(),
            self.settings.batch_size,
            self.settings.retry.clone(),
        )
    }

    pub async fn run(
        &self,
        mode: RunMode,
        cancel: CancellationToken,
    ) -> Result<RunReport, BridgeError> {
        info!(%mode, group = %self.settings.group, "starting bridge");

        for route in &self.routes {
            self.store.ensure_table(route.entity, &route.table).await?;
        }

        if mode == RunMode::Reset {
            let writer = self.writer();
            for route in &self.routes {
                writer.truncate(route.entity).await?;
                info!(table = %route.table, "cleared");
            }
            self.checkpoints.reset(&self.settings.group)?;
        }

        let pace = match mode {
            RunMode::Reset | RunMode::Batch => Pace::CatchUp,
            RunMode::Realtime => Pace::Stream,
        };

        // resume points and readers for every partition first: a failure here
        // must abort the run before any worker writes a row
        let mut assigned = Vec::new();
        for partition in self.log.partitions()? {
            let Some(route) = self.routes.iter().find(|r| r.topic == partition.topic) else {
                continue;
            };
            let start = self.checkpoints.load(&self.settings.group, &partition)?;
            let source = self.log.open(&partition, start)?;
            assigned.push((partition, route.entity, start, source));
        }
        if assigned.is_empty() {
            warn!("no partitions to consume");
        }

        let mut pending = BTreeSet::new();
        let mut workers = JoinSet::new();
        for (partition, entity, start, source) in assigned {
            info!(topic = %partition.topic, partition = partition.partition, start = ?start, %entity, "spawning partition worker");
            let ingester = Ingester::new(
                partition.clone(),
                entity,
                source,
                self.writer(),
                Arc::clone(&self.checkpoints),
                Arc::clone(&self.decoder),
                self.settings.clone(),
                start,
            );
            pending.insert(partition);
            workers.spawn(ingester.start(pace, cancel.clone()));
        }

        let mut partitions = Vec::new();
        let mut failures = Vec::new();
        let mut crashes = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(report)) => {
                    pending.remove(&report.partition);
                    partitions.push(report);
                }
                Ok(Err(fatal)) => {
                    error!(error = %fatal, "partition failed, other partitions continue");
                    pending.remove(&fatal.partition);
                    failures.push(fatal);
                }
                Err(e) => {
                    error!(error = %e, "partition worker crashed");
                    crashes.push(e.to_string());
                }
            }
        }
        // workers that ended without a report
        for partition in pending {
            failures.push(FatalPartitionError {
                partition,
                last_committed: None,
                cause: PartitionFailure::Aborted(crashes.join("; ")),
            });
        }
        partitions.sort_by(|a, b| a.partition.cmp(&b.partition));
        failures.sort_by(|a, b| a.partition.cmp(&b.partition));

        let mut table_counts = Vec::new();
        for route in &self.routes {
            match self.store.count(&route.table).await {
                Ok(count) => {
                    info!(table = %route.table, count, "table statistics");
                    table_counts.push((route.table.clone(), count));
                }
                Err(e) => warn!(table = %route.table, error = %e, "cannot count rows"),
            }
        }

        Ok(RunReport {
            mode,
            partitions,
            failures,
            table_counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::get_decoder;
    use crate::testing::{Failure, MemoryCheckpoints, MemoryLog, MemoryStore};
    use crate::event::TopicPartition;
    use crate::writer::RetryPolicy;
    use serde_json::json;
    use std::time::Duration;

    const GROUP: &str = "clickhouse-bridge-group";

    fn routes() -> Vec<TopicRoute> {
        EntityType::ALL
            .iter()
            .map(|e| TopicRoute {
                topic: e.default_topic().to_string(),
                entity: *e,
                table: e.default_table().to_string(),
            })
            .collect()
    }

    fn settings() -> IngesterSettings {
        IngesterSettings {
            group: GROUP.to_string(),
            batch_size: 2,
            flush_interval: Duration::from_secs(60),
            poll_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(1),
            stats_interval: Duration::from_secs(30),
            max_messages: None,
            retry: RetryPolicy {
                attempts: 2,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(10),
            },
        }
    }

    /// two customer partitions, one product, one order partition
    fn seeded_log() -> MemoryLog {
        let log = MemoryLog::default();
        let customers = EntityType::Customer.default_topic();
        let products = EntityType::Product.default_topic();
        let orders = EntityType::Order.default_topic();
        log.push_json(customers, 0, json!({"_id": "c1", "__op": "r", "__source_ts_ms": 10}));
        log.push_json(customers, 0, json!({"_id": "c1", "email": "new@x", "__op": "u", "__source_ts_ms": 30}));
        log.push_json(customers, 1, json!({"_id": "c2", "__op": "c", "__source_ts_ms": 20}));
        log.push_json(customers, 1, json!({"_id": "c2", "__op": "d", "__deleted": true, "__source_ts_ms": 40}));
        log.push_json(products, 0, json!({"_id": {"$oid": "p1"}, "price": 10.5, "__op": "c", "__source_ts_ms": 5}));
        log.push_json(products, 0, json!({"_id": {"$oid": "p1"}, "price": 12.0, "__op": "u", "__source_ts_ms": 7}));
        log.push_json(products, 0, json!({"_id": {"$oid": "p1"}, "price": 11.0, "__op": "u", "__source_ts_ms": 6}));
        log.push_json(orders, 0, json!({"_id": "o1", "customer_id": "c1", "__op": "c", "__source_ts_ms": 50}));
        log.push_json(orders, 0, json!({"_id": "o2", "customer_id": "", "__op": "c", "__source_ts_ms": 51}));
        log.push(orders, 0, None);
        log
    }

    struct Setup {
        store: Arc<MemoryStore>,
        checkpoints: Arc<MemoryCheckpoints>,
        bridge: Bridge<MemoryLog, MemoryStore, MemoryCheckpoints>,
    }

    fn setup(log: MemoryLog) -> Setup {
        let store = Arc::new(MemoryStore::default());
        let checkpoints = Arc::new(MemoryCheckpoints::default());
        let bridge = Bridge::new(
            log,
            store.clone(),
            checkpoints.clone(),
            get_decoder("flattened", None).unwrap(),
            routes(),
            settings(),
        );
        Setup {
            store,
            checkpoints,
            bridge,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batch_run_materializes_every_partition() {
        let s = setup(seeded_log());
        let report = s
            .bridge
            .run(RunMode::Batch, CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.partitions.len(), 4);
        assert_eq!(
            report.table_counts,
            [
                ("mongo_ecom_customers".to_string(), 3),
                ("mongo_ecom_products".to_string(), 3),
                ("mongo_ecom_orders".to_string(), 1),
            ]
        );
        let consumed = report.consumed_by_entity();
        assert_eq!(consumed[&EntityType::Customer], 4);
        assert_eq!(consumed[&EntityType::Order], 3);

        let orders = TopicPartition::new(EntityType::Order.default_topic(), 0);
        assert_eq!(s.checkpoints.position(GROUP, &orders), Some(3));

        // latest wins by event time, not by arrival
        let products = s.store.latest("mongo_ecom_products");
        assert_eq!(products["p1"].0, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_run_after_catch_up_adds_nothing() {
        let s = setup(seeded_log());
        s.bridge.run(RunMode::Batch, CancellationToken::new()).await.unwrap();
        let report = s
            .bridge
            .run(RunMode::Batch, CancellationToken::new())
            .await
            .unwrap();
        assert!(report.partitions.iter().all(|p| p.stats.consumed == 0));
        assert_eq!(s.store.rows("mongo_ecom_customers").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_twice_yields_identical_counts() {
        let s = setup(seeded_log());
        let first = s.bridge.run(RunMode::Reset, CancellationToken::new()).await.unwrap();
        let latest_first: Vec<_> = routes().iter().map(|r| s.store.latest(&r.table)).collect();

        let second = s.bridge.run(RunMode::Reset, CancellationToken::new()).await.unwrap();
        let latest_second: Vec<_> = routes().iter().map(|r| s.store.latest(&r.table)).collect();

        assert_eq!(first.table_counts, second.table_counts);
        assert_eq!(latest_first, latest_second);
        assert_eq!(second.consumed_by_entity()[&EntityType::Product], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_without_reset_keeps_latest_projection() {
        let s = setup(seeded_log());
        s.bridge.run(RunMode::Batch, CancellationToken::new()).await.unwrap();
        let before: Vec<_> = routes().iter().map(|r| s.store.latest(&r.table)).collect();

        // a lost checkpoint store replays everything on top of existing rows
        s.checkpoints.reset(GROUP).unwrap();
        s.bridge.run(RunMode::Batch, CancellationToken::new()).await.unwrap();
        let after: Vec<_> = routes().iter().map(|r| s.store.latest(&r.table)).collect();

        assert_eq!(before, after);
        assert_eq!(s.store.rows("mongo_ecom_customers").len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_partition_does_not_stop_others() {
        let log = MemoryLog::default();
        log.push_json(
            EntityType::Product.default_topic(),
            0,
            json!({"_id": "p", "__op": "c", "__source_ts_ms": 1}),
        );
        log.push_json(
            EntityType::Product.default_topic(),
            0,
            json!({"_id": "q", "__op": "c", "__source_ts_ms": 2}),
        );
        log.push_json(
            EntityType::Customer.default_topic(),
            0,
            json!({"_id": "c", "__op": "c", "__source_ts_ms": 3}),
        );
        let s = setup(log);
        // the full product batch is flushed first and rejected on both attempts;
        // the single customer row is only flushed once its partition goes idle
        s.store.fail_next(Failure::Reject);
        s.store.fail_next(Failure::Reject);

        let report = s.bridge.run(RunMode::Batch, CancellationToken::new()).await.unwrap();
        assert!(!report.is_success());
        assert_eq!(report.failures.len(), 1);
        let products = TopicPartition::new(EntityType::Product.default_topic(), 0);
        assert_eq!(report.failures[0].partition, products);
        assert_eq!(report.failures[0].last_committed, None);
        assert_eq!(s.checkpoints.position(GROUP, &products), None);

        assert_eq!(report.partitions.len(), 1);
        assert_eq!(s.store.rows("mongo_ecom_customers").len(), 1);
        assert!(s.store.rows("mongo_ecom_products").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoint_store_outage_is_fatal_at_startup() {
        let s = setup(seeded_log());
        s.checkpoints.fail_loads();
        let err = s
            .bridge
            .run(RunMode::Batch, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Checkpoint(_)));
        assert!(s.store.inserts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn later_partition_load_failure_starts_no_worker() {
        let s = setup(seeded_log());
        let customers = EntityType::Customer.default_topic();
        s.checkpoints
            .fail_loads_of(TopicPartition::new(customers, 1));

        let err = s
            .bridge
            .run(RunMode::Batch, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Checkpoint(_)));

        // give any stray worker time to flush and commit
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(s.store.inserts().is_empty());
        assert!(s.checkpoints.commits().is_empty());
        assert_eq!(
            s.checkpoints.position(GROUP, &TopicPartition::new(customers, 0)),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_collects_failure_of_any_partition() {
        let log = MemoryLog::default();
        let customers = EntityType::Customer.default_topic();
        let products = EntityType::Product.default_topic();
        log.push_json(customers, 0, json!({"_id": "c", "__op": "c", "__source_ts_ms": 1}));
        log.push_json(customers, 0, json!({"_id": "d", "__op": "c", "__source_ts_ms": 2}));
        log.push_json(products, 0, json!({"_id": "p", "__op": "c", "__source_ts_ms": 3}));
        log.push_json(products, 0, json!({"_id": "q", "__op": "c", "__source_ts_ms": 4}));
        let s = setup(log);
        // three rejections across two partitions with two attempts each: exactly one gives up
        s.store.fail_next(Failure::Reject);
        s.store.fail_next(Failure::Reject);
        s.store.fail_next(Failure::Reject);

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let bridge = s.bridge;
        let run = tokio::spawn(async move { bridge.run(RunMode::Realtime, cancel).await });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!run.is_finished());
        stopper.cancel();

        let report = run.await.unwrap().unwrap();
        assert!(!report.is_success());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.partitions.len(), 1);
        let failed = &report.failures[0].partition;
        let streamed = &report.partitions[0];
        assert_ne!(failed, &streamed.partition);
        assert_eq!(streamed.state, crate::ingester::RunState::Stopped);
        assert_eq!(s.checkpoints.position(GROUP, failed), None);
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_runs_until_cancelled() {
        let log = seeded_log();
        let s = setup(log.clone());
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let bridge = s.bridge;
        let run = tokio::spawn(async move { bridge.run(RunMode::Realtime, cancel).await });

        tokio::time::sleep(Duration::from_secs(5)).await;
        log.push_json(
            EntityType::Order.default_topic(),
            0,
            json!({"_id": "o3", "customer_id": "c2", "__op": "c", "__source_ts_ms": 60}),
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!run.is_finished());
        stopper.cancel();

        let report = run.await.unwrap().unwrap();
        assert!(report.is_success());
        assert_eq!(report.mode, RunMode::Realtime);
        assert_eq!(s.store.rows("mongo_ecom_orders").len(), 2);
        let orders = TopicPartition::new(EntityType::Order.default_topic(), 0);
        assert_eq!(s.checkpoints.position(GROUP, &orders), Some(4));
    }
}
