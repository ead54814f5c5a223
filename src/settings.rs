//! Application config
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::bridge::TopicRoute;
use crate::event::EntityType;
use crate::ingester::IngesterSettings;
use crate::writer::RetryPolicy;

/// Kafka connection
#[derive(Debug, Deserialize)]
pub struct Kafka {
    /// bootstrap brokers, comma separated
    pub brokers: String,
    /// consumer group to use (default: clickhouse-bridge-group)
    pub consumer_group: Option<String>,
    /// consumer session timeout (default: 6000)
    pub session_timeout_ms: Option<u64>,
}

/// ClickHouse connection
#[derive(Debug, Deserialize)]
pub struct ClickHouse {
    /// URL of ClickHouse, e.g. tcp://localhost:9000
    pub url: String,
}

/// Batching and pacing of the bridge
#[derive(Debug, Default, Deserialize)]
pub struct Bridge {
    /// name of decoder to use (default: flattened)
    pub decoder: Option<String>,
    /// max ClickHouse insert batch size (default: 100)
    pub batch_size: Option<usize>,
    /// flush a non-empty batch at least this often (default: 5s)
    pub flush_interval_seconds: Option<u64>,
    /// how long a single poll waits for a message (default: 1000ms)
    pub poll_timeout_ms: Option<u64>,
    /// batch and reset runs stop after a partition was idle this long (default: 10s)
    pub idle_timeout_seconds: Option<u64>,
    /// realtime progress log interval (default: 30s)
    pub stats_interval_seconds: Option<u64>,
    /// cap on messages per partition in batch and reset runs
    pub max_messages: Option<u64>,
    /// insert and commit attempts before a partition gives up (default: 5)
    pub retry_attempts: Option<u32>,
    /// first retry delay, doubled per attempt (default: 500ms)
    pub retry_initial_backoff_ms: Option<u64>,
    /// retry delay ceiling (default: 30000ms)
    pub retry_max_backoff_ms: Option<u64>,
    /// Decoder-specific configuration
    pub custom: Option<toml::Value>,
}

/// Topic to ingest
#[derive(Debug, Deserialize)]
pub struct Topic {
    pub name: String,
    pub entity: EntityType,
    /// ClickHouse table to ingest into (default: per entity)
    pub table: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub kafka: Kafka,
    pub clickhouse: ClickHouse,
    #[serde(default)]
    pub bridge: Bridge,
    /// topics to ingest (default: customers, products and orders of the ecom database)
    #[serde(default)]
    pub topics: Vec<Topic>,
}

impl Settings {
    pub fn new(cfgfile: &str) -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(cfgfile).required(true))
            .add_source(Environment::with_prefix("CDC_BRIDGE").separator("__"))
            .build()?;
        Settings::from_config(cfg)
    }

    pub fn from_config(cfg: Config) -> Result<Self, ConfigError> {
        let mut settings: Settings = cfg.try_deserialize()?;

        let kafka = &mut settings.kafka;
        kafka
            .consumer_group
            .get_or_insert_with(|| String::from("clickhouse-bridge-group"));
        kafka.session_timeout_ms.get_or_insert(6000);

        let b = &mut settings.bridge;
        b.decoder.get_or_insert_with(|| String::from("flattened"));
        b.batch_size.get_or_insert(100);
        b.flush_interval_seconds.get_or_insert(5);
        b.poll_timeout_ms.get_or_insert(1000);
        b.idle_timeout_seconds.get_or_insert(10);
        b.stats_interval_seconds.get_or_insert(30);
        b.retry_attempts.get_or_insert(5);
        b.retry_initial_backoff_ms.get_or_insert(500);
        b.retry_max_backoff_ms.get_or_insert(30_000);

        if settings.topics.is_empty() {
            settings.topics = EntityType::ALL
                .iter()
                .map(|e| Topic {
                    name: e.default_topic().to_string(),
                    entity: *e,
                    table: None,
                })
                .collect();
        }
        for (i, topic) in settings.topics.iter().enumerate() {
            let duplicate = settings.topics[..i]
                .iter()
                .any(|t| t.entity == topic.entity || t.name == topic.name);
            if duplicate {
                return Err(ConfigError::Message(format!(
                    "topic {} ({}) is configured twice; one topic per entity",
                    topic.name, topic.entity
                )));
            }
        }
        Ok(settings)
    }

    pub fn consumer_group(&self) -> &str {
        self.kafka
            .consumer_group
            .as_deref()
            .unwrap_or("clickhouse-bridge-group")
    }

    pub fn decoder(&self) -> &str {
        self.bridge.decoder.as_deref().unwrap_or("flattened")
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.topics.iter().map(|t| t.name.clone()).collect()
    }

    pub fn routes(&self) -> Vec<TopicRoute> {
        self.topics
            .iter()
            .map(|t| TopicRoute {
                topic: t.name.clone(),
                entity: t.entity,
                table: t
                    .table
                    .clone()
                    .unwrap_or_else(|| t.entity.default_table().to_string()),
            })
            .collect()
    }

    pub fn ingester_settings(&self) -> IngesterSettings {
        let b = &self.bridge;
        IngesterSettings {
            group: self.consumer_group().to_string(),
            batch_size: b.batch_size.unwrap_or(100),
            flush_interval: Duration::from_secs(b.flush_interval_seconds.unwrap_or(5)),
            poll_timeout: Duration::from_millis(b.poll_timeout_ms.unwrap_or(1000)),
            idle_timeout: Duration::from_secs(b.idle_timeout_seconds.unwrap_or(10)),
            stats_interval: Duration::from_secs(b.stats_interval_seconds.unwrap_or(30)),
            max_messages: b.max_messages,
            retry: RetryPolicy {
                attempts: b.retry_attempts.unwrap_or(5),
                initial_backoff: Duration::from_millis(b.retry_initial_backoff_ms.unwrap_or(500)),
                max_backoff: Duration::from_millis(b.retry_max_backoff_ms.unwrap_or(30_000)),
            },
        }
    }
}
