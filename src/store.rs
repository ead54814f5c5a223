//! Destination store: append-only ClickHouse tables
use std::future::Future;

use clickhouse_rs::{types::Value, Block, Pool};
use tracing::info;

use crate::error::WriteError;
use crate::event::{DestinationRow, EntityType};

/// ClickHouse row - vector of columns, each column is tuple of its name and value
pub type Row = Vec<(String, Value)>;

/// Append-capable table store.
/// Inserts from different partition workers may run concurrently.
pub trait Destination: Send + Sync {
    /// Creates the entity table if it is missing
    fn ensure_table(
        &self,
        entity: EntityType,
        table: &str,
    ) -> impl Future<Output = Result<(), WriteError>> + Send;

    /// Appends rows in order as one bulk insert
    fn insert(
        &self,
        table: &str,
        rows: &[DestinationRow],
    ) -> impl Future<Output = Result<(), WriteError>> + Send;

    fn truncate(&self, table: &str) -> impl Future<Output = Result<(), WriteError>> + Send;

    fn count(&self, table: &str) -> impl Future<Output = Result<u64, WriteError>> + Send;
}

/// Converts a destination row into ClickHouse columns
pub fn to_row(row: &DestinationRow) -> Row {
    vec![
        (
            String::from(row.entity.id_column()),
            Value::from(row.natural_id.clone()),
        ),
        (String::from("raw_data"), Value::from(row.raw_data.clone())),
        (
            String::from("_operation"),
            Value::from(String::from(row.operation.code())),
        ),
        (
            String::from("_event_timestamp_ms"),
            Value::from(row.event_timestamp_ms),
        ),
        (String::from("_extracted_at"), Value::from(row.extracted_at)),
        (
            String::from("_kafka_partition"),
            Value::from(row.partition.max(0) as u32),
        ),
        (
            String::from("_kafka_offset"),
            Value::from(row.offset.max(0) as u64),
        ),
    ]
}

pub fn create_table_sql(entity: EntityType, table: &str) -> String {
    let id = entity.id_column();
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            {id} String,
            raw_data String,
            _operation String,
            _event_timestamp_ms Int64,
            _extracted_at DateTime,
            _kafka_partition UInt32,
            _kafka_offset UInt64
        ) ENGINE = MergeTree()
        ORDER BY ({id}, _event_timestamp_ms)"
    )
}

pub struct ClickHouseStore {
    pool: Pool,
}

impl ClickHouseStore {
    pub fn new(url: &str) -> ClickHouseStore {
        ClickHouseStore {
            pool: Pool::new(url),
        }
    }

    pub async fn ping(&self) -> Result<(), WriteError> {
        let mut ch = self.pool.get_handle().await?;
        ch.ping().await?;
        Ok(())
    }
}

impl Destination for ClickHouseStore {
    async fn ensure_table(&self, entity: EntityType, table: &str) -> Result<(), WriteError> {
        let mut ch = self.pool.get_handle().await?;
        ch.execute(create_table_sql(entity, table)).await?;
        info!(table, %entity, "table created/verified");
        Ok(())
    }

    async fn insert(&self, table: &str, rows: &[DestinationRow]) -> Result<(), WriteError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut ch = self.pool.get_handle().await?;
        let mut block = Block::with_capacity(rows.len());
        for row in rows {
            block.push(to_row(row))?;
        }
        ch.insert(table, block).await?;
        Ok(())
    }

    async fn truncate(&self, table: &str) -> Result<(), WriteError> {
        let mut ch = self.pool.get_handle().await?;
        ch.execute(format!("TRUNCATE TABLE IF EXISTS {table}")).await?;
        info!(table, "table truncated");
        Ok(())
    }

    async fn count(&self, table: &str) -> Result<u64, WriteError> {
        let mut ch = self.pool.get_handle().await?;
        let block = ch
            .query(format!("SELECT count() AS c FROM {table}"))
            .fetch_all()
            .await?;
        Ok(block.get(0, "c")?)
    }
}
