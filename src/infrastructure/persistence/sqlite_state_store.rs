use crate::domain::error::StoreError;
use crate::domain::instance::{ConsumerInstance, InstanceStatus};
use crate::domain::log::{ConsumerLog, LogStatus};
use crate::domain::repository::StateStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS consumer_instances (
        id TEXT PRIMARY KEY,
        group_id TEXT NOT NULL,
        topics TEXT NOT NULL,
        topic_name TEXT,
        status TEXT NOT NULL,
        should_stop INTEGER NOT NULL DEFAULT 0,
        pid INTEGER NOT NULL DEFAULT 0,
        last_heartbeat TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_consumer_instances_group ON consumer_instances (group_id)",
    "CREATE TABLE IF NOT EXISTS consumer_logs (
        id TEXT PRIMARY KEY,
        consumer_id TEXT NOT NULL,
        group_id TEXT NOT NULL,
        original_log_id TEXT NOT NULL,
        topic TEXT NOT NULL,
        partition_id INTEGER NOT NULL,
        message_offset TEXT NOT NULL,
        data TEXT NOT NULL,
        status TEXT NOT NULL,
        received_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_consumer_logs_consumer ON consumer_logs (consumer_id, received_at)",
];

const INSTANCE_COLUMNS: &str = "id, group_id, topics, status, should_stop, pid, last_heartbeat, is_deleted, created_at, updated_at";

const LOG_COLUMNS: &str = "id, consumer_id, group_id, original_log_id, topic, partition_id, message_offset, data, status, received_at";

pub struct SqliteStateStore {
    pool: Pool<Sqlite>,
}

impl SqliteStateStore {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database. A single pooled connection keeps it alive.
    pub async fn new_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &Pool<Sqlite>) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(pool).await?;
        }
        Ok(())
    }

    fn row_to_instance(row: &SqliteRow) -> Result<ConsumerInstance, StoreError> {
        let id: String = row.try_get(0)?;
        let topics: String = row.try_get(2)?;
        let status: String = row.try_get(3)?;
        let pid: i64 = row.try_get(5)?;

        let status = InstanceStatus::from_str(&status).map_err(|reason| StoreError::CorruptRow {
            id: id.clone(),
            reason,
        })?;

        Ok(ConsumerInstance {
            group_id: row.try_get(1)?,
            topics: ConsumerInstance::split_topics(&topics),
            status,
            should_stop: row.try_get(4)?,
            pid: u32::try_from(pid).unwrap_or_default(),
            last_heartbeat: row.try_get(6)?,
            is_deleted: row.try_get(7)?,
            created_at: row.try_get(8)?,
            updated_at: row.try_get(9)?,
            id,
        })
    }

    fn row_to_log(row: &SqliteRow) -> Result<ConsumerLog, StoreError> {
        let raw_id: String = row.try_get(0)?;
        let status: String = row.try_get(8)?;

        let id = Uuid::parse_str(&raw_id).map_err(|e| StoreError::CorruptRow {
            id: raw_id.clone(),
            reason: e.to_string(),
        })?;
        let status = LogStatus::from_str(&status).map_err(|reason| StoreError::CorruptRow {
            id: raw_id.clone(),
            reason,
        })?;

        Ok(ConsumerLog {
            id,
            consumer_id: row.try_get(1)?,
            group_id: row.try_get(2)?,
            original_log_id: row.try_get(3)?,
            topic: row.try_get(4)?,
            partition: row.try_get(5)?,
            offset: row.try_get(6)?,
            data: row.try_get(7)?,
            status,
            received_at: row.try_get(9)?,
        })
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn find_instance(&self, id: &str) -> Result<Option<ConsumerInstance>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM consumer_instances WHERE id = ?",
            INSTANCE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_instance).transpose()
    }

    async fn upsert_instance(&self, instance: &ConsumerInstance) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO consumer_instances (id, group_id, topics, topic_name, status, should_stop, pid, last_heartbeat, is_deleted, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                group_id = excluded.group_id,
                topics = excluded.topics,
                topic_name = excluded.topic_name,
                status = excluded.status,
                should_stop = excluded.should_stop,
                pid = excluded.pid,
                last_heartbeat = excluded.last_heartbeat,
                is_deleted = excluded.is_deleted,
                updated_at = excluded.updated_at",
        )
        .bind(&instance.id)
        .bind(&instance.group_id)
        .bind(instance.topics_joined())
        .bind(instance.primary_topic())
        .bind(instance.status.as_str())
        .bind(instance.should_stop)
        .bind(i64::from(instance.pid))
        .bind(instance.last_heartbeat)
        .bind(instance.is_deleted)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_log(&self, log: &ConsumerLog) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO consumer_logs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            LOG_COLUMNS
        ))
        .bind(log.id.to_string())
        .bind(&log.consumer_id)
        .bind(&log.group_id)
        .bind(&log.original_log_id)
        .bind(&log.topic)
        .bind(log.partition)
        .bind(&log.offset)
        .bind(&log.data)
        .bind(log.status.as_str())
        .bind(log.received_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_instances(&self, group_id: &str) -> Result<Vec<ConsumerInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM consumer_instances WHERE group_id = ? AND is_deleted = 0 ORDER BY id",
            INSTANCE_COLUMNS
        ))
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_instance).collect()
    }

    async fn list_logs(&self, consumer_id: &str, limit: u32) -> Result<Vec<ConsumerLog>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM consumer_logs WHERE consumer_id = ? ORDER BY rowid DESC LIMIT ?",
            LOG_COLUMNS
        ))
        .bind(consumer_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_log).collect()
    }

    async fn touch_heartbeats(&self, ids: &[String], at: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut touched = 0;
        for id in ids {
            touched += sqlx::query("UPDATE consumer_instances SET last_heartbeat = ? WHERE id = ?")
                .bind(at)
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(touched)
    }

    async fn deactivate_stale_instances(&self, at: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE consumer_instances SET status = ?, updated_at = ? WHERE status = ? AND is_deleted = 0",
        )
        .bind(InstanceStatus::Inactive.as_str())
        .bind(at)
        .bind(InstanceStatus::Active.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
