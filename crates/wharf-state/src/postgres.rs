//! PostgreSQL queue backend.
//!
//! All queues share one table; each row is a message tagged with its queue
//! name. Dead-letter queues are ordinary queue names in the same table, so a
//! message moved there survives restarts like any other.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use crate::error::QueueError;
use crate::traits::QueueBackend;
use crate::types::{Message, MessageId};

/// Queue backend that claims rows with `FOR UPDATE SKIP LOCKED`.
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    table: String,
}

impl PostgresQueue {
    /// Connect and create the queue table if it does not exist.
    pub async fn new(url: &str, table: String) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Self::from_pool(pool, table).await
    }

    pub async fn from_pool(pool: PgPool, table: String) -> Result<Self, QueueError> {
        if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(QueueError::Backend(format!("invalid queue table name: {table}")));
        }

        let queue = Self { pool, table };
        queue.ensure_table().await?;
        Ok(queue)
    }

    async fn ensure_table(&self) -> Result<(), QueueError> {
        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                queue_name TEXT NOT NULL,
                payload BYTEA NOT NULL,
                attempt INT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                visible_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.table
        );

        sqlx::query(&create_table)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        let create_index = format!(
            r#"
            CREATE INDEX IF NOT EXISTS idx_{table}_poll
            ON {table} (queue_name, visible_at, id)
            "#,
            table = self.table
        );

        sqlx::query(&create_index)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        Ok(())
    }

    fn parse_id(message_id: &MessageId) -> Result<i64, QueueError> {
        message_id
            .as_str()
            .parse()
            .map_err(|_| QueueError::MessageNotFound(message_id.to_string()))
    }
}

#[async_trait]
impl QueueBackend for PostgresQueue {
    async fn publish(&self, queue: &str, message: &[u8]) -> Result<MessageId, QueueError> {
        let query = format!(
            "INSERT INTO {} (queue_name, payload) VALUES ($1, $2) RETURNING id",
            self.table
        );

        let row = sqlx::query(&query)
            .bind(queue)
            .bind(message)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        let id: i64 = row.get("id");
        Ok(MessageId::new(id.to_string()))
    }

    async fn receive(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Message>, QueueError> {
        let query = format!(
            r#"
            UPDATE {table}
            SET
                visible_at = NOW() + make_interval(secs => $2),
                attempt = attempt + 1
            WHERE id = (
                SELECT id FROM {table}
                WHERE queue_name = $1 AND visible_at <= NOW()
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, attempt, created_at
            "#,
            table = self.table
        );

        let row = sqlx::query(&query)
            .bind(queue)
            .bind(visibility_timeout.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        Ok(row.map(|row| {
            let id: i64 = row.get("id");
            let attempt: i32 = row.get("attempt");
            let created_at: chrono::DateTime<chrono::Utc> = row.get("created_at");

            Message {
                id: MessageId::new(id.to_string()),
                payload: row.get("payload"),
                attempt: u32::try_from(attempt).unwrap_or_default(),
                enqueued_at: SystemTime::from(created_at),
            }
        }))
    }

    async fn ack(&self, queue: &str, message_id: &MessageId) -> Result<(), QueueError> {
        let id = Self::parse_id(message_id)?;
        let query = format!(
            "DELETE FROM {} WHERE id = $1 AND queue_name = $2",
            self.table
        );

        let result = sqlx::query(&query)
            .bind(id)
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::MessageNotFound(message_id.to_string()));
        }
        Ok(())
    }

    async fn extend(
        &self,
        queue: &str,
        message_id: &MessageId,
        visibility_timeout: Duration,
    ) -> Result<(), QueueError> {
        let id = Self::parse_id(message_id)?;
        let query = format!(
            "UPDATE {} SET visible_at = NOW() + make_interval(secs => $3) \
             WHERE id = $1 AND queue_name = $2",
            self.table
        );

        let result = sqlx::query(&query)
            .bind(id)
            .bind(queue)
            .bind(visibility_timeout.as_secs_f64())
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::MessageNotFound(message_id.to_string()));
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<usize, QueueError> {
        let query = format!(
            "SELECT COUNT(*) AS depth FROM {} WHERE queue_name = $1",
            self.table
        );

        let row = sqlx::query(&query)
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        let depth: i64 = row.get("depth");
        Ok(usize::try_from(depth).unwrap_or_default())
    }
}

impl std::fmt::Debug for PostgresQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresQueue")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}
