// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed queue.
//!
//! Messages live in `queue_jobs`. Workers claim rows with
//! `FOR UPDATE SKIP LOCKED` and hold them through `locked_until`; acked rows
//! are deleted, dead-lettered rows stay with `dead_lettered_at` set.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use super::{Delivery, EVENT_QUEUE_PREFIX, Queue, QueueError};

/// Default lease; longer than any provider wait a handler performs.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(600);

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    id: Uuid,
    queue: String,
    payload: Value,
    attempt: i32,
}

impl From<ClaimedRow> for Delivery {
    fn from(row: ClaimedRow) -> Self {
        Self {
            id: row.id,
            queue: row.queue,
            payload: row.payload,
            attempt: u32::try_from(row.attempt).unwrap_or(0),
        }
    }
}

/// PostgreSQL-backed queue.
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    lease: Duration,
}

impl PostgresQueue {
    /// Create a queue over an existing, migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lease: DEFAULT_LEASE,
        }
    }

    /// Override the visibility lease.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Number of dead-lettered messages on `queue`.
    pub async fn dead_letter_count(&self, queue: &str) -> Result<i64, QueueError> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM queue_jobs WHERE queue = $1 AND dead_lettered_at IS NOT NULL",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0)
    }
}

#[async_trait]
impl Queue for PostgresQueue {
    async fn publish(&self, queue: &str, payload: Value) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO queue_jobs (id, queue, payload, attempt, available_at, created_at)
            VALUES ($1, $2, $3, 0, NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(queue)
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        debug!(queue = %queue, message_id = %id, "Message published");
        Ok(id)
    }

    async fn receive(&self, queues: &[String], limit: usize) -> Result<Vec<Delivery>, QueueError> {
        if queues.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, ClaimedRow>(
            r#"
            WITH claimed AS (
                SELECT id
                FROM queue_jobs
                WHERE queue = ANY($1)
                  AND dead_lettered_at IS NULL
                  AND available_at <= NOW()
                  AND (locked_until IS NULL OR locked_until < NOW())
                ORDER BY available_at ASC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_jobs q
            SET attempt = q.attempt + 1,
                locked_until = NOW() + make_interval(secs => $3)
            FROM claimed
            WHERE q.id = claimed.id
            RETURNING q.id, q.queue, q.payload, q.attempt
            "#,
        )
        .bind(queues)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(self.lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Delivery::from).collect())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
            .bind(delivery.id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(delivery.id));
        }
        Ok(())
    }

    async fn retry(
        &self,
        delivery: &Delivery,
        delay: Duration,
        error: &str,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET available_at = NOW() + make_interval(secs => $2),
                locked_until = NULL,
                last_error = $3
            WHERE id = $1 AND dead_lettered_at IS NULL
            "#,
        )
        .bind(delivery.id)
        .bind(delay.as_secs_f64())
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(delivery.id));
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET dead_lettered_at = NOW(),
                locked_until = NULL,
                last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(delivery.id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(delivery.id));
        }
        Ok(())
    }

    async fn purge_events(&self, max_age: Duration, limit: usize) -> Result<u64, QueueError> {
        if limit == 0 {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE id IN (
                SELECT id
                FROM queue_jobs
                WHERE queue LIKE $1
                  AND created_at < NOW() - make_interval(secs => $2)
                  AND (locked_until IS NULL OR locked_until < NOW())
                ORDER BY created_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(format!("{}%", EVENT_QUEUE_PREFIX))
        .bind(max_age.as_secs_f64())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
