// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue boundary.
//!
//! Named queues with at-least-once delivery. A [`Delivery`] is leased to one
//! worker until it is acknowledged, rescheduled or dead-lettered; a lease
//! that expires makes it deliverable again. Publishing is a plain append.
//!
//! Events (e.g. `dock.initialized`) are published for external consumers
//! under [`event_queue`] names, which the dispatcher never subscribes to.
//! A consumer takes an event by leasing and acknowledging it like any other
//! message. Events nobody takes are removed by
//! [`crate::event_sweeper::EventSweeper`] once they exceed the retention age.

pub mod memory;
pub mod postgres;

pub use memory::MemoryQueue;
pub use postgres::PostgresQueue;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Prefix of queues carrying outbound events.
pub const EVENT_QUEUE_PREFIX: &str = "events.";

/// Queue name an event is published under.
pub fn event_queue(event: &str) -> String {
    format!("{}{}", EVENT_QUEUE_PREFIX, event)
}

/// Errors from queue operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// The backing database failed.
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The delivery is not leased (already settled or never received).
    #[error("unknown delivery: {0}")]
    UnknownDelivery(Uuid),
}

/// One leased message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Message id; stable across redeliveries.
    pub id: Uuid,
    /// Queue the message was published to.
    pub queue: String,
    /// Message body.
    pub payload: Value,
    /// Delivery count, starting at 1.
    pub attempt: u32,
}

/// Queue operations used by the dispatcher and the task handlers.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Append a message to `queue`.
    async fn publish(&self, queue: &str, payload: Value) -> Result<Uuid, QueueError>;

    /// Publish an event for external consumers.
    async fn publish_event(&self, event: &str, payload: Value) -> Result<Uuid, QueueError> {
        self.publish(&event_queue(event), payload).await
    }

    /// Lease up to `limit` available messages from any of `queues`.
    async fn receive(&self, queues: &[String], limit: usize) -> Result<Vec<Delivery>, QueueError>;

    /// Settle a delivery as done.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Release a delivery for redelivery after `delay`.
    async fn retry(
        &self,
        delivery: &Delivery,
        delay: Duration,
        error: &str,
    ) -> Result<(), QueueError>;

    /// Park a delivery permanently.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;

    /// Remove up to `limit` event messages published more than `max_age`
    /// ago. Leased events are left alone. Returns the number removed.
    async fn purge_events(&self, max_age: Duration, limit: usize) -> Result<u64, QueueError>;
}
