// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process queue for tests and local runs.
//!
//! Keeps the same lease semantics as [`super::PostgresQueue`] without the
//! expiring lease: a received message stays in flight until it is settled.
//! Every publish and settlement is recorded for inspection.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Delivery, EVENT_QUEUE_PREFIX, Queue, QueueError};

struct Entry {
    delivery: Delivery,
    published_at: Instant,
    available_at: Instant,
    in_flight: bool,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    published: Vec<(String, Value)>,
    acked: Vec<Delivery>,
    retried: Vec<(Delivery, Duration, String)>,
    dead_letters: Vec<(Delivery, String)>,
}

/// In-memory queue.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, events included, in order.
    pub async fn published(&self) -> Vec<(String, Value)> {
        self.inner.lock().await.published.clone()
    }

    /// Payloads published to `queue`.
    pub async fn published_to(&self, queue: &str) -> Vec<Value> {
        self.inner
            .lock()
            .await
            .published
            .iter()
            .filter(|(name, _)| name == queue)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Events published so far as `(event, payload)`.
    pub async fn events(&self) -> Vec<(String, Value)> {
        self.inner
            .lock()
            .await
            .published
            .iter()
            .filter_map(|(name, payload)| {
                name.strip_prefix(EVENT_QUEUE_PREFIX)
                    .map(|event| (event.to_string(), payload.clone()))
            })
            .collect()
    }

    /// Deliveries acknowledged so far.
    pub async fn acked(&self) -> Vec<Delivery> {
        self.inner.lock().await.acked.clone()
    }

    /// Deliveries released for redelivery, with delay and error text.
    pub async fn retried(&self) -> Vec<(Delivery, Duration, String)> {
        self.inner.lock().await.retried.clone()
    }

    /// Dead-lettered deliveries with their reasons.
    pub async fn dead_letters(&self) -> Vec<(Delivery, String)> {
        self.inner.lock().await.dead_letters.clone()
    }

    /// Messages not yet acked or dead-lettered, in flight or not.
    pub async fn pending(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn publish(&self, queue: &str, payload: Value) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        let mut inner = self.inner.lock().await;

        inner.published.push((queue.to_string(), payload.clone()));
        inner.entries.push(Entry {
            delivery: Delivery {
                id,
                queue: queue.to_string(),
                payload,
                attempt: 0,
            },
            published_at: Instant::now(),
            available_at: Instant::now(),
            in_flight: false,
        });

        Ok(id)
    }

    async fn receive(&self, queues: &[String], limit: usize) -> Result<Vec<Delivery>, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let mut out = Vec::new();

        for entry in inner.entries.iter_mut() {
            if out.len() >= limit {
                break;
            }
            if entry.in_flight
                || entry.available_at > now
                || !queues.iter().any(|q| *q == entry.delivery.queue)
            {
                continue;
            }
            entry.in_flight = true;
            entry.delivery.attempt += 1;
            out.push(entry.delivery.clone());
        }

        Ok(out)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let idx = position(&inner, delivery.id)?;

        let entry = inner.entries.remove(idx);
        inner.acked.push(entry.delivery);
        Ok(())
    }

    async fn retry(
        &self,
        delivery: &Delivery,
        delay: Duration,
        error: &str,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let idx = position(&inner, delivery.id)?;

        let entry = &mut inner.entries[idx];
        entry.in_flight = false;
        entry.available_at = Instant::now() + delay;
        let snapshot = entry.delivery.clone();
        inner.retried.push((snapshot, delay, error.to_string()));
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let idx = position(&inner, delivery.id)?;

        let entry = inner.entries.remove(idx);
        inner.dead_letters.push((entry.delivery, reason.to_string()));
        Ok(())
    }

    async fn purge_events(&self, max_age: Duration, limit: usize) -> Result<u64, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let mut removed = 0;

        inner.entries.retain(|entry| {
            let expired = removed < limit
                && !entry.in_flight
                && entry.delivery.queue.starts_with(EVENT_QUEUE_PREFIX)
                && now.duration_since(entry.published_at) > max_age;
            if expired {
                removed += 1;
            }
            !expired
        });

        Ok(removed as u64)
    }
}

fn position(inner: &Inner, id: Uuid) -> Result<usize, QueueError> {
    inner
        .entries
        .iter()
        .position(|e| e.delivery.id == id && e.in_flight)
        .ok_or(QueueError::UnknownDelivery(id))
}
