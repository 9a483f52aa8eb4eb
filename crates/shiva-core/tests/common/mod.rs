// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for shiva-core integration tests.
//!
//! Provides TestContext wiring an in-memory SQLite store, the mock provider
//! and the in-memory queue into a task context and a dispatcher.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use shiva_core::dispatcher::{Dispatcher, DispatcherConfig, Disposition};
use shiva_core::jobs::JobKind;
use shiva_core::lifecycle::{self, Provisioned};
use shiva_core::persistence::{ClusterRecord, InstanceRole, NewInstance, SqliteStore, Store};
use shiva_core::provider::{
    InstanceStatus, MockProvider, Provider, ProviderInstance, TAG_ORG, TAG_ROLE, Tag,
};
use shiva_core::queue::{Delivery, MemoryQueue, Queue, QueueError};
use shiva_core::tasks::{self, TaskContext, TaskError, TaskOutcome, TaskSettings};

/// Test context with every backend in memory.
pub struct TestContext {
    pub store: Arc<SqliteStore>,
    pub provider: Arc<MockProvider>,
    pub queue: Arc<MemoryQueue>,
    pub tasks: TaskContext,
}

impl TestContext {
    /// Create a context with default settings.
    pub async fn new() -> Self {
        Self::with_settings(TaskSettings::default()).await
    }

    /// Create a context with custom task settings.
    pub async fn with_settings(settings: TaskSettings) -> Self {
        // 1. In-memory store; one connection so every query sees the same database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        shiva_core::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        let store = Arc::new(SqliteStore::new(pool));

        // 2. Provider and queue
        let provider = Arc::new(MockProvider::new());
        let queue = Arc::new(MemoryQueue::new());

        let tasks = TaskContext::new(
            store.clone(),
            Provider::from_shared(provider.clone()),
            queue.clone(),
            settings,
        );

        Self {
            store,
            provider,
            queue,
            tasks,
        }
    }

    /// Run the handler for `kind` on a fresh delivery of `payload`.
    pub async fn run(&self, kind: JobKind, payload: Value) -> Result<TaskOutcome, TaskError> {
        tasks::execute(&self.tasks, &delivery(kind.queue_name(), payload)).await
    }

    /// Dispatcher over this context.
    pub fn dispatcher(&self, config: DispatcherConfig) -> Dispatcher {
        Dispatcher::new(self.tasks.clone(), config)
    }

    /// Process queued jobs one at a time until none is available.
    /// Returns the dispositions in processing order.
    pub async fn drain(&self, dispatcher: &Dispatcher) -> Vec<(String, Disposition)> {
        let mut out = Vec::new();
        loop {
            let batch = self
                .queue
                .receive(dispatcher.queues(), 1)
                .await
                .expect("memory queue receive");
            let Some(delivery) = batch.into_iter().next() else {
                break;
            };
            let disposition = dispatcher.process(&delivery).await;
            out.push((delivery.queue.clone(), disposition));
        }
        out
    }

    /// Insert an Active cluster for `github_id`.
    pub async fn seed_cluster(&self, github_id: &str) -> ClusterRecord {
        match lifecycle::provision_cluster(self.store.as_ref(), github_id)
            .await
            .expect("Failed to insert cluster")
        {
            Provisioned::Created(record) => record,
            Provisioned::Raced => panic!("cluster for {} already exists", github_id),
        }
    }

    /// Create a running dock at the provider and record it in the store.
    pub async fn seed_instance(&self, cluster: &ClusterRecord, id: &str, ip: &str) {
        self.provider
            .add_instance(provider_instance(id, ip, &cluster.github_id, Utc::now()))
            .await;
        self.store
            .insert_instance(&NewInstance {
                id: id.to_string(),
                cluster_id: cluster.id.clone(),
                role: InstanceRole::Dock,
                aws_image_id: Some("ami-mock".to_string()),
                aws_instance_type: Some("t2.medium".to_string()),
                aws_private_ip_address: Some(ip.to_string()),
            })
            .await
            .expect("Failed to insert instance");
    }

    /// Task context over the same store and provider but another queue.
    pub fn tasks_with_queue(&self, queue: Arc<dyn Queue>) -> TaskContext {
        TaskContext::new(
            self.store.clone(),
            Provider::from_shared(self.provider.clone()),
            queue,
            (*self.tasks.settings).clone(),
        )
    }

    /// Payloads published to the canonical queue of `kind`.
    pub async fn published(&self, kind: JobKind) -> Vec<Value> {
        self.queue.published_to(kind.queue_name()).await
    }
}

/// A first delivery of `payload` on `queue`.
pub fn delivery(queue: &str, payload: Value) -> Delivery {
    Delivery {
        id: Uuid::new_v4(),
        queue: queue.to_string(),
        payload,
        attempt: 1,
    }
}

/// A running dock as the provider reports it.
pub fn provider_instance(
    id: &str,
    ip: &str,
    org: &str,
    launch_time: DateTime<Utc>,
) -> ProviderInstance {
    ProviderInstance {
        instance_id: id.to_string(),
        image_id: Some("ami-mock".to_string()),
        instance_type: Some("t2.medium".to_string()),
        private_ip_address: Some(ip.to_string()),
        state: InstanceStatus::Running,
        launch_time: Some(launch_time),
        tags: vec![
            Tag::new(TAG_ORG, org),
            Tag::new(TAG_ROLE, InstanceRole::Dock.as_str()),
        ],
    }
}

/// Operation names of the mock provider's call log, in order.
pub async fn operations(provider: &MockProvider) -> Vec<&'static str> {
    provider.calls().await.into_iter().map(|c| c.operation).collect()
}

/// Memory queue whose n-th publish (1-based) fails once.
pub struct FlakyQueue {
    inner: Arc<MemoryQueue>,
    fail_on: usize,
    publishes: AtomicUsize,
}

impl FlakyQueue {
    pub fn new(inner: Arc<MemoryQueue>, fail_on: usize) -> Self {
        Self {
            inner,
            fail_on,
            publishes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Queue for FlakyQueue {
    async fn publish(&self, queue: &str, payload: Value) -> Result<Uuid, QueueError> {
        let n = self.publishes.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on {
            return Err(QueueError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.publish(queue, payload).await
    }

    async fn receive(&self, queues: &[String], limit: usize) -> Result<Vec<Delivery>, QueueError> {
        self.inner.receive(queues, limit).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.inner.ack(delivery).await
    }

    async fn retry(
        &self,
        delivery: &Delivery,
        delay: Duration,
        error: &str,
    ) -> Result<(), QueueError> {
        self.inner.retry(delivery, delay, error).await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        self.inner.dead_letter(delivery, reason).await
    }

    async fn purge_events(&self, max_age: Duration, limit: usize) -> Result<u64, QueueError> {
        self.inner.purge_events(max_age, limit).await
    }
}

/// Skip the test if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
