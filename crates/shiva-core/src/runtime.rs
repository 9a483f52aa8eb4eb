// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime.
//!
//! [`ShivaRuntime`] runs the dispatcher inside an existing tokio
//! application instead of the standalone `shiva` binary.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use shiva_core::persistence::PostgresStore;
//! use shiva_core::provider::{MockProvider, Provider};
//! use shiva_core::queue::PostgresQueue;
//! use shiva_core::runtime::ShivaRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!
//!     let runtime = ShivaRuntime::builder()
//!         .store(Arc::new(PostgresStore::new(pool.clone())))
//!         .queue(Arc::new(PostgresQueue::new(pool)))
//!         .provider(Provider::from_shared(Arc::new(MockProvider::new())))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::event_sweeper::{EventSweeper, EventSweeperConfig};
use crate::persistence::Store;
use crate::provider::Provider;
use crate::queue::Queue;
use crate::tasks::{TaskContext, TaskSettings};

/// Builder for creating a [`ShivaRuntime`].
#[derive(Default)]
pub struct ShivaRuntimeBuilder {
    store: Option<Arc<dyn Store>>,
    provider: Option<Provider>,
    queue: Option<Arc<dyn Queue>>,
    settings: TaskSettings,
    dispatcher: DispatcherConfig,
    event_sweeper: EventSweeperConfig,
}

impl std::fmt::Debug for ShivaRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShivaRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("provider", &self.provider.as_ref().map(|_| "..."))
            .field("queue", &self.queue.as_ref().map(|_| "..."))
            .field("settings", &self.settings)
            .field("dispatcher", &self.dispatcher)
            .field("event_sweeper", &self.event_sweeper)
            .finish()
    }
}

impl ShivaRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cluster/instance store (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the cloud provider adapters (required).
    pub fn provider(mut self, provider: Provider) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the job queue (required).
    pub fn queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the fleet parameters.
    pub fn settings(mut self, settings: TaskSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the dispatcher concurrency and retry policy.
    pub fn dispatcher(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher = config;
        self
    }

    /// Set the retention of outbound events.
    pub fn event_sweeper(mut self, config: EventSweeperConfig) -> Self {
        self.event_sweeper = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ShivaRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let provider = self
            .provider
            .ok_or_else(|| anyhow::anyhow!("provider is required"))?;
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue is required"))?;
        if self.dispatcher.max_workers == 0 {
            anyhow::bail!("max_workers must be at least 1");
        }

        Ok(ShivaRuntimeConfig {
            ctx: TaskContext::new(store, provider, queue, self.settings),
            dispatcher: self.dispatcher,
            event_sweeper: self.event_sweeper,
        })
    }
}

/// Configuration for a [`ShivaRuntime`].
pub struct ShivaRuntimeConfig {
    ctx: TaskContext,
    dispatcher: DispatcherConfig,
    event_sweeper: EventSweeperConfig,
}

impl std::fmt::Debug for ShivaRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShivaRuntimeConfig")
            .field("ctx", &"...")
            .field("dispatcher", &self.dispatcher)
            .field("event_sweeper", &self.event_sweeper)
            .finish()
    }
}

impl ShivaRuntimeConfig {
    /// Start the runtime, spawning the dispatcher and the event sweeper.
    pub async fn start(self) -> Result<ShivaRuntime> {
        let store = self.ctx.store.clone();

        let sweeper = EventSweeper::new(self.ctx.queue.clone(), self.event_sweeper);
        let sweeper_shutdown = sweeper.shutdown_handle();
        let sweeper_handle = tokio::spawn(async move { sweeper.run().await });

        let dispatcher = Dispatcher::new(self.ctx, self.dispatcher);
        let shutdown = dispatcher.shutdown_handle();
        let queues = dispatcher.queues().len();

        let dispatcher_handle = tokio::spawn(async move { dispatcher.run().await });

        info!(queues, "ShivaRuntime started");

        Ok(ShivaRuntime {
            dispatcher_handle,
            shutdown,
            sweeper_handle,
            sweeper_shutdown,
            store,
        })
    }
}

/// A running dispatcher that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ShivaRuntime {
    dispatcher_handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
    sweeper_handle: JoinHandle<()>,
    sweeper_shutdown: Arc<Notify>,
    store: Arc<dyn Store>,
}

impl ShivaRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ShivaRuntimeBuilder {
        ShivaRuntimeBuilder::new()
    }

    /// Get a reference to the store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Whether the store answers.
    pub async fn health_check(&self) -> bool {
        match self.store.health_check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                error!(error = %e, "Store health check failed");
                false
            }
        }
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops polling and waits for in-flight workers to finish (bounded by
    /// the dispatcher's drain timeout).
    pub async fn shutdown(self) -> Result<()> {
        info!("ShivaRuntime shutting down...");

        self.shutdown.notify_one();
        self.sweeper_shutdown.notify_one();

        if let Err(e) = self.sweeper_handle.await {
            error!("ShivaRuntime event sweeper task panicked: {}", e);
        }

        match self.dispatcher_handle.await {
            Ok(()) => {
                info!("ShivaRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("ShivaRuntime dispatcher task panicked: {}", e);
                Err(anyhow::anyhow!("dispatcher task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.dispatcher_handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteStore;
    use crate::provider::MockProvider;
    use crate::queue::MemoryQueue;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> Arc<dyn Store> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        Arc::new(SqliteStore::new(pool))
    }

    fn provider() -> Provider {
        Provider::from_shared(Arc::new(MockProvider::new()))
    }

    #[test]
    fn test_builder_default() {
        let builder = ShivaRuntimeBuilder::default();
        assert!(builder.store.is_none());
        assert!(builder.queue.is_none());
        assert_eq!(builder.dispatcher.max_workers, 16);
    }

    #[test]
    fn test_builder_debug() {
        let builder = ShivaRuntime::builder();
        let debug_str = format!("{:?}", builder);
        assert!(debug_str.contains("ShivaRuntimeBuilder"));
        assert!(debug_str.contains("dispatcher"));
    }

    #[tokio::test]
    async fn test_builder_build_missing_fields() {
        let err = ShivaRuntime::builder().build().unwrap_err();
        assert!(err.to_string().contains("store is required"));

        let err = ShivaRuntime::builder()
            .store(store().await)
            .provider(provider())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("queue is required"));
    }

    #[tokio::test]
    async fn test_builder_rejects_zero_workers() {
        let err = ShivaRuntime::builder()
            .store(store().await)
            .provider(provider())
            .queue(Arc::new(MemoryQueue::new()))
            .dispatcher(DispatcherConfig {
                max_workers: 0,
                ..DispatcherConfig::default()
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_workers"));
    }

    #[tokio::test]
    async fn test_runtime_start_and_shutdown() {
        let runtime = ShivaRuntime::builder()
            .store(store().await)
            .provider(provider())
            .queue(Arc::new(MemoryQueue::new()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        assert!(runtime.health_check().await);

        let result =
            tokio::time::timeout(std::time::Duration::from_secs(5), runtime.shutdown()).await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
