// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for expiring outbound events.
//!
//! Events such as `dock.initialized` are written to the queue under
//! `events.<name>` for consumers outside this process. A consumer takes an
//! event by leasing and acknowledging it. Events nobody took are removed
//! once they are older than `max_age`, in batches of `batch_size`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::queue::{Queue, QueueError};

/// Configuration for the event sweeper.
#[derive(Debug, Clone)]
pub struct EventSweeperConfig {
    /// Whether expired events are removed at all.
    pub enabled: bool,
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Age after which an untaken event is removed.
    pub max_age: Duration,
    /// Events removed per statement.
    pub batch_size: usize,
}

impl Default for EventSweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(3600),    // 1 hour
            max_age: Duration::from_secs(7 * 24 * 3600), // 7 days
            batch_size: 500,
        }
    }
}

/// Periodically removes expired events from the queue.
pub struct EventSweeper {
    queue: Arc<dyn Queue>,
    config: EventSweeperConfig,
    shutdown: Arc<Notify>,
}

impl EventSweeper {
    /// Create a sweeper over `queue`.
    pub fn new(queue: Arc<dyn Queue>, config: EventSweeperConfig) -> Self {
        Self {
            queue,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle used to stop [`run`](Self::run).
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Sweep every `poll_interval` until shutdown is signalled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Event sweeper disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_secs = self.config.max_age.as_secs(),
            batch_size = self.config.batch_size,
            "Event sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Event sweeper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Failed to remove expired events");
                    }
                }
            }
        }

        info!("Event sweeper stopped");
    }

    /// Remove every expired event, batch by batch. Returns the total removed.
    pub async fn sweep_once(&self) -> Result<u64, QueueError> {
        let mut total = 0u64;

        loop {
            let removed = self
                .queue
                .purge_events(self.config.max_age, self.config.batch_size)
                .await?;
            total += removed;

            if removed == 0 || removed < self.config.batch_size as u64 {
                break;
            }
            debug!(removed, total, "Removed batch of expired events");
        }

        if total > 0 {
            info!(removed = total, "Expired events removed");
        }
        Ok(total)
    }
}
