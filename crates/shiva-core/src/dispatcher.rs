// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue dispatcher.
//!
//! Polls every bound queue, runs one worker task per delivery (bounded by
//! `max_workers`) and settles each delivery from the handler result:
//!
//! | Result | Disposition |
//! |--------|-------------|
//! | `Ok(_)` | ack |
//! | retryable error, attempts left | retry after `retry_delay * attempt` (capped) |
//! | retryable error, attempts exhausted | dead letter |
//! | fatal error | drop (ack and log) |
//!
//! The dispatcher holds no business state. Workers share the
//! [`TaskContext`] handles only.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::jobs::JobKind;
use crate::queue::{Delivery, QueueError};
use crate::tasks::{self, TaskContext, TaskError, TaskOutcome};

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Deliveries processed concurrently.
    pub max_workers: usize,
    /// Pause between polls when nothing was received.
    pub poll_interval: Duration,
    /// Deliveries of one message before it is dead-lettered.
    pub max_attempts: u32,
    /// Base redelivery delay, multiplied by the attempt number.
    pub retry_delay: Duration,
    /// Upper bound for the redelivery delay.
    pub max_retry_delay: Duration,
    /// How long shutdown waits for in-flight workers.
    pub drain_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            poll_interval: Duration::from_millis(500),
            max_attempts: 10,
            retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// What happens to a delivery after its handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove it from the queue.
    Ack,
    /// Redeliver it after the delay.
    Retry(Duration),
    /// Park it; retries are exhausted.
    DeadLetter,
    /// Remove it without retrying; the failure is permanent.
    Drop,
}

impl DispatcherConfig {
    /// Settle policy for a handler result on delivery number `attempt`.
    pub fn disposition(
        &self,
        result: &Result<TaskOutcome, TaskError>,
        attempt: u32,
    ) -> Disposition {
        match result {
            Ok(_) => Disposition::Ack,
            Err(e) if !e.is_retryable() => Disposition::Drop,
            Err(_) if attempt >= self.max_attempts => Disposition::DeadLetter,
            Err(_) => Disposition::Retry(
                self.retry_delay
                    .saturating_mul(attempt.max(1))
                    .min(self.max_retry_delay),
            ),
        }
    }
}

/// Polls the queue and runs handlers.
pub struct Dispatcher {
    ctx: TaskContext,
    config: DispatcherConfig,
    queues: Vec<String>,
    workers: Arc<Semaphore>,
    shutdown: Arc<Notify>,
}

impl Dispatcher {
    /// Create a dispatcher bound to every job queue and alias.
    pub fn new(ctx: TaskContext, config: DispatcherConfig) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers));
        Self {
            ctx,
            config,
            queues: Self::bound_queues(),
            workers,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Every queue name the dispatcher consumes.
    pub fn bound_queues() -> Vec<String> {
        JobKind::ALL
            .iter()
            .flat_map(|kind| kind.queue_names())
            .map(String::from)
            .collect()
    }

    /// Queues this dispatcher polls.
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Handle used to stop [`run`](Self::run). Signal it with `notify_one`.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Workers currently running.
    pub fn in_flight(&self) -> usize {
        self.config.max_workers - self.workers.available_permits()
    }

    /// Settle policy for a handler result on delivery number `attempt`.
    pub fn disposition(
        &self,
        result: &Result<TaskOutcome, TaskError>,
        attempt: u32,
    ) -> Disposition {
        self.config.disposition(result, attempt)
    }

    /// Poll until shutdown is signalled, then wait for in-flight workers.
    pub async fn run(&self) {
        info!(
            queues = self.queues.len(),
            max_workers = self.config.max_workers,
            "Dispatcher started"
        );

        loop {
            let received = match self.poll_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "Failed to receive deliveries");
                    0
                }
            };
            let pause = if received > 0 {
                Duration::ZERO
            } else {
                self.config.poll_interval
            };

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Dispatcher received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(pause) => {}
            }
        }

        self.drain().await;
        info!("Dispatcher stopped");
    }

    /// Receive as many deliveries as there are free workers and spawn one
    /// worker per delivery. Returns the number received.
    pub async fn poll_once(&self) -> Result<usize, QueueError> {
        let free = self.workers.available_permits();
        if free == 0 {
            return Ok(0);
        }

        let deliveries = self.ctx.queue.receive(&self.queues, free).await?;
        let received = deliveries.len();

        for delivery in deliveries {
            // Unsettled deliveries come back when their lease expires.
            let Ok(permit) = self.workers.clone().acquire_owned().await else {
                break;
            };
            let ctx = self.ctx.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                process(&ctx, &config, &delivery).await;
                drop(permit);
            });
        }

        Ok(received)
    }

    /// Run one delivery to completion on the current task.
    pub async fn process(&self, delivery: &Delivery) -> Disposition {
        process(&self.ctx, &self.config, delivery).await
    }

    async fn drain(&self) {
        let total = u32::try_from(self.config.max_workers).unwrap_or(u32::MAX);

        match tokio::time::timeout(self.config.drain_timeout, self.workers.acquire_many(total))
            .await
        {
            Ok(_) => debug!("All workers finished"),
            Err(_) => warn!(
                in_flight = self.in_flight(),
                "Workers still running after drain timeout"
            ),
        }
    }
}

async fn process(ctx: &TaskContext, config: &DispatcherConfig, delivery: &Delivery) -> Disposition {
    let result = tasks::execute(ctx, delivery).await;
    let disposition = config.disposition(&result, delivery.attempt);
    let queue = ctx.queue.as_ref();

    let settled = match (&result, disposition) {
        (Ok(TaskOutcome::Completed), _) => {
            debug!(queue = %delivery.queue, delivery_id = %delivery.id, "Job completed");
            queue.ack(delivery).await
        }
        (Ok(TaskOutcome::AlreadySatisfied(reason)), _) => {
            info!(
                queue = %delivery.queue,
                delivery_id = %delivery.id,
                reason = %reason,
                "Job already satisfied"
            );
            queue.ack(delivery).await
        }
        (Err(e), Disposition::Retry(delay)) => {
            info!(
                queue = %delivery.queue,
                delivery_id = %delivery.id,
                attempt = delivery.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "Job failed, retrying"
            );
            queue.retry(delivery, delay, &e.to_string()).await
        }
        (Err(e), Disposition::DeadLetter) => {
            error!(
                queue = %delivery.queue,
                delivery_id = %delivery.id,
                attempt = delivery.attempt,
                error = %e,
                "Job retries exhausted, dead-lettering"
            );
            queue.dead_letter(delivery, &e.to_string()).await
        }
        (Err(e), _) => {
            warn!(
                queue = %delivery.queue,
                delivery_id = %delivery.id,
                payload = %delivery.payload,
                error = %e,
                details = ?e,
                "Dropping job after fatal error"
            );
            queue.ack(delivery).await
        }
    };

    if let Err(e) = settled {
        error!(delivery_id = %delivery.id, error = %e, "Failed to settle delivery");
    }

    disposition
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RawProviderError, classify_provider_error};
    use crate::jobs::ValidationError;

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(5),
            ..DispatcherConfig::default()
        }
    }

    fn throttled() -> Result<TaskOutcome, TaskError> {
        Err(TaskError::Provider(classify_provider_error(
            RawProviderError::new("Throttling", "Rate exceeded"),
            None,
        )))
    }

    #[test]
    fn test_success_is_acked() {
        let config = config();
        assert_eq!(config.disposition(&Ok(TaskOutcome::Completed), 1), Disposition::Ack);
        assert_eq!(
            config.disposition(&Ok(TaskOutcome::AlreadySatisfied("gone".into())), 7),
            Disposition::Ack
        );
    }

    #[test]
    fn test_fatal_errors_are_dropped_on_any_attempt() {
        let config = config();
        let fatal = Err(TaskError::Validation(ValidationError::Missing("github_id")));

        assert_eq!(config.disposition(&fatal, 1), Disposition::Drop);
        assert_eq!(config.disposition(&fatal, 3), Disposition::Drop);
    }

    #[test]
    fn test_retry_delay_grows_and_is_capped() {
        let config = config();

        assert_eq!(
            config.disposition(&throttled(), 1),
            Disposition::Retry(Duration::from_secs(2))
        );
        assert_eq!(
            config.disposition(&throttled(), 2),
            Disposition::Retry(Duration::from_secs(4))
        );
        assert_eq!(config.disposition(&throttled(), 3), Disposition::DeadLetter);
    }

    #[test]
    fn test_cap_applies_before_exhaustion() {
        let config = DispatcherConfig {
            max_attempts: 10,
            ..config()
        };
        assert_eq!(
            config.disposition(&throttled(), 6),
            Disposition::Retry(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_bound_queues_include_aliases() {
        let queues = Dispatcher::bound_queues();

        assert!(queues.iter().any(|q| q == "cluster-provision"));
        assert!(queues.iter().any(|q| q == "asg.instance.terminate"));
        assert!(queues.iter().any(|q| q == "shiva-asg-provision"));
        assert!(!queues.iter().any(|q| q.starts_with("events.")));
    }
}
