// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::dispatcher::DispatcherConfig;
use crate::event_sweeper::EventSweeperConfig;
use crate::provider::DockTemplate;
use crate::tasks::TaskSettings;

/// Shiva configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL (store and queue)
    pub database_url: String,
    /// Dispatcher concurrency and retry policy
    pub dispatcher: DispatcherConfig,
    /// Fleet parameters passed to the task handlers
    pub tasks: TaskSettings,
    /// Upper bound for provider waiters
    pub wait_timeout: Duration,
    /// Expiry of outbound events nobody consumed
    pub event_sweeper: EventSweeperConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `SHIVA_DATABASE_URL`: PostgreSQL connection string
    /// - `SHIVA_DOCK_IMAGE_ID`: image docks are launched from
    ///
    /// Optional (with defaults):
    /// - `SHIVA_MAX_WORKERS` (16), `SHIVA_POLL_INTERVAL_MS` (500),
    ///   `SHIVA_MAX_ATTEMPTS` (10), `SHIVA_RETRY_DELAY_MS` (5000)
    /// - `SHIVA_INITIAL_DOCK_COUNT` (2)
    /// - `SHIVA_ASG_NAME_PREFIX` (`asg-production-`), `SHIVA_ASG_MIN_SIZE` (0),
    ///   `SHIVA_ASG_MAX_SIZE` (20), `SHIVA_ASG_DESIRED_CAPACITY` (2)
    /// - `SHIVA_IAM_USER_PREFIX` (`dock-`)
    /// - `SHIVA_DOCK_INSTANCE_TYPE` (`t2.medium`), `SHIVA_DOCK_KEY_NAME`,
    ///   `SHIVA_DOCK_SECURITY_GROUPS` (comma separated), `SHIVA_DOCK_SUBNET_ID`,
    ///   `SHIVA_DOCK_USER_DATA`
    /// - `SHIVA_WAIT_TIMEOUT_SECS` (300)
    /// - `SHIVA_EVENT_SWEEP_ENABLED` (true), `SHIVA_EVENT_SWEEP_INTERVAL_SECS` (3600),
    ///   `SHIVA_EVENT_RETENTION_SECS` (604800), `SHIVA_EVENT_SWEEP_BATCH_SIZE` (500)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("SHIVA_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("SHIVA_DATABASE_URL"))?;

        let max_workers: usize = parse("SHIVA_MAX_WORKERS", "16", "must be a positive integer")?;
        if max_workers == 0 {
            return Err(ConfigError::Invalid(
                "SHIVA_MAX_WORKERS",
                "must be a positive integer",
            ));
        }

        let max_attempts: u32 = parse("SHIVA_MAX_ATTEMPTS", "10", "must be a positive integer")?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "SHIVA_MAX_ATTEMPTS",
                "must be a positive integer",
            ));
        }

        let poll_interval_ms: u64 =
            parse("SHIVA_POLL_INTERVAL_MS", "500", "must be a number of milliseconds")?;
        let retry_delay_ms: u64 =
            parse("SHIVA_RETRY_DELAY_MS", "5000", "must be a number of milliseconds")?;

        let dispatcher = DispatcherConfig {
            max_workers,
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_attempts,
            retry_delay: Duration::from_millis(retry_delay_ms),
            ..DispatcherConfig::default()
        };

        let asg_min_size: i32 = parse("SHIVA_ASG_MIN_SIZE", "0", "must be a non-negative integer")?;
        let asg_max_size: i32 = parse("SHIVA_ASG_MAX_SIZE", "20", "must be a non-negative integer")?;
        let asg_desired_capacity: i32 = parse(
            "SHIVA_ASG_DESIRED_CAPACITY",
            "2",
            "must be a non-negative integer",
        )?;
        if asg_min_size < 0 || asg_max_size < asg_min_size {
            return Err(ConfigError::Invalid(
                "SHIVA_ASG_MAX_SIZE",
                "must be at least SHIVA_ASG_MIN_SIZE",
            ));
        }
        if !(asg_min_size..=asg_max_size).contains(&asg_desired_capacity) {
            return Err(ConfigError::Invalid(
                "SHIVA_ASG_DESIRED_CAPACITY",
                "must lie between SHIVA_ASG_MIN_SIZE and SHIVA_ASG_MAX_SIZE",
            ));
        }

        let dock = DockTemplate {
            image_id: std::env::var("SHIVA_DOCK_IMAGE_ID")
                .map_err(|_| ConfigError::Missing("SHIVA_DOCK_IMAGE_ID"))?,
            instance_type: std::env::var("SHIVA_DOCK_INSTANCE_TYPE")
                .unwrap_or_else(|_| "t2.medium".to_string()),
            key_name: optional("SHIVA_DOCK_KEY_NAME"),
            security_groups: optional("SHIVA_DOCK_SECURITY_GROUPS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            subnet_id: optional("SHIVA_DOCK_SUBNET_ID"),
            user_data: optional("SHIVA_DOCK_USER_DATA"),
        };

        let tasks = TaskSettings {
            initial_dock_count: parse(
                "SHIVA_INITIAL_DOCK_COUNT",
                "2",
                "must be a non-negative integer",
            )?,
            asg_name_prefix: std::env::var("SHIVA_ASG_NAME_PREFIX")
                .unwrap_or_else(|_| "asg-production-".to_string()),
            asg_min_size,
            asg_max_size,
            asg_desired_capacity,
            iam_user_prefix: std::env::var("SHIVA_IAM_USER_PREFIX")
                .unwrap_or_else(|_| "dock-".to_string()),
            dock,
        };

        let wait_timeout_secs: u64 =
            parse("SHIVA_WAIT_TIMEOUT_SECS", "300", "must be a number of seconds")?;

        let sweep_enabled: bool =
            parse("SHIVA_EVENT_SWEEP_ENABLED", "true", "must be true or false")?;
        let sweep_interval_secs: u64 =
            parse("SHIVA_EVENT_SWEEP_INTERVAL_SECS", "3600", "must be a number of seconds")?;
        let retention_secs: u64 =
            parse("SHIVA_EVENT_RETENTION_SECS", "604800", "must be a number of seconds")?;
        let sweep_batch_size: usize = parse(
            "SHIVA_EVENT_SWEEP_BATCH_SIZE",
            "500",
            "must be a positive integer",
        )?;
        if sweep_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "SHIVA_EVENT_SWEEP_BATCH_SIZE",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            database_url,
            dispatcher,
            tasks,
            wait_timeout: Duration::from_secs(wait_timeout_secs),
            event_sweeper: EventSweeperConfig {
                enabled: sweep_enabled,
                poll_interval: Duration::from_secs(sweep_interval_secs),
                max_age: Duration::from_secs(retention_secs),
                batch_size: sweep_batch_size,
            },
        })
    }
}

impl Config {
    /// Database connections for the shared pool: one per worker plus two
    /// for the dispatcher poll and the event sweeper.
    pub fn pool_size(&self) -> u32 {
        u32::try_from(self.dispatcher.max_workers)
            .unwrap_or(u32::MAX)
            .saturating_add(2)
    }
}

fn parse<T: FromStr>(
    name: &'static str,
    default: &str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(name, expected))
}

/// Unset and empty both read as absent.
fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
