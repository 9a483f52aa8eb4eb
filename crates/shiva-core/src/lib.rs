// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shiva - Cluster Lifecycle Orchestration
//!
//! This crate provisions and tears down per-organization compute clusters
//! ("docks") by reacting to jobs delivered over a queue. State lives in
//! three systems that fail independently: the queue, the relational store
//! and the cloud provider. Every failure is classified and settled as a
//! retry, a benign no-op or a permanent drop.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │        queue_jobs            │  PostgresQueue (SKIP LOCKED lease)
//! └──────────────┬───────────────┘
//!                │ receive / ack / retry / dead letter
//!                ▼
//! ┌──────────────────────────────┐
//! │         Dispatcher           │  one tokio task per delivery
//! └──────────────┬───────────────┘
//!                │ Job::parse → handler
//!                ▼
//! ┌──────────────────────────────┐      ┌──────────────────────────┐
//! │        Task handlers         │─────►│  Provider (EC2, ASG, IAM)│
//! │  cluster / instance / asg /  │      └──────────────────────────┘
//! │  iam                         │      ┌──────────────────────────┐
//! │                              │─────►│  Store (clusters,        │
//! └──────────────┬───────────────┘      │  instances, volumes)     │
//!                │ follow-on jobs       └──────────────────────────┘
//!                ▼
//!           queue_jobs
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Cluster:   (absent) --provision--> ACTIVE --deprovision--> DEPROVISIONING --delete--> (absent)
//! Instance:  (absent) --provision--> ACTIVE --terminate/delete--> DELETED --cluster delete--> (absent)
//! ```
//!
//! `cluster-delete` is redelivered until every instance of the cluster is
//! soft-deleted.
//!
//! # Jobs
//!
//! | Queue | Effect |
//! |-------|--------|
//! | `cluster-provision` | Create the cluster row, request the initial docks |
//! | `cluster-instance-provision` | Launch instances and record them |
//! | `cluster-instance-tag` | Tag launched instances |
//! | `cluster-instance-terminate` | Terminate by id or private address |
//! | `cluster-instance-delete` | Soft delete an instance row |
//! | `cluster-deprovision` | Flag the cluster, fan out terminations |
//! | `cluster-delete` | Hard delete a drained cluster |
//! | `asg.create` / `asg.update` / `asg.delete` | Manage the organization's group |
//! | `org.instance.attach` | Attach an instance to the group |
//! | `dock.initialized` | Relay a dock readiness event |
//! | `iam.oldest-launch-time-fetch` / `iam.cleanup` | Collect stale dock identities |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables, see
//! [`config::Config::from_env`]. The most important ones:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `SHIVA_DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `SHIVA_DOCK_IMAGE_ID` | Yes | - | Image docks are launched from |
//! | `SHIVA_MAX_WORKERS` | No | `16` | Concurrent deliveries |
//! | `SHIVA_MAX_ATTEMPTS` | No | `10` | Deliveries before dead letter |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Storage and provider error classification
//! - [`persistence`]: Cluster, instance and volume store (PostgreSQL, SQLite)
//! - [`lifecycle`]: Cluster and instance states and transitions
//! - [`jobs`]: Job kinds, queue names and payload validation
//! - [`provider`]: Compute, auto scaling and identity adapters
//! - [`queue`]: Queue boundary (PostgreSQL, in-memory)
//! - [`tasks`]: Task handlers
//! - [`dispatcher`]: Queue polling and delivery settlement
//! - [`event_sweeper`]: Expiry of outbound events nobody consumed
//! - [`runtime`]: Embeddable runtime

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Queue polling, worker spawning and delivery settlement.
pub mod dispatcher;

/// Background removal of expired outbound events.
pub mod event_sweeper;

/// Error types and classification for storage and provider failures.
pub mod error;

/// Job kinds and payload validation.
pub mod jobs;

/// Lifecycle states and transitions.
pub mod lifecycle;

/// Embedded database migrations.
pub mod migrations;

/// Store trait and backends.
pub mod persistence;

/// Cloud provider adapters.
pub mod provider;

/// Queue trait and backends.
pub mod queue;

/// Embeddable runtime.
pub mod runtime;

/// Task handlers, one per job kind.
pub mod tasks;
