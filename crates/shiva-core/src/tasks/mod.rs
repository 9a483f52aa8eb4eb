// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task handlers.
//!
//! One handler per [`JobKind`]. A handler receives an already validated job,
//! talks to the store and the provider, may publish follow-on jobs, and
//! returns a [`TaskOutcome`] or a [`TaskError`] whose
//! [`is_retryable`](TaskError::is_retryable) decides what the dispatcher does
//! with the delivery.
//!
//! Benign outcomes (duplicate inserts, resources already present or already
//! gone) are reported as [`TaskOutcome::AlreadySatisfied`], never swallowed.

pub mod asg;
pub mod cluster;
pub mod iam;
pub mod instance;

use std::sync::Arc;

use thiserror::Error;

use crate::error::{ProviderError, StoreError, classify_storage_error};
use crate::jobs::{Job, JobKind, ValidationError};
use crate::lifecycle::TransitionError;
use crate::persistence::Store;
use crate::provider::{DockTemplate, Provider};
use crate::queue::{Delivery, Queue, QueueError};

// ============================================================================
// Settings
// ============================================================================

/// Fleet-wide parameters the handlers need.
#[derive(Debug, Clone)]
pub struct TaskSettings {
    /// Dock instances requested for a newly provisioned cluster.
    pub initial_dock_count: u32,
    /// Prefix of per-organization auto scaling group names.
    pub asg_name_prefix: String,
    /// Minimum size of a new group.
    pub asg_min_size: i32,
    /// Maximum size of a new group.
    pub asg_max_size: i32,
    /// Desired capacity of a new group.
    pub asg_desired_capacity: i32,
    /// Prefix of ephemeral dock identity user names.
    pub iam_user_prefix: String,
    /// Launch parameters for dock instances.
    pub dock: DockTemplate,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            initial_dock_count: 2,
            asg_name_prefix: "asg-production-".to_string(),
            asg_min_size: 0,
            asg_max_size: 20,
            asg_desired_capacity: 2,
            iam_user_prefix: "dock-".to_string(),
            dock: DockTemplate {
                image_id: "ami-00000000".to_string(),
                instance_type: "t2.medium".to_string(),
                key_name: None,
                security_groups: Vec::new(),
                subnet_id: None,
                user_data: None,
            },
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// Shared handles every handler runs against.
///
/// Cheap to clone; each worker gets its own copy.
#[derive(Clone)]
pub struct TaskContext {
    /// Cluster/instance store.
    pub store: Arc<dyn Store>,
    /// Cloud provider adapters.
    pub provider: Provider,
    /// Queue for follow-on jobs and events.
    pub queue: Arc<dyn Queue>,
    /// Fleet parameters.
    pub settings: Arc<TaskSettings>,
}

impl TaskContext {
    /// Bundle the handles.
    pub fn new(
        store: Arc<dyn Store>,
        provider: Provider,
        queue: Arc<dyn Queue>,
        settings: TaskSettings,
    ) -> Self {
        Self {
            store,
            provider,
            queue,
            settings: Arc::new(settings),
        }
    }

    /// Publish a follow-on job on its canonical queue.
    pub(crate) async fn publish(&self, job: Job) -> Result<(), TaskError> {
        self.queue
            .publish(job.kind().queue_name(), job.payload())
            .await?;
        Ok(())
    }
}

// ============================================================================
// Outcomes and errors
// ============================================================================

/// Successful handler result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The transition was applied.
    Completed,
    /// Nothing to do; the reason says why.
    AlreadySatisfied(String),
}

/// Handler failure.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The payload was rejected before any side effect.
    #[error("invalid job payload: {0}")]
    Validation(#[from] ValidationError),

    /// Classified storage failure.
    #[error("store error: {0}")]
    Store(StoreError),

    /// Classified provider failure.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A reference in the job resolves to nothing usable.
    #[error("unresolved {what}: {detail}")]
    Unresolved {
        /// What was looked up.
        what: &'static str,
        /// Lookup details.
        detail: String,
    },

    /// A precondition does not hold yet; redelivery may find it satisfied.
    #[error("precondition not met: {detail}")]
    PreconditionNotMet {
        /// What is outstanding.
        detail: String,
    },

    /// The target is in a state the transition can never start from.
    #[error("invalid target: {detail}")]
    InvalidTarget {
        /// Why the target was refused.
        detail: String,
    },

    /// Publishing a follow-on job failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl TaskError {
    /// Whether redelivering the job could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Unresolved { .. } | Self::InvalidTarget { .. } => false,
            Self::Store(e) => e.is_retryable(),
            Self::Provider(e) => e.is_retryable(),
            Self::PreconditionNotMet { .. } | Self::Queue(_) => true,
        }
    }
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        Self::Store(classify_storage_error(err))
    }
}

impl From<TransitionError> for TaskError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::Store(e) => e.into(),
            TransitionError::NotDeprovisioning { cluster_id } => Self::InvalidTarget {
                detail: format!("cluster {} is not deprovisioning", cluster_id),
            },
            TransitionError::ActiveInstances { cluster_id, active } => Self::PreconditionNotMet {
                detail: format!(
                    "cluster {} still has {} active instance(s)",
                    cluster_id, active
                ),
            },
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Validate a delivery and run the handler bound to its queue.
pub async fn execute(ctx: &TaskContext, delivery: &Delivery) -> Result<TaskOutcome, TaskError> {
    let kind = JobKind::from_queue(&delivery.queue).ok_or_else(|| TaskError::Unresolved {
        what: "queue",
        detail: format!("no handler bound to '{}'", delivery.queue),
    })?;
    let job = Job::parse(kind, &delivery.payload)?;

    run(ctx, &job, &delivery.id.to_string()).await
}

/// Run the handler for a validated job.
///
/// `delivery_id` is stable across redeliveries of the same message and is
/// the provider idempotency token for jobs that carry no token of their own.
pub async fn run(ctx: &TaskContext, job: &Job, delivery_id: &str) -> Result<TaskOutcome, TaskError> {
    match job {
        Job::ClusterProvision(j) => cluster::handle_cluster_provision(ctx, j).await,
        Job::ClusterDeprovision(j) => cluster::handle_cluster_deprovision(ctx, j).await,
        Job::ClusterDelete(j) => cluster::handle_cluster_delete(ctx, j).await,
        Job::ClusterInstanceProvision(j) => {
            instance::handle_instance_provision(ctx, j, &j.client_token(delivery_id)).await
        }
        Job::ClusterInstanceTag(j) => instance::handle_instance_tag(ctx, j).await,
        Job::ClusterInstanceTerminate(j) => instance::handle_instance_terminate(ctx, j).await,
        Job::ClusterInstanceDelete(j) => instance::handle_instance_delete(ctx, j).await,
        Job::AsgCreate(j) => asg::handle_asg_create(ctx, j).await,
        Job::AsgUpdate(j) => asg::handle_asg_update(ctx, j).await,
        Job::AsgDelete(j) => asg::handle_asg_delete(ctx, j).await,
        Job::OrgInstanceAttach(j) => asg::handle_org_instance_attach(ctx, j).await,
        Job::DockInitialized(j) => asg::handle_dock_initialized(ctx, j).await,
        Job::IamCleanup(j) => iam::handle_iam_cleanup(ctx, j).await,
        Job::IamOldestLaunchTimeFetch => iam::handle_oldest_launch_time_fetch(ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RawDbError, RawProviderError, classify_provider_error};

    #[test]
    fn test_store_errors_are_classified_on_conversion() {
        let raw = StoreError::Raw(RawDbError::new("dup").with_code("23505"));
        let err: TaskError = raw.into();

        assert!(matches!(err, TaskError::Store(StoreError::UniqueViolation(_))));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryability_per_variant() {
        assert!(!TaskError::Validation(ValidationError::Missing("x")).is_retryable());
        assert!(
            !TaskError::Unresolved {
                what: "instance",
                detail: "10.0.0.1".into()
            }
            .is_retryable()
        );
        assert!(
            !TaskError::InvalidTarget {
                detail: "deprovisioning".into()
            }
            .is_retryable()
        );
        assert!(
            TaskError::PreconditionNotMet {
                detail: "instances".into()
            }
            .is_retryable()
        );
        assert!(TaskError::Store(StoreError::Raw(RawDbError::new("pool timed out"))).is_retryable());

        let throttled = classify_provider_error(RawProviderError::new("Throttling", "slow"), None);
        assert!(TaskError::Provider(throttled).is_retryable());
        let invalid =
            classify_provider_error(RawProviderError::new("ValidationError", "bad"), None);
        assert!(!TaskError::Provider(invalid).is_retryable());
    }

    #[test]
    fn test_transition_errors_map_to_retry_policy() {
        let not_deprov: TaskError = TransitionError::NotDeprovisioning {
            cluster_id: "c-1".into(),
        }
        .into();
        assert!(matches!(not_deprov, TaskError::InvalidTarget { .. }));

        let active: TaskError = TransitionError::ActiveInstances {
            cluster_id: "c-1".into(),
            active: 3,
        }
        .into();
        assert!(active.is_retryable());
        assert!(active.to_string().contains("3 active"));
    }
}
