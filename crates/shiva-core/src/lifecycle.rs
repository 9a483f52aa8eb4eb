// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster and instance lifecycle states.
//!
//! The store keeps lifecycle as flags (`clusters.deprovisioning`,
//! `instances.deleted`). This module derives an explicit state from those
//! flags at read time and owns every write that moves an entity between
//! states, so handlers never issue lifecycle mutations directly.
//!
//! ```text
//! Cluster:   (absent) --provision--> Active --deprovision--> Deprovisioning --purge--> (absent)
//! Instance:  (absent) --register---> Active --soft delete--> Deleted ----purge--------> (absent)
//! ```

use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ClassifyStoreResult, StoreError};
use crate::persistence::{ClusterRecord, InstanceRecord, NewInstance, Store};

/// Lifecycle state of a cluster row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// Accepting new instances.
    Active,
    /// Teardown started; no new instances may be provisioned.
    Deprovisioning,
}

impl ClusterState {
    /// Derive the state from a stored row.
    pub fn of(record: &ClusterRecord) -> Self {
        if record.deprovisioning {
            Self::Deprovisioning
        } else {
            Self::Active
        }
    }
}

/// Lifecycle state of an instance row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Counted in lifecycle queries.
    Active,
    /// Soft-deleted; kept for audit only.
    Deleted,
}

impl InstanceState {
    /// Derive the state from a stored row.
    pub fn of(record: &InstanceRecord) -> Self {
        if record.deleted.is_some() {
            Self::Deleted
        } else {
            Self::Active
        }
    }
}

/// A transition was refused, or the store failed while applying it.
#[derive(Debug, Error)]
pub enum TransitionError {
    /// Classified storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The transition requires a deprovisioning cluster.
    #[error("cluster {cluster_id} is not deprovisioning")]
    NotDeprovisioning {
        /// Cluster the transition targeted.
        cluster_id: String,
    },

    /// The transition requires a cluster without active instances.
    #[error("cluster {cluster_id} still has {active} active instance(s)")]
    ActiveInstances {
        /// Cluster the transition targeted.
        cluster_id: String,
        /// Instances whose `deleted` is still NULL.
        active: i64,
    },
}

/// Result of [`provision_cluster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioned {
    /// This call inserted the row.
    Created(ClusterRecord),
    /// A concurrent delivery inserted the row first.
    Raced,
}

/// Insert a new Active cluster for `github_id`.
///
/// A unique violation means another delivery won the race; that is reported
/// as [`Provisioned::Raced`] rather than an error.
pub async fn provision_cluster(
    store: &dyn Store,
    github_id: &str,
) -> Result<Provisioned, StoreError> {
    let id = Uuid::new_v4().to_string();

    match store.insert_cluster(&id, github_id).await.classified() {
        Ok(record) => {
            info!(cluster_id = %record.id, github_id = %github_id, "Cluster created");
            Ok(Provisioned::Created(record))
        }
        Err(StoreError::UniqueViolation(failure)) => {
            debug!(github_id = %github_id, error = %failure, "Cluster insert lost race");
            Ok(Provisioned::Raced)
        }
        Err(e) => Err(e),
    }
}

/// Move a cluster from Active to Deprovisioning.
///
/// Returns false when the cluster was already deprovisioning.
pub async fn begin_deprovision(store: &dyn Store, cluster_id: &str) -> Result<bool, StoreError> {
    let flipped = store
        .set_cluster_deprovisioning(cluster_id)
        .await
        .classified()?;

    if flipped {
        info!(cluster_id = %cluster_id, "Cluster deprovisioning started");
    }

    Ok(flipped)
}

/// Record a provider instance as Active.
///
/// Returns false when the row already exists (redelivered provision job).
pub async fn register_instance(
    store: &dyn Store,
    instance: &NewInstance,
) -> Result<bool, StoreError> {
    match store.insert_instance(instance).await.classified() {
        Ok(_) => Ok(true),
        Err(StoreError::UniqueViolation(_)) => {
            debug!(instance_id = %instance.id, "Instance already recorded");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Move an instance to Deleted.
///
/// Idempotent: returns false when the row is already deleted or never
/// existed, leaving the first timestamp in place.
pub async fn soft_delete_instance(store: &dyn Store, instance_id: &str) -> Result<bool, StoreError> {
    let stamped = store.soft_delete_instance(instance_id).await.classified()?;

    if stamped {
        info!(instance_id = %instance_id, "Instance soft-deleted");
    } else {
        debug!(instance_id = %instance_id, "Instance already deleted or unknown");
    }

    Ok(stamped)
}

/// Counts of rows removed by [`purge_cluster`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Purged {
    /// Instance rows removed.
    pub instances: u64,
    /// Volume rows removed.
    pub volumes: u64,
}

/// Hard delete a Deprovisioning cluster and everything it owns.
///
/// Refused while any instance of the cluster is still Active. Association
/// rows and volumes go first, then instances, then the cluster row.
pub async fn purge_cluster(
    store: &dyn Store,
    cluster: &ClusterRecord,
) -> Result<Purged, TransitionError> {
    if ClusterState::of(cluster) != ClusterState::Deprovisioning {
        return Err(TransitionError::NotDeprovisioning {
            cluster_id: cluster.id.clone(),
        });
    }

    let active = store
        .count_active_instances(&cluster.id)
        .await
        .classified()?;
    if active > 0 {
        return Err(TransitionError::ActiveInstances {
            cluster_id: cluster.id.clone(),
            active,
        });
    }

    let volumes = store
        .delete_volumes_for_cluster(&cluster.id)
        .await
        .classified()?;
    let instances = store
        .delete_instances_for_cluster(&cluster.id)
        .await
        .classified()?;
    store.delete_cluster(&cluster.id).await.classified()?;

    info!(
        cluster_id = %cluster.id,
        instances,
        volumes,
        "Cluster purged"
    );

    Ok(Purged { instances, volumes })
}
