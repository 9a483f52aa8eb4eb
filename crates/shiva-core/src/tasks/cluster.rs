// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster provisioning and teardown.
//!
//! Teardown is a fan-out: `cluster-deprovision` flags the cluster and
//! publishes one terminate job per active instance plus a `cluster-delete`.
//! The delete keeps being redelivered until every instance is soft-deleted.

use tracing::{debug, info, instrument, warn};

use crate::jobs::{
    ClusterDelete, ClusterDeprovision, ClusterInstanceProvision, ClusterInstanceTerminate,
    ClusterProvision, Job,
};
use crate::lifecycle::{self, ClusterState, Provisioned};
use crate::persistence::InstanceRole;

use super::{TaskContext, TaskError, TaskOutcome};

/// Create the cluster row for an organization and request its first docks.
///
/// A redelivery that finds the cluster Active but short of its initial
/// docks republishes every dock slot. Slots that already launched are
/// deduplicated by their client token.
#[instrument(skip(ctx, job), fields(github_id = %job.github_id))]
pub async fn handle_cluster_provision(
    ctx: &TaskContext,
    job: &ClusterProvision,
) -> Result<TaskOutcome, TaskError> {
    let docks = ctx.settings.initial_dock_count;

    // 1. An existing row decides the outcome
    if let Some(existing) = ctx.store.get_cluster_by_github_id(&job.github_id).await? {
        if ClusterState::of(&existing) == ClusterState::Deprovisioning {
            return Err(TaskError::PreconditionNotMet {
                detail: format!(
                    "cluster {} of organization {} is still being deprovisioned",
                    existing.id, job.github_id
                ),
            });
        }

        let active = ctx.store.count_active_instances(&existing.id).await?;
        if active >= i64::from(docks) {
            return Ok(TaskOutcome::AlreadySatisfied(format!(
                "organization {} already has cluster {} with {} instance(s)",
                job.github_id, existing.id, active
            )));
        }

        warn!(
            cluster_id = %existing.id,
            active,
            docks,
            "Cluster exists without its initial docks, republishing dock slots"
        );
        publish_docks(ctx, &existing.id, docks).await?;
        return Ok(TaskOutcome::Completed);
    }

    // 2. Insert; a concurrent delivery may win the unique constraint
    let cluster = match lifecycle::provision_cluster(ctx.store.as_ref(), &job.github_id).await? {
        Provisioned::Created(record) => record,
        Provisioned::Raced => {
            return Ok(TaskOutcome::AlreadySatisfied(format!(
                "cluster for organization {} created concurrently",
                job.github_id
            )));
        }
    };

    // 3. Initial docks
    publish_docks(ctx, &cluster.id, docks).await?;

    info!(cluster_id = %cluster.id, docks, "Cluster provisioned");
    Ok(TaskOutcome::Completed)
}

async fn publish_docks(ctx: &TaskContext, cluster_id: &str, docks: u32) -> Result<(), TaskError> {
    for slot in 1..=docks {
        ctx.publish(Job::ClusterInstanceProvision(ClusterInstanceProvision {
            cluster_id: cluster_id.to_string(),
            role: InstanceRole::Dock,
            count: 1,
            slot: Some(slot),
        }))
        .await?;
    }
    Ok(())
}

/// Flag a cluster as deprovisioning and fan out its teardown.
#[instrument(skip(ctx, job), fields(github_id = %job.github_id))]
pub async fn handle_cluster_deprovision(
    ctx: &TaskContext,
    job: &ClusterDeprovision,
) -> Result<TaskOutcome, TaskError> {
    let cluster = ctx
        .store
        .get_cluster_by_github_id(&job.github_id)
        .await?
        .ok_or_else(|| TaskError::Unresolved {
            what: "cluster",
            detail: format!("organization {} has no cluster", job.github_id),
        })?;

    if !lifecycle::begin_deprovision(ctx.store.as_ref(), &cluster.id).await? {
        debug!(cluster_id = %cluster.id, "Already deprovisioning, republishing teardown");
    }

    let instances = ctx.store.list_instances(&cluster.id, false).await?;
    for instance in &instances {
        ctx.publish(Job::ClusterInstanceTerminate(ClusterInstanceTerminate {
            instance_id: Some(instance.id.clone()),
            private_ip_address: None,
        }))
        .await?;
    }

    ctx.publish(Job::ClusterDelete(ClusterDelete {
        cluster_id: cluster.id.clone(),
    }))
    .await?;

    info!(
        cluster_id = %cluster.id,
        instances = instances.len(),
        "Cluster teardown published"
    );
    Ok(TaskOutcome::Completed)
}

/// Hard delete a deprovisioned cluster once all of its instances are gone.
#[instrument(skip(ctx, job), fields(cluster_id = %job.cluster_id))]
pub async fn handle_cluster_delete(
    ctx: &TaskContext,
    job: &ClusterDelete,
) -> Result<TaskOutcome, TaskError> {
    let Some(cluster) = ctx.store.get_cluster(&job.cluster_id).await? else {
        return Ok(TaskOutcome::AlreadySatisfied(format!(
            "cluster {} already deleted",
            job.cluster_id
        )));
    };

    lifecycle::purge_cluster(ctx.store.as_ref(), &cluster).await?;
    Ok(TaskOutcome::Completed)
}
