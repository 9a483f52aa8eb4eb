// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance provisioning, tagging, termination and soft deletion.

use tracing::{info, instrument, warn};

use crate::jobs::{
    ClusterInstanceDelete, ClusterInstanceProvision, ClusterInstanceTag,
    ClusterInstanceTerminate, Job,
};
use crate::lifecycle::{self, ClusterState};
use crate::persistence::NewInstance;
use crate::provider::{
    InstanceFilter, InstanceStatus, LaunchRequest, TAG_NAME, TAG_ORG, TAG_ROLE, Tag,
    WaitCondition,
};

use super::{TaskContext, TaskError, TaskOutcome};

/// Provider states an IP lookup may resolve to. Terminated instances keep
/// their address for a while and must not shadow the live holder.
const LIVE_STATES: [InstanceStatus; 4] = [
    InstanceStatus::Pending,
    InstanceStatus::Running,
    InstanceStatus::Stopping,
    InstanceStatus::Stopped,
];

/// `Name` tag value for an instance of `role` owned by `org`.
pub fn instance_name(org: &str, role: &str) -> String {
    format!("{}-{}", role, org)
}

/// Launch instances into an Active cluster and record them.
///
/// `client_token` makes the launch idempotent across redeliveries: the
/// provider returns the instances of the first launch instead of creating
/// new ones.
#[instrument(skip(ctx, job), fields(cluster_id = %job.cluster_id, role = %job.role))]
pub async fn handle_instance_provision(
    ctx: &TaskContext,
    job: &ClusterInstanceProvision,
    client_token: &str,
) -> Result<TaskOutcome, TaskError> {
    // 1. Cluster must exist and accept instances
    let cluster = ctx
        .store
        .get_cluster(&job.cluster_id)
        .await?
        .ok_or_else(|| TaskError::Unresolved {
            what: "cluster",
            detail: format!("cluster {} does not exist", job.cluster_id),
        })?;

    if ClusterState::of(&cluster) == ClusterState::Deprovisioning {
        return Err(TaskError::InvalidTarget {
            detail: format!(
                "cluster {} is deprovisioning; refusing to add instances",
                cluster.id
            ),
        });
    }

    // 2. Launch
    let launched = ctx
        .provider
        .compute
        .create_instances(&LaunchRequest {
            cluster_id: cluster.id.clone(),
            org_id: cluster.github_id.clone(),
            role: job.role,
            count: job.count,
            client_token: client_token.to_string(),
        })
        .await?;

    // 3. Record; rows from an earlier delivery are kept as they are
    let mut instance_ids = Vec::with_capacity(launched.len());
    for instance in launched {
        lifecycle::register_instance(
            ctx.store.as_ref(),
            &NewInstance {
                id: instance.instance_id.clone(),
                cluster_id: cluster.id.clone(),
                role: job.role,
                aws_image_id: instance.image_id,
                aws_instance_type: instance.instance_type,
                aws_private_ip_address: instance.private_ip_address,
            },
        )
        .await?;
        instance_ids.push(instance.instance_id);
    }

    if instance_ids.is_empty() {
        warn!("Provider launched no instances");
        return Ok(TaskOutcome::AlreadySatisfied(
            "provider launched no instances".to_string(),
        ));
    }

    // 4. Tag them once they exist
    info!(count = instance_ids.len(), "Instances launched");
    ctx.publish(Job::ClusterInstanceTag(ClusterInstanceTag {
        org: cluster.github_id,
        role: job.role,
        instance_ids,
    }))
    .await?;

    Ok(TaskOutcome::Completed)
}

/// Wait until the instances are visible, then tag them.
#[instrument(skip(ctx, job), fields(org = %job.org, count = job.instance_ids.len()))]
pub async fn handle_instance_tag(
    ctx: &TaskContext,
    job: &ClusterInstanceTag,
) -> Result<TaskOutcome, TaskError> {
    ctx.provider
        .compute
        .wait_for(WaitCondition::Exists, &job.instance_ids)
        .await?;

    let role = job.role.as_str();
    let tags = [
        Tag::new(TAG_ORG, &job.org),
        Tag::new(TAG_ROLE, role),
        Tag::new(TAG_NAME, instance_name(&job.org, role)),
    ];
    ctx.provider
        .compute
        .create_tags(&job.instance_ids, &tags)
        .await?;

    Ok(TaskOutcome::Completed)
}

/// Terminate one instance, by id or by private address, and queue the
/// soft delete of its row.
#[instrument(skip(ctx, job))]
pub async fn handle_instance_terminate(
    ctx: &TaskContext,
    job: &ClusterInstanceTerminate,
) -> Result<TaskOutcome, TaskError> {
    // 1. Resolve the target
    let instance_id = match (&job.instance_id, &job.private_ip_address) {
        (Some(id), _) => id.clone(),
        (None, Some(ip)) => resolve_by_ip(ctx, ip).await?,
        (None, None) => {
            return Err(TaskError::Unresolved {
                what: "instance",
                detail: "neither instance id nor private address given".to_string(),
            });
        }
    };

    // 2. Terminate; an instance that is already gone still needs its row deleted
    let outcome = match ctx
        .provider
        .compute
        .terminate_instances(std::slice::from_ref(&instance_id))
        .await
    {
        Ok(_) => {
            info!(instance_id = %instance_id, "Instance terminated");
            TaskOutcome::Completed
        }
        Err(e) if e.is_not_found() => {
            info!(instance_id = %instance_id, "Instance already gone at provider");
            TaskOutcome::AlreadySatisfied(format!("instance {} not found", instance_id))
        }
        Err(e) => return Err(e.into()),
    };

    // 3. Soft delete follows in its own job
    ctx.publish(Job::ClusterInstanceDelete(ClusterInstanceDelete { instance_id }))
        .await?;

    Ok(outcome)
}

async fn resolve_by_ip(ctx: &TaskContext, ip: &str) -> Result<String, TaskError> {
    let filter = InstanceFilter {
        states: LIVE_STATES.to_vec(),
        ..InstanceFilter::by_private_ip(ip)
    };
    let mut matches = ctx.provider.compute.describe_instances(&filter).await?;

    match matches.len() {
        1 => Ok(matches.remove(0).instance_id),
        0 => Err(TaskError::Unresolved {
            what: "instance",
            detail: format!("no instance holds private address {}", ip),
        }),
        n => Err(TaskError::Unresolved {
            what: "instance",
            detail: format!("{} instances hold private address {}", n, ip),
        }),
    }
}

/// Soft delete an instance row. Idempotent.
#[instrument(skip(ctx, job), fields(instance_id = %job.instance_id))]
pub async fn handle_instance_delete(
    ctx: &TaskContext,
    job: &ClusterInstanceDelete,
) -> Result<TaskOutcome, TaskError> {
    if lifecycle::soft_delete_instance(ctx.store.as_ref(), &job.instance_id).await? {
        Ok(TaskOutcome::Completed)
    } else {
        Ok(TaskOutcome::AlreadySatisfied(format!(
            "instance {} already deleted or unknown",
            job.instance_id
        )))
    }
}
