// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-organization auto scaling groups.
//!
//! Each organization gets one group and one launch configuration, both named
//! [`group_name`]. Creation tolerates resources that already exist and
//! deletion tolerates resources that are already gone.

use serde_json::json;
use tracing::{info, instrument};

use crate::error::ProviderError;
use crate::jobs::{AsgCreate, AsgDelete, AsgUpdate, DockInitialized, JobKind, OrgInstanceAttach};
use crate::persistence::InstanceRole;
use crate::provider::{GroupSpec, GroupUpdate, LaunchConfigurationSpec, TAG_NAME, TAG_ORG, TAG_ROLE, Tag};

use super::instance::instance_name;
use super::{TaskContext, TaskError, TaskOutcome};

/// Name of the group (and its launch configuration) for `org_id`.
pub fn group_name(prefix: &str, org_id: &str) -> String {
    format!("{}{}", prefix, org_id)
}

/// The auto scaling API reports missing groups and launch configurations as
/// validation errors rather than with a not-found code.
fn is_gone(err: &ProviderError) -> bool {
    match err {
        ProviderError::ValidationFailure { source, .. } => {
            source.message.to_ascii_lowercase().contains("not found")
        }
        other => other.is_not_found(),
    }
}

/// Create the organization's launch configuration, then its group.
#[instrument(skip(ctx, job), fields(github_id = %job.github_id))]
pub async fn handle_asg_create(
    ctx: &TaskContext,
    job: &AsgCreate,
) -> Result<TaskOutcome, TaskError> {
    let settings = &ctx.settings;
    let name = group_name(&settings.asg_name_prefix, &job.github_id);
    let mut existed = 0;

    // 1. Launch configuration
    let launch_configuration = LaunchConfigurationSpec {
        name: name.clone(),
        image_id: settings.dock.image_id.clone(),
        instance_type: settings.dock.instance_type.clone(),
        key_name: settings.dock.key_name.clone(),
        security_groups: settings.dock.security_groups.clone(),
        user_data: settings.dock.user_data.clone(),
    };
    match ctx
        .provider
        .autoscaling
        .create_launch_configuration(&launch_configuration)
        .await
    {
        Ok(()) => info!(launch_configuration = %name, "Launch configuration created"),
        Err(e) if e.is_already_exists() => existed += 1,
        Err(e) => return Err(e.into()),
    }

    // 2. Group
    let role = InstanceRole::Dock.as_str();
    let group = GroupSpec {
        name: name.clone(),
        launch_configuration_name: name.clone(),
        min_size: settings.asg_min_size,
        max_size: settings.asg_max_size,
        desired_capacity: settings.asg_desired_capacity,
        vpc_zone_identifier: settings.dock.subnet_id.clone(),
        tags: vec![
            Tag::new(TAG_ORG, &job.github_id),
            Tag::new(TAG_ROLE, role),
            Tag::new(TAG_NAME, instance_name(&job.github_id, role)),
        ],
    };
    match ctx.provider.autoscaling.create_auto_scaling_group(&group).await {
        Ok(()) => info!(group = %name, "Auto scaling group created"),
        Err(e) if e.is_already_exists() => existed += 1,
        Err(e) => return Err(e.into()),
    }

    if existed == 2 {
        Ok(TaskOutcome::AlreadySatisfied(format!("group {} already exists", name)))
    } else {
        Ok(TaskOutcome::Completed)
    }
}

/// Change the capacity of the organization's group.
#[instrument(skip(ctx, job), fields(github_id = %job.github_id))]
pub async fn handle_asg_update(
    ctx: &TaskContext,
    job: &AsgUpdate,
) -> Result<TaskOutcome, TaskError> {
    let update = GroupUpdate {
        name: group_name(&ctx.settings.asg_name_prefix, &job.github_id),
        desired_capacity: job.capacity.desired_capacity,
        min_size: job.capacity.min_size,
        max_size: job.capacity.max_size,
    };

    ctx.provider
        .autoscaling
        .update_auto_scaling_group(&update)
        .await?;

    info!(group = %update.name, capacity = ?job.capacity, "Auto scaling group updated");
    Ok(TaskOutcome::Completed)
}

/// Force-delete the organization's group, then its launch configuration.
#[instrument(skip(ctx, job), fields(github_id = %job.github_id))]
pub async fn handle_asg_delete(
    ctx: &TaskContext,
    job: &AsgDelete,
) -> Result<TaskOutcome, TaskError> {
    let name = group_name(&ctx.settings.asg_name_prefix, &job.github_id);
    let mut gone = 0;

    match ctx
        .provider
        .autoscaling
        .delete_auto_scaling_group(&name, true)
        .await
    {
        Ok(()) => info!(group = %name, "Auto scaling group deleted"),
        Err(e) if is_gone(&e) => gone += 1,
        Err(e) => return Err(e.into()),
    }

    // A launch configuration still referenced by a group that is being torn
    // down comes back as a delete conflict, which is retried.
    match ctx
        .provider
        .autoscaling
        .delete_launch_configuration(&name)
        .await
    {
        Ok(()) => info!(launch_configuration = %name, "Launch configuration deleted"),
        Err(e) if is_gone(&e) => gone += 1,
        Err(e) => return Err(e.into()),
    }

    if gone == 2 {
        Ok(TaskOutcome::AlreadySatisfied(format!("group {} already deleted", name)))
    } else {
        Ok(TaskOutcome::Completed)
    }
}

/// Attach a running instance to the organization's group.
#[instrument(skip(ctx, job), fields(github_id = %job.github_id, instance_id = %job.instance_id))]
pub async fn handle_org_instance_attach(
    ctx: &TaskContext,
    job: &OrgInstanceAttach,
) -> Result<TaskOutcome, TaskError> {
    let name = group_name(&ctx.settings.asg_name_prefix, &job.github_id);

    ctx.provider
        .autoscaling
        .attach_instances(&name, std::slice::from_ref(&job.instance_id))
        .await?;

    Ok(TaskOutcome::Completed)
}

/// Relay a dock's readiness to external consumers.
#[instrument(skip(ctx, job), fields(instance_id = %job.instance_id))]
pub async fn handle_dock_initialized(
    ctx: &TaskContext,
    job: &DockInitialized,
) -> Result<TaskOutcome, TaskError> {
    ctx.queue
        .publish_event(
            JobKind::DockInitialized.queue_name(),
            json!({
                "autoScalingGroupName": job.auto_scaling_group_name,
                "instanceId": job.instance_id,
            }),
        )
        .await?;

    Ok(TaskOutcome::Completed)
}
