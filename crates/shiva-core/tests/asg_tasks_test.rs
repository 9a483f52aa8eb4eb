// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for per-organization auto scaling groups.

mod common;

use chrono::Utc;
use common::*;
use serde_json::json;

use shiva_core::error::RawProviderError;
use shiva_core::jobs::JobKind;
use shiva_core::tasks::{self, TaskError, TaskOutcome, TaskSettings};

const GROUP: &str = "asg-production-42";

#[tokio::test]
async fn test_create_builds_launch_configuration_then_group() {
    let ctx = TestContext::new().await;

    let outcome = ctx
        .run(JobKind::AsgCreate, json!({ "githubId": "42" }))
        .await
        .unwrap();
    assert_eq!(outcome, TaskOutcome::Completed);

    assert_eq!(
        operations(&ctx.provider).await,
        vec!["create_launch_configuration", "create_auto_scaling_group"]
    );

    let settings = TaskSettings::default();
    let lc = ctx.provider.launch_configuration(GROUP).await.unwrap();
    assert_eq!(lc.image_id, settings.dock.image_id);
    let group = ctx.provider.group(GROUP).await.unwrap();
    assert_eq!(group.launch_configuration_name.as_deref(), Some(GROUP));
    assert_eq!(
        (group.min_size, group.max_size, group.desired_capacity),
        (settings.asg_min_size, settings.asg_max_size, settings.asg_desired_capacity)
    );
}

#[tokio::test]
async fn test_create_again_is_already_satisfied() {
    let ctx = TestContext::new().await;
    ctx.run(JobKind::AsgCreate, json!({ "githubId": "42" }))
        .await
        .unwrap();

    let again = ctx
        .run(JobKind::AsgCreate, json!({ "githubId": "42" }))
        .await
        .unwrap();
    assert!(matches!(again, TaskOutcome::AlreadySatisfied(_)));
}

#[tokio::test]
async fn test_create_finishes_group_when_only_launch_configuration_exists() {
    let ctx = TestContext::new().await;
    ctx.provider
        .fail_next(
            "create_auto_scaling_group",
            RawProviderError::new("Throttling", "Rate exceeded"),
        )
        .await;

    let err = ctx
        .run(JobKind::AsgCreate, json!({ "githubId": "42" }))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(ctx.provider.launch_configuration(GROUP).await.is_some());
    assert!(ctx.provider.group(GROUP).await.is_none());

    let retried = ctx
        .run(JobKind::AsgCreate, json!({ "githubId": "42" }))
        .await
        .unwrap();
    assert_eq!(retried, TaskOutcome::Completed);
    assert!(ctx.provider.group(GROUP).await.is_some());
}

#[tokio::test]
async fn test_legacy_create_queues_are_bound() {
    for queue in ["shiva-asg-create", "shiva-asg-provision"] {
        let ctx = TestContext::new().await;

        tasks::execute(&ctx.tasks, &delivery(queue, json!({ "githubId": "42" })))
            .await
            .unwrap();

        assert!(ctx.provider.group(GROUP).await.is_some(), "{}", queue);
    }
}

#[tokio::test]
async fn test_update_changes_only_given_sizes() {
    let ctx = TestContext::new().await;
    ctx.run(JobKind::AsgCreate, json!({ "githubId": "42" }))
        .await
        .unwrap();

    ctx.run(
        JobKind::AsgUpdate,
        json!({ "githubId": "42", "data": { "desiredCapacity": 7, "maxSize": 9 } }),
    )
    .await
    .unwrap();

    let group = ctx.provider.group(GROUP).await.unwrap();
    assert_eq!(group.desired_capacity, 7);
    assert_eq!(group.max_size, 9);
    assert_eq!(group.min_size, TaskSettings::default().asg_min_size);
}

#[tokio::test]
async fn test_update_of_missing_group_is_fatal() {
    let ctx = TestContext::new().await;

    let err = ctx
        .run(
            JobKind::AsgUpdate,
            json!({ "githubId": "42", "data": { "minSize": 1 } }),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TaskError::Provider(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_update_without_sizes_is_rejected_before_provider_call() {
    let ctx = TestContext::new().await;

    let err = ctx
        .run(JobKind::AsgUpdate, json!({ "githubId": "42", "data": {} }))
        .await
        .unwrap_err();

    assert!(matches!(err, TaskError::Validation(_)));
    assert!(ctx.provider.calls().await.is_empty());
}

#[tokio::test]
async fn test_delete_removes_group_then_launch_configuration() {
    let ctx = TestContext::new().await;
    ctx.run(JobKind::AsgCreate, json!({ "githubId": "42" }))
        .await
        .unwrap();

    let outcome = ctx
        .run(JobKind::AsgDelete, json!({ "githubId": "42" }))
        .await
        .unwrap();
    assert_eq!(outcome, TaskOutcome::Completed);
    assert!(ctx.provider.group(GROUP).await.is_none());
    assert!(ctx.provider.launch_configuration(GROUP).await.is_none());

    let ops = operations(&ctx.provider).await;
    assert_eq!(
        &ops[ops.len() - 2..],
        &["delete_auto_scaling_group", "delete_launch_configuration"]
    );

    let again = ctx
        .run(JobKind::AsgDelete, json!({ "githubId": "42" }))
        .await
        .unwrap();
    assert!(matches!(again, TaskOutcome::AlreadySatisfied(_)));
}

#[tokio::test]
async fn test_delete_with_launch_configuration_in_use_is_retryable() {
    let ctx = TestContext::new().await;
    ctx.run(JobKind::AsgCreate, json!({ "githubId": "42" }))
        .await
        .unwrap();
    ctx.provider
        .fail_next(
            "delete_launch_configuration",
            RawProviderError::new("ResourceInUse", "Cannot delete launch configuration"),
        )
        .await;

    let err = ctx
        .run(JobKind::AsgDelete, json!({ "githubId": "42" }))
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert!(ctx.provider.group(GROUP).await.is_none());
    assert!(ctx.provider.launch_configuration(GROUP).await.is_some());
}

#[tokio::test]
async fn test_attach_adds_instance_to_group() {
    let ctx = TestContext::new().await;
    ctx.run(JobKind::AsgCreate, json!({ "githubId": "42" }))
        .await
        .unwrap();
    ctx.provider
        .add_instance(provider_instance("i-1", "10.0.0.10", "42", Utc::now()))
        .await;

    ctx.run(
        JobKind::OrgInstanceAttach,
        json!({ "githubId": "42", "instanceId": "i-1" }),
    )
    .await
    .unwrap();

    let group = ctx.provider.group(GROUP).await.unwrap();
    assert_eq!(group.instance_ids, vec!["i-1"]);
}

#[tokio::test]
async fn test_dock_initialized_publishes_event() {
    let ctx = TestContext::new().await;

    ctx.run(
        JobKind::DockInitialized,
        json!({ "autoScalingGroupName": GROUP, "instanceId": "i-1" }),
    )
    .await
    .unwrap();

    assert_eq!(
        ctx.queue.events().await,
        vec![(
            "dock.initialized".to_string(),
            json!({ "autoScalingGroupName": GROUP, "instanceId": "i-1" })
        )]
    );
    assert!(ctx.provider.calls().await.is_empty());
}
