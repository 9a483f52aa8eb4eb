// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AWS provider adapter (EC2, Auto Scaling, IAM).
//!
//! Every SDK failure is reduced to a [`RawProviderError`] carrying the
//! service error code and then classified, so callers only ever see
//! [`ProviderError`].

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_ec2::client::Waiters;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{Filter, ResourceType, TagSpecification};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::{ProviderError, RawProviderError, classify_provider_error};

use super::traits::*;

/// EC2 and Auto Scaling take user data base64 encoded.
fn encode_user_data(raw: Option<&str>) -> Option<String> {
    raw.map(|data| BASE64.encode(data.as_bytes()))
}

/// Classify an SDK failure, attaching `data` as context.
fn classify<E, R>(err: SdkError<E, R>, data: Option<Value>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let raw = match err.as_service_error() {
        Some(service) if service.code().is_some() => RawProviderError {
            code: service.code().map(str::to_string),
            message: service
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| DisplayErrorContext(&err).to_string()),
        },
        _ => RawProviderError::uncoded(DisplayErrorContext(&err).to_string()),
    };

    classify_provider_error(raw, data)
}

fn to_utc(value: &aws_sdk_ec2::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(value.secs(), value.subsec_nanos())
}

/// Uniform read of SDK fields, whether the service models them as required
/// (plain values) or optional.
trait SdkField<T> {
    fn or_default(self) -> T;
}

impl SdkField<String> for &str {
    fn or_default(self) -> String {
        self.to_string()
    }
}

impl SdkField<String> for Option<&str> {
    fn or_default(self) -> String {
        self.unwrap_or_default().to_string()
    }
}

impl SdkField<i32> for i32 {
    fn or_default(self) -> i32 {
        self
    }
}

impl SdkField<i32> for Option<i32> {
    fn or_default(self) -> i32 {
        self.unwrap_or_default()
    }
}

impl SdkField<Option<DateTime<Utc>>> for &aws_sdk_ec2::primitives::DateTime {
    fn or_default(self) -> Option<DateTime<Utc>> {
        to_utc(self)
    }
}

impl SdkField<Option<DateTime<Utc>>> for Option<&aws_sdk_ec2::primitives::DateTime> {
    fn or_default(self) -> Option<DateTime<Utc>> {
        self.and_then(to_utc)
    }
}

fn ec2_tag(tag: &Tag) -> aws_sdk_ec2::types::Tag {
    aws_sdk_ec2::types::Tag::builder()
        .key(&tag.key)
        .value(&tag.value)
        .build()
}

fn ec2_instance(instance: &aws_sdk_ec2::types::Instance) -> Option<ProviderInstance> {
    let state = instance
        .state()
        .and_then(|s| s.name())
        .and_then(|name| name.as_str().parse().ok())
        .unwrap_or(InstanceStatus::Pending);

    Some(ProviderInstance {
        instance_id: instance.instance_id()?.to_string(),
        image_id: instance.image_id().map(str::to_string),
        instance_type: instance.instance_type().map(|t| t.as_str().to_string()),
        private_ip_address: instance.private_ip_address().map(str::to_string),
        state,
        launch_time: instance.launch_time().and_then(to_utc),
        tags: instance
            .tags()
            .iter()
            .filter_map(|t| Some(Tag::new(t.key()?, t.value().unwrap_or_default())))
            .collect(),
    })
}

fn ec2_status(state: Option<&aws_sdk_ec2::types::InstanceState>) -> InstanceStatus {
    state
        .and_then(|s| s.name())
        .and_then(|name| name.as_str().parse().ok())
        .unwrap_or(InstanceStatus::Pending)
}

/// AWS-backed provider.
pub struct AwsProvider {
    ec2: aws_sdk_ec2::Client,
    autoscaling: aws_sdk_autoscaling::Client,
    iam: aws_sdk_iam::Client,
    template: DockTemplate,
    wait_timeout: Duration,
}

impl AwsProvider {
    /// Build clients from the standard AWS environment (credentials chain,
    /// region, profile).
    pub async fn from_env(template: DockTemplate, wait_timeout: Duration) -> Self {
        let config = aws_config::load_from_env().await;
        info!(
            region = config.region().map(|r| r.as_ref()).unwrap_or("default"),
            "AWS provider configured"
        );

        Self {
            ec2: aws_sdk_ec2::Client::new(&config),
            autoscaling: aws_sdk_autoscaling::Client::new(&config),
            iam: aws_sdk_iam::Client::new(&config),
            template,
            wait_timeout,
        }
    }

    fn waiter_failed(&self, condition: WaitCondition, err: impl std::error::Error) -> ProviderError {
        ProviderError::Unclassified(RawProviderError::uncoded(format!(
            "waiting for {} failed after up to {:?}: {}",
            condition,
            self.wait_timeout,
            DisplayErrorContext(&err)
        )))
    }
}

#[async_trait]
impl ComputeApi for AwsProvider {
    async fn create_instances(&self, request: &LaunchRequest) -> Result<Vec<ProviderInstance>> {
        let tags = [
            Tag::new(TAG_ORG, &request.org_id),
            Tag::new(TAG_ROLE, request.role.as_str()),
            Tag::new(TAG_CLUSTER, &request.cluster_id),
        ];
        let tag_spec = TagSpecification::builder()
            .resource_type(ResourceType::Instance)
            .set_tags(Some(tags.iter().map(ec2_tag).collect()))
            .build();
        let count = i32::try_from(request.count).unwrap_or(i32::MAX);

        let output = self
            .ec2
            .run_instances()
            .image_id(&self.template.image_id)
            .instance_type(self.template.instance_type.as_str().into())
            .min_count(count)
            .max_count(count)
            .client_token(&request.client_token)
            .set_key_name(self.template.key_name.clone())
            .set_security_group_ids(
                (!self.template.security_groups.is_empty())
                    .then(|| self.template.security_groups.clone()),
            )
            .set_subnet_id(self.template.subnet_id.clone())
            .set_user_data(encode_user_data(self.template.user_data.as_deref()))
            .tag_specifications(tag_spec)
            .send()
            .await
            .map_err(|e| {
                classify(
                    e,
                    Some(json!({
                        "clusterId": request.cluster_id,
                        "role": request.role.as_str(),
                        "count": request.count,
                    })),
                )
            })?;

        let instances: Vec<_> = output.instances().iter().filter_map(ec2_instance).collect();
        info!(
            cluster_id = %request.cluster_id,
            count = instances.len(),
            "Instances launched"
        );

        Ok(instances)
    }

    async fn terminate_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<InstanceStateChange>> {
        let output = self
            .ec2
            .terminate_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .map_err(|e| classify(e, Some(json!({ "instanceIds": instance_ids }))))?;

        Ok(output
            .terminating_instances()
            .iter()
            .filter_map(|change| {
                Some(InstanceStateChange {
                    instance_id: change.instance_id()?.to_string(),
                    previous_state: ec2_status(change.previous_state()),
                    current_state: ec2_status(change.current_state()),
                })
            })
            .collect())
    }

    async fn describe_instances(&self, filter: &InstanceFilter) -> Result<Vec<ProviderInstance>> {
        let mut filters = Vec::new();
        if let Some(ip) = &filter.private_ip_address {
            filters.push(Filter::builder().name("private-ip-address").values(ip).build());
        }
        if let Some(role) = filter.role {
            filters.push(
                Filter::builder()
                    .name(format!("tag:{}", TAG_ROLE))
                    .values(role.as_str())
                    .build(),
            );
        }
        if !filter.states.is_empty() {
            filters.push(
                Filter::builder()
                    .name("instance-state-name")
                    .set_values(Some(
                        filter.states.iter().map(|s| s.as_str().to_string()).collect(),
                    ))
                    .build(),
            );
        }

        let mut instances = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .ec2
                .describe_instances()
                .set_instance_ids(
                    (!filter.instance_ids.is_empty()).then(|| filter.instance_ids.clone()),
                )
                .set_filters((!filters.is_empty()).then(|| filters.clone()))
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| classify(e, None))?;

            for reservation in output.reservations() {
                instances.extend(reservation.instances().iter().filter_map(ec2_instance));
            }

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        // Role and state are filtered server side; re-check locally so the
        // result honours the filter exactly.
        instances.retain(|i| filter.matches(i));
        debug!(matched = instances.len(), "Described instances");

        Ok(instances)
    }

    async fn wait_for(&self, condition: WaitCondition, instance_ids: &[String]) -> Result<()> {
        let ids = Some(instance_ids.to_vec());
        match condition {
            WaitCondition::Exists => self
                .ec2
                .wait_until_instance_exists()
                .set_instance_ids(ids)
                .wait(self.wait_timeout)
                .await
                .map(|_| ())
                .map_err(|e| self.waiter_failed(condition, e)),
            WaitCondition::Running => self
                .ec2
                .wait_until_instance_running()
                .set_instance_ids(ids)
                .wait(self.wait_timeout)
                .await
                .map(|_| ())
                .map_err(|e| self.waiter_failed(condition, e)),
            WaitCondition::Terminated => self
                .ec2
                .wait_until_instance_terminated()
                .set_instance_ids(ids)
                .wait(self.wait_timeout)
                .await
                .map(|_| ())
                .map_err(|e| self.waiter_failed(condition, e)),
        }
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<()> {
        self.ec2
            .create_tags()
            .set_resources(Some(resource_ids.to_vec()))
            .set_tags(Some(tags.iter().map(ec2_tag).collect()))
            .send()
            .await
            .map_err(|e| classify(e, Some(json!({ "resources": resource_ids }))))?;

        Ok(())
    }
}

#[async_trait]
impl AutoScalingApi for AwsProvider {
    async fn create_launch_configuration(&self, spec: &LaunchConfigurationSpec) -> Result<()> {
        self.autoscaling
            .create_launch_configuration()
            .launch_configuration_name(&spec.name)
            .image_id(&spec.image_id)
            .instance_type(&spec.instance_type)
            .set_key_name(spec.key_name.clone())
            .set_security_groups(
                (!spec.security_groups.is_empty()).then(|| spec.security_groups.clone()),
            )
            .set_user_data(encode_user_data(spec.user_data.as_deref()))
            .send()
            .await
            .map_err(|e| classify(e, Some(json!({ "launchConfigurationName": spec.name }))))?;

        Ok(())
    }

    async fn describe_launch_configurations(
        &self,
        names: &[String],
    ) -> Result<Vec<LaunchConfiguration>> {
        let mut configurations = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .autoscaling
                .describe_launch_configurations()
                .set_launch_configuration_names((!names.is_empty()).then(|| names.to_vec()))
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| classify(e, None))?;

            configurations.extend(output.launch_configurations().iter().map(|lc| {
                LaunchConfiguration {
                    name: lc.launch_configuration_name().or_default(),
                    image_id: lc.image_id().or_default(),
                    instance_type: lc.instance_type().or_default(),
                    created_time: lc.created_time().or_default(),
                }
            }));

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(configurations)
    }

    async fn delete_launch_configuration(&self, name: &str) -> Result<()> {
        self.autoscaling
            .delete_launch_configuration()
            .launch_configuration_name(name)
            .send()
            .await
            .map_err(|e| classify(e, Some(json!({ "launchConfigurationName": name }))))?;

        Ok(())
    }

    async fn create_auto_scaling_group(&self, spec: &GroupSpec) -> Result<()> {
        let mut tags = Vec::with_capacity(spec.tags.len());
        for tag in &spec.tags {
            let built = aws_sdk_autoscaling::types::Tag::builder()
                .key(&tag.key)
                .value(&tag.value)
                .resource_id(&spec.name)
                .resource_type("auto-scaling-group")
                .propagate_at_launch(true)
                .build()
                .map_err(|e| ProviderError::Unclassified(RawProviderError::uncoded(e.to_string())))?;
            tags.push(built);
        }

        self.autoscaling
            .create_auto_scaling_group()
            .auto_scaling_group_name(&spec.name)
            .launch_configuration_name(&spec.launch_configuration_name)
            .min_size(spec.min_size)
            .max_size(spec.max_size)
            .desired_capacity(spec.desired_capacity)
            .set_vpc_zone_identifier(spec.vpc_zone_identifier.clone())
            .set_tags((!tags.is_empty()).then_some(tags))
            .send()
            .await
            .map_err(|e| classify(e, Some(json!({ "autoScalingGroupName": spec.name }))))?;

        Ok(())
    }

    async fn update_auto_scaling_group(&self, update: &GroupUpdate) -> Result<()> {
        self.autoscaling
            .update_auto_scaling_group()
            .auto_scaling_group_name(&update.name)
            .set_desired_capacity(update.desired_capacity)
            .set_min_size(update.min_size)
            .set_max_size(update.max_size)
            .send()
            .await
            .map_err(|e| {
                classify(
                    e,
                    Some(json!({
                        "autoScalingGroupName": update.name,
                        "desiredCapacity": update.desired_capacity,
                        "minSize": update.min_size,
                        "maxSize": update.max_size,
                    })),
                )
            })?;

        Ok(())
    }

    async fn delete_auto_scaling_group(&self, name: &str, force_delete: bool) -> Result<()> {
        self.autoscaling
            .delete_auto_scaling_group()
            .auto_scaling_group_name(name)
            .force_delete(force_delete)
            .send()
            .await
            .map_err(|e| classify(e, Some(json!({ "autoScalingGroupName": name }))))?;

        Ok(())
    }

    async fn describe_auto_scaling_groups(
        &self,
        names: &[String],
    ) -> Result<Vec<AutoScalingGroup>> {
        let mut groups = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .autoscaling
                .describe_auto_scaling_groups()
                .set_auto_scaling_group_names((!names.is_empty()).then(|| names.to_vec()))
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| classify(e, None))?;

            groups.extend(output.auto_scaling_groups().iter().map(|g| AutoScalingGroup {
                name: g.auto_scaling_group_name().or_default(),
                launch_configuration_name: g.launch_configuration_name().map(str::to_string),
                min_size: g.min_size().or_default(),
                max_size: g.max_size().or_default(),
                desired_capacity: g.desired_capacity().or_default(),
                instance_ids: g
                    .instances()
                    .iter()
                    .map(|i| i.instance_id().or_default())
                    .collect(),
            }));

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(groups)
    }

    async fn attach_instances(&self, group_name: &str, instance_ids: &[String]) -> Result<()> {
        self.autoscaling
            .attach_instances()
            .auto_scaling_group_name(group_name)
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .map_err(|e| {
                classify(
                    e,
                    Some(json!({
                        "autoScalingGroupName": group_name,
                        "instanceIds": instance_ids,
                    })),
                )
            })?;

        Ok(())
    }
}

#[async_trait]
impl IdentityApi for AwsProvider {
    async fn list_users(&self, path_prefix: Option<&str>) -> Result<Vec<IdentityUser>> {
        let mut users = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let output = self
                .iam
                .list_users()
                .set_path_prefix(path_prefix.map(str::to_string))
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|e| classify(e, None))?;

            for user in output.users() {
                let created: Option<DateTime<Utc>> = user.create_date().or_default();
                let Some(created_at) = created else {
                    continue;
                };
                users.push(IdentityUser {
                    user_name: user.user_name().or_default(),
                    path: user.path().or_default(),
                    created_at,
                });
            }

            match output.marker() {
                Some(next) if !next.is_empty() => marker = Some(next.to_string()),
                _ => break,
            }
        }

        Ok(users)
    }

    async fn delete_all_user_policies(&self, user_name: &str) -> Result<()> {
        let context = || Some(json!({ "userName": user_name }));

        let inline = self
            .iam
            .list_user_policies()
            .user_name(user_name)
            .send()
            .await
            .map_err(|e| classify(e, context()))?;
        for policy_name in inline.policy_names() {
            self.iam
                .delete_user_policy()
                .user_name(user_name)
                .policy_name(policy_name)
                .send()
                .await
                .map_err(|e| classify(e, context()))?;
        }

        let attached = self
            .iam
            .list_attached_user_policies()
            .user_name(user_name)
            .send()
            .await
            .map_err(|e| classify(e, context()))?;
        for policy in attached.attached_policies() {
            let Some(arn) = policy.policy_arn() else {
                continue;
            };
            self.iam
                .detach_user_policy()
                .user_name(user_name)
                .policy_arn(arn)
                .send()
                .await
                .map_err(|e| classify(e, context()))?;
        }

        Ok(())
    }

    async fn delete_all_user_access_keys(&self, user_name: &str) -> Result<()> {
        let context = || Some(json!({ "userName": user_name }));

        let keys = self
            .iam
            .list_access_keys()
            .user_name(user_name)
            .send()
            .await
            .map_err(|e| classify(e, context()))?;
        for key in keys.access_key_metadata() {
            let Some(access_key_id) = key.access_key_id() else {
                continue;
            };
            self.iam
                .delete_access_key()
                .user_name(user_name)
                .access_key_id(access_key_id)
                .send()
                .await
                .map_err(|e| classify(e, context()))?;
        }

        Ok(())
    }

    async fn delete_user(&self, user_name: &str) -> Result<()> {
        self.iam
            .delete_user()
            .user_name(user_name)
            .send()
            .await
            .map_err(|e| classify(e, Some(json!({ "userName": user_name }))))?;

        Ok(())
    }
}
