// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock provider for testing.
//!
//! Keeps instances, groups, launch configurations and identity users in
//! memory and answers with the same error codes the real provider uses, so
//! classification and the handlers' benign-outcome rules are exercised
//! unchanged. Failures can be scripted per operation and every call is
//! recorded for ordering assertions.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{ProviderError, RawProviderError, classify_provider_error};

use super::traits::*;

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// Operation name, e.g. `delete_user`.
    pub operation: &'static str,
    /// Main argument of the call (ids joined with commas).
    pub target: String,
}

#[derive(Debug)]
struct MockUser {
    user: IdentityUser,
    policies: usize,
    access_keys: usize,
}

#[derive(Debug, Default)]
struct MockState {
    instances: BTreeMap<String, ProviderInstance>,
    client_tokens: HashMap<String, Vec<String>>,
    launch_configurations: BTreeMap<String, LaunchConfiguration>,
    groups: BTreeMap<String, AutoScalingGroup>,
    users: BTreeMap<String, MockUser>,
    next_instance: u64,
}

/// In-memory provider.
pub struct MockProvider {
    state: Mutex<MockState>,
    calls: Mutex<Vec<ProviderCall>>,
    failures: Mutex<HashMap<&'static str, VecDeque<RawProviderError>>>,
    /// Image reported for launched instances.
    pub image_id: String,
    /// Instance type reported for launched instances.
    pub instance_type: String,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn error(code: &str, message: impl Into<String>) -> ProviderError {
    classify_provider_error(RawProviderError::new(code, message), None)
}

fn instance_not_found(id: &str) -> ProviderError {
    error(
        "InvalidInstanceID.NotFound",
        format!("The instance ID '{}' does not exist", id),
    )
}

fn no_such_user(name: &str) -> ProviderError {
    error(
        "NoSuchEntity",
        format!("The user with name {} cannot be found.", name),
    )
}

impl MockProvider {
    /// Create an empty mock provider.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            image_id: "ami-mock".to_string(),
            instance_type: "t2.medium".to_string(),
        }
    }

    /// Make the next call to `operation` fail with `raw` (classified as the
    /// real adapter would). Queued failures are consumed in order.
    pub async fn fail_next(&self, operation: &'static str, raw: RawProviderError) {
        self.failures
            .lock()
            .await
            .entry(operation)
            .or_default()
            .push_back(raw);
    }

    /// Every call made so far, in order.
    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().await.clone()
    }

    /// Calls of one operation, in order.
    pub async fn calls_to(&self, operation: &str) -> Vec<ProviderCall> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    /// Seed an instance.
    pub async fn add_instance(&self, instance: ProviderInstance) {
        let mut state = self.state.lock().await;
        state
            .instances
            .insert(instance.instance_id.clone(), instance);
    }

    /// Look up an instance.
    pub async fn instance(&self, instance_id: &str) -> Option<ProviderInstance> {
        self.state.lock().await.instances.get(instance_id).cloned()
    }

    /// Seed an identity user with some policies and access keys.
    pub async fn add_user(
        &self,
        user_name: &str,
        created_at: DateTime<Utc>,
        policies: usize,
        access_keys: usize,
    ) {
        let mut state = self.state.lock().await;
        state.users.insert(
            user_name.to_string(),
            MockUser {
                user: IdentityUser {
                    user_name: user_name.to_string(),
                    path: "/".to_string(),
                    created_at,
                },
                policies,
                access_keys,
            },
        );
    }

    /// Names of the remaining identity users.
    pub async fn user_names(&self) -> Vec<String> {
        self.state.lock().await.users.keys().cloned().collect()
    }

    /// Look up a group.
    pub async fn group(&self, name: &str) -> Option<AutoScalingGroup> {
        self.state.lock().await.groups.get(name).cloned()
    }

    /// Look up a launch configuration.
    pub async fn launch_configuration(&self, name: &str) -> Option<LaunchConfiguration> {
        self.state
            .lock()
            .await
            .launch_configurations
            .get(name)
            .cloned()
    }

    /// Record the call and return a scripted failure, if one is queued.
    async fn enter(&self, operation: &'static str, target: impl Into<String>) -> Result<()> {
        self.calls.lock().await.push(ProviderCall {
            operation,
            target: target.into(),
        });

        let scripted = self
            .failures
            .lock()
            .await
            .get_mut(operation)
            .and_then(VecDeque::pop_front);

        match scripted {
            Some(raw) => Err(classify_provider_error(raw, None)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ComputeApi for MockProvider {
    async fn create_instances(&self, request: &LaunchRequest) -> Result<Vec<ProviderInstance>> {
        self.enter("create_instances", &request.client_token).await?;
        let mut state = self.state.lock().await;

        if let Some(ids) = state.client_tokens.get(&request.client_token) {
            return Ok(ids
                .iter()
                .filter_map(|id| state.instances.get(id).cloned())
                .collect());
        }

        let now = Utc::now();
        let mut created = Vec::with_capacity(request.count as usize);
        for _ in 0..request.count {
            state.next_instance += 1;
            let n = state.next_instance;
            let instance = ProviderInstance {
                instance_id: format!("i-{:017x}", n),
                image_id: Some(self.image_id.clone()),
                instance_type: Some(self.instance_type.clone()),
                private_ip_address: Some(format!("10.0.{}.{}", n / 250, n % 250 + 4)),
                state: InstanceStatus::Running,
                launch_time: Some(now),
                tags: vec![
                    Tag::new(TAG_ORG, &request.org_id),
                    Tag::new(TAG_ROLE, request.role.as_str()),
                    Tag::new(TAG_CLUSTER, &request.cluster_id),
                ],
            };
            state
                .instances
                .insert(instance.instance_id.clone(), instance.clone());
            created.push(instance);
        }

        state.client_tokens.insert(
            request.client_token.clone(),
            created.iter().map(|i| i.instance_id.clone()).collect(),
        );

        Ok(created)
    }

    async fn terminate_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<InstanceStateChange>> {
        self.enter("terminate_instances", instance_ids.join(","))
            .await?;
        let mut state = self.state.lock().await;

        if let Some(missing) = instance_ids
            .iter()
            .find(|id| !state.instances.contains_key(*id))
        {
            return Err(instance_not_found(missing));
        }

        let mut changes = Vec::with_capacity(instance_ids.len());
        for id in instance_ids {
            if let Some(instance) = state.instances.get_mut(id) {
                changes.push(InstanceStateChange {
                    instance_id: id.clone(),
                    previous_state: instance.state,
                    current_state: InstanceStatus::Terminated,
                });
                instance.state = InstanceStatus::Terminated;
            }
        }

        Ok(changes)
    }

    async fn describe_instances(&self, filter: &InstanceFilter) -> Result<Vec<ProviderInstance>> {
        let target = filter
            .private_ip_address
            .clone()
            .unwrap_or_else(|| filter.instance_ids.join(","));
        self.enter("describe_instances", target).await?;
        let state = self.state.lock().await;

        if let Some(missing) = filter
            .instance_ids
            .iter()
            .find(|id| !state.instances.contains_key(*id))
        {
            return Err(instance_not_found(missing));
        }

        Ok(state
            .instances
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect())
    }

    async fn wait_for(&self, condition: WaitCondition, instance_ids: &[String]) -> Result<()> {
        self.enter("wait_for", instance_ids.join(",")).await?;
        let state = self.state.lock().await;

        let satisfied = instance_ids.iter().all(|id| {
            state.instances.get(id).is_some_and(|i| match condition {
                WaitCondition::Exists => true,
                WaitCondition::Running => i.state == InstanceStatus::Running,
                WaitCondition::Terminated => i.state == InstanceStatus::Terminated,
            })
        });

        if satisfied {
            Ok(())
        } else {
            Err(ProviderError::Unclassified(RawProviderError::uncoded(
                format!("waiter {} timed out", condition),
            )))
        }
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<()> {
        self.enter("create_tags", resource_ids.join(",")).await?;
        let mut state = self.state.lock().await;

        if let Some(missing) = resource_ids
            .iter()
            .find(|id| !state.instances.contains_key(*id))
        {
            return Err(instance_not_found(missing));
        }

        for id in resource_ids {
            if let Some(instance) = state.instances.get_mut(id) {
                for tag in tags {
                    instance.tags.retain(|t| t.key != tag.key);
                    instance.tags.push(tag.clone());
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl AutoScalingApi for MockProvider {
    async fn create_launch_configuration(&self, spec: &LaunchConfigurationSpec) -> Result<()> {
        self.enter("create_launch_configuration", &spec.name).await?;
        let mut state = self.state.lock().await;

        if state.launch_configurations.contains_key(&spec.name) {
            return Err(error(
                "AlreadyExists",
                format!("Launch Configuration by this name already exists - {}", spec.name),
            ));
        }

        state.launch_configurations.insert(
            spec.name.clone(),
            LaunchConfiguration {
                name: spec.name.clone(),
                image_id: spec.image_id.clone(),
                instance_type: spec.instance_type.clone(),
                created_time: Some(Utc::now()),
            },
        );

        Ok(())
    }

    async fn describe_launch_configurations(
        &self,
        names: &[String],
    ) -> Result<Vec<LaunchConfiguration>> {
        self.enter("describe_launch_configurations", names.join(","))
            .await?;
        let state = self.state.lock().await;

        Ok(state
            .launch_configurations
            .values()
            .filter(|lc| names.is_empty() || names.contains(&lc.name))
            .cloned()
            .collect())
    }

    async fn delete_launch_configuration(&self, name: &str) -> Result<()> {
        self.enter("delete_launch_configuration", name).await?;
        let mut state = self.state.lock().await;

        if !state.launch_configurations.contains_key(name) {
            return Err(error(
                "ValidationError",
                format!("Launch configuration name not found - {}", name),
            ));
        }
        if state
            .groups
            .values()
            .any(|g| g.launch_configuration_name.as_deref() == Some(name))
        {
            return Err(error(
                "ResourceInUse",
                format!("Cannot delete launch configuration {} because it is attached to AutoScalingGroup", name),
            ));
        }

        state.launch_configurations.remove(name);
        Ok(())
    }

    async fn create_auto_scaling_group(&self, spec: &GroupSpec) -> Result<()> {
        self.enter("create_auto_scaling_group", &spec.name).await?;
        let mut state = self.state.lock().await;

        if state.groups.contains_key(&spec.name) {
            return Err(error(
                "AlreadyExists",
                format!("AutoScalingGroup by this name already exists - {}", spec.name),
            ));
        }
        if !state
            .launch_configurations
            .contains_key(&spec.launch_configuration_name)
        {
            return Err(error(
                "ValidationError",
                format!(
                    "Launch configuration name not found - {}",
                    spec.launch_configuration_name
                ),
            ));
        }

        state.groups.insert(
            spec.name.clone(),
            AutoScalingGroup {
                name: spec.name.clone(),
                launch_configuration_name: Some(spec.launch_configuration_name.clone()),
                min_size: spec.min_size,
                max_size: spec.max_size,
                desired_capacity: spec.desired_capacity,
                instance_ids: Vec::new(),
            },
        );

        Ok(())
    }

    async fn update_auto_scaling_group(&self, update: &GroupUpdate) -> Result<()> {
        self.enter("update_auto_scaling_group", &update.name).await?;
        let mut state = self.state.lock().await;

        let Some(group) = state.groups.get_mut(&update.name) else {
            return Err(error(
                "ValidationError",
                format!("AutoScalingGroup name not found - {}", update.name),
            ));
        };

        if let Some(v) = update.min_size {
            group.min_size = v;
        }
        if let Some(v) = update.max_size {
            group.max_size = v;
        }
        if let Some(v) = update.desired_capacity {
            group.desired_capacity = v;
        }

        Ok(())
    }

    async fn delete_auto_scaling_group(&self, name: &str, force_delete: bool) -> Result<()> {
        self.enter("delete_auto_scaling_group", name).await?;
        let mut state = self.state.lock().await;

        let Some(group) = state.groups.get(name) else {
            return Err(error(
                "ValidationError",
                format!("AutoScalingGroup name not found - {}", name),
            ));
        };
        if !force_delete && !group.instance_ids.is_empty() {
            return Err(error(
                "ResourceInUse",
                format!("You cannot delete an AutoScalingGroup while there are instances still in the group - {}", name),
            ));
        }

        let members = group.instance_ids.clone();
        for id in members {
            if let Some(instance) = state.instances.get_mut(&id) {
                instance.state = InstanceStatus::Terminated;
            }
        }
        state.groups.remove(name);

        Ok(())
    }

    async fn describe_auto_scaling_groups(
        &self,
        names: &[String],
    ) -> Result<Vec<AutoScalingGroup>> {
        self.enter("describe_auto_scaling_groups", names.join(","))
            .await?;
        let state = self.state.lock().await;

        Ok(state
            .groups
            .values()
            .filter(|g| names.is_empty() || names.contains(&g.name))
            .cloned()
            .collect())
    }

    async fn attach_instances(&self, group_name: &str, instance_ids: &[String]) -> Result<()> {
        self.enter(
            "attach_instances",
            format!("{}:{}", group_name, instance_ids.join(",")),
        )
        .await?;
        let mut state = self.state.lock().await;

        if let Some(missing) = instance_ids
            .iter()
            .find(|id| !state.instances.contains_key(*id))
        {
            return Err(error(
                "ValidationError",
                format!("Instance {} is not in correct state", missing),
            ));
        }

        let Some(group) = state.groups.get_mut(group_name) else {
            return Err(error(
                "ValidationError",
                format!("AutoScalingGroup name not found - {}", group_name),
            ));
        };

        for id in instance_ids {
            if !group.instance_ids.contains(id) {
                group.instance_ids.push(id.clone());
                group.desired_capacity += 1;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl IdentityApi for MockProvider {
    async fn list_users(&self, path_prefix: Option<&str>) -> Result<Vec<IdentityUser>> {
        self.enter("list_users", path_prefix.unwrap_or("/")).await?;
        let state = self.state.lock().await;

        Ok(state
            .users
            .values()
            .filter(|u| path_prefix.is_none_or(|p| u.user.path.starts_with(p)))
            .map(|u| u.user.clone())
            .collect())
    }

    async fn delete_all_user_policies(&self, user_name: &str) -> Result<()> {
        self.enter("delete_all_user_policies", user_name).await?;
        let mut state = self.state.lock().await;

        let user = state
            .users
            .get_mut(user_name)
            .ok_or_else(|| no_such_user(user_name))?;
        user.policies = 0;
        Ok(())
    }

    async fn delete_all_user_access_keys(&self, user_name: &str) -> Result<()> {
        self.enter("delete_all_user_access_keys", user_name).await?;
        let mut state = self.state.lock().await;

        let user = state
            .users
            .get_mut(user_name)
            .ok_or_else(|| no_such_user(user_name))?;
        user.access_keys = 0;
        Ok(())
    }

    async fn delete_user(&self, user_name: &str) -> Result<()> {
        self.enter("delete_user", user_name).await?;
        let mut state = self.state.lock().await;

        let user = state
            .users
            .get(user_name)
            .ok_or_else(|| no_such_user(user_name))?;
        if user.policies > 0 || user.access_keys > 0 {
            return Err(error(
                "DeleteConflict",
                "Cannot delete entity, must delete policies and access keys first.",
            ));
        }

        state.users.remove(user_name);
        Ok(())
    }
}
