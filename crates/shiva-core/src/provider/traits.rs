// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider trait definitions and the shapes they exchange.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ProviderError;
use crate::persistence::InstanceRole;

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Tag key carrying the organization id.
pub const TAG_ORG: &str = "org";
/// Tag key carrying the instance role.
pub const TAG_ROLE: &str = "role";
/// Tag key carrying the owning cluster.
pub const TAG_CLUSTER: &str = "cluster";
/// Display name tag.
pub const TAG_NAME: &str = "Name";

// ============================================================================
// Compute
// ============================================================================

/// Provider-side instance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum InstanceStatus {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceStatus {
    /// Provider name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "shutting-down" => Ok(Self::ShuttingDown),
            "terminated" => Ok(Self::Terminated),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown instance state '{}'", other)),
        }
    }
}

/// How docks are launched: image, type and placement shared by direct
/// launches and launch configurations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockTemplate {
    /// Image id.
    pub image_id: String,
    /// Instance type.
    pub instance_type: String,
    /// Key pair name.
    pub key_name: Option<String>,
    /// Security group ids.
    pub security_groups: Vec<String>,
    /// Subnet for direct launches; also the group's VPC zone.
    pub subnet_id: Option<String>,
    /// Raw user data script. Adapters encode it as the provider requires.
    pub user_data: Option<String>,
}

/// A key/value tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

impl Tag {
    /// Create a tag.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Request for new instances.
///
/// Image, instance type and network placement are properties of the adapter;
/// the request only says whose instances these are and how many.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Cluster the instances will join.
    pub cluster_id: String,
    /// Organization owning the cluster.
    pub org_id: String,
    /// Role of every instance in the request.
    pub role: InstanceRole,
    /// Number of instances, at least one.
    pub count: u32,
    /// Idempotency key handed to the provider. Repeating a request with the
    /// same token yields the instances of the first request.
    pub client_token: String,
}

/// An instance as the provider describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInstance {
    /// Provider-assigned id.
    pub instance_id: String,
    /// Image the instance was launched from.
    pub image_id: Option<String>,
    /// Instance type.
    pub instance_type: Option<String>,
    /// Private address, once assigned.
    pub private_ip_address: Option<String>,
    /// Current state.
    pub state: InstanceStatus,
    /// Launch time.
    pub launch_time: Option<DateTime<Utc>>,
    /// Tags on the instance.
    pub tags: Vec<Tag>,
}

impl ProviderInstance {
    /// Value of a tag, if present.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

/// Filter for [`ComputeApi::describe_instances`]. Empty fields match
/// everything; set fields are combined with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    /// Only these instance ids.
    pub instance_ids: Vec<String>,
    /// Only the instance holding this private address.
    pub private_ip_address: Option<String>,
    /// Only instances tagged with this role.
    pub role: Option<InstanceRole>,
    /// Only instances in one of these states.
    pub states: Vec<InstanceStatus>,
}

impl InstanceFilter {
    /// Match a set of instance ids.
    pub fn by_ids(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            instance_ids: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Match by private address.
    pub fn by_private_ip(address: impl Into<String>) -> Self {
        Self {
            private_ip_address: Some(address.into()),
            ..Self::default()
        }
    }

    /// Match running instances with the given role tag.
    pub fn running(role: InstanceRole) -> Self {
        Self {
            role: Some(role),
            states: vec![InstanceStatus::Running],
            ..Self::default()
        }
    }

    /// Whether `instance` satisfies the filter.
    pub fn matches(&self, instance: &ProviderInstance) -> bool {
        (self.instance_ids.is_empty() || self.instance_ids.contains(&instance.instance_id))
            && self
                .private_ip_address
                .as_ref()
                .is_none_or(|ip| instance.private_ip_address.as_ref() == Some(ip))
            && self
                .role
                .is_none_or(|role| instance.tag(TAG_ROLE) == Some(role.as_str()))
            && (self.states.is_empty() || self.states.contains(&instance.state))
    }
}

/// State change reported by [`ComputeApi::terminate_instances`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStateChange {
    /// Instance id.
    pub instance_id: String,
    /// State before the call.
    pub previous_state: InstanceStatus,
    /// State after the call.
    pub current_state: InstanceStatus,
}

/// Condition awaited by [`ComputeApi::wait_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    /// The instances are visible to describe calls.
    Exists,
    /// The instances are running.
    Running,
    /// The instances are terminated.
    Terminated,
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exists => "instanceExists",
            Self::Running => "instanceRunning",
            Self::Terminated => "instanceTerminated",
        })
    }
}

/// Compute instance operations.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Launch `request.count` instances tagged with org, role and cluster.
    async fn create_instances(&self, request: &LaunchRequest) -> Result<Vec<ProviderInstance>>;

    /// Terminate instances whatever their current state. Unknown ids fail
    /// with an error whose `is_not_found()` is true.
    async fn terminate_instances(&self, instance_ids: &[String])
    -> Result<Vec<InstanceStateChange>>;

    /// Describe instances matching `filter`.
    async fn describe_instances(&self, filter: &InstanceFilter) -> Result<Vec<ProviderInstance>>;

    /// Block until `condition` holds for every instance in `instance_ids`,
    /// bounded by the adapter's wait timeout.
    async fn wait_for(&self, condition: WaitCondition, instance_ids: &[String]) -> Result<()>;

    /// Add or overwrite tags on resources.
    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<()>;
}

// ============================================================================
// Auto scaling
// ============================================================================

/// Launch configuration to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfigurationSpec {
    /// Configuration name.
    pub name: String,
    /// Image id.
    pub image_id: String,
    /// Instance type.
    pub instance_type: String,
    /// Key pair name.
    pub key_name: Option<String>,
    /// Security group ids.
    pub security_groups: Vec<String>,
    /// Raw (not yet encoded) user data.
    pub user_data: Option<String>,
}

/// Launch configuration as described by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfiguration {
    /// Configuration name.
    pub name: String,
    /// Image id.
    pub image_id: String,
    /// Instance type.
    pub instance_type: String,
    /// Creation time.
    pub created_time: Option<DateTime<Utc>>,
}

/// Group to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    /// Group name.
    pub name: String,
    /// Launch configuration used for new instances.
    pub launch_configuration_name: String,
    /// Minimum size.
    pub min_size: i32,
    /// Maximum size.
    pub max_size: i32,
    /// Desired capacity.
    pub desired_capacity: i32,
    /// Comma separated subnet ids.
    pub vpc_zone_identifier: Option<String>,
    /// Tags propagated to launched instances.
    pub tags: Vec<Tag>,
}

/// Sizing change for an existing group. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupUpdate {
    /// Group name.
    pub name: String,
    /// New desired capacity.
    pub desired_capacity: Option<i32>,
    /// New minimum size.
    pub min_size: Option<i32>,
    /// New maximum size.
    pub max_size: Option<i32>,
}

/// Group as described by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoScalingGroup {
    /// Group name.
    pub name: String,
    /// Launch configuration, if the group uses one.
    pub launch_configuration_name: Option<String>,
    /// Minimum size.
    pub min_size: i32,
    /// Maximum size.
    pub max_size: i32,
    /// Desired capacity.
    pub desired_capacity: i32,
    /// Member instances.
    pub instance_ids: Vec<String>,
}

/// Auto scaling group and launch configuration operations.
#[async_trait]
pub trait AutoScalingApi: Send + Sync {
    /// Create a launch configuration. Existing names fail with `AlreadyExists`.
    async fn create_launch_configuration(&self, spec: &LaunchConfigurationSpec) -> Result<()>;

    /// Describe launch configurations by name; an empty list means all.
    async fn describe_launch_configurations(
        &self,
        names: &[String],
    ) -> Result<Vec<LaunchConfiguration>>;

    /// Delete a launch configuration.
    async fn delete_launch_configuration(&self, name: &str) -> Result<()>;

    /// Create a group. Existing names fail with `AlreadyExists`.
    async fn create_auto_scaling_group(&self, spec: &GroupSpec) -> Result<()>;

    /// Change a group's sizing.
    async fn update_auto_scaling_group(&self, update: &GroupUpdate) -> Result<()>;

    /// Delete a group. With `force_delete` its instances are terminated too.
    async fn delete_auto_scaling_group(&self, name: &str, force_delete: bool) -> Result<()>;

    /// Describe groups by name; an empty list means all.
    async fn describe_auto_scaling_groups(&self, names: &[String])
    -> Result<Vec<AutoScalingGroup>>;

    /// Attach running instances to a group.
    async fn attach_instances(&self, group_name: &str, instance_ids: &[String]) -> Result<()>;
}

// ============================================================================
// Identity
// ============================================================================

/// An identity user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityUser {
    /// User name.
    pub user_name: String,
    /// Path the user lives under.
    pub path: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Identity user operations.
///
/// A user can only be deleted once its policies and access keys are gone;
/// implementations do not sequence these calls for the caller.
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// List users, optionally restricted to a path prefix.
    async fn list_users(&self, path_prefix: Option<&str>) -> Result<Vec<IdentityUser>>;

    /// Remove every inline and attached policy from a user.
    async fn delete_all_user_policies(&self, user_name: &str) -> Result<()>;

    /// Delete every access key of a user.
    async fn delete_all_user_access_keys(&self, user_name: &str) -> Result<()>;

    /// Delete the user itself.
    async fn delete_user(&self, user_name: &str) -> Result<()>;
}

// ============================================================================
// Bundle
// ============================================================================

/// The three provider surfaces, shared by every task.
#[derive(Clone)]
pub struct Provider {
    /// Compute instances.
    pub compute: Arc<dyn ComputeApi>,
    /// Auto scaling groups and launch configurations.
    pub autoscaling: Arc<dyn AutoScalingApi>,
    /// Identity users.
    pub identity: Arc<dyn IdentityApi>,
}

impl Provider {
    /// Use one implementation for all three surfaces.
    pub fn from_shared<P>(provider: Arc<P>) -> Self
    where
        P: ComputeApi + AutoScalingApi + IdentityApi + 'static,
    {
        Self {
            compute: provider.clone(),
            autoscaling: provider.clone(),
            identity: provider,
        }
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, ip: &str, role: InstanceRole, state: InstanceStatus) -> ProviderInstance {
        ProviderInstance {
            instance_id: id.to_string(),
            image_id: None,
            instance_type: None,
            private_ip_address: Some(ip.to_string()),
            state,
            launch_time: None,
            tags: vec![Tag::new(TAG_ROLE, role.as_str())],
        }
    }

    #[test]
    fn test_filter_combines_fields() {
        let dock = instance("i-1", "10.0.0.1", InstanceRole::Dock, InstanceStatus::Running);
        let build = instance("i-2", "10.0.0.2", InstanceRole::Build, InstanceStatus::Running);
        let stopped = instance("i-3", "10.0.0.3", InstanceRole::Dock, InstanceStatus::Stopped);

        let running_docks = InstanceFilter::running(InstanceRole::Dock);
        assert!(running_docks.matches(&dock));
        assert!(!running_docks.matches(&build));
        assert!(!running_docks.matches(&stopped));

        let by_ip = InstanceFilter::by_private_ip("10.0.0.2");
        assert!(by_ip.matches(&build));
        assert!(!by_ip.matches(&dock));

        assert!(InstanceFilter::default().matches(&stopped));
        assert!(InstanceFilter::by_ids(["i-3"]).matches(&stopped));
    }

    #[test]
    fn test_instance_status_strings() {
        assert_eq!(
            "shutting-down".parse::<InstanceStatus>().unwrap(),
            InstanceStatus::ShuttingDown
        );
        assert!("rebooting".parse::<InstanceStatus>().is_err());
    }
}
