// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job kinds, queue names and payload validation.
//!
//! Deliveries carry loosely typed JSON. [`Job::parse`] turns a payload into a
//! typed, immutable job or a [`ValidationError`], and does so before any
//! handler runs, so a malformed job never reaches the store or the provider.
//!
//! Some transitions are reachable under more than one queue name; the
//! aliases are bound to the same [`JobKind`] (see [`JobKind::from_queue`]).

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::persistence::InstanceRole;

/// A payload that cannot be turned into a job. Always fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The payload is not a JSON object.
    #[error("job payload must be an object, got {0}")]
    NotAnObject(&'static str),

    /// A required field is absent or null.
    #[error("missing required field '{0}'")]
    Missing(&'static str),

    /// A field has the wrong JSON type.
    #[error("field '{field}' must be {expected}")]
    WrongType {
        /// Field name.
        field: &'static str,
        /// Description of the accepted type.
        expected: &'static str,
    },

    /// An identifier field is an empty string.
    #[error("field '{0}' must not be empty")]
    Empty(&'static str),

    /// A field is well typed but its value is unusable.
    #[error("field '{field}' is invalid: {reason}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Every transition the dispatcher can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum JobKind {
    ClusterProvision,
    ClusterInstanceProvision,
    ClusterInstanceTag,
    ClusterInstanceTerminate,
    ClusterInstanceDelete,
    ClusterDeprovision,
    ClusterDelete,
    AsgCreate,
    AsgUpdate,
    AsgDelete,
    OrgInstanceAttach,
    DockInitialized,
    IamCleanup,
    IamOldestLaunchTimeFetch,
}

impl JobKind {
    /// All kinds, in dispatch-table order.
    pub const ALL: [JobKind; 14] = [
        JobKind::ClusterProvision,
        JobKind::ClusterInstanceProvision,
        JobKind::ClusterInstanceTag,
        JobKind::ClusterInstanceTerminate,
        JobKind::ClusterInstanceDelete,
        JobKind::ClusterDeprovision,
        JobKind::ClusterDelete,
        JobKind::AsgCreate,
        JobKind::AsgUpdate,
        JobKind::AsgDelete,
        JobKind::OrgInstanceAttach,
        JobKind::DockInitialized,
        JobKind::IamCleanup,
        JobKind::IamOldestLaunchTimeFetch,
    ];

    /// Canonical queue name. Follow-on jobs are always published here.
    pub fn queue_name(&self) -> &'static str {
        match self {
            Self::ClusterProvision => "cluster-provision",
            Self::ClusterInstanceProvision => "cluster-instance-provision",
            Self::ClusterInstanceTag => "cluster-instance-tag",
            Self::ClusterInstanceTerminate => "cluster-instance-terminate",
            Self::ClusterInstanceDelete => "cluster-instance-delete",
            Self::ClusterDeprovision => "cluster-deprovision",
            Self::ClusterDelete => "cluster-delete",
            Self::AsgCreate => "asg.create",
            Self::AsgUpdate => "asg.update",
            Self::AsgDelete => "asg.delete",
            Self::OrgInstanceAttach => "org.instance.attach",
            Self::DockInitialized => "dock.initialized",
            Self::IamCleanup => "iam.cleanup",
            Self::IamOldestLaunchTimeFetch => "iam.oldest-launch-time-fetch",
        }
    }

    /// Legacy queue names that run the same transition.
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Self::ClusterInstanceTerminate => &["asg.instance.terminate"],
            Self::AsgCreate => &["shiva-asg-create", "shiva-asg-provision"],
            _ => &[],
        }
    }

    /// Every queue name (canonical plus aliases) bound to this kind.
    pub fn queue_names(&self) -> impl Iterator<Item = &'static str> {
        std::iter::once(self.queue_name()).chain(self.aliases().iter().copied())
    }

    /// Resolve a queue name, canonical or alias.
    pub fn from_queue(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.queue_names().any(|q| q == name))
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.queue_name())
    }
}

// ============================================================================
// Typed jobs
// ============================================================================

/// Create the cluster row for an organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterProvision {
    /// Organization id.
    pub github_id: String,
}

/// Launch instances into an existing cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInstanceProvision {
    /// Target cluster.
    pub cluster_id: String,
    /// Role of the new instances (default dock).
    pub role: InstanceRole,
    /// Number of instances to launch, at least one.
    pub count: u32,
    /// Initial dock slot (1-based) when published by `cluster-provision`.
    /// Slotted jobs launch with a token derived from the cluster and slot,
    /// so republishing the same slot never launches a second dock.
    pub slot: Option<u32>,
}

impl ClusterInstanceProvision {
    /// Provider idempotency token: the slot token for slotted jobs, the
    /// delivery id otherwise.
    pub fn client_token(&self, delivery_id: &str) -> String {
        match self.slot {
            Some(slot) => format!("{}-{}-{}", self.cluster_id, self.role.as_str(), slot),
            None => delivery_id.to_string(),
        }
    }
}

/// Stamp organization and role tags onto launched instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInstanceTag {
    /// Organization id.
    pub org: String,
    /// Role tag value.
    pub role: InstanceRole,
    /// Instances to tag.
    pub instance_ids: Vec<String>,
}

/// Terminate one instance, known by id, by private address, or both.
///
/// When both are present the id wins and no lookup is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInstanceTerminate {
    /// Provider instance id.
    pub instance_id: Option<String>,
    /// Private address, resolved through the provider when no id is given.
    pub private_ip_address: Option<String>,
}

/// Soft-delete an instance row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInstanceDelete {
    /// Instance to mark deleted.
    pub instance_id: String,
}

/// Start tearing down an organization's cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDeprovision {
    /// Organization id.
    pub github_id: String,
}

/// Hard delete a deprovisioned cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDelete {
    /// Cluster to remove.
    pub cluster_id: String,
}

/// Create an organization's launch configuration and group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsgCreate {
    /// Organization id.
    pub github_id: String,
}

/// New sizing for a group; at least one field is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CapacityUpdate {
    pub desired_capacity: Option<i32>,
    pub min_size: Option<i32>,
    pub max_size: Option<i32>,
}

impl CapacityUpdate {
    fn is_empty(&self) -> bool {
        self.desired_capacity.is_none() && self.min_size.is_none() && self.max_size.is_none()
    }
}

/// Resize an organization's group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsgUpdate {
    /// Organization id.
    pub github_id: String,
    /// Requested sizing.
    pub capacity: CapacityUpdate,
}

/// Delete an organization's group and launch configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsgDelete {
    /// Organization id.
    pub github_id: String,
}

/// Attach a running instance to an organization's group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgInstanceAttach {
    /// Organization id.
    pub github_id: String,
    /// Instance to attach.
    pub instance_id: String,
}

/// A dock finished booting inside a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockInitialized {
    /// Group the dock belongs to.
    pub auto_scaling_group_name: String,
    /// The dock.
    pub instance_id: String,
}

/// Collect ephemeral identity users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IamCleanup {
    /// Users created strictly before this instant are eligible.
    pub remove_before: DateTime<Utc>,
}

/// A validated job.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Job {
    ClusterProvision(ClusterProvision),
    ClusterInstanceProvision(ClusterInstanceProvision),
    ClusterInstanceTag(ClusterInstanceTag),
    ClusterInstanceTerminate(ClusterInstanceTerminate),
    ClusterInstanceDelete(ClusterInstanceDelete),
    ClusterDeprovision(ClusterDeprovision),
    ClusterDelete(ClusterDelete),
    AsgCreate(AsgCreate),
    AsgUpdate(AsgUpdate),
    AsgDelete(AsgDelete),
    OrgInstanceAttach(OrgInstanceAttach),
    DockInitialized(DockInitialized),
    IamCleanup(IamCleanup),
    IamOldestLaunchTimeFetch,
}

impl Job {
    /// Validate `payload` as a job of `kind`.
    pub fn parse(kind: JobKind, payload: &Value) -> Result<Self, ValidationError> {
        let fields = Fields::new(payload)?;

        let job = match kind {
            JobKind::ClusterProvision => Job::ClusterProvision(ClusterProvision {
                github_id: fields.required_id(&["github_id"])?,
            }),
            JobKind::ClusterInstanceProvision => {
                Job::ClusterInstanceProvision(ClusterInstanceProvision {
                    cluster_id: fields.required_id(&["cluster_id"])?,
                    role: fields.optional_role("role")?.unwrap_or_default(),
                    count: fields.optional_count("count")?.unwrap_or(1),
                    slot: fields.optional_count("slot")?,
                })
            }
            JobKind::ClusterInstanceTag => Job::ClusterInstanceTag(ClusterInstanceTag {
                org: fields.required_id(&["org"])?,
                role: fields
                    .optional_role("role")?
                    .ok_or(ValidationError::Missing("role"))?,
                instance_ids: fields.required_id_list("instance_ids")?,
            }),
            JobKind::ClusterInstanceTerminate => {
                let instance_id = fields.optional_id(&["instance_id", "instanceId"])?;
                let private_ip_address =
                    fields.optional_id(&["private_ip_address", "ipAddress"])?;
                if instance_id.is_none() && private_ip_address.is_none() {
                    return Err(ValidationError::Missing("instance_id or private_ip_address"));
                }
                Job::ClusterInstanceTerminate(ClusterInstanceTerminate {
                    instance_id,
                    private_ip_address,
                })
            }
            JobKind::ClusterInstanceDelete => Job::ClusterInstanceDelete(ClusterInstanceDelete {
                instance_id: fields.required_id(&["instance_id"])?,
            }),
            JobKind::ClusterDeprovision => Job::ClusterDeprovision(ClusterDeprovision {
                github_id: fields.required_id(&["github_id"])?,
            }),
            JobKind::ClusterDelete => Job::ClusterDelete(ClusterDelete {
                cluster_id: fields.required_id(&["cluster_id"])?,
            }),
            JobKind::AsgCreate => Job::AsgCreate(AsgCreate {
                github_id: fields.required_id(&["githubId"])?,
            }),
            JobKind::AsgUpdate => Job::AsgUpdate(AsgUpdate {
                github_id: fields.required_id(&["githubId"])?,
                capacity: fields.capacity("data")?,
            }),
            JobKind::AsgDelete => Job::AsgDelete(AsgDelete {
                github_id: fields.required_id(&["githubId"])?,
            }),
            JobKind::OrgInstanceAttach => Job::OrgInstanceAttach(OrgInstanceAttach {
                github_id: fields.required_id(&["githubId"])?,
                instance_id: fields.required_id(&["instanceId"])?,
            }),
            JobKind::DockInitialized => Job::DockInitialized(DockInitialized {
                auto_scaling_group_name: fields.required_id(&["autoScalingGroupName"])?,
                instance_id: fields.required_id(&["instanceId"])?,
            }),
            JobKind::IamCleanup => Job::IamCleanup(IamCleanup {
                remove_before: fields.timestamp("removeBefore")?,
            }),
            JobKind::IamOldestLaunchTimeFetch => Job::IamOldestLaunchTimeFetch,
        };

        Ok(job)
    }

    /// Kind of this job.
    pub fn kind(&self) -> JobKind {
        match self {
            Job::ClusterProvision(_) => JobKind::ClusterProvision,
            Job::ClusterInstanceProvision(_) => JobKind::ClusterInstanceProvision,
            Job::ClusterInstanceTag(_) => JobKind::ClusterInstanceTag,
            Job::ClusterInstanceTerminate(_) => JobKind::ClusterInstanceTerminate,
            Job::ClusterInstanceDelete(_) => JobKind::ClusterInstanceDelete,
            Job::ClusterDeprovision(_) => JobKind::ClusterDeprovision,
            Job::ClusterDelete(_) => JobKind::ClusterDelete,
            Job::AsgCreate(_) => JobKind::AsgCreate,
            Job::AsgUpdate(_) => JobKind::AsgUpdate,
            Job::AsgDelete(_) => JobKind::AsgDelete,
            Job::OrgInstanceAttach(_) => JobKind::OrgInstanceAttach,
            Job::DockInitialized(_) => JobKind::DockInitialized,
            Job::IamCleanup(_) => JobKind::IamCleanup,
            Job::IamOldestLaunchTimeFetch => JobKind::IamOldestLaunchTimeFetch,
        }
    }

    /// Wire payload for publishing this job on its canonical queue.
    pub fn payload(&self) -> Value {
        match self {
            Job::ClusterProvision(j) => json!({ "github_id": j.github_id }),
            Job::ClusterInstanceProvision(j) => {
                let mut payload = json!({
                    "cluster_id": j.cluster_id,
                    "role": j.role.as_str(),
                    "count": j.count,
                });
                if let Some(slot) = j.slot {
                    payload["slot"] = json!(slot);
                }
                payload
            }
            Job::ClusterInstanceTag(j) => json!({
                "org": j.org,
                "role": j.role.as_str(),
                "instance_ids": j.instance_ids,
            }),
            Job::ClusterInstanceTerminate(j) => {
                let mut map = Map::new();
                if let Some(id) = &j.instance_id {
                    map.insert("instance_id".into(), json!(id));
                }
                if let Some(ip) = &j.private_ip_address {
                    map.insert("private_ip_address".into(), json!(ip));
                }
                Value::Object(map)
            }
            Job::ClusterInstanceDelete(j) => json!({ "instance_id": j.instance_id }),
            Job::ClusterDeprovision(j) => json!({ "github_id": j.github_id }),
            Job::ClusterDelete(j) => json!({ "cluster_id": j.cluster_id }),
            Job::AsgCreate(j) => json!({ "githubId": j.github_id }),
            Job::AsgUpdate(j) => {
                let mut data = Map::new();
                if let Some(v) = j.capacity.desired_capacity {
                    data.insert("desiredCapacity".into(), json!(v));
                }
                if let Some(v) = j.capacity.min_size {
                    data.insert("minSize".into(), json!(v));
                }
                if let Some(v) = j.capacity.max_size {
                    data.insert("maxSize".into(), json!(v));
                }
                json!({ "githubId": j.github_id, "data": data })
            }
            Job::AsgDelete(j) => json!({ "githubId": j.github_id }),
            Job::OrgInstanceAttach(j) => json!({
                "githubId": j.github_id,
                "instanceId": j.instance_id,
            }),
            Job::DockInitialized(j) => json!({
                "autoScalingGroupName": j.auto_scaling_group_name,
                "instanceId": j.instance_id,
            }),
            Job::IamCleanup(j) => json!({ "removeBefore": j.remove_before.to_rfc3339() }),
            Job::IamOldestLaunchTimeFetch => json!({}),
        }
    }
}

// ============================================================================
// Field access
// ============================================================================

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

struct Fields<'a> {
    map: &'a Map<String, Value>,
}

impl<'a> Fields<'a> {
    fn new(payload: &'a Value) -> Result<Self, ValidationError> {
        match payload {
            Value::Object(map) => Ok(Self { map }),
            other => Err(ValidationError::NotAnObject(json_type_name(other))),
        }
    }

    /// First non-null value under any of `names`, with the name it was found
    /// under.
    fn lookup(&self, names: &[&'static str]) -> Option<(&'static str, &'a Value)> {
        names.iter().find_map(|name| match self.map.get(*name) {
            None | Some(Value::Null) => None,
            Some(value) => Some((*name, value)),
        })
    }

    fn required_id(&self, names: &[&'static str]) -> Result<String, ValidationError> {
        let (field, value) = self
            .lookup(names)
            .ok_or(ValidationError::Missing(names[0]))?;
        match value {
            Value::String(s) if s.is_empty() => Err(ValidationError::Empty(field)),
            Value::String(s) => Ok(s.clone()),
            _ => Err(ValidationError::WrongType {
                field,
                expected: "a string",
            }),
        }
    }

    /// Like [`Self::required_id`] but absent and empty both read as `None`.
    fn optional_id(&self, names: &[&'static str]) -> Result<Option<String>, ValidationError> {
        match self.lookup(names) {
            None => Ok(None),
            Some((_, Value::String(s))) if s.is_empty() => Ok(None),
            Some((_, Value::String(s))) => Ok(Some(s.clone())),
            Some((field, _)) => Err(ValidationError::WrongType {
                field,
                expected: "a string",
            }),
        }
    }

    fn required_id_list(&self, name: &'static str) -> Result<Vec<String>, ValidationError> {
        let (field, value) = self.lookup(&[name]).ok_or(ValidationError::Missing(name))?;
        let Value::Array(items) = value else {
            return Err(ValidationError::WrongType {
                field,
                expected: "an array of strings",
            });
        };
        if items.is_empty() {
            return Err(ValidationError::Empty(field));
        }

        items
            .iter()
            .map(|item| match item {
                Value::String(s) if !s.is_empty() => Ok(s.clone()),
                Value::String(_) => Err(ValidationError::Empty(field)),
                _ => Err(ValidationError::WrongType {
                    field,
                    expected: "an array of strings",
                }),
            })
            .collect()
    }

    fn optional_role(&self, name: &'static str) -> Result<Option<InstanceRole>, ValidationError> {
        match self.optional_id(&[name])? {
            None => Ok(None),
            Some(role) => role
                .parse()
                .map(Some)
                .map_err(|reason| ValidationError::Invalid { field: name, reason }),
        }
    }

    fn optional_count(&self, name: &'static str) -> Result<Option<u32>, ValidationError> {
        let Some((field, value)) = self.lookup(&[name]) else {
            return Ok(None);
        };
        let count = value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(ValidationError::WrongType {
                field,
                expected: "a positive integer",
            })?;
        if count == 0 {
            return Err(ValidationError::Invalid {
                field,
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(Some(count))
    }

    fn capacity(&self, name: &'static str) -> Result<CapacityUpdate, ValidationError> {
        let (field, value) = self.lookup(&[name]).ok_or(ValidationError::Missing(name))?;
        let data = Fields::new(value).map_err(|_| ValidationError::WrongType {
            field,
            expected: "an object",
        })?;

        let capacity = CapacityUpdate {
            desired_capacity: data.optional_size("desiredCapacity")?,
            min_size: data.optional_size("minSize")?,
            max_size: data.optional_size("maxSize")?,
        };

        if capacity.is_empty() {
            return Err(ValidationError::Invalid {
                field,
                reason: "expected at least one of desiredCapacity, minSize, maxSize".to_string(),
            });
        }
        if let (Some(min), Some(max)) = (capacity.min_size, capacity.max_size)
            && min > max
        {
            return Err(ValidationError::Invalid {
                field,
                reason: format!("minSize {} exceeds maxSize {}", min, max),
            });
        }

        Ok(capacity)
    }

    fn optional_size(&self, name: &'static str) -> Result<Option<i32>, ValidationError> {
        let Some((field, value)) = self.lookup(&[name]) else {
            return Ok(None);
        };
        value
            .as_u64()
            .and_then(|n| i32::try_from(n).ok())
            .map(Some)
            .ok_or(ValidationError::WrongType {
                field,
                expected: "a non-negative integer",
            })
    }

    /// RFC 3339 string or integer milliseconds since the epoch.
    fn timestamp(&self, name: &'static str) -> Result<DateTime<Utc>, ValidationError> {
        let (field, value) = self.lookup(&[name]).ok_or(ValidationError::Missing(name))?;
        let invalid = |reason: String| ValidationError::Invalid { field, reason };

        match value {
            Value::String(s) if s.is_empty() => Err(ValidationError::Empty(field)),
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| invalid(e.to_string())),
            Value::Number(n) => n
                .as_i64()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .ok_or_else(|| invalid(format!("{} is not a valid epoch-millis value", n))),
            _ => Err(ValidationError::WrongType {
                field,
                expected: "an RFC 3339 string or epoch milliseconds",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_resolve_to_one_kind() {
        assert_eq!(
            JobKind::from_queue("asg.instance.terminate"),
            Some(JobKind::ClusterInstanceTerminate)
        );
        assert_eq!(
            JobKind::from_queue("shiva-asg-create"),
            Some(JobKind::AsgCreate)
        );
        assert_eq!(
            JobKind::from_queue("shiva-asg-provision"),
            Some(JobKind::AsgCreate)
        );
        assert_eq!(
            JobKind::from_queue("cluster-provision"),
            Some(JobKind::ClusterProvision)
        );
        assert_eq!(JobKind::from_queue("cluster-unknown"), None);
    }

    #[test]
    fn test_queue_names_are_unique() {
        let mut names: Vec<_> = JobKind::ALL.iter().flat_map(|k| k.queue_names()).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn test_non_object_payloads_are_rejected_for_every_kind() {
        for kind in JobKind::ALL {
            for payload in [json!(null), json!("org-1"), json!([1, 2]), json!(7)] {
                assert!(
                    matches!(
                        Job::parse(kind, &payload),
                        Err(ValidationError::NotAnObject(_))
                    ),
                    "{} accepted {}",
                    kind,
                    payload
                );
            }
        }
    }

    #[test]
    fn test_identifier_fields_reject_missing_empty_and_wrong_type() {
        let kind = JobKind::ClusterDeprovision;

        assert_eq!(
            Job::parse(kind, &json!({})),
            Err(ValidationError::Missing("github_id"))
        );
        assert_eq!(
            Job::parse(kind, &json!({ "github_id": null })),
            Err(ValidationError::Missing("github_id"))
        );
        assert_eq!(
            Job::parse(kind, &json!({ "github_id": "" })),
            Err(ValidationError::Empty("github_id"))
        );
        assert!(matches!(
            Job::parse(kind, &json!({ "github_id": 42 })),
            Err(ValidationError::WrongType { field: "github_id", .. })
        ));
    }

    #[test]
    fn test_terminate_accepts_either_identifier_spelling() {
        let by_ip = Job::parse(
            JobKind::ClusterInstanceTerminate,
            &json!({ "instanceId": "", "ipAddress": "10.0.0.7" }),
        )
        .unwrap();
        assert_eq!(
            by_ip,
            Job::ClusterInstanceTerminate(ClusterInstanceTerminate {
                instance_id: None,
                private_ip_address: Some("10.0.0.7".to_string()),
            })
        );

        let by_id = Job::parse(
            JobKind::ClusterInstanceTerminate,
            &json!({ "instance_id": "i-abc" }),
        )
        .unwrap();
        assert!(matches!(
            by_id,
            Job::ClusterInstanceTerminate(ClusterInstanceTerminate {
                instance_id: Some(_),
                private_ip_address: None,
            })
        ));

        assert!(matches!(
            Job::parse(
                JobKind::ClusterInstanceTerminate,
                &json!({ "instance_id": "", "private_ip_address": "" })
            ),
            Err(ValidationError::Missing(_))
        ));
    }

    #[test]
    fn test_instance_provision_defaults_and_bounds() {
        let job = Job::parse(
            JobKind::ClusterInstanceProvision,
            &json!({ "cluster_id": "c-1" }),
        )
        .unwrap();
        assert_eq!(
            job,
            Job::ClusterInstanceProvision(ClusterInstanceProvision {
                cluster_id: "c-1".to_string(),
                role: InstanceRole::Dock,
                count: 1,
                slot: None,
            })
        );

        assert!(matches!(
            Job::parse(
                JobKind::ClusterInstanceProvision,
                &json!({ "cluster_id": "c-1", "count": 0 })
            ),
            Err(ValidationError::Invalid { field: "count", .. })
        ));
        assert!(matches!(
            Job::parse(
                JobKind::ClusterInstanceProvision,
                &json!({ "cluster_id": "c-1", "role": "gpu" })
            ),
            Err(ValidationError::Invalid { field: "role", .. })
        ));
    }

    #[test]
    fn test_tag_requires_non_empty_id_list() {
        let base = |ids: Value| json!({ "org": "org-1", "role": "dock", "instance_ids": ids });

        assert!(Job::parse(JobKind::ClusterInstanceTag, &base(json!(["i-1", "i-2"]))).is_ok());
        assert_eq!(
            Job::parse(JobKind::ClusterInstanceTag, &base(json!([]))),
            Err(ValidationError::Empty("instance_ids"))
        );
        assert_eq!(
            Job::parse(JobKind::ClusterInstanceTag, &base(json!(["i-1", ""]))),
            Err(ValidationError::Empty("instance_ids"))
        );
        assert!(matches!(
            Job::parse(JobKind::ClusterInstanceTag, &base(json!("i-1"))),
            Err(ValidationError::WrongType { .. })
        ));
    }

    #[test]
    fn test_asg_update_requires_object_data_with_a_size() {
        let parse = |payload: Value| Job::parse(JobKind::AsgUpdate, &payload);

        assert_eq!(
            parse(json!({ "githubId": "org-1" })),
            Err(ValidationError::Missing("data"))
        );
        assert!(matches!(
            parse(json!({ "githubId": "org-1", "data": "big" })),
            Err(ValidationError::WrongType { field: "data", .. })
        ));
        assert!(matches!(
            parse(json!({ "githubId": "org-1", "data": {} })),
            Err(ValidationError::Invalid { field: "data", .. })
        ));
        assert!(matches!(
            parse(json!({ "githubId": "org-1", "data": { "minSize": 5, "maxSize": 2 } })),
            Err(ValidationError::Invalid { field: "data", .. })
        ));
        assert!(matches!(
            parse(json!({ "githubId": "org-1", "data": { "desiredCapacity": -1 } })),
            Err(ValidationError::WrongType { field: "desiredCapacity", .. })
        ));

        let job = parse(json!({ "githubId": "org-1", "data": { "desiredCapacity": 4 } })).unwrap();
        let Job::AsgUpdate(update) = job else {
            panic!("expected asg update");
        };
        assert_eq!(update.capacity.desired_capacity, Some(4));
        assert_eq!(update.capacity.min_size, None);
    }

    #[test]
    fn test_remove_before_accepts_rfc3339_and_epoch_millis() {
        let from_string = Job::parse(
            JobKind::IamCleanup,
            &json!({ "removeBefore": "2024-05-01T12:00:00Z" }),
        )
        .unwrap();
        let from_millis = Job::parse(
            JobKind::IamCleanup,
            &json!({ "removeBefore": 1_714_564_800_000_i64 }),
        )
        .unwrap();
        assert_eq!(from_string, from_millis);

        assert!(matches!(
            Job::parse(JobKind::IamCleanup, &json!({ "removeBefore": "yesterday" })),
            Err(ValidationError::Invalid { .. })
        ));
        assert!(matches!(
            Job::parse(JobKind::IamCleanup, &json!({ "removeBefore": true })),
            Err(ValidationError::WrongType { .. })
        ));
    }

    #[test]
    fn test_published_payloads_parse_back() {
        let jobs = [
            Job::ClusterInstanceProvision(ClusterInstanceProvision {
                cluster_id: "c-1".to_string(),
                role: InstanceRole::Build,
                count: 3,
                slot: None,
            }),
            Job::ClusterInstanceProvision(ClusterInstanceProvision {
                cluster_id: "c-1".to_string(),
                role: InstanceRole::Dock,
                count: 1,
                slot: Some(2),
            }),
            Job::ClusterInstanceTerminate(ClusterInstanceTerminate {
                instance_id: Some("i-1".to_string()),
                private_ip_address: None,
            }),
            Job::AsgUpdate(AsgUpdate {
                github_id: "org-1".to_string(),
                capacity: CapacityUpdate {
                    desired_capacity: None,
                    min_size: Some(1),
                    max_size: Some(3),
                },
            }),
        ];

        for job in jobs {
            assert_eq!(Job::parse(job.kind(), &job.payload()).unwrap(), job);
        }
    }
}
