// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for clusters, instances and volumes.
//!
//! Backends report failures as [`StoreError::Raw`]; callers decide what a
//! failure means by passing it through [`crate::error::classify_storage_error`].

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{
    FOREIGN_KEY_VIOLATION, NOT_NULL_VIOLATION, RawDbError, StoreError, UNIQUE_VIOLATION,
};

/// Role an instance plays inside its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    /// Worker that runs customer containers.
    #[default]
    Dock,
    /// Image build host.
    Build,
    /// Supporting service host.
    Service,
}

impl InstanceRole {
    /// Column / tag value for this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dock => "dock",
            Self::Build => "build",
            Self::Service => "service",
        }
    }
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dock" => Ok(Self::Dock),
            "build" => Ok(Self::Build),
            "service" => Ok(Self::Service),
            other => Err(format!("unknown instance role '{}'", other)),
        }
    }
}

/// Cluster row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ClusterRecord {
    /// Cluster identifier.
    pub id: String,
    /// Organization the cluster belongs to (unique).
    pub github_id: String,
    /// Set once teardown has started.
    pub deprovisioning: bool,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

/// Instance row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct InstanceRecord {
    /// Provider instance id.
    pub id: String,
    /// Owning cluster.
    pub cluster_id: String,
    /// Role column (`dock`, `build`, `service`).
    pub role: String,
    /// Image the instance was launched from.
    pub aws_image_id: Option<String>,
    /// Provider instance type.
    pub aws_instance_type: Option<String>,
    /// Private address inside the cluster network.
    pub aws_private_ip_address: Option<String>,
    /// Soft-delete marker.
    pub deleted: Option<DateTime<Utc>>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Parsed role; unknown values read as the default role.
    pub fn role(&self) -> InstanceRole {
        self.role.parse().unwrap_or_default()
    }
}

/// Fields for a new instance row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInstance {
    /// Provider instance id.
    pub id: String,
    /// Owning cluster.
    pub cluster_id: String,
    /// Role of the instance.
    pub role: InstanceRole,
    /// Image the instance was launched from.
    pub aws_image_id: Option<String>,
    /// Provider instance type.
    pub aws_instance_type: Option<String>,
    /// Private address, if already assigned.
    pub aws_private_ip_address: Option<String>,
}

/// Volume row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct VolumeRecord {
    /// Volume identifier.
    pub id: String,
    /// Owning cluster.
    pub cluster_id: String,
    /// Provider volume type (e.g. `gp2`).
    pub volume_type: Option<String>,
    /// Size in GiB.
    pub size: Option<i64>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

/// Fields for a new volume row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVolume {
    /// Volume identifier.
    pub id: String,
    /// Owning cluster.
    pub cluster_id: String,
    /// Provider volume type.
    pub volume_type: Option<String>,
    /// Size in GiB.
    pub size: Option<i64>,
}

/// Storage interface used by task handlers.
///
/// Reads and writes are independent statements; callers read, decide, then
/// write, and rely on constraints plus classification for races.
#[allow(missing_docs)]
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_cluster(&self, id: &str) -> Result<Option<ClusterRecord>, StoreError>;

    async fn get_cluster_by_github_id(
        &self,
        github_id: &str,
    ) -> Result<Option<ClusterRecord>, StoreError>;

    async fn insert_cluster(&self, id: &str, github_id: &str)
    -> Result<ClusterRecord, StoreError>;

    /// Flip `deprovisioning` to true. Returns false when it was already set
    /// or the cluster does not exist.
    async fn set_cluster_deprovisioning(&self, id: &str) -> Result<bool, StoreError>;

    /// Hard delete a cluster row. Returns false when no row matched.
    async fn delete_cluster(&self, id: &str) -> Result<bool, StoreError>;

    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>, StoreError>;

    async fn count_clusters(&self) -> Result<i64, StoreError>;

    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>, StoreError>;

    async fn insert_instance(&self, instance: &NewInstance) -> Result<InstanceRecord, StoreError>;

    async fn list_instances(
        &self,
        cluster_id: &str,
        include_deleted: bool,
    ) -> Result<Vec<InstanceRecord>, StoreError>;

    /// Instances of the cluster whose `deleted` is NULL.
    async fn count_active_instances(&self, cluster_id: &str) -> Result<i64, StoreError>;

    /// Stamp `deleted` on an instance. Returns true only when this call set
    /// it; already deleted or missing rows return false.
    async fn soft_delete_instance(&self, id: &str) -> Result<bool, StoreError>;

    /// Hard delete every instance row of a cluster, returning the count.
    async fn delete_instances_for_cluster(&self, cluster_id: &str) -> Result<u64, StoreError>;

    async fn insert_volume(&self, volume: &NewVolume) -> Result<VolumeRecord, StoreError>;

    async fn get_volume(&self, id: &str) -> Result<Option<VolumeRecord>, StoreError>;

    async fn list_volumes(&self, cluster_id: &str) -> Result<Vec<VolumeRecord>, StoreError>;

    async fn delete_volume(&self, id: &str) -> Result<bool, StoreError>;

    async fn attach_volume(&self, instance_id: &str, volume_id: &str) -> Result<(), StoreError>;

    async fn detach_volume(&self, instance_id: &str, volume_id: &str)
    -> Result<bool, StoreError>;

    async fn list_instance_volumes(
        &self,
        instance_id: &str,
    ) -> Result<Vec<VolumeRecord>, StoreError>;

    /// Remove every volume of a cluster together with all association rows
    /// touching the cluster's volumes or instances.
    async fn delete_volumes_for_cluster(&self, cluster_id: &str) -> Result<u64, StoreError>;

    async fn health_check(&self) -> Result<bool, StoreError>;
}

/// Convert a driver error into the raw storage contract.
///
/// Constraint failures are reported with their SQLSTATE whichever backend
/// raised them, so SQLite's numeric extended codes never leak upward for the
/// three constraint kinds the classifier knows about.
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::error::{DatabaseError as _, ErrorKind};

        let sqlx::Error::Database(db) = &err else {
            return StoreError::Raw(RawDbError::new(err.to_string()));
        };

        let code = match db.kind() {
            ErrorKind::UniqueViolation => Some(UNIQUE_VIOLATION.to_string()),
            ErrorKind::ForeignKeyViolation => Some(FOREIGN_KEY_VIOLATION.to_string()),
            ErrorKind::NotNullViolation => Some(NOT_NULL_VIOLATION.to_string()),
            _ => db.code().map(|c| c.into_owned()),
        };

        let detail = db
            .try_downcast_ref::<sqlx::postgres::PgDatabaseError>()
            .and_then(|pg| pg.detail())
            .map(str::to_string);

        StoreError::Raw(RawDbError {
            code,
            message: Some(db.message().to_string()),
            detail,
            table: db.table().map(str::to_string),
            constraint: db.constraint().map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_role_round_trip_strings() {
        for role in [InstanceRole::Dock, InstanceRole::Build, InstanceRole::Service] {
            assert_eq!(role.as_str().parse::<InstanceRole>().unwrap(), role);
        }
        assert!("gpu".parse::<InstanceRole>().is_err());
        assert_eq!(InstanceRole::default(), InstanceRole::Dock);
    }

    #[test]
    fn test_non_database_sqlx_error_is_raw_without_code() {
        let err: StoreError = sqlx::Error::PoolTimedOut.into();
        match err {
            StoreError::Raw(raw) => {
                assert!(raw.code.is_none());
                assert!(raw.message.is_some());
            }
            other => panic!("expected raw error, got {:?}", other),
        }
    }
}
