// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::{RawDbError, StoreError};
use crate::migrations::SQLITE as MIGRATOR;

use super::{ClusterRecord, InstanceRecord, NewInstance, NewVolume, Store, VolumeRecord};

/// SQLite-backed store.
///
/// Intended for local runs and tests; production deployments use
/// [`super::PostgresStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and run migrations.
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/shiva.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Raw(RawDbError::new(format!(
                    "failed to create directory {:?}: {}",
                    parent, e
                )))
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        MIGRATOR.run(&pool).await.map_err(|e| {
            StoreError::Raw(RawDbError::new(format!("failed to run migrations: {}", e)))
        })?;

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_cluster(&self, id: &str) -> Result<Option<ClusterRecord>, StoreError> {
        let record = sqlx::query_as::<_, ClusterRecord>(
            r#"
            SELECT id, github_id, deprovisioning, created_at, updated_at
            FROM clusters
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_cluster_by_github_id(
        &self,
        github_id: &str,
    ) -> Result<Option<ClusterRecord>, StoreError> {
        let record = sqlx::query_as::<_, ClusterRecord>(
            r#"
            SELECT id, github_id, deprovisioning, created_at, updated_at
            FROM clusters
            WHERE github_id = ?1
            "#,
        )
        .bind(github_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn insert_cluster(
        &self,
        id: &str,
        github_id: &str,
    ) -> Result<ClusterRecord, StoreError> {
        let record = sqlx::query_as::<_, ClusterRecord>(
            r#"
            INSERT INTO clusters (id, github_id, deprovisioning, created_at, updated_at)
            VALUES (?1, ?2, 0, ?3, ?3)
            RETURNING id, github_id, deprovisioning, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(github_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn set_cluster_deprovisioning(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE clusters
            SET deprovisioning = 1, updated_at = ?2
            WHERE id = ?1 AND deprovisioning = 0
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_cluster(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM clusters WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>, StoreError> {
        let records = sqlx::query_as::<_, ClusterRecord>(
            r#"
            SELECT id, github_id, deprovisioning, created_at, updated_at
            FROM clusters
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn count_clusters(&self) -> Result<i64, StoreError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM clusters")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0)
    }

    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>, StoreError> {
        let record = sqlx::query_as::<_, InstanceRecord>(
            r#"
            SELECT id, cluster_id, role, aws_image_id, aws_instance_type,
                   aws_private_ip_address, deleted, created_at, updated_at
            FROM instances
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn insert_instance(&self, instance: &NewInstance) -> Result<InstanceRecord, StoreError> {
        let record = sqlx::query_as::<_, InstanceRecord>(
            r#"
            INSERT INTO instances (id, cluster_id, role, aws_image_id, aws_instance_type,
                                   aws_private_ip_address, deleted, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?7)
            RETURNING id, cluster_id, role, aws_image_id, aws_instance_type,
                      aws_private_ip_address, deleted, created_at, updated_at
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.cluster_id)
        .bind(instance.role.as_str())
        .bind(&instance.aws_image_id)
        .bind(&instance.aws_instance_type)
        .bind(&instance.aws_private_ip_address)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_instances(
        &self,
        cluster_id: &str,
        include_deleted: bool,
    ) -> Result<Vec<InstanceRecord>, StoreError> {
        let records = sqlx::query_as::<_, InstanceRecord>(
            r#"
            SELECT id, cluster_id, role, aws_image_id, aws_instance_type,
                   aws_private_ip_address, deleted, created_at, updated_at
            FROM instances
            WHERE cluster_id = ?1 AND (?2 OR deleted IS NULL)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(cluster_id)
        .bind(include_deleted)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn count_active_instances(&self, cluster_id: &str) -> Result<i64, StoreError> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM instances WHERE cluster_id = ?1 AND deleted IS NULL",
        )
        .bind(cluster_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0)
    }

    async fn soft_delete_instance(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET deleted = ?2, updated_at = ?2
            WHERE id = ?1 AND deleted IS NULL
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_instances_for_cluster(&self, cluster_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM instances WHERE cluster_id = ?1")
            .bind(cluster_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn insert_volume(&self, volume: &NewVolume) -> Result<VolumeRecord, StoreError> {
        let record = sqlx::query_as::<_, VolumeRecord>(
            r#"
            INSERT INTO volumes (id, cluster_id, volume_type, size, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            RETURNING id, cluster_id, volume_type, size, created_at, updated_at
            "#,
        )
        .bind(&volume.id)
        .bind(&volume.cluster_id)
        .bind(&volume.volume_type)
        .bind(volume.size)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_volume(&self, id: &str) -> Result<Option<VolumeRecord>, StoreError> {
        let record = sqlx::query_as::<_, VolumeRecord>(
            r#"
            SELECT id, cluster_id, volume_type, size, created_at, updated_at
            FROM volumes
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_volumes(&self, cluster_id: &str) -> Result<Vec<VolumeRecord>, StoreError> {
        let records = sqlx::query_as::<_, VolumeRecord>(
            r#"
            SELECT id, cluster_id, volume_type, size, created_at, updated_at
            FROM volumes
            WHERE cluster_id = ?1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_volume(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM volumes WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn attach_volume(&self, instance_id: &str, volume_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO instance_volumes (instance_id, volume_id)
            VALUES (?1, ?2)
            ON CONFLICT (instance_id, volume_id) DO NOTHING
            "#,
        )
        .bind(instance_id)
        .bind(volume_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn detach_volume(&self, instance_id: &str, volume_id: &str) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM instance_volumes WHERE instance_id = ?1 AND volume_id = ?2")
                .bind(instance_id)
                .bind(volume_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_instance_volumes(
        &self,
        instance_id: &str,
    ) -> Result<Vec<VolumeRecord>, StoreError> {
        let records = sqlx::query_as::<_, VolumeRecord>(
            r#"
            SELECT v.id, v.cluster_id, v.volume_type, v.size, v.created_at, v.updated_at
            FROM volumes v
            JOIN instance_volumes iv ON iv.volume_id = v.id
            WHERE iv.instance_id = ?1
            ORDER BY v.created_at ASC, v.id ASC
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_volumes_for_cluster(&self, cluster_id: &str) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM instance_volumes
            WHERE volume_id IN (SELECT id FROM volumes WHERE cluster_id = ?1)
               OR instance_id IN (SELECT id FROM instances WHERE cluster_id = ?1)
            "#,
        )
        .bind(cluster_id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM volumes WHERE cluster_id = ?1")
            .bind(cluster_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<bool, StoreError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{UNIQUE_VIOLATION, classify_storage_error};
    use crate::persistence::InstanceRole;

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        pool
    }

    fn new_instance(id: &str, cluster_id: &str) -> NewInstance {
        NewInstance {
            id: id.to_string(),
            cluster_id: cluster_id.to_string(),
            role: InstanceRole::Dock,
            aws_image_id: Some("ami-123".to_string()),
            aws_instance_type: Some("t2.medium".to_string()),
            aws_private_ip_address: Some("10.0.0.5".to_string()),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_cluster() {
        let store = SqliteStore::new(test_pool().await);

        let inserted = store.insert_cluster("c-1", "org-1").await.unwrap();
        assert!(!inserted.deprovisioning);

        let by_id = store.get_cluster("c-1").await.unwrap().unwrap();
        assert_eq!(by_id.github_id, "org-1");

        let by_org = store.get_cluster_by_github_id("org-1").await.unwrap();
        assert_eq!(by_org.map(|c| c.id), Some("c-1".to_string()));

        assert_eq!(store.count_clusters().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_github_id_reports_unique_code() {
        let store = SqliteStore::new(test_pool().await);

        store.insert_cluster("c-1", "org-1").await.unwrap();
        let err = store.insert_cluster("c-2", "org-1").await.unwrap_err();

        assert_eq!(err.code(), Some(UNIQUE_VIOLATION));
        assert!(matches!(
            classify_storage_error(err),
            StoreError::UniqueViolation(_)
        ));
    }

    #[tokio::test]
    async fn test_instance_for_missing_cluster_is_foreign_key_violation() {
        let store = SqliteStore::new(test_pool().await);

        let err = store
            .insert_instance(&new_instance("i-1", "missing"))
            .await
            .unwrap_err();

        assert!(matches!(
            classify_storage_error(err),
            StoreError::ForeignKeyViolation(_)
        ));
    }

    #[tokio::test]
    async fn test_set_deprovisioning_flips_once() {
        let store = SqliteStore::new(test_pool().await);
        store.insert_cluster("c-1", "org-1").await.unwrap();

        assert!(store.set_cluster_deprovisioning("c-1").await.unwrap());
        assert!(!store.set_cluster_deprovisioning("c-1").await.unwrap());
        assert!(!store.set_cluster_deprovisioning("missing").await.unwrap());

        let cluster = store.get_cluster("c-1").await.unwrap().unwrap();
        assert!(cluster.deprovisioning);
    }

    #[tokio::test]
    async fn test_soft_delete_is_idempotent() {
        let store = SqliteStore::new(test_pool().await);
        store.insert_cluster("c-1", "org-1").await.unwrap();
        store
            .insert_instance(&new_instance("i-1", "c-1"))
            .await
            .unwrap();

        assert!(store.soft_delete_instance("i-1").await.unwrap());
        let first = store.get_instance("i-1").await.unwrap().unwrap().deleted;
        assert!(first.is_some());

        assert!(!store.soft_delete_instance("i-1").await.unwrap());
        let second = store.get_instance("i-1").await.unwrap().unwrap().deleted;
        assert_eq!(first, second);

        assert!(!store.soft_delete_instance("never-existed").await.unwrap());
    }

    #[tokio::test]
    async fn test_active_instances_exclude_soft_deleted() {
        let store = SqliteStore::new(test_pool().await);
        store.insert_cluster("c-1", "org-1").await.unwrap();
        for id in ["i-1", "i-2", "i-3"] {
            store.insert_instance(&new_instance(id, "c-1")).await.unwrap();
        }
        store.soft_delete_instance("i-2").await.unwrap();

        assert_eq!(store.count_active_instances("c-1").await.unwrap(), 2);

        let active = store.list_instances("c-1", false).await.unwrap();
        let ids: Vec<_> = active.iter().map(|i| i.id.as_str()).collect();
        assert!(!ids.contains(&"i-2"));

        let all = store.list_instances("c-1", true).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].role(), InstanceRole::Dock);
    }

    #[tokio::test]
    async fn test_volumes_and_associations() {
        let store = SqliteStore::new(test_pool().await);
        store.insert_cluster("c-1", "org-1").await.unwrap();
        store
            .insert_instance(&new_instance("i-1", "c-1"))
            .await
            .unwrap();
        store
            .insert_volume(&NewVolume {
                id: "v-1".to_string(),
                cluster_id: "c-1".to_string(),
                volume_type: Some("gp2".to_string()),
                size: Some(50),
            })
            .await
            .unwrap();

        store.attach_volume("i-1", "v-1").await.unwrap();
        // Attaching twice keeps one association row.
        store.attach_volume("i-1", "v-1").await.unwrap();

        let attached = store.list_instance_volumes("i-1").await.unwrap();
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].size, Some(50));

        assert!(store.detach_volume("i-1", "v-1").await.unwrap());
        assert!(!store.detach_volume("i-1", "v-1").await.unwrap());
        assert!(store.get_volume("v-1").await.unwrap().is_some());

        store.attach_volume("i-1", "v-1").await.unwrap();
        assert_eq!(store.delete_volumes_for_cluster("c-1").await.unwrap(), 1);
        assert!(store.list_volumes("c-1").await.unwrap().is_empty());
        assert!(store.list_instance_volumes("i-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_health_check() {
        let store = SqliteStore::new(test_pool().await);
        assert!(store.health_check().await.unwrap());
    }
}
