// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed store implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use crate::error::StoreError;

use super::{ClusterRecord, InstanceRecord, NewInstance, NewVolume, Store, VolumeRecord};

const CLUSTER_COLUMNS: &str = "id, github_id, deprovisioning, created_at, updated_at";

const INSTANCE_COLUMNS: &str = "id, cluster_id, role, aws_image_id, aws_instance_type, \
     aws_private_ip_address, deleted, created_at, updated_at";

const VOLUME_COLUMNS: &str = "id, cluster_id, volume_type, size, created_at, updated_at";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new Postgres-backed store from an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool (shared with [`crate::queue::PostgresQueue`]).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn get_cluster(&self, id: &str) -> Result<Option<ClusterRecord>, StoreError> {
        let sql = format!("SELECT {} FROM clusters WHERE id = $1", CLUSTER_COLUMNS);
        let record = sqlx::query_as::<_, ClusterRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn get_cluster_by_github_id(
        &self,
        github_id: &str,
    ) -> Result<Option<ClusterRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM clusters WHERE github_id = $1",
            CLUSTER_COLUMNS
        );
        let record = sqlx::query_as::<_, ClusterRecord>(&sql)
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
        let sql = format!(
            r#"
            INSERT INTO clusters (id, github_id, deprovisioning, created_at, updated_at)
            VALUES ($1, $2, FALSE, $3, $3)
            RETURNING {}
            "#,
            CLUSTER_COLUMNS
        );
        let record = sqlx::query_as::<_, ClusterRecord>(&sql)
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
            SET deprovisioning = TRUE, updated_at = $2
            WHERE id = $1 AND deprovisioning = FALSE
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_cluster(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM clusters WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM clusters ORDER BY created_at ASC",
            CLUSTER_COLUMNS
        );
        let records = sqlx::query_as::<_, ClusterRecord>(&sql)
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
        let sql = format!("SELECT {} FROM instances WHERE id = $1", INSTANCE_COLUMNS);
        let record = sqlx::query_as::<_, InstanceRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn insert_instance(&self, instance: &NewInstance) -> Result<InstanceRecord, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO instances (id, cluster_id, role, aws_image_id, aws_instance_type,
                                   aws_private_ip_address, deleted, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NULL, $7, $7)
            RETURNING {}
            "#,
            INSTANCE_COLUMNS
        );
        let record = sqlx::query_as::<_, InstanceRecord>(&sql)
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
        let sql = format!(
            r#"
            SELECT {}
            FROM instances
            WHERE cluster_id = $1 AND ($2 OR deleted IS NULL)
            ORDER BY created_at ASC, id ASC
            "#,
            INSTANCE_COLUMNS
        );
        let records = sqlx::query_as::<_, InstanceRecord>(&sql)
            .bind(cluster_id)
            .bind(include_deleted)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn count_active_instances(&self, cluster_id: &str) -> Result<i64, StoreError> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM instances WHERE cluster_id = $1 AND deleted IS NULL",
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
            SET deleted = $2, updated_at = $2
            WHERE id = $1 AND deleted IS NULL
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_instances_for_cluster(&self, cluster_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM instances WHERE cluster_id = $1")
            .bind(cluster_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn insert_volume(&self, volume: &NewVolume) -> Result<VolumeRecord, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO volumes (id, cluster_id, volume_type, size, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING {}
            "#,
            VOLUME_COLUMNS
        );
        let record = sqlx::query_as::<_, VolumeRecord>(&sql)
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
        let sql = format!("SELECT {} FROM volumes WHERE id = $1", VOLUME_COLUMNS);
        let record = sqlx::query_as::<_, VolumeRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn list_volumes(&self, cluster_id: &str) -> Result<Vec<VolumeRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM volumes WHERE cluster_id = $1 ORDER BY created_at ASC, id ASC",
            VOLUME_COLUMNS
        );
        let records = sqlx::query_as::<_, VolumeRecord>(&sql)
            .bind(cluster_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn delete_volume(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM volumes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn attach_volume(&self, instance_id: &str, volume_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO instance_volumes (instance_id, volume_id)
            VALUES ($1, $2)
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
            sqlx::query("DELETE FROM instance_volumes WHERE instance_id = $1 AND volume_id = $2")
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
            WHERE iv.instance_id = $1
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
            WHERE volume_id IN (SELECT id FROM volumes WHERE cluster_id = $1)
               OR instance_id IN (SELECT id FROM instances WHERE cluster_id = $1)
            "#,
        )
        .bind(cluster_id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM volumes WHERE cluster_id = $1")
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
