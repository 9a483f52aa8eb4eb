// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store and queue tests.
//!
//! Run with TEST_DATABASE_URL pointing at a scratch database.

mod common;

use std::time::Duration;

use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use shiva_core::error::{ClassifyStoreResult, StoreError};
use shiva_core::persistence::{InstanceRole, NewInstance, NewVolume, PostgresStore, Store};
use shiva_core::queue::{PostgresQueue, Queue, event_queue};

async fn pool() -> sqlx::PgPool {
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL not set");
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("Failed to connect to test database");
    shiva_core::migrations::run_postgres(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

fn dock(id: &str, cluster_id: &str) -> NewInstance {
    NewInstance {
        id: id.to_string(),
        cluster_id: cluster_id.to_string(),
        role: InstanceRole::Dock,
        aws_image_id: Some("ami-test".to_string()),
        aws_instance_type: Some("t2.medium".to_string()),
        aws_private_ip_address: Some("10.0.0.1".to_string()),
    }
}

#[tokio::test]
async fn test_duplicate_github_id_is_a_unique_violation() {
    skip_if_no_db!();
    let store = PostgresStore::new(pool().await);
    let github_id = unique("org");

    store.insert_cluster(&unique("c"), &github_id).await.unwrap();
    let err = store
        .insert_cluster(&unique("c"), &github_id)
        .await
        .classified()
        .unwrap_err();

    assert!(matches!(err, StoreError::UniqueViolation(_)), "{:?}", err);
}

#[tokio::test]
async fn test_instance_for_missing_cluster_is_a_foreign_key_violation() {
    skip_if_no_db!();
    let store = PostgresStore::new(pool().await);

    let err = store
        .insert_instance(&dock(&unique("i"), &unique("missing")))
        .await
        .classified()
        .unwrap_err();

    assert!(matches!(err, StoreError::ForeignKeyViolation(_)), "{:?}", err);
}

#[tokio::test]
async fn test_cluster_rows_through_teardown() {
    skip_if_no_db!();
    let store = PostgresStore::new(pool().await);
    let cluster_id = unique("c");
    let github_id = unique("org");
    let instance_id = unique("i");
    let volume_id = unique("v");

    store.insert_cluster(&cluster_id, &github_id).await.unwrap();
    store
        .insert_instance(&dock(&instance_id, &cluster_id))
        .await
        .unwrap();
    store
        .insert_volume(&NewVolume {
            id: volume_id.clone(),
            cluster_id: cluster_id.clone(),
            volume_type: Some("gp2".to_string()),
            size: Some(50),
        })
        .await
        .unwrap();
    store.attach_volume(&instance_id, &volume_id).await.unwrap();

    let found = store
        .get_cluster_by_github_id(&github_id)
        .await
        .unwrap()
        .expect("cluster by github id");
    assert_eq!(found.id, cluster_id);
    assert!(!found.deprovisioning);

    assert!(store.set_cluster_deprovisioning(&cluster_id).await.unwrap());
    assert!(!store.set_cluster_deprovisioning(&cluster_id).await.unwrap());

    assert!(store.soft_delete_instance(&instance_id).await.unwrap());
    let first = store.get_instance(&instance_id).await.unwrap().unwrap().deleted;
    assert!(!store.soft_delete_instance(&instance_id).await.unwrap());
    let second = store.get_instance(&instance_id).await.unwrap().unwrap().deleted;
    assert!(first.is_some());
    assert_eq!(first, second);
    assert_eq!(store.count_active_instances(&cluster_id).await.unwrap(), 0);
    assert_eq!(
        store.list_instances(&cluster_id, true).await.unwrap().len(),
        1
    );

    assert_eq!(store.delete_volumes_for_cluster(&cluster_id).await.unwrap(), 1);
    assert_eq!(
        store.delete_instances_for_cluster(&cluster_id).await.unwrap(),
        1
    );
    assert!(store.delete_cluster(&cluster_id).await.unwrap());
    assert!(store.get_cluster(&cluster_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_queue_leases_and_acks() {
    skip_if_no_db!();
    let queue = PostgresQueue::new(pool().await);
    let name = unique("q");

    let id = queue.publish(&name, json!({ "n": 1 })).await.unwrap();

    let batch = queue.receive(&[name.clone()], 10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, id);
    assert_eq!(batch[0].attempt, 1);
    assert_eq!(batch[0].payload, json!({ "n": 1 }));

    // Leased: invisible to a second consumer
    assert!(queue.receive(&[name.clone()], 10).await.unwrap().is_empty());

    queue.ack(&batch[0]).await.unwrap();
    assert!(queue.ack(&batch[0]).await.is_err());
}

#[tokio::test]
async fn test_queue_retry_and_dead_letter() {
    skip_if_no_db!();
    let queue = PostgresQueue::new(pool().await);
    let name = unique("q");
    queue.publish(&name, json!({})).await.unwrap();

    let first = queue.receive(&[name.clone()], 1).await.unwrap().remove(0);
    queue
        .retry(&first, Duration::ZERO, "provider rate exceeded")
        .await
        .unwrap();

    let second = queue.receive(&[name.clone()], 1).await.unwrap().remove(0);
    assert_eq!(second.id, first.id);
    assert_eq!(second.attempt, 2);

    queue.dead_letter(&second, "gave up").await.unwrap();
    assert!(queue.receive(&[name.clone()], 1).await.unwrap().is_empty());
    assert_eq!(queue.dead_letter_count(&name).await.unwrap(), 1);
}

#[tokio::test]
async fn test_queue_concurrent_consumers_never_share_a_message() {
    skip_if_no_db!();
    let queue = PostgresQueue::new(pool().await);
    let name = unique("q");
    for n in 0..20 {
        queue.publish(&name, json!({ "n": n })).await.unwrap();
    }

    let queues = vec![name.clone()];
    let (a, b) = tokio::join!(queue.receive(&queues, 15), queue.receive(&queues, 15));
    let mut ids: Vec<Uuid> = a
        .unwrap()
        .into_iter()
        .chain(b.unwrap())
        .map(|d| d.id)
        .collect();

    assert_eq!(ids.len(), 20);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20);
}

#[tokio::test]
async fn test_queue_purges_expired_events_only() {
    skip_if_no_db!();
    let queue = PostgresQueue::new(pool().await);
    let event = unique("dock.initialized");
    let jobs = unique("q");

    queue.publish_event(&event, json!({ "instanceId": "i-1" })).await.unwrap();
    queue.publish(&jobs, json!({})).await.unwrap();

    // Nothing is old enough yet
    queue.purge_events(Duration::from_secs(3600), 1000).await.unwrap();
    assert_eq!(
        queue.receive(&[event_queue(&event)], 1).await.unwrap().len(),
        1
    );

    // An untaken event past its age is removed
    queue.publish_event(&event, json!({ "instanceId": "i-2" })).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.purge_events(Duration::ZERO, 1000).await.unwrap();

    assert!(queue.receive(&[event_queue(&event)], 10).await.unwrap().is_empty());
    assert_eq!(queue.receive(&[jobs.clone()], 10).await.unwrap().len(), 1);
}
