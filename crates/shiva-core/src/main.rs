// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shiva - cluster lifecycle worker
//!
//! Consumes lifecycle jobs from the Postgres-backed queue and applies them
//! to the cluster store and the cloud provider:
//! - Cluster provisioning and teardown
//! - Instance launch, tagging, termination
//! - Auto scaling groups and identity cleanup

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use shiva_core::config::Config;
use shiva_core::migrations;
use shiva_core::persistence::PostgresStore;
use shiva_core::provider::{AwsProvider, Provider};
use shiva_core::queue::PostgresQueue;
use shiva_core::runtime::ShivaRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("shiva_core=info".parse()?),
        )
        .init();

    info!("Starting Shiva");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        max_workers = config.dispatcher.max_workers,
        max_attempts = config.dispatcher.max_attempts,
        asg_name_prefix = %config.tasks.asg_name_prefix,
        "Configuration loaded"
    );

    // Connect to database
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size())
        .connect(&config.database_url)
        .await?;

    info!("Running database migrations...");
    migrations::run_postgres(&pool).await?;
    info!("Migrations completed");

    let store = Arc::new(PostgresStore::new(pool.clone()));
    let queue = Arc::new(PostgresQueue::new(pool.clone()));
    let aws = AwsProvider::from_env(config.tasks.dock.clone(), config.wait_timeout).await;

    let runtime = ShivaRuntime::builder()
        .store(store)
        .queue(queue)
        .provider(Provider::from_shared(Arc::new(aws)))
        .settings(config.tasks)
        .dispatcher(config.dispatcher)
        .event_sweeper(config.event_sweeper)
        .build()?
        .start()
        .await?;

    if !runtime.health_check().await {
        error!("Database health check failed");
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
