// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud provider adapter.
//!
//! Compute instances, auto scaling groups with their launch configurations,
//! and identity users are reached through three traits. Implementations are
//! one-to-one wraps of the provider calls: they perform no deduplication and
//! no ordering, and every failure they return has already been through
//! [`crate::error::classify_provider_error`].

#[cfg(feature = "aws")]
pub mod aws;
pub mod mock;
mod traits;

#[cfg(feature = "aws")]
pub use aws::AwsProvider;
pub use mock::MockProvider;
pub use traits::*;
