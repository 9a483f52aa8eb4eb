// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Garbage collection of ephemeral dock identities.
//!
//! Every dock gets an identity user named `<prefix><org>-<suffix>`. Users
//! older than the oldest running dock can no longer be in use, except for
//! the newest user of each organization, which is always kept.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::error::ProviderError;
use crate::jobs::{IamCleanup, Job};
use crate::persistence::InstanceRole;
use crate::provider::{IdentityApi, IdentityUser, InstanceFilter};

use super::{TaskContext, TaskError, TaskOutcome};

/// Organization a dock identity belongs to, or `None` for users outside the
/// naming convention.
pub fn identity_org<'a>(prefix: &str, user_name: &'a str) -> Option<&'a str> {
    let rest = user_name.strip_prefix(prefix)?;
    let (org, suffix) = rest.rsplit_once('-')?;
    if org.is_empty() || suffix.is_empty() {
        return None;
    }
    Some(org)
}

/// Users that may be deleted: in the naming convention, created before
/// `remove_before`, and not the newest of their organization.
pub fn collectable(
    prefix: &str,
    users: Vec<IdentityUser>,
    remove_before: DateTime<Utc>,
) -> Vec<IdentityUser> {
    let mut by_org: BTreeMap<String, Vec<IdentityUser>> = BTreeMap::new();
    for user in users {
        if let Some(org) = identity_org(prefix, &user.user_name) {
            by_org.entry(org.to_string()).or_default().push(user);
        }
    }

    let mut out = Vec::new();
    for (_, mut org_users) in by_org {
        org_users.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.user_name.cmp(&a.user_name))
        });
        out.extend(
            org_users
                .into_iter()
                .skip(1)
                .filter(|u| u.created_at < remove_before),
        );
    }
    out
}

/// Delete stale dock identities.
///
/// For each user: inline policies, then access keys, then the user. A user
/// that vanished in between is skipped.
#[instrument(skip(ctx, job), fields(remove_before = %job.remove_before))]
pub async fn handle_iam_cleanup(
    ctx: &TaskContext,
    job: &IamCleanup,
) -> Result<TaskOutcome, TaskError> {
    let identity = &ctx.provider.identity;
    let users = identity.list_users(None).await?;
    let stale = collectable(&ctx.settings.iam_user_prefix, users, job.remove_before);

    if stale.is_empty() {
        return Ok(TaskOutcome::AlreadySatisfied(format!(
            "no identities created before {}",
            job.remove_before
        )));
    }

    let mut deleted = 0usize;
    for user in &stale {
        let name = user.user_name.as_str();
        match delete_identity(identity.as_ref(), name).await {
            Ok(()) => deleted += 1,
            Err(e) if e.is_not_found() => {
                debug!(user = %name, "Identity already deleted");
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(deleted, candidates = stale.len(), "Stale identities deleted");
    Ok(TaskOutcome::Completed)
}

async fn delete_identity(identity: &dyn IdentityApi, name: &str) -> Result<(), ProviderError> {
    identity.delete_all_user_policies(name).await?;
    identity.delete_all_user_access_keys(name).await?;
    identity.delete_user(name).await
}

/// Find the launch time of the oldest running dock and schedule a cleanup
/// of every identity created before it.
#[instrument(skip(ctx))]
pub async fn handle_oldest_launch_time_fetch(ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
    let docks = ctx
        .provider
        .compute
        .describe_instances(&InstanceFilter::running(InstanceRole::Dock))
        .await?;

    let oldest = docks
        .iter()
        .filter_map(|i| i.launch_time)
        .min()
        .ok_or_else(|| TaskError::Unresolved {
            what: "launch time",
            detail: "no running dock instances".to_string(),
        })?;

    debug!(oldest = %oldest, docks = docks.len(), "Oldest dock launch time");
    ctx.publish(Job::IamCleanup(IamCleanup {
        remove_before: oldest,
    }))
    .await?;

    Ok(TaskOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn user(name: &str, day: u32) -> IdentityUser {
        IdentityUser {
            user_name: name.to_string(),
            path: "/".to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_identity_org_parsing() {
        assert_eq!(identity_org("dock-", "dock-1234-abc"), Some("1234"));
        assert_eq!(identity_org("dock-", "dock-1234"), None);
        assert_eq!(identity_org("dock-", "admin"), None);
        assert_eq!(identity_org("dock-", "dock--abc"), None);
    }

    #[test]
    fn test_newest_user_per_org_is_never_collected() {
        let cutoff = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let users = vec![
            user("dock-1-a", 1),
            user("dock-1-b", 3),
            user("dock-1-c", 2),
            user("dock-2-a", 5),
            user("ci-bot", 1),
        ];

        let mut names: Vec<String> = collectable("dock-", users, cutoff)
            .into_iter()
            .map(|u| u.user_name)
            .collect();
        names.sort();

        assert_eq!(names, vec!["dock-1-a", "dock-1-c"]);
    }

    #[test]
    fn test_users_after_cutoff_are_kept() {
        let cutoff = Utc.with_ymd_and_hms(2025, 1, 2, 12, 0, 0).unwrap();
        let users = vec![user("dock-1-a", 1), user("dock-1-b", 3), user("dock-1-c", 5)];

        let stale = collectable("dock-", users, cutoff);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].user_name, "dock-1-a");
    }
}
