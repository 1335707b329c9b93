//! Per-user group/topic cache.
//!
//! A denormalized snapshot of every group, supergroup and forum the user's
//! linked accounts have joined. It only speeds up group selection; Telegram
//! stays authoritative.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{Result, SendError};
use crate::log_component;
use crate::store::{mask_phone, Account, CachedGroup, Store, UserId};
use crate::telegram::{AccountCredentials, ClientFactory};
use crate::utils::time::now_ts;
use crate::vault::Vault;

/// Cached groups split by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSnapshot {
    pub groups: Vec<CachedGroup>,
    pub forums: Vec<CachedGroup>,
}

impl GroupSnapshot {
    pub fn from_cached(cached: Vec<CachedGroup>) -> Self {
        let (forums, groups): (Vec<_>, Vec<_>) =
            cached.into_iter().partition(|g| g.kind.is_forum());
        Self { groups, forums }
    }

    pub fn len(&self) -> usize {
        self.groups.len() + self.forums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, group_id: i64) -> Option<&CachedGroup> {
        self.groups
            .iter()
            .chain(self.forums.iter())
            .find(|g| g.group_id == group_id)
    }
}

/// Enumerates dialogs across a user's accounts and persists the result.
#[derive(Clone)]
pub struct GroupCache {
    store: Store,
    vault: Arc<Vault>,
    factory: Arc<dyn ClientFactory>,
}

impl GroupCache {
    pub fn new(store: Store, vault: Arc<Vault>, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            store,
            vault,
            factory,
        }
    }

    /// Re-enumerate every account and upsert the persisted snapshot. Groups
    /// that disappeared are pruned only when every account answered.
    pub async fn refresh(&self, user_id: UserId) -> Result<GroupSnapshot> {
        let Enumeration { groups, complete } = self.enumerate(user_id).await;
        let seen: HashSet<i64> = groups.iter().map(|g| g.group_id).collect();
        let saved = self.store.save_groups_to_cache(user_id, groups).await?;
        let pruned = if complete {
            self.store.prune_groups_cache(user_id, &seen).await?
        } else {
            0
        };
        log_component!(
            info,
            "cache",
            "Group cache refreshed",
            user_id = user_id,
            groups = saved,
            pruned = pruned,
            complete = complete
        );
        Ok(GroupSnapshot::from_cached(
            self.store.cached_groups(user_id).await,
        ))
    }

    /// The persisted snapshot, or a fresh one when nothing is cached yet.
    pub async fn get(&self, user_id: UserId) -> Result<GroupSnapshot> {
        let cached = self.store.cached_groups(user_id).await;
        if cached.is_empty() {
            debug!(user_id, "Group cache cold, refreshing");
            return self.refresh(user_id).await;
        }
        Ok(GroupSnapshot::from_cached(cached))
    }

    /// Add groups joined since the last refresh. Stale entries are kept.
    pub async fn incremental_refresh(&self, user_id: UserId) -> Result<usize> {
        let Enumeration { groups, .. } = self.enumerate(user_id).await;
        let added = self.store.add_new_groups_to_cache(user_id, groups).await?;
        info!(user_id, added, "Incremental group cache refresh");
        Ok(added)
    }

    /// All groups across active accounts, deduplicated by id (first account wins).
    async fn enumerate(&self, user_id: UserId) -> Enumeration {
        let accounts = self.store.active_accounts(user_id).await;
        let results = join_all(accounts.iter().map(|a| self.enumerate_account(a))).await;

        let mut seen = HashSet::new();
        let mut all = Vec::new();
        let mut complete = true;
        for (account, result) in accounts.iter().zip(results) {
            match result {
                Ok(groups) => {
                    for g in groups {
                        if seen.insert(g.group_id) {
                            all.push(g);
                        }
                    }
                }
                Err(e) => {
                    complete = false;
                    warn!(
                        user_id,
                        phone = %mask_phone(&account.phone_number),
                        "Skipping account during group enumeration: {}",
                        e
                    );
                    if matches!(e, AccountFailure::Invalid(_)) {
                        if let Err(err) = self.store.deactivate_account(user_id, &account.id).await {
                            warn!(user_id, "Failed to deactivate account: {}", err);
                        }
                    }
                }
            }
        }
        Enumeration {
            groups: all,
            complete,
        }
    }

    async fn enumerate_account(&self, account: &Account) -> std::result::Result<Vec<CachedGroup>, AccountFailure> {
        let creds = AccountCredentials::unseal(account, &self.vault)
            .map_err(|e| AccountFailure::Invalid(e.to_string()))?;
        let client = self.factory.connect(&creds).await.map_err(AccountFailure::from)?;

        let dialogs = match client.dialogs().await {
            Ok(d) => d,
            Err(e) => {
                client.disconnect().await;
                return Err(e.into());
            }
        };

        let now = now_ts();
        let mut groups = Vec::new();
        for dialog in dialogs {
            let Some(kind) = dialog.kind.group_kind() else {
                continue;
            };
            let topics = if kind.is_forum() {
                match client.forum_topics(dialog.id).await {
                    Ok(t) => t.into_iter().filter(|t| !t.closed).collect(),
                    Err(e) => {
                        debug!(group_id = dialog.id, "Topic fetch failed: {}", e);
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };
            groups.push(CachedGroup {
                user_id: account.user_id,
                group_id: dialog.id,
                title: dialog.title,
                username: dialog.username,
                kind,
                members_count: dialog.members_count,
                account_phone: account.phone_number.clone(),
                topics,
                cached_at: now,
            });
        }
        client.disconnect().await;
        Ok(groups)
    }
}

struct Enumeration {
    groups: Vec<CachedGroup>,
    /// Every active account answered
    complete: bool,
}

/// Why an account contributed no groups.
#[derive(Debug, Error)]
enum AccountFailure {
    /// Session or stored secret unusable; the account gets deactivated
    #[error("account invalid: {0}")]
    Invalid(String),
    #[error(transparent)]
    Other(SendError),
}

impl From<SendError> for AccountFailure {
    fn from(e: SendError) -> Self {
        match e {
            SendError::SessionInvalid(msg) => AccountFailure::Invalid(msg),
            other => AccountFailure::Other(other),
        }
    }
}
