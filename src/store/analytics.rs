//! Per-user counters, leaderboard and admin stats.

use tracing::{info, warn};

use super::models::*;
use super::Store;
use crate::error::Result;
use crate::utils::time::now_ts;

impl Store {
    pub async fn analytics(&self, user_id: UserId) -> Analytics {
        self.read(|doc| doc.analytics.get(&user_id).cloned().unwrap_or_default())
            .await
    }

    /// Count one send attempt against the user, the group and the account.
    pub async fn record_send(
        &self,
        user_id: UserId,
        success: bool,
        group_id: GroupId,
        account_id: &str,
    ) -> Result<()> {
        self.mutate(|doc| {
            let a = doc.analytics.entry(user_id).or_default();
            a.total_broadcasts += 1;
            let group = a.groups.entry(group_id).or_default();
            if success {
                group.sent += 1;
            } else {
                group.failed += 1;
            }
            let account = a.accounts.entry(account_id.to_string()).or_default();
            if success {
                account.sent += 1;
                a.total_sent += 1;
            } else {
                account.failed += 1;
                a.total_failed += 1;
            }
        })
        .await
    }

    /// Count a finished cycle and advance the rotation pointer
    /// to `(current + 1) mod count`, in one write.
    pub async fn increment_cycle(&self, user_id: UserId, rotation_count: u32) -> Result<u64> {
        let count = rotation_count.max(1);
        self.mutate(|doc| {
            let a = doc.analytics.entry(user_id).or_default();
            a.total_cycles += 1;
            a.last_cycle_at = Some(now_ts());
            let cycles = a.total_cycles;
            if let Some(user) = doc.users.get_mut(&user_id) {
                user.ad_cycle_index = (user.ad_cycle_index % count + 1) % count;
            }
            cycles
        })
        .await
    }

    /// Apply a counter pushed without group or account detail. A cycle goes
    /// through [`Store::increment_cycle`], so the rotation advances too.
    pub async fn apply_counter(&self, user_id: UserId, counter: Counter) -> Result<Analytics> {
        match counter {
            Counter::Cycle => {
                let count = self.saved_messages_count(user_id).await;
                self.increment_cycle(user_id, count).await?;
            }
            Counter::Sent | Counter::Failed => {
                self.mutate(|doc| {
                    let a = doc.analytics.entry(user_id).or_default();
                    a.total_broadcasts += 1;
                    if counter == Counter::Sent {
                        a.total_sent += 1;
                    } else {
                        a.total_failed += 1;
                    }
                })
                .await?;
            }
        }
        Ok(self.analytics(user_id).await)
    }

    /// Count a vouch post delivered to `channel`.
    pub async fn increment_vouch_success(&self, channel: &str) -> Result<()> {
        self.mutate(|doc| {
            let v = doc.vouch_stats.entry(channel.to_string()).or_default();
            v.successes += 1;
            v.updated_at = now_ts();
        })
        .await?;
        info!(channel, "Vouch delivered");
        Ok(())
    }

    /// Count a failed vouch post and keep its error.
    pub async fn increment_vouch_failure(&self, channel: &str, error: &str) -> Result<()> {
        self.mutate(|doc| {
            let v = doc.vouch_stats.entry(channel.to_string()).or_default();
            v.failures += 1;
            v.last_error = Some(error.to_string());
            v.updated_at = now_ts();
        })
        .await?;
        warn!(channel, "Vouch failed: {}", error);
        Ok(())
    }

    pub async fn vouch_stats(&self, channel: &str) -> VouchStats {
        self.read(|doc| doc.vouch_stats.get(channel).cloned().unwrap_or_default())
            .await
    }

    /// Top users by messages sent.
    pub async fn leaderboard(&self, limit: usize) -> Vec<(UserId, Option<String>, u64)> {
        self.read(|doc| {
            let mut rows: Vec<(UserId, Option<String>, u64)> = doc
                .analytics
                .iter()
                .filter(|(_, a)| a.total_sent > 0)
                .map(|(id, a)| {
                    let name = doc.users.get(id).map(|u| u.display_name());
                    (*id, name, a.total_sent)
                })
                .collect();
            rows.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
            rows.truncate(limit);
            rows
        })
        .await
    }

    pub async fn admin_stats(&self) -> AdminStats {
        self.read(|doc| AdminStats {
            total_users: doc.users.len(),
            total_accounts: doc.accounts.len(),
            active_logger_users: doc.logger_status.values().filter(|s| s.is_active).count(),
            total_forwards: doc.analytics.values().map(|a| a.total_sent).sum(),
            total_failed: doc.analytics.values().map(|a| a.total_failed).sum(),
            total_broadcasts: doc.analytics.values().map(|a| a.total_broadcasts).sum(),
            running_broadcasts: doc.broadcast_states.values().filter(|s| s.running).count(),
        })
        .await
    }
}

/// Counter addressed by [`Store::apply_counter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Cycle,
    Sent,
    Failed,
}
