//! Delays, running/paused flags, run logs and cycle activity.

use uuid::Uuid;

use super::models::*;
use super::Store;
use crate::error::Result;
use crate::utils::time::now_ts;

impl Store {
    // ------------------------------------------------------------------
    // Delays
    // ------------------------------------------------------------------

    /// Pause between two cycles (default 300s).
    pub async fn ad_delay(&self, user_id: UserId) -> u64 {
        let default = self.defaults().ad_delay_secs;
        self.read(|doc| doc.ad_delays.get(&user_id).copied().unwrap_or(default))
            .await
    }

    pub async fn set_ad_delay(&self, user_id: UserId, secs: u64) -> Result<()> {
        self.mutate(|doc| {
            doc.ad_delays.insert(user_id, secs);
        })
        .await
    }

    /// Pause between two sends (default 15s).
    pub async fn group_msg_delay(&self, user_id: UserId) -> u64 {
        let default = self.defaults().group_delay_secs;
        self.read(|doc| doc.group_msg_delays.get(&user_id).copied().unwrap_or(default))
            .await
    }

    pub async fn set_group_msg_delay(&self, user_id: UserId, secs: u64) -> Result<()> {
        self.mutate(|doc| {
            doc.group_msg_delays.insert(user_id, secs);
        })
        .await
    }

    /// Extra cooldown inserted every few cycles (default 600s).
    pub async fn cycle_timeout(&self, user_id: UserId) -> u64 {
        let default = self.defaults().cycle_timeout_secs;
        self.read(|doc| doc.cycle_timeouts.get(&user_id).copied().unwrap_or(default))
            .await
    }

    pub async fn set_cycle_timeout(&self, user_id: UserId, secs: u64) -> Result<()> {
        self.mutate(|doc| {
            doc.cycle_timeouts.insert(user_id, secs);
        })
        .await
    }

    // ------------------------------------------------------------------
    // Broadcast state
    // ------------------------------------------------------------------

    pub async fn broadcast_state(&self, user_id: UserId) -> BroadcastState {
        self.read(|doc| doc.broadcast_states.get(&user_id).copied().unwrap_or_default())
            .await
    }

    pub async fn set_broadcast_state(&self, user_id: UserId, running: bool, paused: bool) -> Result<()> {
        self.mutate(|doc| {
            let state = doc.broadcast_states.entry(user_id).or_default();
            state.running = running;
            state.paused = paused;
            state.updated_at = now_ts();
        })
        .await
    }

    pub async fn set_paused(&self, user_id: UserId, paused: bool) -> Result<()> {
        self.mutate(|doc| {
            let state = doc.broadcast_states.entry(user_id).or_default();
            state.paused = paused;
            state.updated_at = now_ts();
        })
        .await
    }

    /// `running = true, paused = false` and stamp the start time.
    pub async fn mark_started(&self, user_id: UserId) -> Result<()> {
        self.mutate(|doc| {
            let now = now_ts();
            let state = doc.broadcast_states.entry(user_id).or_default();
            state.running = true;
            state.paused = false;
            state.started_at = Some(now);
            state.updated_at = now;
        })
        .await
    }

    /// `running = false, paused = false`.
    pub async fn mark_stopped(&self, user_id: UserId) -> Result<()> {
        self.set_broadcast_state(user_id, false, false).await
    }

    /// Users whose durable state says a broadcast is running.
    pub async fn running_users(&self) -> Vec<UserId> {
        self.read(|doc| {
            doc.broadcast_states
                .iter()
                .filter(|(_, s)| s.running)
                .map(|(id, _)| *id)
                .collect()
        })
        .await
    }

    // ------------------------------------------------------------------
    // Run log
    // ------------------------------------------------------------------

    /// Open a run log entry with status `running`. Returns its id.
    pub async fn log_broadcast(&self, user_id: UserId, account_count: usize, group_count: usize) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let entry = BroadcastLog {
            id: id.clone(),
            user_id,
            account_count,
            group_count,
            status: RunStatus::Running,
            started_at: now_ts(),
            ended_at: None,
            cycles: 0,
            error: None,
        };
        self.mutate(|doc| doc.broadcast_logs.push(entry)).await?;
        Ok(id)
    }

    /// Close the running entry of a user.
    pub async fn update_broadcast_log(
        &self,
        user_id: UserId,
        status: RunStatus,
        cycles: u64,
        error: Option<String>,
    ) -> Result<bool> {
        self.mutate(|doc| {
            match doc
                .broadcast_logs
                .iter_mut()
                .rev()
                .find(|l| l.user_id == user_id && l.status == RunStatus::Running)
            {
                Some(log) => {
                    log.status = status;
                    log.cycles = cycles;
                    log.error = error;
                    log.ended_at = (status != RunStatus::Running).then(now_ts);
                    true
                }
                None => false,
            }
        })
        .await
    }

    pub async fn broadcast_logs(&self, user_id: UserId) -> Vec<BroadcastLog> {
        self.read(|doc| {
            doc.broadcast_logs
                .iter()
                .filter(|l| l.user_id == user_id)
                .cloned()
                .collect()
        })
        .await
    }

    // ------------------------------------------------------------------
    // Cycle activity
    // ------------------------------------------------------------------

    pub async fn log_broadcast_activity(&self, user_id: UserId, cycle: u64, sent: u64, failed: u64) -> Result<()> {
        self.mutate(|doc| {
            doc.broadcast_activity.push(ActivityEntry {
                user_id,
                cycle,
                sent,
                failed,
                at: now_ts(),
            })
        })
        .await
    }

    pub async fn broadcast_activity(&self, user_id: UserId) -> Vec<ActivityEntry> {
        self.read(|doc| {
            doc.broadcast_activity
                .iter()
                .filter(|a| a.user_id == user_id)
                .cloned()
                .collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delay_defaults_and_overrides() {
        let store = Store::new_memory();
        assert_eq!(store.ad_delay(1).await, 300);
        assert_eq!(store.group_msg_delay(1).await, 15);
        assert_eq!(store.cycle_timeout(1).await, 600);

        store.set_ad_delay(1, 120).await.unwrap();
        store.set_group_msg_delay(1, 30).await.unwrap();
        store.set_cycle_timeout(1, 900).await.unwrap();
        assert_eq!(store.ad_delay(1).await, 120);
        assert_eq!(store.group_msg_delay(1).await, 30);
        assert_eq!(store.cycle_timeout(1).await, 900);
    }

    #[tokio::test]
    async fn test_broadcast_state_default_stopped() {
        let store = Store::new_memory();
        let state = store.broadcast_state(1).await;
        assert!(!state.running);
        assert!(!state.paused);
    }

    #[tokio::test]
    async fn test_started_then_stopped() {
        let store = Store::new_memory();
        store.mark_started(1).await.unwrap();
        store.set_paused(1, true).await.unwrap();
        assert!(store.broadcast_state(1).await.paused);
        assert_eq!(store.running_users().await, vec![1]);

        store.mark_stopped(1).await.unwrap();
        let state = store.broadcast_state(1).await;
        assert!(!state.running);
        assert!(!state.paused);
        assert!(store.running_users().await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_log_lifecycle() {
        let store = Store::new_memory();
        let id = store.log_broadcast(1, 2, 10).await.unwrap();
        assert!(store
            .update_broadcast_log(1, RunStatus::Stopped, 4, None)
            .await
            .unwrap());

        let logs = store.broadcast_logs(1).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].id, id);
        assert_eq!(logs[0].status, RunStatus::Stopped);
        assert_eq!(logs[0].cycles, 4);
        assert!(logs[0].ended_at.is_some());

        // nothing left running
        assert!(!store
            .update_broadcast_log(1, RunStatus::Crashed, 0, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_activity_log() {
        let store = Store::new_memory();
        store.log_broadcast_activity(1, 1, 5, 1).await.unwrap();
        store.log_broadcast_activity(2, 1, 0, 0).await.unwrap();
        let entries = store.broadcast_activity(1).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sent, 5);
    }
}
