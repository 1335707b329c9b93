//! Broadcast supervisor
//!
//! Owns one background task per user. Starting a broadcast connects the
//! user's accounts, analyzes the selected groups, marks the durable state as
//! running and spawns a [`CycleEngine`]. Whatever way the task ends (stop,
//! schedule end, error, panic), its cleanup disconnects the clients, writes
//! `running = false`, closes the run log and removes the handle.
//!
//! # Example
//!
//! ```ignore
//! let supervisor = BroadcastSupervisor::new(store, vault, factory, relay, &config);
//! match supervisor.start(user_id).await? {
//!     StartOutcome::Started(report) => println!("{} targets", report.targets),
//!     other => println!("not started: {:?}", other),
//! }
//! supervisor.stop(user_id).await?;
//! ```

pub mod engine;
pub mod message;
pub mod schedule;

pub use engine::{Clock, CycleEngine, EngineAccount, EngineConfig, EngineExit};
pub use message::{select_message, WorkingSet};
pub use schedule::{format_time, parse_time, Schedule};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::analyzer::{analyze, resolve_targets};
use crate::config::Config;
use crate::error::{AdError, Result, SendError};
use crate::log_component;
use crate::relay::messages::{self, StartedInfo};
use crate::relay::LogRelay;
use crate::store::{mask_phone, MessageSource, RunStatus, Store, UserId};
use crate::telegram::{AccountCredentials, ClientFactory, TelegramClient};
use crate::vault::Vault;

/// Lifecycle of a user's broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastPhase {
    Stopped,
    Starting,
    Running,
    Paused,
}

impl fmt::Display for BroadcastPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BroadcastPhase::Stopped => "stopped",
            BroadcastPhase::Starting => "starting",
            BroadcastPhase::Running => "running",
            BroadcastPhase::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// What a successful start set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    pub run_id: String,
    pub accounts: usize,
    pub targets: usize,
    pub usable: usize,
    pub restricted: usize,
    pub sends_per_cycle: usize,
}

/// Result of [`BroadcastSupervisor::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(StartReport),
    AlreadyRunning,
    /// The user has not pressed `/start` in the logger bot
    LoggerNotStarted,
    NoAccounts,
    /// Nothing selected, or nothing left after the mode filter
    NoTargets,
    /// `stop` arrived while accounts were still connecting
    Cancelled,
}

struct BroadcastHandle {
    run_id: String,
    token: CancellationToken,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct Runs {
    handles: HashMap<UserId, BroadcastHandle>,
    /// Starts still in analysis, with the token their task will run under
    starting: HashMap<UserId, CancellationToken>,
}

struct Inner {
    store: Store,
    vault: Arc<Vault>,
    factory: Arc<dyn ClientFactory>,
    relay: LogRelay,
    engine: EngineConfig,
    admin_ids: Vec<i64>,
    runs: Mutex<Runs>,
}

/// Starts, tracks and stops per-user broadcast tasks.
#[derive(Clone)]
pub struct BroadcastSupervisor {
    inner: Arc<Inner>,
}

impl BroadcastSupervisor {
    pub fn new(
        store: Store,
        vault: Arc<Vault>,
        factory: Arc<dyn ClientFactory>,
        relay: LogRelay,
        config: &Config,
    ) -> Self {
        Self::with_engine_config(
            store,
            vault,
            factory,
            relay,
            EngineConfig::from(&config.broadcast),
            config.bot.admin_ids.clone(),
        )
    }

    pub fn with_engine_config(
        store: Store,
        vault: Arc<Vault>,
        factory: Arc<dyn ClientFactory>,
        relay: LogRelay,
        engine: EngineConfig,
        admin_ids: Vec<i64>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                vault,
                factory,
                relay,
                engine,
                admin_ids,
                runs: Mutex::new(Runs::default()),
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Whether this process has a live task for the user.
    pub async fn is_running(&self, user_id: UserId) -> bool {
        self.inner.runs.lock().await.handles.contains_key(&user_id)
    }

    pub async fn active_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.inner.runs.lock().await.handles.keys().copied().collect();
        users.sort_unstable();
        users
    }

    pub async fn phase(&self, user_id: UserId) -> BroadcastPhase {
        {
            let runs = self.inner.runs.lock().await;
            if runs.starting.contains_key(&user_id) {
                return BroadcastPhase::Starting;
            }
            if !runs.handles.contains_key(&user_id) {
                return BroadcastPhase::Stopped;
            }
        }
        if self.inner.store.broadcast_state(user_id).await.paused {
            BroadcastPhase::Paused
        } else {
            BroadcastPhase::Running
        }
    }

    /// Analyze the user's groups and spawn the broadcast task.
    pub async fn start(&self, user_id: UserId) -> Result<StartOutcome> {
        let token = CancellationToken::new();
        {
            let mut runs = self.inner.runs.lock().await;
            if runs.handles.contains_key(&user_id) || runs.starting.contains_key(&user_id) {
                return Ok(StartOutcome::AlreadyRunning);
            }
            if self.inner.store.broadcast_state(user_id).await.running {
                return Ok(StartOutcome::AlreadyRunning);
            }
            runs.starting.insert(user_id, token.clone());
        }

        let prepared = self.prepare(user_id, &token).await;
        let mut runs = self.inner.runs.lock().await;
        runs.starting.remove(&user_id);

        let (engine, clients, report) = match prepared {
            Ok(Prepared::Ready(engine, clients, report)) => (engine, clients, report),
            Ok(Prepared::Rejected(outcome, clients)) => {
                disconnect_all(&clients).await;
                return Ok(outcome);
            }
            Err(e) => return Err(e),
        };

        // Stopped after the state was already marked running
        if token.is_cancelled() {
            drop(engine);
            disconnect_all(&clients).await;
            self.inner.store.mark_stopped(user_id).await?;
            self.inner
                .store
                .update_broadcast_log(user_id, RunStatus::Stopped, 0, Some("stopped during start".into()))
                .await?;
            info!(user_id, "Broadcast start cancelled");
            return Ok(StartOutcome::Cancelled);
        }

        let supervisor = self.clone();
        let run_id = report.run_id.clone();
        let task_token = token.clone();
        let join = tokio::spawn(async move {
            supervisor
                .drive(user_id, run_id, engine, clients, task_token)
                .await;
        });
        runs.handles.insert(
            user_id,
            BroadcastHandle {
                run_id: report.run_id.clone(),
                token,
                join,
            },
        );

        log_component!(
            info,
            "engine",
            "Broadcast started",
            user_id = user_id,
            accounts = report.accounts,
            targets = report.targets
        );
        Ok(StartOutcome::Started(report))
    }

    async fn prepare(&self, user_id: UserId, token: &CancellationToken) -> Result<Prepared> {
        let store = &self.inner.store;
        let relay = &self.inner.relay;

        if !store.logger_started(user_id).await {
            return Ok(Prepared::Rejected(StartOutcome::LoggerNotStarted, Vec::new()));
        }

        let accounts = store.active_accounts(user_id).await;
        if accounts.is_empty() {
            return Ok(Prepared::Rejected(StartOutcome::NoAccounts, Vec::new()));
        }
        let creds = accounts
            .iter()
            .map(|a| AccountCredentials::unseal(a, &self.inner.vault))
            .collect::<Result<Vec<_>>>()?;

        let connects = join_all(creds.iter().map(|c| self.inner.factory.connect(c))).await;
        let mut connected: Vec<(String, String, Arc<dyn TelegramClient>)> = Vec::new();
        for (account, result) in accounts.iter().zip(connects) {
            match result {
                Ok(client) => connected.push((account.id.clone(), account.phone_number.clone(), client)),
                Err(SendError::SessionInvalid(e)) => {
                    warn!(user_id, phone = %mask_phone(&account.phone_number), "Session revoked: {}", e);
                    store.deactivate_account(user_id, &account.id).await?;
                }
                Err(e) => {
                    warn!(user_id, phone = %mask_phone(&account.phone_number), "Could not connect: {}", e);
                }
            }
        }
        if connected.is_empty() {
            return Err(AdError::Credentials(
                "no account could connect, please re-authenticate".into(),
            ));
        }
        let clients: Vec<Arc<dyn TelegramClient>> =
            connected.iter().map(|(_, _, c)| Arc::clone(c)).collect();

        let targets = resolve_targets(
            &store.target_groups(user_id).await,
            &store.forum_groups(user_id).await,
        );
        let mode = store.broadcast_mode(user_id).await;
        if targets.is_empty() {
            relay.spawn(user_id, messages::no_targets());
            return Ok(Prepared::Rejected(StartOutcome::NoTargets, clients));
        }

        relay.spawn(user_id, messages::analysis_start(mode, targets.len()));
        let analyses = join_all(
            connected
                .iter()
                .map(|(_, _, client)| analyze(client.as_ref(), &targets, mode)),
        )
        .await;

        // The first account's view is what the user sees
        let first = &analyses[0];
        relay.spawn(user_id, messages::analysis_complete(targets.len(), first));
        if analyses.iter().all(|a| a.targets.is_empty()) {
            relay.spawn(user_id, messages::no_targets());
            return Ok(Prepared::Rejected(StartOutcome::NoTargets, clients));
        }

        let report_targets = first.targets.len();
        let report = StartReport {
            run_id: String::new(),
            accounts: connected.len(),
            targets: report_targets,
            usable: first.usable.len(),
            restricted: first.restricted.len(),
            sends_per_cycle: analyses.iter().map(|a| a.total_sends_per_cycle()).sum(),
        };
        let total_topics: usize = first
            .targets
            .iter()
            .filter(|t| t.is_forum)
            .map(|t| t.topics.len())
            .sum();

        let accounts: Vec<EngineAccount> = connected
            .into_iter()
            .zip(analyses)
            .map(|((account_id, phone, client), analysis)| EngineAccount {
                account_id,
                phone,
                client,
                working_set: WorkingSet::new(analysis.targets),
            })
            .collect();

        if token.is_cancelled() {
            return Ok(Prepared::Rejected(StartOutcome::Cancelled, clients));
        }
        store.mark_started(user_id).await?;
        let run_id = store
            .log_broadcast(user_id, accounts.len(), report_targets)
            .await?;

        let ad_delay = store.ad_delay(user_id).await;
        let group_delay = store.group_msg_delay(user_id).await;
        let post_link = store.message_source(user_id).await == MessageSource::PostLink
            && store.post_link(user_id).await.is_some();
        relay.spawn(
            user_id,
            messages::broadcast_started(&StartedInfo {
                mode,
                post_link,
                cycle_interval_secs: ad_delay,
                group_delay_secs: group_delay,
                group_count: report_targets,
                total_topics,
            }),
        );
        relay.spawn(
            user_id,
            messages::setup_complete(accounts.len(), report.usable, ad_delay, group_delay),
        );

        let mut engine = CycleEngine::new(
            user_id,
            store.clone(),
            relay.clone(),
            self.inner.engine,
            accounts,
        );
        if let Some(window) = store.schedule(user_id).await {
            match Schedule::from_window(&window) {
                Some(schedule) => engine = engine.with_schedule(schedule),
                None => warn!(user_id, "Ignoring unparseable schedule {:?}", window),
            }
        }

        Ok(Prepared::Ready(engine, clients, StartReport { run_id, ..report }))
    }

    /// Body of the spawned task. Cleanup always runs.
    async fn drive(
        &self,
        user_id: UserId,
        run_id: String,
        mut engine: CycleEngine,
        clients: Vec<Arc<dyn TelegramClient>>,
        token: CancellationToken,
    ) {
        let result = std::panic::AssertUnwindSafe(engine.run(&token))
            .catch_unwind()
            .await;
        let cycles = engine.cycles();
        drop(engine);

        let failure = match result {
            Ok(Ok(exit)) => {
                info!(user_id, cycles, "Broadcast loop ended: {:?}", exit);
                if matches!(exit, EngineExit::Cancelled | EngineExit::StateCleared) {
                    self.inner.relay.spawn(user_id, messages::broadcast_stopped(cycles));
                }
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("broadcast task panicked".to_string()),
        };

        disconnect_all(&clients).await;

        let store = &self.inner.store;
        if let Err(e) = store.mark_stopped(user_id).await {
            error!(user_id, "Failed to clear running state: {}", e);
        }
        let status = if failure.is_some() {
            RunStatus::Crashed
        } else {
            RunStatus::Stopped
        };
        if let Err(e) = store
            .update_broadcast_log(user_id, status, cycles, failure.clone())
            .await
        {
            error!(user_id, "Failed to close run log: {}", e);
        }

        if let Some(reason) = failure {
            log_component!(error, "engine", "Broadcast crashed", user_id = user_id, cycles = cycles);
            error!(user_id, "Broadcast crashed: {}", reason);
            self.inner
                .relay
                .send(user_id, &messages::broadcast_crashed(&reason))
                .await;
            self.inner
                .relay
                .notify_admins(
                    &self.inner.admin_ids,
                    &messages::admin_crash_report(user_id, &reason),
                )
                .await;
        }

        let mut runs = self.inner.runs.lock().await;
        if runs
            .handles
            .get(&user_id)
            .is_some_and(|h| h.run_id == run_id)
        {
            runs.handles.remove(&user_id);
        }
    }

    /// Cancel and await the user's task, then clear the durable state. A
    /// start still connecting is cancelled and will not spawn its task.
    ///
    /// Returns whether a task was running or starting in this process.
    pub async fn stop(&self, user_id: UserId) -> Result<bool> {
        let (handle, pending) = {
            let mut runs = self.inner.runs.lock().await;
            let handle = runs.handles.remove(&user_id);
            let pending = runs.starting.get(&user_id).cloned();
            (handle, pending)
        };
        let was_running = handle.is_some() || pending.is_some();
        if let Some(pending) = pending {
            pending.cancel();
        }
        if let Some(handle) = handle {
            handle.token.cancel();
            if let Err(e) = handle.join.await {
                warn!(user_id, "Broadcast task ended abnormally: {}", e);
            }
        }
        self.inner.store.mark_stopped(user_id).await?;
        log_component!(info, "engine", "Broadcast stopped", user_id = user_id);
        Ok(was_running)
    }

    /// Stop every task. Used on shutdown.
    pub async fn stop_all(&self) {
        let users = self.active_users().await;
        for user_id in users {
            if let Err(e) = self.stop(user_id).await {
                error!(user_id, "Failed to stop broadcast: {}", e);
            }
        }
    }

    /// Clear `running` flags left behind by a previous process.
    pub async fn reset_stale_states(&self) -> Result<usize> {
        let live = self.active_users().await;
        let mut cleared = 0;
        for user_id in self.inner.store.running_users().await {
            if !live.contains(&user_id) {
                self.inner.store.mark_stopped(user_id).await?;
                self.inner
                    .store
                    .update_broadcast_log(user_id, RunStatus::Stopped, 0, Some("process restarted".into()))
                    .await?;
                cleared += 1;
            }
        }
        if cleared > 0 {
            info!(cleared, "Cleared stale running broadcast states");
        }
        Ok(cleared)
    }
}

enum Prepared {
    Ready(CycleEngine, Vec<Arc<dyn TelegramClient>>, StartReport),
    Rejected(StartOutcome, Vec<Arc<dyn TelegramClient>>),
}

async fn disconnect_all(clients: &[Arc<dyn TelegramClient>]) {
    join_all(clients.iter().map(|c| c.disconnect())).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::error::AuthError;
    use crate::relay::{DmSender, MockDmSender};
    use crate::store::NewAccount;
    use crate::telegram::{DialogKind, LoggedIn, LoginStep, MemoryAccount, MemoryBackend};
    use std::time::Duration;

    fn relay(store: &Store) -> LogRelay {
        let mut mock = MockDmSender::new();
        mock.expect_send_html().returning(|_, _| Ok(()));
        mock.expect_ping().returning(|| Ok(()));
        LogRelay::new(store.clone(), Arc::new(mock) as Arc<dyn DmSender>)
    }

    async fn fixture() -> (BroadcastSupervisor, MemoryBackend, Store) {
        let vault = Arc::new(Vault::from_key(&[7u8; 32]).unwrap());
        let store = Store::new_memory();
        let backend = MemoryBackend::new();
        backend.add_account(
            "sess",
            MemoryAccount::new(10, "+15550001")
                .with_group(-1, "A", DialogKind::Supergroup)
                .with_saved(&[1]),
        );
        store.create_user(1, None, None).await.unwrap();
        store.set_logger_status(1, true).await.unwrap();
        store
            .add_account(
                1,
                NewAccount {
                    phone_number: "+15550001".into(),
                    first_name: None,
                    last_name: None,
                    session_sealed: vault.encrypt("sess").unwrap(),
                    api_id: 1,
                    api_hash_sealed: vault.encrypt("hash").unwrap(),
                },
            )
            .await
            .unwrap();
        store.add_target_group(1, -1, "A").await.unwrap();
        let supervisor = BroadcastSupervisor::with_engine_config(
            store.clone(),
            vault,
            Arc::new(backend.clone()),
            relay(&store),
            EngineConfig::default(),
            vec![],
        );
        (supervisor, backend, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_then_stop_clears_state() {
        let (supervisor, backend, store) = fixture().await;
        let outcome = supervisor.start(1).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Started(_)));
        assert!(supervisor.is_running(1).await);
        assert!(store.broadcast_state(1).await.running);

        assert_eq!(supervisor.start(1).await.unwrap(), StartOutcome::AlreadyRunning);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(supervisor.stop(1).await.unwrap());
        assert!(!supervisor.is_running(1).await);
        assert!(!store.broadcast_state(1).await.running);
        assert_eq!(backend.disconnects(), 1);
        let logs = store.broadcast_logs(1).await;
        assert_eq!(logs[0].status, RunStatus::Stopped);
    }

    /// Delays every connect by two seconds.
    struct SlowFactory(MemoryBackend);

    #[async_trait]
    impl ClientFactory for SlowFactory {
        async fn connect(
            &self,
            creds: &AccountCredentials,
        ) -> std::result::Result<Arc<dyn TelegramClient>, SendError> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            self.0.connect(creds).await
        }

        async fn request_code(
            &self,
            api_id: i32,
            api_hash: &str,
            phone: &str,
        ) -> std::result::Result<String, AuthError> {
            self.0.request_code(api_id, api_hash, phone).await
        }

        async fn submit_code(
            &self,
            login_id: &str,
            code: &str,
        ) -> std::result::Result<LoginStep, AuthError> {
            self.0.submit_code(login_id, code).await
        }

        async fn submit_password(
            &self,
            login_id: &str,
            password: &str,
        ) -> std::result::Result<LoggedIn, AuthError> {
            self.0.submit_password(login_id, password).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_connect_prevents_start() {
        let (_, backend, store) = fixture().await;
        let supervisor = BroadcastSupervisor::with_engine_config(
            store.clone(),
            Arc::new(Vault::from_key(&[7u8; 32]).unwrap()),
            Arc::new(SlowFactory(backend.clone())),
            relay(&store),
            EngineConfig::default(),
            vec![],
        );

        let starter = supervisor.clone();
        let start = tokio::spawn(async move { starter.start(1).await.unwrap() });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(supervisor.phase(1).await, BroadcastPhase::Starting);
        assert!(supervisor.stop(1).await.unwrap());

        assert_eq!(start.await.unwrap(), StartOutcome::Cancelled);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!supervisor.is_running(1).await);
        assert!(!store.broadcast_state(1).await.running);
        assert!(backend.attempts().is_empty());
        assert_eq!(backend.disconnects(), 1);
        assert_eq!(supervisor.phase(1).await, BroadcastPhase::Stopped);
    }

    #[tokio::test]
    async fn test_stop_without_task_still_clears_flag() {
        let (supervisor, _, store) = fixture().await;
        store.mark_started(1).await.unwrap();
        assert!(!supervisor.stop(1).await.unwrap());
        assert!(!store.broadcast_state(1).await.running);
    }

    #[tokio::test]
    async fn test_logger_gate() {
        let (supervisor, _, store) = fixture().await;
        store.set_logger_status(1, false).await.unwrap();
        assert_eq!(supervisor.start(1).await.unwrap(), StartOutcome::LoggerNotStarted);
        assert!(!store.broadcast_state(1).await.running);
    }

    #[tokio::test]
    async fn test_no_targets_stays_stopped() {
        let (supervisor, backend, store) = fixture().await;
        store.remove_target_group(1, -1).await.unwrap();
        assert_eq!(supervisor.start(1).await.unwrap(), StartOutcome::NoTargets);
        assert!(!store.broadcast_state(1).await.running);
        assert!(!supervisor.is_running(1).await);
        assert_eq!(backend.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_undecryptable_account_asks_reauth() {
        let (_, backend, store) = fixture().await;
        let other_key = Arc::new(Vault::from_key(&[9u8; 32]).unwrap());
        let supervisor = BroadcastSupervisor::with_engine_config(
            store.clone(),
            other_key,
            Arc::new(backend),
            relay(&store),
            EngineConfig::default(),
            vec![],
        );
        let err = supervisor.start(1).await.unwrap_err();
        assert!(err.to_string().contains("re-authenticate"));
        assert_eq!(supervisor.phase(1).await, BroadcastPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_cleanup_when_messages_run_out() {
        let (supervisor, backend, store) = fixture().await;
        backend.add_account(
            "sess",
            MemoryAccount::new(10, "+15550001").with_group(-1, "A", DialogKind::Supergroup),
        );
        assert!(matches!(supervisor.start(1).await.unwrap(), StartOutcome::Started(_)));
        for _ in 0..10 {
            if !supervisor.is_running(1).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!supervisor.is_running(1).await);
        assert!(!store.broadcast_state(1).await.running);
    }

    #[tokio::test]
    async fn test_reset_stale_states() {
        let (supervisor, _, store) = fixture().await;
        store.mark_started(1).await.unwrap();
        assert_eq!(supervisor.reset_stale_states().await.unwrap(), 1);
        assert!(store.running_users().await.is_empty());
    }
}
