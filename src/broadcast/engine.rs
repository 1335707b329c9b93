//! The per-user cycle loop.
//!
//! One cycle visits every account in a fixed order and, per account, every
//! group of its working set in analysis order. Forums get one forward per
//! open topic. Each forward is followed by the group delay. After the pass the
//! rotation pointer advances, a summary is relayed and the engine sleeps the
//! cycle interval (plus a cooldown every few cycles).

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::message::{select_message, WorkingSet, SAVED_WINDOW};
use super::schedule::{format_time, Schedule};
use crate::config::BroadcastConfig;
use crate::error::{Disposition, Result, SendError};
use crate::log_component;
use crate::relay::{messages, LogRelay};
use crate::store::{mask_phone, MessageSource, Store, UserId};
use crate::telegram::TelegramClient;
use crate::utils::time::now_ist;

/// One connected account and the targets it still sends to.
pub struct EngineAccount {
    pub account_id: String,
    pub phone: String,
    pub client: Arc<dyn TelegramClient>,
    pub working_set: WorkingSet,
}

/// Engine knobs that are not per-user.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub cooldown_every_cycles: u64,
    pub flood_wait_buffer: Duration,
    pub schedule_poll: Duration,
    pub saved_fetch_limit: u32,
}

impl From<&BroadcastConfig> for EngineConfig {
    fn from(cfg: &BroadcastConfig) -> Self {
        Self {
            cooldown_every_cycles: cfg.cooldown_every_cycles.max(1),
            flood_wait_buffer: Duration::from_secs(cfg.flood_wait_buffer_secs),
            schedule_poll: Duration::from_secs(cfg.schedule_poll_secs.max(1)),
            saved_fetch_limit: cfg.saved_messages_fetch_limit.clamp(1, SAVED_WINDOW as u32),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&BroadcastConfig::default())
    }
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    /// Stop requested through the cancellation token
    Cancelled,
    /// The stored state was switched off from elsewhere
    StateCleared,
    /// Today's schedule window is over
    ScheduleEnded,
    /// No account had a message to forward
    NoMessages,
    /// Every working set is empty
    NoTargets,
}

/// Counts of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub sent: u64,
    pub failed: u64,
    pub had_message: bool,
}

/// Wall-clock time of day the schedule window is checked against.
pub type Clock = Arc<dyn Fn() -> NaiveTime + Send + Sync>;

fn ist_clock() -> Clock {
    Arc::new(|| now_ist().time())
}

pub struct CycleEngine {
    user_id: UserId,
    store: Store,
    relay: LogRelay,
    config: EngineConfig,
    accounts: Vec<EngineAccount>,
    schedule: Option<Schedule>,
    clock: Clock,
    deadline: Option<Instant>,
    cycles: u64,
    paused: bool,
}

impl CycleEngine {
    pub fn new(
        user_id: UserId,
        store: Store,
        relay: LogRelay,
        config: EngineConfig,
        accounts: Vec<EngineAccount>,
    ) -> Self {
        Self {
            user_id,
            store,
            relay,
            config,
            accounts,
            schedule: None,
            clock: ist_clock(),
            deadline: None,
            cycles: 0,
            paused: false,
        }
    }

    /// Restrict sending to a daily window. The run ends at the window's next
    /// end, computed once here.
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self.arm_deadline();
        self
    }

    /// Replace the IST wall clock. Re-arms the schedule deadline.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self.arm_deadline();
        self
    }

    fn arm_deadline(&mut self) {
        if let Some(schedule) = self.schedule {
            let remaining = schedule.remaining_today((self.clock)());
            self.deadline = Some(Instant::now() + remaining);
        }
    }

    /// Completed cycles of this run.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn accounts(&self) -> &[EngineAccount] {
        &self.accounts
    }

    /// Loop until cancelled, the schedule ends or nothing is left to send.
    pub async fn run(&mut self, token: &CancellationToken) -> Result<EngineExit> {
        let user_id = self.user_id;
        log_component!(info, "engine", "Broadcast loop started", user_id = user_id);

        loop {
            if token.is_cancelled() {
                return Ok(EngineExit::Cancelled);
            }
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                self.relay.spawn(user_id, messages::schedule_ended());
                return Ok(EngineExit::ScheduleEnded);
            }
            if !self.store.broadcast_state(user_id).await.running {
                return Ok(EngineExit::StateCleared);
            }
            if self.accounts.iter().all(|a| a.working_set.is_empty()) {
                self.relay.spawn(user_id, messages::no_targets());
                return Ok(EngineExit::NoTargets);
            }

            if let Some(schedule) = self.schedule {
                if !schedule.is_active_at((self.clock)()) {
                    if !self.paused {
                        self.paused = true;
                        self.store.set_paused(user_id, true).await?;
                        self.relay.spawn(
                            user_id,
                            messages::schedule_paused(
                                &format_time(schedule.start),
                                &format_time(schedule.end),
                            ),
                        );
                        info!(user_id, "Outside schedule window, pausing");
                    }
                    let mut wait = self.config.schedule_poll;
                    if let Some(deadline) = self.deadline {
                        wait = wait.min(deadline.saturating_duration_since(Instant::now()));
                    }
                    if !sleep_or_cancel(token, wait).await {
                        return Ok(EngineExit::Cancelled);
                    }
                    continue;
                }
                if self.paused {
                    self.paused = false;
                    self.store.set_paused(user_id, false).await?;
                    self.relay.spawn(user_id, messages::schedule_resumed());
                    info!(user_id, "Back inside schedule window, resuming");
                }
            }

            let outcome = match self.run_cycle(token).await? {
                Some(outcome) => outcome,
                None => return Ok(EngineExit::Cancelled),
            };
            if !outcome.had_message {
                self.relay.spawn(user_id, messages::no_messages());
                return Ok(EngineExit::NoMessages);
            }

            let count = self.store.saved_messages_count(user_id).await;
            self.store.increment_cycle(user_id, count).await?;
            self.cycles += 1;
            let cycle = self.cycles;
            self.store
                .log_broadcast_activity(user_id, cycle, outcome.sent, outcome.failed)
                .await?;

            let interval = self.store.ad_delay(user_id).await;
            self.relay.spawn(
                user_id,
                messages::cycle_summary(cycle, outcome.sent, outcome.failed, interval),
            );
            log_component!(
                info,
                "engine",
                "Cycle complete",
                user_id = user_id,
                cycle = cycle,
                sent = outcome.sent,
                failed = outcome.failed
            );

            if !sleep_or_cancel(token, Duration::from_secs(interval)).await {
                return Ok(EngineExit::Cancelled);
            }
            if cycle % self.config.cooldown_every_cycles == 0 {
                let cooldown = self.store.cycle_timeout(user_id).await;
                self.relay.spawn(user_id, messages::cooldown(cycle, cooldown));
                if !sleep_or_cancel(token, Duration::from_secs(cooldown)).await {
                    return Ok(EngineExit::Cancelled);
                }
            }
        }
    }

    /// One pass over every account. `None` when cancelled mid-cycle.
    pub async fn run_cycle(&mut self, token: &CancellationToken) -> Result<Option<CycleOutcome>> {
        let user_id = self.user_id;
        let rotation = self.store.current_rotation(user_id).await;
        let count = self.store.saved_messages_count(user_id).await;
        let source = self.store.message_source(user_id).await;
        let post_link = self.store.post_link(user_id).await;
        let group_delay = Duration::from_secs(self.store.group_msg_delay(user_id).await);
        let flood_buffer = self.config.flood_wait_buffer;
        let fetch_limit = self.config.saved_fetch_limit;

        let mut outcome = CycleOutcome::default();
        for account in self.accounts.iter_mut() {
            if account.working_set.is_empty() {
                continue;
            }

            let saved = if source == MessageSource::PostLink && post_link.is_some() {
                Vec::new()
            } else {
                match account.client.saved_messages(fetch_limit).await {
                    Ok(saved) => saved,
                    Err(e) => {
                        warn!(
                            user_id,
                            phone = %mask_phone(&account.phone),
                            "Could not read saved messages: {}",
                            e
                        );
                        Vec::new()
                    }
                }
            };
            let Some(message) = select_message(source, post_link.as_ref(), &saved, rotation, count)
            else {
                debug!(user_id, phone = %mask_phone(&account.phone), "No message to forward");
                continue;
            };
            outcome.had_message = true;

            let targets = account.working_set.targets().to_vec();
            for target in targets {
                let topics: Vec<Option<(i32, String)>> = if target.is_forum && !target.topics.is_empty() {
                    target
                        .topics
                        .iter()
                        .map(|t| Some((t.id, t.title.clone())))
                        .collect()
                } else {
                    vec![None]
                };

                for topic in topics {
                    if token.is_cancelled() {
                        return Ok(None);
                    }
                    let topic_id = topic.as_ref().map(|(id, _)| *id);
                    let result = account.client.forward(&message, target.group_id, topic_id).await;
                    let success = result.is_ok();
                    self.store
                        .record_send(user_id, success, target.group_id, &account.account_id)
                        .await?;

                    let mut stop_group = false;
                    match result {
                        Ok(()) => {
                            outcome.sent += 1;
                            self.relay.spawn(
                                user_id,
                                messages::sent(&target.title, topic.as_ref().map(|(_, t)| t.as_str())),
                            );
                        }
                        Err(err) => {
                            outcome.failed += 1;
                            stop_group = handle_failure(
                                &self.relay,
                                user_id,
                                account,
                                &target.title,
                                target.group_id,
                                &err,
                                flood_buffer,
                                token,
                            )
                            .await;
                            if token.is_cancelled() {
                                return Ok(None);
                            }
                        }
                    }

                    if !sleep_or_cancel(token, group_delay).await {
                        return Ok(None);
                    }
                    if stop_group {
                        break;
                    }
                }
            }
        }
        Ok(Some(outcome))
    }
}

/// Apply the failure disposition. Returns `true` when the group was dropped.
#[allow(clippy::too_many_arguments)]
async fn handle_failure(
    relay: &LogRelay,
    user_id: UserId,
    account: &mut EngineAccount,
    title: &str,
    group_id: i64,
    err: &SendError,
    flood_buffer: Duration,
    token: &CancellationToken,
) -> bool {
    match err.disposition(flood_buffer) {
        Disposition::Backoff(wait) => {
            let wait_secs = match err {
                SendError::RateLimited { wait_secs } => *wait_secs,
                _ => wait.as_secs(),
            };
            warn!(user_id, group_id, wait_secs, "Rate limited, backing off");
            relay.spawn(user_id, messages::rate_limited(title, wait_secs));
            sleep_or_cancel(token, wait).await;
            false
        }
        Disposition::DropFromWorkingSet => {
            account.working_set.drop_group(group_id);
            log_component!(
                warn,
                "engine",
                "Group dropped from working set",
                user_id = user_id,
                group_id = group_id
            );
            relay.spawn(user_id, messages::group_dropped(title, err.reason()));
            true
        }
        Disposition::RetryNextCycle => {
            debug!(user_id, group_id, "Send failed, retrying next cycle: {}", err);
            relay.spawn(user_id, messages::transient_failure(title, err.reason()));
            false
        }
    }
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    if duration.is_zero() {
        return !token.is_cancelled();
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Target;
    use crate::relay::{DmSender, MockDmSender};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::relay::DeliveryError;
    use crate::store::ForumTopic;
    use crate::telegram::{
        AccountCredentials, ClientFactory, DialogKind, MemoryAccount, MemoryBackend, MessageRef,
    };

    #[derive(Clone, Default)]
    struct Recorder {
        texts: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn count(&self, needle: &str) -> usize {
            self.texts.lock().unwrap().iter().filter(|t| t.contains(needle)).count()
        }
    }

    #[async_trait]
    impl DmSender for Recorder {
        async fn send_html(&self, _chat_id: i64, text: &str) -> std::result::Result<(), DeliveryError> {
            self.texts.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn ping(&self) -> std::result::Result<(), DeliveryError> {
            Ok(())
        }
    }

    /// Time of day that starts at `start` and moves with the tokio clock.
    fn clock_from(start: NaiveTime) -> Clock {
        let origin = Instant::now();
        Arc::new(move || {
            let elapsed = chrono::Duration::from_std(origin.elapsed()).unwrap();
            start.overflowing_add_signed(elapsed).0
        })
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    /// One account sending to `-1` with a recording relay.
    async fn recorded_engine(backend: &MemoryBackend, store: &Store) -> (CycleEngine, Recorder) {
        store.set_logger_status(1, true).await.unwrap();
        store.mark_started(1).await.unwrap();
        let recorder = Recorder::default();
        let relay = LogRelay::new(store.clone(), Arc::new(recorder.clone()) as Arc<dyn DmSender>);
        let mut engine = engine_with(backend, store, vec![target(-1)]).await;
        engine.relay = relay;
        (engine, recorder)
    }

    fn quiet_relay(store: &Store) -> LogRelay {
        let mut mock = MockDmSender::new();
        mock.expect_send_html().returning(|_, _| Ok(()));
        mock.expect_ping().returning(|| Ok(()));
        LogRelay::new(store.clone(), Arc::new(mock) as Arc<dyn DmSender>)
    }

    fn target(id: i64) -> Target {
        Target {
            group_id: id,
            title: format!("g{}", id),
            is_forum: false,
            topics: vec![],
        }
    }

    async fn engine_with(
        backend: &MemoryBackend,
        store: &Store,
        targets: Vec<Target>,
    ) -> CycleEngine {
        let client = backend
            .connect(&AccountCredentials {
                phone: "+1".into(),
                api_id: 1,
                api_hash: "h".into(),
                session: "s1".into(),
            })
            .await
            .unwrap();
        CycleEngine::new(
            1,
            store.clone(),
            quiet_relay(store),
            EngineConfig::default(),
            vec![EngineAccount {
                account_id: "acc".into(),
                phone: "+1".into(),
                client,
                working_set: WorkingSet::new(targets),
            }],
        )
    }

    async fn setup() -> (MemoryBackend, Store) {
        let backend = MemoryBackend::new();
        backend.add_account(
            "s1",
            MemoryAccount::new(1, "+1")
                .with_group(-1, "A", DialogKind::Supergroup)
                .with_group(-2, "B", DialogKind::Supergroup)
                .with_saved(&[3, 2, 1]),
        );
        let store = Store::new_memory();
        store.create_user(1, None, None).await.unwrap();
        store.set_group_msg_delay(1, 5).await.unwrap();
        (backend, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_drops_group_timeout_keeps_it() {
        let (backend, store) = setup().await;
        backend.fail_forward("s1", -1, "CHAT_WRITE_FORBIDDEN");
        backend.fail_forward("s1", -2, "Request timeout");
        let mut engine = engine_with(&backend, &store, vec![target(-1), target(-2)]).await;

        let token = CancellationToken::new();
        let outcome = engine.run_cycle(&token).await.unwrap().unwrap();
        assert_eq!(outcome.failed, 2);

        let ws = &engine.accounts()[0].working_set;
        assert!(!ws.contains(-1));
        assert!(ws.contains(-2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forum_sends_once_per_topic() {
        let (backend, store) = setup().await;
        let forum = Target {
            group_id: -1,
            title: "Forum".into(),
            is_forum: true,
            topics: vec![
                ForumTopic { id: 10, title: "a".into(), closed: false },
                ForumTopic { id: 11, title: "b".into(), closed: false },
            ],
        };
        let mut engine = engine_with(&backend, &store, vec![forum, target(-2)]).await;
        let outcome = engine.run_cycle(&CancellationToken::new()).await.unwrap().unwrap();
        assert_eq!(outcome.sent, 3);

        let attempts = backend.attempts();
        assert_eq!(attempts[0].topic, Some(10));
        assert_eq!(attempts[1].topic, Some(11));
        assert_eq!(attempts[2].topic, None);
        let a = store.analytics(1).await;
        assert_eq!(a.groups[&-1].sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_delay_between_sends() {
        let (backend, store) = setup().await;
        let mut engine = engine_with(&backend, &store, vec![target(-1), target(-2)]).await;
        let begin = Instant::now();
        engine.run_cycle(&CancellationToken::new()).await.unwrap();
        assert!(begin.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_saved_messages_ends_run() {
        let backend = MemoryBackend::new();
        backend.add_account(
            "s1",
            MemoryAccount::new(1, "+1").with_group(-1, "A", DialogKind::Supergroup),
        );
        let store = Store::new_memory();
        store.create_user(1, None, None).await.unwrap();
        store.mark_started(1).await.unwrap();
        let mut engine = engine_with(&backend, &store, vec![target(-1)]).await;
        let exit = engine.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(exit, EngineExit::NoMessages);
        assert!(backend.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_advances_per_cycle() {
        let (backend, store) = setup().await;
        store.set_saved_messages_count(1, 3).await.unwrap();
        store.set_ad_delay(1, 60).await.unwrap();
        store.mark_started(1).await.unwrap();
        let mut engine = engine_with(&backend, &store, vec![target(-1)]).await;

        let token = CancellationToken::new();
        let stopper = token.clone();
        let handle = tokio::spawn(async move {
            let exit = engine.run(&token).await.unwrap();
            (exit, engine.cycles())
        });
        // 4 cycles of (5s group delay + 60s interval)
        tokio::time::sleep(Duration::from_secs(4 * 65 - 1)).await;
        stopper.cancel();
        let (exit, cycles) = handle.await.unwrap();
        assert_eq!(exit, EngineExit::Cancelled);
        assert_eq!(cycles, 4);
        assert_eq!(store.current_rotation(1).await, 4 % 3);

        let sent: Vec<MessageRef> = backend.attempts().into_iter().map(|a| a.message).collect();
        // chronological [1, 2, 3], rotation 0,1,2,0
        let expected: Vec<MessageRef> = [1, 2, 3, 1]
            .into_iter()
            .map(|message_id| MessageRef::Saved { message_id })
            .collect();
        assert_eq!(sent, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_cleared_elsewhere_stops_loop() {
        let (backend, store) = setup().await;
        let mut engine = engine_with(&backend, &store, vec![target(-1)]).await;
        // never marked running
        let exit = engine.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(exit, EngineExit::StateCleared);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_pauses_then_resumes_at_window_start() {
        let (backend, store) = setup().await;
        store.set_ad_delay(1, 600).await.unwrap();
        let (engine, recorder) = recorded_engine(&backend, &store).await;
        let schedule = Schedule::parse("8:00 AM", "8:00 PM").unwrap();
        let mut engine = engine.with_clock(clock_from(hm(7, 50))).with_schedule(schedule);

        let token = CancellationToken::new();
        let stopper = token.clone();
        let handle = tokio::spawn(async move { engine.run(&token).await.unwrap() });

        // polls at 7:50 and 7:55 stay paused
        tokio::time::sleep(Duration::from_secs(400)).await;
        assert!(store.broadcast_state(1).await.paused);
        assert!(backend.attempts().is_empty());
        assert_eq!(recorder.count("Broadcast paused"), 1);

        // 8:00 is inside the window
        tokio::time::sleep(Duration::from_secs(210)).await;
        assert!(!store.broadcast_state(1).await.paused);
        assert_eq!(backend.attempts().len(), 1);
        assert_eq!(recorder.count("Broadcast paused"), 1);
        assert_eq!(recorder.count("Broadcast resumed"), 1);

        stopper.cancel();
        assert_eq!(handle.await.unwrap(), EngineExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_deadline_ends_run() {
        let (backend, store) = setup().await;
        store.set_ad_delay(1, 60).await.unwrap();
        let (engine, recorder) = recorded_engine(&backend, &store).await;
        let schedule = Schedule::parse("8:00 AM", "8:10 AM").unwrap();
        // window closes after 8:10 ends, two minutes from now
        let mut engine = engine.with_clock(clock_from(hm(8, 9))).with_schedule(schedule);

        let exit = engine.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(exit, EngineExit::ScheduleEnded);
        assert_eq!(engine.cycles(), 2);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.count("Schedule ended"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_only_after_every_fifth_cycle() {
        let (backend, store) = setup().await;
        store.set_group_msg_delay(1, 1).await.unwrap();
        store.set_ad_delay(1, 10).await.unwrap();
        store.set_cycle_timeout(1, 1000).await.unwrap();
        let (mut engine, recorder) = recorded_engine(&backend, &store).await;
        engine.config.cooldown_every_cycles = 5;

        let token = CancellationToken::new();
        let stopper = token.clone();
        let handle = tokio::spawn(async move { engine.run(&token).await.unwrap() });

        // each cycle is 1s group delay + 10s interval; cycle 5 sends at 44s
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(backend.attempts().len(), 5);
        assert_eq!(recorder.count("Cooldown"), 0);

        // cooldown after cycle 5 runs from 55s to 1055s
        tokio::time::sleep(Duration::from_secs(950)).await;
        assert_eq!(backend.attempts().len(), 5);
        assert_eq!(recorder.count("Cycle 5 reached"), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.attempts().len(), 6);

        stopper.cancel();
        assert_eq!(handle.await.unwrap(), EngineExit::Cancelled);
    }
}
