//! Logger bot: `/start` registration and the health monitor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{messages, LogRelay};
use crate::config::LoggerBotConfig;
use crate::error::Result;
use crate::log_component;
use crate::store::{Store, UserId};

/// Register a user who pressed `/start` in the logger bot.
pub async fn register_logger_user(
    store: &Store,
    user_id: UserId,
    username: Option<String>,
    first_name: Option<String>,
) -> Result<()> {
    store.create_user(user_id, username, first_name).await?;
    store.set_logger_status(user_id, true).await?;
    log_component!(info, "relay", "Logger bot started by user", user_id = user_id);
    Ok(())
}

#[derive(Clone)]
struct LoggerDeps {
    store: Store,
    relay: LogRelay,
    welcome: Arc<String>,
}

/// Long-polls the logger bot until `shutdown` fires.
pub async fn run_logger_bot(
    bot: Bot,
    store: Store,
    relay: LogRelay,
    welcome: String,
    shutdown: CancellationToken,
) {
    if let Err(e) = crate::bot::wait_until_ready(&bot, &shutdown).await {
        error!("Logger bot not started: {}", e);
        return;
    }

    let deps = LoggerDeps {
        store,
        relay,
        welcome: Arc::new(welcome),
    };

    let handler = Update::filter_message().endpoint(|bot: Bot, msg: Message, deps: LoggerDeps| async move {
        if !msg.chat.is_private() {
            return Ok(());
        }
        let is_start = msg
            .text()
            .map(|t| t.split_whitespace().next() == Some("/start"))
            .unwrap_or(false);
        if !is_start {
            return Ok(());
        }

        let user_id = msg.chat.id.0;
        let username = msg.chat.username().map(str::to_string);
        let first_name = msg.chat.first_name().map(str::to_string);
        if let Err(e) = register_logger_user(&deps.store, user_id, username, first_name).await {
            error!(user_id, "Failed to register logger user: {}", e);
        }

        let reply = bot
            .send_message(msg.chat.id, deps.welcome.as_str())
            .parse_mode(ParseMode::Html)
            .await;
        match reply {
            Ok(_) => deps.relay.mark_alive(),
            Err(e) => {
                warn!(user_id, "Logger welcome failed, retrying as plain text: {}", e);
                let _ = bot
                    .send_message(msg.chat.id, "Welcome! Logs will be sent here.")
                    .await;
            }
        }
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    });

    let task = std::panic::AssertUnwindSafe(async move {
        let mut dispatcher = Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![deps])
            .build();
        info!("Logger bot dispatcher started");
        tokio::select! {
            _ = dispatcher.dispatch() => info!("Logger bot dispatcher completed"),
            _ = shutdown.cancelled() => info!("Logger bot shutdown signal received"),
        }
    })
    .catch_unwind()
    .await;

    if task.is_err() {
        error!("Logger bot task panicked");
    }
}

/// Welcome text for `/start`.
pub fn welcome_text(main_bot_username: &str, bot_name: &str) -> String {
    messages::logger_welcome(main_bot_username, bot_name)
}

/// Result of one health tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheck {
    /// Recent successful delivery; no ping needed
    Fresh,
    Passed,
    Failed(String),
}

/// Pings the logger bot when it has been idle for too long.
pub struct HealthMonitor {
    relay: LogRelay,
    interval: Duration,
    idle_threshold: Duration,
    ping_timeout: Duration,
    consecutive_failures: AtomicU32,
    failure_alert_threshold: u32,
}

impl HealthMonitor {
    pub fn new(relay: LogRelay, cfg: &LoggerBotConfig) -> Self {
        Self {
            relay,
            interval: Duration::from_secs(cfg.health_interval_secs.max(1)),
            idle_threshold: Duration::from_secs(cfg.idle_threshold_secs),
            ping_timeout: Duration::from_secs(10),
            consecutive_failures: AtomicU32::new(0),
            failure_alert_threshold: 3,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// One health tick.
    pub async fn check(&self) -> HealthCheck {
        if let Some(last) = self.relay.last_success() {
            if last.elapsed() <= self.idle_threshold {
                return HealthCheck::Fresh;
            }
        }

        warn!("Logger bot appears inactive, performing health check");
        let sender = self.relay.sender();
        let result = match tokio::time::timeout(self.ping_timeout, sender.ping()).await {
            Ok(Ok(())) => HealthCheck::Passed,
            Ok(Err(e)) => HealthCheck::Failed(e.to_string()),
            Err(_) => HealthCheck::Failed("ping timed out".into()),
        };

        match &result {
            HealthCheck::Passed => {
                self.relay.mark_alive();
                self.consecutive_failures.store(0, Ordering::Relaxed);
                info!("Logger bot health check passed");
            }
            HealthCheck::Failed(reason) => {
                let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                error!(consecutive_failures = count, "Logger bot health check failed: {}", reason);
                if count >= self.failure_alert_threshold {
                    warn!(
                        consecutive_failures = count,
                        "Logger bot: {} consecutive failed health checks", count
                    );
                }
            }
            HealthCheck::Fresh => {}
        }
        result
    }

    /// Tick every `interval` until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Logger health monitor started (interval={}s, idle threshold={}s)",
            self.interval.as_secs(),
            self.idle_threshold.as_secs()
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.check().await;
                }
            }
        }
        info!("Logger health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{DeliveryError, MockDmSender};

    fn cfg() -> LoggerBotConfig {
        LoggerBotConfig {
            idle_threshold_secs: 1800,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_register_logger_user() {
        let store = Store::new_memory();
        register_logger_user(&store, 5, Some("neo".into()), None).await.unwrap();
        assert!(store.logger_started(5).await);
        assert_eq!(store.get_user(5).await.unwrap().username.as_deref(), Some("neo"));
    }

    #[tokio::test]
    async fn test_fresh_relay_skips_ping() {
        let mut mock = MockDmSender::new();
        mock.expect_ping().never();
        let relay = LogRelay::new(Store::new_memory(), Arc::new(mock));
        relay.mark_alive();
        let monitor = HealthMonitor::new(relay, &cfg());
        assert_eq!(monitor.check().await, HealthCheck::Fresh);
    }

    #[tokio::test]
    async fn test_idle_relay_pings_and_counts_failures() {
        let mut mock = MockDmSender::new();
        mock.expect_ping()
            .times(2)
            .returning(|| Err(DeliveryError::Network("down".into())));
        let relay = LogRelay::new(Store::new_memory(), Arc::new(mock));
        let monitor = HealthMonitor::new(relay, &cfg());
        assert!(matches!(monitor.check().await, HealthCheck::Failed(_)));
        assert!(matches!(monitor.check().await, HealthCheck::Failed(_)));
        assert_eq!(monitor.consecutive_failures(), 2);
    }

    #[tokio::test]
    async fn test_successful_ping_marks_alive() {
        let mut mock = MockDmSender::new();
        mock.expect_ping().times(1).returning(|| Ok(()));
        let relay = LogRelay::new(Store::new_memory(), Arc::new(mock));
        let monitor = HealthMonitor::new(relay.clone(), &cfg());
        assert_eq!(monitor.check().await, HealthCheck::Passed);
        assert!(relay.last_success().is_some());
        assert_eq!(monitor.consecutive_failures(), 0);
    }

    #[test]
    fn test_welcome_mentions_main_bot() {
        let text = welcome_text("@adcaster_bot", "AdCaster");
        assert!(text.contains("@adcaster_bot"));
        assert!(text.contains("AdCaster Logger"));
    }
}
