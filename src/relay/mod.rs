//! Notification/log relay
//!
//! Delivers broadcast progress to the user's DM through a second bot
//! identity (the logger bot). Delivery is best-effort: it is gated on the user
//! having started the logger bot, retried a bounded number of times, and a
//! final failure is recorded in the store. It never fails the caller.

pub mod logger_bot;
pub mod messages;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::{ApiError, RequestError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::log_component;
use crate::store::{Store, UserId};

/// Why a DM could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The user never opened a chat with the bot, or blocked it
    #[error("peer invalid: {0}")]
    PeerInvalid(String),
    #[error("timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    Other(String),
}

/// Sends HTML direct messages as a bot.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DmSender: Send + Sync {
    async fn send_html(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError>;

    /// Cheap liveness call (`getMe`).
    async fn ping(&self) -> Result<(), DeliveryError>;
}

/// [`DmSender`] backed by a teloxide `Bot`.
#[derive(Clone)]
pub struct TeloxideSender {
    bot: Bot,
}

impl TeloxideSender {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> &Bot {
        &self.bot
    }
}

fn delivery_error(e: RequestError) -> DeliveryError {
    match e {
        RequestError::Api(
            ApiError::BotBlocked
            | ApiError::ChatNotFound
            | ApiError::UserDeactivated
            | ApiError::CantInitiateConversation,
        ) => DeliveryError::PeerInvalid(e.to_string()),
        RequestError::Network(ref err) if err.is_timeout() => DeliveryError::Timeout,
        RequestError::Network(ref err) => DeliveryError::Network(err.to_string()),
        RequestError::Io(ref err) => DeliveryError::Network(err.to_string()),
        other => DeliveryError::Other(other.to_string()),
    }
}

#[async_trait]
impl DmSender for TeloxideSender {
    async fn send_html(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .await
            .map(|_| ())
            .map_err(delivery_error)
    }

    async fn ping(&self) -> Result<(), DeliveryError> {
        self.bot.get_me().await.map(|_| ()).map_err(delivery_error)
    }
}

/// Retry schedule of [`LogRelay`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub timeout: Duration,
    /// Backoff after attempt `n` (1-based) is `n × backoff_step`
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout: Duration::from_secs(10),
            backoff_step: Duration::from_secs(2),
        }
    }
}

/// Outcome of one relay call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The user has not started the logger bot
    Skipped,
    Failed(DeliveryError),
}

/// Best-effort DM relay through the logger bot.
#[derive(Clone)]
pub struct LogRelay {
    store: Store,
    sender: Arc<dyn DmSender>,
    policy: RetryPolicy,
    last_success: Arc<Mutex<Option<Instant>>>,
    /// Main bot plus logger username, used to tell users to start the logger
    fallback: Option<(Arc<dyn DmSender>, String)>,
    /// Per-user queues of [`LogRelay::spawn`], each drained by one task
    queues: Arc<Mutex<HashMap<UserId, mpsc::UnboundedSender<String>>>>,
}

impl LogRelay {
    pub fn new(store: Store, sender: Arc<dyn DmSender>) -> Self {
        Self {
            store,
            sender,
            policy: RetryPolicy::default(),
            last_success: Arc::new(Mutex::new(None)),
            fallback: None,
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// When the logger cannot reach a user, ask them via `main_bot` to
    /// start `@logger_username`.
    pub fn with_fallback(mut self, main_bot: Arc<dyn DmSender>, logger_username: &str) -> Self {
        self.fallback = Some((main_bot, logger_username.to_string()));
        self
    }

    pub fn sender(&self) -> Arc<dyn DmSender> {
        Arc::clone(&self.sender)
    }

    /// Time of the last successful delivery or health check.
    pub fn last_success(&self) -> Option<Instant> {
        *self.last_success.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mark_alive(&self) {
        *self.last_success.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// Deliver `html` to the user. Never returns an error.
    pub async fn send(&self, user_id: UserId, html: &str) -> Delivery {
        if !self.store.logger_started(user_id).await {
            return Delivery::Skipped;
        }

        let mut last_error = DeliveryError::Other("no attempt made".into());
        for attempt in 1..=self.policy.attempts {
            let result =
                match tokio::time::timeout(self.policy.timeout, self.sender.send_html(user_id, html))
                    .await
                {
                    Ok(r) => r,
                    Err(_) => Err(DeliveryError::Timeout),
                };

            match result {
                Ok(()) => {
                    self.mark_alive();
                    return Delivery::Delivered;
                }
                Err(DeliveryError::PeerInvalid(msg)) => {
                    self.record_failure(user_id, "PeerIdInvalid: User must start logger bot")
                        .await;
                    self.notify_fallback(user_id).await;
                    return Delivery::Failed(DeliveryError::PeerInvalid(msg));
                }
                Err(e) => {
                    log_component!(
                        warn,
                        "relay",
                        "Log delivery attempt failed",
                        user_id = user_id,
                        attempt = attempt
                    );
                    debug!(user_id, attempt, "Relay error: {}", e);
                    last_error = e;
                    if attempt < self.policy.attempts {
                        tokio::time::sleep(self.policy.backoff_step * attempt).await;
                    }
                }
            }
        }

        let reason = match &last_error {
            DeliveryError::Timeout => "Timeout sending DM log".to_string(),
            DeliveryError::Network(e) => format!("Network error: {}", e),
            other => other.to_string(),
        };
        self.record_failure(user_id, &reason).await;
        Delivery::Failed(last_error)
    }

    /// Fire-and-forget [`send`](Self::send). Notices to one user are
    /// delivered in call order.
    pub fn spawn(&self, user_id: UserId, html: String) {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let html = match queues.get(&user_id) {
            Some(tx) => match tx.send(html) {
                Ok(()) => return,
                Err(mpsc::error::SendError(html)) => html,
            },
            None => html,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        // a fresh channel always has its receiver
        let _ = tx.send(html);
        queues.insert(user_id, tx);
        drop(queues);
        tokio::spawn(self.clone().drain(user_id, rx));
    }

    /// Deliver queued notices in order. Retires the queue once it is empty.
    async fn drain(self, user_id: UserId, mut rx: mpsc::UnboundedReceiver<String>) {
        loop {
            let html = match rx.try_recv() {
                Ok(html) => html,
                Err(_) => {
                    let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
                    match rx.try_recv() {
                        Ok(html) => html,
                        Err(_) => {
                            queues.remove(&user_id);
                            return;
                        }
                    }
                }
            };
            self.send(user_id, &html).await;
        }
    }

    /// One attempt to each admin, ignoring the logger gate.
    pub async fn notify_admins(&self, admin_ids: &[i64], html: &str) {
        for &admin in admin_ids {
            let sent =
                tokio::time::timeout(self.policy.timeout, self.sender.send_html(admin, html)).await;
            if !matches!(sent, Ok(Ok(()))) {
                warn!(admin, "Admin notification not delivered");
            }
        }
    }

    async fn record_failure(&self, user_id: UserId, reason: &str) {
        if let Err(e) = self.store.log_logger_failure(user_id, reason).await {
            warn!(user_id, "Failed to record logger failure: {}", e);
        }
    }

    async fn notify_fallback(&self, user_id: UserId) {
        if let Some((main_bot, username)) = &self.fallback {
            let text = messages::logger_not_started(username);
            if let Err(e) = main_bot.send_html(user_id, &text).await {
                debug!(user_id, "Fallback notice not delivered: {}", e);
            }
        }
    }
}
