//! Main bot: menus, conversation flows and broadcast control.
//!
//! All updates from private chats go through [`run_bot`]. Handlers are
//! methods on [`BotContext`] and return a [`Reply`]; nothing below this module
//! talks to the Bot API directly.

pub mod conversation;
pub mod handlers;
pub mod keyboards;
pub mod login;

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardMarkup, ParseMode, Recipient, UserId as TgUserId};
use teloxide::RequestError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use handlers::Command;
pub use keyboards::CallbackAction;

use crate::broadcast::BroadcastSupervisor;
use crate::cache::GroupCache;
use crate::config::Config;
use crate::error::{AdError, Result};
use crate::log_component;
use crate::store::{Store, UserId};
use crate::telegram::ClientFactory;
use crate::vault::Vault;

/// Maximum number of startup retries for `getMe`.
const MAX_STARTUP_RETRIES: u32 = 10;
/// Base delay (in seconds) for exponential backoff on startup retries.
const BASE_RETRY_DELAY_SECS: u64 = 2;
/// Maximum delay (in seconds) for exponential backoff on startup retries.
const MAX_RETRY_DELAY_SECS: u64 = 120;

/// Shared services handed to every handler.
#[derive(Clone)]
pub struct BotContext {
    pub config: Arc<Config>,
    pub store: Store,
    pub vault: Arc<Vault>,
    pub factory: Arc<dyn ClientFactory>,
    pub cache: GroupCache,
    pub supervisor: BroadcastSupervisor,
}

/// HTML text plus an optional inline keyboard.
#[derive(Debug, Clone)]
pub struct Reply {
    pub text: String,
    pub keyboard: Option<InlineKeyboardMarkup>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            keyboard: None,
        }
    }

    pub fn with_keyboard(text: impl Into<String>, keyboard: InlineKeyboardMarkup) -> Self {
        Self {
            text: text.into(),
            keyboard: Some(keyboard),
        }
    }
}

/// Build a bot client without system proxy detection.
pub fn build_bot(token: &str) -> Result<Bot> {
    let client = teloxide::net::default_reqwest_settings()
        .no_proxy()
        .build()
        .map_err(|e| AdError::Config(format!("Failed to build Telegram HTTP client: {}", e)))?;
    Ok(Bot::with_client(token.to_string(), client))
}

/// Exponential backoff delay for startup retries: 2s, 4s, 8s, ... capped at 120s.
fn startup_backoff_delay(attempt: u32) -> Duration {
    let delay_secs = BASE_RETRY_DELAY_SECS
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(MAX_RETRY_DELAY_SECS);
    Duration::from_secs(delay_secs)
}

fn is_transient(e: &RequestError) -> bool {
    matches!(
        e,
        RequestError::Network(_) | RequestError::Io(_) | RequestError::RetryAfter(_)
    )
}

/// Call `getMe` until it succeeds, retrying transient failures with backoff.
///
/// Returns an error on a permanent failure (bad token), after the retry
/// budget is spent, or when `shutdown` fires first.
pub async fn wait_until_ready(bot: &Bot, shutdown: &CancellationToken) -> Result<()> {
    let mut attempt: u32 = 0;
    loop {
        let err = match bot.get_me().await {
            Ok(me) => {
                info!(username = ?me.username, "Bot identity confirmed");
                return Ok(());
            }
            Err(e) => e,
        };
        if !is_transient(&err) || attempt >= MAX_STARTUP_RETRIES {
            return Err(AdError::Provider(format!(
                "startup check failed after {} attempt(s): {}",
                attempt + 1,
                err
            )));
        }

        let delay = match &err {
            RequestError::RetryAfter(d) => d.duration(),
            _ => startup_backoff_delay(attempt),
        };
        warn!(
            "Startup check failed (attempt {}/{}), retrying in {}s: {}",
            attempt + 1,
            MAX_STARTUP_RETRIES,
            delay.as_secs(),
            err
        );
        tokio::select! {
            _ = shutdown.cancelled() => {
                return Err(AdError::Provider("shutdown during startup retry".into()));
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Whether `user_id` is present in `chat` (a public `@username`).
async fn is_member(bot: &Bot, chat: &str, user_id: UserId) -> bool {
    let chat = format!("@{}", chat.trim_start_matches('@'));
    match bot
        .get_chat_member(Recipient::ChannelUsername(chat.clone()), TgUserId(user_id as u64))
        .await
    {
        Ok(member) => member.kind.is_present(),
        Err(e) => {
            // The bot is not an admin there; do not lock users out over it
            warn!(user_id, chat = %chat, "Membership check failed: {}", e);
            true
        }
    }
}

impl BotContext {
    /// `None` when the user may proceed, otherwise the join prompt.
    async fn force_join_gate(&self, bot: &Bot, user_id: UserId) -> Option<Reply> {
        let features = &self.config.features;
        if !features.force_join || self.config.is_admin(user_id) {
            return None;
        }
        let channel = features.must_join_channel.as_str();
        let group = features.must_join_group.as_str();
        let mut joined = true;
        for chat in [channel, group] {
            if !chat.is_empty() && !is_member(bot, chat, user_id).await {
                joined = false;
            }
        }
        if joined {
            return None;
        }
        Some(Reply::with_keyboard(
            "🔒 <b>Join required</b>\n\nJoin our channel and group to use this bot, \
             then press the button below.",
            keyboards::force_join(channel, group),
        ))
    }

    /// Forward the admin's replied-to message to every known user.
    async fn broadcast_to_users(&self, bot: &Bot, msg: &Message) -> Result<Reply> {
        let Some(source) = msg.reply_to_message() else {
            return Ok(Reply::text(
                "Reply to the message you want to send to every user with /bd.",
            ));
        };
        let users = self.store.user_ids().await;
        let (mut ok, mut failed) = (0usize, 0usize);
        for user_id in users {
            match bot.forward_message(ChatId(user_id), msg.chat.id, source.id).await {
                Ok(_) => ok += 1,
                Err(e) => {
                    failed += 1;
                    warn!(user_id, "Admin broadcast delivery failed: {}", e);
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        log_component!(info, "bot", "Admin broadcast finished", delivered = ok, failed = failed);
        Ok(Reply::text(format!(
            "📣 Delivered to {} users, {} failed.",
            ok, failed
        )))
    }

    async fn on_message(&self, bot: &Bot, msg: &Message) -> Result<Option<Reply>> {
        let user_id = msg.chat.id.0;
        self.store
            .create_user(
                user_id,
                msg.chat.username().map(str::to_string),
                msg.chat.first_name().map(str::to_string),
            )
            .await?;

        if let Some(gate) = self.force_join_gate(bot, user_id).await {
            return Ok(Some(gate));
        }

        let text = msg.text();
        match text.and_then(Command::parse) {
            Some(Command::Bd) if self.config.is_admin(user_id) => {
                self.broadcast_to_users(bot, msg).await.map(Some)
            }
            Some(command) => self.handle_command(user_id, command).await.map(Some),
            None => self.handle_text(user_id, text).await,
        }
    }

    async fn on_callback(&self, bot: &Bot, user_id: UserId, data: &str) -> Result<Option<Reply>> {
        self.store.create_user(user_id, None, None).await?;
        if let Some(gate) = self.force_join_gate(bot, user_id).await {
            return Ok(Some(gate));
        }
        match CallbackAction::parse(data) {
            Some(action) => self.handle_callback(user_id, action).await,
            None => {
                warn!(user_id, data, "Unknown callback data");
                Ok(None)
            }
        }
    }
}

async fn send_reply(bot: &Bot, chat: ChatId, reply: Reply) {
    let mut request = bot.send_message(chat, &reply.text).parse_mode(ParseMode::Html);
    if let Some(kb) = reply.keyboard.clone() {
        request = request.reply_markup(kb);
    }
    if let Err(e) = request.await {
        warn!(chat_id = chat.0, "Reply failed: {}", e);
    }
}

/// Edit the message carrying the pressed button, or send a new one.
async fn edit_or_send(bot: &Bot, q: &CallbackQuery, chat: ChatId, reply: Reply) {
    if let Some(message) = q.regular_message() {
        let mut request = bot
            .edit_message_text(message.chat.id, message.id, &reply.text)
            .parse_mode(ParseMode::Html);
        if let Some(kb) = reply.keyboard.clone() {
            request = request.reply_markup(kb);
        }
        if request.await.is_ok() {
            return;
        }
    }
    send_reply(bot, chat, reply).await;
}

fn error_reply(e: &AdError) -> Reply {
    Reply::with_keyboard(
        format!("⚠️ Something went wrong: {}", teloxide::utils::html::escape(&e.to_string())),
        keyboards::back_to_main(),
    )
}

/// Long-polls the main bot until `shutdown` fires.
pub async fn run_bot(bot: Bot, ctx: BotContext, shutdown: CancellationToken) -> Result<()> {
    wait_until_ready(&bot, &shutdown).await?;

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .branch(dptree::filter(|m: Message| m.chat.is_private()).endpoint(
                    |bot: Bot, msg: Message, ctx: BotContext| async move {
                        let reply = match ctx.on_message(&bot, &msg).await {
                            Ok(reply) => reply,
                            Err(e) => {
                                error!(user_id = msg.chat.id.0, "Message handler failed: {}", e);
                                Some(error_reply(&e))
                            }
                        };
                        if let Some(reply) = reply {
                            send_reply(&bot, msg.chat.id, reply).await;
                        }
                        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
                    },
                )),
        )
        .branch(Update::filter_callback_query().endpoint(
            |bot: Bot, q: CallbackQuery, ctx: BotContext| async move {
                let _ = bot.answer_callback_query(q.id.clone()).await;
                let user_id = q.from.id.0 as i64;
                let data = q.data.clone().unwrap_or_default();
                let reply = match ctx.on_callback(&bot, user_id, &data).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!(user_id, "Callback handler failed: {}", e);
                        Some(error_reply(&e))
                    }
                };
                if let Some(reply) = reply {
                    edit_or_send(&bot, &q, ChatId(user_id), reply).await;
                }
                Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
            },
        ));

    let task = std::panic::AssertUnwindSafe(async move {
        let mut dispatcher = Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![ctx])
            .build();
        log_component!(info, "bot", "Main bot dispatcher started");
        tokio::select! {
            _ = dispatcher.dispatch() => info!("Main bot dispatcher completed"),
            _ = shutdown.cancelled() => info!("Main bot shutdown signal received"),
        }
    })
    .catch_unwind()
    .await;

    if task.is_err() {
        error!("Main bot task panicked");
        return Err(AdError::Provider("main bot task panicked".into()));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::relay::{DmSender, LogRelay, MockDmSender};
    use crate::store::NewAccount;
    use crate::telegram::MemoryBackend;

    /// Context over an in-memory store and backend, with user 1 created and
    /// user 999 as the only admin.
    pub async fn context() -> (BotContext, MemoryBackend) {
        let mut config = Config::default();
        config.bot.admin_ids = vec![999];
        let store = Store::new_memory();
        store.create_user(1, None, Some("Ann".into())).await.unwrap();
        let vault = Arc::new(Vault::from_key(&[3u8; 32]).unwrap());
        let backend = MemoryBackend::new();
        let factory: Arc<dyn ClientFactory> = Arc::new(backend.clone());

        let mut mock = MockDmSender::new();
        mock.expect_send_html().returning(|_, _| Ok(()));
        mock.expect_ping().returning(|| Ok(()));
        let relay = LogRelay::new(store.clone(), Arc::new(mock) as Arc<dyn DmSender>);

        let cache = GroupCache::new(store.clone(), vault.clone(), factory.clone());
        let supervisor =
            BroadcastSupervisor::new(store.clone(), vault.clone(), factory.clone(), relay, &config);
        let ctx = BotContext {
            config: Arc::new(config),
            store,
            vault,
            factory,
            cache,
            supervisor,
        };
        (ctx, backend)
    }

    /// Store an account whose session is `session`; returns its id.
    pub async fn link_account(ctx: &BotContext, user_id: UserId, session: &str) -> String {
        ctx.store
            .add_account(
                user_id,
                NewAccount {
                    phone_number: "+15550001".into(),
                    first_name: None,
                    last_name: None,
                    session_sealed: ctx.vault.encrypt(session).unwrap(),
                    api_id: 1,
                    api_hash_sealed: ctx.vault.encrypt("hash").unwrap(),
                },
            )
            .await
            .unwrap()
            .unwrap()
            .id
    }

    #[test]
    fn test_startup_backoff_delay() {
        assert_eq!(startup_backoff_delay(0), Duration::from_secs(2));
        assert_eq!(startup_backoff_delay(1), Duration::from_secs(4));
        assert_eq!(startup_backoff_delay(5), Duration::from_secs(64));
        assert_eq!(startup_backoff_delay(6), Duration::from_secs(120));
        assert_eq!(startup_backoff_delay(30), Duration::from_secs(120));
    }

    #[test]
    fn test_build_bot() {
        assert!(build_bot("123:abc").is_ok());
    }

    #[test]
    fn test_reply_constructors() {
        assert!(Reply::text("hi").keyboard.is_none());
        let r = Reply::with_keyboard("hi", keyboards::back_to_main());
        assert!(r.keyboard.is_some());
    }
}
