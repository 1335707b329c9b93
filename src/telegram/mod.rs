//! Telegram user-account client boundary
//!
//! Broadcasting happens through real user accounts (MTProto), not the Bot
//! API. Everything the broadcaster needs from such a client is captured by two
//! traits:
//!
//! - [`TelegramClient`]: one connected account (dialogs, topics, saved
//!   messages, forwarding)
//! - [`ClientFactory`]: connects accounts from stored credentials and drives
//!   the phone / code / password login
//!
//! Every fallible call returns an already-classified [`SendError`] (or
//! [`AuthError`] during login), so callers never inspect error text.
//!
//! The production backend is [`bridge::BridgeClientFactory`], which talks to
//! an MTProto bridge sidecar over HTTP. [`memory::MemoryBackend`] is a
//! scripted in-process backend for tests.

pub mod bridge;
pub mod errors;
pub mod links;
pub mod memory;

pub use bridge::BridgeClientFactory;
pub use errors::{classify_auth_error, classify_error_message};
pub use links::parse_post_link;
pub use memory::{MemoryAccount, MemoryBackend};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AdError, AuthError, SendError};
use crate::store::{Account, ForumTopic, GroupId, GroupKind};
use crate::vault::Vault;

/// The logged-in identity of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Me {
    pub id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// Kind of a dialog as reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogKind {
    User,
    Bot,
    Group,
    Supergroup,
    Forum,
    Channel,
}

impl DialogKind {
    /// The group kind, or `None` for private chats and broadcast channels.
    pub fn group_kind(&self) -> Option<GroupKind> {
        match self {
            DialogKind::Group => Some(GroupKind::Group),
            DialogKind::Supergroup => Some(GroupKind::Supergroup),
            DialogKind::Forum => Some(GroupKind::Forum),
            DialogKind::User | DialogKind::Bot | DialogKind::Channel => None,
        }
    }
}

/// One entry of an account's chat list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dialog {
    pub id: GroupId,
    pub title: String,
    #[serde(default)]
    pub username: Option<String>,
    pub kind: DialogKind,
    #[serde(default)]
    pub members_count: Option<u32>,
}

/// What an account can do in a chat right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub id: GroupId,
    pub title: String,
    pub is_member: bool,
    pub is_forum: bool,
    /// Default or per-user send restriction in effect
    pub send_messages_banned: bool,
}

/// A message in the account's Saved Messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedMessage {
    pub id: i32,
    pub date: i64,
}

/// The message a cycle forwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum MessageRef {
    /// A message in the sending account's Saved Messages
    Saved { message_id: i32 },
    /// A message in a public or joined chat
    Post { from_peer: String, message_id: i32 },
}

/// Everything needed to connect one stored account.
#[derive(Clone)]
pub struct AccountCredentials {
    pub phone: String,
    pub api_id: i32,
    pub api_hash: String,
    pub session: String,
}

impl std::fmt::Debug for AccountCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountCredentials")
            .field("phone", &self.phone)
            .field("api_id", &self.api_id)
            .field("api_hash", &"[REDACTED]")
            .field("session", &"[REDACTED]")
            .finish()
    }
}

impl AccountCredentials {
    /// Unseal a stored account. Failure means the user has to log in again.
    pub fn unseal(account: &Account, vault: &Vault) -> crate::error::Result<Self> {
        let reauth = |e: AdError| {
            AdError::Credentials(format!(
                "account {} cannot be decrypted ({}), please re-authenticate",
                account.phone_number, e
            ))
        };
        Ok(Self {
            phone: account.phone_number.clone(),
            api_id: account.api_id,
            api_hash: vault.decrypt(&account.api_hash_sealed).map_err(reauth)?,
            session: vault.decrypt(&account.session_sealed).map_err(reauth)?,
        })
    }
}

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct LoggedIn {
    pub session: String,
    pub me: Me,
}

/// Outcome of submitting the login code.
#[derive(Debug, Clone)]
pub enum LoginStep {
    Done(LoggedIn),
    PasswordRequired,
}

/// A connected user account.
#[async_trait]
pub trait TelegramClient: Send + Sync {
    async fn me(&self) -> Result<Me, SendError>;

    async fn dialogs(&self) -> Result<Vec<Dialog>, SendError>;

    /// Topics of a forum, including closed ones (callers filter).
    async fn forum_topics(&self, chat: GroupId) -> Result<Vec<ForumTopic>, SendError>;

    async fn chat_info(&self, chat: GroupId) -> Result<ChatInfo, SendError>;

    /// Newest first.
    async fn saved_messages(&self, limit: u32) -> Result<Vec<SavedMessage>, SendError>;

    /// Forward `message` to `to`, into `topic` when set.
    async fn forward(
        &self,
        message: &MessageRef,
        to: GroupId,
        topic: Option<i32>,
    ) -> Result<(), SendError>;

    /// Release the connection. Never fails.
    async fn disconnect(&self);
}

/// Connects accounts and runs logins.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, creds: &AccountCredentials)
        -> Result<Arc<dyn TelegramClient>, SendError>;

    /// Send a login code to `phone`. Returns an opaque login id.
    async fn request_code(&self, api_id: i32, api_hash: &str, phone: &str)
        -> Result<String, AuthError>;

    async fn submit_code(&self, login_id: &str, code: &str) -> Result<LoginStep, AuthError>;

    async fn submit_password(&self, login_id: &str, password: &str)
        -> Result<LoggedIn, AuthError>;
}
