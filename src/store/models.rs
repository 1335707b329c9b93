//! Records persisted by the store.
//!
//! Every record is scoped by the owning user's Telegram id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::utils::time::now_ts;

/// Telegram user id of a bot user.
pub type UserId = i64;
/// Telegram chat id of a group (`-100…` form for supergroups).
pub type GroupId = i64;

// ============================================================================
// Users
// ============================================================================

/// Account tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    #[default]
    Free,
    Premium,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Free => "free",
            UserType::Premium => "premium",
        }
    }
}

/// Which targets a broadcast reaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastMode {
    GroupsOnly,
    ForumsOnly,
    #[default]
    Both,
}

impl BroadcastMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastMode::GroupsOnly => "groups_only",
            BroadcastMode::ForumsOnly => "forums_only",
            BroadcastMode::Both => "both",
        }
    }

    /// Human label used in relay messages.
    pub fn label(&self) -> &'static str {
        match self {
            BroadcastMode::GroupsOnly => "Groups Only",
            BroadcastMode::ForumsOnly => "Topics Only",
            BroadcastMode::Both => "Both Groups & Topics",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "groups_only" => Some(BroadcastMode::GroupsOnly),
            "forums_only" => Some(BroadcastMode::ForumsOnly),
            "both" => Some(BroadcastMode::Both),
            _ => None,
        }
    }

    /// Whether a target of the given kind is reached in this mode.
    pub fn includes(&self, is_forum: bool) -> bool {
        match self {
            BroadcastMode::GroupsOnly => !is_forum,
            BroadcastMode::ForumsOnly => is_forum,
            BroadcastMode::Both => true,
        }
    }
}

/// Where the advertised message comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    #[default]
    SavedMessages,
    PostLink,
}

/// A public post to forward instead of saved messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostLink {
    /// The link as the user sent it
    pub link: String,
    /// Username or `-100…` id of the source chat
    pub from_peer: String,
    /// Message id inside the source chat
    pub message_id: i32,
}

/// Inclusive daily window in IST, stored as entered (e.g. `"8:00 AM"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub start: String,
    pub end: String,
}

/// Per-user application credentials. The hash is sealed by the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub api_id: i32,
    pub api_hash_sealed: String,
}

/// Where a user is in a multi-step chat flow.
///
/// Persisted on the user record so flows survive restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConversationState {
    #[default]
    Idle,
    AwaitingApiId,
    AwaitingApiHash {
        api_id: i32,
    },
    AwaitingPhone,
    AwaitingOtp {
        phone: String,
    },
    AwaitingPassword {
        phone: String,
    },
    AwaitingAdDelay,
    AwaitingGroupDelay,
    AwaitingCycleTimeout,
    AwaitingSavedCount,
    AwaitingPostLink,
    AwaitingScheduleStart,
    AwaitingScheduleEnd {
        start: String,
    },
    AwaitingGroupSearch,
}

/// A bot user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    pub created_at: i64,
    pub last_interaction: i64,
    pub accounts_limit: u32,
    #[serde(default)]
    pub user_type: UserType,
    #[serde(default)]
    pub state: ConversationState,
    #[serde(default)]
    pub broadcast_mode: BroadcastMode,
    #[serde(default)]
    pub forum_only: bool,
    #[serde(default)]
    pub message_source: MessageSource,
    #[serde(default)]
    pub post_link: Option<PostLink>,
    #[serde(default)]
    pub saved_messages_count: Option<i64>,
    #[serde(default)]
    pub ad_cycle_index: u32,
    #[serde(default)]
    pub schedule: Option<ScheduleWindow>,
    #[serde(default)]
    pub api_credentials: Option<ApiCredentials>,
    #[serde(default)]
    pub group_search_filter: Option<String>,
    /// The vouch message was already posted for this user
    #[serde(default)]
    pub has_joined_vouch: bool,
    /// Ads the user picked explicitly, at most [`MAX_SAVED_ADS`]
    #[serde(default)]
    pub saved_messages: Vec<SavedAd>,
}

/// Upper bound of [`User::saved_messages`].
pub const MAX_SAVED_ADS: usize = 3;

/// An ad message the user registered by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedAd {
    pub message_id: i32,
    #[serde(default)]
    pub text: String,
    pub added_at: i64,
}

impl User {
    pub(crate) fn new(user_id: UserId, username: Option<String>, first_name: Option<String>) -> Self {
        let now = now_ts();
        Self {
            user_id,
            username,
            first_name,
            created_at: now,
            last_interaction: now,
            accounts_limit: 1,
            user_type: UserType::Free,
            state: ConversationState::Idle,
            broadcast_mode: BroadcastMode::Both,
            forum_only: false,
            message_source: MessageSource::SavedMessages,
            post_link: None,
            saved_messages_count: None,
            ad_cycle_index: 0,
            schedule: None,
            api_credentials: None,
            group_search_filter: None,
            has_joined_vouch: false,
            saved_messages: Vec::new(),
        }
    }

    /// Name to greet the user with.
    pub fn display_name(&self) -> String {
        self.first_name
            .clone()
            .or_else(|| self.username.clone())
            .unwrap_or_else(|| self.user_id.to_string())
    }
}

// ============================================================================
// Accounts
// ============================================================================

/// A Telegram user account a bot user logged in through the bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Store-assigned id
    pub id: String,
    pub user_id: UserId,
    pub phone_number: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    /// Session string sealed by the vault
    pub session_sealed: String,
    pub api_id: i32,
    /// API hash sealed by the vault
    pub api_hash_sealed: String,
    pub is_active: bool,
    pub created_at: i64,
}

/// Input for [`crate::store::Store::add_account`].
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub phone_number: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub session_sealed: String,
    pub api_id: i32,
    pub api_hash_sealed: String,
}

// ============================================================================
// Groups
// ============================================================================

/// An open forum topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumTopic {
    pub id: i32,
    pub title: String,
    #[serde(default)]
    pub closed: bool,
}

/// Kind of a group chat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Group,
    #[default]
    Supergroup,
    Forum,
}

impl GroupKind {
    pub fn is_forum(&self) -> bool {
        matches!(self, GroupKind::Forum)
    }
}

/// A plain group selected as a broadcast target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub user_id: UserId,
    pub group_id: GroupId,
    pub title: String,
    pub added_at: i64,
}

/// A forum selected as a broadcast target, with the topics seen at selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumGroup {
    pub user_id: UserId,
    pub group_id: GroupId,
    pub title: String,
    pub topics: Vec<ForumTopic>,
    pub added_at: i64,
}

/// A group seen in some account's dialogs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedGroup {
    pub user_id: UserId,
    pub group_id: GroupId,
    pub title: String,
    #[serde(default)]
    pub username: Option<String>,
    pub kind: GroupKind,
    #[serde(default)]
    pub members_count: Option<u32>,
    /// Phone of the account the group was first seen through
    pub account_phone: String,
    #[serde(default)]
    pub topics: Vec<ForumTopic>,
    pub cached_at: i64,
}

// ============================================================================
// Broadcast
// ============================================================================

/// Durable broadcast flags of a user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastState {
    pub running: bool,
    pub paused: bool,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub updated_at: i64,
}

/// Per-target send counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendCounter {
    pub sent: u64,
    pub failed: u64,
}

/// Lifetime counters of a user. Survives a full wipe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Analytics {
    pub total_cycles: u64,
    pub total_sent: u64,
    pub total_failed: u64,
    pub total_broadcasts: u64,
    pub groups: BTreeMap<GroupId, SendCounter>,
    pub accounts: BTreeMap<String, SendCounter>,
    pub last_cycle_at: Option<i64>,
}

/// Delivery counters of one vouch channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VouchStats {
    pub successes: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub updated_at: i64,
}

/// Status of a broadcast run in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Stopped,
    Crashed,
}

/// One broadcast run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastLog {
    pub id: String,
    pub user_id: UserId,
    pub account_count: usize,
    pub group_count: usize,
    pub status: RunStatus,
    pub started_at: i64,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub cycles: u64,
    #[serde(default)]
    pub error: Option<String>,
}

/// Result of one completed cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub user_id: UserId,
    pub cycle: u64,
    pub sent: u64,
    pub failed: u64,
    pub at: i64,
}

// ============================================================================
// Logger bot
// ============================================================================

/// Whether a user has started the logger bot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerStatus {
    pub is_active: bool,
    pub updated_at: i64,
}

/// A log line that could not be delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerFailure {
    pub user_id: UserId,
    pub error: String,
    pub at: i64,
}

// ============================================================================
// Scratch data
// ============================================================================

/// Short-lived value carried between chat steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempEntry {
    pub value: serde_json::Value,
    pub created_at: i64,
}

/// Global counters for the admin `/stats` command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdminStats {
    pub total_users: usize,
    pub total_accounts: usize,
    pub active_logger_users: usize,
    pub total_forwards: u64,
    pub total_failed: u64,
    pub total_broadcasts: u64,
    pub running_broadcasts: usize,
}
