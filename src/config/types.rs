//! Configuration type definitions for adcaster
//!
//! All types implement serde traits for JSON serialization and have sensible defaults.

use serde::{Deserialize, Serialize};

/// Main configuration struct for adcaster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Control bot (the one users talk to)
    pub bot: BotConfig,
    /// Logger bot that DMs per-user broadcast logs
    pub logger_bot: LoggerBotConfig,
    /// MTProto bridge used for user accounts
    pub bridge: BridgeConfig,
    /// Document store location and connect retries
    pub store: StoreConfig,
    /// Secret-at-rest key material
    pub vault: VaultConfig,
    /// Login and force-join toggles
    pub features: FeaturesConfig,
    /// Broadcast defaults and bounds
    pub broadcast: BroadcastConfig,
    /// Read-only web dashboard
    pub dashboard: DashboardConfig,
    /// Logging output
    pub logging: LoggingConfig,
}

// ============================================================================
// Bots
// ============================================================================

/// Control bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Bot API token from @BotFather
    pub token: String,
    /// Bot username without '@'
    pub username: String,
    /// Display name used in welcome texts
    pub name: String,
    /// Default application API id for users who don't bring their own
    pub api_id: i32,
    /// Default application API hash
    pub api_hash: String,
    /// Telegram user ids allowed to run admin commands
    pub admin_ids: Vec<i64>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            username: "adcasterbot".to_string(),
            name: "Adcaster".to_string(),
            api_id: 0,
            api_hash: String::new(),
            admin_ids: Vec::new(),
        }
    }
}

/// Logger bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerBotConfig {
    /// Bot API token of the logger bot
    pub token: String,
    /// Logger bot username without '@'
    pub username: String,
    /// Seconds between health checks
    pub health_interval_secs: u64,
    /// Idle time after which a health check pings Telegram
    pub idle_threshold_secs: u64,
}

impl Default for LoggerBotConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            username: "adcasterlogbot".to_string(),
            health_interval_secs: 300,
            idle_threshold_secs: 1800,
        }
    }
}

// ============================================================================
// Bridge
// ============================================================================

/// MTProto bridge sidecar configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Base URL of the bridge HTTP API
    pub url: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8765".to_string(),
            timeout_secs: 30,
        }
    }
}

// ============================================================================
// Store & Vault
// ============================================================================

/// Document store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the JSON document file (supports ~)
    pub path: String,
    /// Attempts before giving up at startup
    pub max_connect_retries: u32,
    /// First retry delay, doubled each attempt
    pub base_retry_delay_secs: u64,
    /// Coalesce writes and flush at most this often; 0 writes every change
    pub flush_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "~/.adcaster/store.json".to_string(),
            max_connect_retries: 5,
            base_retry_delay_secs: 2,
            flush_interval_ms: 1000,
        }
    }
}

/// Secret-at-rest configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Base64 32-byte key; takes precedence over `key_file`
    pub key: Option<String>,
    /// Key file, generated on first start when absent (supports ~)
    pub key_file: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            key: None,
            key_file: "~/.adcaster/vault.key".to_string(),
        }
    }
}

// ============================================================================
// Features
// ============================================================================

/// Login and membership toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Require membership in the channel/group below before using the bot
    pub force_join: bool,
    /// Channel username without '@'
    pub must_join_channel: String,
    /// Group username without '@'
    pub must_join_group: String,
    /// Digits in a Telegram login code
    pub otp_length: usize,
    /// Seconds a pending login stays valid
    pub otp_expiry_secs: u64,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            force_join: false,
            must_join_channel: String::new(),
            must_join_group: String::new(),
            otp_length: 5,
            otp_expiry_secs: 300,
        }
    }
}

// ============================================================================
// Broadcast
// ============================================================================

/// Broadcast defaults and bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Default pause between two cycles
    pub default_ad_delay_secs: u64,
    /// Lowest user-settable delay
    pub min_delay_secs: u64,
    /// Highest user-settable delay
    pub max_delay_secs: u64,
    /// Default pause between two sends
    pub default_group_delay_secs: u64,
    /// Default cooldown applied every `cooldown_every_cycles` cycles
    pub default_cycle_timeout_secs: u64,
    /// Default number of saved messages rotated through
    pub default_saved_messages: u32,
    /// Extra cooldown cadence, in cycles
    pub cooldown_every_cycles: u64,
    /// Seconds added on top of a FLOOD_WAIT
    pub flood_wait_buffer_secs: u64,
    /// How often a paused broadcast re-checks its schedule
    pub schedule_poll_secs: u64,
    /// How many saved messages are fetched to pick from
    pub saved_messages_fetch_limit: u32,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            default_ad_delay_secs: 300,
            min_delay_secs: 60,
            max_delay_secs: 3600,
            default_group_delay_secs: 15,
            default_cycle_timeout_secs: 600,
            default_saved_messages: 3,
            cooldown_every_cycles: 5,
            flood_wait_buffer_secs: 5,
            schedule_poll_secs: 300,
            saved_messages_fetch_limit: 20,
        }
    }
}

// ============================================================================
// Dashboard
// ============================================================================

/// Web dashboard configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Serve the dashboard alongside the bots
    pub enabled: bool,
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// HMAC secret for session tokens; falls back to the bot token when empty
    pub jwt_secret: String,
    /// Session lifetime in days
    pub session_ttl_days: i64,
    /// Max age of a login-widget payload in seconds
    pub login_max_age_secs: i64,
    /// Public URL of the dashboard (used by the analytics pusher)
    pub public_url: String,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "0.0.0.0".to_string(),
            port: 5000,
            jwt_secret: String::new(),
            session_ttl_days: 7,
            login_max_age_secs: 86_400,
            public_url: "http://127.0.0.1:5000".to_string(),
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human-readable output
    Pretty,
    /// Compact single-line output with a `component` field
    #[default]
    Component,
    /// JSON lines
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format
    pub format: LogFormat,
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Optional file for JSON output
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Component,
            level: "info".to_string(),
            file: None,
        }
    }
}
