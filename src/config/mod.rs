//! Configuration management for adcaster
//!
//! Configuration is loaded once at startup from `~/.adcaster/config.json`
//! (under `$HOME`), then environment variables (and a `.env` file, if present)
//! override individual fields.

mod types;
pub mod validate;

pub use types::*;

use crate::error::Result;
use std::path::{Path, PathBuf};

impl Config {
    /// Returns the adcaster configuration directory path (~/.adcaster)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".adcaster")
    }

    /// Returns the path to the config file (~/.adcaster/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from the default path with environment overrides.
    ///
    /// If the config file doesn't exist, returns default configuration.
    /// Environment variables can override config values using the pattern:
    /// `ADCASTER_SECTION_KEY`
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        // Control bot
        if let Ok(val) = std::env::var("ADCASTER_BOT_TOKEN") {
            self.bot.token = val;
        }
        if let Ok(val) = std::env::var("ADCASTER_BOT_USERNAME") {
            self.bot.username = val;
        }
        if let Ok(val) = std::env::var("ADCASTER_BOT_API_ID") {
            if let Ok(v) = val.parse() {
                self.bot.api_id = v;
            }
        }
        if let Ok(val) = std::env::var("ADCASTER_BOT_API_HASH") {
            self.bot.api_hash = val;
        }
        if let Ok(val) = std::env::var("ADCASTER_BOT_ADMIN_IDS") {
            let ids: Vec<i64> = val
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if !ids.is_empty() {
                self.bot.admin_ids = ids;
            }
        }

        // Logger bot
        if let Ok(val) = std::env::var("ADCASTER_LOGGER_BOT_TOKEN") {
            self.logger_bot.token = val;
        }
        if let Ok(val) = std::env::var("ADCASTER_LOGGER_BOT_USERNAME") {
            self.logger_bot.username = val;
        }

        // Bridge / store / vault
        if let Ok(val) = std::env::var("ADCASTER_BRIDGE_URL") {
            self.bridge.url = val;
        }
        if let Ok(val) = std::env::var("ADCASTER_STORE_PATH") {
            self.store.path = val;
        }
        if let Ok(val) = std::env::var("ADCASTER_STORE_FLUSH_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                self.store.flush_interval_ms = v;
            }
        }
        if let Ok(val) = std::env::var("ADCASTER_VAULT_KEY") {
            self.vault.key = Some(val);
        }
        if let Ok(val) = std::env::var("ADCASTER_VAULT_KEY_FILE") {
            self.vault.key_file = val;
        }

        // Dashboard
        if let Ok(val) = std::env::var("ADCASTER_DASHBOARD_ENABLED") {
            self.dashboard.enabled = matches!(val.as_str(), "1" | "true" | "yes");
        }
        if let Ok(val) = std::env::var("ADCASTER_DASHBOARD_HOST") {
            self.dashboard.host = val;
        }
        if let Ok(val) = std::env::var("ADCASTER_DASHBOARD_PORT") {
            if let Ok(v) = val.parse() {
                self.dashboard.port = v;
            }
        }
        if let Ok(val) = std::env::var("ADCASTER_DASHBOARD_JWT_SECRET") {
            self.dashboard.jwt_secret = val;
        }
        if let Ok(val) = std::env::var("ADCASTER_DASHBOARD_PUBLIC_URL") {
            self.dashboard.public_url = val;
        }

        // Logging
        if let Ok(val) = std::env::var("ADCASTER_LOGGING_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolved store document path.
    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    /// Resolved vault key file path.
    pub fn vault_key_path(&self) -> PathBuf {
        expand_home(&self.vault.key_file)
    }

    /// Secret used to sign dashboard sessions.
    pub fn jwt_secret(&self) -> &str {
        if self.dashboard.jwt_secret.is_empty() {
            &self.bot.token
        } else {
            &self.dashboard.jwt_secret
        }
    }

    /// Returns `true` if the user id is listed as an admin.
    pub fn is_admin(&self, user_id: i64) -> bool {
        self.bot.admin_ids.contains(&user_id)
    }
}

/// Expand ~ to home directory in a path string
pub fn expand_home(path: &str) -> PathBuf {
    if path.is_empty() {
        return PathBuf::from(path);
    }

    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return match rest.strip_prefix('/') {
                Some(tail) => home.join(tail),
                None if rest.is_empty() => home,
                None => PathBuf::from(path),
            };
        }
    }

    PathBuf::from(path)
}
