//! Store module - durable per-user records
//!
//! All broadcaster state lives in one document of typed collections, kept in
//! memory behind an async `RwLock` and written back to a JSON file after every
//! mutation. Reads of a missing record return its documented default; every
//! setter is an upsert on the record's natural key, so repeating a call never
//! creates duplicates.
//!
//! The interface is split by entity:
//!
//! - [`users`]: user profile, settings, conversation state, rotation pointer
//! - [`accounts`]: logged-in Telegram accounts
//! - [`groups`]: target groups, forum groups, dialog cache
//! - [`broadcast`]: delays, running/paused flags, run and cycle logs
//! - [`analytics`]: counters, leaderboard, admin stats
//! - [`temp`]: short-lived scratch values, logger-bot status
//!
//! # Example
//!
//! ```
//! use adcaster::store::Store;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Store::new_memory();
//!     store.create_user(42, Some("ann".into()), None).await.unwrap();
//!     store.add_target_group(42, -1001, "Deals").await.unwrap();
//!     assert_eq!(store.target_groups(42).await.len(), 1);
//! }
//! ```

pub mod accounts;
pub mod analytics;
pub mod broadcast;
pub mod groups;
pub mod models;
pub mod temp;
pub mod users;

pub use accounts::mask_phone;
pub use models::*;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{BroadcastConfig, StoreConfig};
use crate::error::{AdError, Result};

/// Maximum retained activity / failure entries.
const MAX_LOG_ENTRIES: usize = 5_000;

/// Serialized shape of the store file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Document {
    version: u32,
    pub(crate) users: BTreeMap<UserId, User>,
    pub(crate) accounts: Vec<Account>,
    pub(crate) target_groups: Vec<TargetGroup>,
    pub(crate) forum_groups: Vec<ForumGroup>,
    pub(crate) groups_cache: Vec<CachedGroup>,
    pub(crate) ad_delays: BTreeMap<UserId, u64>,
    pub(crate) group_msg_delays: BTreeMap<UserId, u64>,
    pub(crate) cycle_timeouts: BTreeMap<UserId, u64>,
    pub(crate) broadcast_states: BTreeMap<UserId, BroadcastState>,
    pub(crate) analytics: BTreeMap<UserId, Analytics>,
    pub(crate) vouch_stats: BTreeMap<String, VouchStats>,
    pub(crate) broadcast_logs: Vec<BroadcastLog>,
    pub(crate) broadcast_activity: Vec<ActivityEntry>,
    pub(crate) logger_status: BTreeMap<UserId, LoggerStatus>,
    pub(crate) logger_failures: Vec<LoggerFailure>,
    pub(crate) temp_data: BTreeMap<UserId, BTreeMap<String, TempEntry>>,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            version: 1,
            users: BTreeMap::new(),
            accounts: Vec::new(),
            target_groups: Vec::new(),
            forum_groups: Vec::new(),
            groups_cache: Vec::new(),
            ad_delays: BTreeMap::new(),
            group_msg_delays: BTreeMap::new(),
            cycle_timeouts: BTreeMap::new(),
            broadcast_states: BTreeMap::new(),
            analytics: BTreeMap::new(),
            vouch_stats: BTreeMap::new(),
            broadcast_logs: Vec::new(),
            broadcast_activity: Vec::new(),
            logger_status: BTreeMap::new(),
            logger_failures: Vec::new(),
            temp_data: BTreeMap::new(),
        }
    }
}

impl Document {
    fn trim_logs(&mut self) {
        if self.broadcast_activity.len() > MAX_LOG_ENTRIES {
            let excess = self.broadcast_activity.len() - MAX_LOG_ENTRIES;
            self.broadcast_activity.drain(..excess);
        }
        if self.logger_failures.len() > MAX_LOG_ENTRIES {
            let excess = self.logger_failures.len() - MAX_LOG_ENTRIES;
            self.logger_failures.drain(..excess);
        }
    }
}

/// Defaults returned for unset per-user settings.
#[derive(Debug, Clone, Copy)]
pub struct StoreDefaults {
    pub ad_delay_secs: u64,
    pub group_delay_secs: u64,
    pub cycle_timeout_secs: u64,
    pub saved_messages: u32,
}

impl From<&BroadcastConfig> for StoreDefaults {
    fn from(cfg: &BroadcastConfig) -> Self {
        Self {
            ad_delay_secs: cfg.default_ad_delay_secs,
            group_delay_secs: cfg.default_group_delay_secs,
            cycle_timeout_secs: cfg.default_cycle_timeout_secs,
            saved_messages: cfg.default_saved_messages.max(1),
        }
    }
}

impl Default for StoreDefaults {
    fn default() -> Self {
        Self::from(&BroadcastConfig::default())
    }
}

/// Handle to the document store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    doc: Arc<RwLock<Document>>,
    /// Optional path for file-based persistence
    path: Option<PathBuf>,
    /// Serializes file writes so a newer snapshot is never overwritten by an older one
    write_lock: Arc<Mutex<()>>,
    /// Set by `mutate` when writes are coalesced, cleared by `flush`
    dirty: Arc<AtomicBool>,
    /// `None` writes the file on every mutation
    flush_interval: Option<Duration>,
    defaults: StoreDefaults,
}

impl Store {
    /// Create a store that keeps everything in memory.
    pub fn new_memory() -> Self {
        Self {
            doc: Arc::new(RwLock::new(Document::default())),
            path: None,
            write_lock: Arc::new(Mutex::new(())),
            dirty: Arc::new(AtomicBool::new(false)),
            flush_interval: None,
            defaults: StoreDefaults::default(),
        }
    }

    /// Open (or create) a file-backed store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or if
    /// the parent directory cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str::<Document>(&content)
                .map_err(|e| AdError::Store(format!("{}: {}", path.display(), e)))?
        } else {
            Document::default()
        };

        let store = Self {
            doc: Arc::new(RwLock::new(doc)),
            path: Some(path),
            write_lock: Arc::new(Mutex::new(())),
            dirty: Arc::new(AtomicBool::new(false)),
            flush_interval: None,
            defaults: StoreDefaults::default(),
        };
        store.persist().await?;
        Ok(store)
    }

    /// Open the configured store, retrying with exponential backoff.
    ///
    /// Gives up after `max_connect_retries` attempts; the caller is expected
    /// to exit the process.
    pub async fn open_with_retry(cfg: &StoreConfig, path: &Path) -> Result<Self> {
        let attempts = cfg.max_connect_retries.max(1);
        let mut attempt: u32 = 0;
        loop {
            match Self::open(path).await {
                Ok(store) => {
                    info!(path = %path.display(), "Store opened");
                    return Ok(store);
                }
                Err(e) if attempt + 1 < attempts => {
                    let delay = connect_backoff_delay(cfg.base_retry_delay_secs, attempt);
                    warn!(
                        "Store open failed (attempt {}/{}), retrying in {}s: {}",
                        attempt + 1,
                        attempts,
                        delay.as_secs(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(AdError::Store(format!(
                        "giving up after {} attempts: {}",
                        attempts, e
                    )))
                }
            }
        }
    }

    /// Replace the defaults returned for unset settings.
    pub fn with_defaults(mut self, defaults: StoreDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Coalesce file writes: mutations only mark the document dirty and
    /// [`Store::spawn_flusher`] writes it at most once per `interval`. A zero
    /// interval keeps writing on every mutation.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Write the document if a coalesced mutation is pending.
    pub async fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.persist().await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Flush pending writes every flush interval, and once more when
    /// `shutdown` fires. Does nothing for write-through stores.
    pub fn spawn_flusher(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let Some(interval) = store.flush_interval else {
                return;
            };
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.flush().await {
                            warn!("Store flush failed: {}", e);
                        }
                    }
                }
            }
            if let Err(e) = store.flush().await {
                error!("Final store flush failed: {}", e);
            }
        })
    }

    pub fn defaults(&self) -> StoreDefaults {
        self.defaults
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) async fn read<T>(&self, f: impl FnOnce(&Document) -> T) -> T {
        let doc = self.doc.read().await;
        f(&doc)
    }

    pub(crate) async fn mutate<T>(&self, f: impl FnOnce(&mut Document) -> T) -> Result<T> {
        let out = {
            let mut doc = self.doc.write().await;
            let out = f(&mut doc);
            doc.trim_logs();
            out
        };
        if self.flush_interval.is_some() {
            self.dirty.store(true, Ordering::Release);
        } else {
            self.persist().await?;
        }
        Ok(out)
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let json = {
            let doc = self.doc.read().await;
            serde_json::to_string(&*doc)?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Delete every record of a user except analytics.
    pub async fn delete_user_fully(&self, user_id: UserId) -> Result<()> {
        self.mutate(|doc| {
            doc.users.remove(&user_id);
            doc.accounts.retain(|a| a.user_id != user_id);
            doc.target_groups.retain(|g| g.user_id != user_id);
            doc.forum_groups.retain(|g| g.user_id != user_id);
            doc.groups_cache.retain(|g| g.user_id != user_id);
            doc.ad_delays.remove(&user_id);
            doc.group_msg_delays.remove(&user_id);
            doc.cycle_timeouts.remove(&user_id);
            doc.broadcast_states.remove(&user_id);
            doc.broadcast_logs.retain(|l| l.user_id != user_id);
            doc.broadcast_activity.retain(|a| a.user_id != user_id);
            doc.logger_status.remove(&user_id);
            doc.logger_failures.retain(|f| f.user_id != user_id);
            doc.temp_data.remove(&user_id);
        })
        .await?;
        info!(user_id, "Deleted all user data (analytics kept)");
        Ok(())
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new_memory()
    }
}

/// Delay before connect attempt `attempt + 1`: `base * 2^attempt`.
pub fn connect_backoff_delay(base_secs: u64, attempt: u32) -> Duration {
    Duration::from_secs(base_secs.saturating_mul(2u64.saturating_pow(attempt)))
}
