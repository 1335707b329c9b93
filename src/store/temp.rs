//! Short-lived scratch values and logger-bot bookkeeping.

use serde_json::Value;

use super::models::*;
use super::Store;
use crate::error::Result;
use crate::utils::time::now_ts;

/// Scratch values older than this read as absent.
pub const TEMP_TTL_SECS: i64 = 30 * 60;

impl Store {
    // ------------------------------------------------------------------
    // Temp data
    // ------------------------------------------------------------------

    pub async fn set_temp(&self, user_id: UserId, key: &str, value: Value) -> Result<()> {
        self.mutate(|doc| {
            doc.temp_data.entry(user_id).or_default().insert(
                key.to_string(),
                TempEntry {
                    value,
                    created_at: now_ts(),
                },
            );
        })
        .await
    }

    /// Read a scratch value. Entries past the TTL are deleted and read as `None`.
    pub async fn get_temp(&self, user_id: UserId, key: &str) -> Option<Value> {
        let entry = self
            .read(|doc| doc.temp_data.get(&user_id).and_then(|m| m.get(key)).cloned())
            .await?;
        if now_ts() - entry.created_at > TEMP_TTL_SECS {
            if let Err(e) = self.delete_temp(user_id, Some(key)).await {
                tracing::warn!(user_id, "Failed to drop expired temp value: {}", e);
            }
            return None;
        }
        Some(entry.value)
    }

    /// Delete one key, or every key of the user when `key` is `None`.
    pub async fn delete_temp(&self, user_id: UserId, key: Option<&str>) -> Result<()> {
        self.mutate(|doc| match key {
            Some(k) => {
                if let Some(map) = doc.temp_data.get_mut(&user_id) {
                    map.remove(k);
                    if map.is_empty() {
                        doc.temp_data.remove(&user_id);
                    }
                }
            }
            None => {
                doc.temp_data.remove(&user_id);
            }
        })
        .await
    }

    // ------------------------------------------------------------------
    // Logger bot
    // ------------------------------------------------------------------

    pub async fn set_logger_status(&self, user_id: UserId, is_active: bool) -> Result<()> {
        self.mutate(|doc| {
            doc.logger_status.insert(
                user_id,
                LoggerStatus {
                    is_active,
                    updated_at: now_ts(),
                },
            );
        })
        .await
    }

    /// Whether the user has started the logger bot.
    pub async fn logger_started(&self, user_id: UserId) -> bool {
        self.read(|doc| {
            doc.logger_status
                .get(&user_id)
                .map(|s| s.is_active)
                .unwrap_or(false)
        })
        .await
    }

    pub async fn log_logger_failure(&self, user_id: UserId, error: &str) -> Result<()> {
        self.mutate(|doc| {
            doc.logger_failures.push(LoggerFailure {
                user_id,
                error: error.to_string(),
                at: now_ts(),
            })
        })
        .await
    }

    pub async fn logger_failures(&self, user_id: UserId) -> Vec<LoggerFailure> {
        self.read(|doc| {
            doc.logger_failures
                .iter()
                .filter(|f| f.user_id == user_id)
                .cloned()
                .collect()
        })
        .await
    }
}
