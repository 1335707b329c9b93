//! Client for `POST /api/bot/update_analytics`, for processes that report
//! counters to a dashboard they do not share a store with.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::analytics::Counter;
use crate::store::UserId;

const PUSH_TIMEOUT_SECS: u64 = 5;

fn action_name(counter: Counter) -> &'static str {
    match counter {
        Counter::Cycle => "increment_cycle",
        Counter::Sent => "increment_sent",
        Counter::Failed => "increment_failed",
    }
}

/// Posts counter increments to a dashboard.
#[derive(Clone)]
pub struct AnalyticsPusher {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl AnalyticsPusher {
    pub fn new(dashboard_url: &str, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(PUSH_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/api/bot/update_analytics",
                dashboard_url.trim_end_matches('/')
            ),
            api_key: api_key.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns whether the dashboard accepted the update. Never errors.
    pub async fn push(&self, user_id: UserId, counter: Counter) -> bool {
        let action = action_name(counter);
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-API-Key", &self.api_key)
            .json(&json!({ "user_id": user_id, "action": action }))
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => {
                debug!(user_id, action, "Dashboard analytics updated");
                true
            }
            Ok(r) => {
                warn!(user_id, action, status = %r.status(), "Dashboard rejected analytics update");
                false
            }
            Err(e) => {
                warn!(user_id, action, "Dashboard analytics update failed: {}", e);
                false
            }
        }
    }

    pub async fn increment_cycle(&self, user_id: UserId) -> bool {
        self.push(user_id, Counter::Cycle).await
    }

    pub async fn increment_sent(&self, user_id: UserId) -> bool {
        self.push(user_id, Counter::Sent).await
    }

    pub async fn increment_failed(&self, user_id: UserId) -> bool {
        self.push(user_id, Counter::Failed).await
    }
}
