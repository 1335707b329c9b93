//! HTTP handlers for the dashboard API.

use std::collections::BTreeMap;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::auth::{api_key_matches, issue_session, verify_widget, SessionUser};
use super::{ApiError, DashboardState};
use crate::log_component;
use crate::store::analytics::Counter;
use crate::utils::time::now_ts;

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /auth/telegram
pub async fn telegram_auth(
    State(state): State<DashboardState>,
    Json(payload): Json<BTreeMap<String, Value>>,
) -> Result<Response, ApiError> {
    let now = now_ts();
    let user = verify_widget(
        &state.config.bot.token,
        &payload,
        now,
        state.config.dashboard.login_max_age_secs,
    )
    .map_err(|e| {
        debug!("Widget login rejected: {}", e);
        ApiError::Unauthorized("Authentication failed".to_string())
    })?;

    state
        .store
        .create_user(user.id, user.username.clone(), user.first_name.clone())
        .await?;
    let token = issue_session(
        state.config.jwt_secret(),
        &user,
        now,
        state.config.dashboard.session_ttl_days,
    )
    .map_err(|e| ApiError::Internal(format!("session signing failed: {}", e)))?;
    log_component!(info, "dashboard", "Dashboard login", user_id = user.id);

    let max_age = state.config.dashboard.session_ttl_days * 86_400;
    let cookie = format!(
        "session={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        token, max_age
    );
    let body = Json(json!({
        "success": true,
        "token": token,
        "redirect": "/dashboard",
    }));
    Ok(([(header::SET_COOKIE, cookie)], body).into_response())
}

#[derive(Debug, Serialize)]
pub struct AnalyticsView {
    pub total_cycles: u64,
    pub total_sent: u64,
    pub total_failed: u64,
    pub total_broadcasts: u64,
    pub accounts_count: usize,
    pub groups_count: usize,
    pub broadcast_running: bool,
    pub broadcast_paused: bool,
}

/// GET /api/analytics
pub async fn get_analytics(
    State(state): State<DashboardState>,
    Extension(SessionUser(user_id)): Extension<SessionUser>,
) -> Json<Value> {
    let store = &state.store;
    let analytics = store.analytics(user_id).await;
    let broadcast = store.broadcast_state(user_id).await;
    let view = AnalyticsView {
        total_cycles: analytics.total_cycles,
        total_sent: analytics.total_sent,
        total_failed: analytics.total_failed,
        total_broadcasts: analytics.total_broadcasts,
        accounts_count: store.accounts(user_id).await.len(),
        groups_count: store.target_groups(user_id).await.len()
            + store.forum_groups(user_id).await.len(),
        broadcast_running: broadcast.running,
        broadcast_paused: broadcast.paused,
    };
    Json(json!({ "success": true, "data": view }))
}

/// GET /api/accounts
pub async fn get_accounts(
    State(state): State<DashboardState>,
    Extension(SessionUser(user_id)): Extension<SessionUser>,
) -> Json<Value> {
    let accounts: Vec<Value> = state
        .store
        .accounts(user_id)
        .await
        .into_iter()
        .map(|a| {
            json!({
                "id": a.id,
                "phone_number": a.phone_number,
                "first_name": a.first_name.unwrap_or_default(),
                "last_name": a.last_name.unwrap_or_default(),
                "is_active": a.is_active,
                "created_at": chrono::DateTime::from_timestamp(a.created_at, 0)
                    .map(|dt| dt.to_rfc3339()),
            })
        })
        .collect();
    Json(json!({ "success": true, "accounts": accounts }))
}

/// GET /api/groups
pub async fn get_groups(
    State(state): State<DashboardState>,
    Extension(SessionUser(user_id)): Extension<SessionUser>,
) -> Json<Value> {
    let regular: Vec<Value> = state
        .store
        .target_groups(user_id)
        .await
        .into_iter()
        .map(|g| json!({ "id": g.group_id, "name": g.title, "type": "regular" }))
        .collect();
    let forums: Vec<Value> = state
        .store
        .forum_groups(user_id)
        .await
        .into_iter()
        .map(|g| {
            json!({
                "id": g.group_id,
                "name": g.title,
                "type": "forum",
                "topics_count": g.topics.len(),
            })
        })
        .collect();
    Json(json!({
        "success": true,
        "groups": { "regular_groups": regular, "forum_groups": forums },
    }))
}

/// Request body for POST /api/bot/update_analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsUpdate {
    pub user_id: i64,
    pub action: String,
}

pub fn parse_action(action: &str) -> Option<Counter> {
    match action {
        "increment_cycle" => Some(Counter::Cycle),
        "increment_sent" => Some(Counter::Sent),
        "increment_failed" => Some(Counter::Failed),
        _ => None,
    }
}

/// POST /api/bot/update_analytics, authenticated with `X-API-Key`.
pub async fn update_analytics(
    State(state): State<DashboardState>,
    headers: HeaderMap,
    Json(update): Json<AnalyticsUpdate>,
) -> Result<Json<Value>, ApiError> {
    let key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    if !api_key_matches(key, &state.config.bot.token) {
        warn!(user_id = update.user_id, "Analytics update with a bad API key");
        return Err(ApiError::Unauthorized("Unauthorized".to_string()));
    }
    let counter = parse_action(&update.action)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown action '{}'", update.action)))?;
    state.store.apply_counter(update.user_id, counter).await?;
    Ok(Json(json!({ "success": true })))
}

/// Fallback for unknown routes.
pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "error": "Not found" })),
    )
}
