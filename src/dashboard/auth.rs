//! Dashboard authentication.
//!
//! Users sign in with the Telegram login widget. The widget payload is
//! verified against the bot token and exchanged for a signed session token
//! (HS256 JWT) that later requests present as `Authorization: Bearer <jwt>`
//! or a `session` cookie.

use std::collections::BTreeMap;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use ring::hmac;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::{ApiError, DashboardState};
use crate::store::UserId;

/// Why a widget payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WidgetError {
    #[error("missing hash")]
    MissingHash,
    #[error("missing or invalid {0}")]
    MissingField(&'static str),
    #[error("hash mismatch")]
    BadHash,
    #[error("login data too old")]
    Expired,
}

/// Identity extracted from a verified widget payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetUser {
    pub id: UserId,
    pub username: Option<String>,
    pub first_name: Option<String>,
}

fn field_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// `key=value` lines sorted by key, `hash` excluded.
pub fn data_check_string(payload: &BTreeMap<String, Value>) -> String {
    payload
        .iter()
        .filter(|(k, _)| k.as_str() != "hash")
        .filter_map(|(k, v)| field_string(v).map(|v| format!("{}={}", k, v)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Hex HMAC-SHA256 of the data-check string keyed with `SHA256(bot_token)`.
pub fn widget_hash(bot_token: &str, payload: &BTreeMap<String, Value>) -> String {
    let secret = Sha256::digest(bot_token.as_bytes());
    let key = hmac::Key::new(hmac::HMAC_SHA256, &secret);
    let tag = hmac::sign(&key, data_check_string(payload).as_bytes());
    hex::encode(tag.as_ref())
}

/// Check the widget signature and freshness.
pub fn verify_widget(
    bot_token: &str,
    payload: &BTreeMap<String, Value>,
    now: i64,
    max_age_secs: i64,
) -> Result<WidgetUser, WidgetError> {
    let provided = payload
        .get("hash")
        .and_then(Value::as_str)
        .ok_or(WidgetError::MissingHash)?
        .to_ascii_lowercase();
    let expected = widget_hash(bot_token, payload);
    if !bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
        return Err(WidgetError::BadHash);
    }

    let auth_date = payload
        .get("auth_date")
        .and_then(field_string)
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(WidgetError::MissingField("auth_date"))?;
    if now - auth_date > max_age_secs {
        return Err(WidgetError::Expired);
    }

    let id = payload
        .get("id")
        .and_then(field_string)
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(WidgetError::MissingField("id"))?;
    Ok(WidgetUser {
        id,
        username: payload.get("username").and_then(field_string),
        first_name: payload.get("first_name").and_then(field_string),
    })
}

/// Session token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Telegram user id
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
    #[serde(default)]
    pub username: Option<String>,
}

impl Claims {
    pub fn user_id(&self) -> Option<UserId> {
        self.sub.parse().ok()
    }
}

pub fn issue_session(
    secret: &str,
    user: &WidgetUser,
    now: i64,
    ttl_days: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: user.id.to_string(),
        iat: now.max(0) as usize,
        exp: (now + ttl_days * 86_400).max(0) as usize,
        username: user.username.clone(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub fn validate_session(secret: &str, token: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
}

/// Bearer header first, then the `session` cookie.
fn session_token(request: &Request) -> Option<String> {
    let headers = request.headers();
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.trim().to_string());
    }
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .filter_map(|c| c.trim().split_once('='))
                .find(|(name, _)| *name == "session")
                .map(|(_, value)| value.to_string())
        })
}

/// The signed-in user, inserted into request extensions by [`session_middleware`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionUser(pub UserId);

/// Rejects requests without a valid session.
pub async fn session_middleware(
    State(state): State<DashboardState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = session_token(&request)
        .ok_or_else(|| ApiError::Unauthorized("Not logged in".to_string()))?;
    let user_id = validate_session(state.config.jwt_secret(), &token)
        .and_then(|c| c.user_id())
        .ok_or_else(|| ApiError::Unauthorized("Invalid or expired session".to_string()))?;
    request.extensions_mut().insert(SessionUser(user_id));
    Ok(next.run(request).await)
}

/// Constant-time check of the `X-API-Key` header against the bot token.
pub fn api_key_matches(provided: Option<&str>, bot_token: &str) -> bool {
    match provided {
        Some(key) if !bot_token.is_empty() => key.as_bytes().ct_eq(bot_token.as_bytes()).into(),
        _ => false,
    }
}
