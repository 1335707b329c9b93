//! Pattern-based classification of user-account client errors.
//!
//! Checks patterns in priority order: rate limit > session > permanent > transient.
//! Falls back to `Unknown` if no pattern matches.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{AuthError, SendError};

static WAIT_SECS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:flood_wait_|flood_premium_wait_|slowmode_wait_|retry after |wait of )(\d+)")
        .unwrap()
});

/// Seconds to wait, if the message carries a flood-wait marker.
pub fn extract_wait_secs(msg: &str) -> Option<u64> {
    WAIT_SECS
        .captures(msg)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Classify an error message string into a `SendError`.
pub fn classify_error_message(msg: &str) -> SendError {
    if let Some(wait_secs) = extract_wait_secs(msg) {
        return SendError::RateLimited { wait_secs };
    }

    let lower = msg.to_lowercase();

    if contains_any(&lower, &["flood", "too many requests"]) {
        return SendError::RateLimited { wait_secs: 60 };
    }

    // Session gone: the account must log in again
    if contains_any(
        &lower,
        &[
            "auth_key_unregistered",
            "auth_key_invalid",
            "auth_key_duplicated",
            "session_revoked",
            "session_expired",
            "user_deactivated",
        ],
    ) {
        return SendError::SessionInvalid(msg.to_string());
    }

    // Permanent for this account and target
    if contains_any(
        &lower,
        &[
            "forbidden",
            "banned",
            "kicked",
            "not a participant",
            "not a member",
            "user_not_participant",
            "channel_private",
            "chat_admin_required",
            "admin required",
            "rights",
            "chat_restricted",
            "channel_invalid",
            "chat_id_invalid",
            "deactivated",
        ],
    ) {
        return SendError::Permanent(msg.to_string());
    }

    // Transient
    if contains_any(
        &lower,
        &[
            "timeout",
            "timed out",
            "peer_id_invalid",
            "peer id invalid",
            "could not find the input entity",
            "network",
            "connection",
            "topic_closed",
            "topic closed",
            "topic_deleted",
            "internal",
            "rpc_call_fail",
            "503",
            "502",
        ],
    ) {
        return SendError::Transient(msg.to_string());
    }

    SendError::Unknown(msg.to_string())
}

/// Classify a login error returned by the client.
pub fn classify_auth_error(msg: &str) -> AuthError {
    if let Some(secs) = extract_wait_secs(msg) {
        return AuthError::Flood(secs);
    }
    let lower = msg.to_lowercase();
    if contains_any(&lower, &["phone_number_invalid", "phone_number_banned", "phone_number_unoccupied"]) {
        return AuthError::InvalidPhone;
    }
    if contains_any(&lower, &["phone_code_expired", "code expired", "login expired"]) {
        return AuthError::CodeExpired;
    }
    if contains_any(&lower, &["phone_code_invalid", "phone_code_empty"]) {
        return AuthError::InvalidCode;
    }
    if contains_any(&lower, &["session_password_needed", "password required"]) {
        return AuthError::PasswordRequired;
    }
    if contains_any(&lower, &["password_hash_invalid", "password invalid"]) {
        return AuthError::InvalidPassword;
    }
    if contains_any(&lower, &["api_id_invalid", "api_id_published_flood", "api_hash_invalid"]) {
        return AuthError::InvalidApiCredentials;
    }
    AuthError::Other(msg.to_string())
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flood_wait_extracts_seconds() {
        assert_eq!(
            classify_error_message("FLOOD_WAIT_30"),
            SendError::RateLimited { wait_secs: 30 }
        );
        assert_eq!(
            classify_error_message("A wait of 120 seconds is required"),
            SendError::RateLimited { wait_secs: 120 }
        );
    }

    #[test]
    fn test_retry_after_phrase() {
        assert_eq!(
            classify_error_message("retry after 30s"),
            SendError::RateLimited { wait_secs: 30 }
        );
    }

    #[test]
    fn test_flood_without_number_defaults() {
        assert_eq!(
            classify_error_message("Too Many Requests"),
            SendError::RateLimited { wait_secs: 60 }
        );
    }

    #[test]
    fn test_forbidden_is_permanent() {
        assert!(matches!(classify_error_message("forbidden"), SendError::Permanent(_)));
        assert!(matches!(
            classify_error_message("CHAT_WRITE_FORBIDDEN"),
            SendError::Permanent(_)
        ));
        assert!(matches!(
            classify_error_message("USER_BANNED_IN_CHANNEL"),
            SendError::Permanent(_)
        ));
        assert!(matches!(
            classify_error_message("CHAT_ADMIN_REQUIRED"),
            SendError::Permanent(_)
        ));
    }

    #[test]
    fn test_timeout_is_transient() {
        assert!(matches!(classify_error_message("timeout"), SendError::Transient(_)));
        assert!(matches!(
            classify_error_message("PEER_ID_INVALID"),
            SendError::Transient(_)
        ));
        assert!(matches!(
            classify_error_message("TOPIC_CLOSED"),
            SendError::Transient(_)
        ));
    }

    #[test]
    fn test_session_errors() {
        assert!(matches!(
            classify_error_message("AUTH_KEY_UNREGISTERED"),
            SendError::SessionInvalid(_)
        ));
        // USER_DEACTIVATED must not be mistaken for a permanent target failure
        assert!(matches!(
            classify_error_message("USER_DEACTIVATED_BAN"),
            SendError::SessionInvalid(_)
        ));
    }

    #[test]
    fn test_unknown_fallback() {
        assert!(matches!(
            classify_error_message("something odd"),
            SendError::Unknown(_)
        ));
    }

    #[test]
    fn test_auth_error_classification() {
        assert_eq!(classify_auth_error("PHONE_NUMBER_INVALID"), AuthError::InvalidPhone);
        assert_eq!(classify_auth_error("PHONE_CODE_INVALID"), AuthError::InvalidCode);
        assert_eq!(classify_auth_error("PHONE_CODE_EXPIRED"), AuthError::CodeExpired);
        assert_eq!(
            classify_auth_error("SESSION_PASSWORD_NEEDED"),
            AuthError::PasswordRequired
        );
        assert_eq!(
            classify_auth_error("PASSWORD_HASH_INVALID"),
            AuthError::InvalidPassword
        );
        assert_eq!(
            classify_auth_error("API_ID_INVALID"),
            AuthError::InvalidApiCredentials
        );
        assert_eq!(classify_auth_error("FLOOD_WAIT_77"), AuthError::Flood(77));
        assert!(matches!(classify_auth_error("weird"), AuthError::Other(_)));
    }
}
