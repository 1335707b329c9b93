//! Error types for adcaster
//!
//! This module defines all error types used throughout the broadcaster.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Send Error Classification
// ============================================================================

/// Classified failure of a single call into the Telegram user-account client.
///
/// Produced exactly once at the provider boundary (see
/// [`crate::telegram::classify_error_message`]); everything downstream
/// matches on the kind instead of inspecting message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Telegram asked us to wait before the next request (FLOOD_WAIT).
    RateLimited { wait_secs: u64 },
    /// The account can never post to this target (banned, kicked, no rights).
    Permanent(String),
    /// Network hiccup, timeout, unresolved peer or closed topic.
    Transient(String),
    /// The account session was revoked or the auth key is gone.
    SessionInvalid(String),
    /// Anything the classifier did not recognise
    Unknown(String),
}

/// What the broadcast engine does with a group after a failed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Sleep for the given duration, keep the group.
    Backoff(Duration),
    /// Remove the group from this account's working set for the rest of the run.
    DropFromWorkingSet,
    /// Keep the group, it will be retried on the next cycle.
    RetryNextCycle,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::RateLimited { wait_secs } => {
                write!(f, "Rate limited: retry after {}s", wait_secs)
            }
            SendError::Permanent(msg) => write!(f, "Permanent failure: {}", msg),
            SendError::Transient(msg) => write!(f, "Transient failure: {}", msg),
            SendError::SessionInvalid(msg) => write!(f, "Session invalid: {}", msg),
            SendError::Unknown(msg) => write!(f, "Unknown send error: {}", msg),
        }
    }
}

impl std::error::Error for SendError {}

impl SendError {
    /// Map the error kind to what should happen to the target group.
    ///
    /// `flood_buffer` is added on top of the server-provided wait.
    pub fn disposition(&self, flood_buffer: Duration) -> Disposition {
        match self {
            SendError::RateLimited { wait_secs } => {
                Disposition::Backoff(Duration::from_secs(*wait_secs) + flood_buffer)
            }
            SendError::Permanent(_) => Disposition::DropFromWorkingSet,
            SendError::Transient(_) | SendError::SessionInvalid(_) | SendError::Unknown(_) => {
                Disposition::RetryNextCycle
            }
        }
    }

    /// Returns `true` if the group should stay in the working set.
    pub fn keeps_group(&self) -> bool {
        !matches!(self, SendError::Permanent(_))
    }

    /// Short, user-facing reason used in relay notices.
    pub fn reason(&self) -> &str {
        match self {
            SendError::RateLimited { .. } => "rate limited",
            SendError::Permanent(msg)
            | SendError::Transient(msg)
            | SendError::SessionInvalid(msg)
            | SendError::Unknown(msg) => msg,
        }
    }
}

impl From<SendError> for AdError {
    fn from(err: SendError) -> Self {
        AdError::Send(err)
    }
}

// ============================================================================
// Login Errors
// ============================================================================

/// Failures of the phone / code / two-factor login flow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid phone number format")]
    InvalidPhone,
    #[error("Invalid login code")]
    InvalidCode,
    #[error("Login code expired")]
    CodeExpired,
    #[error("Two-step verification password required")]
    PasswordRequired,
    #[error("Invalid two-step verification password")]
    InvalidPassword,
    #[error("API ID or API hash rejected by Telegram")]
    InvalidApiCredentials,
    #[error("Too many attempts, wait {0}s")]
    Flood(u64),
    #[error("Login failed: {0}")]
    Other(String),
}

impl From<AuthError> for AdError {
    fn from(err: AuthError) -> Self {
        AdError::Auth(err)
    }
}

// ============================================================================
// Primary Error Type
// ============================================================================

/// The primary error type for adcaster operations.
#[derive(Error, Debug)]
pub enum AdError {
    /// Configuration-related errors (invalid config, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Document store failures (unreachable file, corrupt document, etc.)
    #[error("Store error: {0}")]
    Store(String),

    /// Sealing or unsealing a secret failed (wrong key, corrupt blob)
    #[error("Vault error: {0}")]
    Vault(String),

    /// Stored account credentials could not be used; the user must log in again
    #[error("Credentials invalid: {0}")]
    Credentials(String),

    /// Login flow failures
    #[error("Login error: {0}")]
    Auth(AuthError),

    /// Bridge / user-account client failures outside a single send
    #[error("Provider error: {0}")]
    Provider(String),

    /// Classified single-call failure
    #[error("Send error: {0}")]
    Send(SendError),

    /// Log relay failures (only surfaced by the logger bot itself)
    #[error("Relay error: {0}")]
    Relay(String),

    /// Broadcast lifecycle violations (already running, nothing to send, etc.)
    #[error("Broadcast error: {0}")]
    Broadcast(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller is not allowed to perform the action
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A specialized Result type for adcaster operations.
pub type Result<T> = std::result::Result<T, AdError>;
