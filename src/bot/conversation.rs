//! Conversation routing and input validation.
//!
//! A user's next free-form message is interpreted according to their
//! persisted [`ConversationState`]. [`route`] is the whole table; every
//! [`Route`] has exactly one handler in the bot.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::store::ConversationState;

static PHONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+\d{7,15}$").unwrap());
static API_HASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{32}$").unwrap());

/// Shape of an incoming message, as far as routing cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Text,
    /// Photos, stickers, documents...
    NonText,
}

/// Handler selected for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    ApiId,
    ApiHash,
    Phone,
    Otp,
    Password,
    AdDelay,
    GroupDelay,
    CycleTimeout,
    SavedCount,
    PostLink,
    ScheduleStart,
    ScheduleEnd,
    GroupSearch,
    /// A flow is waiting for text but got something else
    ExpectText,
    /// No flow in progress; point the user at the menu
    Menu,
    Ignore,
}

pub fn route(state: &ConversationState, input: InputKind) -> Route {
    use ConversationState as S;

    match (state, input) {
        (S::Idle, InputKind::Text) => Route::Menu,
        (S::Idle, InputKind::NonText) => Route::Ignore,
        (_, InputKind::NonText) => Route::ExpectText,
        (S::AwaitingApiId, _) => Route::ApiId,
        (S::AwaitingApiHash { .. }, _) => Route::ApiHash,
        (S::AwaitingPhone, _) => Route::Phone,
        (S::AwaitingOtp { .. }, _) => Route::Otp,
        (S::AwaitingPassword { .. }, _) => Route::Password,
        (S::AwaitingAdDelay, _) => Route::AdDelay,
        (S::AwaitingGroupDelay, _) => Route::GroupDelay,
        (S::AwaitingCycleTimeout, _) => Route::CycleTimeout,
        (S::AwaitingSavedCount, _) => Route::SavedCount,
        (S::AwaitingPostLink, _) => Route::PostLink,
        (S::AwaitingScheduleStart, _) => Route::ScheduleStart,
        (S::AwaitingScheduleEnd { .. }, _) => Route::ScheduleEnd,
        (S::AwaitingGroupSearch, _) => Route::GroupSearch,
    }
}

/// Whether the state belongs to the login flow (temp data must be cleared on cancel).
pub fn is_login_state(state: &ConversationState) -> bool {
    matches!(
        state,
        ConversationState::AwaitingApiId
            | ConversationState::AwaitingApiHash { .. }
            | ConversationState::AwaitingPhone
            | ConversationState::AwaitingOtp { .. }
            | ConversationState::AwaitingPassword { .. }
    )
}

pub fn parse_api_id(input: &str) -> Result<i32, &'static str> {
    match input.trim().parse::<i32>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err("API ID must be a positive number."),
    }
}

pub fn parse_api_hash(input: &str) -> Result<String, &'static str> {
    let hash = input.trim();
    if API_HASH.is_match(hash) {
        Ok(hash.to_lowercase())
    } else {
        Err("API hash must be 32 hexadecimal characters.")
    }
}

/// `+<country><number>`; spaces and dashes are ignored.
pub fn parse_phone(input: &str) -> Result<String, &'static str> {
    let phone: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    if PHONE.is_match(&phone) {
        Ok(phone)
    } else {
        Err("Send the phone number with country code, e.g. +919876543210.")
    }
}

/// Accept `1 2 3 4 5`, `12345` or `1-2-3-4-5`. Telegram cancels codes that are
/// sent verbatim in a chat, hence the separators.
pub fn normalize_otp(input: &str, length: usize) -> Option<String> {
    let trimmed = input.trim();
    if trimmed
        .chars()
        .any(|c| !(c.is_ascii_digit() || c.is_whitespace() || c == '-'))
    {
        return None;
    }
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    (digits.len() == length).then_some(digits)
}

/// Delay in seconds within `[min, max]`.
pub fn parse_delay(input: &str, min: u64, max: u64) -> Result<u64, String> {
    let secs: u64 = input
        .trim()
        .trim_end_matches('s')
        .parse()
        .map_err(|_| "Send a number of seconds.".to_string())?;
    if secs < min || secs > max {
        return Err(format!("Delay must be between {}s and {}s.", min, max));
    }
    Ok(secs)
}

/// Number of saved messages to rotate through, 1 to 20.
pub fn parse_saved_count(input: &str) -> Result<u32, &'static str> {
    match input.trim().parse::<u32>() {
        Ok(n) if (1..=20).contains(&n) => Ok(n),
        _ => Err("Send a number between 1 and 20."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_table() {
        assert_eq!(route(&ConversationState::Idle, InputKind::Text), Route::Menu);
        assert_eq!(route(&ConversationState::Idle, InputKind::NonText), Route::Ignore);
        assert_eq!(
            route(&ConversationState::AwaitingOtp { phone: "+1".into() }, InputKind::Text),
            Route::Otp
        );
        assert_eq!(
            route(&ConversationState::AwaitingOtp { phone: "+1".into() }, InputKind::NonText),
            Route::ExpectText
        );
        assert_eq!(
            route(
                &ConversationState::AwaitingScheduleEnd { start: "8:00 AM".into() },
                InputKind::Text
            ),
            Route::ScheduleEnd
        );
        assert_eq!(route(&ConversationState::AwaitingAdDelay, InputKind::Text), Route::AdDelay);
    }

    #[test]
    fn test_login_states() {
        assert!(is_login_state(&ConversationState::AwaitingPhone));
        assert!(is_login_state(&ConversationState::AwaitingApiHash { api_id: 1 }));
        assert!(!is_login_state(&ConversationState::AwaitingPostLink));
    }

    #[test]
    fn test_otp_normalization() {
        assert_eq!(normalize_otp("1 2 3 4 5", 5).as_deref(), Some("12345"));
        assert_eq!(normalize_otp("12345", 5).as_deref(), Some("12345"));
        assert_eq!(normalize_otp("1-2-3-4-5", 5).as_deref(), Some("12345"));
        assert_eq!(normalize_otp("1234", 5), None);
        assert_eq!(normalize_otp("12a45", 5), None);
    }

    #[test]
    fn test_phone_and_api_inputs() {
        assert_eq!(parse_phone("+91 98765-43210").unwrap(), "+919876543210");
        assert!(parse_phone("98765").is_err());
        assert_eq!(parse_api_id(" 123456 ").unwrap(), 123456);
        assert!(parse_api_id("-4").is_err());
        assert!(parse_api_hash("0123456789abcdef0123456789ABCDEF").is_ok());
        assert!(parse_api_hash("xyz").is_err());
    }

    #[test]
    fn test_delay_bounds() {
        assert_eq!(parse_delay("120", 60, 3600).unwrap(), 120);
        assert_eq!(parse_delay("90s", 60, 3600).unwrap(), 90);
        assert!(parse_delay("30", 60, 3600).is_err());
        assert!(parse_delay("abc", 60, 3600).is_err());
        assert_eq!(parse_saved_count("3").unwrap(), 3);
        assert!(parse_saved_count("0").is_err());
    }
}
