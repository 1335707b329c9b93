//! Configuration validation with unknown field detection.

use serde_json::Value;
use std::collections::HashSet;

use super::Config;

/// Known top-level config field names.
const KNOWN_TOP_LEVEL: &[&str] = &[
    "bot",
    "logger_bot",
    "bridge",
    "store",
    "vault",
    "features",
    "broadcast",
    "dashboard",
    "logging",
];

/// Known fields of the `broadcast` section.
const KNOWN_BROADCAST: &[&str] = &[
    "default_ad_delay_secs",
    "min_delay_secs",
    "max_delay_secs",
    "default_group_delay_secs",
    "default_cycle_timeout_secs",
    "default_saved_messages",
    "cooldown_every_cycles",
    "flood_wait_buffer_secs",
    "schedule_poll_secs",
    "saved_messages_fetch_limit",
];

/// A validation diagnostic.
#[derive(Debug)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub path: String,
    pub message: String,
}

#[derive(Debug, PartialEq)]
pub enum DiagnosticLevel {
    Ok,
    Warn,
    Error,
}

impl Diagnostic {
    fn new(level: DiagnosticLevel, path: &str, message: impl Into<String>) -> Self {
        Self {
            level,
            path: path.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.level {
            DiagnosticLevel::Ok => "[OK]",
            DiagnosticLevel::Warn => "[WARN]",
            DiagnosticLevel::Error => "[ERROR]",
        };
        if self.path.is_empty() {
            write!(f, "{} {}", prefix, self.message)
        } else {
            write!(f, "{} {}: {}", prefix, self.path, self.message)
        }
    }
}

/// Simple Levenshtein distance for "did you mean?" suggestions.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.iter().enumerate() {
        let mut row = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            row[j + 1] = (prev[j + 1] + 1).min(row[j] + 1).min(prev[j] + cost);
        }
        prev = row;
    }
    prev[b.len()]
}

/// Suggest the closest known field name (if distance <= 3).
pub fn suggest_field(unknown: &str, known: &[&str]) -> Option<String> {
    known
        .iter()
        .map(|k| (k, levenshtein(unknown, k)))
        .filter(|(_, d)| *d <= 3)
        .min_by_key(|(_, d)| *d)
        .map(|(k, _)| format!("did you mean '{}'?", k))
}

fn unknown_keys(
    obj: &serde_json::Map<String, Value>,
    known: &[&str],
    prefix: &str,
    out: &mut Vec<Diagnostic>,
) -> bool {
    let known_set: HashSet<&str> = known.iter().copied().collect();
    let mut found = false;
    for key in obj.keys() {
        if known_set.contains(key.as_str()) {
            continue;
        }
        found = true;
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        let msg = match suggest_field(key, known) {
            Some(hint) => format!("Unknown field '{}', {}", key, hint),
            None => format!("Unknown field '{}'", key),
        };
        out.push(Diagnostic::new(DiagnosticLevel::Error, &path, msg));
    }
    found
}

/// Validate a raw JSON config value against known field names.
pub fn validate_config(raw: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let Some(obj) = raw.as_object() else {
        diagnostics.push(Diagnostic::new(
            DiagnosticLevel::Error,
            "",
            "Config must be a JSON object",
        ));
        return diagnostics;
    };

    diagnostics.push(Diagnostic::new(DiagnosticLevel::Ok, "", "Valid JSON"));

    let mut has_unknown = unknown_keys(obj, KNOWN_TOP_LEVEL, "", &mut diagnostics);
    if let Some(broadcast) = obj.get("broadcast").and_then(|v| v.as_object()) {
        has_unknown |= unknown_keys(broadcast, KNOWN_BROADCAST, "broadcast", &mut diagnostics);
    }

    if !has_unknown {
        diagnostics.push(Diagnostic::new(
            DiagnosticLevel::Ok,
            "",
            "All fields recognized",
        ));
    }

    diagnostics
}

/// Check the loaded values for problems that would break startup.
pub fn validate_values(config: &Config) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    if config.bot.token.trim().is_empty() {
        diagnostics.push(Diagnostic::new(
            DiagnosticLevel::Error,
            "bot.token",
            "Control bot token is empty",
        ));
    }
    if config.logger_bot.token.trim().is_empty() {
        diagnostics.push(Diagnostic::new(
            DiagnosticLevel::Error,
            "logger_bot.token",
            "Logger bot token is empty",
        ));
    }
    if config.bot.api_id == 0 || config.bot.api_hash.is_empty() {
        diagnostics.push(Diagnostic::new(
            DiagnosticLevel::Warn,
            "bot.api_id",
            "No default API credentials, users must supply their own",
        ));
    }
    if config.bot.admin_ids.is_empty() {
        diagnostics.push(Diagnostic::new(
            DiagnosticLevel::Warn,
            "bot.admin_ids",
            "No admins configured, /stats and /bd are disabled",
        ));
    }

    let b = &config.broadcast;
    if b.min_delay_secs > b.max_delay_secs {
        diagnostics.push(Diagnostic::new(
            DiagnosticLevel::Error,
            "broadcast.min_delay_secs",
            format!(
                "min_delay_secs ({}) is greater than max_delay_secs ({})",
                b.min_delay_secs, b.max_delay_secs
            ),
        ));
    }
    if b.default_saved_messages == 0 {
        diagnostics.push(Diagnostic::new(
            DiagnosticLevel::Error,
            "broadcast.default_saved_messages",
            "Must be at least 1",
        ));
    }
    if b.cooldown_every_cycles == 0 {
        diagnostics.push(Diagnostic::new(
            DiagnosticLevel::Error,
            "broadcast.cooldown_every_cycles",
            "Must be at least 1",
        ));
    }

    if config.dashboard.enabled && config.jwt_secret().is_empty() {
        diagnostics.push(Diagnostic::new(
            DiagnosticLevel::Error,
            "dashboard.jwt_secret",
            "Dashboard enabled without a session secret",
        ));
    }

    diagnostics
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_levenshtein_identical() {
        assert_eq!(levenshtein("broadcast", "broadcast"), 0);
    }

    #[test]
    fn test_levenshtein_one_edit() {
        assert_eq!(levenshtein("bot", "bots"), 1);
        assert_eq!(levenshtein("vault", "vaul"), 1);
    }

    #[test]
    fn test_suggest_field_match() {
        assert_eq!(
            suggest_field("brodcast", KNOWN_TOP_LEVEL),
            Some("did you mean 'broadcast'?".to_string())
        );
    }

    #[test]
    fn test_suggest_field_no_match() {
        assert_eq!(suggest_field("zzzzzzzzzz", KNOWN_TOP_LEVEL), None);
    }

    #[test]
    fn test_validate_valid_config() {
        let diags = validate_config(&json!({"bot": {"token": "x"}, "broadcast": {"min_delay_secs": 60}}));
        assert!(diags.iter().all(|d| d.level == DiagnosticLevel::Ok));
    }

    #[test]
    fn test_validate_unknown_nested_field() {
        let diags = validate_config(&json!({"broadcast": {"group_delay": 5}}));
        let err = diags
            .iter()
            .find(|d| d.level == DiagnosticLevel::Error)
            .unwrap();
        assert_eq!(err.path, "broadcast.group_delay");
    }

    #[test]
    fn test_validate_not_an_object() {
        let diags = validate_config(&json!([1, 2]));
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].level, DiagnosticLevel::Error);
    }

    #[test]
    fn test_validate_values_flags_empty_tokens_and_bounds() {
        let mut config = Config::default();
        config.broadcast.min_delay_secs = 4000;
        let diags = validate_values(&config);
        let paths: Vec<&str> = diags
            .iter()
            .filter(|d| d.level == DiagnosticLevel::Error)
            .map(|d| d.path.as_str())
            .collect();
        assert!(paths.contains(&"bot.token"));
        assert!(paths.contains(&"logger_bot.token"));
        assert!(paths.contains(&"broadcast.min_delay_secs"));
    }

    #[test]
    fn test_validate_values_clean_config() {
        let mut config = Config::default();
        config.bot.token = "1:a".into();
        config.logger_bot.token = "2:b".into();
        config.bot.api_id = 1;
        config.bot.api_hash = "h".into();
        config.bot.admin_ids = vec![1];
        assert!(validate_values(&config).is_empty());
    }
}
