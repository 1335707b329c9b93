//! Tracing subscriber setup.
//!
//! Formats:
//! - `component` (default): compact lines carrying a `component` field set by
//!   [`log_component!`](crate::log_component), so one subsystem
//!   (`engine`, `relay`, `analyzer`, `bot`, `dashboard`) can be grepped out
//! - `pretty`: multi-line, for local debugging
//! - `json`: one object per line
//!
//! Output goes to stderr so command output on stdout stays clean, or to
//! `logging.file` when set.

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::{expand_home, LogFormat, LoggingConfig};
use crate::error::Result;

/// Install the global subscriber. `RUST_LOG` wins over `cfg.level`.
pub fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    let writer = match cfg.file.as_deref().filter(|f| !f.is_empty()) {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(expand_home(path))?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match cfg.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Component => builder.with_target(true).compact().init(),
    }
    Ok(())
}

/// Emit a component-tagged tracing event.
///
/// Works with any tracing level (`trace`, `debug`, `info`, `warn`, `error`).
/// The `component` field makes it easy to grep logs by subsystem:
///
/// ```
/// # use adcaster::log_component;
/// log_component!(info, "engine", "cycle complete");
/// log_component!(warn, "relay", "logger bot unreachable", user_id = 42i64, attempt = 3u32);
/// ```
#[macro_export]
macro_rules! log_component {
    ($level:ident, $component:expr, $msg:expr) => {
        tracing::$level!(component = $component, $msg)
    };
    ($level:ident, $component:expr, $msg:expr, $($key:ident = $val:expr),+ $(,)?) => {
        tracing::$level!(component = $component, $($key = $val,)+ $msg)
    };
}
