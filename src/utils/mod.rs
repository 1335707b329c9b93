//! Utils module - Logging setup and time helpers

pub mod logging;
pub mod time;
