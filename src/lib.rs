//! adcaster - multi-tenant Telegram ad broadcaster
//!
//! Users link their own Telegram accounts through the main bot, pick target
//! groups and forum topics, and the broadcast engine forwards their ads in
//! cycles while the logger bot reports progress.

pub mod analyzer;
pub mod bot;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod relay;
pub mod store;
pub mod telegram;
pub mod utils;
pub mod vault;

pub use config::Config;
pub use error::{AdError, AuthError, Result, SendError};
pub use store::Store;
