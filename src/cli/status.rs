//! Status command handler.

use anyhow::{Context, Result};

use adcaster::config::Config;
use adcaster::store::Store;
use adcaster::utils::time::format_ist;

/// Print admin statistics and the users whose broadcast is marked running.
pub(crate) async fn cmd_status() -> Result<()> {
    let config = Config::load().with_context(|| "Failed to load configuration")?;
    let path = config.store_path();
    if !path.exists() {
        println!("No store at {} yet.", path.display());
        return Ok(());
    }
    let store = Store::open(&path)
        .await
        .with_context(|| format!("Failed to open store {}", path.display()))?;
    let stats = store.admin_stats().await;

    println!("adcaster status");
    println!("===============");
    println!();
    println!("Store:              {}", path.display());
    println!("Users:              {}", stats.total_users);
    println!("Accounts:           {}", stats.total_accounts);
    println!("Logger users:       {}", stats.active_logger_users);
    println!("Forwards:           {}", stats.total_forwards);
    println!("Failed:             {}", stats.total_failed);
    println!("Send attempts:      {}", stats.total_broadcasts);
    println!("Running broadcasts: {}", stats.running_broadcasts);

    let running = store.running_users().await;
    if !running.is_empty() {
        println!();
        println!("Running");
        println!("-------");
        for user_id in running {
            let state = store.broadcast_state(user_id).await;
            let since = state
                .started_at
                .map(format_ist)
                .unwrap_or_else(|| "-".to_string());
            let paused = if state.paused { " (paused)" } else { "" };
            println!("  {} since {}{}", user_id, since, paused);
        }
    }
    Ok(())
}
