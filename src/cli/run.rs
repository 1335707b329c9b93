//! `run` and `dashboard` command handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use adcaster::bot::{build_bot, run_bot, BotContext};
use adcaster::broadcast::BroadcastSupervisor;
use adcaster::cache::GroupCache;
use adcaster::config::validate::{validate_values, DiagnosticLevel};
use adcaster::config::Config;
use adcaster::dashboard;
use adcaster::relay::logger_bot::{run_logger_bot, welcome_text, HealthMonitor};
use adcaster::relay::{DmSender, LogRelay, TeloxideSender};
use adcaster::store::{Store, StoreDefaults};
use adcaster::telegram::{BridgeClientFactory, ClientFactory};
use adcaster::vault::Vault;

/// Grace period for background tasks after the shutdown signal.
const SHUTDOWN_GRACE_SECS: u64 = 10;

fn load_checked_config() -> Result<Config> {
    let config = Config::load().with_context(|| "Failed to load configuration")?;
    let errors: Vec<_> = validate_values(&config)
        .into_iter()
        .filter(|d| d.level == DiagnosticLevel::Error)
        .collect();
    if !errors.is_empty() {
        for diag in &errors {
            eprintln!("{}", diag);
        }
        bail!("configuration has {} error(s); see `adcaster config check`", errors.len());
    }
    Ok(config)
}

async fn open_store(config: &Config) -> Result<Store> {
    let path = config.store_path();
    let store = Store::open_with_retry(&config.store, &path)
        .await
        .with_context(|| format!("Failed to open store {}", path.display()))?;
    Ok(store
        .with_defaults(StoreDefaults::from(&config.broadcast))
        .with_flush_interval(Duration::from_millis(config.store.flush_interval_ms)))
}

/// Run both bots, the logger health monitor and optionally the dashboard.
pub(crate) async fn cmd_run(force_dashboard: bool) -> Result<()> {
    let config = Arc::new(load_checked_config()?);
    let store = open_store(&config).await?;
    let vault = Arc::new(Vault::from_config(&config.vault).context("Failed to load vault key")?);

    let main_bot = build_bot(&config.bot.token)?;
    let logger_bot = build_bot(&config.logger_bot.token)?;
    let main_sender: Arc<dyn DmSender> = Arc::new(TeloxideSender::new(main_bot.clone()));
    let relay = LogRelay::new(store.clone(), Arc::new(TeloxideSender::new(logger_bot.clone())))
        .with_fallback(main_sender, &config.logger_bot.username);

    let factory: Arc<dyn ClientFactory> = Arc::new(BridgeClientFactory::new(&config.bridge)?);
    let supervisor = BroadcastSupervisor::new(
        store.clone(),
        vault.clone(),
        factory.clone(),
        relay.clone(),
        &config,
    );
    let cleared = supervisor.reset_stale_states().await?;
    if cleared > 0 {
        warn!(cleared, "Cleared broadcast flags left over from a previous run");
    }

    let ctx = BotContext {
        config: config.clone(),
        store: store.clone(),
        vault: vault.clone(),
        factory: factory.clone(),
        cache: GroupCache::new(store.clone(), vault, factory),
        supervisor: supervisor.clone(),
    };

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();
    tasks.push(store.spawn_flusher(shutdown.clone()));

    tasks.push(tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = run_bot(main_bot, ctx, shutdown).await {
                error!("Main bot stopped: {}", e);
            }
        }
    }));
    tasks.push(tokio::spawn(run_logger_bot(
        logger_bot,
        store.clone(),
        relay.clone(),
        welcome_text(&config.bot.username, &config.bot.name),
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(
        HealthMonitor::new(relay, &config.logger_bot).run(shutdown.clone()),
    ));
    if config.dashboard.enabled || force_dashboard {
        let (config, store, shutdown) = (config.clone(), store.clone(), shutdown.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = dashboard::serve(config, store, shutdown).await {
                error!("Dashboard stopped: {}", e);
            }
        }));
    }

    println!("adcaster running as @{}. Press Ctrl+C to stop.", config.bot.username);
    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Failed to listen for Ctrl+C")?;

    println!();
    println!("Shutting down...");
    supervisor.stop_all().await;
    shutdown.cancel();

    let grace = Duration::from_secs(SHUTDOWN_GRACE_SECS);
    if tokio::time::timeout(grace, futures::future::join_all(tasks))
        .await
        .is_err()
    {
        warn!("Background tasks did not stop within {}s", SHUTDOWN_GRACE_SECS);
    }
    store.flush().await.context("Failed to write the store on shutdown")?;
    info!("Shutdown complete");
    Ok(())
}

/// Serve only the dashboard, reading the shared store file.
pub(crate) async fn cmd_dashboard() -> Result<()> {
    let config = Arc::new(Config::load().with_context(|| "Failed to load configuration")?);
    if config.bot.token.is_empty() {
        bail!("bot.token is required to verify dashboard logins");
    }
    let store = open_store(&config).await?;
    let shutdown = CancellationToken::new();
    let flusher = store.spawn_flusher(shutdown.clone());

    let server = tokio::spawn(dashboard::serve(config, store.clone(), shutdown.clone()));
    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Failed to listen for Ctrl+C")?;
    shutdown.cancel();
    server.await??;
    flusher.await?;
    store.flush().await.context("Failed to write the store on shutdown")?;
    Ok(())
}
