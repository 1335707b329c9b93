//! Command parsing and dispatch. `main.rs` calls `cli::run()`.

pub mod config;
pub mod run;
pub mod status;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "adcaster")]
#[command(version)]
#[command(about = "Multi-tenant Telegram ad broadcaster", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the main bot, the logger bot and (if enabled) the dashboard
    Run {
        /// Serve the dashboard even when `dashboard.enabled` is false
        #[arg(long)]
        dashboard: bool,
    },
    /// Serve only the web dashboard
    Dashboard,
    /// Print a fresh vault key
    Keygen {
        /// Write the key to the configured key file (refuses to overwrite)
        #[arg(long)]
        write: bool,
    },
    /// Validate configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show stored statistics and running broadcasts
    Status,
    /// Show version information
    Version,
}

#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Check the config file and resolved values for problems
    Check,
    /// Print the path of the config file
    Path,
}

pub async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Load config early so we can respect the logging settings; fall back to
    // defaults if the config file is missing or unreadable.
    let logging_cfg = adcaster::config::Config::load()
        .map(|c| c.logging)
        .unwrap_or_default();
    if let Err(e) = adcaster::utils::logging::init_logging(&logging_cfg) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let cli = Cli::parse();

    match cli.command {
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            println!();
        }
        Some(Commands::Run { dashboard }) => {
            run::cmd_run(dashboard).await?;
        }
        Some(Commands::Dashboard) => {
            run::cmd_dashboard().await?;
        }
        Some(Commands::Keygen { write }) => {
            config::cmd_keygen(write)?;
        }
        Some(Commands::Config { action }) => {
            config::cmd_config(action).await?;
        }
        Some(Commands::Status) => {
            status::cmd_status().await?;
        }
        Some(Commands::Version) => {
            println!("adcaster {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
