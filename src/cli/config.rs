//! Config check and key generation command handlers.

use anyhow::{bail, Context, Result};

use adcaster::config::validate::{validate_config, validate_values, DiagnosticLevel};
use adcaster::config::Config;
use adcaster::vault::Vault;

use super::ConfigAction;

/// Validate configuration file.
pub(crate) async fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Path => {
            println!("{}", Config::path().display());
        }
        ConfigAction::Check => {
            let config_path = Config::path();
            println!("Config file: {}", config_path.display());

            let mut diagnostics = Vec::new();
            if config_path.exists() {
                let content = std::fs::read_to_string(&config_path)
                    .context("Failed to read config file")?;
                let raw: serde_json::Value = match serde_json::from_str(&content) {
                    Ok(v) => v,
                    Err(e) => {
                        println!("[ERROR] Invalid JSON: {}", e);
                        return Ok(());
                    }
                };
                diagnostics.extend(validate_config(&raw));
            } else {
                println!("[OK] No config file found (using defaults and environment)");
            }

            let config = Config::load().context("Failed to load configuration")?;
            diagnostics.extend(validate_values(&config));
            for diag in &diagnostics {
                println!("{}", diag);
            }

            let errors = diagnostics
                .iter()
                .filter(|d| d.level == DiagnosticLevel::Error)
                .count();
            let warnings = diagnostics
                .iter()
                .filter(|d| d.level == DiagnosticLevel::Warn)
                .count();

            if errors == 0 && warnings == 0 {
                println!("\nConfiguration looks good!");
            } else {
                println!("\nFound {} error(s), {} warning(s)", errors, warnings);
            }
        }
    }
    Ok(())
}

/// Print a new vault key, optionally writing it to the key file.
pub(crate) fn cmd_keygen(write: bool) -> Result<()> {
    let key = Vault::generate_key_b64();
    if !write {
        println!("{}", key);
        return Ok(());
    }

    let config = Config::load().context("Failed to load configuration")?;
    let path = config.vault_key_path();
    if path.exists() {
        bail!(
            "{} already exists; sealed sessions would become unreadable",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, &key).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Vault key written to {}", path.display());
    Ok(())
}
