//! Config command handlers

use std::path::PathBuf;

use anyhow::{Context, Result};

use tablesync_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "server_path": config.server_path(),
                    "auth_token_set": config.auth_token.is_some(),
                    "push_attachments": config.push_attachments,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:         {}", config.data_dir.display());
            println!("  server_path:      {}", config.server_path().display());
            println!(
                "  auth_token:       {}",
                if config.auth_token.is_some() { "(set)" } else { "(not set)" }
            );
            println!("  push_attachments: {}", config.push_attachments);
            println!(
                "  log_file:         {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: &str, value: &str, config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    let value = if value == "none" { "" } else { value };
    config.set(key, value)?;
    save(&config, config_path)?;

    let shown = if key == "auth_token" { "(hidden)" } else { value };
    output.success(&format!("Set {} = {}", key, shown));
    Ok(())
}

/// Store a credential for the server
pub fn auth(token: &str, config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    config.auth_token = Some(token.to_string());
    save(&config, config_path)?;

    output.success("Credential saved. Run 'tablesync sync' to use it.");
    Ok(())
}

/// Save to the CLI-specified path or default
fn save(config: &Config, config_path: Option<&PathBuf>) -> Result<()> {
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")
}
