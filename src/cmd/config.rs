//! `agentdock config`: show the effective configuration.

use std::path::Path;

use anyhow::Result;
use agentdock::config::Config;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}; using defaults", config_path.display());
            }
            println!("# Effective values (with env/CLI overrides)");
            println!();
            print!("{}", config.redacted_toml()?);
        }
        Some(ConfigCommands::Path) => {
            println!("{}", config_path.display());
        }
    }
    Ok(())
}
