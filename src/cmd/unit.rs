//! `agentdock unit`: inspect or stop a compute unit.
//!
//! Both work without a running server: the unit is found by its
//! deterministic name.

use anyhow::Result;
use agentdock::backend::build_backend;
use agentdock::config::Config;

use super::super::UnitCommands;

pub async fn cmd_unit(config: &Config, command: UnitCommands) -> Result<()> {
    let backend = build_backend(config)?;
    match command {
        UnitCommands::Status { issue_id } => {
            let name = backend.unit_name(&issue_id);
            let running = backend.is_running(&issue_id).await?;
            println!(
                "{} ({}): {}",
                name,
                backend.kind(),
                if running { "running" } else { "not running" }
            );
        }
        UnitCommands::Stop { issue_id } => {
            let name = backend.unit_name(&issue_id);
            backend.stop(&issue_id).await?;
            println!("Stopped {}", name);
        }
    }
    Ok(())
}
