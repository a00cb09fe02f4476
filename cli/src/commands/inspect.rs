//! `a3s-ctr inspect` command: a container's state record as JSON.

use a3s_ctr_core::config::RuntimeConfig;
use a3s_ctr_core::error::Result;
use clap::Args;

use super::open_manager;

#[derive(Args)]
pub struct InspectArgs {
    /// Container name or ID
    pub container: String,
}

pub async fn execute(args: InspectArgs, config: &RuntimeConfig) -> Result<i32> {
    let manager = open_manager(config)?;
    let state = manager.inspect(&args.container)?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(0)
}
