//! `a3s-ctr rm` command: remove containers and everything they own.

use a3s_ctr_core::config::RuntimeConfig;
use a3s_ctr_core::error::Result;
use clap::Args;

use super::{report_target, open_manager};

#[derive(Args)]
pub struct RmArgs {
    /// Container name(s) or ID(s)
    #[arg(required = true)]
    pub containers: Vec<String>,

    /// Stop running containers before removing them
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: RmArgs, config: &RuntimeConfig) -> Result<i32> {
    let manager = open_manager(config)?;

    let mut code = 0;
    for reference in &args.containers {
        let result = manager.remove(reference, args.force).await;
        code = code.max(report_target(reference, result.map(|_| ())));
    }
    Ok(code)
}
