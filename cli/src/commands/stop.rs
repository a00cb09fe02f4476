//! `a3s-ctr stop` command: graceful stop of one or more containers.

use std::time::Duration;

use a3s_ctr_core::config::RuntimeConfig;
use a3s_ctr_core::error::Result;
use clap::Args;

use super::{report_target, open_manager};

#[derive(Args)]
pub struct StopArgs {
    /// Container name(s) or ID(s)
    #[arg(required = true)]
    pub containers: Vec<String>,

    /// Seconds to wait before force-killing (default: the configured stop timeout)
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,
}

pub async fn execute(args: StopArgs, config: &RuntimeConfig) -> Result<i32> {
    let manager = open_manager(config)?;
    let timeout = args.timeout.map(Duration::from_secs);

    let mut code = 0;
    for reference in &args.containers {
        let result = manager.stop(reference, timeout).await;
        code = code.max(report_target(reference, result.map(|_| ())));
    }
    Ok(code)
}
