//! `a3s-ctr logs` command: print a container's stored output.

use a3s_ctr_core::config::RuntimeConfig;
use a3s_ctr_core::error::Result;
use a3s_ctr_runtime::{LogLine, LogStream};
use chrono::SecondsFormat;
use clap::Args;

use super::open_manager;

#[derive(Args)]
pub struct LogsArgs {
    /// Container name or ID
    pub container: String,

    /// Number of lines to show from the end of the logs
    #[arg(long, value_name = "N")]
    pub tail: Option<usize>,

    /// Show the timestamp recorded with each line
    #[arg(short, long)]
    pub timestamps: bool,
}

pub async fn execute(args: LogsArgs, config: &RuntimeConfig) -> Result<i32> {
    let manager = open_manager(config)?;
    for line in manager.logs(&args.container, args.tail)? {
        let text = render(&line, args.timestamps);
        match line.stream {
            LogStream::Stdout => println!("{text}"),
            LogStream::Stderr => eprintln!("{text}"),
        }
    }
    Ok(0)
}

fn render(line: &LogLine, timestamps: bool) -> String {
    match (timestamps, &line.timestamp) {
        (true, Some(ts)) => format!(
            "{} {}",
            ts.to_rfc3339_opts(SecondsFormat::Nanos, true),
            line.content
        ),
        _ => line.content.clone(),
    }
}
