//! `a3s-ctr stats` command: cgroup usage counters.
//!
//! One snapshot per invocation. Counters come straight from the cgroup
//! files; hosts without cgroups show `-`.

use a3s_ctr_core::config::RuntimeConfig;
use a3s_ctr_core::error::Result;
use a3s_ctr_runtime::ContainerStats;
use clap::Args;

use super::open_manager;
use crate::output;

#[derive(Args)]
pub struct StatsArgs {
    /// Container name(s) or ID(s) (default: all running containers)
    pub containers: Vec<String>,
}

pub async fn execute(args: StatsArgs, config: &RuntimeConfig) -> Result<i32> {
    let manager = open_manager(config)?;

    let references: Vec<String> = if args.containers.is_empty() {
        manager.list(false)?.into_iter().map(|c| c.id).collect()
    } else {
        args.containers
    };

    let mut rows = Vec::with_capacity(references.len());
    for reference in &references {
        rows.push(StatsRow::new(&manager.stats(reference)?));
    }

    let mut table = output::new_table(&[
        "CONTAINER ID",
        "NAME",
        "STATUS",
        "MEM USAGE / LIMIT",
        "CPU TIME",
        "PIDS",
    ]);
    for row in rows {
        table.add_row([
            row.short_id,
            row.name,
            row.status,
            row.memory,
            row.cpu,
            row.pids,
        ]);
    }
    println!("{table}");
    Ok(0)
}

struct StatsRow {
    short_id: String,
    name: String,
    status: String,
    memory: String,
    cpu: String,
    pids: String,
}

impl StatsRow {
    fn new(stats: &ContainerStats) -> Self {
        let counter = |key: &str| stats.usage.get(key).and_then(|v| v.parse::<u64>().ok());

        let usage = counter("memory_usage")
            .map(output::format_bytes)
            .unwrap_or_else(|| "-".to_string());
        let limit = if stats.memory_limit.is_empty() {
            "unlimited"
        } else {
            stats.memory_limit.as_str()
        };

        Self {
            short_id: stats.id.chars().take(12).collect(),
            name: stats.name.clone(),
            status: stats.status.to_string(),
            memory: format!("{usage} / {limit}"),
            cpu: counter("cpu_usage")
                .map(format_cpu_nanos)
                .unwrap_or_else(|| "-".to_string()),
            pids: counter("pids_current")
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// `cpuacct.usage` nanoseconds as seconds with millisecond precision.
fn format_cpu_nanos(nanos: u64) -> String {
    format!("{:.3}s", nanos as f64 / 1_000_000_000.0)
}
