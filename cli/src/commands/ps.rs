//! `a3s-ctr ps` command: list containers.

use a3s_ctr_core::config::RuntimeConfig;
use a3s_ctr_core::container::{ContainerState, ContainerStatus};
use a3s_ctr_core::error::Result;
use clap::Args;

use super::open_manager;
use crate::output;

#[derive(Args)]
pub struct PsArgs {
    /// Show all containers (default shows only running)
    #[arg(short, long)]
    pub all: bool,

    /// Only display container IDs
    #[arg(short, long)]
    pub quiet: bool,

    /// Filter containers (status=, name=, ancestor=, id=), can be repeated
    #[arg(short, long = "filter")]
    pub filters: Vec<String>,
}

pub async fn execute(args: PsArgs, config: &RuntimeConfig) -> Result<i32> {
    let manager = open_manager(config)?;
    let containers: Vec<ContainerState> = manager
        .list(args.all)?
        .into_iter()
        .filter(|c| matches_filters(c, &args.filters))
        .collect();

    if args.quiet {
        for c in &containers {
            println!("{}", c.short_id());
        }
        return Ok(0);
    }

    let mut table = output::new_table(&[
        "CONTAINER ID",
        "IMAGE",
        "COMMAND",
        "CREATED",
        "STATUS",
        "PORTS",
        "NAMES",
    ]);
    for c in &containers {
        let ports: Vec<String> = c.port_mappings.iter().map(|p| p.to_string()).collect();
        table.add_row([
            c.short_id().to_string(),
            c.image.clone(),
            output::format_command(&c.command, &c.args, 24),
            output::format_ago(&c.created),
            format_status(c),
            ports.join(", "),
            c.name.clone(),
        ]);
    }
    println!("{table}");
    Ok(0)
}

/// Status column, e.g. `Exited (3) 2 minutes ago`.
fn format_status(c: &ContainerState) -> String {
    match c.status {
        ContainerStatus::Running => match &c.started {
            Some(started) => format!("Up (started {})", output::format_ago(started)),
            None => "Up".to_string(),
        },
        ContainerStatus::Exited | ContainerStatus::Stopped => match &c.finished {
            Some(finished) => format!(
                "{} ({}) {}",
                capitalize(c.status.as_str()),
                c.exit_code,
                output::format_ago(finished)
            ),
            None => format!("{} ({})", capitalize(c.status.as_str()), c.exit_code),
        },
        ContainerStatus::Created => "Created".to_string(),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Supported filters:
/// - `status=<value>`: exact status
/// - `name=<value>`: name substring
/// - `ancestor=<value>`: image substring
/// - `id=<value>`: ID prefix
///
/// Unknown keys are ignored.
fn matches_filters(c: &ContainerState, filters: &[String]) -> bool {
    filters.iter().all(|filter| {
        let Some((key, value)) = filter.split_once('=') else {
            return true;
        };
        match key {
            "status" => c.status.as_str() == value,
            "name" => c.name.contains(value),
            "ancestor" => c.image.contains(value),
            "id" => c.id.starts_with(value),
            _ => true,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, status: ContainerStatus) -> ContainerState {
        let mut state = ContainerState::new(
            "0123456789abcdef0123456789abcdef",
            name,
            "alpine:latest",
            "/bin/sh",
            "/tmp/rootfs",
        );
        state.status = status;
        state
    }

    #[test]
    fn test_filters() {
        let c = record("my_web", ContainerStatus::Running);
        assert!(matches_filters(&c, &[]));
        assert!(matches_filters(&c, &["status=running".to_string()]));
        assert!(!matches_filters(&c, &["status=exited".to_string()]));
        assert!(matches_filters(&c, &["name=web".to_string()]));
        assert!(matches_filters(&c, &["ancestor=alpine".to_string()]));
        assert!(!matches_filters(&c, &["ancestor=ubuntu".to_string()]));
        assert!(matches_filters(&c, &["id=0123".to_string()]));
        assert!(matches_filters(&c, &["unknown=x".to_string(), "noequals".to_string()]));
        assert!(!matches_filters(
            &c,
            &["status=running".to_string(), "name=db".to_string()]
        ));
    }

    #[test]
    fn test_format_status() {
        let mut c = record("a", ContainerStatus::Exited);
        c.exit_code = 3;
        assert_eq!(format_status(&c), "Exited (3)");
        c.finished = Some(chrono::Utc::now());
        assert!(format_status(&c).starts_with("Exited (3) "));

        assert_eq!(format_status(&record("b", ContainerStatus::Created)), "Created");
        assert_eq!(format_status(&record("c", ContainerStatus::Running)), "Up");
    }
}
