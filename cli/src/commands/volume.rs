//! `a3s-ctr volume` subcommands: manage named volumes.
//!
//! Named volumes live under the volume directory and are bound into
//! containers with `-v NAME:/path`; `run` creates missing ones on demand.

use std::collections::HashMap;

use a3s_ctr_core::config::RuntimeConfig;
use a3s_ctr_core::error::{CtrError, Result};
use clap::{Args, Subcommand};

use super::{open_volumes, report_target};
use crate::output;

/// Manage volumes.
#[derive(Args)]
pub struct VolumeArgs {
    #[command(subcommand)]
    pub command: VolumeCommand,
}

/// Volume subcommands.
#[derive(Subcommand)]
pub enum VolumeCommand {
    /// Create a new named volume
    Create(CreateArgs),
    /// List volumes
    Ls(LsArgs),
    /// Remove one or more volumes
    Rm(RmArgs),
    /// Display detailed volume information
    Inspect(InspectArgs),
    /// Remove all unused volumes
    Prune,
}

#[derive(Args)]
pub struct CreateArgs {
    /// Volume name
    pub name: String,

    /// Volume driver
    #[arg(long, default_value = "local")]
    pub driver: String,

    /// Set metadata labels (KEY=VALUE), can be repeated
    #[arg(short = 'l', long = "label")]
    pub labels: Vec<String>,
}

#[derive(Args)]
pub struct LsArgs {
    /// Only display volume names
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct RmArgs {
    /// Volume name(s) to remove
    #[arg(required = true)]
    pub names: Vec<String>,

    /// Remove even if in use
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Args)]
pub struct InspectArgs {
    /// Volume name
    pub name: String,
}

pub async fn execute(args: VolumeArgs, config: &RuntimeConfig) -> Result<i32> {
    let store = open_volumes(config);
    match args.command {
        VolumeCommand::Create(a) => {
            let labels = parse_labels(&a.labels)?;
            let volume = store.create(&a.name, Some(&a.driver), labels)?;
            println!("{}", volume.name);
            Ok(0)
        }
        VolumeCommand::Ls(a) => {
            let mut volumes = store.list()?;
            volumes.sort_by(|a, b| a.name.cmp(&b.name));

            if a.quiet {
                for vol in &volumes {
                    println!("{}", vol.name);
                }
                return Ok(0);
            }

            let mut table =
                output::new_table(&["DRIVER", "VOLUME NAME", "MOUNT POINT", "IN USE BY"]);
            for vol in &volumes {
                let in_use = if vol.in_use_by.is_empty() {
                    "-".to_string()
                } else {
                    format!("{} container(s)", vol.in_use_by.len())
                };
                table.add_row([
                    vol.driver.clone(),
                    vol.name.clone(),
                    vol.mount_point.clone(),
                    in_use,
                ]);
            }
            println!("{table}");
            Ok(0)
        }
        VolumeCommand::Rm(a) => {
            let mut code = 0;
            for name in &a.names {
                let result = store.remove(name, a.force).map(|_| ());
                code = code.max(report_target(name, result));
            }
            Ok(code)
        }
        VolumeCommand::Inspect(a) => {
            let volume = store
                .get(&a.name)?
                .ok_or_else(|| CtrError::not_found("volume", &a.name))?;
            println!("{}", serde_json::to_string_pretty(&volume)?);
            Ok(0)
        }
        VolumeCommand::Prune => {
            let pruned = store.prune()?;
            for name in &pruned {
                println!("{name}");
            }
            println!("Removed {} unused volume(s)", pruned.len());
            Ok(0)
        }
    }
}

fn parse_labels(labels: &[String]) -> Result<HashMap<String, String>> {
    labels
        .iter()
        .map(|label| {
            label
                .split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| {
                    CtrError::Validation(format!("invalid label (expected KEY=VALUE): {label}"))
                })
        })
        .collect()
}
