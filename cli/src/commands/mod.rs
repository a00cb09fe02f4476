//! CLI command definitions and dispatch.

mod image_gc;
mod image_tag;
mod images;
mod import;
mod inspect;
mod logs;
mod ps;
mod pull;
mod rm;
mod rmi;
mod run;
mod stats;
mod stop;
mod volume;

use std::path::{Path, PathBuf};

use a3s_ctr_core::config::RuntimeConfig;
use a3s_ctr_core::error::Result;
use a3s_ctr_runtime::{ContainerManager, ImageDistributor, VolumeStore};
use clap::{Parser, Subcommand};

/// A3S Ctr: a small Linux container engine.
#[derive(Parser)]
#[command(name = "a3s-ctr", version, about)]
pub struct Cli {
    /// Configuration file (defaults to $A3S_CTR_CONFIG, then <home>/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Create and start a container from an image
    Run(run::RunArgs),
    /// List containers
    Ps(ps::PsArgs),
    /// Stop one or more running containers
    Stop(stop::StopArgs),
    /// Remove one or more containers
    Rm(rm::RmArgs),
    /// Display a container's state as JSON
    Inspect(inspect::InspectArgs),
    /// Fetch the stored output of a container
    Logs(logs::LogsArgs),
    /// Display resource usage counters
    Stats(stats::StatsArgs),
    /// Pull an image from a registry
    Pull(pull::PullArgs),
    /// List local images
    Images(images::ImagesArgs),
    /// Import a filesystem archive as an image
    Import(import::ImportArgs),
    /// Create a tag that refers to an existing image
    Tag(image_tag::ImageTagArgs),
    /// Remove one or more images
    Rmi(rmi::RmiArgs),
    /// Delete image directories no longer referenced by the index
    ImageGc(image_gc::ImageGcArgs),
    /// Manage named volumes
    Volume(volume::VolumeArgs),
}

/// Resolve the configuration: an explicit file wins over the environment.
pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::load(path),
        None => RuntimeConfig::from_env(),
    }
}

pub(crate) fn open_images(config: &RuntimeConfig) -> Result<ImageDistributor> {
    ImageDistributor::new(config)
}

pub(crate) fn open_volumes(config: &RuntimeConfig) -> VolumeStore {
    VolumeStore::in_dir(&config.volume_dir)
}

pub(crate) fn open_manager(config: &RuntimeConfig) -> Result<ContainerManager> {
    ContainerManager::new(config.clone())
}

/// Print the outcome for one target of a multi-target command and return
/// its exit code. Successes echo the reference, failures go to stderr.
pub(crate) fn report_target(reference: &str, result: Result<()>) -> i32 {
    match result {
        Ok(()) => {
            println!("{reference}");
            0
        }
        Err(e) => {
            eprintln!("Error: {reference}: {e}");
            e.exit_code()
        }
    }
}

/// Run a parsed command. Returns the process exit code.
pub async fn dispatch(command: Command, config: RuntimeConfig) -> Result<i32> {
    match command {
        Command::Run(args) => run::execute(args, &config).await,
        Command::Ps(args) => ps::execute(args, &config).await,
        Command::Stop(args) => stop::execute(args, &config).await,
        Command::Rm(args) => rm::execute(args, &config).await,
        Command::Inspect(args) => inspect::execute(args, &config).await,
        Command::Logs(args) => logs::execute(args, &config).await,
        Command::Stats(args) => stats::execute(args, &config).await,
        Command::Pull(args) => pull::execute(args, &config).await,
        Command::Images(args) => images::execute(args, &config).await,
        Command::Import(args) => import::execute(args, &config).await,
        Command::Tag(args) => image_tag::execute(args, &config).await,
        Command::Rmi(args) => rmi::execute(args, &config).await,
        Command::ImageGc(args) => image_gc::execute(args, &config).await,
        Command::Volume(args) => volume::execute(args, &config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_trailing_command() {
        let cli = Cli::try_parse_from([
            "a3s-ctr", "run", "-d", "--name", "web", "-e", "A=1", "-m", "64m", "alpine",
            "sh", "-c", "echo hi",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.detach);
        assert_eq!(args.name.as_deref(), Some("web"));
        assert_eq!(args.image, "alpine");
        assert_eq!(args.command, vec!["sh", "-c", "echo hi"]);
    }

    #[test]
    fn test_parse_volume_subcommand() {
        let cli = Cli::try_parse_from(["a3s-ctr", "volume", "rm", "-f", "a", "b"]).unwrap();
        assert!(matches!(cli.command, Command::Volume(_)));
    }

    #[test]
    fn test_report_target_exit_codes() {
        use a3s_ctr_core::error::CtrError;

        assert_eq!(report_target("web", Ok(())), 0);
        assert_eq!(
            report_target("web", Err(CtrError::not_found("container", "web"))),
            2
        );
        assert_eq!(report_target("web", Err(CtrError::Other("boom".into()))), 1);
    }

    #[test]
    fn test_load_config_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, format!("home: {}\nstop_timeout_secs: 3\n", tmp.path().display()))
            .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.stop_timeout_secs, 3);
        assert_eq!(config.image_dir, tmp.path().join("images"));
    }
}
