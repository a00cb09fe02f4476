//! A3S Ctr CLI entry point.
//!
//! `a3s-ctr init` is the hidden second stage of namespace isolation. It is
//! dispatched before the async runtime exists because it forks and must
//! stay single-threaded.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use a3s_ctr_cli::commands::{dispatch, load_config, Cli};
use a3s_ctr_runtime::{run_init, INIT_MARKER};

fn main() {
    if std::env::args().nth(1).as_deref() == Some(INIT_MARKER) {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("warn"))
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
        std::process::exit(run_init());
    }

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(e.exit_code());
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter())),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    tracing::debug!(home = %config.home.display(), "Loaded configuration");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = match runtime.block_on(dispatch(cli.command, config)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}
