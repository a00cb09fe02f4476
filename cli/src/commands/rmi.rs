//! `a3s-ctr rmi` command: remove one or more images.

use a3s_ctr_core::config::RuntimeConfig;
use a3s_ctr_core::error::Result;
use clap::Args;

use super::{open_images, report_target};

#[derive(Args)]
pub struct RmiArgs {
    /// Image references or IDs to remove
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Ignore images that do not exist
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: RmiArgs, config: &RuntimeConfig) -> Result<i32> {
    let images = open_images(config)?;

    let mut code = 0;
    for reference in &args.images {
        match images.remove(reference) {
            Err(e) if args.force && e.is_not_found() => continue,
            result => code = code.max(report_target(reference, result.map(|_| ()))),
        }
    }
    Ok(code)
}
