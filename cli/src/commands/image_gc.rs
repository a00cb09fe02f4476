//! `a3s-ctr image-gc` command: delete unindexed image directories.
//!
//! Interrupted pulls leave `*.partial` directories behind; removed index
//! entries may leave their roots. Neither is reachable by any reference.

use a3s_ctr_core::config::RuntimeConfig;
use a3s_ctr_core::error::Result;
use clap::Args;

use super::open_images;

#[derive(Args)]
pub struct ImageGcArgs {
    /// Only print the number of removed directories
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: ImageGcArgs, config: &RuntimeConfig) -> Result<i32> {
    let images = open_images(config)?;
    let removed = images.gc()?;

    if args.quiet {
        println!("{}", removed.len());
        return Ok(0);
    }
    for path in &removed {
        println!("Deleted: {}", path.display());
    }
    let noun = if removed.len() == 1 {
        "directory"
    } else {
        "directories"
    };
    println!("Removed {} unreferenced image {noun}", removed.len());
    Ok(0)
}
