//! `a3s-ctr pull` command.

use a3s_ctr_core::config::RuntimeConfig;
use a3s_ctr_core::error::Result;
use clap::Args;

use super::open_images;
use crate::output;

#[derive(Args)]
pub struct PullArgs {
    /// Image reference (e.g., "alpine:latest", "ghcr.io/org/image:tag")
    pub image: String,

    /// Pull again even if the image is already present
    #[arg(short, long)]
    pub force: bool,

    /// Only print the image ID
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PullArgs, config: &RuntimeConfig) -> Result<i32> {
    let images = open_images(config)?;

    if !args.quiet {
        println!("Pulling {}...", args.image);
    }
    let image = images.pull(&args.image, args.force).await?;

    if args.quiet {
        println!("{}", image.id);
    } else {
        println!(
            "Pulled: {} ({}, {} layers, {})",
            args.image,
            image.short_id(),
            image.layers.len(),
            output::format_bytes(image.size)
        );
    }
    Ok(0)
}
