//! `a3s-ctr tag` command: create a tag that refers to an existing image.

use a3s_ctr_core::config::RuntimeConfig;
use a3s_ctr_core::error::Result;
use clap::Args;

use super::open_images;

#[derive(Args)]
pub struct ImageTagArgs {
    /// Source image reference or ID
    pub source: String,

    /// Target reference (":latest" is added when no tag is given)
    pub target: String,
}

pub async fn execute(args: ImageTagArgs, config: &RuntimeConfig) -> Result<i32> {
    let images = open_images(config)?;
    let image = images.tag(&args.source, &args.target)?;
    println!("{} -> {}", args.target, image.short_id());
    Ok(0)
}
