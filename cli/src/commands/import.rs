//! `a3s-ctr import` command: register a filesystem archive as an image.

use std::path::PathBuf;

use a3s_ctr_core::config::RuntimeConfig;
use a3s_ctr_core::error::Result;
use clap::Args;

use super::open_images;

#[derive(Args)]
pub struct ImportArgs {
    /// Archive file (.tar, .tar.gz or .tgz)
    pub file: PathBuf,

    /// Image name, optionally with a tag (NAME[:TAG])
    pub name: String,
}

pub async fn execute(args: ImportArgs, config: &RuntimeConfig) -> Result<i32> {
    let images = open_images(config)?;
    let (name, tag) = split_name_tag(&args.name);
    let image = images.create_from_archive(&args.file, name, tag).await?;
    println!("{}", image.id);
    Ok(0)
}

/// Split `NAME[:TAG]`, leaving registry ports (`host:5000/name`) alone.
fn split_name_tag(reference: &str) -> (&str, Option<&str>) {
    match reference.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') && !name.is_empty() => (name, Some(tag)),
        _ => (reference, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_name_tag() {
        assert_eq!(split_name_tag("demo"), ("demo", None));
        assert_eq!(split_name_tag("demo:v1"), ("demo", Some("v1")));
        assert_eq!(
            split_name_tag("localhost:5000/demo"),
            ("localhost:5000/demo", None)
        );
        assert_eq!(
            split_name_tag("localhost:5000/demo:v2"),
            ("localhost:5000/demo", Some("v2"))
        );
    }
}
