//! `a3s-ctr images` command.

use a3s_ctr_core::config::RuntimeConfig;
use a3s_ctr_core::error::Result;
use a3s_ctr_runtime::Image;
use clap::Args;

use super::open_images;
use crate::output;

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show image IDs
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: ImagesArgs, config: &RuntimeConfig) -> Result<i32> {
    let images = open_images(config)?;
    let mut list = images.list()?;
    list.sort_by(|a, b| b.created.cmp(&a.created));

    if args.quiet {
        for image in &list {
            println!("{}", image.short_id());
        }
        return Ok(0);
    }

    let mut table = output::new_table(&["REPOSITORY", "TAG", "IMAGE ID", "CREATED", "SIZE"]);
    for row in list.iter().flat_map(ImageRow::for_image) {
        table.add_row([row.repository, row.tag, row.id, row.created, row.size]);
    }
    println!("{table}");
    Ok(0)
}

/// One display row per repo tag; untagged images get a single `<none>` row.
struct ImageRow {
    repository: String,
    tag: String,
    id: String,
    created: String,
    size: String,
}

impl ImageRow {
    fn for_image(image: &Image) -> Vec<Self> {
        let row = |repository: &str, tag: &str| Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            id: image.short_id().to_string(),
            created: output::format_ago(&image.created),
            size: output::format_bytes(image.size),
        };

        if image.repo_tags.is_empty() {
            return vec![row("<none>", "<none>")];
        }
        image
            .repo_tags
            .iter()
            .map(|repo_tag| {
                let (repository, tag) = split_repo_tag(repo_tag);
                row(repository, tag)
            })
            .collect()
    }
}

/// `repo:tag` split at the last colon that follows the last slash.
fn split_repo_tag(repo_tag: &str) -> (&str, &str) {
    let name_start = repo_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
    match repo_tag[name_start..].rfind(':') {
        Some(i) => (&repo_tag[..name_start + i], &repo_tag[name_start + i + 1..]),
        None => (repo_tag, "<none>"),
    }
}
