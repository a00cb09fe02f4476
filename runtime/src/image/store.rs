//! On-disk image index.
//!
//! `<image_dir>/index.json` lists every image; each image's extracted
//! root lives at `<image_dir>/<id>/rootfs`. Index updates hold an
//! exclusive `flock` on `<image_dir>/index.lock` for the whole
//! read-modify-write and land through a temp file and rename.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use a3s_ctr_core::error::{CtrError, Result};
use chrono::{DateTime, Utc};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};

use super::manifest::ImageConfig;
use super::reference::ImageReference;

const INDEX_FILE: &str = "index.json";
const LOCK_FILE: &str = "index.lock";
const PARTIAL_SUFFIX: &str = ".partial";

/// A locally stored image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// Content-derived ID, independent of tags.
    pub id: String,
    /// `repo:tag` strings pointing at this image.
    #[serde(default)]
    pub repo_tags: Vec<String>,
    pub created: DateTime<Utc>,
    /// Bytes on disk under the extracted root.
    pub size: u64,
    /// Layer digests in application order.
    #[serde(default)]
    pub layers: Vec<String>,
    #[serde(default)]
    pub config: ImageConfig,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub rootfs_path: PathBuf,
}

impl Image {
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.repo_tags.iter().any(|t| t == tag)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ImageIndex {
    #[serde(default)]
    images: Vec<Image>,
}

/// Canonical `repo:tag` form of a user-supplied tag or reference.
pub fn normalize_tag(reference: &str) -> String {
    ImageReference::parse(reference)
        .map(|r| r.repo_tag())
        .unwrap_or_else(|_| reference.to_string())
}

/// Image index rooted at one directory.
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(CtrError::io(format!(
            "failed to create image directory {}",
            dir.display()
        )))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<image_dir>/<id>`
    pub fn image_dir(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Staging directory used while a pull is in flight.
    pub fn partial_dir(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, PARTIAL_SUFFIX))
    }

    /// All indexed images, oldest first.
    pub fn list(&self) -> Result<Vec<Image>> {
        let mut images = self.read_index()?.images;
        images.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(images)
    }

    /// Look up by exact ID, repo tag, or unique ID prefix (in that order).
    pub fn find(&self, reference: &str) -> Result<Option<Image>> {
        let index = self.read_index()?;
        let pos = match_reference(&index.images, reference)?;
        Ok(pos.map(|i| index.images[i].clone()))
    }

    pub fn get(&self, reference: &str) -> Result<Image> {
        self.find(reference)?
            .ok_or_else(|| CtrError::not_found("image", reference))
    }

    /// Insert or merge an image record.
    ///
    /// An existing record with the same ID gains the new tags. Tags move:
    /// any other image carrying one of them loses it.
    pub fn put(&self, image: Image) -> Result<Image> {
        self.with_index(|index| {
            for other in index.images.iter_mut().filter(|i| i.id != image.id) {
                other.repo_tags.retain(|t| !image.has_tag(t));
            }

            let stored = match index.images.iter_mut().find(|i| i.id == image.id) {
                Some(existing) => {
                    for tag in &image.repo_tags {
                        if !existing.has_tag(tag) {
                            existing.repo_tags.push(tag.clone());
                        }
                    }
                    existing.clone()
                }
                None => {
                    index.images.push(image.clone());
                    image
                }
            };
            Ok(stored)
        })
    }

    /// Add `target` as a tag of the image `source` resolves to.
    pub fn add_tag(&self, source: &str, target: &str) -> Result<Image> {
        let target_ref = ImageReference::parse(target)?;
        if target_ref.digest.is_some() && target_ref.tag.is_none() {
            return Err(CtrError::Validation(format!(
                "cannot tag with a digest reference '{}'",
                target
            )));
        }
        let tag = target_ref.repo_tag();

        self.with_index(|index| {
            let pos = match_reference(&index.images, source)?
                .ok_or_else(|| CtrError::not_found("image", source))?;
            if index.images.iter().any(|i| i.has_tag(&tag)) {
                return Err(CtrError::Conflict(format!("tag '{}' already exists", tag)));
            }
            let image = &mut index.images[pos];
            image.repo_tags.push(tag);
            Ok(image.clone())
        })
    }

    /// Drop the record `reference` resolves to and delete its directory.
    pub fn remove(&self, reference: &str) -> Result<Image> {
        let removed = self.with_index(|index| {
            let pos = match_reference(&index.images, reference)?
                .ok_or_else(|| CtrError::not_found("image", reference))?;
            Ok(index.images.remove(pos))
        })?;

        let dir = self.image_dir(&removed.id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(CtrError::io(format!(
                "failed to remove image directory {}",
                dir.display()
            )))?;
        }
        Ok(removed)
    }

    /// Delete directories under the image dir that no record references,
    /// including abandoned `*.partial` pulls. Returns what was removed.
    pub fn gc(&self) -> Result<Vec<PathBuf>> {
        let _lock = self.lock()?;
        let index = self.read_index()?;
        let mut removed = Vec::new();

        let entries = std::fs::read_dir(&self.dir)
            .map_err(CtrError::io(format!("failed to read {}", self.dir.display())))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if index.images.iter().any(|i| i.id == name) {
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "Removed unreferenced image directory");
                    removed.push(path);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove image directory");
                }
            }
        }
        removed.sort();
        Ok(removed)
    }

    fn lock(&self) -> Result<Flock<File>> {
        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(CtrError::io(format!("failed to open {}", path.display())))?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| CtrError::Io {
            context: format!("failed to lock {}", path.display()),
            source: std::io::Error::from(errno),
        })
    }

    fn with_index<T>(&self, f: impl FnOnce(&mut ImageIndex) -> Result<T>) -> Result<T> {
        let _lock = self.lock()?;
        let mut index = self.read_index()?;
        let out = f(&mut index)?;
        self.write_index(&index)?;
        Ok(out)
    }

    fn read_index(&self) -> Result<ImageIndex> {
        let path = self.dir.join(INDEX_FILE);
        match std::fs::read_to_string(&path) {
            Ok(data) if data.trim().is_empty() => Ok(ImageIndex::default()),
            Ok(data) => serde_json::from_str(&data).map_err(|e| {
                CtrError::SerializationError(format!("corrupt image index {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ImageIndex::default()),
            Err(e) => Err(CtrError::Io {
                context: format!("failed to read {}", path.display()),
                source: e,
            }),
        }
    }

    fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let path = self.dir.join(INDEX_FILE);
        let tmp = self.dir.join(format!("{}.tmp", INDEX_FILE));
        let data = serde_json::to_vec_pretty(index)?;
        std::fs::write(&tmp, data)
            .map_err(CtrError::io(format!("failed to write {}", tmp.display())))?;
        std::fs::rename(&tmp, &path)
            .map_err(CtrError::io(format!("failed to replace {}", path.display())))?;
        Ok(())
    }
}

fn match_reference(images: &[Image], reference: &str) -> Result<Option<usize>> {
    if reference.is_empty() {
        return Ok(None);
    }
    if let Some(pos) = images.iter().position(|i| i.id == reference) {
        return Ok(Some(pos));
    }

    let tag = normalize_tag(reference);
    if let Some(pos) = images
        .iter()
        .position(|i| i.has_tag(&tag) || i.has_tag(reference))
    {
        return Ok(Some(pos));
    }

    if !reference.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(None);
    }
    let matches: Vec<usize> = images
        .iter()
        .enumerate()
        .filter(|(_, i)| i.id.starts_with(reference))
        .map(|(pos, _)| pos)
        .collect();
    match matches.len() {
        0 => Ok(None),
        1 => Ok(Some(matches[0])),
        _ => {
            let mut ids: Vec<String> = matches.iter().map(|&p| images[p].id.clone()).collect();
            ids.sort();
            Err(CtrError::AmbiguousReference {
                reference: reference.to_string(),
                matches: ids,
            })
        }
    }
}
