//! Image distribution: registry pulls, archive imports and the local index.
//!
//! Images are staged under `<image_dir>/<id>.partial/` and renamed into
//! place only once every layer extracted cleanly, so the index never
//! points at a half-built root. Staging directories left behind by a
//! failed or interrupted pull are reclaimed by [`ImageDistributor::gc`].

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use a3s_ctr_core::config::RuntimeConfig;
use a3s_ctr_core::error::{CtrError, Result};
use a3s_ctr_core::id::image_id_from_digest;
use chrono::Utc;
use sha2::{Digest, Sha256};

use super::extract::{extract_file, extract_layer, is_gzip_file};
use super::manifest::{Descriptor, ImageConfig};
use super::reference::ImageReference;
use super::registry::RegistryClient;
use super::store::{normalize_tag, Image, ImageStore};

/// Pulls, imports and indexes images.
pub struct ImageDistributor {
    store: ImageStore,
    registry: RegistryClient,
}

impl ImageDistributor {
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        Ok(Self {
            store: ImageStore::new(&config.image_dir)?,
            registry: RegistryClient::new(&config.registry)?,
        })
    }

    pub fn with_parts(store: ImageStore, registry: RegistryClient) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    /// Pull an image, using the local copy when it is indexed and its root
    /// is present, unless `force` is set.
    pub async fn pull(&self, reference: &str, force: bool) -> Result<Image> {
        let parsed = ImageReference::parse(reference)?;
        let repo_tag = parsed.repo_tag();

        if !force {
            if let Some(image) = self.cached(&repo_tag)? {
                tracing::info!(reference = %parsed, id = %image.id, "Using cached image");
                return Ok(image);
            }
        }

        tracing::info!(reference = %parsed, "Pulling image from registry");
        let session = self.registry.session(&parsed).await?;
        let manifest = self
            .registry
            .resolve_manifest(&session, parsed.manifest_reference())
            .await?;
        let blob = self
            .registry
            .fetch_config(&session, &manifest.config.digest)
            .await?;
        let id = image_id_from_digest(&manifest.config.digest);

        if !force {
            if let Some(existing) = self.cached(&id)? {
                tracing::info!(reference = %parsed, id = %id, "Image content already present, adding tag");
                return self.store.put(Image {
                    repo_tags: vec![repo_tag],
                    ..existing
                });
            }
        }

        let staging = self.prepare_staging(&id)?;
        let staged_root = staging.join("rootfs");
        for (n, layer) in manifest.layers.iter().enumerate() {
            let blob_path = staging.join(format!("layer-{}.blob", n));
            let bytes = self
                .registry
                .download_blob(&session, &layer.digest, &blob_path)
                .await?;
            let gzip = layer_is_gzip(layer, &blob_path)?;
            let entries = extract_blob(blob_path.clone(), gzip, staged_root.clone()).await?;
            std::fs::remove_file(&blob_path)
                .map_err(CtrError::io(format!("failed to remove {}", blob_path.display())))?;
            tracing::debug!(
                digest = %layer.digest,
                bytes,
                entries,
                "Applied layer {}/{}",
                n + 1,
                manifest.layers.len()
            );
        }

        let mut metadata = HashMap::new();
        metadata.insert("source".to_string(), "registry".to_string());
        metadata.insert("reference".to_string(), parsed.full_reference());
        metadata.insert("digest".to_string(), manifest.config.digest.clone());
        if !blob.architecture.is_empty() {
            metadata.insert("architecture".to_string(), blob.architecture.clone());
        }
        if !blob.os.is_empty() {
            metadata.insert("os".to_string(), blob.os.clone());
        }

        let image = self.commit(
            &id,
            repo_tag,
            manifest.layers.iter().map(|l| l.digest.clone()).collect(),
            ImageConfig::from(blob),
            metadata,
        )?;
        tracing::info!(reference = %parsed, id = %image.id, size = image.size, "Pulled image");
        Ok(image)
    }

    /// Import a tar or tar.gz filesystem archive as `name:tag`.
    ///
    /// The ID derives from the archive bytes; importing identical bytes
    /// again only adds the tag.
    pub async fn create_from_archive(
        &self,
        archive: &Path,
        name: &str,
        tag: Option<&str>,
    ) -> Result<Image> {
        if !archive.is_file() {
            return Err(CtrError::not_found("archive", &archive.display().to_string()));
        }
        let reference = ImageReference::parse(&format!(
            "{}:{}",
            name,
            tag.filter(|t| !t.is_empty()).unwrap_or("latest")
        ))?;
        let repo_tag = reference.repo_tag();

        let digest = hash_file(archive)?;
        let id = image_id_from_digest(&digest);

        if let Some(existing) = self.cached(&id)? {
            tracing::info!(archive = %archive.display(), id = %id, "Archive already imported, adding tag");
            return self.store.put(Image {
                repo_tags: vec![repo_tag],
                ..existing
            });
        }

        let staging = self.prepare_staging(&id)?;
        let staged_root = staging.join("rootfs");
        let source = archive.to_path_buf();
        let target = staged_root.clone();
        tokio::task::spawn_blocking(move || extract_file(&source, &target))
            .await
            .map_err(|e| CtrError::ImageError(format!("archive extraction task failed: {}", e)))??;

        let mut metadata = HashMap::new();
        metadata.insert("source".to_string(), "tarball".to_string());
        metadata.insert(
            "original_path".to_string(),
            archive.display().to_string(),
        );

        let image = self.commit(
            &id,
            repo_tag,
            vec![digest],
            ImageConfig::archive_default(),
            metadata,
        )?;
        tracing::info!(archive = %archive.display(), id = %image.id, "Imported image");
        Ok(image)
    }

    pub fn get(&self, reference: &str) -> Result<Image> {
        self.store.get(reference)
    }

    pub fn list(&self) -> Result<Vec<Image>> {
        self.store.list()
    }

    /// Remove an image by ID, ID prefix or tag, deleting its root.
    pub fn remove(&self, reference: &str) -> Result<Image> {
        let image = self.store.remove(reference)?;
        tracing::info!(id = %image.id, tags = ?image.repo_tags, "Removed image");
        Ok(image)
    }

    /// Tag the image `source` resolves to as `target` (`:latest` if untagged).
    pub fn tag(&self, source: &str, target: &str) -> Result<Image> {
        self.store.add_tag(source, target)
    }

    /// Reclaim unindexed image directories.
    pub fn gc(&self) -> Result<Vec<PathBuf>> {
        self.store.gc()
    }

    /// Indexed image whose extracted root still exists.
    fn cached(&self, reference: &str) -> Result<Option<Image>> {
        Ok(self
            .store
            .find(reference)?
            .filter(|image| image.rootfs_path.is_dir()))
    }

    fn prepare_staging(&self, id: &str) -> Result<PathBuf> {
        let staging = self.store.partial_dir(id);
        if staging.exists() {
            std::fs::remove_dir_all(&staging).map_err(CtrError::io(format!(
                "failed to clear staging directory {}",
                staging.display()
            )))?;
        }
        std::fs::create_dir_all(staging.join("rootfs")).map_err(CtrError::io(format!(
            "failed to create staging directory {}",
            staging.display()
        )))?;
        Ok(staging)
    }

    /// Move the staged root into place and index it.
    fn commit(
        &self,
        id: &str,
        repo_tag: String,
        layers: Vec<String>,
        config: ImageConfig,
        metadata: HashMap<String, String>,
    ) -> Result<Image> {
        let staging = self.store.partial_dir(id);
        let final_dir = self.store.image_dir(id);
        if final_dir.exists() {
            std::fs::remove_dir_all(&final_dir).map_err(CtrError::io(format!(
                "failed to replace image directory {}",
                final_dir.display()
            )))?;
        }
        std::fs::rename(&staging, &final_dir).map_err(CtrError::io(format!(
            "failed to move {} into place",
            staging.display()
        )))?;

        let rootfs_path = final_dir.join("rootfs");
        self.store.put(Image {
            id: id.to_string(),
            repo_tags: vec![normalize_tag(&repo_tag)],
            created: Utc::now(),
            size: dir_size(&rootfs_path),
            layers,
            config,
            metadata,
            rootfs_path,
        })
    }
}

fn layer_is_gzip(layer: &Descriptor, blob: &Path) -> Result<bool> {
    if layer.media_type.ends_with("+zstd") {
        return Err(CtrError::ImageError(format!(
            "unsupported layer compression {} for {}",
            layer.media_type, layer.digest
        )));
    }
    Ok(layer.is_gzip() || is_gzip_file(blob)?)
}

async fn extract_blob(blob: PathBuf, gzip: bool, root: PathBuf) -> Result<usize> {
    tokio::task::spawn_blocking(move || {
        let file = File::open(&blob)
            .map_err(CtrError::io(format!("failed to open layer {}", blob.display())))?;
        extract_layer(BufReader::new(file), gzip, &root)
    })
    .await
    .map_err(|e| CtrError::ImageError(format!("layer extraction task failed: {}", e)))?
}

/// `sha256:<hex>` of a file's bytes.
fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).map_err(CtrError::io(format!("failed to open {}", path.display())))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(CtrError::io(format!("failed to hash {}", path.display())))?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Apparent size of a tree; symlinks count as their own length.
pub(crate) fn dir_size(path: &Path) -> u64 {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return 0;
    };
    if !meta.is_dir() {
        return meta.len();
    }
    std::fs::read_dir(path)
        .map(|entries| entries.flatten().map(|e| dir_size(&e.path())).sum())
        .unwrap_or(0)
}
