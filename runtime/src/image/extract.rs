//! Layer extraction.
//!
//! Unpacks tar (optionally gzip-compressed) layers into an image root.
//! Every entry is resolved lexically against the root first; an entry that
//! would land outside it aborts the extraction with `PathTraversal` before
//! anything is written for it. OCI whiteouts are applied instead of being
//! materialised.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use a3s_ctr_core::error::{CtrError, Result};
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Extract one layer stream into `root`. Returns the number of entries
/// materialised (whiteouts excluded).
pub fn extract_layer<R: Read>(reader: R, gzip: bool, root: &Path) -> Result<usize> {
    std::fs::create_dir_all(root).map_err(CtrError::io(format!(
        "failed to create extraction root {}",
        root.display()
    )))?;

    if gzip {
        unpack_entries(Archive::new(GzDecoder::new(reader)), root)
    } else {
        unpack_entries(Archive::new(reader), root)
    }
}

/// Extract a layer or archive file, detecting gzip by suffix or magic bytes.
pub fn extract_file(path: &Path, root: &Path) -> Result<usize> {
    let gzip = is_gzip_file(path)?;
    let file = File::open(path)
        .map_err(CtrError::io(format!("failed to open archive {}", path.display())))?;
    let count = extract_layer(BufReader::new(file), gzip, root)?;
    tracing::debug!(
        archive = %path.display(),
        target = %root.display(),
        entries = count,
        "Extracted archive"
    );
    Ok(count)
}

/// `.gz`/`.tgz` suffix, or the gzip magic bytes for unsuffixed files.
pub fn is_gzip_file(path: &Path) -> Result<bool> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.ends_with(".gz") || name.ends_with(".tgz") {
        return Ok(true);
    }
    if name.ends_with(".tar") {
        return Ok(false);
    }

    let mut magic = [0u8; 2];
    let mut file = File::open(path)
        .map_err(CtrError::io(format!("failed to open archive {}", path.display())))?;
    let read = file
        .read(&mut magic)
        .map_err(CtrError::io(format!("failed to read archive {}", path.display())))?;
    Ok(read == 2 && magic == [0x1f, 0x8b])
}

fn unpack_entries<R: Read>(mut archive: Archive<R>, root: &Path) -> Result<usize> {
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);

    let mut count = 0;
    let entries = archive
        .entries()
        .map_err(|e| CtrError::ImageError(format!("failed to read layer: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| CtrError::ImageError(format!("corrupt layer entry: {}", e)))?;
        let raw = entry
            .path()
            .map_err(|e| CtrError::ImageError(format!("invalid entry path: {}", e)))?
            .into_owned();

        let rel = resolve_within_root(&raw)?;
        if rel.components().count() != raw_normal_count(&raw) {
            // `a/../b` stays inside the root, but tar refuses `..` and
            // skipping it would leave the root different from the layer.
            return Err(CtrError::ImageError(format!(
                "layer entry {} contains parent directory components",
                raw.display()
            )));
        }
        if rel.as_os_str().is_empty() {
            continue;
        }

        // Anything below removes existing paths, so the parent must resolve
        // inside the root before it is touched.
        ensure_parent_within_root(root, &rel, &raw)?;

        let file_name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(target) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let parent = root.join(rel.parent().unwrap_or_else(|| Path::new("")));
            if file_name == OPAQUE_WHITEOUT {
                clear_directory(&parent)?;
            } else {
                remove_path(&parent.join(target))?;
            }
            continue;
        }

        replace_mismatched_type(&root.join(&rel), entry.header().entry_type())?;

        let unpacked = entry.unpack_in(root).map_err(|e| {
            CtrError::ImageError(format!("failed to extract {}: {}", raw.display(), e))
        })?;
        if !unpacked {
            return Err(CtrError::PathTraversal {
                entry: raw.display().to_string(),
            });
        }
        count += 1;
    }

    Ok(count)
}

/// Lexically resolve an entry path relative to the extraction root.
///
/// Leading `/` and `.` components are dropped. A `..` that would climb
/// above the root is a `PathTraversal` error.
pub fn resolve_within_root(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) => {
                return Err(CtrError::PathTraversal {
                    entry: path.display().to_string(),
                })
            }
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err(CtrError::PathTraversal {
                        entry: path.display().to_string(),
                    });
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Ok(out)
}

fn raw_normal_count(path: &Path) -> usize {
    path.components()
        .filter(|c| !matches!(c, Component::RootDir | Component::CurDir))
        .count()
}

/// Resolve the deepest existing ancestor of the entry's parent, following
/// symlinks, and require it to stay under the canonical root. A symlink in
/// the layer pointing outside the root is rejected before anything is
/// removed or written through it. Symlinks that stay inside the root
/// (`lib -> usr/lib`) are allowed.
fn ensure_parent_within_root(root: &Path, rel: &Path, raw: &Path) -> Result<()> {
    let canonical_root = root
        .canonicalize()
        .map_err(CtrError::io(format!("failed to resolve {}", root.display())))?;
    let parent = root.join(rel.parent().unwrap_or_else(|| Path::new("")));
    let resolved = parent.ancestors().find_map(|p| p.canonicalize().ok());
    match resolved {
        Some(resolved) if !resolved.starts_with(&canonical_root) => {
            Err(CtrError::PathTraversal {
                entry: raw.display().to_string(),
            })
        }
        _ => Ok(()),
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return Ok(()),
    };
    let result = if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    result.map_err(CtrError::io(format!("failed to apply whiteout {}", path.display())))
}

fn clear_directory(dir: &Path) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };
    for entry in entries {
        let entry = entry.map_err(CtrError::io(format!("failed to read {}", dir.display())))?;
        remove_path(&entry.path())?;
    }
    Ok(())
}

/// A later layer may turn a directory into a file or vice versa.
fn replace_mismatched_type(target: &Path, entry_type: EntryType) -> Result<()> {
    let meta = match std::fs::symlink_metadata(target) {
        Ok(meta) => meta,
        Err(_) => return Ok(()),
    };
    let existing_is_dir = meta.is_dir();
    let entry_is_dir = entry_type.is_dir();
    if existing_is_dir && !entry_is_dir {
        std::fs::remove_dir_all(target)
            .map_err(CtrError::io(format!("failed to replace {}", target.display())))?;
    } else if !existing_is_dir && entry_is_dir {
        std::fs::remove_file(target)
            .map_err(CtrError::io(format!("failed to replace {}", target.display())))?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tar::{Builder, EntryType, Header};

    pub enum Item<'a> {
        File(&'a str, &'a [u8]),
        Dir(&'a str),
        Symlink(&'a str, &'a str),
        /// Written with raw header bytes so `..` and absolute names survive.
        RawFile(&'a str, &'a [u8]),
    }

    pub fn tar_bytes(items: &[Item<'_>]) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        for item in items {
            match item {
                Item::File(name, content) => {
                    let mut header = Header::new_gnu();
                    header.set_size(content.len() as u64);
                    header.set_mode(0o644);
                    header.set_cksum();
                    builder.append_data(&mut header, name, *content).unwrap();
                }
                Item::Dir(name) => {
                    let mut header = Header::new_gnu();
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_cksum();
                    builder.append_data(&mut header, name, &[][..]).unwrap();
                }
                Item::Symlink(name, target) => {
                    let mut header = Header::new_gnu();
                    header.set_entry_type(EntryType::Symlink);
                    header.set_size(0);
                    header.set_mode(0o777);
                    builder.append_link(&mut header, name, target).unwrap();
                }
                Item::RawFile(name, content) => {
                    let mut header = Header::new_old();
                    let bytes = name.as_bytes();
                    header.as_old_mut().name[..bytes.len()].copy_from_slice(bytes);
                    header.set_entry_type(EntryType::Regular);
                    header.set_size(content.len() as u64);
                    header.set_mode(0o644);
                    header.set_cksum();
                    builder.append(&header, *content).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    pub fn gzip(bytes: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }
}
