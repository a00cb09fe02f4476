//! Recursive tree copy that preserves mode bits.
//!
//! Files are always copied, never hardlinked, so a container can modify
//! its root without touching the image.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use a3s_ctr_core::error::{CtrError, Result};

/// Counters from one copy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopyStats {
    pub files: usize,
    pub dirs: usize,
    pub symlinks: usize,
    /// Sockets, fifos and device nodes are not copied.
    pub skipped: usize,
}

/// Copy `src` into `dst`, creating `dst` if needed.
///
/// Directory modes are applied after their contents so read-only
/// directories can still be populated. A symlink that cannot be recreated
/// is logged and skipped.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<CopyStats> {
    let meta = fs::symlink_metadata(src)
        .map_err(CtrError::io(format!("failed to stat {}", src.display())))?;
    if !meta.is_dir() {
        return Err(CtrError::Validation(format!(
            "copy source {} is not a directory",
            src.display()
        )));
    }
    let mut stats = CopyStats::default();
    copy_dir(src, dst, &mut stats)?;
    Ok(stats)
}

fn copy_dir(src: &Path, dst: &Path, stats: &mut CopyStats) -> Result<()> {
    fs::create_dir_all(dst).map_err(CtrError::io(format!("failed to create {}", dst.display())))?;
    // Owner-writable while filling.
    fs::set_permissions(dst, fs::Permissions::from_mode(0o755))
        .map_err(CtrError::io(format!("failed to chmod {}", dst.display())))?;

    let entries =
        fs::read_dir(src).map_err(CtrError::io(format!("failed to read {}", src.display())))?;
    for entry in entries {
        let entry = entry.map_err(CtrError::io(format!("failed to read {}", src.display())))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(CtrError::io(format!("failed to stat {}", from.display())))?;

        if file_type.is_dir() {
            copy_dir(&from, &to, stats)?;
        } else if file_type.is_symlink() {
            copy_symlink(&from, &to, stats);
        } else if file_type.is_file() {
            // fs::copy carries the permission bits over.
            fs::copy(&from, &to).map_err(CtrError::io(format!(
                "failed to copy {} to {}",
                from.display(),
                to.display()
            )))?;
            stats.files += 1;
        } else {
            tracing::debug!(path = %from.display(), "Skipping special file");
            stats.skipped += 1;
        }
    }

    let mode = fs::metadata(src)
        .map_err(CtrError::io(format!("failed to stat {}", src.display())))?
        .permissions()
        .mode();
    fs::set_permissions(dst, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(CtrError::io(format!("failed to chmod {}", dst.display())))?;
    stats.dirs += 1;
    Ok(())
}

fn copy_symlink(from: &Path, to: &Path, stats: &mut CopyStats) {
    let target = match fs::read_link(from) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(path = %from.display(), error = %e, "Failed to read symlink");
            stats.skipped += 1;
            return;
        }
    };
    if fs::symlink_metadata(to).is_ok() {
        let _ = fs::remove_file(to);
    }
    match std::os::unix::fs::symlink(&target, to) {
        Ok(()) => stats.symlinks += 1,
        Err(e) => {
            tracing::warn!(
                path = %to.display(),
                target = %target.display(),
                error = %e,
                "Failed to restore symlink"
            );
            stats.skipped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_preserves_content_modes_and_links() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::create_dir_all(src.join("etc/conf.d")).unwrap();
        fs::write(src.join("bin/tool"), b"#!/bin/sh\n").unwrap();
        fs::set_permissions(src.join("bin/tool"), fs::Permissions::from_mode(0o750)).unwrap();
        fs::write(src.join("etc/conf.d/a.conf"), b"a=1").unwrap();
        std::os::unix::fs::symlink("bin/tool", src.join("tool-link")).unwrap();
        std::os::unix::fs::symlink("/nonexistent/target", src.join("dangling")).unwrap();

        let dst = tmp.path().join("dst");
        let stats = copy_tree(&src, &dst).unwrap();

        assert_eq!(stats.files, 2);
        assert_eq!(stats.symlinks, 2);
        assert_eq!(stats.dirs, 4);
        assert_eq!(fs::read(dst.join("etc/conf.d/a.conf")).unwrap(), b"a=1");
        let mode = fs::metadata(dst.join("bin/tool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
        assert_eq!(fs::read_link(dst.join("tool-link")).unwrap(), Path::new("bin/tool"));
        assert_eq!(
            fs::read_link(dst.join("dangling")).unwrap(),
            Path::new("/nonexistent/target")
        );
    }

    #[test]
    fn test_copy_is_not_a_hardlink() {
        use std::os::unix::fs::MetadataExt;
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("f"), b"original").unwrap();

        let dst = tmp.path().join("dst");
        copy_tree(&src, &dst).unwrap();
        fs::write(dst.join("f"), b"changed").unwrap();

        assert_eq!(fs::read(src.join("f")).unwrap(), b"original");
        assert_ne!(
            fs::metadata(src.join("f")).unwrap().ino(),
            fs::metadata(dst.join("f")).unwrap().ino()
        );
    }

    #[test]
    fn test_readonly_directory_mode_restored() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("ro")).unwrap();
        fs::write(src.join("ro/file"), b"x").unwrap();
        fs::set_permissions(src.join("ro"), fs::Permissions::from_mode(0o555)).unwrap();

        let dst = tmp.path().join("dst");
        copy_tree(&src, &dst).unwrap();
        assert!(dst.join("ro/file").exists());
        let mode = fs::metadata(dst.join("ro")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o555);

        fs::set_permissions(src.join("ro"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::set_permissions(dst.join("ro"), fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_copy_missing_source() {
        let tmp = TempDir::new().unwrap();
        assert!(copy_tree(&tmp.path().join("missing"), &tmp.path().join("dst")).is_err());
    }
}
