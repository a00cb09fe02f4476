//! Persistent storage for named volumes.
//!
//! Volume records live in `<volume_dir>/volumes.json`; volume data lives
//! under `<volume_dir>/<name>/`. Every read-modify-write of the index holds
//! an exclusive `flock` on `<volume_dir>/volumes.lock` and replaces the file
//! through a tmp file + rename, so attach and detach from concurrent exit
//! callbacks or other invocations never lose each other's updates.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use a3s_ctr_core::error::{CtrError, Result};
use a3s_ctr_core::volume::{validate_volume_name, VolumeConfig};
use nix::fcntl::{Flock, FlockArg};

/// Persistent store for volume configurations.
#[derive(Debug, Clone)]
pub struct VolumeStore {
    /// Path to the JSON file.
    path: PathBuf,
    /// Base directory for volume data.
    volumes_dir: PathBuf,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Default)]
struct VolumesFile {
    volumes: HashMap<String, VolumeConfig>,
}

impl VolumeStore {
    pub fn new(path: impl Into<PathBuf>, volumes_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            volumes_dir: volumes_dir.into(),
        }
    }

    /// Store rooted at a volume directory, index at `<dir>/volumes.json`.
    pub fn in_dir(volumes_dir: impl Into<PathBuf>) -> Self {
        let volumes_dir = volumes_dir.into();
        Self::new(volumes_dir.join("volumes.json"), volumes_dir)
    }

    fn load(&self) -> Result<HashMap<String, VolumeConfig>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(CtrError::Io {
                    context: format!("failed to read volumes file {}", self.path.display()),
                    source: e,
                })
            }
        };
        let file: VolumesFile = serde_json::from_str(&data).map_err(|e| {
            CtrError::SerializationError(format!("failed to parse volumes file: {}", e))
        })?;
        Ok(file.volumes)
    }

    fn save(&self, volumes: &HashMap<String, VolumeConfig>) -> Result<()> {
        #[derive(serde::Serialize)]
        struct VolumesRef<'a> {
            volumes: &'a HashMap<String, VolumeConfig>,
        }

        let json = serde_json::to_string_pretty(&VolumesRef { volumes })?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(CtrError::io(format!(
            "failed to write tmp file {}",
            tmp_path.display()
        )))?;
        std::fs::rename(&tmp_path, &self.path).map_err(CtrError::io(format!(
            "failed to rename {} to {}",
            tmp_path.display(),
            self.path.display()
        )))?;
        Ok(())
    }

    fn lock(&self) -> Result<Flock<File>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(CtrError::io(format!(
                "failed to create directory {}",
                parent.display()
            )))?;
        }
        let path = self.lock_path();
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

    /// Run `f` against the index under the lock and write back what it
    /// leaves. Nothing is written when `f` fails.
    fn with_volumes<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, VolumeConfig>) -> Result<T>,
    ) -> Result<T> {
        let _lock = self.lock()?;
        let mut volumes = self.load()?;
        let out = f(&mut volumes)?;
        self.save(&volumes)?;
        Ok(out)
    }

    pub fn get(&self, name: &str) -> Result<Option<VolumeConfig>> {
        Ok(self.load()?.remove(name))
    }

    /// Create a named volume and its data directory.
    ///
    /// Invalid names and existing names fail before anything is written.
    pub fn create(
        &self,
        name: &str,
        driver: Option<&str>,
        labels: HashMap<String, String>,
    ) -> Result<VolumeConfig> {
        validate_volume_name(name)?;
        let driver = driver.unwrap_or("local");
        if driver != "local" {
            return Err(CtrError::Validation(format!(
                "unsupported volume driver '{}'",
                driver
            )));
        }

        let vol_dir = self.volume_dir(name);
        let config = self.with_volumes(|volumes| {
            if volumes.contains_key(name) {
                return Err(CtrError::Conflict(format!("volume '{}' already exists", name)));
            }
            std::fs::create_dir_all(&vol_dir).map_err(CtrError::io(format!(
                "failed to create volume directory {}",
                vol_dir.display()
            )))?;
            let mut config = VolumeConfig::new(name, &vol_dir.to_string_lossy());
            config.labels = labels;
            volumes.insert(name.to_string(), config.clone());
            Ok(config)
        })?;

        tracing::info!(volume = name, "Created volume");
        Ok(config)
    }

    /// Remove a volume and its data. In-use volumes need `force`.
    pub fn remove(&self, name: &str, force: bool) -> Result<VolumeConfig> {
        let config = self.with_volumes(|volumes| {
            let config = volumes
                .get(name)
                .cloned()
                .ok_or_else(|| CtrError::not_found("volume", name))?;
            if config.is_in_use() && !force {
                return Err(CtrError::Conflict(format!(
                    "volume '{}' is in use by {} container(s); use --force to remove",
                    name,
                    config.in_use_by.len()
                )));
            }
            volumes.remove(name);
            Ok(config)
        })?;

        self.remove_data(name);
        Ok(config)
    }

    fn remove_data(&self, name: &str) {
        let vol_dir = self.volume_dir(name);
        if vol_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&vol_dir) {
                tracing::warn!(volume = name, error = %e, "Failed to remove volume data");
            }
        }
    }

    /// All volumes, sorted by name.
    pub fn list(&self) -> Result<Vec<VolumeConfig>> {
        let mut list: Vec<VolumeConfig> = self.load()?.into_values().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    /// Record that `container_id` uses the volume.
    pub fn attach(&self, name: &str, container_id: &str) -> Result<VolumeConfig> {
        self.modify(name, |config| config.attach(container_id))
    }

    pub fn detach(&self, name: &str, container_id: &str) -> Result<VolumeConfig> {
        self.modify(name, |config| config.detach(container_id))
    }

    fn modify(&self, name: &str, f: impl FnOnce(&mut VolumeConfig)) -> Result<VolumeConfig> {
        self.with_volumes(|volumes| {
            let config = volumes
                .get_mut(name)
                .ok_or_else(|| CtrError::not_found("volume", name))?;
            f(config);
            Ok(config.clone())
        })
    }

    /// Remove all unused volumes. Returns their names, sorted.
    pub fn prune(&self) -> Result<Vec<String>> {
        let pruned = self.with_volumes(|volumes| {
            let mut pruned: Vec<String> = volumes
                .values()
                .filter(|config| !config.is_in_use())
                .map(|config| config.name.clone())
                .collect();
            pruned.sort();
            for name in &pruned {
                volumes.remove(name);
            }
            Ok(pruned)
        })?;

        for name in &pruned {
            self.remove_data(name);
        }
        Ok(pruned)
    }

    /// Data directory for a named volume.
    pub fn volume_dir(&self, name: &str) -> PathBuf {
        self.volumes_dir.join(name)
    }

    /// Index file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, VolumeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = VolumeStore::in_dir(dir.path().join("volumes"));
        (dir, store)
    }

    fn create(store: &VolumeStore, name: &str) -> VolumeConfig {
        store.create(name, None, HashMap::new()).unwrap()
    }

    #[test]
    fn test_list_empty() {
        let (_dir, store) = temp_store();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_create_sets_mount_point() {
        let (_dir, store) = temp_store();
        let created = create(&store, "mydata");
        assert!(created.mount_point.ends_with("mydata"));
        assert!(PathBuf::from(&created.mount_point).is_dir());
        assert_eq!(created.driver, "local");
    }

    #[test]
    fn test_create_with_labels() {
        let (_dir, store) = temp_store();
        let labels = HashMap::from([("tier".to_string(), "db".to_string())]);
        store.create("pg", Some("local"), labels).unwrap();
        let loaded = store.get("pg").unwrap().unwrap();
        assert_eq!(loaded.labels["tier"], "db");
    }

    #[test]
    fn test_create_unknown_driver() {
        let (_dir, store) = temp_store();
        assert!(store.create("x", Some("nfs"), HashMap::new()).is_err());
    }

    #[test]
    fn test_create_duplicate_is_conflict_without_mutation() {
        let (_dir, store) = temp_store();
        create(&store, "mydata");
        let marker = store.volume_dir("mydata").join("keep");
        std::fs::write(&marker, "x").unwrap();
        let index_before = std::fs::read_to_string(store.path()).unwrap();

        let err = store.create("mydata", None, HashMap::new()).unwrap_err();
        assert!(matches!(err, CtrError::Conflict(_)));
        assert!(marker.exists());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), index_before);
    }

    #[test]
    fn test_create_invalid_name_writes_nothing() {
        let (dir, store) = temp_store();
        for name in ["", "a/b", "..", "a\\b"] {
            let err = store.create(name, None, HashMap::new()).unwrap_err();
            assert!(err.is_user_error());
        }
        assert!(!dir.path().join("volumes").exists());
    }

    #[test]
    fn test_get_nonexistent() {
        let (_dir, store) = temp_store();
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_remove_cleans_up_directory() {
        let (_dir, store) = temp_store();
        let created = create(&store, "mydata");
        let vol_dir = PathBuf::from(&created.mount_point);

        let removed = store.remove("mydata", false).unwrap();
        assert_eq!(removed.name, "mydata");
        assert!(!vol_dir.exists());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_remove_nonexistent() {
        let (_dir, store) = temp_store();
        assert!(store.remove("nope", false).unwrap_err().is_not_found());
    }

    #[test]
    fn test_remove_in_use_requires_force() {
        let (_dir, store) = temp_store();
        create(&store, "mydata");
        store.attach("mydata", "ctr-1").unwrap();

        let err = store.remove("mydata", false).unwrap_err();
        assert!(matches!(err, CtrError::Conflict(_)));
        assert!(store.get("mydata").unwrap().is_some());

        store.remove("mydata", true).unwrap();
        assert!(store.get("mydata").unwrap().is_none());
    }

    #[test]
    fn test_attach_detach() {
        let (_dir, store) = temp_store();
        create(&store, "mydata");
        store.attach("mydata", "ctr-1").unwrap();
        store.attach("mydata", "ctr-1").unwrap();
        assert_eq!(store.get("mydata").unwrap().unwrap().in_use_by, vec!["ctr-1"]);

        store.detach("mydata", "ctr-1").unwrap();
        assert!(!store.get("mydata").unwrap().unwrap().is_in_use());
        assert!(store.attach("nope", "ctr-1").is_err());
    }

    #[test]
    fn test_prune() {
        let (_dir, store) = temp_store();
        create(&store, "unused2");
        create(&store, "unused1");
        create(&store, "in_use");
        store.attach("in_use", "ctr-1").unwrap();

        let pruned = store.prune().unwrap();
        assert_eq!(pruned, vec!["unused1".to_string(), "unused2".to_string()]);

        let remaining = store.list().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "in_use");
    }

    #[test]
    fn test_concurrent_attach_keeps_every_claim() {
        let (_dir, store) = temp_store();
        create(&store, "shared");

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let store = store.clone();
                scope.spawn(move || {
                    for n in 0..10 {
                        store.attach("shared", &format!("ctr-{worker}-{n}")).unwrap();
                    }
                });
            }
        });
        assert_eq!(store.get("shared").unwrap().unwrap().in_use_by.len(), 80);

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let store = store.clone();
                scope.spawn(move || {
                    for n in 0..10 {
                        store.detach("shared", &format!("ctr-{worker}-{n}")).unwrap();
                    }
                });
            }
        });
        assert!(!store.get("shared").unwrap().unwrap().is_in_use());
    }

    #[test]
    fn test_atomic_write_leaves_no_tmp() {
        let (_dir, store) = temp_store();
        create(&store, "mydata");
        let data = std::fs::read_to_string(store.path()).unwrap();
        let _: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert!(!store.path().with_extension("json.tmp").exists());
    }
}
