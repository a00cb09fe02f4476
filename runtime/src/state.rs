//! Persistent container state.
//!
//! One JSON file per container at `<state_dir>/<id>.json`. Writes go to a
//! `.json.tmp` sibling first and are renamed into place so readers never
//! observe half-written records.

use std::path::{Path, PathBuf};

use a3s_ctr_core::container::{ContainerState, ContainerStatus};
use a3s_ctr_core::error::{CtrError, Result};

/// Directory-backed store of container records.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the state files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn validate_id(id: &str) -> Result<()> {
        if id.is_empty() || id.contains('/') || id.contains('\\') || id.starts_with('.') {
            return Err(CtrError::Validation(format!("invalid container id '{}'", id)));
        }
        Ok(())
    }

    /// Persist a new record. Fails with a conflict, before touching disk,
    /// if the name or ID is already taken.
    pub fn create(&self, state: &ContainerState) -> Result<()> {
        Self::validate_id(&state.id)?;
        if state.name.trim().is_empty() {
            return Err(CtrError::Validation("container name cannot be empty".to_string()));
        }
        if self.path_for(&state.id).exists() {
            return Err(CtrError::Conflict(format!(
                "container id {} already exists",
                state.id
            )));
        }
        if let Some(existing) = self.find_by_name(&state.name)? {
            return Err(CtrError::Conflict(format!(
                "container name '{}' is already in use by {}",
                state.name,
                existing.short_id()
            )));
        }
        self.save(state)
    }

    /// Write a record, replacing any previous version (atomic write).
    pub fn save(&self, state: &ContainerState) -> Result<()> {
        Self::validate_id(&state.id)?;
        std::fs::create_dir_all(&self.dir).map_err(CtrError::io(format!(
            "failed to create state directory {}",
            self.dir.display()
        )))?;

        let json = serde_json::to_string_pretty(state)?;
        let path = self.path_for(&state.id);
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(CtrError::io(format!(
            "failed to write tmp file {}",
            tmp_path.display()
        )))?;
        std::fs::rename(&tmp_path, &path).map_err(CtrError::io(format!(
            "failed to rename {} to {}",
            tmp_path.display(),
            path.display()
        )))?;
        Ok(())
    }

    /// Load a record by full ID.
    pub fn load(&self, id: &str) -> Result<ContainerState> {
        Self::validate_id(id)?;
        let path = self.path_for(id);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CtrError::not_found("container", id));
            }
            Err(e) => {
                return Err(CtrError::Io {
                    context: format!("failed to read state file {}", path.display()),
                    source: e,
                })
            }
        };
        serde_json::from_str(&data).map_err(|e| {
            CtrError::SerializationError(format!("corrupt state file {}: {}", path.display(), e))
        })
    }

    /// Delete a record. Deleting a missing record succeeds.
    pub fn delete(&self, id: &str) -> Result<()> {
        Self::validate_id(id)?;
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CtrError::Io {
                context: format!("failed to delete state for {}", id),
                source: e,
            }),
        }
    }

    /// All readable records, sorted by creation time then ID.
    ///
    /// Unreadable or corrupt files are skipped with a warning.
    pub fn list(&self) -> Result<Vec<ContainerState>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CtrError::Io {
                    context: format!("failed to read state directory {}", self.dir.display()),
                    source: e,
                })
            }
        };

        let mut states = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|data| {
                    serde_json::from_str::<ContainerState>(&data).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(state) => states.push(state),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable state file");
                }
            }
        }

        states.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(states)
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<ContainerState>> {
        Ok(self.list()?.into_iter().find(|s| s.name == name))
    }

    /// Find the record whose ID starts with `prefix`.
    ///
    /// More than one match is an `AmbiguousReference` error listing the
    /// candidate IDs in lexicographic order.
    pub fn find_by_short_id(&self, prefix: &str) -> Result<Option<ContainerState>> {
        if prefix.is_empty() {
            return Ok(None);
        }
        let mut matches: Vec<ContainerState> = self
            .list()?
            .into_iter()
            .filter(|s| s.id.starts_with(prefix))
            .collect();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            _ => {
                let mut ids: Vec<String> = matches.into_iter().map(|s| s.id).collect();
                ids.sort();
                Err(CtrError::AmbiguousReference {
                    reference: prefix.to_string(),
                    matches: ids,
                })
            }
        }
    }

    /// Resolve a user reference: exact ID, then exact name, then unique
    /// ID prefix.
    pub fn resolve(&self, reference: &str) -> Result<ContainerState> {
        if Self::validate_id(reference).is_ok() && self.path_for(reference).exists() {
            return self.load(reference);
        }
        if let Some(state) = self.find_by_name(reference)? {
            return Ok(state);
        }
        self.find_by_short_id(reference)?
            .ok_or_else(|| CtrError::not_found("container", reference))
    }

    /// Change status with the timestamp side effects of
    /// [`ContainerState::transition`].
    pub fn update_status(&self, id: &str, status: ContainerStatus) -> Result<ContainerState> {
        let mut state = self.load(id)?;
        state.transition(status)?;
        self.save(&state)?;
        tracing::debug!(container = %state.short_id(), status = %status, "Updated status");
        Ok(state)
    }

    pub fn update_pid(&self, id: &str, pid: i32) -> Result<ContainerState> {
        let mut state = self.load(id)?;
        state.pid = pid;
        self.save(&state)?;
        Ok(state)
    }

    /// Record a finished process: exit code, terminal status, PID cleared.
    pub fn record_exit(
        &self,
        id: &str,
        exit_code: i32,
        status: ContainerStatus,
    ) -> Result<ContainerState> {
        if !status.is_terminal() {
            return Err(CtrError::Validation(format!(
                "exit status must be stopped or exited, got {}",
                status
            )));
        }
        let mut state = self.load(id)?;
        state.transition(status)?;
        state.exit_code = exit_code;
        state.pid = 0;
        self.save(&state)?;
        Ok(state)
    }

    /// Mark `running` records whose process is gone as `exited`.
    ///
    /// Returns the IDs that were updated.
    pub fn reconcile(&self) -> Result<Vec<String>> {
        let mut updated = Vec::new();
        for mut state in self.list()? {
            if state.status != ContainerStatus::Running || is_process_alive(state.pid) {
                continue;
            }
            tracing::info!(
                container = %state.short_id(),
                pid = state.pid,
                "Process gone, marking container exited"
            );
            state.transition(ContainerStatus::Exited)?;
            state.pid = 0;
            self.save(&state)?;
            updated.push(state.id);
        }
        Ok(updated)
    }
}

/// `kill(pid, 0)` liveness check. `EPERM` means the process exists;
/// zombies count as dead.
pub fn is_process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

fn is_zombie(pid: i32) -> bool {
    // /proc/<pid>/stat: "pid (comm) S ...", comm may contain spaces.
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            let after = stat.rfind(')').map(|i| &stat[i + 1..])?;
            after.split_whitespace().next().map(|s| s == "Z")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state"));
        (dir, store)
    }

    fn state(id: &str, name: &str) -> ContainerState {
        ContainerState::new(id, name, "alpine:latest", "/bin/sh", &format!("/tmp/{id}"))
    }

    fn dir_entries(store: &StateStore) -> usize {
        std::fs::read_dir(store.dir()).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn test_create_and_load() {
        let (_dir, store) = temp_store();
        let s = state("aaaa1111", "web");
        store.create(&s).unwrap();

        let loaded = store.load("aaaa1111").unwrap();
        assert_eq!(loaded, s);
        assert!(store.dir().join("aaaa1111.json").exists());
        assert!(!store.dir().join("aaaa1111.json.tmp").exists());
    }

    #[test]
    fn test_create_duplicate_name_conflict_without_write() {
        let (_dir, store) = temp_store();
        store.create(&state("aaaa1111", "web")).unwrap();
        let before = dir_entries(&store);

        let err = store.create(&state("bbbb2222", "web")).unwrap_err();
        assert!(matches!(err, CtrError::Conflict(_)));
        assert!(err.is_user_error());
        assert_eq!(dir_entries(&store), before);
        assert!(!store.dir().join("bbbb2222.json").exists());
    }

    #[test]
    fn test_name_unique_among_dead_records() {
        let (_dir, store) = temp_store();
        let mut s = state("aaaa1111", "web");
        s.transition(ContainerStatus::Running).unwrap();
        s.transition(ContainerStatus::Exited).unwrap();
        store.create(&s).unwrap();

        assert!(store.create(&state("bbbb2222", "web")).is_err());
    }

    #[test]
    fn test_create_duplicate_id() {
        let (_dir, store) = temp_store();
        store.create(&state("aaaa1111", "web")).unwrap();
        assert!(matches!(
            store.create(&state("aaaa1111", "db")),
            Err(CtrError::Conflict(_))
        ));
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let (_dir, store) = temp_store();
        let err = store.load("nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_invalid_ids_rejected() {
        let (_dir, store) = temp_store();
        assert!(store.load("../etc").is_err());
        assert!(store.save(&state("a/b", "x")).is_err());
        assert!(store.delete("").is_err());
    }

    #[test]
    fn test_delete_idempotent() {
        let (_dir, store) = temp_store();
        store.create(&state("aaaa1111", "web")).unwrap();
        store.delete("aaaa1111").unwrap();
        store.delete("aaaa1111").unwrap();
        assert!(store.load("aaaa1111").unwrap_err().is_not_found());
    }

    #[test]
    fn test_list_empty_when_dir_missing() {
        let (_dir, store) = temp_store();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_list_skips_corrupt_files() {
        let (_dir, store) = temp_store();
        store.create(&state("aaaa1111", "web")).unwrap();
        store.create(&state("bbbb2222", "db")).unwrap();
        std::fs::write(store.dir().join("broken.json"), "{ not json").unwrap();
        std::fs::write(store.dir().join("notes.txt"), "ignored").unwrap();

        let list = store.list().unwrap();
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_find_by_name() {
        let (_dir, store) = temp_store();
        store.create(&state("aaaa1111", "web")).unwrap();
        assert_eq!(store.find_by_name("web").unwrap().unwrap().id, "aaaa1111");
        assert!(store.find_by_name("db").unwrap().is_none());
    }

    #[test]
    fn test_find_by_short_id() {
        let (_dir, store) = temp_store();
        store.create(&state("abc123", "one")).unwrap();
        store.create(&state("abd456", "two")).unwrap();

        assert_eq!(store.find_by_short_id("abc").unwrap().unwrap().id, "abc123");
        assert!(store.find_by_short_id("zzz").unwrap().is_none());
        assert!(store.find_by_short_id("").unwrap().is_none());
    }

    #[test]
    fn test_find_by_short_id_ambiguous() {
        let (_dir, store) = temp_store();
        store.create(&state("abd456", "two")).unwrap();
        store.create(&state("abc123", "one")).unwrap();

        match store.find_by_short_id("ab").unwrap_err() {
            CtrError::AmbiguousReference { reference, matches } => {
                assert_eq!(reference, "ab");
                assert_eq!(matches, vec!["abc123".to_string(), "abd456".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_resolve_order() {
        let (_dir, store) = temp_store();
        store.create(&state("abc123", "web")).unwrap();
        // A container named like another's ID prefix.
        store.create(&state("ffff0000", "abc")).unwrap();

        assert_eq!(store.resolve("abc123").unwrap().id, "abc123");
        assert_eq!(store.resolve("web").unwrap().id, "abc123");
        assert_eq!(store.resolve("abc").unwrap().id, "ffff0000");
        assert_eq!(store.resolve("fff").unwrap().id, "ffff0000");
        assert!(store.resolve("nothing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_update_status_running_twice_keeps_started() {
        let (_dir, store) = temp_store();
        store.create(&state("aaaa1111", "web")).unwrap();

        let first = store.update_status("aaaa1111", ContainerStatus::Running).unwrap();
        let started = first.started.unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.update_status("aaaa1111", ContainerStatus::Running).unwrap();

        assert_eq!(second.started, Some(started));
        assert_eq!(store.load("aaaa1111").unwrap().started, Some(started));
    }

    #[test]
    fn test_update_status_exited_refreshes_finished() {
        let (_dir, store) = temp_store();
        store.create(&state("aaaa1111", "web")).unwrap();
        store.update_status("aaaa1111", ContainerStatus::Running).unwrap();

        let first = store.update_status("aaaa1111", ContainerStatus::Exited).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.update_status("aaaa1111", ContainerStatus::Exited).unwrap();

        assert!(second.finished.unwrap() > first.finished.unwrap());
    }

    #[test]
    fn test_update_status_backwards_rejected() {
        let (_dir, store) = temp_store();
        store.create(&state("aaaa1111", "web")).unwrap();
        store.update_status("aaaa1111", ContainerStatus::Stopped).unwrap();

        let err = store
            .update_status("aaaa1111", ContainerStatus::Running)
            .unwrap_err();
        assert!(err.is_user_error());
        assert_eq!(store.load("aaaa1111").unwrap().status, ContainerStatus::Stopped);
    }

    #[test]
    fn test_update_pid_and_record_exit() {
        let (_dir, store) = temp_store();
        store.create(&state("aaaa1111", "web")).unwrap();
        store.update_pid("aaaa1111", 1234).unwrap();
        store.update_status("aaaa1111", ContainerStatus::Running).unwrap();

        let done = store
            .record_exit("aaaa1111", 137, ContainerStatus::Exited)
            .unwrap();
        assert_eq!(done.exit_code, 137);
        assert_eq!(done.pid, 0);
        assert!(done.finished.is_some());

        assert!(store
            .record_exit("aaaa1111", 0, ContainerStatus::Running)
            .is_err());
    }

    #[test]
    fn test_reconcile_marks_dead_running_exited() {
        let (_dir, store) = temp_store();
        let mut dead = state("dead0001", "dead");
        dead.pid = i32::MAX - 1;
        dead.transition(ContainerStatus::Running).unwrap();
        store.create(&dead).unwrap();

        let mut alive = state("live0001", "live");
        alive.pid = std::process::id() as i32;
        alive.transition(ContainerStatus::Running).unwrap();
        store.create(&alive).unwrap();

        let updated = store.reconcile().unwrap();
        assert_eq!(updated, vec!["dead0001".to_string()]);
        assert_eq!(store.load("dead0001").unwrap().status, ContainerStatus::Exited);
        assert_eq!(store.load("live0001").unwrap().status, ContainerStatus::Running);
    }

    #[test]
    fn test_is_process_alive() {
        assert!(is_process_alive(std::process::id() as i32));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(-1));
    }
}
