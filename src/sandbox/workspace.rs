//! Per-sandbox working directories.
//!
//! Every sandbox id owns `<root>/<id>/`, which holds exactly one script
//! file. The script is written to a temporary file in the same directory
//! and renamed into place, so the runtime process never observes a
//! partially written script.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Canonical name of the staged script inside a workspace.
pub const SCRIPT_FILE_NAME: &str = "script.lua";

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Invalid sandbox id {0:?}")]
    InvalidId(String),

    #[error("Failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WorkspaceError {
    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by `id`.
    pub fn dir(&self, id: &str) -> Result<PathBuf, WorkspaceError> {
        validate_id(id)?;
        Ok(self.root.join(id))
    }

    /// Path of the staged script for `id`.
    pub fn script_path(&self, id: &str) -> Result<PathBuf, WorkspaceError> {
        Ok(self.dir(id)?.join(SCRIPT_FILE_NAME))
    }

    /// Recreate the workspace for `id` and atomically write `source` as its
    /// script. Returns the workspace directory.
    ///
    /// On failure the directory is removed again so nothing half-written
    /// stays behind.
    pub fn stage(&self, id: &str, source: &str) -> Result<PathBuf, WorkspaceError> {
        let dir = self.dir(id)?;
        debug!(id, dir = %dir.display(), "workspace:stage");

        let result = self.stage_into(&dir, source);
        if result.is_err()
            && let Err(e) = remove_dir_if_exists(&dir)
        {
            warn!(id, error = %e, "workspace:stage cleanup failed");
        }
        result.map(|()| dir)
    }

    fn stage_into(&self, dir: &Path, source: &str) -> Result<(), WorkspaceError> {
        remove_dir_if_exists(dir).map_err(|e| WorkspaceError::io("remove", dir, e))?;
        fs::create_dir_all(&self.root).map_err(|e| WorkspaceError::io("create", &self.root, e))?;
        fs::create_dir(dir).map_err(|e| WorkspaceError::io("create", dir, e))?;

        let mut tmp = tempfile::Builder::new()
            .prefix("tmp")
            .suffix(".lua")
            .tempfile_in(dir)
            .map_err(|e| WorkspaceError::io("create temporary file in", dir, e))?;
        tmp.write_all(source.as_bytes())
            .and_then(|()| tmp.flush())
            .map_err(|e| WorkspaceError::io("write", tmp.path(), e))?;

        let script = dir.join(SCRIPT_FILE_NAME);
        tmp.persist(&script)
            .map_err(|e| WorkspaceError::io("rename script into", &script, e.error))?;
        Ok(())
    }

    /// Remove the workspace for `id`. A missing directory is not an error.
    pub fn destroy(&self, id: &str) -> Result<(), WorkspaceError> {
        let dir = self.dir(id)?;
        debug!(id, dir = %dir.display(), "workspace:destroy");
        remove_dir_if_exists(&dir).map_err(|e| WorkspaceError::io("remove", &dir, e))
    }
}

fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Ids double as directory names, so anything that could escape the root is
/// refused.
fn validate_id(id: &str) -> Result<(), WorkspaceError> {
    let invalid = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains('/')
        || id.contains('\\')
        || id.contains('\0');
    if invalid {
        return Err(WorkspaceError::InvalidId(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, WorkspaceStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(tmp.path().join("workspaces"));
        (tmp, store)
    }

    #[test]
    fn test_stage_writes_script() {
        let (_tmp, store) = store();
        let dir = store.stage("bot-1", "print('hi')").unwrap();

        assert_eq!(dir, store.root().join("bot-1"));
        let script = fs::read_to_string(store.script_path("bot-1").unwrap()).unwrap();
        assert_eq!(script, "print('hi')");
    }

    #[test]
    fn test_stage_leaves_only_the_script() {
        let (_tmp, store) = store();
        let dir = store.stage("bot-1", "return {}").unwrap();

        let entries: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec![SCRIPT_FILE_NAME.to_string()]);
    }

    #[test]
    fn test_stage_replaces_previous_contents() {
        let (_tmp, store) = store();
        let dir = store.stage("bot-1", "old").unwrap();
        fs::write(dir.join("leftover.txt"), "junk").unwrap();

        store.stage("bot-1", "new").unwrap();
        assert!(!dir.join("leftover.txt").exists());
        assert_eq!(fs::read_to_string(dir.join(SCRIPT_FILE_NAME)).unwrap(), "new");
    }

    #[test]
    fn test_destroy_removes_directory() {
        let (_tmp, store) = store();
        let dir = store.stage("bot-1", "x").unwrap();
        store.destroy("bot-1").unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_destroy_missing_is_ok() {
        let (_tmp, store) = store();
        store.destroy("never-staged").unwrap();
        store.destroy("never-staged").unwrap();
    }

    #[test]
    fn test_stage_failure_leaves_no_directory() {
        let tmp = tempfile::tempdir().unwrap();
        // A regular file where the root directory should be
        let root = tmp.path().join("workspaces");
        fs::write(&root, "not a directory").unwrap();
        let store = WorkspaceStore::new(&root);

        let err = store.stage("bot-1", "x").unwrap_err();
        assert!(matches!(err, WorkspaceError::Io { .. }));
        assert!(!root.join("bot-1").exists());
    }

    #[test]
    fn test_invalid_ids_rejected() {
        let (_tmp, store) = store();
        for id in ["", ".", "..", "a/b", "..\\x", "nul\0"] {
            assert!(
                matches!(store.stage(id, "x"), Err(WorkspaceError::InvalidId(_))),
                "id {id:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_error_message_names_path() {
        let err = WorkspaceError::io(
            "write",
            Path::new("/tmp/ws/script.lua"),
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.to_string(), "Failed to write /tmp/ws/script.lua: denied");
    }
}
