//! Working directories for server instances.
//!
//! Automatic directories live under a temp root as `nats-<uuid>`. Runs that
//! crash before disposing leave theirs behind, so every new automatic
//! directory first sweeps the root for ones older than the retention window.

use nats_runner_core::{RunnerError, RunnerOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

const DIRECTORY_PREFIX: &str = "nats-";

/// A prepared data directory and whether this crate is responsible for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDirectory {
    path: PathBuf,
    owned: bool,
}

impl DataDirectory {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Owned directories were created automatically and are deleted on dispose
    pub fn is_owned(&self) -> bool {
        self.owned
    }
}

#[derive(Debug, Clone)]
pub struct DataDirectoryManager {
    temp_root: PathBuf,
    retention: Duration,
}

impl DataDirectoryManager {
    pub fn new(temp_root: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            temp_root: temp_root.into(),
            retention,
        }
    }

    pub fn from_options(options: &RunnerOptions) -> Self {
        Self::new(
            options
                .temp_root
                .clone()
                .unwrap_or_else(Self::default_temp_root),
            options.data_directory_retention(),
        )
    }

    pub fn default_temp_root() -> PathBuf {
        std::env::temp_dir().join("nats-runner")
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Use `requested` when given, creating it if needed, otherwise sweep
    /// and create a fresh automatic directory
    pub fn prepare(&self, requested: Option<&Path>) -> Result<DataDirectory, RunnerError> {
        if let Some(path) = requested {
            std::fs::create_dir_all(path)?;
            debug!(path = %path.display(), "Using caller-supplied data directory");
            return Ok(DataDirectory {
                path: path.to_path_buf(),
                owned: false,
            });
        }

        self.sweep();

        std::fs::create_dir_all(&self.temp_root)?;
        let path = self
            .temp_root
            .join(format!("{DIRECTORY_PREFIX}{}", uuid::Uuid::new_v4()));
        std::fs::create_dir(&path)?;
        debug!(path = %path.display(), "Created data directory");

        Ok(DataDirectory { path, owned: true })
    }

    /// Delete automatic directories untouched for longer than the retention
    /// window.
    ///
    /// A directory counts as touched when it was created or its entries last
    /// changed. Returns how many were removed. Failures are skipped.
    pub fn sweep(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.temp_root) else {
            return 0;
        };

        let now = SystemTime::now();
        let mut removed = 0;

        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(DIRECTORY_PREFIX) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }

            // Idle time: a server writing into its directory keeps it fresh
            let Some(age) = [metadata.created(), metadata.modified()]
                .into_iter()
                .flatten()
                .map(|at| now.duration_since(at).unwrap_or_default())
                .min()
            else {
                continue;
            };
            if age <= self.retention {
                continue;
            }

            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => {
                    removed += 1;
                    info!(path = %entry.path().display(), age_secs = age.as_secs(), "Removed abandoned data directory");
                }
                Err(e) => debug!(path = %entry.path().display(), "Could not remove abandoned data directory: {e}"),
            }
        }

        removed
    }

    /// Delete `directory` if it is owned; caller-supplied directories are left alone
    pub fn release(&self, directory: &DataDirectory) -> std::io::Result<()> {
        if !directory.owned {
            return Ok(());
        }
        match std::fs::remove_dir_all(&directory.path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_directory_is_unique_and_owned() {
        let root = tempfile::tempdir().unwrap();
        let manager = DataDirectoryManager::new(root.path(), Duration::from_secs(3600));

        let a = manager.prepare(None).unwrap();
        let b = manager.prepare(None).unwrap();

        assert_ne!(a.path(), b.path());
        assert!(a.is_owned());
        assert!(a.path().is_dir());
        assert!(a.path().starts_with(root.path()));
        assert!(
            a.path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("nats-")
        );

        manager.release(&a).unwrap();
        assert!(!a.path().exists());
        // Releasing twice is fine
        manager.release(&a).unwrap();
    }

    #[test]
    fn test_caller_directory_is_created_and_kept() {
        let root = tempfile::tempdir().unwrap();
        let requested = root.path().join("mine").join("data");
        let manager = DataDirectoryManager::new(root.path(), Duration::ZERO);

        let dir = manager.prepare(Some(&requested)).unwrap();
        assert!(!dir.is_owned());
        assert!(requested.is_dir());

        manager.release(&dir).unwrap();
        assert!(requested.is_dir());
    }

    #[test]
    fn test_sweep_removes_only_expired_prefixed_directories() {
        let root = tempfile::tempdir().unwrap();
        let stale = root.path().join("nats-stale");
        let unrelated = root.path().join("keep-me");
        std::fs::create_dir_all(stale.join("jetstream")).unwrap();
        std::fs::create_dir(&unrelated).unwrap();
        std::fs::write(root.path().join("nats-file"), b"not a dir").unwrap();

        std::thread::sleep(Duration::from_millis(20));

        let manager = DataDirectoryManager::new(root.path(), Duration::ZERO);
        assert_eq!(manager.sweep(), 1);
        assert!(!stale.exists());
        assert!(unrelated.exists());
        assert!(root.path().join("nats-file").exists());
    }

    #[test]
    fn test_sweep_keeps_recent_directories() {
        let root = tempfile::tempdir().unwrap();
        let manager = DataDirectoryManager::new(root.path(), Duration::from_secs(3600));

        let first = manager.prepare(None).unwrap();
        let second = manager.prepare(None).unwrap();

        assert!(first.path().is_dir());
        assert!(second.path().is_dir());
        assert_eq!(manager.sweep(), 0);
    }

    #[test]
    fn test_sweep_keeps_old_directory_that_is_still_written() {
        let root = tempfile::tempdir().unwrap();
        let manager = DataDirectoryManager::new(root.path(), Duration::from_secs(1));
        let live = manager.prepare(None).unwrap();

        std::thread::sleep(Duration::from_millis(1500));
        std::fs::write(live.path().join("meta.inf"), b"{}").unwrap();
        assert_eq!(manager.sweep(), 0);
        assert!(live.path().is_dir());

        std::thread::sleep(Duration::from_millis(1500));
        assert_eq!(manager.sweep(), 1);
        assert!(!live.path().exists());
    }

    #[test]
    fn test_sweep_of_missing_root() {
        let root = tempfile::tempdir().unwrap();
        let manager = DataDirectoryManager::new(root.path().join("absent"), Duration::ZERO);
        assert_eq!(manager.sweep(), 0);
    }
}
