// SPDX-License-Identifier: MIT

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use sv_core::Configuration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding config for save: {0}")]
    Encode(#[from] serde_json::Error),
}

/// An atomically replaceable `Configuration` snapshot, backed by an
/// optional on-disk JSON file.
///
/// `load()` clones the current `Arc<Configuration>` under a brief lock
/// and returns — the clone is a refcount bump, so there is no
/// contention between readers and no reader ever observes a partially
/// applied mutation. `mutate()` is the only way to publish a new
/// snapshot; it holds the mutation lock across the whole
/// read-compute-publish sequence so concurrent writers never race on a
/// stale read.
pub struct ConfigStore {
    current: Mutex<Arc<Configuration>>,
    mutation: Mutex<()>,
    save_mutex: Mutex<()>,
    path: Option<PathBuf>,
}

impl ConfigStore {
    /// Build a store around an already-loaded configuration, with no
    /// backing file (used by tests and by callers that persist
    /// elsewhere).
    pub fn new(initial: Configuration) -> Self {
        Self {
            current: Mutex::new(Arc::new(initial)),
            mutation: Mutex::new(()),
            save_mutex: Mutex::new(()),
            path: None,
        }
    }

    /// Build a store around an already-loaded configuration, backed by
    /// `path` for future `save()`/`reload()` calls (the file itself is
    /// not read here).
    pub fn with_path(initial: Configuration, path: impl Into<PathBuf>) -> Self {
        Self {
            current: Mutex::new(Arc::new(initial)),
            mutation: Mutex::new(()),
            save_mutex: Mutex::new(()),
            path: Some(path.into()),
        }
    }

    /// Load the configuration file at `path` and build a store backed
    /// by it. A read/parse failure here is fatal — there is no prior
    /// snapshot to fall back to.
    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let initial = read_config(&path)?;
        Ok(Self {
            current: Mutex::new(Arc::new(initial)),
            mutation: Mutex::new(()),
            save_mutex: Mutex::new(()),
            path: Some(path),
        })
    }

    /// Return the current snapshot. Never blocks on a writer for
    /// longer than the pointer-swap itself.
    pub fn load(&self) -> Arc<Configuration> {
        Arc::clone(&self.current.lock())
    }

    /// Publish a new snapshot computed from the current one. `f` runs
    /// under the mutation lock — keep it to bounded in-memory work
    /// (no I/O, no blocking call).
    pub fn mutate<F>(&self, f: F) -> Arc<Configuration>
    where
        F: FnOnce(&Configuration) -> Configuration,
    {
        let _guard = self.mutation.lock();
        let current = self.load();
        let next = Arc::new(f(&current));
        *self.current.lock() = Arc::clone(&next);
        next
    }

    /// Re-read the backing file and publish its contents as the
    /// current snapshot. On parse failure the old snapshot remains in
    /// effect and the error is returned to the caller — a failed save
    /// is non-fatal and keeps the old snapshot too, and the same rule
    /// applies symmetrically here.
    pub fn reload(&self) -> Result<Arc<Configuration>, StoreError> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| StoreError::Read {
                path: PathBuf::new(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no backing file"),
            })?;
        match read_config(&path) {
            Ok(cfg) => {
                let _guard = self.mutation.lock();
                let next = Arc::new(cfg);
                *self.current.lock() = Arc::clone(&next);
                Ok(next)
            }
            Err(e) => {
                warn!(error = %e, "config reload failed, keeping current snapshot");
                Err(e)
            }
        }
    }

    /// Atomically save the current snapshot to the backing file
    /// (write to `.tmp`, `fsync`, rename over the real path), guarded
    /// by a save lock so concurrent saves never interleave bytes.
    pub fn save(&self) -> Result<(), StoreError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        let _guard = self.save_mutex.lock();
        let snapshot = self.load();
        write_config_atomic(path, &snapshot)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn read_config(path: &Path) -> Result<Configuration, StoreError> {
    let data = fs::read_to_string(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn write_config_atomic(path: &Path, config: &Configuration) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let file = File::create(&tmp_path).map_err(|source| StoreError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, config)?;
        writer.flush().map_err(|source| StoreError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        let file = writer.into_inner().map_err(|e| StoreError::Write {
            path: tmp_path.clone(),
            source: e.into_error(),
        })?;
        file.sync_all().map_err(|source| StoreError::Write {
            path: tmp_path.clone(),
            source,
        })?;
    }
    fs::rename(&tmp_path, path).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sv_core::TaskDefinition;

    fn task(_name: &str) -> TaskDefinition {
        TaskDefinition {
            command: "sleep".into(),
            args: vec!["1".into()],
            workdir: None,
            wait: 1,
            restart_pause: 0,
            start_time: 1,
            one_time: false,
        }
    }

    #[test]
    fn load_returns_same_data_across_concurrent_readers() {
        let store = ConfigStore::new(Configuration::default().with_task("a", task("a")));
        let r1 = store.load();
        let r2 = store.load();
        assert_eq!(r1.tasks.keys().collect::<Vec<_>>(), r2.tasks.keys().collect::<Vec<_>>());
    }

    #[test]
    fn mutate_publishes_new_snapshot_without_mutating_old_handle() {
        let store = ConfigStore::new(Configuration::default());
        let before = store.load();
        assert!(before.tasks.is_empty());

        store.mutate(|cfg| cfg.with_task("web", task("web")));

        assert!(before.tasks.is_empty(), "prior Arc handle must stay unchanged");
        let after = store.load();
        assert_eq!(after.tasks.len(), 1);
    }

    #[test]
    fn save_then_load_from_path_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::with_path(Configuration::default().with_task("web", task("web")), &path);
        store.save().unwrap();

        let reloaded = ConfigStore::load_from_path(&path).unwrap();
        assert_eq!(reloaded.load().tasks.len(), 1);
    }

    #[test]
    fn delete_then_save_removes_task_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::with_path(
            Configuration::default().with_task("web", task("web")),
            &path,
        );
        store.save().unwrap();

        store.mutate(|cfg| cfg.without_task("web"));
        store.save().unwrap();

        let reloaded = ConfigStore::load_from_path(&path).unwrap();
        assert!(reloaded.load().tasks.is_empty());
    }
}
