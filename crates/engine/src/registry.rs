// SPDX-License-Identifier: MIT

//! The Task Registry: a thin wrapper over the configuration
//! snapshot store plus the side map of live `TaskRuntime`s — install
//! and remove clone-modify-publish the configuration and correspondingly
//! spawn or tear down a runtime, keeping the two in lockstep.

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use sv_core::time_fmt::go_layout_to_strftime;
use sv_core::{Configuration, TaskDefinition, TaskStatusView};
use sv_storage::ConfigStore;
use tokio::sync::watch;

use crate::error::RegistryError;
use crate::gelf::RemoteLogSink;
use crate::task::{TaskLogContext, TaskRuntime};

pub struct TaskRegistry {
    store: Arc<ConfigStore>,
    runtimes: Mutex<IndexMap<String, Arc<TaskRuntime>>>,
    remote: Mutex<Option<Arc<RemoteLogSink>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    host: String,
}

impl TaskRegistry {
    pub fn new(store: Arc<ConfigStore>, host: impl Into<String>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            runtimes: Mutex::new(IndexMap::new()),
            remote: Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
            host: host.into(),
        }
    }

    /// Connect the remote log sink described by the current
    /// configuration's `graylog` block, if any. A no-op, leaving the
    /// sink unset, when that block is absent.
    pub async fn init_remote_sink(&self) -> std::io::Result<()> {
        let cfg = self.store.load();
        if let Some(g) = &cfg.graylog {
            let sink = RemoteLogSink::connect(&g.remote, g.level, g.add_fields.clone()).await?;
            *self.remote.lock() = Some(Arc::new(sink));
        }
        Ok(())
    }

    fn log_context(&self, cfg: &Configuration) -> TaskLogContext {
        TaskLogContext {
            logdir: PathBuf::from(&cfg.logdir),
            file_prefix: cfg.log_file_prefix.clone(),
            suffix_pattern: cfg.log_suffix_date.as_deref().map(go_layout_to_strftime),
            line_prefix_pattern: cfg.log_date.as_deref().map(go_layout_to_strftime),
            buffer_lines: cfg.buffer_lines(),
            remote: self.remote.lock().clone(),
            host: self.host.clone(),
        }
    }

    /// Spawn every supervised (non-one-time) task named in the current
    /// configuration that doesn't already have a live runtime. One-time
    /// tasks get a runtime too, but it has no loop to start.
    pub fn start_all(&self) {
        let cfg = self.store.load();
        let mut runtimes = self.runtimes.lock();
        for (name, def) in cfg.tasks.iter() {
            if runtimes.contains_key(name) {
                continue;
            }
            let runtime = if def.one_time {
                TaskRuntime::one_time(name.clone(), def.clone())
            } else {
                TaskRuntime::spawn(name.clone(), def.clone(), self.log_context(&cfg), self.shutdown_rx.clone())
            };
            runtimes.insert(name.clone(), runtime);
        }
    }

    /// A clone of the shutdown watch channel, for callers (such as the
    /// rotation scheduler) that need to stop in lockstep with the
    /// registry's own supervised loops.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<TaskRuntime>> {
        self.runtimes.lock().get(name).cloned()
    }

    /// All live runtimes, in configuration order — used by the rotation
    /// scheduler to fan a flush request out to every task.
    pub fn snapshot(&self) -> Vec<Arc<TaskRuntime>> {
        self.runtimes.lock().values().cloned().collect()
    }

    pub fn list_statuses(&self) -> IndexMap<String, TaskStatusView> {
        self.runtimes
            .lock()
            .iter()
            .map(|(name, runtime)| (name.clone(), runtime.status()))
            .collect()
    }

    pub fn log_context_for(&self, name: &str) -> Option<TaskLogContext> {
        self.get(name).map(|_| self.log_context(&self.store.load()))
    }

    /// Add a new task, persist it, and bring its runtime up.
    pub async fn install(&self, name: impl Into<String>, def: TaskDefinition) -> Result<(), RegistryError> {
        let name = name.into();
        if self.runtimes.lock().contains_key(&name) {
            return Err(RegistryError::AlreadyExists(name));
        }
        let cfg = self.store.mutate(|c| c.with_task(&name, def.clone()));
        self.store.save()?;

        let runtime = if def.one_time {
            TaskRuntime::one_time(name.clone(), def)
        } else {
            TaskRuntime::spawn(name.clone(), def, self.log_context(&cfg), self.shutdown_rx.clone())
        };
        self.runtimes.lock().insert(name, runtime);
        Ok(())
    }

    /// Tear down a task's runtime and remove it from the configuration.
    pub async fn remove(&self, name: &str) -> Result<(), RegistryError> {
        let runtime = self
            .runtimes
            .lock()
            .shift_remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        runtime.delete().await;
        self.store.mutate(|c| c.without_task(name));
        self.store.save()?;
        Ok(())
    }

    /// Broadcast shutdown to every supervised loop and wait for each to
    /// retire its children.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let runtimes: Vec<_> = self.runtimes.lock().values().cloned().collect();
        for runtime in runtimes {
            runtime.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(one_time: bool) -> TaskDefinition {
        TaskDefinition {
            command: "sleep".into(),
            args: vec!["5".into()],
            workdir: None,
            wait: 1,
            restart_pause: 0,
            start_time: 0,
            one_time,
        }
    }

    #[tokio::test]
    async fn install_then_remove_round_trips_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Configuration::default();
        cfg.logdir = dir.path().to_string_lossy().to_string();
        let store = Arc::new(ConfigStore::with_path(cfg, dir.path().join("config.json")));
        let registry = TaskRegistry::new(store.clone(), "localhost");

        registry.install("web", def(false)).await.unwrap();
        assert!(registry.get("web").is_some());
        assert_eq!(store.load().tasks.len(), 1);

        registry.remove("web").await.unwrap();
        assert!(registry.get("web").is_none());
        assert_eq!(store.load().tasks.len(), 0);
    }

    #[tokio::test]
    async fn install_rejects_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Configuration::default();
        cfg.logdir = dir.path().to_string_lossy().to_string();
        let store = Arc::new(ConfigStore::with_path(cfg, dir.path().join("config.json")));
        let registry = TaskRegistry::new(store, "localhost");

        registry.install("web", def(true)).await.unwrap();
        let second = registry.install("web", def(true)).await;
        assert!(matches!(second, Err(RegistryError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn shutdown_retires_all_runtimes() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Configuration::default();
        cfg.logdir = dir.path().to_string_lossy().to_string();
        let store = Arc::new(ConfigStore::with_path(cfg, dir.path().join("config.json")));
        let registry = TaskRegistry::new(store, "localhost");
        registry.install("web", def(false)).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(2), registry.shutdown())
            .await
            .expect("shutdown should complete promptly");
    }
}
