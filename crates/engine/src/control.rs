// SPDX-License-Identifier: MIT

//! The Control Adapter contract: the operations a control
//! surface offers against the task registry, independent of whatever
//! transport drives them. No transport is implemented here — an HTTP
//! layer built against this trait is out of scope.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use nix::sys::signal::Signal;
use sv_core::{TaskDefinition, TaskStatusView};

use crate::error::{ControlError, TaskError};
use crate::registry::TaskRegistry;

#[async_trait]
pub trait ControlAdapter: Send + Sync {
    /// Every task's current status, in configuration order.
    async fn list(&self) -> IndexMap<String, TaskStatusView>;

    /// A single task's current status.
    async fn status(&self, name: &str) -> Result<TaskStatusView, ControlError>;

    /// Forward a signal to the named task's active child. Dropped
    /// (not an error) if the child isn't currently able to receive it.
    async fn signal(&self, name: &str, sig: Signal) -> Result<(), ControlError>;

    /// Request a graceful castling restart.
    async fn restart(&self, name: &str) -> Result<(), ControlError>;

    /// Request the supervised loop stop restarting its child.
    async fn stop(&self, name: &str) -> Result<(), ControlError>;

    /// Request a log rotation for one task.
    async fn rotate(&self, name: &str) -> Result<(), ControlError>;

    /// Request a log rotation for every supervised task.
    async fn rotate_all(&self) -> Result<(), ControlError>;

    /// Run a one-time task's single invocation, optionally feeding
    /// `input` to its stdin.
    async fn run(&self, name: &str, input: Option<Vec<u8>>) -> Result<(), ControlError>;

    /// Add a new task definition and bring its runtime up.
    async fn install(&self, name: &str, def: TaskDefinition) -> Result<(), ControlError>;

    /// Tear down a task's runtime and remove its definition.
    async fn remove(&self, name: &str) -> Result<(), ControlError>;
}

pub struct RegistryControlAdapter {
    registry: Arc<TaskRegistry>,
}

impl RegistryControlAdapter {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }
}

fn map_task_error(e: TaskError) -> ControlError {
    match e {
        TaskError::IsOneTime => ControlError::NotAcceptable("task is one-time".into()),
        TaskError::NotOneTime => ControlError::NotAcceptable("task is not one-time".into()),
        TaskError::AlreadyRunning => ControlError::NotAcceptable("one-time task already running".into()),
        TaskError::Spawn(detail) => ControlError::NotAcceptable(format!("spawn failed: {detail}")),
    }
}

#[async_trait]
impl ControlAdapter for RegistryControlAdapter {
    async fn list(&self) -> IndexMap<String, TaskStatusView> {
        self.registry.list_statuses()
    }

    async fn status(&self, name: &str) -> Result<TaskStatusView, ControlError> {
        self.registry
            .get(name)
            .map(|r| r.status())
            .ok_or_else(|| ControlError::NotFound(name.to_string()))
    }

    async fn signal(&self, name: &str, sig: Signal) -> Result<(), ControlError> {
        let runtime = self.registry.get(name).ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        runtime.signal(sig).map_err(map_task_error)
    }

    async fn restart(&self, name: &str) -> Result<(), ControlError> {
        let runtime = self.registry.get(name).ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        runtime.restart().await.map_err(map_task_error)
    }

    async fn stop(&self, name: &str) -> Result<(), ControlError> {
        let runtime = self.registry.get(name).ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        runtime.stop().await.map_err(map_task_error)
    }

    async fn rotate(&self, name: &str) -> Result<(), ControlError> {
        let runtime = self.registry.get(name).ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        runtime.rotate().map_err(map_task_error)
    }

    async fn rotate_all(&self) -> Result<(), ControlError> {
        for runtime in self.registry.snapshot() {
            if !runtime.is_one_time() {
                let _ = runtime.rotate();
            }
        }
        Ok(())
    }

    async fn run(&self, name: &str, input: Option<Vec<u8>>) -> Result<(), ControlError> {
        let runtime = self.registry.get(name).ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        let log_ctx = self
            .registry
            .log_context_for(name)
            .ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        runtime.run(&log_ctx, input).await.map_err(map_task_error)
    }

    async fn install(&self, name: &str, def: TaskDefinition) -> Result<(), ControlError> {
        self.registry
            .install(name.to_string(), def)
            .await
            .map_err(|e| ControlError::NotAcceptable(e.to_string()))
    }

    async fn remove(&self, name: &str) -> Result<(), ControlError> {
        self.registry
            .remove(name)
            .await
            .map_err(|e| ControlError::NotAcceptable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use sv_core::Configuration;
    use sv_storage::ConfigStore;

    fn def(one_time: bool) -> TaskDefinition {
        TaskDefinition {
            command: "true".into(),
            args: vec![],
            workdir: None,
            wait: 1,
            restart_pause: 0,
            start_time: 0,
            one_time,
        }
    }

    #[tokio::test]
    async fn status_on_unknown_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Configuration::default();
        cfg.logdir = dir.path().to_string_lossy().to_string();
        let store = StdArc::new(ConfigStore::with_path(cfg, dir.path().join("config.json")));
        let registry = StdArc::new(TaskRegistry::new(store, "localhost"));
        let adapter = RegistryControlAdapter::new(registry);

        let result = adapter.status("nope").await;
        assert!(matches!(result, Err(ControlError::NotFound(_))));
    }

    #[tokio::test]
    async fn run_one_time_task_through_the_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Configuration::default();
        cfg.logdir = dir.path().to_string_lossy().to_string();
        let store = StdArc::new(ConfigStore::with_path(cfg, dir.path().join("config.json")));
        let registry = StdArc::new(TaskRegistry::new(store, "localhost"));
        let adapter = RegistryControlAdapter::new(registry);

        adapter.install("job", def(true)).await.unwrap();
        adapter.run("job", None).await.unwrap();
        let status = adapter.status("job").await.unwrap();
        assert_eq!(status.status, "finished");
    }
}
