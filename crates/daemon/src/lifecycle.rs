// SPDX-License-Identifier: MIT

//! Startup sequencing: locate and load the configuration file, apply
//! resource limits once, bring the task registry up, and hand back
//! everything `main` needs to run the signal loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sv_engine::{apply_limits, RotationScheduler, TaskRegistry};
use sv_storage::{ConfigStore, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("loading configuration: {0}")]
    Config(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Daemon {
    pub registry: Arc<TaskRegistry>,
    pub rotation: Arc<RotationScheduler>,
}

/// Where to find the configuration file: `$SV_CONFIG`, falling back to
/// `./supervisor.json`.
pub fn config_path() -> PathBuf {
    std::env::var_os("SV_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("supervisor.json"))
}

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Load and parse the configuration file. Kept separate from
/// `bring_up` so `main` can set up logging (which needs the loaded
/// `logdir`) before anything that might log is started.
pub fn load_config(path: &std::path::Path) -> Result<Arc<ConfigStore>, DaemonError> {
    Ok(Arc::new(ConfigStore::load_from_path(path)?))
}

/// Apply resource limits, connect the remote log sink (best-effort),
/// and spawn every task's runtime.
pub async fn bring_up(store: Arc<ConfigStore>) -> Result<Daemon, DaemonError> {
    let cfg = store.load();

    apply_limits(&cfg.limits);

    let registry = Arc::new(TaskRegistry::new(Arc::clone(&store), local_hostname()));
    if let Err(e) = registry.init_remote_sink().await {
        tracing::warn!(error = %e, "remote log sink unavailable, continuing without it");
    }
    registry.start_all();

    let period = cfg.log_reopen.map(|d| {
        let secs = d.as_duration().as_secs();
        Duration::from_secs(secs.max(1))
    });
    let rotation = Arc::new(RotationScheduler::new(Arc::clone(&registry), period));

    Ok(Daemon { registry, rotation })
}
