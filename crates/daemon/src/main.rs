// SPDX-License-Identifier: MIT

//! svd: the process supervisor daemon.
//!
//! Loads the configuration, applies resource limits, brings every
//! task's runtime up, and then does nothing but wait on process
//! signals: SIGHUP rotates every task's log, SIGTERM/SIGINT shut the
//! whole thing down gracefully.

mod lifecycle;
mod logging;

use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = lifecycle::config_path();

    // Loaded before logging is set up, since the log directory itself
    // comes from the configuration file.
    let store = match lifecycle::load_config(&config_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("svd: failed to load {}: {e}", config_path.display());
            return Err(e.into());
        }
    };

    let logdir = std::path::PathBuf::from(&store.load().logdir);
    let _logging_guard = logging::init(&logdir)?;
    info!(config = %config_path.display(), "loaded configuration");

    let daemon = match lifecycle::bring_up(store).await {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(error = %e, "failed to start supervisor");
            return Err(e.into());
        }
    };
    info!("supervisor started");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let rotation = daemon.rotation.clone();
    let rotation_shutdown = daemon.registry.shutdown_signal();
    let rotation_task = tokio::spawn(async move { rotation.run(rotation_shutdown).await });
    let manual_rotate = daemon.rotation.trigger();

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, rotating all task logs");
                manual_rotate.notify_one();
            }
        }
    }

    daemon.registry.shutdown().await;
    let _ = rotation_task.await;
    info!("supervisor stopped");
    Ok(())
}
