// SPDX-License-Identifier: MIT

//! The seam errors `sv-engine`'s modules return — one enum per
//! component boundary, one variant per distinct failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GelfError {
    #[error("encoding gelf message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("message of {0} bytes exceeds the 65000 byte hard limit")]
    TooLarge(usize),
    #[error("compressing gelf payload: {0}")]
    Compress(std::io::Error),
    #[error("sending gelf datagram: {0}")]
    Send(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("spawning task: {0}")]
    Spawn(String),
    #[error("task is configured one-time; restart/stop/rotate do not apply")]
    IsOneTime,
    #[error("task is not one-time; run() does not apply")]
    NotOneTime,
    #[error("one-time task is already running")]
    AlreadyRunning,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no task named {0:?}")]
    NotFound(String),
    #[error("a task named {0:?} already exists")]
    AlreadyExists(String),
    #[error(transparent)]
    Store(#[from] sv_storage::StoreError),
}

/// Rejections a `ControlAdapter` call can surface to its caller,
/// shaped so a future HTTP layer can map each variant to a status
/// code without inspecting message text.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no task named {0:?}")]
    NotFound(String),
    #[error("not acceptable: {0}")]
    NotAcceptable(String),
}
