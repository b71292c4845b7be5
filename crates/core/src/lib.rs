// SPDX-License-Identifier: MIT

//! sv-core: shared domain types for the process supervisor.
//!
//! Nothing in this crate spawns a process, opens a file, or sends a
//! datagram — it only defines the configuration shape, the status
//! vocabulary, and the small parsing helpers (durations, reference-time
//! templates) that both `sv-storage` and `sv-engine` build on.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod duration;
pub mod status;
pub mod time_fmt;

pub use config::{
    Configuration, GraylogConfig, HttpConfig, ResourceKind, ResourceLimit, TaskDefinition,
};
pub use duration::ConfigDuration;
pub use status::{TaskStatus, TaskStatusView};
