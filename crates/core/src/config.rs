// SPDX-License-Identifier: MIT

//! The configuration shape: what gets read from and written back to
//! the JSON configuration file, field-for-field.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::duration::ConfigDuration;

/// Default in-memory line buffer depth when `logbufferlines` is absent
/// or non-positive.
pub const DEFAULT_LOG_BUFFER_LINES: i64 = 10;

/// The full, immutable configuration snapshot. A `Configuration` value
/// is never mutated in place — `sv-storage::ConfigStore` replaces the
/// whole value atomically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Configuration {
    pub logdir: String,
    #[serde(rename = "logfileprefix", default)]
    pub log_file_prefix: String,
    #[serde(rename = "logsuffixdate", default, skip_serializing_if = "Option::is_none")]
    pub log_suffix_date: Option<String>,
    #[serde(rename = "logdate", default, skip_serializing_if = "Option::is_none")]
    pub log_date: Option<String>,
    #[serde(rename = "logreopen", default, skip_serializing_if = "Option::is_none")]
    pub log_reopen: Option<ConfigDuration>,
    #[serde(rename = "logbufferlines", default)]
    pub log_buffer_lines: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graylog: Option<GraylogConfig>,
    #[serde(default)]
    pub tasks: IndexMap<String, TaskDefinition>,
    #[serde(default)]
    pub limits: Vec<ResourceLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfig>,
}

impl Configuration {
    /// The effective line-buffer depth, applying the "defaults to 10 if
    /// ≤0" rule from the config contract.
    pub fn buffer_lines(&self) -> usize {
        if self.log_buffer_lines <= 0 {
            DEFAULT_LOG_BUFFER_LINES as usize
        } else {
            self.log_buffer_lines as usize
        }
    }

    /// Return a clone of this configuration with `name` inserted into
    /// (or replacing) its task map — the copy-on-write building block
    /// the registry's `install` uses.
    pub fn with_task(&self, name: impl Into<String>, def: TaskDefinition) -> Self {
        let mut next = self.clone();
        next.tasks.insert(name.into(), def);
        next
    }

    /// Return a clone of this configuration with `name` removed from
    /// its task map.
    pub fn without_task(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.tasks.shift_remove(name);
        next
    }
}

/// A single task's static definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDefinition {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    /// Terminate-grace seconds: upper bound between SIGTERM and SIGKILL.
    #[serde(default)]
    pub wait: u64,
    /// Seconds to sleep before restarting a finished/failed task.
    #[serde(rename = "restartPause", default)]
    pub restart_pause: u64,
    /// Seconds a freshly-started replacement must survive during a
    /// graceful restart before it's trusted.
    #[serde(rename = "startTime", default)]
    pub start_time: u64,
    #[serde(rename = "oneTime", default)]
    pub one_time: bool,
}

/// Remote log sink configuration (the "graylog" object in the config
/// file; drives the GELF wire framing in `sv-engine::gelf`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GraylogConfig {
    /// `host:port` of the remote datagram endpoint.
    pub remote: String,
    #[serde(default)]
    pub level: i32,
    #[serde(rename = "addfields", default)]
    pub add_fields: HashMap<String, serde_json::Value>,
}

/// Control-surface bind information. The transport itself is out of
/// this crate's scope; this struct only carries what a future HTTP
/// layer would need to bind and authenticate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HttpConfig {
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servercert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serverkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clientcert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// The named resource-limit kinds a configuration can set, mapped at
/// the `sv-engine::limits` boundary onto the matching `RLIMIT_*` constant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    AddressSpace,
    Core,
    Cpu,
    Data,
    FileSize,
    OpenFiles,
    Processes,
    Stack,
}

/// One entry of the `limits` array: `{type, cur, max}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimit {
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub cur: u64,
    pub max: u64,
}
