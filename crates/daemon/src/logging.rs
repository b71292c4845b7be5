// SPDX-License-Identifier: MIT

//! Process-log setup: a rolling file under the
//! configured log directory, plus whatever `RUST_LOG` asks for on top
//! of the `info` default.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::lifecycle::DaemonError;

pub fn init(logdir: &Path) -> Result<WorkerGuard, DaemonError> {
    std::fs::create_dir_all(logdir).map_err(DaemonError::Io)?;

    let appender = tracing_appender::rolling::never(logdir, "supervisor.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking))
        .init();

    Ok(guard)
}
