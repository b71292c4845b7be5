// SPDX-License-Identifier: MIT

//! The Log Pipeline: one per active task invocation. A
//! bounded channel decouples a child's stdout/stderr readers from the
//! file writer, so a slow disk back-pressures the child rather than
//! dropping lines; rotation is a coalesced `watch` signal the writer
//! checks between lines.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::gelf::RemoteLogSink;

/// One line read from a child's stdout or stderr.
#[derive(Debug, Clone)]
pub enum LogLine {
    Text(String),
}

/// Everything the writer task needs to know to open and name the
/// current log file and to forward a copy of each line to the remote
/// sink, if configured.
pub struct LogPipelineContext {
    pub logdir: PathBuf,
    pub file_prefix: String,
    pub task_name: String,
    /// `strftime`-style pattern (already translated from the
    /// configured reference-time layout) appended to the filename on
    /// each (re)open. `None` means one fixed filename for the life of
    /// the pipeline.
    pub suffix_pattern: Option<String>,
    /// `strftime`-style pattern prefixed to each line before it's
    /// written. `None` means lines are written verbatim.
    pub line_prefix_pattern: Option<String>,
    pub buffer_lines: usize,
    pub remote: Option<Arc<RemoteLogSink>>,
    pub host: String,
}

pub struct LogPipeline {
    line_tx: mpsc::Sender<LogLine>,
    rotate_tx: watch::Sender<u64>,
    writer: JoinHandle<()>,
}

impl LogPipeline {
    pub fn open(ctx: LogPipelineContext) -> Self {
        let (line_tx, line_rx) = mpsc::channel(ctx.buffer_lines.max(1));
        let (rotate_tx, rotate_rx) = watch::channel(0u64);
        let writer = tokio::spawn(run_writer(ctx, line_rx, rotate_rx));
        Self {
            line_tx,
            rotate_tx,
            writer,
        }
    }

    /// A clone of the producer endpoint — handed to each stdout/stderr
    /// reader task spawned for the active child.
    pub fn sender(&self) -> mpsc::Sender<LogLine> {
        self.line_tx.clone()
    }

    /// Request rotation. Non-blocking: repeated requests before the
    /// writer catches up coalesce into a single reopen, since `watch`
    /// only ever retains the latest value.
    pub fn rotate(&self) {
        let next = self.rotate_tx.borrow().wrapping_add(1);
        let _ = self.rotate_tx.send(next);
    }

    /// Drop the producer endpoint and wait for the writer to drain and
    /// exit. Safe to call once every reader that was handed a
    /// `sender()` clone has already finished (true once the
    /// invocation's children have exited).
    pub async fn close(self) {
        drop(self.line_tx);
        let _ = self.writer.await;
    }
}

fn current_path(ctx: &LogPipelineContext) -> PathBuf {
    let mut name = format!("{}{}", ctx.file_prefix, ctx.task_name);
    if let Some(pattern) = &ctx.suffix_pattern {
        name.push_str(&Local::now().format(pattern).to_string());
    }
    ctx.logdir.join(name)
}

/// Where a line actually lands. Opening the named file can fail (a
/// missing parent that can't be created, permissions, a full disk);
/// when it does, the pipeline keeps running and writes to standard
/// output instead rather than dropping the task's output entirely.
enum LogTarget {
    File(File),
    Stdout,
}

fn open_current(ctx: &LogPipelineContext) -> LogTarget {
    if let Err(e) = std::fs::create_dir_all(&ctx.logdir) {
        tracing::warn!(task = %ctx.task_name, error = %e, "creating log directory failed, falling back to stdout");
        return LogTarget::Stdout;
    }
    let path = current_path(ctx);
    match OpenOptions::new().create(true).append(true).mode(0o600).open(&path) {
        Ok(f) => LogTarget::File(f),
        Err(e) => {
            tracing::warn!(task = %ctx.task_name, path = %path.display(), error = %e, "opening log file failed, falling back to stdout");
            LogTarget::Stdout
        }
    }
}

async fn run_writer(
    ctx: LogPipelineContext,
    mut line_rx: mpsc::Receiver<LogLine>,
    mut rotate_rx: watch::Receiver<u64>,
) {
    let mut target = open_current(&ctx);
    rotate_rx.borrow_and_update();

    loop {
        tokio::select! {
            changed = rotate_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                target = open_current(&ctx);
            }
            line = line_rx.recv() => {
                match line {
                    Some(LogLine::Text(text)) => write_and_forward(&ctx, &mut target, &text).await,
                    None => break,
                }
            }
        }
    }
}

async fn write_and_forward(ctx: &LogPipelineContext, target: &mut LogTarget, text: &str) {
    let rendered = match &ctx.line_prefix_pattern {
        Some(pattern) => format!("{} {}", Local::now().format(pattern), text),
        None => text.to_string(),
    };

    let write_result = match target {
        LogTarget::File(f) => writeln!(f, "{rendered}"),
        LogTarget::Stdout => writeln!(std::io::stdout(), "{rendered}"),
    };
    if let Err(e) = write_result {
        tracing::error!(task = %ctx.task_name, error = %e, "log write failed");
    }

    if let Some(sink) = ctx.remote.clone() {
        let host = ctx.host.clone();
        let task = ctx.task_name.clone();
        let message = rendered;
        let timestamp = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        tokio::spawn(async move {
            if let Err(e) = sink.send(&host, &task, &message, timestamp).await {
                tracing::warn!(task = %task, error = %e, "remote log send failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_lines_to_the_named_file_and_closes_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = LogPipelineContext {
            logdir: dir.path().to_path_buf(),
            file_prefix: "task-".into(),
            task_name: "web".into(),
            suffix_pattern: None,
            line_prefix_pattern: None,
            buffer_lines: 10,
            remote: None,
            host: "localhost".into(),
        };
        let pipeline = LogPipeline::open(ctx);
        let tx = pipeline.sender();
        tx.send(LogLine::Text("hello".into())).await.unwrap();
        tx.send(LogLine::Text("world".into())).await.unwrap();
        drop(tx);
        pipeline.close().await;

        let contents = std::fs::read_to_string(dir.path().join("task-web")).unwrap();
        assert_eq!(contents, "hello\nworld\n");
    }

    #[tokio::test]
    async fn rotate_reopens_a_suffixed_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = LogPipelineContext {
            logdir: dir.path().to_path_buf(),
            file_prefix: "task-".into(),
            task_name: "web".into(),
            suffix_pattern: Some("-%Y".into()),
            line_prefix_pattern: None,
            buffer_lines: 10,
            remote: None,
            host: "localhost".into(),
        };
        let pipeline = LogPipeline::open(ctx);
        let tx = pipeline.sender();
        tx.send(LogLine::Text("first".into())).await.unwrap();
        tokio::task::yield_now().await;
        pipeline.rotate();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send(LogLine::Text("second".into())).await.unwrap();
        drop(tx);
        pipeline.close().await;

        let year = Local::now().format("-%Y").to_string();
        let contents = std::fs::read_to_string(dir.path().join(format!("task-web{year}"))).unwrap();
        assert!(contents.contains("first"));
        assert!(contents.contains("second"));
    }
}
