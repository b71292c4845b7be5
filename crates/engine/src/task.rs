// SPDX-License-Identifier: MIT

//! The Task Runtime state machine: a two-slot "castling"
//! supervisor that keeps a task's process alive, restarts it on exit,
//! and performs graceful zero-downtime replacement by starting a
//! candidate in the spare slot before retiring the active one.

use std::future::pending;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use sv_core::{TaskDefinition, TaskStatus, TaskStatusView};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Duration;

use crate::error::TaskError;
use crate::log_pipeline::{LogLine, LogPipeline, LogPipelineContext};

/// Which of the two child slots is currently serving traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveSlot {
    Main,
    Spare,
}

impl ActiveSlot {
    fn other(self) -> Self {
        match self {
            ActiveSlot::Main => ActiveSlot::Spare,
            ActiveSlot::Spare => ActiveSlot::Main,
        }
    }
}

struct SpawnedChild {
    pid: i32,
    started_at: DateTime<Utc>,
    exit_rx: oneshot::Receiver<io::Result<ExitStatus>>,
}

/// The published, externally observable state of a `TaskRuntime`.
struct TaskShared {
    status: Mutex<TaskStatus>,
    started: Mutex<Option<DateTime<Utc>>>,
    finished: Mutex<Option<DateTime<Utc>>>,
    stopped: AtomicBool,
    one_time_in_flight: Mutex<bool>,
    /// PID of whichever child currently occupies the active slot, or 0
    /// when none does. Exposed for observability (e.g. confirming a
    /// castling transition actually replaced the running process).
    active_pid: AtomicI32,
}

impl TaskShared {
    fn new() -> Self {
        Self {
            status: Mutex::new(TaskStatus::NotStarted),
            started: Mutex::new(None),
            finished: Mutex::new(None),
            stopped: AtomicBool::new(false),
            one_time_in_flight: Mutex::new(false),
            active_pid: AtomicI32::new(0),
        }
    }

    fn set_status(&self, status: TaskStatus) {
        *self.status.lock() = status;
    }

    fn view(&self) -> TaskStatusView {
        TaskStatusView::new(&self.status.lock(), *self.started.lock(), *self.finished.lock())
    }
}

/// A supervised (or one-time) task and its control surface.
pub struct TaskRuntime {
    name: String,
    definition: TaskDefinition,
    shared: Arc<TaskShared>,
    signal_tx: Option<mpsc::Sender<Signal>>,
    restart_tx: Option<mpsc::Sender<()>>,
    stop_tx: Option<mpsc::Sender<()>>,
    flush_tx: Option<watch::Sender<u64>>,
    /// A one-time task's own signal/stop receivers, parked here between
    /// invocations. There is no supervised loop to own them, so each
    /// `run()` borrows them out for the duration of its single
    /// invocation and parks them back when it finishes.
    signal_rx: Mutex<Option<mpsc::Receiver<Signal>>>,
    stop_rx: Mutex<Option<mpsc::Receiver<()>>>,
    delete: Arc<Notify>,
    loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Everything a `TaskRuntime` needs from the rest of the process to
/// build the `LogPipelineContext` for its invocation(s).
#[derive(Clone)]
pub struct TaskLogContext {
    pub logdir: std::path::PathBuf,
    pub file_prefix: String,
    pub suffix_pattern: Option<String>,
    pub line_prefix_pattern: Option<String>,
    pub buffer_lines: usize,
    pub remote: Option<Arc<crate::gelf::RemoteLogSink>>,
    pub host: String,
}

impl TaskLogContext {
    fn pipeline_context(&self, task_name: &str) -> LogPipelineContext {
        LogPipelineContext {
            logdir: self.logdir.clone(),
            file_prefix: self.file_prefix.clone(),
            task_name: task_name.to_string(),
            suffix_pattern: self.suffix_pattern.clone(),
            line_prefix_pattern: self.line_prefix_pattern.clone(),
            buffer_lines: self.buffer_lines,
            remote: self.remote.clone(),
            host: self.host.clone(),
        }
    }
}

impl TaskRuntime {
    /// Start the supervised loop for a non-one-time task. The returned
    /// runtime owns the loop's control channels; its `JoinHandle` is
    /// awaited by `shutdown`.
    pub fn spawn(
        name: impl Into<String>,
        definition: TaskDefinition,
        log_ctx: TaskLogContext,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let name = name.into();
        let shared = Arc::new(TaskShared::new());
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let (restart_tx, restart_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = mpsc::channel(8);
        let (flush_tx, flush_rx) = watch::channel(0u64);
        let delete = Arc::new(Notify::new());

        let loop_shared = Arc::clone(&shared);
        let loop_name = name.clone();
        let loop_def = definition.clone();
        let loop_delete = Arc::clone(&delete);
        let handle = tokio::spawn(run_loop(
            loop_shared,
            loop_name,
            loop_def,
            log_ctx,
            signal_rx,
            restart_rx,
            stop_rx,
            flush_rx,
            shutdown_rx,
            loop_delete,
        ));

        Arc::new(Self {
            name,
            definition,
            shared,
            signal_tx: Some(signal_tx),
            restart_tx: Some(restart_tx),
            stop_tx: Some(stop_tx),
            flush_tx: Some(flush_tx),
            signal_rx: Mutex::new(None),
            stop_rx: Mutex::new(None),
            delete,
            loop_handle: Mutex::new(Some(handle)),
        })
    }

    /// Build a handle for a one-time task. There is no supervised loop
    /// — each call to `run` drives a single invocation directly, building
    /// its own `LogPipelineContext` from the context passed there. A
    /// signal or stop request can still reach the invocation while it's
    /// running; only `restart` and `rotate-log` are rejected outright
    /// since neither makes sense for a task with no supervised slot.
    pub fn one_time(name: impl Into<String>, definition: TaskDefinition) -> Arc<Self> {
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(8);
        Arc::new(Self {
            name: name.into(),
            definition,
            shared: Arc::new(TaskShared::new()),
            signal_tx: Some(signal_tx),
            restart_tx: None,
            stop_tx: Some(stop_tx),
            flush_tx: None,
            signal_rx: Mutex::new(Some(signal_rx)),
            stop_rx: Mutex::new(Some(stop_rx)),
            delete: Arc::new(Notify::new()),
            loop_handle: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &TaskDefinition {
        &self.definition
    }

    pub fn is_one_time(&self) -> bool {
        self.definition.one_time
    }

    pub fn status(&self) -> TaskStatusView {
        self.shared.view()
    }

    /// The PID of the child currently occupying the active slot, if
    /// any is running.
    pub fn pid(&self) -> Option<i32> {
        match self.shared.active_pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Non-blocking signal delivery to the active slot's child. Dropped
    /// silently (and logged) if the channel is momentarily full.
    pub fn signal(&self, sig: Signal) -> Result<(), TaskError> {
        let tx = self.signal_tx.as_ref().ok_or(TaskError::IsOneTime)?;
        if tx.try_send(sig).is_err() {
            tracing::warn!(task = %self.name, "signal dropped, task not ready to receive it");
        }
        Ok(())
    }

    pub async fn restart(&self) -> Result<(), TaskError> {
        let tx = self.restart_tx.as_ref().ok_or(TaskError::IsOneTime)?;
        let _ = tx.send(()).await;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), TaskError> {
        let tx = self.stop_tx.as_ref().ok_or(TaskError::IsOneTime)?;
        let _ = tx.send(()).await;
        Ok(())
    }

    pub fn rotate(&self) -> Result<(), TaskError> {
        let tx = self.flush_tx.as_ref().ok_or(TaskError::IsOneTime)?;
        let next = tx.borrow().wrapping_add(1);
        let _ = tx.send(next);
        Ok(())
    }

    /// Run a one-time task's single invocation. Rejected if another
    /// invocation is already in flight.
    pub async fn run(&self, log_ctx: &TaskLogContext, input: Option<Vec<u8>>) -> Result<(), TaskError> {
        if !self.is_one_time() {
            return Err(TaskError::NotOneTime);
        }
        {
            let mut in_flight = self.shared.one_time_in_flight.lock();
            if *in_flight {
                return Err(TaskError::AlreadyRunning);
            }
            *in_flight = true;
        }

        let result = self.run_once_inner(log_ctx, input).await;

        *self.shared.one_time_in_flight.lock() = false;
        result
    }

    async fn run_once_inner(&self, log_ctx: &TaskLogContext, input: Option<Vec<u8>>) -> Result<(), TaskError> {
        self.shared.set_status(TaskStatus::Starting);
        let pipeline = LogPipeline::open(log_ctx.pipeline_context(&self.name));
        let spawned = match spawn_child(&self.definition, &pipeline, input) {
            Ok(c) => c,
            Err(e) => {
                self.shared.set_status(TaskStatus::StartFailed(e.to_string()));
                pipeline.close().await;
                return Err(e);
            }
        };
        *self.shared.started.lock() = Some(spawned.started_at);
        self.shared.set_status(TaskStatus::Started);
        self.shared.active_pid.store(spawned.pid, Ordering::Release);

        let mut signal_rx = self.signal_rx.lock().take();
        let mut stop_rx = self.stop_rx.lock().take();
        let grace = Duration::from_secs(self.definition.wait.max(1));
        let pid = spawned.pid;
        let mut exit_rx = spawned.exit_rx;

        let status = loop {
            tokio::select! {
                status = &mut exit_rx => {
                    break status.unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "exit watcher dropped")));
                }
                Some(sig) = recv_opt(&mut signal_rx) => {
                    if let Err(e) = signal::kill(Pid::from_raw(pid), sig) {
                        tracing::error!(task = %self.name, error = %e, "signal delivery failed");
                    }
                }
                Some(()) = recv_opt(&mut stop_rx) => {
                    break terminate_gracefully(pid, &mut exit_rx, grace).await;
                }
            }
        };

        self.shared.active_pid.store(0, Ordering::Release);
        *self.shared.finished.lock() = Some(Utc::now());
        pipeline.close().await;
        *self.signal_rx.lock() = signal_rx;
        *self.stop_rx.lock() = stop_rx;

        match status {
            Ok(exit) if exit.success() => {
                self.shared.set_status(TaskStatus::Finished);
            }
            Ok(exit) => {
                self.shared.set_status(TaskStatus::FinishedWithError(describe_exit(exit)));
            }
            Err(e) => {
                self.shared.set_status(TaskStatus::FinishedWithError(e.to_string()));
            }
        }
        Ok(())
    }

    /// Signal the supervised loop to terminate its children and exit,
    /// and wait for it to do so. No-op for one-time tasks.
    pub async fn shutdown(&self) {
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Wake the loop's delete branch (used by the registry on
    /// `remove`); the loop terminates its children the same way a
    /// shutdown does.
    pub async fn delete(&self) {
        self.delete.notify_one();
        self.shutdown().await;
    }
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        format!("exit status {code}")
    } else if let Some(sig) = status.signal() {
        format!("killed by signal {sig}")
    } else {
        "unknown exit".to_string()
    }
}

fn spawn_child(
    def: &TaskDefinition,
    pipeline: &LogPipeline,
    input: Option<Vec<u8>>,
) -> Result<SpawnedChild, TaskError> {
    let mut cmd = Command::new(&def.command);
    cmd.args(&def.args);
    if let Some(workdir) = &def.workdir {
        cmd.current_dir(workdir);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() });
    cmd.kill_on_drop(false);

    let mut child = cmd.spawn().map_err(|e| TaskError::Spawn(e.to_string()))?;
    let pid = child
        .id()
        .ok_or_else(|| TaskError::Spawn("child exited before pid was observed".into()))? as i32;

    if let Some(bytes) = input {
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                let _ = stdin.write_all(&bytes).await;
            });
        }
    }

    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, pipeline.sender());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, pipeline.sender());
    }

    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::spawn(async move {
        let status = child.wait().await;
        let _ = exit_tx.send(status);
    });

    Ok(SpawnedChild {
        pid,
        started_at: Utc::now(),
        exit_rx,
    })
}

fn spawn_line_reader<R>(stream: R, tx: mpsc::Sender<LogLine>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(LogLine::Text(line)).await.is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    });
}

async fn terminate_gracefully(
    pid: i32,
    exit_rx: &mut oneshot::Receiver<io::Result<ExitStatus>>,
    grace: Duration,
) -> io::Result<ExitStatus> {
    let dropped = || io::Error::new(io::ErrorKind::Other, "exit watcher dropped");
    let _ = signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
    match tokio::time::timeout(grace, &mut *exit_rx).await {
        Ok(status) => status.unwrap_or_else(|_| Err(dropped())),
        Err(_) => {
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
            exit_rx.await.unwrap_or_else(|_| Err(dropped()))
        }
    }
}

/// Await a channel that may not exist for this runtime (e.g. a
/// supervised slot with no active child); `None` behaves like a
/// channel nobody ever sends on.
async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(r) => r.recv().await,
        None => pending().await,
    }
}

async fn wait_exit(slot: &mut Option<SpawnedChild>) -> io::Result<ExitStatus> {
    match slot {
        Some(c) => (&mut c.exit_rx)
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "exit watcher dropped"))),
        None => pending().await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    shared: Arc<TaskShared>,
    name: String,
    def: TaskDefinition,
    log_ctx: TaskLogContext,
    mut signal_rx: mpsc::Receiver<Signal>,
    mut restart_rx: mpsc::Receiver<()>,
    mut stop_rx: mpsc::Receiver<()>,
    mut flush_rx: watch::Receiver<u64>,
    mut shutdown_rx: watch::Receiver<bool>,
    delete: Arc<Notify>,
) {
    let pipeline = LogPipeline::open(log_ctx.pipeline_context(&name));
    let mut active = ActiveSlot::Main;
    let mut main_child: Option<SpawnedChild> = None;
    let mut spare_child: Option<SpawnedChild> = None;
    let restart_pause = Duration::from_secs(def.restart_pause);
    let wait_grace = Duration::from_secs(def.wait.max(1));
    let start_time = Duration::from_secs(def.start_time);

    'outer: loop {
        if !shared.stopped.load(Ordering::Acquire) {
            let slot_empty = match active {
                ActiveSlot::Main => main_child.is_none(),
                ActiveSlot::Spare => spare_child.is_none(),
            };
            if slot_empty {
                shared.set_status(TaskStatus::Starting);
                match spawn_child(&def, &pipeline, None) {
                    Ok(c) => {
                        *shared.started.lock() = Some(c.started_at);
                        shared.set_status(TaskStatus::Started);
                        shared.active_pid.store(c.pid, Ordering::Release);
                        match active {
                            ActiveSlot::Main => main_child = Some(c),
                            ActiveSlot::Spare => spare_child = Some(c),
                        }
                    }
                    Err(e) => {
                        shared.set_status(TaskStatus::StartFailed(e.to_string()));
                        tokio::time::sleep(restart_pause).await;
                        continue 'outer;
                    }
                }
            }
        }

        let mut pause_after = false;

        tokio::select! {
            status = wait_exit(&mut main_child) => {
                main_child = None;
                *shared.finished.lock() = Some(Utc::now());
                if active == ActiveSlot::Main {
                    record_exit(&shared, status);
                    shared.active_pid.store(0, Ordering::Release);
                    pause_after = true;
                } else {
                    tracing::info!(task = %name, "retired instance exited");
                }
            }
            status = wait_exit(&mut spare_child) => {
                spare_child = None;
                *shared.finished.lock() = Some(Utc::now());
                if active == ActiveSlot::Spare {
                    record_exit(&shared, status);
                    shared.active_pid.store(0, Ordering::Release);
                    pause_after = true;
                } else {
                    tracing::info!(task = %name, "retired instance exited");
                }
            }
            Some(sig) = signal_rx.recv() => {
                let pid = match active {
                    ActiveSlot::Main => main_child.as_ref().map(|c| c.pid),
                    ActiveSlot::Spare => spare_child.as_ref().map(|c| c.pid),
                };
                match pid {
                    Some(pid) => {
                        if let Err(e) = signal::kill(Pid::from_raw(pid), sig) {
                            tracing::error!(task = %name, error = %e, "signal delivery failed");
                        }
                    }
                    None => tracing::error!(task = %name, "signal requested but active slot has no child"),
                }
            }
            Some(()) = stop_rx.recv() => {
                shared.stopped.store(true, Ordering::Release);
                let retiring = match active {
                    ActiveSlot::Main => main_child.take(),
                    ActiveSlot::Spare => spare_child.take(),
                };
                shared.active_pid.store(0, Ordering::Release);
                if let Some(mut child) = retiring {
                    let _ = terminate_gracefully(child.pid, &mut child.exit_rx, wait_grace).await;
                }
                shared.set_status(TaskStatus::Stopped);
            }
            Some(()) = restart_rx.recv() => {
                if shared.stopped.load(Ordering::Acquire) {
                    shared.stopped.store(false, Ordering::Release);
                } else {
                    do_castling(&shared, &name, &def, &pipeline, &mut active, &mut main_child, &mut spare_child, start_time, wait_grace).await;
                }
            }
            Ok(()) = flush_rx.changed() => {
                pipeline.rotate();
            }
            Ok(()) = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break 'outer;
                }
            }
            _ = delete.notified() => {
                break 'outer;
            }
        }

        if pause_after {
            tokio::time::sleep(restart_pause).await;
        }
    }

    terminate_both(&mut main_child, &mut spare_child, wait_grace).await;
    pipeline.close().await;
}

fn record_exit(shared: &TaskShared, status: io::Result<ExitStatus>) {
    match status {
        Ok(exit) if exit.success() => shared.set_status(TaskStatus::Finished),
        Ok(exit) => shared.set_status(TaskStatus::FinishedWithError(describe_exit(exit))),
        Err(e) => shared.set_status(TaskStatus::FinishedWithError(e.to_string())),
    }
}

#[allow(clippy::too_many_arguments)]
async fn do_castling(
    shared: &TaskShared,
    name: &str,
    def: &TaskDefinition,
    pipeline: &LogPipeline,
    active: &mut ActiveSlot,
    main_child: &mut Option<SpawnedChild>,
    spare_child: &mut Option<SpawnedChild>,
    start_time: Duration,
    wait_grace: Duration,
) {
    shared.set_status(TaskStatus::RestartValidation);
    let candidate = match spawn_child(def, pipeline, None) {
        Ok(c) => c,
        Err(e) => {
            shared.set_status(TaskStatus::NewInstanceFailed);
            tracing::error!(task = %name, error = %e, "castling candidate failed to start");
            return;
        }
    };

    let mut candidate = candidate;
    let candidate_pid = candidate.pid;
    match tokio::time::timeout(start_time, &mut candidate.exit_rx).await {
        Ok(status) => {
            shared.set_status(TaskStatus::NewInstanceExitedTooFast);
            tracing::warn!(task = %name, status = ?status, "castling candidate exited before start_time elapsed");
        }
        Err(_) => {
            let inactive = active.other();
            match inactive {
                ActiveSlot::Main => *main_child = Some(candidate),
                ActiveSlot::Spare => *spare_child = Some(candidate),
            }
            let retiring = match *active {
                ActiveSlot::Main => main_child.take(),
                ActiveSlot::Spare => spare_child.take(),
            };
            *active = inactive;
            shared.active_pid.store(candidate_pid, Ordering::Release);
            shared.set_status(TaskStatus::RestartOk);
            if let Some(mut old) = retiring {
                let _ = terminate_gracefully(old.pid, &mut old.exit_rx, wait_grace).await;
            }
        }
    }
}

async fn terminate_both(main_child: &mut Option<SpawnedChild>, spare_child: &mut Option<SpawnedChild>, grace: Duration) {
    let main_fut = async {
        if let Some(mut c) = main_child.take() {
            let _ = terminate_gracefully(c.pid, &mut c.exit_rx, grace).await;
        }
    };
    let spare_fut = async {
        if let Some(mut c) = spare_child.take() {
            let _ = terminate_gracefully(c.pid, &mut c.exit_rx, grace).await;
        }
    };
    tokio::join!(main_fut, spare_fut);
}
