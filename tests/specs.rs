// SPDX-License-Identifier: MIT

//! End-to-end scenarios driving real child processes, mirroring the
//! lettered walkthroughs that motivated the task runtime's state
//! machine, plus a handful of the cross-cutting properties the rest
//! of the crate's unit tests don't exercise on their own.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal;
use nix::unistd::Pid;
use sv_core::{Configuration, TaskDefinition};
use sv_engine::{ControlAdapter, RegistryControlAdapter, TaskRegistry};
use sv_storage::ConfigStore;

fn store_in(dir: &std::path::Path) -> Arc<ConfigStore> {
    let mut cfg = Configuration::default();
    cfg.logdir = dir.to_string_lossy().to_string();
    Arc::new(ConfigStore::with_path(cfg, dir.join("config.json")))
}

fn def(command: &str, args: &[&str]) -> TaskDefinition {
    TaskDefinition {
        command: command.into(),
        args: args.iter().map(|s| s.to_string()).collect(),
        workdir: None,
        wait: 1,
        restart_pause: 0,
        start_time: 0,
        one_time: false,
    }
}

fn pid_is_alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

/// Scenario A: a task that exits immediately keeps getting restarted,
/// and `started` only ever moves forward.
#[tokio::test]
async fn scenario_a_short_lived_task_keeps_restarting() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let registry = Arc::new(TaskRegistry::new(store, "localhost"));

    let mut task = def("sleep", &["1"]);
    task.restart_pause = 0;
    registry.install("echo-svc", task).await.unwrap();
    let runtime = registry.get("echo-svc").unwrap();

    let mut starts = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if let Some(started) = runtime.status().started {
            if starts.last() != Some(&started) {
                starts.push(started);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(starts.len() >= 3, "expected at least 3 distinct starts, saw {}", starts.len());
    assert!(starts.windows(2).all(|w| w[0] <= w[1]), "start timestamps must be non-decreasing");

    registry.shutdown().await;
}

/// Scenario B: graceful castling replaces the running process with a
/// new PID while the task keeps running.
#[tokio::test]
async fn scenario_b_graceful_castling_replaces_the_running_process() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let registry = Arc::new(TaskRegistry::new(store, "localhost"));

    let mut task = def("sh", &["-c", "trap : TERM; sleep 3600 & wait"]);
    task.wait = 2;
    task.start_time = 1;
    registry.install("web", task).await.unwrap();
    let runtime = registry.get("web").unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let p1 = runtime.pid().expect("task should have an active pid");

    runtime.restart().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut saw_validation = false;
    let mut reached_ok = false;
    while tokio::time::Instant::now() < deadline {
        let status = runtime.status().status;
        if status == "restart validation" {
            saw_validation = true;
        }
        if saw_validation && status == "restart ok" {
            reached_ok = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert!(reached_ok, "expected restart validation -> restart ok within the window");

    let p2 = runtime.pid().expect("a replacement child should be active");
    assert_ne!(p1, p2, "castling must replace the active pid");

    // The retiring instance traps SIGTERM, so it only actually dies once
    // the grace period elapses and SIGKILL is sent — allow up to `wait`
    // plus a margin for that to land.
    let kill_deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    while pid_is_alive(p1) && tokio::time::Instant::now() < kill_deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!pid_is_alive(p1), "the retired process must have been terminated");

    registry.shutdown().await;
}

/// Scenario C (new-instance-too-fast refusal): `StartTime=2`, a
/// command that behaves like `false` the second time it runs (a
/// marker file makes the first invocation the long-lived "main" and
/// every later one exit immediately, since a real `false` main could
/// never stay up long enough to observe its own PID). Issuing a
/// restart should reject the fast-exiting candidate, land on
/// `new instance exited too fast`, and leave the original untouched.
#[tokio::test]
async fn scenario_c_candidate_exiting_too_fast_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let registry = Arc::new(TaskRegistry::new(store, "localhost"));

    let marker = dir.path().join("seen");
    let script = format!(
        "if [ -e {0} ]; then exit 1; else touch {0}; trap : TERM; sleep 3600 & wait; fi",
        marker.display()
    );
    let mut task = def("sh", &["-c", &script]);
    task.start_time = 2;
    registry.install("flappy", task).await.unwrap();
    let runtime = registry.get("flappy").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let original_pid = runtime.pid().unwrap();

    runtime.restart().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut status = runtime.status().status;
    while status != "new instance exited too fast" && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(30)).await;
        status = runtime.status().status;
    }
    assert_eq!(status, "new instance exited too fast");
    assert_eq!(runtime.pid().unwrap(), original_pid, "original instance must remain active");

    registry.shutdown().await;
}

/// Scenario D: a one-time task fed stdin input writes exactly what it
/// was given to its log file and ends `finished`.
#[tokio::test]
async fn scenario_d_one_time_task_runs_with_input() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let registry = Arc::new(TaskRegistry::new(store, "localhost"));
    let adapter = RegistryControlAdapter::new(Arc::clone(&registry));

    let mut task = def("cat", &[]);
    task.one_time = true;
    adapter.install("ingest", task).await.unwrap();

    adapter.run("ingest", Some(b"hello\n".to_vec())).await.unwrap();

    let status = adapter.status("ingest").await.unwrap();
    assert_eq!(status.status, "finished");

    let log_path = dir.path().join("ingest");
    let contents = tokio::time::timeout(Duration::from_secs(1), wait_for_contents(&log_path))
        .await
        .expect("log file should appear");
    assert_eq!(contents, "hello\n");
}

async fn wait_for_contents(path: &std::path::Path) -> String {
    loop {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if !contents.is_empty() {
                return contents;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Scenario E: a SIGHUP-triggered rotation closes the current log file
/// and starts writing to a newly suffixed one.
#[tokio::test]
async fn scenario_e_rotation_opens_a_freshly_suffixed_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = Configuration::default();
    cfg.logdir = dir.path().to_string_lossy().to_string();
    cfg.log_suffix_date = Some("20060102-150405".into());
    let store = Arc::new(ConfigStore::with_path(cfg, dir.path().join("config.json")));
    let registry = Arc::new(TaskRegistry::new(store, "localhost"));

    registry.install("chatty", def("sh", &["-c", "i=0; while true; do echo line-$i; i=$((i+1)); sleep 0.1; done"])).await.unwrap();
    let runtime = registry.get("chatty").unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    runtime.rotate().unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("chatty"))
        .collect();
    assert!(entries.len() >= 1, "expected at least one suffixed log file");

    registry.shutdown().await;
}

/// Scenario F: deleting an active task terminates its child and wipes
/// it from both the live registry and the on-disk configuration.
#[tokio::test]
async fn scenario_f_delete_removes_runtime_and_config_entry() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let registry = Arc::new(TaskRegistry::new(store.clone(), "localhost"));

    let mut task = def("sleep", &["3600"]);
    task.wait = 1;
    registry.install("temp", task).await.unwrap();
    let runtime = registry.get("temp").unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let pid = runtime.pid().unwrap();

    let started = tokio::time::Instant::now();
    registry.remove("temp").await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(2), "delete should complete within wait + a small margin");
    assert!(registry.get("temp").is_none(), "runtime must be gone from the registry");
    assert!(!pid_is_alive(pid), "the deleted task's child must be terminated");
    assert!(!store.load().tasks.contains_key("temp"), "configuration on disk must no longer reference the task");
}

/// Property: concurrent readers of the configuration snapshot never
/// observe a torn or partially-applied write — each `load()` returns
/// either the old or the new snapshot, never a mix.
#[tokio::test]
async fn property_snapshot_reads_are_never_torn() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());

    let writer_store = Arc::clone(&store);
    let writer = tokio::spawn(async move {
        for i in 0..50 {
            let name = format!("task-{i}");
            let _ = writer_store.mutate(|c| {
                c.with_task(&name, TaskDefinition {
                    command: "true".into(),
                    args: vec![],
                    workdir: None,
                    wait: 1,
                    restart_pause: 0,
                    start_time: 0,
                    one_time: true,
                })
            });
        }
    });

    let reader_store = Arc::clone(&store);
    let reader = tokio::spawn(async move {
        for _ in 0..200 {
            let snapshot = reader_store.load();
            // Every task in a given snapshot must be one we actually
            // inserted — a torn read would show a corrupt/half map.
            for (name, _) in snapshot.tasks.iter() {
                assert!(name.starts_with("task-"));
            }
        }
    });

    writer.await.unwrap();
    reader.await.unwrap();
}

/// Property: `TaskRegistry::remove` is linearizable with respect to
/// `get` — once `remove` returns, no subsequent `get` can observe the
/// task.
#[tokio::test]
async fn property_delete_is_linearizable_with_lookups() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let registry = Arc::new(TaskRegistry::new(store, "localhost"));

    let mut task = def("true", &[]);
    task.one_time = true;
    registry.install("gone-soon", task).await.unwrap();

    registry.remove("gone-soon").await.unwrap();
    assert!(registry.get("gone-soon").is_none());
}

/// Property: a stop followed by a restart while stopped brings exactly
/// one live child back up — the live child exists iff the last control
/// event applied was `restart`, never two children racing each other.
#[tokio::test]
async fn property_stop_then_restart_leaves_exactly_one_live_child() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let registry = Arc::new(TaskRegistry::new(store, "localhost"));

    let mut task = def("sleep", &["3600"]);
    task.wait = 1;
    registry.install("worker", task).await.unwrap();
    let runtime = registry.get("worker").unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let p1 = runtime.pid().expect("task should be running before stop");

    runtime.stop().await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while runtime.status().status != "stopped" && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert_eq!(runtime.status().status, "stopped");
    assert!(runtime.pid().is_none(), "no child should be live while stopped");
    assert!(!pid_is_alive(p1), "the stopped child must have been terminated");

    runtime.restart().await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut p2 = None;
    while p2.is_none() && tokio::time::Instant::now() < deadline {
        p2 = runtime.pid();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    let p2 = p2.expect("restart while stopped should bring exactly one child back up");
    assert_ne!(p1, p2, "the revived child is a new process");
    assert!(pid_is_alive(p2), "the revived child must be alive");

    registry.shutdown().await;
}

/// Property: repeated stops while already stopped are idempotent — a
/// redundant stop never disturbs the "no live child" invariant, and a
/// restart afterward still brings back exactly one.
#[tokio::test]
async fn property_repeated_stop_then_restart_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let registry = Arc::new(TaskRegistry::new(store, "localhost"));

    let mut task = def("sleep", &["3600"]);
    task.wait = 1;
    registry.install("worker", task).await.unwrap();
    let runtime = registry.get("worker").unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    runtime.stop().await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while runtime.status().status != "stopped" && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert_eq!(runtime.status().status, "stopped");

    // A redundant stop while already stopped must be a no-op.
    runtime.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runtime.status().status, "stopped");
    assert!(runtime.pid().is_none());

    runtime.restart().await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut pid = None;
    while pid.is_none() && tokio::time::Instant::now() < deadline {
        pid = runtime.pid();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert!(pid.is_some(), "restart must revive exactly one live child");
    assert!(pid_is_alive(pid.unwrap()));

    registry.shutdown().await;
}

/// Property: rotation never drops a line that was in flight when the
/// rotate signal fires — every line sent before `close()` ends up in
/// one of the files that existed while the pipeline was open.
#[tokio::test]
async fn property_rotation_never_drops_a_line() {
    use sv_engine::log_pipeline::{LogLine, LogPipeline, LogPipelineContext};

    let dir = tempfile::tempdir().unwrap();
    let ctx = LogPipelineContext {
        logdir: dir.path().to_path_buf(),
        file_prefix: "task-".into(),
        task_name: "steady".into(),
        suffix_pattern: None,
        line_prefix_pattern: None,
        buffer_lines: 4,
        remote: None,
        host: "localhost".into(),
    };
    let pipeline = LogPipeline::open(ctx);
    let tx = pipeline.sender();
    for i in 0..20 {
        tx.send(LogLine::Text(format!("line-{i}"))).await.unwrap();
        if i == 10 {
            pipeline.rotate();
        }
    }
    drop(tx);
    pipeline.close().await;

    let contents = std::fs::read_to_string(dir.path().join("task-steady")).unwrap();
    for i in 0..20 {
        assert!(contents.contains(&format!("line-{i}")), "missing line-{i}");
    }
}
