//! Drives the full dispatcher runtime loop against small shell scripts
//! standing in for `rr` replay workers, covering the six end-to-end
//! request sequences from the dispatcher's behavioral contract.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use codetracer_rr_dispatcher_core::{OutboundEvent, Role, RouterConfig, Task};
use dispatcher_engine::protocol::{task_from_request, RequestFrame};
use dispatcher_engine::worker_proxy::WorkerEvent;
use dispatcher_engine::{spawn_dispatcher, WorkerPool};

fn unique_path(label: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("dispatcher-e2e-{}-{label}-{n}", std::process::id()))
}

fn write_script(label: &str, body: &str) -> PathBuf {
    let path = unique_path(label);
    std::fs::write(&path, body).expect("write fake worker script");
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Replies `OK` to every command, after one `location` event.
fn obedient_worker() -> PathBuf {
    write_script(
        "obedient",
        "#!/bin/sh\necho READY\nwhile IFS= read -r _line; do\n  echo 'EVT location {\"tick\":1}'\n  echo OK\ndone\n",
    )
}

/// Like `obedient_worker`, but pauses briefly before replying, so a
/// task it's given stays `Busy` long enough for a test to race a second
/// request against it.
fn slow_worker() -> PathBuf {
    write_script(
        "slow",
        "#!/bin/sh\necho READY\nwhile IFS= read -r _line; do\n  sleep 0.3\n  echo 'EVT location {\"tick\":1}'\n  echo OK\ndone\n",
    )
}

/// Exits without replying to its first command (simulating a crash), but
/// behaves like `obedient_worker` on every subsequent process invocation
/// (tracked via a marker file, since the pool spawns a fresh process for
/// the worker that recovers the crashed one's role).
fn crash_once_worker() -> PathBuf {
    let marker = unique_path("crash-marker");
    write_script(
        "crash-once",
        &format!(
            "#!/bin/sh\nMARKER=\"{}\"\necho READY\nif [ ! -f \"$MARKER\" ]; then\n  touch \"$MARKER\"\n  read -r _line\n  exit 1\nfi\nwhile IFS= read -r _line; do\n  echo 'EVT location {{\"tick\":1}}'\n  echo OK\ndone\n",
            marker.display()
        ),
    )
}

/// Reports `tick:5000` then sleeps far longer than any test timeout on
/// its first process invocation (simulating a long-running jump that
/// gets killed by a reset); behaves like `obedient_worker` afterward.
fn slow_once_worker() -> PathBuf {
    let marker = unique_path("slow-marker");
    write_script(
        "slow-once",
        &format!(
            "#!/bin/sh\nMARKER=\"{}\"\necho READY\nif [ ! -f \"$MARKER\" ]; then\n  touch \"$MARKER\"\n  read -r _line\n  echo 'EVT location {{\"tick\":5000}}'\n  sleep 30\n  echo OK\n  exit 0\nfi\nwhile IFS= read -r _line; do\n  echo 'EVT location {{\"tick\":5000}}'\n  echo OK\ndone\n",
            marker.display()
        ),
    )
}

fn fast_config(pool_max: u32) -> RouterConfig {
    RouterConfig {
        pool_max,
        close_tracking_count: 0,
        interrupt_supported: false,
        cancel_timeout_ms: 50,
        start_timeout_ms: 2_000,
        kill_timeout_ms: 100,
        reset_last_location: false,
        close_tracking_proximity_ticks: 1_000,
    }
}

fn task(seq: u64, command: &str, arguments: serde_json::Value) -> Task {
    task_from_request(&RequestFrame { seq, command: command.to_string(), arguments }).expect("valid request")
}

async fn recv_event(rx: &mut mpsc::Receiver<OutboundEvent>) -> OutboundEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an outbound event")
        .expect("outbound channel closed unexpectedly")
}

/// Receives events, skipping `Unsolicited` ones, until one passes `pred`.
async fn recv_matching(
    rx: &mut mpsc::Receiver<OutboundEvent>,
    mut pred: impl FnMut(&OutboundEvent) -> bool,
) -> OutboundEvent {
    loop {
        let ev = recv_event(rx).await;
        if pred(&ev) {
            return ev;
        }
    }
}

struct Harness {
    task_tx: mpsc::Sender<Task>,
    outbound_rx: mpsc::Receiver<OutboundEvent>,
    handle: tokio::task::JoinHandle<()>,
}

async fn start(rr_binary: &Path, config: RouterConfig) -> Harness {
    start_with_pool_setup(rr_binary, config, |_pool| Box::pin(async {})).await
}

type PoolSetup<'a> = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + 'a>>;

async fn start_with_pool_setup<F>(rr_binary: &Path, config: RouterConfig, setup: F) -> Harness
where
    F: for<'a> FnOnce(&'a mut WorkerPool) -> PoolSetup<'a>,
{
    let (events_tx, events_rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let mut pool = WorkerPool::new(events_tx, rr_binary.to_string_lossy().into_owned(), std::env::temp_dir());
    setup(&mut pool).await;

    let (task_tx, task_rx) = mpsc::channel::<Task>(16);
    let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundEvent>(64);
    let handle = spawn_dispatcher(pool, config, task_rx, events_rx, outbound_tx);

    Harness { task_tx, outbound_rx, handle }
}

impl Harness {
    async fn send(&self, t: Task) {
        self.task_tx.send(t).await.expect("dispatcher still accepting tasks");
    }

    async fn shutdown(self) {
        drop(self.task_tx);
        let _ = timeout(Duration::from_secs(5), self.handle).await;
    }
}

#[tokio::test]
async fn step_then_reverse_step_ends_with_one_stable_worker() {
    let rr = obedient_worker();
    let mut h = start(&rr, fast_config(4)).await;

    h.send(task(1, "step-over", serde_json::Value::Null)).await;
    let first = recv_matching(&mut h.outbound_rx, |e| e.task_id().is_some()).await;
    assert!(matches!(first, OutboundEvent::TaskOk { task_id, .. } if task_id.0 == 1));

    h.send(task(2, "reverse-step-over", serde_json::Value::Null)).await;
    let second = recv_matching(&mut h.outbound_rx, |e| e.task_id().is_some()).await;
    assert!(matches!(second, OutboundEvent::TaskOk { task_id, .. } if task_id.0 == 2));

    h.shutdown().await;
}

#[tokio::test]
async fn jump_replaces_jump_when_interrupt_is_not_supported() {
    let rr = slow_worker();
    let mut h = start(&rr, fast_config(4)).await;

    h.send(task(1, "goto-tick", serde_json::json!({ "tick": 1000 }))).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.send(task(2, "goto-tick", serde_json::json!({ "tick": 2000 }))).await;

    let cancelled = recv_matching(&mut h.outbound_rx, |e| e.task_id().map(|id| id.0) == Some(1)).await;
    assert!(matches!(cancelled, OutboundEvent::Cancelled { .. }));

    let replaced = recv_matching(&mut h.outbound_rx, |e| e.task_id().map(|id| id.0) == Some(2)).await;
    assert!(matches!(replaced, OutboundEvent::TaskOk { .. }));

    h.shutdown().await;
}

#[tokio::test]
async fn info_task_is_queued_behind_a_step_task_when_pool_max_is_one() {
    let rr = obedient_worker();
    let mut h = start(&rr, fast_config(1)).await;

    h.send(task(1, "step-in", serde_json::Value::Null)).await;
    h.send(task(2, "locals", serde_json::Value::Null)).await;

    let first = recv_matching(&mut h.outbound_rx, |e| e.task_id().is_some()).await;
    assert!(matches!(first, OutboundEvent::TaskOk { task_id, .. } if task_id.0 == 1));

    let second = recv_matching(&mut h.outbound_rx, |e| e.task_id().is_some()).await;
    assert!(matches!(second, OutboundEvent::TaskOk { task_id, .. } if task_id.0 == 2));

    h.shutdown().await;
}

#[tokio::test]
async fn worker_crash_mid_jump_recovers_a_new_stable_worker() {
    let rr = crash_once_worker();
    let mut h = start(&rr, fast_config(4)).await;

    h.send(task(1, "goto-tick", serde_json::json!({ "tick": 9999 }))).await;
    let failed = recv_matching(&mut h.outbound_rx, |e| e.task_id().map(|id| id.0) == Some(1)).await;
    assert!(matches!(failed, OutboundEvent::WorkerFailed { .. }));

    h.send(task(2, "step-in", serde_json::Value::Null)).await;
    let recovered = recv_matching(&mut h.outbound_rx, |e| e.task_id().map(|id| id.0) == Some(2)).await;
    assert!(matches!(recovered, OutboundEvent::TaskOk { .. }));

    h.shutdown().await;
}

#[tokio::test]
async fn full_reset_cancels_the_in_flight_jump_and_restores_its_location() {
    let rr = slow_once_worker();
    let mut h = start(&rr, fast_config(4)).await;

    h.send(task(8, "goto-tick", serde_json::json!({ "tick": 5000 }))).await;
    // Synchronizes on the worker's location report, which is what sets
    // `last_known_tick` that `reset_last_location` reads back from.
    let _ = recv_matching(&mut h.outbound_rx, |e| matches!(e, OutboundEvent::Unsolicited { tag, .. } if tag == "location")).await;

    h.send(task(9, "full-reset", serde_json::json!({ "reset_last_location": true }))).await;

    let cancelled = recv_matching(&mut h.outbound_rx, |e| e.task_id().map(|id| id.0) == Some(8)).await;
    assert!(matches!(cancelled, OutboundEvent::Cancelled { .. }));

    let reset_done = recv_matching(&mut h.outbound_rx, |e| e.task_id().map(|id| id.0) == Some(9)).await;
    match reset_done {
        OutboundEvent::TaskOk { body, .. } => {
            assert_eq!(body["reset"], true);
            assert_eq!(body["tick"], 5000);
        }
        other => panic!("unexpected reset response: {other:?}"),
    }

    h.shutdown().await;
}

#[tokio::test]
async fn tracepoint_cannot_preempt_stable_or_step_behind_tracking() {
    let rr = obedient_worker();
    let mut h = start_with_pool_setup(&rr, fast_config(2), |pool| {
        Box::pin(async move {
            // Precondition from the scenario: both pool slots already
            // occupied by non-preemptable roles, with nothing `free` left
            // for a tracepoint sweep to run on.
            let stable = pool.spawn(Role::Stable, Duration::from_secs(2)).await.expect("spawn stable");
            let tracking = pool
                .spawn(Role::StepBehindTracking, Duration::from_secs(2))
                .await
                .expect("spawn step-behind-tracking");
            assert_ne!(stable, tracking);
        })
    })
    .await;

    h.send(task(7, "run-tracepoints", serde_json::Value::Null)).await;
    let rejected = recv_matching(&mut h.outbound_rx, |e| e.task_id().map(|id| id.0) == Some(7)).await;
    match rejected {
        OutboundEvent::Error { message, .. } => assert_eq!(message, "ResourceExhausted"),
        other => panic!("unexpected response: {other:?}"),
    }

    h.shutdown().await;
}
