//! The runtime loop wiring C1-C5 together: a single owner of mutable
//! state, driven by one `tokio::select!`; everyone else talks to it over
//! channels.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant as TokioInstant;

use codetracer_rr_dispatcher_core::{
    ConfigUpdate, ControlOp, DispatchAction, DispatchError, OutboundEvent, Role, RouterConfig, Task,
    TaskId, TaskKind, WorkerId, WorkerState,
};

use crate::pool::{InternalTask, WorkerPool};
use crate::reset;
use crate::router::{self, PoolView};
use crate::worker_proxy::{WorkerEvent, WorkerLine};

/// Everything the dispatcher owns exclusively; no other task ever touches
/// these fields directly.
pub struct DispatcherState {
    pub pool: WorkerPool,
    pub config: RouterConfig,
    /// Maps a task currently running on a worker back to that worker, so
    /// a worker event can be correlated to the task it completes.
    pub inflight: HashMap<TaskId, WorkerId>,
    /// Reverse of `inflight`, needed when a worker reports a terminal line
    /// with no task context of its own.
    pub worker_task: HashMap<WorkerId, TaskId>,
    pub last_known_tick: u64,
}

impl DispatcherState {
    pub fn new(pool: WorkerPool, config: RouterConfig) -> Self {
        Self {
            pool,
            config,
            inflight: HashMap::new(),
            worker_task: HashMap::new(),
            last_known_tick: 0,
        }
    }
}

/// Internal message fed into the dispatcher's one `tokio::select!`, on top
/// of the shared worker-event channel.
enum Signal {
    Task(Task),
    Worker(WorkerEvent),
    InterruptTimeout { worker: WorkerId, task_id: TaskId },
}

/// Runs the dispatcher loop to completion: processes tasks and worker
/// events until a `shutdown` control task, client EOF, or a `Fatal` error.
pub async fn run(
    mut state: DispatcherState,
    mut task_rx: mpsc::Receiver<Task>,
    mut worker_events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    outbound_tx: mpsc::Sender<OutboundEvent>,
) {
    let (timeout_tx, mut timeout_rx) = mpsc::unbounded_channel::<(WorkerId, TaskId)>();
    let mut shutdown_requested = false;

    loop {
        let signal = tokio::select! {
            biased;
            Some((worker, task_id)) = timeout_rx.recv() => Signal::InterruptTimeout { worker, task_id },
            Some(ev) = worker_events_rx.recv() => Signal::Worker(ev),
            maybe_task = task_rx.recv() => match maybe_task {
                Some(task) => Signal::Task(task),
                None => {
                    tracing::info!("intake channel closed; shutting down");
                    break;
                }
            },
        };

        match signal {
            Signal::Task(task) => {
                if handle_task(&mut state, task, &outbound_tx, &timeout_tx).await {
                    shutdown_requested = true;
                    break;
                }
            }
            Signal::Worker(ev) => {
                handle_worker_event(&mut state, ev, &outbound_tx).await;
            }
            Signal::InterruptTimeout { worker, task_id } => {
                handle_interrupt_timeout(&mut state, worker, task_id, &outbound_tx).await;
            }
        }
    }

    state.pool.terminate_all(Duration::from_millis(state.config.kill_timeout_ms)).await;
    // A `shutdown` control task already got its own `TaskOk`; only a loop
    // exit forced by intake EOF or an unrecoverable invariant violation is
    // reported as `Fatal` to whatever's still listening on the outbound end.
    if !shutdown_requested {
        let _ = outbound_tx.send(OutboundEvent::Fatal { message: "dispatcher shutting down".to_string() });
    }
}

/// Handles one task. Returns `true` if the dispatcher should shut down.
async fn handle_task(
    state: &mut DispatcherState,
    task: Task,
    outbound_tx: &mpsc::Sender<OutboundEvent>,
    timeout_tx: &mpsc::UnboundedSender<(WorkerId, TaskId)>,
) -> bool {
    if let TaskKind::Control(_) = &task.kind {
        return handle_control(state, task, outbound_tx).await;
    }

    let snapshot = state.pool.snapshot_workers();
    let view = PoolView { workers: &snapshot, pool_max: state.config.pool_max };
    let decision = router::route(&task, &view, &state.config);

    match decision.action {
        DispatchAction::Assign => match decision.worker {
            Some(worker_id) => {
                // Reusing an existing `free` worker for a tracepoint sweep
                // marks it `tracepoint`-owned so it won't later be mistaken
                // for a `stable` promotion candidate.
                if task.kind.is_tracepoint() {
                    state.pool.set_role(worker_id, Role::Tracepoint);
                }
                assign_task(state, worker_id, task, outbound_tx).await
            }
            None => spawn_and_assign(state, &task, outbound_tx).await,
        },
        DispatchAction::QueueBehind => {
            let worker_id = decision.worker.expect("queue-behind always names a worker");
            let _ = state.pool.queue_behind(worker_id, task);
        }
        DispatchAction::InterruptAndReplace => {
            let old_worker = decision.worker.expect("interrupt-and-replace always names a worker");
            preempt_worker(state, old_worker, true, outbound_tx, timeout_tx).await;
            place_replacement(state, task, outbound_tx).await;
        }
        DispatchAction::CancelAndReplace => {
            let old_worker = decision.worker.expect("cancel-and-replace always names a worker");
            preempt_worker(state, old_worker, false, outbound_tx, timeout_tx).await;
            place_replacement(state, task, outbound_tx).await;
        }
        DispatchAction::Reject => {
            let _ = outbound_tx.send(reset::resource_exhausted_response(&task)).await;
        }
    }
    false
}

async fn assign_task(state: &mut DispatcherState, worker_id: WorkerId, task: Task, outbound_tx: &mpsc::Sender<OutboundEvent>) {
    let task_id = task.task_id;
    if let Err(err) = state.pool.assign(worker_id, task).await {
        let _ = outbound_tx
            .send(OutboundEvent::Error { task_id, message: err.to_string() })
            .await;
        return;
    }
    state.inflight.insert(task_id, worker_id);
    state.worker_task.insert(worker_id, task_id);
}

/// The role a freshly spawned worker takes when it's being created to serve
/// `task` directly, rather than repositioned as a reserve afterward:
/// step-like and jump-like tasks always run on `stable`, info tasks are
/// happy with any free worker, and tracepoint sweeps get their own role so
/// they're never mistaken for a `stable` candidate later.
fn spawn_role_for(kind: &TaskKind) -> Role {
    match kind {
        TaskKind::Step { .. } | TaskKind::Jump(_) => Role::Stable,
        TaskKind::Info(_) => Role::Free,
        TaskKind::Tracepoint(_) => Role::Tracepoint,
        TaskKind::Control(_) => Role::Free,
    }
}

async fn spawn_and_assign(state: &mut DispatcherState, task: &Task, outbound_tx: &mpsc::Sender<OutboundEvent>) {
    let role = spawn_role_for(&task.kind);
    match state.pool.spawn(role, Duration::from_millis(state.config.start_timeout_ms)).await {
        Ok(worker_id) => assign_task(state, worker_id, task.clone(), outbound_tx).await,
        Err(err) => {
            let _ = outbound_tx
                .send(OutboundEvent::Error { task_id: task.task_id, message: err.to_string() })
                .await;
        }
    }
}

/// Places a replacement task on a freshly-chosen worker, excluding the
/// just-preempted one (it stays `Busy`/`Interrupting` so routing skips it
/// naturally).
async fn place_replacement(state: &mut DispatcherState, task: Task, outbound_tx: &mpsc::Sender<OutboundEvent>) {
    let snapshot = state.pool.snapshot_workers();
    let view = PoolView { workers: &snapshot, pool_max: state.config.pool_max };
    let decision = router::select_worker(&view, false);
    match (decision.action, decision.worker) {
        (DispatchAction::QueueBehind, Some(worker_id)) => {
            let _ = state.pool.queue_behind(worker_id, task);
        }
        (_, Some(worker_id)) => assign_task(state, worker_id, task, outbound_tx).await,
        (DispatchAction::Reject, None) => {
            let _ = outbound_tx.send(reset::resource_exhausted_response(&task)).await;
        }
        (_, None) => spawn_and_assign(state, &task, outbound_tx).await,
    }
}

/// Cancels the in-flight task owned by `worker`, and either interrupts it
/// (with a timeout fallback) or simply disowns it.
async fn preempt_worker(
    state: &mut DispatcherState,
    worker: WorkerId,
    attempt_interrupt: bool,
    outbound_tx: &mpsc::Sender<OutboundEvent>,
    timeout_tx: &mpsc::UnboundedSender<(WorkerId, TaskId)>,
) {
    let Some(task_id) = state.worker_task.remove(&worker) else {
        return;
    };
    state.inflight.remove(&task_id);
    let _ = outbound_tx.send(OutboundEvent::Cancelled { task_id }).await;

    // The replacement task gets its own freshly-chosen worker (possibly
    // this one once it's idle again, possibly another); this one is no
    // longer "the" stable worker in the meantime.
    if state.pool.get(worker).map(|w| w.role) == Some(Role::Stable) {
        state.pool.set_role(worker, Role::Free);
    }

    if attempt_interrupt {
        if let Some(record) = state.pool.get(worker) {
            record.proxy.get().interrupt();
        }
        let _ = state.pool.transition(worker, WorkerState::Interrupting);
        let cancel_timeout_ms = state.config.cancel_timeout_ms;
        let timeout_tx = timeout_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(TokioInstant::now() + Duration::from_millis(cancel_timeout_ms)).await;
            let _ = timeout_tx.send((worker, task_id));
        });
    }
    // cancel-and-replace (attempt_interrupt=false) leaves the worker's
    // external operation running; its eventual terminal line is handled
    // as an orphaned result in `handle_worker_event`.
}

async fn handle_interrupt_timeout(
    state: &mut DispatcherState,
    worker: WorkerId,
    task_id: TaskId,
    outbound_tx: &mpsc::Sender<OutboundEvent>,
) {
    // A late ack after this point is logged and discarded; the worker is
    // reset regardless of whether it ever arrives.
    if state.worker_task.get(&worker) == Some(&task_id) {
        tracing::warn!(%worker, %task_id, "interrupt ack timed out; worker will be reset");
        state.worker_task.remove(&worker);
        let _ = state.pool.transition(worker, WorkerState::Dead);
        let events = reset::handle_worker_crash(state, worker).await;
        for event in events {
            let _ = outbound_tx.send(event).await;
        }
    }
}

async fn handle_control(
    state: &mut DispatcherState,
    task: Task,
    outbound_tx: &mpsc::Sender<OutboundEvent>,
) -> bool {
    let task_id = task.task_id;
    let TaskKind::Control(op) = task.kind else {
        unreachable!("caller filters to control tasks");
    };
    match op {
        ControlOp::Configure => {
            let update: ConfigUpdate = task
                .payload
                .as_deref()
                .and_then(|bytes| serde_json::from_slice(bytes).ok())
                .unwrap_or_default();
            match apply_config_update(state, &update) {
                Ok(()) => {
                    let _ = outbound_tx
                        .send(OutboundEvent::TaskOk { task_id, body: serde_json::json!({}) })
                        .await;
                }
                Err(err) => {
                    let _ = outbound_tx
                        .send(OutboundEvent::Error { task_id, message: err.to_string() })
                        .await;
                }
            }
            false
        }
        ControlOp::FullReset { reset_last_location } => {
            let events = reset::full_reset(state, task_id, reset_last_location).await;
            for event in events {
                let _ = outbound_tx.send(event).await;
            }
            false
        }
        ControlOp::Cancel { task_id: target } => {
            if let Some(&worker) = state.worker_task.get(&target) {
                state.inflight.remove(&target);
                state.worker_task.remove(&worker);
                if let Some(record) = state.pool.get(worker) {
                    record.proxy.get().interrupt();
                }
                let _ = outbound_tx.send(OutboundEvent::Cancelled { task_id: target }).await;
                let _ = outbound_tx
                    .send(OutboundEvent::TaskOk { task_id, body: serde_json::json!({}) })
                    .await;
            } else {
                let _ = outbound_tx
                    .send(OutboundEvent::Error {
                        task_id,
                        message: DispatchError::NoSuchTask(target).to_string(),
                    })
                    .await;
            }
            false
        }
        ControlOp::Shutdown => {
            let _ = outbound_tx
                .send(OutboundEvent::TaskOk { task_id, body: serde_json::json!({}) })
                .await;
            true
        }
    }
}

/// Applies a validated `ConfigUpdate` to a running dispatcher, used by the
/// CLI's `configure` path outside the hot loop.
pub fn apply_config_update(state: &mut DispatcherState, update: &ConfigUpdate) -> Result<(), codetracer_rr_dispatcher_core::ConfigError> {
    let next = state.config.merged_with(update);
    next.validate()?;
    state.config = next;
    Ok(())
}

async fn handle_worker_event(state: &mut DispatcherState, ev: WorkerEvent, outbound_tx: &mpsc::Sender<OutboundEvent>) {
    match ev {
        WorkerEvent::Ready { worker } => {
            let _ = state.pool.transition(worker, WorkerState::Idle);
        }
        WorkerEvent::Line { worker, line } => handle_worker_line(state, worker, line, outbound_tx).await,
        WorkerEvent::ProtocolError { worker, message } => {
            tracing::error!(%worker, %message, "worker protocol error; treating as crash");
            fail_worker(state, worker, message, outbound_tx).await;
        }
        WorkerEvent::Exited { worker } => {
            if state.pool.get(worker).map(|w| w.state) != Some(WorkerState::Dead) {
                fail_worker(state, worker, "process exited".to_string(), outbound_tx).await;
            }
        }
    }
}

async fn fail_worker(state: &mut DispatcherState, worker: WorkerId, message: String, outbound_tx: &mpsc::Sender<OutboundEvent>) {
    let _ = state.pool.transition(worker, WorkerState::Dead);
    if let Some(&task_id) = state.worker_task.get(&worker) {
        let _ = outbound_tx
            .send(OutboundEvent::WorkerFailed { task_id, message: message.clone() })
            .await;
        state.inflight.remove(&task_id);
        state.worker_task.remove(&worker);
    }
    let events = reset::handle_worker_crash(state, worker).await;
    for event in events {
        let _ = outbound_tx.send(event).await;
    }
}

async fn handle_worker_line(state: &mut DispatcherState, worker: WorkerId, line: WorkerLine, outbound_tx: &mpsc::Sender<OutboundEvent>) {
    match line {
        WorkerLine::Event { tag, body } => {
            if tag == "location" {
                if let Some(tick) = body.get("tick").and_then(|v| v.as_u64()) {
                    state.pool.set_tick(worker, tick);
                    if state.pool.get(worker).map(|w| w.role) == Some(Role::Stable) {
                        state.last_known_tick = tick;
                        reposition_reserves(state, tick).await;
                    }
                }
            }
            let _ = outbound_tx
                .send(OutboundEvent::Unsolicited { synthetic_id: worker.0, tag, body })
                .await;
        }
        WorkerLine::Ok => complete_task(state, worker, outbound_tx, |task_id| OutboundEvent::TaskOk {
            task_id,
            body: serde_json::json!({}),
        })
        .await,
        WorkerLine::Err(message) => {
            complete_task(state, worker, outbound_tx, move |task_id| OutboundEvent::Error {
                task_id,
                message: message.clone(),
            })
            .await
        }
        WorkerLine::Interrupted => complete_task(state, worker, outbound_tx, |task_id| OutboundEvent::Cancelled { task_id }).await,
    }
    if let Some(record) = state.pool.get(worker) {
        if record.state == WorkerState::Busy || record.state == WorkerState::Interrupting {
            let _ = state.pool.transition(worker, WorkerState::Idle);
        }
    }
    if let Some(pending) = state.pool.next_pending(worker) {
        assign_task(state, worker, pending, outbound_tx).await;
    }
}

/// Forwards a terminal worker line to the client, but only if the worker
/// still owns a tracked task — a cancel-and-replace or timed-out
/// interrupt may have already disowned it, in which case the result is
/// orphaned and silently discarded.
async fn complete_task(
    state: &mut DispatcherState,
    worker: WorkerId,
    outbound_tx: &mpsc::Sender<OutboundEvent>,
    make_event: impl FnOnce(TaskId) -> OutboundEvent,
) {
    if let Some(task_id) = state.worker_task.remove(&worker) {
        state.inflight.remove(&task_id);
        if crate::pool::is_internal_task_id(task_id) {
            return;
        }
        let _ = outbound_tx.send(make_event(task_id)).await;
    }
}

/// Drives each gap `missing_reserves` reports through an actual
/// promotion-or-spawn and an internal goto-tick, so `step-behind-tracking`
/// and `close-tracking` workers actually come into being and land near
/// `stable` instead of the gap just being logged and forgotten.
async fn reposition_reserves(state: &mut DispatcherState, stable_tick: u64) {
    let reserves = state.pool.missing_reserves(&state.config, stable_tick);
    for reserve in reserves {
        reposition_one_reserve(state, reserve).await;
    }
}

/// Promotes an idle `free` worker to `reserve.for_role`, or spawns a fresh
/// one if the pool has room, then assigns the internal goto-tick task that
/// moves it into position. Failures here are background concerns per §7
/// ("for background reserve spawns, log only") — never surfaced to the
/// client, since no client task is waiting on a reserve repositioning.
async fn reposition_one_reserve(state: &mut DispatcherState, reserve: InternalTask) {
    let role = reserve.for_role;
    let worker_id = if let Some(id) = state.pool.find_idle_role(Role::Free) {
        state.pool.set_role(id, role);
        id
    } else if (state.pool.len() as u32) < state.config.pool_max {
        match state
            .pool
            .spawn(role, Duration::from_millis(state.config.start_timeout_ms))
            .await
        {
            Ok(id) => id,
            Err(err) => {
                tracing::debug!(?role, error = %err, "background reserve spawn failed");
                return;
            }
        }
    } else {
        tracing::debug!(?role, "pool at capacity; skipping reserve repositioning");
        return;
    };

    assign_internal_task(state, worker_id, reserve.task).await;
}

/// Like `assign_task`, but for dispatcher-generated internal tasks: a
/// failure is logged rather than sent to the client, and the task's
/// terminal result is silently discarded by `complete_task`'s
/// `is_internal_task_id` check once the worker reports it.
async fn assign_internal_task(state: &mut DispatcherState, worker_id: WorkerId, task: Task) {
    let task_id = task.task_id;
    if let Err(err) = state.pool.assign(worker_id, task).await {
        tracing::debug!(worker = %worker_id, error = %err, "internal reserve repositioning failed");
        return;
    }
    state.inflight.insert(task_id, worker_id);
    state.worker_task.insert(worker_id, task_id);
}

/// Build the intake/outbound channel endpoints and worker-event channel,
/// wiring them into a running dispatcher task (used by the CLI binary).
pub fn spawn_dispatcher(
    pool: WorkerPool,
    config: RouterConfig,
    task_rx: mpsc::Receiver<Task>,
    worker_events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    outbound_tx: mpsc::Sender<OutboundEvent>,
) -> tokio::task::JoinHandle<()> {
    let state = DispatcherState::new(pool, config);
    tokio::spawn(run(state, task_rx, worker_events_rx, outbound_tx))
}

/// Resolves the `rr` binary path: `RR_BINARY` env override, else a short
/// list of standard locations.
pub fn resolve_rr_binary() -> String {
    if let Ok(path) = std::env::var("RR_BINARY") {
        return path;
    }
    for candidate in ["rr", "/usr/bin/rr", "/usr/local/bin/rr"] {
        if candidate == "rr" || std::path::Path::new(candidate).exists() {
            tracing::debug!(candidate, "resolved rr binary");
            return candidate.to_string();
        }
    }
    "rr".to_string()
}
