//! C3: worker lifecycle, role bookkeeping, and state-machine enforcement.
//! Owned exclusively by the dispatcher task; nothing else mutates it.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use codetracer_rr_dispatcher_core::{DispatchError, Role, RouterConfig, Task, TaskId, WorkerId, WorkerState};

use crate::router::WorkerSnapshot;
use crate::worker_proxy::{self, WorkerEvent, WorkerProxyGuard};

/// A pre-positioning task generated by the pool itself. The router routes
/// these exactly like any other jump, but the dispatcher discards their
/// terminal result instead of forwarding it to the client.
#[derive(Debug, Clone)]
pub struct InternalTask {
    pub task: Task,
    pub for_role: Role,
}

/// The tick distance a `step-behind-tracking` worker trails `stable` by.
/// Small enough that a reverse-step or small rewind never needs a replay
/// from the trace start.
const STEP_BEHIND_OFFSET_TICKS: u64 = 200;

#[derive(Debug, Default)]
struct WorkerIdAllocator(AtomicU64);

impl WorkerIdAllocator {
    fn next(&self) -> WorkerId {
        WorkerId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// The full record of one worker; `WorkerSnapshot` is the read-only slice
/// of this that the router is allowed to see.
pub struct WorkerRecord {
    pub id: WorkerId,
    pub role: Role,
    pub state: WorkerState,
    pub current_tick: u64,
    pub current_task_id: Option<TaskId>,
    pub pending_queue: VecDeque<Task>,
    pub last_activity: Instant,
    pub proxy: WorkerProxyGuard,
}

/// Owns every worker for the lifetime of one dispatcher.
pub struct WorkerPool {
    workers: HashMap<WorkerId, WorkerRecord>,
    ids: WorkerIdAllocator,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    rr_binary: String,
    trace_path: PathBuf,
}

impl WorkerPool {
    pub fn new(events_tx: mpsc::UnboundedSender<WorkerEvent>, rr_binary: String, trace_path: PathBuf) -> Self {
        Self {
            workers: HashMap::new(),
            ids: WorkerIdAllocator::default(),
            events_tx,
            rr_binary,
            trace_path,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerRecord> {
        self.workers.get(&id)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerRecord> {
        self.workers.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    pub fn stable_id(&self) -> Option<WorkerId> {
        self.workers.values().find(|w| w.role == Role::Stable).map(|w| w.id)
    }

    pub fn find_role(&self, role: Role) -> Option<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.role == role)
            .min_by_key(|w| w.id)
            .map(|w| w.id)
    }

    /// Like [`Self::find_role`], but only a worker that's actually idle —
    /// a `free`-role worker can be `Busy` serving an info query without
    /// ever being repromoted, and such a worker can't take on an internal
    /// repositioning task until it's done.
    pub fn find_idle_role(&self, role: Role) -> Option<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.role == role && w.state.is_assignable())
            .min_by_key(|w| w.id)
            .map(|w| w.id)
    }

    /// A read-only snapshot for the router; call once per `route` and
    /// reuse the slice for the duration of that decision.
    pub fn snapshot_workers(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .values()
            .map(|w| WorkerSnapshot {
                id: w.id,
                role: w.role,
                state: w.state,
                current_tick: w.current_tick,
            })
            .collect()
    }

    /// Spawns a new worker under `role`.
    pub async fn spawn(
        &mut self,
        role: Role,
        start_timeout: Duration,
    ) -> Result<WorkerId, DispatchError> {
        let id = self.ids.next();
        let proxy = worker_proxy::spawn_worker(
            id,
            &self.rr_binary,
            &self.trace_path,
            start_timeout,
            self.events_tx.clone(),
        )
        .await?;

        self.workers.insert(
            id,
            WorkerRecord {
                id,
                role,
                state: WorkerState::Idle,
                current_tick: 0,
                current_task_id: None,
                pending_queue: VecDeque::new(),
                last_activity: Instant::now(),
                proxy: WorkerProxyGuard::new(proxy),
            },
        );
        Ok(id)
    }

    /// Transitions a worker's state, rejecting illegal transitions.
    /// Returns `Err(Fatal)` on a caller bug, since the state machine is
    /// meant to make illegal transitions unreachable in correct code.
    pub fn transition(&mut self, id: WorkerId, next: WorkerState) -> Result<(), DispatchError> {
        let record = self
            .workers
            .get_mut(&id)
            .ok_or_else(|| DispatchError::Fatal(format!("transition on unknown worker {id}")))?;
        if !record.state.can_transition_to(next) {
            return Err(DispatchError::Fatal(format!(
                "illegal worker transition {:?} -> {:?} for {id}",
                record.state, next
            )));
        }
        record.state = next;
        record.last_activity = Instant::now();
        Ok(())
    }

    /// Binds a task to a worker and sends its wire command. Operations on
    /// a single worker are strictly serial, one outstanding command at a
    /// time.
    pub async fn assign(&mut self, id: WorkerId, task: Task) -> Result<(), DispatchError> {
        if !self.workers.contains_key(&id) {
            return Err(DispatchError::NoSuchTask(task.task_id));
        }
        let command_line = wire_command_for(&task);
        self.transition(id, WorkerState::Busy)?;
        let record = self.workers.get_mut(&id).expect("checked above");
        record.current_task_id = Some(task.task_id);
        record.proxy.get().send(&command_line).await
    }

    pub fn queue_behind(&mut self, id: WorkerId, task: Task) -> Result<(), DispatchError> {
        let record = self.workers.get_mut(&id).ok_or(DispatchError::NoSuchTask(task.task_id))?;
        record.pending_queue.push_back(task);
        Ok(())
    }

    /// Pops the next pending task for a worker that just went idle.
    pub fn next_pending(&mut self, id: WorkerId) -> Option<Task> {
        self.workers.get_mut(&id).and_then(|w| w.pending_queue.pop_front())
    }

    /// Removes and returns a worker's record, e.g. after it is confirmed
    /// `Dead`.
    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerRecord> {
        self.workers.remove(&id)
    }

    pub fn set_role(&mut self, id: WorkerId, role: Role) {
        if let Some(w) = self.workers.get_mut(&id) {
            w.role = role;
        }
    }

    pub fn set_tick(&mut self, id: WorkerId, tick: u64) {
        if let Some(w) = self.workers.get_mut(&id) {
            w.current_tick = tick;
        }
    }

    /// Terminates every worker, on the dispatcher shutdown path.
    pub async fn terminate_all(&mut self, kill_timeout: Duration) {
        for (_, record) in self.workers.drain() {
            record.proxy.release(kill_timeout).await;
        }
    }

    /// Computes the reserve workers missing relative to `config`, as
    /// internal repositioning jumps. Called after `stable`'s tick changes
    /// significantly; does not spawn anything itself, only reports what
    /// the dispatcher should arrange.
    pub fn missing_reserves(&self, config: &RouterConfig, stable_tick: u64) -> Vec<InternalTask> {
        let mut tasks = Vec::new();

        if self.find_role(Role::StepBehindTracking).is_none() {
            tasks.push(InternalTask {
                task: internal_goto_tick(stable_tick.saturating_sub(STEP_BEHIND_OFFSET_TICKS)),
                for_role: Role::StepBehindTracking,
            });
        }

        let close_tracking_have = self.workers.values().filter(|w| w.role == Role::CloseTracking).count() as u32;
        for _ in close_tracking_have..config.close_tracking_count {
            tasks.push(InternalTask {
                task: internal_goto_tick(stable_tick),
                for_role: Role::CloseTracking,
            });
        }
        tasks
    }
}

/// The next id handed to an internal repositioning task, kept disjoint
/// from client-issued task ids (which equal the client's own `seq`, a
/// small number for any realistic session).
static INTERNAL_TASK_IDS: AtomicU64 = AtomicU64::new(1 << 62);

fn internal_goto_tick(tick: u64) -> Task {
    use codetracer_rr_dispatcher_core::{Direction, JumpOp, TargetLocation, TaskKind};
    let id = TaskId(INTERNAL_TASK_IDS.fetch_add(1, Ordering::Relaxed));
    Task::new(id, TaskKind::Jump(JumpOp::GotoTick), Direction::Absolute)
        .with_target(TargetLocation::Tick(tick))
}

/// Whether a task id was minted by the pool itself rather than a client.
pub fn is_internal_task_id(id: TaskId) -> bool {
    id.0 >= (1 << 62)
}

/// Renders a task as the single command line sent to a worker's stdin.
/// The worker protocol only fixes the shape of its *output*
/// (`EVT .../OK/ERR/INTERRUPTED`); the command text itself is opaque to
/// the dispatcher, so a compact JSON encoding of the task is as good a
/// wire shape as any and keeps the proxy free of per-command parsing.
fn wire_command_for(task: &Task) -> String {
    serde_json::to_string(task).unwrap_or_else(|_| "{}".to_string())
}
