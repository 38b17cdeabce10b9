//! C2: task classification and dispatch-decision logic.
//!
//! `route` is a pure function of a task, a read-only snapshot of the pool,
//! and the current config. It owns no state of its own.

use codetracer_rr_dispatcher_core::{
    DispatchAction, DispatchDecision, Role, RouterConfig, Task, TaskKind, WorkerId, WorkerState,
};

/// A read-only view of one worker, enough for routing decisions.
/// Built fresh from the pool's real records on every `route` call.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub role: Role,
    pub state: WorkerState,
    pub current_tick: u64,
}

/// A read-only snapshot of the whole pool, passed into `route`.
#[derive(Debug, Clone, Copy)]
pub struct PoolView<'a> {
    pub workers: &'a [WorkerSnapshot],
    pub pool_max: u32,
}

impl<'a> PoolView<'a> {
    pub fn stable(&self) -> Option<&WorkerSnapshot> {
        self.workers.iter().find(|w| w.role == Role::Stable)
    }

    pub fn step_behind_tracking(&self) -> Option<&WorkerSnapshot> {
        self.workers.iter().find(|w| w.role == Role::StepBehindTracking)
    }

    fn by_role(&self, role: Role) -> impl Iterator<Item = &WorkerSnapshot> {
        self.workers.iter().filter(move |w| w.role == role)
    }

    fn below_pool_max(&self) -> bool {
        (self.workers.len() as u32) < self.pool_max
    }

    /// A worker positioned within `proximity` ticks of `target`, preferring
    /// `close-tracking` workers, lowest id first.
    fn near(&self, target: u64, proximity: u64, role: Role) -> Option<&WorkerSnapshot> {
        self.by_role(role)
            .filter(|w| w.state.is_assignable())
            .filter(|w| w.current_tick.abs_diff(target) <= proximity)
            .min_by_key(|w| w.id)
    }

    fn idle_non_stable(&self) -> Option<&WorkerSnapshot> {
        self.workers
            .iter()
            .filter(|w| w.role != Role::Stable && w.state.is_assignable())
            .min_by_key(|w| w.id)
    }
}

/// Shared worker-selection order: free, then step-behind-tracking, then
/// close-tracking, then spawn-if-room, then queue-behind an existing
/// compatible worker. Lowest `worker_id` breaks ties within a tier.
pub(crate) fn select_worker(pool: &PoolView, exclude_tracking_roles: bool) -> DispatchDecision {
    if let Some(w) = pool
        .by_role(Role::Free)
        .filter(|w| w.state.is_assignable())
        .min_by_key(|w| w.id)
    {
        return DispatchDecision::assign(w.id);
    }
    if !exclude_tracking_roles {
        if let Some(w) = pool
            .by_role(Role::StepBehindTracking)
            .filter(|w| w.state.is_assignable())
            .min_by_key(|w| w.id)
        {
            return DispatchDecision::assign(w.id);
        }
        if let Some(w) = pool
            .by_role(Role::CloseTracking)
            .filter(|w| w.state.is_assignable())
            .min_by_key(|w| w.id)
        {
            return DispatchDecision::assign(w.id);
        }
    }
    if pool.below_pool_max() {
        // Caller spawns; the pool assigns the fresh id once the worker
        // reports readiness, so there is no worker to name here yet.
        return DispatchDecision {
            worker: None,
            action: DispatchAction::Assign,
        };
    }
    // Queue behind whichever compatible worker is busy with the lowest id.
    let queue_target = pool
        .workers
        .iter()
        .filter(|w| {
            if exclude_tracking_roles {
                w.role != Role::Stable && !w.role.is_tracking()
            } else {
                w.role != Role::Stable
            }
        })
        .min_by_key(|w| w.id);
    match queue_target {
        Some(w) => DispatchDecision::queue_behind(w.id),
        None => DispatchDecision::reject(),
    }
}

/// Routes one non-control task to a [`DispatchDecision`].
///
/// Control tasks (`configure`, `full-reset`, `cancel`, `shutdown`) are
/// handled inline by the dispatcher loop before `route` is ever called;
/// passing one here is a caller bug.
pub fn route(task: &Task, pool: &PoolView, config: &RouterConfig) -> DispatchDecision {
    debug_assert!(!task.kind.is_control(), "control tasks bypass the router");

    match &task.kind {
        TaskKind::Step { .. } => route_step_like(pool),
        TaskKind::Jump(_) => route_jump_like(pool, config),
        TaskKind::Info(_) => route_info(task, pool, config),
        TaskKind::Tracepoint(_) => route_tracepoint(pool),
        TaskKind::Control(_) => unreachable!("filtered above"),
    }
}

/// Rule 2: always bound to `stable`; promote a reserve if none exists;
/// queue behind an in-flight step-like task (FIFO, never interrupted).
fn route_step_like(pool: &PoolView) -> DispatchDecision {
    if let Some(stable) = pool.stable() {
        return match stable.state {
            WorkerState::Idle => DispatchDecision::assign(stable.id),
            _ => DispatchDecision::queue_behind(stable.id),
        };
    }
    if let Some(w) = pool.step_behind_tracking() {
        return DispatchDecision::assign(w.id);
    }
    if let Some(w) = pool.idle_non_stable() {
        return DispatchDecision::assign(w.id);
    }
    if pool.below_pool_max() {
        return DispatchDecision {
            worker: None,
            action: DispatchAction::Assign,
        };
    }
    DispatchDecision::reject()
}

/// Rule 3: interruptible; busy `stable` triggers interrupt-and-replace or
/// cancel-and-replace depending on `interrupt_supported`.
fn route_jump_like(pool: &PoolView, config: &RouterConfig) -> DispatchDecision {
    let Some(stable) = pool.stable() else {
        return select_worker(pool, false);
    };
    match stable.state {
        WorkerState::Idle => DispatchDecision::assign(stable.id),
        WorkerState::Busy if config.interrupt_supported => {
            DispatchDecision::interrupt_and_replace(stable.id)
        }
        WorkerState::Busy => DispatchDecision::cancel_and_replace(stable.id),
        _ => select_worker(pool, false),
    }
}

/// Rule 4: prefer a nearby `close-tracking` worker, else any idle
/// non-`stable` worker, else spawn, else queue.
fn route_info(task: &Task, pool: &PoolView, config: &RouterConfig) -> DispatchDecision {
    let target_tick = task.target_location.as_ref().and_then(|loc| match loc {
        codetracer_rr_dispatcher_core::TargetLocation::Tick(t) => Some(*t),
        _ => None,
    });

    if let Some(tick) = target_tick {
        if let Some(w) = pool.near(tick, config.close_tracking_proximity_ticks, Role::CloseTracking) {
            return DispatchDecision::assign(w.id);
        }
    }
    if let Some(w) = pool.idle_non_stable() {
        return DispatchDecision::assign(w.id);
    }
    if pool.below_pool_max() {
        return DispatchDecision {
            worker: None,
            action: DispatchAction::Assign,
        };
    }
    // Last resort: queue behind whichever worker exists, lowest id first.
    // Unlike `select_worker`'s queueing fallback (used by jump replacement,
    // which never queues behind `stable`), an info query is willing to wait
    // behind any worker including `stable` — it's the only kind that is.
    match pool.workers.iter().min_by_key(|w| w.id) {
        Some(w) => DispatchDecision::queue_behind(w.id),
        None => DispatchDecision::reject(),
    }
}

/// Rule 5: requires a worker outside `stable`/`*-tracking` roles; never
/// preempts navigation, so exhaustion rejects rather than queues there.
/// Reuses a worker already running tracepoint sweeps as readily as an
/// unassigned `free` one.
fn route_tracepoint(pool: &PoolView) -> DispatchDecision {
    if let Some(w) = pool
        .workers
        .iter()
        .filter(|w| matches!(w.role, Role::Free | Role::Tracepoint))
        .filter(|w| w.state.is_assignable())
        .min_by_key(|w| w.id)
    {
        return DispatchDecision::assign(w.id);
    }
    if pool.below_pool_max() {
        return DispatchDecision {
            worker: None,
            action: DispatchAction::Assign,
        };
    }
    DispatchDecision::reject()
}

#[cfg(test)]
mod tests {
    use super::*;
    use codetracer_rr_dispatcher_core::{Direction, JumpOp, StepOp, TargetLocation, TaskId};

    fn worker(id: u64, role: Role, state: WorkerState, tick: u64) -> WorkerSnapshot {
        WorkerSnapshot { id: WorkerId(id), role, state, current_tick: tick }
    }

    #[test]
    fn step_like_promotes_step_behind_tracking_when_no_stable() {
        let workers = [worker(1, Role::StepBehindTracking, WorkerState::Idle, 500)];
        let pool = PoolView { workers: &workers, pool_max: 4 };
        let task = Task::new(
            TaskId(1),
            TaskKind::Step { op: StepOp::StepOver, reverse: false },
            Direction::Forward,
        );
        let decision = route(&task, &pool, &RouterConfig::default());
        assert_eq!(decision, DispatchDecision::assign(WorkerId(1)));
    }

    #[test]
    fn step_like_queues_behind_busy_stable() {
        let workers = [worker(1, Role::Stable, WorkerState::Busy, 0)];
        let pool = PoolView { workers: &workers, pool_max: 4 };
        let task = Task::new(
            TaskId(2),
            TaskKind::Step { op: StepOp::Next, reverse: false },
            Direction::Forward,
        );
        let decision = route(&task, &pool, &RouterConfig::default());
        assert_eq!(decision, DispatchDecision::queue_behind(WorkerId(1)));
    }

    #[test]
    fn jump_on_busy_stable_without_interrupt_support_cancels_and_replaces() {
        let workers = [worker(1, Role::Stable, WorkerState::Busy, 100)];
        let pool = PoolView { workers: &workers, pool_max: 4 };
        let task = Task::new(TaskId(3), TaskKind::Jump(JumpOp::GotoTick), Direction::Absolute)
            .with_target(TargetLocation::Tick(1000));
        let cfg = RouterConfig { interrupt_supported: false, ..RouterConfig::default() };
        let decision = route(&task, &pool, &cfg);
        assert_eq!(decision, DispatchDecision::cancel_and_replace(WorkerId(1)));
    }

    #[test]
    fn jump_on_busy_stable_with_interrupt_support_interrupts_first() {
        let workers = [worker(1, Role::Stable, WorkerState::Busy, 100)];
        let pool = PoolView { workers: &workers, pool_max: 4 };
        let task = Task::new(TaskId(3), TaskKind::Jump(JumpOp::GotoTick), Direction::Absolute);
        let cfg = RouterConfig { interrupt_supported: true, ..RouterConfig::default() };
        let decision = route(&task, &pool, &cfg);
        assert_eq!(decision, DispatchDecision::interrupt_and_replace(WorkerId(1)));
    }

    #[test]
    fn info_prefers_nearby_close_tracking_worker() {
        let workers = [
            worker(1, Role::Stable, WorkerState::Busy, 0),
            worker(2, Role::CloseTracking, WorkerState::Idle, 950),
        ];
        let pool = PoolView { workers: &workers, pool_max: 4 };
        let task = Task::new(TaskId(4), TaskKind::Info(codetracer_rr_dispatcher_core::InfoOp::Locals), Direction::Forward)
            .with_target(TargetLocation::Tick(1000));
        let decision = route(&task, &pool, &RouterConfig::default());
        assert_eq!(decision, DispatchDecision::assign(WorkerId(2)));
    }

    #[test]
    fn info_falls_back_to_idle_non_stable_when_no_worker_is_near() {
        let workers = [
            worker(1, Role::Stable, WorkerState::Busy, 0),
            worker(2, Role::CloseTracking, WorkerState::Idle, 50_000),
            worker(3, Role::Free, WorkerState::Idle, 0),
        ];
        let pool = PoolView { workers: &workers, pool_max: 4 };
        let task = Task::new(TaskId(5), TaskKind::Info(codetracer_rr_dispatcher_core::InfoOp::Locals), Direction::Forward)
            .with_target(TargetLocation::Tick(1000));
        let decision = route(&task, &pool, &RouterConfig::default());
        assert_eq!(decision, DispatchDecision::assign(WorkerId(3)));
    }

    #[test]
    fn tracepoint_rejects_when_no_free_worker_and_pool_is_full() {
        let workers = [
            worker(1, Role::Stable, WorkerState::Busy, 0),
            worker(2, Role::StepBehindTracking, WorkerState::Idle, 0),
        ];
        let pool = PoolView { workers: &workers, pool_max: 2 };
        let task = Task::new(
            TaskId(7),
            TaskKind::Tracepoint(codetracer_rr_dispatcher_core::TracepointOp::RunTracepoints),
            Direction::Forward,
        );
        let decision = route(&task, &pool, &RouterConfig::default());
        assert_eq!(decision, DispatchDecision::reject());
    }

    #[test]
    fn tracepoint_never_uses_stable_or_tracking_workers() {
        let workers = [
            worker(1, Role::Stable, WorkerState::Idle, 0),
            worker(2, Role::StepBehindTracking, WorkerState::Idle, 0),
            worker(3, Role::CloseTracking, WorkerState::Idle, 0),
        ];
        let pool = PoolView { workers: &workers, pool_max: 3 };
        let task = Task::new(
            TaskId(8),
            TaskKind::Tracepoint(codetracer_rr_dispatcher_core::TracepointOp::SetTracepoint),
            Direction::Forward,
        );
        let decision = route(&task, &pool, &RouterConfig::default());
        assert_eq!(decision, DispatchDecision::reject());
    }

    #[test]
    fn tracepoint_reuses_an_idle_tracepoint_owned_worker() {
        let workers = [
            worker(1, Role::Stable, WorkerState::Idle, 0),
            worker(2, Role::Tracepoint, WorkerState::Idle, 0),
        ];
        let pool = PoolView { workers: &workers, pool_max: 2 };
        let task = Task::new(
            TaskId(9),
            TaskKind::Tracepoint(codetracer_rr_dispatcher_core::TracepointOp::RunTracepoints),
            Direction::Forward,
        );
        let decision = route(&task, &pool, &RouterConfig::default());
        assert_eq!(decision, DispatchDecision::assign(WorkerId(2)));
    }

    #[test]
    fn info_queues_behind_stable_when_pool_is_full_and_nothing_else_is_idle() {
        let workers = [worker(1, Role::Stable, WorkerState::Busy, 0)];
        let pool = PoolView { workers: &workers, pool_max: 1 };
        let task = Task::new(TaskId(10), TaskKind::Info(codetracer_rr_dispatcher_core::InfoOp::Locals), Direction::Forward);
        let decision = route(&task, &pool, &RouterConfig::default());
        assert_eq!(decision, DispatchDecision::queue_behind(WorkerId(1)));
    }
}
