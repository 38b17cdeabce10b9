//! C5: full resets, worker-crash recovery, and resource-exhaustion
//! fallback. Free functions over the dispatcher's owned state, kept
//! separate from the `tokio::select!` loop so each recovery path gets its
//! own focused test.

use std::time::Duration;

use codetracer_rr_dispatcher_core::{DispatchError, OutboundEvent, Role, Task, TaskId, WorkerId, WorkerState};

use crate::dispatcher::DispatcherState;

/// Cancels every in-flight task, tears down `stable`, and repositions a
/// fresh `stable` at the reset target.
///
/// Atomic from the client's view: by the time this returns, `state`
/// reflects the post-reset pool and the next routed task sees it.
pub async fn full_reset(
    state: &mut DispatcherState,
    reset_task_id: TaskId,
    reset_last_location: bool,
) -> Vec<OutboundEvent> {
    let mut events = Vec::new();

    for (task_id, worker) in state.inflight.drain() {
        state.worker_task.remove(&worker);
        events.push(OutboundEvent::Cancelled { task_id });
    }
    // Any queued-but-not-started task on any worker is also cancelled;
    // step-like queues are the only place these accumulate.
    let worker_ids: Vec<WorkerId> = state.pool.iter().map(|w| w.id).collect();
    for worker_id in worker_ids {
        if let Some(worker) = state.pool.get_mut(worker_id) {
            for task in worker.pending_queue.drain(..) {
                events.push(OutboundEvent::Cancelled { task_id: task.task_id });
            }
        }
    }

    if let Some(stable_id) = state.pool.stable_id() {
        if let Some(record) = state.pool.remove(stable_id) {
            record.proxy.release(Duration::from_millis(state.config.kill_timeout_ms)).await;
        }
    }

    let target_tick = if reset_last_location {
        state.last_known_tick
    } else {
        0
    };

    match promote_or_spawn_stable(state, target_tick).await {
        Ok(()) => {
            state.last_known_tick = target_tick;
            events.push(OutboundEvent::TaskOk {
                task_id: reset_task_id,
                body: serde_json::json!({ "reset": true, "tick": target_tick }),
            });
        }
        Err(err) => {
            events.push(OutboundEvent::Fatal { message: err.to_string() });
        }
    }

    events
}

/// Promotes a `step-behind-tracking`/`close-tracking`/`free` worker to
/// `stable`, or spawns one if the pool has room, repositioned at
/// `target_tick` via the internal jump machinery.
async fn promote_or_spawn_stable(state: &mut DispatcherState, target_tick: u64) -> Result<(), DispatchError> {
    let candidate = state
        .pool
        .find_role(Role::StepBehindTracking)
        .or_else(|| state.pool.find_role(Role::CloseTracking))
        .or_else(|| state.pool.find_role(Role::Free));

    let worker_id = match candidate {
        Some(id) => id,
        None => {
            state
                .pool
                .spawn(Role::Stable, Duration::from_millis(state.config.start_timeout_ms))
                .await?
        }
    };

    state.pool.set_role(worker_id, Role::Stable);
    state.pool.set_tick(worker_id, target_tick);

    if let Some(worker) = state.pool.get(worker_id) {
        if worker.state == WorkerState::Idle {
            let reposition = internal_goto_tick_task(target_tick);
            state.pool.assign(worker_id, reposition).await?;
        }
    }
    Ok(())
}

fn internal_goto_tick_task(tick: u64) -> Task {
    use codetracer_rr_dispatcher_core::{Direction, JumpOp, TargetLocation, TaskKind};
    Task::new(TaskId(u64::MAX), TaskKind::Jump(JumpOp::GotoTick), Direction::Absolute)
        .with_target(TargetLocation::Tick(tick))
}

/// Recovers from a worker reporting `Dead` while a task was `Busy`. The
/// caller is responsible for emitting the `WorkerFailed`/`Cancelled`
/// result for whatever task `worker` was running and for clearing it from
/// `state.inflight`/`state.worker_task` before calling this — it only
/// handles removal and `stable` promotion.
pub async fn handle_worker_crash(state: &mut DispatcherState, worker: WorkerId) -> Vec<OutboundEvent> {
    let mut events = Vec::new();

    let was_stable = state
        .pool
        .get(worker)
        .map(|w| w.role == Role::Stable)
        .unwrap_or(false);

    state.pool.remove(worker);

    if was_stable {
        match promote_or_spawn_stable(state, state.last_known_tick).await {
            Ok(()) => {}
            Err(_) if state.pool.len() as u32 >= state.config.pool_max => {
                events.push(OutboundEvent::Fatal {
                    message: "all workers dead and pool is at capacity".to_string(),
                });
            }
            Err(err) => {
                events.push(OutboundEvent::Fatal { message: err.to_string() });
            }
        }
    }

    events
}

/// Signals a resource-exhausted rejection back to the client for a task
/// that the router couldn't place anywhere.
pub fn resource_exhausted_response(task: &Task) -> OutboundEvent {
    OutboundEvent::Error {
        task_id: task.task_id,
        message: "ResourceExhausted".to_string(),
    }
}
