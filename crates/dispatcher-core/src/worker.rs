//! Identity and small state types shared across the worker-pool boundary.
//!
//! The full worker record (pending queue, capabilities, tick, ...) is an
//! engine-internal concern: only opaque ids cross the boundary, the owning
//! map lives with the pool.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one `rr` replay worker process for the lifetime of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Why a worker exists right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The worker the user is stepping on; at most one.
    Stable,
    /// Pre-positioned a small tick-distance behind `stable`; at most one.
    StepBehindTracking,
    /// Pre-positioned near a user-relevant location; 0..K.
    CloseTracking,
    /// Unassigned; available for any purpose.
    Free,
    /// Executing tracepoint sweeps; never promoted to `stable` without a reset.
    Tracepoint,
}

impl Role {
    pub fn is_tracking(&self) -> bool {
        matches!(self, Role::StepBehindTracking | Role::CloseTracking)
    }
}

/// Per-worker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Process created; program not yet loaded. Not eligible for assignment.
    Spawning,
    /// Eligible for assignment.
    Idle,
    /// Owns exactly one task.
    Busy,
    /// Interrupt sent, awaiting ack or timeout.
    Interrupting,
    /// Cooperative shutdown: finish current task, refuse new ones.
    Draining,
    /// Process exited unexpectedly, or failed to ack an interrupt.
    Dead,
}

impl WorkerState {
    /// Whether a worker in this state may be handed a new task.
    pub fn is_assignable(&self) -> bool {
        matches!(self, WorkerState::Idle)
    }

    /// Whether a legal transition exists from `self` to `next`.
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        match (self, next) {
            // Any state can crash to Dead, and Draining's "Terminated" is
            // modeled as Dead too: the pool drops the handle either way.
            (_, Dead) => true,
            (Spawning, Idle) => true,
            (Idle, Busy) | (Idle, Draining) => true,
            (Busy, Idle) | (Busy, Interrupting) | (Busy, Draining) => true,
            (Interrupting, Idle) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_state_can_crash_to_dead() {
        for state in [
            WorkerState::Spawning,
            WorkerState::Idle,
            WorkerState::Busy,
            WorkerState::Interrupting,
            WorkerState::Draining,
        ] {
            assert!(state.can_transition_to(WorkerState::Dead));
        }
    }

    #[test]
    fn idle_is_assignable_others_are_not() {
        assert!(WorkerState::Idle.is_assignable());
        assert!(!WorkerState::Busy.is_assignable());
        assert!(!WorkerState::Spawning.is_assignable());
    }

    #[test]
    fn busy_cannot_go_straight_to_draining_then_back_to_busy() {
        assert!(WorkerState::Busy.can_transition_to(WorkerState::Draining));
        assert!(!WorkerState::Draining.can_transition_to(WorkerState::Busy));
    }
}
