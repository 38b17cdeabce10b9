//! Values produced by routing a task ([`DispatchDecision`]) and values
//! sent back to the client ([`OutboundEvent`]).

use serde::{Deserialize, Serialize};

use crate::task::TaskId;
use crate::worker::WorkerId;

/// The action half of a [`DispatchDecision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchAction {
    /// Bind the task to the chosen worker and start it immediately.
    Assign,
    /// Append the task to the chosen worker's pending queue (FIFO).
    QueueBehind,
    /// Send an interrupt to the worker's in-flight task; start the new
    /// task on the chosen worker once the interrupt is acknowledged (or
    /// falls back to cancel-and-replace on timeout).
    InterruptAndReplace,
    /// Mark the worker's in-flight task cancelled without waiting for an
    /// interrupt ack, and start the new task on the chosen worker.
    CancelAndReplace,
    /// No worker is available and none can be spawned; the task fails.
    Reject,
}

/// `(worker, action)`, produced by the router (C2) and consumed by the
/// pool/worker proxy (C3/C4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchDecision {
    pub worker: Option<WorkerId>,
    pub action: DispatchAction,
}

impl DispatchDecision {
    pub fn assign(worker: WorkerId) -> Self {
        Self {
            worker: Some(worker),
            action: DispatchAction::Assign,
        }
    }

    pub fn queue_behind(worker: WorkerId) -> Self {
        Self {
            worker: Some(worker),
            action: DispatchAction::QueueBehind,
        }
    }

    pub fn interrupt_and_replace(worker: WorkerId) -> Self {
        Self {
            worker: Some(worker),
            action: DispatchAction::InterruptAndReplace,
        }
    }

    pub fn cancel_and_replace(worker: WorkerId) -> Self {
        Self {
            worker: Some(worker),
            action: DispatchAction::CancelAndReplace,
        }
    }

    pub fn reject() -> Self {
        Self {
            worker: None,
            action: DispatchAction::Reject,
        }
    }
}

/// A message produced by a worker or the dispatcher destined for the
/// client. All variants carry the originating `task_id`, or a synthetic
/// id for unsolicited events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    /// A task completed successfully.
    TaskOk {
        task_id: TaskId,
        body: serde_json::Value,
    },
    /// A task was cancelled (superseded by a later jump, or timed out
    /// waiting for an interrupt ack).
    Cancelled { task_id: TaskId },
    /// The worker handling a task crashed mid-task.
    WorkerFailed { task_id: TaskId, message: String },
    /// A task failed for a reason that does not fit the above.
    Error { task_id: TaskId, message: String },
    /// Progress notification for a long-running task.
    Progress {
        task_id: TaskId,
        message: String,
    },
    /// Unsolicited state update, not tied to any specific client request
    /// (e.g. a tracepoint hit during a sweep).
    Unsolicited {
        synthetic_id: u64,
        tag: String,
        body: serde_json::Value,
    },
    /// Unrecoverable dispatcher-level failure; shutdown follows.
    Fatal { message: String },
}

impl OutboundEvent {
    /// The task this event is correlated with, when it has one.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            OutboundEvent::TaskOk { task_id, .. }
            | OutboundEvent::Cancelled { task_id }
            | OutboundEvent::WorkerFailed { task_id, .. }
            | OutboundEvent::Error { task_id, .. }
            | OutboundEvent::Progress { task_id, .. } => Some(*task_id),
            OutboundEvent::Unsolicited { .. } | OutboundEvent::Fatal { .. } => None,
        }
    }

    /// Whether this is one of the terminal result kinds for a task: each
    /// task gets exactly one of these over its lifetime.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutboundEvent::TaskOk { .. }
                | OutboundEvent::Cancelled { .. }
                | OutboundEvent::WorkerFailed { .. }
                | OutboundEvent::Error { .. }
        )
    }
}
