//! The dispatcher's error taxonomy, as a single `thiserror` enum matched
//! on by callers to decide retry/terminal-failure/fatal handling.

use thiserror::Error;

use crate::task::TaskId;
use crate::worker::WorkerId;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed framing: {0}")]
    MalformedFraming(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("no such task: {0}")]
    NoSuchTask(TaskId),

    #[error("worker spawn failed: {0}")]
    WorkerSpawnFailed(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("worker {worker} failed while handling task {task_id}: {message}")]
    WorkerFailed {
        worker: WorkerId,
        task_id: TaskId,
        message: String,
    },

    #[error("interrupt timed out for worker {0}")]
    InterruptTimeout(WorkerId),

    #[error("fatal dispatcher error: {0}")]
    Fatal(String),
}

impl DispatchError {
    /// Errors scoped to a single task never take down other tasks or the
    /// pool.
    pub fn is_task_scoped(&self) -> bool {
        matches!(
            self,
            DispatchError::MalformedFraming(_)
                | DispatchError::ParseError(_)
                | DispatchError::UnknownCommand(_)
                | DispatchError::InvalidArguments(_)
                | DispatchError::NoSuchTask(_)
                | DispatchError::WorkerSpawnFailed(_)
                | DispatchError::ResourceExhausted(_)
                | DispatchError::WorkerFailed { .. }
                | DispatchError::InterruptTimeout(_)
        )
    }

    /// Only invariant violations in the dispatcher's own state are fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::Fatal(_))
    }

    /// The process exit code a top-level `main` should use if this error
    /// escapes the dispatcher loop unhandled.
    pub fn exit_code(&self) -> i32 {
        if self.is_fatal() { 3 } else { 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_fatal_is_fatal() {
        assert!(DispatchError::Fatal("pool exhausted".into()).is_fatal());
        assert!(!DispatchError::ResourceExhausted("no fds".into()).is_fatal());
        assert_eq!(DispatchError::Fatal("x".into()).exit_code(), 3);
    }

    #[test]
    fn interrupt_timeout_is_task_scoped_not_fatal() {
        let err = DispatchError::InterruptTimeout(WorkerId(1));
        assert!(err.is_task_scoped());
        assert!(!err.is_fatal());
    }
}
