//! The unit of client-requested work and the pieces it is built from:
//! kind, direction, and target location.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier for a task, unique for the lifetime of one dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}


/// Step-like operations, always bound to the `stable` worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOp {
    StepIn,
    StepOver,
    StepOut,
    Next,
    Continue,
}

/// Jump-like operations: interruptible, may replace an in-flight jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JumpOp {
    GotoTick,
    GotoLocation,
    RunToEntry,
}

/// Info queries: interruptible, servable by any worker positioned correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfoOp {
    Locals,
    StackTrace,
    Evaluate,
    ReadSource,
    CalltraceWindow,
    EventsWindow,
    Flow,
}

/// Tracepoint operations: non-tracking, served by a free worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TracepointOp {
    SetTracepoint,
    ClearTracepoint,
    RunTracepoints,
}

/// Control operations, handled inline by the dispatcher (never dispatched
/// to a worker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlOp {
    Configure,
    FullReset { reset_last_location: bool },
    Cancel { task_id: TaskId },
    Shutdown,
}

/// The exhaustive partition of task kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Step { op: StepOp, reverse: bool },
    Jump(JumpOp),
    Info(InfoOp),
    Tracepoint(TracepointOp),
    Control(ControlOp),
}

impl TaskKind {
    /// Non-interruptible, always bound to `stable`.
    pub fn is_step_like(&self) -> bool {
        matches!(self, TaskKind::Step { .. })
    }

    /// Interruptible, may replace an in-flight jump.
    pub fn is_jump_like(&self) -> bool {
        matches!(self, TaskKind::Jump(_))
    }

    /// Interruptible, may be served by any suitably-positioned worker.
    pub fn is_info(&self) -> bool {
        matches!(self, TaskKind::Info(_))
    }

    /// Non-tracking, served by a free worker only.
    pub fn is_tracepoint(&self) -> bool {
        matches!(self, TaskKind::Tracepoint(_))
    }

    /// Handled directly by the dispatcher, never forwarded to a worker.
    pub fn is_control(&self) -> bool {
        matches!(self, TaskKind::Control(_))
    }

    /// Derived `interruptible` flag: step-like and control tasks are not
    /// interruptible; jump-like and info tasks are.
    pub fn interruptible(&self) -> bool {
        self.is_jump_like() || self.is_info()
    }
}

/// Where a task's target is addressed, when the kind makes that meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetLocation {
    FileLine { file: String, line: u32 },
    ByteOffset(u64),
    Tick(u64),
}

/// Direction of travel for a task that has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Reverse,
    Absolute,
}

/// A unit of client-requested work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub payload: Option<Vec<u8>>,
    pub target_location: Option<TargetLocation>,
    pub direction: Direction,
}

impl Task {
    pub fn new(task_id: TaskId, kind: TaskKind, direction: Direction) -> Self {
        Self {
            task_id,
            kind,
            payload: None,
            target_location: None,
            direction,
        }
    }

    pub fn with_target(mut self, target: TargetLocation) -> Self {
        self.target_location = Some(target);
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Whether this task may be cancelled/replaced mid-flight.
    pub fn interruptible(&self) -> bool {
        self.kind.interruptible()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_like_is_never_interruptible() {
        let task = Task::new(
            TaskId(1),
            TaskKind::Step {
                op: StepOp::StepOver,
                reverse: false,
            },
            Direction::Forward,
        );
        assert!(!task.interruptible());
        assert!(task.kind.is_step_like());
    }

    #[test]
    fn jump_and_info_are_interruptible() {
        let jump = Task::new(TaskId(2), TaskKind::Jump(JumpOp::GotoTick), Direction::Absolute);
        assert!(jump.interruptible());

        let info = Task::new(TaskId(3), TaskKind::Info(InfoOp::Locals), Direction::Forward);
        assert!(info.interruptible());
    }

    #[test]
    fn control_and_tracepoint_are_not_interruptible() {
        let control = Task::new(
            TaskId(4),
            TaskKind::Control(ControlOp::Shutdown),
            Direction::Forward,
        );
        assert!(!control.interruptible());

        let tp = Task::new(
            TaskId(5),
            TaskKind::Tracepoint(TracepointOp::RunTracepoints),
            Direction::Forward,
        );
        assert!(!tp.interruptible());
    }
}
