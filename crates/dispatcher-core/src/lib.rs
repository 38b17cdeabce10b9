#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared domain types for the RR-backend dispatcher: the task/worker
//! model, dispatch decisions, outbound events, and configuration and
//! error types consumed by both `dispatcher_engine` and the CLI binary.

pub mod config;
pub mod error;
pub mod event;
pub mod task;
pub mod worker;

pub use config::{ConfigError, ConfigUpdate, RouterConfig};
pub use error::DispatchError;
pub use event::{DispatchAction, DispatchDecision, OutboundEvent};
pub use task::{
    ControlOp, Direction, InfoOp, JumpOp, StepOp, Task, TaskId, TaskKind, TargetLocation,
    TracepointOp,
};
pub use worker::{Role, WorkerId, WorkerState};
