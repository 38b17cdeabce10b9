#![deny(unreachable_pub)]

//! The RR-backend dispatcher engine: C1-C5 from the design (intake,
//! router, worker pool, worker process proxy, reset/recovery) plus the
//! `tokio::select!` runtime loop that wires them together.
//!
//! Worker process control needs a couple of raw `kill(2)` calls
//! ([`worker_proxy`]), so this crate does not forbid `unsafe_code`
//! wholesale the way `dispatcher-core` does; it is confined to that one
//! module.

pub mod dispatcher;
pub mod intake;
pub mod pool;
pub mod protocol;
pub mod reset;
pub mod router;
pub mod worker_proxy;

pub use dispatcher::{spawn_dispatcher, resolve_rr_binary, DispatcherState};
pub use pool::WorkerPool;
