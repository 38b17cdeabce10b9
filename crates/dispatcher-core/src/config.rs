//! Dispatcher-scoped settings, shared by the CLI's startup defaults and
//! the `configure` control task's runtime updates — one struct, one set
//! of defaults and validation rules.

use serde::{Deserialize, Serialize};

/// Dispatcher-scoped settings updatable via the `configure` control task.
///
/// Effective immediately for future routing decisions; in-flight tasks
/// keep the policy that was active when they started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Maximum concurrent workers. Must be >= 2.
    pub pool_max: u32,
    /// Number of `close-tracking` reserve workers to maintain (0..=pool_max-2).
    pub close_tracking_count: u32,
    /// Attempt an interrupt before cancel-and-replace on a busy jump.
    pub interrupt_supported: bool,
    /// Grace period for an interrupt ack before falling back to replace.
    pub cancel_timeout_ms: u64,
    /// Timeout for a worker to report readiness after spawn.
    pub start_timeout_ms: u64,
    /// Timeout after SIGTERM before a worker is force-killed.
    pub kill_timeout_ms: u64,
    /// Whether `full-reset` repositions at the last known location
    /// (`true`) or the trace entry point (`false`).
    pub reset_last_location: bool,
    /// Tick-distance within which a `close-tracking` worker is considered
    /// close enough to serve an info query without repositioning.
    pub close_tracking_proximity_ticks: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            pool_max: 4,
            close_tracking_count: 1,
            interrupt_supported: false,
            cancel_timeout_ms: 100,
            start_timeout_ms: 10_000,
            kill_timeout_ms: 2_000,
            reset_last_location: false,
            close_tracking_proximity_ticks: 1_000,
        }
    }
}

/// A rejected `configure` payload or CLI flag combination.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pool_max must be >= 2, got {0}")]
    PoolMaxTooSmall(u32),
    #[error("close_tracking_count must be <= pool_max - 2 ({max}), got {got}")]
    CloseTrackingCountTooLarge { got: u32, max: u32 },
}

impl RouterConfig {
    /// Validates `pool_max >= 2` and `close_tracking_count <= pool_max - 2`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_max < 2 {
            return Err(ConfigError::PoolMaxTooSmall(self.pool_max));
        }
        let max_close_tracking = self.pool_max - 2;
        if self.close_tracking_count > max_close_tracking {
            return Err(ConfigError::CloseTrackingCountTooLarge {
                got: self.close_tracking_count,
                max: max_close_tracking,
            });
        }
        Ok(())
    }

    /// Applies a partial update (as delivered by a `configure` task),
    /// returning the new config without mutating `self`, so the caller
    /// can validate before committing.
    pub fn merged_with(&self, update: &ConfigUpdate) -> RouterConfig {
        let mut next = self.clone();
        if let Some(v) = update.pool_max {
            next.pool_max = v;
        }
        if let Some(v) = update.close_tracking_count {
            next.close_tracking_count = v;
        }
        if let Some(v) = update.interrupt_supported {
            next.interrupt_supported = v;
        }
        if let Some(v) = update.cancel_timeout_ms {
            next.cancel_timeout_ms = v;
        }
        if let Some(v) = update.start_timeout_ms {
            next.start_timeout_ms = v;
        }
        if let Some(v) = update.kill_timeout_ms {
            next.kill_timeout_ms = v;
        }
        if let Some(v) = update.reset_last_location {
            next.reset_last_location = v;
        }
        if let Some(v) = update.close_tracking_proximity_ticks {
            next.close_tracking_proximity_ticks = v;
        }
        next
    }
}

/// A partial `configure` payload: only the fields present are changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub pool_max: Option<u32>,
    pub close_tracking_count: Option<u32>,
    pub interrupt_supported: Option<bool>,
    pub cancel_timeout_ms: Option<u64>,
    pub start_timeout_ms: Option<u64>,
    pub kill_timeout_ms: Option<u64>,
    pub reset_last_location: Option<bool>,
    pub close_tracking_proximity_ticks: Option<u64>,
}
