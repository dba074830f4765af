//! Engine states, worker control signals and the cross-engine run guard.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a [`RunEngine`](super::RunEngine).
///
/// ```text
/// Idle ──start──▶ Running ◀──resume── Paused
///                  │  └──────pause──────▲
///                  ├─▶ Completed   (all points executed)
///                  ├─▶ Stopped     (stop observed at a point boundary)
///                  └─▶ Failed      (plugin or storage error)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No run has been started.
    Idle,
    /// The worker is executing points.
    Running,
    /// The worker waits at a point boundary.
    Paused,
    /// Every point was executed.
    Completed,
    /// A stop request ended the run early.
    Stopped,
    /// A plugin or storage error ended the run.
    Failed,
}

impl EngineState {
    /// A run is in progress (possibly paused).
    pub fn is_active(self) -> bool {
        matches!(self, EngineState::Running | EngineState::Paused)
    }

    /// The last run has finished, one way or another.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EngineState::Completed | EngineState::Stopped | EngineState::Failed
        )
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Running => "running",
            EngineState::Paused => "paused",
            EngineState::Completed => "completed",
            EngineState::Stopped => "stopped",
            EngineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Signal from the control surface to the worker, observed at point boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunControl {
    /// Keep executing points.
    Run,
    /// Wait before the next point.
    Pause,
    /// End the run before the next point. Never replaced once sent.
    Stop,
}

/// Names of the sequences currently executing, shared between engines so
/// that the same sequence never runs twice at once.
#[derive(Clone, Debug, Default)]
pub struct ActiveRuns(Arc<Mutex<HashSet<String>>>);

impl ActiveRuns {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `name`. Returns `None` when it is already running.
    pub fn claim(&self, name: &str) -> Option<RunClaim> {
        if self.0.lock().insert(name.to_string()) {
            Some(RunClaim {
                runs: self.clone(),
                name: name.to_string(),
            })
        } else {
            None
        }
    }

    /// Whether `name` is currently claimed.
    pub fn is_active(&self, name: &str) -> bool {
        self.0.lock().contains(name)
    }
}

/// Reservation of a sequence name; released on drop.
#[derive(Debug)]
pub struct RunClaim {
    runs: ActiveRuns,
    name: String,
}

impl RunClaim {
    /// The claimed sequence name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.runs.0.lock().remove(&self.name);
    }
}
