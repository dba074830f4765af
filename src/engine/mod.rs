//! Sequence execution.
//!
//! ```text
//!  caller ──start/pause/resume/stop──▶ RunEngine ──watch──▶ worker task
//!                                         │                   │
//!                                     EngineStatus ◀──────────┤ set params, settle,
//!                                         │                   │ measure, process,
//!  subscribers ◀──── EventHub ◀───────────┴───────────────────┘ persist
//! ```

mod events;
mod run_engine;
mod state;

pub use events::{EngineEvent, EventChannel, EventHub, Progress, SubscriptionId};
pub use run_engine::{EngineConfig, EngineStatus, RunEngine, RunOutcome, StorageFailurePolicy};
pub use state::{ActiveRuns, EngineState, RunClaim, RunControl};
