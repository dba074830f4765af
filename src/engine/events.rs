//! Run events and their delivery.
//!
//! Subscribers register closures on one of five channels. Every closure is
//! called synchronously on the worker task, in registration order. A closure
//! that returns an error or panics is logged and skipped; it never reaches
//! the worker, and the remaining subscribers still run.
//!
//! The same events are also published as [`EngineEvent`]s on a broadcast
//! channel for consumers that prefer to receive them on their own task.

use parking_lot::RwLock;
use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::error::SweepError;
use crate::sequence::{MeasurementPoint, SequenceDefinition};

/// Progress after a point has been executed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Progress {
    /// Number of points executed so far (1-based).
    pub current: usize,
    /// Points in the run.
    pub total: usize,
    /// `current / total` in percent.
    pub percentage: f64,
    /// Time since the run started.
    pub elapsed: Duration,
    /// Estimated time until completion, from the mean time per point so far.
    pub remaining: Option<Duration>,
}

impl Progress {
    /// Progress after `current` of `total` points, `elapsed` into the run.
    pub fn new(current: usize, total: usize, elapsed: Duration) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            current as f64 / total as f64 * 100.0
        };
        let remaining = (current > 0).then(|| {
            elapsed.mul_f64((total.saturating_sub(current)) as f64 / current as f64)
        });
        Self {
            current,
            total,
            percentage,
            elapsed,
            remaining,
        }
    }
}

/// Owned form of every run event, published on the broadcast channel.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// Plugins are initialized and the first point is about to run.
    Started {
        /// Sequence name.
        sequence: String,
        /// Points in the run.
        total_points: usize,
    },
    /// A point was executed and persisted (or buffered).
    PointComplete(Box<MeasurementPoint>),
    /// Emitted after every `PointComplete`.
    Progress(Progress),
    /// Every point was executed.
    Completed {
        /// Sequence name.
        sequence: String,
    },
    /// The run ended on a stop request.
    Stopped {
        /// Sequence name.
        sequence: String,
        /// Points executed before the stop took effect.
        points_executed: usize,
    },
    /// The run ended on an error.
    Failed {
        /// Sequence name.
        sequence: String,
        /// Rendered [`SweepError`].
        error: String,
    },
}

type Handler<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by a subscription, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// One callback channel.
pub struct EventChannel<T> {
    name: &'static str,
    handlers: RwLock<Vec<(SubscriptionId, Handler<T>)>>,
}

impl<T> EventChannel<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Add a handler. Errors and panics from it are logged and swallowed.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Returns false when the id was not subscribed here.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    /// Number of subscribed handlers.
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// True without subscribers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every subscriber with `payload`, isolating failures.
    pub fn emit(&self, payload: &T) {
        // Snapshot so handlers may subscribe or unsubscribe while being called.
        let handlers: Vec<Handler<T>> = self.handlers.read().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(event = self.name, error = %e, "Event subscriber failed"),
                Err(panic) => error!(
                    event = self.name,
                    panic = %panic_message(panic.as_ref()),
                    "Event subscriber panicked"
                ),
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// All event channels of one engine.
pub struct EventHub {
    /// Fired once the run has started.
    pub on_start: EventChannel<SequenceDefinition>,
    /// Fired after every executed point.
    pub on_point_complete: EventChannel<MeasurementPoint>,
    /// Fired after every executed point, following `on_point_complete`.
    pub on_progress: EventChannel<Progress>,
    /// Fired when a run completes. A stopped run only publishes `EngineEvent::Stopped`.
    pub on_complete: EventChannel<SequenceDefinition>,
    /// Fired when a run fails.
    pub on_error: EventChannel<SweepError>,
    tx: broadcast::Sender<EngineEvent>,
}

impl EventHub {
    /// Empty channels and a broadcast channel holding `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            on_start: EventChannel::new("on_start"),
            on_point_complete: EventChannel::new("on_point_complete"),
            on_progress: EventChannel::new("on_progress"),
            on_complete: EventChannel::new("on_complete"),
            on_error: EventChannel::new("on_error"),
            tx,
        }
    }

    /// Receive every event from now on. Slow receivers miss events once the
    /// channel capacity is exceeded.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn publish(&self, event: EngineEvent) {
        // No receivers is not an error.
        let _ = self.tx.send(event);
    }

    pub(crate) fn started(&self, sequence: &SequenceDefinition) {
        self.on_start.emit(sequence);
        self.publish(EngineEvent::Started {
            sequence: sequence.name.clone(),
            total_points: sequence.measurement_points().len(),
        });
    }

    pub(crate) fn point_complete(&self, point: &MeasurementPoint, progress: &Progress) {
        self.on_point_complete.emit(point);
        self.publish(EngineEvent::PointComplete(Box::new(point.clone())));
        self.on_progress.emit(progress);
        self.publish(EngineEvent::Progress(progress.clone()));
    }

    pub(crate) fn completed(&self, sequence: &SequenceDefinition) {
        self.on_complete.emit(sequence);
        self.publish(EngineEvent::Completed {
            sequence: sequence.name.clone(),
        });
    }

    pub(crate) fn stopped(&self, sequence: &SequenceDefinition, points_executed: usize) {
        self.publish(EngineEvent::Stopped {
            sequence: sequence.name.clone(),
            points_executed,
        });
    }

    pub(crate) fn failed(&self, sequence: &SequenceDefinition, err: &SweepError) {
        self.on_error.emit(err);
        self.publish(EngineEvent::Failed {
            sequence: sequence.name.clone(),
            error: err.to_string(),
        });
    }
}
