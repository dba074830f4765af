//! The run engine: validates and starts a sequence, executes its points on a
//! background task, and exposes pause, resume and stop.
//!
//! # Threading
//!
//! `start` spawns exactly one worker task per run. Control calls never touch
//! plugins; they flip the engine state and send a [`RunControl`] signal over
//! a `watch` channel that the worker reads at every point boundary. A point
//! that has started always runs to completion (or failure) before pause or
//! stop take effect. Only the worker writes the terminal states.
//!
//! # Point execution
//!
//! For each point: stamp the time, push parameters to every measurement
//! plugin, wait the settle delay, measure with every measurement plugin,
//! feed the accumulated results to every processing plugin, persist, then
//! emit `on_point_complete` and `on_progress`.

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::events::{panic_message, EngineEvent, EventHub, Progress, SubscriptionId};
use super::state::{ActiveRuns, EngineState, RunClaim, RunControl};
use crate::core::{processed_key, FieldValue, PointResults, UNIT_INFO_KEY};
use crate::error::{AppResult, SweepError};
use crate::plugin::{MeasurementHandle, Plugin, PluginRegistry, ProcessingHandle};
use crate::sequence::{MeasurementPoint, SequenceDefinition};
use crate::storage::ResultStore;

/// What the worker does when the store rejects a point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFailurePolicy {
    /// Fail the run.
    #[default]
    Abort,
    /// Keep the point in memory, retry before later saves and at run end,
    /// and report anything still unsaved in the [`RunOutcome`].
    Buffer,
}

/// Engine tuning.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Wait between pushing parameters and measuring.
    pub settle_delay: Duration,
    /// Capacity of the broadcast event channel.
    pub event_capacity: usize,
    /// What the worker does when a save fails.
    pub storage_failure: StorageFailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            event_capacity: 256,
            storage_failure: StorageFailurePolicy::Abort,
        }
    }
}

/// Snapshot of the engine for status displays.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EngineStatus {
    /// Current state.
    pub state: EngineState,
    /// Identifier of the current or most recent run.
    pub run_id: Option<Uuid>,
    /// Name of the current or most recent sequence.
    pub sequence: Option<String>,
    /// Points executed so far in that run.
    pub points_executed: usize,
    /// Points in that run.
    pub total_points: usize,
}

/// Result of a finished run, returned by [`RunEngine::wait`].
#[derive(Debug)]
pub struct RunOutcome {
    /// Identifier assigned by [`RunEngine::start`].
    pub run_id: Uuid,
    /// `Completed`, `Stopped` or `Failed`.
    pub state: EngineState,
    /// The sequence with the results of every executed point attached.
    pub sequence: SequenceDefinition,
    /// Points executed before the run ended.
    pub points_executed: usize,
    /// Why the run failed, when it did.
    pub error: Option<SweepError>,
    /// Points that were executed but could not be persisted.
    pub unsaved_points: Vec<MeasurementPoint>,
}

struct ActivePlugins {
    measurement: Vec<(String, MeasurementHandle)>,
    processing: Vec<(String, ProcessingHandle)>,
}

impl ActivePlugins {
    fn resolve(registry: &PluginRegistry, sequence: &SequenceDefinition) -> AppResult<Self> {
        let mut seen = HashSet::new();
        let names = sequence
            .active_measurement_plugins
            .iter()
            .chain(&sequence.processing_plugins);
        for name in names {
            if !seen.insert(name.as_str()) {
                return Err(SweepError::config(format!(
                    "plugin '{name}' is listed more than once"
                )));
            }
        }

        let lookup = |name: &str| {
            registry.get_or_create(name).map_err(|e| match e {
                SweepError::PluginNotFound(name) => {
                    SweepError::config(format!("sequence references unknown plugin '{name}'"))
                }
                other => other,
            })
        };

        let mut measurement = Vec::new();
        for name in &sequence.active_measurement_plugins {
            let handle = lookup(name.as_str())?.as_measurement().ok_or_else(|| {
                SweepError::config(format!("plugin '{name}' is not a measurement plugin"))
            })?;
            measurement.push((name.clone(), handle));
        }

        let mut processing = Vec::new();
        for name in &sequence.processing_plugins {
            let handle = lookup(name.as_str())?.as_processing().ok_or_else(|| {
                SweepError::config(format!("plugin '{name}' is not a processing plugin"))
            })?;
            processing.push((name.clone(), handle));
        }

        Ok(Self {
            measurement,
            processing,
        })
    }

    /// Initialize in order. On failure the plugins already initialized, and
    /// the one that failed, are cleaned up again.
    async fn initialize(&self) -> AppResult<()> {
        let mut done = 0;
        let mut failure = None;
        for (name, plugin) in &self.measurement {
            if let Err(source) = plugin.lock().await.initialize().await {
                failure = Some((name.clone(), source));
                break;
            }
            done += 1;
        }
        if failure.is_none() {
            for (name, plugin) in &self.processing {
                if let Err(source) = plugin.lock().await.initialize().await {
                    failure = Some((name.clone(), source));
                    break;
                }
                done += 1;
            }
        }

        let Some((plugin, source)) = failure else {
            return Ok(());
        };
        error!(plugin = %plugin, error = %source, "Plugin initialization failed");
        self.cleanup_first(done + 1).await;
        Err(SweepError::PluginLifecycle { plugin, source })
    }

    async fn cleanup_first(&self, count: usize) {
        for (name, plugin) in self.measurement.iter().take(count) {
            if let Err(e) = plugin.lock().await.cleanup().await {
                warn!(plugin = %name, error = %e, "Plugin cleanup failed");
            }
        }
        let rest = count.saturating_sub(self.measurement.len());
        for (name, plugin) in self.processing.iter().take(rest) {
            if let Err(e) = plugin.lock().await.cleanup().await {
                warn!(plugin = %name, error = %e, "Plugin cleanup failed");
            }
        }
    }

    async fn cleanup(&self) {
        self.cleanup_first(self.measurement.len() + self.processing.len())
            .await;
    }
}

/// Everything the worker task owns for one run.
struct RunContext {
    run_id: Uuid,
    plugins: ActivePlugins,
    store: Arc<dyn ResultStore>,
    events: Arc<EventHub>,
    status: Arc<Mutex<EngineStatus>>,
    config: EngineConfig,
    control: watch::Receiver<RunControl>,
    claim: RunClaim,
}

impl RunContext {
    async fn run(self, sequence: SequenceDefinition) -> RunOutcome {
        let span = info_span!(
            "sequence_run",
            run_id = %self.run_id,
            sequence = %sequence.name,
            points = sequence.measurement_points().len()
        );
        self.execute(sequence).instrument(span).await
    }

    async fn execute(mut self, mut sequence: SequenceDefinition) -> RunOutcome {
        let sequence_name = sequence.name.clone();
        let total = sequence.measurement_points().len();
        let started = Instant::now();
        let mut pending = VecDeque::new();
        let mut executed = 0;
        let mut failure = None;
        let mut stopped = false;

        info!("Sequence started");
        self.events.started(&sequence);

        for index in 0..total {
            if !self.proceed().await {
                stopped = true;
                break;
            }

            let point = &mut sequence.measurement_points_mut()[index];
            let point_name = point.name.clone();
            let span = debug_span!("point", point = %point_name, index);
            let result = match AssertUnwindSafe(self.execute_point(point))
                .catch_unwind()
                .instrument(span)
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(SweepError::Panicked {
                    point: point_name,
                    message: panic_message(panic.as_ref()),
                }),
            };

            let persisted = match result {
                Ok(()) => self.persist(&sequence_name, point, &mut pending).await,
                Err(e) => Err(e),
            };
            if let Err(e) = persisted {
                error!(error = %e, "Sequence failed");
                failure = Some(e);
                break;
            }

            executed += 1;
            self.status.lock().points_executed = executed;
            let progress = Progress::new(executed, total, started.elapsed());
            self.events.point_complete(point, &progress);
        }

        if !pending.is_empty() {
            self.flush_pending(&sequence_name, &mut pending).await;
            if !pending.is_empty() {
                warn!(unsaved = pending.len(), "Run ended with unsaved points");
            }
        }

        self.plugins.cleanup().await;
        drop(self.claim);

        let state = if failure.is_some() {
            EngineState::Failed
        } else if stopped {
            EngineState::Stopped
        } else {
            EngineState::Completed
        };
        self.status.lock().state = state;

        match (&failure, state) {
            (Some(err), _) => self.events.failed(&sequence, err),
            (None, EngineState::Stopped) => {
                info!(points_executed = executed, "Sequence stopped");
                self.events.stopped(&sequence, executed);
            }
            _ => {
                info!(elapsed = ?started.elapsed(), "Sequence completed");
                self.events.completed(&sequence);
            }
        }

        RunOutcome {
            run_id: self.run_id,
            state,
            sequence,
            points_executed: executed,
            error: failure,
            unsaved_points: pending.into(),
        }
    }

    /// Block while paused. Returns false when the run must stop.
    async fn proceed(&mut self) -> bool {
        if *self.control.borrow() == RunControl::Pause {
            info!("Run paused");
        }
        let signal = match self.control.wait_for(|c| *c != RunControl::Pause).await {
            Ok(signal) => *signal,
            Err(_) => RunControl::Stop,
        };
        signal == RunControl::Run
    }

    async fn execute_point(&self, point: &mut MeasurementPoint) -> AppResult<()> {
        let timestamp = Utc::now();

        for (name, plugin) in &self.plugins.measurement {
            plugin
                .lock()
                .await
                .set_parameters(&point.parameters)
                .await
                .map_err(|source| SweepError::Measurement {
                    plugin: name.clone(),
                    point: point.name.clone(),
                    source,
                })?;
        }

        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }

        let mut results = PointResults::new();
        for (name, plugin) in &self.plugins.measurement {
            let mut plugin = plugin.lock().await;
            let mut fields = plugin
                .measure()
                .await
                .map_err(|source| SweepError::Measurement {
                    plugin: name.clone(),
                    point: point.name.clone(),
                    source,
                })?;
            if !fields.contains_key(UNIT_INFO_KEY) {
                let units = plugin.units();
                if !units.is_empty() {
                    let units = units
                        .into_iter()
                        .map(|(field, unit)| (field, FieldValue::Text(unit)))
                        .collect();
                    fields.insert(UNIT_INFO_KEY.to_string(), FieldValue::Map(units));
                }
            }
            results.insert(name.clone(), fields);
        }

        for (name, plugin) in &self.plugins.processing {
            let derived = plugin
                .lock()
                .await
                .process(&results)
                .await
                .map_err(|source| SweepError::Processing {
                    plugin: name.clone(),
                    point: point.name.clone(),
                    source,
                })?;
            results.insert(processed_key(name), derived);
        }

        point.record(timestamp, results);
        debug!("Point executed");
        Ok(())
    }

    async fn persist(
        &self,
        sequence_name: &str,
        point: &MeasurementPoint,
        pending: &mut VecDeque<MeasurementPoint>,
    ) -> AppResult<()> {
        match self.config.storage_failure {
            StorageFailurePolicy::Abort => {
                self.store.save_point(sequence_name, point).await?;
            }
            StorageFailurePolicy::Buffer => {
                self.flush_pending(sequence_name, pending).await;
                if pending.is_empty() {
                    match self.store.save_point(sequence_name, point).await {
                        Ok(()) => return Ok(()),
                        Err(e) => warn!(error = %e, "Storage failed, buffering point"),
                    }
                }
                pending.push_back(point.clone());
            }
        }
        Ok(())
    }

    async fn flush_pending(&self, sequence_name: &str, pending: &mut VecDeque<MeasurementPoint>) {
        while let Some(point) = pending.front() {
            match self.store.save_point(sequence_name, point).await {
                Ok(()) => {
                    debug!(point = %point.name, "Buffered point saved");
                    pending.pop_front();
                }
                Err(e) => {
                    debug!(error = %e, buffered = pending.len(), "Storage still failing");
                    break;
                }
            }
        }
    }
}

/// Executes sequences against the plugins of a registry and stores the
/// results. One run at a time per engine.
pub struct RunEngine {
    registry: Arc<PluginRegistry>,
    store: Arc<dyn ResultStore>,
    config: EngineConfig,
    events: Arc<EventHub>,
    status: Arc<Mutex<EngineStatus>>,
    control: Mutex<Option<watch::Sender<RunControl>>>,
    worker: AsyncMutex<Option<JoinHandle<RunOutcome>>>,
    active_runs: ActiveRuns,
}

impl RunEngine {
    /// An idle engine over `registry` and `store`.
    pub fn new(
        registry: Arc<PluginRegistry>,
        store: Arc<dyn ResultStore>,
        config: EngineConfig,
    ) -> Self {
        let events = Arc::new(EventHub::new(config.event_capacity));
        Self {
            registry,
            store,
            config,
            events,
            status: Arc::new(Mutex::new(EngineStatus {
                state: EngineState::Idle,
                run_id: None,
                sequence: None,
                points_executed: 0,
                total_points: 0,
            })),
            control: Mutex::new(None),
            worker: AsyncMutex::new(None),
            active_runs: ActiveRuns::new(),
        }
    }

    /// Share the set of running sequence names with other engines.
    pub fn with_active_runs(mut self, active_runs: ActiveRuns) -> Self {
        self.active_runs = active_runs;
        self
    }

    /// The configuration this engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current state. Terminal states are written only by the worker.
    pub fn state(&self) -> EngineState {
        self.status.lock().state
    }

    /// Snapshot of state and progress.
    pub fn status(&self) -> EngineStatus {
        self.status.lock().clone()
    }

    /// The callback channels, for unsubscribing.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Receive every run event on a broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Called once per run, after plugin initialization.
    pub fn on_start<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&SequenceDefinition) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.on_start.subscribe(f)
    }

    /// Called after each point is executed and persisted.
    pub fn on_point_complete<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&MeasurementPoint) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.on_point_complete.subscribe(f)
    }

    /// Called after each point with counts and an ETA.
    pub fn on_progress<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&Progress) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.on_progress.subscribe(f)
    }

    /// Called when every point of a run was executed. Not called for stopped runs.
    pub fn on_complete<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&SequenceDefinition) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.on_complete.subscribe(f)
    }

    /// Called when a run fails.
    pub fn on_error<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&SweepError) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.on_error.subscribe(f)
    }

    /// Validate `sequence`, initialize its plugins and start executing it in
    /// the background.
    ///
    /// Fails with `AlreadyRunning` while a run is active, with
    /// `InvalidConfig` for an unusable sequence, and with `PluginLifecycle`
    /// when a plugin cannot be initialized. The engine state is unchanged on
    /// any failure.
    pub async fn start(&self, sequence: SequenceDefinition) -> AppResult<()> {
        let mut worker = self.worker.lock().await;
        if self.state().is_active() {
            return Err(SweepError::AlreadyRunning);
        }
        if let Some(previous) = worker.take() {
            // The previous worker has already written its terminal state.
            if let Err(e) = previous.await {
                warn!(error = %e, "Previous run worker did not finish cleanly");
            }
        }

        let problems = sequence.validate();
        if !problems.is_empty() {
            return Err(SweepError::config(problems.join("; ")));
        }
        let total = sequence.measurement_points().len();
        if total == 0 {
            return Err(SweepError::config(format!(
                "sequence '{}' has no measurement points",
                sequence.name
            )));
        }

        let plugins = ActivePlugins::resolve(&self.registry, &sequence)?;
        let claim = self.active_runs.claim(&sequence.name).ok_or_else(|| {
            SweepError::config(format!("sequence '{}' is already running", sequence.name))
        })?;
        plugins.initialize().await?;

        let run_id = Uuid::new_v4();
        let (tx, rx) = watch::channel(RunControl::Run);
        *self.control.lock() = Some(tx);
        *self.status.lock() = EngineStatus {
            state: EngineState::Running,
            run_id: Some(run_id),
            sequence: Some(sequence.name.clone()),
            points_executed: 0,
            total_points: total,
        };

        info!(%run_id, sequence = %sequence.name, points = total, "Starting run");
        let context = RunContext {
            run_id,
            plugins,
            store: Arc::clone(&self.store),
            events: Arc::clone(&self.events),
            status: Arc::clone(&self.status),
            config: self.config.clone(),
            control: rx,
            claim,
        };
        *worker = Some(tokio::spawn(context.run(sequence)));
        Ok(())
    }

    /// Send `control` to the worker. A pending `Stop` is never replaced.
    fn signal(&self, control: RunControl) {
        if let Some(tx) = self.control.lock().as_ref() {
            tx.send_if_modified(|current| {
                if *current == RunControl::Stop || *current == control {
                    return false;
                }
                *current = control;
                true
            });
        }
    }

    fn stop_requested(&self) -> bool {
        self.control
            .lock()
            .as_ref()
            .is_some_and(|tx| *tx.borrow() == RunControl::Stop)
    }

    /// Pause a running sequence at the next point boundary. Returns false
    /// (and does nothing) unless the engine is `Running` and no stop has
    /// been requested.
    pub fn pause(&self) -> bool {
        let mut status = self.status.lock();
        if status.state != EngineState::Running || self.stop_requested() {
            debug!(state = %status.state, "Pause ignored");
            return false;
        }
        status.state = EngineState::Paused;
        self.signal(RunControl::Pause);
        info!("Pause requested");
        true
    }

    /// Resume a paused sequence. Returns false unless the engine is `Paused`
    /// and no stop has been requested.
    pub fn resume(&self) -> bool {
        let mut status = self.status.lock();
        if status.state != EngineState::Paused || self.stop_requested() {
            debug!(state = %status.state, "Resume ignored");
            return false;
        }
        status.state = EngineState::Running;
        self.signal(RunControl::Run);
        info!("Resume requested");
        true
    }

    /// Request a stop; the worker ends the run at the next point boundary
    /// with state `Stopped`. The request cannot be withdrawn: later `pause`
    /// and `resume` calls are ignored. Returns false when no run is active.
    pub fn stop(&self) -> bool {
        let status = self.status.lock();
        if !status.state.is_active() {
            debug!(state = %status.state, "Stop ignored");
            return false;
        }
        self.signal(RunControl::Stop);
        info!("Stop requested");
        true
    }

    /// Wait for the current run's worker to finish. Returns `None` when no
    /// run was started since the last `wait`.
    pub async fn wait(&self) -> Option<RunOutcome> {
        let handle = self.worker.lock().await.take()?;
        match handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(error = %e, "Run worker aborted");
                self.status.lock().state = EngineState::Failed;
                None
            }
        }
    }
}

impl Drop for RunEngine {
    fn drop(&mut self) {
        self.signal(RunControl::Stop);
    }
}
