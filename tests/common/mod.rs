//! Shared fixtures: scripted plugins, a flaky store and engine helpers.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use rust_sweep::core::{FieldMap, FieldValue, ParameterSet, PointResults, Reading};
use rust_sweep::engine::{EngineConfig, EngineState, RunEngine};
use rust_sweep::error::{PluginError, StorageError};
use rust_sweep::plugin::{
    MeasurementPlugin, Plugin, PluginDescriptor, PluginFactory, PluginKind, PluginRegistry,
    ProcessingPlugin,
};
use rust_sweep::sequence::{ParameterRange, SequenceDefinition};
use rust_sweep::storage::{HistoryEntry, PointRecord, ResultStore, SqliteResultStore};

/// What a scripted plugin observed, shared with the test.
#[derive(Default)]
pub struct Tally {
    pub calls: Mutex<Vec<String>>,
    pub in_flight: AtomicBool,
    pub reentered: AtomicBool,
    pub measured: AtomicUsize,
    pub initialized: AtomicUsize,
    pub cleaned_up: AtomicUsize,
}

impl Tally {
    pub fn measured(&self) -> usize {
        self.measured.load(Ordering::SeqCst)
    }

    pub fn cleaned_up(&self) -> usize {
        self.cleaned_up.load(Ordering::SeqCst)
    }
}

/// Behaviour of a [`ScriptedSensor`].
#[derive(Clone, Default)]
pub struct Script {
    /// Parameter to read; `reading` is twice its value.
    pub parameter: String,
    /// 1-based `measure` call that returns an error.
    pub fail_on: Option<usize>,
    /// 1-based `measure` call that panics.
    pub panic_on: Option<usize>,
    pub measure_delay: Duration,
    pub fail_initialize: bool,
    /// Reported instead of `2 * parameter` when set.
    pub constant: Option<f64>,
    pub tally: Arc<Tally>,
}

impl Script {
    pub fn doubling(parameter: &str) -> Self {
        Self {
            parameter: parameter.to_string(),
            ..Self::default()
        }
    }

    pub fn failing_on(mut self, call: usize) -> Self {
        self.fail_on = Some(call);
        self
    }

    pub fn panicking_on(mut self, call: usize) -> Self {
        self.panic_on = Some(call);
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.measure_delay = delay;
        self
    }

    pub fn reporting(mut self, value: f64) -> Self {
        self.constant = Some(value);
        self
    }

    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }
}

/// Measurement plugin returning `reading = 2 * parameter`.
pub struct ScriptedSensor {
    name: String,
    script: Script,
    value: f64,
}

impl ScriptedSensor {
    pub fn factory(name: &str, script: Script) -> PluginFactory {
        let descriptor = PluginDescriptor::new(name, "1.0", PluginKind::Measurement);
        let name = name.to_string();
        PluginFactory::measurement(descriptor, move || ScriptedSensor {
            name: name.clone(),
            script: script.clone(),
            value: 0.0,
        })
    }

    fn log(&self, call: &str) {
        self.script.tally.calls.lock().push(format!("{}:{}", self.name, call));
    }
}

#[async_trait]
impl Plugin for ScriptedSensor {
    fn describe(&self) -> PluginDescriptor {
        PluginDescriptor::new(&self.name, "1.0", PluginKind::Measurement)
    }

    async fn initialize(&mut self) -> Result<(), PluginError> {
        self.log("initialize");
        self.script.tally.initialized.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_initialize {
            return Err(PluginError::Initialization("instrument offline".into()));
        }
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), PluginError> {
        self.log("cleanup");
        self.script.tally.cleaned_up.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MeasurementPlugin for ScriptedSensor {
    async fn set_parameters(&mut self, parameters: &ParameterSet) -> Result<(), PluginError> {
        self.log("set_parameters");
        if self.script.tally.in_flight.swap(true, Ordering::SeqCst) {
            self.script.tally.reentered.store(true, Ordering::SeqCst);
        }
        self.value = parameters.get(&self.script.parameter).copied().unwrap_or(0.0);
        Ok(())
    }

    async fn measure(&mut self) -> Result<FieldMap, PluginError> {
        self.log("measure");
        let call = self.script.tally.measured.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.script.measure_delay.is_zero() {
            tokio::time::sleep(self.script.measure_delay).await;
        }
        self.script.tally.in_flight.store(false, Ordering::SeqCst);
        if self.script.panic_on == Some(call) {
            panic!("sensor firmware crashed on call {call}");
        }
        if self.script.fail_on == Some(call) {
            return Err(PluginError::Acquisition(format!("timeout on call {call}")));
        }
        Ok(Reading::new()
            .field("reading", self.script.constant.unwrap_or(self.value * 2.0))
            .unit("reading", "a.u.")
            .build())
    }
}

/// Processing plugin that sums every numeric field it sees and records the
/// plugin keys present in its input.
pub struct Summer {
    name: String,
    seen: Arc<Mutex<Vec<BTreeSet<String>>>>,
}

impl Summer {
    pub fn factory(name: &str, seen: Arc<Mutex<Vec<BTreeSet<String>>>>) -> PluginFactory {
        let descriptor = PluginDescriptor::new(name, "1.0", PluginKind::Processing);
        let name = name.to_string();
        PluginFactory::processing(descriptor, move || Summer {
            name: name.clone(),
            seen: seen.clone(),
        })
    }
}

#[async_trait]
impl Plugin for Summer {
    fn describe(&self) -> PluginDescriptor {
        PluginDescriptor::new(&self.name, "1.0", PluginKind::Processing)
    }

    async fn initialize(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

#[async_trait]
impl ProcessingPlugin for Summer {
    fn required_inputs(&self) -> BTreeSet<String> {
        BTreeSet::from(["reading".to_string()])
    }

    async fn process(&mut self, results: &PointResults) -> Result<FieldMap, PluginError> {
        self.seen.lock().push(results.keys().cloned().collect());
        let sum: f64 = results
            .values()
            .flat_map(|fields| fields.values())
            .filter_map(FieldValue::as_f64)
            .sum();
        Ok(Reading::new().field("sum", sum).build())
    }
}

/// Store that fails saves while `failing` is set, or on selected save calls.
pub struct FlakyStore {
    pub inner: SqliteResultStore,
    pub failing: AtomicBool,
    pub fail_calls: BTreeSet<usize>,
    pub calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteResultStore::open_in_memory().unwrap(),
            failing: AtomicBool::new(false),
            fail_calls: BTreeSet::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_calls(calls: &[usize]) -> Self {
        Self {
            fail_calls: calls.iter().copied().collect(),
            ..Self::new()
        }
    }
}

#[async_trait]
impl ResultStore for FlakyStore {
    async fn save(
        &self,
        sequence_name: &str,
        point_name: &str,
        timestamp: DateTime<Utc>,
        parameters: &ParameterSet,
        results: &PointResults,
    ) -> Result<(), StorageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.load(Ordering::SeqCst) || self.fail_calls.contains(&call) {
            return Err(StorageError::Worker(format!("disk unavailable (save {call})")));
        }
        self.inner
            .save(sequence_name, point_name, timestamp, parameters, results)
            .await
    }

    async fn query_by_sequence(&self, sequence_name: &str) -> Result<Vec<PointRecord>, StorageError> {
        self.inner.query_by_sequence(sequence_name).await
    }

    async fn query_parameter_history(
        &self,
        sequence_name: &str,
        field_name: &str,
    ) -> Result<Vec<HistoryEntry>, StorageError> {
        self.inner
            .query_parameter_history(sequence_name, field_name)
            .await
    }

    async fn list_sequence_names(&self) -> Result<BTreeSet<String>, StorageError> {
        self.inner.list_sequence_names().await
    }

    async fn delete(&self, sequence_name: &str) -> Result<usize, StorageError> {
        self.inner.delete(sequence_name).await
    }
}

/// Engine config without a settle delay.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        settle_delay: Duration::ZERO,
        ..EngineConfig::default()
    }
}

pub fn registry(factories: Vec<PluginFactory>) -> Arc<PluginRegistry> {
    let registry = PluginRegistry::new();
    for factory in factories {
        registry.register(factory);
    }
    Arc::new(registry)
}

pub fn engine_with(
    registry: Arc<PluginRegistry>,
    store: Arc<dyn ResultStore>,
    config: EngineConfig,
) -> RunEngine {
    RunEngine::new(registry, store, config)
}

/// One-range sequence over `parameter` with `steps` points measured by `plugin`.
pub fn linear_sequence(name: &str, parameter: &str, steps: i64, plugin: &str) -> SequenceDefinition {
    let mut sequence = SequenceDefinition::new(name, "test sweep").with_measurement_plugin(plugin);
    sequence.add_parameter_range(
        ParameterRange::new(parameter, 1.0, steps as f64, steps, "V").unwrap(),
    );
    sequence.generate_points().unwrap();
    sequence
}

pub async fn wait_for_state(engine: &RunEngine, state: EngineState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("engine never reached {state}, still {}", engine.state()));
}

pub fn readings(records: &[PointRecord], plugin: &str) -> Vec<f64> {
    records
        .iter()
        .filter_map(|r| r.numeric(plugin, "reading"))
        .collect()
}

pub fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

pub fn field_names(record: &PointRecord) -> BTreeMap<String, Vec<String>> {
    record
        .fields
        .iter()
        .map(|(plugin, fields)| (plugin.clone(), fields.keys().cloned().collect()))
        .collect()
}
