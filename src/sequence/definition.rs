//! Sequence definition and its persisted JSON document.
//!
//! The document layout is:
//!
//! ```json
//! {
//!   "name": "Temperature sweep",
//!   "description": "...",
//!   "parameter_ranges": [{"parameter_name": "temperature", "start": 20.0, "end": 80.0, "steps": 4, "unit": "°C"}],
//!   "measurement_points": [{"name": "Point_1", "parameters": {"temperature": 20.0}, "timestamp": null, "results": {}}],
//!   "active_plugins": ["TemperatureSensor"],
//!   "processing_plugins": ["StatisticsProcessor"],
//!   "metadata": {"operator": "lab"}
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::ParameterSet;
use crate::error::{AppResult, SweepError};

use super::point::MeasurementPoint;
use super::range::ParameterRange;

/// An ordered sweep plus the plugins to invoke at every point.
///
/// Owns its ranges and points exclusively. Parameter names are not checked for
/// duplicates: two ranges with the same name collide in each point's parameter
/// map and the later range wins, so avoiding duplicates is the caller's job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    /// Unique name; results are stored under it.
    pub name: String,
    /// Free text.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    parameter_ranges: Vec<ParameterRange>,
    #[serde(default)]
    measurement_points: Vec<MeasurementPoint>,
    /// Measurement plugins, invoked in this order.
    #[serde(default, rename = "active_plugins")]
    pub active_measurement_plugins: Vec<String>,
    /// Processing plugins, invoked in this order after all measurements.
    #[serde(default)]
    pub processing_plugins: Vec<String>,
    /// Free-form annotations such as the operator.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl SequenceDefinition {
    /// An empty sequence.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameter_ranges: Vec::new(),
            measurement_points: Vec::new(),
            active_measurement_plugins: Vec::new(),
            processing_plugins: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Append a range. Points are not regenerated.
    pub fn add_parameter_range(&mut self, range: ParameterRange) {
        self.parameter_ranges.push(range);
    }

    /// Append a hand-written point. Regenerating discards it.
    pub fn add_measurement_point(&mut self, point: MeasurementPoint) {
        self.measurement_points.push(point);
    }

    /// Append a measurement plugin.
    pub fn with_measurement_plugin(mut self, name: &str) -> Self {
        self.active_measurement_plugins.push(name.to_string());
        self
    }

    /// Append a processing plugin.
    pub fn with_processing_plugin(mut self, name: &str) -> Self {
        self.processing_plugins.push(name.to_string());
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Ranges in declaration order.
    pub fn parameter_ranges(&self) -> &[ParameterRange] {
        &self.parameter_ranges
    }

    /// Points in execution order.
    pub fn measurement_points(&self) -> &[MeasurementPoint] {
        &self.measurement_points
    }

    pub(crate) fn measurement_points_mut(&mut self) -> &mut [MeasurementPoint] {
        &mut self.measurement_points
    }

    /// Number of points [`generate_points`](Self::generate_points) would
    /// produce. Fails with `InvalidConfig` when the product of all step
    /// counts does not fit in `usize`.
    pub fn total_points(&self) -> AppResult<usize> {
        self.parameter_ranges
            .iter()
            .try_fold(1usize, |total, range| total.checked_mul(range.steps()))
            .ok_or_else(|| {
                SweepError::config(format!(
                    "sequence '{}' has too many points to enumerate",
                    self.name
                ))
            })
    }

    /// Lower bound on run time: one settle delay per point.
    pub fn estimated_duration(&self, settle_delay: Duration) -> Duration {
        settle_delay.saturating_mul(self.measurement_points.len() as u32)
    }

    /// Replace the point list with the Cartesian product of all ranges.
    ///
    /// The first range varies slowest and the last range fastest. Points are
    /// named `Point_1..Point_N`. Previously recorded results are discarded, so
    /// this must never be called while a run is using the sequence. Without any
    /// ranges this is a no-op and hand-written points are kept. Fails with
    /// `InvalidConfig`, leaving the points untouched, when the point count
    /// overflows.
    pub fn generate_points(&mut self) -> AppResult<()> {
        if self.parameter_ranges.is_empty() {
            debug!(sequence = %self.name, "No parameter ranges, keeping existing points");
            return Ok(());
        }
        let total = self.total_points()?;

        let axes: Vec<(&str, Vec<f64>)> = self
            .parameter_ranges
            .iter()
            .map(|r| (r.name(), r.values()))
            .collect();

        let mut points = Vec::with_capacity(total);
        let mut indices = vec![0usize; axes.len()];
        for n in 0..total {
            let mut parameters = ParameterSet::new();
            for ((name, values), &i) in axes.iter().zip(&indices) {
                parameters.insert((*name).to_string(), values[i]);
            }
            points.push(MeasurementPoint::new(format!("Point_{}", n + 1), parameters));

            // Odometer increment, last axis fastest.
            for axis in (0..axes.len()).rev() {
                indices[axis] += 1;
                if indices[axis] < axes[axis].1.len() {
                    break;
                }
                indices[axis] = 0;
            }
        }

        self.measurement_points = points;
        info!(sequence = %self.name, points = total, "Generated measurement points");
        Ok(())
    }

    /// Every problem with this definition, empty when it is valid.
    ///
    /// Plugin names are not checked here; that needs a registry and happens
    /// when a run starts.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("sequence name is empty".to_string());
        }
        for (i, range) in self.parameter_ranges.iter().enumerate() {
            if range.name().trim().is_empty() {
                problems.push(format!("parameter range {i}: name is empty"));
            }
        }
        for (i, point) in self.measurement_points.iter().enumerate() {
            if point.name.trim().is_empty() {
                problems.push(format!("measurement point {i}: name is empty"));
            }
            if point.parameters.values().any(|v| !v.is_finite()) {
                problems.push(format!("measurement point {i}: non-finite parameter"));
            }
        }
        problems
    }

    /// The JSON document.
    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a JSON document; ranges are validated.
    pub fn from_json(json: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write the JSON document to `path`.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?)?;
        info!(sequence = %self.name, path = %path.display(), "Sequence saved");
        Ok(())
    }

    /// Read a JSON document from `path`.
    pub fn load_from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let sequence = Self::from_json(&std::fs::read_to_string(path)?)?;
        info!(sequence = %sequence.name, path = %path.display(), "Sequence loaded");
        Ok(sequence)
    }
}
