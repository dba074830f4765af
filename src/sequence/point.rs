//! One concrete combination of swept values plus the results recorded for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{FieldMap, ParameterSet, PointResults};

/// A measurement point.
///
/// Created by [`SequenceDefinition::generate_points`](super::SequenceDefinition::generate_points)
/// or loaded from a document. `timestamp` and `results` are filled in once, by the
/// engine worker that executes the point, through [`MeasurementPoint::record`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementPoint {
    /// Unique within the sequence, `Point_N` when generated.
    pub name: String,
    /// Values pushed to every measurement plugin.
    pub parameters: ParameterSet,
    /// When execution started; `None` until executed.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Results by plugin, empty until executed.
    #[serde(default)]
    pub results: PointResults,
}

impl MeasurementPoint {
    /// An unexecuted point.
    pub fn new(name: impl Into<String>, parameters: ParameterSet) -> Self {
        Self {
            name: name.into(),
            parameters,
            timestamp: None,
            results: PointResults::new(),
        }
    }

    /// Builder-style helper for hand-written points.
    pub fn with_parameter(mut self, name: &str, value: f64) -> Self {
        self.parameters.insert(name.to_string(), value);
        self
    }

    /// True once the engine has recorded this point.
    pub fn is_recorded(&self) -> bool {
        self.timestamp.is_some()
    }

    /// Value of a swept parameter.
    pub fn parameter(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).copied()
    }

    /// Fields recorded by one plugin.
    pub fn plugin_results(&self, plugin: &str) -> Option<&FieldMap> {
        self.results.get(plugin)
    }

    /// Attach the timestamp and fully assembled results in one step.
    pub(crate) fn record(&mut self, timestamp: DateTime<Utc>, results: PointResults) {
        self.timestamp = Some(timestamp);
        self.results = results;
    }
}
