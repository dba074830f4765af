//! One swept variable and the values it takes.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, SweepError};

/// Describes one swept parameter: `steps` evenly spaced values from `start`
/// to `end` inclusive.
///
/// Immutable after construction; `steps >= 1` is checked by [`ParameterRange::new`]
/// and again when a range is deserialized from a sequence document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RangeDocument", into = "RangeDocument")]
pub struct ParameterRange {
    name: String,
    start: f64,
    end: f64,
    steps: usize,
    unit: String,
}

impl ParameterRange {
    /// Create a range, failing with `InvalidConfig` when `steps < 1`.
    pub fn new(
        name: impl Into<String>,
        start: f64,
        end: f64,
        steps: i64,
        unit: impl Into<String>,
    ) -> AppResult<Self> {
        let name = name.into();
        if steps < 1 {
            return Err(SweepError::config(format!(
                "parameter range '{name}' needs at least one step, got {steps}"
            )));
        }
        if !start.is_finite() || !end.is_finite() {
            return Err(SweepError::config(format!(
                "parameter range '{name}' has a non-finite bound"
            )));
        }
        Ok(Self {
            name,
            start,
            end,
            steps: steps as usize,
            unit: unit.into(),
        })
    }

    /// Parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First value.
    pub fn start(&self) -> f64 {
        self.start
    }

    /// Last value (equal to the first when `steps == 1`).
    pub fn end(&self) -> f64 {
        self.end
    }

    /// Number of values, at least 1.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Display unit.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// The swept values, recomputed on every call.
    pub fn values(&self) -> Vec<f64> {
        if self.steps == 1 {
            return vec![self.start];
        }
        let step = (self.end - self.start) / (self.steps - 1) as f64;
        (0..self.steps)
            .map(|i| self.start + i as f64 * step)
            .collect()
    }
}

/// Wire form of a range inside a sequence document.
#[derive(Serialize, Deserialize)]
struct RangeDocument {
    parameter_name: String,
    start: f64,
    end: f64,
    steps: i64,
    #[serde(default)]
    unit: String,
}

impl TryFrom<RangeDocument> for ParameterRange {
    type Error = SweepError;

    fn try_from(doc: RangeDocument) -> Result<Self, Self::Error> {
        ParameterRange::new(doc.parameter_name, doc.start, doc.end, doc.steps, doc.unit)
    }
}

impl From<ParameterRange> for RangeDocument {
    fn from(range: ParameterRange) -> Self {
        Self {
            parameter_name: range.name,
            start: range.start,
            end: range.end,
            steps: range.steps as i64,
            unit: range.unit,
        }
    }
}
