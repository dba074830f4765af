//! Declarative plugin settings.
//!
//! A plugin lists the settings it understands as [`ParameterSpec`]s. The
//! registry seeds a [`PluginSettings`] map from the spec defaults, layers
//! manifest values and a saved settings file on top, validates the result and
//! hands it to [`Plugin::configure`](super::Plugin::configure).
//!
//! Saved settings files look like:
//!
//! ```json
//! {
//!   "plugin_name": "TemperatureSensor",
//!   "plugin_version": "2.0",
//!   "parameters": { "noise_level": 0.05, "sensor_type": "PT1000" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{AppResult, PluginError, SweepError};

/// Value type of a plugin setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// Any finite number.
    Float,
    /// Whole number.
    Int,
    /// Flag.
    Bool,
    /// Free text.
    Text,
    /// One of [`ParameterSpec::choices`].
    Choice,
}

/// Definition of one plugin setting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Setting name.
    pub name: String,
    /// Accepted value type.
    pub kind: ParamKind,
    /// Value used when nothing overrides it.
    pub default: Value,
    /// Inclusive lower bound for numeric kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive upper bound for numeric kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Allowed values of a `choice` setting.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    /// Display unit.
    #[serde(default)]
    pub unit: String,
    /// Help text.
    #[serde(default)]
    pub description: String,
}

impl ParameterSpec {
    fn new(name: &str, kind: ParamKind, default: Value) -> Self {
        Self {
            name: name.to_string(),
            kind,
            default,
            min: None,
            max: None,
            choices: Vec::new(),
            unit: String::new(),
            description: String::new(),
        }
    }

    /// A floating point setting.
    pub fn float(name: &str, default: f64) -> Self {
        Self::new(name, ParamKind::Float, Value::from(default))
    }

    /// An integer setting.
    pub fn int(name: &str, default: i64) -> Self {
        Self::new(name, ParamKind::Int, Value::from(default))
    }

    /// A flag.
    pub fn boolean(name: &str, default: bool) -> Self {
        Self::new(name, ParamKind::Bool, Value::from(default))
    }

    /// A free text setting.
    pub fn text(name: &str, default: &str) -> Self {
        Self::new(name, ParamKind::Text, Value::from(default))
    }

    /// A setting restricted to `choices`.
    pub fn choice(name: &str, default: &str, choices: &[&str]) -> Self {
        let mut spec = Self::new(name, ParamKind::Choice, Value::from(default));
        spec.choices = choices.iter().map(|c| c.to_string()).collect();
        spec
    }

    /// Set inclusive numeric bounds.
    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Set the display unit.
    pub fn unit(mut self, unit: &str) -> Self {
        self.unit = unit.to_string();
        self
    }

    /// Set the help text.
    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Check a candidate value against kind, bounds and choices.
    pub fn check(&self, value: &Value) -> Result<(), PluginError> {
        let invalid = |reason: String| PluginError::InvalidSetting {
            name: self.name.clone(),
            reason,
        };

        let numeric = match self.kind {
            ParamKind::Float => Some(
                value
                    .as_f64()
                    .ok_or_else(|| invalid(format!("expected a number, got {value}")))?,
            ),
            ParamKind::Int => Some(
                value
                    .as_i64()
                    .ok_or_else(|| invalid(format!("expected an integer, got {value}")))?
                    as f64,
            ),
            ParamKind::Bool => {
                value
                    .as_bool()
                    .ok_or_else(|| invalid(format!("expected a boolean, got {value}")))?;
                None
            }
            ParamKind::Text => {
                value
                    .as_str()
                    .ok_or_else(|| invalid(format!("expected text, got {value}")))?;
                None
            }
            ParamKind::Choice => {
                let choice = value
                    .as_str()
                    .ok_or_else(|| invalid(format!("expected one of {:?}", self.choices)))?;
                if !self.choices.iter().any(|c| c == choice) {
                    return Err(invalid(format!(
                        "'{choice}' is not one of {:?}",
                        self.choices
                    )));
                }
                None
            }
        };

        if let Some(v) = numeric {
            if self.min.is_some_and(|min| v < min) || self.max.is_some_and(|max| v > max) {
                return Err(invalid(format!(
                    "{v} outside [{}, {}]",
                    self.min.unwrap_or(f64::NEG_INFINITY),
                    self.max.unwrap_or(f64::INFINITY)
                )));
            }
        }
        Ok(())
    }
}

/// Resolved settings of one plugin instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginSettings(BTreeMap<String, Value>);

impl PluginSettings {
    /// Settings holding every spec's default.
    pub fn from_specs(specs: &[ParameterSpec]) -> Self {
        Self(
            specs
                .iter()
                .map(|s| (s.name.clone(), s.default.clone()))
                .collect(),
        )
    }

    /// Settings from raw values, unvalidated.
    pub fn from_map(values: BTreeMap<String, Value>) -> Self {
        Self(values)
    }

    /// Insert or replace one value.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.0.insert(name.to_string(), value.into());
    }

    /// Overlay `other` on top of these settings.
    pub fn merge(&mut self, other: &PluginSettings) {
        for (name, value) in &other.0 {
            self.0.insert(name.clone(), value.clone());
        }
    }

    /// Raw value of `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Numeric value of `name`, or `default` when absent or not a number.
    pub fn f64_or(&self, name: &str, default: f64) -> f64 {
        self.0.get(name).and_then(Value::as_f64).unwrap_or(default)
    }

    /// Integer value of `name`, or `default`.
    pub fn i64_or(&self, name: &str, default: i64) -> i64 {
        self.0.get(name).and_then(Value::as_i64).unwrap_or(default)
    }

    /// Flag value of `name`, or `default`.
    pub fn bool_or(&self, name: &str, default: bool) -> bool {
        self.0.get(name).and_then(Value::as_bool).unwrap_or(default)
    }

    /// Text value of `name`, or `default`.
    pub fn str_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.0.get(name).and_then(Value::as_str).unwrap_or(default)
    }

    /// Settings in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// True when no setting is present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Validate every known setting. Keys without a spec are kept untouched.
    pub fn validate(&self, specs: &[ParameterSpec]) -> Result<(), PluginError> {
        for (name, value) in &self.0 {
            match specs.iter().find(|s| &s.name == name) {
                Some(spec) => spec.check(value)?,
                None => debug!(setting = %name, "Setting has no spec, passing through"),
            }
        }
        Ok(())
    }
}

/// On-disk form of saved plugin settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SettingsFile {
    /// Plugin the settings belong to.
    pub plugin_name: String,
    /// Version that saved them.
    #[serde(default)]
    pub plugin_version: String,
    /// Saved values.
    #[serde(default)]
    pub parameters: PluginSettings,
}

impl SettingsFile {
    /// Write the file, creating parent directories.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!(plugin = %self.plugin_name, path = %path.display(), "Plugin settings saved");
        Ok(())
    }

    /// Load settings saved for `plugin_name`; a file written for another
    /// plugin is rejected.
    pub fn load(path: &Path, plugin_name: &str) -> AppResult<Self> {
        let file: SettingsFile = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        if file.plugin_name != plugin_name {
            return Err(SweepError::config(format!(
                "settings file {} belongs to '{}', not '{}'",
                path.display(),
                file.plugin_name,
                plugin_name
            )));
        }
        Ok(file)
    }
}
