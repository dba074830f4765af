//! Core data types shared by sequences, plugins, the engine and storage.
//!
//! A measurement plugin returns a [`FieldMap`]: named fields whose values are
//! numbers, flags, text, binary payloads, or nested maps. One nested map is
//! special: [`UNIT_INFO_KEY`] maps field names to their unit strings and is
//! consumed by storage rather than stored as a field.
//!
//! The accumulated results of a point are a [`PointResults`] map keyed by
//! plugin name. Processing plugins see this map and contribute a new entry
//! under `<plugin>_processed`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Key of the optional unit sub-map inside a plugin's field map.
pub const UNIT_INFO_KEY: &str = "unit_info";

/// Suffix appended to a processing plugin's name to form its result key.
pub const PROCESSED_SUFFIX: &str = "_processed";

/// Swept parameter values of one point, keyed by parameter name.
pub type ParameterSet = BTreeMap<String, f64>;

/// Named fields produced by one plugin for one point.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Accumulated results of one point, keyed by plugin name.
pub type PointResults = BTreeMap<String, FieldMap>;

/// Result key under which a processing plugin's output is merged.
pub fn processed_key(plugin: &str) -> String {
    format!("{plugin}{PROCESSED_SUFFIX}")
}

/// A single result value.
///
/// Serialized untagged so that sequence documents read naturally
/// (`"reading": 40.0`, `"sensor_type": "PT100"`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Boolean flag; stored as 0/1 in numeric storage.
    Bool(bool),
    /// Numeric reading.
    Number(f64),
    /// Free text (identifiers, classifications).
    Text(String),
    /// Binary payload such as an image frame.
    Blob(Vec<u8>),
    /// Nested map, used for `unit_info`.
    Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            FieldValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Text view of the value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Binary view of the value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// True for values that belong to the numeric storage class.
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldValue::Number(_) | FieldValue::Bool(_))
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Number(v) => write!(f, "{}", v),
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::Blob(b) => write!(f, "<{} bytes>", b.len()),
            FieldValue::Map(m) => write!(f, "{:?}", m),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<usize> for FieldValue {
    fn from(value: usize) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Blob(value)
    }
}

/// Unit strings declared in a field map's `unit_info` entry.
pub fn unit_info(fields: &FieldMap) -> BTreeMap<String, String> {
    match fields.get(UNIT_INFO_KEY) {
        Some(FieldValue::Map(units)) => units
            .iter()
            .filter_map(|(name, unit)| unit.as_str().map(|u| (name.clone(), u.to_string())))
            .collect(),
        _ => BTreeMap::new(),
    }
}

/// Builder for a plugin's field map.
///
/// ```
/// use rust_sweep::core::Reading;
///
/// let fields = Reading::new()
///     .field("voltage", 1.25)
///     .unit("voltage", "V")
///     .build();
/// assert_eq!(fields.len(), 2);
/// ```
#[derive(Debug, Default, Clone)]
pub struct Reading {
    fields: FieldMap,
    units: BTreeMap<String, FieldValue>,
}

impl Reading {
    /// An empty reading.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a field.
    pub fn field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Declare the unit of `name`.
    pub fn unit(mut self, name: &str, unit: &str) -> Self {
        self.units
            .insert(name.to_string(), FieldValue::Text(unit.to_string()));
        self
    }

    /// The field map, with `unit_info` when any unit was declared.
    pub fn build(mut self) -> FieldMap {
        if !self.units.is_empty() {
            self.fields
                .insert(UNIT_INFO_KEY.to_string(), FieldValue::Map(self.units));
        }
        self.fields
    }
}
