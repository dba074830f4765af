//! Persistence of executed measurement points.
//!
//! The engine talks to storage only through the [`ResultStore`] trait. Each
//! `save` is atomic: either the point row and all of its field rows are
//! written, or nothing is.
//!
//! Field values are split by storage class:
//! - numbers and flags go to the numeric table, with the unit taken from the
//!   plugin's `unit_info` map,
//! - text and binary payloads go to the blob table,
//! - `unit_info` itself is never stored as a field.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::core::{ParameterSet, PointResults};
use crate::error::StorageError;
use crate::sequence::MeasurementPoint;

pub mod export;
pub mod sqlite;

pub use export::{export_csv, export_json, export_to_path, ExportFormat};
pub use sqlite::SqliteResultStore;

/// A stored field value as read back from the store.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StoredField {
    /// Number or flag with its unit.
    Numeric {
        /// Flags are stored as 0 or 1.
        value: f64,
        /// Empty when none was declared.
        unit: String,
    },
    /// UTF-8 text.
    Text(String),
    /// Binary payload.
    Blob(Vec<u8>),
}

impl StoredField {
    /// The number, for numeric fields.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StoredField::Numeric { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// The unit, for numeric fields.
    pub fn unit(&self) -> Option<&str> {
        match self {
            StoredField::Numeric { unit, .. } => Some(unit),
            _ => None,
        }
    }
}

/// One stored point with its fields grouped by plugin.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PointRecord {
    /// Store-assigned row id.
    pub id: i64,
    /// Sequence the point belongs to.
    pub sequence_name: String,
    /// Point name.
    pub point_name: String,
    /// When the point started executing.
    pub timestamp: DateTime<Utc>,
    /// Swept values of the point.
    pub parameters: ParameterSet,
    /// Stored fields by plugin, then field name.
    pub fields: BTreeMap<String, BTreeMap<String, StoredField>>,
}

impl PointRecord {
    /// One stored field.
    pub fn field(&self, plugin: &str, field: &str) -> Option<&StoredField> {
        self.fields.get(plugin).and_then(|f| f.get(field))
    }

    /// One numeric field's value.
    pub fn numeric(&self, plugin: &str, field: &str) -> Option<f64> {
        self.field(plugin, field).and_then(StoredField::as_f64)
    }
}

/// One sample of a numeric field's history.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryEntry {
    /// Timestamp of the point.
    pub timestamp: DateTime<Utc>,
    /// Point name.
    pub point_name: String,
    /// Plugin that reported the value.
    pub plugin_name: String,
    /// NaN when the plugin reported NaN.
    pub value: f64,
    /// Unit recorded with the value.
    pub unit: String,
}

/// Durable store of executed points.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist one point atomically.
    async fn save(
        &self,
        sequence_name: &str,
        point_name: &str,
        timestamp: DateTime<Utc>,
        parameters: &ParameterSet,
        results: &PointResults,
    ) -> Result<(), StorageError>;

    /// Points of a sequence in timestamp order.
    async fn query_by_sequence(&self, sequence_name: &str) -> Result<Vec<PointRecord>, StorageError>;

    /// Every numeric value recorded under `field_name` for a sequence, in
    /// timestamp order.
    async fn query_parameter_history(
        &self,
        sequence_name: &str,
        field_name: &str,
    ) -> Result<Vec<HistoryEntry>, StorageError>;

    /// Names of every sequence with stored points.
    async fn list_sequence_names(&self) -> Result<BTreeSet<String>, StorageError>;

    /// Remove a sequence's points and their fields. Returns the number of
    /// points removed.
    async fn delete(&self, sequence_name: &str) -> Result<usize, StorageError>;

    /// Persist an executed point.
    async fn save_point(
        &self,
        sequence_name: &str,
        point: &MeasurementPoint,
    ) -> Result<(), StorageError> {
        let timestamp = point
            .timestamp
            .ok_or_else(|| StorageError::Unrecorded(point.name.clone()))?;
        self.save(
            sequence_name,
            &point.name,
            timestamp,
            &point.parameters,
            &point.results,
        )
        .await
    }
}
