//! Flat export of stored points.
//!
//! CSV rows hold one point each. The header is the union of every key seen:
//! `timestamp`, `point_name`, then `param_<name>` columns, then
//! `<plugin>_<field>` columns, in first-seen order. Missing cells are empty.

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use chrono::SecondsFormat;

use super::{PointRecord, StoredField};
use crate::error::StorageError;

/// Output format of [`export_to_path`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    /// One row per point.
    Csv,
    /// Pretty-printed array of records.
    Json,
}

impl FromStr for ExportFormat {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(StorageError::Export(format!("unknown export format '{other}'"))),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Csv => write!(f, "csv"),
            ExportFormat::Json => write!(f, "json"),
        }
    }
}

enum Column {
    Parameter(String),
    Field(String, String),
}

impl Column {
    fn header(&self) -> String {
        match self {
            Column::Parameter(name) => format!("param_{name}"),
            Column::Field(plugin, field) => format!("{plugin}_{field}"),
        }
    }

    fn cell(&self, record: &PointRecord) -> String {
        match self {
            Column::Parameter(name) => record
                .parameters
                .get(name)
                .map(|v| v.to_string())
                .unwrap_or_default(),
            Column::Field(plugin, field) => match record.field(plugin, field) {
                Some(StoredField::Numeric { value, .. }) => value.to_string(),
                Some(StoredField::Text(text)) => text.clone(),
                Some(StoredField::Blob(bytes)) => format!("<{} bytes>", bytes.len()),
                None => String::new(),
            },
        }
    }
}

fn columns(records: &[PointRecord]) -> Vec<Column> {
    let mut seen_params = HashSet::new();
    let mut params = Vec::new();
    let mut seen_fields = HashSet::new();
    let mut fields = Vec::new();

    for record in records {
        for name in record.parameters.keys() {
            if seen_params.insert(name.clone()) {
                params.push(Column::Parameter(name.clone()));
            }
        }
        for (plugin, values) in &record.fields {
            for field in values.keys() {
                if seen_fields.insert((plugin.clone(), field.clone())) {
                    fields.push(Column::Field(plugin.clone(), field.clone()));
                }
            }
        }
    }
    params.extend(fields);
    params
}

/// Write records as CSV.
pub fn export_csv<W: Write>(records: &[PointRecord], writer: W) -> Result<(), StorageError> {
    let columns = columns(records);
    let mut wtr = csv::Writer::from_writer(writer);

    let mut header = vec!["timestamp".to_string(), "point_name".to_string()];
    header.extend(columns.iter().map(Column::header));
    wtr.write_record(&header)?;

    for record in records {
        let mut row = vec![
            record.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            record.point_name.clone(),
        ];
        row.extend(columns.iter().map(|c| c.cell(record)));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write records as a pretty-printed JSON array.
pub fn export_json<W: Write>(records: &[PointRecord], writer: W) -> Result<(), StorageError> {
    serde_json::to_writer_pretty(writer, records)?;
    Ok(())
}

/// Export to a file in the given format.
pub fn export_to_path(
    records: &[PointRecord],
    path: &Path,
    format: ExportFormat,
) -> Result<(), StorageError> {
    let mut writer = BufWriter::new(File::create(path)?);
    match format {
        ExportFormat::Csv => export_csv(records, &mut writer)?,
        ExportFormat::Json => export_json(records, &mut writer)?,
    }
    writer.flush()?;
    Ok(())
}
