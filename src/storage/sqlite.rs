//! SQLite-backed [`ResultStore`].
//!
//! Schema:
//!
//! ```text
//! measurement_points  (id, sequence_name, point_name, timestamp, parameters JSON)
//! measurement_values  (id, point_id → points, plugin_name, field_name, value REAL, unit)
//! measurement_blobs   (id, point_id → points, plugin_name, field_name, encoding, data BLOB)
//! ```
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings with nanosecond
//! precision, so lexical order is chronological order. SQLite binds NaN as
//! NULL, so `value` is nullable and NULL reads back as NaN. All statements run on
//! the blocking pool; the connection is serialized behind a mutex.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{HistoryEntry, PointRecord, ResultStore, StoredField};
use crate::core::{unit_info, FieldValue, ParameterSet, PointResults, UNIT_INFO_KEY};
use crate::error::StorageError;

/// Version recorded in the `meta` table; other versions are refused.
pub const SCHEMA_VERSION: i64 = 2;

const ENCODING_UTF8: &str = "utf8";
const ENCODING_BINARY: &str = "binary";

/// [`ResultStore`] over one SQLite connection.
#[derive(Clone)]
pub struct SqliteResultStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteResultStore {
    /// Open (or create) a database file and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Result database opened");
        Self::from_connection(conn)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Worker(e.to_string()))?
    }
}

fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS meta(version INTEGER NOT NULL);
        CREATE TABLE IF NOT EXISTS measurement_points(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sequence_name TEXT NOT NULL,
            point_name TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            parameters TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS measurement_values(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            point_id INTEGER NOT NULL,
            plugin_name TEXT NOT NULL,
            field_name TEXT NOT NULL,
            value REAL,
            unit TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(point_id) REFERENCES measurement_points(id)
        );
        CREATE TABLE IF NOT EXISTS measurement_blobs(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            point_id INTEGER NOT NULL,
            plugin_name TEXT NOT NULL,
            field_name TEXT NOT NULL,
            encoding TEXT NOT NULL,
            data BLOB NOT NULL,
            FOREIGN KEY(point_id) REFERENCES measurement_points(id)
        );
        CREATE INDEX IF NOT EXISTS idx_points_sequence
            ON measurement_points(sequence_name, timestamp);
        CREATE INDEX IF NOT EXISTS idx_values_point ON measurement_values(point_id);
        CREATE INDEX IF NOT EXISTS idx_blobs_point ON measurement_blobs(point_id);
        COMMIT;",
    )?;

    let existing: Option<i64> = conn
        .query_row("SELECT version FROM meta LIMIT 1", [], |row| row.get(0))
        .optional()?;
    match existing {
        Some(v) if v == SCHEMA_VERSION => Ok(()),
        Some(v) => Err(StorageError::Worker(format!(
            "database schema {v} incompatible with expected {SCHEMA_VERSION}"
        ))),
        None => {
            conn.execute("INSERT INTO meta(version) VALUES (?)", params![SCHEMA_VERSION])?;
            Ok(())
        }
    }
}

fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StorageError::Timestamp(raw.to_string()))
}

fn decode_value(raw: Option<f64>) -> f64 {
    raw.unwrap_or(f64::NAN)
}

fn insert_point(
    conn: &mut Connection,
    sequence_name: &str,
    point_name: &str,
    timestamp: &DateTime<Utc>,
    parameters: &ParameterSet,
    results: &PointResults,
) -> Result<i64, StorageError> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO measurement_points(sequence_name, point_name, timestamp, parameters)
         VALUES (?, ?, ?, ?)",
        params![
            sequence_name,
            point_name,
            encode_timestamp(timestamp),
            serde_json::to_string(parameters)?
        ],
    )?;
    let point_id = tx.last_insert_rowid();

    {
        let mut numeric = tx.prepare(
            "INSERT INTO measurement_values(point_id, plugin_name, field_name, value, unit)
             VALUES (?, ?, ?, ?, ?)",
        )?;
        let mut blob = tx.prepare(
            "INSERT INTO measurement_blobs(point_id, plugin_name, field_name, encoding, data)
             VALUES (?, ?, ?, ?, ?)",
        )?;

        for (plugin, fields) in results {
            let units = unit_info(fields);
            for (field, value) in fields {
                if field == UNIT_INFO_KEY {
                    continue;
                }
                match value {
                    FieldValue::Number(_) | FieldValue::Bool(_) => {
                        let unit = units.get(field).map(String::as_str).unwrap_or("");
                        numeric.execute(params![point_id, plugin, field, value.as_f64(), unit])?;
                    }
                    FieldValue::Text(text) => {
                        blob.execute(params![point_id, plugin, field, ENCODING_UTF8, text.as_bytes()])?;
                    }
                    FieldValue::Blob(bytes) => {
                        blob.execute(params![point_id, plugin, field, ENCODING_BINARY, bytes])?;
                    }
                    FieldValue::Map(_) => {
                        debug!(plugin = %plugin, field = %field, "Nested map field not stored");
                    }
                }
            }
        }
    }

    tx.commit()?;
    Ok(point_id)
}

fn select_points(conn: &Connection, sequence_name: &str) -> Result<Vec<PointRecord>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT id, point_name, timestamp, parameters FROM measurement_points
         WHERE sequence_name = ? ORDER BY timestamp, id",
    )?;
    let rows = stmt
        .query_map(params![sequence_name], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut records = Vec::with_capacity(rows.len());
    for (id, point_name, timestamp, parameters) in rows {
        records.push(PointRecord {
            id,
            sequence_name: sequence_name.to_string(),
            point_name,
            timestamp: decode_timestamp(&timestamp)?,
            parameters: serde_json::from_str(&parameters)?,
            fields: Default::default(),
        });
    }

    let index: HashMap<i64, usize> = records.iter().enumerate().map(|(i, r)| (r.id, i)).collect();

    let mut values = conn.prepare(
        "SELECT v.point_id, v.plugin_name, v.field_name, v.value, v.unit
         FROM measurement_values v JOIN measurement_points p ON p.id = v.point_id
         WHERE p.sequence_name = ? ORDER BY v.id",
    )?;
    let mut rows = values.query(params![sequence_name])?;
    while let Some(row) = rows.next()? {
        let Some(&i) = index.get(&row.get::<_, i64>(0)?) else {
            continue;
        };
        records[i].fields.entry(row.get(1)?).or_default().insert(
            row.get(2)?,
            StoredField::Numeric {
                value: decode_value(row.get(3)?),
                unit: row.get(4)?,
            },
        );
    }

    let mut blobs = conn.prepare(
        "SELECT b.point_id, b.plugin_name, b.field_name, b.encoding, b.data
         FROM measurement_blobs b JOIN measurement_points p ON p.id = b.point_id
         WHERE p.sequence_name = ? ORDER BY b.id",
    )?;
    let mut rows = blobs.query(params![sequence_name])?;
    while let Some(row) = rows.next()? {
        let Some(&i) = index.get(&row.get::<_, i64>(0)?) else {
            continue;
        };
        let encoding: String = row.get(3)?;
        let data: Vec<u8> = row.get(4)?;
        let field = if encoding == ENCODING_UTF8 {
            match String::from_utf8(data) {
                Ok(text) => StoredField::Text(text),
                Err(e) => {
                    warn!(error = %e, "Text field is not valid UTF-8, returning raw bytes");
                    StoredField::Blob(e.into_bytes())
                }
            }
        } else {
            StoredField::Blob(data)
        };
        records[i]
            .fields
            .entry(row.get(1)?)
            .or_default()
            .insert(row.get(2)?, field);
    }

    Ok(records)
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn save(
        &self,
        sequence_name: &str,
        point_name: &str,
        timestamp: DateTime<Utc>,
        parameters: &ParameterSet,
        results: &PointResults,
    ) -> Result<(), StorageError> {
        let sequence_name = sequence_name.to_string();
        let point_name = point_name.to_string();
        let parameters = parameters.clone();
        let results = results.clone();
        let id = self
            .with_conn(move |conn| {
                insert_point(conn, &sequence_name, &point_name, &timestamp, &parameters, &results)
            })
            .await?;
        debug!(point_id = id, "Point saved");
        Ok(())
    }

    async fn query_by_sequence(&self, sequence_name: &str) -> Result<Vec<PointRecord>, StorageError> {
        let sequence_name = sequence_name.to_string();
        self.with_conn(move |conn| select_points(conn, &sequence_name))
            .await
    }

    async fn query_parameter_history(
        &self,
        sequence_name: &str,
        field_name: &str,
    ) -> Result<Vec<HistoryEntry>, StorageError> {
        let sequence_name = sequence_name.to_string();
        let field_name = field_name.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT p.timestamp, p.point_name, v.plugin_name, v.value, v.unit
                 FROM measurement_values v JOIN measurement_points p ON p.id = v.point_id
                 WHERE p.sequence_name = ? AND v.field_name = ?
                 ORDER BY p.timestamp, p.id, v.id",
            )?;
            let rows = stmt
                .query_map(params![sequence_name, field_name], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        decode_value(row.get(3)?),
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(ts, point_name, plugin_name, value, unit)| {
                    Ok(HistoryEntry {
                        timestamp: decode_timestamp(&ts)?,
                        point_name,
                        plugin_name,
                        value,
                        unit,
                    })
                })
                .collect()
        })
        .await
    }

    async fn list_sequence_names(&self) -> Result<BTreeSet<String>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT sequence_name FROM measurement_points")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<BTreeSet<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn delete(&self, sequence_name: &str) -> Result<usize, StorageError> {
        let sequence_name = sequence_name.to_string();
        let removed = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                for table in ["measurement_values", "measurement_blobs"] {
                    tx.execute(
                        &format!(
                            "DELETE FROM {table} WHERE point_id IN
                             (SELECT id FROM measurement_points WHERE sequence_name = ?)"
                        ),
                        params![sequence_name],
                    )?;
                }
                let removed = tx.execute(
                    "DELETE FROM measurement_points WHERE sequence_name = ?",
                    params![sequence_name],
                )?;
                tx.commit()?;
                Ok(removed)
            })
            .await?;
        info!(points = removed, "Sequence data deleted");
        Ok(removed)
    }
}
