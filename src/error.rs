//! Custom error types for the sweep engine.
//!
//! This module defines the primary error type, `SweepError`, together with the
//! narrower error enums returned by the plugin and storage layers. Using the
//! `thiserror` crate, it provides a centralized and consistent way to report
//! what went wrong while authoring a sequence, starting a run, or executing a
//! measurement point.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidConfig`**: Semantic problems detected before anything runs, such as a
//!   parameter range with zero steps, a sequence without points, or a plugin name that
//!   was never registered. These are surfaced synchronously at the call site.
//! - **`PluginNotFound`**: A registry lookup for a name that was never registered.
//! - **`AlreadyRunning`**: `start()` while a run is still `Running` or `Paused`.
//! - **`PluginLifecycle`**: `initialize()` failed while a run was being started.
//! - **`Measurement`** / **`Processing`**: A plugin call failed while a point was being
//!   executed. These are fatal to the run and reported through the `on_error` event.
//! - **`Panicked`**: A plugin panicked while a point was being executed; the run fails.
//! - **`Storage`**: The result store could not persist or read points.
//! - **`Document`** / **`Io`**: Sequence document (de)serialization and file access.
//!
//! Subscriber callback failures are deliberately absent: they are logged where they
//! happen and never cross into this type.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, SweepError>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum SweepError {
    /// The sequence, configuration or request cannot be used.
    #[error("Configuration validation error: {0}")]
    InvalidConfig(String),

    /// No plugin is registered under this name.
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// `start` was called while a run is active.
    #[error("A sequence is already running on this engine")]
    AlreadyRunning,

    /// A plugin failed to initialize or clean up.
    #[error("Plugin '{plugin}' lifecycle error: {source}")]
    PluginLifecycle {
        /// Plugin name.
        plugin: String,
        /// What the plugin reported.
        #[source]
        source: PluginError,
    },

    /// `set_parameters` or `measure` failed during a point.
    #[error("Measurement with '{plugin}' failed at {point}: {source}")]
    Measurement {
        /// Plugin name.
        plugin: String,
        /// Point being executed.
        point: String,
        /// What the plugin reported.
        #[source]
        source: PluginError,
    },

    /// `process` failed during a point.
    #[error("Processing with '{plugin}' failed at {point}: {source}")]
    Processing {
        /// Plugin name.
        plugin: String,
        /// Point being executed.
        point: String,
        /// What the plugin reported.
        #[source]
        source: PluginError,
    },

    /// A plugin panicked while a point was executed.
    #[error("Point execution panicked at {point}: {message}")]
    Panicked {
        /// Point being executed.
        point: String,
        /// Panic payload, when it was a string.
        message: String,
    },

    /// The result store failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A sequence document could not be read or written.
    #[error("Sequence document error: {0}")]
    Document(#[from] serde_json::Error),

    /// A plugin manifest is unreadable or inconsistent.
    #[error("Invalid plugin manifest {path:?}: {message}")]
    Manifest {
        /// Manifest file.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SweepError {
    /// Shorthand for building an `InvalidConfig` error.
    pub fn config(msg: impl Into<String>) -> Self {
        SweepError::InvalidConfig(msg.into())
    }
}

/// Errors raised by plugin capability calls.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    /// `initialize` failed.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// `cleanup` failed.
    #[error("cleanup failed: {0}")]
    Cleanup(String),

    /// A capability was used before `initialize`.
    #[error("plugin is not initialized")]
    NotInitialized,

    /// A setting is out of range or of the wrong kind.
    #[error("invalid setting '{name}': {reason}")]
    InvalidSetting {
        /// Setting name.
        name: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The instrument did not answer.
    #[error("instrument communication failed: {0}")]
    Communication(String),

    /// The instrument answered but the reading is unusable.
    #[error("acquisition failed: {0}")]
    Acquisition(String),

    /// `process` could not derive its fields.
    #[error("processing failed: {0}")]
    Processing(String),
}

/// Errors raised by result store implementations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// SQLite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Parameters could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A stored timestamp is not RFC 3339.
    #[error("invalid timestamp '{0}' in store")]
    Timestamp(String),

    /// The blocking task failed or the store is unavailable.
    #[error("storage worker failed: {0}")]
    Worker(String),

    /// `save_point` was given a point that was never executed.
    #[error("point '{0}' has not been executed")]
    Unrecorded(String),

    /// Unknown format or unwritable target.
    #[error("export failed: {0}")]
    Export(String),

    /// CSV writer error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
