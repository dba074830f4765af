//! Plugin capability contracts and the registry that hands out instances.
//!
//! # Architecture
//!
//! ```text
//! PluginRegistry
//! ├── factories   (compiled-in constructors, keyed by factory id)
//! ├── catalog     (registered plugin names → descriptor + factory + settings)
//! │     ▲
//! │     └── discover_and_register(dir)  reads *.yaml / *.toml manifests
//! └── instances   (one singleton per name, created on first use)
//!         │
//!         ├── PluginInstance::Measurement  Arc<Mutex<Box<dyn MeasurementPlugin>>>
//!         └── PluginInstance::Processing   Arc<Mutex<Box<dyn ProcessingPlugin>>>
//! ```
//!
//! The engine depends only on the traits in this module, never on concrete
//! plugin types.
//!
//! # Lifecycle
//!
//! `configure` (once, at creation) → `initialize` → any number of
//! `set_parameters`/`measure` or `process` calls → `cleanup`. Calling
//! `initialize` twice without an intervening `cleanup` is not supported.
//! `cleanup` must tolerate a partially failed `initialize`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::{FieldMap, ParameterSet, PointResults};
use crate::error::PluginError;

pub mod builtin;
pub mod manifest;
pub mod registry;
pub mod settings;

pub use manifest::PluginManifest;
pub use registry::{PluginFactory, PluginRegistry};
pub use settings::{ParamKind, ParameterSpec, PluginSettings};

/// Role a plugin plays during point execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    /// Drives an instrument and returns readings.
    Measurement,
    /// Derives fields from the readings already collected for a point.
    Processing,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginKind::Measurement => write!(f, "measurement"),
            PluginKind::Processing => write!(f, "processing"),
        }
    }
}

/// Static identity of a plugin type, used for discovery listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Registry name, also the key of the plugin's results.
    pub name: String,
    /// Free-form version string.
    pub version: String,
    /// One-line description.
    pub description: String,
    /// Capability the plugin provides.
    pub kind: PluginKind,
}

impl PluginDescriptor {
    /// Descriptor without a description.
    pub fn new(name: &str, version: &str, kind: PluginKind) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            description: String::new(),
            kind,
        }
    }

    /// Set the human-readable description.
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

/// Lifecycle contract common to every plugin.
#[async_trait]
pub trait Plugin: Send {
    /// Identity of this instance.
    fn describe(&self) -> PluginDescriptor;

    /// Settings this plugin understands. Defaults seed its [`PluginSettings`].
    fn parameter_specs(&self) -> Vec<ParameterSpec> {
        Vec::new()
    }

    /// Apply resolved settings. Called once by the registry right after construction.
    fn configure(&mut self, _settings: &PluginSettings) -> Result<(), PluginError> {
        Ok(())
    }

    /// Acquire resources (open an instrument session, allocate buffers).
    async fn initialize(&mut self) -> Result<(), PluginError>;

    /// Release resources. Must be safe after a partially failed `initialize`.
    async fn cleanup(&mut self) -> Result<(), PluginError>;
}

/// Instrument-driving capability.
#[async_trait]
pub trait MeasurementPlugin: Plugin {
    /// Push this point's swept values into the instrument's pending
    /// configuration. May block while the instrument settles.
    async fn set_parameters(&mut self, parameters: &ParameterSet) -> Result<(), PluginError>;

    /// Perform one acquisition and return named fields, optionally with a
    /// `unit_info` sub-map.
    async fn measure(&mut self) -> Result<FieldMap, PluginError>;

    /// Units of the fields `measure` returns; attached by the engine when a
    /// reading carries no `unit_info` of its own.
    fn units(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// Derived-data capability.
#[async_trait]
pub trait ProcessingPlugin: Plugin {
    /// Field names this plugin expects among the accumulated results.
    /// Informational only; the engine does not enforce presence.
    fn required_inputs(&self) -> BTreeSet<String>;

    /// Transform the accumulated results into derived fields.
    async fn process(&mut self, results: &PointResults) -> Result<FieldMap, PluginError>;
}

/// Shared measurement plugin; the lock serializes capability calls.
pub type MeasurementHandle = Arc<Mutex<Box<dyn MeasurementPlugin>>>;
/// Shared processing plugin.
pub type ProcessingHandle = Arc<Mutex<Box<dyn ProcessingPlugin>>>;

/// A shared, lockable plugin singleton handed out by the registry.
#[derive(Clone)]
pub enum PluginInstance {
    /// A measurement plugin.
    Measurement(MeasurementHandle),
    /// A processing plugin.
    Processing(ProcessingHandle),
}

impl PluginInstance {
    /// Measurement or processing.
    pub fn kind(&self) -> PluginKind {
        match self {
            PluginInstance::Measurement(_) => PluginKind::Measurement,
            PluginInstance::Processing(_) => PluginKind::Processing,
        }
    }

    /// The measurement handle, if this is one.
    pub fn as_measurement(&self) -> Option<MeasurementHandle> {
        match self {
            PluginInstance::Measurement(handle) => Some(Arc::clone(handle)),
            PluginInstance::Processing(_) => None,
        }
    }

    /// The processing handle, if this is one.
    pub fn as_processing(&self) -> Option<ProcessingHandle> {
        match self {
            PluginInstance::Processing(handle) => Some(Arc::clone(handle)),
            PluginInstance::Measurement(_) => None,
        }
    }

    /// Initialize the wrapped plugin.
    pub async fn initialize(&self) -> Result<(), PluginError> {
        match self {
            PluginInstance::Measurement(handle) => handle.lock().await.initialize().await,
            PluginInstance::Processing(handle) => handle.lock().await.initialize().await,
        }
    }

    /// Release the wrapped plugin's resources.
    pub async fn cleanup(&self) -> Result<(), PluginError> {
        match self {
            PluginInstance::Measurement(handle) => handle.lock().await.cleanup().await,
            PluginInstance::Processing(handle) => handle.lock().await.cleanup().await,
        }
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PluginInstance").field(&self.kind()).finish()
    }
}
