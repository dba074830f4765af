//! Plugin manifests.
//!
//! A manifest is a small YAML or TOML file that makes a compiled-in plugin
//! factory available under a name, optionally with its own version,
//! description and setting overrides:
//!
//! ```yaml
//! name: ChamberSensor
//! factory: temperature_sensor
//! version: "2.1"
//! description: Climate chamber PT100
//! settings:
//!   noise_level: 0.05
//! ```

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{AppResult, SweepError};

/// A plugin manifest file: a name bound to a compiled factory plus settings overrides.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct PluginManifest {
    /// Name the plugin is registered under.
    pub name: String,
    /// Id of the compiled factory that builds instances.
    pub factory: String,
    /// Overrides the factory's version.
    #[serde(default)]
    pub version: Option<String>,
    /// Overrides the factory's description.
    #[serde(default)]
    pub description: Option<String>,
    /// Applied on top of the plugin's defaults.
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
}

impl PluginManifest {
    /// True for files discovery should look at.
    pub fn is_manifest_path(path: &Path) -> bool {
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(true, |n| n.starts_with('_') || n.starts_with('.'));
        let extension = path.extension().and_then(|e| e.to_str());
        !hidden && matches!(extension, Some("yaml" | "yml" | "toml"))
    }

    /// Parse a manifest, choosing the format from the file extension.
    pub fn from_path(path: &Path) -> AppResult<Self> {
        let invalid = |message: String| SweepError::Manifest {
            path: path.to_path_buf(),
            message,
        };

        let content = std::fs::read_to_string(path)?;
        let manifest: PluginManifest = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content).map_err(|e| invalid(e.to_string()))?,
            Some("yaml" | "yml") => {
                serde_yaml::from_str(&content).map_err(|e| invalid(e.to_string()))?
            }
            other => return Err(invalid(format!("unsupported manifest format {other:?}"))),
        };

        if manifest.name.trim().is_empty() {
            return Err(invalid("manifest has an empty name".into()));
        }
        if manifest.factory.trim().is_empty() {
            return Err(invalid("manifest has an empty factory".into()));
        }
        Ok(manifest)
    }
}
