//! Plugin registry: discovery, singleton instantiation and shutdown.
//!
//! Plugins are compiled into the binary and exposed through
//! [`PluginFactory`] values. A factory can be registered directly under its
//! own descriptor name, or made available under a factory id so that
//! manifests found by [`PluginRegistry::discover_and_register`] can register
//! it under other names with their own setting overrides.
//!
//! Registration never constructs a plugin. The first
//! [`get_or_create`](PluginRegistry::get_or_create) for a name builds the
//! instance, resolves its settings and caches it; later calls return the same
//! shared handle.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::manifest::PluginManifest;
use super::settings::{ParameterSpec, PluginSettings, SettingsFile};
use super::{
    MeasurementPlugin, Plugin, PluginDescriptor, PluginInstance, PluginKind, ProcessingPlugin,
};
use crate::error::{AppResult, PluginError, SweepError};

enum Built {
    Measurement(Box<dyn MeasurementPlugin>),
    Processing(Box<dyn ProcessingPlugin>),
}

impl Built {
    fn parameter_specs(&self) -> Vec<ParameterSpec> {
        match self {
            Built::Measurement(p) => p.parameter_specs(),
            Built::Processing(p) => p.parameter_specs(),
        }
    }

    fn configure(&mut self, settings: &PluginSettings) -> Result<(), PluginError> {
        match self {
            Built::Measurement(p) => p.configure(settings),
            Built::Processing(p) => p.configure(settings),
        }
    }

    fn into_instance(self) -> PluginInstance {
        match self {
            Built::Measurement(p) => PluginInstance::Measurement(Arc::new(AsyncMutex::new(p))),
            Built::Processing(p) => PluginInstance::Processing(Arc::new(AsyncMutex::new(p))),
        }
    }
}

/// A compiled-in constructor plus the descriptor of what it builds.
#[derive(Clone)]
pub struct PluginFactory {
    descriptor: PluginDescriptor,
    create: Arc<dyn Fn() -> Built + Send + Sync>,
}

impl PluginFactory {
    /// Factory for a measurement plugin. The descriptor's kind is forced to
    /// [`PluginKind::Measurement`].
    pub fn measurement<P, F>(mut descriptor: PluginDescriptor, create: F) -> Self
    where
        P: MeasurementPlugin + 'static,
        F: Fn() -> P + Send + Sync + 'static,
    {
        descriptor.kind = PluginKind::Measurement;
        Self {
            descriptor,
            create: Arc::new(move || Built::Measurement(Box::new(create()))),
        }
    }

    /// Factory for a processing plugin.
    pub fn processing<P, F>(mut descriptor: PluginDescriptor, create: F) -> Self
    where
        P: ProcessingPlugin + 'static,
        F: Fn() -> P + Send + Sync + 'static,
    {
        descriptor.kind = PluginKind::Processing;
        Self {
            descriptor,
            create: Arc::new(move || Built::Processing(Box::new(create()))),
        }
    }

    /// Descriptor of the plugins this factory builds.
    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }
}

impl fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginFactory")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

struct CatalogEntry {
    descriptor: PluginDescriptor,
    factory: PluginFactory,
    overrides: PluginSettings,
}

struct LivePlugin {
    instance: PluginInstance,
    settings: PluginSettings,
}

/// Name-keyed plugin catalog with lazily created singleton instances.
///
/// Shared as `Arc<PluginRegistry>`; every method takes `&self`.
pub struct PluginRegistry {
    factories: RwLock<BTreeMap<String, PluginFactory>>,
    catalog: RwLock<BTreeMap<String, CatalogEntry>>,
    instances: Mutex<BTreeMap<String, LivePlugin>>,
    settings_dir: Option<PathBuf>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(BTreeMap::new()),
            catalog: RwLock::new(BTreeMap::new()),
            instances: Mutex::new(BTreeMap::new()),
            settings_dir: None,
        }
    }

    /// A registry with the bundled simulated plugins registered under their
    /// own names and exposed as manifest factories.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for (factory_id, factory) in super::builtin::factories() {
            registry.register(factory.clone());
            registry.register_factory(factory_id, factory);
        }
        registry
    }

    /// Directory holding `<plugin>.json` settings files.
    pub fn with_settings_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.settings_dir = Some(dir.into());
        self
    }

    /// Make a factory available to manifests under `factory_id`.
    pub fn register_factory(&self, factory_id: &str, factory: PluginFactory) {
        debug!(factory = factory_id, plugin = %factory.descriptor.name, "Factory registered");
        self.factories.write().insert(factory_id.to_string(), factory);
    }

    /// Register a plugin under its descriptor name.
    pub fn register(&self, factory: PluginFactory) {
        let descriptor = factory.descriptor.clone();
        self.insert_entry(CatalogEntry {
            descriptor,
            factory,
            overrides: PluginSettings::default(),
        });
    }

    /// Register the plugin a manifest describes.
    pub fn register_manifest(&self, manifest: PluginManifest) -> AppResult<PluginDescriptor> {
        let factory = self
            .factories
            .read()
            .get(&manifest.factory)
            .cloned()
            .ok_or_else(|| {
                SweepError::config(format!(
                    "manifest '{}' names unknown factory '{}'",
                    manifest.name, manifest.factory
                ))
            })?;

        let mut descriptor = factory.descriptor.clone();
        descriptor.name = manifest.name;
        if let Some(version) = manifest.version {
            descriptor.version = version;
        }
        if let Some(description) = manifest.description {
            descriptor.description = description;
        }

        self.insert_entry(CatalogEntry {
            descriptor: descriptor.clone(),
            factory,
            overrides: PluginSettings::from_map(manifest.settings),
        });
        Ok(descriptor)
    }

    fn insert_entry(&self, entry: CatalogEntry) {
        let name = entry.descriptor.name.clone();
        let kind = entry.descriptor.kind;
        if self.catalog.write().insert(name.clone(), entry).is_some() {
            warn!(plugin = %name, "Plugin re-registered, replacing previous entry");
            self.instances.lock().remove(&name);
        }
        info!(plugin = %name, %kind, "Plugin registered");
    }

    /// Scan `dir` for manifests and register each valid one.
    ///
    /// A missing directory yields an empty list. Manifests that fail to parse
    /// or name an unknown factory are logged and skipped.
    pub fn discover_and_register(&self, dir: &Path) -> AppResult<Vec<String>> {
        if !dir.exists() {
            debug!(path = %dir.display(), "Plugin directory does not exist");
            return Ok(Vec::new());
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && PluginManifest::is_manifest_path(path))
            .collect();
        paths.sort();

        let mut registered = Vec::new();
        for path in paths {
            match PluginManifest::from_path(&path).and_then(|m| self.register_manifest(m)) {
                Ok(descriptor) => {
                    info!(plugin = %descriptor.name, path = %path.display(), "Discovered plugin");
                    registered.push(descriptor.name);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping plugin manifest"),
            }
        }
        Ok(registered)
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.catalog.read().contains_key(name)
    }

    /// Descriptor of a registered plugin.
    pub fn descriptor(&self, name: &str) -> Option<PluginDescriptor> {
        self.catalog.read().get(name).map(|e| e.descriptor.clone())
    }

    /// Descriptors of every registered plugin, ordered by name.
    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.catalog
            .read()
            .values()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Names of the registered plugins of one kind, ordered by name.
    pub fn list_by_kind(&self, kind: PluginKind) -> Vec<String> {
        self.catalog
            .read()
            .values()
            .filter(|e| e.descriptor.kind == kind)
            .map(|e| e.descriptor.name.clone())
            .collect()
    }

    /// Return the singleton for `name`, creating and configuring it on first use.
    pub fn get_or_create(&self, name: &str) -> AppResult<PluginInstance> {
        let mut instances = self.instances.lock();
        if let Some(live) = instances.get(name) {
            return Ok(live.instance.clone());
        }

        let (factory, overrides) = {
            let catalog = self.catalog.read();
            let entry = catalog
                .get(name)
                .ok_or_else(|| SweepError::PluginNotFound(name.to_string()))?;
            (entry.factory.clone(), entry.overrides.clone())
        };

        let mut built = (factory.create)();
        let specs = built.parameter_specs();

        let mut settings = PluginSettings::from_specs(&specs);
        settings.merge(&overrides);
        if let Some(saved) = self.load_saved_settings(name) {
            settings.merge(&saved);
        }

        settings
            .validate(&specs)
            .and_then(|()| built.configure(&settings))
            .map_err(|source| SweepError::PluginLifecycle {
                plugin: name.to_string(),
                source,
            })?;

        let instance = built.into_instance();
        instances.insert(
            name.to_string(),
            LivePlugin {
                instance: instance.clone(),
                settings,
            },
        );
        info!(plugin = name, "Plugin instance created");
        Ok(instance)
    }

    /// Settings a created instance was configured with.
    pub fn settings_of(&self, name: &str) -> Option<PluginSettings> {
        self.instances.lock().get(name).map(|l| l.settings.clone())
    }

    fn settings_path(&self, name: &str) -> Option<PathBuf> {
        self.settings_dir
            .as_ref()
            .map(|dir| dir.join(format!("{name}.json")))
    }

    fn load_saved_settings(&self, name: &str) -> Option<PluginSettings> {
        let path = self.settings_path(name)?;
        if !path.exists() {
            return None;
        }
        match SettingsFile::load(&path, name) {
            Ok(file) => {
                debug!(plugin = name, path = %path.display(), "Loaded saved settings");
                Some(file.parameters)
            }
            Err(e) => {
                warn!(plugin = name, path = %path.display(), error = %e, "Ignoring saved settings");
                None
            }
        }
    }

    /// Persist settings for `name`; they apply the next time the plugin is created.
    pub fn save_settings(&self, name: &str, settings: &PluginSettings) -> AppResult<PathBuf> {
        let descriptor = self
            .descriptor(name)
            .ok_or_else(|| SweepError::PluginNotFound(name.to_string()))?;
        let path = self
            .settings_path(name)
            .ok_or_else(|| SweepError::config("no plugin settings directory configured"))?;

        SettingsFile {
            plugin_name: descriptor.name,
            plugin_version: descriptor.version,
            parameters: settings.clone(),
        }
        .save(&path)?;
        Ok(path)
    }

    /// Clean up every created instance. Failures are logged and collected;
    /// they never stop the remaining cleanups.
    pub async fn cleanup_all(&self) -> Vec<String> {
        let live: Vec<(String, PluginInstance)> = self
            .instances
            .lock()
            .iter()
            .map(|(name, l)| (name.clone(), l.instance.clone()))
            .collect();

        let mut failed = Vec::new();
        for (name, instance) in live {
            if let Err(e) = instance.cleanup().await {
                warn!(plugin = %name, error = %e, "Plugin cleanup failed");
                failed.push(name);
            }
        }
        info!(count = failed.len(), "Plugin cleanup finished");
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::builtin::{CAMERA, DELAY, IMAGE_PROCESSOR, STATISTICS, TEMPERATURE_SENSOR};
    use std::fs;

    #[test]
    fn test_builtins_listed_by_kind() {
        let registry = PluginRegistry::with_builtins();
        let measurement = registry.list_by_kind(PluginKind::Measurement);
        assert!(measurement.contains(&TEMPERATURE_SENSOR.to_string()));
        assert!(measurement.contains(&DELAY.to_string()));
        assert!(measurement.contains(&CAMERA.to_string()));
        assert_eq!(
            registry.list_by_kind(PluginKind::Processing),
            vec![IMAGE_PROCESSOR, STATISTICS]
        );
    }

    #[test]
    fn test_get_or_create_returns_singleton() {
        let registry = PluginRegistry::with_builtins();
        let a = registry.get_or_create(TEMPERATURE_SENSOR).unwrap();
        let b = registry.get_or_create(TEMPERATURE_SENSOR).unwrap();
        let (a, b) = (a.as_measurement().unwrap(), b.as_measurement().unwrap());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_unknown_name_is_not_found() {
        let registry = PluginRegistry::new();
        let err = registry.get_or_create("Nope").unwrap_err();
        assert!(matches!(err, SweepError::PluginNotFound(ref n) if n == "Nope"));
    }

    #[test]
    fn test_discovery_registers_without_instantiating() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("chamber.yaml"),
            "name: ChamberSensor\nfactory: temperature_sensor\nversion: \"9.9\"\nsettings:\n  noise_level: 0.0\n",
        )
        .unwrap();
        fs::write(dir.path().join("broken.yaml"), "name: [unclosed\n").unwrap();
        fs::write(dir.path().join("ghost.toml"), "name = \"Ghost\"\nfactory = \"missing\"\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "not a manifest").unwrap();

        let registry = PluginRegistry::with_builtins();
        let found = registry.discover_and_register(dir.path()).unwrap();

        assert_eq!(found, vec!["ChamberSensor"]);
        assert_eq!(registry.descriptor("ChamberSensor").unwrap().version, "9.9");
        assert!(!registry.contains("Ghost"));
        assert!(registry.settings_of("ChamberSensor").is_none());

        registry.get_or_create("ChamberSensor").unwrap();
        let settings = registry.settings_of("ChamberSensor").unwrap();
        assert_eq!(settings.f64_or("noise_level", -1.0), 0.0);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let registry = PluginRegistry::with_builtins();
        let found = registry
            .discover_and_register(Path::new("/definitely/not/here"))
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_saved_settings_apply_on_create() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PluginRegistry::with_builtins().with_settings_dir(dir.path());

        let mut settings = PluginSettings::default();
        settings.set("default_delay", 0.25);
        let path = registry.save_settings(DELAY, &settings).unwrap();
        assert!(path.ends_with("DelayPlugin.json"));

        registry.get_or_create(DELAY).unwrap();
        let resolved = registry.settings_of(DELAY).unwrap();
        assert_eq!(resolved.f64_or("default_delay", 0.0), 0.25);
        assert!(resolved.get("verbose_logging").is_some());
    }

    #[test]
    fn test_invalid_setting_fails_creation() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PluginRegistry::with_builtins().with_settings_dir(dir.path());

        let mut settings = PluginSettings::default();
        settings.set("window_size", 1000);
        registry.save_settings(STATISTICS, &settings).unwrap();

        let err = registry.get_or_create(STATISTICS).unwrap_err();
        assert!(matches!(err, SweepError::PluginLifecycle { .. }));
    }

    #[test]
    fn test_save_settings_needs_directory() {
        let registry = PluginRegistry::with_builtins();
        let err = registry
            .save_settings(DELAY, &PluginSettings::default())
            .unwrap_err();
        assert!(matches!(err, SweepError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_cleanup_all_visits_created_instances() {
        let registry = PluginRegistry::with_builtins();
        let sensor = registry.get_or_create(TEMPERATURE_SENSOR).unwrap();
        sensor.initialize().await.unwrap();

        assert!(registry.cleanup_all().await.is_empty());
    }
}
