//! Wait step for sequences that need a dwell time at each point.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::core::{FieldMap, ParameterSet, Reading};
use crate::error::PluginError;
use crate::plugin::{
    MeasurementPlugin, ParameterSpec, Plugin, PluginDescriptor, PluginKind, PluginSettings,
};

/// Sleeps for the swept `delay` (or `wait_time`) parameter, falling back to
/// the `default_delay` setting, and reports how long it actually waited.
pub struct DelayPlugin {
    settings: PluginSettings,
    delay: Duration,
    initialized: bool,
}

impl Default for DelayPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayPlugin {
    /// A delay plugin with default settings.
    pub fn new() -> Self {
        Self {
            settings: PluginSettings::default(),
            delay: Duration::from_secs(1),
            initialized: false,
        }
    }

    /// Descriptor registered for this plugin.
    pub fn descriptor() -> PluginDescriptor {
        PluginDescriptor::new(super::DELAY, "2.0", PluginKind::Measurement)
            .with_description("Non-blocking dwell time between measurements")
    }

    fn verbose(&self) -> bool {
        self.settings.bool_or("verbose_logging", false)
    }
}

#[async_trait]
impl Plugin for DelayPlugin {
    fn describe(&self) -> PluginDescriptor {
        Self::descriptor()
    }

    fn parameter_specs(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::float("default_delay", 1.0)
                .range(0.0, 300.0)
                .unit("s")
                .describe("Delay used when the point sweeps no delay parameter"),
            ParameterSpec::boolean("verbose_logging", false),
        ]
    }

    fn configure(&mut self, settings: &PluginSettings) -> Result<(), PluginError> {
        self.settings = settings.clone();
        Ok(())
    }

    async fn initialize(&mut self) -> Result<(), PluginError> {
        info!(
            plugin = super::DELAY,
            default_delay = self.settings.f64_or("default_delay", 1.0),
            "Delay plugin ready"
        );
        self.initialized = true;
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), PluginError> {
        self.initialized = false;
        Ok(())
    }
}

#[async_trait]
impl MeasurementPlugin for DelayPlugin {
    async fn set_parameters(&mut self, parameters: &ParameterSet) -> Result<(), PluginError> {
        let seconds = parameters
            .get("delay")
            .or_else(|| parameters.get("wait_time"))
            .copied()
            .unwrap_or_else(|| self.settings.f64_or("default_delay", 1.0));

        if !seconds.is_finite() {
            return Err(PluginError::InvalidSetting {
                name: "delay".into(),
                reason: format!("{seconds} is not a valid duration"),
            });
        }
        self.delay = Duration::from_secs_f64(seconds.max(0.0));
        if self.verbose() {
            info!(delay = ?self.delay, "Delay set");
        }
        Ok(())
    }

    async fn measure(&mut self) -> Result<FieldMap, PluginError> {
        if !self.initialized {
            return Err(PluginError::NotInitialized);
        }

        let started = Instant::now();
        tokio::time::sleep(self.delay).await;
        let actual = started.elapsed();
        debug!(requested = ?self.delay, actual = ?actual, "Delay complete");

        Ok(Reading::new()
            .field("delay_requested", self.delay.as_secs_f64())
            .field("delay_actual", (actual.as_secs_f64() * 1000.0).round() / 1000.0)
            .field("delay_complete", true)
            .unit("delay_requested", "s")
            .unit("delay_actual", "s")
            .build())
    }

    fn units(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("delay_requested".to_string(), "s".to_string()),
            ("delay_actual".to_string(), "s".to_string()),
        ])
    }
}
