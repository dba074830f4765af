//! Simulated PT100/PT1000 temperature sensor.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::{FieldMap, ParameterSet, Reading};
use crate::error::PluginError;
use crate::plugin::{
    MeasurementPlugin, ParameterSpec, Plugin, PluginDescriptor, PluginKind, PluginSettings,
};

const SENSOR_TYPES: &[&str] = &["PT100", "PT1000", "Thermocouple K", "NTC"];

/// Temperature sensor that drifts towards the swept `temperature` (or
/// `setpoint`) parameter with first-order settling and Gaussian noise.
pub struct TemperatureSensor {
    settings: PluginSettings,
    current: f64,
    target: f64,
    connected: bool,
    rng: StdRng,
}

impl Default for TemperatureSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl TemperatureSensor {
    /// A disconnected sensor at 25 °C with default settings.
    pub fn new() -> Self {
        Self {
            settings: PluginSettings::default(),
            current: 25.0,
            target: 25.0,
            connected: false,
            rng: StdRng::from_entropy(),
        }
    }

    /// Descriptor registered for this plugin.
    pub fn descriptor() -> PluginDescriptor {
        PluginDescriptor::new(super::TEMPERATURE_SENSOR, "2.0", PluginKind::Measurement)
            .with_description("Simulated temperature sensor with PT100 characteristic")
    }

    fn noise(&mut self, sigma: f64) -> f64 {
        if sigma <= 0.0 {
            return 0.0;
        }
        // Box-Muller
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen();
        sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}

#[async_trait]
impl Plugin for TemperatureSensor {
    fn describe(&self) -> PluginDescriptor {
        Self::descriptor()
    }

    fn parameter_specs(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::float("noise_level", 0.1)
                .range(0.0, 5.0)
                .unit("°C")
                .describe("Standard deviation of the measurement noise"),
            ParameterSpec::float("response_time", 0.3)
                .range(0.0, 1.0)
                .describe("Fraction of the remaining difference closed per settling step"),
            ParameterSpec::int("settling_steps", 3)
                .range(1.0, 10.0)
                .describe("Settling steps after a new setpoint"),
            ParameterSpec::float("step_interval", 0.1)
                .range(0.0, 10.0)
                .unit("s")
                .describe("Pause between settling steps"),
            ParameterSpec::boolean("pt100_enabled", true)
                .describe("Report the sensor resistance"),
            ParameterSpec::choice("sensor_type", "PT100", SENSOR_TYPES),
            ParameterSpec::float("offset", 0.0)
                .range(-10.0, 10.0)
                .unit("°C")
                .describe("Calibration offset"),
        ]
    }

    fn configure(&mut self, settings: &PluginSettings) -> Result<(), PluginError> {
        self.settings = settings.clone();
        Ok(())
    }

    async fn initialize(&mut self) -> Result<(), PluginError> {
        self.connected = true;
        info!(plugin = super::TEMPERATURE_SENSOR, "Sensor connected");
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), PluginError> {
        self.connected = false;
        Ok(())
    }
}

#[async_trait]
impl MeasurementPlugin for TemperatureSensor {
    async fn set_parameters(&mut self, parameters: &ParameterSet) -> Result<(), PluginError> {
        if let Some(target) = parameters
            .get("setpoint")
            .or_else(|| parameters.get("temperature"))
        {
            self.target = *target;
            debug!(target = self.target, "Setpoint updated");
        }

        let response = self.settings.f64_or("response_time", 0.3);
        let steps = self.settings.i64_or("settling_steps", 3).max(1);
        let interval = Duration::from_secs_f64(self.settings.f64_or("step_interval", 0.1).max(0.0));
        for _ in 0..steps {
            self.current += (self.target - self.current) * response;
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }
        Ok(())
    }

    async fn measure(&mut self) -> Result<FieldMap, PluginError> {
        if !self.connected {
            return Err(PluginError::NotInitialized);
        }

        let noise_level = self.settings.f64_or("noise_level", 0.1);
        let offset = self.settings.f64_or("offset", 0.0);
        let sensor_type = self.settings.str_or("sensor_type", "PT100").to_string();

        let noise = self.noise(noise_level);
        let measured = self.current + noise + offset;

        let mut reading = Reading::new()
            .field("temperature", round(measured, 2))
            .field("target_temperature", self.target)
            .field("sensor_type", sensor_type.as_str())
            .unit("temperature", "°C")
            .unit("target_temperature", "°C");

        if self.settings.bool_or("pt100_enabled", true) {
            let (r0, slope, jitter) = match sensor_type.as_str() {
                "PT100" => (100.0, 0.385, 0.01),
                "PT1000" => (1000.0, 3.85, 0.1),
                _ => (0.0, 0.0, 0.0),
            };
            let resistance = if r0 > 0.0 {
                r0 + slope * measured + self.noise(noise_level * jitter)
            } else {
                0.0
            };
            reading = reading
                .field("resistance", round(resistance, 3))
                .unit("resistance", "Ohm");
        }

        Ok(reading.build())
    }

    fn units(&self) -> BTreeMap<String, String> {
        let mut units = BTreeMap::from([
            ("temperature".to_string(), "°C".to_string()),
            ("target_temperature".to_string(), "°C".to_string()),
        ]);
        if self.settings.bool_or("pt100_enabled", true) {
            units.insert("resistance".into(), "Ohm".into());
        }
        units
    }
}

fn round(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
