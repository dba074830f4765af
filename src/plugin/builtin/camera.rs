//! Simulated camera producing grayscale test frames.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use super::frame::{self, Frame};
use crate::core::{FieldMap, ParameterSet, Reading};
use crate::error::PluginError;
use crate::plugin::{
    MeasurementPlugin, ParameterSpec, Plugin, PluginDescriptor, PluginKind, PluginSettings,
};

/// Camera that "exposes" for the swept `exposure` (ms) with the swept
/// `gain`, and returns the frame as an `image` blob plus intensity figures.
///
/// The frame is a vertical gradient whose brightness scales with
/// exposure and gain, overlaid with two marker rectangles and uniform noise.
pub struct CameraPlugin {
    settings: PluginSettings,
    exposure_ms: f64,
    gain: f64,
    connected: bool,
    rng: StdRng,
}

impl Default for CameraPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraPlugin {
    /// A disconnected camera with default settings.
    pub fn new() -> Self {
        Self {
            settings: PluginSettings::default(),
            exposure_ms: 100.0,
            gain: 1.0,
            connected: false,
            rng: StdRng::from_entropy(),
        }
    }

    /// Descriptor registered for this plugin.
    pub fn descriptor() -> PluginDescriptor {
        PluginDescriptor::new(super::CAMERA, "2.0", PluginKind::Measurement)
            .with_description("Simulated camera for image acquisition")
    }

    fn resolution(&self) -> (usize, usize) {
        let width = self.settings.i64_or("resolution_width", 640).max(1) as usize;
        let height = self.settings.i64_or("resolution_height", 480).max(1) as usize;
        (width, height)
    }

    fn capture(&mut self) -> Frame {
        let (width, height) = self.resolution();
        let noise = self.settings.i64_or("noise_level", 5).max(0);
        let scale = (self.exposure_ms / 100.0) * self.gain;

        let mut frame = Frame::new(width, height);
        for y in 0..height {
            let base = 255.0 * y as f64 / height as f64 * scale;
            for x in 0..width {
                let jitter = if noise > 0 {
                    self.rng.gen_range(-noise..=noise) as f64
                } else {
                    0.0
                };
                frame.set(x, y, (base + jitter).clamp(0.0, 255.0) as u8);
            }
        }
        frame.outline((50, 50), (150, 150), 255);
        frame.outline((200, 100), (300, 200), 255);
        frame
    }
}

#[async_trait]
impl Plugin for CameraPlugin {
    fn describe(&self) -> PluginDescriptor {
        Self::descriptor()
    }

    fn parameter_specs(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::int("resolution_width", 640)
                .range(320.0, 1920.0)
                .unit("px"),
            ParameterSpec::int("resolution_height", 480)
                .range(240.0, 1080.0)
                .unit("px"),
            ParameterSpec::float("default_exposure", 100.0)
                .range(1.0, 1000.0)
                .unit("ms")
                .describe("Exposure when the sequence does not sweep `exposure`"),
            ParameterSpec::float("default_gain", 1.0)
                .range(0.1, 10.0)
                .describe("Gain when the sequence does not sweep `gain`"),
            ParameterSpec::int("noise_level", 5)
                .range(0.0, 50.0)
                .describe("Peak pixel noise"),
        ]
    }

    fn configure(&mut self, settings: &PluginSettings) -> Result<(), PluginError> {
        self.settings = settings.clone();
        Ok(())
    }

    async fn initialize(&mut self) -> Result<(), PluginError> {
        let (width, height) = self.resolution();
        self.connected = true;
        info!(plugin = super::CAMERA, width, height, "Camera connected");
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), PluginError> {
        self.connected = false;
        Ok(())
    }
}

#[async_trait]
impl MeasurementPlugin for CameraPlugin {
    async fn set_parameters(&mut self, parameters: &ParameterSet) -> Result<(), PluginError> {
        self.exposure_ms = parameters
            .get("exposure")
            .copied()
            .unwrap_or_else(|| self.settings.f64_or("default_exposure", 100.0))
            .clamp(1.0, 1000.0);
        self.gain = parameters
            .get("gain")
            .copied()
            .unwrap_or_else(|| self.settings.f64_or("default_gain", 1.0))
            .clamp(0.1, 10.0);
        debug!(exposure_ms = self.exposure_ms, gain = self.gain, "Camera configured");
        Ok(())
    }

    async fn measure(&mut self) -> Result<FieldMap, PluginError> {
        if !self.connected {
            return Err(PluginError::NotInitialized);
        }
        tokio::time::sleep(Duration::from_secs_f64(self.exposure_ms / 1000.0)).await;

        let frame = self.capture();
        let (mean, std) = frame.intensity();
        let image = frame.to_pgm();
        debug!(bytes = image.len(), "Frame captured");

        Ok(Reading::new()
            .field("image_size_bytes", image.len())
            .field("image", image)
            .field("mean_intensity", round(mean))
            .field("std_intensity", round(std))
            .field("width", frame.width)
            .field("height", frame.height)
            .field("exposure_time", self.exposure_ms)
            .field("gain", self.gain)
            .field("image_format", frame::FORMAT)
            .unit("width", "px")
            .unit("height", "px")
            .unit("exposure_time", "ms")
            .unit("image_size_bytes", "Bytes")
            .build())
    }

    fn units(&self) -> BTreeMap<String, String> {
        [
            ("width", "px"),
            ("height", "px"),
            ("exposure_time", "ms"),
            ("image_size_bytes", "Bytes"),
        ]
        .into_iter()
        .map(|(field, unit)| (field.to_string(), unit.to_string()))
        .collect()
    }
}

fn round(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_camera(noise: i64) -> CameraPlugin {
        let mut camera = CameraPlugin::new();
        let mut settings = PluginSettings::from_specs(&camera.parameter_specs());
        settings.set("resolution_width", 320);
        settings.set("resolution_height", 240);
        settings.set("noise_level", noise);
        camera.configure(&settings).unwrap();
        camera
    }

    #[tokio::test]
    async fn test_measure_requires_initialize() {
        let mut camera = small_camera(0);
        assert_eq!(camera.measure().await.unwrap_err(), PluginError::NotInitialized);
    }

    #[tokio::test]
    async fn test_frame_is_returned_as_blob() {
        let mut camera = small_camera(0);
        camera.initialize().await.unwrap();
        camera
            .set_parameters(&ParameterSet::from([("exposure".to_string(), 2.0)]))
            .await
            .unwrap();

        let fields = camera.measure().await.unwrap();
        let image = fields["image"].as_bytes().unwrap();
        let frame = Frame::from_pgm(image).unwrap();
        assert_eq!((frame.width, frame.height), (320, 240));
        assert_eq!(fields["image_size_bytes"].as_f64(), Some(image.len() as f64));
        assert_eq!(fields["exposure_time"].as_f64(), Some(2.0));
        assert_eq!(fields["image_format"].as_str(), Some("PGM"));
    }

    #[tokio::test]
    async fn test_longer_exposure_is_brighter() {
        let mut camera = small_camera(0);
        camera.initialize().await.unwrap();

        let mut means = Vec::new();
        for exposure in [5.0, 50.0] {
            camera
                .set_parameters(&ParameterSet::from([("exposure".to_string(), exposure)]))
                .await
                .unwrap();
            let fields = camera.measure().await.unwrap();
            means.push(fields["mean_intensity"].as_f64().unwrap());
        }
        assert!(means[1] > means[0], "{means:?}");
    }

    #[tokio::test]
    async fn test_out_of_range_parameters_are_clamped() {
        let mut camera = small_camera(0);
        camera
            .set_parameters(&ParameterSet::from([
                ("exposure".to_string(), 0.0),
                ("gain".to_string(), 50.0),
            ]))
            .await
            .unwrap();
        assert_eq!((camera.exposure_ms, camera.gain), (1.0, 10.0));
    }
}
