//! Simulated plugins bundled with the engine.
//!
//! They stand in for real instruments during development and in the demo
//! sequences under `demos/`.

mod camera;
mod delay;
mod frame;
mod image;
mod statistics;
mod temperature;

pub use camera::CameraPlugin;
pub use delay::DelayPlugin;
pub use frame::Frame;
pub use image::ImageProcessor;
pub use statistics::StatisticsProcessor;
pub use temperature::TemperatureSensor;

use super::PluginFactory;

/// Registry name of [`TemperatureSensor`].
pub const TEMPERATURE_SENSOR: &str = "TemperatureSensor";
/// Registry name of [`DelayPlugin`].
pub const DELAY: &str = "DelayPlugin";
/// Registry name of [`StatisticsProcessor`].
pub const STATISTICS: &str = "StatisticsProcessor";
/// Registry name of [`CameraPlugin`].
pub const CAMERA: &str = "CameraPlugin";
/// Registry name of [`ImageProcessor`].
pub const IMAGE_PROCESSOR: &str = "ImageProcessor";

/// Factory ids and factories of every bundled plugin.
pub fn factories() -> Vec<(&'static str, PluginFactory)> {
    vec![
        (
            "temperature_sensor",
            PluginFactory::measurement(TemperatureSensor::descriptor(), TemperatureSensor::new),
        ),
        (
            "delay",
            PluginFactory::measurement(DelayPlugin::descriptor(), DelayPlugin::new),
        ),
        (
            "camera",
            PluginFactory::measurement(CameraPlugin::descriptor(), CameraPlugin::new),
        ),
        (
            "statistics",
            PluginFactory::processing(StatisticsProcessor::descriptor(), StatisticsProcessor::new),
        ),
        (
            "image_processor",
            PluginFactory::processing(ImageProcessor::descriptor(), ImageProcessor::new),
        ),
    ]
}
