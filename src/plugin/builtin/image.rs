//! Image analysis of camera frames.

use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use super::frame::Frame;
use crate::core::{FieldMap, FieldValue, PointResults, Reading};
use crate::error::PluginError;
use crate::plugin::{Plugin, PluginDescriptor, PluginKind, ProcessingPlugin};

/// Finds the first `image` blob among the point's results and reports
/// brightness statistics, contrast, edge and sharpness figures and a
/// coarse quality rating.
#[derive(Default)]
pub struct ImageProcessor;

impl ImageProcessor {
    /// The processor is stateless.
    pub fn new() -> Self {
        Self
    }

    /// Descriptor registered for this plugin.
    pub fn descriptor() -> PluginDescriptor {
        PluginDescriptor::new(super::IMAGE_PROCESSOR, "1.0", PluginKind::Processing)
            .with_description("Brightness, contrast and sharpness of camera frames")
    }
}

fn find_image(results: &PointResults) -> Option<&[u8]> {
    results
        .values()
        .find_map(|fields| fields.get("image").and_then(FieldValue::as_bytes))
}

fn round(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// 3x3 Laplacian over the interior pixels.
fn laplacian(frame: &Frame) -> Vec<f64> {
    if frame.width < 3 || frame.height < 3 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity((frame.width - 2) * (frame.height - 2));
    for y in 1..frame.height - 1 {
        for x in 1..frame.width - 1 {
            let mut sum = 8.0 * frame.get(x, y) as f64;
            for (dx, dy) in [(0, 0), (1, 0), (2, 0), (0, 1), (2, 1), (0, 2), (1, 2), (2, 2)] {
                sum -= frame.get(x + dx - 1, y + dy - 1) as f64;
            }
            out.push(sum);
        }
    }
    out
}

fn quality_rating(score: i64) -> &'static str {
    match score {
        90.. => "excellent",
        70..=89 => "good",
        50..=69 => "fair",
        _ => "poor",
    }
}

/// Analysis of one frame.
pub fn analyze(frame: &Frame) -> FieldMap {
    let (mean, std) = frame.intensity();
    let mut histogram = [0usize; 256];
    for &p in &frame.pixels {
        histogram[p as usize] += 1;
    }
    let mut sorted = frame.pixels.clone();
    sorted.sort_unstable();
    let n = sorted.len();
    let percentile = |q: f64| sorted.get(((n as f64) * q) as usize).copied().unwrap_or(0);
    let median = sorted.get(n / 2).copied().unwrap_or(0);
    let dominant = histogram
        .iter()
        .enumerate()
        .max_by_key(|(value, count)| (**count, std::cmp::Reverse(*value)))
        .map(|(value, _)| value)
        .unwrap_or(0);

    let lap = laplacian(frame);
    let (edge_strength, sharpness) = if lap.is_empty() {
        (0.0, 0.0)
    } else {
        let len = lap.len() as f64;
        let lap_mean = lap.iter().sum::<f64>() / len;
        let edge = lap.iter().map(|v| v.abs()).sum::<f64>() / len;
        let var = lap.iter().map(|v| (v - lap_mean).powi(2)).sum::<f64>() / len;
        (edge, var)
    };
    let white = frame.pixels.iter().filter(|&&p| p > 128).count();
    let white_ratio = if n == 0 { 0.0 } else { white as f64 / n as f64 };

    let overexposed = mean > 240.0;
    let underexposed = mean < 20.0;
    let low_contrast = std < 20.0;
    let mut score: i64 = 100;
    if overexposed {
        score -= 30;
    }
    if underexposed {
        score -= 30;
    }
    if low_contrast {
        score -= 20;
    }
    if std > 40.0 {
        score = (score + 10).min(100);
    }

    Reading::new()
        .field("image_width", frame.width)
        .field("image_height", frame.height)
        .field("brightness_mean", round(mean, 2))
        .field("brightness_std", round(std, 2))
        .field("brightness_median", median as f64)
        .field("dominant_intensity", dominant)
        .field(
            "contrast_range",
            percentile(0.95) as f64 - percentile(0.05) as f64,
        )
        .field("edge_strength", round(edge_strength, 2))
        .field("sharpness", round(sharpness, 2))
        .field("binary_white_ratio", round(white_ratio, 4))
        .field("overexposed", overexposed)
        .field("underexposed", underexposed)
        .field("low_contrast", low_contrast)
        .field("quality_score", score.max(0))
        .field("quality_rating", quality_rating(score))
        .unit("image_width", "px")
        .unit("image_height", "px")
        .build()
}

#[async_trait]
impl Plugin for ImageProcessor {
    fn describe(&self) -> PluginDescriptor {
        Self::descriptor()
    }

    async fn initialize(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

#[async_trait]
impl ProcessingPlugin for ImageProcessor {
    fn required_inputs(&self) -> BTreeSet<String> {
        BTreeSet::from(["image".to_string()])
    }

    async fn process(&mut self, results: &PointResults) -> Result<FieldMap, PluginError> {
        let Some(image) = find_image(results) else {
            warn!(plugin = super::IMAGE_PROCESSOR, "No image in point results");
            return Ok(FieldMap::new());
        };
        let frame = Frame::from_pgm(image)?;
        debug!(width = frame.width, height = frame.height, "Analyzing frame");
        Ok(analyze(&frame))
    }
}
