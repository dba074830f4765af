//! Rolling statistics over every numeric reading of a run.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, warn};

use crate::core::{FieldMap, FieldValue, PointResults, UNIT_INFO_KEY};
use crate::error::PluginError;
use crate::plugin::{
    ParameterSpec, Plugin, PluginDescriptor, PluginKind, PluginSettings, ProcessingPlugin,
};

/// Keeps a bounded history per `<plugin>.<field>` key and reports window
/// statistics, a trend classification and global figures for each point.
///
/// Boolean fields are not treated as numbers here.
pub struct StatisticsProcessor {
    settings: PluginSettings,
    history: BTreeMap<String, VecDeque<f64>>,
}

impl Default for StatisticsProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsProcessor {
    /// A processor with empty history.
    pub fn new() -> Self {
        Self {
            settings: PluginSettings::default(),
            history: BTreeMap::new(),
        }
    }

    /// Descriptor registered for this plugin.
    pub fn descriptor() -> PluginDescriptor {
        PluginDescriptor::new(super::STATISTICS, "3.0", PluginKind::Processing)
            .with_description("Per-reading rolling statistics and trend detection")
    }

    fn numeric_readings(results: &PointResults) -> BTreeMap<String, f64> {
        let mut readings = BTreeMap::new();
        for (plugin, fields) in results {
            for (field, value) in fields {
                if field == UNIT_INFO_KEY {
                    continue;
                }
                if let FieldValue::Number(v) = value {
                    readings.insert(format!("{plugin}.{field}"), *v);
                }
            }
        }
        readings
    }

    fn remember(&mut self, key: &str, value: f64) -> Vec<f64> {
        let max_history = self.settings.i64_or("max_history", 1000).max(1) as usize;
        let window = self.settings.i64_or("window_size", 10).max(1) as usize;

        let history = self.history.entry(key.to_string()).or_default();
        history.push_back(value);
        while history.len() > max_history {
            history.pop_front();
        }
        history
            .iter()
            .skip(history.len().saturating_sub(window))
            .copied()
            .collect()
    }
}

#[async_trait]
impl Plugin for StatisticsProcessor {
    fn describe(&self) -> PluginDescriptor {
        Self::descriptor()
    }

    fn parameter_specs(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::int("window_size", 10)
                .range(2.0, 100.0)
                .describe("Readings included in the rolling window"),
            ParameterSpec::boolean("enable_percentiles", true),
            ParameterSpec::boolean("enable_trend", true),
            ParameterSpec::float("trend_threshold", 0.1)
                .range(0.01, 1.0)
                .describe("Trend below this fraction of the std deviation counts as stable"),
            ParameterSpec::int("max_history", 1000).range(10.0, 10000.0),
            ParameterSpec::int("decimal_places", 6).range(1.0, 10.0),
            ParameterSpec::boolean("enable_global_stats", true),
        ]
    }

    fn configure(&mut self, settings: &PluginSettings) -> Result<(), PluginError> {
        self.settings = settings.clone();
        Ok(())
    }

    async fn initialize(&mut self) -> Result<(), PluginError> {
        self.history.clear();
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), PluginError> {
        self.history.clear();
        Ok(())
    }
}

#[async_trait]
impl ProcessingPlugin for StatisticsProcessor {
    fn required_inputs(&self) -> BTreeSet<String> {
        BTreeSet::from(["numerical_values".to_string()])
    }

    async fn process(&mut self, results: &PointResults) -> Result<FieldMap, PluginError> {
        let readings = Self::numeric_readings(results);
        if readings.is_empty() {
            warn!(plugin = super::STATISTICS, "No numeric readings to process");
            return Ok(FieldMap::new());
        }

        let places = self.settings.i64_or("decimal_places", 6).clamp(0, 15) as i32;
        let percentiles = self.settings.bool_or("enable_percentiles", true);
        let trend_enabled = self.settings.bool_or("enable_trend", true);
        let threshold = self.settings.f64_or("trend_threshold", 0.1);

        let mut out = FieldMap::new();
        for (key, value) in &readings {
            let window = self.remember(key, *value);
            let stats = WindowStats::of(&window);

            let mut put = |name: &str, v: f64| {
                out.insert(format!("{key}_{name}"), FieldValue::Number(round(v, places)));
            };
            put("current", *value);
            put("count", window.len() as f64);
            put("mean", stats.mean);
            put("std", stats.std);
            put("min", stats.min);
            put("max", stats.max);
            put("range", stats.max - stats.min);
            put("median", percentile(&window, 50.0));
            put("cv", if stats.mean != 0.0 { stats.std / stats.mean * 100.0 } else { 0.0 });
            if percentiles && window.len() >= 4 {
                put("p25", percentile(&window, 25.0));
                put("p75", percentile(&window, 75.0));
            }

            if trend_enabled && window.len() >= 2 {
                let trend = window[window.len() - 1] - window[0];
                put("trend", trend);
                let direction = if trend.abs() < stats.std * threshold {
                    "stable"
                } else if trend > 0.0 {
                    "increasing"
                } else {
                    "decreasing"
                };
                out.insert(format!("{key}_trend_direction"), direction.into());
            }
        }

        if self.settings.bool_or("enable_global_stats", true) {
            let values: Vec<f64> = readings.values().copied().collect();
            let stats = WindowStats::of(&values);
            out.insert("global_mean".into(), round(stats.mean, places).into());
            out.insert("global_min".into(), round(stats.min, places).into());
            out.insert("global_max".into(), round(stats.max, places).into());
        }

        debug!(readings = readings.len(), fields = out.len(), "Statistics computed");
        Ok(out)
    }
}

struct WindowStats {
    mean: f64,
    std: f64,
    min: f64,
    max: f64,
}

impl WindowStats {
    fn of(values: &[f64]) -> Self {
        let n = values.len().max(1) as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean,
            std: variance.sqrt(),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

/// Linear-interpolated percentile.
fn percentile(values: &[f64], pct: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let rank = pct / 100.0 * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
        }
    }
}

fn round(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
