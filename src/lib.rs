//! Core library for the rust_sweep measurement sequencer.
//!
//! A sweep is described by a [`SequenceDefinition`](sequence::SequenceDefinition):
//! parameter ranges expanded into measurement points, and the plugins that
//! measure and post-process each point. The [`RunEngine`](engine::RunEngine)
//! executes a sequence in the background, emits progress events and writes
//! every point to a [`ResultStore`](storage::ResultStore).
//!
//! ```no_run
//! use std::sync::Arc;
//! use rust_sweep::engine::{EngineConfig, RunEngine};
//! use rust_sweep::plugin::PluginRegistry;
//! use rust_sweep::sequence::{ParameterRange, SequenceDefinition};
//! use rust_sweep::storage::SqliteResultStore;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let registry = Arc::new(PluginRegistry::with_builtins());
//! let store = Arc::new(SqliteResultStore::open_in_memory()?);
//! let engine = RunEngine::new(registry, store, EngineConfig::default());
//!
//! let mut sequence = SequenceDefinition::new("cooldown", "Setpoint sweep")
//!     .with_measurement_plugin("TemperatureSensor");
//! sequence.add_parameter_range(ParameterRange::new("setpoint", 20.0, 25.0, 6, "C")?);
//! sequence.generate_points()?;
//!
//! engine.start(sequence).await?;
//! let outcome = engine.wait().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod logging;
pub mod plugin;
pub mod sequence;
pub mod storage;
