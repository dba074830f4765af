//! `rust_sweep` command line: run, author, inspect and export measurement sequences.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use rust_sweep::config::{SweepConfig, DEFAULT_CONFIG_PATH};
use rust_sweep::engine::{EngineState, RunEngine};
use rust_sweep::logging;
use rust_sweep::plugin::PluginRegistry;
use rust_sweep::sequence::{ParameterRange, SequenceDefinition};
use rust_sweep::storage::{export_to_path, ExportFormat, ResultStore, SqliteResultStore};

#[derive(Parser, Debug)]
#[command(name = "rust_sweep", about = "Parameter sweep measurement sequencer")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Override the result database path.
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a sequence document and store its results.
    Run(RunArgs),
    /// Write a new sequence document from parameter ranges.
    Generate(GenerateArgs),
    /// List registered plugins.
    Plugins,
    /// List sequences with stored results.
    Sequences,
    /// Print the recorded values of one field.
    History { sequence: String, field: String },
    /// Export stored points of a sequence.
    Export(ExportArgs),
    /// Delete stored points of a sequence.
    Delete { sequence: String },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Sequence document (JSON).
    sequence: PathBuf,
    /// Override the settle delay, e.g. `100ms`.
    #[arg(long, value_parser = humantime::parse_duration)]
    settle_delay: Option<Duration>,
    /// Write the sequence with results attached to this file.
    #[arg(long)]
    save_results: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
    /// `name=start:end:steps[:unit]`, repeatable.
    #[arg(long = "range", required = true, value_parser = parse_range)]
    ranges: Vec<ParameterRange>,
    /// Measurement plugin, repeatable.
    #[arg(long = "measure")]
    measurement_plugins: Vec<String>,
    /// Processing plugin, repeatable.
    #[arg(long = "process")]
    processing_plugins: Vec<String>,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Args, Debug)]
struct ExportArgs {
    sequence: String,
    out: PathBuf,
    /// csv or json
    #[arg(long, default_value = "csv")]
    format: ExportFormat,
}

fn parse_range(s: &str) -> Result<ParameterRange, String> {
    let (name, spec) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=start:end:steps[:unit], got '{s}'"))?;
    let parts: Vec<&str> = spec.split(':').collect();
    if !(3..=4).contains(&parts.len()) {
        return Err(format!("expected start:end:steps[:unit], got '{spec}'"));
    }
    let number = |v: &str| v.trim().parse::<f64>().map_err(|e| format!("'{v}': {e}"));
    let steps = parts[2]
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("'{}': {e}", parts[2]))?;
    let unit = parts.get(3).copied().unwrap_or("");
    ParameterRange::new(name.trim(), number(parts[0])?, number(parts[1])?, steps, unit)
        .map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = SweepConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Some(db) = &cli.database {
        config.storage.database_path = db.clone();
    }
    if let Err(e) = logging::init(&config.application) {
        eprintln!("{e}");
    }

    match cli.command {
        Command::Run(args) => run(&config, args).await,
        Command::Generate(args) => generate(args),
        Command::Plugins => plugins(&config),
        Command::Sequences => {
            let store = open_store(&config)?;
            for name in store.list_sequence_names().await? {
                println!("{name}");
            }
            Ok(())
        }
        Command::History { sequence, field } => {
            let store = open_store(&config)?;
            for entry in store.query_parameter_history(&sequence, &field).await? {
                println!(
                    "{}\t{}\t{}\t{} {}",
                    entry.timestamp.to_rfc3339(),
                    entry.point_name,
                    entry.plugin_name,
                    entry.value,
                    entry.unit
                );
            }
            Ok(())
        }
        Command::Export(args) => {
            let store = open_store(&config)?;
            let records = store.query_by_sequence(&args.sequence).await?;
            if records.is_empty() {
                bail!("no stored points for sequence '{}'", args.sequence);
            }
            export_to_path(&records, &args.out, args.format)?;
            println!(
                "exported {} points to {} ({})",
                records.len(),
                args.out.display(),
                args.format
            );
            Ok(())
        }
        Command::Delete { sequence } => {
            let store = open_store(&config)?;
            let removed = store.delete(&sequence).await?;
            println!("deleted {removed} points of '{sequence}'");
            Ok(())
        }
    }
}

fn open_store(config: &SweepConfig) -> anyhow::Result<SqliteResultStore> {
    SqliteResultStore::open(&config.storage.database_path).with_context(|| {
        format!(
            "opening result database {}",
            config.storage.database_path.display()
        )
    })
}

fn build_registry(config: &SweepConfig) -> anyhow::Result<PluginRegistry> {
    let registry =
        PluginRegistry::with_builtins().with_settings_dir(config.plugins.settings_dir.clone());
    let registered = registry.discover_and_register(&config.plugins.directory)?;
    info!(
        count = registered.len(),
        dir = %config.plugins.directory.display(),
        "Registered plugins from manifests"
    );
    Ok(registry)
}

fn plugins(config: &SweepConfig) -> anyhow::Result<()> {
    let registry = build_registry(config)?;
    for descriptor in registry.descriptors() {
        println!(
            "{:<24} {:<11} v{:<8} {}",
            descriptor.name,
            descriptor.kind.to_string(),
            descriptor.version,
            descriptor.description
        );
    }
    Ok(())
}

fn generate(args: GenerateArgs) -> anyhow::Result<()> {
    let mut sequence = SequenceDefinition::new(args.name, args.description);
    for range in args.ranges {
        sequence.add_parameter_range(range);
    }
    for name in &args.measurement_plugins {
        sequence = sequence.with_measurement_plugin(name);
    }
    for name in &args.processing_plugins {
        sequence = sequence.with_processing_plugin(name);
    }
    sequence.generate_points()?;
    sequence.save_to_file(&args.out)?;
    println!(
        "wrote {} points to {}",
        sequence.measurement_points().len(),
        args.out.display()
    );
    Ok(())
}

async fn run(config: &SweepConfig, args: RunArgs) -> anyhow::Result<()> {
    let sequence = SequenceDefinition::load_from_file(&args.sequence)
        .with_context(|| format!("loading sequence {}", args.sequence.display()))?;

    let mut engine_config = config.engine_config();
    if let Some(delay) = args.settle_delay {
        engine_config.settle_delay = delay;
    }
    info!(
        sequence = %sequence.name,
        points = sequence.measurement_points().len(),
        estimated = %humantime::format_duration(
            sequence.estimated_duration(engine_config.settle_delay)
        ),
        "Loaded sequence"
    );

    let registry = Arc::new(build_registry(config)?);
    let store = Arc::new(open_store(config)?);
    let engine = RunEngine::new(registry, store, engine_config);

    engine.on_progress(|p| {
        info!(
            current = p.current,
            total = p.total,
            percent = %format!("{:.1}", p.percentage),
            "Progress"
        );
        Ok(())
    });
    engine.on_error(|e| {
        warn!(error = %e, "Run failed");
        Ok(())
    });

    engine.start(sequence).await?;

    let wait = engine.wait();
    tokio::pin!(wait);
    let outcome = tokio::select! {
        outcome = &mut wait => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping after the current point");
            engine.stop();
            wait.await
        }
    };

    let Some(outcome) = outcome else {
        bail!("run worker terminated unexpectedly");
    };
    if let Some(path) = &args.save_results {
        save_results(&outcome.sequence, path)?;
    }
    if !outcome.unsaved_points.is_empty() {
        warn!(count = outcome.unsaved_points.len(), "Points were not persisted");
    }
    println!(
        "{}: {} ({} points)",
        outcome.sequence.name, outcome.state, outcome.points_executed
    );
    match (outcome.state, outcome.error) {
        (EngineState::Failed, Some(e)) => Err(e.into()),
        (EngineState::Failed, None) => bail!("run failed"),
        _ => Ok(()),
    }
}

fn save_results(sequence: &SequenceDefinition, path: &Path) -> anyhow::Result<()> {
    sequence.save_to_file(path)?;
    info!(path = %path.display(), "Saved sequence with results");
    Ok(())
}
