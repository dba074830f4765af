//! End-to-end runs of the engine against scripted plugins and a real store.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use rust_sweep::engine::{
    ActiveRuns, EngineConfig, EngineEvent, EngineState, RunEngine, StorageFailurePolicy,
};
use rust_sweep::error::SweepError;
use rust_sweep::plugin::builtin::{Frame, CAMERA, IMAGE_PROCESSOR, STATISTICS};
use rust_sweep::plugin::PluginRegistry;
use rust_sweep::sequence::{ParameterRange, SequenceDefinition};
use rust_sweep::storage::{ResultStore, SqliteResultStore, StoredField};

use common::*;

fn sqlite() -> Arc<SqliteResultStore> {
    Arc::new(SqliteResultStore::open_in_memory().unwrap())
}

#[tokio::test]
async fn test_single_range_readings_are_stored_in_order() {
    let script = Script::doubling("temperature");
    let registry = registry(vec![ScriptedSensor::factory("Sensor", script.clone())]);
    let store = sqlite();
    let engine = engine_with(registry, store.clone(), fast_config());

    let mut sequence = SequenceDefinition::new("Scenario A", "").with_measurement_plugin("Sensor");
    sequence.add_parameter_range(ParameterRange::new("temperature", 20.0, 80.0, 4, "°C").unwrap());
    sequence.generate_points().unwrap();

    engine.start(sequence).await.unwrap();
    let outcome = engine.wait().await.unwrap();

    assert_eq!(outcome.state, EngineState::Completed);
    assert_eq!(outcome.points_executed, 4);
    assert!(outcome.error.is_none());
    assert!(outcome.sequence.measurement_points().iter().all(|p| p.is_recorded()));

    let records = store.query_by_sequence("Scenario A").await.unwrap();
    assert_eq!(readings(&records, "Sensor"), vec![40.0, 80.0, 120.0, 160.0]);
    assert_eq!(records[0].field("Sensor", "reading").unwrap().unit(), Some("a.u."));
    assert!(!script.tally.reentered.load(Ordering::SeqCst));
    assert_eq!(script.tally.cleaned_up(), 1);
}

#[tokio::test]
async fn test_two_ranges_run_first_range_slowest() {
    let registry = registry(vec![ScriptedSensor::factory("Sensor", Script::doubling("x"))]);
    let store = sqlite();
    let engine = engine_with(registry, store.clone(), fast_config());

    let mut sequence = SequenceDefinition::new("Scenario B", "").with_measurement_plugin("Sensor");
    sequence.add_parameter_range(ParameterRange::new("x", 0.0, 1.0, 2, "").unwrap());
    sequence.add_parameter_range(ParameterRange::new("y", 0.0, 1.0, 2, "").unwrap());
    sequence.generate_points().unwrap();

    engine.start(sequence).await.unwrap();
    assert_eq!(engine.wait().await.unwrap().state, EngineState::Completed);

    let combos: Vec<(f64, f64)> = store
        .query_by_sequence("Scenario B")
        .await
        .unwrap()
        .iter()
        .map(|r| (r.parameters["x"], r.parameters["y"]))
        .collect();
    assert_eq!(combos, vec![(0.0, 0.0), (0.0, 1.0), (1.0, 0.0), (1.0, 1.0)]);
}

#[tokio::test]
async fn test_measurement_failure_fails_the_run() {
    let script = Script::doubling("v").failing_on(3);
    let registry = registry(vec![ScriptedSensor::factory("Sensor", script.clone())]);
    let store = sqlite();
    let engine = engine_with(registry, store.clone(), fast_config());

    let errors = counter();
    let completions = counter();
    let e = errors.clone();
    engine.on_error(move |_| {
        e.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let c = completions.clone();
    engine.on_complete(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    engine.start(linear_sequence("Scenario C", "v", 5, "Sensor")).await.unwrap();
    let outcome = engine.wait().await.unwrap();

    assert_eq!(outcome.state, EngineState::Failed);
    assert_eq!(outcome.points_executed, 2);
    match outcome.error {
        Some(SweepError::Measurement { plugin, point, .. }) => {
            assert_eq!(plugin, "Sensor");
            assert_eq!(point, "Point_3");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(store.query_by_sequence("Scenario C").await.unwrap().len(), 2);
    assert_eq!(count(&errors), 1);
    assert_eq!(count(&completions), 0);
    assert_eq!(script.tally.measured(), 3);
    assert_eq!(script.tally.cleaned_up(), 1);
    assert_eq!(engine.state(), EngineState::Failed);
}

#[tokio::test]
async fn test_stop_between_points() {
    let script = Script::doubling("v");
    let registry = registry(vec![ScriptedSensor::factory("Sensor", script.clone())]);
    let store = sqlite();
    let engine = Arc::new(engine_with(registry, store.clone(), fast_config()));

    let handle: Weak<RunEngine> = Arc::downgrade(&engine);
    engine.on_point_complete(move |point| {
        if point.name == "Point_2" {
            if let Some(engine) = handle.upgrade() {
                assert!(engine.stop());
            }
        }
        Ok(())
    });

    engine.start(linear_sequence("Scenario D", "v", 5, "Sensor")).await.unwrap();
    let outcome = engine.wait().await.unwrap();

    assert_eq!(outcome.state, EngineState::Stopped);
    assert_eq!(outcome.points_executed, 2);
    assert_eq!(store.query_by_sequence("Scenario D").await.unwrap().len(), 2);
    assert_eq!(script.tally.measured(), 2);
    let unexecuted = &outcome.sequence.measurement_points()[2..];
    assert!(unexecuted.iter().all(|p| !p.is_recorded()));
}

#[tokio::test]
async fn test_pause_and_resume() {
    let script = Script::doubling("v");
    let registry = registry(vec![ScriptedSensor::factory("Sensor", script.clone())]);
    let engine = Arc::new(engine_with(registry, sqlite(), fast_config()));

    let handle = Arc::downgrade(&engine);
    engine.on_point_complete(move |point| {
        if point.name == "Point_1" {
            if let Some(engine) = handle.upgrade() {
                engine.pause();
            }
        }
        Ok(())
    });

    engine.start(linear_sequence("pausing", "v", 3, "Sensor")).await.unwrap();
    wait_for_state(&engine, EngineState::Paused).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(script.tally.measured(), 1);
    assert_eq!(engine.status().points_executed, 1);

    assert!(!engine.pause());
    assert!(engine.resume());
    let outcome = engine.wait().await.unwrap();
    assert_eq!(outcome.state, EngineState::Completed);
    assert_eq!(outcome.points_executed, 3);
}

#[tokio::test]
async fn test_stop_while_paused_never_resumes() {
    let script = Script::doubling("v");
    let registry = registry(vec![ScriptedSensor::factory("Sensor", script.clone())]);
    let engine = Arc::new(engine_with(registry, sqlite(), fast_config()));

    let handle = Arc::downgrade(&engine);
    engine.on_point_complete(move |_| {
        if let Some(engine) = handle.upgrade() {
            engine.pause();
        }
        Ok(())
    });

    engine.start(linear_sequence("paused stop", "v", 4, "Sensor")).await.unwrap();
    wait_for_state(&engine, EngineState::Paused).await;
    assert!(engine.stop());
    // A pending stop cannot be undone by resuming.
    assert!(!engine.resume());

    let outcome = engine.wait().await.unwrap();
    assert_eq!(outcome.state, EngineState::Stopped);
    assert_eq!(outcome.points_executed, 1);
    assert_eq!(script.tally.measured(), 1);
}

#[tokio::test]
async fn test_pause_after_stop_is_ignored() {
    let script = Script::doubling("v").slow(Duration::from_millis(50));
    let registry = registry(vec![ScriptedSensor::factory("Sensor", script.clone())]);
    let engine = engine_with(registry, sqlite(), fast_config());

    engine.start(linear_sequence("stop then pause", "v", 5, "Sensor")).await.unwrap();
    while script.tally.measured() == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(engine.stop());
    assert!(!engine.pause());
    assert!(!engine.resume());
    assert_ne!(engine.state(), EngineState::Paused);

    let outcome = engine.wait().await.unwrap();
    assert_eq!(outcome.state, EngineState::Stopped);
    assert_eq!(outcome.points_executed, 1);
    assert_eq!(script.tally.measured(), 1);
}

#[tokio::test]
async fn test_control_calls_outside_a_run_are_no_ops() {
    let registry = registry(vec![ScriptedSensor::factory("Sensor", Script::doubling("v"))]);
    let engine = engine_with(registry, sqlite(), fast_config());

    assert!(!engine.pause());
    assert!(!engine.resume());
    assert!(!engine.stop());
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(engine.wait().await.is_none());
}

#[tokio::test]
async fn test_start_while_running_is_rejected() {
    let script = Script::doubling("v").slow(Duration::from_millis(20));
    let registry = registry(vec![ScriptedSensor::factory("Sensor", script.clone())]);
    let engine = engine_with(registry, sqlite(), fast_config());

    engine.start(linear_sequence("long", "v", 5, "Sensor")).await.unwrap();
    let second = engine.start(linear_sequence("other", "v", 2, "Sensor")).await;
    assert!(matches!(second, Err(SweepError::AlreadyRunning)));

    engine.stop();
    let outcome = engine.wait().await.unwrap();
    assert_eq!(outcome.sequence.name, "long");
    assert!(!script.tally.reentered.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_engine_can_run_again_after_finishing() {
    let registry = registry(vec![ScriptedSensor::factory("Sensor", Script::doubling("v"))]);
    let store = sqlite();
    let engine = engine_with(registry, store.clone(), fast_config());

    engine.start(linear_sequence("first", "v", 2, "Sensor")).await.unwrap();
    wait_for_state(&engine, EngineState::Completed).await;
    // No wait() in between: start collects the finished worker itself.
    engine.start(linear_sequence("second", "v", 3, "Sensor")).await.unwrap();
    let outcome = engine.wait().await.unwrap();

    assert_eq!(outcome.sequence.name, "second");
    assert_eq!(outcome.state, EngineState::Completed);
    let names = store.list_sequence_names().await.unwrap();
    assert!(names.contains("first") && names.contains("second"));
}

#[tokio::test]
async fn test_invalid_sequences_are_rejected_at_start() {
    let registry = registry(vec![ScriptedSensor::factory("Sensor", Script::doubling("v"))]);
    let engine = engine_with(registry, sqlite(), fast_config());

    let unknown = linear_sequence("unknown", "v", 2, "Missing");
    assert!(matches!(
        engine.start(unknown).await,
        Err(SweepError::InvalidConfig(msg)) if msg.contains("Missing")
    ));

    let empty = SequenceDefinition::new("empty", "").with_measurement_plugin("Sensor");
    assert!(matches!(engine.start(empty).await, Err(SweepError::InvalidConfig(_))));

    let duplicate = linear_sequence("dup", "v", 2, "Sensor").with_measurement_plugin("Sensor");
    assert!(matches!(engine.start(duplicate).await, Err(SweepError::InvalidConfig(_))));

    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn test_initialize_failure_aborts_start() {
    let good = Script::doubling("v");
    let bad = Script::doubling("v").failing_initialize();
    let registry = registry(vec![
        ScriptedSensor::factory("Good", good.clone()),
        ScriptedSensor::factory("Bad", bad.clone()),
    ]);
    let engine = engine_with(registry, sqlite(), fast_config());

    let sequence = linear_sequence("init", "v", 2, "Good").with_measurement_plugin("Bad");
    match engine.start(sequence).await {
        Err(SweepError::PluginLifecycle { plugin, .. }) => assert_eq!(plugin, "Bad"),
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(good.tally.cleaned_up(), 1);
    assert_eq!(bad.tally.cleaned_up(), 1);
    assert_eq!(good.tally.measured(), 0);
}

#[tokio::test]
async fn test_plugin_panic_fails_the_run() {
    let script = Script::doubling("v").panicking_on(2);
    let registry = registry(vec![ScriptedSensor::factory("Sensor", script.clone())]);
    let store = sqlite();
    let engine = engine_with(registry, store.clone(), fast_config());

    engine.start(linear_sequence("panic", "v", 3, "Sensor")).await.unwrap();
    let outcome = engine.wait().await.unwrap();

    assert_eq!(outcome.state, EngineState::Failed);
    assert!(matches!(outcome.error, Some(SweepError::Panicked { ref point, .. }) if point == "Point_2"));
    assert_eq!(store.query_by_sequence("panic").await.unwrap().len(), 1);
    assert_eq!(script.tally.cleaned_up(), 1);
}

#[tokio::test]
async fn test_faulty_subscribers_do_not_affect_the_run() {
    let registry = registry(vec![ScriptedSensor::factory("Sensor", Script::doubling("v"))]);
    let engine = engine_with(registry, sqlite(), fast_config());

    let seen = counter();
    engine.on_point_complete(|_| anyhow::bail!("display disconnected"));
    engine.on_point_complete(|_| panic!("plot widget crashed"));
    let s = seen.clone();
    engine.on_point_complete(move |_| {
        s.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    engine.on_progress(|_| panic!("progress bar crashed"));

    engine.start(linear_sequence("subscribers", "v", 4, "Sensor")).await.unwrap();
    let outcome = engine.wait().await.unwrap();

    assert_eq!(outcome.state, EngineState::Completed);
    assert_eq!(count(&seen), 4);
}

#[tokio::test]
async fn test_event_order_on_broadcast_channel() {
    let registry = registry(vec![ScriptedSensor::factory("Sensor", Script::doubling("v"))]);
    let engine = engine_with(registry, sqlite(), fast_config());
    let mut rx = engine.subscribe();

    let progress = Arc::new(Mutex::new(Vec::new()));
    let p = progress.clone();
    engine.on_progress(move |update| {
        p.lock().push((update.current, update.total, update.percentage));
        Ok(())
    });

    engine.start(linear_sequence("events", "v", 2, "Sensor")).await.unwrap();
    engine.wait().await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(match event {
            EngineEvent::Started { total_points, .. } => format!("started:{total_points}"),
            EngineEvent::PointComplete(point) => format!("point:{}", point.name),
            EngineEvent::Progress(p) => format!("progress:{}", p.current),
            EngineEvent::Completed { .. } => "completed".to_string(),
            EngineEvent::Stopped { .. } => "stopped".to_string(),
            EngineEvent::Failed { .. } => "failed".to_string(),
        });
    }
    assert_eq!(
        kinds,
        vec![
            "started:2",
            "point:Point_1",
            "progress:1",
            "point:Point_2",
            "progress:2",
            "completed"
        ]
    );
    assert_eq!(*progress.lock(), vec![(1, 2, 50.0), (2, 2, 100.0)]);
}

#[tokio::test]
async fn test_processing_output_is_merged_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let registry = registry(vec![
        ScriptedSensor::factory("Sensor", Script::doubling("v")),
        Summer::factory("First", seen.clone()),
        Summer::factory("Second", seen.clone()),
    ]);
    let store = sqlite();
    let engine = engine_with(registry, store.clone(), fast_config());

    let sequence = linear_sequence("processing", "v", 1, "Sensor")
        .with_processing_plugin("First")
        .with_processing_plugin("Second");
    engine.start(sequence).await.unwrap();
    let outcome = engine.wait().await.unwrap();

    let point = &outcome.sequence.measurement_points()[0];
    assert!(point.plugin_results("First_processed").is_some());
    assert!(point.plugin_results("Second_processed").is_some());

    let inputs = seen.lock().clone();
    assert_eq!(inputs.len(), 2);
    assert!(!inputs[0].contains("First_processed"));
    assert!(inputs[1].contains("First_processed"));

    // reading = 2, First sums to 2, Second sees reading + First's sum.
    let records = store.query_by_sequence("processing").await.unwrap();
    assert_eq!(records[0].numeric("First_processed", "sum"), Some(2.0));
    assert_eq!(records[0].numeric("Second_processed", "sum"), Some(4.0));
}

#[tokio::test]
async fn test_builtin_statistics_run() {
    let registry = Arc::new(PluginRegistry::with_builtins());
    registry.register(ScriptedSensor::factory("Sensor", Script::doubling("v")));
    let store = sqlite();
    let engine = engine_with(registry, store.clone(), fast_config());

    let sequence = linear_sequence("stats", "v", 5, "Sensor").with_processing_plugin(STATISTICS);
    engine.start(sequence).await.unwrap();
    assert_eq!(engine.wait().await.unwrap().state, EngineState::Completed);

    let records = store.query_by_sequence("stats").await.unwrap();
    let key = format!("{STATISTICS}_processed");
    assert_eq!(records.len(), 5);
    assert!(records[4].numeric(&key, "Sensor.reading_mean").is_some());
}

#[tokio::test]
async fn test_camera_frames_are_stored_as_blobs() {
    let store = sqlite();
    let registry = Arc::new(PluginRegistry::with_builtins());
    let engine = engine_with(registry, store.clone(), fast_config());

    let mut sequence = SequenceDefinition::new("exposure series", "")
        .with_measurement_plugin(CAMERA)
        .with_processing_plugin(IMAGE_PROCESSOR);
    sequence.add_parameter_range(ParameterRange::new("exposure", 1.0, 2.0, 2, "ms").unwrap());
    sequence.generate_points().unwrap();

    engine.start(sequence).await.unwrap();
    let outcome = engine.wait().await.unwrap();
    assert_eq!(outcome.state, EngineState::Completed, "{:?}", outcome.error);

    let records = store.query_by_sequence("exposure series").await.unwrap();
    assert_eq!(records.len(), 2);
    let processed = format!("{IMAGE_PROCESSOR}_processed");
    for (record, exposure) in records.iter().zip([1.0, 2.0]) {
        let Some(StoredField::Blob(image)) = record.field(CAMERA, "image") else {
            panic!("no image blob in {:?}", field_names(record));
        };
        let frame = Frame::from_pgm(image).unwrap();
        assert_eq!((frame.width, frame.height), (640, 480));
        assert_eq!(record.numeric(CAMERA, "image_size_bytes"), Some(image.len() as f64));
        assert_eq!(record.numeric(CAMERA, "exposure_time"), Some(exposure));
        assert_eq!(record.field(CAMERA, "width").and_then(StoredField::unit), Some("px"));
        assert_eq!(
            record.field(CAMERA, "image_format"),
            Some(&StoredField::Text("PGM".into()))
        );
        assert_eq!(record.numeric(&processed, "image_width"), Some(640.0));
        assert!(record.numeric(&processed, "brightness_mean").is_some());
    }
}

#[tokio::test]
async fn test_nan_readings_are_persisted() {
    let store = sqlite();
    let registry = registry(vec![
        ScriptedSensor::factory("Sensor", Script::doubling("v").reporting(f64::NAN)),
        Summer::factory("Sum", Arc::new(Mutex::new(Vec::new()))),
    ]);
    let engine = engine_with(registry, store.clone(), fast_config());

    let sequence = linear_sequence("overloaded", "v", 2, "Sensor").with_processing_plugin("Sum");
    engine.start(sequence).await.unwrap();
    let outcome = engine.wait().await.unwrap();
    assert_eq!(outcome.state, EngineState::Completed, "{:?}", outcome.error);

    let records = store.query_by_sequence("overloaded").await.unwrap();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert!(record.numeric("Sensor", "reading").unwrap().is_nan());
        assert!(record.numeric("Sum_processed", "sum").unwrap().is_nan());
    }
}

#[tokio::test]
async fn test_storage_failure_aborts_by_default() {
    let store = Arc::new(FlakyStore::failing_calls(&[2]));
    let registry = registry(vec![ScriptedSensor::factory("Sensor", Script::doubling("v"))]);
    let engine = engine_with(registry, store.clone(), fast_config());

    engine.start(linear_sequence("abort", "v", 4, "Sensor")).await.unwrap();
    let outcome = engine.wait().await.unwrap();

    assert_eq!(outcome.state, EngineState::Failed);
    assert!(matches!(outcome.error, Some(SweepError::Storage(_))));
    assert_eq!(outcome.points_executed, 1);
    assert_eq!(store.query_by_sequence("abort").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_storage_failure_buffers_when_configured() {
    let store = Arc::new(FlakyStore::failing_calls(&[2]));
    let registry = registry(vec![ScriptedSensor::factory("Sensor", Script::doubling("v"))]);
    let config = EngineConfig {
        storage_failure: StorageFailurePolicy::Buffer,
        ..fast_config()
    };
    let engine = engine_with(registry, store.clone(), config);

    engine.start(linear_sequence("buffer", "v", 4, "Sensor")).await.unwrap();
    let outcome = engine.wait().await.unwrap();

    assert_eq!(outcome.state, EngineState::Completed);
    assert!(outcome.unsaved_points.is_empty());
    let records = store.query_by_sequence("buffer").await.unwrap();
    assert_eq!(readings(&records, "Sensor"), vec![2.0, 4.0, 6.0, 8.0]);
}

#[tokio::test]
async fn test_unsaved_points_are_reported() {
    let store = Arc::new(FlakyStore::new());
    store.failing.store(true, Ordering::SeqCst);
    let registry = registry(vec![ScriptedSensor::factory("Sensor", Script::doubling("v"))]);
    let config = EngineConfig {
        storage_failure: StorageFailurePolicy::Buffer,
        ..fast_config()
    };
    let engine = engine_with(registry, store.clone(), config);

    engine.start(linear_sequence("offline", "v", 3, "Sensor")).await.unwrap();
    let outcome = engine.wait().await.unwrap();

    assert_eq!(outcome.state, EngineState::Completed);
    let unsaved: Vec<&str> = outcome.unsaved_points.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(unsaved, vec!["Point_1", "Point_2", "Point_3"]);
}

#[tokio::test]
async fn test_same_sequence_cannot_run_on_two_engines() {
    let runs = ActiveRuns::new();
    let slow = Script::doubling("v").slow(Duration::from_millis(20));
    let first = engine_with(
        registry(vec![ScriptedSensor::factory("Sensor", slow)]),
        sqlite(),
        fast_config(),
    )
    .with_active_runs(runs.clone());
    let second = engine_with(
        registry(vec![ScriptedSensor::factory("Sensor", Script::doubling("v"))]),
        sqlite(),
        fast_config(),
    )
    .with_active_runs(runs.clone());

    first.start(linear_sequence("shared", "v", 5, "Sensor")).await.unwrap();
    assert!(runs.is_active("shared"));
    assert!(matches!(
        second.start(linear_sequence("shared", "v", 2, "Sensor")).await,
        Err(SweepError::InvalidConfig(_))
    ));
    second
        .start(linear_sequence("elsewhere", "v", 2, "Sensor"))
        .await
        .unwrap();

    first.stop();
    first.wait().await.unwrap();
    second.wait().await.unwrap();
    assert!(!runs.is_active("shared"));
}

#[tokio::test]
async fn test_settle_delay_is_applied() {
    let registry = registry(vec![ScriptedSensor::factory("Sensor", Script::doubling("v"))]);
    let config = EngineConfig {
        settle_delay: Duration::from_millis(30),
        ..EngineConfig::default()
    };
    let engine = engine_with(registry, sqlite(), config);

    let started = std::time::Instant::now();
    engine.start(linear_sequence("settle", "v", 3, "Sensor")).await.unwrap();
    engine.wait().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(90));
}
