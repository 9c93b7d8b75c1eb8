// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! End-to-end measurement runs against the simulated bench

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rust_ddii_bench::config::{MeasurementConfig, MeasurementPlan};
use rust_ddii_bench::connection::{ConnectionManager, ConnectionMode, ConnectionSettings};
use rust_ddii_bench::measurement::{MeasurementRunner, RunnerState, MEASUREMENT_TASK};
use rust_ddii_bench::modbus::{SimulatedDevice, TransportHandle};
use rust_ddii_bench::source::SimulatedSource;
use rust_ddii_bench::supervisor::{SupervisorEvent, TaskOutcome, TaskSupervisor};
use rust_ddii_bench::BenchError;
use tempfile::tempdir;

const PLAN: &str = r#"
sweep:
  name: "Gate sweep 0-4 V"
  calibrate_mode: false
  measure_settings:
    linspace_mode: { vg_start: 0.0, vg_stop: 4.0, vg_step: 5, step_delay_s: 0.0 }
  current_limit: 0.001
  loop: false
  save_table: true
  save_plot: true
calibration:
  name: "ACQ1 calibration"
  calibrate_mode: true
  modbus_settings: { id: 14, bodrate: 115200, com: "/dev/ttyUSB0" }
  measure_settings:
    convince_mode: { vg_lst: [1.0, 2.0], step_delay_s: 0.0 }
    acq_channel: 1
  current_limit: 0.001
  loop: false
  save_table: true
  save_plot: false
"#;

struct Bench {
    runner: MeasurementRunner,
    supervisor: TaskSupervisor,
    connection: Arc<ConnectionManager>,
    device: SimulatedDevice,
    source: SimulatedSource,
}

async fn bench(output_dir: &Path) -> Bench {
    let device = SimulatedDevice::new(14);
    let source = SimulatedSource::new();
    let connection = Arc::new(ConnectionManager::new(ConnectionSettings::default()));
    assert!(
        connection
            .attach_transport(ConnectionMode::Serial, TransportHandle::new(device.clone()))
            .await
    );
    let supervisor = TaskSupervisor::new();
    let runner = MeasurementRunner::new(
        connection.clone(),
        supervisor.clone(),
        Arc::new(source.clone()),
        MeasurementConfig {
            output_dir: output_dir.to_path_buf(),
            ..MeasurementConfig::default()
        },
    );
    Bench {
        runner,
        supervisor,
        connection,
        device,
        source,
    }
}

fn single_run_dir(root: &Path) -> PathBuf {
    let dirs: Vec<PathBuf> = fs::read_dir(root)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(dirs.len(), 1, "expected one run directory");
    dirs.into_iter().next().unwrap()
}

#[tokio::test]
async fn test_plan_writes_one_table_per_process() {
    let root = tempdir().unwrap();
    let bench = bench(root.path()).await;
    let plan = MeasurementPlan::parse(PLAN).unwrap();

    let handle = bench.runner.start_plan(plan).unwrap();
    assert_eq!(handle.wait().await, TaskOutcome::Completed);
    assert!(!bench.supervisor.is_running(MEASUREMENT_TASK));

    let run = single_run_dir(root.path());
    let sweep = fs::read_to_string(run.join("Gate_sweep_0-4_V.csv")).unwrap();
    let voltages: Vec<&str> = sweep
        .lines()
        .skip(1)
        .map(|line| line.split(',').nth(5).unwrap())
        .collect();
    assert_eq!(
        voltages,
        vec!["0.000000", "1.000000", "2.000000", "3.000000", "4.000000"]
    );
    assert!(run.join("Gate_sweep_0-4_V.plot.json").exists());

    let calibration = fs::read_to_string(run.join("ACQ1_calibration.csv")).unwrap();
    let rows: Vec<&str> = calibration.lines().skip(1).collect();
    assert_eq!(rows.len(), 2);
    for row in rows {
        assert!(row.ends_with(",1000.0,modbus_peak,1"), "row {row}");
    }
    assert!(!run.join("ACQ1_calibration.plot.json").exists());

    // The attached link satisfied the process settings and stays open
    assert!(bench.connection.state().is_connected());
    assert!(!bench.source.is_output_on());
    assert!(!bench.device.is_measuring());
    assert_eq!(bench.runner.state(), RunnerState::Idle);
}

#[tokio::test]
async fn test_cancel_during_delay_leaves_output_off() {
    let root = tempdir().unwrap();
    let bench = bench(root.path()).await;
    let plan = MeasurementPlan::parse(
        r#"
slow:
  name: "slow"
  calibrate_mode: false
  measure_settings:
    convince_mode: { vg_lst: [1.0, 2.0, 3.0], step_delay_s: 60.0 }
  current_limit: 0.001
  loop: true
  save_table: true
  save_plot: true
"#,
    )
    .unwrap();

    bench.runner.start_plan(plan).unwrap();
    let mut states = bench.runner.watch_state();
    states
        .wait_for(|s| matches!(s, RunnerState::Running { .. }))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bench.source.is_output_on());

    let outcome = bench.supervisor.cancel_task(MEASUREMENT_TASK).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Cancelled);
    assert!(!bench.source.is_output_on());
    assert_eq!(bench.source.levels(), vec![1.0]);

    // The name is free again straight away
    assert!(!bench.supervisor.is_running(MEASUREMENT_TASK));
    assert!(matches!(
        bench.supervisor.cancel_task(MEASUREMENT_TASK).await,
        Err(BenchError::NoSuchTask(_))
    ));

    // Cancelled before the first sample: the table only holds its header
    let run = single_run_dir(root.path());
    let table = fs::read_to_string(run.join("slow.csv")).unwrap_or_default();
    assert!(table.lines().count() <= 1);
    assert!(run.join("slow.plot.json").exists());
}

#[tokio::test]
async fn test_second_measurement_is_rejected_while_running() {
    let root = tempdir().unwrap();
    let bench = bench(root.path()).await;
    let slow = r#"
slow:
  name: "slow"
  calibrate_mode: false
  measure_settings:
    const_mode: { vg_cnst: 1.0 }
  current_limit: 0.001
  loop: true
  save_table: false
  save_plot: false
"#;
    let mut events = bench.supervisor.subscribe();
    bench
        .runner
        .start_plan(MeasurementPlan::parse(slow).unwrap())
        .unwrap();
    let second = bench.runner.start_plan(MeasurementPlan::parse(slow).unwrap());
    assert!(matches!(second, Err(BenchError::DuplicateTask(_))));

    bench.supervisor.cancel_all().await;
    assert!(!bench.source.is_output_on());

    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        if let SupervisorEvent::TaskFinished { name, outcome } = event {
            finished = Some((name, outcome));
        }
    }
    assert_eq!(
        finished,
        Some((MEASUREMENT_TASK.to_string(), TaskOutcome::Cancelled))
    );
}

#[tokio::test]
async fn test_device_loss_fails_the_plan_and_switches_off() {
    let root = tempdir().unwrap();
    let bench = bench(root.path()).await;
    bench.device.set_reachable(14, false);
    let plan = MeasurementPlan::parse(PLAN).unwrap();

    let handle = bench.runner.start_plan(plan).unwrap();
    let outcome = handle.wait().await;
    assert!(matches!(outcome, TaskOutcome::Failed(_)), "{outcome:?}");
    assert!(!bench.source.is_output_on());
    assert_eq!(bench.runner.state(), RunnerState::Idle);
}
