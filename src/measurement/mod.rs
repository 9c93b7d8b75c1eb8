// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Measurement orchestration
//!
//! The [`MeasurementRunner`] drives the processes of a measurement plan
//! against the voltage source and the measurement module (MPP):
//!
//! 1. The source is prepared (DC volts, current limit, output on).
//! 2. When the MPP is reachable it is armed: a forced single-shot acquisition
//!    gives the baseline, the trigger level is set to its maximum plus a
//!    margin and the measurement is started.
//! 3. Each setpoint sets the source level, waits, and reads back either the
//!    MPP peak register (calibration mode) or the source current.
//! 4. The pass is repeated while the process loops.
//!
//! Whatever the outcome, the same shutdown path runs before the runner
//! returns to [`RunnerState::Idle`]: the plot series is saved if requested,
//! the MPP measurement is stopped and the source output is switched off.
//!
//! Runs are started through the [`TaskSupervisor`] under a single task name,
//! so only one measurement (plan or pulse train) can be active at a time.

pub mod pulse;
pub mod results;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config::{MeasurementConfig, MeasurementPlan, ModbusSettings, ProcessDefinition};
use crate::connection::ConnectionManager;
use crate::error::{BenchError, BenchResult};
use crate::modbus::commands::or_sentinel;
use crate::modbus::MppCommands;
use crate::sequencer::Setpoint;
use crate::source::SourceDriver;
use crate::supervisor::{TaskHandle, TaskSupervisor};

pub use pulse::{PulseCount, PulseTrain};
pub use results::{
    create_run_directory, sanitize_filename, timestamp_now, PlotSeries, ResultRow, ResultTable,
    ValueKind,
};

/// Supervisor name of the active measurement
pub const MEASUREMENT_TASK: &str = "measurement";

/// Lifecycle of the runner
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerState {
    Idle,
    Preparing {
        process: String,
    },
    Running {
        process: String,
        cycle: u64,
        step: u64,
    },
    /// A run failed; the shutdown path is running
    Faulted(String),
}

/// Published while a run progresses
#[derive(Debug, Clone)]
pub enum MeasurementEvent {
    ProcessStarted { key: String, name: String },
    Sample(ResultRow),
    /// Oscilloscope samples read after a pulse
    Waveform { channel: u8, samples: Vec<u16> },
    ProcessFinished { key: String, rows: usize },
}

/// Summary of one finished process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessReport {
    pub key: String,
    pub rows: usize,
    pub cycles: u64,
    pub table: Option<PathBuf>,
    pub plot: Option<PathBuf>,
}

struct RunnerInner {
    connection: Arc<ConnectionManager>,
    supervisor: TaskSupervisor,
    source: Arc<dyn SourceDriver>,
    config: MeasurementConfig,
    state_tx: watch::Sender<RunnerState>,
    events: broadcast::Sender<MeasurementEvent>,
    /// Set when a process opened its own serial link
    opened_link: AtomicBool,
}

/// Measurement orchestrator
///
/// Cheap to clone; clones share the same state and channels.
#[derive(Clone)]
pub struct MeasurementRunner {
    inner: Arc<RunnerInner>,
}

/// Resources of a process that the shutdown path must see
struct ProcessRun {
    table: Option<ResultTable>,
    plot: PlotSeries,
    armed: Option<MppCommands>,
    rows: usize,
    cycles: u64,
}

impl MeasurementRunner {
    pub fn new(
        connection: Arc<ConnectionManager>,
        supervisor: TaskSupervisor,
        source: Arc<dyn SourceDriver>,
        config: MeasurementConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(RunnerState::Idle);
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RunnerInner {
                connection,
                supervisor,
                source,
                config,
                state_tx,
                events,
                opened_link: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> RunnerState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<RunnerState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeasurementEvent> {
        self.inner.events.subscribe()
    }

    pub fn source(&self) -> &Arc<dyn SourceDriver> {
        &self.inner.source
    }

    pub fn config(&self) -> &MeasurementConfig {
        &self.inner.config
    }

    fn set_state(&self, state: RunnerState) {
        self.inner.state_tx.send_replace(state);
    }

    fn emit(&self, event: MeasurementEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Run `plan` as the supervised measurement task
    ///
    /// ### Errors
    ///
    /// `DuplicateTask` when a measurement is already running.
    pub fn start_plan(&self, plan: MeasurementPlan) -> BenchResult<TaskHandle> {
        let runner = self.clone();
        self.inner
            .supervisor
            .create_task(MEASUREMENT_TASK, move |cancel| async move {
                let reports = runner.run_plan(&plan, &cancel).await?;
                let rows: usize = reports.iter().map(|r| r.rows).sum();
                info!("Plan finished: {} processes, {} rows", reports.len(), rows);
                Ok(())
            })
    }

    /// Run every process of `plan` in document order
    ///
    /// Results land in a fresh timestamped directory under the configured
    /// output directory. The first failing process stops the plan. The
    /// source output is off when this returns, whatever the outcome.
    pub(crate) async fn run_plan(
        &self,
        plan: &MeasurementPlan,
        cancel: &CancellationToken,
    ) -> BenchResult<Vec<ProcessReport>> {
        if plan.is_empty() {
            return Err(BenchError::Config("Measure process list is empty".to_string()));
        }
        if !self.inner.source.is_connected() {
            return Err(BenchError::DeviceNotReady(format!(
                "voltage source {} is not connected",
                self.inner.source.describe()
            )));
        }

        let dir = create_run_directory(&self.inner.config.output_dir)?;
        info!("Measure output dir: {}", dir.display());

        let mut reports = Vec::with_capacity(plan.len());
        let mut result = Ok(());
        for (key, definition) in plan.iter() {
            match self.run_process(key, definition, &dir, cancel).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        self.switch_output_off().await;
        if self.inner.opened_link.swap(false, Ordering::SeqCst) {
            debug!("Closing the link opened for the plan");
            self.inner.connection.disconnect().await;
        }
        result.map(|_| reports)
    }

    /// Drive one process end to end
    ///
    /// The mode is checked before any hardware is touched. The shutdown path
    /// runs on success, failure and cancellation alike.
    pub(crate) async fn run_process(
        &self,
        key: &str,
        definition: &ProcessDefinition,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> BenchResult<ProcessReport> {
        definition.validate()?;

        info!(
            "Process started: {} ({}), {} mode",
            key,
            definition.name,
            definition.measure_settings.mode()?.tag()
        );
        self.set_state(RunnerState::Preparing {
            process: key.to_string(),
        });
        self.emit(MeasurementEvent::ProcessStarted {
            key: key.to_string(),
            name: definition.name.clone(),
        });

        let stem = sanitize_filename(&definition.name);
        let mut run = ProcessRun {
            table: None,
            plot: PlotSeries::new(key, &format!("{}: {}", key, definition.name)),
            armed: None,
            rows: 0,
            cycles: 0,
        };

        let result = self
            .process_body(key, definition, output_dir, &stem, cancel, &mut run)
            .await;

        match &result {
            Err(BenchError::Cancelled) => info!("Process {key} cancelled"),
            Err(e) => {
                error!("Process {key} failed: {e}");
                self.set_state(RunnerState::Faulted(e.to_string()));
            }
            Ok(()) => {}
        }

        let plot_path = if definition.save_plot {
            let path = output_dir.join(format!("{stem}.plot.json"));
            match run.plot.save(&path) {
                Ok(()) => {
                    info!("Saved plot: {}", path.display());
                    Some(path)
                }
                Err(e) => {
                    warn!("Could not save plot {}: {e}", path.display());
                    None
                }
            }
        } else {
            None
        };
        if let Some(mpp) = run.armed.take() {
            or_sentinel("stop measure", mpp.stop_measure().await, ());
        }
        self.switch_output_off().await;

        let table = run.table.take().map(|t| {
            info!("Saved table: {}", t.path().display());
            t.path().to_path_buf()
        });
        self.emit(MeasurementEvent::ProcessFinished {
            key: key.to_string(),
            rows: run.rows,
        });
        self.set_state(RunnerState::Idle);
        info!("Process finished: {} ({})", key, definition.name);

        result.map(|()| ProcessReport {
            key: key.to_string(),
            rows: run.rows,
            cycles: run.cycles,
            table,
            plot: plot_path,
        })
    }

    async fn process_body(
        &self,
        key: &str,
        definition: &ProcessDefinition,
        output_dir: &Path,
        stem: &str,
        cancel: &CancellationToken,
        run: &mut ProcessRun,
    ) -> BenchResult<()> {
        let mode = definition.measure_settings.mode()?;
        let acq_channel = definition.measure_settings.acq_channel;

        let mpp = self.process_mpp(definition).await?;
        checkpoint(cancel)?;
        self.inner.source.prepare(definition.current_limit).await?;

        if let Some(mpp) = &mpp {
            self.arm(mpp, acq_channel.saturating_sub(1)).await;
            run.armed = Some(mpp.clone());
        }

        if definition.save_table {
            run.table = Some(ResultTable::create(
                output_dir.join(format!("{stem}.csv")),
            )?);
        }

        let value_kind = if definition.calibrate_mode {
            ValueKind::ModbusPeak
        } else {
            ValueKind::KeithleyCurrentA
        };
        let mut step = 0u64;
        loop {
            for point in mode.setpoints() {
                checkpoint(cancel)?;
                self.set_state(RunnerState::Running {
                    process: key.to_string(),
                    cycle: run.cycles,
                    step,
                });

                let value = match (&mpp, value_kind) {
                    (Some(mpp), ValueKind::ModbusPeak) => {
                        self.calibration_point(mpp, acq_channel, point, cancel)
                            .await?
                    }
                    _ => self.current_point(point, cancel).await?,
                };

                let row = ResultRow {
                    timestamp: timestamp_now(),
                    process_key: key.to_string(),
                    process_name: definition.name.clone(),
                    cycle: run.cycles,
                    step,
                    voltage_v: point.voltage,
                    value,
                    mode: value_kind,
                    acq_channel,
                };
                if let Some(table) = run.table.as_mut() {
                    table.append(&row)?;
                }
                run.plot.push(&row);
                run.rows += 1;
                self.emit(MeasurementEvent::Sample(row));
                step += 1;
            }

            run.cycles += 1;
            if !definition.repeat {
                break;
            }
        }
        Ok(())
    }

    /// MPP used by a process
    ///
    /// A process carrying its own serial settings gets a link that matches
    /// them, reusing the open one when it does. A calibration process
    /// without settings needs the live connection. Direct processes use the
    /// MPP only when one is connected.
    async fn process_mpp(&self, definition: &ProcessDefinition) -> BenchResult<Option<MppCommands>> {
        if let Some(settings) = &definition.modbus_settings {
            return self.mpp_for_settings(settings).await.map(Some);
        }
        match self.inner.connection.mpp().await {
            Ok(mpp) => Ok(Some(mpp)),
            Err(_) if definition.calibrate_mode => Err(BenchError::Config(
                "calibrate_mode needs modbus_settings or a live connection".to_string(),
            )),
            Err(_) => Ok(None),
        }
    }

    async fn mpp_for_settings(&self, settings: &ModbusSettings) -> BenchResult<MppCommands> {
        let connection = &self.inner.connection;
        let reusable = connection.fingerprint().await.is_some_and(|fp| {
            fp.satisfies_serial(&settings.com, settings.baud_rate, settings.timeout_ms())
        });

        if !reusable {
            let timeout = Duration::from_millis(settings.timeout_ms());
            if !connection
                .connect_serial_with_timeout(&settings.com, settings.baud_rate, timeout)
                .await
            {
                return Err(connection.last_error().await.unwrap_or_else(|| {
                    BenchError::DeviceNotReady("Modbus client is not connected".to_string())
                }));
            }
            self.inner.opened_link.store(true, Ordering::SeqCst);
        }

        let transport = connection
            .transport()
            .await
            .ok_or_else(|| BenchError::DeviceNotReady("Modbus client is not connected".to_string()))?;
        Ok(MppCommands::new(transport, settings.id)
            .with_wire_trace(connection.settings().wire_trace))
    }

    /// Trigger level from a forced acquisition on `channel`
    ///
    /// Highest sample plus the configured margin, or 0 when the acquisition
    /// cannot be read.
    pub async fn reference_level(&self, mpp: &MppCommands, channel: u8) -> u16 {
        let samples = async {
            mpp.start_measure_forced(channel).await?;
            mpp.read_oscill(channel, self.inner.config.oscill_samples).await
        }
        .await;
        match samples {
            Ok(samples) => samples
                .into_iter()
                .max()
                .unwrap_or(0)
                .saturating_add(self.inner.config.reference_margin),
            Err(e) => {
                warn!("Reference level unavailable: {e}");
                0
            }
        }
    }

    /// Set the trigger level and start the measurement
    async fn arm(&self, mpp: &MppCommands, channel: u8) {
        let level = self.reference_level(mpp, channel).await;
        debug!("MPP trigger level {level}");
        or_sentinel("set level", mpp.set_level(level).await, ());
        or_sentinel("start measure", mpp.start_measure().await, ());
    }

    async fn calibration_point(
        &self,
        mpp: &MppCommands,
        acq_channel: u8,
        point: Setpoint,
        cancel: &CancellationToken,
    ) -> BenchResult<f64> {
        self.apply_level(point.voltage).await?;
        pause(cancel, point.delay()).await?;
        mpp.start_measure_forced(acq_channel.saturating_sub(1)).await?;
        Ok(f64::from(mpp.read_acq_peak(acq_channel).await?))
    }

    async fn current_point(&self, point: Setpoint, cancel: &CancellationToken) -> BenchResult<f64> {
        self.apply_level(point.voltage).await?;
        pause(cancel, point.delay()).await?;
        self.inner.source.measure_current().await
    }

    async fn apply_level(&self, volts: f64) -> BenchResult<()> {
        self.inner.source.set_level(volts).await?;
        debug!("Source level set: {volts:.6} V");
        Ok(())
    }

    async fn switch_output_off(&self) {
        if let Err(e) = self.inner.source.output_off().await {
            warn!("Source output off error: {e}");
        }
    }
}

/// Fail with `Cancelled` once cancellation was requested
fn checkpoint(cancel: &CancellationToken) -> BenchResult<()> {
    if cancel.is_cancelled() {
        Err(BenchError::Cancelled)
    } else {
        Ok(())
    }
}

/// Wait `duration`, or until cancellation
async fn pause(cancel: &CancellationToken, duration: Duration) -> BenchResult<()> {
    if duration.is_zero() {
        tokio::task::yield_now().await;
        return checkpoint(cancel);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(BenchError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
