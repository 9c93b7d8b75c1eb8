// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Pulse-train mode
//!
//! The source is toggled between the amplitude and 0 V. After each pulse the
//! MPP waveform is released and the oscilloscope channel is read back and
//! published as a [`MeasurementEvent::Waveform`].

use std::time::Duration;

use log::{debug, info};
use tokio_util::sync::CancellationToken;

use super::{pause, MeasurementEvent, MeasurementRunner, RunnerState, MEASUREMENT_TASK};
use crate::error::{BenchError, BenchResult};
use crate::modbus::commands::or_sentinel;
use crate::modbus::MppCommands;
use crate::supervisor::TaskHandle;

/// How many pulses to emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseCount {
    Finite(u32),
    /// Until cancelled
    Continuous,
    /// Hold the amplitude until cancelled, then read once
    Constant,
}

impl PulseCount {
    /// A zero count without the continuous flag means a constant level
    pub fn from_count(count: u32, continuous: bool) -> Self {
        match (continuous, count) {
            (true, _) => PulseCount::Continuous,
            (false, 0) => PulseCount::Constant,
            (false, n) => PulseCount::Finite(n),
        }
    }
}

/// Pulse-train parameters
#[derive(Debug, Clone, PartialEq)]
pub struct PulseTrain {
    /// Pulse amplitude in volts
    pub amplitude_v: f64,
    pub duration: Duration,
    pub period: Duration,
    pub count: PulseCount,
    /// Source current limit in amperes
    pub current_limit: f64,
}

impl PulseTrain {
    /// Time spent at 0 V in each period
    pub fn low_time(&self) -> Duration {
        self.period.saturating_sub(self.duration)
    }
}

impl MeasurementRunner {
    /// Run `train` as the supervised measurement task
    pub fn start_pulse_train(&self, train: PulseTrain) -> BenchResult<TaskHandle> {
        let runner = self.clone();
        self.inner
            .supervisor
            .create_task(MEASUREMENT_TASK, move |cancel| async move {
                let pulses = runner.run_pulse_train(&train, &cancel).await?;
                info!("Pulse train finished after {pulses} pulses");
                Ok(())
            })
    }

    /// Emit the pulse train and return the number of pulses emitted
    ///
    /// The MPP must be connected. The source output is off and the MPP
    /// measurement stopped when this returns.
    pub(crate) async fn run_pulse_train(
        &self,
        train: &PulseTrain,
        cancel: &CancellationToken,
    ) -> BenchResult<u64> {
        let mpp = self.inner.connection.mpp().await?;
        let mut done = 0u64;

        self.set_state(RunnerState::Preparing {
            process: "pulse".to_string(),
        });
        let result = self.pulse_body(&mpp, train, cancel, &mut done).await;

        if let Err(e) = &result {
            if !matches!(e, BenchError::Cancelled) {
                self.set_state(RunnerState::Faulted(e.to_string()));
            }
        }
        or_sentinel("stop measure", mpp.stop_measure().await, ());
        self.switch_output_off().await;
        self.set_state(RunnerState::Idle);

        result.map(|()| done)
    }

    async fn pulse_body(
        &self,
        mpp: &MppCommands,
        train: &PulseTrain,
        cancel: &CancellationToken,
        done: &mut u64,
    ) -> BenchResult<()> {
        let channel = self.inner.config.oscill_channel;
        self.inner.source.prepare(train.current_limit).await?;
        self.arm(mpp, channel).await;

        match train.count {
            PulseCount::Constant => {
                info!("Constant level {} V", train.amplitude_v);
                self.apply_level(train.amplitude_v).await?;
                self.set_state(RunnerState::Running {
                    process: "pulse".to_string(),
                    cycle: 0,
                    step: 0,
                });
                cancel.cancelled().await;
                self.read_waveform(mpp, channel).await;
                Ok(())
            }
            PulseCount::Continuous | PulseCount::Finite(_) => {
                info!(
                    "Pulses U1={} V, dur={:?}, T={:?}, count={:?}",
                    train.amplitude_v, train.duration, train.period, train.count
                );
                let low = train.low_time();
                loop {
                    if let PulseCount::Finite(n) = train.count {
                        if *done >= u64::from(n) {
                            break;
                        }
                    }
                    self.set_state(RunnerState::Running {
                        process: "pulse".to_string(),
                        cycle: 0,
                        step: *done,
                    });
                    self.apply_level(train.amplitude_v).await?;
                    pause(cancel, train.duration).await?;
                    self.apply_level(0.0).await?;
                    pause(cancel, low).await?;
                    *done += 1;
                    self.read_waveform(mpp, channel).await;
                }
                Ok(())
            }
        }
    }

    async fn read_waveform(&self, mpp: &MppCommands, channel: u8) {
        or_sentinel("waveform release", mpp.waveform_release().await, ());
        let samples = or_sentinel(
            "read oscilloscope",
            mpp.read_oscill(channel, self.inner.config.oscill_samples)
                .await,
            Vec::new(),
        );
        if samples.is_empty() {
            return;
        }
        debug!("Waveform channel {channel}: {} samples", samples.len());
        self.emit(MeasurementEvent::Waveform { channel, samples });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::MeasurementConfig;
    use crate::connection::{ConnectionManager, ConnectionMode, ConnectionSettings};
    use crate::modbus::registers::{CommandPayload, MppRegister};
    use crate::modbus::{SimulatedDevice, TransportHandle};
    use crate::source::SimulatedSource;
    use crate::supervisor::TaskSupervisor;

    fn train(count: PulseCount) -> PulseTrain {
        PulseTrain {
            amplitude_v: 5.0,
            duration: Duration::from_millis(1),
            period: Duration::from_millis(3),
            count,
            current_limit: 0.01,
        }
    }

    async fn setup() -> (MeasurementRunner, SimulatedDevice, SimulatedSource) {
        let device = SimulatedDevice::new(14);
        let source = SimulatedSource::new();
        let connection = Arc::new(ConnectionManager::new(ConnectionSettings::default()));
        assert!(
            connection
                .attach_transport(ConnectionMode::Serial, TransportHandle::new(device.clone()))
                .await
        );
        let runner = MeasurementRunner::new(
            connection,
            TaskSupervisor::new(),
            Arc::new(source.clone()),
            MeasurementConfig::default(),
        );
        (runner, device, source)
    }

    #[test]
    fn test_pulse_count_from_count() {
        assert_eq!(PulseCount::from_count(3, false), PulseCount::Finite(3));
        assert_eq!(PulseCount::from_count(0, false), PulseCount::Constant);
        assert_eq!(PulseCount::from_count(0, true), PulseCount::Continuous);
        assert_eq!(PulseCount::from_count(7, true), PulseCount::Continuous);
    }

    #[test]
    fn test_low_time_never_negative() {
        let mut t = train(PulseCount::Finite(1));
        assert_eq!(t.low_time(), Duration::from_millis(2));
        t.period = Duration::ZERO;
        assert_eq!(t.low_time(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_finite_train_reads_one_waveform_per_pulse() {
        let (runner, device, source) = setup().await;
        let mut events = runner.subscribe();

        let pulses = runner
            .run_pulse_train(&train(PulseCount::Finite(3)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(pulses, 3);
        assert_eq!(source.levels(), vec![5.0, 0.0, 5.0, 0.0, 5.0, 0.0]);
        assert!(!source.is_output_on());
        assert!(!device.is_measuring());

        let mut waveforms = 0;
        while let Ok(event) = events.try_recv() {
            if let MeasurementEvent::Waveform { channel, samples } = event {
                assert_eq!(channel, 0);
                assert_eq!(samples.len(), 256);
                waveforms += 1;
            }
        }
        assert_eq!(waveforms, 3);

        let releases = device
            .writes()
            .iter()
            .filter(|w| {
                w.address == MppRegister::Command.address()
                    && CommandPayload::from_words(&w.words) == Ok(CommandPayload::WaveformRelease)
            })
            .count();
        assert_eq!(releases, 3);
    }

    #[tokio::test]
    async fn test_constant_level_reads_once_after_cancel() {
        let (runner, _device, source) = setup().await;
        let mut events = runner.subscribe();
        let handle = runner
            .start_pulse_train(train(PulseCount::Constant))
            .unwrap();

        let mut states = runner.watch_state();
        states
            .wait_for(|s| matches!(s, RunnerState::Running { .. }))
            .await
            .unwrap();
        handle.cancel();
        handle.wait().await;

        assert_eq!(source.levels(), vec![5.0]);
        assert!(!source.is_output_on());
        let mut waveforms = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, MeasurementEvent::Waveform { .. }) {
                waveforms += 1;
            }
        }
        assert_eq!(waveforms, 1);
    }

    #[tokio::test]
    async fn test_continuous_train_stops_on_cancel() {
        let (runner, _device, source) = setup().await;
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let result = runner
            .run_pulse_train(&train(PulseCount::Continuous), &cancel)
            .await;
        assert_eq!(result, Err(BenchError::Cancelled));
        assert!(!source.is_output_on());
        assert_eq!(runner.state(), RunnerState::Idle);
    }

    #[tokio::test]
    async fn test_pulse_train_needs_the_mpp() {
        let source = SimulatedSource::new();
        let runner = MeasurementRunner::new(
            Arc::new(ConnectionManager::new(ConnectionSettings::default())),
            TaskSupervisor::new(),
            Arc::new(source.clone()),
            MeasurementConfig::default(),
        );
        let result = runner
            .run_pulse_train(&train(PulseCount::Finite(1)), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(BenchError::DeviceNotReady(_))));
        assert!(source.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pulse_train_shares_the_measurement_slot() {
        let (runner, _device, source) = setup().await;
        let supervisor = runner.inner.supervisor.clone();

        runner
            .start_pulse_train(train(PulseCount::Continuous))
            .unwrap();
        let second = runner.start_pulse_train(train(PulseCount::Finite(1)));
        assert!(matches!(second, Err(BenchError::DuplicateTask(_))));
        let plan = crate::config::MeasurementPlan::parse(
            r#"
p1:
  name: "p1"
  calibrate_mode: false
  measure_settings:
    const_mode: { vg_cnst: 1.0 }
  current_limit: 0.001
  loop: false
  save_table: false
  save_plot: false
"#,
        )
        .unwrap();
        assert!(matches!(
            runner.start_plan(plan),
            Err(BenchError::DuplicateTask(_))
        ));

        let outcome = supervisor.cancel_task(MEASUREMENT_TASK).await.unwrap();
        assert_eq!(outcome, crate::supervisor::TaskOutcome::Cancelled);
        assert!(!source.is_output_on());
    }
}
