// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! In-memory DDII device
//!
//! `SimulatedDevice` answers Modbus requests for the control module (unit 1)
//! and one measurement module from sparse register banks. It reacts to the
//! command register the way the hardware does for the commands the bench
//! uses: a forced start fills the selected oscilloscope channel with a
//! triangular pulse and latches its amplitude into the matching peak register.
//!
//! It backs the `--simulate` mode and the test suite.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::debug;

use crate::error::{BenchError, BenchResult};
use crate::modbus::registers::{CommandPayload, MppRegister, CM_UNIT_ID};
use crate::modbus::transport::ModbusTransport;

/// Default amplitude of the simulated pulse
pub const DEFAULT_PULSE_AMPLITUDE: u16 = 1000;
/// Samples per oscilloscope channel
const OSCILL_SAMPLES: u16 = 256;
/// Most recent writes kept in the write log
pub const WRITE_LOG_CAPACITY: usize = 4096;

/// One write seen by the simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub unit: u8,
    pub address: u16,
    pub words: Vec<u16>,
}

#[derive(Debug, Default)]
struct Bank {
    registers: HashMap<u16, u16>,
    reachable: bool,
}

#[derive(Debug)]
struct DeviceState {
    banks: HashMap<u8, Bank>,
    writes: VecDeque<WriteRecord>,
    pulse_amplitude: u16,
    measuring: bool,
}

/// Simulated control module plus measurement module
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    mpp_unit: u8,
    state: Arc<Mutex<DeviceState>>,
    reads: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl SimulatedDevice {
    pub fn new(mpp_unit: u8) -> Self {
        let mut banks = HashMap::new();
        for unit in [CM_UNIT_ID, mpp_unit] {
            banks.insert(
                unit,
                Bank {
                    registers: HashMap::new(),
                    reachable: true,
                },
            );
        }
        Self {
            mpp_unit,
            state: Arc::new(Mutex::new(DeviceState {
                banks,
                writes: VecDeque::with_capacity(64),
                pulse_amplitude: DEFAULT_PULSE_AMPLITUDE,
                measuring: false,
            })),
            reads: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mpp_unit(&self) -> u8 {
        self.mpp_unit
    }

    /// Make a unit answer (or time out)
    pub fn set_reachable(&self, unit: u8, reachable: bool) {
        let mut state = self.lock();
        state.banks.entry(unit).or_default().reachable = reachable;
    }

    /// Preload registers of `unit`
    pub fn set_registers(&self, unit: u8, address: u16, values: &[u16]) {
        let mut state = self.lock();
        let bank = state.banks.entry(unit).or_default();
        for (i, value) in values.iter().enumerate() {
            bank.registers.insert(address.wrapping_add(i as u16), *value);
        }
    }

    /// Current content of `count` registers of `unit`
    pub fn registers(&self, unit: u8, address: u16, count: u16) -> Vec<u16> {
        let state = self.lock();
        match state.banks.get(&unit) {
            Some(bank) => read_bank(bank, address, count),
            None => vec![0; count as usize],
        }
    }

    /// Amplitude of the pulse produced by the next forced start
    pub fn set_pulse_amplitude(&self, amplitude: u16) {
        self.lock().pulse_amplitude = amplitude;
    }

    pub fn is_measuring(&self) -> bool {
        self.lock().measuring
    }

    /// Writes received so far, in order, up to the last [`WRITE_LOG_CAPACITY`]
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.iter().cloned().collect()
    }

    /// Number of read requests served
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of times the device was closed by its owner
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

fn read_bank(bank: &Bank, address: u16, count: u16) -> Vec<u16> {
    (0..count)
        .map(|i| {
            bank.registers
                .get(&address.wrapping_add(i))
                .copied()
                .unwrap_or(0)
        })
        .collect()
}

/// Triangular pulse peaking at `amplitude` in the middle of the window
fn pulse_waveform(amplitude: u16) -> Vec<u16> {
    let half = (OSCILL_SAMPLES / 2 - 1) as u32;
    (0..OSCILL_SAMPLES as u32)
        .map(|i| {
            let distance = if i <= half { i } else { 2 * half + 1 - i };
            (amplitude as u32 * distance / half) as u16
        })
        .collect()
}

fn apply_command(state: &mut DeviceState, unit: u8, payload: CommandPayload) {
    let amplitude = state.pulse_amplitude;
    let Some(bank) = state.banks.get_mut(&unit) else {
        return;
    };
    match payload {
        CommandPayload::StartMeasure => state.measuring = true,
        CommandPayload::StopMeasure => state.measuring = false,
        CommandPayload::SetLevel(level) => {
            bank.registers.insert(MppRegister::Level.address(), level);
        }
        CommandPayload::StartMeasureForced { channel } => {
            let base = MppRegister::oscill(channel).address();
            for (i, sample) in pulse_waveform(amplitude).into_iter().enumerate() {
                bank.registers.insert(base.wrapping_add(i as u16), sample);
            }
            let peak = MppRegister::acq_peak(channel + 1).address();
            bank.registers.insert(peak, amplitude);
        }
        CommandPayload::TrigCountClear => {
            bank.registers.insert(MppRegister::TempCount.address(), 0);
        }
        CommandPayload::SetHh | CommandPayload::WaveformRelease | CommandPayload::FilterBypass => {}
    }
}

#[async_trait]
impl ModbusTransport for SimulatedDevice {
    async fn read_holding_registers(&self, unit: u8, address: u16, count: u16)
        -> BenchResult<Vec<u16>> {
        let state = self.lock();
        let bank = state
            .banks
            .get(&unit)
            .filter(|b| b.reachable)
            .ok_or(BenchError::Timeout(0))?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(read_bank(bank, address, count))
    }

    async fn write_multiple_registers(&self, unit: u8, address: u16, words: &[u16])
        -> BenchResult<()> {
        let mut state = self.lock();
        let bank = state
            .banks
            .get_mut(&unit)
            .filter(|b| b.reachable)
            .ok_or(BenchError::Timeout(0))?;
        for (i, word) in words.iter().enumerate() {
            bank.registers.insert(address.wrapping_add(i as u16), *word);
        }
        if state.writes.len() == WRITE_LOG_CAPACITY {
            state.writes.pop_front();
        }
        state.writes.push_back(WriteRecord {
            unit,
            address,
            words: words.to_vec(),
        });

        if unit == self.mpp_unit && address == MppRegister::Command.address() {
            if let Ok(payload) = CommandPayload::from_words(words) {
                debug!("Simulated MPP executes {payload:?}");
                apply_command(&mut state, unit, payload);
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        format!("simulated cm={} mpp={}", CM_UNIT_ID, self.mpp_unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pulse_waveform_shape() {
        let wave = pulse_waveform(1000);
        assert_eq!(wave.len(), 256);
        assert_eq!(wave[0], 0);
        assert_eq!(*wave.iter().max().unwrap(), 1000);
        assert_eq!(wave[127], 1000);
        assert_eq!(wave[128], 1000);
        assert_eq!(wave[255], 0);
    }

    #[tokio::test]
    async fn test_forced_start_latches_peak() {
        let device = SimulatedDevice::new(14);
        device.set_pulse_amplitude(700);
        device
            .write_multiple_registers(14, 0x0000, &[0x0051, 0x0001])
            .await
            .unwrap();
        assert_eq!(device.registers(14, 0x0008, 1), vec![700]);
        let oscill = device.read_holding_registers(14, 0xA200, 256).await.unwrap();
        assert_eq!(*oscill.iter().max().unwrap(), 700);
    }

    #[tokio::test]
    async fn test_unreachable_unit_times_out() {
        let device = SimulatedDevice::new(14);
        device.set_reachable(CM_UNIT_ID, false);
        assert!(device.write_multiple_registers(1, 1, &[0]).await.is_err());
        assert!(device.read_holding_registers(14, 0, 4).await.is_ok());
        // Units that were never configured do not answer either
        assert!(device.read_holding_registers(3, 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_write_log_keeps_the_latest_writes() {
        let device = SimulatedDevice::new(14);
        for i in 0..WRITE_LOG_CAPACITY + 10 {
            device
                .write_multiple_registers(14, 0x0079, &[i as u16])
                .await
                .unwrap();
        }
        let writes = device.writes();
        assert_eq!(writes.len(), WRITE_LOG_CAPACITY);
        assert_eq!(writes[0].words, vec![10]);
        assert_eq!(
            writes.last().unwrap().words,
            vec![(WRITE_LOG_CAPACITY + 9) as u16]
        );
    }

    #[tokio::test]
    async fn test_measure_flag_follows_commands() {
        let device = SimulatedDevice::new(14);
        device.write_multiple_registers(14, 0, &[2, 1]).await.unwrap();
        assert!(device.is_measuring());
        device.write_multiple_registers(14, 0, &[2, 0]).await.unwrap();
        assert!(!device.is_measuring());
    }
}
