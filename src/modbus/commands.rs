// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Typed command interface for the DDII modules
//!
//! [`MppCommands`] and [`CmCommands`] issue register reads and writes through
//! a [`TransportHandle`]. Every operation returns a `BenchResult`; callers
//! that prefer a best-effort telemetry style compose the call with
//! [`or_sentinel`], which logs the failure and substitutes a default.
//!
//! When wire tracing is enabled each request and its response (or failure)
//! is logged under the `ddii::wire` target as hex PDUs.

use std::fmt;

use log::{info, warn};

use crate::error::{BenchError, BenchResult};
use crate::modbus::registers::{
    decode_read, decode_u32_be, encode_read, encode_write, frame_read_response, last_word,
    read_request_pdu, strip_framing, write_request_pdu, CommandPayload,
    MppRegister, ReadRequest, WriteRequest, CM_COMBAT_MODE, CM_SILENT_MODE, CM_SWITCH_MODE_REG,
    CM_UNIT_ID, FN_READ_HOLDING, FN_WRITE_MULTIPLE, MAX_READ_WORDS,
};
use crate::modbus::transport::TransportHandle;

/// Log target of the wire trace
pub const WIRE_TARGET: &str = "ddii::wire";

/// Words cleared by [`MppCommands::clear_histogram`]
const HIST_CLEAR_WORDS: usize = 18;
/// Words cleared by [`MppCommands::clear_measure_registers`]
const MEASURE_CLEAR_WORDS: usize = 4;

/// Log a failed operation and return `default` in its place
pub fn or_sentinel<T>(operation: &str, result: BenchResult<T>, default: T) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!("{operation} failed: {e}");
            default
        }
    }
}

/// Request/response tracer shared by the command issuers
#[derive(Debug, Clone, Copy, Default)]
struct WireTrace {
    enabled: bool,
}

impl WireTrace {
    fn tx(&self, unit: u8, pdu: &[u8]) {
        if self.enabled {
            info!(target: WIRE_TARGET, "TX unit={} {}", unit, hex::encode_upper(pdu));
        }
    }

    fn rx(&self, unit: u8, pdu: &[u8]) {
        if self.enabled {
            info!(target: WIRE_TARGET, "RX unit={} {}", unit, hex::encode_upper(pdu));
        }
    }

    fn rx_err(&self, unit: u8, err: &BenchError) {
        if self.enabled {
            info!(target: WIRE_TARGET, "RX unit={} ERR {}", unit, err);
        }
    }
}

/// Raw read/write against one unit id
#[derive(Clone)]
struct UnitClient {
    transport: TransportHandle,
    unit: u8,
    trace: WireTrace,
}

impl UnitClient {
    async fn read(&self, request: ReadRequest) -> BenchResult<Vec<u8>> {
        let mut payload = Vec::with_capacity(request.count as usize * 2);
        let mut offset = 0u16;
        while offset < request.count {
            let chunk = ReadRequest {
                address: request.address.wrapping_add(offset),
                count: (request.count - offset).min(MAX_READ_WORDS),
            };
            self.trace.tx(self.unit, &read_request_pdu(&chunk));
            match self
                .transport
                .read_holding_registers(self.unit, chunk.address, chunk.count)
                .await
            {
                Ok(words) => {
                    let frame = frame_read_response(&words);
                    let mut pdu = vec![FN_READ_HOLDING];
                    pdu.extend_from_slice(&frame);
                    self.trace.rx(self.unit, &pdu);
                    payload.extend(strip_framing(&frame));
                }
                Err(e) => {
                    self.trace.rx_err(self.unit, &e);
                    return Err(e);
                }
            }
            offset += chunk.count;
        }
        Ok(payload)
    }

    async fn write(&self, request: WriteRequest) -> BenchResult<()> {
        self.trace.tx(self.unit, &write_request_pdu(&request));
        match self
            .transport
            .write_multiple_registers(self.unit, request.address, &request.words)
            .await
        {
            Ok(()) => {
                let mut pdu = vec![FN_WRITE_MULTIPLE];
                pdu.extend(request.address.to_be_bytes());
                pdu.extend((request.words.len() as u16).to_be_bytes());
                self.trace.rx(self.unit, &pdu);
                Ok(())
            }
            Err(e) => {
                self.trace.rx_err(self.unit, &e);
                Err(e)
            }
        }
    }
}

/// Commands understood by the measurement module (MPP)
#[derive(Clone)]
pub struct MppCommands {
    client: UnitClient,
}

impl fmt::Debug for MppCommands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MppCommands")
            .field("unit", &self.client.unit)
            .field("transport", &self.client.transport)
            .finish()
    }
}

impl MppCommands {
    pub fn new(transport: TransportHandle, unit: u8) -> Self {
        Self {
            client: UnitClient {
                transport,
                unit,
                trace: WireTrace::default(),
            },
        }
    }

    /// Enable or disable the wire trace for this issuer
    pub fn with_wire_trace(mut self, enabled: bool) -> Self {
        self.client.trace.enabled = enabled;
        self
    }

    pub fn unit(&self) -> u8 {
        self.client.unit
    }

    /// Read `count` words starting at `register` and return the raw payload bytes
    ///
    /// Reads longer than one Modbus frame allows are split into several requests.
    pub async fn read(&self, register: MppRegister, count: u16) -> BenchResult<Vec<u8>> {
        self.client.read(encode_read(register, count)).await
    }

    /// Write `values` starting at `register`
    pub async fn write(&self, register: MppRegister, values: &[u16]) -> BenchResult<()> {
        if values.is_empty() {
            return Err(BenchError::Config(format!(
                "empty write to {}",
                register.name()
            )));
        }
        self.client.write(encode_write(register, values)).await
    }

    /// Read `count` words at an arbitrary address (register block dumps)
    pub async fn read_raw(&self, address: u16, count: u16) -> BenchResult<Vec<u16>> {
        let raw = self.client.read(ReadRequest { address, count }).await?;
        decode_read(&raw, count as usize)
    }

    async fn read_words(&self, register: MppRegister, count: u16) -> BenchResult<Vec<u16>> {
        let raw = self.read(register, count).await?;
        decode_read(&raw, count as usize)
    }

    async fn read_single(&self, register: MppRegister) -> BenchResult<u16> {
        last_word(&self.read(register, register.word_count()).await?)
    }

    async fn command(&self, payload: CommandPayload) -> BenchResult<()> {
        self.write(MppRegister::Command, &payload.words()).await
    }

    pub async fn start_measure(&self) -> BenchResult<()> {
        self.command(CommandPayload::StartMeasure).await
    }

    pub async fn stop_measure(&self) -> BenchResult<()> {
        self.command(CommandPayload::StopMeasure).await
    }

    /// Program the trigger level
    pub async fn set_level(&self, level: u16) -> BenchResult<()> {
        self.command(CommandPayload::SetLevel(level)).await
    }

    /// Force a single-shot acquisition on an oscilloscope channel
    pub async fn start_measure_forced(&self, channel: u8) -> BenchResult<()> {
        self.command(CommandPayload::StartMeasureForced { channel }).await
    }

    pub async fn waveform_release(&self) -> BenchResult<()> {
        self.command(CommandPayload::WaveformRelease).await
    }

    pub async fn filter_bypass(&self) -> BenchResult<()> {
        self.command(CommandPayload::FilterBypass).await
    }

    pub async fn trig_count_clear(&self) -> BenchResult<()> {
        self.command(CommandPayload::TrigCountClear).await
    }

    /// Apply the HH thresholds previously written with [`Self::write_hh`]
    pub async fn set_hh(&self) -> BenchResult<()> {
        self.command(CommandPayload::SetHh).await
    }

    pub async fn write_hh(&self, values: &[u16]) -> BenchResult<()> {
        self.write(MppRegister::Hh, values).await
    }

    pub async fn read_hh(&self) -> BenchResult<Vec<u16>> {
        self.read_words(MppRegister::Hh, MppRegister::Hh.word_count()).await
    }

    /// Zero the 32-bit and 16-bit histograms
    pub async fn clear_histogram(&self) -> BenchResult<()> {
        self.write(MppRegister::Hist32, &[0; HIST_CLEAR_WORDS]).await
    }

    /// Zero the peak registers
    pub async fn clear_measure_registers(&self) -> BenchResult<()> {
        self.write(MppRegister::Acq1Peak, &[0; MEASURE_CLEAR_WORDS]).await
    }

    /// Read `count` samples of an oscilloscope channel (0 or 1)
    pub async fn read_oscill(&self, channel: u8, count: u16) -> BenchResult<Vec<u16>> {
        self.read_words(MppRegister::oscill(channel), count).await
    }

    /// Peak of acquisition channel 1 or 2
    pub async fn read_acq_peak(&self, acq_channel: u8) -> BenchResult<u16> {
        self.read_single(MppRegister::acq_peak(acq_channel)).await
    }

    pub async fn read_ddii_peak(&self) -> BenchResult<u16> {
        self.read_single(MppRegister::DdiiInPeak).await
    }

    pub async fn read_temp_count(&self) -> BenchResult<u16> {
        self.read_single(MppRegister::TempCount).await
    }

    pub async fn read_bin_number(&self) -> BenchResult<u16> {
        self.read_single(MppRegister::BinNumber).await
    }

    pub async fn read_level(&self) -> BenchResult<u16> {
        self.read_single(MppRegister::Level).await
    }

    /// 32-bit histogram counters
    pub async fn read_hist_32(&self) -> BenchResult<Vec<u32>> {
        let raw = self
            .read(MppRegister::Hist32, MppRegister::Hist32.word_count())
            .await?;
        decode_read(&raw, MppRegister::Hist32.word_count() as usize)?;
        Ok(decode_u32_be(&raw))
    }

    pub async fn read_hist_16(&self) -> BenchResult<Vec<u16>> {
        self.read_words(MppRegister::Hist16, MppRegister::Hist16.word_count())
            .await
    }

    pub async fn read_hist_hcp(&self) -> BenchResult<Vec<u16>> {
        self.read_words(MppRegister::HistHcp, MppRegister::HistHcp.word_count())
            .await
    }

    /// Lightweight read used as a liveness probe
    pub async fn probe(&self) -> BenchResult<()> {
        self.read(MppRegister::Command, 4).await.map(|_| ())
    }
}

/// Switch mode of the control module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchMode {
    Silent,
    Combat,
}

impl SwitchMode {
    pub const fn word(self) -> u16 {
        match self {
            SwitchMode::Silent => CM_SILENT_MODE,
            SwitchMode::Combat => CM_COMBAT_MODE,
        }
    }
}

/// Commands understood by the control module (CM)
#[derive(Clone)]
pub struct CmCommands {
    client: UnitClient,
}

impl fmt::Debug for CmCommands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmCommands")
            .field("unit", &self.client.unit)
            .finish()
    }
}

impl CmCommands {
    pub fn new(transport: TransportHandle) -> Self {
        Self::with_unit(transport, CM_UNIT_ID)
    }

    pub fn with_unit(transport: TransportHandle, unit: u8) -> Self {
        Self {
            client: UnitClient {
                transport,
                unit,
                trace: WireTrace::default(),
            },
        }
    }

    pub fn with_wire_trace(mut self, enabled: bool) -> Self {
        self.client.trace.enabled = enabled;
        self
    }

    pub async fn set_switch_mode(&self, mode: SwitchMode) -> BenchResult<()> {
        self.client
            .write(WriteRequest {
                address: CM_SWITCH_MODE_REG,
                words: vec![mode.word()],
            })
            .await
    }

    /// Lightweight write used as a liveness probe (selects silent mode)
    pub async fn probe(&self) -> BenchResult<()> {
        self.set_switch_mode(SwitchMode::Silent).await
    }

    /// Read back the current switch mode word
    pub async fn read_switch_mode(&self) -> BenchResult<u16> {
        let raw = self
            .client
            .read(ReadRequest {
                address: CM_SWITCH_MODE_REG,
                count: 1,
            })
            .await?;
        last_word(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::simulated::SimulatedDevice;
    use crate::modbus::transport::MockModbusTransport;
    use crate::modbus::registers::MPP_UNIT_ID_DEFAULT;

    fn simulated() -> (SimulatedDevice, MppCommands) {
        let device = SimulatedDevice::new(MPP_UNIT_ID_DEFAULT);
        let cmds = MppCommands::new(TransportHandle::new(device.clone()), MPP_UNIT_ID_DEFAULT);
        (device, cmds)
    }

    #[tokio::test]
    async fn test_command_payloads_reach_command_register() {
        let (device, cmds) = simulated();
        cmds.start_measure().await.unwrap();
        cmds.set_level(321).await.unwrap();
        cmds.stop_measure().await.unwrap();

        let writes = device.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0].address, 0x0000);
        assert_eq!(writes[0].words, vec![0x0002, 0x0001]);
        assert_eq!(writes[1].words, vec![0x0001, 321]);
        assert_eq!(writes[2].words, vec![0x0002, 0x0000]);
    }

    #[tokio::test]
    async fn test_peak_and_clear() {
        let (device, cmds) = simulated();
        device.set_registers(MPP_UNIT_ID_DEFAULT, 0x0007, &[1200, 900]);
        assert_eq!(cmds.read_acq_peak(1).await.unwrap(), 1200);
        assert_eq!(cmds.read_acq_peak(2).await.unwrap(), 900);

        cmds.clear_measure_registers().await.unwrap();
        assert_eq!(cmds.read_acq_peak(1).await.unwrap(), 0);
        assert_eq!(cmds.read_acq_peak(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_histogram_zeroes_both_histograms() {
        let (device, cmds) = simulated();
        let counts: Vec<u16> = (1..=18).collect();
        device.set_registers(MPP_UNIT_ID_DEFAULT, 0x002C, &counts);
        assert_eq!(cmds.read_hist_16().await.unwrap(), vec![13, 14, 15, 16, 17, 18]);

        cmds.clear_histogram().await.unwrap();

        let writes = device.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].address, 0x002C);
        assert_eq!(writes[0].words, vec![0; 18]);
        assert!(cmds.read_hist_32().await.unwrap().iter().all(|&c| c == 0));
        assert_eq!(cmds.read_hist_16().await.unwrap(), vec![0; 6]);
    }

    #[tokio::test]
    async fn test_single_word_commands() {
        let (device, cmds) = simulated();
        cmds.set_hh().await.unwrap();
        cmds.filter_bypass().await.unwrap();
        cmds.trig_count_clear().await.unwrap();
        cmds.waveform_release().await.unwrap();

        let writes = device.writes();
        assert!(writes.iter().all(|w| w.address == 0x0000));
        let words: Vec<Vec<u16>> = writes.into_iter().map(|w| w.words).collect();
        assert_eq!(
            words,
            vec![vec![0x0008], vec![0x000A], vec![0x000B], vec![0x0009]]
        );
    }

    #[tokio::test]
    async fn test_hh_thresholds_and_hcp_histogram() {
        let (device, cmds) = simulated();
        let thresholds: Vec<u16> = (100..132).collect();
        cmds.write_hh(&thresholds).await.unwrap();
        assert_eq!(cmds.read_hh().await.unwrap(), thresholds);
        assert_eq!(device.writes()[0].address, 0x000B);

        device.set_registers(MPP_UNIT_ID_DEFAULT, 0x003E, &[5, 4, 3, 2, 1, 0]);
        assert_eq!(cmds.read_hist_hcp().await.unwrap(), vec![5, 4, 3, 2, 1, 0]);
    }

    #[tokio::test]
    async fn test_long_reads_are_chunked() {
        let (device, cmds) = simulated();
        let samples: Vec<u16> = (0..256).collect();
        device.set_registers(MPP_UNIT_ID_DEFAULT, 0xA000, &samples);
        assert_eq!(cmds.read_oscill(0, 256).await.unwrap(), samples);
        assert_eq!(device.read_count(), 3);
    }

    #[tokio::test]
    async fn test_hist_32_decodes_big_endian_pairs() {
        let (device, cmds) = simulated();
        device.set_registers(MPP_UNIT_ID_DEFAULT, 0x002C, &[0x0001, 0x0002, 0, 7]);
        let hist = cmds.read_hist_32().await.unwrap();
        assert_eq!(hist.len(), 6);
        assert_eq!(hist[0], 0x0001_0002);
        assert_eq!(hist[1], 7);
    }

    #[tokio::test]
    async fn test_failures_become_sentinels() {
        let mut mock = MockModbusTransport::new();
        mock.expect_read_holding_registers()
            .returning(|unit, _, _| Err(BenchError::DeviceException {
                unit,
                reason: "IllegalDataAddress".to_string(),
            }));
        mock.expect_describe().return_const("mock".to_string());
        let cmds = MppCommands::new(TransportHandle::new(mock), 14).with_wire_trace(true);

        let result = cmds.read_ddii_peak().await;
        assert!(matches!(result, Err(BenchError::DeviceException { unit: 14, .. })));
        assert_eq!(or_sentinel("read_ddii_peak", cmds.read_ddii_peak().await, 0), 0);
        assert!(or_sentinel("read_oscill", cmds.read_oscill(1, 16).await, Vec::new()).is_empty());
    }

    #[tokio::test]
    async fn test_short_response_is_malformed() {
        let mut mock = MockModbusTransport::new();
        mock.expect_read_holding_registers()
            .returning(|_, _, _| Ok(vec![1, 2]));
        let cmds = MppCommands::new(TransportHandle::new(mock), 14);
        assert!(matches!(
            cmds.read_oscill(0, 8).await,
            Err(BenchError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_cm_switch_mode() {
        let device = SimulatedDevice::new(MPP_UNIT_ID_DEFAULT);
        let cm = CmCommands::new(TransportHandle::new(device.clone()));
        cm.set_switch_mode(SwitchMode::Combat).await.unwrap();
        assert_eq!(cm.read_switch_mode().await.unwrap(), 1);
        cm.probe().await.unwrap();
        assert_eq!(cm.read_switch_mode().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_write_is_rejected() {
        let (device, cmds) = simulated();
        assert!(cmds.write(MppRegister::Hh, &[]).await.is_err());
        assert!(device.writes().is_empty());
    }
}
