// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Register map and command codec for the DDII modules
//!
//! Everything in this module is pure data: register addresses, command codes
//! and the byte-level rules used to build requests and decode responses.
//!
//! ## MPP Holding Registers
//!
//! | Address | Name | Words read by default |
//! |---------|------|-----------------------|
//! | 0x0000 | Command register | 1 |
//! | 0x0006 | Temperature counter | 1 |
//! | 0x0007 | Acquisition 1 peak | 1 |
//! | 0x0008 | Acquisition 2 peak | 1 |
//! | 0x0009 | DDII input peak | 1 |
//! | 0x000A | Bin number | 1 |
//! | 0x000B | HH block | 32 |
//! | 0x002C | 32-bit histogram | 12 |
//! | 0x0038 | 16-bit histogram | 6 |
//! | 0x003E | HCP histogram | 6 |
//! | 0x0050 | Calibration, all channels | 1 |
//! | 0x0079 | Trigger level | 1 |
//! | 0xA000 | Oscilloscope channel 0 | 256 |
//! | 0xA200 | Oscilloscope channel 1 | 256 |
//!
//! Values are 16-bit words, big-endian when interpreted as bytes.

use crate::error::{BenchError, BenchResult};

/// Modbus function code: read holding registers
pub const FN_READ_HOLDING: u8 = 0x03;
/// Modbus function code: write multiple registers
pub const FN_WRITE_MULTIPLE: u8 = 0x10;

/// Unit id of the control module
pub const CM_UNIT_ID: u8 = 1;
/// Default unit id of the measurement module
pub const MPP_UNIT_ID_DEFAULT: u8 = 14;
/// Control module register selecting the switch mode
pub const CM_SWITCH_MODE_REG: u16 = 0x0001;
/// Switch mode value: silent
pub const CM_SILENT_MODE: u16 = 0x0000;
/// Switch mode value: combat
pub const CM_COMBAT_MODE: u16 = 0x0001;

/// Largest number of words a single holding-register read may request
pub const MAX_READ_WORDS: u16 = 125;

/// Holding registers of the measurement module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MppRegister {
    Command,
    TempCount,
    Acq1Peak,
    Acq2Peak,
    DdiiInPeak,
    BinNumber,
    Hh,
    Hist32,
    Hist16,
    HistHcp,
    CalibrateAll,
    Level,
    OscillCh0,
    OscillCh1,
}

impl MppRegister {
    /// Every register of the map, in address order
    pub const ALL: [MppRegister; 14] = [
        MppRegister::Command,
        MppRegister::TempCount,
        MppRegister::Acq1Peak,
        MppRegister::Acq2Peak,
        MppRegister::DdiiInPeak,
        MppRegister::BinNumber,
        MppRegister::Hh,
        MppRegister::Hist32,
        MppRegister::Hist16,
        MppRegister::HistHcp,
        MppRegister::CalibrateAll,
        MppRegister::Level,
        MppRegister::OscillCh0,
        MppRegister::OscillCh1,
    ];

    /// Start address of the register
    pub const fn address(self) -> u16 {
        match self {
            MppRegister::Command => 0x0000,
            MppRegister::TempCount => 0x0006,
            MppRegister::Acq1Peak => 0x0007,
            MppRegister::Acq2Peak => 0x0008,
            MppRegister::DdiiInPeak => 0x0009,
            MppRegister::BinNumber => 0x000A,
            MppRegister::Hh => 0x000B,
            MppRegister::Hist32 => 0x002C,
            MppRegister::Hist16 => 0x0038,
            MppRegister::HistHcp => 0x003E,
            MppRegister::CalibrateAll => 0x0050,
            MppRegister::Level => 0x0079,
            MppRegister::OscillCh0 => 0xA000,
            MppRegister::OscillCh1 => 0xA200,
        }
    }

    /// Number of words a default read of this register returns
    pub const fn word_count(self) -> u16 {
        match self {
            MppRegister::Hh => 32,
            MppRegister::Hist32 => 12,
            MppRegister::Hist16 | MppRegister::HistHcp => 6,
            MppRegister::OscillCh0 | MppRegister::OscillCh1 => 256,
            _ => 1,
        }
    }

    /// Human readable register name
    pub const fn name(self) -> &'static str {
        match self {
            MppRegister::Command => "command",
            MppRegister::TempCount => "temp_count",
            MppRegister::Acq1Peak => "acq1_peak",
            MppRegister::Acq2Peak => "acq2_peak",
            MppRegister::DdiiInPeak => "ddii_in_peak",
            MppRegister::BinNumber => "bin_number",
            MppRegister::Hh => "hh",
            MppRegister::Hist32 => "hist_32",
            MppRegister::Hist16 => "hist_16",
            MppRegister::HistHcp => "hist_hcp",
            MppRegister::CalibrateAll => "calibrate_all",
            MppRegister::Level => "level",
            MppRegister::OscillCh0 => "oscill_ch0",
            MppRegister::OscillCh1 => "oscill_ch1",
        }
    }

    /// Oscilloscope register for a channel index (0 or 1)
    pub const fn oscill(channel: u8) -> MppRegister {
        if channel == 0 {
            MppRegister::OscillCh0
        } else {
            MppRegister::OscillCh1
        }
    }

    /// Peak register for an acquisition channel (1 or 2)
    pub const fn acq_peak(acq_channel: u8) -> MppRegister {
        if acq_channel == 2 {
            MppRegister::Acq2Peak
        } else {
            MppRegister::Acq1Peak
        }
    }

    /// Look a register up by its start address
    pub fn from_address(address: u16) -> Option<MppRegister> {
        Self::ALL.iter().copied().find(|r| r.address() == address)
    }
}

/// Command codes written as the first word of the command register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MppCommandCode {
    SetLevel = 0x0001,
    Measure = 0x0002,
    SetHh = 0x0008,
    WaveformRelease = 0x0009,
    FilterBypass = 0x000A,
    TrigCountClear = 0x000B,
    StartMeasureForced = 0x0051,
}

impl MppCommandCode {
    pub const fn word(self) -> u16 {
        self as u16
    }
}

/// Command payloads written to the command register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPayload {
    StartMeasure,
    StopMeasure,
    SetLevel(u16),
    SetHh,
    WaveformRelease,
    FilterBypass,
    TrigCountClear,
    StartMeasureForced { channel: u8 },
}

/// Fixed payload: start a continuous measurement
pub const START_MEASURE: [u16; 2] = [MppCommandCode::Measure as u16, 0x0001];
/// Fixed payload: stop the continuous measurement
pub const STOP_MEASURE: [u16; 2] = [MppCommandCode::Measure as u16, 0x0000];

impl CommandPayload {
    /// Word sequence written to the command register
    pub fn words(&self) -> Vec<u16> {
        match *self {
            CommandPayload::StartMeasure => START_MEASURE.to_vec(),
            CommandPayload::StopMeasure => STOP_MEASURE.to_vec(),
            CommandPayload::SetLevel(level) => vec![MppCommandCode::SetLevel.word(), level],
            CommandPayload::SetHh => vec![MppCommandCode::SetHh.word()],
            CommandPayload::WaveformRelease => vec![MppCommandCode::WaveformRelease.word()],
            CommandPayload::FilterBypass => vec![MppCommandCode::FilterBypass.word()],
            CommandPayload::TrigCountClear => vec![MppCommandCode::TrigCountClear.word()],
            CommandPayload::StartMeasureForced { channel } => {
                vec![MppCommandCode::StartMeasureForced.word(), channel as u16]
            }
        }
    }

    /// Decode a word sequence read back from the command register
    pub fn from_words(words: &[u16]) -> BenchResult<CommandPayload> {
        let malformed = || BenchError::MalformedResponse(format!("unknown command payload {words:04X?}"));
        match words {
            [code, 0x0001] if *code == MppCommandCode::Measure.word() => Ok(CommandPayload::StartMeasure),
            [code, 0x0000] if *code == MppCommandCode::Measure.word() => Ok(CommandPayload::StopMeasure),
            [code, level] if *code == MppCommandCode::SetLevel.word() => Ok(CommandPayload::SetLevel(*level)),
            [code, channel] if *code == MppCommandCode::StartMeasureForced.word() => {
                let channel = u8::try_from(*channel).map_err(|_| malformed())?;
                Ok(CommandPayload::StartMeasureForced { channel })
            }
            [code] if *code == MppCommandCode::SetHh.word() => Ok(CommandPayload::SetHh),
            [code] if *code == MppCommandCode::WaveformRelease.word() => Ok(CommandPayload::WaveformRelease),
            [code] if *code == MppCommandCode::FilterBypass.word() => Ok(CommandPayload::FilterBypass),
            [code] if *code == MppCommandCode::TrigCountClear.word() => Ok(CommandPayload::TrigCountClear),
            _ => Err(malformed()),
        }
    }
}

/// A holding-register read request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub address: u16,
    pub count: u16,
}

/// A holding-register write request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub address: u16,
    pub words: Vec<u16>,
}

/// Build a read request for `count` words starting at `register`
pub fn encode_read(register: MppRegister, count: u16) -> ReadRequest {
    ReadRequest {
        address: register.address(),
        count,
    }
}

/// Build a write request carrying `values` for `register`
pub fn encode_write(register: MppRegister, values: &[u16]) -> WriteRequest {
    WriteRequest {
        address: register.address(),
        words: values.to_vec(),
    }
}

/// Encode words as big-endian bytes
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Frame a read response: byte count followed by the big-endian payload
pub fn frame_read_response(words: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + words.len() * 2);
    frame.push((words.len() * 2).min(u8::MAX as usize) as u8);
    frame.extend(words_to_bytes(words));
    frame
}

/// Strip the byte-count framing byte of a read response
pub fn strip_framing(frame: &[u8]) -> Vec<u8> {
    if frame.len() > 1 {
        frame[1..].to_vec()
    } else {
        Vec::new()
    }
}

/// Decode a raw read payload into 16-bit words
///
/// A leading framing byte is dropped when the payload has an odd length.
/// Fails with `MalformedResponse` when nothing usable remains or when fewer
/// than `expected_min_len` words are present.
pub fn decode_read(raw: &[u8], expected_min_len: usize) -> BenchResult<Vec<u16>> {
    if raw.is_empty() {
        return Err(BenchError::MalformedResponse("empty payload".to_string()));
    }
    let payload = if raw.len() % 2 == 1 { &raw[1..] } else { raw };
    if payload.len() < 2 {
        return Err(BenchError::MalformedResponse(format!(
            "payload shorter than one word: {}",
            hex::encode_upper(raw)
        )));
    }
    let words: Vec<u16> = payload
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    if words.len() < expected_min_len {
        return Err(BenchError::MalformedResponse(format!(
            "expected at least {} words, got {}",
            expected_min_len,
            words.len()
        )));
    }
    Ok(words)
}

/// Decode big-endian 32-bit values (histogram counters)
pub fn decode_u32_be(raw: &[u8]) -> Vec<u32> {
    raw.chunks_exact(4)
        .map(|q| u32::from_be_bytes([q[0], q[1], q[2], q[3]]))
        .collect()
}

/// Last word of a read payload, as used for single peak registers
pub fn last_word(raw: &[u8]) -> BenchResult<u16> {
    decode_read(raw, 1)?
        .last()
        .copied()
        .ok_or_else(|| BenchError::MalformedResponse("no words".to_string()))
}

/// Request PDU bytes of a holding-register read, used for wire tracing
pub fn read_request_pdu(request: &ReadRequest) -> Vec<u8> {
    let mut pdu = vec![FN_READ_HOLDING];
    pdu.extend(request.address.to_be_bytes());
    pdu.extend(request.count.to_be_bytes());
    pdu
}

/// Request PDU bytes of a holding-register write, used for wire tracing
pub fn write_request_pdu(request: &WriteRequest) -> Vec<u8> {
    let mut pdu = vec![FN_WRITE_MULTIPLE];
    pdu.extend(request.address.to_be_bytes());
    pdu.extend((request.words.len() as u16).to_be_bytes());
    pdu.push((request.words.len() * 2).min(u8::MAX as usize) as u8);
    pdu.extend(words_to_bytes(&request.words));
    pdu
}
