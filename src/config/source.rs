// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Voltage source configuration

use serde::{Deserialize, Serialize};

/// Driver used for the voltage source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceDriverKind {
    /// Keithley 2600 series over its raw TCP socket
    Keithley,
    Simulated,
    /// No source; operations that need it fail with `DeviceNotReady`
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub driver: SourceDriverKind,

    /// Instrument host name or address
    pub address: String,

    /// Raw socket port of the instrument
    pub port: u16,

    /// Connect and query timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            driver: SourceDriverKind::Keithley,
            address: "10.6.1.222".to_string(),
            port: 5025,
            timeout_ms: 3000,
        }
    }
}
