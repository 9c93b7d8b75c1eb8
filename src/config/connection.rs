// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Bench connection configuration
//!
//! This module defines how the bench reaches the DDII modules: the physical
//! mode, the serial line or TCP endpoint, and the Modbus unit ids.

use serde::{Deserialize, Serialize};

/// Transport used to reach the DDII modules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Modbus RTU on a serial port
    Serial,
    /// Modbus TCP client
    Tcp,
    /// In-memory device, no hardware
    Simulated,
}

/// Configuration of the link to the DDII modules.
///
/// # Example
///
/// ```
/// use rust_ddii_bench::config::{ConnectionConfig, LinkMode};
///
/// let connection = ConnectionConfig {
///     mode: LinkMode::Tcp,
///     tcp_host: "10.6.1.50".to_string(),
///     ..Default::default()
/// };
/// assert_eq!(connection.tcp_port, 502);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Transport used at startup
    pub mode: LinkMode,

    /// Serial device, e.g. `/dev/ttyUSB0` or `COM3`
    pub serial_port: String,

    /// Serial line speed (8N1)
    pub baud_rate: u32,

    /// Host of the Modbus TCP server (a relay or a TCP-capable module)
    pub tcp_host: String,

    pub tcp_port: u16,

    /// Connect and response timeout in seconds. Values below 0.1 are rejected.
    pub timeout_s: f64,

    /// Unit id of the measurement module
    pub mpp_id: u8,

    /// Unit id of the control module
    pub cm_id: u8,

    /// Log every Modbus request and response as hex under the `ddii::wire` target
    pub wire_trace: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mode: LinkMode::Serial,
            serial_port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            tcp_host: "127.0.0.1".to_string(),
            tcp_port: 502,          // Standard Modbus TCP port
            timeout_s: 1.0,
            mpp_id: 14,             // Factory id of the MPP board
            cm_id: 1,
            wire_trace: false,
        }
    }
}
