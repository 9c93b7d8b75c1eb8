// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus TCP relay configuration

use serde::{Deserialize, Serialize};

/// Configuration for the TCP relay that republishes a serial-attached
/// measurement module to a second client.
///
/// # Fields
///
/// * `address` - Network address the relay binds to (default: 0.0.0.0)
/// * `port` - TCP port of the relay (default: 5012)
/// * `block_size` - Number of holding registers served (default: 200)
/// * `mirror_interval_ms` - Period of the mirror refresh from the device,
///   `0` to refresh only on demand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub address: String,
    pub port: u16,
    pub block_size: usize,
    pub mirror_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 5012,
            block_size: 200,
            mirror_interval_ms: 500,
        }
    }
}
