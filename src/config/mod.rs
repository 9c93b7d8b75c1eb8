// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration management for the DDII bench
//!
//! This module provides functionality for loading, validating, and applying
//! configuration settings for the bench. The configuration is backed by a
//! YAML file and validated against a JSON schema for robustness.
//!
//! ## Configuration Structure
//!
//! - `connection`: How the DDII modules are reached (serial, TCP, simulated)
//! - `relay`: Settings for the Modbus TCP relay
//! - `source`: Voltage source driver and endpoint
//! - `measurement`: Output directory and acquisition settings of the runner
//!
//! Measurement plans are separate documents, see [`MeasurementPlan`].
//!
//! ## Usage
//!
//! ```no_run
//! use rust_ddii_bench::config::Config;
//! use std::path::Path;
//!
//! // Load config from file, creates a default if not found
//! let mut config = Config::from_file(Path::new("config.yaml")).unwrap();
//!
//! // Apply command line overrides if needed
//! config.apply_args(
//!     Some("/dev/ttyUSB1".to_string()), // Serial port
//!     Some(115200),                     // Baud rate
//!     None,                             // TCP host
//!     None,                             // TCP port
//!     Some(14),                         // MPP unit id
//!     false,                            // Simulate
//!     true,                             // Wire trace
//! );
//!
//! println!("MPP unit id: {}", config.connection.mpp_id);
//! ```

pub mod connection;
pub mod measurement;
pub mod plan;
pub mod relay;
pub mod source;
pub mod utils;

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionSettings;

// Re-export all types for public API
pub use connection::{ConnectionConfig, LinkMode};
pub use measurement::MeasurementConfig;
pub use plan::{
    ConstMode, ConvinceMode, LinspaceMode, MeasureSettings, MeasurementPlan, ModbusSettings,
    ProcessDefinition,
};
pub use relay::RelayConfig;
pub use source::{SourceConfig, SourceDriverKind};
pub use utils::{is_valid_ip_address, output_config_schema, output_plan_schema};

/// Root configuration structure of the bench.
///
/// Every section falls back to its defaults when absent from the file, so a
/// minimal configuration only lists what differs from the bench defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Link to the DDII modules.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Modbus TCP relay settings.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Voltage source driver.
    ///
    /// When the selected instrument cannot be reached the bench continues
    /// without a source; operations needing it report `DeviceNotReady`.
    #[serde(default)]
    pub source: SourceConfig,

    /// Measurement runner settings.
    #[serde(default)]
    pub measurement: MeasurementConfig,
}

impl Config {
    /// Helper method to create a sample config file when validation fails
    fn create_sample_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        let sample_path = path.with_extension("sample.yaml");
        debug!("Original path: {:?}, Sample path: {:?}", path, sample_path);

        if let Some(parent) = sample_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!("Creating parent directory: {:?}", parent);
                fs::create_dir_all(parent).with_context(|| {
                    format!(
                        "Failed to create parent directory for sample config at {:?}",
                        parent
                    )
                })?;
            }
        }

        Self::default()
            .save_to_file(&sample_path)
            .with_context(|| format!("Failed to save sample config to {:?}", sample_path))?;

        error!(
            "Sample configuration file created at {:?}\nPlease edit and rename it",
            sample_path
        );
        Ok(())
    }

    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(
                "Configuration file not found at {:?}, creating default",
                path
            );
            let default_config = Self::default();
            default_config.save_to_file(path)?;
            return Ok(default_config);
        }

        debug!("Loading configuration from {:?}", path);
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file at {:?}", path))?;

        // First step: convert YAML to a generic Value
        let yaml_value: serde_yml::Value = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML configuration from {:?}", path))?;

        // Convert to JSON Value for validation
        let json_value = serde_json::to_value(&yaml_value).with_context(|| {
            format!("Failed to convert YAML to JSON for validation: {:?}", path)
        })?;

        let schema_str = include_str!("../../resources/config.schema.json");
        let schema: serde_json::Value =
            serde_json::from_str(schema_str).context("Failed to parse JSON schema")?;

        let validator = jsonschema::draft202012::options()
            .should_validate_formats(true)
            .build(&schema)?;

        debug!("Validating {} configuration against schema", path.display());
        if let Err(error) = validator.validate(&json_value) {
            error!("Configuration validation error before deserialization");
            Self::create_sample_config(path)?;
            anyhow::bail!("Configuration validation failed: {}", error);
        }

        debug!("Schema validation passed, deserializing into Config structure");
        let config: Config = match serde_yml::from_str(&contents) {
            Ok(config) => config,
            Err(err) => {
                error!("Configuration deserialization error: {}", err);
                if let Err(e) = Self::create_sample_config(path) {
                    error!("Failed to create sample config: {}", e);
                }
                return Err(anyhow::anyhow!(
                    "Failed to deserialize configuration from {}: {}",
                    path.display(),
                    err
                ));
            }
        };

        if let Err(err) = utils::validate_specific_rules(&config) {
            error!("Configuration specific validation error: {}", err);
            Self::create_sample_config(path)?;
            return Err(err);
        }

        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml =
            serde_yml::to_string(self).context("Failed to serialize configuration to YAML")?;

        let mut file = File::create(path.as_ref())
            .with_context(|| format!("Failed to create config file at {:?}", path.as_ref()))?;

        file.write_all(yaml.as_bytes())
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Apply command line arguments to override configuration values.
    ///
    /// Only arguments that are provided override the loaded values.
    ///
    /// # Parameters
    ///
    /// * `serial_port` - Serial device of the RTU link
    /// * `baud_rate` - Serial line speed
    /// * `tcp_host` - Modbus TCP server host; selects the TCP mode
    /// * `tcp_port` - Modbus TCP server port
    /// * `mpp_id` - Unit id of the measurement module
    /// * `simulate` - If true, use the simulated device and source
    /// * `wire_trace` - If true, enable the wire trace
    #[allow(clippy::too_many_arguments)]
    pub fn apply_args(
        &mut self,
        serial_port: Option<String>,
        baud_rate: Option<u32>,
        tcp_host: Option<String>,
        tcp_port: Option<u16>,
        mpp_id: Option<u8>,
        simulate: bool,
        wire_trace: bool,
    ) {
        if let Some(port) = serial_port {
            debug!("Overriding serial port from command line: {}", port);
            self.connection.serial_port = port;
            self.connection.mode = LinkMode::Serial;
        }
        if let Some(baud) = baud_rate {
            debug!("Overriding baud rate from command line: {}", baud);
            self.connection.baud_rate = baud;
        }
        if let Some(host) = tcp_host {
            debug!("Overriding TCP host from command line: {}", host);
            self.connection.tcp_host = host;
            self.connection.mode = LinkMode::Tcp;
        }
        if let Some(port) = tcp_port {
            debug!("Overriding TCP port from command line: {}", port);
            self.connection.tcp_port = port;
        }
        if let Some(id) = mpp_id {
            debug!("Overriding MPP unit id from command line: {}", id);
            self.connection.mpp_id = id;
        }
        if simulate {
            debug!("Simulation requested from command line");
            self.connection.mode = LinkMode::Simulated;
            self.source.driver = SourceDriverKind::Simulated;
        }
        if wire_trace {
            self.connection.wire_trace = true;
        }
    }

    /// Settings handed to the connection manager
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            timeout: Duration::from_secs_f64(self.connection.timeout_s.max(0.1)),
            mpp_id: self.connection.mpp_id,
            cm_id: self.connection.cm_id,
            wire_trace: self.connection.wire_trace,
            relay_block_size: self.relay.block_size,
            mirror_interval: (self.relay.mirror_interval_ms > 0)
                .then(|| Duration::from_millis(self.relay.mirror_interval_ms)),
        }
    }
}
