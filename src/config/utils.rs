// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration utilities
//!
//! This module provides utility functions for working with configuration
//! settings, including validation and schema management.

use anyhow::{Context, Result};
use log::debug;

use super::Config;

fn print_schema(schema_str: &str) -> Result<()> {
    let schema: serde_json::Value =
        serde_json::from_str(schema_str).context("Failed to parse JSON schema")?;
    let formatted_schema =
        serde_json::to_string_pretty(&schema).context("Failed to format JSON schema")?;
    println!("{}", formatted_schema);
    Ok(())
}

/// Output the embedded configuration JSON schema to the console.
///
/// This function is called when the `--show-config-schema` flag is provided
/// on the command line.
///
/// # Example
///
/// ```bash
/// ./rust_ddii_bench --show-config-schema > config_schema.json
/// ```
pub fn output_config_schema() -> Result<()> {
    print_schema(include_str!("../../resources/config.schema.json"))
}

/// Output the embedded measurement plan JSON schema to the console.
pub fn output_plan_schema() -> Result<()> {
    print_schema(include_str!("../../resources/plan.schema.json"))
}

/// Check if a string is a valid IP address
///
/// Validates that a string represents a valid IPv4 or IPv6 address,
/// or is one of the special values like "localhost" or "0.0.0.0".
pub fn is_valid_ip_address(addr: &str) -> bool {
    if addr.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }

    // Special cases
    matches!(addr, "localhost" | "::" | "::0" | "0.0.0.0")
}

/// Validates the configuration against additional rules that aren't covered by the JSON schema.
///
/// # Validation Rules
///
/// - **Unit ids**: the control module and the measurement module must use different ids
/// - **Serial port**: must not be empty in serial mode
/// - **Relay address**: must be an IP address or a special value, since the relay binds it
/// - **Oscilloscope read**: the sample count must fit the 512-word channel window
pub fn validate_specific_rules(config: &Config) -> Result<()> {
    debug!("Performing additional validation checks");

    if config.connection.cm_id == config.connection.mpp_id {
        anyhow::bail!(
            "Control module and measurement module share unit id {}",
            config.connection.cm_id
        );
    }

    if config.connection.mode == super::LinkMode::Serial
        && config.connection.serial_port.trim().is_empty()
    {
        anyhow::bail!("Serial mode selected without a serial port");
    }

    if !is_valid_ip_address(&config.relay.address) {
        anyhow::bail!("Invalid relay bind address: {}", config.relay.address);
    }

    if config.measurement.oscill_samples == 0 || config.measurement.oscill_samples > 512 {
        anyhow::bail!(
            "Invalid oscilloscope sample count: {}",
            config.measurement.oscill_samples
        );
    }

    if !is_valid_ip_address(&config.source.address) {
        // Host names are accepted, only note it
        debug!("Source address is not an IP address: {}", config.source.address);
    }

    Ok(())
}
