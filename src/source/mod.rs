// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Programmable voltage source drivers
//!
//! This module provides different source driver implementations:
//! - Keithley: Keithley 2600 series SMU driven with TSP commands over TCP
//! - Simulated: in-memory source for development and tests
//! - Null: stand-in used when no instrument is available
//!
//! The driver is chosen once, when the bench starts. When the configured
//! instrument cannot be reached the [`NullSource`] is substituted, so a
//! missing instrument shows up as `DeviceNotReady` on use rather than as a
//! startup failure.

pub mod keithley;
pub mod simulated;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};

use crate::config::{SourceConfig, SourceDriverKind};
use crate::error::{BenchError, BenchResult};

pub use keithley::Keithley2600;
pub use simulated::{SimulatedSource, SourceCall};

/// Capability of a DC voltage source with current sense
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceDriver: Send + Sync {
    /// Select DC volts, apply the current limit (A) and switch the output on
    async fn prepare(&self, current_limit: f64) -> BenchResult<()>;

    /// Set the output level in volts
    async fn set_level(&self, volts: f64) -> BenchResult<()>;

    /// Measure the output current in amperes
    async fn measure_current(&self) -> BenchResult<f64>;

    /// Switch the output off
    async fn output_off(&self) -> BenchResult<()>;

    fn is_connected(&self) -> bool;

    fn describe(&self) -> String;
}

/// Source used when no instrument is available
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSource;

fn no_source() -> BenchError {
    BenchError::DeviceNotReady("no voltage source connected".to_string())
}

#[async_trait]
impl SourceDriver for NullSource {
    async fn prepare(&self, _current_limit: f64) -> BenchResult<()> {
        Err(no_source())
    }

    async fn set_level(&self, _volts: f64) -> BenchResult<()> {
        Err(no_source())
    }

    async fn measure_current(&self) -> BenchResult<f64> {
        Err(no_source())
    }

    async fn output_off(&self) -> BenchResult<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        "none".to_string()
    }
}

/// Build the source driver selected in the configuration
pub async fn connect_source(config: &SourceConfig) -> Arc<dyn SourceDriver> {
    match config.driver {
        SourceDriverKind::Keithley => {
            let timeout = Duration::from_millis(config.timeout_ms);
            match Keithley2600::connect(&config.address, config.port, timeout).await {
                Ok(source) => {
                    info!("Voltage source ready: {}", source.describe());
                    Arc::new(source)
                }
                Err(e) => {
                    warn!("Voltage source unavailable, continuing without it: {e}");
                    Arc::new(NullSource)
                }
            }
        }
        SourceDriverKind::Simulated => Arc::new(SimulatedSource::new()),
        SourceDriverKind::None => Arc::new(NullSource),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_source() {
        let source = NullSource;
        assert!(!source.is_connected());
        assert!(matches!(
            source.set_level(1.0).await,
            Err(BenchError::DeviceNotReady(_))
        ));
        assert!(source.output_off().await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_keithley_falls_back_to_null() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = SourceConfig {
            driver: SourceDriverKind::Keithley,
            address: "127.0.0.1".to_string(),
            port,
            timeout_ms: 300,
        };
        let source = connect_source(&config).await;
        assert!(!source.is_connected());
        assert_eq!(source.describe(), "none");
    }
}
