// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Error taxonomy shared by the bench core
//!
//! Low-level failures are split into three families:
//!
//! - **Transport faults**: the physical link could not be opened or broke
//!   (`PortBusy`, `HostUnreachable`, `Io`, `Timeout`)
//! - **Protocol faults**: the device answered, but not with usable data
//!   (`DeviceException`, `MalformedResponse`)
//! - **Usage faults**: configuration or supervisor misuse
//!   (`Config`, `DuplicateTask`, `NoSuchTask`, `DeviceNotReady`)
//!
//! `Cancelled` is not a failure of the hardware; it marks an operation that
//! stopped because its task was asked to stop.

use thiserror::Error;

/// Errors produced by the bench core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BenchError {
    #[error("Serial port '{port}' is busy or not found: {reason}")]
    PortBusy { port: String, reason: String },

    #[error("Host {host} is unreachable: {reason}")]
    HostUnreachable { host: String, reason: String },

    #[error("I/O failure: {0}")]
    Io(String),

    #[error("No response within {0} ms")]
    Timeout(u64),

    #[error("Device exception on unit {unit}: {reason}")]
    DeviceException { unit: u8, reason: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task '{0}' is already running")]
    DuplicateTask(String),

    #[error("No task named '{0}'")]
    NoSuchTask(String),

    #[error("Device not ready: {0}")]
    DeviceNotReady(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl BenchError {
    /// `true` for failures of the physical link
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            BenchError::PortBusy { .. }
                | BenchError::HostUnreachable { .. }
                | BenchError::Io(_)
                | BenchError::Timeout(_)
        )
    }

    /// `true` when the device answered with an exception or unusable data
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            BenchError::DeviceException { .. } | BenchError::MalformedResponse(_)
        )
    }
}

impl From<std::io::Error> for BenchError {
    fn from(err: std::io::Error) -> Self {
        BenchError::Io(err.to_string())
    }
}

/// Result alias used across the bench core
pub type BenchResult<T> = std::result::Result<T, BenchError>;
