// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus communication module
//!
//! This module holds everything that speaks Modbus to the DDII bench: the
//! register map, the transports, the typed command interface and the TCP relay
//! server that republishes a serial-attached module to a second client.
//!
//! ## Key Components
//!
//! - [`registers`]: register addresses, command codes and the byte codec
//! - [`transport`]: the `ModbusTransport` capability and its RTU/TCP link
//! - [`commands`]: `MppCommands` and `CmCommands`
//! - [`relay_server`]: the TCP relay listener and its register store
//! - [`simulated`]: an in-memory device for `--simulate` and tests
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use rust_ddii_bench::modbus::{MppCommands, ModbusLink, TransportHandle};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let link = ModbusLink::open_tcp("192.168.1.20", 502, Duration::from_secs(1)).await?;
//! let mpp = MppCommands::new(TransportHandle::new(link), 14);
//! mpp.start_measure().await?;
//! let peak = mpp.read_acq_peak(1).await?;
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod registers;
pub mod relay_server;
pub mod simulated;
pub mod transport;

pub use commands::{or_sentinel, CmCommands, MppCommands, SwitchMode};
pub use registers::{CommandPayload, MppRegister};
pub use relay_server::{RelayServer, RelayStore};
pub use simulated::SimulatedDevice;
pub use transport::{ModbusLink, ModbusTransport, NullTransport, SerialSettings, TransportHandle};
