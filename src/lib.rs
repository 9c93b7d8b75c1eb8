// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Rust DDII bench library
//!
//! This library drives a DDII measurement bench: a measurement module (MPP)
//! and its control module (CM) reached over Modbus RTU or TCP, and a
//! programmable voltage source. It provides the register codec and command
//! set, the connection manager with its TCP relay, a supervisor for
//! cancellable background tasks, and the measurement runner that executes
//! measurement plans.

pub mod config;
pub mod connection;
pub mod error;
pub mod measurement;
pub mod modbus;
pub mod sequencer;
pub mod source;
pub mod supervisor;

pub use error::{BenchError, BenchResult};
