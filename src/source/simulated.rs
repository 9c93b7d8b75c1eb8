// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Simulated voltage source
//!
//! Behaves like a source driving a fixed resistive load and records every
//! call so tests can check the order in which the bench drove it.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::debug;

use crate::error::{BenchError, BenchResult};
use crate::source::SourceDriver;

/// Load seen by the simulated output, in ohms
const LOAD_OHMS: f64 = 1.0e6;

/// One call received by the simulated source
#[derive(Debug, Clone, PartialEq)]
pub enum SourceCall {
    Prepare { current_limit: f64 },
    SetLevel(f64),
    MeasureCurrent,
    OutputOff,
}

#[derive(Debug, Default)]
struct SourceState {
    calls: Vec<SourceCall>,
    output_on: bool,
    level: f64,
    current_limit: f64,
    levels_before_failure: Option<usize>,
}

/// In-memory voltage source
#[derive(Debug, Clone, Default)]
pub struct SimulatedSource {
    state: Arc<Mutex<SourceState>>,
}

impl SimulatedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source whose `set_level` fails once `n` levels have been applied
    pub fn failing_after(n: usize) -> Self {
        let source = Self::new();
        source.lock().levels_before_failure = Some(n);
        source
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn calls(&self) -> Vec<SourceCall> {
        self.lock().calls.clone()
    }

    /// Levels applied so far, in order
    pub fn levels(&self) -> Vec<f64> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                SourceCall::SetLevel(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    pub fn is_output_on(&self) -> bool {
        self.lock().output_on
    }
}

#[async_trait]
impl SourceDriver for SimulatedSource {
    async fn prepare(&self, current_limit: f64) -> BenchResult<()> {
        let mut state = self.lock();
        state.calls.push(SourceCall::Prepare { current_limit });
        state.current_limit = current_limit;
        state.output_on = true;
        Ok(())
    }

    async fn set_level(&self, volts: f64) -> BenchResult<()> {
        let mut state = self.lock();
        if let Some(remaining) = state.levels_before_failure {
            if remaining == 0 {
                return Err(BenchError::Io("simulated source stopped answering".to_string()));
            }
            state.levels_before_failure = Some(remaining - 1);
        }
        debug!("Simulated source level {volts} V");
        state.calls.push(SourceCall::SetLevel(volts));
        state.level = volts;
        Ok(())
    }

    async fn measure_current(&self) -> BenchResult<f64> {
        let mut state = self.lock();
        state.calls.push(SourceCall::MeasureCurrent);
        if !state.output_on {
            return Ok(0.0);
        }
        let current = state.level / LOAD_OHMS;
        Ok(current.clamp(-state.current_limit.abs(), state.current_limit.abs()))
    }

    async fn output_off(&self) -> BenchResult<()> {
        let mut state = self.lock();
        state.calls.push(SourceCall::OutputOff);
        state.output_on = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "simulated".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_current_follows_level_and_limit() {
        let source = SimulatedSource::new();
        source.prepare(1.0e-6).await.unwrap();
        source.set_level(0.5).await.unwrap();
        assert!((source.measure_current().await.unwrap() - 0.5e-6).abs() < 1e-15);
        source.set_level(10.0).await.unwrap();
        assert_eq!(source.measure_current().await.unwrap(), 1.0e-6);
        source.output_off().await.unwrap();
        assert!(!source.is_output_on());
        assert_eq!(source.levels(), vec![0.5, 10.0]);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let source = SimulatedSource::failing_after(1);
        assert!(source.set_level(1.0).await.is_ok());
        assert!(source.set_level(2.0).await.is_err());
        assert_eq!(source.levels(), vec![1.0]);
    }
}
