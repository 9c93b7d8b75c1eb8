// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Setpoint sequencer
//!
//! Turns a measurement mode into a lazy, finite sequence of
//! `(voltage, delay)` setpoints. Every call to [`MeasureMode::setpoints`]
//! starts a fresh pass, which is how looping processes restart the sequence.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, BenchResult};

/// One instruction applied to the voltage source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Setpoint {
    pub voltage: f64,
    /// Seconds to wait after applying the voltage
    pub delay_s: f64,
}

impl Setpoint {
    pub fn delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.delay_s.max(0.0)).unwrap_or(Duration::ZERO)
    }
}

/// How the voltages of a pass are produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeasureMode {
    /// Explicit voltages, one shared delay
    List { voltages: Vec<f64>, step_delay_s: f64 },
    /// `steps` evenly spaced voltages from `start` to `stop` inclusive
    Linspace {
        start: f64,
        stop: f64,
        steps: u32,
        step_delay_s: f64,
    },
    /// A single voltage, no delay
    Const { value: f64 },
}

impl MeasureMode {
    /// Short name of the mode, for logs
    pub fn tag(&self) -> &'static str {
        match self {
            MeasureMode::List { .. } => "list",
            MeasureMode::Linspace { .. } => "linspace",
            MeasureMode::Const { .. } => "const",
        }
    }

    /// Reject modes that cannot produce a sequence
    pub fn validate(&self) -> BenchResult<()> {
        match self {
            MeasureMode::List {
                voltages,
                step_delay_s,
            } => {
                if voltages.is_empty() {
                    return Err(BenchError::Config("vg_lst is empty".to_string()));
                }
                check_delay(*step_delay_s)
            }
            MeasureMode::Linspace {
                steps,
                step_delay_s,
                ..
            } => {
                if *steps < 1 {
                    return Err(BenchError::Config("vg_step must be at least 1".to_string()));
                }
                check_delay(*step_delay_s)
            }
            MeasureMode::Const { .. } => Ok(()),
        }
    }

    /// Number of setpoints in one pass
    pub fn len(&self) -> usize {
        match self {
            MeasureMode::List { voltages, .. } => voltages.len(),
            MeasureMode::Linspace { steps, .. } => *steps as usize,
            MeasureMode::Const { .. } => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a new pass
    pub fn setpoints(&self) -> Setpoints<'_> {
        Setpoints {
            mode: self,
            index: 0,
        }
    }
}

fn check_delay(delay_s: f64) -> BenchResult<()> {
    if delay_s.is_finite() && delay_s >= 0.0 {
        Ok(())
    } else {
        Err(BenchError::Config(format!(
            "step delay must be a non-negative number of seconds, got {delay_s}"
        )))
    }
}

/// Lazy iterator over one pass of a [`MeasureMode`]
#[derive(Debug, Clone)]
pub struct Setpoints<'a> {
    mode: &'a MeasureMode,
    index: usize,
}

impl Iterator for Setpoints<'_> {
    type Item = Setpoint;

    fn next(&mut self) -> Option<Setpoint> {
        let i = self.index;
        let point = match self.mode {
            MeasureMode::List {
                voltages,
                step_delay_s,
            } => voltages.get(i).map(|&voltage| Setpoint {
                voltage,
                delay_s: *step_delay_s,
            }),
            MeasureMode::Linspace {
                start,
                stop,
                steps,
                step_delay_s,
            } => {
                let steps = *steps as usize;
                if i >= steps {
                    None
                } else if steps == 1 {
                    Some(Setpoint {
                        voltage: *start,
                        delay_s: *step_delay_s,
                    })
                } else {
                    let step = (stop - start) / (steps - 1) as f64;
                    // Land exactly on `stop` for the last point
                    let voltage = if i == steps - 1 {
                        *stop
                    } else {
                        start + step * i as f64
                    };
                    Some(Setpoint {
                        voltage,
                        delay_s: *step_delay_s,
                    })
                }
            }
            MeasureMode::Const { value } => (i == 0).then_some(Setpoint {
                voltage: *value,
                delay_s: 0.0,
            }),
        };
        if point.is_some() {
            self.index += 1;
        }
        point
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.mode.len().saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Setpoints<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn voltages(mode: &MeasureMode) -> Vec<f64> {
        mode.setpoints().map(|p| p.voltage).collect()
    }

    #[test]
    fn test_list_mode_keeps_order() {
        let mode = MeasureMode::List {
            voltages: vec![1.0, 2.5, -1.0],
            step_delay_s: 0.5,
        };
        let points: Vec<Setpoint> = mode.setpoints().collect();
        assert_eq!(voltages(&mode), vec![1.0, 2.5, -1.0]);
        assert!(points.iter().all(|p| p.delay_s == 0.5));
    }

    #[test]
    fn test_linspace_single_step_yields_start() {
        let mode = MeasureMode::Linspace {
            start: 3.0,
            stop: 10.0,
            steps: 1,
            step_delay_s: 0.2,
        };
        assert_eq!(
            mode.setpoints().collect::<Vec<_>>(),
            vec![Setpoint {
                voltage: 3.0,
                delay_s: 0.2
            }]
        );
    }

    #[test]
    fn test_linspace_is_inclusive() {
        let mode = MeasureMode::Linspace {
            start: 0.0,
            stop: 4.0,
            steps: 5,
            step_delay_s: 1.0,
        };
        assert_eq!(voltages(&mode), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(mode.setpoints().len(), 5);

        let descending = MeasureMode::Linspace {
            start: 1.0,
            stop: 0.1,
            steps: 4,
            step_delay_s: 0.0,
        };
        let v = voltages(&descending);
        assert_eq!(v.len(), 4);
        assert_eq!(v[0], 1.0);
        assert!((v[1] - 0.7).abs() < 1e-12);
        assert_eq!(v[3], 0.1);
    }

    #[test]
    fn test_const_mode_has_no_delay() {
        let mode = MeasureMode::Const { value: 12.0 };
        assert_eq!(
            mode.setpoints().collect::<Vec<_>>(),
            vec![Setpoint {
                voltage: 12.0,
                delay_s: 0.0
            }]
        );
    }

    #[test]
    fn test_passes_restart() {
        let mode = MeasureMode::List {
            voltages: vec![1.0, 2.0],
            step_delay_s: 0.0,
        };
        let first: Vec<f64> = voltages(&mode);
        let second: Vec<f64> = voltages(&mode);
        assert_eq!(first, second);
    }

    #[test]
    fn test_validation() {
        assert!(MeasureMode::List {
            voltages: vec![],
            step_delay_s: 0.0
        }
        .validate()
        .is_err());
        assert!(MeasureMode::Linspace {
            start: 0.0,
            stop: 1.0,
            steps: 0,
            step_delay_s: 0.0
        }
        .validate()
        .is_err());
        assert!(MeasureMode::List {
            voltages: vec![1.0],
            step_delay_s: -1.0
        }
        .validate()
        .is_err());
        assert!(MeasureMode::Const { value: 0.0 }.validate().is_ok());
    }

    #[test]
    fn test_delay_conversion() {
        let point = Setpoint {
            voltage: 0.0,
            delay_s: 0.25,
        };
        assert_eq!(point.delay(), Duration::from_millis(250));
    }
}
