// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Measurement plan
//!
//! A plan is a YAML (or JSON) document mapping a process key to a process
//! definition:
//!
//! ```yaml
//! sweep_1:
//!   name: "Gate sweep 0-4 V"
//!   calibrate_mode: false
//!   measure_settings:
//!     linspace_mode: { vg_start: 0.0, vg_stop: 4.0, vg_step: 5, step_delay_s: 0.5 }
//!     acq_channel: 1
//!   current_limit: 0.001
//!   loop: false
//!   save_table: true
//!   save_plot: true
//! ```
//!
//! The document is checked against `resources/plan.schema.json`, then every
//! process is checked for exactly one measurement mode. Processes keep the
//! order in which they appear in the document.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::error::{BenchError, BenchResult};
use crate::sequencer::MeasureMode;

/// Explicit list of voltages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvinceMode {
    pub vg_lst: Vec<f64>,
    pub step_delay_s: f64,
}

/// Linear sweep; `vg_step` is the number of points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinspaceMode {
    pub vg_start: f64,
    pub vg_stop: f64,
    pub vg_step: u32,
    pub step_delay_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstMode {
    pub vg_cnst: f64,
}

fn default_acq_channel() -> u8 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureSettings {
    #[serde(default)]
    pub convince_mode: Option<ConvinceMode>,
    #[serde(default)]
    pub linspace_mode: Option<LinspaceMode>,
    #[serde(default)]
    pub const_mode: Option<ConstMode>,
    /// Peak register read in calibration mode (1 or 2)
    #[serde(default = "default_acq_channel")]
    pub acq_channel: u8,
}

impl MeasureSettings {
    /// The single configured mode
    ///
    /// ### Errors
    ///
    /// `Config` when zero or several modes are set, or when the mode itself
    /// cannot produce a sequence.
    pub fn mode(&self) -> BenchResult<MeasureMode> {
        let mode = match (&self.convince_mode, &self.linspace_mode, &self.const_mode) {
            (Some(list), None, None) => MeasureMode::List {
                voltages: list.vg_lst.clone(),
                step_delay_s: list.step_delay_s,
            },
            (None, Some(sweep), None) => MeasureMode::Linspace {
                start: sweep.vg_start,
                stop: sweep.vg_stop,
                steps: sweep.vg_step,
                step_delay_s: sweep.step_delay_s,
            },
            (None, None, Some(constant)) => MeasureMode::Const {
                value: constant.vg_cnst,
            },
            _ => {
                return Err(BenchError::Config(
                    "Exactly one measure mode must be set".to_string(),
                ))
            }
        };
        mode.validate()?;
        Ok(mode)
    }
}

/// Serial settings carried by a calibration process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusSettings {
    /// Unit id of the measurement module
    pub id: u8,
    #[serde(rename = "bodrate", alias = "baud_rate")]
    pub baud_rate: u32,
    /// Serial port
    pub com: String,
    #[serde(default = "default_modbus_timeout")]
    pub timeout_s: f64,
}

fn default_modbus_timeout() -> f64 {
    1.0
}

impl ModbusSettings {
    pub fn timeout_ms(&self) -> u64 {
        (self.timeout_s * 1000.0).round() as u64
    }
}

/// One process of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Display name, also used for the output file names
    pub name: String,
    /// Read the MPP peak register instead of the source current
    pub calibrate_mode: bool,
    #[serde(default)]
    pub modbus_settings: Option<ModbusSettings>,
    pub measure_settings: MeasureSettings,
    /// Source current limit in amperes
    pub current_limit: f64,
    /// Repeat the sequence until cancelled
    #[serde(rename = "loop")]
    pub repeat: bool,
    pub save_table: bool,
    pub save_plot: bool,
}

impl ProcessDefinition {
    /// Check the rules the schema cannot express
    pub fn validate(&self) -> BenchResult<()> {
        self.measure_settings.mode()?;
        if !matches!(self.measure_settings.acq_channel, 1 | 2) {
            return Err(BenchError::Config(format!(
                "acq_channel must be 1 or 2, got {}",
                self.measure_settings.acq_channel
            )));
        }
        if !(self.current_limit.is_finite() && self.current_limit > 0.0) {
            return Err(BenchError::Config(format!(
                "current_limit must be positive, got {}",
                self.current_limit
            )));
        }
        if let Some(settings) = &self.modbus_settings {
            if settings.com.trim().is_empty() {
                return Err(BenchError::Config("modbus_settings.com is empty".to_string()));
            }
            if settings.timeout_s < 0.1 {
                return Err(BenchError::Config(format!(
                    "modbus_settings.timeout_s must be at least 0.1, got {}",
                    settings.timeout_s
                )));
            }
        }
        Ok(())
    }
}

/// Ordered set of processes
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeasurementPlan {
    processes: Vec<(String, ProcessDefinition)>,
}

impl MeasurementPlan {
    pub fn new(processes: Vec<(String, ProcessDefinition)>) -> Self {
        Self { processes }
    }

    /// Load and validate a plan file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading measurement plan from {:?}", path);
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read measurement plan at {:?}", path))?;
        Self::parse(&contents).with_context(|| format!("Invalid measurement plan {:?}", path))
    }

    /// Parse and validate a plan document
    pub fn parse(contents: &str) -> Result<Self> {
        let yaml_value: serde_yml::Value =
            serde_yml::from_str(contents).context("Failed to parse measurement plan")?;

        let json_value = serde_json::to_value(&yaml_value)
            .context("Failed to convert measurement plan to JSON for validation")?;
        let schema_str = include_str!("../../resources/plan.schema.json");
        let schema: serde_json::Value =
            serde_json::from_str(schema_str).context("Failed to parse plan JSON schema")?;
        let validator = jsonschema::draft202012::options()
            .should_validate_formats(true)
            .build(&schema)?;
        if let Err(error) = validator.validate(&json_value) {
            error!("Measurement plan validation error");
            anyhow::bail!("Measurement plan validation failed: {}", error);
        }

        let serde_yml::Value::Mapping(mapping) = yaml_value else {
            anyhow::bail!("A measurement plan must be a mapping of process definitions");
        };

        let mut processes = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let key = key
                .as_str()
                .map(str::to_string)
                .context("Process keys must be strings")?;
            let definition: ProcessDefinition = serde_yml::from_value(value)
                .with_context(|| format!("Failed to deserialize process '{key}'"))?;
            definition
                .validate()
                .with_context(|| format!("Process '{key}' is invalid"))?;
            processes.push((key, definition));
        }
        if processes.is_empty() {
            anyhow::bail!("Measure process list is empty");
        }
        Ok(Self { processes })
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&ProcessDefinition> {
        self.processes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, definition)| definition)
    }

    /// Processes in document order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProcessDefinition)> {
        self.processes.iter().map(|(k, d)| (k.as_str(), d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
zeta:
  name: "Zeta list"
  calibrate_mode: false
  measure_settings:
    convince_mode: { vg_lst: [1.0, 2.5, -1.0], step_delay_s: 0.1 }
  current_limit: 0.001
  loop: false
  save_table: true
  save_plot: false
alpha:
  name: "Alpha calibration"
  calibrate_mode: true
  modbus_settings: { id: 14, bodrate: 115200, com: "/dev/ttyUSB0" }
  measure_settings:
    const_mode: { vg_cnst: 3.3 }
    acq_channel: 2
  current_limit: 0.01
  loop: true
  save_table: true
  save_plot: true
"#;

    #[test]
    fn test_plan_keeps_document_order() {
        let plan = MeasurementPlan::parse(PLAN).unwrap();
        let keys: Vec<&str> = plan.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);

        let alpha = plan.get("alpha").unwrap();
        assert!(alpha.repeat);
        assert_eq!(alpha.measure_settings.acq_channel, 2);
        let modbus = alpha.modbus_settings.as_ref().unwrap();
        assert_eq!(modbus.baud_rate, 115_200);
        assert_eq!(modbus.timeout_s, 1.0);
        assert_eq!(
            alpha.measure_settings.mode().unwrap(),
            MeasureMode::Const { value: 3.3 }
        );
    }

    #[test]
    fn test_two_modes_are_rejected() {
        let settings = MeasureSettings {
            convince_mode: Some(ConvinceMode {
                vg_lst: vec![1.0],
                step_delay_s: 0.0,
            }),
            linspace_mode: None,
            const_mode: Some(ConstMode { vg_cnst: 1.0 }),
            acq_channel: 1,
        };
        assert!(matches!(settings.mode(), Err(BenchError::Config(_))));
    }

    #[test]
    fn test_no_mode_is_rejected() {
        let settings = MeasureSettings {
            convince_mode: None,
            linspace_mode: None,
            const_mode: None,
            acq_channel: 1,
        };
        assert!(matches!(settings.mode(), Err(BenchError::Config(_))));
    }

    #[test]
    fn test_json_plans_are_accepted() {
        let json = r#"{"p1": {"name": "json", "calibrate_mode": false,
            "measure_settings": {"linspace_mode": {"vg_start": 0, "vg_stop": 4, "vg_step": 5, "step_delay_s": 0}},
            "current_limit": 0.001, "loop": false, "save_table": false, "save_plot": false}}"#;
        let plan = MeasurementPlan::parse(json).unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_multi_mode_document_fails_before_anything_runs() {
        let doc = PLAN.replace(
            "const_mode: { vg_cnst: 3.3 }",
            "const_mode: { vg_cnst: 3.3 }\n    convince_mode: { vg_lst: [1.0], step_delay_s: 0.0 }",
        );
        assert!(MeasurementPlan::parse(&doc).is_err());
    }
}
