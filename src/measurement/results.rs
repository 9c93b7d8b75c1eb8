// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Result persistence
//!
//! Every run writes into its own timestamped directory. Each process gets a
//! CSV table, flushed row by row so an interrupted run keeps what it
//! measured, and optionally the plotted series as JSON.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::error::{BenchError, BenchResult};

/// Value read back at each setpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Peak register of the measurement module
    ModbusPeak,
    /// Current sense of the voltage source, in amperes
    KeithleyCurrentA,
}

impl ValueKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ValueKind::ModbusPeak => "modbus_peak",
            ValueKind::KeithleyCurrentA => "keithley_current_a",
        }
    }
}

/// One line of a result table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub timestamp: String,
    pub process_key: String,
    pub process_name: String,
    pub cycle: u64,
    pub step: u64,
    #[serde(serialize_with = "six_decimals")]
    pub voltage_v: f64,
    pub value: f64,
    pub mode: ValueKind,
    pub acq_channel: u8,
}

fn six_decimals<S: serde::Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{value:.6}"))
}

/// Local time with second resolution, as written in the tables
pub fn timestamp_now() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Create `<root>/<YYYY-mm-dd_HH-MM-SS>` and return it
pub fn create_run_directory(root: &Path) -> BenchResult<PathBuf> {
    let dir = root.join(Local::now().format("%Y-%m-%d_%H-%M-%S").to_string());
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Turn a display name into a safe file stem
///
/// Each run of characters outside word characters and `-.()` (whitespace
/// included) becomes a single `_`; leading and trailing `.`/`_` are dropped.
/// An empty result falls back to `measure`.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.trim().chars() {
        if c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '(' | ')') {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    let trimmed = out.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        "measure".to_string()
    } else {
        trimmed.to_string()
    }
}

/// CSV table of one process
pub struct ResultTable {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: usize,
}

impl ResultTable {
    pub fn create(path: PathBuf) -> BenchResult<Self> {
        let writer = csv::Writer::from_path(&path).map_err(csv_error)?;
        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }

    /// Append a row and flush it to disk
    pub fn append(&mut self, row: &ResultRow) -> BenchResult<()> {
        self.writer.serialize(row).map_err(csv_error)?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> usize {
        self.rows
    }
}

fn csv_error(e: csv::Error) -> BenchError {
    BenchError::Io(e.to_string())
}

/// Points plotted for one process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlotSeries {
    pub process_key: String,
    pub title: String,
    pub mode: Option<ValueKind>,
    /// `(voltage, value)` pairs in acquisition order
    pub points: Vec<(f64, f64)>,
}

impl PlotSeries {
    pub fn new(process_key: &str, title: &str) -> Self {
        Self {
            process_key: process_key.to_string(),
            title: title.to_string(),
            mode: None,
            points: Vec::new(),
        }
    }

    pub fn push(&mut self, row: &ResultRow) {
        self.mode = Some(row.mode);
        self.points.push((row.voltage_v, row.value));
    }

    pub fn save(&self, path: &Path) -> BenchResult<()> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| BenchError::Io(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(step: u64, voltage_v: f64, value: f64) -> ResultRow {
        ResultRow {
            timestamp: "2025-01-01T00:00:00".to_string(),
            process_key: "p1".to_string(),
            process_name: "Sweep".to_string(),
            cycle: 0,
            step,
            voltage_v,
            value,
            mode: ValueKind::KeithleyCurrentA,
            acq_channel: 1,
        }
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("Gate sweep  0-4 V"), "Gate_sweep_0-4_V");
        assert_eq!(sanitize_filename("a/b:c*d"), "a_b_c_d");
        assert_eq!(sanitize_filename("a//b"), "a_b");
        assert_eq!(sanitize_filename("U = 5 V, I < 1 mA"), "U_5_V_I_1_mA");
        assert_eq!(sanitize_filename("  .hidden_ "), "hidden");
        assert_eq!(sanitize_filename("run (2).v1"), "run_(2).v1");
        assert_eq!(sanitize_filename("///"), "measure");
        assert_eq!(sanitize_filename(""), "measure");
    }

    #[test]
    fn test_table_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");
        let mut table = ResultTable::create(path.clone()).unwrap();
        table.append(&row(0, 1.0, 0.5)).unwrap();
        table.append(&row(1, 2.25, 1e-6)).unwrap();
        assert_eq!(table.rows(), 2);

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines[0],
            "timestamp,process_key,process_name,cycle,step,voltage_v,value,mode,acq_channel"
        );
        assert_eq!(
            lines[1],
            "2025-01-01T00:00:00,p1,Sweep,0,0,1.000000,0.5,keithley_current_a,1"
        );
        assert!(lines[2].contains(",2.250000,"));
    }

    #[test]
    fn test_plot_series_saved_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut series = PlotSeries::new("p1", "Sweep");
        series.push(&row(0, 1.0, 2.0));
        let path = dir.path().join("Sweep.plot.json");
        series.save(&path).unwrap();

        let back: PlotSeries =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.points, vec![(1.0, 2.0)]);
        assert_eq!(back.mode, Some(ValueKind::KeithleyCurrentA));
    }

    #[test]
    fn test_run_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let run = create_run_directory(dir.path()).unwrap();
        assert!(run.is_dir());
        assert_eq!(run.parent(), Some(dir.path()));
    }
}
