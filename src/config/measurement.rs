// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Measurement runner configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Settings shared by every measurement run.
///
/// # Fields
///
/// * `output_dir` - Root directory of the result tables; each run writes into
///   a timestamped sub-directory
/// * `reference_margin` - Added to the highest sample of the forced
///   acquisition to obtain the trigger level
/// * `oscill_samples` - Number of samples read from an oscilloscope channel
/// * `oscill_channel` - Oscilloscope channel used by the pulse train (0 or 1)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    pub output_dir: PathBuf,
    pub reference_margin: u16,
    pub oscill_samples: u16,
    pub oscill_channel: u8,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("measure"),
            reference_margin: 20,
            oscill_samples: 256,
            oscill_channel: 0,
        }
    }
}
