// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The test specification and result schema.
//!
//! One [`LinkMarginTest`] serves as both input and output: the input carries
//! link filters and test specs, and the result is the same record with the
//! discovered link identity and the accumulated per-lane margins filled in.
//! The schema is accepted and emitted equivalently as JSON or TOML, chosen
//! by file extension.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The receiver number addressed by a margin command. Three bits on the
/// wire; Broadcast and Reserved are never legal in a test spec.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Receiver {
    Broadcast,
    DspA1,
    RetimerUpB2,
    RetimerDownC3,
    RetimerUpD4,
    RetimerDownE5,
    UspF6,
    Reserved,
}

impl Receiver {
    pub const COUNT: usize = 8;

    /// The wire encoding, 0..=7.
    pub fn number(&self) -> u8 {
        match self {
            Receiver::Broadcast => 0,
            Receiver::DspA1 => 1,
            Receiver::RetimerUpB2 => 2,
            Receiver::RetimerDownC3 => 3,
            Receiver::RetimerUpD4 => 4,
            Receiver::RetimerDownE5 => 5,
            Receiver::UspF6 => 6,
            Receiver::Reserved => 7,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            0 => Some(Receiver::Broadcast),
            1 => Some(Receiver::DspA1),
            2 => Some(Receiver::RetimerUpB2),
            3 => Some(Receiver::RetimerDownC3),
            4 => Some(Receiver::RetimerUpD4),
            5 => Some(Receiver::RetimerDownE5),
            6 => Some(Receiver::UspF6),
            7 => Some(Receiver::Reserved),
            _ => None,
        }
    }

    /// Whether a test spec may address this receiver at all.
    pub fn is_marginable(&self) -> bool {
        !matches!(self, Receiver::Broadcast | Receiver::Reserved)
    }

    /// Receivers implemented inside a retimer.
    pub fn is_retimer(&self) -> bool {
        matches!(
            self,
            Receiver::RetimerUpB2
                | Receiver::RetimerDownC3
                | Receiver::RetimerUpD4
                | Receiver::RetimerDownE5
        )
    }
}

impl std::fmt::Display for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Receiver::Broadcast => "broadcast",
            Receiver::DspA1 => "dsp_a1",
            Receiver::RetimerUpB2 => "retimer_up_b2",
            Receiver::RetimerDownC3 => "retimer_down_c3",
            Receiver::RetimerUpD4 => "retimer_up_d4",
            Receiver::RetimerDownE5 => "retimer_down_e5",
            Receiver::UspF6 => "usp_f6",
            Receiver::Reserved => "reserved",
        };
        f.write_str(s)
    }
}

/// Which eye axis a spec margins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Aspect {
    Timing,
    Voltage,
}

/// Direction of a margin step. `Lr` and `Ud` cover receivers without
/// independent left/right or up/down sampling, which shift both sides at
/// once.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Right,
    Left,
    Up,
    Down,
    Lr,
    Ud,
}

impl Direction {
    /// True for right/up/combined, false for left/down.
    pub fn is_positive(&self) -> bool {
        !matches!(self, Direction::Left | Direction::Down)
    }
}

/// Terminal state of a margin point.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PointStatus {
    Unknown,
    ErrorOut,
    SettingUp,
    Margining,
    Nak,
}

/// One margining request against one receiver, for one aspect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    pub receiver: Receiver,
    pub aspect: Aspect,
    /// Logarithmic sample-count target: bits = 2^(samples/3). 0..=127.
    pub samples: u32,
    /// Minimum dwell per offset, seconds. Overridden upward when the sample
    /// target needs longer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dwell: Option<f32>,
    /// Error-count limit programmed into the receiver, 0..=63.
    pub error_limit: u32,
    /// First offset of an eye scan, in receiver step units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_offset: Option<u32>,
    /// Final (or sole) offset, in receiver step units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_offset: Option<u32>,
    /// Scan stride, in receiver step units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    /// Lanes to test; empty means all lanes of the link.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lane_number: Vec<u32>,
    /// Required eye opening: UI for timing, volts for voltage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eye_size: Option<f32>,
}

/// Margining capability parameters observed from one lane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaneParameters {
    pub ind_error_sampler: bool,
    /// True when the receiver reports a rate, false when it counts.
    pub sample_reporting_method: bool,
    pub ind_left_right_timing: bool,
    pub ind_up_down_voltage: bool,
    pub voltage_supported: bool,
    pub num_voltage_steps: u32,
    pub num_timing_steps: u32,
    pub max_timing_offset: u32,
    pub max_voltage_offset: u32,
    pub sampling_rate_voltage: u32,
    pub sampling_rate_timing: u32,
    pub max_lanes: u32,
}

impl LaneParameters {
    /// Fraction of UI one timing step moves the sampler.
    pub fn timing_per_step(&self) -> f32 {
        self.max_timing_offset as f32
            / (self.num_timing_steps as f32 * 100.0)
    }

    /// Volts one voltage step moves the sampler.
    pub fn voltage_per_step(&self) -> f32 {
        self.max_voltage_offset as f32
            / (self.num_voltage_steps as f32 * 100.0)
    }
}

/// The result of margining one offset: the atom of the output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginPoint {
    pub direction: Direction,
    pub steps: u32,
    pub status: PointStatus,
    pub error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent_ui: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Accumulated results for one lane of one receiver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaneResult {
    pub lane_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<Receiver>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eye_width: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eye_height: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tspec: Option<TestSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vspec: Option<TestSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane_parameter: Option<LaneParameters>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timing_margins: Vec<MarginPoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub voltage_margins: Vec<MarginPoint>,
}

/// One link to test: a device filter plus the specs to run on it. In a
/// result, also the discovered identity and the per-lane margins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkMargin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bus: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usp_bdf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsp_bdf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_specs: Vec<TestSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub receiver_lanes: Vec<LaneResult>,
}

/// The whole test: a list of link entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkMarginTest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub link_margin: Vec<LinkMargin>,
}

fn is_json(path: &Path) -> bool {
    path.extension().map(|e| e.eq_ignore_ascii_case("json")).unwrap_or(false)
}

impl LinkMarginTest {
    /// Read a spec or result file; `.json` selects JSON, anything else the
    /// TOML text form.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;
        if is_json(path) {
            serde_json::from_str(&data)
                .map_err(|e| Error::Config(e.to_string()))
        } else {
            toml::from_str(&data).map_err(|e| Error::Config(e.to_string()))
        }
    }

    /// Serialize in the encoding implied by the path's extension.
    pub fn encode_for(&self, path: impl AsRef<Path>) -> Result<String> {
        if is_json(path.as_ref()) {
            serde_json::to_string_pretty(self)
                .map_err(|e| Error::Config(e.to_string()))
        } else {
            toml::to_string_pretty(self)
                .map_err(|e| Error::Config(e.to_string()))
        }
    }

    /// Write a spec or result file, encoding by extension.
    pub fn store(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = self.encode_for(&path)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}
