// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Result analysis: the pass/fail tally and the flat CSV for plotting.
//!
//! The CSV re-derives the margin values from steps and the recorded lane
//! parameters instead of trusting the floats in the result, so a result
//! file with corrected parameters can be re-plotted as-is.

use std::io::Write;

use crate::config::{
    Direction, LinkMarginTest, MarginPoint, PointStatus, Receiver,
};
use crate::Result;

/// Pass-fail rollup for one (pseudo)port.
#[derive(Debug, Clone)]
pub struct PortResult {
    pub bdf: String,
    pub receiver: Receiver,
    pub num_lane_tested: usize,
    pub num_lane_passed: usize,
    pub message: String,
}

/// Pass-fail rollup for the whole run.
#[derive(Debug, Clone, Default)]
pub struct TestResult {
    pub num_lane_tested: usize,
    pub num_lane_passed: usize,
    pub port_results: Vec<PortResult>,
    pub pass: bool,
}

/// Tally the run: every tested lane must pass for the run to pass.
pub fn tally(result: &LinkMarginTest) -> TestResult {
    let mut res = TestResult { pass: true, ..Default::default() };
    for lm in &result.link_margin {
        // Group the flat lane list back into receivers, preserving the
        // receiver-number order they were tested in.
        let mut receivers: Vec<Receiver> = Vec::new();
        for lane in &lm.receiver_lanes {
            if let Some(rec) = lane.receiver {
                if !receivers.contains(&rec) {
                    receivers.push(rec);
                }
            }
        }
        for rec in receivers {
            let bdf = if rec == Receiver::UspF6 {
                lm.usp_bdf.clone()
            } else {
                lm.dsp_bdf.clone()
            }
            .unwrap_or_default();
            let mut port = PortResult {
                bdf,
                receiver: rec,
                num_lane_tested: 0,
                num_lane_passed: 0,
                message: String::new(),
            };
            let mut failed = false;
            for lane in
                lm.receiver_lanes.iter().filter(|l| l.receiver == Some(rec))
            {
                port.num_lane_tested += 1;
                res.num_lane_tested += 1;
                if lane.pass == Some(true) {
                    port.num_lane_passed += 1;
                    res.num_lane_passed += 1;
                } else {
                    failed = true;
                    res.pass = false;
                }
            }
            port.message = format!(
                "{} on {}: {} lanes tested, {} passed. {}",
                rec,
                port.bdf,
                port.num_lane_tested,
                port.num_lane_passed,
                if failed { "(Failed)" } else { "" }
            );
            res.port_results.push(port);
        }
    }
    res
}

const COLUMNS: &[&str] = &[
    "BDF",
    "Receiver",
    "Lane",
    "Direction",
    "Steps",
    "Status",
    "ErrorCount",
    "Samples",
    "Log10BER",
    "Tmargin",
    "Tlane",
    "Vmargin",
    "Vlane",
    "Corner",
    "Left[UI]",
    "Right[UI]",
    "Bottom[V]",
    "Top[V]",
];

// Column indexes into a CSV row.
const C_BDF: usize = 0;
const C_RECEIVER: usize = 1;
const C_LANE: usize = 2;
const C_DIRECTION: usize = 3;
const C_STEPS: usize = 4;
const C_STATUS: usize = 5;
const C_ERROR_COUNT: usize = 6;
const C_SAMPLES: usize = 7;
const C_LOG10BER: usize = 8;
const C_TMARGIN: usize = 9;
const C_TLANE: usize = 10;
const C_VMARGIN: usize = 11;
const C_VLANE: usize = 12;
const C_CORNER: usize = 13;
const C_LEFT: usize = 14;
const C_RIGHT: usize = 15;
const C_BOTTOM: usize = 16;
const C_TOP: usize = 17;

fn status_name(status: PointStatus) -> &'static str {
    match status {
        PointStatus::Unknown => "UNKNOWN",
        PointStatus::ErrorOut => "ERROR_OUT",
        PointStatus::SettingUp => "SETTING_UP",
        PointStatus::Margining => "MARGINING",
        PointStatus::Nak => "NAK",
    }
}

fn direction_name(direction: Direction) -> &'static str {
    match direction {
        Direction::Right => "RIGHT",
        Direction::Left => "LEFT",
        Direction::Up => "UP",
        Direction::Down => "DOWN",
        Direction::Lr => "LR",
        Direction::Ud => "UD",
    }
}

/// The eye-corner key letters: passing corners get the gamer keys, failing
/// corners the vi keys.
fn corner_letter(point: &MarginPoint) -> Option<&'static str> {
    let info = point.info.as_deref()?;
    if info.contains("MAX PASSING") {
        match point.direction {
            Direction::Left => Some("A"),
            Direction::Right => Some("D"),
            Direction::Up => Some("W"),
            Direction::Down => Some("S"),
            _ => None,
        }
    } else if info.contains("MIN FAILING") {
        match point.direction {
            Direction::Left => Some("H"),
            Direction::Right => Some("L"),
            Direction::Up => Some("K"),
            Direction::Down => Some("J"),
            _ => None,
        }
    } else {
        None
    }
}

fn write_row(w: &mut impl Write, row: &[String]) -> Result<()> {
    writeln!(w, "{}", row.join(","))?;
    Ok(())
}

/// Flatten a result into one CSV row per margin point, with an extra
/// eye-corner summary row per lane that found its eye boundary.
pub fn convert_to_csv(
    result: &LinkMarginTest,
    w: &mut impl Write,
) -> Result<()> {
    write_row(w, &COLUMNS.iter().map(|s| s.to_string()).collect::<Vec<_>>())?;

    // Offsets the lane index per link and receiver so every lane lands on
    // its own plot row.
    let mut link_base = 0u32;
    for lm in &result.link_margin {
        if lm.receiver_lanes.is_empty() {
            continue;
        }
        // Make the port width a multiple of 5 to leave a gap and ease
        // indexing.
        let width = lm
            .receiver_lanes
            .iter()
            .map(|l| l.lane_number)
            .max()
            .unwrap_or(0);
        let width = ((width / 5) + 1) * 5;
        let mut port_start = [0u32; Receiver::COUNT];
        let mut n = 0u32;
        for i in 1..Receiver::COUNT as u8 {
            let rec = Receiver::from_number(i).unwrap();
            if lm
                .receiver_lanes
                .iter()
                .any(|l| l.receiver == Some(rec))
            {
                n += width;
                port_start[usize::from(i)] = n;
            }
        }
        n += width;

        let bdf = lm.usp_bdf.clone().unwrap_or_default();
        let mut row = vec![String::new(); COLUMNS.len()];
        // Quoted so spreadsheet tools do not mistake a BDF for a date.
        row[C_BDF] = format!("\"{bdf}\"");
        write_row(w, &row)?;

        for lane in &lm.receiver_lanes {
            let rec = lane.receiver.unwrap_or(Receiver::Reserved);
            let mut eye = vec![String::new(); COLUMNS.len()];
            eye[C_BDF] = format!("\"{bdf}\"");
            eye[C_RECEIVER] = rec.to_string();
            eye[C_LANE] = lane.lane_number.to_string();
            let mut eye_found = false;

            let plot_lane = link_base
                + port_start[usize::from(rec.number())]
                + lane.lane_number;
            let param = lane.lane_parameter.clone().unwrap_or_default();
            for (voltage, point) in lane
                .timing_margins
                .iter()
                .map(|p| (false, p))
                .chain(lane.voltage_margins.iter().map(|p| (true, p)))
            {
                let mut row = vec![String::new(); COLUMNS.len()];
                row[C_RECEIVER] = rec.to_string();
                row[C_LANE] = lane.lane_number.to_string();
                row[C_DIRECTION] = direction_name(point.direction).into();
                row[C_STEPS] = point.steps.to_string();
                row[C_STATUS] = status_name(point.status).into();
                row[C_ERROR_COUNT] = point.error_count.to_string();
                if let Some(samples) = point.sample_count {
                    row[C_SAMPLES] = samples.to_string();
                    row[C_LOG10BER] = if point.error_count == 0 {
                        "0".into()
                    } else {
                        let bits = (f64::from(samples) / 3.0).exp2();
                        format!(
                            "{:.6}",
                            (f64::from(point.error_count) / bits).log10()
                        )
                    };
                }

                // Recalculate the margin from steps so corrected lane
                // parameters propagate into the plot.
                if voltage {
                    let mut margin = point.steps as f32
                        * param.voltage_per_step();
                    if point.direction == Direction::Down {
                        margin = -margin;
                    }
                    row[C_VMARGIN] = format!("{margin:.6}");
                    row[C_VLANE] = plot_lane.to_string();
                } else {
                    let mut margin =
                        point.steps as f32 * param.timing_per_step();
                    if point.direction == Direction::Left {
                        margin = -margin;
                    }
                    row[C_TMARGIN] = format!("{margin:.6}");
                    row[C_TLANE] = plot_lane.to_string();
                }

                if let Some(letter) = corner_letter(point) {
                    row[C_CORNER] = letter.into();
                    let margin = if voltage {
                        row[C_VMARGIN].clone()
                    } else {
                        row[C_TMARGIN].clone()
                    };
                    match letter {
                        "A" => eye[C_LEFT] = margin,
                        "D" => eye[C_RIGHT] = margin,
                        "W" => eye[C_TOP] = margin,
                        "S" => eye[C_BOTTOM] = margin,
                        _ => {}
                    }
                    if matches!(letter, "A" | "D" | "W" | "S") {
                        eye[C_CORNER] = "eye corners".into();
                        eye_found = true;
                    }
                }
                write_row(w, &row)?;
            }
            if eye_found {
                write_row(w, &eye)?;
            }
        }
        link_base += n;
    }
    Ok(())
}
