// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-aspect margining orchestration.
//!
//! A lane runs at most two aspects, timing then voltage. For each, the spec
//! selects one of three shapes:
//!
//! * target-only: a single offset, pass iff the receiver holds Margining
//!   for the dwell;
//! * eye scan: step outward from `start_offset`, recording the max-passing
//!   and min-failing offset per side, until the target offset or until both
//!   sides have failed;
//! * eye size: find the smallest pair of positive/negative offsets whose
//!   sum covers the requested eye opening, re-anchoring the positive side
//!   when the eye turns out to be off-center.

use std::time::Duration;

use log::warn;

use crate::cmdrsp::{
    CmdRsp, STEP_ERROR_COUNT_MASK, SET_ERROR_COUNT_LIMIT, TIMING_DIR_MASK,
    VOLTAGE_DIR_MASK,
};
use crate::config::{PointStatus, TestSpec};
use crate::lane::Lane;

/// Everything `Lane::margin_point` needs to know about the aspect being
/// margined.
pub struct AspectPlan {
    pub voltage: bool,
    pub dir_mask: u8,
    /// Independent left/right (timing) or up/down (voltage) sampling.
    pub ind_dir: bool,
    pub num_steps: u32,
    /// Effective dwell per offset.
    pub dwell: Duration,
    /// Derived samples per second at the link rate.
    pub sps: f64,
    /// Whether ErrorOut is an acceptable boundary rather than a failure.
    pub err_out_ok: bool,
    /// Suppresses per-point artifacts for passing points in boundary
    /// searches.
    pub eye_scan_mode: bool,
}

/// Offset range policy after the guards of the spec are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScanRange {
    pub start: u32,
    pub target: u32,
    pub step: u32,
    pub until_fail: bool,
}

/// Clamp the spec's offsets to the lane's capability and coerce degenerate
/// strides.
pub(crate) fn plan_range(
    spec: &mut TestSpec,
    num_steps: u32,
) -> ScanRange {
    let until_fail = spec.target_offset.is_none();
    let target = match spec.target_offset {
        Some(t) if t > num_steps => {
            warn!(
                "target_offset {t} exceeds the lane's {num_steps} steps; clamping"
            );
            spec.target_offset = Some(num_steps);
            num_steps
        }
        Some(t) => t,
        None => num_steps,
    };
    let start = match spec.start_offset {
        Some(s) if s > target => {
            warn!(
                "start_offset {s} cannot be greater than target_offset \
                 {target}; adjusting it to be equal"
            );
            target
        }
        Some(s) => s,
        None => target,
    };
    let step = match spec.step {
        Some(0) => {
            warn!("step cannot be 0; adjusting it to be 1");
            1
        }
        Some(s) => s,
        None => 1,
    };
    ScanRange { start, target, step, until_fail }
}

/// Substitute the max sampling rate when the hardware reports none and there
/// is no way to ask it how much it actually sampled.
pub(crate) fn effective_rate(
    rate: u32,
    ind_error_sampler: bool,
    sample_reporting_method: bool,
) -> u32 {
    if rate == 0 && (!ind_error_sampler || !sample_reporting_method) {
        63
    } else {
        rate
    }
}

/// Samples per second: `rate` is the number of bits sampled of every 64,
/// minus one.
pub(crate) fn samples_per_second(rate: u32, speed_bps: f64) -> f64 {
    (f64::from(rate + 1) / 64.0) * speed_bps
}

/// Minimum dwell needed to observe `2^(samples/3)` bits, in whole seconds.
pub(crate) fn derived_dwell(samples: u32, sps: f64) -> Duration {
    let bit_count = (f64::from(samples) / 3.0).exp2();
    Duration::from_secs((bit_count / sps).ceil() as u64)
}

enum ScanMode {
    TargetOnly,
    EyeScan(ScanRange),
    EyeSize(f32),
}

impl Lane {
    /// Pre-margining setup: reset the receiver state and learn the lane's
    /// capability record. Runs before the receiver-wide barrier; no step
    /// command may be issued until every lane of the receiver is past its
    /// parameter reads.
    pub fn prepare(&mut self) -> crate::Result<()> {
        self.clear_error_log()?;
        self.go_to_normal_settings()?;
        self.read_parameters()
    }

    /// Run the bound test specs against this lane. Failures are recorded on
    /// the lane rather than propagated; a lane that reaches this point
    /// always produces a result.
    pub fn execute(&mut self) {
        self.pass = true;
        if self.tspec.is_some() {
            self.run_aspect(false);
        } else {
            self.note("Timing margining not specified.");
        }
        if !self.param.voltage_supported {
            // The spec is ignored, not failed; voltage margining is an
            // optional receiver feature.
            self.vspec = None;
            self.note("Voltage margining not supported.");
        } else if self.vspec.is_some() {
            self.run_aspect(true);
        } else {
            self.note("Voltage margining not specified.");
        }
    }

    fn run_aspect(&mut self, voltage: bool) {
        let Some(mut spec) =
            (if voltage { self.vspec.clone() } else { self.tspec.clone() })
        else {
            return;
        };
        let (num_steps, rate, ind_dir, dir_mask, per_step) = if voltage {
            (
                self.param.num_voltage_steps,
                self.param.sampling_rate_voltage,
                self.param.ind_up_down_voltage,
                VOLTAGE_DIR_MASK,
                self.param.voltage_per_step(),
            )
        } else {
            (
                self.param.num_timing_steps,
                self.param.sampling_rate_timing,
                self.param.ind_left_right_timing,
                TIMING_DIR_MASK,
                self.param.timing_per_step(),
            )
        };

        // The error limit is programmed once per aspect, before stepping.
        let limit = (spec.error_limit as u8) & STEP_ERROR_COUNT_MASK;
        if let Err(e) = self.cmd_rsp_echo(&CmdRsp::set(
            self.rec.number(),
            SET_ERROR_COUNT_LIMIT | limit,
        )) {
            self.note(e.to_string());
            self.pass = false;
            return;
        }

        let rate = effective_rate(
            rate,
            self.param.ind_error_sampler,
            self.param.sample_reporting_method,
        );
        let sps = samples_per_second(rate, self.speed_bps);
        let derived = derived_dwell(spec.samples, sps);
        let dwell = match spec.dwell {
            Some(d) if Duration::from_secs_f32(d) >= derived => {
                Duration::from_secs_f32(d)
            }
            _ => derived,
        };
        spec.dwell = Some(dwell.as_secs_f32());

        let range = plan_range(&mut spec, num_steps);
        let mode = if spec.start_offset.is_some() {
            Some(ScanMode::EyeScan(range))
        } else if let Some(eye) = spec.eye_size {
            let dominated = spec
                .target_offset
                .map(|t| 2.0 * t as f32 * per_step >= eye)
                .unwrap_or(false);
            if dominated {
                Some(ScanMode::TargetOnly)
            } else {
                Some(ScanMode::EyeSize(eye))
            }
        } else if spec.target_offset.is_some() {
            Some(ScanMode::TargetOnly)
        } else {
            warn!(
                "{}: either start_offset or target_offset must be \
                 specified; margining skipped",
                self.step_id
            );
            self.note(
                "Either the start_offset or the target_offset must be \
                 specified. Margining skipped.",
            );
            None
        };

        // Persist the effective spec (clamped offsets, derived dwell) so
        // the result records what actually ran.
        let effective = spec.clone();
        if voltage {
            self.vspec = Some(effective);
        } else {
            self.tspec = Some(effective);
        }

        let base = AspectPlan {
            voltage,
            dir_mask,
            ind_dir,
            num_steps,
            dwell,
            sps,
            err_out_ok: false,
            eye_scan_mode: false,
        };
        match mode {
            Some(ScanMode::TargetOnly) => {
                self.margin_target_only(&base, range.target);
            }
            Some(ScanMode::EyeScan(range)) => {
                let plan = AspectPlan {
                    err_out_ok: true,
                    eye_scan_mode: true,
                    ..base
                };
                self.scan_eye(&plan, range, spec.eye_size);
            }
            Some(ScanMode::EyeSize(eye)) => {
                let plan = AspectPlan {
                    err_out_ok: true,
                    eye_scan_mode: true,
                    ..base
                };
                let floor = spec.target_offset.unwrap_or(0);
                let step = spec.step.unwrap_or(1).max(1);
                self.size_eye(&plan, per_step, eye, floor, step);
            }
            None => {}
        }
    }

    /// Target-only mode: margin exactly the target offset, each direction
    /// when independently controllable. Any terminal state other than
    /// Margining fails the lane.
    fn margin_target_only(&mut self, plan: &AspectPlan, target: u32) {
        self.margin_point(target as u8, plan);
        if plan.ind_dir {
            self.margin_point(target as u8 | plan.dir_mask, plan);
        }
    }

    /// Eye-scan mode: walk outward from the start offset, bookkeeping the
    /// last pass before the first failure and the first failure itself, per
    /// side.
    fn scan_eye(
        &mut self,
        plan: &AspectPlan,
        range: ScanRange,
        eye_size: Option<f32>,
    ) {
        // Indexes into the aspect's point list for the four eye corners.
        let mut pass_pos: Option<usize> = None;
        let mut fail_pos: Option<usize> = None;
        let mut pass_neg: Option<usize> = None;
        let mut fail_neg: Option<usize> = None;
        // Without an independent error sampler, keeping a failing side under
        // stress can take the link down; stop revisiting a failed side.
        let stop_on_fail = !self.param.ind_error_sampler;

        let mut offset = range.start;
        loop {
            let mut pos_ok = false;
            let mut last_idx = None;
            if !(stop_on_fail && fail_pos.is_some()) {
                let point = self.margin_point(offset as u8, plan);
                let idx = self.aspect_len(plan) - 1;
                last_idx = Some(idx);
                pos_ok = point.status == PointStatus::Margining;
                if pos_ok && fail_pos.is_none() {
                    pass_pos = Some(idx);
                } else if !pos_ok && fail_pos.is_none() {
                    fail_pos = Some(idx);
                }
            }

            let mut neg_ok = pos_ok;
            if plan.ind_dir && !(stop_on_fail && fail_neg.is_some()) {
                let point =
                    self.margin_point(offset as u8 | plan.dir_mask, plan);
                let idx = self.aspect_len(plan) - 1;
                last_idx = Some(idx);
                neg_ok = point.status == PointStatus::Margining;
            }
            // Without independent directions the one measurement stands in
            // for both sides.
            if let Some(idx) = last_idx {
                if neg_ok && fail_neg.is_none() {
                    pass_neg = Some(idx);
                } else if !neg_ok && fail_neg.is_none() {
                    fail_neg = Some(idx);
                }
            }

            if offset >= range.target {
                break;
            }
            if range.until_fail && !pos_ok && !neg_ok {
                break;
            }
            if stop_on_fail && fail_pos.is_some() && fail_neg.is_some() {
                break;
            }
            offset = (offset + range.step).min(range.target);
        }

        if range.until_fail {
            self.annotate_corners(
                plan,
                [
                    (pass_pos, true, "MAX PASSING"),
                    (fail_pos, true, "MIN FAILING"),
                    (pass_neg, false, "MAX PASSING"),
                    (fail_neg, false, "MIN FAILING"),
                ],
            );
        }

        let eye = match (pass_pos, pass_neg) {
            (Some(p), Some(n)) => {
                self.point_value(plan, p) + self.point_value(plan, n)
            }
            _ => 0.0,
        };
        if pass_pos.is_some() && pass_neg.is_some() {
            self.record_eye(plan, eye);
        }
        if let Some(required) = eye_size {
            if eye < required {
                self.pass = false;
                self.note(format!(
                    "eye {eye:.4} below the required {required:.4}"
                ));
            }
        }
    }

    /// Eye-size mode: cover `eye` (UI or volts) with a positive and a
    /// negative passing offset. The first positive requirement is half the
    /// eye; when the negative side cannot cover the remainder and the
    /// positive side never failed, the eye is off-center and the positive
    /// requirement is re-anchored at the uncovered remainder.
    fn size_eye(
        &mut self,
        plan: &AspectPlan,
        per_step: f32,
        eye: f32,
        floor: u32,
        step: u32,
    ) {
        let eye_steps = (eye / per_step).ceil() as u32;
        let floor = floor.max(1);

        if !plan.ind_dir {
            // Symmetric sampling: one passing offset proves both sides.
            let need = eye_steps.div_ceil(2).min(plan.num_steps);
            let found = self.descend_for_pass(plan, false, need, floor, step);
            if let Some(off) = found.0 {
                let eye_found = 2.0 * off as f32 * per_step;
                self.record_eye(plan, eye_found);
                if eye_found < eye {
                    self.pass = false;
                    self.note(format!(
                        "eye {eye_found:.4} below the required {eye:.4}"
                    ));
                }
            } else {
                self.pass = false;
                self.note("no passing offset found for the eye test");
            }
            return;
        }

        let mut pos_req = (eye_steps - eye_steps / 2).min(plan.num_steps);
        loop {
            let (pos_pass, pos_failed) =
                self.descend_for_pass(plan, false, pos_req, floor, step);
            let Some(pos_pass) = pos_pass else {
                self.pass = false;
                self.note("positive side of the eye never passed");
                return;
            };

            let neg_req = eye_steps.saturating_sub(pos_pass);
            let (neg_pass, _) = if neg_req == 0 {
                // The positive side alone covers the eye.
                (Some(0), false)
            } else {
                self.descend_for_pass(
                    plan,
                    true,
                    neg_req.min(plan.num_steps),
                    floor,
                    step,
                )
            };

            let covered = neg_pass
                .map(|n| pos_pass + n >= eye_steps)
                .unwrap_or(false);
            if covered {
                let n = neg_pass.unwrap_or(0);
                self.record_eye(plan, (pos_pass + n) as f32 * per_step);
                return;
            }

            if pos_failed || pos_req >= plan.num_steps {
                // The positive boundary is known (or exhausted); the eye
                // cannot be covered.
                self.pass = false;
                let found =
                    (pos_pass + neg_pass.unwrap_or(0)) as f32 * per_step;
                self.record_eye(plan, found);
                self.note(format!(
                    "eye {found:.4} below the required {eye:.4}"
                ));
                return;
            }

            // Off-center toward positive: re-anchor so the two sides sum to
            // the eye, or grow by one stride when the negative side gave
            // nothing to anchor on.
            let re_anchored = match neg_pass {
                Some(n) if n > 0 => eye_steps - n,
                _ => pos_req + step,
            };
            pos_req = re_anchored.max(pos_req + step).min(plan.num_steps);
        }
    }

    /// Walk one side downward from `from` until an offset passes. Returns
    /// the passing offset and whether any offset failed on the way.
    fn descend_for_pass(
        &mut self,
        plan: &AspectPlan,
        negative: bool,
        from: u32,
        floor: u32,
        step: u32,
    ) -> (Option<u32>, bool) {
        let mask = if negative { plan.dir_mask } else { 0 };
        let mut failed = false;
        let mut offset = from.max(floor);
        loop {
            let point = self.margin_point(offset as u8 | mask, plan);
            if point.status == PointStatus::Margining {
                return (Some(offset), failed);
            }
            failed = true;
            if offset <= floor {
                return (None, failed);
            }
            offset = offset.saturating_sub(step).max(floor);
        }
    }

    fn aspect_len(&self, plan: &AspectPlan) -> usize {
        if plan.voltage {
            self.vsteps.len()
        } else {
            self.tsteps.len()
        }
    }

    fn point_value(&self, plan: &AspectPlan, idx: usize) -> f32 {
        let point = if plan.voltage {
            &self.vsteps[idx]
        } else {
            &self.tsteps[idx]
        };
        point.voltage.or(point.percent_ui).unwrap_or(0.0)
    }

    fn record_eye(&mut self, plan: &AspectPlan, eye: f32) {
        if plan.voltage {
            self.eye_height = Some(eye);
        } else {
            self.eye_width = Some(eye);
        }
    }

    fn annotate_corners(
        &mut self,
        plan: &AspectPlan,
        corners: [(Option<usize>, bool, &str); 4],
    ) {
        for (idx, positive, verdict) in corners {
            let Some(idx) = idx else { continue };
            let side = match (plan.voltage, positive) {
                (true, true) => "TOP",
                (true, false) => "BOTTOM",
                (false, true) => "RIGHT",
                (false, false) => "LEFT",
            };
            let name = format!("EYE CORNER {side} {verdict}");
            let points = if plan.voltage {
                &mut self.vsteps
            } else {
                &mut self.tsteps
            };
            let point = &mut points[idx];
            log::info!(
                "{}: {}: {:.4} offset {}",
                self.step_id,
                name,
                point.voltage.or(point.percent_ui).unwrap_or(0.0),
                point.steps
            );
            point.info = Some(name);
        }
    }
}
