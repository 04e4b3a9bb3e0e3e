// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-lane LMR protocol engine.
//!
//! A lane owns its slice of the margining register block (`lmr_base + 8 +
//! 4·lane` for the control word, two bytes above for the status word) and
//! everything it has measured. All traffic follows the protocol's required
//! shape: a No Command broadcast, then the command, then polling the status
//! word until the response matches by receiver and type (and payload, for
//! echoed commands).

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, trace, warn};

use crate::cmdrsp::{
    CmdRsp, ExecutionStatus, MSK_MAX_LANES, MSK_MAX_TIMING_OFFSET,
    MSK_MAX_VOLTAGE_OFFSET, MSK_NUM_TIMING_STEPS, MSK_NUM_VOLTAGE_STEPS,
    MSK_SAMPLE_COUNT, MSK_SAMPLING_RATE_TIMING, MSK_SAMPLING_RATE_VOLTAGE,
    MSK_IND_ERROR_SAMPLER, MSK_IND_LEFT_RIGHT_TIMING, MSK_IND_UP_DOWN_VOLTAGE,
    MSK_SAMPLE_REPORTING_METHOD, MSK_VOLTAGE_SUPPORTED,
    RPT_CONTROL_CAPABILITIES, RPT_MAX_LANES, RPT_MAX_TIMING_OFFSET,
    RPT_MAX_VOLTAGE_OFFSET, RPT_NUM_TIMING_STEPS, RPT_NUM_VOLTAGE_STEPS,
    RPT_SAMPLE_COUNT, RPT_SAMPLING_RATE_TIMING, RPT_SAMPLING_RATE_VOLTAGE,
    SET_CLEAR_ERROR_LOG, SET_GO_TO_NORMAL_SETTINGS,
};
use crate::config::{
    Direction, LaneParameters, MarginPoint, PointStatus, Receiver, TestSpec,
};
use crate::eye::AspectPlan;
use crate::ocp::OcpStream;
use crate::pci::{Bdf, ConfigSpace};
use crate::{Error, Result};

/// Minimum wait between poking the lane registers. The spec requires 10 µs
/// between commands; a little extra is added.
pub const CMD_WAIT: Duration = Duration::from_micros(12);
/// Per-command response timeout, above the spec's 10 ms minimum.
pub const CMD_TIMEOUT: Duration = Duration::from_millis(12);
/// Interval between step-status polls. At Gen5 rates, 3 ms covers roughly
/// 1e8 samples.
pub const MARGIN_WAIT: Duration = Duration::from_millis(3);
/// Setup timeout for a step command. The spec allows 200 ms; some devices
/// need far longer, so the tool tolerates a full second.
pub const MARGIN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Max-offset report fields reading zero mean "unreported"; the margining
/// math then assumes the spec ceiling of 50.
const UNREPORTED_MAX_OFFSET: u32 = 50;

/// One receiver lane: protocol endpoint plus its accumulated results.
pub struct Lane {
    cs: Arc<ConfigSpace>,
    bdf: Bdf,
    /// Control-word offset in config space.
    addr: u16,
    pub lane_number: u32,
    pub rec: Receiver,
    /// Link line rate, bits per second.
    pub speed_bps: f64,
    pub param: LaneParameters,
    pub tspec: Option<TestSpec>,
    pub vspec: Option<TestSpec>,
    pub tsteps: Vec<MarginPoint>,
    pub vsteps: Vec<MarginPoint>,
    pub eye_width: Option<f32>,
    pub eye_height: Option<f32>,
    /// Accumulated notes and error text, " | " separated.
    pub msg: String,
    pub pass: bool,
    pub(crate) step_id: String,
    pub(crate) ocp: Option<Arc<OcpStream>>,
    pub(crate) hwinfo: String,
}

impl Lane {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cs: Arc<ConfigSpace>,
        bdf: Bdf,
        lane_number: u32,
        lmr_base: u16,
        rec: Receiver,
        speed_bps: f64,
        ocp: Option<Arc<OcpStream>>,
        hwinfo: String,
    ) -> Self {
        // 4 bytes of registers per lane, 8 bytes past the capability header.
        let addr = lmr_base + 8 + (lane_number as u16) * 4;
        let step_id =
            format!("bus{:02x}-rec{}-ln{:02}", bdf.bus, rec, lane_number);
        Self {
            cs,
            bdf,
            addr,
            lane_number,
            rec,
            speed_bps,
            param: LaneParameters::default(),
            tspec: None,
            vspec: None,
            tsteps: Vec::new(),
            vsteps: Vec::new(),
            eye_width: None,
            eye_height: None,
            msg: String::new(),
            pass: false,
            step_id,
            ocp,
            hwinfo,
        }
    }

    pub(crate) fn note(&mut self, text: impl AsRef<str>) {
        self.msg.push_str(text.as_ref());
        self.msg.push_str(" | ");
    }

    /// Re-read the status word without issuing a new command.
    fn read_response(&self) -> Result<CmdRsp> {
        Ok(CmdRsp::decode(self.cs.read_word(self.bdf, self.addr + 2)?))
    }

    /// Write one command and poll for its response.
    ///
    /// The response must carry the command's receiver and type with the
    /// receiver usage model; echoed commands (`match_payload`) additionally
    /// require the payload to reflect back.
    pub fn cmd_rsp_base(
        &self,
        cmd: &CmdRsp,
        match_payload: bool,
    ) -> Result<CmdRsp> {
        self.cs.write_word(self.bdf, self.addr, cmd.encode())?;
        let start = Instant::now();
        let mut rsp;
        loop {
            std::thread::sleep(CMD_WAIT);
            rsp = self.read_response()?;
            if rsp.rec == cmd.rec
                && rsp.typ == cmd.typ
                && rsp.usage == 0
                && (!match_payload || rsp.payload == cmd.payload)
            {
                trace!(
                    "{}: cmd {:#06x} -> rsp {:#06x}",
                    self.step_id,
                    cmd.encode(),
                    rsp.encode()
                );
                return Ok(rsp);
            }
            if start.elapsed() >= CMD_TIMEOUT {
                break;
            }
        }
        Err(Error::CommandTimeout {
            match_payload,
            cmd: cmd.encode(),
            rsp: rsp.encode(),
        })
    }

    /// Broadcast the No Command and wait for its reflection. Required
    /// before every other command.
    pub fn no_cmd_broadcast(&self) -> Result<()> {
        self.cmd_rsp_base(&CmdRsp::no_cmd(), true).map(|_| ())
    }

    /// The common exchange: broadcast No Command, then issue `cmd` and
    /// return a response matched by receiver and type only. Used for Report
    /// commands, whose response payload differs from the request.
    pub fn cmd_rsp(&self, cmd: &CmdRsp) -> Result<CmdRsp> {
        self.no_cmd_broadcast()?;
        self.cmd_rsp_base(cmd, false)
    }

    /// Exchange for Set commands, whose response echoes the payload.
    pub fn cmd_rsp_echo(&self, cmd: &CmdRsp) -> Result<()> {
        self.no_cmd_broadcast()?;
        self.cmd_rsp_base(cmd, true)?;
        Ok(())
    }

    pub fn clear_error_log(&self) -> Result<()> {
        self.cmd_rsp_echo(&CmdRsp::set(
            self.rec.number(),
            SET_CLEAR_ERROR_LOG,
        ))
    }

    pub fn go_to_normal_settings(&self) -> Result<()> {
        self.cmd_rsp_echo(&CmdRsp::set(
            self.rec.number(),
            SET_GO_TO_NORMAL_SETTINGS,
        ))
    }

    fn report(&self, opcode: u8) -> Result<u8> {
        let rsp =
            self.cmd_rsp(&CmdRsp::report(self.rec.number(), opcode))?;
        Ok(rsp.payload)
    }

    /// Whether this receiver supports margining multiple lanes at once.
    pub fn independent_error_sampler(&self) -> Result<bool> {
        Ok(self.report(RPT_CONTROL_CAPABILITIES)? & MSK_IND_ERROR_SAMPLER != 0)
    }

    /// Populate the lane's capability record via the Report commands. Only
    /// this record is consulted for scaling ratios and mode bits afterwards.
    pub fn read_parameters(&mut self) -> Result<()> {
        let caps = self.report(RPT_CONTROL_CAPABILITIES)?;
        let mut param = LaneParameters {
            ind_error_sampler: caps & MSK_IND_ERROR_SAMPLER != 0,
            sample_reporting_method: caps & MSK_SAMPLE_REPORTING_METHOD != 0,
            ind_left_right_timing: caps & MSK_IND_LEFT_RIGHT_TIMING != 0,
            ind_up_down_voltage: caps & MSK_IND_UP_DOWN_VOLTAGE != 0,
            voltage_supported: caps & MSK_VOLTAGE_SUPPORTED != 0,
            ..Default::default()
        };
        param.num_voltage_steps =
            u32::from(self.report(RPT_NUM_VOLTAGE_STEPS)? & MSK_NUM_VOLTAGE_STEPS);
        param.num_timing_steps =
            u32::from(self.report(RPT_NUM_TIMING_STEPS)? & MSK_NUM_TIMING_STEPS);
        param.max_timing_offset = u32::from(
            self.report(RPT_MAX_TIMING_OFFSET)? & MSK_MAX_TIMING_OFFSET,
        );
        param.max_voltage_offset = u32::from(
            self.report(RPT_MAX_VOLTAGE_OFFSET)? & MSK_MAX_VOLTAGE_OFFSET,
        );
        param.sampling_rate_voltage = u32::from(
            self.report(RPT_SAMPLING_RATE_VOLTAGE)? & MSK_SAMPLING_RATE_VOLTAGE,
        );
        param.sampling_rate_timing = u32::from(
            self.report(RPT_SAMPLING_RATE_TIMING)? & MSK_SAMPLING_RATE_TIMING,
        );
        param.max_lanes =
            u32::from(self.report(RPT_MAX_LANES)? & MSK_MAX_LANES);

        // Zero means the vendor left the field unreported.
        if param.max_timing_offset == 0 {
            param.max_timing_offset = UNREPORTED_MAX_OFFSET;
        }
        if param.max_voltage_offset == 0 {
            param.max_voltage_offset = UNREPORTED_MAX_OFFSET;
        }
        self.param = param;
        Ok(())
    }

    /// Margin one offset, timing or voltage, per the plan. The offset
    /// carries its direction bit (timing bit 6, voltage bit 7) and is used
    /// as the command payload as-is.
    ///
    /// The result is appended to the lane's point list and returned; errors
    /// along the way are recorded in the point and the lane note rather
    /// than aborting the lane.
    pub fn margin_point(
        &mut self,
        offset: u8,
        plan: &AspectPlan,
    ) -> MarginPoint {
        let steps = u32::from(offset & !plan.dir_mask);
        let negative = offset & plan.dir_mask != 0;
        let (direction, engineering) = if plan.voltage {
            let v = steps as f32 * self.param.voltage_per_step();
            let dir = if !self.param.ind_up_down_voltage {
                Direction::Ud
            } else if negative {
                Direction::Down
            } else {
                Direction::Up
            };
            (dir, v)
        } else {
            let ui = steps as f32 * self.param.timing_per_step();
            let dir = if !self.param.ind_left_right_timing {
                Direction::Lr
            } else if negative {
                Direction::Left
            } else {
                Direction::Right
            };
            (dir, ui)
        };

        let mut point = MarginPoint {
            direction,
            steps,
            status: PointStatus::Unknown,
            error_count: 0,
            sample_count: None,
            percent_ui: (!plan.voltage).then_some(engineering),
            voltage: plan.voltage.then_some(engineering),
            info: None,
            error: None,
        };

        let cmd =
            CmdRsp::step(self.rec.number(), plan.voltage, offset);
        let mut rsp = match self.cmd_rsp(&cmd) {
            Ok(rsp) => rsp,
            Err(e) => {
                self.fail_point(&mut point, e);
                return self.push_point(point, plan);
            }
        };

        // The dwell clock starts only once the receiver reports Margining;
        // time spent in setup does not count toward the dwell.
        let issued = Instant::now();
        let mut dwell_start: Option<Instant> = None;
        let mut dwell_actual = Duration::ZERO;
        let mut set_sample_count = false;
        loop {
            point.error_count = rsp.step_error_count();
            match rsp.step_status() {
                ExecutionStatus::Nak => {
                    point.status = PointStatus::Nak;
                    break;
                }
                ExecutionStatus::ErrorOut => {
                    if let Some(start) = dwell_start {
                        dwell_actual = start.elapsed();
                    }
                    point.status = PointStatus::ErrorOut;
                    set_sample_count = true;
                    break;
                }
                ExecutionStatus::SettingUp => {
                    point.status = PointStatus::SettingUp;
                    if issued.elapsed() > MARGIN_TIMEOUT {
                        break;
                    }
                }
                ExecutionStatus::Margining => {
                    let start = *dwell_start.get_or_insert_with(Instant::now);
                    dwell_actual = start.elapsed();
                    point.status = PointStatus::Margining;
                    if dwell_actual >= plan.dwell {
                        set_sample_count = true;
                        break;
                    }
                }
            }
            std::thread::sleep(MARGIN_WAIT);
            rsp = match self.read_response() {
                Ok(rsp) => rsp,
                Err(e) => {
                    self.fail_point(&mut point, e);
                    return self.push_point(point, plan);
                }
            };
        }

        // Used for the BER measurement below.
        let mut bit_count = f64::from(point.error_count);
        if set_sample_count {
            if self.param.sample_reporting_method
                || !self.param.ind_error_sampler
            {
                // No queryable counter: the samples are rate times dwell.
                bit_count = dwell_actual.as_secs_f64() * plan.sps;
                // PCIe 5.0 8.4.4: SampleCount = 3*log2(number of bits).
                let samples = if bit_count == 0.0 {
                    // 64 bits, distinguishing "nothing sampled" from the
                    // unreported 0.
                    18
                } else {
                    (bit_count.log2() * 3.0).round() as u32
                };
                point.sample_count = Some(samples);
                bit_count = (f64::from(samples) / 3.0).exp2();
            } else {
                match self
                    .cmd_rsp(&CmdRsp::report(self.rec.number(), RPT_SAMPLE_COUNT))
                {
                    Ok(rsp) => {
                        let samples =
                            u32::from(rsp.payload & MSK_SAMPLE_COUNT);
                        point.sample_count = Some(samples);
                        bit_count = (f64::from(samples) / 3.0).exp2();
                    }
                    Err(e) => {
                        self.fail_point(&mut point, e);
                        return self.push_point(point, plan);
                    }
                }
            }
        }

        info!(
            "{}: dir:{:?} step:{:3} status:{:?} errcnt:{:2} samples:{:?}",
            self.step_id,
            point.direction,
            point.steps,
            point.status,
            point.error_count,
            point.sample_count,
        );

        match point.status {
            PointStatus::Margining => {}
            PointStatus::ErrorOut if plan.err_out_ok => {}
            _ => self.pass = false,
        }

        self.emit_point_artifacts(&point, plan, engineering, bit_count);

        // The receiver stays at the shifted sampling position until told
        // otherwise; always return it to normal before the next offset.
        if let Err(e) = self
            .clear_error_log()
            .and_then(|()| self.go_to_normal_settings())
        {
            self.fail_point(&mut point, e);
        }
        self.push_point(point, plan)
    }

    fn fail_point(&mut self, point: &mut MarginPoint, e: Error) {
        warn!("{}: margin point failed: {}", self.step_id, e);
        point.error = Some(e.to_string());
        self.note(e.to_string());
        self.pass = false;
    }

    fn push_point(
        &mut self,
        point: MarginPoint,
        plan: &AspectPlan,
    ) -> MarginPoint {
        if plan.voltage {
            self.vsteps.push(point.clone());
        } else {
            self.tsteps.push(point.clone());
        }
        point
    }

    fn emit_point_artifacts(
        &self,
        point: &MarginPoint,
        plan: &AspectPlan,
        engineering: f32,
        bit_count: f64,
    ) {
        let Some(ocp) = &self.ocp else { return };
        if !plan.eye_scan_mode || point.status != PointStatus::Margining {
            ocp.step_status_measurement(
                &self.hwinfo,
                self.lane_number,
                point,
                plan.voltage,
                engineering,
                !plan.err_out_ok,
            );
        }
        let boundary = matches!(
            point.status,
            PointStatus::Margining | PointStatus::ErrorOut
        );
        if boundary
            && (!plan.eye_scan_mode || point.error_count != 0)
            && bit_count > 0.0
        {
            ocp.step_ber_measurement(
                &self.hwinfo,
                self.lane_number,
                point,
                plan.voltage,
                engineering,
                f64::from(point.error_count) / bit_count,
                !plan.err_out_ok,
            );
        }
    }

    /// Fold this lane's accumulated state into the result schema.
    pub fn gather_result(&self) -> crate::config::LaneResult {
        crate::config::LaneResult {
            lane_number: self.lane_number,
            receiver: Some(self.rec),
            eye_width: if self.tspec.is_some() { self.eye_width } else { None },
            eye_height: if self.vspec.is_some() { self.eye_height } else { None },
            extra_info: (!self.msg.is_empty()).then(|| self.msg.clone()),
            pass: Some(self.pass),
            tspec: self.tspec.clone(),
            vspec: self.vspec.clone(),
            lane_parameter: Some(self.param.clone()),
            timing_margins: self.tsteps.clone(),
            voltage_margins: self.vsteps.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdrsp::{
        MARGIN_TYPE_NO_CMD, MARGIN_TYPE_REPORT, MARGIN_TYPE_SET,
    };
    use crate::pci::{ConfigBackend, DevInfo};

    /// A one-lane PHY that reflects commands into the status word,
    /// answering Report commands from a canned table.
    struct EchoPhy {
        lmr_base: u16,
        response: u16,
        reports: fn(u8) -> u8,
        /// When set, never writes a matching response.
        mute: bool,
    }

    impl EchoPhy {
        fn new(reports: fn(u8) -> u8) -> Self {
            Self { lmr_base: 0x180, response: 0, reports, mute: false }
        }
    }

    impl ConfigBackend for EchoPhy {
        fn scan(&mut self) -> crate::Result<Vec<DevInfo>> {
            Ok(vec![])
        }

        fn upstream_bridge(&mut self, bdf: Bdf) -> crate::Result<Bdf> {
            Err(Error::NoUpstreamBridge(bdf.to_string()))
        }

        fn read_byte(&mut self, _: Bdf, _: u16) -> crate::Result<u8> {
            Ok(0)
        }

        fn read_word(&mut self, _: Bdf, offset: u16) -> crate::Result<u16> {
            if offset == self.lmr_base + 8 + 2 {
                Ok(self.response)
            } else {
                Ok(0)
            }
        }

        fn read_long(&mut self, _: Bdf, _: u16) -> crate::Result<u32> {
            Ok(0)
        }

        fn write_byte(&mut self, _: Bdf, _: u16, _: u8) -> crate::Result<()> {
            Ok(())
        }

        fn write_word(
            &mut self,
            _: Bdf,
            offset: u16,
            val: u16,
        ) -> crate::Result<()> {
            if offset != self.lmr_base + 8 || self.mute {
                return Ok(());
            }
            let cmd = CmdRsp::decode(val);
            let rsp = match cmd.typ {
                MARGIN_TYPE_NO_CMD | MARGIN_TYPE_SET => cmd,
                MARGIN_TYPE_REPORT => CmdRsp {
                    payload: (self.reports)(cmd.payload),
                    ..cmd
                },
                _ => cmd,
            };
            self.response = rsp.encode();
            Ok(())
        }

        fn write_long(&mut self, _: Bdf, _: u16, _: u32) -> crate::Result<()> {
            Ok(())
        }
    }

    fn lane_over(phy: EchoPhy) -> Lane {
        let cs = Arc::new(ConfigSpace::new(Box::new(phy)));
        Lane::new(
            cs,
            "0000:01:00.0".parse().unwrap(),
            0,
            0x180,
            Receiver::UspF6,
            32.0e9,
            None,
            String::new(),
        )
    }

    #[test]
    fn no_cmd_broadcast_matches_echo() {
        let lane = lane_over(EchoPhy::new(|_| 0));
        lane.no_cmd_broadcast().unwrap();
    }

    #[test]
    fn command_times_out_without_response() {
        let mut phy = EchoPhy::new(|_| 0);
        phy.mute = true;
        let lane = lane_over(phy);
        let start = Instant::now();
        let err = lane.no_cmd_broadcast().unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));
        // The poll loop must have run for the full command timeout.
        assert!(start.elapsed() >= CMD_TIMEOUT);
    }

    #[test]
    fn parameters_read_with_unreported_offsets() {
        fn reports(op: u8) -> u8 {
            match op {
                RPT_CONTROL_CAPABILITIES => {
                    MSK_IND_ERROR_SAMPLER
                        | MSK_IND_LEFT_RIGHT_TIMING
                        | MSK_VOLTAGE_SUPPORTED
                }
                RPT_NUM_TIMING_STEPS => 31,
                RPT_NUM_VOLTAGE_STEPS => 64,
                // Max offsets unreported: the record must assume 50.
                RPT_MAX_TIMING_OFFSET | RPT_MAX_VOLTAGE_OFFSET => 0,
                RPT_SAMPLING_RATE_TIMING => 63,
                RPT_SAMPLING_RATE_VOLTAGE => 63,
                RPT_MAX_LANES => 15,
                _ => 0,
            }
        }
        let mut lane = lane_over(EchoPhy::new(reports));
        lane.read_parameters().unwrap();
        assert!(lane.param.ind_error_sampler);
        assert!(lane.param.ind_left_right_timing);
        assert!(!lane.param.ind_up_down_voltage);
        assert!(lane.param.voltage_supported);
        assert!(!lane.param.sample_reporting_method);
        assert_eq!(lane.param.num_timing_steps, 31);
        assert_eq!(lane.param.num_voltage_steps, 64);
        assert_eq!(lane.param.max_timing_offset, 50);
        assert_eq!(lane.param.max_voltage_offset, 50);
        assert_eq!(lane.param.max_lanes, 15);
    }
}
