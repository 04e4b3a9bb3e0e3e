// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated PCIe link with margin-capable receivers.
//!
//! The simulation implements the `ConfigBackend` contract over an in-memory
//! register file: one endpoint (the USP) under one bridge (the DSP), both
//! carrying a PCI Express capability and an LMR extended capability. Lane
//! margining commands drive a small state machine per lane with
//! configurable eye boundaries, so the engine above can be tested
//! end-to-end, register traffic included.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use pcie_lmt::cmdrsp::{
    CmdRsp, ExecutionStatus, MARGIN_TYPE_NO_CMD, MARGIN_TYPE_REPORT,
    MARGIN_TYPE_SET, MARGIN_TYPE_TIMING, MARGIN_TYPE_VOLTAGE,
    RPT_CONTROL_CAPABILITIES, RPT_MAX_LANES, RPT_MAX_TIMING_OFFSET,
    RPT_MAX_VOLTAGE_OFFSET, RPT_NUM_TIMING_STEPS, RPT_NUM_VOLTAGE_STEPS,
    RPT_SAMPLE_COUNT, RPT_SAMPLING_RATE_TIMING, RPT_SAMPLING_RATE_VOLTAGE,
    SET_ERROR_COUNT_LIMIT, SET_GO_TO_NORMAL_SETTINGS, TIMING_DIR_MASK,
    VOLTAGE_DIR_MASK,
};
use pcie_lmt::pci::{Bdf, ConfigBackend, DevInfo};

pub const PCIE_CAP: u16 = 0x60;
pub const LMR_BASE: u16 = 0x100;
pub const LNKCTL: u16 = PCIE_CAP + 0x10;
pub const LNKSTA: u16 = PCIE_CAP + 0x12;
pub const LNKCTL2: u16 = PCIE_CAP + 0x30;
pub const LNKSTA2: u16 = PCIE_CAP + 0x32;

/// Margining behavior of one receiver.
#[derive(Debug, Clone)]
pub struct RxConfig {
    /// Control-capabilities report bits.
    pub caps: u8,
    pub num_timing_steps: u8,
    pub max_timing_offset: u8,
    pub num_voltage_steps: u8,
    pub max_voltage_offset: u8,
    pub rate_timing: u8,
    pub rate_voltage: u8,
    /// Largest passing offset per side; anything beyond errors out.
    pub pass_right: u8,
    pub pass_left: u8,
    pub pass_up: u8,
    pub pass_down: u8,
    /// Never leave the SettingUp state.
    pub stall_setup: bool,
    /// Payload for the Report Sample Count command.
    pub sample_count: u8,
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            caps: 0,
            num_timing_steps: 31,
            max_timing_offset: 50,
            num_voltage_steps: 64,
            max_voltage_offset: 40,
            rate_timing: 63,
            rate_voltage: 63,
            pass_right: 15,
            pass_left: 15,
            pass_up: 6,
            pass_down: 5,
            stall_setup: false,
            sample_count: 0x50,
        }
    }
}

/// Where a step command currently stands.
#[derive(Debug, Clone, Copy)]
enum StepPhase {
    Nak,
    Setup { reads_left: u32, stall: bool, fail: bool },
    Margining { fail: bool },
    ErrorOut,
}

#[derive(Debug, Clone)]
struct LaneSim {
    cmd: CmdRsp,
    phase: Option<StepPhase>,
    error_limit: u8,
}

/// One register write observed on a lane control register.
#[derive(Debug, Clone, Copy)]
pub struct CmdWrite {
    pub bdf: Bdf,
    pub lane: u8,
    pub word: u16,
}

pub struct SimState {
    regs: HashMap<Bdf, HashMap<u16, u8>>,
    lanes: HashMap<(Bdf, u8), LaneSim>,
    rx_configs: HashMap<u8, RxConfig>,
    usp: Bdf,
    dsp: Bdf,
    /// Static response word for non-step commands, per lane register.
    responses: HashMap<(Bdf, u8), u16>,
    pub trace: Vec<CmdWrite>,
    /// Lanes currently between a step command and Go To Normal Settings.
    active: HashSet<(Bdf, u8)>,
    pub max_active: usize,
}

fn put_word(regs: &mut HashMap<u16, u8>, offset: u16, val: u16) {
    let bytes = val.to_le_bytes();
    regs.insert(offset, bytes[0]);
    regs.insert(offset + 1, bytes[1]);
}

fn put_long(regs: &mut HashMap<u16, u8>, offset: u16, val: u32) {
    put_word(regs, offset, (val & 0xFFFF) as u16);
    put_word(regs, offset + 2, (val >> 16) as u16);
}

fn device_regs(
    vendor: u16,
    device: u16,
    header_type: u8,
    port_type: u16,
    speed: u16,
    width: u16,
    retimer_bits: u16,
) -> HashMap<u16, u8> {
    let mut regs = HashMap::new();
    put_word(&mut regs, 0x00, vendor);
    put_word(&mut regs, 0x02, device);
    regs.insert(0x0E, header_type);
    regs.insert(0x34, PCIE_CAP as u8);
    // PCIe capability: id 0x10, end of chain.
    put_word(&mut regs, PCIE_CAP, 0x0010);
    put_word(&mut regs, PCIE_CAP + 0x02, port_type << 4);
    // ASPM L1 enabled before the test; both disables clear.
    put_word(&mut regs, LNKCTL, 0x0002);
    put_word(&mut regs, LNKSTA, speed | (width << 4));
    put_word(&mut regs, LNKCTL2, 0x0000);
    put_word(&mut regs, LNKSTA2, retimer_bits);
    // LMR extended capability, end of chain; port status ready.
    put_long(&mut regs, LMR_BASE, 0x27);
    put_word(&mut regs, LMR_BASE + 4, 0x0000);
    put_word(&mut regs, LMR_BASE + 6, 0x0001);
    regs
}

/// Construction parameters for the simulated link.
pub struct LinkSetup {
    pub width: u16,
    pub speed: u16,
    pub retimer_bits: u16,
    pub rx_configs: HashMap<u8, RxConfig>,
}

impl Default for LinkSetup {
    fn default() -> Self {
        Self {
            width: 1,
            speed: 5, // Gen5
            retimer_bits: 0,
            rx_configs: HashMap::new(),
        }
    }
}

impl SimState {
    pub fn new(setup: LinkSetup) -> Self {
        let usp: Bdf = "0000:3b:00.0".parse().unwrap();
        let dsp: Bdf = "0000:3a:00.0".parse().unwrap();
        let mut regs = HashMap::new();
        regs.insert(
            usp,
            device_regs(
                0x1b96,
                0x2500,
                0x00,
                0x5, // switch upstream port
                setup.speed,
                setup.width,
                setup.retimer_bits,
            ),
        );
        regs.insert(
            dsp,
            device_regs(
                0x8086,
                0x347a,
                0x01,
                0x6, // downstream port
                setup.speed,
                setup.width,
                setup.retimer_bits,
            ),
        );
        Self {
            regs,
            lanes: HashMap::new(),
            rx_configs: setup.rx_configs,
            usp,
            dsp,
            responses: HashMap::new(),
            trace: Vec::new(),
            active: HashSet::new(),
            max_active: 0,
        }
    }

    pub fn usp(&self) -> Bdf {
        self.usp
    }

    pub fn dsp(&self) -> Bdf {
        self.dsp
    }

    pub fn reg_word(&self, bdf: Bdf, offset: u16) -> u16 {
        let regs = &self.regs[&bdf];
        u16::from_le_bytes([
            *regs.get(&offset).unwrap_or(&0),
            *regs.get(&(offset + 1)).unwrap_or(&0),
        ])
    }

    /// Whether any lane-control write decodes to the given receiver.
    pub fn commands_for_receiver(&self, rec: u8) -> usize {
        self.trace
            .iter()
            .filter(|w| CmdRsp::decode(w.word).rec == rec)
            .count()
    }

    /// Whether any Report Sample Count command was issued.
    pub fn sample_count_queried(&self) -> bool {
        self.trace.iter().any(|w| {
            let cmd = CmdRsp::decode(w.word);
            cmd.typ == MARGIN_TYPE_REPORT && cmd.payload == RPT_SAMPLE_COUNT
        })
    }

    fn lane_of(&self, offset: u16) -> Option<(u8, bool)> {
        if offset < LMR_BASE + 8 {
            return None;
        }
        let rel = offset - LMR_BASE - 8;
        Some(((rel / 4) as u8, rel % 4 == 2))
    }

    fn report_payload(cfg: &RxConfig, opcode: u8) -> u8 {
        match opcode {
            RPT_CONTROL_CAPABILITIES => cfg.caps,
            RPT_NUM_VOLTAGE_STEPS => cfg.num_voltage_steps,
            RPT_NUM_TIMING_STEPS => cfg.num_timing_steps,
            RPT_MAX_TIMING_OFFSET => cfg.max_timing_offset,
            RPT_MAX_VOLTAGE_OFFSET => cfg.max_voltage_offset,
            RPT_SAMPLING_RATE_VOLTAGE => cfg.rate_voltage,
            RPT_SAMPLING_RATE_TIMING => cfg.rate_timing,
            RPT_SAMPLE_COUNT => cfg.sample_count,
            RPT_MAX_LANES => 31,
            _ => 0,
        }
    }

    fn handle_cmd_write(&mut self, bdf: Bdf, lane: u8, word: u16) {
        self.trace.push(CmdWrite { bdf, lane, word });
        let cmd = CmdRsp::decode(word);
        let key = (bdf, lane);
        let entry = self.lanes.entry(key).or_insert(LaneSim {
            cmd,
            phase: None,
            error_limit: 4,
        });
        entry.cmd = cmd;
        match cmd.typ {
            MARGIN_TYPE_NO_CMD => {
                entry.phase = None;
                self.responses.insert(key, cmd.encode());
            }
            MARGIN_TYPE_SET => {
                entry.phase = None;
                if cmd.payload & 0xC0 == SET_ERROR_COUNT_LIMIT {
                    entry.error_limit = cmd.payload & 0x3F;
                }
                if cmd.payload == SET_GO_TO_NORMAL_SETTINGS {
                    self.active.remove(&key);
                }
                self.responses.insert(key, cmd.encode());
            }
            MARGIN_TYPE_REPORT => {
                entry.phase = None;
                let cfg = self
                    .rx_configs
                    .get(&cmd.rec)
                    .cloned()
                    .unwrap_or_default();
                let rsp = CmdRsp {
                    payload: Self::report_payload(&cfg, cmd.payload),
                    ..cmd
                };
                self.responses.insert(key, rsp.encode());
            }
            MARGIN_TYPE_TIMING | MARGIN_TYPE_VOLTAGE => {
                let cfg = self
                    .rx_configs
                    .get(&cmd.rec)
                    .cloned()
                    .unwrap_or_default();
                let voltage = cmd.typ == MARGIN_TYPE_VOLTAGE;
                let mask = if voltage {
                    VOLTAGE_DIR_MASK
                } else {
                    TIMING_DIR_MASK
                };
                let steps = cmd.payload & !mask;
                let negative = cmd.payload & mask != 0;
                let num = if voltage {
                    cfg.num_voltage_steps
                } else {
                    cfg.num_timing_steps
                };
                let pass_limit = match (voltage, negative) {
                    (false, false) => cfg.pass_right,
                    (false, true) => cfg.pass_left,
                    (true, false) => cfg.pass_up,
                    (true, true) => cfg.pass_down,
                };
                entry.phase = Some(if steps > num {
                    StepPhase::Nak
                } else {
                    StepPhase::Setup {
                        reads_left: 2,
                        stall: cfg.stall_setup,
                        fail: steps > pass_limit,
                    }
                });
                self.active.insert(key);
                self.max_active = self.max_active.max(self.active.len());
            }
            _ => {
                self.responses.insert(key, cmd.encode());
            }
        }
    }

    fn step_response(&mut self, bdf: Bdf, lane: u8) -> u16 {
        let key = (bdf, lane);
        let Some(entry) = self.lanes.get_mut(&key) else {
            return 0;
        };
        let Some(phase) = entry.phase else {
            return *self.responses.get(&key).unwrap_or(&0);
        };
        let (next, status, errcnt) = match phase {
            StepPhase::Nak => (StepPhase::Nak, ExecutionStatus::Nak, 0),
            StepPhase::Setup { stall: true, .. } => {
                (phase, ExecutionStatus::SettingUp, 0)
            }
            StepPhase::Setup { reads_left, stall, fail } => {
                if reads_left > 1 {
                    (
                        StepPhase::Setup {
                            reads_left: reads_left - 1,
                            stall,
                            fail,
                        },
                        ExecutionStatus::SettingUp,
                        0,
                    )
                } else {
                    (StepPhase::Margining { fail }, ExecutionStatus::SettingUp, 0)
                }
            }
            StepPhase::Margining { fail: true } => (
                StepPhase::ErrorOut,
                ExecutionStatus::ErrorOut,
                (entry.error_limit + 1).min(0x3F),
            ),
            StepPhase::Margining { fail: false } => {
                (phase, ExecutionStatus::Margining, 0)
            }
            StepPhase::ErrorOut => (
                StepPhase::ErrorOut,
                ExecutionStatus::ErrorOut,
                (entry.error_limit + 1).min(0x3F),
            ),
        };
        entry.phase = Some(next);
        let rsp = CmdRsp {
            payload: u8::from(status) | errcnt,
            usage: 0,
            typ: entry.cmd.typ,
            rec: entry.cmd.rec,
        };
        rsp.encode()
    }
}

/// The `ConfigBackend` facade over the shared simulation state.
pub struct SimBackend {
    state: Arc<Mutex<SimState>>,
}

impl SimBackend {
    pub fn new(setup: LinkSetup) -> (Self, Arc<Mutex<SimState>>) {
        let state = Arc::new(Mutex::new(SimState::new(setup)));
        (Self { state: Arc::clone(&state) }, state)
    }
}

impl ConfigBackend for SimBackend {
    fn scan(&mut self) -> pcie_lmt::Result<Vec<DevInfo>> {
        let state = self.state.lock().unwrap();
        let mut devs: Vec<DevInfo> = state
            .regs
            .keys()
            .map(|&bdf| DevInfo {
                bdf,
                vendor_id: state.reg_word(bdf, 0x00),
                device_id: state.reg_word(bdf, 0x02),
                header_type: *state.regs[&bdf].get(&0x0E).unwrap_or(&0),
            })
            .collect();
        devs.sort_by_key(|d| d.bdf);
        Ok(devs)
    }

    fn upstream_bridge(&mut self, bdf: Bdf) -> pcie_lmt::Result<Bdf> {
        let state = self.state.lock().unwrap();
        if bdf == state.usp {
            Ok(state.dsp)
        } else {
            Err(pcie_lmt::Error::NoUpstreamBridge(bdf.to_string()))
        }
    }

    fn read_byte(&mut self, bdf: Bdf, offset: u16) -> pcie_lmt::Result<u8> {
        let word = self.read_word(bdf, offset & !1)?;
        Ok(if offset & 1 == 0 { word as u8 } else { (word >> 8) as u8 })
    }

    fn read_word(&mut self, bdf: Bdf, offset: u16) -> pcie_lmt::Result<u16> {
        let mut state = self.state.lock().unwrap();
        if let Some((lane, is_status)) = state.lane_of(offset) {
            if is_status {
                return Ok(state.step_response(bdf, lane));
            }
        }
        Ok(state.reg_word(bdf, offset))
    }

    fn read_long(&mut self, bdf: Bdf, offset: u16) -> pcie_lmt::Result<u32> {
        let lo = self.read_word(bdf, offset)?;
        let hi = self.read_word(bdf, offset + 2)?;
        Ok(u32::from(hi) << 16 | u32::from(lo))
    }

    fn write_byte(
        &mut self,
        _bdf: Bdf,
        _offset: u16,
        _val: u8,
    ) -> pcie_lmt::Result<()> {
        Ok(())
    }

    fn write_word(
        &mut self,
        bdf: Bdf,
        offset: u16,
        val: u16,
    ) -> pcie_lmt::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some((lane, is_status)) = state.lane_of(offset) {
            if !is_status {
                state.handle_cmd_write(bdf, lane, val);
                return Ok(());
            }
        }
        let regs = state.regs.get_mut(&bdf).expect("unknown device");
        put_word(regs, offset, val);
        Ok(())
    }

    fn write_long(
        &mut self,
        bdf: Bdf,
        offset: u16,
        val: u32,
    ) -> pcie_lmt::Result<()> {
        self.write_word(bdf, offset, (val & 0xFFFF) as u16)?;
        self.write_word(bdf, offset + 2, (val >> 16) as u16)
    }
}
