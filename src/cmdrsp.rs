// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The 16-bit LMR command/response word.
//!
//! Each lane has a margining control register and, two bytes above it, a
//! margining status register. Both share one layout, defined by PCIe 5.0
//! 4.2.13.1: payload in [15:8], usage model in [6] (always zero for the
//! receiver usage model), margin type in [5:3], receiver number in [2:0].
//! Bit 7 is unimplemented in both directions.

/// Margin type encodings.
pub const MARGIN_TYPE_REPORT: u8 = 1;
pub const MARGIN_TYPE_SET: u8 = 2;
pub const MARGIN_TYPE_TIMING: u8 = 3;
pub const MARGIN_TYPE_VOLTAGE: u8 = 4;
pub const MARGIN_TYPE_NO_CMD: u8 = 7;

/// The broadcast No Command: payload 0x9C, receiver 0.
pub const NO_CMD_PAYLOAD: u8 = 0x9C;
pub const NO_CMD_RECEIVER: u8 = 0;

/// Report command payloads.
pub const RPT_CONTROL_CAPABILITIES: u8 = 0x88;
pub const RPT_NUM_VOLTAGE_STEPS: u8 = 0x89;
pub const RPT_NUM_TIMING_STEPS: u8 = 0x8A;
pub const RPT_MAX_TIMING_OFFSET: u8 = 0x8B;
pub const RPT_MAX_VOLTAGE_OFFSET: u8 = 0x8C;
pub const RPT_SAMPLING_RATE_VOLTAGE: u8 = 0x8D;
pub const RPT_SAMPLING_RATE_TIMING: u8 = 0x8E;
pub const RPT_SAMPLE_COUNT: u8 = 0x8F;
pub const RPT_MAX_LANES: u8 = 0x90;

/// Set command payloads. The error-count limit carries the limit in its low
/// six bits, on top of `SET_ERROR_COUNT_LIMIT`.
pub const SET_ERROR_COUNT_LIMIT: u8 = 0xC0;
pub const SET_GO_TO_NORMAL_SETTINGS: u8 = 0x0F;
pub const SET_CLEAR_ERROR_LOG: u8 = 0x55;

/// Control-capabilities report bits.
pub const MSK_IND_ERROR_SAMPLER: u8 = 1 << 4;
pub const MSK_SAMPLE_REPORTING_METHOD: u8 = 1 << 3;
pub const MSK_IND_LEFT_RIGHT_TIMING: u8 = 1 << 2;
pub const MSK_IND_UP_DOWN_VOLTAGE: u8 = 1 << 1;
pub const MSK_VOLTAGE_SUPPORTED: u8 = 1 << 0;

/// Field widths of the report payloads.
pub const MSK_NUM_VOLTAGE_STEPS: u8 = 0x7F;
pub const MSK_NUM_TIMING_STEPS: u8 = 0x3F;
pub const MSK_MAX_TIMING_OFFSET: u8 = 0x7F;
pub const MSK_MAX_VOLTAGE_OFFSET: u8 = 0x7F;
pub const MSK_SAMPLING_RATE_VOLTAGE: u8 = 0x3F;
pub const MSK_SAMPLING_RATE_TIMING: u8 = 0x3F;
pub const MSK_SAMPLE_COUNT: u8 = 0x7F;
pub const MSK_MAX_LANES: u8 = 0x1F;

/// Direction bits inside a step payload: timing uses bit 6, voltage bit 7.
/// A clear bit is right/up (positive), a set bit is left/down (negative).
pub const TIMING_DIR_MASK: u8 = 0x40;
pub const VOLTAGE_DIR_MASK: u8 = 0x80;

/// Step-margin execution status, bits [7:6] of a step response payload.
pub const STEP_STATUS_POS: u8 = 6;
pub const STEP_STATUS_MASK: u8 = 0xC0;
pub const STEP_ERROR_COUNT_MASK: u8 = 0x3F;

/// One margining control or status word, unpacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CmdRsp {
    /// Command-type-specific opcode, offset, or status+error-count.
    pub payload: u8,
    /// Usage model; zero in this tool, which only speaks the receiver model.
    pub usage: u8,
    /// Margin type.
    pub typ: u8,
    /// Receiver number, 0..=7.
    pub rec: u8,
}

impl CmdRsp {
    /// Pack into the register encoding.
    pub fn encode(&self) -> u16 {
        u16::from(self.payload) << 8
            | u16::from(self.usage & 0x1) << 6
            | u16::from(self.typ & 0x7) << 3
            | u16::from(self.rec & 0x7)
    }

    /// Unpack from the register encoding. Bit 7 is unimplemented and
    /// discarded.
    pub fn decode(raw: u16) -> Self {
        Self {
            payload: (raw >> 8) as u8,
            usage: ((raw >> 6) & 0x1) as u8,
            typ: ((raw >> 3) & 0x7) as u8,
            rec: (raw & 0x7) as u8,
        }
    }

    /// The mandatory inter-command broadcast.
    pub fn no_cmd() -> Self {
        Self {
            payload: NO_CMD_PAYLOAD,
            usage: 0,
            typ: MARGIN_TYPE_NO_CMD,
            rec: NO_CMD_RECEIVER,
        }
    }

    /// A Report command for receiver `rec`.
    pub fn report(rec: u8, opcode: u8) -> Self {
        Self { payload: opcode, usage: 0, typ: MARGIN_TYPE_REPORT, rec }
    }

    /// A Set command for receiver `rec`.
    pub fn set(rec: u8, payload: u8) -> Self {
        Self { payload, usage: 0, typ: MARGIN_TYPE_SET, rec }
    }

    /// A timing or voltage step command. The payload is the offset with its
    /// direction bit already packed.
    pub fn step(rec: u8, voltage: bool, offset: u8) -> Self {
        let typ =
            if voltage { MARGIN_TYPE_VOLTAGE } else { MARGIN_TYPE_TIMING };
        Self { payload: offset, usage: 0, typ, rec }
    }

    /// Step-margin execution status, meaningful for step responses.
    pub fn step_status(&self) -> ExecutionStatus {
        ExecutionStatus::from(self.payload)
    }

    /// Error count of a step response.
    pub fn step_error_count(&self) -> u32 {
        u32::from(self.payload & STEP_ERROR_COUNT_MASK)
    }
}

/// Execution status of a step margin command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// The error-count limit was exceeded.
    ErrorOut,
    /// The receiver is getting ready but has not started margining.
    SettingUp,
    /// Margining is in progress at the requested offset.
    Margining,
    /// Unsupported command, usually an out-of-range offset.
    Nak,
}

impl From<u8> for ExecutionStatus {
    fn from(payload: u8) -> Self {
        match (payload & STEP_STATUS_MASK) >> STEP_STATUS_POS {
            0b00 => ExecutionStatus::ErrorOut,
            0b01 => ExecutionStatus::SettingUp,
            0b10 => ExecutionStatus::Margining,
            _ => ExecutionStatus::Nak,
        }
    }
}

impl From<ExecutionStatus> for u8 {
    fn from(s: ExecutionStatus) -> u8 {
        let bits = match s {
            ExecutionStatus::ErrorOut => 0b00,
            ExecutionStatus::SettingUp => 0b01,
            ExecutionStatus::Margining => 0b10,
            ExecutionStatus::Nak => 0b11,
        };
        bits << STEP_STATUS_POS
    }
}
