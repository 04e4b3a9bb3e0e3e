// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! OCP Test & Validation output artifact stream.
//!
//! Observability consumers ingest a line-delimited JSON stream of output
//! artifacts: a schema version, one test-run start/end pair, one test step
//! per receiver, a measurement per margin point, and a diagnosis per
//! receiver. Every artifact carries a monotonically increasing sequence
//! number so a consumer can detect loss.

use std::io::Write;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::config::{Direction, MarginPoint, PointStatus};

pub const OCP_SCHEMA_MAJOR: i32 = 2;
pub const OCP_SCHEMA_MINOR: i32 = 0;

/// A shared, serialized artifact sink. Clone-free: wrap in `Arc` and hand to
/// every lane.
pub struct OcpStream {
    out: Mutex<Box<dyn Write + Send>>,
    seq: AtomicI32,
}

fn status_str(status: PointStatus) -> &'static str {
    match status {
        PointStatus::Unknown => "UNKNOWN",
        PointStatus::ErrorOut => "ERROR_OUT",
        PointStatus::SettingUp => "SETTING_UP",
        PointStatus::Margining => "MARGINING",
        PointStatus::Nak => "NAK",
    }
}

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Right => "RIGHT",
        Direction::Left => "LEFT",
        Direction::Up => "UP",
        Direction::Down => "DOWN",
        Direction::Lr => "LR",
        Direction::Ud => "UD",
    }
}

/// The human-oriented offset tag, e.g. `T:+0.1613UI` or `V:-0.0500V`.
fn offset_name(point: &MarginPoint, voltage: bool, engineering: f32) -> String {
    let sign = match point.direction {
        Direction::Left | Direction::Down => "-",
        Direction::Right | Direction::Up => "+",
        Direction::Lr | Direction::Ud => "",
    };
    if voltage {
        format!("V:{sign}{engineering:.4}V")
    } else {
        format!("T:{sign}{engineering:.4}UI")
    }
}

fn unit_str(point: &MarginPoint, voltage: bool, engineering: f32) -> String {
    format!(
        "Unit={};Step={:03};Dir={};Offset={:.4}",
        if voltage { "V" } else { "UI" },
        point.steps,
        direction_str(point.direction),
        engineering,
    )
}

impl OcpStream {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out: Mutex::new(out), seq: AtomicI32::new(0) }
    }

    /// Wrap and write one output artifact line.
    fn emit(&self, mut artifact: Value) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(obj) = artifact.as_object_mut() {
            obj.insert("sequenceNumber".into(), json!(seq));
            obj.insert(
                "timestamp".into(),
                json!(chrono::Utc::now().to_rfc3339()),
            );
        }
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(out, "{artifact}") {
            log::error!("failed writing OCP artifact: {e}");
        }
    }

    pub fn schema_version(&self) {
        self.emit(json!({
            "schemaVersion": {
                "major": OCP_SCHEMA_MAJOR,
                "minor": OCP_SCHEMA_MINOR,
            }
        }));
    }

    /// Start the test run. `hardware_infos` carries `(id, name)` pairs, one
    /// per receiver that exists on a tested link.
    pub fn run_start(
        &self,
        name: &str,
        version: &str,
        command_line: &str,
        parameters: Value,
        hardware_infos: &[(String, String)],
    ) {
        let infos: Vec<Value> = hardware_infos
            .iter()
            .map(|(id, name)| {
                json!({ "hardwareInfoId": id, "name": name })
            })
            .collect();
        self.emit(json!({
            "testRunArtifact": {
                "testRunStart": {
                    "name": name,
                    "version": version,
                    "commandLine": command_line,
                    "parameters": parameters,
                    "dutInfo": {
                        "dutInfoId": "this_pcie",
                        "name": "pcie_lmt_dut_info",
                        "hardwareInfos": infos,
                    },
                }
            }
        }));
    }

    /// End the run. `None` means nothing produced a verdict.
    pub fn run_end(&self, pass: Option<bool>) {
        let result = match pass {
            Some(true) => "PASS",
            Some(false) => "FAIL",
            None => "NOT_APPLICABLE",
        };
        self.emit(json!({
            "testRunArtifact": {
                "testRunEnd": { "status": "COMPLETE", "result": result }
            }
        }));
    }

    pub fn step_start(&self, step_id: &str) {
        self.emit(json!({
            "testStepArtifact": {
                "testStepStart": { "name": format!("LMT@{step_id}") },
                "testStepId": step_id,
            }
        }));
    }

    pub fn step_end(&self, step_id: &str) {
        self.emit(json!({
            "testStepArtifact": {
                "testStepEnd": { "status": "COMPLETE" },
                "testStepId": step_id,
            }
        }));
    }

    /// Per-receiver verdict over its tested lanes.
    pub fn diagnosis(&self, step_id: &str, tested: usize, failed: usize) {
        let (diag_type, verdict, message) = if tested == 0 {
            (
                "UNKNOWN",
                "pcie_lmt-rx_ln-unknown",
                "0 Rx-lane tested.".to_string(),
            )
        } else if failed == 0 {
            (
                "PASS",
                "pcie_lmt-rx_ln-pass",
                format!("{tested} Rx-lane tested. All passed."),
            )
        } else {
            (
                "FAIL",
                "pcie_lmt-rx_ln-fail",
                format!("{tested} Rx-lane tested; {failed} failed."),
            )
        };
        self.emit(json!({
            "testStepArtifact": {
                "diagnosis": {
                    "type": diag_type,
                    "verdict": verdict,
                    "message": message,
                    "hardwareInfoId": step_id,
                },
                "testStepId": step_id,
            }
        }));
    }

    fn subcomponent(
        &self,
        hwinfo: &str,
        lane: u32,
        name: &str,
    ) -> Value {
        json!({
            "type": "BUS",
            "name": "PCIELMT-MARGINPOINT-PCI",
            "location": format!("{hwinfo};LN={lane:02};Offset={name}"),
        })
    }

    /// The execution status of one margined offset.
    pub(crate) fn step_status_measurement(
        &self,
        hwinfo: &str,
        lane: u32,
        point: &MarginPoint,
        voltage: bool,
        engineering: f32,
        validate: bool,
    ) {
        let name = offset_name(point, voltage, engineering);
        let mut measurement = json!({
            "name": format!("LN={lane:02};Step-Status"),
            "value": status_str(point.status),
            "unit": unit_str(point, voltage, engineering),
            "hardwareInfoId": hwinfo,
            "subcomponent": self.subcomponent(hwinfo, lane, &name),
        });
        if validate {
            measurement.as_object_mut().unwrap().insert(
                "validators".into(),
                json!([{
                    "name": "margin-status",
                    "type": "EQUAL",
                    "value": "MARGINING",
                }]),
            );
        }
        self.emit(json!({
            "testStepArtifact": {
                "measurement": measurement,
                "testStepId": hwinfo,
            }
        }));
    }

    /// The observed bit error ratio of one margined offset.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn step_ber_measurement(
        &self,
        hwinfo: &str,
        lane: u32,
        point: &MarginPoint,
        voltage: bool,
        engineering: f32,
        ber: f64,
        _validate: bool,
    ) {
        let name = offset_name(point, voltage, engineering);
        self.emit(json!({
            "testStepArtifact": {
                "measurement": {
                    "name": format!("LN={lane:02};Step-BER"),
                    "value": ber,
                    "unit": unit_str(point, voltage, engineering),
                    "hardwareInfoId": hwinfo,
                    "subcomponent": self.subcomponent(hwinfo, lane, &name),
                },
                "testStepId": hwinfo,
            }
        }));
    }
}
