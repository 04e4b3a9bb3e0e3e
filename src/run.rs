// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Top-level test execution.
//!
//! Enumerates PCI functions, selects the links the test spec addresses,
//! runs every ready link on its own thread, and aggregates the per-link
//! results. A process-wide quiescence gate keeps any link from margining
//! while another link is still reading lane parameters; bifurcated links
//! share lanes in hardware and interfere otherwise.

use std::sync::{Arc, Condvar, Mutex};

use log::{debug, info, warn};

use crate::caps::{
    find_lmr_capability, find_pcie_capability, LinkStatus, LmrPortState,
    PortType, PCI_EXP_FLAGS, PCI_EXP_LNKSTA, PCI_EXP_LNKSTA2,
    PCI_EXP_LNKSTA2_2RETIMERS, PCI_EXP_LNKSTA2_RETIMER,
};
use crate::config::{LinkMargin, LinkMarginTest, Receiver};
use crate::link::{LinkTest, Port};
use crate::ocp::OcpStream;
use crate::pci::{ConfigSpace, DevInfo};
use crate::{Error, Result};

/// Counts links inside their parameter-read phase. Margining waits until
/// the count drains to zero.
#[derive(Default)]
pub struct QuiesceGate {
    quiet: Mutex<usize>,
    done: Condvar,
}

impl QuiesceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_quiet(&self) {
        *self.quiet.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }

    pub fn end_quiet(&self) {
        let mut quiet =
            self.quiet.lock().unwrap_or_else(|e| e.into_inner());
        *quiet = quiet.saturating_sub(1);
        if *quiet == 0 {
            self.done.notify_all();
        }
    }

    pub fn wait_quiet_done(&self) {
        let mut quiet =
            self.quiet.lock().unwrap_or_else(|e| e.into_inner());
        while *quiet > 0 {
            quiet = self.done.wait(quiet).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Identity of the run, used for the observability stream header.
pub struct OcpRun {
    pub stream: Arc<OcpStream>,
    pub name: String,
    pub version: String,
    pub command_line: String,
}

/// Discover and margin every link the test spec addresses. Returns the
/// result record: one `LinkMargin` per matched link, ordered by bus.
pub fn margin_links(
    cs: &Arc<ConfigSpace>,
    cfg: &LinkMarginTest,
    ocp: Option<&OcpRun>,
) -> Result<LinkMarginTest> {
    let devs = cs.scan()?;
    if devs.is_empty() {
        return Err(Error::Config("no pcie devices found".into()));
    }

    let mut links = Vec::new();
    for entry in &cfg.link_margin {
        links.extend(get_links(cs, &devs, entry));
    }
    if links.is_empty() {
        return Err(Error::Config(
            "no port matches the test spec".into(),
        ));
    }

    if let Some(ocp) = ocp {
        start_run(cs, ocp, cfg, &links);
    }

    let gate = QuiesceGate::new();
    std::thread::scope(|scope| {
        for lt in links.iter_mut() {
            debug!("{:?} test ready? {}", lt.usp.bdf, lt.test_ready);
            if !lt.test_ready {
                continue;
            }
            let gate = &gate;
            let stream = ocp.map(|o| &o.stream);
            scope.spawn(move || lt.margin_link(cs, gate, stream));
        }
    });

    let mut result: Vec<LinkMargin> =
        links.into_iter().map(|lt| lt.result).collect();
    result.sort_by_key(|lm| lm.bus.first().copied().unwrap_or(0));

    if let Some(ocp) = ocp {
        ocp.stream.run_end(rollup(&result));
    }
    Ok(LinkMarginTest { link_margin: result })
}

/// The run-level verdict: fail if any lane failed, pass if anything passed,
/// no verdict when nothing was tested.
pub fn rollup(links: &[LinkMargin]) -> Option<bool> {
    let mut verdict = None;
    for lm in links {
        for lane in &lm.receiver_lanes {
            match (lane.pass, verdict) {
                (Some(false), _) => return Some(false),
                (Some(true), None) => verdict = Some(true),
                _ => {}
            }
        }
    }
    verdict
}

/// Whether a scanned function matches one entry's filter. Only a device 0,
/// function 0 upstream-side port can anchor a link.
pub(crate) fn matches_filter(entry: &LinkMargin, dev: &DevInfo) -> bool {
    let vid_chk = entry
        .vendor_id
        .map(|v| u32::from(dev.vendor_id) == v)
        .unwrap_or(true);
    let did_chk = entry
        .device_id
        .map(|d| u32::from(dev.device_id) == d)
        .unwrap_or(true);
    let bus_chk =
        entry.bus.is_empty() || entry.bus.contains(&u32::from(dev.bdf.bus));
    let pf0_chk = dev.bdf.device == 0 && dev.bdf.function == 0;
    vid_chk && did_chk && bus_chk && pf0_chk
}

/// Probe one port of a prospective link, accumulating discovery notes into
/// `msg`. Returns `None` when the port cannot be margined.
fn probe_port(
    cs: &ConfigSpace,
    bdf: crate::pci::Bdf,
    msg: &mut String,
) -> Option<Port> {
    let pcie_cap = match find_pcie_capability(cs, bdf) {
        Ok(offset) => offset,
        Err(e) => {
            msg.push_str(&format!("Error: {bdf}: {e} | "));
            return None;
        }
    };
    let status = match cs.read_word(bdf, pcie_cap + PCI_EXP_LNKSTA) {
        Ok(word) => LinkStatus::decode(word),
        Err(e) => {
            msg.push_str(&format!("Error: {bdf}: {e} | "));
            return None;
        }
    };
    msg.push_str(&format!(
        "Info: {bdf}: PCIEXP CAP offset={pcie_cap:x}; width={}; speed={} | ",
        status.width, status.speed
    ));
    let Some(speed_bps) = status.bits_per_second() else {
        debug!("{bdf} speed {} is not gen4 nor gen5; skipped", status.speed);
        msg.push_str(&format!(
            "Error: {bdf}: speed {} is not margin-capable | ",
            status.speed
        ));
        return None;
    };
    // The LMR extended capability is required at 16 GT/s and above; a link
    // without it is not really marginable.
    let lmr_base = match find_lmr_capability(cs, bdf) {
        Ok(offset) => offset,
        Err(e) => {
            msg.push_str(&format!("Error: {bdf}: {e} | "));
            return None;
        }
    };
    msg.push_str(&format!("Info: {bdf}: LMR CAP offset={lmr_base:x} | "));
    match LmrPortState::read(cs, bdf, lmr_base) {
        Ok(state) if !state.ready => {
            warn!("{bdf}: margining not marked ready in the port status");
        }
        Err(e) => {
            msg.push_str(&format!("Error: {bdf}: {e} | "));
        }
        _ => {}
    }
    Some(Port { bdf, pcie_cap, lmr_base, width: status.width, speed_bps })
}

/// Find the links one spec entry addresses.
fn get_links(
    cs: &Arc<ConfigSpace>,
    devs: &[DevInfo],
    entry: &LinkMargin,
) -> Vec<LinkTest> {
    let mut links = Vec::new();
    for dev in devs {
        if !matches_filter(entry, dev) {
            continue;
        }
        // Only an endpoint or a switch upstream port terminates a
        // margin-capable link from the upstream side.
        let Ok(pcie_cap) = find_pcie_capability(cs, dev.bdf) else {
            continue;
        };
        let port_type = match cs.read_word(dev.bdf, pcie_cap + PCI_EXP_FLAGS)
        {
            Ok(flags) => PortType::from(flags),
            Err(_) => continue,
        };
        if !matches!(port_type, PortType::Endpoint | PortType::Upstream) {
            continue;
        }
        debug!("found dev {}", dev.bdf);

        let mut result = entry.clone();
        result.vendor_id = Some(u32::from(dev.vendor_id));
        result.device_id = Some(u32::from(dev.device_id));
        result.bus = vec![u32::from(dev.bdf.bus)];
        result.usp_bdf = Some(dev.bdf.to_string());

        let mut msg = String::new();
        let usp = probe_port(cs, dev.bdf, &mut msg);

        let dsp = match cs.upstream_bridge(dev.bdf) {
            Ok(dsp_bdf) => {
                result.dsp_bdf = Some(dsp_bdf.to_string());
                probe_port(cs, dsp_bdf, &mut msg)
            }
            Err(e) => {
                msg.push_str(&format!("Error: {}: {e} | ", dev.bdf));
                None
            }
        };

        let test_ready = usp.is_some() && dsp.is_some();
        result.message = Some(msg);
        // A link that failed discovery still appears in the result, carrying
        // its message, so the report shows why it was skipped.
        let placeholder = Port {
            bdf: dev.bdf,
            pcie_cap,
            lmr_base: 0,
            width: 0,
            speed_bps: 0.0,
        };
        links.push(LinkTest {
            usp: usp.unwrap_or_else(|| placeholder.clone()),
            dsp: dsp.unwrap_or(placeholder),
            result,
            test_ready,
        });
    }
    links
}

/// Emit the stream header: schema version and the run-start artifact with
/// one hardware-info entry per receiver that exists.
fn start_run(
    cs: &ConfigSpace,
    ocp: &OcpRun,
    cfg: &LinkMarginTest,
    links: &[LinkTest],
) {
    ocp.stream.schema_version();
    let mut hardware_infos = Vec::new();
    for lt in links {
        if !lt.test_ready {
            continue;
        }
        hardware_infos.push((
            format!("BDF={};RX={}", lt.dsp.bdf, Receiver::DspA1),
            "DSP".to_string(),
        ));
        hardware_infos.push((
            format!("BDF={};RX={}", lt.usp.bdf, Receiver::UspF6),
            "USP".to_string(),
        ));
        let Ok(val) =
            cs.read_word(lt.dsp.bdf, lt.dsp.pcie_cap + PCI_EXP_LNKSTA2)
        else {
            continue;
        };
        if val & PCI_EXP_LNKSTA2_RETIMER != 0 {
            hardware_infos.push((
                format!("BDF={};RX={}", lt.dsp.bdf, Receiver::RetimerUpB2),
                "Retimer0-USP".to_string(),
            ));
            hardware_infos.push((
                format!("BDF={};RX={}", lt.dsp.bdf, Receiver::RetimerDownC3),
                "Retimer0-DSP".to_string(),
            ));
        }
        if val & PCI_EXP_LNKSTA2_2RETIMERS != 0 {
            hardware_infos.push((
                format!("BDF={};RX={}", lt.dsp.bdf, Receiver::RetimerUpD4),
                "Retimer1-USP".to_string(),
            ));
            hardware_infos.push((
                format!("BDF={};RX={}", lt.dsp.bdf, Receiver::RetimerDownE5),
                "Retimer1-DSP".to_string(),
            ));
        }
    }
    let parameters =
        serde_json::to_value(cfg).unwrap_or(serde_json::Value::Null);
    ocp.stream.run_start(
        &ocp.name,
        &ocp.version,
        &ocp.command_line,
        parameters,
        &hardware_infos,
    );
    info!("starting LMT over {} link(s)", links.len());
}
