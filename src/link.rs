// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Link-level orchestration.
//!
//! Margining must not race link management: before any lane is touched, both
//! ports get ASPM disabled and hardware-autonomous speed/width changes
//! turned off, and whatever state those bits held is put back when the link
//! is done, however it finishes. Within the link, receivers are processed in
//! receiver-number order; lanes of one receiver run in parallel only when
//! the receiver can count errors per lane independently.

use std::sync::{Arc, Barrier};

use log::{debug, info, warn};

use crate::caps::{
    PCI_EXP_LNKCTL, PCI_EXP_LNKCTL2, PCI_EXP_LNKCTL2_SPEED_DIS,
    PCI_EXP_LNKCTL_ASPM, PCI_EXP_LNKCTL_HWAUTWD, PCI_EXP_LNKSTA2,
    PCI_EXP_LNKSTA2_2RETIMERS, PCI_EXP_LNKSTA2_RETIMER,
};
use crate::config::{Aspect, LinkMargin, Receiver};
use crate::lane::Lane;
use crate::ocp::OcpStream;
use crate::pci::{Bdf, ConfigSpace};
use crate::run::QuiesceGate;
use crate::Result;

/// One side of a link under test.
#[derive(Debug, Clone)]
pub struct Port {
    pub bdf: Bdf,
    /// PCI Express capability offset.
    pub pcie_cap: u16,
    /// LMR extended capability offset.
    pub lmr_base: u16,
    /// Negotiated width, lanes.
    pub width: u32,
    /// Line rate in bits per second.
    pub speed_bps: f64,
}

/// Everything needed to margin one link.
pub struct LinkTest {
    pub usp: Port,
    pub dsp: Port,
    /// The per-link result record, seeded from the input spec.
    pub result: LinkMargin,
    pub test_ready: bool,
}

/// Set the width-disable bit and clear ASPM for the duration of the test.
pub(crate) fn prep_lnkctl(val: u16) -> u16 {
    (val | PCI_EXP_LNKCTL_HWAUTWD) & !PCI_EXP_LNKCTL_ASPM
}

pub(crate) fn prep_lnkctl2(val: u16) -> u16 {
    val | PCI_EXP_LNKCTL2_SPEED_DIS
}

/// Put the captured width-disable bit back, leaving the rest of the current
/// value (including the captured ASPM bits written by the caller) alone.
pub(crate) fn restore_lnkctl(val: u16, hawd: bool, aspm: u16) -> u16 {
    let val = if hawd {
        val | PCI_EXP_LNKCTL_HWAUTWD
    } else {
        val & !PCI_EXP_LNKCTL_HWAUTWD
    };
    (val & !PCI_EXP_LNKCTL_ASPM) | (aspm & PCI_EXP_LNKCTL_ASPM)
}

/// Put the captured speed-disable bit back into Link Control 2.
pub(crate) fn restore_lnkctl2(val: u16, hasd: bool) -> u16 {
    if hasd {
        val | PCI_EXP_LNKCTL2_SPEED_DIS
    } else {
        val & !PCI_EXP_LNKCTL2_SPEED_DIS
    }
}

/// Captured pre-test state of one port's link-control registers.
struct SavedPort {
    bdf: Bdf,
    pcie_cap: u16,
    hawd: bool,
    hasd: bool,
    aspm: u16,
}

/// Restores both ports' link-control state when dropped, so the restore
/// happens on every exit path, panics included.
struct PrepGuard<'a> {
    cs: &'a ConfigSpace,
    saved: Vec<SavedPort>,
}

impl<'a> PrepGuard<'a> {
    fn prepare(cs: &'a ConfigSpace, ports: [&Port; 2]) -> Result<Self> {
        let mut saved = Vec::with_capacity(2);
        for port in ports {
            let ctl_addr = port.pcie_cap + PCI_EXP_LNKCTL;
            let val = cs.read_word(port.bdf, ctl_addr)?;
            let state = SavedPort {
                bdf: port.bdf,
                pcie_cap: port.pcie_cap,
                hawd: val & PCI_EXP_LNKCTL_HWAUTWD != 0,
                hasd: false,
                aspm: val & PCI_EXP_LNKCTL_ASPM,
            };
            cs.write_word(port.bdf, ctl_addr, prep_lnkctl(val))?;

            let ctl2_addr = port.pcie_cap + PCI_EXP_LNKCTL2;
            let val2 = cs.read_word(port.bdf, ctl2_addr)?;
            let state = SavedPort {
                hasd: val2 & PCI_EXP_LNKCTL2_SPEED_DIS != 0,
                ..state
            };
            cs.write_word(port.bdf, ctl2_addr, prep_lnkctl2(val2))?;
            saved.push(state);
        }
        Ok(Self { cs, saved })
    }
}

impl Drop for PrepGuard<'_> {
    fn drop(&mut self) {
        for port in &self.saved {
            let ctl_addr = port.pcie_cap + PCI_EXP_LNKCTL;
            let restored = self
                .cs
                .read_word(port.bdf, ctl_addr)
                .map(|val| restore_lnkctl(val, port.hawd, port.aspm))
                .and_then(|val| self.cs.write_word(port.bdf, ctl_addr, val));
            if let Err(e) = restored {
                log::error!("failed restoring LnkCtl on {}: {e}", port.bdf);
            }

            let ctl2_addr = port.pcie_cap + PCI_EXP_LNKCTL2;
            let restored = self
                .cs
                .read_word(port.bdf, ctl2_addr)
                .map(|val| restore_lnkctl2(val, port.hasd))
                .and_then(|val| self.cs.write_word(port.bdf, ctl2_addr, val));
            if let Err(e) = restored {
                log::error!("failed restoring LnkCtl2 on {}: {e}", port.bdf);
            }
        }
    }
}

/// One receiver point on the link, with its lanes.
struct ReceiverCtx {
    rec: Receiver,
    hwinfo: String,
    lanes: Vec<Lane>,
    test_ready: bool,
}

impl LinkTest {
    fn note(&mut self, text: impl AsRef<str>) {
        let msg = self.result.message.get_or_insert_with(String::new);
        msg.push_str(text.as_ref());
        msg.push_str(" | ");
    }

    /// Which receivers exist on this link, given the retimer-presence bits.
    fn receiver_present(rec: Receiver, retimer0: bool, retimer1: bool) -> bool {
        match rec {
            Receiver::Broadcast | Receiver::Reserved => false,
            Receiver::RetimerUpB2 | Receiver::RetimerDownC3 => retimer0,
            Receiver::RetimerUpD4 | Receiver::RetimerDownE5 => retimer1,
            Receiver::DspA1 | Receiver::UspF6 => true,
        }
    }

    /// Margin every receiver of this link per the bound test specs. The
    /// result lands in `self.result.receiver_lanes`.
    pub fn margin_link(
        &mut self,
        cs: &Arc<ConfigSpace>,
        gate: &QuiesceGate,
        ocp: Option<&Arc<OcpStream>>,
    ) {
        let _guard =
            match PrepGuard::prepare(cs, [&self.dsp, &self.usp]) {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("link {}: preparation failed: {e}", self.dsp.bdf);
                    self.note(format!("Error: link preparation failed: {e}"));
                    return;
                }
            };

        let (retimer0, retimer1) = match cs
            .read_word(self.dsp.bdf, self.dsp.pcie_cap + PCI_EXP_LNKSTA2)
        {
            Ok(val) => (
                val & PCI_EXP_LNKSTA2_RETIMER != 0,
                val & PCI_EXP_LNKSTA2_2RETIMERS != 0,
            ),
            Err(e) => {
                self.note(format!("Error: reading LnkSta2 failed: {e}"));
                (false, false)
            }
        };
        debug!(
            "link {}: retimer0={retimer0} retimer1={retimer1}",
            self.dsp.bdf
        );

        // Build the receiver table, indexed by receiver number. The USP
        // receiver talks through the USP's config space; the DSP and all
        // retimer pseudo-ports are addressed through the DSP.
        let mut receivers: Vec<Option<ReceiverCtx>> =
            (0..Receiver::COUNT as u8)
                .map(|n| {
                    let rec = Receiver::from_number(n)?;
                    if !Self::receiver_present(rec, retimer0, retimer1) {
                        return None;
                    }
                    let port = if rec == Receiver::UspF6 {
                        &self.usp
                    } else {
                        &self.dsp
                    };
                    let hwinfo = format!("BDF={};RX={}", port.bdf, rec);
                    let lanes = (0..port.width)
                        .map(|n| {
                            Lane::new(
                                Arc::clone(cs),
                                port.bdf,
                                n,
                                port.lmr_base,
                                rec,
                                port.speed_bps,
                                ocp.map(Arc::clone),
                                hwinfo.clone(),
                            )
                        })
                        .collect();
                    Some(ReceiverCtx {
                        rec,
                        hwinfo,
                        lanes,
                        test_ready: false,
                    })
                })
                .collect();

        // Bind each spec to the lanes it addresses.
        for spec in self.result.test_specs.clone() {
            if !spec.receiver.is_marginable() {
                warn!(
                    "illegal test_specs receiver: {}; the test_spec is ignored",
                    spec.receiver
                );
                continue;
            }
            let Some(rx) =
                receivers[usize::from(spec.receiver.number())].as_mut()
            else {
                warn!(
                    "the test_specs receiver {} is not present on the link; \
                     the test_spec is ignored",
                    spec.receiver
                );
                continue;
            };
            rx.test_ready = true;
            for lane in &mut rx.lanes {
                if spec.lane_number.is_empty()
                    || spec.lane_number.contains(&lane.lane_number)
                {
                    match spec.aspect {
                        Aspect::Voltage => lane.vspec = Some(spec.clone()),
                        Aspect::Timing => lane.tspec = Some(spec.clone()),
                    }
                }
            }
        }

        // Process receivers one at a time, in receiver-number order.
        for rx in receivers.iter_mut().flatten() {
            if !rx.test_ready {
                continue;
            }
            info!("margining lanes at receiver {}", rx.rec);
            if let Some(ocp) = ocp {
                ocp.step_start(&rx.hwinfo);
            }

            // Parallel lane margining is only safe when each lane samples
            // errors independently.
            let parallel = match rx.lanes[0].independent_error_sampler() {
                Ok(parallel) => parallel,
                Err(e) => {
                    self.note(e.to_string());
                    false
                }
            };

            let bound: Vec<&mut Lane> = rx
                .lanes
                .iter_mut()
                .filter(|l| l.tspec.is_some() || l.vspec.is_some())
                .collect();
            run_lanes(bound, parallel, gate);

            // Roll the receiver's lanes into the result.
            let mut tested = 0;
            let mut failed = 0;
            for lane in &rx.lanes {
                if lane.tspec.is_none() && lane.vspec.is_none() {
                    continue;
                }
                tested += 1;
                if !lane.pass {
                    failed += 1;
                }
                self.result.receiver_lanes.push(lane.gather_result());
            }
            if let Some(ocp) = ocp {
                ocp.diagnosis(&rx.hwinfo, tested, failed);
                ocp.step_end(&rx.hwinfo);
            }
        }
    }
}

/// Run the bound lanes of one receiver: parameter reads first on every lane,
/// then margining, gated so margining never overlaps a parameter-read phase
/// anywhere in the process.
fn run_lanes(lanes: Vec<&mut Lane>, parallel: bool, gate: &QuiesceGate) {
    if lanes.is_empty() {
        return;
    }
    if !parallel {
        // Strictly one lane at a time, parameter reads included.
        for lane in lanes {
            gate.begin_quiet();
            let prepared = lane.prepare();
            gate.end_quiet();
            match prepared {
                Ok(()) => {
                    gate.wait_quiet_done();
                    lane.execute();
                }
                Err(e) => {
                    warn!("{}: parameter reads failed: {e}", lane.rec);
                    lane.note(e.to_string());
                }
            }
        }
        return;
    }

    let barrier = Barrier::new(lanes.len());
    gate.begin_quiet();
    std::thread::scope(|scope| {
        for lane in lanes {
            let barrier = &barrier;
            scope.spawn(move || {
                let prepared = lane.prepare();
                // Some retimers cannot take parameter reads overlapping
                // margining on another lane; hold every lane here until the
                // receiver is fully through its reads.
                if barrier.wait().is_leader() {
                    gate.end_quiet();
                }
                match prepared {
                    Ok(()) => {
                        gate.wait_quiet_done();
                        lane.execute();
                    }
                    Err(e) => {
                        warn!("{}: parameter reads failed: {e}", lane.rec);
                        lane.note(e.to_string());
                    }
                }
            });
        }
    });
}
