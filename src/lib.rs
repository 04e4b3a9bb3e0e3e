// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCIe lane margining at the receiver
//!
//! This crate runs the Lane Margining at the Receiver (LMR) protocol from
//! PCIe Base Specification 5.0 (4.2.13, 7.7.7, 8.4.4) against every lane of
//! one or more PCIe links. Margining refers to stepping a receiver's sampling
//! point away from the eye center, in time (left/right) or voltage (up/down),
//! and counting the bit errors observed at the shifted position. The result
//! is the acceptable leeway, or margin, in the sampling parameters, which is
//! the standard software-visible measure of link signal integrity.
//!
//! A test run is described by a [`config::LinkMarginTest`]: a set of link
//! filters, each carrying per-receiver test specs. For every matching link
//! the tool prepares both ports (ASPM off, autonomous speed/width changes
//! disabled), margins the requested receivers lane by lane, and restores the
//! ports before reporting. Links run concurrently; inside a receiver, lanes
//! run in parallel exactly when the hardware advertises an independent error
//! sampler.

pub mod caps;
pub mod cmdrsp;
pub mod config;
pub mod eye;
pub mod lane;
pub mod link;
pub mod ocp;
pub mod pci;
pub mod report;
pub mod run;

use thiserror::Error;

/// Errors working with a PCIe device or the LMR protocol.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid bus/device/function string: \"{0}\"")]
    InvalidBdf(String),

    #[error("Invalid lane: {0}")]
    InvalidLane(u32),

    #[error("Invalid value for a PCIe configuration parameter '{parameter}': {value:#x}")]
    InvalidPcieParameter { parameter: &'static str, value: u64 },

    #[error("{0} capability not found")]
    CapabilityNotFound(&'static str),

    #[error("Capability chain loops at {0:#x}")]
    CapabilityLoop(u16),

    #[error("No upstream bridge for device {0}")]
    NoUpstreamBridge(String),

    #[error(
        "LMR command timed out: match_payload={match_payload}, \
         cmd={cmd:#06x}, last response={rsp:#06x}"
    )]
    CommandTimeout { match_payload: bool, cmd: u16, rsp: u16 },

    #[error("An error occurred during lane margining: {0}")]
    Margin(String),

    #[error("Invalid test configuration: {0}")]
    Config(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
