// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCIe lane margining at the receiver

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use pcie_lmt::config::LinkMarginTest;
use pcie_lmt::ocp::OcpStream;
use pcie_lmt::pci::ConfigSpace;
use pcie_lmt::report;
use pcie_lmt::run::{margin_links, OcpRun};

/// The `pcie-lmt` program runs the PCIe Lane Margining at the Receiver
/// protocol over every lane of the links selected by a test specification.
///
/// Lane margining refers to the process of determining the maximum shift in
/// either the timing or voltage of a receiver's sampling machinery at which
/// an acceptable bit-error rate may still be achieved. The protocol involves
/// "stepping" the receiver's sampling left or right (in time) or up and down
/// (in voltage), and counting the bit errors at those new sampling
/// parameters. This generates a "margin", or acceptable leeway, in the
/// sampling parameters, and is a useful tool for diagnosing signal
/// integrity problems.
///
/// The test specification selects links by vendor ID, device ID, and/or bus
/// number, and carries per-receiver margining parameters. It is accepted as
/// TOML or JSON; results are written back in the same schema.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// The test spec file, in the TOML text form.
    #[clap(long, conflicts_with = "spec_json")]
    spec: Option<PathBuf>,

    /// The test spec file, in JSON.
    #[clap(long)]
    spec_json: Option<PathBuf>,

    /// The result file name. The extension selects the encoding.
    #[clap(long, default_value = "result.toml")]
    result: PathBuf,

    /// Also dump a flat CSV file for plotting.
    #[clap(long)]
    csv: Option<PathBuf>,

    /// Convert an existing result file to a CSV instead of running a test.
    #[clap(long, requires = "csv")]
    result2csv: bool,

    /// Stream OCP-Diag output artifacts (JSON lines) to this file.
    #[clap(long)]
    ocp: Option<PathBuf>,

    /// The 16-bit vendor ID of the USP, overriding the spec. Accepts
    /// hexadecimal with a 0x prefix.
    #[clap(long, value_parser = parse_int)]
    vendor_id: Option<u32>,

    /// The 16-bit device ID of the USP, overriding the spec.
    #[clap(long, value_parser = parse_int)]
    device_id: Option<u32>,

    /// A comma-separated list of bus numbers, overriding the spec.
    #[clap(long)]
    bus: Option<String>,

    /// Print verbose information about the margining process.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Accept `0x`-prefixed hex or plain decimal.
fn parse_int(s: &str) -> std::result::Result<u32, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

fn dump_effective_spec(spec_path: &Path, cfg: &LinkMarginTest) -> Result<()> {
    let dump = spec_path.with_extension("dump.json");
    std::fs::write(
        &dump,
        serde_json::to_string_pretty(cfg)
            .context("failed encoding the spec dump")?,
    )
    .with_context(|| format!("failed writing {}", dump.display()))?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level),
    )
    .init();

    if args.result2csv {
        let csv = args.csv.as_ref().expect("clap enforces --csv");
        let result = LinkMarginTest::load(&args.result).with_context(|| {
            format!("failed reading result {}", args.result.display())
        })?;
        let mut out = File::create(csv)
            .with_context(|| format!("failed creating {}", csv.display()))?;
        report::convert_to_csv(&result, &mut out)?;
        return Ok(());
    }

    let spec_path = match (&args.spec, &args.spec_json) {
        (Some(p), _) | (_, Some(p)) => p.clone(),
        (None, None) => {
            bail!("either --spec or --spec-json must be specified")
        }
    };
    let mut cfg = LinkMarginTest::load(&spec_path).with_context(|| {
        format!("failed reading spec {}", spec_path.display())
    })?;

    // Command-line overrides apply to every link entry.
    for lm in &mut cfg.link_margin {
        if let Some(vid) = args.vendor_id {
            if vid > 0xFFFF {
                bail!("vendor_id {vid:#x} is out of range [0:0xffff]");
            }
            lm.vendor_id = Some(vid);
        }
        if let Some(did) = args.device_id {
            if did > 0xFFFF {
                bail!("device_id {did:#x} is out of range [0:0xffff]");
            }
            lm.device_id = Some(did);
        }
        if let Some(bus) = &args.bus {
            lm.bus = bus
                .split(',')
                .map(|s| {
                    parse_int(s.trim()).map_err(|e| {
                        anyhow::anyhow!("invalid bus number \"{s}\": {e}")
                    })
                })
                .collect::<Result<Vec<_>>>()?;
        }
    }

    // Keep a record of what actually ran next to the input.
    dump_effective_spec(&spec_path, &cfg)?;

    let ocp = match &args.ocp {
        Some(path) => {
            let file = File::create(path).with_context(|| {
                format!("failed creating {}", path.display())
            })?;
            Some(OcpRun {
                stream: Arc::new(OcpStream::new(Box::new(file))),
                name: "pcie_lmt".to_string(),
                version: clap::crate_version!().to_string(),
                command_line: std::env::args()
                    .collect::<Vec<_>>()
                    .join(" "),
            })
        }
        None => None,
    };

    let cs = Arc::new(ConfigSpace::system());
    let start = Instant::now();
    info!("starting LMT");
    let result = margin_links(&cs, &cfg, ocp.as_ref())
        .context("lane margin test failed")?;
    info!("finished lane margining: duration = {:?}", start.elapsed());

    result.store(&args.result).with_context(|| {
        format!("failed writing result {}", args.result.display())
    })?;

    if let Some(csv) = &args.csv {
        let mut out = File::create(csv)
            .with_context(|| format!("failed creating {}", csv.display()))?;
        report::convert_to_csv(&result, &mut out)?;
    }

    let tally = report::tally(&result);
    for port in &tally.port_results {
        info!("{}", port.message);
    }
    info!(
        "{} lanes tested, {} passed: {}",
        tally.num_lane_tested,
        tally.num_lane_passed,
        if tally.pass { "PASS" } else { "FAIL" }
    );

    Ok(())
}
