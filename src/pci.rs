// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCI configuration-space access.
//!
//! Everything the margining engine knows about a device is its [`Bdf`]; the
//! actual register traffic goes through a [`ConfigSpace`], which serializes
//! every access behind one process-wide mutex. The backend below it is a
//! trait so the engine can be driven either by the real `/sys/bus/pci`
//! files or by a simulated PHY in tests.

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::{Error, Result};

const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// A PCI Domain/Bus/Device/Function address, identifying a single function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bdf {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl std::str::FromStr for Bdf {
    type Err = Error;

    /// Parse the canonical sysfs form, `dddd:bb:dd.f`.
    fn from_str(s: &str) -> Result<Self> {
        let err = || Error::InvalidBdf(s.to_string());
        let (domain, rest) = s.split_once(':').ok_or_else(err)?;
        let (bus, devfn) = rest.split_once(':').ok_or_else(err)?;
        let (device, function) = devfn.split_once('.').ok_or_else(err)?;
        Ok(Bdf {
            domain: u16::from_str_radix(domain, 16).map_err(|_| err())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| err())?,
            device: u8::from_str_radix(device, 16).map_err(|_| err())?,
            function: u8::from_str_radix(function, 16).map_err(|_| err())?,
        })
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// Identity of one scanned PCI function.
#[derive(Debug, Clone, Copy)]
pub struct DevInfo {
    pub bdf: Bdf,
    pub vendor_id: u16,
    pub device_id: u16,
    pub header_type: u8,
}

/// The minimal operations the margining engine needs from a config-space
/// implementation. The real backend does `/sys/bus/pci` I/O; tests provide a
/// register-accurate simulation.
///
/// Backends are not required to be thread-safe. [`ConfigSpace`] guarantees
/// that at most one call is in flight at a time.
pub trait ConfigBackend: Send {
    /// Enumerate all PCI functions.
    fn scan(&mut self) -> Result<Vec<DevInfo>>;

    /// Resolve the bridge this function hangs off, i.e. the downstream port
    /// of the link when `bdf` is an endpoint or a switch upstream port.
    fn upstream_bridge(&mut self, bdf: Bdf) -> Result<Bdf>;

    fn read_byte(&mut self, bdf: Bdf, offset: u16) -> Result<u8>;
    fn read_word(&mut self, bdf: Bdf, offset: u16) -> Result<u16>;
    fn read_long(&mut self, bdf: Bdf, offset: u16) -> Result<u32>;
    fn write_byte(&mut self, bdf: Bdf, offset: u16, val: u8) -> Result<()>;
    fn write_word(&mut self, bdf: Bdf, offset: u16, val: u16) -> Result<()>;
    fn write_long(&mut self, bdf: Bdf, offset: u16, val: u32) -> Result<()>;
}

/// Process-wide serialized view of PCI configuration space.
///
/// Margining runs many lanes from many threads, but the backend is single
/// threaded; every operation takes the mutex for just that operation, so a
/// polling loop holds it per tick rather than for a whole dwell.
pub struct ConfigSpace {
    backend: Mutex<Box<dyn ConfigBackend>>,
}

impl ConfigSpace {
    pub fn new(backend: Box<dyn ConfigBackend>) -> Self {
        Self { backend: Mutex::new(backend) }
    }

    /// Open the real sysfs-backed config space.
    pub fn system() -> Self {
        Self::new(Box::new(SysfsBackend::new()))
    }

    fn locked<T>(
        &self,
        op: impl FnOnce(&mut dyn ConfigBackend) -> Result<T>,
    ) -> Result<T> {
        let mut backend =
            self.backend.lock().unwrap_or_else(|e| e.into_inner());
        op(backend.as_mut())
    }

    pub fn scan(&self) -> Result<Vec<DevInfo>> {
        self.locked(|b| b.scan())
    }

    pub fn upstream_bridge(&self, bdf: Bdf) -> Result<Bdf> {
        self.locked(|b| b.upstream_bridge(bdf))
    }

    pub fn read_byte(&self, bdf: Bdf, offset: u16) -> Result<u8> {
        self.locked(|b| b.read_byte(bdf, offset))
    }

    pub fn read_word(&self, bdf: Bdf, offset: u16) -> Result<u16> {
        self.locked(|b| b.read_word(bdf, offset))
    }

    pub fn read_long(&self, bdf: Bdf, offset: u16) -> Result<u32> {
        self.locked(|b| b.read_long(bdf, offset))
    }

    pub fn write_byte(&self, bdf: Bdf, offset: u16, val: u8) -> Result<()> {
        self.locked(|b| b.write_byte(bdf, offset, val))
    }

    pub fn write_word(&self, bdf: Bdf, offset: u16, val: u16) -> Result<()> {
        self.locked(|b| b.write_word(bdf, offset, val))
    }

    pub fn write_long(&self, bdf: Bdf, offset: u16, val: u32) -> Result<()> {
        self.locked(|b| b.write_long(bdf, offset, val))
    }
}

/// Config space over the Linux sysfs `config` files.
///
/// Register values in the `config` file are little-endian regardless of host
/// byte order. Writes to config space generally require root; `scan` logs a
/// warning when running without it.
pub struct SysfsBackend {
    root: PathBuf,
    // One open handle per function, opened lazily on first access.
    files: HashMap<Bdf, File>,
}

impl SysfsBackend {
    pub fn new() -> Self {
        Self::with_root(SYSFS_PCI_DEVICES)
    }

    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf(), files: HashMap::new() }
    }

    fn config_file(&mut self, bdf: Bdf) -> Result<&File> {
        if !self.files.contains_key(&bdf) {
            let path = self.root.join(bdf.to_string()).join("config");
            let file =
                OpenOptions::new().read(true).write(true).open(path)?;
            self.files.insert(bdf, file);
        }
        Ok(&self.files[&bdf])
    }

    fn read_exact_at(&mut self, bdf: Bdf, offset: u16, buf: &mut [u8]) -> Result<()> {
        self.config_file(bdf)?.read_exact_at(buf, u64::from(offset))?;
        Ok(())
    }

    fn write_all_at(&mut self, bdf: Bdf, offset: u16, buf: &[u8]) -> Result<()> {
        self.config_file(bdf)?.write_all_at(buf, u64::from(offset))?;
        Ok(())
    }
}

impl Default for SysfsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBackend for SysfsBackend {
    fn scan(&mut self) -> Result<Vec<DevInfo>> {
        // SAFETY: geteuid has no failure modes or side effects.
        if unsafe { libc::geteuid() } != 0 {
            log::warn!(
                "not running as root; config-space writes will likely fail"
            );
        }
        let mut devs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Ok(bdf) = name.to_string_lossy().parse::<Bdf>() else {
                continue;
            };
            let vendor_id = self.read_word(bdf, 0x00)?;
            let device_id = self.read_word(bdf, 0x02)?;
            let header_type = self.read_byte(bdf, 0x0E)? & 0x7F;
            devs.push(DevInfo { bdf, vendor_id, device_id, header_type });
        }
        devs.sort_by_key(|d| d.bdf);
        Ok(devs)
    }

    fn upstream_bridge(&mut self, bdf: Bdf) -> Result<Bdf> {
        // The sysfs device path nests each function under its parent bridge:
        // .../<bridge bdf>/<bdf>. Resolve the symlink and take the parent
        // directory's name.
        let link = self.root.join(bdf.to_string());
        let target = std::fs::read_link(&link)?;
        let parent = target
            .parent()
            .and_then(Path::file_name)
            .ok_or_else(|| Error::NoUpstreamBridge(bdf.to_string()))?;
        parent
            .to_string_lossy()
            .parse()
            .map_err(|_| Error::NoUpstreamBridge(bdf.to_string()))
    }

    fn read_byte(&mut self, bdf: Bdf, offset: u16) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact_at(bdf, offset, &mut buf)?;
        Ok(buf[0])
    }

    fn read_word(&mut self, bdf: Bdf, offset: u16) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact_at(bdf, offset, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_long(&mut self, bdf: Bdf, offset: u16) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact_at(bdf, offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_byte(&mut self, bdf: Bdf, offset: u16, val: u8) -> Result<()> {
        self.write_all_at(bdf, offset, &[val])
    }

    fn write_word(&mut self, bdf: Bdf, offset: u16, val: u16) -> Result<()> {
        self.write_all_at(bdf, offset, &val.to_le_bytes())
    }

    fn write_long(&mut self, bdf: Bdf, offset: u16, val: u32) -> Result<()> {
        self.write_all_at(bdf, offset, &val.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bdf_parse_roundtrip() {
        let bdf: Bdf = "0000:3b:00.0".parse().unwrap();
        assert_eq!(bdf.domain, 0);
        assert_eq!(bdf.bus, 0x3b);
        assert_eq!(bdf.device, 0);
        assert_eq!(bdf.function, 0);
        assert_eq!(bdf.to_string(), "0000:3b:00.0");

        let bdf: Bdf = "00a1:ff:1f.7".parse().unwrap();
        assert_eq!(bdf.domain, 0xa1);
        assert_eq!(bdf.bus, 0xff);
        assert_eq!(bdf.device, 0x1f);
        assert_eq!(bdf.function, 7);
    }

    #[test]
    fn bdf_parse_rejects_garbage() {
        assert!("".parse::<Bdf>().is_err());
        assert!("3b:00.0".parse::<Bdf>().is_err());
        assert!("0000:3b:00".parse::<Bdf>().is_err());
        assert!("zzzz:3b:00.0".parse::<Bdf>().is_err());
    }
}
