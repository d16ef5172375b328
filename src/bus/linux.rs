//! Linux register access through device files
//!
//! - I/O ports: `/dev/port`
//! - MSRs: `/dev/cpu/<n>/msr` (requires the `msr` kernel module)
//! - PCI configuration: `/sys/bus/pci/devices/<domain:bus:dev.fn>/config`
//!
//! All require root (or CAP_SYS_RAWIO).

use super::{BusDriver, PciAddress, PciDeviceInfo};
use crate::error::{Error, Result};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PCI_DEVICES: &str = "/sys/bus/pci/devices";

fn map_io(err: io::Error, what: &str) -> Error {
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) => Error::PermissionDenied(what.to_string()),
        Some(libc::ENOENT) | Some(libc::ENXIO) => Error::DeviceNotFound(what.to_string()),
        Some(libc::EIO) => Error::InvalidRead(what.to_string()),
        _ => Error::Io(err),
    }
}

fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

/// Device-file backed driver
#[derive(Default)]
pub struct LinuxBus {
    port: Mutex<Option<Arc<File>>>,
    msr: Mutex<HashMap<usize, Arc<File>>>,
}

impl LinuxBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn port_file(&self) -> Result<Arc<File>> {
        let mut slot = self.port.lock();
        if let Some(file) = slot.as_ref() {
            return Ok(Arc::clone(file));
        }
        let file = Arc::new(open_rw(Path::new("/dev/port")).map_err(|e| map_io(e, "/dev/port"))?);
        *slot = Some(Arc::clone(&file));
        Ok(file)
    }

    fn msr_file(&self, cpu: usize) -> Result<Arc<File>> {
        let mut files = self.msr.lock();
        if let Some(file) = files.get(&cpu) {
            return Ok(Arc::clone(file));
        }
        let path = format!("/dev/cpu/{}/msr", cpu);
        let file = Arc::new(open_rw(Path::new(&path)).map_err(|e| map_io(e, &path))?);
        files.insert(cpu, Arc::clone(&file));
        Ok(file)
    }

    fn config_path(address: PciAddress) -> PathBuf {
        PathBuf::from(PCI_DEVICES)
            .join(format!(
                "0000:{:02x}:{:02x}.{:x}",
                address.bus, address.device, address.function
            ))
            .join("config")
    }
}

/// Parse a sysfs PCI slot name like `0000:00:18.3`
fn parse_slot(name: &str) -> Option<PciAddress> {
    let mut parts = name.split(':');
    let domain = parts.next()?;
    let bus = parts.next()?;
    let devfn = parts.next()?;
    if domain != "0000" {
        return None;
    }
    let (device, function) = devfn.split_once('.')?;
    Some(PciAddress::new(
        u8::from_str_radix(bus, 16).ok()?,
        u8::from_str_radix(device, 16).ok()?,
        u8::from_str_radix(function, 16).ok()?,
    ))
}

fn read_hex_id(path: &Path) -> Option<u16> {
    let s = fs::read_to_string(path).ok()?;
    u16::from_str_radix(s.trim().trim_start_matches("0x"), 16).ok()
}

impl BusDriver for LinuxBus {
    fn name(&self) -> &str {
        "linux"
    }

    fn read_port(&self, port: u16) -> Result<u8> {
        let file = self.port_file()?;
        let mut buf = [0u8; 1];
        file.read_exact_at(&mut buf, port as u64)
            .map_err(|e| map_io(e, "/dev/port"))?;
        Ok(buf[0])
    }

    fn write_port(&self, port: u16, value: u8) -> Result<()> {
        let file = self.port_file()?;
        file.write_all_at(&[value], port as u64)
            .map_err(|e| map_io(e, "/dev/port"))
    }

    fn read_msr(&self, cpu: usize, index: u32) -> Result<u64> {
        let file = self.msr_file(cpu)?;
        let mut buf = [0u8; 8];
        file.read_exact_at(&mut buf, index as u64)
            .map_err(|e| map_io(e, &format!("MSR {:#x} on cpu {}", index, cpu)))?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_msr(&self, cpu: usize, index: u32, value: u64) -> Result<()> {
        let file = self.msr_file(cpu)?;
        file.write_all_at(&value.to_le_bytes(), index as u64)
            .map_err(|e| map_io(e, &format!("MSR {:#x} on cpu {}", index, cpu)))
    }

    fn read_pci_config(&self, address: PciAddress, offset: u16) -> Result<u32> {
        let path = Self::config_path(address);
        let file = File::open(&path).map_err(|e| map_io(e, &path.display().to_string()))?;
        let mut buf = [0u8; 4];
        let n = file
            .read_at(&mut buf, offset as u64)
            .map_err(|e| map_io(e, &path.display().to_string()))?;
        if n < buf.len() {
            // unprivileged readers only see the first 64 bytes
            return Err(Error::PermissionDenied(format!(
                "{} offset {:#x}",
                path.display(),
                offset
            )));
        }
        Ok(u32::from_le_bytes(buf))
    }

    fn write_pci_config(&self, address: PciAddress, offset: u16, value: u32) -> Result<()> {
        let path = Self::config_path(address);
        let file = open_rw(&path).map_err(|e| map_io(e, &path.display().to_string()))?;
        file.write_all_at(&value.to_le_bytes(), offset as u64)
            .map_err(|e| map_io(e, &path.display().to_string()))
    }

    fn pci_devices(&self) -> Result<Vec<PciDeviceInfo>> {
        let entries = match fs::read_dir(PCI_DEVICES) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("PCI enumeration unavailable: {}", e);
                return Ok(Vec::new());
            }
        };

        let mut devices = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(address) = parse_slot(&name) else {
                continue;
            };
            let path = entry.path();
            if let (Some(vendor_id), Some(device_id)) = (
                read_hex_id(&path.join("vendor")),
                read_hex_id(&path.join("device")),
            ) {
                devices.push(PciDeviceInfo {
                    address,
                    vendor_id,
                    device_id,
                });
            }
        }
        Ok(devices)
    }
}
