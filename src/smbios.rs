//! SMBIOS structure table decoding
//!
//! Only the structures the mainboard and memory reports need are decoded:
//! BIOS (type 0), system (1), base board (2), processor (4) and memory
//! device (17). Fields are read by fixed offset and bounded by the
//! structure's formatted length, so short tables from old firmware simply
//! leave the newer fields empty.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

const TYPE_BIOS: u8 = 0;
const TYPE_SYSTEM: u8 = 1;
const TYPE_BASE_BOARD: u8 = 2;
const TYPE_PROCESSOR: u8 = 4;
const TYPE_MEMORY_DEVICE: u8 = 17;
const TYPE_END_OF_TABLE: u8 = 127;

/// Source of the raw SMBIOS structure table
pub trait FirmwareTables: Send + Sync {
    fn smbios(&self) -> Result<Vec<u8>>;
}

/// Linux exports the table through sysfs
#[derive(Debug, Clone)]
pub struct SysfsTables {
    path: PathBuf,
}

impl SysfsTables {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/sys/firmware/dmi/tables/DMI"),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for SysfsTables {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmwareTables for SysfsTables {
    fn smbios(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                Error::PermissionDenied(format!("{}: {}", self.path.display(), e))
            }
            std::io::ErrorKind::NotFound => Error::NotSupported(format!("{} not present", self.path.display())),
            _ => Error::Io(e),
        })
    }
}

/// In-memory table, for tests and replaying captured dumps
#[derive(Debug, Clone, Default)]
pub struct RawTables(pub Vec<u8>);

impl FirmwareTables for RawTables {
    fn smbios(&self) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BiosInformation {
    pub vendor: Option<String>,
    pub version: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInformation {
    pub manufacturer: Option<String>,
    pub product_name: Option<String>,
    pub version: Option<String>,
    pub serial_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseBoardInformation {
    pub manufacturer: Option<String>,
    pub product_name: Option<String>,
    pub version: Option<String>,
    pub serial_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorInformation {
    pub socket: Option<String>,
    pub manufacturer: Option<String>,
    pub version: Option<String>,
    /// Reference clock in MHz
    pub external_clock: Option<u16>,
    pub max_speed: Option<u16>,
    pub current_speed: Option<u16>,
    pub core_count: Option<u8>,
    pub thread_count: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryDevice {
    pub device_locator: Option<String>,
    pub bank_locator: Option<String>,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
    pub part_number: Option<String>,
    /// Installed size in MiB; `None` for an empty slot
    pub size_mb: Option<u32>,
    /// Rated speed in MT/s
    pub speed: Option<u16>,
    pub configured_speed: Option<u16>,
}

/// One raw structure: formatted area plus its string set
struct Structure<'a> {
    kind: u8,
    formatted: &'a [u8],
    strings: Vec<&'a [u8]>,
}

impl Structure<'_> {
    fn byte(&self, offset: usize) -> Option<u8> {
        self.formatted.get(offset).copied()
    }

    fn word(&self, offset: usize) -> Option<u16> {
        let b = self.formatted.get(offset..offset + 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    fn dword(&self, offset: usize) -> Option<u32> {
        let b = self.formatted.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// String referenced by the 1-based index at `offset`
    fn string(&self, offset: usize) -> Option<String> {
        let index = self.byte(offset)? as usize;
        if index == 0 {
            return None;
        }
        let raw = self.strings.get(index - 1)?;
        let s = String::from_utf8_lossy(raw).trim().to_string();
        (!s.is_empty()).then_some(s)
    }
}

/// Split a structure table; stops at the end-of-table marker or the first
/// malformed header
fn structures(data: &[u8]) -> Vec<Structure<'_>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + 4 <= data.len() {
        let kind = data[pos];
        let length = data[pos + 1] as usize;
        if length < 4 || pos + length > data.len() {
            break;
        }
        let formatted = &data[pos..pos + length];

        // string set ends with a double NUL
        let mut end = pos + length;
        let mut strings = Vec::new();
        let mut start = end;
        let mut terminated = false;
        while end < data.len() {
            if data[end] == 0 {
                if end == start {
                    end += 1;
                    terminated = true;
                    break;
                }
                strings.push(&data[start..end]);
                start = end + 1;
            }
            end += 1;
        }
        if !terminated {
            break;
        }
        // an empty string set is two NULs
        if strings.is_empty() && data.get(end) == Some(&0) {
            end += 1;
        }

        out.push(Structure {
            kind,
            formatted,
            strings,
        });
        if kind == TYPE_END_OF_TABLE {
            break;
        }
        pos = end;
    }
    out
}

/// Decoded subset of the SMBIOS table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Smbios {
    pub bios: Option<BiosInformation>,
    pub system: Option<SystemInformation>,
    pub board: Option<BaseBoardInformation>,
    pub processors: Vec<ProcessorInformation>,
    pub memory_devices: Vec<MemoryDevice>,
}

impl Smbios {
    pub fn parse(data: &[u8]) -> Self {
        let mut smbios = Smbios::default();
        for s in structures(data) {
            match s.kind {
                TYPE_BIOS => {
                    smbios.bios = Some(BiosInformation {
                        vendor: s.string(0x04),
                        version: s.string(0x05),
                        date: s.string(0x08),
                    })
                }
                TYPE_SYSTEM => {
                    smbios.system = Some(SystemInformation {
                        manufacturer: s.string(0x04),
                        product_name: s.string(0x05),
                        version: s.string(0x06),
                        serial_number: s.string(0x07),
                    })
                }
                TYPE_BASE_BOARD => {
                    smbios.board = Some(BaseBoardInformation {
                        manufacturer: s.string(0x04),
                        product_name: s.string(0x05),
                        version: s.string(0x06),
                        serial_number: s.string(0x07),
                    })
                }
                TYPE_PROCESSOR => smbios.processors.push(ProcessorInformation {
                    socket: s.string(0x04),
                    manufacturer: s.string(0x07),
                    version: s.string(0x10),
                    external_clock: s.word(0x12).filter(|v| *v != 0),
                    max_speed: s.word(0x14).filter(|v| *v != 0),
                    current_speed: s.word(0x16).filter(|v| *v != 0),
                    core_count: s.byte(0x23).filter(|v| *v != 0),
                    thread_count: s.byte(0x25).filter(|v| *v != 0),
                }),
                TYPE_MEMORY_DEVICE => smbios.memory_devices.push(MemoryDevice {
                    device_locator: s.string(0x10),
                    bank_locator: s.string(0x11),
                    manufacturer: s.string(0x17),
                    serial_number: s.string(0x18),
                    part_number: s.string(0x1A),
                    size_mb: memory_size(&s),
                    speed: s.word(0x15).filter(|v| *v != 0),
                    configured_speed: s.word(0x20).filter(|v| *v != 0),
                }),
                _ => {}
            }
        }
        smbios
    }

    pub fn read(tables: &dyn FirmwareTables) -> Result<Self> {
        Ok(Self::parse(&tables.smbios()?))
    }

    /// Display name for the mainboard node
    pub fn board_name(&self) -> Option<String> {
        let board = self.board.as_ref()?;
        match (&board.manufacturer, &board.product_name) {
            (Some(m), Some(p)) => Some(format!("{} {}", m, p)),
            (None, Some(p)) => Some(p.clone()),
            (Some(m), None) => Some(m.clone()),
            (None, None) => None,
        }
    }

    pub fn report(&self) -> String {
        fn line(r: &mut String, label: &str, value: &Option<String>) {
            if let Some(v) = value {
                let _ = writeln!(r, "{:<22}{}", label, v);
            }
        }

        let mut r = String::new();
        let _ = writeln!(r, "SMBIOS");
        let _ = writeln!(r);
        if let Some(bios) = &self.bios {
            line(&mut r, "BIOS Vendor:", &bios.vendor);
            line(&mut r, "BIOS Version:", &bios.version);
            line(&mut r, "BIOS Date:", &bios.date);
        }
        if let Some(system) = &self.system {
            line(&mut r, "System Manufacturer:", &system.manufacturer);
            line(&mut r, "System Name:", &system.product_name);
            line(&mut r, "System Version:", &system.version);
        }
        if let Some(board) = &self.board {
            line(&mut r, "Board Manufacturer:", &board.manufacturer);
            line(&mut r, "Board Name:", &board.product_name);
            line(&mut r, "Board Version:", &board.version);
        }
        for (i, p) in self.processors.iter().enumerate() {
            let _ = writeln!(r);
            let _ = writeln!(r, "Processor {}", i);
            line(&mut r, "  Socket:", &p.socket);
            line(&mut r, "  Version:", &p.version);
            if let Some(clock) = p.external_clock {
                let _ = writeln!(r, "{:<22}{} MHz", "  External Clock:", clock);
            }
        }
        for m in &self.memory_devices {
            let Some(size) = m.size_mb else { continue };
            let _ = writeln!(r);
            line(&mut r, "Memory Device:", &m.device_locator);
            line(&mut r, "  Bank:", &m.bank_locator);
            line(&mut r, "  Manufacturer:", &m.manufacturer);
            line(&mut r, "  Part Number:", &m.part_number);
            let _ = writeln!(r, "{:<22}{} MB", "  Size:", size);
            if let Some(speed) = m.configured_speed.or(m.speed) {
                let _ = writeln!(r, "{:<22}{} MT/s", "  Speed:", speed);
            }
        }
        r
    }
}

fn memory_size(s: &Structure<'_>) -> Option<u32> {
    match s.word(0x0C)? {
        0 | 0xFFFF => None,
        // extended size field holds MiB
        0x7FFF => s.dword(0x1C).map(|v| v & 0x7FFF_FFFF),
        v if v & 0x8000 != 0 => Some(u32::from(v & 0x7FFF) / 1024),
        v => Some(u32::from(v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn structure(kind: u8, body: &[u8], strings: &[&str]) -> Vec<u8> {
        let mut out = vec![kind, (body.len() + 4) as u8, 0x00, 0x00];
        out.extend_from_slice(body);
        if strings.is_empty() {
            out.extend_from_slice(&[0, 0]);
        } else {
            for s in strings {
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            out.push(0);
        }
        out
    }

    fn table() -> Vec<u8> {
        let mut data = Vec::new();
        // BIOS: vendor=1 version=2 start=0 date=3
        data.extend(structure(TYPE_BIOS, &[1, 2, 0, 0, 3], &["AMI", "F12", "03/01/2024"]));
        // board: manufacturer=1 product=2
        data.extend(structure(TYPE_BASE_BOARD, &[1, 2, 0, 0], &["Gigabyte", "X570 AORUS"]));

        let mut memory = vec![0u8; 0x22 - 4];
        memory[0x0C - 4..0x0E - 4].copy_from_slice(&16384u16.to_le_bytes());
        memory[0x10 - 4] = 1;
        memory[0x11 - 4] = 2;
        memory[0x15 - 4..0x17 - 4].copy_from_slice(&3200u16.to_le_bytes());
        memory[0x1A - 4] = 3;
        memory[0x20 - 4..0x22 - 4].copy_from_slice(&3600u16.to_le_bytes());
        data.extend(structure(TYPE_MEMORY_DEVICE, &memory, &["DIMM_A1", "BANK 0", "F4-3600C16"]));

        // empty slot
        let empty = vec![0u8; 0x22 - 4];
        data.extend(structure(TYPE_MEMORY_DEVICE, &empty, &[]));

        data.extend(structure(TYPE_END_OF_TABLE, &[], &[]));
        // trailing garbage after the end marker is ignored
        data.extend_from_slice(&[0x01, 0x02]);
        data
    }

    #[test]
    fn test_parse_table() {
        let smbios = Smbios::parse(&table());
        let bios = smbios.bios.as_ref().unwrap();
        assert_eq!(bios.vendor.as_deref(), Some("AMI"));
        assert_eq!(bios.date.as_deref(), Some("03/01/2024"));
        assert_eq!(smbios.board_name().as_deref(), Some("Gigabyte X570 AORUS"));
        assert!(smbios.system.is_none());

        assert_eq!(smbios.memory_devices.len(), 2);
        let dimm = &smbios.memory_devices[0];
        assert_eq!(dimm.device_locator.as_deref(), Some("DIMM_A1"));
        assert_eq!(dimm.part_number.as_deref(), Some("F4-3600C16"));
        assert_eq!(dimm.size_mb, Some(16384));
        assert_eq!(dimm.speed, Some(3200));
        assert_eq!(dimm.configured_speed, Some(3600));
        assert_eq!(smbios.memory_devices[1].size_mb, None);
    }

    #[test]
    fn test_memory_size_units() {
        let mut body = vec![0u8; 0x20 - 4];
        body[0x0C - 4..0x0E - 4].copy_from_slice(&0x7FFFu16.to_le_bytes());
        body[0x1C - 4..0x20 - 4].copy_from_slice(&65536u32.to_le_bytes());
        let data = structure(TYPE_MEMORY_DEVICE, &body, &[]);
        assert_eq!(Smbios::parse(&data).memory_devices[0].size_mb, Some(65536));

        let mut body = vec![0u8; 0x20 - 4];
        body[0x0C - 4..0x0E - 4].copy_from_slice(&(0x8000u16 | 2048).to_le_bytes());
        let data = structure(TYPE_MEMORY_DEVICE, &body, &[]);
        assert_eq!(Smbios::parse(&data).memory_devices[0].size_mb, Some(2));
    }

    #[test]
    fn test_truncated_table() {
        let mut data = table();
        data.truncate(10);
        let smbios = Smbios::parse(&data);
        assert!(smbios.bios.is_none());
        assert!(Smbios::parse(&[]).memory_devices.is_empty());
    }

    #[test]
    fn test_report_and_reader() {
        let smbios = Smbios::read(&RawTables(table())).unwrap();
        let report = smbios.report();
        assert!(report.contains("Board Name:"));
        assert!(report.contains("DIMM_A1"));
        assert!(report.contains("3600 MT/s"));

        let missing = SysfsTables::with_path("/nonexistent/silicore/DMI");
        assert!(missing.smbios().is_err());
    }
}
