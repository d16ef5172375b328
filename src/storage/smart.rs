// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2024 NervoSys

//! SMART access contract and attribute table decoding

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Attribute table: 30 entries of 12 bytes after the 2-byte revision
const ATTRIBUTE_COUNT: usize = 30;
const ATTRIBUTE_SIZE: usize = 12;
const ATTRIBUTE_OFFSET: usize = 2;

pub const TEMPERATURE: u8 = 0xC2;
pub const AIRFLOW_TEMPERATURE: u8 = 0xBE;
pub const ALTERNATE_TEMPERATURE: u8 = 0xE7;
pub const POWER_ON_HOURS: u8 = 0x09;
pub const TOTAL_LBAS_WRITTEN: u8 = 0xF1;
pub const TOTAL_LBAS_READ: u8 = 0xF2;

/// Attributes whose temperature is in raw byte 0, in order of preference
pub const TEMPERATURE_ATTRIBUTES: [u8; 3] = [TEMPERATURE, AIRFLOW_TEMPERATURE, ALTERNATE_TEMPERATURE];

/// Wear indicators whose normalized value is the remaining life percentage
pub const REMAINING_LIFE_ATTRIBUTES: [u8; 4] = [0xB1, 0xE9, 0xCA, 0xA9];

/// Drive type as far as SMART interpretation is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriveKind {
    Hdd,
    Ssd,
    Nvme,
    Unknown,
}

/// Static identification of one drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveIdentity {
    /// Stable enumeration key, e.g. the kernel device name
    pub id: String,
    pub model: String,
    pub serial: Option<String>,
    pub firmware: Option<String>,
    pub kind: DriveKind,
}

/// Drive access provided by the platform's SMART driver
pub trait SmartApi: Send {
    /// Keys of all drives currently present
    fn enumerate(&mut self) -> Result<Vec<String>>;

    fn identify(&mut self, drive: &str) -> Result<DriveIdentity>;

    /// Raw 512-byte SMART data page
    fn read_smart_data(&mut self, drive: &str) -> Result<Vec<u8>>;

    /// Temperature from a source other than the attribute table
    fn temperature(&mut self, drive: &str) -> Result<f32> {
        Err(Error::NotSupported(format!("temperature of {}", drive)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartAttribute {
    pub id: u8,
    pub flags: u16,
    /// Normalized current value
    pub current: u8,
    pub worst: u8,
    pub raw: [u8; 6],
}

impl SmartAttribute {
    /// Raw bytes as a little-endian 48-bit integer
    pub fn raw_value(&self) -> u64 {
        self.raw
            .iter()
            .rev()
            .fold(0u64, |acc, b| acc << 8 | u64::from(*b))
    }
}

/// Decode the attribute table of a SMART data page; empty slots are skipped
pub fn parse_attribute_table(data: &[u8]) -> Vec<SmartAttribute> {
    (0..ATTRIBUTE_COUNT)
        .filter_map(|i| {
            let start = ATTRIBUTE_OFFSET + i * ATTRIBUTE_SIZE;
            let e = data.get(start..start + ATTRIBUTE_SIZE)?;
            if e[0] == 0 {
                return None;
            }
            let mut raw = [0u8; 6];
            raw.copy_from_slice(&e[5..11]);
            Some(SmartAttribute {
                id: e[0],
                flags: u16::from_le_bytes([e[1], e[2]]),
                current: e[3],
                worst: e[4],
                raw,
            })
        })
        .collect()
}

pub fn find(attributes: &[SmartAttribute], id: u8) -> Option<&SmartAttribute> {
    attributes.iter().find(|a| a.id == id)
}

/// Drive temperature from the first present temperature attribute
pub fn temperature(attributes: &[SmartAttribute]) -> Option<f32> {
    TEMPERATURE_ATTRIBUTES
        .iter()
        .find_map(|id| find(attributes, *id))
        .map(|a| f32::from(a.raw[0] as i8))
        .filter(|t| *t > 0.0)
}

pub fn remaining_life(attributes: &[SmartAttribute]) -> Option<f32> {
    REMAINING_LIFE_ATTRIBUTES
        .iter()
        .find_map(|id| find(attributes, *id))
        .map(|a| f32::from(a.current.min(100)))
}

/// Sysfs enumeration with temperature from the `drivetemp`/NVMe hwmon
/// drivers; attribute pages need SG_IO passthrough, which this does not do
#[derive(Debug, Clone)]
pub struct LinuxSmartApi {
    sys_block: PathBuf,
}

impl LinuxSmartApi {
    pub fn new() -> Self {
        Self::with_root("/sys/block")
    }

    pub fn with_root(sys_block: impl Into<PathBuf>) -> Self {
        Self {
            sys_block: sys_block.into(),
        }
    }

    fn read_attr(&self, drive: &str, attr: &str) -> Option<String> {
        fs::read_to_string(self.sys_block.join(drive).join(attr))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

impl Default for LinuxSmartApi {
    fn default() -> Self {
        Self::new()
    }
}

fn is_disk(name: &str) -> bool {
    (name.starts_with("sd") || name.starts_with("hd"))
        || (name.starts_with("nvme") && name.contains('n') && !name.contains('p'))
}

fn hwmon_temperature(device: &Path) -> Option<f32> {
    let mut candidates = Vec::new();
    for entry in fs::read_dir(device).ok()?.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == "hwmon" {
            // drivetemp: device/hwmon/hwmonN
            for sub in fs::read_dir(entry.path()).ok()?.flatten() {
                candidates.push(sub.path());
            }
        } else if name.starts_with("hwmon") {
            // nvme: device/hwmonN
            candidates.push(entry.path());
        }
    }
    candidates.sort();
    candidates.iter().find_map(|dir| {
        let millis: i64 = fs::read_to_string(dir.join("temp1_input")).ok()?.trim().parse().ok()?;
        Some(millis as f32 / 1000.0)
    })
}

impl SmartApi for LinuxSmartApi {
    fn enumerate(&mut self) -> Result<Vec<String>> {
        let mut drives: Vec<String> = fs::read_dir(&self.sys_block)?
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| is_disk(name))
            .collect();
        drives.sort();
        Ok(drives)
    }

    fn identify(&mut self, drive: &str) -> Result<DriveIdentity> {
        if !self.sys_block.join(drive).exists() {
            return Err(Error::DeviceNotFound(drive.to_string()));
        }
        let kind = if drive.starts_with("nvme") {
            DriveKind::Nvme
        } else {
            match self.read_attr(drive, "queue/rotational").as_deref() {
                Some("1") => DriveKind::Hdd,
                Some("0") => DriveKind::Ssd,
                _ => DriveKind::Unknown,
            }
        };
        Ok(DriveIdentity {
            id: drive.to_string(),
            model: self
                .read_attr(drive, "device/model")
                .unwrap_or_else(|| drive.to_string()),
            serial: self.read_attr(drive, "device/serial"),
            firmware: self
                .read_attr(drive, "device/rev")
                .or_else(|| self.read_attr(drive, "device/firmware_rev")),
            kind,
        })
    }

    fn read_smart_data(&mut self, drive: &str) -> Result<Vec<u8>> {
        Err(Error::NotSupported(format!("SMART passthrough for {}", drive)))
    }

    fn temperature(&mut self, drive: &str) -> Result<f32> {
        hwmon_temperature(&self.sys_block.join(drive).join("device"))
            .ok_or_else(|| Error::NotSupported(format!("no hwmon temperature for {}", drive)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// SMART page with the given `(id, current, raw)` entries
    pub(crate) fn page(entries: &[(u8, u8, u64)]) -> Vec<u8> {
        let mut data = vec![0u8; 512];
        data[0] = 0x10;
        for (i, (id, current, raw)) in entries.iter().enumerate() {
            let start = ATTRIBUTE_OFFSET + i * ATTRIBUTE_SIZE;
            data[start] = *id;
            data[start + 1] = 0x32;
            data[start + 3] = *current;
            data[start + 4] = *current;
            data[start + 5..start + 11].copy_from_slice(&raw.to_le_bytes()[..6]);
        }
        data
    }

    #[test]
    fn test_parse_attribute_table() {
        let data = page(&[(POWER_ON_HOURS, 99, 12345), (TEMPERATURE, 64, 0x0014_0028_0021)]);
        let attributes = parse_attribute_table(&data);
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes[0].raw_value(), 12345);
        assert_eq!(attributes[0].flags, 0x32);
        // min/max packed in the upper raw bytes are ignored
        assert_eq!(temperature(&attributes), Some(33.0));
        assert!(parse_attribute_table(&data[..20]).len() == 1);
    }

    #[test]
    fn test_temperature_fallback_order() {
        let attributes = parse_attribute_table(&page(&[(ALTERNATE_TEMPERATURE, 100, 40), (AIRFLOW_TEMPERATURE, 100, 35)]));
        assert_eq!(temperature(&attributes), Some(35.0));
        assert_eq!(temperature(&[]), None);
    }

    #[test]
    fn test_remaining_life() {
        let attributes = parse_attribute_table(&page(&[(0xB1, 97, 42)]));
        assert_eq!(remaining_life(&attributes), Some(97.0));
    }

    #[test]
    fn test_linux_enumeration() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for name in ["sda", "nvme0n1", "loop0", "nvme0n1p1"] {
            fs::create_dir_all(root.join(name).join("device")).unwrap();
        }
        fs::create_dir_all(root.join("sda/queue")).unwrap();
        fs::write(root.join("sda/queue/rotational"), "1\n").unwrap();
        fs::write(root.join("sda/device/model"), "WDC WD40EFRX\n").unwrap();
        fs::create_dir_all(root.join("sda/device/hwmon/hwmon4")).unwrap();
        fs::write(root.join("sda/device/hwmon/hwmon4/temp1_input"), "36000\n").unwrap();
        fs::create_dir_all(root.join("nvme0n1/device/hwmon2")).unwrap();
        fs::write(root.join("nvme0n1/device/hwmon2/temp1_input"), "41850\n").unwrap();

        let mut api = LinuxSmartApi::with_root(root);
        assert_eq!(api.enumerate().unwrap(), vec!["nvme0n1", "sda"]);

        let sda = api.identify("sda").unwrap();
        assert_eq!(sda.model, "WDC WD40EFRX");
        assert_eq!(sda.kind, DriveKind::Hdd);
        assert_eq!(api.identify("nvme0n1").unwrap().kind, DriveKind::Nvme);
        assert!(api.identify("sdz").is_err());

        assert_eq!(api.temperature("sda").unwrap(), 36.0);
        assert!((api.temperature("nvme0n1").unwrap() - 41.85).abs() < 1e-4);
        assert!(api.read_smart_data("sda").is_err());
    }
}
