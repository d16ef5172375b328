// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2024 NervoSys

//! DRM sysfs GPU API (amdgpu, i915, xe)
//!
//! Reads `/sys/class/drm/cardN/device` and its hwmon directory. Handles are
//! the card numbers.

use super::{AdapterInfo, ApiResult, ApiStatus, GpuApi, GpuVendor};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

fn status(e: io::Error) -> ApiStatus {
    match e.kind() {
        io::ErrorKind::NotFound => ApiStatus::NotAvailable,
        _ => ApiStatus::Failed(e.to_string()),
    }
}

fn read_string(path: &Path) -> ApiResult<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(status)
}

fn read_number(path: &Path) -> ApiResult<f64> {
    let text = read_string(path)?;
    text.parse()
        .map_err(|_| ApiStatus::Failed(format!("{}: '{}' is not a number", path.display(), text)))
}

/// `0000:03:00.0` to bus and device numbers
fn parse_slot(slot: &str) -> Option<(u8, u8)> {
    let mut parts = slot.rsplit(':');
    let device_function = parts.next()?;
    let bus = parts.next()?;
    let device = device_function.split('.').next()?;
    Some((
        u8::from_str_radix(bus, 16).ok()?,
        u8::from_str_radix(device, 16).ok()?,
    ))
}

pub struct DrmApi {
    root: PathBuf,
    /// `pwm1_enable` before the first manual write, per card
    saved_mode: HashMap<u32, String>,
}

impl DrmApi {
    pub fn new() -> Self {
        Self::with_root("/sys/class/drm")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            saved_mode: HashMap::new(),
        }
    }

    fn device(&self, handle: u32) -> PathBuf {
        self.root.join(format!("card{}", handle)).join("device")
    }

    fn hwmon(&self, handle: u32) -> ApiResult<PathBuf> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(self.device(handle).join("hwmon"))
            .map_err(status)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        dirs.into_iter().next().ok_or(ApiStatus::NotAvailable)
    }

    fn hwmon_number(&self, handle: u32, file: &str) -> ApiResult<f64> {
        read_number(&self.hwmon(handle)?.join(file))
    }

    fn identify(&self, handle: u32) -> Option<AdapterInfo> {
        let device = self.device(handle);
        let uevent = fs::read_to_string(device.join("uevent")).ok()?;
        let field = |key: &str| {
            uevent
                .lines()
                .find_map(|l| l.strip_prefix(key))
                .map(str::to_string)
        };
        let (bus, dev) = parse_slot(&field("PCI_SLOT_NAME=")?)?;
        let pci_id = field("PCI_ID=")?;
        let vendor_id = u16::from_str_radix(pci_id.split(':').next()?, 16).ok()?;
        let vendor = GpuVendor::from_pci_vendor(vendor_id)?;
        let name = read_string(&device.join("product_name"))
            .ok()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("{:?} GPU [{}]", vendor, pci_id));
        Some(AdapterInfo {
            handle,
            name,
            vendor,
            bus,
            device: dev,
        })
    }
}

impl Default for DrmApi {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuApi for DrmApi {
    fn name(&self) -> &str {
        "DRM"
    }

    fn adapters(&mut self) -> ApiResult<Vec<AdapterInfo>> {
        let mut cards: Vec<u32> = fs::read_dir(&self.root)
            .map_err(status)?
            .flatten()
            .filter_map(|e| {
                e.file_name()
                    .to_string_lossy()
                    .strip_prefix("card")
                    .and_then(|n| n.parse().ok())
            })
            .collect();
        cards.sort_unstable();
        Ok(cards.into_iter().filter_map(|c| self.identify(c)).collect())
    }

    fn temperature(&mut self, handle: u32) -> ApiResult<f32> {
        Ok((self.hwmon_number(handle, "temp1_input")? / 1000.0) as f32)
    }

    fn hotspot_temperature(&mut self, handle: u32) -> ApiResult<f32> {
        let hwmon = self.hwmon(handle)?;
        for i in 1..=3 {
            if read_string(&hwmon.join(format!("temp{}_label", i))).ok().as_deref() == Some("junction") {
                return Ok((read_number(&hwmon.join(format!("temp{}_input", i)))? / 1000.0) as f32);
            }
        }
        Err(ApiStatus::NotAvailable)
    }

    fn core_clock(&mut self, handle: u32) -> ApiResult<f32> {
        Ok((self.hwmon_number(handle, "freq1_input")? / 1e6) as f32)
    }

    fn memory_clock(&mut self, handle: u32) -> ApiResult<f32> {
        Ok((self.hwmon_number(handle, "freq2_input")? / 1e6) as f32)
    }

    fn core_load(&mut self, handle: u32) -> ApiResult<f32> {
        Ok(read_number(&self.device(handle).join("gpu_busy_percent"))? as f32)
    }

    fn memory_controller_load(&mut self, handle: u32) -> ApiResult<f32> {
        Ok(read_number(&self.device(handle).join("mem_busy_percent"))? as f32)
    }

    fn power(&mut self, handle: u32) -> ApiResult<f32> {
        let microwatts = self
            .hwmon_number(handle, "power1_average")
            .or_else(|_| self.hwmon_number(handle, "power1_input"))?;
        Ok((microwatts / 1e6) as f32)
    }

    fn fan_rpm(&mut self, handle: u32) -> ApiResult<f32> {
        Ok(self.hwmon_number(handle, "fan1_input")? as f32)
    }

    fn fan_duty(&mut self, handle: u32) -> ApiResult<f32> {
        Ok((self.hwmon_number(handle, "pwm1")? * 100.0 / 255.0) as f32)
    }

    fn set_fan_duty(&mut self, handle: u32, duty: Option<f32>) -> ApiResult<()> {
        let hwmon = self.hwmon(handle)?;
        let enable = hwmon.join("pwm1_enable");
        match duty {
            Some(percent) => {
                if !self.saved_mode.contains_key(&handle) {
                    self.saved_mode.insert(handle, read_string(&enable)?);
                }
                let raw = (percent * 2.55).round().clamp(0.0, 255.0) as u8;
                fs::write(&enable, "1").map_err(status)?;
                fs::write(hwmon.join("pwm1"), raw.to_string()).map_err(status)
            }
            None => {
                // 2 is automatic fan control in the hwmon ABI
                let mode = self.saved_mode.get(&handle).map_or("2", String::as_str);
                fs::write(&enable, mode).map_err(status)?;
                self.saved_mode.remove(&handle);
                Ok(())
            }
        }
    }

    fn memory_used(&mut self, handle: u32) -> ApiResult<f32> {
        Ok((read_number(&self.device(handle).join("mem_info_vram_used"))? / BYTES_PER_MIB) as f32)
    }

    fn memory_total(&mut self, handle: u32) -> ApiResult<f32> {
        Ok((read_number(&self.device(handle).join("mem_info_vram_total"))? / BYTES_PER_MIB) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(root: &Path, n: u32, uevent: &str) -> PathBuf {
        let device = root.join(format!("card{}", n)).join("device");
        let hwmon = device.join("hwmon").join("hwmon3");
        fs::create_dir_all(&hwmon).unwrap();
        fs::write(device.join("uevent"), uevent).unwrap();
        hwmon
    }

    #[test]
    fn test_parse_slot() {
        assert_eq!(parse_slot("0000:03:00.0"), Some((3, 0)));
        assert_eq!(parse_slot("0000:0a:1f.1"), Some((10, 31)));
        assert_eq!(parse_slot("garbage"), None);
    }

    #[test]
    fn test_enumeration_and_readings() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let hwmon = card(root, 0, "DRIVER=amdgpu\nPCI_ID=1002:73BF\nPCI_SLOT_NAME=0000:03:00.0\n");
        fs::create_dir_all(root.join("card0-DP-1")).unwrap();
        fs::write(hwmon.join("temp1_input"), "45000\n").unwrap();
        fs::write(hwmon.join("temp2_label"), "junction\n").unwrap();
        fs::write(hwmon.join("temp2_input"), "52000\n").unwrap();
        fs::write(hwmon.join("freq1_input"), "2100000000\n").unwrap();
        fs::write(hwmon.join("power1_average"), "35000000\n").unwrap();
        fs::write(root.join("card0/device/gpu_busy_percent"), "12\n").unwrap();
        fs::write(root.join("card0/device/mem_info_vram_total"), "17163091968\n").unwrap();

        let mut api = DrmApi::with_root(root);
        let adapters = api.adapters().unwrap();
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].vendor, GpuVendor::Amd);
        assert_eq!((adapters[0].bus, adapters[0].device), (3, 0));
        assert_eq!(adapters[0].name, "Amd GPU [1002:73BF]");

        assert_eq!(api.temperature(0), Ok(45.0));
        assert_eq!(api.hotspot_temperature(0), Ok(52.0));
        assert_eq!(api.core_clock(0), Ok(2100.0));
        assert_eq!(api.power(0), Ok(35.0));
        assert_eq!(api.core_load(0), Ok(12.0));
        assert_eq!(api.memory_total(0), Ok(16368.0));
        assert_eq!(api.memory_clock(0), Err(ApiStatus::NotAvailable));
    }

    #[test]
    fn test_fan_duty_restores_mode() {
        let dir = tempfile::tempdir().unwrap();
        let hwmon = card(dir.path(), 1, "PCI_ID=1002:744C\nPCI_SLOT_NAME=0000:0b:00.0\n");
        fs::write(hwmon.join("pwm1_enable"), "2\n").unwrap();
        fs::write(hwmon.join("pwm1"), "51\n").unwrap();

        let mut api = DrmApi::with_root(dir.path());
        assert_eq!(api.fan_duty(1), Ok(20.0));
        api.set_fan_duty(1, Some(100.0)).unwrap();
        assert_eq!(fs::read_to_string(hwmon.join("pwm1_enable")).unwrap(), "1");
        assert_eq!(fs::read_to_string(hwmon.join("pwm1")).unwrap(), "255");
        api.set_fan_duty(1, Some(50.0)).unwrap();
        api.set_fan_duty(1, None).unwrap();
        assert_eq!(fs::read_to_string(hwmon.join("pwm1_enable")).unwrap(), "2");
    }

    #[test]
    fn test_failed_mode_restore_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let hwmon = card(dir.path(), 0, "PCI_ID=1002:744C\nPCI_SLOT_NAME=0000:0b:00.0\n");
        let enable = hwmon.join("pwm1_enable");
        fs::write(&enable, "0\n").unwrap();

        let mut api = DrmApi::with_root(dir.path());
        api.set_fan_duty(0, Some(40.0)).unwrap();

        // a directory in its place makes the write fail
        fs::remove_file(&enable).unwrap();
        fs::create_dir(&enable).unwrap();
        assert!(matches!(api.set_fan_duty(0, None), Err(ApiStatus::Failed(_))));

        fs::remove_dir(&enable).unwrap();
        fs::write(&enable, "1").unwrap();
        api.set_fan_duty(0, None).unwrap();
        assert_eq!(fs::read_to_string(&enable).unwrap(), "0");
    }
}
