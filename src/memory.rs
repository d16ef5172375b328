//! System memory load from `/proc/meminfo`

use crate::computer::Group;
use crate::error::{Error, Result};
use crate::hardware::{Hardware, HardwareBase, HardwareType};
use crate::identifier::Identifier;
use crate::sensor::SensorType;
use log::{debug, trace};
use std::fs;
use std::path::{Path, PathBuf};

/// Totals in KiB as reported by the kernel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total: u64,
    pub available: u64,
    pub swap_total: u64,
    pub swap_free: u64,
}

impl MemoryInfo {
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.available)
    }

    pub fn swap_used(&self) -> u64 {
        self.swap_total.saturating_sub(self.swap_free)
    }
}

pub fn parse_meminfo(meminfo: &str) -> Result<MemoryInfo> {
    let mut info = MemoryInfo::default();
    let mut free = None;
    let mut available = None;
    let mut reclaimable = 0u64;

    for line in meminfo.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }

        let key = parts[0].trim_end_matches(':');
        let value: u64 = parts[1].parse().unwrap_or(0);

        match key {
            "MemTotal" => info.total = value,
            "MemFree" => free = Some(value),
            "MemAvailable" => available = Some(value),
            "Buffers" | "Cached" | "SReclaimable" => reclaimable += value,
            "SwapTotal" => info.swap_total = value,
            "SwapFree" => info.swap_free = value,
            _ => {}
        }
    }

    if info.total == 0 {
        return Err(Error::Parse("meminfo has no MemTotal".into()));
    }
    // kernels before 3.14 lack MemAvailable
    info.available = available.unwrap_or_else(|| free.unwrap_or(0) + reclaimable);
    Ok(info)
}

const KIB_PER_GIB: f32 = 1024.0 * 1024.0;

pub struct GenericMemory {
    base: HardwareBase,
    meminfo: PathBuf,
    load: usize,
    used: usize,
    available: usize,
    virtual_load: usize,
    virtual_used: usize,
    virtual_available: usize,
}

impl GenericMemory {
    pub fn new(proc_root: &Path, window: chrono::Duration) -> Self {
        let mut base = HardwareBase::new("Generic Memory", Identifier::new(["ram"]), HardwareType::Memory)
            .with_window(window);
        let load = base.add_sensor("Memory", 0, SensorType::Load);
        let virtual_load = base.add_sensor("Virtual Memory", 1, SensorType::Load);
        let used = base.add_sensor("Memory Used", 0, SensorType::Data);
        let available = base.add_sensor("Memory Available", 1, SensorType::Data);
        let virtual_used = base.add_sensor("Virtual Memory Used", 2, SensorType::Data);
        let virtual_available = base.add_sensor("Virtual Memory Available", 3, SensorType::Data);
        Self {
            base,
            meminfo: proc_root.join("meminfo"),
            load,
            used,
            available,
            virtual_load,
            virtual_used,
            virtual_available,
        }
    }

    fn read(&self) -> Result<MemoryInfo> {
        parse_meminfo(&fs::read_to_string(&self.meminfo)?)
    }
}

impl Hardware for GenericMemory {
    fn base(&self) -> &HardwareBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HardwareBase {
        &mut self.base
    }

    fn update(&mut self) {
        let info = match self.read() {
            Ok(info) => info,
            Err(e) => {
                trace!("{}: {}", self.meminfo.display(), e);
                self.base.invalidate_all();
                return;
            }
        };

        let total = info.total as f32;
        let commit_total = (info.total + info.swap_total) as f32;
        let commit_used = (info.used() + info.swap_used()) as f32;

        self.base.publish(self.load, Some(100.0 * info.used() as f32 / total));
        self.base.publish(self.used, Some(info.used() as f32 / KIB_PER_GIB));
        self.base.publish(self.available, Some(info.available as f32 / KIB_PER_GIB));
        self.base.publish(self.virtual_load, Some(100.0 * commit_used / commit_total));
        self.base.publish(self.virtual_used, Some(commit_used / KIB_PER_GIB));
        self.base
            .publish(self.virtual_available, Some((commit_total - commit_used) / KIB_PER_GIB));
    }
}

pub struct MemoryGroup {
    memory: Vec<GenericMemory>,
}

impl MemoryGroup {
    /// Empty when `meminfo` is not readable
    pub fn open(proc_root: &Path, window: chrono::Duration) -> Self {
        let memory = GenericMemory::new(proc_root, window);
        match memory.read() {
            Ok(_) => Self { memory: vec![memory] },
            Err(e) => {
                debug!("No memory statistics: {}", e);
                Self { memory: Vec::new() }
            }
        }
    }
}

impl Group for MemoryGroup {
    fn hardware(&self) -> Vec<&dyn Hardware> {
        self.memory.iter().map(|m| m as &dyn Hardware).collect()
    }

    fn hardware_mut(&mut self) -> Vec<&mut dyn Hardware> {
        self.memory.iter_mut().map(|m| m as &mut dyn Hardware).collect()
    }
}
