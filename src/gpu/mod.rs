// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2024 NervoSys

//! GPU monitoring
//!
//! Vendor driver APIs are reached through the [`GpuApi`] contract. Every call
//! may be missing or fail, so each sensor degrades on its own. When several
//! APIs see the same board (e.g. NVML and the DRM sysfs interface), the
//! adapters are correlated by PCI bus/device into a single hardware node that
//! reads from the first API and falls back to the others.

pub mod drm;
#[cfg(feature = "nvidia")]
pub mod nvml;

pub use drm::DrmApi;

use crate::computer::Group;
use crate::control::{Control, ControlActuator, ControlRequest};
use crate::error::{Error, Result};
use crate::hardware::{Hardware, HardwareBase, HardwareEvent, HardwareType};
use crate::identifier::Identifier;
use crate::sensor::SensorType;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;

/// Failure status of a vendor API call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiStatus {
    /// The entry point is missing in the loaded driver
    #[error("not available")]
    NotAvailable,
    #[error("{0}")]
    Failed(String),
}

impl From<ApiStatus> for Error {
    fn from(status: ApiStatus) -> Self {
        Error::Api(status.to_string())
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiStatus>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
}

impl GpuVendor {
    pub fn from_pci_vendor(id: u16) -> Option<Self> {
        match id {
            0x10DE => Some(GpuVendor::Nvidia),
            0x1002 => Some(GpuVendor::Amd),
            0x8086 => Some(GpuVendor::Intel),
            _ => None,
        }
    }

    pub fn hardware_type(&self) -> HardwareType {
        match self {
            GpuVendor::Nvidia => HardwareType::GpuNvidia,
            GpuVendor::Amd => HardwareType::GpuAmd,
            GpuVendor::Intel => HardwareType::GpuIntel,
        }
    }

    fn identifier_prefix(&self) -> &'static str {
        match self {
            GpuVendor::Nvidia => "nvidiagpu",
            GpuVendor::Amd => "amdgpu",
            GpuVendor::Intel => "intelgpu",
        }
    }
}

/// One adapter as enumerated by a single API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    /// API-local handle passed back into every call
    pub handle: u32,
    pub name: String,
    pub vendor: GpuVendor,
    pub bus: u8,
    pub device: u8,
}

impl AdapterInfo {
    fn key(&self) -> (u8, u8) {
        (self.bus, self.device)
    }
}

/// Vendor driver API; every reading defaults to [`ApiStatus::NotAvailable`]
pub trait GpuApi: Send {
    fn name(&self) -> &str;

    fn adapters(&mut self) -> ApiResult<Vec<AdapterInfo>>;

    /// Core temperature in °C
    fn temperature(&mut self, _handle: u32) -> ApiResult<f32> {
        Err(ApiStatus::NotAvailable)
    }

    fn hotspot_temperature(&mut self, _handle: u32) -> ApiResult<f32> {
        Err(ApiStatus::NotAvailable)
    }

    /// Clocks in MHz
    fn core_clock(&mut self, _handle: u32) -> ApiResult<f32> {
        Err(ApiStatus::NotAvailable)
    }

    fn memory_clock(&mut self, _handle: u32) -> ApiResult<f32> {
        Err(ApiStatus::NotAvailable)
    }

    /// Loads in percent
    fn core_load(&mut self, _handle: u32) -> ApiResult<f32> {
        Err(ApiStatus::NotAvailable)
    }

    fn memory_controller_load(&mut self, _handle: u32) -> ApiResult<f32> {
        Err(ApiStatus::NotAvailable)
    }

    /// Board power in W
    fn power(&mut self, _handle: u32) -> ApiResult<f32> {
        Err(ApiStatus::NotAvailable)
    }

    fn fan_rpm(&mut self, _handle: u32) -> ApiResult<f32> {
        Err(ApiStatus::NotAvailable)
    }

    /// Fan duty in percent
    fn fan_duty(&mut self, _handle: u32) -> ApiResult<f32> {
        Err(ApiStatus::NotAvailable)
    }

    /// `Some(percent)` for a manual duty, `None` to restore the driver default
    fn set_fan_duty(&mut self, _handle: u32, _duty: Option<f32>) -> ApiResult<()> {
        Err(ApiStatus::NotAvailable)
    }

    /// Memory figures in MiB
    fn memory_used(&mut self, _handle: u32) -> ApiResult<f32> {
        Err(ApiStatus::NotAvailable)
    }

    fn memory_total(&mut self, _handle: u32) -> ApiResult<f32> {
        Err(ApiStatus::NotAvailable)
    }
}

pub type SharedGpuApi = Arc<Mutex<Box<dyn GpuApi>>>;

/// APIs available on this platform, most capable first
pub fn native_apis() -> Vec<Box<dyn GpuApi>> {
    let mut apis: Vec<Box<dyn GpuApi>> = Vec::new();
    #[cfg(feature = "nvidia")]
    match nvml::NvmlApi::init() {
        Ok(api) => apis.push(Box::new(api)),
        Err(e) => debug!("NVML unavailable: {}", e),
    }
    if cfg!(target_os = "linux") {
        apis.push(Box::new(DrmApi::new()));
    }
    apis
}

/// A physical adapter and the `(api, handle)` pairs that see it, in API order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlated {
    pub info: AdapterInfo,
    pub sources: Vec<(usize, u32)>,
}

/// Merge per-API enumerations by PCI bus/device; the first API to list a
/// board names it
pub fn correlate(lists: &[Vec<AdapterInfo>]) -> Vec<Correlated> {
    let mut merged: Vec<Correlated> = Vec::new();
    for (api, list) in lists.iter().enumerate() {
        for adapter in list {
            match merged.iter_mut().find(|c| c.info.key() == adapter.key()) {
                // an API may list one board more than once
                Some(c) if c.sources.iter().any(|(a, _)| *a == api) => {}
                Some(c) => c.sources.push((api, adapter.handle)),
                None => merged.push(Correlated {
                    info: adapter.clone(),
                    sources: vec![(api, adapter.handle)],
                }),
            }
        }
    }
    merged
}

struct Source {
    api: SharedGpuApi,
    handle: u32,
}

#[derive(Debug, Clone, Copy)]
enum Reading {
    Temperature,
    HotSpot,
    CoreClock,
    MemoryClock,
    CoreLoad,
    MemoryControllerLoad,
    Power,
    FanRpm,
    FanDuty,
    MemoryUsed,
    MemoryTotal,
}

impl Reading {
    fn read(self, api: &mut dyn GpuApi, handle: u32) -> ApiResult<f32> {
        match self {
            Reading::Temperature => api.temperature(handle),
            Reading::HotSpot => api.hotspot_temperature(handle),
            Reading::CoreClock => api.core_clock(handle),
            Reading::MemoryClock => api.memory_clock(handle),
            Reading::CoreLoad => api.core_load(handle),
            Reading::MemoryControllerLoad => api.memory_controller_load(handle),
            Reading::Power => api.power(handle),
            Reading::FanRpm => api.fan_rpm(handle),
            Reading::FanDuty => api.fan_duty(handle),
            Reading::MemoryUsed => api.memory_used(handle),
            Reading::MemoryTotal => api.memory_total(handle),
        }
    }
}

const SENSORS: [(Reading, &str, usize, SensorType); 11] = [
    (Reading::Temperature, "GPU Core", 0, SensorType::Temperature),
    (Reading::HotSpot, "GPU Hot Spot", 1, SensorType::Temperature),
    (Reading::CoreClock, "GPU Core", 0, SensorType::Clock),
    (Reading::MemoryClock, "GPU Memory", 1, SensorType::Clock),
    (Reading::CoreLoad, "GPU Core", 0, SensorType::Load),
    (Reading::MemoryControllerLoad, "GPU Memory Controller", 1, SensorType::Load),
    (Reading::Power, "GPU Package", 0, SensorType::Power),
    (Reading::FanRpm, "GPU Fan", 0, SensorType::Fan),
    (Reading::FanDuty, "GPU Fan", 0, SensorType::Control),
    (Reading::MemoryUsed, "GPU Memory Used", 0, SensorType::SmallData),
    (Reading::MemoryTotal, "GPU Memory Total", 1, SensorType::SmallData),
];

fn read_first(sources: &[Source], reading: Reading) -> Option<f32> {
    sources.iter().find_map(|s| {
        let mut api = s.api.lock();
        reading.read(api.as_mut(), s.handle).ok()
    })
}

struct FanActuator<'a> {
    sources: &'a [Source],
}

impl ControlActuator for FanActuator<'_> {
    fn apply(&mut self, _index: usize, value: Option<f32>) -> Result<()> {
        let mut last = ApiStatus::NotAvailable;
        for s in self.sources {
            match s.api.lock().set_fan_duty(s.handle, value) {
                Ok(()) => return Ok(()),
                Err(e) => last = e,
            }
        }
        Err(last.into())
    }
}

pub struct GpuAdapter {
    base: HardwareBase,
    info: AdapterInfo,
    index: usize,
    sources: Vec<Source>,
    source_names: Vec<String>,
    slots: Vec<usize>,
    controls: Vec<Control>,
}

impl GpuAdapter {
    fn new(info: AdapterInfo, sources: Vec<Source>, index: usize, window: chrono::Duration) -> Self {
        let mut base = HardwareBase::new(
            info.name.clone(),
            Identifier::new([info.vendor.identifier_prefix().to_string(), index.to_string()]),
            info.vendor.hardware_type(),
        )
        .with_window(window);
        let slots: Vec<usize> = SENSORS
            .iter()
            .map(|(_, name, i, t)| base.add_sensor(*name, *i, *t))
            .collect();

        let mut controls = Vec::new();
        let duty_slot = SENSORS.iter().position(|(r, ..)| matches!(r, Reading::FanDuty));
        if let Some(sensor) = duty_slot.and_then(|p| base.get(slots[p])) {
            if read_first(&sources, Reading::FanDuty).is_some() {
                controls.push(Control::new(sensor.identifier(), 0, 0.0, 100.0));
            }
        }

        let source_names = sources.iter().map(|s| s.api.lock().name().to_string()).collect();
        Self {
            base,
            info,
            index,
            sources,
            source_names,
            slots,
            controls,
        }
    }

    pub fn info(&self) -> &AdapterInfo {
        &self.info
    }
}

impl Hardware for GpuAdapter {
    fn base(&self) -> &HardwareBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HardwareBase {
        &mut self.base
    }

    fn update(&mut self) {
        for (i, (reading, ..)) in SENSORS.iter().enumerate() {
            let value = read_first(&self.sources, *reading);
            self.base.publish(self.slots[i], value);
        }
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }

    fn set_control(&mut self, identifier: &Identifier, request: ControlRequest) -> Result<()> {
        let control = self
            .controls
            .iter_mut()
            .find(|c| c.identifier() == identifier)
            .ok_or_else(|| Error::NotSupported(format!("no control {}", identifier)))?;
        control.request(request, &mut FanActuator { sources: &self.sources })
    }

    fn close(&mut self) -> Result<()> {
        let mut first = None;
        let mut actuator = FanActuator { sources: &self.sources };
        for control in &mut self.controls {
            if let Err(e) = control.revert(&mut actuator) {
                warn!("failed to restore {}: {}", control.identifier(), e);
                first.get_or_insert(e);
            }
        }
        self.base.teardown();
        first.map_or(Ok(()), Err)
    }

    fn report(&self) -> String {
        let mut r = self.base.report();
        let _ = writeln!(
            r,
            "Adapter: {} PCI {:02x}:{:02x} via {}",
            self.info.name,
            self.info.bus,
            self.info.device,
            self.source_names.join(", ")
        );
        r
    }
}

/// All GPUs seen by any of the configured APIs
pub struct GpuGroup {
    apis: Vec<SharedGpuApi>,
    window: chrono::Duration,
    adapters: Vec<GpuAdapter>,
}

impl GpuGroup {
    pub fn open(apis: Vec<Box<dyn GpuApi>>, window: chrono::Duration) -> Self {
        let mut group = Self {
            apis: apis.into_iter().map(|a| Arc::new(Mutex::new(a))).collect(),
            window,
            adapters: Vec::new(),
        };
        group.sync();
        for adapter in &group.adapters {
            info!("Found GPU {} ({})", adapter.name(), adapter.identifier());
        }
        group
    }

    fn enumerate(&self) -> Vec<Correlated> {
        let lists: Vec<Vec<AdapterInfo>> = self
            .apis
            .iter()
            .map(|api| {
                let mut api = api.lock();
                api.adapters().unwrap_or_else(|e| {
                    debug!("{} enumeration failed: {}", api.name(), e);
                    Vec::new()
                })
            })
            .collect();
        correlate(&lists)
    }

    fn free_index(&self, vendor: GpuVendor) -> usize {
        (0..)
            .find(|i| {
                !self
                    .adapters
                    .iter()
                    .any(|a| a.info.vendor == vendor && a.index == *i)
            })
            .unwrap_or(self.adapters.len())
    }

    fn sync(&mut self) -> Vec<HardwareEvent> {
        let present = self.enumerate();
        let mut events = Vec::new();

        let mut kept = Vec::with_capacity(self.adapters.len());
        for mut adapter in self.adapters.drain(..) {
            match present.iter().find(|c| c.info.key() == adapter.info.key()) {
                Some(c) => {
                    // handles may be renumbered by the driver
                    adapter.sources = resolve_sources(&self.apis, c);
                    kept.push(adapter);
                }
                None => {
                    info!("GPU {} removed", adapter.identifier());
                    if let Err(e) = adapter.close() {
                        warn!("closing {} failed: {}", adapter.identifier(), e);
                    }
                    events.extend(adapter.take_events());
                    events.push(HardwareEvent::HardwareRemoved(adapter.identifier().clone()));
                }
            }
        }
        self.adapters = kept;

        for c in &present {
            if self.adapters.iter().any(|a| a.info.key() == c.info.key()) {
                continue;
            }
            let index = self.free_index(c.info.vendor);
            let adapter = GpuAdapter::new(c.info.clone(), resolve_sources(&self.apis, c), index, self.window);
            events.push(HardwareEvent::HardwareAdded(adapter.identifier().clone()));
            self.adapters.push(adapter);
        }
        events
    }
}

fn resolve_sources(apis: &[SharedGpuApi], correlated: &Correlated) -> Vec<Source> {
    correlated
        .sources
        .iter()
        .filter_map(|(api, handle)| {
            apis.get(*api).map(|api| Source {
                api: api.clone(),
                handle: *handle,
            })
        })
        .collect()
}

impl Group for GpuGroup {
    fn hardware(&self) -> Vec<&dyn Hardware> {
        self.adapters.iter().map(|a| a as &dyn Hardware).collect()
    }

    fn hardware_mut(&mut self) -> Vec<&mut dyn Hardware> {
        self.adapters
            .iter_mut()
            .map(|a| a as &mut dyn Hardware)
            .collect()
    }

    fn reconcile(&mut self) -> Vec<HardwareEvent> {
        self.sync()
    }
}
