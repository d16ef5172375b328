// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2024 NervoSys

//! NVIDIA GPU API via NVML

use super::{AdapterInfo, ApiResult, ApiStatus, GpuApi, GpuVendor};
use crate::error::{Error, Result};
use nvml_wrapper::enum_wrappers::device::{Clock, TemperatureSensor};
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::{Device, Nvml};

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

fn status(e: NvmlError) -> ApiStatus {
    match e {
        NvmlError::NotSupported | NvmlError::FailedToLoadSymbol(_) => ApiStatus::NotAvailable,
        e => ApiStatus::Failed(e.to_string()),
    }
}

/// Handles are NVML device indices
pub struct NvmlApi {
    nvml: Nvml,
}

impl NvmlApi {
    pub fn init() -> Result<Self> {
        let nvml = Nvml::init().map_err(|e| Error::Api(format!("Failed to initialize NVML: {}", e)))?;
        Ok(Self { nvml })
    }

    fn device(&self, handle: u32) -> ApiResult<Device<'_>> {
        self.nvml.device_by_index(handle).map_err(status)
    }
}

impl GpuApi for NvmlApi {
    fn name(&self) -> &str {
        "NVML"
    }

    fn adapters(&mut self) -> ApiResult<Vec<AdapterInfo>> {
        let count = self.nvml.device_count().map_err(status)?;
        let mut adapters = Vec::with_capacity(count as usize);
        for handle in 0..count {
            let device = self.device(handle)?;
            let pci = device.pci_info().map_err(status)?;
            adapters.push(AdapterInfo {
                handle,
                name: device.name().unwrap_or_else(|_| format!("NVIDIA GPU {}", handle)),
                vendor: GpuVendor::Nvidia,
                bus: pci.bus as u8,
                device: pci.device as u8,
            });
        }
        Ok(adapters)
    }

    fn temperature(&mut self, handle: u32) -> ApiResult<f32> {
        let t = self
            .device(handle)?
            .temperature(TemperatureSensor::Gpu)
            .map_err(status)?;
        Ok(t as f32)
    }

    fn core_clock(&mut self, handle: u32) -> ApiResult<f32> {
        let mhz = self.device(handle)?.clock_info(Clock::Graphics).map_err(status)?;
        Ok(mhz as f32)
    }

    fn memory_clock(&mut self, handle: u32) -> ApiResult<f32> {
        let mhz = self.device(handle)?.clock_info(Clock::Memory).map_err(status)?;
        Ok(mhz as f32)
    }

    fn core_load(&mut self, handle: u32) -> ApiResult<f32> {
        let rates = self.device(handle)?.utilization_rates().map_err(status)?;
        Ok(rates.gpu as f32)
    }

    fn memory_controller_load(&mut self, handle: u32) -> ApiResult<f32> {
        let rates = self.device(handle)?.utilization_rates().map_err(status)?;
        Ok(rates.memory as f32)
    }

    fn power(&mut self, handle: u32) -> ApiResult<f32> {
        let milliwatts = self.device(handle)?.power_usage().map_err(status)?;
        Ok(milliwatts as f32 / 1000.0)
    }

    fn fan_duty(&mut self, handle: u32) -> ApiResult<f32> {
        let percent = self.device(handle)?.fan_speed(0).map_err(status)?;
        Ok(percent as f32)
    }

    fn set_fan_duty(&mut self, handle: u32, duty: Option<f32>) -> ApiResult<()> {
        let mut device = self.device(handle)?;
        match duty {
            Some(percent) => device
                .set_fan_speed(0, percent.round().clamp(0.0, 100.0) as u32)
                .map_err(status),
            None => device.set_default_fan_speed(0).map_err(status),
        }
    }

    fn memory_used(&mut self, handle: u32) -> ApiResult<f32> {
        let info = self.device(handle)?.memory_info().map_err(status)?;
        Ok((info.used as f64 / BYTES_PER_MIB) as f32)
    }

    fn memory_total(&mut self, handle: u32) -> ApiResult<f32> {
        let info = self.device(handle)?.memory_info().map_err(status)?;
        Ok((info.total as f64 / BYTES_PER_MIB) as f32)
    }
}
