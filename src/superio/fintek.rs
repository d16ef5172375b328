//! Fintek F718xx hardware monitors

use super::{dump_registers, plausible_temperature, Chip, RegisterPorts, SuperIoChip};
use crate::bus::{Bus, IsaBus};
use crate::error::{Error, Result};
use log::trace;
use std::fmt::Write as _;

const VOLTAGE_BASE_REG: u8 = 0x20;
const TEMPERATURE_CONFIG_REG: u8 = 0x69;
const TEMPERATURE_BASE_REG: u8 = 0x70;
const FAN_TACHOMETER_REG: [u8; 4] = [0xA0, 0xB0, 0xC0, 0xD0];
const FAN_PWM_REG: [u8; 4] = [0xA3, 0xB3, 0xC3, 0xD3];

/// F71858 temperature word to °C; `None` for the open-diode patterns
fn f71858_temperature(mode: u8, high: u8, low: u8) -> Option<f32> {
    if high == 0xBB || high == 0xCC {
        return None;
    }
    let mut bits: u16 = 0;
    match mode {
        2 => bits |= u16::from(high & 0x80) << 8,
        3 => bits |= u16::from(low & 0x01) << 15,
        _ => {}
    }
    bits |= u16::from(high) << 7;
    bits |= u16::from(low & 0xE0) >> 1;
    let value = (bits & 0xFFF0) as i16;
    Some(f32::from(value) / 128.0)
}

fn fan_rpm(count: u16) -> Option<f32> {
    match count {
        0 => None,
        c if c < 0x0FFF => Some(1.5e6 / f32::from(c)),
        _ => Some(0.0),
    }
}

/// Decoder for Fintek parts
pub struct F718xx {
    bus: Bus,
    chip: Chip,
    address: u16,
    ports: RegisterPorts,
    voltages: Vec<Option<f32>>,
    temperatures: Vec<Option<f32>>,
    fans: Vec<Option<f32>>,
    controls: Vec<Option<f32>>,
    saved: Vec<Option<u8>>,
}

impl F718xx {
    /// The LPC probe has already checked the vendor id for this family
    pub fn new(bus: Bus, chip: Chip, address: u16) -> Self {
        let voltages = if chip == Chip::F71858 { 3 } else { 9 };
        let fans = if matches!(chip, Chip::F71882 | Chip::F71858) { 4 } else { 3 };
        Self {
            bus,
            chip,
            address,
            ports: RegisterPorts::new(address),
            voltages: vec![None; voltages],
            temperatures: vec![None; 3],
            fans: vec![None; fans],
            controls: vec![None; fans],
            saved: vec![None; fans],
        }
    }

    fn read(&self, isa: &IsaBus<'_>, register: u8) -> Result<u8> {
        self.ports.read(isa, u16::from(register))
    }
}

impl SuperIoChip for F718xx {
    fn chip(&self) -> Chip {
        self.chip
    }

    fn address(&self) -> u16 {
        self.address
    }

    fn voltages(&self) -> &[Option<f32>] {
        &self.voltages
    }

    fn temperatures(&self) -> &[Option<f32>] {
        &self.temperatures
    }

    fn fans(&self) -> &[Option<f32>] {
        &self.fans
    }

    fn controls(&self) -> &[Option<f32>] {
        &self.controls
    }

    fn update(&mut self) -> Result<()> {
        let bus = self.bus.clone();
        let isa = bus.lock_isa()?;

        for i in 0..self.voltages.len() {
            let value = 0.008 * f32::from(self.read(&isa, VOLTAGE_BASE_REG + i as u8)?);
            self.voltages[i] = (value > 0.0).then_some(value);
        }

        if self.chip == Chip::F71858 {
            let mode = self.read(&isa, TEMPERATURE_CONFIG_REG)? & 0x03;
            for i in 0..self.temperatures.len() {
                let register = TEMPERATURE_BASE_REG + 2 * i as u8;
                let high = self.read(&isa, register)?;
                let low = self.read(&isa, register + 1)?;
                self.temperatures[i] = f71858_temperature(mode, high, low);
            }
        } else {
            for i in 0..self.temperatures.len() {
                let raw = self.read(&isa, TEMPERATURE_BASE_REG + 2 * (i as u8 + 1))? as i8;
                self.temperatures[i] = (raw > 0).then(|| f32::from(raw)).and_then(plausible_temperature);
            }
        }

        for i in 0..self.fans.len() {
            let high = self.read(&isa, FAN_TACHOMETER_REG[i])?;
            let low = self.read(&isa, FAN_TACHOMETER_REG[i] + 1)?;
            self.fans[i] = fan_rpm(u16::from(high) << 8 | u16::from(low));
        }

        for i in 0..self.controls.len() {
            let value = self.read(&isa, FAN_PWM_REG[i])?;
            self.controls[i] = Some(f32::from(value) * 100.0 / 255.0);
        }
        trace!("{} updated", self.chip);
        Ok(())
    }

    fn set_control(&mut self, index: usize, value: Option<u8>) -> Result<()> {
        if index >= self.controls.len() {
            return Err(Error::InvalidValue(format!("{} has no control {}", self.chip, index)));
        }
        let bus = self.bus.clone();
        let isa = bus.lock_isa()?;
        let register = u16::from(FAN_PWM_REG[index]);
        match value {
            Some(value) => {
                if self.saved[index].is_none() {
                    self.saved[index] = Some(self.ports.read(&isa, register)?);
                }
                self.ports.write(&isa, register, value)
            }
            None => {
                if let Some(saved) = self.saved[index] {
                    self.ports.write(&isa, register, saved)?;
                    self.saved[index] = None;
                }
                Ok(())
            }
        }
    }

    fn report(&self) -> String {
        let mut r = String::new();
        let _ = writeln!(r, "Chip: {}", self.chip);
        let _ = writeln!(r, "Base address: {:#06x}", self.address);
        match self.bus.lock_isa() {
            Ok(isa) => r.push_str(&dump_registers(&isa, &self.ports, &[0])),
            Err(e) => {
                let _ = writeln!(r, "Registers unavailable: {}", e);
            }
        }
        r
    }
}
