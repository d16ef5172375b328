//! Nuvoton NCT67xx hardware monitors
//!
//! Registers are bank-switched through index 0x4E. Temperature slots are
//! routed by source selector registers, so each reading is matched to the
//! slot whose expected source it carries.

use super::{dump_registers, plausible_temperature, Chip, RegisterPorts, SuperIoChip};
use crate::bus::{Bus, IsaBus};
use crate::error::{Error, Result};
use log::{debug, trace};
use std::fmt::Write as _;

const NUVOTON_VENDOR_ID: u16 = 0x5CA3;
const BANK_SELECT_REGISTER: u8 = 0x4E;
const VENDOR_ID_HIGH_REGISTER: u16 = 0x804F;
const VENDOR_ID_LOW_REGISTER: u16 = 0x004F;
const VBAT_MONITOR_CONTROL_REGISTER: u16 = 0x005D;

const VOLTAGE_GAIN: f32 = 0.008;

const FAN_PWM_OUT_REG: [u16; 7] = [0x001, 0x003, 0x011, 0x013, 0x015, 0xA09, 0xB09];
const FAN_PWM_COMMAND_REG: [u16; 7] = [0x109, 0x209, 0x309, 0x809, 0x909, 0xA09, 0xB09];
const FAN_CONTROL_MODE_REG: [u16; 7] = [0x102, 0x202, 0x302, 0x802, 0x902, 0xA02, 0xB02];

/// Register layout of one chip generation
struct Layout {
    voltages: &'static [u16],
    vbat: u16,
    temperatures: &'static [u16],
    temperature_halves: &'static [u16],
    temperature_sources: &'static [u16],
    expected_sources: &'static [u8],
    names: &'static [&'static str],
    fans: &'static [u16],
    /// Fan counts are 13-bit (`hi << 5 | lo & 0x1F`) rather than 16-bit
    fan_13bit: bool,
}

static NCT679X_VOLTAGES: [u16; 15] = [
    0x480, 0x481, 0x482, 0x483, 0x484, 0x485, 0x486, 0x487, 0x488, 0x489, 0x48A, 0x48B, 0x48C, 0x48D, 0x48E,
];
static NCT679X_TEMPERATURES: [u16; 7] = [0x027, 0x073, 0x075, 0x077, 0x079, 0x07B, 0x150];
static NCT679X_TEMPERATURE_HALVES: [u16; 7] = [0, 0x074, 0x076, 0x078, 0x07A, 0x07C, 0x151];
static NCT679X_TEMPERATURE_SOURCES: [u16; 7] = [0x621, 0x100, 0x200, 0x300, 0x800, 0x900, 0x622];
static NCT679X_FANS: [u16; 7] = [0x4B0, 0x4B2, 0x4B4, 0x4B6, 0x4B8, 0x4BA, 0x4CC];
static NCT679X_NAMES: [&str; 7] = [
    "CPU Core",
    "CPU",
    "System",
    "Auxiliary 0",
    "Auxiliary 1",
    "Auxiliary 2",
    "Auxiliary 3",
];

static NCT67XX_VOLTAGES: [u16; 9] = [0x020, 0x021, 0x022, 0x023, 0x024, 0x025, 0x026, 0x550, 0x551];
static NCT67XX_TEMPERATURES: [u16; 4] = [0x027, 0x073, 0x075, 0x077];
static NCT67XX_TEMPERATURE_HALVES: [u16; 4] = [0, 0x074, 0x076, 0x078];
static NCT67XX_TEMPERATURE_SOURCES: [u16; 4] = [0x621, 0x100, 0x200, 0x300];
static NCT67XX_FANS: [u16; 5] = [0x656, 0x658, 0x65A, 0x65C, 0x65E];
static NCT67XX_NAMES: [&str; 4] = ["CPU Core", "CPU", "Auxiliary", "System"];

fn layout(chip: Chip) -> Layout {
    match chip {
        Chip::NCT6771F | Chip::NCT6776F => Layout {
            voltages: &NCT67XX_VOLTAGES,
            vbat: 0x551,
            temperatures: &NCT67XX_TEMPERATURES,
            temperature_halves: &NCT67XX_TEMPERATURE_HALVES,
            temperature_sources: &NCT67XX_TEMPERATURE_SOURCES,
            expected_sources: if chip == Chip::NCT6771F { &[5, 2, 3, 1] } else { &[12, 2, 3, 1] },
            names: &NCT67XX_NAMES,
            fans: if chip == Chip::NCT6771F { &NCT67XX_FANS[..4] } else { &NCT67XX_FANS },
            fan_13bit: false,
        },
        _ => Layout {
            voltages: &NCT679X_VOLTAGES,
            vbat: 0x488,
            temperatures: &NCT679X_TEMPERATURES,
            temperature_halves: &NCT679X_TEMPERATURE_HALVES,
            temperature_sources: &NCT679X_TEMPERATURE_SOURCES,
            expected_sources: &[16, 2, 1, 3, 4, 5, 6],
            names: &NCT679X_NAMES,
            fans: match chip {
                Chip::NCT6779D => &NCT679X_FANS[..5],
                Chip::NCT6796D | Chip::NCT6797D | Chip::NCT6798D => &NCT679X_FANS,
                _ => &NCT679X_FANS[..6],
            },
            fan_13bit: true,
        },
    }
}

fn fan_rpm(count: u32, saturated: u32) -> Option<f32> {
    match count {
        0 => None,
        c if c >= saturated => Some(0.0),
        c => Some(1.35e6 / c as f32),
    }
}

#[derive(Debug, Clone, Copy)]
struct SavedControl {
    mode: u8,
    command: u8,
}

/// Decoder for NCT6771F through NCT6798D
pub struct Nct67xx {
    bus: Bus,
    chip: Chip,
    revision: u8,
    address: u16,
    ports: RegisterPorts,
    layout: Layout,
    voltages: Vec<Option<f32>>,
    temperatures: Vec<Option<f32>>,
    fans: Vec<Option<f32>>,
    controls: Vec<Option<f32>>,
    saved: Vec<Option<SavedControl>>,
}

impl Nct67xx {
    /// `None` when the vendor id does not read back as Nuvoton
    pub fn open(bus: Bus, chip: Chip, revision: u8, address: u16) -> Result<Option<Self>> {
        let ports = RegisterPorts::banked(address, BANK_SELECT_REGISTER);
        {
            let isa = bus.lock_isa()?;
            let vendor = u16::from(ports.read(&isa, VENDOR_ID_HIGH_REGISTER)?) << 8
                | u16::from(ports.read(&isa, VENDOR_ID_LOW_REGISTER)?);
            if vendor != NUVOTON_VENDOR_ID {
                debug!("{} at {:#x}: vendor id {:#06x}", chip, address, vendor);
                return Ok(None);
            }
        }
        let layout = layout(chip);
        let controls = match chip {
            Chip::NCT6771F | Chip::NCT6776F => 3,
            _ => layout.fans.len(),
        };
        Ok(Some(Self {
            bus,
            chip,
            revision,
            address,
            ports,
            voltages: vec![None; layout.voltages.len()],
            temperatures: vec![None; layout.names.len()],
            fans: vec![None; layout.fans.len()],
            controls: vec![None; controls],
            saved: vec![None; controls],
            layout,
        }))
    }

    fn read(&self, isa: &IsaBus<'_>, register: u16) -> Result<u8> {
        self.ports.read(isa, register)
    }

    fn read_temperatures(&mut self, isa: &IsaBus<'_>) -> Result<()> {
        let mut values = vec![None; self.temperatures.len()];
        // lower-numbered registers win when two carry the same source
        for i in (0..self.layout.temperatures.len()).rev() {
            let source = self.read(isa, self.layout.temperature_sources[i])? & 0x1F;
            let Some(slot) = self.layout.expected_sources.iter().position(|s| *s == source) else {
                continue;
            };
            let mut value = i32::from(self.read(isa, self.layout.temperatures[i])? as i8) << 1;
            let half = self.layout.temperature_halves[i];
            if half != 0 {
                value |= i32::from((self.read(isa, half)? >> 7) & 1);
            }
            if let Some(t) = plausible_temperature(0.5 * value as f32) {
                values[slot] = Some(t);
            }
        }
        self.temperatures = values;
        Ok(())
    }
}

impl SuperIoChip for Nct67xx {
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

    fn temperature_names(&self) -> Option<&'static [&'static str]> {
        Some(self.layout.names)
    }

    fn update(&mut self) -> Result<()> {
        let bus = self.bus.clone();
        let isa = bus.lock_isa()?;

        let vbat_enabled = self.read(&isa, VBAT_MONITOR_CONTROL_REGISTER)? & 0x01 != 0;
        for (i, &register) in self.layout.voltages.iter().enumerate() {
            let value = VOLTAGE_GAIN * f32::from(self.read(&isa, register)?);
            let valid = value > 0.0 && (register != self.layout.vbat || vbat_enabled);
            self.voltages[i] = valid.then_some(value);
        }

        self.read_temperatures(&isa)?;

        for (i, &register) in self.layout.fans.iter().enumerate() {
            let high = u32::from(self.read(&isa, register)?);
            let low = u32::from(self.read(&isa, register + 1)?);
            self.fans[i] = if self.layout.fan_13bit {
                fan_rpm(high << 5 | (low & 0x1F), 0x1FFF)
            } else {
                fan_rpm(high << 8 | low, 0xFFFF)
            };
        }

        for i in 0..self.controls.len() {
            let value = self.read(&isa, FAN_PWM_OUT_REG[i])?;
            self.controls[i] = Some(f32::from(value) / 2.55);
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
        match value {
            Some(value) => {
                if self.saved[index].is_none() {
                    self.saved[index] = Some(SavedControl {
                        mode: self.read(&isa, FAN_CONTROL_MODE_REG[index])?,
                        command: self.read(&isa, FAN_PWM_COMMAND_REG[index])?,
                    });
                }
                // manual mode
                self.ports.write(&isa, FAN_CONTROL_MODE_REG[index], 0)?;
                self.ports.write(&isa, FAN_PWM_COMMAND_REG[index], value)?;
            }
            None => {
                if let Some(saved) = self.saved[index] {
                    self.ports.write(&isa, FAN_CONTROL_MODE_REG[index], saved.mode)?;
                    self.ports.write(&isa, FAN_PWM_COMMAND_REG[index], saved.command)?;
                    self.saved[index] = None;
                }
            }
        }
        Ok(())
    }

    fn report(&self) -> String {
        let mut r = String::new();
        let _ = writeln!(r, "Chip: {}", self.chip);
        let _ = writeln!(r, "Revision: {:#04x}", self.revision);
        let _ = writeln!(r, "Base address: {:#06x}", self.address);
        match self.bus.lock_isa() {
            Ok(isa) => r.push_str(&dump_registers(&isa, &self.ports, &[0, 1, 2, 3, 4, 5, 6, 8, 9, 0xA, 0xB])),
            Err(e) => {
                let _ = writeln!(r, "Registers unavailable: {}", e);
            }
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::ChipRegisters;
    use crate::bus::SimulatedBus;
    use std::time::Duration;

    fn simulated() -> (ChipRegisters, SimulatedBus) {
        let sim = SimulatedBus::new();
        let regs = ChipRegisters::banked(0x290, BANK_SELECT_REGISTER);
        regs.set(VENDOR_ID_HIGH_REGISTER, 0x5C);
        regs.set(VENDOR_ID_LOW_REGISTER, 0xA3);
        sim.add_port_device(regs.clone());
        (regs, sim)
    }

    fn setup() -> (ChipRegisters, Bus) {
        let (regs, sim) = simulated();
        (regs, Bus::new(sim, Duration::from_millis(10)))
    }

    #[test]
    fn test_vendor_check() {
        let (regs, bus) = setup();
        assert!(Nct67xx::open(bus.clone(), Chip::NCT6798D, 0x2B, 0x290).unwrap().is_some());
        regs.set(VENDOR_ID_LOW_REGISTER, 0x00);
        assert!(Nct67xx::open(bus, Chip::NCT6798D, 0x2B, 0x290).unwrap().is_none());
    }

    #[test]
    fn test_cpu_core_temperature() {
        let (regs, bus) = setup();
        regs.set(0x027, 0x32);
        regs.set(0x621, 16);
        let mut chip = Nct67xx::open(bus, Chip::NCT6798D, 0x2B, 0x290).unwrap().unwrap();
        chip.update().unwrap();
        assert_eq!(chip.temperatures()[0], Some(50.0));
        assert_eq!(chip.temperature_names().unwrap()[0], "CPU Core");
    }

    #[test]
    fn test_half_degree_bit() {
        let (regs, bus) = setup();
        regs.set(0x073, 0x32);
        regs.set(0x074, 0x80);
        regs.set(0x100, 2);
        let mut chip = Nct67xx::open(bus, Chip::NCT6798D, 0x2B, 0x290).unwrap().unwrap();
        chip.update().unwrap();
        assert_eq!(chip.temperatures()[1], Some(50.5));
    }

    #[test]
    fn test_unplausible_temperature_dropped() {
        let (regs, bus) = setup();
        regs.set(0x027, 0x80);
        regs.set(0x621, 16);
        let mut chip = Nct67xx::open(bus, Chip::NCT6798D, 0x2B, 0x290).unwrap().unwrap();
        chip.update().unwrap();
        assert_eq!(chip.temperatures()[0], None);
    }

    #[test]
    fn test_fans_and_vbat() {
        let (regs, bus) = setup();
        // 0x0A << 5 | 0x0E = 334
        regs.set(0x4B0, 0x0A);
        regs.set(0x4B1, 0x0E);
        regs.set(0x4B2, 0xFF);
        regs.set(0x4B3, 0xFF);
        regs.set(0x480, 0x7D);
        regs.set(0x488, 0xC8);
        let mut chip = Nct67xx::open(bus, Chip::NCT6796D, 0x21, 0x290).unwrap().unwrap();
        assert_eq!(chip.fans().len(), 7);
        chip.update().unwrap();
        assert!((chip.fans()[0].unwrap() - 1.35e6 / 334.0).abs() < 1e-2);
        assert_eq!(chip.fans()[1], Some(0.0));
        assert_eq!(chip.fans()[2], None);
        assert!((chip.voltages()[0].unwrap() - 1.0).abs() < 1e-6);
        assert_eq!(chip.voltages()[8], None);

        regs.set(VBAT_MONITOR_CONTROL_REGISTER, 0x01);
        chip.update().unwrap();
        assert!((chip.voltages()[8].unwrap() - 1.6).abs() < 1e-6);
    }

    #[test]
    fn test_control_restore() {
        let (regs, bus) = setup();
        regs.set(FAN_CONTROL_MODE_REG[1], 0x50);
        regs.set(FAN_PWM_COMMAND_REG[1], 0x99);
        let mut chip = Nct67xx::open(bus, Chip::NCT6776F, 0x30, 0x290).unwrap().unwrap();
        assert_eq!(chip.controls().len(), 3);

        chip.set_control(1, Some(0x80)).unwrap();
        assert_eq!(regs.get(FAN_CONTROL_MODE_REG[1]), 0);
        assert_eq!(regs.get(FAN_PWM_COMMAND_REG[1]), 0x80);

        chip.set_control(1, None).unwrap();
        assert_eq!(regs.get(FAN_CONTROL_MODE_REG[1]), 0x50);
        assert_eq!(regs.get(FAN_PWM_COMMAND_REG[1]), 0x99);
        assert!(chip.set_control(3, Some(1)).is_err());
    }

    #[test]
    fn test_failed_restore_can_be_retried() {
        let (regs, sim) = simulated();
        regs.set(FAN_CONTROL_MODE_REG[1], 0x50);
        regs.set(FAN_PWM_COMMAND_REG[1], 0x99);
        let bus = Bus::new(sim.clone(), Duration::from_millis(10));
        let mut chip = Nct67xx::open(bus, Chip::NCT6776F, 0x30, 0x290).unwrap().unwrap();
        chip.set_control(1, Some(0x80)).unwrap();

        sim.refuse_port_writes(true);
        assert!(chip.set_control(1, None).is_err());
        assert_eq!(regs.get(FAN_CONTROL_MODE_REG[1]), 0);

        sim.refuse_port_writes(false);
        chip.set_control(1, None).unwrap();
        assert_eq!(regs.get(FAN_CONTROL_MODE_REG[1]), 0x50);
        assert_eq!(regs.get(FAN_PWM_COMMAND_REG[1]), 0x99);
    }
}
