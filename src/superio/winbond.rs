//! Winbond W836xx hardware monitors

use super::{dump_registers, plausible_temperature, Chip, RegisterPorts, SuperIoChip};
use crate::bus::{Bus, IsaBus};
use crate::error::{Error, Result};
use log::{debug, trace};
use std::fmt::Write as _;

const WINBOND_VENDOR_ID: u16 = 0x5CA3;
const BANK_SELECT_REGISTER: u8 = 0x4E;
const VENDOR_ID_HIGH_REGISTER: u16 = 0x804F;
const VENDOR_ID_LOW_REGISTER: u16 = 0x004F;
const VOLTAGE_VBAT_REG: u16 = 0x551;
const VBAT_MONITOR_CONTROL_REGISTER: u16 = 0x05D;
const VRM_CONFIGURATION_REGISTER: u16 = 0x018;
const TEMPERATURE_SOURCE_SELECT_REG: u16 = 0x049;

const TEMPERATURE_REG: [u16; 3] = [0x150, 0x250, 0x027];

const FAN_TACHO_REG: [u16; 5] = [0x028, 0x029, 0x02A, 0x03F, 0x553];
const FAN_BIT_REG: [u16; 5] = [0x047, 0x04B, 0x04C, 0x059, 0x05D];
const FAN_DIV_BIT0: [u32; 5] = [36, 38, 30, 8, 10];
const FAN_DIV_BIT1: [u32; 5] = [37, 39, 31, 9, 11];
const FAN_DIV_BIT2: [u32; 5] = [5, 6, 7, 23, 15];

static VOLTAGE_REG_EHF: [u16; 10] = [0x020, 0x021, 0x022, 0x023, 0x024, 0x025, 0x026, 0x550, 0x551, 0x552];
static VOLTAGE_REG_DHG: [u16; 9] = [0x020, 0x021, 0x022, 0x023, 0x024, 0x025, 0x026, 0x550, 0x551];
static VOLTAGE_REG_HF: [u16; 7] = [0x020, 0x021, 0x022, 0x023, 0x024, 0x550, 0x551];

fn set_bit(target: u64, bit: u32, value: u64) -> u64 {
    let mask = 1u64 << bit;
    (target & !mask) | ((value & 1) << bit)
}

/// Decoder for W83627/W83667/W83687 parts
pub struct W836xx {
    bus: Bus,
    chip: Chip,
    revision: u8,
    address: u16,
    ports: RegisterPorts,
    voltage_registers: &'static [u16],
    voltage_gain: f32,
    vrm_on_first: bool,
    /// Slots wired to PECI report relative values and are skipped
    peci: [bool; 3],
    voltages: Vec<Option<f32>>,
    temperatures: Vec<Option<f32>>,
    fans: Vec<Option<f32>>,
}

impl W836xx {
    /// `None` when the vendor id does not read back as Winbond
    pub fn open(bus: Bus, chip: Chip, revision: u8, address: u16) -> Result<Option<Self>> {
        let ports = RegisterPorts::banked(address, BANK_SELECT_REGISTER);
        let peci = {
            let isa = bus.lock_isa()?;
            let vendor = u16::from(ports.read(&isa, VENDOR_ID_HIGH_REGISTER)?) << 8
                | u16::from(ports.read(&isa, VENDOR_ID_LOW_REGISTER)?);
            if vendor != WINBOND_VENDOR_ID {
                debug!("{} at {:#x}: vendor id {:#06x}", chip, address, vendor);
                return Ok(None);
            }
            match chip {
                Chip::W83667HG | Chip::W83667HGB => {
                    let select = ports.read(&isa, TEMPERATURE_SOURCE_SELECT_REG)?;
                    [select & 0x04 != 0, select & 0x40 != 0, false]
                }
                Chip::W83627DHG | Chip::W83627DHGP => {
                    let select = ports.read(&isa, TEMPERATURE_SOURCE_SELECT_REG)?;
                    [select & 0x07 != 0, select & 0x70 != 0, false]
                }
                _ => [false; 3],
            }
        };

        let legacy = matches!(chip, Chip::W83627HF | Chip::W83627THF | Chip::W83687THF);
        let voltage_registers: &'static [u16] = match chip {
            Chip::W83627EHF => &VOLTAGE_REG_EHF,
            _ if legacy => &VOLTAGE_REG_HF,
            _ => &VOLTAGE_REG_DHG,
        };
        Ok(Some(Self {
            bus,
            chip,
            revision,
            address,
            ports,
            voltage_registers,
            voltage_gain: if legacy { 0.016 } else { 0.008 },
            vrm_on_first: legacy,
            peci,
            voltages: vec![None; voltage_registers.len()],
            temperatures: vec![None; TEMPERATURE_REG.len()],
            fans: vec![None; if legacy { 3 } else { 5 }],
        }))
    }

    fn read(&self, isa: &IsaBus<'_>, register: u16) -> Result<u8> {
        self.ports.read(isa, register)
    }

    fn update_fans(&mut self, isa: &IsaBus<'_>) -> Result<()> {
        let mut bits = 0u64;
        for (i, &register) in FAN_BIT_REG.iter().enumerate() {
            bits |= u64::from(self.read(isa, register)?) << (i * 8);
        }
        let mut new_bits = bits;

        for i in 0..self.fans.len() {
            let count = self.read(isa, FAN_TACHO_REG[i])?;
            let mut divisor_bits = (((bits >> FAN_DIV_BIT2[i]) & 1) << 2
                | ((bits >> FAN_DIV_BIT1[i]) & 1) << 1
                | ((bits >> FAN_DIV_BIT0[i]) & 1)) as u32;
            let divisor = 1u32 << divisor_bits;

            self.fans[i] = match count {
                0 => None,
                0xFF => Some(0.0),
                c => Some(1.35e6 / (u32::from(c) * divisor) as f32),
            };

            // keep the count inside the resolvable band
            if count > 192 && divisor_bits < 7 {
                divisor_bits += 1;
            }
            if count < 96 && divisor_bits > 0 {
                divisor_bits -= 1;
            }
            let divisor_bits = u64::from(divisor_bits);
            new_bits = set_bit(new_bits, FAN_DIV_BIT2[i], divisor_bits >> 2);
            new_bits = set_bit(new_bits, FAN_DIV_BIT1[i], divisor_bits >> 1);
            new_bits = set_bit(new_bits, FAN_DIV_BIT0[i], divisor_bits);
        }

        for (i, &register) in FAN_BIT_REG.iter().enumerate() {
            let old = (bits >> (i * 8)) as u8;
            let new = (new_bits >> (i * 8)) as u8;
            if old != new {
                self.ports.write(isa, register, new)?;
            }
        }
        Ok(())
    }
}

impl SuperIoChip for W836xx {
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
        &[]
    }

    fn update(&mut self) -> Result<()> {
        let bus = self.bus.clone();
        let isa = bus.lock_isa()?;

        let vbat_enabled = self.read(&isa, VBAT_MONITOR_CONTROL_REGISTER)? & 0x01 != 0;
        for (i, &register) in self.voltage_registers.iter().enumerate() {
            let raw = f32::from(self.read(&isa, register)?);
            let value = if i == 0 && self.vrm_on_first {
                if self.read(&isa, VRM_CONFIGURATION_REGISTER)? & 0x01 == 0 {
                    0.016 * raw
                } else {
                    0.00488 * raw + 0.69
                }
            } else {
                self.voltage_gain * raw
            };
            let valid = value > 0.0 && (register != VOLTAGE_VBAT_REG || vbat_enabled);
            self.voltages[i] = valid.then_some(value);
        }

        for (i, &register) in TEMPERATURE_REG.iter().enumerate() {
            if self.peci[i] {
                self.temperatures[i] = None;
                continue;
            }
            let mut value = i32::from(self.read(&isa, register)? as i8) << 1;
            if register >> 8 > 0 {
                value |= i32::from(self.read(&isa, register + 1)? >> 7);
            }
            self.temperatures[i] = plausible_temperature(0.5 * value as f32);
        }

        self.update_fans(&isa)?;
        trace!("{} updated", self.chip);
        Ok(())
    }

    fn set_control(&mut self, index: usize, _value: Option<u8>) -> Result<()> {
        Err(Error::NotSupported(format!("{} has no control {}", self.chip, index)))
    }

    fn report(&self) -> String {
        let mut r = String::new();
        let _ = writeln!(r, "Chip: {}", self.chip);
        let _ = writeln!(r, "Revision: {:#04x}", self.revision);
        let _ = writeln!(r, "Base address: {:#06x}", self.address);
        let _ = writeln!(r, "PECI slots: {:?}", self.peci);
        match self.bus.lock_isa() {
            Ok(isa) => r.push_str(&dump_registers(&isa, &self.ports, &[0, 1, 2, 5])),
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

    fn setup() -> (ChipRegisters, Bus) {
        let sim = SimulatedBus::new();
        let regs = ChipRegisters::banked(0x290, BANK_SELECT_REGISTER);
        regs.set(VENDOR_ID_HIGH_REGISTER, 0x5C);
        regs.set(VENDOR_ID_LOW_REGISTER, 0xA3);
        sim.add_port_device(regs.clone());
        (regs, Bus::new(sim, Duration::from_millis(10)))
    }

    #[test]
    fn test_temperatures() {
        let (regs, bus) = setup();
        regs.set(0x150, 0x28);
        regs.set(0x151, 0x80);
        regs.set(0x027, 0x1E);
        let mut chip = W836xx::open(bus, Chip::W83627EHF, 0x50, 0x290).unwrap().unwrap();
        chip.update().unwrap();
        assert_eq!(chip.temperatures()[0], Some(40.5));
        assert_eq!(chip.temperatures()[1], Some(0.0));
        assert_eq!(chip.temperatures()[2], Some(30.0));
        assert!(chip.controls().is_empty());
        assert!(chip.set_control(0, None).is_err());
    }

    #[test]
    fn test_peci_slots_skipped() {
        let (regs, bus) = setup();
        regs.set(TEMPERATURE_SOURCE_SELECT_REG, 0x04);
        regs.set(0x150, 0x28);
        let mut chip = W836xx::open(bus, Chip::W83667HG, 0x50, 0x290).unwrap().unwrap();
        chip.update().unwrap();
        assert_eq!(chip.temperatures()[0], None);
    }

    #[test]
    fn test_vrm_formula() {
        let (regs, bus) = setup();
        regs.set(0x020, 100);
        let mut chip = W836xx::open(bus, Chip::W83627HF, 0x41, 0x290).unwrap().unwrap();
        assert_eq!(chip.fans().len(), 3);
        chip.update().unwrap();
        assert!((chip.voltages()[0].unwrap() - 1.6).abs() < 1e-5);

        regs.set(VRM_CONFIGURATION_REGISTER, 0x01);
        chip.update().unwrap();
        assert!((chip.voltages()[0].unwrap() - (0.488 + 0.69)).abs() < 1e-5);
    }

    #[test]
    fn test_vbat_gated() {
        let (regs, bus) = setup();
        regs.set(VOLTAGE_VBAT_REG, 200);
        let mut chip = W836xx::open(bus, Chip::W83627DHG, 0x20, 0x290).unwrap().unwrap();
        chip.update().unwrap();
        assert_eq!(chip.voltages()[8], None);
        regs.set(VBAT_MONITOR_CONTROL_REGISTER, 0x01);
        chip.update().unwrap();
        assert!((chip.voltages()[8].unwrap() - 1.6).abs() < 1e-5);
    }

    #[test]
    fn test_fan_divisor_adjust() {
        let (regs, bus) = setup();
        // fan 0 count 200 at divisor 1 steps its divisor up
        regs.set(FAN_TACHO_REG[0], 200);
        regs.set(FAN_TACHO_REG[1], 0xFF);
        let mut chip = W836xx::open(bus, Chip::W83627DHG, 0x20, 0x290).unwrap().unwrap();
        chip.update().unwrap();
        assert!((chip.fans()[0].unwrap() - 1.35e6 / 200.0).abs() < 1e-2);
        assert_eq!(chip.fans()[1], Some(0.0));
        assert_eq!(chip.fans()[2], None);

        // DIV0 of fan 0 is bit 36: register 0x5D bit 4
        assert_eq!(regs.get(0x05D) & 0x10, 0x10);
        chip.update().unwrap();
        assert!((chip.fans()[0].unwrap() - 1.35e6 / 400.0).abs() < 1e-2);
    }

    #[test]
    fn test_wrong_vendor() {
        let (regs, bus) = setup();
        regs.set(VENDOR_ID_HIGH_REGISTER, 0x12);
        assert!(W836xx::open(bus, Chip::W83627DHG, 0x20, 0x290).unwrap().is_none());
    }
}
