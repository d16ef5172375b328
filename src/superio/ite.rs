//! ITE IT87xx environment controllers

use super::{dump_registers, plausible_temperature, Chip, RegisterPorts, SuperIoChip};
use crate::bus::{Bus, IsaBus};
use crate::error::{Error, Result};
use log::{debug, trace};
use std::fmt::Write as _;

const ITE_VENDOR_ID: u8 = 0x90;

const CONFIGURATION_REGISTER: u8 = 0x00;
const VENDOR_ID_REGISTER: u8 = 0x58;
const TEMPERATURE_BASE_REG: u8 = 0x29;
const VOLTAGE_BASE_REG: u8 = 0x20;
const FAN_TACHOMETER_DIVISOR_REGISTER: u8 = 0x0B;
const FAN_MAIN_CTRL_REG: u8 = 0x13;

const FAN_TACHOMETER_REG: [u8; 6] = [0x0D, 0x0E, 0x0F, 0x80, 0x82, 0x4C];
const FAN_TACHOMETER_EXT_REG: [u8; 6] = [0x18, 0x19, 0x1A, 0x81, 0x83, 0x4D];
const FAN_PWM_CTRL_REG: [u8; 6] = [0x15, 0x16, 0x17, 0x7F, 0xA7, 0xAF];
const FAN_PWM_CTRL_EXT_REG: [u8; 6] = [0x63, 0x6B, 0x73, 0x7B, 0xA3, 0xAB];

/// Pre-software register state of one PWM output
#[derive(Debug, Clone, Copy)]
struct SavedControl {
    pwm: u8,
    ext: Option<u8>,
    main: Option<u8>,
}

/// Decoder for IT87xx parts
pub struct It87xx {
    bus: Bus,
    chip: Chip,
    address: u16,
    version: u8,
    ports: RegisterPorts,
    gain: f32,
    has_16bit_fans: bool,
    has_ext_reg: bool,
    always_valid: bool,
    voltages: Vec<Option<f32>>,
    temperatures: Vec<Option<f32>>,
    fans: Vec<Option<f32>>,
    controls: Vec<Option<f32>>,
    saved: Vec<Option<SavedControl>>,
}

fn voltage_gain(chip: Chip) -> f32 {
    use Chip::*;
    match chip {
        IT8620E | IT8628E | IT8721F | IT8728F | IT8771E | IT8772E | IT8686E | IT8688E | IT8689E => 0.012,
        IT8655E | IT8665E | IT8792E | IT87952E => 0.0109,
        _ => 0.016,
    }
}

fn has_ext_reg(chip: Chip) -> bool {
    use Chip::*;
    matches!(
        chip,
        IT8620E | IT8628E | IT8655E | IT8665E | IT8686E | IT8688E | IT8689E | IT8721F | IT8728F | IT8792E
    )
}

fn fan_count(chip: Chip) -> usize {
    use Chip::*;
    match chip {
        IT8705F | IT8712F | IT8655E => 3,
        IT8628E | IT8665E | IT8686E | IT8688E | IT8689E => 6,
        _ => 5,
    }
}

fn control_count(chip: Chip) -> usize {
    match fan_count(chip) {
        6 => 5,
        _ => 3,
    }
}

/// 16-bit tachometer count to RPM
fn fan_rpm_16(count: u16) -> Option<f32> {
    if count <= 0x3F {
        return None;
    }
    Some(if count < 0xFFFF {
        1.35e6 / (count as f32 * 2.0)
    } else {
        0.0
    })
}

/// 8-bit tachometer count to RPM with a divisor
fn fan_rpm_8(count: u8, divisor: u32) -> Option<f32> {
    if count == 0 {
        return None;
    }
    Some(if count < 0xFF {
        1.35e6 / (count as u32 * divisor) as f32
    } else {
        0.0
    })
}

impl It87xx {
    /// Verify the vendor id and monitoring enable bit; `None` when the
    /// controller is absent or disabled
    pub fn open(bus: Bus, chip: Chip, address: u16, version: u8) -> Result<Option<Self>> {
        let ports = RegisterPorts::new(address);
        let always_valid = chip == Chip::IT8688E;
        {
            let isa = bus.lock_isa()?;
            let (vendor, valid) = ports.read_checked(&isa, VENDOR_ID_REGISTER)?;
            if !(valid || always_valid) || vendor != ITE_VENDOR_ID {
                debug!("{} at {:#x}: vendor id {:#04x}", chip, address, vendor);
                return Ok(None);
            }
            let (config, valid) = ports.read_checked(&isa, CONFIGURATION_REGISTER)?;
            let exempt = matches!(chip, Chip::IT8655E | Chip::IT8665E);
            if !(valid || always_valid) || (config & 0x10 == 0 && !exempt) {
                debug!("{} at {:#x}: monitoring disabled", chip, address);
                return Ok(None);
            }
        }

        let has_16bit_fans = !((chip == Chip::IT8705F && version < 3) || (chip == Chip::IT8712F && version < 8));
        Ok(Some(Self {
            bus,
            chip,
            address,
            version,
            ports,
            gain: voltage_gain(chip),
            has_16bit_fans,
            has_ext_reg: has_ext_reg(chip),
            always_valid,
            voltages: vec![None; 9],
            temperatures: vec![None; 3],
            fans: vec![None; fan_count(chip)],
            controls: vec![None; control_count(chip)],
            saved: vec![None; control_count(chip)],
        }))
    }

    fn read(&self, isa: &IsaBus<'_>, register: u8) -> Result<Option<u8>> {
        let (value, valid) = self.ports.read_checked(isa, register)?;
        Ok((valid || self.always_valid).then_some(value))
    }

    fn write(&self, isa: &IsaBus<'_>, register: u8, value: u8) -> Result<()> {
        self.ports.write(isa, register as u16, value)
    }

    fn read_fan(&self, isa: &IsaBus<'_>, index: usize, divisors: Option<u8>) -> Result<Option<f32>> {
        if self.has_16bit_fans {
            let (Some(low), Some(high)) = (
                self.read(isa, FAN_TACHOMETER_REG[index])?,
                self.read(isa, FAN_TACHOMETER_EXT_REG[index])?,
            ) else {
                return Ok(None);
            };
            return Ok(fan_rpm_16(u16::from(high) << 8 | u16::from(low)));
        }
        let Some(count) = self.read(isa, FAN_TACHOMETER_REG[index])? else {
            return Ok(None);
        };
        let Some(divisors) = divisors else {
            return Ok(None);
        };
        let divisor = match index {
            0 | 1 => 1u32 << ((divisors >> (3 * index)) & 0x7),
            _ => {
                if divisors & 0x40 != 0 {
                    8
                } else {
                    2
                }
            }
        };
        Ok(fan_rpm_8(count, divisor))
    }

    fn read_control(&self, isa: &IsaBus<'_>, index: usize) -> Result<Option<f32>> {
        let Some(value) = self.read(isa, FAN_PWM_CTRL_REG[index])? else {
            return Ok(None);
        };
        if value & 0x80 != 0 {
            // automatic mode
            return Ok(None);
        }
        if self.has_ext_reg {
            Ok(self
                .read(isa, FAN_PWM_CTRL_EXT_REG[index])?
                .map(|ext| ext as f32 * 100.0 / 255.0))
        } else {
            Ok(Some((value & 0x7F) as f32 * 100.0 / 127.0))
        }
    }
}

impl SuperIoChip for It87xx {
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
            let value = self
                .read(&isa, VOLTAGE_BASE_REG + i as u8)?
                .map(|raw| self.gain * raw as f32)
                .filter(|v| *v > 0.0);
            self.voltages[i] = value;
        }

        for i in 0..self.temperatures.len() {
            let value = self
                .read(&isa, TEMPERATURE_BASE_REG + i as u8)?
                .map(|raw| raw as i8)
                .filter(|t| *t > 0)
                .and_then(|t| plausible_temperature(f32::from(t)));
            self.temperatures[i] = value;
        }

        let divisors = if self.has_16bit_fans {
            None
        } else {
            self.read(&isa, FAN_TACHOMETER_DIVISOR_REGISTER)?
        };
        for i in 0..self.fans.len() {
            self.fans[i] = self.read_fan(&isa, i, divisors)?;
        }

        for i in 0..self.controls.len() {
            self.controls[i] = self.read_control(&isa, i)?;
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
        let pwm_reg = FAN_PWM_CTRL_REG[index];
        let ext_reg = FAN_PWM_CTRL_EXT_REG[index];

        match value {
            Some(value) => {
                let saved = match self.saved[index] {
                    Some(saved) => saved,
                    None => {
                        let saved = SavedControl {
                            pwm: self.ports.read(&isa, pwm_reg as u16)?,
                            ext: if self.has_ext_reg {
                                Some(self.ports.read(&isa, ext_reg as u16)?)
                            } else {
                                None
                            },
                            main: if index < 3 {
                                Some(self.ports.read(&isa, FAN_MAIN_CTRL_REG as u16)?)
                            } else {
                                None
                            },
                        };
                        self.saved[index] = Some(saved);
                        saved
                    }
                };

                if index < 3 {
                    let main = self.ports.read(&isa, FAN_MAIN_CTRL_REG as u16)?;
                    if main & (1 << index) == 0 {
                        self.write(&isa, FAN_MAIN_CTRL_REG, main | (1 << index))?;
                    }
                }
                if self.has_ext_reg {
                    let pwm = if self.chip == Chip::IT8689E { 0x7F } else { saved.pwm & 0x7F };
                    self.write(&isa, pwm_reg, pwm)?;
                    self.write(&isa, ext_reg, value)?;
                } else {
                    self.write(&isa, pwm_reg, value >> 1)?;
                }
            }
            None => {
                // the snapshot survives a failed write so a retry can restore it
                let Some(saved) = self.saved[index] else {
                    return Ok(());
                };
                self.write(&isa, pwm_reg, saved.pwm)?;
                if let Some(ext) = saved.ext {
                    self.write(&isa, ext_reg, ext)?;
                }
                if let Some(main) = saved.main {
                    let bit = 1u8 << index;
                    let current = self.ports.read(&isa, FAN_MAIN_CTRL_REG as u16)?;
                    self.write(&isa, FAN_MAIN_CTRL_REG, (current & !bit) | (main & bit))?;
                }
                self.saved[index] = None;
            }
        }
        Ok(())
    }

    fn report(&self) -> String {
        let mut r = String::new();
        let _ = writeln!(r, "Chip: {}", self.chip);
        let _ = writeln!(r, "Version: {:#04x}", self.version);
        let _ = writeln!(r, "Base address: {:#06x}", self.address);
        let _ = writeln!(r, "16-bit fan counters: {}", self.has_16bit_fans);
        match self.bus.lock_isa() {
            Ok(isa) => r.push_str(&dump_registers(&isa, &self.ports, &[0])),
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
        let regs = ChipRegisters::new(0xA40);
        regs.set(VENDOR_ID_REGISTER as u16, ITE_VENDOR_ID);
        regs.set(CONFIGURATION_REGISTER as u16, 0x11);
        sim.add_port_device(regs.clone());
        (regs, sim)
    }

    fn setup() -> (ChipRegisters, Bus) {
        let (regs, sim) = simulated();
        (regs, Bus::new(sim, Duration::from_millis(10)))
    }

    #[test]
    fn test_voltage_gain_fixture() {
        let (regs, bus) = setup();
        regs.set(VOLTAGE_BASE_REG as u16, 0x64);
        let mut ite = It87xx::open(bus, Chip::IT8716F, 0xA40, 1).unwrap().unwrap();
        ite.update().unwrap();
        let v = ite.voltages()[0].unwrap();
        assert!((v - 1.6).abs() < 1e-6, "{}", v);
        assert_eq!(ite.voltages()[1], None);
    }

    #[test]
    fn test_rejects_wrong_vendor() {
        let (regs, bus) = setup();
        regs.set(VENDOR_ID_REGISTER as u16, 0x5C);
        assert!(It87xx::open(bus, Chip::IT8716F, 0xA40, 1).unwrap().is_none());
    }

    #[test]
    fn test_rejects_disabled_monitor() {
        let (regs, bus) = setup();
        regs.set(CONFIGURATION_REGISTER as u16, 0x01);
        assert!(It87xx::open(bus.clone(), Chip::IT8716F, 0xA40, 1).unwrap().is_none());
        assert!(It87xx::open(bus, Chip::IT8665E, 0xA40, 1).unwrap().is_some());
    }

    #[test]
    fn test_temperatures_and_fans() {
        let (regs, bus) = setup();
        regs.set(TEMPERATURE_BASE_REG as u16, 42);
        regs.set(TEMPERATURE_BASE_REG as u16 + 1, 0x80);
        regs.set(FAN_TACHOMETER_REG[0] as u16, 0x51);
        regs.set(FAN_TACHOMETER_EXT_REG[0] as u16, 0x01);
        regs.set(FAN_TACHOMETER_REG[1] as u16, 0xFF);
        regs.set(FAN_TACHOMETER_EXT_REG[1] as u16, 0xFF);
        let mut ite = It87xx::open(bus, Chip::IT8721F, 0xA40, 1).unwrap().unwrap();
        ite.update().unwrap();

        assert_eq!(ite.temperatures()[0], Some(42.0));
        assert_eq!(ite.temperatures()[1], None);
        // 0x151 = 337 counts
        let rpm = ite.fans()[0].unwrap();
        assert!((rpm - 1.35e6 / 674.0).abs() < 1e-2);
        assert_eq!(ite.fans()[1], Some(0.0));
        assert_eq!(ite.fans()[2], None);
    }

    #[test]
    fn test_out_of_range_temperature_dropped() {
        let (regs, bus) = setup();
        regs.set(TEMPERATURE_BASE_REG as u16, 126);
        regs.set(TEMPERATURE_BASE_REG as u16 + 1, 125);
        regs.set(TEMPERATURE_BASE_REG as u16 + 2, 0);
        let mut ite = It87xx::open(bus, Chip::IT8721F, 0xA40, 1).unwrap().unwrap();
        ite.update().unwrap();

        assert_eq!(ite.temperatures()[0], None);
        assert_eq!(ite.temperatures()[1], Some(125.0));
        assert_eq!(ite.temperatures()[2], None);
    }

    #[test]
    fn test_8bit_fans() {
        assert_eq!(fan_rpm_8(0, 2), None);
        assert_eq!(fan_rpm_8(0xFF, 2), Some(0.0));
        assert_eq!(fan_rpm_8(135, 2), Some(5000.0));
        assert_eq!(fan_rpm_16(0x3F), None);
    }

    #[test]
    fn test_control_restore() {
        let (regs, bus) = setup();
        regs.set(FAN_PWM_CTRL_REG[0] as u16, 0x85);
        regs.set(FAN_PWM_CTRL_EXT_REG[0] as u16, 0x40);
        regs.set(FAN_MAIN_CTRL_REG as u16, 0x06);
        let mut ite = It87xx::open(bus, Chip::IT8721F, 0xA40, 1).unwrap().unwrap();

        ite.set_control(0, Some(0xC0)).unwrap();
        assert_eq!(regs.get(FAN_PWM_CTRL_REG[0] as u16), 0x05);
        assert_eq!(regs.get(FAN_PWM_CTRL_EXT_REG[0] as u16), 0xC0);
        assert_eq!(regs.get(FAN_MAIN_CTRL_REG as u16), 0x07);

        ite.update().unwrap();
        let duty = ite.controls()[0].unwrap();
        assert!((duty - 0xC0 as f32 * 100.0 / 255.0).abs() < 1e-3);

        ite.set_control(0, Some(0x20)).unwrap();
        ite.set_control(0, None).unwrap();
        assert_eq!(regs.get(FAN_PWM_CTRL_REG[0] as u16), 0x85);
        assert_eq!(regs.get(FAN_PWM_CTRL_EXT_REG[0] as u16), 0x40);
        assert_eq!(regs.get(FAN_MAIN_CTRL_REG as u16), 0x06);
    }

    #[test]
    fn test_control_without_ext_register() {
        let (regs, bus) = setup();
        regs.set(FAN_PWM_CTRL_REG[1] as u16, 0x90);
        let mut ite = It87xx::open(bus, Chip::IT8716F, 0xA40, 1).unwrap().unwrap();
        ite.set_control(1, Some(0xFE)).unwrap();
        assert_eq!(regs.get(FAN_PWM_CTRL_REG[1] as u16), 0x7F);
        ite.set_control(1, None).unwrap();
        assert_eq!(regs.get(FAN_PWM_CTRL_REG[1] as u16), 0x90);
        assert!(ite.set_control(7, None).is_err());
    }

    #[test]
    fn test_failed_restore_can_be_retried() {
        let (regs, sim) = simulated();
        regs.set(FAN_PWM_CTRL_REG[0] as u16, 0x85);
        regs.set(FAN_PWM_CTRL_EXT_REG[0] as u16, 0x40);
        regs.set(FAN_MAIN_CTRL_REG as u16, 0x06);
        let bus = Bus::new(sim.clone(), Duration::from_millis(10));
        let mut ite = It87xx::open(bus, Chip::IT8721F, 0xA40, 1).unwrap().unwrap();
        ite.set_control(0, Some(0xC0)).unwrap();

        sim.refuse_port_writes(true);
        assert!(ite.set_control(0, None).is_err());
        assert_eq!(regs.get(FAN_PWM_CTRL_EXT_REG[0] as u16), 0xC0);

        sim.refuse_port_writes(false);
        ite.set_control(0, None).unwrap();
        assert_eq!(regs.get(FAN_PWM_CTRL_REG[0] as u16), 0x85);
        assert_eq!(regs.get(FAN_PWM_CTRL_EXT_REG[0] as u16), 0x40);
        assert_eq!(regs.get(FAN_MAIN_CTRL_REG as u16), 0x06);
    }
}
