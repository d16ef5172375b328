//! LPC Super-I/O discovery
//!
//! Probes the configuration port pairs at 0x2E and 0x4E. Each probe runs
//! inside one ISA critical section and always leaves configuration mode
//! before the lock is released.

use super::fintek::F718xx;
use super::ite::It87xx;
use super::nuvoton::Nct67xx;
use super::winbond::W836xx;
use super::{Chip, SuperIoChip};
use crate::bus::{Bus, IsaBus};
use crate::error::Result;
use log::{debug, info, warn};
use std::fmt::Write as _;

const REGISTER_PORTS: [u16; 2] = [0x2E, 0x4E];

const CONFIGURATION_CONTROL_REGISTER: u8 = 0x02;
const DEVICE_SELECT_REGISTER: u8 = 0x07;
const CHIP_ID_REGISTER: u8 = 0x20;
const CHIP_REVISION_REGISTER: u8 = 0x21;
const ITE_VERSION_REGISTER: u8 = 0x22;
const FINTEK_VENDOR_ID_REGISTER: u8 = 0x23;
const NUVOTON_HARDWARE_MONITOR_IO_SPACE_LOCK: u8 = 0x28;
const BASE_ADDRESS_REGISTER: u8 = 0x60;

const FINTEK_VENDOR_ID: u16 = 0x1934;

const WINBOND_NUVOTON_HARDWARE_MONITOR_LDN: u8 = 0x0B;
const F71858_HARDWARE_MONITOR_LDN: u8 = 0x02;
const FINTEK_HARDWARE_MONITOR_LDN: u8 = 0x04;
const IT87_ENVIRONMENT_CONTROLLER_LDN: u8 = 0x04;

/// A chip found during the probe, before its decoder is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detected {
    pub chip: Chip,
    pub port: u16,
    /// Revision for Winbond/Nuvoton/Fintek, version nibble for ITE
    pub revision: u8,
    pub address: u16,
}

/// Outcome of [`probe`]
pub struct Probe {
    pub chips: Vec<Box<dyn SuperIoChip>>,
    pub report: String,
}

/// Configuration register access through one index/data pair
struct ConfigPort<'a, 'b> {
    isa: &'a IsaBus<'b>,
    index: u16,
}

impl ConfigPort<'_, '_> {
    fn read(&self, register: u8) -> Result<u8> {
        self.isa.write(self.index, register)?;
        self.isa.read(self.index + 1)
    }

    fn write(&self, register: u8, value: u8) -> Result<()> {
        self.isa.write(self.index, register)?;
        self.isa.write(self.index + 1, value)
    }

    fn read_word(&self, register: u8) -> Result<u16> {
        Ok(u16::from(self.read(register)?) << 8 | u16::from(self.read(register + 1)?))
    }

    fn select(&self, ldn: u8) -> Result<()> {
        self.write(DEVICE_SELECT_REGISTER, ldn)
    }

    fn winbond_enter(&self) -> Result<()> {
        self.isa.write(self.index, 0x87)?;
        self.isa.write(self.index, 0x87)
    }

    fn winbond_exit(&self) -> Result<()> {
        self.isa.write(self.index, 0xAA)
    }

    fn ite_enter(&self) -> Result<()> {
        self.isa.write(self.index, 0x87)?;
        self.isa.write(self.index, 0x01)?;
        self.isa.write(self.index, 0x55)?;
        self.isa
            .write(self.index, if self.index == 0x4E { 0xAA } else { 0x55 })
    }

    fn ite_exit(&self) -> Result<()> {
        // 0x4E is shared with a second controller on some boards
        if self.index != 0x4E {
            self.write(CONFIGURATION_CONTROL_REGISTER, 0x02)?;
        }
        Ok(())
    }
}

/// Map a Winbond/Nuvoton/Fintek id and revision to a chip and its
/// hardware monitor logical device
fn identify(id: u8, revision: u8) -> Option<(Chip, u8)> {
    use Chip::*;
    let chip = match (id, revision) {
        (0x05, 0x07) => F71858,
        (0x05, 0x41) => F71882,
        (0x06, 0x01) => F71862,
        (0x07, 0x23) => F71889F,
        (0x08, 0x14) => F71869,
        (0x09, 0x01) => F71808E,
        (0x09, 0x09) => F71889ED,
        (0x10, 0x05) => F71889AD,
        (0x10, 0x07) => F71869A,
        (0x11, 0x06) => F71878AD,
        (0x52, 0x17 | 0x3A | 0x41) => W83627HF,
        (0x82, r) if r & 0xF0 == 0x80 => W83627THF,
        (0x85, 0x41) => W83687THF,
        (0x88, r) if matches!(r & 0xF0, 0x50 | 0x60) => W83627EHF,
        (0xA0, r) if r & 0xF0 == 0x20 => W83627DHG,
        (0xA5, r) if r & 0xF0 == 0x10 => W83667HG,
        (0xB0, r) if r & 0xF0 == 0x70 => W83627DHGP,
        (0xB3, r) if r & 0xF0 == 0x50 => W83667HGB,
        (0xB4, r) if r & 0xF0 == 0x70 => NCT6771F,
        (0xC3, r) if r & 0xF0 == 0x30 => NCT6776F,
        (0xC5, r) if r & 0xF0 == 0x60 => NCT6779D,
        (0xC8, 0x03) => NCT6791D,
        (0xC9, 0x11) => NCT6792D,
        (0xD1, 0x21) => NCT6793D,
        (0xD3, 0x52) => NCT6795D,
        (0xD4, 0x23) => NCT6796D,
        (0xD4, 0x51) => NCT6797D,
        (0xD4, 0x2B) => NCT6798D,
        _ => return None,
    };
    let ldn = match chip {
        F71858 => F71858_HARDWARE_MONITOR_LDN,
        c if c.is_fintek() => FINTEK_HARDWARE_MONITOR_LDN,
        _ => WINBOND_NUVOTON_HARDWARE_MONITOR_LDN,
    };
    Some((chip, ldn))
}

/// Strip the index offset some BIOSes leave in the base and reject
/// addresses outside the decodable window
fn normalize_address(address: u16) -> Option<u16> {
    let address = if address & 0x07 == 0x05 { address & 0xFFF8 } else { address };
    (address >= 0x100 && address & 0xF007 == 0).then_some(address)
}

fn detect_winbond_fintek(port: &ConfigPort<'_, '_>, report: &mut String) -> Result<Option<Detected>> {
    port.winbond_enter()?;
    let result = read_winbond_fintek(port, report);
    // leave configuration mode even when a register access failed
    let exited = port.winbond_exit();
    let detected = result?;
    exited?;
    Ok(detected)
}

fn read_winbond_fintek(port: &ConfigPort<'_, '_>, report: &mut String) -> Result<Option<Detected>> {
    let id = port.read(CHIP_ID_REGISTER)?;
    let revision = port.read(CHIP_REVISION_REGISTER)?;
    let Some((chip, ldn)) = identify(id, revision) else {
        if id != 0x00 && id != 0xFF {
            let _ = writeln!(
                report,
                "Port {:#04x}: unknown Winbond/Nuvoton/Fintek chip id {:#04x} revision {:#04x}",
                port.index, id, revision
            );
        }
        return Ok(None);
    };

    port.select(ldn)?;
    let address = port.read_word(BASE_ADDRESS_REGISTER)?;
    let verify = port.read_word(BASE_ADDRESS_REGISTER)?;
    let vendor = port.read_word(FINTEK_VENDOR_ID_REGISTER)?;

    if chip.is_nuvoton() && chip != Chip::NCT6771F && chip != Chip::NCT6776F {
        // NCT679x boot with the hardware monitor I/O space locked
        let options = port.read(NUVOTON_HARDWARE_MONITOR_IO_SPACE_LOCK)?;
        if options & 0x10 != 0 {
            port.write(NUVOTON_HARDWARE_MONITOR_IO_SPACE_LOCK, options & !0x10)?;
        }
    }

    if address != verify {
        let _ = writeln!(
            report,
            "Port {:#04x}: {} base address unstable ({:#06x} vs {:#06x})",
            port.index, chip, address, verify
        );
        return Ok(None);
    }
    let Some(address) = normalize_address(address) else {
        let _ = writeln!(
            report,
            "Port {:#04x}: {} invalid base address {:#06x}",
            port.index, chip, address
        );
        return Ok(None);
    };
    if chip.is_fintek() && vendor != FINTEK_VENDOR_ID {
        let _ = writeln!(
            report,
            "Port {:#04x}: {} invalid vendor id {:#06x}",
            port.index, chip, vendor
        );
        return Ok(None);
    }

    Ok(Some(Detected {
        chip,
        port: port.index,
        revision,
        address,
    }))
}

fn detect_ite(port: &ConfigPort<'_, '_>, report: &mut String) -> Result<Option<Detected>> {
    port.ite_enter()?;
    let result = read_ite(port, report);
    let exited = port.ite_exit();
    let detected = result?;
    exited?;
    Ok(detected)
}

fn read_ite(port: &ConfigPort<'_, '_>, report: &mut String) -> Result<Option<Detected>> {
    let id = port.read_word(CHIP_ID_REGISTER)?;
    let chip = Chip::from_ite_id(id);
    if chip == Chip::Unknown {
        if id != 0x0000 && id != 0xFFFF {
            let _ = writeln!(report, "Port {:#04x}: unknown ITE chip id {:#06x}", port.index, id);
        }
        return Ok(None);
    }

    port.select(IT87_ENVIRONMENT_CONTROLLER_LDN)?;
    let address = port.read_word(BASE_ADDRESS_REGISTER)?;
    let verify = port.read_word(BASE_ADDRESS_REGISTER)?;
    let version = port.read(ITE_VERSION_REGISTER)? & 0x0F;

    if address != verify {
        let _ = writeln!(
            report,
            "Port {:#04x}: {} base address unstable ({:#06x} vs {:#06x})",
            port.index, chip, address, verify
        );
        return Ok(None);
    }
    let Some(address) = normalize_address(address) else {
        let _ = writeln!(
            report,
            "Port {:#04x}: {} invalid base address {:#06x}",
            port.index, chip, address
        );
        return Ok(None);
    };

    Ok(Some(Detected {
        chip,
        port: port.index,
        revision: version,
        address,
    }))
}

/// Run the configuration-port probes without opening decoders
pub fn detect(bus: &Bus, report: &mut String) -> Result<Vec<Detected>> {
    let mut found = Vec::new();
    for index in REGISTER_PORTS {
        let isa = bus.lock_isa()?;
        let port = ConfigPort { isa: &isa, index };
        if let Some(d) = detect_winbond_fintek(&port, report)? {
            found.push(d);
            continue;
        }
        if let Some(d) = detect_ite(&port, report)? {
            found.push(d);
        }
    }
    Ok(found)
}

fn open(bus: &Bus, d: Detected) -> Result<Option<Box<dyn SuperIoChip>>> {
    let chip: Option<Box<dyn SuperIoChip>> = if d.chip.is_ite() {
        It87xx::open(bus.clone(), d.chip, d.address, d.revision)?.map(|c| Box::new(c) as _)
    } else if d.chip.is_nuvoton() {
        Nct67xx::open(bus.clone(), d.chip, d.revision, d.address)?.map(|c| Box::new(c) as _)
    } else if d.chip.is_winbond() {
        W836xx::open(bus.clone(), d.chip, d.revision, d.address)?.map(|c| Box::new(c) as _)
    } else if d.chip.is_fintek() {
        Some(Box::new(F718xx::new(bus.clone(), d.chip, d.address)))
    } else {
        None
    };
    Ok(chip)
}

/// Probe both configuration ports and open a decoder for every chip
/// whose hardware monitor answers
pub fn probe(bus: &Bus) -> Result<Probe> {
    let mut report = String::new();
    let _ = writeln!(report, "LPC probe");
    let detected = detect(bus, &mut report)?;

    let mut chips = Vec::new();
    for d in detected {
        let _ = writeln!(
            report,
            "Port {:#04x}: {} revision {:#04x} at {:#06x}",
            d.port, d.chip, d.revision, d.address
        );
        match open(bus, d) {
            Ok(Some(chip)) => {
                info!("found {} at {:#06x}", d.chip, d.address);
                chips.push(chip);
            }
            Ok(None) => {
                let _ = writeln!(report, "  hardware monitor did not answer");
                debug!("{} at {:#06x} rejected", d.chip, d.address);
            }
            Err(e) => {
                let _ = writeln!(report, "  open failed: {}", e);
                warn!("failed to open {}: {}", d.chip, e);
            }
        }
    }
    Ok(Probe { chips, report })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::{ChipRegisters, ConfigFlavor, SuperIoConfig};
    use crate::bus::SimulatedBus;
    use std::time::Duration;

    fn bus(sim: &SimulatedBus) -> Bus {
        Bus::new(sim.clone(), Duration::from_millis(10))
    }

    #[test]
    fn test_identify() {
        assert_eq!(identify(0xD4, 0x2B), Some((Chip::NCT6798D, 0x0B)));
        assert_eq!(identify(0xA0, 0x23), Some((Chip::W83627DHG, 0x0B)));
        assert_eq!(identify(0x05, 0x07), Some((Chip::F71858, 0x02)));
        assert_eq!(identify(0x07, 0x23), Some((Chip::F71889F, 0x04)));
        assert_eq!(identify(0xD4, 0x99), None);
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address(0x295), Some(0x290));
        assert_eq!(normalize_address(0xA40), Some(0xA40));
        assert_eq!(normalize_address(0x0080), None);
        assert_eq!(normalize_address(0x1291), None);
    }

    #[test]
    fn test_nuvoton_probe_exits_config_mode() {
        let sim = SimulatedBus::new();
        let cfg = SuperIoConfig::new(0x2E, ConfigFlavor::Winbond)
            .with_chip_id(0xD4, 0x2B)
            .with_base_address(0x0B, 0x295);
        cfg.set_global(NUVOTON_HARDWARE_MONITOR_IO_SPACE_LOCK, 0x10);
        sim.add_port_device(cfg.clone());
        let regs = ChipRegisters::banked(0x290, 0x4E);
        regs.set(0x804F, 0x5C);
        regs.set(0x004F, 0xA3);
        sim.add_port_device(regs);

        let probe = probe(&bus(&sim)).unwrap();
        assert_eq!(probe.chips.len(), 1);
        assert_eq!(probe.chips[0].chip(), Chip::NCT6798D);
        assert_eq!(probe.chips[0].address(), 0x290);
        assert!(!cfg.is_entered());
        assert_eq!(cfg.entries(), cfg.exits());
        assert!(probe.report.contains("Nuvoton NCT6798D"));
    }

    #[test]
    fn test_nuvoton_io_space_unlocked() {
        let sim = SimulatedBus::new();
        let cfg = SuperIoConfig::new(0x2E, ConfigFlavor::Winbond)
            .with_chip_id(0xD4, 0x2B)
            .with_base_address(0x0B, 0x290);
        cfg.set_global(NUVOTON_HARDWARE_MONITOR_IO_SPACE_LOCK, 0x13);
        sim.add_port_device(cfg.clone());

        let mut report = String::new();
        let found = detect(&bus(&sim), &mut report).unwrap();
        assert_eq!(found.len(), 1);
        // re-enter to inspect the global register
        let b = bus(&sim);
        let isa = b.lock_isa().unwrap();
        let port = ConfigPort { isa: &isa, index: 0x2E };
        port.winbond_enter().unwrap();
        assert_eq!(port.read(NUVOTON_HARDWARE_MONITOR_IO_SPACE_LOCK).unwrap(), 0x03);
        port.winbond_exit().unwrap();
    }

    #[test]
    fn test_ite_probe() {
        let sim = SimulatedBus::new();
        let cfg = SuperIoConfig::new(0x2E, ConfigFlavor::Ite)
            .with_chip_id(0x86, 0x86)
            .with_base_address(0x04, 0xA40);
        cfg.set_global(ITE_VERSION_REGISTER, 0x12);
        sim.add_port_device(cfg.clone());
        let regs = ChipRegisters::new(0xA40);
        regs.set(0x58, 0x90);
        regs.set(0x00, 0x10);
        sim.add_port_device(regs);

        let probe = probe(&bus(&sim)).unwrap();
        assert_eq!(probe.chips.len(), 1);
        assert_eq!(probe.chips[0].chip(), Chip::IT8686E);
        assert!(!cfg.is_entered());
        assert_eq!(cfg.exits(), 1);
    }

    #[test]
    fn test_invalid_fintek_vendor_reported() {
        let sim = SimulatedBus::new();
        let cfg = SuperIoConfig::new(0x4E, ConfigFlavor::Winbond)
            .with_chip_id(0x07, 0x23)
            .with_base_address(0x04, 0x290);
        sim.add_port_device(cfg.clone());

        let probe = probe(&bus(&sim)).unwrap();
        assert!(probe.chips.is_empty());
        assert!(probe.report.contains("invalid vendor id"));
        assert!(!cfg.is_entered());
    }

    #[test]
    fn test_unknown_chip_reported() {
        let sim = SimulatedBus::new();
        let cfg = SuperIoConfig::new(0x2E, ConfigFlavor::Winbond).with_chip_id(0x42, 0x01);
        sim.add_port_device(cfg.clone());

        let probe = probe(&bus(&sim)).unwrap();
        assert!(probe.chips.is_empty());
        assert!(probe.report.contains("unknown Winbond/Nuvoton/Fintek chip id 0x42"));
        assert!(!cfg.is_entered());
    }
}
