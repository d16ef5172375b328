//! Mainboard hardware
//!
//! The mainboard node carries no sensors of its own. It is named from the
//! SMBIOS base board strings and parents one [`SuperIoHardware`] per
//! environment controller found by the LPC probe.

use crate::bus::Bus;
use crate::computer::Group;
use crate::hardware::{Hardware, HardwareBase, HardwareType};
use crate::identifier::Identifier;
use crate::smbios::{FirmwareTables, Smbios};
use crate::superio::hardware::SuperIoHardware;
use crate::superio::{lpc, SuperIoChip};
use log::{debug, info};
use std::collections::HashMap;

pub struct Motherboard {
    base: HardwareBase,
    smbios: Smbios,
    probe_report: String,
    superio: Vec<SuperIoHardware>,
}

impl Motherboard {
    pub fn new(
        smbios: Smbios,
        chips: Vec<Box<dyn SuperIoChip>>,
        probe_report: String,
        window: chrono::Duration,
    ) -> Self {
        let name = smbios.board_name().unwrap_or_else(|| "Unknown Mainboard".to_string());
        let base = HardwareBase::new(name, Identifier::new(["motherboard"]), HardwareType::Motherboard)
            .with_window(window);

        // chips of the same model are numbered in probe order
        let mut seen: HashMap<_, usize> = HashMap::new();
        let superio = chips
            .into_iter()
            .map(|chip| {
                let index = seen.entry(chip.chip()).or_default();
                let hw = SuperIoHardware::new(chip, *index, window);
                *index += 1;
                hw
            })
            .collect();

        Self {
            base,
            smbios,
            probe_report,
            superio,
        }
    }

    pub fn smbios(&self) -> &Smbios {
        &self.smbios
    }
}

impl Hardware for Motherboard {
    fn base(&self) -> &HardwareBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HardwareBase {
        &mut self.base
    }

    fn update(&mut self) {}

    fn sub_hardware(&self) -> Vec<&dyn Hardware> {
        self.superio.iter().map(|s| s as &dyn Hardware).collect()
    }

    fn sub_hardware_mut(&mut self) -> Vec<&mut dyn Hardware> {
        self.superio
            .iter_mut()
            .map(|s| s as &mut dyn Hardware)
            .collect()
    }

    fn report(&self) -> String {
        let mut r = String::new();
        r.push_str(&self.smbios.report());
        r.push('\n');
        r.push_str(&self.probe_report);
        r.push('\n');
        for sub in &self.superio {
            r.push_str(&sub.report());
            r.push('\n');
        }
        r
    }
}

/// The mainboard and its Super-I/O chips
pub struct MainboardGroup {
    boards: Vec<Motherboard>,
}

impl MainboardGroup {
    /// Read SMBIOS and probe the LPC bus; failures leave a sensorless board
    pub fn open(bus: &Bus, tables: &dyn FirmwareTables, window: chrono::Duration) -> Self {
        let smbios = Smbios::read(tables).unwrap_or_else(|e| {
            debug!("SMBIOS unavailable: {}", e);
            Smbios::default()
        });

        let (chips, report) = match lpc::probe(bus) {
            Ok(probe) => (probe.chips, probe.report),
            Err(e) => {
                debug!("LPC probe skipped: {}", e);
                (Vec::new(), format!("LPC probe failed: {}\n", e))
            }
        };

        let board = Motherboard::new(smbios, chips, report, window);
        info!(
            "Found mainboard {} with {} Super-I/O chip(s)",
            board.name(),
            board.superio.len()
        );
        Self { boards: vec![board] }
    }
}

impl Group for MainboardGroup {
    fn hardware(&self) -> Vec<&dyn Hardware> {
        self.boards.iter().map(|b| b as &dyn Hardware).collect()
    }

    fn hardware_mut(&mut self) -> Vec<&mut dyn Hardware> {
        self.boards
            .iter_mut()
            .map(|b| b as &mut dyn Hardware)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::{ChipRegisters, ConfigFlavor, SuperIoConfig};
    use crate::bus::SimulatedBus;
    use crate::smbios::RawTables;
    use std::time::Duration;

    #[test]
    fn test_group_with_ite_chip() {
        let sim = SimulatedBus::new();
        sim.add_port_device(
            SuperIoConfig::new(0x2E, ConfigFlavor::Ite)
                .with_chip_id(0x87, 0x21)
                .with_base_address(0x04, 0x290),
        );
        let regs = ChipRegisters::new(0x290);
        regs.set(0x58, 0x90);
        regs.set(0x00, 0x10);
        regs.set(0x20, 0x64);
        sim.add_port_device(regs);
        let bus = Bus::new(sim, Duration::from_millis(10));

        let mut group = MainboardGroup::open(&bus, &RawTables::default(), chrono::Duration::hours(1));
        let boards = group.hardware();
        assert_eq!(boards.len(), 1);
        assert_eq!(boards[0].name(), "Unknown Mainboard");
        assert_eq!(boards[0].identifier().as_str(), "/motherboard");
        let subs = boards[0].sub_hardware();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].identifier().as_str(), "/lpc/it8721f/0");
        assert_eq!(subs[0].hardware_type(), HardwareType::SuperIo);

        let mut boards = group.hardware_mut();
        crate::hardware::update_tree(&mut *boards[0]);
        let report = boards[0].report();
        assert!(report.contains("LPC probe"));
        assert!(report.contains("ITE IT8721F"));
    }

    #[test]
    fn test_unsupported_bus_gives_empty_board() {
        let bus = Bus::new(crate::bus::UnsupportedBus, Duration::from_millis(10));
        let group = MainboardGroup::open(&bus, &RawTables::default(), chrono::Duration::hours(1));
        let boards = group.hardware();
        assert!(boards[0].sub_hardware().is_empty());
        assert!(boards[0].report().contains("LPC probe failed"));
    }
}
