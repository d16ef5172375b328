//! AMD processors
//!
//! - Family 0Fh: thermtrip register in the miscellaneous-control PCI function
//! - Families 10h–16h: reported temperature control register, COFVID clocks
//! - Families 17h/19h/1Ah (Zen): SMN thermal registers, RAPL, P-state status

use super::{EnergyCounter, GenericCpu};
use crate::bus::{PciAddress, PciBus};
use crate::hardware::{Hardware, HardwareBase};
use crate::parameter::ParameterDescription;
use crate::sensor::SensorType;
use log::{debug, trace};
use std::fmt::Write as _;
use std::time::Instant;

const AMD_VENDOR_ID: u16 = 0x1022;

const FAMILY_0F_MISC_CONTROL_DEVICE_ID: u16 = 0x1103;
const THERMTRIP_STATUS_REGISTER: u16 = 0xE4;
const FIDVID_STATUS: u32 = 0xC001_0042;

const REPORTED_TEMPERATURE_CONTROL_REGISTER: u16 = 0xA4;
const COFVID_STATUS: u32 = 0xC001_0071;
const P_STATE_0: u32 = 0xC001_0064;

const THM_TCON_CUR_TMP: u32 = 0x0005_9800;
const F17H_CCD_TEMP: u32 = 0x0005_9954;
const F19H_M10H_CCD_TEMP: u32 = 0x0005_9B08;
const MAX_CCDS: usize = 8;
const MSR_PWR_UNIT: u32 = 0xC001_0299;
const MSR_CORE_ENERGY_STAT: u32 = 0xC001_029A;
const MSR_PKG_ENERGY_STAT: u32 = 0xC001_029B;
const MSR_HARDWARE_PSTATE_STATUS: u32 = 0xC001_0293;

const OFFSET_PARAMETER: &str = "Offset [°C]";
const OFFSET_DESCRIPTION: &str = "Temperature offset of the thermal sensor.";

/// Miscellaneous-control function (device 0x18 + package, function 3) if
/// it carries the expected AMD device id
fn misc_control_address(cpu: &GenericCpu, device_id: u16) -> Option<PciAddress> {
    let address = PciAddress::new(0, 0x18 + cpu.index as u8, 3);
    let pci = match cpu.bus().lock_pci() {
        Ok(pci) => pci,
        Err(e) => {
            debug!("PCI bus unavailable for {}: {}", address, e);
            return None;
        }
    };
    let id = pci.read_config(address, 0).ok()?;
    let expected = (device_id as u32) << 16 | AMD_VENDOR_ID as u32;
    if id != expected {
        debug!(
            "Unexpected miscellaneous-control id {:#010x} at {}, wanted {:#010x}",
            id, address, expected
        );
        return None;
    }
    Some(address)
}

fn family_0f_offset(model: u32) -> f32 {
    // revision G reports 21 °C higher
    if model >= 0x69 && !matches!(model, 0xC1 | 0x6C | 0x7C) {
        -49.0 + 21.0
    } else {
        -49.0
    }
}

fn family_0f_temperature(thermtrip: u32, offset: f32) -> f32 {
    ((thermtrip >> 16) & 0xFF) as f32 + offset
}

/// AMD family 0Fh (K8)
pub struct Amd0fCpu {
    cpu: GenericCpu,
    misc_control: Option<PciAddress>,
    core_select: [u32; 2],
    core_temperatures: Vec<usize>,
    bus_clock: usize,
    core_clocks: Vec<usize>,
}

impl Amd0fCpu {
    pub fn new(mut cpu: GenericCpu) -> Self {
        let model = cpu.model();
        let misc_control = misc_control_address(&cpu, FAMILY_0F_MISC_CONTROL_DEVICE_ID);
        let core_select = if model < 40 { [0x0, 0x4] } else { [0x4, 0x0] };

        let mut core_temperatures = Vec::new();
        if misc_control.is_some() {
            let offset = [ParameterDescription::new(
                OFFSET_PARAMETER,
                OFFSET_DESCRIPTION,
                family_0f_offset(model),
            )];
            for core in 0..cpu.core_count().min(2) {
                let sensor = cpu
                    .base
                    .sensor(format!("Core #{}", core + 1), core, SensorType::Temperature)
                    .with_parameters(&offset);
                core_temperatures.push(cpu.base.push_sensor(sensor));
            }
        }

        let bus_clock = cpu.base.add_sensor("Bus Speed", 0, SensorType::Clock);
        let core_clocks = (0..cpu.core_count())
            .map(|i| cpu.base.add_sensor(format!("Core #{}", i + 1), i + 1, SensorType::Clock))
            .collect();

        Self {
            cpu,
            misc_control,
            core_select,
            core_temperatures,
            bus_clock,
            core_clocks,
        }
    }

    fn update_temperatures(&mut self) {
        let Some(address) = self.misc_control else {
            return;
        };
        let pci = match self.cpu.env.bus.lock_pci() {
            Ok(pci) => pci,
            Err(e) => {
                trace!("Skipping thermtrip read: {}", e);
                for &slot in &self.core_temperatures {
                    self.cpu.base.record(slot, None);
                }
                return;
            }
        };
        for (core, &slot) in self.core_temperatures.iter().enumerate() {
            let select = self.core_select[core.min(1)];
            let raw = pci
                .write_config(address, THERMTRIP_STATUS_REGISTER, select)
                .and_then(|_| pci.read_config(address, THERMTRIP_STATUS_REGISTER));
            let value = match raw {
                Ok(raw) => {
                    let offset = self.cpu.base.get(slot).map_or(-49.0, |s| s.parameter(0, -49.0));
                    Some(family_0f_temperature(raw, offset))
                }
                Err(e) => {
                    trace!("Thermtrip read failed: {}", e);
                    None
                }
            };
            self.cpu.base.publish(slot, value);
        }
    }

    fn update_clocks(&mut self) {
        let mut bus_clock = None;
        for core in 0..self.core_clocks.len() {
            let thread = self.cpu.first_thread(core);
            let value = match (self.cpu.env.bus.read_msr(thread, FIDVID_STATUS), self.cpu.tsc_frequency) {
                (Ok(status), Some(tsc)) => {
                    let eax = status as u32;
                    let current = 0.5 * ((eax & 0x3F) + 8) as f64;
                    let max = 0.5 * (((eax >> 16) & 0x3F) + 8) as f64;
                    bus_clock = Some(tsc / max);
                    Some((current * tsc / max) as f32)
                }
                _ => None,
            };
            self.cpu.base.publish(self.core_clocks[core], value);
        }
        self.cpu.base.publish(self.bus_clock, bus_clock.map(|c| c as f32));
    }
}

impl Hardware for Amd0fCpu {
    fn base(&self) -> &HardwareBase {
        &self.cpu.base
    }

    fn base_mut(&mut self) -> &mut HardwareBase {
        &mut self.cpu.base
    }

    fn update(&mut self) {
        self.cpu.update_load();
        self.update_temperatures();
        self.update_clocks();
    }

    fn report(&self) -> String {
        let mut r = self.cpu.report();
        if let Some(address) = self.misc_control {
            let _ = writeln!(r, "Miscellaneous control: {}", address);
        }
        r.push_str(&self.cpu.msr_report(&[FIDVID_STATUS]));
        r
    }
}

fn family_10_device_id(family: u32, model: u32) -> Option<u16> {
    match family {
        0x10 => Some(0x1203),
        0x11 => Some(0x1303),
        0x12 | 0x14 => Some(0x1703),
        0x15 => match model & 0xF0 {
            0x00 => Some(0x1603),
            0x10 => Some(0x1403),
            0x30 => Some(0x141D),
            0x60 => Some(0x1573),
            0x70 => Some(0x15B3),
            _ => None,
        },
        0x16 => match model & 0xF0 {
            0x00 => Some(0x1533),
            0x30 => Some(0x1583),
            _ => None,
        },
        _ => None,
    }
}

fn family_10_temperature(family: u32, value: u32) -> f32 {
    let mut t = ((value >> 21) & 0x7FF) as f32 / 8.0;
    // CurTmpTjSel: range shifted by 49 °C
    if family == 0x15 && value & 0x30000 == 0x30000 {
        t -= 49.0;
    }
    t
}

/// Core multiplier from a COFVID or P-state register
fn family_10_multiplier(family: u32, value: u64) -> Option<f64> {
    let eax = value as u32;
    let fid = (eax & 0x3F) as f64;
    let did = (eax >> 6) & 0x7;
    match family {
        0x10 | 0x15 | 0x16 => Some(0.5 * (fid + 16.0) / (1u32 << did) as f64),
        0x11 => Some((fid + 8.0) / (1u32 << did) as f64),
        _ => None,
    }
}

/// AMD families 10h through 16h
pub struct Amd10Cpu {
    cpu: GenericCpu,
    misc_control: Option<PciAddress>,
    temperature: Option<usize>,
    tsc_multiplier: Option<f64>,
    bus_clock: usize,
    core_clocks: Vec<usize>,
}

impl Amd10Cpu {
    pub fn new(mut cpu: GenericCpu) -> Self {
        let family = cpu.family();
        let misc_control = family_10_device_id(family, cpu.model())
            .and_then(|id| misc_control_address(&cpu, id));

        let temperature = misc_control.map(|_| {
            let sensor = cpu
                .base
                .sensor("CPU Cores", 0, SensorType::Temperature)
                .with_parameters(&[ParameterDescription::new(OFFSET_PARAMETER, OFFSET_DESCRIPTION, 0.0)]);
            cpu.base.push_sensor(sensor)
        });

        let tsc_multiplier = cpu
            .bus()
            .read_msr(cpu.first_thread(0), P_STATE_0)
            .ok()
            .and_then(|v| family_10_multiplier(family, v))
            .filter(|m| *m > 0.0);

        let bus_clock = cpu.base.add_sensor("Bus Speed", 0, SensorType::Clock);
        let core_clocks = (0..cpu.core_count())
            .map(|i| cpu.base.add_sensor(format!("Core #{}", i + 1), i + 1, SensorType::Clock))
            .collect();

        Self {
            cpu,
            misc_control,
            temperature,
            tsc_multiplier,
            bus_clock,
            core_clocks,
        }
    }

    fn update_temperature(&mut self) {
        let (Some(address), Some(slot)) = (self.misc_control, self.temperature) else {
            return;
        };
        let raw = self
            .cpu
            .env
            .bus
            .lock_pci()
            .and_then(|pci| pci.read_config(address, REPORTED_TEMPERATURE_CONTROL_REGISTER));
        let value = match raw {
            Ok(raw) => {
                let offset = self.cpu.base.get(slot).map_or(0.0, |s| s.parameter(0, 0.0));
                Some(family_10_temperature(self.cpu.family(), raw) + offset)
            }
            Err(e) => {
                trace!("Reported temperature unavailable: {}", e);
                None
            }
        };
        self.cpu.base.publish(slot, value);
    }

    fn update_clocks(&mut self) {
        let family = self.cpu.family();
        let bus_clock = match (self.cpu.tsc_frequency, self.tsc_multiplier) {
            (Some(tsc), Some(multiplier)) => Some(tsc / multiplier),
            _ => None,
        };
        self.cpu.base.publish(self.bus_clock, bus_clock.map(|c| c as f32));
        for core in 0..self.core_clocks.len() {
            let thread = self.cpu.first_thread(core);
            let value = bus_clock.and_then(|bus| {
                let status = self.cpu.env.bus.read_msr(thread, COFVID_STATUS).ok()?;
                Some((family_10_multiplier(family, status)? * bus) as f32)
            });
            self.cpu.base.publish(self.core_clocks[core], value);
        }
    }
}

impl Hardware for Amd10Cpu {
    fn base(&self) -> &HardwareBase {
        &self.cpu.base
    }

    fn base_mut(&mut self) -> &mut HardwareBase {
        &mut self.cpu.base
    }

    fn update(&mut self) {
        self.cpu.update_load();
        self.update_temperature();
        self.update_clocks();
    }

    fn report(&self) -> String {
        let mut r = self.cpu.report();
        if let Some(address) = self.misc_control {
            let _ = writeln!(r, "Miscellaneous control: {}", address);
        }
        r.push_str(&self.cpu.msr_report(&[P_STATE_0, COFVID_STATUS]));
        r
    }
}

/// Tctl runs ahead of the die temperature on some early parts
fn tctl_offset(name: &str) -> f32 {
    const OFFSETS: &[(&str, f32)] = &[
        ("AMD Ryzen 5 1600X", 20.0),
        ("AMD Ryzen 7 1700X", 20.0),
        ("AMD Ryzen 7 1800X", 20.0),
        ("AMD Ryzen Threadripper 19", 27.0),
        ("AMD Ryzen Threadripper 29", 27.0),
        ("AMD Ryzen 7 2700X", 10.0),
    ];
    OFFSETS
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))
        .map_or(0.0, |(_, offset)| *offset)
}

fn zen_tctl(raw: u32) -> f32 {
    let mut t = ((raw >> 21) & 0x7FF) as f32 * 0.125;
    if raw & 0x80000 != 0 {
        t -= 49.0;
    }
    t
}

fn zen_ccd_temperature(raw: u32) -> Option<f32> {
    (raw & 0x800 != 0).then(|| (raw & 0x7FF) as f32 / 8.0 - 49.0)
}

/// Core clock in MHz and VID voltage from the hardware P-state status
fn zen_pstate(status: u64) -> (Option<f32>, f32) {
    let eax = status as u32;
    let fid = (eax & 0xFF) as f32;
    let dfs = ((eax >> 8) & 0x3F) as f32;
    let vid = ((eax >> 14) & 0xFF) as f32;
    let clock = (dfs > 0.0).then(|| 200.0 * fid / dfs);
    (clock, 1.55 - 0.00625 * vid)
}

/// AMD Zen families 17h, 19h and 1Ah
pub struct Amd17Cpu {
    cpu: GenericCpu,
    offset: f32,
    ccd_base: u32,
    tctl: usize,
    tdie: Option<usize>,
    ccds: Vec<usize>,
    energy_unit: Option<f32>,
    package_power: Option<(usize, EnergyCounter)>,
    core_powers: Vec<(usize, EnergyCounter)>,
    core_clocks: Vec<usize>,
    core_voltages: Vec<usize>,
}

impl Amd17Cpu {
    pub fn new(mut cpu: GenericCpu) -> Self {
        let offset = tctl_offset(cpu.base.default_name());
        let (family, model) = (cpu.family(), cpu.model());
        let ccd_base = if family == 0x1A || (family == 0x19 && model >= 0x10) {
            F19H_M10H_CCD_TEMP
        } else {
            F17H_CCD_TEMP
        };

        let (tctl, tdie) = if offset != 0.0 {
            (
                cpu.base.add_sensor("Core (Tctl)", 0, SensorType::Temperature),
                Some(cpu.base.add_sensor("Core (Tdie)", 1, SensorType::Temperature)),
            )
        } else {
            (cpu.base.add_sensor("Core (Tctl/Tdie)", 0, SensorType::Temperature), None)
        };
        let ccds = (0..MAX_CCDS)
            .map(|i| cpu.base.add_sensor(format!("CCD{} (Tdie)", i + 1), i + 2, SensorType::Temperature))
            .collect();

        let thread = cpu.first_thread(0);
        let energy_unit = cpu
            .bus()
            .read_msr(thread, MSR_PWR_UNIT)
            .ok()
            .map(|v| 1.0 / (1u64 << ((v as u32 >> 8) & 0x1F)) as f32);
        let package_power = energy_unit.map(|_| {
            (
                cpu.base.add_sensor("Package", 0, SensorType::Power),
                EnergyCounter::new(),
            )
        });
        let core_powers = match energy_unit {
            Some(_) => (0..cpu.core_count())
                .map(|i| {
                    (
                        cpu.base.add_sensor(format!("Core #{} (SMU)", i + 1), i + 1, SensorType::Power),
                        EnergyCounter::new(),
                    )
                })
                .collect(),
            None => Vec::new(),
        };

        let core_clocks = (0..cpu.core_count())
            .map(|i| cpu.base.add_sensor(format!("Core #{}", i + 1), i + 1, SensorType::Clock))
            .collect();
        let core_voltages = (0..cpu.core_count())
            .map(|i| cpu.base.add_sensor(format!("Core #{} VID", i + 1), i + 1, SensorType::Voltage))
            .collect();

        debug!(
            "{}: family {:#x} model {:#x}, Tctl offset {}",
            cpu.base.name(),
            family,
            model,
            offset
        );

        Self {
            cpu,
            offset,
            ccd_base,
            tctl,
            tdie,
            ccds,
            energy_unit,
            package_power,
            core_powers,
            core_clocks,
            core_voltages,
        }
    }

    fn read_thermal(&self, pci: &PciBus<'_>) -> (Option<f32>, Vec<Option<f32>>) {
        let tctl = match pci.read_smn(THM_TCON_CUR_TMP) {
            Ok(raw) => Some(zen_tctl(raw)),
            Err(e) => {
                trace!("THM_TCON_CUR_TMP unreadable: {}", e);
                None
            }
        };
        let ccds = (0..self.ccds.len())
            .map(|i| {
                pci.read_smn(self.ccd_base + 4 * i as u32)
                    .ok()
                    .and_then(zen_ccd_temperature)
            })
            .collect();
        (tctl, ccds)
    }

    fn update_temperatures(&mut self) {
        let (tctl, ccds) = match self.cpu.env.bus.lock_pci() {
            Ok(pci) => self.read_thermal(&pci),
            Err(e) => {
                trace!("Skipping SMN reads: {}", e);
                (None, vec![None; self.ccds.len()])
            }
        };
        self.cpu.base.publish(self.tctl, tctl);
        if let Some(slot) = self.tdie {
            self.cpu.base.publish(slot, tctl.map(|t| t - self.offset));
        }
        for (i, value) in ccds.into_iter().enumerate() {
            self.cpu.base.publish(self.ccds[i], value);
        }
    }

    fn update_power(&mut self) {
        let Some(unit) = self.energy_unit else {
            return;
        };
        let now = Instant::now();
        let package_thread = self.cpu.first_thread(0);
        let bus = &self.cpu.env.bus;
        if let Some((slot, counter)) = self.package_power.as_mut() {
            let value = bus
                .read_msr(package_thread, MSR_PKG_ENERGY_STAT)
                .ok()
                .and_then(|raw| counter.sample(raw as u32, now, unit));
            self.cpu.base.publish(*slot, value);
        }
        for (core, (slot, counter)) in self.core_powers.iter_mut().enumerate() {
            let thread = self.cpu.cores.get(core).and_then(|c| c.first()).map_or(0, |t| t.thread);
            let value = bus
                .read_msr(thread, MSR_CORE_ENERGY_STAT)
                .ok()
                .and_then(|raw| counter.sample(raw as u32, now, unit));
            self.cpu.base.publish(*slot, value);
        }
    }

    fn update_clocks(&mut self) {
        for core in 0..self.core_clocks.len() {
            let thread = self.cpu.first_thread(core);
            let (clock, vid) = match self.cpu.env.bus.read_msr(thread, MSR_HARDWARE_PSTATE_STATUS) {
                Ok(status) => {
                    let (clock, vid) = zen_pstate(status);
                    (clock, Some(vid))
                }
                Err(e) => {
                    trace!("P-state status unreadable on cpu {}: {}", thread, e);
                    (None, None)
                }
            };
            self.cpu.base.publish(self.core_clocks[core], clock);
            self.cpu.base.publish(self.core_voltages[core], vid);
        }
    }
}

impl Hardware for Amd17Cpu {
    fn base(&self) -> &HardwareBase {
        &self.cpu.base
    }

    fn base_mut(&mut self) -> &mut HardwareBase {
        &mut self.cpu.base
    }

    fn update(&mut self) {
        self.cpu.update_load();
        self.update_temperatures();
        self.update_power();
        self.update_clocks();
    }

    fn report(&self) -> String {
        let mut r = self.cpu.report();
        let _ = writeln!(r, "Tctl offset: {}", self.offset);
        if let Ok(pci) = self.cpu.env.bus.lock_pci() {
            let _ = writeln!(r, "SMN:");
            for index in std::iter::once(THM_TCON_CUR_TMP)
                .chain((0..MAX_CCDS as u32).map(|i| self.ccd_base + 4 * i))
            {
                match pci.read_smn(index) {
                    Ok(v) => {
                        let _ = writeln!(r, "  {:08X}  {:08X}", index, v);
                    }
                    Err(_) => {
                        let _ = writeln!(r, "  {:08X}  -", index);
                    }
                }
            }
        }
        r.push_str(&self.cpu.msr_report(&[
            MSR_PWR_UNIT,
            MSR_CORE_ENERGY_STAT,
            MSR_PKG_ENERGY_STAT,
            MSR_HARDWARE_PSTATE_STATUS,
        ]));
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SimulatedBus;
    use crate::cpu::tests::environment;
    use crate::cpuid::{read_topology, StaticCpuid};

    fn package(brand: &str, signature: u32, threads: usize, smt: bool) -> Vec<crate::cpuid::CoreThreads> {
        let source = StaticCpuid::processor("AuthenticAMD", brand, signature, threads, smt);
        read_topology(&source).remove(0)
    }

    fn value(hw: &dyn Hardware, name: &str, sensor_type: SensorType) -> Option<f32> {
        hw.sensors()
            .iter()
            .find(|s| s.name() == name && s.sensor_type() == sensor_type)
            .and_then(|s| s.value())
    }

    #[test]
    fn test_family_0f_decode() {
        assert_eq!(family_0f_offset(0x4B), -49.0);
        assert_eq!(family_0f_offset(0x6B), -28.0);
        assert_eq!(family_0f_offset(0x6C), -49.0);
        assert_eq!(family_0f_temperature(0x0059_0000, -49.0), 40.0);
    }

    #[test]
    fn test_family_0f_requires_device() {
        let sim = SimulatedBus::new();
        let env = environment(&sim, "/nonexistent".into());
        let cpu = Amd0fCpu::new(GenericCpu::new(
            "amdcpu",
            0,
            package("AMD Athlon(tm) 64 X2 Dual Core Processor 4200+", 0x0004_0FB2, 2, false),
            env,
        ));
        assert!(cpu
            .sensors()
            .iter()
            .all(|s| s.sensor_type() != SensorType::Temperature));
    }

    #[test]
    fn test_family_10_temperature() {
        let sim = SimulatedBus::new();
        let address = PciAddress::new(0, 0x18, 3);
        sim.add_pci_device(address, AMD_VENDOR_ID, 0x1203);
        sim.set_pci_config(address, REPORTED_TEMPERATURE_CONTROL_REGISTER, (45 * 8) << 21);
        let env = environment(&sim, "/nonexistent".into());
        let mut cpu = Amd10Cpu::new(GenericCpu::new(
            "amdcpu",
            0,
            package("AMD Phenom(tm) II X4 940 Processor", 0x0010_0F42, 4, false),
            env,
        ));
        cpu.update();
        assert_eq!(value(&cpu, "CPU Cores", SensorType::Temperature), Some(45.0));
    }

    #[test]
    fn test_family_15_tjsel() {
        assert_eq!(family_10_temperature(0x15, (60 * 8) << 21 | 0x30000), 11.0);
        assert_eq!(family_10_temperature(0x10, (60 * 8) << 21 | 0x30000), 60.0);
    }

    #[test]
    fn test_family_10_multiplier() {
        // fid 0x0E, did 0: 0.5 * 30
        assert_eq!(family_10_multiplier(0x10, 0x0E), Some(15.0));
        // did 1 halves
        assert_eq!(family_10_multiplier(0x10, 0x4E), Some(7.5));
        assert_eq!(family_10_multiplier(0x12, 0x0E), None);
    }

    #[test]
    fn test_zen_decode() {
        assert_eq!(zen_tctl((60 * 8) << 21), 60.0);
        assert_eq!(zen_tctl((60 * 8) << 21 | 0x80000), 11.0);
        assert_eq!(zen_ccd_temperature(0x800 | 792), Some(50.0));
        assert_eq!(zen_ccd_temperature(792), None);
        let (clock, vid) = zen_pstate(0x88 | (8 << 8) | (32 << 14));
        assert_eq!(clock, Some(3400.0));
        assert!((vid - 1.35).abs() < 1e-5);
    }

    #[test]
    fn test_tctl_offset() {
        assert_eq!(tctl_offset("AMD Ryzen 7 1800X"), 20.0);
        assert_eq!(tctl_offset("AMD Ryzen Threadripper 1950X"), 27.0);
        assert_eq!(tctl_offset("AMD Ryzen 9 5950X"), 0.0);
    }

    #[test]
    fn test_zen_temperatures() {
        let sim = SimulatedBus::new();
        sim.set_smn(THM_TCON_CUR_TMP, (60 * 8) << 21);
        sim.set_smn(F17H_CCD_TEMP, 0x800 | 792);
        let env = environment(&sim, "/nonexistent".into());
        let mut cpu = Amd17Cpu::new(GenericCpu::new(
            "amdcpu",
            0,
            package("AMD Ryzen 7 1800X Eight-Core Processor", 0x0080_0F11, 4, true),
            env,
        ));
        cpu.update();
        assert_eq!(value(&cpu, "Core (Tctl)", SensorType::Temperature), Some(60.0));
        assert_eq!(value(&cpu, "Core (Tdie)", SensorType::Temperature), Some(40.0));
        assert_eq!(value(&cpu, "CCD1 (Tdie)", SensorType::Temperature), Some(50.0));
        let ccd2 = cpu.sensors().iter().find(|s| s.name() == "CCD2 (Tdie)").unwrap();
        assert!(!ccd2.is_active());
    }

    #[test]
    fn test_zen_pci_contention() {
        let sim = SimulatedBus::new();
        sim.set_smn(THM_TCON_CUR_TMP, (60 * 8) << 21);
        let env = environment(&sim, "/nonexistent".into());
        let bus = env.bus.clone();
        let mut cpu = Amd17Cpu::new(GenericCpu::new(
            "amdcpu",
            0,
            package("AMD Ryzen 9 5950X 16-Core Processor", 0x00A2_0F10, 2, false),
            env,
        ));
        cpu.update();
        assert_eq!(value(&cpu, "Core (Tctl/Tdie)", SensorType::Temperature), Some(60.0));

        let held = bus.lock_pci().unwrap();
        std::thread::scope(|s| {
            s.spawn(|| cpu.update());
        });
        drop(held);
        let tctl = cpu
            .sensors()
            .iter()
            .find(|s| s.name() == "Core (Tctl/Tdie)")
            .unwrap();
        assert!(tctl.is_active());
        assert_eq!(tctl.value(), None);
    }
}
