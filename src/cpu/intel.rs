//! Intel processors: digital thermal sensors, multipliers and RAPL

use super::{EnergyCounter, GenericCpu};
use crate::hardware::{Hardware, HardwareBase};
use crate::parameter::ParameterDescription;
use crate::sensor::SensorType;
use log::{debug, trace};
use std::fmt::Write as _;
use std::time::Instant;

const IA32_PERF_STATUS: u32 = 0x198;
const IA32_THERM_STATUS: u32 = 0x19C;
const IA32_TEMPERATURE_TARGET: u32 = 0x1A2;
const IA32_PACKAGE_THERM_STATUS: u32 = 0x1B1;
const MSR_PLATFORM_INFO: u32 = 0xCE;
const MSR_RAPL_POWER_UNIT: u32 = 0x606;
const MSR_PKG_ENERGY_STATUS: u32 = 0x611;
const MSR_DRAM_ENERGY_STATUS: u32 = 0x619;
const MSR_PP0_ENERGY_STATUS: u32 = 0x639;
const MSR_PP1_ENERGY_STATUS: u32 = 0x641;

const RAPL_DOMAINS: [(&str, u32); 4] = [
    ("CPU Package", MSR_PKG_ENERGY_STATUS),
    ("CPU Cores", MSR_PP0_ENERGY_STATUS),
    ("CPU Graphics", MSR_PP1_ENERGY_STATUS),
    ("CPU Memory", MSR_DRAM_ENERGY_STATUS),
];

const TEMPERATURE_PARAMETERS: [ParameterDescription; 2] = [
    ParameterDescription::new("TjMax [°C]", "TjMax temperature of the core sensor.", 100.0),
    ParameterDescription::new("TSlope [°C]", "Temperature slope of the digital thermal sensor.", 1.0),
];

/// Intel core generations with distinct register semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Microarchitecture {
    Unknown,
    NetBurst,
    Core,
    Atom,
    Nehalem,
    SandyBridge,
    IvyBridge,
    Haswell,
    Broadwell,
    Silvermont,
    Airmont,
    Skylake,
    KabyLake,
    Goldmont,
    GoldmontPlus,
    CannonLake,
    IceLake,
    CometLake,
    Tremont,
    TigerLake,
    RocketLake,
    AlderLake,
    RaptorLake,
    MeteorLake,
    ArrowLake,
    LunarLake,
}

/// Core multiplier encoding in `IA32_PERF_STATUS`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MultiplierRule {
    /// Bits 8..12 plus the half-ratio bit 14
    Legacy,
    /// Bits 0..7
    Nehalem,
    /// Bits 8..15
    Modern,
}

impl Microarchitecture {
    pub fn identify(family: u32, model: u32) -> Self {
        use Microarchitecture::*;
        match family {
            0x06 => match model {
                0x0F | 0x16 | 0x17 => Core,
                0x1C | 0x26 | 0x36 => Atom,
                0x1A | 0x1E | 0x1F | 0x25 | 0x2C | 0x2E | 0x2F => Nehalem,
                0x2A | 0x2D => SandyBridge,
                0x3A | 0x3E => IvyBridge,
                0x3C | 0x3F | 0x45 | 0x46 => Haswell,
                0x3D | 0x47 | 0x4F | 0x56 => Broadwell,
                0x37 | 0x4A | 0x4D | 0x5A | 0x5D => Silvermont,
                0x4C => Airmont,
                0x4E | 0x5E | 0x55 => Skylake,
                0x8E | 0x9E => KabyLake,
                0x5C | 0x5F => Goldmont,
                0x7A => GoldmontPlus,
                0x66 => CannonLake,
                0x6A | 0x6C | 0x7D | 0x7E | 0x9D => IceLake,
                0xA5 | 0xA6 => CometLake,
                0x86 | 0x96 | 0x9C => Tremont,
                0x8C | 0x8D => TigerLake,
                0xA7 => RocketLake,
                0x97 | 0x9A | 0xBE => AlderLake,
                0xB7 | 0xBA | 0xBF => RaptorLake,
                0xAA | 0xAC => MeteorLake,
                0xC5 | 0xC6 => ArrowLake,
                0xBD => LunarLake,
                _ => Unknown,
            },
            0x0F => match model {
                0x00..=0x04 | 0x06 => NetBurst,
                _ => Unknown,
            },
            _ => Unknown,
        }
    }

    fn multiplier_rule(self) -> Option<MultiplierRule> {
        use Microarchitecture::*;
        match self {
            Unknown => None,
            NetBurst | Core | Atom => Some(MultiplierRule::Legacy),
            Nehalem => Some(MultiplierRule::Nehalem),
            _ => Some(MultiplierRule::Modern),
        }
    }

    /// `IA32_TEMPERATURE_TARGET` is implemented
    fn has_temperature_target(self) -> bool {
        !matches!(
            self,
            Microarchitecture::Unknown
                | Microarchitecture::NetBurst
                | Microarchitecture::Core
                | Microarchitecture::Atom
        )
    }

    /// RAPL energy counters are implemented
    fn has_rapl(self) -> bool {
        !matches!(
            self,
            Microarchitecture::Unknown
                | Microarchitecture::NetBurst
                | Microarchitecture::Core
                | Microarchitecture::Atom
                | Microarchitecture::Nehalem
        )
    }

    /// Core voltage is reported in `IA32_PERF_STATUS[47:32]`
    fn has_core_voltage(self) -> bool {
        self.has_rapl()
    }
}

/// Fixed TjMax for processors without a temperature target MSR
fn fixed_tjmax(model: u32, stepping: u32, cores: usize) -> f32 {
    match model {
        0x0F => match stepping {
            0x06 => match cores {
                2 => 90.0,
                4 => 100.0,
                _ => 95.0,
            },
            0x0B => 100.0,
            0x0D => 95.0,
            _ => 95.0,
        },
        0x16 | 0x17 => 100.0,
        0x1C => {
            if stepping == 0x0A {
                100.0
            } else {
                90.0
            }
        }
        _ => 100.0,
    }
}

/// Decode a thermal status register; `None` when the reading is not valid
fn thermal_delta(status: u64) -> Option<f32> {
    let eax = status as u32;
    if eax & 0x8000_0000 == 0 {
        return None;
    }
    Some(((eax >> 16) & 0x7F) as f32)
}

fn decode_multiplier(rule: MultiplierRule, perf_status: u64) -> f64 {
    let eax = perf_status as u32;
    match rule {
        MultiplierRule::Legacy => ((eax >> 8) & 0x1F) as f64 + 0.5 * ((eax >> 14) & 1) as f64,
        MultiplierRule::Nehalem => (eax & 0xFF) as f64,
        MultiplierRule::Modern => ((eax >> 8) & 0xFF) as f64,
    }
}

fn energy_unit(micro: Microarchitecture, power_unit: u64) -> f32 {
    let shift = ((power_unit as u32) >> 8) & 0x1F;
    match micro {
        Microarchitecture::Silvermont | Microarchitecture::Airmont => 1.0e-6 * (1u64 << shift) as f32,
        _ => 1.0 / (1u64 << shift) as f32,
    }
}

struct RaplDomain {
    msr: u32,
    slot: usize,
    counter: EnergyCounter,
}

/// Intel package decoder
pub struct IntelCpu {
    cpu: GenericCpu,
    micro: Microarchitecture,
    tjmax: Vec<f32>,
    tsc_multiplier: Option<f64>,
    core_temperatures: Vec<usize>,
    package_temperature: Option<usize>,
    core_max: Option<usize>,
    core_average: Option<usize>,
    bus_clock: usize,
    core_clocks: Vec<usize>,
    core_voltage: Option<usize>,
    energy_unit: f32,
    rapl: Vec<RaplDomain>,
}

impl IntelCpu {
    pub fn new(cpu: GenericCpu) -> Self {
        let micro = Microarchitecture::identify(cpu.family(), cpu.model());
        debug!(
            "{}: family {:#x} model {:#x} -> {:?}",
            cpu.base.name(),
            cpu.family(),
            cpu.model(),
            micro
        );

        let tjmax = Self::read_tjmax(&cpu, micro);
        let tsc_multiplier = Self::read_tsc_multiplier(&cpu, micro);

        let mut intel = Self {
            cpu,
            micro,
            tjmax,
            tsc_multiplier,
            core_temperatures: Vec::new(),
            package_temperature: None,
            core_max: None,
            core_average: None,
            bus_clock: 0,
            core_clocks: Vec::new(),
            core_voltage: None,
            energy_unit: 0.0,
            rapl: Vec::new(),
        };
        intel.build_sensors();
        intel
    }

    fn read_tjmax(cpu: &GenericCpu, micro: Microarchitecture) -> Vec<f32> {
        (0..cpu.core_count())
            .map(|core| {
                if !micro.has_temperature_target() {
                    return fixed_tjmax(cpu.model(), cpu.stepping(), cpu.core_count());
                }
                match cpu.bus().read_msr(cpu.first_thread(core), IA32_TEMPERATURE_TARGET) {
                    Ok(v) => {
                        let tj = ((v >> 16) & 0xFF) as f32;
                        if tj > 0.0 {
                            tj
                        } else {
                            100.0
                        }
                    }
                    Err(e) => {
                        trace!("Temperature target unreadable: {}", e);
                        100.0
                    }
                }
            })
            .collect()
    }

    fn read_tsc_multiplier(cpu: &GenericCpu, micro: Microarchitecture) -> Option<f64> {
        let thread = cpu.first_thread(0);
        let multiplier = match micro.multiplier_rule()? {
            MultiplierRule::Legacy => {
                let edx = (cpu.bus().read_msr(thread, IA32_PERF_STATUS).ok()? >> 32) as u32;
                ((edx >> 8) & 0x1F) as f64 + 0.5 * ((edx >> 14) & 1) as f64
            }
            MultiplierRule::Nehalem | MultiplierRule::Modern => {
                let eax = cpu.bus().read_msr(thread, MSR_PLATFORM_INFO).ok()? as u32;
                ((eax >> 8) & 0xFF) as f64
            }
        };
        (multiplier > 0.0).then_some(multiplier)
    }

    fn has_package_sensor(&self) -> bool {
        self.cpu
            .cpuid()
            .and_then(|c| c.leaf(6))
            .is_some_and(|l| l.eax & 0x40 != 0)
    }

    fn build_sensors(&mut self) {
        let cores = self.cpu.core_count();
        let has_dts = self
            .cpu
            .cpuid()
            .and_then(|c| c.leaf(6))
            .is_some_and(|l| l.eax & 0x01 != 0);

        if has_dts && self.micro != Microarchitecture::Unknown {
            for core in 0..cores {
                let mut descriptions = TEMPERATURE_PARAMETERS;
                descriptions[0] = ParameterDescription::new(
                    "TjMax [°C]",
                    "TjMax temperature of the core sensor.",
                    self.tjmax[core],
                );
                let sensor = self
                    .cpu
                    .base
                    .sensor(format!("CPU Core #{}", core + 1), core, SensorType::Temperature)
                    .with_parameters(&descriptions);
                self.core_temperatures.push(self.cpu.base.push_sensor(sensor));
            }
            if self.has_package_sensor() {
                let mut descriptions = TEMPERATURE_PARAMETERS;
                descriptions[0] = ParameterDescription::new(
                    "TjMax [°C]",
                    "TjMax temperature of the package sensor.",
                    self.tjmax.first().copied().unwrap_or(100.0),
                );
                let sensor = self
                    .cpu
                    .base
                    .sensor("CPU Package", cores, SensorType::Temperature)
                    .with_parameters(&descriptions);
                self.package_temperature = Some(self.cpu.base.push_sensor(sensor));
            }
            self.core_max = Some(self.cpu.base.add_sensor("Core Max", cores + 1, SensorType::Temperature));
            self.core_average =
                Some(self.cpu.base.add_sensor("Core Average", cores + 2, SensorType::Temperature));
        }

        self.bus_clock = self.cpu.base.add_sensor("Bus Speed", 0, SensorType::Clock);
        self.core_clocks = (0..cores)
            .map(|i| {
                self.cpu
                    .base
                    .add_sensor(format!("CPU Core #{}", i + 1), i + 1, SensorType::Clock)
            })
            .collect();

        if self.micro.has_core_voltage() {
            self.core_voltage = Some(self.cpu.base.add_sensor("CPU Core", 0, SensorType::Voltage));
        }

        if self.micro.has_rapl() {
            let thread = self.cpu.first_thread(0);
            if let Ok(unit) = self.cpu.bus().read_msr(thread, MSR_RAPL_POWER_UNIT) {
                self.energy_unit = energy_unit(self.micro, unit);
                for (index, (name, msr)) in RAPL_DOMAINS.iter().enumerate() {
                    if self.cpu.bus().read_msr(thread, *msr).is_err() {
                        continue;
                    }
                    let slot = self.cpu.base.add_sensor(*name, index, SensorType::Power);
                    self.rapl.push(RaplDomain {
                        msr: *msr,
                        slot,
                        counter: EnergyCounter::new(),
                    });
                }
            }
        }
    }

    pub fn microarchitecture(&self) -> Microarchitecture {
        self.micro
    }

    fn temperature(&self, slot: usize, status: u64) -> Option<f32> {
        let delta = thermal_delta(status)?;
        let sensor = self.cpu.base.get(slot)?;
        let tjmax = sensor.parameter(0, 100.0);
        let slope = sensor.parameter(1, 1.0);
        Some(tjmax - slope * delta)
    }

    fn update_temperatures(&mut self) {
        let mut readings = Vec::with_capacity(self.core_temperatures.len());
        for (core, &slot) in self.core_temperatures.iter().enumerate() {
            let thread = self.cpu.first_thread(core);
            let value = match self.cpu.bus().read_msr(thread, IA32_THERM_STATUS) {
                Ok(status) => self.temperature(slot, status),
                Err(e) => {
                    trace!("Thermal status unreadable on cpu {}: {}", thread, e);
                    None
                }
            };
            readings.push((slot, value));
        }
        for &(slot, value) in &readings {
            self.cpu.base.publish(slot, value);
        }

        let valid: Vec<f32> = readings.iter().filter_map(|(_, v)| *v).collect();
        if let Some(slot) = self.core_max {
            let max = valid.iter().copied().reduce(f32::max);
            self.cpu.base.publish(slot, max);
        }
        if let Some(slot) = self.core_average {
            let avg = (!valid.is_empty()).then(|| valid.iter().sum::<f32>() / valid.len() as f32);
            self.cpu.base.publish(slot, avg);
        }

        if let Some(slot) = self.package_temperature {
            let thread = self.cpu.first_thread(0);
            let value = self
                .cpu
                .bus()
                .read_msr(thread, IA32_PACKAGE_THERM_STATUS)
                .ok()
                .and_then(|status| self.temperature(slot, status));
            self.cpu.base.publish(slot, value);
        }
    }

    fn update_clocks(&mut self) {
        let bus_clock = match (self.cpu.tsc_frequency, self.tsc_multiplier) {
            (Some(tsc), Some(multiplier)) => Some(tsc / multiplier),
            _ => None,
        };
        self.cpu.base.publish(self.bus_clock, bus_clock.map(|c| c as f32));

        let rule = self.micro.multiplier_rule();
        for core in 0..self.core_clocks.len() {
            let thread = self.cpu.first_thread(core);
            let value = match (rule, bus_clock) {
                (Some(rule), Some(bus_clock)) => self
                    .cpu
                    .bus()
                    .read_msr(thread, IA32_PERF_STATUS)
                    .ok()
                    .map(|status| (decode_multiplier(rule, status) * bus_clock) as f32),
                _ => None,
            };
            self.cpu.base.publish(self.core_clocks[core], value);
        }

        if let Some(slot) = self.core_voltage {
            let value = self
                .cpu
                .bus()
                .read_msr(self.cpu.first_thread(0), IA32_PERF_STATUS)
                .ok()
                .map(|status| ((status >> 32) & 0xFFFF) as f32 / 8192.0)
                .filter(|v| *v > 0.0);
            self.cpu.base.publish(slot, value);
        }
    }

    fn update_power(&mut self) {
        let thread = self.cpu.first_thread(0);
        let now = Instant::now();
        for domain in &mut self.rapl {
            let value = match self.cpu.env.bus.read_msr(thread, domain.msr) {
                Ok(raw) => domain.counter.sample(raw as u32, now, self.energy_unit),
                Err(e) => {
                    trace!("Energy counter {:#x} unreadable: {}", domain.msr, e);
                    None
                }
            };
            self.cpu.base.publish(domain.slot, value);
        }
    }
}

impl Hardware for IntelCpu {
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
        self.update_power();
    }

    fn report(&self) -> String {
        let mut r = self.cpu.report();
        let _ = writeln!(r, "Microarchitecture: {:?}", self.micro);
        let _ = writeln!(
            r,
            "TjMax: {}",
            self.tjmax
                .iter()
                .map(|t| format!("{:.0}", t))
                .collect::<Vec<_>>()
                .join(", ")
        );
        r.push_str(&self.cpu.msr_report(&[
            MSR_PLATFORM_INFO,
            IA32_PERF_STATUS,
            IA32_THERM_STATUS,
            IA32_TEMPERATURE_TARGET,
            IA32_PACKAGE_THERM_STATUS,
            MSR_RAPL_POWER_UNIT,
            MSR_PKG_ENERGY_STATUS,
            MSR_DRAM_ENERGY_STATUS,
            MSR_PP0_ENERGY_STATUS,
            MSR_PP1_ENERGY_STATUS,
        ]));
        r
    }
}
