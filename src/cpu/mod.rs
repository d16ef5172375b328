//! CPU hardware
//!
//! One hardware node per physical package. The vendor decoders
//! ([`intel::IntelCpu`], [`amd`]) embed a [`GenericCpu`] that owns the
//! topology, the load sensors and the time-stamp counter estimate.
//!
//! # Sensors
//!
//! | Type        | Source                                   |
//! |-------------|------------------------------------------|
//! | Load        | `/proc/stat` deltas per logical thread    |
//! | Clock       | TSC estimate × per-core multiplier MSRs   |
//! | Temperature | thermal status MSRs, PCI, SMN             |
//! | Power       | RAPL energy counters                      |
//! | Voltage     | performance status / P-state MSRs         |

pub mod amd;
pub mod clock;
pub mod intel;
pub mod load;

use crate::affinity::AffinityGuard;
use crate::bus::Bus;
use crate::computer::Group;
use crate::cpuid::{self, CoreThreads, CpuidData, CpuidSource, Vendor};
use crate::hardware::{Hardware, HardwareBase, HardwareType};
use crate::identifier::Identifier;
use crate::sensor::SensorType;
use clock::{ClockEstimator, ClockSources};
use load::CpuLoad;
use log::{debug, info, trace};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Everything a CPU decoder needs from the platform
#[derive(Clone)]
pub struct CpuEnvironment {
    pub bus: Bus,
    pub clock: ClockSources,
    pub estimator: ClockEstimator,
    pub proc_root: PathBuf,
    pub history_window: chrono::Duration,
}

/// Wrap-safe energy accumulator turning counter deltas into watts
#[derive(Debug, Default, Clone)]
pub struct EnergyCounter {
    last: Option<(u32, Instant)>,
    power: Option<f32>,
}

impl EnergyCounter {
    /// Shorter intervals are too noisy to divide by
    pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw counter value; `unit` is joules per count
    ///
    /// Returns the previous power when called again within
    /// [`Self::MIN_INTERVAL`], and `None` until two samples exist.
    pub fn sample(&mut self, raw: u32, now: Instant, unit: f32) -> Option<f32> {
        let Some((previous, at)) = self.last else {
            self.last = Some((raw, now));
            return None;
        };
        let elapsed = now.saturating_duration_since(at);
        if elapsed < Self::MIN_INTERVAL {
            return self.power;
        }
        let joules = raw.wrapping_sub(previous) as f32 * unit;
        self.last = Some((raw, now));
        self.power = Some(joules / elapsed.as_secs_f32());
        self.power
    }
}

/// Vendor-independent part of a CPU package
pub struct GenericCpu {
    pub(crate) base: HardwareBase,
    pub(crate) env: CpuEnvironment,
    pub(crate) cores: Vec<CoreThreads>,
    pub(crate) index: usize,
    /// Estimated time-stamp counter frequency in MHz
    pub(crate) tsc_frequency: Option<f64>,
    load: Option<CpuLoad>,
    total_load: usize,
    core_loads: Vec<usize>,
    max_load: usize,
}

impl GenericCpu {
    /// `kind` is the identifier prefix, e.g. `intelcpu`
    pub fn new(kind: &str, index: usize, cores: Vec<CoreThreads>, env: CpuEnvironment) -> Self {
        let name = cores
            .first()
            .and_then(|c| c.first())
            .map(|t| t.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "Unknown Processor".to_string());
        let mut base = HardwareBase::new(
            name,
            Identifier::new([kind.to_string(), index.to_string()]),
            HardwareType::Cpu,
        )
        .with_window(env.history_window);

        let total_load = base.add_sensor("CPU Total", 0, SensorType::Load);
        let core_loads = (0..cores.len())
            .map(|i| base.add_sensor(format!("CPU Core #{}", i + 1), i + 1, SensorType::Load))
            .collect();
        let max_load = base.add_sensor("CPU Core Max", cores.len() + 1, SensorType::Load);

        let load = CpuLoad::new(&env.proc_root);
        let load = load.is_available().then_some(load);

        let mut cpu = Self {
            base,
            env,
            cores,
            index,
            tsc_frequency: None,
            load,
            total_load,
            core_loads,
            max_load,
        };
        if cpu.has_tsc() {
            cpu.tsc_frequency = cpu.estimate_tsc_frequency();
        }
        cpu
    }

    fn estimate_tsc_frequency(&self) -> Option<f64> {
        let thread = self.first_thread(0);
        let _pin = match AffinityGuard::pin(thread) {
            Ok(guard) => Some(guard),
            Err(e) => {
                debug!("TSC estimation unpinned on cpu {}: {}", thread, e);
                None
            }
        };
        let hz = self.env.estimator.estimate(
            self.env.clock.counter.as_ref(),
            self.env.clock.stopwatch.as_ref(),
        )?;
        let mhz = hz * 1e-6;
        debug!("{}: time stamp counter {:.2} MHz", self.base.name(), mhz);
        Some(mhz)
    }

    /// Identification data of the first thread
    pub fn cpuid(&self) -> Option<&CpuidData> {
        self.cores.first().and_then(|c| c.first())
    }

    pub fn vendor(&self) -> Vendor {
        self.cpuid().map_or(Vendor::Unknown, |c| c.vendor)
    }

    pub fn family(&self) -> u32 {
        self.cpuid().map_or(0, |c| c.family)
    }

    pub fn model(&self) -> u32 {
        self.cpuid().map_or(0, |c| c.model)
    }

    pub fn stepping(&self) -> u32 {
        self.cpuid().map_or(0, |c| c.stepping)
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    pub fn thread_count(&self) -> usize {
        self.cores.iter().map(Vec::len).sum()
    }

    /// Logical processor number of the first thread of `core`
    pub fn first_thread(&self, core: usize) -> usize {
        self.cores
            .get(core)
            .and_then(|c| c.first())
            .map_or(0, |t| t.thread)
    }

    pub fn has_tsc(&self) -> bool {
        self.cpuid()
            .and_then(|c| c.leaf(1))
            .is_some_and(|l| l.edx & 0x10 != 0)
    }

    /// Invariant TSC (constant rate across P-states)
    pub fn has_invariant_tsc(&self) -> bool {
        self.cpuid()
            .and_then(|c| c.ext_leaf(7))
            .is_some_and(|l| l.edx & 0x100 != 0)
    }

    pub fn tsc_frequency(&self) -> Option<f64> {
        self.tsc_frequency
    }

    pub fn bus(&self) -> &Bus {
        &self.env.bus
    }

    pub(crate) fn update_load(&mut self) {
        let Some(load) = self.load.as_mut() else {
            return;
        };
        let loads = match load.update() {
            Ok(loads) => loads,
            Err(e) => {
                trace!("CPU load read failed: {}", e);
                return;
            }
        };
        if loads.is_empty() {
            return;
        }

        let mut total = Vec::new();
        let mut max: Option<f32> = None;
        for (i, core) in self.cores.iter().enumerate() {
            let values: Vec<f32> = core.iter().filter_map(|t| loads.get(&t.thread)).copied().collect();
            let value = (!values.is_empty()).then(|| values.iter().sum::<f32>() / values.len() as f32);
            if let Some(v) = value {
                max = Some(max.map_or(v, |m| m.max(v)));
            }
            total.extend(values);
            self.base.publish(self.core_loads[i], value);
        }
        let total = (!total.is_empty()).then(|| total.iter().sum::<f32>() / total.len() as f32);
        self.base.publish(self.total_load, total);
        self.base.publish(self.max_load, max);
    }

    /// CPUID and topology section of the report
    pub fn report(&self) -> String {
        let mut r = self.base.report();
        let _ = writeln!(r);
        r.push_str(&cpuid::report(&self.cores));
        if let Some(mhz) = self.tsc_frequency {
            let _ = writeln!(r, "Time Stamp Counter Frequency: {:.2} MHz", mhz);
        }
        let _ = writeln!(r, "Invariant TSC: {}", self.has_invariant_tsc());
        r
    }

    /// Dump `msrs` of the first thread of every core
    pub fn msr_report(&self, msrs: &[u32]) -> String {
        let mut r = String::new();
        let _ = writeln!(r, "MSRs:");
        for core in 0..self.core_count() {
            let thread = self.first_thread(core);
            for &msr in msrs {
                match self.env.bus.read_msr(thread, msr) {
                    Ok(v) => {
                        let _ = writeln!(r, "  cpu {:>3}  {:08X}  {:016X}", thread, msr, v);
                    }
                    Err(_) => {
                        let _ = writeln!(r, "  cpu {:>3}  {:08X}  -", thread, msr);
                    }
                }
            }
        }
        r
    }
}

impl Hardware for GenericCpu {
    fn base(&self) -> &HardwareBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HardwareBase {
        &mut self.base
    }

    fn update(&mut self) {
        self.update_load();
    }

    fn report(&self) -> String {
        GenericCpu::report(self)
    }
}

/// Build the decoder for one package
fn create(index: usize, package: Vec<CoreThreads>, env: &CpuEnvironment) -> Box<dyn Hardware> {
    let Some(first) = package.first().and_then(|c| c.first()) else {
        return Box::new(GenericCpu::new("genericcpu", index, package, env.clone()));
    };
    let (vendor, family) = (first.vendor, first.family);
    match (vendor, family) {
        (Vendor::Intel, 0x06 | 0x0F) => Box::new(intel::IntelCpu::new(GenericCpu::new(
            "intelcpu",
            index,
            package,
            env.clone(),
        ))),
        (Vendor::Amd, 0x0F) => Box::new(amd::Amd0fCpu::new(GenericCpu::new(
            "amdcpu",
            index,
            package,
            env.clone(),
        ))),
        (Vendor::Amd, 0x10..=0x16) => Box::new(amd::Amd10Cpu::new(GenericCpu::new(
            "amdcpu",
            index,
            package,
            env.clone(),
        ))),
        (Vendor::Amd, 0x17 | 0x19 | 0x1A) => Box::new(amd::Amd17Cpu::new(GenericCpu::new(
            "amdcpu",
            index,
            package,
            env.clone(),
        ))),
        _ => {
            debug!("No decoder for {} family {:#x}, using generic CPU", vendor, family);
            Box::new(GenericCpu::new("genericcpu", index, package, env.clone()))
        }
    }
}

/// All CPU packages of the machine
pub struct CpuGroup {
    cpus: Vec<Box<dyn Hardware>>,
}

impl CpuGroup {
    pub fn open(env: &CpuEnvironment, source: &dyn CpuidSource) -> Self {
        let packages = cpuid::read_topology(source);
        let cpus: Vec<Box<dyn Hardware>> = packages
            .into_iter()
            .enumerate()
            .map(|(index, package)| create(index, package, env))
            .collect();
        for cpu in &cpus {
            info!("Found CPU {} ({})", cpu.name(), cpu.identifier());
        }
        Self { cpus }
    }
}

impl Group for CpuGroup {
    fn hardware(&self) -> Vec<&dyn Hardware> {
        self.cpus.iter().map(|c| &**c as &dyn Hardware).collect()
    }

    fn hardware_mut(&mut self) -> Vec<&mut dyn Hardware> {
        self.cpus
            .iter_mut()
            .map(|c| &mut **c as &mut dyn Hardware)
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bus::SimulatedBus;
    use crate::cpuid::StaticCpuid;
    use std::fs;

    pub(crate) fn environment(bus: &SimulatedBus, proc_root: PathBuf) -> CpuEnvironment {
        CpuEnvironment {
            bus: Bus::new(bus.clone(), Duration::from_millis(10)),
            clock: ClockSources::native(),
            estimator: ClockEstimator::new(Duration::from_millis(2)),
            proc_root,
            history_window: chrono::Duration::hours(1),
        }
    }

    #[test]
    fn test_energy_counter_wraps() {
        let mut counter = EnergyCounter::new();
        let t0 = Instant::now();
        assert_eq!(counter.sample(u32::MAX - 9, t0, 1.0), None);
        // too soon: nothing to report yet
        assert_eq!(counter.sample(0, t0 + Duration::from_millis(5), 1.0), None);
        let p = counter
            .sample(10, t0 + Duration::from_secs(1), 1.0)
            .unwrap();
        assert!((p - 20.0).abs() < 1e-3);
    }

    #[test]
    fn test_generic_cpu_load() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("stat"),
            "cpu0 100 0 0 100 0 0 0 0\ncpu1 100 0 0 100 0 0 0 0\n",
        )
        .unwrap();
        let source = StaticCpuid::processor("VIAVIAVIAVIA", "Test CPU", 0x06A9, 2, false);
        let sim = SimulatedBus::new();
        let env = environment(&sim, dir.path().to_path_buf());
        let mut group = CpuGroup::open(&env, &source);

        let mut cpus = group.hardware_mut();
        let cpu = &mut cpus[0];
        assert_eq!(cpu.identifier().as_str(), "/genericcpu/0");
        cpu.update();
        assert!(cpu.sensors().iter().all(|s| !s.is_active()));

        fs::write(
            dir.path().join("stat"),
            "cpu0 200 0 0 100 0 0 0 0\ncpu1 100 0 0 200 0 0 0 0\n",
        )
        .unwrap();
        cpu.update();
        let value = |name: &str| {
            cpu.sensors()
                .iter()
                .find(|s| s.name() == name)
                .and_then(|s| s.value())
        };
        assert_eq!(value("CPU Core #1"), Some(100.0));
        assert_eq!(value("CPU Core #2"), Some(0.0));
        assert_eq!(value("CPU Total"), Some(50.0));
        assert_eq!(value("CPU Core Max"), Some(100.0));
    }
}
