//! Discovery and update orchestration
//!
//! [`Computer`] owns the bus gateway and one [`Group`] per enabled hardware
//! category. Groups follow `Closed -> Open -> Update* -> Closed`; toggling a
//! category tears its group down and builds a fresh one, since chip
//! identification is only valid at construction time.
//!
//! ```no_run
//! use silicore::{Computer, Config};
//!
//! # fn main() -> silicore::Result<()> {
//! let mut computer = Computer::native(Config::default());
//! computer.open();
//! computer.update();
//! for hw in computer.hardware() {
//!     for sensor in hw.sensors() {
//!         println!("{}: {:?}", sensor.name(), sensor.value());
//!     }
//! }
//! computer.close()?;
//! # Ok(())
//! # }
//! ```

use crate::bus::{Bus, SimulatedBus};
use crate::config::Config;
use crate::control::ControlRequest;
use crate::cpu::clock::{ClockEstimator, ClockSources};
use crate::cpu::{CpuEnvironment, CpuGroup};
use crate::cpuid::{CpuidSource, NativeCpuid, StaticCpuid};
use crate::error::{Error, Result};
use crate::gpu::{self, GpuApi, GpuGroup};
use crate::hardware::{self, Hardware, HardwareEvent, HardwareSnapshot};
use crate::identifier::Identifier;
use crate::mainboard::MainboardGroup;
use crate::memory::MemoryGroup;
use crate::settings::{self, Settings};
use crate::smbios::{FirmwareTables, RawTables, SysfsTables};
use crate::storage::{LinuxSmartApi, SmartApi, StorageGroup};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Hardware owned by one category
pub trait Group: Send {
    fn hardware(&self) -> Vec<&dyn Hardware>;

    fn hardware_mut(&mut self) -> Vec<&mut dyn Hardware>;

    /// Diff present devices against tracked nodes
    fn reconcile(&mut self) -> Vec<HardwareEvent> {
        Vec::new()
    }

    fn report(&self) -> String {
        self.hardware()
            .iter()
            .map(|hw| hw.report())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Close every node even when an earlier one fails; returns the first failure
    fn close(&mut self) -> Result<()> {
        let mut first = None;
        for hw in self.hardware_mut() {
            if let Err(e) = hw.close() {
                error!("closing {} failed: {}", hw.identifier(), e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Cpu,
    Mainboard,
    Gpu,
    Storage,
    Memory,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Cpu,
        Category::Mainboard,
        Category::Gpu,
        Category::Storage,
        Category::Memory,
    ];
}

pub type SmartFactory = Box<dyn Fn() -> Box<dyn SmartApi> + Send + Sync>;
pub type GpuFactory = Box<dyn Fn() -> Vec<Box<dyn GpuApi>> + Send + Sync>;

/// Platform collaborators the groups are built from
pub struct Platform {
    pub bus: Bus,
    pub cpuid: Arc<dyn CpuidSource>,
    pub clock: ClockSources,
    pub tables: Arc<dyn FirmwareTables>,
    /// `/proc`; `None` disables memory statistics
    pub proc_root: Option<PathBuf>,
    /// `None` disables drive enumeration
    pub smart: Option<SmartFactory>,
    pub gpu: GpuFactory,
}

impl Platform {
    pub fn native(config: &Config) -> Self {
        let smart: Option<SmartFactory> = if cfg!(target_os = "linux") {
            Some(Box::new(|| -> Box<dyn SmartApi> { Box::new(LinuxSmartApi::new()) }))
        } else {
            None
        };
        Self {
            bus: Bus::native(config.bus_timeout()),
            cpuid: Arc::new(NativeCpuid),
            clock: ClockSources::native(),
            tables: Arc::new(SysfsTables::new()),
            proc_root: cfg!(target_os = "linux").then(|| PathBuf::from("/proc")),
            smart,
            gpu: Box::new(gpu::native_apis),
        }
    }

    /// No real hardware: the given simulated bus and nothing else
    pub fn simulated(bus: SimulatedBus, config: &Config) -> Self {
        Self {
            bus: Bus::new(bus, config.bus_timeout()),
            cpuid: Arc::new(StaticCpuid::new()),
            clock: ClockSources::native(),
            tables: Arc::new(RawTables::default()),
            proc_root: None,
            smart: None,
            gpu: Box::new(Vec::<Box<dyn GpuApi>>::new),
        }
    }
}

pub struct Computer {
    config: Config,
    platform: Platform,
    groups: Vec<(Category, Box<dyn Group>)>,
    events: Vec<HardwareEvent>,
    is_open: bool,
}

impl Computer {
    pub fn new(config: Config, platform: Platform) -> Self {
        Self {
            config,
            platform,
            groups: Vec::new(),
            events: Vec::new(),
            is_open: false,
        }
    }

    pub fn native(config: Config) -> Self {
        let platform = Platform::native(&config);
        Self::new(config, platform)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Bus {
        &self.platform.bus
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn is_enabled(&self, category: Category) -> bool {
        let hw = &self.config.hardware;
        match category {
            Category::Cpu => hw.cpu,
            Category::Mainboard => hw.mainboard,
            Category::Gpu => hw.gpu,
            Category::Storage => hw.storage,
            Category::Memory => hw.memory,
        }
    }

    fn create_group(&self, category: Category) -> Option<Box<dyn Group>> {
        let window = self.config.history_window();
        let platform = &self.platform;
        let group: Box<dyn Group> = match category {
            Category::Cpu => {
                let env = CpuEnvironment {
                    bus: platform.bus.clone(),
                    clock: platform.clock.clone(),
                    estimator: ClockEstimator::new(self.config.clock_window()),
                    proc_root: platform.proc_root.clone().unwrap_or_default(),
                    history_window: window,
                };
                Box::new(CpuGroup::open(&env, platform.cpuid.as_ref()))
            }
            Category::Mainboard => Box::new(MainboardGroup::open(&platform.bus, platform.tables.as_ref(), window)),
            Category::Gpu => Box::new(GpuGroup::open((platform.gpu)(), window)),
            Category::Storage => Box::new(StorageGroup::open((platform.smart.as_ref()?)(), window)),
            Category::Memory => Box::new(MemoryGroup::open(platform.proc_root.as_ref()?, window)),
        };
        Some(group)
    }

    fn add_group(&mut self, category: Category) {
        let Some(group) = self.create_group(category) else {
            debug!("{:?} monitoring unavailable on this platform", category);
            return;
        };
        for hw in group.hardware() {
            self.events.push(HardwareEvent::HardwareAdded(hw.identifier().clone()));
        }
        let at = self.groups.partition_point(|(c, _)| *c < category);
        self.groups.insert(at, (category, group));
    }

    fn remove_group(&mut self, category: Category) -> Result<()> {
        let Some(at) = self.groups.iter().position(|(c, _)| *c == category) else {
            return Ok(());
        };
        let (_, mut group) = self.groups.remove(at);
        let result = group.close();
        for hw in group.hardware_mut() {
            self.events.extend(hw.take_events());
            self.events.push(HardwareEvent::HardwareRemoved(hw.identifier().clone()));
        }
        result
    }

    /// Identify hardware and build the groups of every enabled category
    pub fn open(&mut self) {
        if self.is_open {
            return;
        }
        info!("Opening computer on {} bus", self.platform.bus.driver_name());
        self.platform.bus.reopen();
        for category in Category::ALL {
            if self.is_enabled(category) {
                self.add_group(category);
            }
        }
        self.is_open = true;
    }

    /// One polling pass: reconcile hot-plug groups, then update every node
    pub fn update(&mut self) {
        for (_, group) in &mut self.groups {
            self.events.extend(group.reconcile());
            for hw in group.hardware_mut() {
                hardware::update_tree(hw);
                self.events.extend(hw.take_events());
            }
        }
    }

    /// Revert every control and release the bus; later groups are still
    /// closed after a failure, and the first failure is returned
    pub fn close(&mut self) -> Result<()> {
        if !self.is_open {
            return Ok(());
        }
        let mut first = None;
        let categories: Vec<Category> = self.groups.iter().map(|(c, _)| *c).collect();
        for category in categories {
            if let Err(e) = self.remove_group(category) {
                first.get_or_insert(e);
            }
        }
        self.platform.bus.close();
        self.is_open = false;
        info!("Computer closed");
        first.map_or(Ok(()), Err)
    }

    /// Enable or disable a category; an open computer rebuilds the group
    pub fn set_enabled(&mut self, category: Category, enabled: bool) -> Result<()> {
        let hw = &mut self.config.hardware;
        let flag = match category {
            Category::Cpu => &mut hw.cpu,
            Category::Mainboard => &mut hw.mainboard,
            Category::Gpu => &mut hw.gpu,
            Category::Storage => &mut hw.storage,
            Category::Memory => &mut hw.memory,
        };
        *flag = enabled;
        if !self.is_open {
            return Ok(());
        }
        let result = self.remove_group(category);
        if enabled {
            self.add_group(category);
        }
        result
    }

    pub fn set_cpu_enabled(&mut self, enabled: bool) -> Result<()> {
        self.set_enabled(Category::Cpu, enabled)
    }

    pub fn set_mainboard_enabled(&mut self, enabled: bool) -> Result<()> {
        self.set_enabled(Category::Mainboard, enabled)
    }

    pub fn set_gpu_enabled(&mut self, enabled: bool) -> Result<()> {
        self.set_enabled(Category::Gpu, enabled)
    }

    pub fn set_storage_enabled(&mut self, enabled: bool) -> Result<()> {
        self.set_enabled(Category::Storage, enabled)
    }

    pub fn set_memory_enabled(&mut self, enabled: bool) -> Result<()> {
        self.set_enabled(Category::Memory, enabled)
    }

    /// Top-level hardware of every open group
    pub fn hardware(&self) -> Vec<&dyn Hardware> {
        self.groups.iter().flat_map(|(_, g)| g.hardware()).collect()
    }

    pub fn hardware_mut(&mut self) -> Vec<&mut dyn Hardware> {
        self.groups
            .iter_mut()
            .flat_map(|(_, g)| g.hardware_mut())
            .collect()
    }

    /// Route a control request to the node that owns `identifier`
    pub fn set_control(&mut self, identifier: &Identifier, request: ControlRequest) -> Result<()> {
        fn route(hw: &mut dyn Hardware, id: &Identifier, request: ControlRequest) -> Option<Result<()>> {
            if hw.controls().iter().any(|c| c.identifier() == id) {
                return Some(hw.set_control(id, request));
            }
            hw.sub_hardware_mut()
                .into_iter()
                .find_map(|sub| route(sub, id, request))
        }
        self.hardware_mut()
            .into_iter()
            .find_map(|hw| route(hw, identifier, request))
            .unwrap_or_else(|| Err(Error::DeviceNotFound(format!("control {}", identifier))))
    }

    pub fn take_events(&mut self) -> Vec<HardwareEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn apply_settings(&mut self, settings: &dyn Settings) {
        for hw in self.hardware_mut() {
            settings::apply(hw, settings);
        }
    }

    pub fn save_settings(&self, settings: &mut dyn Settings) {
        for hw in self.hardware() {
            settings::persist(hw, settings);
        }
    }

    pub fn snapshot(&self) -> Vec<HardwareSnapshot> {
        self.hardware()
            .into_iter()
            .map(HardwareSnapshot::capture)
            .collect()
    }

    /// Diagnostic report of every open group
    pub fn report(&self) -> String {
        let mut r = String::new();
        let _ = writeln!(r, "silicore {} report", env!("CARGO_PKG_VERSION"));
        let _ = writeln!(r, "Generated: {}", chrono::Utc::now().to_rfc3339());
        let _ = writeln!(r, "Bus driver: {}", self.platform.bus.driver_name());
        for (category, group) in &self.groups {
            let _ = writeln!(r, "\n== {:?} ==\n", category);
            r.push_str(&group.report());
        }
        r
    }
}

impl Drop for Computer {
    fn drop(&mut self) {
        if self.is_open {
            if let Err(e) = self.close() {
                warn!("closing on drop failed: {}", e);
            }
        }
    }
}

/// Runs [`Computer::update`] on a dedicated thread
pub struct UpdateLoop {
    computer: Arc<Mutex<Computer>>,
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl UpdateLoop {
    pub fn spawn(computer: Computer, interval: Duration) -> Result<Self> {
        let computer = Arc::new(Mutex::new(computer));
        let (stop, stopped) = mpsc::channel::<()>();
        let shared = computer.clone();
        let handle = thread::Builder::new()
            .name("silicore-update".into())
            .spawn(move || loop {
                let started = Instant::now();
                shared.lock().update();
                let wait = interval.saturating_sub(started.elapsed());
                match stopped.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            })?;
        Ok(Self {
            computer,
            stop,
            handle,
        })
    }

    /// Access the computer between passes
    pub fn computer(&self) -> MutexGuard<'_, Computer> {
        self.computer.lock()
    }

    /// Stop after the current pass and hand the computer back
    pub fn stop(self) -> Result<Computer> {
        drop(self.stop);
        self.handle
            .join()
            .map_err(|_| Error::Other("update thread panicked".into()))?;
        Arc::try_unwrap(self.computer)
            .map(Mutex::into_inner)
            .map_err(|_| Error::Other("computer still shared".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettings;
    use crate::storage::tests::FakeSmart;

    fn config() -> Config {
        let mut config = Config::default();
        config.sensors.history_window_secs = 3600;
        config
    }

    fn platform(smart: FakeSmart, proc_root: Option<PathBuf>) -> Platform {
        let mut platform = Platform::simulated(SimulatedBus::new(), &config());
        platform.smart = Some(Box::new(move || -> Box<dyn SmartApi> { Box::new(smart.clone()) }));
        platform.proc_root = proc_root;
        platform
    }

    #[test]
    fn test_open_update_close() {
        let smart = FakeSmart::default();
        smart.insert("sda", None);
        let mut computer = Computer::new(config(), platform(smart.clone(), None));
        assert!(computer.hardware().is_empty());
        computer.open();
        assert!(computer.is_open());

        let ids: Vec<_> = computer.hardware().iter().map(|h| h.identifier().to_string()).collect();
        assert_eq!(ids, vec!["/motherboard", "/hdd/0"]);
        let events = computer.take_events();
        assert_eq!(events.len(), 2);

        computer.update();
        assert_eq!(computer.hardware()[1].sensors()[0].value(), Some(29.0));
        assert!(computer
            .take_events()
            .contains(&HardwareEvent::SensorAdded(Identifier::new(["hdd", "0", "temperature", "0"]))));

        smart.insert("sdb", None);
        computer.update();
        assert!(computer
            .take_events()
            .contains(&HardwareEvent::HardwareAdded(Identifier::new(["hdd", "1"]))));

        computer.close().unwrap();
        assert!(computer.bus().is_closed());
        assert!(computer.hardware().is_empty());
        let events = computer.take_events();
        assert!(events.contains(&HardwareEvent::HardwareRemoved(Identifier::new(["motherboard"]))));
    }

    #[test]
    fn test_toggle_recreates_group() {
        let smart = FakeSmart::default();
        smart.insert("sda", None);
        let mut computer = Computer::new(config(), platform(smart, None));
        computer.open();
        computer.take_events();

        computer.set_storage_enabled(false).unwrap();
        assert_eq!(computer.hardware().len(), 1);
        assert_eq!(
            computer.take_events(),
            vec![HardwareEvent::HardwareRemoved(Identifier::new(["hdd", "0"]))]
        );
        assert!(!computer.config().hardware.storage);

        computer.set_storage_enabled(true).unwrap();
        assert_eq!(computer.hardware().len(), 2);
        assert_eq!(
            computer.take_events(),
            vec![HardwareEvent::HardwareAdded(Identifier::new(["hdd", "0"]))]
        );
    }

    #[test]
    fn test_memory_and_settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("meminfo"), "MemTotal: 1000 kB\nMemAvailable: 250 kB\n").unwrap();
        let mut computer = Computer::new(config(), platform(FakeSmart::default(), Some(dir.path().into())));
        computer.open();
        computer.update();
        assert_eq!(computer.hardware().last().unwrap().identifier().as_str(), "/ram");

        computer.hardware_mut()[1].set_name("System RAM");
        let mut store = MemorySettings::new();
        computer.save_settings(&mut store);
        assert_eq!(store.get_value("/ram/name").as_deref(), Some("System RAM"));

        let mut fresh = Computer::new(config(), platform(FakeSmart::default(), Some(dir.path().into())));
        fresh.open();
        fresh.apply_settings(&store);
        assert_eq!(fresh.hardware()[1].name(), "System RAM");
        assert!(fresh.snapshot()[1].name == "System RAM");
        assert!(fresh.report().contains("== Memory =="));
    }

    #[test]
    fn test_unknown_control() {
        let mut computer = Computer::new(config(), platform(FakeSmart::default(), None));
        computer.open();
        let err = computer
            .set_control(&Identifier::new(["lpc", "x", "0", "control", "0", "control"]), ControlRequest::Default)
            .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
    }

    #[test]
    fn test_update_loop_returns_computer() {
        let smart = FakeSmart::default();
        smart.insert("sda", None);
        let mut computer = Computer::new(config(), platform(smart, None));
        computer.open();
        let updater = UpdateLoop::spawn(computer, Duration::from_millis(5)).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(updater.computer().hardware()[1].sensors()[0].value().is_some());
        let mut computer = updater.stop().unwrap();
        computer.close().unwrap();
    }
}
