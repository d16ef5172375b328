//! Bus access gateway
//!
//! The only place raw MSR, PCI configuration and ISA port operations happen.
//! Multi-step chip protocols (index/data pairs, bank switching, config-mode
//! key sequences) run inside one critical section obtained with
//! [`Bus::lock_isa`] or [`Bus::lock_pci`]. Acquisition is bounded by the
//! configured timeout; on expiry the caller gets [`Error::BusTimeout`] and
//! skips that decode pass.
//!
//! ```no_run
//! use silicore::bus::Bus;
//! use std::time::Duration;
//!
//! # fn main() -> silicore::Result<()> {
//! let bus = Bus::native(Duration::from_millis(10));
//! let isa = bus.lock_isa()?;
//! isa.write(0x2E, 0x87)?;
//! # Ok(())
//! # }
//! ```

#[cfg(target_os = "linux")]
pub mod linux;
pub mod sim;

use crate::error::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use sim::SimulatedBus;

/// PCI bus/device/function triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

/// An enumerated PCI function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDeviceInfo {
    pub address: PciAddress,
    pub vendor_id: u16,
    pub device_id: u16,
}

/// SMN index/data register pair in the root complex (AMD family 17h and later)
const SMN_ROOT: PciAddress = PciAddress::new(0, 0, 0);
const SMN_INDEX_REGISTER: u16 = 0x60;
const SMN_DATA_REGISTER: u16 = 0x64;

/// Raw register access primitive
///
/// Implementations perform single operations only; serialization is the
/// gateway's job.
pub trait BusDriver: Send + Sync {
    fn name(&self) -> &str;

    fn read_port(&self, port: u16) -> Result<u8>;

    fn write_port(&self, port: u16, value: u8) -> Result<()>;

    fn read_msr(&self, cpu: usize, index: u32) -> Result<u64>;

    fn write_msr(&self, cpu: usize, index: u32, value: u64) -> Result<()>;

    fn read_pci_config(&self, address: PciAddress, offset: u16) -> Result<u32>;

    fn write_pci_config(&self, address: PciAddress, offset: u16, value: u32) -> Result<()>;

    fn pci_devices(&self) -> Result<Vec<PciDeviceInfo>>;
}

/// Driver for platforms without native register access
#[derive(Debug, Default)]
pub struct UnsupportedBus;

impl UnsupportedBus {
    fn err<T>(&self, what: &str) -> Result<T> {
        Err(Error::NotSupported(format!(
            "{} access is not available on this platform",
            what
        )))
    }
}

impl BusDriver for UnsupportedBus {
    fn name(&self) -> &str {
        "unsupported"
    }

    fn read_port(&self, _port: u16) -> Result<u8> {
        self.err("I/O port")
    }

    fn write_port(&self, _port: u16, _value: u8) -> Result<()> {
        self.err("I/O port")
    }

    fn read_msr(&self, _cpu: usize, _index: u32) -> Result<u64> {
        self.err("MSR")
    }

    fn write_msr(&self, _cpu: usize, _index: u32, _value: u64) -> Result<()> {
        self.err("MSR")
    }

    fn read_pci_config(&self, _address: PciAddress, _offset: u16) -> Result<u32> {
        self.err("PCI configuration")
    }

    fn write_pci_config(&self, _address: PciAddress, _offset: u16, _value: u32) -> Result<()> {
        self.err("PCI configuration")
    }

    fn pci_devices(&self) -> Result<Vec<PciDeviceInfo>> {
        Ok(Vec::new())
    }
}

struct Inner {
    driver: Box<dyn BusDriver>,
    isa: Mutex<()>,
    pci: Mutex<()>,
    timeout: Duration,
    closed: AtomicBool,
}

impl Inner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::BusClosed)
        } else {
            Ok(())
        }
    }
}

/// Cloneable handle to the gateway
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("driver", &self.inner.driver.name())
            .field("timeout", &self.inner.timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Bus {
    pub fn new(driver: impl BusDriver + 'static, timeout: Duration) -> Self {
        Self::from_boxed(Box::new(driver), timeout)
    }

    pub fn from_boxed(driver: Box<dyn BusDriver>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver,
                isa: Mutex::new(()),
                pci: Mutex::new(()),
                timeout,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Native driver for the current platform
    pub fn native(timeout: Duration) -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::new(linux::LinuxBus::new(), timeout)
        }
        #[cfg(not(target_os = "linux"))]
        {
            Self::new(UnsupportedBus, timeout)
        }
    }

    pub fn driver_name(&self) -> &str {
        self.inner.driver.name()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Acquire the ISA bus for a multi-step port protocol
    pub fn lock_isa(&self) -> Result<IsaBus<'_>> {
        self.inner.check_open()?;
        let guard = self
            .inner
            .isa
            .try_lock_for(self.inner.timeout)
            .ok_or(Error::BusTimeout("isa"))?;
        Ok(IsaBus {
            inner: &self.inner,
            _guard: guard,
        })
    }

    /// Acquire the PCI bus for a configuration-space sequence
    pub fn lock_pci(&self) -> Result<PciBus<'_>> {
        self.inner.check_open()?;
        let guard = self
            .inner
            .pci
            .try_lock_for(self.inner.timeout)
            .ok_or(Error::BusTimeout("pci"))?;
        Ok(PciBus {
            inner: &self.inner,
            _guard: guard,
        })
    }

    /// Read an MSR on logical processor `cpu`
    pub fn read_msr(&self, cpu: usize, index: u32) -> Result<u64> {
        self.inner.check_open()?;
        self.inner.driver.read_msr(cpu, index)
    }

    pub fn write_msr(&self, cpu: usize, index: u32, value: u64) -> Result<()> {
        self.inner.check_open()?;
        self.inner.driver.write_msr(cpu, index, value)
    }

    /// Locate functions by vendor/device id
    pub fn find_pci_devices(&self, vendor_id: u16, device_id: u16) -> Result<Vec<PciAddress>> {
        self.inner.check_open()?;
        let mut found: Vec<_> = self
            .inner
            .driver
            .pci_devices()?
            .into_iter()
            .filter(|d| d.vendor_id == vendor_id && d.device_id == device_id)
            .map(|d| d.address)
            .collect();
        found.sort();
        Ok(found)
    }

    /// Refuse all further operations
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Accept operations again after [`Bus::close`]
    pub fn reopen(&self) {
        self.inner.closed.store(false, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// Exclusive ISA bus access; released on drop
pub struct IsaBus<'a> {
    inner: &'a Inner,
    _guard: MutexGuard<'a, ()>,
}

impl IsaBus<'_> {
    pub fn read(&self, port: u16) -> Result<u8> {
        self.inner.check_open()?;
        self.inner.driver.read_port(port)
    }

    pub fn write(&self, port: u16, value: u8) -> Result<()> {
        self.inner.check_open()?;
        self.inner.driver.write_port(port, value)
    }
}

/// Exclusive PCI configuration access; released on drop
pub struct PciBus<'a> {
    inner: &'a Inner,
    _guard: MutexGuard<'a, ()>,
}

impl PciBus<'_> {
    pub fn read_config(&self, address: PciAddress, offset: u16) -> Result<u32> {
        self.inner.check_open()?;
        self.inner.driver.read_pci_config(address, offset)
    }

    pub fn write_config(&self, address: PciAddress, offset: u16, value: u32) -> Result<()> {
        self.inner.check_open()?;
        self.inner.driver.write_pci_config(address, offset, value)
    }

    /// Indirect read through the root complex SMN index/data pair
    pub fn read_smn(&self, index: u32) -> Result<u32> {
        self.write_config(SMN_ROOT, SMN_INDEX_REGISTER, index)?;
        self.read_config(SMN_ROOT, SMN_DATA_REGISTER)
    }

    pub fn write_smn(&self, index: u32, value: u32) -> Result<()> {
        self.write_config(SMN_ROOT, SMN_INDEX_REGISTER, index)?;
        self.write_config(SMN_ROOT, SMN_DATA_REGISTER, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn bus() -> (Bus, SimulatedBus) {
        let sim = SimulatedBus::new();
        (Bus::new(sim.clone(), Duration::from_millis(10)), sim)
    }

    #[test]
    fn test_isa_contention_times_out() {
        let (bus, _) = bus();
        let held = bus.lock_isa().unwrap();
        let start = Instant::now();
        let err = bus.lock_isa().err().unwrap();
        assert!(matches!(err, Error::BusTimeout("isa")));
        assert!(start.elapsed() < Duration::from_secs(1));

        // unrelated bus is still available
        assert!(bus.lock_pci().is_ok());
        drop(held);
        assert!(bus.lock_isa().is_ok());
    }

    #[test]
    fn test_closed_bus_refuses() {
        let (bus, sim) = bus();
        sim.set_msr(0, 0x19C, 0x8800_0000);
        assert_eq!(bus.read_msr(0, 0x19C).unwrap(), 0x8800_0000);
        bus.close();
        assert!(matches!(bus.read_msr(0, 0x19C), Err(Error::BusClosed)));
        assert!(matches!(bus.lock_isa().err(), Some(Error::BusClosed)));

        bus.reopen();
        assert_eq!(bus.read_msr(0, 0x19C).unwrap(), 0x8800_0000);
    }

    #[test]
    fn test_smn_roundtrip() {
        let (bus, sim) = bus();
        sim.set_smn(0x59800, 0x1234_5678);
        let pci = bus.lock_pci().unwrap();
        assert_eq!(pci.read_smn(0x59800).unwrap(), 0x1234_5678);
        pci.write_smn(0x59804, 7).unwrap();
        drop(pci);
        assert_eq!(sim.smn(0x59804), Some(7));
    }

    #[test]
    fn test_find_pci_devices() {
        let (bus, sim) = bus();
        sim.add_pci_device(PciAddress::new(0, 0x19, 3), 0x1022, 0x1103);
        sim.add_pci_device(PciAddress::new(0, 0x18, 3), 0x1022, 0x1103);
        sim.add_pci_device(PciAddress::new(0, 0x18, 4), 0x1022, 0x1104);
        let found = bus.find_pci_devices(0x1022, 0x1103).unwrap();
        assert_eq!(
            found,
            vec![PciAddress::new(0, 0x18, 3), PciAddress::new(0, 0x19, 3)]
        );
        assert_eq!(found[0].to_string(), "00:18.3");
    }

    #[test]
    fn test_unsupported_driver() {
        let bus = Bus::new(UnsupportedBus, Duration::from_millis(1));
        assert!(matches!(bus.read_msr(0, 0x10), Err(Error::NotSupported(_))));
        assert!(bus.find_pci_devices(0x8086, 0x0001).unwrap().is_empty());
    }
}
