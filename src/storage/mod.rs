//! Storage drives
//!
//! One [`StorageDrive`] per disk reported by the [`SmartApi`]. Drives come
//! and go at runtime; [`StorageGroup`] diffs the enumeration every cycle and
//! reports the changes as [`HardwareEvent`]s.

pub mod smart;

pub use smart::{DriveIdentity, DriveKind, LinuxSmartApi, SmartApi, SmartAttribute};

use crate::computer::Group;
use crate::hardware::{Hardware, HardwareBase, HardwareEvent, HardwareType};
use crate::identifier::Identifier;
use crate::sensor::SensorType;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::Arc;

/// SMART access shared by every drive of a group
pub type SharedSmartApi = Arc<Mutex<Box<dyn SmartApi>>>;

const SECTOR_BYTES: f64 = 512.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

pub struct StorageDrive {
    base: HardwareBase,
    api: SharedSmartApi,
    identity: DriveIdentity,
    attributes: Vec<SmartAttribute>,
    temperature: usize,
    remaining_life: usize,
    power_on_hours: usize,
    bytes_read: usize,
    bytes_written: usize,
}

impl StorageDrive {
    pub fn new(api: SharedSmartApi, identity: DriveIdentity, index: usize, window: chrono::Duration) -> Self {
        let mut base = HardwareBase::new(
            identity.model.clone(),
            Identifier::new(["hdd".to_string(), index.to_string()]),
            HardwareType::Storage,
        )
        .with_window(window);
        let temperature = base.add_sensor("Temperature", 0, SensorType::Temperature);
        let remaining_life = base.add_sensor("Remaining Life", 0, SensorType::Level);
        let power_on_hours = base.add_sensor("Power-On Hours", 0, SensorType::Factor);
        let bytes_read = base.add_sensor("Total Bytes Read", 0, SensorType::Data);
        let bytes_written = base.add_sensor("Total Bytes Written", 1, SensorType::Data);
        Self {
            base,
            api,
            identity,
            attributes: Vec::new(),
            temperature,
            remaining_life,
            power_on_hours,
            bytes_read,
            bytes_written,
        }
    }

    pub fn identity(&self) -> &DriveIdentity {
        &self.identity
    }

    pub fn attributes(&self) -> &[SmartAttribute] {
        &self.attributes
    }

    fn total_gb(&self, id: u8) -> Option<f32> {
        smart::find(&self.attributes, id).map(|a| (a.raw_value() as f64 * SECTOR_BYTES / BYTES_PER_GB) as f32)
    }
}

impl Hardware for StorageDrive {
    fn base(&self) -> &HardwareBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HardwareBase {
        &mut self.base
    }

    fn update(&mut self) {
        let drive = self.identity.id.clone();
        let mut api = self.api.lock();
        self.attributes = match api.read_smart_data(&drive) {
            Ok(data) => smart::parse_attribute_table(&data),
            Err(e) => {
                trace!("{}: SMART data unavailable: {}", drive, e);
                Vec::new()
            }
        };
        let temperature = smart::temperature(&self.attributes).or_else(|| api.temperature(&drive).ok());
        drop(api);

        let remaining_life = smart::remaining_life(&self.attributes);
        let power_on = smart::find(&self.attributes, smart::POWER_ON_HOURS).map(|a| a.raw_value() as f32);
        let read = self.total_gb(smart::TOTAL_LBAS_READ);
        let written = self.total_gb(smart::TOTAL_LBAS_WRITTEN);

        self.base.publish(self.temperature, temperature);
        self.base.publish(self.remaining_life, remaining_life);
        self.base.publish(self.power_on_hours, power_on);
        self.base.publish(self.bytes_read, read);
        self.base.publish(self.bytes_written, written);
    }

    fn report(&self) -> String {
        let mut r = self.base.report();
        let _ = writeln!(r, "Drive: {} ({:?})", self.identity.id, self.identity.kind);
        if let Some(serial) = &self.identity.serial {
            let _ = writeln!(r, "Serial: {}", serial);
        }
        if let Some(firmware) = &self.identity.firmware {
            let _ = writeln!(r, "Firmware: {}", firmware);
        }
        if !self.attributes.is_empty() {
            let _ = writeln!(r, " ID  Flags Cur Wst Raw");
            for a in &self.attributes {
                let _ = writeln!(
                    r,
                    " {:02X}  {:04X}  {:>3} {:>3} {:012X}",
                    a.id,
                    a.flags,
                    a.current,
                    a.worst,
                    a.raw_value()
                );
            }
        }
        r
    }
}

/// Every drive the SMART driver enumerates
pub struct StorageGroup {
    api: SharedSmartApi,
    window: chrono::Duration,
    /// Tracked drives in index order
    drives: Vec<(usize, StorageDrive)>,
}

impl StorageGroup {
    pub fn open(api: Box<dyn SmartApi>, window: chrono::Duration) -> Self {
        let mut group = Self {
            api: Arc::new(Mutex::new(api)),
            window,
            drives: Vec::new(),
        };
        group.sync();
        for (_, drive) in &group.drives {
            info!("Found drive {} ({})", drive.name(), drive.identifier());
        }
        group
    }

    fn free_index(&self) -> usize {
        (0..)
            .find(|i| !self.drives.iter().any(|(index, _)| index == i))
            .unwrap_or(self.drives.len())
    }

    /// Diff the enumeration against the tracked drives
    fn sync(&mut self) -> Vec<HardwareEvent> {
        let present = match self.api.lock().enumerate() {
            Ok(present) => present,
            Err(e) => {
                debug!("Drive enumeration failed: {}", e);
                return Vec::new();
            }
        };
        let mut events = Vec::new();

        let mut kept = Vec::with_capacity(self.drives.len());
        for (index, mut drive) in self.drives.drain(..) {
            if present.contains(&drive.identity.id) {
                kept.push((index, drive));
                continue;
            }
            info!("Drive {} removed", drive.identity.id);
            if let Err(e) = drive.close() {
                warn!("closing {} failed: {}", drive.identifier(), e);
            }
            events.extend(drive.take_events());
            events.push(HardwareEvent::HardwareRemoved(drive.identifier().clone()));
        }
        self.drives = kept;

        for id in present {
            if self.drives.iter().any(|(_, d)| d.identity.id == id) {
                continue;
            }
            let identity = match self.api.lock().identify(&id) {
                Ok(identity) => identity,
                Err(e) => {
                    debug!("Cannot identify {}: {}", id, e);
                    continue;
                }
            };
            let index = self.free_index();
            let drive = StorageDrive::new(self.api.clone(), identity, index, self.window);
            events.push(HardwareEvent::HardwareAdded(drive.identifier().clone()));
            self.drives.push((index, drive));
        }
        self.drives.sort_by_key(|(index, _)| *index);
        events
    }
}

impl Group for StorageGroup {
    fn hardware(&self) -> Vec<&dyn Hardware> {
        self.drives.iter().map(|(_, d)| d as &dyn Hardware).collect()
    }

    fn hardware_mut(&mut self) -> Vec<&mut dyn Hardware> {
        self.drives
            .iter_mut()
            .map(|(_, d)| d as &mut dyn Hardware)
            .collect()
    }

    fn reconcile(&mut self) -> Vec<HardwareEvent> {
        self.sync()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use std::collections::BTreeMap;

    /// In-memory drive table; clones share state
    #[derive(Clone, Default)]
    pub(crate) struct FakeSmart {
        pub(crate) drives: Arc<Mutex<BTreeMap<String, Option<Vec<u8>>>>>,
    }

    impl FakeSmart {
        pub(crate) fn insert(&self, id: &str, data: Option<Vec<u8>>) {
            self.drives.lock().insert(id.to_string(), data);
        }

        pub(crate) fn remove(&self, id: &str) {
            self.drives.lock().remove(id);
        }
    }

    impl SmartApi for FakeSmart {
        fn enumerate(&mut self) -> Result<Vec<String>> {
            Ok(self.drives.lock().keys().cloned().collect())
        }

        fn identify(&mut self, drive: &str) -> Result<DriveIdentity> {
            if !self.drives.lock().contains_key(drive) {
                return Err(Error::DeviceNotFound(drive.to_string()));
            }
            Ok(DriveIdentity {
                id: drive.to_string(),
                model: format!("Model {}", drive),
                serial: Some("S123".into()),
                firmware: None,
                kind: DriveKind::Ssd,
            })
        }

        fn read_smart_data(&mut self, drive: &str) -> Result<Vec<u8>> {
            self.drives
                .lock()
                .get(drive)
                .cloned()
                .flatten()
                .ok_or_else(|| Error::NotSupported(drive.to_string()))
        }

        fn temperature(&mut self, _drive: &str) -> Result<f32> {
            Ok(29.0)
        }
    }

    #[test]
    fn test_drive_sensors() {
        let fake = FakeSmart::default();
        fake.insert(
            "sda",
            Some(smart::tests::page(&[
                (smart::TEMPERATURE, 100, 38),
                (smart::POWER_ON_HOURS, 99, 1000),
                (0xE9, 95, 0),
                (smart::TOTAL_LBAS_WRITTEN, 100, 2 * 1024 * 1024 * 2),
            ])),
        );
        let mut group = StorageGroup::open(Box::new(fake), chrono::Duration::hours(1));
        let mut drives = group.hardware_mut();
        assert_eq!(drives.len(), 1);
        drives[0].update();

        let sensors = drives[0].sensors();
        assert_eq!(drives[0].name(), "Model sda");
        assert_eq!(sensors[0].identifier().as_str(), "/hdd/0/temperature/0");
        assert_eq!(sensors[0].value(), Some(38.0));
        assert_eq!(sensors[1].value(), Some(95.0));
        assert_eq!(sensors[2].value(), Some(1000.0));
        assert!(!sensors[3].is_active());
        assert_eq!(sensors[4].value(), Some(2.0));
        assert!(drives[0].report().contains(" 09  0032"));
    }

    #[test]
    fn test_temperature_fallback() {
        let fake = FakeSmart::default();
        fake.insert("nvme0n1", None);
        let mut group = StorageGroup::open(Box::new(fake), chrono::Duration::hours(1));
        let mut drives = group.hardware_mut();
        drives[0].update();
        assert_eq!(drives[0].sensors()[0].value(), Some(29.0));
        assert!(!drives[0].sensors()[1].is_active());
    }

    #[test]
    fn test_hot_plug() {
        let fake = FakeSmart::default();
        fake.insert("sda", None);
        fake.insert("sdb", None);
        let mut group = StorageGroup::open(Box::new(fake.clone()), chrono::Duration::hours(1));
        assert!(group.reconcile().is_empty());
        for drive in group.hardware_mut() {
            drive.update();
            drive.take_events();
        }

        fake.remove("sda");
        let events = group.reconcile();
        assert_eq!(
            events,
            vec![
                HardwareEvent::SensorRemoved(Identifier::new(["hdd", "0", "temperature", "0"])),
                HardwareEvent::HardwareRemoved(Identifier::new(["hdd", "0"])),
            ]
        );

        // the freed index is reused
        fake.insert("sdc", None);
        let events = group.reconcile();
        assert_eq!(events, vec![HardwareEvent::HardwareAdded(Identifier::new(["hdd", "0"]))]);
        let names: Vec<_> = group.hardware().iter().map(|d| d.name().to_string()).collect();
        assert_eq!(names, vec!["Model sdc", "Model sdb"]);
    }
}
