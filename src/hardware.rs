//! Hardware tree nodes
//!
//! Every device is a [`Hardware`] node owning its sensors and sub-hardware.
//! Concrete nodes embed a [`HardwareBase`] that carries the shared state and
//! queues [`HardwareEvent`]s for the consumer.

use crate::control::{Control, ControlRequest};
use crate::error::{Error, Result};
use crate::identifier::Identifier;
use crate::sensor::{default_history_window, Sensor, SensorType};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write as _;

/// Type of hardware component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardwareType {
    Motherboard,
    SuperIo,
    Cpu,
    Memory,
    GpuNvidia,
    GpuAmd,
    GpuIntel,
    Storage,
}

impl fmt::Display for HardwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Tree change notifications, drained with [`Hardware::take_events`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HardwareEvent {
    HardwareAdded(Identifier),
    HardwareRemoved(Identifier),
    SensorAdded(Identifier),
    SensorRemoved(Identifier),
}

/// Shared state of a hardware node
#[derive(Debug)]
pub struct HardwareBase {
    identifier: Identifier,
    default_name: String,
    name: String,
    hardware_type: HardwareType,
    sensors: Vec<Sensor>,
    events: Vec<HardwareEvent>,
    window: Duration,
}

impl HardwareBase {
    pub fn new(name: impl Into<String>, identifier: Identifier, hardware_type: HardwareType) -> Self {
        let name = name.into();
        Self {
            identifier,
            default_name: name.clone(),
            name,
            hardware_type,
            sensors: Vec::new(),
            events: Vec::new(),
            window: default_history_window(),
        }
    }

    /// History window used for sensors created after this call
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.name = if name.is_empty() {
            self.default_name.clone()
        } else {
            name
        };
    }

    pub fn hardware_type(&self) -> HardwareType {
        self.hardware_type
    }

    /// Create an inactive sensor and return its slot
    pub fn add_sensor(&mut self, name: impl Into<String>, index: usize, sensor_type: SensorType) -> usize {
        let sensor = Sensor::new(&self.identifier, name, index, sensor_type).with_window(self.window);
        self.push_sensor(sensor)
    }

    /// Adopt a prebuilt sensor (e.g. one carrying parameters)
    pub fn push_sensor(&mut self, sensor: Sensor) -> usize {
        self.sensors.push(sensor);
        self.sensors.len() - 1
    }

    /// Sensor builder bound to this node's identifier and history window
    pub fn sensor(&self, name: impl Into<String>, index: usize, sensor_type: SensorType) -> Sensor {
        Sensor::new(&self.identifier, name, index, sensor_type).with_window(self.window)
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    pub fn sensors_mut(&mut self) -> &mut [Sensor] {
        &mut self.sensors
    }

    pub fn get(&self, slot: usize) -> Option<&Sensor> {
        self.sensors.get(slot)
    }

    pub fn activate(&mut self, slot: usize) {
        if let Some(sensor) = self.sensors.get_mut(slot) {
            if !sensor.is_active() {
                sensor.set_active(true);
                self.events
                    .push(HardwareEvent::SensorAdded(sensor.identifier().clone()));
            }
        }
    }

    pub fn deactivate(&mut self, slot: usize) {
        if let Some(sensor) = self.sensors.get_mut(slot) {
            if sensor.is_active() {
                sensor.set_active(false);
                self.events
                    .push(HardwareEvent::SensorRemoved(sensor.identifier().clone()));
            }
        }
    }

    /// Record a reading without touching activation
    pub fn record(&mut self, slot: usize, value: Option<f32>) {
        self.record_at(slot, value, Utc::now());
    }

    pub fn record_at(&mut self, slot: usize, value: Option<f32>, now: DateTime<Utc>) {
        if let Some(sensor) = self.sensors.get_mut(slot) {
            sensor.set_value_at(value, now);
        }
    }

    /// Record a reading and activate the sensor on its first valid value
    pub fn publish(&mut self, slot: usize, value: Option<f32>) {
        self.record(slot, value);
        if value.is_some_and(f32::is_finite) {
            self.activate(slot);
        }
    }

    /// Mark every sensor unavailable for this cycle
    pub fn invalidate_all(&mut self) {
        let now = Utc::now();
        for sensor in &mut self.sensors {
            sensor.set_value_at(None, now);
        }
    }

    /// Deactivate all sensors and emit the matching events
    pub fn teardown(&mut self) {
        for slot in 0..self.sensors.len() {
            self.deactivate(slot);
        }
    }

    pub fn take_events(&mut self) -> Vec<HardwareEvent> {
        std::mem::take(&mut self.events)
    }

    /// Plain-text sensor listing used by the default report
    pub fn report(&self) -> String {
        let mut r = String::new();
        let _ = writeln!(r, "{} ({})", self.name, self.identifier);
        for sensor in &self.sensors {
            let _ = writeln!(
                r,
                "|  {:<32} : {:>10} {:>10} {:>10} ({})",
                sensor.name(),
                fmt_value(sensor.value()),
                fmt_value(sensor.min()),
                fmt_value(sensor.max()),
                sensor.identifier()
            );
        }
        r
    }
}

fn fmt_value(v: Option<f32>) -> String {
    v.map(|v| format!("{:.3}", v)).unwrap_or_else(|| "-".into())
}

/// A node in the hardware tree
pub trait Hardware: Send {
    fn base(&self) -> &HardwareBase;

    fn base_mut(&mut self) -> &mut HardwareBase;

    /// Re-read all sensors; cheap and bounded
    fn update(&mut self);

    fn name(&self) -> &str {
        self.base().name()
    }

    fn set_name(&mut self, name: &str) {
        self.base_mut().set_name(name);
    }

    fn identifier(&self) -> &Identifier {
        self.base().identifier()
    }

    fn hardware_type(&self) -> HardwareType {
        self.base().hardware_type()
    }

    fn sensors(&self) -> &[Sensor] {
        self.base().sensors()
    }

    fn sub_hardware(&self) -> Vec<&dyn Hardware> {
        Vec::new()
    }

    fn sub_hardware_mut(&mut self) -> Vec<&mut dyn Hardware> {
        Vec::new()
    }

    fn controls(&self) -> &[Control] {
        &[]
    }

    fn set_control(&mut self, identifier: &Identifier, _request: ControlRequest) -> Result<()> {
        Err(Error::NotSupported(format!("no control {}", identifier)))
    }

    /// Revert controls and release resources; must complete even after earlier failures
    fn close(&mut self) -> Result<()> {
        let mut first = None;
        for sub in self.sub_hardware_mut() {
            if let Err(e) = sub.close() {
                first.get_or_insert(e);
            }
        }
        self.base_mut().teardown();
        first.map_or(Ok(()), Err)
    }

    /// Diagnostic report for this node and its sub-hardware
    fn report(&self) -> String {
        let mut r = self.base().report();
        for sub in self.sub_hardware() {
            r.push_str(&sub.report());
        }
        r
    }

    /// Drain queued events from this node and its sub-hardware
    fn take_events(&mut self) -> Vec<HardwareEvent> {
        let mut events = self.base_mut().take_events();
        for sub in self.sub_hardware_mut() {
            events.extend(sub.take_events());
        }
        events
    }
}

/// Run `update` on a node and then its sub-hardware
pub fn update_tree(hardware: &mut dyn Hardware) {
    hardware.update();
    for sub in hardware.sub_hardware_mut() {
        update_tree(sub);
    }
}

/// Depth-first visit of a node and its sub-hardware
pub fn visit<'a>(hardware: &'a dyn Hardware, f: &mut dyn FnMut(&'a dyn Hardware)) {
    f(hardware);
    for sub in hardware.sub_hardware() {
        visit(sub, f);
    }
}

/// Serializable view of one sensor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub identifier: Identifier,
    pub name: String,
    pub sensor_type: SensorType,
    pub value: Option<f32>,
    pub min: Option<f32>,
    pub max: Option<f32>,
}

/// Serializable view of a hardware subtree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    pub identifier: Identifier,
    pub name: String,
    pub hardware_type: HardwareType,
    pub sensors: Vec<SensorSnapshot>,
    pub sub_hardware: Vec<HardwareSnapshot>,
}

impl HardwareSnapshot {
    pub fn capture(hardware: &dyn Hardware) -> Self {
        Self {
            identifier: hardware.identifier().clone(),
            name: hardware.name().to_string(),
            hardware_type: hardware.hardware_type(),
            sensors: hardware
                .sensors()
                .iter()
                .filter(|s| s.is_active() && !s.is_hidden())
                .map(|s| SensorSnapshot {
                    identifier: s.identifier().clone(),
                    name: s.name().to_string(),
                    sensor_type: s.sensor_type(),
                    value: s.value(),
                    min: s.min(),
                    max: s.max(),
                })
                .collect(),
            sub_hardware: hardware
                .sub_hardware()
                .into_iter()
                .map(HardwareSnapshot::capture)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        base: HardwareBase,
        child: Option<Box<Probe>>,
        updates: usize,
    }

    impl Probe {
        fn new(name: &str) -> Self {
            let mut base = HardwareBase::new(name, Identifier::new([name]), HardwareType::Memory);
            base.add_sensor("Load", 0, SensorType::Load);
            Self {
                base,
                child: None,
                updates: 0,
            }
        }
    }

    impl Hardware for Probe {
        fn base(&self) -> &HardwareBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut HardwareBase {
            &mut self.base
        }

        fn update(&mut self) {
            self.updates += 1;
            self.base.publish(0, Some(self.updates as f32));
        }

        fn sub_hardware(&self) -> Vec<&dyn Hardware> {
            self.child.iter().map(|c| &**c as &dyn Hardware).collect()
        }

        fn sub_hardware_mut(&mut self) -> Vec<&mut dyn Hardware> {
            self.child
                .iter_mut()
                .map(|c| &mut **c as &mut dyn Hardware)
                .collect()
        }
    }

    #[test]
    fn test_publish_activates_once() {
        let mut p = Probe::new("ram");
        p.base.publish(0, None);
        assert!(!p.sensors()[0].is_active());
        p.update();
        p.update();
        let events = p.take_events();
        assert_eq!(
            events,
            vec![HardwareEvent::SensorAdded(Identifier::new(["ram", "load", "0"]))]
        );
    }

    #[test]
    fn test_tree_update_and_close() {
        let mut p = Probe::new("board");
        p.child = Some(Box::new(Probe::new("lpc")));
        update_tree(&mut p);
        assert_eq!(p.child.as_ref().unwrap().updates, 1);
        assert_eq!(p.take_events().len(), 2);

        p.close().unwrap();
        let events = p.take_events();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, HardwareEvent::SensorRemoved(_))));
    }

    #[test]
    fn test_snapshot_skips_inactive() {
        let mut p = Probe::new("ram");
        p.base.add_sensor("Used", 0, SensorType::Data);
        p.update();
        let snap = HardwareSnapshot::capture(&p);
        assert_eq!(snap.sensors.len(), 1);
        assert_eq!(snap.sensors[0].value, Some(1.0));
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"/ram/load/0\""));
    }

    #[test]
    fn test_name_override_and_report() {
        let mut p = Probe::new("ram");
        p.set_name("Memory");
        assert_eq!(p.name(), "Memory");
        p.set_name("");
        assert_eq!(p.name(), "ram");
        assert!(p.report().contains("(/ram/load/0)"));
    }
}
