//! Persistent user settings keyed by identifier strings
//!
//! Entities are plain data; [`apply`] hydrates a tree from a store and
//! [`persist`] writes it back. Keys:
//!
//! - `<hardware-id>/name`
//! - `<sensor-id>/name`, `<sensor-id>/hidden`
//! - `<parameter-id>` for parameter overrides
//! - `<control-id>/mode`, `<control-id>/value`

use crate::control::{ControlMode, ControlRequest};
use crate::error::Result;
use crate::hardware::Hardware;
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Key/value store contract
pub trait Settings {
    fn get_value(&self, key: &str) -> Option<String>;

    fn set_value(&mut self, key: &str, value: &str);

    fn contains(&self, key: &str) -> bool {
        self.get_value(key).is_some()
    }

    fn remove(&mut self, key: &str);
}

/// In-memory settings
#[derive(Debug, Default, Clone)]
pub struct MemorySettings {
    values: HashMap<String, String>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Settings for MemorySettings {
    fn get_value(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set_value(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }
}

/// Flat TOML table of string values, written on [`FileSettings::save`]
#[derive(Debug, Clone)]
pub struct FileSettings {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl FileSettings {
    /// Load from `path`; a missing file yields an empty store
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            toml::from_str(&contents)?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let contents = toml::to_string_pretty(&self.values)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}

impl Settings for FileSettings {
    fn get_value(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set_value(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }
}

fn get_f32(settings: &dyn Settings, key: &str) -> Option<f32> {
    settings.get_value(key)?.parse().ok()
}

/// Hydrate a hardware subtree from `settings`
pub fn apply(hardware: &mut dyn Hardware, settings: &dyn Settings) {
    let hw_key = format!("{}/name", hardware.identifier());
    if let Some(name) = settings.get_value(&hw_key) {
        hardware.set_name(&name);
    }

    for sensor in hardware.base_mut().sensors_mut() {
        let id = sensor.identifier().to_string();
        if let Some(name) = settings.get_value(&format!("{}/name", id)) {
            sensor.set_name(name);
        }
        if let Some(hidden) = settings.get_value(&format!("{}/hidden", id)) {
            sensor.set_hidden(hidden == "true");
        }
        for parameter in sensor.parameters_mut() {
            if let Some(value) = get_f32(settings, parameter.identifier().as_str()) {
                parameter.set_value(value);
            }
        }
    }

    let requests: Vec<_> = hardware
        .controls()
        .iter()
        .filter_map(|control| {
            let id = control.identifier();
            let mode = settings.get_value(&format!("{}/mode", id))?;
            match mode.parse::<ControlMode>().ok()? {
                ControlMode::Software => {
                    let value = get_f32(settings, &format!("{}/value", id))?;
                    Some((id.clone(), ControlRequest::Software(value)))
                }
                ControlMode::Default => Some((id.clone(), ControlRequest::Default)),
                ControlMode::Undefined => None,
            }
        })
        .collect();
    for (id, request) in requests {
        debug!("Restoring control {} to {:?}", id, request);
        if let Err(e) = hardware.set_control(&id, request) {
            warn!("Failed to restore control {}: {}", id, e);
        }
    }

    for sub in hardware.sub_hardware_mut() {
        apply(sub, settings);
    }
}

/// Write a hardware subtree's user state into `settings`
pub fn persist(hardware: &dyn Hardware, settings: &mut dyn Settings) {
    let hw_key = format!("{}/name", hardware.identifier());
    if hardware.name() != hardware.base().default_name() {
        settings.set_value(&hw_key, hardware.name());
    } else {
        settings.remove(&hw_key);
    }

    for sensor in hardware.sensors() {
        let id = sensor.identifier().to_string();
        let name_key = format!("{}/name", id);
        if sensor.name() != sensor.default_name() {
            settings.set_value(&name_key, sensor.name());
        } else {
            settings.remove(&name_key);
        }
        let hidden_key = format!("{}/hidden", id);
        if sensor.is_hidden() {
            settings.set_value(&hidden_key, "true");
        } else {
            settings.remove(&hidden_key);
        }
        for parameter in sensor.parameters() {
            let key = parameter.identifier().as_str();
            if parameter.is_default() {
                settings.remove(key);
            } else {
                settings.set_value(key, &parameter.value().to_string());
            }
        }
    }

    for control in hardware.controls() {
        let id = control.identifier();
        settings.set_value(&format!("{}/mode", id), &control.mode().to_string());
        settings.set_value(
            &format!("{}/value", id),
            &control.software_value().to_string(),
        );
    }

    for sub in hardware.sub_hardware() {
        persist(sub, settings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{HardwareBase, HardwareType};
    use crate::identifier::Identifier;
    use crate::parameter::ParameterDescription;
    use crate::sensor::SensorType;

    const OFFSET: ParameterDescription = ParameterDescription::new("Offset [°C]", "Offset.", 0.0);

    struct Board {
        base: HardwareBase,
    }

    impl Board {
        fn new() -> Self {
            let mut base = HardwareBase::new(
                "Board",
                Identifier::new(["motherboard"]),
                HardwareType::Motherboard,
            );
            let sensor = base
                .sensor("Temperature #1", 0, SensorType::Temperature)
                .with_parameters(&[OFFSET]);
            base.push_sensor(sensor);
            Self { base }
        }
    }

    impl Hardware for Board {
        fn base(&self) -> &HardwareBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut HardwareBase {
            &mut self.base
        }

        fn update(&mut self) {}
    }

    #[test]
    fn test_persist_then_apply() {
        let mut board = Board::new();
        board.set_name("My Board");
        board.base.sensors_mut()[0].set_name("Chipset");
        board.base.sensors_mut()[0].set_hidden(true);
        board.base.sensors_mut()[0].parameters_mut()[0].set_value(-2.5);

        let mut settings = MemorySettings::new();
        persist(&board, &mut settings);
        assert_eq!(settings.len(), 4);

        let mut fresh = Board::new();
        apply(&mut fresh, &settings);
        assert_eq!(fresh.name(), "My Board");
        let sensor = &fresh.sensors()[0];
        assert_eq!(sensor.name(), "Chipset");
        assert!(sensor.is_hidden());
        assert_eq!(sensor.parameters()[0].value(), -2.5);
    }

    #[test]
    fn test_defaults_are_not_stored() {
        let board = Board::new();
        let mut settings = MemorySettings::new();
        settings.set_value("/motherboard/name", "stale");
        persist(&board, &mut settings);
        assert!(settings.is_empty());
    }

    #[test]
    fn test_file_settings_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");

        let mut settings = FileSettings::load(&path).unwrap();
        assert!(!settings.contains("/ram/name"));
        settings.set_value("/ram/name", "Memory");
        settings.set_value("/lpc/nct6798d/0/control/1/control/mode", "software");
        settings.save().unwrap();

        let reloaded = FileSettings::load(&path).unwrap();
        assert_eq!(reloaded.get_value("/ram/name").as_deref(), Some("Memory"));
        assert!(reloaded.contains("/lpc/nct6798d/0/control/1/control/mode"));
    }
}
