//! User-tunable calibration values bound to a sensor

use crate::identifier::Identifier;
use serde::{Deserialize, Serialize};

/// Static description of a parameter, declared by the decoder that owns the sensor
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDescription {
    pub name: &'static str,
    pub description: &'static str,
    pub default: f32,
}

impl ParameterDescription {
    pub const fn new(name: &'static str, description: &'static str, default: f32) -> Self {
        Self {
            name,
            description,
            default,
        }
    }
}

/// Named float with a default and an optional user override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    identifier: Identifier,
    name: String,
    description: String,
    default: f32,
    value: Option<f32>,
}

impl Parameter {
    pub fn new(sensor: &Identifier, description: &ParameterDescription) -> Self {
        Self {
            identifier: sensor.join(["parameter", description.name]),
            name: description.name.to_string(),
            description: description.description.to_string(),
            default: description.default,
            value: None,
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn default_value(&self) -> f32 {
        self.default
    }

    /// Effective value: the override if set, otherwise the default
    pub fn value(&self) -> f32 {
        self.value.unwrap_or(self.default)
    }

    pub fn is_default(&self) -> bool {
        self.value.is_none()
    }

    pub fn set_value(&mut self, value: f32) {
        if value.is_finite() {
            self.value = Some(value);
        }
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TJMAX: ParameterDescription = ParameterDescription::new(
        "TjMax [°C]",
        "TjMax temperature of the core sensor.",
        100.0,
    );

    #[test]
    fn test_override_and_reset() {
        let sensor = Identifier::new(["intelcpu", "0", "temperature", "0"]);
        let mut p = Parameter::new(&sensor, &TJMAX);
        assert!(p.is_default());
        assert_eq!(p.value(), 100.0);
        assert_eq!(
            p.identifier().as_str(),
            "/intelcpu/0/temperature/0/parameter/TjMax [°C]"
        );

        p.set_value(95.0);
        assert!(!p.is_default());
        assert_eq!(p.value(), 95.0);

        p.set_value(f32::NAN);
        assert_eq!(p.value(), 95.0);

        p.reset();
        assert!(p.is_default());
        assert_eq!(p.value(), 100.0);
    }
}
