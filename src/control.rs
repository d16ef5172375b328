//! Revertible writable actuators (fan PWM)
//!
//! A [`Control`] is bound 1:1 to a Control-type sensor. Mode transitions only
//! happen through [`Control::set_software`] and [`Control::set_default`], and
//! both write the hardware before recording the new mode, so a failed write
//! leaves the recorded mode untouched.

use crate::error::{Error, Result};
use crate::identifier::Identifier;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMode {
    Undefined,
    Default,
    Software,
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControlMode::Undefined => "undefined",
            ControlMode::Default => "default",
            ControlMode::Software => "software",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ControlMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "undefined" => Ok(ControlMode::Undefined),
            "default" => Ok(ControlMode::Default),
            "software" => Ok(ControlMode::Software),
            other => Err(Error::Parse(format!("unknown control mode '{}'", other))),
        }
    }
}

/// A requested mode change, routed to the owning hardware
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlRequest {
    Default,
    Software(f32),
}

/// Hardware side of a control: performs the register write
pub trait ControlActuator {
    /// Apply `Some(percent)` as a manual duty, or `None` to restore the firmware default
    fn apply(&mut self, index: usize, value: Option<f32>) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Control {
    identifier: Identifier,
    index: usize,
    mode: ControlMode,
    software_value: f32,
    min_software_value: f32,
    max_software_value: f32,
}

impl Control {
    /// Control bound to the sensor with `sensor` identifier
    pub fn new(sensor: &Identifier, index: usize, min: f32, max: f32) -> Self {
        Self {
            identifier: sensor.child("control"),
            index,
            mode: ControlMode::Undefined,
            software_value: min,
            min_software_value: min,
            max_software_value: max,
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    pub fn software_value(&self) -> f32 {
        self.software_value
    }

    pub fn min_software_value(&self) -> f32 {
        self.min_software_value
    }

    pub fn max_software_value(&self) -> f32 {
        self.max_software_value
    }

    fn failure(&self, err: Error) -> Error {
        match err {
            e @ Error::Control { .. } => e,
            e => Error::Control {
                identifier: self.identifier.to_string(),
                reason: e.to_string(),
            },
        }
    }

    /// Switch to manual duty `value`
    pub fn set_software(&mut self, value: f32, actuator: &mut dyn ControlActuator) -> Result<()> {
        if !value.is_finite()
            || value < self.min_software_value
            || value > self.max_software_value
        {
            return Err(Error::InvalidValue(format!(
                "{} outside [{}, {}] for {}",
                value, self.min_software_value, self.max_software_value, self.identifier
            )));
        }
        actuator
            .apply(self.index, Some(value))
            .map_err(|e| self.failure(e))?;
        self.software_value = value;
        self.mode = ControlMode::Software;
        Ok(())
    }

    /// Hand the actuator back to firmware control
    pub fn set_default(&mut self, actuator: &mut dyn ControlActuator) -> Result<()> {
        actuator
            .apply(self.index, None)
            .map_err(|e| self.failure(e))?;
        self.mode = ControlMode::Default;
        Ok(())
    }

    pub fn request(&mut self, request: ControlRequest, actuator: &mut dyn ControlActuator) -> Result<()> {
        match request {
            ControlRequest::Default => self.set_default(actuator),
            ControlRequest::Software(v) => self.set_software(v, actuator),
        }
    }

    /// Revert to default if the control was ever touched
    pub fn revert(&mut self, actuator: &mut dyn ControlActuator) -> Result<()> {
        if self.mode == ControlMode::Undefined {
            return Ok(());
        }
        self.set_default(actuator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        writes: Vec<(usize, Option<f32>)>,
        fail: bool,
    }

    impl ControlActuator for Recorder {
        fn apply(&mut self, index: usize, value: Option<f32>) -> Result<()> {
            if self.fail {
                return Err(Error::BusTimeout("isa"));
            }
            self.writes.push((index, value));
            Ok(())
        }
    }

    fn control() -> Control {
        Control::new(&Identifier::new(["lpc", "it8712f", "0", "control", "1"]), 1, 0.0, 100.0)
    }

    #[test]
    fn test_mode_transitions_write_first() {
        let mut c = control();
        let mut hw = Recorder::default();
        assert_eq!(c.mode(), ControlMode::Undefined);

        c.set_software(40.0, &mut hw).unwrap();
        assert_eq!(c.mode(), ControlMode::Software);
        assert_eq!(c.software_value(), 40.0);

        c.set_default(&mut hw).unwrap();
        assert_eq!(c.mode(), ControlMode::Default);
        assert_eq!(hw.writes, vec![(1, Some(40.0)), (1, None)]);
    }

    #[test]
    fn test_failed_write_keeps_mode() {
        let mut c = control();
        let mut hw = Recorder {
            fail: true,
            ..Default::default()
        };
        let err = c.set_software(40.0, &mut hw).unwrap_err();
        assert!(matches!(err, Error::Control { .. }));
        assert_eq!(c.mode(), ControlMode::Undefined);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut c = control();
        let mut hw = Recorder::default();
        assert!(c.set_software(120.0, &mut hw).is_err());
        assert!(hw.writes.is_empty());
    }

    #[test]
    fn test_revert_untouched_is_noop() {
        let mut c = control();
        let mut hw = Recorder::default();
        c.revert(&mut hw).unwrap();
        assert!(hw.writes.is_empty());

        c.request(ControlRequest::Software(10.0), &mut hw).unwrap();
        c.revert(&mut hw).unwrap();
        assert_eq!(c.mode(), ControlMode::Default);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("software".parse::<ControlMode>().unwrap(), ControlMode::Software);
        assert!("manual".parse::<ControlMode>().is_err());
    }
}
