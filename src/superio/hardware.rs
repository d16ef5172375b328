//! Super-I/O hardware node
//!
//! Wraps one [`SuperIoChip`] decoder: builds the sensor set from the chip's
//! array sizes, applies the per-sensor calibration parameters on every
//! update and routes control requests to the chip's PWM registers.

use super::SuperIoChip;
use crate::control::{Control, ControlActuator, ControlRequest};
use crate::error::{Error, Result};
use crate::hardware::{Hardware, HardwareBase, HardwareType};
use crate::identifier::Identifier;
use crate::parameter::ParameterDescription;
use crate::sensor::SensorType;
use log::{debug, trace, warn};

const VOLTAGE_PARAMETERS: [ParameterDescription; 3] = [
    ParameterDescription::new("Ri [kΩ]", "Input resistance.", 0.0),
    ParameterDescription::new("Rf [kΩ]", "Reference resistance.", 1.0),
    ParameterDescription::new("Vf [V]", "Reference voltage.", 0.0),
];

const TEMPERATURE_PARAMETERS: [ParameterDescription; 1] =
    [ParameterDescription::new("Offset [°C]", "Temperature offset.", 0.0)];

/// Resistor-divider correction of a raw pin voltage
fn scale_voltage(v: f32, ri: f32, rf: f32, vf: f32) -> f32 {
    if rf == 0.0 {
        return v;
    }
    v + (v - vf) * ri / rf
}

/// Percent duty to the chip's raw PWM byte
fn duty_byte(percent: f32) -> u8 {
    (percent * 2.55).round().clamp(0.0, 255.0) as u8
}

struct ChipActuator<'a> {
    chip: &'a mut dyn SuperIoChip,
}

impl ControlActuator for ChipActuator<'_> {
    fn apply(&mut self, index: usize, value: Option<f32>) -> Result<()> {
        self.chip.set_control(index, value.map(duty_byte))
    }
}

pub struct SuperIoHardware {
    base: HardwareBase,
    chip: Box<dyn SuperIoChip>,
    voltages: Vec<usize>,
    temperatures: Vec<usize>,
    fans: Vec<usize>,
    control_sensors: Vec<usize>,
    controls: Vec<Control>,
}

impl SuperIoHardware {
    /// `index` distinguishes multiple chips of the same model
    pub fn new(chip: Box<dyn SuperIoChip>, index: usize, window: chrono::Duration) -> Self {
        let model = chip.chip();
        let identifier = Identifier::new(["lpc".to_string(), model.identifier_segment(), index.to_string()]);
        let mut base = HardwareBase::new(model.name(), identifier, HardwareType::SuperIo).with_window(window);

        let voltages = (0..chip.voltages().len())
            .map(|i| {
                let sensor = base
                    .sensor(format!("Voltage #{}", i + 1), i, SensorType::Voltage)
                    .with_parameters(&VOLTAGE_PARAMETERS);
                base.push_sensor(sensor)
            })
            .collect();

        let names = chip.temperature_names();
        let temperatures = (0..chip.temperatures().len())
            .map(|i| {
                let name = names
                    .and_then(|n| n.get(i))
                    .map_or_else(|| format!("Temperature #{}", i + 1), |n| n.to_string());
                let sensor = base
                    .sensor(name, i, SensorType::Temperature)
                    .with_parameters(&TEMPERATURE_PARAMETERS);
                base.push_sensor(sensor)
            })
            .collect();

        let fans = (0..chip.fans().len())
            .map(|i| base.add_sensor(format!("Fan #{}", i + 1), i, SensorType::Fan))
            .collect();

        let mut control_sensors = Vec::new();
        let mut controls = Vec::new();
        for i in 0..chip.controls().len() {
            let slot = base.add_sensor(format!("Fan Control #{}", i + 1), i, SensorType::Control);
            if let Some(sensor) = base.get(slot) {
                controls.push(Control::new(sensor.identifier(), i, 0.0, 100.0));
            }
            control_sensors.push(slot);
        }

        Self {
            base,
            chip,
            voltages,
            temperatures,
            fans,
            control_sensors,
            controls,
        }
    }

    pub fn chip(&self) -> &dyn SuperIoChip {
        self.chip.as_ref()
    }
}

impl Hardware for SuperIoHardware {
    fn base(&self) -> &HardwareBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HardwareBase {
        &mut self.base
    }

    fn update(&mut self) {
        if let Err(e) = self.chip.update() {
            if e.is_contention() {
                trace!("{}: {}", self.base.identifier(), e);
            } else {
                debug!("{} update failed: {}", self.base.identifier(), e);
            }
            self.base.invalidate_all();
            return;
        }

        for (i, &slot) in self.voltages.iter().enumerate() {
            let value = self.chip.voltages()[i].map(|v| {
                let sensor = self.base.get(slot);
                let p = |n, d| sensor.map_or(d, |s| s.parameter(n, d));
                scale_voltage(v, p(0, 0.0), p(1, 1.0), p(2, 0.0))
            });
            self.base.publish(slot, value);
        }

        for (i, &slot) in self.temperatures.iter().enumerate() {
            let offset = self.base.get(slot).map_or(0.0, |s| s.parameter(0, 0.0));
            let value = self.chip.temperatures()[i].map(|t| t + offset);
            self.base.publish(slot, value);
        }

        for (i, &slot) in self.fans.iter().enumerate() {
            let value = self.chip.fans()[i];
            self.base.record(slot, value);
            // stalled headers stay hidden until a fan spins
            if value.is_some_and(|v| v > 0.0) {
                self.base.activate(slot);
            }
        }

        for (i, &slot) in self.control_sensors.iter().enumerate() {
            self.base.publish(slot, self.chip.controls()[i]);
        }
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }

    fn set_control(&mut self, identifier: &Identifier, request: ControlRequest) -> Result<()> {
        let control = self
            .controls
            .iter_mut()
            .find(|c| c.identifier() == identifier)
            .ok_or_else(|| Error::NotSupported(format!("no control {}", identifier)))?;
        control.request(request, &mut ChipActuator { chip: self.chip.as_mut() })
    }

    fn close(&mut self) -> Result<()> {
        let mut first = None;
        let mut actuator = ChipActuator { chip: self.chip.as_mut() };
        for control in &mut self.controls {
            if let Err(e) = control.revert(&mut actuator) {
                warn!("failed to restore {}: {}", control.identifier(), e);
                first.get_or_insert(e);
            }
        }
        self.base.teardown();
        first.map_or(Ok(()), Err)
    }

    fn report(&self) -> String {
        let mut r = self.base.report();
        r.push('\n');
        r.push_str(&self.chip.report());
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlMode;
    use crate::superio::Chip;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeState {
        writes: Vec<(usize, Option<u8>)>,
        fail: bool,
    }

    struct FakeChip {
        state: Arc<Mutex<FakeState>>,
        voltages: Vec<Option<f32>>,
        temperatures: Vec<Option<f32>>,
        fans: Vec<Option<f32>>,
        controls: Vec<Option<f32>>,
    }

    impl SuperIoChip for FakeChip {
        fn chip(&self) -> Chip {
            Chip::IT8686E
        }

        fn address(&self) -> u16 {
            0xA40
        }

        fn voltages(&self) -> &[Option<f32>] {
            &self.voltages
        }

        fn temperatures(&self) -> &[Option<f32>] {
            &self.temperatures
        }

        fn fans(&self) -> &[Option<f32>] {
            &self.fans
        }

        fn controls(&self) -> &[Option<f32>] {
            &self.controls
        }

        fn update(&mut self) -> Result<()> {
            if self.state.lock().unwrap().fail {
                return Err(Error::BusTimeout("isa"));
            }
            Ok(())
        }

        fn set_control(&mut self, index: usize, value: Option<u8>) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail {
                return Err(Error::BusTimeout("isa"));
            }
            state.writes.push((index, value));
            Ok(())
        }

        fn report(&self) -> String {
            "fake registers\n".into()
        }
    }

    fn hardware() -> (Arc<Mutex<FakeState>>, SuperIoHardware) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        let chip = FakeChip {
            state: state.clone(),
            voltages: vec![Some(1.0), None],
            temperatures: vec![Some(40.0)],
            fans: vec![Some(1200.0), Some(0.0)],
            controls: vec![Some(50.0), Some(30.0)],
        };
        let hw = SuperIoHardware::new(Box::new(chip), 0, chrono::Duration::hours(1));
        (state, hw)
    }

    #[test]
    fn test_identifiers() {
        let (_, hw) = hardware();
        assert_eq!(hw.identifier().as_str(), "/lpc/it8686e/0");
        assert_eq!(hw.sensors()[0].identifier().as_str(), "/lpc/it8686e/0/voltage/0");
        assert_eq!(hw.controls()[1].identifier().as_str(), "/lpc/it8686e/0/control/1/control");
        assert_eq!(hw.sensors().len(), 2 + 1 + 2 + 2);
    }

    #[test]
    fn test_update_applies_parameters() {
        let (_, mut hw) = hardware();
        hw.base_mut().sensors_mut()[0].parameters_mut()[0].set_value(10.0);
        hw.base_mut().sensors_mut()[0].parameters_mut()[1].set_value(10.0);
        hw.base_mut().sensors_mut()[2].parameters_mut()[0].set_value(-2.5);
        hw.update();

        let sensors = hw.sensors();
        assert_eq!(sensors[0].value(), Some(2.0));
        assert!(sensors[0].is_active());
        assert!(!sensors[1].is_active());
        assert_eq!(sensors[2].value(), Some(37.5));
        assert!(sensors[3].is_active());
        // 0 RPM fan is recorded but not activated
        assert_eq!(sensors[4].value(), Some(0.0));
        assert!(!sensors[4].is_active());
        assert_eq!(sensors[5].value(), Some(50.0));
    }

    #[test]
    fn test_contention_invalidates() {
        let (state, mut hw) = hardware();
        hw.update();
        state.lock().unwrap().fail = true;
        hw.update();
        assert!(hw.sensors().iter().all(|s| s.value().is_none()));
        assert_eq!(hw.sensors()[2].max(), Some(40.0));
    }

    #[test]
    fn test_control_roundtrip_and_close() {
        let (state, mut hw) = hardware();
        let id = hw.controls()[0].identifier().clone();
        hw.set_control(&id, ControlRequest::Software(40.0)).unwrap();
        assert_eq!(hw.controls()[0].mode(), ControlMode::Software);
        hw.close().unwrap();
        assert_eq!(state.lock().unwrap().writes, vec![(0, Some(102)), (0, None)]);
        assert_eq!(hw.controls()[0].mode(), ControlMode::Default);
        assert!(hw.sensors().iter().all(|s| !s.is_active()));
    }

    #[test]
    fn test_close_reports_first_failure() {
        let (state, mut hw) = hardware();
        for i in 0..2 {
            let id = hw.controls()[i].identifier().clone();
            hw.set_control(&id, ControlRequest::Software(10.0)).unwrap();
        }
        state.lock().unwrap().fail = true;
        assert!(matches!(hw.close(), Err(Error::Control { .. })));
        assert!(hw.set_control(&Identifier::new(["nope"]), ControlRequest::Default).is_err());
        // failed reverts leave the controls in software mode for another attempt
        assert!(hw.controls().iter().all(|c| c.mode() == ControlMode::Software));

        state.lock().unwrap().fail = false;
        hw.close().unwrap();
        assert!(hw.controls().iter().all(|c| c.mode() == ControlMode::Default));
        let writes = state.lock().unwrap().writes.clone();
        assert_eq!(&writes[2..], &[(0, None), (1, None)]);
    }

    #[test]
    fn test_scale_voltage() {
        assert_eq!(scale_voltage(1.0, 0.0, 1.0, 0.0), 1.0);
        assert_eq!(scale_voltage(1.0, 5.0, 0.0, 0.0), 1.0);
        assert_eq!(duty_byte(100.0), 255);
        assert_eq!(duty_byte(0.0), 0);
    }
}
