//! Typed sensor readings with min/max tracking and time-windowed history
//!
//! [`Sensor::set_value`] is the only mutation point for readings. Every write
//! prunes history older than the retention window, folds the reading into a
//! four-sample moving sum and extends (never narrows) the running min/max.

use crate::identifier::Identifier;
use crate::parameter::{Parameter, ParameterDescription};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Number of raw readings averaged into one history point
const SAMPLES_PER_POINT: u32 = 4;

/// Default history retention window
pub fn default_history_window() -> Duration {
    Duration::hours(24)
}

/// Type of sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorType {
    Voltage,
    Clock,
    Temperature,
    Load,
    Fan,
    Flow,
    Control,
    Level,
    Factor,
    Power,
    Data,
    SmallData,
    Throughput,
}

impl SensorType {
    /// Identifier segment for sensors of this type
    pub fn segment(&self) -> &'static str {
        match self {
            SensorType::Voltage => "voltage",
            SensorType::Clock => "clock",
            SensorType::Temperature => "temperature",
            SensorType::Load => "load",
            SensorType::Fan => "fan",
            SensorType::Flow => "flow",
            SensorType::Control => "control",
            SensorType::Level => "level",
            SensorType::Factor => "factor",
            SensorType::Power => "power",
            SensorType::Data => "data",
            SensorType::SmallData => "smalldata",
            SensorType::Throughput => "throughput",
        }
    }

    /// Display unit
    pub fn unit(&self) -> &'static str {
        match self {
            SensorType::Voltage => "V",
            SensorType::Clock => "MHz",
            SensorType::Temperature => "°C",
            SensorType::Load | SensorType::Control | SensorType::Level => "%",
            SensorType::Fan => "RPM",
            SensorType::Flow => "L/h",
            SensorType::Factor => "",
            SensorType::Power => "W",
            SensorType::Data => "GB",
            SensorType::SmallData => "MB",
            SensorType::Throughput => "B/s",
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One committed history point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorValue {
    pub value: f32,
    pub time: DateTime<Utc>,
}

/// A typed reading owned by a hardware node
#[derive(Debug, Clone)]
pub struct Sensor {
    identifier: Identifier,
    default_name: String,
    name: String,
    index: usize,
    sensor_type: SensorType,
    value: Option<f32>,
    min: Option<f32>,
    max: Option<f32>,
    values: VecDeque<SensorValue>,
    window: Duration,
    sum: f32,
    count: u32,
    parameters: Vec<Parameter>,
    hidden: bool,
    active: bool,
}

impl Sensor {
    pub fn new(
        hardware: &Identifier,
        name: impl Into<String>,
        index: usize,
        sensor_type: SensorType,
    ) -> Self {
        let name = name.into();
        Self {
            identifier: hardware.join([sensor_type.segment().to_string(), index.to_string()]),
            default_name: name.clone(),
            name,
            index,
            sensor_type,
            value: None,
            min: None,
            max: None,
            values: VecDeque::new(),
            window: default_history_window(),
            sum: 0.0,
            count: 0,
            parameters: Vec::new(),
            hidden: false,
            active: false,
        }
    }

    /// Attach calibration parameters
    pub fn with_parameters(mut self, descriptions: &[ParameterDescription]) -> Self {
        self.parameters = descriptions
            .iter()
            .map(|d| Parameter::new(&self.identifier, d))
            .collect();
        self
    }

    /// History retention window; zero disables history
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
        if name.is_empty() {
            self.name = self.default_name.clone();
        } else {
            self.name = name;
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn sensor_type(&self) -> SensorType {
        self.sensor_type
    }

    pub fn value(&self) -> Option<f32> {
        self.value
    }

    pub fn min(&self) -> Option<f32> {
        self.min
    }

    pub fn max(&self) -> Option<f32> {
        self.max
    }

    pub fn reset_min(&mut self) {
        self.min = None;
    }

    pub fn reset_max(&mut self) {
        self.max = None;
    }

    pub fn values(&self) -> impl Iterator<Item = &SensorValue> {
        self.values.iter()
    }

    pub fn clear_values(&mut self) {
        self.values.clear();
        self.sum = 0.0;
        self.count = 0;
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.parameters
    }

    /// Effective value of the parameter at `index`, or `fallback` if absent
    pub fn parameter(&self, index: usize, fallback: f32) -> f32 {
        self.parameters
            .get(index)
            .map(Parameter::value)
            .unwrap_or(fallback)
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn set_hidden(&mut self, hidden: bool) {
        self.hidden = hidden;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Record a reading taken now
    pub fn set_value(&mut self, value: Option<f32>) {
        self.set_value_at(value, Utc::now());
    }

    /// Record a reading taken at `now`
    pub fn set_value_at(&mut self, value: Option<f32>, now: DateTime<Utc>) {
        let value = value.filter(|v| v.is_finite());

        if self.window > Duration::zero() {
            while let Some(front) = self.values.front() {
                if now - front.time > self.window {
                    self.values.pop_front();
                } else {
                    break;
                }
            }

            if let Some(v) = value {
                self.sum += v;
                self.count += 1;
                if self.count == SAMPLES_PER_POINT {
                    let average = self.sum / self.count as f32;
                    self.append_value(average, now);
                    self.sum = 0.0;
                    self.count = 0;
                }
            }
        }

        self.value = value;
        if let Some(v) = value {
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }

    fn append_value(&mut self, value: f32, time: DateTime<Utc>) {
        let len = self.values.len();
        if len >= 2 && self.values[len - 1].value == value && self.values[len - 2].value == value
        {
            // collapse runs: keep the first and move the last point forward
            self.values[len - 1].time = time;
            return;
        }
        self.values.push_back(SensorValue { value, time });
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Some(v) => write!(f, "{}: {:.2} {}", self.name, v, self.sensor_type.unit()),
            None => write!(f, "{}: -", self.name),
        }
    }
}
