//! # silicore
//!
//! Register-level hardware telemetry. silicore identifies the CPU, mainboard
//! Super-I/O chips, GPUs and drives of a machine, decodes their raw registers
//! into typed sensor readings with min/max and history, and exposes fan PWM
//! outputs as revertible controls.
//!
//! ## Quick Start
//!
//! ```no_run
//! use silicore::{Computer, Config, SensorType};
//!
//! # fn main() -> silicore::Result<()> {
//! let mut computer = Computer::native(Config::load()?);
//! computer.open();
//! computer.update();
//!
//! for hw in computer.hardware() {
//!     println!("{} ({})", hw.name(), hw.identifier());
//!     for sensor in hw.sensors().iter().filter(|s| s.sensor_type() == SensorType::Temperature) {
//!         println!("  {}: {:?} °C", sensor.name(), sensor.value());
//!     }
//! }
//!
//! // reverts every fan control to its firmware default
//! computer.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Background polling
//!
//! ```no_run
//! use silicore::{Computer, Config, UpdateLoop};
//! use std::time::Duration;
//!
//! # fn main() -> silicore::Result<()> {
//! let config = Config::default();
//! let interval = config.update_interval();
//! let mut computer = Computer::native(config);
//! computer.open();
//!
//! let updater = UpdateLoop::spawn(computer, interval)?;
//! std::thread::sleep(Duration::from_secs(5));
//! println!("{}", updater.computer().report());
//! updater.stop()?.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `nvidia` - NVIDIA GPU readings and fan control via NVML
//! - `cli` - the `silicore` command-line tool
//!
//! ## Platform Support
//!
//! Native register access (`/dev/port`, `/dev/cpu/*/msr`, PCI config space)
//! is implemented for Linux and needs root. Elsewhere the bus reports
//! `NotSupported` and only API-backed sensors are available.

pub mod affinity; // Thread pinning for per-core register reads
pub mod bus; // ISA/PCI/MSR access gateway
pub mod computer; // Discovery and update orchestration
pub mod config; // Configuration management with TOML persistence
pub mod control; // Revertible fan controls
pub mod cpu; // CPU decoders
pub mod cpuid; // CPU identification and topology
pub mod error;
pub mod gpu; // GPU vendor API adapters
pub mod hardware;
pub mod identifier;
pub mod mainboard; // Mainboard and Super-I/O hardware
pub mod memory; // System memory load
pub mod parameter;
pub mod sensor;
pub mod settings; // Persisted user state
pub mod smbios; // Firmware tables
pub mod storage; // SMART drive sensors
pub mod superio; // Super-I/O chip decoders

pub use bus::{Bus, BusDriver, SimulatedBus};
pub use computer::{Category, Computer, Group, Platform, UpdateLoop};
pub use config::Config;
pub use control::{Control, ControlMode, ControlRequest};
pub use error::{Error, Result};
pub use hardware::{Hardware, HardwareEvent, HardwareSnapshot, HardwareType, SensorSnapshot};
pub use identifier::Identifier;
pub use parameter::{Parameter, ParameterDescription};
pub use sensor::{Sensor, SensorType, SensorValue};
pub use settings::{FileSettings, MemorySettings, Settings};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
