//! Super-I/O hardware monitors
//!
//! LPC-attached environment controllers found on desktop mainboards. Each
//! chip family has its own decoder behind [`SuperIoChip`]; the decoders
//! produce raw calibrated arrays that [`hardware::SuperIoHardware`] turns
//! into sensors and controls.

pub mod fintek;
pub mod hardware;
pub mod ite;
pub mod lpc;
pub mod nuvoton;
pub mod winbond;

use crate::bus::IsaBus;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write as _;

/// Known Super-I/O chips
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chip {
    Unknown,

    IT8705F,
    IT8712F,
    IT8716F,
    IT8718F,
    IT8720F,
    IT8721F,
    IT8726F,
    IT8620E,
    IT8628E,
    IT8655E,
    IT8665E,
    IT8686E,
    IT8688E,
    IT8689E,
    IT8728F,
    IT8771E,
    IT8772E,
    IT8792E,
    IT87952E,

    NCT6771F,
    NCT6776F,
    NCT6779D,
    NCT6791D,
    NCT6792D,
    NCT6793D,
    NCT6795D,
    NCT6796D,
    NCT6797D,
    NCT6798D,

    W83627DHG,
    W83627DHGP,
    W83627EHF,
    W83627HF,
    W83627THF,
    W83667HG,
    W83667HGB,
    W83687THF,

    F71808E,
    F71858,
    F71862,
    F71869,
    F71869A,
    F71878AD,
    F71882,
    F71889AD,
    F71889ED,
    F71889F,
}

/// ITE chip ids as read from configuration registers 0x20/0x21
const ITE_IDS: &[(u16, Chip)] = &[
    (0x8705, Chip::IT8705F),
    (0x8712, Chip::IT8712F),
    (0x8716, Chip::IT8716F),
    (0x8718, Chip::IT8718F),
    (0x8720, Chip::IT8720F),
    (0x8721, Chip::IT8721F),
    (0x8726, Chip::IT8726F),
    (0x8620, Chip::IT8620E),
    (0x8628, Chip::IT8628E),
    (0x8655, Chip::IT8655E),
    (0x8665, Chip::IT8665E),
    (0x8686, Chip::IT8686E),
    (0x8688, Chip::IT8688E),
    (0x8689, Chip::IT8689E),
    (0x8728, Chip::IT8728F),
    (0x8771, Chip::IT8771E),
    (0x8772, Chip::IT8772E),
    (0x8733, Chip::IT8792E),
    (0x8695, Chip::IT87952E),
];

impl Chip {
    pub fn from_ite_id(id: u16) -> Chip {
        ITE_IDS
            .iter()
            .find(|(i, _)| *i == id)
            .map_or(Chip::Unknown, |(_, chip)| *chip)
    }

    /// Full product name
    pub fn name(self) -> &'static str {
        use Chip::*;
        match self {
            Unknown => "Unknown",
            IT8705F => "ITE IT8705F",
            IT8712F => "ITE IT8712F",
            IT8716F => "ITE IT8716F",
            IT8718F => "ITE IT8718F",
            IT8720F => "ITE IT8720F",
            IT8721F => "ITE IT8721F",
            IT8726F => "ITE IT8726F",
            IT8620E => "ITE IT8620E",
            IT8628E => "ITE IT8628E",
            IT8655E => "ITE IT8655E",
            IT8665E => "ITE IT8665E",
            IT8686E => "ITE IT8686E",
            IT8688E => "ITE IT8688E",
            IT8689E => "ITE IT8689E",
            IT8728F => "ITE IT8728F",
            IT8771E => "ITE IT8771E",
            IT8772E => "ITE IT8772E",
            IT8792E => "ITE IT8792E",
            IT87952E => "ITE IT87952E",
            NCT6771F => "Nuvoton NCT6771F",
            NCT6776F => "Nuvoton NCT6776F",
            NCT6779D => "Nuvoton NCT6779D",
            NCT6791D => "Nuvoton NCT6791D",
            NCT6792D => "Nuvoton NCT6792D",
            NCT6793D => "Nuvoton NCT6793D",
            NCT6795D => "Nuvoton NCT6795D",
            NCT6796D => "Nuvoton NCT6796D",
            NCT6797D => "Nuvoton NCT6797D",
            NCT6798D => "Nuvoton NCT6798D",
            W83627DHG => "Winbond W83627DHG",
            W83627DHGP => "Winbond W83627DHG-P",
            W83627EHF => "Winbond W83627EHF",
            W83627HF => "Winbond W83627HF",
            W83627THF => "Winbond W83627THF",
            W83667HG => "Winbond W83667HG",
            W83667HGB => "Winbond W83667HG-B",
            W83687THF => "Winbond W83687THF",
            F71808E => "Fintek F71808E",
            F71858 => "Fintek F71858",
            F71862 => "Fintek F71862",
            F71869 => "Fintek F71869",
            F71869A => "Fintek F71869A",
            F71878AD => "Fintek F71878AD",
            F71882 => "Fintek F71882",
            F71889AD => "Fintek F71889AD",
            F71889ED => "Fintek F71889ED",
            F71889F => "Fintek F71889F",
        }
    }

    /// Lowercase model used as identifier segment, e.g. `it8686e`
    pub fn identifier_segment(self) -> String {
        format!("{:?}", self).to_lowercase()
    }

    pub fn is_ite(self) -> bool {
        ITE_IDS.iter().any(|(_, c)| *c == self)
    }

    pub fn is_nuvoton(self) -> bool {
        use Chip::*;
        matches!(
            self,
            NCT6771F | NCT6776F | NCT6779D | NCT6791D | NCT6792D | NCT6793D | NCT6795D | NCT6796D | NCT6797D | NCT6798D
        )
    }

    pub fn is_winbond(self) -> bool {
        use Chip::*;
        matches!(
            self,
            W83627DHG | W83627DHGP | W83627EHF | W83627HF | W83627THF | W83667HG | W83667HGB | W83687THF
        )
    }

    pub fn is_fintek(self) -> bool {
        use Chip::*;
        matches!(
            self,
            F71808E | F71858 | F71862 | F71869 | F71869A | F71878AD | F71882 | F71889AD | F71889ED | F71889F
        )
    }
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoder for one environment controller
///
/// `update` refreshes the value arrays in a single ISA critical section.
/// Arrays hold calibrated values: volts, °C, RPM, and percent duty.
pub trait SuperIoChip: Send {
    fn chip(&self) -> Chip;

    /// I/O base address of the hardware monitor
    fn address(&self) -> u16;

    fn voltages(&self) -> &[Option<f32>];

    fn temperatures(&self) -> &[Option<f32>];

    fn fans(&self) -> &[Option<f32>];

    fn controls(&self) -> &[Option<f32>];

    /// Display names for the temperature slots, when the chip knows them
    fn temperature_names(&self) -> Option<&'static [&'static str]> {
        None
    }

    fn update(&mut self) -> Result<()>;

    /// Drive output `index` with a raw duty byte, or restore the saved
    /// pre-software state when `value` is `None`
    fn set_control(&mut self, index: usize, value: Option<u8>) -> Result<()>;

    fn report(&self) -> String;
}

/// Index/data register pair at `base + 5` / `base + 6`, optionally
/// bank-switched; register numbers are `bank << 8 | index`
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegisterPorts {
    address_port: u16,
    data_port: u16,
    bank_select: Option<u8>,
}

impl RegisterPorts {
    pub(crate) const fn new(base: u16) -> Self {
        Self {
            address_port: base + 5,
            data_port: base + 6,
            bank_select: None,
        }
    }

    pub(crate) const fn banked(base: u16, bank_select: u8) -> Self {
        Self {
            address_port: base + 5,
            data_port: base + 6,
            bank_select: Some(bank_select),
        }
    }

    fn select(&self, isa: &IsaBus<'_>, register: u16) -> Result<()> {
        if let Some(bank_select) = self.bank_select {
            isa.write(self.address_port, bank_select)?;
            isa.write(self.data_port, (register >> 8) as u8)?;
        }
        isa.write(self.address_port, register as u8)
    }

    pub(crate) fn read(&self, isa: &IsaBus<'_>, register: u16) -> Result<u8> {
        self.select(isa, register)?;
        isa.read(self.data_port)
    }

    pub(crate) fn write(&self, isa: &IsaBus<'_>, register: u16, value: u8) -> Result<()> {
        self.select(isa, register)?;
        isa.write(self.data_port, value)
    }

    /// Read and report whether the address port still echoes the index
    pub(crate) fn read_checked(&self, isa: &IsaBus<'_>, register: u8) -> Result<(u8, bool)> {
        isa.write(self.address_port, register)?;
        let value = isa.read(self.data_port)?;
        let valid = isa.read(self.address_port)? == register;
        Ok((value, valid))
    }
}

/// Temperatures outside this range are sensor faults
pub(crate) fn plausible_temperature(t: f32) -> Option<f32> {
    (-55.0..=125.0).contains(&t).then_some(t)
}

/// Hex dump of banks `banks` of a register file
pub(crate) fn dump_registers(
    isa: &IsaBus<'_>,
    ports: &RegisterPorts,
    banks: &[u8],
) -> String {
    let mut r = String::new();
    let _ = writeln!(r, "       00 01 02 03 04 05 06 07 08 09 0A 0B 0C 0D 0E 0F");
    for &bank in banks {
        for row in 0..16u16 {
            let _ = write!(r, " {:01X}{:01X}0  ", bank, row);
            for col in 0..16u16 {
                let register = (bank as u16) << 8 | row << 4 | col;
                match ports.read(isa, register) {
                    Ok(v) => {
                        let _ = write!(r, " {:02X}", v);
                    }
                    Err(_) => {
                        let _ = write!(r, " ??");
                    }
                }
            }
            let _ = writeln!(r);
        }
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::ChipRegisters;
    use crate::bus::{Bus, SimulatedBus};
    use std::time::Duration;

    #[test]
    fn test_chip_lookup() {
        assert_eq!(Chip::from_ite_id(0x8686), Chip::IT8686E);
        assert_eq!(Chip::from_ite_id(0x8733), Chip::IT8792E);
        assert_eq!(Chip::from_ite_id(0x1234), Chip::Unknown);
        assert_eq!(Chip::NCT6798D.identifier_segment(), "nct6798d");
        assert!(Chip::IT8620E.is_ite());
        assert!(Chip::W83627DHGP.is_winbond());
        assert!(!Chip::F71858.is_nuvoton());
    }

    #[test]
    fn test_banked_ports() {
        let sim = SimulatedBus::new();
        let chip = ChipRegisters::banked(0x290, 0x4E);
        chip.set(0x0627, 0x21);
        sim.add_port_device(chip.clone());
        let bus = Bus::new(sim, Duration::from_millis(10));
        let isa = bus.lock_isa().unwrap();

        let ports = RegisterPorts::banked(0x290, 0x4E);
        assert_eq!(ports.read(&isa, 0x0627).unwrap(), 0x21);
        ports.write(&isa, 0x0102, 0x00).unwrap();
        assert_eq!(chip.get(0x0102), 0x00);
    }

    #[test]
    fn test_read_checked() {
        let sim = SimulatedBus::new();
        sim.add_port_device(ChipRegisters::new(0xA40).without_index_echo());
        let bus = Bus::new(sim, Duration::from_millis(10));
        let isa = bus.lock_isa().unwrap();
        let (_, valid) = RegisterPorts::new(0xA40).read_checked(&isa, 0x20).unwrap();
        assert!(!valid);
    }

    #[test]
    fn test_plausible_temperature() {
        assert_eq!(plausible_temperature(50.5), Some(50.5));
        assert_eq!(plausible_temperature(-55.0), Some(-55.0));
        assert_eq!(plausible_temperature(127.0), None);
        assert_eq!(plausible_temperature(-64.0), None);
    }
}
