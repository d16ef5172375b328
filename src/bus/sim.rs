//! In-memory bus driver
//!
//! Register files for MSRs, PCI configuration space and SMN, plus pluggable
//! port devices that emulate Super-I/O configuration mode and the
//! index/data register pairs of hardware monitor chips. All handles are
//! cheap clones sharing state, so a test can keep one and inspect registers
//! after the driver has been handed to a [`Bus`](super::Bus).

use super::{BusDriver, PciAddress, PciDeviceInfo, SMN_DATA_REGISTER, SMN_INDEX_REGISTER, SMN_ROOT};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

const PORT_LOG_CAPACITY: usize = 4096;

/// A device answering on a set of I/O ports
pub trait PortDevice: Send {
    fn claims(&self, port: u16) -> bool;

    fn read(&mut self, port: u16) -> u8;

    fn write(&mut self, port: u16, value: u8);
}

#[derive(Default)]
struct SimState {
    ports: Vec<Box<dyn PortDevice>>,
    port_log: VecDeque<(u16, u8)>,
    msrs: HashMap<(usize, u32), u64>,
    pci: HashMap<(PciAddress, u16), u32>,
    devices: Vec<PciDeviceInfo>,
    smn: HashMap<u32, u32>,
    smn_index: u32,
    refuse_port_writes: bool,
}

/// Simulated bus driver
#[derive(Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_port_device(&self, device: impl PortDevice + 'static) {
        self.state.lock().ports.push(Box::new(device));
    }

    pub fn set_msr(&self, cpu: usize, index: u32, value: u64) {
        self.state.lock().msrs.insert((cpu, index), value);
    }

    pub fn msr(&self, cpu: usize, index: u32) -> Option<u64> {
        self.state.lock().msrs.get(&(cpu, index)).copied()
    }

    pub fn add_pci_device(&self, address: PciAddress, vendor_id: u16, device_id: u16) {
        let mut state = self.state.lock();
        state.devices.push(PciDeviceInfo {
            address,
            vendor_id,
            device_id,
        });
        state
            .pci
            .insert((address, 0), (device_id as u32) << 16 | vendor_id as u32);
    }

    pub fn set_pci_config(&self, address: PciAddress, offset: u16, value: u32) {
        self.state.lock().pci.insert((address, offset), value);
    }

    pub fn pci_config(&self, address: PciAddress, offset: u16) -> Option<u32> {
        self.state.lock().pci.get(&(address, offset)).copied()
    }

    pub fn set_smn(&self, index: u32, value: u32) {
        self.state.lock().smn.insert(index, value);
    }

    pub fn smn(&self, index: u32) -> Option<u32> {
        self.state.lock().smn.get(&index).copied()
    }

    /// Make every port write fail until cleared
    pub fn refuse_port_writes(&self, refuse: bool) {
        self.state.lock().refuse_port_writes = refuse;
    }

    /// Most recent port writes, oldest first
    pub fn port_writes(&self) -> Vec<(u16, u8)> {
        self.state.lock().port_log.iter().copied().collect()
    }
}

impl BusDriver for SimulatedBus {
    fn name(&self) -> &str {
        "simulated"
    }

    fn read_port(&self, port: u16) -> Result<u8> {
        let mut state = self.state.lock();
        Ok(state
            .ports
            .iter_mut()
            .find(|d| d.claims(port))
            .map(|d| d.read(port))
            .unwrap_or(0xFF))
    }

    fn write_port(&self, port: u16, value: u8) -> Result<()> {
        let mut state = self.state.lock();
        if state.refuse_port_writes {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("port {:#06x} write refused", port),
            )));
        }
        if state.port_log.len() == PORT_LOG_CAPACITY {
            state.port_log.pop_front();
        }
        state.port_log.push_back((port, value));
        if let Some(device) = state.ports.iter_mut().find(|d| d.claims(port)) {
            device.write(port, value);
        }
        Ok(())
    }

    fn read_msr(&self, cpu: usize, index: u32) -> Result<u64> {
        self.msr(cpu, index)
            .ok_or_else(|| Error::InvalidRead(format!("MSR {:#x} on cpu {}", index, cpu)))
    }

    fn write_msr(&self, cpu: usize, index: u32, value: u64) -> Result<()> {
        self.set_msr(cpu, index, value);
        Ok(())
    }

    fn read_pci_config(&self, address: PciAddress, offset: u16) -> Result<u32> {
        let state = self.state.lock();
        if address == SMN_ROOT && offset == SMN_DATA_REGISTER {
            return state
                .smn
                .get(&state.smn_index)
                .copied()
                .ok_or_else(|| Error::InvalidRead(format!("SMN {:#x}", state.smn_index)));
        }
        state
            .pci
            .get(&(address, offset))
            .copied()
            .ok_or_else(|| Error::InvalidRead(format!("PCI {} offset {:#x}", address, offset)))
    }

    fn write_pci_config(&self, address: PciAddress, offset: u16, value: u32) -> Result<()> {
        let mut state = self.state.lock();
        if address == SMN_ROOT && offset == SMN_INDEX_REGISTER {
            state.smn_index = value;
        } else if address == SMN_ROOT && offset == SMN_DATA_REGISTER {
            let index = state.smn_index;
            state.smn.insert(index, value);
        } else {
            state.pci.insert((address, offset), value);
        }
        Ok(())
    }

    fn pci_devices(&self) -> Result<Vec<PciDeviceInfo>> {
        Ok(self.state.lock().devices.clone())
    }
}

struct ChipState {
    address_port: u16,
    data_port: u16,
    bank_select: Option<u8>,
    bank: u8,
    index: u8,
    echo_index: bool,
    registers: HashMap<u16, u8>,
}

/// Hardware monitor register file behind an index/data port pair at
/// `base + 5` / `base + 6`, optionally bank-switched
#[derive(Clone)]
pub struct ChipRegisters {
    state: Arc<Mutex<ChipState>>,
}

impl ChipRegisters {
    pub fn new(base: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChipState {
                address_port: base + 5,
                data_port: base + 6,
                bank_select: None,
                bank: 0,
                index: 0,
                echo_index: true,
                registers: HashMap::new(),
            })),
        }
    }

    /// Register file whose page is chosen by writing `bank_select`
    pub fn banked(base: u16, bank_select: u8) -> Self {
        let chip = Self::new(base);
        chip.state.lock().bank_select = Some(bank_select);
        chip
    }

    /// Make the address port read back 0xFF instead of the selected index
    pub fn without_index_echo(self) -> Self {
        self.state.lock().echo_index = false;
        self
    }

    /// Set a register; `register` is `bank << 8 | index`
    pub fn set(&self, register: u16, value: u8) {
        self.state.lock().registers.insert(register, value);
    }

    pub fn get(&self, register: u16) -> u8 {
        self.state
            .lock()
            .registers
            .get(&register)
            .copied()
            .unwrap_or(0)
    }
}

impl PortDevice for ChipRegisters {
    fn claims(&self, port: u16) -> bool {
        let state = self.state.lock();
        port == state.address_port || port == state.data_port
    }

    fn read(&mut self, port: u16) -> u8 {
        let state = self.state.lock();
        if port == state.address_port {
            return if state.echo_index { state.index } else { 0xFF };
        }
        if state.bank_select == Some(state.index) {
            return state.bank;
        }
        let key = (state.bank as u16) << 8 | state.index as u16;
        state.registers.get(&key).copied().unwrap_or(0)
    }

    fn write(&mut self, port: u16, value: u8) {
        let mut state = self.state.lock();
        if port == state.address_port {
            state.index = value;
        } else if state.bank_select == Some(state.index) {
            state.bank = value;
        } else {
            let key = (state.bank as u16) << 8 | state.index as u16;
            state.registers.insert(key, value);
        }
    }
}

/// Configuration-mode entry protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFlavor {
    /// Winbond / Nuvoton / Fintek: `87 87`, exit with `AA`
    Winbond,
    /// ITE: `87 01 55 55|AA`, exit by setting bit 1 of register 0x02
    Ite,
}

struct ConfigState {
    index_port: u16,
    data_port: u16,
    flavor: ConfigFlavor,
    key: Vec<u8>,
    key_pos: usize,
    entered: bool,
    index: u8,
    ldn: u8,
    global: HashMap<u8, u8>,
    logical: HashMap<(u8, u8), u8>,
    entries: usize,
    exits: usize,
}

/// Super-I/O configuration space on an index/data pair (0x2E/0x2F or 0x4E/0x4F)
#[derive(Clone)]
pub struct SuperIoConfig {
    state: Arc<Mutex<ConfigState>>,
}

impl SuperIoConfig {
    pub fn new(index_port: u16, flavor: ConfigFlavor) -> Self {
        let key = match flavor {
            ConfigFlavor::Winbond => vec![0x87, 0x87],
            ConfigFlavor::Ite => vec![
                0x87,
                0x01,
                0x55,
                if index_port == 0x4E { 0xAA } else { 0x55 },
            ],
        };
        Self {
            state: Arc::new(Mutex::new(ConfigState {
                index_port,
                data_port: index_port + 1,
                flavor,
                key,
                key_pos: 0,
                entered: false,
                index: 0,
                ldn: 0,
                global: HashMap::new(),
                logical: HashMap::new(),
                entries: 0,
                exits: 0,
            })),
        }
    }

    /// Chip id and revision registers (0x20, 0x21)
    pub fn with_chip_id(self, id: u8, revision: u8) -> Self {
        self.set_global(0x20, id);
        self.set_global(0x21, revision);
        self
    }

    /// Base address registers (0x60, 0x61) of logical device `ldn`
    pub fn with_base_address(self, ldn: u8, base: u16) -> Self {
        self.set_logical(ldn, 0x60, (base >> 8) as u8);
        self.set_logical(ldn, 0x61, base as u8);
        self
    }

    pub fn set_global(&self, register: u8, value: u8) {
        self.state.lock().global.insert(register, value);
    }

    pub fn set_logical(&self, ldn: u8, register: u8, value: u8) {
        self.state.lock().logical.insert((ldn, register), value);
    }

    pub fn logical(&self, ldn: u8, register: u8) -> u8 {
        self.state
            .lock()
            .logical
            .get(&(ldn, register))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_entered(&self) -> bool {
        self.state.lock().entered
    }

    pub fn entries(&self) -> usize {
        self.state.lock().entries
    }

    pub fn exits(&self) -> usize {
        self.state.lock().exits
    }
}

impl PortDevice for SuperIoConfig {
    fn claims(&self, port: u16) -> bool {
        let state = self.state.lock();
        port == state.index_port || port == state.data_port
    }

    fn read(&mut self, port: u16) -> u8 {
        let state = self.state.lock();
        if !state.entered {
            return 0xFF;
        }
        if port == state.index_port {
            return state.index;
        }
        match state.index {
            0x07 => state.ldn,
            i if i < 0x30 => state.global.get(&i).copied().unwrap_or(0),
            i => state.logical.get(&(state.ldn, i)).copied().unwrap_or(0),
        }
    }

    fn write(&mut self, port: u16, value: u8) {
        let mut state = self.state.lock();
        if port == state.index_port {
            if !state.entered {
                if value == state.key[state.key_pos] {
                    state.key_pos += 1;
                    if state.key_pos == state.key.len() {
                        state.entered = true;
                        state.entries += 1;
                        state.key_pos = 0;
                    }
                } else {
                    state.key_pos = usize::from(value == state.key[0]);
                }
            } else if state.flavor == ConfigFlavor::Winbond && value == 0xAA {
                state.entered = false;
                state.exits += 1;
            } else {
                state.index = value;
            }
            return;
        }

        if !state.entered {
            return;
        }
        match state.index {
            0x07 => state.ldn = value,
            0x02 if state.flavor == ConfigFlavor::Ite && value & 0x02 != 0 => {
                state.entered = false;
                state.exits += 1;
            }
            i if i < 0x30 => {
                state.global.insert(i, value);
            }
            i => {
                let ldn = state.ldn;
                state.logical.insert((ldn, i), value);
            }
        }
    }
}
