//! Virtual PCI configuration space.
//!
//! A [`PciSpace`] is bus 0 of a flat `entries[dev][fun]` table; function
//! 0 of device 0 is always the host bridge. Each entry is a
//! [`PciConfig`] trait object answering config reads and writes over an
//! arbitrary backing (an in-memory header for fully virtual devices, a
//! raw config accessor for passthrough, or one of the layering shims in
//! [`bar`]).
//!
//! The space is reachable two ways, both emulated here: the classic
//! address/data port pair (`0xcf8`/`0xcfc`), and a memory-mapped config
//! region whose offset layout mirrors the address register. On ARM the
//! port pair itself is reached through a second memory region that
//! forwards into the VM's ioport registry.

pub mod bar;

use std::sync::{Arc, Mutex};

use thiserror::Error;
use vm_memory::ByteValued;

use crate::ioports::{IoFault, IoPortHandler};
use crate::memory::FaultResult;
use crate::vcpu_fault;
use crate::vm::{Result as VmResult, Vm, VmError};

pub const PCI_NUM_DEVICES: usize = 32;
pub const PCI_NUM_FUNCTIONS: usize = 8;

/// Config-space register offsets.
pub const PCI_STATUS: u16 = 0x06;
pub const PCI_CAPABILITY_LIST: u16 = 0x34;
pub const PCI_INTERRUPT_LINE: u16 = 0x3c;
pub const PCI_BASE_ADDRESS_0: u16 = 0x10;
pub const PCI_STATUS_CAP_LIST: u32 = 0x10;

/// Everything above the standard header is capability space.
pub const PCI_CAPABILITY_SPACE_OFFSET: u16 = 0x40;

/// The classic config address/data port pair.
pub const PCI_CONFIG_ADDRESS_PORT: u16 = 0xcf8;
pub const PCI_CONFIG_DATA_PORT: u16 = 0xcfc;

#[derive(Error, Debug)]
pub enum PciError {
    #[error("config access at {offset:#x} (size {size}) out of range")]
    BadAccess { offset: u16, size: usize },

    #[error("device slot {dev}:{fun} already occupied")]
    SlotTaken { dev: u8, fun: u8 },

    #[error("no free device slot on the bus")]
    BusFull,
}

pub type Result<T> = std::result::Result<T, PciError>;

/// One logical device in configuration space.
pub trait PciConfig: Send {
    fn cfg_read(&mut self, offset: u16, size: usize) -> Result<u32>;
    fn cfg_write(&mut self, offset: u16, size: usize, value: u32) -> Result<()>;
}

/// Geographical address on the virtual bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub bus: u8,
    pub dev: u8,
    pub fun: u8,
}

/// Standard type-0 configuration header.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PciDeviceHeader {
    pub vendor_id: u16,
    pub device_id: u16,
    pub command: u16,
    pub status: u16,
    pub revision_id: u8,
    pub prog_if: u8,
    pub subclass: u8,
    pub class_code: u8,
    pub cache_line_size: u8,
    pub latency_timer: u8,
    pub header_type: u8,
    pub bist: u8,
    pub bars: [u32; 6],
    pub cardbus: u32,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub expansion_rom: u32,
    pub caps_pointer: u8,
    pub reserved: [u8; 7],
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
    pub min_grant: u8,
    pub max_latency: u8,
}

// Safe: plain integers, no padding at repr(C, packed).
unsafe impl ByteValued for PciDeviceHeader {}

impl PciDeviceHeader {
    /// The host bridge at 0:0.0.
    pub fn host_bridge() -> PciDeviceHeader {
        PciDeviceHeader {
            vendor_id: 0x5e14,
            device_id: 0x42,
            revision_id: 0x1,
            class_code: 0x06,
            ..PciDeviceHeader::default()
        }
    }
}

/// A fully virtual device: config accesses read and write an in-memory
/// header image. Capability space reads as zero.
pub struct MemDevice {
    header: [u8; PCI_CAPABILITY_SPACE_OFFSET as usize],
}

impl MemDevice {
    pub fn new(header: PciDeviceHeader) -> MemDevice {
        let mut bytes = [0u8; PCI_CAPABILITY_SPACE_OFFSET as usize];
        bytes.copy_from_slice(header.as_slice());
        MemDevice { header: bytes }
    }
}

impl PciConfig for MemDevice {
    fn cfg_read(&mut self, offset: u16, size: usize) -> Result<u32> {
        if offset as usize + size > self.header.len() {
            log::debug!("read of unimplemented capability space at {offset:#x}");
            return Ok(0);
        }
        let mut value = 0u32;
        for i in (0..size).rev() {
            value = value << 8 | self.header[offset as usize + i] as u32;
        }
        Ok(value)
    }

    fn cfg_write(&mut self, offset: u16, size: usize, value: u32) -> Result<()> {
        if offset as usize + size > self.header.len() || size > 4 {
            log::debug!("write to unimplemented capability space at {offset:#x}");
            return Ok(());
        }
        for i in 0..size {
            self.header[offset as usize + i] = (value >> (8 * i)) as u8;
        }
        Ok(())
    }
}

/// Raw config accessor supplied by a passthrough backend.
pub trait PciConfigBackend: Send {
    fn ioread(&mut self, addr: PciAddress, offset: u16, size: usize) -> u32;
    fn iowrite(&mut self, addr: PciAddress, offset: u16, size: usize, value: u32);
}

/// Forward config space to real hardware behind a backend accessor.
pub struct PassthroughDevice {
    addr: PciAddress,
    backend: Box<dyn PciConfigBackend>,
}

impl PassthroughDevice {
    pub fn new(addr: PciAddress, backend: Box<dyn PciConfigBackend>) -> PassthroughDevice {
        log::info!(
            "creating passthrough device for {:02x}:{:02x}.{}",
            addr.bus,
            addr.dev,
            addr.fun
        );
        PassthroughDevice { addr, backend }
    }
}

impl PciConfig for PassthroughDevice {
    fn cfg_read(&mut self, offset: u16, size: usize) -> Result<u32> {
        Ok(self.backend.ioread(self.addr, offset, size))
    }

    fn cfg_write(&mut self, offset: u16, size: usize, value: u32) -> Result<()> {
        self.backend.iowrite(self.addr, offset, size, value);
        Ok(())
    }
}

pub type PciEntry = Arc<Mutex<dyn PciConfig>>;

/// Bus 0 of the virtual config space.
pub struct PciSpace {
    entries: Vec<Option<PciEntry>>,
    /// Latched config-address register (the 0xcf8 side).
    config_address: u32,
    /// Port registry reachable through the IO mirror region on ARM.
    pub io_ports: crate::ioports::IoPortList,
}

impl PciSpace {
    pub fn new() -> PciSpace {
        let mut space = PciSpace {
            entries: (0..PCI_NUM_DEVICES * PCI_NUM_FUNCTIONS)
                .map(|_| None)
                .collect(),
            config_address: 0,
            io_ports: crate::ioports::IoPortList::new(),
        };
        space.entries[0] = Some(Arc::new(Mutex::new(MemDevice::new(
            PciDeviceHeader::host_bridge(),
        ))));
        space
    }

    fn slot(dev: u8, fun: u8) -> usize {
        dev as usize * PCI_NUM_FUNCTIONS + fun as usize
    }

    /// Install a device at the first free slot (function 0).
    pub fn add_entry(&mut self, entry: PciEntry) -> Result<PciAddress> {
        for dev in 0..PCI_NUM_DEVICES as u8 {
            if self.entries[Self::slot(dev, 0)].is_none() {
                self.entries[Self::slot(dev, 0)] = Some(entry);
                return Ok(PciAddress { bus: 0, dev, fun: 0 });
            }
        }
        Err(PciError::BusFull)
    }

    /// Install a device at an exact address.
    pub fn add_entry_at(&mut self, addr: PciAddress, entry: PciEntry) -> Result<PciAddress> {
        let slot = Self::slot(addr.dev, addr.fun);
        if self.entries[slot].is_some() {
            return Err(PciError::SlotTaken {
                dev: addr.dev,
                fun: addr.fun,
            });
        }
        self.entries[slot] = Some(entry);
        Ok(addr)
    }

    pub fn find(&self, addr: PciAddress) -> Option<PciEntry> {
        if addr.bus != 0 || addr.dev as usize >= PCI_NUM_DEVICES {
            return None;
        }
        self.entries[Self::slot(addr.dev, addr.fun)].clone()
    }

    /// Decode a config-mirror offset (same layout as the address
    /// register: fun in bits 8-10, dev in 11-15, bus in 16-23).
    pub fn decode_config_offset(offset: u64) -> (PciAddress, u16) {
        let addr = PciAddress {
            bus: ((offset >> 16) & 0xff) as u8,
            dev: ((offset >> 11) & 0x1f) as u8,
            fun: ((offset >> 8) & 0x7) as u8,
        };
        (addr, (offset & 0xff) as u16)
    }

    fn config_data_access(
        &mut self,
        offset_in_port: u16,
        size: usize,
        write: Option<u32>,
    ) -> u32 {
        let reg = (self.config_address & 0xfc) as u16 + offset_in_port;
        let (addr, _) = Self::decode_config_offset((self.config_address & 0x00ff_ff00) as u64);
        let Some(entry) = self.find(addr) else {
            return u32::MAX;
        };
        let Ok(mut dev) = entry.lock() else {
            log::error!("pci config entry lock poisoned");
            return u32::MAX;
        };
        match write {
            Some(value) => {
                if let Err(err) = dev.cfg_write(reg, size, value) {
                    log::error!("pci config write failed: {err}");
                }
                0
            }
            None => dev.cfg_read(reg, size).unwrap_or(u32::MAX),
        }
    }

    /// Port-level protocol: the address register latch plus data window.
    pub fn port_in(&mut self, port: u16, size: usize) -> u32 {
        match port {
            PCI_CONFIG_ADDRESS_PORT..=0xcfb => {
                self.config_address >> ((port - PCI_CONFIG_ADDRESS_PORT) * 8)
            }
            PCI_CONFIG_DATA_PORT..=0xcff => {
                self.config_data_access(port - PCI_CONFIG_DATA_PORT, size, None)
            }
            _ => u32::MAX,
        }
    }

    pub fn port_out(&mut self, port: u16, size: usize, value: u32) {
        match port {
            PCI_CONFIG_ADDRESS_PORT..=0xcfb => {
                let shift = (port - PCI_CONFIG_ADDRESS_PORT) * 8;
                let mask = if size >= 4 {
                    u32::MAX
                } else {
                    ((1u32 << (size * 8)) - 1) << shift
                };
                self.config_address =
                    (self.config_address & !mask) | ((value << shift) & mask);
            }
            PCI_CONFIG_DATA_PORT..=0xcff => {
                self.config_data_access(port - PCI_CONFIG_DATA_PORT, size, Some(value));
            }
            _ => {}
        }
    }
}

impl Default for PciSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridge the config port pair into the VM's ioport registry (x86).
pub struct PciConfigPorts;

impl IoPortHandler for PciConfigPorts {
    fn port_in(&mut self, vm: &mut Vm, _vcpu: usize, port: u16, size: usize) -> (IoFault, u32) {
        (IoFault::Handled, vm.pci.port_in(port, size))
    }

    fn port_out(
        &mut self,
        vm: &mut Vm,
        _vcpu: usize,
        port: u16,
        size: usize,
        value: u32,
    ) -> IoFault {
        vm.pci.port_out(port, size, value);
        IoFault::Handled
    }
}

/// Guest-physical layout of the memory-mapped PCI windows.
#[derive(Debug, Clone, Copy)]
pub struct VpciConfig {
    pub cfg_addr: u64,
    pub cfg_size: u64,
    pub io_addr: u64,
    pub io_size: u64,
    /// 32-bit memory window handed to device BARs.
    pub mem_addr: u64,
    pub mem_size: u64,
}

impl Default for VpciConfig {
    fn default() -> Self {
        VpciConfig {
            cfg_addr: 0x3f00_0000,
            cfg_size: 0x0100_0000,
            io_addr: 0x3eff_0000,
            io_size: 0x0001_0000,
            mem_addr: 0x4000_0000,
            mem_size: 0x1000_0000,
        }
    }
}

/// Install the memory-mapped config region and the IO mirror (ARM).
pub fn install_vpci(vm: &mut Vm, config: VpciConfig) -> VmResult<()> {
    let cfg_base = config.cfg_addr;
    vm.reserve_memory_at(
        config.cfg_addr,
        config.cfg_size,
        Box::new(move |vm, vcpu, addr, len| {
            match pci_cfg_fault(vm, vcpu, addr - cfg_base, len) {
                Ok(result) => result,
                Err(err) => {
                    log::error!("pci config fault failed: {err}");
                    FaultResult::Error
                }
            }
        }),
    )?;

    let io_base = config.io_addr;
    vm.reserve_memory_at(
        config.io_addr,
        config.io_size,
        Box::new(move |vm, vcpu, addr, len| {
            match pci_cfg_io_fault(vm, vcpu, (addr - io_base) as u16, len) {
                Ok(result) => result,
                Err(err) => {
                    log::error!("pci io-mirror fault failed: {err}");
                    FaultResult::Error
                }
            }
        }),
    )?;
    Ok(())
}

/// Memory-mapped config access.
fn pci_cfg_fault(vm: &mut Vm, vcpu: usize, offset: u64, _len: usize) -> VmResult<FaultResult> {
    let (mut addr, reg) = PciSpace::decode_config_offset(offset);
    // Multi-function devices are not emulated.
    addr.fun = 0;

    let Some(entry) = vm.pci.find(addr) else {
        log::warn!(
            "no pci device at {:02x}:{:02x}.{}",
            addr.bus,
            addr.dev,
            addr.fun
        );
        vcpu_fault::advance_fault(vm, vcpu)?;
        return Ok(FaultResult::Handled);
    };

    let size = vcpu_fault::get_fault_size(vm, vcpu)?;
    if vcpu_fault::is_read_fault(vm, vcpu)? {
        let data = entry
            .lock()
            .map_err(|_| VmError::LockPoisoned("pci config entry"))?
            .cfg_read(reg, size)
            .unwrap_or(u32::MAX);
        let shift = (vcpu_fault::get_fault_address(vm, vcpu)? & 0x3) * 8;
        vcpu_fault::set_fault_data(vm, vcpu, (data as u64) << shift)?;
    } else {
        let mask = vcpu_fault::get_fault_data_mask(vm, vcpu)?;
        let shift = (vcpu_fault::get_fault_address(vm, vcpu)? & 0x3) * 8;
        let value = ((vcpu_fault::get_fault_data(vm, vcpu)? & mask) >> shift) as u32;
        if let Err(err) = entry
            .lock()
            .map_err(|_| VmError::LockPoisoned("pci config entry"))?
            .cfg_write(reg, size, value)
        {
            log::error!("pci config write failed: {err}");
        }
    }
    vcpu_fault::advance_fault(vm, vcpu)?;
    Ok(FaultResult::Handled)
}

/// The IO mirror: memory faults re-expressed as port accesses.
fn pci_cfg_io_fault(vm: &mut Vm, vcpu: usize, port: u16, len: usize) -> VmResult<FaultResult> {
    let is_in = vcpu_fault::is_read_fault(vm, vcpu)?;
    let mut value = if is_in {
        0
    } else {
        vcpu_fault::get_fault_data(vm, vcpu)? as u32
    };
    // The registry is moved out of the VM so handlers can borrow the VM
    // back; registrations made mid-access are lost.
    let io_ports = std::mem::take(&mut vm.pci.io_ports);
    io_ports.emulate(vm, vcpu, port, is_in, len, &mut value);
    vm.pci.io_ports = io_ports;

    if is_in {
        let shift = (vcpu_fault::get_fault_address(vm, vcpu)? & 0x3) * 8;
        vcpu_fault::set_fault_data(vm, vcpu, (value as u64) << shift)?;
    }
    vcpu_fault::advance_fault(vm, vcpu)?;
    Ok(FaultResult::Handled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_bridge_at_zero() {
        let mut space = PciSpace::new();
        let entry = space
            .find(PciAddress {
                bus: 0,
                dev: 0,
                fun: 0,
            })
            .unwrap();
        let vendor = entry.lock().unwrap().cfg_read(0, 2).unwrap();
        assert_eq!(vendor, 0x5e14);
        let class = entry.lock().unwrap().cfg_read(0x0b, 1).unwrap();
        assert_eq!(class, 0x06);
    }

    #[test]
    fn test_add_entry_finds_free_slot() {
        let mut space = PciSpace::new();
        let addr = space
            .add_entry(Arc::new(Mutex::new(MemDevice::new(PciDeviceHeader {
                vendor_id: 0x1af4,
                device_id: 0x1000,
                ..PciDeviceHeader::default()
            }))))
            .unwrap();
        // Slot 0 is the host bridge.
        assert_eq!(addr.dev, 1);
        let entry = space.find(addr).unwrap();
        assert_eq!(entry.lock().unwrap().cfg_read(0, 2).unwrap(), 0x1af4);
    }

    #[test]
    fn test_port_protocol_roundtrip() {
        let mut space = PciSpace::new();
        // Select 0:0.0 register 0 through the address port.
        space.port_out(PCI_CONFIG_ADDRESS_PORT, 4, 0x8000_0000);
        let ids = space.port_in(PCI_CONFIG_DATA_PORT, 4);
        assert_eq!(ids & 0xffff, 0x5e14);
        // An empty slot reads all-ones.
        space.port_out(PCI_CONFIG_ADDRESS_PORT, 4, 0x8000_0000 | 5 << 11);
        assert_eq!(space.port_in(PCI_CONFIG_DATA_PORT, 4), u32::MAX);
    }

    #[test]
    fn test_decode_config_offset() {
        let (addr, reg) = PciSpace::decode_config_offset(3 << 11 | 1 << 8 | 0x10);
        assert_eq!(addr.dev, 3);
        assert_eq!(addr.fun, 1);
        assert_eq!(reg, 0x10);
    }
}
