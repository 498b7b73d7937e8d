//! Layered config-space shims: BAR capture, interrupt-line patching and
//! capability-list pruning.
//!
//! Each shim wraps an existing [`PciConfig`] entry and intercepts a
//! slice of the header while passing everything else through, so they
//! stack in any order over a [`MemDevice`] or a passthrough entry.
//!
//! [`MemDevice`]: super::MemDevice

use super::{
    PciConfig, Result, PCI_BASE_ADDRESS_0, PCI_CAPABILITY_LIST, PCI_INTERRUPT_LINE, PCI_STATUS,
    PCI_STATUS_CAP_LIST,
};

/// All-ones write that starts the size-probe handshake.
const PCI_CFG_BAR_MASK: u32 = 0xffff_ffff;

const MAX_BARS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciBarType {
    Io,
    Mem32,
    PrefetchMem32,
}

/// One emulated base address register.
#[derive(Debug, Clone, Copy)]
pub struct PciBar {
    pub mem_type: PciBarType,
    pub address: u32,
    pub size_bits: u8,
}

/// BAR emulation: reads reassemble each BAR from its declared
/// `{mem_type, address, size_bits}`; guest writes are captured and only
/// their high (out-of-range) bits read back. Writing all-ones makes the
/// next read return `1 << size_bits`, which is how the guest's resource
/// enumerator sizes the region.
pub struct BarEmulation {
    passthrough: Box<dyn PciConfig>,
    bars: Vec<PciBar>,
    bar_writes: [u32; MAX_BARS],
}

impl BarEmulation {
    pub fn new(passthrough: Box<dyn PciConfig>, bars: Vec<PciBar>) -> BarEmulation {
        debug_assert!(bars.len() <= MAX_BARS);
        BarEmulation {
            passthrough,
            bars,
            bar_writes: [0; MAX_BARS],
        }
    }

    fn in_bar_range(offset: u16, size: usize) -> bool {
        offset >= PCI_BASE_ADDRESS_0 && offset as usize + size <= PCI_BASE_ADDRESS_0 as usize + 24
    }

    fn make_bar(&self, bar: usize) -> u32 {
        let Some(spec) = self.bars.get(bar) else {
            return 0;
        };
        let mut raw = spec.address;
        match spec.mem_type {
            PciBarType::Io => raw |= 1,
            PciBarType::Mem32 => {}
            PciBarType::PrefetchMem32 => raw |= 1 << 3,
        }
        let size_mask = ((1u64 << spec.size_bits) - 1) as u32;
        raw | (self.bar_writes[bar] & !size_mask)
    }
}

impl PciConfig for BarEmulation {
    fn cfg_read(&mut self, offset: u16, size: usize) -> Result<u32> {
        if !Self::in_bar_range(offset, size) {
            return self.passthrough.cfg_read(offset, size);
        }
        let bar = ((offset - PCI_BASE_ADDRESS_0) / 4) as usize;
        let shift = (offset & 3) as u32 * 8;
        let raw = self.make_bar(bar) >> shift;
        Ok(if size >= 4 {
            raw
        } else {
            raw & ((1u32 << (size * 8)) - 1)
        })
    }

    fn cfg_write(&mut self, offset: u16, size: usize, value: u32) -> Result<()> {
        if !Self::in_bar_range(offset, size) {
            return self.passthrough.cfg_write(offset, size, value);
        }
        let bar = ((offset - PCI_BASE_ADDRESS_0) / 4) as usize;
        if size == 4 && value == PCI_CFG_BAR_MASK && bar < self.bars.len() {
            // Size probe: the next read reports the region size.
            self.bar_writes[bar] = 1u32 << self.bars[bar].size_bits;
            return Ok(());
        }
        let shift = (offset & 3) as u32 * 8;
        let mask = if size >= 4 {
            u32::MAX
        } else {
            ((1u32 << (size * 8)) - 1) << shift
        };
        self.bar_writes[bar] = (self.bar_writes[bar] & !mask) | ((value << shift) & mask);
        Ok(())
    }
}

/// Patch the interrupt-line register with the virtual IRQ; guest writes
/// to it are dropped.
pub struct IrqEmulation {
    passthrough: Box<dyn PciConfig>,
    irq: u8,
}

impl IrqEmulation {
    pub fn new(passthrough: Box<dyn PciConfig>, irq: u8) -> IrqEmulation {
        IrqEmulation { passthrough, irq }
    }
}

impl PciConfig for IrqEmulation {
    fn cfg_read(&mut self, offset: u16, size: usize) -> Result<u32> {
        let mut value = self.passthrough.cfg_read(offset, size)?;
        if offset <= PCI_INTERRUPT_LINE && offset as usize + size > PCI_INTERRUPT_LINE as usize {
            let bit_offset = (PCI_INTERRUPT_LINE - offset) * 8;
            value &= !(0xffu32 << bit_offset);
            value |= (self.irq as u32) << bit_offset;
        }
        Ok(value)
    }

    fn cfg_write(&mut self, offset: u16, size: usize, value: u32) -> Result<()> {
        if offset == PCI_INTERRUPT_LINE && size == 1 {
            return Ok(());
        }
        if offset < PCI_INTERRUPT_LINE && offset as usize + size > PCI_INTERRUPT_LINE as usize {
            log::warn!("straddling write over the interrupt-line register dropped");
            return Ok(());
        }
        self.passthrough.cfg_write(offset, size, value)
    }
}

/// Prune the capability list: only the listed capability pointers are
/// visible, and reads inside the masked ranges (MSI/MSI-X) return zero.
pub struct CapEmulation {
    passthrough: Box<dyn PciConfig>,
    caps: Vec<u8>,
    ignore: Vec<(u16, u16)>,
}

impl CapEmulation {
    pub fn new(
        passthrough: Box<dyn PciConfig>,
        caps: Vec<u8>,
        ignore: Vec<(u16, u16)>,
    ) -> CapEmulation {
        CapEmulation {
            passthrough,
            caps,
            ignore,
        }
    }
}

impl PciConfig for CapEmulation {
    fn cfg_read(&mut self, offset: u16, size: usize) -> Result<u32> {
        if offset <= PCI_STATUS && offset as usize + size > PCI_STATUS as usize {
            let mut value = self.passthrough.cfg_read(offset, size)?;
            let bit_offset = (PCI_STATUS - offset) * 8;
            value &= !(PCI_STATUS_CAP_LIST << bit_offset);
            if !self.caps.is_empty() {
                value |= PCI_STATUS_CAP_LIST << bit_offset;
            }
            return Ok(value);
        }
        if offset <= PCI_CAPABILITY_LIST && offset as usize + size > PCI_CAPABILITY_LIST as usize {
            let mut value = self.passthrough.cfg_read(offset, size)?;
            let bit_offset = (PCI_CAPABILITY_LIST - offset) * 8;
            value &= !(0xffu32 << bit_offset);
            if let Some(&first) = self.caps.first() {
                value |= (first as u32) << bit_offset;
            }
            return Ok(value);
        }
        for &(start, end) in &self.ignore {
            if offset >= start && offset < end {
                log::debug!("read at {offset:#x} inside masked capability range");
                return Ok(0);
            }
        }
        self.passthrough.cfg_read(offset, size)
    }

    fn cfg_write(&mut self, offset: u16, size: usize, value: u32) -> Result<()> {
        for &(start, end) in &self.ignore {
            if offset >= start && offset < end {
                log::debug!("write at {offset:#x} inside masked capability range dropped");
                return Ok(());
            }
        }
        self.passthrough.cfg_write(offset, size, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::{MemDevice, PciDeviceHeader};

    fn bar_device() -> BarEmulation {
        let dev = MemDevice::new(PciDeviceHeader {
            vendor_id: 0x1af4,
            device_id: 0x1000,
            ..PciDeviceHeader::default()
        });
        BarEmulation::new(
            Box::new(dev),
            vec![
                PciBar {
                    mem_type: PciBarType::Mem32,
                    address: 0x1000_0000,
                    size_bits: 12,
                },
                PciBar {
                    mem_type: PciBarType::Io,
                    address: 0x6200,
                    size_bits: 6,
                },
            ],
        )
    }

    #[test]
    fn test_bar_read_assembles_declared_value() {
        let mut dev = bar_device();
        assert_eq!(dev.cfg_read(0x10, 4).unwrap(), 0x1000_0000);
        // IO BARs carry the space-indicator bit.
        assert_eq!(dev.cfg_read(0x14, 4).unwrap(), 0x6201);
        // Undeclared BARs read zero.
        assert_eq!(dev.cfg_read(0x18, 4).unwrap(), 0);
    }

    #[test]
    fn test_size_probe_handshake() {
        let mut dev = bar_device();
        dev.cfg_write(0x10, 4, 0xffff_ffff).unwrap();
        assert_eq!(dev.cfg_read(0x10, 4).unwrap(), 0x1000_0000 | 1 << 12);
        // Writing the address back restores the plain value.
        dev.cfg_write(0x10, 4, 0x1000_0000).unwrap();
        assert_eq!(dev.cfg_read(0x10, 4).unwrap(), 0x1000_0000);
    }

    #[test]
    fn test_non_bar_offsets_pass_through() {
        let mut dev = bar_device();
        assert_eq!(dev.cfg_read(0, 2).unwrap(), 0x1af4);
    }

    #[test]
    fn test_irq_patching() {
        let dev = MemDevice::new(PciDeviceHeader::default());
        let mut dev = IrqEmulation::new(Box::new(dev), 11);
        assert_eq!(dev.cfg_read(PCI_INTERRUPT_LINE, 1).unwrap(), 11);
        // Writes to the line register are dropped.
        dev.cfg_write(PCI_INTERRUPT_LINE, 1, 5).unwrap();
        assert_eq!(dev.cfg_read(PCI_INTERRUPT_LINE, 1).unwrap(), 11);
    }

    #[test]
    fn test_cap_masking() {
        let mut header = PciDeviceHeader::default();
        header.status = 0x10;
        header.caps_pointer = 0x50;
        let dev = MemDevice::new(header);
        let mut dev = CapEmulation::new(Box::new(dev), vec![], vec![(0x50, 0x60)]);
        // With no surviving caps the status bit clears and the pointer
        // reads zero.
        assert_eq!(dev.cfg_read(PCI_STATUS, 2).unwrap() & 0x10, 0);
        assert_eq!(dev.cfg_read(PCI_CAPABILITY_LIST, 1).unwrap(), 0);
        assert_eq!(dev.cfg_read(0x54, 4).unwrap(), 0);
    }
}
