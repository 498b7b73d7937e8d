//! Legacy virtio transport emulation.
//!
//! A [`VirtioEmul`] pairs the transport state (two vrings, RX = 0 and
//! TX = 1, plus the legacy PCI register block) with a device model. All
//! vring traffic goes through the guest-RAM touch path: descriptor,
//! avail and used records are read and written in place in guest
//! memory, and the used ring is only published after the host side of a
//! transfer has completed.
//!
//! Device models implement [`VirtioDevice`] for their extra config
//! registers and the TX notify; the net and console models live in
//! [`net`] and [`console`].

pub mod console;
pub mod net;

use thiserror::Error;
use vm_memory::ByteValued;

use crate::ioports::{IoFault, IoPortHandler};
use crate::memory::MemoryError;
use crate::vm::{Result as VmResult, Vm};

pub const RX_QUEUE: usize = 0;
pub const TX_QUEUE: usize = 1;
const NUM_QUEUES: usize = 2;

/// Legacy register block.
pub mod regs {
    pub const HOST_FEATURES: u16 = 0x00;
    pub const GUEST_FEATURES: u16 = 0x04;
    pub const QUEUE_PFN: u16 = 0x08;
    pub const QUEUE_NUM: u16 = 0x0c;
    pub const QUEUE_SEL: u16 = 0x0e;
    pub const QUEUE_NOTIFY: u16 = 0x10;
    pub const STATUS: u16 = 0x12;
    pub const ISR: u16 = 0x13;
    /// Device-specific config space starts here.
    pub const CONFIG: u16 = 0x14;
}

/// Driver-ready status value.
pub const STATUS_DRIVER_OK: u8 = 4;

pub const VRING_DESC_F_NEXT: u16 = 1;
pub const VRING_DESC_F_WRITE: u16 = 2;

/// Legacy ring alignment: the used ring starts on the next page.
const VRING_ALIGN: u64 = 4096;

#[derive(Error, Debug)]
pub enum VirtioError {
    #[error("vring not initialised for queue {0}")]
    RingNotReady(usize),

    #[error("descriptor index {0} out of range")]
    BadDescriptor(u16),

    #[error("dma buffer allocation failed")]
    DmaExhausted,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// One descriptor record, as laid out in guest memory.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VringDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

// Safe: plain little-endian integers, no padding at repr(C, packed).
unsafe impl ByteValued for VringDesc {}

/// One used-ring element.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VringUsedElem {
    pub id: u32,
    pub len: u32,
}

unsafe impl ByteValued for VringUsedElem {}

/// Guest addresses of one ring's three parts.
#[derive(Debug, Clone, Copy, Default)]
struct Vring {
    num: u16,
    desc: u64,
    avail: u64,
    used: u64,
}

impl Vring {
    /// Legacy layout from a queue PFN: descriptors at the base, avail
    /// right after, used on the next ring-aligned boundary.
    fn from_pfn(pfn: u32, num: u16) -> Vring {
        let base = (pfn as u64) << 12;
        let avail = base + 16 * num as u64;
        let avail_end = avail + 4 + 2 * num as u64 + 2;
        let used = (avail_end + VRING_ALIGN - 1) & !(VRING_ALIGN - 1);
        Vring {
            num,
            desc: base,
            avail,
            used,
        }
    }

    fn ready(&self) -> bool {
        self.desc != 0 && self.num != 0
    }
}

/// Transport-level state shared by every device type.
pub struct Transport {
    queue_size: [u16; NUM_QUEUES],
    queue_pfn: [u32; NUM_QUEUES],
    last_idx: [u16; NUM_QUEUES],
    rings: [Vring; NUM_QUEUES],
    status: u8,
    queue_sel: u16,
}

impl Transport {
    pub fn new(queue_size: u16) -> Transport {
        Transport {
            queue_size: [queue_size; NUM_QUEUES],
            queue_pfn: [0; NUM_QUEUES],
            last_idx: [0; NUM_QUEUES],
            rings: [Vring::default(); NUM_QUEUES],
            status: 0,
            queue_sel: 0,
        }
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn driver_ok(&self) -> bool {
        self.status == STATUS_DRIVER_OK
    }

    fn ring(&self, queue: usize) -> Result<&Vring, VirtioError> {
        let ring = &self.rings[queue];
        if !ring.ready() {
            return Err(VirtioError::RingNotReady(queue));
        }
        Ok(ring)
    }

    /// The guest's current avail index.
    pub fn avail_idx(&self, vm: &Vm, queue: usize) -> Result<u16, VirtioError> {
        let ring = self.ring(queue)?;
        let mut bytes = [0u8; 2];
        vm.mem.ram_read(vm.kernel.as_ref(), ring.avail + 2, &mut bytes)?;
        Ok(u16::from_le_bytes(bytes))
    }

    /// Head descriptor index published at avail slot `idx`.
    pub fn avail_ring(&self, vm: &Vm, queue: usize, idx: u16) -> Result<u16, VirtioError> {
        let ring = self.ring(queue)?;
        let slot = ring.avail + 4 + 2 * (idx % ring.num) as u64;
        let mut bytes = [0u8; 2];
        vm.mem.ram_read(vm.kernel.as_ref(), slot, &mut bytes)?;
        Ok(u16::from_le_bytes(bytes))
    }

    /// Descriptor record `idx`.
    pub fn desc(&self, vm: &Vm, queue: usize, idx: u16) -> Result<VringDesc, VirtioError> {
        let ring = self.ring(queue)?;
        if idx >= ring.num {
            return Err(VirtioError::BadDescriptor(idx));
        }
        let mut desc = VringDesc::default();
        vm.mem.ram_read(
            vm.kernel.as_ref(),
            ring.desc + 16 * idx as u64,
            desc.as_mut_slice(),
        )?;
        Ok(desc)
    }

    /// Publish one used element and bump the used index. Ordering: the
    /// element is written before the index that makes it visible.
    pub fn used_add(
        &self,
        vm: &Vm,
        queue: usize,
        elem: VringUsedElem,
    ) -> Result<(), VirtioError> {
        let ring = self.ring(queue)?;
        let mut idx_bytes = [0u8; 2];
        vm.mem
            .ram_read(vm.kernel.as_ref(), ring.used + 2, &mut idx_bytes)?;
        let used_idx = u16::from_le_bytes(idx_bytes);
        let slot = ring.used + 4 + 8 * (used_idx % ring.num) as u64;
        vm.mem.ram_write(vm.kernel.as_ref(), slot, elem.as_slice())?;
        let next = used_idx.wrapping_add(1);
        vm.mem
            .ram_write(vm.kernel.as_ref(), ring.used + 2, &next.to_le_bytes())?;
        Ok(())
    }

    pub fn last_idx(&self, queue: usize) -> u16 {
        self.last_idx[queue]
    }

    pub fn set_last_idx(&mut self, queue: usize, idx: u16) {
        self.last_idx[queue] = idx;
    }
}

/// Device-type hooks over the shared transport.
pub trait VirtioDevice: Send {
    /// Device-specific config register read; `None` defers to the
    /// transport.
    fn device_io_in(&mut self, offset: u16, size: usize) -> Option<u32>;

    /// Device-specific config register write; `false` defers to the
    /// transport.
    fn device_io_out(&mut self, offset: u16, size: usize, value: u32) -> bool;

    /// The guest kicked the TX queue.
    fn notify(&mut self, vm: &mut Vm, transport: &mut Transport) -> VmResult<()>;
}

/// A virtio device: transport plus model, registered as one ioport (or
/// PCI IO mirror) handler.
pub struct VirtioEmul<D: VirtioDevice> {
    pub transport: Transport,
    pub device: D,
    /// Port base the register block was registered at.
    iobase: u16,
}

impl<D: VirtioDevice> VirtioEmul<D> {
    pub fn new(queue_size: u16, iobase: u16, device: D) -> VirtioEmul<D> {
        VirtioEmul {
            transport: Transport::new(queue_size),
            device,
            iobase,
        }
    }

    fn io_in(&mut self, offset: u16, size: usize) -> u32 {
        if let Some(value) = self.device.device_io_in(offset, size) {
            return value;
        }
        match offset {
            regs::HOST_FEATURES => 0,
            regs::STATUS => self.transport.status as u32,
            regs::QUEUE_NUM => self.transport.queue_size[self.transport.queue_sel as usize] as u32,
            regs::QUEUE_PFN => self.transport.queue_pfn[self.transport.queue_sel as usize],
            // Reading the ISR acknowledges it; there is one source.
            regs::ISR => 1,
            _ => {
                log::warn!("unhandled virtio register read at {offset:#x} (size {size})");
                0
            }
        }
    }

    fn io_out(&mut self, vm: &mut Vm, offset: u16, size: usize, value: u32) -> VmResult<()> {
        if self.device.device_io_out(offset, size, value) {
            return Ok(());
        }
        match offset {
            regs::STATUS => self.transport.status = value as u8,
            regs::QUEUE_SEL => {
                let queue = value as u16;
                if (queue as usize) < NUM_QUEUES {
                    self.transport.queue_sel = queue;
                } else {
                    log::warn!("virtio queue select {queue} out of range");
                }
            }
            regs::QUEUE_PFN => {
                let queue = self.transport.queue_sel as usize;
                self.transport.queue_pfn[queue] = value;
                self.transport.rings[queue] =
                    Vring::from_pfn(value, self.transport.queue_size[queue]);
            }
            regs::QUEUE_NOTIFY => {
                if value as usize == TX_QUEUE {
                    if self.transport.driver_ok() {
                        self.device.notify(vm, &mut self.transport)?;
                    }
                }
                // An RX kick means the guest added buffers; anything we
                // dropped for lack of space stays dropped.
            }
            regs::GUEST_FEATURES => {
                log::debug!("guest features acknowledged: {value:#x}");
            }
            _ => {
                log::warn!(
                    "unhandled virtio register write at {offset:#x} (size {size}) = {value:#x}"
                );
            }
        }
        Ok(())
    }
}

impl<D: VirtioDevice> IoPortHandler for VirtioEmul<D> {
    fn port_in(&mut self, _vm: &mut Vm, _vcpu: usize, port: u16, size: usize) -> (IoFault, u32) {
        (IoFault::Handled, self.io_in(port - self.iobase, size))
    }

    fn port_out(
        &mut self,
        vm: &mut Vm,
        _vcpu: usize,
        port: u16,
        size: usize,
        value: u32,
    ) -> IoFault {
        match self.io_out(vm, port - self.iobase, size, value) {
            Ok(()) => IoFault::Handled,
            Err(err) => {
                log::error!("virtio register write failed: {err}");
                IoFault::Error
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vring_layout_from_pfn() {
        let ring = Vring::from_pfn(0x40100, 128);
        assert_eq!(ring.desc, 0x4010_0000);
        assert_eq!(ring.avail, 0x4010_0000 + 128 * 16);
        // avail is flags + idx + 128 slots + used_event = 0x106 bytes;
        // used starts on the next page.
        assert_eq!(ring.used, 0x4010_1000);
    }

    #[test]
    fn test_desc_record_size() {
        assert_eq!(std::mem::size_of::<VringDesc>(), 16);
        assert_eq!(std::mem::size_of::<VringUsedElem>(), 8);
    }
}
