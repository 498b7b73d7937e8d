//! Virtio network device model.
//!
//! TX: the guest's descriptor chains are drained on notify. The first
//! 12 bytes of each chain are the virtio net header and never reach the
//! backend; the remainder is concatenated into a DMA-pinned bounce
//! buffer (bounded by [`BUF_SIZE`]) and handed to the backend's
//! `raw_tx`. The used element publishes with length 0 once the backend
//! accepts the frame.
//!
//! RX: the backend delivers frames through
//! [`VirtioEmul::<NetDevice>::rx_complete`], which fills one avail
//! chain with a zeroed header followed by the payload, truncating on a
//! short chain, then publishes the used element and raises the device
//! interrupt.

use vm_memory::ByteValued;

use crate::memory::dma::DmaPool;
use crate::virtio::VringDesc;
use crate::vm::{Result as VmResult, Vm};

use super::{
    regs, Transport, VirtioDevice, VirtioEmul, VringUsedElem, RX_QUEUE, TX_QUEUE,
    VRING_DESC_F_NEXT,
};

/// Bounce-buffer (and therefore frame) size limit.
pub const BUF_SIZE: u64 = 2048;

/// The one feature the model offers: a stable MAC in config space.
const VIRTIO_NET_F_MAC: u32 = 1 << 5;

/// Legacy virtio net header, always 12 bytes on this transport.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
    pub num_buffers: u16,
}

unsafe impl ByteValued for VirtioNetHdr {}

pub const NET_HDR_LEN: usize = std::mem::size_of::<VirtioNetHdr>();

/// Outcome of handing a frame to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxResult {
    /// The frame left the building; complete the descriptor chain.
    Complete,
    /// The frame was dropped; complete the chain anyway.
    Failed,
}

/// The physical-driver seam: a backend ships frames and reports its MAC.
pub trait NetBackend: Send {
    fn mac(&self) -> [u8; 6];
    /// Transmit one frame pinned at `paddr`.
    fn raw_tx(&mut self, vm: &mut Vm, paddr: u64, frame: &[u8]) -> TxResult;
}

/// Raise the device's interrupt line into the guest.
pub type InjectIrqFn = Box<dyn FnMut(&mut Vm) + Send>;

pub struct NetDevice {
    backend: Box<dyn NetBackend>,
    dma: DmaPool,
    mac: [u8; 6],
    inject_irq: InjectIrqFn,
}

impl NetDevice {
    pub fn new(backend: Box<dyn NetBackend>, dma: DmaPool, inject_irq: InjectIrqFn) -> NetDevice {
        let mac = backend.mac();
        NetDevice {
            backend,
            dma,
            mac,
            inject_irq,
        }
    }

    /// Drain the TX avail ring.
    fn notify_tx(&mut self, vm: &mut Vm, transport: &mut Transport) -> VmResult<()> {
        let guest_idx = match transport.avail_idx(vm, TX_QUEUE) {
            Ok(idx) => idx,
            Err(err) => {
                log::error!("virtio-net tx kick with no usable ring: {err}");
                return Ok(());
            }
        };
        let mut idx = transport.last_idx(TX_QUEUE);
        while idx != guest_idx {
            let desc_head = match transport.avail_ring(vm, TX_QUEUE, idx) {
                Ok(head) => head,
                Err(err) => {
                    log::error!("virtio-net avail ring read failed: {err}");
                    break;
                }
            };
            let Some(paddr) = self.dma.alloc(BUF_SIZE, 64) else {
                // Out of bounce buffers; retry on the next kick.
                log::warn!("virtio-net tx stalled: dma pool exhausted");
                break;
            };

            // Concatenate the chain, skipping the net header.
            let mut frame = vec![0u8; BUF_SIZE as usize];
            let mut len = 0usize;
            let mut skipped = 0usize;
            let mut desc_idx = desc_head;
            loop {
                let desc = match transport.desc(vm, TX_QUEUE, desc_idx) {
                    Ok(desc) => desc,
                    Err(err) => {
                        log::error!("virtio-net descriptor read failed: {err}");
                        break;
                    }
                };
                let mut skip = 0usize;
                if skipped < NET_HDR_LEN {
                    skip = (NET_HDR_LEN - skipped).min(desc.len as usize);
                    skipped += skip;
                }
                // Truncate frames that exceed the bounce buffer.
                let this_len = (desc.len as usize - skip).min(BUF_SIZE as usize - len);
                vm.mem.ram_read(
                    vm.kernel.as_ref(),
                    desc.addr + skip as u64,
                    &mut frame[len..len + this_len],
                )?;
                len += this_len;
                if desc.flags & VRING_DESC_F_NEXT == 0 {
                    break;
                }
                desc_idx = desc.next;
            }

            match self.backend.raw_tx(vm, paddr, &frame[..len]) {
                TxResult::Complete => {
                    self.dma.free(paddr);
                    transport.used_add(
                        vm,
                        TX_QUEUE,
                        VringUsedElem {
                            id: desc_head as u32,
                            len: 0,
                        },
                    )?;
                    (self.inject_irq)(vm);
                }
                TxResult::Failed => {
                    self.dma.free(paddr);
                }
            }
            idx = idx.wrapping_add(1);
        }
        transport.set_last_idx(TX_QUEUE, idx);
        Ok(())
    }
}

impl VirtioDevice for NetDevice {
    fn device_io_in(&mut self, offset: u16, size: usize) -> Option<u32> {
        match offset {
            regs::HOST_FEATURES => Some(VIRTIO_NET_F_MAC),
            // MAC bytes in config space.
            0x14..=0x19 if size == 1 => Some(self.mac[(offset - 0x14) as usize] as u32),
            _ => None,
        }
    }

    fn device_io_out(&mut self, offset: u16, _size: usize, value: u32) -> bool {
        match offset {
            regs::GUEST_FEATURES => {
                if value != VIRTIO_NET_F_MAC {
                    log::warn!("guest negotiated unexpected net features {value:#x}");
                }
                true
            }
            _ => false,
        }
    }

    fn notify(&mut self, vm: &mut Vm, transport: &mut Transport) -> VmResult<()> {
        self.notify_tx(vm, transport)
    }
}

impl VirtioEmul<NetDevice> {
    /// Deliver received buffers into one RX chain: a zeroed net header,
    /// then each buffer in order, truncated if the chain runs short.
    pub fn rx_complete(&mut self, vm: &mut Vm, bufs: &[&[u8]]) -> VmResult<()> {
        let transport = &mut self.transport;
        let guest_idx = match transport.avail_idx(vm, RX_QUEUE) {
            Ok(idx) => idx,
            Err(err) => {
                log::debug!("virtio-net rx dropped, ring not ready: {err}");
                return Ok(());
            }
        };
        let idx = transport.last_idx(RX_QUEUE);
        if idx == guest_idx {
            // No guest buffers; the frame is dropped.
            return Ok(());
        }

        let hdr = VirtioNetHdr::default();
        let desc_head = match transport.avail_ring(vm, RX_QUEUE, idx) {
            Ok(head) => head,
            Err(err) => {
                log::error!("virtio-net rx avail read failed: {err}");
                return Ok(());
            }
        };

        let mut total_written = 0usize;
        let mut desc_written = 0usize;
        let mut buf_written = 0usize;
        // Buffer index; `None` is the net header.
        let mut current: Option<usize> = None;
        let mut desc_idx = desc_head;
        let mut desc = match transport.desc(vm, RX_QUEUE, desc_idx) {
            Ok(desc) => desc,
            Err(err) => {
                log::error!("virtio-net rx descriptor read failed: {err}");
                return Ok(());
            }
        };
        loop {
            let src: &[u8] = match current {
                None => &hdr.as_slice()[buf_written..],
                Some(i) => &bufs[i][buf_written..],
            };
            let copy = src.len().min(desc.len as usize - desc_written);
            vm.mem.ram_write(
                vm.kernel.as_ref(),
                desc.addr + desc_written as u64,
                &src[..copy],
            )?;
            total_written += copy;
            desc_written += copy;
            buf_written += copy;

            if desc_written == desc.len as usize {
                if desc.flags & VRING_DESC_F_NEXT == 0 {
                    // Chain too short for the whole packet: truncate.
                    break;
                }
                desc_idx = desc.next;
                desc = match transport.desc(vm, RX_QUEUE, desc_idx) {
                    Ok(desc) => desc,
                    Err(err) => {
                        log::error!("virtio-net rx descriptor read failed: {err}");
                        break;
                    }
                };
                desc_written = 0;
            }

            let cur_len = match current {
                None => super::net::NET_HDR_LEN,
                Some(i) => bufs[i].len(),
            };
            if buf_written == cur_len {
                let next = current.map(|i| i + 1).unwrap_or(0);
                if next >= bufs.len() {
                    break;
                }
                current = Some(next);
                buf_written = 0;
            }
        }

        transport.used_add(
            vm,
            RX_QUEUE,
            VringUsedElem {
                id: desc_head as u32,
                len: total_written as u32,
            },
        )?;
        transport.set_last_idx(RX_QUEUE, idx.wrapping_add(1));
        (self.device.inject_irq)(vm);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mock::MockKernel;
    use crate::kernel::KernelOps;
    use crate::memory::dma::DmaPool;
    use crate::virtio::regs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const RAM_BASE: u64 = 0x4000_0000;
    const QUEUE_SIZE: u16 = 128;

    struct CapturingBackend {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl NetBackend for CapturingBackend {
        fn mac(&self) -> [u8; 6] {
            [0x02, 0x00, 0x00, 0x00, 0x00, 0x01]
        }

        fn raw_tx(&mut self, _vm: &mut Vm, _paddr: u64, frame: &[u8]) -> TxResult {
            self.frames.lock().unwrap().push(frame.to_vec());
            TxResult::Complete
        }
    }

    struct TestNet {
        vm: Vm,
        emul: VirtioEmul<NetDevice>,
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        irqs: Arc<AtomicUsize>,
    }

    fn test_net() -> TestNet {
        let kernel: Arc<dyn KernelOps> = Arc::new(MockKernel::new());
        let ep = kernel.create_endpoint().unwrap();
        let mut vm =
            Vm::new(kernel, 1, "net-vm", ep, crate::arch::VmArch::new_x86()).unwrap();
        vm.create_vcpu(100).unwrap();
        vm.ram_register_at(RAM_BASE, 0x10_0000, false).unwrap();

        let frames = Arc::new(Mutex::new(Vec::new()));
        let irqs = Arc::new(AtomicUsize::new(0));
        let irqs_cb = irqs.clone();
        let device = NetDevice::new(
            Box::new(CapturingBackend {
                frames: frames.clone(),
            }),
            DmaPool::new(0x8000_0000, 16, 6),
            Box::new(move |_| {
                irqs_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let mut emul = VirtioEmul::new(QUEUE_SIZE, 0x6200, device);

        // Driver bring-up through the register block: place both rings
        // and go live.
        use crate::ioports::IoPortHandler;
        for queue in [RX_QUEUE, TX_QUEUE] {
            let pfn = (ring_base(queue) >> 12) as u32;
            emul.port_out(&mut vm, 0, 0x6200 + regs::QUEUE_SEL, 2, queue as u32);
            emul.port_out(&mut vm, 0, 0x6200 + regs::QUEUE_PFN, 4, pfn);
        }
        emul.port_out(
            &mut vm,
            0,
            0x6200 + regs::STATUS,
            1,
            super::super::STATUS_DRIVER_OK as u32,
        );
        TestNet {
            vm,
            emul,
            frames,
            irqs,
        }
    }

    fn ring_base(queue: usize) -> u64 {
        RAM_BASE + 0x2_0000 + queue as u64 * 0x1_0000
    }

    fn write_desc(vm: &Vm, queue: usize, idx: u16, desc: VringDesc) {
        vm.ram_write(ring_base(queue) + 16 * idx as u64, desc.as_slice())
            .unwrap();
    }

    fn publish_avail(vm: &Vm, queue: usize, slot: u16, desc_head: u16, new_idx: u16) {
        let avail = ring_base(queue) + 16 * QUEUE_SIZE as u64;
        vm.ram_write(avail + 4 + 2 * (slot % QUEUE_SIZE) as u64, &desc_head.to_le_bytes())
            .unwrap();
        vm.ram_write(avail + 2, &new_idx.to_le_bytes()).unwrap();
    }

    fn read_used(vm: &Vm, queue: usize, slot: u16) -> (u16, u32, u32) {
        let used = (ring_base(queue) + 16 * QUEUE_SIZE as u64 + 4 + 2 * QUEUE_SIZE as u64 + 2
            + 4095)
            & !4095;
        let mut idx = [0u8; 2];
        vm.ram_read(used + 2, &mut idx).unwrap();
        let mut elem = [0u8; 8];
        vm.ram_read(used + 4 + 8 * (slot % QUEUE_SIZE) as u64, &mut elem).unwrap();
        (
            u16::from_le_bytes(idx),
            u32::from_le_bytes(elem[0..4].try_into().unwrap()),
            u32::from_le_bytes(elem[4..8].try_into().unwrap()),
        )
    }

    #[test]
    fn test_tx_skips_header_and_completes_chain() {
        let mut t = test_net();

        // Two-descriptor chain: 12-byte header, then a 1500-byte frame.
        let hdr_addr = RAM_BASE + 0x1000;
        let pkt_addr = RAM_BASE + 0x2000;
        let payload: Vec<u8> = (0..1500u32).map(|v| (v % 251) as u8).collect();
        t.vm.ram_write(pkt_addr, &payload).unwrap();
        write_desc(
            &t.vm,
            TX_QUEUE,
            0,
            VringDesc {
                addr: hdr_addr,
                len: NET_HDR_LEN as u32,
                flags: VRING_DESC_F_NEXT,
                next: 1,
            },
        );
        write_desc(
            &t.vm,
            TX_QUEUE,
            1,
            VringDesc {
                addr: pkt_addr,
                len: 1500,
                flags: 0,
                next: 0,
            },
        );
        publish_avail(&t.vm, TX_QUEUE, 0, 0, 1);

        // Guest kicks the TX queue.
        use crate::ioports::IoPortHandler;
        t.emul.port_out(&mut t.vm, 0, 0x6200 + regs::QUEUE_NOTIFY, 2, TX_QUEUE as u32);

        // The backend saw exactly the frame, no header.
        let frames = t.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], payload);
        drop(frames);

        // One used element: id = chain head, len = 0, one interrupt.
        let (used_idx, id, len) = read_used(&t.vm, TX_QUEUE, 0);
        assert_eq!(used_idx, 1);
        assert_eq!(id, 0);
        assert_eq!(len, 0);
        assert_eq!(t.irqs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rx_prepends_header_and_truncates() {
        let mut t = test_net();

        // The guest posts a two-descriptor RX chain: 12 + 64 bytes.
        let hdr_addr = RAM_BASE + 0x3000;
        let buf_addr = RAM_BASE + 0x4000;
        write_desc(
            &t.vm,
            RX_QUEUE,
            0,
            VringDesc {
                addr: hdr_addr,
                len: NET_HDR_LEN as u32,
                flags: VRING_DESC_F_NEXT | super::super::VRING_DESC_F_WRITE,
                next: 1,
            },
        );
        write_desc(
            &t.vm,
            RX_QUEUE,
            1,
            VringDesc {
                addr: buf_addr,
                len: 64,
                flags: super::super::VRING_DESC_F_WRITE,
                next: 0,
            },
        );
        publish_avail(&t.vm, RX_QUEUE, 0, 0, 1);

        // Host delivers a 100-byte frame: truncated to the chain.
        let frame: Vec<u8> = (0..100u8).collect();
        t.emul.rx_complete(&mut t.vm, &[&frame]).unwrap();

        let (used_idx, id, len) = read_used(&t.vm, RX_QUEUE, 0);
        assert_eq!(used_idx, 1);
        assert_eq!(id, 0);
        assert_eq!(len as usize, NET_HDR_LEN + 64);

        let mut delivered = vec![0u8; 64];
        t.vm.ram_read(buf_addr, &mut delivered).unwrap();
        assert_eq!(&delivered, &frame[..64]);
        assert_eq!(t.irqs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rx_without_buffers_is_dropped() {
        let mut t = test_net();
        t.emul.rx_complete(&mut t.vm, &[&[1, 2, 3]]).unwrap();
        assert_eq!(t.irqs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_mac_visible_in_config_space() {
        let mut t = test_net();
        use crate::ioports::IoPortHandler;
        let (_, first) = t.emul.port_in(&mut t.vm, 0, 0x6200 + 0x14, 1);
        assert_eq!(first, 0x02);
        let (_, last) = t.emul.port_in(&mut t.vm, 0, 0x6200 + 0x19, 1);
        assert_eq!(last, 0x01);
    }
}
