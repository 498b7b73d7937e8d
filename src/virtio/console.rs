//! Virtio console device model.
//!
//! The console is a plain byte pipe: TX chains feed the backend one
//! byte at a time, RX delivers host bytes into the guest's posted
//! buffers. Unlike the net model there is no header to skip or prepend.

use crate::vm::{Result as VmResult, Vm};

use super::net::InjectIrqFn;
use super::{
    Transport, VirtioDevice, VirtioEmul, VringUsedElem, RX_QUEUE, TX_QUEUE, VRING_DESC_F_NEXT,
};

/// Cap on one TX chain's payload.
pub const VUART_BUFLEN: usize = 4088;

/// The physical-UART seam.
pub trait ConsoleBackend: Send {
    fn putchar(&mut self, c: u8);
}

pub struct ConsoleDevice {
    backend: Box<dyn ConsoleBackend>,
    inject_irq: InjectIrqFn,
}

impl ConsoleDevice {
    pub fn new(backend: Box<dyn ConsoleBackend>, inject_irq: InjectIrqFn) -> ConsoleDevice {
        ConsoleDevice {
            backend,
            inject_irq,
        }
    }

    fn notify_tx(&mut self, vm: &mut Vm, transport: &mut Transport) -> VmResult<()> {
        let guest_idx = match transport.avail_idx(vm, TX_QUEUE) {
            Ok(idx) => idx,
            Err(err) => {
                log::error!("virtio-console tx kick with no usable ring: {err}");
                return Ok(());
            }
        };
        let mut idx = transport.last_idx(TX_QUEUE);
        while idx != guest_idx {
            let desc_head = match transport.avail_ring(vm, TX_QUEUE, idx) {
                Ok(head) => head,
                Err(err) => {
                    log::error!("virtio-console avail ring read failed: {err}");
                    break;
                }
            };
            let mut buf = vec![0u8; VUART_BUFLEN];
            let mut len = 0usize;
            let mut desc_idx = desc_head;
            loop {
                let desc = match transport.desc(vm, TX_QUEUE, desc_idx) {
                    Ok(desc) => desc,
                    Err(err) => {
                        log::error!("virtio-console descriptor read failed: {err}");
                        break;
                    }
                };
                let this_len = (desc.len as usize).min(VUART_BUFLEN - len);
                vm.mem
                    .ram_read(vm.kernel.as_ref(), desc.addr, &mut buf[len..len + this_len])?;
                len += this_len;
                if desc.flags & VRING_DESC_F_NEXT == 0 {
                    break;
                }
                desc_idx = desc.next;
            }
            for &c in &buf[..len] {
                self.backend.putchar(c);
            }
            transport.used_add(
                vm,
                TX_QUEUE,
                VringUsedElem {
                    id: desc_head as u32,
                    len: 0,
                },
            )?;
            (self.inject_irq)(vm);
            idx = idx.wrapping_add(1);
        }
        transport.set_last_idx(TX_QUEUE, idx);
        Ok(())
    }
}

impl VirtioDevice for ConsoleDevice {
    fn device_io_in(&mut self, offset: u16, _size: usize) -> Option<u32> {
        match offset {
            super::regs::HOST_FEATURES => Some(0),
            _ => None,
        }
    }

    fn device_io_out(&mut self, offset: u16, _size: usize, _value: u32) -> bool {
        offset == super::regs::GUEST_FEATURES
    }

    fn notify(&mut self, vm: &mut Vm, transport: &mut Transport) -> VmResult<()> {
        self.notify_tx(vm, transport)
    }
}

impl VirtioEmul<ConsoleDevice> {
    /// Deliver host bytes into the guest's next posted RX chain,
    /// truncating if the chain is shorter than `data`.
    pub fn rx_complete(&mut self, vm: &mut Vm, data: &[u8]) -> VmResult<()> {
        let transport = &mut self.transport;
        let guest_idx = match transport.avail_idx(vm, RX_QUEUE) {
            Ok(idx) => idx,
            Err(err) => {
                log::debug!("virtio-console rx dropped, ring not ready: {err}");
                return Ok(());
            }
        };
        let idx = transport.last_idx(RX_QUEUE);
        if idx == guest_idx {
            return Ok(());
        }
        let desc_head = match transport.avail_ring(vm, RX_QUEUE, idx) {
            Ok(head) => head,
            Err(err) => {
                log::error!("virtio-console rx avail read failed: {err}");
                return Ok(());
            }
        };

        let mut written = 0usize;
        let mut desc_idx = desc_head;
        loop {
            let desc = match transport.desc(vm, RX_QUEUE, desc_idx) {
                Ok(desc) => desc,
                Err(err) => {
                    log::error!("virtio-console rx descriptor read failed: {err}");
                    break;
                }
            };
            let copy = (data.len() - written).min(desc.len as usize);
            vm.mem
                .ram_write(vm.kernel.as_ref(), desc.addr, &data[written..written + copy])?;
            written += copy;
            if written == data.len() || desc.flags & VRING_DESC_F_NEXT == 0 {
                break;
            }
            desc_idx = desc.next;
        }

        transport.used_add(
            vm,
            RX_QUEUE,
            VringUsedElem {
                id: desc_head as u32,
                len: written as u32,
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
    use crate::ioports::IoPortHandler;
    use crate::kernel::mock::MockKernel;
    use crate::kernel::KernelOps;
    use crate::virtio::{regs, VringDesc, STATUS_DRIVER_OK};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use vm_memory::ByteValued;

    const RAM_BASE: u64 = 0x4000_0000;
    const QUEUE_SIZE: u16 = 128;
    const IOBASE: u16 = 0x6300;

    struct CapturingConsole {
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl ConsoleBackend for CapturingConsole {
        fn putchar(&mut self, c: u8) {
            self.written.lock().unwrap().push(c);
        }
    }

    struct TestConsole {
        vm: Vm,
        emul: VirtioEmul<ConsoleDevice>,
        written: Arc<Mutex<Vec<u8>>>,
        irqs: Arc<AtomicUsize>,
    }

    fn test_console() -> TestConsole {
        let kernel: Arc<dyn KernelOps> = Arc::new(MockKernel::new());
        let ep = kernel.create_endpoint().unwrap();
        let mut vm =
            Vm::new(kernel, 1, "console-vm", ep, crate::arch::VmArch::new_x86()).unwrap();
        vm.create_vcpu(100).unwrap();
        vm.ram_register_at(RAM_BASE, 0x10_0000, false).unwrap();

        let written = Arc::new(Mutex::new(Vec::new()));
        let irqs = Arc::new(AtomicUsize::new(0));
        let irqs_cb = irqs.clone();
        let device = ConsoleDevice::new(
            Box::new(CapturingConsole {
                written: written.clone(),
            }),
            Box::new(move |_| {
                irqs_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let mut emul = VirtioEmul::new(QUEUE_SIZE, IOBASE, device);

        // Driver bring-up through the register block: place both rings
        // and go live.
        for queue in [RX_QUEUE, TX_QUEUE] {
            let pfn = (ring_base(queue) >> 12) as u32;
            emul.port_out(&mut vm, 0, IOBASE + regs::QUEUE_SEL, 2, queue as u32);
            emul.port_out(&mut vm, 0, IOBASE + regs::QUEUE_PFN, 4, pfn);
        }
        emul.port_out(&mut vm, 0, IOBASE + regs::STATUS, 1, STATUS_DRIVER_OK as u32);
        TestConsole {
            vm,
            emul,
            written,
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
    fn test_tx_chain_drains_to_backend() {
        let mut t = test_console();

        // Two-descriptor chain; the console has no header to skip, so
        // the backend sees every byte in order.
        let first = RAM_BASE + 0x1000;
        let second = RAM_BASE + 0x2000;
        t.vm.ram_write(first, b"hello ").unwrap();
        t.vm.ram_write(second, b"console").unwrap();
        write_desc(
            &t.vm,
            TX_QUEUE,
            0,
            VringDesc {
                addr: first,
                len: 6,
                flags: VRING_DESC_F_NEXT,
                next: 1,
            },
        );
        write_desc(
            &t.vm,
            TX_QUEUE,
            1,
            VringDesc {
                addr: second,
                len: 7,
                flags: 0,
                next: 0,
            },
        );
        publish_avail(&t.vm, TX_QUEUE, 0, 0, 1);

        t.emul
            .port_out(&mut t.vm, 0, IOBASE + regs::QUEUE_NOTIFY, 2, TX_QUEUE as u32);

        assert_eq!(t.written.lock().unwrap().as_slice(), b"hello console");
        let (used_idx, id, len) = read_used(&t.vm, TX_QUEUE, 0);
        assert_eq!(used_idx, 1);
        assert_eq!(id, 0);
        assert_eq!(len, 0);
        assert_eq!(t.irqs.load(Ordering::SeqCst), 1);

        // A kick with nothing new published drains nothing more.
        t.emul
            .port_out(&mut t.vm, 0, IOBASE + regs::QUEUE_NOTIFY, 2, TX_QUEUE as u32);
        assert_eq!(t.written.lock().unwrap().len(), 13);
        assert_eq!(t.irqs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rx_fills_posted_chain() {
        let mut t = test_console();

        // The guest posts a two-descriptor RX chain: 4 + 16 bytes.
        let buf0 = RAM_BASE + 0x3000;
        let buf1 = RAM_BASE + 0x4000;
        write_desc(
            &t.vm,
            RX_QUEUE,
            0,
            VringDesc {
                addr: buf0,
                len: 4,
                flags: VRING_DESC_F_NEXT | crate::virtio::VRING_DESC_F_WRITE,
                next: 1,
            },
        );
        write_desc(
            &t.vm,
            RX_QUEUE,
            1,
            VringDesc {
                addr: buf1,
                len: 16,
                flags: crate::virtio::VRING_DESC_F_WRITE,
                next: 0,
            },
        );
        publish_avail(&t.vm, RX_QUEUE, 0, 0, 1);

        t.emul.rx_complete(&mut t.vm, b"0123456789").unwrap();

        // One used element covering the whole payload (no header on the
        // console transport).
        let (used_idx, id, len) = read_used(&t.vm, RX_QUEUE, 0);
        assert_eq!(used_idx, 1);
        assert_eq!(id, 0);
        assert_eq!(len, 10);

        let mut head = [0u8; 4];
        t.vm.ram_read(buf0, &mut head).unwrap();
        assert_eq!(&head, b"0123");
        let mut tail = [0u8; 6];
        t.vm.ram_read(buf1, &mut tail).unwrap();
        assert_eq!(&tail, b"456789");
        assert_eq!(t.irqs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rx_truncates_on_short_chain() {
        let mut t = test_console();

        // A single 8-byte buffer for a 20-byte delivery.
        let buf = RAM_BASE + 0x5000;
        write_desc(
            &t.vm,
            RX_QUEUE,
            0,
            VringDesc {
                addr: buf,
                len: 8,
                flags: crate::virtio::VRING_DESC_F_WRITE,
                next: 0,
            },
        );
        publish_avail(&t.vm, RX_QUEUE, 0, 0, 1);

        let data: Vec<u8> = (0..20u8).collect();
        t.emul.rx_complete(&mut t.vm, &data).unwrap();

        let (used_idx, id, len) = read_used(&t.vm, RX_QUEUE, 0);
        assert_eq!(used_idx, 1);
        assert_eq!(id, 0);
        assert_eq!(len, 8);
        let mut delivered = [0u8; 8];
        t.vm.ram_read(buf, &mut delivered).unwrap();
        assert_eq!(&delivered, &data[..8]);
        assert_eq!(t.irqs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rx_without_buffers_is_dropped() {
        let mut t = test_console();
        t.emul.rx_complete(&mut t.vm, b"dropped").unwrap();
        assert_eq!(t.irqs.load(Ordering::SeqCst), 0);
    }
}
