//! Cross-VM shared-memory connector.
//!
//! Each connection shows up in the guest as one PCI device with two
//! equal-size prefetchable BARs. BAR0 is the *event page*: a host-owned
//! frame mapped read-only, so guest reads never trap while writes land
//! in the fault handler below. Offset 0 is the emit doorbell, offset 4
//! the consume-event counter the host increments, offset 8 a
//! NUL-terminated device name. BAR1 is backed directly by the
//! caller-supplied shared frames.
//!
//! All connections share one interrupt line, allocated once through the
//! embedder's callback and raised on the boot vCPU.

use std::sync::{Arc, Mutex};

use crate::arch::arm;
use crate::kernel::{Frame, MapRights};
use crate::memory::{page_align, FaultResult, GuestFrame, PAGE_BITS, PAGE_SIZE};
use crate::pci::bar::{BarEmulation, PciBar, PciBarType};
use crate::pci::{MemDevice, PciDeviceHeader};
use crate::vcpu_fault;
use crate::vm::{Result as VmResult, Vm, VmError, BOOT_VCPU};

/// Upper bound on concurrent connections.
pub const MAX_CONNECTIONS: usize = 32;

const EVENT_BAR_EMIT: u64 = 0x0;
const EVENT_BAR_CONSUME: u64 = 0x4;
const EVENT_BAR_NAME: u64 = 0x8;
const EVENT_BAR_NAME_MAX_LEN: usize = 50;

/// Shared-memory region backing one connection's BAR1.
pub struct CrossVmDataport {
    /// One frame per page, in address order.
    pub frames: Vec<Frame>,
    pub size: u64,
}

/// Host-side doorbell invoked when the guest writes the emit register.
pub type EmitFn = Box<dyn FnMut() + Send>;

/// Embedder-supplied description of one connection.
pub struct CrossVmConnection {
    pub dataport: CrossVmDataport,
    pub emit: Option<EmitFn>,
    /// Event id `consume_connection_event` matches against.
    pub consume_id: Option<u64>,
    pub name: String,
}

struct ConnectionInfo {
    event_frame: Frame,
    consume_id: Option<u64>,
    emit: Option<EmitFn>,
    irq: u32,
}

/// Handle to the installed connection table, shared with the fault
/// handlers.
#[derive(Clone)]
pub struct CrossVmConnections {
    inner: Arc<Mutex<Vec<ConnectionInfo>>>,
}

/// Install `connections` starting at `base_addr`, interleaving event
/// pages and dataports the way the guest-side driver expects. The
/// connector IRQ is allocated exactly once through `alloc_irq`.
pub fn install_connections(
    vm: &mut Vm,
    base_addr: u64,
    connections: Vec<CrossVmConnection>,
    alloc_irq: impl FnOnce() -> u32,
) -> VmResult<CrossVmConnections> {
    if connections.len() > MAX_CONNECTIONS {
        return Err(VmError::ResourceExhausted("cross-vm connection table"));
    }
    let irq = alloc_irq();
    let table = CrossVmConnections {
        inner: Arc::new(Mutex::new(Vec::new())),
    };

    let mut addr = base_addr;
    for (idx, conn) in connections.into_iter().enumerate() {
        // Both BARs round up to the dataport size so the guest's
        // resource allocator never tries to remap them.
        let size = conn.dataport.size.next_power_of_two().max(PAGE_SIZE);
        let size_bits = size.trailing_zeros() as u8;
        let event_addr = addr;
        let dataport_addr = addr + size;
        addr = dataport_addr + size;

        let event_frame = install_event_bar(vm, event_addr, idx, &table, &conn.name)?;
        install_dataport(vm, dataport_addr, conn.dataport)?;

        table
            .inner
            .lock()
            .map_err(|_| VmError::LockPoisoned("cross-vm connection table"))?
            .push(ConnectionInfo {
                event_frame,
                consume_id: conn.consume_id,
                emit: conn.emit,
                irq,
            });

        if conn.consume_id.is_some() {
            if vm.is_arm() {
                // The shared line needs an ack slot in the vGIC; the
                // ack itself has nothing to do.
                if let Err(err) =
                    arm::vgic::register_irq(vm, BOOT_VCPU, irq, Box::new(|_, _| {}))
                {
                    log::debug!("connector irq {irq} already registered: {err}");
                }
            }
        }

        let header = PciDeviceHeader {
            vendor_id: 0x1af4,
            device_id: 0xa111,
            revision_id: 0x1,
            command: 0x2, // memory decode
            interrupt_pin: 1,
            interrupt_line: irq as u8,
            class_code: 0x05, // memory controller
            subclass: 0x00,   // RAM
            ..PciDeviceHeader::default()
        };
        let bars = vec![
            PciBar {
                mem_type: PciBarType::PrefetchMem32,
                address: event_addr as u32,
                size_bits,
            },
            PciBar {
                mem_type: PciBarType::PrefetchMem32,
                address: dataport_addr as u32,
                size_bits,
            },
        ];
        let entry = BarEmulation::new(Box::new(MemDevice::new(header)), bars);
        vm.pci
            .add_entry(Arc::new(Mutex::new(entry)))
            .map_err(|_| VmError::ResourceExhausted("pci bus"))?;
    }
    Ok(table)
}

/// Map the read-only event page and trap its writes.
fn install_event_bar(
    vm: &mut Vm,
    event_addr: u64,
    conn_idx: usize,
    table: &CrossVmConnections,
    name: &str,
) -> VmResult<Frame> {
    let frame = vm.kernel.alloc_frame(PAGE_BITS)?;

    // Seed the name register.
    let name = if name.is_empty() { "connector" } else { name };
    let mut bytes = name.as_bytes().to_vec();
    bytes.truncate(EVENT_BAR_NAME_MAX_LEN - 1);
    bytes.push(0);
    vm.kernel.frame_data(&frame, &mut |data| {
        data[EVENT_BAR_NAME as usize..EVENT_BAR_NAME as usize + bytes.len()]
            .copy_from_slice(&bytes);
    })?;

    let handler_table = table.clone();
    let res = vm.reserve_memory_at(
        event_addr,
        PAGE_SIZE,
        Box::new(move |vm, vcpu, addr, len| {
            match handle_event_bar_fault(vm, vcpu, &handler_table, conn_idx, addr - event_addr, len)
            {
                Ok(result) => result,
                Err(err) => {
                    log::error!("event bar fault failed: {err}");
                    FaultResult::Error
                }
            }
        }),
    )?;
    let mapped = frame;
    vm.map_reservation(
        res,
        Box::new(move |addr| {
            Some(GuestFrame {
                frame: mapped,
                rights: MapRights::READ_ONLY,
                gpa: page_align(addr),
            })
        }),
    )?;
    Ok(frame)
}

/// BAR1: the caller's shared frames, indexed by page offset.
fn install_dataport(vm: &mut Vm, dataport_addr: u64, dataport: CrossVmDataport) -> VmResult<()> {
    if (dataport.frames.len() as u64) * PAGE_SIZE < dataport.size {
        return Err(VmError::GuestInvalidOperation(
            "dataport frames do not cover its size",
        ));
    }
    let res = vm.reserve_memory_at(
        dataport_addr,
        dataport.size,
        Box::new(|_, _, addr, _| {
            log::error!("unexpected fault on mapped dataport at {addr:#x}");
            FaultResult::Error
        }),
    )?;
    let frames = dataport.frames;
    vm.map_reservation(
        res,
        Box::new(move |addr| {
            let page_idx = ((page_align(addr) - dataport_addr) / PAGE_SIZE) as usize;
            frames.get(page_idx).map(|frame| GuestFrame {
                frame: *frame,
                rights: MapRights::READ_WRITE,
                gpa: page_align(addr),
            })
        }),
    )?;
    Ok(())
}

fn handle_event_bar_fault(
    vm: &mut Vm,
    vcpu: usize,
    table: &CrossVmConnections,
    conn_idx: usize,
    offset: u64,
    _len: usize,
) -> VmResult<FaultResult> {
    if vcpu_fault::is_read_fault(vm, vcpu)? {
        // Reads should never trap: the page is mapped in readable.
        log::error!("event bar memory is misconfigured (read fault at {offset:#x})");
        return Ok(FaultResult::Error);
    }
    match offset & 0xff {
        EVENT_BAR_EMIT => {
            let mut connections = table
                .inner
                .lock()
                .map_err(|_| VmError::LockPoisoned("cross-vm connection table"))?;
            match connections.get_mut(conn_idx).and_then(|c| c.emit.as_mut()) {
                Some(emit) => emit(),
                None => log::error!("connection {conn_idx} has no emit function"),
            }
        }
        EVENT_BAR_CONSUME => {
            let mask = vcpu_fault::get_fault_data_mask(vm, vcpu)?;
            let value = (vcpu_fault::get_fault_data(vm, vcpu)? & mask) as u32;
            let frame = {
                let connections = table
                    .inner
                    .lock()
                    .map_err(|_| VmError::LockPoisoned("cross-vm connection table"))?;
                connections[conn_idx].event_frame
            };
            vm.kernel.frame_data(&frame, &mut |data| {
                data[EVENT_BAR_CONSUME as usize..EVENT_BAR_CONSUME as usize + 4]
                    .copy_from_slice(&value.to_le_bytes());
            })?;
        }
        reg => {
            log::error!("unsupported event bar register {reg:#x}");
        }
    }
    vcpu_fault::advance_fault(vm, vcpu)?;
    Ok(FaultResult::Handled)
}

/// Host-side event arrival: bump the matching connection's consume
/// counter and, when requested, raise the shared connector interrupt on
/// the boot vCPU.
pub fn consume_connection_event(
    vm: &mut Vm,
    table: &CrossVmConnections,
    event_id: u64,
    inject_irq: bool,
) -> VmResult<()> {
    let (frame, irq) = {
        let connections = table
            .inner
            .lock()
            .map_err(|_| VmError::LockPoisoned("cross-vm connection table"))?;
        let Some(conn) = connections
            .iter()
            .find(|c| c.consume_id == Some(event_id))
        else {
            return Ok(());
        };
        (conn.event_frame, conn.irq)
    };

    vm.kernel.frame_data(&frame, &mut |data| {
        let at = EVENT_BAR_CONSUME as usize;
        let current = u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        data[at..at + 4].copy_from_slice(&current.wrapping_add(1).to_le_bytes());
    })?;

    if inject_irq {
        if let Err(err) = vm.inject_irq(BOOT_VCPU, irq) {
            log::error!("failed to inject connection irq {irq}: {err}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86::lapic;
    use crate::kernel::mock::MockKernel;
    use crate::kernel::KernelOps;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn connector_vm() -> (Arc<MockKernel>, Vm) {
        let mock = Arc::new(MockKernel::new());
        let kernel: Arc<dyn KernelOps> = mock.clone();
        let ep = kernel.create_endpoint().unwrap();
        let mut vm = Vm::new(kernel, 1, "xvm", ep, crate::arch::VmArch::new_x86()).unwrap();
        vm.create_vcpu(100).unwrap();
        lapic::create_lapic(&mut vm, 0, true).unwrap();
        (mock, vm)
    }

    fn one_connection(vm: &mut Vm, consume_id: u64) -> (CrossVmConnections, Arc<AtomicUsize>) {
        let emits = Arc::new(AtomicUsize::new(0));
        let emits_cb = emits.clone();
        let frames = vec![vm.kernel.alloc_frame(PAGE_BITS).unwrap()];
        let connections = install_connections(
            vm,
            0x6000_0000,
            vec![CrossVmConnection {
                dataport: CrossVmDataport {
                    frames,
                    size: PAGE_SIZE,
                },
                emit: Some(Box::new(move || {
                    emits_cb.fetch_add(1, Ordering::SeqCst);
                })),
                consume_id: Some(consume_id),
                name: "evtchn".to_string(),
            }],
            || 42,
        )
        .unwrap();
        (connections, emits)
    }

    #[test]
    fn test_consume_event_increments_counter_and_injects() {
        let (_, mut vm) = connector_vm();
        let (connections, _) = one_connection(&mut vm, 7);

        consume_connection_event(&mut vm, &connections, 7, true).unwrap();

        // BAR0 word 1 incremented exactly once.
        let frame = connections.inner.lock().unwrap()[0].event_frame;
        let bytes = {
            let mut copy = Vec::new();
            vm.kernel
                .frame_data(&frame, &mut |data| copy = data[..16].to_vec())
                .unwrap();
            copy
        };
        assert_eq!(
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            1
        );
        // The connector IRQ reached the BSP LAPIC exactly once.
        let lapic = &vm.vcpu(0).unwrap().arch.as_x86().unwrap().lapic;
        assert_eq!(lapic.find_highest_irr(), Some(42));
    }

    #[test]
    fn test_consume_event_without_irq_only_counts() {
        let (_, mut vm) = connector_vm();
        let (connections, _) = one_connection(&mut vm, 9);
        consume_connection_event(&mut vm, &connections, 9, false).unwrap();
        consume_connection_event(&mut vm, &connections, 9, false).unwrap();
        let frame = connections.inner.lock().unwrap()[0].event_frame;
        let mut counter = 0u32;
        vm.kernel
            .frame_data(&frame, &mut |data| {
                counter = u32::from_le_bytes(data[4..8].try_into().unwrap());
            })
            .unwrap();
        assert_eq!(counter, 2);
        let lapic = &vm.vcpu(0).unwrap().arch.as_x86().unwrap().lapic;
        assert_eq!(lapic.find_highest_irr(), None);
    }

    #[test]
    fn test_unknown_event_id_is_ignored() {
        let (_, mut vm) = connector_vm();
        let (connections, _) = one_connection(&mut vm, 7);
        consume_connection_event(&mut vm, &connections, 8, true).unwrap();
        let lapic = &vm.vcpu(0).unwrap().arch.as_x86().unwrap().lapic;
        assert_eq!(lapic.find_highest_irr(), None);
    }

    #[test]
    fn test_device_name_seeded_in_event_page() {
        let (_, mut vm) = connector_vm();
        let (connections, _) = one_connection(&mut vm, 7);
        let frame = connections.inner.lock().unwrap()[0].event_frame;
        let mut name = Vec::new();
        vm.kernel
            .frame_data(&frame, &mut |data| {
                name = data[8..8 + 7].to_vec();
            })
            .unwrap();
        assert_eq!(&name, b"evtchn\0");
    }

    #[test]
    fn test_connection_gets_a_pci_slot() {
        let (_, mut vm) = connector_vm();
        let _ = one_connection(&mut vm, 7);
        let entry = vm
            .pci
            .find(crate::pci::PciAddress {
                bus: 0,
                dev: 1,
                fun: 0,
            })
            .unwrap();
        let mut dev = entry.lock().unwrap();
        assert_eq!(dev.cfg_read(0, 2).unwrap(), 0x1af4);
        assert_eq!(dev.cfg_read(2, 2).unwrap(), 0xa111);
        // BAR0 reads back the event page address with the prefetch bit.
        assert_eq!(dev.cfg_read(0x10, 4).unwrap(), 0x6000_0000 | 1 << 3);
    }
}
