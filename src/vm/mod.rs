//! VM lifecycle and the guest-exit dispatch core.
//!
//! A [`Vm`] is the aggregate root: it owns its vCPUs, the guest-physical
//! memory manager, the PCI config space and the architecture-specific
//! state (GIC distributor on ARM, LAPIC table and ioport registry on
//! x86). Exactly one VM owns a given vspace root for its lifetime.
//!
//! # Dispatch model
//!
//! One host thread drives [`Vm::run`]. Every guest exit arrives on the
//! VM's host endpoint carrying a badge; badges inside
//! `[MIN_VCPU_BADGE, MAX_VCPU_BADGE]` identify the faulting vCPU and are
//! routed to the architecture exit decoder, anything else goes to the
//! embedder's registered notification callback. Handlers return a
//! [`FaultResult`]; only `Error` terminates the loop, every other verdict
//! collapses into "reply and continue".

mod vcpu;

use std::sync::Arc;

use thiserror::Error;

use crate::arch::{arm, x86, VcpuArch, VmArch};
use crate::kernel::{Cap, KernelError, KernelOps, Mrs};
use crate::memory::{
    FaultResult, MapIterator, MemoryError, MemoryFaultCallback, MemoryManager, ReservationId,
};
use crate::pci::PciSpace;

pub use vcpu::Vcpu;

/// Compile-time bound on vCPUs per VM.
pub const MAX_VCPUS: usize = 8;

/// Badge range identifying vCPU faults on the host endpoint.
pub const MIN_VCPU_BADGE: u64 = 1;
pub const MAX_VCPU_BADGE: u64 = MAX_VCPUS as u64;

/// The boot vCPU's index.
pub const BOOT_VCPU: usize = 0;

pub(crate) fn badge_to_vcpu(badge: u64) -> Option<usize> {
    (MIN_VCPU_BADGE..=MAX_VCPU_BADGE)
        .contains(&badge)
        .then(|| (badge - MIN_VCPU_BADGE) as usize)
}

/// Externally visible reason the run loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// An exit the runtime could not classify.
    Unknown,
    /// A handler or the embedder reported a fatal error.
    Error,
}

/// Callback for notifications whose badge is outside the vCPU range.
pub type NotificationCallback =
    Box<dyn FnMut(&mut Vm, u64, &Mrs) -> FaultResult + Send>;

/// Callback for memory faults no reservation covers.
pub type UnhandledMemFaultCallback =
    Box<dyn FnMut(&mut Vm, usize, u64, usize) -> FaultResult + Send>;

#[derive(Error, Debug)]
pub enum VmError {
    #[error("vCPU limit ({MAX_VCPUS}) reached")]
    VcpuLimit,

    #[error("no vCPU with id {0}")]
    InvalidVcpu(usize),

    #[error("target physical cpu {0} is already taken by another vCPU")]
    TargetCpuBusy(u32),

    #[error("vCPU {0} was already started")]
    AlreadyStarted(usize),

    #[error("operation does not apply to this VM's architecture")]
    WrongArch,

    #[error("unknown exit label {0:#x}")]
    UnknownExit(u64),

    #[error("unhandled memory fault at {addr:#x} ({len} bytes)")]
    UnhandledMemFault { addr: u64, len: usize },

    #[error("could not decode guest instruction at {pc:#x}")]
    InstructionDecode { pc: u64 },

    #[error("guest performed an invalid operation: {0}")]
    GuestInvalidOperation(&'static str),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("shared device lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Virtio(#[from] crate::virtio::VirtioError),
}

pub type Result<T> = std::result::Result<T, VmError>;

/// Runtime bookkeeping for the dispatch loop.
pub(crate) struct RunState {
    pub(crate) exit_reason: Option<ExitReason>,
    pub(crate) notification_callback: Option<NotificationCallback>,
    pub(crate) unhandled_mem_fault: Option<UnhandledMemFaultCallback>,
}

/// A guest virtual machine.
pub struct Vm {
    pub(crate) kernel: Arc<dyn KernelOps>,
    id: u32,
    name: String,
    pub(crate) cspace: Cap,
    pub(crate) vspace: Cap,
    pub(crate) host_endpoint: Cap,
    pub(crate) vcpus: Vec<Vcpu>,
    pub mem: MemoryManager,
    pub pci: PciSpace,
    pub(crate) run_state: RunState,
    pub(crate) arch: VmArch,
}

impl Vm {
    /// Build an initialised but not yet runnable VM: guest cspace and
    /// vspace, an empty memory manager and an empty vCPU table.
    pub fn new(
        kernel: Arc<dyn KernelOps>,
        id: u32,
        name: &str,
        host_endpoint: Cap,
        arch: VmArch,
    ) -> Result<Vm> {
        let cspace = kernel.create_cspace()?;
        let vspace = kernel.create_vspace()?;
        log::debug!("vm {name} (id {id}) initialised");
        Ok(Vm {
            kernel,
            id,
            name: name.to_string(),
            cspace,
            vspace,
            host_endpoint,
            vcpus: Vec::new(),
            mem: MemoryManager::new(),
            pci: PciSpace::new(),
            run_state: RunState {
                exit_reason: None,
                notification_callback: None,
                unhandled_mem_fault: None,
            },
            arch,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_vcpus(&self) -> usize {
        self.vcpus.len()
    }

    pub fn is_arm(&self) -> bool {
        matches!(self.arch, VmArch::Arm(_))
    }

    pub fn vcpu(&self, id: usize) -> Result<&Vcpu> {
        self.vcpus.get(id).ok_or(VmError::InvalidVcpu(id))
    }

    pub fn vcpu_mut(&mut self, id: usize) -> Result<&mut Vcpu> {
        self.vcpus.get_mut(id).ok_or(VmError::InvalidVcpu(id))
    }

    pub fn vcpus_iter(&self) -> impl Iterator<Item = &Vcpu> + '_ {
        self.vcpus.iter()
    }

    /// Create the next vCPU. Its fault endpoint is a badged copy of the
    /// host endpoint (badge = vcpu id + 1) so exits identify themselves.
    pub fn create_vcpu(&mut self, priority: u8) -> Result<usize> {
        if self.vcpus.len() >= MAX_VCPUS {
            return Err(VmError::VcpuLimit);
        }
        let id = self.vcpus.len();
        let kobj = self.kernel.create_vcpu()?;
        let tcb = self.kernel.create_tcb(priority)?;
        self.kernel.bind_vcpu_tcb(kobj, tcb)?;
        let badged = self
            .kernel
            .mint_badged_endpoint(self.host_endpoint, MIN_VCPU_BADGE + id as u64)?;
        self.kernel.set_tcb_fault_endpoint(tcb, badged)?;

        let arch = match &self.arch {
            VmArch::Arm(_) => VcpuArch::new_arm(),
            VmArch::X86(_) => VcpuArch::new_x86(),
        };
        self.vcpus.push(Vcpu::new(id, kobj, tcb, badged, priority, arch));
        log::debug!("vm {}: created vcpu {id}", self.name);
        Ok(id)
    }

    /// Bind a vCPU to a physical cpu. Each target may be claimed once per
    /// VM.
    pub fn assign_vcpu_target(&mut self, vcpu: usize, target: u32) -> Result<()> {
        if self
            .vcpus
            .iter()
            .any(|v| v.id != vcpu && v.target_cpu == Some(target))
        {
            return Err(VmError::TargetCpuBusy(target));
        }
        self.vcpu_mut(vcpu)?.target_cpu = Some(target);
        Ok(())
    }

    /// Start a vCPU. Architecture-specific: on ARM this programs VMPIDR
    /// and resumes the TCB; on x86 only the BSP starts this way and APs
    /// come up through INIT/SIPI.
    pub fn vcpu_start(&mut self, vcpu: usize) -> Result<()> {
        if self.vcpu(vcpu)?.online {
            return Err(VmError::AlreadyStarted(vcpu));
        }
        if self.is_arm() {
            arm::vcpu_start(self, vcpu)
        } else {
            x86::vcpu_start(self, vcpu)
        }
    }

    /// Enter the blocking event loop. Returns only on a fatal unhandled
    /// exit or an embedder-signalled error; the classified reason is then
    /// available from [`Vm::exit_reason`].
    pub fn run(&mut self) -> Result<()> {
        self.run_state.exit_reason = None;
        if self.is_arm() {
            arm::run_arch(self)
        } else {
            x86::run_arch(self)
        }
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.run_state.exit_reason
    }

    pub fn set_notification_callback(&mut self, callback: NotificationCallback) {
        self.run_state.notification_callback = Some(callback);
    }

    pub fn set_unhandled_mem_fault_callback(&mut self, callback: UnhandledMemFaultCallback) {
        self.run_state.unhandled_mem_fault = Some(callback);
    }

    // Memory wrappers: the manager needs the kernel and the VM's vspace.

    pub fn reserve_memory_at(
        &mut self,
        addr: u64,
        size: u64,
        fault_callback: MemoryFaultCallback,
    ) -> Result<ReservationId> {
        Ok(self.mem.reserve_at(addr, size, fault_callback)?)
    }

    pub fn reserve_anon_memory(
        &mut self,
        size: u64,
        align: u64,
        fault_callback: MemoryFaultCallback,
    ) -> Result<(ReservationId, u64)> {
        Ok(self.mem.reserve_anon(size, align, fault_callback)?)
    }

    pub fn memory_make_anon(&mut self, addr: u64, size: u64) -> Result<()> {
        Ok(self.mem.make_anon(addr, size)?)
    }

    pub fn free_reserved_memory(&mut self, id: ReservationId) -> Result<()> {
        let kernel = self.kernel.clone();
        Ok(self.mem.free_reservation(kernel.as_ref(), self.vspace, id)?)
    }

    pub fn map_reservation(&mut self, id: ReservationId, iterator: MapIterator) -> Result<()> {
        let kernel = self.kernel.clone();
        Ok(self
            .mem
            .map_reservation(kernel.as_ref(), self.vspace, id, iterator)?)
    }

    pub fn map_reservation_deferred(
        &mut self,
        id: ReservationId,
        iterator: MapIterator,
    ) -> Result<()> {
        Ok(self.mem.map_reservation_deferred(id, iterator)?)
    }

    pub fn ram_register_at(&mut self, start: u64, size: u64, untyped: bool) -> Result<()> {
        let kernel = self.kernel.clone();
        self.mem
            .ram_register_at(&kernel, self.vspace, start, size, untyped)?;
        Ok(())
    }

    pub fn ram_touch(
        &self,
        addr: u64,
        size: u64,
        f: impl FnMut(u64, usize, &mut [u8]) -> std::result::Result<(), MemoryError>,
    ) -> Result<()> {
        Ok(self.mem.ram_touch(self.kernel.as_ref(), addr, size, f)?)
    }

    pub fn ram_read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        Ok(self.mem.ram_read(self.kernel.as_ref(), addr, buf)?)
    }

    pub fn ram_write(&self, addr: u64, buf: &[u8]) -> Result<()> {
        Ok(self.mem.ram_write(self.kernel.as_ref(), addr, buf)?)
    }

    /// Inject a virtual interrupt. Takes effect no later than the target
    /// vCPU's next exit-to-guest; repeated injection before that is
    /// idempotent at the controller.
    pub fn inject_irq(&mut self, vcpu: usize, irq: u32) -> Result<()> {
        if self.is_arm() {
            arm::vgic::inject_irq(self, vcpu, irq)
        } else {
            x86::lapic::accept_irq(self, vcpu, irq as u8)
        }
    }

    /// Register a device model over an inclusive ioport range. On x86
    /// this backs the IO-instruction exit; on ARM the ports are reached
    /// through the PCI IO mirror region.
    pub fn register_ioport_handler(
        &mut self,
        start: u16,
        end: u16,
        handler: std::sync::Arc<std::sync::Mutex<dyn crate::ioports::IoPortHandler>>,
    ) -> Result<()> {
        if let Some(x86) = self.arch.as_x86_mut() {
            x86.ioports.add(start, end, handler)
        } else {
            self.pci.io_ports.add(start, end, handler)
        }
    }

    /// Route a memory fault no reservation covered to the embedder.
    pub(crate) fn unhandled_mem_fault(
        &mut self,
        vcpu: usize,
        addr: u64,
        len: usize,
    ) -> FaultResult {
        let Some(mut callback) = self.run_state.unhandled_mem_fault.take() else {
            log::error!(
                "vm {}: unhandled memory fault at {addr:#x} and no fallback registered",
                self.name
            );
            return FaultResult::Error;
        };
        let result = callback(self, vcpu, addr, len);
        self.run_state.unhandled_mem_fault = Some(callback);
        result
    }

    /// Forward a non-vCPU badge to the embedder's notification callback.
    pub(crate) fn deliver_notification(&mut self, badge: u64, mrs: &Mrs) -> FaultResult {
        let Some(mut callback) = self.run_state.notification_callback.take() else {
            log::error!("vm {}: unable to handle notification {badge:#x}", self.name);
            return FaultResult::Error;
        };
        let result = callback(self, badge, mrs);
        self.run_state.notification_callback = Some(callback);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mock::{notification, MockKernel};
    use crate::kernel::{arm_mr, ExitEvent, ExitLabel, KernelError, KernelOps, MapRights, Mrs};
    use crate::memory::{GuestFrame, PAGE_BITS};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn arm_vm() -> (Arc<MockKernel>, Vm) {
        let mock = Arc::new(MockKernel::new());
        let kernel: Arc<dyn KernelOps> = mock.clone();
        let ep = kernel.create_endpoint().unwrap();
        let vm = Vm::new(kernel, 1, "test-vm", ep, crate::arch::VmArch::new_arm()).unwrap();
        (mock, vm)
    }

    #[test]
    fn test_vcpu_creation_is_bounded() {
        let (_, mut vm) = arm_vm();
        for expected in 0..MAX_VCPUS {
            assert_eq!(vm.create_vcpu(100).unwrap(), expected);
        }
        assert!(matches!(vm.create_vcpu(100), Err(VmError::VcpuLimit)));
    }

    #[test]
    fn test_target_cpu_claimed_once() {
        let (_, mut vm) = arm_vm();
        vm.create_vcpu(100).unwrap();
        vm.create_vcpu(100).unwrap();
        vm.assign_vcpu_target(0, 0).unwrap();
        assert!(matches!(
            vm.assign_vcpu_target(1, 0),
            Err(VmError::TargetCpuBusy(0))
        ));
        vm.assign_vcpu_target(1, 1).unwrap();
        // Re-assigning a vCPU its own target is fine.
        vm.assign_vcpu_target(0, 0).unwrap();
    }

    #[test]
    fn test_vcpu_starts_once() {
        let (mock, mut vm) = arm_vm();
        vm.create_vcpu(100).unwrap();
        vm.vcpu_start(0).unwrap();
        assert!(vm.vcpu(0).unwrap().is_online());
        assert!(mock.is_resumed(vm.vcpu(0).unwrap().tcb_handle()));
        assert!(matches!(vm.vcpu_start(0), Err(VmError::AlreadyStarted(0))));
    }

    #[test]
    fn test_notifications_route_to_callback() {
        let (mock, mut vm) = arm_vm();
        vm.create_vcpu(100).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        vm.set_notification_callback(Box::new(move |_, badge, _| {
            seen_cb.store(badge as usize, Ordering::SeqCst);
            FaultResult::Handled
        }));
        // A badge outside the vCPU range is embedder traffic.
        mock.push_exit(notification(0x40));
        let err = vm.run().unwrap_err();
        assert!(matches!(err, VmError::Kernel(KernelError::NoEvent)));
        assert_eq!(seen.load(Ordering::SeqCst), 0x40);
    }

    #[test]
    fn test_notification_error_stops_the_loop() {
        let (mock, mut vm) = arm_vm();
        vm.create_vcpu(100).unwrap();
        vm.set_notification_callback(Box::new(|_, _, _| FaultResult::Error));
        mock.push_exit(notification(0x40));
        assert!(vm.run().is_err());
        assert_eq!(vm.exit_reason(), Some(ExitReason::Error));
    }

    #[test]
    fn test_deferred_map_restarts_the_access() {
        let (mock, mut vm) = arm_vm();
        vm.create_vcpu(100).unwrap();

        let res = vm
            .reserve_memory_at(
                0x5000_0000,
                0x1000,
                Box::new(|_, _, _, _| FaultResult::Error),
            )
            .unwrap();
        let kernel = vm.kernel.clone();
        vm.map_reservation_deferred(
            res,
            Box::new(move |addr| {
                let frame = kernel.alloc_frame(PAGE_BITS).ok()?;
                Some(GuestFrame {
                    frame,
                    rights: MapRights::READ_WRITE,
                    gpa: crate::memory::page_align(addr),
                })
            }),
        )
        .unwrap();
        assert!(mock.mappings().is_empty());

        // A read fault with a valid syndrome (word, register 3).
        let fsr = (1u64 << 24) | (2 << 22) | (3 << 16);
        let mut mrs = [0u64; 4];
        mrs[arm_mr::VMF_IP] = 0x8_0000;
        mrs[arm_mr::VMF_ADDR] = 0x5000_0000;
        mrs[arm_mr::VMF_FSR] = fsr;
        mock.push_exit(ExitEvent {
            badge: MIN_VCPU_BADGE,
            label: ExitLabel::VmFault,
            mrs: Mrs::new(&mrs),
        });

        assert!(vm.run().is_err()); // queue drained
        // The iterator ran and the guest was resumed to retry.
        assert_eq!(mock.mappings().len(), 1);
        assert_eq!(mock.replies().len(), 1);
        assert!(vm.mem.reservation(res).unwrap().is_mapped());
    }
}
