//! x86 (VMX) guest support.
//!
//! The kernel fuses entry and exit: publishing `(EIP, primary controls,
//! entry-interrupt info)` runs the guest and comes back with either a
//! fault message or a notification. The exit reason indexes the handler
//! dispatch below; everything the handlers touch goes through the lazy
//! [`state::GuestState`] cache and is flushed exactly once before the
//! next entry.

pub mod cpuid;
pub mod cr;
pub mod decode;
pub mod ept;
pub mod interrupt;
pub mod ioports;
pub mod lapic;
pub mod msr;
pub mod state;

use std::sync::{Arc, Mutex};

use crate::kernel::{Mrs, VmEnterResult};
use crate::memory::FaultResult;
use crate::vm::{badge_to_vcpu, ExitReason, Result, Vm, VmError, BOOT_VCPU};

use decode::DecodedOp;
use lapic::Lapic;
use state::{ctx, GuestState};

/// VMX basic exit reasons the runtime handles.
pub mod exit_reason {
    pub const PENDING_INTERRUPT: u64 = 7;
    pub const CPUID: u64 = 10;
    pub const HLT: u64 = 12;
    pub const VMCALL: u64 = 18;
    pub const CR_ACCESS: u64 = 28;
    pub const IO_INSTRUCTION: u64 = 30;
    pub const MSR_READ: u64 = 31;
    pub const MSR_WRITE: u64 = 32;
    pub const EPT_VIOLATION: u64 = 48;
    pub const PREEMPTION_TIMER: u64 = 52;
}

/// A level-style external-interrupt source wired to the boot vCPU's
/// LAPIC in virtual-wire mode (classically the 8259 PIC device model).
pub trait ExtIntSource: Send {
    /// Peek at the pending vector without consuming it.
    fn has_interrupt(&mut self) -> Option<u8>;
    /// Consume and return the pending vector.
    fn get_interrupt(&mut self) -> Option<u8>;
}

/// Hypercall handler, dispatched on the token in EAX.
pub type VmcallHandler = Box<dyn FnMut(&mut Vm, usize) -> Result<()> + Send>;

struct VmcallEntry {
    token: u64,
    handler: VmcallHandler,
}

/// x86-specific VM state.
pub struct X86Vm {
    pub(crate) ioports: crate::ioports::IoPortList,
    vmcall_handlers: Vec<VmcallEntry>,
    pub(crate) unhandled_ioport: Option<crate::ioports::UnhandledIoPortCallback>,
    pub(crate) pic: Option<Box<dyn ExtIntSource>>,
    /// Guest page-directory address handed to the boot constructor.
    pub guest_page_dir: u64,
}

impl X86Vm {
    pub fn new() -> X86Vm {
        X86Vm {
            ioports: crate::ioports::IoPortList::new(),
            vmcall_handlers: Vec::new(),
            unhandled_ioport: None,
            pic: None,
            guest_page_dir: 0,
        }
    }

    /// Attach the ExtINT source for the virtual wire.
    pub fn set_pic(&mut self, pic: Box<dyn ExtIntSource>) {
        self.pic = Some(pic);
    }
}

impl Default for X86Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// x86-specific vCPU state.
pub struct X86Vcpu {
    pub state: GuestState,
    pub lapic: Lapic,
    /// Operand of the in-flight MMIO access, decoded at EPT-exit time.
    pub(crate) current_mmio: Option<DecodedOp>,
}

impl X86Vcpu {
    pub fn new() -> X86Vcpu {
        X86Vcpu {
            state: GuestState::new(),
            lapic: Lapic::new(),
            current_mmio: None,
        }
    }
}

impl Default for X86Vcpu {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn x86_vcpu(vm: &Vm, vcpu: usize) -> Result<&X86Vcpu> {
    vm.vcpu(vcpu)?.arch.as_x86().ok_or(VmError::WrongArch)
}

use lapic::x86_vcpu_mut;

/// Register a hypercall handler for one EAX token.
pub fn register_vmcall_handler(vm: &mut Vm, token: u64, handler: VmcallHandler) -> Result<()> {
    let x86 = vm.arch.as_x86_mut().ok_or(VmError::WrongArch)?;
    if x86.vmcall_handlers.iter().any(|e| e.token == token) {
        return Err(VmError::GuestInvalidOperation("vmcall token already taken"));
    }
    x86.vmcall_handlers.push(VmcallEntry { token, handler });
    Ok(())
}

/// Register an ioport handler over an inclusive port range.
pub fn register_ioport_handler(
    vm: &mut Vm,
    start: u16,
    end: u16,
    handler: Arc<Mutex<dyn crate::ioports::IoPortHandler>>,
) -> Result<()> {
    let x86 = vm.arch.as_x86_mut().ok_or(VmError::WrongArch)?;
    x86.ioports.add(start, end, handler)
}

pub fn register_unhandled_ioport_callback(
    vm: &mut Vm,
    callback: crate::ioports::UnhandledIoPortCallback,
) -> Result<()> {
    let x86 = vm.arch.as_x86_mut().ok_or(VmError::WrongArch)?;
    x86.unhandled_ioport = Some(callback);
    Ok(())
}

// Fault accessors for device handlers while an EPT exit is in flight.

pub fn get_fault_address(vm: &Vm, vcpu: usize) -> Result<u64> {
    let exit = x86_vcpu(vm, vcpu)?.state.exit;
    exit.map(|e| e.guest_physical)
        .ok_or(VmError::GuestInvalidOperation("no exit in flight"))
}

pub fn is_read_fault(vm: &Vm, vcpu: usize) -> Result<bool> {
    let exit = x86_vcpu(vm, vcpu)?.state.exit;
    let qual = exit
        .map(|e| e.qualification)
        .ok_or(VmError::GuestInvalidOperation("no exit in flight"))?;
    Ok(qual & 1 != 0)
}

pub fn get_fault_size(vm: &Vm, vcpu: usize) -> Result<usize> {
    Ok(x86_vcpu(vm, vcpu)?
        .current_mmio
        .map(|op| op.len)
        .unwrap_or(4))
}

pub fn get_fault_data(vm: &mut Vm, vcpu: usize) -> Result<u64> {
    let op = x86_vcpu(vm, vcpu)?
        .current_mmio
        .ok_or(VmError::GuestInvalidOperation("no mmio access decoded"))?;
    match op.reg {
        Some(reg) => x86_vcpu(vm, vcpu)?.state.context_reg(reg),
        None => Ok(op.imm),
    }
}

pub fn set_fault_data(vm: &mut Vm, vcpu: usize, data: u64) -> Result<()> {
    let op = x86_vcpu(vm, vcpu)?
        .current_mmio
        .ok_or(VmError::GuestInvalidOperation("no mmio access decoded"))?;
    if let Some(reg) = op.reg {
        x86_vcpu_mut(vm, vcpu)?.state.set_context_reg(reg, data)?;
    }
    Ok(())
}

pub fn get_fault_data_mask(vm: &Vm, vcpu: usize) -> Result<u64> {
    let size = get_fault_size(vm, vcpu)?;
    let addr = get_fault_address(vm, vcpu)?;
    let mask: u64 = match size {
        1 => 0xff,
        2 => 0xffff,
        _ => 0xffff_ffff,
    };
    Ok(mask << ((addr & 0x3) * 8))
}

/// Step past the exiting instruction.
pub fn advance_fault(vm: &mut Vm, vcpu: usize) -> Result<()> {
    x86_vcpu_mut(vm, vcpu)?.state.advance_instruction();
    Ok(())
}

/// Only the BSP starts synchronously; APs arrive via INIT/SIPI.
pub(crate) fn vcpu_start(vm: &mut Vm, vcpu: usize) -> Result<()> {
    if vcpu != BOOT_VCPU {
        return Err(VmError::GuestInvalidOperation(
            "application processors start through a SIPI",
        ));
    }
    let lapic = &mut x86_vcpu_mut(vm, vcpu)?.lapic;
    lapic.state = lapic::LapicMpState::Run;
    vm.vcpu_mut(vcpu)?.online = true;
    Ok(())
}

/// Flush modified state and clear the exit marker so the next loop
/// iteration re-enters the guest.
fn vm_resume(vm: &mut Vm, vcpu: usize) -> Result<()> {
    let kernel = vm.kernel.clone();
    let (kobj, tcb) = {
        let vc = vm.vcpu(vcpu)?;
        (vc.kobj, vc.tcb)
    };
    let x86 = x86_vcpu_mut(vm, vcpu)?;
    x86.state.sync_vmcs(kernel.as_ref(), kobj)?;
    if x86.state.in_exit() && !x86.state.interrupt_halt {
        x86.state.sync_context(kernel.as_ref(), tcb)?;
        debug_assert!(x86.state.no_modified());
        x86.state.invalidate_all();
        x86.state.exit = None;
        x86.current_mmio = None;
    }
    Ok(())
}

/// The x86 event loop, driving the boot vCPU through VM entries.
pub(crate) fn run_arch(vm: &mut Vm) -> Result<()> {
    let vcpu = BOOT_VCPU;
    let kernel = vm.kernel.clone();
    let (kobj, tcb) = {
        let vc = vm.vcpu(vcpu)?;
        (vc.kobj, vc.tcb)
    };

    {
        let x86 = x86_vcpu_mut(vm, vcpu)?;
        x86.state.interrupt_halt = false;
        x86.state.exit = None;
        x86.state.sync_vmcs(kernel.as_ref(), kobj)?;
        x86.state.sync_context(kernel.as_ref(), tcb)?;
        x86.state.invalidate_all();
    }

    loop {
        let runnable = {
            let online = vm.vcpu(vcpu)?.online;
            let x86 = x86_vcpu(vm, vcpu)?;
            online && !x86.state.interrupt_halt && !x86.state.in_exit()
        };

        let verdict = if runnable {
            let entry = {
                let x86 = x86_vcpu(vm, vcpu)?;
                [x86.state.eip, x86.state.control_ppc, x86.state.control_entry]
            };
            let result = kernel.vm_enter(kobj, &entry)?;
            {
                let x86 = x86_vcpu_mut(vm, vcpu)?;
                x86.state.invalidate_all();
            }
            match result {
                VmEnterResult::Fault(mrs) => {
                    x86_vcpu_mut(vm, vcpu)?.state.load_fault(&mrs);
                    let verdict = handle_vm_exit(vm, vcpu)?;
                    interrupt::check_external_interrupt(vm)?;
                    verdict
                }
                VmEnterResult::Notification { badge, mrs } => {
                    x86_vcpu_mut(vm, vcpu)?.state.load_notification(&mrs);
                    deliver_notification(vm, badge, &mrs)?
                }
            }
        } else {
            let event = kernel.wait_exit(vm.host_endpoint)?;
            deliver_notification(vm, event.badge, &event.mrs)?
        };

        if verdict == FaultResult::Error {
            vm.run_state.exit_reason.get_or_insert(ExitReason::Error);
            return Err(VmError::GuestInvalidOperation("fatal guest exit"));
        }
        vm_resume(vm, vcpu)?;
    }
}

fn deliver_notification(vm: &mut Vm, badge: u64, mrs: &Mrs) -> Result<FaultResult> {
    if badge_to_vcpu(badge).is_some() {
        log::error!("vm {}: unexpected vCPU badge {badge} on x86 wait path", vm.name());
        return Ok(FaultResult::Error);
    }
    let verdict = vm.deliver_notification(badge, mrs);
    if verdict != FaultResult::Error {
        // The notification may have fed the PIC.
        interrupt::check_external_interrupt(vm)?;
    }
    Ok(verdict)
}

/// Route one fault message to its reason-specific handler.
fn handle_vm_exit(vm: &mut Vm, vcpu: usize) -> Result<FaultResult> {
    let reason = {
        let exit = x86_vcpu(vm, vcpu)?.state.exit;
        exit.map(|e| e.reason)
            .ok_or(VmError::GuestInvalidOperation("no exit in flight"))?
    };
    let verdict = match reason {
        exit_reason::PENDING_INTERRUPT => interrupt::handle_pending_interrupt(vm, vcpu)?,
        exit_reason::CPUID => cpuid::handle_cpuid(vm, vcpu)?,
        exit_reason::HLT => handle_hlt(vm, vcpu)?,
        exit_reason::VMCALL => handle_vmcall(vm, vcpu)?,
        exit_reason::CR_ACCESS => cr::handle_cr_access(vm, vcpu)?,
        exit_reason::IO_INSTRUCTION => ioports::handle_io_instruction(vm, vcpu)?,
        exit_reason::MSR_READ => msr::handle_rdmsr(vm, vcpu)?,
        exit_reason::MSR_WRITE => msr::handle_wrmsr(vm, vcpu)?,
        exit_reason::EPT_VIOLATION => ept::handle_ept_violation(vm, vcpu)?,
        exit_reason::PREEMPTION_TIMER => handle_preemption_timer(vm, vcpu)?,
        other => {
            log::error!("vm {}: exit reason {other:#x} out of range", vm.name());
            vm.run_state.exit_reason = Some(ExitReason::Unknown);
            FaultResult::Error
        }
    };
    if verdict == FaultResult::Error {
        log::error!(
            "vm {}: exit handler for reason {reason:#x} failed (eip {:#x})",
            vm.name(),
            x86_vcpu(vm, vcpu)?.state.eip
        );
        vm.vcpu_mut(vcpu)?.online = false;
    }
    Ok(verdict)
}

/// HLT: with IF clear the guest can never wake, so it halts for good.
/// Otherwise mark the halt and let the next interrupt clear it.
fn handle_hlt(vm: &mut Vm, vcpu: usize) -> Result<FaultResult> {
    let kernel = vm.kernel.clone();
    let kobj = vm.vcpu(vcpu)?.kobj;
    let rflags = x86_vcpu_mut(vm, vcpu)?
        .state
        .rflags(kernel.as_ref(), kobj)?;
    if rflags & (1 << 9) == 0 {
        log::warn!("vm {}: vcpu {vcpu} halted with interrupts disabled", vm.name());
    }
    if lapic::has_interrupt(vm, vcpu)?.is_none() {
        // Nothing deliverable; sleep until an injection wakes us.
        x86_vcpu_mut(vm, vcpu)?.state.interrupt_halt = true;
    }
    advance_fault(vm, vcpu)?;
    Ok(FaultResult::Handled)
}

/// VMCALL: dispatch on the token in EAX.
fn handle_vmcall(vm: &mut Vm, vcpu: usize) -> Result<FaultResult> {
    let token = x86_vcpu(vm, vcpu)?.state.context_reg(ctx::EAX)?;
    let handler_idx = {
        let x86 = vm.arch.as_x86().ok_or(VmError::WrongArch)?;
        x86.vmcall_handlers.iter().position(|e| e.token == token)
    };
    match handler_idx {
        None => {
            log::error!("vm {}: no vmcall handler for token {token:#x}", vm.name());
            advance_fault(vm, vcpu)?;
            Ok(FaultResult::Handled)
        }
        Some(idx) => {
            // Move the handler out so it can borrow the VM.
            let x86 = vm.arch.as_x86_mut().ok_or(VmError::WrongArch)?;
            let mut entry = x86.vmcall_handlers.swap_remove(idx);
            let result = (entry.handler)(vm, vcpu);
            let x86 = vm.arch.as_x86_mut().ok_or(VmError::WrongArch)?;
            x86.vmcall_handlers.push(entry);
            match result {
                Ok(()) => {
                    advance_fault(vm, vcpu)?;
                    Ok(FaultResult::Handled)
                }
                Err(err) => {
                    log::error!("vm {}: vmcall handler failed: {err}", vm.name());
                    Ok(FaultResult::Error)
                }
            }
        }
    }
}

/// Preemption-timer exits exist for debugging; rearm and continue.
fn handle_preemption_timer(vm: &mut Vm, vcpu: usize) -> Result<FaultResult> {
    let kobj = vm.vcpu(vcpu)?.kobj;
    log::debug!(
        "vm {}: preemption timer fired at eip {:#x}",
        vm.name(),
        x86_vcpu(vm, vcpu)?.state.eip
    );
    vm.kernel
        .vcpu_write_reg(kobj, state::vmcs::GUEST_PREEMPTION_TIMER_VALUE, u32::MAX as u64)?;
    Ok(FaultResult::Handled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mock::MockKernel;
    use crate::kernel::{x86_mr, KernelOps, Mrs};
    use lapic::x86_vcpu_mut;
    use state::ctx;
    use std::sync::Arc;

    fn x86_vm() -> (Arc<MockKernel>, Vm) {
        let mock = Arc::new(MockKernel::new());
        let kernel: Arc<dyn KernelOps> = mock.clone();
        let ep = kernel.create_endpoint().unwrap();
        let mut vm = Vm::new(kernel, 1, "x86-vm", ep, crate::arch::VmArch::new_x86()).unwrap();
        vm.create_vcpu(100).unwrap();
        lapic::create_lapic(&mut vm, 0, true).unwrap();
        vm.vcpu_start(0).unwrap();
        (mock, vm)
    }

    fn fault_mrs(reason: u64, fill: impl FnOnce(&mut [u64])) -> Mrs {
        let mut mrs = [0u64; x86_mr::FAULT_LEN];
        mrs[x86_mr::CALL_EIP] = 0x10_0000;
        mrs[x86_mr::FAULT_REASON] = reason;
        mrs[x86_mr::FAULT_INSTRUCTION_LEN] = 1;
        fill(&mut mrs);
        Mrs::new(&mrs)
    }

    #[test]
    fn test_hlt_with_interrupts_enabled_halts_until_injection() {
        let (mock, mut vm) = x86_vm();
        let hlt = fault_mrs(exit_reason::HLT, |mrs| {
            mrs[x86_mr::FAULT_RFLAGS] = 1 << 9;
        });
        mock.push_enter(crate::kernel::VmEnterResult::Fault(hlt));
        // The loop halts after the HLT, falls back to the wait path and
        // runs out of scripted events.
        assert!(vm.run().is_err());
        assert!(x86_vcpu(&vm, 0).unwrap().state.interrupt_halt);
        // RIP stepped past the hlt.
        assert_eq!(x86_vcpu(&vm, 0).unwrap().state.eip, 0x10_0001);

        // An injection clears the halt and requests an exit window.
        vm.inject_irq(0, 0x30).unwrap();
        let state = &x86_vcpu(&vm, 0).unwrap().state;
        assert!(!state.interrupt_halt);
        assert_ne!(state.control_ppc & state::PPC_INTERRUPT_WINDOW_EXITING, 0);
    }

    #[test]
    fn test_pending_interrupt_exit_injects_vector() {
        let (_, mut vm) = x86_vm();
        // Interruptible guest state with a pending vector.
        {
            let x86 = x86_vcpu_mut(&mut vm, 0).unwrap();
            x86.state.invalidate_all();
            x86.state.load_fault(&fault_mrs(exit_reason::PENDING_INTERRUPT, |mrs| {
                mrs[x86_mr::FAULT_RFLAGS] = 1 << 9;
            }));
            x86.lapic.set_irr(0x31);
        }
        interrupt::handle_pending_interrupt(&mut vm, 0).unwrap();
        let state = &x86_vcpu(&vm, 0).unwrap().state;
        assert_eq!(state.control_entry, (1 << 31) | 0x31);
        // Nothing else pending: the window request is dropped.
        assert_eq!(state.control_ppc & state::PPC_INTERRUPT_WINDOW_EXITING, 0);
        // The vector moved from IRR to ISR.
        let lapic = &x86_vcpu(&vm, 0).unwrap().lapic;
        assert_eq!(lapic.find_highest_irr(), None);
    }

    #[test]
    fn test_cpuid_exit_fills_registers() {
        let (mock, mut vm) = x86_vm();
        let cpuid = fault_mrs(exit_reason::CPUID, |mrs| {
            mrs[x86_mr::FAULT_EAX] = 0;
            mrs[x86_mr::FAULT_RFLAGS] = 1 << 9;
        });
        mock.push_enter(crate::kernel::VmEnterResult::Fault(cpuid));
        assert!(vm.run().is_err());
        let state = &x86_vcpu(&vm, 0).unwrap().state;
        // After resume the context was flushed back to the kernel.
        let tcb = vm.vcpu(0).unwrap().tcb_handle();
        let regs = mock.tcb_regs_of(tcb);
        assert_eq!(regs.gpr[ctx::EBX], 0x756e_6547); // "Genu"
        assert!(!state.in_exit());
    }

    #[test]
    fn test_unknown_exit_reason_is_fatal() {
        let (mock, mut vm) = x86_vm();
        mock.push_enter(crate::kernel::VmEnterResult::Fault(fault_mrs(0x7f, |_| {})));
        assert!(vm.run().is_err());
        assert_eq!(vm.exit_reason(), Some(crate::vm::ExitReason::Unknown));
        assert!(!vm.vcpu(0).unwrap().is_online());
    }

    #[test]
    fn test_vmcall_dispatches_on_token() {
        let (_, mut vm) = x86_vm();
        register_vmcall_handler(
            &mut vm,
            0x4711,
            Box::new(|vm, vcpu| {
                let x86 = lapic::x86_vcpu_mut(vm, vcpu)?;
                x86.state.set_context_reg(ctx::EBX, 0x99)?;
                Ok(())
            }),
        )
        .unwrap();
        assert!(register_vmcall_handler(&mut vm, 0x4711, Box::new(|_, _| Ok(()))).is_err());

        let x86 = x86_vcpu_mut(&mut vm, 0).unwrap();
        x86.state.invalidate_all();
        x86.state.load_fault(&fault_mrs(exit_reason::VMCALL, |mrs| {
            mrs[x86_mr::FAULT_EAX] = 0x4711;
        }));
        handle_vmcall(&mut vm, 0).unwrap();
        let state = &x86_vcpu(&vm, 0).unwrap().state;
        assert_eq!(state.context_reg(ctx::EBX).unwrap(), 0x99);
        assert_eq!(state.eip, 0x10_0001);
    }
}
