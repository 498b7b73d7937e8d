//! Interrupt-window plumbing and AP bring-up.
//!
//! Injection happens through the VM-entry interruption-info field: when
//! the guest can take an interrupt (IF set, no interruptibility
//! shadow, nothing already being injected), the next pending LAPIC
//! vector rides the entry controls. Otherwise interrupt-window exiting
//! is requested and delivery retries on the PENDING_INTERRUPT exit.

use crate::memory::FaultResult;
use crate::vm::{Result, Vm, VmError};

use super::decode;
use super::lapic::{self, x86_vcpu_mut};
use super::state::PPC_INTERRUPT_WINDOW_EXITING;

/// Bytes of trampoline code emulated for a SIPI.
const TRAMPOLINE_LENGTH: usize = 100;

const RFLAGS_IF: u64 = 1 << 9;
const ENTRY_VALID: u64 = 1 << 31;
const ENTRY_DELIVER_ERROR: u64 = 1 << 11;

/// Clear interrupt-window exiting so the guest can run undisturbed.
pub(crate) fn resume_guest(vm: &mut Vm, vcpu: usize) -> Result<()> {
    let state = &mut x86_vcpu_mut(vm, vcpu)?.state;
    state.control_ppc &= !PPC_INTERRUPT_WINDOW_EXITING;
    Ok(())
}

/// Ask for an exit at the earliest injection opportunity.
pub(crate) fn wait_for_guest_ready(vm: &mut Vm, vcpu: usize) -> Result<()> {
    let state = &mut x86_vcpu_mut(vm, vcpu)?.state;
    state.control_ppc |= PPC_INTERRUPT_WINDOW_EXITING;
    Ok(())
}

fn inject_vector(vm: &mut Vm, vcpu: usize, irq: u8) -> Result<()> {
    debug_assert!(irq >= 16);
    let state = &mut x86_vcpu_mut(vm, vcpu)?.state;
    state.control_entry = ENTRY_VALID | irq as u64;
    Ok(())
}

/// Inject a vectored exception (e.g. #GP for a disallowed MSR).
pub fn inject_exception(
    vm: &mut Vm,
    vcpu: usize,
    exception: u8,
    error_code: Option<u64>,
) -> Result<()> {
    debug_assert!(exception < 16);
    let state = &mut x86_vcpu_mut(vm, vcpu)?.state;
    if state.control_entry & ENTRY_VALID != 0 {
        return Err(VmError::GuestInvalidOperation(
            "exception injection while another event is pending",
        ));
    }
    if let Some(code) = error_code {
        state.set_entry_exception_error_code(code);
    }
    state.control_entry = ENTRY_VALID
        | exception as u64
        | 3 << 8
        | if error_code.is_some() {
            ENTRY_DELIVER_ERROR
        } else {
            0
        };
    Ok(())
}

/// True when the guest can take an interrupt right now.
pub(crate) fn can_inject(vm: &mut Vm, vcpu: usize) -> Result<bool> {
    let kernel = vm.kernel.clone();
    let kobj = vm.vcpu(vcpu)?.kobj;
    let state = &mut x86_vcpu_mut(vm, vcpu)?.state;
    let rflags = state.rflags(kernel.as_ref(), kobj)?;
    let interruptibility = state.interruptibility(kernel.as_ref(), kobj)?;
    Ok(rflags & RFLAGS_IF != 0
        && interruptibility & 0xf == 0
        && state.control_entry & ENTRY_VALID == 0)
}

/// The LAPIC reported new work: inject now if possible, otherwise open
/// an interrupt window. A halted vCPU leaves the halt either way.
pub(crate) fn have_pending_interrupt(vm: &mut Vm, vcpu: usize) -> Result<()> {
    if lapic::has_interrupt(vm, vcpu)?.is_none() {
        return Ok(());
    }
    if can_inject(vm, vcpu)? {
        let halted = x86_vcpu_mut(vm, vcpu)?.state.interrupt_halt;
        if halted {
            // Wake first; injection happens on the next entry.
            wait_for_guest_ready(vm, vcpu)?;
            x86_vcpu_mut(vm, vcpu)?.state.interrupt_halt = false;
        } else if let Some(irq) = lapic::get_interrupt(vm, vcpu)? {
            inject_vector(vm, vcpu, irq)?;
            if lapic::has_interrupt(vm, vcpu)?.is_some() {
                wait_for_guest_ready(vm, vcpu)?;
            }
        }
    } else {
        wait_for_guest_ready(vm, vcpu)?;
        x86_vcpu_mut(vm, vcpu)?.state.interrupt_halt = false;
    }
    Ok(())
}

/// PENDING_INTERRUPT exit: the window is open, deliver.
pub(crate) fn handle_pending_interrupt(vm: &mut Vm, vcpu: usize) -> Result<FaultResult> {
    match lapic::get_interrupt(vm, vcpu)? {
        None => {
            resume_guest(vm, vcpu)?;
        }
        Some(irq) => {
            inject_vector(vm, vcpu, irq)?;
            if lapic::has_interrupt(vm, vcpu)?.is_none() {
                resume_guest(vm, vcpu)?;
            }
            x86_vcpu_mut(vm, vcpu)?.state.interrupt_halt = false;
        }
    }
    Ok(FaultResult::Handled)
}

/// Deliver into a vCPU's LAPIC whether or not it is mid-exit.
pub(crate) fn vcpu_accept_interrupt(vm: &mut Vm, vcpu: usize) -> Result<()> {
    if lapic::has_interrupt(vm, vcpu)?.is_none() {
        return Ok(());
    }
    have_pending_interrupt(vm, vcpu)
}

/// The PIC raised its line: route it into the boot vCPU's LAPIC when the
/// virtual wire accepts it.
pub(crate) fn check_external_interrupt(vm: &mut Vm) -> Result<()> {
    let has_pic_intr = {
        let x86 = vm.arch.as_x86_mut().ok_or(VmError::WrongArch)?;
        x86.pic
            .as_mut()
            .map(|pic| pic.has_interrupt().is_some())
            .unwrap_or(false)
    };
    if has_pic_intr {
        let bsp = crate::vm::BOOT_VCPU;
        let accepts = {
            let vc = vm.vcpu(bsp)?;
            let x86 = vc.arch.as_x86().ok_or(VmError::WrongArch)?;
            x86.lapic.accepts_extint()
        };
        if accepts {
            vcpu_accept_interrupt(vm, bsp)?;
        }
    }
    Ok(())
}

/// SIPI handling: emulate the real-mode trampoline at the vector's page
/// and start the AP at the trampoline's first protected-mode jump.
pub(crate) fn start_ap_vcpu(vm: &mut Vm, vcpu: usize, sipi_vector: u8) -> Result<()> {
    let mut segment = sipi_vector as u64 * 0x100;
    let eip = sipi_vector as u64 * 0x1000;
    log::debug!("starting AP vcpu {vcpu} from sipi vector {sipi_vector:#x}");

    let mut instr = [0u8; TRAMPOLINE_LENGTH];
    decode::fetch_instruction(&vm.mem, vm.kernel.as_ref(), eip, 0, false, &mut instr)?;

    let kernel = vm.kernel.clone();
    let (kobj, tcb) = {
        let vc = vm.vcpu(vcpu)?;
        (vc.kobj, vc.tcb)
    };
    let entry = {
        let Vm { mem, vcpus, .. } = vm;
        let state = &mut vcpus[vcpu]
            .arch
            .as_x86_mut()
            .ok_or(VmError::WrongArch)?
            .state;
        let entry =
            decode::emulate_realmode(mem, kernel.as_ref(), state, &instr, &mut segment, eip)?;
        state.eip = entry;
        state.sync_context(kernel.as_ref(), tcb)?;
        state.sync_vmcs(kernel.as_ref(), kobj)?;
        entry
    };

    vm.vcpu_mut(vcpu)?.online = true;
    vm.kernel.tcb_resume(tcb)?;
    log::debug!("AP vcpu {vcpu} online at {entry:#x}");
    Ok(())
}
