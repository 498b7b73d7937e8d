//! Control-register access exits.
//!
//! The host owns a set of CR0/CR4 bits (the mask); the guest sees the
//! shadow. The interesting transition is the guest enabling paging:
//! from then on CR3 no longer needs to trap, and the PSE/PAE bits the
//! host was holding are handed back to the guest.

use crate::memory::FaultResult;
use crate::vm::{Result, Vm, VmError};

use super::lapic::x86_vcpu_mut;
use super::state::{ctx, vmcs, PPC_CR3_LOAD_EXITING, PPC_CR3_STORE_EXITING};
use super::{advance_fault, x86_vcpu};

pub const CR0_PE: u64 = 1 << 0;
pub const CR0_TS: u64 = 1 << 3;
pub const CR0_PG: u64 = 1 << 31;
pub const CR4_PSE: u64 = 1 << 4;
pub const CR4_PAE: u64 = 1 << 5;

/// Bits that may legally be set in each register.
const CR0_VALID: u64 = 0xe005_003f;
const CR4_VALID: u64 = 0x0037_67ff;

/// Exit-qualification register index to context register. ESP cannot
/// be moved to or from a control register this way.
const CR_EXIT_REGS: [Option<usize>; 8] = [
    Some(ctx::EAX),
    Some(ctx::ECX),
    Some(ctx::EDX),
    Some(ctx::EBX),
    None,
    Some(ctx::EBP),
    Some(ctx::ESI),
    Some(ctx::EDI),
];

/// Force host-owned bits to their required values.
fn apply_cr_bits(cr: u64, mask: u64, host_bits: u64) -> u64 {
    (cr | (mask & host_bits)) & !(mask & !host_bits)
}

fn set_cr0(vm: &mut Vm, vcpu: usize, value: u64) -> Result<()> {
    if value & !CR0_VALID != 0 {
        return Err(VmError::GuestInvalidOperation("reserved CR0 bits set"));
    }
    let kernel = vm.kernel.clone();
    let kobj = vm.vcpu(vcpu)?.kobj;
    let x86 = x86_vcpu_mut(vm, vcpu)?;

    if value & CR0_PG != 0 && x86.state.cr.cr0_shadow & CR0_PG == 0 {
        // The guest is taking over paging: stop holding PSE/PAE and
        // stop trapping CR3.
        let new_mask = x86.state.cr.cr4_mask & !(CR4_PSE | CR4_PAE);
        let changed = new_mask ^ x86.state.cr.cr4_mask;
        let cr4 = x86.state.cr4(kernel.as_ref(), kobj)?;
        let cr4 = apply_cr_bits(cr4, changed, x86.state.cr.cr4_shadow);
        x86.state.cr.cr4_mask = new_mask;
        kernel.vcpu_write_reg(kobj, vmcs::CONTROL_CR4_MASK, new_mask)?;
        x86.state.set_cr4(cr4);

        x86.state.control_ppc &= !(PPC_CR3_LOAD_EXITING | PPC_CR3_STORE_EXITING);
        let cr3 = x86.state.cr.cr3_guest;
        x86.state.set_cr3(cr3);
    }

    if value & CR0_PG == 0 && x86.state.cr.cr0_shadow & CR0_PG != 0 {
        return Err(VmError::GuestInvalidOperation(
            "guest attempted to disable paging",
        ));
    }

    x86.state.cr.cr0_shadow = value;
    kernel.vcpu_write_reg(kobj, vmcs::CONTROL_CR0_READ_SHADOW, value)?;
    let real = apply_cr_bits(value, x86.state.cr.cr0_mask, x86.state.cr.cr0_host_bits);
    x86.state.set_cr0(real);
    Ok(())
}

fn set_cr3(vm: &mut Vm, vcpu: usize, value: u64) -> Result<()> {
    let x86 = x86_vcpu_mut(vm, vcpu)?;
    // Before paging is on this is only a cached value.
    x86.state.cr.cr3_guest = value;
    if x86.state.cr.cr0_shadow & CR0_PG != 0 {
        x86.state.set_cr3(value);
    }
    Ok(())
}

fn get_cr3(vm: &mut Vm, vcpu: usize) -> Result<u64> {
    let kernel = vm.kernel.clone();
    let kobj = vm.vcpu(vcpu)?.kobj;
    let x86 = x86_vcpu_mut(vm, vcpu)?;
    if x86.state.cr.cr0_shadow & CR0_PG != 0 {
        x86.state.cr3(kernel.as_ref(), kobj)
    } else {
        Ok(x86.state.cr.cr3_guest)
    }
}

fn set_cr4(vm: &mut Vm, vcpu: usize, value: u64) -> Result<()> {
    if value & !CR4_VALID != 0 {
        return Err(VmError::GuestInvalidOperation("reserved CR4 bits set"));
    }
    let kernel = vm.kernel.clone();
    let kobj = vm.vcpu(vcpu)?.kobj;
    let x86 = x86_vcpu_mut(vm, vcpu)?;
    x86.state.cr.cr4_shadow = value;
    kernel.vcpu_write_reg(kobj, vmcs::CONTROL_CR4_READ_SHADOW, value)?;
    let real = apply_cr_bits(value, x86.state.cr.cr4_mask, x86.state.cr.cr4_host_bits);
    x86.state.set_cr4(real);
    Ok(())
}

/// CLTS clears the task-switched flag.
fn clts(vm: &mut Vm, vcpu: usize) -> Result<()> {
    let shadow = x86_vcpu(vm, vcpu)?.state.cr.cr0_shadow;
    set_cr0(vm, vcpu, shadow & !CR0_TS)
}

/// LMSW loads the low machine-status bits; it can set PE but never
/// clear it.
fn lmsw(vm: &mut Vm, vcpu: usize, value: u64) -> Result<()> {
    let shadow = x86_vcpu(vm, vcpu)?.state.cr.cr0_shadow;
    let new = (shadow & !0xe) | (value & 0xf) | (shadow & CR0_PE);
    set_cr0(vm, vcpu, new)
}

pub(crate) fn handle_cr_access(vm: &mut Vm, vcpu: usize) -> Result<FaultResult> {
    let qualification = x86_vcpu(vm, vcpu)?
        .state
        .exit
        .ok_or(VmError::GuestInvalidOperation("no exit in flight"))?
        .qualification;
    let cr = qualification & 0xf;
    let reg = CR_EXIT_REGS[((qualification >> 8) & 0xf) as usize % 8];
    let op = (qualification >> 4) & 0x3;

    let outcome = match (op, cr) {
        // mov to cr
        (0, 0) | (0, 3) | (0, 4) => {
            let Some(reg) = reg else {
                return Ok(FaultResult::Error);
            };
            let value = x86_vcpu(vm, vcpu)?.state.context_reg(reg)?;
            match cr {
                0 => set_cr0(vm, vcpu, value),
                3 => set_cr3(vm, vcpu, value),
                _ => set_cr4(vm, vcpu, value),
            }
        }
        // mov from cr
        (1, 3) => {
            let Some(reg) = reg else {
                return Ok(FaultResult::Error);
            };
            let value = get_cr3(vm, vcpu)?;
            x86_vcpu_mut(vm, vcpu)?.state.set_context_reg(reg, value)
        }
        (2, _) => clts(vm, vcpu),
        (3, _) => lmsw(vm, vcpu, (qualification >> 16) & 0xf),
        _ => {
            log::warn!("unhandled control-register access: op {op} cr {cr}");
            return Ok(FaultResult::Error);
        }
    };

    match outcome {
        Ok(()) => {
            advance_fault(vm, vcpu)?;
            Ok(FaultResult::Handled)
        }
        Err(err) => {
            log::error!("vm {}: control-register access failed: {err}", vm.name());
            Ok(FaultResult::Error)
        }
    }
}
