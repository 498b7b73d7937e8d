//! EPT-violation exits: MMIO emulation through the memory manager.

use crate::memory::FaultResult;
use crate::vm::{Result, Vm, VmError};

use super::decode;
use super::lapic::x86_vcpu_mut;
use super::{advance_fault, x86_vcpu};

const QUAL_READ: u64 = 1 << 0;
const QUAL_WRITE: u64 = 1 << 1;
const QUAL_FETCH: u64 = 1 << 2;

const CR0_PG: u64 = 1 << 31;

/// Decode the faulting access and route it to the covering reservation.
pub(crate) fn handle_ept_violation(vm: &mut Vm, vcpu: usize) -> Result<FaultResult> {
    let (guest_phys, qualification, instruction_length, eip) = {
        let exit = x86_vcpu(vm, vcpu)?
            .state
            .exit
            .ok_or(VmError::GuestInvalidOperation("no exit in flight"))?;
        (
            exit.guest_physical,
            exit.qualification,
            exit.instruction_length as usize,
            x86_vcpu(vm, vcpu)?.state.eip,
        )
    };

    if qualification & QUAL_READ != 0 && qualification & QUAL_WRITE != 0 {
        // A fault while walking EPT structures, not an MMIO access.
        log_violation(vm, vcpu, guest_phys);
        return Ok(FaultResult::Error);
    }
    if qualification & QUAL_FETCH != 0 {
        log_violation(vm, vcpu, guest_phys);
        return Ok(FaultResult::Error);
    }

    // Decode the instruction so device handlers can see the operand.
    let kernel = vm.kernel.clone();
    let kobj = vm.vcpu(vcpu)?.kobj;
    let (cr3, paging) = {
        let x86 = x86_vcpu_mut(vm, vcpu)?;
        let paging = x86.state.cr.cr0_shadow & CR0_PG != 0;
        let cr3 = if paging {
            x86.state.cr3(kernel.as_ref(), kobj)?
        } else {
            0
        };
        (cr3, paging)
    };
    let mut instr = [0u8; decode::MAX_INSTR_LEN];
    let len = instruction_length.min(decode::MAX_INSTR_LEN);
    decode::fetch_instruction(&vm.mem, kernel.as_ref(), eip, cr3, paging, &mut instr[..len])?;
    let op = decode::decode_instruction(&instr[..len])
        .map_err(|_| VmError::InstructionDecode { pc: eip })?;
    let size = op.len;
    x86_vcpu_mut(vm, vcpu)?.current_mmio = Some(op);

    let result = crate::memory::handle_guest_fault(vm, vcpu, guest_phys, size);
    let result = if result == FaultResult::Unhandled {
        match vm.unhandled_mem_fault(vcpu, guest_phys, size) {
            // The embedder either emulated or chose to skip the access.
            FaultResult::Handled | FaultResult::Ignore => {
                advance_fault(vm, vcpu)?;
                return Ok(FaultResult::Handled);
            }
            other => other,
        }
    } else {
        result
    };

    match result {
        FaultResult::Handled => Ok(FaultResult::Handled),
        FaultResult::Ignore => {
            advance_fault(vm, vcpu)?;
            Ok(FaultResult::Handled)
        }
        // Re-execute the access, e.g. after a deferred map.
        FaultResult::Restart => Ok(FaultResult::Handled),
        FaultResult::Unhandled | FaultResult::Error => {
            log_violation(vm, vcpu, guest_phys);
            Ok(FaultResult::Error)
        }
    }
}

fn log_violation(vm: &Vm, vcpu: usize, guest_phys: u64) {
    let eip = x86_vcpu(vm, vcpu).map(|x| x.state.eip).unwrap_or(0);
    log::error!(
        "vm {}: unhandled EPT violation at guest-physical {guest_phys:#x} (eip {eip:#x})",
        vm.name()
    );
}
