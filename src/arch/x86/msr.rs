//! RDMSR/WRMSR exits.
//!
//! Only a fixed safelist is serviced; everything else injects #GP into
//! the guest instead of faulting the VM, matching what hardware does
//! for an unknown MSR.

use crate::memory::FaultResult;
use crate::vm::{Result, Vm};

use super::lapic;
use super::state::ctx;
use super::{advance_fault, interrupt, x86_vcpu};

pub const MSR_IA32_PLATFORM_ID: u64 = 0x17;
pub const MSR_IA32_APICBASE: u64 = 0x1b;
pub const MSR_EBC_FREQUENCY_ID: u64 = 0x2c;
pub const MSR_IA32_UCODE_WRITE: u64 = 0x79;
pub const MSR_IA32_UCODE_REV: u64 = 0x8b;
pub const MSR_P6_PERFCTR0: u64 = 0xc1;
pub const MSR_P6_PERFCTR1: u64 = 0xc2;
pub const MSR_FSB_FREQ: u64 = 0xcd;
pub const MSR_P6_EVNTSEL0: u64 = 0x186;
pub const MSR_P6_EVNTSEL1: u64 = 0x187;
pub const MSR_IA32_MISC_ENABLE: u64 = 0x1a0;
pub const MSR_IA32_EBL_CR_POWERON: u64 = 0x2a;
pub const MSR_IA32_DEBUGCTLMSR: u64 = 0x1d9;
pub const MSR_IA32_LASTBRANCHFROMIP: u64 = 0x1db;
pub const MSR_IA32_LASTBRANCHTOIP: u64 = 0x1dc;
pub const MSR_IA32_LASTINTFROMIP: u64 = 0x1dd;
pub const MSR_IA32_LASTINTTOIP: u64 = 0x1de;
pub const MSR_IA32_PERF_GLOBAL_STATUS_SET: u64 = 0x391;

const GP_FAULT: u8 = 13;

pub(crate) fn handle_rdmsr(vm: &mut Vm, vcpu: usize) -> Result<FaultResult> {
    let msr_no = x86_vcpu(vm, vcpu)?.state.context_reg(ctx::ECX)?;

    let data: u64 = match msr_no {
        MSR_IA32_PLATFORM_ID
        | MSR_IA32_EBL_CR_POWERON
        | MSR_IA32_DEBUGCTLMSR
        | MSR_IA32_LASTBRANCHFROMIP
        | MSR_IA32_LASTBRANCHTOIP
        | MSR_IA32_LASTINTFROMIP
        | MSR_IA32_LASTINTTOIP
        | MSR_IA32_MISC_ENABLE => 0,

        MSR_IA32_UCODE_REV => 0x1_0000_0000,

        // Performance counters read as empty.
        MSR_P6_PERFCTR0
        | MSR_P6_PERFCTR1
        | MSR_P6_EVNTSEL0
        | MSR_P6_EVNTSEL1
        | MSR_IA32_PERF_GLOBAL_STATUS_SET => 0,

        MSR_FSB_FREQ => 3,
        MSR_EBC_FREQUENCY_ID => 1 << 24,

        MSR_IA32_APICBASE => lapic::get_base_msr(vm, vcpu)?,

        _ => {
            log::warn!("rdmsr of unsupported msr {msr_no:#x}");
            interrupt::inject_exception(vm, vcpu, GP_FAULT, Some(0))?;
            return Ok(FaultResult::Handled);
        }
    };

    let state = &mut lapic::x86_vcpu_mut(vm, vcpu)?.state;
    state.set_context_reg(ctx::EAX, data & 0xffff_ffff)?;
    state.set_context_reg(ctx::EDX, data >> 32)?;
    advance_fault(vm, vcpu)?;
    Ok(FaultResult::Handled)
}

pub(crate) fn handle_wrmsr(vm: &mut Vm, vcpu: usize) -> Result<FaultResult> {
    let state = &x86_vcpu(vm, vcpu)?.state;
    let msr_no = state.context_reg(ctx::ECX)?;
    let val_low = state.context_reg(ctx::EAX)?;
    let val_high = state.context_reg(ctx::EDX)?;
    log::debug!("wrmsr {msr_no:#x} value {val_high:#x}:{val_low:#x}");

    match msr_no {
        MSR_IA32_UCODE_REV | MSR_IA32_UCODE_WRITE => {}

        MSR_P6_PERFCTR0
        | MSR_P6_PERFCTR1
        | MSR_P6_EVNTSEL0
        | MSR_P6_EVNTSEL1
        | MSR_IA32_PERF_GLOBAL_STATUS_SET => {}

        MSR_IA32_APICBASE => {
            lapic::set_base_msr(vm, vcpu, val_low)?;
        }

        _ => {
            log::warn!("wrmsr of unsupported msr {msr_no:#x}");
            interrupt::inject_exception(vm, vcpu, GP_FAULT, Some(0))?;
            return Ok(FaultResult::Handled);
        }
    }

    advance_fault(vm, vcpu)?;
    Ok(FaultResult::Handled)
}
