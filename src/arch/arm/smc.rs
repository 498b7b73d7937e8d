//! SMC exception routing.
//!
//! Function identifiers follow the SMC calling convention: the owning
//! service lives in bits [29:24], the function number in the low 16
//! bits, and bit 31 selects the 32- or 64-bit convention (ignored for
//! the services handled here). Only the Standard Service range is
//! serviced (PSCI); every other service is logged and fatal.

use crate::memory::FaultResult;
use crate::vm::{Result, Vm};

use super::{get_thread_context, psci};

const SMC_SERVICE_SHIFT: u32 = 24;
const SMC_SERVICE_MASK: u64 = 0x3f;
const SMC_FUNC_ID_MASK: u64 = 0xffff;

/// Owning service of an SMC function identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmcService {
    ArmArch,
    Cpu,
    Sip,
    Oem,
    Standard,
    StandardHyp,
    VendorHyp,
    TrustedApp,
    TrustedOs,
    Reserved,
}

pub fn service_of(func_id: u64) -> SmcService {
    match (func_id >> SMC_SERVICE_SHIFT) & SMC_SERVICE_MASK {
        0 => SmcService::ArmArch,
        1 => SmcService::Cpu,
        2 => SmcService::Sip,
        3 => SmcService::Oem,
        4 => SmcService::Standard,
        5 => SmcService::StandardHyp,
        6 => SmcService::VendorHyp,
        7..=47 => SmcService::Reserved,
        48..=49 => SmcService::TrustedApp,
        50..=63 => SmcService::TrustedOs,
        _ => SmcService::Reserved,
    }
}

pub fn function_number(func_id: u64) -> u64 {
    func_id & SMC_FUNC_ID_MASK
}

/// Dispatch a trapped SMC on its service range.
pub(crate) fn handle_smc(vm: &mut Vm, vcpu: usize, _hsr: u64) -> Result<FaultResult> {
    let regs = get_thread_context(vm, vcpu)?;
    let func_id = regs.gpr[0];
    let fn_number = function_number(func_id);

    match service_of(func_id) {
        SmcService::Standard if fn_number < psci::PSCI_MAX => {
            psci::handle_psci(vm, vcpu, fn_number)
        }
        service => {
            log::error!(
                "vm {}: unhandled SMC: {service:?} service, function {fn_number}",
                vm.name()
            );
            Ok(FaultResult::Error)
        }
    }
}
