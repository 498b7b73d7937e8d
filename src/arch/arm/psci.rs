//! PSCI firmware interface, the subset a SMP guest needs to boot.
//!
//! Secondary cores come up through `CPU_ON`: the first unassigned vCPU
//! is bound to the requested physical cpu, its entry point and context
//! argument are programmed, and it is started. Return values travel in
//! the caller's first argument register.

use crate::memory::FaultResult;
use crate::vm::{Result, Vm};

use super::{advance_fault, get_thread_context, set_thread_context, vcpu_set_bootargs};

pub const PSCI_VERSION: u64 = 0x0;
pub const PSCI_CPU_ON: u64 = 0x3;
pub const PSCI_MIGRATE_INFO_TYPE: u64 = 0x6;
pub const PSCI_SYSTEM_RESET: u64 = 0x9;
pub const PSCI_FEATURES: u64 = 0xa;
pub const PSCI_MAX: u64 = 0x1f;

pub const PSCI_SUCCESS: i64 = 0;
pub const PSCI_NOT_SUPPORTED: i64 = -1;
pub const PSCI_ALREADY_ON: i64 = -4;
pub const PSCI_INTERNAL_FAILURE: i64 = -6;

/// Reported PSCI version: 1.0.
const PSCI_VERSION_1_0: u64 = 0x0001_0000;

/// Bring a fresh vCPU online for `CPU_ON`.
fn start_new_vcpu(
    vm: &mut Vm,
    vcpu: usize,
    entry: u64,
    context_id: u64,
    target_cpu: u32,
) -> Result<()> {
    vm.assign_vcpu_target(vcpu, target_cpu)?;
    if let Err(err) = vcpu_set_bootargs(vm, vcpu, entry, context_id)
        .and_then(|()| vm.vcpu_start(vcpu))
    {
        vm.vcpu_mut(vcpu)?.target_cpu = None;
        return Err(err);
    }
    Ok(())
}

fn cpu_on(vm: &mut Vm, target_cpu: u64, entry: u64, context_id: u64) -> i64 {
    let target = target_cpu as u32;
    let existing = vm
        .vcpus_iter()
        .find(|v| v.target_cpu() == Some(target))
        .map(|v| (v.id(), v.is_online()));
    match existing {
        Some((_, true)) => PSCI_ALREADY_ON,
        Some((_, false)) => PSCI_INTERNAL_FAILURE,
        None => {
            let free = vm
                .vcpus_iter()
                .find(|v| !v.is_online() && v.target_cpu().is_none())
                .map(|v| v.id());
            match free {
                Some(vcpu) => match start_new_vcpu(vm, vcpu, entry, context_id, target) {
                    Ok(()) => PSCI_SUCCESS,
                    Err(err) => {
                        log::error!("vm {}: CPU_ON failed: {err}", vm.name());
                        PSCI_INTERNAL_FAILURE
                    }
                },
                None => {
                    log::error!("vm {}: CPU_ON: no free vcpu for cpu {target}", vm.name());
                    PSCI_INTERNAL_FAILURE
                }
            }
        }
    }
}

/// Service a Standard Service SMC whose function number is in the PSCI
/// range. Unknown ids terminate the VM.
pub(crate) fn handle_psci(vm: &mut Vm, vcpu: usize, fn_number: u64) -> Result<FaultResult> {
    let mut regs = get_thread_context(vm, vcpu)?;
    let ret: i64 = match fn_number {
        PSCI_VERSION => PSCI_VERSION_1_0 as i64,
        PSCI_CPU_ON => {
            let target_cpu = regs.gpr[1];
            let entry = regs.gpr[2];
            let context_id = regs.gpr[3];
            cpu_on(vm, target_cpu, entry, context_id)
        }
        // No trusted OS to migrate.
        PSCI_MIGRATE_INFO_TYPE => 2,
        PSCI_SYSTEM_RESET => PSCI_SUCCESS,
        PSCI_FEATURES => PSCI_NOT_SUPPORTED,
        _ => {
            log::error!("vm {}: unhandled PSCI function {fn_number:#x}", vm.name());
            return Ok(FaultResult::Error);
        }
    };
    regs.gpr[0] = ret as u64;
    set_thread_context(vm, vcpu, regs)?;
    advance_fault(vm, vcpu)?;
    Ok(FaultResult::Handled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arm::fault::HSR_EC_SMC64;
    use crate::kernel::mock::MockKernel;
    use crate::kernel::{arm_mr, ExitEvent, ExitLabel, KernelOps, Mrs, TcbRegs};
    use crate::vm::MIN_VCPU_BADGE;
    use std::sync::Arc;

    fn smp_vm() -> (Arc<MockKernel>, Vm) {
        let mock = Arc::new(MockKernel::new());
        let kernel: Arc<dyn KernelOps> = mock.clone();
        let ep = kernel.create_endpoint().unwrap();
        let mut vm = Vm::new(kernel, 1, "psci-vm", ep, crate::arch::VmArch::new_arm()).unwrap();
        vm.create_vcpu(100).unwrap();
        vm.create_vcpu(100).unwrap();
        vm.assign_vcpu_target(0, 0).unwrap();
        vm.vcpu_start(0).unwrap();
        (mock, vm)
    }

    #[test]
    fn test_cpu_on_brings_up_secondary() {
        let (mock, mut vm) = smp_vm();
        let caller_tcb = vm.vcpu(0).unwrap().tcb_handle();
        let target_tcb = vm.vcpu(1).unwrap().tcb_handle();

        let mut gpr = [0u64; 31];
        gpr[0] = 0xc400_0003; // CPU_ON
        gpr[1] = 1; // target cpu
        gpr[2] = 0xdead_beef; // entry
        gpr[3] = 0xcafe; // context id
        mock.set_tcb_regs(
            caller_tcb,
            TcbRegs {
                pc: 0x4000_0000,
                gpr,
                ..TcbRegs::default()
            },
        );
        let mut mrs = [0u64; 1];
        mrs[arm_mr::VCPU_HSR] = (HSR_EC_SMC64 as u64) << 26;
        mock.push_exit(ExitEvent {
            badge: MIN_VCPU_BADGE,
            label: ExitLabel::VcpuFault,
            mrs: Mrs::new(&mrs),
        });

        assert!(vm.run().is_err()); // queue drained after the SMC

        // The secondary came online at the requested entry point with
        // the context argument in x0.
        let secondary = vm.vcpu(1).unwrap();
        assert!(secondary.is_online());
        assert_eq!(secondary.target_cpu(), Some(1));
        assert!(mock.is_resumed(target_tcb));
        let target_regs = mock.tcb_regs_of(target_tcb);
        assert_eq!(target_regs.pc, 0xdead_beef);
        assert_eq!(target_regs.gpr[0], 0xcafe);

        // The caller sees SUCCESS and steps past the SMC.
        let caller_regs = mock.tcb_regs_of(caller_tcb);
        assert_eq!(caller_regs.gpr[0], 0);
        assert_eq!(caller_regs.pc, 0x4000_0004);
        assert_eq!(mock.replies().len(), 1);
    }

    #[test]
    fn test_cpu_on_already_online() {
        let (mock, mut vm) = smp_vm();
        let caller_tcb = vm.vcpu(0).unwrap().tcb_handle();
        let mut gpr = [0u64; 31];
        gpr[0] = 0xc400_0003;
        gpr[1] = 0; // cpu 0 is the (online) caller
        mock.set_tcb_regs(
            caller_tcb,
            TcbRegs {
                pc: 0x1000,
                gpr,
                ..TcbRegs::default()
            },
        );
        let mut mrs = [0u64; 1];
        mrs[arm_mr::VCPU_HSR] = (HSR_EC_SMC64 as u64) << 26;
        mock.push_exit(ExitEvent {
            badge: MIN_VCPU_BADGE,
            label: ExitLabel::VcpuFault,
            mrs: Mrs::new(&mrs),
        });
        assert!(vm.run().is_err());
        let caller_regs = mock.tcb_regs_of(caller_tcb);
        assert_eq!(caller_regs.gpr[0] as i64, PSCI_ALREADY_ON);
    }

    #[test]
    fn test_version_and_features() {
        let (mock, mut vm) = smp_vm();
        let caller_tcb = vm.vcpu(0).unwrap().tcb_handle();
        for (fn_id, expected) in [
            (0xc400_0000u64, 0x0001_0000i64), // VERSION -> 1.0
            (0xc400_000au64, PSCI_NOT_SUPPORTED), // FEATURES
            (0xc400_0006u64, 2),              // MIGRATE_INFO_TYPE
            (0xc400_0009u64, PSCI_SUCCESS),   // SYSTEM_RESET
        ] {
            let mut gpr = [0u64; 31];
            gpr[0] = fn_id;
            mock.set_tcb_regs(
                caller_tcb,
                TcbRegs {
                    pc: 0x1000,
                    gpr,
                    ..TcbRegs::default()
                },
            );
            let mut mrs = [0u64; 1];
            mrs[arm_mr::VCPU_HSR] = (HSR_EC_SMC64 as u64) << 26;
            mock.push_exit(ExitEvent {
                badge: MIN_VCPU_BADGE,
                label: ExitLabel::VcpuFault,
                mrs: Mrs::new(&mrs),
            });
            assert!(vm.run().is_err());
            assert_eq!(mock.tcb_regs_of(caller_tcb).gpr[0] as i64, expected);
        }
    }
}
