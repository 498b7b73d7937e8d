//! ARM guest support: exit decoding, fault emulation, PSCI and the
//! virtual GIC.
//!
//! Every exit arrives on the VM's host endpoint as a labelled fault IPC.
//! The dispatcher mirrors the kernel's label space: stage-2 aborts route
//! through the memory manager, trapped privileged operations dispatch on
//! the HSR exception class (WFx, system registers, SMC), and
//! notifications outside the vCPU badge range go to the embedder.

pub mod decode;
pub mod fault;
pub mod psci;
pub mod smc;
pub mod vgic;

use crate::kernel::{arm_mr, ExitLabel, KernelOps, TcbRegs};
use crate::memory::FaultResult;
use crate::vm::{badge_to_vcpu, ExitReason, Result, Vm, VmError, BOOT_VCPU};

use fault::{hsr_exception_class, Fault, FaultEnv};

/// vCPU register fields (banked registers and system registers) accessed
/// through the kernel's per-field vCPU invocations.
pub mod reg {
    pub const SCTLR: u32 = 0;
    pub const TTBR0: u32 = 1;
    pub const TTBR1: u32 = 2;
    pub const TCR: u32 = 3;
    pub const VMPIDR: u32 = 4;
    pub const SP_SVC: u32 = 5;
    pub const LR_SVC: u32 = 6;
    pub const SP_IRQ: u32 = 7;
    pub const LR_IRQ: u32 = 8;
    pub const SP_ABT: u32 = 9;
    pub const LR_ABT: u32 = 10;
    pub const SP_UND: u32 = 11;
    pub const LR_UND: u32 = 12;
    pub const SP_FIQ: u32 = 13;
    pub const LR_FIQ: u32 = 14;
    pub const R8_FIQ: u32 = 15;
    pub const R9_FIQ: u32 = 16;
    pub const R10_FIQ: u32 = 17;
    pub const R11_FIQ: u32 = 18;
    pub const R12_FIQ: u32 = 19;
}

/// VMPIDR bits for the boot vCPU: lowest-affinity-level interdependent
/// PEs plus the multiprocessing-extensions flag.
const VMPIDR_BOOT: u64 = (1 << 24) | (1 << 31);

/// System-register trap encoding within the HSR ISS.
const SYSREG_OP0_SHIFT: u32 = 20;
const SYSREG_OP1_SHIFT: u32 = 14;
const SYSREG_OP2_SHIFT: u32 = 17;
const SYSREG_CRN_SHIFT: u32 = 10;
const SYSREG_CRM_SHIFT: u32 = 1;

/// ARM-specific VM state: the virtual interrupt controller.
pub struct ArmVm {
    pub(crate) vgic: Option<vgic::Vgic>,
}

impl ArmVm {
    pub fn new() -> ArmVm {
        ArmVm { vgic: None }
    }
}

impl Default for ArmVm {
    fn default() -> Self {
        Self::new()
    }
}

/// ARM-specific vCPU state: the fault object.
pub struct ArmVcpu {
    pub(crate) fault: Fault,
}

impl ArmVcpu {
    pub fn new() -> ArmVcpu {
        ArmVcpu {
            fault: Fault::new(),
        }
    }
}

impl Default for ArmVcpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrow a vCPU's fault object together with the environment its
/// operations need, without aliasing the rest of the VM.
pub(crate) fn with_fault<R>(
    vm: &mut Vm,
    vcpu: usize,
    f: impl FnOnce(&mut Fault, &FaultEnv) -> Result<R>,
) -> Result<R> {
    let Vm {
        kernel,
        mem,
        vcpus,
        ..
    } = vm;
    let vc = vcpus.get_mut(vcpu).ok_or(VmError::InvalidVcpu(vcpu))?;
    let env = FaultEnv {
        kernel: kernel.as_ref(),
        mem,
        tcb: vc.tcb,
        vcpu: vc.kobj,
    };
    let arm = vc.arch.as_arm_mut().ok_or(VmError::WrongArch)?;
    f(&mut arm.fault, &env)
}

// Fault accessors used by device models while a fault is in flight.

pub fn get_fault_address(vm: &Vm, vcpu: usize) -> Result<u64> {
    let vc = vm.vcpu(vcpu)?;
    let arm = vc.arch.as_arm().ok_or(VmError::WrongArch)?;
    Ok(arm.fault.address())
}

pub fn is_read_fault(vm: &Vm, vcpu: usize) -> Result<bool> {
    let vc = vm.vcpu(vcpu)?;
    let arm = vc.arch.as_arm().ok_or(VmError::WrongArch)?;
    Ok(arm.fault.is_read())
}

pub fn get_fault_data(vm: &mut Vm, vcpu: usize) -> Result<u64> {
    with_fault(vm, vcpu, |fault, env| fault.data(env))
}

pub fn get_fault_data_mask(vm: &mut Vm, vcpu: usize) -> Result<u64> {
    with_fault(vm, vcpu, |fault, env| fault.data_mask(env))
}

pub fn get_fault_size(vm: &mut Vm, vcpu: usize) -> Result<usize> {
    with_fault(vm, vcpu, |fault, env| fault.access_size(env))
}

pub fn set_fault_data(vm: &mut Vm, vcpu: usize, data: u64) -> Result<()> {
    with_fault(vm, vcpu, |fault, _| {
        fault.set_data(data);
        Ok(())
    })
}

/// Complete the current fault stage; read faults see the queued data.
pub fn advance_fault(vm: &mut Vm, vcpu: usize) -> Result<()> {
    with_fault(vm, vcpu, |fault, env| fault.advance(env))
}

/// Resume the guest so it re-executes the faulting access.
pub fn restart_fault(vm: &mut Vm, vcpu: usize) -> Result<()> {
    with_fault(vm, vcpu, |fault, env| fault.restart(env))
}

/// Fold a device-register value through the faulting instruction.
pub fn emulate_fault(vm: &mut Vm, vcpu: usize, value: u64) -> Result<u64> {
    with_fault(vm, vcpu, |fault, env| fault.emulate(env, value))
}

/// Guest register context: the in-flight fault's cached copy when one is
/// outstanding, the TCB's otherwise.
pub fn get_thread_context(vm: &mut Vm, vcpu: usize) -> Result<TcbRegs> {
    let in_fault = {
        let vc = vm.vcpu(vcpu)?;
        let arm = vc.arch.as_arm().ok_or(VmError::WrongArch)?;
        !arm.fault.is_handled()
    };
    if in_fault {
        with_fault(vm, vcpu, |fault, env| fault.ensure_ctx(env))
    } else {
        let tcb = vm.vcpu(vcpu)?.tcb;
        Ok(vm.kernel.tcb_read_regs(tcb)?)
    }
}

pub fn set_thread_context(vm: &mut Vm, vcpu: usize, regs: TcbRegs) -> Result<()> {
    let in_fault = {
        let vc = vm.vcpu(vcpu)?;
        let arm = vc.arch.as_arm().ok_or(VmError::WrongArch)?;
        !arm.fault.is_handled()
    };
    if in_fault {
        with_fault(vm, vcpu, |fault, _| {
            fault.set_ctx(regs);
            Ok(())
        })
    } else {
        let tcb = vm.vcpu(vcpu)?.tcb;
        Ok(vm.kernel.tcb_write_regs(tcb, &regs)?)
    }
}

/// Enable the store-syndrome errata override for a vCPU (Exynos-class
/// cores report the wrong register index for thumb-mode stores).
pub fn set_errata766422(vm: &mut Vm, vcpu: usize, enabled: bool) -> Result<()> {
    with_fault(vm, vcpu, |fault, _| {
        fault.set_errata766422(enabled);
        Ok(())
    })
}

/// Program a vCPU's entry state: PC, a zero SP and the boot argument in
/// the first argument register.
pub fn vcpu_set_bootargs(vm: &mut Vm, vcpu: usize, entry: u64, arg: u64) -> Result<()> {
    let tcb = vm.vcpu(vcpu)?.tcb;
    let mut regs = vm.kernel.tcb_read_regs(tcb)?;
    regs.pc = entry;
    regs.sp = 0;
    regs.gpr[0] = arg;
    vm.kernel.tcb_write_regs(tcb, &regs)?;
    Ok(())
}

/// Start an ARM vCPU: program VMPIDR (boot vCPU gets the MP-extension
/// bits, secondaries their target cpu affinity) and resume the TCB.
pub(crate) fn vcpu_start(vm: &mut Vm, vcpu: usize) -> Result<()> {
    let (kobj, tcb, target) = {
        let vc = vm.vcpu(vcpu)?;
        (vc.kobj, vc.tcb, vc.target_cpu)
    };
    let vmpidr = if vcpu == BOOT_VCPU {
        VMPIDR_BOOT
    } else {
        target.unwrap_or(0) as u64
    };
    vm.kernel.vcpu_write_reg(kobj, reg::VMPIDR, vmpidr)?;
    vm.vcpu_mut(vcpu)?.online = true;
    vm.kernel.tcb_resume(tcb)?;
    Ok(())
}

/// The ARM event loop: block on the host endpoint, classify by badge and
/// label, dispatch, repeat until a handler reports a fatal error.
pub(crate) fn run_arch(vm: &mut Vm) -> Result<()> {
    loop {
        let event = vm.kernel.clone().wait_exit(vm.host_endpoint)?;
        let verdict = match badge_to_vcpu(event.badge) {
            Some(vcpu) if vcpu >= vm.num_vcpus() => {
                log::error!("vm {}: fault from unknown vcpu badge {}", vm.name(), event.badge);
                FaultResult::Error
            }
            Some(vcpu) => match event.label {
                ExitLabel::VmFault => handle_mem_abort(vm, vcpu, &event.mrs)?,
                ExitLabel::UnknownSyscall => handle_syscall(vm, vcpu, &event.mrs)?,
                ExitLabel::UserException => handle_user_exception(vm, vcpu, &event.mrs)?,
                ExitLabel::VgicMaintenance => {
                    let idx = event.mrs.get(arm_mr::VGIC_IDX);
                    handle_maintenance_exit(vm, vcpu, idx)?
                }
                ExitLabel::VcpuFault => {
                    let hsr = event.mrs.get(arm_mr::VCPU_HSR);
                    handle_vcpu_fault(vm, vcpu, hsr)?
                }
                ExitLabel::VppiEvent => {
                    let irq = event.mrs.get(arm_mr::VPPI_IRQ) as u32;
                    handle_vppi_event(vm, vcpu, irq)?
                }
                ExitLabel::Notification | ExitLabel::Unknown(_) => {
                    log::error!("vm {}: unknown fault label {:?}", vm.name(), event.label);
                    vm.run_state.exit_reason = Some(ExitReason::Unknown);
                    FaultResult::Error
                }
            },
            None => vm.deliver_notification(event.badge, &event.mrs),
        };
        if verdict == FaultResult::Error {
            vm.run_state.exit_reason.get_or_insert(ExitReason::Error);
            return Err(VmError::GuestInvalidOperation("fatal guest exit"));
        }
    }
}

/// Reply to a non-fault exit (VPPI, maintenance, syscall) directly.
fn reply_now(kernel: &dyn KernelOps) -> Result<()> {
    let reply = kernel.save_reply()?;
    kernel.send_reply(reply, &[])?;
    Ok(())
}

/// Stage-2 abort: build the fault object and route it through the
/// memory manager. A doubleword access dispatches twice, one stage per
/// word, sharing the single reply.
fn handle_mem_abort(vm: &mut Vm, vcpu: usize, mrs: &crate::kernel::Mrs) -> Result<FaultResult> {
    with_fault(vm, vcpu, |fault, env| {
        fault.load_memory_fault(env.kernel, mrs)
    })?;

    loop {
        let (addr, size, stage_before) = with_fault(vm, vcpu, |fault, env| {
            Ok((fault.address(), fault.access_size(env)?, fault.stage()))
        })?;

        let result = crate::memory::handle_guest_fault(vm, vcpu, addr, size);
        let result = if result == FaultResult::Unhandled {
            vm.unhandled_mem_fault(vcpu, addr, size)
        } else {
            result
        };

        match result {
            FaultResult::Handled => {
                let (handled, stage) =
                    with_fault(vm, vcpu, |fault, _| Ok((fault.is_handled(), fault.stage())))?;
                if handled || stage == stage_before {
                    // Either resolved, or the handler chose to leave the
                    // vCPU suspended.
                    return Ok(FaultResult::Handled);
                }
                // Second word of a doubleword access.
            }
            FaultResult::Restart => {
                with_fault(vm, vcpu, |fault, env| fault.restart(env))?;
                return Ok(FaultResult::Handled);
            }
            FaultResult::Ignore => {
                with_fault(vm, vcpu, |fault, env| fault.ignore(env))?;
                return Ok(FaultResult::Handled);
            }
            FaultResult::Unhandled | FaultResult::Error => {
                let (ip, fsr) = with_fault(vm, vcpu, |fault, env| {
                    let ip = fault.ip();
                    let fsr = fault.fsr();
                    fault.abandon(env);
                    Ok((ip, fsr))
                })?;
                log::error!(
                    "vm {}: unhandled pagefault at {addr:#x} (pc {ip:#x}, fsr {fsr:#x})",
                    vm.name()
                );
                return Ok(FaultResult::Error);
            }
        }
    }
}

/// Unknown-syscall exit: service the tiny hypervisor syscall set, then
/// step past the SVC instruction. Unrecognized numbers are logged and
/// skipped the same way.
fn handle_syscall(vm: &mut Vm, vcpu: usize, mrs: &crate::kernel::Mrs) -> Result<FaultResult> {
    const SYS_PA_TO_IPA: u64 = 65;
    const SYS_NOP: u64 = 67;

    let syscall = mrs.get(arm_mr::US_SYSCALL);
    let ip = mrs.get(arm_mr::US_FAULT_IP);
    let tcb = vm.vcpu(vcpu)?.tcb;
    let mut regs = vm.kernel.tcb_read_regs(tcb)?;
    regs.pc += 4;

    match syscall {
        SYS_PA_TO_IPA => {
            // Identity translation: the argument register already holds
            // the answer.
            log::debug!("vm {}: pa-to-ipa syscall at {ip:#x}", vm.name());
        }
        SYS_NOP => {}
        _ => {
            log::warn!(
                "vm {}: unrecognized syscall {syscall} at {ip:#x}, skipping",
                vm.name()
            );
        }
    }
    vm.kernel.tcb_write_regs(tcb, &regs)?;
    reply_now(vm.kernel.as_ref())?;
    Ok(FaultResult::Handled)
}

/// User exception: there is nothing to emulate, so log the context and
/// step past the instruction.
fn handle_user_exception(
    vm: &mut Vm,
    vcpu: usize,
    mrs: &crate::kernel::Mrs,
) -> Result<FaultResult> {
    let ip = mrs.get(0);
    let tcb = vm.vcpu(vcpu)?.tcb;
    let mut regs = vm.kernel.tcb_read_regs(tcb)?;
    log::error!(
        "vm {}: invalid instruction on vcpu {vcpu} at pc {ip:#x}",
        vm.name()
    );
    regs.pc += if regs.spsr & (1 << 5) != 0 { 2 } else { 4 };
    vm.kernel.tcb_write_regs(tcb, &regs)?;
    reply_now(vm.kernel.as_ref())?;
    Ok(FaultResult::Handled)
}

fn handle_maintenance_exit(vm: &mut Vm, vcpu: usize, idx: u64) -> Result<FaultResult> {
    vgic::handle_maintenance(vm, vcpu, idx as usize)?;
    reply_now(vm.kernel.as_ref())?;
    Ok(FaultResult::Handled)
}

/// Virtual PPI delivered by the kernel: forward it into the guest, or
/// acknowledge and drop it when the guest never registered the line.
fn handle_vppi_event(vm: &mut Vm, vcpu: usize, irq: u32) -> Result<FaultResult> {
    if let Err(err) = vgic::inject_irq(vm, vcpu, irq) {
        log::warn!("vm {}: VPPI {irq} dropped on vcpu {vcpu}: {err}", vm.name());
        let kobj = vm.vcpu(vcpu)?.kobj;
        vm.kernel.vcpu_ack_vppi(kobj, irq)?;
    }
    reply_now(vm.kernel.as_ref())?;
    Ok(FaultResult::Handled)
}

/// Trapped privileged operation: dispatch on the HSR exception class.
fn handle_vcpu_fault(vm: &mut Vm, vcpu: usize, hsr: u64) -> Result<FaultResult> {
    with_fault(vm, vcpu, |fault, env| fault.load_vcpu_fault(env.kernel, hsr))?;

    match hsr_exception_class(hsr) {
        fault::HSR_EC_WFX => handle_wfx(vm, vcpu),
        fault::HSR_EC_SMC64 => smc::handle_smc(vm, vcpu, hsr),
        fault::HSR_EC_SYSREG64 => handle_sysreg(vm, vcpu, hsr),
        fault::HSR_EC_SWBRK64 => {
            // Software breakpoints resume at the next instruction.
            with_fault(vm, vcpu, |fault, env| fault.advance(env))?;
            Ok(FaultResult::Handled)
        }
        ec => {
            log::error!(
                "vm {}: unhandled vcpu fault on vcpu {vcpu}: HSR {hsr:#010x} (class {ec:#x})",
                vm.name()
            );
            Ok(FaultResult::Error)
        }
    }
}

/// WFI/WFE: when the interrupt controller has anything in flight the
/// guest resumes immediately; otherwise the fault is left unanswered and
/// the vCPU sleeps until the next injection clears the halt.
fn handle_wfx(vm: &mut Vm, vcpu: usize) -> Result<FaultResult> {
    let wake = match vm.arch.as_arm().and_then(|arm| arm.vgic.as_ref()) {
        Some(vgic) => vgic.has_irqs_in_flight(vcpu),
        // Without an interrupt controller there is nothing to wait for.
        None => true,
    };
    if wake {
        with_fault(vm, vcpu, |fault, env| fault.advance(env))?;
    }
    Ok(FaultResult::Handled)
}

/// Trapped system-register accesses that are known-ignorable: the whole
/// debug/trace register space (op0 == 2) and the Cortex-A57 CPU
/// auxiliary control register. Everything else is fatal.
fn handle_sysreg(vm: &mut Vm, vcpu: usize, hsr: u64) -> Result<FaultResult> {
    let op0 = (hsr >> SYSREG_OP0_SHIFT) & 0x3;
    let op1 = (hsr >> SYSREG_OP1_SHIFT) & 0x7;
    let op2 = (hsr >> SYSREG_OP2_SHIFT) & 0x7;
    let crn = (hsr >> SYSREG_CRN_SHIFT) & 0xf;
    let crm = (hsr >> SYSREG_CRM_SHIFT) & 0xf;

    let is_debug_trace = op0 == 2;
    let is_cpuactlr = op0 == 3 && op1 == 1 && op2 == 0 && crn == 15 && crm == 2;
    if is_debug_trace || is_cpuactlr {
        with_fault(vm, vcpu, |fault, env| fault.advance(env))?;
        return Ok(FaultResult::Handled);
    }
    log::error!(
        "vm {}: unhandled sysreg trap op0={op0} op1={op1} op2={op2} crn={crn} crm={crm}",
        vm.name()
    );
    Ok(FaultResult::Error)
}
