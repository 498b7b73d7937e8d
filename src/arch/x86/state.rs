//! Lazy VMCS and register-context cache for one vCPU.
//!
//! Around every exit the kernel reports a dense fault message; anything
//! else is fetched per-field on first read and written back only when
//! modified. The instruction pointer and the two entry controls are
//! special: they ride the enter/exit message itself and are therefore
//! always current.

use crate::arch::Cached;
use crate::kernel::{x86_mr, Cap, KernelOps, Mrs};
use crate::vm::Result;

/// VMCS field encodings used by the runtime.
pub mod vmcs {
    pub const GUEST_CR0: u32 = 0x6800;
    pub const GUEST_CR3: u32 = 0x6802;
    pub const GUEST_CR4: u32 = 0x6804;
    pub const GUEST_RFLAGS: u32 = 0x6820;
    pub const GUEST_RIP: u32 = 0x681e;
    pub const GUEST_IDTR_BASE: u32 = 0x6818;
    pub const GUEST_IDTR_LIMIT: u32 = 0x4812;
    pub const GUEST_GDTR_BASE: u32 = 0x6816;
    pub const GUEST_GDTR_LIMIT: u32 = 0x4810;
    pub const GUEST_CS_SELECTOR: u32 = 0x0802;
    pub const GUEST_INTERRUPTIBILITY: u32 = 0x4824;
    pub const GUEST_LINEAR_ADDRESS: u32 = 0x640a;
    pub const GUEST_PREEMPTION_TIMER_VALUE: u32 = 0x482e;
    pub const CONTROL_PRIMARY_PROCESSOR_CONTROLS: u32 = 0x4002;
    pub const CONTROL_ENTRY_INTERRUPTION_INFO: u32 = 0x4016;
    pub const CONTROL_ENTRY_EXCEPTION_ERROR_CODE: u32 = 0x4018;
    pub const CONTROL_CR0_MASK: u32 = 0x6000;
    pub const CONTROL_CR4_MASK: u32 = 0x6002;
    pub const CONTROL_CR0_READ_SHADOW: u32 = 0x6004;
    pub const CONTROL_CR4_READ_SHADOW: u32 = 0x6006;
}

/// Primary processor-based control bits the runtime toggles.
pub const PPC_INTERRUPT_WINDOW_EXITING: u64 = 1 << 2;
pub const PPC_CR3_LOAD_EXITING: u64 = 1 << 15;
pub const PPC_CR3_STORE_EXITING: u64 = 1 << 16;

/// Register-context indices within the exit message's GPR block.
pub mod ctx {
    pub const EAX: usize = 0;
    pub const EBX: usize = 1;
    pub const ECX: usize = 2;
    pub const EDX: usize = 3;
    pub const ESI: usize = 4;
    pub const EDI: usize = 5;
    pub const EBP: usize = 6;
    pub const NUM: usize = 7;
}

/// The GPR block published in every fault message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VcpuContext {
    pub regs: [u64; ctx::NUM],
}

/// Decoded exit description.
#[derive(Debug, Clone, Copy)]
pub struct ExitInfo {
    pub reason: u64,
    pub qualification: u64,
    pub instruction_length: u64,
    pub guest_physical: u64,
}

/// Control-register virtualization state: which bits the host owns
/// (`mask`), what the guest believes they are (`shadow`), and what they
/// must really be (`host_bits`).
#[derive(Debug, Clone, Copy, Default)]
pub struct CrState {
    pub cr0_mask: u64,
    pub cr0_shadow: u64,
    pub cr0_host_bits: u64,
    pub cr4_mask: u64,
    pub cr4_shadow: u64,
    pub cr4_host_bits: u64,
    /// Raw guest CR3, authoritative only while CR3 accesses still trap
    /// (i.e. before the guest enables paging).
    pub cr3_guest: u64,
}

pub struct GuestState {
    // Published on entry, reported on exit; always current.
    pub eip: u64,
    pub control_ppc: u64,
    pub control_entry: u64,

    context: Cached<VcpuContext>,
    cr0: Cached<u64>,
    cr3: Cached<u64>,
    cr4: Cached<u64>,
    rflags: Cached<u64>,
    interruptibility: Cached<u64>,
    idt_base: Cached<u64>,
    idt_limit: Cached<u64>,
    gdt_base: Cached<u64>,
    gdt_limit: Cached<u64>,
    cs_selector: Cached<u64>,
    entry_exception_error_code: Cached<u64>,

    /// `Some` while an exit is being serviced.
    pub exit: Option<ExitInfo>,
    pub cr: CrState,
    /// Halted in HLT until the LAPIC reports something deliverable.
    pub interrupt_halt: bool,
}

impl GuestState {
    pub fn new() -> GuestState {
        GuestState {
            eip: 0,
            control_ppc: 0,
            control_entry: 0,
            context: Cached::Valid(VcpuContext::default()),
            cr0: Cached::Valid(0),
            cr3: Cached::Valid(0),
            cr4: Cached::Valid(0),
            rflags: Cached::Valid(0),
            interruptibility: Cached::Valid(0),
            idt_base: Cached::Valid(0),
            idt_limit: Cached::Valid(0),
            gdt_base: Cached::Valid(0),
            gdt_limit: Cached::Valid(0),
            cs_selector: Cached::Valid(0),
            entry_exception_error_code: Cached::Valid(0),
            exit: None,
            cr: CrState::default(),
            interrupt_halt: false,
        }
    }

    pub fn in_exit(&self) -> bool {
        self.exit.is_some()
    }

    /// Fold a fault message into the cache. Everything the message
    /// carries becomes `Valid`; the context block arrives whole.
    pub fn load_fault(&mut self, mrs: &Mrs) {
        self.eip = mrs.get(x86_mr::CALL_EIP);
        self.control_ppc = mrs.get(x86_mr::CALL_CONTROL_PPC);
        self.control_entry = mrs.get(x86_mr::CALL_CONTROL_ENTRY);
        self.exit = Some(ExitInfo {
            reason: mrs.get(x86_mr::FAULT_REASON),
            qualification: mrs.get(x86_mr::FAULT_QUALIFICATION),
            instruction_length: mrs.get(x86_mr::FAULT_INSTRUCTION_LEN),
            guest_physical: mrs.get(x86_mr::FAULT_GUEST_PHYSICAL),
        });
        self.rflags.read(mrs.get(x86_mr::FAULT_RFLAGS));
        self.interruptibility.read(mrs.get(x86_mr::FAULT_GUEST_INT));
        self.cr3.read(mrs.get(x86_mr::FAULT_CR3));
        let mut context = VcpuContext::default();
        context.regs[ctx::EAX] = mrs.get(x86_mr::FAULT_EAX);
        context.regs[ctx::EBX] = mrs.get(x86_mr::FAULT_EBX);
        context.regs[ctx::ECX] = mrs.get(x86_mr::FAULT_ECX);
        context.regs[ctx::EDX] = mrs.get(x86_mr::FAULT_EDX);
        context.regs[ctx::ESI] = mrs.get(x86_mr::FAULT_ESI);
        context.regs[ctx::EDI] = mrs.get(x86_mr::FAULT_EDI);
        context.regs[ctx::EBP] = mrs.get(x86_mr::FAULT_EBP);
        self.context.read(context);
    }

    /// Fold a notification message into the cache.
    pub fn load_notification(&mut self, mrs: &Mrs) {
        self.eip = mrs.get(x86_mr::CALL_EIP);
        self.control_ppc = mrs.get(x86_mr::CALL_CONTROL_PPC);
        self.control_entry = mrs.get(x86_mr::CALL_CONTROL_ENTRY);
    }

    fn lazy(
        slot: &mut Cached<u64>,
        kernel: &dyn KernelOps,
        vcpu: Cap,
        field: u32,
    ) -> Result<u64> {
        match slot.get() {
            Some(value) => Ok(value),
            None => {
                let value = kernel.vcpu_read_reg(vcpu, field)?;
                slot.read(value);
                Ok(value)
            }
        }
    }

    pub fn cr0(&mut self, kernel: &dyn KernelOps, vcpu: Cap) -> Result<u64> {
        Self::lazy(&mut self.cr0, kernel, vcpu, vmcs::GUEST_CR0)
    }

    pub fn cr3(&mut self, kernel: &dyn KernelOps, vcpu: Cap) -> Result<u64> {
        Self::lazy(&mut self.cr3, kernel, vcpu, vmcs::GUEST_CR3)
    }

    pub fn cr4(&mut self, kernel: &dyn KernelOps, vcpu: Cap) -> Result<u64> {
        Self::lazy(&mut self.cr4, kernel, vcpu, vmcs::GUEST_CR4)
    }

    pub fn rflags(&mut self, kernel: &dyn KernelOps, vcpu: Cap) -> Result<u64> {
        Self::lazy(&mut self.rflags, kernel, vcpu, vmcs::GUEST_RFLAGS)
    }

    pub fn interruptibility(&mut self, kernel: &dyn KernelOps, vcpu: Cap) -> Result<u64> {
        Self::lazy(
            &mut self.interruptibility,
            kernel,
            vcpu,
            vmcs::GUEST_INTERRUPTIBILITY,
        )
    }

    pub fn idt_base(&mut self, kernel: &dyn KernelOps, vcpu: Cap) -> Result<u64> {
        Self::lazy(&mut self.idt_base, kernel, vcpu, vmcs::GUEST_IDTR_BASE)
    }

    pub fn gdt_base(&mut self, kernel: &dyn KernelOps, vcpu: Cap) -> Result<u64> {
        Self::lazy(&mut self.gdt_base, kernel, vcpu, vmcs::GUEST_GDTR_BASE)
    }

    pub fn cs_selector(&mut self, kernel: &dyn KernelOps, vcpu: Cap) -> Result<u64> {
        Self::lazy(&mut self.cs_selector, kernel, vcpu, vmcs::GUEST_CS_SELECTOR)
    }

    pub fn set_cr0(&mut self, value: u64) {
        self.cr0.modify(value);
    }

    pub fn set_cr3(&mut self, value: u64) {
        self.cr3.modify(value);
    }

    pub fn set_cr4(&mut self, value: u64) {
        self.cr4.modify(value);
    }

    pub fn set_rflags(&mut self, value: u64) {
        self.rflags.modify(value);
    }

    pub fn set_idt_base(&mut self, value: u64) {
        self.idt_base.modify(value);
    }

    pub fn set_idt_limit(&mut self, value: u64) {
        self.idt_limit.modify(value);
    }

    pub fn set_gdt_base(&mut self, value: u64) {
        self.gdt_base.modify(value);
    }

    pub fn set_gdt_limit(&mut self, value: u64) {
        self.gdt_limit.modify(value);
    }

    pub fn set_cs_selector(&mut self, value: u64) {
        self.cs_selector.modify(value);
    }

    pub fn set_entry_exception_error_code(&mut self, value: u64) {
        self.entry_exception_error_code.modify(value);
    }

    pub fn context(&self) -> Result<VcpuContext> {
        self.context.get().ok_or_else(|| {
            crate::vm::VmError::GuestInvalidOperation(
                "guest context unsynchronised; the vCPU has not exited",
            )
        })
    }

    pub fn context_reg(&self, reg: usize) -> Result<u64> {
        Ok(self.context()?.regs[reg])
    }

    pub fn set_context_reg(&mut self, reg: usize, value: u64) -> Result<()> {
        let mut context = self.context()?;
        context.regs[reg] = value;
        self.context.modify(context);
        Ok(())
    }

    /// Step past the instruction that caused the current exit.
    pub fn advance_instruction(&mut self) {
        if let Some(exit) = self.exit {
            self.eip += exit.instruction_length;
        }
    }

    pub fn context_modified(&self) -> bool {
        self.context.is_modified()
    }

    /// Flush every modified VMCS field back to the kernel.
    pub fn sync_vmcs(&mut self, kernel: &dyn KernelOps, vcpu: Cap) -> Result<()> {
        let fields: [(&mut Cached<u64>, u32); 11] = [
            (&mut self.cr0, vmcs::GUEST_CR0),
            (&mut self.cr3, vmcs::GUEST_CR3),
            (&mut self.cr4, vmcs::GUEST_CR4),
            (&mut self.rflags, vmcs::GUEST_RFLAGS),
            (&mut self.interruptibility, vmcs::GUEST_INTERRUPTIBILITY),
            (&mut self.idt_base, vmcs::GUEST_IDTR_BASE),
            (&mut self.idt_limit, vmcs::GUEST_IDTR_LIMIT),
            (&mut self.gdt_base, vmcs::GUEST_GDTR_BASE),
            (&mut self.gdt_limit, vmcs::GUEST_GDTR_LIMIT),
            (&mut self.cs_selector, vmcs::GUEST_CS_SELECTOR),
            (
                &mut self.entry_exception_error_code,
                vmcs::CONTROL_ENTRY_EXCEPTION_ERROR_CODE,
            ),
        ];
        for (slot, field) in fields {
            if let Cached::Modified(value) = *slot {
                kernel.vcpu_write_reg(vcpu, field, value)?;
                slot.flushed();
            }
        }
        Ok(())
    }

    /// Flush a modified register context back to the kernel's vCPU
    /// object.
    pub fn sync_context(&mut self, kernel: &dyn KernelOps, tcb: Cap) -> Result<()> {
        if let Cached::Modified(context) = self.context {
            let mut regs = crate::kernel::TcbRegs::default();
            regs.gpr[..ctx::NUM].copy_from_slice(&context.regs);
            kernel.tcb_write_regs(tcb, &regs)?;
            self.context.flushed();
        }
        Ok(())
    }

    pub fn no_modified(&self) -> bool {
        !(self.context.is_modified()
            || self.cr0.is_modified()
            || self.cr3.is_modified()
            || self.cr4.is_modified()
            || self.rflags.is_modified()
            || self.interruptibility.is_modified()
            || self.idt_base.is_modified()
            || self.idt_limit.is_modified()
            || self.gdt_base.is_modified()
            || self.gdt_limit.is_modified()
            || self.cs_selector.is_modified()
            || self.entry_exception_error_code.is_modified())
    }

    /// Drop every cached value ahead of the next guest entry. Modified
    /// state must have been flushed first.
    pub fn invalidate_all(&mut self) {
        debug_assert!(self.no_modified(), "invalidating unflushed guest state");
        self.context.invalidate();
        self.cr0.invalidate();
        self.cr3.invalidate();
        self.cr4.invalidate();
        self.rflags.invalidate();
        self.interruptibility.invalidate();
        self.idt_base.invalidate();
        self.idt_limit.invalidate();
        self.gdt_base.invalidate();
        self.gdt_limit.invalidate();
        self.cs_selector.invalidate();
        self.entry_exception_error_code.invalidate();
    }
}

impl Default for GuestState {
    fn default() -> Self {
        Self::new()
    }
}
