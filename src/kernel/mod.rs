//! Capability-kernel syscall contract.
//!
//! Everything the runtime asks of the underlying microkernel goes through
//! the [`KernelOps`] trait: creating vCPU objects, reading and writing
//! per-field vCPU register state, installing frame mappings, blocking on
//! the VM's fault endpoint and replying to resume a guest.
//!
//! The kernel itself is out of scope for this crate. The embedder supplies
//! the one real implementation for its platform; the test suite drives the
//! runtime against [`mock::MockKernel`], which models frames as plain byte
//! buffers and records every invocation.
//!
//! # Fault IPC model
//!
//! Each vCPU is bound to a badged copy of the VM's host endpoint
//! (badge = vcpu id + 1). A guest exit arrives as an [`ExitEvent`]: the
//! badge identifies the vCPU, the label classifies the exit, and the
//! message registers carry the kernel's dense fault description. Replying
//! (with optionally updated message registers) resumes the guest.
//!
//! On x86 the enter/exit pair is fused: [`KernelOps::vm_enter`] publishes
//! the instruction pointer, the primary processor-based controls and the
//! entry-interrupt info, blocks, and comes back with either a fault or a
//! notification.

use std::fmt;

use thiserror::Error;

#[cfg(test)]
pub(crate) mod mock;

/// Capability pointer into the host's cspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cap(pub u64);

impl Cap {
    /// The null capability.
    pub const NULL: Cap = Cap(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Cap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap:{:#x}", self.0)
    }
}

/// A mappable memory frame: a frame capability plus its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub cap: Cap,
    pub size_bits: u8,
}

impl Frame {
    pub fn size(&self) -> u64 {
        1u64 << self.size_bits
    }
}

/// Mapping rights for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRights {
    pub read: bool,
    pub write: bool,
}

impl MapRights {
    pub const READ_WRITE: MapRights = MapRights {
        read: true,
        write: true,
    };
    pub const READ_ONLY: MapRights = MapRights {
        read: true,
        write: false,
    };
}

/// General-purpose register block of a vCPU's TCB.
///
/// Laid out the way the kernel reports a user context: program counter,
/// stack pointer, saved program status, then the numbered registers
/// (x0-x30 on AArch64).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcbRegs {
    pub pc: u64,
    pub sp: u64,
    pub spsr: u64,
    pub gpr: [u64; 31],
}

impl Default for TcbRegs {
    fn default() -> Self {
        TcbRegs {
            pc: 0,
            sp: 0,
            spsr: 0,
            gpr: [0; 31],
        }
    }
}

/// Maximum number of message registers an exit can carry.
pub const MAX_EXIT_MRS: usize = 24;

/// Message-register payload of one exit.
#[derive(Debug, Clone, Copy)]
pub struct Mrs {
    words: [u64; MAX_EXIT_MRS],
    len: usize,
}

impl Mrs {
    pub fn new(words: &[u64]) -> Self {
        let mut buf = [0u64; MAX_EXIT_MRS];
        let len = words.len().min(MAX_EXIT_MRS);
        buf[..len].copy_from_slice(&words[..len]);
        Mrs { words: buf, len }
    }

    pub fn empty() -> Self {
        Mrs {
            words: [0; MAX_EXIT_MRS],
            len: 0,
        }
    }

    /// Word at `idx`, zero when the message is shorter than that.
    pub fn get(&self, idx: usize) -> u64 {
        if idx < self.len {
            self.words[idx]
        } else {
            0
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.words[..self.len]
    }
}

/// Classification of an inbound event on the host endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitLabel {
    /// Stage-2 / EPT memory fault.
    VmFault,
    /// Guest executed a syscall-class instruction the kernel cannot service.
    UnknownSyscall,
    /// User-level exception in the guest.
    UserException,
    /// Virtual GIC maintenance interrupt (list register needs service).
    VgicMaintenance,
    /// Trapped privileged-register access (HSR delivered in MR0).
    VcpuFault,
    /// Virtual PPI event delivered for forwarding into the guest.
    VppiEvent,
    /// Plain notification, no fault payload.
    Notification,
    /// Anything the shim could not classify.
    Unknown(u64),
}

/// One event received from the kernel: who sent it, what it is, and the
/// fault payload.
#[derive(Debug, Clone, Copy)]
pub struct ExitEvent {
    pub badge: u64,
    pub label: ExitLabel,
    pub mrs: Mrs,
}

/// Result of an x86 VM-entry invocation.
#[derive(Debug, Clone, Copy)]
pub enum VmEnterResult {
    /// The guest faulted; the message registers describe the exit.
    Fault(Mrs),
    /// A notification interrupted the entry.
    Notification { badge: u64, mrs: Mrs },
}

/// Message-register layout of ARM fault messages.
pub mod arm_mr {
    /// Stage-2 abort: faulting instruction address.
    pub const VMF_IP: usize = 0;
    /// Stage-2 abort: faulting guest-physical address.
    pub const VMF_ADDR: usize = 1;
    /// Stage-2 abort: non-zero when this is a prefetch (instruction) fault.
    pub const VMF_PREFETCH: usize = 2;
    /// Stage-2 abort: fault status register (HSR).
    pub const VMF_FSR: usize = 3;
    /// Unknown-syscall: faulting instruction address.
    pub const US_FAULT_IP: usize = 8;
    /// Unknown-syscall: the syscall number.
    pub const US_SYSCALL: usize = 12;
    /// VGIC maintenance: serviced list-register index.
    pub const VGIC_IDX: usize = 0;
    /// VCPU fault: HSR value.
    pub const VCPU_HSR: usize = 0;
    /// VPPI event: interrupt number.
    pub const VPPI_IRQ: usize = 0;
}

/// Message-register layout of the x86 VM-entry result.
pub mod x86_mr {
    pub const CALL_EIP: usize = 0;
    pub const CALL_CONTROL_PPC: usize = 1;
    pub const CALL_CONTROL_ENTRY: usize = 2;
    pub const FAULT_REASON: usize = 3;
    pub const FAULT_QUALIFICATION: usize = 4;
    pub const FAULT_INSTRUCTION_LEN: usize = 5;
    pub const FAULT_GUEST_PHYSICAL: usize = 6;
    pub const FAULT_RFLAGS: usize = 7;
    pub const FAULT_GUEST_INT: usize = 8;
    pub const FAULT_CR3: usize = 9;
    pub const FAULT_EAX: usize = 10;
    pub const FAULT_EBX: usize = 11;
    pub const FAULT_ECX: usize = 12;
    pub const FAULT_EDX: usize = 13;
    pub const FAULT_ESI: usize = 14;
    pub const FAULT_EDI: usize = 15;
    pub const FAULT_EBP: usize = 16;
    /// Number of words in a fault result.
    pub const FAULT_LEN: usize = 17;
    /// Number of words in a notification result.
    pub const NOTIF_LEN: usize = 3;
}

/// Errors surfaced by kernel invocations.
#[derive(Error, Debug)]
pub enum KernelError {
    /// The kernel rejected an invocation.
    #[error("kernel invocation {invocation} failed with code {code}")]
    InvocationFailed {
        invocation: &'static str,
        code: i64,
    },

    /// An object allocation was refused.
    #[error("kernel object allocation failed: {0}")]
    AllocationFailed(&'static str),

    /// The wait returned nothing (mock kernels only: the scripted event
    /// queue ran dry).
    #[error("no event pending on endpoint")]
    NoEvent,
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// The syscall surface the runtime needs from the capability kernel.
///
/// Object-safe so the VM can hold it as `Arc<dyn KernelOps>`. All methods
/// take `&self`; implementations are expected to be internally
/// synchronized the way kernel syscalls are.
pub trait KernelOps: Send + Sync {
    // Object creation.
    fn create_vspace(&self) -> Result<Cap>;
    fn create_cspace(&self) -> Result<Cap>;
    fn create_endpoint(&self) -> Result<Cap>;
    fn create_vcpu(&self) -> Result<Cap>;
    fn create_tcb(&self, priority: u8) -> Result<Cap>;
    /// Bind a vCPU object to the TCB that will run it.
    fn bind_vcpu_tcb(&self, vcpu: Cap, tcb: Cap) -> Result<()>;
    /// Mint a badged copy of `endpoint` and install it as the TCB's fault
    /// endpoint so exits arrive with a recognizable badge.
    fn mint_badged_endpoint(&self, endpoint: Cap, badge: u64) -> Result<Cap>;
    fn set_tcb_fault_endpoint(&self, tcb: Cap, badged: Cap) -> Result<()>;
    fn delete_cap(&self, cap: Cap) -> Result<()>;

    // TCB control.
    fn tcb_resume(&self, tcb: Cap) -> Result<()>;
    fn tcb_suspend(&self, tcb: Cap) -> Result<()>;
    fn tcb_read_regs(&self, tcb: Cap) -> Result<TcbRegs>;
    fn tcb_write_regs(&self, tcb: Cap, regs: &TcbRegs) -> Result<()>;

    // Per-field vCPU register file (banked registers, VMCS fields).
    fn vcpu_read_reg(&self, vcpu: Cap, field: u32) -> Result<u64>;
    fn vcpu_write_reg(&self, vcpu: Cap, field: u32, value: u64) -> Result<()>;

    // Fault IPC.
    /// Block until an event arrives on the VM's host endpoint.
    fn wait_exit(&self, endpoint: Cap) -> Result<ExitEvent>;
    /// Save the caller's reply capability out of the IPC slot.
    fn save_reply(&self) -> Result<Cap>;
    /// Reply to a saved fault, resuming the vCPU.
    fn send_reply(&self, reply: Cap, mrs: &[u64]) -> Result<()>;
    /// x86 fused entry: publish `(eip, control_ppc, control_entry)`, run
    /// the guest, return the next fault or notification.
    fn vm_enter(&self, vcpu: Cap, mrs: &[u64; 3]) -> Result<VmEnterResult>;

    // Frames and mappings.
    fn alloc_frame(&self, size_bits: u8) -> Result<Frame>;
    /// Allocate a frame backed by untyped/device memory at a fixed
    /// physical address.
    fn alloc_frame_at(&self, paddr: u64, size_bits: u8) -> Result<Frame>;
    fn free_frame(&self, frame: Frame) -> Result<()>;
    fn map_frame(&self, vspace: Cap, frame: &Frame, gpa: u64, rights: MapRights) -> Result<()>;
    fn unmap_frame(&self, vspace: Cap, frame: &Frame, gpa: u64) -> Result<()>;
    /// Expose a frame's bytes through a host-side touch window.
    fn frame_data(&self, frame: &Frame, f: &mut dyn FnMut(&mut [u8])) -> Result<()>;

    // Interrupt plumbing.
    /// Load a virtual IRQ into the numbered list register of a vCPU.
    fn vcpu_inject_irq(
        &self,
        vcpu: Cap,
        virq: u32,
        priority: u8,
        group: u8,
        index: u8,
    ) -> Result<()>;
    /// Acknowledge (unmask) a virtual PPI the kernel delivered.
    fn vcpu_ack_vppi(&self, vcpu: Cap, irq: u32) -> Result<()>;
    /// Acknowledge a host interrupt (x86 ExtINT coupling).
    fn irq_ack(&self, irq: Cap) -> Result<()>;
}
