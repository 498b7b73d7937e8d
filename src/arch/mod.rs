//! Architecture-specific VM and vCPU state.
//!
//! The runtime compiles both guest architectures; a VM picks one at
//! construction time via [`VmArch`]. Everything the dispatch core needs
//! from an architecture funnels through the per-arch `run_arch`,
//! `vcpu_start` and interrupt-controller entry points.

pub mod arm;
pub mod x86;

/// Architecture-specific VM-level state.
pub enum VmArch {
    Arm(arm::ArmVm),
    X86(x86::X86Vm),
}

impl VmArch {
    pub fn new_arm() -> VmArch {
        VmArch::Arm(arm::ArmVm::new())
    }

    pub fn new_x86() -> VmArch {
        VmArch::X86(x86::X86Vm::new())
    }

    pub fn as_arm(&self) -> Option<&arm::ArmVm> {
        match self {
            VmArch::Arm(arm) => Some(arm),
            _ => None,
        }
    }

    pub fn as_arm_mut(&mut self) -> Option<&mut arm::ArmVm> {
        match self {
            VmArch::Arm(arm) => Some(arm),
            _ => None,
        }
    }

    pub fn as_x86(&self) -> Option<&x86::X86Vm> {
        match self {
            VmArch::X86(x86) => Some(x86),
            _ => None,
        }
    }

    pub fn as_x86_mut(&mut self) -> Option<&mut x86::X86Vm> {
        match self {
            VmArch::X86(x86) => Some(x86),
            _ => None,
        }
    }
}

/// Architecture-specific vCPU-level state.
pub enum VcpuArch {
    Arm(arm::ArmVcpu),
    X86(Box<x86::X86Vcpu>),
}

impl VcpuArch {
    pub fn new_arm() -> VcpuArch {
        VcpuArch::Arm(arm::ArmVcpu::new())
    }

    pub fn new_x86() -> VcpuArch {
        VcpuArch::X86(Box::new(x86::X86Vcpu::new()))
    }

    pub fn as_arm(&self) -> Option<&arm::ArmVcpu> {
        match self {
            VcpuArch::Arm(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_arm_mut(&mut self) -> Option<&mut arm::ArmVcpu> {
        match self {
            VcpuArch::Arm(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_x86(&self) -> Option<&x86::X86Vcpu> {
        match self {
            VcpuArch::X86(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_x86_mut(&mut self) -> Option<&mut x86::X86Vcpu> {
        match self {
            VcpuArch::X86(v) => Some(v),
            _ => None,
        }
    }
}

/// Lazy per-field machine-state cache.
///
/// `Valid` mirrors the kernel's value, `Modified` must be written back
/// before the guest resumes, `Unknown` forces a fetch on first read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cached<T> {
    Unknown,
    Valid(T),
    Modified(T),
}

impl<T: Copy> Cached<T> {
    pub fn get(&self) -> Option<T> {
        match self {
            Cached::Unknown => None,
            Cached::Valid(v) | Cached::Modified(v) => Some(*v),
        }
    }

    pub fn is_modified(&self) -> bool {
        matches!(self, Cached::Modified(_))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Cached::Unknown)
    }

    /// Record a kernel-reported value.
    pub fn read(&mut self, value: T) {
        *self = Cached::Valid(value);
    }

    /// Record a host-side change that must reach the kernel.
    pub fn modify(&mut self, value: T) {
        *self = Cached::Modified(value);
    }

    /// Downgrade `Modified` to `Valid` after a write-back.
    pub fn flushed(&mut self) {
        if let Cached::Modified(v) = *self {
            *self = Cached::Valid(v);
        }
    }

    pub fn invalidate(&mut self) {
        *self = Cached::Unknown;
    }
}
