//! Guest-boot construction.
//!
//! Image loading is shared: [`image`] walks ELF32 program headers into
//! guest RAM (patching Linux-style relocations when the image is
//! relocatable) and places modules such as an initrd. The per-arch
//! boot surfaces live in [`x86`] (boot_params / e820 / VESA / ACPI) and
//! [`fdt`] (device-tree trimming and the virtual-PCI node for ARM).

pub mod fdt;
pub mod image;
pub mod x86;

use thiserror::Error;

use crate::memory::MemoryError;
use crate::vm::VmError;

#[derive(Error, Debug)]
pub enum BootError {
    #[error("invalid guest kernel image: {0}")]
    InvalidKernel(&'static str),

    #[error("image does not fit guest RAM at {addr:#x}")]
    ImageDoesNotFit { addr: u64 },

    #[error("relocation required but the relocs data holds no entries")]
    EmptyRelocs,

    #[error("command line too long: {len} bytes")]
    CmdlineTooLong { len: usize },

    #[error("no guest RAM registered")]
    NoGuestRam,

    #[error("malformed device tree: {0}")]
    BadDeviceTree(&'static str),

    #[error("device-tree node {0:?} not found")]
    NodeNotFound(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Vm(#[from] VmError),

    #[error(transparent)]
    Kernel(#[from] crate::kernel::KernelError),
}

pub type Result<T> = std::result::Result<T, BootError>;

/// A loaded guest image (module, initrd).
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestImage {
    pub load_paddr: u64,
    pub size: u64,
    pub alignment: u64,
}

/// A loaded guest kernel: the plain image plus link-time and relocation
/// metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestKernelImage {
    pub image: GuestImage,
    /// Physical address the image was linked for.
    pub link_paddr: u64,
    /// Virtual address the image was linked for.
    pub link_vaddr: u64,
    /// Entry point, already adjusted by the relocation offset.
    pub entry: u64,
    /// load - link delta applied to every loaded segment.
    pub relocation_offset: i64,
}
