//! Argon - a guest-VM runtime library for a capability-based
//! microkernel with hardware virtualization extensions.
//!
//! The library turns a host process into the controller of one or more
//! guest virtual machines. Every guest exit (memory fault, I/O,
//! privileged-register access, hypercall, interrupt-controller access,
//! inter-processor event) traps into the embedder's process, where the
//! runtime classifies it and dispatches it to in-process handlers that
//! either emulate the operation, forward it to a registered device
//! model, or surface it to the embedder.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                     Embedder process                       │
//! │  ┌──────────┐   ┌───────────────────────────────────────┐  │
//! │  │ backends │◄──│                 Vm                    │  │
//! │  │ net/cons │   │  vcpus ─ fault objects ─ dispatch     │  │
//! │  └──────────┘   │  memory ─ reservations ─ RAM ─ touch  │  │
//! │                 │  vgic / lapic ─ pci ─ virtio ─ boot   │  │
//! │                 └──────────────────┬────────────────────┘  │
//! │                                    │ KernelOps             │
//! └────────────────────────────────────┼───────────────────────┘
//!                                      ▼
//!                        capability microkernel
//!                  (vCPU objects, frames, fault IPC)
//! ```
//!
//! The microkernel itself is out of scope: everything the runtime asks
//! of it goes through the [`kernel::KernelOps`] contract, which the
//! embedder implements for its platform and the test suite mocks.
//!
//! # Typical embedding
//!
//! ```ignore
//! let mut vm = Vm::new(kernel, 0, "guest", host_ep, VmArch::new_arm())?;
//! vm.create_vcpu(PRIORITY)?;
//! vm.ram_register_at(0x4000_0000, ram_size, false)?;
//! arch::arm::vgic::install_vgic(&mut vm, VgicConfig::default())?;
//! boot::load_guest_kernel(&mut vm, &image, ...)?;
//! vm.vcpu_start(0)?;
//! vm.run()?;
//! ```

pub mod arch;
pub mod boot;
pub mod crossvm;
pub mod ioports;
pub mod kernel;
pub mod memory;
pub mod pci;
pub mod vcpu_fault;
pub mod virtio;
pub mod vm;

pub use arch::VmArch;
pub use memory::FaultResult;
pub use vm::{ExitReason, Vm, VmError, BOOT_VCPU, MAX_VCPUS};
