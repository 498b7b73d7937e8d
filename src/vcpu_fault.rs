//! Architecture-neutral view of the in-flight vCPU fault.
//!
//! Device models (PCI config space, virtio transport, the cross-VM
//! connector) emulate MMIO the same way on both guest architectures:
//! read the access parameters, supply or consume the data, advance.
//! These helpers dispatch to the owning architecture's fault object.

use crate::arch::{arm, x86};
use crate::vm::{Result, Vm};

/// Faulting guest-physical address of the current stage.
pub fn get_fault_address(vm: &Vm, vcpu: usize) -> Result<u64> {
    if vm.is_arm() {
        arm::get_fault_address(vm, vcpu)
    } else {
        x86::get_fault_address(vm, vcpu)
    }
}

pub fn is_read_fault(vm: &Vm, vcpu: usize) -> Result<bool> {
    if vm.is_arm() {
        arm::is_read_fault(vm, vcpu)
    } else {
        x86::is_read_fault(vm, vcpu)
    }
}

/// Access width in bytes.
pub fn get_fault_size(vm: &mut Vm, vcpu: usize) -> Result<usize> {
    if vm.is_arm() {
        arm::get_fault_size(vm, vcpu)
    } else {
        x86::get_fault_size(vm, vcpu)
    }
}

/// The data being written, or previously queued for a read.
pub fn get_fault_data(vm: &mut Vm, vcpu: usize) -> Result<u64> {
    if vm.is_arm() {
        arm::get_fault_data(vm, vcpu)
    } else {
        x86::get_fault_data(vm, vcpu)
    }
}

/// Queue the data a read fault returns to the guest.
pub fn set_fault_data(vm: &mut Vm, vcpu: usize, data: u64) -> Result<()> {
    if vm.is_arm() {
        arm::set_fault_data(vm, vcpu, data)
    } else {
        x86::set_fault_data(vm, vcpu, data)
    }
}

/// Mask selecting the accessed bytes within the aligned word.
pub fn get_fault_data_mask(vm: &mut Vm, vcpu: usize) -> Result<u64> {
    if vm.is_arm() {
        arm::get_fault_data_mask(vm, vcpu)
    } else {
        x86::get_fault_data_mask(vm, vcpu)
    }
}

/// Complete the current fault stage and resume the guest past it.
pub fn advance_fault(vm: &mut Vm, vcpu: usize) -> Result<()> {
    if vm.is_arm() {
        arm::advance_fault(vm, vcpu)
    } else {
        x86::advance_fault(vm, vcpu)
    }
}
