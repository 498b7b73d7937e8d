//! IO-instruction exit handling.
//!
//! The exit qualification carries port, size and direction. Claimed
//! ranges come from the VM's ioport registry; unclaimed ports fall
//! through to the registered catch-all, and failing that reads return
//! all-ones so probing drivers see an empty bus.

use crate::ioports::IoFault;
use crate::memory::FaultResult;
use crate::vm::{Result, Vm, VmError};

use super::lapic::x86_vcpu_mut;
use super::state::ctx;
use super::{advance_fault, x86_vcpu};

fn size_mask(size: usize) -> u32 {
    if size >= 4 {
        u32::MAX
    } else {
        (1u32 << (size * 8)) - 1
    }
}

fn set_io_in_value(vm: &mut Vm, vcpu: usize, value: u32, size: usize) -> Result<()> {
    let state = &mut x86_vcpu_mut(vm, vcpu)?.state;
    let eax = if size < 4 {
        let old = state.context_reg(ctx::EAX)? as u32;
        (old & !size_mask(size)) | (value & size_mask(size))
    } else {
        value
    };
    state.set_context_reg(ctx::EAX, eax as u64)
}

fn set_io_in_unhandled(vm: &mut Vm, vcpu: usize, size: usize) -> Result<()> {
    set_io_in_value(vm, vcpu, u32::MAX, size)
}

pub(crate) fn handle_io_instruction(vm: &mut Vm, vcpu: usize) -> Result<FaultResult> {
    let qualification = x86_vcpu(vm, vcpu)?
        .state
        .exit
        .ok_or(VmError::GuestInvalidOperation("no exit in flight"))?
        .qualification;

    let string = qualification & 16 != 0;
    let is_in = qualification & 8 != 0;
    let rep = qualification & 0x20 != 0;
    let port = (qualification >> 16) as u16;
    let size = ((qualification & 7) + 1) as usize;

    if string || rep {
        log::error!("string/rep IO instructions are not supported (port {port:#x})");
        return Ok(FaultResult::Error);
    }

    let mut value = if is_in {
        0
    } else {
        x86_vcpu(vm, vcpu)?.state.context_reg(ctx::EAX)? as u32 & size_mask(size)
    };

    let handler = {
        let x86 = vm.arch.as_x86().ok_or(VmError::WrongArch)?;
        x86.ioports.find(port)
    };

    let res = match handler {
        Some(handler) => {
            let mut locked = handler
                .lock()
                .map_err(|_| VmError::LockPoisoned("ioport handler"))?;
            if is_in {
                let (res, read) = locked.port_in(vm, vcpu, port, size);
                value = read;
                res
            } else {
                locked.port_out(vm, vcpu, port, size, value)
            }
        }
        None => {
            let callback = {
                let x86 = vm.arch.as_x86_mut().ok_or(VmError::WrongArch)?;
                x86.unhandled_ioport.take()
            };
            match callback {
                Some(mut callback) => {
                    let res = callback(vm, vcpu, port, is_in, &mut value, size);
                    let x86 = vm.arch.as_x86_mut().ok_or(VmError::WrongArch)?;
                    x86.unhandled_ioport = Some(callback);
                    res
                }
                None => {
                    log::warn!("ignoring unsupported ioport {port:#x}");
                    if is_in {
                        set_io_in_unhandled(vm, vcpu, size)?;
                    }
                    advance_fault(vm, vcpu)?;
                    return Ok(FaultResult::Handled);
                }
            }
        }
    };

    if is_in {
        if res == IoFault::Unhandled {
            set_io_in_unhandled(vm, vcpu, size)?;
        } else {
            set_io_in_value(vm, vcpu, value, size)?;
        }
    }

    if res == IoFault::Error {
        log::error!("IO exit error: in {is_in} port {port:#x} size {size}");
        return Ok(FaultResult::Error);
    }

    advance_fault(vm, vcpu)?;
    Ok(FaultResult::Handled)
}
