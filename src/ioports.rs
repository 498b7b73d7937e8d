//! I/O-port registry.
//!
//! Handlers claim inclusive, non-overlapping port ranges and are shared
//! `Arc<Mutex<…>>` objects so a device model (virtio transport, PCI
//! config ports) can also be driven by the embedder. On x86 the list
//! backs the IO-instruction exit directly; on ARM the PCI IO region
//! mirrors port accesses into the same registry.

use std::sync::{Arc, Mutex};

use crate::vm::{Result, Vm, VmError};

/// Verdict from an ioport handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoFault {
    Handled,
    Unhandled,
    Error,
}

/// A device model behind a port range.
pub trait IoPortHandler: Send {
    /// IN: return the value read from `port`.
    fn port_in(&mut self, vm: &mut Vm, vcpu: usize, port: u16, size: usize) -> (IoFault, u32);
    /// OUT: consume the value the guest wrote.
    fn port_out(&mut self, vm: &mut Vm, vcpu: usize, port: u16, size: usize, value: u32)
        -> IoFault;
}

/// Catch-all for ports no handler claims: `(vm, vcpu, port, is_in,
/// value, size)`; for IN the callback fills `value`.
pub type UnhandledIoPortCallback =
    Box<dyn FnMut(&mut Vm, usize, u16, bool, &mut u32, usize) -> IoFault + Send>;

struct IoPortEntry {
    start: u16,
    end: u16,
    handler: Arc<Mutex<dyn IoPortHandler>>,
}

/// Sorted, non-overlapping ioport ranges.
pub struct IoPortList {
    entries: Vec<IoPortEntry>,
}

impl IoPortList {
    pub fn new() -> IoPortList {
        IoPortList {
            entries: Vec::new(),
        }
    }

    pub fn add(
        &mut self,
        start: u16,
        end: u16,
        handler: Arc<Mutex<dyn IoPortHandler>>,
    ) -> Result<()> {
        if self
            .entries
            .iter()
            .any(|e| e.end >= start && e.start <= end)
        {
            log::error!("ioport range {start:#x}-{end:#x} overlaps an existing registration");
            return Err(VmError::GuestInvalidOperation("overlapping ioport range"));
        }
        self.entries.push(IoPortEntry {
            start,
            end,
            handler,
        });
        self.entries.sort_by_key(|e| e.start);
        Ok(())
    }

    pub fn find(&self, port: u16) -> Option<Arc<Mutex<dyn IoPortHandler>>> {
        let idx = self
            .entries
            .binary_search_by(|e| {
                if port < e.start {
                    std::cmp::Ordering::Greater
                } else if port > e.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .ok()?;
        Some(self.entries[idx].handler.clone())
    }

    /// Route one access; unclaimed reads come back as all-ones.
    pub fn emulate(
        &self,
        vm: &mut Vm,
        vcpu: usize,
        port: u16,
        is_in: bool,
        size: usize,
        value: &mut u32,
    ) -> IoFault {
        let Some(handler) = self.find(port) else {
            if is_in {
                *value = u32::MAX;
            }
            return IoFault::Unhandled;
        };
        let Ok(mut locked) = handler.lock() else {
            log::error!("ioport handler lock poisoned (port {port:#x})");
            return IoFault::Error;
        };
        if is_in {
            let (res, read) = locked.port_in(vm, vcpu, port, size);
            *value = read;
            res
        } else {
            locked.port_out(vm, vcpu, port, size, *value)
        }
    }
}

impl Default for IoPortList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub;
    impl IoPortHandler for Stub {
        fn port_in(&mut self, _: &mut Vm, _: usize, port: u16, _: usize) -> (IoFault, u32) {
            (IoFault::Handled, port as u32)
        }
        fn port_out(&mut self, _: &mut Vm, _: usize, _: u16, _: usize, _: u32) -> IoFault {
            IoFault::Handled
        }
    }

    #[test]
    fn test_overlap_rejected() {
        let mut list = IoPortList::new();
        list.add(0x100, 0x10f, Arc::new(Mutex::new(Stub))).unwrap();
        assert!(list.add(0x10f, 0x120, Arc::new(Mutex::new(Stub))).is_err());
        assert!(list.add(0x0f0, 0x100, Arc::new(Mutex::new(Stub))).is_err());
        list.add(0x110, 0x120, Arc::new(Mutex::new(Stub))).unwrap();
    }

    #[test]
    fn test_find_by_range() {
        let mut list = IoPortList::new();
        list.add(0x3f8, 0x3ff, Arc::new(Mutex::new(Stub))).unwrap();
        list.add(0x100, 0x1ff, Arc::new(Mutex::new(Stub))).unwrap();
        assert!(list.find(0x3fa).is_some());
        assert!(list.find(0x150).is_some());
        assert!(list.find(0x200).is_none());
    }
}
