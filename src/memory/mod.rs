//! Guest-physical address-space management.
//!
//! The VM's view of physical memory is a set of *reservations*: intervals
//! of the guest-physical address space that are either backed by mapped
//! frames or trapped and emulated through a fault callback. Reservations
//! live in an arena owned by the VM and are addressed by [`ReservationId`];
//! interval lookup goes through an ordered map keyed by start address, so
//! overlapping inserts are rejected up front.
//!
//! Two flavors exist:
//!
//! - **Regular** reservations claim an exact interval
//!   ([`MemoryManager::reserve_at`]).
//! - **Anonymous** sub-slots are carved out of a previously declared anon
//!   region ([`MemoryManager::make_anon`] + [`MemoryManager::reserve_anon`])
//!   with a strictly-forward allocation cursor, used for back-to-back
//!   packable allocations such as framebuffers and device BARs.
//!
//! Mapping is either immediate or deferred to the first fault: a *map
//! iterator* supplies one frame per page-aligned guest address until it
//! returns `None`.
//!
//! RAM proper (registration, coalescing, the touch path) lives in
//! [`ram`].

pub mod dma;
pub mod ram;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::kernel::{Cap, Frame, KernelError, KernelOps, MapRights};
use crate::vm::Vm;

pub use ram::RamRegion;

/// Guest page geometry.
pub const PAGE_BITS: u8 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;

/// Align `addr` down to a page boundary.
pub fn page_align(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Round `value` up to a multiple of `align` (power of two).
pub fn round_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Handle to a reservation in the VM's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationId(usize);

/// Outcome of a memory-fault callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResult {
    /// The fault was handled, advance execution.
    Handled,
    /// Nobody claimed the fault.
    Unhandled,
    /// Re-execute the faulting access (e.g. after a deferred map).
    Restart,
    /// Ignore the fault, advance execution.
    Ignore,
    /// Handling the fault failed.
    Error,
}

/// A frame to place at a guest-physical address, produced by a map
/// iterator.
#[derive(Debug, Clone, Copy)]
pub struct GuestFrame {
    pub frame: Frame,
    pub rights: MapRights,
    /// Guest-physical address the frame belongs at.
    pub gpa: u64,
}

/// Per-reservation fault callback. Runs on the faulting vCPU's thread
/// with the whole VM borrowed, so it may touch any runtime state.
pub type MemoryFaultCallback =
    Box<dyn FnMut(&mut Vm, usize, u64, usize) -> FaultResult + Send>;

/// Frame supplier for mapping a reservation; `None` ends the walk.
pub type MapIterator = Box<dyn FnMut(u64) -> Option<GuestFrame> + Send>;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("reservation [{addr:#x}..{:#x}) overlaps an existing reservation", addr + size)]
    ReservationOverlap { addr: u64, size: u64 },

    #[error("no reservation with that handle")]
    ReservationNotFound,

    #[error("no anonymous region can fit {size:#x} bytes (align {align:#x})")]
    AnonExhausted { size: u64, align: u64 },

    #[error("anonymous sub-reservations cannot be freed")]
    AnonSlotNotFreeable,

    #[error("address {addr:#x} is not inside a registered RAM region")]
    NotRamRegion { addr: u64 },

    #[error("no frame mapped at guest address {addr:#x}")]
    UnmappedAddress { addr: u64 },

    #[error("zero-sized region")]
    EmptyRegion,

    #[error(transparent)]
    Kernel(#[from] KernelError),
}

type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReservationKind {
    Regular,
    /// Sub-slot of the anon region with the given arena index.
    AnonSlot(usize),
}

/// One reserved interval of guest-physical memory.
pub struct Reservation {
    addr: u64,
    size: u64,
    kind: ReservationKind,
    /// Taken out while the callback runs so it can borrow the VM.
    fault_callback: Option<MemoryFaultCallback>,
    /// Pending iterator for deferred mapping.
    map_iterator: Option<MapIterator>,
    is_mapped: bool,
    /// Frames mapped under this reservation, sorted by base address.
    frames: Vec<(u64, Frame)>,
}

impl Reservation {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_mapped(&self) -> bool {
        self.is_mapped
    }

    fn contains(&self, addr: u64, size: u64) -> bool {
        self.addr <= addr && addr + size as u64 <= self.addr + self.size
    }

    /// Frame covering `addr`, with its base guest address.
    fn frame_at(&self, addr: u64) -> Option<(u64, Frame)> {
        let idx = self
            .frames
            .partition_point(|(base, _)| *base <= addr)
            .checked_sub(1)?;
        let (base, frame) = self.frames[idx];
        (addr < base + frame.size()).then_some((base, frame))
    }
}

struct AnonRegion {
    addr: u64,
    size: u64,
    /// Next allocatable address; only ever moves forward.
    cursor: u64,
    slots: Vec<ReservationId>,
}

/// What a tree node points at: a regular reservation or an anon region
/// that resolves to a sub-slot at fault time.
#[derive(Debug, Clone, Copy)]
enum NodeKind {
    Regular(ReservationId),
    AnonRegion(usize),
}

struct TreeNode {
    size: u64,
    kind: NodeKind,
}

/// Per-VM guest-memory state: the reservation arena, the interval index
/// and the RAM manager.
pub struct MemoryManager {
    nodes: BTreeMap<u64, TreeNode>,
    reservations: Vec<Option<Reservation>>,
    anon_regions: Vec<AnonRegion>,
    pub ram: ram::RamManager,
}

impl MemoryManager {
    pub fn new() -> Self {
        MemoryManager {
            nodes: BTreeMap::new(),
            reservations: Vec::new(),
            anon_regions: Vec::new(),
            ram: ram::RamManager::new(),
        }
    }

    /// True when [addr, addr+size) overlaps any indexed interval.
    fn overlaps(&self, addr: u64, size: u64) -> bool {
        // The predecessor may reach into the interval; anything starting
        // inside it certainly overlaps.
        if let Some((start, node)) = self.nodes.range(..=addr).next_back() {
            if start + node.size > addr {
                return true;
            }
        }
        self.nodes.range(addr..addr + size).next().is_some()
    }

    /// Node covering `addr`, if any.
    fn node_at(&self, addr: u64) -> Option<NodeKind> {
        let (start, node) = self.nodes.range(..=addr).next_back()?;
        (addr < start + node.size).then_some(node.kind)
    }

    fn push_reservation(&mut self, res: Reservation) -> ReservationId {
        // Reuse a free arena slot if one exists.
        if let Some(idx) = self.reservations.iter().position(Option::is_none) {
            self.reservations[idx] = Some(res);
            ReservationId(idx)
        } else {
            self.reservations.push(Some(res));
            ReservationId(self.reservations.len() - 1)
        }
    }

    /// Reserve [addr, addr+size) with a fault callback. Rejects overlap.
    pub fn reserve_at(
        &mut self,
        addr: u64,
        size: u64,
        fault_callback: MemoryFaultCallback,
    ) -> Result<ReservationId> {
        if size == 0 {
            return Err(MemoryError::EmptyRegion);
        }
        if self.overlaps(addr, size) {
            return Err(MemoryError::ReservationOverlap { addr, size });
        }
        let id = self.push_reservation(Reservation {
            addr,
            size,
            kind: ReservationKind::Regular,
            fault_callback: Some(fault_callback),
            map_iterator: None,
            is_mapped: false,
            frames: Vec::new(),
        });
        self.nodes.insert(
            addr,
            TreeNode {
                size,
                kind: NodeKind::Regular(id),
            },
        );
        Ok(id)
    }

    /// Turn [addr, addr+size) into an anonymous allocation pool.
    pub fn make_anon(&mut self, addr: u64, size: u64) -> Result<()> {
        if size == 0 {
            return Err(MemoryError::EmptyRegion);
        }
        if self.overlaps(addr, size) {
            return Err(MemoryError::ReservationOverlap { addr, size });
        }
        self.anon_regions.push(AnonRegion {
            addr,
            size,
            cursor: addr,
            slots: Vec::new(),
        });
        self.nodes.insert(
            addr,
            TreeNode {
                size,
                kind: NodeKind::AnonRegion(self.anon_regions.len() - 1),
            },
        );
        Ok(())
    }

    /// Carve an aligned sub-slot out of the first anon region with room.
    /// Returns the reservation and its chosen base address.
    pub fn reserve_anon(
        &mut self,
        size: u64,
        align: u64,
        fault_callback: MemoryFaultCallback,
    ) -> Result<(ReservationId, u64)> {
        if size == 0 {
            return Err(MemoryError::EmptyRegion);
        }
        let align = align.max(1);
        let padded = round_up(size, PAGE_SIZE);
        let region_idx = self
            .anon_regions
            .iter()
            .position(|r| {
                let base = round_up(r.cursor, align);
                base >= r.cursor
                    && base + padded <= r.addr + r.size
            })
            .ok_or(MemoryError::AnonExhausted { size, align })?;

        let region = &mut self.anon_regions[region_idx];
        let base = round_up(region.cursor, align);
        region.cursor = base + padded;

        let id = self.push_reservation(Reservation {
            addr: base,
            size,
            kind: ReservationKind::AnonSlot(region_idx),
            fault_callback: Some(fault_callback),
            map_iterator: None,
            is_mapped: false,
            frames: Vec::new(),
        });
        self.anon_regions[region_idx].slots.push(id);
        Ok((id, base))
    }

    pub fn reservation(&self, id: ReservationId) -> Result<&Reservation> {
        self.reservations
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(MemoryError::ReservationNotFound)
    }

    fn reservation_mut(&mut self, id: ReservationId) -> Result<&mut Reservation> {
        self.reservations
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(MemoryError::ReservationNotFound)
    }

    /// Walk `iterator` over the reservation, installing each frame it
    /// yields. A `None` before the end leaves the remainder unmapped, the
    /// way a short iterator would on the fault path.
    fn run_map_iterator(
        &mut self,
        kernel: &dyn KernelOps,
        vspace: Cap,
        id: ReservationId,
        mut iterator: MapIterator,
    ) -> Result<()> {
        let (addr, size) = {
            let res = self.reservation(id)?;
            (res.addr, res.size)
        };
        let mut current = addr;
        let mut mapped = Vec::new();
        while current < addr + size {
            let Some(gf) = iterator(current) else {
                log::error!("no frame supplied for guest address {current:#x}");
                break;
            };
            kernel.map_frame(vspace, &gf.frame, gf.gpa, gf.rights)?;
            mapped.push((gf.gpa, gf.frame));
            current += gf.frame.size();
        }
        let res = self.reservation_mut(id)?;
        mapped.sort_by_key(|(base, _)| *base);
        res.frames = mapped;
        res.map_iterator = None;
        res.is_mapped = true;
        Ok(())
    }

    /// Map a reservation right away with frames from `iterator`.
    pub fn map_reservation(
        &mut self,
        kernel: &dyn KernelOps,
        vspace: Cap,
        id: ReservationId,
        iterator: MapIterator,
    ) -> Result<()> {
        self.reservation(id)?;
        self.run_map_iterator(kernel, vspace, id, iterator)
    }

    /// Record `iterator` for mapping at first fault instead of now.
    pub fn map_reservation_deferred(
        &mut self,
        id: ReservationId,
        iterator: MapIterator,
    ) -> Result<()> {
        let res = self.reservation_mut(id)?;
        res.map_iterator = Some(iterator);
        Ok(())
    }

    /// Unmap a reservation's frames and drop it from the arena.
    pub fn free_reservation(
        &mut self,
        kernel: &dyn KernelOps,
        vspace: Cap,
        id: ReservationId,
    ) -> Result<()> {
        let slot = self
            .reservations
            .get_mut(id.0)
            .ok_or(MemoryError::ReservationNotFound)?;
        let res = match slot.take() {
            None => return Err(MemoryError::ReservationNotFound),
            Some(res) if matches!(res.kind, ReservationKind::AnonSlot(_)) => {
                *slot = Some(res);
                return Err(MemoryError::AnonSlotNotFreeable);
            }
            Some(res) => res,
        };
        for (gpa, frame) in &res.frames {
            kernel.unmap_frame(vspace, frame, *gpa)?;
        }
        self.nodes.remove(&res.addr);
        Ok(())
    }

    /// Reservation covering `addr` for `size` bytes, resolving anon
    /// regions to their sub-slot.
    pub(crate) fn lookup(&self, addr: u64, size: u64) -> Option<ReservationId> {
        match self.node_at(addr)? {
            NodeKind::Regular(id) => Some(id),
            NodeKind::AnonRegion(region) => self.anon_regions[region]
                .slots
                .iter()
                .copied()
                .find(|id| {
                    self.reservation(*id)
                        .map(|r| r.contains(addr, size))
                        .unwrap_or(false)
                }),
        }
    }

    /// Reservations in address order (live ones only).
    pub fn iter_reservations(&self) -> impl Iterator<Item = &Reservation> + '_ {
        self.nodes.values().flat_map(move |node| {
            let ids: Vec<ReservationId> = match node.kind {
                NodeKind::Regular(id) => vec![id],
                NodeKind::AnonRegion(region) => self.anon_regions[region].slots.clone(),
            };
            ids.into_iter()
                .filter_map(|id| self.reservations.get(id.0).and_then(Option::as_ref))
        })
    }

    /// Frame covering `addr` under any mapped reservation.
    pub(crate) fn frame_covering(&self, addr: u64) -> Option<(u64, Frame)> {
        let id = self.lookup(addr, 1)?;
        self.reservation(id).ok()?.frame_at(addr)
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Route a guest memory fault to the covering reservation.
///
/// Runs on the faulting vCPU's thread. The callback is temporarily moved
/// out of the reservation so it can borrow the whole VM.
pub(crate) fn handle_guest_fault(vm: &mut Vm, vcpu: usize, addr: u64, size: usize) -> FaultResult {
    let Some(id) = vm.mem.lookup(addr, size as u64) else {
        log::warn!("no reservation for addr {addr:#x}, memory fault left unhandled");
        return FaultResult::Unhandled;
    };

    let (mapped, has_iterator, contained) = match vm.mem.reservation(id) {
        Ok(res) => (
            res.is_mapped,
            res.map_iterator.is_some(),
            res.contains(addr, size as u64),
        ),
        Err(_) => return FaultResult::Unhandled,
    };

    if !contained {
        log::error!("fault [{addr:#x}+{size:#x}] straddles its reservation");
        return FaultResult::Error;
    }

    if !mapped && has_iterator {
        // Deferred mapping: install the frames now and retry the access.
        let Some(iterator) = vm
            .mem
            .reservation_mut(id)
            .ok()
            .and_then(|res| res.map_iterator.take())
        else {
            return FaultResult::Unhandled;
        };
        let kernel = vm.kernel.clone();
        let vspace = vm.vspace;
        if let Err(err) = vm.mem.run_map_iterator(kernel.as_ref(), vspace, id, iterator) {
            log::error!("deferred map failed: {err}");
            return FaultResult::Error;
        }
        return FaultResult::Restart;
    }

    let Some(mut callback) = vm
        .mem
        .reservation_mut(id)
        .ok()
        .and_then(|res| res.fault_callback.take())
    else {
        return FaultResult::Error;
    };
    let result = callback(vm, vcpu, addr, size);
    // The callback may have freed its own reservation; only put the
    // handler back if the slot is still live.
    if let Ok(res) = vm.mem.reservation_mut(id) {
        res.fault_callback = Some(callback);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mock::MockKernel;
    use std::sync::Arc;

    fn nop_callback() -> MemoryFaultCallback {
        Box::new(|_, _, _, _| FaultResult::Handled)
    }

    #[test]
    fn test_reserve_rejects_overlap() {
        let mut mem = MemoryManager::new();
        mem.reserve_at(0x1000, 0x2000, nop_callback()).unwrap();
        // Identical, straddling-left, straddling-right, contained.
        for (addr, size) in [
            (0x1000, 0x2000),
            (0x0800, 0x1000),
            (0x2800, 0x1000),
            (0x1800, 0x100),
        ] {
            assert!(matches!(
                mem.reserve_at(addr, size, nop_callback()),
                Err(MemoryError::ReservationOverlap { .. })
            ));
        }
        // Exactly adjacent is fine.
        mem.reserve_at(0x3000, 0x1000, nop_callback()).unwrap();
        mem.reserve_at(0x0, 0x1000, nop_callback()).unwrap();
    }

    #[test]
    fn test_reservations_never_overlap_invariant() {
        let mut mem = MemoryManager::new();
        mem.reserve_at(0x4000, 0x1000, nop_callback()).unwrap();
        mem.reserve_at(0x1000, 0x1000, nop_callback()).unwrap();
        mem.reserve_at(0x8000, 0x4000, nop_callback()).unwrap();
        let regions: Vec<(u64, u64)> = mem
            .iter_reservations()
            .map(|r| (r.addr(), r.addr() + r.size()))
            .collect();
        for (i, a) in regions.iter().enumerate() {
            for b in regions.iter().skip(i + 1) {
                assert!(a.1 <= b.0 || b.1 <= a.0, "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn test_anon_carving_moves_forward() {
        let mut mem = MemoryManager::new();
        mem.make_anon(0x10_0000, 0x10000).unwrap();
        let (_, a) = mem.reserve_anon(0x800, 0x1000, nop_callback()).unwrap();
        let (_, b) = mem.reserve_anon(0x2000, 0x1000, nop_callback()).unwrap();
        assert_eq!(a, 0x10_0000);
        // 0x800 is padded to a whole page before the cursor advances.
        assert_eq!(b, 0x10_1000);
        // Alignment applies to the carved base.
        let (_, c) = mem.reserve_anon(0x1000, 0x4000, nop_callback()).unwrap();
        assert_eq!(c % 0x4000, 0);
        assert!(c >= b + 0x2000);
    }

    #[test]
    fn test_anon_exhaustion() {
        let mut mem = MemoryManager::new();
        mem.make_anon(0x10_0000, 0x2000).unwrap();
        mem.reserve_anon(0x2000, 1, nop_callback()).unwrap();
        assert!(matches!(
            mem.reserve_anon(0x1000, 1, nop_callback()),
            Err(MemoryError::AnonExhausted { .. })
        ));
    }

    #[test]
    fn test_anon_slot_cannot_be_freed() {
        let kernel = Arc::new(MockKernel::new());
        let mut mem = MemoryManager::new();
        mem.make_anon(0x10_0000, 0x10000).unwrap();
        let (id, _) = mem.reserve_anon(0x1000, 1, nop_callback()).unwrap();
        assert!(matches!(
            mem.free_reservation(kernel.as_ref(), Cap(1), id),
            Err(MemoryError::AnonSlotNotFreeable)
        ));
    }

    #[test]
    fn test_map_and_free_unmaps_frames() {
        let kernel = Arc::new(MockKernel::new());
        let vspace = kernel.create_vspace().unwrap();
        let mut mem = MemoryManager::new();
        let id = mem.reserve_at(0x2000, 0x2000, nop_callback()).unwrap();

        let k = kernel.clone();
        mem.map_reservation(
            kernel.as_ref(),
            vspace,
            id,
            Box::new(move |addr| {
                let frame = k.alloc_frame(PAGE_BITS).ok()?;
                Some(GuestFrame {
                    frame,
                    rights: MapRights::READ_WRITE,
                    gpa: page_align(addr),
                })
            }),
        )
        .unwrap();
        assert_eq!(kernel.mappings().len(), 2);
        assert!(mem.reservation(id).unwrap().is_mapped());

        mem.free_reservation(kernel.as_ref(), vspace, id).unwrap();
        assert!(kernel.mappings().is_empty());
        assert!(mem.lookup(0x2000, 1).is_none());
    }

    #[test]
    fn test_lookup_resolves_anon_slot() {
        let mut mem = MemoryManager::new();
        mem.make_anon(0x10_0000, 0x10000).unwrap();
        let (id, base) = mem.reserve_anon(0x1000, 0x1000, nop_callback()).unwrap();
        assert_eq!(mem.lookup(base + 0x10, 4), Some(id));
        // Past the slot but inside the region: nothing resolves.
        assert_eq!(mem.lookup(base + 0x3000, 4), None);
    }
}
