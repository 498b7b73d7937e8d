//! Guest RAM registration, coalescing and the touch path.
//!
//! RAM is declared as intervals of the guest-physical space. The manager
//! keeps them as a sorted vector and always coalesces adjacent regions
//! with the same `allocated` flag, so the e820 builder and the device-tree
//! generator can walk a canonical view.
//!
//! [`MemoryManager::ram_touch`] is the one way the host reads or writes
//! guest RAM: the access is split on page boundaries and each page's
//! backing frame is exposed through the kernel's touch window. Image
//! loading, boot-structure writes and vring I/O all go through it.

use std::sync::Arc;

use crate::kernel::{Cap, KernelOps, MapRights};

use super::{
    page_align, round_up, FaultResult, GuestFrame, MemoryError, MemoryManager, ReservationId,
    Result, PAGE_BITS, PAGE_SIZE,
};

/// One coalesced interval of guest RAM.
///
/// `allocated` records that the interval is backed by mapped frames;
/// registration at a fixed address backs the frames immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamRegion {
    pub start: u64,
    pub size: u64,
    pub allocated: bool,
}

impl RamRegion {
    fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Sorted, coalesced guest-RAM bookkeeping.
pub struct RamManager {
    regions: Vec<RamRegion>,
    /// Intervals handed out by the placement allocator, sorted.
    claims: Vec<(u64, u64)>,
}

impl RamManager {
    pub fn new() -> Self {
        RamManager {
            regions: Vec::new(),
            claims: Vec::new(),
        }
    }

    pub fn regions(&self) -> &[RamRegion] {
        &self.regions
    }

    pub fn contains(&self, addr: u64, size: u64) -> bool {
        self.regions
            .iter()
            .any(|r| r.start <= addr && addr + size <= r.end())
    }

    /// Insert a region, then restore the sorted + coalesced invariant.
    pub(crate) fn expand(&mut self, start: u64, size: u64, allocated: bool) {
        if size == 0 {
            return;
        }
        self.regions.push(RamRegion {
            start,
            size,
            allocated,
        });
        self.regions.sort_by_key(|r| r.start);
        self.collapse();
    }

    fn collapse(&mut self) {
        let mut i = 1;
        while i < self.regions.len() {
            if self.regions[i - 1].allocated == self.regions[i].allocated
                && self.regions[i - 1].end() == self.regions[i].start
            {
                self.regions[i - 1].size += self.regions[i].size;
                self.regions.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Free intervals: registered RAM minus placement claims.
    fn free_intervals(&self) -> Vec<(u64, u64)> {
        let mut free = Vec::new();
        for region in &self.regions {
            let mut cursor = region.start;
            for &(start, end) in &self.claims {
                if end <= cursor || start >= region.end() {
                    continue;
                }
                if start > cursor {
                    free.push((cursor, start));
                }
                cursor = cursor.max(end);
            }
            if cursor < region.end() {
                free.push((cursor, region.end()));
            }
        }
        free
    }

    fn claim(&mut self, start: u64, end: u64) {
        self.claims.push((start, end));
        self.claims.sort_by_key(|&(s, _)| s);
        // Merge touching claims.
        let mut i = 1;
        while i < self.claims.len() {
            if self.claims[i - 1].1 >= self.claims[i].0 {
                self.claims[i - 1].1 = self.claims[i - 1].1.max(self.claims[i].1);
                self.claims.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Record that [start, start+size) is in use for placement purposes.
    pub fn mark_allocated(&mut self, start: u64, size: u64) {
        if size == 0 {
            return;
        }
        self.claim(start, start + size);
    }

    /// First-fit placement allocation out of registered RAM.
    pub fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        let align = align.max(1);
        let candidate = self.free_intervals().into_iter().find_map(|(start, end)| {
            let base = round_up(start, align);
            (base < end && end - base >= size).then_some(base)
        })?;
        self.claim(candidate, candidate + size);
        Some(candidate)
    }

    /// Largest interval not yet claimed by the placement allocator.
    pub fn largest_free_region(&self) -> Option<(u64, u64)> {
        self.free_intervals()
            .into_iter()
            .max_by_key(|(start, end)| end - start)
            .map(|(start, end)| (start, end - start))
    }

    /// Release a placement claim so the interval can be handed out
    /// again.
    pub fn free(&mut self, start: u64, size: u64) {
        if size == 0 {
            return;
        }
        let end = start + size;
        let mut next = Vec::with_capacity(self.claims.len() + 1);
        for &(cs, ce) in &self.claims {
            if ce <= start || cs >= end {
                next.push((cs, ce));
                continue;
            }
            if cs < start {
                next.push((cs, start));
            }
            if ce > end {
                next.push((end, ce));
            }
        }
        self.claims = next;
    }
}

impl Default for RamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager {
    /// Register [start, start+size) as guest RAM: reserve the interval,
    /// back it with freshly allocated frames (untyped-at-paddr frames when
    /// `untyped`), and fold it into the coalesced region vector.
    ///
    /// RAM is always mapped, so the default fault callback treats any RAM
    /// fault as fatal.
    pub fn ram_register_at(
        &mut self,
        kernel: &Arc<dyn KernelOps>,
        vspace: Cap,
        start: u64,
        size: u64,
        untyped: bool,
    ) -> Result<ReservationId> {
        let id = self.reserve_at(
            start,
            size,
            Box::new(|_, _, addr, _| {
                log::error!("unhandled RAM fault at {addr:#x}");
                FaultResult::Error
            }),
        )?;

        let iterator = ram_alloc_iterator(kernel.clone(), untyped);
        if let Err(err) = self.map_reservation(kernel.as_ref(), vspace, id, iterator) {
            // Roll the reservation back so a caller can retry elsewhere.
            let _ = self.free_reservation(kernel.as_ref(), vspace, id);
            return Err(err);
        }
        self.ram.expand(start, size, true);
        Ok(id)
    }

    /// Read or write guest RAM. The access is split on 4 KiB boundaries;
    /// for each piece `f(gpa, offset, bytes)` sees the backing frame's
    /// bytes for exactly that piece.
    pub fn ram_touch(
        &self,
        kernel: &dyn KernelOps,
        addr: u64,
        size: u64,
        mut f: impl FnMut(u64, usize, &mut [u8]) -> Result<()>,
    ) -> Result<()> {
        if !self.ram.contains(addr, size) {
            return Err(MemoryError::NotRamRegion { addr });
        }
        let end = addr + size;
        let mut current = addr;
        while current < end {
            let next = end.min(page_align(current) + PAGE_SIZE);
            let (frame_base, frame) = self
                .frame_covering(current)
                .ok_or(MemoryError::UnmappedAddress { addr: current })?;
            let in_frame = (current - frame_base) as usize;
            let len = (next - current) as usize;
            let offset = (current - addr) as usize;
            let gpa = current;
            let mut cb_result = Ok(());
            kernel.frame_data(&frame, &mut |bytes| {
                cb_result = f(gpa, offset, &mut bytes[in_frame..in_frame + len]);
            })?;
            cb_result?;
            current = next;
        }
        Ok(())
    }

    /// Copy bytes out of guest RAM.
    pub fn ram_read(&self, kernel: &dyn KernelOps, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.ram_touch(kernel, addr, buf.len() as u64, |_, offset, bytes| {
            buf[offset..offset + bytes.len()].copy_from_slice(bytes);
            Ok(())
        })
    }

    /// Copy bytes into guest RAM.
    pub fn ram_write(&self, kernel: &dyn KernelOps, addr: u64, buf: &[u8]) -> Result<()> {
        self.ram_touch(kernel, addr, buf.len() as u64, |_, offset, bytes| {
            bytes.copy_from_slice(&buf[offset..offset + bytes.len()]);
            Ok(())
        })
    }
}

/// Iterator producing one fresh 4 KiB frame per page. With `untyped` the
/// frames come from untyped memory at the exact physical address.
fn ram_alloc_iterator(kernel: Arc<dyn KernelOps>, untyped: bool) -> super::MapIterator {
    Box::new(move |addr| {
        let page = page_align(addr);
        let frame = if untyped {
            kernel.alloc_frame_at(page, PAGE_BITS)
        } else {
            kernel.alloc_frame(PAGE_BITS)
        };
        match frame {
            Ok(frame) => Some(GuestFrame {
                frame,
                rights: MapRights::READ_WRITE,
                gpa: page,
            }),
            Err(err) => {
                log::error!("failed to allocate frame for guest address {addr:#x}: {err}");
                None
            }
        }
    })
}
