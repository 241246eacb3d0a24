// Copyright 2025 The Trek Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Physical Memory Manager
//!
//! Owns every physical page in the system through a priority-ordered list
//! of arenas. Provides single, contiguous, aligned, and ranged page
//! allocation, reservation accounting for resource groups, page zeroing via
//! arena kernel aliases, and the page-backed memory object consumed by the
//! address-space manager.
//!
//! # Locking
//!
//! One mutex protects the arena list, per-arena free lists, and reservation
//! counters. A separate IRQ-safe spinlock guards the read-only
//! physical-to-kernel address table so `paddr_to_kvaddr` can be called from
//! interrupt-disabled contexts.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::{Lazy, Mutex};

use crate::trek::{Error, PAddr, Result, VAddr};

use crate::kernel::sync::IrqSpinlock;

use super::arena::Arena;
use super::obj::{ObjFlags, PmmVmObj};
use super::page::{PageFlags, PageList};
use super::res_group::ResGroup;
use super::{
    bytes_to_pages, is_paddr_page_aligned, is_page_aligned, page_align_up, PAGE_SIZE,
    PAGE_SIZE_SHIFT,
};

pub use super::arena::{ArenaFlags, ArenaInfo};

bitflags! {
    /// Page allocation request flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Request physically contiguous pages.
        const CONTIGUOUS = 1 << 0;
        /// Only allocate from arenas with a kernel alias.
        const KMAP = 1 << 1;
        /// Draw from the per-arena reservation pool.
        const FROM_RESERVED = 1 << 2;
        /// Caller will zero the pages itself.
        const NO_CLEAR = 1 << 3;
        /// Caller may install memory tags at map time.
        const ALLOW_TAGGED = 1 << 4;
    }
}

/// Entry in the IRQ-safe physical-to-kernel translation table.
struct KmapRange {
    base: PAddr,
    size: usize,
    kvaddr: VAddr,
}

pub(crate) struct PmmState {
    arenas: Vec<Arena>,
}

impl PmmState {
    pub(crate) fn arenas(&self) -> &[Arena] {
        &self.arenas
    }

    fn arena_of_mut(&mut self, pa: PAddr) -> Option<(&mut Arena, usize)> {
        for arena in &mut self.arenas {
            if let Some(index) = arena.frame_index(pa) {
                return Some((arena, index));
            }
        }
        None
    }
}

/// The physical page manager.
pub struct Pmm {
    state: Mutex<PmmState>,
    kmap: IrqSpinlock<Vec<KmapRange>>,
}

impl Pmm {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(PmmState { arenas: Vec::new() }),
            kmap: IrqSpinlock::new(Vec::new()),
        }
    }

    /// Register a contiguous physical range.
    pub fn add_arena(&self, info: ArenaInfo) -> Result<()> {
        self.add_arena_reserved(info, 0, 0)
    }

    /// Register an arena, reserving `reserve_at_start` and `reserve_at_end`
    /// bytes at its edges. The page-descriptor cost for the arena is charged
    /// to the leading reservation, so late-registered arenas can carry their
    /// own bookkeeping.
    pub fn add_arena_reserved(
        &self,
        info: ArenaInfo,
        reserve_at_start: usize,
        reserve_at_end: usize,
    ) -> Result<()> {
        log::trace!(
            "arena '{}' base {:#x} size {:#x} priority {}",
            info.name,
            info.base,
            info.size,
            info.priority
        );

        if !is_paddr_page_aligned(info.base) || !is_page_aligned(info.size) || info.size == 0 {
            return Err(Error::InvalidArgs);
        }
        if info.flags.contains(ArenaFlags::KMAP) && info.kvaddr.is_none() {
            return Err(Error::InvalidArgs);
        }

        let page_count = info.size / PAGE_SIZE;
        let mut start_bytes = reserve_at_start;
        if reserve_at_start != 0 || reserve_at_end != 0 {
            start_bytes += page_count * core::mem::size_of::<super::page::VmPage>();
        }
        match page_align_up(start_bytes).checked_add(page_align_up(reserve_at_end)) {
            Some(total) if total <= info.size => {}
            _ => return Err(Error::InvalidArgs),
        }
        let start_pages = bytes_to_pages(start_bytes);
        let end_pages = bytes_to_pages(reserve_at_end);
        if start_pages >= page_count {
            return Err(Error::InvalidArgs);
        }

        if let Some(kvaddr) = info.kvaddr {
            self.kmap.lock().push(KmapRange {
                base: info.base,
                size: info.size,
                kvaddr,
            });
        }

        let arena = Arena::new(info, start_pages, end_pages);
        let mut state = self.state.lock();
        let pos = state
            .arenas
            .iter()
            .position(|a| a.priority() > arena.priority())
            .unwrap_or(state.arenas.len());
        state.arenas.insert(pos, arena);
        Ok(())
    }

    /// Walk the arenas and either reserve `count` pages in aggregate or
    /// leave every counter untouched.
    pub fn reserve_pages(&self, count: usize) -> Result<()> {
        let mut state = self.state.lock();
        if Self::visit_available(&mut state, count, false) != 0 {
            return Err(Error::NoMemory);
        }
        let remaining = Self::visit_available(&mut state, count, true);
        debug_assert_eq!(remaining, 0);
        Ok(())
    }

    /// Return previously reserved pages to the general pool.
    pub fn unreserve_pages(&self, count: usize) {
        let mut state = self.state.lock();
        let mut remaining = count;
        for arena in &mut state.arenas {
            let put_back = remaining.min(arena.reserved_count());
            arena.unreserve(put_back);
            remaining -= put_back;
            if remaining == 0 {
                return;
            }
        }
        assert_eq!(remaining, 0, "unreserving more pages than are reserved");
    }

    /// Two-phase helper: returns how many of `count` pages could not be
    /// covered; commits the per-arena reservations when `commit` is set.
    fn visit_available(state: &mut PmmState, count: usize, commit: bool) -> usize {
        let mut remaining = count;
        for arena in &mut state.arenas {
            let take = remaining.min(arena.available());
            remaining -= take;
            if commit {
                arena.reserve(take);
            }
            if remaining == 0 {
                break;
            }
        }
        remaining
    }

    /// Allocate `count` pages onto `list`.
    pub fn alloc_pages(
        &self,
        count: usize,
        flags: AllocFlags,
        align_log2: u8,
        list: &mut PageList,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let mut state = self.state.lock();
        let mut pages = Self::alloc_pages_locked(&mut state, count, flags, align_log2)?;
        list.append(&mut pages);
        Ok(())
    }

    /// Allocate `count` pages wrapped in a memory object.
    pub fn alloc(
        self: &Arc<Self>,
        count: usize,
        flags: AllocFlags,
        align_log2: u8,
    ) -> Result<PmmVmObj> {
        self.alloc_from_res_group(None, count, flags, align_log2)
    }

    /// Allocate `count` pages wrapped in a memory object, charged against a
    /// resource group. A group implies `FROM_RESERVED` and vice versa.
    pub fn alloc_from_res_group(
        self: &Arc<Self>,
        res_group: Option<&Arc<ResGroup>>,
        count: usize,
        flags: AllocFlags,
        align_log2: u8,
    ) -> Result<PmmVmObj> {
        debug_assert!(count > 0);
        debug_assert!(res_group.is_some() == flags.contains(AllocFlags::FROM_RESERVED));

        if let Some(group) = res_group {
            group.take_mem(count)?;
        }

        let allocated = {
            let mut state = self.state.lock();
            Self::alloc_pages_locked(&mut state, count, flags, align_log2)
        };
        let page_list = match allocated {
            Ok(list) => list,
            Err(e) => {
                if let Some(group) = res_group {
                    group.release_mem(count);
                }
                return Err(e);
            }
        };

        // A contiguous run collapses to one large chunk so the mapper can
        // install it with a single (possibly large-page) MMU call.
        let (chunks, chunk_size): (Vec<PAddr>, usize) = if flags.contains(AllocFlags::CONTIGUOUS) {
            let base = page_list.first().ok_or(Error::NoMemory)?;
            (alloc::vec![base], count.checked_mul(PAGE_SIZE).ok_or(Error::InvalidArgs)?)
        } else {
            (page_list.iter().collect(), PAGE_SIZE)
        };

        let mut obj_flags = ObjFlags::empty();
        if flags.contains(AllocFlags::NO_CLEAR) {
            obj_flags |= ObjFlags::NEEDS_CLEAR;
        }
        if flags.contains(AllocFlags::ALLOW_TAGGED) {
            obj_flags |= ObjFlags::ALLOW_TAGGED;
        }

        Ok(PmmVmObj::new(
            Arc::clone(self),
            page_list,
            chunks,
            chunk_size,
            res_group.cloned(),
            obj_flags,
        ))
    }

    /// Allocate a physically contiguous, aligned run of `count` pages from a
    /// KMAP arena. Returns the base address; pages land on `list`.
    pub fn alloc_contiguous(
        &self,
        count: usize,
        align_log2: u8,
        list: &mut PageList,
    ) -> Result<PAddr> {
        if count == 0 {
            return Err(Error::InvalidArgs);
        }
        let align_log2 = align_log2.max(PAGE_SIZE_SHIFT);
        let mut state = self.state.lock();
        let mut pages = Self::alloc_pages_locked(
            &mut state,
            count,
            AllocFlags::KMAP | AllocFlags::CONTIGUOUS,
            align_log2,
        )?;
        let base = pages.first().ok_or(Error::NoMemory)?;
        list.append(&mut pages);
        Ok(base)
    }

    /// Try to allocate the specific physical pages starting at `address`.
    /// Returns the number of pages actually claimed; stops at the first
    /// collision with an allocated page.
    pub fn alloc_range(&self, address: PAddr, count: usize, list: &mut PageList) -> usize {
        if count == 0 {
            return 0;
        }
        let mut address = address & !(PAGE_SIZE as PAddr - 1);
        let mut allocated = 0;

        let mut state = self.state.lock();
        for ai in 0..state.arenas.len() {
            let arena = &mut state.arenas[ai];
            while allocated < count && arena.contains(address) {
                if arena.available() == 0 {
                    break;
                }
                let Some(index) = arena.frame_index(address) else {
                    break;
                };
                if !arena.page(index).is_free() {
                    break;
                }
                arena.unlink_frames(&[index]);
                arena.take_page(index, false);
                list.push(arena.paddr_of(index));
                allocated += 1;
                address += PAGE_SIZE as PAddr;
            }
            if allocated == count {
                break;
            }
        }
        allocated
    }

    /// Allocate a contiguous kernel-mapped run and return its kernel
    /// virtual address.
    pub fn alloc_kpages(&self, count: usize, list: &mut PageList) -> Result<VAddr> {
        let pa = self.alloc_contiguous(count, PAGE_SIZE_SHIFT, list)?;
        self.paddr_to_kvaddr(pa).ok_or(Error::NoMemory)
    }

    /// Free `count` pages previously returned by [`Pmm::alloc_kpages`].
    pub fn free_kpages(&self, va: VAddr, count: usize) -> usize {
        let mut list = PageList::new();
        for i in 0..count {
            if let Some(pa) = self.kvaddr_to_paddr(va + i * PAGE_SIZE) {
                list.push(pa);
            }
        }
        self.free(&mut list)
    }

    /// Return pages to their owning arenas. Restores reservation counters
    /// for pages drawn from the reserved pool. Returns the number freed.
    pub fn free(&self, list: &mut PageList) -> usize {
        let mut state = self.state.lock();
        Self::free_locked(&mut state, list)
    }

    /// Free a single page.
    pub fn free_page(&self, pa: PAddr) -> usize {
        let mut list = PageList::new();
        list.push(pa);
        self.free(&mut list)
    }

    /// IRQ-safe physical-to-kernel address translation over KMAP arenas.
    pub fn paddr_to_kvaddr(&self, pa: PAddr) -> Option<VAddr> {
        let table = self.kmap.lock();
        table
            .iter()
            .find(|r| pa >= r.base && pa <= r.base + (r.size as PAddr - 1))
            .map(|r| r.kvaddr + (pa - r.base) as usize)
    }

    /// Inverse of [`Pmm::paddr_to_kvaddr`].
    pub fn kvaddr_to_paddr(&self, va: VAddr) -> Option<PAddr> {
        let table = self.kmap.lock();
        table
            .iter()
            .find(|r| va >= r.kvaddr && va < r.kvaddr + r.size)
            .map(|r| r.base + (va - r.kvaddr) as PAddr)
    }

    /// Look up the state bits of the page holding `pa`.
    pub fn page_flags(&self, pa: PAddr) -> Option<PageFlags> {
        let mut state = self.state.lock();
        state.arena_of_mut(pa).map(|(arena, index)| arena.page(index).flags)
    }

    pub fn count_free_pages(&self) -> usize {
        self.state.lock().arenas.iter().map(|a| a.free_count()).sum()
    }

    pub fn count_reserved_pages(&self) -> usize {
        self.state
            .lock()
            .arenas
            .iter()
            .map(|a| a.reserved_count())
            .sum()
    }

    pub fn count_total_bytes(&self) -> usize {
        self.state.lock().arenas.iter().map(|a| a.size()).sum()
    }

    pub fn arena_count(&self) -> usize {
        self.state.lock().arenas.len()
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&PmmState) -> R) -> R {
        let state = self.state.lock();
        f(&state)
    }

    fn alloc_pages_locked(
        state: &mut PmmState,
        count: usize,
        flags: AllocFlags,
        align_log2: u8,
    ) -> Result<PageList> {
        debug_assert!(align_log2 == 0 || flags.contains(AllocFlags::CONTIGUOUS));

        let mut flags = flags;
        if flags.contains(AllocFlags::CONTIGUOUS) && count == 1 && align_log2 <= PAGE_SIZE_SHIFT {
            // The run search is slow; skip it when any page will do.
            flags.remove(AllocFlags::CONTIGUOUS);
        }
        let from_reserved = flags.contains(AllocFlags::FROM_RESERVED);

        let mut list = PageList::new();
        for arena in &mut state.arenas {
            if list.len() == count {
                break;
            }
            if flags.contains(AllocFlags::KMAP) && !arena.flags().contains(ArenaFlags::KMAP) {
                continue;
            }

            if flags.contains(AllocFlags::CONTIGUOUS) {
                // The whole run must come out of one arena, with the
                // reservation discipline holding for all of it.
                let enough = if from_reserved {
                    arena.reserved_count() >= count
                } else {
                    arena.available() >= count
                };
                if !enough {
                    continue;
                }
                let Some(start) = arena.find_free_run(count, align_log2) else {
                    continue;
                };
                arena.unlink_run(start, count);
                for i in 0..count {
                    if !flags.contains(AllocFlags::NO_CLEAR) {
                        Self::clear_page(arena, start + i);
                    }
                    arena.take_page(start + i, from_reserved);
                    list.push(arena.paddr_of(start + i));
                }
                break;
            }

            while list.len() < count {
                if from_reserved {
                    if arena.reserved_count() == 0 {
                        break;
                    }
                } else if arena.available() == 0 {
                    break;
                }
                let Some(index) = arena.pop_free() else {
                    break;
                };
                if !flags.contains(AllocFlags::NO_CLEAR) {
                    Self::clear_page(arena, index);
                }
                arena.take_page(index, from_reserved);
                list.push(arena.paddr_of(index));
            }
        }

        if list.len() != count {
            log::trace!("wanted {} pages, found {}", count, list.len());
            Self::free_locked(state, &mut list);
            return Err(Error::NoMemory);
        }
        Ok(list)
    }

    fn free_locked(state: &mut PmmState, list: &mut PageList) -> usize {
        let mut count = 0;
        for pa in list.take_all() {
            let Some((arena, index)) = state.arena_of_mut(pa) else {
                panic!("freed page {:#x} belongs to no arena", pa);
            };
            arena.release_page(index);
            count += 1;
        }
        count
    }

    /// Zero a freshly allocated frame through its arena's kernel alias.
    fn clear_page(arena: &Arena, index: usize) {
        if let Some(kva) = arena.kvaddr_of(index) {
            // The alias is private to the PMM until the page is handed out.
            unsafe { core::ptr::write_bytes(kva as *mut u8, 0, PAGE_SIZE) };
        } else {
            debug_assert!(false, "cannot clear a page in an arena with no kernel alias");
        }
    }
}

impl Default for Pmm {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Global instance
// ============================================================================

static PMM: Lazy<Arc<Pmm>> = Lazy::new(|| Arc::new(Pmm::new()));

/// The system-wide physical page manager.
pub fn kernel_pmm() -> &'static Arc<Pmm> {
    &PMM
}

/// Register an arena with the system PMM.
pub fn pmm_add_arena(info: ArenaInfo) -> Result<()> {
    kernel_pmm().add_arena(info)
}

/// Allocate pages from the system PMM as a memory object.
pub fn pmm_alloc(count: usize, flags: AllocFlags, align_log2: u8) -> Result<PmmVmObj> {
    kernel_pmm().alloc(count, flags, align_log2)
}

/// Free pages to the system PMM.
pub fn pmm_free(list: &mut PageList) -> usize {
    kernel_pmm().free(list)
}

/// IRQ-safe physical-to-kernel translation on the system PMM.
pub fn paddr_to_kvaddr(pa: PAddr) -> Option<VAddr> {
    kernel_pmm().paddr_to_kvaddr(pa)
}

#[cfg(test)]
mod tests {
    use super::super::testutil;
    use super::*;

    fn pmm_with_pages(base: PAddr, pages: usize) -> Arc<Pmm> {
        let pmm = Arc::new(Pmm::new());
        pmm.add_arena(testutil::host_arena("test", base, pages, 1))
            .unwrap();
        pmm
    }

    #[test]
    fn test_add_arena_validation() {
        let pmm = Pmm::new();
        assert_eq!(
            pmm.add_arena(ArenaInfo::new("bad", 0x10800, PAGE_SIZE, 0, ArenaFlags::empty())),
            Err(Error::InvalidArgs)
        );
        assert_eq!(
            pmm.add_arena(ArenaInfo::new("bad", 0x10000, 0, 0, ArenaFlags::empty())),
            Err(Error::InvalidArgs)
        );
        // KMAP arenas must carry an alias.
        assert_eq!(
            pmm.add_arena(ArenaInfo::new("bad", 0x10000, PAGE_SIZE, 0, ArenaFlags::KMAP)),
            Err(Error::InvalidArgs)
        );
    }

    #[test]
    fn test_arena_priority_order() {
        let pmm = Arc::new(Pmm::new());
        pmm.add_arena(testutil::host_arena("slow", 0x100000, 4, 10))
            .unwrap();
        pmm.add_arena(testutil::host_arena("fast", 0x200000, 4, 1))
            .unwrap();
        // Allocation drains the lower-priority-number arena first.
        let mut list = PageList::new();
        pmm.alloc_pages(1, AllocFlags::empty(), 0, &mut list).unwrap();
        let pa = list.first().unwrap();
        assert!(pa >= 0x200000 && pa < 0x204000);
        pmm.free(&mut list);
    }

    #[test]
    fn test_alloc_free_round_trip() {
        let pmm = pmm_with_pages(0x100000, 8);
        assert_eq!(pmm.count_free_pages(), 8);

        let mut list = PageList::new();
        pmm.alloc_pages(5, AllocFlags::empty(), 0, &mut list).unwrap();
        assert_eq!(list.len(), 5);
        assert_eq!(pmm.count_free_pages(), 3);
        for pa in list.iter() {
            assert!(pmm.page_flags(pa).unwrap().contains(PageFlags::NONFREE));
        }

        assert_eq!(pmm.free(&mut list), 5);
        assert_eq!(pmm.count_free_pages(), 8);
    }

    #[test]
    fn test_alloc_shortfall_is_atomic() {
        let pmm = pmm_with_pages(0x100000, 4);
        let mut list = PageList::new();
        assert_eq!(
            pmm.alloc_pages(5, AllocFlags::empty(), 0, &mut list),
            Err(Error::NoMemory)
        );
        assert!(list.is_empty());
        assert_eq!(pmm.count_free_pages(), 4);
    }

    #[test]
    fn test_pages_are_zeroed() {
        let pmm = Arc::new(Pmm::new());
        let info = testutil::host_arena("z", 0x100000, 4, 1);
        let kva = info.kvaddr.unwrap();
        pmm.add_arena(info).unwrap();

        // Dirty the backing memory, then allocate and check the page came
        // back zeroed through the arena alias.
        unsafe { core::ptr::write_bytes(kva as *mut u8, 0xAA, 4 * PAGE_SIZE) };
        let mut list = PageList::new();
        pmm.alloc_pages(4, AllocFlags::empty(), 0, &mut list).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(kva as *const u8, 4 * PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        pmm.free(&mut list);
    }

    #[test]
    fn test_no_clear_skips_zeroing() {
        let pmm = Arc::new(Pmm::new());
        let info = testutil::host_arena("nc", 0x100000, 2, 1);
        let kva = info.kvaddr.unwrap();
        pmm.add_arena(info).unwrap();

        unsafe { core::ptr::write_bytes(kva as *mut u8, 0x5A, 2 * PAGE_SIZE) };
        let mut list = PageList::new();
        pmm.alloc_pages(2, AllocFlags::NO_CLEAR, 0, &mut list).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(kva as *const u8, 2 * PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0x5A));
        pmm.free(&mut list);
    }

    #[test]
    fn test_reservation_oversubscription() {
        // Two arenas totaling 100 pages.
        let pmm = Arc::new(Pmm::new());
        pmm.add_arena(testutil::host_arena("a", 0x100000, 60, 1))
            .unwrap();
        pmm.add_arena(testutil::host_arena("b", 0x800000, 40, 2))
            .unwrap();

        assert_eq!(pmm.reserve_pages(60), Ok(()));
        assert_eq!(pmm.reserve_pages(50), Err(Error::NoMemory));
        assert_eq!(pmm.count_reserved_pages(), 60);
        assert_eq!(pmm.reserve_pages(40), Ok(()));
        pmm.unreserve_pages(60);
        assert_eq!(pmm.count_reserved_pages(), 40);
        pmm.unreserve_pages(40);
        assert_eq!(pmm.reserve_pages(100), Ok(()));
        pmm.unreserve_pages(100);
    }

    #[test]
    fn test_reserved_pages_unavailable_to_plain_alloc() {
        let pmm = pmm_with_pages(0x100000, 8);
        pmm.reserve_pages(6).unwrap();

        let mut list = PageList::new();
        assert_eq!(
            pmm.alloc_pages(3, AllocFlags::empty(), 0, &mut list),
            Err(Error::NoMemory)
        );
        pmm.alloc_pages(2, AllocFlags::empty(), 0, &mut list).unwrap();
        assert_eq!(list.len(), 2);
        pmm.free(&mut list);
        pmm.unreserve_pages(6);
    }

    #[test]
    fn test_from_reserved_discipline() {
        let pmm = pmm_with_pages(0x100000, 8);
        pmm.reserve_pages(4).unwrap();

        let mut list = PageList::new();
        pmm.alloc_pages(4, AllocFlags::FROM_RESERVED, 0, &mut list)
            .unwrap();
        for pa in list.iter() {
            assert!(pmm.page_flags(pa).unwrap().contains(PageFlags::RESERVED));
        }
        assert_eq!(pmm.count_reserved_pages(), 0);

        // Draining the pool means further reserved allocations fail even
        // though free pages remain.
        let mut more = PageList::new();
        assert_eq!(
            pmm.alloc_pages(1, AllocFlags::FROM_RESERVED, 0, &mut more),
            Err(Error::NoMemory)
        );

        // Freeing restores the reservation counters.
        pmm.free(&mut list);
        assert_eq!(pmm.count_reserved_pages(), 4);
        pmm.unreserve_pages(4);
    }

    #[test]
    fn test_contiguous_alignment() {
        // Arena [0x10000, 0x20000): four 16KB-aligned runs of four pages.
        let pmm = pmm_with_pages(0x10000, 16);
        let mut lists: alloc::vec::Vec<PageList> = alloc::vec::Vec::new();
        for _ in 0..4 {
            let mut list = PageList::new();
            let base = pmm.alloc_contiguous(4, 14, &mut list).unwrap();
            assert_eq!(base & ((1 << 14) - 1), 0);
            lists.push(list);
        }
        // All runs consumed.
        let mut list = PageList::new();
        assert_eq!(pmm.alloc_contiguous(4, 14, &mut list), Err(Error::NoMemory));
        for mut list in lists {
            pmm.free(&mut list);
        }
        assert_eq!(pmm.count_free_pages(), 16);
    }

    #[test]
    fn test_contiguous_run_is_contiguous() {
        let pmm = pmm_with_pages(0x100000, 16);
        // Fragment the arena: take every other page.
        let mut held = PageList::new();
        let mut fragments = PageList::new();
        for i in 0..8 {
            pmm.alloc_range(0x100000 + (2 * i * PAGE_SIZE) as PAddr, 1, &mut fragments);
        }
        assert_eq!(fragments.len(), 8);
        assert_eq!(
            pmm.alloc_contiguous(2, PAGE_SIZE_SHIFT, &mut held)
                .unwrap_err(),
            Error::NoMemory
        );
        pmm.free(&mut fragments);

        let base = pmm.alloc_contiguous(4, PAGE_SIZE_SHIFT, &mut held).unwrap();
        let pages: alloc::vec::Vec<PAddr> = held.iter().collect();
        for (i, pa) in pages.iter().enumerate() {
            assert_eq!(*pa, base + (i * PAGE_SIZE) as PAddr);
        }
        pmm.free(&mut held);
    }

    #[test]
    fn test_alloc_range_collision() {
        let pmm = pmm_with_pages(0x100000, 8);
        let mut first = PageList::new();
        assert_eq!(pmm.alloc_range(0x103000, 1, &mut first), 1);

        // The second request collides at the third page.
        let mut second = PageList::new();
        assert_eq!(pmm.alloc_range(0x101000, 4, &mut second), 2);
        assert_eq!(second.len(), 2);

        pmm.free(&mut first);
        pmm.free(&mut second);
        assert_eq!(pmm.count_free_pages(), 8);
    }

    #[test]
    fn test_free_list_matches_free_count() {
        let pmm = pmm_with_pages(0x100000, 8);
        let mut list = PageList::new();
        pmm.alloc_pages(3, AllocFlags::empty(), 0, &mut list).unwrap();
        pmm.with_state(|state| {
            for arena in state.arenas() {
                assert_eq!(arena.free_list_len(), arena.free_count());
                assert!(arena.free_count() >= arena.reserved_count());
            }
        });
        pmm.free(&mut list);
    }

    #[test]
    fn test_kpages_round_trip() {
        let pmm = pmm_with_pages(0x100000, 8);
        let mut list = PageList::new();
        let va = pmm.alloc_kpages(4, &mut list).unwrap();
        assert_eq!(pmm.kvaddr_to_paddr(va), Some(list.first().unwrap()));
        assert_eq!(pmm.count_free_pages(), 4);
        assert_eq!(pmm.free_kpages(va, 4), 4);
        assert_eq!(pmm.count_free_pages(), 8);
    }

    #[test]
    fn test_kmap_filter() {
        let pmm = Arc::new(Pmm::new());
        // Non-KMAP arena at higher priority; KMAP arena behind it.
        pmm.add_arena(ArenaInfo::new("plain", 0x400000, 4 * PAGE_SIZE, 1, ArenaFlags::empty()))
            .unwrap();
        pmm.add_arena(testutil::host_arena("mapped", 0x500000, 4, 2))
            .unwrap();

        let mut list = PageList::new();
        pmm.alloc_pages(2, AllocFlags::KMAP, 0, &mut list).unwrap();
        for pa in list.iter() {
            assert!(pa >= 0x500000);
        }
        pmm.free(&mut list);
    }

    #[test]
    fn test_add_arena_reserved_charges_descriptors() {
        let pmm = Arc::new(Pmm::new());
        let info = testutil::host_arena("late", 0x100000, 16, 1);
        pmm.add_arena_reserved(info, PAGE_SIZE, PAGE_SIZE).unwrap();
        // One leading reserved page, the descriptor cost, one trailing page.
        let descriptor_pages =
            bytes_to_pages(PAGE_SIZE + 16 * core::mem::size_of::<super::super::page::VmPage>());
        assert_eq!(pmm.count_free_pages(), 16 - descriptor_pages - 1);

        // Reservations that cannot fit are rejected.
        let info = testutil::host_arena("tiny", 0x400000, 2, 1);
        assert_eq!(
            pmm.add_arena_reserved(info, 2 * PAGE_SIZE, PAGE_SIZE),
            Err(Error::InvalidArgs)
        );
    }
}
