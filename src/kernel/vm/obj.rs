// Copyright 2025 The Trek Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Memory objects
//!
//! A memory object is an abstract producer of physical pages: the mapper
//! asks it for `(paddr, span)` pairs by byte offset and checks its
//! capability bits before installing mappings. [`PmmVmObj`] is the
//! page-backed implementation; its chunk table is either one large chunk
//! (a contiguous run, mappable in a single MMU call) or one page-sized
//! chunk per frame.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::kernel::arch::MmuFlags;
use crate::trek::{Error, PAddr, Result};

use super::page::PageList;
use super::pmm::Pmm;
use super::res_group::ResGroup;

bitflags! {
    /// Memory-object capability bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjFlags: u32 {
        /// The caller promised to zero the pages before they are used;
        /// cleared by [`PmmVmObj::set_cleared`].
        const NEEDS_CLEAR = 1 << 0;
        /// The caller may install memory tags at map time; cleared by
        /// [`PmmVmObj::set_tagged`].
        const ALLOW_TAGGED = 1 << 1;
    }
}

/// Page provider consumed by the address-space manager.
pub trait VmObj: Send {
    /// Validate the requested mapping flags against the object's
    /// capabilities.
    fn check_flags(&self, mmu_flags: MmuFlags) -> Result<()>;

    /// Resolve a byte offset to the physical address it lands at and the
    /// number of contiguous bytes remaining in that chunk.
    fn get_page(&self, offset: usize) -> Result<(PAddr, usize)>;
}

/// Memory object backed by pages owned by the physical page manager.
///
/// Dropping the object returns its pages to the PMM and releases its
/// resource-group charge, in that order.
pub struct PmmVmObj {
    pmm: Arc<Pmm>,
    page_list: PageList,
    chunks: Vec<PAddr>,
    chunk_size: usize,
    res_group: Option<Arc<ResGroup>>,
    flags: ObjFlags,
}

impl PmmVmObj {
    pub(crate) fn new(
        pmm: Arc<Pmm>,
        page_list: PageList,
        chunks: Vec<PAddr>,
        chunk_size: usize,
        res_group: Option<Arc<ResGroup>>,
        flags: ObjFlags,
    ) -> Self {
        debug_assert!(chunk_size % super::PAGE_SIZE == 0);
        debug_assert!(!chunks.is_empty());
        Self {
            pmm,
            page_list,
            chunks,
            chunk_size,
            res_group,
            flags,
        }
    }

    /// Total size of the object in bytes.
    pub fn size(&self) -> usize {
        self.chunks.len() * self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn needs_clear(&self) -> bool {
        self.flags.contains(ObjFlags::NEEDS_CLEAR)
    }

    pub fn allows_tagged(&self) -> bool {
        self.flags.contains(ObjFlags::ALLOW_TAGGED)
    }

    /// Record that the caller zeroed the object. Clearing is tracked at
    /// object granularity, so the range must cover all of it.
    pub fn set_cleared(&mut self, offset: usize, size: usize) {
        assert!(self.needs_clear());
        assert_eq!(offset, 0);
        assert_eq!(size, self.size());
        self.flags.remove(ObjFlags::NEEDS_CLEAR);
    }

    /// Record that the caller installed memory tags.
    pub fn set_tagged(&mut self) {
        assert!(self.allows_tagged());
        self.flags.remove(ObjFlags::ALLOW_TAGGED);
    }
}

impl VmObj for PmmVmObj {
    fn check_flags(&self, mmu_flags: MmuFlags) -> Result<()> {
        if mmu_flags.contains(MmuFlags::TAGGED) && !self.allows_tagged() {
            return Err(Error::InvalidArgs);
        }
        // An uncleared object cannot be mapped read-only; nobody could
        // fulfil the promise to zero it.
        if self.needs_clear() && mmu_flags.contains(MmuFlags::PERM_RO) {
            return Err(Error::InvalidArgs);
        }
        Ok(())
    }

    fn get_page(&self, offset: usize) -> Result<(PAddr, usize)> {
        let index = offset / self.chunk_size;
        let chunk_offset = offset % self.chunk_size;
        let chunk = self.chunks.get(index).ok_or(Error::OutOfRange)?;
        Ok((chunk + chunk_offset as PAddr, self.chunk_size - chunk_offset))
    }
}

impl Drop for PmmVmObj {
    fn drop(&mut self) {
        let count = self.page_list.len();
        self.pmm.free(&mut self.page_list);
        if let Some(group) = &self.res_group {
            group.release_mem(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::pmm::AllocFlags;
    use super::super::testutil;
    use super::*;
    use crate::kernel::vm::PAGE_SIZE;

    fn pmm() -> Arc<Pmm> {
        let pmm = Arc::new(Pmm::new());
        pmm.add_arena(testutil::host_arena("obj", 0x100000, 16, 1))
            .unwrap();
        pmm
    }

    #[test]
    fn test_discontiguous_chunks() {
        let pmm = pmm();
        let obj = pmm.alloc(4, AllocFlags::empty(), 0).unwrap();
        assert_eq!(obj.chunk_count(), 4);
        assert_eq!(obj.size(), 4 * PAGE_SIZE);

        let (pa, span) = obj.get_page(0).unwrap();
        assert_eq!(span, PAGE_SIZE);
        assert!(pa >= 0x100000);

        let (_, span) = obj.get_page(PAGE_SIZE + 123).unwrap();
        assert_eq!(span, PAGE_SIZE - 123);

        assert_eq!(obj.get_page(4 * PAGE_SIZE), Err(Error::OutOfRange));
    }

    #[test]
    fn test_contiguous_single_chunk() {
        let pmm = pmm();
        let obj = pmm.alloc(4, AllocFlags::CONTIGUOUS | AllocFlags::KMAP, 0).unwrap();
        assert_eq!(obj.chunk_count(), 1);

        let (base, span) = obj.get_page(0).unwrap();
        assert_eq!(span, 4 * PAGE_SIZE);
        let (pa, span) = obj.get_page(3 * PAGE_SIZE).unwrap();
        assert_eq!(pa, base + 3 * PAGE_SIZE as PAddr);
        assert_eq!(span, PAGE_SIZE);
    }

    #[test]
    fn test_drop_returns_pages() {
        let pmm = pmm();
        let obj = pmm.alloc(6, AllocFlags::empty(), 0).unwrap();
        assert_eq!(pmm.count_free_pages(), 10);
        drop(obj);
        assert_eq!(pmm.count_free_pages(), 16);
    }

    #[test]
    fn test_capability_bits() {
        let pmm = pmm();
        let mut obj = pmm
            .alloc(1, AllocFlags::NO_CLEAR | AllocFlags::ALLOW_TAGGED, 0)
            .unwrap();
        assert!(obj.needs_clear());
        assert!(obj.allows_tagged());

        // Uncleared objects refuse read-only mappings.
        assert_eq!(obj.check_flags(MmuFlags::PERM_RO), Err(Error::InvalidArgs));
        obj.set_cleared(0, PAGE_SIZE);
        assert_eq!(obj.check_flags(MmuFlags::PERM_RO), Ok(()));

        assert_eq!(obj.check_flags(MmuFlags::TAGGED), Ok(()));
        obj.set_tagged();
        assert_eq!(obj.check_flags(MmuFlags::TAGGED), Err(Error::InvalidArgs));
    }
}
