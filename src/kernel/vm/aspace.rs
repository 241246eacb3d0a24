// Copyright 2025 The Trek Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Address Space Management
//!
//! An [`Aspace`] is a named virtual range holding an ordered set of
//! regions; the [`Vmm`] front end allocates regions into it, picking spots
//! by walking the gaps between neighboring regions. Placement is factored
//! into three primitives: `extract_gap` computes the open interval between
//! two regions, `next_spot` asks the arch bridge for the lowest admissible
//! base inside it, and `scan_gap` counts the candidate page-aligned bases.
//! With ASLR enabled the final spot is drawn uniformly from all candidates
//! across all gaps; otherwise the lowest legal base wins.
//!
//! # Locking
//!
//! Each aspace carries a region lock and an arch-handle lock, acquired in
//! that order. Pages backing a freed region return to the physical page
//! manager only after both are released. The active-aspace pointer is the
//! thread-lock standin; teardown and context switch take it last.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::{Mutex, Once};

use crate::kernel::arch::{ArchAspace, ArchAspaceFlags, ArchMmu, MmuFlags};
use crate::kernel::sync::IrqSpinlock;
use crate::platform::EntropySource;
use crate::trek::{Error, PAddr, Result, VAddr};

use super::obj::VmObj;
use super::pmm::{kernel_pmm, AllocFlags, Pmm};
use super::region::{Region, RegionFlags, RegionSnapshot, RegionTree};
use super::{
    is_page_aligned, is_paddr_page_aligned, page_align_up, FreeRegionFlags, VmmFlags,
    KERNEL_ASPACE_BASE, KERNEL_ASPACE_SIZE, PAGE_SIZE, PAGE_SIZE_SHIFT, USER_ASPACE_BASE,
    USER_ASPACE_SIZE,
};

bitflags! {
    /// Address-space class flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AspaceFlags: u32 {
        /// The kernel address space.
        const KERNEL = 1 << 0;
    }
}

/// A virtual address space and its regions.
pub struct Aspace {
    name: String,
    base: VAddr,
    size: usize,
    flags: AspaceFlags,
    regions: Mutex<RegionTree>,
    arch: Mutex<Box<dyn ArchAspace>>,
}

impl Aspace {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> VAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> AspaceFlags {
        self.flags
    }

    pub fn is_kernel(&self) -> bool {
        self.flags.contains(AspaceFlags::KERNEL)
    }

    /// Resolve a virtual address through the arch mapping state.
    pub fn query(&self, vaddr: VAddr) -> Result<(PAddr, MmuFlags)> {
        self.arch.lock().query(vaddr)
    }

    fn contains(&self, vaddr: VAddr) -> bool {
        range_contains_range(self.base, self.size, vaddr, 1)
    }

    fn contains_range(&self, vaddr: VAddr, size: usize) -> bool {
        range_contains_range(self.base, self.size, vaddr, size)
    }
}

fn range_contains_range(
    range_base: VAddr,
    range_size: usize,
    query_base: VAddr,
    query_size: usize,
) -> bool {
    debug_assert!(range_size > 0);
    debug_assert!(query_size > 0);
    let Some(range_last) = range_base.checked_add(range_size - 1) else {
        return false;
    };
    let Some(query_last) = query_base.checked_add(query_size - 1) else {
        return false;
    };
    range_base <= query_base && query_last <= range_last
}

/// Clamp a request so it does not run past the end of the aspace.
fn trim_to_aspace(aspace: &Aspace, vaddr: VAddr, size: usize) -> usize {
    debug_assert!(aspace.contains(vaddr));
    if size == 0 {
        return 0;
    }
    let offset = vaddr - aspace.base;
    match offset.checked_add(size) {
        Some(end) if end <= aspace.size => size,
        _ => aspace.size - offset,
    }
}

fn edge_flags(region: Option<&Region>) -> MmuFlags {
    region.map(|r| r.arch_mmu_flags).unwrap_or(MmuFlags::INVALID)
}

/// Compute the inclusive open interval between two neighboring regions.
/// Either neighbor may be absent, meaning the aspace edge.
fn extract_gap(
    aspace: &Aspace,
    low: Option<&Region>,
    high: Option<&Region>,
) -> Option<(VAddr, VAddr)> {
    debug_assert!(aspace.size != 0);
    let gap_low = match low {
        // No valid address exists above a region ending at the top of the
        // address space.
        Some(r) => r.base.checked_add(r.size)?,
        None => aspace.base,
    };
    let gap_high = match high {
        Some(r) => {
            if gap_low == r.base {
                return None;
            }
            debug_assert!(gap_low < r.base);
            r.base - 1
        }
        None => aspace.base + (aspace.size - 1),
    };
    Some((gap_low, gap_high))
}

/// Lowest admissible base >= `low` in `[low, high]` that fits `size`
/// without wrapping, as judged by the arch hook.
fn next_spot(
    arch: &dyn ArchAspace,
    prev_flags: MmuFlags,
    next_flags: MmuFlags,
    low: VAddr,
    high: VAddr,
    align: VAddr,
    size: usize,
    mmu_flags: MmuFlags,
) -> Option<VAddr> {
    let candidate = arch.pick_spot(low, prev_flags, high, next_flags, align, size, mmu_flags);
    if candidate < low || candidate > high {
        return None;
    }
    let candidate_last = candidate.checked_add(size - 1)?;
    if candidate_last > high {
        return None;
    }
    Some(candidate)
}

/// Count the candidate page-aligned bases for a new region in the gap
/// between `low` and `high`.
///
/// The estimate can exceed reality when the arch hook has exotic
/// requirements, but any index below the returned count is valid for
/// `spot_in_gap`.
fn scan_gap(
    arch: &dyn ArchAspace,
    aspace: &Aspace,
    low: Option<&Region>,
    high: Option<&Region>,
    align: VAddr,
    size: usize,
    mmu_flags: MmuFlags,
) -> usize {
    let Some((low_addr, high_addr)) = extract_gap(aspace, low, high) else {
        return 0;
    };
    let low_flags = edge_flags(low);
    let high_flags = edge_flags(high);

    let Some(first_base) = next_spot(
        arch, low_flags, high_flags, low_addr, high_addr, align, size, mmu_flags,
    ) else {
        return 0;
    };

    // Estimate the last position as the last page-aligned slot, backing off
    // a page at a time until the arch accepts one.
    let mut final_base = (high_addr - (size - 1)) & !(PAGE_SIZE - 1);
    loop {
        if let Some(base) = next_spot(
            arch, low_flags, high_flags, final_base, high_addr, align, size, mmu_flags,
        ) {
            final_base = base;
            break;
        }
        if final_base.checked_sub(first_base).map_or(true, |d| d < PAGE_SIZE) {
            break;
        }
        final_base -= PAGE_SIZE;
    }

    (final_base.saturating_sub(first_base) >> PAGE_SIZE_SHIFT) + 1
}

/// Resolve placement index `index` (below the `scan_gap` count for the same
/// gap) to an actual base address.
fn spot_in_gap(
    arch: &dyn ArchAspace,
    aspace: &Aspace,
    low: Option<&Region>,
    high: Option<&Region>,
    align: VAddr,
    size: usize,
    mmu_flags: MmuFlags,
    index: usize,
) -> VAddr {
    let Some((low_addr, high_addr)) = extract_gap(aspace, low, high) else {
        panic!("placement index into an empty gap");
    };
    let low_flags = edge_flags(low);
    let high_flags = edge_flags(high);

    let Some(base) = next_spot(
        arch, low_flags, high_flags, low_addr, high_addr, align, size, mmu_flags,
    ) else {
        panic!("placement index into a gap with no spots");
    };
    let base = base + index * PAGE_SIZE;
    let Some(base) = next_spot(
        arch, low_flags, high_flags, base, high_addr, align, size, mmu_flags,
    ) else {
        panic!("placement index with no mapping option");
    };
    base
}

/// Draw a uniform index in `[0, bound)` from the platform entropy source.
fn random_index(entropy: &dyn EntropySource, bound: usize) -> usize {
    debug_assert!(bound > 0);
    let bound = bound as u64;
    // Rejection sampling keeps the draw uniform for any bound.
    let reject = ((u64::MAX % bound) + 1) % bound;
    loop {
        let mut buf = [0u8; 8];
        entropy.fill_bytes(&mut buf);
        let value = u64::from_le_bytes(buf);
        if reject == 0 || value <= u64::MAX - reject {
            return (value % bound) as usize;
        }
    }
}

/// The virtual address-space manager.
pub struct Vmm {
    pmm: Arc<Pmm>,
    arch: &'static dyn ArchMmu,
    entropy: Option<&'static dyn EntropySource>,
    aspaces: Mutex<Vec<Arc<Aspace>>>,
    kernel_aspace: Once<Arc<Aspace>>,
    /// Thread-lock standin guarding the active-aspace pointer.
    active: IrqSpinlock<Option<Arc<Aspace>>>,
}

impl Vmm {
    pub fn new(pmm: Arc<Pmm>, arch: &'static dyn ArchMmu) -> Self {
        Self {
            pmm,
            arch,
            entropy: None,
            aspaces: Mutex::new(Vec::new()),
            kernel_aspace: Once::new(),
            active: IrqSpinlock::new(None),
        }
    }

    /// Enable randomized placement, drawing from `entropy`.
    pub fn with_aslr(mut self, entropy: &'static dyn EntropySource) -> Self {
        self.entropy = Some(entropy);
        self
    }

    pub fn pmm(&self) -> &Arc<Pmm> {
        &self.pmm
    }

    /// Create the kernel address space. Idempotent; called once during
    /// early boot before the heap-backed subsystems come up.
    pub fn init_preheap(&self) -> Result<&Arc<Aspace>> {
        if let Some(aspace) = self.kernel_aspace.get() {
            return Ok(aspace);
        }
        let aspace = self.create_aspace_at(
            "kernel",
            KERNEL_ASPACE_BASE,
            KERNEL_ASPACE_SIZE,
            AspaceFlags::KERNEL,
        )?;
        Ok(self.kernel_aspace.call_once(|| aspace))
    }

    pub fn kernel_aspace(&self) -> Option<&Arc<Aspace>> {
        self.kernel_aspace.get()
    }

    /// Create an address space of the default layout for its class.
    pub fn create_aspace(&self, name: &str, flags: AspaceFlags) -> Result<Arc<Aspace>> {
        if flags.contains(AspaceFlags::KERNEL) {
            self.create_aspace_at(name, KERNEL_ASPACE_BASE, KERNEL_ASPACE_SIZE, flags)
        } else {
            self.create_aspace_at(name, USER_ASPACE_BASE, USER_ASPACE_SIZE, flags)
        }
    }

    /// Create an address space covering `[base, base + size)`.
    pub fn create_aspace_at(
        &self,
        name: &str,
        base: VAddr,
        size: usize,
        flags: AspaceFlags,
    ) -> Result<Arc<Aspace>> {
        if size == 0 || !is_page_aligned(base) || !is_page_aligned(size) {
            return Err(Error::InvalidArgs);
        }
        let arch_flags = if flags.contains(AspaceFlags::KERNEL) {
            ArchAspaceFlags::KERNEL
        } else {
            ArchAspaceFlags::empty()
        };
        let arch_aspace = self.arch.init_aspace(base, size, arch_flags)?;
        let aspace = Arc::new(Aspace {
            name: String::from(name),
            base,
            size,
            flags,
            regions: Mutex::new(RegionTree::new()),
            arch: Mutex::new(arch_aspace),
        });
        self.aspaces.lock().push(Arc::clone(&aspace));
        Ok(aspace)
    }

    /// Tear down an address space: unlink and unmap every region, release
    /// the backing pages, detach it from the current context if active, and
    /// destroy the arch state.
    pub fn free_aspace(&self, aspace: &Arc<Aspace>) -> Result<()> {
        {
            let mut list = self.aspaces.lock();
            let pos = list
                .iter()
                .position(|a| Arc::ptr_eq(a, aspace))
                .ok_or(Error::InvalidArgs)?;
            list.remove(pos);
        }

        let drained = {
            let mut regions = aspace.regions.lock();
            let mut arch = aspace.arch.lock();
            let drained = regions.drain();
            for region in &drained {
                if let Err(e) = arch.unmap(region.base, region.size >> PAGE_SIZE_SHIFT) {
                    log::warn!("unmap of dying region '{}' failed: {:?}", region.name, e);
                }
            }
            drained
        };
        // Backing pages go back to the physical page manager with the
        // aspace locks released.
        drop(drained);

        // Detach from the current context under the thread-lock standin.
        {
            let mut active = self.active.lock();
            if active.as_ref().map_or(false, |a| Arc::ptr_eq(a, aspace)) {
                *active = None;
                self.arch.context_switch(None);
            }
        }

        aspace.arch.lock().destroy();
        Ok(())
    }

    /// Switch the current context to `aspace` (or to no aspace).
    pub fn set_active_aspace(&self, aspace: Option<&Arc<Aspace>>) {
        let mut active = self.active.lock();
        match (active.as_ref(), aspace) {
            (Some(current), Some(new)) if Arc::ptr_eq(current, new) => return,
            (None, None) => return,
            _ => {}
        }
        *active = aspace.cloned();
        // The arch handle is taken inside the thread-lock standin on this
        // path only; see the teardown notes.
        match aspace {
            Some(a) => {
                let arch = a.arch.lock();
                self.arch.context_switch(Some(&**arch));
            }
            None => self.arch.context_switch(None),
        }
    }

    pub fn active_aspace(&self) -> Option<Arc<Aspace>> {
        self.active.lock().clone()
    }

    /// All live address spaces.
    pub fn aspaces(&self) -> Vec<Arc<Aspace>> {
        self.aspaces.lock().clone()
    }

    /// Snapshot of the regions in `aspace`, in address order.
    pub fn regions_of(&self, aspace: &Aspace) -> Vec<RegionSnapshot> {
        aspace.regions.lock().iter().map(|r| r.snapshot()).collect()
    }

    /// Create an address-space reservation at a caller-chosen address. The
    /// new region inherits whatever the arch bridge reports mapped there.
    pub fn reserve_space(&self, aspace: &Aspace, name: &str, size: usize, vaddr: VAddr) -> Result<()> {
        log::trace!("reserve '{}' size {:#x} vaddr {:#x}", name, size, vaddr);
        if size == 0 {
            return Ok(());
        }
        if !is_page_aligned(vaddr) || !is_page_aligned(size) {
            return Err(Error::InvalidArgs);
        }
        if !aspace.contains(vaddr) {
            return Err(Error::OutOfRange);
        }
        let size = trim_to_aspace(aspace, vaddr, size);

        let mut regions = aspace.regions.lock();
        let arch = aspace.arch.lock();
        let arch_mmu_flags = arch
            .query(vaddr)
            .map(|(_, flags)| flags)
            .unwrap_or(MmuFlags::CACHED);
        Self::check_placement(aspace, &regions, vaddr, size)?;
        regions.insert(Region::new(
            name,
            vaddr,
            size,
            RegionFlags::RESERVED,
            arch_mmu_flags,
            None,
        ));
        Ok(())
    }

    /// Allocate a page-backed region. Pages may come from anywhere
    /// physical; mappings are installed page by page.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc(
        &self,
        aspace: &Aspace,
        name: &str,
        size: usize,
        vaddr: Option<VAddr>,
        align_pow2: u8,
        vmm_flags: VmmFlags,
        mmu_flags: MmuFlags,
    ) -> Result<VAddr> {
        self.alloc_etc(
            aspace,
            name,
            size,
            vaddr,
            align_pow2,
            vmm_flags,
            AllocFlags::empty(),
            mmu_flags,
        )
    }

    /// Allocate a region backed by one physically contiguous run, mapped
    /// with a single MMU call so large hardware mappings can be used.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc_contiguous(
        &self,
        aspace: &Aspace,
        name: &str,
        size: usize,
        vaddr: Option<VAddr>,
        align_pow2: u8,
        vmm_flags: VmmFlags,
        mmu_flags: MmuFlags,
    ) -> Result<VAddr> {
        self.alloc_etc(
            aspace,
            name,
            size,
            vaddr,
            align_pow2,
            vmm_flags,
            AllocFlags::KMAP | AllocFlags::CONTIGUOUS,
            mmu_flags,
        )
    }

    /// Allocate a page-backed region with explicit page-manager flags:
    /// `NO_CLEAR` when the caller will zero the pages itself, `ALLOW_TAGGED`
    /// when it will install memory tags, `CONTIGUOUS`/`KMAP` for run
    /// placement. Reservation-pool draws go through the resource-group API,
    /// not here.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc_etc(
        &self,
        aspace: &Aspace,
        name: &str,
        size: usize,
        vaddr: Option<VAddr>,
        align_pow2: u8,
        vmm_flags: VmmFlags,
        pmm_flags: AllocFlags,
        mmu_flags: MmuFlags,
    ) -> Result<VAddr> {
        log::trace!("alloc '{}' size {:#x} flags {:?}", name, size, vmm_flags);
        debug_assert!(!pmm_flags.contains(AllocFlags::FROM_RESERVED));
        let size = page_align_up(size);
        if size == 0 {
            return Err(Error::InvalidArgs);
        }
        let count = size >> PAGE_SIZE_SHIFT;

        // Take the physical memory up front, in case it cannot be
        // satisfied; placement failure then has nothing to unwind there.
        let pmm_align = if pmm_flags.contains(AllocFlags::CONTIGUOUS) {
            align_pow2
        } else {
            0
        };
        let obj = self.pmm.alloc(count, pmm_flags, pmm_align)?;
        self.place_and_map(
            aspace,
            name,
            Box::new(obj),
            size,
            vaddr,
            align_pow2,
            vmm_flags,
            mmu_flags,
        )
    }

    /// Map a caller-supplied memory object into the address space. The
    /// region takes ownership; the object's capability bits are checked
    /// against the requested mapping flags before anything is installed.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc_obj(
        &self,
        aspace: &Aspace,
        name: &str,
        obj: Box<dyn VmObj>,
        size: usize,
        vaddr: Option<VAddr>,
        align_pow2: u8,
        vmm_flags: VmmFlags,
        mmu_flags: MmuFlags,
    ) -> Result<VAddr> {
        let size = page_align_up(size);
        if size == 0 {
            return Err(Error::InvalidArgs);
        }
        self.place_and_map(aspace, name, obj, size, vaddr, align_pow2, vmm_flags, mmu_flags)
    }

    #[allow(clippy::too_many_arguments)]
    fn place_and_map(
        &self,
        aspace: &Aspace,
        name: &str,
        backing: Box<dyn VmObj>,
        size: usize,
        vaddr: Option<VAddr>,
        align_pow2: u8,
        vmm_flags: VmmFlags,
        mmu_flags: MmuFlags,
    ) -> Result<VAddr> {
        backing.check_flags(mmu_flags)?;

        let mut regions = aspace.regions.lock();
        let mut arch = aspace.arch.lock();

        let base = self.resolve_base(
            aspace, &regions, &**arch, size, vaddr, align_pow2, vmm_flags, mmu_flags,
        )?;
        regions.insert(Region::new(
            name,
            base,
            size,
            RegionFlags::PHYSICAL,
            mmu_flags,
            Some(backing),
        ));

        if let Err(e) = Self::map_region(&mut **arch, &regions, base, size, mmu_flags) {
            let failed = regions.remove(base);
            drop(arch);
            drop(regions);
            drop(failed);
            return Err(e);
        }
        Ok(base)
    }

    /// Map caller-supplied physical ranges (device memory). The region owns
    /// no pages; freeing it only removes the mappings.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc_physical(
        &self,
        aspace: &Aspace,
        name: &str,
        size: usize,
        vaddr: Option<VAddr>,
        align_pow2: u8,
        paddrs: &[PAddr],
        vmm_flags: VmmFlags,
        mmu_flags: MmuFlags,
    ) -> Result<VAddr> {
        if size == 0 || !is_page_aligned(size) || paddrs.is_empty() {
            return Err(Error::InvalidArgs);
        }
        let chunk = size / paddrs.len();
        if chunk == 0 || !is_page_aligned(chunk) {
            return Err(Error::InvalidArgs);
        }
        for pa in paddrs {
            if !is_paddr_page_aligned(*pa) {
                return Err(Error::InvalidArgs);
            }
        }

        let mut regions = aspace.regions.lock();
        let mut arch = aspace.arch.lock();

        let base = self.resolve_base(
            aspace, &regions, &**arch, size, vaddr, align_pow2, vmm_flags, mmu_flags,
        )?;
        regions.insert(Region::new(
            name,
            base,
            size,
            RegionFlags::PHYSICAL,
            mmu_flags,
            None,
        ));

        for (i, pa) in paddrs.iter().enumerate() {
            if let Err(e) = arch.map(base + i * chunk, *pa, chunk >> PAGE_SIZE_SHIFT, mmu_flags) {
                if i > 0 {
                    let _ = arch.unmap(base, (i * chunk) >> PAGE_SIZE_SHIFT);
                }
                regions.remove(base);
                return Err(e);
            }
        }
        Ok(base)
    }

    /// Release the region matching `vaddr`/`size`: unlink it, tear down its
    /// mappings, and return any backing pages once the locks are dropped.
    pub fn free_region_etc(
        &self,
        aspace: &Aspace,
        vaddr: VAddr,
        size: usize,
        flags: FreeRegionFlags,
    ) -> Result<()> {
        let mut regions = aspace.regions.lock();
        let base = regions
            .find_containing(vaddr)
            .filter(|r| {
                if flags.contains(FreeRegionFlags::EXPAND) {
                    r.contains_range(vaddr, size)
                } else {
                    r.base == vaddr && r.size == size
                }
            })
            .map(|r| r.base)
            .ok_or(Error::NotFound)?;
        let region = regions.remove(base).ok_or(Error::NotFound)?;

        let mut arch = aspace.arch.lock();
        if let Err(e) = arch.unmap(region.base, region.size >> PAGE_SIZE_SHIFT) {
            log::warn!("unmap of region '{}' failed: {:?}", region.name, e);
        }
        drop(arch);
        drop(regions);

        // Pages go back to the physical page manager here, after the
        // aspace locks are released.
        drop(region);
        Ok(())
    }

    /// Free any region containing `vaddr`.
    pub fn free_region(&self, aspace: &Aspace, vaddr: VAddr) -> Result<()> {
        self.free_region_etc(aspace, vaddr, 1, FreeRegionFlags::EXPAND)
    }

    /// Find the region containing `vaddr`.
    pub fn find_region(&self, aspace: &Aspace, vaddr: VAddr) -> Option<RegionSnapshot> {
        aspace
            .regions
            .lock()
            .find_containing(vaddr)
            .map(|r| r.snapshot())
    }

    /// Read-only placement query: where would a `size`-byte region land?
    pub fn find_spot(&self, aspace: &Aspace, size: usize) -> Option<VAddr> {
        let size = page_align_up(size);
        if size == 0 {
            return None;
        }
        let regions = aspace.regions.lock();
        let arch = aspace.arch.lock();
        self.alloc_spot(
            aspace,
            &regions,
            &**arch,
            size,
            PAGE_SIZE_SHIFT,
            MmuFlags::CACHED,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_base(
        &self,
        aspace: &Aspace,
        regions: &RegionTree,
        arch: &dyn ArchAspace,
        size: usize,
        vaddr: Option<VAddr>,
        align_pow2: u8,
        vmm_flags: VmmFlags,
        mmu_flags: MmuFlags,
    ) -> Result<VAddr> {
        if vmm_flags.contains(VmmFlags::VALLOC_SPECIFIC) {
            let base = vaddr.ok_or(Error::InvalidArgs)?;
            if !is_page_aligned(base) {
                return Err(Error::InvalidArgs);
            }
            Self::check_placement(aspace, regions, base, size)?;
            Ok(base)
        } else {
            self.alloc_spot(aspace, regions, arch, size, align_pow2, mmu_flags)
                .ok_or(Error::NoMemory)
        }
    }

    /// Verify `[base, base + size)` lies inside the aspace and intersects
    /// no existing region.
    fn check_placement(
        aspace: &Aspace,
        regions: &RegionTree,
        base: VAddr,
        size: usize,
    ) -> Result<()> {
        if size == 0 || !aspace.contains_range(base, size) {
            return Err(Error::OutOfRange);
        }
        if regions.find_containing(base).is_some() {
            return Err(Error::NoMemory);
        }
        if let Some(next) = regions.next(base) {
            if base + (size - 1) >= next.base {
                return Err(Error::NoMemory);
            }
        }
        Ok(())
    }

    /// Pick a base for a new region: count the candidate spots across every
    /// gap, draw an index (randomized under ASLR, lowest otherwise), then
    /// walk the gaps again to turn the index into an address.
    fn alloc_spot(
        &self,
        aspace: &Aspace,
        regions: &RegionTree,
        arch: &dyn ArchAspace,
        size: usize,
        align_pow2: u8,
        mmu_flags: MmuFlags,
    ) -> Option<VAddr> {
        debug_assert!(size > 0 && is_page_aligned(size));
        let align_pow2 = align_pow2.max(PAGE_SIZE_SHIFT);
        if align_pow2 as u32 >= usize::BITS {
            return None;
        }
        let align: VAddr = 1 << align_pow2;

        let regs: Vec<&Region> = regions.iter().collect();
        let pair = |i: usize| -> (Option<&Region>, Option<&Region>) {
            let low = if i == 0 { None } else { Some(regs[i - 1]) };
            (low, regs.get(i).copied())
        };

        let mut choices = 0usize;
        for i in 0..=regs.len() {
            let (low, high) = pair(i);
            choices += scan_gap(arch, aspace, low, high, align, size, mmu_flags);
        }
        if choices == 0 {
            return None;
        }

        let mut index = match self.entropy {
            Some(entropy) => random_index(entropy, choices),
            None => 0,
        };
        for i in 0..=regs.len() {
            let (low, high) = pair(i);
            let local_spots = scan_gap(arch, aspace, low, high, align, size, mmu_flags);
            if local_spots > index {
                return Some(spot_in_gap(
                    arch, aspace, low, high, align, size, mmu_flags, index,
                ));
            }
            index -= local_spots;
        }
        unreachable!("placement index outside counted choices")
    }

    /// Install the mappings for a freshly inserted page-backed region,
    /// chunk by chunk. On failure everything installed so far is removed.
    fn map_region(
        arch: &mut dyn ArchAspace,
        regions: &RegionTree,
        base: VAddr,
        size: usize,
        mmu_flags: MmuFlags,
    ) -> Result<()> {
        let region = regions.find(base).ok_or(Error::Generic)?;
        let Some(backing) = &region.backing else {
            return Ok(());
        };
        let mut offset = 0;
        while offset < size {
            let (pa, span) = backing.get_page(offset)?;
            let chunk = span.min(size - offset);
            let pages = chunk >> PAGE_SIZE_SHIFT;
            if let Err(e) = arch.map(base + offset, pa, pages, mmu_flags) {
                if offset > 0 {
                    let _ = arch.unmap(base, offset >> PAGE_SIZE_SHIFT);
                }
                return Err(e);
            }
            offset += chunk;
        }
        Ok(())
    }
}

// ============================================================================
// Global instance
// ============================================================================

static KERNEL_VMM: Once<Vmm> = Once::new();

/// Bring up the system VMM and the kernel address space.
pub fn vmm_init_preheap(
    arch: &'static dyn ArchMmu,
    entropy: Option<&'static dyn EntropySource>,
) -> Result<&'static Vmm> {
    let vmm = KERNEL_VMM.call_once(|| {
        let vmm = Vmm::new(Arc::clone(kernel_pmm()), arch);
        match entropy {
            Some(e) => vmm.with_aslr(e),
            None => vmm,
        }
    });
    vmm.init_preheap()?;
    Ok(vmm)
}

/// The system VMM, if initialized.
pub fn kernel_vmm() -> Option<&'static Vmm> {
    KERNEL_VMM.get()
}

/// The kernel address space, if initialized.
pub fn vmm_get_kernel_aspace() -> Option<&'static Arc<Aspace>> {
    KERNEL_VMM.get().and_then(|vmm| vmm.kernel_aspace())
}
