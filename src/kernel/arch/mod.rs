// Copyright 2025 The Trek Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Architecture MMU bridge
//!
//! Everything architecture-dependent sits behind two narrow traits:
//! [`ArchMmu`] is the per-platform singleton that creates address-space
//! state and performs hardware context switches, and [`ArchAspace`] is the
//! per-address-space handle the VM core maps and unmaps through.
//!
//! The core never touches page tables or system registers directly, which
//! is what lets the whole subsystem run against [`soft::SoftMmu`] on a host.

use alloc::boxed::Box;
use bitflags::bitflags;

use crate::trek::{PAddr, Result, VAddr};

pub mod soft;

bitflags! {
    /// Architecture MMU mapping flags, passed through from callers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmuFlags: u32 {
        const UNCACHED = 1 << 0;
        const UNCACHED_DEVICE = 1 << 1;
        const PERM_USER = 1 << 2;
        const PERM_RO = 1 << 3;
        const PERM_NO_EXECUTE = 1 << 4;
        const NON_SECURE = 1 << 5;
        const TAGGED = 1 << 6;
        /// Marker for "no mapping / flags unknown"; never installed.
        const INVALID = 1 << 31;
    }
}

impl MmuFlags {
    /// Default cache attribute (normal, write-back cached memory).
    pub const CACHED: MmuFlags = MmuFlags::empty();
}

bitflags! {
    /// Flags for address-space creation at the arch layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ArchAspaceFlags: u32 {
        const KERNEL = 1 << 0;
    }
}

/// Per-platform MMU entry points.
pub trait ArchMmu: Sync {
    /// Create the arch-specific state for an address space covering
    /// `[base, base + size)`.
    fn init_aspace(
        &self,
        base: VAddr,
        size: usize,
        flags: ArchAspaceFlags,
    ) -> Result<Box<dyn ArchAspace>>;

    /// Switch the MMU to `to`, or to "no user address space" when `None`.
    fn context_switch(&self, to: Option<&dyn ArchAspace>);
}

/// Per-address-space MMU operations.
pub trait ArchAspace: Send {
    /// Install `count` page mappings starting at `vaddr` → `paddr`.
    fn map(&mut self, vaddr: VAddr, paddr: PAddr, count: usize, flags: MmuFlags) -> Result<()>;

    /// Remove `count` page mappings starting at `vaddr`.
    fn unmap(&mut self, vaddr: VAddr, count: usize) -> Result<()>;

    /// Look up the physical address and flags mapped at `vaddr`.
    fn query(&self, vaddr: VAddr) -> Result<(PAddr, MmuFlags)>;

    /// Propose a base address in `[low, high]` for a new `size`-byte region.
    ///
    /// Architectures with placement restrictions (for example attribute
    /// boundaries between regions with `prev_flags`/`next_flags`) override
    /// this. The default aligns `low` upward; a wrapped result is rejected
    /// by the caller's range checks.
    fn pick_spot(
        &self,
        low: VAddr,
        _prev_flags: MmuFlags,
        _high: VAddr,
        _next_flags: MmuFlags,
        align: VAddr,
        _size: usize,
        _flags: MmuFlags,
    ) -> VAddr {
        low.wrapping_add(align - 1) & !(align - 1)
    }

    /// Tear down arch state before the address space is dropped.
    fn destroy(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::soft::SoftMmu;
    use super::*;

    #[test]
    fn test_default_pick_spot_aligns_up() {
        let mmu = SoftMmu::new();
        let aspace = mmu
            .init_aspace(0, 0x100000, ArchAspaceFlags::empty())
            .unwrap();
        let spot = aspace.pick_spot(
            0x1234,
            MmuFlags::INVALID,
            0xFFFFF,
            MmuFlags::INVALID,
            0x1000,
            0x1000,
            MmuFlags::CACHED,
        );
        assert_eq!(spot, 0x2000);
    }

    #[test]
    fn test_mmu_flags_cached_is_default() {
        assert_eq!(MmuFlags::CACHED, MmuFlags::empty());
        assert!(!MmuFlags::CACHED.contains(MmuFlags::UNCACHED));
    }
}
