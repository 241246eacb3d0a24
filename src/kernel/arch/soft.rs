// Copyright 2025 The Trek Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Software MMU backend
//!
//! A pure-software implementation of the MMU bridge: mappings live in an
//! ordered map instead of hardware page tables. Early bring-up runs on it
//! before the real arch backend is selected, and every VM-core test drives
//! the full subsystem through it.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use crate::kernel::vm::PAGE_SIZE;
use crate::trek::{Error, PAddr, Result, VAddr};

use super::{ArchAspace, ArchAspaceFlags, ArchMmu, MmuFlags};

/// Software MMU singleton.
pub struct SoftMmu;

impl SoftMmu {
    pub const fn new() -> Self {
        Self
    }
}

impl Default for SoftMmu {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchMmu for SoftMmu {
    fn init_aspace(
        &self,
        base: VAddr,
        size: usize,
        flags: ArchAspaceFlags,
    ) -> Result<Box<dyn ArchAspace>> {
        if size == 0 {
            return Err(Error::InvalidArgs);
        }
        Ok(Box::new(SoftAspace {
            base,
            size,
            flags,
            entries: BTreeMap::new(),
        }))
    }

    fn context_switch(&self, to: Option<&dyn ArchAspace>) {
        log::trace!("soft mmu context switch, active={}", to.is_some());
    }
}

/// Per-aspace mapping table of the software MMU.
pub struct SoftAspace {
    base: VAddr,
    size: usize,
    #[allow(dead_code)]
    flags: ArchAspaceFlags,
    entries: BTreeMap<VAddr, (PAddr, MmuFlags)>,
}

impl SoftAspace {
    fn check_range(&self, vaddr: VAddr, count: usize) -> Result<()> {
        if vaddr & (PAGE_SIZE - 1) != 0 || count == 0 {
            return Err(Error::InvalidArgs);
        }
        let len = count.checked_mul(PAGE_SIZE).ok_or(Error::InvalidArgs)?;
        let last = vaddr.checked_add(len - 1).ok_or(Error::OutOfRange)?;
        if vaddr < self.base || last > self.base + (self.size - 1) {
            return Err(Error::OutOfRange);
        }
        Ok(())
    }

    /// Number of live mappings, for diagnostics.
    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }
}

impl ArchAspace for SoftAspace {
    fn map(&mut self, vaddr: VAddr, paddr: PAddr, count: usize, flags: MmuFlags) -> Result<()> {
        self.check_range(vaddr, count)?;
        if flags.contains(MmuFlags::INVALID) {
            return Err(Error::InvalidArgs);
        }
        // Refuse to overwrite live entries before touching the table.
        for i in 0..count {
            if self.entries.contains_key(&(vaddr + i * PAGE_SIZE)) {
                return Err(Error::Fault);
            }
        }
        for i in 0..count {
            self.entries
                .insert(vaddr + i * PAGE_SIZE, (paddr + (i * PAGE_SIZE) as PAddr, flags));
        }
        Ok(())
    }

    fn unmap(&mut self, vaddr: VAddr, count: usize) -> Result<()> {
        self.check_range(vaddr, count)?;
        for i in 0..count {
            self.entries.remove(&(vaddr + i * PAGE_SIZE));
        }
        Ok(())
    }

    fn query(&self, vaddr: VAddr) -> Result<(PAddr, MmuFlags)> {
        let page = vaddr & !(PAGE_SIZE - 1);
        let (pa, flags) = self.entries.get(&page).ok_or(Error::NotFound)?;
        Ok((pa + (vaddr - page) as PAddr, *flags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aspace() -> Box<dyn ArchAspace> {
        SoftMmu::new()
            .init_aspace(0x10000, 0x10000, ArchAspaceFlags::empty())
            .unwrap()
    }

    #[test]
    fn test_map_query_unmap() {
        let mut a = aspace();
        a.map(0x11000, 0x8000, 2, MmuFlags::CACHED).unwrap();
        assert_eq!(a.query(0x11000).unwrap().0, 0x8000);
        assert_eq!(a.query(0x12fff).unwrap().0, 0x9fff);
        a.unmap(0x11000, 2).unwrap();
        assert_eq!(a.query(0x11000), Err(Error::NotFound));
    }

    #[test]
    fn test_double_map_rejected() {
        let mut a = aspace();
        a.map(0x11000, 0x8000, 1, MmuFlags::CACHED).unwrap();
        assert_eq!(a.map(0x11000, 0x9000, 1, MmuFlags::CACHED), Err(Error::Fault));
        // The survivor is the original mapping.
        assert_eq!(a.query(0x11000).unwrap().0, 0x8000);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut a = aspace();
        assert_eq!(
            a.map(0x30000, 0x8000, 1, MmuFlags::CACHED),
            Err(Error::OutOfRange)
        );
        assert_eq!(a.map(0x11001, 0x8000, 1, MmuFlags::CACHED), Err(Error::InvalidArgs));
    }
}
