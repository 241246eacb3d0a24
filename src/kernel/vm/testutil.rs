// Copyright 2025 The Trek Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Shared fixtures for VM unit tests
//!
//! Arenas in tests are backed by leaked host buffers: the arena's physical
//! base is synthetic, but its kernel alias points at real memory, so page
//! zeroing and kernel-page helpers run for real.

use alloc::boxed::Box;
use alloc::vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::kernel::arch::soft::SoftMmu;
use crate::kernel::arch::{ArchAspace, ArchAspaceFlags, ArchMmu, MmuFlags};
use crate::platform::EntropySource;
use crate::trek::{PAddr, Result, VAddr};

use super::arena::{ArenaFlags, ArenaInfo};
use super::PAGE_SIZE;

/// Build a KMAP arena of `pages` frames at synthetic physical address
/// `base`, aliased to a leaked host buffer.
pub(crate) fn host_arena(name: &str, base: PAddr, pages: usize, priority: u32) -> ArenaInfo {
    let buf = Box::leak(vec![0u8; pages * PAGE_SIZE].into_boxed_slice());
    ArenaInfo::new(name, base, pages * PAGE_SIZE, priority, ArenaFlags::KMAP)
        .with_kvaddr(buf.as_mut_ptr() as VAddr)
}

/// Deterministic entropy source (splitmix64).
pub(crate) struct TestEntropy {
    state: AtomicU64,
}

impl TestEntropy {
    pub(crate) const fn new(seed: u64) -> Self {
        Self {
            state: AtomicU64::new(seed),
        }
    }

    fn next(&self) -> u64 {
        let mut z = self
            .state
            .fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed)
            .wrapping_add(0x9e37_79b9_7f4a_7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }
}

impl EntropySource for TestEntropy {
    fn fill_bytes(&self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(8) {
            let word = self.next().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }
}

/// Leak a deterministic entropy source for APIs wanting `'static`.
pub(crate) fn leaked_entropy(seed: u64) -> &'static TestEntropy {
    Box::leak(Box::new(TestEntropy::new(seed)))
}

/// MMU backend whose placement hook refuses every base below
/// [`FLOOR`]: candidates are pushed up to the floor.
pub(crate) struct FloorMmu;

pub(crate) const FLOOR: VAddr = 0x8000;

pub(crate) static FLOOR_MMU: FloorMmu = FloorMmu;

impl ArchMmu for FloorMmu {
    fn init_aspace(
        &self,
        base: VAddr,
        size: usize,
        flags: ArchAspaceFlags,
    ) -> Result<Box<dyn ArchAspace>> {
        let inner = SoftMmu::new().init_aspace(base, size, flags)?;
        Ok(Box::new(FloorAspace { inner }))
    }

    fn context_switch(&self, _to: Option<&dyn ArchAspace>) {}
}

struct FloorAspace {
    inner: Box<dyn ArchAspace>,
}

impl ArchAspace for FloorAspace {
    fn map(&mut self, vaddr: VAddr, paddr: PAddr, count: usize, flags: MmuFlags) -> Result<()> {
        self.inner.map(vaddr, paddr, count, flags)
    }

    fn unmap(&mut self, vaddr: VAddr, count: usize) -> Result<()> {
        self.inner.unmap(vaddr, count)
    }

    fn query(&self, vaddr: VAddr) -> Result<(PAddr, MmuFlags)> {
        self.inner.query(vaddr)
    }

    fn pick_spot(
        &self,
        low: VAddr,
        prev_flags: MmuFlags,
        high: VAddr,
        next_flags: MmuFlags,
        align: VAddr,
        size: usize,
        flags: MmuFlags,
    ) -> VAddr {
        let candidate = self
            .inner
            .pick_spot(low.max(FLOOR), prev_flags, high, next_flags, align, size, flags);
        candidate.max(FLOOR)
    }
}
