// Copyright 2025 The Trek Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Resource groups
//!
//! A resource group is a refcounted reservation of physical pages: the hard
//! cap that keeps mutually distrustful tenants from oversubscribing each
//! other. Creation reserves pages with the physical page manager; `take`
//! and `release` move usage inside the cap; `shutdown` trims the
//! reservation down to what is still in use so a dying tenant cannot grow.
//!
//! The handle is shared (`Arc`): the creator plus every memory object
//! charged against the group hold references, and the final drop performs
//! the residual unreserve.

use alloc::sync::Arc;
use spin::Mutex;

use crate::trek::{Error, Result};

use super::pmm::Pmm;

struct ResGroupState {
    reserved_pages: usize,
    used_pages: usize,
    is_shutdown: bool,
}

/// A refcounted reservation of physical pages.
pub struct ResGroup {
    pmm: Arc<Pmm>,
    state: Mutex<ResGroupState>,
}

impl ResGroup {
    /// Reserve `pages` and wrap them in a group.
    pub fn create(pmm: Arc<Pmm>, pages: usize) -> Result<Arc<ResGroup>> {
        pmm.reserve_pages(pages)?;
        Ok(Arc::new(ResGroup {
            pmm,
            state: Mutex::new(ResGroupState {
                reserved_pages: pages,
                used_pages: 0,
                is_shutdown: false,
            }),
        }))
    }

    /// Charge `pages` against the group's reservation.
    pub fn take_mem(&self, pages: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_shutdown {
            return Err(Error::ObjectDestroyed);
        }
        let total = state
            .used_pages
            .checked_add(pages)
            .ok_or(Error::NoMemory)?;
        if total > state.reserved_pages {
            return Err(Error::NoMemory);
        }
        state.used_pages = total;
        Ok(())
    }

    /// Return `pages` of usage to the group.
    pub fn release_mem(&self, pages: usize) {
        let mut state = self.state.lock();
        assert!(state.used_pages >= pages);
        state.used_pages -= pages;
    }

    /// Stop admitting new usage and shrink the reservation to exactly what
    /// is outstanding. Further `take_mem` calls fail with `ObjectDestroyed`.
    pub fn shutdown(&self) {
        let unused = {
            let mut state = self.state.lock();
            assert!(!state.is_shutdown);
            state.is_shutdown = true;
            let unused = state.reserved_pages - state.used_pages;
            state.reserved_pages -= unused;
            unused
        };
        self.pmm.unreserve_pages(unused);
    }

    pub fn reserved_pages(&self) -> usize {
        self.state.lock().reserved_pages
    }

    pub fn used_pages(&self) -> usize {
        self.state.lock().used_pages
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().is_shutdown
    }
}

impl Drop for ResGroup {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        assert!(state.is_shutdown, "resource group dropped without shutdown");
        assert_eq!(state.used_pages, 0);
        if state.reserved_pages > 0 {
            self.pmm.unreserve_pages(state.reserved_pages);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::pmm::AllocFlags;
    use super::super::testutil;
    use super::*;

    fn pmm() -> Arc<Pmm> {
        let pmm = Arc::new(Pmm::new());
        pmm.add_arena(testutil::host_arena("rg", 0x100000, 16, 1))
            .unwrap();
        pmm
    }

    #[test]
    fn test_take_respects_cap() {
        let pmm = pmm();
        let group = ResGroup::create(Arc::clone(&pmm), 8).unwrap();
        assert_eq!(group.take_mem(5), Ok(()));
        assert_eq!(group.take_mem(4), Err(Error::NoMemory));
        assert_eq!(group.take_mem(3), Ok(()));
        group.release_mem(8);
        group.shutdown();
    }

    #[test]
    fn test_create_fails_without_headroom() {
        let pmm = pmm();
        let _big = ResGroup::create(Arc::clone(&pmm), 12).unwrap();
        assert!(ResGroup::create(Arc::clone(&pmm), 8).is_err());
        _big.shutdown();
    }

    #[test]
    fn test_shutdown_lifecycle() {
        let pmm = pmm();
        let group = ResGroup::create(Arc::clone(&pmm), 10).unwrap();
        assert_eq!(pmm.count_reserved_pages(), 10);

        // Allocate 4 pages through the group.
        let obj = pmm
            .alloc_from_res_group(Some(&group), 4, AllocFlags::FROM_RESERVED, 0)
            .unwrap();
        assert_eq!(group.used_pages(), 4);

        // Shutdown trims the reservation to the outstanding usage.
        group.shutdown();
        assert_eq!(group.reserved_pages(), 4);
        assert_eq!(pmm.count_reserved_pages(), 4);
        assert_eq!(group.take_mem(1), Err(Error::ObjectDestroyed));

        // Freeing the pages drops the last usage; dropping the handles
        // destroys the group and returns the reservation to the PMM.
        drop(obj);
        assert_eq!(group.used_pages(), 0);
        drop(group);
        assert_eq!(pmm.count_reserved_pages(), 0);
        assert_eq!(pmm.count_free_pages(), 16);
    }
}
