// Copyright 2025 The Trek Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! VM diagnostics
//!
//! Dump helpers for arenas, address spaces, and regions, plus the `pmm` and
//! `vmm` console commands for poking the allocators from the kernel shell.
//! Commands return 0 on success and a negative status on failure. Pages
//! allocated through the console are parked on console-local lists until
//! `free_alloced`.

use alloc::sync::Arc;
use spin::Mutex;

use crate::trek::{PAddr, Status, VAddr};

use super::aspace::{Aspace, Vmm};
use super::page::PageList;
use super::pmm::{AllocFlags, Pmm};
use super::{AspaceFlags, MmuFlags, VmmFlags};

/// Dump every arena of `pmm`: header, counters, and free ranges.
pub fn dump_pmm(pmm: &Pmm) {
    pmm.with_state(|state| {
        for arena in state.arenas() {
            log::info!(
                "arena '{}': base {:#x} size {:#x} priority {} flags {:?}",
                arena.name(),
                arena.base(),
                arena.size(),
                arena.priority(),
                arena.flags()
            );
            log::info!(
                "  free_count {} ({} on list) reserved_count {}",
                arena.free_count(),
                arena.free_list_len(),
                arena.reserved_count()
            );

            let mut run_start: Option<usize> = None;
            for i in 0..arena.page_count() {
                if arena.page(i).is_free() {
                    run_start.get_or_insert(i);
                    continue;
                }
                if let Some(start) = run_start.take() {
                    log::info!(
                        "  free range {:#x} - {:#x}",
                        arena.paddr_of(start),
                        arena.paddr_of(i)
                    );
                }
            }
            if let Some(start) = run_start {
                log::info!(
                    "  free range {:#x} - {:#x}",
                    arena.paddr_of(start),
                    arena.base() + arena.size() as PAddr
                );
            }
        }
    });
}

/// Dump an address space and its regions.
pub fn dump_aspace(vmm: &Vmm, aspace: &Aspace) {
    log::info!(
        "aspace '{}': range {:#x} - {:#x} size {:#x} flags {:?}",
        aspace.name(),
        aspace.base(),
        aspace.base() + (aspace.size() - 1),
        aspace.size(),
        aspace.flags()
    );
    for region in vmm.regions_of(aspace) {
        log::info!(
            "  region '{}': range {:#x} - {:#x} size {:#x} flags {:?} mmu_flags {:?}",
            region.name,
            region.base,
            region.base + (region.size - 1),
            region.size,
            region.flags,
            region.arch_mmu_flags
        );
    }
}

fn parse_num(arg: &str) -> Option<u64> {
    if let Some(hex) = arg.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        arg.parse().ok()
    }
}

/// The `pmm` console command.
pub struct PmmConsole {
    pmm: Arc<Pmm>,
    allocated: Mutex<PageList>,
}

impl PmmConsole {
    pub fn new(pmm: Arc<Pmm>) -> Self {
        Self {
            pmm,
            allocated: Mutex::new(PageList::new()),
        }
    }

    fn usage(&self) -> Status {
        log::info!("usage:");
        log::info!("pmm arenas");
        log::info!("pmm alloc <count>");
        log::info!("pmm alloc_range <address> <count>");
        log::info!("pmm alloc_kpages <count>");
        log::info!("pmm alloc_contig <count> <alignment_log2>");
        log::info!("pmm dump_alloced");
        log::info!("pmm free_alloced");
        crate::trek::Error::Generic.to_status()
    }

    pub fn run(&self, args: &[&str]) -> Status {
        match args {
            ["arenas"] => {
                dump_pmm(&self.pmm);
                0
            }
            ["alloc", count] => {
                let Some(count) = parse_num(count) else {
                    return self.usage();
                };
                let mut list = PageList::new();
                match self
                    .pmm
                    .alloc_pages(count as usize, AllocFlags::empty(), 0, &mut list)
                {
                    Ok(()) => {
                        log::info!("allocated {} pages", list.len());
                        self.allocated.lock().append(&mut list);
                        0
                    }
                    Err(e) => e.to_status(),
                }
            }
            ["alloc_range", address, count] => {
                let (Some(address), Some(count)) = (parse_num(address), parse_num(count)) else {
                    return self.usage();
                };
                let mut list = PageList::new();
                let claimed = self.pmm.alloc_range(address, count as usize, &mut list);
                log::info!("alloc_range claimed {} pages", claimed);
                for pa in list.iter() {
                    log::info!("  page {:#x}", pa);
                }
                self.allocated.lock().append(&mut list);
                0
            }
            ["alloc_kpages", count] => {
                let Some(count) = parse_num(count) else {
                    return self.usage();
                };
                let mut list = PageList::new();
                match self.pmm.alloc_kpages(count as usize, &mut list) {
                    Ok(va) => {
                        log::info!("alloc_kpages returns {:#x}", va);
                        self.allocated.lock().append(&mut list);
                        0
                    }
                    Err(e) => e.to_status(),
                }
            }
            ["alloc_contig", count, align] => {
                let (Some(count), Some(align)) = (parse_num(count), parse_num(align)) else {
                    return self.usage();
                };
                let mut list = PageList::new();
                match self
                    .pmm
                    .alloc_contiguous(count as usize, align as u8, &mut list)
                {
                    Ok(pa) => {
                        log::info!("alloc_contig returns {:#x}", pa);
                        self.allocated.lock().append(&mut list);
                        0
                    }
                    Err(e) => e.to_status(),
                }
            }
            ["dump_alloced"] => {
                for pa in self.allocated.lock().iter() {
                    log::info!("page {:#x} flags {:?}", pa, self.pmm.page_flags(pa));
                }
                0
            }
            ["free_alloced"] => {
                let mut list = self.allocated.lock();
                let freed = self.pmm.free(&mut list);
                log::info!("freed {} pages", freed);
                0
            }
            _ => self.usage(),
        }
    }
}

/// The `vmm` console command. Operations target the console's test aspace,
/// falling back to the kernel aspace.
pub struct VmmConsole<'a> {
    vmm: &'a Vmm,
    test_aspace: Mutex<Option<Arc<Aspace>>>,
}

impl<'a> VmmConsole<'a> {
    pub fn new(vmm: &'a Vmm) -> Self {
        Self {
            vmm,
            test_aspace: Mutex::new(None),
        }
    }

    fn usage(&self) -> Status {
        log::info!("usage:");
        log::info!("vmm aspaces");
        log::info!("vmm alloc <size> <align_log2>");
        log::info!("vmm alloc_physical <paddr> <size> <align_log2>");
        log::info!("vmm alloc_contig <size> <align_log2>");
        log::info!("vmm free_region <address>");
        log::info!("vmm create_test_aspace");
        log::info!("vmm free_test_aspace");
        crate::trek::Error::Generic.to_status()
    }

    fn target(&self) -> Option<Arc<Aspace>> {
        self.test_aspace
            .lock()
            .clone()
            .or_else(|| self.vmm.kernel_aspace().cloned())
    }

    pub fn run(&self, args: &[&str]) -> Status {
        match args {
            ["aspaces"] => {
                for aspace in self.vmm.aspaces() {
                    dump_aspace(self.vmm, &aspace);
                }
                0
            }
            ["alloc", size, align] => {
                let (Some(size), Some(align)) = (parse_num(size), parse_num(align)) else {
                    return self.usage();
                };
                let Some(aspace) = self.target() else {
                    return crate::trek::Error::InvalidArgs.to_status();
                };
                match self.vmm.alloc(
                    &aspace,
                    "alloc test",
                    size as usize,
                    None,
                    align as u8,
                    VmmFlags::empty(),
                    MmuFlags::CACHED,
                ) {
                    Ok(va) => {
                        log::info!("vmm alloc returns {:#x}", va);
                        0
                    }
                    Err(e) => e.to_status(),
                }
            }
            ["alloc_physical", paddr, size, align] => {
                let (Some(paddr), Some(size), Some(align)) =
                    (parse_num(paddr), parse_num(size), parse_num(align))
                else {
                    return self.usage();
                };
                let Some(aspace) = self.target() else {
                    return crate::trek::Error::InvalidArgs.to_status();
                };
                match self.vmm.alloc_physical(
                    &aspace,
                    "physical test",
                    size as usize,
                    None,
                    align as u8,
                    &[paddr],
                    VmmFlags::empty(),
                    MmuFlags::UNCACHED_DEVICE,
                ) {
                    Ok(va) => {
                        log::info!("vmm alloc_physical returns {:#x}", va);
                        0
                    }
                    Err(e) => e.to_status(),
                }
            }
            ["alloc_contig", size, align] => {
                let (Some(size), Some(align)) = (parse_num(size), parse_num(align)) else {
                    return self.usage();
                };
                let Some(aspace) = self.target() else {
                    return crate::trek::Error::InvalidArgs.to_status();
                };
                match self.vmm.alloc_contiguous(
                    &aspace,
                    "contig test",
                    size as usize,
                    None,
                    align as u8,
                    VmmFlags::empty(),
                    MmuFlags::CACHED,
                ) {
                    Ok(va) => {
                        log::info!("vmm alloc_contig returns {:#x}", va);
                        0
                    }
                    Err(e) => e.to_status(),
                }
            }
            ["free_region", address] => {
                let Some(address) = parse_num(address) else {
                    return self.usage();
                };
                let Some(aspace) = self.target() else {
                    return crate::trek::Error::InvalidArgs.to_status();
                };
                match self.vmm.free_region(&aspace, address as VAddr) {
                    Ok(()) => 0,
                    Err(e) => e.to_status(),
                }
            }
            ["create_test_aspace"] => {
                match self.vmm.create_aspace("test", AspaceFlags::empty()) {
                    Ok(aspace) => {
                        log::info!("created test aspace at {:#x}", aspace.base());
                        *self.test_aspace.lock() = Some(aspace);
                        0
                    }
                    Err(e) => e.to_status(),
                }
            }
            ["free_test_aspace"] => {
                let Some(aspace) = self.test_aspace.lock().take() else {
                    return crate::trek::Error::NotFound.to_status();
                };
                match self.vmm.free_aspace(&aspace) {
                    Ok(()) => 0,
                    Err(e) => e.to_status(),
                }
            }
            _ => self.usage(),
        }
    }
}
