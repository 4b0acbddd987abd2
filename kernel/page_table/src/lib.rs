//! Two-level 32-bit x86 paging with lazily materialized mappings.
//!
//! A [`PageTable`] owns one hardware page directory. At construction the
//! first 4 MiB of the address space are identity-mapped through directory
//! entry 0 (the region every address space shares with the kernel), and
//! the last directory entry is pointed back at the directory itself.
//! That recursive self-map is what keeps the paging structures reachable
//! after paging is switched on: the directory appears at `0xFFFF_F000`
//! and the page table for directory index `d` at `0xFFC0_0000 | (d << 12)`.
//!
//! Nothing else is mapped up front. The first touch of a legitimate
//! virtual address page-faults, and [`Paging::handle_fault`] materializes
//! the missing page table and frame on the spot. Which addresses are
//! legitimate is decided by the [`FaultRegion`]s (VM pools) registered
//! with the current page table.
//!
//! [`Paging`] carries the process-wide paging state: the frame pools,
//! the shared region size, which table is loaded, and whether paging is
//! on.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod test;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use addr_space::{recursive_pd_mut, recursive_pt_mut, table_mut, PhysMap};
use bitflags::bitflags;
use frame_pool::{ContFramePool, PoolRegistry};
use kernel_config::memory::{ADDRESSABILITY_PER_PD_ENTRY, ENTRIES_PER_PAGE_TABLE, PAGE_SHIFT, PAGE_SIZE, RECURSIVE_PD_INDEX};
use machine::CtrlRegs;
use memory_structs::{Frame, VirtualAddress};
use spin::Mutex;

bitflags! {
    /// The low control bits of a page directory or page table entry.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct EntryFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
    }
}

/// Builds an entry referring to `frame` with the given flags; the high
/// 20 bits of an entry are the referent's frame number.
fn entry(frame: Frame, flags: EntryFlags) -> u32 {
    (frame.number() << PAGE_SHIFT) | flags.bits()
}

fn entry_frame(e: u32) -> Frame {
    Frame::from_number(e >> PAGE_SHIFT)
}

fn entry_present(e: u32) -> bool {
    EntryFlags::from_bits_truncate(e).contains(EntryFlags::PRESENT)
}

/// An address region that can vouch for faulting addresses — implemented
/// by VM pools, which also know which frame pool backs their pages.
pub trait FaultRegion: Send + Sync {
    /// Whether `addr` falls inside memory this region has handed out.
    fn is_legitimate(&self, addr: VirtualAddress) -> bool;
    /// The frame pool that backs this region's pages.
    fn backing_pool(&self) -> &'static ContFramePool;
}

/// Process-wide paging state: configured once at boot, before the first
/// [`PageTable`] is built.
pub struct Paging {
    regs: &'static dyn CtrlRegs,
    phys: &'static dyn PhysMap,
    kernel_pool: &'static ContFramePool,
    process_pool: &'static ContFramePool,
    registry: &'static PoolRegistry,
    shared_size: u32,
    enabled: AtomicBool,
    current: Mutex<Option<&'static PageTable>>,
}

impl Paging {
    /// Records the frame pools and the size of the shared, direct-mapped
    /// region (at most the 4 MiB one directory entry can cover).
    pub fn new(
        regs: &'static dyn CtrlRegs,
        phys: &'static dyn PhysMap,
        kernel_pool: &'static ContFramePool,
        process_pool: &'static ContFramePool,
        registry: &'static PoolRegistry,
        shared_size: u32,
    ) -> Result<Paging, &'static str> {
        if shared_size == 0 || shared_size > ADDRESSABILITY_PER_PD_ENTRY {
            return Err("shared region must fit in directory entry 0");
        }
        if shared_size % PAGE_SIZE != 0 {
            return Err("shared region must be a whole number of pages");
        }
        debug!("paging subsystem configured, {} shared bytes", shared_size);
        Ok(Paging {
            regs,
            phys,
            kernel_pool,
            process_pool,
            registry,
            shared_size,
            enabled: AtomicBool::new(false),
            current: Mutex::new(None),
        })
    }

    /// Turns on address translation: from here on, every access goes
    /// through the loaded page table.
    pub fn enable_paging(&self) {
        self.regs.write_cr0(self.regs.read_cr0() | 0x8000_0000);
        self.enabled.store(true, Ordering::SeqCst);
        debug!("paging enabled");
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// The page table most recently loaded into CR3, if any.
    pub fn current_table(&self) -> Option<&'static PageTable> {
        *self.current.lock()
    }

    fn is_current(&self, table: &PageTable) -> bool {
        self.current_table()
            .is_some_and(|cur| core::ptr::eq(cur, table))
    }

    /// Handles a page fault described by the hardware error code, reading
    /// the faulting address from CR2.
    ///
    /// A non-present fault at an address some registered region vouches
    /// for gets its page table (if missing) and its frame materialized.
    /// Everything else — a protection violation, or an address no region
    /// claims — is a kernel bug and fatal.
    pub fn handle_fault(&self, err_code: u32) {
        let err = err_code & 0x7;
        let present = err & 0x1 != 0;
        let write = err & 0x2 != 0;
        let user = err & 0x4 != 0;

        if present {
            error!("protection fault, error code {:#X}", err);
            panic!("page-level protection fault");
        }

        let faddr = VirtualAddress::new(self.regs.read_cr2());
        let table = match self.current_table() {
            Some(t) => t,
            None => {
                error!("page fault at {} with no page table loaded", faddr);
                panic!("page fault before a page table was loaded");
            }
        };
        let region = match table.region_claiming(faddr) {
            Some(r) => r,
            None => {
                error!("page fault at unregistered address {}", faddr);
                panic!("page fault at an address no VM pool claims");
            }
        };

        let pd_index = faddr.pd_index();
        let pt_index = faddr.pt_index();

        // Materialize the page table itself if this 4 MiB slot has never
        // been touched.
        let pde = table.directory()[pd_index as usize];
        if !entry_present(pde) {
            let table_frame = match self.process_pool.get_frames(1) {
                Some(f) => f,
                None => panic!("out of frames for a page table"),
            };
            table.directory()[pd_index as usize] =
                entry(table_frame, EntryFlags::PRESENT | EntryFlags::WRITABLE);
            // A fresh frame holds garbage that would read as live
            // mappings; clear it before the entry can be walked.
            table.page_table(pd_index).fill(0);
            trace!("installed page table {:?} for directory slot {}", table_frame, pd_index);
        }

        // The shared low region is backed by the kernel pool; everything
        // above it by the claiming region's own pool.
        let frame_source = if pd_index == 0 {
            self.kernel_pool
        } else {
            region.backing_pool()
        };
        let frame = match frame_source.get_frames(1) {
            Some(f) => f,
            None => panic!("out of frames while handling a page fault"),
        };

        let mut flags = EntryFlags::PRESENT;
        if write {
            flags |= EntryFlags::WRITABLE;
        }
        if user {
            flags |= EntryFlags::USER;
        }
        table.page_table(pd_index)[pt_index as usize] = entry(frame, flags);
        trace!("mapped {} to {:?}", faddr, frame);
    }

    /// Two access paths to a paging structure frame: through the
    /// recursive window once this table is loaded and paging is on,
    /// directly through physical memory before that.
    #[allow(clippy::mut_from_ref)]
    fn structure_mut(&self, table: &PageTable, frame: Frame, window: VirtualAddress) -> &mut [u32; 1024] {
        if self.enabled() && self.is_current(table) {
            // Safety: the recursive self-map is installed at construction
            // and the window address names this structure exactly.
            unsafe {
                if window == addr_space::recursive_pd_address() {
                    recursive_pd_mut()
                } else {
                    recursive_pt_mut(window.pt_index())
                }
            }
        } else {
            // Safety: paging is off (or this table is not loaded), so the
            // frame is reachable at its physical address, and all paging-
            // structure access is serialized by the single-CPU discipline.
            unsafe { table_mut(self.phys, frame) }
        }
    }
}

/// One address space: a page directory and the VM pools registered to
/// live inside it.
pub struct PageTable {
    paging: &'static Paging,
    directory_frame: Frame,
    vm_pools: Mutex<Vec<&'static dyn FaultRegion>>,
}

impl PageTable {
    /// Builds a fresh address space: directory and first page table come
    /// from the process pool, the shared region is identity-mapped, and
    /// the final directory entry is the recursive self-map.
    pub fn new(paging: &'static Paging) -> Result<PageTable, &'static str> {
        let directory_frame = paging
            .process_pool
            .get_frames(1)
            .ok_or("could not allocate a page directory frame")?;
        let shared_table_frame = paging
            .process_pool
            .get_frames(1)
            .ok_or("could not allocate the shared page table frame")?;

        let table = PageTable {
            paging,
            directory_frame,
            vm_pools: Mutex::new(Vec::new()),
        };

        // Identity-map the shared region: page i at address i * PAGE_SIZE.
        // This runs before paging is enabled, so both structures are
        // written through their physical addresses.
        let shared = unsafe { table_mut(paging.phys, shared_table_frame) };
        let shared_pages = paging.shared_size / PAGE_SIZE;
        for (i, e) in shared.iter_mut().enumerate() {
            *e = if (i as u32) < shared_pages {
                entry(
                    Frame::from_number(i as u32),
                    EntryFlags::PRESENT | EntryFlags::WRITABLE,
                )
            } else {
                0
            };
        }

        let directory = unsafe { table_mut(paging.phys, directory_frame) };
        directory[0] = entry(shared_table_frame, EntryFlags::PRESENT | EntryFlags::WRITABLE);
        for e in directory[1..(ENTRIES_PER_PAGE_TABLE - 1) as usize].iter_mut() {
            *e = EntryFlags::WRITABLE.bits();
        }
        directory[RECURSIVE_PD_INDEX as usize] =
            entry(directory_frame, EntryFlags::PRESENT | EntryFlags::WRITABLE);

        debug!("constructed page table, directory at {:?}", directory_frame);
        Ok(table)
    }

    /// The frame holding this table's page directory.
    pub fn directory_frame(&self) -> Frame {
        self.directory_frame
    }

    /// Loads this table: it becomes the current address space the next
    /// accesses translate through.
    pub fn load(&'static self) {
        *self.paging.current.lock() = Some(self);
        self.paging
            .regs
            .write_cr3(self.directory_frame.start_address().value());
        debug!("loaded page table, directory at {:?}", self.directory_frame);
    }

    /// Makes `pool`'s addresses legitimate in this address space.
    pub fn register_pool(&self, pool: &'static dyn FaultRegion) {
        self.vm_pools.lock().push(pool);
    }

    fn region_claiming(&self, addr: VirtualAddress) -> Option<&'static dyn FaultRegion> {
        self.vm_pools
            .lock()
            .iter()
            .copied()
            .find(|p| p.is_legitimate(addr))
    }

    /// The frame currently mapped at `addr`, if its page is present.
    pub fn translate(&self, addr: VirtualAddress) -> Option<Frame> {
        let pde = self.directory()[addr.pd_index() as usize];
        if !entry_present(pde) {
            return None;
        }
        let pte = self.page_table(addr.pd_index())[addr.pt_index() as usize];
        entry_present(pte).then(|| entry_frame(pte))
    }

    /// Unmaps the page containing `addr` and returns its backing frame to
    /// whichever pool owns it, then flushes the TLB.
    ///
    /// A page that was never materialized (missing table or non-present
    /// entry) is left alone; there is no frame to release.
    pub fn free_page(&self, addr: VirtualAddress) {
        let pde = self.directory()[addr.pd_index() as usize];
        if !entry_present(pde) {
            return;
        }
        let table = self.page_table(addr.pd_index());
        let pte = table[addr.pt_index() as usize];
        if !entry_present(pte) {
            return;
        }

        self.paging.registry.release_frames(entry_frame(pte));
        // Drop the present bit and the frame address, keep the rest.
        table[addr.pt_index() as usize] = pte & 0xFFE;
        // Rewriting CR3 with itself flushes the TLB.
        self.paging.regs.write_cr3(self.paging.regs.read_cr3());
        trace!("freed page at {}", addr);
    }

    /// The page directory of this address space.
    #[allow(clippy::mut_from_ref)]
    fn directory(&self) -> &mut [u32; 1024] {
        self.paging
            .structure_mut(self, self.directory_frame, addr_space::recursive_pd_address())
    }

    /// The page table installed in directory slot `pd_index`, which must
    /// be present.
    #[allow(clippy::mut_from_ref)]
    fn page_table(&self, pd_index: u32) -> &mut [u32; 1024] {
        let frame = entry_frame(self.directory()[pd_index as usize]);
        self.paging
            .structure_mut(self, frame, addr_space::recursive_pt_address(pd_index))
    }
}
