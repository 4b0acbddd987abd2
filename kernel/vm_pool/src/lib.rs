//! Pools of virtual address space.
//!
//! A [`VmPool`] owns one contiguous window of a process's virtual
//! addresses and hands out regions of it. Nothing is mapped when a region
//! is allocated: the pool only records the range, and the page-fault
//! handler materializes frames page by page as the region is touched.
//! The pool's own bookkeeping — a fixed-capacity array of regions — lives
//! inside the window it manages, in the pool's first page, and is itself
//! materialized by the first fault.
//!
//! Region sizes are kept in bytes and rounded up to whole pages, so the
//! same arithmetic serves allocation, release, and legitimacy checks.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod test;

use alloc::boxed::Box;

use addr_space::ActiveSpace;
use frame_pool::ContFramePool;
use kernel_config::memory::PAGE_SIZE;
use memory_structs::{round_up_to_pages, VirtualAddress};
use page_table::{FaultRegion, PageTable};
use spin::Mutex;

/// One allocated region: a half-open byte range
/// `[address, address + size)`. A zero size marks a free slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
struct Region {
    address: u32,
    size: u32,
}

impl Region {
    const EMPTY: Region = Region { address: 0, size: 0 };

    fn in_use(&self) -> bool {
        self.size != 0
    }

    fn contains(&self, addr: VirtualAddress) -> bool {
        self.in_use() && addr.value() >= self.address && addr.value() - self.address < self.size
    }

    fn end(&self) -> u32 {
        self.address + self.size
    }
}

/// The region array fills the pool's first page exactly.
const REGION_CAPACITY: usize = PAGE_SIZE as usize / core::mem::size_of::<Region>();

/// A window `[base, base + size)` of one address space, with its region
/// array stored at `base`.
pub struct VmPool {
    space: &'static dyn ActiveSpace,
    base: VirtualAddress,
    size: u32,
    frame_pool: &'static ContFramePool,
    page_table: &'static PageTable,
    /// Serializes all region-array access. The array itself lives in the
    /// managed window, not in this struct.
    regions_lock: Mutex<()>,
}

impl VmPool {
    /// Creates a pool over `[base, base + size)`, registers it with the
    /// page table, and seeds the region array with its own descriptor.
    ///
    /// The pool is leaked into a `&'static` reference because address
    /// spaces live until shutdown and the page table keeps a reference.
    pub fn create(
        space: &'static dyn ActiveSpace,
        base: VirtualAddress,
        size: u32,
        frame_pool: &'static ContFramePool,
        page_table: &'static PageTable,
    ) -> Result<&'static VmPool, &'static str> {
        if base.value() <= 4 * 1024 * 1024 {
            return Err("VM pools must live above the shared 4 MiB region");
        }
        if !base.is_page_aligned() {
            return Err("VM pool base must be page-aligned");
        }
        if size < 2 * PAGE_SIZE || size % PAGE_SIZE != 0 {
            return Err("VM pool must cover at least two whole pages");
        }

        let pool: &'static VmPool = Box::leak(Box::new(VmPool {
            space,
            base,
            size,
            frame_pool,
            page_table,
            regions_lock: Mutex::new(()),
        }));

        // Registration must precede the first touch of the region array:
        // that touch faults, and the handler consults the registered
        // pools to approve it.
        page_table.register_pool(pool);

        pool.with_regions(|regions| {
            regions.fill(Region::EMPTY);
            // Slot 0 describes the page the array itself occupies.
            regions[0] = Region {
                address: base.value(),
                size: PAGE_SIZE,
            };
        });

        debug!("VM pool created at {}, {} bytes", base, size);
        Ok(pool)
    }

    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// The number of in-use regions, not counting the region array's own
    /// descriptor.
    pub fn allocated_regions(&self) -> usize {
        self.with_regions(|regions| regions[1..].iter().filter(|r| r.in_use()).count())
    }

    /// Reserves `size` bytes (rounded up to whole pages) and returns the
    /// region's starting address, or `None` if no gap fits.
    ///
    /// Regions are placed at the lowest gap: slots are scanned in index
    /// order, and a new region starts where the preceding in-use region
    /// ends. No page is mapped here; first touches fault the frames in.
    pub fn allocate(&self, size: u32) -> Option<VirtualAddress> {
        if size == 0 {
            return None;
        }
        let size = round_up_to_pages(size);
        let pool_end = self.base.value() as u64 + self.size as u64;

        let addr = self.with_regions(|regions| {
            for index in 1..REGION_CAPACITY {
                if regions[index].in_use() {
                    continue;
                }
                // The candidate gap starts where the last in-use region
                // before this slot ends...
                let candidate = regions[..index]
                    .iter()
                    .rev()
                    .find(|r| r.in_use())
                    .map(|r| r.end())
                    // ...or at the window base if there is none, which
                    // cannot happen while slot 0 holds the region array.
                    .unwrap_or(self.base.value());
                // ...and is bounded by the next in-use region, or the end
                // of the window.
                let bound = regions[index + 1..]
                    .iter()
                    .find(|r| r.in_use())
                    .map(|r| r.address as u64)
                    .unwrap_or(pool_end);

                if candidate as u64 + size as u64 <= bound {
                    regions[index] = Region {
                        address: candidate,
                        size,
                    };
                    return Some(VirtualAddress::new(candidate));
                }
            }
            None
        });

        match addr {
            Some(a) => {
                debug!("allocated {} bytes at {}", size, a);
                Some(a)
            }
            None => {
                error!("no gap of {} bytes left in VM pool at {}", size, self.base);
                None
            }
        }
    }

    /// Releases the region starting at `addr`, unmapping and returning
    /// every one of its pages.
    ///
    /// Panics if `addr` is outside the pool, names no allocated region,
    /// or is the region array itself.
    pub fn release(&self, addr: VirtualAddress) {
        if addr < self.base || addr.value() - self.base.value() >= self.size {
            error!("release of {} which is outside this pool", addr);
            panic!("release outside the VM pool");
        }
        if addr == self.base {
            error!("attempt to release the region array at {}", addr);
            panic!("the region array cannot be released");
        }

        let size = self.with_regions(|regions| {
            let slot = regions[1..].iter_mut().find(|r| r.address == addr.value() && r.in_use());
            match slot {
                Some(region) => {
                    let size = region.size;
                    *region = Region::EMPTY;
                    Some(size)
                }
                None => None,
            }
        });
        let size = match size {
            Some(s) => s,
            None => {
                error!("release of {} which names no region", addr);
                panic!("release of an unallocated region");
            }
        };

        // Unmap every page the region spanned; pages never touched are
        // skipped by free_page.
        let mut offset = 0;
        while offset < size {
            self.page_table.free_page(addr + offset);
            offset += PAGE_SIZE;
        }
        debug!("released {} bytes at {}", size, addr);
    }

    /// Runs `f` over the region array, which lives in the pool's first
    /// page and is reached through the active address space.
    fn with_regions<R>(&self, f: impl FnOnce(&mut [Region]) -> R) -> R {
        let _guard = self.regions_lock.lock();
        // Safety: the array occupies exactly the first page of a window
        // this pool owns; the lock serializes all views of it.
        let regions = unsafe {
            core::slice::from_raw_parts_mut(
                self.space.virt_ptr(self.base) as *mut Region,
                REGION_CAPACITY,
            )
        };
        f(regions)
    }
}

impl FaultRegion for VmPool {
    /// Whether a faulting address is one this pool has handed out.
    ///
    /// The region array's page is approved by address comparison alone,
    /// before the array is consulted: the very fault that materializes
    /// the array arrives while the array is still unreadable (and, on the
    /// first touch, while the region lock is held by `create`).
    fn is_legitimate(&self, addr: VirtualAddress) -> bool {
        if addr == self.base {
            return true;
        }
        if addr.value() < 4 * 1024 * 1024 {
            return false;
        }
        if addr < self.base || addr.value() - self.base.value() >= self.size {
            return false;
        }
        self.with_regions(|regions| regions.iter().any(|r| r.contains(addr)))
    }

    fn backing_pool(&self) -> &'static ContFramePool {
        self.frame_pool
    }
}
