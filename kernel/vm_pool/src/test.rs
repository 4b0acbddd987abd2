//! Unit tests for VM pools over a mocked address space: region placement,
//! release of every page, and fault legitimacy.

extern crate std;

use std::boxed::Box;

use frame_pool::PoolRegistry;
use memory_structs::Frame;
use mock_machine::{MockActiveSpace, MockInterrupts, MockPhysMemory, MockRegs};
use page_table::Paging;

use super::*;

const WINDOW_BASE: u32 = 0x0080_0000;
const WINDOW_SIZE: u32 = 0x0010_0000; // 1 MiB, 256 pages
const PAGE: u32 = PAGE_SIZE;

fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

struct Fixture {
    regs: &'static MockRegs,
    process_pool: &'static ContFramePool,
    page_table: &'static PageTable,
    paging: &'static Paging,
    pool: &'static VmPool,
}

fn fixture() -> Fixture {
    let ints = leak(MockInterrupts::new());
    let regs = leak(MockRegs::new());
    let phys = leak(MockPhysMemory::new(Frame::from_number(512), 1024));

    let kernel_pool =
        leak(ContFramePool::new(ints, phys, Frame::from_number(512), 256, None, 1).unwrap());
    let info = kernel_pool.get_frames(1).unwrap();
    let process_pool = leak(
        ContFramePool::new(ints, phys, Frame::from_number(1024), 512, Some(info), 1).unwrap(),
    );
    let registry = leak(PoolRegistry::new());
    registry.register(kernel_pool);
    registry.register(process_pool);

    let paging = leak(
        Paging::new(
            regs,
            phys,
            kernel_pool,
            process_pool,
            registry,
            kernel_config::memory::SHARED_SIZE,
        )
        .unwrap(),
    );
    let page_table = leak(PageTable::new(paging).unwrap());
    page_table.load();

    let space = leak(MockActiveSpace::new(
        VirtualAddress::new(WINDOW_BASE),
        WINDOW_SIZE as usize,
    ));
    let pool = VmPool::create(
        space,
        VirtualAddress::new(WINDOW_BASE),
        WINDOW_SIZE,
        process_pool,
        page_table,
    )
    .unwrap();

    Fixture {
        regs,
        process_pool,
        page_table,
        paging,
        pool,
    }
}

/// Touches `addr` the way running code would: by taking the page fault.
fn touch(fx: &Fixture, addr: VirtualAddress) {
    fx.regs.set_cr2(addr);
    fx.paging.handle_fault(0x2);
}

#[test]
fn the_first_region_lands_after_the_region_array() {
    let fx = fixture();
    let a = fx.pool.allocate(3 * PAGE).unwrap();
    assert_eq!(a.value(), WINDOW_BASE + PAGE);
    assert_eq!(fx.pool.allocated_regions(), 1);
}

#[test]
fn sizes_round_up_to_whole_pages() {
    let fx = fixture();
    let a = fx.pool.allocate(1).unwrap();
    let b = fx.pool.allocate(PAGE + 1).unwrap();
    // One byte still consumes a page; the next region starts after it.
    assert_eq!(b.value(), a.value() + PAGE);
    let c = fx.pool.allocate(PAGE).unwrap();
    assert_eq!(c.value(), b.value() + 2 * PAGE);
}

#[test]
fn released_gaps_are_reused_lowest_first() {
    let fx = fixture();
    let a = fx.pool.allocate(2 * PAGE).unwrap();
    let b = fx.pool.allocate(PAGE).unwrap();
    let _c = fx.pool.allocate(PAGE).unwrap();

    fx.pool.release(a);
    // A region no larger than the gap slots back into it.
    assert_eq!(fx.pool.allocate(2 * PAGE), Some(a));
    fx.pool.release(b);
    // One too large for any interior gap goes after the last region.
    let big = fx.pool.allocate(3 * PAGE).unwrap();
    assert!(big.value() > a.value() + 2 * PAGE);
}

#[test]
fn allocation_never_crosses_the_pool_end() {
    let fx = fixture();
    // The window holds 256 pages, one of which is the region array.
    assert!(fx.pool.allocate(WINDOW_SIZE).is_none());
    let all = fx.pool.allocate(WINDOW_SIZE - PAGE).unwrap();
    assert_eq!(all.value(), WINDOW_BASE + PAGE);
    assert!(fx.pool.allocate(PAGE).is_none());
}

#[test]
fn legitimacy_follows_the_recorded_regions() {
    let fx = fixture();
    let a = fx.pool.allocate(2 * PAGE).unwrap();

    // The region array page vouches for itself.
    assert!(fx.pool.is_legitimate(VirtualAddress::new(WINDOW_BASE)));
    assert!(fx.pool.is_legitimate(a));
    assert!(fx.pool.is_legitimate(a + (2 * PAGE - 1)));
    // Just past the region, inside the window, is not allocated.
    assert!(!fx.pool.is_legitimate(a + 2 * PAGE));
    // Below the shared 4 MiB and outside the window are never claimed.
    assert!(!fx.pool.is_legitimate(VirtualAddress::new(0x0010_0000)));
    assert!(!fx.pool.is_legitimate(VirtualAddress::new(
        WINDOW_BASE + WINDOW_SIZE
    )));
}

#[test]
fn touching_an_allocated_region_materializes_pages() {
    let fx = fixture();
    let a = fx.pool.allocate(3 * PAGE).unwrap();
    assert!(fx.page_table.translate(a).is_none());

    let free_before = fx.process_pool.n_free_frames();
    touch(&fx, a);
    // First fault in this 4 MiB slot pays for a page table too.
    assert_eq!(fx.process_pool.n_free_frames(), free_before - 2);
    assert!(fx.page_table.translate(a).is_some());

    touch(&fx, a + PAGE);
    assert_eq!(fx.process_pool.n_free_frames(), free_before - 3);
}

#[test]
fn release_unmaps_every_materialized_page() {
    let fx = fixture();
    let a = fx.pool.allocate(3 * PAGE).unwrap();
    touch(&fx, a);
    touch(&fx, a + 2 * PAGE);

    let free_before = fx.process_pool.n_free_frames();
    fx.pool.release(a);

    // Both touched frames came back; the untouched middle page was
    // skipped rather than releasing garbage.
    assert_eq!(fx.process_pool.n_free_frames(), free_before + 2);
    assert!(fx.page_table.translate(a).is_none());
    assert!(fx.page_table.translate(a + 2 * PAGE).is_none());
    assert_eq!(fx.pool.allocated_regions(), 0);
}

#[test]
#[should_panic(expected = "unallocated region")]
fn releasing_an_unknown_address_is_fatal() {
    let fx = fixture();
    fx.pool.release(VirtualAddress::new(WINDOW_BASE + 5 * PAGE));
}

#[test]
#[should_panic(expected = "region array cannot be released")]
fn releasing_the_region_array_is_fatal() {
    let fx = fixture();
    fx.pool.release(VirtualAddress::new(WINDOW_BASE));
}

#[test]
#[should_panic(expected = "outside the VM pool")]
fn releasing_outside_the_window_is_fatal() {
    let fx = fixture();
    fx.pool.release(VirtualAddress::new(0x0070_0000));
}

#[test]
fn pools_below_the_shared_region_are_rejected() {
    let fx = fixture();
    let space = leak(MockActiveSpace::new(VirtualAddress::new(0x0010_0000), 0x4000));
    assert!(VmPool::create(
        space,
        VirtualAddress::new(0x0010_0000),
        0x4000,
        fx.process_pool,
        fx.page_table,
    )
    .is_err());
}
