//! Unit tests for page table construction and fault handling, run with
//! paging "off" over mocked physical memory so every structure is
//! reachable at its physical address.

extern crate std;

use std::boxed::Box;

use mock_machine::{MockInterrupts, MockPhysMemory, MockRegs};

use super::*;

fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

struct Fixture {
    regs: &'static MockRegs,
    phys: &'static MockPhysMemory,
    kernel_pool: &'static ContFramePool,
    process_pool: &'static ContFramePool,
}

/// Boot-shaped memory: a self-hosted kernel pool at frames `[512, 768)`
/// and a process pool at `[1024, 1536)` whose bitmap frame comes from the
/// kernel pool.
fn fixture(shared_size: u32) -> (&'static Fixture, &'static Paging) {
    let ints = leak(MockInterrupts::new());
    let regs = leak(MockRegs::new());
    let phys = leak(MockPhysMemory::new(Frame::from_number(512), 1024));

    let kernel_pool =
        leak(ContFramePool::new(ints, phys, Frame::from_number(512), 256, None, 1).unwrap());
    let info = kernel_pool
        .get_frames(frame_pool::needed_info_frames(512))
        .unwrap();
    let process_pool = leak(
        ContFramePool::new(ints, phys, Frame::from_number(1024), 512, Some(info), 1).unwrap(),
    );
    let registry = leak(PoolRegistry::new());
    registry.register(kernel_pool);
    registry.register(process_pool);

    let paging = leak(
        Paging::new(regs, phys, kernel_pool, process_pool, registry, shared_size).unwrap(),
    );
    let fx = leak(Fixture {
        regs,
        phys,
        kernel_pool,
        process_pool,
    });
    (fx, paging)
}

/// A region that vouches for one window of addresses and charges its
/// frames to the given pool.
struct Window {
    base: u32,
    size: u32,
    pool: &'static ContFramePool,
}

impl FaultRegion for Window {
    fn is_legitimate(&self, addr: VirtualAddress) -> bool {
        addr.value() >= self.base && addr.value() - self.base < self.size
    }
    fn backing_pool(&self) -> &'static ContFramePool {
        self.pool
    }
}

fn raw_table(fx: &Fixture, frame: Frame) -> &'static [u32; 1024] {
    unsafe { &*(addr_space::table_mut(fx.phys, frame) as *mut [u32; 1024] as *const _) }
}

#[test]
fn construction_identity_maps_the_shared_region() {
    let (fx, paging) = fixture(kernel_config::memory::SHARED_SIZE);
    let table = leak(PageTable::new(paging).unwrap());

    // Directory and shared table are the first two process-pool frames.
    assert_eq!(table.directory_frame(), Frame::from_number(1024));
    let directory = raw_table(fx, table.directory_frame());
    let shared_frame = Frame::from_number(directory[0] >> 12);
    assert_eq!(shared_frame, Frame::from_number(1025));
    assert_eq!(directory[0] & 0x3, 0x3);

    // Every middle entry is writable-but-absent; the last is recursive.
    for d in 1..1023 {
        assert_eq!(directory[d], 0x2);
    }
    assert_eq!(directory[1023], (1024 << 12) | 0x3);

    let shared = raw_table(fx, shared_frame);
    for (i, e) in shared.iter().enumerate() {
        assert_eq!(*e, ((i as u32) << 12) | 0x3);
    }
}

#[test]
fn load_writes_cr3_and_enable_sets_the_paging_bit() {
    let (fx, paging) = fixture(kernel_config::memory::SHARED_SIZE);
    let table = leak(PageTable::new(paging).unwrap());

    table.load();
    assert_eq!(fx.regs.read_cr3(), 1024 << 12);
    assert!(paging.current_table().is_some());

    assert!(!paging.enabled());
    paging.enable_paging();
    assert!(fx.regs.read_cr0() & 0x8000_0000 != 0);
    assert!(paging.enabled());
}

#[test]
fn a_first_touch_materializes_table_and_frame() {
    let (fx, paging) = fixture(kernel_config::memory::SHARED_SIZE);
    let table = leak(PageTable::new(paging).unwrap());
    table.load();

    let window = leak(Window {
        base: 0x0080_0000,
        size: 0x0010_0000,
        pool: fx.process_pool,
    });
    table.register_pool(window);

    let free_before = fx.process_pool.n_free_frames();
    let faddr = VirtualAddress::new(0x0080_0000);
    assert_eq!(faddr.pd_index(), 2);
    assert!(table.translate(faddr).is_none());

    // Non-present read fault in supervisor mode.
    fx.regs.set_cr2(faddr);
    paging.handle_fault(0x0);

    // One frame went to the new page table, one to the page itself.
    assert_eq!(fx.process_pool.n_free_frames(), free_before - 2);

    let directory = raw_table(fx, table.directory_frame());
    let pde = directory[2];
    assert_eq!(pde & 0x3, 0x3);
    let pt = raw_table(fx, Frame::from_number(pde >> 12));
    let pte = pt[0];
    // A read fault maps the page present but not writable.
    assert_eq!(pte & 0xFFF, 0x1);
    assert_eq!(table.translate(faddr), Some(Frame::from_number(pte >> 12)));

    // Neighboring slots of the fresh table were zeroed, not left as
    // whatever the frame held before.
    assert!(pt[1..].iter().all(|e| *e == 0));
}

#[test]
fn a_write_fault_maps_the_page_writable() {
    let (fx, paging) = fixture(kernel_config::memory::SHARED_SIZE);
    let table = leak(PageTable::new(paging).unwrap());
    table.load();
    table.register_pool(leak(Window {
        base: 0x0080_0000,
        size: 0x0010_0000,
        pool: fx.process_pool,
    }));

    let faddr = VirtualAddress::new(0x0080_5000);
    fx.regs.set_cr2(faddr);
    paging.handle_fault(0x2); // write, not present, supervisor

    let directory = raw_table(fx, table.directory_frame());
    let pt = raw_table(fx, Frame::from_number(directory[2] >> 12));
    assert_eq!(pt[5] & 0xFFF, 0x3);
}

#[test]
fn a_user_fault_sets_the_user_bit() {
    let (fx, paging) = fixture(kernel_config::memory::SHARED_SIZE);
    let table = leak(PageTable::new(paging).unwrap());
    table.load();
    table.register_pool(leak(Window {
        base: 0x0080_0000,
        size: 0x0010_0000,
        pool: fx.process_pool,
    }));

    fx.regs.set_cr2(VirtualAddress::new(0x0080_1000));
    paging.handle_fault(0x6); // write, not present, from user mode

    let directory = raw_table(fx, table.directory_frame());
    let pt = raw_table(fx, Frame::from_number(directory[2] >> 12));
    assert_eq!(pt[1] & 0xFFF, 0x7);
}

#[test]
fn faults_below_the_shared_region_draw_from_the_kernel_pool() {
    // A shared region of 1 MiB leaves the rest of directory slot 0
    // unmapped; touching it should charge the kernel pool.
    let (fx, paging) = fixture(0x0010_0000);
    let table = leak(PageTable::new(paging).unwrap());
    table.load();
    table.register_pool(leak(Window {
        base: 0x0020_0000,
        size: 0x0010_0000,
        pool: fx.process_pool,
    }));

    let kernel_free = fx.kernel_pool.n_free_frames();
    let process_free = fx.process_pool.n_free_frames();

    fx.regs.set_cr2(VirtualAddress::new(0x0020_0000));
    paging.handle_fault(0x0);

    assert_eq!(fx.kernel_pool.n_free_frames(), kernel_free - 1);
    // The shared page table already exists, so the process pool is
    // untouched.
    assert_eq!(fx.process_pool.n_free_frames(), process_free);
}

#[test]
fn free_page_returns_the_frame_and_flushes_the_tlb() {
    let (fx, paging) = fixture(kernel_config::memory::SHARED_SIZE);
    let table = leak(PageTable::new(paging).unwrap());
    table.load();
    table.register_pool(leak(Window {
        base: 0x0080_0000,
        size: 0x0010_0000,
        pool: fx.process_pool,
    }));

    let faddr = VirtualAddress::new(0x0080_3000);
    fx.regs.set_cr2(faddr);
    paging.handle_fault(0x2);
    let free_after_fault = fx.process_pool.n_free_frames();
    let flushes_before = fx.regs.cr3_writes.load(core::sync::atomic::Ordering::SeqCst);

    table.free_page(faddr);

    assert_eq!(fx.process_pool.n_free_frames(), free_after_fault + 1);
    assert!(table.translate(faddr).is_none());
    assert!(fx.regs.cr3_writes.load(core::sync::atomic::Ordering::SeqCst) > flushes_before);

    // Freeing an address that was never touched changes nothing.
    table.free_page(VirtualAddress::new(0x0080_9000));
    assert_eq!(fx.process_pool.n_free_frames(), free_after_fault + 1);
}

#[test]
#[should_panic(expected = "no VM pool claims")]
fn a_fault_outside_every_region_is_fatal() {
    let (fx, paging) = fixture(kernel_config::memory::SHARED_SIZE);
    let table = leak(PageTable::new(paging).unwrap());
    table.load();

    fx.regs.set_cr2(VirtualAddress::new(0x4000_0000));
    paging.handle_fault(0x0);
}

#[test]
#[should_panic(expected = "protection fault")]
fn a_protection_fault_is_fatal() {
    let (fx, paging) = fixture(kernel_config::memory::SHARED_SIZE);
    let table = leak(PageTable::new(paging).unwrap());
    table.load();

    fx.regs.set_cr2(VirtualAddress::new(0x0000_1000));
    paging.handle_fault(0x3);
}
