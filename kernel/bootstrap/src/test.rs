//! Integration tests: boot the whole substrate over the mocks and drive
//! it end to end.

extern crate std;

use std::boxed::Box;

use memory_structs::PhysicalAddress;
use mock_machine::{
    MockActiveSpace, MockAtaPorts, MockDispatcher, MockInterrupts, MockPhysMemory, MockRegs,
};
use thread::Thread;

use super::*;

fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

fn nop() {}

struct Mocks {
    regs: &'static MockRegs,
    ports: &'static MockAtaPorts,
    dispatcher: &'static MockDispatcher,
}

/// A scaled-down standard layout: the same shape as the real memory map
/// (self-hosted kernel pool, process pool with an external bitmap and a
/// memory hole), small enough to mock comfortably.
fn boot() -> (Mocks, &'static System) {
    let regs = leak(MockRegs::new());
    let ints = leak(MockInterrupts::new());
    let ports = leak(MockAtaPorts::new(16));
    let dispatcher = leak(MockDispatcher::new());
    let phys = leak(MockPhysMemory::new(Frame::from_number(512), 1536));
    let space = leak(MockActiveSpace::new(
        VirtualAddress::new(0x0080_0000),
        0x0010_0000,
    ));

    let hw = Hardware {
        regs,
        ints,
        ports,
        phys,
        space,
        dispatcher,
    };
    let layout = SystemLayout {
        kernel_pool_base: Frame::from_number(512),
        kernel_pool_frames: 512,
        process_pool_base: Frame::from_number(1024),
        process_pool_frames: 1024,
        mem_hole_base: Frame::from_number(1536),
        mem_hole_frames: 256,
        shared_size: kernel_config::memory::SHARED_SIZE,
        vm_pool_base: VirtualAddress::new(0x0080_0000),
        vm_pool_size: 0x0010_0000,
        disk_drive: DriveSelect::Master,
        disk_size: ports.size_in_bytes(),
        idle_stack_size: 1024,
    };
    let system = bootstrap(hw, layout).unwrap();
    (
        Mocks {
            regs,
            ports,
            dispatcher,
        },
        system,
    )
}

#[test]
fn boot_accounts_for_every_reserved_frame() {
    let (_mocks, sys) = boot();
    // The kernel pool lost its own bitmap frame and the frame lent to
    // the process pool's bitmap.
    assert_eq!(sys.kernel_pool.n_free_frames(), 510);
    // The process pool lost the memory hole and the paging structures:
    // the page directory and the shared page table.
    assert_eq!(sys.process_pool.n_free_frames(), 1024 - 256 - 2);
}

#[test]
fn boot_loads_the_page_table_and_enables_paging() {
    let (mocks, sys) = boot();
    assert_eq!(
        PhysicalAddress::new(mocks.regs.read_cr3()),
        sys.page_table.directory_frame().start_address()
    );
    assert!(mocks.regs.read_cr0() & 0x8000_0000 != 0);
    assert!(sys.paging.enabled());
}

#[test]
fn boot_wires_the_vm_pool_and_file_system() {
    let (_mocks, sys) = boot();
    assert_eq!(sys.vm_pool.base().value(), 0x0080_0000);
    // The first region lands right after the region array.
    let region = sys.vm_pool.allocate(4096).unwrap();
    assert_eq!(region.value(), 0x0080_1000);
    assert_eq!(sys.fs.capacity(), 16);
}

#[test]
fn threads_round_robin_through_the_booted_scheduler() {
    let (mocks, sys) = boot();
    let a = Thread::new(nop, 256).unwrap();
    let b = Thread::new(nop, 256).unwrap();
    let c = Thread::new(nop, 256).unwrap();
    mocks.dispatcher.set_current(&a);
    sys.scheduler.add(&b);
    sys.scheduler.add(&c);

    sys.scheduler.yield_now();
    sys.scheduler.yield_now();
    sys.scheduler.yield_now();
    assert_eq!(
        mocks.dispatcher.dispatched_ids(),
        [b.id(), c.id(), a.id()]
    );
}

#[test]
fn a_blocked_reader_is_woken_by_a_later_yield() {
    let (mocks, sys) = boot();
    let t1 = Thread::new(nop, 256).unwrap();
    let t2 = Thread::new(nop, 256).unwrap();
    mocks.dispatcher.set_current(&t1);
    sys.scheduler.add(&t2);

    mocks.ports.fill_block(0, &[0x42; 512]);
    mocks.ports.set_not_ready_status_reads(1);
    let mut buf = [0u8; 512];
    sys.disk.read(0, &mut buf);
    assert_eq!(buf, [0x42; 512]);

    // t1 parked on the disk and t2 got the CPU; the next yield finds the
    // disk ready and t1 comes back through the ready queue.
    assert_eq!(sys.disk.waiter_count(), 1);
    assert_eq!(mocks.dispatcher.dispatched_ids(), [t2.id()]);
    sys.scheduler.yield_now();
    assert_eq!(sys.disk.waiter_count(), 0);
    assert_eq!(mocks.dispatcher.dispatched_ids(), [t2.id(), t1.id()]);
}

#[test]
fn files_survive_the_whole_stack() {
    let (mocks, sys) = boot();
    let t = Thread::new(nop, 256).unwrap();
    mocks.dispatcher.set_current(&t);

    let file = sys.fs.create_file(5).unwrap();
    {
        let mut file = file.lock();
        assert_eq!(file.write(b"abc"), 3);
        file.reset();
        let mut buf = [0u8; 10];
        assert_eq!(file.read(&mut buf), 3);
        assert_eq!(&buf[..3], b"abc");
    }
    sys.fs.delete_file(5).unwrap();
    assert_eq!(mocks.ports.block(5), [0u8; 512]);
    assert!(sys.fs.lookup_file(5).is_none());
}
