//! Brings the kernel's subsystems up in dependency order.
//!
//! The entrypoint hands [`bootstrap`] the hardware collaborators and a
//! [`SystemLayout`]; it builds the frame pools, turns on paging, creates
//! the default VM pool, and wires the scheduler, disk, and file system
//! together. What comes back is a [`System`] of `&'static` handles —
//! boot objects are leaked on purpose, because none of them is ever
//! destroyed. The entrypoint then creates its initial threads, adds them
//! to the scheduler, and calls `yield_now` to start the world.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod test;

use alloc::boxed::Box;

use addr_space::{ActiveSpace, PhysMap};
use ata_disk::{AtaDisk, DriveSelect};
use flat_fs::FileSystem;
use frame_pool::{needed_info_frames, ContFramePool, PoolRegistry};
use kernel_config::memory::{
    DEFAULT_VM_POOL_BASE, DEFAULT_VM_POOL_SIZE, KERNEL_POOL_FRAMES, KERNEL_POOL_START_FRAME,
    MEM_HOLE_FRAMES, MEM_HOLE_START_FRAME, PROCESS_POOL_FRAMES, PROCESS_POOL_START_FRAME,
    SHARED_SIZE,
};
use machine::{CtrlRegs, InterruptFlag, PortIo};
use memory_structs::{Frame, VirtualAddress};
use page_table::{PageTable, Paging};
use scheduler::Scheduler;
use thread::Dispatcher;
use vm_pool::VmPool;

/// The external collaborators everything below is built on.
#[derive(Clone, Copy)]
pub struct Hardware {
    pub regs: &'static dyn CtrlRegs,
    pub ints: &'static dyn InterruptFlag,
    pub ports: &'static dyn PortIo,
    pub phys: &'static dyn PhysMap,
    pub space: &'static dyn ActiveSpace,
    pub dispatcher: &'static dyn Dispatcher,
}

/// Where everything goes: pool placement, the memory hole, the default
/// VM pool window, and the disk geometry.
pub struct SystemLayout {
    pub kernel_pool_base: Frame,
    pub kernel_pool_frames: u32,
    pub process_pool_base: Frame,
    pub process_pool_frames: u32,
    /// A frame range (inside the process pool) that devices own and the
    /// allocator must never hand out; zero frames means no hole.
    pub mem_hole_base: Frame,
    pub mem_hole_frames: u32,
    pub shared_size: u32,
    pub vm_pool_base: VirtualAddress,
    pub vm_pool_size: u32,
    pub disk_drive: DriveSelect,
    pub disk_size: u32,
    pub idle_stack_size: usize,
}

impl SystemLayout {
    /// The standard layout from `kernel_config`, over a master disk of
    /// `disk_size` bytes.
    pub fn standard(disk_size: u32) -> SystemLayout {
        SystemLayout {
            kernel_pool_base: Frame::from_number(KERNEL_POOL_START_FRAME),
            kernel_pool_frames: KERNEL_POOL_FRAMES,
            process_pool_base: Frame::from_number(PROCESS_POOL_START_FRAME),
            process_pool_frames: PROCESS_POOL_FRAMES,
            mem_hole_base: Frame::from_number(MEM_HOLE_START_FRAME),
            mem_hole_frames: MEM_HOLE_FRAMES,
            shared_size: SHARED_SIZE,
            vm_pool_base: VirtualAddress::new(DEFAULT_VM_POOL_BASE),
            vm_pool_size: DEFAULT_VM_POOL_SIZE,
            disk_drive: DriveSelect::Master,
            disk_size,
            idle_stack_size: 1024,
        }
    }
}

/// Handles to every subsystem, in the order they came up.
pub struct System {
    pub kernel_pool: &'static ContFramePool,
    pub process_pool: &'static ContFramePool,
    pub registry: &'static PoolRegistry,
    pub paging: &'static Paging,
    pub page_table: &'static PageTable,
    pub vm_pool: &'static VmPool,
    pub scheduler: &'static Scheduler,
    pub disk: &'static AtaDisk,
    pub fs: &'static FileSystem,
}

fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// Builds the whole substrate in dependency order and returns the
/// handles. Fails if any pool or table cannot be built, which at boot
/// time means the layout itself is wrong.
pub fn bootstrap(hw: Hardware, layout: SystemLayout) -> Result<&'static System, &'static str> {
    // The kernel pool manages its own bitmap; the process pool's bitmap
    // lives in kernel-pool frames, as does nothing else at this point.
    let kernel_pool = leak(ContFramePool::new(
        hw.ints,
        hw.phys,
        layout.kernel_pool_base,
        layout.kernel_pool_frames,
        None,
        needed_info_frames(layout.kernel_pool_frames),
    )?);
    let process_info = kernel_pool
        .get_frames(needed_info_frames(layout.process_pool_frames))
        .ok_or("no room in the kernel pool for the process pool bitmap")?;
    let process_pool = leak(ContFramePool::new(
        hw.ints,
        hw.phys,
        layout.process_pool_base,
        layout.process_pool_frames,
        Some(process_info),
        needed_info_frames(layout.process_pool_frames),
    )?);
    if layout.mem_hole_frames > 0 {
        process_pool.mark_inaccessible(layout.mem_hole_base, layout.mem_hole_frames);
    }

    let registry = leak(PoolRegistry::new());
    registry.register(kernel_pool);
    registry.register(process_pool);

    let paging = leak(Paging::new(
        hw.regs,
        hw.phys,
        kernel_pool,
        process_pool,
        registry,
        layout.shared_size,
    )?);
    let page_table = leak(PageTable::new(paging)?);
    page_table.load();
    paging.enable_paging();

    let vm_pool = VmPool::create(
        hw.space,
        layout.vm_pool_base,
        layout.vm_pool_size,
        process_pool,
        page_table,
    )?;

    let sched = leak(Scheduler::new(hw.ints, hw.dispatcher, layout.idle_stack_size)?);
    scheduler::init_system_scheduler(sched);

    let disk = leak(AtaDisk::new(
        hw.ports,
        hw.ints,
        hw.dispatcher,
        sched,
        layout.disk_drive,
        layout.disk_size,
    ));
    sched.register_wait_source(disk);

    let fs = leak(FileSystem::new());
    fs.mount(disk)?;

    debug!("system bootstrap complete");
    Ok(leak(System {
        kernel_pool,
        process_pool,
        registry,
        paging,
        page_table,
        vm_pool,
        scheduler: sched,
        disk,
        fs,
    }))
}
