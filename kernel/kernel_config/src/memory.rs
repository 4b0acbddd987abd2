//! The physical and virtual memory map the kernel assumes.
//!
//! Physical layout at boot:
//! * 0..2 MiB: the kernel image and boot structures, directly mapped.
//! * 2..4 MiB: the kernel frame pool (frames handed to kernel mappings).
//! * 4..32 MiB: the process frame pool (frames backing process pages).
//! * 15..16 MiB: the memory hole, owned by legacy devices and never
//!   handed out by any pool.
//!
//! Virtual layout: the first 4 MiB are identity-mapped through page
//! directory entry 0; the last directory entry recursively maps the
//! directory itself so that all paging structures stay addressable once
//! paging is on.

/// The lower 12 bits of an address select a byte within a page.
pub const PAGE_SHIFT: u32 = 12;
/// Page size is 4096 bytes, 4KiB pages.
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;
/// A frame of physical memory is exactly one page in size.
pub const FRAME_SIZE: u32 = PAGE_SIZE;

/// Value: 1024. A 32-bit page directory or page table holds 1024 entries.
pub const ENTRIES_PER_PAGE_TABLE: u32 = PAGE_SIZE / 4;
/// The span of virtual memory covered by one page directory entry, 4 MiB.
pub const ADDRESSABILITY_PER_PD_ENTRY: u32 = ENTRIES_PER_PAGE_TABLE * PAGE_SIZE;

/// Value: 1023. The last directory entry maps the directory onto itself.
pub const RECURSIVE_PD_INDEX: u32 = ENTRIES_PER_PAGE_TABLE - 1;
/// The virtual address at which the recursive entry exposes the page
/// directory itself: `0xFFFF_F000`.
pub const RECURSIVE_PD_ADDRESS: u32 =
    (RECURSIVE_PD_INDEX << 22) | (RECURSIVE_PD_INDEX << PAGE_SHIFT);
/// The base of the 4 MiB window through which the recursive entry exposes
/// every page table: the table for directory index `d` appears at
/// `RECURSIVE_PT_WINDOW | (d << 12)`.
pub const RECURSIVE_PT_WINDOW: u32 = RECURSIVE_PD_INDEX << 22;

/// The size in bytes of the region that is direct-mapped into page
/// directory entry 0 and shared by every address space.
pub const SHARED_SIZE: u32 = ADDRESSABILITY_PER_PD_ENTRY;

/// Each bitmap byte records the state of four frames, two bits per frame.
pub const FRAME_STATES_PER_BITMAP_BYTE: u32 = 4;
/// A pool's bitmap must fit in a single frame, which bounds the pool size.
pub const MAX_FRAMES_PER_POOL: u32 = FRAME_SIZE * FRAME_STATES_PER_BITMAP_BYTE;

/// First frame of the kernel frame pool (2 MiB).
pub const KERNEL_POOL_START_FRAME: u32 = (2 * 1024 * 1024) / FRAME_SIZE;
/// Number of frames in the kernel frame pool (2 MiB worth).
pub const KERNEL_POOL_FRAMES: u32 = (2 * 1024 * 1024) / FRAME_SIZE;

/// First frame of the process frame pool (4 MiB).
pub const PROCESS_POOL_START_FRAME: u32 = (4 * 1024 * 1024) / FRAME_SIZE;
/// Number of frames in the process frame pool (28 MiB worth).
pub const PROCESS_POOL_FRAMES: u32 = (28 * 1024 * 1024) / FRAME_SIZE;

/// First frame of the memory hole (15 MiB).
pub const MEM_HOLE_START_FRAME: u32 = (15 * 1024 * 1024) / FRAME_SIZE;
/// Number of frames in the memory hole (1 MiB worth).
pub const MEM_HOLE_FRAMES: u32 = (1024 * 1024) / FRAME_SIZE;

/// Base of the default process VM pool, right above the shared 4 MiB.
pub const DEFAULT_VM_POOL_BASE: u32 = 8 * 1024 * 1024;
/// Size in bytes of the default process VM pool.
pub const DEFAULT_VM_POOL_SIZE: u32 = 4 * 1024 * 1024;

// The recursive window and the directory self-map must name the same
// directory entry, and the maximal pool's bitmap must fit in one frame.
const_assert_eq!(RECURSIVE_PD_ADDRESS >> 22, RECURSIVE_PD_INDEX);
const_assert_eq!(RECURSIVE_PT_WINDOW >> 22, RECURSIVE_PD_INDEX);
const_assert!(MAX_FRAMES_PER_POOL / FRAME_STATES_PER_BITMAP_BYTE <= FRAME_SIZE);
// Pool bounds must stay divisible by the four-frames-per-byte packing.
const_assert_eq!(KERNEL_POOL_FRAMES % FRAME_STATES_PER_BITMAP_BYTE, 0);
const_assert_eq!(PROCESS_POOL_FRAMES % FRAME_STATES_PER_BITMAP_BYTE, 0);
// The memory hole lies entirely inside the process pool.
const_assert!(MEM_HOLE_START_FRAME >= PROCESS_POOL_START_FRAME);
const_assert!(
    MEM_HOLE_START_FRAME + MEM_HOLE_FRAMES
        <= PROCESS_POOL_START_FRAME + PROCESS_POOL_FRAMES
);
