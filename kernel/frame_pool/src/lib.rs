//! Pools of physical memory frames with support for *contiguous*
//! multi-frame allocation.
//!
//! A single bit per frame is enough for an allocator that hands out one
//! frame at a time, but it cannot answer the question release needs:
//! "how long was the run that started here?" Each frame therefore gets a
//! two-bit state: [`FrameState::Free`], [`FrameState::Allocated`], or
//! [`FrameState::HeadOfSequence`]. Every allocated run is one head
//! followed by zero or more allocated frames, so releasing needs only the
//! head's frame number: the run ends at the next free frame, the next
//! head, or the end of the pool.
//!
//! A pool's bitmap lives either in a caller-provided info frame outside
//! the pool, or in the first frames of the pool itself, in which case
//! those frames are pre-marked as an allocated run so they are never
//! handed out.
//!
//! Frames come back through [`PoolRegistry::release_frames`], which
//! routes a bare frame number to whichever registered pool contains it —
//! at release time the caller usually has no idea which pool an address
//! came from.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

#[cfg(test)]
extern crate std;


use alloc::vec::Vec;
use core::fmt;

use addr_space::{frame_bytes_mut, PhysMap};
use kernel_config::memory::{FRAME_SIZE, FRAME_STATES_PER_BITMAP_BYTE, MAX_FRAMES_PER_POOL};
use machine::{hold_interrupts, InterruptFlag};
use memory_structs::Frame;
use spin::Mutex;

/// The allocation state of one frame, stored as a 2-bit field.
///
/// Four states fit in two bits but only three are used; a pool never
/// writes the fourth pattern, so reading it means the bitmap was
/// corrupted.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum FrameState {
    Free = 0b00,
    Allocated = 0b01,
    HeadOfSequence = 0b11,
}

impl FrameState {
    fn from_bits(bits: u8) -> FrameState {
        match bits {
            0b00 => FrameState::Free,
            0b01 => FrameState::Allocated,
            0b11 => FrameState::HeadOfSequence,
            _ => panic!("corrupt frame bitmap: state bits {:#04b}", bits),
        }
    }

    fn bits(self) -> u8 {
        self as u8
    }
}

/// Four frames per bitmap byte, high bits first: frame 0 of a byte is in
/// bits 7..6, frame 3 in bits 1..0.
fn bit_shift(frame_index: u32) -> u32 {
    6 - 2 * (frame_index % FRAME_STATES_PER_BITMAP_BYTE)
}

fn state_of(bitmap: &[u8], frame_index: u32) -> FrameState {
    let byte = bitmap[(frame_index / FRAME_STATES_PER_BITMAP_BYTE) as usize];
    FrameState::from_bits((byte >> bit_shift(frame_index)) & 0b11)
}

fn set_state(bitmap: &mut [u8], frame_index: u32, state: FrameState) {
    let byte = &mut bitmap[(frame_index / FRAME_STATES_PER_BITMAP_BYTE) as usize];
    let shift = bit_shift(frame_index);
    *byte = (*byte & !(0b11 << shift)) | (state.bits() << shift);
}

struct PoolInner {
    n_free_frames: u32,
}

/// A pool of physical frames within `[base, base + n_frames)`.
pub struct ContFramePool {
    ints: &'static dyn InterruptFlag,
    phys: &'static dyn PhysMap,
    base: Frame,
    n_frames: u32,
    /// The frame holding the 2-bit state bitmap; equal to `base` when the
    /// bitmap is self-hosted in the pool's first frames.
    bitmap_frame: Frame,
    inner: Mutex<PoolInner>,
}

impl ContFramePool {
    /// Creates a pool over the frames `[base, base + n_frames)`.
    ///
    /// With `info_frame` given, the bitmap lives there and every pool
    /// frame starts out free. With `info_frame` absent the bitmap is
    /// self-hosted: it occupies the first `n_info_frames` frames of the
    /// pool, which are pre-marked as one allocated run.
    pub fn new(
        ints: &'static dyn InterruptFlag,
        phys: &'static dyn PhysMap,
        base: Frame,
        n_frames: u32,
        info_frame: Option<Frame>,
        n_info_frames: u32,
    ) -> Result<ContFramePool, &'static str> {
        if n_frames == 0 || n_frames % FRAME_STATES_PER_BITMAP_BYTE != 0 {
            return Err("pool size must be a positive multiple of four frames");
        }
        // The bitmap must fit in a single frame.
        if n_frames > MAX_FRAMES_PER_POOL {
            return Err("pool is too large for a one-frame bitmap");
        }
        if info_frame.is_none() {
            if n_info_frames < needed_info_frames(n_frames) {
                return Err("self-hosted bitmap needs more info frames");
            }
            if n_info_frames >= n_frames {
                return Err("info frames would consume the whole pool");
            }
        }

        let pool = ContFramePool {
            ints,
            phys,
            base,
            n_frames,
            bitmap_frame: info_frame.unwrap_or(base),
            inner: Mutex::new(PoolInner {
                n_free_frames: n_frames,
            }),
        };

        {
            let _held = hold_interrupts(ints);
            let mut inner = pool.inner.lock();
            let bitmap = pool.bitmap_mut();
            bitmap.fill(FrameState::Free.bits());
            if info_frame.is_none() {
                // The bitmap's own frames form the pool's first run.
                mark_run(bitmap, 0, n_info_frames);
                inner.n_free_frames -= n_info_frames;
            }
        }

        debug!(
            "frame pool initialized: base {}, {} frames, bitmap at {}",
            base.number(),
            n_frames,
            pool.bitmap_frame.number()
        );
        Ok(pool)
    }

    /// Allocates the lowest-addressed run of `n_frames` contiguous free
    /// frames and returns its first frame, or `None` (with a diagnostic)
    /// if no such run exists.
    pub fn get_frames(&self, n_frames: u32) -> Option<Frame> {
        if n_frames == 0 {
            return None;
        }
        let _held = hold_interrupts(self.ints);
        let mut inner = self.inner.lock();
        let bitmap = self.bitmap_mut();

        let mut run_len = 0u32;
        for index in 0..self.n_frames {
            if state_of(bitmap, index) == FrameState::Free {
                run_len += 1;
                if run_len == n_frames {
                    let run_start = index + 1 - n_frames;
                    mark_run(bitmap, run_start, n_frames);
                    inner.n_free_frames -= n_frames;
                    return Some(self.base + run_start);
                }
            } else {
                run_len = 0;
            }
        }

        error!(
            "unable to find a sequence of {} free frames in pool at base {}",
            n_frames,
            self.base.number()
        );
        None
    }

    /// Marks the given range as one allocated run without searching,
    /// e.g. for memory that a device owns and the kernel must never use.
    ///
    /// Panics if the range is not entirely inside the pool, or if any of
    /// its frames is not free.
    pub fn mark_inaccessible(&self, first: Frame, n_frames: u32) {
        let in_pool = first >= self.base
            && n_frames <= self.n_frames
            && (first - self.base) <= self.n_frames - n_frames;
        if !in_pool {
            error!(
                "mark_inaccessible range [{}, {}) is outside the pool",
                first.number(),
                first.number() + n_frames
            );
            panic!("mark_inaccessible outside the pool");
        }

        let _held = hold_interrupts(self.ints);
        let mut inner = self.inner.lock();
        let bitmap = self.bitmap_mut();
        let start = first - self.base;
        for index in start..start + n_frames {
            if state_of(bitmap, index) != FrameState::Free {
                error!("mark_inaccessible hit an already-allocated frame {}", index);
                panic!("mark_inaccessible over allocated frames");
            }
        }
        mark_run(bitmap, start, n_frames);
        inner.n_free_frames -= n_frames;
    }

    /// Frees the run whose head is `first`, walking forward until the
    /// next free frame, the next head, or the end of the pool.
    ///
    /// Callers go through [`PoolRegistry::release_frames`]; panics if
    /// `first` is not the head of a sequence.
    fn release_frame_sequence(&self, first: Frame) {
        let _held = hold_interrupts(self.ints);
        let mut inner = self.inner.lock();
        let bitmap = self.bitmap_mut();

        let start = first - self.base;
        if state_of(bitmap, start) != FrameState::HeadOfSequence {
            error!(
                "release of frame {} which is not the head of a sequence",
                first.number()
            );
            panic!("release of a non-head frame");
        }
        set_state(bitmap, start, FrameState::Free);
        inner.n_free_frames += 1;

        for index in start + 1..self.n_frames {
            if state_of(bitmap, index) != FrameState::Allocated {
                break;
            }
            set_state(bitmap, index, FrameState::Free);
            inner.n_free_frames += 1;
        }
    }

    /// Whether `frame` lies inside this pool's range.
    pub fn contains(&self, frame: Frame) -> bool {
        frame >= self.base && frame - self.base < self.n_frames
    }

    pub fn base(&self) -> Frame {
        self.base
    }

    pub fn n_frames(&self) -> u32 {
        self.n_frames
    }

    /// The number of frames currently free in this pool.
    pub fn n_free_frames(&self) -> u32 {
        self.inner.lock().n_free_frames
    }

    /// The recorded state of one frame. Panics if `frame` is outside the
    /// pool.
    pub fn frame_state(&self, frame: Frame) -> FrameState {
        assert!(self.contains(frame), "frame {} not in pool", frame.number());
        let _inner = self.inner.lock();
        state_of(self.bitmap_mut(), frame - self.base)
    }

    /// The live bitmap bytes for this pool.
    ///
    /// Only called with `self.inner` locked, which serializes all bitmap
    /// access; the raw view itself comes from the one punning crate.
    #[allow(clippy::mut_from_ref)]
    fn bitmap_mut(&self) -> &mut [u8] {
        let len = (self.n_frames / FRAME_STATES_PER_BITMAP_BYTE) as usize;
        unsafe { frame_bytes_mut(self.phys, self.bitmap_frame, len) }
    }
}

impl fmt::Debug for ContFramePool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ContFramePool")
            .field("base", &self.base.number())
            .field("n_frames", &self.n_frames)
            .field("n_free_frames", &self.n_free_frames())
            .finish()
    }
}

/// Marks `[start, start + n)` (pool-relative indices) as one run:
/// a head followed by allocated frames.
fn mark_run(bitmap: &mut [u8], start: u32, n: u32) {
    set_state(bitmap, start, FrameState::HeadOfSequence);
    for index in start + 1..start + n {
        set_state(bitmap, index, FrameState::Allocated);
    }
}

/// The number of info frames needed to hold the bitmap of an
/// `n_frames`-frame pool: each info frame records `FRAME_SIZE * 4`
/// frames.
pub const fn needed_info_frames(n_frames: u32) -> u32 {
    n_frames.div_ceil(FRAME_SIZE * FRAME_STATES_PER_BITMAP_BYTE)
}

/// The set of live frame pools, so that a release can be routed by frame
/// number alone.
///
/// Pools register once at construction time and live forever.
pub struct PoolRegistry {
    pools: Mutex<Vec<&'static ContFramePool>>,
}

impl PoolRegistry {
    pub const fn new() -> PoolRegistry {
        PoolRegistry {
            pools: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, pool: &'static ContFramePool) {
        self.pools.lock().push(pool);
    }

    /// Releases the run whose head is `first`, whichever registered pool
    /// it belongs to. Panics if no pool contains `first` or if `first` is
    /// not the head of an allocated run.
    pub fn release_frames(&self, first: Frame) {
        let pool = {
            let pools = self.pools.lock();
            pools.iter().copied().find(|p| p.contains(first))
        };
        match pool {
            Some(pool) => pool.release_frame_sequence(first),
            None => {
                error!("released frame {} belongs to no pool", first.number());
                panic!("release of a frame outside every pool");
            }
        }
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
