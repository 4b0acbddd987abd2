//! Kernel threads and the context-switch contract.
//!
//! A [`Thread`] owns its stack and remembers where its saved context
//! lives; the actual register save/restore is the job of an external
//! [`Dispatcher`] (boot assembly on hardware, a recording fake in tests).
//! Threads are shared as [`ThreadRef`]s: queues clone the `Arc` instead
//! of threading intrusive links through the struct, so a thread can be
//! found on at most the one queue that currently holds it.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

#[cfg(test)]
extern crate std;

use alloc::{boxed::Box, sync::Arc, vec};
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// A shared handle to a thread.
pub type ThreadRef = Arc<Thread>;

/// The id handed to the next thread created. Never reused.
static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(0);

/// A single kernel thread: an entry point, a dedicated stack, and a slot
/// for the stack pointer saved at its last context switch.
pub struct Thread {
    id: u32,
    entry: fn(),
    stack: Stack,
    /// Where this thread's register state was parked when it was last
    /// switched away from. Owned by the [`Dispatcher`]; nothing else
    /// interprets it.
    saved_stack_pointer: AtomicUsize,
}

impl Thread {
    /// Creates a thread that will run `entry` on a fresh stack of
    /// `stack_size` bytes.
    pub fn new(entry: fn(), stack_size: usize) -> Result<ThreadRef, &'static str> {
        if stack_size == 0 {
            return Err("cannot create a thread with an empty stack");
        }
        let stack = Stack::allocate(stack_size)?;
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let thread = Thread {
            id,
            entry,
            saved_stack_pointer: AtomicUsize::new(stack.top()),
            stack,
        };
        debug!("created thread {} with a {}-byte stack", id, stack_size);
        Ok(Arc::new(thread))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn entry(&self) -> fn() {
        self.entry
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn saved_stack_pointer(&self) -> usize {
        self.saved_stack_pointer.load(Ordering::Acquire)
    }

    pub fn set_saved_stack_pointer(&self, sp: usize) {
        self.saved_stack_pointer.store(sp, Ordering::Release);
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("stack_bytes", &self.stack.size())
            .finish()
    }
}

/// A thread's stack: a heap allocation that lives exactly as long as the
/// thread does.
pub struct Stack {
    bytes: Box<[u8]>,
}

impl Stack {
    fn allocate(size: usize) -> Result<Stack, &'static str> {
        Ok(Stack {
            bytes: vec![0u8; size].into_boxed_slice(),
        })
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// The lowest address of the stack allocation.
    pub fn bottom(&self) -> usize {
        self.bytes.as_ptr() as usize
    }

    /// One past the highest address; x86 stacks grow down from here.
    pub fn top(&self) -> usize {
        self.bottom() + self.bytes.len()
    }
}

/// The context-switch contract consumed by the scheduler and the disk.
///
/// `dispatch_to` hands the CPU to `next` and does not return until some
/// later switch hands the CPU back to the calling thread.
pub trait Dispatcher: Send + Sync {
    /// The thread currently running on the CPU.
    fn current(&self) -> ThreadRef;
    /// Switches to `next`.
    fn dispatch_to(&self, next: &ThreadRef);
}
