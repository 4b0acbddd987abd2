//! A cooperative round-robin scheduler.
//!
//! Threads run until they call [`Scheduler::yield_now`], block, or
//! terminate; there is no preemption. Ready threads wait in one FIFO
//! queue. A dedicated idle thread — never on the queue — soaks up the CPU
//! whenever the queue is empty, doing nothing but yielding until real
//! work arrives.
//!
//! Blocking I/O cooperates through [`WaitSource`]: a device that keeps a
//! queue of waiting threads exposes at most one of them per poll once it
//! is ready, and `yield_now` moves that thread back onto the ready queue
//! before picking who runs next. A blocked thread therefore costs nothing
//! until its device comes ready.
//!
//! Every queue mutation happens with interrupts held off; the interrupt
//! flag is restored on every exit path. The ready-queue lock is never
//! held across a dispatch.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

#[cfg(test)]
extern crate std;


use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use machine::{hold_interrupts, InterruptFlag};
use spin::{Mutex, Once};
use thread::{Dispatcher, Thread, ThreadRef};

/// A device with a queue of threads waiting on it.
///
/// `ready_waiter` hands back the longest-waiting thread, but only when
/// the device can make progress; the scheduler re-queues that thread.
pub trait WaitSource: Send + Sync {
    fn ready_waiter(&self) -> Option<ThreadRef>;
}

/// The scheduler the idle thread yields back into.
///
/// The idle thread's body is a plain function, so it reaches its
/// scheduler through this process-wide slot rather than a captured
/// reference.
static SYSTEM_SCHEDULER: Once<&'static Scheduler> = Once::new();

/// Installs `sched` as the scheduler the idle loop runs against.
pub fn init_system_scheduler(sched: &'static Scheduler) {
    SYSTEM_SCHEDULER.call_once(|| sched);
}

pub fn system_scheduler() -> Option<&'static Scheduler> {
    SYSTEM_SCHEDULER.get().copied()
}

/// What the idle thread does forever. It runs with interrupts enabled;
/// each `yield_now` returns immediately while the ready queue is empty.
fn idle_loop() {
    loop {
        if let Some(sched) = system_scheduler() {
            sched.yield_now();
        }
    }
}

pub struct Scheduler {
    ints: &'static dyn InterruptFlag,
    dispatcher: &'static dyn Dispatcher,
    idle: ThreadRef,
    ready: Mutex<VecDeque<ThreadRef>>,
    wait_sources: Mutex<Vec<&'static dyn WaitSource>>,
}

impl Scheduler {
    /// Builds a scheduler and its idle thread, whose dedicated stack is
    /// `idle_stack_size` bytes.
    pub fn new(
        ints: &'static dyn InterruptFlag,
        dispatcher: &'static dyn Dispatcher,
        idle_stack_size: usize,
    ) -> Result<Scheduler, &'static str> {
        let idle = Thread::new(idle_loop, idle_stack_size)?;
        debug!("constructed scheduler, idle thread {}", idle.id());
        Ok(Scheduler {
            ints,
            dispatcher,
            idle,
            ready: Mutex::new(VecDeque::new()),
            wait_sources: Mutex::new(Vec::new()),
        })
    }

    /// Registers a device whose waiters `yield_now` should poll.
    pub fn register_wait_source(&self, source: &'static dyn WaitSource) {
        self.wait_sources.lock().push(source);
    }

    pub fn idle_thread(&self) -> ThreadRef {
        self.idle.clone()
    }

    /// The number of threads currently ready to run.
    pub fn ready_count(&self) -> usize {
        self.ready.lock().len()
    }

    /// Gives up the CPU to the longest-ready thread.
    ///
    /// Before choosing, one thread whose device has come ready is moved
    /// from its wait queue to the ready queue. The caller is re-enqueued
    /// at the tail — unless it is the idle thread, which never enters the
    /// queue. With nothing ready, the idle thread keeps the CPU and a
    /// normal thread hands it to idle.
    pub fn yield_now(&self) {
        let _held = hold_interrupts(self.ints);
        self.unblock_one_waiter();

        let current = self.dispatcher.current();
        let is_idle = Arc::ptr_eq(&current, &self.idle);
        let next = {
            let mut ready = self.ready.lock();
            match ready.pop_front() {
                Some(next) => {
                    if !is_idle {
                        ready.push_back(current);
                    }
                    next
                }
                None if is_idle => return,
                None => {
                    ready.push_back(current);
                    self.idle.clone()
                }
            }
        };
        self.dispatcher.dispatch_to(&next);
    }

    /// Makes `t` runnable again by appending it to the ready queue.
    pub fn resume(&self, t: &ThreadRef) {
        let _held = hold_interrupts(self.ints);
        self.ready.lock().push_back(t.clone());
    }

    /// Adds a newly created thread to the ready queue.
    pub fn add(&self, t: &ThreadRef) {
        self.resume(t);
    }

    /// Gives up the CPU without re-queueing the caller, which must
    /// already sit on some wait queue.
    pub fn block(&self) {
        let _held = hold_interrupts(self.ints);
        let next = {
            let mut ready = self.ready.lock();
            ready.pop_front().unwrap_or_else(|| self.idle.clone())
        };
        self.dispatcher.dispatch_to(&next);
    }

    /// Removes `t` from scheduling. A thread terminating itself hands the
    /// CPU straight to the next ready thread (or idle) without being
    /// re-enqueued; terminating another thread just drops it from the
    /// ready queue.
    ///
    /// Threads blocked on a wait queue must not be terminated; this does
    /// not chase wait queues.
    pub fn terminate(&self, t: &ThreadRef) {
        let _held = hold_interrupts(self.ints);
        let current = self.dispatcher.current();
        if Arc::ptr_eq(t, &current) {
            debug!("thread {} terminating itself", t.id());
            let next = {
                let mut ready = self.ready.lock();
                ready.pop_front().unwrap_or_else(|| self.idle.clone())
            };
            self.dispatcher.dispatch_to(&next);
            return;
        }
        debug!("terminating thread {}", t.id());
        self.ready.lock().retain(|q| !Arc::ptr_eq(q, t));
    }

    /// Moves at most one thread whose device is ready from that device's
    /// wait queue to the tail of the ready queue.
    fn unblock_one_waiter(&self) {
        let sources = self.wait_sources.lock();
        for source in sources.iter() {
            if let Some(t) = source.ready_waiter() {
                self.ready.lock().push_back(t);
                break;
            }
        }
    }
}
