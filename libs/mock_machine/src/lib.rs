//! Fakes of the hardware contract, for running the kernel's unit tests on
//! a host machine.
//!
//! Each fake stands in for one external collaborator:
//! * [`MockRegs`] — the control registers.
//! * [`MockInterrupts`] — the CPU interrupt flag.
//! * [`MockPhysMemory`] — a range of physical frames backed by a heap
//!   buffer, exposed through [`addr_space::PhysMap`].
//! * [`MockActiveSpace`] — one window of a virtual address space backed
//!   by a heap buffer, exposed through [`addr_space::ActiveSpace`].
//! * [`MockAtaPorts`] — an ATA device model behind the port-I/O contract,
//!   with a programmable "not ready yet" window.
//! * [`MockDispatcher`] — tracks the current thread and records the
//!   sequence of dispatch targets.
//!
//! Tests leak the fakes (`Box::leak`) to obtain the `&'static` references
//! the kernel crates hold, mirroring how boot-time objects live forever.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use machine::{CtrlRegs, InterruptFlag, PortIo};
use memory_structs::{Frame, PhysicalAddress, VirtualAddress};
use spin::Mutex;
use thread::{Dispatcher, ThreadRef};

/// Control registers as plain cells.
#[derive(Default)]
pub struct MockRegs {
    cr0: AtomicU32,
    cr2: AtomicU32,
    cr3: AtomicU32,
    /// How many times CR3 has been written; a rewrite is a TLB flush.
    pub cr3_writes: AtomicU32,
}

impl MockRegs {
    pub fn new() -> MockRegs {
        MockRegs::default()
    }

    /// Plants a faulting address for the next `handle_fault` call to read.
    pub fn set_cr2(&self, addr: VirtualAddress) {
        self.cr2.store(addr.value(), Ordering::SeqCst);
    }
}

impl CtrlRegs for MockRegs {
    fn read_cr0(&self) -> u32 {
        self.cr0.load(Ordering::SeqCst)
    }
    fn write_cr0(&self, value: u32) {
        self.cr0.store(value, Ordering::SeqCst);
    }
    fn read_cr2(&self) -> u32 {
        self.cr2.load(Ordering::SeqCst)
    }
    fn read_cr3(&self) -> u32 {
        self.cr3.load(Ordering::SeqCst)
    }
    fn write_cr3(&self, value: u32) {
        self.cr3.store(value, Ordering::SeqCst);
        self.cr3_writes.fetch_add(1, Ordering::SeqCst);
    }
}

/// The interrupt flag as a bool, starting enabled like a running kernel.
pub struct MockInterrupts {
    enabled: AtomicBool,
}

impl MockInterrupts {
    pub fn new() -> MockInterrupts {
        MockInterrupts {
            enabled: AtomicBool::new(true),
        }
    }
}

impl Default for MockInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptFlag for MockInterrupts {
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
    fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }
    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }
}

/// A contiguous range of fake physical frames.
///
/// Physical addresses inside `[start, start + n_frames * FRAME_SIZE)` map
/// onto a heap buffer; anything outside panics, which turns a stray
/// pointer computation into a loud test failure.
pub struct MockPhysMemory {
    start: PhysicalAddress,
    len: usize,
    base: usize,
}

impl MockPhysMemory {
    pub fn new(first_frame: Frame, n_frames: u32) -> MockPhysMemory {
        let len = n_frames as usize * kernel_config::memory::FRAME_SIZE as usize;
        let buf: &'static mut [u8] = Box::leak(vec![0u8; len].into_boxed_slice());
        MockPhysMemory {
            start: first_frame.start_address(),
            len,
            base: buf.as_mut_ptr() as usize,
        }
    }

    /// Direct view of the backing buffer, for assertions.
    pub fn bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.base as *const u8, self.len) }
    }
}

impl addr_space::PhysMap for MockPhysMemory {
    unsafe fn phys_ptr(&self, addr: PhysicalAddress) -> *mut u8 {
        let off = addr
            .value()
            .checked_sub(self.start.value())
            .expect("physical access below the mocked range") as usize;
        assert!(
            off < self.len,
            "physical access at {addr} beyond the mocked range"
        );
        (self.base + off) as *mut u8
    }
}

/// One window of a fake virtual address space.
///
/// Unlike real memory it is all "mapped" up front; the kernel crates under
/// test still only touch pages they consider materialized.
pub struct MockActiveSpace {
    window_base: VirtualAddress,
    len: usize,
    base: usize,
}

impl MockActiveSpace {
    pub fn new(window_base: VirtualAddress, len: usize) -> MockActiveSpace {
        let buf: &'static mut [u8] = Box::leak(vec![0u8; len].into_boxed_slice());
        MockActiveSpace {
            window_base,
            len,
            base: buf.as_mut_ptr() as usize,
        }
    }
}

impl addr_space::ActiveSpace for MockActiveSpace {
    unsafe fn virt_ptr(&self, addr: VirtualAddress) -> *mut u8 {
        let off = addr
            .value()
            .checked_sub(self.window_base.value())
            .expect("virtual access below the mocked window") as usize;
        assert!(
            off < self.len,
            "virtual access at {addr} beyond the mocked window"
        );
        (self.base + off) as *mut u8
    }
}

/// Records the dispatch sequence and tracks the current thread.
pub struct MockDispatcher {
    current: Mutex<Option<ThreadRef>>,
    dispatched: Mutex<Vec<u32>>,
}

impl MockDispatcher {
    pub fn new() -> MockDispatcher {
        MockDispatcher {
            current: Mutex::new(None),
            dispatched: Mutex::new(Vec::new()),
        }
    }

    /// Installs the thread the fake CPU is "running".
    pub fn set_current(&self, t: &ThreadRef) {
        *self.current.lock() = Some(t.clone());
    }

    /// The ids of every thread dispatched so far, in order.
    pub fn dispatched_ids(&self) -> Vec<u32> {
        self.dispatched.lock().clone()
    }

    pub fn clear_dispatched(&self) {
        self.dispatched.lock().clear();
    }
}

impl Default for MockDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for MockDispatcher {
    fn current(&self) -> ThreadRef {
        self.current
            .lock()
            .clone()
            .expect("MockDispatcher has no current thread installed")
    }

    fn dispatch_to(&self, next: &ThreadRef) {
        self.dispatched.lock().push(next.id());
        *self.current.lock() = Some(next.clone());
        // A real dispatch would not return until switched back; the fake
        // returns immediately so a single host thread can play all parts.
    }
}

const SECTOR_SIZE: usize = kernel_config::disk::SECTOR_SIZE_IN_BYTES;

/// ATA status bits the model reports.
const STATUS_BSY: u8 = 0x80;
const STATUS_RDY: u8 = 0x40;
const STATUS_DRQ: u8 = 0x08;

struct AtaTransfer {
    write: bool,
    block: usize,
    word_index: usize,
}

struct AtaState {
    /// Latched task-file registers, indexed 0x1F1..=0x1F6 minus 0x1F1.
    taskfile: [u8; 6],
    blocks: Vec<[u8; SECTOR_SIZE]>,
    transfer: Option<AtaTransfer>,
    /// While positive, status reads report BSY and count down.
    not_ready_reads: u32,
    commands: Vec<u8>,
}

/// A model of one drive on the primary ATA channel, behind [`PortIo`].
///
/// Issue a command and the drive becomes ready after
/// `set_not_ready_status_reads(n)` further status polls (default: at
/// once); then 256 data-port words move the sector.
pub struct MockAtaPorts {
    state: Mutex<AtaState>,
}

impl MockAtaPorts {
    pub fn new(n_blocks: usize) -> MockAtaPorts {
        MockAtaPorts {
            state: Mutex::new(AtaState {
                taskfile: [0; 6],
                blocks: vec![[0u8; SECTOR_SIZE]; n_blocks],
                transfer: None,
                not_ready_reads: 0,
                commands: Vec::new(),
            }),
        }
    }

    pub fn size_in_bytes(&self) -> u32 {
        (self.state.lock().blocks.len() * SECTOR_SIZE) as u32
    }

    /// Makes the drive report BSY for the next `n` status reads.
    pub fn set_not_ready_status_reads(&self, n: u32) {
        self.state.lock().not_ready_reads = n;
    }

    pub fn block(&self, block: usize) -> [u8; SECTOR_SIZE] {
        self.state.lock().blocks[block]
    }

    pub fn fill_block(&self, block: usize, contents: &[u8; SECTOR_SIZE]) {
        self.state.lock().blocks[block] = *contents;
    }

    /// Every command byte written to the command port, in order.
    pub fn issued_commands(&self) -> Vec<u8> {
        self.state.lock().commands.clone()
    }
}

impl AtaState {
    fn latched_lba(&self) -> usize {
        let low = self.taskfile[2] as usize;
        let mid = self.taskfile[3] as usize;
        let high = self.taskfile[4] as usize;
        let top = (self.taskfile[5] & 0x0F) as usize;
        low | (mid << 8) | (high << 16) | (top << 24)
    }
}

impl PortIo for MockAtaPorts {
    fn inb(&self, port: u16) -> u8 {
        let mut st = self.state.lock();
        match port {
            0x1F7 => {
                if st.not_ready_reads > 0 {
                    st.not_ready_reads -= 1;
                    STATUS_BSY | STATUS_RDY
                } else {
                    // Once the busy window is over the model stays ready
                    // for data, so blocked threads can be woken by polls
                    // that happen after a transfer already drained.
                    STATUS_RDY | STATUS_DRQ
                }
            }
            0x1F1..=0x1F6 => st.taskfile[(port - 0x1F1) as usize],
            _ => panic!("unexpected inb from port {port:#X}"),
        }
    }

    fn outb(&self, port: u16, value: u8) {
        let mut st = self.state.lock();
        match port {
            0x1F1..=0x1F6 => st.taskfile[(port - 0x1F1) as usize] = value,
            0x1F7 => {
                st.commands.push(value);
                let block = st.latched_lba();
                assert!(block < st.blocks.len(), "LBA {block} beyond the disk");
                let write = match value {
                    0x20 => false,
                    0x30 => true,
                    other => panic!("unsupported ATA command {other:#X}"),
                };
                st.transfer = Some(AtaTransfer {
                    write,
                    block,
                    word_index: 0,
                });
            }
            _ => panic!("unexpected outb to port {port:#X}"),
        }
    }

    fn inw(&self, port: u16) -> u16 {
        assert_eq!(port, 0x1F0, "word reads only come from the data port");
        let mut st = self.state.lock();
        let t = st
            .transfer
            .as_mut()
            .expect("data read with no read command in flight");
        assert!(!t.write, "data read during a write command");
        let (block, i) = (t.block, t.word_index);
        t.word_index += 1;
        let done = t.word_index == SECTOR_SIZE / 2;
        if done {
            st.transfer = None;
        }
        let bytes = st.blocks[block];
        u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]])
    }

    fn outw(&self, port: u16, value: u16) {
        assert_eq!(port, 0x1F0, "word writes only go to the data port");
        let mut st = self.state.lock();
        let t = st
            .transfer
            .as_mut()
            .expect("data write with no write command in flight");
        assert!(t.write, "data write during a read command");
        let (block, i) = (t.block, t.word_index);
        t.word_index += 1;
        let done = t.word_index == SECTOR_SIZE / 2;
        let [lo, hi] = value.to_le_bytes();
        st.blocks[block][i * 2] = lo;
        st.blocks[block][i * 2 + 1] = hi;
        if done {
            st.transfer = None;
        }
    }
}
