//! Blocking driver for ATA (IDE) disks on the primary channel, using
//! LBA28 PIO one 512-byte sector at a time.
//!
//! "Blocking" means cooperative, not spinning: a thread that finds the
//! drive busy parks itself on the disk's wait queue and gives up the CPU
//! through [`Scheduler::block`]. The disk implements
//! [`scheduler::WaitSource`], so a later `yield` that sees the drive
//! ready moves the longest-waiting thread back to the ready queue; it
//! resumes where it parked and carries on with its transfer.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

#[cfg(test)]
extern crate std;


use alloc::collections::VecDeque;

use bitflags::bitflags;
use kernel_config::disk::SECTOR_SIZE_IN_BYTES;
use machine::{hold_interrupts, InterruptFlag, PortIo};
use scheduler::{Scheduler, WaitSource};
use spin::Mutex;
use thread::{Dispatcher, ThreadRef};

/// The port that holds the data to be written or the data from a read.
const PORT_DATA: u16         = 0x1F0;
/// The features port; 0 for every operation this driver issues.
const PORT_FEATURES: u16     = 0x1F1;
/// The number of sectors to read or write; always 1 here.
const PORT_SECTOR_COUNT: u16 = 0x1F2;
/// The low byte `[0:8)` of the linear block address.
const PORT_LBA_LOW: u16      = 0x1F3;
/// The middle byte `[8:16)` of the linear block address.
const PORT_LBA_MID: u16      = 0x1F4;
/// The high byte `[16:24)` of the linear block address.
const PORT_LBA_HIGH: u16     = 0x1F5;
/// `HDDEVSEL`: drive select plus bits `[24:28)` of the block address.
const PORT_DRIVE_SELECT: u16 = 0x1F6;
/// The command port; reading it instead yields the status byte.
const PORT_COMMAND: u16      = 0x1F7;
const PORT_STATUS: u16       = 0x1F7;

bitflags! {
	/// The possible status values found in an ATA drive's status port.
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct AtaStatus: u8 {
		/// When set, the drive's port values are still changing.
		const BUSY               = 0x80;
		/// When set, the drive is on and spun up.
		const DRIVE_READY        = 0x40;
		/// When set, the drive is ready to transfer data.
		const DATA_REQUEST_READY = 0x08;
		const ERROR              = 0x01;
	}
}

/// The commands this driver issues: single-sector PIO transfers.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AtaCommand {
	/// Read one sector using PIO (28-bit LBA).
	ReadPio = 0x20,
	/// Write one sector using PIO (28-bit LBA).
	WritePio = 0x30,
}

/// Which of the two drives on the channel to address; the value is the
/// bit that selects it in the `drive_select` port.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DriveSelect {
	Master = 0 << 4,
	Slave  = 1 << 4,
}

/// One drive on the primary ATA channel, shared by every thread that
/// does disk I/O.
pub struct AtaDisk {
	ports: &'static dyn PortIo,
	ints: &'static dyn InterruptFlag,
	dispatcher: &'static dyn Dispatcher,
	sched: &'static Scheduler,
	drive: DriveSelect,
	size_in_bytes: u32,
	/// Threads waiting for the drive, oldest first.
	waiters: Mutex<VecDeque<ThreadRef>>,
}

impl AtaDisk {
	/// Creates a driver for the given drive of the primary channel.
	///
	/// The size is passed in rather than queried from the controller;
	/// inferring it via IDENTIFY DEVICE is a possible extension.
	pub fn new(
		ports: &'static dyn PortIo,
		ints: &'static dyn InterruptFlag,
		dispatcher: &'static dyn Dispatcher,
		sched: &'static Scheduler,
		drive: DriveSelect,
		size_in_bytes: u32,
	) -> AtaDisk {
		debug!("constructed ATA disk ({:?}), {} bytes", drive, size_in_bytes);
		AtaDisk {
			ports,
			ints,
			dispatcher,
			sched,
			drive,
			size_in_bytes,
			waiters: Mutex::new(VecDeque::new()),
		}
	}

	/// The capacity of the disk in bytes.
	pub fn size(&self) -> u32 {
		self.size_in_bytes
	}

	/// Whether the drive can transfer data right now: not busy, and
	/// asserting the data-request line.
	pub fn is_ready(&self) -> bool {
		let status = AtaStatus::from_bits_truncate(self.ports.inb(PORT_STATUS));
		!status.contains(AtaStatus::BUSY) && status.contains(AtaStatus::DATA_REQUEST_READY)
	}

	/// Reads the 512-byte block `block_no` into `buf`.
	pub fn read(&self, block_no: u32, buf: &mut [u8; SECTOR_SIZE_IN_BYTES]) {
		self.wait_for_turn();
		self.issue_operation(AtaCommand::ReadPio, block_no);
		self.wait_until_ready();

		// Pull the sector through the data port one 16-bit word at a
		// time, low byte first.
		for chunk in buf.chunks_exact_mut(2) {
			let word: u16 = self.ports.inw(PORT_DATA);
			chunk[0] = word as u8;
			chunk[1] = (word >> 8) as u8;
		}
		trace!("read block {}", block_no);
	}

	/// Writes `buf` to the 512-byte block `block_no`.
	pub fn write(&self, block_no: u32, buf: &[u8; SECTOR_SIZE_IN_BYTES]) {
		self.wait_for_turn();
		self.issue_operation(AtaCommand::WritePio, block_no);
		self.wait_until_ready();

		for chunk in buf.chunks_exact(2) {
			let word = ((chunk[1] as u16) << 8) | (chunk[0] as u16);
			self.ports.outw(PORT_DATA, word);
		}
		trace!("wrote block {}", block_no);
	}

	/// Programs the task-file registers for a single-sector transfer of
	/// `block_no` and issues the command.
	fn issue_operation(&self, command: AtaCommand, block_no: u32) {
		self.ports.outb(PORT_FEATURES, 0x00);
		self.ports.outb(PORT_SECTOR_COUNT, 1);
		self.ports.outb(PORT_LBA_LOW, block_no as u8);
		self.ports.outb(PORT_LBA_MID, (block_no >> 8) as u8);
		self.ports.outb(PORT_LBA_HIGH, (block_no >> 16) as u8);
		// Bits [24:28) of the LBA share the drive-select port with the
		// drive bit and the always-set LBA-mode bits 0xE0.
		self.ports.outb(
			PORT_DRIVE_SELECT,
			((block_no >> 24) as u8 & 0x0F) | 0xE0 | self.drive as u8,
		);
		self.ports.outb(PORT_COMMAND, command as u8);
	}

	/// If other threads already wait for the drive, joins the back of
	/// the line and gives up the CPU until woken.
	fn wait_for_turn(&self) {
		let _held = hold_interrupts(self.ints);
		let must_wait = {
			let mut waiters = self.waiters.lock();
			if waiters.is_empty() {
				false
			} else {
				waiters.push_back(self.dispatcher.current());
				true
			}
		};
		if must_wait {
			self.sched.block();
		}
	}

	/// If the drive is not ready for data, parks the calling thread on
	/// the wait queue and gives up the CPU; by the time the scheduler
	/// resumes it the drive is ready.
	fn wait_until_ready(&self) {
		if self.is_ready() {
			return;
		}
		let _held = hold_interrupts(self.ints);
		self.waiters.lock().push_back(self.dispatcher.current());
		self.sched.block();
	}

	/// The number of threads currently waiting on the drive.
	pub fn waiter_count(&self) -> usize {
		self.waiters.lock().len()
	}
}

impl WaitSource for AtaDisk {
	/// Releases the longest-waiting thread, but only when the drive is
	/// ready for it; called by the scheduler on every yield.
	fn ready_waiter(&self) -> Option<ThreadRef> {
		if self.is_ready() {
			self.waiters.lock().pop_front()
		} else {
			None
		}
	}
}
