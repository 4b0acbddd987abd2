//! Basic types for dealing with 32-bit x86 memory: physical and virtual
//! addresses, physical `Frame`s, and virtual `Page`s.
//!
//! Addresses are 32 bits wide because that is the machine being targeted;
//! keeping them as dedicated newtypes prevents accidentally mixing the
//! physical and virtual worlds, which otherwise differ only once paging
//! is enabled.

#![no_std]

#[cfg(test)]
extern crate std;

use core::fmt;
use core::ops::{Add, Sub};

use kernel_config::memory::{ENTRIES_PER_PAGE_TABLE, FRAME_SIZE, PAGE_SHIFT, PAGE_SIZE};

/// An address in the physical address space, as seen on the memory bus.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysicalAddress(u32);

impl PhysicalAddress {
    pub const fn new(addr: u32) -> PhysicalAddress {
        PhysicalAddress(addr)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// The offset of this address within its frame, i.e. the low 12 bits.
    pub const fn frame_offset(self) -> u32 {
        self.0 & (FRAME_SIZE - 1)
    }
}

/// An address in a virtual address space, as issued by running code.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtualAddress(u32);

impl VirtualAddress {
    pub const fn new(addr: u32) -> VirtualAddress {
        VirtualAddress(addr)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// The page directory index for this address: the top 10 bits.
    pub const fn pd_index(self) -> u32 {
        self.0 >> 22
    }

    /// The page table index for this address: the middle 10 bits.
    pub const fn pt_index(self) -> u32 {
        (self.0 >> PAGE_SHIFT) & (ENTRIES_PER_PAGE_TABLE - 1)
    }

    /// The offset of this address within its page, i.e. the low 12 bits.
    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE - 1)
    }

    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

impl Add<u32> for VirtualAddress {
    type Output = VirtualAddress;
    fn add(self, rhs: u32) -> VirtualAddress {
        VirtualAddress(self.0 + rhs)
    }
}

impl Sub<VirtualAddress> for VirtualAddress {
    type Output = u32;
    fn sub(self, rhs: VirtualAddress) -> u32 {
        self.0 - rhs.0
    }
}

impl Add<u32> for PhysicalAddress {
    type Output = PhysicalAddress;
    fn add(self, rhs: u32) -> PhysicalAddress {
        PhysicalAddress(self.0 + rhs)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "p{:#010X}", self.0)
    }
}
impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{:#010X}", self.0)
    }
}
impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A frame of physical memory: `FRAME_SIZE` bytes, identified by number.
///
/// Frame number `n` covers physical addresses
/// `[n * FRAME_SIZE, (n + 1) * FRAME_SIZE)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(u32);

impl Frame {
    pub const fn from_number(number: u32) -> Frame {
        Frame(number)
    }

    /// The frame containing the given physical address.
    pub const fn containing_address(addr: PhysicalAddress) -> Frame {
        Frame(addr.value() >> PAGE_SHIFT)
    }

    pub const fn number(self) -> u32 {
        self.0
    }

    /// The physical address of the first byte of this frame.
    pub const fn start_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }
}

impl Add<u32> for Frame {
    type Output = Frame;
    fn add(self, rhs: u32) -> Frame {
        Frame(self.0 + rhs)
    }
}

impl Sub<Frame> for Frame {
    type Output = u32;
    fn sub(self, rhs: Frame) -> u32 {
        self.0 - rhs.0
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Frame({}, {:?})", self.0, self.start_address())
    }
}

/// A page of virtual memory: `PAGE_SIZE` bytes, identified by number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Page(u32);

impl Page {
    pub const fn from_number(number: u32) -> Page {
        Page(number)
    }

    /// The page containing the given virtual address.
    pub const fn containing_address(addr: VirtualAddress) -> Page {
        Page(addr.value() >> PAGE_SHIFT)
    }

    pub const fn number(self) -> u32 {
        self.0
    }

    /// The virtual address of the first byte of this page.
    pub const fn start_address(self) -> VirtualAddress {
        VirtualAddress::new(self.0 << PAGE_SHIFT)
    }
}

impl Add<u32> for Page {
    type Output = Page;
    fn add(self, rhs: u32) -> Page {
        Page(self.0 + rhs)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Page({}, {:?})", self.0, self.start_address())
    }
}

/// Rounds `bytes` up to the next whole number of pages, in bytes.
pub const fn round_up_to_pages(bytes: u32) -> u32 {
    bytes.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// The number of pages needed to hold `bytes` bytes.
pub const fn pages_spanning(bytes: u32) -> u32 {
    bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod test {
    use super::*;
    use kernel_config::memory::{RECURSIVE_PD_ADDRESS, RECURSIVE_PT_WINDOW};

    #[test]
    fn directory_and_table_indices() {
        let va = VirtualAddress::new(0x0080_1234);
        assert_eq!(va.pd_index(), 2);
        assert_eq!(va.pt_index(), 1);
        assert_eq!(va.page_offset(), 0x234);
    }

    #[test]
    fn frame_and_address_round_trip() {
        let frame = Frame::from_number(513);
        assert_eq!(frame.start_address().value(), 513 * 4096);
        assert_eq!(Frame::containing_address(frame.start_address() + 4095), frame);
        assert_eq!(
            Frame::containing_address(frame.start_address() + 4096),
            frame + 1
        );
    }

    /// The recursive self-map pins the directory at the very last page of
    /// the address space, and every page table inside the top 4 MiB window.
    #[test]
    fn recursive_window_addresses() {
        let pd = VirtualAddress::new(RECURSIVE_PD_ADDRESS);
        assert_eq!(pd.pd_index(), 1023);
        assert_eq!(pd.pt_index(), 1023);
        assert_eq!(pd.page_offset(), 0);

        for d in [0u32, 1, 512, 1022] {
            let pt = VirtualAddress::new(RECURSIVE_PT_WINDOW | (d << 12));
            assert_eq!(pt.pd_index(), 1023);
            assert_eq!(pt.pt_index(), d);
        }
    }

    #[test]
    fn page_rounding() {
        assert_eq!(round_up_to_pages(0), 0);
        assert_eq!(round_up_to_pages(1), 4096);
        assert_eq!(round_up_to_pages(4096), 4096);
        assert_eq!(round_up_to_pages(4097), 8192);
        assert_eq!(pages_spanning(3 * 4096 + 1), 4);
    }
}
