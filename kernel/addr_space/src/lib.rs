//! Accessors that turn physical and virtual addresses into memory.
//!
//! This is the only crate that conjures pointers out of raw addresses.
//! Everything above it (frame bitmaps, page tables, VM pool region
//! arrays) goes through the two traits here, so the unsafety has exactly
//! one home:
//! * [`PhysMap`] reaches a frame of physical memory. Before paging is
//!   enabled the kernel runs on an identity mapping, so
//!   [`IdentityPhysMap`] simply casts the physical address.
//! * [`ActiveSpace`] reaches memory through the currently loaded address
//!   space. On hardware that is a plain dereference ([`RawActiveSpace`]);
//!   a page that has not been touched yet is materialized by the fault
//!   handler on first access.
//!
//! The recursive-window address math also lives here because it is the
//! virtual-address twin of the physical accessors.

#![no_std]

#[cfg(test)]
extern crate std;

use kernel_config::memory::{
    ENTRIES_PER_PAGE_TABLE, PAGE_SHIFT, RECURSIVE_PD_ADDRESS, RECURSIVE_PT_WINDOW,
};
use memory_structs::{Frame, PhysicalAddress, VirtualAddress};

/// Access to physical memory by physical address.
pub trait PhysMap: Send + Sync {
    /// Returns a raw pointer to the byte at physical address `addr`.
    ///
    /// # Safety
    /// The caller must ensure `addr` lies in RAM this kernel owns and that
    /// no aliasing references to the same bytes are live.
    unsafe fn phys_ptr(&self, addr: PhysicalAddress) -> *mut u8;
}

/// Byte view of `len` bytes starting at the beginning of `frame`.
///
/// # Safety
/// Same obligations as [`PhysMap::phys_ptr`], plus the view must stay
/// within memory the caller owns; `len` must not exceed what was set
/// aside at that frame.
pub unsafe fn frame_bytes_mut<'m>(map: &'m dyn PhysMap, frame: Frame, len: usize) -> &'m mut [u8] {
    core::slice::from_raw_parts_mut(map.phys_ptr(frame.start_address()), len)
}

/// View of `frame` as a 1024-entry page directory or page table.
///
/// # Safety
/// Same obligations as [`PhysMap::phys_ptr`]; the frame must hold a
/// paging structure that nothing else is concurrently referencing.
pub unsafe fn table_mut<'m>(map: &'m dyn PhysMap, frame: Frame) -> &'m mut [u32; 1024] {
    &mut *(map.phys_ptr(frame.start_address()) as *mut [u32; 1024])
}

/// The identity mapping: physical address == virtual address.
///
/// Valid before paging is enabled, and afterwards for the low region that
/// stays identity-mapped through page directory entry 0.
pub struct IdentityPhysMap;

impl PhysMap for IdentityPhysMap {
    unsafe fn phys_ptr(&self, addr: PhysicalAddress) -> *mut u8 {
        addr.value() as usize as *mut u8
    }
}

/// Access to memory through the currently loaded virtual address space.
pub trait ActiveSpace: Send + Sync {
    /// Returns a raw pointer to the byte at virtual address `addr` in the
    /// active address space.
    ///
    /// # Safety
    /// The caller must ensure the address is (or will be, via the fault
    /// path) backed by a mapped page, and that no aliasing references to
    /// the same bytes are live.
    unsafe fn virt_ptr(&self, addr: VirtualAddress) -> *mut u8;
}

/// Byte view of `len` bytes of the active address space starting at `addr`.
///
/// # Safety
/// Same obligations as [`ActiveSpace::virt_ptr`] over the whole range.
pub unsafe fn virt_bytes_mut<'s>(
    space: &'s dyn ActiveSpace,
    addr: VirtualAddress,
    len: usize,
) -> &'s mut [u8] {
    core::slice::from_raw_parts_mut(space.virt_ptr(addr), len)
}

/// The hardware address space: a virtual address is just a pointer.
pub struct RawActiveSpace;

impl ActiveSpace for RawActiveSpace {
    unsafe fn virt_ptr(&self, addr: VirtualAddress) -> *mut u8 {
        addr.value() as usize as *mut u8
    }
}

/// The virtual address at which the recursive self-map exposes the page
/// directory of the running address space.
pub const fn recursive_pd_address() -> VirtualAddress {
    VirtualAddress::new(RECURSIVE_PD_ADDRESS)
}

/// The virtual address at which the recursive self-map exposes the page
/// table for directory index `pd_index`.
pub const fn recursive_pt_address(pd_index: u32) -> VirtualAddress {
    VirtualAddress::new(RECURSIVE_PT_WINDOW | (pd_index << PAGE_SHIFT))
}

/// View of the running address space's page directory through the
/// recursive window. Only meaningful once paging is enabled.
///
/// # Safety
/// Paging must be enabled with a directory whose last entry is the
/// recursive self-map, and no aliasing directory views may be live.
pub unsafe fn recursive_pd_mut() -> &'static mut [u32; 1024] {
    &mut *(RECURSIVE_PD_ADDRESS as usize as *mut [u32; 1024])
}

/// View of the page table for `pd_index` through the recursive window.
///
/// # Safety
/// As [`recursive_pd_mut`], and the directory entry at `pd_index` must be
/// present.
pub unsafe fn recursive_pt_mut(pd_index: u32) -> &'static mut [u32; 1024] {
    debug_assert!(pd_index < ENTRIES_PER_PAGE_TABLE);
    &mut *(recursive_pt_address(pd_index).value() as usize as *mut [u32; 1024])
}
