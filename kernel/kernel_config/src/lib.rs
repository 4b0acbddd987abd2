//! Compile-time configuration of the kernel's memory map and devices.
//!
//! Every other crate derives its layout knowledge from here rather than
//! repeating magic numbers.

#![no_std]

#[macro_use] extern crate static_assertions;

pub mod memory;
pub mod disk;
