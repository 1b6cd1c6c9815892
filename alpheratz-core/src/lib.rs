//! Firmware- and architecture-independent bootloader core.
//!
//! This crate implements the parts of the boot process that do not depend
//! on which firmware (BIOS or UEFI) or CPU architecture the loader is
//! running under: the physical/virtual memory managers, the
//! device tree and filesystem contract, the configuration
//! engine, the Initium kernel loader, and the
//! firmware-independent halves of the Linux and Multiboot1 auxiliary
//! loaders. Firmware entry stubs, console drivers, the menu/shell
//! presentation layer, and
//! architecture-specific trampoline assembly are external collaborators
//! that live in the `alpheratz` binary crate and implement the traits this
//! crate exposes ([`memory::PhysAllocator`], [`mmu::MmuContext`],
//! [`device::DeviceOps`], [`fs::FsOps`]).
//!
//! `cargo test` links the standard allocator so the unit tests below can
//! run without a platform-specific one; real boot targets build with
//! `no_std` and supply their own `#[global_allocator]` in the binary crate.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod error;

pub mod config;
pub mod device;
pub mod efi;
pub mod fs;
pub mod initium;
pub mod linux;
pub mod memory;
pub mod mmu;
pub mod multiboot;
pub mod status;
pub mod vmem;
