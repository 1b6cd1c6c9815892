//! Per-architecture page-table construction, selected by `target_arch`.
//!
//! x86-64 is the only architecture with a full [`alpheratz_core::mmu::MmuContext`]/
//! [`alpheratz_core::initium::loader::ArchLoader`] pair — the others are
//! design hooks for a future port rather than shipped targets, so their
//! files stay in the tree as a reference for the shape that port would
//! take without pretending to be wired into the loader today.

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "loongarch64")]
pub mod loongarch64;
#[cfg(target_arch = "riscv64")]
pub mod riscv64;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{X86_64Arch as Arch, X86_64Mmu as Mmu};
