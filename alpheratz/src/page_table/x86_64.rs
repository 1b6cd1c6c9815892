//! x86-64 4-level paging, implementing [`alpheratz_core::mmu::MmuContext`]
//! and [`alpheratz_core::initium::loader::ArchLoader`].
//!
//! Rather than a fixed-geometry identity map, single kernel PML4 slot, and
//! physical-memory direct map, this is a lazy walker: every `map()` call
//! walks PML4 → PDPT →
//! PD → PT, allocating whichever levels are missing from the firmware
//! allocator. There is exactly one mapping granularity (4KiB pages) since
//! the Initium tag list records mappings at page granularity regardless of
//! what the underlying table entries use; a huge-page fast path
//! would only save page-table memory, not correctness.

use alpheratz_core::initium::image::Image;
use alpheratz_core::initium::loader::{ArchLoader, LoadParams};
use alpheratz_core::memory::{AllocFlags, MemoryType, PhysAllocator, PAGE_SIZE};
use alpheratz_core::mmu::{MmuContext, Mode, TrackedMmu};
use alpheratz_core::status::Result;

use crate::firmware::mem::FirmwareAllocator;

const PAGE_PRESENT: u64 = 1 << 0;
const PAGE_WRITABLE: u64 = 1 << 1;
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

fn table_entry(table: u64, index: usize) -> *mut u64 {
    (table + index as u64 * 8) as *mut u64
}

fn index_of(virt: u64, level: u32) -> usize {
    ((virt >> (12 + 9 * level)) & 0x1ff) as usize
}

/// Walk to (allocating as needed) the next table level. `table` is the
/// physical address of the parent table; returns the physical address of
/// the child table at `index`.
fn next_level(table: u64, index: usize, ty: MemoryType) -> u64 {
    let entry = table_entry(table, index);
    let raw = unsafe { entry.read() };
    if raw & PAGE_PRESENT != 0 {
        return raw & ADDR_MASK;
    }

    let mut phys_alloc = FirmwareAllocator;
    let child = phys_alloc
        .alloc(PAGE_SIZE, PAGE_SIZE, 0, 0, ty, AllocFlags::empty())
        .unwrap_or_else(|_| alpheratz_core::internal_error!("out of memory building page tables"));
    unsafe {
        core::ptr::write_bytes(child as *mut u8, 0, PAGE_SIZE as usize);
        entry.write(child | PAGE_PRESENT | PAGE_WRITABLE);
    }
    child
}

/// A single x86-64 address space, rooted at a freshly allocated PML4.
pub struct X86_64Mmu {
    pml4: u64,
    root_ty: MemoryType,
}

impl X86_64Mmu {
    fn new(root_ty: MemoryType) -> Self {
        let mut phys_alloc = FirmwareAllocator;
        let pml4 = phys_alloc
            .alloc(PAGE_SIZE, PAGE_SIZE, 0, 0, root_ty, AllocFlags::empty())
            .unwrap_or_else(|_| alpheratz_core::internal_error!("out of memory allocating PML4"));
        unsafe { core::ptr::write_bytes(pml4 as *mut u8, 0, PAGE_SIZE as usize) };
        X86_64Mmu { pml4, root_ty }
    }

    fn map_one_page(&mut self, virt: u64, phys: u64) -> bool {
        let pdpt = next_level(self.pml4, index_of(virt, 3), self.root_ty);
        let pd = next_level(pdpt, index_of(virt, 2), self.root_ty);
        let pt = next_level(pd, index_of(virt, 1), self.root_ty);
        let entry = table_entry(pt, index_of(virt, 0));

        let raw = unsafe { entry.read() };
        if raw & PAGE_PRESENT != 0 {
            return (raw & ADDR_MASK) == phys;
        }
        unsafe { entry.write(phys | PAGE_PRESENT | PAGE_WRITABLE) };
        true
    }
}

impl MmuContext for X86_64Mmu {
    fn mode(&self) -> Mode {
        Mode::Bits64
    }

    fn root_phys(&self) -> u64 {
        self.pml4
    }

    fn map(&mut self, virt: u64, phys: u64, size: u64) -> bool {
        if virt % PAGE_SIZE != 0 || phys % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return false;
        }
        let pages = size / PAGE_SIZE;
        for i in 0..pages {
            if !self.map_one_page(virt + i * PAGE_SIZE, phys + i * PAGE_SIZE) {
                return false;
            }
        }
        true
    }
}

/// The x86-64 architecture seam: nothing beyond generic 64-bit paging is
/// required (no CPU-feature gate, no extra load-parameter checks, no
/// arch-specific setup mappings) since Initium's x86-64 contract does not
/// demand anything beyond "a working page table".
#[derive(Default)]
pub struct X86_64Arch;

impl ArchLoader for X86_64Arch {
    type Mmu = X86_64Mmu;

    fn create_mmu(&mut self, _mode: Mode, root_ty: MemoryType) -> Self::Mmu {
        X86_64Mmu::new(root_ty)
    }

    fn check_kernel(&self, _image: &Image) -> Result<()> {
        Ok(())
    }

    fn check_load_params(&self, _mode: Mode, _params: &mut LoadParams) -> Result<()> {
        Ok(())
    }

    fn setup(&mut self, _mmu: &mut TrackedMmu<Self::Mmu>) -> Result<()> {
        Ok(())
    }
}
