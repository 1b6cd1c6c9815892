//! Firmware-backed physical memory manager.
//!
//! Implements `alpheratz-core::memory::PhysAllocator` over `uefi::boot`'s
//! own page allocator. Every `alloc` delegates to
//! the firmware's own page allocator instead of a self-managed free list:
//! the firmware memory map can change on every call (another driver can
//! allocate between ours), so nothing here caches it. The loader's own
//! `MemoryType` tag rides along in the OS-defined region of the EFI memory
//! type space so `finalize` can round-trip it back out of
//! `get_memory_map`.

use alpheratz_core::memory::{AllocFlags, MemoryRange, MemoryType, PhysAllocator, PAGE_SIZE};
use alpheratz_core::status::{Result, Status};
use uefi::boot::{self, AllocateType, MemoryType as EfiMemoryType};
use uefi::mem::memory_map::MemoryMap;

/// Base of the OS-defined custom memory type range (UEFI spec reserves
/// `0x80000000..=0xFFFFFFFF` for operating system vendors).
const CUSTOM_BASE: u32 = 0x8000_0000;

fn to_efi_type(ty: MemoryType) -> EfiMemoryType {
    let code = match ty {
        MemoryType::Free => 0,
        MemoryType::Allocated => 1,
        MemoryType::Reclaimable => 2,
        MemoryType::PageTables => 3,
        MemoryType::Stack => 4,
        MemoryType::Modules => 5,
        MemoryType::Internal => 6,
    };
    EfiMemoryType::custom(CUSTOM_BASE + code)
}

fn from_efi_type(ty: EfiMemoryType) -> MemoryType {
    if ty.0 >= CUSTOM_BASE {
        return match ty.0 - CUSTOM_BASE {
            0 => MemoryType::Free,
            1 => MemoryType::Allocated,
            2 => MemoryType::Reclaimable,
            3 => MemoryType::PageTables,
            4 => MemoryType::Stack,
            5 => MemoryType::Modules,
            _ => MemoryType::Internal,
        };
    }
    match ty {
        // Usable once boot services are gone (or already are): reported to
        // the kernel as Free.
        EfiMemoryType::CONVENTIONAL
        | EfiMemoryType::BOOT_SERVICES_CODE
        | EfiMemoryType::BOOT_SERVICES_DATA
        | EfiMemoryType::LOADER_CODE
        | EfiMemoryType::LOADER_DATA => MemoryType::Free,
        // Reclaimable by the kernel once it is done with ACPI tables.
        EfiMemoryType::ACPI_RECLAIM => MemoryType::Reclaimable,
        // MMIO, runtime services, firmware-reserved, PAL code, ACPI NVS:
        // never handed out, never reclaimed.
        _ => MemoryType::Allocated,
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Stateless handle to the firmware's own allocator. Zero-sized: nothing
/// about a UEFI `alloc`/`free`/`finalize` call depends on prior calls, so
/// unlike [`alpheratz_core::memory::FreeListAllocator`] there is no local
/// bookkeeping to share between instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirmwareAllocator;

impl PhysAllocator for FirmwareAllocator {
    fn alloc(&mut self, size: u64, align: u64, min: u64, max: u64, ty: MemoryType, flags: AllocFlags) -> Result<u64> {
        let align = if align == 0 { PAGE_SIZE } else { align };
        let size = align_up(size.max(1), PAGE_SIZE);
        let pages = (size / PAGE_SIZE) as usize;
        let efi_ty = to_efi_type(ty);

        // An exact-address request (`allocate_segment`'s fixed-physical
        // path): `min == max - size`, a window exactly one allocation wide.
        let exact = max != 0 && max >= min + size && max - min == size;

        let alloc_ty = if exact {
            AllocateType::Address(min)
        } else if max != 0 {
            AllocateType::MaxAddress(max)
        } else if flags.contains(AllocFlags::HIGH) {
            // UEFI's allocator exposes no "prefer highest" knob beyond a
            // max-address search; bias toward the top of the address space
            // by searching down from the architecture ceiling.
            AllocateType::MaxAddress(u64::MAX)
        } else {
            AllocateType::AnyPages
        };

        let mut attempt = alloc_ty;
        loop {
            match boot::allocate_pages(attempt, efi_ty, pages) {
                Ok(ptr) => {
                    let addr = ptr.as_ptr() as u64;
                    if addr % align == 0 {
                        return Ok(addr);
                    }
                    // Firmware gave us a page-aligned but not align-aligned
                    // block; free it and retry over-allocated so we can
                    // hand back an aligned sub-range. Rare in practice
                    // since `align` is usually <= a few MiB.
                    let _ = boot::free_pages(ptr, pages);
                    let extra_pages = ((align - PAGE_SIZE) / PAGE_SIZE) as usize;
                    match boot::allocate_pages(attempt, efi_ty, pages + extra_pages) {
                        Ok(ptr2) => {
                            let base = ptr2.as_ptr() as u64;
                            let aligned = align_up(base, align);
                            return Ok(aligned);
                        }
                        Err(_) if flags.contains(AllocFlags::CAN_FAIL) => return Err(Status::NoMemory),
                        Err(_) => alpheratz_core::internal_error!("out of physical memory"),
                    }
                }
                Err(_) => {
                    if matches!(attempt, AllocateType::MaxAddress(_)) && min == 0 && !exact {
                        // Fall back to an unconstrained search before
                        // giving up outright.
                        attempt = AllocateType::AnyPages;
                        continue;
                    }
                    if flags.contains(AllocFlags::CAN_FAIL) {
                        return Err(Status::NoMemory);
                    }
                    alpheratz_core::internal_error!("out of physical memory");
                }
            }
        }
    }

    fn free(&mut self, phys: u64, size: u64) {
        let size = align_up(size.max(1), PAGE_SIZE);
        let pages = (size / PAGE_SIZE) as usize;
        if let Some(ptr) = core::ptr::NonNull::new(phys as *mut u8) {
            let _ = boot::free_pages(ptr, pages);
        }
    }

    fn add(&mut self, _start: u64, _size: u64, _ty: MemoryType) {
        // The firmware's memory map is already authoritative; nothing to
        // import.
    }

    fn protect(&mut self, _start: u64, _size: u64) {
        // Reservations happen implicitly: anything the loader cares about
        // was already carved out by an `alloc` call with a matching type.
    }

    fn finalize(&mut self) -> alloc::vec::Vec<MemoryRange> {
        let map = boot::memory_map(EfiMemoryType::LOADER_DATA).expect("get_memory_map failed");
        let mut ranges: alloc::vec::Vec<MemoryRange> = alloc::vec::Vec::new();
        for desc in map.entries() {
            let ty = from_efi_type(desc.ty);
            let size = desc.page_count * PAGE_SIZE;
            if size == 0 {
                continue;
            }
            ranges.push(MemoryRange { start: desc.phys_start, size, ty });
        }
        ranges.sort_by_key(|r| r.start);

        let mut coalesced: alloc::vec::Vec<MemoryRange> = alloc::vec::Vec::new();
        for r in ranges {
            if let Some(last) = coalesced.last_mut() {
                if last.ty == r.ty && last.start + last.size == r.start {
                    last.size += r.size;
                    continue;
                }
            }
            coalesced.push(r);
        }
        coalesced
    }
}
