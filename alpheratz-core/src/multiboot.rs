//! The Multiboot1 loader's firmware-independent half: the legacy
//! info structure, memory-map array, and boot-device hint, byte-for-byte
//! per the Multiboot1 specification's `multiboot_info_t`/`multiboot_module_t`
//! layouts, with `mem_lower`/`mem_upper` derived from the E820 map.
//!
//! Physical placement of the structure, its module array, and its
//! command-line string is a firmware/architecture concern (the addresses
//! below are taken as given); this module only assembles the bytes.

use alloc::vec::Vec;

pub const INFO_SIZE: usize = 88;
pub const MODULE_SIZE: usize = 16;
/// Each map entry is prefixed with its own size field, matching
/// `multiboot_platform_load`'s `*(uint32_t*)dest = entry_size` — this is
/// the size of everything *after* that prefix (base + length + type).
pub const MMAP_ENTRY_SIZE: u32 = 20;

pub const INFO_FLAG_MEMINFO: u32 = 1 << 0;
pub const INFO_FLAG_BOOTDEV: u32 = 1 << 1;
pub const INFO_FLAG_CMDLINE: u32 = 1 << 2;
pub const INFO_FLAG_MODULES: u32 = 1 << 3;
pub const INFO_FLAG_MMAP: u32 = 1 << 6;
pub const INFO_FLAG_LDRNAME: u32 = 1 << 9;

/// One BIOS E820-style memory range, as fed to [`build_mmap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapEntry {
    pub base: u64,
    pub length: u64,
    pub entry_type: u32,
}

/// E820 "free" type, the only type `multiboot_platform_load` inspects when
/// deriving `mem_lower`/`mem_upper`.
pub const E820_TYPE_FREE: u32 = 1;

/// Encode `entries` into the Multiboot1 memory-map array: each entry is a
/// `u32` size field (always [`MMAP_ENTRY_SIZE`], since every entry here
/// carries the same three fields) followed by `base`, `length`, `type`.
pub fn build_mmap(entries: &[MmapEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.len() * (4 + MMAP_ENTRY_SIZE as usize));
    for e in entries {
        buf.extend_from_slice(&MMAP_ENTRY_SIZE.to_le_bytes());
        buf.extend_from_slice(&e.base.to_le_bytes());
        buf.extend_from_slice(&e.length.to_le_bytes());
        buf.extend_from_slice(&e.entry_type.to_le_bytes());
    }
    buf
}

/// Derive `(mem_lower, mem_upper)` in KiB from a memory map, exactly as
/// `multiboot_platform_load` does: `mem_lower` is the free range starting
/// at 0 (capped to 1MiB), `mem_upper` is the free range spanning the 1MiB
/// mark, both reported in KiB.
pub fn mem_lower_upper(entries: &[MmapEntry]) -> (u32, u32) {
    let mut lower = 0u32;
    let mut upper = 0u32;
    for e in entries {
        if e.entry_type != E820_TYPE_FREE {
            continue;
        }
        if e.base == 0 {
            lower = (e.length.min(0x10_0000) / 1024) as u32;
        } else if e.base <= 0x10_0000 && e.base + e.length > 0x10_0000 {
            upper = ((e.base + e.length - 0x10_0000) / 1024) as u32;
        }
    }
    (lower, upper)
}

/// `(disk_id << 24) | (partition_id << 16)`, the only fields
/// `multiboot_platform_load` ever sets in `boot_device` (partition byte is
/// left zero when booting from a whole disk rather than a partition).
pub fn boot_device(disk_id: u8, partition_id: Option<u8>) -> u32 {
    let mut value = (disk_id as u32) << 24;
    if let Some(p) = partition_id {
        value |= (p as u32) << 16;
    }
    value
}

/// A single Multiboot1 module entry (`multiboot_module_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleEntry {
    pub start: u32,
    pub end: u32,
    pub cmdline: u32,
}

impl ModuleEntry {
    pub fn encode(&self) -> [u8; MODULE_SIZE] {
        let mut out = [0u8; MODULE_SIZE];
        out[0..4].copy_from_slice(&self.start.to_le_bytes());
        out[4..8].copy_from_slice(&self.end.to_le_bytes());
        out[8..12].copy_from_slice(&self.cmdline.to_le_bytes());
        out
    }
}

/// The legacy `multiboot_info_t` structure, built up field by field
/// as the caller allocates physical space for the command line, module
/// array, and memory map, then encoded to its packed 88-byte wire form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Multiboot1Info {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub mmap_length: u32,
    pub mmap_addr: u32,
    pub boot_loader_name: u32,
}

impl Multiboot1Info {
    pub fn with_memory(mut self, mem_lower: u32, mem_upper: u32) -> Self {
        self.flags |= INFO_FLAG_MEMINFO;
        self.mem_lower = mem_lower;
        self.mem_upper = mem_upper;
        self
    }

    pub fn with_boot_device(mut self, boot_device: u32) -> Self {
        self.flags |= INFO_FLAG_BOOTDEV;
        self.boot_device = boot_device;
        self
    }

    pub fn with_cmdline(mut self, addr: u32) -> Self {
        self.flags |= INFO_FLAG_CMDLINE;
        self.cmdline = addr;
        self
    }

    pub fn with_modules(mut self, count: u32, addr: u32) -> Self {
        self.flags |= INFO_FLAG_MODULES;
        self.mods_count = count;
        self.mods_addr = addr;
        self
    }

    pub fn with_mmap(mut self, length: u32, addr: u32) -> Self {
        self.flags |= INFO_FLAG_MMAP;
        self.mmap_length = length;
        self.mmap_addr = addr;
        self
    }

    pub fn with_boot_loader_name(mut self, addr: u32) -> Self {
        self.flags |= INFO_FLAG_LDRNAME;
        self.boot_loader_name = addr;
        self
    }

    /// Encode to the packed 88-byte `multiboot_info_t` layout. Fields this
    /// loader never sets (`elf_sec`, drive/APM/VBE info, config table) are
    /// left zero, matching their corresponding flag bits being unset.
    pub fn encode(&self) -> [u8; INFO_SIZE] {
        let mut out = [0u8; INFO_SIZE];
        out[0..4].copy_from_slice(&self.flags.to_le_bytes());
        out[4..8].copy_from_slice(&self.mem_lower.to_le_bytes());
        out[8..12].copy_from_slice(&self.mem_upper.to_le_bytes());
        out[12..16].copy_from_slice(&self.boot_device.to_le_bytes());
        out[16..20].copy_from_slice(&self.cmdline.to_le_bytes());
        out[20..24].copy_from_slice(&self.mods_count.to_le_bytes());
        out[24..28].copy_from_slice(&self.mods_addr.to_le_bytes());
        // elf_sec[4]: bytes 28..44, left zero.
        out[44..48].copy_from_slice(&self.mmap_length.to_le_bytes());
        out[48..52].copy_from_slice(&self.mmap_addr.to_le_bytes());
        // drives_length/addr, config_table: bytes 52..64, left zero.
        out[64..68].copy_from_slice(&self.boot_loader_name.to_le_bytes());
        // apm_table, vbe_*: bytes 68..88, left zero (no video support yet).
        out
    }
}
