//! The Linux bzImage loader's firmware-independent half: command-line
//! splitting and joining into the combined `BOOT_IMAGE=` form, plus the
//! real-mode header's protocol-version and EFI-handover validation.
//!
//! Everything here stops at the real-mode header: building the EFI handover
//! device path, installing the initrd `LoadFile2` protocol, and the actual
//! jump are firmware-facing and stay in the `alpheratz` binary crate.

use alloc::string::String;

use crate::status::{Result, Status};

/// Offset of the real-mode setup header within a bzImage file, per the
/// documented Linux boot protocol's `hdr.*` field layout.
const HEADER_OFFSET: usize = 0x1f1;
const BOOT_FLAG_OFFSET: usize = 0x1fe;
const BOOT_FLAG_MAGIC: u16 = 0xaa55;
const HDR_MAGIC_OFFSET: usize = 0x202;
const HDR_MAGIC: u32 = 0x5372_6448; // "HdrS"

/// `XLF_EFI_HANDOVER_64`, the only `xloadflags` bit this loader checks.
const LINUX_XLOAD_EFI_HANDOVER_64: u16 = 1 << 3;

/// Minimum protocol version with EFI handover support at all (`2.11`).
const MIN_HANDOVER_VERSION: u16 = 0x20b;
/// Version from which the kernel distinguishes 32- and 64-bit handover
/// entries via `xloadflags` (`2.12`).
const XLOADFLAGS_VERSION: u16 = 0x20c;

/// 64-bit handover entry is 512 bytes past the 32-bit one
/// (`linux_platform_check`/`linux_platform_enter`, AMD64 EFI loader).
const HANDOVER_64_OFFSET: u64 = 512;

fn read_u16(bytes: &[u8], offset: usize) -> Result<u16> {
    let b = bytes.get(offset..offset + 2).ok_or(Status::MalformedImage)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let b = bytes.get(offset..offset + 4).ok_or(Status::MalformedImage)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(bytes: &[u8], offset: usize) -> Result<u64> {
    let b = bytes.get(offset..offset + 8).ok_or(Status::MalformedImage)?;
    Ok(u64::from_le_bytes(b.try_into().unwrap()))
}

/// The fields of the real-mode setup header this loader actually needs.
/// Field names and byte offsets (relative to [`HEADER_OFFSET`]) follow the
/// documented Linux boot protocol's version and `xloadflags` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinuxHeader {
    pub protocol_version: u16,
    pub code32_start: u32,
    pub handover_offset: u32,
    pub xloadflags: u16,
    pub init_size: u32,
    pub pref_address: u64,
    pub kernel_alignment: u32,
    pub relocatable_kernel: bool,
}

impl LinuxHeader {
    /// Parse and validate the setup header embedded in `kernel` (a bzImage
    /// file, or just its first sector). Rejects anything lacking the
    /// `0xAA55` boot flag or `HdrS` header magic before reading further
    /// fields, per the boot protocol's own self-description check.
    pub fn parse(kernel: &[u8]) -> Result<LinuxHeader> {
        if read_u16(kernel, BOOT_FLAG_OFFSET)? != BOOT_FLAG_MAGIC {
            return Err(Status::UnknownImage);
        }
        if read_u32(kernel, HDR_MAGIC_OFFSET)? != HDR_MAGIC {
            return Err(Status::UnknownImage);
        }

        let protocol_version = read_u16(kernel, HEADER_OFFSET + 0x06)?;
        let code32_start = read_u32(kernel, HEADER_OFFSET + 0x14)?;
        let handover_offset = if protocol_version >= MIN_HANDOVER_VERSION {
            read_u32(kernel, HEADER_OFFSET + 0x64)?
        } else {
            0
        };
        let xloadflags = if protocol_version >= XLOADFLAGS_VERSION {
            read_u16(kernel, HEADER_OFFSET + 0x36)?
        } else {
            0
        };
        let init_size = if protocol_version >= 0x205 { read_u32(kernel, HEADER_OFFSET + 0x60)? } else { 0 };
        let pref_address = if protocol_version >= 0x206 { read_u64(kernel, HEADER_OFFSET + 0x58)? } else { 0 };
        let kernel_alignment = if protocol_version >= 0x20a { read_u32(kernel, HEADER_OFFSET + 0x20)? } else { 0x10_0000 };
        let relocatable_kernel =
            protocol_version >= 0x205 && *kernel.get(HEADER_OFFSET + 0x24).ok_or(Status::MalformedImage)? != 0;

        Ok(LinuxHeader {
            protocol_version,
            code32_start,
            handover_offset,
            xloadflags,
            init_size,
            pref_address,
            kernel_alignment,
            relocatable_kernel,
        })
    }

    /// The kernel must support EFI handover at all,
    /// and (from protocol 2.12 on) must say it supports the 64-bit entry
    /// point specifically — this loader never enters through the 32-bit one.
    pub fn validate_efi_handover(&self) -> Result<()> {
        if self.protocol_version < MIN_HANDOVER_VERSION || self.handover_offset == 0 {
            return Err(Status::NotSupported);
        }
        if self.protocol_version >= XLOADFLAGS_VERSION && self.xloadflags & LINUX_XLOAD_EFI_HANDOVER_64 == 0 {
            return Err(Status::NotSupported);
        }
        Ok(())
    }

    /// 64-bit EFI handover entry point, given the address the kernel image
    /// was loaded at (`linux_platform_check`'s `code32_start +
    /// handover_offset + 512`). `loaded_base` is `code32_start` itself when
    /// the kernel was loaded at its preferred address unmodified; callers
    /// that relocate the image must adjust accordingly.
    pub fn handover_entry(&self, loaded_base: u64) -> u64 {
        loaded_base + self.handover_offset as u64 + HANDOVER_64_OFFSET
    }
}

/// `BOOT_IMAGE=<path> <args>` (`linux_loader_load`'s `cmdline` assembly).
pub fn build_cmdline(path: &str, args: &str) -> String {
    let mut out = String::with_capacity(11 + path.len() + 1 + args.len());
    out.push_str("BOOT_IMAGE=");
    out.push_str(path);
    if !args.is_empty() {
        out.push(' ');
        out.push_str(args);
    }
    out
}

/// Split a `"<path> <args>"` command string into its path and argument
/// halves at the first unescaped space, matching `split_cmdline`'s
/// backslash-escape handling.
pub fn split_cmdline(s: &str) -> (String, String) {
    let mut path = String::new();
    let mut escaped = false;
    let mut split_at = s.len();

    for (i, c) in s.char_indices() {
        if !escaped && c == '\\' {
            escaped = true;
            continue;
        }
        if !escaped && c == ' ' {
            split_at = i;
            break;
        }
        path.push(c);
        escaped = false;
    }

    let args = if split_at < s.len() { s[split_at + 1..].trim_start() } else { "" };
    (path, String::from(args))
}
