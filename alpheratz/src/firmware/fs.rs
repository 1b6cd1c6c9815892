//! Device tree population and the filesystem contract's UEFI binding.
//!
//! A concrete filesystem implementation in this crate is thin by design:
//! rather than re-parsing ISO9660/FAT32 ourselves, each
//! device is a UEFI `SimpleFileSystem` volume handle and `FsOps` delegates
//! straight to the firmware's own filesystem driver, exactly as a real UEFI
//! bootloader does. Core neither knows nor cares that the backing filesystem
//! is whatever the firmware's BDS phase already mounted.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use alpheratz_core::device::{Device, DeviceKind, DeviceOps, DeviceTree};
use alpheratz_core::fs::{FsOps, FsPrivate, Mount};
use alpheratz_core::status::{Result, Status};
use uefi::boot;
use uefi::proto::media::file::{Directory, File, FileAttribute, FileInfo, FileMode, FileType as UefiFileType};
use uefi::proto::media::fs::SimpleFileSystem;

/// `FsPrivate::Path` holds a `\`-separated UEFI path relative to the
/// volume root; `SimpleFileSystem::open_volume` is cheap to call again on
/// every operation since the firmware itself owns the actual directory
/// state.
struct UefiFs {
    handle: uefi::Handle,
}

fn to_uefi_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    if !path.starts_with('\\') {
        out.push('\\');
    }
    for ch in path.chars() {
        out.push(if ch == '/' { '\\' } else { ch });
    }
    out
}

impl UefiFs {
    fn open_root(&self) -> uefi::Result<Directory> {
        let mut sfs = boot::open_protocol_exclusive::<SimpleFileSystem>(self.handle)?;
        sfs.open_volume()
    }

    fn open_dir_path(&self, path: &str) -> Option<Directory> {
        let mut root = self.open_root().ok()?;
        if path.is_empty() || path == "\\" {
            return Some(root);
        }
        let path16 = uefi::CString16::try_from(path).ok()?;
        let handle = root.open(path16.as_ref(), FileMode::Read, FileAttribute::empty()).ok()?;
        match handle.into_type().ok()? {
            UefiFileType::Dir(dir) => Some(dir),
            UefiFileType::Regular(_) => None,
        }
    }
}

impl FsOps for UefiFs {
    fn root(&self) -> FsPrivate {
        FsPrivate::Path(String::new())
    }

    fn iterate(&self, dir: &FsPrivate, cb: &mut dyn FnMut(&str, &FsPrivate, bool) -> bool) -> Result<()> {
        let FsPrivate::Path(p) = dir else { return Err(Status::NotDir) };
        let mut handle = self.open_dir_path(p).ok_or(Status::NotDir)?;
        let _ = handle.reset_entry_readout();
        loop {
            match handle.read_entry_boxed() {
                Ok(Some(info)) => {
                    let name = String::from(info.file_name());
                    if name == "." || name == ".." {
                        continue;
                    }
                    let child_path = if p.is_empty() { name.clone() } else { alloc::format!("{p}\\{name}") };
                    let keep_going = cb(&name, &FsPrivate::Path(child_path), info.is_directory());
                    if !keep_going {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => return Err(Status::DeviceError),
            }
        }
        Ok(())
    }

    fn read(&self, handle: &FsPrivate, buf: &mut [u8], offset: u64) -> Result<()> {
        let FsPrivate::Path(p) = handle else { return Err(Status::InvalidArg) };
        let mut root = self.open_root().map_err(|_| Status::DeviceError)?;
        let path16 = uefi::CString16::try_from(to_uefi_path(p).as_str()).map_err(|_| Status::InvalidArg)?;
        let raw = root.open(path16.as_ref(), FileMode::Read, FileAttribute::empty()).map_err(|_| Status::NotFound)?;
        let mut file = raw.into_regular_file().ok_or(Status::NotFile)?;
        file.set_position(offset).map_err(|_| Status::DeviceError)?;
        file.read(buf).map_err(|_| Status::EndOfFile)?;
        Ok(())
    }

    fn size(&self, handle: &FsPrivate) -> Result<u64> {
        let FsPrivate::Path(p) = handle else { return Err(Status::InvalidArg) };
        let mut root = self.open_root().map_err(|_| Status::DeviceError)?;
        let path16 = uefi::CString16::try_from(to_uefi_path(p).as_str()).map_err(|_| Status::InvalidArg)?;
        let raw = root.open(path16.as_ref(), FileMode::Read, FileAttribute::empty()).map_err(|_| Status::NotFound)?;
        let mut file = raw.into_regular_file().ok_or(Status::NotFile)?;
        let info = file.get_boxed_info::<FileInfo>().map_err(|_| Status::DeviceError)?;
        Ok(info.file_size())
    }
}

/// A disk device backed by a UEFI `SimpleFileSystem` handle. The device's
/// own `DeviceOps::read` is not exercised on this firmware-mounted path
/// — it exists so the device shows up in
/// `lsdevice` diagnostics with an identity string.
struct UefiDiskOps {
    handle: uefi::Handle,
}

impl DeviceOps for UefiDiskOps {
    fn read(&self, _buf: &mut [u8], _offset: u64) -> Result<()> {
        Err(Status::NotSupported)
    }

    fn identify(&self) -> String {
        alloc::format!("UEFI volume {:?}", self.handle)
    }
}

/// Enumerate every `SimpleFileSystem` handle the firmware's BDS phase has
/// already mounted and register one `hdN` device per volume (`device.c`'s
/// disk-registration sweep, minus the MBR/GPT partition walk: UEFI hands us
/// already-partitioned volumes directly).
pub fn populate(devices: &mut DeviceTree) {
    let Ok(handles) = boot::locate_handle_buffer(boot::SearchType::ByProtocol(&SimpleFileSystem::GUID)) else {
        return;
    };

    let boot_handle = boot::open_protocol_exclusive::<uefi::proto::loaded_image::LoadedImage>(boot::image_handle())
        .ok()
        .and_then(|li| li.device());

    for (i, &handle) in handles.iter().enumerate() {
        let name = alloc::format!("hd{i}");
        let is_boot = boot_handle == Some(handle);
        let fs = UefiFs { handle };
        let device = devices.register(Device::new(name, DeviceKind::Disk, Box::new(UefiDiskOps { handle })), |_| {
            Some(Mount { label: None, uuid: None, case_insensitive: true, ops: Box::new(fs) })
        });
        if is_boot {
            devices.boot_device = Some(device);
        }
    }
}

/// Read a whole file from a device already registered by [`populate`], used
/// by the loader before the configuration engine's own environment/device
/// plumbing exists yet.
pub fn read_whole(devices: &DeviceTree, device_name: &str, path: &str) -> Option<Vec<u8>> {
    let device = devices.lookup(device_name)?;
    let mount = device.mount.borrow().clone()?;
    let handle = alpheratz_core::fs::open(&mount, path, None).ok()?;
    let size = handle.size().ok()? as usize;
    let mut buf = alloc::vec![0u8; size];
    handle.read(&mut buf, 0).ok()?;
    Some(buf)
}

pub fn read_whole_from_boot_device(devices: &DeviceTree, path: &str) -> Option<Vec<u8>> {
    let device = devices.boot_device.clone()?;
    let mount = device.mount.borrow().clone()?;
    let handle = alpheratz_core::fs::open(&mount, path, None).ok()?;
    let size = handle.size().ok()? as usize;
    let mut buf = alloc::vec![0u8; size];
    handle.read(&mut buf, 0).ok()?;
    Some(buf)
}
