//! Firmware-facing half of the Linux loader: EFI-stub handover via
//! a custom `LoadFile2` initrd protocol, reading kernel/initrd bytes from
//! an `alpheratz_core::linux::LinuxLoaderOps` rather than raw byte slices.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::ffi::c_void;
use core::fmt::Write;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use uefi::boot::{self, LoadImageSource};
use uefi::prelude::*;
use uefi::proto::loaded_image::LoadedImage;

use alpheratz_core::linux::LinuxLoaderOps;

static INITRD_DATA_PTR: AtomicPtr<u8> = AtomicPtr::new(core::ptr::null_mut());
static INITRD_DATA_LEN: AtomicUsize = AtomicUsize::new(0);

/// Vendor Media Device Path node identifying the Linux initrd, followed by
/// an End-of-Device-Path node. The Linux EFI stub (5.8+) searches for a
/// handle carrying this device path together with the LoadFile2 protocol.
#[repr(C, packed)]
struct InitrdDevicePath {
    vendor_type: u8,
    vendor_subtype: u8,
    vendor_length: [u8; 2],
    vendor_guid: [u8; 16],
    end_type: u8,
    end_subtype: u8,
    end_length: [u8; 2],
}

unsafe impl Sync for InitrdDevicePath {}

/// LINUX_EFI_INITRD_MEDIA_GUID {5568e427-68fc-4f3d-ac74-ca555231cc68}
static INITRD_DEVICE_PATH: InitrdDevicePath = InitrdDevicePath {
    vendor_type: 0x04,
    vendor_subtype: 0x03,
    vendor_length: [20, 0],
    vendor_guid: [
        0x27, 0xe4, 0x68, 0x55, 0xfc, 0x68, 0x3d, 0x4f, 0xac, 0x74, 0xca, 0x55, 0x52, 0x31, 0xcc, 0x68,
    ],
    end_type: 0x7f,
    end_subtype: 0xff,
    end_length: [4, 0],
};

#[repr(C)]
struct RawLoadFile2Protocol {
    load_file: unsafe extern "efiapi" fn(this: *mut RawLoadFile2Protocol, file_path: *const c_void, boot_policy: bool, buffer_size: *mut usize, buffer: *mut c_void) -> Status,
}

unsafe impl Sync for RawLoadFile2Protocol {}

unsafe extern "efiapi" fn initrd_load_file(_this: *mut RawLoadFile2Protocol, _file_path: *const c_void, _boot_policy: bool, buffer_size: *mut usize, buffer: *mut c_void) -> Status {
    let ptr = INITRD_DATA_PTR.load(Ordering::Relaxed);
    let len = INITRD_DATA_LEN.load(Ordering::Relaxed);

    if ptr.is_null() || len == 0 {
        return Status::NOT_FOUND;
    }

    unsafe {
        if buffer.is_null() || *buffer_size < len {
            *buffer_size = len;
            return Status::BUFFER_TOO_SMALL;
        }
        core::ptr::copy_nonoverlapping(ptr, buffer as *mut u8, len);
        *buffer_size = len;
    }

    Status::SUCCESS
}

static INITRD_LOAD_FILE2: RawLoadFile2Protocol = RawLoadFile2Protocol { load_file: initrd_load_file };

const DEVICE_PATH_PROTOCOL_GUID: uefi::Guid = uefi::guid!("09576e91-6d3f-11d2-8e39-00a0c969723b");
const LOAD_FILE2_PROTOCOL_GUID: uefi::Guid = uefi::guid!("4006c0c1-fcb3-403e-996d-4a6c8724e06d");

/// `install_initrd_load_file2` leaks its buffer for the kernel's lifetime,
/// which is fine: the loader never returns to free it once `StartImage`
/// succeeds, and if it fails we're already in a boot-error path.
fn install_initrd_load_file2(initrd_data: &'static [u8]) {
    INITRD_DATA_PTR.store(initrd_data.as_ptr() as *mut u8, Ordering::Relaxed);
    INITRD_DATA_LEN.store(initrd_data.len(), Ordering::Relaxed);

    let handle = unsafe { boot::install_protocol_interface(None, &DEVICE_PATH_PROTOCOL_GUID, &INITRD_DEVICE_PATH as *const InitrdDevicePath as *const c_void) }.expect("install initrd device path");

    unsafe { boot::install_protocol_interface(Some(handle), &LOAD_FILE2_PROTOCOL_GUID, &INITRD_LOAD_FILE2 as *const RawLoadFile2Protocol as *const c_void) }.expect("install initrd LoadFile2");
}

fn read_whole(handle: &alpheratz_core::fs::Handle) -> Option<Vec<u8>> {
    let size = handle.size().ok()? as usize;
    let mut buf = alloc::vec![0u8; size];
    handle.read(&mut buf, 0).ok()?;
    Some(buf)
}

/// Concatenate every initrd handle into one contiguous buffer.
fn concat_initrds(ops: &LinuxLoaderOps) -> Option<Vec<u8>> {
    let mut buf = Vec::with_capacity(ops.initrd_size as usize);
    for handle in &ops.initrds {
        buf.extend_from_slice(&read_whole(handle)?);
    }
    Some(buf)
}

fn print_status(prefix: &str, s: Status) {
    uefi::system::with_stdout(|out| {
        let _ = write!(out, "{}{:?}\r\n", prefix, s);
    });
}

/// Boot a `LinuxLoaderOps`-bound kernel via the EFI stub mechanism.
pub fn boot(ops: &LinuxLoaderOps) -> Status {
    let Some(kernel) = read_whole(&ops.kernel) else {
        return Status::LOAD_ERROR;
    };

    uefi::system::with_stdout(|out| {
        let _ = write!(out, "Linux EFI Stub Boot\r\n");
        let _ = write!(out, "  Kernel: {} bytes\r\n", kernel.len());
    });

    if !ops.initrds.is_empty() {
        let Some(initrd) = concat_initrds(ops) else {
            return Status::LOAD_ERROR;
        };
        uefi::system::with_stdout(|out| {
            let _ = write!(out, "  Initrd: {} bytes\r\n", initrd.len());
        });
        install_initrd_load_file2(Vec::leak(initrd));
    }

    uefi::system::with_stdout(|out| {
        let _ = write!(out, "Loading EFI kernel image...\r\n");
    });

    let image_handle = match boot::load_image(boot::image_handle(), LoadImageSource::FromBuffer { buffer: &kernel, file_path: None }) {
        Ok(h) => h,
        Err(e) => {
            print_status("LoadImage failed: ", e.status());
            uefi::system::with_stdout(|out| {
                let _ = write!(out, "Hint: kernel must be a PE/COFF EFI stub image (not ELF).\r\n");
            });
            return e.status();
        }
    };

    let cmdline = format_cmdline(ops);
    let mut cmdline_buf = alloc::vec![0u16; cmdline.len() + 1];

    if !cmdline.is_empty() {
        uefi::system::with_stdout(|out| {
            let _ = write!(out, "  Cmdline: {}\r\n", cmdline);
        });

        let cl16 = match uefi::CStr16::from_str_with_buf(&cmdline, &mut cmdline_buf) {
            Ok(v) => v,
            Err(_) => {
                uefi::system::with_stdout(|out| {
                    let _ = write!(out, "Cmdline too long\r\n");
                });
                return Status::INVALID_PARAMETER;
            }
        };
        let size = (cl16.to_u16_slice_with_nul().len() * core::mem::size_of::<u16>()) as u32;

        let mut loaded_image = match boot::open_protocol_exclusive::<LoadedImage>(image_handle) {
            Ok(v) => v,
            Err(e) => {
                print_status("OpenProtocol(LoadedImage) failed: ", e.status());
                return e.status();
            }
        };
        unsafe {
            loaded_image.set_load_options(cmdline_buf.as_ptr() as *const u8, size);
        }
    }

    uefi::system::with_stdout(|out| {
        let _ = write!(out, "Starting Linux kernel...\r\n");
    });

    match boot::start_image(image_handle) {
        Ok(()) => Status::SUCCESS,
        Err(e) => {
            print_status("StartImage failed: ", e.status());
            e.status()
        }
    }
}

/// `BOOT_IMAGE=<path> <args>`.
fn format_cmdline(ops: &LinuxLoaderOps) -> String {
    if ops.args.is_empty() {
        format!("BOOT_IMAGE={}", ops.path)
    } else {
        format!("BOOT_IMAGE={} {}", ops.path, ops.args)
    }
}
