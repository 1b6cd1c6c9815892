//! Firmware-facing half of the raw EFI image loader: `LoadImage` the bytes
//! resolved by `alpheratz_core::efi::cmd_efi`, set `LoadOptions` if the
//! command supplied any, then `StartImage`. If the image returns, its
//! status is handed back to the caller rather than treated as success.

use alloc::vec::Vec;
use core::fmt::Write;

use uefi::boot::{self, LoadImageSource};
use uefi::prelude::*;
use uefi::proto::loaded_image::LoadedImage;

use alpheratz_core::efi::EfiLoaderOps;

pub fn boot(ops: &EfiLoaderOps) -> Status {
    let Ok(size) = ops.image.size() else {
        return Status::LOAD_ERROR;
    };
    let mut buf = alloc::vec![0u8; size as usize];
    if ops.image.read(&mut buf, 0).is_err() {
        return Status::LOAD_ERROR;
    }

    uefi::system::with_stdout(|out| {
        let _ = write!(out, "Loading EFI image '{}' ({} bytes)...\r\n", ops.path, buf.len());
    });

    let image_handle = match boot::load_image(boot::image_handle(), LoadImageSource::FromBuffer { buffer: &buf, file_path: None }) {
        Ok(h) => h,
        Err(e) => {
            uefi::system::with_stdout(|out| {
                let _ = write!(out, "LoadImage failed: {:?}\r\n", e.status());
            });
            return e.status();
        }
    };

    if let Some(args) = &ops.args {
        let mut options_buf: Vec<u16> = alloc::vec![0u16; args.len() + 1];
        let Ok(args16) = uefi::CStr16::from_str_with_buf(args, &mut options_buf) else {
            return Status::INVALID_PARAMETER;
        };
        let size = (args16.to_u16_slice_with_nul().len() * core::mem::size_of::<u16>()) as u32;
        let mut loaded_image = match boot::open_protocol_exclusive::<LoadedImage>(image_handle) {
            Ok(v) => v,
            Err(e) => return e.status(),
        };
        unsafe {
            loaded_image.set_load_options(options_buf.as_ptr() as *const u8, size);
        }
    }

    match boot::start_image(image_handle) {
        Ok(()) => Status::SUCCESS,
        Err(e) => {
            uefi::system::with_stdout(|out| {
                let _ = write!(out, "StartImage failed: {:?}\r\n", e.status());
            });
            e.status()
        }
    }
}
