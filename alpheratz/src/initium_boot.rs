//! Firmware-facing orchestration of the Initium kernel loader:
//! re-reads the handles `alpheratz_core::initium::command::cmd_initium`
//! resolved, gathers the option values and boot-device hint it could not
//! (those need the live environment and firmware respectively), calls
//! [`alpheratz_core::initium::loader::load`], then hands the finished
//! address spaces to [`crate::trampoline`] for the actual jump.

use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt::Write;

use alpheratz_core::config::{Environment, Value};
use alpheratz_core::initium::command::InitiumLoaderOps;
use alpheratz_core::initium::loader::{self, BootDeviceInfo, LoadRequest, LoaderFootprint, PhysWriter};
use alpheratz_core::mmu::MmuContext;
use alpheratz_core::status::Result as FsResult;
use uefi::prelude::*;
use uefi::boot;
use uefi::proto::loaded_image::LoadedImage;

use crate::firmware::mem::FirmwareAllocator;
use crate::page_table;
use crate::trampoline::{self, DirectWriter};

fn read_whole(handle: &alpheratz_core::fs::Handle) -> FsResult<Vec<u8>> {
    let size = handle.size()?;
    let mut buf = alloc::vec![0u8; size as usize];
    handle.read(&mut buf, 0)?;
    Ok(buf)
}

/// Every declared Option tag must already have a value bound in the
/// environment (`cmd_initium::register_options` guarantees this at config
/// time); collect them as owned `(name, value)` pairs for [`LoadRequest`].
fn collect_option_values(env: &Rc<RefCell<Environment>>, ops: &InitiumLoaderOps) -> Vec<(String, Value)> {
    ops.image
        .options()
        .iter()
        .filter_map(|opt| Environment::lookup(env, &opt.name).map(|v| (opt.name.clone(), v)))
        .collect()
}

/// UUID-form `fs` for a mountable device, `other` for a named-but-opaque one,
/// `none` if no device was ever selected (`add_bootdev_tag`).
fn boot_device_info(env: &Rc<RefCell<Environment>>) -> BootDeviceInfo {
    let env = env.borrow();
    match &env.device {
        None => BootDeviceInfo::None,
        Some(device) => match device.mount.borrow().as_ref().and_then(|m| m.uuid.clone()) {
            Some(uuid) => BootDeviceInfo::Fs(uuid),
            None => BootDeviceInfo::Other(device.name.clone()),
        },
    }
}

/// The loader's own link-time virtual/physical footprint, read off the
/// `LoadedImage` protocol (`setup_trampoline` needs to identity-map it in
/// the temporary trampoline address space).
fn loader_footprint() -> Option<LoaderFootprint> {
    let loaded_image = boot::open_protocol_exclusive::<LoadedImage>(boot::image_handle()).ok()?;
    let (base, size) = loaded_image.info();
    Some(LoaderFootprint { virt_start: base as u64, phys_start: base as u64, size })
}

/// Run the full Initium boot sequence and jump into the kernel. Returns a
/// `Status` only on failure — success never returns.
pub fn boot(env: &Rc<RefCell<Environment>>, ops: &InitiumLoaderOps) -> Status {
    let Ok(file) = read_whole(&ops.kernel) else {
        return Status::LOAD_ERROR;
    };

    let mut module_bufs: Vec<(String, Vec<u8>)> = Vec::with_capacity(ops.modules.len());
    for (name, handle) in &ops.modules {
        let Ok(bytes) = read_whole(handle) else {
            return Status::LOAD_ERROR;
        };
        module_bufs.push((name.clone(), bytes));
    }
    let modules: Vec<(String, &[u8])> = module_bufs.iter().map(|(n, b)| (n.clone(), b.as_slice())).collect();

    let option_values = collect_option_values(env, ops);
    let boot_device = boot_device_info(env);
    let Some(footprint) = loader_footprint() else {
        return Status::LOAD_ERROR;
    };

    let req = LoadRequest { file: &file, image: &ops.image, modules: &modules, option_values: &option_values, boot_device, loader_footprint: footprint };

    let mut arch = page_table::Arch::default();
    let mut phys = FirmwareAllocator;
    let mut writer = DirectWriter;

    let outcome = match loader::load(&mut arch, &mut phys, &mut writer, req) {
        Ok(o) => o,
        Err(status) => {
            uefi::system::with_stdout(|out| {
                let _ = write!(out, "initium: failed to load kernel: {status}\r\n");
            });
            return Status::LOAD_ERROR;
        }
    };

    let trampoline_code = trampoline::encode(outcome.kernel_mmu_root, outcome.tags_virt, outcome.entry);
    writer.write(outcome.trampoline_phys, &trampoline_code);

    uefi::system::with_stdout(|out| {
        let _ = write!(out, "initium: entry={:#x} trampoline_phys={:#x} trampoline_virt={:#x}\r\n", outcome.entry, outcome.trampoline_phys, outcome.trampoline_virt);
    });

    let trampoline_root = outcome.trampoline_mmu.root_phys();
    let trampoline_virt = outcome.trampoline_virt;

    unsafe {
        let _ = boot::exit_boot_services(Some(boot::MemoryType::LOADER_DATA));
    }

    #[cfg(target_arch = "x86_64")]
    unsafe {
        trampoline::enter(trampoline_root, trampoline_virt);
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        alpheratz_core::internal_error!("kernel entry is only implemented for x86_64");
    }
}
