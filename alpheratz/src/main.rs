#![no_std]
#![no_main]

extern crate alloc;

mod debuglog;
mod efi_image;
mod firmware;
mod initium_boot;
mod linux_boot;
mod menu;
mod net;
mod page_table;
mod serial;
mod shell;
mod trampoline;

use alloc::format;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt::Write as _;
use core::panic::PanicInfo;

use alpheratz_core::config::{self, BuiltinTable, CommandContext, Environment, MenuEntry};
use alpheratz_core::device::DeviceTree;
use alpheratz_core::efi::EfiLoaderOps;
use alpheratz_core::initium::command::InitiumLoaderOps;
use alpheratz_core::linux::command::LinuxLoaderOps;
use menu::Selection;
use uefi::prelude::*;

pub const PAGE_SIZE: usize = 4096;

/// Populate the device tree (local filesystems, then — opportunistically —
/// PXE/TFTP once DHCP has had a chance to come up) ahead of reading any
/// configuration file.
fn populate_devices() -> DeviceTree {
    let mut devices = DeviceTree::new();
    firmware::fs::populate(&mut devices);
    net::try_bring_up();
    firmware::tftp::populate(&mut devices);
    devices
}

/// Read the first of [`config::CONFIG_SEARCH_PATHS`] that exists, trying
/// the boot device first and falling back to the network device.
fn read_config_source(devices: &DeviceTree) -> Option<String> {
    config::CONFIG_SEARCH_PATHS.iter().find_map(|path| {
        firmware::fs::read_whole_from_boot_device(devices, path)
            .or_else(|| firmware::tftp::read_whole(devices, path))
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn builtins() -> BuiltinTable {
    let mut table = BuiltinTable::default();
    table.register("initium", alpheratz_core::initium::command::cmd_initium);
    table.register("linux", alpheratz_core::linux::command::cmd_linux);
    table.register("efi", alpheratz_core::efi::cmd_efi);
    table
}

/// `config_init`: find and parse the configuration file, then run
/// its root command list. Inlines what `config::load_config` does rather
/// than calling it, since that helper's `read_file` closure would need to
/// borrow the same `DeviceTree` this function also hands it `&mut`.
fn load_entries(devices: &mut DeviceTree) -> Result<(Rc<RefCell<Environment>>, Vec<MenuEntry>), String> {
    let source = read_config_source(devices).ok_or_else(|| String::from("no configuration file found on any known device"))?;
    let list = config::lexer::parse(&source).map_err(|e| format!("{e}"))?;

    let root = Environment::root();
    let mut ctx = CommandContext { devices, entries: Vec::new(), builtins: builtins() };
    config::command_list_exec(&list, &root, &mut ctx, true).map_err(|e| format!("{e}"))?;
    Ok((root, ctx.entries))
}

/// Dispatch a selected, successfully-configured entry to its loader's
/// firmware-facing half, downcasting the bound [`alpheratz_core::config::LoaderOps`]
/// by the name it reports. Returns only on failure.
fn dispatch_boot(env: &Rc<RefCell<Environment>>) -> Status {
    let name = match &env.borrow().loader_ops {
        Some(ops) => ops.name(),
        None => return Status::NOT_READY,
    };

    match name {
        "initium" => {
            let borrowed = env.borrow();
            let ops = borrowed.loader_ops.as_ref().unwrap().as_any().downcast_ref::<InitiumLoaderOps>().expect("loader_ops named 'initium' must be InitiumLoaderOps");
            initium_boot::boot(env, ops)
        }
        "linux" => {
            let borrowed = env.borrow();
            let ops = borrowed.loader_ops.as_ref().unwrap().as_any().downcast_ref::<LinuxLoaderOps>().expect("loader_ops named 'linux' must be LinuxLoaderOps");
            linux_boot::boot(ops)
        }
        "efi" => {
            let borrowed = env.borrow();
            let ops = borrowed.loader_ops.as_ref().unwrap().as_any().downcast_ref::<EfiLoaderOps>().expect("loader_ops named 'efi' must be EfiLoaderOps");
            efi_image::boot(ops)
        }
        _ => Status::UNSUPPORTED,
    }
}

/// After a boot attempt fails (or a trapped config error is surfaced),
/// offer Reboot/Shell/DebugLog and act on the choice.
fn handle_boot_error(root: &Rc<RefCell<Environment>>, devices: &mut DeviceTree, detail: &str) {
    loop {
        match menu::show_boot_error(detail) {
            Selection::Shell => shell::run(root, devices),
            Selection::DebugLog => menu::show_debug_log(&debuglog::snapshot()),
            _ => return,
        }
    }
}

#[entry]
fn main() -> Status {
    debuglog::install();

    let mut devices = populate_devices();

    let (root, entries) = match load_entries(&mut devices) {
        Ok(v) => v,
        Err(message) => {
            uefi::system::with_stdout(|out| {
                let _ = writeln!(out, "configuration error: {message}");
            });
            loop {
                uefi::boot::stall(core::time::Duration::from_secs(1));
            }
        }
    };

    loop {
        match menu::show(&root, &entries) {
            Selection::Entry(i) => {
                let env = entries[i].env.clone();
                let deferred = env.borrow().deferred_error.clone();
                if let Some(err) = deferred {
                    handle_boot_error(&root, &mut devices, &format!("{err}"));
                    continue;
                }
                let status = dispatch_boot(&env);
                handle_boot_error(&root, &mut devices, &format!("boot failed: {status:?}"));
            }
            Selection::Shell => shell::run(&root, &mut devices),
            Selection::DebugLog => menu::show_debug_log(&debuglog::snapshot()),
            Selection::Firmware => menu::reboot_to_firmware(),
            Selection::Shutdown => menu::shutdown(),
        }
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log::error!("{info}");
    loop {
        uefi::boot::stall(core::time::Duration::from_secs(1));
    }
}
