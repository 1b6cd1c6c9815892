//! The `linux "<path> [args]" [initrd...]` configuration command: opens the
//! kernel and optional initrd(s), validates the bzImage header, and binds
//! `LinuxLoaderOps` on the current environment.

use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;

use super::header::{split_cmdline, LinuxHeader};
use crate::config::{CommandContext, ConfigError, Environment, LoaderOps, Value};
use crate::device::DeviceTree;
use crate::fs::Handle;
use crate::status::Location;

pub struct LinuxLoaderOps {
    pub kernel: Handle,
    pub initrds: Vec<Handle>,
    pub initrd_size: u64,
    pub path: String,
    pub args: String,
    pub header: LinuxHeader,
}

impl LoaderOps for LinuxLoaderOps {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }
}

fn err(message: impl Into<String>) -> ConfigError {
    ConfigError { loc: Location::default(), message: message.into() }
}

/// Resolve `path` against its leading `(devname)` prefix if present, otherwise against the environment's currently-selected device.
fn resolve_path(devices: &DeviceTree, env: &Environment, path: &str) -> Result<Handle, ConfigError> {
    let (mount, path) = match crate::device::resolve_device_prefix(devices, path) {
        Some((device, rest)) => (device.mount.borrow().clone().ok_or_else(|| err("device has no filesystem"))?, rest),
        None => {
            let device = env.device.as_ref().ok_or_else(|| err("no device selected"))?;
            (device.mount.borrow().clone().ok_or_else(|| err("device has no filesystem"))?, path)
        }
    };
    crate::fs::open(&mount, path, env.directory.as_ref()).map_err(|_| err(alloc::format!("failed to open '{path}'")))
}

fn read_whole(handle: &Handle) -> Result<Vec<u8>, ConfigError> {
    let size = handle.size().map_err(|_| err("failed to stat file"))?;
    let mut buf = alloc::vec![0u8; size as usize];
    handle.read(&mut buf, 0).map_err(|_| err("failed to read file"))?;
    Ok(buf)
}

fn add_initrd(devices: &DeviceTree, env: &Environment, path: &str, initrds: &mut Vec<Handle>, total: &mut u64) -> Result<(), ConfigError> {
    let handle = resolve_path(devices, env, path)?;
    *total += handle.size().map_err(|_| err(alloc::format!("failed to stat initrd '{path}'")))?;
    initrds.push(handle);
    Ok(())
}

pub fn cmd_linux<'a>(env: &Rc<RefCell<Environment>>, ctx: &mut CommandContext<'a>, args: &[Value]) -> Result<(), ConfigError> {
    if args.is_empty() || args.len() > 2 {
        return Err(err("'linux' expects a kernel path (with optional arguments) and an optional initrd list"));
    }
    let spec = match &args[0] {
        Value::String(s) => s.clone(),
        _ => return Err(err("'linux' expects a string argument")),
    };
    let (path, cmdline_args) = split_cmdline(&spec);

    let kernel = resolve_path(ctx.devices, &env.borrow(), &path)?;
    let bytes = read_whole(&kernel)?;
    let header = LinuxHeader::parse(&bytes).map_err(|_| err(alloc::format!("'{path}' is not a Linux kernel image")))?;
    header.validate_efi_handover().map_err(|_| err(alloc::format!("'{path}' does not support 64-bit EFI handover")))?;

    let mut initrds = Vec::new();
    let mut initrd_size = 0u64;
    if let Some(arg) = args.get(1) {
        match arg {
            Value::String(p) => add_initrd(ctx.devices, &env.borrow(), p, &mut initrds, &mut initrd_size)?,
            Value::List(items) => {
                for item in items {
                    let Value::String(p) = item else {
                        return Err(err("initrd list entries must be strings"));
                    };
                    add_initrd(ctx.devices, &env.borrow(), p, &mut initrds, &mut initrd_size)?;
                }
            }
            _ => return Err(err("'linux' expects an initrd path or a list of paths")),
        }
    }

    let mut e = env.borrow_mut();
    if e.is_frozen() {
        return Err(err("environment is already bound to a loader"));
    }
    e.loader_ops = Some(alloc::boxed::Box::new(LinuxLoaderOps { kernel, initrds, initrd_size, path, args: cmdline_args, header }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceKind, DeviceOps, DeviceTree};
    use crate::fs::{FsOps, FsPrivate, Mount};
    use crate::status::{Result as FsResult, Status};

    struct MemFs {
        files: Vec<(&'static str, Vec<u8>)>,
    }

    impl FsOps for MemFs {
        fn root(&self) -> FsPrivate {
            FsPrivate::None
        }

        fn iterate(&self, dir: &FsPrivate, cb: &mut dyn FnMut(&str, &FsPrivate, bool) -> bool) -> FsResult<()> {
            if !matches!(dir, FsPrivate::None) {
                return Err(Status::NotDir);
            }
            for (i, (name, _)) in self.files.iter().enumerate() {
                if !cb(name, &FsPrivate::Index(i as u64), false) {
                    break;
                }
            }
            Ok(())
        }

        fn read(&self, handle: &FsPrivate, buf: &mut [u8], offset: u64) -> FsResult<()> {
            let FsPrivate::Index(i) = handle else { return Err(Status::InvalidArg) };
            let data = &self.files[*i as usize].1;
            let offset = offset as usize;
            buf.copy_from_slice(&data[offset..offset + buf.len()]);
            Ok(())
        }

        fn size(&self, handle: &FsPrivate) -> FsResult<u64> {
            let FsPrivate::Index(i) = handle else { return Err(Status::InvalidArg) };
            Ok(self.files[*i as usize].1.len() as u64)
        }
    }

    struct NullDeviceOps;
    impl DeviceOps for NullDeviceOps {
        fn read(&self, _buf: &mut [u8], _offset: u64) -> FsResult<()> {
            Ok(())
        }
    }

    fn valid_kernel() -> Vec<u8> {
        let mut buf = alloc::vec![0u8; 0x300];
        buf[0x1fe..0x200].copy_from_slice(&0xaa55u16.to_le_bytes());
        buf[0x202..0x206].copy_from_slice(&0x5372_6448u32.to_le_bytes());
        buf[0x1f7..0x1f9].copy_from_slice(&0x20cu16.to_le_bytes()); // version
        buf[0x205..0x209].copy_from_slice(&0x10_0000u32.to_le_bytes()); // code32_start
        buf[0x255..0x259].copy_from_slice(&0x1000u32.to_le_bytes()); // handover_offset
        buf[0x227..0x229].copy_from_slice(&8u16.to_le_bytes()); // xloadflags: EFI_HANDOVER_64
        buf
    }

    fn env_with_files(files: Vec<(&'static str, Vec<u8>)>) -> Rc<RefCell<Environment>> {
        let mut tree = DeviceTree::new();
        let mount = Mount { label: None, uuid: None, case_insensitive: false, ops: alloc::boxed::Box::new(MemFs { files }) };
        let device = tree.register(Device::new("hd0", DeviceKind::Disk, alloc::boxed::Box::new(NullDeviceOps)), |_| Some(mount));
        let env = Environment::root();
        env.borrow_mut().device = Some(device);
        env
    }

    #[test]
    fn binds_loader_ops_and_splits_cmdline() {
        let env = env_with_files(alloc::vec![("vmlinuz", valid_kernel())]);
        let mut devices = DeviceTree::new();
        let mut ctx = CommandContext::new(&mut devices);
        cmd_linux(&env, &mut ctx, &[Value::String(String::from("/vmlinuz root=/dev/sda1 quiet"))]).unwrap();
        assert!(env.borrow().is_frozen());
    }

    #[test]
    fn rejects_non_linux_image() {
        let env = env_with_files(alloc::vec![("vmlinuz", alloc::vec![0u8; 16])]);
        let mut devices = DeviceTree::new();
        let mut ctx = CommandContext::new(&mut devices);
        assert!(cmd_linux(&env, &mut ctx, &[Value::String(String::from("/vmlinuz"))]).is_err());
    }

    #[test]
    fn resolves_initrd_list() {
        let env = env_with_files(alloc::vec![("vmlinuz", valid_kernel()), ("initrd1.img", alloc::vec![1, 2, 3]), ("initrd2.img", alloc::vec![4, 5])]);
        let mut devices = DeviceTree::new();
        let mut ctx = CommandContext::new(&mut devices);
        let list = Value::List(alloc::vec![Value::String(String::from("/initrd1.img")), Value::String(String::from("/initrd2.img"))]);
        cmd_linux(&env, &mut ctx, &[Value::String(String::from("/vmlinuz")), list]).unwrap();
        assert!(env.borrow().is_frozen());
    }

    #[test]
    fn missing_arguments_is_a_config_error() {
        let env = env_with_files(Vec::new());
        let mut devices = DeviceTree::new();
        let mut ctx = CommandContext::new(&mut devices);
        assert!(cmd_linux(&env, &mut ctx, &[]).is_err());
    }
}
