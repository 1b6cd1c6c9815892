//! The `efi "<path>" [args]` configuration command: a chainload path for a
//! native EFI executable. Unlike `initium`/
//! `linux`, there is nothing here to parse or validate ahead of time — the
//! firmware itself rejects an image it cannot load when `LoadImage` runs, so
//! this command only has to resolve the path and carry it (plus any
//! `LoadOptions` string) to the firmware-facing loader.

use alloc::rc::Rc;
use alloc::string::String;
use core::cell::RefCell;

use crate::config::{CommandContext, ConfigError, Environment, LoaderOps, Value};
use crate::device::DeviceTree;
use crate::fs::Handle;
use crate::status::Location;

/// Bound once `efi` has resolved its path; the firmware-facing loader reads
/// `path` back out via [`LoaderOps::as_any`] to build the EFI device path
/// and, if present, `args` to set as `LoadOptions`.
pub struct EfiLoaderOps {
    pub image: Handle,
    pub path: String,
    pub args: Option<String>,
}

impl LoaderOps for EfiLoaderOps {
    fn name(&self) -> &'static str {
        "efi"
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

/// `efi "<path>" ["<load-options>"]`.
pub fn cmd_efi<'a>(env: &Rc<RefCell<Environment>>, ctx: &mut CommandContext<'a>, args: &[Value]) -> Result<(), ConfigError> {
    if args.is_empty() || args.len() > 2 {
        return Err(err("'efi' expects an image path and an optional load-options string"));
    }
    let path = match &args[0] {
        Value::String(s) => s.clone(),
        _ => return Err(err("'efi' expects a string argument")),
    };
    let load_args = match args.get(1) {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(err("'efi' expects a string load-options argument")),
    };

    let image = resolve_path(ctx.devices, &env.borrow(), &path)?;

    let mut e = env.borrow_mut();
    if e.is_frozen() {
        return Err(err("environment is already bound to a loader"));
    }
    e.loader_ops = Some(alloc::boxed::Box::new(EfiLoaderOps { image, path, args: load_args }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceKind, DeviceOps, DeviceTree};
    use crate::fs::{FsOps, FsPrivate, Mount};
    use crate::status::{Result as FsResult, Status};
    use alloc::vec::Vec;

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

    fn env_with_files(files: Vec<(&'static str, Vec<u8>)>) -> (Rc<RefCell<Environment>>, DeviceTree) {
        let mut tree = DeviceTree::new();
        let mount = Mount { label: None, uuid: None, case_insensitive: false, ops: alloc::boxed::Box::new(MemFs { files }) };
        let device = tree.register(Device::new("hd0", DeviceKind::Disk, alloc::boxed::Box::new(NullDeviceOps)), |_| Some(mount));
        let env = Environment::root();
        env.borrow_mut().device = Some(device);
        (env, tree)
    }

    #[test]
    fn binds_loader_ops_with_no_args() {
        let (env, mut tree) = env_with_files(alloc::vec![("shell.efi", alloc::vec![0u8; 4])]);
        let mut ctx = CommandContext::new(&mut tree);
        cmd_efi(&env, &mut ctx, &[Value::String(String::from("shell.efi"))]).unwrap();
        assert!(env.borrow().is_frozen());
    }

    #[test]
    fn binds_load_options_when_given() {
        let (env, mut tree) = env_with_files(alloc::vec![("shell.efi", alloc::vec![0u8; 4])]);
        let mut ctx = CommandContext::new(&mut tree);
        cmd_efi(
            &env,
            &mut ctx,
            &[Value::String(String::from("shell.efi")), Value::String(String::from("-v"))],
        )
        .unwrap();
        let guard = env.borrow();
        let ops = guard.loader_ops.as_ref().unwrap();
        let efi_ops = ops.as_any().downcast_ref::<EfiLoaderOps>().unwrap();
        assert_eq!(efi_ops.args.as_deref(), Some("-v"));
    }

    #[test]
    fn missing_path_is_a_config_error() {
        let (env, mut tree) = env_with_files(Vec::new());
        let mut ctx = CommandContext::new(&mut tree);
        assert!(cmd_efi(&env, &mut ctx, &[]).is_err());
    }

    #[test]
    fn unresolvable_path_is_a_config_error() {
        let (env, mut tree) = env_with_files(Vec::new());
        let mut ctx = CommandContext::new(&mut tree);
        assert!(cmd_efi(&env, &mut ctx, &[Value::String(String::from("missing.efi"))]).is_err());
    }
}
