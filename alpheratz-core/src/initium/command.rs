//! The `initium "<path>" [...]` configuration command.
//!
//! Resolves the kernel (and, optionally, its modules) through the
//! environment's current device/directory, decodes the image's tags,
//! registers its Option tags' defaults into the environment, and binds
//! [`InitiumLoaderOps`] so the environment is ready to hand to
//! [`crate::initium::loader::load`] once a firmware/architecture caller
//! supplies the pieces this crate cannot: physical allocation, page
//! tables, and the actual jump into the kernel.

use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::config::{CommandContext, ConfigError, Environment, LoaderOps, Value};
use crate::device::DeviceTree;
use crate::fs::Handle;
use crate::initium::image::{self, Image, ImageTagOption, OptionType};
use crate::status::Location;

/// Everything bound into the environment once `initium` has parsed its
/// arguments: the open kernel handle and its decoded tags, the modules to
/// load alongside it, and the option values resolved at config time.
pub struct InitiumLoaderOps {
    pub kernel: Handle,
    pub image: Image,
    pub modules: Vec<(String, Handle)>,
}

impl LoaderOps for InitiumLoaderOps {
    fn name(&self) -> &'static str {
        "initium"
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

/// Decode an Option tag's kernel-supplied default into the `Value` it would
/// produce if the user had written `set <name> <default>` themselves.
fn default_value(opt: &ImageTagOption) -> Value {
    match opt.option_type {
        OptionType::Boolean => Value::Boolean(opt.default.first().copied().unwrap_or(0) != 0),
        OptionType::String => {
            let s = core::str::from_utf8(&opt.default).unwrap_or("").trim_end_matches('\0');
            Value::String(String::from(s))
        }
        OptionType::Integer => {
            let mut bytes = [0u8; 8];
            let n = opt.default.len().min(8);
            bytes[..n].copy_from_slice(&opt.default[..n]);
            Value::Integer(u64::from_le_bytes(bytes))
        }
    }
}

fn value_matches_option_type(value: &Value, ty: OptionType) -> bool {
    matches!(
        (ty, value),
        (OptionType::Boolean, Value::Boolean(_)) | (OptionType::String, Value::String(_)) | (OptionType::Integer, Value::Integer(_))
    )
}

/// For every Option image tag, insert the kernel's default into `env` unless
/// a value is already bound there (by an earlier `set`); a pre-existing
/// value of the wrong type is a config error.
fn register_options(env: &Rc<RefCell<Environment>>, image: &Image) -> Result<(), ConfigError> {
    for opt in image.options() {
        match Environment::lookup(env, &opt.name) {
            None => {
                env.borrow_mut()
                    .insert(opt.name.clone(), default_value(opt))
                    .map_err(|_| err("cannot register option: environment is already bound to a loader"))?;
            }
            Some(existing) => {
                if !value_matches_option_type(&existing, opt.option_type) {
                    return Err(err(alloc::format!(
                        "option '{}' is declared {:?} but '{}' is already set to a {}",
                        opt.name,
                        opt.option_type,
                        opt.name,
                        existing.type_name()
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Collect the modules named by the command's optional second argument: a
/// string names a directory to load every file from, a list names specific
/// paths.
fn resolve_modules(devices: &DeviceTree, env: &Rc<RefCell<Environment>>, arg: Option<&Value>) -> Result<Vec<(String, Handle)>, ConfigError> {
    let mut modules = Vec::new();
    match arg {
        None => {}
        Some(Value::String(dir)) => {
            let dir_handle = resolve_path(devices, &env.borrow(), dir)?;
            dir_handle
                .iterate(|name, child| {
                    if !child.is_directory {
                        modules.push((String::from(name), child.clone()));
                    }
                    true
                })
                .map_err(|_| err(alloc::format!("failed to list module directory '{dir}'")))?;
        }
        Some(Value::List(items)) => {
            for item in items {
                let Value::String(path) = item else {
                    return Err(err("module list entries must be strings"));
                };
                let handle = resolve_path(devices, &env.borrow(), path)?;
                modules.push((path.clone(), handle));
            }
        }
        Some(_) => return Err(err("'initium' expects a modules directory path or a list of paths")),
    }
    Ok(modules)
}

/// `config_cmd_initium`: `initium "<path>" ["<modules-dir>" | [module, ...]]`.
pub fn cmd_initium<'a>(env: &Rc<RefCell<Environment>>, ctx: &mut CommandContext<'a>, args: &[Value]) -> Result<(), ConfigError> {
    let path = match args.first() {
        Some(Value::String(s)) => s.clone(),
        _ => return Err(err("'initium' expects a kernel image path")),
    };

    let kernel = resolve_path(ctx.devices, &env.borrow(), &path)?;
    let bytes = read_whole(&kernel)?;
    let image = image::parse(&bytes).map_err(|_| err(alloc::format!("'{path}' is not a recognized Initium kernel image")))?;

    register_options(env, &image)?;
    let modules = resolve_modules(ctx.devices, env, args.get(1))?;

    let mut e = env.borrow_mut();
    if e.is_frozen() {
        return Err(err("environment is already bound to a loader"));
    }
    e.loader_ops = Some(alloc::boxed::Box::new(InitiumLoaderOps { kernel, image, modules }));
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

    fn note(ty: u32, desc: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let name = b"INITIUM\0";
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        out.extend_from_slice(&ty.to_le_bytes());
        out.extend_from_slice(name);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(desc);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    /// Minimal ELF64 image carrying an Image tag and a single Option tag
    /// named `quiet`, used to exercise option registration end to end.
    fn kernel_with_option() -> Vec<u8> {
        let mut image_desc = Vec::new();
        image_desc.extend_from_slice(&1u32.to_le_bytes());
        image_desc.extend_from_slice(&0u32.to_le_bytes());

        let mut option_desc = alloc::vec![0u8; 16];
        option_desc[0] = 0; // Boolean
        let name = b"quiet";
        option_desc[4..8].copy_from_slice(&(name.len() as u32).to_le_bytes());
        option_desc[8..12].copy_from_slice(&0u32.to_le_bytes()); // description length
        option_desc[12..16].copy_from_slice(&1u32.to_le_bytes()); // default length
        option_desc.extend_from_slice(name);
        option_desc.push(1); // default: true

        let notes: Vec<u8> = [note(0, &image_desc), note(2, &option_desc)].concat();

        let ehdr_size = 64u64;
        let phdr_size = 56u64;
        let note_offset = ehdr_size + phdr_size;

        let mut file = Vec::new();
        file.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        file.extend_from_slice(&2u16.to_le_bytes());
        file.extend_from_slice(&0x3Eu16.to_le_bytes());
        file.extend_from_slice(&1u32.to_le_bytes());
        file.extend_from_slice(&0x20_0000u64.to_le_bytes());
        file.extend_from_slice(&ehdr_size.to_le_bytes());
        file.extend_from_slice(&0u64.to_le_bytes());
        file.extend_from_slice(&0u32.to_le_bytes());
        file.extend_from_slice(&(ehdr_size as u16).to_le_bytes());
        file.extend_from_slice(&(phdr_size as u16).to_le_bytes());
        file.extend_from_slice(&1u16.to_le_bytes());
        file.extend_from_slice(&0u16.to_le_bytes());
        file.extend_from_slice(&0u16.to_le_bytes());
        file.extend_from_slice(&0u16.to_le_bytes());

        file.extend_from_slice(&4u32.to_le_bytes()); // PT_NOTE
        file.extend_from_slice(&0u32.to_le_bytes());
        file.extend_from_slice(&note_offset.to_le_bytes());
        file.extend_from_slice(&0u64.to_le_bytes());
        file.extend_from_slice(&0u64.to_le_bytes());
        file.extend_from_slice(&(notes.len() as u64).to_le_bytes());
        file.extend_from_slice(&(notes.len() as u64).to_le_bytes());
        file.extend_from_slice(&4u64.to_le_bytes());

        file.extend_from_slice(&notes);
        file
    }

    fn env_with_kernel(files: Vec<(&'static str, Vec<u8>)>) -> (Rc<RefCell<Environment>>, DeviceTree) {
        let mut tree = DeviceTree::new();
        let mount = Mount { label: None, uuid: None, case_insensitive: false, ops: alloc::boxed::Box::new(MemFs { files }) };
        let device = tree.register(Device::new("hd0", DeviceKind::Disk, alloc::boxed::Box::new(NullDeviceOps)), |_| Some(mount));
        let env = Environment::root();
        env.borrow_mut().device = Some(device);
        (env, tree)
    }

    #[test]
    fn binds_loader_ops_and_registers_missing_option_default() {
        let (env, mut tree) = env_with_kernel(alloc::vec![("kernel.elf", kernel_with_option())]);
        let mut ctx = CommandContext::new(&mut tree);
        let args = [Value::String(String::from("kernel.elf"))];
        cmd_initium(&env, &mut ctx, &args).unwrap();

        assert_eq!(Environment::lookup(&env, "quiet"), Some(Value::Boolean(true)));
        assert!(env.borrow().is_frozen());
    }

    #[test]
    fn existing_option_value_of_wrong_type_is_rejected() {
        let (env, mut tree) = env_with_kernel(alloc::vec![("kernel.elf", kernel_with_option())]);
        env.borrow_mut().insert("quiet", Value::Integer(1)).unwrap();
        let mut ctx = CommandContext::new(&mut tree);
        let args = [Value::String(String::from("kernel.elf"))];
        assert!(cmd_initium(&env, &mut ctx, &args).is_err());
    }

    #[test]
    fn existing_option_value_of_matching_type_is_left_untouched() {
        let (env, mut tree) = env_with_kernel(alloc::vec![("kernel.elf", kernel_with_option())]);
        env.borrow_mut().insert("quiet", Value::Boolean(false)).unwrap();
        let mut ctx = CommandContext::new(&mut tree);
        let args = [Value::String(String::from("kernel.elf"))];
        cmd_initium(&env, &mut ctx, &args).unwrap();
        assert_eq!(Environment::lookup(&env, "quiet"), Some(Value::Boolean(false)));
    }

    #[test]
    fn explicit_module_list_resolves_each_path() {
        let (env, mut tree) =
            env_with_kernel(alloc::vec![("kernel.elf", kernel_with_option()), ("mod1.km", alloc::vec![1, 2, 3])]);
        let mut ctx = CommandContext::new(&mut tree);
        let args = [
            Value::String(String::from("kernel.elf")),
            Value::List(alloc::vec![Value::String(String::from("mod1.km"))]),
        ];
        cmd_initium(&env, &mut ctx, &args).unwrap();
        let guard = env.borrow();
        let ops = guard.loader_ops.as_ref().unwrap();
        assert_eq!(ops.name(), "initium");
    }

    #[test]
    fn missing_kernel_path_is_a_config_error() {
        let (env, mut tree) = env_with_kernel(Vec::new());
        let mut ctx = CommandContext::new(&mut tree);
        assert!(cmd_initium(&env, &mut ctx, &[]).is_err());
    }

    /// A root directory holding `kernel.elf` and a `modules/` directory,
    /// itself holding `a.ko`, `b.ko`, and an empty `ignored/` subdirectory.
    struct ModuleDirFs {
        kernel: Vec<u8>,
    }

    impl FsOps for ModuleDirFs {
        fn root(&self) -> FsPrivate {
            FsPrivate::Path(String::new())
        }

        fn iterate(&self, dir: &FsPrivate, cb: &mut dyn FnMut(&str, &FsPrivate, bool) -> bool) -> FsResult<()> {
            let FsPrivate::Path(p) = dir else { return Err(Status::NotDir) };
            let entries: &[(&str, bool)] = match p.as_str() {
                "" => &[("kernel.elf", false), ("modules", true)],
                "modules" => &[("a.ko", false), ("b.ko", false), ("ignored", true)],
                "modules/ignored" => &[],
                _ => return Err(Status::NotDir),
            };
            for (name, is_dir) in entries {
                let child_path = if p.is_empty() { String::from(*name) } else { alloc::format!("{p}/{name}") };
                if !cb(name, &FsPrivate::Path(child_path), *is_dir) {
                    break;
                }
            }
            Ok(())
        }

        fn read(&self, handle: &FsPrivate, buf: &mut [u8], offset: u64) -> FsResult<()> {
            let FsPrivate::Path(p) = handle else { return Err(Status::InvalidArg) };
            let data: &[u8] = match p.as_str() {
                "kernel.elf" => &self.kernel,
                "modules/a.ko" => b"AAAA",
                "modules/b.ko" => b"BBBB",
                _ => return Err(Status::NotFile),
            };
            let offset = offset as usize;
            buf.copy_from_slice(&data[offset..offset + buf.len()]);
            Ok(())
        }

        fn size(&self, handle: &FsPrivate) -> FsResult<u64> {
            let FsPrivate::Path(p) = handle else { return Err(Status::InvalidArg) };
            let len = match p.as_str() {
                "kernel.elf" => self.kernel.len(),
                "modules/a.ko" | "modules/b.ko" => 4,
                _ => return Err(Status::NotFile),
            };
            Ok(len as u64)
        }
    }

    #[test]
    fn module_directory_skips_subdirectories() {
        let mut devtree = DeviceTree::new();
        let mount =
            Mount { label: None, uuid: None, case_insensitive: false, ops: alloc::boxed::Box::new(ModuleDirFs { kernel: kernel_with_option() }) };
        let device = devtree.register(Device::new("hd0", DeviceKind::Disk, alloc::boxed::Box::new(NullDeviceOps)), |_| Some(mount));
        let env = Environment::root();
        env.borrow_mut().device = Some(device);

        let mut ctx = CommandContext::new(&mut devtree);
        let args = [Value::String(String::from("kernel.elf")), Value::String(String::from("modules"))];
        cmd_initium(&env, &mut ctx, &args).unwrap();

        let guard = env.borrow();
        let ops = guard.loader_ops.as_ref().unwrap();
        let ops = ops.as_any().downcast_ref::<InitiumLoaderOps>().unwrap();
        let mut names: Vec<&str> = ops.modules.iter().map(|(name, _)| name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, ["a.ko", "b.ko"]);
    }
}
