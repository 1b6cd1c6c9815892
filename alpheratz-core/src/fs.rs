//! Handle-based filesystem contract: mount probing, ref-counted handle
//! lifetime, and path resolution with mount switching.

use alloc::rc::Rc;
use alloc::string::String;
use core::cell::RefCell;

use crate::status::{Result, Status};

/// A filesystem instance bound to a device.
pub struct Mount {
    pub label: Option<String>,
    pub uuid: Option<String>,
    pub case_insensitive: bool,
    pub ops: alloc::boxed::Box<dyn FsOps>,
}

/// Opaque, filesystem-specific handle payload. The source's `void *data`;
/// kept as an enum of the shapes real filesystems need rather than a raw
/// pointer, since core has no concrete filesystem of its own.
#[derive(Debug, Clone)]
pub enum FsPrivate {
    None,
    Index(u64),
    Path(String),
}

/// `fs_ops`. `open_path` is the fast path some filesystems provide
/// directly; when absent, [`open`] falls back to `iterate` + the generic
/// resolver below.
pub trait FsOps {
    fn root(&self) -> FsPrivate;

    fn open_path(&self, _path: &str, _from: &FsPrivate) -> Option<Result<(FsPrivate, bool)>> {
        None
    }

    fn iterate(&self, dir: &FsPrivate, cb: &mut dyn FnMut(&str, &FsPrivate, bool) -> bool) -> Result<()>;

    fn read(&self, handle: &FsPrivate, buf: &mut [u8], offset: u64) -> Result<()>;

    fn size(&self, handle: &FsPrivate) -> Result<u64>;

    /// Release any backend-side resource tied to `handle` (`fs.c`'s
    /// `file_close`'s per-backend `close` callback, e.g. a decompression
    /// stream). Most filesystems have nothing to release beyond `FsPrivate`
    /// itself going out of scope, hence the no-op default.
    fn close(&self, _handle: &FsPrivate) {}
}

/// A ref-counted handle to an open file or directory. `Drop` releases
/// the reference, replacing the source's manual `count--`/`free` pair with
/// RAII.
#[derive(Clone)]
pub struct Handle {
    pub mount: Rc<Mount>,
    pub is_directory: bool,
    inner: Rc<RefCell<FsPrivate>>,
}

impl Handle {
    fn new(mount: Rc<Mount>, is_directory: bool, private: FsPrivate) -> Self {
        Handle { mount, is_directory, inner: Rc::new(RefCell::new(private)) }
    }

    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        if self.is_directory {
            return Err(Status::NotFile);
        }
        if buf.is_empty() {
            return Ok(());
        }
        self.mount.ops.read(&self.inner.borrow(), buf, offset)
    }

    pub fn size(&self) -> Result<u64> {
        if self.is_directory {
            return Err(Status::NotFile);
        }
        self.mount.ops.size(&self.inner.borrow())
    }

    pub fn iterate(&self, mut cb: impl FnMut(&str, &Handle) -> bool) -> Result<()> {
        if !self.is_directory {
            return Err(Status::NotDir);
        }
        let mount = self.mount.clone();
        self.mount.ops.iterate(&self.inner.borrow(), &mut |name, private, is_dir| {
            let child = Handle::new(mount.clone(), is_dir, private.clone());
            cb(name, &child)
        })
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        // `inner` is shared by every `Clone` of this handle; only the clone
        // that is dropping the last reference should invoke the backend's
        // close callback.
        if Rc::strong_count(&self.inner) == 1 {
            self.mount.ops.close(&self.inner.borrow());
        }
    }
}

/// Resolve `path` relative to `from` (or the mount root if `from` is
/// `None`) by walking its components one directory at a time. The leading
/// `(devname)` device-name prefix, if any, is stripped
/// and resolved to a `mount` by the caller before reaching this function —
/// see [`crate::device::resolve_device_prefix`] — since `open` itself has no
/// access to the device tree. `from` must belong to the same mount that owns
/// `path`.
pub fn open(mount: &Rc<Mount>, path: &str, from: Option<&Handle>) -> Result<Handle> {
    let root_private = mount.ops.root();
    let starts_absolute = path.starts_with('/');

    let mut current = match (starts_absolute, from) {
        (true, _) | (false, None) => Handle::new(mount.clone(), true, root_private),
        (false, Some(h)) => h.clone(),
    };

    if let Some((private, is_dir)) = mount.ops.open_path(path, &current.inner.borrow()).transpose()? {
        return Ok(Handle::new(mount.clone(), is_dir, private));
    }

    for token in path.split('/') {
        if token.is_empty() || token == "." {
            continue;
        }
        if !current.is_directory {
            return Err(Status::NotDir);
        }

        let mut found: Option<(String, FsPrivate, bool)> = None;
        current.iterate(|name, h| {
            let matches = if mount.case_insensitive {
                name.eq_ignore_ascii_case(token)
            } else {
                name == token
            };
            if matches {
                found = Some((name.into(), h.inner.borrow().clone(), h.is_directory));
                false
            } else {
                true
            }
        })?;

        match found {
            Some((_, private, is_dir)) => current = Handle::new(mount.clone(), is_dir, private),
            None => return Err(Status::NotFound),
        }
    }

    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    /// A trivial in-memory filesystem: a single directory of files, used to
    /// exercise the path-resolution contract without real disk I/O.
    struct MemFs {
        files: Vec<(&'static str, &'static [u8])>,
    }

    impl FsOps for MemFs {
        fn root(&self) -> FsPrivate {
            FsPrivate::None
        }

        fn iterate(&self, dir: &FsPrivate, cb: &mut dyn FnMut(&str, &FsPrivate, bool) -> bool) -> Result<()> {
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

        fn read(&self, handle: &FsPrivate, buf: &mut [u8], offset: u64) -> Result<()> {
            let FsPrivate::Index(i) = handle else { return Err(Status::InvalidArg) };
            let data = self.files[*i as usize].1;
            let offset = offset as usize;
            let len = buf.len();
            buf.copy_from_slice(&data[offset..offset + len]);
            Ok(())
        }

        fn size(&self, handle: &FsPrivate) -> Result<u64> {
            let FsPrivate::Index(i) = handle else { return Err(Status::InvalidArg) };
            Ok(self.files[*i as usize].1.len() as u64)
        }
    }

    fn mount() -> Rc<Mount> {
        Rc::new(Mount {
            label: None,
            uuid: None,
            case_insensitive: false,
            ops: alloc::boxed::Box::new(MemFs { files: alloc::vec![("kernel.elf", b"hello".as_slice())] }),
        })
    }

    #[test]
    fn open_same_path_twice_yields_consistent_size_and_bytes() {
        let m = mount();
        let h1 = open(&m, "/kernel.elf", None).unwrap();
        let h2 = open(&m, "kernel.elf", None).unwrap();
        assert_eq!(h1.size().unwrap(), h2.size().unwrap());
        let mut b1 = alloc::vec![0u8; 5];
        let mut b2 = alloc::vec![0u8; 5];
        h1.read(&mut b1, 0).unwrap();
        h2.read(&mut b2, 0).unwrap();
        assert_eq!(b1, b2);
    }

    #[test]
    fn missing_entry_is_not_found() {
        let m = mount();
        assert!(matches!(open(&m, "/missing", None), Err(Status::NotFound)));
    }

    #[test]
    fn opening_component_of_file_as_directory_fails_not_dir() {
        let m = mount();
        assert!(matches!(open(&m, "/kernel.elf/x", None), Err(Status::NotDir)));
    }
}
