//! The environment model: scoped name→value lookup with parent-chaining.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::String;
use core::cell::RefCell;

use crate::device::Device;
use crate::fs::Handle;

use super::lexer::ConfigError;
use super::value::Value;

/// Bound once a loader command (`initium`, `linux`, …) has parsed its
/// arguments and is ready to run; after this the environment is logically
/// immutable. `as_any` lets the firmware-facing caller recover the
/// concrete type it bound (`InitiumLoaderOps`, `LinuxLoaderOps`, …) once it
/// has dispatched on [`LoaderOps::name`] — this module only needs to move
/// the value around, never inspect it.
pub trait LoaderOps {
    fn name(&self) -> &'static str;

    fn as_any(&self) -> &dyn core::any::Any;
}

pub struct Environment {
    parent: Option<Rc<RefCell<Environment>>>,
    entries: BTreeMap<String, Value>,
    pub device: Option<Rc<Device>>,
    pub directory: Option<Handle>,
    pub loader_ops: Option<alloc::boxed::Box<dyn LoaderOps>>,
    /// First error trapped while executing this environment's commands
    /// under an `entry { … }` error handler; `None` for environments
    /// that are not menu entries or that ran to completion.
    pub deferred_error: Option<ConfigError>,
}

impl Environment {
    pub fn root() -> Rc<RefCell<Environment>> {
        Rc::new(RefCell::new(Environment {
            parent: None,
            entries: BTreeMap::new(),
            device: None,
            directory: None,
            loader_ops: None,
            deferred_error: None,
        }))
    }

    /// A fresh child environment, as created by `command_list_exec`.
    pub fn child(parent: &Rc<RefCell<Environment>>) -> Rc<RefCell<Environment>> {
        Rc::new(RefCell::new(Environment {
            parent: Some(parent.clone()),
            entries: BTreeMap::new(),
            device: parent.borrow().device.clone(),
            directory: parent.borrow().directory.clone(),
            loader_ops: None,
            deferred_error: None,
        }))
    }

    /// Look up `name`, chaining to parent environments.
    pub fn lookup(this: &Rc<RefCell<Environment>>, name: &str) -> Option<Value> {
        let env = this.borrow();
        if let Some(value) = env.entries.get(name) {
            return Some(value.clone());
        }
        match &env.parent {
            Some(parent) => Environment::lookup(parent, name),
            None => None,
        }
    }

    /// Insert or update a value in *this* environment only (never a
    /// parent). Fails if `loader_ops` is already bound.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Result<(), ()> {
        if self.loader_ops.is_some() {
            return Err(());
        }
        self.entries.insert(name.into(), value);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.remove(name);
    }

    pub fn is_frozen(&self) -> bool {
        self.loader_ops.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_chains_to_parent() {
        let root = Environment::root();
        root.borrow_mut().insert("a", Value::Integer(1)).unwrap();
        let child = Environment::child(&root);
        assert_eq!(Environment::lookup(&child, "a"), Some(Value::Integer(1)));
    }

    #[test]
    fn insert_is_local_to_child() {
        let root = Environment::root();
        let child = Environment::child(&root);
        child.borrow_mut().insert("a", Value::Integer(2)).unwrap();
        assert_eq!(Environment::lookup(&root, "a"), None);
        assert_eq!(Environment::lookup(&child, "a"), Some(Value::Integer(2)));
    }

    #[test]
    fn set_fails_once_loader_ops_bound() {
        struct Fake;
        impl LoaderOps for Fake {
            fn name(&self) -> &'static str {
                "fake"
            }

            fn as_any(&self) -> &dyn core::any::Any {
                self
            }
        }
        let root = Environment::root();
        root.borrow_mut().loader_ops = Some(alloc::boxed::Box::new(Fake));
        assert!(root.borrow_mut().insert("a", Value::Integer(1)).is_err());
    }
}
