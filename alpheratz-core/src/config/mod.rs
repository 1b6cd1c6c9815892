//! The configuration engine: lexer/parser (`lexer`), value literals
//! (`value`), and the environment model (`environ`), plus command dispatch
//! and the menu-entry extraction this module implements directly.

pub mod environ;
pub mod lexer;
pub mod value;

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;

use crate::device::DeviceTree;
use crate::status::Location;

pub use environ::{Environment, LoaderOps};
pub use lexer::ConfigError;
pub use value::Value;

/// Conventional search paths tried by [`load_config`].
pub const CONFIG_SEARCH_PATHS: &[&str] = &["/system/boot/loader.cfg", "/boot/loader.cfg", "/loader.cfg"];

#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub args: Vec<Value>,
    pub loc: Location,
}

/// `loc` is diagnostic metadata (where this command was written), not part
/// of its semantic identity, so equality — and the round-trip property this
/// backs — ignores it: re-serializing and re-parsing a command list moves
/// every command onto a fresh line, which would otherwise make every
/// round-trip comparison fail on position alone.
impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.args == other.args
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandList(pub Vec<Command>);

impl fmt::Display for CommandList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for cmd in &self.0 {
            write!(f, "{}", cmd.name)?;
            for arg in &cmd.args {
                write!(f, " {arg}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// A resolved, selectable boot entry.
pub struct MenuEntry {
    pub label: String,
    pub env: Rc<RefCell<Environment>>,
}

/// Context threaded through command dispatch: everything a builtin needs
/// that is not itself config-engine state.
pub struct CommandContext<'a> {
    pub devices: &'a mut DeviceTree,
    pub entries: Vec<MenuEntry>,
    pub builtins: BuiltinTable,
}

impl<'a> CommandContext<'a> {
    pub fn new(devices: &'a mut DeviceTree) -> Self {
        CommandContext { devices, entries: Vec::new(), builtins: BuiltinTable::default() }
    }
}

type BuiltinFn = for<'a> fn(&Rc<RefCell<Environment>>, &mut CommandContext<'a>, &[Value]) -> Result<(), ConfigError>;

/// Registry of commands beyond the handful of root builtins (`set`,
/// `device`, `entry`) that this module implements directly — loader
/// commands (`initium`, `linux`, …) register themselves here, since their
/// implementations live in `initium` and (for firmware-facing halves) the
/// `alpheratz` binary crate.
pub struct BuiltinTable {
    commands: alloc::collections::BTreeMap<String, BuiltinFn>,
}

impl Default for BuiltinTable {
    fn default() -> Self {
        BuiltinTable { commands: alloc::collections::BTreeMap::new() }
    }
}

impl BuiltinTable {
    pub fn register(&mut self, name: &str, f: BuiltinFn) {
        self.commands.insert(String::from(name), f);
    }
}

/// Resolve `Reference` values against the executing environment,
/// substituting a literal string when no such variable is bound — bare
/// words double as device/module names and as variable dereferences,
/// and the grammar does not distinguish the two at parse time.
fn resolve(value: &Value, env: &Rc<RefCell<Environment>>) -> Value {
    match value {
        Value::Reference(name) => Environment::lookup(env, name).unwrap_or_else(|| Value::String(name.clone())),
        Value::List(items) => Value::List(items.iter().map(|v| resolve(v, env)).collect()),
        other => other.clone(),
    }
}

/// `command_list_exec`: create a child of `parent`, run every
/// command in order, aborting on the first failure. `is_root` gates the
/// `entry` builtin, which is only valid at root scope.
pub fn command_list_exec(
    list: &CommandList,
    parent: &Rc<RefCell<Environment>>,
    ctx: &mut CommandContext,
    is_root: bool,
) -> Result<Rc<RefCell<Environment>>, ConfigError> {
    let child = Environment::child(parent);

    for cmd in &list.0 {
        if cmd.name == "entry" {
            if !is_root {
                return Err(ConfigError { loc: cmd.loc, message: String::from("'entry' is only valid at root scope") });
            }
            exec_entry(cmd, &child, ctx)?;
            continue;
        }

        let result = dispatch(cmd, &child, ctx);
        if let Err(err) = result {
            return Err(err);
        }
    }

    Ok(child)
}

/// Like [`command_list_exec`], but traps the first failure on the returned
/// environment's `deferred_error` instead of propagating it, per `entry`'s
/// error-trapping contract.
fn command_list_exec_trapping(list: &CommandList, parent: &Rc<RefCell<Environment>>, ctx: &mut CommandContext) -> Rc<RefCell<Environment>> {
    let child = Environment::child(parent);
    for cmd in &list.0 {
        let result = dispatch(cmd, &child, ctx);
        if let Err(err) = result {
            child.borrow_mut().deferred_error = Some(err);
            break;
        }
    }
    child
}

fn exec_entry(cmd: &Command, root: &Rc<RefCell<Environment>>, ctx: &mut CommandContext) -> Result<(), ConfigError> {
    let label = match cmd.args.first() {
        Some(Value::String(s)) => s.clone(),
        _ => return Err(ConfigError { loc: cmd.loc, message: String::from("'entry' expects a string label") }),
    };
    let body = match cmd.args.get(1) {
        Some(Value::CommandList(list)) => list.clone(),
        _ => return Err(ConfigError { loc: cmd.loc, message: String::from("'entry' expects a command-list body") }),
    };

    let env = command_list_exec_trapping(&body, root, ctx);
    ctx.entries.push(MenuEntry { label, env });
    Ok(())
}

fn dispatch(cmd: &Command, env: &Rc<RefCell<Environment>>, ctx: &mut CommandContext) -> Result<(), ConfigError> {
    let err = |message: &str| ConfigError { loc: cmd.loc, message: String::from(message) };

    match cmd.name.as_str() {
        "set" => builtin_set(cmd, env),
        "device" => builtin_device(cmd, env, ctx),
        "lsdevice" => Ok(()), // read-only diagnostic; presentation layer renders it.
        name => {
            if let Some(f) = ctx.builtins.commands.get(name).copied() {
                let resolved: Vec<Value> = cmd.args.iter().map(|v| resolve(v, env)).collect();
                f(env, ctx, &resolved)
            } else {
                Err(err("unknown command"))
            }
        }
    }
}

fn builtin_set(cmd: &Command, env: &Rc<RefCell<Environment>>) -> Result<(), ConfigError> {
    let err = |message: &str| ConfigError { loc: cmd.loc, message: String::from(message) };
    if cmd.args.len() != 2 {
        return Err(err("'set' expects a name and a value"));
    }
    let name = match &cmd.args[0] {
        Value::Reference(n) | Value::String(n) => n.clone(),
        _ => return Err(err("'set' expects a name as its first argument")),
    };
    let value = resolve(&cmd.args[1], env);
    env.borrow_mut().insert(name, value).map_err(|_| err("cannot 'set' once the environment is bound to a loader"))
}

fn builtin_device(cmd: &Command, env: &Rc<RefCell<Environment>>, ctx: &mut CommandContext) -> Result<(), ConfigError> {
    let err = |message: &str| ConfigError { loc: cmd.loc, message: String::from(message) };
    let name = match cmd.args.first().map(|v| resolve(v, env)) {
        Some(Value::String(s)) => s,
        _ => return Err(err("'device' expects a device name")),
    };
    let device = ctx.devices.lookup(&name).ok_or_else(|| err("device not found"))?;
    let mut e = env.borrow_mut();
    e.device = Some(device);
    e.directory = None;
    Ok(())
}

/// Try each of [`CONFIG_SEARCH_PATHS`] in turn (or `override_path` alone)
/// and parse the first one found, producing the root environment and the
/// accumulated menu entries. `builtins` is the
/// caller-assembled table of loader commands (`initium`, and eventually
/// `linux`/`multiboot`/…) — this module only owns the handful of root
/// builtins it dispatches directly.
pub fn load_config(
    read_file: impl Fn(&str) -> Option<alloc::string::String>,
    override_path: Option<&str>,
    devices: &mut DeviceTree,
    builtins: BuiltinTable,
) -> Result<(Rc<RefCell<Environment>>, Vec<MenuEntry>), ConfigError> {
    let paths: Vec<&str> = match override_path {
        Some(p) => alloc::vec![p],
        None => CONFIG_SEARCH_PATHS.to_vec(),
    };

    let source = paths
        .iter()
        .find_map(|p| read_file(p))
        .ok_or_else(|| ConfigError { loc: Location::default(), message: String::from("no configuration file found") })?;

    let list = lexer::parse(&source)?;
    let root = Environment::root();
    let mut ctx = CommandContext { devices, entries: Vec::new(), builtins };
    command_list_exec(&list, &root, &mut ctx, true)?;
    Ok((root, ctx.entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_devices() -> DeviceTree {
        DeviceTree::new()
    }

    #[test]
    fn set_then_lookup_round_trips_through_a_child_environment() {
        let list = lexer::parse("set a 42\n").unwrap();
        let root = Environment::root();
        let mut devices = no_devices();
        let mut ctx = CommandContext::new(&mut devices);
        let env = command_list_exec(&list, &root, &mut ctx, true).unwrap();
        assert_eq!(Environment::lookup(&env, "a"), Some(Value::Integer(42)));
    }

    #[test]
    fn entry_failure_is_deferred_not_propagated() {
        let list = lexer::parse("entry \"Bad\" {\n unknowncommand\n}\n").unwrap();
        let root = Environment::root();
        let mut devices = no_devices();
        let mut ctx = CommandContext::new(&mut devices);
        let result = command_list_exec(&list, &root, &mut ctx, true);
        assert!(result.is_ok());
        assert_eq!(ctx.entries.len(), 1);
        assert!(ctx.entries[0].env.borrow().deferred_error.is_some());
    }

    #[test]
    fn entry_outside_root_scope_is_rejected() {
        let list = lexer::parse("entry \"Outer\" {\n entry \"Inner\" {\n set a 1\n }\n}\n").unwrap();
        let root = Environment::root();
        let mut devices = no_devices();
        let mut ctx = CommandContext::new(&mut devices);
        let result = command_list_exec(&list, &root, &mut ctx, true);
        // the outer entry traps the inner failure rather than propagating it
        assert!(result.is_ok());
        assert!(ctx.entries[0].env.borrow().deferred_error.is_some());
    }
}
