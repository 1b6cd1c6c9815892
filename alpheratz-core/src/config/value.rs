//! Value literals.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use super::CommandList;

/// A parsed argument or environment value. `Reference` is an intermediate
/// form produced while reading a bare word that might name a variable; it
/// is resolved before reaching a command handler and never observed by one.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(u64),
    Boolean(bool),
    String(String),
    List(Vec<Value>),
    CommandList(CommandList),
    Reference(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Boolean(_) => "boolean",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::CommandList(_) => "command list",
            Value::Reference(_) => "reference",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<u64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::String(s) => {
                write!(f, "\"")?;
                for ch in s.chars() {
                    match ch {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        other => write!(f, "{other}")?,
                    }
                }
                write!(f, "\"")
            }
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::CommandList(list) => write!(f, "{{ {list} }}"),
            Value::Reference(name) => write!(f, "{name}"),
        }
    }
}
