//! Internal-error / boot-error split.
//!
//! `internal_error` in the source is a `__noreturn` panic pair; here it is
//! just `panic!`, invoked through [`internal_error`] so call sites read the
//! same as the source's. `boot_error` is the recoverable half and is a plain
//! value carried by [`BootError`].

use alloc::string::String;
use core::fmt;

use crate::status::Status;

/// A recoverable failure that should drop the user to the menu/shell rather
/// than halt the machine.
#[derive(Debug, Clone)]
pub struct BootError {
    pub status: Status,
    pub detail: Option<String>,
}

impl BootError {
    pub fn new(status: Status) -> Self {
        BootError { status, detail: None }
    }

    pub fn with_detail(status: Status, detail: impl Into<String>) -> Self {
        BootError { status, detail: Some(detail.into()) }
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.status, detail),
            None => write!(f, "{}", self.status),
        }
    }
}

impl From<Status> for BootError {
    fn from(status: Status) -> Self {
        BootError::new(status)
    }
}

/// Unrecoverable condition: reset the console, print message and backtrace,
/// halt. The architecture entry stub is responsible for the actual halt loop
/// after a panic handler runs; this just standardizes the message.
#[cold]
pub fn internal_error(msg: fmt::Arguments<'_>) -> ! {
    log::error!("internal error: {msg}");
    panic!("internal error: {msg}");
}

#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::error::internal_error(format_args!($($arg)*))
    };
}
