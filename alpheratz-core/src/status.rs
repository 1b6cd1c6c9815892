//! Status codes returned by loader operations.

use core::fmt;

/// Operation-local and path/filesystem/device/image error kinds.
///
/// Every variant carries its own one-line `Display` message so callers can
/// surface it verbatim as the "one-line summary" a boot error shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Status {
    #[error("operation not supported")]
    NotSupported,
    #[error("unknown command")]
    UnknownCommand,
    #[error("invalid argument")]
    InvalidArg,
    #[error("timed out")]
    Timeout,
    #[error("out of memory")]
    NoMemory,
    #[error("path component is not a directory")]
    NotDir,
    #[error("path does not refer to a regular file")]
    NotFile,
    #[error("requested object could not be found")]
    NotFound,
    #[error("filesystem on device is unknown")]
    UnknownFs,
    #[error("corruption detected on the filesystem")]
    CorruptFs,
    #[error("no space available on the filesystem")]
    FsFull,
    #[error("filesystem is read-only")]
    ReadOnly,
    #[error("attempted to read beyond end of file")]
    EndOfFile,
    #[error("exceeded nested symbolic link limit")]
    SymlinkLimit,
    #[error("an error occurred during a hardware operation")]
    DeviceError,
    #[error("executable image has an unrecognised format")]
    UnknownImage,
    #[error("executable image format is incorrect")]
    MalformedImage,
    #[error("other error from system firmware")]
    SystemError,
}

impl Status {
    /// Whether this status typically warrants a recoverable boot error
    /// rather than an unrecoverable panic.
    pub fn is_boot_error(self) -> bool {
        !matches!(self, Status::NoMemory)
    }
}

pub type Result<T> = core::result::Result<T, Status>;

/// A formatted location used by the configuration engine's error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}
