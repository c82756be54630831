/*!
Specialized `Error` and `Result` types for guestwalk.
*/

use std::{fmt, result};

use log::{debug, error, info, trace, warn};

#[cfg(feature = "std")]
use std::error;

/// Generic error type carrying the layer it originated from and what went wrong.
///
/// Errors are plain values: they are cheap to copy and compare, and the
/// `log_*` helpers allow attaching context to the log output at the point
/// where the error is created without having to allocate.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Error(pub ErrorOrigin, pub ErrorKind);

impl Error {
    /// Returns a static string representing the type of error.
    pub fn as_str(&self) -> &'static str {
        self.1.to_str()
    }

    /// Returns a static string representing the type of error.
    pub fn into_str(self) -> &'static str {
        self.as_str()
    }

    pub fn log_error(self, err: impl fmt::Display) -> Self {
        error!("{}: {} ({})", self.0.to_str(), self.1.to_str(), err);
        self
    }

    pub fn log_warn(self, err: impl fmt::Display) -> Self {
        warn!("{}: {} ({})", self.0.to_str(), self.1.to_str(), err);
        self
    }

    pub fn log_info(self, err: impl fmt::Display) -> Self {
        info!("{}: {} ({})", self.0.to_str(), self.1.to_str(), err);
        self
    }

    pub fn log_debug(self, err: impl fmt::Display) -> Self {
        debug!("{}: {} ({})", self.0.to_str(), self.1.to_str(), err);
        self
    }

    pub fn log_trace(self, err: impl fmt::Display) -> Self {
        trace!("{}: {} ({})", self.0.to_str(), self.1.to_str(), err);
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.0.to_str(), self.1.to_str())
    }
}

#[cfg(feature = "std")]
impl error::Error for Error {}

#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorOrigin {
    Args,

    Memory,
    PhysicalMemory,
    PageCache,
    VirtualTranslate,
    VirtualMemory,

    Connector,
    GroundTruth,
    Offsets,
    OsLayer,

    Other,
}

impl ErrorOrigin {
    /// Returns a static string representing the type of error.
    pub fn to_str(self) -> &'static str {
        match self {
            ErrorOrigin::Args => "args",

            ErrorOrigin::Memory => "memory",
            ErrorOrigin::PhysicalMemory => "physical memory",
            ErrorOrigin::PageCache => "page cache",
            ErrorOrigin::VirtualTranslate => "virtual translate",
            ErrorOrigin::VirtualMemory => "virtual memory",

            ErrorOrigin::Connector => "connector",
            ErrorOrigin::GroundTruth => "ground truth",
            ErrorOrigin::Offsets => "offsets",
            ErrorOrigin::OsLayer => "oslayer",

            ErrorOrigin::Other => "other",
        }
    }
}

#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Uninitialized,
    NotSupported,
    Configuration,
    Offset,

    ArgNotExists,
    ArgValidation,
    RequiredArgNotFound,

    NotFound,
    AlreadyExists,
    OutOfBounds,
    OutOfMemoryRange,
    Encoding,

    InvalidPath,
    UnableToReadFile,
    UnableToSeekFile,
    UnableToMapFile,
    UnableToReadMemory,

    InvalidArchitecture,
    InvalidMemorySize,
    InvalidAddress,
    NonCanonical,
    NotMapped,
    MalformedTable,
    Validation,

    Connection,
    Protocol,

    Unknown,
}

impl ErrorKind {
    /// Returns a static string representing the type of error.
    pub fn to_str(self) -> &'static str {
        match self {
            ErrorKind::Uninitialized => "unitialized",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Offset => "offset error",

            ErrorKind::ArgNotExists => "the given argument does not exist",
            ErrorKind::ArgValidation => "the argument could not be validated",
            ErrorKind::RequiredArgNotFound => "required argument is not set",

            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::OutOfBounds => "out of bounds",
            ErrorKind::OutOfMemoryRange => "out of memory range",
            ErrorKind::Encoding => "encoding error",

            ErrorKind::InvalidPath => "invalid path",
            ErrorKind::UnableToReadFile => "unable to read file",
            ErrorKind::UnableToSeekFile => "unable to seek file",
            ErrorKind::UnableToMapFile => "unable to map file",
            ErrorKind::UnableToReadMemory => "unable to read memory",

            ErrorKind::InvalidArchitecture => "invalid architecture",
            ErrorKind::InvalidMemorySize => "invalid memory size",
            ErrorKind::InvalidAddress => "invalid address",
            ErrorKind::NonCanonical => "address is not canonical",
            ErrorKind::NotMapped => "address is not mapped",
            ErrorKind::MalformedTable => "malformed page table",
            ErrorKind::Validation => "structure failed validation",

            ErrorKind::Connection => "connection error",
            ErrorKind::Protocol => "protocol error",

            ErrorKind::Unknown => "unknown error",
        }
    }
}

/// Specialized `Result` type for guestwalk results.
pub type Result<T> = result::Result<T, Error>;
