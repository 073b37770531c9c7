//! Kernel-wide error type.
//!
//! Every fallible operation in the kernel returns [`Result`]. Bootstrap
//! callers convert errors into panics with a descriptive message, device
//! probe paths log and skip the device, and user-invoked paths surface
//! the error as an errno-style code.

use core::fmt;

/// Error kinds shared across the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Heap or DMA allocation failed.
    OutOfMemory,
    /// Hardware did not respond within its deadline.
    DeviceTimeout,
    /// On-disk or firmware data failed validation (checksum, magic,
    /// descriptor length).
    InvalidFormat,
    /// An internal invariant of the owning object was violated.
    Corrupted,
    /// Parsed successfully but not implemented.
    NotSupported,
    /// Namespace lookup missed, file missing.
    NotFound,
    AlreadyExists,
    NameTooLong,
    Overflow,
    Permission,
    IsDirectory,
    NotDirectory,
    NoSpace,
    /// Caller passed an argument the operation cannot act on.
    InvalidInput,
    /// Input ended before a complete object could be decoded.
    NoData,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::OutOfMemory => "out of memory",
            KernelError::DeviceTimeout => "device timeout",
            KernelError::InvalidFormat => "invalid format",
            KernelError::Corrupted => "corrupted data",
            KernelError::NotSupported => "not supported",
            KernelError::NotFound => "not found",
            KernelError::AlreadyExists => "already exists",
            KernelError::NameTooLong => "name too long",
            KernelError::Overflow => "value overflow",
            KernelError::Permission => "permission denied",
            KernelError::IsDirectory => "is a directory",
            KernelError::NotDirectory => "not a directory",
            KernelError::NoSpace => "no space left on device",
            KernelError::InvalidInput => "invalid argument",
            KernelError::NoData => "unexpected end of data",
        };
        write!(f, "{}", msg)
    }
}

pub type Result<T> = core::result::Result<T, KernelError>;
