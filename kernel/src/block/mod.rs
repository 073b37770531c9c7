//! Block device abstraction layer.
//!
//! A uniform sector-addressable interface for storage devices. The
//! filesystem sits on a [`Partition`] window over a device.

use alloc::sync::Arc;
use core::fmt;

use crate::error::KernelError;

pub mod partition;
pub mod ramdisk;

pub use partition::Partition;
pub use ramdisk::RamDisk;

/// Sector-addressable I/O surface.
pub trait BlockDevice: Send + Sync {
    /// Native sector size in bytes (typically 512).
    fn sector_size(&self) -> usize;

    /// Total number of sectors on the device.
    fn sector_count(&self) -> u64;

    /// Read `count` sectors starting at `lba` into `buf`.
    ///
    /// # Errors
    /// `BlockError::OutOfBounds` when the range exceeds the device,
    /// `BlockError::IoError` on transfer failure.
    fn read_sectors(&self, lba: u64, count: usize, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Write `count` sectors starting at `lba` from `buf`.
    fn write_sectors(&self, lba: u64, count: usize, buf: &[u8]) -> Result<(), BlockError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    IoError,
    OutOfBounds,
    DeviceNotReady,
    Timeout,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::IoError => write!(f, "I/O error"),
            BlockError::OutOfBounds => write!(f, "sector out of bounds"),
            BlockError::DeviceNotReady => write!(f, "device not ready"),
            BlockError::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl From<BlockError> for KernelError {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::IoError => KernelError::Corrupted,
            BlockError::OutOfBounds => KernelError::InvalidInput,
            BlockError::DeviceNotReady => KernelError::DeviceTimeout,
            BlockError::Timeout => KernelError::DeviceTimeout,
        }
    }
}

pub type BlockDeviceRef = Arc<dyn BlockDevice>;
