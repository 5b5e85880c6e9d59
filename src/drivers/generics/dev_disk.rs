//! Standard API to interact with disk devices, regardless of their physical specificities.
//!
//! The `DiskDevice` trait specifies the methods through which the filesystem and the image
//! loader reach a block device; the actual implementation depends on the physical controller
//! the disk is attached to. Everything is synchronous: a call returns once the controller
//! reports the transfer complete (and, for writes, flushed).

use crate::errors::{CanFail, IOError};

/// Number of bytes per logical sector on every supported transport.
pub const SECTOR_SIZE: usize = 512;

pub trait DiskDevice {
    /// Reads `sectors_count` sectors from this drive, starting at `start_lba`, into `buffer`.
    ///
    /// - Length of `buffer` must be at least `sectors_count * SECTOR_SIZE`.
    ///
    /// - `start_lba` is 0-based and must be less than [`DiskDevice::max_sector`].
    ///
    /// # Errors
    ///
    /// Any transport error surfaces as an [`IOError`]; no retries are attempted at this layer.
    fn read(&mut self, start_lba: u32, sectors_count: u16, buffer: &mut [u8]) -> CanFail<IOError>;

    /// Writes `sectors_count` sectors from `buffer` to the drive, starting at `start_lba`.
    ///
    /// Returns only after the device has acknowledged the transfer and flushed its write cache.
    ///
    /// # Errors
    ///
    /// Any transport error surfaces as an [`IOError`]; no retries are attempted at this layer.
    fn write(&mut self, start_lba: u32, sectors_count: u16, buffer: &[u8]) -> CanFail<IOError>;

    /// Returns the maximum sector in user accessible space.
    fn max_sector(&self) -> u32;

    /// Returns the number of bytes per logical sector.
    fn logical_sector_size(&self) -> usize {
        SECTOR_SIZE
    }
}
