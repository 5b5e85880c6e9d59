//! IDE / ATA disk support, PIO mode only.
//!
//! The kernel drives a single ATA channel in polled PIO mode; there is no request queue and no
//! interrupt involvement, which fits the single-threaded, fully synchronous disk contract the
//! filesystem relies on.

pub mod ata_command;
pub mod ata_pio;

/// Errors specific to the ATA transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AtaError {
    /// No drive answered on the channel.
    DriveNotPresent,

    /// The device never left the busy state.
    Timeout,

    /// The device raised its error bit.
    DeviceError,

    /// The command is not valid for this device.
    InvalidCommand,
}

impl crate::errors::BaseError for AtaError {}

impl From<AtaError> for crate::errors::IOError {
    fn from(err: AtaError) -> Self {
        match err {
            AtaError::Timeout => crate::errors::IOError::IOTimeout,
            AtaError::InvalidCommand => crate::errors::IOError::InvalidCommand,
            AtaError::DeviceError => crate::errors::IOError::DeviceError,
            AtaError::DriveNotPresent => crate::errors::IOError::Unknown,
        }
    }
}
