//! File-system related code.
//!
//! Contains the implementation of the Opal filesystem (`ofs`), the open-file table backing the
//! file descriptor syscalls, and the common vocabulary types shared between them.

pub mod ofs;

use crate::errors::FsError;
use bytemuck::{Pod, Zeroable};

/// Result alias for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

/// Reference point for a `seek` operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Whence {
    /// From the beginning of the file.
    Set,

    /// From the current cursor position.
    Cur,

    /// From the end of the file.
    End,
}

impl TryFrom<u32> for Whence {
    type Error = FsError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Cur),
            2 => Ok(Whence::End),
            _ => Err(FsError::Invalid),
        }
    }
}

/// Flags accepted by the `open` syscall.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(transparent)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const O_RDONLY: Self = Self(0x0);
    pub const O_WRONLY: Self = Self(0x1);
    pub const O_RDWR: Self = Self(0x2);
    pub const O_CREAT: Self = Self(0x40);
    pub const O_APPEND: Self = Self(0x400);

    const ACCESS_MODE: u32 = 0x3;

    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub fn readable(self) -> bool {
        self.0 & Self::ACCESS_MODE != Self::O_WRONLY.0
    }

    pub fn writable(self) -> bool {
        self.0 & Self::ACCESS_MODE != Self::O_RDONLY.0
    }

    pub fn create(self) -> bool {
        self.0 & Self::O_CREAT.0 != 0
    }

    pub fn append(self) -> bool {
        self.0 & Self::O_APPEND.0 != 0
    }
}

impl core::ops::BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}
