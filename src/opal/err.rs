use core::fmt::Debug;

/// `BaseError` is a common trait implemented by every error type defined in Opal.
///
/// It is dependent on the [`Debug`] trait, which makes sense as we are dealing with errors.
pub trait BaseError: Debug {}

/// `CanFail` is a return type for functions that are allowed to fail, and don't need to return
/// anything.
///
/// For instance, it could be used when checking if a functionality / feature is available on the
/// system, or when initializing a component, or a shared `static`.
pub type CanFail<T> = Result<(), T>;

/// `IOError` defines several error types useful when communicating with input/output devices or
/// components.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IOError {
    /// Operation resulted in a timeout.
    IOTimeout,

    /// Invalid I/O command
    InvalidCommand,

    /// The device reported an error while executing the command.
    DeviceError,

    Unknown,
}

impl BaseError for IOError {}

/// `MountError` defines the error types that may be raised while mounting a volume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MountError {
    /// The superblock does not describe a volume this system can use.
    BadSuperblock,

    IOError,
}

impl BaseError for MountError {}

/// `FsError` covers every failure a filesystem operation may report.
///
/// Each entry point of the filesystem returns one of these kinds; the syscall boundary translates
/// them to the `-1` / null convention exposed to user code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FsError {
    /// Path resolution failed.
    NotFound,

    /// A file or directory with that name already exists.
    Exists,

    /// The inode or data bitmap is exhausted.
    NoSpace,

    /// The frame allocator or a heap could not satisfy an allocation.
    Oom,

    /// The block device transport reported an error.
    Io(IOError),

    /// The operation would require single or double indirect extents.
    NotImplemented,

    /// Bad file descriptor, negative seek, or an argument out of range.
    Invalid,
}

impl BaseError for FsError {}

impl From<IOError> for FsError {
    fn from(err: IOError) -> Self {
        FsError::Io(err)
    }
}

/// Errors that may happen during the physical memory `Frame` allocation process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameAllocationError {
    /// The allocator ran out of `Frame` of appropriate size. Usually means that the system is
    /// running out of memory.
    NoAvailableFrame,
}

impl BaseError for FrameAllocationError {}

/// Errors raised while updating the page tables.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageMappingError {
    /// The frame allocator could not supply a new page table.
    TableAllocationFailed,

    /// The physical address is not page aligned.
    BadAlignment,
}

impl BaseError for PageMappingError {}
