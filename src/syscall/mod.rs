//! System call surface.
//!
//! The interrupt dispatcher itself lives outside of the core; it decodes the registers of an
//! `int 0x80` and lands in one of the handlers below. Numbers are stable. Every filesystem
//! failure is translated to the `-1` (or null pointer) convention at this boundary, so user
//! code never sees the internal error kinds.

use crate::console::console_write;
use crate::drivers::ide::ata_pio::AtaDrive;
use crate::fs::ofs::file::OpenFileTable;
use crate::fs::ofs::OpalFs;
use crate::fs::{OpenFlags, Whence};
use crate::mem::lmalloc::heap::{LockedListAllocator, PagedGrower};
use crate::time;
use crate::x86;
use conquer_once::spin::OnceCell;
use spin::Mutex;

/// Stable syscall numbers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SyscallNumber {
    Test0 = 0,
    Test1 = 1,
    Sleep = 2,
    Malloc = 3,
    Free = 4,
    Write = 5,
    Open = 6,
    Close = 7,
    Read = 8,
    Seek = 9,
}

impl TryFrom<u32> for SyscallNumber {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Test0),
            1 => Ok(Self::Test1),
            2 => Ok(Self::Sleep),
            3 => Ok(Self::Malloc),
            4 => Ok(Self::Free),
            5 => Ok(Self::Write),
            6 => Ok(Self::Open),
            7 => Ok(Self::Close),
            8 => Ok(Self::Read),
            9 => Ok(Self::Seek),
            _ => Err(()),
        }
    }
}

pub const STDIN_FILENO: i32 = 0;
pub const STDOUT_FILENO: i32 = 1;
pub const STDERR_FILENO: i32 = 2;

/// Virtual base of the heap serving user `malloc`.
pub const USER_HEAP_VIRT_BASE: usize = 0x0100_0000;

/// The heap behind the `malloc`/`free` syscalls. Same design as the kernel heap, different
/// base and mapping flags.
static USER_HEAP: LockedListAllocator<PagedGrower> =
    LockedListAllocator::new(USER_HEAP_VIRT_BASE, PagedGrower::user());

static MOUNT: OnceCell<Mutex<OpalFs<AtaDrive>>> = OnceCell::uninit();
static OPEN_FILES: OnceCell<Mutex<OpenFileTable>> = OnceCell::uninit();

/// Installs the mounted root volume the file syscalls operate on.
pub fn install_mount(fs: OpalFs<AtaDrive>) {
    MOUNT.init_once(|| Mutex::new(fs));
    OPEN_FILES.init_once(|| Mutex::new(OpenFileTable::new()));
}

fn with_files<T>(f: impl FnOnce(&mut OpenFileTable, &mut OpalFs<AtaDrive>) -> T) -> Option<T> {
    let mount = MOUNT.get()?;
    let files = OPEN_FILES.get()?;

    let mut fs = mount.lock();
    let mut table = files.lock();
    Some(f(&mut table, &mut fs))
}

pub fn sys_test0() {
    crate::info!("syscall", "test system call 0");
}

pub fn sys_test1() {
    crate::info!("syscall", "test system call 1");
}

/// Blocks until the timer interrupt has drained `milliseconds` ticks.
pub fn sys_sleep(milliseconds: u32) {
    time::arm_sleep(milliseconds);

    while time::sleep_remaining() > 0 {
        x86::enable_interrupts();
        x86::halt();
        x86::disable_interrupts();
    }
    x86::enable_interrupts();
}

/// Allocates uninitialized memory for the calling program. Returns 0 when out of memory.
pub fn sys_malloc(size: u32) -> u32 {
    USER_HEAP.alloc.lock().allocate(size as usize) as u32
}

/// Releases memory obtained from [`sys_malloc`]. Unknown pointers are ignored.
pub fn sys_free(ptr: u32) {
    USER_HEAP.alloc.lock().deallocate(ptr as *mut u8);
}

/// Writes `buf` to a descriptor. 1 and 2 go to the terminal; anything from 3 upwards is an
/// open file. Returns the number of bytes written, or -1.
pub fn sys_write(fd: i32, buf: &[u8]) -> i32 {
    match fd {
        STDOUT_FILENO | STDERR_FILENO => {
            console_write(buf);
            buf.len() as i32
        }
        fd if fd >= crate::fs::ofs::file::FIRST_FILE_FD => {
            match with_files(|table, fs| table.write(fs, fd, buf)) {
                Some(Ok(count)) => count as i32,
                _ => -1,
            }
        }
        _ => -1,
    }
}

/// Opens `path`. Returns a descriptor, or -1.
pub fn sys_open(path: &str, flags: u32) -> i32 {
    match with_files(|table, fs| table.open(fs, path, OpenFlags::new(flags))) {
        Some(Ok(fd)) => fd,
        _ => -1,
    }
}

/// Closes a descriptor. Returns 0, or -1 for an unknown descriptor.
pub fn sys_close(fd: i32) -> i32 {
    let closed = OPEN_FILES
        .get()
        .map(|files| files.lock().close(fd).is_ok())
        .unwrap_or(false);

    if closed {
        0
    } else {
        -1
    }
}

/// Reads from a descriptor into `buf`. Returns the number of bytes read (0 at end-of-file),
/// or -1.
pub fn sys_read(fd: i32, buf: &mut [u8]) -> i32 {
    match with_files(|table, fs| table.read(fs, fd, buf)) {
        Some(Ok(count)) => count as i32,
        _ => -1,
    }
}

/// Repositions a descriptor's cursor. Returns the new position, or -1.
pub fn sys_seek(fd: i32, offset: i32, whence: u32) -> i32 {
    let Ok(whence) = Whence::try_from(whence) else {
        return -1;
    };

    match with_files(|table, fs| table.seek(fs, fd, offset, whence)) {
        Some(Ok(pos)) => pos,
        _ => -1,
    }
}
