//! The open-file table: file descriptors, cursors and their state machine.
//!
//! Descriptors 0 to 2 are the standard streams and never appear here; regular files get
//! descriptors from 3 upwards. Each open file tracks the backing inode id, the cursor
//! position and the open flags. Positions move with `read`/`write`, `seek` only repositions,
//! and `O_APPEND` pins every write to the end of the file.

use crate::drivers::generics::dev_disk::DiskDevice;
use crate::errors::FsError;
use crate::fs::ofs::inode::{InodeNumber, InodeType};
use crate::fs::ofs::OpalFs;
use crate::fs::{FsResult, OpenFlags, Whence};
use hashbrown::HashMap;

/// First descriptor handed out for regular files; 0/1/2 are the standard streams.
pub const FIRST_FILE_FD: i32 = 3;

/// One open file: backing inode, cursor, and the flags it was opened with.
#[derive(Clone, Copy, Debug)]
pub struct OpenFile {
    pub inode: InodeNumber,
    pub pos: i64,
    pub flags: OpenFlags,
}

/// Table of every open file, keyed by descriptor.
pub struct OpenFileTable {
    files: HashMap<i32, OpenFile>,
    next_fd: i32,
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
            next_fd: FIRST_FILE_FD,
        }
    }

    /// Opens `path`, creating the file when `O_CREAT` is set and it does not exist.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] for a missing file without `O_CREAT`; [`FsError::Invalid`] when
    /// the path names a directory.
    pub fn open<D: DiskDevice>(
        &mut self,
        fs: &mut OpalFs<D>,
        path: &str,
        flags: OpenFlags,
    ) -> FsResult<i32> {
        let inode = match fs.resolve(path) {
            Ok(inode) => inode,
            Err(FsError::NotFound) if flags.create() => {
                let id = fs.create(path, InodeType::FILE)?;
                fs.read_inode(id)?
            }
            Err(err) => return Err(err),
        };

        if !inode.is_file() {
            return Err(FsError::Invalid);
        }

        let fd = self.next_fd;
        self.next_fd += 1;
        self.files.insert(
            fd,
            OpenFile {
                inode: inode.id,
                pos: 0,
                flags,
            },
        );

        Ok(fd)
    }

    /// Closes a descriptor.
    pub fn close(&mut self, fd: i32) -> FsResult<()> {
        self.files.remove(&fd).map(|_| ()).ok_or(FsError::Invalid)
    }

    /// Repositions the cursor of `fd` and returns the new position.
    ///
    /// `SEEK_SET` with a negative offset is invalid and leaves the cursor untouched;
    /// `SEEK_CUR` and `SEEK_END` compose as usual, clamping at position 0. Seeking past the
    /// end of the file is allowed.
    pub fn seek<D: DiskDevice>(
        &mut self,
        fs: &mut OpalFs<D>,
        fd: i32,
        offset: i32,
        whence: Whence,
    ) -> FsResult<i32> {
        let file = self.files.get_mut(&fd).ok_or(FsError::Invalid)?;

        let new_pos = match whence {
            Whence::Set => {
                if offset < 0 {
                    return Err(FsError::Invalid);
                }
                i64::from(offset)
            }
            Whence::Cur => (file.pos + i64::from(offset)).max(0),
            Whence::End => {
                let inode = file.inode;
                let size = fs.read_inode(inode)?.size_bytes;
                (i64::from(size) + i64::from(offset)).max(0)
            }
        };

        let file = self.files.get_mut(&fd).ok_or(FsError::Invalid)?;
        file.pos = new_pos;
        i32::try_from(new_pos).map_err(|_| FsError::Invalid)
    }

    /// Reads from the cursor position, advancing it. Returns 0 at end-of-file.
    pub fn read<D: DiskDevice>(
        &mut self,
        fs: &mut OpalFs<D>,
        fd: i32,
        buf: &mut [u8],
    ) -> FsResult<usize> {
        let file = *self.files.get(&fd).ok_or(FsError::Invalid)?;
        if !file.flags.readable() {
            return Err(FsError::Invalid);
        }

        let pos = u32::try_from(file.pos).map_err(|_| FsError::Invalid)?;
        let count = fs.read_at(file.inode, pos, buf)?;

        self.files.get_mut(&fd).ok_or(FsError::Invalid)?.pos += count as i64;
        Ok(count)
    }

    /// Writes at the cursor position (or at end-of-file under `O_APPEND`), advancing it.
    pub fn write<D: DiskDevice>(
        &mut self,
        fs: &mut OpalFs<D>,
        fd: i32,
        buf: &[u8],
    ) -> FsResult<usize> {
        let file = *self.files.get(&fd).ok_or(FsError::Invalid)?;
        if !file.flags.writable() {
            return Err(FsError::Invalid);
        }

        let pos = if file.flags.append() {
            i64::from(fs.read_inode(file.inode)?.size_bytes)
        } else {
            file.pos
        };
        let pos = u32::try_from(pos).map_err(|_| FsError::Invalid)?;

        let count = fs.write_at(file.inode, pos, buf)?;

        let file = self.files.get_mut(&fd).ok_or(FsError::Invalid)?;
        file.pos = i64::from(pos) + count as i64;
        Ok(count)
    }

    /// Number of descriptors currently open.
    pub fn open_count(&self) -> usize {
        self.files.len()
    }
}
