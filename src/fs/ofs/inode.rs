//! Inode records of the Opal filesystem.
//!
//! An inode is a packed 64-byte record: identity, type, sizes, modification timestamp, four
//! direct extents and the two (reserved) indirect block pointers. Inodes are packed 64 per
//! block in the inode table, and addressed by their id.

use crate::errors::FsError;
use crate::fs::ofs::extent::{bytes_to_blocks, bytes_to_sectors, Extent};
use crate::fs::ofs::BLOCK_SIZE;
use crate::time::DateTime;
use bytemuck::{Pod, Zeroable};

/// Identity of an inode. Ids 0 to 2 are permanently reserved.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeNumber(pub u32);

impl InodeNumber {
    /// Id 0 never names an inode; it doubles as the directory-entry tombstone marker.
    pub const INVALID: Self = Self(0);

    /// The root directory.
    pub const ROOT: Self = Self(1);

    /// Pseudo-inode reserving an id for the bootloader image.
    pub const BOOTLOADER: Self = Self(2);

    /// First id handed out to regular files and directories.
    pub const FIRST_UNRESERVED: Self = Self(3);

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

impl From<u32> for InodeNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// On-disk inode type tag.
///
/// Zero marks a free slot, so that a set inode-bitmap bit always corresponds to a non-zero
/// type and vice versa.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeType(u8);

impl InodeType {
    pub const FREE: Self = Self(0);
    pub const FILE: Self = Self(1);
    pub const DIR: Self = Self(2);
}

/// Packed on-disk date and time, stamped from the RTC.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct FsDateTime {
    pub second: u8,
    pub minute: u8,
    pub hour: u8,
    pub day: u8,
    pub month: u8,
    pub year: u16,

    padding: u8,
}

impl From<DateTime> for FsDateTime {
    fn from(value: DateTime) -> Self {
        Self {
            second: value.seconds,
            minute: value.minutes,
            hour: value.hours,
            day: value.day,
            month: value.month,
            year: value.year,
            padding: 0,
        }
    }
}

/// One 64-byte inode record.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct Inode {
    pub id: InodeNumber,
    pub itype: InodeType,
    pub size_bytes: u32,
    pub size_sectors: u32,
    pub last_modified: FsDateTime,

    /// Direct file extents, used in order. Unused slots are zeroed.
    pub extents: [Extent; 4],

    /// Disk block holding further extents. Reserved, always zero for now.
    pub single_indirect_block: u32,

    /// Disk block holding a block of indirect blocks. Reserved, always zero for now.
    pub double_indirect_block: u32,
    pub ref_count: u8,

    padding: [u8; 2],
}

impl Inode {
    pub fn new(id: InodeNumber, itype: InodeType, stamp: FsDateTime) -> Self {
        let mut inode = Inode::zeroed();
        inode.id = id;
        inode.itype = itype;
        inode.last_modified = stamp;
        inode.ref_count = 1;
        inode
    }

    pub fn is_dir(&self) -> bool {
        self.itype == InodeType::DIR
    }

    pub fn is_file(&self) -> bool {
        self.itype == InodeType::FILE
    }

    pub fn is_free(&self) -> bool {
        self.itype == InodeType::FREE
    }

    /// Total number of data blocks covered by the direct extents.
    pub fn covered_blocks(&self) -> u32 {
        self.extents.iter().map(|extent| extent.length_blocks).sum()
    }

    /// Whether any indirect pointer is in use.
    pub fn has_indirect(&self) -> bool {
        self.single_indirect_block != 0 || self.double_indirect_block != 0
    }

    /// Absolute disk block backing the `index`-th block of this inode's data.
    ///
    /// Returns `None` past the direct extents.
    pub fn block_at(&self, index: u32) -> Option<u32> {
        let mut remaining = index;
        for extent in &self.extents {
            if remaining < extent.length_blocks {
                return Some(extent.first_block + remaining);
            }
            remaining -= extent.length_blocks;
        }

        None
    }

    /// Appends one data block to the inode's coverage: extends the last extent when the block
    /// is adjacent to it, otherwise starts a new extent.
    ///
    /// # Errors
    ///
    /// Fails with [`FsError::NotImplemented`] when all four direct extents are in use, as that
    /// growth would spill into the indirect blocks.
    pub fn append_block(&mut self, block: u32) -> Result<(), FsError> {
        let mut last_used: Option<usize> = None;
        for (i, extent) in self.extents.iter().enumerate() {
            if !extent.is_empty() {
                last_used = Some(i);
            }
        }

        match last_used {
            Some(i) if self.extents[i].end_block() == block => {
                self.extents[i].length_blocks += 1;
                Ok(())
            }
            Some(i) if i + 1 < self.extents.len() => {
                self.extents[i + 1] = Extent::new(block, 1);
                Ok(())
            }
            Some(_) => Err(FsError::NotImplemented),
            None => {
                self.extents[0] = Extent::new(block, 1);
                Ok(())
            }
        }
    }

    /// Updates `size_bytes` (and the derived `size_sectors`) together.
    pub fn set_size(&mut self, size_bytes: u32) {
        self.size_bytes = size_bytes;
        self.size_sectors = bytes_to_sectors(size_bytes);
    }

    /// Number of data blocks the current size spans.
    pub fn size_blocks(&self) -> u32 {
        bytes_to_blocks(self.size_bytes)
    }

    /// Number of 64-byte directory entries the size accounts for. Only meaningful for
    /// directories.
    pub fn dir_entry_count(&self) -> u32 {
        self.size_bytes / crate::fs::ofs::DIR_ENTRY_SIZE as u32
    }

    /// Maximum number of bytes the direct extents can hold.
    pub fn capacity_bytes(&self) -> u32 {
        self.covered_blocks() * BLOCK_SIZE as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem;

    #[test]
    fn inode_is_one_packed_record() {
        assert_eq!(mem::size_of::<Inode>(), 64);
        assert_eq!(mem::size_of::<FsDateTime>(), 8);
        assert_eq!(mem::offset_of!(Inode, extents), 21);
        assert_eq!(mem::offset_of!(Inode, ref_count), 61);
    }

    #[test]
    fn block_mapping_walks_extents() {
        let mut inode = Inode::zeroed();
        inode.extents[0] = Extent::new(100, 2);
        inode.extents[1] = Extent::new(200, 1);

        assert_eq!(inode.block_at(0), Some(100));
        assert_eq!(inode.block_at(1), Some(101));
        assert_eq!(inode.block_at(2), Some(200));
        assert_eq!(inode.block_at(3), None);
        assert_eq!(inode.covered_blocks(), 3);
    }

    #[test]
    fn append_extends_adjacent_runs() {
        let mut inode = Inode::zeroed();

        inode.append_block(50).unwrap();
        inode.append_block(51).unwrap();
        assert_eq!(inode.extents[0], Extent::new(50, 2));

        // A hole starts a new extent.
        inode.append_block(60).unwrap();
        assert_eq!(inode.extents[1], Extent::new(60, 1));

        inode.append_block(70).unwrap();
        inode.append_block(80).unwrap();
        assert_eq!(inode.covered_blocks(), 5);

        // All four extents used, next discontiguous block needs the indirect path.
        assert_eq!(inode.append_block(90), Err(FsError::NotImplemented));

        // But extending the last run still works.
        inode.append_block(81).unwrap();
        assert_eq!(inode.extents[3], Extent::new(80, 2));
    }
}
