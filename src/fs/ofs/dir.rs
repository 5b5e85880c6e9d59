//! Directory entries of the Opal filesystem.
//!
//! A directory's data is a sequence of packed 64-byte entries spread across its extents. An
//! entry with id 0 is a tombstone: either never used, or left behind by a delete, and available
//! for reuse. The first two entries of every directory are `"."` and `".."`.

use crate::fs::ofs::inode::{FsDateTime, InodeNumber, InodeType};
use crate::fs::ofs::{DIR_ENTRY_SIZE, SECTORS_PER_BLOCK, SECTOR_SIZE};
use bytemuck::{Pod, Zeroable};

/// Bytes available for the NUL-terminated entry name.
pub const DIR_NAME_LEN: usize = 60;

/// One directory entry: inode id plus NUL-terminated name.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct DirEntry {
    pub id: InodeNumber,
    name: [u8; DIR_NAME_LEN],
}

impl DirEntry {
    pub fn new(id: InodeNumber, name: &str) -> Self {
        let mut entry = Self::zeroed();
        entry.id = id;
        entry.set_name(name);
        entry
    }

    /// An empty slot.
    pub fn tombstone() -> Self {
        Self::zeroed()
    }

    pub fn is_tombstone(&self) -> bool {
        self.id.as_u32() == InodeNumber::INVALID.as_u32()
    }

    /// The entry name, without the NUL padding.
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DIR_NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    /// Overwrites the name, truncating to the on-disk limit and keeping the terminator.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0u8; DIR_NAME_LEN];
        let len = name.len().min(DIR_NAME_LEN - 1);
        self.name[..len].copy_from_slice(&name.as_bytes()[..len]);
    }

    pub fn name_matches(&self, name: &str) -> bool {
        !self.is_tombstone() && self.name() == name
    }
}

/// Where a directory entry lives on disk: the absolute block and the slot inside it.
///
/// Carries enough to rewrite just the 512-byte sector that holds the entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DirEntryLocation {
    pub block: u32,
    pub slot: usize,
}

impl DirEntryLocation {
    /// LBA of the sector holding this entry.
    pub fn sector_lba(&self) -> u32 {
        self.block * SECTORS_PER_BLOCK + (self.slot * DIR_ENTRY_SIZE / SECTOR_SIZE) as u32
    }

    /// Byte offset of the entry inside that sector.
    pub fn offset_in_sector(&self) -> usize {
        (self.slot * DIR_ENTRY_SIZE) % SECTOR_SIZE
    }

    /// Byte offset of the entry inside its block.
    pub fn offset_in_block(&self) -> usize {
        self.slot * DIR_ENTRY_SIZE
    }
}

/// One row of a directory listing.
#[derive(Clone, Debug)]
pub struct DirListing {
    pub name: alloc::string::String,
    pub id: InodeNumber,
    pub size_bytes: u32,
    pub last_modified: FsDateTime,
    pub itype: InodeType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_is_one_packed_record() {
        assert_eq!(core::mem::size_of::<DirEntry>(), DIR_ENTRY_SIZE);
    }

    #[test]
    fn names_are_nul_terminated() {
        let mut entry = DirEntry::new(InodeNumber(7), "notes.txt");
        assert_eq!(entry.name(), "notes.txt");
        assert!(entry.name_matches("notes.txt"));
        assert!(!entry.name_matches("notes"));

        entry.set_name("x");
        assert_eq!(entry.name(), "x");

        // Longest representable name keeps its terminator.
        let long = "n".repeat(80);
        entry.set_name(&long);
        assert_eq!(entry.name().len(), DIR_NAME_LEN - 1);
    }

    #[test]
    fn location_sector_math() {
        // Slot 9 of block 20: second sector, second entry.
        let loc = DirEntryLocation { block: 20, slot: 9 };
        assert_eq!(loc.sector_lba(), 20 * 8 + 1);
        assert_eq!(loc.offset_in_sector(), 64);
        assert_eq!(loc.offset_in_block(), 9 * 64);
    }
}
