//! Superblock of the Opal filesystem.
//!
//! The superblock occupies the first sector of block 1 (right after the boot block) and fully
//! describes the volume geometry: where the two bitmaps live, where the inode table starts,
//! where the data area begins, and the running first-free-bit hints. Both the image builder and
//! the mount path go through this structure, so the two cannot disagree on layout.

use crate::fs::ofs::{BLOCK_SIZE, INODE_SIZE, SECTORS_PER_BLOCK, SECTOR_SIZE};
use bytemuck::{Pod, Zeroable};

/// LBA of the on-disk superblock (first sector of block 1).
pub const SUPERBLOCK_LBA: u32 = SECTORS_PER_BLOCK;

/// Direct extents in every inode.
pub const DIRECT_EXTENTS_PER_INODE: u8 = 4;

/// Volume header, packed to 64 bytes. All fields little-endian.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct Superblock {
    /// Total number of inode slots in the inode table.
    pub num_inodes: u32,
    pub first_inode_bitmap_block: u16,
    pub first_data_bitmap_block: u16,
    pub num_inode_bitmap_blocks: u16,
    pub num_data_bitmap_blocks: u16,
    pub first_inode_block: u32,
    pub first_data_block: u32,
    pub num_inode_blocks: u16,

    /// Number of blocks in the data area, which is also the number of valid data bitmap bits.
    pub num_data_blocks: u16,
    pub max_file_size_bytes: u32,
    pub block_size_bytes: u16,
    pub inode_size_bytes: u8,

    /// RAM address of the root inode cache; set at mount, meaningless on disk.
    pub root_inode_pointer: u32,
    pub inodes_per_block: u8,
    pub direct_extents_per_inode: u8,
    pub extents_per_indirect_block: u16,

    /// Smallest clear bit in the inode bitmap. A hint: always verify against the bitmap.
    pub first_free_inode_bit: u32,

    /// Smallest clear bit in the data bitmap. A hint: always verify against the bitmap.
    pub first_free_data_bit: u32,
    pub device_number: u16,
    pub first_unreserved_inode: u8,

    padding: [u8; 14],
}

impl Superblock {
    /// Sanity-checks the fields a mount relies on.
    pub fn is_valid(&self) -> bool {
        self.block_size_bytes == BLOCK_SIZE as u16
            && self.inode_size_bytes == INODE_SIZE as u8
            && self.inodes_per_block == (BLOCK_SIZE / INODE_SIZE) as u8
            && self.first_inode_bitmap_block >= 2
            && self.first_data_bitmap_block
                == self.first_inode_bitmap_block + self.num_inode_bitmap_blocks
            && self.first_inode_block
                == u32::from(self.first_data_bitmap_block + self.num_data_bitmap_blocks)
            && self.first_data_block == self.first_inode_block + u32::from(self.num_inode_blocks)
    }

    /// LBA of the sector holding the inode record `id`.
    ///
    /// Inodes are packed 8 per sector, 64 per block.
    pub fn inode_sector_lba(&self, id: u32) -> u32 {
        self.first_inode_block * SECTORS_PER_BLOCK + id / 8
    }

    /// Byte offset of the inode record `id` inside its sector.
    pub fn inode_offset_in_sector(id: u32) -> usize {
        (id as usize % 8) * INODE_SIZE
    }

    /// LBA of the inode bitmap sector holding `bit`.
    pub fn inode_bitmap_sector_lba(&self, bit: u32) -> u32 {
        u32::from(self.first_inode_bitmap_block) * SECTORS_PER_BLOCK
            + (bit / 8) / SECTOR_SIZE as u32
    }

    /// LBA of the data bitmap sector holding `bit`.
    pub fn data_bitmap_sector_lba(&self, bit: u32) -> u32 {
        u32::from(self.first_data_bitmap_block) * SECTORS_PER_BLOCK
            + (bit / 8) / SECTOR_SIZE as u32
    }

    /// Absolute disk block owning data-bitmap bit `bit`.
    pub fn data_block_for_bit(&self, bit: u32) -> u32 {
        self.first_data_block + bit
    }

    /// Data-bitmap bit owning the absolute disk block `block`.
    pub fn bit_for_data_block(&self, block: u32) -> u32 {
        block - self.first_data_block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem;

    #[test]
    fn superblock_is_one_packed_record() {
        assert_eq!(mem::size_of::<Superblock>(), 64);
        assert_eq!(mem::offset_of!(Superblock, first_inode_block), 12);
        assert_eq!(mem::offset_of!(Superblock, first_free_inode_bit), 39);
        assert_eq!(mem::offset_of!(Superblock, first_unreserved_inode), 49);
    }

    #[test]
    fn sector_math() {
        let mut sb = Superblock::zeroed();
        sb.first_inode_block = 4;
        sb.first_data_block = 5;
        sb.first_inode_bitmap_block = 2;
        sb.first_data_bitmap_block = 3;

        // Inode 11 lives in the second sector of the inode table, slot 3.
        assert_eq!(sb.inode_sector_lba(11), 4 * 8 + 1);
        assert_eq!(Superblock::inode_offset_in_sector(11), 3 * 64);

        // Bit 4096 sits in the second sector of its bitmap block.
        assert_eq!(sb.data_bitmap_sector_lba(4096), 3 * 8 + 1);
        assert_eq!(sb.data_block_for_bit(7), 12);
        assert_eq!(sb.bit_for_data_block(12), 7);
    }
}
