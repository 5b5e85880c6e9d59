//! Offline image builder.
//!
//! Produces a complete Opal volume as a byte vector: boot block, superblock, bitmaps, inode
//! table, the preseeded root directory and the supplied files, padded with zeroes to the
//! requested size. The builder shares every on-disk structure with the mount path, so the
//! producer and the consumer cannot drift apart.
//!
//! Inodes 0 (invalid), 1 (root directory) and 2 (bootloader) are reserved; supplied files get
//! sequential ids from 3 and a single contiguous extent each.

use bytemuck::Zeroable;

use crate::errors::FsError;
use crate::fs::ofs::dir::DirEntry;
use crate::fs::ofs::extent::{bytes_to_blocks, bytes_to_sectors, Extent};
use crate::fs::ofs::inode::{FsDateTime, Inode, InodeNumber, InodeType};
use crate::fs::ofs::sb::{Superblock, DIRECT_EXTENTS_PER_INODE, SUPERBLOCK_LBA};
use crate::fs::ofs::{
    bitmap::Bitmap, path, BITS_PER_BLOCK, BLOCK_SIZE, DIR_ENTRY_SIZE, INODE_SIZE, SECTOR_SIZE,
};
use crate::fs::FsResult;
use crate::time::DateTime;
use alloc::vec;
use alloc::vec::Vec;
use bytemuck::bytes_of;

/// Size of the boot area: 8 raw sectors ahead of the superblock.
pub const BOOT_BLOCK_BYTES: usize = 8 * SECTOR_SIZE;

/// Default image size, a 1.44MB floppy.
pub const DEFAULT_DISK_SIZE: usize = 512 * 2880;

/// One file to pack into the image. The stored name is the basename of `name`.
#[derive(Clone, Copy, Debug)]
pub struct InputFile<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
}

/// Builds a volume image of exactly `disk_size` bytes.
///
/// `boot_block` (at most [`BOOT_BLOCK_BYTES`]) lands in block 0 verbatim; `files` become root
/// directory entries with ids from 3, packed back to back with per-file padding to the next
/// block boundary.
///
/// # Errors
///
/// [`FsError::Invalid`] for a boot image or disk size that does not fit the layout,
/// [`FsError::NoSpace`] when the files outgrow the data area.
pub fn build_image(
    disk_size: usize,
    boot_block: &[u8],
    files: &[InputFile],
    stamp: DateTime,
) -> FsResult<Vec<u8>> {
    if boot_block.len() > BOOT_BLOCK_BYTES || disk_size % BLOCK_SIZE != 0 {
        return Err(FsError::Invalid);
    }

    let disk_blocks = disk_size / BLOCK_SIZE;

    // Geometry, front to back.
    let inode_slots = files.len() as u32 + 3;
    let inode_table_blocks = bytes_to_blocks(inode_slots * INODE_SIZE as u32).max(1);
    let num_inodes = inode_table_blocks * (BLOCK_SIZE / INODE_SIZE) as u32;
    let inode_bitmap_blocks = num_inodes.div_ceil(BITS_PER_BLOCK);

    let first_inode_bitmap_block = 2u32;
    let first_data_bitmap_block = first_inode_bitmap_block + inode_bitmap_blocks;
    let data_bits_estimate = disk_blocks as u32 - first_data_bitmap_block;
    let data_bitmap_blocks = data_bits_estimate.div_ceil(BITS_PER_BLOCK);

    let first_inode_block = first_data_bitmap_block + data_bitmap_blocks;
    let first_data_block = first_inode_block + inode_table_blocks;

    if first_data_block as usize >= disk_blocks {
        return Err(FsError::Invalid);
    }
    let num_data_blocks = disk_blocks as u32 - first_data_block;
    if num_data_blocks > u32::from(u16::MAX) {
        return Err(FsError::Invalid);
    }

    // Data layout: the root directory's entries first, then each file rounded up to blocks.
    let root_size = (2 + files.len() as u32) * DIR_ENTRY_SIZE as u32;
    let root_blocks = bytes_to_blocks(root_size);
    let file_blocks: u32 = files
        .iter()
        .map(|file| bytes_to_blocks(file.data.len() as u32))
        .sum();

    if root_blocks + file_blocks > num_data_blocks {
        return Err(FsError::NoSpace);
    }

    let mut superblock = Superblock::zeroed();
    superblock.num_inodes = num_inodes;
    superblock.first_inode_bitmap_block = first_inode_bitmap_block as u16;
    superblock.first_data_bitmap_block = first_data_bitmap_block as u16;
    superblock.num_inode_bitmap_blocks = inode_bitmap_blocks as u16;
    superblock.num_data_bitmap_blocks = data_bitmap_blocks as u16;
    superblock.first_inode_block = first_inode_block;
    superblock.first_data_block = first_data_block;
    superblock.num_inode_blocks = inode_table_blocks as u16;
    superblock.num_data_blocks = num_data_blocks as u16;
    superblock.max_file_size_bytes = u32::MAX;
    superblock.block_size_bytes = BLOCK_SIZE as u16;
    superblock.inode_size_bytes = INODE_SIZE as u8;
    superblock.inodes_per_block = (BLOCK_SIZE / INODE_SIZE) as u8;
    superblock.direct_extents_per_inode = DIRECT_EXTENTS_PER_INODE;
    superblock.extents_per_indirect_block = (BLOCK_SIZE / core::mem::size_of::<Extent>()) as u16;
    superblock.first_free_inode_bit = inode_slots;
    superblock.first_free_data_bit = root_blocks + file_blocks;
    superblock.device_number = 0x01;
    superblock.first_unreserved_inode = InodeNumber::FIRST_UNRESERVED.as_u32() as u8;

    let mut image = vec![0u8; disk_size];

    // Boot block.
    image[..boot_block.len()].copy_from_slice(boot_block);

    // Superblock, first sector of block 1.
    let sb_offset = SUPERBLOCK_LBA as usize * SECTOR_SIZE;
    image[sb_offset..sb_offset + core::mem::size_of::<Superblock>()]
        .copy_from_slice(bytes_of(&superblock));

    // Inode bitmap: the reserved ids plus one bit per file.
    {
        let offset = first_inode_bitmap_block as usize * BLOCK_SIZE;
        let len = inode_bitmap_blocks as usize * BLOCK_SIZE;
        Bitmap::new(&mut image[offset..offset + len]).set_range(0, inode_slots as usize);
    }

    // Data bitmap: root directory blocks, then every file block.
    {
        let offset = first_data_bitmap_block as usize * BLOCK_SIZE;
        let len = data_bitmap_blocks as usize * BLOCK_SIZE;
        Bitmap::new(&mut image[offset..offset + len])
            .set_range(0, (root_blocks + file_blocks) as usize);
    }

    // Inode table. Slot 0 stays zeroed.
    let stamp = FsDateTime::from(stamp);
    let table_offset = first_inode_block as usize * BLOCK_SIZE;

    let mut root = Inode::new(InodeNumber::ROOT, InodeType::DIR, stamp);
    root.set_size(root_size);
    root.extents[0] = Extent::new(first_data_block, root_blocks);
    write_inode(&mut image, table_offset, &root);

    // The bootloader pseudo-inode reserves id 2; the boot block itself lives outside the
    // data area, so the record carries no extents.
    let bootloader = Inode::new(InodeNumber::BOOTLOADER, InodeType::FILE, stamp);
    write_inode(&mut image, table_offset, &bootloader);

    let mut next_block = first_data_block + root_blocks;
    for (index, file) in files.iter().enumerate() {
        let blocks = bytes_to_blocks(file.data.len() as u32);
        let mut inode = Inode::new(
            InodeNumber(InodeNumber::FIRST_UNRESERVED.as_u32() + index as u32),
            InodeType::FILE,
            stamp,
        );
        inode.size_bytes = file.data.len() as u32;
        inode.size_sectors = bytes_to_sectors(file.data.len() as u32);
        inode.extents[0] = Extent::new(next_block, blocks);
        write_inode(&mut image, table_offset, &inode);

        next_block += blocks;
    }

    // Root directory data: ".", "..", then one entry per file.
    let root_data_offset = first_data_block as usize * BLOCK_SIZE;
    write_dir_entry(&mut image, root_data_offset, 0, &DirEntry::new(InodeNumber::ROOT, "."));
    write_dir_entry(&mut image, root_data_offset, 1, &DirEntry::new(InodeNumber::ROOT, ".."));
    for (index, file) in files.iter().enumerate() {
        let entry = DirEntry::new(
            InodeNumber(InodeNumber::FIRST_UNRESERVED.as_u32() + index as u32),
            path::last_name(file.name),
        );
        write_dir_entry(&mut image, root_data_offset, 2 + index, &entry);
    }

    // File data, each padded out to its block boundary.
    let mut data_offset = (first_data_block + root_blocks) as usize * BLOCK_SIZE;
    for file in files {
        image[data_offset..data_offset + file.data.len()].copy_from_slice(file.data);
        data_offset += bytes_to_blocks(file.data.len() as u32) as usize * BLOCK_SIZE;
    }

    Ok(image)
}

fn write_inode(image: &mut [u8], table_offset: usize, inode: &Inode) {
    let offset = table_offset + inode.id.as_u32() as usize * INODE_SIZE;
    image[offset..offset + INODE_SIZE].copy_from_slice(bytes_of(inode));
}

fn write_dir_entry(image: &mut [u8], dir_offset: usize, slot: usize, entry: &DirEntry) {
    let offset = dir_offset + slot * DIR_ENTRY_SIZE;
    image[offset..offset + DIR_ENTRY_SIZE].copy_from_slice(bytes_of(entry));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_of_a_floppy_image() {
        let image = build_image(DEFAULT_DISK_SIZE, &[0xEB; 512], &[], DateTime::default()).unwrap();
        assert_eq!(image.len(), DEFAULT_DISK_SIZE);

        let sb_offset = SUPERBLOCK_LBA as usize * SECTOR_SIZE;
        let superblock: Superblock =
            *bytemuck::from_bytes(&image[sb_offset..sb_offset + core::mem::size_of::<Superblock>()]);

        assert!(superblock.is_valid());
        // 2 metadata blocks ahead, one bitmap block each, one inode table block.
        assert_eq!({ superblock.first_inode_bitmap_block }, 2);
        assert_eq!({ superblock.first_data_bitmap_block }, 3);
        assert_eq!({ superblock.first_inode_block }, 4);
        assert_eq!({ superblock.first_data_block }, 5);
        assert_eq!({ superblock.num_inodes }, 64);
        assert_eq!({ superblock.first_free_inode_bit }, 3);
        // Root directory data occupies bit 0.
        assert_eq!({ superblock.first_free_data_bit }, 1);

        // Boot sector survives verbatim.
        assert_eq!(image[0], 0xEB);
        assert_eq!(image[511], 0xEB);
    }

    #[test]
    fn files_get_sequential_ids_and_contiguous_extents() {
        let a = [0x11u8; 100];
        let b = [0x22u8; 9000];
        let image = build_image(
            DEFAULT_DISK_SIZE,
            &[],
            &[
                InputFile { name: "bin/a.bin", data: &a },
                InputFile { name: "bin/b.bin", data: &b },
            ],
            DateTime::default(),
        )
        .unwrap();

        let sb_offset = SUPERBLOCK_LBA as usize * SECTOR_SIZE;
        let superblock: Superblock =
            *bytemuck::from_bytes(&image[sb_offset..sb_offset + core::mem::size_of::<Superblock>()]);

        // Root + a.bin (1 block) + b.bin (3 blocks).
        assert_eq!({ superblock.first_free_data_bit }, 4);
        assert_eq!({ superblock.first_free_inode_bit }, 5);

        let first_data_block = { superblock.first_data_block };
        let table = { superblock.first_inode_block } as usize * BLOCK_SIZE;
        let inode_a: Inode = *bytemuck::from_bytes(&image[table + 3 * 64..table + 4 * 64]);
        let inode_b: Inode = *bytemuck::from_bytes(&image[table + 4 * 64..table + 5 * 64]);

        assert_eq!({ inode_a.size_bytes }, 100);
        assert_eq!(inode_a.extents[0], Extent::new(first_data_block + 1, 1));
        assert_eq!({ inode_b.size_bytes }, 9000);
        assert_eq!(inode_b.extents[0], Extent::new(first_data_block + 2, 3));

        // a.bin's bytes land right after the root directory block.
        let a_offset = (first_data_block + 1) as usize * BLOCK_SIZE;
        assert_eq!(&image[a_offset..a_offset + 100], &a);

        // Directory entries carry basenames.
        let root_data = first_data_block as usize * BLOCK_SIZE;
        let entry_a: DirEntry =
            *bytemuck::from_bytes(&image[root_data + 2 * 64..root_data + 3 * 64]);
        assert_eq!(entry_a.name(), "a.bin");
        assert_eq!(entry_a.id.as_u32(), 3);
    }
}
