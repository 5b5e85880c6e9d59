//! The Opal filesystem.
//!
//! A block-addressed extent filesystem: boot block, superblock, inode bitmap, data bitmap,
//! inode table, data area, in that order on disk. Files and directories are 64-byte inodes
//! carrying up to four direct extents; directories store packed 64-byte `(id, name)` entries
//! in their data blocks.
//!
//! [`OpalFs`] owns the mounted device along with every piece of volume-wide state: the
//! superblock cache, the current-directory inode and the scratch sector/block buffers. The
//! kernel is single-threaded, so one value threads through every operation and no further
//! locking happens at this layer.
//!
//! Every mutation that spans more than one disk region writes in a fixed order: data blocks,
//! then bitmaps, then the inode table, then the superblock. An interruption mid-operation can
//! orphan data blocks but never produces a reference to unwritten data.

pub mod bitmap;
pub mod dir;
pub mod extent;
pub mod file;
pub mod inode;
pub mod mkfs;
pub mod path;
pub mod sb;

use crate::drivers::generics::dev_disk::DiskDevice;
use crate::errors::{FsError, MountError};
use crate::fs::ofs::bitmap::Bitmap;
use crate::fs::ofs::dir::{DirEntry, DirEntryLocation, DirListing};
use crate::fs::ofs::extent::{bytes_to_blocks, Extent};
use crate::fs::ofs::inode::{FsDateTime, Inode, InodeNumber, InodeType};
use crate::fs::ofs::sb::{Superblock, SUPERBLOCK_LBA};
use crate::fs::FsResult;
use crate::time;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use bytemuck::{bytes_of, from_bytes, Zeroable};

/// Disk allocation unit, in bytes. One block is eight sectors.
pub const BLOCK_SIZE: usize = 4096;

/// Disk transfer unit, in bytes.
pub const SECTOR_SIZE: usize = 512;

pub const SECTORS_PER_BLOCK: u32 = (BLOCK_SIZE / SECTOR_SIZE) as u32;

/// Bits per bitmap block.
pub const BITS_PER_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;

pub const INODE_SIZE: usize = 64;

pub const DIR_ENTRY_SIZE: usize = 64;

pub const DIR_ENTRIES_PER_BLOCK: u32 = (BLOCK_SIZE / DIR_ENTRY_SIZE) as u32;

/// The two on-disk allocation bitmaps.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BitmapRegion {
    Inode,
    Data,
}

/// A mounted Opal volume.
pub struct OpalFs<D: DiskDevice> {
    device: D,
    superblock: Superblock,

    /// Current working directory, re-read from the inode table after every mutation.
    cwd: Inode,

    tmp_sector: [u8; SECTOR_SIZE],
    tmp_block: [u8; BLOCK_SIZE],
}

impl<D: DiskDevice> OpalFs<D> {
    /// Mounts the volume on `device`: reads and validates the superblock, loads the root
    /// inode and installs it as the current working directory.
    ///
    /// # Errors
    ///
    /// [`MountError::BadSuperblock`] when the volume header does not describe an Opal
    /// filesystem this kernel can use.
    pub fn mount(device: D) -> Result<Self, MountError> {
        let mut fs = Self {
            device,
            superblock: Superblock::zeroed(),
            cwd: Inode::zeroed(),
            tmp_sector: [0; SECTOR_SIZE],
            tmp_block: [0; BLOCK_SIZE],
        };

        fs.load_sector(SUPERBLOCK_LBA).map_err(|_| MountError::IOError)?;
        let superblock: Superblock = *from_bytes(&fs.tmp_sector[..core::mem::size_of::<Superblock>()]);

        if !superblock.is_valid() {
            return Err(MountError::BadSuperblock);
        }
        fs.superblock = superblock;

        let root = fs
            .read_inode(InodeNumber::ROOT)
            .map_err(|_| MountError::IOError)?;
        if !root.is_dir() {
            return Err(MountError::BadSuperblock);
        }
        fs.cwd = root;
        fs.superblock.root_inode_pointer = core::ptr::addr_of!(fs.cwd) as u32;

        let num_inodes = fs.superblock.num_inodes;
        let num_data_blocks = fs.superblock.num_data_blocks;
        crate::info!(
            "ofs",
            "mounted volume: {num_inodes} inode slots, {num_data_blocks} data blocks"
        );

        Ok(fs)
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// The cached current-working-directory inode.
    pub fn cwd(&self) -> &Inode {
        &self.cwd
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    // ------------------------------------------------------------------
    // Raw sector / block access through the scratch buffers.
    // ------------------------------------------------------------------

    fn load_sector(&mut self, lba: u32) -> FsResult<()> {
        self.device
            .read(lba, 1, &mut self.tmp_sector)
            .map_err(FsError::from)
    }

    fn store_sector(&mut self, lba: u32) -> FsResult<()> {
        self.device
            .write(lba, 1, &self.tmp_sector)
            .map_err(FsError::from)
    }

    fn load_block(&mut self, block: u32) -> FsResult<()> {
        self.device
            .read(
                block * SECTORS_PER_BLOCK,
                SECTORS_PER_BLOCK as u16,
                &mut self.tmp_block,
            )
            .map_err(FsError::from)
    }

    fn store_block(&mut self, block: u32) -> FsResult<()> {
        self.device
            .write(
                block * SECTORS_PER_BLOCK,
                SECTORS_PER_BLOCK as u16,
                &self.tmp_block,
            )
            .map_err(FsError::from)
    }

    fn write_superblock(&mut self) -> FsResult<()> {
        self.tmp_sector.fill(0);
        self.tmp_sector[..core::mem::size_of::<Superblock>()]
            .copy_from_slice(bytes_of(&self.superblock));
        self.store_sector(SUPERBLOCK_LBA)
    }

    // ------------------------------------------------------------------
    // Inode table.
    // ------------------------------------------------------------------

    /// Reads the inode record `id` from the inode table.
    pub fn read_inode(&mut self, id: InodeNumber) -> FsResult<Inode> {
        let id = id.as_u32();
        if id == 0 || id >= self.superblock.num_inodes {
            return Err(FsError::Invalid);
        }

        let lba = self.superblock.inode_sector_lba(id);
        self.load_sector(lba)?;

        let offset = Superblock::inode_offset_in_sector(id);
        Ok(*from_bytes(&self.tmp_sector[offset..offset + INODE_SIZE]))
    }

    /// Writes `inode` back into its slot, touching only the containing sector.
    pub fn write_inode(&mut self, inode: &Inode) -> FsResult<()> {
        let id = inode.id.as_u32();
        if id == 0 || id >= self.superblock.num_inodes {
            return Err(FsError::Invalid);
        }

        let lba = self.superblock.inode_sector_lba(id);
        self.load_sector(lba)?;

        let offset = Superblock::inode_offset_in_sector(id);
        self.tmp_sector[offset..offset + INODE_SIZE].copy_from_slice(bytes_of(inode));
        self.store_sector(lba)
    }

    fn zero_inode(&mut self, id: u32) -> FsResult<()> {
        let lba = self.superblock.inode_sector_lba(id);
        self.load_sector(lba)?;

        let offset = Superblock::inode_offset_in_sector(id);
        self.tmp_sector[offset..offset + INODE_SIZE].fill(0);
        self.store_sector(lba)
    }

    fn refresh_cwd(&mut self) -> FsResult<()> {
        let id = self.cwd.id;
        self.cwd = self.read_inode(id)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bitmaps.
    // ------------------------------------------------------------------

    /// `(first block, block count, number of valid bits)` of a bitmap region.
    fn region_geometry(&self, region: BitmapRegion) -> (u32, u32, u32) {
        match region {
            BitmapRegion::Inode => (
                u32::from(self.superblock.first_inode_bitmap_block),
                u32::from(self.superblock.num_inode_bitmap_blocks),
                self.superblock.num_inodes,
            ),
            BitmapRegion::Data => (
                u32::from(self.superblock.first_data_bitmap_block),
                u32::from(self.superblock.num_data_bitmap_blocks),
                u32::from(self.superblock.num_data_blocks),
            ),
        }
    }

    fn test_bit(&mut self, region: BitmapRegion, bit: u32) -> FsResult<bool> {
        let (first_block, _, limit) = self.region_geometry(region);
        if bit >= limit {
            return Err(FsError::Invalid);
        }

        let lba = first_block * SECTORS_PER_BLOCK + (bit / 8) / SECTOR_SIZE as u32;
        self.load_sector(lba)?;

        let local = (bit % (SECTOR_SIZE as u32 * 8)) as usize;
        Ok(Bitmap::new(&mut self.tmp_sector).test(local))
    }

    /// Sets or clears a single bitmap bit on disk (read-modify-write of one sector).
    fn write_bit(&mut self, region: BitmapRegion, bit: u32, value: bool) -> FsResult<()> {
        let (first_block, _, limit) = self.region_geometry(region);
        if bit >= limit {
            return Err(FsError::Invalid);
        }

        let lba = first_block * SECTORS_PER_BLOCK + (bit / 8) / SECTOR_SIZE as u32;
        self.load_sector(lba)?;

        let local = (bit % (SECTOR_SIZE as u32 * 8)) as usize;
        let mut view = Bitmap::new(&mut self.tmp_sector);
        if value {
            view.set(local);
        } else {
            view.clear(local);
        }
        self.store_sector(lba)
    }

    /// Clears a run of data-bitmap bits, one sector at a time so that runs may straddle
    /// sector boundaries without corrupting the edge bytes.
    fn clear_data_run(&mut self, first_bit: u32, count: u32) -> FsResult<()> {
        let bits_per_sector = SECTOR_SIZE as u32 * 8;
        let (first_block, _, limit) = self.region_geometry(BitmapRegion::Data);
        if first_bit + count > limit {
            return Err(FsError::Invalid);
        }

        let mut bit = first_bit;
        let end = first_bit + count;
        while bit < end {
            let sector_base = bit - (bit % bits_per_sector);
            let run_end = end.min(sector_base + bits_per_sector);

            let lba = first_block * SECTORS_PER_BLOCK + sector_base / 8 / SECTOR_SIZE as u32;
            self.load_sector(lba)?;
            Bitmap::new(&mut self.tmp_sector)
                .clear_range((bit - sector_base) as usize, (run_end - bit) as usize);
            self.store_sector(lba)?;

            bit = run_end;
        }

        Ok(())
    }

    /// Word-granular scan for the first clear bit at or after `start`.
    fn next_free_bit_from(&mut self, region: BitmapRegion, start: u32) -> FsResult<Option<u32>> {
        let (first_block, num_blocks, limit) = self.region_geometry(region);

        let mut block_idx = start / BITS_PER_BLOCK;
        while block_idx < num_blocks {
            self.load_block(first_block + block_idx)?;

            let base = block_idx * BITS_PER_BLOCK;
            let from = start.saturating_sub(base) as usize;
            if let Some(bit) = Bitmap::new(&mut self.tmp_block).first_zero_from(from) {
                let absolute = base + bit as u32;
                if absolute >= limit {
                    return Ok(None);
                }
                return Ok(Some(absolute));
            }

            block_idx += 1;
        }

        Ok(None)
    }

    /// Returns the first-free hint for the region after verifying it against the bitmap,
    /// falling back to a full rescan when the hint is stale.
    fn peek_free_bit(&mut self, region: BitmapRegion) -> FsResult<u32> {
        let (_, _, limit) = self.region_geometry(region);
        let hint = match region {
            BitmapRegion::Inode => self.superblock.first_free_inode_bit,
            BitmapRegion::Data => self.superblock.first_free_data_bit,
        };

        if hint < limit && !self.test_bit(region, hint)? {
            return Ok(hint);
        }

        self.next_free_bit_from(region, 0)?.ok_or(FsError::NoSpace)
    }

    /// Marks `bit` allocated and recomputes the region's first-free hint.
    fn allocate_bit(&mut self, region: BitmapRegion, bit: u32) -> FsResult<()> {
        self.write_bit(region, bit, true)?;
        self.recompute_free_hint(region)
    }

    fn recompute_free_hint(&mut self, region: BitmapRegion) -> FsResult<()> {
        let (_, _, limit) = self.region_geometry(region);
        let next = self.next_free_bit_from(region, 0)?.unwrap_or(limit);
        match region {
            BitmapRegion::Inode => self.superblock.first_free_inode_bit = next,
            BitmapRegion::Data => self.superblock.first_free_data_bit = next,
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Directory plumbing.
    // ------------------------------------------------------------------

    /// Reads one 64-byte entry slot of a directory. `slot` indexes the directory's covered
    /// blocks in order.
    fn read_dir_slot(&mut self, dir: &Inode, slot: u32) -> FsResult<DirEntry> {
        let block = dir
            .block_at(slot / DIR_ENTRIES_PER_BLOCK)
            .ok_or(FsError::NotImplemented)?;
        let location = DirEntryLocation {
            block,
            slot: (slot % DIR_ENTRIES_PER_BLOCK) as usize,
        };

        self.load_sector(location.sector_lba())?;
        let offset = location.offset_in_sector();
        Ok(*from_bytes(&self.tmp_sector[offset..offset + DIR_ENTRY_SIZE]))
    }

    /// Persists one entry, rewriting only the 512-byte sector that holds it.
    fn write_dir_entry(&mut self, location: DirEntryLocation, entry: &DirEntry) -> FsResult<()> {
        self.load_sector(location.sector_lba())?;
        let offset = location.offset_in_sector();
        self.tmp_sector[offset..offset + DIR_ENTRY_SIZE].copy_from_slice(bytes_of(entry));
        self.store_sector(location.sector_lba())
    }

    /// Linear scan of a directory for a live entry with the given name.
    fn lookup_in_dir(&mut self, dir: &Inode, name: &str) -> FsResult<Option<DirEntry>> {
        let slots = dir.covered_blocks() * DIR_ENTRIES_PER_BLOCK;
        let live = dir.dir_entry_count();
        let mut seen = 0;

        for slot in 0..slots {
            if seen == live {
                break;
            }
            let entry = self.read_dir_slot(dir, slot)?;
            if entry.is_tombstone() {
                continue;
            }
            seen += 1;
            if entry.name_matches(name) {
                return Ok(Some(entry));
            }
        }

        Ok(None)
    }

    /// Linear scan of a directory for the entry referencing inode `id`.
    fn find_dir_entry(
        &mut self,
        dir: &Inode,
        id: u32,
    ) -> FsResult<Option<(DirEntryLocation, DirEntry)>> {
        let slots = dir.covered_blocks() * DIR_ENTRIES_PER_BLOCK;

        for slot in 0..slots {
            let entry = self.read_dir_slot(dir, slot)?;
            if entry.is_tombstone() {
                continue;
            }
            if entry.id.as_u32() == id {
                let block = dir
                    .block_at(slot / DIR_ENTRIES_PER_BLOCK)
                    .ok_or(FsError::NotImplemented)?;
                return Ok(Some((
                    DirEntryLocation {
                        block,
                        slot: (slot % DIR_ENTRIES_PER_BLOCK) as usize,
                    },
                    entry,
                )));
            }
        }

        Ok(None)
    }

    /// First reusable slot (tombstone or virgin) in the directory's covered blocks.
    fn find_free_slot(&mut self, dir: &Inode) -> FsResult<Option<DirEntryLocation>> {
        let slots = dir.covered_blocks() * DIR_ENTRIES_PER_BLOCK;

        for slot in 0..slots {
            let entry = self.read_dir_slot(dir, slot)?;
            if entry.is_tombstone() {
                let block = dir
                    .block_at(slot / DIR_ENTRIES_PER_BLOCK)
                    .ok_or(FsError::NotImplemented)?;
                return Ok(Some(DirEntryLocation {
                    block,
                    slot: (slot % DIR_ENTRIES_PER_BLOCK) as usize,
                }));
            }
        }

        Ok(None)
    }

    // ------------------------------------------------------------------
    // Operations.
    // ------------------------------------------------------------------

    /// Creates a file or directory at `path`.
    ///
    /// The new inode gets the next free id and one fresh data block; directories start out
    /// holding their `"."` and `".."` entries. The parent gains one directory entry, growing
    /// by one block when all its current slots are live.
    ///
    /// # Errors
    ///
    /// [`FsError::Exists`] when the name is already taken, [`FsError::NoSpace`] when either
    /// bitmap is exhausted.
    pub fn create(&mut self, fs_path: &str, itype: InodeType) -> FsResult<InodeNumber> {
        let name: String = path::validate_name(path::last_name(fs_path))?.to_string();

        match self.resolve(fs_path) {
            Ok(_) => return Err(FsError::Exists),
            Err(FsError::NotFound) => {}
            Err(other) => return Err(other),
        }

        let mut parent = self.resolve_parent(fs_path)?;
        if !parent.is_dir() {
            return Err(FsError::Invalid);
        }

        let inode_bit = self.peek_free_bit(BitmapRegion::Inode)?;

        // Entry placement: reuse the first free slot, or grow the parent by one block.
        let (slot_location, parent_growth_bit) = match self.find_free_slot(&parent)? {
            Some(location) => (location, None),
            None => {
                let bit = self.peek_free_bit(BitmapRegion::Data)?;
                let block = self.superblock.data_block_for_bit(bit);
                parent.append_block(block)?;
                (DirEntryLocation { block, slot: 0 }, Some(bit))
            }
        };

        // First data block of the new inode. When the parent just claimed the hint bit, scan
        // past it; nothing is marked on disk yet.
        let data_bit = match parent_growth_bit {
            Some(parent_bit) => self
                .next_free_bit_from(BitmapRegion::Data, parent_bit + 1)?
                .ok_or(FsError::NoSpace)?,
            None => self.peek_free_bit(BitmapRegion::Data)?,
        };
        let first_block = self.superblock.data_block_for_bit(data_bit);

        let stamp = FsDateTime::from(time::current_datetime());
        let mut new_inode = Inode::new(InodeNumber(inode_bit), itype, stamp);
        new_inode.extents[0] = Extent::new(first_block, 1);
        if itype == InodeType::DIR {
            new_inode.set_size(2 * DIR_ENTRY_SIZE as u32);
        }

        // Data blocks first.
        let entry = DirEntry::new(InodeNumber(inode_bit), &name);
        if parent_growth_bit.is_some() {
            self.tmp_block.fill(0);
            self.tmp_block[..DIR_ENTRY_SIZE].copy_from_slice(bytes_of(&entry));
            self.store_block(slot_location.block)?;
        } else {
            self.write_dir_entry(slot_location, &entry)?;
        }

        if itype == InodeType::DIR {
            self.tmp_block.fill(0);
            let dot = DirEntry::new(InodeNumber(inode_bit), ".");
            let dotdot = DirEntry::new(parent.id, "..");
            self.tmp_block[..DIR_ENTRY_SIZE].copy_from_slice(bytes_of(&dot));
            self.tmp_block[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE].copy_from_slice(bytes_of(&dotdot));
            self.store_block(first_block)?;
        }

        // Then the bitmaps.
        self.allocate_bit(BitmapRegion::Inode, inode_bit)?;
        if let Some(parent_bit) = parent_growth_bit {
            self.allocate_bit(BitmapRegion::Data, parent_bit)?;
        }
        self.allocate_bit(BitmapRegion::Data, data_bit)?;

        // Then the inode table.
        parent.set_size(parent.size_bytes + DIR_ENTRY_SIZE as u32);
        parent.last_modified = stamp;
        self.write_inode(&parent)?;
        self.write_inode(&new_inode)?;

        // The superblock last.
        self.write_superblock()?;
        self.refresh_cwd()?;

        Ok(InodeNumber(inode_bit))
    }

    /// Deletes the file or empty directory at `path`.
    ///
    /// The directory entry becomes a tombstone, the inode's extents are released in the data
    /// bitmap, the inode bit is cleared and the record zeroed. A directory shrink never
    /// releases the parent's tail block.
    pub fn delete(&mut self, fs_path: &str) -> FsResult<()> {
        let target = self.resolve(fs_path)?;
        let target_id = target.id.as_u32();

        if target_id <= InodeNumber::BOOTLOADER.as_u32() {
            return Err(FsError::Invalid);
        }
        if target.has_indirect() {
            return Err(FsError::NotImplemented);
        }
        if target.is_dir() && target.dir_entry_count() > 2 {
            return Err(FsError::Invalid);
        }

        let mut parent = self.resolve_parent(fs_path)?;
        let (location, _) = self
            .find_dir_entry(&parent, target_id)?
            .ok_or(FsError::NotFound)?;

        // Data blocks first: tombstone the entry.
        self.write_dir_entry(location, &DirEntry::tombstone())?;

        // Then the bitmaps.
        for extent in target.extents {
            if extent.is_empty() {
                continue;
            }
            let first_bit = self.superblock.bit_for_data_block(extent.first_block);
            self.clear_data_run(first_bit, extent.length_blocks)?;
        }
        self.recompute_free_hint(BitmapRegion::Data)?;
        self.write_bit(BitmapRegion::Inode, target_id, false)?;
        self.recompute_free_hint(BitmapRegion::Inode)?;

        // Then the inode table.
        parent.set_size(parent.size_bytes - DIR_ENTRY_SIZE as u32);
        parent.last_modified = FsDateTime::from(time::current_datetime());
        self.write_inode(&parent)?;
        self.zero_inode(target_id)?;

        // The superblock last.
        self.write_superblock()?;
        self.refresh_cwd()?;

        Ok(())
    }

    /// Recursively deletes a directory tree (or a single file).
    ///
    /// `"."` and `".."` entries are skipped, children are removed depth-first, and the now
    /// empty directory goes last.
    pub fn delete_tree(&mut self, fs_path: &str) -> FsResult<()> {
        let target = self.resolve(fs_path)?;
        if !target.is_dir() {
            return self.delete(fs_path);
        }
        if target.id.as_u32() == InodeNumber::ROOT.as_u32() {
            return Err(FsError::Invalid);
        }

        let children = self.list_dir(fs_path)?;
        for child in children {
            if child.name == "." || child.name == ".." {
                continue;
            }
            let child_path = format!("{}/{}", fs_path.trim_end_matches('/'), child.name);
            if child.itype == InodeType::DIR {
                self.delete_tree(&child_path)?;
            } else {
                self.delete(&child_path)?;
            }
        }

        self.delete(fs_path)
    }

    /// Renames the file or directory at `path` to `new_name`, in place.
    ///
    /// Only the directory entry changes; the inode (and its id) is untouched.
    pub fn rename(&mut self, fs_path: &str, new_name: &str) -> FsResult<()> {
        let name = path::validate_name(new_name)?;

        let target = self.resolve(fs_path)?;
        let target_id = target.id.as_u32();
        if target_id <= InodeNumber::BOOTLOADER.as_u32() {
            return Err(FsError::Invalid);
        }

        let parent = self.resolve_parent(fs_path)?;
        if self.lookup_in_dir(&parent, name)?.is_some() {
            return Err(FsError::Exists);
        }

        let (location, mut entry) = self
            .find_dir_entry(&parent, target_id)?
            .ok_or(FsError::NotFound)?;
        entry.set_name(name);
        self.write_dir_entry(location, &entry)?;

        self.refresh_cwd()?;
        Ok(())
    }

    /// Lists a directory: one row per live entry, in slot order.
    pub fn list_dir(&mut self, fs_path: &str) -> FsResult<Vec<DirListing>> {
        let dir = self.resolve(fs_path)?;
        if !dir.is_dir() {
            return Err(FsError::Invalid);
        }

        let slots = dir.covered_blocks() * DIR_ENTRIES_PER_BLOCK;
        let live = dir.dir_entry_count();
        let mut rows = Vec::new();
        let mut seen = 0;

        for slot in 0..slots {
            if seen == live {
                break;
            }
            let entry = self.read_dir_slot(&dir, slot)?;
            if entry.is_tombstone() {
                continue;
            }
            seen += 1;

            let inode = self.read_inode(entry.id)?;
            rows.push(DirListing {
                name: entry.name().to_string(),
                id: entry.id,
                size_bytes: inode.size_bytes,
                last_modified: inode.last_modified,
                itype: inode.itype,
            });
        }

        Ok(rows)
    }

    /// Changes the current working directory.
    pub fn change_dir(&mut self, fs_path: &str) -> FsResult<()> {
        let dir = self.resolve(fs_path)?;
        if !dir.is_dir() {
            return Err(FsError::Invalid);
        }
        self.cwd = dir;
        Ok(())
    }

    // ------------------------------------------------------------------
    // File contents.
    // ------------------------------------------------------------------

    /// Loads a whole file into `buf`, extent by extent.
    ///
    /// `buf` must cover all blocks the file size spans.
    pub fn load(&mut self, inode: &Inode, buf: &mut [u8]) -> FsResult<()> {
        let total_blocks = inode.size_blocks();
        if buf.len() < total_blocks as usize * BLOCK_SIZE {
            return Err(FsError::Invalid);
        }

        let mut remaining = total_blocks;
        let mut offset = 0usize;
        for extent in inode.extents {
            if remaining == 0 {
                break;
            }
            if extent.is_empty() {
                continue;
            }

            let run = extent.length_blocks.min(remaining);
            let sectors = u16::try_from(run * SECTORS_PER_BLOCK).map_err(|_| FsError::Invalid)?;
            let bytes = run as usize * BLOCK_SIZE;
            self.device
                .read(
                    extent.first_block * SECTORS_PER_BLOCK,
                    sectors,
                    &mut buf[offset..offset + bytes],
                )
                .map_err(FsError::from)?;

            offset += bytes;
            remaining -= run;
        }

        if remaining > 0 {
            return Err(FsError::NotImplemented);
        }
        Ok(())
    }

    /// Writes a whole file image from `buf`, extent by extent; the symmetric counterpart of
    /// [`OpalFs::load`]. Size adjustments are the caller's responsibility: `save` alone never
    /// grows extents.
    pub fn save(&mut self, inode: &Inode, buf: &[u8]) -> FsResult<()> {
        let total_blocks = inode.size_blocks();
        if buf.len() < total_blocks as usize * BLOCK_SIZE {
            return Err(FsError::Invalid);
        }

        let mut remaining = total_blocks;
        let mut offset = 0usize;
        for extent in inode.extents {
            if remaining == 0 {
                break;
            }
            if extent.is_empty() {
                continue;
            }

            let run = extent.length_blocks.min(remaining);
            let sectors = u16::try_from(run * SECTORS_PER_BLOCK).map_err(|_| FsError::Invalid)?;
            let bytes = run as usize * BLOCK_SIZE;
            self.device
                .write(
                    extent.first_block * SECTORS_PER_BLOCK,
                    sectors,
                    &buf[offset..offset + bytes],
                )
                .map_err(FsError::from)?;

            offset += bytes;
            remaining -= run;
        }

        if remaining > 0 {
            return Err(FsError::NotImplemented);
        }
        Ok(())
    }

    /// Reads up to `buf.len()` bytes of the file at byte offset `pos`.
    ///
    /// Returns 0 at or past end-of-file.
    pub fn read_at(&mut self, id: InodeNumber, pos: u32, buf: &mut [u8]) -> FsResult<usize> {
        let inode = self.read_inode(id)?;
        let size = inode.size_bytes;
        if pos >= size || buf.is_empty() {
            return Ok(0);
        }

        let count = buf.len().min((size - pos) as usize);
        let mut copied = 0;
        while copied < count {
            let byte_pos = pos as usize + copied;
            let block_index = (byte_pos / BLOCK_SIZE) as u32;
            let within = byte_pos % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - within).min(count - copied);

            let block = inode.block_at(block_index).ok_or(FsError::NotImplemented)?;
            self.load_block(block)?;
            buf[copied..copied + chunk].copy_from_slice(&self.tmp_block[within..within + chunk]);

            copied += chunk;
        }

        Ok(count)
    }

    /// Writes `buf` at byte offset `pos`, growing the file's extents as needed and updating
    /// its size and timestamp.
    pub fn write_at(&mut self, id: InodeNumber, pos: u32, buf: &[u8]) -> FsResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut inode = self.read_inode(id)?;
        let end = u64::from(pos) + buf.len() as u64;
        if end > u64::from(self.superblock.max_file_size_bytes) {
            return Err(FsError::NoSpace);
        }
        let end = end as u32;

        // Reserve any additional blocks first; they are marked in the bitmap only after the
        // data lands.
        let old_covered = inode.covered_blocks();
        let needed = bytes_to_blocks(end.max(inode.size_bytes));
        let mut new_bits: Vec<u32> = Vec::new();
        let mut scan_from = 0;
        while inode.covered_blocks() < needed {
            let bit = self
                .next_free_bit_from(BitmapRegion::Data, scan_from)?
                .ok_or(FsError::NoSpace)?;
            inode.append_block(self.superblock.data_block_for_bit(bit))?;
            new_bits.push(bit);
            scan_from = bit + 1;
        }

        // Data blocks first.
        let mut written = 0usize;
        while written < buf.len() {
            let byte_pos = pos as usize + written;
            let block_index = (byte_pos / BLOCK_SIZE) as u32;
            let within = byte_pos % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - within).min(buf.len() - written);

            let block = inode.block_at(block_index).ok_or(FsError::NotImplemented)?;
            if chunk == BLOCK_SIZE {
                self.tmp_block.copy_from_slice(&buf[written..written + chunk]);
            } else if block_index < old_covered {
                self.load_block(block)?;
                self.tmp_block[within..within + chunk]
                    .copy_from_slice(&buf[written..written + chunk]);
            } else {
                self.tmp_block.fill(0);
                self.tmp_block[within..within + chunk]
                    .copy_from_slice(&buf[written..written + chunk]);
            }
            self.store_block(block)?;

            written += chunk;
        }

        // Then the bitmaps.
        for &bit in &new_bits {
            self.write_bit(BitmapRegion::Data, bit, true)?;
        }
        if !new_bits.is_empty() {
            self.recompute_free_hint(BitmapRegion::Data)?;
        }

        // Then the inode table.
        if end > inode.size_bytes {
            inode.set_size(end);
        }
        inode.last_modified = FsDateTime::from(time::current_datetime());
        self.write_inode(&inode)?;

        // The superblock last, only when the allocation state changed.
        if !new_bits.is_empty() {
            self.write_superblock()?;
        }

        Ok(buf.len())
    }
}
