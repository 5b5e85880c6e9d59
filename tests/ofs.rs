//! End-to-end tests of the Opal filesystem over a RAM-backed block device: image building,
//! mounting, the directory operations, and the file descriptor layer.

use opal::drivers::generics::dev_disk::{DiskDevice, SECTOR_SIZE};
use opal::errors::{CanFail, FsError, IOError};
use opal::fs::ofs::file::OpenFileTable;
use opal::fs::ofs::inode::{InodeNumber, InodeType};
use opal::fs::ofs::mkfs::{build_image, InputFile, DEFAULT_DISK_SIZE};
use opal::fs::ofs::{OpalFs, BLOCK_SIZE};
use opal::fs::{OpenFlags, Whence};
use opal::time::DateTime;

/// An in-memory disk image implementing the block device contract.
struct RamDisk {
    data: Vec<u8>,
}

impl RamDisk {
    fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl DiskDevice for RamDisk {
    fn read(&mut self, start_lba: u32, sectors_count: u16, buffer: &mut [u8]) -> CanFail<IOError> {
        let offset = start_lba as usize * SECTOR_SIZE;
        let len = sectors_count as usize * SECTOR_SIZE;
        if offset + len > self.data.len() || buffer.len() < len {
            return Err(IOError::InvalidCommand);
        }
        buffer[..len].copy_from_slice(&self.data[offset..offset + len]);
        Ok(())
    }

    fn write(&mut self, start_lba: u32, sectors_count: u16, buffer: &[u8]) -> CanFail<IOError> {
        let offset = start_lba as usize * SECTOR_SIZE;
        let len = sectors_count as usize * SECTOR_SIZE;
        if offset + len > self.data.len() || buffer.len() < len {
            return Err(IOError::InvalidCommand);
        }
        self.data[offset..offset + len].copy_from_slice(&buffer[..len]);
        Ok(())
    }

    fn max_sector(&self) -> u32 {
        (self.data.len() / SECTOR_SIZE) as u32
    }
}

fn mount_with_files(files: &[InputFile]) -> OpalFs<RamDisk> {
    let image = build_image(DEFAULT_DISK_SIZE, &[], files, DateTime::default()).unwrap();
    OpalFs::mount(RamDisk::new(image)).unwrap()
}

fn mount_empty() -> OpalFs<RamDisk> {
    mount_with_files(&[])
}

/// Reads one bitmap bit straight out of the raw image.
fn raw_bit(fs: &OpalFs<RamDisk>, bitmap_block: u32, bit: u32) -> bool {
    let base = bitmap_block as usize * BLOCK_SIZE;
    let byte = fs.device().bytes()[base + bit as usize / 8];
    byte & (1 << (bit % 8)) != 0
}

#[test]
fn fresh_mount_lists_the_seeded_root() {
    let a = vec![0x41u8; 100];
    let b = vec![0x42u8; 3 * BLOCK_SIZE - 17];
    let mut fs = mount_with_files(&[
        InputFile { name: "bin/a.bin", data: &a },
        InputFile { name: "bin/b.bin", data: &b },
    ]);

    let rows = fs.list_dir("/").unwrap();
    let summary: Vec<(String, u32)> = rows
        .iter()
        .map(|row| (row.name.clone(), row.id.as_u32()))
        .collect();

    assert_eq!(
        summary,
        vec![
            (".".to_string(), 1),
            ("..".to_string(), 1),
            ("a.bin".to_string(), 3),
            ("b.bin".to_string(), 4),
        ]
    );

    let inode = fs.resolve("/a.bin").unwrap();
    assert_eq!({ inode.size_bytes }, 100);

    let inode = fs.resolve("/b.bin").unwrap();
    assert_eq!({ inode.size_bytes }, (3 * BLOCK_SIZE - 17) as u32);
}

#[test]
fn loaded_file_contents_round_trip_through_mkfs() {
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let mut fs = mount_with_files(&[InputFile { name: "data.bin", data: &payload }]);

    let inode = fs.resolve("/data.bin").unwrap();
    let mut buf = vec![0u8; inode.size_blocks() as usize * BLOCK_SIZE];
    fs.load(&inode, &mut buf).unwrap();

    assert_eq!(&buf[..payload.len()], &payload[..]);
}

#[test]
fn create_nested_dir_and_file() {
    let mut fs = mount_empty();

    let sub = fs.create("/sub", InodeType::DIR).unwrap();
    assert_eq!(sub.as_u32(), 3);

    let file = fs.create("/sub/x.txt", InodeType::FILE).unwrap();
    assert_eq!(file.as_u32(), 4);

    let resolved = fs.resolve("/sub/x.txt").unwrap();
    assert_eq!(resolved.id.as_u32(), 4);
    assert!(resolved.is_file());

    // Directory symmetry: "." points at the directory, ".." at its parent, and the parent
    // holds exactly one entry for it.
    let rows = fs.list_dir("/sub").unwrap();
    assert_eq!(rows[0].name, ".");
    assert_eq!(rows[0].id.as_u32(), 3);
    assert_eq!(rows[1].name, "..");
    assert_eq!(rows[1].id.as_u32(), 1);

    let root_refs = fs
        .list_dir("/")
        .unwrap()
        .into_iter()
        .filter(|row| row.id.as_u32() == 3 && row.name != "." && row.name != "..")
        .count();
    assert_eq!(root_refs, 1);

    // Dotted path segments resolve through the stored entries.
    let via_dots = fs.resolve("/sub/./../sub/x.txt").unwrap();
    assert_eq!(via_dots.id.as_u32(), 4);
}

#[test]
fn create_on_existing_name_fails() {
    let mut fs = mount_empty();

    fs.create("/t", InodeType::FILE).unwrap();
    assert_eq!(fs.create("/t", InodeType::FILE), Err(FsError::Exists));
    assert_eq!(fs.create("/t", InodeType::DIR), Err(FsError::Exists));
}

#[test]
fn create_in_missing_parent_fails() {
    let mut fs = mount_empty();
    assert_eq!(
        fs.create("/nowhere/x", InodeType::FILE),
        Err(FsError::NotFound)
    );
}

#[test]
fn write_then_read_through_descriptors() {
    let mut fs = mount_empty();
    let mut files = OpenFileTable::new();

    let fd = files
        .open(
            &mut fs,
            "/t",
            OpenFlags::O_CREAT | OpenFlags::O_RDWR,
        )
        .unwrap();

    let payload = b"Hello, World!\0";
    assert_eq!(files.write(&mut fs, fd, payload).unwrap(), 14);

    // Reading at end-of-file returns 0.
    let mut buf = [0u8; 14];
    assert_eq!(files.read(&mut fs, fd, &mut buf).unwrap(), 0);

    assert_eq!(files.seek(&mut fs, fd, 0, Whence::Set).unwrap(), 0);
    assert_eq!(files.read(&mut fs, fd, &mut buf).unwrap(), 14);
    assert_eq!(&buf, payload);

    files.close(fd).unwrap();
    assert_eq!(files.close(fd), Err(FsError::Invalid));
}

#[test]
fn seek_semantics_on_an_empty_file() {
    let mut fs = mount_empty();
    let mut files = OpenFileTable::new();
    let fd = files.open(&mut fs, "/seektest", OpenFlags::O_CREAT).unwrap();

    assert_eq!(files.seek(&mut fs, fd, 0, Whence::Set).unwrap(), 0);
    assert_eq!(files.seek(&mut fs, fd, 100, Whence::Set).unwrap(), 100);
    assert_eq!(
        files.seek(&mut fs, fd, -100, Whence::Set),
        Err(FsError::Invalid)
    );

    // The failed seek leaves the cursor where it was.
    assert_eq!(files.seek(&mut fs, fd, 0, Whence::Cur).unwrap(), 100);
    assert_eq!(files.seek(&mut fs, fd, -100, Whence::Cur).unwrap(), 0);
    assert_eq!(files.seek(&mut fs, fd, 100, Whence::Cur).unwrap(), 100);

    // The file is empty, so SEEK_END starts from 0 and clamps below it.
    assert_eq!(files.seek(&mut fs, fd, 0, Whence::End).unwrap(), 0);
    assert_eq!(files.seek(&mut fs, fd, 100, Whence::End).unwrap(), 100);
    assert_eq!(files.seek(&mut fs, fd, -100, Whence::End).unwrap(), 0);
}

#[test]
fn seek_composes_with_file_size() {
    let mut fs = mount_empty();
    let mut files = OpenFileTable::new();
    let fd = files
        .open(&mut fs, "/sized", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();

    files.write(&mut fs, fd, &[7u8; 1000]).unwrap();

    assert_eq!(files.seek(&mut fs, fd, 0, Whence::End).unwrap(), 1000);
    assert_eq!(files.seek(&mut fs, fd, -400, Whence::End).unwrap(), 600);
    assert_eq!(files.seek(&mut fs, fd, 50, Whence::Cur).unwrap(), 650);
}

#[test]
fn append_writes_go_to_the_end() {
    let mut fs = mount_empty();
    let mut files = OpenFileTable::new();

    let fd = files
        .open(&mut fs, "/log", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    files.write(&mut fs, fd, b"first").unwrap();
    files.close(fd).unwrap();

    let fd = files
        .open(
            &mut fs,
            "/log",
            OpenFlags::O_RDWR | OpenFlags::O_APPEND,
        )
        .unwrap();
    files.write(&mut fs, fd, b"+more").unwrap();

    files.seek(&mut fs, fd, 0, Whence::Set).unwrap();
    let mut buf = [0u8; 10];
    assert_eq!(files.read(&mut fs, fd, &mut buf).unwrap(), 10);
    assert_eq!(&buf, b"first+more");
}

#[test]
fn writes_spanning_multiple_blocks_grow_the_extents() {
    let mut fs = mount_empty();
    let mut files = OpenFileTable::new();
    let fd = files
        .open(&mut fs, "/big", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();

    let payload: Vec<u8> = (0..3 * BLOCK_SIZE + 123).map(|i| (i % 233) as u8).collect();
    assert_eq!(files.write(&mut fs, fd, &payload).unwrap(), payload.len());

    files.seek(&mut fs, fd, 0, Whence::Set).unwrap();
    let mut read_back = vec![0u8; payload.len()];
    assert_eq!(
        files.read(&mut fs, fd, &mut read_back).unwrap(),
        payload.len()
    );
    assert_eq!(read_back, payload);

    let inode = fs.resolve("/big").unwrap();
    assert_eq!({ inode.size_bytes }, payload.len() as u32);
    assert!(inode.covered_blocks() >= 4);
}

#[test]
fn delete_restores_the_allocation_hints() {
    let mut fs = mount_empty();

    let sb = fs.superblock();
    let hints_before = ({ sb.first_free_inode_bit }, { sb.first_free_data_bit });
    let root_size_before = { fs.cwd().size_bytes };

    fs.create("/z", InodeType::FILE).unwrap();

    let sb = fs.superblock();
    let hints_during = ({ sb.first_free_inode_bit }, { sb.first_free_data_bit });
    assert_ne!(hints_before, hints_during);

    fs.delete("/z").unwrap();

    let sb = fs.superblock();
    let hints_after = ({ sb.first_free_inode_bit }, { sb.first_free_data_bit });
    assert_eq!(hints_before, hints_after);
    assert_eq!(root_size_before, { fs.cwd().size_bytes });

    assert_eq!(fs.resolve("/z").unwrap_err(), FsError::NotFound);
}

#[test]
fn deleted_inode_record_is_zeroed_and_bits_cleared() {
    let mut fs = mount_empty();

    let id = fs.create("/gone", InodeType::FILE).unwrap();
    let inode = fs.read_inode(id).unwrap();
    let data_block = inode.block_at(0).unwrap();

    let sb = fs.superblock();
    let inode_bitmap_block = u32::from({ sb.first_inode_bitmap_block });
    let data_bitmap_block = u32::from({ sb.first_data_bitmap_block });
    let data_bit = { sb.first_data_block };
    let data_bit = data_block - data_bit;

    assert!(raw_bit(&fs, inode_bitmap_block, id.as_u32()));
    assert!(raw_bit(&fs, data_bitmap_block, data_bit));

    fs.delete("/gone").unwrap();

    assert!(!raw_bit(&fs, inode_bitmap_block, id.as_u32()));
    assert!(!raw_bit(&fs, data_bitmap_block, data_bit));

    let record = fs.read_inode(id);
    assert!(record.is_err() || record.unwrap().is_free());
}

#[test]
fn delete_rejects_reserved_and_missing_targets() {
    let mut fs = mount_empty();

    assert_eq!(fs.delete("/missing"), Err(FsError::NotFound));
    assert_eq!(fs.delete("/"), Err(FsError::Invalid));
}

#[test]
fn delete_requires_an_empty_directory() {
    let mut fs = mount_empty();

    fs.create("/sub", InodeType::DIR).unwrap();
    fs.create("/sub/inner", InodeType::FILE).unwrap();

    assert_eq!(fs.delete("/sub"), Err(FsError::Invalid));

    fs.delete("/sub/inner").unwrap();
    fs.delete("/sub").unwrap();
    assert_eq!(fs.resolve("/sub").unwrap_err(), FsError::NotFound);
}

#[test]
fn delete_tree_removes_everything_below() {
    let mut fs = mount_empty();

    fs.create("/top", InodeType::DIR).unwrap();
    fs.create("/top/a", InodeType::FILE).unwrap();
    fs.create("/top/sub", InodeType::DIR).unwrap();
    fs.create("/top/sub/b", InodeType::FILE).unwrap();

    fs.delete_tree("/top").unwrap();

    assert_eq!(fs.resolve("/top").unwrap_err(), FsError::NotFound);
    // Only "." and ".." remain in the root.
    assert_eq!(fs.list_dir("/").unwrap().len(), 2);
}

#[test]
fn rename_preserves_identity() {
    let mut fs = mount_empty();

    let id = fs.create("/old", InodeType::FILE).unwrap();
    fs.rename("/old", "new").unwrap();

    assert_eq!(fs.resolve("/old").unwrap_err(), FsError::NotFound);
    let renamed = fs.resolve("/new").unwrap();
    assert_eq!(renamed.id.as_u32(), id.as_u32());

    // Renaming over a live name is refused.
    fs.create("/other", InodeType::FILE).unwrap();
    assert_eq!(fs.rename("/other", "new"), Err(FsError::Exists));
}

#[test]
fn tombstone_slots_are_reused() {
    let mut fs = mount_empty();

    fs.create("/a", InodeType::FILE).unwrap();
    fs.create("/b", InodeType::FILE).unwrap();
    fs.delete("/a").unwrap();

    // The freed id and the freed slot are both handed out again.
    let id = fs.create("/c", InodeType::FILE).unwrap();
    assert_eq!(id, InodeNumber::FIRST_UNRESERVED);

    let rows = fs.list_dir("/").unwrap();
    let names: Vec<&str> = rows.iter().map(|row| row.name.as_str()).collect();
    assert_eq!(names, vec![".", "..", "c", "b"]);
}

#[test]
fn change_dir_makes_relative_paths_work() {
    let mut fs = mount_empty();

    fs.create("/sub", InodeType::DIR).unwrap();
    fs.create("/sub/file", InodeType::FILE).unwrap();

    fs.change_dir("/sub").unwrap();
    let inode = fs.resolve("file").unwrap();
    assert!(inode.is_file());

    let up = fs.resolve("..").unwrap();
    assert_eq!(up.id.as_u32(), 1);

    fs.change_dir("..").unwrap();
    assert_eq!(fs.cwd().id.as_u32(), 1);
}

#[test]
fn extents_and_data_bitmap_agree() {
    let a = vec![1u8; 2 * BLOCK_SIZE];
    let b = vec![2u8; 5 * BLOCK_SIZE + 1];
    let mut fs = mount_with_files(&[
        InputFile { name: "a", data: &a },
        InputFile { name: "b", data: &b },
    ]);
    fs.create("/c", InodeType::FILE).unwrap();

    let sb = fs.superblock();
    let data_bitmap_block = u32::from({ sb.first_data_bitmap_block });
    let first_data_block = { sb.first_data_block };

    let mut claimed = std::collections::HashSet::new();
    for row in fs.list_dir("/").unwrap() {
        if row.name == "." || row.name == ".." {
            continue;
        }
        let inode = fs.read_inode(row.id).unwrap();
        for extent in inode.extents {
            for block in extent.first_block..extent.end_block() {
                // No two inodes share a block.
                assert!(claimed.insert(block), "block {block} claimed twice");
                assert!(raw_bit(&fs, data_bitmap_block, block - first_data_block));
            }
        }
    }
}

#[test]
fn mount_rejects_a_blank_disk() {
    let device = RamDisk::new(vec![0u8; DEFAULT_DISK_SIZE]);
    assert!(OpalFs::mount(device).is_err());
}
