pub mod dev_disk;
