//! x86 two-level paging structures.
//!
//! Classic 32-bit paging: a page directory of 1024 entries, each referencing a page table of
//! 1024 entries, each mapping a 4KiB page. Both levels share the same entry layout, so a single
//! [`PageTable`] type covers directories and tables.

pub mod mapper;

use crate::errors::{CanFail, PageMappingError};
use crate::mem::{PhyAddr, VirtAddr};
use core::ops::BitOr;
use modular_bitfield::bitfield;
use modular_bitfield::prelude::B23;

/// Entries in a page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// A 4KiB-aligned unit of virtual address space.
#[derive(Clone, Copy, Debug)]
pub struct Page {
    pub start: VirtAddr,
}

/// A 4KiB-aligned unit of physical memory.
#[derive(Clone, Copy, Debug)]
pub struct Frame {
    pub addr: PhyAddr,
}

/// Stores mapping information between virtual [`Page`] and physical memory [`Frame`].
///
/// The table must be page-aligned, as CR3 and directory entries only store the top 20 address
/// bits.
#[repr(align(4096))]
#[derive(Debug)]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Returns a mutable reference to an entry in this table.
    pub fn get_mut(&mut self, id: usize) -> &mut PageTableEntry {
        &mut self.entries[id]
    }

    pub fn get(&self, id: usize) -> &PageTableEntry {
        &self.entries[id]
    }

    /// Resets every entry to the supervisor read/write, not-present state.
    pub fn reset(&mut self) {
        self.entries = [PageTableEntry::EMPTY_RW; ENTRIES_PER_TABLE];
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self {
            entries: [PageTableEntry::EMPTY_RW; ENTRIES_PER_TABLE],
        }
    }
}

/// Represents a paging structure entry.
///
/// Contains the physical address of the [`Frame`] (or next-level table) referenced by this
/// entry in bits 12..32, and [`PageTableFlags`] in the low bits.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    /// Bits corresponding to the address part of the entry.
    const ADDR_BITS: u32 = 0xFFFF_F000;

    /// Not present, supervisor, read/write. The state of every entry in a fresh directory.
    pub const EMPTY_RW: Self = Self(0x02);

    /// Returns whether this entry maps something.
    #[must_use]
    pub fn present(&self) -> bool {
        self.flags().present()
    }

    /// Returns the physical memory [`Frame`] that this entry maps to.
    #[must_use]
    pub fn frame(&self) -> Frame {
        Frame {
            addr: PhyAddr::new(self.0 & Self::ADDR_BITS),
        }
    }

    /// Maps this entry to the physical memory [`Frame`] starting at the given address.
    ///
    /// # Errors
    ///
    /// Returns [`PageMappingError::BadAlignment`] if the given physical address is not
    /// page-aligned.
    pub fn map_to_addr(&mut self, addr: PhyAddr, flags: PageTableFlags) -> CanFail<PageMappingError> {
        if !addr.is_aligned(4096) {
            return Err(PageMappingError::BadAlignment);
        }
        self.0 = addr.as_u32() | u32::from(flags);

        Ok(())
    }

    /// OR-s additional flags into this entry.
    pub fn add_flags(&mut self, flags: PageTableFlags) {
        self.0 |= u32::from(flags);
    }

    /// Replaces this entry's flags, keeping the frame.
    pub fn set_flags(&mut self, flags: PageTableFlags) {
        self.0 = (self.0 & Self::ADDR_BITS) | u32::from(flags);
    }

    /// Returns this entry's flags.
    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from(self.0 & !Self::ADDR_BITS)
    }

    /// Clears the frame and the present bit. The caller is responsible for the TLB flush.
    pub fn unmap(&mut self) {
        self.0 = u32::from(self.flags().with_present(false)) & !Self::ADDR_BITS;
    }
}

/// Flags associated to a [`PageTableEntry`].
#[bitfield]
#[derive(Clone, Copy, Debug)]
#[repr(u32)]
pub struct PageTableFlags {
    /// Present bit.
    ///
    /// Must be set to map to a [`Frame`].
    pub present: bool,

    /// Read/write bit.
    ///
    /// If clear, writes to the [`Page`] referenced by this entry are not allowed.
    pub write: bool,

    /// User/supervisor bit.
    ///
    /// If clear, user mode accesses to the [`Page`] referenced by this entry are not allowed.
    pub user_access: bool,

    /// Page-level write-through bit.
    pub write_through: bool,

    /// Page-level cache disable bit.
    pub cache_disable: bool,

    /// Accessed bit.
    ///
    /// Set by the processor when the [`Page`] referenced by this entry is accessed.
    pub accessed: bool,

    /// Dirty bit.
    ///
    /// Set by the processor when the [`Page`] referenced by this entry is written to.
    pub dirty: bool,

    /// Page-size bit in a directory entry (4MiB page when set); PAT slot in a table entry.
    pub huge_page: bool,

    /// Global bit.
    ///
    /// Keeps the translation cached in the TLB across a CR3 switch.
    pub global: bool,

    #[skip]
    __: B23,
}

impl BitOr for PageTableFlags {
    type Output = PageTableFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        PageTableFlags::from(u32::from(self) | u32::from(rhs))
    }
}

impl PageTableFlags {
    /// Present + writable, the default kernel mapping.
    pub fn kernel_rw() -> Self {
        Self::new().with_present(true).with_write(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_packs_address_and_flags() {
        let mut entry = PageTableEntry::default();
        entry
            .map_to_addr(PhyAddr::new(0x0042_3000), PageTableFlags::kernel_rw())
            .unwrap();

        assert!(entry.present());
        assert_eq!(entry.frame().addr, PhyAddr::new(0x0042_3000));
        assert!(entry.flags().write());

        entry.unmap();
        assert!(!entry.present());
        assert_eq!(entry.frame().addr, PhyAddr::new(0));
        // The access rights survive the unmap.
        assert!(entry.flags().write());
    }

    #[test]
    fn unaligned_frame_is_rejected() {
        let mut entry = PageTableEntry::default();
        assert_eq!(
            entry.map_to_addr(PhyAddr::new(0x123), PageTableFlags::kernel_rw()),
            Err(PageMappingError::BadAlignment)
        );
    }
}
