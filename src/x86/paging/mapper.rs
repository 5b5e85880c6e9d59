//! Virtual-memory mapper: builds and edits the kernel page directory.
//!
//! Every page table and every mapped frame comes from the physical frame allocator; no frame is
//! ever mapped in two directories, as this is a single-address-space kernel. Tables are reached
//! through the identity mapping of low memory.

use crate::errors::{CanFail, PageMappingError};
use crate::mem::frame_alloc::{alloc_frames, free_frames, FrameAllocation};
use crate::mem::{PhyAddr, VirtAddr, PAGE_SIZE};
use crate::x86::registers::control::{enable_paging, ControlRegister, Cr3};
use crate::x86::{fatal_halt, paging::PageTable};
use conquer_once::spin::OnceCell;
use core::arch::asm;
use spin::Mutex;

use super::{PageTableFlags, ENTRIES_PER_TABLE};

/// Virtual base the kernel image is mapped at (higher-half kernel).
pub const HIGHER_HALF_BASE: VirtAddr = VirtAddr::new(0xC000_0000);

/// Physical address the bootloader loads the kernel image at.
pub const KERNEL_LOAD_ADDR: PhyAddr = PhyAddr::new(0x5_0000);

/// Owns the kernel page directory and performs all page-table surgery.
pub struct PageMapper {
    directory: *mut PageTable,
}

// The raw directory pointer is only reached through the global mutex.
unsafe impl Send for PageMapper {}

impl PageMapper {
    /// Builds the initial kernel address space.
    ///
    /// Allocates three frames (the directory and two seed tables), identity-maps the low 4MiB,
    /// maps the kernel image at [`HIGHER_HALF_BASE`], installs the directory in CR3 and enables
    /// paging.
    ///
    /// # Errors
    ///
    /// Fails with [`PageMappingError::TableAllocationFailed`] if the frame allocator cannot
    /// supply the three frames.
    ///
    /// # Safety
    ///
    /// Must run exactly once, before any virtual address above the identity mapping is touched,
    /// with the frame allocator already seeded.
    pub unsafe fn init() -> Result<Self, PageMappingError> {
        let directory = Self::alloc_table()?;
        let low_table = Self::alloc_table()?;
        let kernel_table = Self::alloc_table()?;

        // Identity map the first 4MiB.
        for i in 0..ENTRIES_PER_TABLE {
            (*low_table)
                .get_mut(i)
                .map_to_addr(PhyAddr::new((i * PAGE_SIZE) as u32), PageTableFlags::kernel_rw())?;
        }

        // Map the kernel image frames at the higher-half base.
        for i in 0..ENTRIES_PER_TABLE {
            (*kernel_table)
                .get_mut(i)
                .map_to_addr(KERNEL_LOAD_ADDR + (i * PAGE_SIZE) as u32, PageTableFlags::kernel_rw())?;
        }

        (*directory)
            .get_mut(VirtAddr::new(0).pd_index())
            .map_to_addr(PhyAddr::new(low_table as u32), PageTableFlags::kernel_rw())?;
        (*directory)
            .get_mut(HIGHER_HALF_BASE.pd_index())
            .map_to_addr(PhyAddr::new(kernel_table as u32), PageTableFlags::kernel_rw())?;

        let mapper = Self { directory };
        mapper.load();
        enable_paging();

        Ok(mapper)
    }

    fn alloc_table() -> Result<*mut PageTable, PageMappingError> {
        let frame = alloc_frames(1).map_err(|_| PageMappingError::TableAllocationFailed)?;
        let table = frame.start.as_mut_ptr::<PageTable>();
        unsafe { (*table).reset() };

        Ok(table)
    }

    /// Physical address of the current page directory.
    pub fn directory_addr(&self) -> PhyAddr {
        PhyAddr::new(self.directory as u32)
    }

    /// Installs this mapper's directory into CR3.
    pub fn load(&self) {
        Cr3::write(
            Cr3::new()
                .set_page_directory_addr(self.directory_addr())
                .expect("page directory must be page aligned"),
        );
    }

    /// Maps the page at `virt` to the frame at `phys`.
    ///
    /// The directory entry for `virt` is created (a zeroed page table is allocated) if it is
    /// not present yet. `flags` are OR-ed into the final entry on top of present.
    ///
    /// # Errors
    ///
    /// Fails if the frame allocator cannot supply a new page table, or on unaligned addresses.
    pub fn map(&mut self, phys: PhyAddr, virt: VirtAddr, flags: PageTableFlags) -> CanFail<PageMappingError> {
        let directory = unsafe { &mut *self.directory };
        let dir_entry = directory.get_mut(virt.pd_index());

        if !dir_entry.present() {
            let table = Self::alloc_table()?;
            dir_entry.map_to_addr(PhyAddr::new(table as u32), PageTableFlags::kernel_rw())?;
        }

        let table = unsafe { &mut *dir_entry.frame().addr.as_mut_ptr::<PageTable>() };
        let entry = table.get_mut(virt.pt_index());
        entry.map_to_addr(phys, flags.with_present(true))?;

        Ok(())
    }

    /// Unmaps the page at `virt`: clears the present bit and the frame of its entry.
    ///
    /// The caller is responsible for the TLB flush (see [`flush_tlb_entry`]).
    pub fn unmap(&mut self, virt: VirtAddr) {
        if let Some(entry) = self.get_page(virt) {
            entry.unmap();
        }
    }

    /// Read-only lookup of the table entry backing `virt`, used by the heap growers.
    pub fn get_page(&mut self, virt: VirtAddr) -> Option<&mut super::PageTableEntry> {
        let directory = unsafe { &mut *self.directory };
        let dir_entry = directory.get_mut(virt.pd_index());

        if !dir_entry.present() {
            return None;
        }

        let table = unsafe { &mut *dir_entry.frame().addr.as_mut_ptr::<PageTable>() };
        Some(table.get_mut(virt.pt_index()))
    }
}

/// Flushes a single page translation from the TLB.
pub fn flush_tlb_entry(virt: VirtAddr) {
    let addr = virt.as_usize();
    unsafe { asm!("invlpg [{}]", in(reg) addr) }
}

static MEMORY_MAPPER: OnceCell<Mutex<PageMapper>> = OnceCell::uninit();

/// Builds the kernel address space and installs the global mapper.
///
/// # Safety
///
/// See [`PageMapper::init`].
pub unsafe fn init_global_mapper() -> CanFail<PageMappingError> {
    let mapper = PageMapper::init()?;
    MEMORY_MAPPER.init_once(|| Mutex::new(mapper));

    Ok(())
}

/// Returns the global kernel mapper.
///
/// # Panics
///
/// Panics if [`init_global_mapper`] has not run yet.
pub fn get_memory_mapper() -> &'static Mutex<PageMapper> {
    MEMORY_MAPPER
        .get()
        .expect("memory mapper used before initialization")
}

/// Runs `f` against the global mapper.
///
/// The page-fault handler edits page tables too, so the critical section runs with interrupts
/// disabled.
pub fn with_memory_mapper<T>(f: impl FnOnce(&mut PageMapper) -> T) -> T {
    crate::x86::disable_interrupts();
    let result = f(&mut get_memory_mapper().lock());
    crate::x86::enable_interrupts();
    result
}

/// Page-fault service: maps a fresh frame at the faulting page.
///
/// Called by the fault handler for not-present faults. If physical memory is exhausted the
/// machine halts with a diagnostic; there is no paging-to-disk.
pub fn handle_page_fault(fault_addr: VirtAddr) {
    let page = VirtAddr::new(fault_addr.as_u32() & !(PAGE_SIZE as u32 - 1));

    let frame = match alloc_frames(1) {
        Ok(frame) => frame,
        Err(_) => fatal_halt("page fault: out of physical memory"),
    };

    let mapped =
        with_memory_mapper(|mapper| mapper.map(frame.start, page, PageTableFlags::kernel_rw()));
    if mapped.is_err() {
        free_frames(FrameAllocation {
            start: frame.start,
            count: 1,
        });
        fatal_halt("page fault: could not map frame");
    }
    flush_tlb_entry(page);
}
