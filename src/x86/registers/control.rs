//! _Control Registers_ implementation (read / write).
//!
//! They are used to control the operating mode of the processor and the characteristics of the
//! currently executing task. 32-bit wide in protected mode.

use crate::errors::PageMappingError;
use crate::mem::PhyAddr;
use core::arch::asm;
use modular_bitfield::bitfield;
use modular_bitfield::prelude::{B10, B7};

/// _Control Register 0_ structure.
///
/// Contains system control flags that control operating mode and states of the processor.
#[bitfield]
#[derive(Clone, Copy, Debug)]
#[repr(u32)]
pub struct Cr0 {
    /// Enables protected mode when set.
    pub protection_enable: bool,

    /// Controls the interaction of the _WAIT_ (or _FWAIT_) instruction with the _TS_ flag.
    pub monitor_coprocessor: bool,

    /// Indicates that the processor does not have an external _x87 FPU_.
    pub emulation: bool,

    /// Set by the processor on every task switch.
    pub task_switched: bool,

    pub extension_type: bool,

    /// Enables the native mechanism for reporting _x87 FPU_ errors.
    pub numeric_error: bool,
    #[skip]
    __: B10,

    /// Inhibits supervisor-level procedures from writing into read-only pages.
    pub write_protect: bool,

    #[skip]
    __: bool,

    /// Enables automatic alignment checking when set.
    pub alignment_mask: bool,

    #[skip]
    __: B10,

    pub not_write_through: bool,

    pub cache_disable: bool,

    /// Enables paging.
    pub paging: bool,
}

impl ControlRegister for Cr0 {
    fn read() -> Self {
        let cr_bits: usize;
        unsafe {
            asm!(
            "mov {}, cr0",
            out(reg) cr_bits,
            options(nomem, nostack)
            )
        }

        Self::from(cr_bits as u32)
    }

    fn write(self) {
        let cr_bits = u32::from(self) as usize;
        unsafe {
            asm!(
            "mov cr0, {}",
            in(reg) cr_bits,
            options(nomem, nostack)
            )
        }
    }
}

/// _Control Register 3_ structure.
///
/// Contains the physical address of the current page directory, and two additional flags.
#[bitfield]
#[derive(Clone, Copy, Debug)]
#[repr(u32)]
pub struct Cr3 {
    #[skip]
    __: modular_bitfield::prelude::B3,

    /// Page-level Cache Disable.
    ///
    /// Controls the memory type used to access the page directory.
    pub cache: bool,

    /// Page-level Write-Through.
    ///
    /// Controls the memory type used to access the page directory.
    pub write_through: bool,
    #[skip]
    __: B7,
    pdt_addr: modular_bitfield::prelude::B20,
}

impl Cr3 {
    /// Returns the physical address of the current page directory.
    pub fn page_directory_addr(&self) -> PhyAddr {
        PhyAddr::new(self.pdt_addr() << 12)
    }

    /// Sets the physical address of the page directory.
    ///
    /// # Errors
    ///
    /// Returns [`PageMappingError::BadAlignment`] if the given address is not page-aligned.
    pub fn set_page_directory_addr(self, addr: PhyAddr) -> Result<Self, PageMappingError> {
        if !addr.is_aligned(4096) {
            return Err(PageMappingError::BadAlignment);
        }
        Ok(self.with_pdt_addr(addr.as_u32() >> 12))
    }
}

impl ControlRegister for Cr3 {
    fn read() -> Self {
        let cr_bits: usize;
        unsafe {
            asm!(
                "mov {}, cr3",
                out(reg) cr_bits,
                options(nomem, nostack)
            )
        }

        Self::from(cr_bits as u32)
    }

    fn write(self) {
        let cr_bits = u32::from(self) as usize;
        unsafe {
            asm!(
                "mov cr3, {}",
                in(reg) cr_bits,
                options(nomem, nostack)
            )
        }
    }
}

pub trait ControlRegister {
    /// Reads the current content of the _Control Register_.
    fn read() -> Self;

    /// Updates the current content of the _Control Register_.
    fn write(self);
}

/// Turns paging on: sets the PG and PE bits of CR0.
///
/// CR3 must already hold a valid page directory.
pub fn enable_paging() {
    Cr0::write(Cr0::read().with_paging(true).with_protection_enable(true));
}
