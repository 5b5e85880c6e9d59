#![no_std]
#![no_main]

extern crate alloc;
extern crate rlibc;

use core::panic::PanicInfo;

use opal::drivers::ide::ata_pio::AtaDrive;
use opal::errors::CanFail;
use opal::fs::ofs::OpalFs;
use opal::io::IOPort;
use opal::mem::e820::{E820MemoryMap, E820MemType, E820_MAP_ADDR};
use opal::mem::frame_alloc::{init_phys_memory_pool, with_phys_memory_pool};
use opal::mem::lmalloc::heap::{LockedListAllocator, PagedGrower};
use opal::mem::{PhyAddr, PAGE_SIZE};
use opal::syscall::install_mount;
use opal::x86::paging::mapper::{init_global_mapper, KERNEL_LOAD_ADDR};
use opal::{error, info, time};

/// Physical location of the frame bitmap, below the kernel image.
const FRAME_BITMAP_ADDR: u32 = 0x3_4000;

/// Virtual base of the kernel heap.
const KERNEL_HEAP_VIRT_BASE: usize = 0x30_0000;

/// Initial kernel heap size.
const KERNEL_HEAP_BYTES: usize = 0x10_0000;

/// Bytes of the kernel image to keep reserved.
const KERNEL_IMAGE_BYTES: usize = 0x4_0000;

#[global_allocator]
static KERNEL_HEAP: LockedListAllocator<PagedGrower> =
    LockedListAllocator::new(KERNEL_HEAP_VIRT_BASE, PagedGrower::kernel());

#[no_mangle]
#[link_section = ".start"]
pub extern "C" fn _start() -> ! {
    kmain();
}

fn kmain() -> ! {
    unsafe { mem_init() };
    time::register_clock(time::now);

    if fs_init().is_err() {
        error!("kernel", "no usable volume on the primary ATA channel");
    }

    info!("kernel", "boot complete");

    loop {
        opal::x86::halt();
    }
}

/// Seeds the frame allocator from the BIOS memory map, builds the kernel address space and
/// arms the heap.
unsafe fn mem_init() {
    let memory_map = E820MemoryMap::new(E820_MAP_ADDR as *mut u8);

    let mut total_memory: u64 = 0;
    for entry in E820MemoryMap::new(E820_MAP_ADDR as *mut u8) {
        let end = entry.base_addr() + entry.length();
        if entry.mem_type() == E820MemType::RAM && end > total_memory {
            total_memory = end;
        }
    }
    // 32-bit paging cannot reach further anyway.
    let total_memory = total_memory.min(u64::from(u32::MAX)) as usize;

    init_phys_memory_pool(FRAME_BITMAP_ADDR as *mut u32, total_memory);

    with_phys_memory_pool(|pool| {
        for entry in memory_map {
            if entry.mem_type() == E820MemType::RAM {
                let base = entry.base_addr().min(u64::from(u32::MAX)) as u32;
                let length = entry.length().min(u64::from(u32::MAX)) as usize;
                pool.mark_region_free(PhyAddr::new(base), length);
            }
        }

        // Keep the low memory, the frame bitmap and the kernel image out of the pool.
        pool.mark_region_used(PhyAddr::new(0), FRAME_BITMAP_ADDR as usize);
        pool.mark_region_used(
            PhyAddr::new(FRAME_BITMAP_ADDR),
            total_memory / PAGE_SIZE / 8 + PAGE_SIZE,
        );
        pool.mark_region_used(KERNEL_LOAD_ADDR, KERNEL_IMAGE_BYTES);
    });

    if init_global_mapper().is_err() {
        opal::x86::fatal_halt("could not build the kernel address space");
    }

    if !KERNEL_HEAP.alloc.lock().init(KERNEL_HEAP_BYTES) {
        opal::x86::fatal_halt("could not map the kernel heap");
    }

    info!("mem", "paging enabled, kernel heap armed");
}

/// Probes the primary ATA channel and mounts the root volume.
fn fs_init() -> CanFail<()> {
    let drive =
        AtaDrive::init(IOPort::PRIM_ATA, IOPort::PRIM_ATA_CTRL, false).map_err(|_| ())?;
    let fs = OpalFs::mount(drive).map_err(|_| ())?;
    install_mount(fs);

    Ok(())
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    error!("panic", "{info}");
    loop {
        opal::x86::disable_interrupts();
        opal::x86::halt();
    }
}
