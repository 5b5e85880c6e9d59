//! Main physical memory allocator.
//!
//! Tracks 4KiB frames in a bitmap stored at a fixed address supplied at init time, one bit per
//! frame, set meaning in-use. Allocation is first-fit with word-level skipping: full 32-bit
//! words are skipped wholesale, and a candidate found inside a word is then re-verified bit by
//! bit so that discontiguous runs are rejected.
//!
//! Frames handed out by this allocator are not mapped anywhere; pairing a frame with a virtual
//! page is the mapper's job.

use crate::errors::FrameAllocationError;
use crate::mem::{PhyAddr, PAGE_SIZE};
use crate::x86::{disable_interrupts, enable_interrupts};
use conquer_once::spin::OnceCell;
use core::ptr;
use spin::Mutex;

const FRAMES_PER_WORD: usize = 32;

/// Defines the basic set of operations that should be offered by a physical memory allocator
/// (_Frame_ allocator).
pub trait FrameAllocator {
    /// Allocates `count` contiguous frames of physical memory from the pool associated with
    /// this allocator.
    ///
    /// # Errors
    ///
    /// Returns [`FrameAllocationError::NoAvailableFrame`] if no run of `count` free frames
    /// exists, which usually means the system is running out of memory.
    fn allocate(&mut self, count: usize) -> Result<FrameAllocation, FrameAllocationError>;

    /// Returns a frame run previously obtained through [`FrameAllocator::allocate`] to the pool.
    fn deallocate(&mut self, alloc: FrameAllocation);
}

/// Contains information about a physical memory `Frame` run after it has been allocated by a
/// [`FrameAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameAllocation {
    pub start: PhyAddr,
    pub count: usize,
}

/// Bitmap-based physical frame allocator.
///
/// The bitmap lives at a fixed physical location chosen by the caller (the kernel reserves an
/// area below the kernel image for it); the allocator only ever touches `max_frames / 8` bytes
/// there.
#[derive(Debug)]
pub struct BitmapFrameAllocator {
    bitmap: *mut u32,
    max_frames: usize,
    used_frames: usize,
}

// Raw bitmap pointer; the single global instance is guarded by a Mutex.
unsafe impl Send for BitmapFrameAllocator {}

impl BitmapFrameAllocator {
    /// Creates the allocator with every frame marked in-use.
    ///
    /// Regions that are actually available get released afterwards with
    /// [`BitmapFrameAllocator::mark_region_free`], so that anything the memory map does not
    /// explicitly report stays reserved.
    ///
    /// # Safety
    ///
    /// `bitmap_addr` must point to `total_memory / PAGE_SIZE / 8` writable bytes that no other
    /// component uses.
    pub unsafe fn init(bitmap_addr: *mut u32, total_memory: usize) -> Self {
        let max_frames = total_memory / PAGE_SIZE;

        ptr::write_bytes(bitmap_addr.cast::<u8>(), 0xFF, max_frames / 8);

        Self {
            bitmap: bitmap_addr,
            max_frames,
            used_frames: max_frames,
        }
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn used_frames(&self) -> usize {
        self.used_frames
    }

    fn set_bit(&mut self, bit: usize) {
        unsafe {
            let word = self.bitmap.add(bit / FRAMES_PER_WORD);
            ptr::write(word, ptr::read(word) | (1 << (bit % FRAMES_PER_WORD)));
        }
    }

    fn clear_bit(&mut self, bit: usize) {
        unsafe {
            let word = self.bitmap.add(bit / FRAMES_PER_WORD);
            ptr::write(word, ptr::read(word) & !(1 << (bit % FRAMES_PER_WORD)));
        }
    }

    fn test_bit(&self, bit: usize) -> bool {
        unsafe { ptr::read(self.bitmap.add(bit / FRAMES_PER_WORD)) & (1 << (bit % FRAMES_PER_WORD)) != 0 }
    }

    /// Releases the frames covering `[base, base + size)`.
    ///
    /// Frame 0 is forcibly kept reserved: handing out the null frame would turn every null
    /// pointer dereference into a valid access, and the low memory holds the IVT/BDA anyway.
    pub fn mark_region_free(&mut self, base: PhyAddr, size: usize) {
        let first = base.frame_index();
        let count = size / PAGE_SIZE;

        for frame in first..first + count {
            if frame >= self.max_frames {
                break;
            }
            if self.test_bit(frame) {
                self.clear_bit(frame);
                self.used_frames -= 1;
            }
        }

        if !self.test_bit(0) {
            self.set_bit(0);
            self.used_frames += 1;
        }
    }

    /// Reserves the frames covering `[base, base + size)`.
    pub fn mark_region_used(&mut self, base: PhyAddr, size: usize) {
        let first = base.frame_index();
        let count = size.div_ceil(PAGE_SIZE);

        for frame in first..first + count {
            if frame >= self.max_frames {
                break;
            }
            if !self.test_bit(frame) {
                self.set_bit(frame);
                self.used_frames += 1;
            }
        }
    }

    /// First-fit search for `count` contiguous free frames.
    ///
    /// Words with all bits set are skipped; a candidate bit found inside a partial word is then
    /// verified bit-wise over the whole run.
    fn find_first_free_run(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }

        for word_idx in 0..self.max_frames / FRAMES_PER_WORD {
            let word = unsafe { ptr::read(self.bitmap.add(word_idx)) };
            if word == u32::MAX {
                continue;
            }

            for bit in 0..FRAMES_PER_WORD {
                if word & (1 << bit) != 0 {
                    continue;
                }

                let start = word_idx * FRAMES_PER_WORD + bit;
                if start + count > self.max_frames {
                    return None;
                }

                if (start..start + count).all(|frame| !self.test_bit(frame)) {
                    return Some(start);
                }
            }
        }

        None
    }
}

impl FrameAllocator for BitmapFrameAllocator {
    fn allocate(&mut self, count: usize) -> Result<FrameAllocation, FrameAllocationError> {
        if count == 0 || self.used_frames + count > self.max_frames {
            return Err(FrameAllocationError::NoAvailableFrame);
        }

        let start = self
            .find_first_free_run(count)
            .ok_or(FrameAllocationError::NoAvailableFrame)?;

        for frame in start..start + count {
            self.set_bit(frame);
        }
        self.used_frames += count;

        Ok(FrameAllocation {
            start: PhyAddr::new((start * PAGE_SIZE) as u32),
            count,
        })
    }

    fn deallocate(&mut self, alloc: FrameAllocation) {
        let start = alloc.start.frame_index();

        for frame in start..start + alloc.count {
            if self.test_bit(frame) {
                self.clear_bit(frame);
                self.used_frames -= 1;
            }
        }
    }
}

static PHYSICAL_MEMORY_POOL: OnceCell<Mutex<BitmapFrameAllocator>> = OnceCell::uninit();

/// Initializes the global physical memory pool.
///
/// # Panics
///
/// Panics if the pool was already initialized.
///
/// # Safety
///
/// See [`BitmapFrameAllocator::init`].
pub unsafe fn init_phys_memory_pool(bitmap_addr: *mut u32, total_memory: usize) {
    assert!(
        !PHYSICAL_MEMORY_POOL.is_initialized(),
        "attempted to initialize physical memory twice"
    );

    PHYSICAL_MEMORY_POOL.init_once(|| Mutex::new(BitmapFrameAllocator::init(bitmap_addr, total_memory)));
}

/// Runs `f` against the global frame pool.
///
/// The page-fault handler allocates frames, so the critical section runs with interrupts
/// disabled.
pub fn with_phys_memory_pool<T>(f: impl FnOnce(&mut BitmapFrameAllocator) -> T) -> Option<T> {
    let pool = PHYSICAL_MEMORY_POOL.get()?;

    disable_interrupts();
    let result = f(&mut pool.lock());
    enable_interrupts();

    Some(result)
}

/// Allocates `count` contiguous frames from the global pool.
pub fn alloc_frames(count: usize) -> Result<FrameAllocation, FrameAllocationError> {
    with_phys_memory_pool(|pool| pool.allocate(count))
        .unwrap_or(Err(FrameAllocationError::NoAvailableFrame))
}

/// Returns frames to the global pool.
pub fn free_frames(alloc: FrameAllocation) {
    with_phys_memory_pool(|pool| pool.deallocate(alloc));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_allocator(frames: usize) -> BitmapFrameAllocator {
        let words = frames / FRAMES_PER_WORD;
        let storage = alloc::vec![0u32; words].leak();
        let mut allocator = unsafe { BitmapFrameAllocator::init(storage.as_mut_ptr(), frames * PAGE_SIZE) };
        allocator.mark_region_free(PhyAddr::new(0), frames * PAGE_SIZE);
        allocator
    }

    #[test]
    fn null_frame_stays_reserved() {
        let allocator = test_allocator(64);
        assert!(allocator.test_bit(0));
        assert_eq!(allocator.used_frames(), 1);
    }

    #[test]
    fn allocation_sets_exactly_the_run() {
        let mut allocator = test_allocator(64);

        let alloc = allocator.allocate(4).unwrap();
        let start = alloc.start.frame_index();
        assert_eq!(start, 1);

        for frame in start..start + 4 {
            assert!(allocator.test_bit(frame));
        }
        assert!(!allocator.test_bit(start + 4));

        allocator.deallocate(alloc);
        for frame in start..start + 4 {
            assert!(!allocator.test_bit(frame));
        }
    }

    #[test]
    fn first_fit_skips_holes_too_small() {
        let mut allocator = test_allocator(64);

        let a = allocator.allocate(1).unwrap();
        let b = allocator.allocate(4).unwrap();
        let c = allocator.allocate(1).unwrap();
        allocator.deallocate(b);

        // A 6-frame run does not fit in the 4-frame hole.
        let d = allocator.allocate(6).unwrap();
        assert_eq!(d.start.frame_index(), c.start.frame_index() + 1);

        // But a 3-frame run does, first-fit.
        let e = allocator.allocate(3).unwrap();
        assert_eq!(e.start.frame_index(), a.start.frame_index() + 1);
    }

    #[test]
    fn exhaustion_reports_no_available_frame() {
        let mut allocator = test_allocator(32);

        // 31 frames available (frame 0 reserved).
        assert!(allocator.allocate(31).is_ok());
        assert_eq!(
            allocator.allocate(1),
            Err(FrameAllocationError::NoAvailableFrame)
        );
    }

    #[test]
    fn reserved_regions_are_not_handed_out() {
        let mut allocator = test_allocator(64);
        allocator.mark_region_used(PhyAddr::new(PAGE_SIZE as u32), 8 * PAGE_SIZE);

        let alloc = allocator.allocate(1).unwrap();
        assert_eq!(alloc.start.frame_index(), 9);
    }
}
