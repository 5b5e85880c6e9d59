//! Intrusive free-list memory allocator.
//!
//! It defines the [`ListAllocator`], which can then be used with the `#[global_allocator]`
//! attribute through [`LockedListAllocator`] to serve as a general purpose memory allocator.
//!
//! The heap is a single contiguous virtual region starting at a fixed base. Each block starts
//! with a [`BlockHeader`] followed by its payload; the block list is in virtual-address order.
//! When no free block can satisfy a request, the allocator grows the region by asking its
//! [`HeapGrower`] to map more pages at the end.
//!
//! Two instances exist at runtime, one for kernel allocations and one serving the `malloc`
//! syscall; they only differ by base address and grower.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use crate::mem::PAGE_SIZE;

/// Every payload is aligned to the header size, which bounds the alignment this allocator can
/// serve.
const BLOCK_ALIGN: usize = core::mem::size_of::<BlockHeader>();

/// Memory block header. Stored in the first bytes of every block, free or not.
#[repr(C, align(16))]
struct BlockHeader {
    /// Payload size of this block, in bytes.
    size: usize,

    /// Is this block of memory available?
    free: bool,

    /// Next block of memory, in address order. Null for the tail block.
    next: *mut BlockHeader,
}

/// Maps fresh pages at the end of a heap region so that it can grow.
pub trait HeapGrower {
    /// Makes `page_count` pages available at virtual address `virt_end`, contiguously with the
    /// existing region.
    ///
    /// Returns the number of bytes actually added, or `None` when out of memory.
    fn grow(&mut self, virt_end: usize, page_count: usize) -> Option<usize>;
}

/// Intrusive singly-linked free-list allocator.
///
/// First-fit; blocks larger than the request are split, and freeing coalesces adjacent free
/// blocks so that after every `free`, no two neighbouring blocks are both free.
pub struct ListAllocator<G: HeapGrower> {
    head: *mut BlockHeader,
    virt_base: usize,
    total_pages: usize,
    grower: G,
}

unsafe impl<G: HeapGrower + Send> Send for ListAllocator<G> {}

impl<G: HeapGrower> ListAllocator<G> {
    /// Creates a dormant heap starting at `virt_base`. No memory is mapped until
    /// [`ListAllocator::init`] or the first allocation.
    pub const fn new(virt_base: usize, grower: G) -> Self {
        Self {
            head: ptr::null_mut(),
            virt_base,
            total_pages: 0,
            grower,
        }
    }

    /// Maps the initial region and writes the single free block header spanning all of it.
    ///
    /// Returns `false` if the grower could not supply the pages.
    pub fn init(&mut self, min_bytes: usize) -> bool {
        let pages = core::cmp::max(1, min_bytes.div_ceil(PAGE_SIZE));

        let Some(bytes) = self.grower.grow(self.virt_base, pages) else {
            return false;
        };
        self.total_pages = pages;

        let head = self.virt_base as *mut BlockHeader;
        unsafe {
            ptr::write(
                head,
                BlockHeader {
                    size: bytes - BLOCK_ALIGN,
                    free: true,
                    next: ptr::null_mut(),
                },
            );
        }
        self.head = head;

        true
    }

    /// Allocates `size` bytes, first-fit.
    ///
    /// Returns a null pointer when the region cannot be grown any further.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        if self.head.is_null() && !self.init(size) {
            return ptr::null_mut();
        }

        let size = round_up(size, BLOCK_ALIGN);

        // Find the first available block, keeping track of the tail.
        let mut cur = self.head;
        unsafe {
            while ((*cur).size < size || !(*cur).free) && !(*cur).next.is_null() {
                cur = (*cur).next;
            }

            if (*cur).free && (*cur).size >= size {
                if (*cur).size == size {
                    (*cur).free = false;
                } else if (*cur).size > size + BLOCK_ALIGN {
                    self.split(cur, size);
                } else {
                    // Too small to carve a free remainder out of; hand out the whole block.
                    (*cur).free = false;
                }
                return cur.cast::<u8>().add(BLOCK_ALIGN);
            }

            // No block fits: grow the region and extend (or append) the tail block.
            let cur = match self.grow_tail(cur, size) {
                Some(block) => block,
                None => return ptr::null_mut(),
            };

            if (*cur).size > size + BLOCK_ALIGN {
                self.split(cur, size);
            } else {
                (*cur).free = false;
            }
            cur.cast::<u8>().add(BLOCK_ALIGN)
        }
    }

    /// Releases the block whose payload starts at `block`, then merges free neighbours.
    ///
    /// Pointers that do not match any block payload are ignored.
    pub fn deallocate(&mut self, block: *mut u8) {
        if block.is_null() {
            return;
        }

        let mut cur = self.head;
        unsafe {
            while !cur.is_null() {
                if cur.cast::<u8>().add(BLOCK_ALIGN) == block {
                    (*cur).free = true;
                    self.merge_free_blocks();
                    return;
                }
                cur = (*cur).next;
            }
        }
    }

    /// Splits `block` in two by inserting a new free header right after `size` payload bytes;
    /// the new block inherits the rest.
    unsafe fn split(&mut self, block: *mut BlockHeader, size: usize) {
        let new_block = block.cast::<u8>().add(size + BLOCK_ALIGN).cast::<BlockHeader>();

        ptr::write(
            new_block,
            BlockHeader {
                size: (*block).size - size - BLOCK_ALIGN,
                free: true,
                next: (*block).next,
            },
        );

        (*block).size = size;
        (*block).free = false;
        (*block).next = new_block;
    }

    /// Grows the mapped region until the tail block can hold `size` bytes, and returns that
    /// block. `tail` must be the last block of the list.
    unsafe fn grow_tail(&mut self, tail: *mut BlockHeader, size: usize) -> Option<*mut BlockHeader> {
        let region_end = self.virt_base + self.total_pages * PAGE_SIZE;

        // Bytes the tail block can already contribute, if it is free.
        let reusable = if (*tail).free { (*tail).size + BLOCK_ALIGN } else { 0 };
        let missing = size + BLOCK_ALIGN - reusable;
        let page_count = missing.div_ceil(PAGE_SIZE);

        let grown = self.grower.grow(region_end, page_count)?;
        self.total_pages += page_count;

        if (*tail).free {
            (*tail).size += grown;
            Some(tail)
        } else {
            let new_tail = region_end as *mut BlockHeader;
            ptr::write(
                new_tail,
                BlockHeader {
                    size: grown - BLOCK_ALIGN,
                    free: true,
                    next: ptr::null_mut(),
                },
            );
            (*tail).next = new_tail;
            Some(new_tail)
        }
    }

    /// Merges consecutive free list nodes, left to right.
    fn merge_free_blocks(&mut self) {
        let mut cur = self.head;
        unsafe {
            while !cur.is_null() && !(*cur).next.is_null() {
                let next = (*cur).next;
                if (*cur).free && (*next).free {
                    (*cur).size += (*next).size + BLOCK_ALIGN;
                    (*cur).next = (*next).next;
                    continue;
                }
                cur = next;
            }
        }
    }

    /// Walks the list and returns `(block_count, free_count)`. Debug / test aid.
    pub fn block_stats(&self) -> (usize, usize) {
        let mut blocks = 0;
        let mut free = 0;
        let mut cur = self.head;
        unsafe {
            while !cur.is_null() {
                blocks += 1;
                if (*cur).free {
                    free += 1;
                }
                cur = (*cur).next;
            }
        }
        (blocks, free)
    }
}

const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Locked version of the [`ListAllocator`].
///
/// Uses a spinlock-based Mutex to ensure interior mutability, so that it can back the
/// `#[global_allocator]` attribute.
pub struct LockedListAllocator<G: HeapGrower> {
    pub alloc: spin::Mutex<ListAllocator<G>>,
}

impl<G: HeapGrower> LockedListAllocator<G> {
    pub const fn new(virt_base: usize, grower: G) -> Self {
        Self {
            alloc: spin::Mutex::new(ListAllocator::new(virt_base, grower)),
        }
    }
}

unsafe impl<G: HeapGrower + Send> GlobalAlloc for LockedListAllocator<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > BLOCK_ALIGN {
            return ptr::null_mut();
        }
        self.alloc.lock().allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.alloc.lock().deallocate(ptr);
    }
}

/// Grows a heap by allocating physical frames and mapping them right behind the current end of
/// the region. Used by both runtime heap instances.
pub struct PagedGrower {
    flags_user: bool,
}

impl PagedGrower {
    pub const fn kernel() -> Self {
        Self { flags_user: false }
    }

    pub const fn user() -> Self {
        Self { flags_user: true }
    }
}

impl HeapGrower for PagedGrower {
    fn grow(&mut self, virt_end: usize, page_count: usize) -> Option<usize> {
        use crate::mem::frame_alloc::alloc_frames;
        use crate::mem::{PhyAddr, VirtAddr};
        use crate::x86::paging::mapper::{flush_tlb_entry, with_memory_mapper};
        use crate::x86::paging::PageTableFlags;

        let frames = alloc_frames(page_count).ok()?;

        let mut flags = PageTableFlags::kernel_rw();
        if self.flags_user {
            flags = flags.with_user_access(true);
        }

        with_memory_mapper(|mapper| {
            for page in 0..page_count {
                let phys = PhyAddr::new(frames.start.as_u32() + (page * PAGE_SIZE) as u32);
                let virt = VirtAddr::new((virt_end + page * PAGE_SIZE) as u32);
                mapper.map(phys, virt, flags).ok()?;
                flush_tlb_entry(virt);
            }
            Some(())
        })?;

        Some(page_count * PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backs a test heap with one big preallocated host allocation.
    struct SliceGrower {
        base: usize,
        capacity: usize,
        mapped: usize,
    }

    impl SliceGrower {
        fn new(capacity_pages: usize) -> Self {
            let layout = Layout::from_size_align(capacity_pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            let base = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!base.is_null());
            Self {
                base: base as usize,
                capacity: capacity_pages * PAGE_SIZE,
                mapped: 0,
            }
        }
    }

    impl HeapGrower for SliceGrower {
        fn grow(&mut self, virt_end: usize, page_count: usize) -> Option<usize> {
            assert_eq!(virt_end, self.base + self.mapped);
            if self.mapped + page_count * PAGE_SIZE > self.capacity {
                return None;
            }
            self.mapped += page_count * PAGE_SIZE;
            Some(page_count * PAGE_SIZE)
        }
    }

    fn test_heap(capacity_pages: usize) -> ListAllocator<SliceGrower> {
        let grower = SliceGrower::new(capacity_pages);
        let base = grower.base;
        let mut heap = ListAllocator::new(base, grower);
        assert!(heap.init(PAGE_SIZE));
        heap
    }

    #[test]
    fn alloc_and_free_roundtrip() {
        let mut heap = test_heap(8);

        let p = heap.allocate(100);
        assert!(!p.is_null());
        heap.deallocate(p);

        let q = heap.allocate(100);
        assert_eq!(p, q, "freed space should be reused first-fit");
    }

    #[test]
    fn split_leaves_remainder_free() {
        let mut heap = test_heap(8);

        let _p = heap.allocate(256);
        let (blocks, free) = heap.block_stats();
        assert_eq!(blocks, 2);
        assert_eq!(free, 1);
    }

    #[test]
    fn grow_extends_the_tail() {
        let mut heap = test_heap(8);

        // Larger than the initially mapped page; forces a grow.
        let p = heap.allocate(3 * PAGE_SIZE);
        assert!(!p.is_null());

        let q = heap.allocate(64);
        assert!(!q.is_null());
    }

    #[test]
    fn coalescing_restores_a_single_free_block() {
        let mut heap = test_heap(8);

        let p1 = heap.allocate(250);
        let p2 = heap.allocate(6000);
        let p3 = heap.allocate(333);

        heap.deallocate(p2);
        heap.deallocate(p3);
        heap.deallocate(p1);

        let (blocks, free) = heap.block_stats();
        assert_eq!((blocks, free), (1, 1));
    }

    #[test]
    fn no_adjacent_free_blocks_after_any_free() {
        let mut heap = test_heap(8);

        let ptrs: Vec<*mut u8> = [100usize, 42, 250, 16, 512]
            .iter()
            .map(|&n| heap.allocate(n))
            .collect();

        for &p in ptrs.iter().rev() {
            heap.deallocate(p);

            let mut cur = heap.head;
            let mut prev_free = false;
            unsafe {
                while !cur.is_null() {
                    if (*cur).free {
                        assert!(!prev_free, "two adjacent free blocks after a free");
                    }
                    prev_free = (*cur).free;
                    cur = (*cur).next;
                }
            }
        }
    }

    #[test]
    fn oom_returns_null() {
        let mut heap = test_heap(2);

        assert!(!heap.allocate(PAGE_SIZE).is_null());
        assert!(heap.allocate(4 * PAGE_SIZE).is_null());
    }
}
