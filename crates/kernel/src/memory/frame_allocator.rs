use core::{
    fmt::Debug,
    ops::{Deref, DerefMut},
};

use crate::config;
use crate::utils::locks::IrqMutex;
use lazy_static::lazy_static;
use limine::memory_map::EntryType;

use super::{PhysAddr, VirtAddr, align_down, paging::PAGE_SIZE};

/// A pointer to some data in a physical frame through its direct-map alias.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FramePtr<T>(*mut T);

impl<T> FramePtr<T> {
    pub fn phys_addr(&self) -> PhysAddr {
        VirtAddr::from_ptr(self.as_ptr()).into_phys()
    }

    pub fn frame(&self) -> Frame {
        Frame(self.phys_addr())
    }

    pub const fn as_ptr(&self) -> *mut T {
        self.0
    }
}

impl<T> Deref for FramePtr<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.0 }
    }
}

impl<T> DerefMut for FramePtr<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.0 }
    }
}

/// A 4 KiB-aligned physical page of memory.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame(PhysAddr);

impl Frame {
    #[inline(always)]
    pub fn containing_address(address: PhysAddr) -> Self {
        Self(PhysAddr::from(align_down(address.into_raw(), PAGE_SIZE)))
    }

    #[inline]
    pub const fn start_address(&self) -> PhysAddr {
        self.0
    }

    #[inline(always)]
    pub fn virt_addr(&self) -> VirtAddr {
        self.0.into_virt()
    }

    pub fn iter_frames(start: Frame, end: Frame) -> FrameIter {
        debug_assert!(start.start_address() <= end.start_address());
        FrameIter { start, end }
    }

    /// Converts a frame into a pointer to some data in that frame
    /// # Safety
    /// the caller must ensure that the frame is valid and holds a `T`
    pub unsafe fn into_ptr<T>(self) -> FramePtr<T> {
        FramePtr(self.virt_addr().into_ptr::<T>())
    }

    const fn page_num(&self) -> usize {
        self.0.into_raw() / PAGE_SIZE
    }
}

impl Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Frame")
            .field(&format_args!("{:#x}", self.start_address()))
            .finish()
    }
}

pub struct FrameIter {
    start: Frame,
    end: Frame,
}

impl Iterator for FrameIter {
    type Item = Frame;
    fn next(&mut self) -> Option<Self::Item> {
        if self.start.start_address() < self.end.start_address() {
            let frame = self.start;
            self.start.0 += PAGE_SIZE;
            Some(frame)
        } else {
            None
        }
    }
}

/// The free list is threaded through the free frames themselves: each free
/// frame's first bytes hold the links, addressed through the direct map.
#[derive(Debug)]
struct FreeNode {
    start_address: PhysAddr,
    next: Option<*mut FreeNode>,
    prev: Option<*mut FreeNode>,
}

impl FreeNode {
    /// # Safety
    /// `frame` must be free and unreferenced.
    unsafe fn new_in(frame: Frame) -> *mut Self {
        let node = frame.virt_addr().into_ptr::<FreeNode>();
        unsafe {
            *node = FreeNode {
                start_address: frame.start_address(),
                next: None,
                prev: None,
            };
        }
        node
    }

    const fn page_num(&self) -> usize {
        self.start_address.into_raw() / PAGE_SIZE
    }
}

/// Free-list physical frame allocator over the firmware memory map.
///
/// `head` receives freed frames; `tail` is the oldest end, still in
/// map order, which keeps the contiguous search simple.
#[derive(Debug)]
pub struct FrameAllocator {
    head: Option<*mut FreeNode>,
    tail: Option<*mut FreeNode>,
    /// outstanding allocations
    allocations: usize,
    /// frames currently threaded on (or handed out from) the list
    loaded_frames: usize,
    /// usable frames according to the firmware map
    usable_frames: usize,
    /// next memory-map entry to pull when loading lazily
    next_entry: usize,
}

unsafe impl Send for FrameAllocator {}

impl FrameAllocator {
    fn new() -> Self {
        Self {
            head: None,
            tail: None,
            allocations: 0,
            loaded_frames: 0,
            usable_frames: 0,
            next_entry: 0,
        }
    }

    #[inline(always)]
    fn push_free(&mut self, frame: Frame) {
        unsafe {
            let node = FreeNode::new_in(frame);
            if let Some(head) = self.head.take() {
                (*head).prev = Some(node);
                (*node).next = Some(head);
            }
            if self.tail.is_none() {
                self.tail = Some(node);
            }
            self.head = Some(node);
        }
    }

    fn unlink(&mut self, node: *mut FreeNode) {
        unsafe {
            let prev = (*node).prev.take();
            let next = (*node).next.take();
            match prev {
                Some(prev) => (*prev).next = next,
                None => self.head = next,
            }
            match next {
                Some(next) => (*next).prev = prev,
                None => self.tail = prev,
            }
        }
    }

    /// Pulls one usable memory-map entry onto the free list. Returns false
    /// when the map is exhausted.
    fn load_next_entry(&mut self) -> bool {
        let entries = crate::limine::mmap_request().entries();
        while let Some(entry) = entries.get(self.next_entry) {
            self.next_entry += 1;
            if entry.entry_type != EntryType::USABLE {
                continue;
            }

            let start = PhysAddr::from(entry.base as usize);
            let end = start + entry.length as usize;
            let mut count = 0;
            for frame in Frame::iter_frames(
                Frame::containing_address(start),
                Frame::containing_address(end),
            ) {
                self.push_free(frame);
                count += 1;
            }
            self.loaded_frames += count;
            if count != 0 {
                return true;
            }
        }
        false
    }

    fn refill_if_empty(&mut self) -> bool {
        while self.head.is_none() {
            if !self.load_next_entry() {
                return false;
            }
        }
        true
    }

    #[inline]
    pub fn allocate_frame(&mut self) -> Option<Frame> {
        if !self.refill_if_empty() {
            return None;
        }
        let head = self.head?;
        self.unlink(head);
        self.allocations += 1;
        Some(Frame::containing_address(unsafe { (*head).start_address }))
    }

    /// Allocates `num_pages` physically contiguous frames whose start is
    /// aligned to `align_pages * PAGE_SIZE` and whose end stays below
    /// `max_addr`. Returns the first frame.
    pub fn allocate_contiguous(
        &mut self,
        num_pages: usize,
        align_pages: usize,
        max_addr: PhysAddr,
    ) -> Option<Frame> {
        debug_assert!(num_pages >= 1);
        // the whole map has to be visible for a contiguity search
        while self.load_next_entry() {}

        let alignment = align_pages.max(1) * PAGE_SIZE;
        let size = num_pages * PAGE_SIZE;

        unsafe {
            // the tail half of the list is still in map order; walk runs of
            // consecutive page numbers from there
            let mut run_start: Option<*mut FreeNode> = None;
            let mut run_len = 0usize;
            let mut prev_page = 0usize;

            let mut cursor = self.tail;
            while let Some(node) = cursor {
                let addr = (*node).start_address;
                let page = (*node).page_num();

                let continues = run_len != 0 && page == prev_page + 1;
                if !continues {
                    run_start = None;
                    run_len = 0;
                }
                if run_len == 0
                    && addr.into_raw() % alignment == 0
                    && addr.into_raw() + size <= max_addr.into_raw()
                {
                    run_start = Some(node);
                }
                if run_start.is_some() {
                    run_len += 1;
                }
                prev_page = page;

                if run_len == num_pages {
                    let start = Frame::containing_address((*run_start.unwrap()).start_address);
                    // unlink the whole run; the nodes are adjacent in the list
                    let mut victim = run_start.unwrap();
                    for _ in 0..num_pages {
                        let prev = (*victim).prev;
                        self.unlink(victim);
                        match prev {
                            Some(prev) => victim = prev,
                            None => break,
                        }
                    }
                    self.allocations += num_pages;
                    return Some(start);
                }

                cursor = (*node).prev;
            }
        }
        None
    }

    #[inline]
    pub fn deallocate_frame(&mut self, frame: Frame) {
        self.push_free(frame);
        self.allocations -= 1;
    }

    pub fn deallocate_contiguous(&mut self, start: Frame, num_pages: usize) {
        let end = Frame::containing_address(start.start_address() + num_pages * PAGE_SIZE);
        for frame in Frame::iter_frames(start, end) {
            self.deallocate_frame(frame);
        }
    }

    /// outstanding allocations
    pub fn mapped_frames(&self) -> usize {
        self.allocations
    }

    /// usable frames according to the firmware map
    pub fn usable_frames(&self) -> usize {
        self.usable_frames
    }

    /// frames currently on the free list
    pub fn free_frames(&self) -> usize {
        self.loaded_frames - self.allocations
    }

    /// Walks the whole list; only sane for consistency tests.
    fn count_frames_expensive(&self) -> usize {
        let mut n = 0;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            n += 1;
            cursor = unsafe { (*node).next };
        }
        n
    }

    fn create() -> Self {
        let mut allocator = Self::new();

        let mut usable = 0;
        for entry in crate::limine::mmap_request().entries().iter() {
            if entry.entry_type == EntryType::USABLE {
                usable += entry.length as usize / PAGE_SIZE;
            }
        }
        allocator.usable_frames = usable;

        if !config::PMM_LAZY {
            while allocator.load_next_entry() {}
        }
        allocator
    }
}

lazy_static! {
    static ref FRAME_ALLOCATOR: IrqMutex<FrameAllocator> = IrqMutex::new(FrameAllocator::create());
}

#[inline(always)]
pub fn allocate_frame() -> Option<Frame> {
    FRAME_ALLOCATOR.lock().allocate_frame()
}

#[inline(always)]
pub fn allocate_contiguous(num_pages: usize, align_pages: usize, max_addr: PhysAddr) -> Option<Frame> {
    FRAME_ALLOCATOR
        .lock()
        .allocate_contiguous(num_pages, align_pages, max_addr)
}

#[inline(always)]
pub fn deallocate_frame(frame: Frame) {
    FRAME_ALLOCATOR.lock().deallocate_frame(frame)
}

#[inline(always)]
pub fn deallocate_contiguous(start: Frame, num_pages: usize) {
    FRAME_ALLOCATOR.lock().deallocate_contiguous(start, num_pages)
}

/// returns the number of outstanding frame allocations
#[inline(always)]
pub fn mapped_frames() -> usize {
    FRAME_ALLOCATOR.lock().mapped_frames()
}

#[inline(always)]
pub fn usable_frames() -> usize {
    FRAME_ALLOCATOR.lock().usable_frames()
}

#[inline(always)]
pub fn free_frames() -> usize {
    FRAME_ALLOCATOR.lock().free_frames()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn allocate_many() {
        let mut frames = heapless::Vec::<_, 512>::new();
        for _ in 0..frames.capacity() {
            frames.push(allocate_frame().unwrap()).unwrap();
        }

        for i in 1..frames.len() {
            assert_ne!(frames[i - 1].start_address(), frames[i].start_address());
        }

        for frame in frames.iter() {
            deallocate_frame(*frame);
        }
    }

    #[test_case]
    fn conservation() {
        let free_before = free_frames();
        let mapped_before = mapped_frames();

        let frame = allocate_frame().unwrap();
        assert_eq!(mapped_frames(), mapped_before + 1);
        deallocate_frame(frame);

        assert_eq!(free_frames(), free_before);
        assert_eq!(mapped_frames(), mapped_before);
    }

    #[test_case]
    fn contiguous_is_contiguous() {
        let frame = allocate_contiguous(8, 4, PhysAddr::from(usize::MAX)).unwrap();
        assert!(frame.start_address().is_aligned_to(4 * PAGE_SIZE));

        let end = Frame::containing_address(frame.start_address() + 8 * PAGE_SIZE);
        let mut expected = frame.start_address();
        for frame in Frame::iter_frames(frame, end) {
            assert_eq!(frame.start_address(), expected);
            expected += PAGE_SIZE;
        }
        deallocate_contiguous(frame, 8);
    }

    #[test_case]
    fn free_list_is_consistent() {
        let allocator = FRAME_ALLOCATOR.lock();
        assert_eq!(allocator.free_frames(), allocator.count_frames_expensive());
    }
}
