//! The kernel heap, a [`linked_list_allocator`] over pages mapped into the
//! shared higher half.

use core::alloc::{GlobalAlloc, Layout};

use linked_list_allocator::Heap;

use crate::config;
use crate::memory::paging::{EntryFlags, PAGE_SIZE, Page, current_root_table};
use crate::utils::locks::IrqMutex;

use super::VirtAddr;

/// Virtual base of the kernel heap; inside the higher half shared by every
/// address space.
pub const HEAP_START: VirtAddr = VirtAddr::from(0xFFFF_9000_0000_0000);

struct LockedHeap(IrqMutex<Heap>);

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0
            .lock()
            .allocate_first_fit(layout)
            .map(|ptr| ptr.as_ptr())
            .unwrap_or(core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = core::ptr::NonNull::new(ptr) {
            unsafe { self.0.lock().deallocate(ptr, layout) }
        }
    }
}

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap(IrqMutex::new(Heap::empty()));

/// Maps the initial heap pages and hands them to the allocator. Must run
/// after the kernel root table is live and before the first allocation.
pub fn init() {
    let pages = config::KERNEL_HEAP / PAGE_SIZE;
    let end = HEAP_START + pages * PAGE_SIZE;

    let mut table = unsafe { current_root_table() };
    table
        .alloc_map(HEAP_START, end, EntryFlags::WRITE)
        .expect("failed to map the kernel heap");

    unsafe {
        ALLOCATOR
            .0
            .lock()
            .init(HEAP_START.into_ptr::<u8>(), pages * PAGE_SIZE);
    }

    for page in Page::iter_pages(
        Page::containing_address(HEAP_START),
        Page::containing_address(end),
    ) {
        crate::arch::paging::invalidate(page.virt_addr());
    }
}
