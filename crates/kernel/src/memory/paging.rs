pub const PAGE_SIZE: usize = 4096;

use crate::arch::paging::{self, ArchEntryFlags, PageTable};
use crate::memory::PhysAddr;
use bitflags::bitflags;
use core::{
    fmt::{Debug, LowerHex},
    ops::{Deref, DerefMut},
};
use thiserror::Error;

use super::{
    VirtAddr, align_down,
    frame_allocator::{self, Frame, FramePtr},
};

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Page {
    start_address: VirtAddr,
}

impl Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Page({:#x})", self.start_address)
    }
}

impl LowerHex for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.start_address)
    }
}

impl Page {
    pub const fn containing_address(address: VirtAddr) -> Self {
        Self {
            start_address: VirtAddr::from(align_down(address.into_raw(), PAGE_SIZE)),
        }
    }

    pub const fn virt_addr(&self) -> VirtAddr {
        self.start_address
    }

    /// requires that `start` is not above `end`
    pub fn iter_pages(start: Page, end: Page) -> IterPage {
        assert!(start.start_address <= end.start_address);
        IterPage { start, end }
    }

    /// Iterator over the `count` pages starting at the one containing `addr`.
    pub fn range(addr: VirtAddr, count: usize) -> IterPage {
        let start = Page::containing_address(addr);
        let end = Page::containing_address(VirtAddr::from(
            start.virt_addr().into_raw() + count * PAGE_SIZE,
        ));
        Self::iter_pages(start, end)
    }
}

#[derive(Debug, Clone)]
pub struct IterPage {
    start: Page,
    end: Page,
}

impl Iterator for IterPage {
    type Item = Page;
    fn next(&mut self) -> Option<Self::Item> {
        if self.start.start_address < self.end.start_address {
            let page = self.start;
            self.start.start_address += PAGE_SIZE;
            Some(page)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum MapToError {
    #[error("frame allocator: out of memory")]
    FrameAllocationFailed,
    #[error("the page was already mapped")]
    AlreadyMapped,
    #[error("the page is not mapped")]
    NotMapped,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        const WRITE = 1;
        const USER_ACCESSIBLE = 1 << 1;
        const DISABLE_EXEC = 1 << 2;
        const DEVICE_UNCACHEABLE = 1 << 3;
        const GLOBAL = 1 << 4;
        /// The mapped frame is freed back to the allocator on unmap.
        const OWNED = 1 << 5;
    }
}

impl PageTable {
    /// Map `page_num` pages starting at `start_virt_addr` to frames starting
    /// at `start_phys_addr`. The frames stay borrowed unless `flags` carries
    /// [`EntryFlags::OWNED`]. TLB invalidation is the caller's business if
    /// this table is loaded.
    pub unsafe fn map_contiguous_pages(
        &mut self,
        start_virt_addr: VirtAddr,
        start_phys_addr: PhysAddr,
        page_num: usize,
        flags: EntryFlags,
    ) -> Result<(), MapToError> {
        let size = page_num * PAGE_SIZE;
        let start_page = Page::containing_address(start_virt_addr);
        let end_page = Page::containing_address(start_virt_addr + size);
        let start_frame = Frame::containing_address(start_phys_addr);
        let end_frame = Frame::containing_address(start_phys_addr + size);

        let pages = Page::iter_pages(start_page, end_page);
        let frames = Frame::iter_frames(start_frame, end_frame);
        for (page, frame) in pages.zip(frames) {
            unsafe {
                self.map_to_uncached(page, frame, flags)?;
            }
        }
        Ok(())
    }

    /// Maps `[from, to)` to freshly allocated, zeroed, owned frames.
    pub fn alloc_map(
        &mut self,
        from: VirtAddr,
        to: VirtAddr,
        flags: EntryFlags,
    ) -> Result<(), MapToError> {
        let iter = Page::iter_pages(Page::containing_address(from), Page::containing_address(to));

        for page in iter {
            let frame =
                frame_allocator::allocate_frame().ok_or(MapToError::FrameAllocationFailed)?;
            unsafe {
                core::ptr::write_bytes(frame.virt_addr().into_ptr::<u8>(), 0, PAGE_SIZE);
                self.map_to_uncached(page, frame, flags | EntryFlags::OWNED)?;
            }
        }
        Ok(())
    }

    /// Unmaps `pages` pages starting at `addr`, freeing owned frames and
    /// invalidating each page.
    pub unsafe fn unmap_range(&mut self, addr: VirtAddr, pages: usize) {
        for page in Page::range(addr, pages) {
            unsafe { self.unmap_uncached(page) };
            paging::invalidate(page.virt_addr());
        }
    }

    /// Rewrites the flags of `pages` mapped pages starting at `addr`,
    /// preserving frame ownership. Fails if any page is absent.
    pub unsafe fn change_flags_range(
        &mut self,
        addr: VirtAddr,
        pages: usize,
        flags: EntryFlags,
    ) -> Result<(), MapToError> {
        for page in Page::range(addr, pages) {
            unsafe { self.change_flags_uncached(page, flags)? };
            paging::invalidate(page.virt_addr());
        }
        Ok(())
    }

    /// The physical address `addr` translates to, if mapped.
    pub fn phys_addr(&self, addr: VirtAddr) -> Option<PhysAddr> {
        let page = Page::containing_address(addr);
        let frame = self.get_frame(page)?;
        Some(frame.start_address() + (addr.into_raw() - page.virt_addr().into_raw()))
    }

    /// Whether the whole range is mapped.
    pub fn mapped(&self, addr: VirtAddr, pages: usize) -> bool {
        Page::range(addr, pages).all(|page| self.get_frame(page).is_some())
    }

    /// Whether the whole range is unmapped.
    pub fn unmapped(&self, addr: VirtAddr, pages: usize) -> bool {
        Page::range(addr, pages).all(|page| self.get_frame(page).is_none())
    }
}

/// returns the currently loaded root table
/// # Safety
/// aliases whatever cr3 points at; the caller must not let it outlive a
/// table switch
pub unsafe fn current_root_table() -> FramePtr<PageTable> {
    unsafe { paging::current_root_table_ptr() }
}

/// A wrapper around a physically allocated root page table. Dropping it
/// frees the whole lower half, so be careful with it.
#[derive(Debug)]
pub struct PhysPageTable {
    inner: FramePtr<PageTable>,
}

impl Deref for PhysPageTable {
    type Target = PageTable;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for PhysPageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl PhysPageTable {
    /// Allocates a fresh root sharing the kernel's higher half.
    pub fn create() -> Result<Self, MapToError> {
        let frame = frame_allocator::allocate_frame().ok_or(MapToError::FrameAllocationFailed)?;
        let mut table: FramePtr<PageTable> = unsafe { frame.into_ptr() };

        table.zeroize();
        table.copy_higher_half(unsafe { &paging::kernel_root_table() });

        Ok(Self { inner: table })
    }

    /// Takes ownership of the currently loaded root table.
    /// # Safety
    /// The table must not be owned by anything else.
    pub unsafe fn from_current() -> Self {
        Self {
            inner: unsafe { current_root_table() },
        }
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.inner.phys_addr()
    }

    /// Loads this table into cr3.
    /// # Safety
    /// `self` must stay alive as long as it is loaded anywhere.
    pub unsafe fn load(&self) {
        unsafe { paging::set_current_root_table(self.phys_addr()) }
    }
}

impl Drop for PhysPageTable {
    fn drop(&mut self) {
        unsafe {
            self.free(4);
            frame_allocator::deallocate_frame(self.inner.frame());
        }
    }
}

unsafe impl Send for PhysPageTable {}

/// Builds the kernel root table and switches to it.
///
/// The root frame is kept below 4 GiB (the AP trampoline loads cr3 as a
/// dword), the bootloader's higher half is aliased in, and every remaining
/// higher-half L4 slot gets a backing L3 table so that kernel mappings made
/// later are visible through every process root that shares these entries.
pub fn init_kernel_root() {
    let frame = frame_allocator::allocate_contiguous(1, 1, PhysAddr::from(u32::MAX as usize))
        .expect("no frame below 4 GiB for the kernel root table");
    let mut table: FramePtr<PageTable> = unsafe { frame.into_ptr() };

    table.zeroize();
    table.copy_higher_half(unsafe { &current_root_table() });
    table
        .populate_higher_half()
        .expect("failed to populate the kernel higher half");

    unsafe {
        *paging::KERNEL_ROOT_TABLE.get() = frame.start_address();
        paging::set_current_root_table(frame.start_address());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame_allocator;

    // somewhere far away in the lower half, unused by anything else
    const TEST_VA: VirtAddr = VirtAddr::from(0x0000_5500_0000_0000);

    #[test_case]
    fn map_round_trip() {
        let mut table = unsafe { current_root_table() };
        let frame = frame_allocator::allocate_frame().unwrap();

        unsafe {
            table
                .map_contiguous_pages(TEST_VA, frame.start_address(), 1, EntryFlags::WRITE)
                .unwrap();
        }
        paging::invalidate(TEST_VA);

        assert!(table.mapped(TEST_VA, 1));
        assert!(!table.unmapped(TEST_VA, 1));
        assert_eq!(table.phys_addr(TEST_VA), Some(frame.start_address()));
        assert_eq!(
            table.phys_addr(TEST_VA + 123usize),
            Some(frame.start_address() + 123usize)
        );

        unsafe { table.unmap_range(TEST_VA, 1) };
        assert!(table.unmapped(TEST_VA, 1));
        assert_eq!(table.phys_addr(TEST_VA), None);

        // the mapping was borrowed, the frame is still ours to free
        frame_allocator::deallocate_frame(frame);
    }

    #[test_case]
    fn owned_frames_return_to_the_allocator() {
        let mut table = unsafe { current_root_table() };
        let mapped_before = frame_allocator::mapped_frames();

        table
            .alloc_map(TEST_VA, TEST_VA + 4 * PAGE_SIZE, EntryFlags::WRITE)
            .unwrap();
        for page in Page::range(TEST_VA, 4) {
            paging::invalidate(page.virt_addr());
        }
        assert!(table.mapped(TEST_VA, 4));
        assert!(frame_allocator::mapped_frames() >= mapped_before + 4);

        unsafe { table.unmap_range(TEST_VA, 4) };
        assert!(table.unmapped(TEST_VA, 4));
        // intermediate tables may keep a few frames, the leaves came back
        assert!(frame_allocator::mapped_frames() <= mapped_before + 3);
    }

    #[test_case]
    fn change_flags_preserves_ownership() {
        let mut table = unsafe { current_root_table() };
        let mapped_before = frame_allocator::mapped_frames();

        table
            .alloc_map(TEST_VA, TEST_VA + PAGE_SIZE, EntryFlags::WRITE)
            .unwrap();
        unsafe {
            table
                .change_flags_range(TEST_VA, 1, EntryFlags::empty())
                .unwrap();
            table.unmap_range(TEST_VA, 1);
        }

        assert!(frame_allocator::mapped_frames() <= mapped_before);

        // absent pages fail
        assert_eq!(
            unsafe { table.change_flags_range(TEST_VA, 1, EntryFlags::WRITE) },
            Err(MapToError::NotMapped)
        );
    }
}
