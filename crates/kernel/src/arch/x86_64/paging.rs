use bitflags::bitflags;
use core::arch::asm;
use core::cell::SyncUnsafeCell;
use core::fmt::Debug;
use core::ops::{Index, IndexMut};

use crate::VirtAddr;
use crate::memory::paging::{EntryFlags, MapToError};
use crate::{
    PhysAddr,
    memory::frame_allocator::{self, Frame, FramePtr},
};

pub const ENTRY_COUNT: usize = 512;
pub const HIGHER_HALF_ENTRY: usize = 256;

const fn p4_index(addr: usize) -> usize {
    (addr >> 39) & 0x1FF
}
const fn p3_index(addr: usize) -> usize {
    (addr >> 30) & 0x1FF
}
const fn p2_index(addr: usize) -> usize {
    (addr >> 21) & 0x1FF
}
const fn p1_index(addr: usize) -> usize {
    (addr >> 12) & 0x1FF
}

const fn translate(addr: VirtAddr) -> (usize, usize, usize, usize) {
    let addr = addr.into_raw();
    (
        p1_index(addr),
        p2_index(addr),
        p3_index(addr),
        p4_index(addr),
    )
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ArchEntryFlags: u64 {
        const PRESENT         = 1;
        const WRITABLE        = 1 << 1;
        const USER_ACCESSIBLE = 1 << 2;
        const PWT             = 1 << 3;
        const PCD             = 1 << 4;
        const ACCESSED        = 1 << 5;
        const DIRTY           = 1 << 6;
        const HUGE_PAGE       = 1 << 7;
        const GLOBAL          = 1 << 8;
        /// Software bit: the mapped frame belongs to this entry and goes
        /// back to the frame allocator when the entry dies.
        const OWNED           = 1 << 9;
        const NO_EXECUTE      = 1 << 63;
    }
}

impl ArchEntryFlags {
    /// Flags used for the non-leaf levels of the walk; kept permissive so
    /// the leaf entry alone decides the effective permissions.
    const fn intermediate() -> Self {
        Self::PRESENT
            .union(Self::WRITABLE)
            .union(Self::USER_ACCESSIBLE)
    }
}

impl From<EntryFlags> for ArchEntryFlags {
    fn from(value: EntryFlags) -> Self {
        let mut this = ArchEntryFlags::PRESENT;
        if value.contains(EntryFlags::WRITE) {
            this |= ArchEntryFlags::WRITABLE;
        }
        if value.contains(EntryFlags::USER_ACCESSIBLE) {
            this |= ArchEntryFlags::USER_ACCESSIBLE;
        }
        if value.contains(EntryFlags::DISABLE_EXEC) {
            this |= ArchEntryFlags::NO_EXECUTE;
        }
        if value.contains(EntryFlags::DEVICE_UNCACHEABLE) {
            this |= ArchEntryFlags::PCD;
        }
        if value.contains(EntryFlags::GLOBAL) {
            this |= ArchEntryFlags::GLOBAL;
        }
        if value.contains(EntryFlags::OWNED) {
            this |= ArchEntryFlags::OWNED;
        }
        this
    }
}

/// A page table's entry
#[derive(Clone)]
#[repr(transparent)]
pub struct Entry(u64);

impl Debug for Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Entry")
            .field(&format_args!("{:#x}", self.0))
            .field(&self.flags())
            .finish()
    }
}

const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

impl Entry {
    const fn new(flags: ArchEntryFlags, addr: PhysAddr) -> Self {
        Self(addr.into_raw() as u64 | flags.bits())
    }

    pub fn frame(&self) -> Option<Frame> {
        if self.flags().contains(ArchEntryFlags::PRESENT) {
            Some(Frame::containing_address(PhysAddr::from(
                (self.0 & ENTRY_ADDR_MASK) as usize,
            )))
        } else {
            None
        }
    }

    pub fn flags(&self) -> ArchEntryFlags {
        ArchEntryFlags::from_bits_truncate(self.0)
    }

    const fn set(&mut self, flags: ArchEntryFlags, addr: PhysAddr) {
        *self = Self::new(flags, addr);
    }

    const fn clear(&mut self) {
        self.0 = 0;
    }

    const fn is_unused(&self) -> bool {
        self.0 == 0
    }

    /// Frees whatever the entry points at. On non-leaf levels the frame is a
    /// page table and is freed recursively first.
    /// # Safety
    /// the caller must ensure that the entry is not used anymore
    unsafe fn free(&mut self, level: u8) {
        unsafe {
            let Some(frame) = self.frame() else { return };

            if level != 0 {
                let table = &mut *frame.virt_addr().into_ptr::<PageTable>();
                table.free(level);
                frame_allocator::deallocate_frame(frame);
            } else if self.flags().contains(ArchEntryFlags::OWNED) {
                frame_allocator::deallocate_frame(frame);
            }
            self.clear();
        }
    }

    /// Returns the next-level table, creating it when absent.
    fn walk_create(&mut self) -> Result<&'static mut PageTable, MapToError> {
        if let Some(frame) = self.frame() {
            Ok(unsafe { &mut *frame.virt_addr().into_ptr::<PageTable>() })
        } else {
            let frame =
                frame_allocator::allocate_frame().ok_or(MapToError::FrameAllocationFailed)?;
            self.set(ArchEntryFlags::intermediate(), frame.start_address());

            let table = frame.virt_addr().into_ptr::<PageTable>();
            Ok(unsafe {
                (*table).zeroize();
                &mut *table
            })
        }
    }

    /// Returns the table (or frame reinterpreted as one) this entry maps.
    fn mapped_to(&self) -> Option<&'static mut PageTable> {
        self.frame()
            .map(|frame| unsafe { &mut *frame.virt_addr().into_ptr::<PageTable>() })
    }
}

#[derive(Debug)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [Entry; ENTRY_COUNT],
}

impl PageTable {
    pub fn zeroize(&mut self) {
        self.entries.fill(const { Entry(0) });
    }

    /// Copies the higher-half entries of `source` into this table, aliasing
    /// the same lower-level tables.
    pub fn copy_higher_half(&mut self, source: &PageTable) {
        self.entries[HIGHER_HALF_ENTRY..ENTRY_COUNT]
            .clone_from_slice(&source.entries[HIGHER_HALF_ENTRY..ENTRY_COUNT]);
    }

    /// Ensures every higher-half L4 slot points at an allocated L3 table, so
    /// later kernel mappings become visible in every address space that
    /// aliased these entries.
    pub fn populate_higher_half(&mut self) -> Result<(), MapToError> {
        for entry in &mut self.entries[HIGHER_HALF_ENTRY..ENTRY_COUNT] {
            if entry.is_unused() {
                entry.walk_create()?;
            }
        }
        Ok(())
    }

    /// Frees the table's entries. `level` is 4 for a root; the higher half
    /// of a root is shared and left alone.
    /// # Safety
    /// the table must not be loaded on any CPU anymore
    pub unsafe fn free(&mut self, level: u8) {
        unsafe {
            let last_entry = if level >= 4 {
                HIGHER_HALF_ENTRY
            } else {
                ENTRY_COUNT
            };

            for entry in &mut self.entries[0..last_entry] {
                if !entry.is_unused() {
                    entry.free(level - 1);
                }
            }
        }
    }

    /// Maps `page` to `frame` without flushing the TLB.
    pub unsafe fn map_to_uncached(
        &mut self,
        page: crate::memory::paging::Page,
        frame: Frame,
        flags: EntryFlags,
    ) -> Result<(), MapToError> {
        let (i1, i2, i3, i4) = translate(page.virt_addr());

        let l3 = self[i4].walk_create()?;
        let l2 = l3[i3].walk_create()?;
        let l1 = l2[i2].walk_create()?;

        let entry = &mut l1[i1];
        if entry.frame().is_some() {
            return Err(MapToError::AlreadyMapped);
        }

        *entry = Entry::new(flags.into(), frame.start_address());
        Ok(())
    }

    fn get_entry(&self, page: crate::memory::paging::Page) -> Option<&mut Entry> {
        let (i1, i2, i3, i4) = translate(page.virt_addr());
        let l3 = self[i4].mapped_to()?;
        let l2 = l3[i3].mapped_to()?;
        let l1 = l2[i2].mapped_to()?;
        Some(&mut l1[i1])
    }

    /// The frame `page` maps to, if present.
    pub fn get_frame(&self, page: crate::memory::paging::Page) -> Option<Frame> {
        self.get_entry(page).and_then(|entry| entry.frame())
    }

    /// Unmaps `page` without flushing the TLB, returning the frame to the
    /// allocator iff the entry owned it.
    pub unsafe fn unmap_uncached(&mut self, page: crate::memory::paging::Page) {
        if let Some(entry) = self.get_entry(page) {
            unsafe { entry.free(0) };
        }
    }

    /// Rewrites the flags of a present `page`, preserving ownership.
    pub unsafe fn change_flags_uncached(
        &mut self,
        page: crate::memory::paging::Page,
        flags: EntryFlags,
    ) -> Result<(), MapToError> {
        let entry = self
            .get_entry(page)
            .filter(|entry| entry.frame().is_some())
            .ok_or(MapToError::NotMapped)?;

        let owned = entry.flags().contains(ArchEntryFlags::OWNED);
        let mut arch: ArchEntryFlags = flags.into();
        if owned {
            arch |= ArchEntryFlags::OWNED;
        } else {
            arch.remove(ArchEntryFlags::OWNED);
        }
        let frame = entry.frame().unwrap();
        entry.set(arch, frame.start_address());
        Ok(())
    }
}

impl Index<usize> for PageTable {
    type Output = Entry;
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// Physical address of the kernel root table, shared into the higher half
/// of every process root. Valid once `crate::memory::init` ran.
pub static KERNEL_ROOT_TABLE: SyncUnsafeCell<PhysAddr> = SyncUnsafeCell::new(PhysAddr::null());

/// returns the currently loaded root table (from cr3)
pub unsafe fn current_root_table_ptr() -> FramePtr<PageTable> {
    let phys_addr: usize;
    unsafe {
        asm!("mov {}, cr3", out(reg) phys_addr);
    }

    let frame = Frame::containing_address(PhysAddr::from(phys_addr));
    unsafe { frame.into_ptr() }
}

pub unsafe fn set_current_root_table(phys_addr: PhysAddr) {
    unsafe {
        asm!("mov cr3, {}", in(reg) phys_addr.into_raw());
    }
}

/// Kernel root table alias; every higher-half mapping goes through this.
pub unsafe fn kernel_root_table() -> FramePtr<PageTable> {
    let phys = unsafe { *KERNEL_ROOT_TABLE.get() };
    debug_assert!(!phys.is_null());
    unsafe { Frame::containing_address(phys).into_ptr() }
}

#[inline(always)]
pub fn invalidate(addr: VirtAddr) {
    unsafe {
        asm!("invlpg [{}]", in(reg) addr.into_raw(), options(nostack));
    }
}

/// Reloads cr3, flushing every non-global TLB entry.
pub fn flush_all() {
    unsafe {
        let current = current_root_table_ptr().phys_addr();
        set_current_root_table(current);
    }
}
