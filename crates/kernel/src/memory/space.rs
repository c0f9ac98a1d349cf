//! Per-process address spaces.

use cairn_abi::errors::{Errno, SysResult};
use cairn_abi::io::Prot;

use crate::memory::paging::{EntryFlags, MapToError, PAGE_SIZE, PhysPageTable};
use crate::memory::{PhysAddr, USER_TOP, VirtAddr, align_up};
use crate::utils::locks::Mutex;

/// Where cursor-chosen mappings start growing from.
const MMAP_BASE: usize = 0x0000_2000_0000_0000;

/// A root page table plus a bump cursor handing out fresh lower-half
/// regions. The cursor only ever grows; a process that burns through the
/// whole lower half is a kernel bug, not a recoverable error.
#[derive(Debug)]
pub struct AddressSpace {
    table: Mutex<PhysPageTable>,
    /// cached so the scheduler can load cr3 without taking `table`
    root_phys: PhysAddr,
    free_hint: Mutex<VirtAddr>,
}

impl AddressSpace {
    pub fn new() -> Result<Self, MapToError> {
        let table = PhysPageTable::create()?;
        let root_phys = table.phys_addr();
        Ok(Self {
            table: Mutex::new(table),
            root_phys,
            free_hint: Mutex::new(VirtAddr::from(MMAP_BASE)),
        })
    }

    /// Wraps the boot page table for the kernel process.
    /// # Safety
    /// must be called exactly once, with the boot table loaded
    pub unsafe fn from_current() -> Self {
        let table = unsafe { PhysPageTable::from_current() };
        let root_phys = table.phys_addr();
        Self {
            table: Mutex::new(table),
            root_phys,
            free_hint: Mutex::new(VirtAddr::from(MMAP_BASE)),
        }
    }

    #[inline]
    pub fn root_phys(&self) -> PhysAddr {
        self.root_phys
    }

    /// Loads this space onto the current CPU.
    pub fn load(&self) {
        unsafe { crate::arch::paging::set_current_root_table(self.root_phys) }
    }

    pub fn with_table<R>(&self, f: impl FnOnce(&mut PhysPageTable) -> R) -> R {
        f(&mut self.table.lock())
    }

    fn user_flags(prot: Prot) -> EntryFlags {
        let mut flags = EntryFlags::USER_ACCESSIBLE;
        if prot.contains(Prot::WRITE) {
            flags |= EntryFlags::WRITE;
        }
        if !prot.contains(Prot::EXEC) {
            flags |= EntryFlags::DISABLE_EXEC;
        }
        flags
    }

    fn check_user_range(addr: VirtAddr, len: usize) -> SysResult<usize> {
        let pages = align_up(len.max(1), PAGE_SIZE) / PAGE_SIZE;
        if !addr.is_aligned_to(PAGE_SIZE) {
            return Err(Errno::EINVAL);
        }
        let end = addr
            .into_raw()
            .checked_add(pages * PAGE_SIZE)
            .ok_or(Errno::EINVAL)?;
        if end > USER_TOP {
            return Err(Errno::EFAULT);
        }
        Ok(pages)
    }

    /// Maps `len` bytes of fresh zeroed memory. `addr` null lets the cursor
    /// pick the region; a chosen `addr` must be page aligned and free.
    pub fn mmap(&self, addr: VirtAddr, len: usize, prot: Prot) -> SysResult<VirtAddr> {
        let at = if addr.is_null() {
            let mut hint = self.free_hint.lock();
            let at = hint.align_up(PAGE_SIZE);
            let pages = Self::check_user_range(at, len)?;
            let next = at + pages * PAGE_SIZE;
            assert!(
                next.into_raw() < USER_TOP,
                "address space cursor exhausted"
            );
            *hint = next;
            at
        } else {
            addr
        };

        let pages = Self::check_user_range(at, len)?;
        let mut table = self.table.lock();
        if !table.unmapped(at, pages) {
            return Err(Errno::EEXIST);
        }
        table
            .alloc_map(at, at + pages * PAGE_SIZE, Self::user_flags(prot))
            .map_err(|_| Errno::ENOMEM)?;
        Ok(at)
    }

    /// Maps `count` borrowed frames starting at `phys` to `addr`, user
    /// accessible. Used to expose kernel-owned objects (I/O rings).
    pub fn map_shared(
        &self,
        addr: VirtAddr,
        phys: PhysAddr,
        count: usize,
    ) -> SysResult<VirtAddr> {
        let at = if addr.is_null() {
            let mut hint = self.free_hint.lock();
            let at = hint.align_up(PAGE_SIZE);
            *hint = at + count * PAGE_SIZE;
            at
        } else {
            addr
        };
        Self::check_user_range(at, count * PAGE_SIZE)?;

        let mut table = self.table.lock();
        if !table.unmapped(at, count) {
            return Err(Errno::EEXIST);
        }
        unsafe {
            table
                .map_contiguous_pages(at, phys, count, EntryFlags::WRITE | EntryFlags::USER_ACCESSIBLE)
                .map_err(|_| Errno::ENOMEM)?;
        }
        Ok(at)
    }

    pub fn munmap(&self, addr: VirtAddr, len: usize) -> SysResult<()> {
        let pages = Self::check_user_range(addr, len)?;
        let mut table = self.table.lock();
        if !table.mapped(addr, pages) {
            return Err(Errno::EFAULT);
        }
        unsafe { table.unmap_range(addr, pages) };
        drop(table);
        crate::smp::tlb_shootdown();
        Ok(())
    }

    pub fn mprotect(&self, addr: VirtAddr, len: usize, prot: Prot) -> SysResult<()> {
        let pages = Self::check_user_range(addr, len)?;
        let mut table = self.table.lock();
        unsafe {
            table
                .change_flags_range(addr, pages, Self::user_flags(prot))
                .map_err(|_| Errno::EFAULT)?;
        }
        drop(table);
        crate::smp::tlb_shootdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn cursor_is_monotonic() {
        let process = crate::sched::current_process();
        let space = process.space();
        let a = space.mmap(VirtAddr::null(), PAGE_SIZE, Prot::READ | Prot::WRITE).unwrap();
        let b = space.mmap(VirtAddr::null(), PAGE_SIZE * 3, Prot::READ | Prot::WRITE).unwrap();
        assert!(b > a);

        space.munmap(a, PAGE_SIZE).unwrap();
        let c = space.mmap(VirtAddr::null(), PAGE_SIZE, Prot::READ).unwrap();
        // freed regions are never reused within a process lifetime
        assert!(c > b);
        space.munmap(b, PAGE_SIZE * 3).unwrap();
        space.munmap(c, PAGE_SIZE).unwrap();
    }
}
