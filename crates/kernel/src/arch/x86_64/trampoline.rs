//! Copies the real-mode startup blob into low memory, patches its slots and
//! rolls everything back once the APs are up.

use core::arch::global_asm;

use crate::memory::paging::{EntryFlags, PAGE_SIZE};
use crate::memory::{PhysAddr, VirtAddr};

global_asm!(include_str!("./trampoline.asm"));

unsafe extern "C" {
    static trampoline_start: u8;
    static trampoline_end: u8;
    static trampoline_cr3_slot: u8;
    static trampoline_stack_slot: u8;
    static trampoline_entry_slot: u8;
    static trampoline_cpu_id_slot: u8;
}

/// Where the blob runs; SIPI vector 8 starts execution at this page.
pub const TRAMPOLINE_PHYS: PhysAddr = PhysAddr::from(0x8000);
pub const TRAMPOLINE_PAGE: u8 = 0x8;

fn blob() -> &'static [u8] {
    unsafe {
        let start = &trampoline_start as *const u8;
        let end = &trampoline_end as *const u8;
        core::slice::from_raw_parts(start, end as usize - start as usize)
    }
}

fn slot_offset(slot: &'static u8) -> usize {
    slot as *const u8 as usize - unsafe { &trampoline_start as *const u8 as usize }
}

/// Owns the low-memory page while APs boot; restores the original bytes and
/// the identity mapping on [`Self::cleanup`].
pub struct Trampoline {
    saved: [u8; PAGE_SIZE],
}

impl Trampoline {
    /// # Safety
    /// Only during single-threaded bring-up; the page may belong to the
    /// frame allocator's pool.
    pub unsafe fn setup() -> Self {
        let blob = blob();
        assert!(blob.len() <= PAGE_SIZE, "trampoline outgrew its page");

        let low = TRAMPOLINE_PHYS.into_virt().into_ptr::<u8>();
        let mut saved = [0u8; PAGE_SIZE];
        unsafe {
            core::ptr::copy_nonoverlapping(low, saved.as_mut_ptr(), PAGE_SIZE);
            core::ptr::copy_nonoverlapping(blob.as_ptr(), low, blob.len());
        }

        // the AP enables paging while still executing at 0x8000
        let mut table = unsafe { crate::arch::paging::kernel_root_table() };
        unsafe {
            table
                .map_contiguous_pages(
                    VirtAddr::from(TRAMPOLINE_PHYS.into_raw()),
                    TRAMPOLINE_PHYS,
                    1,
                    EntryFlags::WRITE,
                )
                .expect("failed to identity map the trampoline page");
        }

        let mut this = Self { saved };
        this.patch_u64(
            slot_offset(unsafe { &trampoline_cr3_slot }),
            unsafe { *crate::arch::paging::KERNEL_ROOT_TABLE.get() }.into_raw() as u64,
        );
        this
    }

    fn patch_u64(&mut self, offset: usize, value: u64) {
        unsafe {
            (TRAMPOLINE_PHYS.into_virt() + offset)
                .into_ptr::<u64>()
                .write_volatile(value);
        }
    }

    /// Points the blob at one AP's stack, entry and id before its SIPI.
    pub fn set_target(&mut self, cpu_id: usize, stack_end: VirtAddr, entry: extern "C" fn(usize) -> !) {
        self.patch_u64(
            slot_offset(unsafe { &trampoline_stack_slot }),
            stack_end.into_raw() as u64,
        );
        self.patch_u64(
            slot_offset(unsafe { &trampoline_entry_slot }),
            entry as usize as u64,
        );
        self.patch_u64(
            slot_offset(unsafe { &trampoline_cpu_id_slot }),
            cpu_id as u64,
        );
    }

    /// Restores the page contents and drops the identity mapping.
    pub fn cleanup(self) {
        let low = TRAMPOLINE_PHYS.into_virt().into_ptr::<u8>();
        unsafe {
            core::ptr::copy_nonoverlapping(self.saved.as_ptr(), low, PAGE_SIZE);

            let mut table = crate::arch::paging::kernel_root_table();
            table.unmap_range(VirtAddr::from(TRAMPOLINE_PHYS.into_raw()), 1);
        }
    }
}
