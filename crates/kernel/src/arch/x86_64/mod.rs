pub mod acpi;
pub mod gdt;
pub mod hpet;
pub mod interrupts;
pub mod paging;
pub mod power;
pub mod registers;
pub mod serial;
pub mod trampoline;

use core::arch::asm;

#[inline(always)]
pub fn inb(port: u16) -> u8 {
    let value: u8;
    unsafe {
        asm!("in al, dx", out("al") value, in("dx") port, options(nostack, preserves_flags));
    }
    value
}

#[inline(always)]
pub fn outb(port: u16, value: u8) {
    unsafe {
        asm!("out dx, al", in("dx") port, in("al") value, options(nostack, preserves_flags));
    }
}

/// # Safety
/// sleeps the CPU until the next interrupt, the caller must make sure that
/// is acceptable
#[inline(always)]
pub unsafe fn hlt() {
    unsafe { asm!("hlt", options(nostack, preserves_flags)) }
}

#[inline(always)]
pub unsafe fn enable_interrupts() {
    unsafe { asm!("sti", options(nostack, preserves_flags)) }
}

#[inline(always)]
pub unsafe fn disable_interrupts() {
    unsafe { asm!("cli", options(nostack, preserves_flags)) }
}

#[inline(always)]
pub fn interrupts_enabled() -> bool {
    registers::RFlags::read().contains(registers::RFlags::INTERRUPT_FLAG)
}

/// Early per-CPU bring-up shared by the BSP and the APs: segments, traps,
/// SIMD state saving, and the per-CPU id MSR.
pub fn init_cpu(cpu_id: usize) -> *mut gdt::TaskStateSegment {
    let tss = gdt::init_gdt();
    interrupts::init_idt();

    unsafe {
        let mut cr4: u64;
        asm!("mov {}, cr4", out(reg) cr4);
        // OSFXSR | OSXMMEXCPT for fxsave'd thread SIMD state, PGE for the
        // global higher half
        cr4 |= (1 << 9) | (1 << 10) | (1 << 7);
        asm!("mov cr4, {}", in(reg) cr4);

        registers::wrmsr(registers::IA32_TSC_AUX, cpu_id as u64);
    }
    tss
}

pub fn print_stack_trace() {
    crate::serial!("{}", registers::StackTrace::current());
}

/// Maps the MMIO the kernel touches (HPET, local APIC) through the direct
/// map; device registers are not part of the firmware memory map, the HHDM
/// alone does not cover them.
pub fn map_device_mmio() {
    use crate::memory::paging::EntryFlags;

    let lapic_base = crate::PhysAddr::from(
        (registers::rdmsr(registers::IA32_APIC_BASE) & 0x000F_FFFF_F000) as usize,
    );

    let mut table = unsafe { paging::kernel_root_table() };
    for phys in [*acpi::HPET_BASE, lapic_base] {
        let result = unsafe {
            table.map_contiguous_pages(
                phys.into_virt(),
                phys,
                1,
                EntryFlags::WRITE | EntryFlags::DEVICE_UNCACHEABLE | EntryFlags::GLOBAL,
            )
        };
        match result {
            // some bootloaders already alias the region
            Ok(()) | Err(crate::memory::paging::MapToError::AlreadyMapped) => {}
            Err(err) => panic!("failed to map device registers: {err}"),
        }
        paging::invalidate(phys.into_virt());
    }
}
