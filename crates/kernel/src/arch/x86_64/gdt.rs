use core::{
    arch::asm,
    cell::SyncUnsafeCell,
    sync::atomic::{AtomicUsize, Ordering},
};

use lazy_static::lazy_static;

use crate::{VirtAddr, config};

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct GdtEntry {
    limit0: u16,
    base0: u16,
    base1: u8,
    access: u8,
    limit1_flags: u8,
    base2: u8,
}

impl GdtEntry {
    const fn default() -> Self {
        Self {
            limit0: 0,
            base0: 0,
            base1: 0,
            access: 0,
            limit1_flags: 0,
            base2: 0,
        }
    }

    const fn new(base: u32, limit: u32, access: u8, flags: u8) -> Self {
        let mut encoded = Self::default();

        encoded.limit0 = (limit & 0xFFFF) as u16;
        encoded.limit1_flags = ((limit >> 16) & 0x0F) as u8;
        encoded.limit1_flags |= flags & 0xF0;

        encoded.base0 = (base & 0xFFFF) as u16;
        encoded.base1 = ((base >> 16) & 0xFF) as u8;
        encoded.base2 = ((base >> 24) & 0xFF) as u8;

        encoded.access = access;
        encoded
    }

    /// the upper half of a 16-byte system descriptor (TSS)
    const fn new_upper_64seg(base: u64) -> Self {
        let mut encoded = Self::default();
        let base = (base >> 32) as u32;

        encoded.limit0 = (base & 0xFFFF) as u16;
        encoded.base0 = ((base >> 16) & 0xFFFF) as u16;
        encoded
    }
}

const ACCESS_WRITE_READ: u8 = 1 << 1;
const ACCESS_EXECUTABLE: u8 = 1 << 3;
const NON_SYSTEM: u8 = 1 << 4;
const ACCESS_DPL0: u8 = 1 << 5;
const ACCESS_DPL1: u8 = 1 << 6;
const ACCESS_VALID: u8 = 1 << 7;
const ACCESS_TYPE_TSS: u8 = 0x9;

const FLAG_LONG: u8 = 1 << 5;
const FLAG_PAGELIMIT: u8 = 1 << 7;

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct TaskStateSegment {
    reserved_1: u32,
    pub privilege_stack_table: [u64; 3],
    reserved_2: u64,
    pub interrupt_stack_table: [u64; 7],
    reserved_3: u64,
    reserved_4: u16,
    pub iomap_base: u16,
}

impl TaskStateSegment {
    pub const fn new() -> Self {
        Self {
            reserved_1: 0,
            privilege_stack_table: [0u64; 3],
            reserved_2: 0,
            interrupt_stack_table: [0u64; 7],
            reserved_3: 0,
            reserved_4: 0,
            iomap_base: 0,
        }
    }
}

/// emergency stack for the double-fault IST slot
const IST_STACK_SIZE: usize = 0x4000;
static IST_STACKS: [SyncUnsafeCell<[u8; IST_STACK_SIZE]>; config::MAX_CPUS] =
    [const { SyncUnsafeCell::new([0; IST_STACK_SIZE]) }; config::MAX_CPUS];

lazy_static! {
    static ref TSS: [SyncUnsafeCell<TaskStateSegment>; config::MAX_CPUS] =
        core::array::from_fn(|n| {
            let mut tss = TaskStateSegment::new();
            tss.interrupt_stack_table[0] =
                IST_STACKS[n].get() as u64 + IST_STACK_SIZE as u64;
            SyncUnsafeCell::new(tss)
        });
}

pub type GdtTable = [GdtEntry; 7];

lazy_static! {
    static ref GDTS: [GdtTable; config::MAX_CPUS] = core::array::from_fn(|index| {
        [
            GdtEntry::default(),
            // kernel code
            GdtEntry::new(
                0,
                0xFFFFF,
                ACCESS_VALID | NON_SYSTEM | ACCESS_WRITE_READ | ACCESS_EXECUTABLE,
                FLAG_PAGELIMIT | FLAG_LONG,
            ),
            // kernel data
            GdtEntry::new(
                0,
                0xFFFFF,
                ACCESS_VALID | ACCESS_WRITE_READ | NON_SYSTEM,
                FLAG_PAGELIMIT | FLAG_LONG,
            ),
            // this CPU's TSS, two slots
            GdtEntry::new(
                ((TSS[index].get() as u64) & 0xFFFFFFFF) as u32,
                (size_of::<TaskStateSegment>() - 1) as u32,
                ACCESS_VALID | ACCESS_TYPE_TSS,
                FLAG_LONG,
            ),
            GdtEntry::new_upper_64seg(TSS[index].get() as u64),
            // user code
            GdtEntry::new(
                0,
                0xFFFFF,
                ACCESS_VALID
                    | NON_SYSTEM
                    | ACCESS_DPL0
                    | ACCESS_DPL1
                    | ACCESS_WRITE_READ
                    | ACCESS_EXECUTABLE,
                FLAG_PAGELIMIT | FLAG_LONG,
            ),
            // user data
            GdtEntry::new(
                0,
                0xFFFFF,
                ACCESS_VALID | NON_SYSTEM | ACCESS_DPL0 | ACCESS_DPL1 | ACCESS_WRITE_READ,
                FLAG_PAGELIMIT | FLAG_LONG,
            ),
        ]
    });
}

pub const KERNEL_CODE_SEG: u16 = 1 * 8;
pub const KERNEL_DATA_SEG: u16 = 2 * 8;
pub const TSS_SEG: u16 = 3 * 8;
pub const USER_CODE_SEG: u16 = (5 * 8) | 3;
pub const USER_DATA_SEG: u16 = (6 * 8) | 3;

#[repr(C, packed)]
struct GdtDescriptor {
    limit: u16,
    base: *const GdtTable,
}

static NEXT_GDT: AtomicUsize = AtomicUsize::new(0);

/// Loads the next free GDT/TSS pair onto the calling CPU.
///
/// Returns the TSS so the scheduler can retarget `rsp0` on context switch;
/// the pointer belongs in the CPU's local state.
#[must_use]
pub fn init_gdt() -> *mut TaskStateSegment {
    let index = NEXT_GDT.fetch_add(1, Ordering::SeqCst);
    assert!(index < config::MAX_CPUS, "more CPUs than GDTs");

    let descriptor = GdtDescriptor {
        limit: (size_of::<GdtTable>() - 1) as u16,
        base: &GDTS[index],
    };

    unsafe {
        asm!("lgdt [{}]", in(reg) &descriptor as *const GdtDescriptor, options(nostack));

        asm!(
            "
            mov ax, {data_seg}
            mov ds, ax
            mov es, ax
            mov ss, ax
            mov fs, ax
            mov gs, ax
            ",
            data_seg = const KERNEL_DATA_SEG,
        );

        asm!(
            "
            push {code_seg}
            lea rax, [rip + 2f]
            push rax
            retfq
            2:
            ",
            code_seg = const KERNEL_CODE_SEG as u64,
            out("rax") _,
        );

        asm!("ltr {0:x}", in(reg) TSS_SEG);
        TSS[index].get()
    }
}

/// Points the TSS's ring-0 stack at `stack_end`; the next trap out of user
/// mode on this CPU lands there.
pub unsafe fn set_tss_rsp0(tss: *mut TaskStateSegment, stack_end: VirtAddr) {
    unsafe {
        (*tss).privilege_stack_table[0] = stack_end.into_raw() as u64;
    }
}
