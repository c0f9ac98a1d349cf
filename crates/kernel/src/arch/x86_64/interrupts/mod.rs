pub mod apic;
pub mod handlers;
pub mod idt;

use core::arch::global_asm;
use core::fmt::Display;

use crate::VirtAddr;
use crate::arch::x86_64::gdt;
use crate::arch::x86_64::registers::RFlags;

global_asm!(include_str!("./trap.asm"));

unsafe extern "C" {
    /// 256 vector stub entry points, indexed by vector number.
    pub static trap_vector_table: [usize; 256];

    /// Enters the context described by `frame`. The frame memory must stay
    /// valid until the final `iretq` retires.
    pub fn trap_frame_restore(frame: *const TrapFrame) -> !;
}

/// The register image saved by the common trap entry, enough to resume any
/// user- or kernel-mode thread. Field order mirrors the push sequence in
/// `trap.asm`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// A frame that enters kernel code at `entry` on `stack_end` with
    /// interrupts enabled.
    pub fn new_kernel(entry: VirtAddr, stack_end: VirtAddr) -> Self {
        Self {
            rip: entry.into_raw() as u64,
            rsp: stack_end.into_raw() as u64,
            cs: gdt::KERNEL_CODE_SEG as u64,
            ss: gdt::KERNEL_DATA_SEG as u64,
            rflags: RFlags::INTERRUPT_FLAG.bits() | RFlags::ALWAYS_SET,
            ..Default::default()
        }
    }

    /// A frame that enters ring 3 at `entry` on `stack_end`.
    pub fn new_user(entry: VirtAddr, stack_end: VirtAddr) -> Self {
        Self {
            rip: entry.into_raw() as u64,
            rsp: stack_end.into_raw() as u64,
            cs: gdt::USER_CODE_SEG as u64,
            ss: gdt::USER_DATA_SEG as u64,
            rflags: RFlags::INTERRUPT_FLAG.bits() | RFlags::ALWAYS_SET,
            ..Default::default()
        }
    }

    #[inline(always)]
    pub const fn is_user(&self) -> bool {
        self.cs & 0b11 == 0b11
    }
}

impl Display for TrapFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(
            f,
            "vector {:#x} error {:#x}",
            self.vector, self.error_code
        )?;
        writeln!(
            f,
            "rip {:#018x} cs {:#06x} ss {:#06x} rflags {:#x}",
            self.rip, self.cs, self.ss, self.rflags
        )?;
        writeln!(
            f,
            "rsp {:#018x} rbp {:#018x}",
            self.rsp, self.rbp
        )?;
        writeln!(
            f,
            "rax {:#018x} rbx {:#018x} rcx {:#018x} rdx {:#018x}",
            self.rax, self.rbx, self.rcx, self.rdx
        )?;
        writeln!(
            f,
            "rsi {:#018x} rdi {:#018x} r8  {:#018x} r9  {:#018x}",
            self.rsi, self.rdi, self.r8, self.r9
        )?;
        write!(
            f,
            "r10 {:#018x} r11 {:#018x} r12 {:#018x} r13 {:#018x}",
            self.r10, self.r11, self.r12, self.r13
        )
    }
}

pub fn init_idt() {
    handlers::load_idt();
}

/// Raises `vector` on the calling CPU, synchronously, flowing through the
/// common trap path. Only works for the software vectors.
#[macro_export]
macro_rules! raise_vector {
    ($vector:expr) => {
        unsafe { core::arch::asm!("int {v}", v = const $vector) }
    };
}
