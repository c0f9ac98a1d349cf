use core::arch::asm;
use core::cell::SyncUnsafeCell;

use lazy_static::lazy_static;

use super::idt::{GateDescriptor, IDT_DESCRIPTOR, IdtDescriptor, IdtTable};
use super::{TrapFrame, apic, trap_vector_table};
use crate::arch::x86_64::registers::read_cr2;

/// Scheduling IPI / yield target.
pub const VECTOR_SCHED: u8 = 0x20;
/// Per-CPU APIC timer tick.
pub const VECTOR_TIMER: u8 = 0x21;
/// Raised by a thread to park itself with a saved frame.
pub const VECTOR_WAIT_BLOCK: u8 = 0x22;
/// Panic broadcast, stops the CPU for good.
pub const VECTOR_HALT: u8 = 0x23;
/// Cross-CPU TLB flush request.
pub const VECTOR_TLB_SHOOTDOWN: u8 = 0x24;
/// Kicks a CPU into starting its APIC timer.
pub const VECTOR_START: u8 = 0x25;
pub const VECTOR_SYSCALL: u8 = 0x80;
pub const VECTOR_SPURIOUS: u8 = 0xFF;

const ATTR_INT: u8 = 0xE;
const ATTR_TRAP: u8 = 0xF;
const ATTR_RING3: u8 = 3 << 5;

lazy_static! {
    pub static ref IDT: SyncUnsafeCell<IdtTable> = {
        let stubs = unsafe { &trap_vector_table };
        let mut table = [GateDescriptor::default(); 256];

        for (vector, entry) in table.iter_mut().enumerate() {
            *entry = GateDescriptor::new(stubs[vector], ATTR_INT);
        }

        // exceptions keep IF state for the dump
        for vector in 0..32 {
            table[vector] = GateDescriptor::new(stubs[vector], ATTR_TRAP);
        }
        // double faults get the emergency stack
        table[8].ist = 1;
        // reachable from ring 3
        table[3] = GateDescriptor::new(stubs[3], ATTR_TRAP | ATTR_RING3);
        table[VECTOR_SYSCALL as usize] =
            GateDescriptor::new(stubs[VECTOR_SYSCALL as usize], ATTR_INT | ATTR_RING3);
        table[VECTOR_WAIT_BLOCK as usize] =
            GateDescriptor::new(stubs[VECTOR_WAIT_BLOCK as usize], ATTR_INT);
        table[VECTOR_SCHED as usize] =
            GateDescriptor::new(stubs[VECTOR_SCHED as usize], ATTR_INT);

        SyncUnsafeCell::new(table)
    };
}

pub fn load_idt() {
    unsafe {
        asm!(
            "lidt [{}]",
            in(reg) &*IDT_DESCRIPTOR as *const IdtDescriptor,
            options(nostack)
        );
    }
}

const EXCEPTION_NAMES: [&str; 32] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating point",
    "alignment check",
    "machine check",
    "SIMD floating point",
    "virtualization",
    "control protection",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "hypervisor injection",
    "VMM communication",
    "security",
    "reserved",
];

fn exception(frame: &mut TrapFrame) {
    let name = EXCEPTION_NAMES[frame.vector as usize];

    if frame.is_user() {
        if frame.vector == 14 {
            crate::error!(
                "user page fault at {:#x} (rip {:#x}), killing pid {}",
                read_cr2(),
                frame.rip,
                crate::sched::current_process().pid()
            );
        } else {
            crate::error!(
                "user {name} exception (rip {:#x}), killing pid {}",
                frame.rip,
                crate::sched::current_process().pid()
            );
        }
        crate::sched::exit_current_process(128 + frame.vector, frame);
        return;
    }

    if frame.vector == 14 {
        panic!("---- page fault ----\naddress: {:#x}\n{}", read_cr2(), frame);
    }
    panic!("---- {name} ----\n{frame}");
}

#[unsafe(no_mangle)]
extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    let started = crate::smp::trap_enter();

    match frame.vector as u8 {
        vector if vector < 32 => exception(frame),
        VECTOR_SCHED => {
            crate::sched::schedule(frame);
            apic::send_eoi();
        }
        VECTOR_TIMER => {
            crate::time::tick();
            crate::wait::timer_trap(frame);
            crate::sched::schedule(frame);
            apic::send_eoi();
        }
        VECTOR_WAIT_BLOCK => {
            // software int, no EOI
            crate::wait::block_trap(frame);
        }
        VECTOR_HALT => {
            apic::send_eoi();
            crate::khalt();
        }
        VECTOR_TLB_SHOOTDOWN => {
            crate::arch::paging::flush_all();
            apic::send_eoi();
        }
        VECTOR_START => {
            crate::sched::cpu_start();
            apic::send_eoi();
        }
        VECTOR_SYSCALL => {
            crate::syscalls::dispatch(frame);
        }
        VECTOR_SPURIOUS => {}
        vector => {
            crate::warn!("stray interrupt vector {vector:#x}");
            apic::send_eoi();
        }
    }

    // a thread observing its own death leaves here, never re-entering user
    // mode
    if frame.is_user() {
        crate::sched::reap_killed(frame);
    }

    crate::smp::trap_exit(started);
}
