//! CPU bring-up and per-CPU state.
//!
//! Every logical CPU owns a [`Cpu`] slot in a once-built table. The current
//! CPU finds its slot through `IA32_TSC_AUX`, written at CPU init; the only
//! safe handle is [`cpu_current`], whose guard holds a `cli` section so the
//! CPU cannot change under the caller.

use core::cell::SyncUnsafeCell;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;

use cairn_abi::Clocks;

use crate::arch::x86_64::interrupts::apic;
use crate::arch::x86_64::interrupts::handlers::{
    VECTOR_HALT, VECTOR_START, VECTOR_TLB_SHOOTDOWN,
};
use crate::arch::x86_64::trampoline::{TRAMPOLINE_PAGE, Trampoline};
use crate::arch::x86_64::{acpi, gdt::TaskStateSegment, hpet, registers};
use crate::memory::VirtAddr;
use crate::utils::locks::IrqMutex;
use crate::{config, debug, error};

struct CliState {
    depth: u32,
    saved_if: bool,
}

/// Accumulated per-CPU clocks, surfaced through `sys:/stat/cpu`.
#[derive(Debug, Default)]
pub struct CpuStats {
    pub idle_clocks: AtomicU64,
    pub active_clocks: AtomicU64,
    pub trap_clocks: AtomicU64,
}

pub struct Cpu {
    pub id: usize,
    pub lapic_id: u32,
    pub idle_stack_top: VirtAddr,
    pub tss: AtomicPtr<TaskStateSegment>,
    pub sched: IrqMutex<crate::sched::SchedCtx>,
    pub wait: IrqMutex<crate::wait::CpuQueues>,
    pub stats: CpuStats,
    cli: SyncUnsafeCell<CliState>,
}

unsafe impl Send for Cpu {}
unsafe impl Sync for Cpu {}

impl Cpu {
    fn new(id: usize, lapic_id: u32) -> Self {
        let idle_stack = alloc::vec![0u8; config::IDLE_STACK].leak();
        Self {
            id,
            lapic_id,
            idle_stack_top: VirtAddr::from_ptr(idle_stack.as_ptr()) + config::IDLE_STACK,
            tss: AtomicPtr::new(core::ptr::null_mut()),
            sched: IrqMutex::new(crate::sched::SchedCtx::new()),
            wait: IrqMutex::new(crate::wait::CpuQueues::new()),
            stats: CpuStats::default(),
            cli: SyncUnsafeCell::new(CliState {
                depth: 0,
                saved_if: false,
            }),
        }
    }
}

static CPUS: spin::Once<Box<[Cpu]>> = spin::Once::new();
static SMP_READY: AtomicBool = AtomicBool::new(false);
static READY_CPUS: AtomicUsize = AtomicUsize::new(1);

/// `cli` bookkeeping for the window before the CPU table exists; strictly
/// single-threaded then.
static BOOT_CLI: SyncUnsafeCell<CliState> = SyncUnsafeCell::new(CliState {
    depth: 0,
    saved_if: false,
});

pub fn cpus() -> &'static [Cpu] {
    CPUS.get().expect("CPU table used before smp::init")
}

pub fn cpu_count() -> usize {
    CPUS.get().map(|cpus| cpus.len()).unwrap_or(1)
}

#[inline]
fn cli_cell() -> &'static SyncUnsafeCell<CliState> {
    if SMP_READY.load(Ordering::Acquire) {
        let id = registers::rdmsr(registers::IA32_TSC_AUX) as usize;
        &cpus()[id].cli
    } else {
        &BOOT_CLI
    }
}

/// Enters a `cli` section. Nests; the outermost pop restores the interrupt
/// state found at the outermost push.
pub fn cli_push() {
    let was_enabled = crate::arch::interrupts_enabled();
    unsafe { crate::arch::disable_interrupts() };

    let state = unsafe { &mut *cli_cell().get() };
    state.depth += 1;
    if state.depth == 1 {
        state.saved_if = was_enabled;
    }
}

pub fn cli_pop() {
    let state = unsafe { &mut *cli_cell().get() };
    debug_assert!(state.depth != 0, "unbalanced cli_pop");
    state.depth -= 1;
    if state.depth == 0 && state.saved_if {
        unsafe { crate::arch::enable_interrupts() };
    }
}

/// Depth of the current `cli` nest, used by `block_lock` to assert the
/// caller holds exactly one trap-safe lock.
pub fn cli_depth() -> u32 {
    unsafe { (*cli_cell().get()).depth }
}

/// A pinned reference to the current CPU; holds a `cli` section for its
/// whole lifetime, so it must be dropped quickly.
pub struct CpuRef {
    cpu: &'static Cpu,
}

impl Deref for CpuRef {
    type Target = Cpu;
    fn deref(&self) -> &Self::Target {
        self.cpu
    }
}

impl Drop for CpuRef {
    fn drop(&mut self) {
        cli_pop();
    }
}

pub fn cpu_current() -> CpuRef {
    cli_push();
    CpuRef {
        cpu: unsafe { cpu_current_unchecked() },
    }
}

/// The current CPU without pinning.
/// # Safety
/// Interrupts must already be disabled (trap context or under a cli
/// section).
pub unsafe fn cpu_current_unchecked() -> &'static Cpu {
    debug_assert!(!crate::arch::interrupts_enabled());
    let id = registers::rdmsr(registers::IA32_TSC_AUX) as usize;
    &cpus()[id]
}

pub fn smp_ready() -> bool {
    SMP_READY.load(Ordering::Acquire)
}

/// The only mechanism for perturbing other CPUs.
pub fn send_ipi(cpu: &Cpu, vector: u8) {
    apic::send_ipi(cpu.lapic_id, vector);
}

pub fn send_ipi_to_others(vector: u8) {
    apic::send_ipi_to_others(vector);
}

pub fn send_ipi_to_self(vector: u8) {
    apic::send_ipi_to_self(vector);
}

/// Flushes the TLB of every other CPU. Kernel mappings are global and never
/// shrink, so only user unmap/protect changes need this.
pub fn tlb_shootdown() {
    if smp_ready() && cpu_count() > 1 {
        send_ipi_to_others(VECTOR_TLB_SHOOTDOWN);
    }
}

/// Stops every other CPU for good; the panic path.
pub fn halt_others() {
    if smp_ready() && cpu_count() > 1 {
        send_ipi_to_others(VECTOR_HALT);
    }
}

/// Trap-entry bookkeeping; returns the entry timestamp.
pub fn trap_enter() -> Clocks {
    if smp_ready() {
        crate::time::uptime()
    } else {
        0
    }
}

pub fn trap_exit(started: Clocks) {
    if started != 0 {
        let cpu = unsafe { cpu_current_unchecked() };
        let delta = crate::time::uptime().saturating_sub(started);
        cpu.stats.trap_clocks.fetch_add(delta, Ordering::Relaxed);
    }
}

extern "C" fn ap_entry(cpu_id: usize) -> ! {
    let tss = crate::arch::init_cpu(cpu_id);
    cpus()[cpu_id].tss.store(tss, Ordering::Release);
    apic::enable();

    debug!(Cpu, "cpu {} up (lapic {})", cpu_id, cpus()[cpu_id].lapic_id);
    READY_CPUS.fetch_add(1, Ordering::SeqCst);

    // idle until the start IPI arms the timer, then the tick takes over
    unsafe {
        crate::arch::enable_interrupts();
    }
    crate::sched::idle_loop()
}

/// Detects CPUs, builds the table and boots every AP through the low-memory
/// trampoline.
///
/// Call with the kernel root table live and the BSP already through
/// `arch::init_cpu(0)`.
pub fn init(bsp_tss: *mut TaskStateSegment) {
    let bsp_lapic = apic::lapic_id();

    // BSP first so its table index matches the id programmed at early init
    let mut lapics: Vec<u32> = alloc::vec![bsp_lapic];
    lapics.extend(acpi::CPUS.iter().copied().filter(|id| *id != bsp_lapic));

    let cpus_boxed: Box<[Cpu]> = lapics
        .iter()
        .enumerate()
        .map(|(id, lapic)| Cpu::new(id, *lapic))
        .collect();
    CPUS.call_once(|| cpus_boxed);
    cpus()[0].tss.store(bsp_tss, Ordering::Release);
    SMP_READY.store(true, Ordering::Release);

    apic::enable();
    apic::calibrate_timer();

    if cpu_count() == 1 {
        return;
    }

    let mut trampoline = unsafe { Trampoline::setup() };
    for cpu in &cpus()[1..] {
        trampoline.set_target(cpu.id, cpu.idle_stack_top, ap_entry);

        let expected = READY_CPUS.load(Ordering::SeqCst) + 1;
        apic::send_init(cpu.lapic_id);
        hpet::busy_sleep_ms(10);
        apic::send_sipi(cpu.lapic_id, TRAMPOLINE_PAGE);

        let mut timeout_ms = 1000u64;
        while READY_CPUS.load(Ordering::SeqCst) < expected {
            hpet::busy_sleep_ms(1);
            timeout_ms -= 1;
            if timeout_ms == 0 {
                error!("cpu {} (lapic {}) failed to start", cpu.id, cpu.lapic_id);
                break;
            }
        }
    }
    trampoline.cleanup();

    debug!(
        Cpu,
        "{}/{} CPUs online",
        READY_CPUS.load(Ordering::SeqCst),
        cpu_count()
    );
}

/// Arms every CPU's tick, phases staggered across the fleet.
pub fn start_timers() {
    send_ipi_to_others(VECTOR_START);
    crate::sched::cpu_start();
}
