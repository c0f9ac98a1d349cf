//! The per-CPU scheduler.
//!
//! Each CPU owns FIFO ready queues indexed by priority, the thread it is
//! running, and a graveyard of dead threads whose stacks are freed one
//! schedule round later. Threads enter the system through [`push`], which
//! balances across CPUs at enqueue time; after that a thread stays on its
//! CPU until it blocks or exits.

pub mod process;
pub mod spawn;
pub mod thread;

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use cairn_abi::process::{PRIORITY_LEVELS, Priority};

use crate::arch::interrupts::handlers::VECTOR_SCHED;
use crate::arch::interrupts::{TrapFrame, trap_frame_restore};
use crate::arch::x86_64::gdt;
use crate::arch::x86_64::interrupts::apic;
use crate::memory::VirtAddr;
use crate::{config, smp, time};

pub use process::Process;
pub use thread::{Thread, ThreadState};

static SCHED_READY: AtomicBool = AtomicBool::new(false);

/// Per-CPU scheduling state, inside `Cpu::sched`.
pub struct SchedCtx {
    queues: [VecDeque<Arc<Thread>>; PRIORITY_LEVELS],
    run_thread: Option<Arc<Thread>>,
    graveyard: thread::Graveyard,
    slice_start: u64,
}

impl SchedCtx {
    pub const fn new() -> Self {
        Self {
            queues: [const { VecDeque::new() }; PRIORITY_LEVELS],
            run_thread: None,
            graveyard: thread::Graveyard::new(),
            slice_start: 0,
        }
    }

    /// Runnable threads on this CPU, the running one included.
    fn runnable(&self) -> usize {
        self.run_thread.is_some() as usize + self.queues.iter().map(VecDeque::len).sum::<usize>()
    }

    fn pop_next(&mut self) -> Option<Arc<Thread>> {
        for queue in self.queues.iter_mut().rev() {
            if let Some(thread) = queue.pop_front() {
                return Some(thread);
            }
        }
        None
    }

    pub fn run_thread(&self) -> Option<&Arc<Thread>> {
        self.run_thread.as_ref()
    }

    /// Moves the running thread off the CPU without requeueing it; the wait
    /// subsystem parks it instead.
    pub fn take_run_thread(&mut self) -> Option<Arc<Thread>> {
        self.run_thread.take()
    }

    pub fn bury(&mut self, thread: Arc<Thread>) {
        self.graveyard.push(thread);
    }
}

pub fn ready() -> bool {
    SCHED_READY.load(Ordering::Acquire)
}

/// Picks the CPU with the fewest runnable threads (idle CPUs get a bias)
/// and enqueues the thread there.
pub fn push(thread: Arc<Thread>) {
    thread.set_state(ThreadState::Ready);

    let cpus = smp::cpus();
    let mut best = 0;
    let mut best_len = i64::MAX;
    for cpu in cpus {
        let mut len = cpu.sched.lock().runnable() as i64;
        if len == 0 {
            len -= 1;
        }
        if len < best_len {
            best_len = len;
            best = cpu.id;
        }
    }

    let priority = thread.priority().level();
    cpus[best].sched.lock().queues[priority].push_back(thread);
}

/// The scheduling decision, invoked from the timer tick, `yield`, and the
/// wait subsystem, always with a live trap frame.
pub fn schedule(frame: &mut TrapFrame) {
    if !ready() {
        return;
    }

    let cpu = unsafe { smp::cpu_current_unchecked() };
    let now = time::uptime();
    let mut ctx = cpu.sched.lock();

    // account the elapsed slice before deciding anything
    let elapsed = now.saturating_sub(ctx.slice_start);
    let stat = if ctx.run_thread.is_some() {
        &cpu.stats.active_clocks
    } else {
        &cpu.stats.idle_clocks
    };
    stat.fetch_add(elapsed, Ordering::Relaxed);
    ctx.slice_start = now;

    ctx.graveyard.clear();

    if let Some(current) = ctx.run_thread.clone() {
        match current.state() {
            ThreadState::Killed => {
                ctx.run_thread = None;
                ctx.bury(current);
            }
            _ => {
                if unsafe { current.ctx() }.deadline > now {
                    // slice not spent; only a higher-priority arrival takes
                    // the CPU away at a tick
                    let level = current.priority().level();
                    let higher_ready = ctx.queues[level + 1..]
                        .iter()
                        .any(|queue| !queue.is_empty());
                    if !higher_ready {
                        return;
                    }
                }
                unsafe { current.save(frame) };
                current.set_state(ThreadState::Ready);
                let priority = current.priority().level();
                ctx.run_thread = None;
                ctx.queues[priority].push_back(current);
            }
        }
    }

    let next = loop {
        match ctx.pop_next() {
            // threads killed while queued are buried, not run
            Some(next) if next.state() == ThreadState::Killed => ctx.bury(next),
            Some(next) if next.is_killed() && unsafe { next.ctx() }.frame.is_user() => {
                next.set_state(ThreadState::Killed);
                ctx.bury(next)
            }
            other => break other,
        }
    };

    match next {
        Some(next) => {
            unsafe {
                next.load(frame);
                next.ctx().deadline = now + config::TIME_SLICE;
                gdt::set_tss_rsp0(cpu.tss.load(Ordering::Acquire), next.kernel_stack_top());
            }
            next.set_state(ThreadState::Running);

            let space = next.process().space();
            if unsafe { crate::arch::paging::current_root_table_ptr().phys_addr() }
                != space.root_phys()
            {
                space.load();
            }
            ctx.run_thread = Some(next);
        }
        None => {
            // nothing runnable: drop to the idle loop on the idle stack
            *frame = TrapFrame::new_kernel(
                VirtAddr::from(idle_loop as usize),
                cpu.idle_stack_top,
            );
            unsafe {
                gdt::set_tss_rsp0(cpu.tss.load(Ordering::Acquire), cpu.idle_stack_top);
            }
        }
    }
}

/// Requests a scheduling pass on this CPU through the normal trap path.
pub fn thread_yield() {
    if ready() && smp::smp_ready() && crate::arch::interrupts_enabled() {
        smp::send_ipi_to_self(VECTOR_SCHED);
    } else {
        core::hint::spin_loop();
    }
}

/// Arms this CPU's tick; phases are staggered so the fleet does not tick in
/// lockstep.
pub fn cpu_start() {
    let id = smp::cpu_current().id;
    let phase = id as u64 * (time::NS_PER_SEC / config::TIMER_HZ / smp::cpu_count() as u64);
    apic::timer_init(config::TIMER_HZ, phase);
}

pub fn idle_loop() -> ! {
    loop {
        unsafe {
            crate::arch::enable_interrupts();
            crate::arch::hlt();
        }
    }
}

/// The thread currently executing on this CPU.
pub fn current_thread() -> Arc<Thread> {
    let cpu = smp::cpu_current();
    let ctx = cpu.sched.lock();
    ctx.run_thread()
        .cloned()
        .expect("current_thread outside a thread context")
}

pub fn current_process() -> Arc<Process> {
    current_thread().process().clone()
}

/// Kills the calling thread's whole process and schedules away.
pub fn exit_current_process(status: u64, frame: &mut TrapFrame) {
    let thread = current_thread();
    thread.process().kill(status);
    thread.kill();
    thread.set_state(ThreadState::Killed);
    schedule(frame);
}

/// Kills only the calling thread.
pub fn exit_current_thread(frame: &mut TrapFrame) {
    let thread = current_thread();
    thread.kill();
    thread.set_state(ThreadState::Killed);
    schedule(frame);
}

/// Trap-exit hook: a killed thread about to re-enter user mode is reaped
/// here instead.
pub fn reap_killed(frame: &mut TrapFrame) {
    if !ready() {
        return;
    }
    let cpu = unsafe { smp::cpu_current_unchecked() };
    let thread = cpu.sched.lock().run_thread().cloned();
    if let Some(thread) = thread
        && thread.is_killed()
    {
        thread.set_state(ThreadState::Killed);
        schedule(frame);
    }
}

/// Turns the boot flow into the scheduler's first thread and enters it.
///
/// The init thread runs `entry` at maximum priority with an infinite
/// deadline, on CPU 0.
pub unsafe fn init(process: Arc<Process>, entry: fn() -> !) -> ! {
    let thread = Thread::new(
        process,
        VirtAddr::from(entry as usize),
        Priority::MAX,
    );
    unsafe {
        thread.ctx().deadline = u64::MAX;
    }
    thread.set_state(ThreadState::Running);

    let frame_ptr: *const TrapFrame;
    {
        let cpu = &smp::cpus()[0];
        let mut ctx = cpu.sched.lock();
        ctx.slice_start = time::uptime();
        frame_ptr = &unsafe { thread.ctx() }.frame;
        unsafe {
            gdt::set_tss_rsp0(cpu.tss.load(Ordering::Acquire), thread.kernel_stack_top());
        }
        ctx.run_thread = Some(thread);
    }

    SCHED_READY.store(true, Ordering::Release);
    unsafe {
        crate::arch::disable_interrupts();
        trap_frame_restore(frame_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn yield_round_trip() {
        // returns at all = the schedule vector saved and restored us
        thread_yield();
        let tid = current_thread().tid();
        thread_yield();
        assert_eq!(tid, current_thread().tid());
    }

    #[test_case]
    fn push_balances_toward_idle_cpus() {
        let before: usize = smp::cpus()
            .iter()
            .map(|cpu| cpu.sched.lock().runnable())
            .sum();
        // the current thread is the only runnable one in the test kernel
        assert!(before >= 1);
    }
}
