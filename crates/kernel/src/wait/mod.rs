//! Wait queues and the two-phase block protocol.
//!
//! Blocking is split into *park* and *block*: the thread registers its
//! entries on every queue, then raises `VECTOR_WAIT_BLOCK`, which saves its
//! frame and leaves it parked; the next timer tick on its CPU either
//! finishes the block (all entries armed, thread onto the blocked list) or
//! notices a wake that raced the park (`cancel_block`) and requeues the
//! thread immediately.
//!
//! Locking protocol, violations deadlock or corrupt:
//! - a thread's `WaitCtx` may be touched by its own thread before the park
//!   vector is raised, and afterwards only with **all** of its entries'
//!   queue locks held;
//! - a CPU's parked/blocked lists are only touched under `Cpu::wait`, and
//!   never while also acquiring a queue lock; queue locks come first;
//! - a woken thread is *claimed* (CAS) before anyone unlinks it, so a
//!   waker and the deadline scan cannot both requeue it.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;

use cairn_abi::errors::Errno;
use cairn_abi::{CLOCKS_NEVER, Clocks};

use crate::arch::interrupts::TrapFrame;
use crate::arch::interrupts::handlers::VECTOR_WAIT_BLOCK;
use crate::config;
use crate::raise_vector;
use crate::sched::{self, Thread, ThreadState};
use crate::smp;
use crate::utils::locks::{IrqMutexGuard, ProtocolCell, RawIrqLock, RawTicketLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// woken by `wake`
    Norm,
    Timeout,
    /// the thread was killed while waiting
    Dead,
    /// block setup failed (too many queues)
    Error,
}

struct WaitQueueInner {
    lock: RawTicketLock,
    /// guarded by `lock`
    entries: ProtocolCell<Vec<Arc<WaitEntry>>>,
}

/// A cheaply clonable handle to a set of waiting threads.
#[derive(Clone)]
pub struct WaitQueue {
    inner: Arc<WaitQueueInner>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WaitQueueInner {
                lock: RawTicketLock::INIT,
                entries: ProtocolCell::new(Vec::new()),
            }),
        }
    }

    #[inline]
    fn lock(&self) {
        self.inner.lock.lock_spin();
    }

    #[inline]
    unsafe fn unlock(&self) {
        unsafe { self.inner.lock.unlock_fair() }
    }

    fn same_queue(&self, other: &WaitQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Unblocks up to `amount` threads waiting on this queue. Threads that
    /// are still parking are cancelled instead and wake with
    /// [`WaitResult::Norm`] without ever blocking.
    pub fn wake(&self, amount: usize) {
        let mut remaining = amount;

        smp::cli_push();
        self.lock();

        let snapshot: Vec<Arc<WaitEntry>> = unsafe { self.inner.entries.get() }.clone();
        for entry in snapshot {
            if remaining == 0 {
                break;
            }

            if !entry.blocking.load(Ordering::Acquire) {
                // racing a park; the parker observes this and requeues
                entry.cancel_block.store(true, Ordering::Release);
                continue;
            }

            let thread = entry.thread.clone();
            if !thread.wait.claim() {
                // the deadline scan got there first
                continue;
            }

            // the waking queue's lock is already held
            thread.wait.lock_other_queues(self);
            let inner = unsafe { thread.wait.inner.get_mut() };
            inner.result = WaitResult::Norm;

            if let Some(owner) = inner.owner.take() {
                let mut lists = smp::cpus()[owner].wait.lock();
                lists.remove_blocked(&thread);
            }

            thread.wait.unlink_entries(self);
            sched::push(thread);
            remaining -= 1;
        }

        unsafe { self.unlock() };
        smp::cli_pop();
    }

    pub fn wake_all(&self) {
        self.wake(usize::MAX);
    }
}

/// One registration of one thread on one queue. Lives in the queue's entry
/// list and in the thread's wait context at the same time; this is the only
/// structure allowed to be in two lists at once.
pub struct WaitEntry {
    queue: WaitQueue,
    thread: Arc<Thread>,
    /// armed by the parker; a wake only acts on armed entries
    blocking: AtomicBool,
    /// set by a wake racing the park
    cancel_block: AtomicBool,
}

struct WaitCtxInner {
    entries: Vec<Arc<WaitEntry>>,
    result: WaitResult,
    deadline: Clocks,
    /// CPU whose blocked list holds the thread
    owner: Option<usize>,
}

/// A thread's side of the wait protocol, embedded in [`Thread`].
pub struct WaitCtx {
    inner: ProtocolCell<WaitCtxInner>,
    claimed: AtomicBool,
}

impl WaitCtx {
    pub fn new() -> Self {
        Self {
            inner: ProtocolCell::new(WaitCtxInner {
                entries: Vec::new(),
                result: WaitResult::Norm,
                deadline: 0,
                owner: None,
            }),
            claimed: AtomicBool::new(false),
        }
    }

    /// Atomically claims the right to requeue this thread.
    fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Locks every queue this thread has entries on, except `held`.
    fn lock_other_queues(&self, held: &WaitQueue) {
        let inner = unsafe { self.inner.get() };
        for entry in &inner.entries {
            if !entry.queue.same_queue(held) {
                entry.queue.lock();
            }
        }
    }

    fn lock_all_queues(&self) {
        let inner = unsafe { self.inner.get() };
        for entry in &inner.entries {
            entry.queue.lock();
        }
    }

    unsafe fn unlock_queues(&self, except: Option<&WaitQueue>) {
        let inner = unsafe { self.inner.get() };
        for entry in &inner.entries {
            if except.is_none_or(|held| !entry.queue.same_queue(held)) {
                unsafe { entry.queue.unlock() };
            }
        }
    }

    /// Removes every entry from its queue, then unlocks the queues (all of
    /// which must be held) and clears the entry list. `held` stays locked.
    fn unlink_entries(&self, held: &WaitQueue) {
        let inner = unsafe { self.inner.get_mut() };
        for entry in inner.entries.drain(..) {
            let list = unsafe { entry.queue.inner.entries.get_mut() };
            list.retain(|other| !Arc::ptr_eq(other, &entry));
            if !entry.queue.same_queue(held) {
                unsafe { entry.queue.unlock() };
            }
        }
    }

    fn unlink_entries_all(&self) {
        let inner = unsafe { self.inner.get_mut() };
        for entry in inner.entries.drain(..) {
            let list = unsafe { entry.queue.inner.entries.get_mut() };
            list.retain(|other| !Arc::ptr_eq(other, &entry));
            unsafe { entry.queue.unlock() };
        }
    }

    fn result(&self) -> WaitResult {
        unsafe { self.inner.get() }.result
    }
}

impl Default for WaitCtx {
    fn default() -> Self {
        Self::new()
    }
}

/// The parked/blocked lists of one CPU, inside `Cpu::wait`.
pub struct CpuQueues {
    parked: Vec<Arc<Thread>>,
    blocked: Vec<Arc<Thread>>,
}

impl CpuQueues {
    pub const fn new() -> Self {
        Self {
            parked: Vec::new(),
            blocked: Vec::new(),
        }
    }

    fn remove_blocked(&mut self, thread: &Arc<Thread>) {
        self.blocked.retain(|other| !Arc::ptr_eq(other, thread));
    }
}

/// Registers `thread` on every queue; does not yet block.
fn wait_setup(thread: &Arc<Thread>, queues: &[&WaitQueue], timeout: Clocks) -> Result<(), Errno> {
    if queues.is_empty() || queues.len() > config::MAX_BLOCKERS_PER_THREAD {
        return Err(Errno::EINVAL);
    }

    // pre-park: the thread owns its ctx, only `cancel_block` can race
    let inner = unsafe { thread.wait.inner.get_mut() };
    debug_assert!(inner.entries.is_empty(), "nested block");

    inner.result = WaitResult::Norm;
    inner.deadline = if timeout == CLOCKS_NEVER {
        CLOCKS_NEVER
    } else {
        crate::time::uptime() + timeout
    };
    inner.owner = None;
    thread.wait.claimed.store(false, Ordering::Release);

    for queue in queues {
        let entry = Arc::new(WaitEntry {
            queue: (*queue).clone(),
            thread: thread.clone(),
            blocking: AtomicBool::new(false),
            cancel_block: AtomicBool::new(false),
        });
        inner.entries.push(entry.clone());

        smp::cli_push();
        queue.lock();
        unsafe { queue.inner.entries.get_mut() }.push(entry);
        unsafe { queue.unlock() };
        smp::cli_pop();
    }

    Ok(())
}

fn block_inner(queues: &[&WaitQueue], timeout: Clocks) -> WaitResult {
    if timeout == 0 {
        return WaitResult::Timeout;
    }

    let thread = sched::current_thread();
    if thread.is_killed() {
        return WaitResult::Dead;
    }
    if wait_setup(&thread, queues, timeout).is_err() {
        return WaitResult::Error;
    }

    debug_assert!(crate::arch::interrupts_enabled());
    raise_vector!(VECTOR_WAIT_BLOCK);

    thread.wait.result()
}

/// Blocks on one queue until woken, the timeout expires, or the thread is
/// killed.
pub fn block(queue: &WaitQueue, timeout: Clocks) -> WaitResult {
    block_inner(&[queue], timeout)
}

/// Blocks on every queue at once; any queue's wake unblocks and removes the
/// thread from all of them atomically.
pub fn block_many(queues: &[&WaitQueue], timeout: Clocks) -> WaitResult {
    block_inner(queues, timeout)
}

/// Like [`block`], but releases `guard` after registering and reacquires it
/// before returning. The guard must be the caller's only trap-safe lock.
pub fn block_lock<'a, T>(
    queue: &WaitQueue,
    timeout: Clocks,
    guard: IrqMutexGuard<'a, T>,
) -> (WaitResult, IrqMutexGuard<'a, T>) {
    if timeout == 0 {
        return (WaitResult::Timeout, guard);
    }

    // the mutex outlives the guard's 'a, reacquiring through a raw pointer
    // sidesteps the guard borrow
    let mutex = IrqMutexGuard::mutex(&guard) as *const lock_api::Mutex<RawIrqLock, T>;

    let thread = sched::current_thread();
    if thread.is_killed() {
        return (WaitResult::Dead, guard);
    }
    if wait_setup(&thread, &[queue], timeout).is_err() {
        return (WaitResult::Error, guard);
    }

    debug_assert_eq!(smp::cli_depth(), 1, "block_lock with extra locks held");
    drop(guard);

    debug_assert!(crate::arch::interrupts_enabled());
    raise_vector!(VECTOR_WAIT_BLOCK);

    let result = thread.wait.result();
    (result, unsafe { (*mutex).lock() })
}

/// Puts the calling thread to sleep for at least `ns` nanoseconds.
pub fn sleep(ns: Clocks) {
    let queue = WaitQueue::new();
    let _ = block(&queue, ns.max(1));
}

/// `VECTOR_WAIT_BLOCK` handler: saves the thread and leaves it parked; the
/// next tick completes the block.
pub fn block_trap(frame: &mut TrapFrame) {
    let cpu = unsafe { smp::cpu_current_unchecked() };

    let thread = cpu
        .sched
        .lock()
        .take_run_thread()
        .expect("wait-block vector with no running thread");
    unsafe { thread.save(frame) };
    thread.set_state(ThreadState::Parked);

    cpu.wait.lock().parked.push(thread);
    sched::schedule(frame);
}

fn finish_parks(cpu: &'static smp::Cpu) {
    loop {
        let Some(thread) = cpu.wait.lock().parked.pop() else {
            break;
        };

        thread.wait.lock_all_queues();
        let inner = unsafe { thread.wait.inner.get_mut() };

        let cancelled = inner
            .entries
            .iter()
            .any(|entry| entry.cancel_block.load(Ordering::Acquire));

        if cancelled {
            inner.result = WaitResult::Norm;
            thread.wait.unlink_entries_all();
            sched::push(thread);
        } else {
            for entry in &inner.entries {
                entry.blocking.store(true, Ordering::Release);
            }
            inner.owner = Some(cpu.id);
            thread.set_state(ThreadState::Blocked);

            // queue locks are held; taking the CPU list lock under them is
            // the canonical order
            cpu.wait.lock().blocked.push(thread.clone());
            unsafe { thread.wait.unlock_queues(None) };
        }
    }
}

fn scan_blocked(cpu: &'static smp::Cpu) {
    let now = crate::time::uptime();

    // claim candidates under the list lock, act on them without it
    let mut due: Vec<(Arc<Thread>, WaitResult)> = Vec::new();
    {
        let mut lists = cpu.wait.lock();
        let mut i = 0;
        while i < lists.blocked.len() {
            let thread = &lists.blocked[i];
            let result = if thread.is_killed() {
                WaitResult::Dead
            } else if now >= unsafe { thread.wait.inner.get() }.deadline {
                WaitResult::Timeout
            } else {
                i += 1;
                continue;
            };

            if !thread.wait.claim() {
                // a waker owns this thread and will delist it
                i += 1;
                continue;
            }
            let thread = lists.blocked.swap_remove(i);
            due.push((thread, result));
        }
    }

    for (thread, result) in due {
        thread.wait.lock_all_queues();
        let inner = unsafe { thread.wait.inner.get_mut() };
        inner.result = result;
        inner.owner = None;
        thread.wait.unlink_entries_all();
        sched::push(thread);
    }
}

/// Tick handler: completes pending parks, then expires deadlines. The
/// blocked list is unsorted; the scan is O(n) per tick.
pub fn timer_trap(_frame: &mut TrapFrame) {
    if !sched::ready() {
        return;
    }
    let cpu = unsafe { smp::cpu_current_unchecked() };
    finish_parks(cpu);
    scan_blocked(cpu);
}

/// Blocks on `$queue` until `$cond` holds, retesting after every wake.
/// Returns the last [`WaitResult`].
#[macro_export]
macro_rules! wait_until {
    ($queue:expr, $cond:expr) => {{
        let mut result = $crate::wait::WaitResult::Norm;
        while !$cond && result == $crate::wait::WaitResult::Norm {
            result = $crate::wait::block($queue, cairn_abi::CLOCKS_NEVER);
        }
        result
    }};
    ($queue:expr, $cond:expr, $timeout:expr) => {{
        let mut result = $crate::wait::WaitResult::Norm;
        let deadline = if $timeout == cairn_abi::CLOCKS_NEVER {
            cairn_abi::CLOCKS_NEVER
        } else {
            $crate::time::uptime() + $timeout
        };
        while !$cond && result == $crate::wait::WaitResult::Norm {
            let uptime = $crate::time::uptime();
            if deadline <= uptime {
                result = $crate::wait::WaitResult::Timeout;
                break;
            }
            let remaining = if deadline == cairn_abi::CLOCKS_NEVER {
                cairn_abi::CLOCKS_NEVER
            } else {
                deadline - uptime
            };
            result = $crate::wait::block($queue, remaining);
        }
        result
    }};
}

/// Like [`wait_until!`] for code holding an [`IrqMutex`] guard named
/// `$guard`; the lock is dropped while blocked and reacquired before the
/// condition is retested.
#[macro_export]
macro_rules! wait_until_locked {
    ($queue:expr, $guard:ident, $cond:expr) => {{
        let mut result = $crate::wait::WaitResult::Norm;
        loop {
            if $cond || result != $crate::wait::WaitResult::Norm {
                break;
            }
            let (new_result, new_guard) =
                $crate::wait::block_lock($queue, cairn_abi::CLOCKS_NEVER, $guard);
            result = new_result;
            $guard = new_guard;
        }
        result
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time;

    #[test_case]
    fn zero_timeout_never_blocks() {
        let queue = WaitQueue::new();
        assert_eq!(block(&queue, 0), WaitResult::Timeout);
    }

    #[test_case]
    fn timeout_is_bounded() {
        let queue = WaitQueue::new();
        let timeout = 50_000_000; // 50 ms
        let tick = time::NS_PER_SEC / crate::config::TIMER_HZ;

        let before = time::uptime();
        let result = block(&queue, timeout);
        let elapsed = time::uptime() - before;

        assert_eq!(result, WaitResult::Timeout);
        assert!(elapsed >= timeout, "woke early: {elapsed}");
        assert!(elapsed <= timeout + 2 * tick + tick, "woke late: {elapsed}");
    }

    #[test_case]
    fn sleep_returns() {
        let before = time::uptime();
        sleep(5_000_000);
        assert!(time::uptime() - before >= 5_000_000);
    }

    use core::sync::atomic::{AtomicBool, Ordering};
    use lazy_static::lazy_static;

    static RACE_FLAG: AtomicBool = AtomicBool::new(false);
    lazy_static! {
        static ref RACE_QUEUE: WaitQueue = WaitQueue::new();
    }

    fn racing_waker() -> ! {
        // no delay: the wake races the blocker's park as hard as possible
        RACE_FLAG.store(true, Ordering::Release);
        RACE_QUEUE.wake(1);

        let thread = sched::current_thread();
        thread.kill();
        thread.set_state(ThreadState::Killed);
        loop {
            sched::thread_yield();
            core::hint::spin_loop();
        }
    }

    #[test_case]
    fn wake_before_block_terminates() {
        use cairn_abi::process::Priority;
        use crate::memory::VirtAddr;

        RACE_FLAG.store(false, Ordering::Release);
        let waker = crate::sched::Thread::new(
            sched::current_process(),
            VirtAddr::from(racing_waker as usize),
            Priority::High,
        );
        sched::push(waker);

        // must terminate even if the wake lands mid-park; the timeout is
        // only a tripwire for a lost wakeup
        let result = crate::wait_until!(
            &*RACE_QUEUE,
            RACE_FLAG.load(Ordering::Acquire),
            crate::time::NS_PER_SEC
        );
        assert_ne!(result, WaitResult::Error);
        assert!(RACE_FLAG.load(Ordering::Acquire), "waker never ran");
    }

    #[test_case]
    fn block_many_single_wake_unlinks_everywhere() {
        let first = WaitQueue::new();
        let second = WaitQueue::new();

        // no waker: both registrations must unwind cleanly on timeout
        let result = block_many(&[&first, &second], 5_000_000);
        assert_eq!(result, WaitResult::Timeout);

        // both queues forgot about us
        unsafe {
            smp::cli_push();
            first.lock();
            assert!(first.inner.entries.get().is_empty());
            first.unlock();
            second.lock();
            assert!(second.inner.entries.get().is_empty());
            second.unlock();
            smp::cli_pop();
        }
    }
}
