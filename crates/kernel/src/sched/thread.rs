use core::arch::asm;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, Ordering};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use cairn_abi::Clocks;
use cairn_abi::errors::Errno;
use cairn_abi::process::{Priority, Tid};
use int_enum::IntEnum;

use crate::arch::interrupts::TrapFrame;
use crate::config;
use crate::memory::VirtAddr;
use crate::sched::process::Process;
use crate::utils::locks::ProtocolCell;
use crate::wait::WaitCtx;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
#[repr(u8)]
pub enum ThreadState {
    Ready = 0,
    Running = 1,
    /// frame saved, in transit onto a CPU's blocked list
    Parked = 2,
    Blocked = 3,
    Killed = 4,
}

/// fxsave/fxrstor area
#[derive(Clone, Copy)]
#[repr(C, align(16))]
pub struct SimdCtx([u8; 512]);

impl SimdCtx {
    const fn new() -> Self {
        Self([0; 512])
    }
}

/// State only the owning CPU touches, under its scheduler lock.
pub struct ThreadCtx {
    pub frame: TrapFrame,
    pub simd: SimdCtx,
    pub deadline: Clocks,
}

pub struct Thread {
    tid: Tid,
    process: Arc<Process>,
    priority: Priority,
    state: AtomicU8,
    killed: AtomicBool,
    errno: AtomicU16,
    /// guarded by the owning CPU's scheduler lock while the thread is on a
    /// CPU, untouched otherwise
    ctx: ProtocolCell<ThreadCtx>,
    kernel_stack: Box<[u8]>,
    pub wait: WaitCtx,
}

impl Thread {
    /// A thread entering kernel code at `entry` on a fresh kernel stack.
    pub fn new(process: Arc<Process>, entry: VirtAddr, priority: Priority) -> Arc<Self> {
        let tid = process.allocate_tid();
        let kernel_stack = alloc::vec![0u8; config::KERNEL_STACK].into_boxed_slice();
        let stack_top = VirtAddr::from_ptr(kernel_stack.as_ptr()) + config::KERNEL_STACK;

        Arc::new(Self {
            tid,
            process,
            priority,
            state: AtomicU8::new(ThreadState::Ready as u8),
            killed: AtomicBool::new(false),
            errno: AtomicU16::new(0),
            ctx: ProtocolCell::new(ThreadCtx {
                frame: TrapFrame::new_kernel(entry, stack_top),
                simd: SimdCtx::new(),
                deadline: 0,
            }),
            kernel_stack,
            wait: WaitCtx::new(),
        })
    }

    #[inline]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    #[inline]
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[inline]
    pub fn kernel_stack_top(&self) -> VirtAddr {
        VirtAddr::from_ptr(self.kernel_stack.as_ptr()) + self.kernel_stack.len()
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(ThreadState::Killed)
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Marks the thread for death; it is reaped at its next trap boundary.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst) || self.process.is_killed()
    }

    pub fn last_errno(&self) -> Option<Errno> {
        Errno::from_status(self.errno.load(Ordering::Relaxed) as u32)
    }

    pub fn set_errno(&self, errno: Errno) {
        self.errno.store(errno as u16, Ordering::Relaxed);
    }

    /// # Safety
    /// Caller must hold the owning CPU's scheduler lock, or be the only
    /// reference holder (thread not yet pushed).
    pub unsafe fn ctx(&self) -> &mut ThreadCtx {
        unsafe { self.ctx.get_mut() }
    }

    /// Saves the trap frame and this CPU's SIMD state into the thread.
    /// # Safety
    /// Same protocol as [`Self::ctx`]; must run on the CPU the thread last
    /// ran on.
    pub unsafe fn save(&self, frame: &TrapFrame) {
        unsafe {
            let ctx = self.ctx();
            ctx.frame = *frame;
            asm!("fxsave64 [{}]", in(reg) ctx.simd.0.as_mut_ptr(), options(nostack));
        }
    }

    /// Loads the thread's saved frame and SIMD state onto this CPU.
    /// # Safety
    /// Same protocol as [`Self::ctx`].
    pub unsafe fn load(&self, frame: &mut TrapFrame) {
        unsafe {
            let ctx = self.ctx();
            *frame = ctx.frame;
            asm!("fxrstor64 [{}]", in(reg) ctx.simd.0.as_ptr(), options(nostack));
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.process.thread_exited(self.tid);
    }
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("pid", &self.process.pid())
            .field("state", &self.state())
            .finish()
    }
}

/// Stacks for dead threads cannot be freed while a CPU might still be
/// executing on them; the graveyard holds them for one extra schedule
/// round.
pub type Graveyard = Vec<Arc<Thread>>;
