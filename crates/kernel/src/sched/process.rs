use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use cairn_abi::errors::{Errno, SysResult};
use cairn_abi::process::{Pid, Tid};
use hashbrown::HashMap;
use lazy_static::lazy_static;

use crate::fs::VfsContext;
use crate::memory::space::AddressSpace;
use crate::utils::locks::{Mutex, RwLock};
use crate::{config, debug};

lazy_static! {
    static ref PROCESSES: RwLock<HashMap<Pid, Arc<Process>>> = RwLock::new(HashMap::new());
    /// pids of processes that already exited, with their status
    static ref EXIT_STATUSES: Mutex<HashMap<Pid, u64>> = Mutex::new(HashMap::new());
}

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

pub struct Process {
    pid: Pid,
    /// `[ptrs][strings]`-style argv, kept as owned strings until the loader
    /// lays the block out in user memory
    argv: Vec<Box<str>>,
    killed: AtomicBool,
    space: AddressSpace,
    vfs: VfsContext,
    next_tid: AtomicU32,
    threads_alive: AtomicUsize,
    exit_status: AtomicU64,
    pub rings: crate::ioring::RingTable,
}

impl Process {
    /// Creates and registers a process; the caller still has to create its
    /// first thread.
    pub fn create(argv: &[&str], vfs: VfsContext) -> SysResult<Arc<Self>> {
        if argv.is_empty() || argv.len() > config::MAX_ARGV {
            return Err(Errno::EINVAL);
        }
        let total: usize = argv.iter().map(|arg| arg.len() + 1).sum();
        if total > config::MAX_ARGV_BYTES {
            return Err(Errno::EINVAL);
        }

        let space = AddressSpace::new().map_err(|_| Errno::ENOMEM)?;
        let process = Arc::new(Self {
            pid: NEXT_PID.fetch_add(1, Ordering::SeqCst),
            argv: argv.iter().map(|arg| Box::from(*arg)).collect(),
            killed: AtomicBool::new(false),
            space,
            vfs,
            next_tid: AtomicU32::new(0),
            threads_alive: AtomicUsize::new(0),
            exit_status: AtomicU64::new(0),
            rings: crate::ioring::RingTable::new(),
        });

        PROCESSES.write().insert(process.pid, process.clone());
        Ok(process)
    }

    /// The kernel's own process, wrapping the boot address space.
    /// # Safety
    /// Once, at boot, with the kernel root table loaded.
    pub unsafe fn create_kernel(vfs: VfsContext) -> Arc<Self> {
        let process = Arc::new(Self {
            pid: 0,
            argv: alloc::vec![Box::from("kernel")],
            killed: AtomicBool::new(false),
            space: unsafe { AddressSpace::from_current() },
            vfs,
            next_tid: AtomicU32::new(0),
            threads_alive: AtomicUsize::new(0),
            exit_status: AtomicU64::new(0),
            rings: crate::ioring::RingTable::new(),
        });
        PROCESSES.write().insert(0, process.clone());
        process
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.argv[0]
    }

    pub fn argv(&self) -> &[Box<str>] {
        &self.argv
    }

    #[inline]
    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    #[inline]
    pub fn vfs(&self) -> &VfsContext {
        &self.vfs
    }

    pub fn allocate_tid(&self) -> Tid {
        self.threads_alive.fetch_add(1, Ordering::SeqCst);
        self.next_tid.fetch_add(1, Ordering::SeqCst)
    }

    /// Marks the whole process for death; threads are reaped at their next
    /// trap boundary.
    pub fn kill(&self, status: u64) {
        self.exit_status.store(status, Ordering::Release);
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Called from `Thread::drop`; the last thread unregisters the process
    /// so the address space and files die with the thread refs.
    pub(super) fn thread_exited(&self, tid: Tid) {
        let remaining = self.threads_alive.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && self.pid != 0 {
            debug!(
                Process,
                "pid {} ({}) exited with status {}",
                self.pid,
                self.name(),
                self.exit_status.load(Ordering::Acquire)
            );
            EXIT_STATUSES
                .lock()
                .insert(self.pid, self.exit_status.load(Ordering::Acquire));
            PROCESSES.write().remove(&self.pid);
        }
        let _ = tid;
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name())
            .finish()
    }
}

/// Looks a live process up by pid.
pub fn find(pid: Pid) -> Option<Arc<Process>> {
    PROCESSES.read().get(&pid).cloned()
}

/// The exit status of a process that already terminated.
pub fn exit_status(pid: Pid) -> Option<u64> {
    EXIT_STATUSES.lock().get(&pid).copied()
}

/// Snapshot of live pids, for `sys:/proc`.
pub fn live_pids() -> Vec<Pid> {
    PROCESSES.read().keys().copied().collect()
}

/// One-line status text for `sys:/proc/<pid>/status`.
pub fn status_text(pid: Pid) -> Option<String> {
    use core::fmt::Write;
    let mut out = String::new();
    if let Some(process) = find(pid) {
        writeln!(out, "pid {} name {} state alive", pid, process.name()).ok()?;
        Some(out)
    } else if let Some(status) = exit_status(pid) {
        writeln!(out, "pid {} state exited status {}", pid, status).ok()?;
        Some(out)
    } else {
        None
    }
}
