//! The shared submission/completion ring.
//!
//! The control page, SQ and CQ live in one physically contiguous block,
//! mapped user-visible into the owning process and aliased through the
//! direct map for the kernel. Indices are free-running 32-bit counters;
//! the kernel writes `shead`/`ctail` with release stores and reads the
//! user-owned `stail`/`chead` with acquire loads.
//!
//! SQEs are dispatched in submission order by the entering thread; an op
//! that must wait blocks that thread through the wait subsystem with the
//! SQE's own timeout. CQEs therefore complete in submission order.

use core::sync::atomic::Ordering;

use alloc::sync::Arc;
use alloc::vec::Vec;

use cairn_abi::errors::{Errno, SysResult};
use cairn_abi::io::PollEvents;
use cairn_abi::ioring::{
    Cqe, IO_CANCEL_ALL, IO_CANCEL_ANY, IO_OFF_CUR, IORING_MAX_ENTRIES, IoOp, RingCtrl, RingId,
    SQE_HARDLINK, SQE_LINK, SQE_LOAD0, SQE_LOAD1, SQE_LOAD2, SQE_LOAD3, SQE_LOAD4, SQE_SAVE, Sqe,
    sqe_reg_at,
};
use cairn_abi::{CLOCKS_NEVER, Clocks};
use slab::Slab;

use crate::fs::FileRef;
use crate::memory::frame_allocator::{self, Frame};
use crate::memory::paging::PAGE_SIZE;
use crate::memory::{VirtAddr, align_up};
use crate::sched::Process;
use crate::utils::locks::Mutex;
use crate::wait::WaitQueue;
use crate::wait_until;

/// The rings of one process, keyed by ring id.
pub struct RingTable {
    rings: Mutex<Slab<Arc<IoRing>>>,
}

impl RingTable {
    pub fn new() -> Self {
        Self {
            rings: Mutex::new(Slab::new()),
        }
    }

    fn insert(&self, ring: Arc<IoRing>) -> RingId {
        self.rings.lock().insert(ring) as RingId
    }

    fn get(&self, id: RingId) -> SysResult<Arc<IoRing>> {
        self.rings
            .lock()
            .get(id as usize)
            .cloned()
            .ok_or(Errno::EBADF)
    }

    fn remove(&self, id: RingId) -> SysResult<Arc<IoRing>> {
        let mut rings = self.rings.lock();
        if rings.contains(id as usize) {
            Ok(rings.remove(id as usize))
        } else {
            Err(Errno::EBADF)
        }
    }
}

impl Default for RingTable {
    fn default() -> Self {
        Self::new()
    }
}

pub struct IoRing {
    sentries: usize,
    centries: usize,
    smask: u32,
    cmask: u32,
    frames: Frame,
    page_count: usize,
    kernel_base: VirtAddr,
    user_base: VirtAddr,
    /// woken on every completion, the `wait_min` sleep target
    cqe_queue: WaitQueue,
}

unsafe impl Send for IoRing {}
unsafe impl Sync for IoRing {}

const CTRL_PAGES: usize = 1;

impl IoRing {
    fn layout(sentries: usize, centries: usize) -> usize {
        let bytes =
            CTRL_PAGES * PAGE_SIZE + sentries * size_of::<Sqe>() + centries * size_of::<Cqe>();
        align_up(bytes, PAGE_SIZE) / PAGE_SIZE
    }

    #[inline]
    fn ctrl(&self) -> &RingCtrl {
        unsafe { &*self.kernel_base.into_ptr::<RingCtrl>() }
    }

    #[inline]
    fn sqe_ptr(&self, index: u32) -> *const Sqe {
        let base = self.kernel_base + CTRL_PAGES * PAGE_SIZE;
        let slot = (index & self.smask) as usize;
        unsafe { base.into_ptr::<Sqe>().add(slot) }
    }

    #[inline]
    fn cqe_ptr(&self, index: u32) -> *mut Cqe {
        let base = self.kernel_base + CTRL_PAGES * PAGE_SIZE + self.sentries * size_of::<Sqe>();
        let slot = (index & self.cmask) as usize;
        unsafe { base.into_ptr::<Cqe>().add(slot) }
    }

    pub fn user_base(&self) -> VirtAddr {
        self.user_base
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// User-visible completions not yet consumed.
    fn completions_pending(&self) -> u32 {
        let ctail = self.ctrl().ctail.load(Ordering::Acquire);
        let chead = self.ctrl().chead.load(Ordering::Acquire);
        ctail.wrapping_sub(chead)
    }

    fn cq_full(&self) -> bool {
        self.completions_pending() as usize >= self.centries
    }

    fn push_cqe(&self, cqe: Cqe) {
        let ctail = self.ctrl().ctail.load(Ordering::Relaxed);
        unsafe { self.cqe_ptr(ctail).write_volatile(cqe) };
        self.ctrl().ctail.store(ctail.wrapping_add(1), Ordering::Release);
        self.cqe_queue.wake_all();
    }
}

impl Drop for IoRing {
    fn drop(&mut self) {
        frame_allocator::deallocate_contiguous(self.frames, self.page_count);
    }
}

/// Creates a ring and maps it into `process` at `addr` (or wherever the
/// address-space cursor chooses). Returns the ring id.
pub fn setup(
    process: &Arc<Process>,
    addr: VirtAddr,
    sentries: usize,
    centries: usize,
) -> SysResult<(RingId, VirtAddr)> {
    for entries in [sentries, centries] {
        if entries == 0 || !entries.is_power_of_two() || entries > IORING_MAX_ENTRIES {
            return Err(Errno::EINVAL);
        }
    }

    let page_count = IoRing::layout(sentries, centries);
    let frames = frame_allocator::allocate_contiguous(
        page_count,
        1,
        crate::memory::PhysAddr::from(usize::MAX),
    )
    .ok_or(Errno::ENOMEM)?;

    let kernel_base = frames.virt_addr();
    unsafe {
        core::ptr::write_bytes(kernel_base.into_ptr::<u8>(), 0, page_count * PAGE_SIZE);
    }

    let user_base = match process
        .space()
        .map_shared(addr, frames.start_address(), page_count)
    {
        Ok(user_base) => user_base,
        Err(err) => {
            frame_allocator::deallocate_contiguous(frames, page_count);
            return Err(err);
        }
    };

    let ring = Arc::new(IoRing {
        sentries,
        centries,
        smask: sentries as u32 - 1,
        cmask: centries as u32 - 1,
        frames,
        page_count,
        kernel_base,
        user_base,
        cqe_queue: WaitQueue::new(),
    });

    Ok((process.rings.insert(ring), user_base))
}

/// Unmaps and destroys a ring.
pub fn teardown(process: &Arc<Process>, id: RingId) -> SysResult<()> {
    let ring = process.rings.remove(id)?;
    process
        .space()
        .munmap(ring.user_base, ring.page_count * PAGE_SIZE)?;
    Ok(())
}

/// One consumed SQE while its batch is processed.
struct PendingSqe {
    sqe: Sqe,
    cancelled: bool,
}

/// Consumes up to `submit` SQEs and dispatches them in order; afterwards
/// waits until at least `wait_min` completions are visible to userspace.
/// Returns the number of SQEs processed.
pub fn enter(
    process: &Arc<Process>,
    id: RingId,
    submit: usize,
    wait_min: usize,
) -> SysResult<usize> {
    let ring = process.rings.get(id)?;

    let shead = ring.ctrl().shead.load(Ordering::Relaxed);
    let stail = ring.ctrl().stail.load(Ordering::Acquire);
    let available = stail.wrapping_sub(shead) as usize;
    let count = available.min(submit);

    // the whole batch is read up front so CANCEL can reach queued entries
    let mut batch: Vec<PendingSqe> = (0..count)
        .map(|i| PendingSqe {
            sqe: unsafe { ring.sqe_ptr(shead.wrapping_add(i as u32)).read_volatile() },
            cancelled: false,
        })
        .collect();

    let mut processed = 0;
    // set when a LINK predecessor failed; cleared at the end of the chain
    let mut chain_broken = false;

    for i in 0..batch.len() {
        if ring.cq_full() {
            break;
        }

        let sqe = apply_register_loads(&ring, batch[i].sqe);
        let flags = sqe.flags;

        let cqe = if chain_broken || batch[i].cancelled {
            Cqe::err(sqe.op, sqe.data, Errno::ECANCELED)
        } else {
            dispatch(process, &sqe, &mut batch[i + 1..])
        };

        if let Some(reg) = sqe_reg_at(flags, SQE_SAVE) {
            ring.ctrl().regs[reg].store(cqe.result, Ordering::Release);
        }

        // LINK gates the next SQE on success; HARDLINK never gates; an
        // unflagged SQE ends the chain
        if flags & SQE_LINK != 0 {
            if !cqe.is_ok() {
                chain_broken = true;
            }
        } else if flags & SQE_HARDLINK == 0 {
            chain_broken = false;
        }

        ring.push_cqe(cqe);
        ring.ctrl()
            .shead
            .store(shead.wrapping_add(i as u32 + 1), Ordering::Release);
        processed += 1;
    }

    if wait_min != 0 {
        let target = (wait_min as u32).min(ring.centries as u32);
        wait_until!(&ring.cqe_queue, ring.completions_pending() >= target);
    }

    Ok(processed)
}

fn apply_register_loads(ring: &IoRing, mut sqe: Sqe) -> Sqe {
    let regs = &ring.ctrl().regs;
    let load = |shift| sqe_reg_at(sqe.flags, shift).map(|reg| regs[reg].load(Ordering::Acquire));

    if let Some(value) = load(SQE_LOAD0) {
        sqe.arg0 = value;
    }
    if let Some(value) = load(SQE_LOAD1) {
        sqe.arg1 = value;
    }
    if let Some(value) = load(SQE_LOAD2) {
        sqe.arg2 = value;
    }
    if let Some(value) = load(SQE_LOAD3) {
        sqe.arg3 = value;
    }
    if let Some(value) = load(SQE_LOAD4) {
        sqe.arg4 = value;
    }
    sqe
}

fn fd_file(process: &Arc<Process>, fd: u64) -> Result<FileRef, Errno> {
    process
        .vfs()
        .files
        .lock()
        .get(fd as usize)
        .ok_or(Errno::EBADF)
}

/// Waits until `file` reports any of `events` (error events always count),
/// bounded by the SQE timeout. Returns the events seen.
fn await_readiness(file: &FileRef, events: PollEvents, timeout: Clocks) -> Result<PollEvents, Errno> {
    let deadline = if timeout == CLOCKS_NEVER {
        CLOCKS_NEVER
    } else {
        crate::time::uptime() + timeout
    };

    loop {
        let report = file.poll(events).map_err(Errno::from)?;
        let seen = report.ready & (events | PollEvents::ALWAYS);
        if !seen.is_empty() {
            return Ok(seen);
        }

        let now = crate::time::uptime();
        if deadline <= now {
            return Err(Errno::ETIMEDOUT);
        }
        let remaining = if deadline == CLOCKS_NEVER {
            CLOCKS_NEVER
        } else {
            deadline - now
        };

        let Some(queue) = report.queue else {
            return Ok(report.ready);
        };
        match crate::wait::block(&queue, remaining) {
            crate::wait::WaitResult::Timeout => return Err(Errno::ETIMEDOUT),
            crate::wait::WaitResult::Dead => return Err(Errno::ECANCELED),
            _ => {}
        }
    }
}

fn dispatch(process: &Arc<Process>, sqe: &Sqe, queued: &mut [PendingSqe]) -> Cqe {
    let result: Result<u64, Errno> = match IoOp::try_from(sqe.op) {
        Ok(IoOp::Nop) => Ok(0),

        Ok(IoOp::Read) => read_op(process, sqe),
        Ok(IoOp::Write) => write_op(process, sqe),

        Ok(IoOp::Poll) => fd_file(process, sqe.arg0).and_then(|file| {
            let events = PollEvents::from_bits_truncate(sqe.arg1);
            await_readiness(&file, events, sqe.timeout).map(|seen| seen.bits())
        }),

        Ok(IoOp::Cancel) => {
            let target = sqe.arg0;
            let all = sqe.arg1 & IO_CANCEL_ALL != 0;
            let any = sqe.arg1 & IO_CANCEL_ANY != 0;

            let mut matched = 0u64;
            for pending in queued.iter_mut() {
                if pending.cancelled {
                    continue;
                }
                if any || pending.sqe.data == target {
                    pending.cancelled = true;
                    matched += 1;
                    if !all {
                        break;
                    }
                }
            }
            if matched == 0 { Err(Errno::ENOENT) } else { Ok(matched) }
        }

        Err(_) => Err(Errno::EREQ),
    };

    match result {
        Ok(value) => Cqe::ok(sqe.op, sqe.data, value),
        Err(errno) => Cqe::err(sqe.op, sqe.data, errno),
    }
}

fn read_op(process: &Arc<Process>, sqe: &Sqe) -> Result<u64, Errno> {
    let file = fd_file(process, sqe.arg0)?;
    let buf = crate::syscalls::ffi::user_slice_mut(sqe.arg1 as usize, sqe.arg2 as usize)?;

    if sqe.timeout != CLOCKS_NEVER {
        await_readiness(&file, PollEvents::READ, sqe.timeout)?;
    }

    let count = if sqe.offset() == IO_OFF_CUR {
        file.read(buf)
    } else {
        file.read_at(sqe.arg3, buf)
    }
    .map_err(Errno::from)?;
    Ok(count as u64)
}

fn write_op(process: &Arc<Process>, sqe: &Sqe) -> Result<u64, Errno> {
    let file = fd_file(process, sqe.arg0)?;
    let buf = crate::syscalls::ffi::user_slice(sqe.arg1 as usize, sqe.arg2 as usize)?;

    if sqe.timeout != CLOCKS_NEVER {
        await_readiness(&file, PollEvents::WRITE, sqe.timeout)?;
    }

    let count = if sqe.offset() == IO_OFF_CUR {
        file.write(buf)
    } else {
        file.write_at(sqe.arg3, buf)
    }
    .map_err(Errno::from)?;
    Ok(count as u64)
}
