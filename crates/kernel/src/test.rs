//! The in-kernel test harness: collects `#[test_case]` functions, orders
//! them so the low-level subsystems run first, and reports through QEMU's
//! debug-exit device.

use core::any::type_name;

use alloc::vec::Vec;

pub const EXIT_SUCCESS: u8 = 0x10;
pub const EXIT_FAILURE: u8 = 0x11;

pub trait Testable {
    fn run(&self);

    #[inline(always)]
    fn name(&self) -> &'static str {
        type_name::<Self>()
    }

    #[inline(always)]
    fn priority(&self) -> TestPriority {
        test_priority::<Self>()
    }
}

/// Lower layers run first so a paging bug fails the paging test, not some
/// I/O ring test three layers up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TestPriority {
    Memory,
    Sched,
    Fs,
    Late,
}

const fn test_priority<T: ?Sized>() -> TestPriority {
    const {
        let name = type_name::<T>();
        if const_str::contains!(name, "memory::") {
            TestPriority::Memory
        } else if const_str::contains!(name, "sched::") || const_str::contains!(name, "wait::") {
            TestPriority::Sched
        } else if const_str::contains!(name, "fs::") {
            TestPriority::Fs
        } else {
            TestPriority::Late
        }
    }
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        self();
    }
}

pub fn test_runner(tests: &[&dyn Testable]) {
    let mut ordered: Vec<&&dyn Testable> = tests.iter().collect();
    ordered.sort_by_key(|test| test.priority());

    crate::logln!("running {} tests", ordered.len());
    for test in ordered {
        crate::logln!("test {} ...", test.name());
        let before = crate::time!(us);
        test.run();
        crate::logln!("  ok ({}us)", crate::time!(us) - before);
    }
    crate::logln!("all tests passed");
}

mod e2e {
    use alloc::sync::Arc;

    use cairn_abi::io::Prot;
    use cairn_abi::ioring::{
        Cqe, IoOp, RingCtrl, SQE_LINK, SQE_LOAD2, SQE_SAVE, Sqe, sqe_reg_encode,
    };
    use cairn_abi::{CLOCKS_NEVER, errors::Errno};
    use cairn_utils::make_path;
    use core::sync::atomic::Ordering;

    use crate::fs::VFS;
    use crate::memory::VirtAddr;
    use crate::memory::paging::PAGE_SIZE;
    use crate::sched::{self, Process};

    /// Userspace's half of the ring protocol, driven from the test.
    struct RingSide {
        ctrl: *mut RingCtrl,
        sq: *mut Sqe,
        cq: *mut Cqe,
        smask: u32,
        cmask: u32,
    }

    impl RingSide {
        fn new(base: VirtAddr, sentries: usize, centries: usize) -> Self {
            Self {
                ctrl: base.into_ptr::<RingCtrl>(),
                sq: (base + PAGE_SIZE).into_ptr::<Sqe>(),
                cq: (base + PAGE_SIZE + sentries * size_of::<Sqe>()).into_ptr::<Cqe>(),
                smask: sentries as u32 - 1,
                cmask: centries as u32 - 1,
            }
        }

        fn push(&self, sqe: Sqe) {
            unsafe {
                let tail = (*self.ctrl).stail.load(Ordering::Relaxed);
                self.sq.add((tail & self.smask) as usize).write_volatile(sqe);
                (*self.ctrl).stail.store(tail.wrapping_add(1), Ordering::Release);
            }
        }

        fn pop(&self) -> Option<Cqe> {
            unsafe {
                let head = (*self.ctrl).chead.load(Ordering::Relaxed);
                let tail = (*self.ctrl).ctail.load(Ordering::Acquire);
                if head == tail {
                    return None;
                }
                let cqe = self.cq.add((head & self.cmask) as usize).read_volatile();
                (*self.ctrl).chead.store(head.wrapping_add(1), Ordering::Release);
                Some(cqe)
            }
        }
    }

    fn setup_ring(process: &Arc<Process>, entries: usize) -> (u64, RingSide) {
        let (id, base) = crate::ioring::setup(process, VirtAddr::null(), entries, entries)
            .expect("ring setup failed");
        (id, RingSide::new(base, entries, entries))
    }

    fn user_buffer(process: &Arc<Process>, len: usize) -> VirtAddr {
        process
            .space()
            .mmap(VirtAddr::null(), len, Prot::READ | Prot::WRITE)
            .expect("buffer mmap failed")
    }

    #[test_case]
    fn ring_sequential_reads() {
        let process = sched::current_process();

        let hello = VFS.open(&make_path!("tmp", "hello.txt?create")).unwrap();
        hello.write(b"hello\n").unwrap();

        let fd = process.vfs().files.lock().insert(hello).unwrap();
        let (id, side) = setup_ring(&process, 8);
        let buf = user_buffer(&process, PAGE_SIZE);

        side.push(Sqe::read(0, CLOCKS_NEVER, 1, fd as u64, buf.into_raw() as u64, 3, 0));
        side.push(Sqe::read(
            0,
            CLOCKS_NEVER,
            2,
            fd as u64,
            (buf + 3usize).into_raw() as u64,
            3,
            3,
        ));

        let processed = crate::ioring::enter(&process, id, 2, 2).unwrap();
        assert_eq!(processed, 2);

        let first = side.pop().unwrap();
        let second = side.pop().unwrap();
        assert!(first.is_ok() && second.is_ok());
        assert_eq!(first.data, 1);
        assert_eq!(second.data, 2);

        let read_back = unsafe { core::slice::from_raw_parts(buf.into_ptr::<u8>(), 6) };
        assert_eq!(read_back, b"hello\n");

        crate::ioring::teardown(&process, id).unwrap();
        let _ = process.vfs().files.lock().remove(fd);
    }

    #[test_case]
    fn ring_link_failure_cancels_successor() {
        let process = sched::current_process();

        let hello = VFS.open(&make_path!("tmp", "hello.txt?create")).unwrap();
        let fd = process.vfs().files.lock().insert(hello).unwrap();

        let (id, side) = setup_ring(&process, 8);
        let buf = user_buffer(&process, PAGE_SIZE);

        side.push(Sqe::read(
            SQE_LINK,
            CLOCKS_NEVER,
            1,
            9999, // nobody's fd
            buf.into_raw() as u64,
            3,
            0,
        ));
        side.push(Sqe::write(0, CLOCKS_NEVER, 2, fd as u64, buf.into_raw() as u64, 3, 0));

        crate::ioring::enter(&process, id, 2, 2).unwrap();

        let first = side.pop().unwrap();
        let second = side.pop().unwrap();
        assert_eq!(first.errno(), Some(Errno::EBADF));
        assert_eq!(second.errno(), Some(Errno::ECANCELED));

        crate::ioring::teardown(&process, id).unwrap();
        let _ = process.vfs().files.lock().remove(fd);
    }

    #[test_case]
    fn ring_unflagged_sqes_complete_in_order() {
        let process = sched::current_process();
        let (id, side) = setup_ring(&process, 16);

        for data in 0..10u64 {
            side.push(Sqe::nop(0, CLOCKS_NEVER, data));
        }
        assert_eq!(crate::ioring::enter(&process, id, 10, 10).unwrap(), 10);

        for data in 0..10u64 {
            let cqe = side.pop().unwrap();
            assert!(cqe.is_ok());
            assert_eq!(cqe.data, data);
        }

        crate::ioring::teardown(&process, id).unwrap();
    }

    #[test_case]
    fn ring_registers_stage_arguments() {
        let process = sched::current_process();

        let hello = VFS.open(&make_path!("tmp", "regs.txt?create")).unwrap();
        hello.write(b"0123456789").unwrap();
        let fd = process.vfs().files.lock().insert(hello).unwrap();

        let (id, side) = setup_ring(&process, 8);
        let buf = user_buffer(&process, PAGE_SIZE);

        // stage the read length in register 3, save the result in register 0
        let ctrl = unsafe { &*side.ctrl };
        ctrl.regs[3].store(4, Ordering::Release);

        let flags = sqe_reg_encode(3, SQE_LOAD2) | sqe_reg_encode(0, SQE_SAVE);
        side.push(Sqe::read(flags, CLOCKS_NEVER, 1, fd as u64, buf.into_raw() as u64, 0, 0));

        crate::ioring::enter(&process, id, 1, 1).unwrap();
        let cqe = side.pop().unwrap();
        assert!(cqe.is_ok());
        assert_eq!(cqe.result, 4);
        assert_eq!(ctrl.regs[0].load(Ordering::Acquire), 4);

        crate::ioring::teardown(&process, id).unwrap();
        let _ = process.vfs().files.lock().remove(fd);
    }

    #[test_case]
    fn ring_cancel_reaches_queued_sqes() {
        let process = sched::current_process();
        let (id, side) = setup_ring(&process, 8);

        side.push(Sqe::cancel(0, 1, 42, cairn_abi::ioring::IO_CANCEL_ALL));
        side.push(Sqe::nop(0, CLOCKS_NEVER, 42));
        side.push(Sqe::nop(0, CLOCKS_NEVER, 7));

        assert_eq!(crate::ioring::enter(&process, id, 3, 3).unwrap(), 3);

        let cancel = side.pop().unwrap();
        assert!(cancel.is_ok());
        assert_eq!(cancel.result, 1);

        let cancelled = side.pop().unwrap();
        assert_eq!(cancelled.errno(), Some(Errno::ECANCELED));
        assert_eq!(cancelled.op, IoOp::Nop as u32);

        let survivor = side.pop().unwrap();
        assert!(survivor.is_ok());
        assert_eq!(survivor.data, 7);

        crate::ioring::teardown(&process, id).unwrap();
    }

    #[test_case]
    fn spawn_failure_is_reaped() {
        use cairn_abi::process::Priority;

        let mapped_before = crate::memory::frame_allocator::mapped_frames();
        let pid = crate::sched::spawn::spawn(&["/bin/does-not-exist"], Priority::Medium).unwrap();
        assert!(pid > 0);

        // give the loader thread a chance to run and die
        let mut status = None;
        for _ in 0..100 {
            crate::wait::sleep(10_000_000);
            status = crate::sched::process::exit_status(pid);
            if status.is_some() {
                break;
            }
        }
        assert_eq!(status, Some(Errno::ESPAWNFAIL as u64));

        let text = crate::sched::process::status_text(pid).unwrap();
        assert!(text.contains("exited"));

        // the dead process's pages came back
        crate::wait::sleep(100_000_000);
        let mapped_after = crate::memory::frame_allocator::mapped_frames();
        assert!(mapped_after <= mapped_before + 8, "leaked {mapped_before} -> {mapped_after}");
    }

    #[test_case]
    fn cpu_clocks_accumulate() {
        crate::wait::sleep(50_000_000);
        for cpu in crate::smp::cpus() {
            let idle = cpu.stats.idle_clocks.load(Ordering::Relaxed);
            let active = cpu.stats.active_clocks.load(Ordering::Relaxed);
            assert!(idle + active > 0, "cpu {} never scheduled", cpu.id);
        }
    }
}
