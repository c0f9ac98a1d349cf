//! Thin trampolines from the register ABI to kernel functions.
//!
//! Convention: number in `rax`, arguments in `rdi rsi rdx r10 r8`, result
//! in `rax`. Failures return [`ERR`] with the reason stored as the
//! thread's errno, retrievable through the `error` syscall.

pub mod ffi;
pub mod share;

use cairn_abi::ERR;
use cairn_abi::errors::{Errno, SysResult};
use cairn_abi::io::{PollEvents, PollFd, Prot, SeekWhence, Stat};
use cairn_abi::process::{Priority, RawSlice};
use cairn_abi::syscalls::Syscall;

use alloc::vec::Vec;

use crate::arch::interrupts::TrapFrame;
use crate::fs::{FileRef, VFS};
use crate::memory::VirtAddr;
use crate::sched;
use crate::utils::types::LabelName;

pub fn dispatch(frame: &mut TrapFrame) {
    // syscalls may block; the interrupt gate cleared IF
    unsafe { crate::arch::enable_interrupts() };

    let number = frame.rax as u16;
    let (a, b, c, d, e) = (
        frame.rdi as usize,
        frame.rsi as usize,
        frame.rdx as usize,
        frame.r10 as usize,
        frame.r8 as usize,
    );

    let Ok(syscall) = Syscall::try_from(number) else {
        sched::current_thread().set_errno(Errno::ENOSYS);
        frame.rax = ERR as u64;
        return;
    };

    // these switch the frame away and must not touch rax afterwards
    match syscall {
        Syscall::ProcessExit => return sched::exit_current_process(a as u64, frame),
        Syscall::ThreadExit => return sched::exit_current_thread(frame),
        Syscall::Yield => return sched::schedule(frame),
        _ => {}
    }

    match syscall_inner(syscall, a, b, c, d, e) {
        Ok(value) => frame.rax = value as u64,
        Err(errno) => {
            sched::current_thread().set_errno(errno);
            frame.rax = ERR as u64;
        }
    }
}

fn current_file(fd: usize) -> SysResult<FileRef> {
    sched::current_process()
        .vfs()
        .files
        .lock()
        .get(fd)
        .ok_or(Errno::EBADF)
}

fn resolve_user_path(ptr: usize, len: usize) -> SysResult<cairn_utils::path::PathBuf> {
    let raw = ffi::user_str(ptr, len)?;
    Ok(sched::current_process().vfs().resolve(raw)?)
}

fn syscall_inner(
    syscall: Syscall,
    a: usize,
    b: usize,
    c: usize,
    d: usize,
    e: usize,
) -> SysResult<usize> {
    match syscall {
        Syscall::ProcessExit | Syscall::ThreadExit | Syscall::Yield => unreachable!(),

        Syscall::Spawn => {
            let raw_argv = ffi::user_slice_of::<RawSlice>(a, b)?;
            let mut argv: Vec<&str> = Vec::with_capacity(raw_argv.len());
            for raw in raw_argv.iter() {
                argv.push(ffi::user_str(raw.ptr as usize, raw.len)?);
            }
            let priority = Priority::from_level(c as u8).ok_or(Errno::EINVAL)?;
            let pid = sched::spawn::spawn(&argv, priority)?;
            Ok(pid as usize)
        }

        Syscall::Sleep => {
            crate::wait::sleep(a as u64);
            Ok(0)
        }

        Syscall::LastError => Ok(sched::current_thread()
            .last_errno()
            .map(|errno| errno as usize)
            .unwrap_or(0)),

        Syscall::Pid => Ok(sched::current_process().pid() as usize),
        Syscall::Tid => Ok(sched::current_thread().tid() as usize),
        Syscall::Uptime => Ok(crate::time::uptime() as usize),

        Syscall::Open => {
            let path = resolve_user_path(a, b)?;
            let file = VFS.open(&path)?;
            Ok(sched::current_process().vfs().files.lock().insert(file)?)
        }

        Syscall::Open2 => {
            let path = resolve_user_path(a, b)?;
            let out = ffi::user_mut::<[u64; 2]>(c)?;
            let (first, second) = VFS.open2(&path)?;

            let files = &sched::current_process().vfs().files;
            let mut files = files.lock();
            let first_fd = files.insert(first)?;
            match files.insert(second) {
                Ok(second_fd) => {
                    *out = [first_fd as u64, second_fd as u64];
                    Ok(0)
                }
                Err(err) => {
                    let _ = files.remove(first_fd);
                    Err(err.into())
                }
            }
        }

        Syscall::Close => {
            sched::current_process()
                .vfs()
                .files
                .lock()
                .remove(a)
                .ok_or(Errno::EBADF)?;
            Ok(0)
        }

        Syscall::Read => {
            let file = current_file(a)?;
            let buf = ffi::user_slice_mut(b, c)?;
            Ok(file.read(buf)?)
        }

        Syscall::Write => {
            let file = current_file(a)?;
            let buf = ffi::user_slice(b, c)?;
            Ok(file.write(buf)?)
        }

        Syscall::Seek => {
            let file = current_file(a)?;
            let whence = SeekWhence::try_from(c as u64).map_err(|_| Errno::EINVAL)?;
            Ok(file.seek(b as i64, whence)? as usize)
        }

        Syscall::Ioctl => {
            let file = current_file(a)?;
            let arg = ffi::user_slice_mut(c, d)?;
            Ok(file.ioctl(b as u64, arg)?)
        }

        Syscall::Realpath => {
            let out = ffi::user_slice_mut(a, b)?;
            let raw = ffi::user_str(c, d)?;
            let resolved = sched::current_process().vfs().realpath(raw)?;
            let bytes = resolved.as_bytes();
            if bytes.len() >= out.len() {
                return Err(Errno::ENAMETOOLONG);
            }
            out[..bytes.len()].copy_from_slice(bytes);
            out[bytes.len()] = 0;
            Ok(bytes.len())
        }

        Syscall::Chdir => {
            let raw = ffi::user_str(a, b)?;
            sched::current_process().vfs().chdir(raw)?;
            Ok(0)
        }

        Syscall::Poll => {
            let fds = ffi::user_slice_of::<PollFd>(a, b)?;
            let timeout = c as u64;

            let mut files: Vec<(FileRef, PollEvents)> = Vec::with_capacity(fds.len());
            for fd in fds.iter() {
                files.push((
                    current_file(fd.fd as usize)?,
                    PollEvents::from_bits_truncate(fd.requested as u64),
                ));
            }

            let mut occurred = alloc::vec![PollEvents::empty(); files.len()];
            let ready = crate::fs::poll(&files, &mut occurred, timeout)?;

            for (fd, events) in fds.iter_mut().zip(occurred) {
                fd.occurred = events.bits() as u16;
            }
            Ok(ready)
        }

        Syscall::Stat => {
            let path = resolve_user_path(a, b)?;
            let out = ffi::user_mut::<Stat>(c)?;
            *out = VFS.stat(&path)?;
            Ok(0)
        }

        Syscall::Mmap => {
            let process = sched::current_process();
            let addr = process
                .space()
                .mmap(VirtAddr::from(a), b, Prot(c as u64))?;
            Ok(addr.into_raw())
        }

        Syscall::Munmap => {
            sched::current_process().space().munmap(VirtAddr::from(a), b)?;
            Ok(0)
        }

        Syscall::Mprotect => {
            sched::current_process()
                .space()
                .mprotect(VirtAddr::from(a), b, Prot(c as u64))?;
            Ok(0)
        }

        Syscall::IoringSetup => {
            let addr_inout = ffi::user_mut::<u64>(a)?;
            let process = sched::current_process();
            let (id, base) = crate::ioring::setup(
                &process,
                VirtAddr::from(*addr_inout as usize),
                b,
                c,
            )?;
            *addr_inout = base.into_raw() as u64;
            Ok(id as usize)
        }

        Syscall::IoringTeardown => {
            crate::ioring::teardown(&sched::current_process(), a as u64)?;
            Ok(0)
        }

        Syscall::IoringEnter => {
            crate::ioring::enter(&sched::current_process(), a as u64, b, c)
        }

        Syscall::Share => {
            let key_out = ffi::user_mut::<u64>(a)?;
            let file = current_file(b)?;
            share::share(file, key_out, c as u64)?;
            Ok(0)
        }

        Syscall::Claim => {
            let file = share::claim(a as u64)?;
            Ok(sched::current_process().vfs().files.lock().insert(file)?)
        }

        Syscall::Bind => {
            let fs_name = ffi::user_str(a, b)?;
            let label = ffi::user_str(c, d)?;
            let fs = crate::fs::create_fs(fs_name)?;
            let label = LabelName::try_from(label)?;
            VFS.mount(label, fs)?;
            let _ = e;
            Ok(0)
        }

        Syscall::Dup => Ok(sched::current_process().vfs().files.lock().dup(a)?),
        Syscall::Dup2 => Ok(sched::current_process().vfs().files.lock().dup2(a, b)?),
    }
}
