//! Process spawning and the user-mode loader.
//!
//! `spawn` copies argv and hands the scheduler a thread running
//! `loader_entry` inside the new process; the loader maps the executable,
//! lays out the stack and argv block, and drops to ring 3.

use alloc::sync::Arc;
use alloc::vec::Vec;

use cairn_abi::errors::{Errno, SysResult};
use cairn_abi::io::Prot;
use cairn_abi::process::{Pid, Priority};

use crate::arch::interrupts::{TrapFrame, trap_frame_restore};
use crate::fs::VFS;
use crate::memory::VirtAddr;
use crate::memory::paging::PAGE_SIZE;
use crate::sched::process::Process;
use crate::sched::thread::Thread;
use crate::{config, debug};

/// Per-thread user stack slots, high in the lower half.
const USER_STACKS_BASE: usize = 0x7A30_0000_0000;
const USER_STACK_GUARD: usize = PAGE_SIZE;

/// Where the argv block lands.
const ARGV_BASE: usize = 0x7E00_0000_0000;

/// Creates a process running `argv[0]` and schedules its first thread.
pub fn spawn(argv: &[&str], priority: Priority) -> SysResult<Pid> {
    let vfs = crate::sched::current_process().vfs().fork();
    let process = Process::create(argv, vfs)?;
    let pid = process.pid();

    let thread = Thread::new(process, VirtAddr::from(loader_entry as usize), priority);
    crate::sched::push(thread);

    debug!(Process, "spawned pid {pid} ({})", argv[0]);
    Ok(pid)
}

/// First code of every spawned process, still in kernel mode inside the new
/// address space.
fn loader_entry() -> ! {
    let thread = crate::sched::current_thread();
    let process = thread.process().clone();

    match load(&process, thread.tid() as usize) {
        Ok(frame) => unsafe {
            crate::arch::disable_interrupts();
            trap_frame_restore(&frame)
        },
        Err(errno) => {
            crate::error!(
                "loading {} failed: {}, killing pid {}",
                process.name(),
                errno,
                process.pid()
            );
            process.kill(Errno::ESPAWNFAIL as u64);
            thread.kill();
            thread.set_state(crate::sched::ThreadState::Killed);
            loop {
                crate::sched::thread_yield();
                core::hint::spin_loop();
            }
        }
    }
}

mod elf {
    /// ELF64 file header, the fields the loader reads.
    #[derive(Debug, Clone, Copy)]
    #[repr(C)]
    pub struct Header {
        pub ident_magic: [u8; 4],
        pub ident_class: u8,
        pub ident_data: u8,
        pub ident_version: u8,
        pub ident_abi: u8,
        pub ident_pad: [u8; 8],
        pub kind: u16,
        pub machine: u16,
        pub version: u32,
        pub entry: u64,
        pub phoff: u64,
        pub shoff: u64,
        pub flags: u32,
        pub ehsize: u16,
        pub phentsize: u16,
        pub phnum: u16,
        pub shentsize: u16,
        pub shnum: u16,
        pub shstrndx: u16,
    }

    #[derive(Debug, Clone, Copy)]
    #[repr(C)]
    pub struct ProgramHeader {
        pub kind: u32,
        pub flags: u32,
        pub offset: u64,
        pub vaddr: u64,
        pub paddr: u64,
        pub filesz: u64,
        pub memsz: u64,
        pub align: u64,
    }

    pub const MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
    pub const CLASS_64: u8 = 2;
    pub const DATA_LITTLE: u8 = 1;
    pub const MACHINE_X86_64: u16 = 0x3E;
    pub const KIND_EXEC: u16 = 2;
    pub const PT_LOAD: u32 = 1;
    pub const PF_X: u32 = 1;
    pub const PF_W: u32 = 2;
}

fn read_struct<T: Copy>(bytes: &[u8], offset: usize) -> SysResult<T> {
    if offset + size_of::<T>() > bytes.len() {
        return Err(Errno::ESPAWNFAIL);
    }
    Ok(unsafe { (bytes.as_ptr().add(offset) as *const T).read_unaligned() })
}

/// Maps the executable and builds the ring-3 entry frame.
fn load(process: &Arc<Process>, thread_slot: usize) -> SysResult<TrapFrame> {
    let path = process.vfs().resolve(process.name())?;
    let file = VFS.open(&path)?;

    let size = file.len()?;
    let mut image = alloc::vec![0u8; size];
    let mut read = 0;
    while read < size {
        let count = file.read_at(read as u64, &mut image[read..])?;
        if count == 0 {
            break;
        }
        read += count;
    }

    let header: elf::Header = read_struct(&image, 0)?;
    if header.ident_magic != elf::MAGIC
        || header.ident_class != elf::CLASS_64
        || header.ident_data != elf::DATA_LITTLE
        || header.machine != elf::MACHINE_X86_64
        || header.kind != elf::KIND_EXEC
    {
        return Err(Errno::ESPAWNFAIL);
    }

    // pass 1: map every LOAD writable, copy its payload
    let mut segments: Vec<elf::ProgramHeader> = Vec::new();
    for index in 0..header.phnum as usize {
        let phdr: elf::ProgramHeader = read_struct(
            &image,
            header.phoff as usize + index * header.phentsize as usize,
        )?;
        if phdr.kind != elf::PT_LOAD || phdr.memsz == 0 {
            continue;
        }

        let start = VirtAddr::from(phdr.vaddr as usize).align_down(PAGE_SIZE);
        let end = VirtAddr::from((phdr.vaddr + phdr.memsz) as usize).align_up(PAGE_SIZE);

        process.space().with_table(|table| {
            for page in crate::memory::paging::Page::iter_pages(
                crate::memory::paging::Page::containing_address(start),
                crate::memory::paging::Page::containing_address(end),
            ) {
                // segments may share an edge page
                if table.mapped(page.virt_addr(), 1) {
                    continue;
                }
                table
                    .alloc_map(
                        page.virt_addr(),
                        page.virt_addr() + PAGE_SIZE,
                        crate::memory::paging::EntryFlags::WRITE
                            | crate::memory::paging::EntryFlags::USER_ACCESSIBLE,
                    )
                    .map_err(|_| Errno::ENOMEM)?;
                crate::arch::paging::invalidate(page.virt_addr());
            }
            Ok(())
        })?;

        let file_bytes = image
            .get(phdr.offset as usize..(phdr.offset + phdr.filesz) as usize)
            .ok_or(Errno::ESPAWNFAIL)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                file_bytes.as_ptr(),
                phdr.vaddr as *mut u8,
                file_bytes.len(),
            );
        }
        segments.push(phdr);
    }
    if segments.is_empty() {
        return Err(Errno::ESPAWNFAIL);
    }

    // pass 2: drop each segment to its requested protection
    for phdr in &segments {
        let mut prot = Prot::READ;
        if phdr.flags & elf::PF_W != 0 {
            prot |= Prot::WRITE;
        }
        if phdr.flags & elf::PF_X != 0 {
            prot |= Prot::EXEC;
        }
        let start = VirtAddr::from(phdr.vaddr as usize).align_down(PAGE_SIZE);
        let len = (phdr.vaddr + phdr.memsz) as usize - start.into_raw();
        process.space().mprotect(start, len, prot)?;
    }

    // the user stack, one region per thread slot
    let stack_base = VirtAddr::from(
        USER_STACKS_BASE + thread_slot * (config::USER_STACK + USER_STACK_GUARD),
    );
    process
        .space()
        .mmap(stack_base, config::USER_STACK, Prot::READ | Prot::WRITE)?;
    let stack_top = stack_base + config::USER_STACK;

    let (argc, argv_user) = copy_argv(process)?;

    let mut frame = TrapFrame::new_user(VirtAddr::from(header.entry as usize), stack_top);
    frame.rdi = argc as u64;
    frame.rsi = argv_user.into_raw() as u64;
    Ok(frame)
}

/// Lays argv out in user memory as `[ptr0 ptr1 .. null][str0\0 str1\0 ..]`.
fn copy_argv(process: &Arc<Process>) -> SysResult<(usize, VirtAddr)> {
    let argv = process.argv();
    let table_bytes = (argv.len() + 1) * size_of::<u64>();
    let string_bytes: usize = argv.iter().map(|arg| arg.len() + 1).sum();

    let base = process.space().mmap(
        VirtAddr::from(ARGV_BASE),
        table_bytes + string_bytes,
        Prot::READ | Prot::WRITE,
    )?;

    let mut string_cursor = base + table_bytes;
    for (index, arg) in argv.iter().enumerate() {
        unsafe {
            (base.into_ptr::<u64>().add(index)).write(string_cursor.into_raw() as u64);
            core::ptr::copy_nonoverlapping(
                arg.as_ptr(),
                string_cursor.into_ptr::<u8>(),
                arg.len(),
            );
            string_cursor.into_ptr::<u8>().add(arg.len()).write(0);
        }
        string_cursor += arg.len() + 1;
    }
    unsafe {
        (base.into_ptr::<u64>().add(argv.len())).write(0);
    }

    Ok((argv.len(), base))
}
