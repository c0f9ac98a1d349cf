use int_enum::IntEnum;

/// Syscall ordinals.
///
/// Ordinals 21..=23 once belonged to a never-specified local socket surface
/// (`announce`/`dial`/`accept`) and stay reserved so later numbers do not
/// shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
#[repr(u16)]
pub enum Syscall {
    ProcessExit = 0,
    ThreadExit = 1,
    Spawn = 2,
    Sleep = 3,
    LastError = 4,
    Pid = 5,
    Tid = 6,
    Uptime = 7,
    Open = 8,
    Close = 9,
    Read = 10,
    Write = 11,
    Seek = 12,
    Ioctl = 13,
    Realpath = 14,
    Chdir = 15,
    Poll = 16,
    Stat = 17,
    Mmap = 18,
    Munmap = 19,
    Mprotect = 20,
    IoringSetup = 24,
    IoringTeardown = 25,
    IoringEnter = 26,
    Share = 27,
    Claim = 28,
    Bind = 29,
    Yield = 30,
    Dup = 31,
    Dup2 = 32,
    /// Open a file that yields a pair of descriptors (e.g. `dev:/pipe`).
    Open2 = 33,
}
