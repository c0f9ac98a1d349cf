use bitflags::bitflags;
use int_enum::IntEnum;

bitflags! {
    /// Poll readiness events. Error-class events are always reported, even
    /// if they were not requested.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PollEvents: u64 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const ERROR = 1 << 2;
        const HUP   = 1 << 3;
        const NVAL  = 1 << 4;
    }
}

impl PollEvents {
    /// The events a poller receives regardless of its request mask.
    pub const ALWAYS: Self = Self::ERROR.union(Self::HUP).union(Self::NVAL);
}

/// Seek origin for the `seek` syscall and `sqe.offset` resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
#[repr(u64)]
pub enum SeekWhence {
    Set = 1,
    End = 2,
    Cur = 3,
}

/// What kind of object a path resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntEnum)]
#[repr(u8)]
pub enum FileKind {
    #[default]
    File = 0,
    Directory = 1,
    Device = 2,
}

/// Result of the `stat` syscall.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Stat {
    pub size: u64,
    pub kind: u8,
    _pad: [u8; 7],
}

impl Stat {
    pub fn new(size: u64, kind: FileKind) -> Self {
        Self {
            size,
            kind: kind as u8,
            _pad: [0; 7],
        }
    }
}

/// One entry of the `poll` syscall's array.
///
/// `requested` is filled by the caller, `occurred` by the kernel.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PollFd {
    pub fd: u64,
    pub requested: u16,
    pub occurred: u16,
    _pad: u32,
}

impl PollFd {
    pub fn new(fd: u64, requested: PollEvents) -> Self {
        Self {
            fd,
            requested: requested.bits() as u16,
            occurred: 0,
            _pad: 0,
        }
    }
}

/// Memory protection flags for `mmap`/`mprotect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Prot(pub u64);

bitflags! {
    impl Prot: u64 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}
