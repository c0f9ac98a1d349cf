/// The closed errno space of the kernel.
///
/// The usual POSIX names keep their usual meanings; the tail of the enum
/// holds local extensions. Stored per thread, retrieved with the `error`
/// syscall after a call returned [`crate::ERR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    ESRCH = 3,
    EINTR = 4,
    EIO = 5,
    EBADF = 9,
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    EBUSY = 16,
    EEXIST = 17,
    ENOTDIR = 20,
    EISDIR = 21,
    EINVAL = 22,
    EMFILE = 24,
    ENOSPC = 28,
    ESPIPE = 29,
    EPIPE = 32,
    ENAMETOOLONG = 36,
    ENOSYS = 38,
    ENOTEMPTY = 39,
    EOVERFLOW = 75,
    ECANCELED = 125,
    ETIMEDOUT = 110,
    /// A request/control code was malformed.
    EREQ = 200,
    /// A path failed to parse or canonicalise.
    EBADPATH = 201,
    /// An unknown flag was passed in a path trailer or an operation.
    EBADFLAG = 202,
    /// An ioctl request code is not known to the file.
    EUNKNOWNCTL = 203,
    /// Spawning a process failed before its first thread ran.
    ESPAWNFAIL = 204,
    /// No mounted volume carries the requested label.
    ENOLABEL = 205,
    /// The other side of a connection-like file is gone.
    EDISCONNECTED = 206,
}

impl Errno {
    /// Short human-readable description, used by panic dumps and `sys:`.
    pub fn as_str(&self) -> &'static str {
        use Errno::*;
        match *self {
            EPERM => "operation not permitted",
            ENOENT => "no such file or directory",
            ESRCH => "no such process",
            EINTR => "interrupted",
            EIO => "input/output error",
            EBADF => "bad file descriptor",
            EAGAIN => "resource temporarily unavailable",
            ENOMEM => "out of memory",
            EACCES => "permission denied",
            EFAULT => "bad address",
            EBUSY => "resource busy",
            EEXIST => "already exists",
            ENOTDIR => "not a directory",
            EISDIR => "is a directory",
            EINVAL => "invalid argument",
            EMFILE => "too many open files",
            ENOSPC => "no space left",
            ESPIPE => "illegal seek",
            EPIPE => "broken pipe",
            ENAMETOOLONG => "name too long",
            ENOSYS => "syscall not implemented",
            ENOTEMPTY => "directory not empty",
            EOVERFLOW => "value too large",
            ECANCELED => "operation canceled",
            ETIMEDOUT => "operation timed out",
            EREQ => "malformed request",
            EBADPATH => "malformed path",
            EBADFLAG => "unknown flag",
            EUNKNOWNCTL => "unknown control code",
            ESPAWNFAIL => "spawn failed",
            ENOLABEL => "no such volume label",
            EDISCONNECTED => "peer disconnected",
        }
    }

    /// Encodes into the status slot of a CQE (0 means success there).
    #[inline(always)]
    pub const fn into_status(self) -> u32 {
        self as u32
    }

    pub const fn from_status(status: u32) -> Option<Self> {
        use Errno::*;
        // keep in sync with the discriminants above
        Some(match status {
            0 => return None,
            1 => EPERM,
            2 => ENOENT,
            3 => ESRCH,
            4 => EINTR,
            5 => EIO,
            9 => EBADF,
            11 => EAGAIN,
            12 => ENOMEM,
            13 => EACCES,
            14 => EFAULT,
            16 => EBUSY,
            17 => EEXIST,
            20 => ENOTDIR,
            21 => EISDIR,
            22 => EINVAL,
            24 => EMFILE,
            28 => ENOSPC,
            29 => ESPIPE,
            32 => EPIPE,
            36 => ENAMETOOLONG,
            38 => ENOSYS,
            39 => ENOTEMPTY,
            75 => EOVERFLOW,
            110 => ETIMEDOUT,
            125 => ECANCELED,
            200 => EREQ,
            201 => EBADPATH,
            202 => EBADFLAG,
            203 => EUNKNOWNCTL,
            204 => ESPAWNFAIL,
            205 => ENOLABEL,
            206 => EDISCONNECTED,
            _ => EREQ,
        })
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} ({:?})", self.as_str(), self)
    }
}

/// Result alias used by every kernel entry point that surfaces errno.
pub type SysResult<T> = Result<T, Errno>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for errno in [
            Errno::EPERM,
            Errno::EBADF,
            Errno::ECANCELED,
            Errno::EBADPATH,
            Errno::EDISCONNECTED,
        ] {
            assert_eq!(Errno::from_status(errno.into_status()), Some(errno));
        }
        assert_eq!(Errno::from_status(0), None);
    }
}
