//! Userspace-visible ABI of the CairnOS kernel.
//!
//! Everything in this crate is `repr(C)` or a plain integer space and is
//! shared bit-for-bit between the kernel and userland. Changing any layout
//! here is an ABI break.
#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod consts;
pub mod errors;
pub mod io;
pub mod ioring;
pub mod process;
pub mod syscalls;

/// Value returned by every syscall on failure, see [`errors::Errno`] for the
/// reason.
pub const ERR: usize = !0;

/// Clock value in nanoseconds since boot.
pub type Clocks = u64;
/// Timeout sentinel disabling the deadline of a blocking operation.
pub const CLOCKS_NEVER: Clocks = Clocks::MAX;
