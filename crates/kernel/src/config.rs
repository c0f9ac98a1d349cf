//! Build-time configuration knobs.

use cairn_abi::Clocks;

/// Load the firmware memory map into the frame allocator one entry at a
/// time, the first time the free list runs dry, instead of all at boot.
pub const PMM_LAZY: bool = true;

/// APIC timer tick rate per CPU.
pub const TIMER_HZ: u64 = 1024;

/// Length of one scheduling time slice in nanoseconds.
pub const TIME_SLICE: Clocks = 2_000_000;

/// Size of a thread's kernel stack in bytes.
pub const KERNEL_STACK: usize = 0x8000;

/// Size of a CPU's idle-loop stack in bytes.
pub const IDLE_STACK: usize = 0x4000;

/// Size of a thread's user stack in bytes.
pub const USER_STACK: usize = 0x20000;

/// Initial size of the kernel heap in bytes.
pub const KERNEL_HEAP: usize = 16 * 1024 * 1024;

/// Hard cap on CPUs the kernel will bring up.
pub const MAX_CPUS: usize = 32;

pub use cairn_abi::consts::{MAX_ARGV, MAX_ARGV_BYTES, MAX_BLOCKERS_PER_THREAD, MAX_FD};
