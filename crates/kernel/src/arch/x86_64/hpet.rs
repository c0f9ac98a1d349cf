//! The HPET main counter, the kernel's monotonic time source.

use lazy_static::lazy_static;

use super::acpi::HPET_BASE;
use crate::VirtAddr;

const REG_CAPABILITIES: usize = 0x00;
const REG_CONFIG: usize = 0x10;
const REG_COUNTER: usize = 0xF0;

const CONFIG_ENABLE: u64 = 1;

struct Hpet {
    base: VirtAddr,
    /// femtoseconds per counter tick
    period_fs: u64,
}

impl Hpet {
    fn reg(&self, offset: usize) -> *mut u64 {
        (self.base + offset).into_ptr::<u64>()
    }

    fn read(&self, offset: usize) -> u64 {
        unsafe { self.reg(offset).read_volatile() }
    }

    fn write(&self, offset: usize, value: u64) {
        unsafe { self.reg(offset).write_volatile(value) }
    }

    fn create() -> Self {
        let base = HPET_BASE.into_virt();
        let this = Self {
            base,
            period_fs: 0,
        };
        let period_fs = this.read(REG_CAPABILITIES) >> 32;
        assert!(period_fs != 0, "HPET reports a zero counter period");

        this.write(REG_CONFIG, this.read(REG_CONFIG) | CONFIG_ENABLE);
        Self { base, period_fs }
    }
}

lazy_static! {
    static ref HPET: Hpet = Hpet::create();
}

/// Raw main counter value.
#[inline]
pub fn counter() -> u64 {
    HPET.read(REG_COUNTER)
}

/// Nanoseconds represented by a raw counter value.
#[inline]
pub fn ticks_to_ns(ticks: u64) -> u64 {
    // period is in femtoseconds; split to dodge overflow on large counts
    let fs_per_tick = HPET.period_fs;
    (ticks / 1_000_000) * fs_per_tick + (ticks % 1_000_000) * fs_per_tick / 1_000_000
}

/// Nanoseconds since the counter was enabled.
#[inline]
pub fn counter_ns() -> u64 {
    ticks_to_ns(counter())
}

pub fn busy_sleep_ns(ns: u64) {
    let end = counter_ns() + ns;
    while counter_ns() < end {
        core::hint::spin_loop();
    }
}

pub fn busy_sleep_ms(ms: u64) {
    busy_sleep_ns(ms * 1_000_000);
}
