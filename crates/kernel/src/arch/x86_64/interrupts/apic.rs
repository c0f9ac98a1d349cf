use bitfield_struct::bitfield;
use core::sync::atomic::{AtomicU64, Ordering};
use lazy_static::lazy_static;

use crate::arch::x86_64::hpet;
use crate::arch::x86_64::registers::{IA32_APIC_BASE, rdmsr};
use crate::memory::PhysAddr;

use super::handlers::{VECTOR_SPURIOUS, VECTOR_TIMER};

const REG_ID: usize = 0x20;
const REG_EOI: usize = 0xB0;
const REG_SPURIOUS: usize = 0xF0;
const REG_ERROR_STATUS: usize = 0x280;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_TIMER_INITIAL: usize = 0x380;
const REG_TIMER_CURRENT: usize = 0x390;
const REG_TIMER_DIVIDE: usize = 0x3E0;

const LVT_TIMER_PERIODIC: u32 = 1 << 17;
const SPURIOUS_ENABLE: u32 = 1 << 8;

lazy_static! {
    static ref LAPIC_BASE: PhysAddr =
        PhysAddr::from((rdmsr(IA32_APIC_BASE) & 0x000F_FFFF_F000) as usize);
}

#[inline]
fn reg(offset: usize) -> *mut u32 {
    (LAPIC_BASE.into_virt() + offset).into_ptr::<u32>()
}

#[inline]
fn read(offset: usize) -> u32 {
    unsafe { reg(offset).read_volatile() }
}

#[inline]
fn write(offset: usize, value: u32) {
    unsafe { reg(offset).write_volatile(value) }
}

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum DeliveryMode {
    Fixed = 0,
    LowestPriority = 1,
    Smi = 0b010,
    Nmi = 0b100,
    Init = 0b101,
    StartUp = 0b110,
}

impl DeliveryMode {
    const fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Fixed,
            1 => Self::LowestPriority,
            0b010 => Self::Smi,
            0b100 => Self::Nmi,
            0b101 => Self::Init,
            _ => Self::StartUp,
        }
    }

    const fn into_bits(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum DestShorthand {
    None = 0,
    SelfOnly = 1,
    All = 2,
    Others = 3,
}

impl DestShorthand {
    const fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::None,
            1 => Self::SelfOnly,
            2 => Self::All,
            _ => Self::Others,
        }
    }

    const fn into_bits(self) -> u8 {
        self as u8
    }
}

#[bitfield(u64)]
pub struct IcrValue {
    vector: u8,
    #[bits(3)]
    delivery_mode: DeliveryMode,
    dest_logical: bool,
    delivery_pending: bool,
    #[bits(1)]
    __: (),
    assert: bool,
    level_triggered: bool,
    #[bits(2)]
    __: (),
    #[bits(2)]
    dest_shorthand: DestShorthand,
    #[bits(36)]
    __: (),
    destination: u8,
}

fn write_icr(value: IcrValue) {
    let bits = value.into_bits();
    // high dword first, the low write fires the IPI
    write(REG_ICR_HIGH, (bits >> 32) as u32);
    write(REG_ICR_LOW, bits as u32);
    while read(REG_ICR_LOW) & (1 << 12) != 0 {
        core::hint::spin_loop();
    }
}

pub fn lapic_id() -> u32 {
    read(REG_ID) >> 24
}

pub fn send_eoi() {
    write(REG_EOI, 0);
}

/// Enables the local APIC of the calling CPU.
pub fn enable() {
    write(REG_SPURIOUS, SPURIOUS_ENABLE | VECTOR_SPURIOUS as u32);
}

pub fn send_ipi(lapic_id: u32, vector: u8) {
    write_icr(
        IcrValue::new()
            .with_vector(vector)
            .with_delivery_mode(DeliveryMode::Fixed)
            .with_assert(true)
            .with_destination(lapic_id as u8),
    );
}

pub fn send_ipi_to_others(vector: u8) {
    write_icr(
        IcrValue::new()
            .with_vector(vector)
            .with_delivery_mode(DeliveryMode::Fixed)
            .with_assert(true)
            .with_dest_shorthand(DestShorthand::Others),
    );
}

pub fn send_ipi_to_self(vector: u8) {
    write_icr(
        IcrValue::new()
            .with_vector(vector)
            .with_delivery_mode(DeliveryMode::Fixed)
            .with_assert(true)
            .with_dest_shorthand(DestShorthand::SelfOnly),
    );
}

pub fn send_init(lapic_id: u32) {
    write_icr(
        IcrValue::new()
            .with_delivery_mode(DeliveryMode::Init)
            .with_assert(true)
            .with_destination(lapic_id as u8),
    );
}

/// `page` is the physical page number the AP starts executing at.
pub fn send_sipi(lapic_id: u32, page: u8) {
    write_icr(
        IcrValue::new()
            .with_vector(page)
            .with_delivery_mode(DeliveryMode::StartUp)
            .with_assert(true)
            .with_destination(lapic_id as u8),
    );
}

/// APIC timer ticks per millisecond at divide-by-16, measured once on the
/// BSP against the HPET.
static TIMER_TICKS_PER_MS: AtomicU64 = AtomicU64::new(0);

const DIVIDE_BY_16: u32 = 0b011;

pub fn calibrate_timer() {
    write(REG_TIMER_DIVIDE, DIVIDE_BY_16);
    write(REG_TIMER_INITIAL, u32::MAX);

    hpet::busy_sleep_ms(10);

    let elapsed = u32::MAX - read(REG_TIMER_CURRENT);
    write(REG_TIMER_INITIAL, 0);

    TIMER_TICKS_PER_MS.store(elapsed as u64 / 10, Ordering::Relaxed);
}

/// Starts this CPU's periodic tick at `hz`, phase shifted by `phase_ns` so
/// the ticks of different CPUs do not land on the same instant.
pub fn timer_init(hz: u64, phase_ns: u64) {
    let ticks_per_ms = TIMER_TICKS_PER_MS.load(Ordering::Relaxed);
    debug_assert!(ticks_per_ms != 0, "APIC timer used before calibration");

    if phase_ns != 0 {
        hpet::busy_sleep_ns(phase_ns);
    }

    let period = (ticks_per_ms * 1000 / hz).max(1);
    write(REG_TIMER_DIVIDE, DIVIDE_BY_16);
    write(REG_LVT_TIMER, LVT_TIMER_PERIODIC | VECTOR_TIMER as u32);
    write(REG_TIMER_INITIAL, period as u32);
}

pub fn read_error() -> u32 {
    write(REG_ERROR_STATUS, 0);
    read(REG_ERROR_STATUS)
}
