use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

use lock_api::{GuardNoSend, GuardSend, RawMutex, RawRwLock};
use spin::Lazy;

/// Spins this many times before yielding the time slice.
pub const SPIN_AMOUNT: u32 = 10_000;

/// Fair ticket lock. `next` hands out tickets, `serving` admits them in
/// order, so waiters enter in arrival order.
pub struct RawTicketLock {
    next: AtomicU32,
    serving: AtomicU32,
}

impl RawTicketLock {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const INIT: Self = Self {
        next: AtomicU32::new(0),
        serving: AtomicU32::new(0),
    };

    #[inline]
    pub fn lock_spin(&self) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while self.serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
    }

    #[inline]
    pub fn try_lock_fast(&self) -> bool {
        let serving = self.serving.load(Ordering::Relaxed);
        self.next
            .compare_exchange(serving, serving + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// # Safety
    /// Must pair with a successful lock.
    #[inline]
    pub unsafe fn unlock_fair(&self) {
        self.serving.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub fn is_locked_now(&self) -> bool {
        self.serving.load(Ordering::Relaxed) != self.next.load(Ordering::Relaxed)
    }
}

unsafe impl RawMutex for RawTicketLock {
    const INIT: Self = RawTicketLock::INIT;
    type GuardMarker = GuardSend;

    fn lock(&self) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        let mut spin_count = 0u32;
        while self.serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
            spin_count += 1;
            if spin_count > SPIN_AMOUNT {
                crate::sched::thread_yield();
                spin_count = 0;
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.try_lock_fast()
    }

    fn is_locked(&self) -> bool {
        self.is_locked_now()
    }

    unsafe fn unlock(&self) {
        unsafe { self.unlock_fair() }
    }
}

/// Ticket lock that additionally holds a `cli` section while locked, making
/// it usable from trap handlers. Never yields while waiting.
pub struct RawIrqLock(RawTicketLock);

unsafe impl RawMutex for RawIrqLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self(RawTicketLock::INIT);
    // the guard pins a cli section of this CPU
    type GuardMarker = GuardNoSend;

    fn lock(&self) {
        crate::smp::cli_push();
        self.0.lock_spin();
    }

    fn try_lock(&self) -> bool {
        crate::smp::cli_push();
        if self.0.try_lock_fast() {
            true
        } else {
            crate::smp::cli_pop();
            false
        }
    }

    fn is_locked(&self) -> bool {
        self.0.is_locked_now()
    }

    unsafe fn unlock(&self) {
        unsafe { self.0.unlock_fair() };
        crate::smp::cli_pop();
    }
}

pub struct LockRawRwLock(AtomicU32);
impl LockRawRwLock {
    pub const WRITER_BIT: u32 = 1 << 31;
}

#[inline(always)]
fn lock_loop<T>(this: &T, try_lock: impl Fn(&T) -> bool) {
    let mut spin_count = 0;
    while !try_lock(this) {
        core::hint::spin_loop();
        spin_count += 1;
        if spin_count > SPIN_AMOUNT {
            crate::sched::thread_yield();
            spin_count = 0;
        }
    }
}

unsafe impl RawRwLock for LockRawRwLock {
    const INIT: Self = Self(AtomicU32::new(0));
    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        lock_loop(self, Self::try_lock_shared)
    }

    fn lock_exclusive(&self) {
        lock_loop(self, Self::try_lock_exclusive)
    }

    fn try_lock_shared(&self) -> bool {
        let mut state = self.0.load(Ordering::Relaxed);
        loop {
            if state & Self::WRITER_BIT != 0 {
                return false;
            }

            match self.0.compare_exchange_weak(
                state,
                state + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(s) => state = s,
            }
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        self.0
            .compare_exchange(0, Self::WRITER_BIT, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed) != 0
    }

    fn is_locked_exclusive(&self) -> bool {
        self.0.load(Ordering::Relaxed) & Self::WRITER_BIT != 0
    }

    unsafe fn unlock_shared(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    unsafe fn unlock_exclusive(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// The general kernel mutex: fair, yields while contended. Not safe to take
/// in trap context, use [`IrqMutex`] there.
pub type Mutex<T> = lock_api::Mutex<RawTicketLock, T>;
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawTicketLock, T>;

/// Trap-safe mutex: interrupts stay disabled on this CPU while held.
pub type IrqMutex<T> = lock_api::Mutex<RawIrqLock, T>;
pub type IrqMutexGuard<'a, T> = lock_api::MutexGuard<'a, RawIrqLock, T>;

pub type RwLock<T> = lock_api::RwLock<LockRawRwLock, T>;
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, LockRawRwLock, T>;
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, LockRawRwLock, T>;

#[derive(Debug)]
#[repr(transparent)]
pub struct LazyLock<T>(Lazy<T>);

impl<T> Deref for LazyLock<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> LazyLock<T> {
    pub const fn new(f: fn() -> T) -> Self {
        Self(Lazy::new(f))
    }
}

/// Raw cell guarded by an external locking protocol rather than its own
/// lock; used where lock sets are only known at runtime (wait queues).
#[derive(Debug)]
#[repr(transparent)]
pub struct ProtocolCell<T>(UnsafeCell<T>);

unsafe impl<T: Send> Send for ProtocolCell<T> {}
unsafe impl<T: Send> Sync for ProtocolCell<T> {}

impl<T> ProtocolCell<T> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// # Safety
    /// The caller must hold whatever locks the owning structure documents.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        unsafe { &mut *self.0.get() }
    }

    /// # Safety
    /// Same protocol as [`Self::get_mut`].
    pub unsafe fn get(&self) -> &T {
        unsafe { &*self.0.get() }
    }
}

impl<T> Deref for ProtocolCell<T> {
    type Target = UnsafeCell<T>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for ProtocolCell<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
