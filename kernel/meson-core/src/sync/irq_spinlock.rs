//! Interrupt-safe spin lock.
//!
//! Disables interrupts before acquiring the inner spinlock and restores the
//! previous interrupt state on release. This prevents deadlocks when a lock
//! is shared between interrupt handlers and normal kernel code, and on the
//! single-CPU target it is the sole mutual-exclusion mechanism.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spin lock that disables interrupts while held.
pub struct IrqSpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: Same reasoning as SpinLock — atomic ops ensure exclusive access.
unsafe impl<T: Send> Send for IrqSpinLock<T> {}
unsafe impl<T: Send> Sync for IrqSpinLock<T> {}

impl<T> IrqSpinLock<T> {
    /// Creates a new unlocked `IrqSpinLock`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, disabling interrupts first.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        // Save current EFLAGS and disable interrupts.
        let saved_flags = save_flags_and_cli();

        // TTAS spin to acquire.
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return IrqSpinLockGuard {
                    lock: self,
                    saved_flags,
                    _not_send: PhantomData,
                };
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let saved_flags = save_flags_and_cli();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSpinLockGuard {
                lock: self,
                saved_flags,
                _not_send: PhantomData,
            })
        } else {
            // Failed — restore flags.
            restore_flags(saved_flags);
            None
        }
    }
}

/// RAII guard that restores interrupt state on drop.
///
/// Not `Send`: interrupt state is per-CPU and must be restored where it was
/// saved.
pub struct IrqSpinLockGuard<'a, T> {
    lock: &'a IrqSpinLock<T>,
    saved_flags: u32,
    _not_send: PhantomData<*mut ()>,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: The lock is held, so we have exclusive access to the data.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The lock is held, so we have exclusive access to the data.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        restore_flags(self.saved_flags);
    }
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
#[inline]
fn save_flags_and_cli() -> u32 {
    let flags: u32;
    // SAFETY: Reading EFLAGS and disabling interrupts is safe in kernel mode.
    unsafe {
        core::arch::asm!(
            "pushfd",
            "pop {}",
            "cli",
            out(reg) flags,
            options(nomem),
        );
    }
    flags
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
#[inline]
fn restore_flags(flags: u32) {
    // Interrupt flag (bit 9) was set before we disabled — re-enable.
    if flags & (1 << 9) != 0 {
        // SAFETY: Restoring a previously-enabled interrupt state.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack));
        }
    }
}

#[cfg(not(all(target_os = "none", target_arch = "x86")))]
#[inline]
fn save_flags_and_cli() -> u32 {
    0
}

#[cfg(not(all(target_os = "none", target_arch = "x86")))]
#[inline]
fn restore_flags(_flags: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_mutate() {
        let lock = IrqSpinLock::new(5);
        *lock.lock() = 6;
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn try_lock_while_held() {
        let lock = IrqSpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
