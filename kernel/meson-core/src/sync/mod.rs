//! Synchronization primitives.
//!
//! The kernel targets a single CPU; interrupt masking is the only mutual
//! exclusion mechanism it needs. [`IrqSpinLock`] encodes that discipline,
//! while [`SpinLock`] is the plain variant for data never touched from
//! interrupt context.

mod irq_spinlock;
mod spinlock;

pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
