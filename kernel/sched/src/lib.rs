//! Process scheduler for the Meson kernel.
//!
//! A round-robin scheduler over a ring of process control blocks, driven by
//! the periodic timer tick. Tasks cooperate through [`Scheduler::yield_now`]
//! and are pre-empted every ten ticks. The context-switch primitive itself
//! is architecture code behind the [`context::ContextSwitch`] contract, so
//! the selection logic is host-testable.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod context;
pub mod process;
pub mod scheduler;

pub use context::{ContextSwitch, CpuContext};
pub use process::{Pcb, Priority, ProcState};
pub use scheduler::Scheduler;

/// Errors reported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Allocating a PCB, stack or address space failed.
    OutOfMemory,
    /// No address space is installed to clone for a new task.
    NoAddressSpace,
    /// The referenced task does not exist.
    NoSuchTask,
}
