//! Process control blocks and kernel-stack preparation.

use alloc::string::String;

use meson_core::addr::{PAGE_SIZE, PhysAddr};

use crate::context::CpuContext;

/// Kernel stack size for spawned tasks (4 frames).
pub const KERNEL_STACK_SIZE: u32 = 16 * 1024;

/// Kernel stack size for the idle task (1 frame).
pub const IDLE_STACK_SIZE: u32 = 4 * 1024;

/// Initial EFLAGS for a fresh task: interrupts enabled.
pub const INITIAL_EFLAGS: u32 = 0x202;

/// Kernel code segment selector.
pub const KERNEL_CS: u32 = 0x08;

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Runnable, waiting its turn.
    Ready,
    /// Currently executing. At most one PCB is in this state.
    Running,
    /// Waiting, optionally with a wake deadline.
    Blocked,
    /// Finished; reaped by the next scheduler pass over its slot.
    Terminated,
}

/// Scheduling priority.
///
/// Carried on every PCB but not consulted by the present round-robin
/// selector, so a priority-weighted selector can be substituted without a
/// data-model change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    /// Background work.
    Low = 0,
    /// Default priority.
    Normal = 1,
    /// Latency-sensitive work.
    High = 2,
    /// Must-run work.
    Realtime = 3,
}

/// A process control block.
#[derive(Debug)]
pub struct Pcb {
    /// Process identifier. The idle task is pid 0.
    pub pid: u32,
    /// Human-readable task name.
    pub name: String,
    /// Scheduling state.
    pub state: ProcState,
    /// Scheduling priority.
    pub priority: Priority,
    /// Saved stack/frame pointers.
    pub context: CpuContext,
    /// Root of the task's address space.
    pub addr_space: PhysAddr,
    /// Bottom of the kernel stack.
    pub stack_base: PhysAddr,
    /// Kernel stack size in bytes.
    pub stack_size: u32,
    /// Tick at which a sleeping task becomes runnable again.
    pub wake_at: Option<u64>,
    /// Exit code recorded by `exit`.
    pub exit_code: i32,
    /// Ring successor (slot index).
    pub next: usize,
}

impl Pcb {
    /// Number of frames backing the kernel stack.
    pub fn stack_frames(&self) -> usize {
        (self.stack_size / PAGE_SIZE) as usize
    }
}

/// Pre-fills the top of a fresh kernel stack with the layout the context
/// switch expects on first resume, returning the initial stack pointer.
///
/// From the top down: the entry argument, a fake return address, EFLAGS with
/// interrupts enabled, the kernel code segment, the entry point, then eight
/// zeroed general-purpose register slots.
///
/// # Safety
///
/// `direct_offset + stack_base .. + stack_size` must be writable memory
/// exclusively owned by the new task.
pub unsafe fn prime_stack(
    direct_offset: usize,
    stack_base: PhysAddr,
    stack_size: u32,
    entry: u32,
    arg: u32,
) -> CpuContext {
    let top = stack_base.as_u32() + stack_size;
    let mut sp = top;

    let mut push = |value: u32| {
        sp -= 4;
        // SAFETY: sp stays within the stack region per the function
        // contract; at most 13 words are pushed.
        unsafe {
            ((direct_offset + sp as usize) as *mut u32).write(value);
        }
    };

    push(arg);
    push(0); // fake return address
    push(INITIAL_EFLAGS);
    push(KERNEL_CS);
    push(entry);
    for _ in 0..8 {
        push(0); // eax, ecx, edx, ebx, esp, ebp, esi, edi
    }

    CpuContext { sp, bp: sp }
}
