//! Context-switch contract.
//!
//! The core scheduler only depends on the invariant "after the switch, the
//! incoming task resumes at its saved program counter with its saved stack
//! top". The architecture supplies the primitive; host tests substitute a
//! recording implementation.

/// Saved CPU context of a task: its kernel stack and frame pointers.
///
/// The instruction pointer is not stored here — for a task that has run
/// before, the return address lives on its stack; for a freshly spawned
/// task, [`process::prime_stack`](crate::process::prime_stack) placed the
/// entry point where the switch return expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuContext {
    /// Saved stack pointer.
    pub sp: u32,
    /// Saved frame pointer.
    pub bp: u32,
}

/// Architecture context-switch primitive.
pub trait ContextSwitch {
    /// Saves the outgoing stack/frame pointers into `prev`, updates the TSS
    /// kernel-stack slot for the incoming task, and loads `next`'s
    /// stack/frame pointers.
    fn switch(&mut self, prev: &mut CpuContext, next: &CpuContext);
}

/// x86 implementation: raw ESP/EBP swap plus TSS esp0 update.
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub struct X86Switch {
    /// Writes the incoming kernel stack top into the TSS.
    pub set_tss_stack: fn(u32),
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
impl ContextSwitch for X86Switch {
    fn switch(&mut self, prev: &mut CpuContext, next: &CpuContext) {
        (self.set_tss_stack)(next.sp);
        // SAFETY: interrupts are disabled for the whole selection + switch
        // window; `next` holds a stack top primed by `prime_stack` or saved
        // by a previous switch.
        unsafe {
            core::arch::asm!(
                "mov [{prev_sp}], esp",
                "mov [{prev_bp}], ebp",
                "mov esp, {next_sp}",
                "mov ebp, {next_bp}",
                prev_sp = in(reg) &raw mut prev.sp,
                prev_bp = in(reg) &raw mut prev.bp,
                next_sp = in(reg) next.sp,
                next_bp = in(reg) next.bp,
            );
        }
    }
}
