//! Hardware abstraction layer contract.
//!
//! The kernel core never pokes hardware registers directly; each supported
//! architecture provides an implementation of [`Hal`] and the core only
//! calls this op set. Implementations live outside this crate (or in test
//! doubles).

/// Saved interrupt state, opaque to the core.
///
/// On x86 this is the EFLAGS value before interrupts were disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqState(pub u32);

/// An interrupt service routine bound to a vector.
pub type IsrHandler = fn(vector: u32);

/// The architecture op set the kernel core depends on.
pub trait Hal {
    /// One-time CPU setup (descriptor tables, interrupt controller, ...).
    fn cpu_init(&self);

    /// Enables interrupt delivery.
    fn enable_interrupts(&self);

    /// Disables interrupt delivery.
    fn disable_interrupts(&self);

    /// Disables interrupts and returns the previous state.
    fn save_interrupt_state(&self) -> IrqState;

    /// Restores a previously saved interrupt state.
    fn restore_interrupt_state(&self, state: IrqState);

    /// Registers `handler` for interrupt vector `vector`.
    fn register_isr(&self, vector: u32, handler: IsrHandler);

    /// Starts the periodic timer at `frequency` Hz.
    fn timer_init(&self, frequency: u32);

    /// Returns the monotonic tick count since boot.
    fn ticks(&self) -> u64;

    /// Spins for approximately `us` microseconds.
    fn busy_wait(&self, us: u32);

    /// Halts the CPU until the next interrupt.
    fn idle(&self);
}

/// Port-mapped I/O, present on x86-class targets only.
///
/// Memory-mapped targets access devices through plain volatile loads and
/// stores instead.
pub trait PortIo {
    /// Reads a byte from an I/O port.
    fn inb(&self, port: u16) -> u8;
    /// Writes a byte to an I/O port.
    fn outb(&self, port: u16, value: u8);
    /// Reads a 16-bit word from an I/O port.
    fn inw(&self, port: u16) -> u16;
    /// Writes a 16-bit word to an I/O port.
    fn outw(&self, port: u16, value: u16);
    /// Reads a 32-bit word from an I/O port.
    fn inl(&self, port: u16) -> u32;
    /// Writes a 32-bit word to an I/O port.
    fn outl(&self, port: u16, value: u32);
}
