//! Panic handler: disable interrupts, report, halt.

use core::panic::PanicInfo;

use meson_core::kerror;

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    crate::arch::disable_interrupts();
    kerror!("kernel panic: {info}");
    crate::arch::halt()
}
