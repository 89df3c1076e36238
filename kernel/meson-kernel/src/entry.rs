//! Boot entry: the multiboot trampoline hands over `(magic, info)` and this
//! module drives [`Kernel::bootstrap`](crate::kernel::Kernel::bootstrap).

use core::ops::Range;

use meson_core::addr::PhysAddr;
use meson_core::boot::MultibootInfo;
use meson_core::kinfo;

use crate::kernel::{BootParams, Kernel};

unsafe extern "C" {
    /// Linker-provided start of the kernel image.
    static __kernel_start: u8;
    /// Linker-provided end of the kernel image.
    static __kernel_end: u8;
}

/// Physical extent of the kernel image from the linker script.
fn kernel_image() -> Range<PhysAddr> {
    // SAFETY: the linker symbols exist at fixed addresses; only their
    // addresses are taken, never their contents.
    let (start, end) = unsafe {
        (
            (&raw const __kernel_start) as usize as u32,
            (&raw const __kernel_end) as usize as u32,
        )
    };
    PhysAddr::new(start)..PhysAddr::new(end)
}

/// Kernel entry point, called by the assembly trampoline with the multiboot
/// magic and the physical address of the information structure.
///
/// # Safety
///
/// Must be entered exactly once, with paging off or low memory
/// identity-mapped, and `info_addr` pointing at a valid multiboot structure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kmain(magic: u32, info_addr: u32) -> ! {
    // Low memory is identity-mapped at this point: the direct-map offset is
    // zero and physical pointers are directly dereferenceable.
    let direct_offset = 0usize;

    // SAFETY: the bootloader provides a valid info structure at info_addr.
    let info = unsafe { core::slice::from_raw_parts(info_addr as *const u8, 128) };
    let map = match MultibootInfo::parse(info) {
        Ok(parsed) => {
            // SAFETY: mmap_addr/mmap_length come from the validated info
            // structure.
            unsafe {
                core::slice::from_raw_parts(
                    parsed.mmap_addr as *const u8,
                    parsed.mmap_length as usize,
                )
            }
        }
        Err(_) => crate::arch::halt(),
    };

    let params = BootParams {
        magic,
        info,
        memory_map: map,
        kernel_image: kernel_image(),
        direct_offset,
        idle_entry: crate::arch::idle_task as usize as u32,
    };

    // The frame allocator comes first and alloc-free; the heap rides on it;
    // only then may the allocating subsystems come up.
    let mut pmm = match Kernel::build_pmm(&params) {
        Ok(pmm) => pmm,
        Err(_) => crate::arch::halt(),
    };
    crate::heap::HEAP.init(&mut pmm, direct_offset);

    let kernel = match Kernel::bootstrap(&params, pmm) {
        Ok(kernel) => kernel,
        Err(_) => crate::arch::halt(),
    };
    kinfo!("meson: core up, {} frames free", kernel.pmm.stats().free);

    crate::arch::enable_interrupts();
    crate::arch::idle_task(0)
}
