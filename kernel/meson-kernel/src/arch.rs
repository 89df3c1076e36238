//! x86 architecture glue: the handful of privileged instructions the
//! portable core treats as injected hooks.

/// Invalidates the TLB entry for one virtual address.
#[cfg(target_arch = "x86")]
pub fn flush_tlb_entry(virt: meson_core::addr::VirtAddr) {
    // SAFETY: invlpg on a kernel-held address is always safe in ring 0.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt.as_u32(), options(nostack));
    }
}

/// Installs a page directory in CR3.
#[cfg(target_arch = "x86")]
pub fn load_page_directory(root: meson_core::addr::PhysAddr) {
    // SAFETY: the caller passes a frame-aligned, fully populated directory.
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) root.as_u32(), options(nostack));
    }
}

/// Enables interrupt delivery.
#[cfg(target_arch = "x86")]
pub fn enable_interrupts() {
    // SAFETY: ring-0 flag manipulation.
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

/// Disables interrupt delivery.
#[cfg(target_arch = "x86")]
pub fn disable_interrupts() {
    // SAFETY: ring-0 flag manipulation.
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
}

/// The idle task body: halt until the next interrupt, forever.
#[cfg(target_arch = "x86")]
pub extern "C" fn idle_task(_arg: u32) -> ! {
    loop {
        // SAFETY: hlt with interrupts enabled resumes on the next tick.
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack));
        }
    }
}

/// Disables interrupts and halts permanently (fatal-error path).
#[cfg(target_arch = "x86")]
pub fn halt() -> ! {
    loop {
        // SAFETY: cli; hlt never returns control to broken kernel state.
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}

/// Page-fault handler body, wired to vector 14 by the ISR setup.
///
/// Decodes CR2 and the pushed error code, reports, and halts.
/// Copy-on-write resolution would hook in here before the report.
#[cfg(target_arch = "x86")]
pub fn page_fault(err_code: u32) -> ! {
    let cr2: u32;
    // SAFETY: reading CR2 is side-effect free in ring 0.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack));
    }
    let fault = meson_mm::fault::PageFault::decode(meson_core::addr::VirtAddr::new(cr2), err_code);
    meson_core::kerror!("{fault}");
    halt()
}
