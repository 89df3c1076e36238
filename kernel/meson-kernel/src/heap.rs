//! Kernel heap: an interrupt-safe bump allocator seeded from the frame
//! allocator at boot.
//!
//! The kernel's allocation profile is small and mostly boot-time (tables,
//! names, socket buffers), so a bump allocator with no per-object free is
//! sufficient; freed blocks are only reclaimed when everything is freed.

use core::alloc::{GlobalAlloc, Layout};

use meson_core::addr::PAGE_SIZE;
use meson_core::sync::IrqSpinLock;
use meson_mm::pmm::FrameBitmap;

/// Heap size carved out at boot.
pub const HEAP_FRAMES: usize = 256; // 1 MiB

struct HeapInner {
    start: usize,
    end: usize,
    next: usize,
    live: usize,
}

/// The global kernel allocator.
pub struct KernelHeap {
    inner: IrqSpinLock<HeapInner>,
}

impl KernelHeap {
    const fn new() -> Self {
        Self {
            inner: IrqSpinLock::new(HeapInner {
                start: 0,
                end: 0,
                next: 0,
                live: 0,
            }),
        }
    }

    /// Seeds the heap with frames from the allocator.
    ///
    /// Must run before the first allocation.
    pub fn init(&self, pmm: &mut FrameBitmap, direct_offset: usize) {
        let region = pmm
            .alloc_run(HEAP_FRAMES)
            .expect("kernel heap frames")
            .start_address();
        let start = direct_offset + region.as_u32() as usize;
        let mut inner = self.inner.lock();
        inner.start = start;
        inner.next = start;
        inner.end = start + HEAP_FRAMES * PAGE_SIZE as usize;
    }
}

// SAFETY: allocation state is guarded by the IrqSpinLock; returned blocks
// are unique by construction of the bump pointer.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut inner = self.inner.lock();
        let aligned = inner.next.next_multiple_of(layout.align().max(1));
        let end = match aligned.checked_add(layout.size()) {
            Some(end) if end <= inner.end => end,
            _ => return core::ptr::null_mut(),
        };
        inner.next = end;
        inner.live += 1;
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
        let mut inner = self.inner.lock();
        inner.live -= 1;
        // Reclaim only when the heap is completely empty.
        if inner.live == 0 {
            inner.next = inner.start;
        }
    }
}

/// The kernel's global allocator instance.
#[global_allocator]
pub static HEAP: KernelHeap = KernelHeap::new();
