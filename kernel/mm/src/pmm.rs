//! Bitmap-based physical frame allocator.
//!
//! A `u32`-word bitmap tracks every 4 KiB frame up to the highest usable
//! address in the boot memory map: bit = 1 means allocated or reserved,
//! bit = 0 means free. Word-level scanning with `trailing_zeros()` keeps
//! single-frame allocation fast while preserving lowest-index first-fit
//! order.

use core::ops::Range;

use meson_core::addr::{PAGE_SIZE, PhysAddr};
use meson_core::boot::MemRegion;
use meson_core::paging::PhysFrame;

use crate::PmmError;

const BITS_PER_WORD: usize = 32;

/// Allocator statistics, in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames tracked by the bitmap.
    pub total: usize,
    /// Frames currently allocated or reserved.
    pub used: usize,
    /// Frames currently free.
    pub free: usize,
}

/// A bitmap-based physical frame allocator.
///
/// All mutation goes through `&mut self`; callers serialize access with
/// interrupt masking (the allocator is used from interrupt handlers on the
/// receive path).
pub struct FrameBitmap {
    /// Bitmap words, living in allocator-reserved physical frames reached
    /// through the direct-map offset.
    words: &'static mut [u32],
    /// Total number of frames tracked by the bitmap.
    total_frames: usize,
    /// Number of currently free frames.
    free_count: usize,
    /// Word index hint for the next single-frame search.
    ///
    /// Lowered on every free below it, so the word holding the lowest free
    /// bit is never before the hint and first-fit order is preserved.
    search_hint: usize,
}

impl FrameBitmap {
    /// Builds the allocator from the boot memory map.
    ///
    /// Every frame starts reserved; usable regions are cleared, then
    /// non-usable regions, the kernel image and the bitmap's own frames are
    /// re-marked allocated. The bitmap is placed first-fit inside a usable
    /// region at or above the end of the kernel image.
    ///
    /// # Safety
    ///
    /// - `direct_offset` must map every physical address in `regions` to
    ///   readable/writable memory.
    /// - `regions` must accurately describe physical memory.
    /// - Must be called once; the bitmap slice aliases the chosen frames for
    ///   the allocator's lifetime.
    pub unsafe fn new(
        regions: &[MemRegion],
        kernel_image: Range<PhysAddr>,
        direct_offset: usize,
    ) -> Result<Self, PmmError> {
        // Highest usable address bounds the tracked frame range; nothing is
        // ever allocated beyond it.
        let max_usable = regions
            .iter()
            .filter(|r| r.usable)
            .map(|r| r.end())
            .max()
            .unwrap_or(0);
        if max_usable == 0 {
            return Err(PmmError::OutOfMemory);
        }

        let total_frames = (max_usable / PAGE_SIZE) as usize;
        let bitmap_words = total_frames.div_ceil(BITS_PER_WORD);
        let bitmap_bytes = (bitmap_words * 4) as u32;

        // Place the bitmap in the first usable region with room at or above
        // the kernel image.
        let kernel_end = kernel_image.end.align_up(PAGE_SIZE);
        let bitmap_start = regions
            .iter()
            .filter(|r| r.usable)
            .filter_map(|r| {
                let candidate = PhysAddr::new(r.start.as_u32().max(kernel_end.as_u32()))
                    .align_up(PAGE_SIZE);
                (candidate.as_u32().checked_add(bitmap_bytes)? <= r.end()).then_some(candidate)
            })
            .next()
            .ok_or(PmmError::NoBitmapRegion)?;

        // SAFETY: caller guarantees the direct map covers bitmap_start..
        // bitmap_start + bitmap_bytes, and we are the sole user of those
        // frames (they are re-marked allocated below).
        let words = unsafe {
            let ptr = (direct_offset + bitmap_start.as_u32() as usize) as *mut u32;
            core::slice::from_raw_parts_mut(ptr, bitmap_words)
        };

        let mut this = Self {
            words,
            total_frames,
            free_count: 0,
            search_hint: 0,
        };

        // All reserved by default.
        this.words.fill(u32::MAX);

        // Clear usable regions (whole frames only).
        for region in regions.iter().filter(|r| r.usable) {
            let first = region.start.align_up(PAGE_SIZE).frame_index();
            let last = (region.end() / PAGE_SIZE) as usize;
            for frame in first..last.min(this.total_frames) {
                this.clear_bit(frame);
            }
        }

        // Re-mark non-usable regions; they win over any overlapping usable
        // entry.
        for region in regions.iter().filter(|r| !r.usable) {
            let first = region.start.frame_index();
            let last = (region.end().div_ceil(PAGE_SIZE)) as usize;
            for frame in first..last.min(this.total_frames) {
                this.set_bit(frame);
            }
        }

        // The kernel image and the bitmap's own frames are never handed out.
        this.reserve_range(kernel_image.start, kernel_end);
        this.reserve_range(bitmap_start, bitmap_start + bitmap_bytes);

        Ok(this)
    }

    fn reserve_range(&mut self, start: PhysAddr, end: PhysAddr) {
        let first = start.align_down(PAGE_SIZE).frame_index();
        let last = (end.align_up(PAGE_SIZE).as_u32() / PAGE_SIZE) as usize;
        for frame in first..last.min(self.total_frames) {
            self.set_bit(frame);
        }
    }

    /// Sets a bit; the used counter moves only on a real transition.
    fn set_bit(&mut self, frame: usize) {
        let (word, bit) = (frame / BITS_PER_WORD, frame % BITS_PER_WORD);
        if self.words[word] & (1 << bit) == 0 {
            self.words[word] |= 1 << bit;
            self.free_count -= 1;
        }
    }

    /// Clears a bit; the used counter moves only on a real transition.
    fn clear_bit(&mut self, frame: usize) {
        let (word, bit) = (frame / BITS_PER_WORD, frame % BITS_PER_WORD);
        if self.words[word] & (1 << bit) != 0 {
            self.words[word] &= !(1 << bit);
            self.free_count += 1;
            if word < self.search_hint {
                self.search_hint = word;
            }
        }
    }

    fn is_set(&self, frame: usize) -> bool {
        let (word, bit) = (frame / BITS_PER_WORD, frame % BITS_PER_WORD);
        self.words[word] & (1 << bit) != 0
    }

    /// Allocates the lowest-index free frame.
    pub fn alloc_one(&mut self) -> Result<PhysFrame, PmmError> {
        if self.free_count == 0 {
            return Err(PmmError::OutOfMemory);
        }

        for word_idx in self.search_hint..self.words.len() {
            let word = self.words[word_idx];
            if word == u32::MAX {
                continue;
            }

            // First zero bit: invert, then trailing_zeros gives its position.
            let bit = (!word).trailing_zeros() as usize;
            let frame = word_idx * BITS_PER_WORD + bit;
            if frame >= self.total_frames {
                break;
            }

            self.words[word_idx] |= 1 << bit;
            self.free_count -= 1;
            self.search_hint = word_idx;
            return Ok(PhysFrame::containing(PhysAddr::new(
                frame as u32 * PAGE_SIZE,
            )));
        }

        Err(PmmError::OutOfMemory)
    }

    /// Allocates the lowest-index run of `count` consecutive free frames.
    pub fn alloc_run(&mut self, count: usize) -> Result<PhysFrame, PmmError> {
        if count == 0 {
            return Err(PmmError::OutOfMemory);
        }
        if count == 1 {
            return self.alloc_one();
        }
        if self.free_count < count {
            return Err(PmmError::OutOfMemory);
        }

        let mut run_start = 0usize;
        let mut run_len = 0usize;
        let mut frame = 0usize;

        while frame < self.total_frames {
            let word_idx = frame / BITS_PER_WORD;
            let word = self.words[word_idx];

            if word == u32::MAX && frame % BITS_PER_WORD == 0 {
                // Entire word allocated, skip it.
                run_len = 0;
                frame = (word_idx + 1) * BITS_PER_WORD;
                run_start = frame;
                continue;
            }

            if word == 0 && frame % BITS_PER_WORD == 0 {
                // Entire word free, extend the run by up to 32 frames.
                let extend =
                    BITS_PER_WORD.min(self.total_frames - word_idx * BITS_PER_WORD);
                if run_len == 0 {
                    run_start = frame;
                }
                run_len += extend;
                if run_len >= count {
                    break;
                }
                frame = (word_idx + 1) * BITS_PER_WORD;
                continue;
            }

            // Partially occupied word, check bit by bit.
            if self.is_set(frame) {
                run_len = 0;
                run_start = frame + 1;
            } else {
                if run_len == 0 {
                    run_start = frame;
                }
                run_len += 1;
                if run_len >= count {
                    break;
                }
            }
            frame += 1;
        }

        if run_len < count {
            return Err(PmmError::OutOfMemory);
        }

        for f in run_start..run_start + count {
            self.set_bit(f);
        }
        Ok(PhysFrame::containing(PhysAddr::new(
            run_start as u32 * PAGE_SIZE,
        )))
    }

    /// Frees a single frame.
    ///
    /// Addresses outside the bitmap are ignored; clearing an already-clear
    /// bit is idempotent. The API is deliberately total so cleanup paths may
    /// free half-owned regions.
    pub fn free_one(&mut self, addr: PhysAddr) {
        let frame = addr.frame_index();
        if frame < self.total_frames {
            self.clear_bit(frame);
        }
    }

    /// Frees `count` consecutive frames starting at `addr`.
    ///
    /// Frames beyond the bitmap are ignored.
    pub fn free_run(&mut self, addr: PhysAddr, count: usize) {
        let start = addr.frame_index();
        for frame in start..start.saturating_add(count) {
            if frame >= self.total_frames {
                break;
            }
            self.clear_bit(frame);
        }
    }

    /// Returns (total, used, free) in frames. O(1).
    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total: self.total_frames,
            used: self.total_frames - self.free_count,
            free: self.free_count,
        }
    }

    /// Returns `true` if the frame containing `addr` is allocated.
    pub fn is_allocated(&self, addr: PhysAddr) -> bool {
        let frame = addr.frame_index();
        frame < self.total_frames && self.is_set(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Arena, arena_pmm};
    use meson_core::boot::MemRegion;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn conservation_after_alloc_free() {
        let arena = Arena::new(4 * MIB);
        let mut pmm = arena_pmm(&arena);
        let before = pmm.stats();
        assert_eq!(before.used + before.free, before.total);

        let a = pmm.alloc_one().unwrap();
        let b = pmm.alloc_run(5).unwrap();
        let mid = pmm.stats();
        assert_eq!(mid.used, before.used + 6);
        assert_eq!(mid.used + mid.free, mid.total);

        pmm.free_one(a.start_address());
        pmm.free_run(b.start_address(), 5);
        assert_eq!(pmm.stats(), before);
    }

    #[test]
    fn alloc_one_is_lowest_index() {
        let arena = Arena::new(2 * MIB);
        let mut pmm = arena_pmm(&arena);
        let first = pmm.alloc_one().unwrap();
        let second = pmm.alloc_one().unwrap();
        assert_eq!(
            second.start_address().as_u32(),
            first.start_address().as_u32() + PAGE_SIZE
        );

        // Freeing the first frame makes it the next allocation again.
        pmm.free_one(first.start_address());
        let third = pmm.alloc_one().unwrap();
        assert_eq!(third, first);
    }

    #[test]
    fn runs_do_not_alias() {
        let arena = Arena::new(4 * MIB);
        let mut pmm = arena_pmm(&arena);
        let a = pmm.alloc_run(3).unwrap().start_address().as_u32();
        let b = pmm.alloc_run(4).unwrap().start_address().as_u32();
        let c = pmm.alloc_one().unwrap().start_address().as_u32();
        let ranges = [(a, 3u32), (b, 4), (c, 1)];
        for (i, &(start, len)) in ranges.iter().enumerate() {
            for (j, &(other, olen)) in ranges.iter().enumerate() {
                if i != j {
                    let disjoint = start + len * PAGE_SIZE <= other
                        || other + olen * PAGE_SIZE <= start;
                    assert!(disjoint, "ranges {i} and {j} overlap");
                }
            }
        }
    }

    #[test]
    fn run_alloc_first_fit_reuse() {
        // 16 MiB region: alloc_run(3), alloc_run(1), free the 3-run, then
        // alloc_run(4) lands after the surviving single frame and alloc_one
        // reuses the freed range.
        let arena = Arena::new(16 * MIB);
        let mut pmm = arena_pmm(&arena);
        let first = pmm.alloc_run(3).unwrap();
        let single = pmm.alloc_run(1).unwrap();
        assert_eq!(single, first + 3);

        pmm.free_run(first.start_address(), 3);
        let four = pmm.alloc_run(4).unwrap();
        assert!(four.start_address() > single.start_address());

        let reused = pmm.alloc_one().unwrap();
        assert_eq!(reused, first);
    }

    #[test]
    fn run_spans_partial_words() {
        let arena = Arena::new(4 * MIB);
        let mut pmm = arena_pmm(&arena);
        // Fragment the low frames, then ask for a run larger than a word.
        let a = pmm.alloc_run(7).unwrap();
        pmm.free_run(a.start_address(), 7);
        let big = pmm.alloc_run(40).unwrap();
        for i in 0..40 {
            assert!(pmm.is_allocated((big + i).start_address()));
        }
    }

    #[test]
    fn double_free_counts_once() {
        let arena = Arena::new(2 * MIB);
        let mut pmm = arena_pmm(&arena);
        let frame = pmm.alloc_one().unwrap();
        let before = pmm.stats().free;
        pmm.free_one(frame.start_address());
        pmm.free_one(frame.start_address());
        assert_eq!(pmm.stats().free, before + 1);
    }

    #[test]
    fn out_of_range_free_is_noop() {
        let arena = Arena::new(2 * MIB);
        let mut pmm = arena_pmm(&arena);
        let before = pmm.stats();
        pmm.free_one(PhysAddr::new(0xF000_0000));
        pmm.free_run(PhysAddr::new(0xF000_0000), 8);
        assert_eq!(pmm.stats(), before);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let arena = Arena::new(256 * 1024);
        let mut pmm = arena_pmm(&arena);
        while pmm.alloc_one().is_ok() {}
        assert_eq!(pmm.alloc_one(), Err(PmmError::OutOfMemory));
        assert_eq!(pmm.stats().free, 0);
    }

    #[test]
    fn oversized_run_fails_without_side_effects() {
        let arena = Arena::new(256 * 1024);
        let mut pmm = arena_pmm(&arena);
        let before = pmm.stats();
        assert_eq!(pmm.alloc_run(1 << 20), Err(PmmError::OutOfMemory));
        assert_eq!(pmm.stats(), before);
    }

    #[test]
    fn reserved_regions_never_allocated() {
        let arena = Arena::new(4 * MIB);
        let regions = [
            MemRegion {
                start: PhysAddr::zero(),
                size: 2 * MIB as u32,
                usable: true,
            },
            MemRegion {
                start: PhysAddr::new(2 * MIB as u32),
                size: MIB as u32,
                usable: false,
            },
            MemRegion {
                start: PhysAddr::new(3 * MIB as u32),
                size: MIB as u32,
                usable: true,
            },
        ];
        let kernel = PhysAddr::zero()..PhysAddr::new(4 * PAGE_SIZE);
        let mut pmm =
            unsafe { FrameBitmap::new(&regions, kernel, arena.offset()).unwrap() };

        let reserved = PhysAddr::new(2 * MIB as u32)..PhysAddr::new(3 * MIB as u32);
        loop {
            match pmm.alloc_one() {
                Ok(frame) => {
                    let addr = frame.start_address();
                    assert!(
                        !(reserved.start..reserved.end).contains(&addr),
                        "allocated a reserved frame at {addr}"
                    );
                }
                Err(_) => break,
            }
        }
    }

    #[test]
    fn kernel_image_frames_reserved() {
        let arena = Arena::new(2 * MIB);
        let pmm = arena_pmm(&arena);
        // arena_pmm reserves the first four frames as the kernel image.
        for i in 0..4 {
            assert!(pmm.is_allocated(PhysAddr::new(i * PAGE_SIZE)));
        }
    }
}
