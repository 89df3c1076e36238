//! Two-level address-space manager.
//!
//! Creates, clones and destroys page directories, and maps, unmaps and
//! translates individual pages. Page tables live in physical frames from the
//! [`FrameBitmap`](crate::pmm::FrameBitmap) and are reached through the
//! direct-map offset, so the manager runs unmodified under the kernel linear
//! map and in host tests.
//!
//! Architecture-specific effects (single-entry TLB invalidation, loading the
//! MMU root register) are injected as hooks at construction time; the
//! defaults are no-ops, which is correct for early boot and for host tests.

use core::sync::atomic::{AtomicU32, Ordering};

use meson_core::addr::{PAGE_SIZE, PhysAddr, VirtAddr};
use meson_core::paging::{ENTRY_COUNT, EntryFlags, KERNEL_DIR_START, PageEntry, PageTable};

use crate::VmmError;
use crate::pmm::FrameBitmap;

/// Hook invalidating the cached translation for one virtual address.
pub type TlbFlushFn = fn(VirtAddr);

/// Hook installing a directory in the MMU's root-pointer register.
pub type LoadRootFn = fn(PhysAddr);

fn nop_flush(_virt: VirtAddr) {}
fn nop_load(_root: PhysAddr) {}

/// Manager for every address space in the system.
///
/// Directories are identified by the physical address of their first-level
/// table. Entries at directory index ≥ 768 (the kernel half) reference
/// tables shared by all address spaces; lower entries are private to one
/// directory.
pub struct AddressSpaces {
    /// Direct-map offset turning physical addresses into pointers.
    direct_offset: usize,
    /// Physical address of the installed directory (0 = none yet).
    current: AtomicU32,
    tlb_flush: TlbFlushFn,
    load_root: LoadRootFn,
}

impl AddressSpaces {
    /// Creates a manager with no-op architecture hooks.
    pub fn new(direct_offset: usize) -> Self {
        Self::with_arch_hooks(direct_offset, nop_flush, nop_load)
    }

    /// Creates a manager with the given TLB-flush and root-load hooks.
    pub fn with_arch_hooks(
        direct_offset: usize,
        tlb_flush: TlbFlushFn,
        load_root: LoadRootFn,
    ) -> Self {
        Self {
            direct_offset,
            current: AtomicU32::new(0),
            tlb_flush,
            load_root,
        }
    }

    /// Returns a mutable view of the paging structure at `phys`.
    ///
    /// # Safety
    ///
    /// `phys` must be a frame holding a page table or directory owned by
    /// this manager, and callers must not hold another reference to it.
    #[allow(clippy::mut_from_ref)]
    unsafe fn table_mut(&self, phys: PhysAddr) -> &'static mut PageTable {
        // SAFETY: per the function contract; table frames come from the
        // frame allocator and are frame-aligned.
        unsafe { &mut *((self.direct_offset + phys.as_u32() as usize) as *mut PageTable) }
    }

    /// Flushes the TLB entry for `virt` if `dir` is the installed directory.
    fn flush_if_current(&self, dir: PhysAddr, virt: VirtAddr) {
        if self.current.load(Ordering::Acquire) == dir.as_u32() {
            (self.tlb_flush)(virt);
        }
    }

    /// Allocates and zeroes a fresh page directory.
    pub fn create_directory(&self, pmm: &mut FrameBitmap) -> Result<PhysAddr, VmmError> {
        let frame = pmm.alloc_one().map_err(|_| VmmError::OutOfMemory)?;
        let dir = frame.start_address();
        // SAFETY: freshly allocated frame, not yet shared.
        unsafe { self.table_mut(dir) }.zero();
        Ok(dir)
    }

    /// Returns the second-level table for directory index `idx`, allocating
    /// one when `allocate` is set and the slot is empty.
    fn get_table(
        &self,
        dir: PhysAddr,
        idx: usize,
        allocate: Option<&mut FrameBitmap>,
    ) -> Result<PhysAddr, VmmError> {
        // SAFETY: dir identifies a live directory owned by this manager.
        let directory = unsafe { self.table_mut(dir) };
        let entry = directory[idx];
        if entry.is_present() {
            return Ok(entry.addr());
        }

        let Some(pmm) = allocate else {
            return Err(VmmError::Unmapped);
        };
        let frame = pmm.alloc_one().map_err(|_| VmmError::OutOfMemory)?;
        let table = frame.start_address();
        // SAFETY: freshly allocated frame.
        unsafe { self.table_mut(table) }.zero();
        directory[idx] = PageEntry::new(
            table,
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
        );
        Ok(table)
    }

    /// Maps `virt` to `phys` in `dir` with the given flags.
    ///
    /// Both addresses are aligned down to a frame boundary. A missing
    /// second-level table is allocated on demand.
    pub fn map(
        &self,
        dir: PhysAddr,
        phys: PhysAddr,
        virt: VirtAddr,
        flags: EntryFlags,
        pmm: &mut FrameBitmap,
    ) -> Result<(), VmmError> {
        let phys = phys.align_down(PAGE_SIZE);
        let virt = virt.align_down(PAGE_SIZE);

        let table = self.get_table(dir, virt.dir_index(), Some(pmm))?;
        // SAFETY: table was just looked up or created in dir.
        (unsafe { self.table_mut(table) })[virt.table_index()] = PageEntry::new(phys, flags);

        self.flush_if_current(dir, virt);
        Ok(())
    }

    /// Removes the mapping for `virt` from `dir`.
    pub fn unmap(&self, dir: PhysAddr, virt: VirtAddr) -> Result<(), VmmError> {
        let virt = virt.align_down(PAGE_SIZE);
        let table = self.get_table(dir, virt.dir_index(), None)?;
        // SAFETY: table belongs to dir.
        (unsafe { self.table_mut(table) })[virt.table_index()] = PageEntry::EMPTY;

        self.flush_if_current(dir, virt);
        Ok(())
    }

    /// Translates `virt` through `dir`, returning the physical address.
    pub fn translate(&self, dir: PhysAddr, virt: VirtAddr) -> Result<PhysAddr, VmmError> {
        let table = self.get_table(dir, virt.dir_index(), None)?;
        // SAFETY: table belongs to dir.
        let entry = unsafe { self.table_mut(table) }[virt.table_index()];
        if !entry.is_present() {
            return Err(VmmError::Unmapped);
        }
        Ok(entry.addr() + virt.page_offset())
    }

    /// Maps every frame-aligned address in `[start, end)` to itself.
    pub fn identity_map(
        &self,
        dir: PhysAddr,
        start: PhysAddr,
        end: PhysAddr,
        flags: EntryFlags,
        pmm: &mut FrameBitmap,
    ) -> Result<(), VmmError> {
        let mut addr = start.align_down(PAGE_SIZE);
        let end = end.align_up(PAGE_SIZE);
        while addr < end {
            self.map(dir, addr, VirtAddr::new(addr.as_u32()), flags, pmm)?;
            addr = addr + PAGE_SIZE;
        }
        Ok(())
    }

    /// Clones `src` into a new directory.
    ///
    /// Kernel-half entries (index ≥ 768) are copied by value so the
    /// underlying tables stay shared. User-half tables are duplicated:
    /// writable pages are deep-copied into fresh frames, read-only pages are
    /// shared by reference with their flags preserved. Any allocation
    /// failure rolls back by freeing the partially built directory.
    pub fn clone_directory(
        &self,
        src: PhysAddr,
        pmm: &mut FrameBitmap,
    ) -> Result<PhysAddr, VmmError> {
        let dest = self.create_directory(pmm)?;

        for i in 0..ENTRY_COUNT {
            // SAFETY: src is a live directory; dest was created above.
            let src_entry = unsafe { self.table_mut(src) }[i];
            if !src_entry.is_present() {
                continue;
            }

            if i >= KERNEL_DIR_START {
                // Kernel half: the table itself is shared.
                (unsafe { self.table_mut(dest) })[i] = src_entry;
                continue;
            }

            if let Err(e) = self.clone_user_table(src_entry.addr(), dest, i, pmm) {
                self.free_directory(dest, pmm);
                return Err(e);
            }
        }

        Ok(dest)
    }

    /// Clones one user-half second-level table into `dest[idx]`.
    fn clone_user_table(
        &self,
        src_table: PhysAddr,
        dest: PhysAddr,
        idx: usize,
        pmm: &mut FrameBitmap,
    ) -> Result<(), VmmError> {
        let dest_table = self.get_table(dest, idx, Some(pmm))?;

        for j in 0..ENTRY_COUNT {
            // SAFETY: both tables are live and distinct.
            let entry = unsafe { self.table_mut(src_table) }[j];
            if !entry.is_present() {
                continue;
            }

            let new_entry = if entry.flags().contains(EntryFlags::WRITABLE) {
                // Writable pages are eagerly deep-copied.
                let copy = pmm.alloc_one().map_err(|_| VmmError::OutOfMemory)?;
                let copy_addr = copy.start_address();
                // SAFETY: source frame is mapped through the direct map; the
                // destination frame was just allocated and is unaliased.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        (self.direct_offset + entry.addr().as_u32() as usize) as *const u8,
                        (self.direct_offset + copy_addr.as_u32() as usize) as *mut u8,
                        PAGE_SIZE as usize,
                    );
                }
                PageEntry::new(copy_addr, entry.flags())
            } else {
                // Read-only pages are shared by reference.
                entry
            };
            (unsafe { self.table_mut(dest_table) })[j] = new_entry;
        }
        Ok(())
    }

    /// Frees a directory, its user-half tables, and the frames behind
    /// writable user-half pages.
    ///
    /// Writable user pages are owned by the directory (clone deep-copies
    /// them); read-only pages and kernel-half tables are shared and left
    /// alone.
    pub fn free_directory(&self, dir: PhysAddr, pmm: &mut FrameBitmap) {
        for i in 0..KERNEL_DIR_START {
            // SAFETY: dir is a live directory being torn down.
            let entry = unsafe { self.table_mut(dir) }[i];
            if !entry.is_present() {
                continue;
            }
            let table = entry.addr();
            for j in 0..ENTRY_COUNT {
                // SAFETY: table belongs to dir.
                let page = unsafe { self.table_mut(table) }[j];
                if page.is_present() && page.flags().contains(EntryFlags::WRITABLE) {
                    pmm.free_one(page.addr());
                }
            }
            pmm.free_one(table);
        }
        pmm.free_one(dir);
    }

    /// Installs `dir` in the MMU root register and records it as current.
    pub fn switch_to(&self, dir: PhysAddr) {
        self.current.store(dir.as_u32(), Ordering::Release);
        (self.load_root)(dir);
    }

    /// Returns the currently installed directory, if any.
    pub fn current(&self) -> Option<PhysAddr> {
        match self.current.load(Ordering::Acquire) {
            0 => None,
            raw => Some(PhysAddr::new(raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Arena, arena_pmm};

    const MIB: usize = 1024 * 1024;

    fn setup(size: usize) -> (Arena, FrameBitmap, AddressSpaces) {
        let arena = Arena::new(size);
        let pmm = arena_pmm(&arena);
        let vmm = AddressSpaces::new(arena.offset());
        (arena, pmm, vmm)
    }

    #[test]
    fn map_translate_roundtrip() {
        let (_arena, mut pmm, vmm) = setup(4 * MIB);
        let dir = vmm.create_directory(&mut pmm).unwrap();

        vmm.map(
            dir,
            PhysAddr::new(0x0010_0000),
            VirtAddr::new(0x4000_0000),
            EntryFlags::PRESENT | EntryFlags::WRITABLE,
            &mut pmm,
        )
        .unwrap();

        assert_eq!(
            vmm.translate(dir, VirtAddr::new(0x4000_0000)),
            Ok(PhysAddr::new(0x0010_0000))
        );
        // Page offset is preserved through translation.
        assert_eq!(
            vmm.translate(dir, VirtAddr::new(0x4000_0123)),
            Ok(PhysAddr::new(0x0010_0123))
        );
    }

    #[test]
    fn unmap_clears_translation() {
        let (_arena, mut pmm, vmm) = setup(4 * MIB);
        let dir = vmm.create_directory(&mut pmm).unwrap();

        vmm.map(
            dir,
            PhysAddr::new(0x0010_0000),
            VirtAddr::new(0x4000_0000),
            EntryFlags::PRESENT | EntryFlags::WRITABLE,
            &mut pmm,
        )
        .unwrap();
        vmm.unmap(dir, VirtAddr::new(0x4000_0000)).unwrap();
        assert_eq!(
            vmm.translate(dir, VirtAddr::new(0x4000_0000)),
            Err(VmmError::Unmapped)
        );
    }

    #[test]
    fn translate_unmapped_directory_slot() {
        let (_arena, mut pmm, vmm) = setup(4 * MIB);
        let dir = vmm.create_directory(&mut pmm).unwrap();
        assert_eq!(
            vmm.translate(dir, VirtAddr::new(0x1234_5678)),
            Err(VmmError::Unmapped)
        );
    }

    #[test]
    fn map_aligns_addresses_down() {
        let (_arena, mut pmm, vmm) = setup(4 * MIB);
        let dir = vmm.create_directory(&mut pmm).unwrap();
        vmm.map(
            dir,
            PhysAddr::new(0x0010_0abc),
            VirtAddr::new(0x4000_0def),
            EntryFlags::PRESENT,
            &mut pmm,
        )
        .unwrap();
        assert_eq!(
            vmm.translate(dir, VirtAddr::new(0x4000_0000)),
            Ok(PhysAddr::new(0x0010_0000))
        );
    }

    #[test]
    fn identity_map_covers_range() {
        let (_arena, mut pmm, vmm) = setup(8 * MIB);
        let dir = vmm.create_directory(&mut pmm).unwrap();
        vmm.identity_map(
            dir,
            PhysAddr::new(0x10_0000),
            PhysAddr::new(0x10_0000 + 16 * PAGE_SIZE),
            EntryFlags::PRESENT | EntryFlags::WRITABLE,
            &mut pmm,
        )
        .unwrap();
        for i in 0..16u32 {
            let addr = 0x10_0000 + i * PAGE_SIZE;
            assert_eq!(
                vmm.translate(dir, VirtAddr::new(addr)),
                Ok(PhysAddr::new(addr))
            );
        }
    }

    #[test]
    fn clone_deep_copies_writable_pages() {
        let (arena, mut pmm, vmm) = setup(8 * MIB);
        let d1 = vmm.create_directory(&mut pmm).unwrap();

        let page = pmm.alloc_one().unwrap().start_address();
        arena.write(page.as_u32(), 0xAB);
        vmm.map(
            d1,
            page,
            VirtAddr::new(0x4000_0000),
            EntryFlags::PRESENT | EntryFlags::WRITABLE,
            &mut pmm,
        )
        .unwrap();

        let d2 = vmm.clone_directory(d1, &mut pmm).unwrap();
        let p1 = vmm.translate(d1, VirtAddr::new(0x4000_0000)).unwrap();
        let p2 = vmm.translate(d2, VirtAddr::new(0x4000_0000)).unwrap();

        // Distinct frames with identical contents.
        assert_ne!(p1, p2);
        assert_eq!(arena.read(p2.as_u32()), 0xAB);

        // A write through the clone is not visible through the original.
        arena.write(p2.as_u32(), 0xCD);
        assert_eq!(arena.read(p1.as_u32()), 0xAB);
    }

    #[test]
    fn clone_shares_read_only_pages() {
        let (_arena, mut pmm, vmm) = setup(8 * MIB);
        let d1 = vmm.create_directory(&mut pmm).unwrap();
        let page = pmm.alloc_one().unwrap().start_address();
        vmm.map(
            d1,
            page,
            VirtAddr::new(0x4000_0000),
            EntryFlags::PRESENT,
            &mut pmm,
        )
        .unwrap();

        let d2 = vmm.clone_directory(d1, &mut pmm).unwrap();
        assert_eq!(
            vmm.translate(d1, VirtAddr::new(0x4000_0000)).unwrap(),
            vmm.translate(d2, VirtAddr::new(0x4000_0000)).unwrap()
        );
    }

    #[test]
    fn clone_shares_kernel_half_tables() {
        let (arena, mut pmm, vmm) = setup(8 * MIB);
        let d1 = vmm.create_directory(&mut pmm).unwrap();
        let page = pmm.alloc_one().unwrap().start_address();
        // 0xC000_0000 is the first kernel-half address.
        vmm.map(
            d1,
            page,
            VirtAddr::new(0xC000_0000),
            EntryFlags::PRESENT | EntryFlags::WRITABLE,
            &mut pmm,
        )
        .unwrap();

        let d2 = vmm.clone_directory(d1, &mut pmm).unwrap();
        // Kernel-half entries are identical: same table, same page.
        assert_eq!(
            vmm.translate(d2, VirtAddr::new(0xC000_0000)).unwrap(),
            page
        );

        // Mapping through one directory's kernel half is visible in the
        // other, because the table is shared.
        let page2 = pmm.alloc_one().unwrap().start_address();
        vmm.map(
            d1,
            page2,
            VirtAddr::new(0xC000_1000),
            EntryFlags::PRESENT | EntryFlags::WRITABLE,
            &mut pmm,
        )
        .unwrap();
        assert_eq!(
            vmm.translate(d2, VirtAddr::new(0xC000_1000)).unwrap(),
            page2
        );
        let _ = arena;
    }

    #[test]
    fn free_directory_returns_frames() {
        let (_arena, mut pmm, vmm) = setup(8 * MIB);
        let d1 = vmm.create_directory(&mut pmm).unwrap();
        let page = pmm.alloc_one().unwrap().start_address();
        vmm.map(
            d1,
            page,
            VirtAddr::new(0x4000_0000),
            EntryFlags::PRESENT | EntryFlags::WRITABLE,
            &mut pmm,
        )
        .unwrap();

        let before = pmm.stats().used;
        let d2 = vmm.clone_directory(d1, &mut pmm).unwrap();
        vmm.free_directory(d2, &mut pmm);
        assert_eq!(pmm.stats().used, before);
    }

    #[test]
    fn switch_to_tracks_current() {
        let (_arena, mut pmm, vmm) = setup(4 * MIB);
        assert_eq!(vmm.current(), None);
        let dir = vmm.create_directory(&mut pmm).unwrap();
        vmm.switch_to(dir);
        assert_eq!(vmm.current(), Some(dir));
    }

    #[test]
    fn clone_failure_rolls_back() {
        let (_arena, mut pmm, vmm) = setup(2 * MIB);
        let d1 = vmm.create_directory(&mut pmm).unwrap();
        // Map a handful of writable pages so the clone needs frames.
        for i in 0..8u32 {
            let page = pmm.alloc_one().unwrap().start_address();
            vmm.map(
                d1,
                page,
                VirtAddr::new(0x4000_0000 + i * PAGE_SIZE),
                EntryFlags::PRESENT | EntryFlags::WRITABLE,
                &mut pmm,
            )
            .unwrap();
        }
        // Leave exactly three free frames: enough for the new directory, one
        // table and one page copy, but not the full clone.
        let mut hoard = Vec::new();
        while let Ok(frame) = pmm.alloc_one() {
            hoard.push(frame);
        }
        for frame in hoard.drain(..).take(3) {
            pmm.free_one(frame.start_address());
        }
        let used = pmm.stats().used;
        assert_eq!(vmm.clone_directory(d1, &mut pmm), Err(VmmError::OutOfMemory));
        // Rollback freed whatever the partial clone took.
        assert_eq!(pmm.stats().used, used);
    }
}
