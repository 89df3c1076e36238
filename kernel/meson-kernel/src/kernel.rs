//! The kernel aggregate: one owned state object per subsystem, initialized
//! in boot order and threaded to the interrupt glue.
//!
//! `bootstrap` follows the classic sequence: validate the boot magic, parse
//! the memory map, bring up the frame allocator, build and install the
//! kernel address space (low identity map plus the higher-half kernel
//! mapping), start the scheduler, then the network stack with a loopback
//! interface. All of it is driven through byte slices and the direct-map
//! offset, so the same path runs against a synthetic boot image in host
//! tests.

use alloc::boxed::Box;
use core::ops::Range;

use meson_core::addr::{PAGE_SIZE, PhysAddr, VirtAddr};
use meson_core::boot::{self, BootError, MemRegion, MultibootInfo};
use meson_core::paging::EntryFlags;
use meson_drivers::loopback::Loopback;
use meson_mm::pmm::FrameBitmap;
use meson_mm::vmm::AddressSpaces;
use meson_net::iface::{IfKind, Interface, Ipv4Config};
use meson_net::ipv4::Route;
use meson_net::stack::NetStack;
use meson_net::{Ipv4Address, NetError};
use meson_sched::{ContextSwitch, Priority, SchedError, Scheduler};

/// Base of the higher-half kernel mapping (3 GiB).
pub const KERNEL_BASE: u32 = 0xC000_0000;

/// Upper bound of the boot-time identity map (the low 4 MiB).
pub const IDENTITY_LIMIT: u32 = 4 * 1024 * 1024;

/// Packet-pool slots carved at boot.
const POOL_SLOTS: usize = 64;

/// Loopback address and mask.
const LOOPBACK_ADDR: Ipv4Address = Ipv4Address::new(127, 0, 0, 1);

/// Errors surfaced during kernel bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Boot-protocol validation or parsing failed.
    Boot(BootError),
    /// The memory map yielded no usable frames.
    OutOfMemory,
    /// Building the kernel address space failed.
    AddressSpace,
    /// Scheduler bring-up failed.
    Sched(SchedError),
    /// Network bring-up failed.
    Net(NetError),
}

impl From<BootError> for KernelError {
    fn from(e: BootError) -> Self {
        Self::Boot(e)
    }
}

/// Everything the boot path needs besides the multiboot image itself.
pub struct BootParams<'a> {
    /// Magic value the bootloader passed in.
    pub magic: u32,
    /// Raw multiboot information structure.
    pub info: &'a [u8],
    /// Raw memory-map buffer the info structure points at.
    pub memory_map: &'a [u8],
    /// Physical extent of the kernel image.
    pub kernel_image: Range<PhysAddr>,
    /// Direct-map offset for all physical memory access.
    pub direct_offset: usize,
    /// Entry point of the idle task (an architecture halt loop).
    pub idle_entry: u32,
}

/// The kernel: sole owner of the subsystem state objects.
///
/// On the single-CPU target, interrupt masking brackets every entry point
/// into this structure; there is no other locking.
pub struct Kernel {
    /// Physical frame allocator.
    pub pmm: FrameBitmap,
    /// Address-space manager.
    pub vmm: AddressSpaces,
    /// Root of the kernel address space.
    pub kernel_dir: PhysAddr,
    /// Process scheduler.
    pub sched: Scheduler,
    /// Network stack.
    pub net: NetStack,
}

impl Kernel {
    /// Validates the boot image and builds the frame allocator.
    ///
    /// Runs before the kernel heap exists, so the region list lives in a
    /// stack buffer rather than a `Vec`.
    pub fn build_pmm(params: &BootParams<'_>) -> Result<FrameBitmap, KernelError> {
        boot::check_magic(params.magic)?;
        let _info = MultibootInfo::parse(params.info)?;

        let mut regions = [MemRegion {
            start: PhysAddr::zero(),
            size: 0,
            usable: false,
        }; 32];
        let mut count = 0;
        for region in boot::memory_map(params.memory_map) {
            if count == regions.len() {
                break;
            }
            regions[count] = region;
            count += 1;
        }

        // SAFETY: the caller's direct-map offset covers the described
        // physical memory, and boot runs once.
        unsafe {
            FrameBitmap::new(
                &regions[..count],
                params.kernel_image.clone(),
                params.direct_offset,
            )
            .map_err(|_| KernelError::OutOfMemory)
        }
    }

    /// Brings the remaining subsystems up on an initialized frame
    /// allocator. The kernel heap must be live (allocations happen here).
    pub fn bootstrap(params: &BootParams<'_>, mut pmm: FrameBitmap) -> Result<Self, KernelError> {
        let vmm = Self::build_address_spaces(params, &mut pmm)?;
        let kernel_dir = vmm.current().ok_or(KernelError::AddressSpace)?;

        let sched = Scheduler::new(&mut pmm, &vmm, params.direct_offset, params.idle_entry)
            .map_err(KernelError::Sched)?;

        let mut net = NetStack::new(&mut pmm, params.direct_offset, POOL_SLOTS)
            .map_err(KernelError::Net)?;
        Self::bring_up_loopback(&mut net)?;

        Ok(Self {
            pmm,
            vmm,
            kernel_dir,
            sched,
            net,
        })
    }

    /// Builds and installs the kernel address space: identity-map low
    /// memory, then mirror the kernel image into the higher half.
    fn build_address_spaces(
        params: &BootParams<'_>,
        pmm: &mut FrameBitmap,
    ) -> Result<AddressSpaces, KernelError> {
        #[cfg(all(target_os = "none", target_arch = "x86"))]
        let vmm = AddressSpaces::with_arch_hooks(
            params.direct_offset,
            crate::arch::flush_tlb_entry,
            crate::arch::load_page_directory,
        );
        #[cfg(not(all(target_os = "none", target_arch = "x86")))]
        let vmm = AddressSpaces::new(params.direct_offset);

        let dir = vmm
            .create_directory(pmm)
            .map_err(|_| KernelError::AddressSpace)?;

        let mem_top = boot::memory_map(params.memory_map)
            .filter(|r| r.usable)
            .map(|r| r.end())
            .max()
            .unwrap_or(0);
        let identity_end = PhysAddr::new(mem_top.min(IDENTITY_LIMIT));
        vmm.identity_map(
            dir,
            PhysAddr::zero(),
            identity_end,
            EntryFlags::PRESENT | EntryFlags::WRITABLE,
            pmm,
        )
        .map_err(|_| KernelError::AddressSpace)?;

        // Higher-half view of the kernel image.
        let mut phys = params.kernel_image.start.align_down(PAGE_SIZE);
        let image_end = params.kernel_image.end.align_up(PAGE_SIZE);
        while phys < image_end {
            vmm.map(
                dir,
                phys,
                VirtAddr::new(KERNEL_BASE.wrapping_add(phys.as_u32())),
                EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::GLOBAL,
                pmm,
            )
            .map_err(|_| KernelError::AddressSpace)?;
            phys = phys + PAGE_SIZE;
        }

        vmm.switch_to(dir);
        Ok(vmm)
    }

    /// Registers the loopback interface and its connected route.
    fn bring_up_loopback(net: &mut NetStack) -> Result<(), KernelError> {
        let lo = net
            .ifaces
            .register(Interface::new(
                "lo0",
                IfKind::Loopback,
                65535,
                Box::new(Loopback::new()),
            ))
            .map_err(KernelError::Net)?;
        net.ifaces
            .configure_ipv4(
                lo,
                Ipv4Config {
                    addr: LOOPBACK_ADDR,
                    netmask: Ipv4Address::new(255, 0, 0, 0),
                    broadcast: Ipv4Address::new(127, 255, 255, 255),
                    gateway: Ipv4Address::UNSPECIFIED,
                },
            )
            .map_err(KernelError::Net)?;
        net.ipv4.add_route(Route {
            network: Ipv4Address::new(127, 0, 0, 0),
            netmask: Ipv4Address::new(255, 0, 0, 0),
            gateway: None,
            iface: lo,
            metric: 0,
        });
        Ok(())
    }

    /// Timer interrupt body: advance time, drive the scheduler.
    pub fn on_timer_tick(&mut self, sw: &mut impl ContextSwitch) {
        self.sched.tick(&mut self.pmm, &self.vmm, sw);
    }

    /// NIC interrupt body: drain receive rings through the dispatch chain.
    pub fn on_nic_interrupt(&mut self) {
        self.net.process_rx(self.sched.now());
    }

    /// Spawns a kernel task.
    pub fn spawn(
        &mut self,
        name: &str,
        entry: u32,
        arg: u32,
        priority: Priority,
    ) -> Result<u32, SchedError> {
        self.sched.spawn(&mut self.pmm, &self.vmm, name, entry, arg, priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;
    use meson_sched::CpuContext;

    const MIB: usize = 1024 * 1024;

    struct Arena {
        ptr: *mut u8,
        size: usize,
    }

    impl Arena {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, PAGE_SIZE as usize).unwrap();
            // SAFETY: layout is valid and non-zero.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self { ptr, size }
        }
    }

    impl Drop for Arena {
        fn drop(&mut self) {
            let layout = Layout::from_size_align(self.size, PAGE_SIZE as usize).unwrap();
            // SAFETY: allocated with the identical layout.
            unsafe { std::alloc::dealloc(self.ptr, layout) };
        }
    }

    struct RecordingSwitch;

    impl ContextSwitch for RecordingSwitch {
        fn switch(&mut self, _prev: &mut CpuContext, _next: &CpuContext) {}
    }

    /// Synthetic multiboot image: info structure + memory map describing
    /// one usable region the size of the arena.
    fn boot_image(mem_bytes: u32) -> (Vec<u8>, Vec<u8>) {
        let mut map = Vec::new();
        map.extend_from_slice(&20u32.to_le_bytes());
        map.extend_from_slice(&0u64.to_le_bytes());
        map.extend_from_slice(&u64::from(mem_bytes).to_le_bytes());
        map.extend_from_slice(&1u32.to_le_bytes());

        let mut info = vec![0u8; 52];
        info[0..4].copy_from_slice(&(1u32 << 6).to_le_bytes());
        info[44..48].copy_from_slice(&(map.len() as u32).to_le_bytes());
        (info, map)
    }

    fn boot(arena: &Arena) -> Kernel {
        let (info, map) = boot_image(arena.size as u32);
        let params = BootParams {
            magic: boot::MULTIBOOT_MAGIC,
            info: &info,
            memory_map: &map,
            kernel_image: PhysAddr::zero()..PhysAddr::new(8 * PAGE_SIZE),
            direct_offset: arena.ptr as usize,
            idle_entry: 0x0010_0000,
        };
        let pmm = Kernel::build_pmm(&params).unwrap();
        Kernel::bootstrap(&params, pmm).unwrap()
    }

    #[test]
    fn bootstrap_rejects_bad_magic() {
        let arena = Arena::new(16 * MIB);
        let (info, map) = boot_image(arena.size as u32);
        let params = BootParams {
            magic: 0x1BAD_B002,
            info: &info,
            memory_map: &map,
            kernel_image: PhysAddr::zero()..PhysAddr::new(8 * PAGE_SIZE),
            direct_offset: arena.ptr as usize,
            idle_entry: 0x0010_0000,
        };
        assert!(matches!(
            Kernel::build_pmm(&params),
            Err(KernelError::Boot(BootError::BadMagic(_)))
        ));
    }

    #[test]
    fn bootstrap_builds_all_subsystems() {
        let arena = Arena::new(16 * MIB);
        let kernel = boot(&arena);

        let stats = kernel.pmm.stats();
        assert_eq!(stats.total, 16 * MIB / PAGE_SIZE as usize);
        assert!(stats.free > 0);
        assert_eq!(stats.used + stats.free, stats.total);

        // Identity map covers low memory in the installed directory.
        assert_eq!(
            kernel.vmm.translate(kernel.kernel_dir, VirtAddr::new(0x0030_0000)),
            Ok(PhysAddr::new(0x0030_0000))
        );
        // The kernel image is visible in the higher half.
        assert_eq!(
            kernel.vmm.translate(kernel.kernel_dir, VirtAddr::new(KERNEL_BASE + 0x1000)),
            Ok(PhysAddr::new(0x1000))
        );

        assert_eq!(kernel.sched.current_pid(), 0);
        assert_eq!(kernel.net.ifaces.count(), 1);
    }

    #[test]
    fn spawned_tasks_rotate_under_timer() {
        let arena = Arena::new(16 * MIB);
        let mut kernel = boot(&arena);
        let mut sw = RecordingSwitch;

        let a = kernel.spawn("worker-a", 0x0020_0000, 0, Priority::Normal).unwrap();
        let b = kernel.spawn("worker-b", 0x0020_0000, 0, Priority::Normal).unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            kernel.on_timer_tick(&mut sw);
            seen.insert(kernel.sched.current_pid());
        }
        assert!(seen.contains(&a));
        assert!(seen.contains(&b));
        assert!(seen.contains(&0));
    }

    #[test]
    fn loopback_udp_roundtrip_through_the_kernel() {
        let arena = Arena::new(16 * MIB);
        let mut kernel = boot(&arena);

        let sock = kernel.net.udp.bind(LOOPBACK_ADDR, 4242, None).unwrap();
        meson_net::udp::send(&mut kernel.net, sock, LOOPBACK_ADDR, 4242, b"boot ok").unwrap();
        kernel.on_nic_interrupt();

        let mut out = [0u8; 32];
        let n = kernel.net.udp.receive(sock, &mut out);
        assert_eq!(&out[..n], b"boot ok");
    }
}
