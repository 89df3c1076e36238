//! Intel e1000 Ethernet controller driver.
//!
//! Operates two 32-entry rings of legacy 16-byte descriptors with 2 KiB
//! buffers, all placed in DMA-visible memory from the frame allocator and
//! reached through the direct-map offset. `rx_cur` and `tx_cur` always name
//! the next descriptor the driver (not the hardware) touches, and the tail
//! register is kept at least one slot behind the device's head so the rings
//! never overrun.

pub mod regs;

use core::ptr;

use meson_core::addr::{PAGE_SIZE, PhysAddr};
use meson_mm::pmm::FrameBitmap;
use meson_net::iface::DeviceOps;
use meson_net::packet::{Packet, PacketPool};
use meson_net::{MacAddress, NetError};

use regs::{
    Ctrl, ICR_LSC, ICR_RXDMT0, ICR_RXO, ICR_RXT0, ICR_TXQE, Rctl, RxDesc, RXD_STAT_DD, Status,
    Tctl, TCTL_COLD_SHIFT, TCTL_CT_SHIFT, TXD_CMD_EOP, TXD_CMD_IFCS, TXD_CMD_RS, TXD_STAT_DD,
    TxDesc,
};

/// Descriptors per ring.
pub const RING_SIZE: usize = 32;

/// Bytes per rx/tx buffer.
pub const BUF_SIZE: usize = 2048;

/// Bounded spin iterations for self-clearing hardware bits.
const RESET_POLL_LIMIT: u32 = 100_000;

/// An e1000 NIC bound to an MMIO region and DMA memory.
pub struct E1000 {
    mmio: *mut u8,
    direct_offset: usize,
    rx_ring_phys: PhysAddr,
    tx_ring_phys: PhysAddr,
    rx_bufs_phys: PhysAddr,
    tx_bufs_phys: PhysAddr,
    /// Next receive descriptor the driver will examine.
    rx_cur: usize,
    /// Next transmit descriptor the driver will fill.
    tx_cur: usize,
    mac: MacAddress,
}

// SAFETY: The MMIO pointer and DMA regions are exclusively owned by this
// driver instance; the registry serializes access.
unsafe impl Send for E1000 {}

impl E1000 {
    /// Frames needed for both rings and both buffer arrays.
    const RING_FRAMES: usize = 1;
    const BUF_FRAMES: usize = (RING_SIZE * BUF_SIZE) / PAGE_SIZE as usize;

    /// Allocates the descriptor rings and packet buffers in DMA-visible
    /// memory. Hardware setup happens in [`DeviceOps::init`].
    pub fn new(
        mmio: *mut u8,
        pmm: &mut FrameBitmap,
        direct_offset: usize,
    ) -> Result<Self, NetError> {
        let rx_ring_phys = Self::dma_alloc(pmm, Self::RING_FRAMES)?;
        let tx_ring_phys = Self::dma_alloc(pmm, Self::RING_FRAMES)?;
        let rx_bufs_phys = Self::dma_alloc(pmm, Self::BUF_FRAMES)?;
        let tx_bufs_phys = Self::dma_alloc(pmm, Self::BUF_FRAMES)?;

        Ok(Self {
            mmio,
            direct_offset,
            rx_ring_phys,
            tx_ring_phys,
            rx_bufs_phys,
            tx_bufs_phys,
            rx_cur: 0,
            tx_cur: 0,
            mac: MacAddress::default(),
        })
    }

    fn dma_alloc(pmm: &mut FrameBitmap, frames: usize) -> Result<PhysAddr, NetError> {
        Ok(pmm
            .alloc_run(frames)
            .map_err(|_| NetError::PoolExhausted)?
            .start_address())
    }

    /// Returns the DMA memory to the frame allocator.
    ///
    /// The device must be stopped; the hardware may no longer reference the
    /// rings.
    pub fn release(self, pmm: &mut FrameBitmap) {
        pmm.free_run(self.rx_ring_phys, Self::RING_FRAMES);
        pmm.free_run(self.tx_ring_phys, Self::RING_FRAMES);
        pmm.free_run(self.rx_bufs_phys, Self::BUF_FRAMES);
        pmm.free_run(self.tx_bufs_phys, Self::BUF_FRAMES);
    }

    fn read_reg(&self, reg: usize) -> u32 {
        // SAFETY: reg is a register offset within the device's MMIO window.
        unsafe { ptr::read_volatile(self.mmio.add(reg) as *const u32) }
    }

    fn write_reg(&self, reg: usize, value: u32) {
        // SAFETY: reg is a register offset within the device's MMIO window.
        unsafe { ptr::write_volatile(self.mmio.add(reg) as *mut u32, value) }
    }

    fn dma_ptr(&self, phys: PhysAddr) -> *mut u8 {
        (self.direct_offset + phys.as_u32() as usize) as *mut u8
    }

    /// Mutable view of a receive descriptor.
    ///
    /// # Safety
    ///
    /// `idx < RING_SIZE`; the descriptor memory belongs to this driver and
    /// no other reference to it is live.
    #[allow(clippy::mut_from_ref)]
    unsafe fn rx_desc(&self, idx: usize) -> &mut RxDesc {
        // SAFETY: per the function contract.
        unsafe { &mut *(self.dma_ptr(self.rx_ring_phys) as *mut RxDesc).add(idx) }
    }

    /// Mutable view of a transmit descriptor.
    ///
    /// # Safety
    ///
    /// `idx < RING_SIZE`; the descriptor memory belongs to this driver and
    /// no other reference to it is live.
    #[allow(clippy::mut_from_ref)]
    unsafe fn tx_desc(&self, idx: usize) -> &mut TxDesc {
        // SAFETY: per the function contract.
        unsafe { &mut *(self.dma_ptr(self.tx_ring_phys) as *mut TxDesc).add(idx) }
    }

    fn rx_buf_phys(&self, idx: usize) -> PhysAddr {
        self.rx_bufs_phys + (idx * BUF_SIZE) as u32
    }

    fn tx_buf_phys(&self, idx: usize) -> PhysAddr {
        self.tx_bufs_phys + (idx * BUF_SIZE) as u32
    }

    /// Reads one 16-bit word from the EEPROM, with a bounded completion
    /// poll.
    fn eeprom_read(&self, word: u8) -> u16 {
        self.write_reg(
            regs::EERD,
            (u32::from(word) << regs::EERD_ADDR_SHIFT) | regs::EERD_START,
        );
        for _ in 0..RESET_POLL_LIMIT {
            let value = self.read_reg(regs::EERD);
            if value & regs::EERD_DONE != 0 {
                return (value >> regs::EERD_DATA_SHIFT) as u16;
            }
            core::hint::spin_loop();
        }
        0
    }

    /// Reads the MAC from RAL/RAH (EEPROM auto-load), falling back to
    /// direct EEPROM reads.
    fn read_mac(&self) -> MacAddress {
        let ral = self.read_reg(regs::RAL);
        let rah = self.read_reg(regs::RAH);
        if ral != 0 || rah & 0xFFFF != 0 {
            MacAddress([
                ral as u8,
                (ral >> 8) as u8,
                (ral >> 16) as u8,
                (ral >> 24) as u8,
                rah as u8,
                (rah >> 8) as u8,
            ])
        } else {
            let w0 = self.eeprom_read(0);
            let w1 = self.eeprom_read(1);
            let w2 = self.eeprom_read(2);
            MacAddress([
                w0 as u8,
                (w0 >> 8) as u8,
                w1 as u8,
                (w1 >> 8) as u8,
                w2 as u8,
                (w2 >> 8) as u8,
            ])
        }
    }

    fn init_rx(&mut self) {
        for i in 0..RING_SIZE {
            // SAFETY: i < RING_SIZE.
            let desc = unsafe { self.rx_desc(i) };
            desc.addr = u64::from(self.rx_buf_phys(i).as_u32());
            desc.length = 0;
            desc.checksum = 0;
            desc.status = 0;
            desc.errors = 0;
            desc.special = 0;
        }

        self.write_reg(regs::RDBAL, self.rx_ring_phys.as_u32());
        self.write_reg(regs::RDBAH, 0);
        self.write_reg(regs::RDLEN, (RING_SIZE * size_of::<RxDesc>()) as u32);
        self.write_reg(regs::RDH, 0);
        // Tail one behind head so the hardware never laps the driver.
        self.write_reg(regs::RDT, (RING_SIZE - 1) as u32);
        self.rx_cur = 0;

        let rctl = Rctl::EN | Rctl::BAM | Rctl::UPE | Rctl::MPE | Rctl::SECRC;
        self.write_reg(regs::RCTL, rctl.bits());
    }

    fn init_tx(&mut self) {
        for i in 0..RING_SIZE {
            // SAFETY: i < RING_SIZE.
            let desc = unsafe { self.tx_desc(i) };
            desc.addr = u64::from(self.tx_buf_phys(i).as_u32());
            desc.length = 0;
            desc.cso = 0;
            desc.cmd = 0;
            // Start "done" so the first pass around the ring may transmit.
            desc.status = TXD_STAT_DD;
            desc.css = 0;
            desc.special = 0;
        }

        self.write_reg(regs::TDBAL, self.tx_ring_phys.as_u32());
        self.write_reg(regs::TDBAH, 0);
        self.write_reg(regs::TDLEN, (RING_SIZE * size_of::<TxDesc>()) as u32);
        self.write_reg(regs::TDH, 0);
        self.write_reg(regs::TDT, 0);
        self.tx_cur = 0;

        let tctl = Tctl::EN.bits()
            | Tctl::PSP.bits()
            | (15 << TCTL_CT_SHIFT)
            | (64 << TCTL_COLD_SHIFT);
        self.write_reg(regs::TCTL, tctl);
    }

    /// Reads and clears the interrupt cause register.
    pub fn interrupt_cause(&self) -> u32 {
        self.read_reg(regs::ICR)
    }

    /// Current link state from the status register.
    pub fn link_status(&self) -> bool {
        Status::from_bits_truncate(self.read_reg(regs::STATUS)).contains(Status::LU)
    }
}

impl DeviceOps for E1000 {
    fn init(&mut self) -> Result<(), NetError> {
        // Reset and wait (bounded) for the bit to self-clear.
        let ctrl = self.read_reg(regs::CTRL);
        self.write_reg(regs::CTRL, ctrl | Ctrl::RST.bits());
        for _ in 0..RESET_POLL_LIMIT {
            if self.read_reg(regs::CTRL) & Ctrl::RST.bits() == 0 {
                break;
            }
            core::hint::spin_loop();
        }

        // Mask everything and drop pending causes while configuring.
        self.write_reg(regs::IMC, 0xFFFF_FFFF);
        let _ = self.read_reg(regs::ICR);

        self.mac = self.read_mac();

        // Bring the link up with auto-speed detection.
        let ctrl = self.read_reg(regs::CTRL);
        self.write_reg(regs::CTRL, ctrl | (Ctrl::SLU | Ctrl::ASDE).bits());

        // Clear the multicast table array.
        for i in 0..regs::MTA_COUNT {
            self.write_reg(regs::MTA + i * 4, 0);
        }

        self.init_rx();
        self.init_tx();

        // Unmask the minimal interrupt set.
        self.write_reg(
            regs::IMS,
            ICR_LSC | ICR_RXT0 | ICR_RXDMT0 | ICR_RXO | ICR_TXQE,
        );
        Ok(())
    }

    fn cleanup(&mut self) {
        self.stop();
        self.write_reg(regs::IMC, 0xFFFF_FFFF);
        let _ = self.read_reg(regs::ICR);
    }

    fn start(&mut self) -> Result<(), NetError> {
        self.write_reg(regs::RCTL, self.read_reg(regs::RCTL) | Rctl::EN.bits());
        self.write_reg(regs::TCTL, self.read_reg(regs::TCTL) | Tctl::EN.bits());
        Ok(())
    }

    fn stop(&mut self) {
        self.write_reg(regs::RCTL, self.read_reg(regs::RCTL) & !Rctl::EN.bits());
        self.write_reg(regs::TCTL, self.read_reg(regs::TCTL) & !Tctl::EN.bits());
    }

    fn send(&mut self, packet: &Packet) -> Result<(), NetError> {
        let data = packet.data();
        if data.len() > BUF_SIZE {
            return Err(NetError::PacketTooLarge);
        }

        let idx = self.tx_cur;
        // SAFETY: idx < RING_SIZE.
        let desc = unsafe { self.tx_desc(idx) };
        if desc.status & TXD_STAT_DD == 0 {
            // Hardware still owns this slot; no blocking.
            return Err(NetError::TxQueueFull);
        }

        // SAFETY: the buffer is BUF_SIZE bytes of driver-owned DMA memory
        // and data fits per the check above.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.dma_ptr(self.tx_buf_phys(idx)), data.len());
        }

        desc.length = data.len() as u16;
        desc.cmd = TXD_CMD_EOP | TXD_CMD_IFCS | TXD_CMD_RS;
        desc.status = 0;

        self.tx_cur = (idx + 1) % RING_SIZE;
        self.write_reg(regs::TDT, self.tx_cur as u32);
        Ok(())
    }

    fn receive(&mut self, pool: &mut PacketPool) -> Option<Packet> {
        let idx = self.rx_cur;
        // SAFETY: idx < RING_SIZE.
        let desc = unsafe { self.rx_desc(idx) };
        if desc.status & RXD_STAT_DD == 0 {
            return None;
        }

        let len = (desc.length as usize).min(BUF_SIZE);
        if desc.errors != 0 {
            // Drop the errored frame but recycle the descriptor.
            desc.status = 0;
            desc.errors = 0;
            self.rx_cur = (idx + 1) % RING_SIZE;
            self.write_reg(regs::RDT, idx as u32);
            return None;
        }

        // Leave the descriptor to the hardware if the pool is dry; the next
        // poll retries.
        let mut packet = pool.alloc(len).ok()?;
        // SAFETY: the device wrote len bytes into this driver-owned buffer.
        unsafe {
            ptr::copy_nonoverlapping(
                self.dma_ptr(self.rx_buf_phys(idx)) as *const u8,
                packet.data_mut().as_mut_ptr(),
                len,
            );
        }

        // Hand the slot back: clear status, advance, expose the old index
        // as the new tail.
        desc.status = 0;
        self.rx_cur = (idx + 1) % RING_SIZE;
        self.write_reg(regs::RDT, idx as u32);
        Some(packet)
    }

    fn mac_address(&self) -> MacAddress {
        self.mac
    }

    fn set_mac(&mut self, mac: MacAddress) -> Result<(), NetError> {
        self.mac = mac;
        let low = u32::from(mac.0[0])
            | u32::from(mac.0[1]) << 8
            | u32::from(mac.0[2]) << 16
            | u32::from(mac.0[3]) << 24;
        let high = u32::from(mac.0[4]) | u32::from(mac.0[5]) << 8;
        self.write_reg(regs::RAL, low);
        self.write_reg(regs::RAH, high);
        Ok(())
    }

    fn set_promiscuous(&mut self, on: bool) {
        let rctl = self.read_reg(regs::RCTL);
        let bit = Rctl::UPE.bits();
        self.write_reg(regs::RCTL, if on { rctl | bit } else { rctl & !bit });
    }

    fn set_multicast(&mut self, on: bool) {
        let rctl = self.read_reg(regs::RCTL);
        let bit = Rctl::MPE.bits();
        self.write_reg(regs::RCTL, if on { rctl | bit } else { rctl & !bit });
    }

    fn link_up(&self) -> bool {
        self.link_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;
    use meson_core::boot::MemRegion;

    const MMIO_SIZE: usize = 128 * 1024;

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

    /// Fake MMIO register block backed by plain memory.
    struct FakeMmio {
        arena: Arena,
    }

    impl FakeMmio {
        fn new() -> Self {
            Self {
                arena: Arena::new(MMIO_SIZE),
            }
        }

        fn base(&self) -> *mut u8 {
            self.arena.ptr
        }

        fn read(&self, reg: usize) -> u32 {
            // SAFETY: reg < MMIO_SIZE.
            unsafe { ptr::read_volatile(self.arena.ptr.add(reg) as *const u32) }
        }

        fn write(&self, reg: usize, value: u32) {
            // SAFETY: reg < MMIO_SIZE.
            unsafe { ptr::write_volatile(self.arena.ptr.add(reg) as *mut u32, value) }
        }
    }

    fn setup() -> (Arena, FrameBitmap, PacketPool, FakeMmio, E1000) {
        let arena = Arena::new(2 * 1024 * 1024);
        let regions = [MemRegion {
            start: PhysAddr::zero(),
            size: arena.size as u32,
            usable: true,
        }];
        let kernel = PhysAddr::zero()..PhysAddr::new(4 * PAGE_SIZE);
        let mut pmm = unsafe {
            FrameBitmap::new(&regions, kernel, arena.ptr as usize).unwrap()
        };
        let pool = PacketPool::new(&mut pmm, arena.ptr as usize, 64).unwrap();

        let mmio = FakeMmio::new();
        // A fake EEPROM auto-load: the MAC sits in RAL/RAH before reset.
        mmio.write(regs::RAL, 0x0300_0002);
        mmio.write(regs::RAH, 0x0000_0605);

        let mut dev = E1000::new(mmio.base(), &mut pmm, arena.ptr as usize).unwrap();
        dev.init().unwrap();
        (arena, pmm, pool, mmio, dev)
    }

    #[test]
    fn init_programs_rings_and_interrupts() {
        let (_arena, _pmm, _pool, mmio, dev) = setup();

        assert_eq!(mmio.read(regs::RDBAL), dev.rx_ring_phys.as_u32());
        assert_eq!(mmio.read(regs::RDLEN) as usize, RING_SIZE * 16);
        assert_eq!(mmio.read(regs::RDT) as usize, RING_SIZE - 1);
        assert_eq!(mmio.read(regs::TDBAL), dev.tx_ring_phys.as_u32());
        assert_eq!(mmio.read(regs::TDT), 0);

        let rctl = Rctl::from_bits_truncate(mmio.read(regs::RCTL));
        assert!(rctl.contains(Rctl::EN | Rctl::BAM | Rctl::UPE | Rctl::MPE | Rctl::SECRC));

        let tctl = mmio.read(regs::TCTL);
        assert!(Tctl::from_bits_truncate(tctl).contains(Tctl::EN | Tctl::PSP));
        assert_eq!((tctl >> TCTL_CT_SHIFT) & 0xFF, 15);
        assert_eq!((tctl >> TCTL_COLD_SHIFT) & 0x3FF, 64);

        assert_eq!(
            mmio.read(regs::IMS),
            ICR_LSC | ICR_RXT0 | ICR_RXDMT0 | ICR_RXO | ICR_TXQE
        );
    }

    #[test]
    fn mac_read_from_receive_address_registers() {
        let (_arena, _pmm, _pool, _mmio, dev) = setup();
        assert_eq!(dev.mac_address(), MacAddress([2, 0, 0, 3, 5, 6]));
    }

    #[test]
    fn send_fills_descriptor_and_advances_tail() {
        let (arena, _pmm, mut pool, mmio, mut dev) = setup();
        let mut pkt = pool.alloc(64).unwrap();
        pkt.data_mut().fill(0x42);

        dev.send(&pkt).unwrap();
        pool.free(pkt);

        // SAFETY: descriptor 0 belongs to the driver under test.
        let desc = unsafe { dev.tx_desc(0) };
        assert_eq!(desc.length, 64);
        assert_eq!(desc.cmd, TXD_CMD_EOP | TXD_CMD_IFCS | TXD_CMD_RS);
        assert_eq!(desc.status, 0);
        assert_eq!(mmio.read(regs::TDT), 1);

        // Frame bytes landed in the slot's DMA buffer.
        let buf = dev.dma_ptr(dev.tx_buf_phys(0));
        // SAFETY: driver-owned buffer, 64 bytes just written.
        let copied = unsafe { core::slice::from_raw_parts(buf, 64) };
        assert!(copied.iter().all(|&b| b == 0x42));
        drop(arena);
    }

    #[test]
    fn send_fails_fast_when_ring_is_full() {
        let (_arena, _pmm, mut pool, _mmio, mut dev) = setup();
        let pkt = pool.alloc(32).unwrap();

        // Fill the whole ring; the fake hardware never sets DD back.
        for _ in 0..RING_SIZE {
            dev.send(&pkt).unwrap();
        }
        assert!(matches!(dev.send(&pkt), Err(NetError::TxQueueFull)));
        pool.free(pkt);
    }

    #[test]
    fn receive_drains_done_descriptors() {
        let (_arena, _pmm, mut pool, mmio, mut dev) = setup();

        // Fake hardware: deposit a frame into slot 0 and mark it done.
        let frame = [0xABu8; 60];
        // SAFETY: driver-owned DMA buffer.
        unsafe {
            ptr::copy_nonoverlapping(frame.as_ptr(), dev.dma_ptr(dev.rx_buf_phys(0)), frame.len());
            let desc = dev.rx_desc(0);
            desc.length = frame.len() as u16;
            desc.status = RXD_STAT_DD | regs::RXD_STAT_EOP;
        }

        let pkt = dev.receive(&mut pool).unwrap();
        assert_eq!(pkt.data(), &frame);
        pool.free(pkt);

        // Descriptor recycled: status cleared, old index exposed as tail.
        // SAFETY: descriptor 0 belongs to the driver under test.
        assert_eq!(unsafe { dev.rx_desc(0) }.status, 0);
        assert_eq!(mmio.read(regs::RDT), 0);

        // Nothing else pending.
        assert!(dev.receive(&mut pool).is_none());
    }

    #[test]
    fn receive_skips_errored_frames() {
        let (_arena, _pmm, mut pool, _mmio, mut dev) = setup();
        // SAFETY: descriptor 0 belongs to the driver under test.
        unsafe {
            let desc = dev.rx_desc(0);
            desc.length = 100;
            desc.status = RXD_STAT_DD;
            desc.errors = 0x01;
        }
        assert!(dev.receive(&mut pool).is_none());
        // The driver moved past the bad slot.
        assert_eq!(dev.rx_cur, 1);
    }

    #[test]
    fn release_returns_dma_frames() {
        let arena = Arena::new(2 * 1024 * 1024);
        let regions = [MemRegion {
            start: PhysAddr::zero(),
            size: arena.size as u32,
            usable: true,
        }];
        let kernel = PhysAddr::zero()..PhysAddr::new(4 * PAGE_SIZE);
        let mut pmm = unsafe {
            FrameBitmap::new(&regions, kernel, arena.ptr as usize).unwrap()
        };
        let mmio = FakeMmio::new();
        let baseline = pmm.stats().used;
        let dev = E1000::new(mmio.base(), &mut pmm, arena.ptr as usize).unwrap();
        assert!(pmm.stats().used > baseline);
        dev.release(&mut pmm);
        assert_eq!(pmm.stats().used, baseline);
    }
}
