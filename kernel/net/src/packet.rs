//! Packet handles and the fixed-slot packet pool.
//!
//! The pool pre-allocates a contiguous region from the frame allocator and
//! carves it into 2 KiB slots, one link-layer packet each. A [`Packet`] is
//! owned by exactly one party at any instant — driver, stack layer, or
//! caller — and is released back to the pool with [`PacketPool::free`].
//! Reassembled whole datagrams exceed the link-layer cap and are heap-backed
//! instead of pool-backed; `free` handles both.

use alloc::vec::Vec;

use meson_core::addr::{PAGE_SIZE, PhysAddr};
use meson_mm::pmm::FrameBitmap;

use crate::{Ipv4Address, NetError, Protocol};

/// Largest packet the link layer accepts (Ethernet frame incl. header/FCS).
pub const MAX_PACKET_SIZE: usize = 1518;

/// Bytes per pool slot. Matches the NIC's 2 KiB receive buffers.
pub const SLOT_SIZE: usize = 2048;

enum Backing {
    /// Pointer to the owning pool's slot and the slot index.
    Pool { base: *mut u8, slot: u16 },
    /// Heap buffer for oversized (reassembled) datagrams.
    Heap(Vec<u8>),
}

/// A network packet handle.
///
/// Carries the data buffer plus the metadata the stack layers exchange: the
/// protocol tag, a priority, and the source/destination address pair filled
/// in by the IPv4 layer on delivery.
pub struct Packet {
    backing: Backing,
    /// Offset of the first live byte (advanced as layers strip headers).
    head: usize,
    /// Number of live bytes starting at `head`.
    len: usize,
    /// Protocol tag used by the dispatch table.
    pub protocol: Protocol,
    /// Priority hint, unused by the present queueless transmit path.
    pub priority: u8,
    /// Source IPv4 address (filled on IPv4 delivery).
    pub src_addr: Ipv4Address,
    /// Destination IPv4 address (filled on IPv4 delivery).
    pub dst_addr: Ipv4Address,
}

// SAFETY: A pool-backed packet's pointer targets a slot exclusively owned by
// this handle until it is freed; the buffer is plain bytes.
unsafe impl Send for Packet {}

impl Packet {
    /// Wraps a heap buffer in a packet (used for reassembled datagrams).
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            backing: Backing::Heap(data),
            head: 0,
            len,
            protocol: Protocol::None,
            priority: 0,
            src_addr: Ipv4Address::UNSPECIFIED,
            dst_addr: Ipv4Address::UNSPECIFIED,
        }
    }

    fn capacity(&self) -> usize {
        match &self.backing {
            Backing::Pool { .. } => SLOT_SIZE,
            Backing::Heap(v) => v.len(),
        }
    }

    /// Live bytes of the packet.
    pub fn data(&self) -> &[u8] {
        match &self.backing {
            // SAFETY: head + len never exceeds SLOT_SIZE (checked by
            // `set_len`/`pull`), and the slot is exclusively ours.
            Backing::Pool { base, .. } => unsafe {
                core::slice::from_raw_parts(base.add(self.head), self.len)
            },
            Backing::Heap(v) => &v[self.head..self.head + self.len],
        }
    }

    /// Mutable view of the live bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            // SAFETY: as in `data`.
            Backing::Pool { base, .. } => unsafe {
                core::slice::from_raw_parts_mut(base.add(self.head), self.len)
            },
            Backing::Heap(v) => &mut v[self.head..self.head + self.len],
        }
    }

    /// Number of live bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the packet holds no live bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shrinks or grows the live length within the buffer capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(self.head + len <= self.capacity(), "length exceeds buffer");
        self.len = len;
    }

    /// Strips `n` bytes from the front (a consumed header).
    pub fn pull(&mut self, n: usize) {
        assert!(n <= self.len, "pull past end of packet");
        self.head += n;
        self.len -= n;
    }
}

/// Fixed-slot packet pool backed by frames from the physical allocator.
pub struct PacketPool {
    /// First slot's address through the direct map.
    base: *mut u8,
    /// Physical address of the backing region (kept for `release`).
    region: PhysAddr,
    /// Frames backing the region.
    region_frames: usize,
    /// Free slot indices; popped for alloc, pushed on free.
    free: Vec<u16>,
    /// Total slots carved from the region.
    slots: usize,
}

// SAFETY: The pool owns its region exclusively; access to slot memory is
// funneled through uniquely-owned Packet handles.
unsafe impl Send for PacketPool {}

impl PacketPool {
    /// Carves a pool of `slots` packet buffers out of the frame allocator.
    pub fn new(
        pmm: &mut FrameBitmap,
        direct_offset: usize,
        slots: usize,
    ) -> Result<Self, NetError> {
        let bytes = slots * SLOT_SIZE;
        let frames = bytes.div_ceil(PAGE_SIZE as usize);
        let region = pmm
            .alloc_run(frames)
            .map_err(|_| NetError::PoolExhausted)?
            .start_address();
        // Reverse order so allocation hands out slot 0 first.
        let free = (0..slots as u16).rev().collect();
        Ok(Self {
            base: (direct_offset + region.as_u32() as usize) as *mut u8,
            region,
            region_frames: frames,
            free,
            slots,
        })
    }

    /// Allocates a packet of `len` bytes.
    ///
    /// Fails with [`NetError::PacketTooLarge`] beyond [`MAX_PACKET_SIZE`]
    /// and [`NetError::PoolExhausted`] when every slot is in flight.
    pub fn alloc(&mut self, len: usize) -> Result<Packet, NetError> {
        if len > MAX_PACKET_SIZE {
            return Err(NetError::PacketTooLarge);
        }
        let slot = self.free.pop().ok_or(NetError::PoolExhausted)?;
        // SAFETY: slot < self.slots, so the offset stays inside the region.
        let base = unsafe { self.base.add(slot as usize * SLOT_SIZE) };
        Ok(Packet {
            backing: Backing::Pool { base, slot },
            head: 0,
            len,
            protocol: Protocol::None,
            priority: 0,
            src_addr: Ipv4Address::UNSPECIFIED,
            dst_addr: Ipv4Address::UNSPECIFIED,
        })
    }

    /// Releases a packet. Pool slots return to the freelist; heap backings
    /// are dropped.
    pub fn free(&mut self, packet: Packet) {
        if let Backing::Pool { slot, .. } = packet.backing {
            debug_assert!(!self.free.contains(&slot), "double free of pool slot");
            self.free.push(slot);
        }
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total slots in the pool.
    pub fn capacity(&self) -> usize {
        self.slots
    }

    /// Returns the backing region to the frame allocator.
    ///
    /// All packets must have been freed; outstanding handles would dangle.
    pub fn release(self, pmm: &mut FrameBitmap) {
        debug_assert_eq!(self.free.len(), self.slots, "pool released with packets in flight");
        pmm.free_run(self.region, self.region_frames);
    }
}
