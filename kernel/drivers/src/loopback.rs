//! Software loopback device.
//!
//! Transmitted packets are queued and handed back on the next receive poll,
//! protocol tag preserved. Backs the loopback interface kind and the
//! stack's own smoke tests.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use meson_net::iface::DeviceOps;
use meson_net::packet::{MAX_PACKET_SIZE, Packet, PacketPool};
use meson_net::{MacAddress, NetError, Protocol};

/// Queued frames the device holds before the oldest is dropped.
const QUEUE_LIMIT: usize = 64;

/// The loopback device.
#[derive(Default)]
pub struct Loopback {
    queue: VecDeque<(Vec<u8>, Protocol)>,
    /// Frames dropped because the queue was full.
    pub dropped: u64,
}

impl Loopback {
    /// Creates an empty loopback device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames waiting to be received.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl DeviceOps for Loopback {
    fn init(&mut self) -> Result<(), NetError> {
        Ok(())
    }

    fn cleanup(&mut self) {
        self.queue.clear();
    }

    fn start(&mut self) -> Result<(), NetError> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn send(&mut self, packet: &Packet) -> Result<(), NetError> {
        if self.queue.len() >= QUEUE_LIMIT {
            self.dropped += 1;
            self.queue.pop_front();
        }
        self.queue
            .push_back((packet.data().to_vec(), packet.protocol));
        Ok(())
    }

    fn receive(&mut self, pool: &mut PacketPool) -> Option<Packet> {
        let (bytes, protocol) = self.queue.pop_front()?;
        let mut packet = if bytes.len() <= MAX_PACKET_SIZE {
            pool.alloc(bytes.len()).ok()?
        } else {
            Packet::from_vec(alloc::vec![0; bytes.len()])
        };
        packet.data_mut().copy_from_slice(&bytes);
        packet.protocol = protocol;
        Some(packet)
    }

    fn mac_address(&self) -> MacAddress {
        MacAddress::default()
    }

    fn set_mac(&mut self, _mac: MacAddress) -> Result<(), NetError> {
        Err(NetError::NotReady)
    }
}
