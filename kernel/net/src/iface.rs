//! Network interfaces and the interface registry.
//!
//! Drivers implement [`DeviceOps`]; the registry owns [`Interface`] records
//! in registration order and funnels send/receive through them so the
//! per-interface statistics stay accurate.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use crate::packet::{Packet, PacketPool};
use crate::{Ipv4Address, MacAddress, NetError};

bitflags::bitflags! {
    /// Interface status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IfFlags: u32 {
        /// Administratively up.
        const UP        = 1 << 0;
        /// Carrier present, driver started.
        const RUNNING   = 1 << 1;
        /// Receives frames regardless of destination MAC.
        const PROMISC   = 1 << 2;
        /// Receives multicast frames.
        const MULTICAST = 1 << 3;
        /// Receives broadcast frames.
        const BROADCAST = 1 << 4;
    }
}

/// Link type of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfKind {
    /// IEEE 802.3 Ethernet.
    Ethernet,
    /// 802.11 wireless.
    Wifi,
    /// CAN bus (embedded target).
    Can,
    /// LIN bus (embedded target).
    Lin,
    /// Software loopback.
    Loopback,
}

/// Per-interface packet and byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IfStats {
    /// Packets received.
    pub rx_packets: u64,
    /// Packets transmitted.
    pub tx_packets: u64,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Bytes transmitted.
    pub tx_bytes: u64,
    /// Receive errors reported by the device.
    pub rx_errors: u64,
    /// Transmit errors reported by the device.
    pub tx_errors: u64,
    /// Received packets dropped by the stack.
    pub rx_dropped: u64,
    /// Outbound packets dropped by the stack.
    pub tx_dropped: u64,
    /// Collisions reported by the device.
    pub collisions: u64,
}

/// IPv4 configuration attached to an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Config {
    /// Interface address.
    pub addr: Ipv4Address,
    /// Network mask.
    pub netmask: Ipv4Address,
    /// Directed broadcast address.
    pub broadcast: Ipv4Address,
    /// Default gateway.
    pub gateway: Ipv4Address,
}

/// Driver capability set every network device implements.
///
/// `receive` pulls at most one packet and returns immediately; device code
/// never suspends. `send` copies the frame into device-owned memory before
/// returning, so the caller keeps ownership of the packet.
pub trait DeviceOps {
    /// One-time device bring-up. Called by [`IfaceRegistry::register`].
    fn init(&mut self) -> Result<(), NetError>;

    /// Releases device resources. Called on deregistration.
    fn cleanup(&mut self);

    /// Enables reception and transmission.
    fn start(&mut self) -> Result<(), NetError>;

    /// Disables reception and transmission.
    fn stop(&mut self);

    /// Transmits one packet. Fails with [`NetError::TxQueueFull`] when no
    /// transmit slot is free; the caller may retry.
    fn send(&mut self, packet: &Packet) -> Result<(), NetError>;

    /// Pulls one received packet from the device, if any.
    fn receive(&mut self, pool: &mut PacketPool) -> Option<Packet>;

    /// Returns the device's MAC address.
    fn mac_address(&self) -> MacAddress;

    /// Programs a new MAC address.
    fn set_mac(&mut self, mac: MacAddress) -> Result<(), NetError>;

    /// Toggles unicast-promiscuous reception.
    fn set_promiscuous(&mut self, _on: bool) {}

    /// Toggles multicast-promiscuous reception.
    fn set_multicast(&mut self, _on: bool) {}

    /// Reports link state. Defaults to up for devices without carrier
    /// detection.
    fn link_up(&self) -> bool {
        true
    }
}

/// A registered network interface.
pub struct Interface {
    /// Interface name, e.g. `eth0`.
    pub name: String,
    /// Link type.
    pub kind: IfKind,
    /// Status flags.
    pub flags: IfFlags,
    /// Hardware address (copied from the device at registration).
    pub mac: MacAddress,
    /// Maximum transmission unit in bytes.
    pub mtu: u16,
    /// Traffic counters.
    pub stats: IfStats,
    /// IPv4 configuration, if assigned.
    pub ipv4: Option<Ipv4Config>,
    /// The driver.
    pub dev: Box<dyn DeviceOps + Send>,
}

impl Interface {
    /// Builds an interface record around a driver. Flags and MAC are filled
    /// in at registration.
    pub fn new(name: &str, kind: IfKind, mtu: u16, dev: Box<dyn DeviceOps + Send>) -> Self {
        Self {
            name: String::from(name),
            kind,
            flags: IfFlags::empty(),
            mac: MacAddress::default(),
            mtu,
            stats: IfStats::default(),
            ipv4: None,
            dev,
        }
    }
}

/// The interface registry: slots in registration order.
///
/// Slot indices are stable handles; deregistration leaves a hole so routes
/// and sockets holding an index never see it re-point at a different
/// device.
#[derive(Default)]
pub struct IfaceRegistry {
    slots: Vec<Option<Interface>>,
}

impl IfaceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes the device and appends the interface.
    ///
    /// On success the interface is up and running with broadcast reception,
    /// and its MAC mirrors the device's.
    pub fn register(&mut self, mut iface: Interface) -> Result<usize, NetError> {
        iface.dev.init()?;
        iface.dev.start()?;
        iface.mac = iface.dev.mac_address();
        iface.flags |= IfFlags::UP | IfFlags::RUNNING | IfFlags::BROADCAST;

        let id = self.slots.len();
        self.slots.push(Some(iface));
        Ok(id)
    }

    /// Unlinks an interface and lets the driver clean up.
    pub fn deregister(&mut self, id: usize) -> Result<(), NetError> {
        let slot = self
            .slots
            .get_mut(id)
            .ok_or(NetError::NoInterface)?
            .take();
        let mut iface = slot.ok_or(NetError::NoInterface)?;
        iface.dev.stop();
        iface.dev.cleanup();
        Ok(())
    }

    /// Looks up an interface by name.
    pub fn lookup_by_name(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|i| i.name == name))
    }

    /// Returns the interface in the given slot, if live.
    pub fn get(&self, id: usize) -> Option<&Interface> {
        self.slots.get(id)?.as_ref()
    }

    /// Mutable access to the interface in the given slot.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Interface> {
        self.slots.get_mut(id)?.as_mut()
    }

    /// Number of live interfaces.
    pub fn count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Iterates over (slot, interface) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Interface)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|iface| (i, iface)))
    }

    /// Slot indices of live interfaces.
    pub fn ids(&self) -> Vec<usize> {
        self.iter().map(|(i, _)| i).collect()
    }

    /// Transmits a packet through an interface, updating its counters.
    pub fn send(&mut self, id: usize, packet: &Packet) -> Result<(), NetError> {
        let iface = self.get_mut(id).ok_or(NetError::NoInterface)?;
        iface.stats.tx_packets += 1;
        iface.stats.tx_bytes += packet.len() as u64;
        let result = iface.dev.send(packet);
        if result.is_err() {
            iface.stats.tx_errors += 1;
        }
        result
    }

    /// Pulls one packet from an interface, updating its counters.
    pub fn receive(&mut self, id: usize, pool: &mut PacketPool) -> Option<Packet> {
        let iface = self.get_mut(id)?;
        let packet = iface.dev.receive(pool)?;
        iface.stats.rx_packets += 1;
        iface.stats.rx_bytes += packet.len() as u64;
        Some(packet)
    }

    /// Assigns an IPv4 configuration to an interface.
    pub fn configure_ipv4(&mut self, id: usize, cfg: Ipv4Config) -> Result<(), NetError> {
        self.get_mut(id).ok_or(NetError::NoInterface)?.ipv4 = Some(cfg);
        Ok(())
    }

    /// Returns `true` if `addr` is one of our interface addresses or a
    /// directed broadcast for one of our networks.
    pub fn is_local_addr(&self, addr: Ipv4Address) -> bool {
        self.iter().any(|(_, iface)| {
            iface.ipv4.is_some_and(|cfg| {
                cfg.addr == addr || cfg.broadcast == addr || addr.is_broadcast(cfg.netmask)
            })
        })
    }
}
