//! Layered network stack: link interfaces, IPv4 with fragmentation and
//! reassembly, UDP and TCP, over a fixed-slot packet pool.
//!
//! The stack is a single owned state object ([`stack::NetStack`]); interrupt
//! masking serializes access on the single-CPU target. Receive flows from
//! the driver through [`stack::NetStack::process_rx`] into the per-protocol
//! handlers; transmit flows from sockets through the protocol layers to the
//! egress interface selected by the routing table.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::fmt;

pub mod can;
pub mod checksum;
pub mod ethernet;
pub mod iface;
pub mod ipv4;
pub mod packet;
pub mod stack;
pub mod tcp;
pub mod udp;

/// A 6-byte MAC (Ethernet hardware) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// The broadcast address, ff:ff:ff:ff:ff:ff.
    pub const BROADCAST: Self = Self([0xFF; 6]);
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// An IPv4 address in network byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Ipv4Address(pub [u8; 4]);

impl Ipv4Address {
    /// The all-zero address.
    pub const UNSPECIFIED: Self = Self([0; 4]);

    /// Builds an address from four dotted-quad octets.
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    /// Returns the octets.
    pub const fn octets(self) -> [u8; 4] {
        self.0
    }

    /// Returns `true` for class-D multicast addresses (224.0.0.0/4).
    pub fn is_multicast(self) -> bool {
        (224..=239).contains(&self.0[0])
    }

    /// Returns `true` if this is the directed broadcast address for the
    /// network defined by `netmask`.
    pub fn is_broadcast(self, netmask: Ipv4Address) -> bool {
        self.0
            .iter()
            .zip(netmask.0.iter())
            .all(|(&a, &m)| a | m == 0xFF)
    }

    /// Masks the address with `netmask`.
    pub fn masked(self, netmask: Ipv4Address) -> Ipv4Address {
        let mut out = [0u8; 4];
        for i in 0..4 {
            out[i] = self.0[i] & netmask.0[i];
        }
        Ipv4Address(out)
    }

    /// Parses a dotted-quad string.
    pub fn parse(s: &str) -> Option<Self> {
        let mut octets = [0u8; 4];
        let mut parts = s.split('.');
        for octet in &mut octets {
            *octet = parts.next()?.parse().ok()?;
        }
        parts.next().is_none().then_some(Self(octets))
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

/// Protocol tags carried by packets and indexing the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    /// Untagged.
    None = 0,
    /// IPv4.
    Ipv4 = 1,
    /// IPv6 (tag reserved, no engine).
    Ipv6 = 2,
    /// ARP (tag reserved; no resolver exists).
    Arp = 3,
    /// ICMP.
    Icmp = 4,
    /// TCP.
    Tcp = 5,
    /// UDP.
    Udp = 6,
    /// CAN bus.
    Can = 7,
    /// LIN bus.
    Lin = 8,
}

/// Number of slots in the protocol dispatch table.
pub const PROTOCOL_SLOTS: usize = 16;

/// Errors reported by the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// The packet pool has no free slot.
    PoolExhausted,
    /// The requested packet exceeds the maximum link packet size.
    PacketTooLarge,
    /// A header or option failed validation.
    Malformed,
    /// The device reported a hardware error.
    DeviceError,
    /// The device is not ready to accept commands.
    NotReady,
    /// The transmit ring has no free descriptor; the caller may retry.
    TxQueueFull,
    /// No route matches the destination.
    NoRoute,
    /// The referenced interface does not exist.
    NoInterface,
    /// The egress interface has no IPv4 configuration.
    NotConfigured,
    /// The datagram carries the don't-fragment flag but exceeds the MTU.
    DontFragment,
    /// The (address, port) pair is already bound.
    PortInUse,
    /// The socket or connection table is full.
    TableFull,
    /// The referenced socket or connection does not exist.
    NoSuchSocket,
    /// The operation is invalid in the current connection state.
    InvalidState,
    /// The payload does not fit the peer's or our buffer window.
    BufferFull,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::PoolExhausted => "packet pool exhausted",
            Self::PacketTooLarge => "packet exceeds maximum size",
            Self::Malformed => "malformed header",
            Self::DeviceError => "device error",
            Self::NotReady => "device not ready",
            Self::TxQueueFull => "transmit queue full",
            Self::NoRoute => "no route to destination",
            Self::NoInterface => "no such interface",
            Self::NotConfigured => "interface has no address",
            Self::DontFragment => "fragmentation required but forbidden",
            Self::PortInUse => "address already in use",
            Self::TableFull => "table full",
            Self::NoSuchSocket => "no such socket",
            Self::InvalidState => "invalid connection state",
            Self::BufferFull => "buffer full",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_address_display_and_parse() {
        let addr = Ipv4Address::new(192, 0, 2, 1);
        assert_eq!(addr.to_string(), "192.0.2.1");
        assert_eq!(Ipv4Address::parse("192.0.2.1"), Some(addr));
        assert_eq!(Ipv4Address::parse("192.0.2"), None);
        assert_eq!(Ipv4Address::parse("192.0.2.256"), None);
        assert_eq!(Ipv4Address::parse("192.0.2.1.5"), None);
    }

    #[test]
    fn multicast_range() {
        assert!(Ipv4Address::new(224, 0, 0, 1).is_multicast());
        assert!(Ipv4Address::new(239, 255, 255, 255).is_multicast());
        assert!(!Ipv4Address::new(223, 0, 0, 1).is_multicast());
        assert!(!Ipv4Address::new(240, 0, 0, 1).is_multicast());
    }

    #[test]
    fn directed_broadcast() {
        let mask = Ipv4Address::new(255, 255, 255, 0);
        assert!(Ipv4Address::new(10, 0, 0, 255).is_broadcast(mask));
        assert!(!Ipv4Address::new(10, 0, 0, 254).is_broadcast(mask));
    }

    #[test]
    fn mac_display() {
        let mac = MacAddress([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);
        assert_eq!(mac.to_string(), "de:ad:be:ef:00:01");
    }
}
