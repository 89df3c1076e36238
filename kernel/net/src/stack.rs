//! The network stack aggregate and protocol dispatch.
//!
//! [`NetStack`] owns the packet pool, the interface registry, the protocol
//! dispatch table, and the IPv4/UDP/TCP layer state. On the single-CPU
//! target it is mutated under interrupt masking: the receive path runs from
//! the NIC interrupt, everything else from kernel tasks.

use meson_mm::pmm::FrameBitmap;

use crate::ethernet::{self, EthHeader};
use crate::iface::{IfKind, IfaceRegistry};
use crate::ipv4::{self, Ipv4};
use crate::packet::{Packet, PacketPool};
use crate::tcp::{self, TcpLayer};
use crate::udp::{self, UdpLayer};
use crate::{NetError, PROTOCOL_SLOTS, Protocol};

/// A per-protocol receive callback.
///
/// Handlers take ownership of the packet: they either forward it onward or
/// release it to the pool.
pub type ProtocolHandler = fn(&mut NetStack, usize, Packet);

/// The network subsystem state object.
pub struct NetStack {
    /// Fixed-slot packet pool.
    pub pool: PacketPool,
    /// Registered interfaces.
    pub ifaces: IfaceRegistry,
    /// IPv4 engine.
    pub ipv4: Ipv4,
    /// UDP socket layer.
    pub udp: UdpLayer,
    /// TCP connection layer.
    pub tcp: TcpLayer,
    /// Most recent tick handed to [`process_rx`](Self::process_rx); feeds
    /// reassembly timestamps and TCP timers.
    pub now: u64,
    handlers: [Option<ProtocolHandler>; PROTOCOL_SLOTS],
}

impl NetStack {
    /// Creates the stack with a `pool_slots`-packet pool and the standard
    /// IPv4/UDP/TCP handlers registered.
    pub fn new(
        pmm: &mut FrameBitmap,
        direct_offset: usize,
        pool_slots: usize,
    ) -> Result<Self, NetError> {
        let pool = PacketPool::new(pmm, direct_offset, pool_slots)?;
        let mut stack = Self {
            pool,
            ifaces: IfaceRegistry::new(),
            ipv4: Ipv4::new(),
            udp: UdpLayer::new(),
            tcp: TcpLayer::new(),
            now: 0,
            handlers: [None; PROTOCOL_SLOTS],
        };
        stack.register_protocol(Protocol::Ipv4, ipv4::on_receive);
        stack.register_protocol(Protocol::Udp, udp::on_receive);
        stack.register_protocol(Protocol::Tcp, tcp::on_receive);
        Ok(stack)
    }

    /// Installs a receive handler for a protocol tag.
    pub fn register_protocol(&mut self, proto: Protocol, handler: ProtocolHandler) {
        self.handlers[proto as usize] = Some(handler);
    }

    /// Removes the handler for a protocol tag.
    pub fn unregister_protocol(&mut self, proto: Protocol) {
        self.handlers[proto as usize] = None;
    }

    /// Routes a packet to its protocol handler, or drops it (counted on the
    /// ingress interface) when none is registered.
    pub fn dispatch(&mut self, iface_id: usize, pkt: Packet) {
        match self.handlers.get(pkt.protocol as usize).copied().flatten() {
            Some(handler) => handler(self, iface_id, pkt),
            None => {
                if let Some(iface) = self.ifaces.get_mut(iface_id) {
                    iface.stats.rx_dropped += 1;
                }
                self.pool.free(pkt);
            }
        }
    }

    /// Polls every interface for one received packet and runs the dispatch
    /// chain. Called from the NIC interrupt path and from the idle loop.
    pub fn process_rx(&mut self, now: u64) {
        self.now = now;
        self.tcp.poll(now);

        for id in self.ifaces.ids() {
            let NetStack { ifaces, pool, .. } = self;
            let Some(mut pkt) = ifaces.receive(id, pool) else {
                continue;
            };

            // Ethernet interfaces deliver raw frames: strip the link header
            // and tag by ethertype. Other kinds carry the tag on the packet.
            let kind = self.ifaces.get(id).map(|i| i.kind);
            if kind == Some(IfKind::Ethernet) {
                match EthHeader::parse(pkt.data()) {
                    Ok(eth) => {
                        pkt.protocol = eth.protocol();
                        pkt.pull(ethernet::HEADER_LEN);
                    }
                    Err(_) => {
                        if let Some(iface) = self.ifaces.get_mut(id) {
                            iface.stats.rx_errors += 1;
                        }
                        self.pool.free(pkt);
                        continue;
                    }
                }
            }

            self.dispatch(id, pkt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::test_dev::EchoDev;
    use crate::iface::{Interface, Ipv4Config};
    use crate::ipv4::{FLAG_DF, HEADER_LEN as IP_HEADER_LEN, Ipv4Header, PROTO_UDP};
    use crate::tcp::TcpState;
    use crate::{Ipv4Address, NetError};
    use alloc::boxed::Box;
    use core::alloc::Layout;
    use meson_core::addr::{PAGE_SIZE, PhysAddr};
    use meson_core::boot::MemRegion;

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

    const ADDR: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);

    /// Stack with one loopback-style interface at the given MTU, addressed
    /// 10.0.0.1/24 with a matching connected route.
    fn setup(mtu: u16) -> (Arena, FrameBitmap, NetStack) {
        let arena = Arena::new(4 * 1024 * 1024);
        let regions = [MemRegion {
            start: PhysAddr::zero(),
            size: arena.size as u32,
            usable: true,
        }];
        let kernel = PhysAddr::zero()..PhysAddr::new(4 * PAGE_SIZE);
        let mut pmm = unsafe {
            FrameBitmap::new(&regions, kernel, arena.ptr as usize).unwrap()
        };
        let mut stack = NetStack::new(&mut pmm, arena.ptr as usize, 64).unwrap();

        let id = stack
            .ifaces
            .register(Interface::new("lo0", IfKind::Loopback, mtu, Box::new(EchoDev::new())))
            .unwrap();
        stack
            .ifaces
            .configure_ipv4(
                id,
                Ipv4Config {
                    addr: ADDR,
                    netmask: Ipv4Address::new(255, 255, 255, 0),
                    broadcast: Ipv4Address::new(10, 0, 0, 255),
                    gateway: Ipv4Address::new(10, 0, 0, 254),
                },
            )
            .unwrap();
        stack.ipv4.add_route(crate::ipv4::Route {
            network: Ipv4Address::new(10, 0, 0, 0),
            netmask: Ipv4Address::new(255, 255, 255, 0),
            gateway: None,
            iface: id,
            metric: 1,
        });
        (arena, pmm, stack)
    }

    fn pump(stack: &mut NetStack, now: u64) {
        // One packet per interface per poll; enough rounds for the largest
        // fragment trains in these tests.
        for _ in 0..64 {
            stack.process_rx(now);
        }
    }

    #[test]
    fn udp_datagram_loops_back() {
        let (_arena, _pmm, mut stack) = setup(1500);
        let sock = stack.udp.bind(ADDR, 9000, None).unwrap();

        udp::send(&mut stack, sock, ADDR, 9000, b"knock knock").unwrap();
        pump(&mut stack, 0);

        let mut out = [0u8; 64];
        let n = stack.udp.receive(sock, &mut out);
        assert_eq!(&out[..n], b"knock knock");
        assert_eq!(stack.udp.get(sock).unwrap().stats.packets_received, 1);
        // Every pool packet went home.
        assert_eq!(stack.pool.available(), stack.pool.capacity());
    }

    #[test]
    fn udp_to_unbound_port_counts_drop() {
        let (_arena, _pmm, mut stack) = setup(1500);
        let sock = stack.udp.bind(ADDR, 9000, None).unwrap();
        udp::send(&mut stack, sock, ADDR, 9999, b"nobody home").unwrap();
        pump(&mut stack, 0);
        assert_eq!(stack.udp.no_socket_drops, 1);
    }

    #[test]
    fn large_datagram_fragments_on_the_wire() {
        let (_arena, _pmm, mut stack) = setup(1500);
        let sock = stack.udp.bind(ADDR, 9000, None).unwrap();
        let payload = vec![0x5A; 3000];

        udp::send(&mut stack, sock, ADDR, 9000, &payload).unwrap();
        // 3008-byte datagram over MTU 1500: 1480 + 1480 + 48 payload bytes.
        assert_eq!(stack.ipv4.stats.fragments_sent, 3);

        pump(&mut stack, 0);
        assert_eq!(stack.ipv4.stats.fragments_reassembled, 1);

        let mut out = vec![0u8; 4000];
        let n = stack.udp.receive(sock, &mut out);
        assert_eq!(n, 3000);
        assert_eq!(&out[..n], &payload[..]);
        assert_eq!(stack.pool.available(), stack.pool.capacity());
    }

    #[test]
    fn fragment_headers_carry_offsets_and_mf() {
        let (_arena, _pmm, mut stack) = setup(1500);
        let sock = stack.udp.bind(ADDR, 9000, None).unwrap();
        udp::send(&mut stack, sock, ADDR, 9000, &vec![1u8; 3000]).unwrap();

        let id = stack.ifaces.lookup_by_name("lo0").unwrap();
        let mut frags = Vec::new();
        loop {
            let NetStack { ifaces, pool, .. } = &mut stack;
            match ifaces.receive(id, pool) {
                Some(pkt) => {
                    let header = Ipv4Header::parse(pkt.data()).unwrap();
                    frags.push((header.more_fragments(), header.frag_offset(), header.total_len));
                    stack.pool.free(pkt);
                }
                None => break,
            }
        }
        // First fragment: MF set, offset 0, full 1500 bytes.
        assert_eq!(frags[0], (true, 0, 1500));
        // Second fragment starts at byte 1480 (block 185).
        assert_eq!(frags[1], (true, 1480, 1500));
        // Final fragment: MF clear, carries the remaining 48 bytes.
        assert_eq!(frags[2], (false, 2960, 48 + IP_HEADER_LEN as u16));
    }

    #[test]
    fn fragmentation_roundtrip_across_mtus() {
        for mtu in [576u16, 1500, 9000] {
            let (_arena, _pmm, mut stack) = setup(mtu);
            let cfg = udp::UdpConfig {
                buffer_size: 65536,
                checksum: true,
            };
            let sock = stack.udp.bind(ADDR, 9000, Some(cfg)).unwrap();
            let payload: Vec<u8> = (0..20_000u32).map(|i| (i * 7) as u8).collect();

            udp::send(&mut stack, sock, ADDR, 9000, &payload).unwrap();
            pump(&mut stack, 0);

            let mut out = vec![0u8; 32_000];
            let n = stack.udp.receive(sock, &mut out);
            assert_eq!(n, payload.len(), "mtu {mtu}");
            assert_eq!(&out[..n], &payload[..], "mtu {mtu}");
            assert_eq!(stack.pool.available(), stack.pool.capacity(), "mtu {mtu}");
        }
    }

    #[test]
    fn reassembly_handles_out_of_order_fragments() {
        let (_arena, _pmm, mut stack) = setup(1500);
        let sock = stack.udp.bind(ADDR, 9000, None).unwrap();
        let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        udp::send(&mut stack, sock, ADDR, 9000, &payload).unwrap();

        // Reverse the wire order before delivery.
        let id = stack.ifaces.lookup_by_name("lo0").unwrap();
        let mut frames = Vec::new();
        loop {
            let NetStack { ifaces, pool, .. } = &mut stack;
            match ifaces.receive(id, pool) {
                Some(pkt) => {
                    frames.push(pkt.data().to_vec());
                    stack.pool.free(pkt);
                }
                None => break,
            }
        }
        frames.reverse();
        for frame in frames {
            let mut pkt = stack.pool.alloc(frame.len()).unwrap();
            pkt.data_mut().copy_from_slice(&frame);
            pkt.protocol = Protocol::Ipv4;
            stack.dispatch(id, pkt);
        }

        let mut out = vec![0u8; 4000];
        let n = stack.udp.receive(sock, &mut out);
        assert_eq!(n, 3000);
        assert_eq!(&out[..n], &payload[..]);
    }

    #[test]
    fn stale_reassembly_buffers_expire() {
        let (_arena, _pmm, mut stack) = setup(1500);
        let sock = stack.udp.bind(ADDR, 9000, None).unwrap();
        udp::send(&mut stack, sock, ADDR, 9000, &vec![0u8; 3000]).unwrap();

        // Deliver only the first fragment.
        stack.process_rx(1000);
        assert_eq!(stack.ipv4.reassembly_in_flight(), 1);

        // The sweep is a provided maintenance op; nothing calls it for us.
        stack.ipv4.expire(1000 + crate::ipv4::REASSEMBLY_TIMEOUT);
        assert_eq!(stack.ipv4.reassembly_in_flight(), 0);
    }

    #[test]
    fn forward_drops_when_ttl_expires() {
        let (_arena, _pmm, mut stack) = setup(1500);
        let id = stack.ifaces.lookup_by_name("lo0").unwrap();

        // Datagram for a non-local destination with TTL 1.
        let mut bytes = vec![0u8; IP_HEADER_LEN + 8];
        Ipv4Header {
            ihl: 5,
            tos: 0,
            total_len: (IP_HEADER_LEN + 8) as u16,
            ident: 1,
            flags_offset: 0,
            ttl: 1,
            protocol: PROTO_UDP,
            checksum: 0,
            src: Ipv4Address::new(10, 0, 0, 7),
            dst: Ipv4Address::new(10, 0, 0, 99),
        }
        .emit(&mut bytes);
        crate::ipv4::set_header_checksum(&mut bytes);

        let mut pkt = stack.pool.alloc(bytes.len()).unwrap();
        pkt.data_mut().copy_from_slice(&bytes);
        pkt.protocol = Protocol::Ipv4;

        let dropped = stack.ipv4.stats.packets_dropped;
        ipv4::on_receive(&mut stack, id, pkt);
        assert_eq!(stack.ipv4.stats.packets_dropped, dropped + 1);
        assert_eq!(stack.ipv4.stats.packets_forwarded, 0);
    }

    #[test]
    fn forward_rewrites_ttl_and_checksum() {
        let (_arena, _pmm, mut stack) = setup(1500);
        let id = stack.ifaces.lookup_by_name("lo0").unwrap();

        let mut bytes = vec![0u8; IP_HEADER_LEN + 4];
        Ipv4Header {
            ihl: 5,
            tos: 0,
            total_len: (IP_HEADER_LEN + 4) as u16,
            ident: 2,
            flags_offset: 0,
            ttl: 9,
            protocol: PROTO_UDP,
            checksum: 0,
            src: Ipv4Address::new(10, 0, 0, 7),
            dst: Ipv4Address::new(10, 0, 0, 99), // routed, not local
        }
        .emit(&mut bytes);
        crate::ipv4::set_header_checksum(&mut bytes);

        let mut pkt = stack.pool.alloc(bytes.len()).unwrap();
        pkt.data_mut().copy_from_slice(&bytes);
        pkt.protocol = Protocol::Ipv4;
        ipv4::on_receive(&mut stack, id, pkt);
        assert_eq!(stack.ipv4.stats.packets_forwarded, 1);

        // The forwarded copy sits in the device queue with TTL 8 and a
        // checksum that still verifies.
        let NetStack { ifaces, pool, .. } = &mut stack;
        let fwd = ifaces.receive(id, pool).unwrap();
        let header = Ipv4Header::parse(fwd.data()).unwrap();
        assert_eq!(header.ttl, 8);
        assert!(crate::ipv4::verify_header_checksum(fwd.data()));
        stack.pool.free(fwd);
    }

    #[test]
    fn dont_fragment_blocks_forward_refragmentation() {
        let (_arena, _pmm, mut stack) = setup(100);
        let id = stack.ifaces.lookup_by_name("lo0").unwrap();

        let total = IP_HEADER_LEN + 200; // exceeds the 100-byte MTU
        let mut bytes = vec![0u8; total];
        Ipv4Header {
            ihl: 5,
            tos: 0,
            total_len: total as u16,
            ident: 3,
            flags_offset: FLAG_DF,
            ttl: 9,
            protocol: PROTO_UDP,
            checksum: 0,
            src: Ipv4Address::new(10, 0, 0, 7),
            dst: Ipv4Address::new(10, 0, 0, 99),
        }
        .emit(&mut bytes);
        crate::ipv4::set_header_checksum(&mut bytes);

        let mut pkt = Packet::from_vec(bytes);
        pkt.protocol = Protocol::Ipv4;
        ipv4::on_receive(&mut stack, id, pkt);

        assert_eq!(stack.ipv4.stats.packets_forwarded, 0);
        assert_eq!(stack.ipv4.stats.fragmentation_failures, 1);
    }

    #[test]
    fn corrupted_header_is_dropped() {
        let (_arena, _pmm, mut stack) = setup(1500);
        let sock = stack.udp.bind(ADDR, 9000, None).unwrap();
        udp::send(&mut stack, sock, ADDR, 9000, b"payload").unwrap();

        // Corrupt the queued frame's TTL without fixing the checksum.
        let id = stack.ifaces.lookup_by_name("lo0").unwrap();
        let frame = {
            let NetStack { ifaces, pool, .. } = &mut stack;
            let pkt = ifaces.receive(id, pool).unwrap();
            let mut bytes = pkt.data().to_vec();
            stack.pool.free(pkt);
            bytes[8] ^= 0xFF;
            bytes
        };
        let mut pkt = stack.pool.alloc(frame.len()).unwrap();
        pkt.data_mut().copy_from_slice(&frame);
        pkt.protocol = Protocol::Ipv4;

        let dropped = stack.ipv4.stats.packets_dropped;
        stack.dispatch(id, pkt);
        assert_eq!(stack.ipv4.stats.packets_dropped, dropped + 1);
        let mut out = [0u8; 16];
        assert_eq!(stack.udp.receive(sock, &mut out), 0);
    }

    #[test]
    fn unregistered_protocol_is_dropped_on_the_interface() {
        let (_arena, _pmm, mut stack) = setup(1500);
        let id = stack.ifaces.lookup_by_name("lo0").unwrap();
        stack.unregister_protocol(Protocol::Udp);

        let mut pkt = stack.pool.alloc(16).unwrap();
        pkt.protocol = Protocol::Udp;
        stack.dispatch(id, pkt);

        assert_eq!(stack.ifaces.get(id).unwrap().stats.rx_dropped, 1);
        assert_eq!(stack.pool.available(), stack.pool.capacity());
    }

    // -- TCP over the looped-back interface --------------------------------

    #[test]
    fn tcp_handshake_data_and_teardown() {
        let (_arena, _pmm, mut stack) = setup(1500);

        let server = stack
            .tcp
            .open(ADDR, 80, Ipv4Address::UNSPECIFIED, 0, None, 0)
            .unwrap();
        stack.tcp.listen(server).unwrap();

        let client_cfg = tcp::TcpConfig {
            initial_seq: 1_000_000,
            ..tcp::TcpConfig::default()
        };
        let client = stack
            .tcp
            .open(ADDR, 1000, ADDR, 80, Some(client_cfg), 0)
            .unwrap();

        tcp::connect(&mut stack, client, 0).unwrap();
        pump(&mut stack, 1);
        assert_eq!(stack.tcp.get(client).unwrap().state, TcpState::Established);
        assert_eq!(stack.tcp.get(server).unwrap().state, TcpState::Established);

        tcp::send(&mut stack, client, b"hello over tcp", 2).unwrap();
        pump(&mut stack, 3);
        let mut out = [0u8; 64];
        let n = stack.tcp.receive(server, &mut out);
        assert_eq!(&out[..n], b"hello over tcp");

        // The data ACK came back and advanced the client's snd.una.
        let conn = stack.tcp.get(client).unwrap();
        assert_eq!(conn.send_pending(), 0);
        assert_eq!(conn.snd_una, conn.snd_nxt);

        // Active close from the client side.
        tcp::close(&mut stack, client, 4).unwrap();
        pump(&mut stack, 5);
        assert_eq!(stack.tcp.get(client).unwrap().state, TcpState::FinWait2);
        assert_eq!(stack.tcp.get(server).unwrap().state, TcpState::CloseWait);

        tcp::close(&mut stack, server, 6).unwrap();
        pump(&mut stack, 7);
        assert_eq!(stack.tcp.get(server).unwrap().state, TcpState::Closed);
        assert_eq!(stack.tcp.get(client).unwrap().state, TcpState::TimeWait);

        // 2MSL later the client collapses to CLOSED.
        stack.process_rx(7 + 2 * tcp::MSL);
        assert_eq!(stack.tcp.get(client).unwrap().state, TcpState::Closed);

        assert_eq!(stack.pool.available(), stack.pool.capacity());
    }

    #[test]
    fn segment_without_connection_draws_rst() {
        let (_arena, _pmm, mut stack) = setup(1500);

        // A connection sending into the void: no listener on port 4242.
        let lonely = stack.tcp.open(ADDR, 3333, ADDR, 4242, None, 0).unwrap();
        tcp::connect(&mut stack, lonely, 0).unwrap();
        pump(&mut stack, 1);

        assert_eq!(stack.tcp.resets_sent, 1);
        // The RST came back and reset the connection.
        assert_eq!(stack.tcp.get(lonely).unwrap().state, TcpState::Closed);
        assert_eq!(stack.tcp.get(lonely).unwrap().stats.resets_received, 1);
    }

    #[test]
    fn oversized_udp_send_is_rejected() {
        let (_arena, _pmm, mut stack) = setup(1500);
        let sock = stack.udp.bind(ADDR, 9000, None).unwrap();
        let too_big = vec![0u8; udp::MAX_PAYLOAD + 1];
        assert!(matches!(
            udp::send(&mut stack, sock, ADDR, 9000, &too_big),
            Err(NetError::PacketTooLarge)
        ));
    }

    #[test]
    fn send_without_route_is_reported() {
        let (_arena, _pmm, mut stack) = setup(1500);
        let sock = stack.udp.bind(ADDR, 9000, None).unwrap();
        assert!(matches!(
            udp::send(&mut stack, sock, Ipv4Address::new(192, 0, 2, 1), 9000, b"x"),
            Err(NetError::NoRoute)
        ));
    }
}
