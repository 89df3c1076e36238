//! IPv4 engine: header codec, routing, fragmentation, reassembly and
//! TTL-based forwarding.

use alloc::vec;
use alloc::vec::Vec;

use crate::checksum;
use crate::packet::{MAX_PACKET_SIZE, Packet, PacketPool};
use crate::stack::NetStack;
use crate::{Ipv4Address, NetError, Protocol};

/// Bytes in an option-less IPv4 header.
pub const HEADER_LEN: usize = 20;

/// Default time-to-live when the caller does not supply one.
pub const DEFAULT_TTL: u8 = 64;

/// Largest IPv4 datagram (header included).
pub const MAX_DATAGRAM: usize = 65535;

/// IP protocol number for ICMP.
pub const PROTO_ICMP: u8 = 1;
/// IP protocol number for TCP.
pub const PROTO_TCP: u8 = 6;
/// IP protocol number for UDP.
pub const PROTO_UDP: u8 = 17;

/// Don't-fragment flag in the flags/offset field.
pub const FLAG_DF: u16 = 0x4000;
/// More-fragments flag in the flags/offset field.
pub const FLAG_MF: u16 = 0x2000;
/// Fragment offset mask (units of 8 bytes).
pub const OFFSET_MASK: u16 = 0x1FFF;

/// Reassembly buffers older than this many ticks are eligible for discard.
pub const REASSEMBLY_TIMEOUT: u64 = 30_000;

/// Concurrent reassembly contexts.
const MAX_REASSEMBLY_BUFFERS: usize = 16;

/// Received-block bitmap words (8192 eight-byte blocks).
const REASSEMBLY_BITMAP_WORDS: usize = 128;

// One bit per 8-byte block must cover the largest datagram.
static_assertions::const_assert!(REASSEMBLY_BITMAP_WORDS * 64 * 8 >= MAX_DATAGRAM);

// ---------------------------------------------------------------------------
// Header codec
// ---------------------------------------------------------------------------

/// A parsed IPv4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in 32-bit words (≥ 5).
    pub ihl: u8,
    /// Type of service.
    pub tos: u8,
    /// Total datagram length, header included.
    pub total_len: u16,
    /// Identification (shared by all fragments of a datagram).
    pub ident: u16,
    /// Flags (high 3 bits) and fragment offset in 8-byte units.
    pub flags_offset: u16,
    /// Time to live.
    pub ttl: u8,
    /// Payload protocol number.
    pub protocol: u8,
    /// Header checksum as seen on the wire.
    pub checksum: u16,
    /// Source address.
    pub src: Ipv4Address,
    /// Destination address.
    pub dst: Ipv4Address,
}

impl Ipv4Header {
    /// Parses a header from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, NetError> {
        if data.len() < HEADER_LEN {
            return Err(NetError::Malformed);
        }
        let version = data[0] >> 4;
        let ihl = data[0] & 0xF;
        if version != 4 || ihl < 5 {
            return Err(NetError::Malformed);
        }
        let total_len = u16::from_be_bytes([data[2], data[3]]);
        if (total_len as usize) < ihl as usize * 4 || data.len() < ihl as usize * 4 {
            return Err(NetError::Malformed);
        }
        Ok(Self {
            ihl,
            tos: data[1],
            total_len,
            ident: u16::from_be_bytes([data[4], data[5]]),
            flags_offset: u16::from_be_bytes([data[6], data[7]]),
            ttl: data[8],
            protocol: data[9],
            checksum: u16::from_be_bytes([data[10], data[11]]),
            src: Ipv4Address([data[12], data[13], data[14], data[15]]),
            dst: Ipv4Address([data[16], data[17], data[18], data[19]]),
        })
    }

    /// Writes the header (without options) into the first 20 bytes of `buf`.
    ///
    /// The checksum field is written as stored; use [`set_header_checksum`]
    /// afterwards to compute it in place.
    pub fn emit(&self, buf: &mut [u8]) {
        buf[0] = (4 << 4) | self.ihl;
        buf[1] = self.tos;
        buf[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        buf[4..6].copy_from_slice(&self.ident.to_be_bytes());
        buf[6..8].copy_from_slice(&self.flags_offset.to_be_bytes());
        buf[8] = self.ttl;
        buf[9] = self.protocol;
        buf[10..12].copy_from_slice(&self.checksum.to_be_bytes());
        buf[12..16].copy_from_slice(&self.src.0);
        buf[16..20].copy_from_slice(&self.dst.0);
    }

    /// Header length in bytes.
    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    /// Fragment offset in bytes.
    pub fn frag_offset(&self) -> usize {
        (self.flags_offset & OFFSET_MASK) as usize * 8
    }

    /// Returns `true` if the more-fragments flag is set.
    pub fn more_fragments(&self) -> bool {
        self.flags_offset & FLAG_MF != 0
    }

    /// Returns `true` if the don't-fragment flag is set.
    pub fn dont_fragment(&self) -> bool {
        self.flags_offset & FLAG_DF != 0
    }

    /// Returns `true` if this header belongs to a fragment.
    pub fn is_fragment(&self) -> bool {
        self.flags_offset & (FLAG_MF | OFFSET_MASK) != 0
    }
}

/// Computes the header checksum over `buf` and writes it in place.
pub fn set_header_checksum(buf: &mut [u8]) {
    let ihl = (buf[0] & 0xF) as usize * 4;
    buf[10] = 0;
    buf[11] = 0;
    let sum = checksum::checksum(&buf[..ihl]);
    buf[10..12].copy_from_slice(&sum.to_be_bytes());
}

/// Verifies the header checksum of `buf` (checksum field in place).
pub fn verify_header_checksum(buf: &[u8]) -> bool {
    let ihl = (buf[0] & 0xF) as usize * 4;
    buf.len() >= ihl && checksum::verify(&buf[..ihl])
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// A routing table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Destination network prefix.
    pub network: Ipv4Address,
    /// Network mask.
    pub netmask: Ipv4Address,
    /// Next hop, or `None` for directly connected networks.
    pub gateway: Option<Ipv4Address>,
    /// Egress interface slot.
    pub iface: usize,
    /// Route preference; lower is better.
    pub metric: u32,
}

impl Route {
    fn matches(&self, dst: Ipv4Address) -> bool {
        dst.masked(self.netmask) == self.network.masked(self.netmask)
    }

    fn prefix_bits(&self) -> u32 {
        self.netmask.0.iter().map(|&b| b.count_ones()).sum()
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// IPv4 layer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ipv4Stats {
    /// Datagrams received and accepted.
    pub packets_received: u64,
    /// Datagrams sent.
    pub packets_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Datagrams forwarded.
    pub packets_forwarded: u64,
    /// Datagrams dropped (validation, routing, TTL).
    pub packets_dropped: u64,
    /// Fragments received.
    pub fragments_received: u64,
    /// Whole datagrams produced by reassembly.
    pub fragments_reassembled: u64,
    /// Reassembly contexts abandoned or rejected.
    pub reassembly_failures: u64,
    /// Fragments produced on the send path.
    pub fragments_sent: u64,
    /// Datagrams that needed fragmentation but could not be fragmented.
    pub fragmentation_failures: u64,
}

// ---------------------------------------------------------------------------
// Reassembly
// ---------------------------------------------------------------------------

struct Reassembly {
    src: Ipv4Address,
    dst: Ipv4Address,
    protocol: u8,
    ident: u16,
    /// Tick the buffer was created; stale buffers are discarded by
    /// [`Ipv4::expire`].
    created: u64,
    /// Payload length, known once the final fragment (MF clear) arrives.
    total_len: Option<usize>,
    /// Linear payload buffer.
    data: Vec<u8>,
    /// Bit i set ⇔ payload bytes [8i, 8(i+1)) received.
    bits: [u64; REASSEMBLY_BITMAP_WORDS],
    /// TTL observed on the most recent fragment, carried into the
    /// reassembled header.
    ttl: u8,
}

impl Reassembly {
    fn mark(&mut self, offset: usize, len: usize) {
        let first = offset / 8;
        let last = (offset + len).div_ceil(8);
        for block in first..last {
            self.bits[block / 64] |= 1 << (block % 64);
        }
    }

    fn complete(&self) -> bool {
        let Some(total) = self.total_len else {
            return false;
        };
        let blocks = total.div_ceil(8);
        (0..blocks).all(|block| self.bits[block / 64] & (1 << (block % 64)) != 0)
    }
}

// ---------------------------------------------------------------------------
// Layer state
// ---------------------------------------------------------------------------

/// IPv4 layer state: routes, reassembly contexts and counters.
pub struct Ipv4 {
    routes: Vec<Route>,
    reassembly: Vec<Reassembly>,
    /// Layer counters.
    pub stats: Ipv4Stats,
    next_ident: u16,
}

impl Default for Ipv4 {
    fn default() -> Self {
        Self::new()
    }
}

impl Ipv4 {
    /// Creates an empty IPv4 layer.
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            reassembly: Vec::new(),
            stats: Ipv4Stats::default(),
            next_ident: 0,
        }
    }

    /// Inserts a route, keeping the table sorted by metric.
    pub fn add_route(&mut self, route: Route) {
        let pos = self
            .routes
            .iter()
            .position(|r| r.metric > route.metric)
            .unwrap_or(self.routes.len());
        self.routes.insert(pos, route);
    }

    /// Removes the route for `(network, netmask)`, if present.
    pub fn remove_route(&mut self, network: Ipv4Address, netmask: Ipv4Address) -> bool {
        let before = self.routes.len();
        self.routes
            .retain(|r| !(r.network == network && r.netmask == netmask));
        self.routes.len() != before
    }

    /// Drops every route.
    pub fn flush_routes(&mut self) {
        self.routes.clear();
    }

    /// Longest-prefix match with metric tiebreak.
    pub fn lookup_route(&self, dst: Ipv4Address) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|r| r.matches(dst))
            .max_by(|a, b| {
                a.prefix_bits()
                    .cmp(&b.prefix_bits())
                    .then(b.metric.cmp(&a.metric))
            })
    }

    fn next_ident(&mut self) -> u16 {
        let ident = self.next_ident;
        self.next_ident = self.next_ident.wrapping_add(1);
        ident
    }

    /// Feeds one fragment into reassembly. Consumes the fragment packet and
    /// returns the whole datagram when it completes.
    pub fn reassemble(
        &mut self,
        pool: &mut PacketPool,
        pkt: Packet,
        header: &Ipv4Header,
        now: u64,
    ) -> Option<Packet> {
        let offset = header.frag_offset();
        let payload_len = header.total_len as usize - header.header_len();
        if offset + payload_len > MAX_DATAGRAM - HEADER_LEN {
            // Fragment extends past the largest possible datagram.
            self.stats.reassembly_failures += 1;
            pool.free(pkt);
            return None;
        }

        let idx = match self.reassembly.iter().position(|b| {
            b.ident == header.ident
                && b.src == header.src
                && b.dst == header.dst
                && b.protocol == header.protocol
        }) {
            Some(idx) => idx,
            None => {
                if self.reassembly.len() >= MAX_REASSEMBLY_BUFFERS {
                    self.stats.reassembly_failures += 1;
                    pool.free(pkt);
                    return None;
                }
                self.reassembly.push(Reassembly {
                    src: header.src,
                    dst: header.dst,
                    protocol: header.protocol,
                    ident: header.ident,
                    created: now,
                    total_len: None,
                    data: vec![0; MAX_DATAGRAM - HEADER_LEN],
                    bits: [0; REASSEMBLY_BITMAP_WORDS],
                    ttl: header.ttl,
                });
                self.reassembly.len() - 1
            }
        };

        {
            let buf = &mut self.reassembly[idx];
            let payload = &pkt.data()[header.header_len()..header.total_len as usize];
            buf.data[offset..offset + payload_len].copy_from_slice(payload);
            buf.mark(offset, payload_len);
            buf.ttl = header.ttl;
            if !header.more_fragments() {
                buf.total_len = Some(offset + payload_len);
            }
        }
        pool.free(pkt);

        if !self.reassembly[idx].complete() {
            return None;
        }

        let buf = self.reassembly.swap_remove(idx);
        let total = buf.total_len.unwrap_or(0);
        let mut bytes = vec![0u8; HEADER_LEN + total];
        let whole_header = Ipv4Header {
            ihl: 5,
            tos: 0,
            total_len: (HEADER_LEN + total) as u16,
            ident: buf.ident,
            flags_offset: 0,
            ttl: buf.ttl,
            protocol: buf.protocol,
            checksum: 0,
            src: buf.src,
            dst: buf.dst,
        };
        whole_header.emit(&mut bytes);
        set_header_checksum(&mut bytes);
        bytes[HEADER_LEN..].copy_from_slice(&buf.data[..total]);

        self.stats.fragments_reassembled += 1;
        let mut whole = Packet::from_vec(bytes);
        whole.protocol = Protocol::Ipv4;
        Some(whole)
    }

    /// Discards reassembly buffers older than [`REASSEMBLY_TIMEOUT`].
    ///
    /// Nothing in the core invokes this periodically; it is a maintenance
    /// slot for a timer task.
    pub fn expire(&mut self, now: u64) {
        let before = self.reassembly.len();
        self.reassembly
            .retain(|b| now.saturating_sub(b.created) < REASSEMBLY_TIMEOUT);
        self.stats.reassembly_failures += (before - self.reassembly.len()) as u64;
    }

    /// Number of in-flight reassembly contexts.
    pub fn reassembly_in_flight(&self) -> usize {
        self.reassembly.len()
    }
}

// ---------------------------------------------------------------------------
// Send path
// ---------------------------------------------------------------------------

/// Allocates a packet of `len` bytes, spilling to the heap past the link
/// cap (large-MTU interfaces such as loopback).
fn alloc_packet(pool: &mut PacketPool, len: usize) -> Result<Packet, NetError> {
    if len <= MAX_PACKET_SIZE {
        pool.alloc(len)
    } else {
        Ok(Packet::from_vec(vec![0; len]))
    }
}

/// Sends `payload` to `dst` as protocol `protocol`.
///
/// Looks up the route, stamps a fresh header (caller TTL or the default 64),
/// fragments when the datagram exceeds the egress MTU, and hands the result
/// to the link layer.
pub fn send(
    stack: &mut NetStack,
    payload: &[u8],
    dst: Ipv4Address,
    protocol: u8,
    ttl: Option<u8>,
) -> Result<(), NetError> {
    if payload.len() > MAX_DATAGRAM - HEADER_LEN {
        return Err(NetError::PacketTooLarge);
    }
    let Some(route) = stack.ipv4.lookup_route(dst).copied() else {
        stack.ipv4.stats.packets_dropped += 1;
        return Err(NetError::NoRoute);
    };
    let iface = stack.ifaces.get(route.iface).ok_or(NetError::NoInterface)?;
    let src = iface.ipv4.ok_or(NetError::NotConfigured)?.addr;
    let mtu = iface.mtu as usize;

    let header = Ipv4Header {
        ihl: 5,
        tos: 0,
        total_len: (HEADER_LEN + payload.len()) as u16,
        ident: stack.ipv4.next_ident(),
        flags_offset: 0,
        ttl: ttl.unwrap_or(DEFAULT_TTL),
        protocol,
        checksum: 0,
        src,
        dst,
    };

    let total = HEADER_LEN + payload.len();
    stack.ipv4.stats.packets_sent += 1;
    stack.ipv4.stats.bytes_sent += total as u64;

    if total > mtu {
        return fragment_and_send(stack, route.iface, &header, payload, mtu);
    }

    let mut pkt = alloc_packet(&mut stack.pool, total)?;
    header.emit(pkt.data_mut());
    pkt.data_mut()[HEADER_LEN..].copy_from_slice(payload);
    set_header_checksum(pkt.data_mut());
    pkt.protocol = Protocol::Ipv4;

    let result = stack.ifaces.send(route.iface, &pkt);
    stack.pool.free(pkt);
    result
}

/// Splits `payload` into fragments of 8-byte-aligned size fitting `mtu` and
/// sends each independently.
fn fragment_and_send(
    stack: &mut NetStack,
    iface_id: usize,
    header: &Ipv4Header,
    payload: &[u8],
    mtu: usize,
) -> Result<(), NetError> {
    if header.dont_fragment() {
        stack.ipv4.stats.fragmentation_failures += 1;
        return Err(NetError::DontFragment);
    }
    let max_data = (mtu.saturating_sub(HEADER_LEN)) & !7;
    if max_data == 0 {
        stack.ipv4.stats.fragmentation_failures += 1;
        return Err(NetError::DontFragment);
    }

    // When re-fragmenting a middle fragment, the last piece keeps MF set.
    let carried_mf = header.more_fragments();
    let base_blocks = (header.flags_offset & OFFSET_MASK) as usize;

    let mut offset = 0;
    while offset < payload.len() {
        let frag_len = max_data.min(payload.len() - offset);
        let more = offset + frag_len < payload.len() || carried_mf;

        let mut frag_header = *header;
        frag_header.total_len = (HEADER_LEN + frag_len) as u16;
        frag_header.flags_offset =
            ((base_blocks + offset / 8) as u16 & OFFSET_MASK) | if more { FLAG_MF } else { 0 };

        let mut pkt = alloc_packet(&mut stack.pool, HEADER_LEN + frag_len)?;
        frag_header.emit(pkt.data_mut());
        pkt.data_mut()[HEADER_LEN..].copy_from_slice(&payload[offset..offset + frag_len]);
        set_header_checksum(pkt.data_mut());
        pkt.protocol = Protocol::Ipv4;

        let result = stack.ifaces.send(iface_id, &pkt);
        stack.pool.free(pkt);
        result?;

        stack.ipv4.stats.fragments_sent += 1;
        offset += frag_len;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Receive path
// ---------------------------------------------------------------------------

/// Protocol handler for inbound IPv4 packets.
///
/// Validates, reassembles fragments, forwards non-local datagrams, and
/// delivers local ones to the transport dispatch table.
pub fn on_receive(stack: &mut NetStack, iface_id: usize, mut pkt: Packet) {
    let Ok(mut header) = Ipv4Header::parse(pkt.data()) else {
        stack.ipv4.stats.packets_dropped += 1;
        stack.pool.free(pkt);
        return;
    };
    if pkt.len() < header.total_len as usize || !verify_header_checksum(pkt.data()) {
        stack.ipv4.stats.packets_dropped += 1;
        stack.pool.free(pkt);
        return;
    }

    stack.ipv4.stats.packets_received += 1;
    stack.ipv4.stats.bytes_received += u64::from(header.total_len);

    if header.is_fragment() {
        stack.ipv4.stats.fragments_received += 1;
        let now = stack.now;
        let NetStack { ipv4, pool, .. } = stack;
        match ipv4.reassemble(pool, pkt, &header, now) {
            Some(whole) => {
                pkt = whole;
                header = match Ipv4Header::parse(pkt.data()) {
                    Ok(h) => h,
                    Err(_) => {
                        stack.ipv4.stats.packets_dropped += 1;
                        stack.pool.free(pkt);
                        return;
                    }
                };
            }
            None => return, // incomplete, or reassembly rejected it
        }
    }

    if !stack.ifaces.is_local_addr(header.dst) {
        forward(stack, pkt, &header);
        return;
    }

    let proto = match header.protocol {
        PROTO_ICMP => Protocol::Icmp,
        PROTO_TCP => Protocol::Tcp,
        PROTO_UDP => Protocol::Udp,
        _ => {
            stack.ipv4.stats.packets_dropped += 1;
            stack.pool.free(pkt);
            return;
        }
    };

    let payload_len = header.total_len as usize - header.header_len();
    pkt.pull(header.header_len());
    pkt.set_len(payload_len);
    pkt.protocol = proto;
    pkt.src_addr = header.src;
    pkt.dst_addr = header.dst;
    stack.dispatch(iface_id, pkt);
}

/// Forwards a non-local datagram: TTL decrement, checksum rebuild, re-route
/// and possible re-fragmentation.
fn forward(stack: &mut NetStack, mut pkt: Packet, header: &Ipv4Header) {
    if header.ttl <= 1 {
        // An ICMP time-exceeded hook would go here.
        stack.ipv4.stats.packets_dropped += 1;
        stack.pool.free(pkt);
        return;
    }

    {
        let data = pkt.data_mut();
        data[8] -= 1;
        set_header_checksum(data);
    }
    let mut header = *header;
    header.ttl -= 1;

    let Some(route) = stack.ipv4.lookup_route(header.dst).copied() else {
        stack.ipv4.stats.packets_dropped += 1;
        stack.pool.free(pkt);
        return;
    };
    let Some(iface) = stack.ifaces.get(route.iface) else {
        stack.ipv4.stats.packets_dropped += 1;
        stack.pool.free(pkt);
        return;
    };
    let mtu = iface.mtu as usize;

    if pkt.len() > mtu {
        let header_len = header.header_len();
        let payload: Vec<u8> = pkt.data()[header_len..header.total_len as usize].to_vec();
        stack.pool.free(pkt);
        if fragment_and_send(stack, route.iface, &header, &payload, mtu).is_ok() {
            stack.ipv4.stats.packets_forwarded += 1;
        } else {
            stack.ipv4.stats.packets_dropped += 1;
        }
        return;
    }

    let ok = stack.ifaces.send(route.iface, &pkt).is_ok();
    stack.pool.free(pkt);
    if ok {
        stack.ipv4.stats.packets_forwarded += 1;
    } else {
        stack.ipv4.stats.packets_dropped += 1;
    }
}
