//! UDP: bound sockets, datagram send, and the non-blocking receive ring.

use alloc::vec;
use alloc::vec::Vec;

use crate::checksum::pseudo_checksum;
use crate::ipv4::{self, PROTO_UDP};
use crate::packet::Packet;
use crate::stack::NetStack;
use crate::{Ipv4Address, NetError};

/// Bytes in a UDP header.
pub const HEADER_LEN: usize = 8;

/// Largest UDP payload (65535 minus UDP and IPv4 headers).
pub const MAX_PAYLOAD: usize = 65507;

/// A parsed UDP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Length of header plus payload.
    pub length: u16,
    /// Checksum over pseudo-header and datagram; zero means "not computed"
    /// and a computed zero is transmitted as 0xFFFF.
    pub checksum: u16,
}

impl UdpHeader {
    /// Parses a header from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, NetError> {
        if data.len() < HEADER_LEN {
            return Err(NetError::Malformed);
        }
        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            checksum: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    /// Writes the header into the first 8 bytes of `buf`.
    pub fn emit(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        buf[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        buf[4..6].copy_from_slice(&self.length.to_be_bytes());
        buf[6..8].copy_from_slice(&self.checksum.to_be_bytes());
    }
}

/// Per-socket configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpConfig {
    /// Receive ring capacity in bytes.
    pub buffer_size: usize,
    /// Compute and verify checksums.
    pub checksum: bool,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            checksum: true,
        }
    }
}

/// Per-socket counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpStats {
    /// Datagrams sent.
    pub packets_sent: u64,
    /// Datagrams delivered into the ring.
    pub packets_received: u64,
    /// Payload bytes sent.
    pub bytes_sent: u64,
    /// Payload bytes delivered.
    pub bytes_received: u64,
    /// Datagrams dropped for checksum mismatch.
    pub checksum_errors: u64,
    /// Datagrams dropped because the ring was full.
    pub buffer_overflows: u64,
}

/// Circular byte buffer with start/length indices.
struct RecvRing {
    buf: Vec<u8>,
    start: usize,
    len: usize,
}

impl RecvRing {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            start: 0,
            len: 0,
        }
    }

    /// Appends `data`, failing without side effects when it does not fit.
    fn push(&mut self, data: &[u8]) -> bool {
        if self.len + data.len() > self.buf.len() {
            return false;
        }
        for (i, &byte) in data.iter().enumerate() {
            let pos = (self.start + self.len + i) % self.buf.len();
            self.buf[pos] = byte;
        }
        self.len += data.len();
        true
    }

    /// Pops up to `out.len()` bytes, returning the count.
    fn pop(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        for slot in out.iter_mut().take(n) {
            *slot = self.buf[self.start];
            self.start = (self.start + 1) % self.buf.len();
        }
        self.len -= n;
        if self.len == 0 {
            self.start = 0;
        }
        n
    }
}

/// A bound UDP socket.
pub struct UdpSocket {
    /// Bound local address.
    pub local_addr: Ipv4Address,
    /// Bound local port.
    pub local_port: u16,
    /// Socket configuration.
    pub config: UdpConfig,
    /// Socket counters.
    pub stats: UdpStats,
    ring: RecvRing,
}

/// The UDP layer: socket table plus layer-wide counters.
#[derive(Default)]
pub struct UdpLayer {
    sockets: Vec<Option<UdpSocket>>,
    /// Datagrams dropped because no socket matched. The ICMP
    /// port-unreachable response is an unimplemented hook.
    pub no_socket_drops: u64,
}

impl UdpLayer {
    /// Creates an empty layer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a socket to `(addr, port)`.
    ///
    /// The pair must be unique across the socket table.
    pub fn bind(
        &mut self,
        addr: Ipv4Address,
        port: u16,
        config: Option<UdpConfig>,
    ) -> Result<usize, NetError> {
        if self
            .sockets
            .iter()
            .flatten()
            .any(|s| s.local_port == port && s.local_addr == addr)
        {
            return Err(NetError::PortInUse);
        }
        let config = config.unwrap_or_default();
        let socket = UdpSocket {
            local_addr: addr,
            local_port: port,
            config,
            stats: UdpStats::default(),
            ring: RecvRing::new(config.buffer_size),
        };
        if let Some(slot) = self.sockets.iter().position(Option::is_none) {
            self.sockets[slot] = Some(socket);
            Ok(slot)
        } else {
            self.sockets.push(Some(socket));
            Ok(self.sockets.len() - 1)
        }
    }

    /// Closes a socket, releasing its buffer and binding.
    pub fn close(&mut self, id: usize) -> Result<(), NetError> {
        self.sockets
            .get_mut(id)
            .and_then(Option::take)
            .map(|_| ())
            .ok_or(NetError::NoSuchSocket)
    }

    /// Returns the socket with the given id, if live.
    pub fn get(&self, id: usize) -> Option<&UdpSocket> {
        self.sockets.get(id)?.as_ref()
    }

    fn get_mut(&mut self, id: usize) -> Option<&mut UdpSocket> {
        self.sockets.get_mut(id)?.as_mut()
    }

    /// Non-blocking receive: drains up to `out.len()` buffered bytes,
    /// returning 0 when the ring is empty.
    pub fn receive(&mut self, id: usize, out: &mut [u8]) -> usize {
        match self.get_mut(id) {
            Some(socket) => socket.ring.pop(out),
            None => 0,
        }
    }

    fn find(&mut self, addr: Ipv4Address, port: u16) -> Option<&mut UdpSocket> {
        self.sockets
            .iter_mut()
            .flatten()
            .find(|s| s.local_port == port && s.local_addr == addr)
    }
}

/// Sends a datagram from a bound socket.
pub fn send(
    stack: &mut NetStack,
    id: usize,
    dst: Ipv4Address,
    dst_port: u16,
    payload: &[u8],
) -> Result<(), NetError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(NetError::PacketTooLarge);
    }
    let (src_addr, src_port, use_checksum) = {
        let socket = stack.udp.get(id).ok_or(NetError::NoSuchSocket)?;
        (socket.local_addr, socket.local_port, socket.config.checksum)
    };

    let mut dgram = vec![0u8; HEADER_LEN + payload.len()];
    let header = UdpHeader {
        src_port,
        dst_port,
        length: (HEADER_LEN + payload.len()) as u16,
        checksum: 0,
    };
    header.emit(&mut dgram);
    dgram[HEADER_LEN..].copy_from_slice(payload);

    if use_checksum {
        let sum = pseudo_checksum(src_addr, dst, PROTO_UDP, &dgram);
        // A computed zero is transmitted as all-ones.
        let sum = if sum == 0 { 0xFFFF } else { sum };
        dgram[6..8].copy_from_slice(&sum.to_be_bytes());
    }

    ipv4::send(stack, &dgram, dst, PROTO_UDP, None)?;

    if let Some(socket) = stack.udp.get_mut(id) {
        socket.stats.packets_sent += 1;
        socket.stats.bytes_sent += payload.len() as u64;
    }
    Ok(())
}

/// Protocol handler for inbound UDP datagrams.
///
/// The packet's address pair was stamped by the IPv4 layer.
pub fn on_receive(stack: &mut NetStack, _iface_id: usize, pkt: Packet) {
    let result = deliver(stack, &pkt);
    if result.is_err() {
        stack.udp.no_socket_drops += 1;
    }
    stack.pool.free(pkt);
}

fn deliver(stack: &mut NetStack, pkt: &Packet) -> Result<(), ()> {
    let data = pkt.data();
    let header = UdpHeader::parse(data).map_err(|_| ())?;
    let length = header.length as usize;
    if length < HEADER_LEN || length > data.len() {
        return Err(());
    }

    let socket = stack
        .udp
        .find(pkt.dst_addr, header.dst_port)
        .ok_or(())?;

    // Verify a non-zero checksum when the socket asks for it.
    if socket.config.checksum && header.checksum != 0 {
        let mut dgram = data[..length].to_vec();
        dgram[6] = 0;
        dgram[7] = 0;
        let mut expect = pseudo_checksum(pkt.src_addr, pkt.dst_addr, PROTO_UDP, &dgram);
        if expect == 0 {
            expect = 0xFFFF;
        }
        if expect != header.checksum {
            socket.stats.checksum_errors += 1;
            return Ok(()); // counted on the socket, not a layer drop
        }
    }

    let payload = &data[HEADER_LEN..length];
    if socket.ring.push(payload) {
        socket.stats.packets_received += 1;
        socket.stats.bytes_received += payload.len() as u64;
    } else {
        socket.stats.buffer_overflows += 1;
    }
    Ok(())
}
