//! TCP: header and option codecs, the per-connection state machine, and the
//! connection table.
//!
//! The eleven canonical states are implemented with transitions driven by
//! received flag combinations, application calls (`connect` / `listen` /
//! `send` / `close`) and the TIME-WAIT timer. Segments are accepted only
//! exactly in order (`seq == rcv.nxt`); out-of-order segments are counted
//! and dropped — the SACK-permitted option is parsed and emitted but no SACK
//! queue exists. RTT estimator slots (SRTT, RTTVAR, RTO) are carried but not
//! driven; the initial RTO is used unchanged.

use alloc::vec;
use alloc::vec::Vec;

use crate::checksum::pseudo_checksum;
use crate::ipv4::{self, PROTO_TCP};
use crate::packet::Packet;
use crate::stack::NetStack;
use crate::{Ipv4Address, NetError};

/// Bytes in an option-less TCP header.
pub const HEADER_LEN: usize = 20;

/// Maximum number of concurrent connections.
pub const MAX_CONNECTIONS: usize = 256;

/// Maximum segment lifetime in ticks; TIME-WAIT lasts twice this.
pub const MSL: u64 = 30_000;

/// Window-scale shifts beyond this are clamped.
pub const MAX_WINDOW_SCALE: u8 = 14;

bitflags::bitflags! {
    /// TCP header flag bits (URG/ACK/PSH/RST/SYN/FIN).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        /// No more data from sender.
        const FIN = 0x01;
        /// Synchronize sequence numbers.
        const SYN = 0x02;
        /// Reset the connection.
        const RST = 0x04;
        /// Push buffered data to the application.
        const PSH = 0x08;
        /// Acknowledgment field is significant.
        const ACK = 0x10;
        /// Urgent pointer is significant.
        const URG = 0x20;
    }
}

// ---------------------------------------------------------------------------
// Header codec
// ---------------------------------------------------------------------------

/// A parsed TCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Sequence number of the first payload byte.
    pub seq: u32,
    /// Next sequence number expected from the peer (with ACK).
    pub ack: u32,
    /// Header length in 32-bit words (≥ 5; > 5 means options).
    pub data_offset: u8,
    /// Flag bits.
    pub flags: TcpFlags,
    /// Advertised receive window.
    pub window: u16,
    /// Checksum over pseudo-header and segment.
    pub checksum: u16,
    /// Urgent pointer.
    pub urgent: u16,
}

impl TcpHeader {
    /// Parses a header from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, NetError> {
        if data.len() < HEADER_LEN {
            return Err(NetError::Malformed);
        }
        let data_offset = data[12] >> 4;
        if data_offset < 5 || data_offset as usize * 4 > data.len() {
            return Err(NetError::Malformed);
        }
        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            data_offset,
            flags: TcpFlags::from_bits_truncate(data[13] & 0x3F),
            window: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
            urgent: u16::from_be_bytes([data[18], data[19]]),
        })
    }

    /// Writes the fixed header into the first 20 bytes of `buf`.
    pub fn emit(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        buf[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        buf[4..8].copy_from_slice(&self.seq.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ack.to_be_bytes());
        buf[12] = self.data_offset << 4;
        buf[13] = self.flags.bits();
        buf[14..16].copy_from_slice(&self.window.to_be_bytes());
        buf[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        buf[18..20].copy_from_slice(&self.urgent.to_be_bytes());
    }

    /// Header length in bytes, options included.
    pub fn header_len(&self) -> usize {
        self.data_offset as usize * 4
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_WSCALE: u8 = 3;
const OPT_SACK_PERMITTED: u8 = 4;
const OPT_TIMESTAMP: u8 = 8;

/// Options parsed from (or emitted into) a SYN / SYN-ACK.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpOptions {
    /// Maximum segment size.
    pub mss: Option<u16>,
    /// Window-scale shift count (clamped to [`MAX_WINDOW_SCALE`]).
    pub window_scale: Option<u8>,
    /// Peer permits selective acknowledgments.
    pub sack_permitted: bool,
    /// Timestamp value and echo reply.
    pub timestamp: Option<(u32, u32)>,
}

/// Parses the option area of a header.
///
/// Unknown kinds are skipped by their length byte; a malformed length is an
/// error (the segment is dropped).
pub fn parse_options(mut data: &[u8]) -> Result<TcpOptions, NetError> {
    let mut opts = TcpOptions::default();
    while let [kind, rest @ ..] = data {
        match *kind {
            OPT_END => break,
            OPT_NOP => {
                data = rest;
                continue;
            }
            _ => {}
        }
        let [len, ..] = rest else {
            return Err(NetError::Malformed);
        };
        let len = *len as usize;
        if len < 2 || len > data.len() {
            return Err(NetError::Malformed);
        }
        let body = &data[2..len];
        match *kind {
            OPT_MSS if len == 4 => {
                opts.mss = Some(u16::from_be_bytes([body[0], body[1]]));
            }
            OPT_WSCALE if len == 3 => {
                opts.window_scale = Some(body[0].min(MAX_WINDOW_SCALE));
            }
            OPT_SACK_PERMITTED if len == 2 => {
                opts.sack_permitted = true;
            }
            OPT_TIMESTAMP if len == 10 => {
                opts.timestamp = Some((
                    u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                    u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
                ));
            }
            _ => {} // unknown or mis-sized: skip
        }
        data = &data[len..];
    }
    Ok(opts)
}

/// Serializes options, NOP-padded to a 4-byte multiple.
pub fn build_options(opts: &TcpOptions, out: &mut Vec<u8>) {
    if let Some(mss) = opts.mss {
        out.extend_from_slice(&[OPT_MSS, 4]);
        out.extend_from_slice(&mss.to_be_bytes());
    }
    if let Some(shift) = opts.window_scale {
        out.extend_from_slice(&[OPT_WSCALE, 3, shift.min(MAX_WINDOW_SCALE)]);
    }
    if opts.sack_permitted {
        out.extend_from_slice(&[OPT_SACK_PERMITTED, 2]);
    }
    if let Some((value, echo)) = opts.timestamp {
        out.extend_from_slice(&[OPT_TIMESTAMP, 10]);
        out.extend_from_slice(&value.to_be_bytes());
        out.extend_from_slice(&echo.to_be_bytes());
    }
    while out.len() % 4 != 0 {
        out.push(OPT_NOP);
    }
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// The canonical TCP connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// No connection.
    Closed,
    /// Waiting for an inbound SYN.
    Listen,
    /// SYN sent, waiting for SYN-ACK.
    SynSent,
    /// SYN received, SYN-ACK sent, waiting for ACK.
    SynReceived,
    /// Data transfer.
    Established,
    /// We closed; waiting for ACK of our FIN.
    FinWait1,
    /// Our FIN acknowledged; waiting for the peer's FIN.
    FinWait2,
    /// Peer closed; waiting for the application to close.
    CloseWait,
    /// Both sides closed simultaneously; waiting for ACK of our FIN.
    Closing,
    /// Waiting for the final ACK of our FIN.
    LastAck,
    /// Draining old segments for 2·MSL before reuse.
    TimeWait,
}

impl TcpState {
    /// Canonical uppercase state name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
        }
    }
}

/// Per-connection configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpConfig {
    /// Maximum segment size we advertise.
    pub mss: u16,
    /// Window-scale shift we advertise (0 disables the option).
    pub window_scale: u8,
    /// Advertise SACK-permitted.
    pub sack_permitted: bool,
    /// Emit timestamp options.
    pub timestamps: bool,
    /// Initial send sequence number.
    pub initial_seq: u32,
    /// Send/receive buffer and advertised window size.
    pub window_size: u16,
    /// Initial retransmission timeout in ms.
    pub retransmit_time: u32,
    /// Keepalive interval in ms.
    pub keepalive_time: u32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            mss: 1460,
            window_scale: 0,
            sack_permitted: false,
            timestamps: false,
            initial_seq: 0,
            window_size: 65535,
            retransmit_time: 1000,
            keepalive_time: 7_200_000,
        }
    }
}

/// Per-connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpStats {
    /// Segments sent.
    pub packets_sent: u64,
    /// Segments received for this connection.
    pub packets_received: u64,
    /// Payload bytes sent.
    pub bytes_sent: u64,
    /// Payload bytes received in order.
    pub bytes_received: u64,
    /// Retransmitted segments.
    pub retransmissions: u64,
    /// ACKs that advanced nothing.
    pub duplicate_acks: u64,
    /// Segments outside the expected sequence, dropped.
    pub out_of_order: u64,
    /// Zero-window probes sent.
    pub window_probes: u64,
    /// Keepalive probes sent.
    pub keepalives_sent: u64,
    /// Keepalive probes answered.
    pub keepalives_received: u64,
    /// RSTs sent on this connection.
    pub resets_sent: u64,
    /// RSTs received.
    pub resets_received: u64,
    /// Segments dropped without a matching transition.
    pub segments_dropped: u64,
}

/// A segment handed to the state machine: parsed header, options, payload.
pub struct SegmentView<'a> {
    /// The parsed header.
    pub header: TcpHeader,
    /// Options parsed from the header.
    pub options: TcpOptions,
    /// Segment payload.
    pub payload: &'a [u8],
}

/// A segment the state machine wants transmitted in response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Flags to send.
    pub flags: TcpFlags,
    /// Sequence number.
    pub seq: u32,
    /// Acknowledgment number.
    pub ack: u32,
    /// Include our SYN options (SYN / SYN-ACK only).
    pub with_options: bool,
}

/// One TCP connection.
pub struct TcpConn {
    /// Local address.
    pub local_addr: Ipv4Address,
    /// Remote address (unspecified while listening).
    pub remote_addr: Ipv4Address,
    /// Local port.
    pub local_port: u16,
    /// Remote port (0 while listening).
    pub remote_port: u16,
    /// Connection state.
    pub state: TcpState,
    /// Configuration fixed at open time.
    pub config: TcpConfig,
    /// Connection counters.
    pub stats: TcpStats,
    /// Oldest unacknowledged sequence number.
    pub snd_una: u32,
    /// Next sequence number to send.
    pub snd_nxt: u32,
    /// Peer's advertised receive window.
    pub snd_wnd: u32,
    /// Next sequence number expected from the peer.
    pub rcv_nxt: u32,
    /// Our advertised receive window.
    pub rcv_wnd: u32,
    /// Retransmission timeout in ms. Initial value is used unchanged; the
    /// estimators below are carried but not driven.
    pub rto: u32,
    /// Smoothed round-trip time slot (not driven).
    pub srtt: u32,
    /// Round-trip variance slot (not driven).
    pub rttvar: u32,
    /// Deadline for the retransmission timer. Re-armed on send and on a new
    /// ACK; no retransmit sweep consumes it.
    pub retransmit_at: Option<u64>,
    /// Next keepalive deadline.
    pub keepalive_at: u64,
    /// Tick at which TIME-WAIT collapses to CLOSED.
    time_wait_until: Option<u64>,
    /// Unacknowledged outbound bytes, `[snd_una, snd_nxt)`.
    send_buf: Vec<u8>,
    /// In-order received bytes not yet read by the application.
    recv_buf: Vec<u8>,
    /// Options learned from the peer's SYN.
    pub peer: TcpOptions,
}

impl TcpConn {
    fn new(
        local_addr: Ipv4Address,
        local_port: u16,
        remote_addr: Ipv4Address,
        remote_port: u16,
        config: TcpConfig,
        now: u64,
    ) -> Self {
        Self {
            local_addr,
            remote_addr,
            local_port,
            remote_port,
            state: TcpState::Closed,
            config,
            stats: TcpStats::default(),
            snd_una: config.initial_seq,
            snd_nxt: config.initial_seq,
            snd_wnd: u32::from(config.window_size),
            rcv_nxt: 0,
            rcv_wnd: u32::from(config.window_size),
            rto: config.retransmit_time,
            srtt: 0,
            rttvar: 0,
            retransmit_at: None,
            keepalive_at: now + u64::from(config.keepalive_time),
            time_wait_until: None,
            send_buf: Vec::new(),
            recv_buf: Vec::new(),
            peer: TcpOptions::default(),
        }
    }

    /// Window-scale shift applied to the peer's advertised window.
    fn peer_window_shift(&self) -> u8 {
        self.peer.window_scale.unwrap_or(0)
    }

    /// Bytes buffered for the application.
    pub fn recv_available(&self) -> usize {
        self.recv_buf.len()
    }

    /// Unacknowledged bytes in the send buffer.
    pub fn send_pending(&self) -> usize {
        self.send_buf.len()
    }

    /// Our SYN options per the configuration.
    fn our_options(&self, now: u64) -> TcpOptions {
        TcpOptions {
            mss: Some(self.config.mss),
            window_scale: (self.config.window_scale > 0).then_some(self.config.window_scale),
            sack_permitted: self.config.sack_permitted,
            timestamp: self.config.timestamps.then_some((now as u32, 0)),
        }
    }

    /// Feeds one received segment through the state machine.
    ///
    /// Every (state, flags) pair produces a documented transition, a drop
    /// with a counter increment, or (at the table level) an RST. Returns the
    /// segment to transmit in response, if any.
    pub fn on_segment(&mut self, seg: &SegmentView<'_>, now: u64) -> Option<Reply> {
        use TcpState::*;

        self.stats.packets_received += 1;
        let h = &seg.header;

        if h.flags.contains(TcpFlags::RST) {
            self.stats.resets_received += 1;
            if self.state != Listen && self.state != Closed {
                self.state = Closed;
                self.retransmit_at = None;
            }
            return None;
        }

        match self.state {
            Closed => {
                self.stats.segments_dropped += 1;
                None
            }
            Listen => {
                if h.flags.contains(TcpFlags::SYN) && !h.flags.contains(TcpFlags::ACK) {
                    self.peer = seg.options;
                    self.rcv_nxt = h.seq.wrapping_add(1);
                    self.snd_wnd = u32::from(h.window);
                    self.state = SynReceived;
                    let reply = Reply {
                        flags: TcpFlags::SYN | TcpFlags::ACK,
                        seq: self.snd_nxt,
                        ack: self.rcv_nxt,
                        with_options: true,
                    };
                    // Our SYN consumes one sequence number.
                    self.snd_nxt = self.snd_nxt.wrapping_add(1);
                    self.retransmit_at = Some(now + u64::from(self.rto));
                    Some(reply)
                } else {
                    self.stats.segments_dropped += 1;
                    None
                }
            }
            SynSent => {
                if h.flags.contains(TcpFlags::SYN | TcpFlags::ACK) && h.ack == self.snd_nxt {
                    self.peer = seg.options;
                    self.rcv_nxt = h.seq.wrapping_add(1);
                    self.snd_una = h.ack;
                    // Window in a SYN is never scaled.
                    self.snd_wnd = u32::from(h.window);
                    self.state = Established;
                    self.retransmit_at = None;
                    Some(Reply {
                        flags: TcpFlags::ACK,
                        seq: self.snd_nxt,
                        ack: self.rcv_nxt,
                        with_options: false,
                    })
                } else {
                    self.stats.segments_dropped += 1;
                    None
                }
            }
            SynReceived => {
                if h.flags.contains(TcpFlags::ACK) && h.ack == self.snd_nxt {
                    self.snd_una = h.ack;
                    self.state = Established;
                    self.retransmit_at = None;
                    // Fall through to payload processing for piggybacked data.
                    self.steady_state(seg, now)
                } else {
                    self.stats.segments_dropped += 1;
                    None
                }
            }
            Established | FinWait1 | FinWait2 | CloseWait | Closing | LastAck | TimeWait => {
                self.steady_state(seg, now)
            }
        }
    }

    /// Post-handshake segment processing: window update, ACK advance,
    /// in-order payload, FIN handling.
    fn steady_state(&mut self, seg: &SegmentView<'_>, now: u64) -> Option<Reply> {
        use TcpState::*;

        let h = &seg.header;
        let mut want_ack = false;

        self.snd_wnd = u32::from(h.window) << self.peer_window_shift();

        // Is a FIN of ours still unacknowledged?
        let fin_outstanding = matches!(self.state, FinWait1 | Closing | LastAck);
        let mut fin_acked = false;

        if h.flags.contains(TcpFlags::ACK) {
            let acked = h.ack.wrapping_sub(self.snd_una);
            let buffered = self.send_buf.len() as u32;
            if acked == 0 {
                if !self.send_buf.is_empty() {
                    self.stats.duplicate_acks += 1;
                }
            } else if acked <= buffered {
                // New data acknowledged: drop the prefix, slide snd.una,
                // reset the retransmission timer.
                self.send_buf.drain(..acked as usize);
                self.snd_una = h.ack;
                self.retransmit_at = Some(now + u64::from(self.rto));
            } else if fin_outstanding && acked == buffered + 1 {
                // Everything including our FIN acknowledged.
                self.send_buf.clear();
                self.snd_una = h.ack;
                self.retransmit_at = None;
                fin_acked = true;
            } else {
                self.stats.duplicate_acks += 1;
            }
        }

        if fin_acked {
            match self.state {
                FinWait1 => self.state = FinWait2,
                Closing => {
                    self.state = TimeWait;
                    self.time_wait_until = Some(now + 2 * MSL);
                }
                LastAck => self.state = Closed,
                _ => {}
            }
        }

        // Payload: accept only the exactly-expected sequence.
        let data = seg.payload;
        if !data.is_empty() {
            let accepts_data = matches!(self.state, Established | FinWait1 | FinWait2);
            if accepts_data
                && h.seq == self.rcv_nxt
                && self.recv_buf.len() + data.len() <= usize::from(self.config.window_size)
            {
                self.recv_buf.extend_from_slice(data);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(data.len() as u32);
                self.rcv_wnd = self.rcv_wnd.saturating_sub(data.len() as u32);
                self.stats.bytes_received += data.len() as u64;
                want_ack = true;
            } else {
                self.stats.out_of_order += 1;
            }
        }

        if h.flags.contains(TcpFlags::FIN) {
            // Honor the FIN only once everything before it was consumed.
            let fin_seq = h.seq.wrapping_add(data.len() as u32);
            let already_seen = matches!(self.state, CloseWait | Closing | LastAck | TimeWait);
            if fin_seq == self.rcv_nxt && !already_seen {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                want_ack = true;
                match self.state {
                    Established => self.state = CloseWait,
                    FinWait1 => {
                        // Simultaneous close. If this segment also acked our
                        // FIN, fin_acked above already moved us to FinWait2
                        // and the arm below takes it to TimeWait.
                        self.state = Closing;
                    }
                    FinWait2 => {
                        self.state = TimeWait;
                        self.time_wait_until = Some(now + 2 * MSL);
                    }
                    _ => {}
                }
            } else if already_seen && fin_seq == self.rcv_nxt.wrapping_sub(1) {
                // Retransmitted FIN: re-acknowledge.
                want_ack = true;
            } else {
                self.stats.out_of_order += 1;
            }
        }

        want_ack.then_some(Reply {
            flags: TcpFlags::ACK,
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            with_options: false,
        })
    }

    /// Collapses TIME-WAIT to CLOSED once 2·MSL has elapsed.
    fn poll(&mut self, now: u64) {
        if self.state == TcpState::TimeWait
            && self.time_wait_until.is_some_and(|t| t <= now)
        {
            self.state = TcpState::Closed;
            self.time_wait_until = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Connection table
// ---------------------------------------------------------------------------

/// The TCP layer: connection table plus layer-wide counters.
#[derive(Default)]
pub struct TcpLayer {
    conns: Vec<Option<TcpConn>>,
    /// RSTs sent for segments matching no connection.
    pub resets_sent: u64,
    /// Segments dropped before reaching any connection (malformed or bad
    /// checksum).
    pub invalid_drops: u64,
}

impl TcpLayer {
    /// Creates an empty layer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a connection record in the CLOSED state.
    pub fn open(
        &mut self,
        local_addr: Ipv4Address,
        local_port: u16,
        remote_addr: Ipv4Address,
        remote_port: u16,
        config: Option<TcpConfig>,
        now: u64,
    ) -> Result<usize, NetError> {
        if self.conns.iter().flatten().count() >= MAX_CONNECTIONS {
            return Err(NetError::TableFull);
        }
        let conn = TcpConn::new(
            local_addr,
            local_port,
            remote_addr,
            remote_port,
            config.unwrap_or_default(),
            now,
        );
        if let Some(slot) = self.conns.iter().position(Option::is_none) {
            self.conns[slot] = Some(conn);
            Ok(slot)
        } else {
            self.conns.push(Some(conn));
            Ok(self.conns.len() - 1)
        }
    }

    /// Moves a CLOSED connection with an unspecified remote to LISTEN.
    pub fn listen(&mut self, id: usize) -> Result<(), NetError> {
        let conn = self.get_mut(id).ok_or(NetError::NoSuchSocket)?;
        if conn.state != TcpState::Closed {
            return Err(NetError::InvalidState);
        }
        conn.state = TcpState::Listen;
        Ok(())
    }

    /// Removes a connection record and frees its buffers.
    pub fn remove(&mut self, id: usize) -> Result<(), NetError> {
        self.conns
            .get_mut(id)
            .and_then(Option::take)
            .map(|_| ())
            .ok_or(NetError::NoSuchSocket)
    }

    /// Returns a connection by id.
    pub fn get(&self, id: usize) -> Option<&TcpConn> {
        self.conns.get(id)?.as_ref()
    }

    /// Mutable access to a connection by id.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut TcpConn> {
        self.conns.get_mut(id)?.as_mut()
    }

    /// Drains up to `out.len()` in-order received bytes.
    pub fn receive(&mut self, id: usize, out: &mut [u8]) -> usize {
        let Some(conn) = self.get_mut(id) else {
            return 0;
        };
        let n = out.len().min(conn.recv_buf.len());
        out[..n].copy_from_slice(&conn.recv_buf[..n]);
        conn.recv_buf.drain(..n);
        conn.rcv_wnd = conn.rcv_wnd.saturating_add(n as u32);
        n
    }

    /// Runs timer maintenance (TIME-WAIT expiry) over every connection.
    pub fn poll(&mut self, now: u64) {
        for conn in self.conns.iter_mut().flatten() {
            conn.poll(now);
        }
    }

    /// Exact 4-tuple match, falling back to a listening connection on the
    /// local port.
    fn find(
        &mut self,
        local_addr: Ipv4Address,
        local_port: u16,
        remote_addr: Ipv4Address,
        remote_port: u16,
    ) -> Option<usize> {
        let exact = self.conns.iter().position(|c| {
            c.as_ref().is_some_and(|c| {
                c.local_port == local_port
                    && c.remote_port == remote_port
                    && c.local_addr == local_addr
                    && c.remote_addr == remote_addr
            })
        });
        exact.or_else(|| {
            self.conns.iter().position(|c| {
                c.as_ref().is_some_and(|c| {
                    c.state == TcpState::Listen
                        && c.local_port == local_port
                        && (c.local_addr == local_addr
                            || c.local_addr == Ipv4Address::UNSPECIFIED)
                })
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Application entry points (segment-emitting)
// ---------------------------------------------------------------------------

/// Initiates the handshake: CLOSED → SYN-SENT, transmitting a SYN carrying
/// our options.
pub fn connect(stack: &mut NetStack, id: usize, now: u64) -> Result<(), NetError> {
    let (reply, opts) = {
        let conn = stack.tcp.get_mut(id).ok_or(NetError::NoSuchSocket)?;
        if conn.state != TcpState::Closed {
            return Err(NetError::InvalidState);
        }
        conn.state = TcpState::SynSent;
        let reply = Reply {
            flags: TcpFlags::SYN,
            seq: conn.snd_nxt,
            ack: 0,
            with_options: true,
        };
        conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
        conn.retransmit_at = Some(now + u64::from(conn.rto));
        (reply, conn.our_options(now))
    };
    transmit(stack, id, reply, &opts, &[], now)
}

/// Application close: sends FIN per the current state.
pub fn close(stack: &mut NetStack, id: usize, now: u64) -> Result<(), NetError> {
    let reply = {
        let conn = stack.tcp.get_mut(id).ok_or(NetError::NoSuchSocket)?;
        match conn.state {
            TcpState::Established => conn.state = TcpState::FinWait1,
            TcpState::CloseWait => conn.state = TcpState::LastAck,
            TcpState::SynSent | TcpState::Listen => {
                conn.state = TcpState::Closed;
                return Ok(());
            }
            _ => return Err(NetError::InvalidState),
        }
        let reply = Reply {
            flags: TcpFlags::FIN | TcpFlags::ACK,
            seq: conn.snd_nxt,
            ack: conn.rcv_nxt,
            with_options: false,
        };
        // The FIN consumes one sequence number.
        conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
        conn.retransmit_at = Some(now + u64::from(conn.rto));
        reply
    };
    transmit(stack, id, reply, &TcpOptions::default(), &[], now)
}

/// Queues `data` on an ESTABLISHED connection and transmits it in MSS-sized
/// segments.
pub fn send(stack: &mut NetStack, id: usize, data: &[u8], now: u64) -> Result<(), NetError> {
    let (mss, mut seq, ack) = {
        let conn = stack.tcp.get_mut(id).ok_or(NetError::NoSuchSocket)?;
        if conn.state != TcpState::Established {
            return Err(NetError::InvalidState);
        }
        if conn.send_buf.len() + data.len() > usize::from(conn.config.window_size) {
            return Err(NetError::BufferFull);
        }
        conn.send_buf.extend_from_slice(data);
        let mss = usize::from(conn.peer.mss.unwrap_or(conn.config.mss)).max(1);
        let seq = conn.snd_nxt;
        conn.snd_nxt = conn.snd_nxt.wrapping_add(data.len() as u32);
        conn.retransmit_at = Some(now + u64::from(conn.rto));
        conn.stats.bytes_sent += data.len() as u64;
        (mss, seq, conn.rcv_nxt)
    };

    for chunk in data.chunks(mss) {
        let reply = Reply {
            flags: TcpFlags::ACK | TcpFlags::PSH,
            seq,
            ack,
            with_options: false,
        };
        transmit(stack, id, reply, &TcpOptions::default(), chunk, now)?;
        seq = seq.wrapping_add(chunk.len() as u32);
    }
    Ok(())
}

/// Builds and transmits one segment for a connection.
fn transmit(
    stack: &mut NetStack,
    id: usize,
    reply: Reply,
    opts: &TcpOptions,
    payload: &[u8],
    _now: u64,
) -> Result<(), NetError> {
    let (local, remote, local_port, remote_port, window) = {
        let conn = stack.tcp.get(id).ok_or(NetError::NoSuchSocket)?;
        (
            conn.local_addr,
            conn.remote_addr,
            conn.local_port,
            conn.remote_port,
            conn.rcv_wnd.min(65535) as u16,
        )
    };

    let mut option_bytes = Vec::new();
    if reply.with_options {
        build_options(opts, &mut option_bytes);
    }
    let header_len = HEADER_LEN + option_bytes.len();
    let mut segment = vec![0u8; header_len + payload.len()];

    let header = TcpHeader {
        src_port: local_port,
        dst_port: remote_port,
        seq: reply.seq,
        ack: reply.ack,
        data_offset: (header_len / 4) as u8,
        flags: reply.flags,
        window,
        checksum: 0,
        urgent: 0,
    };
    header.emit(&mut segment);
    segment[HEADER_LEN..header_len].copy_from_slice(&option_bytes);
    segment[header_len..].copy_from_slice(payload);

    let sum = pseudo_checksum(local, remote, PROTO_TCP, &segment);
    segment[16..18].copy_from_slice(&sum.to_be_bytes());

    ipv4::send(stack, &segment, remote, PROTO_TCP, None)?;
    if let Some(conn) = stack.tcp.get_mut(id) {
        conn.stats.packets_sent += 1;
        if reply.flags.contains(TcpFlags::RST) {
            conn.stats.resets_sent += 1;
        }
    }
    Ok(())
}

/// Sends a bare RST for a segment that matched no connection.
fn send_rst(stack: &mut NetStack, pkt: &Packet, h: &TcpHeader, payload_len: usize) {
    let (seq, ack) = if h.flags.contains(TcpFlags::ACK) {
        (h.ack, 0)
    } else {
        let mut advance = payload_len as u32;
        if h.flags.contains(TcpFlags::SYN) {
            advance += 1;
        }
        if h.flags.contains(TcpFlags::FIN) {
            advance += 1;
        }
        (0, h.seq.wrapping_add(advance))
    };

    let mut segment = vec![0u8; HEADER_LEN];
    let header = TcpHeader {
        src_port: h.dst_port,
        dst_port: h.src_port,
        seq,
        ack,
        data_offset: 5,
        flags: TcpFlags::RST | TcpFlags::ACK,
        window: 0,
        checksum: 0,
        urgent: 0,
    };
    header.emit(&mut segment);
    let sum = pseudo_checksum(pkt.dst_addr, pkt.src_addr, PROTO_TCP, &segment);
    segment[16..18].copy_from_slice(&sum.to_be_bytes());

    if ipv4::send(stack, &segment, pkt.src_addr, PROTO_TCP, None).is_ok() {
        stack.tcp.resets_sent += 1;
    }
}

/// Protocol handler for inbound TCP segments.
pub fn on_receive(stack: &mut NetStack, _iface_id: usize, pkt: Packet) {
    let now = stack.now;

    let Ok(header) = TcpHeader::parse(pkt.data()) else {
        stack.tcp.invalid_drops += 1;
        stack.pool.free(pkt);
        return;
    };

    // Checksum over pseudo-header + segment with the field zeroed.
    {
        let mut segment = pkt.data().to_vec();
        segment[16] = 0;
        segment[17] = 0;
        let sum = pseudo_checksum(pkt.src_addr, pkt.dst_addr, PROTO_TCP, &segment);
        if sum != header.checksum {
            stack.tcp.invalid_drops += 1;
            stack.pool.free(pkt);
            return;
        }
    }

    let Ok(options) = parse_options(&pkt.data()[HEADER_LEN..header.header_len()]) else {
        stack.tcp.invalid_drops += 1;
        stack.pool.free(pkt);
        return;
    };

    let Some(id) = stack
        .tcp
        .find(pkt.dst_addr, header.dst_port, pkt.src_addr, header.src_port)
    else {
        let payload_len = pkt.len() - header.header_len();
        if !header.flags.contains(TcpFlags::RST) {
            send_rst(stack, &pkt, &header, payload_len);
        }
        stack.pool.free(pkt);
        return;
    };

    let reply = {
        let conn = stack.tcp.get_mut(id).expect("connection just found");
        // A listener learns its peer from the first SYN.
        if conn.state == TcpState::Listen {
            conn.remote_addr = pkt.src_addr;
            conn.remote_port = header.src_port;
            conn.local_addr = pkt.dst_addr;
        }
        let payload = &pkt.data()[header.header_len()..];
        conn.on_segment(
            &SegmentView {
                header,
                options,
                payload,
            },
            now,
        )
    };
    stack.pool.free(pkt);

    if let Some(reply) = reply {
        let (opts, now) = {
            let conn = stack.tcp.get(id).expect("connection just found");
            (conn.our_options(now), now)
        };
        let _ = transmit(stack, id, reply, &opts, &[], now);
    }
}
