use pnet::packet::Packet;
use pnet::packet::ethernet::EtherTypes;
use pnet::packet::ethernet::EthernetPacket;
use pnet::packet::ethernet::MutableEthernetPacket;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Flags;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv4::MutableIpv4Packet;
use pnet::packet::tcp::MutableTcpPacket;
use pnet::packet::tcp::TcpFlags;
use pnet::packet::tcp::TcpPacket;
use pnet::util::MacAddr;
use std::net::Ipv4Addr;
use std::time::Duration;
use strum_macros::Display;
use tracing::debug;

use crate::Result;
use crate::config::CaptureConfig;
use crate::error::WscaptureError;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
/// Ethernet + IPv4 + TCP, no options.
pub const SEGMENT_OVERHEAD: usize = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + TCP_HEADER_LEN;
/// Largest payload whose IPv4 total length still fits in 16 bits.
pub const MAX_SEGMENT_PAYLOAD: usize = u16::MAX as usize - IPV4_HEADER_LEN - TCP_HEADER_LEN;

/// Largest payload one segment may carry so its record is never cut by `snaplen`
/// and its IPv4 total length fits in 16 bits. Never below one byte.
pub fn max_segment_payload(snaplen: u32) -> usize {
    let by_snaplen = (snaplen as usize).saturating_sub(SEGMENT_OVERHEAD);
    by_snaplen.clamp(1, MAX_SEGMENT_PAYLOAD)
}

pub const FLAGS_SYN: u8 = TcpFlags::SYN;
pub const FLAGS_SYN_ACK: u8 = TcpFlags::SYN | TcpFlags::ACK;
pub const FLAGS_ACK: u8 = TcpFlags::ACK;
pub const FLAGS_PSH_ACK: u8 = TcpFlags::PSH | TcpFlags::ACK;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Direction {
    #[strum(serialize = "client->server")]
    ClientToServer,
    #[strum(serialize = "server->client")]
    ServerToClient,
}

impl Direction {
    pub fn from_client(self) -> bool {
        self == Direction::ClientToServer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// Per-connection state the synthetic capture advances on every segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSession {
    pub client: Endpoint,
    pub server: Endpoint,
    /// Next sequence number each side will send.
    pub client_seq: u32,
    pub server_seq: u32,
    /// Identification for the next IPv4 header.
    pub ip_id: u16,
    pub ttl: u8,
    pub window: u16,
    pub handshake_done: bool,
}

impl CaptureSession {
    pub fn new(config: &CaptureConfig) -> CaptureSession {
        CaptureSession {
            client: Endpoint {
                mac: config.client_mac,
                ip: config.client_ip,
                port: config.client_port,
            },
            server: Endpoint {
                mac: config.server_mac,
                ip: config.server_ip,
                port: config.server_port,
            },
            client_seq: config.client_isn,
            server_seq: config.server_isn,
            ip_id: config.first_ip_id,
            ttl: config.ttl,
            window: config.window,
            handshake_done: false,
        }
    }
    /// (source, destination) for a segment travelling in `direction`.
    pub fn endpoints(&self, direction: Direction) -> (Endpoint, Endpoint) {
        match direction {
            Direction::ClientToServer => (self.client, self.server),
            Direction::ServerToClient => (self.server, self.client),
        }
    }
    /// (sequence of the sender, next sequence of the receiver)
    pub fn seq_ack(&self, direction: Direction) -> (u32, u32) {
        match direction {
            Direction::ClientToServer => (self.client_seq, self.server_seq),
            Direction::ServerToClient => (self.server_seq, self.client_seq),
        }
    }
    fn bump_ip_id(&mut self) {
        self.ip_id = self.ip_id.wrapping_add(1);
    }
    fn advance(&mut self, direction: Direction, by: u32) {
        let seq = match direction {
            Direction::ClientToServer => &mut self.client_seq,
            Direction::ServerToClient => &mut self.server_seq,
        };
        *seq = seq.wrapping_add(by);
    }
}

/// Every header field of one synthetic segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub src: Endpoint,
    pub dst: Endpoint,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub ip_id: u16,
    pub ttl: u8,
    pub window: u16,
}

/// Lay out Ethernet + IPv4 + TCP headers followed by `payload`.
///
/// Both checksums are left at zero, the capture is meant for inspecting content
/// and framing, not for on-wire validity.
pub fn build_segment(header: &SegmentHeader, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_SEGMENT_PAYLOAD {
        return Err(WscaptureError::PacketTooLarge { len: payload.len() });
    }
    let total_len = SEGMENT_OVERHEAD + payload.len();
    let mut buffer = vec![0u8; total_len];
    let ip_end = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN;

    // the buffer is sized above, so the views below always fit
    let too_large = || WscaptureError::PacketTooLarge { len: payload.len() };
    {
        let mut eth =
            MutableEthernetPacket::new(&mut buffer[..ETHERNET_HEADER_LEN]).ok_or_else(too_large)?;
        eth.set_destination(header.dst.mac);
        eth.set_source(header.src.mac);
        eth.set_ethertype(EtherTypes::Ipv4);
    }
    {
        let mut ip = MutableIpv4Packet::new(&mut buffer[ETHERNET_HEADER_LEN..ip_end])
            .ok_or_else(too_large)?;
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length((IPV4_HEADER_LEN + TCP_HEADER_LEN + payload.len()) as u16);
        ip.set_identification(header.ip_id);
        ip.set_flags(Ipv4Flags::DontFragment);
        ip.set_ttl(header.ttl);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        ip.set_checksum(0);
        ip.set_source(header.src.ip);
        ip.set_destination(header.dst.ip);
    }
    {
        let mut tcp = MutableTcpPacket::new(&mut buffer[ip_end..ip_end + TCP_HEADER_LEN])
            .ok_or_else(too_large)?;
        tcp.set_source(header.src.port);
        tcp.set_destination(header.dst.port);
        tcp.set_sequence(header.seq);
        tcp.set_acknowledgement(header.ack);
        tcp.set_data_offset(5);
        tcp.set_flags(header.flags);
        tcp.set_window(header.window);
        tcp.set_checksum(0);
        tcp.set_urgent_ptr(0);
    }
    buffer[SEGMENT_OVERHEAD..].copy_from_slice(payload);
    Ok(buffer)
}

/// One assembled link-layer frame and the time it is captured at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkFrame {
    pub ts: Duration,
    pub data: Vec<u8>,
}

/// Build the next segment of `session` in `direction` and advance its counters.
///
/// The sequence number is the sender's counter. The acknowledgment is the peer's
/// counter when ACK is set, zero otherwise. Afterwards the sender's counter moves by
/// the payload length, or by one for a bare SYN or FIN.
pub fn assemble(
    session: &mut CaptureSession,
    ts: Duration,
    direction: Direction,
    flags: u8,
    payload: &[u8],
) -> Result<NetworkFrame> {
    let (src, dst) = session.endpoints(direction);
    let (seq, peer_seq) = session.seq_ack(direction);
    let ack = if flags & TcpFlags::ACK != 0 {
        peer_seq
    } else {
        0
    };
    let header = SegmentHeader {
        src,
        dst,
        seq,
        ack,
        flags,
        ip_id: session.ip_id,
        ttl: session.ttl,
        window: session.window,
    };
    // counters stay put when the segment cannot be built
    let data = build_segment(&header, payload)?;
    session.bump_ip_id();

    let advance_by = if !payload.is_empty() {
        payload.len() as u32
    } else if flags & (TcpFlags::SYN | TcpFlags::FIN) != 0 {
        1
    } else {
        0
    };
    session.advance(direction, advance_by);

    debug!(
        %direction,
        seq,
        ack,
        flags = format_args!("{:#04x}", flags),
        ip_id = header.ip_id,
        len = payload.len(),
        "assembled segment"
    );
    Ok(NetworkFrame { ts, data })
}

/// Carry `payload` in `direction` as consecutive PSH+ACK segments of at most
/// `max_payload` bytes each, all stamped `ts`.
///
/// Each segment advances the sender's counter by its own length, so the receiver
/// can reassemble the stream. The session only changes if every segment is built.
pub fn assemble_stream(
    session: &mut CaptureSession,
    ts: Duration,
    direction: Direction,
    payload: &[u8],
    max_payload: usize,
) -> Result<Vec<NetworkFrame>> {
    let max_payload = max_payload.clamp(1, MAX_SEGMENT_PAYLOAD);
    let mut next = session.clone();
    let mut frames = Vec::with_capacity(payload.len() / max_payload + 1);
    if payload.is_empty() {
        frames.push(assemble(&mut next, ts, direction, FLAGS_PSH_ACK, payload)?);
    }
    for chunk in payload.chunks(max_payload) {
        frames.push(assemble(&mut next, ts, direction, FLAGS_PSH_ACK, chunk)?);
    }
    if frames.len() > 1 {
        debug!(%direction, segments = frames.len(), len = payload.len(), "split payload");
    }
    *session = next;
    Ok(frames)
}

/// Fields of a synthetic segment read back with pnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentView {
    pub src: Endpoint,
    pub dst: Endpoint,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub ip_id: u16,
    pub ip_flags: u8,
    pub ttl: u8,
    pub window: u16,
    pub ip_checksum: u16,
    pub tcp_checksum: u16,
    pub payload: Vec<u8>,
}

impl SegmentView {
    /// `None` unless `frame` is Ethernet carrying IPv4 carrying TCP.
    pub fn parse(frame: &[u8]) -> Option<SegmentView> {
        let eth = EthernetPacket::new(frame)?;
        if eth.get_ethertype() != EtherTypes::Ipv4 {
            return None;
        }
        let ip = Ipv4Packet::new(eth.payload())?;
        if ip.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
            return None;
        }
        let tcp = TcpPacket::new(ip.payload())?;
        Some(SegmentView {
            src: Endpoint {
                mac: eth.get_source(),
                ip: ip.get_source(),
                port: tcp.get_source(),
            },
            dst: Endpoint {
                mac: eth.get_destination(),
                ip: ip.get_destination(),
                port: tcp.get_destination(),
            },
            seq: tcp.get_sequence(),
            ack: tcp.get_acknowledgement(),
            flags: tcp.get_flags(),
            ip_id: ip.get_identification(),
            ip_flags: ip.get_flags(),
            ttl: ip.get_ttl(),
            window: tcp.get_window(),
            ip_checksum: ip.get_checksum(),
            tcp_checksum: tcp.get_checksum(),
            payload: tcp.payload().to_vec(),
        })
    }
}
