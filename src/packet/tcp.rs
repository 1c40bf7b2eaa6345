use super::checksum::transport_checksum;
use super::ip::{IpHeader, IPPROTO_TCP};
use super::{Packet, TransportHeader};
use crate::error::PacketError;

/// Window we advertise on every segment we build.
pub const DEFAULT_WINDOW: u16 = 0xffff;

/// MSS assumed when the peer does not advertise one (RFC 1122).
pub const DEFAULT_MSS: u16 = 536;

/// Largest segment payload whose reply still fits the 16-bit IP length fields, with a maximal
/// IP header and a maximal TCP header.
pub const MAX_MSS: u16 = u16::MAX - 60 - 60;

/// IPv6 header, TCP header and the timestamp option we may add to a reply.
const REPLY_OVERHEAD: usize = 40 + 20 + 12;

/// Segment size that keeps our replies within a tunnel of the given MTU.
pub fn mss_for_mtu(mtu: usize) -> u16 {
    let room = mtu.saturating_sub(REPLY_OVERHEAD);
    u16::try_from(room).unwrap_or(MAX_MSS).clamp(1, MAX_MSS)
}

const OPT_EOL: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_WINDOW_SCALE: u8 = 3;
const OPT_SACK_PERMITTED: u8 = 4;
const OPT_SACK: u8 = 5;
const OPT_TIMESTAMP: u8 = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);
    pub const ECE: TcpFlags = TcpFlags(0x40);
    pub const CWR: TcpFlags = TcpFlags(0x80);

    pub fn contains(self, other: TcpFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> Self::Output {
        TcpFlags(self.0 | rhs.0)
    }
}

/// TCP timestamp option (RFC 7323) values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timestamps {
    pub value: u32,
    pub echo_reply: u32,
}

/// Options recognized by [`TcpHeader::parse_options`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    pub timestamps: Option<Timestamps>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub acknowledgment_number: u32,
    /// Header length in 32-bit words.
    pub data_offset: u8,
    /// Reserved bits and NS, the low nibble of byte 12.
    pub reserved: u8,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
    pub options: Vec<u8>,
}

impl TcpHeader {
    pub const MIN_LEN: usize = 20;

    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < Self::MIN_LEN {
            return Err(PacketError::truncated("TCP header", Self::MIN_LEN, buf.len()));
        }
        let data_offset = buf[12] >> 4;
        if data_offset < 5 {
            return Err(PacketError::Malformed("TCP data offset below 5 words"));
        }
        let header_len = usize::from(data_offset) * 4;
        if buf.len() < header_len {
            return Err(PacketError::truncated("TCP options", header_len, buf.len()));
        }

        Ok(Self {
            source_port: u16::from_be_bytes([buf[0], buf[1]]),
            destination_port: u16::from_be_bytes([buf[2], buf[3]]),
            sequence_number: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            acknowledgment_number: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            data_offset,
            reserved: buf[12] & 0x0f,
            flags: TcpFlags(buf[13]),
            window_size: u16::from_be_bytes([buf[14], buf[15]]),
            checksum: u16::from_be_bytes([buf[16], buf[17]]),
            urgent_pointer: u16::from_be_bytes([buf[18], buf[19]]),
            options: buf[Self::MIN_LEN..header_len].to_vec(),
        })
    }

    pub fn header_len(&self) -> usize {
        usize::from(self.data_offset) * 4
    }

    pub fn is_syn(&self) -> bool {
        self.flags.contains(TcpFlags::SYN)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(TcpFlags::ACK)
    }

    pub fn is_fin(&self) -> bool {
        self.flags.contains(TcpFlags::FIN)
    }

    pub fn is_rst(&self) -> bool {
        self.flags.contains(TcpFlags::RST)
    }

    pub fn is_psh(&self) -> bool {
        self.flags.contains(TcpFlags::PSH)
    }

    /// Walks the option list. Fails on a truncated or inconsistent option.
    pub fn parse_options(&self) -> Result<TcpOptions, PacketError> {
        let mut parsed = TcpOptions::default();
        let opts = &self.options;
        let mut i = 0;
        while i < opts.len() {
            match opts[i] {
                OPT_EOL => break,
                OPT_NOP => {
                    i += 1;
                    continue;
                }
                _ => {}
            }
            let kind = opts[i];
            let len = *opts
                .get(i + 1)
                .ok_or(PacketError::Malformed("TCP option without length"))?
                as usize;
            if len < 2 || i + len > opts.len() {
                return Err(PacketError::Malformed("TCP option length out of range"));
            }
            let body = &opts[i + 2..i + len];
            match (kind, body.len()) {
                (OPT_MSS, 2) => parsed.mss = Some(u16::from_be_bytes([body[0], body[1]])),
                (OPT_WINDOW_SCALE, 1) => parsed.window_scale = Some(body[0]),
                (OPT_SACK_PERMITTED, 0) => parsed.sack_permitted = true,
                (OPT_SACK, n) if n % 8 == 0 => {}
                (OPT_TIMESTAMP, 8) => {
                    parsed.timestamps = Some(Timestamps {
                        value: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                        echo_reply: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
                    })
                }
                (OPT_MSS | OPT_WINDOW_SCALE | OPT_SACK_PERMITTED | OPT_SACK | OPT_TIMESTAMP, _) => {
                    return Err(PacketError::Malformed("TCP option has the wrong length"))
                }
                _ => {}
            }
            i += len;
        }
        Ok(parsed)
    }

    pub fn mss(&self) -> Option<u16> {
        self.parse_options().ok().and_then(|o| o.mss)
    }

    pub fn timestamps(&self) -> Option<Timestamps> {
        self.parse_options().ok().and_then(|o| o.timestamps)
    }

    /// Header for a segment going back to the sender of `self`.
    pub fn reply(&self, sequence_number: u32, acknowledgment_number: u32, flags: TcpFlags) -> Self {
        Self {
            source_port: self.destination_port,
            destination_port: self.source_port,
            sequence_number,
            acknowledgment_number,
            data_offset: 5,
            reserved: 0,
            flags,
            window_size: DEFAULT_WINDOW,
            checksum: 0,
            urgent_pointer: 0,
            options: Vec::new(),
        }
    }

    pub fn with_mss(mut self, mss: u16) -> Self {
        self.options.push(OPT_MSS);
        self.options.push(4);
        self.options.extend_from_slice(&mss.to_be_bytes());
        self.data_offset = (5 + self.options.len() / 4) as u8;
        self
    }

    pub fn with_timestamps(mut self, ts: Timestamps) -> Self {
        self.options.extend_from_slice(&[OPT_NOP, OPT_NOP, OPT_TIMESTAMP, 10]);
        self.options.extend_from_slice(&ts.value.to_be_bytes());
        self.options.extend_from_slice(&ts.echo_reply.to_be_bytes());
        self.data_offset = (5 + self.options.len() / 4) as u8;
        self
    }

    /// Appends the header, checksum field as stored.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.source_port.to_be_bytes());
        out.extend_from_slice(&self.destination_port.to_be_bytes());
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        out.extend_from_slice(&self.acknowledgment_number.to_be_bytes());
        out.push((self.data_offset << 4) | (self.reserved & 0x0f));
        out.push(self.flags.0);
        out.extend_from_slice(&self.window_size.to_be_bytes());
        out.extend_from_slice(&self.checksum.to_be_bytes());
        out.extend_from_slice(&self.urgent_pointer.to_be_bytes());
        out.extend_from_slice(&self.options);
    }
}

/// True when the segment checksum does not verify or the options cannot be walked.
pub fn is_corrupted(ip: &IpHeader, tcp: &TcpHeader, segment: &[u8]) -> bool {
    let checksum_ok =
        transport_checksum(&ip.source(), &ip.destination(), IPPROTO_TCP, segment) == Some(0);
    !checksum_ok || tcp.parse_options().is_err()
}

/// Serializes `ip` + `tcp` + `payload` with fresh lengths and checksums.
///
/// `ip` must already be addressed to the receiver of the packet.
pub fn build_packet(ip: &IpHeader, tcp: &TcpHeader, payload: &[u8]) -> Packet {
    let mut ip = ip.clone();
    let mut tcp = tcp.clone();
    let segment_len = tcp.header_len() + payload.len();
    ip.set_payload_len(segment_len);

    let mut segment = Vec::with_capacity(segment_len);
    tcp.checksum = 0;
    tcp.write(&mut segment);
    segment.extend_from_slice(payload);
    tcp.checksum = transport_checksum(&ip.source(), &ip.destination(), IPPROTO_TCP, &segment)
        .unwrap_or_default();
    segment[16..18].copy_from_slice(&tcp.checksum.to_be_bytes());

    let mut buffer = Vec::with_capacity(ip.header_len() + segment_len);
    ip.write_for_send(&mut buffer);
    buffer.extend_from_slice(&segment);

    Packet {
        ip,
        transport: TransportHeader::Tcp(tcp),
        buffer,
    }
}

fn echo_timestamps(inbound: &TcpHeader, value: u32) -> Option<Timestamps> {
    inbound.timestamps().map(|ts| Timestamps {
        value,
        echo_reply: ts.value,
    })
}

/// SYN-ACK answering the SYN described by `ip`/`tcp`, starting our side at `isn`.
///
/// The peer's MSS is echoed back; the timestamp option is only included if the peer sent one.
pub fn syn_ack(ip: &IpHeader, tcp: &TcpHeader, isn: u32, now: u32) -> Packet {
    let mut reply = tcp
        .reply(
            isn,
            tcp.sequence_number.wrapping_add(1),
            TcpFlags::SYN | TcpFlags::ACK,
        )
        .with_mss(tcp.mss().unwrap_or(DEFAULT_MSS));
    if let Some(ts) = echo_timestamps(tcp, now) {
        reply = reply.with_timestamps(ts);
    }
    build_packet(&ip.reply_template(), &reply, &[])
}

/// Plain ACK carrying `ack`, sequenced at the peer's acknowledgment number.
pub fn response_ack(ip: &IpHeader, tcp: &TcpHeader, ack: u32, timestamps: Option<Timestamps>) -> Vec<u8> {
    let mut reply = tcp.reply(tcp.acknowledgment_number, ack, TcpFlags::ACK);
    if let Some(ts) = timestamps {
        reply = reply.with_timestamps(ts);
    }
    build_packet(&ip.reply_template(), &reply, &[]).buffer
}

pub fn fin_ack(ip: &IpHeader, tcp: &TcpHeader, seq: u32, ack: u32) -> Vec<u8> {
    let reply = tcp.reply(seq, ack, TcpFlags::FIN | TcpFlags::ACK);
    build_packet(&ip.reply_template(), &reply, &[]).buffer
}

/// RST for a segment we have no connection for (RFC 793 "reset generation").
pub fn rst(ip: &IpHeader, tcp: &TcpHeader, data_len: usize) -> Vec<u8> {
    let reply = if tcp.is_ack() {
        tcp.reply(tcp.acknowledgment_number, 0, TcpFlags::RST)
    } else {
        let mut consumed = data_len as u32;
        if tcp.is_syn() {
            consumed = consumed.wrapping_add(1);
        }
        if tcp.is_fin() {
            consumed = consumed.wrapping_add(1);
        }
        tcp.reply(
            0,
            tcp.sequence_number.wrapping_add(consumed),
            TcpFlags::RST | TcpFlags::ACK,
        )
    };
    build_packet(&ip.reply_template(), &reply, &[]).buffer
}

/// PSH-ACK carrying `payload` from the real socket back to the peer.
pub fn data(
    ip: &IpHeader,
    tcp: &TcpHeader,
    seq: u32,
    ack: u32,
    payload: &[u8],
    timestamps: Option<Timestamps>,
) -> Vec<u8> {
    let mut reply = tcp.reply(seq, ack, TcpFlags::PSH | TcpFlags::ACK);
    if let Some(ts) = timestamps {
        reply = reply.with_timestamps(ts);
    }
    build_packet(&ip.reply_template(), &reply, payload).buffer
}
