//! Wire codecs for the packets crossing the tunnel.
//!
//! Every header type parses from a byte slice and writes itself back byte-for-byte. Builders
//! (`tcp::syn_ack`, `udp::response`, `icmp::packet_to_buffer`, ...) take the header of the
//! packet being answered, address the reply back to its sender and recompute lengths and
//! checksums.

pub mod address;
pub mod checksum;
pub mod icmp;
pub mod ip;
pub mod tcp;
pub mod udp;

pub use address::IpAddress;
pub use icmp::{IcmpKind, IcmpPacket};
pub use ip::{IpHeader, IpProtocol, Ipv4Header, Ipv6Header};
pub use tcp::{TcpFlags, TcpHeader, TcpOptions, Timestamps};
pub use udp::UdpHeader;

use crate::error::PacketError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportHeader {
    Tcp(TcpHeader),
    Udp(UdpHeader),
}

impl TransportHeader {
    pub fn header_len(&self) -> usize {
        match self {
            Self::Tcp(h) => h.header_len(),
            Self::Udp(_) => UdpHeader::LEN,
        }
    }

    pub fn source_port(&self) -> u16 {
        match self {
            Self::Tcp(h) => h.source_port,
            Self::Udp(h) => h.source_port,
        }
    }

    pub fn destination_port(&self) -> u16 {
        match self {
            Self::Tcp(h) => h.destination_port,
            Self::Udp(h) => h.destination_port,
        }
    }
}

/// A complete TCP or UDP packet: parsed headers plus the exact wire bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub ip: IpHeader,
    pub transport: TransportHeader,
    pub buffer: Vec<u8>,
}

impl Packet {
    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        let ip = IpHeader::parse(buf)?;
        let transport_bytes = &buf[ip.header_len()..];
        let transport = match ip.protocol() {
            IpProtocol::Tcp => TransportHeader::Tcp(TcpHeader::parse(transport_bytes)?),
            IpProtocol::Udp => TransportHeader::Udp(UdpHeader::parse(transport_bytes)?),
            _ => return Err(PacketError::Malformed("not a TCP or UDP packet")),
        };
        Ok(Self {
            ip,
            transport,
            buffer: buf.to_vec(),
        })
    }

    /// Transport payload, bounded by the IP total length.
    pub fn payload(&self) -> &[u8] {
        let start = self.ip.header_len() + self.transport.header_len();
        let end = self.ip.total_len().min(self.buffer.len());
        self.buffer.get(start..end).unwrap_or_default()
    }
}
