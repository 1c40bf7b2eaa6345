use super::checksum::transport_checksum;
use super::ip::{IpHeader, IPPROTO_UDP};
use super::{Packet, TransportHeader};
use crate::error::PacketError;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UdpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub const LEN: usize = 8;

    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < Self::LEN {
            return Err(PacketError::truncated("UDP header", Self::LEN, buf.len()));
        }
        Ok(Self {
            source_port: u16::from_be_bytes([buf[0], buf[1]]),
            destination_port: u16::from_be_bytes([buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
            checksum: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.source_port.to_be_bytes());
        out.extend_from_slice(&self.destination_port.to_be_bytes());
        out.extend_from_slice(&self.length.to_be_bytes());
        out.extend_from_slice(&self.checksum.to_be_bytes());
    }
}

/// Datagram from the real socket back to the peer that sent `ip`/`udp`.
pub fn response(ip: &IpHeader, udp: &UdpHeader, payload: &[u8]) -> Packet {
    let mut ip = ip.reply_template();
    let udp_len = UdpHeader::LEN + payload.len();
    ip.set_payload_len(udp_len);

    let mut header = UdpHeader {
        source_port: udp.destination_port,
        destination_port: udp.source_port,
        length: udp_len as u16,
        checksum: 0,
    };
    let mut segment = Vec::with_capacity(udp_len);
    header.write(&mut segment);
    segment.extend_from_slice(payload);
    header.checksum = match transport_checksum(&ip.source(), &ip.destination(), IPPROTO_UDP, &segment)
    {
        // Zero means "no checksum" for UDP; a computed zero goes out as all ones.
        Some(0) => 0xffff,
        Some(csum) => csum,
        None => 0,
    };
    segment[6..8].copy_from_slice(&header.checksum.to_be_bytes());

    let mut buffer = Vec::with_capacity(ip.header_len() + udp_len);
    ip.write_for_send(&mut buffer);
    buffer.extend_from_slice(&segment);

    Packet {
        ip,
        transport: TransportHeader::Udp(header),
        buffer,
    }
}
