use super::checksum::{internet_checksum, transport_checksum};
use super::ip::{IpHeader, IPPROTO_ICMPV6};
use crate::error::PacketError;

pub const ICMPV4_ECHO_REPLY: u8 = 0;
pub const ICMPV4_DESTINATION_UNREACHABLE: u8 = 3;
pub const ICMPV4_ECHO_REQUEST: u8 = 8;
pub const ICMPV6_DESTINATION_UNREACHABLE: u8 = 1;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;
pub const ICMPV6_ROUTER_SOLICITATION: u8 = 133;

/// What the relay makes of an ICMP message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IcmpKind {
    EchoRequest,
    EchoReply,
    DestinationUnreachable,
    RouterSolicitation,
    Unsupported(u8),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IcmpPacket {
    pub ip_version: u8,
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence_number: u16,
    pub data: Vec<u8>,
}

impl IcmpPacket {
    pub const HEADER_LEN: usize = 8;

    pub fn parse(ip_version: u8, buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < Self::HEADER_LEN {
            return Err(PacketError::truncated("ICMP header", Self::HEADER_LEN, buf.len()));
        }
        Ok(Self {
            ip_version,
            icmp_type: buf[0],
            code: buf[1],
            checksum: u16::from_be_bytes([buf[2], buf[3]]),
            identifier: u16::from_be_bytes([buf[4], buf[5]]),
            sequence_number: u16::from_be_bytes([buf[6], buf[7]]),
            data: buf[Self::HEADER_LEN..].to_vec(),
        })
    }

    /// Builds an echo request as the probe sends it.
    pub fn echo_request(ip_version: u8, identifier: u16, sequence_number: u16, data: Vec<u8>) -> Self {
        Self {
            ip_version,
            icmp_type: if ip_version == 4 {
                ICMPV4_ECHO_REQUEST
            } else {
                ICMPV6_ECHO_REQUEST
            },
            code: 0,
            checksum: 0,
            identifier,
            sequence_number,
            data,
        }
    }

    pub fn kind(&self) -> IcmpKind {
        match (self.ip_version, self.icmp_type) {
            (4, ICMPV4_ECHO_REQUEST) | (6, ICMPV6_ECHO_REQUEST) => IcmpKind::EchoRequest,
            (4, ICMPV4_ECHO_REPLY) | (6, ICMPV6_ECHO_REPLY) => IcmpKind::EchoReply,
            (4, ICMPV4_DESTINATION_UNREACHABLE) | (6, ICMPV6_DESTINATION_UNREACHABLE) => {
                IcmpKind::DestinationUnreachable
            }
            (6, ICMPV6_ROUTER_SOLICITATION) => IcmpKind::RouterSolicitation,
            (_, other) => IcmpKind::Unsupported(other),
        }
    }

    /// Echo reply mirroring a request's identifier, sequence number and payload.
    pub fn echo_reply(&self) -> Self {
        Self {
            ip_version: self.ip_version,
            icmp_type: if self.ip_version == 4 {
                ICMPV4_ECHO_REPLY
            } else {
                ICMPV6_ECHO_REPLY
            },
            code: 0,
            checksum: 0,
            identifier: self.identifier,
            sequence_number: self.sequence_number,
            data: self.data.clone(),
        }
    }

    /// Appends the message, checksum field as stored.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(self.icmp_type);
        out.push(self.code);
        out.extend_from_slice(&self.checksum.to_be_bytes());
        out.extend_from_slice(&self.identifier.to_be_bytes());
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        out.extend_from_slice(&self.data);
    }

    /// Serialized message with its checksum computed. ICMPv6 checksums cover the IPv6
    /// pseudo-header, so the enclosing `ip` header is needed.
    pub fn to_bytes(&self, ip: &IpHeader) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_LEN + self.data.len());
        let zeroed = Self {
            checksum: 0,
            ..self.clone()
        };
        zeroed.write(&mut out);
        let csum = match ip {
            IpHeader::V4(_) => internet_checksum(&out),
            IpHeader::V6(_) => {
                transport_checksum(&ip.source(), &ip.destination(), IPPROTO_ICMPV6, &out)
                    .unwrap_or_default()
            }
        };
        out[2..4].copy_from_slice(&csum.to_be_bytes());
        out
    }
}

/// Full IP packet for an echo message. `ip` must already be addressed to the receiver.
pub fn packet_to_buffer(ip: &IpHeader, packet: &IcmpPacket) -> Result<Vec<u8>, PacketError> {
    if !matches!(packet.kind(), IcmpKind::EchoRequest | IcmpKind::EchoReply) {
        return Err(PacketError::NotAnEcho {
            icmp_type: packet.icmp_type,
        });
    }
    let mut ip = ip.clone();
    if let IpHeader::V4(h) = &mut ip {
        h.ihl = 5;
        h.options.clear();
    }
    ip.set_payload_len(IcmpPacket::HEADER_LEN + packet.data.len());
    let message = packet.to_bytes(&ip);

    let mut buffer = Vec::with_capacity(ip.header_len() + message.len());
    ip.write_for_send(&mut buffer);
    buffer.extend_from_slice(&message);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ip::{Ipv4Header, IPPROTO_ICMP};

    fn ping() -> IcmpPacket {
        IcmpPacket::parse(
            4,
            &[8, 0, 0xf7, 0xfd, 0x00, 0x01, 0x00, 0x01, b'a', b'b'],
        )
        .unwrap()
    }

    #[test]
    fn classifies_by_version() {
        assert_eq!(ping().kind(), IcmpKind::EchoRequest);
        let v6_unreachable = IcmpPacket::parse(6, &[1, 4, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(v6_unreachable.kind(), IcmpKind::DestinationUnreachable);
        let v4_133 = IcmpPacket::parse(4, &[133, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(v4_133.kind(), IcmpKind::Unsupported(133));
        assert!(IcmpPacket::parse(4, &[8, 0, 0, 0]).is_err());
    }

    #[test]
    fn echo_reply_mirrors_request() {
        let request = ping();
        let reply = request.echo_reply();
        assert_eq!(reply.icmp_type, ICMPV4_ECHO_REPLY);
        assert_eq!(reply.identifier, request.identifier);
        assert_eq!(reply.sequence_number, request.sequence_number);
        assert_eq!(reply.data, b"ab");

        let ip = IpHeader::V4(Ipv4Header {
            ihl: 5,
            dscp: 0,
            ecn: 0,
            total_length: 30,
            identification: 0,
            reserved_flag: false,
            may_fragment: false,
            last_fragment: false,
            fragment_offset: 0,
            ttl: 64,
            protocol: IPPROTO_ICMP,
            checksum: 0,
            source: [1, 1, 1, 1],
            destination: [10, 0, 0, 2],
            options: Vec::new(),
        });
        let buffer = packet_to_buffer(&ip, &reply).unwrap();
        assert_eq!(buffer.len(), 20 + 10);
        assert_eq!(internet_checksum(&buffer[20..]), 0);
    }

    #[test]
    fn only_echo_messages_serialize_as_packets() {
        let ip = IpHeader::parse(&{
            let mut b = [0u8; 40];
            b[0] = 0x60;
            b[6] = IPPROTO_ICMPV6;
            b
        })
        .unwrap();
        let rs = IcmpPacket::parse(6, &[133, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(
            packet_to_buffer(&ip, &rs),
            Err(PacketError::NotAnEcho { icmp_type: 133 })
        );
    }
}
