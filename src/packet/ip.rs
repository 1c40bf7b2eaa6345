use super::address::IpAddress;
use super::checksum::{internet_checksum, next_packet_id};
use crate::error::PacketError;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Other(u8),
}

impl IpProtocol {
    fn from_number(number: u8, icmp_number: u8) -> Self {
        match number {
            IPPROTO_TCP => Self::Tcp,
            IPPROTO_UDP => Self::Udp,
            n if n == icmp_number => Self::Icmp,
            n => Self::Other(n),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in 32-bit words.
    pub ihl: u8,
    pub dscp: u8,
    pub ecn: u8,
    pub total_length: u16,
    pub identification: u16,
    pub reserved_flag: bool,
    pub may_fragment: bool,
    pub last_fragment: bool,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: [u8; 4],
    pub destination: [u8; 4],
    pub options: Vec<u8>,
}

impl Ipv4Header {
    pub const MIN_LEN: usize = 20;

    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < Self::MIN_LEN {
            return Err(PacketError::truncated("IPv4 header", Self::MIN_LEN, buf.len()));
        }
        let version = buf[0] >> 4;
        if version != 4 {
            return Err(PacketError::InvalidVersion {
                what: "IPv4",
                expected: 4,
                actual: version,
            });
        }
        let ihl = buf[0] & 0x0f;
        if ihl < 5 {
            return Err(PacketError::Malformed("IPv4 header length below 5 words"));
        }
        let header_len = usize::from(ihl) * 4;
        if buf.len() < header_len {
            return Err(PacketError::truncated("IPv4 options", header_len, buf.len()));
        }
        let total_length = u16::from_be_bytes([buf[2], buf[3]]);
        if usize::from(total_length) < header_len {
            return Err(PacketError::Malformed("IPv4 total length shorter than header"));
        }
        let flags_fragment = u16::from_be_bytes([buf[6], buf[7]]);

        let mut source = [0u8; 4];
        source.copy_from_slice(&buf[12..16]);
        let mut destination = [0u8; 4];
        destination.copy_from_slice(&buf[16..20]);

        Ok(Self {
            ihl,
            dscp: buf[1] >> 2,
            ecn: buf[1] & 0x03,
            total_length,
            identification: u16::from_be_bytes([buf[4], buf[5]]),
            reserved_flag: flags_fragment & 0x8000 != 0,
            may_fragment: flags_fragment & 0x4000 != 0,
            last_fragment: flags_fragment & 0x2000 != 0,
            fragment_offset: flags_fragment & 0x1fff,
            ttl: buf[8],
            protocol: buf[9],
            checksum: u16::from_be_bytes([buf[10], buf[11]]),
            source,
            destination,
            options: buf[Self::MIN_LEN..header_len].to_vec(),
        })
    }

    pub fn header_len(&self) -> usize {
        usize::from(self.ihl) * 4
    }

    pub fn payload_len(&self) -> usize {
        usize::from(self.total_length).saturating_sub(self.header_len())
    }

    fn flags_fragment(&self) -> u16 {
        let mut word = self.fragment_offset & 0x1fff;
        if self.reserved_flag {
            word |= 0x8000;
        }
        if self.may_fragment {
            word |= 0x4000;
        }
        if self.last_fragment {
            word |= 0x2000;
        }
        word
    }

    /// Appends the header, checksum field as stored.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.push((4 << 4) | (self.ihl & 0x0f));
        out.push((self.dscp << 2) | (self.ecn & 0x03));
        out.extend_from_slice(&self.total_length.to_be_bytes());
        out.extend_from_slice(&self.identification.to_be_bytes());
        out.extend_from_slice(&self.flags_fragment().to_be_bytes());
        out.push(self.ttl);
        out.push(self.protocol);
        out.extend_from_slice(&self.checksum.to_be_bytes());
        out.extend_from_slice(&self.source);
        out.extend_from_slice(&self.destination);
        out.extend_from_slice(&self.options);
    }

    pub fn compute_checksum(&self) -> u16 {
        let mut bytes = Vec::with_capacity(self.header_len());
        let zeroed = Self {
            checksum: 0,
            ..self.clone()
        };
        zeroed.write(&mut bytes);
        internet_checksum(&bytes)
    }

    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv6Header {
    pub traffic_class: u8,
    /// Low 20 bits.
    pub flow_label: u32,
    pub payload_length: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub source: [u8; 16],
    pub destination: [u8; 16],
}

impl Ipv6Header {
    pub const LEN: usize = 40;

    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < Self::LEN {
            return Err(PacketError::truncated("IPv6 header", Self::LEN, buf.len()));
        }
        let version = buf[0] >> 4;
        if version != 6 {
            return Err(PacketError::InvalidVersion {
                what: "IPv6",
                expected: 6,
                actual: version,
            });
        }
        let mut source = [0u8; 16];
        source.copy_from_slice(&buf[8..24]);
        let mut destination = [0u8; 16];
        destination.copy_from_slice(&buf[24..40]);

        Ok(Self {
            traffic_class: ((buf[0] & 0x0f) << 4) | (buf[1] >> 4),
            flow_label: (u32::from(buf[1] & 0x0f) << 16)
                | (u32::from(buf[2]) << 8)
                | u32::from(buf[3]),
            payload_length: u16::from_be_bytes([buf[4], buf[5]]),
            next_header: buf[6],
            hop_limit: buf[7],
            source,
            destination,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.push((6 << 4) | (self.traffic_class >> 4));
        out.push(((self.traffic_class & 0x0f) << 4) | ((self.flow_label >> 16) as u8 & 0x0f));
        out.push((self.flow_label >> 8) as u8);
        out.push(self.flow_label as u8);
        out.extend_from_slice(&self.payload_length.to_be_bytes());
        out.push(self.next_header);
        out.push(self.hop_limit);
        out.extend_from_slice(&self.source);
        out.extend_from_slice(&self.destination);
    }
}

/// An IPv4 or IPv6 header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IpHeader {
    V4(Ipv4Header),
    V6(Ipv6Header),
}

impl IpHeader {
    /// Parses the header at the front of `buf`, routed by the version nibble.
    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        let first = *buf
            .first()
            .ok_or_else(|| PacketError::truncated("IP header", 1, 0))?;
        match first >> 4 {
            4 => Ipv4Header::parse(buf).map(Self::V4),
            6 => Ipv6Header::parse(buf).map(Self::V6),
            other => Err(PacketError::UnknownIpVersion(other)),
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            Self::V4(_) => 4,
            Self::V6(_) => 6,
        }
    }

    pub fn protocol(&self) -> IpProtocol {
        match self {
            Self::V4(h) => IpProtocol::from_number(h.protocol, IPPROTO_ICMP),
            Self::V6(h) => IpProtocol::from_number(h.next_header, IPPROTO_ICMPV6),
        }
    }

    pub fn source(&self) -> IpAddress {
        match self {
            Self::V4(h) => IpAddress::V4(h.source),
            Self::V6(h) => IpAddress::V6(h.source),
        }
    }

    pub fn destination(&self) -> IpAddress {
        match self {
            Self::V4(h) => IpAddress::V4(h.destination),
            Self::V6(h) => IpAddress::V6(h.destination),
        }
    }

    pub fn header_len(&self) -> usize {
        match self {
            Self::V4(h) => h.header_len(),
            Self::V6(_) => Ipv6Header::LEN,
        }
    }

    pub fn payload_len(&self) -> usize {
        match self {
            Self::V4(h) => h.payload_len(),
            Self::V6(h) => usize::from(h.payload_length),
        }
    }

    pub fn total_len(&self) -> usize {
        self.header_len() + self.payload_len()
    }

    /// Sets the payload length. IPv4 headers also take a fresh identification, since this is
    /// only done when building a new packet.
    ///
    /// Lengths beyond the 16-bit field saturate at `u16::MAX`; callers keep payloads within
    /// [`MAX_MSS`](super::tcp::MAX_MSS).
    pub fn set_payload_len(&mut self, len: usize) {
        match self {
            Self::V4(h) => {
                h.total_length = u16::try_from(h.header_len() + len).unwrap_or(u16::MAX);
                h.identification = next_packet_id();
            }
            Self::V6(h) => h.payload_length = u16::try_from(len).unwrap_or(u16::MAX),
        }
    }

    pub fn swap_addresses(&mut self) {
        match self {
            Self::V4(h) => std::mem::swap(&mut h.source, &mut h.destination),
            Self::V6(h) => std::mem::swap(&mut h.source, &mut h.destination),
        }
    }

    /// Copy of this header addressed back to the sender, without IPv4 options.
    pub fn reply_template(&self) -> Self {
        let mut reply = self.clone();
        if let Self::V4(h) = &mut reply {
            h.ihl = 5;
            h.options.clear();
        }
        reply.swap_addresses();
        reply
    }

    /// Appends the header exactly as stored.
    pub fn write(&self, out: &mut Vec<u8>) {
        match self {
            Self::V4(h) => h.write(out),
            Self::V6(h) => h.write(out),
        }
    }

    /// Recomputes the IPv4 checksum (IPv6 has none) and appends the header.
    pub fn write_for_send(&mut self, out: &mut Vec<u8>) {
        if let Self::V4(h) = self {
            h.update_checksum();
        }
        self.write(out);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len());
        self.write(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IPV4_WITH_OPTIONS: [u8; 28] = [
        0x46, 0xb8, 0x00, 0x1c, 0xab, 0xcd, 0x5f, 0xff, 0x40, 0x11, 0x12, 0x34, 10, 0, 0, 2, 8,
        8, 8, 8, 0x94, 0x04, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef,
    ];

    #[test]
    fn ipv4_fields_and_round_trip() {
        let hdr = Ipv4Header::parse(&IPV4_WITH_OPTIONS).unwrap();
        assert_eq!(hdr.header_len(), 24);
        assert_eq!(hdr.dscp, 0x2e);
        assert_eq!(hdr.ecn, 0);
        assert!(hdr.may_fragment);
        assert!(!hdr.last_fragment);
        assert_eq!(hdr.fragment_offset, 0x1fff);
        assert_eq!(hdr.protocol, IPPROTO_UDP);
        assert_eq!(hdr.payload_len(), 4);
        assert_eq!(hdr.options, vec![0x94, 0x04, 0x00, 0x00]);

        let mut out = Vec::new();
        hdr.write(&mut out);
        assert_eq!(out, IPV4_WITH_OPTIONS[..24]);
    }

    #[test]
    fn ipv4_rejects_bad_input() {
        assert!(matches!(
            Ipv4Header::parse(&IPV4_WITH_OPTIONS[..19]),
            Err(PacketError::Truncated { .. })
        ));

        let mut v6 = IPV4_WITH_OPTIONS;
        v6[0] = 0x65;
        assert!(matches!(
            Ipv4Header::parse(&v6),
            Err(PacketError::InvalidVersion { actual: 6, .. })
        ));

        let mut long_ihl = IPV4_WITH_OPTIONS;
        long_ihl[0] = 0x4f;
        assert!(matches!(
            Ipv4Header::parse(&long_ihl),
            Err(PacketError::Truncated { need: 60, .. })
        ));
    }

    #[test]
    fn ipv6_packs_traffic_class_and_flow_label() {
        let mut buf = [0u8; 40];
        buf[0] = 0x6a;
        buf[1] = 0xbc;
        buf[2] = 0xde;
        buf[3] = 0xf0;
        buf[4..6].copy_from_slice(&20u16.to_be_bytes());
        buf[6] = IPPROTO_TCP;
        buf[7] = 64;
        buf[8] = 0xfd;
        buf[24] = 0xfd;
        buf[39] = 1;

        let hdr = Ipv6Header::parse(&buf).unwrap();
        assert_eq!(hdr.traffic_class, 0xab);
        assert_eq!(hdr.flow_label, 0xc_def0);
        assert_eq!(hdr.payload_length, 20);

        let mut out = Vec::new();
        hdr.write(&mut out);
        assert_eq!(out, buf);
    }

    #[test]
    fn dispatch_by_version_nibble() {
        let hdr = IpHeader::parse(&IPV4_WITH_OPTIONS).unwrap();
        assert_eq!(hdr.version(), 4);
        assert_eq!(hdr.protocol(), IpProtocol::Udp);
        assert_eq!(hdr.total_len(), hdr.header_len() + hdr.payload_len());

        assert_eq!(
            IpHeader::parse(&[0x50; 40]),
            Err(PacketError::UnknownIpVersion(5))
        );
        assert!(IpHeader::parse(&[]).is_err());
    }

    #[test]
    fn reply_template_flips_and_drops_options() {
        let hdr = IpHeader::parse(&IPV4_WITH_OPTIONS).unwrap();
        let mut reply = hdr.reply_template();
        assert_eq!(reply.source(), hdr.destination());
        assert_eq!(reply.destination(), hdr.source());
        assert_eq!(reply.header_len(), 20);

        reply.set_payload_len(8);
        assert_eq!(reply.total_len(), 28);
        let mut out = Vec::new();
        reply.write_for_send(&mut out);
        assert_eq!(internet_checksum(&out), 0);
    }

    #[test]
    fn oversized_payload_length_saturates() {
        let mut reply = IpHeader::parse(&IPV4_WITH_OPTIONS).unwrap().reply_template();
        reply.set_payload_len(70_000);
        let IpHeader::V4(v4) = &reply else {
            panic!("expected IPv4");
        };
        assert_eq!(v4.total_length, u16::MAX);
    }
}
