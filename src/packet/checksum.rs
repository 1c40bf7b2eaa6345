//! Internet checksum (RFC 1071) and transport pseudo-headers.

use std::sync::atomic::{AtomicU16, Ordering};

use super::address::IpAddress;

static PACKET_ID: AtomicU16 = AtomicU16::new(1);

/// Next IPv4 identification value. Shared by every packet the process builds.
pub fn next_packet_id() -> u16 {
    PACKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// Adds `data` as big-endian 16-bit words to `sum` without folding.
///
/// An odd trailing byte is padded with a zero byte.
pub fn ones_complement_add(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

/// Folds carries and complements.
pub fn finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn internet_checksum(data: &[u8]) -> u16 {
    finish(ones_complement_add(0, data))
}

/// IPv4 pseudo-header: src(4) | dst(4) | zero(1) | protocol(1) | length(2).
pub fn ipv4_pseudo_header(src: [u8; 4], dst: [u8; 4], protocol: u8, length: u16) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0..4].copy_from_slice(&src);
    out[4..8].copy_from_slice(&dst);
    out[9] = protocol;
    out[10..12].copy_from_slice(&length.to_be_bytes());
    out
}

/// IPv6 pseudo-header: src(16) | dst(16) | length(4) | zero(3) | next header(1).
pub fn ipv6_pseudo_header(src: [u8; 16], dst: [u8; 16], next_header: u8, length: u32) -> [u8; 40] {
    let mut out = [0u8; 40];
    out[0..16].copy_from_slice(&src);
    out[16..32].copy_from_slice(&dst);
    out[32..36].copy_from_slice(&length.to_be_bytes());
    out[39] = next_header;
    out
}

/// Checksum over the pseudo-header matching the address family plus `segment`.
///
/// Returns 0 when `segment` already carries a correct checksum. Mixed address families yield
/// `None`.
pub fn transport_checksum(
    src: &IpAddress,
    dst: &IpAddress,
    protocol: u8,
    segment: &[u8],
) -> Option<u16> {
    let sum = match (src, dst) {
        (IpAddress::V4(s), IpAddress::V4(d)) => {
            let pseudo = ipv4_pseudo_header(*s, *d, protocol, segment.len() as u16);
            ones_complement_add(0, &pseudo)
        }
        (IpAddress::V6(s), IpAddress::V6(d)) => {
            let pseudo = ipv6_pseudo_header(*s, *d, protocol, segment.len() as u32);
            ones_complement_add(0, &pseudo)
        }
        _ => return None,
    };
    Some(finish(ones_complement_add(sum, segment)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1071_example() {
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(internet_checksum(&data), !0xddf2);
    }

    #[test]
    fn odd_length_pads_with_zero() {
        assert_eq!(internet_checksum(&[0x12]), internet_checksum(&[0x12, 0x00]));
    }

    #[test]
    fn reinserted_checksum_verifies_to_zero() {
        let mut header = [
            0x45, 0x00, 0x00, 0x3c, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00, 0xac, 0x10,
            0x0a, 0x63, 0xac, 0x10, 0x0a, 0x0c,
        ];
        let csum = internet_checksum(&header);
        assert_eq!(csum, 0xb1e6);
        header[10..12].copy_from_slice(&csum.to_be_bytes());
        assert_eq!(internet_checksum(&header), 0);
    }

    #[test]
    fn pseudo_header_layouts_differ_by_family() {
        let v4 = ipv4_pseudo_header([1, 2, 3, 4], [5, 6, 7, 8], 6, 0x1234);
        assert_eq!(&v4[8..], &[0, 6, 0x12, 0x34]);

        let v6 = ipv6_pseudo_header([0xaa; 16], [0xbb; 16], 17, 0x0001_0203);
        assert_eq!(&v6[32..], &[0x00, 0x01, 0x02, 0x03, 0, 0, 0, 17]);
    }

    #[test]
    fn packet_ids_advance() {
        let a = next_packet_id();
        let b = next_packet_id();
        assert_ne!(a, b);
    }
}
