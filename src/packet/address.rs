use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// An IPv4 or IPv6 address exactly as it appears on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpAddress {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl IpAddress {
    pub fn is_ipv4(&self) -> bool {
        matches!(self, Self::V4(_))
    }

    /// fe80::/10
    pub fn is_ipv6_link_local(&self) -> bool {
        match self {
            Self::V6(octets) => octets[0] == 0xfe && (octets[1] & 0xc0) == 0x80,
            Self::V4(_) => false,
        }
    }

    pub fn to_std(&self) -> IpAddr {
        match *self {
            Self::V4(octets) => IpAddr::V4(Ipv4Addr::from(octets)),
            Self::V6(octets) => IpAddr::V6(Ipv6Addr::from(octets)),
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(o) => write!(f, "{}.{}.{}.{}", o[0], o[1], o[2], o[3]),
            Self::V6(o) => {
                for (i, group) in o.chunks_exact(2).enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{:04x}", u16::from_be_bytes([group[0], group[1]]))?;
                }
                Ok(())
            }
        }
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        Self::V4(addr.octets())
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> Self {
        Self::V6(addr.octets())
    }
}

impl From<IpAddr> for IpAddress {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => v4.into(),
            IpAddr::V6(v6) => v6.into(),
        }
    }
}

impl From<IpAddress> for IpAddr {
    fn from(addr: IpAddress) -> Self {
        addr.to_std()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_dotted_quad() {
        let addr = IpAddress::V4([10, 0, 2, 15]);
        assert_eq!(addr.to_string(), "10.0.2.15");
    }

    #[test]
    fn renders_uncompressed_hex_groups() {
        let addr: IpAddress = "fe80::1".parse::<Ipv6Addr>().unwrap().into();
        assert_eq!(
            addr.to_string(),
            "fe80:0000:0000:0000:0000:0000:0000:0001"
        );
        assert!(addr.is_ipv6_link_local());
    }
}
