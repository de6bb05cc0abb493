//! Address extraction from raw IP headers.
//!
//! Only the fixed header is inspected; options and extension headers never
//! move the address fields.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

const IPV4_SRC: usize = 12;
const IPV4_DST: usize = 16;
const IPV6_SRC: usize = 8;
const IPV6_DST: usize = 24;

#[derive(Copy, Clone)]
enum Field {
    Source,
    Destination,
}

fn address(packet: &[u8], field: Field) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= IPV4_HEADER_LEN => {
            let at = match field {
                Field::Source => IPV4_SRC,
                Field::Destination => IPV4_DST,
            };
            let octets: [u8; 4] = packet[at..at + 4].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= IPV6_HEADER_LEN => {
            let at = match field {
                Field::Source => IPV6_SRC,
                Field::Destination => IPV6_DST,
            };
            let octets: [u8; 16] = packet[at..at + 16].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Destination address of an IPv4 or IPv6 packet, `None` if truncated or not IP.
pub fn destination(packet: &[u8]) -> Option<IpAddr> {
    address(packet, Field::Destination)
}

/// Source address of an IPv4 or IPv6 packet, `None` if truncated or not IP.
pub fn source(packet: &[u8]) -> Option<IpAddr> {
    address(packet, Field::Source)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut p = vec![0u8; IPV4_HEADER_LEN];
        p[0] = 0x45;
        p[IPV4_SRC..IPV4_SRC + 4].copy_from_slice(&src);
        p[IPV4_DST..IPV4_DST + 4].copy_from_slice(&dst);
        p
    }

    #[test]
    fn ipv4_addresses() {
        let p = v4_packet([10, 0, 0, 1], [192, 168, 1, 7]);
        assert_eq!(source(&p), Some(IpAddr::from([10, 0, 0, 1])));
        assert_eq!(destination(&p), Some(IpAddr::from([192, 168, 1, 7])));
    }

    #[test]
    fn ipv6_addresses() {
        let src: Ipv6Addr = "fd00::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::42".parse().unwrap();
        let mut p = vec![0u8; IPV6_HEADER_LEN + 8];
        p[0] = 0x60;
        p[IPV6_SRC..IPV6_SRC + 16].copy_from_slice(&src.octets());
        p[IPV6_DST..IPV6_DST + 16].copy_from_slice(&dst.octets());
        assert_eq!(source(&p), Some(IpAddr::V6(src)));
        assert_eq!(destination(&p), Some(IpAddr::V6(dst)));
    }

    #[test]
    fn truncated_or_foreign() {
        assert_eq!(destination(&[]), None);
        let p = v4_packet([1, 1, 1, 1], [2, 2, 2, 2]);
        assert_eq!(destination(&p[..19]), None);
        let mut p6 = vec![0u8; 39];
        p6[0] = 0x60;
        assert_eq!(source(&p6), None);
        let mut other = vec![0u8; 64];
        other[0] = 0x50;
        assert_eq!(destination(&other), None);
    }
}
