//! Bit helpers for left-aligned 128-bit trie keys.
//!
//! Both families share one key representation: the address occupies the most
//! significant bits of a `u128`, so an IPv4 address sits in the top 32 bits and
//! bit index 0 is always the first bit on the wire.

use crate::errors::Error;
use crate::types::Family;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[inline]
pub fn v4_key(addr: u32) -> u128 {
    (addr as u128) << 96
}

#[inline]
pub fn v6_key(addr: Ipv6Addr) -> u128 {
    u128::from(addr)
}

/// Split an address into its family and left-aligned key.
#[inline]
pub fn ip_key(addr: IpAddr) -> (Family, u128) {
    match addr {
        IpAddr::V4(v4) => (Family::V4, v4_key(u32::from(v4))),
        IpAddr::V6(v6) => (Family::V6, v6_key(v6)),
    }
}

/// Inverse of [`ip_key`].
#[inline]
pub fn key_to_ip(family: Family, key: u128) -> IpAddr {
    match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::from((key >> 96) as u32)),
        Family::V6 => IpAddr::V6(Ipv6Addr::from(key)),
    }
}

/// Network-order address bytes (4 or 16) to family and key.
pub fn key_from_bytes(bytes: &[u8]) -> Result<(Family, u128), Error> {
    match bytes.len() {
        4 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(bytes);
            Ok((Family::V4, v4_key(u32::from_be_bytes(b))))
        }
        16 => {
            let mut b = [0u8; 16];
            b.copy_from_slice(bytes);
            Ok((Family::V6, u128::from_be_bytes(b)))
        }
        n => Err(Error::InvalidAddressLength(n)),
    }
}

pub fn common_prefix_len(key1: u128, key2: u128, max_len: u8) -> u8 {
    if max_len == 0 {
        return 0;
    }
    let diff = (key1 ^ key2) & mask(max_len);
    if diff == 0 {
        return max_len;
    }
    (diff.leading_zeros() as u8).min(max_len)
}

/// Bit `index` of `key`, counted from the most significant bit.
#[inline]
pub fn get_bit(key: u128, index: u8) -> u8 {
    debug_assert!(index <= 127);
    ((key >> (127 - index)) & 1) as u8
}

#[inline]
pub fn mask(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        !0u128
    } else {
        !(!0u128 >> prefix_len)
    }
}

// Canonicalise a key: zero host bits beyond `plen`.
#[inline(always)]
pub fn canonical(key: u128, plen: u8) -> u128 {
    key & mask(plen)
}

/// True when the first `plen` bits of `key` equal those of `prefix`.
#[inline(always)]
pub fn prefix_matches(prefix: u128, plen: u8, key: u128) -> bool {
    (prefix ^ key) & mask(plen) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_keys_are_left_aligned() {
        let key = v4_key(0x0A01_0203);
        assert_eq!(get_bit(key, 0), 0);
        assert_eq!(get_bit(key, 4), 1); // 0x0A = 0000_1010
        assert_eq!(key_to_ip(Family::V4, key), IpAddr::from([10, 1, 2, 3]));
    }

    #[test]
    fn common_prefix_is_capped() {
        let a = v4_key(0x0A00_0000);
        let b = v4_key(0x0A01_0000);
        assert_eq!(common_prefix_len(a, b, 32), 15);
        assert_eq!(common_prefix_len(a, b, 8), 8);
        assert_eq!(common_prefix_len(a, b, 0), 0);
        assert_eq!(common_prefix_len(a, a, 128), 128);
    }

    #[test]
    fn mask_edges() {
        assert_eq!(mask(0), 0);
        assert_eq!(mask(128), !0u128);
        assert_eq!(canonical(v4_key(0xC0A8_0101), 24), v4_key(0xC0A8_0100));
        assert!(prefix_matches(v4_key(0x0A00_0000), 8, v4_key(0x0AFF_FFFF)));
        assert!(!prefix_matches(v4_key(0x0A00_0000), 8, v4_key(0x0B00_0000)));
        assert!(prefix_matches(0, 0, !0u128));
    }

    #[test]
    fn bytes_round_into_keys() {
        let (fam, key) = key_from_bytes(&[192, 168, 0, 1]).unwrap();
        assert_eq!(fam, Family::V4);
        assert_eq!(key, v4_key(0xC0A8_0001));
        let (fam, _) = key_from_bytes(&[0u8; 16]).unwrap();
        assert_eq!(fam, Family::V6);
        assert!(matches!(key_from_bytes(&[1, 2, 3]), Err(Error::InvalidAddressLength(3))));
    }
}
