//! CIDR blocks and range decomposition.

use std::{
    fmt::{self, Display, Formatter},
    net::{Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use crate::NetError;

/// A single IPv4 CIDR network, the unit both the collapse sweep emits and
/// the firewall drivers consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cidr {
    pub addr: u32,
    pub bits: u8,
}

impl Cidr {
    /// Inclusive `[start, end]` span this block covers.
    pub fn range(&self) -> (u32, u32) {
        let span = if self.bits == 0 {
            u32::MAX
        } else {
            (1_u32 << (32 - self.bits)) - 1
        };
        (self.addr, self.addr.wrapping_add(span))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let (start, end) = self.range();
        let addr = u32::from(addr);
        start <= addr && addr <= end
    }
}

impl Display for Cidr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.addr), self.bits)
    }
}

impl FromStr for Cidr {
    type Err = NetError;

    /// Parses `a.b.c.d/bits`; a bare address is a host route.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetError::InvalidCidr(s.to_owned());

        let (addr, bits) = match s.split_once('/') {
            Some((addr, bits)) => {
                let bits: u8 = bits.parse().map_err(|_| invalid())?;
                if bits > 32 {
                    return Err(NetError::InvalidPrefix(bits));
                }
                (addr, bits)
            }
            None => (s, 32),
        };

        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        Ok(Self {
            addr: u32::from(addr),
            bits,
        })
    }
}

/// An IPv6 network. The collapse sweep is IPv4-only; these exist so v6
/// blacklist entries still match connecting peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr6 {
    pub addr: u128,
    pub bits: u8,
}

impl Cidr6 {
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        if self.bits == 0 {
            return true;
        }
        let mask = u128::MAX << (128 - self.bits);
        (u128::from(addr) & mask) == (self.addr & mask)
    }
}

impl Display for Cidr6 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv6Addr::from(self.addr), self.bits)
    }
}

impl FromStr for Cidr6 {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetError::InvalidCidr(s.to_owned());

        let (addr, bits) = match s.split_once('/') {
            Some((addr, bits)) => {
                let bits: u8 = bits.parse().map_err(|_| invalid())?;
                if bits > 128 {
                    return Err(NetError::InvalidPrefix(bits));
                }
                (addr, bits)
            }
            None => (s, 128),
        };

        let addr: Ipv6Addr = addr.parse().map_err(|_| invalid())?;
        Ok(Self {
            addr: u128::from(addr),
            bits,
        })
    }
}

/// Decompose the inclusive range `[start, end]` into the minimal sorted
/// run of CIDR blocks covering it: at each step take the largest block
/// aligned at the current position that does not overshoot the end.
pub fn range_to_cidrs(start: u32, end: u32) -> Vec<Cidr> {
    let mut cidrs = Vec::new();
    if start > end {
        return cidrs;
    }

    let end = u64::from(end);
    let mut cur = u64::from(start);

    while cur <= end {
        // Host bits allowed by alignment, then shrunk to fit the remainder.
        let mut host_bits = if cur == 0 {
            32
        } else {
            cur.trailing_zeros().min(32)
        };
        while host_bits > 0 && cur + (1_u64 << host_bits) - 1 > end {
            host_bits -= 1;
        }

        #[allow(clippy::cast_possible_truncation)]
        let block = Cidr {
            addr: cur as u32,
            bits: (32 - host_bits) as u8,
        };
        cidrs.push(block);
        cur += 1_u64 << host_bits;
    }

    cidrs
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn ip(s: &str) -> u32 {
        s.parse::<Ipv4Addr>().unwrap().into()
    }

    fn render(cidrs: &[Cidr]) -> Vec<String> {
        cidrs.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn unaligned_range_decomposes_minimally() {
        let cidrs = range_to_cidrs(ip("192.168.0.1"), ip("192.168.0.25"));
        assert_eq!(
            render(&cidrs),
            [
                "192.168.0.1/32",
                "192.168.0.2/31",
                "192.168.0.4/30",
                "192.168.0.8/29",
                "192.168.0.16/29",
                "192.168.0.24/31",
            ]
        );
    }

    #[test]
    fn aligned_range_is_a_single_block() {
        let cidrs = range_to_cidrs(ip("10.0.0.0"), ip("10.0.0.255"));
        assert_eq!(render(&cidrs), ["10.0.0.0/24"]);
    }

    #[test]
    fn single_address_is_a_host_route() {
        let cidrs = range_to_cidrs(ip("3.4.2.1"), ip("3.4.2.1"));
        assert_eq!(render(&cidrs), ["3.4.2.1/32"]);
    }

    #[test]
    fn full_space_does_not_overflow() {
        let cidrs = range_to_cidrs(0, u32::MAX);
        assert_eq!(render(&cidrs), ["0.0.0.0/0"]);

        let tail = range_to_cidrs(ip("255.255.255.254"), u32::MAX);
        assert_eq!(render(&tail), ["255.255.255.254/31"]);
    }

    #[test]
    fn inverted_range_is_empty() {
        assert!(range_to_cidrs(10, 9).is_empty());
    }

    #[test]
    fn decomposition_reunions_to_the_original_range() {
        for (start, end) in [
            (ip("192.168.0.1"), ip("192.168.0.25")),
            (ip("10.0.0.3"), ip("10.0.200.77")),
            (ip("0.0.0.1"), ip("0.0.0.1")),
            (ip("1.2.3.4"), ip("200.0.0.0")),
        ] {
            let cidrs = range_to_cidrs(start, end);
            let mut cursor = start;
            for cidr in &cidrs {
                let (s, e) = cidr.range();
                assert_eq!(s, cursor, "gap before {cidr}");
                cursor = e.wrapping_add(1);
            }
            assert_eq!(cursor, end.wrapping_add(1));
        }
    }

    #[test]
    fn cidr_parse_and_display() {
        let cidr: Cidr = "10.0.0.0/27".parse().unwrap();
        assert_eq!(cidr.range(), (ip("10.0.0.0"), ip("10.0.0.31")));
        assert_eq!(cidr.to_string(), "10.0.0.0/27");

        let host: Cidr = "10.10.10.1".parse().unwrap();
        assert_eq!(host.bits, 32);

        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("not-an-ip/8".parse::<Cidr>().is_err());
    }

    #[test]
    fn cidr6_contains() {
        let net: Cidr6 = "2001::/16".parse().unwrap();
        assert!(net.contains("2001::fad3:1".parse().unwrap()));
        assert!(!net.contains("2002::1".parse().unwrap()));

        let host: Cidr6 = "2001::fad3:1/128".parse().unwrap();
        assert!(host.contains("2001::fad3:1".parse().unwrap()));
        assert!(!host.contains("2001::fad3:2".parse().unwrap()));
    }
}
