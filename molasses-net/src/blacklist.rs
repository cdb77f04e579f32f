//! Blacklists and the range collapse sweep.
//!
//! A blacklist owns an append-only array of range endpoints. Every added
//! range contributes an opening endpoint carrying `+1` and a closing
//! endpoint carrying `−1` in the column matching its kind. Collapsing
//! sorts the endpoints and sweeps them left to right with two running
//! sums, so overlapping black ranges and white punch-outs cost the same
//! and fall out of one rule: an address is blacklisted while the black
//! sum is positive and the white sum is zero.

use std::net::IpAddr;

use crate::{
    cidr::{range_to_cidrs, Cidr, Cidr6},
    NetError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Black,
    White,
}

/// One end of an added range. Addresses are kept as `u64` because the
/// closing endpoint sits one past the range end, which for
/// `255.255.255.255` does not fit an IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Endpoint {
    address: u64,
    black: i32,
    white: i32,
}

#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    pub name: String,
    pub message: String,
    endpoints: Vec<Endpoint>,
    v6: Vec<(Cidr6, Kind)>,
}

impl Blacklist {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            message: message.to_owned(),
            endpoints: Vec::new(),
            v6: Vec::new(),
        }
    }

    /// Append the inclusive range `[start, end]`. Inverted ranges are
    /// silently dropped.
    pub fn add_range(&mut self, start: u32, end: u32, kind: Kind) {
        if start > end {
            return;
        }

        let (black, white) = match kind {
            Kind::Black => (1, 0),
            Kind::White => (0, 1),
        };

        self.endpoints.push(Endpoint {
            address: u64::from(start),
            black,
            white,
        });
        self.endpoints.push(Endpoint {
            address: u64::from(end) + 1,
            black: -black,
            white: -white,
        });
    }

    /// Add a single CIDR entry, IPv4 or IPv6. v4 entries feed the range
    /// sweep; v6 entries are kept aside for matching only.
    pub fn add_cidr(&mut self, entry: &str, kind: Kind) -> Result<(), NetError> {
        if let Ok(cidr) = entry.parse::<Cidr>() {
            let (start, end) = cidr.range();
            self.add_range(start, end, kind);
            return Ok(());
        }

        let net: Cidr6 = entry.parse()?;
        self.v6.push((net, kind));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty() && self.v6.is_empty()
    }

    /// Resolve overlaps and white punch-outs into a sorted,
    /// non-overlapping CIDR cover of (black ∖ white).
    pub fn collapse(&self) -> Vec<Cidr> {
        let mut endpoints = self.endpoints.clone();
        endpoints.sort_by_key(|e| e.address);

        let mut cidrs = Vec::new();
        let mut bs = 0;
        let mut ws = 0;
        let mut in_black = false;
        let mut bstart = 0_u64;

        let mut i = 0;
        while i < endpoints.len() {
            let addr = endpoints[i].address;
            while i < endpoints.len() && endpoints[i].address == addr {
                bs += endpoints[i].black;
                ws += endpoints[i].white;
                i += 1;
            }

            let now_black = bs > 0 && ws == 0;
            if !in_black && now_black {
                // Start of a blacklisted region.
                bstart = addr;
            } else if in_black && !now_black {
                // Region closed at the previous address.
                #[allow(clippy::cast_possible_truncation)]
                cidrs.extend(range_to_cidrs(bstart as u32, (addr - 1) as u32));
            }
            in_black = now_black;
        }

        cidrs
    }

    /// Does this list cover `addr`? For v4 that is membership in
    /// (black ∖ white); v6 entries are consulted pairwise.
    pub fn matches(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => {
                let addr = u64::from(u32::from(v4));
                let mut black = false;
                let mut white = false;

                for pair in self.endpoints.chunks_exact(2) {
                    if pair[0].address <= addr && addr < pair[1].address {
                        black |= pair[0].black > 0;
                        white |= pair[0].white > 0;
                    }
                }

                black && !white
            }
            IpAddr::V6(v6) => {
                let mut black = false;
                let mut white = false;

                for (net, kind) in &self.v6 {
                    if net.contains(v6) {
                        match kind {
                            Kind::Black => black = true,
                            Kind::White => white = true,
                        }
                    }
                }

                black && !white
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::net::Ipv4Addr;

    use pretty_assertions::assert_eq;

    use super::*;

    fn ip(s: &str) -> u32 {
        s.parse::<Ipv4Addr>().unwrap().into()
    }

    fn render(cidrs: &[Cidr]) -> Vec<String> {
        cidrs.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn added_range_appends_an_endpoint_pair() {
        let mut list = Blacklist::new("test", "You have been blacklisted");
        list.add_range(ip("192.168.1.0"), ip("192.168.1.100"), Kind::Black);

        assert_eq!(list.endpoints.len(), 2);
        assert_eq!(list.endpoints[0].address, u64::from(ip("192.168.1.0")));
        assert_eq!(list.endpoints[0].black, 1);
        assert_eq!(list.endpoints[0].white, 0);
        assert_eq!(list.endpoints[1].address, u64::from(ip("192.168.1.100")) + 1);
        assert_eq!(list.endpoints[1].black, -1);
        assert_eq!(list.endpoints[1].white, 0);
    }

    #[test]
    fn inverted_range_is_dropped() {
        let mut list = Blacklist::new("test", "msg");
        list.add_range(ip("10.0.0.9"), ip("10.0.0.1"), Kind::Black);
        assert!(list.is_empty());
    }

    #[test]
    fn collapse_resolves_overlap_and_whitelist() {
        let mut list = Blacklist::new("test", "msg");
        list.add_range(ip("10.0.0.0"), ip("10.0.0.20"), Kind::Black);
        list.add_range(ip("10.0.0.10"), ip("10.0.0.50"), Kind::Black);
        list.add_range(ip("10.0.0.40"), ip("10.0.0.60"), Kind::White);

        assert_eq!(render(&list.collapse()), ["10.0.0.0/27", "10.0.0.32/29"]);
    }

    #[test]
    fn collapse_of_empty_list_is_empty() {
        assert!(Blacklist::new("test", "msg").collapse().is_empty());
    }

    #[test]
    fn collapse_union_matches_set_semantics() {
        let mut list = Blacklist::new("test", "msg");
        list.add_range(ip("10.0.0.0"), ip("10.0.0.20"), Kind::Black);
        list.add_range(ip("10.0.0.10"), ip("10.0.0.50"), Kind::Black);
        list.add_range(ip("10.0.0.40"), ip("10.0.0.60"), Kind::White);

        let cover = list.collapse();
        let member =
            |addr: u32| cover.iter().any(|c| c.contains(Ipv4Addr::from(addr)));

        for addr in ip("10.0.0.0")..=ip("10.0.0.70") {
            let black = (ip("10.0.0.0")..=ip("10.0.0.50")).contains(&addr);
            let white = (ip("10.0.0.40")..=ip("10.0.0.60")).contains(&addr);
            assert_eq!(member(addr), black && !white, "address {}", Ipv4Addr::from(addr));
        }
    }

    #[test]
    fn whole_space_collapses_without_overflow() {
        let mut list = Blacklist::new("test", "msg");
        list.add_range(0, u32::MAX, Kind::Black);
        assert_eq!(render(&list.collapse()), ["0.0.0.0/0"]);
    }

    #[test]
    fn matches_honours_white_over_black() {
        let mut list = Blacklist::new("test", "msg");
        list.add_cidr("10.10.10.0/24", Kind::Black).unwrap();
        list.add_cidr("10.10.10.2/32", Kind::White).unwrap();

        assert!(list.matches("10.10.10.1".parse().unwrap()));
        assert!(!list.matches("10.10.10.2".parse().unwrap()));
        assert!(!list.matches("10.10.11.1".parse().unwrap()));
    }

    #[test]
    fn matches_v6_entries() {
        let mut list = Blacklist::new("test", "msg");
        list.add_cidr("2001::fad3:1/128", Kind::Black).unwrap();

        assert!(list.matches("2001::fad3:1".parse().unwrap()));
        assert!(!list.matches("2001::fad3:2".parse().unwrap()));
        assert!(!list.matches("10.10.10.1".parse().unwrap()));
    }

    #[test]
    fn bad_entry_is_reported() {
        let mut list = Blacklist::new("test", "msg");
        assert_eq!(
            list.add_cidr("not-an-address", Kind::Black),
            Err(NetError::InvalidCidr(String::from("not-an-address")))
        );
    }
}
