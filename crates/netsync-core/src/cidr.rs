//! IPv4 CIDR arithmetic
//!
//! Blocks are compared as inclusive `[first, last]` integer intervals, never
//! as strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::Error;

/// An IPv4 network block (`base/prefix_len`) with no host bits set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Cidr {
    /// Build a block, rejecting prefixes above 32 and set host bits
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> Result<Self, Error> {
        if prefix_len > 32 {
            return Err(Error::invalid_cidr(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }
        let base = u32::from(network);
        let masked = base & mask(prefix_len);
        if masked != base {
            return Err(Error::invalid_cidr(format!(
                "{}/{} has host bits set (network address is {}/{})",
                network,
                prefix_len,
                Ipv4Addr::from(masked),
                prefix_len
            )));
        }
        Ok(Self {
            network,
            prefix_len,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// First address of the block as an integer
    pub fn first(&self) -> u32 {
        u32::from(self.network)
    }

    /// Last address of the block (the broadcast address for prefixes < 31)
    pub fn last(&self) -> u32 {
        self.first() | !mask(self.prefix_len)
    }

    /// Total number of addresses in the block
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix_len))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let value = u32::from(addr);
        value >= self.first() && value <= self.last()
    }

    /// Interval intersection test
    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.first() <= other.last() && other.first() <= self.last()
    }

    /// Range of assignable host addresses
    ///
    /// Network and broadcast addresses are excluded up to /30. A /31 is a
    /// point-to-point link with both addresses usable and a /32 is a single
    /// host.
    pub fn host_range(&self) -> (u32, u32) {
        match self.prefix_len {
            31 | 32 => (self.first(), self.last()),
            _ => (self.first() + 1, self.last() - 1),
        }
    }

    pub fn host_count(&self) -> u64 {
        let (first, last) = self.host_range();
        u64::from(last - first) + 1
    }

    /// Iterate assignable host addresses in ascending order
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        let (first, last) = self.host_range();
        (first..=last).map(Ipv4Addr::from)
    }

    /// Whether `addr` is an assignable host of this block
    pub fn is_host(&self, addr: Ipv4Addr) -> bool {
        let (first, last) = self.host_range();
        let value = u32::from(addr);
        value >= first && value <= last
    }
}

fn mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::invalid_cidr(format!("'{}' is missing a /prefix", s)))?;

        let network: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::invalid_cidr(format!("'{}' is not an IPv4 address", addr)))?;

        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::invalid_cidr(format!(
                "'{}' is not a prefix length",
                prefix
            )));
        }
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| Error::invalid_cidr(format!("'{}' is not a prefix length", prefix)))?;

        Cidr::new(network, prefix_len)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl TryFrom<String> for Cidr {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cidr> for String {
    fn from(value: Cidr) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Cidr {
        s.parse().unwrap()
    }

    #[test]
    fn parses_and_bounds() {
        let block = cidr("10.0.0.0/24");
        assert_eq!(block.first(), u32::from(Ipv4Addr::new(10, 0, 0, 0)));
        assert_eq!(block.last(), u32::from(Ipv4Addr::new(10, 0, 0, 255)));
        assert_eq!(block.size(), 256);
        assert_eq!(block.host_count(), 254);
        assert_eq!(block.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in [
            "10.0.0.0",
            "10.0.0/24",
            "10.0.0.0/33",
            "10.0.0.0/",
            "10.0.0.0/-1",
            "10.0.0.0/+8",
            "banana/8",
            "10.0.0.5/24",
        ] {
            let err = bad.parse::<Cidr>().unwrap_err();
            assert!(matches!(err, Error::InvalidCidr(_)), "{} -> {:?}", bad, err);
        }
    }

    #[test]
    fn overlap_is_interval_intersection() {
        assert!(cidr("10.0.0.0/24").overlaps(&cidr("10.0.0.128/25")));
        assert!(cidr("10.0.0.128/25").overlaps(&cidr("10.0.0.0/24")));
        assert!(cidr("0.0.0.0/0").overlaps(&cidr("192.168.1.0/24")));
        assert!(!cidr("10.0.0.0/25").overlaps(&cidr("10.0.0.128/25")));
        assert!(!cidr("10.0.0.0/24").overlaps(&cidr("10.0.1.0/24")));
        // String prefixes agree but ranges do not.
        assert!(!cidr("10.1.0.0/16").overlaps(&cidr("10.10.0.0/16")));
    }

    #[test]
    fn host_ranges_by_prefix() {
        let slash30: Vec<_> = cidr("10.0.0.0/30").hosts().collect();
        assert_eq!(
            slash30,
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
        );

        let slash31: Vec<_> = cidr("10.0.0.4/31").hosts().collect();
        assert_eq!(
            slash31,
            vec![Ipv4Addr::new(10, 0, 0, 4), Ipv4Addr::new(10, 0, 0, 5)]
        );

        let slash32: Vec<_> = cidr("10.0.0.9/32").hosts().collect();
        assert_eq!(slash32, vec![Ipv4Addr::new(10, 0, 0, 9)]);

        assert!(!cidr("10.0.0.0/30").is_host(Ipv4Addr::new(10, 0, 0, 3)));
        assert!(cidr("10.0.0.0/30").contains(Ipv4Addr::new(10, 0, 0, 3)));
    }

    #[test]
    fn serde_uses_string_form() {
        let json = serde_json::to_string(&cidr("172.16.0.0/12")).unwrap();
        assert_eq!(json, "\"172.16.0.0/12\"");
        let back: Cidr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cidr("172.16.0.0/12"));
        assert!(serde_json::from_str::<Cidr>("\"172.16.0.1/12\"").is_err());
    }
}
