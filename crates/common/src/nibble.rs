//! Deterministic naming and addressing for network resources
//!
//! Every name and internal address a resource needs is derived from its
//! IPv6 prefix and the network's allocation number. Nothing is stored; two
//! independent runs always agree.
//!
//! The 16-bit token is the XOR of the prefix's network hextets. For prefixes
//! carved from one shared block along a hextet boundary (a /48 split into
//! /64s, a /32 split into /48s) the members differ in a single hextet, so
//! the fold is a bijection over them and derived names never collide.

use crate::{Error, Result};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Shortest prefix accepted for a resource
pub const MIN_PREFIX_LEN: u8 = 16;
/// Longest prefix accepted for a resource
pub const MAX_PREFIX_LEN: u8 = 64;

/// Derived identity of a network resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nibble {
    token: [u8; 2],
    allocation_nr: u8,
}

impl Nibble {
    /// Derive from a resource prefix.
    ///
    /// Fails on anything that is not an IPv6 network with a prefix length in
    /// `MIN_PREFIX_LEN..=MAX_PREFIX_LEN` and no host bits set.
    pub fn new(prefix: &IpNetwork, allocation_nr: u8) -> Result<Self> {
        let net = match prefix {
            IpNetwork::V6(net) => net,
            IpNetwork::V4(_) => {
                return Err(Error::Address(format!("{} is not an IPv6 prefix", prefix)))
            }
        };
        Self::from_v6(net, allocation_nr)
    }

    /// Parse and derive from a prefix string such as `2001:db8:1::/64`
    pub fn parse(prefix: &str, allocation_nr: u8) -> Result<Self> {
        let net: Ipv6Network = prefix
            .parse()
            .map_err(|e| Error::Address(format!("invalid prefix {}: {}", prefix, e)))?;
        Self::from_v6(&net, allocation_nr)
    }

    fn from_v6(net: &Ipv6Network, allocation_nr: u8) -> Result<Self> {
        let len = net.prefix();
        if !(MIN_PREFIX_LEN..=MAX_PREFIX_LEN).contains(&len) {
            return Err(Error::Address(format!(
                "prefix length /{} of {} outside /{}../{}",
                len, net, MIN_PREFIX_LEN, MAX_PREFIX_LEN
            )));
        }
        if net.ip() != net.network() {
            return Err(Error::Address(format!("{} has host bits set", net)));
        }

        let hextets = (len as usize + 15) / 16;
        let token = net.network().segments()[..hextets]
            .iter()
            .fold(0u16, |acc, segment| acc ^ segment);

        Ok(Self {
            token: token.to_be_bytes(),
            allocation_nr,
        })
    }

    pub fn allocation_nr(&self) -> u8 {
        self.allocation_nr
    }

    /// Four hex digit token, also used as the key file name
    pub fn hex(&self) -> String {
        hex::encode(self.token)
    }

    pub fn network_name(&self) -> String {
        format!("net-{}-{}", self.hex(), self.allocation_nr)
    }

    pub fn bridge_name(&self) -> String {
        format!("br-{}-{}", self.hex(), self.allocation_nr)
    }

    pub fn wireguard_name(&self) -> String {
        format!("wg-{}-{}", self.hex(), self.allocation_nr)
    }

    pub fn veth_name(&self) -> String {
        format!("veth-{}-{}", self.hex(), self.allocation_nr)
    }

    /// Private IPv4 octet pair `(a, b)`
    pub fn to_v4(&self) -> (u8, u8) {
        (self.token[0], self.token[1])
    }

    /// `fe80::<token>`, the resource's address on the tunnel
    pub fn link_local(&self) -> Ipv6Addr {
        Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, u16::from_be_bytes(self.token))
    }

    /// `fe80::<token>/128`
    pub fn link_local_net(&self) -> IpNetwork {
        host_v6(self.link_local())
    }

    /// `172.16.a.b`, the resource's IPv4 address on the tunnel
    pub fn tunnel_v4(&self) -> Ipv4Addr {
        let (a, b) = self.to_v4();
        Ipv4Addr::new(172, 16, a, b)
    }

    /// `172.16.a.b/32`, used in peers' allowed IPs
    pub fn tunnel_v4_host(&self) -> IpNetwork {
        v4_net(self.tunnel_v4(), 32)
    }

    /// `172.16.a.b/16`, assigned to the tunnel interface so every segment
    /// of the private block is on-link
    pub fn tunnel_v4_iface(&self) -> IpNetwork {
        v4_net(self.tunnel_v4(), 16)
    }

    /// `10.a.b.0/24`, the resource's internal segment
    pub fn segment_v4(&self) -> IpNetwork {
        let (a, b) = self.to_v4();
        v4_net(Ipv4Addr::new(10, a, b, 0), 24)
    }

    /// `10.a.b.1/24`, assigned to the namespace side of the veth pair
    pub fn segment_v4_gateway(&self) -> IpNetwork {
        let (a, b) = self.to_v4();
        v4_net(Ipv4Addr::new(10, a, b, 1), 24)
    }
}

/// Derive the identity of the resource owning `prefix`
pub fn derive(prefix: &IpNetwork, allocation_nr: u8) -> Result<Nibble> {
    Nibble::new(prefix, allocation_nr)
}

fn v4_net(addr: Ipv4Addr, len: u8) -> IpNetwork {
    // len is always a literal <= 32
    IpNetwork::V4(Ipv4Network::new(addr, len).unwrap_or_else(|_| Ipv4Network::from(addr)))
}

fn host_v6(addr: Ipv6Addr) -> IpNetwork {
    IpNetwork::V6(Ipv6Network::from(addr))
}
