//! Core types for nrmesh
//!
//! Network definitions are received from an external description store and
//! treated as immutable snapshots. Planned peers and routes are derived from
//! them and never patched in place.

use crate::nibble::Nibble;
use crate::{Error, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

/// Reachability of a node for one address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    Public,
    /// Behind NAT, or ULA-only for IPv6
    #[serde(alias = "ula", alias = "nat")]
    Hidden,
    Unknown,
}

impl Default for Reachability {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for Reachability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reachability::Public => write!(f, "public"),
            Reachability::Hidden => write!(f, "hidden"),
            Reachability::Unknown => write!(f, "unknown"),
        }
    }
}

/// Node identity plus its advertised reachability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeId {
    pub id: String,
    #[serde(default)]
    pub reachability_v4: Reachability,
    #[serde(default)]
    pub reachability_v6: Reachability,
}

impl NodeId {
    pub fn new(id: impl Into<String>, v4: Reachability, v6: Reachability) -> Self {
        Self {
            id: id.into(),
            reachability_v4: v4,
            reachability_v6: v6,
        }
    }
}

/// Mesh link technology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wireguard,
    Local,
    #[serde(other)]
    Unsupported,
}

impl Default for ConnectionType {
    fn default() -> Self {
        Self::Wireguard
    }
}

/// How to reach a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// WireGuard public key, base64
    pub public_key: String,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub port: u16,
}

impl Connection {
    /// Reachable `ip:port`, if the peer advertised one
    pub fn endpoint(&self) -> Option<SocketAddr> {
        match self.ip {
            Some(ip) if self.port != 0 => Some(SocketAddr::new(ip, self.port)),
            _ => None,
        }
    }
}

/// A mesh link from the owning resource to another resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub prefix: IpNetwork,
    #[serde(default, rename = "type")]
    pub connection_type: ConnectionType,
    pub connection: Connection,
}

/// One node's segment of a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetResource {
    pub node_id: NodeId,
    pub prefix: IpNetwork,
    pub link_local: IpNetwork,
    #[serde(default)]
    pub peers: Vec<Peer>,
}

impl NetResource {
    /// Find the peer entry pointing at `prefix`
    pub fn peer(&self, prefix: &IpNetwork) -> Option<&Peer> {
        self.peers.iter().find(|p| &p.prefix == prefix)
    }
}

/// A named set of resources sharing an allocation number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub allocation_nr: u8,
    pub resources: Vec<NetResource>,
    /// Prefix of the exit resource
    pub exit_prefix: IpNetwork,
}

impl Network {
    /// Load a network definition from JSON
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// The resource owned by `node_id`
    pub fn local_resource(&self, node_id: &str) -> Option<&NetResource> {
        self.resources.iter().find(|r| r.node_id.id == node_id)
    }

    /// The designated exit resource
    pub fn exit(&self) -> Option<&NetResource> {
        self.resources.iter().find(|r| r.prefix == self.exit_prefix)
    }

    pub fn is_exit(&self, resource: &NetResource) -> bool {
        resource.prefix == self.exit_prefix
    }

    /// UDP port other resources expect `resource` to listen on
    pub fn listen_port(&self, resource: &NetResource) -> Option<u16> {
        self.resources
            .iter()
            .filter(|r| r.prefix != resource.prefix)
            .filter_map(|r| r.peer(&resource.prefix))
            .map(|p| p.connection.port)
            .find(|port| *port != 0)
    }

    /// Check the snapshot before planning against it
    pub fn validate(&self) -> Result<()> {
        if self.resources.is_empty() {
            return Err(Error::Planning(format!(
                "network {} has no resources",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for resource in &self.resources {
            if !resource.prefix.is_ipv6() {
                return Err(Error::Address(format!(
                    "resource of node {} has non IPv6 prefix {}",
                    resource.node_id.id, resource.prefix
                )));
            }
            if !seen.insert(resource.prefix) {
                return Err(Error::Planning(format!(
                    "prefix {} is used by more than one resource in network {}",
                    resource.prefix, self.name
                )));
            }
            Nibble::new(&resource.prefix, self.allocation_nr)?;
            for peer in &resource.peers {
                if peer.connection_type == ConnectionType::Wireguard {
                    Nibble::new(&peer.prefix, self.allocation_nr)?;
                }
            }
        }

        if self.exit().is_none() {
            return Err(Error::Planning(format!(
                "exit prefix {} is not a member of network {}",
                self.exit_prefix, self.name
            )));
        }

        Ok(())
    }
}

/// A WireGuard peer as installed on a tunnel interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgPeer {
    pub public_key: String,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNetwork>,
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
}

/// A kernel route installed on the tunnel interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub destination: IpNetwork,
    pub gateway: IpAddr,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} via {}", self.destination, self.gateway)
    }
}

/// Peers and routes computed for one resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub peers: Vec<WgPeer>,
    pub routes: Vec<Route>,
}

impl Plan {
    /// Fold another plan into this one.
    ///
    /// A peer in `other` replaces any peer with the same public key; a route
    /// whose destination is already present is dropped.
    pub fn merge(&mut self, other: Plan) {
        for peer in other.peers {
            self.peers.retain(|p| p.public_key != peer.public_key);
            self.peers.push(peer);
        }
        for route in other.routes {
            if !self.routes.iter().any(|r| r.destination == route.destination) {
                self.routes.push(route);
            }
        }
    }
}
