//! Node reachability classification

use crate::types::{NetResource, NodeId, Reachability};
use ipnetwork::IpNetwork;
use std::collections::HashSet;

/// Either address family is publicly reachable
pub fn is_public(node: &NodeId) -> bool {
    node.reachability_v4 == Reachability::Public || node.reachability_v6 == Reachability::Public
}

/// Either address family sits behind NAT (or is ULA-only for IPv6)
pub fn is_hidden(node: &NodeId) -> bool {
    node.reachability_v4 == Reachability::Hidden || node.reachability_v6 == Reachability::Hidden
}

/// Resource prefixes split by how their owners can be reached
#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub public: HashSet<IpNetwork>,
    pub hidden: HashSet<IpNetwork>,
}

impl Partition {
    pub fn is_public(&self, prefix: &IpNetwork) -> bool {
        self.public.contains(prefix)
    }

    pub fn is_hidden(&self, prefix: &IpNetwork) -> bool {
        self.hidden.contains(prefix)
    }
}

/// Partition a resource set into public and hidden prefixes.
///
/// A node with one public family and one hidden family is public: it can be
/// dialed directly. Nodes that are neither land in no set.
pub fn partition(resources: &[NetResource]) -> Partition {
    let mut out = Partition::default();
    for resource in resources {
        if is_public(&resource.node_id) {
            out.public.insert(resource.prefix);
        } else if is_hidden(&resource.node_id) {
            out.hidden.insert(resource.prefix);
        }
    }
    out
}
