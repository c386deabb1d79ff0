//! Mesh topology planning
//!
//! Computes the WireGuard peers and kernel routes a resource needs, from an
//! immutable network snapshot. The role of the local resource is chosen
//! once; each role has its own strategy and every non-exit role also gets
//! the default route through the exit.

use crate::nibble::Nibble;
use crate::reachability::{self, Partition};
use crate::types::{ConnectionType, NetResource, Network, Peer, Plan, Route, WgPeer};
use crate::{Error, Result};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

/// Keepalive towards peers dialed from behind NAT, in seconds
pub const NAT_KEEPALIVE_SECS: u16 = 25;

/// Role of the local resource within its network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Relay for hidden resources
    Exit,
    /// Directly reachable
    Public,
    /// Behind NAT, reaches other hidden resources through the exit
    Hidden,
    /// Neither public nor hidden
    Generic,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Exit => write!(f, "exit"),
            Role::Public => write!(f, "public"),
            Role::Hidden => write!(f, "hidden"),
            Role::Generic => write!(f, "generic"),
        }
    }
}

impl Role {
    /// Select the role of `local` in `network`
    pub fn of(local: &NetResource, network: &Network) -> Self {
        if network.is_exit(local) {
            Role::Exit
        } else if reachability::is_public(&local.node_id) {
            Role::Public
        } else if reachability::is_hidden(&local.node_id) {
            Role::Hidden
        } else {
            Role::Generic
        }
    }

    /// Run this role's strategy only, without the default route
    pub fn plan(&self, local: &NetResource, network: &Network) -> Result<Plan> {
        let partition = reachability::partition(&network.resources);
        match self {
            Role::Exit => plan_exit_hub(local, network, &partition),
            Role::Public => plan_public(local, network, &partition),
            Role::Hidden | Role::Generic => plan_relayed(local, network, &partition),
        }
    }
}

/// Full plan for `local`: its role strategy plus, for every non-exit role,
/// the default route through the exit.
pub fn plan(local: &NetResource, network: &Network) -> Result<Plan> {
    let role = Role::of(local, network);
    let mut plan = role.plan(local, network)?;
    if role != Role::Exit {
        plan.merge(plan_default_route(local, network)?);
    }
    if matches!(role, Role::Hidden | Role::Generic) {
        // keep the NAT mapping towards every peer we dial open
        for peer in plan.peers.iter_mut().filter(|p| p.endpoint.is_some()) {
            peer.persistent_keepalive = Some(NAT_KEEPALIVE_SECS);
        }
    }

    debug!(
        prefix = %local.prefix,
        role = %role,
        peers = plan.peers.len(),
        routes = plan.routes.len(),
        "Planned network resource"
    );
    Ok(plan)
}

/// Exit hub: one scoped peer and one direct route per hidden resource.
///
/// Public and neutral peers are left alone; the exit relays, it is not a
/// gateway between them.
pub fn plan_exit_hub(local: &NetResource, network: &Network, partition: &Partition) -> Result<Plan> {
    let mut plan = Plan::default();

    for peer in tunnel_peers(local) {
        if !partition.is_hidden(&peer.prefix) {
            continue;
        }
        let nibble = Nibble::new(&peer.prefix, network.allocation_nr)?;
        plan.peers.push(scoped_peer(peer, &nibble, None));
        plan.routes.push(route_via(peer.prefix, nibble.link_local()));
    }

    Ok(plan)
}

/// Public node: a scoped peer for every tunnel peer, with an endpoint only
/// when that peer is public itself, and a direct route to all but the exit.
pub fn plan_public(local: &NetResource, network: &Network, partition: &Partition) -> Result<Plan> {
    let mut plan = Plan::default();

    for peer in tunnel_peers(local) {
        let nibble = Nibble::new(&peer.prefix, network.allocation_nr)?;
        let endpoint = if partition.is_public(&peer.prefix) {
            peer.connection.endpoint()
        } else {
            None
        };
        plan.peers.push(scoped_peer(peer, &nibble, endpoint));

        // the exit route comes from the default route strategy
        if peer.prefix == network.exit_prefix {
            continue;
        }
        plan.routes.push(route_via(peer.prefix, nibble.link_local()));
    }

    Ok(plan)
}

/// Hidden or neutral node.
///
/// Same as the public strategy for peers that are not hidden. Hidden peers
/// get no WireGuard entry at all: their prefixes are routed via the exit,
/// so two NATed resources never try to reach each other directly.
pub fn plan_relayed(local: &NetResource, network: &Network, partition: &Partition) -> Result<Plan> {
    let mut plan = Plan::default();
    let exit = Nibble::new(&network.exit_prefix, network.allocation_nr)?;

    for peer in tunnel_peers(local) {
        if peer.prefix == network.exit_prefix {
            let nibble = Nibble::new(&peer.prefix, network.allocation_nr)?;
            plan.peers.push(scoped_peer(peer, &nibble, public_endpoint(peer, partition)));
            continue;
        }

        if partition.is_hidden(&peer.prefix) {
            debug!(prefix = %peer.prefix, exit = %network.exit_prefix, "Relaying hidden peer through exit");
            plan.routes.push(route_via(peer.prefix, exit.link_local()));
            continue;
        }

        let nibble = Nibble::new(&peer.prefix, network.allocation_nr)?;
        plan.peers.push(scoped_peer(peer, &nibble, public_endpoint(peer, partition)));
        plan.routes.push(route_via(peer.prefix, nibble.link_local()));
    }

    Ok(plan)
}

/// Default route through the exit.
///
/// The exit becomes a catch-all peer. A non-exit resource also gets an IPv6
/// default route and two IPv4 routes (the exit's segment and the IPv4
/// default). On the exit itself this plan is empty.
pub fn plan_default_route(local: &NetResource, network: &Network) -> Result<Plan> {
    if network.is_exit(local) {
        return Ok(Plan::default());
    }

    let exit_peer = local
        .peer(&network.exit_prefix)
        .filter(|p| p.connection_type == ConnectionType::Wireguard)
        .ok_or_else(|| {
            Error::Planning(format!(
                "exit {} of network {} missing from peers of {}",
                network.exit_prefix, network.name, local.prefix
            ))
        })?;

    let nibble = Nibble::new(&exit_peer.prefix, network.allocation_nr)?;
    let gateway_v4 = IpAddr::V4(nibble.tunnel_v4());
    let (any_v4, any_v6) = (any_v4()?, any_v6()?);

    Ok(Plan {
        peers: vec![WgPeer {
            public_key: exit_peer.connection.public_key.clone(),
            endpoint: exit_peer.connection.endpoint(),
            allowed_ips: vec![any_v4, any_v6],
            persistent_keepalive: None,
        }],
        routes: vec![
            route_via(any_v6, nibble.link_local()),
            Route {
                destination: nibble.segment_v4(),
                gateway: gateway_v4,
            },
            Route {
                destination: any_v4,
                gateway: gateway_v4,
            },
        ],
    })
}

/// WireGuard peers of `local`, never including itself
fn tunnel_peers(local: &NetResource) -> impl Iterator<Item = &Peer> {
    local.peers.iter().filter(move |p| {
        p.connection_type == ConnectionType::Wireguard && p.prefix != local.prefix
    })
}

fn public_endpoint(peer: &Peer, partition: &Partition) -> Option<std::net::SocketAddr> {
    if partition.is_public(&peer.prefix) {
        peer.connection.endpoint()
    } else {
        None
    }
}

/// Peer limited to the resource's link-local, tunnel IPv4 and prefix
fn scoped_peer(peer: &Peer, nibble: &Nibble, endpoint: Option<std::net::SocketAddr>) -> WgPeer {
    WgPeer {
        public_key: peer.connection.public_key.clone(),
        endpoint,
        allowed_ips: vec![nibble.link_local_net(), nibble.tunnel_v4_host(), peer.prefix],
        persistent_keepalive: None,
    }
}

fn route_via(destination: IpNetwork, link_local: Ipv6Addr) -> Route {
    Route {
        destination,
        gateway: IpAddr::V6(link_local),
    }
}

fn any_v4() -> Result<IpNetwork> {
    Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0)
        .map(IpNetwork::V4)
        .map_err(|e| Error::Internal(format!("IPv4 default route: {}", e)))
}

fn any_v6() -> Result<IpNetwork> {
    Ipv6Network::new(Ipv6Addr::UNSPECIFIED, 0)
        .map(IpNetwork::V6)
        .map_err(|e| Error::Internal(format!("IPv6 default route: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Connection, NodeId, Reachability};

    const ALLOC: u8 = 1;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    fn node(id: &str, r: Reachability) -> NodeId {
        NodeId::new(id, r, r)
    }

    fn peer_to(prefix: &str, key: &str, endpoint: Option<&str>) -> Peer {
        let (ip, port) = match endpoint {
            Some(e) => {
                let addr: std::net::SocketAddr = e.parse().unwrap();
                (Some(addr.ip()), addr.port())
            }
            None => (None, 0),
        };
        Peer {
            prefix: net(prefix),
            connection_type: ConnectionType::Wireguard,
            connection: Connection {
                public_key: key.to_string(),
                ip,
                port,
            },
        }
    }

    fn resource(id: &str, r: Reachability, prefix: &str, peers: Vec<Peer>) -> NetResource {
        let nibble = Nibble::parse(prefix, ALLOC).unwrap();
        NetResource {
            node_id: node(id, r),
            prefix: net(prefix),
            link_local: IpNetwork::new(IpAddr::V6(nibble.link_local()), 64).unwrap(),
            peers,
        }
    }

    const A: &str = "2001:db8:1::/64";
    const B: &str = "2001:db8:2::/64";
    const C: &str = "2001:db8:3::/64";
    const D: &str = "2001:db8:4::/64";

    /// A public exit, B and C hidden, D public
    fn four_node_network() -> Network {
        use Reachability::*;
        let all = |except: &str| {
            [
                (A, "key-a", Some("198.51.100.1:51820")),
                (B, "key-b", None),
                (C, "key-c", None),
                (D, "key-d", Some("[2001:db8:ffff::4]:51820")),
            ]
            .into_iter()
            .filter(|(p, _, _)| *p != except)
            .map(|(p, k, e)| peer_to(p, k, e))
            .collect::<Vec<_>>()
        };
        Network {
            name: "mesh".into(),
            allocation_nr: ALLOC,
            exit_prefix: net(A),
            resources: vec![
                resource("a", Public, A, all(A)),
                resource("b", Hidden, B, all(B)),
                resource("c", Hidden, C, all(C)),
                resource("d", Public, D, all(D)),
            ],
        }
    }

    fn local<'a>(network: &'a Network, id: &str) -> &'a NetResource {
        network.local_resource(id).unwrap()
    }

    #[test]
    fn test_role_selection() {
        let network = four_node_network();
        assert_eq!(Role::of(local(&network, "a"), &network), Role::Exit);
        assert_eq!(Role::of(local(&network, "b"), &network), Role::Hidden);
        assert_eq!(Role::of(local(&network, "d"), &network), Role::Public);

        let mut neutral = local(&network, "d").clone();
        neutral.node_id = node("d", Reachability::Unknown);
        assert_eq!(Role::of(&neutral, &network), Role::Generic);
    }

    #[test]
    fn test_two_node_scenario() {
        use Reachability::*;
        let network = Network {
            name: "pair".into(),
            allocation_nr: ALLOC,
            exit_prefix: net(A),
            resources: vec![
                resource("a", Public, A, vec![peer_to(B, "key-b", None)]),
                resource("b", Hidden, B, vec![peer_to(A, "key-a", Some("198.51.100.1:51820"))]),
            ],
        };

        let b_plan = plan(local(&network, "b"), &network).unwrap();
        assert_eq!(b_plan.peers.len(), 1);
        assert_eq!(b_plan.peers[0].public_key, "key-a");
        assert_eq!(b_plan.peers[0].allowed_ips, vec![net("0.0.0.0/0"), net("::/0")]);
        assert_eq!(b_plan.peers[0].endpoint, Some("198.51.100.1:51820".parse().unwrap()));

        let a_nibble = Nibble::parse(A, ALLOC).unwrap();
        let expected = vec![
            route_via(net("::/0"), a_nibble.link_local()),
            Route {
                destination: a_nibble.segment_v4(),
                gateway: IpAddr::V4(a_nibble.tunnel_v4()),
            },
            Route {
                destination: net("0.0.0.0/0"),
                gateway: IpAddr::V4(a_nibble.tunnel_v4()),
            },
        ];
        assert_eq!(b_plan.routes, expected);

        let a_plan = plan(local(&network, "a"), &network).unwrap();
        let b_nibble = Nibble::parse(B, ALLOC).unwrap();
        assert_eq!(a_plan.peers.len(), 1);
        assert_eq!(
            a_plan.peers[0].allowed_ips,
            vec![b_nibble.link_local_net(), b_nibble.tunnel_v4_host(), net(B)]
        );
        assert_eq!(a_plan.peers[0].endpoint, None);
        assert_eq!(a_plan.routes, vec![route_via(net(B), b_nibble.link_local())]);
    }

    #[test]
    fn test_exit_hub_only_serves_hidden_peers() {
        let network = four_node_network();
        let plan = plan(local(&network, "a"), &network).unwrap();

        let keys: Vec<_> = plan.peers.iter().map(|p| p.public_key.as_str()).collect();
        assert_eq!(keys, vec!["key-b", "key-c"]);

        // every route goes straight to the hidden peer that owns it
        for route in &plan.routes {
            let owner = Nibble::new(&route.destination, ALLOC).unwrap();
            assert_eq!(route.gateway, IpAddr::V6(owner.link_local()));
        }
        assert!(plan.routes.iter().all(|r| r.destination != net("::/0")));
    }

    #[test]
    fn test_public_never_gives_endpoint_to_non_public_peer() {
        let network = four_node_network();
        let partition = reachability::partition(&network.resources);
        let plan = plan_public(local(&network, "d"), &network, &partition).unwrap();

        assert_eq!(plan.peers.len(), 3);
        for peer in &plan.peers {
            let is_public = peer.public_key == "key-a";
            assert_eq!(peer.endpoint.is_some(), is_public, "{}", peer.public_key);
        }
        // direct routes for B and C, none for the exit
        let dests: Vec<_> = plan.routes.iter().map(|r| r.destination).collect();
        assert_eq!(dests, vec![net(B), net(C)]);
    }

    #[test]
    fn test_hidden_routes_hidden_peers_through_exit() {
        let network = four_node_network();
        let plan = plan(local(&network, "b"), &network).unwrap();
        let exit = Nibble::parse(A, ALLOC).unwrap();

        // no WireGuard entry for the other hidden node
        assert!(plan.peers.iter().all(|p| p.public_key != "key-c"));

        let to_c = plan.routes.iter().find(|r| r.destination == net(C)).unwrap();
        assert_eq!(to_c.gateway, IpAddr::V6(exit.link_local()));

        let to_d = plan.routes.iter().find(|r| r.destination == net(D)).unwrap();
        let d = Nibble::parse(D, ALLOC).unwrap();
        assert_eq!(to_d.gateway, IpAddr::V6(d.link_local()));

        let d_peer = plan.peers.iter().find(|p| p.public_key == "key-d").unwrap();
        assert!(d_peer.endpoint.is_some());
        assert_eq!(d_peer.persistent_keepalive, Some(NAT_KEEPALIVE_SECS));
    }

    #[test]
    fn test_default_route_counts() {
        let network = four_node_network();

        let non_exit = plan_default_route(local(&network, "d"), &network).unwrap();
        let v6 = non_exit.routes.iter().filter(|r| r.destination == net("::/0")).count();
        let v4 = non_exit.routes.iter().filter(|r| r.destination.is_ipv4()).count();
        assert_eq!(v6, 1);
        assert_eq!(v4, 2);

        let exit = plan_default_route(local(&network, "a"), &network).unwrap();
        assert!(exit.routes.is_empty());
        assert!(exit.peers.is_empty());
    }

    #[test]
    fn test_missing_exit_peer_is_fatal() {
        let mut network = four_node_network();
        network.resources[1].peers.retain(|p| p.prefix != net(A));
        let err = plan(local(&network, "b"), &network).unwrap_err();
        assert!(matches!(err, Error::Planning(_)));
    }

    #[test]
    fn test_self_prefix_excluded_everywhere() {
        let mut network = four_node_network();
        for resource in &mut network.resources {
            let own = resource.prefix;
            resource.peers.push(peer_to(&own.to_string(), "self-key", Some("192.0.2.9:1")));
        }

        for id in ["a", "b", "d"] {
            let resource = local(&network, id);
            let plan = plan(resource, &network).unwrap();
            assert!(plan.peers.iter().all(|p| p.public_key != "self-key"));
            assert!(plan.routes.iter().all(|r| r.destination != resource.prefix));
        }
    }

    #[test]
    fn test_non_tunnel_peers_ignored() {
        let mut network = four_node_network();
        for peer in &mut network.resources[3].peers {
            if peer.prefix == net(B) {
                peer.connection_type = ConnectionType::Local;
            }
        }
        let plan = plan(local(&network, "d"), &network).unwrap();
        assert!(plan.peers.iter().all(|p| p.public_key != "key-b"));
        assert!(plan.routes.iter().all(|r| r.destination != net(B)));
    }

    #[test]
    fn test_bad_peer_prefix_is_address_error() {
        let mut network = four_node_network();
        network.resources[3].peers.push(peer_to("10.0.0.0/24", "v4", None));
        let err = plan(local(&network, "d"), &network).unwrap_err();
        assert!(matches!(err, Error::Address(_)));
    }
}
