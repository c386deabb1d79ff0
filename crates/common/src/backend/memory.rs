//! In-memory backend
//!
//! Models namespaces, links, addresses, routes and WireGuard configuration
//! closely enough to drive provisioning and apply without privileges. Every
//! call is recorded, and individual operations can be made to fail.

use super::{Link, LinkOps, NamespaceOps, WireGuardOps, HOST_NAMESPACE};
use crate::keys::WgPrivateKey;
use crate::netns::NamespaceGuard;
use crate::types::{Route, WgPeer};
use crate::{Error, Result};
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::thread::{self, ThreadId};

/// Kind of a recorded link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Veth,
    Wireguard,
}

/// A link as the backend currently sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    pub kind: LinkKind,
    pub index: u32,
    pub mtu: Option<u16>,
    pub master: Option<String>,
    pub up: bool,
    pub addresses: Vec<IpNetwork>,
    /// Other end of a veth pair
    pub peer: Option<String>,
}

/// Last configuration written to a WireGuard link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireGuardRecord {
    pub public_key: String,
    pub listen_port: Option<u16>,
    pub peers: Vec<WgPeer>,
}

/// One recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedOp {
    pub namespace: String,
    pub op: &'static str,
    pub target: String,
}

#[derive(Default)]
struct State {
    namespaces: BTreeSet<String>,
    links: BTreeMap<(String, String), LinkRecord>,
    routes: Vec<(String, String, Route)>,
    wireguard: HashMap<(String, String), WireGuardRecord>,
    sysctls: HashMap<(String, String), String>,
    current: HashMap<ThreadId, Vec<String>>,
    ops: Vec<RecordedOp>,
    fail_on: HashSet<&'static str>,
    fail_once: HashSet<&'static str>,
    next_index: u32,
}

impl State {
    fn current(&self) -> String {
        self.current
            .get(&thread::current().id())
            .and_then(|stack| stack.last().cloned())
            .unwrap_or_else(|| HOST_NAMESPACE.to_string())
    }

    fn has_namespace(&self, name: &str) -> bool {
        name == HOST_NAMESPACE || self.namespaces.contains(name)
    }

    fn record(&mut self, op: &'static str, target: &str) -> Result<String> {
        let namespace = self.current();
        self.ops.push(RecordedOp {
            namespace: namespace.clone(),
            op,
            target: target.to_string(),
        });
        if self.fail_on.contains(op) || self.fail_once.remove(op) {
            return Err(Error::Command {
                command: format!("{} {}", op, target),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(namespace)
    }

    fn next_index(&mut self) -> u32 {
        self.next_index += 1;
        self.next_index
    }

    fn add_link(&mut self, ns: &str, name: &str, record: LinkRecord) -> Result<()> {
        let key = (ns.to_string(), name.to_string());
        if self.links.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: "link".to_string(),
                id: name.to_string(),
            });
        }
        self.links.insert(key, record);
        Ok(())
    }

    fn link_mut(&mut self, ns: &str, name: &str) -> Result<&mut LinkRecord> {
        self.links
            .get_mut(&(ns.to_string(), name.to_string()))
            .ok_or_else(|| Error::NotFound {
                kind: "link".to_string(),
                id: name.to_string(),
            })
    }

    /// Drop a link and whatever the kernel drops with it
    fn remove_link(&mut self, ns: &str, name: &str) {
        let key = (ns.to_string(), name.to_string());
        let Some(record) = self.links.remove(&key) else {
            return;
        };
        self.routes.retain(|(n, l, _)| !(n == ns && l == name));
        self.wireguard.remove(&key);
        for (_, link) in self.links.iter_mut() {
            if link.master.as_deref() == Some(name) {
                link.master = None;
            }
        }
        if let Some(peer) = record.peer {
            let peer_key = self
                .links
                .iter()
                .find(|((_, n), l)| n == &peer && l.peer.as_deref() == Some(name))
                .map(|(k, _)| k.clone());
            if let Some((peer_ns, peer_name)) = peer_key {
                self.remove_link(&peer_ns, &peer_name);
            }
        }
    }
}

/// Backend that keeps all state in memory
#[derive(Default)]
pub struct RecordingBackend {
    state: Mutex<State>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create a namespace, as if made outside this process
    pub fn add_namespace(&self, name: &str) {
        self.state.lock().namespaces.insert(name.to_string());
    }

    /// Namespace the calling thread is in
    pub fn current_namespace(&self) -> String {
        self.state.lock().current()
    }

    /// Make every later call of `op` fail with a command error
    pub fn fail_on(&self, op: &'static str) {
        self.state.lock().fail_on.insert(op);
    }

    /// Make only the next call of `op` fail
    pub fn fail_once(&self, op: &'static str) {
        self.state.lock().fail_once.insert(op);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_on.clear();
        state.fail_once.clear();
    }

    pub fn ops(&self) -> Vec<RecordedOp> {
        self.state.lock().ops.clone()
    }

    /// Number of recorded calls of `op`
    pub fn count(&self, op: &str) -> usize {
        self.state.lock().ops.iter().filter(|o| o.op == op).count()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.state.lock().namespaces.iter().cloned().collect()
    }

    /// Names of the links in `namespace`, sorted
    pub fn links_in(&self, namespace: &str) -> Vec<String> {
        self.state
            .lock()
            .links
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn link(&self, namespace: &str, name: &str) -> Option<LinkRecord> {
        self.state
            .lock()
            .links
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn routes_in(&self, namespace: &str) -> Vec<Route> {
        self.state
            .lock()
            .routes
            .iter()
            .filter(|(ns, _, _)| ns == namespace)
            .map(|(_, _, route)| *route)
            .collect()
    }

    pub fn wireguard(&self, namespace: &str, name: &str) -> Option<WireGuardRecord> {
        self.state
            .lock()
            .wireguard
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn sysctl(&self, namespace: &str, key: &str) -> Option<String> {
        self.state
            .lock()
            .sysctls
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }
}

impl NamespaceOps for RecordingBackend {
    fn namespace_exists(&self, name: &str) -> bool {
        self.state.lock().has_namespace(name)
    }

    fn create_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record("create_namespace", name)?;
        if state.has_namespace(name) {
            return Err(Error::AlreadyExists {
                kind: "namespace".to_string(),
                id: name.to_string(),
            });
        }
        state.namespaces.insert(name.to_string());
        Ok(())
    }

    fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record("delete_namespace", name)?;
        if !state.namespaces.remove(name) {
            return Err(Error::NotFound {
                kind: "namespace".to_string(),
                id: name.to_string(),
            });
        }
        let doomed: Vec<String> = state
            .links
            .keys()
            .filter(|(ns, _)| ns == name)
            .map(|(_, link)| link.clone())
            .collect();
        for link in doomed {
            state.remove_link(name, &link);
        }
        state.sysctls.retain(|(ns, _), _| ns != name);
        Ok(())
    }

    fn enter(&self, name: &str) -> Result<NamespaceGuard<'_>> {
        let mut state = self.state.lock();
        state.record("enter", name)?;
        if !state.has_namespace(name) {
            return Err(Error::NotFound {
                kind: "namespace".to_string(),
                id: name.to_string(),
            });
        }
        state
            .current
            .entry(thread::current().id())
            .or_default()
            .push(name.to_string());

        Ok(NamespaceGuard::new(name, move || {
            let mut state = self.state.lock();
            if let Some(stack) = state.current.get_mut(&thread::current().id()) {
                stack.pop();
            }
            Ok(())
        }))
    }

    fn set_sysctl(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock();
        let ns = state.record("set_sysctl", key)?;
        state.sysctls.insert((ns, key.to_string()), value.to_string());
        Ok(())
    }
}

impl LinkOps for RecordingBackend {
    fn link_by_name(&self, name: &str) -> Result<Link> {
        let mut state = self.state.lock();
        let ns = state.current();
        let index = state.link_mut(&ns, name)?.index;
        Ok(Link {
            name: name.to_string(),
            index,
        })
    }

    fn create_bridge(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let ns = state.record("create_bridge", name)?;
        let index = state.next_index();
        state.add_link(
            &ns,
            name,
            LinkRecord {
                kind: LinkKind::Bridge,
                index,
                mtu: None,
                master: None,
                up: false,
                addresses: Vec::new(),
                peer: None,
            },
        )
    }

    fn create_veth(&self, name: &str, mtu: u16) -> Result<String> {
        let mut state = self.state.lock();
        let ns = state.record("create_veth", name)?;
        let local = state.next_index();
        let remote = state.next_index();
        let peer = format!("veth{:08x}", remote);

        state.add_link(
            &ns,
            name,
            LinkRecord {
                kind: LinkKind::Veth,
                index: local,
                mtu: Some(mtu),
                master: None,
                up: false,
                addresses: Vec::new(),
                peer: Some(peer.clone()),
            },
        )?;
        state.add_link(
            HOST_NAMESPACE,
            &peer,
            LinkRecord {
                kind: LinkKind::Veth,
                index: remote,
                mtu: Some(mtu),
                master: None,
                up: false,
                addresses: Vec::new(),
                peer: Some(name.to_string()),
            },
        )?;
        Ok(peer)
    }

    fn attach_to_bridge(&self, link: &str, bridge: &str) -> Result<()> {
        let mut state = self.state.lock();
        let ns = state.record("attach_to_bridge", link)?;
        if state.link_mut(&ns, bridge)?.kind != LinkKind::Bridge {
            return Err(Error::Command {
                command: format!("attach_to_bridge {}", link),
                stderr: format!("{} is not a bridge", bridge),
            });
        }
        state.link_mut(&ns, link)?.master = Some(bridge.to_string());
        Ok(())
    }

    fn move_to_namespace(&self, link: &str, namespace: &str) -> Result<()> {
        let mut state = self.state.lock();
        let ns = state.record("move_to_namespace", link)?;
        if !state.has_namespace(namespace) {
            return Err(Error::NotFound {
                kind: "namespace".to_string(),
                id: namespace.to_string(),
            });
        }
        let mut record = state.link_mut(&ns, link)?.clone();
        if state
            .links
            .contains_key(&(namespace.to_string(), link.to_string()))
        {
            return Err(Error::AlreadyExists {
                kind: "link".to_string(),
                id: link.to_string(),
            });
        }

        // the kernel resets these on a namespace move
        record.master = None;
        record.up = false;
        record.addresses.clear();

        let key = (ns.clone(), link.to_string());
        let wireguard = state.wireguard.remove(&key);
        state.links.remove(&key);
        state.routes.retain(|(n, l, _)| !(n == &ns && l == link));
        state.links.insert((namespace.to_string(), link.to_string()), record);
        if let Some(wg) = wireguard {
            state
                .wireguard
                .insert((namespace.to_string(), link.to_string()), wg);
        }
        Ok(())
    }

    fn set_up(&self, link: &str) -> Result<()> {
        let mut state = self.state.lock();
        let ns = state.record("set_up", link)?;
        state.link_mut(&ns, link)?.up = true;
        Ok(())
    }

    fn delete_link(&self, link: &str) -> Result<()> {
        let mut state = self.state.lock();
        let ns = state.record("delete_link", link)?;
        state.link_mut(&ns, link)?;
        state.remove_link(&ns, link);
        Ok(())
    }

    fn add_address(&self, link: &str, address: IpNetwork) -> Result<()> {
        let mut state = self.state.lock();
        let ns = state.record("add_address", link)?;
        let record = state.link_mut(&ns, link)?;
        if record.addresses.contains(&address) {
            return Err(Error::AlreadyExists {
                kind: "address".to_string(),
                id: address.to_string(),
            });
        }
        record.addresses.push(address);
        Ok(())
    }

    fn add_route(&self, route: &Route, link: &Link) -> Result<()> {
        let mut state = self.state.lock();
        let ns = state.record("add_route", &route.to_string())?;
        state.link_mut(&ns, &link.name)?;
        state
            .routes
            .retain(|(n, _, r)| !(n == &ns && r.destination == route.destination));
        state.routes.push((ns, link.name.clone(), *route));
        Ok(())
    }
}

impl WireGuardOps for RecordingBackend {
    fn create_wireguard(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let ns = state.record("create_wireguard", name)?;
        let index = state.next_index();
        state.add_link(
            &ns,
            name,
            LinkRecord {
                kind: LinkKind::Wireguard,
                index,
                mtu: None,
                master: None,
                up: false,
                addresses: Vec::new(),
                peer: None,
            },
        )
    }

    fn configure(
        &self,
        name: &str,
        private_key: &WgPrivateKey,
        listen_port: Option<u16>,
        peers: &[WgPeer],
    ) -> Result<()> {
        let mut state = self.state.lock();
        let ns = state.record("configure", name)?;
        if state.link_mut(&ns, name)?.kind != LinkKind::Wireguard {
            return Err(Error::Command {
                command: format!("configure {}", name),
                stderr: "Operation not supported".to_string(),
            });
        }
        state.wireguard.insert(
            (ns, name.to_string()),
            WireGuardRecord {
                public_key: private_key.public_key(),
                listen_port,
                peers: peers.to_vec(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_veth_peer_lands_in_host() {
        let backend = RecordingBackend::new();
        backend.add_namespace("blue");
        let _guard = backend.enter("blue").unwrap();

        let peer = backend.create_veth("veth-0001-1", 1500).unwrap();
        assert_eq!(backend.links_in("blue"), vec!["veth-0001-1".to_string()]);
        assert_eq!(
            backend.link(HOST_NAMESPACE, &peer).unwrap().peer.as_deref(),
            Some("veth-0001-1")
        );
    }

    #[test]
    fn test_duplicate_objects_report_already_exists() {
        let backend = RecordingBackend::new();
        backend.create_bridge("br0").unwrap();
        assert!(backend.create_bridge("br0").unwrap_err().is_already_exists());

        let link = backend.link_by_name("br0").unwrap();
        let route = Route {
            destination: "10.0.0.0/24".parse().unwrap(),
            gateway: "172.16.0.1".parse().unwrap(),
        };
        backend.add_route(&route, &link).unwrap();
        backend.add_route(&route, &link).unwrap();
        assert_eq!(backend.routes_in(HOST_NAMESPACE), vec![route]);
    }

    #[test]
    fn test_route_with_new_gateway_replaces_old() {
        let backend = RecordingBackend::new();
        backend.create_bridge("br0").unwrap();
        let link = backend.link_by_name("br0").unwrap();

        let old = Route {
            destination: "2001:db8:3::/64".parse().unwrap(),
            gateway: "fe80::2dba".parse().unwrap(),
        };
        let new = Route {
            gateway: "fe80::2db8".parse().unwrap(),
            ..old
        };
        backend.add_route(&old, &link).unwrap();
        backend.add_route(&new, &link).unwrap();
        assert_eq!(backend.routes_in(HOST_NAMESPACE), vec![new]);
    }

    #[test]
    fn test_missing_objects_report_not_found() {
        let backend = RecordingBackend::new();
        assert!(backend.delete_link("nope").unwrap_err().is_not_found());
        assert!(backend.delete_namespace("nope").unwrap_err().is_not_found());
        assert!(backend.enter("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_namespace_takes_veth_pair() {
        let backend = RecordingBackend::new();
        backend.create_namespace("blue").unwrap();
        let peer = {
            let _guard = backend.enter("blue").unwrap();
            backend.create_veth("v0", 1500).unwrap()
        };
        assert!(backend.link(HOST_NAMESPACE, &peer).is_some());

        backend.delete_namespace("blue").unwrap();
        assert!(backend.link(HOST_NAMESPACE, &peer).is_none());
    }

    #[test]
    fn test_move_resets_link_state() {
        let backend = RecordingBackend::new();
        backend.add_namespace("blue");
        backend.create_wireguard("wg0").unwrap();
        backend
            .add_address("wg0", "172.16.0.1/16".parse().unwrap())
            .unwrap();
        backend.set_up("wg0").unwrap();

        backend.move_to_namespace("wg0", "blue").unwrap();
        let moved = backend.link("blue", "wg0").unwrap();
        assert!(!moved.up);
        assert!(moved.addresses.is_empty());
        assert!(backend.link(HOST_NAMESPACE, "wg0").is_none());
    }

    #[test]
    fn test_fail_on_injects_and_records() {
        let backend = RecordingBackend::new();
        backend.fail_on("create_bridge");
        let err = backend.create_bridge("br0").unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
        assert_eq!(backend.count("create_bridge"), 1);
        assert!(backend.links_in(HOST_NAMESPACE).is_empty());

        backend.clear_failures();
        backend.create_bridge("br0").unwrap();
    }

    #[test]
    fn test_fail_once_recovers() {
        let backend = RecordingBackend::new();
        backend.fail_once("create_namespace");
        assert!(backend.create_namespace("blue").is_err());
        backend.create_namespace("blue").unwrap();
        assert_eq!(backend.namespaces(), vec!["blue".to_string()]);
    }
}
