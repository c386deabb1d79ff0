//! OS capabilities consumed by provisioning and apply
//!
//! Three capability sets, implemented by the host kernel stack through
//! [`host::HostBackend`] and in memory by [`memory::RecordingBackend`]. All
//! link, address and route operations act on the calling thread's current
//! namespace.
//!
//! Creating something that already exists reports
//! [`Error::AlreadyExists`](crate::Error::AlreadyExists); removing something
//! that is gone reports [`Error::NotFound`](crate::Error::NotFound). Callers
//! decide which of those are benign.

pub mod host;
pub mod memory;

use crate::keys::WgPrivateKey;
use crate::netns::NamespaceGuard;
use crate::types::{Route, WgPeer};
use crate::Result;
use ipnetwork::IpNetwork;

/// Name used for the host namespace in logs and by the recording backend
pub const HOST_NAMESPACE: &str = "<host>";

/// A link resolved in the current namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub index: u32,
}

/// Network namespace operations
pub trait NamespaceOps: Send + Sync {
    fn namespace_exists(&self, name: &str) -> bool;

    fn create_namespace(&self, name: &str) -> Result<()>;

    fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Switch the calling thread into `name` until the guard is dropped.
    ///
    /// A thread whose previous namespace cannot be restored must not be
    /// reused; [`host::HostBackend`] aborts the process in that case.
    fn enter(&self, name: &str) -> Result<NamespaceGuard<'_>>;

    /// Write a sysctl of the current namespace, e.g. `net.ipv6.conf.all.forwarding`
    fn set_sysctl(&self, key: &str, value: &str) -> Result<()>;
}

/// Link, address and route operations
pub trait LinkOps: Send + Sync {
    fn link_by_name(&self, name: &str) -> Result<Link>;

    fn link_exists(&self, name: &str) -> bool {
        self.link_by_name(name).is_ok()
    }

    fn create_bridge(&self, name: &str) -> Result<()>;

    /// Create a veth pair whose end `name` stays in the current namespace.
    ///
    /// The other end gets a generated name and is moved to the host
    /// namespace. Returns that generated name.
    fn create_veth(&self, name: &str, mtu: u16) -> Result<String>;

    fn attach_to_bridge(&self, link: &str, bridge: &str) -> Result<()>;

    /// Move a link of the current namespace into the named namespace
    fn move_to_namespace(&self, link: &str, namespace: &str) -> Result<()>;

    fn set_up(&self, link: &str) -> Result<()>;

    fn delete_link(&self, link: &str) -> Result<()>;

    fn add_address(&self, link: &str, address: IpNetwork) -> Result<()>;

    /// Install `route` on `link`, replacing any route to the same destination
    fn add_route(&self, route: &Route, link: &Link) -> Result<()>;
}

/// WireGuard interface operations
pub trait WireGuardOps: Send + Sync {
    fn create_wireguard(&self, name: &str) -> Result<()>;

    /// Replace the key, listen port and whole peer list of `name` in one call
    fn configure(
        &self,
        name: &str,
        private_key: &WgPrivateKey,
        listen_port: Option<u16>,
        peers: &[WgPeer],
    ) -> Result<()>;
}

/// Everything the provisioner and the applier need
pub trait Backend: NamespaceOps + LinkOps + WireGuardOps {}

impl<T: NamespaceOps + LinkOps + WireGuardOps> Backend for T {}
