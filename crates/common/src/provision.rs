//! Namespace provisioning
//!
//! Materializes the OS objects of one network resource before any
//! WireGuard configuration happens. The work runs as a linear pipeline of
//! named stages; the first failing stage aborts with a provisioning error
//! naming it. Nothing is rolled back automatically, see
//! [`NamespaceProvisioner::teardown`].

use crate::backend::{Backend, HOST_NAMESPACE};
use crate::netns::{with_namespace, NamespaceLocks};
use crate::nibble::Nibble;
use crate::types::{NetResource, Network};
use crate::{Error, Result};
use ipnetwork::IpNetwork;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default name of the host-wide public namespace
pub const PUBLIC_NAMESPACE: &str = "public";

/// Default veth MTU
pub const DEFAULT_MTU: u16 = 1500;

/// Provisioning pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Bridge,
    Namespace,
    Veth,
    Attach,
    Tunnel,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Bridge => write!(f, "bridge"),
            Stage::Namespace => write!(f, "namespace"),
            Stage::Veth => write!(f, "veth"),
            Stage::Attach => write!(f, "attach"),
            Stage::Tunnel => write!(f, "tunnel"),
        }
    }
}

/// OS objects backing a provisioned resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub namespace: String,
    pub bridge: String,
    pub wireguard: String,
    /// Host end of the veth pair; unknown when an existing namespace was reused
    pub host_veth: Option<String>,
    /// Namespace the tunnel was created in before moving it
    pub tunnel_origin: Option<String>,
    pub reused: bool,
}

/// Builds namespace, bridge, veth pair and bare tunnel for a resource
pub struct NamespaceProvisioner {
    backend: Arc<dyn Backend>,
    locks: Arc<NamespaceLocks>,
    public_namespace: String,
    mtu: u16,
}

impl NamespaceProvisioner {
    pub fn new(backend: Arc<dyn Backend>, locks: Arc<NamespaceLocks>) -> Self {
        Self {
            backend,
            locks,
            public_namespace: PUBLIC_NAMESPACE.to_string(),
            mtu: DEFAULT_MTU,
        }
    }

    pub fn with_public_namespace(mut self, name: impl Into<String>) -> Self {
        self.public_namespace = name.into();
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn public_namespace(&self) -> &str {
        &self.public_namespace
    }

    /// Run the provisioning pipeline for `resource`.
    ///
    /// A namespace that already holds the resource's veth and tunnel is
    /// reused as is. One that exists with only part of them is an error;
    /// the caller must tear it down first.
    pub fn provision(&self, resource: &NetResource, network: &Network) -> Result<Provisioned> {
        let nibble = Nibble::new(&resource.prefix, network.allocation_nr)?;
        let prefix = resource.prefix;
        let namespace = nibble.network_name();
        let bridge = nibble.bridge_name();
        let veth = nibble.veth_name();
        let wireguard = nibble.wireguard_name();
        let backend = self.backend.as_ref();

        // Bridge
        info!(bridge = %bridge, "Creating bridge");
        match backend.create_bridge(&bridge) {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                warn!(bridge = %bridge, "Bridge already exists, reusing");
            }
            Err(e) => return Err(stage_failed(&prefix, Stage::Bridge, e)),
        }

        // Namespace
        if backend.namespace_exists(&namespace) {
            let complete = with_namespace(backend, &self.locks, &namespace, || {
                Ok(backend.link_exists(&veth) && backend.link_exists(&wireguard))
            })
            .map_err(|e| stage_failed(&prefix, Stage::Namespace, e))?;

            if !complete {
                return Err(Error::provisioning(
                    prefix,
                    Stage::Namespace,
                    format!(
                        "namespace {} exists with partial contents, tear it down first",
                        namespace
                    ),
                ));
            }

            info!(namespace = %namespace, "Namespace already provisioned, reusing");
            return Ok(Provisioned {
                namespace,
                bridge,
                wireguard,
                host_veth: None,
                tunnel_origin: None,
                reused: true,
            });
        }

        info!(namespace = %namespace, "Creating namespace");
        backend
            .create_namespace(&namespace)
            .map_err(|e| stage_failed(&prefix, Stage::Namespace, e))?;

        // Veth
        let segment_gateway = nibble.segment_v4_gateway();
        let host_veth = with_namespace(backend, &self.locks, &namespace, || {
            backend.set_sysctl("net.ipv6.conf.all.forwarding", "1")?;

            info!(namespace = %namespace, veth = %veth, "Creating veth pair in namespace");
            let host_veth = backend.create_veth(&veth, self.mtu)?;

            for address in [prefix, segment_gateway] {
                info!(veth = %veth, addr = %address, "Setting address on veth");
                add_address(backend, &veth, address)?;
            }
            backend.set_up(&veth)?;
            Ok(host_veth)
        })
        .map_err(|e| stage_failed(&prefix, Stage::Veth, e))?;

        // Attach
        info!(veth = %host_veth, bridge = %bridge, "Attaching veth to bridge");
        backend
            .attach_to_bridge(&host_veth, &bridge)
            .and_then(|_| backend.set_up(&host_veth))
            .and_then(|_| backend.set_up(&bridge))
            .map_err(|e| stage_failed(&prefix, Stage::Attach, e))?;

        // Tunnel
        let create_and_move = || -> Result<()> {
            info!(wg = %wireguard, "Creating wireguard interface");
            backend.create_wireguard(&wireguard)?;
            info!(wg = %wireguard, namespace = %namespace, "Moving wireguard into resource namespace");
            backend.move_to_namespace(&wireguard, &namespace)
        };

        let tunnel_origin = if backend.namespace_exists(&self.public_namespace) {
            debug!(namespace = %self.public_namespace, "Public namespace present");
            with_namespace(backend, &self.locks, &self.public_namespace, create_and_move)
                .map_err(|e| stage_failed(&prefix, Stage::Tunnel, e))?;
            self.public_namespace.clone()
        } else {
            create_and_move().map_err(|e| stage_failed(&prefix, Stage::Tunnel, e))?;
            HOST_NAMESPACE.to_string()
        };

        Ok(Provisioned {
            namespace,
            bridge,
            wireguard,
            host_veth: Some(host_veth),
            tunnel_origin: Some(tunnel_origin),
            reused: false,
        })
    }

    /// Remove every OS object of `resource`.
    ///
    /// Deleting the namespace takes the veth pair and the tunnel with it. A
    /// tunnel stranded in the host or public namespace by an aborted
    /// provisioning is removed too, then the bridge. All steps run; missing
    /// objects are fine and the remaining failures are reported together.
    pub fn teardown(&self, resource: &NetResource, network: &Network) -> Result<()> {
        let nibble = Nibble::new(&resource.prefix, network.allocation_nr)?;
        let namespace = nibble.network_name();
        let bridge = nibble.bridge_name();
        let wireguard = nibble.wireguard_name();
        let backend = self.backend.as_ref();
        let mut failures = Vec::new();

        info!(namespace = %namespace, "Deleting namespace");
        note(
            &mut failures,
            format!("namespace {}", namespace),
            backend.delete_namespace(&namespace),
        );

        note(
            &mut failures,
            format!("wireguard {}", wireguard),
            backend.delete_link(&wireguard),
        );
        if backend.namespace_exists(&self.public_namespace) {
            let result = with_namespace(backend, &self.locks, &self.public_namespace, || {
                backend.delete_link(&wireguard)
            });
            note(
                &mut failures,
                format!("wireguard {} in {}", wireguard, self.public_namespace),
                result,
            );
        }

        info!(bridge = %bridge, "Deleting bridge");
        note(&mut failures, format!("bridge {}", bridge), backend.delete_link(&bridge));

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Cleanup(failures))
        }
    }
}

fn stage_failed(prefix: &IpNetwork, stage: Stage, e: Error) -> Error {
    warn!(prefix = %prefix, stage = %stage, "Provisioning aborted: {}", e);
    Error::provisioning(prefix, stage, e)
}

fn add_address(backend: &dyn Backend, link: &str, address: IpNetwork) -> Result<()> {
    match backend.add_address(link, address) {
        Err(e) if e.is_already_exists() => {
            warn!(link = %link, addr = %address, "Address already assigned");
            Ok(())
        }
        other => other,
    }
}

fn note(failures: &mut Vec<String>, what: String, result: Result<()>) {
    match result {
        Ok(()) => debug!("Removed {}", what),
        Err(e) if e.is_not_found() => debug!("{} already gone", what),
        Err(e) => {
            warn!("Failed to remove {}: {}", what, e);
            failures.push(format!("{}: {}", what, e));
        }
    }
}
