//! Mesh apply
//!
//! Makes a computed [`Plan`] live inside a resource's namespace: key
//! material, tunnel addresses, the full peer list in one configuration call,
//! then routes. Re-applying an unchanged plan is a no-op; a route whose
//! gateway changed is replaced.

use crate::backend::Backend;
use crate::error::ApplyOperation;
use crate::keys::KeyStore;
use crate::netns::{with_namespace, NamespaceLocks};
use crate::nibble::Nibble;
use crate::types::{NetResource, Network, Plan};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Applies planned peers and routes to a provisioned resource
pub struct MeshApplier {
    backend: Arc<dyn Backend>,
    locks: Arc<NamespaceLocks>,
    keys: KeyStore,
}

impl MeshApplier {
    pub fn new(backend: Arc<dyn Backend>, locks: Arc<NamespaceLocks>, keys: KeyStore) -> Self {
        Self {
            backend,
            locks,
            keys,
        }
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn apply(&self, resource: &NetResource, network: &Network, plan: &Plan) -> Result<()> {
        let nibble = Nibble::new(&resource.prefix, network.allocation_nr)?;
        let prefix = resource.prefix;
        let namespace = nibble.network_name();
        let wg_name = nibble.wireguard_name();
        let backend = self.backend.as_ref();

        let key = self
            .keys
            .load_or_generate(&nibble)
            .map_err(|e| Error::apply(prefix, ApplyOperation::Key, e))?;
        let listen_port = network.listen_port(resource);
        info!(
            wg = %wg_name,
            public_key = %key.public_key(),
            listen_port = ?listen_port,
            "Using wireguard key"
        );

        with_namespace(backend, &self.locks, &namespace, || {
            let wg = backend
                .link_by_name(&wg_name)
                .map_err(|e| Error::apply(prefix, ApplyOperation::Configure, e))?;

            for address in [resource.link_local, nibble.tunnel_v4_iface()] {
                match backend.add_address(&wg.name, address) {
                    Ok(()) => info!(wg = %wg.name, addr = %address, "Set address on wireguard"),
                    Err(e) if e.is_already_exists() => {
                        warn!(wg = %wg.name, addr = %address, "Address already assigned")
                    }
                    Err(e) => return Err(Error::apply(prefix, ApplyOperation::Address, e)),
                }
            }

            info!(wg = %wg.name, peers = plan.peers.len(), "Configuring wireguard interface");
            backend
                .configure(&wg.name, &key, listen_port, &plan.peers)
                .and_then(|_| backend.set_up(&wg.name))
                .map_err(|e| Error::apply(prefix, ApplyOperation::Configure, e))?;

            for route in &plan.routes {
                match backend.add_route(route, &wg) {
                    Ok(()) => info!(route = %route, link_index = wg.index, "Route installed"),
                    Err(e) => {
                        error!(route = %route, link_index = wg.index, "Failed to set route: {}", e);
                        return Err(Error::apply(prefix, ApplyOperation::Route, e));
                    }
                }
            }

            Ok(())
        })
        .map_err(|e| match e {
            Error::Apply { .. } => e,
            other => Error::apply(prefix, ApplyOperation::EnterNamespace, other),
        })
    }
}
