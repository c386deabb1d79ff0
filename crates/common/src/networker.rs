//! Node-level entry point
//!
//! Runs validate, plan, provision and apply for the local resource of a
//! network and remembers what was applied. Nothing is created on the host
//! until the network has validated and planned cleanly.

use crate::apply::MeshApplier;
use crate::backend::Backend;
use crate::keys::KeyStore;
use crate::netns::NamespaceLocks;
use crate::planner;
use crate::provision::{NamespaceProvisioner, Provisioned};
use crate::types::{NetResource, Network, Plan};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};

/// Applies network resources for one node
pub struct Networker {
    node_id: String,
    provisioner: NamespaceProvisioner,
    applier: MeshApplier,
    applied: RwLock<HashMap<String, NetResource>>,
}

impl Networker {
    pub fn new(node_id: impl Into<String>, backend: Arc<dyn Backend>, keys: KeyStore) -> Self {
        let locks = Arc::new(NamespaceLocks::new());
        Self {
            node_id: node_id.into(),
            provisioner: NamespaceProvisioner::new(backend.clone(), locks.clone()),
            applier: MeshApplier::new(backend, locks, keys),
            applied: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the provisioner, e.g. to change the public namespace or MTU
    pub fn with_provisioner(mut self, f: impl FnOnce(NamespaceProvisioner) -> NamespaceProvisioner) -> Self {
        self.provisioner = f(self.provisioner);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn local_resource<'n>(&self, network: &'n Network) -> Result<&'n NetResource> {
        network.validate()?;
        network
            .local_resource(&self.node_id)
            .ok_or_else(|| Error::NotFound {
                kind: "net resource".to_string(),
                id: format!("{}/{}", network.name, self.node_id),
            })
    }

    /// Compute the plan for the local resource without touching the system
    pub fn plan(&self, network: &Network) -> Result<Plan> {
        let local = self.local_resource(network)?;
        planner::plan(local, network)
    }

    /// Plan, provision and apply the local resource of `network`
    #[instrument(skip(self, network), fields(network = %network.name))]
    pub fn apply_net_resource(&self, network: &Network) -> Result<NetResource> {
        let local = self.local_resource(network)?;

        let plan = planner::plan(local, network)?;
        let provisioned: Provisioned = self.provisioner.provision(local, network)?;
        self.applier.apply(local, network, &plan)?;

        info!(
            namespace = %provisioned.namespace,
            reused = provisioned.reused,
            peers = plan.peers.len(),
            routes = plan.routes.len(),
            "Network resource applied"
        );
        self.applied
            .write()
            .insert(network.name.clone(), local.clone());
        Ok(local.clone())
    }

    /// Last resource applied for `network_name`
    pub fn get_net_resource(&self, network_name: &str) -> Result<NetResource> {
        self.applied
            .read()
            .get(network_name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "net resource".to_string(),
                id: network_name.to_string(),
            })
    }

    /// Remove the local resource's OS objects and forget it
    #[instrument(skip(self, network), fields(network = %network.name))]
    pub fn teardown_net_resource(&self, network: &Network) -> Result<()> {
        let local = self.local_resource(network)?;
        self.applied.write().remove(&network.name);
        self.provisioner.teardown(local, network)
    }
}
