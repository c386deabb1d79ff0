//! Network runner
//!
//! Applies every configured network on its own blocking worker and retries
//! retryable failures. A single provision or apply step is never
//! interrupted; shutdown only stops further attempts.

use crate::config::RetryConfig;
use nrmesh_common::{Error, NetResource, Network, Networker, Plan, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Drives the networker for a set of networks
pub struct Runner {
    networker: Arc<Networker>,
    retry: RetryConfig,
}

impl Runner {
    pub fn new(networker: Arc<Networker>, retry: RetryConfig) -> Self {
        Self { networker, retry }
    }

    /// Apply all networks concurrently. Returns the number that failed.
    pub async fn apply_all(&self, networks: Vec<Network>) -> usize {
        let handles: Vec<_> = networks
            .into_iter()
            .map(|network| {
                let networker = self.networker.clone();
                let retry = self.retry.clone();
                let name = network.name.clone();
                (name, tokio::spawn(apply_with_retry(networker, network, retry)))
            })
            .collect();

        let mut failed = 0;
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(resource)) => {
                    info!(network = %name, prefix = %resource.prefix, "Network ready");
                }
                Ok(Err(e)) => {
                    error!(network = %name, "Failed to apply network: {}", e);
                    failed += 1;
                }
                Err(e) => {
                    error!(network = %name, "Apply task failed: {}", e);
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Tear down the local resource of every network. Returns the number that failed.
    pub async fn teardown_all(&self, networks: Vec<Network>) -> usize {
        let mut failed = 0;
        for network in networks {
            let name = network.name.clone();
            let result = blocking(self.networker.clone(), Arc::new(network), |n, net| {
                n.teardown_net_resource(net)
            })
            .await;
            match result {
                Ok(()) => info!(network = %name, "Network torn down"),
                Err(e) => {
                    error!(network = %name, "Failed to tear down network: {}", e);
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Plan every network without touching the system
    pub fn plan_all(&self, networks: &[Network]) -> Vec<(String, Result<Plan>)> {
        networks
            .iter()
            .map(|network| (network.name.clone(), self.networker.plan(network)))
            .collect()
    }
}

async fn apply_with_retry(
    networker: Arc<Networker>,
    network: Network,
    retry: RetryConfig,
) -> Result<NetResource> {
    let network = Arc::new(network);
    let mut attempt = 1;

    loop {
        let result = blocking(networker.clone(), network.clone(), |n, net| {
            n.apply_net_resource(net)
        })
        .await;

        match result {
            Ok(resource) => return Ok(resource),
            Err(e) if e.is_retryable() && attempt < retry.attempts => {
                warn!(network = %network.name, attempt = attempt, "Apply failed, retrying: {}", e);

                // a half-built resource blocks the next provisioning
                if matches!(e, Error::Provisioning { .. }) {
                    let cleanup = blocking(networker.clone(), network.clone(), |n, net| {
                        n.teardown_net_resource(net)
                    })
                    .await;
                    if let Err(e) = cleanup {
                        warn!(network = %network.name, "Cleanup before retry failed: {}", e);
                    }
                }

                tokio::time::sleep(Duration::from_secs(retry.delay_secs)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run a networker call on the blocking pool; namespace switches pin the thread
async fn blocking<T, F>(networker: Arc<Networker>, network: Arc<Network>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Networker, &Network) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&networker, &network))
        .await
        .map_err(|e| Error::Internal(format!("worker failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use nrmesh_common::backend::memory::RecordingBackend;
    use nrmesh_common::KeyStore;
    use tempfile::TempDir;

    const NETWORK: &str = r#"{
        "name": "demo",
        "allocation_nr": 1,
        "exit_prefix": "2001:db8:1::/64",
        "resources": [
            {
                "node_id": {"id": "node-a", "reachability_v4": "public", "reachability_v6": "public"},
                "prefix": "2001:db8:1::/64",
                "link_local": "fe80::2db8/64",
                "peers": [
                    {"prefix": "2001:db8:2::/64", "type": "wireguard", "connection": {"public_key": "b-key"}}
                ]
            },
            {
                "node_id": {"id": "node-b", "reachability_v4": "hidden", "reachability_v6": "hidden"},
                "prefix": "2001:db8:2::/64",
                "link_local": "fe80::2dbb/64",
                "peers": [
                    {"prefix": "2001:db8:1::/64", "type": "wireguard",
                     "connection": {"public_key": "a-key", "ip": "198.51.100.1", "port": 51820}}
                ]
            }
        ]
    }"#;

    fn runner(backend: &Arc<RecordingBackend>, dir: &TempDir, attempts: u32) -> Runner {
        let networker = Networker::new("node-b", backend.clone(), KeyStore::new(dir.path()));
        Runner::new(
            Arc::new(networker),
            RetryConfig {
                attempts,
                delay_secs: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_apply_all() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RecordingBackend::new());
        let mut second = Network::from_json(NETWORK).unwrap();
        second.name = "demo-2".into();
        second.allocation_nr = 2;

        let failed = runner(&backend, &dir, 1)
            .apply_all(vec![Network::from_json(NETWORK).unwrap(), second])
            .await;
        assert_eq!(failed, 0);
        assert!(backend.wireguard("net-2dbb-1", "wg-2dbb-1").is_some());
        assert!(backend.wireguard("net-2dbb-2", "wg-2dbb-2").is_some());
    }

    #[tokio::test]
    async fn test_transient_provisioning_failure_is_retried() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RecordingBackend::new());
        backend.fail_once("create_wireguard");

        let failed = runner(&backend, &dir, 2)
            .apply_all(vec![Network::from_json(NETWORK).unwrap()])
            .await;
        assert_eq!(failed, 0);
        assert_eq!(backend.count("delete_namespace"), 1);
        assert_eq!(backend.count("create_namespace"), 2);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RecordingBackend::new());
        backend.fail_on("configure");

        let failed = runner(&backend, &dir, 3)
            .apply_all(vec![Network::from_json(NETWORK).unwrap()])
            .await;
        assert_eq!(failed, 1);
        assert_eq!(backend.count("configure"), 3);
    }

    #[tokio::test]
    async fn test_planning_error_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RecordingBackend::new());
        let mut network = Network::from_json(NETWORK).unwrap();
        network.resources[1].peers.clear();

        let failed = runner(&backend, &dir, 3).apply_all(vec![network]).await;
        assert_eq!(failed, 1);
        assert_eq!(backend.count("create_namespace"), 0);
    }

    #[tokio::test]
    async fn test_teardown_all() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RecordingBackend::new());
        let runner = runner(&backend, &dir, 1);
        let network = Network::from_json(NETWORK).unwrap();

        assert_eq!(runner.apply_all(vec![network.clone()]).await, 0);
        assert_eq!(runner.teardown_all(vec![network]).await, 0);
        assert!(backend.namespaces().is_empty());
    }

    #[test]
    fn test_plan_all() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RecordingBackend::new());
        let plans = runner(&backend, &dir, 1).plan_all(&[Network::from_json(NETWORK).unwrap()]);

        let (name, plan) = &plans[0];
        assert_eq!(name, "demo");
        assert_eq!(plan.as_ref().unwrap().routes.len(), 3);
        assert!(backend.ops().is_empty());
    }
}
