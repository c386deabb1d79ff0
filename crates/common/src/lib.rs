//! nrmesh Common Library
//!
//! Network-resource construction and WireGuard mesh topology for nodes
//! spread across independent NATs: deterministic naming, reachability
//! classification, per-role planning, namespace provisioning and apply.

pub mod apply;
pub mod backend;
pub mod error;
pub mod keys;
pub mod netns;
pub mod networker;
pub mod nibble;
pub mod planner;
pub mod provision;
pub mod reachability;
pub mod types;

// Re-export commonly used types
pub use apply::MeshApplier;
pub use backend::{Backend, LinkOps, NamespaceOps, WireGuardOps};
pub use error::{ApplyOperation, Error, Result};
pub use keys::{KeyStore, WgPrivateKey};
pub use networker::Networker;
pub use nibble::Nibble;
pub use planner::Role;
pub use provision::{NamespaceProvisioner, Provisioned, Stage};
pub use types::*;

/// nrmesh version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default directory for persisted WireGuard keys
pub fn default_key_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/var/lib/nrmesh/keys")
}
