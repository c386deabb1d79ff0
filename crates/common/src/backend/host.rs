//! Host kernel backend
//!
//! Drives the kernel through the `ip` and `wg` tools and switches namespaces
//! with `setns(2)`. Commands are spawned from the calling thread, so they run
//! in whatever namespace that thread has entered.

use super::{Link, LinkOps, NamespaceOps, WireGuardOps};
use crate::keys::WgPrivateKey;
use crate::netns::NamespaceGuard;
use crate::types::{Route, WgPeer};
use crate::{Error, Result};
use ipnetwork::IpNetwork;
use nix::sched::{setns, CloneFlags};
use rand::RngCore;
use std::fmt::Write as _;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, error, trace};

/// Where `ip netns` keeps named namespaces
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

/// Host kernel backend
#[derive(Debug, Clone)]
pub struct HostBackend {
    ip_path: String,
    wg_path: String,
    netns_dir: PathBuf,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::with_paths("ip", "wg")
    }

    /// Create with custom command paths
    pub fn with_paths(ip_path: impl Into<String>, wg_path: impl Into<String>) -> Self {
        Self {
            ip_path: ip_path.into(),
            wg_path: wg_path.into(),
            netns_dir: PathBuf::from(NETNS_RUN_DIR),
        }
    }

    fn ip(&self, args: &[&str]) -> Result<String> {
        run(&self.ip_path, args)
    }

    fn wg(&self, args: &[&str]) -> Result<String> {
        run(&self.wg_path, args)
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Execute a command and return stdout
fn run(cmd: &str, args: &[&str]) -> Result<String> {
    trace!(cmd = cmd, args = ?args, "Executing command");

    let output = Command::new(cmd).args(args).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(classify(format!("{} {}", cmd, args.join(" ")), stderr.trim()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Map a failed command to the error kinds callers branch on
fn classify(command: String, stderr: &str) -> Error {
    if stderr.contains("File exists") {
        Error::AlreadyExists {
            kind: "object".to_string(),
            id: command,
        }
    } else if stderr.contains("Cannot find device")
        || stderr.contains("No such file or directory")
        || stderr.contains("No such process")
    {
        Error::NotFound {
            kind: "object".to_string(),
            id: command,
        }
    } else {
        Error::Command {
            command,
            stderr: stderr.to_string(),
        }
    }
}

/// `wg setconf` document for a key and a full peer list
pub fn render_setconf(private_key: &WgPrivateKey, listen_port: Option<u16>, peers: &[WgPeer]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = {}", private_key.to_base64());
    if let Some(port) = listen_port {
        let _ = writeln!(out, "ListenPort = {}", port);
    }

    for peer in peers {
        let _ = writeln!(out);
        let _ = writeln!(out, "[Peer]");
        let _ = writeln!(out, "PublicKey = {}", peer.public_key);
        let allowed: Vec<String> = peer.allowed_ips.iter().map(|ip| ip.to_string()).collect();
        if !allowed.is_empty() {
            let _ = writeln!(out, "AllowedIPs = {}", allowed.join(", "));
        }
        if let Some(endpoint) = peer.endpoint {
            let _ = writeln!(out, "Endpoint = {}", endpoint);
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
        }
    }

    out
}

fn ephemeral_veth_name() -> String {
    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!("veth{}", hex::encode(suffix))
}

impl NamespaceOps for HostBackend {
    fn namespace_exists(&self, name: &str) -> bool {
        self.netns_dir.join(name).exists()
    }

    fn create_namespace(&self, name: &str) -> Result<()> {
        if self.namespace_exists(name) {
            return Err(Error::AlreadyExists {
                kind: "namespace".to_string(),
                id: name.to_string(),
            });
        }
        self.ip(&["netns", "add", name])?;
        Ok(())
    }

    fn delete_namespace(&self, name: &str) -> Result<()> {
        if !self.namespace_exists(name) {
            return Err(Error::NotFound {
                kind: "namespace".to_string(),
                id: name.to_string(),
            });
        }
        self.ip(&["netns", "delete", name])?;
        Ok(())
    }

    fn enter(&self, name: &str) -> Result<NamespaceGuard<'_>> {
        let previous = File::open("/proc/thread-self/ns/net")?;
        let target = File::open(self.netns_dir.join(name)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound {
                kind: "namespace".to_string(),
                id: name.to_string(),
            },
            _ => Error::Io(e),
        })?;

        setns(&target, CloneFlags::CLONE_NEWNET).map_err(std::io::Error::from)?;
        debug!(namespace = %name, "Switched thread namespace");

        let entered = name.to_string();
        Ok(NamespaceGuard::new(name, move || {
            if let Err(e) = setns(&previous, CloneFlags::CLONE_NEWNET) {
                // a pooled thread left in `entered` would run later work there
                error!(namespace = %entered, "Cannot restore thread namespace: {}", e);
                std::process::abort();
            }
            Ok(())
        }))
    }

    fn set_sysctl(&self, key: &str, value: &str) -> Result<()> {
        // /proc/sys/net resolves against the opener's namespace
        let path = PathBuf::from("/proc/sys").join(key.replace('.', "/"));
        std::fs::write(&path, value)?;
        Ok(())
    }
}

impl LinkOps for HostBackend {
    fn link_by_name(&self, name: &str) -> Result<Link> {
        let index = nix::net::if_::if_nametoindex(name).map_err(|_| Error::NotFound {
            kind: "link".to_string(),
            id: name.to_string(),
        })?;
        Ok(Link {
            name: name.to_string(),
            index,
        })
    }

    fn create_bridge(&self, name: &str) -> Result<()> {
        self.ip(&["link", "add", "name", name, "type", "bridge"])?;
        Ok(())
    }

    fn create_veth(&self, name: &str, mtu: u16) -> Result<String> {
        let peer = ephemeral_veth_name();
        let mtu = mtu.to_string();
        self.ip(&[
            "link", "add", "name", name, "mtu", &mtu, "type", "veth", "peer", "name", &peer, "mtu",
            &mtu,
        ])?;
        // pid 1 lives in the host namespace
        self.ip(&["link", "set", "dev", &peer, "netns", "1"])?;
        Ok(peer)
    }

    fn attach_to_bridge(&self, link: &str, bridge: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", link, "master", bridge])?;
        Ok(())
    }

    fn move_to_namespace(&self, link: &str, namespace: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", link, "netns", namespace])?;
        Ok(())
    }

    fn set_up(&self, link: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", link, "up"])?;
        Ok(())
    }

    fn delete_link(&self, link: &str) -> Result<()> {
        self.ip(&["link", "delete", "dev", link])?;
        Ok(())
    }

    fn add_address(&self, link: &str, address: IpNetwork) -> Result<()> {
        let addr = address.to_string();
        if address.is_ipv6() {
            self.ip(&["-6", "address", "add", &addr, "dev", link, "nodad"])?;
        } else {
            self.ip(&["address", "add", &addr, "dev", link])?;
        }
        Ok(())
    }

    fn add_route(&self, route: &Route, link: &Link) -> Result<()> {
        let dst = route.destination.to_string();
        let gw = route.gateway.to_string();
        let family = if route.destination.is_ipv6() { "-6" } else { "-4" };
        self.ip(&[family, "route", "replace", &dst, "via", &gw, "dev", &link.name])?;
        Ok(())
    }
}

impl WireGuardOps for HostBackend {
    fn create_wireguard(&self, name: &str) -> Result<()> {
        self.ip(&["link", "add", "name", name, "type", "wireguard"])?;
        Ok(())
    }

    fn configure(
        &self,
        name: &str,
        private_key: &WgPrivateKey,
        listen_port: Option<u16>,
        peers: &[WgPeer],
    ) -> Result<()> {
        // setconf replaces key and peers in a single netlink transaction
        let mut file = tempfile::NamedTempFile::new()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(render_setconf(private_key, listen_port, peers).as_bytes())?;
        file.flush()?;

        let path = file.path().to_string_lossy().to_string();
        self.wg(&["setconf", name, &path])?;
        Ok(())
    }
}
