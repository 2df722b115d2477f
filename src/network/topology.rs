//! Peer discovery and engine command line assembly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::{debug, warn};

use super::cloud::CloudInfo;
use crate::error::{Error, Result};
use crate::registry::Coordinator;

/// Port the engine nodes talk to each other on
pub const INTER_NODE_PORT: u16 = 36257;
/// SQL listener, bound to localhost only
pub const SQL_PORT: u16 = 26257;
pub const HTTP_PORT: u16 = 28080;
pub const DEV_HTTP_PORT: u16 = 28081;

/// Cluster name used when the fleet domain has no usable first label
const FALLBACK_CLUSTER_NAME: &str = "database";

/// How the engine is run on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Secure multi-node cluster joined through discovered peers
    #[default]
    Standard,
    /// Insecure in-memory single node
    Dev,
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentMode::Standard => f.write_str("standard"),
            DeploymentMode::Dev => f.write_str("dev"),
        }
    }
}

/// Where peer addresses come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerSource {
    /// Every member answers the address RPC
    #[default]
    Broadcast,
    /// The coordination layer lists peers directly
    Enumerate,
}

/// Paths and names that go into a standard-mode command line.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub store_dir: PathBuf,
    pub certs_dir: PathBuf,
    pub cluster_name: String,
}

/// Discover peers and normalise each to `host:36257`.
///
/// Order follows the discovery response and duplicates are kept. Entries
/// that are not valid addresses are logged and skipped.
pub async fn resolve_peers(coordinator: &dyn Coordinator, source: PeerSource) -> Result<Vec<String>> {
    let addresses = match source {
        PeerSource::Broadcast => coordinator.broadcast_address().await,
        PeerSource::Enumerate => coordinator.peer_addresses().await,
    }
    .map_err(|e| match e {
        Error::Discovery(_) => e,
        other => Error::Discovery(other.to_string()),
    })?;

    let peers: Vec<String> = addresses
        .iter()
        .filter_map(|address| match normalize_peer(address) {
            Ok(peer) => Some(peer),
            Err(e) => {
                warn!(event = "network:peer:invalid", error = %e, "Skipping peer");
                None
            }
        })
        .collect();
    debug!("Resolved {} peers via {:?}", peers.len(), source);
    Ok(peers)
}

/// Rewrite an address to carry the inter-node port, replacing any port it had.
pub fn normalize_peer(address: &str) -> Result<String> {
    let host = peer_host(address)?;
    Ok(match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, INTER_NODE_PORT).to_string(),
        Err(_) => format!("{}:{}", host, INTER_NODE_PORT),
    })
}

fn peer_host(address: &str) -> Result<&str> {
    let address = address.trim();
    let invalid = || Error::Discovery(format!("invalid peer address: {:?}", address));

    if address.is_empty() {
        return Err(invalid());
    }

    if let Ok(socket) = address.parse::<SocketAddr>() {
        // keep the literal text of the host, brackets dropped
        return match socket {
            SocketAddr::V4(_) => address.rsplit_once(':').map(|(h, _)| h).ok_or_else(invalid),
            SocketAddr::V6(_) => address
                .strip_prefix('[')
                .and_then(|rest| rest.split_once(']'))
                .map(|(h, _)| h)
                .ok_or_else(invalid),
        };
    }

    if address.parse::<IpAddr>().is_ok() {
        return Ok(address);
    }

    if let Some(inner) = address.strip_prefix('[').and_then(|a| a.strip_suffix(']')) {
        return inner.parse::<IpAddr>().map(|_| inner).map_err(|_| invalid());
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            port.parse::<u16>().map_err(|_| invalid())?;
            Ok(host)
        }
        Some(_) => Err(invalid()),
        None => Ok(address),
    }
}

/// Append the inter-node port to a peer that has none.
fn with_default_port(peer: &str) -> String {
    if peer.parse::<SocketAddr>().is_ok() {
        return peer.to_string();
    }
    if let Ok(ip) = peer.parse::<IpAddr>() {
        return SocketAddr::new(ip, INTER_NODE_PORT).to_string();
    }
    match peer.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => peer.to_string(),
        _ => format!("{}:{}", peer, INTER_NODE_PORT),
    }
}

/// First label of the fleet domain, unless overridden.
pub fn cluster_name(domain: &str, override_name: Option<&str>) -> String {
    if let Some(name) = override_name.filter(|n| !n.trim().is_empty()) {
        return name.trim().to_string();
    }
    match domain.split('.').next() {
        Some(label) if !label.is_empty() => label.to_string(),
        _ => FALLBACK_CLUSTER_NAME.to_string(),
    }
}

/// Engine arguments for the given mode.
pub fn build_launch_args(
    peers: &[String],
    cloud: &CloudInfo,
    mode: DeploymentMode,
    settings: &LaunchSettings,
) -> Vec<String> {
    match mode {
        DeploymentMode::Dev => dev_args(),
        DeploymentMode::Standard => standard_args(peers, cloud, settings),
    }
}

fn dev_args() -> Vec<String> {
    vec![
        "start-single-node".to_string(),
        "--insecure".to_string(),
        "--store=type=mem,size=50%".to_string(),
        format!("--listen-addr=localhost:{}", INTER_NODE_PORT),
        format!("--sql-addr=localhost:{}", SQL_PORT),
        "--accept-sql-without-tls".to_string(),
        "--http-addr".to_string(),
        format!("localhost:{}", DEV_HTTP_PORT),
    ]
}

fn standard_args(peers: &[String], cloud: &CloudInfo, settings: &LaunchSettings) -> Vec<String> {
    let mut args = vec![
        "start".to_string(),
        format!("--store={}", settings.store_dir.display()),
        format!("--listen-addr=:{}", INTER_NODE_PORT),
        format!("--sql-addr=localhost:{}", SQL_PORT),
        "--accept-sql-without-tls".to_string(),
        "--cache=.25".to_string(),
        format!("--certs-dir={}", settings.certs_dir.display()),
        "--cluster-name".to_string(),
        settings.cluster_name.clone(),
        "--http-addr".to_string(),
        format!("localhost:{}", HTTP_PORT),
        "--unencrypted-localhost-http".to_string(),
    ];

    if let Some(public) = cloud.first_public_v4() {
        args.push(format!("--advertise-addr={}:{}", public, INTER_NODE_PORT));
    }

    if !cloud.location.is_empty() {
        args.push(format!("--locality={}", cloud.location));
    }

    if let (Some(region), Some(private)) = (
        cloud.location.get("region").filter(|region| !region.is_empty()),
        cloud.first_private_v4(),
    ) {
        args.push(format!(
            "--locality-advertise-addr=region={}@{}:{}",
            region, private, INTER_NODE_PORT
        ));
    }

    if !peers.is_empty() {
        let join = peers
            .iter()
            .map(|peer| with_default_port(peer))
            .collect::<Vec<_>>()
            .join(",");
        args.push(format!("--join={}", join));
    }

    args
}
