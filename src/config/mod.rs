use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use crate::network::{DeploymentMode, Location, PeerSource};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This node's identity inside the fleet
    pub node: NodeConfig,

    /// Where certificates, binaries and the store live
    #[serde(default)]
    pub paths: PathsConfig,

    /// Database engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Process supervisor timing
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Shared CA bootstrap settings
    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    /// Static cluster membership (used by the local coordinator)
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Cloud metadata for this host
    #[serde(default)]
    pub cloud: CloudConfig,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name
    pub name: String,

    /// Fleet domain, the cluster name is derived from its first label
    pub domain: String,

    /// Address this node answers the address RPC with
    pub ip: IpAddr,

    /// Extra SAN entries for node.crt (IP literals or DNS names)
    #[serde(default)]
    pub alt_names: Vec<String>,
}

/// Directory layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Certificates and keys (ca.*, node.*, client.root.*)
    pub base_dir: PathBuf,

    /// Extracted engine releases and the on-disk store
    pub cache_dir: PathBuf,
}

/// Database engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// `standard` joins the cluster, `dev` runs an insecure in-memory single node
    #[serde(default)]
    pub mode: DeploymentMode,

    /// Process name looked up in the process table
    #[serde(default = "default_binary_name")]
    pub binary_name: String,

    /// Pre-installed binary, used without touching the network when present
    #[serde(default = "default_system_binary")]
    pub system_binary: PathBuf,

    /// Base URL of the release distribution
    #[serde(default = "default_release_base_url")]
    pub release_base_url: String,

    /// Release to fetch (`latest` or a pinned version such as `v24.1.0`)
    #[serde(default = "default_release_version")]
    pub release_version: String,

    /// Overrides the domain-derived cluster name
    #[serde(default)]
    pub cluster_name: Option<String>,

    /// How peers are discovered
    #[serde(default)]
    pub peer_source: PeerSource,
}

/// Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Grace period before the first liveness check, in seconds
    #[serde(default = "default_startup_delay")]
    pub startup_delay_secs: u64,

    /// Liveness check interval in seconds
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

/// CA bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Replicated key carrying the shared CA private key
    #[serde(default = "default_ca_key_name")]
    pub ca_key_name: String,

    /// Delay after the coordinator reports ready, in seconds
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,
}

/// Static cluster membership
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Peer addresses (host or host:port)
    #[serde(default)]
    pub peers: Vec<String>,
}

/// Cloud metadata for this host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub public_ips: Vec<IpAddr>,

    #[serde(default)]
    pub private_ips: Vec<IpAddr>,

    /// Locality tiers, e.g. `cloud=gce,region=us-west1,zone=us-west1-b`
    #[serde(default)]
    pub locality: String,
}

// Default values for configuration options
fn default_binary_name() -> String { "cockroach".to_string() }
fn default_system_binary() -> PathBuf { PathBuf::from("/usr/local/bin/cockroach") }
fn default_release_base_url() -> String { "https://binaries.cockroachdb.com/".to_string() }
fn default_release_version() -> String { "latest".to_string() }
fn default_startup_delay() -> u64 { 5 }
fn default_check_interval() -> u64 { 60 } // 1 minute
fn default_ca_key_name() -> String { "roachkeeper:ca:key".to_string() }
fn default_settle_delay() -> u64 { 5 }

impl Default for PathsConfig {
    fn default() -> Self {
        // certificates in ~/.config/roachkeeper, releases and data in ~/.cache/roachkeeper
        let config_root = dirs::config_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        let cache_root = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        Self {
            base_dir: config_root.join("roachkeeper"),
            cache_dir: cache_root.join("roachkeeper"),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::default(),
            binary_name: default_binary_name(),
            system_binary: default_system_binary(),
            release_base_url: default_release_base_url(),
            release_version: default_release_version(),
            cluster_name: None,
            peer_source: PeerSource::default(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_delay_secs: default_startup_delay(),
            check_interval_secs: default_check_interval(),
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            ca_key_name: default_ca_key_name(),
            settle_delay_secs: default_settle_delay(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                name: "node-1".to_string(),
                domain: "database.local".to_string(),
                ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                alt_names: vec!["127.0.0.1".to_string(), "localhost".to_string()],
            },
            paths: PathsConfig::default(),
            engine: EngineConfig::default(),
            supervisor: SupervisorConfig::default(),
            bootstrap: BootstrapConfig::default(),
            cluster: ClusterConfig::default(),
            cloud: CloudConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&content)
            .context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path.as_ref(), content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.node.name.trim().is_empty() {
            anyhow::bail!("Node name cannot be empty");
        }

        if self.engine.binary_name.trim().is_empty() {
            anyhow::bail!("Engine binary name cannot be empty");
        }

        if !self.engine.release_base_url.starts_with("http://")
            && !self.engine.release_base_url.starts_with("https://")
        {
            anyhow::bail!(
                "Release base URL must be http(s): {}",
                self.engine.release_base_url
            );
        }

        if self.supervisor.check_interval_secs == 0 {
            anyhow::bail!("Supervisor check interval must be greater than 0");
        }

        if self.bootstrap.ca_key_name.trim().is_empty() {
            anyhow::bail!("CA key name cannot be empty");
        }

        self.cloud
            .locality
            .parse::<Location>()
            .context("Invalid cloud locality")?;

        Ok(())
    }

    /// Ensure all necessary directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.base_dir)
            .context("Failed to create certificate directory")?;

        fs::create_dir_all(&self.paths.cache_dir)
            .context("Failed to create cache directory")?;

        Ok(())
    }
}
