use async_trait::async_trait;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use crate::config::CloudConfig;
use crate::error::{Error, Result};

/// Locality tiers, e.g. `cloud=gce,region=us-west1,zone=us-west1-b`.
///
/// Order is significant: the engine treats earlier tiers as broader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    tiers: Vec<(String, String)>,
}

impl Location {
    #[cfg(test)]
    pub fn new(tiers: Vec<(String, String)>) -> Self {
        Self { tiers }
    }

    /// Value of the first tier named `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.tiers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.tiers.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

impl FromStr for Location {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut tiers = Vec::new();
        for tier in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match tier.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    tiers.push((key.trim().to_string(), value.trim().to_string()));
                }
                _ => {
                    return Err(Error::Discovery(format!(
                        "locality tier must be key=value: {}",
                        tier
                    )))
                }
            }
        }
        Ok(Self { tiers })
    }
}

/// What the hosting environment reports about this machine.
#[derive(Debug, Clone, Default)]
pub struct CloudInfo {
    pub public_ips: Vec<IpAddr>,
    pub private_ips: Vec<IpAddr>,
    pub location: Location,
}

impl CloudInfo {
    pub fn first_public_v4(&self) -> Option<Ipv4Addr> {
        first_v4(&self.public_ips)
    }

    pub fn first_private_v4(&self) -> Option<Ipv4Addr> {
        first_v4(&self.private_ips)
    }
}

fn first_v4(ips: &[IpAddr]) -> Option<Ipv4Addr> {
    ips.iter().find_map(|ip| match ip {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(_) => None,
    })
}

/// Source of host metadata.
#[async_trait]
pub trait CloudMetadata: Send + Sync {
    async fn load(&self) -> Result<CloudInfo>;
}

/// Metadata taken from the `[cloud]` config section.
#[derive(Debug, Clone)]
pub struct StaticCloudMetadata {
    config: CloudConfig,
}

impl StaticCloudMetadata {
    pub fn from_config(config: &CloudConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait]
impl CloudMetadata for StaticCloudMetadata {
    async fn load(&self) -> Result<CloudInfo> {
        Ok(CloudInfo {
            public_ips: self.config.public_ips.clone(),
            private_ips: self.config.private_ips.clone(),
            location: self.config.locality.parse()?,
        })
    }
}
