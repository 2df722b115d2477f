pub mod bootstrap;
pub mod local;

pub use bootstrap::CaBootstrap;
pub use local::{KvStore, LocalCoordinator, NodeInfo};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Cluster coordination service as seen by this node.
///
/// Provides this node's identity, a replicated key-value store with change notification and
/// peer discovery. The daemon ships [`LocalCoordinator`]; a real fleet layer implements the
/// same trait.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// This node's name
    fn node_name(&self) -> String;

    /// Fleet domain, used to derive the cluster name
    fn domain(&self) -> String;

    /// Names this node is reachable under (IP literals or DNS names)
    fn alt_names(&self) -> Vec<String>;

    /// Resolves once the coordination layer is operational.
    async fn wait_ready(&self);

    /// Subscribe to a replicated key.
    ///
    /// The channel receives the raw value on every change, starting with the current value if
    /// one exists at subscription time.
    fn watch(&self, key: &str) -> mpsc::UnboundedReceiver<Vec<u8>>;

    /// Current value of a key, [`Error::NotFound`](crate::error::Error::NotFound) if unset.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Store `value` only if the key is unset. Returns whether this call wrote it.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool>;

    /// Ask every member for its engine address and collect the answers.
    async fn broadcast_address(&self) -> Result<Vec<String>>;

    /// Enumerate peer addresses known to the coordination layer.
    async fn peer_addresses(&self) -> Result<Vec<String>>;
}
