use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::Coordinator;
use crate::error::{Error, Result};
use crate::network::{normalize_peer, INTER_NODE_PORT};

/// Identity of a node in the fleet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub domain: String,
    pub ip: IpAddr,
    pub alt_names: Vec<String>,
}

#[derive(Default)]
struct KvInner {
    values: HashMap<String, Vec<u8>>,
    watchers: HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

/// In-process key-value store with change notification.
///
/// Several [`LocalCoordinator`]s can share one store to simulate a replicated one.
#[derive(Default)]
pub struct KvStore {
    inner: Mutex<KvInner>,
}

impl KvStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> Result<MutexGuard<'_, KvInner>> {
        self.inner
            .lock()
            .map_err(|e| Error::Task(format!("Lock poisoned: {}", e)))
    }

    /// Register a watcher; the current value is delivered right away.
    pub fn subscribe(&self, key: &str) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        // a poisoned store never notifies, the receiver just stays quiet
        if let Ok(mut inner) = self.lock() {
            if let Some(value) = inner.values.get(key) {
                let _ = sender.send(value.clone());
            }
            inner.watchers.entry(key.to_string()).or_default().push(sender);
        }
        receiver
    }

    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        let inner = self.lock()?;
        inner
            .values
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("key {}", key)))
    }

    pub fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.lock()?;
        Self::store(&mut inner, key, value);
        Ok(())
    }

    pub fn set_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.values.contains_key(key) {
            return Ok(false);
        }
        Self::store(&mut inner, key, value);
        Ok(true)
    }

    fn store(inner: &mut KvInner, key: &str, value: Vec<u8>) {
        if let Some(watchers) = inner.watchers.get_mut(key) {
            watchers.retain(|watcher| watcher.send(value.clone()).is_ok());
        }
        inner.values.insert(key.to_string(), value);
    }
}

/// Coordinator backed by static configuration and an in-process store.
pub struct LocalCoordinator {
    node: NodeInfo,
    peers: Vec<String>,
    store: Arc<KvStore>,
    ready: watch::Sender<bool>,
}

impl LocalCoordinator {
    /// Create a coordinator that is ready immediately.
    pub fn new(node: NodeInfo, peers: Vec<String>, store: Arc<KvStore>) -> Self {
        let (ready, _) = watch::channel(true);
        Self {
            node,
            peers,
            store,
            ready,
        }
    }

    /// Flip readiness, e.g. to hold bootstrap back in tests.
    pub fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);
    }
}

#[async_trait]
impl Coordinator for LocalCoordinator {
    fn node_name(&self) -> String {
        self.node.name.clone()
    }

    fn domain(&self) -> String {
        self.node.domain.clone()
    }

    fn alt_names(&self) -> Vec<String> {
        self.node.alt_names.clone()
    }

    async fn wait_ready(&self) {
        let mut ready = self.ready.subscribe();
        // the sender lives as long as self, so this only ends once ready
        let _ = ready.wait_for(|ready| *ready).await;
    }

    fn watch(&self, key: &str) -> mpsc::UnboundedReceiver<Vec<u8>> {
        self.store.subscribe(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.store.get(key)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.store.set(key, value)
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        self.store.set_if_absent(key, value)
    }

    async fn broadcast_address(&self) -> Result<Vec<String>> {
        // every member answers with its own address on the inter-node port
        let mut answers = vec![SocketAddr::new(self.node.ip, INTER_NODE_PORT).to_string()];
        // a peer that cannot be addressed never answers
        answers.extend(self.peers.iter().filter_map(|peer| normalize_peer(peer).ok()));
        debug!("Address broadcast collected {} answers", answers.len());
        Ok(answers)
    }

    async fn peer_addresses(&self) -> Result<Vec<String>> {
        Ok(self.peers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn node(ip: &str) -> NodeInfo {
        NodeInfo {
            name: "db-1".to_string(),
            domain: "eu.example.com".to_string(),
            ip: ip.parse().unwrap(),
            alt_names: vec![ip.to_string()],
        }
    }

    #[test]
    fn test_set_if_absent_has_one_winner() {
        let store = KvStore::new();
        assert!(store.set_if_absent("k", b"first".to_vec()).unwrap());
        assert!(!store.set_if_absent("k", b"second".to_vec()).unwrap());
        assert_eq!(store.get("k").unwrap(), b"first");
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let store = KvStore::new();
        assert!(matches!(store.get("absent").unwrap_err(), Error::NotFound(_)));
    }

    #[test]
    fn test_watch_sees_current_then_changes() {
        let store = KvStore::new();
        store.set("k", b"v1".to_vec()).unwrap();

        let mut updates = store.subscribe("k");
        store.set("k", b"v2".to_vec()).unwrap();
        store.set("other", b"x".to_vec()).unwrap();

        assert_eq!(updates.try_recv().unwrap(), b"v1");
        assert_eq!(updates.try_recv().unwrap(), b"v2");
        assert!(updates.try_recv().is_err());
    }

    #[test]
    fn test_dropped_watchers_are_pruned() {
        let store = KvStore::new();
        drop(store.subscribe("k"));
        store.set("k", b"v".to_vec()).unwrap();
        assert!(store.lock().unwrap().watchers["k"].is_empty());
    }

    #[tokio::test]
    async fn test_shared_store_between_coordinators() {
        let store = KvStore::new();
        let a = LocalCoordinator::new(node("10.0.0.1"), Vec::new(), store.clone());
        let b = LocalCoordinator::new(node("10.0.0.2"), Vec::new(), store);

        let mut updates = b.watch("ca");
        assert!(a.set_if_absent("ca", b"key".to_vec()).await.unwrap());
        assert!(!b.set_if_absent("ca", b"other".to_vec()).await.unwrap());
        assert_eq!(updates.recv().await.unwrap(), b"key");
        assert_eq!(b.get("ca").await.unwrap(), b"key");
    }

    #[tokio::test]
    async fn test_wait_ready() {
        let coordinator = Arc::new(LocalCoordinator::new(
            node("10.0.0.1"),
            Vec::new(),
            KvStore::new(),
        ));
        coordinator.set_ready(false);

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait_ready().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        coordinator.set_ready(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_address_includes_self() {
        let coordinator = LocalCoordinator::new(
            node("10.0.0.1"),
            vec!["10.0.0.2".to_string(), "10.0.0.3:26257".to_string()],
            KvStore::new(),
        );
        let answers = coordinator.broadcast_address().await.unwrap();
        assert_eq!(
            answers,
            vec!["10.0.0.1:36257", "10.0.0.2:36257", "10.0.0.3:36257"]
        );
    }

    #[tokio::test]
    async fn test_broadcast_address_skips_unreachable_peers() {
        let coordinator = LocalCoordinator::new(
            node("10.0.0.1"),
            vec!["db-3:notaport".to_string(), "10.0.0.2".to_string()],
            KvStore::new(),
        );
        let answers = coordinator.broadcast_address().await.unwrap();
        assert_eq!(answers, vec!["10.0.0.1:36257", "10.0.0.2:36257"]);
    }
}
