use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::Coordinator;
use crate::error::{Error, Result};
use crate::pki::{CaKey, CertificateAuthority};

/// Progress of the bootstrap task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Uninitialized,
    Watching,
    Active,
}

/// What this node knows about the shared CA key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Absent,
    /// This node generated the key and won the write
    Proposed,
    /// A key arrived through the watch and is being installed
    Installed,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapStatus {
    pub state: BootstrapState,
    pub key: KeyState,
}

/// Agrees on one CA private key across the fleet through the replicated store.
///
/// The first node to find the key missing generates one and writes it with `set_if_absent`;
/// every node then installs whatever value the store holds.
pub struct CaBootstrap {
    coordinator: Arc<dyn Coordinator>,
    authority: Arc<CertificateAuthority>,
    key_name: String,
    settle_delay: Duration,
    status: watch::Sender<BootstrapStatus>,
}

impl CaBootstrap {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        authority: Arc<CertificateAuthority>,
        key_name: impl Into<String>,
        settle_delay: Duration,
    ) -> Self {
        let key = if authority.is_active() {
            KeyState::Active
        } else {
            KeyState::Absent
        };
        let (status, _) = watch::channel(BootstrapStatus {
            state: BootstrapState::Uninitialized,
            key,
        });

        Self {
            coordinator,
            authority,
            key_name: key_name.into(),
            settle_delay,
            status,
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<BootstrapStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> BootstrapStatus {
        *self.status.borrow()
    }

    /// Run until `shutdown` flips to true or its sender goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        // subscribe first so a key written while we wait is still delivered
        let mut updates = self.coordinator.watch(&self.key_name);
        self.set_state(BootstrapState::Watching);
        info!("Watching shared CA key {}", self.key_name);

        tokio::select! {
            _ = self.coordinator.wait_ready() => {}
            _ = shutdown.changed() => return Ok(()),
        }

        if !self.settle_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.settle_delay) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }

        if *shutdown.borrow() {
            return Ok(());
        }

        if let Err(e) = self.propose_if_absent().await {
            error!(event = "bootstrap:key:propose_error", error = %e, "Failed to propose CA key");
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                update = updates.recv() => match update {
                    Some(der) => self.install(der).await,
                    None => {
                        warn!("CA key watch closed");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        info!("CA bootstrap stopped");
        Ok(())
    }

    async fn propose_if_absent(&self) -> Result<()> {
        match self.coordinator.get(&self.key_name).await {
            Ok(_) => {
                debug!("Shared CA key already present");
                Ok(())
            }
            Err(Error::NotFound(_)) => {
                self.set_key(KeyState::Absent);

                let key = CaKey::generate()?;
                let der = key.pkcs8_der();
                if self.coordinator.set_if_absent(&self.key_name, der.clone()).await? {
                    info!(event = "bootstrap:key:proposed", node = %self.coordinator.node_name(), "Generated shared CA key");
                    self.set_key(KeyState::Proposed);
                    self.install(der).await;
                } else {
                    debug!("Another node wrote the shared CA key first");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn install(&self, der: Vec<u8>) {
        if self.authority.active_key_der().as_deref() == Some(der.as_slice()) {
            debug!("Shared CA key unchanged");
            self.mark_active();
            return;
        }

        self.set_key(KeyState::Installed);

        let authority = self.authority.clone();
        let result = tokio::task::spawn_blocking(move || authority.set_private_key_der(&der))
            .await
            .map_err(Error::from)
            .and_then(|r| r);

        match result {
            Ok(outcomes) => {
                info!(
                    event = "bootstrap:key:installed",
                    ca = %self.authority.common_name().unwrap_or_default(),
                    "Installed shared CA key"
                );
                for outcome in outcomes {
                    debug!("{}: {:?}", outcome.common_name, outcome.action);
                }
                self.mark_active();
            }
            Err(e) => {
                error!(event = "bootstrap:key:install_error", error = %e, "Failed to install CA key");
            }
        }
    }

    fn mark_active(&self) {
        self.status.send_modify(|status| {
            status.state = BootstrapState::Active;
            status.key = KeyState::Active;
        });
    }

    fn set_state(&self, state: BootstrapState) {
        self.status.send_modify(|status| status.state = state);
    }

    fn set_key(&self, key: KeyState) {
        self.status.send_modify(|status| status.key = key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{KvStore, LocalCoordinator, NodeInfo};
    use tempfile::TempDir;

    const KEY_NAME: &str = "roachkeeper:ca:key";

    struct TestNode {
        _dir: TempDir,
        coordinator: Arc<LocalCoordinator>,
        authority: Arc<CertificateAuthority>,
        bootstrap: Arc<CaBootstrap>,
    }

    fn test_node(name: &str, ip: &str, store: Arc<KvStore>) -> TestNode {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(LocalCoordinator::new(
            NodeInfo {
                name: name.to_string(),
                domain: "eu.example.com".to_string(),
                ip: ip.parse().unwrap(),
                alt_names: vec![ip.to_string()],
            },
            Vec::new(),
            store,
        ));
        let authority = Arc::new(CertificateAuthority::new(dir.path(), vec![ip.to_string()]));
        let bootstrap = Arc::new(CaBootstrap::new(
            coordinator.clone(),
            authority.clone(),
            KEY_NAME,
            Duration::ZERO,
        ));
        TestNode {
            _dir: dir,
            coordinator,
            authority,
            bootstrap,
        }
    }

    fn spawn(
        node: &TestNode,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<Result<()>> {
        let bootstrap = node.bootstrap.clone();
        tokio::spawn(async move { bootstrap.run(shutdown).await })
    }

    async fn wait_active(node: &TestNode) {
        let mut status = node.bootstrap.subscribe();
        tokio::time::timeout(
            Duration::from_secs(10),
            status.wait_for(|s| s.key == KeyState::Active),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_single_node_generates_and_installs() {
        let store = KvStore::new();
        let node = test_node("db-1", "10.0.0.1", store.clone());
        let (stop, shutdown) = watch::channel(false);
        let handle = spawn(&node, shutdown);

        wait_active(&node).await;

        let shared = store.get(KEY_NAME).unwrap();
        assert_eq!(node.authority.active_key_der().unwrap(), shared);
        let key = CaKey::from_pkcs8_der(&shared).unwrap();
        assert_eq!(
            node.authority.common_name().unwrap(),
            crate::pki::authority::ca_common_name(&key.public_key_der())
        );
        assert_eq!(node.bootstrap.status().state, BootstrapState::Active);

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_two_nodes_converge_on_one_ca() {
        let store = KvStore::new();
        let a = test_node("db-1", "10.0.0.1", store.clone());
        let b = test_node("db-2", "10.0.0.2", store.clone());
        let (stop, shutdown) = watch::channel(false);
        let handles = vec![spawn(&a, shutdown.clone()), spawn(&b, shutdown)];

        wait_active(&a).await;
        wait_active(&b).await;

        assert_eq!(a.authority.common_name(), b.authority.common_name());
        assert_eq!(a.authority.active_key_der(), b.authority.active_key_der());
        assert_eq!(a.authority.active_key_der().unwrap(), store.get(KEY_NAME).unwrap());

        stop.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_existing_key_is_adopted() {
        let store = KvStore::new();
        let existing = CaKey::generate().unwrap().pkcs8_der();
        store.set(KEY_NAME, existing.clone()).unwrap();

        let node = test_node("db-1", "10.0.0.1", store.clone());
        let (stop, shutdown) = watch::channel(false);
        let handle = spawn(&node, shutdown);

        wait_active(&node).await;
        assert_eq!(node.authority.active_key_der().unwrap(), existing);
        assert_eq!(store.get(KEY_NAME).unwrap(), existing);

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_key_is_logged_and_skipped() {
        let store = KvStore::new();
        store.set(KEY_NAME, b"not a key".to_vec()).unwrap();

        let node = test_node("db-1", "10.0.0.1", store.clone());
        let (stop, shutdown) = watch::channel(false);
        let handle = spawn(&node, shutdown);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!node.authority.is_active());
        assert!(!handle.is_finished());

        // a later valid key still gets installed
        let key = CaKey::generate().unwrap().pkcs8_der();
        store.set(KEY_NAME, key.clone()).unwrap();
        wait_active(&node).await;
        assert_eq!(node.authority.active_key_der().unwrap(), key);

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_key_written_before_ready_is_adopted() {
        let store = KvStore::new();
        let node = test_node("db-1", "10.0.0.1", store.clone());
        node.coordinator.set_ready(false);

        let (stop, shutdown) = watch::channel(false);
        let handle = spawn(&node, shutdown);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node.bootstrap.status().state, BootstrapState::Watching);

        // another node wins the race while this one is still waiting
        let theirs = CaKey::generate().unwrap().pkcs8_der();
        store.set(KEY_NAME, theirs.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!node.authority.is_active());

        node.coordinator.set_ready(true);
        wait_active(&node).await;

        assert_eq!(node.authority.active_key_der().unwrap(), theirs);
        assert_eq!(store.get(KEY_NAME).unwrap(), theirs);

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_waits_for_ready_and_honours_shutdown() {
        let store = KvStore::new();
        let node = test_node("db-1", "10.0.0.1", store.clone());
        node.coordinator.set_ready(false);

        let (stop, shutdown) = watch::channel(false);
        let handle = spawn(&node, shutdown);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get(KEY_NAME).is_err());
        assert_eq!(node.bootstrap.status().state, BootstrapState::Watching);

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!node.authority.is_active());
    }
}
