pub mod local;
pub mod process;

pub use local::{dsn, local_test_server};
use process::{CommandLauncher, Launcher, ProcessTable, SystemProcessTable};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::{
    build_launch_args, cluster_name, resolve_peers, CloudInfo, CloudMetadata, DeploymentMode,
    LaunchSettings, PeerSource,
};
use crate::pki::{NODE_CERT_FILE, NODE_KEY_FILE};
use crate::registry::Coordinator;
use crate::storage::ExecutableSource;

/// Supervisor settings, usually taken from [`Config`]
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub mode: DeploymentMode,
    pub binary_name: String,
    pub peer_source: PeerSource,
    pub cluster_name: Option<String>,
    /// Certificates directory, passed as `--certs-dir`
    pub base_dir: PathBuf,
    /// The on-disk store lives in `<cache_dir>/db`
    pub cache_dir: PathBuf,
    pub startup_delay: Duration,
    pub check_interval: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.engine.mode,
            binary_name: config.engine.binary_name.clone(),
            peer_source: config.engine.peer_source,
            cluster_name: config.engine.cluster_name.clone(),
            base_dir: config.paths.base_dir.clone(),
            cache_dir: config.paths.cache_dir.clone(),
            startup_delay: Duration::from_secs(config.supervisor.startup_delay_secs),
            check_interval: Duration::from_secs(config.supervisor.check_interval_secs),
        }
    }
}

/// Result of one liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// An engine process exists, nothing to do
    AlreadyRunning,
    /// Standard mode without node.crt/node.key yet
    AwaitingIdentity,
    Launched { pid: u32 },
}

/// Keeps exactly one engine process running on this host.
pub struct Supervisor {
    settings: SupervisorSettings,
    coordinator: Arc<dyn Coordinator>,
    cloud: Arc<dyn CloudMetadata>,
    executables: Arc<dyn ExecutableSource>,
    processes: Arc<dyn ProcessTable>,
    launcher: Arc<dyn Launcher>,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        coordinator: Arc<dyn Coordinator>,
        cloud: Arc<dyn CloudMetadata>,
        executables: Arc<dyn ExecutableSource>,
    ) -> Self {
        Self {
            settings,
            coordinator,
            cloud,
            executables,
            processes: Arc::new(SystemProcessTable::new()),
            launcher: Arc::new(CommandLauncher),
        }
    }

    pub fn with_process_table(mut self, processes: Arc<dyn ProcessTable>) -> Self {
        self.processes = processes;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Check once after the startup delay, then on every interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Supervising {} ({} mode, every {:?})",
            self.settings.binary_name, self.settings.mode, self.settings.check_interval
        );

        tokio::select! {
            _ = tokio::time::sleep(self.settings.startup_delay) => {}
            _ = shutdown.changed() => return,
        }

        // the first check may download a release, so the ticker starts after it
        self.checked_cycle().await;

        let mut ticker = interval(self.settings.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    self.checked_cycle().await;
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Supervisor stopped");
    }

    /// Run one check on its own task so a panic is logged instead of ending the loop.
    pub async fn checked_cycle(self: &Arc<Self>) -> Option<CheckOutcome> {
        let this = Arc::clone(self);
        let result = tokio::spawn(async move { this.check().await })
            .await
            .map_err(Error::from)
            .and_then(|r| r);

        match result {
            Ok(outcome) => {
                debug!("Engine check: {:?}", outcome);
                Some(outcome)
            }
            Err(e) => {
                error!(event = "supervisor:check:error", error = %e, "Engine check failed");
                None
            }
        }
    }

    /// Make sure the engine runs, launching it if needed.
    pub async fn check(&self) -> Result<CheckOutcome> {
        if !self.processes.pids_of(&self.settings.binary_name).is_empty() {
            return Ok(CheckOutcome::AlreadyRunning);
        }

        let standard = self.settings.mode == DeploymentMode::Standard;
        if standard && !self.has_node_identity() {
            info!("Node certificate not issued yet, holding engine launch");
            return Ok(CheckOutcome::AwaitingIdentity);
        }

        let executables = Arc::clone(&self.executables);
        let executable = tokio::task::spawn_blocking(move || executables.resolve_executable()).await??;

        let (peers, cloud) = if standard {
            (self.load_peers().await, self.load_cloud().await)
        } else {
            (Vec::new(), CloudInfo::default())
        };

        let launch = LaunchSettings {
            store_dir: self.settings.cache_dir.join("db"),
            certs_dir: self.settings.base_dir.clone(),
            cluster_name: cluster_name(
                &self.coordinator.domain(),
                self.settings.cluster_name.as_deref(),
            ),
        };
        let args = build_launch_args(&peers, &cloud, self.settings.mode, &launch);

        debug!("About to launch: {} {}", executable.display(), args.join(" "));
        let pid = self.launcher.launch(&executable, &args)?;
        info!(event = "supervisor:launch", pid, "Launched {}", executable.display());

        Ok(CheckOutcome::Launched { pid })
    }

    fn has_node_identity(&self) -> bool {
        self.settings.base_dir.join(NODE_CERT_FILE).is_file()
            && self.settings.base_dir.join(NODE_KEY_FILE).is_file()
    }

    async fn load_peers(&self) -> Vec<String> {
        match resolve_peers(self.coordinator.as_ref(), self.settings.peer_source).await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(event = "supervisor:peers:error", error = %e, "Peer discovery failed");
                Vec::new()
            }
        }
    }

    async fn load_cloud(&self) -> CloudInfo {
        match self.cloud.load().await {
            Ok(info) => info,
            Err(e) => {
                warn!(event = "supervisor:cloud:error", error = %e, "Cloud metadata unavailable");
                CloudInfo::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::StaticCloudMetadata;
    use crate::registry::{KvStore, LocalCoordinator, NodeInfo};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FakeProcesses {
        pids: Vec<u32>,
    }

    impl ProcessTable for FakeProcesses {
        fn pids_of(&self, _name: &str) -> Vec<u32> {
            self.pids.clone()
        }
    }

    struct PanickingProcesses;

    impl ProcessTable for PanickingProcesses {
        fn pids_of(&self, _name: &str) -> Vec<u32> {
            panic!("process table unavailable");
        }
    }

    #[derive(Default)]
    struct RecordingLauncher {
        launches: Mutex<Vec<(PathBuf, Vec<String>)>>,
    }

    impl RecordingLauncher {
        fn launches(&self) -> Vec<(PathBuf, Vec<String>)> {
            self.launches.lock().unwrap().clone()
        }
    }

    impl Launcher for RecordingLauncher {
        fn launch(&self, executable: &Path, args: &[String]) -> Result<u32> {
            let mut launches = self.launches.lock().unwrap();
            launches.push((executable.to_path_buf(), args.to_vec()));
            Ok(4242 + launches.len() as u32)
        }
    }

    struct FixedExecutable(Result<PathBuf>);

    impl ExecutableSource for FixedExecutable {
        fn resolve_executable(&self) -> Result<PathBuf> {
            match &self.0 {
                Ok(path) => Ok(path.clone()),
                Err(e) => Err(Error::NotFound(e.to_string())),
            }
        }
    }

    struct BrokenCloud;

    #[async_trait]
    impl CloudMetadata for BrokenCloud {
        async fn load(&self) -> Result<CloudInfo> {
            Err(Error::Discovery("metadata service unreachable".to_string()))
        }
    }

    struct Fixture {
        dir: TempDir,
        launcher: Arc<RecordingLauncher>,
        peers: Vec<String>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                launcher: Arc::new(RecordingLauncher::default()),
                peers: vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()],
            }
        }

        fn settings(&self, mode: DeploymentMode) -> SupervisorSettings {
            SupervisorSettings {
                mode,
                binary_name: "cockroach".to_string(),
                peer_source: PeerSource::Enumerate,
                cluster_name: None,
                base_dir: self.dir.path().join("certs"),
                cache_dir: self.dir.path().join("cache"),
                startup_delay: Duration::ZERO,
                check_interval: Duration::from_secs(3600),
            }
        }

        fn write_node_identity(&self) {
            let certs = self.dir.path().join("certs");
            std::fs::create_dir_all(&certs).unwrap();
            std::fs::write(certs.join(NODE_CERT_FILE), "cert").unwrap();
            std::fs::write(certs.join(NODE_KEY_FILE), "key").unwrap();
        }

        fn supervisor(
            &self,
            mode: DeploymentMode,
            pids: Vec<u32>,
            cloud: Arc<dyn CloudMetadata>,
            executable: Result<PathBuf>,
        ) -> Arc<Supervisor> {
            let coordinator = Arc::new(LocalCoordinator::new(
                NodeInfo {
                    name: "db-1".to_string(),
                    domain: "eu.example.com".to_string(),
                    ip: "10.0.0.1".parse().unwrap(),
                    alt_names: Vec::new(),
                },
                self.peers.clone(),
                KvStore::new(),
            ));
            Arc::new(
                Supervisor::new(
                    self.settings(mode),
                    coordinator,
                    cloud,
                    Arc::new(FixedExecutable(executable)),
                )
                .with_process_table(Arc::new(FakeProcesses { pids }))
                .with_launcher(self.launcher.clone()),
            )
        }
    }

    fn no_cloud() -> Arc<dyn CloudMetadata> {
        Arc::new(StaticCloudMetadata::from_config(&Default::default()))
    }

    fn engine() -> Result<PathBuf> {
        Ok(PathBuf::from("/opt/cockroach/cockroach"))
    }

    #[tokio::test]
    async fn test_running_engine_is_left_alone() {
        let fixture = Fixture::new();
        let supervisor = fixture.supervisor(DeploymentMode::Dev, vec![777], no_cloud(), engine());

        assert_eq!(supervisor.check().await.unwrap(), CheckOutcome::AlreadyRunning);
        assert!(fixture.launcher.launches().is_empty());
    }

    #[tokio::test]
    async fn test_missing_engine_is_launched_once() {
        let fixture = Fixture::new();
        let supervisor = fixture.supervisor(DeploymentMode::Dev, Vec::new(), no_cloud(), engine());

        let outcome = supervisor.check().await.unwrap();
        assert!(matches!(outcome, CheckOutcome::Launched { .. }));

        let launches = fixture.launcher.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].0, PathBuf::from("/opt/cockroach/cockroach"));
        assert_eq!(launches[0].1[0], "start-single-node");
    }

    #[tokio::test]
    async fn test_standard_mode_waits_for_identity() {
        let fixture = Fixture::new();
        let supervisor =
            fixture.supervisor(DeploymentMode::Standard, Vec::new(), no_cloud(), engine());

        assert_eq!(supervisor.check().await.unwrap(), CheckOutcome::AwaitingIdentity);
        assert!(fixture.launcher.launches().is_empty());
    }

    #[tokio::test]
    async fn test_standard_launch_joins_peers_despite_cloud_failure() {
        let fixture = Fixture::new();
        fixture.write_node_identity();
        let supervisor =
            fixture.supervisor(DeploymentMode::Standard, Vec::new(), Arc::new(BrokenCloud), engine());

        supervisor.check().await.unwrap();

        let launches = fixture.launcher.launches();
        assert_eq!(launches.len(), 1);
        let args = &launches[0].1;
        assert_eq!(args[0], "start");
        assert!(args.contains(&"eu".to_string()));
        assert!(args.contains(&format!("--certs-dir={}", fixture.dir.path().join("certs").display())));
        assert!(!args.iter().any(|a| a.starts_with("--advertise-addr")));
        assert_eq!(args.last().unwrap(), "--join=10.0.0.2:36257,10.0.0.3:36257");
    }

    #[tokio::test]
    async fn test_bad_peer_does_not_block_launch() {
        let mut fixture = Fixture::new();
        fixture.peers = vec!["10.0.0.2".to_string(), "db-3:notaport".to_string()];
        fixture.write_node_identity();
        let supervisor =
            fixture.supervisor(DeploymentMode::Standard, Vec::new(), no_cloud(), engine());

        for _ in 0..3 {
            supervisor.checked_cycle().await.unwrap();
        }

        let launches = fixture.launcher.launches();
        assert_eq!(launches.len(), 3);
        assert_eq!(launches[0].1.last().unwrap(), "--join=10.0.0.2:36257");
    }

    #[tokio::test]
    async fn test_unresolvable_executable_is_an_error() {
        let fixture = Fixture::new();
        let supervisor = fixture.supervisor(
            DeploymentMode::Dev,
            Vec::new(),
            no_cloud(),
            Err(Error::Fetch("offline".to_string())),
        );

        assert!(supervisor.check().await.is_err());
        assert!(supervisor.checked_cycle().await.is_none());
        assert!(fixture.launcher.launches().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_check_is_contained() {
        let fixture = Fixture::new();
        let coordinator = Arc::new(LocalCoordinator::new(
            NodeInfo {
                name: "db-1".to_string(),
                domain: "eu.example.com".to_string(),
                ip: "10.0.0.1".parse().unwrap(),
                alt_names: Vec::new(),
            },
            Vec::new(),
            KvStore::new(),
        ));
        let supervisor = Arc::new(
            Supervisor::new(
                fixture.settings(DeploymentMode::Dev),
                coordinator,
                no_cloud(),
                Arc::new(FixedExecutable(engine())),
            )
            .with_process_table(Arc::new(PanickingProcesses))
            .with_launcher(fixture.launcher.clone()),
        );

        assert!(supervisor.checked_cycle().await.is_none());
    }

    #[tokio::test]
    async fn test_run_launches_then_stops() {
        let fixture = Fixture::new();
        let supervisor = fixture.supervisor(DeploymentMode::Dev, Vec::new(), no_cloud(), engine());

        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(supervisor.run(shutdown));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fixture.launcher.launches().len(), 1);

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fixture.launcher.launches().len(), 1);
    }
}
