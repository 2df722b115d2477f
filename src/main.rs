mod config;
mod error;
mod network;
mod pki;
mod registry;
mod storage;
mod supervisor;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use config::Config;
use network::StaticCloudMetadata;
use pki::{CertificateAuthority, IdentityAction};
use registry::{CaBootstrap, KvStore, LocalCoordinator, NodeInfo};
use storage::{ExecutableSource, Provisioner};
use supervisor::{Supervisor, SupervisorSettings};

/// Get system config file path
fn get_system_config_path() -> PathBuf {
    PathBuf::from("/etc/roachkeeper/config.toml")
}

/// Get development config file path (fallback)
fn get_dev_config_path() -> PathBuf {
    PathBuf::from("config.toml")
}

/// Discover config file with priority order
fn discover_config(cli_path: Option<PathBuf>) -> Option<PathBuf> {
    // Priority 1: CLI specified path
    if let Some(path) = cli_path {
        warn!("Using custom config path: {}", path.display());
        return Some(path);
    }

    // Priority 2: System config /etc/roachkeeper/config.toml
    let system_config = get_system_config_path();
    if system_config.exists() {
        return Some(system_config);
    }

    // Priority 3: Development config ./config.toml
    let dev_config = get_dev_config_path();
    if dev_config.exists() {
        warn!("Using development config: {}", dev_config.display());
        return Some(dev_config);
    }

    None
}

/// Load the discovered config, falling back to built-in defaults
fn load_config(cli_path: Option<PathBuf>) -> Result<Config> {
    match discover_config(cli_path) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => {
            warn!("No config file found, using defaults. Run 'roachkeeper init-config' to create one");
            Ok(Config::default())
        }
    }
}

#[derive(Parser)]
#[command(name = "roachkeeper")]
#[command(about = "Keeps a CockroachDB node running on every fleet host, with a shared CA")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the CA bootstrap and the engine supervisor (default)
    Run,

    /// Print the connection string of the local engine
    Dsn,

    /// Resolve the engine binary, downloading a release if needed
    Fetch {
        /// Release to fetch instead of the configured one
        #[arg(long)]
        version: Option<String>,

        /// Save the verified archive here instead of installing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check node and client certificates against the CA on disk, reissuing as needed
    Issue,

    /// Start an in-memory single node for tests and print its DSN
    TestServer,

    /// Write a default configuration file
    InitConfig {
        /// Destination (defaults to /etc/roachkeeper/config.toml)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command {
        None | Some(Commands::Run) => {
            let config = load_config(cli.config)?;
            run_daemon(config).await?;
        }

        Some(Commands::Dsn) => {
            println!("{}", supervisor::dsn());
        }

        Some(Commands::Fetch { version, output }) => {
            let config = load_config(cli.config)?;
            fetch_release(&config, version, output).await?;
        }

        Some(Commands::Issue) => {
            let config = load_config(cli.config)?;
            issue_identities(&config).await?;
        }

        Some(Commands::TestServer) => {
            let config = load_config(cli.config)?;
            run_test_server(&config).await?;
        }

        Some(Commands::InitConfig { output, force }) => {
            let path = output.unwrap_or_else(get_system_config_path);
            init_config(&path, force)?;
        }

        Some(Commands::Version) => {
            show_version();
        }
    }

    Ok(())
}

/// Alt-names for node.crt: configured names plus the node address
fn node_alt_names(config: &Config) -> Vec<String> {
    let mut names = config.node.alt_names.clone();
    let ip = config.node.ip.to_string();
    if !names.contains(&ip) {
        names.push(ip);
    }
    names
}

async fn run_daemon(config: Config) -> Result<()> {
    info!("🚀 Starting roachkeeper on node {}", config.node.name);

    config.validate()?;
    config.ensure_directories()?;

    let alt_names = node_alt_names(&config);
    let authority = Arc::new(CertificateAuthority::new(
        &config.paths.base_dir,
        alt_names.clone(),
    ));

    // the CA on disk is installed before the bootstrap starts watching
    let loader = authority.clone();
    match tokio::task::spawn_blocking(move || loader.load_from_disk()).await? {
        Ok(Some(_)) => info!(
            "Loaded CA {} from {}",
            authority.common_name().unwrap_or_default(),
            config.paths.base_dir.display()
        ),
        Ok(None) => info!("No CA key on disk yet, waiting for the shared key"),
        Err(e) => warn!(event = "pki:ca:load_error", error = %e, "Ignoring unusable CA key on disk"),
    }

    let store = KvStore::new();
    if let Some(der) = authority.active_key_der() {
        store.set_if_absent(&config.bootstrap.ca_key_name, der)?;
    }

    let coordinator = Arc::new(LocalCoordinator::new(
        NodeInfo {
            name: config.node.name.clone(),
            domain: config.node.domain.clone(),
            ip: config.node.ip,
            alt_names,
        },
        config.cluster.peers.clone(),
        store,
    ));

    let bootstrap = Arc::new(CaBootstrap::new(
        coordinator.clone(),
        authority.clone(),
        config.bootstrap.ca_key_name.clone(),
        Duration::from_secs(config.bootstrap.settle_delay_secs),
    ));

    let mut transitions = bootstrap.subscribe();
    tokio::spawn(async move {
        while transitions.changed().await.is_ok() {
            let status = *transitions.borrow_and_update();
            debug!("CA bootstrap {:?}, key {:?}", status.state, status.key);
        }
    });

    let provisioner = Arc::new(Provisioner::new(&config.engine, &config.paths.cache_dir));
    let cloud = Arc::new(StaticCloudMetadata::from_config(&config.cloud));
    let supervisor = Arc::new(Supervisor::new(
        SupervisorSettings::from_config(&config),
        coordinator,
        cloud,
        provisioner,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn CA bootstrap task
    let bootstrap_shutdown = shutdown_rx.clone();
    let runner = bootstrap.clone();
    let bootstrap_task = tokio::spawn(async move {
        if let Err(e) = runner.run(bootstrap_shutdown).await {
            error!("CA bootstrap error: {}", e);
        }
    });

    // Spawn supervisor task
    let supervisor_task = tokio::spawn(supervisor.run(shutdown_rx));

    info!("Engine mode: {}", config.engine.mode);
    info!("Certificates in {}", config.paths.base_dir.display());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("🛑 Shutting down");
    let _ = shutdown_tx.send(true);

    let (bootstrap_result, supervisor_result) = tokio::join!(bootstrap_task, supervisor_task);
    bootstrap_result.context("CA bootstrap task failed")?;
    info!("CA bootstrap stopped while {:?}", bootstrap.status().state);
    supervisor_result.context("Supervisor task failed")?;

    Ok(())
}

async fn fetch_release(
    config: &Config,
    version: Option<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut provisioner = Provisioner::new(&config.engine, &config.paths.cache_dir);
    if let Some(version) = version {
        provisioner = provisioner.with_version(version);
    }

    let path = tokio::task::spawn_blocking(move || -> error::Result<PathBuf> {
        match output {
            Some(path) => {
                let release = provisioner.resolve_configured()?;
                release.download_to(&path)?;
                Ok(path)
            }
            None => provisioner.resolve_executable(),
        }
    })
    .await??;

    println!("{}", path.display());
    Ok(())
}

async fn issue_identities(config: &Config) -> Result<()> {
    let authority = CertificateAuthority::new(&config.paths.base_dir, node_alt_names(config));

    // installing the key already reconciles, so its outcomes are the report
    let outcomes = tokio::task::spawn_blocking(move || -> error::Result<_> {
        authority.load_from_disk()?.ok_or_else(|| {
            error::Error::NotFound(format!("CA key in {}", authority.dir().display()))
        })
    })
    .await?
    .context("Failed to reconcile certificates. Run 'roachkeeper run' first")?;

    for outcome in outcomes {
        match outcome.action {
            IdentityAction::Kept => println!("✅ {}: up to date", outcome.common_name),
            IdentityAction::Issued(reason) => {
                println!("🔑 {}: issued ({:?})", outcome.common_name, reason)
            }
        }
    }

    Ok(())
}

async fn run_test_server(config: &Config) -> Result<()> {
    let provisioner: Arc<dyn ExecutableSource> =
        Arc::new(Provisioner::new(&config.engine, &config.paths.cache_dir));

    let dsn = supervisor::local_test_server(provisioner).await?;
    println!("{}", dsn);
    info!("Test server running, press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    Ok(())
}

fn init_config(path: &PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite",
            path.display()
        );
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let config = Config::default();
    config.to_file(path)?;

    println!("✅ Configuration saved to {}", path.display());
    println!("💡 Edit [node] and [cluster] before running: roachkeeper run");
    Ok(())
}

fn show_version() {
    println!("🪳 roachkeeper");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "Binary: {}",
        std::env::current_exe()
            .unwrap_or_else(|_| PathBuf::from("unknown"))
            .display()
    );
    println!();
    println!("📋 Configuration:");

    let config_paths = [get_system_config_path(), get_dev_config_path()];
    for (i, path) in config_paths.iter().enumerate() {
        let status = if path.exists() { "✅" } else { "❌" };
        println!("  {}. Config: {} {}", i + 1, status, path.display());
    }

    println!();
    println!("🔌 Local engine: {}", supervisor::dsn());
}
