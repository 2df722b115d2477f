//! Connection string helper and a throwaway in-memory engine for tests.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{ChildStderr, Command};
use tokio::sync::{oneshot, OnceCell};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::network::{DEV_HTTP_PORT, SQL_PORT};
use crate::storage::ExecutableSource;

const TEST_LISTEN_PORT: u16 = 26259;
const TEST_SQL_PORT: u16 = 26258;

const CONNECT_ATTEMPTS: u32 = 120;
const CONNECT_RETRY: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection string for the supervised engine; valid whether or not it is running yet.
pub fn dsn() -> String {
    dsn_for_port(SQL_PORT)
}

fn dsn_for_port(port: u16) -> String {
    format!("postgresql://root@localhost:{}/defaultdb?sslmode=disable", port)
}

/// A running in-memory single node, separate from the supervised engine.
#[derive(Debug, Clone)]
pub struct LocalTestServer {
    pub dsn: String,
    pub pid: Option<u32>,
}

type SharedLaunch = std::result::Result<LocalTestServer, String>;

static TEST_SERVER: OnceLock<OnceCell<SharedLaunch>> = OnceLock::new();

/// Start the local test server once per process and return its DSN.
///
/// Later calls return the first call's result, failure included. The data lives in memory and
/// disappears with the process.
pub async fn local_test_server(executables: Arc<dyn ExecutableSource>) -> Result<String> {
    let cell = TEST_SERVER.get_or_init(OnceCell::new);
    let result = cell
        .get_or_init(|| async move {
            let executable = tokio::task::spawn_blocking(move || executables.resolve_executable())
                .await
                .map_err(Error::from)
                .and_then(|r| r)
                .map_err(|e| e.to_string())?;
            LocalTestServer::launch(&executable)
                .await
                .map_err(|e| e.to_string())
        })
        .await;

    match result {
        Ok(server) => Ok(server.dsn.clone()),
        Err(e) => Err(Error::Task(format!("local test server: {}", e))),
    }
}

impl LocalTestServer {
    /// Launch `executable` and wait until its SQL port accepts connections.
    pub async fn launch(executable: &Path) -> Result<Self> {
        let mut child = Command::new(executable)
            .args(test_server_args())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::ProcessLaunch {
                path: executable.to_path_buf(),
                source,
            })?;

        let pid = child.id();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        let (ended_tx, mut ended) = oneshot::channel::<std::io::Result<ExitStatus>>();
        tokio::spawn(async move {
            let _ = ended_tx.send(child.wait().await);
        });

        let mut last_error = String::new();
        for _ in 0..CONNECT_ATTEMPTS {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(("localhost", TEST_SQL_PORT))).await {
                Ok(Ok(_)) => {
                    let dsn = dsn_for_port(TEST_SQL_PORT);
                    info!("Local test server ready at {}", dsn);
                    return Ok(Self { dsn, pid });
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "connect timed out".to_string(),
            }

            match ended.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => {}
                Ok(status) => {
                    debug!("Local test server exit: {:?}", status);
                    return Err(Error::Task(
                        "engine ended before it accepted connections".to_string(),
                    ));
                }
                Err(oneshot::error::TryRecvError::Closed) => {
                    return Err(Error::Task(
                        "engine ended before it accepted connections".to_string(),
                    ));
                }
            }

            tokio::time::sleep(CONNECT_RETRY).await;
        }

        Err(Error::Task(format!(
            "failed to connect to local test server: {}",
            last_error
        )))
    }
}

fn test_server_args() -> Vec<String> {
    vec![
        "start-single-node".to_string(),
        "--insecure".to_string(),
        "--store=type=mem,size=50%".to_string(),
        format!("--listen-addr=localhost:{}", TEST_LISTEN_PORT),
        format!("--sql-addr=localhost:{}", TEST_SQL_PORT),
        "--http-addr".to_string(),
        format!("localhost:{}", DEV_HTTP_PORT),
    ]
}

/// Info and warning lines are routine startup chatter.
fn is_routine(line: &str) -> bool {
    matches!(line.as_bytes().first(), None | Some(b'I') | Some(b'W'))
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if !is_routine(line) {
                    warn!("[cockroach] {}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Reading test server stderr failed: {}", e);
                break;
            }
        }
    }
}
