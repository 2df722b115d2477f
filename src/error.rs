use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by the identity, provisioning and supervision components.
///
/// None of these are fatal to the daemon: the bootstrap and supervisor loops log them and carry
/// on with their next iteration.
#[derive(Error, Debug)]
pub enum Error {
    /// The supplied key cannot be used to sign certificates.
    #[error("unsupported private key type {algorithm} (must be an ECDSA P-256 signing key)")]
    KeyType { algorithm: String },

    /// X.509 construction or parsing failed.
    #[error("certificate generation failed: {0}")]
    CertGen(String),

    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Streamed digest did not match the release manifest.
    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    Checksum {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("failed to launch {}: {source}", path.display())]
    ProcessLaunch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Peer or cloud-metadata lookup failed.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// HTTP transfer or release manifest problem.
    #[error("release fetch failed: {0}")]
    Fetch(String),

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Error::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<rcgen::Error> for Error {
    fn from(err: rcgen::Error) -> Self {
        Error::CertGen(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Fetch(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            Error::Task(format!("panicked: {}", err))
        } else {
            Error::Task(err.to_string())
        }
    }
}
