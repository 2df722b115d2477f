use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyUsagePurpose,
    SerialNumber,
};
use ring::digest;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use super::certificate::{self, IdentityOutcome};
use super::pem_file::{self, PemFile, CERTIFICATE_TAG, CERT_MODE, KEY_MODE, PRIVATE_KEY_TAG};
use super::{CaKey, Clock, SystemClock, CA_CERT_FILE, CA_KEY_FILE};
use crate::error::{Error, Result};

/// Prefix of every CA common name; the rest is the public key hash.
pub const CA_NAME_PREFIX: &str = "CockroachDB CA #";

/// CA certificates are valid for roughly ten years.
const CA_VALIDITY_DAYS: i64 = 10 * 365;

/// The CA currently used for signing.
pub(crate) struct ActiveCa {
    pub key: CaKey,
    pub certificate: rcgen::Certificate,
    pub common_name: String,
}

/// Node-local certificate authority built from the fleet-wide shared CA key.
///
/// Every node regenerates its own self-signed CA certificate from the shared key. The
/// certificates differ (validity window, signature) but carry the same common name and public
/// key, so a leaf issued on any node verifies against the CA certificate of any other node.
pub struct CertificateAuthority {
    dir: PathBuf,
    node_alt_names: Vec<String>,
    clock: Arc<dyn Clock>,
    state: Mutex<Option<ActiveCa>>,
}

impl CertificateAuthority {
    /// Create an authority persisting into `dir`, issuing node.crt with `node_alt_names`.
    pub fn new(dir: impl Into<PathBuf>, node_alt_names: Vec<String>) -> Self {
        Self::with_clock(dir, node_alt_names, Arc::new(SystemClock))
    }

    pub fn with_clock(
        dir: impl Into<PathBuf>,
        node_alt_names: Vec<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dir: dir.into(),
            node_alt_names,
            clock,
            state: Mutex::new(None),
        }
    }

    /// Directory holding ca.*, node.* and client.root.*
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Install a new shared CA key.
    ///
    /// Builds a fresh self-signed CA certificate, persists ca.key/ca.crt, swaps the in-memory
    /// CA and reconciles the node and client certificates. On error the previous CA (if any)
    /// stays in place.
    pub fn set_private_key(&self, key: CaKey) -> Result<Vec<IdentityOutcome>> {
        let mut state = self.lock();

        let key_der = key.pkcs8_der();
        let common_name = ca_common_name(&key.public_key_der());
        let now = self.clock.now();

        let certificate = build_ca_certificate(&key, &common_name, now)?;
        // make sure what we produced parses before anyone relies on it
        pem_file::subject_common_name(certificate.der())?;

        fs::create_dir_all(&self.dir).map_err(|e| Error::io("create", &self.dir, e))?;
        debug!(event = "pki:ca:write", "Writing CA material to {}", self.dir.display());

        pem_file::write_pem_files(&[
            PemFile {
                path: self.dir.join(CA_KEY_FILE),
                tag: PRIVATE_KEY_TAG,
                der: &key_der,
                mode: KEY_MODE,
            },
            PemFile {
                path: self.dir.join(CA_CERT_FILE),
                tag: CERTIFICATE_TAG,
                der: certificate.der(),
                mode: CERT_MODE,
            },
        ])?;

        info!(event = "pki:ca:installed", "Installed CA {}", common_name);

        *state = Some(ActiveCa {
            key,
            certificate,
            common_name,
        });
        drop(state);

        self.reconcile_identity()
    }

    /// Parse PKCS#8 DER and install it as the shared CA key.
    pub fn set_private_key_der(&self, der: &[u8]) -> Result<Vec<IdentityOutcome>> {
        let key = CaKey::from_pkcs8_der(der)?;
        self.set_private_key(key)
    }

    /// Install ca.key from disk if present, returning what the install reconciled.
    ///
    /// `None` when there is no ca.key.
    pub fn load_from_disk(&self) -> Result<Option<Vec<IdentityOutcome>>> {
        let path = self.dir.join(CA_KEY_FILE);
        match pem_file::read_private_key_file(&path) {
            Ok(der) => {
                info!("Loading CA key from {}", path.display());
                self.set_private_key_der(&der).map(Some)
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Issue or rotate node and client certificates against the current CA.
    pub fn reconcile_identity(&self) -> Result<Vec<IdentityOutcome>> {
        let state = self.lock();
        let active = state
            .as_ref()
            .ok_or_else(|| Error::NotFound("active CA".to_string()))?;

        certificate::reconcile(&self.dir, active, &self.node_alt_names, self.clock.now())
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    /// Subject CN of the active CA certificate.
    pub fn common_name(&self) -> Option<String> {
        self.lock().as_ref().map(|ca| ca.common_name.clone())
    }

    /// PKCS#8 DER of the active shared key.
    pub fn active_key_der(&self) -> Option<Vec<u8>> {
        self.lock().as_ref().map(|ca| ca.key.pkcs8_der())
    }

    /// DER of this node's CA certificate.
    #[cfg(test)]
    pub fn ca_certificate_der(&self) -> Option<Vec<u8>> {
        self.lock().as_ref().map(|ca| ca.certificate.der().to_vec())
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveCa>> {
        // a panic while holding the lock leaves either the old or the new CA, both usable
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deterministic CA common name for a public key (SubjectPublicKeyInfo DER).
pub fn ca_common_name(public_key_der: &[u8]) -> String {
    let hash = digest::digest(&digest::SHA256, public_key_der);
    format!("{}{}", CA_NAME_PREFIX, URL_SAFE_NO_PAD.encode(hash.as_ref()))
}

fn build_ca_certificate(
    key: &CaKey,
    common_name: &str,
    now: OffsetDateTime,
) -> Result<rcgen::Certificate> {
    let mut params = CertificateParams::default();

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, common_name);
    params.distinguished_name = distinguished_name;

    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(1));
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    params.serial_number = Some(SerialNumber::from_slice(&[1]));
    params.not_before = now;
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    let cert = params.self_signed(key.key_pair())?;
    Ok(cert)
}
