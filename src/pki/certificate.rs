use rcgen::{
    CertificateParams, DistinguishedName, DnType, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
    SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use ring::digest;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use super::authority::ActiveCa;
use super::pem_file::{self, PemFile, CERTIFICATE_TAG, CERT_MODE, KEY_MODE, PRIVATE_KEY_TAG};
use super::{CLIENT_CERT_FILE, CLIENT_KEY_FILE, NODE_CERT_FILE, NODE_KEY_FILE};
use crate::error::{Error, Result};

/// Leaf certificates are valid for one year.
const LEAF_VALIDITY_DAYS: i64 = 365;

/// A certificate/key pair kept in the base directory.
#[derive(Debug, Clone)]
pub struct LeafIdentity {
    pub cert_file: &'static str,
    pub key_file: &'static str,
    pub common_name: &'static str,
    pub alt_names: Vec<String>,
}

impl LeafIdentity {
    /// node.crt / node.key, carrying this node's advertised names.
    pub fn node(alt_names: &[String]) -> Self {
        Self {
            cert_file: NODE_CERT_FILE,
            key_file: NODE_KEY_FILE,
            common_name: "node",
            alt_names: alt_names.to_vec(),
        }
    }

    /// client.root.crt / client.root.key
    pub fn client_root() -> Self {
        Self {
            cert_file: CLIENT_CERT_FILE,
            key_file: CLIENT_KEY_FILE,
            common_name: "root",
            alt_names: Vec::new(),
        }
    }
}

/// Why a pair was (re)issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    Missing,
    Unreadable,
    IssuerMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityAction {
    Kept,
    Issued(RotationReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityOutcome {
    pub common_name: &'static str,
    pub action: IdentityAction,
}

/// Check node and client pairs against the active CA, reissuing where needed.
pub(crate) fn reconcile(
    dir: &Path,
    ca: &ActiveCa,
    node_alt_names: &[String],
    now: OffsetDateTime,
) -> Result<Vec<IdentityOutcome>> {
    let identities = [LeafIdentity::node(node_alt_names), LeafIdentity::client_root()];

    let mut outcomes = Vec::with_capacity(identities.len());
    for identity in &identities {
        outcomes.push(check_or_create(dir, identity, ca, now)?);
    }
    Ok(outcomes)
}

fn check_or_create(
    dir: &Path,
    identity: &LeafIdentity,
    ca: &ActiveCa,
    now: OffsetDateTime,
) -> Result<IdentityOutcome> {
    let cert_path = dir.join(identity.cert_file);
    let key_path = dir.join(identity.key_file);

    let reason = if !cert_path.exists() || !key_path.exists() {
        Some(RotationReason::Missing)
    } else {
        // only the issuer common name is compared, not the signature chain
        match pem_file::read_certificate_file(&cert_path)
            .and_then(|der| pem_file::issuer_common_name(&der))
        {
            Ok(issuer) if issuer == ca.common_name => None,
            Ok(issuer) => {
                debug!(
                    "{} issued by {}, current CA is {}",
                    identity.cert_file, issuer, ca.common_name
                );
                Some(RotationReason::IssuerMismatch)
            }
            Err(e) => {
                debug!("Cannot read {}: {}", cert_path.display(), e);
                Some(RotationReason::Unreadable)
            }
        }
    };

    let action = match reason {
        None => IdentityAction::Kept,
        Some(reason) => {
            issue(dir, identity, ca, now)?;
            info!(
                event = "pki:leaf:issued",
                "Issued {} certificate ({:?})", identity.common_name, reason
            );
            IdentityAction::Issued(reason)
        }
    };

    Ok(IdentityOutcome {
        common_name: identity.common_name,
        action,
    })
}

/// Generate a new key and a CA-signed certificate, replacing any previous pair.
fn issue(dir: &Path, identity: &LeafIdentity, ca: &ActiveCa, now: OffsetDateTime) -> Result<()> {
    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let key_der = key_pair.serialize_der();

    let mut params = CertificateParams::default();

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, identity.common_name);
    params.distinguished_name = distinguished_name;

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::DataEncipherment,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.serial_number = Some(serial_from_key(&key_der));
    params.not_before = now;
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
    params.subject_alt_names = identity
        .alt_names
        .iter()
        .map(|name| subject_alt_name(name))
        .collect::<Result<Vec<_>>>()?;

    let cert = params.signed_by(&key_pair, &ca.certificate, ca.key.key_pair())?;

    fs::create_dir_all(dir).map_err(|e| Error::io("create", dir, e))?;
    pem_file::write_pem_files(&[
        PemFile {
            path: dir.join(identity.key_file),
            tag: PRIVATE_KEY_TAG,
            der: &key_der,
            mode: KEY_MODE,
        },
        PemFile {
            path: dir.join(identity.cert_file),
            tag: CERTIFICATE_TAG,
            der: cert.der(),
            mode: CERT_MODE,
        },
    ])
}

/// Classify an alt-name as an IP literal or a DNS name.
pub fn subject_alt_name(name: &str) -> Result<SanType> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let dns = Ia5String::try_from(name.to_string())?;
    Ok(SanType::DnsName(dns))
}

/// Serial derived from the key material: first 16 bytes of its SHA-256, kept positive.
fn serial_from_key(key_der: &[u8]) -> SerialNumber {
    let hash = digest::digest(&digest::SHA256, key_der);
    let mut bytes = hash.as_ref()[..16].to_vec();
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}
