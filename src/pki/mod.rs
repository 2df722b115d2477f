pub mod authority;
pub mod certificate;
pub mod pem_file;

pub use authority::CertificateAuthority;
pub use certificate::IdentityAction;

use rcgen::{KeyPair, PKCS_ECDSA_P256_SHA256};
use std::fmt;
use time::OffsetDateTime;

use crate::error::{Error, Result};

pub const CA_KEY_FILE: &str = "ca.key";
pub const CA_CERT_FILE: &str = "ca.crt";
pub const NODE_KEY_FILE: &str = "node.key";
pub const NODE_CERT_FILE: &str = "node.crt";
pub const CLIENT_KEY_FILE: &str = "client.root.key";
pub const CLIENT_CERT_FILE: &str = "client.root.crt";

/// Source of "now" for certificate validity windows.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A private key that can sign certificates for the shared CA.
///
/// Only ECDSA P-256 is accepted. Anything else is rejected with [`Error::KeyType`] when the key
/// is parsed, so the CA code never has to check the algorithm again.
pub enum CaKey {
    EcdsaP256(KeyPair),
}

impl CaKey {
    /// Generate a fresh P-256 key.
    pub fn generate() -> Result<Self> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        Ok(CaKey::EcdsaP256(key_pair))
    }

    /// Parse PKCS#8 DER as delivered by the replicated key.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let key_pair = KeyPair::try_from(der).map_err(|e| Error::KeyType {
            algorithm: format!("unrecognized PKCS#8 key ({})", e),
        })?;
        Self::from_key_pair(key_pair)
    }

    pub fn from_key_pair(key_pair: KeyPair) -> Result<Self> {
        if key_pair.algorithm() == &PKCS_ECDSA_P256_SHA256 {
            Ok(CaKey::EcdsaP256(key_pair))
        } else {
            Err(Error::KeyType {
                algorithm: format!("{:?}", key_pair.algorithm()),
            })
        }
    }

    pub fn key_pair(&self) -> &KeyPair {
        match self {
            CaKey::EcdsaP256(key_pair) => key_pair,
        }
    }

    /// SubjectPublicKeyInfo DER.
    pub fn public_key_der(&self) -> Vec<u8> {
        self.key_pair().public_key_der()
    }

    /// PKCS#8 DER, the form stored in the replicated key and in ca.key.
    pub fn pkcs8_der(&self) -> Vec<u8> {
        self.key_pair().serialize_der()
    }
}

impl fmt::Debug for CaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaKey::EcdsaP256(_) => f.write_str("CaKey::EcdsaP256(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_round_trips_through_pkcs8() {
        let key = CaKey::generate().unwrap();
        let parsed = CaKey::from_pkcs8_der(&key.pkcs8_der()).unwrap();
        assert_eq!(key.public_key_der(), parsed.public_key_der());
    }

    #[test]
    fn test_rejects_ed25519() {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ED25519).unwrap();
        let err = CaKey::from_pkcs8_der(&key_pair.serialize_der()).unwrap_err();
        assert!(matches!(err, Error::KeyType { .. }));
    }

    #[test]
    fn test_rejects_p384() {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).unwrap();
        let err = CaKey::from_key_pair(key_pair).unwrap_err();
        assert!(matches!(err, Error::KeyType { .. }));
    }

    #[test]
    fn test_rejects_garbage() {
        let err = CaKey::from_pkcs8_der(b"definitely not a key").unwrap_err();
        assert!(matches!(err, Error::KeyType { .. }));
    }
}
