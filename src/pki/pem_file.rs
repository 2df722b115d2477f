//! PEM persistence for keys and certificates.
//!
//! Every file is written to a `~` sibling first and renamed into place, so a reader never sees
//! a half-written key or certificate.

use pem::{EncodeConfig, LineEnding, Pem};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";
pub const CERTIFICATE_TAG: &str = "CERTIFICATE";

/// Owner-only, for private keys
pub const KEY_MODE: u32 = 0o600;
/// World-readable, for certificates
pub const CERT_MODE: u32 = 0o644;

/// One file to be written by [`write_pem_files`].
pub struct PemFile<'a> {
    pub path: PathBuf,
    pub tag: &'static str,
    pub der: &'a [u8],
    pub mode: u32,
}

/// Encode DER bytes as a PEM block with `\n` line endings.
pub fn encode(tag: &str, der: &[u8]) -> String {
    let block = Pem::new(tag, der.to_vec());
    pem::encode_config(&block, EncodeConfig::new().set_line_ending(LineEnding::LF))
}

/// Read a PEM file and return the DER contents of its first block.
///
/// A missing file is [`Error::NotFound`]; a malformed file or an unexpected block type is
/// [`Error::CertGen`].
pub fn read_pem_file(path: &Path, tag: &str) -> Result<Vec<u8>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(path.display().to_string()))
        }
        Err(e) => return Err(Error::io("read", path, e)),
    };

    let block = pem::parse(&data)
        .map_err(|e| Error::CertGen(format!("malformed PEM file {}: {}", path.display(), e)))?;

    if block.tag() != tag {
        return Err(Error::CertGen(format!(
            "invalid PEM data type in {}: {}",
            path.display(),
            block.tag()
        )));
    }

    Ok(block.contents().to_vec())
}

pub fn read_certificate_file(path: &Path) -> Result<Vec<u8>> {
    read_pem_file(path, CERTIFICATE_TAG)
}

pub fn read_private_key_file(path: &Path) -> Result<Vec<u8>> {
    read_pem_file(path, PRIVATE_KEY_TAG)
}

/// Write a single PEM file atomically with the given permissions.
#[cfg(test)]
pub fn write_pem_file(path: &Path, tag: &'static str, der: &[u8], mode: u32) -> Result<()> {
    write_pem_files(&[PemFile {
        path: path.to_path_buf(),
        tag,
        der,
        mode,
    }])
}

/// Write several PEM files, renaming them into place only after all of them were staged.
///
/// If staging fails, the previous files stay untouched and staged leftovers are removed.
pub fn write_pem_files(files: &[PemFile<'_>]) -> Result<()> {
    let mut staged = Vec::with_capacity(files.len());

    for file in files {
        let tmp = staging_path(&file.path);
        if let Err(e) = stage(&tmp, &encode(file.tag, file.der), file.mode) {
            let _ = fs::remove_file(&tmp);
            for (tmp, _) in &staged {
                let _ = fs::remove_file(tmp);
            }
            return Err(e);
        }
        staged.push((tmp, file.path.as_path()));
    }

    for (tmp, path) in &staged {
        fs::rename(tmp, path).map_err(|e| Error::io("rename into place", path, e))?;
    }

    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push("~");
    PathBuf::from(name)
}

fn stage(tmp: &Path, contents: &str, mode: u32) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    let mut file = options.open(tmp).map_err(|e| Error::io("create", tmp, e))?;

    // create() does not change the mode of a stale file left over from an earlier attempt
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp, fs::Permissions::from_mode(mode))
            .map_err(|e| Error::io("set permissions on", tmp, e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    file.write_all(contents.as_bytes())
        .map_err(|e| Error::io("write", tmp, e))?;
    file.sync_all().map_err(|e| Error::io("sync", tmp, e))?;

    Ok(())
}

/// Common Name of the certificate's issuer.
pub fn issuer_common_name(der: &[u8]) -> Result<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| Error::CertGen(format!("failed to parse X509 certificate: {}", e)))?;

    let cn = cert
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| Error::CertGen("certificate issuer has no common name".to_string()))?;

    Ok(cn.to_string())
}

/// Common Name of the certificate's subject.
pub fn subject_common_name(der: &[u8]) -> Result<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| Error::CertGen(format!("failed to parse X509 certificate: {}", e)))?;

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| Error::CertGen("certificate subject has no common name".to_string()))?;

    Ok(cn.to_string())
}
