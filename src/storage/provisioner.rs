use flate2::read::GzDecoder;
use ring::digest;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{Error, Result};

const ARCHIVE_SUFFIX: &str = ".tgz";
const MANIFEST_SUFFIX: &str = ".tgz.sha256sum";

/// Something that can hand out a runnable engine binary.
pub trait ExecutableSource: Send + Sync {
    fn resolve_executable(&self) -> Result<PathBuf>;
}

/// One published release archive and its expected digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDescriptor {
    /// Archive file name, e.g. `cockroach-v24.1.0.linux-amd64.tgz`
    pub filename: String,
    /// Lowercase hex SHA-256 of the archive
    pub digest: String,
    /// URL the archive is fetched from
    pub url: String,
}

impl VersionDescriptor {
    /// Parse a `<hex digest> <filename>` manifest; the archive sits next to it under `base_url`.
    pub fn parse_manifest(base_url: &str, body: &str) -> Result<Self> {
        let mut fields = body.split_whitespace();
        let (digest, filename) = match (fields.next(), fields.next()) {
            (Some(digest), Some(filename)) => (digest, filename.trim_start_matches('*')),
            _ => return Err(Error::Fetch(format!("malformed release manifest: {:?}", body))),
        };

        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Fetch(format!("malformed digest in release manifest: {}", digest)));
        }
        if !filename.ends_with(ARCHIVE_SUFFIX) || filename.contains('/') || filename.len() == ARCHIVE_SUFFIX.len() {
            return Err(Error::Fetch(format!("unexpected archive name in release manifest: {}", filename)));
        }

        Ok(Self {
            filename: filename.to_string(),
            digest: digest.to_ascii_lowercase(),
            url: format!("{}/{}", base_url.trim_end_matches('/'), filename),
        })
    }

    /// Directory the archive unpacks to: the file name without `.tgz`.
    pub fn dirname(&self) -> &str {
        self.filename
            .strip_suffix(ARCHIVE_SUFFIX)
            .unwrap_or(&self.filename)
    }

    /// Fetch the archive and unpack it to `<dir>/<dirname>`, verifying the digest first.
    pub fn extract_to(&self, dir: &Path) -> Result<PathBuf> {
        info!("Downloading {}", self.url);
        let response = fetch(&self.url)?;
        extract_archive(response, self, dir)
    }

    /// Fetch the archive into `path`, verifying the digest before it appears there.
    pub fn download_to(&self, path: &Path) -> Result<()> {
        info!("Downloading {} to {}", self.url, path.display());
        let response = fetch(&self.url)?;
        save_archive(response, self, path)
    }
}

/// Reader that feeds everything it passes through into a SHA-256.
struct HashingReader<R> {
    inner: R,
    context: digest::Context,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            context: digest::Context::new(&digest::SHA256),
        }
    }

    /// Read whatever is left so the digest covers the whole stream.
    fn drain(&mut self) -> io::Result<()> {
        io::copy(self, &mut io::sink()).map(|_| ())
    }

    fn finish(self) -> String {
        hex::encode(self.context.finish().as_ref())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.context.update(&buf[..n]);
        Ok(n)
    }
}

fn fetch(url: &str) -> Result<reqwest::blocking::Response> {
    // built here so it is created and dropped on the blocking pool
    let client = reqwest::blocking::Client::builder().build()?;
    Ok(client.get(url).send()?.error_for_status()?)
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push("~");
    PathBuf::from(name)
}

fn checksum_error(release: &VersionDescriptor, actual: String) -> Error {
    Error::Checksum {
        name: release.filename.clone(),
        expected: release.digest.clone(),
        actual,
    }
}

fn remove_dir_if_present(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io("remove", path, e)),
    }
}

fn unpack<R: Read>(reader: R, staging: &Path) -> io::Result<()> {
    let mut archive = Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    archive.unpack(staging)?;
    // trailing gzip data still has to pass through the hash
    io::copy(&mut archive.into_inner(), &mut io::sink())?;
    Ok(())
}

/// Unpack a gzipped tarball into a hidden staging directory under `dir` and move
/// `<dirname>` into place once the stream's digest matches.
pub fn extract_archive<R: Read>(reader: R, release: &VersionDescriptor, dir: &Path) -> Result<PathBuf> {
    let dirname = release.dirname();
    let target = dir.join(dirname);
    let staging = dir.join(format!(".{}.partial", dirname));

    fs::create_dir_all(dir).map_err(|e| Error::io("create", dir, e))?;
    remove_dir_if_present(&staging)?;
    fs::create_dir(&staging).map_err(|e| Error::io("create", &staging, e))?;

    let mut hashing = HashingReader::new(reader);
    let unpacked = unpack(&mut hashing, &staging).and_then(|_| hashing.drain());
    // a corrupt stream usually breaks decoding too; keep reading so the mismatch is reported
    let unpacked = unpacked.map_err(|e| {
        let _ = hashing.drain();
        e
    });
    let actual = hashing.finish();

    let result = if actual != release.digest {
        Err(checksum_error(release, actual))
    } else if let Err(e) = unpacked {
        Err(Error::io("unpack", &staging, e))
    } else {
        move_into_place(&staging.join(dirname), &target)
    };

    let _ = fs::remove_dir_all(&staging);
    result.map(|_| {
        debug!("Extracted {} to {}", release.filename, target.display());
        target
    })
}

fn move_into_place(unpacked: &Path, target: &Path) -> Result<()> {
    if !unpacked.is_dir() {
        return Err(Error::Fetch(format!(
            "archive does not contain {}",
            unpacked.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
        )));
    }
    remove_dir_if_present(target)?;
    fs::rename(unpacked, target).map_err(|e| Error::io("rename into place", target, e))
}

/// Copy the archive to `path~`, then rename it to `path` if the digest matches.
pub fn save_archive<R: Read>(reader: R, release: &VersionDescriptor, path: &Path) -> Result<()> {
    let tmp = staging_path(path);
    let written = write_verified(reader, &tmp);

    let result = match written {
        Ok(actual) if actual == release.digest => {
            fs::rename(&tmp, path).map_err(|e| Error::io("rename into place", path, e))
        }
        Ok(actual) => Err(checksum_error(release, actual)),
        Err(e) => Err(e),
    };

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_verified<R: Read>(reader: R, tmp: &Path) -> Result<String> {
    let mut hashing = HashingReader::new(reader);
    let mut file = File::create(tmp).map_err(|e| Error::io("create", tmp, e))?;
    io::copy(&mut hashing, &mut file).map_err(|e| Error::io("write", tmp, e))?;
    file.flush().map_err(|e| Error::io("write", tmp, e))?;
    file.sync_all().map_err(|e| Error::io("sync", tmp, e))?;
    Ok(hashing.finish())
}

/// Release naming for the running platform.
pub fn release_platform(os: &str, arch: &str) -> Result<(&'static str, &'static str)> {
    let os = match os {
        "linux" => "linux",
        "macos" => "darwin",
        other => return Err(Error::NotFound(format!("release for operating system {}", other))),
    };
    let arch = match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => return Err(Error::NotFound(format!("release for architecture {}", other))),
    };
    Ok((os, arch))
}

/// Finds or fetches the engine binary.
///
/// All methods block on the network and filesystem; call them from `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct Provisioner {
    cache_dir: PathBuf,
    system_binary: PathBuf,
    binary_name: String,
    base_url: String,
    version: String,
}

impl Provisioner {
    pub fn new(engine: &EngineConfig, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            system_binary: engine.system_binary.clone(),
            binary_name: engine.binary_name.clone(),
            base_url: engine.release_base_url.clone(),
            version: engine.release_version.clone(),
        }
    }

    /// Use `version` instead of the configured release.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn resolve_latest(&self) -> Result<VersionDescriptor> {
        self.resolve_version("latest")
    }

    /// Fetch and parse the manifest for `version` on this platform.
    pub fn resolve_version(&self, version: &str) -> Result<VersionDescriptor> {
        let (os, arch) = release_platform(std::env::consts::OS, std::env::consts::ARCH)?;
        let url = manifest_url(&self.base_url, version, os, arch);
        debug!("Resolving release manifest {}", url);

        let body = fetch(&url)?.text()?;
        VersionDescriptor::parse_manifest(&self.base_url, &body)
    }

    /// Descriptor for the configured release
    pub fn resolve_configured(&self) -> Result<VersionDescriptor> {
        if self.version == "latest" {
            self.resolve_latest()
        } else {
            self.resolve_version(&self.version)
        }
    }
}

impl ExecutableSource for Provisioner {
    fn resolve_executable(&self) -> Result<PathBuf> {
        if self.system_binary.is_file() {
            debug!("Using pre-installed {}", self.system_binary.display());
            return Ok(self.system_binary.clone());
        }

        let release = self.resolve_configured()?;
        let release_dir = self.cache_dir.join(release.dirname());
        if !release_dir.is_dir() {
            release.extract_to(&self.cache_dir)?;
            info!("Installed {} into {}", release.dirname(), self.cache_dir.display());
        }

        let executable = release_dir.join(&self.binary_name);
        if !executable.is_file() {
            return Err(Error::NotFound(executable.display().to_string()));
        }
        Ok(executable)
    }
}

pub fn manifest_url(base_url: &str, version: &str, os: &str, arch: &str) -> String {
    format!(
        "{}/cockroach-{}.{}-{}{}",
        base_url.trim_end_matches('/'),
        version,
        os,
        arch,
        MANIFEST_SUFFIX
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    const DIRNAME: &str = "cockroach-v24.1.0.linux-amd64";

    fn archive() -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let data = b"#!/bin/sh\necho engine\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{}/cockroach", DIRNAME), &data[..])
            .unwrap();

        builder.into_inner().unwrap().finish().unwrap()
    }

    fn descriptor_for(data: &[u8]) -> VersionDescriptor {
        let digest = hex::encode(digest::digest(&digest::SHA256, data).as_ref());
        VersionDescriptor::parse_manifest(
            "https://binaries.example.com/",
            &format!("{}  {}.tgz\n", digest, DIRNAME),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_manifest() {
        let hex = "AB".repeat(32);
        let release = VersionDescriptor::parse_manifest(
            "https://binaries.example.com/",
            &format!("{} *cockroach-v24.1.0.linux-amd64.tgz\n", hex),
        )
        .unwrap();

        assert_eq!(release.filename, "cockroach-v24.1.0.linux-amd64.tgz");
        assert_eq!(release.digest, "ab".repeat(32));
        assert_eq!(release.dirname(), DIRNAME);
        assert_eq!(
            release.url,
            "https://binaries.example.com/cockroach-v24.1.0.linux-amd64.tgz"
        );
    }

    #[test]
    fn test_parse_manifest_rejects_garbage() {
        let base = "https://binaries.example.com";
        assert!(VersionDescriptor::parse_manifest(base, "").is_err());
        assert!(VersionDescriptor::parse_manifest(base, "deadbeef cockroach.tgz").is_err());
        let hex = "0".repeat(64);
        assert!(VersionDescriptor::parse_manifest(base, &format!("{} cockroach.zip", hex)).is_err());
        assert!(VersionDescriptor::parse_manifest(base, &format!("{} ../x.tgz", hex)).is_err());
    }

    #[test]
    fn test_manifest_url_and_platform() {
        assert_eq!(
            manifest_url("https://binaries.cockroachdb.com/", "latest", "linux", "amd64"),
            "https://binaries.cockroachdb.com/cockroach-latest.linux-amd64.tgz.sha256sum"
        );
        assert_eq!(release_platform("linux", "x86_64").unwrap(), ("linux", "amd64"));
        assert_eq!(release_platform("linux", "aarch64").unwrap(), ("linux", "arm64"));
        assert!(release_platform("linux", "riscv64").is_err());
    }

    #[test]
    fn test_extract_verified_archive() {
        let dir = tempfile::tempdir().unwrap();
        let data = archive();
        let release = descriptor_for(&data);

        let target = extract_archive(&data[..], &release, dir.path()).unwrap();
        assert_eq!(target, dir.path().join(DIRNAME));
        let script = fs::read_to_string(target.join("cockroach")).unwrap();
        assert!(script.contains("echo engine"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(target.join("cockroach")).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }

        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_corrupted_archive_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let data = archive();
        let release = descriptor_for(&data);

        let mut corrupted = data.clone();
        let middle = corrupted.len() / 2;
        corrupted[middle] ^= 0xff;

        let err = extract_archive(&corrupted[..], &release, dir.path()).unwrap_err();
        assert!(matches!(err, Error::Checksum { .. }));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_valid_archive_with_wrong_digest() {
        let dir = tempfile::tempdir().unwrap();
        let data = archive();
        let mut release = descriptor_for(&data);
        release.digest = "0".repeat(64);

        let err = extract_archive(&data[..], &release, dir.path()).unwrap_err();
        assert!(matches!(err, Error::Checksum { .. }));
        assert!(!dir.path().join(DIRNAME).exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_save_archive() {
        let dir = tempfile::tempdir().unwrap();
        let data = archive();
        let release = descriptor_for(&data);
        let path = dir.path().join(&release.filename);

        save_archive(&data[..], &release, &path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), data);
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn test_save_archive_mismatch_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let release = descriptor_for(b"expected");
        let path = dir.path().join(&release.filename);

        let err = save_archive(&b"something else"[..], &release, &path).unwrap_err();
        assert!(matches!(err, Error::Checksum { .. }));
        assert!(!path.exists());
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn test_system_binary_wins() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("cockroach");
        fs::write(&binary, "").unwrap();

        let engine = EngineConfig {
            system_binary: binary.clone(),
            // unreachable, the pre-installed binary must short-circuit
            release_base_url: "http://127.0.0.1:9/".to_string(),
            ..EngineConfig::default()
        };
        let provisioner = Provisioner::new(&engine, dir.path().join("cache"));
        assert_eq!(provisioner.resolve_executable().unwrap(), binary);
    }
}
