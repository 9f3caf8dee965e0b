use std::fs;
use std::io;

use camino::Utf8Path;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::LdmError;
use crate::fs_util::write_bytes_atomic;

pub const NOT_FOUND: &str = "NOT_FOUND";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChecksum {
    pub file: String,
    pub sha256: String,
    pub size_bytes: Option<u64>,
}

impl FileChecksum {
    pub fn is_missing(&self) -> bool {
        self.sha256 == NOT_FOUND
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub snapshot_date: String,
    pub download_timestamp: String,
    pub tool_version: String,
    pub package_version: String,
    pub checksums: Vec<FileChecksum>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumMismatch {
    pub file: String,
    pub expected: String,
    pub actual: String,
}

pub fn sha256_file(path: &Utf8Path) -> Result<String, LdmError> {
    let mut file = fs::File::open(path.as_std_path())
        .map_err(|err| LdmError::Filesystem(format!("open {path}: {err}")))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .map_err(|err| LdmError::Filesystem(format!("read {path}: {err}")))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hashes one file; a file that cannot be found or read is recorded as
/// `NOT_FOUND` with no size.
pub fn checksum_entry(path: &Utf8Path) -> FileChecksum {
    let file = path.file_name().unwrap_or(path.as_str()).to_string();
    let size = fs::metadata(path.as_std_path())
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len());
    match (size, size.and_then(|_| sha256_file(path).ok())) {
        (Some(size), Some(sha256)) => FileChecksum {
            file,
            sha256,
            size_bytes: Some(size),
        },
        _ => FileChecksum {
            file,
            sha256: NOT_FOUND.to_string(),
            size_bytes: None,
        },
    }
}

pub fn build_manifest<P: AsRef<Utf8Path>>(files: &[P]) -> SnapshotManifest {
    let now = Utc::now();
    SnapshotManifest {
        snapshot_date: now.format("%Y-%m-%d").to_string(),
        download_timestamp: now.to_rfc3339(),
        tool_version: format!("ldm-snapshot/{}", env!("CARGO_PKG_VERSION")),
        package_version: env!("CARGO_PKG_VERSION").to_string(),
        checksums: files
            .iter()
            .map(|path| checksum_entry(path.as_ref()))
            .collect(),
    }
}

pub fn write_manifest(path: &Utf8Path, manifest: &SnapshotManifest) -> Result<(), LdmError> {
    let content = serde_json::to_vec_pretty(manifest)
        .map_err(|err| LdmError::Manifest(err.to_string()))?;
    write_bytes_atomic(path, &content)
}

pub fn read_manifest(path: &Utf8Path) -> Result<SnapshotManifest, LdmError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| LdmError::Manifest(format!("read {path}: {err}")))?;
    serde_json::from_str(&content).map_err(|err| LdmError::Manifest(format!("parse {path}: {err}")))
}

/// Re-hashes every recorded file still present in `dir` and reports the ones
/// whose content changed. Entries recorded as missing, and files removed
/// since (archives are deleted after extraction), are skipped.
pub fn verify_manifest(manifest: &SnapshotManifest, dir: &Utf8Path) -> Vec<ChecksumMismatch> {
    let mut mismatches = Vec::new();
    for entry in manifest.checksums.iter().filter(|entry| !entry.is_missing()) {
        let current = checksum_entry(&dir.join(&entry.file));
        if current.is_missing() {
            debug!(file = %entry.file, "recorded file no longer present");
            continue;
        }
        if current.sha256 != entry.sha256 {
            warn!(
                file = %entry.file,
                expected = %entry.sha256,
                actual = %current.sha256,
                "checksum mismatch"
            );
            mismatches.push(ChecksumMismatch {
                file: entry.file.clone(),
                expected: entry.sha256.clone(),
                actual: current.sha256,
            });
        }
    }
    mismatches
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn known_digest() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("abc.txt")).unwrap();
        fs::write(path.as_std_path(), b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn directory_is_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let entry = checksum_entry(&dir);
        assert!(entry.is_missing());
        assert_eq!(entry.size_bytes, None);
    }
}
