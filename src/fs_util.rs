use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use zip::ZipArchive;

use crate::error::LdmError;

static DATABASE_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(gpkg|sqlite3?|db)$").unwrap());

/// Unpacks `zip_path` into `target_dir` and returns the extracted file paths.
pub fn extract_zip(zip_path: &Utf8Path, target_dir: &Utf8Path) -> Result<Vec<PathBuf>, LdmError> {
    let file = fs::File::open(zip_path.as_std_path())
        .map_err(|err| LdmError::Archive(format!("open zip {zip_path}: {err}")))?;
    let mut archive = ZipArchive::new(file).map_err(|err| LdmError::Archive(err.to_string()))?;

    let mut extracted = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| LdmError::Archive(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.as_std_path().join(path),
            None => {
                return Err(LdmError::Archive(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path).map_err(|err| LdmError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| LdmError::Filesystem(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| LdmError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| LdmError::Filesystem(err.to_string()))?;
        extracted.push(entry_path);
    }
    Ok(extracted)
}

/// Extracts an archive holding one SQLite/GeoPackage database and makes sure
/// it ends up at `target_dir/database_name`.
pub fn extract_database(
    archive: &Utf8Path,
    target_dir: &Utf8Path,
    database_name: &str,
) -> Result<Utf8PathBuf, LdmError> {
    let extracted = extract_zip(archive, target_dir)?;
    let destination = target_dir.join(database_name);

    let database = extracted
        .into_iter()
        .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok())
        .find(|path| DATABASE_ENTRY.is_match(path.as_str()))
        .ok_or_else(|| LdmError::Archive(format!("no database file inside {archive}")))?;

    if database != destination {
        move_file(&database, &destination)?;
    }
    Ok(destination)
}

/// Renames, falling back to copy + remove across filesystems.
pub fn move_file(from: &Utf8Path, to: &Utf8Path) -> Result<(), LdmError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| LdmError::Filesystem(err.to_string()))?;
    }
    if fs::rename(from.as_std_path(), to.as_std_path()).is_ok() {
        return Ok(());
    }
    fs::copy(from.as_std_path(), to.as_std_path())
        .map_err(|err| LdmError::Filesystem(format!("copy {from} -> {to}: {err}")))?;
    fs::remove_file(from.as_std_path())
        .map_err(|err| LdmError::Filesystem(format!("remove {from}: {err}")))?;
    Ok(())
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), LdmError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| LdmError::Filesystem(err.to_string()))?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(tmp_path.as_std_path(), content)
        .map_err(|err| LdmError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| LdmError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn file_size(path: &Utf8Path) -> Option<u64> {
    fs::metadata(path.as_std_path())
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
}
