use std::fs;
use std::io::{BufReader, BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::LdmError;

/// Outcome of a cache read. `Failed` is only produced for silent loads.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLoad<T> {
    Loaded(T),
    Failed,
}

impl<T> CacheLoad<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            CacheLoad::Loaded(value) => Some(value),
            CacheLoad::Failed => None,
        }
    }
}

/// Platform data directory used when no target directory is configured.
pub fn default_data_dir() -> Result<Utf8PathBuf, LdmError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().join("ldm-snapshot")).ok())
        .ok_or_else(|| LdmError::Filesystem("unable to resolve data directory".to_string()))
}

/// Serialized objects on disk, stored as gzip-compressed JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStore;

impl CacheStore {
    pub fn path(directory: &Utf8Path, filename: &str) -> Utf8PathBuf {
        directory.join(filename)
    }

    pub fn exists(directory: &Utf8Path, filename: &str) -> bool {
        Self::path(directory, filename).as_std_path().is_file()
    }

    pub fn save<T: Serialize>(
        object: &T,
        directory: &Utf8Path,
        filename: &str,
    ) -> Result<Utf8PathBuf, LdmError> {
        fs::create_dir_all(directory.as_std_path())
            .map_err(|err| LdmError::Cache(format!("create {directory}: {err}")))?;
        let path = Self::path(directory, filename);

        let temp = tempfile::Builder::new()
            .prefix("ldm-snapshot-cache")
            .tempfile_in(directory.as_std_path())
            .map_err(|err| LdmError::Cache(err.to_string()))?;
        {
            let mut encoder =
                GzEncoder::new(BufWriter::new(temp.as_file()), Compression::default());
            serde_json::to_writer(&mut encoder, object)
                .map_err(|err| LdmError::Cache(format!("serialize {path}: {err}")))?;
            let mut writer = encoder
                .finish()
                .map_err(|err| LdmError::Cache(format!("write {path}: {err}")))?;
            writer
                .flush()
                .map_err(|err| LdmError::Cache(format!("write {path}: {err}")))?;
        }
        temp.persist(path.as_std_path())
            .map_err(|err| LdmError::Cache(format!("persist {path}: {err}")))?;

        let size = fs::metadata(path.as_std_path())
            .map(|meta| meta.len())
            .unwrap_or(0);
        if size == 0 {
            warn!(path = %path, "cache file was written but is empty");
        }
        debug!(path = %path, size, "cache saved");
        Ok(path)
    }

    pub fn load<T: DeserializeOwned>(
        directory: &Utf8Path,
        filename: &str,
        silent: bool,
    ) -> Result<CacheLoad<T>, LdmError> {
        match Self::read(&Self::path(directory, filename)) {
            Ok(value) => Ok(CacheLoad::Loaded(value)),
            Err(err) if silent => {
                debug!(error = %err, "cache load failed");
                Ok(CacheLoad::Failed)
            }
            Err(err) => Err(err),
        }
    }

    pub fn remove(directory: &Utf8Path, filename: &str) -> Result<bool, LdmError> {
        let path = Self::path(directory, filename);
        if !path.as_std_path().exists() {
            return Ok(false);
        }
        fs::remove_file(path.as_std_path())
            .map_err(|err| LdmError::Cache(format!("remove {path}: {err}")))?;
        Ok(true)
    }

    fn read<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, LdmError> {
        let file = fs::File::open(path.as_std_path())
            .map_err(|err| LdmError::Cache(format!("open {path}: {err}")))?;
        let decoder = GzDecoder::new(BufReader::new(file));
        serde_json::from_reader(decoder)
            .map_err(|err| LdmError::Cache(format!("deserialize {path}: {err}")))
    }
}
