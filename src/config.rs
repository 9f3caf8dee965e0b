use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::cache::default_data_dir;
use crate::domain::{PortalSelectors, SnapshotFiles, SnapshotRequest};
use crate::error::LdmError;

pub const DEFAULT_CONFIG_FILE: &str = "ldm-snapshot.json";

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub target_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub download_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub files: Option<FilesConfig>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub driver_command: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub portal_url: Option<String>,
    #[serde(default)]
    pub companion_url: Option<String>,
    #[serde(default)]
    pub selectors: Option<PortalSelectors>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub cache: Option<bool>,
    #[serde(default)]
    pub verbose: Option<bool>,
    #[serde(default)]
    pub keep_archive: Option<bool>,
}

/// Per-file overrides; anything left out keeps its default name.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FilesConfig {
    #[serde(default)]
    pub primary_archive: Option<String>,
    #[serde(default)]
    pub primary_database: Option<String>,
    #[serde(default)]
    pub primary_cache: Option<String>,
    #[serde(default)]
    pub companion_archive: Option<String>,
    #[serde(default)]
    pub companion_database: Option<String>,
    #[serde(default)]
    pub companion_cache: Option<String>,
    #[serde(default)]
    pub manifest: Option<String>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `ldm-snapshot.json` in the working directory when no
    /// path is given. Only an explicit path is required to exist.
    pub fn resolve(path: Option<&str>) -> Result<SnapshotRequest, LdmError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| LdmError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| LdmError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<SnapshotRequest, LdmError> {
        let target_dir = match config.target_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };

        let mut request = SnapshotRequest::new(target_dir);
        request.download_dir = config.download_dir;
        if let Some(files) = config.files {
            request.files = merge_files(files);
        }
        if let Some(port) = config.port {
            request.port = port;
        }
        if let Some(command) = config.driver_command {
            request.driver_command = command;
        }
        if let Some(secs) = config.timeout_secs {
            request.timeout = Duration::from_secs(secs);
        }
        if let Some(url) = config.portal_url {
            request.portal_url = url;
        }
        if let Some(url) = config.companion_url {
            request.companion_url = url;
        }
        if let Some(selectors) = config.selectors {
            request.selectors = selectors;
        }
        if let Some(max_attempts) = config.max_attempts {
            if max_attempts == 0 {
                return Err(LdmError::ConfigParse(
                    "max_attempts must be at least 1".to_string(),
                ));
            }
            request.max_attempts = max_attempts;
        }
        request.cache = config.cache.unwrap_or(request.cache);
        request.verbose = config.verbose.unwrap_or(request.verbose);
        request.keep_archive = config.keep_archive.unwrap_or(request.keep_archive);

        Ok(request)
    }
}

fn merge_files(overrides: FilesConfig) -> SnapshotFiles {
    let defaults = SnapshotFiles::default();
    SnapshotFiles {
        primary_archive: overrides.primary_archive.unwrap_or(defaults.primary_archive),
        primary_database: overrides
            .primary_database
            .unwrap_or(defaults.primary_database),
        primary_cache: overrides.primary_cache.unwrap_or(defaults.primary_cache),
        companion_archive: overrides
            .companion_archive
            .unwrap_or(defaults.companion_archive),
        companion_database: overrides
            .companion_database
            .unwrap_or(defaults.companion_database),
        companion_cache: overrides.companion_cache.unwrap_or(defaults.companion_cache),
        manifest: overrides.manifest.unwrap_or(defaults.manifest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_overrides_keep_defaults() {
        let config = Config {
            target_dir: Some(Utf8PathBuf::from("/srv/ldm")),
            files: Some(FilesConfig {
                primary_database: Some("labdata.sqlite".to_string()),
                ..FilesConfig::default()
            }),
            ..Config::default()
        };

        let request = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(request.files.primary_database, "labdata.sqlite");
        assert_eq!(request.files.primary_archive, "ncss_labdata.zip");
        assert!(request.cache);
        assert!(!request.keep_archive);
    }
}
