use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::LdmError;

pub const DEFAULT_PORTAL_URL: &str =
    "https://ncsslabdatamart.sc.egov.usda.gov/database_download.aspx";
pub const DEFAULT_COMPANION_URL: &str =
    "https://ncsslabdatamart.sc.egov.usda.gov/database/NASIS_Morphological.zip";
pub const DEFAULT_DRIVER_PORT: u16 = 4567;
pub const DEFAULT_DRIVER_COMMAND: &str = "geckodriver";
pub const DEFAULT_TIMEOUT_SECS: u64 = 100_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A CSS selector used to drive the download portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CssSelector(String);

impl CssSelector {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CssSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CssSelector {
    type Err = LdmError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(LdmError::ConfigParse("empty CSS selector".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for CssSelector {
    type Error = LdmError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CssSelector> for String {
    fn from(value: CssSelector) -> Self {
        value.0
    }
}

/// Page elements clicked on the portal, in order. These break whenever the
/// portal is redesigned, so they live in configuration rather than code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalSelectors {
    pub category_tab: CssSelector,
    pub download_trigger: CssSelector,
}

impl Default for PortalSelectors {
    fn default() -> Self {
        Self {
            category_tab: CssSelector("a[href='#sqlite']".to_string()),
            download_trigger: CssSelector("#btnDownloadSqlite".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFiles {
    pub primary_archive: String,
    pub primary_database: String,
    pub primary_cache: String,
    pub companion_archive: String,
    pub companion_database: String,
    pub companion_cache: String,
    pub manifest: String,
}

impl Default for SnapshotFiles {
    fn default() -> Self {
        Self {
            primary_archive: "ncss_labdata.zip".to_string(),
            primary_database: "ncss_labdata.gpkg".to_string(),
            primary_cache: "ldm_snapshot.json.gz".to_string(),
            companion_archive: "NASIS_Morphological.zip".to_string(),
            companion_database: "NASIS_Morphological.sqlite".to_string(),
            companion_cache: "ldm_snapshot_companion.json.gz".to_string(),
            manifest: "ldm_snapshot_metadata.json".to_string(),
        }
    }
}

/// Everything one snapshot invocation needs. Built once per call.
#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub target_dir: Utf8PathBuf,
    pub download_dir: Option<Utf8PathBuf>,
    pub files: SnapshotFiles,
    pub port: u16,
    pub driver_command: String,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub portal_url: String,
    pub companion_url: String,
    pub selectors: PortalSelectors,
    pub max_attempts: u32,
    pub cache: bool,
    pub verbose: bool,
    pub keep_archive: bool,
}

impl SnapshotRequest {
    pub fn new(target_dir: Utf8PathBuf) -> Self {
        Self {
            target_dir,
            download_dir: None,
            files: SnapshotFiles::default(),
            port: DEFAULT_DRIVER_PORT,
            driver_command: DEFAULT_DRIVER_COMMAND.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(1),
            portal_url: DEFAULT_PORTAL_URL.to_string(),
            companion_url: DEFAULT_COMPANION_URL.to_string(),
            selectors: PortalSelectors::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            cache: true,
            verbose: false,
            keep_archive: false,
        }
    }

    /// Directory the browser saves into; defaults to the target directory.
    pub fn staging_dir(&self) -> &Utf8Path {
        self.download_dir.as_deref().unwrap_or(self.target_dir.as_path())
    }

    pub fn primary_archive_path(&self) -> Utf8PathBuf {
        self.target_dir.join(&self.files.primary_archive)
    }

    pub fn primary_database_path(&self) -> Utf8PathBuf {
        self.target_dir.join(&self.files.primary_database)
    }

    pub fn companion_archive_path(&self) -> Utf8PathBuf {
        self.target_dir.join(&self.files.companion_archive)
    }

    pub fn companion_database_path(&self) -> Utf8PathBuf {
        self.target_dir.join(&self.files.companion_database)
    }

    pub fn manifest_path(&self) -> Utf8PathBuf {
        self.target_dir.join(&self.files.manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_rejects_blank() {
        assert!("   ".parse::<CssSelector>().is_err());
        let selector: CssSelector = " #go ".parse().unwrap();
        assert_eq!(selector.as_str(), "#go");
    }

    #[test]
    fn staging_dir_falls_back_to_target() {
        let mut request = SnapshotRequest::new(Utf8PathBuf::from("/data/ldm"));
        assert_eq!(request.staging_dir(), Utf8Path::new("/data/ldm"));
        request.download_dir = Some(Utf8PathBuf::from("/tmp/downloads"));
        assert_eq!(request.staging_dir(), Utf8Path::new("/tmp/downloads"));
        assert!(request.primary_database_path().ends_with("ncss_labdata.gpkg"));
    }
}
