use std::collections::HashSet;
use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{CssSelector, SnapshotRequest};
use crate::download::{RetryingDownloader, Transport};
use crate::error::LdmError;
use crate::fs_util::{file_size, move_file};

/// Suffixes browsers give a file while it is still being written.
const PARTIAL_MARKERS: &[&str] = &[".part", ".crdownload", ".download"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchState {
    Idle,
    DriverStarted,
    Navigated,
    DownloadTriggered,
    Polling,
    Complete,
    TimedOut,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub states: Vec<FetchState>,
    pub primary_archive: Option<Utf8PathBuf>,
    pub companion_archive: Option<Utf8PathBuf>,
    pub warnings: Vec<String>,
}

impl FetchReport {
    fn new() -> Self {
        Self {
            states: vec![FetchState::Idle],
            primary_archive: None,
            companion_archive: None,
            warnings: Vec::new(),
        }
    }

    fn enter(&mut self, state: FetchState) {
        debug!(?state, "fetch state");
        self.states.push(state);
    }

    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }

    pub fn final_state(&self) -> FetchState {
        self.states.last().copied().unwrap_or(FetchState::Idle)
    }
}

/// Acquires the raw snapshot archives into the request's target directory.
pub trait SnapshotFetcher {
    fn fetch(&self, request: &SnapshotRequest) -> Result<FetchReport, LdmError>;
}

pub trait BrowserSession {
    fn navigate(&mut self, url: &str) -> Result<(), LdmError>;
    fn click(&mut self, selector: &CssSelector) -> Result<(), LdmError>;
    fn close(&mut self) -> Result<(), LdmError>;
}

pub trait BrowserLauncher: Send + Sync {
    fn launch(
        &self,
        download_dir: &Utf8Path,
        request: &SnapshotRequest,
    ) -> Result<Box<dyn BrowserSession>, LdmError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadWait {
    Complete(Utf8PathBuf),
    TimedOut,
}

/// Waits for `dir/file_name` to exist with a non-zero size and no partial
/// download marker next to it. Fragments named in `preexisting` were in the
/// directory before the browser started and are not waited on.
pub fn wait_for_download(
    dir: &Utf8Path,
    file_name: &str,
    timeout: Duration,
    interval: Duration,
    preexisting: &HashSet<String>,
) -> DownloadWait {
    let target = dir.join(file_name);
    let start = Instant::now();
    loop {
        if !has_partial_download(dir, file_name, preexisting) {
            if let Some(size) = file_size(&target) {
                if size > 0 {
                    return DownloadWait::Complete(target);
                }
            }
        }
        if start.elapsed() >= timeout {
            return DownloadWait::TimedOut;
        }
        thread::sleep(interval);
    }
}

/// Names of partial-download fragments currently in `dir`.
pub fn partial_fragments(dir: &Utf8Path) -> HashSet<String> {
    let Ok(entries) = fs::read_dir(dir.as_std_path()) else {
        return HashSet::new();
    };
    entries
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| PARTIAL_MARKERS.iter().any(|marker| name.ends_with(marker)))
        .collect()
}

fn has_partial_download(dir: &Utf8Path, file_name: &str, preexisting: &HashSet<String>) -> bool {
    if PARTIAL_MARKERS
        .iter()
        .any(|marker| dir.join(format!("{file_name}{marker}")).as_std_path().exists())
    {
        return true;
    }
    // Firefox names the fragment after a random stem until the first byte arrives.
    partial_fragments(dir)
        .iter()
        .any(|name| !preexisting.contains(name))
}

/// Drives the download portal in a browser for the primary archive and pulls
/// the companion archive over a direct link.
pub struct BrowserFetcher<L: BrowserLauncher, T: Transport> {
    launcher: L,
    downloader: RetryingDownloader<T>,
}

impl<L: BrowserLauncher, T: Transport> BrowserFetcher<L, T> {
    pub fn new(launcher: L, downloader: RetryingDownloader<T>) -> Self {
        Self {
            launcher,
            downloader,
        }
    }

    fn fetch_primary(&self, request: &SnapshotRequest, report: &mut FetchReport) -> Result<(), LdmError> {
        let staging = request.staging_dir();
        fs::create_dir_all(staging.as_std_path())
            .map_err(|err| LdmError::Filesystem(format!("create {staging}: {err}")))?;
        // A leftover archive would satisfy the completion check immediately,
        // and a leftover marker would block it until the timeout.
        let mut stale = vec![
            staging.join(&request.files.primary_archive),
            request.primary_archive_path(),
        ];
        stale.extend(
            PARTIAL_MARKERS
                .iter()
                .map(|marker| staging.join(format!("{}{marker}", request.files.primary_archive))),
        );
        for path in stale {
            if path.as_std_path().is_file() {
                fs::remove_file(path.as_std_path())
                    .map_err(|err| LdmError::Filesystem(format!("remove {path}: {err}")))?;
            }
        }
        let preexisting = partial_fragments(staging);
        if !preexisting.is_empty() {
            debug!(count = preexisting.len(), "ignoring partial downloads from earlier runs");
        }

        let mut session = match self.launcher.launch(staging, request) {
            Ok(session) => session,
            Err(err) => {
                report.enter(FetchState::Closed);
                return Err(err);
            }
        };
        report.enter(FetchState::DriverStarted);

        let outcome = self.drive_portal(session.as_mut(), request, &preexisting, report);

        if let Err(err) = session.close() {
            report.warn(format!("failed to close browser session: {err}"));
        }
        report.enter(FetchState::Closed);

        let archive = outcome?;
        if let Some(archive) = archive {
            let destination = request.primary_archive_path();
            if archive != destination {
                move_file(&archive, &destination)?;
            }
            report.primary_archive = Some(destination);
        }
        Ok(())
    }

    fn drive_portal(
        &self,
        session: &mut dyn BrowserSession,
        request: &SnapshotRequest,
        preexisting: &HashSet<String>,
        report: &mut FetchReport,
    ) -> Result<Option<Utf8PathBuf>, LdmError> {
        if request.verbose {
            info!(url = %request.portal_url, "navigating to download portal");
        }
        session.navigate(&request.portal_url)?;
        report.enter(FetchState::Navigated);

        let tab = &request.selectors.category_tab;
        if let Err(err) = session.click(tab) {
            report.warn(format!("could not click {tab}: {err}"));
        }
        let trigger = &request.selectors.download_trigger;
        match session.click(trigger) {
            Ok(()) => report.enter(FetchState::DownloadTriggered),
            Err(err) => report.warn(format!("could not click {trigger}: {err}")),
        }

        report.enter(FetchState::Polling);
        if request.verbose {
            info!(
                file = %request.files.primary_archive,
                timeout_secs = request.timeout.as_secs(),
                "waiting for download"
            );
        }
        match wait_for_download(
            request.staging_dir(),
            &request.files.primary_archive,
            request.timeout,
            request.poll_interval,
            preexisting,
        ) {
            DownloadWait::Complete(path) => {
                report.enter(FetchState::Complete);
                if request.verbose {
                    info!(path = %path, size = file_size(&path).unwrap_or(0), "download finished");
                }
                Ok(Some(path))
            }
            DownloadWait::TimedOut => {
                report.enter(FetchState::TimedOut);
                report.warn(format!(
                    "timed out after {}s waiting for {}",
                    request.timeout.as_secs(),
                    request.files.primary_archive
                ));
                Ok(None)
            }
        }
    }

    fn fetch_companion(&self, request: &SnapshotRequest, report: &mut FetchReport) {
        let destination = request.companion_archive_path();
        match self.downloader.download(
            &request.companion_url,
            destination.as_std_path(),
            request.max_attempts,
            request.verbose,
        ) {
            Ok(()) => report.companion_archive = Some(destination),
            Err(err) => report.warn(format!("companion download failed: {err}")),
        }
    }
}

impl<L: BrowserLauncher, T: Transport> SnapshotFetcher for BrowserFetcher<L, T> {
    fn fetch(&self, request: &SnapshotRequest) -> Result<FetchReport, LdmError> {
        fs::create_dir_all(request.target_dir.as_std_path())
            .map_err(|err| LdmError::Filesystem(format!("create {}: {err}", request.target_dir)))?;
        let mut report = FetchReport::new();
        self.fetch_primary(request, &mut report)?;
        self.fetch_companion(request, &mut report);
        Ok(report)
    }
}
