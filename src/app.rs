use std::fs;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::warn;

use crate::cache::{CacheLoad, CacheStore};
use crate::checksum::{self, ChecksumMismatch};
use crate::domain::SnapshotRequest;
use crate::error::LdmError;
use crate::fetcher::{FetchReport, SnapshotFetcher};
use crate::fs_util::{extract_database, file_size};
use crate::patch::{self, PatchReport};
use crate::profile::{LoadOptions, ProfileCollection, ProfileLoader};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub primary: ProfileCollection,
    pub companion: Option<ProfileCollection>,
    pub from_cache: bool,
    pub fetch: Option<FetchReport>,
    pub manifest_path: Option<Utf8PathBuf>,
    pub primary_patch: Option<PatchReport>,
    pub companion_patch: Option<PatchReport>,
    pub cache_paths: Vec<Utf8PathBuf>,
}

impl SnapshotOutcome {
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            profiles: self.primary.len(),
            horizons: self.primary.horizon_count(),
            companion_profiles: self.companion.as_ref().map(ProfileCollection::len),
            from_cache: self.from_cache,
            manifest_path: self.manifest_path.as_ref().map(ToString::to_string),
            cache_paths: self.cache_paths.iter().map(ToString::to_string).collect(),
            fetch_warnings: self
                .fetch
                .as_ref()
                .map(|report| report.warnings.clone())
                .unwrap_or_default(),
            patch_failures: self
                .primary_patch
                .iter()
                .chain(self.companion_patch.iter())
                .map(|report| report.failures.len())
                .sum(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub profiles: usize,
    pub horizons: usize,
    pub companion_profiles: Option<usize>,
    pub from_cache: bool,
    pub manifest_path: Option<String>,
    pub cache_paths: Vec<String>,
    pub fetch_warnings: Vec<String>,
    pub patch_failures: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub manifest_path: String,
    pub snapshot_date: String,
    pub checked: usize,
    pub mismatches: Vec<ChecksumMismatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearResult {
    pub removed: Vec<String>,
}

/// Orchestrates cache lookup, acquisition, patching, loading and caching of
/// the snapshot.
pub struct App<F: SnapshotFetcher, L: ProfileLoader> {
    fetcher: F,
    loader: L,
    primary_options: LoadOptions,
    companion_options: LoadOptions,
}

impl<F: SnapshotFetcher, L: ProfileLoader> App<F, L> {
    pub fn new(fetcher: F, loader: L) -> Self {
        Self {
            fetcher,
            loader,
            primary_options: LoadOptions::ldm(),
            // Companion codes stay raw; decoding is requested per load, not globally.
            companion_options: LoadOptions::nasis().without_code_decoding(),
        }
    }

    pub fn with_load_options(mut self, primary: LoadOptions, companion: LoadOptions) -> Self {
        self.primary_options = primary;
        self.companion_options = companion;
        self
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Returns the primary collection; the companion collection is only
    /// written to the cache.
    pub fn get_snapshot(
        &self,
        request: &SnapshotRequest,
        sink: &dyn ProgressSink,
    ) -> Result<ProfileCollection, LdmError> {
        self.get_snapshot_full(request, sink)
            .map(|outcome| outcome.primary)
    }

    pub fn get_snapshot_full(
        &self,
        request: &SnapshotRequest,
        sink: &dyn ProgressSink,
    ) -> Result<SnapshotOutcome, LdmError> {
        if let Some(outcome) = self.from_cache(request, sink) {
            return Ok(outcome);
        }

        let primary_db = request.primary_database_path();
        let companion_db = request.companion_database_path();

        let mut fetch = None;
        let mut companion_current = true;
        if !request.cache || !primary_db.as_std_path().is_file() {
            self.progress(request, sink, "phase=Fetch; acquiring snapshot".to_string(), None);
            let start = Instant::now();
            let report = self
                .fetcher
                .fetch(request)
                .map_err(|err| LdmError::Acquisition(err.to_string()))?;
            self.progress(
                request,
                sink,
                format!("phase=Fetch; done, final state {:?}", report.final_state()),
                Some(start.elapsed()),
            );
            let Some(archive) = report.primary_archive.as_deref() else {
                return Err(LdmError::Acquisition(format!(
                    "no primary archive was acquired (fetch states {:?})",
                    report.states
                )));
            };
            self.unpack(request, sink, archive, &request.files.primary_database)
                .map_err(|err| LdmError::Acquisition(err.to_string()))?;
            // A database left over from an earlier run must not pass for this snapshot.
            companion_current = match report.companion_archive.as_deref() {
                Some(archive) => {
                    match self.unpack(request, sink, archive, &request.files.companion_database) {
                        Ok(_) => true,
                        Err(err) => {
                            warn!(archive = %archive, error = %err, "failed to extract companion archive");
                            false
                        }
                    }
                }
                None => false,
            };
            if !companion_current && companion_db.as_std_path().is_file() {
                warn!(path = %companion_db, "ignoring companion database from an earlier snapshot");
            }
            fetch = Some(report);
        } else {
            self.progress(
                request,
                sink,
                format!("phase=Fetch; reusing {primary_db}"),
                None,
            );
            verify_existing(request);
        }

        if !primary_db.as_std_path().is_file() {
            return Err(LdmError::Acquisition(format!(
                "primary database {primary_db} is missing after acquisition"
            )));
        }

        self.progress(request, sink, "phase=Patch; primary database".to_string(), None);
        let primary_patch = patch_warn_only(&primary_db, false);

        let mut companion_patch = None;
        let mut companion_valid = false;
        if companion_current && companion_db.as_std_path().is_file() {
            match patch::validate_database(&companion_db) {
                Ok(tables) => {
                    companion_valid = true;
                    self.progress(
                        request,
                        sink,
                        format!("phase=Patch; companion database ({tables} tables)"),
                        None,
                    );
                    companion_patch = patch_warn_only(&companion_db, true);
                }
                Err(err) => {
                    warn!(path = %companion_db, error = %err, "companion database failed validation, skipping it");
                }
            }
        }

        // Hash after patching so a later verify compares against what is loaded.
        let manifest_path = if fetch.is_some() {
            let path = self.write_manifest(request, sink);
            if !request.keep_archive {
                remove_archives(request);
            }
            path
        } else {
            None
        };

        self.progress(request, sink, "phase=Load; primary collection".to_string(), None);
        let start = Instant::now();
        let primary = self
            .loader
            .load(&primary_db, &self.primary_options)
            .map_err(|err| match err {
                LdmError::Load(_) => err,
                other => LdmError::Load(other.to_string()),
            })?;
        self.progress(
            request,
            sink,
            format!(
                "phase=Load; {} profiles, {} horizons",
                primary.len(),
                primary.horizon_count()
            ),
            Some(start.elapsed()),
        );

        let companion = if companion_valid {
            match self.loader.load(&companion_db, &self.companion_options) {
                Ok(collection) => {
                    self.progress(
                        request,
                        sink,
                        format!("phase=Load; {} companion profiles", collection.len()),
                        None,
                    );
                    Some(collection)
                }
                Err(err) => {
                    warn!(path = %companion_db, error = %err, "companion collection failed to load");
                    None
                }
            }
        } else {
            None
        };

        let mut cache_paths = Vec::new();
        if request.cache {
            self.progress(request, sink, "phase=Cache; writing collections".to_string(), None);
            cache_paths.push(CacheStore::save(
                &primary,
                &request.target_dir,
                &request.files.primary_cache,
            )?);
            if let Some(companion) = &companion {
                match CacheStore::save(companion, &request.target_dir, &request.files.companion_cache) {
                    Ok(path) => cache_paths.push(path),
                    Err(err) => warn!(error = %err, "failed to cache companion collection"),
                }
            }
        }

        Ok(SnapshotOutcome {
            primary,
            companion,
            from_cache: false,
            fetch,
            manifest_path,
            primary_patch,
            companion_patch,
            cache_paths,
        })
    }

    pub fn verify(&self, request: &SnapshotRequest) -> Result<VerifyResult, LdmError> {
        let path = request.manifest_path();
        let manifest = checksum::read_manifest(&path)?;
        let mismatches = checksum::verify_manifest(&manifest, &request.target_dir);
        Ok(VerifyResult {
            manifest_path: path.to_string(),
            snapshot_date: manifest.snapshot_date.clone(),
            checked: manifest.checksums.iter().filter(|entry| !entry.is_missing()).count(),
            mismatches,
        })
    }

    pub fn clear_cache(&self, request: &SnapshotRequest) -> Result<ClearResult, LdmError> {
        let mut removed = Vec::new();
        for name in [&request.files.primary_cache, &request.files.companion_cache] {
            if CacheStore::remove(&request.target_dir, name)? {
                removed.push(CacheStore::path(&request.target_dir, name).to_string());
            }
        }
        Ok(ClearResult { removed })
    }

    fn from_cache(&self, request: &SnapshotRequest, sink: &dyn ProgressSink) -> Option<SnapshotOutcome> {
        if !request.cache || !CacheStore::exists(&request.target_dir, &request.files.primary_cache) {
            return None;
        }
        let primary = match CacheStore::load::<ProfileCollection>(
            &request.target_dir,
            &request.files.primary_cache,
            true,
        ) {
            Ok(CacheLoad::Loaded(primary)) => primary,
            _ => {
                warn!(
                    file = %request.files.primary_cache,
                    "cached collection is unreadable, rebuilding it"
                );
                return None;
            }
        };
        let companion = CacheStore::load::<ProfileCollection>(
            &request.target_dir,
            &request.files.companion_cache,
            true,
        )
        .ok()
        .and_then(CacheLoad::into_option);

        self.progress(
            request,
            sink,
            format!("phase=Cache; loaded {} profiles from cache", primary.len()),
            None,
        );
        Some(SnapshotOutcome {
            primary,
            companion,
            from_cache: true,
            fetch: None,
            manifest_path: None,
            primary_patch: None,
            companion_patch: None,
            cache_paths: vec![CacheStore::path(&request.target_dir, &request.files.primary_cache)],
        })
    }

    fn unpack(
        &self,
        request: &SnapshotRequest,
        sink: &dyn ProgressSink,
        archive: &Utf8Path,
        database: &str,
    ) -> Result<Utf8PathBuf, LdmError> {
        let path = extract_database(archive, &request.target_dir, database)?;
        self.progress(
            request,
            sink,
            format!(
                "phase=Extract; {path} ({})",
                format_size(file_size(&path).unwrap_or(0))
            ),
            None,
        );
        Ok(path)
    }

    fn write_manifest(&self, request: &SnapshotRequest, sink: &dyn ProgressSink) -> Option<Utf8PathBuf> {
        let files = [
            request.primary_archive_path(),
            request.companion_archive_path(),
            request.primary_database_path(),
            request.companion_database_path(),
        ];
        let manifest = checksum::build_manifest(&files);
        let path = request.manifest_path();
        match checksum::write_manifest(&path, &manifest) {
            Ok(()) => {
                self.progress(request, sink, format!("phase=Verify; manifest written to {path}"), None);
                Some(path)
            }
            Err(err) => {
                warn!(error = %err, "failed to write snapshot manifest");
                None
            }
        }
    }

    fn progress(
        &self,
        request: &SnapshotRequest,
        sink: &dyn ProgressSink,
        message: String,
        elapsed: Option<Duration>,
    ) {
        if request.verbose {
            sink.event(ProgressEvent { message, elapsed });
        }
    }
}

fn patch_warn_only(path: &Utf8Path, companion: bool) -> Option<PatchReport> {
    match patch::patch_database(path, companion) {
        Ok(report) => {
            if !report.is_clean() {
                warn!(path = %path, failures = report.failures.len(), "schema patch incomplete");
            }
            Some(report)
        }
        Err(err) => {
            warn!(path = %path, error = %err, "schema patch failed");
            None
        }
    }
}

fn verify_existing(request: &SnapshotRequest) {
    let path = request.manifest_path();
    if !path.as_std_path().is_file() {
        return;
    }
    match checksum::read_manifest(&path) {
        Ok(manifest) => {
            let mismatches = checksum::verify_manifest(&manifest, &request.target_dir);
            if !mismatches.is_empty() {
                warn!(count = mismatches.len(), "files changed since the snapshot manifest was written");
            }
        }
        Err(err) => warn!(error = %err, "could not read snapshot manifest"),
    }
}

fn remove_archives(request: &SnapshotRequest) {
    for archive in [request.primary_archive_path(), request.companion_archive_path()] {
        if archive.as_std_path().is_file() {
            if let Err(err) = fs::remove_file(archive.as_std_path()) {
                warn!(archive = %archive, error = %err, "failed to remove archive");
            }
        }
    }
}

fn format_size(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / 1_048_576.0)
}
