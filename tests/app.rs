mod common;

use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8Path;

use ldm_snapshot::app::{App, ProgressEvent, ProgressSink};
use ldm_snapshot::cache::CacheStore;
use ldm_snapshot::checksum::{NOT_FOUND, read_manifest};
use ldm_snapshot::domain::SnapshotRequest;
use ldm_snapshot::error::LdmError;
use ldm_snapshot::fetcher::{FetchReport, FetchState, SnapshotFetcher};
use ldm_snapshot::profile::SqliteProfileLoader;

/// Drops prepared archives into the target directory the way the browser
/// and companion download would.
#[derive(Default)]
struct DepositFetcher {
    primary: Option<Vec<u8>>,
    companion: Option<Vec<u8>>,
    calls: Mutex<usize>,
}

impl DepositFetcher {
    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl SnapshotFetcher for DepositFetcher {
    fn fetch(&self, request: &SnapshotRequest) -> Result<FetchReport, LdmError> {
        let mut guard = self.calls.lock().unwrap();
        *guard += 1;
        std::fs::create_dir_all(request.target_dir.as_std_path()).unwrap();

        let mut report = FetchReport {
            states: vec![FetchState::Idle, FetchState::Closed],
            primary_archive: None,
            companion_archive: None,
            warnings: Vec::new(),
        };
        if let Some(bytes) = &self.primary {
            let archive = request.primary_archive_path();
            common::write_zip(&archive, "ncss_labdata.gpkg", bytes);
            report.primary_archive = Some(archive);
        }
        if let Some(bytes) = &self.companion {
            let archive = request.companion_archive_path();
            common::write_zip(&archive, "NASIS_Morphological.sqlite", bytes);
            report.companion_archive = Some(archive);
        }
        Ok(report)
    }
}

struct FailingFetcher;

impl SnapshotFetcher for FailingFetcher {
    fn fetch(&self, _request: &SnapshotRequest) -> Result<FetchReport, LdmError> {
        Err(LdmError::DriverStartup {
            port: 4567,
            message: "port is not available".to_string(),
        })
    }
}

/// Browser wait ran out before the portal delivered anything.
struct TimedOutFetcher;

impl SnapshotFetcher for TimedOutFetcher {
    fn fetch(&self, _request: &SnapshotRequest) -> Result<FetchReport, LdmError> {
        Ok(FetchReport {
            states: vec![
                FetchState::Idle,
                FetchState::DriverStarted,
                FetchState::Navigated,
                FetchState::DownloadTriggered,
                FetchState::Polling,
                FetchState::TimedOut,
                FetchState::Closed,
            ],
            primary_archive: None,
            companion_archive: None,
            warnings: vec!["timed out after 0s waiting for ncss_labdata.zip".to_string()],
        })
    }
}

/// Reports an archive that is not a zip file.
struct CorruptArchiveFetcher;

impl SnapshotFetcher for CorruptArchiveFetcher {
    fn fetch(&self, request: &SnapshotRequest) -> Result<FetchReport, LdmError> {
        let archive = request.primary_archive_path();
        std::fs::write(archive.as_std_path(), b"PK truncated").unwrap();
        Ok(FetchReport {
            states: vec![FetchState::Idle, FetchState::Complete, FetchState::Closed],
            primary_archive: Some(archive),
            companion_archive: None,
            warnings: Vec::new(),
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

struct QuietSink;

impl ProgressSink for QuietSink {
    fn event(&self, _event: ProgressEvent) {}
}

fn database_bytes(build: fn(&Utf8Path)) -> Vec<u8> {
    let (_temp, dir) = common::temp_dir();
    let path = dir.join("fixture.sqlite");
    build(&path);
    std::fs::read(path.as_std_path()).unwrap()
}

fn primary_only() -> DepositFetcher {
    DepositFetcher {
        primary: Some(database_bytes(common::create_ldm_database)),
        ..DepositFetcher::default()
    }
}

fn both() -> DepositFetcher {
    DepositFetcher {
        primary: Some(database_bytes(common::create_ldm_database)),
        companion: Some(database_bytes(common::create_nasis_database)),
        ..DepositFetcher::default()
    }
}

#[test]
fn uncached_run_without_companion_returns_primary_only() {
    let (_temp, dir) = common::temp_dir();
    let mut request = SnapshotRequest::new(dir.clone());
    request.cache = false;
    let app = App::new(primary_only(), SqliteProfileLoader);

    let outcome = app.get_snapshot_full(&request, &QuietSink).unwrap();

    assert!(!outcome.primary.is_empty());
    assert_eq!(outcome.primary.horizon_count(), 3);
    assert!(outcome.companion.is_none());
    assert!(!outcome.from_cache);
    assert_eq!(app.fetcher().calls(), 1);
    assert!(!CacheStore::exists(&dir, &request.files.primary_cache));
    assert!(!CacheStore::exists(&dir, &request.files.companion_cache));
    assert!(!request.primary_archive_path().as_std_path().exists());
}

#[test]
fn manifest_lists_archives_and_databases() {
    let (_temp, dir) = common::temp_dir();
    let request = SnapshotRequest::new(dir.clone());
    let app = App::new(primary_only(), SqliteProfileLoader);

    let outcome = app.get_snapshot_full(&request, &QuietSink).unwrap();

    assert_eq!(outcome.manifest_path, Some(request.manifest_path()));
    let manifest = read_manifest(&request.manifest_path()).unwrap();
    let files = manifest
        .checksums
        .iter()
        .map(|entry| entry.file.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        files,
        vec![
            "ncss_labdata.zip",
            "NASIS_Morphological.zip",
            "ncss_labdata.gpkg",
            "NASIS_Morphological.sqlite"
        ]
    );
    assert_ne!(manifest.checksums[0].sha256, NOT_FOUND);
    assert_eq!(manifest.checksums[1].sha256, NOT_FOUND);
    assert_eq!(manifest.checksums[3].size_bytes, None);

    let verified = app.verify(&request).unwrap();
    assert!(verified.mismatches.is_empty());
    assert_eq!(verified.checked, 2);
}

#[test]
fn cached_collection_short_circuits_the_fetcher() {
    let (_temp, dir) = common::temp_dir();
    let request = SnapshotRequest::new(dir.clone());
    let first = App::new(both(), SqliteProfileLoader)
        .get_snapshot_full(&request, &QuietSink)
        .unwrap();
    assert_eq!(first.cache_paths.len(), 2);

    let app = App::new(DepositFetcher::default(), SqliteProfileLoader);
    let second = app.get_snapshot_full(&request, &QuietSink).unwrap();

    assert_eq!(app.fetcher().calls(), 0);
    assert!(second.from_cache);
    assert_eq!(second.primary, first.primary);
    assert_eq!(second.companion, first.companion);
}

#[test]
fn companion_loads_without_code_decoding() {
    let (_temp, dir) = common::temp_dir();
    let request = SnapshotRequest::new(dir.clone());
    let app = App::new(both(), SqliteProfileLoader);

    let outcome = app.get_snapshot_full(&request, &QuietSink).unwrap();

    let companion = outcome.companion.unwrap();
    let pedon = companion.get("500").unwrap();
    assert_eq!(pedon.site["pedonpurpose"], serde_json::json!(2));
    assert_eq!(pedon.horizons.len(), 2);
    assert_eq!(outcome.companion_patch.unwrap().lookups_added.len(), 3);
    assert!(CacheStore::exists(&dir, &request.files.companion_cache));
}

#[test]
fn invalid_companion_is_skipped() {
    let (_temp, dir) = common::temp_dir();
    let request = SnapshotRequest::new(dir.clone());
    let fetcher = DepositFetcher {
        primary: Some(database_bytes(common::create_ldm_database)),
        companion: Some(Vec::new()),
        ..DepositFetcher::default()
    };
    let app = App::new(fetcher, SqliteProfileLoader);

    let outcome = app.get_snapshot_full(&request, &QuietSink).unwrap();

    assert!(outcome.companion.is_none());
    assert!(outcome.companion_patch.is_none());
    assert_eq!(outcome.primary.len(), 2);
}

#[test]
fn existing_database_is_reused_without_fetching() {
    let (_temp, dir) = common::temp_dir();
    let request = SnapshotRequest::new(dir.clone());
    common::create_ldm_database(&request.primary_database_path());
    let app = App::new(DepositFetcher::default(), SqliteProfileLoader);

    let collection = app.get_snapshot(&request, &QuietSink).unwrap();

    assert_eq!(app.fetcher().calls(), 0);
    assert_eq!(collection.len(), 2);
    assert!(CacheStore::exists(&dir, &request.files.primary_cache));
}

#[test]
fn corrupt_cache_is_rebuilt() {
    let (_temp, dir) = common::temp_dir();
    let request = SnapshotRequest::new(dir.clone());
    std::fs::write(
        CacheStore::path(&dir, &request.files.primary_cache).as_std_path(),
        b"garbage",
    )
    .unwrap();
    let app = App::new(primary_only(), SqliteProfileLoader);

    let outcome = app.get_snapshot_full(&request, &QuietSink).unwrap();

    assert!(!outcome.from_cache);
    assert_eq!(app.fetcher().calls(), 1);
    assert_eq!(outcome.primary.len(), 2);
}

#[test]
fn fetch_failure_is_an_acquisition_error() {
    let (_temp, dir) = common::temp_dir();
    let app = App::new(FailingFetcher, SqliteProfileLoader);

    let result = app.get_snapshot(&SnapshotRequest::new(dir), &QuietSink);

    assert_matches!(result, Err(LdmError::Acquisition(message)) if message.contains("4567"));
}

#[test]
fn missing_primary_after_fetch_is_an_acquisition_error() {
    let (_temp, dir) = common::temp_dir();
    let app = App::new(DepositFetcher::default(), SqliteProfileLoader);

    let result = app.get_snapshot(&SnapshotRequest::new(dir), &QuietSink);

    assert_matches!(result, Err(LdmError::Acquisition(_)));
    assert_eq!(app.fetcher().calls(), 1);
}

#[test]
fn keep_archive_leaves_downloads_in_place() {
    let (_temp, dir) = common::temp_dir();
    let mut request = SnapshotRequest::new(dir.clone());
    request.keep_archive = true;
    let app = App::new(primary_only(), SqliteProfileLoader);

    app.get_snapshot(&request, &QuietSink).unwrap();

    assert!(request.primary_archive_path().as_std_path().is_file());
}

#[test]
fn verbose_requests_report_phases() {
    let (_temp, dir) = common::temp_dir();
    let mut request = SnapshotRequest::new(dir.clone());
    request.verbose = true;
    let sink = RecordingSink::default();
    let app = App::new(primary_only(), SqliteProfileLoader);

    app.get_snapshot(&request, &sink).unwrap();

    let messages = sink.messages.lock().unwrap();
    for phase in ["phase=Fetch", "phase=Extract", "phase=Patch", "phase=Load", "phase=Cache"] {
        assert!(
            messages.iter().any(|message| message.starts_with(phase)),
            "missing {phase}"
        );
    }
    assert!(messages.iter().any(|message| message.contains("MB")));
}

#[test]
fn quiet_requests_emit_no_progress() {
    let (_temp, dir) = common::temp_dir();
    let sink = RecordingSink::default();
    let app = App::new(primary_only(), SqliteProfileLoader);

    app.get_snapshot(&SnapshotRequest::new(dir), &sink).unwrap();

    assert!(sink.messages.lock().unwrap().is_empty());
}

#[test]
fn clear_removes_both_cache_files() {
    let (_temp, dir) = common::temp_dir();
    let request = SnapshotRequest::new(dir.clone());
    let app = App::new(both(), SqliteProfileLoader);
    app.get_snapshot(&request, &QuietSink).unwrap();

    let cleared = app.clear_cache(&request).unwrap();
    assert_eq!(cleared.removed.len(), 2);
    assert!(!CacheStore::exists(&dir, &request.files.primary_cache));

    let again = app.clear_cache(&request).unwrap();
    assert!(again.removed.is_empty());
}

#[test]
fn timed_out_refetch_does_not_reuse_the_old_database() {
    let (_temp, dir) = common::temp_dir();
    let mut request = SnapshotRequest::new(dir.clone());
    request.cache = false;
    common::create_ldm_database(&request.primary_database_path());
    let app = App::new(TimedOutFetcher, SqliteProfileLoader);

    let result = app.get_snapshot_full(&request, &QuietSink);

    assert_matches!(result, Err(LdmError::Acquisition(message)) if message.contains("TimedOut"));
    assert!(!request.manifest_path().as_std_path().exists());
}

#[test]
fn old_companion_is_ignored_when_its_download_fails() {
    let (_temp, dir) = common::temp_dir();
    let mut request = SnapshotRequest::new(dir.clone());
    request.cache = false;
    common::create_nasis_database(&request.companion_database_path());
    let app = App::new(primary_only(), SqliteProfileLoader);

    let outcome = app.get_snapshot_full(&request, &QuietSink).unwrap();

    assert_eq!(outcome.primary.len(), 2);
    assert!(outcome.companion.is_none());
    assert!(outcome.companion_patch.is_none());
}

#[test]
fn corrupt_primary_archive_is_an_acquisition_error() {
    let (_temp, dir) = common::temp_dir();
    let mut request = SnapshotRequest::new(dir.clone());
    request.cache = false;
    common::create_ldm_database(&request.primary_database_path());
    let app = App::new(CorruptArchiveFetcher, SqliteProfileLoader);

    let result = app.get_snapshot(&request, &QuietSink);

    assert_matches!(result, Err(LdmError::Acquisition(_)));
}
