mod common;

use assert_matches::assert_matches;
use serde::{Deserialize, Serialize};

use ldm_snapshot::cache::{CacheLoad, CacheStore};
use ldm_snapshot::error::LdmError;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Sample {
    name: String,
    depths: Vec<f64>,
}

#[test]
fn saved_object_loads_back_equal() {
    let (_temp, dir) = common::temp_dir();
    let sample = Sample {
        name: "pedon".to_string(),
        depths: vec![0.0, 12.5, 40.0],
    };

    let path = CacheStore::save(&sample, &dir, "sample.json.gz").unwrap();
    assert!(path.as_std_path().metadata().unwrap().len() > 0);
    assert!(CacheStore::exists(&dir, "sample.json.gz"));

    let loaded = CacheStore::load::<Sample>(&dir, "sample.json.gz", false).unwrap();
    assert_eq!(loaded.into_option(), Some(sample));
}

#[test]
fn silent_miss_reports_failure_without_error() {
    let (_temp, dir) = common::temp_dir();
    let loaded = CacheStore::load::<Sample>(&dir, "absent.json.gz", true).unwrap();
    assert_matches!(loaded, CacheLoad::Failed);
}

#[test]
fn loud_miss_is_an_error() {
    let (_temp, dir) = common::temp_dir();
    let result = CacheStore::load::<Sample>(&dir, "absent.json.gz", false);
    assert_matches!(result, Err(LdmError::Cache(_)));
}

#[test]
fn corrupt_file_fails_to_load() {
    let (_temp, dir) = common::temp_dir();
    std::fs::write(dir.join("broken.json.gz").as_std_path(), b"not gzip").unwrap();

    let loaded = CacheStore::load::<Sample>(&dir, "broken.json.gz", true).unwrap();
    assert_matches!(loaded, CacheLoad::Failed);
}

#[test]
fn remove_reports_whether_anything_was_deleted() {
    let (_temp, dir) = common::temp_dir();
    CacheStore::save(&vec![1, 2, 3], &dir, "numbers.json.gz").unwrap();

    assert!(CacheStore::remove(&dir, "numbers.json.gz").unwrap());
    assert!(!CacheStore::remove(&dir, "numbers.json.gz").unwrap());
    assert!(!CacheStore::exists(&dir, "numbers.json.gz"));
}
