mod common;

use assert_matches::assert_matches;
use rusqlite::Connection;

use ldm_snapshot::error::LdmError;
use ldm_snapshot::patch::{EPOCH_TIMESTAMP, patch_database, validate_database};

fn object_kind(path: &camino::Utf8Path, name: &str) -> Option<String> {
    let conn = Connection::open(path.as_std_path()).unwrap();
    conn.query_row(
        "SELECT type FROM sqlite_master WHERE name = ?1",
        [name],
        |row| row.get(0),
    )
    .ok()
}

#[test]
fn suffixed_views_become_plain_tables_once() {
    let (_temp, dir) = common::temp_dir();
    let path = dir.join("ncss_labdata.gpkg");
    common::create_ldm_database(&path);

    let first = patch_database(&path, false).unwrap();
    assert_eq!(
        first.renamed,
        vec![("lab_layer_View_1".to_string(), "lab_layer".to_string())]
    );
    assert!(first.is_clean());
    assert_eq!(object_kind(&path, "lab_layer").as_deref(), Some("table"));
    assert_eq!(object_kind(&path, "lab_layer_View_1"), None);

    let second = patch_database(&path, false).unwrap();
    assert!(!second.changed());
    assert!(second.is_clean());

    let conn = Connection::open(path.as_std_path()).unwrap();
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM lab_layer", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 4);
}

#[test]
fn companion_gains_missing_columns_and_lookups() {
    let (_temp, dir) = common::temp_dir();
    let path = dir.join("NASIS_Morphological.sqlite");
    common::create_nasis_database(&path);

    let report = patch_database(&path, true).unwrap();
    assert!(report.is_clean());
    assert_eq!(
        report.columns_added,
        vec![
            "pedon.recwlupdated",
            "pedon.siteobsiidref",
            "pedon.grpiidref",
            "site.grpiidref"
        ]
    );
    assert_eq!(report.lookups_added.len(), 3);

    let conn = Connection::open(path.as_std_path()).unwrap();
    let (updated, group): (String, i64) = conn
        .query_row("SELECT recwlupdated, grpiidref FROM pedon", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap();
    assert_eq!(updated, EPOCH_TIMESTAMP);
    assert_eq!(group, 0);
    let label: String = conn
        .query_row(
            "SELECT ChoiceLabel FROM MetadataDomainDetail WHERE DomainID = 132 AND ChoiceValue = 3",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(label, "Well drained");
    drop(conn);

    let again = patch_database(&path, true).unwrap();
    assert!(!again.changed());
}

#[test]
fn companion_fixes_skip_absent_tables() {
    let (_temp, dir) = common::temp_dir();
    let path = dir.join("partial.sqlite");
    let conn = Connection::open(path.as_std_path()).unwrap();
    conn.execute_batch("CREATE TABLE pedon (peiid INTEGER);").unwrap();
    drop(conn);

    let report = patch_database(&path, true).unwrap();
    assert!(report.is_clean());
    assert!(report.columns_added.iter().all(|column| column.starts_with("pedon.")));
    assert_eq!(object_kind(&path, "site"), None);
}

#[test]
fn validation_counts_tables() {
    let (_temp, dir) = common::temp_dir();
    let path = dir.join("NASIS_Morphological.sqlite");
    common::create_nasis_database(&path);
    assert_eq!(validate_database(&path).unwrap(), 3);
}

#[test]
fn validation_rejects_empty_and_foreign_files() {
    let (_temp, dir) = common::temp_dir();
    let empty = dir.join("empty.sqlite");
    std::fs::write(empty.as_std_path(), b"").unwrap();
    assert_matches!(validate_database(&empty), Err(LdmError::Database(_)));

    let html = dir.join("error_page.sqlite");
    std::fs::write(html.as_std_path(), "<html>maintenance</html>".repeat(50)).unwrap();
    assert_matches!(validate_database(&html), Err(LdmError::Database(_)));
}
