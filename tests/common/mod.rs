#![allow(dead_code)]

use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use rusqlite::Connection;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

pub fn temp_dir() -> (TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, dir)
}

/// Two lab pedons; the layer table still carries the export suffix.
pub fn create_ldm_database(path: &Utf8Path) {
    let conn = Connection::open(path.as_std_path()).unwrap();
    conn.execute_batch(
        "CREATE TABLE lab_combine_nasis_ncss (pedon_key TEXT, pedlabsampnum TEXT, site_key TEXT);
         INSERT INTO lab_combine_nasis_ncss VALUES ('1001', '40A0001', 'S1');
         INSERT INTO lab_combine_nasis_ncss VALUES ('1002', '40A0002', 'S2');
         CREATE TABLE layer_source (layer_key INTEGER, pedon_key TEXT, hzn_top REAL, hzn_bot REAL, hzn_desgn TEXT);
         INSERT INTO layer_source VALUES (1, '1001', 20, 45, 'Bt');
         INSERT INTO layer_source VALUES (2, '1001', 0, 20, 'A');
         INSERT INTO layer_source VALUES (3, '1002', 0, 15, 'Ap');
         INSERT INTO layer_source VALUES (4, '9999', 0, 10, 'A');
         CREATE VIEW lab_layer_View_1 AS SELECT * FROM layer_source;",
    )
    .unwrap();
}

/// Morphologic pedons with coded domain columns and no lookup tables.
pub fn create_nasis_database(path: &Utf8Path) {
    let conn = Connection::open(path.as_std_path()).unwrap();
    conn.execute_batch(
        "CREATE TABLE site (siteiid INTEGER, drainagecl INTEGER);
         INSERT INTO site VALUES (10, 3);
         CREATE TABLE pedon (peiid INTEGER, siteiidref INTEGER, pedonpurpose INTEGER);
         INSERT INTO pedon VALUES (500, 10, 2);
         CREATE TABLE phorizon (phiid INTEGER, peiidref INTEGER, hzdept INTEGER, hzdepb INTEGER, bounddistinct INTEGER);
         INSERT INTO phorizon VALUES (1, 500, 0, 18, 1);
         INSERT INTO phorizon VALUES (2, 500, 18, 60, NULL);",
    )
    .unwrap();
}

pub fn write_zip(archive: &Utf8Path, entry: &str, content: &[u8]) {
    let file = std::fs::File::create(archive.as_std_path()).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    zip.start_file(entry, SimpleFileOptions::default()).unwrap();
    zip.write_all(content).unwrap();
    zip.finish().unwrap();
}

/// Zips an existing database file under `entry`.
pub fn zip_database(database: &Utf8Path, archive: &Utf8Path, entry: &str) {
    let content = std::fs::read(database.as_std_path()).unwrap();
    write_zip(archive, entry, &content);
}
