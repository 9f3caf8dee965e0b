//! Schema fixes applied to the downloaded databases before they are loaded.
//!
//! The fixes are plain data so that upstream schema drift is handled by
//! adding a row here rather than another branch in the patching code. Every
//! fix is idempotent and independent: one failing object never stops the
//! others from being patched.

use camino::Utf8Path;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::LdmError;

/// Table/view name suffixes the export tool appends to materialized views.
pub const VIEW_SUFFIXES: &[&str] = &["_View_1"];

pub const EPOCH_TIMESTAMP: &str = "1970-01-01 00:00:00";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnDefault {
    EpochTimestamp,
    IntegerZero,
}

impl ColumnDefault {
    fn definition(self) -> String {
        match self {
            ColumnDefault::EpochTimestamp => format!("TEXT NOT NULL DEFAULT '{EPOCH_TIMESTAMP}'"),
            ColumnDefault::IntegerZero => "INTEGER NOT NULL DEFAULT 0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnFix {
    pub table: &'static str,
    pub column: &'static str,
    pub default: ColumnDefault,
}

/// Columns that older companion exports lack.
pub const COLUMN_FIXES: &[ColumnFix] = &[
    ColumnFix {
        table: "pedon",
        column: "recwlupdated",
        default: ColumnDefault::EpochTimestamp,
    },
    ColumnFix {
        table: "pedon",
        column: "siteobsiidref",
        default: ColumnDefault::IntegerZero,
    },
    ColumnFix {
        table: "pedon",
        column: "grpiidref",
        default: ColumnDefault::IntegerZero,
    },
    ColumnFix {
        table: "site",
        column: "grpiidref",
        default: ColumnDefault::IntegerZero,
    },
];

#[derive(Debug, Clone, Copy)]
pub struct LookupFix {
    pub table: &'static str,
    pub data: &'static str,
}

/// Lookup tables the code decoder needs, bundled as JSON reference data.
pub const LOOKUP_FIXES: &[LookupFix] = &[
    LookupFix {
        table: "MetadataDomainMaster",
        data: include_str!("../data/lookups/MetadataDomainMaster.json"),
    },
    LookupFix {
        table: "MetadataDomainDetail",
        data: include_str!("../data/lookups/MetadataDomainDetail.json"),
    },
    LookupFix {
        table: "MetadataTableColumn",
        data: include_str!("../data/lookups/MetadataTableColumn.json"),
    },
];

#[derive(Debug, Deserialize)]
struct LookupData {
    columns: Vec<LookupColumn>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct LookupColumn {
    name: String,
    #[serde(rename = "type")]
    sql_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchFailure {
    pub object: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PatchReport {
    pub renamed: Vec<(String, String)>,
    pub columns_added: Vec<String>,
    pub lookups_added: Vec<String>,
    pub failures: Vec<PatchFailure>,
}

impl PatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn changed(&self) -> bool {
        !(self.renamed.is_empty() && self.columns_added.is_empty() && self.lookups_added.is_empty())
    }

    pub fn merge(&mut self, other: PatchReport) {
        self.renamed.extend(other.renamed);
        self.columns_added.extend(other.columns_added);
        self.lookups_added.extend(other.lookups_added);
        self.failures.extend(other.failures);
    }

    fn fail(&mut self, object: &str, err: LdmError) {
        warn!(object, error = %err, "schema patch failed");
        self.failures.push(PatchFailure {
            object: object.to_string(),
            message: err.to_string(),
        });
    }
}

/// Opens `path` and applies view normalization, plus the companion fixes
/// when `companion` is set.
pub fn patch_database(path: &Utf8Path, companion: bool) -> Result<PatchReport, LdmError> {
    let mut conn = Connection::open(path.as_std_path())?;
    let mut report = normalize_views(&mut conn)?;
    if companion {
        report.merge(augment_companion(&mut conn)?);
    }
    info!(
        path = %path,
        renamed = report.renamed.len(),
        columns = report.columns_added.len(),
        lookups = report.lookups_added.len(),
        failures = report.failures.len(),
        "schema patched"
    );
    Ok(report)
}

/// Superficial check that `path` is a SQLite database with at least one
/// table. Returns the table count.
pub fn validate_database(path: &Utf8Path) -> Result<usize, LdmError> {
    let conn = Connection::open_with_flags(path.as_std_path(), OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
        [],
        |row| row.get(0),
    )?;
    if count == 0 {
        return Err(LdmError::Database(format!("{path} contains no tables")));
    }
    Ok(count as usize)
}

/// Replaces every suffixed view or table with a plain table under the
/// suffix-stripped name. Views go first so they are materialized while the
/// tables they select from still exist.
pub fn normalize_views(conn: &mut Connection) -> Result<PatchReport, LdmError> {
    let objects = {
        let mut stmt = conn.prepare(
            "SELECT name, type FROM sqlite_master
             WHERE type IN ('table', 'view') ORDER BY type DESC, name",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut report = PatchReport::default();
    for (name, kind) in objects {
        let Some(stripped) = strip_view_suffix(&name) else {
            continue;
        };
        match materialize(conn, &name, &kind, stripped) {
            Ok(()) => {
                debug!(from = %name, to = stripped, "view normalized");
                report.renamed.push((name.clone(), stripped.to_string()));
            }
            Err(err) => report.fail(&name, err),
        }
    }
    Ok(report)
}

pub fn strip_view_suffix(name: &str) -> Option<&str> {
    VIEW_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .filter(|stripped| !stripped.is_empty())
}

fn materialize(conn: &mut Connection, name: &str, kind: &str, target: &str) -> Result<(), LdmError> {
    let tx = conn.transaction()?;
    if let Some(existing) = object_type(&tx, target)? {
        tx.execute_batch(&format!("DROP {} {}", drop_keyword(&existing), quote_ident(target)))?;
    }
    tx.execute_batch(&format!(
        "CREATE TABLE {} AS SELECT * FROM {}",
        quote_ident(target),
        quote_ident(name)
    ))?;
    // Only remove the original once the plain copy exists.
    tx.execute_batch(&format!("DROP {} {}", drop_keyword(kind), quote_ident(name)))?;
    for registry in ["gpkg_contents", "gpkg_geometry_columns"] {
        if object_type(&tx, registry)?.is_some() {
            tx.execute(
                &format!("UPDATE {registry} SET table_name = ?1 WHERE table_name = ?2"),
                params![target, name],
            )?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Adds the known-missing companion columns and lookup tables.
pub fn augment_companion(conn: &mut Connection) -> Result<PatchReport, LdmError> {
    let mut report = PatchReport::default();

    for fix in COLUMN_FIXES {
        let object = format!("{}.{}", fix.table, fix.column);
        match add_column(conn, fix) {
            Ok(true) => report.columns_added.push(object),
            Ok(false) => {}
            Err(err) => report.fail(&object, err),
        }
    }

    for fix in LOOKUP_FIXES {
        match add_lookup(conn, fix) {
            Ok(true) => report.lookups_added.push(fix.table.to_string()),
            Ok(false) => {}
            Err(err) => report.fail(fix.table, err),
        }
    }
    Ok(report)
}

fn add_column(conn: &Connection, fix: &ColumnFix) -> Result<bool, LdmError> {
    if object_type(conn, fix.table)?.as_deref() != Some("table") {
        return Ok(false);
    }
    if table_columns(conn, fix.table)?
        .iter()
        .any(|column| column.eq_ignore_ascii_case(fix.column))
    {
        return Ok(false);
    }
    conn.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote_ident(fix.table),
        quote_ident(fix.column),
        fix.default.definition()
    ))?;
    Ok(true)
}

fn add_lookup(conn: &mut Connection, fix: &LookupFix) -> Result<bool, LdmError> {
    if object_type(conn, fix.table)?.is_some() {
        return Ok(false);
    }
    let data: LookupData = serde_json::from_str(fix.data)
        .map_err(|err| LdmError::Database(format!("bundled lookup {}: {err}", fix.table)))?;

    let columns = data
        .columns
        .iter()
        .map(|column| format!("{} {}", quote_ident(&column.name), column.sql_type))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=data.columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");

    let tx = conn.transaction()?;
    tx.execute_batch(&format!("CREATE TABLE {} ({columns})", quote_ident(fix.table)))?;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {} VALUES ({placeholders})",
            quote_ident(fix.table)
        ))?;
        for row in &data.rows {
            if row.len() != data.columns.len() {
                return Err(LdmError::Database(format!(
                    "bundled lookup {} has a row with {} values, expected {}",
                    fix.table,
                    row.len(),
                    data.columns.len()
                )));
            }
            stmt.execute(params_from_iter(row.iter().map(json_to_sql)))?;
        }
    }
    tx.commit()?;
    Ok(true)
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(int) => SqlValue::Integer(int),
            None => SqlValue::Real(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

pub(crate) fn object_type(conn: &Connection, name: &str) -> Result<Option<String>, LdmError> {
    Ok(conn
        .query_row(
            "SELECT type FROM sqlite_master WHERE name = ?1 AND type IN ('table', 'view')",
            params![name],
            |row| row.get(0),
        )
        .optional()?)
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, LdmError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn drop_keyword(kind: &str) -> &'static str {
    if kind == "view" { "VIEW" } else { "TABLE" }
}
