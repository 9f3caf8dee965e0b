use std::collections::{BTreeMap, HashMap};

use camino::Utf8Path;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::{debug, warn};

use crate::error::LdmError;
use crate::patch::{object_type, quote_ident};

pub type Attributes = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Horizon {
    pub top: Option<f64>,
    pub bottom: Option<f64>,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub site: Attributes,
    pub horizons: Vec<Horizon>,
}

/// Soil profiles with one site record each and depth-ordered horizons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileCollection {
    pub source: String,
    pub id_column: String,
    pub top_column: String,
    pub bottom_column: String,
    pub profiles: Vec<Profile>,
}

impl ProfileCollection {
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn horizon_count(&self) -> usize {
        self.profiles.iter().map(|profile| profile.horizons.len()).sum()
    }

    pub fn get(&self, id: &str) -> Option<&Profile> {
        self.profiles.iter().find(|profile| profile.id == id)
    }

    /// Ids of profiles where a horizon starts above the bottom of the one
    /// before it.
    pub fn overlapping_profiles(&self) -> Vec<&str> {
        self.profiles
            .iter()
            .filter(|profile| {
                profile.horizons.windows(2).any(|pair| match (pair[0].bottom, pair[1].top) {
                    (Some(bottom), Some(top)) => top < bottom,
                    _ => false,
                })
            })
            .map(|profile| profile.id.as_str())
            .collect()
    }
}

/// Which tables and columns make up a collection, and how to read them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    pub site_table: String,
    pub horizon_table: String,
    pub id_column: String,
    pub horizon_ref_column: String,
    pub top_column: String,
    pub bottom_column: String,
    /// Replace coded integers with their labels when the metadata lookup
    /// tables are present.
    pub decode_codes: bool,
}

impl LoadOptions {
    pub fn ldm() -> Self {
        Self {
            site_table: "lab_combine_nasis_ncss".to_string(),
            horizon_table: "lab_layer".to_string(),
            id_column: "pedon_key".to_string(),
            horizon_ref_column: "pedon_key".to_string(),
            top_column: "hzn_top".to_string(),
            bottom_column: "hzn_bot".to_string(),
            decode_codes: true,
        }
    }

    pub fn nasis() -> Self {
        Self {
            site_table: "pedon".to_string(),
            horizon_table: "phorizon".to_string(),
            id_column: "peiid".to_string(),
            horizon_ref_column: "peiidref".to_string(),
            top_column: "hzdept".to_string(),
            bottom_column: "hzdepb".to_string(),
            decode_codes: true,
        }
    }

    pub fn without_code_decoding(mut self) -> Self {
        self.decode_codes = false;
        self
    }
}

pub trait ProfileLoader {
    fn load(&self, database: &Utf8Path, options: &LoadOptions) -> Result<ProfileCollection, LdmError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteProfileLoader;

impl ProfileLoader for SqliteProfileLoader {
    fn load(&self, database: &Utf8Path, options: &LoadOptions) -> Result<ProfileCollection, LdmError> {
        if !database.as_std_path().is_file() {
            return Err(LdmError::Load(format!("{database} does not exist")));
        }
        let conn = Connection::open_with_flags(database.as_std_path(), OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|err| LdmError::Load(format!("open {database}: {err}")))?;
        load_collection(&conn, database, options).map_err(|err| match err {
            LdmError::Load(_) => err,
            other => LdmError::Load(other.to_string()),
        })
    }
}

fn load_collection(
    conn: &Connection,
    database: &Utf8Path,
    options: &LoadOptions,
) -> Result<ProfileCollection, LdmError> {
    for table in [&options.site_table, &options.horizon_table] {
        if object_type(conn, table)?.is_none() {
            return Err(LdmError::Load(format!("{database} has no table {table}")));
        }
    }

    let decoder = if options.decode_codes {
        CodeDecoder::from_database(conn)?
    } else {
        CodeDecoder::default()
    };

    let mut profiles = Vec::new();
    let mut index = HashMap::new();
    let mut skipped_sites = 0usize;
    for mut site in read_rows(conn, &options.site_table)? {
        decoder.apply(&options.site_table, &mut site);
        let Some(id) = site.get(&options.id_column).and_then(key_string) else {
            skipped_sites += 1;
            continue;
        };
        if index.contains_key(&id) {
            skipped_sites += 1;
            continue;
        }
        index.insert(id.clone(), profiles.len());
        profiles.push(Profile {
            id,
            site,
            horizons: Vec::new(),
        });
    }

    let mut orphans = 0usize;
    for mut attributes in read_rows(conn, &options.horizon_table)? {
        decoder.apply(&options.horizon_table, &mut attributes);
        let slot = attributes
            .get(&options.horizon_ref_column)
            .and_then(key_string)
            .and_then(|id| index.get(&id).copied());
        let Some(slot) = slot else {
            orphans += 1;
            continue;
        };
        let top = attributes.get(&options.top_column).and_then(as_depth);
        let bottom = attributes.get(&options.bottom_column).and_then(as_depth);
        profiles[slot].horizons.push(Horizon {
            top,
            bottom,
            attributes,
        });
    }

    for profile in &mut profiles {
        profile.horizons.sort_by(|a, b| {
            depth_key(a.top)
                .total_cmp(&depth_key(b.top))
                .then(depth_key(a.bottom).total_cmp(&depth_key(b.bottom)))
        });
    }

    if skipped_sites > 0 {
        warn!(table = %options.site_table, skipped_sites, "site rows without a usable id were skipped");
    }
    if orphans > 0 {
        warn!(table = %options.horizon_table, orphans, "horizons without a matching profile were dropped");
    }
    debug!(profiles = profiles.len(), database = %database, "collection loaded");

    Ok(ProfileCollection {
        source: database.file_name().unwrap_or(database.as_str()).to_string(),
        id_column: options.id_column.clone(),
        top_column: options.top_column.clone(),
        bottom_column: options.bottom_column.clone(),
        profiles,
    })
}

fn read_rows(conn: &Connection, table: &str) -> Result<Vec<Attributes>, LdmError> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {}", quote_ident(table)))?;
    let names = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut attributes = Attributes::new();
        for (i, name) in names.iter().enumerate() {
            attributes.insert(name.clone(), sql_to_json(row.get_ref(i)?));
        }
        out.push(attributes);
    }
    Ok(out)
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(int) => Value::from(int),
        ValueRef::Real(real) => Number::from_f64(real).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => Value::String(hex::encode(blob)),
    }
}

fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn as_depth(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn depth_key(depth: Option<f64>) -> f64 {
    depth.unwrap_or(f64::INFINITY)
}

fn text_value(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Text(text) => Some(String::from_utf8_lossy(text).into_owned()),
        _ => None,
    }
}

fn code_value(value: ValueRef<'_>) -> Option<i64> {
    match value {
        ValueRef::Integer(int) => Some(int),
        ValueRef::Text(text) => String::from_utf8_lossy(text).trim().parse().ok(),
        _ => None,
    }
}

/// Maps `(table, column, code)` to a choice label using the metadata lookup
/// tables shipped with the companion database.
#[derive(Debug, Default)]
struct CodeDecoder {
    labels: HashMap<(String, String), HashMap<i64, String>>,
}

impl CodeDecoder {
    fn from_database(conn: &Connection) -> Result<Self, LdmError> {
        if object_type(conn, "MetadataTableColumn")?.is_none()
            || object_type(conn, "MetadataDomainDetail")?.is_none()
        {
            return Ok(Self::default());
        }
        match Self::read_labels(conn) {
            Ok(decoder) => Ok(decoder),
            Err(err) => {
                warn!(error = %err, "metadata lookups are unreadable, codes stay raw");
                Ok(Self::default())
            }
        }
    }

    fn read_labels(conn: &Connection) -> Result<Self, LdmError> {
        let mut stmt = conn.prepare(
            "SELECT c.TableName, c.ColumnPhysicalName, d.ChoiceValue, d.ChoiceLabel
             FROM MetadataTableColumn c
             JOIN MetadataDomainDetail d ON d.DomainID = c.DomainID",
        )?;
        let mut rows = stmt.query([])?;
        let mut labels: HashMap<(String, String), HashMap<i64, String>> = HashMap::new();
        let mut skipped = 0usize;
        while let Some(row) = rows.next()? {
            let entry = (
                text_value(row.get_ref(0)?),
                text_value(row.get_ref(1)?),
                code_value(row.get_ref(2)?),
                text_value(row.get_ref(3)?),
            );
            let (Some(table), Some(column), Some(value), Some(label)) = entry else {
                skipped += 1;
                continue;
            };
            labels
                .entry((table.to_lowercase(), column.to_lowercase()))
                .or_default()
                .insert(value, label);
        }
        if skipped > 0 {
            debug!(skipped, "incomplete metadata lookup rows ignored");
        }
        Ok(Self { labels })
    }

    fn apply(&self, table: &str, attributes: &mut Attributes) {
        if self.labels.is_empty() {
            return;
        }
        let table = table.to_lowercase();
        for (column, value) in attributes.iter_mut() {
            let Some(code) = value.as_i64() else {
                continue;
            };
            let label = self
                .labels
                .get(&(table.clone(), column.to_lowercase()))
                .and_then(|choices| choices.get(&code));
            if let Some(label) = label {
                *value = Value::String(label.clone());
            }
        }
    }
}
