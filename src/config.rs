//! Ingestion configuration - dataset catalog, repair rules, column typing
//! and destination selection.

use crate::error::{IngestError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Prepended to every target table so loaded tables never collide with
/// unrelated tables in the destination.
pub const NAMESPACE_PREFIX: &str = "nw_";

/// Public mirror of the Northwind CSV files.
pub const DEFAULT_BASE_URL: &str =
    "https://raw.githubusercontent.com/neo4j-contrib/northwind-neo4j/master/data/";

/// Environment variable consulted when `--base-url` is not given.
pub const BASE_URL_ENV: &str = "NORTHWIND_BASE_URL";

/// Cell repair applied to one dataset.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepairRule {
    /// Columns whose values have embedded commas removed.
    #[serde(default)]
    pub columns: Vec<String>,

    /// Substituted for every embedded comma. Empty strips them.
    #[serde(default)]
    pub replacement: String,

    /// Join surplus trailing fields into the last column instead of
    /// skipping the row.
    #[serde(default)]
    pub merge_overflow: bool,
}

impl RepairRule {
    pub fn columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnType {
    pub name: String,
    pub sql_type: String,
}

/// Explicit schema for a dataset whose types the engine would mis-detect.
/// Columns are listed in header order.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnTypes {
    pub columns: Vec<ColumnType>,

    #[serde(default)]
    pub date_format: Option<String>,

    #[serde(default)]
    pub timestamp_format: Option<String>,

    /// Cell values read as NULL.
    #[serde(default)]
    pub null_strings: Vec<String>,
}

impl ColumnTypes {
    pub fn new<I, N, T>(columns: I) -> Self
    where
        I: IntoIterator<Item = (N, T)>,
        N: Into<String>,
        T: Into<String>,
    {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, sql_type)| ColumnType {
                    name: name.into(),
                    sql_type: sql_type.into(),
                })
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_timestamp_format(mut self, format: impl Into<String>) -> Self {
        self.timestamp_format = Some(format.into());
        self
    }

    pub fn with_date_format(mut self, format: impl Into<String>) -> Self {
        self.date_format = Some(format.into());
        self
    }

    pub fn with_null_strings<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.null_strings = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Where a dataset's CSV text comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceLocation {
    Url(String),
    Path(PathBuf),
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocation::Url(url) => write!(f, "{}", url),
            SourceLocation::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// One named source-to-table mapping.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetEntry {
    /// Logical name, unique within a catalog.
    pub name: String,

    /// Absolute URL, local path, or a file name resolved against the base URL.
    pub source: String,

    #[serde(default)]
    pub repair: RepairRule,

    #[serde(default)]
    pub column_types: Option<ColumnTypes>,
}

impl DatasetEntry {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            repair: RepairRule::default(),
            column_types: None,
        }
    }

    pub fn with_repair(mut self, repair: RepairRule) -> Self {
        self.repair = repair;
        self
    }

    pub fn with_column_types(mut self, column_types: ColumnTypes) -> Self {
        self.column_types = Some(column_types);
        self
    }

    pub fn table_name(&self) -> String {
        table_name_for(&self.name)
    }

    /// Resolve `source` against `base`, which may itself be a URL or a
    /// local directory.
    pub fn resolve_source(&self, base: &str) -> SourceLocation {
        let source = self.source.as_str();
        if is_url(source) {
            return SourceLocation::Url(source.to_string());
        }
        if let Some(path) = source.strip_prefix("file://") {
            return SourceLocation::Path(PathBuf::from(path));
        }
        if Path::new(source).is_absolute() || source.starts_with("./") || source.starts_with("../") {
            return SourceLocation::Path(PathBuf::from(source));
        }

        if is_url(base) {
            let sep = if base.ends_with('/') { "" } else { "/" };
            SourceLocation::Url(format!("{}{}{}", base, sep, source))
        } else {
            let base = base.strip_prefix("file://").unwrap_or(base);
            SourceLocation::Path(Path::new(base).join(source))
        }
    }
}

fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// `order-details` becomes `nw_order_details`.
pub fn table_name_for(logical_name: &str) -> String {
    format!("{}{}", NAMESPACE_PREFIX, logical_name.replace('-', "_"))
}

/// The fixed list of datasets loaded in one run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Catalog {
    pub entries: Vec<DatasetEntry>,
}

impl Catalog {
    pub fn new(entries: Vec<DatasetEntry>) -> Self {
        Self { entries }
    }

    /// The eight Northwind tables. Repair columns were picked by looking
    /// at the published files; new datasets need the same inspection.
    pub fn northwind() -> Self {
        let orders_types = ColumnTypes::new([
            ("orderID", "INTEGER"),
            ("customerID", "VARCHAR"),
            ("employeeID", "INTEGER"),
            ("orderDate", "TIMESTAMP"),
            ("requiredDate", "TIMESTAMP"),
            ("shippedDate", "TIMESTAMP"),
            ("shipVia", "INTEGER"),
            ("freight", "DOUBLE"),
            ("shipName", "VARCHAR"),
            ("shipAddress", "VARCHAR"),
            ("shipCity", "VARCHAR"),
            ("shipRegion", "VARCHAR"),
            ("shipPostalCode", "VARCHAR"),
            ("shipCountry", "VARCHAR"),
        ])
        .with_timestamp_format("%Y-%m-%d %H:%M:%S.%g")
        .with_null_strings(["NULL", ""]);

        Self::new(vec![
            DatasetEntry::new("categories", "categories.csv")
                .with_repair(RepairRule::columns(["description"])),
            DatasetEntry::new("customers", "customers.csv").with_repair(RepairRule::columns([
                "companyName",
                "address",
                "phone",
                "fax",
            ])),
            DatasetEntry::new("employees", "employees.csv").with_repair(RepairRule::columns([
                "title",
                "address",
                "notes",
            ])),
            DatasetEntry::new("order-details", "order-details.csv"),
            DatasetEntry::new("orders", "orders.csv")
                .with_repair(RepairRule::columns(["shipName", "shipAddress"]))
                .with_column_types(orders_types),
            DatasetEntry::new("products", "products.csv")
                .with_repair(RepairRule::columns(["productName", "quantityPerUnit"])),
            DatasetEntry::new("shippers", "shippers.csv"),
            DatasetEntry::new("suppliers", "suppliers.csv").with_repair(RepairRule::columns([
                "companyName",
                "address",
                "phone",
                "fax",
                "homePage",
            ])),
        ])
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let catalog: Catalog = serde_json::from_str(json)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let name_re = Regex::new(r"^[A-Za-z0-9_-]+$")
            .map_err(|e| IngestError::Config(e.to_string()))?;

        if self.entries.is_empty() {
            return Err(IngestError::Config("catalog has no datasets".to_string()));
        }

        let mut seen = HashSet::new();
        for entry in &self.entries {
            if !name_re.is_match(&entry.name) {
                return Err(IngestError::Config(format!(
                    "dataset name '{}' may only contain letters, digits, '_' and '-'",
                    entry.name
                )));
            }
            if !seen.insert(entry.table_name()) {
                return Err(IngestError::Config(format!(
                    "dataset '{}' maps to table '{}' more than once",
                    entry.name,
                    entry.table_name()
                )));
            }
            if entry.source.trim().is_empty() {
                return Err(IngestError::Config(format!(
                    "dataset '{}' has no source",
                    entry.name
                )));
            }
            if let Some(types) = &entry.column_types {
                if types.columns.is_empty() {
                    return Err(IngestError::Config(format!(
                        "dataset '{}' declares column types but lists no columns",
                        entry.name
                    )));
                }
                let mut names = HashSet::new();
                for column in &types.columns {
                    if !names.insert(column.name.as_str()) {
                        return Err(IngestError::Config(format!(
                            "dataset '{}' types column '{}' twice",
                            entry.name, column.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Keep only the named datasets, in catalog order.
    pub fn retain_only(&mut self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        for name in names {
            if !self.entries.iter().any(|e| &e.name == name) {
                return Err(IngestError::Config(format!("unknown dataset '{}'", name)));
            }
        }
        self.entries.retain(|e| names.contains(&e.name));
        Ok(())
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::northwind()
    }
}

/// Destination database selected by `--db`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    InMemory,
    File(PathBuf),
}

impl Destination {
    pub fn from_option(db: Option<PathBuf>) -> Self {
        match db {
            Some(path) => Destination::File(path),
            None => Destination::InMemory,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::InMemory => write!(f, ":memory:"),
            Destination::File(path) => write!(f, "{}", path.display()),
        }
    }
}
