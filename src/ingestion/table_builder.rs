//! Table Builder - Materializes repaired CSV text as DuckDB tables
//!
//! Each table is created with CREATE OR REPLACE inside its own
//! transaction and row-counted before commit, so a failed load leaves the
//! previous table (if any) visible under the name.

use crate::config::{ColumnTypes, Destination};
use crate::error::{IngestError, Result};
use crate::ingestion::csv_repair::CleanedResource;
use duckdb::{params, Connection};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub struct TableBuilder {
    conn: Connection,
    destination: Destination,
    fallback_reason: Option<String>,
    /// Where CSV text is staged for `read_csv`; system temp dir when unset.
    staging_dir: Option<PathBuf>,
}

impl TableBuilder {
    /// Open the destination. A file database is created if absent.
    pub fn open(destination: &Destination) -> Result<Self> {
        let conn = match destination {
            Destination::InMemory => Connection::open_in_memory()?,
            Destination::File(path) => Connection::open(path)?,
        };
        info!("Using database: {}", destination);
        Ok(Self {
            conn,
            destination: destination.clone(),
            fallback_reason: None,
            staging_dir: None,
        })
    }

    /// Like `open`, but an unopenable file destination degrades to an
    /// in-memory database instead of failing the run.
    pub fn open_with_fallback(destination: &Destination) -> Result<Self> {
        match Self::open(destination) {
            Ok(builder) => Ok(builder),
            Err(e) if *destination != Destination::InMemory => {
                warn!("Error connecting to {}: {}. Using an in-memory database instead.", destination, e);
                let mut builder = Self::open(&Destination::InMemory)?;
                builder.fallback_reason = Some(format!("could not open {}: {}", destination, e));
                Ok(builder)
            }
            Err(e) => Err(e),
        }
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// The destination actually in use.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        self.fallback_reason.as_deref()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Replace `table` with the rows of `cleaned`. Returns the loaded row count.
    pub fn materialize(
        &mut self,
        table: &str,
        cleaned: &CleanedResource,
        column_types: Option<&ColumnTypes>,
    ) -> Result<u64> {
        if let Some(types) = column_types {
            check_types_match_header(table, types, &cleaned.header)?;
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("nw_staged_").suffix(".csv");
        let mut staged = match &self.staging_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|e| IngestError::load_failed(table, e))?;
        staged
            .write_all(cleaned.text.as_bytes())
            .and_then(|_| staged.flush())
            .map_err(|e| IngestError::load_failed(table, e))?;

        let path = staged.path().to_string_lossy().into_owned();
        let sql = create_table_sql(table, &path, column_types);
        debug!("{}", sql);

        let tx = self
            .conn
            .transaction()
            .map_err(|e| IngestError::load_failed(table, e))?;
        tx.execute_batch(&sql)
            .map_err(|e| IngestError::load_failed(table, e))?;

        let loaded: i64 = tx
            .query_row(&format!("SELECT count(*) FROM {}", quote_ident(table)), [], |row| row.get(0))
            .map_err(|e| IngestError::load_failed(table, e))?;
        let loaded = loaded as u64;
        if loaded != cleaned.row_count {
            // dropping tx rolls back
            return Err(IngestError::load_failed(
                table,
                format!("loaded {} rows but source has {}", loaded, cleaned.row_count),
            ));
        }

        tx.commit().map_err(|e| IngestError::load_failed(table, e))?;
        Ok(loaded)
    }

    pub fn row_count(&self, table: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT count(*) FROM {}", quote_ident(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// (name, type) pairs in column order.
    pub fn columns(&self, table: &str) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_name = ? ORDER BY ordinal_position",
        )?;
        let columns = stmt
            .query_map(params![table], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<(String, String)>, _>>()?;
        Ok(columns)
    }

    /// Tables whose names start with `prefix`, sorted.
    pub fn list_tables(&self, prefix: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_name LIKE ? ORDER BY table_name",
        )?;
        let tables = stmt
            .query_map(params![format!("{}%", prefix)], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        // LIKE treats '_' as a wildcard
        Ok(tables.into_iter().filter(|t| t.starts_with(prefix)).collect())
    }

    /// Up to `limit` rows rendered as text.
    pub fn preview(&self, table: &str, limit: usize) -> Result<Vec<Vec<Option<String>>>> {
        let columns = self.columns(table)?;
        if columns.is_empty() {
            return Err(IngestError::Config(format!("table '{}' does not exist", table)));
        }
        let select = columns
            .iter()
            .map(|(name, _)| format!("CAST({} AS VARCHAR)", quote_ident(name)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {} FROM {} LIMIT {}", select, quote_ident(table), limit);

        let width = columns.len();
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get::<_, Option<String>>(i))
                    .collect::<std::result::Result<Vec<_>, _>>()
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn check_types_match_header(table: &str, types: &ColumnTypes, header: &[String]) -> Result<()> {
    let declared: Vec<&str> = types.names().collect();
    let actual: Vec<&str> = header.iter().map(|h| h.trim()).collect();
    if declared != actual {
        return Err(IngestError::load_failed(
            table,
            format!(
                "explicit column types [{}] do not match header [{}]",
                declared.join(", "),
                actual.join(", ")
            ),
        ));
    }
    Ok(())
}

fn create_table_sql(table: &str, csv_path: &str, column_types: Option<&ColumnTypes>) -> String {
    let mut options = vec![
        "delim=','".to_string(),
        "header=true".to_string(),
        "quote='\"'".to_string(),
        "escape='\"'".to_string(),
    ];

    match column_types {
        Some(types) => {
            options.push("auto_detect=false".to_string());
            let columns = types
                .columns
                .iter()
                .map(|c| format!("{}: {}", quote_literal(&c.name), quote_literal(&c.sql_type)))
                .collect::<Vec<_>>()
                .join(", ");
            options.push(format!("columns={{{}}}", columns));
            if let Some(format) = &types.date_format {
                options.push(format!("dateformat={}", quote_literal(format)));
            }
            if let Some(format) = &types.timestamp_format {
                options.push(format!("timestampformat={}", quote_literal(format)));
            }
            if !types.null_strings.is_empty() {
                let nulls = types
                    .null_strings
                    .iter()
                    .map(|s| quote_literal(s))
                    .collect::<Vec<_>>()
                    .join(", ");
                options.push(format!("nullstr=[{}]", nulls));
            }
        }
        None => {
            options.push("auto_detect=true".to_string());
            options.push("sample_size=-1".to_string());
        }
    }

    format!(
        "CREATE OR REPLACE TABLE {} AS SELECT * FROM read_csv({}, {});",
        quote_ident(table),
        quote_literal(csv_path),
        options.join(", ")
    )
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
