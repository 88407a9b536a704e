//! Ingestion Orchestrator - Runs every catalog entry to a terminal state
//!
//! Fetches run concurrently; repair and table creation run one entry at a
//! time over the single destination connection. A failing entry never
//! stops its siblings.

use crate::config::{Catalog, DatasetEntry, NAMESPACE_PREFIX};
use crate::error::{IngestError, Result};
use crate::ingestion::connector::{RawResource, ResourceFetcher};
use crate::ingestion::csv_repair::{repair_csv, RepairReport};
use crate::ingestion::table_builder::TableBuilder;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_PARTIAL_FAILURE: u8 = 1;
/// Bad arguments or catalog, or a destination that could not be opened.
pub const EXIT_SETUP_ERROR: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Fetched,
    Cleaned,
    Loaded,
    Failed,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryState::Pending => "pending",
            EntryState::Fetched => "fetched",
            EntryState::Cleaned => "cleaned",
            EntryState::Loaded => "loaded",
            EntryState::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Result of one entry's pipeline.
#[derive(Debug)]
pub struct DatasetOutcome {
    pub name: String,
    pub table: String,
    pub source: String,
    pub state: EntryState,
    /// Last state reached before failing.
    pub failed_after: Option<EntryState>,
    pub rows_loaded: Option<u64>,
    pub repair: Option<RepairReport>,
    pub error: Option<IngestError>,
}

impl DatasetOutcome {
    fn new(entry: &DatasetEntry, source: String) -> Self {
        Self {
            name: entry.name.clone(),
            table: entry.table_name(),
            source,
            state: EntryState::Pending,
            failed_after: None,
            rows_loaded: None,
            repair: None,
            error: None,
        }
    }

    fn advance(&mut self, state: EntryState) {
        info!("{}: {} -> {}", self.name, self.state, state);
        self.state = state;
    }

    fn fail(&mut self, err: IngestError) {
        error!("{}: failed after {}: {}", self.name, self.state, err);
        self.failed_after = Some(self.state);
        self.state = EntryState::Failed;
        self.error = Some(err);
    }

    pub fn skipped_rows(&self) -> usize {
        self.repair.as_ref().map(|r| r.skipped_count()).unwrap_or(0)
    }

    pub fn is_loaded(&self) -> bool {
        self.state == EntryState::Loaded
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub destination: String,
    pub fallback_reason: Option<String>,
    /// In catalog order.
    pub outcomes: Vec<DatasetOutcome>,
    /// Prefixed tables present in the destination after the run.
    pub tables: Vec<String>,
}

impl RunSummary {
    pub fn failed(&self) -> impl Iterator<Item = &DatasetOutcome> {
        self.outcomes.iter().filter(|o| o.state == EntryState::Failed)
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }

    /// Process exit status: 0 when every dataset loaded, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.has_failures() {
            EXIT_PARTIAL_FAILURE
        } else {
            EXIT_SUCCESS
        }
    }

    pub fn outcome(&self, name: &str) -> Option<&DatasetOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} ({} -> {})", self.run_id, self.started_at.to_rfc3339(), self.finished_at.to_rfc3339())?;
        writeln!(f, "Database: {}", self.destination)?;
        if let Some(reason) = &self.fallback_reason {
            writeln!(f, "  fell back to in-memory: {}", reason)?;
        }
        writeln!(f)?;
        writeln!(f, "{:<20} {:<24} {:>8} {:>8}  {}", "dataset", "table", "rows", "skipped", "status")?;
        for o in &self.outcomes {
            let rows = o.rows_loaded.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
            let status = match (&o.error, o.failed_after) {
                (Some(err), Some(after)) => format!("{} after {}: {} ({})", o.state, after, err.kind(), err),
                _ => o.state.to_string(),
            };
            writeln!(f, "{:<20} {:<24} {:>8} {:>8}  {}", o.name, o.table, rows, o.skipped_rows(), status)?;
        }

        let failed = self.failed().count();
        writeln!(f)?;
        writeln!(f, "{} of {} datasets loaded, {} failed", self.outcomes.len() - failed, self.outcomes.len(), failed)?;

        writeln!(f)?;
        writeln!(f, "Tables in the DuckDB database:")?;
        for table in &self.tables {
            writeln!(f, "  {}", table)?;
        }
        Ok(())
    }
}

pub struct IngestionOrchestrator {
    fetcher: Arc<dyn ResourceFetcher>,
    base_url: String,
}

impl IngestionOrchestrator {
    pub fn new(fetcher: Arc<dyn ResourceFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
        }
    }

    /// Attempt every entry in `catalog` and report each outcome.
    pub async fn run(&self, catalog: &Catalog, target: &mut TableBuilder) -> Result<RunSummary> {
        catalog.validate()?;

        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let span = info_span!("ingest", run_id = %run_id);

        let mut outcomes: Vec<DatasetOutcome> = catalog
            .entries
            .iter()
            .map(|e| DatasetOutcome::new(e, e.resolve_source(&self.base_url).to_string()))
            .collect();

        let mut fetched = self.fetch_all(catalog).instrument(span.clone()).await;

        let tables = span.in_scope(|| {
            info!("Loading {} datasets into {}", catalog.entries.len(), target.destination());

            for (idx, entry) in catalog.entries.iter().enumerate() {
                let outcome = &mut outcomes[idx];
                let raw = match fetched[idx].take() {
                    Some(Ok(raw)) => raw,
                    Some(Err(err)) => {
                        outcome.fail(err);
                        continue;
                    }
                    None => {
                        let source = outcome.source.clone();
                        outcome.fail(IngestError::unavailable(source, "fetch task aborted"));
                        continue;
                    }
                };
                outcome.advance(EntryState::Fetched);
                self.clean_and_load(entry, raw, outcome, target);
            }

            target.list_tables(NAMESPACE_PREFIX).unwrap_or_else(|e| {
                warn!("Could not list tables: {}", e);
                Vec::new()
            })
        });

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            destination: target.destination().to_string(),
            fallback_reason: target.fallback_reason().map(str::to_string),
            outcomes,
            tables,
        })
    }

    /// One fetch task per entry; results indexed by catalog position.
    async fn fetch_all(&self, catalog: &Catalog) -> Vec<Option<Result<RawResource>>> {
        let mut tasks = JoinSet::new();
        for (idx, entry) in catalog.entries.iter().enumerate() {
            let fetcher = Arc::clone(&self.fetcher);
            let location = entry.resolve_source(&self.base_url);
            tasks.spawn(async move { (idx, fetcher.fetch(&location).await) });
        }

        let mut results: Vec<Option<Result<RawResource>>> =
            (0..catalog.entries.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => results[idx] = Some(result),
                Err(e) => error!("Fetch task failed: {}", e),
            }
        }
        results
    }

    fn clean_and_load(
        &self,
        entry: &DatasetEntry,
        raw: RawResource,
        outcome: &mut DatasetOutcome,
        target: &mut TableBuilder,
    ) {
        let (cleaned, report) = match repair_csv(raw, &entry.repair) {
            Ok(repaired) => repaired,
            Err(err) => {
                outcome.fail(err);
                return;
            }
        };
        if report.skipped_count() > 0 {
            warn!("{}: skipped {} malformed rows", entry.name, report.skipped_count());
            for row in &report.skipped {
                debug!("{}: {}", entry.name, row.to_error());
            }
        }
        outcome.repair = Some(report);
        outcome.advance(EntryState::Cleaned);

        match target.materialize(&outcome.table, &cleaned, entry.column_types.as_ref()) {
            Ok(rows) => {
                info!("Table '{}' created or replaced with {} rows from '{}'", outcome.table, rows, cleaned.origin);
                outcome.rows_loaded = Some(rows);
                outcome.advance(EntryState::Loaded);
            }
            Err(err) => outcome.fail(err),
        }
    }
}
