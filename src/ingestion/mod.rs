//! Ingestion Module
//!
//! Moves each catalog entry through fetch, cell repair and table
//! materialization:
//! - Fetcher: remote or local CSV text into memory
//! - CSV repair: embedded commas stripped from configured columns
//! - Table builder: replace-if-exists tables in DuckDB
//! - Orchestrator: per-entry state machine and the run summary

pub mod connector;
pub mod csv_repair;
pub mod table_builder;
pub mod orchestrator;

pub use connector::{Fetcher, RawResource, ResourceFetcher};
pub use csv_repair::{repair_csv, CleanedResource, RepairReport, SkippedRow};
pub use table_builder::TableBuilder;
pub use orchestrator::{
    DatasetOutcome, EntryState, IngestionOrchestrator, RunSummary, EXIT_PARTIAL_FAILURE,
    EXIT_SETUP_ERROR, EXIT_SUCCESS,
};
