pub mod config;
pub mod error;
pub mod ingestion;

pub use config::{Catalog, ColumnTypes, DatasetEntry, Destination, RepairRule, NAMESPACE_PREFIX};
pub use error::{IngestError, Result};
pub use ingestion::{IngestionOrchestrator, RunSummary, TableBuilder};
