use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Resource unavailable: {source_location}: {reason}")]
    ResourceUnavailable {
        source_location: String,
        reason: String,
    },

    /// Recorded per skipped row by the repair step, never returned from it.
    #[error("Malformed row at line {line}: expected {expected} fields, found {found}")]
    MalformedRow {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("Load failed for table '{table}': {cause}")]
    LoadFailed { table: String, cause: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] duckdb::Error),
}

impl IngestError {
    pub fn unavailable(source_location: impl Into<String>, reason: impl ToString) -> Self {
        IngestError::ResourceUnavailable {
            source_location: source_location.into(),
            reason: reason.to_string(),
        }
    }

    pub fn load_failed(table: impl Into<String>, cause: impl ToString) -> Self {
        IngestError::LoadFailed {
            table: table.into(),
            cause: cause.to_string(),
        }
    }

    /// Short label used in the run summary.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::ResourceUnavailable { .. } => "ResourceUnavailable",
            IngestError::MalformedRow { .. } => "MalformedRow",
            IngestError::LoadFailed { .. } => "LoadFailed",
            IngestError::Config(_) => "Config",
            IngestError::Csv(_) => "Csv",
            IngestError::Io(_) => "Io",
            IngestError::Json(_) => "Json",
            IngestError::Database(_) => "Database",
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
