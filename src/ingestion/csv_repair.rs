//! CSV Repair - Strips embedded commas from configured columns
//!
//! The text is parsed with real CSV quoting rules, so delimiters are never
//! touched; only the values of targeted columns change. Every written row
//! has exactly the header's field count.

use crate::config::RepairRule;
use crate::error::{IngestError, Result};
use crate::ingestion::connector::RawResource;
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use tracing::{debug, warn};

/// Repaired CSV text ready for table creation.
#[derive(Clone, Debug)]
pub struct CleanedResource {
    pub origin: String,
    pub header: Vec<String>,
    pub text: String,
    /// Data rows in `text`, header excluded.
    pub row_count: u64,
}

/// A data row dropped for having the wrong number of fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedRow {
    pub line: u64,
    pub expected: usize,
    pub found: usize,
}

impl SkippedRow {
    pub fn to_error(&self) -> IngestError {
        IngestError::MalformedRow {
            line: self.line,
            expected: self.expected,
            found: self.found,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub rows_read: u64,
    pub rows_written: u64,
    pub cells_repaired: u64,
    /// Overflowing rows folded back into the header width.
    pub rows_merged: u64,
    pub skipped: Vec<SkippedRow>,
    /// Repair columns absent from the header.
    pub missing_columns: Vec<String>,
}

impl RepairReport {
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

/// Repair `raw` according to `rule`.
///
/// Rows with fewer fields than the header are skipped and reported. Rows
/// with more fields are skipped too unless `rule.merge_overflow` is set.
pub fn repair_csv(raw: RawResource, rule: &RepairRule) -> Result<(CleanedResource, RepairReport)> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(raw.text.as_bytes());

    let header = reader.headers()?.clone();
    if header.is_empty() || header.iter().all(|h| h.trim().is_empty()) {
        return Err(IngestError::Config(format!(
            "{} has no header row",
            raw.origin
        )));
    }
    let expected = header.len();

    let mut report = RepairReport::default();
    let mut targets = Vec::with_capacity(rule.columns.len());
    for column in &rule.columns {
        match header.iter().position(|h| h.trim() == column.as_str()) {
            Some(idx) => targets.push(idx),
            None => {
                warn!("{}: repair column '{}' not in header, ignoring", raw.origin, column);
                report.missing_columns.push(column.clone());
            }
        }
    }

    let mut writer = WriterBuilder::new().from_writer(Vec::with_capacity(raw.text.len()));
    writer.write_record(&header)?;

    let mut record = StringRecord::new();
    while reader.read_record(&mut record)? {
        report.rows_read += 1;
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let found = record.len();

        let mut fields: Vec<String> = if found == expected {
            record.iter().map(str::to_string).collect()
        } else if found > expected && rule.merge_overflow {
            report.rows_merged += 1;
            debug!("{}: merging {} fields into {} at line {}", raw.origin, found, expected, line);
            merge_overflow(&record, expected, &rule.replacement)
        } else {
            debug!(
                "{}: skipping line {}, expected {} fields, found {}",
                raw.origin, line, expected, found
            );
            report.skipped.push(SkippedRow { line, expected, found });
            continue;
        };

        for &idx in &targets {
            let value = &mut fields[idx];
            if value.contains(',') {
                *value = value.replace(',', &rule.replacement);
                report.cells_repaired += 1;
            }
        }

        writer.write_record(&fields)?;
        report.rows_written += 1;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| IngestError::Config(format!("failed to finish repaired CSV: {}", e.error())))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| IngestError::Config(format!("repaired text is not UTF-8: {}", e)))?;

    let cleaned = CleanedResource {
        origin: raw.origin,
        header: header.iter().map(str::to_string).collect(),
        text,
        row_count: report.rows_written,
    };
    Ok((cleaned, report))
}

fn merge_overflow(record: &StringRecord, expected: usize, joiner: &str) -> Vec<String> {
    let keep = expected.saturating_sub(1);
    let mut fields: Vec<String> = record.iter().take(keep).map(str::to_string).collect();
    let tail: Vec<&str> = record.iter().skip(keep).collect();
    fields.push(tail.join(joiner));
    fields
}
