//! CSV ingestion boundary: parses scraper output files and adapts the
//! historical schema drift into the canonical [`GrantDraft`] shape before
//! anything reaches the reconciler.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use gnavi_core::{GrantDraft, Level};
use thiserror::Error;

pub const CRATE_NAME: &str = "gnavi-ingest";

/// Detail-URL column aliases in fixed priority order. Older exports wrote
/// only `source_url`, some wrote `link`; the first non-empty match wins.
const URL_COLUMN_PRIORITY: [&str; 3] = ["source_url", "url", "link"];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Csv { path: String, source: csv::Error },
    #[error("{path} has no header row")]
    MissingHeader { path: String },
}

/// One parsed CSV line as a loose header-name to cell-value map.
/// Ragged rows are padded with empty strings; extra cells are dropped.
#[derive(Debug, Clone, Default)]
pub struct RawRow {
    fields: HashMap<String, String>,
}

impl RawRow {
    pub fn get(&self, column: &str) -> &str {
        self.fields.get(column).map(String::as_str).unwrap_or("")
    }

    fn insert(&mut self, column: &str, value: &str) {
        self.fields.insert(column.to_string(), value.to_string());
    }

    /// First non-empty value among the legacy detail-URL columns.
    pub fn detail_url(&self) -> &str {
        URL_COLUMN_PRIORITY
            .iter()
            .map(|column| self.get(column))
            .find(|value| !value.trim().is_empty())
            .unwrap_or("")
    }
}

/// Parses a delimited file with a header row into loose row maps,
/// preserving file order.
pub fn read_raw_rows(path: impl AsRef<Path>) -> Result<Vec<RawRow>, IngestError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(|source| IngestError::Io {
        path: path.display().to_string(),
        source,
    })?;
    raw_rows_from_reader(file, &path.display().to_string())
}

fn raw_rows_from_reader(reader: impl Read, path: &str) -> Result<Vec<RawRow>, IngestError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::None)
        .from_reader(reader);

    let headers = csv_reader
        .headers()
        .map_err(|source| IngestError::Csv {
            path: path.to_string(),
            source,
        })?
        .clone();
    if headers.is_empty() {
        return Err(IngestError::MissingHeader {
            path: path.to_string(),
        });
    }

    let mut rows = Vec::new();
    for record in csv_reader.records() {
        let record = record.map_err(|source| IngestError::Csv {
            path: path.to_string(),
            source,
        })?;
        let mut row = RawRow::default();
        for (index, column) in headers.iter().enumerate() {
            row.insert(column, record.get(index).unwrap_or(""));
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Adapts a loose row into the canonical draft shape. Missing columns
/// become empty strings; the legacy URL aliases collapse into one field.
pub fn adapt_row(row: &RawRow) -> GrantDraft {
    GrantDraft {
        grant_type: row.get("type").to_string(),
        title: row.get("title").to_string(),
        description: row.get("description").to_string(),
        organization: row.get("organization").to_string(),
        level: Level::parse_lenient(row.get("level")),
        area_prefecture: row.get("area_prefecture").to_string(),
        area_city: row.get("area_city").to_string(),
        industry: row.get("industry").to_string(),
        target_type: row.get("target_type").to_string(),
        max_amount: row.get("max_amount").to_string(),
        subsidy_rate: row.get("subsidy_rate").to_string(),
        url: row.detail_url().to_string(),
        source_url: row.get("source_url").to_string(),
    }
}

/// Reads one scraper CSV into canonical drafts, in file order.
pub fn read_grant_drafts(path: impl AsRef<Path>) -> Result<Vec<GrantDraft>, IngestError> {
    Ok(read_raw_rows(path)?.iter().map(adapt_row).collect())
}
