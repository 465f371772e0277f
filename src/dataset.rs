//! Reading, validating and summarizing the housing CSV.
//!
//! A dataset must carry the [`CATEGORY_COLUMN`] and [`VALUE_COLUMN`] columns; everything else in the file
//! is ignored. Rows where either of those two cells is null are dropped, and the survivors are grouped by
//! category into one [`SummaryCandidate`] each.

use crate::error::{PipelineError, Result};
use anyhow::anyhow;
use csv::StringRecord;
use log::{debug, error, info};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

pub const CATEGORY_COLUMN: &str = "ocean_proximity";
pub const VALUE_COLUMN: &str = "median_house_value";

/// Cell contents read as a missing value, compared after trimming whitespace.
const NULL_MARKERS: [&str; 7] = ["NA", "N/A", "NaN", "nan", "null", "NULL", "None"];

/// Positions of the required columns within a header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Columns {
    pub category: usize,
    pub value: usize,
}

/// Checks that both required columns are present in `headers`.
///
/// # Errors
/// * `PipelineError::Schema` naming every required column that is absent
pub fn validate_headers(headers: &StringRecord) -> Result<Columns> {
    let position = |name: &str| headers.iter().position(|h| h.trim() == name);

    match (position(CATEGORY_COLUMN), position(VALUE_COLUMN)) {
        (Some(category), Some(value)) => Ok(Columns { category, value }),
        (category, value) => {
            let missing = [(VALUE_COLUMN, value), (CATEGORY_COLUMN, category)]
                .into_iter()
                .filter(|(_, position)| position.is_none())
                .map(|(name, _)| name.to_string())
                .collect();

            let err = PipelineError::Schema { missing };
            error!("{err}");
            Err(err)
        }
    }
}

/// The two cells of a row the pipeline cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub category: Option<String>,
    pub value: Option<f64>,
}

impl RawRecord {
    fn from_row(row: &StringRecord, columns: Columns) -> Result<Self> {
        let category = non_null(row.get(columns.category)).map(str::to_string);

        let value = match non_null(row.get(columns.value)) {
            Some(raw) => Some(raw.trim().parse::<f64>().map_err(|e| {
                let line = row.position().map_or(0, |p| p.line());
                PipelineError::data(anyhow!(
                    "Invalid {VALUE_COLUMN} '{raw}' on line {line}: {e}"
                ))
            })?),
            None => None,
        };

        Ok(Self { category, value })
    }
}

fn non_null(cell: Option<&str>) -> Option<&str> {
    cell.filter(|c| {
        let trimmed = c.trim();
        !trimmed.is_empty() && !NULL_MARKERS.contains(&trimmed)
    })
}

/// One category's mean and row count, before an id or timestamp is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryCandidate {
    pub category: String,
    pub average_value: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Aggregation {
    /// One entry per distinct category, in ascending category order.
    pub candidates: Vec<SummaryCandidate>,
    pub rows_read: usize,
    pub rows_dropped: usize,
}

impl Aggregation {
    pub fn cleaned_rows(&self) -> usize {
        self.rows_read - self.rows_dropped
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Drops rows missing a category or value, then averages the remaining values per category.
pub fn aggregate<I>(records: I) -> Aggregation
where
    I: IntoIterator<Item = RawRecord>,
{
    let mut groups: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    let mut rows_read = 0;
    let mut rows_dropped = 0;

    for record in records {
        rows_read += 1;
        match (record.category, record.value) {
            (Some(category), Some(value)) => {
                let (sum, count) = groups.entry(category).or_default();
                *sum += value;
                *count += 1;
            }
            _ => rows_dropped += 1,
        }
    }

    let candidates = groups
        .into_iter()
        .map(|(category, (sum, count))| SummaryCandidate {
            category,
            average_value: sum / count as f64,
            count,
        })
        .collect();

    Aggregation {
        candidates,
        rows_read,
        rows_dropped,
    }
}

/// A CSV source whose header has already been validated.
#[derive(Debug)]
pub struct Dataset<R> {
    reader: csv::Reader<R>,
    columns: Columns,
}

/// Opens the CSV at `path` and validates its header.
///
/// # Errors
/// * `PipelineError::NotFound` if there is no file at `path`
/// * `PipelineError::Schema` if a required column is absent
/// * `PipelineError::Data` for any other read failure
pub fn open(path: &Path) -> Result<Dataset<File>> {
    info!("Processing file: {}", path.display());

    let file = File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            error!("File not found: {}", path.display());
            PipelineError::NotFound(path.display().to_string())
        } else {
            PipelineError::data(anyhow!("Unable to open {}: {e}", path.display()))
        }
    })?;

    Dataset::from_reader(file)
}

impl<R: Read> Dataset<R> {
    pub fn from_reader(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = reader.headers().map_err(PipelineError::data)?;
        debug!("Headers: {headers:?}");

        let columns = validate_headers(headers)?;

        Ok(Self { reader, columns })
    }

    /// Reads every remaining row and summarizes it.
    pub fn aggregate(mut self) -> Result<Aggregation> {
        let columns = self.columns;
        let records = self
            .reader
            .records()
            .map(|row| {
                row.map_err(PipelineError::data)
                    .and_then(|row| RawRecord::from_row(&row, columns))
            })
            .collect::<Result<Vec<_>>>()?;

        let aggregation = aggregate(records);
        info!(
            "Removed {} rows with missing values",
            aggregation.rows_dropped
        );
        info!(
            "Calculated averages for {} categories",
            aggregation.candidates.len()
        );

        Ok(aggregation)
    }
}
