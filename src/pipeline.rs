//! One summarization run per S3 trigger: fetch the uploaded CSV, summarize it, store the summary and read
//! back the latest summary per category.
//!
//! Every failure is caught here and turned into a 500 [`InvocationResult`]; callers never see a partial
//! success.

use crate::dataset;
use crate::error::{PipelineError, Result};
use crate::report::format_summary;
use crate::store::{SummaryRecord, SummarySession, SummaryStore, run_in_session, run_timestamp};
use anyhow::anyhow;
use aws_lambda_events::s3::{S3Bucket, S3Entity, S3Event, S3EventRecord, S3Object};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::operation::get_object::GetObjectError;
use log::{debug, error, info, warn};
use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const SUCCESS_MESSAGE: &str = "Successfully processed housing data";
pub const FAILURE_MESSAGE: &str = "Error processing housing data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Fetching,
    Validating,
    Aggregating,
    Persisting,
    Verifying,
    Reporting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Validating => "validating",
            Self::Aggregating => "aggregating",
            Self::Persisting => "persisting",
            Self::Verifying => "verifying",
            Self::Reporting => "reporting",
        };
        f.write_str(name)
    }
}

/// A failed run: the error and the stage it happened in.
#[derive(Debug)]
pub struct RunFailure {
    pub stage: Stage,
    pub error: PipelineError,
}

/// Errors raised by the store session itself (open, schema, commit) belong to persisting.
impl From<PipelineError> for RunFailure {
    fn from(error: PipelineError) -> Self {
        Self {
            stage: Stage::Persisting,
            error,
        }
    }
}

fn enter(stage: Stage) {
    debug!("Stage: {stage}");
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, RunFailure>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, RunFailure> {
        self.map_err(|error| RunFailure { stage, error })
    }
}

/// The bucket and decoded key of the object that triggered a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    pub key: String,
    pub file_name: String,
}

impl S3Location {
    pub fn from_payload(payload: Value) -> Result<Self> {
        let event: S3Event = serde_json::from_value(payload)
            .map_err(|e| PipelineError::InvalidTrigger(e.to_string()))?;

        Self::from_event(&event)
    }

    /// Takes the first record of `event`; any further records are ignored.
    pub fn from_event(event: &S3Event) -> Result<Self> {
        debug!("Event: {event:?}");

        let record = event
            .records
            .first()
            .ok_or_else(|| PipelineError::InvalidTrigger("No records in event".to_string()))?;

        let bucket = record
            .s3
            .bucket
            .name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| PipelineError::InvalidTrigger("Bucket name not found".to_string()))?;

        let key = record
            .s3
            .object
            .key
            .as_deref()
            .ok_or_else(|| PipelineError::InvalidTrigger("Object key not found".to_string()))?;
        let key = decode_key(key)?;

        let file_name = Path::new(&key)
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|_| !key.ends_with('/'))
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::InvalidTrigger(format!("Object key has no file name: '{key}'"))
            })?;

        Ok(Self {
            bucket: bucket.to_string(),
            key,
            file_name,
        })
    }
}

/// Decodes an S3 event object key, where `+` stands for a space and everything else is percent-encoded.
pub fn decode_key(raw: &str) -> Result<String> {
    percent_decode_str(&raw.replace('+', " "))
        .decode_utf8()
        .map(|key| key.into_owned())
        .map_err(|e| PipelineError::InvalidTrigger(format!("Object key is not UTF-8: {e}")))
}

/// Builds the event S3 would send for an upload of `bucket`/`key`.
pub fn s3_event(region: Option<&str>, bucket: &str, key: &str) -> S3Event {
    S3Event {
        records: vec![S3EventRecord {
            aws_region: region.map(str::to_string),
            s3: S3Entity {
                bucket: S3Bucket {
                    name: Some(bucket.to_string()),
                    ..Default::default()
                },
                object: S3Object {
                    key: Some(utf8_percent_encode(key, NON_ALPHANUMERIC).to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// A downloaded object, deleted when dropped unless [`TransientFile::remove`] already did.
#[derive(Debug)]
struct TransientFile {
    path: PathBuf,
    removed: bool,
}

impl TransientFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            removed: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn remove(mut self) {
        self.removed = true;
        match fs::remove_file(&self.path) {
            Ok(()) => info!("Removed temporary file {}", self.path.display()),
            Err(e) => warn!("Unable to remove {}: {e}", self.path.display()),
        }
    }
}

impl Drop for TransientFile {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(e) = fs::remove_file(&self.path) {
                debug!("Unable to remove {}: {e}", self.path.display());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub categories_processed: usize,
    /// Latest record per category as read back after the write; empty when nothing was written.
    pub latest: Vec<SummaryRecord>,
}

/// What the Lambda returns for every invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResult {
    pub status_code: u16,
    pub body: String,
}

impl InvocationResult {
    pub fn success(categories_processed: usize) -> Self {
        Self {
            status_code: 200,
            body: json!({
                "message": SUCCESS_MESSAGE,
                "categories_processed": categories_processed,
            })
            .to_string(),
        }
    }

    pub fn failure(failure: &RunFailure) -> Self {
        Self {
            status_code: 500,
            body: json!({
                "message": FAILURE_MESSAGE,
                "error": failure.error.to_string(),
                "kind": failure.error.kind(),
                "stage": failure.stage.to_string(),
            })
            .to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }
}

pub struct Pipeline<S> {
    s3_client: aws_sdk_s3::Client,
    store: S,
    transient_dir: PathBuf,
}

impl<S: SummaryStore> Pipeline<S> {
    pub fn new(s3_client: aws_sdk_s3::Client, store: S, transient_dir: PathBuf) -> Self {
        Self {
            s3_client,
            store,
            transient_dir,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs the pipeline for one trigger payload and reports the outcome.
    pub async fn handle(&self, payload: Value) -> InvocationResult {
        info!("Processing new housing data file");

        match self.run(payload).await {
            Ok(outcome) => {
                info!(
                    "Run complete: {} categories processed",
                    outcome.categories_processed
                );
                InvocationResult::success(outcome.categories_processed)
            }
            Err(failure) => {
                error!(
                    "{FAILURE_MESSAGE} while {}: [{}] {}",
                    failure.stage,
                    failure.error.kind(),
                    failure.error
                );
                InvocationResult::failure(&failure)
            }
        }
    }

    pub async fn run(&self, payload: Value) -> std::result::Result<RunOutcome, RunFailure> {
        let location = S3Location::from_payload(payload).at(Stage::Idle)?;
        info!(
            "Processing file {} from bucket {}",
            location.key, location.bucket
        );

        enter(Stage::Fetching);
        let file = self.fetch(&location).await.at(Stage::Fetching)?;
        let outcome = self.process(file.path()).await?;
        file.remove();

        Ok(outcome)
    }

    async fn fetch(&self, location: &S3Location) -> Result<TransientFile> {
        let S3Location { bucket, key, .. } = location;
        debug!("Get Object: {bucket}:{key}");

        let output = self
            .s3_client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let missing = matches!(e.as_service_error(), Some(GetObjectError::NoSuchKey(_)))
                    || e.raw_response().is_some_and(|r| r.status().as_u16() == 404);

                if missing {
                    PipelineError::NotFound(format!("s3://{bucket}/{key}"))
                } else {
                    PipelineError::data(anyhow!(
                        "Unable to fetch s3://{bucket}/{key}: {}",
                        DisplayErrorContext(&e)
                    ))
                }
            })?;

        let file = TransientFile::new(self.transient_dir.join(&location.file_name));

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| PipelineError::data(anyhow!("Unable to read s3://{bucket}/{key}: {e}")))?
            .into_bytes();

        tokio::fs::write(file.path(), &bytes).await.map_err(|e| {
            PipelineError::data(anyhow!(
                "Unable to write {}: {e}",
                file.path().display()
            ))
        })?;

        info!("Downloaded file to {}", file.path().display());
        Ok(file)
    }

    /// Summarizes the CSV at `path`, stores the summary, and reads back the latest record per category.
    pub async fn process(&self, path: &Path) -> std::result::Result<RunOutcome, RunFailure> {
        enter(Stage::Validating);
        let dataset = dataset::open(path).at(Stage::Validating)?;

        enter(Stage::Aggregating);
        let aggregation = dataset.aggregate().at(Stage::Aggregating)?;

        let categories_processed = aggregation.candidates.len();
        info!("Successfully processed data. Found {categories_processed} categories.");

        if aggregation.is_empty() {
            warn!("No rows left after cleaning; skipping database write");
            return Ok(RunOutcome {
                categories_processed,
                latest: Vec::new(),
            });
        }

        enter(Stage::Persisting);
        let candidates = aggregation.candidates;
        let processed_at = run_timestamp();

        let (stored, latest) = run_in_session(&self.store, move |session| {
            Box::pin(async move {
                let stored = session
                    .store(&candidates, processed_at)
                    .await
                    .at(Stage::Persisting)?;
                info!("Successfully stored summary statistics in the database");

                enter(Stage::Verifying);
                info!("Querying database to validate insertion");
                let latest = session.query_latest().await.at(Stage::Verifying)?;

                Ok::<_, RunFailure>((stored, latest))
            })
        })
        .await?;

        verify(&stored, &latest);

        enter(Stage::Reporting);
        info!("Housing data summary:\n{}", format_summary(&latest));

        Ok(RunOutcome {
            categories_processed,
            latest,
        })
    }
}

/// Logs how many of this run's records came back as their category's latest.
fn verify(stored: &[SummaryRecord], latest: &[SummaryRecord]) {
    info!(
        "Successfully retrieved {} records from database",
        latest.len()
    );

    let confirmed = stored
        .iter()
        .filter(|record| latest.iter().any(|l| l.id == record.id))
        .count();

    if confirmed == stored.len() {
        debug!("All {confirmed} stored records are the latest for their category");
    } else {
        warn!(
            "Only {confirmed} of {} stored records are the latest for their category",
            stored.len()
        );
    }
}
