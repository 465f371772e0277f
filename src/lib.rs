//! Housing pipeline library for summarizing housing CSV uploads from S3 events.
//!
//! When a CSV lands in the data bucket, the pipeline downloads it, averages `median_house_value` per
//! `ocean_proximity` category, appends the summary to PostgreSQL, and logs the latest summary per category.

use anyhow::Result;
use log::LevelFilter;
use std::borrow::Cow;

pub mod config;
pub mod credentials;
pub mod dataset;
pub mod error;
pub mod pipeline;
pub mod report;
pub mod store;

pub use error::PipelineError;
pub use pipeline::{InvocationResult, Pipeline, RunOutcome, S3Location, Stage, s3_event};
pub use store::postgres::PgSummaryStore;

pub const APP_NAME: &str = "housing-pipeline";

/// Installs the process-wide logger.
///
/// Messages from this library and from `calling_module` are logged at `Info` (or `Debug` when `verbose`),
/// everything else at `Warn`.
///
/// # Errors
/// * Returns error if a logger has already been installed
pub fn set_up_logger<T>(calling_module: T, verbose: bool) -> Result<()>
where
    T: Into<Cow<'static, str>>,
{
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} - {} - {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                message
            ))
        })
        .level(LevelFilter::Warn)
        .level_for(module_path!(), level)
        .level_for(calling_module, level)
        .chain(std::io::stdout())
        .apply()?;

    Ok(())
}
