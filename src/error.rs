use std::fmt::Display;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Every way a pipeline run can fail. The variant name is reported to callers as the error kind.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid S3 event structure: {0}")]
    InvalidTrigger(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Missing required columns: {}", .missing.join(", "))]
    Schema { missing: Vec<String> },

    #[error("Unable to resolve database credentials: {0}")]
    Credentials(String),

    #[error("Error processing data: {0:#}")]
    Data(anyhow::Error),

    #[error("Database error: {0}")]
    Store(String),
}

impl PipelineError {
    pub fn data<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::Data(err.into())
    }

    pub fn store<E: Display>(err: E) -> Self {
        Self::Store(err.to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTrigger(_) => "InvalidTriggerError",
            Self::NotFound(_) => "NotFoundError",
            Self::Schema { .. } => "SchemaError",
            Self::Credentials(_) => "CredentialsError",
            Self::Data(_) => "DataError",
            Self::Store(_) => "StoreError",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::{Context, anyhow};

    #[test]
    fn test_schema_message_names_columns() {
        let err = PipelineError::Schema {
            missing: vec!["median_house_value".to_string(), "ocean_proximity".to_string()],
        };

        assert_eq!(
            "Missing required columns: median_house_value, ocean_proximity",
            err.to_string()
        );
        assert_eq!("SchemaError", err.kind());
    }

    #[test]
    fn test_data_message_includes_cause() {
        let cause: anyhow::Result<()> = Err(anyhow!("bad row"));
        let err = PipelineError::data(cause.context("reading CSV").unwrap_err());

        assert_eq!("Error processing data: reading CSV: bad row", err.to_string());
        assert_eq!("DataError", err.kind());
    }

    #[test]
    fn test_kinds() {
        assert_eq!(
            "InvalidTriggerError",
            PipelineError::InvalidTrigger("x".into()).kind()
        );
        assert_eq!("NotFoundError", PipelineError::NotFound("x".into()).kind());
        assert_eq!(
            "CredentialsError",
            PipelineError::Credentials("x".into()).kind()
        );
        assert_eq!("StoreError", PipelineError::store("x").kind());
    }
}
