//! PostgreSQL implementation of the summary store.
//!
//! Each session is a single connection. The schema statements commit on their own as soon as they run; the
//! run's transaction begins with its first insert or query, so concurrent sessions never hold the table
//! locks taken by `CREATE INDEX` while they write.
//!
//! Connections pin `TimeZone` to UTC. Tables created with a plain `TIMESTAMP` column hold naive UTC times
//! and are read back through a `TIMESTAMPTZ` cast.

use super::{SummaryRecord, SummarySession, SummaryStore, TABLE_NAME};
use crate::credentials::CredentialSource;
use crate::dataset::SummaryCandidate;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PgSummaryStore {
    credentials: CredentialSource,
    connect_timeout: Duration,
}

impl PgSummaryStore {
    pub fn new(credentials: CredentialSource, connect_timeout: Duration) -> Self {
        Self {
            credentials,
            connect_timeout,
        }
    }
}

pub struct PgSession {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgSession {
    async fn connect(options: PgConnectOptions, connect_timeout: Duration) -> Result<Self> {
        let options = options.options([("TimeZone", "UTC")]);

        // One connection per session; the pool only exists to own it.
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| PipelineError::store(format!("Error connecting to database: {e}")))?;

        Ok(Self { pool, tx: None })
    }

    /// The run's transaction, begun on first use.
    async fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        if self.tx.is_none() {
            let tx = self
                .pool
                .begin()
                .await
                .map_err(|e| PipelineError::store(format!("Error starting transaction: {e}")))?;
            self.tx = Some(tx);
        }

        self.tx
            .as_mut()
            .ok_or_else(|| PipelineError::store("No open transaction"))
    }
}

#[async_trait]
impl SummaryStore for PgSummaryStore {
    type Session = PgSession;

    async fn open(&self) -> Result<PgSession> {
        let config = self.credentials.resolve().await?;
        info!("Connecting to database at {}:{}", config.host, config.port);

        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.dbname)
            .username(&config.user)
            .password(&config.password);

        PgSession::connect(options, self.connect_timeout).await
    }
}

fn create_table_sql() -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {TABLE_NAME} (
            id UUID PRIMARY KEY,
            category VARCHAR(50) NOT NULL,
            average_value NUMERIC(12, 2) NOT NULL,
            record_count INTEGER NOT NULL,
            processed_at TIMESTAMPTZ NOT NULL
        )
        "#
    )
}

fn create_index_sql() -> String {
    format!("CREATE INDEX IF NOT EXISTS idx_category ON {TABLE_NAME}(category)")
}

fn insert_sql() -> String {
    format!(
        r#"
        INSERT INTO {TABLE_NAME}
            (id, category, average_value, record_count, processed_at)
        VALUES ($1, $2, ROUND($3::FLOAT8::NUMERIC, 2), $4, $5)
        "#
    )
}

/// Max `processed_at` per category, joined back to the table for the full row.
fn latest_sql() -> String {
    format!(
        r#"
        WITH latest_stats AS (
            SELECT category, MAX(processed_at) AS latest_processed_at
            FROM {TABLE_NAME}
            GROUP BY category
        )
        SELECT DISTINCT ON (h.category)
            h.id,
            h.category,
            h.average_value::FLOAT8 AS average_value,
            h.record_count,
            h.processed_at::TIMESTAMPTZ AS processed_at
        FROM {TABLE_NAME} h
        JOIN latest_stats ls
            ON h.category = ls.category AND h.processed_at = ls.latest_processed_at
        ORDER BY h.category, h.id
        "#
    )
}

fn record_from_row(row: &PgRow) -> Result<SummaryRecord> {
    let record_count: i32 = row.try_get("record_count").map_err(PipelineError::store)?;

    Ok(SummaryRecord {
        id: row.try_get::<Uuid, _>("id").map_err(PipelineError::store)?,
        category: row.try_get("category").map_err(PipelineError::store)?,
        average_value: row.try_get("average_value").map_err(PipelineError::store)?,
        record_count: usize::try_from(record_count).map_err(|e| {
            PipelineError::store(format!("Invalid record_count {record_count}: {e}"))
        })?,
        processed_at: row.try_get("processed_at").map_err(PipelineError::store)?,
    })
}

#[async_trait]
impl SummarySession for PgSession {
    /// Runs outside the run's transaction, before it begins; each statement commits by itself.
    async fn ensure_schema(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(PipelineError::store(
                "Schema must be ensured before the transaction begins",
            ));
        }

        sqlx::query(&create_table_sql())
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::store(format!("Failed to create table: {e}")))?;

        sqlx::query(&create_index_sql())
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::store(format!("Failed to create index: {e}")))?;

        info!("Ensured database table exists");
        Ok(())
    }

    async fn store(
        &mut self,
        candidates: &[SummaryCandidate],
        processed_at: DateTime<Utc>,
    ) -> Result<Vec<SummaryRecord>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let tx = self.tx().await?;
        let insert = insert_sql();
        let mut stored = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let record = SummaryRecord::new(candidate, processed_at);
            let record_count = i32::try_from(record.record_count).map_err(|e| {
                PipelineError::data(anyhow::anyhow!(
                    "Record count {} for {} does not fit the table: {e}",
                    record.record_count,
                    record.category
                ))
            })?;

            sqlx::query(&insert)
                .bind(record.id)
                .bind(&record.category)
                // Unrounded; the NUMERIC column rounds it once.
                .bind(candidate.average_value)
                .bind(record_count)
                .bind(record.processed_at)
                .execute(&mut **tx)
                .await
                .map_err(|e| {
                    PipelineError::store(format!("Failed to insert {}: {e}", record.category))
                })?;

            stored.push(record);
        }

        info!("Stored {} records in the database", stored.len());
        Ok(stored)
    }

    async fn query_latest(&mut self) -> Result<Vec<SummaryRecord>> {
        let tx = self.tx().await?;
        let rows = sqlx::query(&latest_sql())
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| PipelineError::store(format!("Failed to query latest statistics: {e}")))?;

        rows.iter().map(record_from_row).collect()
    }

    async fn commit(self) -> Result<()> {
        let result = match self.tx {
            Some(tx) => tx.commit().await,
            None => Ok(()),
        };
        self.pool.close().await;
        result.map_err(|e| PipelineError::store(format!("Failed to commit: {e}")))
    }

    async fn rollback(self) -> Result<()> {
        let result = match self.tx {
            Some(tx) => tx.rollback().await,
            None => Ok(()),
        };
        self.pool.close().await;
        result.map_err(|e| PipelineError::store(format!("Failed to roll back: {e}")))
    }
}
