//! Persistence of summary records.
//!
//! A [`SummaryStore`] opens [`SummarySession`]s; [`run_in_session`] is the only way callers get at one, and
//! it guarantees the session is committed on success, rolled back on error and closed either way.

use crate::dataset::SummaryCandidate;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use futures::future::BoxFuture;
use log::{debug, warn};
use uuid::Uuid;

#[cfg(test)]
pub(crate) mod memory;
pub mod postgres;

pub const TABLE_NAME: &str = "housing_summary_statistics";

/// A persisted per-category summary.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRecord {
    pub id: Uuid,
    pub category: String,
    pub average_value: f64,
    pub record_count: usize,
    pub processed_at: DateTime<Utc>,
}

impl SummaryRecord {
    /// Assigns a fresh id; the average is rounded to the stored precision.
    pub fn new(candidate: &SummaryCandidate, processed_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: candidate.category.clone(),
            average_value: round_cents(candidate.average_value),
            record_count: candidate.count,
            processed_at,
        }
    }
}

pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// The timestamp shared by every record of one run, truncated to what the database keeps.
pub fn run_timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[async_trait]
pub trait SummarySession: Send {
    /// Creates the summary table and its category index if they don't exist. Called first in every session;
    /// the schema is committed independently of the session's own writes.
    async fn ensure_schema(&mut self) -> Result<()>;

    /// Inserts one record per candidate, all stamped with `processed_at`. Nothing is visible to other
    /// sessions until commit.
    async fn store(
        &mut self,
        candidates: &[SummaryCandidate],
        processed_at: DateTime<Utc>,
    ) -> Result<Vec<SummaryRecord>>;

    /// The most recent record of every category, ordered by category.
    async fn query_latest(&mut self) -> Result<Vec<SummaryRecord>>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}

#[async_trait]
pub trait SummaryStore: Send + Sync {
    type Session: SummarySession;

    async fn open(&self) -> Result<Self::Session>;
}

/// Opens a session, ensures the schema, and hands the session to `work`.
///
/// The session is committed if `work` succeeds and rolled back if it (or the schema step) fails. Errors from
/// opening or committing are converted into `E`.
pub async fn run_in_session<S, F, T, E>(store: &S, work: F) -> std::result::Result<T, E>
where
    S: SummaryStore,
    F: for<'s> FnOnce(&'s mut S::Session) -> BoxFuture<'s, std::result::Result<T, E>>,
    E: From<PipelineError>,
{
    let mut session = store.open().await?;
    debug!("Session opened");

    let outcome = match session.ensure_schema().await {
        Ok(()) => work(&mut session).await,
        Err(e) => Err(e.into()),
    };

    match outcome {
        Ok(value) => {
            session.commit().await?;
            debug!("Session committed");
            Ok(value)
        }
        Err(e) => {
            warn!("Rolling back session");
            if let Err(rollback_err) = session.rollback().await {
                warn!("Rollback failed: {rollback_err}");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod test {
    use super::memory::MemoryStore;
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn candidate(category: &str, average_value: f64, count: usize) -> SummaryCandidate {
        SummaryCandidate {
            category: category.to_string(),
            average_value,
            count,
        }
    }

    #[test]
    fn test_round_cents() {
        assert_eq!(1234.57, round_cents(1234.5678));
        assert_eq!(175000.0, round_cents(175000.0));
        assert_eq!(0.33, round_cents(1.0 / 3.0));
    }

    #[test]
    fn test_record_new() {
        let processed_at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();

        let first = SummaryRecord::new(&candidate("INLAND", 175000.004, 2), processed_at);
        let second = SummaryRecord::new(&candidate("INLAND", 175000.004, 2), processed_at);

        assert_ne!(first.id, second.id);
        assert_eq!(175000.0, first.average_value);
        assert_eq!(2, first.record_count);
        assert_eq!(processed_at, first.processed_at);
    }

    #[tokio::test]
    async fn test_run_in_session_commits() -> anyhow::Result<()> {
        let store = MemoryStore::default();
        let candidates = vec![candidate("NEAR BAY", 200000.0, 2), candidate("INLAND", 175000.0, 2)];
        let processed_at = run_timestamp();

        let latest = run_in_session(&store, move |session| {
            Box::pin(async move {
                session.store(&candidates, processed_at).await?;
                session.query_latest().await
            })
        })
        .await?;

        assert_eq!(2, latest.len());
        assert_eq!(2, store.committed().len());
        assert_eq!(1, store.schema_ensured());
        assert_eq!(0, store.open_sessions());

        Ok(())
    }

    #[tokio::test]
    async fn test_run_in_session_rolls_back_partial_run() {
        let store = MemoryStore::failing_on_insert(2);
        let candidates = vec![
            candidate("A", 1.0, 1),
            candidate("B", 2.0, 1),
            candidate("C", 3.0, 1),
        ];
        let processed_at = run_timestamp();

        let res: Result<Vec<SummaryRecord>> = run_in_session(&store, move |session| {
            Box::pin(async move { session.store(&candidates, processed_at).await })
        })
        .await;

        assert!(res.is_err());
        if let Err(e) = res {
            assert_eq!("StoreError", e.kind());
        }
        assert!(store.committed().is_empty());
        assert_eq!(1, store.rollbacks());
        assert_eq!(0, store.open_sessions());
    }

    #[tokio::test]
    async fn test_run_in_session_schema_failure_skips_work() {
        let store = MemoryStore::failing_on_schema();
        let worked = Arc::new(AtomicBool::new(false));

        let flag = worked.clone();
        let res: Result<()> = run_in_session(&store, move |_session| {
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
        })
        .await;

        assert!(res.is_err());
        if let Err(e) = res {
            assert_eq!("StoreError", e.kind());
        }
        assert!(!worked.load(Ordering::SeqCst));
        assert_eq!(1, store.rollbacks());
        assert_eq!(0, store.open_sessions());
        assert!(store.committed().is_empty());
    }

    #[tokio::test]
    async fn test_run_in_session_commit_failure() {
        let store = MemoryStore::failing_on_commit();
        let candidates = vec![candidate("INLAND", 175000.0, 2)];
        let processed_at = run_timestamp();

        let res: Result<Vec<SummaryRecord>> = run_in_session(&store, move |session| {
            Box::pin(async move { session.store(&candidates, processed_at).await })
        })
        .await;

        assert!(res.is_err());
        if let Err(e) = res {
            assert_eq!("StoreError", e.kind());
        }
        assert_eq!(1, store.schema_ensured());
        assert_eq!(0, store.open_sessions());
        assert!(store.committed().is_empty());
    }

    #[tokio::test]
    async fn test_query_latest_one_row_per_category() -> anyhow::Result<()> {
        let store = MemoryStore::default();
        let earlier = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();

        for (processed_at, value) in [(earlier, 100.0), (later, 300.0)] {
            let candidates = vec![candidate("INLAND", value, 1)];
            run_in_session(&store, move |session| {
                Box::pin(async move { session.store(&candidates, processed_at).await })
            })
            .await?;
        }

        let old_only = vec![candidate("ISLAND", 50.0, 3)];
        run_in_session(&store, move |session| {
            Box::pin(async move { session.store(&old_only, earlier).await })
        })
        .await?;

        let latest = run_in_session(&store, |session| {
            Box::pin(async move { session.query_latest().await })
        })
        .await?;

        assert_eq!(3, store.committed().len());
        assert_eq!(
            vec![("INLAND", later, 300.0), ("ISLAND", earlier, 50.0)],
            latest
                .iter()
                .map(|r| (r.category.as_str(), r.processed_at, r.average_value))
                .collect::<Vec<_>>()
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_store_empty_is_noop() -> anyhow::Result<()> {
        let store = MemoryStore::default();

        let stored = run_in_session(&store, |session| {
            Box::pin(async move { session.store(&[], run_timestamp()).await })
        })
        .await?;

        assert!(stored.is_empty());
        assert!(store.committed().is_empty());

        Ok(())
    }
}
