use super::{SummaryRecord, SummarySession, SummaryStore};
use crate::dataset::SummaryCandidate;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MemoryState {
    committed: Vec<SummaryRecord>,
    opened: usize,
    open_sessions: usize,
    schema_ensured: usize,
    rollbacks: usize,
}

/// In-process store with the same session semantics as the database: staged writes only become visible on
/// commit.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Faults,
}

/// Injected failures, copied into every session the store opens.
#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    insert: Option<usize>,
    schema: bool,
    commit: bool,
}

impl MemoryStore {
    /// A store whose sessions fail on the `n`th insert (1-based).
    pub(crate) fn failing_on_insert(n: usize) -> Self {
        Self::with_faults(Faults {
            insert: Some(n),
            ..Default::default()
        })
    }

    pub(crate) fn failing_on_schema() -> Self {
        Self::with_faults(Faults {
            schema: true,
            ..Default::default()
        })
    }

    /// A store whose sessions accept work but fail to commit it.
    pub(crate) fn failing_on_commit() -> Self {
        Self::with_faults(Faults {
            commit: true,
            ..Default::default()
        })
    }

    fn with_faults(faults: Faults) -> Self {
        Self {
            faults,
            ..Default::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn committed(&self) -> Vec<SummaryRecord> {
        self.state().committed.clone()
    }

    pub(crate) fn opened(&self) -> usize {
        self.state().opened
    }

    pub(crate) fn open_sessions(&self) -> usize {
        self.state().open_sessions
    }

    pub(crate) fn schema_ensured(&self) -> usize {
        self.state().schema_ensured
    }

    pub(crate) fn rollbacks(&self) -> usize {
        self.state().rollbacks
    }
}

#[derive(Debug)]
pub(crate) struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    staged: Vec<SummaryRecord>,
    faults: Faults,
    inserts: usize,
}

impl MemorySession {
    fn close(&self) {
        self.state.lock().unwrap().open_sessions -= 1;
    }
}

#[async_trait]
impl SummaryStore for MemoryStore {
    type Session = MemorySession;

    async fn open(&self) -> Result<MemorySession> {
        {
            let mut state = self.state();
            state.opened += 1;
            state.open_sessions += 1;
        }

        Ok(MemorySession {
            state: self.state.clone(),
            staged: Vec::new(),
            faults: self.faults,
            inserts: 0,
        })
    }
}

#[async_trait]
impl SummarySession for MemorySession {
    async fn ensure_schema(&mut self) -> Result<()> {
        if self.faults.schema {
            return Err(PipelineError::store("create table rejected"));
        }

        self.state.lock().unwrap().schema_ensured += 1;
        Ok(())
    }

    async fn store(
        &mut self,
        candidates: &[SummaryCandidate],
        processed_at: DateTime<Utc>,
    ) -> Result<Vec<SummaryRecord>> {
        let mut stored = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            self.inserts += 1;
            if self.faults.insert == Some(self.inserts) {
                return Err(PipelineError::store(format!(
                    "insert {} rejected",
                    self.inserts
                )));
            }

            let record = SummaryRecord::new(candidate, processed_at);
            self.staged.push(record.clone());
            stored.push(record);
        }

        Ok(stored)
    }

    async fn query_latest(&mut self) -> Result<Vec<SummaryRecord>> {
        let committed = self.state.lock().unwrap().committed.clone();

        let mut latest: BTreeMap<String, SummaryRecord> = BTreeMap::new();
        for record in committed.into_iter().chain(self.staged.iter().cloned()) {
            match latest.get(&record.category) {
                Some(current) if current.processed_at >= record.processed_at => {}
                _ => {
                    latest.insert(record.category.clone(), record);
                }
            }
        }

        Ok(latest.into_values().collect())
    }

    async fn commit(mut self) -> Result<()> {
        if self.faults.commit {
            self.close();
            return Err(PipelineError::store("commit rejected"));
        }

        let staged = std::mem::take(&mut self.staged);
        self.state.lock().unwrap().committed.extend(staged);
        self.close();
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.state.lock().unwrap().rollbacks += 1;
        self.close();
        Ok(())
    }
}
