//! Shared job/batch/page state store.
//!
//! The store is the only shared mutable resource of the engine. The map
//! lock is held only to look up, insert or evict a job; every state
//! transition after that is an atomic operation on the job's
//! [`JobState`]. Components receive an `Arc<StateStore>` handle instead
//! of reaching for a process-wide global.

pub mod state;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{BatchRecord, JobRecord, PageRecord, StatusCode};

pub use state::{BatchState, JobState, PageState, ProgressCounters};

/// In-process state store keyed by job identifier.
#[derive(Debug, Default)]
pub struct StateStore {
    jobs: RwLock<HashMap<Uuid, Arc<JobState>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job. Fails with `DuplicateJob` if the id is taken.
    pub fn insert(&self, job: JobState) -> Result<Arc<JobState>, EngineError> {
        let mut jobs = self.jobs.write().expect("job store write lock poisoned");
        let id = job.id();
        if jobs.contains_key(&id) {
            return Err(EngineError::DuplicateJob(id));
        }
        let job = Arc::new(job);
        jobs.insert(id, Arc::clone(&job));
        Ok(job)
    }

    pub fn get(&self, job_id: &Uuid) -> Option<Arc<JobState>> {
        self.jobs
            .read()
            .expect("job store read lock poisoned")
            .get(job_id)
            .cloned()
    }

    pub fn contains(&self, job_id: &Uuid) -> bool {
        self.jobs
            .read()
            .expect("job store read lock poisoned")
            .contains_key(job_id)
    }

    /// Removes a job regardless of its status.
    pub fn remove(&self, job_id: &Uuid) -> Option<Arc<JobState>> {
        self.jobs
            .write()
            .expect("job store write lock poisoned")
            .remove(job_id)
    }

    /// Removes a job only if it has reached a terminal status.
    pub fn evict_terminal(&self, job_id: &Uuid) -> Result<Arc<JobState>, EngineError> {
        let mut jobs = self.jobs.write().expect("job store write lock poisoned");
        match jobs.get(job_id) {
            None => Err(EngineError::NotFound(*job_id)),
            Some(job) if !job.status().is_terminal() => Err(EngineError::NotReady(*job_id)),
            Some(_) => jobs
                .remove(job_id)
                .ok_or(EngineError::NotFound(*job_id)),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.read().expect("job store read lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Jobs that have not reached a terminal status.
    pub fn active_jobs(&self) -> Vec<Arc<JobState>> {
        self.jobs
            .read()
            .expect("job store read lock poisoned")
            .values()
            .filter(|job| !job.status().is_terminal())
            .cloned()
            .collect()
    }

    pub fn job_record(&self, job_id: &Uuid) -> Option<JobRecord> {
        self.get(job_id).map(|job| job.to_record())
    }

    pub fn batch_record(&self, job_id: &Uuid, batch_index: usize) -> Option<BatchRecord> {
        let job = self.get(job_id)?;
        job.batch(batch_index).map(|b| b.to_record(*job_id))
    }

    pub fn page_record(&self, job_id: &Uuid, page_index: usize) -> Option<PageRecord> {
        let job = self.get(job_id)?;
        let page = job.page(page_index)?;
        let batch_id = job.batch(page.batch_index)?.id;
        Some(page.to_record(batch_id))
    }
}
