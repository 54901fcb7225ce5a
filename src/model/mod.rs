//! Core data model: jobs, batches, page tasks and their lifecycle states.

pub mod job;
pub mod status;

pub use job::{
    BatchRecord, FinalResult, JobRecord, JobSpec, JobSubmission, PageEntry, PageInput,
    PageOutcome, PageRecord, ResultMetadata, Summary,
};
pub use status::{AtomicStatus, BatchStatus, FailurePolicy, JobStatus, PageStatus, StatusCode};
