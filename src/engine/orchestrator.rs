//! Orchestrator facade.
//!
//! Wires the engine components around one [`StateStore`] and one
//! [`QueueRouter`] and exposes the public surface: submit, progress,
//! result, cancel, queue statistics and eviction. It is also the
//! [`WorkHandler`] of the worker pool, dispatching each work item to the
//! component that owns its kind.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analysis::{
    AudioGenerator, LoggingSink, ResultSink, Summarizer, VisionAnalyzer,
};
use crate::error::EngineError;
use crate::metrics::MetricsCollector;
use crate::model::{FinalResult, JobStatus, JobSubmission, StatusCode};
use crate::scheduler::{
    ChannelStats, QueueRouter, WorkHandler, WorkItem, WorkPayload, WorkQueue, WorkerPool,
    WorkerPoolConfig,
};
use crate::store::{JobState, StateStore};

use super::aggregator::ResultAggregator;
use super::cancellation::CancellationCoordinator;
use super::config::EngineConfig;
use super::coordinator::BatchCoordinator;
use super::decomposer::{Decomposition, JobDecomposer};
use super::executor::{ExecutionOutcome, PageExecutor};
use super::progress::{ProgressSnapshot, ProgressTracker};

/// Entry point of the orchestration engine.
pub struct Orchestrator {
    config: EngineConfig,
    store: Arc<StateStore>,
    router: Arc<QueueRouter>,
    decomposer: JobDecomposer,
    executor: PageExecutor,
    coordinator: Arc<BatchCoordinator>,
    progress: ProgressTracker,
    aggregator: ResultAggregator,
    cancellation: CancellationCoordinator,
    summarizer: Arc<dyn Summarizer>,
    audio: Option<Arc<dyn AudioGenerator>>,
    metrics: MetricsCollector,
}

impl Orchestrator {
    /// Creates an orchestrator with a fresh state store and a logging
    /// result sink.
    pub fn new(
        config: EngineConfig,
        queue: Arc<dyn WorkQueue>,
        analyzer: Arc<dyn VisionAnalyzer>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        let store = Arc::new(StateStore::new());
        let router = Arc::new(QueueRouter::new(queue, config.channel_limits.clone()));
        let progress = ProgressTracker::new(Arc::clone(&store));
        let coordinator = Arc::new(BatchCoordinator::new(
            Arc::clone(&router),
            progress.clone(),
        ));

        Self {
            decomposer: JobDecomposer::new(config.clone()),
            executor: PageExecutor::new(
                analyzer,
                Arc::clone(&router),
                config.retry_policy(),
                config.task_timeout,
            ),
            aggregator: ResultAggregator::new(
                Arc::clone(&summarizer),
                Arc::new(LoggingSink),
                Arc::clone(&router),
                config.task_timeout,
            ),
            cancellation: CancellationCoordinator::new(
                Arc::clone(&store),
                Arc::clone(&coordinator),
            ),
            coordinator,
            progress,
            summarizer,
            audio: None,
            metrics: MetricsCollector::new(),
            config,
            store,
            router,
        }
    }

    /// Builder method to deliver job reports to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.aggregator = ResultAggregator::new(
            Arc::clone(&self.summarizer),
            sink,
            Arc::clone(&self.router),
            self.config.task_timeout,
        );
        self
    }

    /// Builder method to handle audio follow-ups with `generator`.
    pub fn with_audio(mut self, generator: Arc<dyn AudioGenerator>) -> Self {
        self.audio = Some(generator);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<QueueRouter> {
        &self.router
    }

    /// Builds a worker pool that consumes this orchestrator's channels.
    pub fn worker_pool(self: &Arc<Self>, config: WorkerPoolConfig) -> WorkerPool {
        let handler: Arc<dyn WorkHandler> = Arc::clone(self) as Arc<dyn WorkHandler>;
        WorkerPool::new(config, Arc::clone(self.router.queue()), handler)
            .with_activity(self.router.activity())
    }

    /// Registers a job and seeds its work.
    ///
    /// # Errors
    ///
    /// - `InvalidJob` for a submission without pages or fallback text
    /// - `DuplicateJob` if the job id is already registered
    /// - `Backpressure` if a seed channel is over its high-water mark; the
    ///   job is not registered and the caller should retry later
    pub async fn submit_job(&self, submission: JobSubmission) -> Result<Uuid, EngineError> {
        if let Some(job_id) = submission.job_id {
            if self.store.contains(&job_id) {
                return Err(EngineError::DuplicateJob(job_id));
            }
        }

        let Decomposition { job, seeds } = self.decomposer.decompose(submission)?;
        let job = self.store.insert(job)?;
        let job_id = job.id();

        if let Err(e) = self.router.route_all(seeds).await {
            self.store.remove(&job_id);
            return Err(e);
        }

        self.metrics.record_job_submitted();
        self.metrics.inc_jobs_in_progress();
        info!(
            job_id = %job_id,
            owner_id = %job.spec().owner_id,
            total_pages = job.spec().total_pages,
            batches = job.batches().len(),
            policy = %job.spec().policy,
            "Job submitted"
        );
        Ok(job_id)
    }

    pub fn get_job_progress(&self, job_id: &Uuid) -> Result<ProgressSnapshot, EngineError> {
        self.progress.snapshot(job_id)
    }

    /// Final result of a completed job.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown or evicted job
    /// - `NotReady` while the job is still running
    /// - `JobCancelled` / `JobFailed` for jobs that ended without a result
    pub fn get_job_result(&self, job_id: &Uuid) -> Result<FinalResult, EngineError> {
        let job = self.job(job_id)?;
        match job.status() {
            JobStatus::Completed => job.result().cloned().ok_or(EngineError::NotReady(*job_id)),
            JobStatus::Cancelled => Err(EngineError::JobCancelled(*job_id)),
            JobStatus::Failed => Err(EngineError::JobFailed {
                job_id: *job_id,
                pages_failed: job
                    .progress
                    .pages_failed
                    .load(std::sync::atomic::Ordering::Acquire),
                first_failure: job.first_failure().map(str::to_string),
            }),
            JobStatus::Queued | JobStatus::Processing => Err(EngineError::NotReady(*job_id)),
        }
    }

    /// Cancels a job and returns its previous status.
    pub async fn cancel_job(&self, job_id: &Uuid) -> Result<JobStatus, EngineError> {
        self.cancellation.cancel(job_id).await
    }

    /// Per-channel depth and worker activity.
    pub async fn get_queue_stats(&self) -> Result<Vec<ChannelStats>, EngineError> {
        self.router.stats().await
    }

    /// Drops the state of a terminal job.
    pub fn evict_job(&self, job_id: &Uuid) -> Result<(), EngineError> {
        self.store.evict_terminal(job_id)?;
        info!(job_id = %job_id, "Job evicted");
        Ok(())
    }

    /// Polls until the job is terminal and returns its final status.
    pub async fn wait_for_terminal(
        &self,
        job_id: &Uuid,
        poll_interval: Duration,
    ) -> Result<JobStatus, EngineError> {
        loop {
            let status = self.job(job_id)?.status();
            if status.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    fn job(&self, job_id: &Uuid) -> Result<Arc<JobState>, EngineError> {
        self.store.get(job_id).ok_or(EngineError::NotFound(*job_id))
    }

    async fn analyze_page(&self, job: &JobState, page_index: usize) {
        if let ExecutionOutcome::Settled(status) = self.executor.execute(job, page_index).await {
            self.coordinator.page_settled(job, page_index, status).await;
        }
    }

    async fn generate_audio(&self, job: &JobState) {
        let Some(generator) = &self.audio else {
            warn!(job_id = %job.id(), "Audio requested but no audio generator is configured");
            return;
        };
        let Some(result) = job.result() else {
            warn!(job_id = %job.id(), "Audio requested for a job without a result");
            return;
        };
        match generator.generate(result).await {
            Ok(reference) => info!(job_id = %job.id(), audio = %reference, "Audio generated"),
            Err(e) => warn!(job_id = %job.id(), error = %e, "Audio generation failed"),
        }
    }
}

#[async_trait]
impl WorkHandler for Orchestrator {
    async fn handle(&self, item: &WorkItem) -> Result<(), EngineError> {
        let job_id = item.payload.job_id();
        let Some(job) = self.store.get(&job_id) else {
            warn!(job_id = %job_id, item_id = %item.id, "Dropping work for unknown job");
            return Ok(());
        };

        match item.payload {
            WorkPayload::DispatchBatch { batch_index, .. } => {
                self.coordinator.dispatch(&job, batch_index).await
            }
            WorkPayload::AnalyzePage { page_index, .. } => {
                self.analyze_page(&job, page_index).await;
                Ok(())
            }
            WorkPayload::FinalizeJob { .. } => self.aggregator.finalize(&job).await,
            WorkPayload::GenerateAudio { .. } => {
                self.generate_audio(&job).await;
                Ok(())
            }
        }
    }
}
