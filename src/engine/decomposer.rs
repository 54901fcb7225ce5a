//! Job decomposition into ordered batches.
//!
//! A job with at most `batching_threshold` pages runs as one batch of all
//! its pages. Larger jobs are cut into contiguous ranges of `batch_size`
//! pages, the last one holding the remainder. Every batch is registered
//! up front and seeded onto the batch coordination channel at a priority
//! derived from the job's creation time, so older jobs are served first.

use std::ops::Range;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{JobSpec, JobSubmission, PageInput};
use crate::scheduler::{Priority, PriorityClass, WorkItem, WorkPayload};
use crate::store::JobState;

use super::config::EngineConfig;

/// Upper bound on the number of pages a single selection may name.
pub const MAX_SELECTED_PAGES: usize = 30;

/// Splits `0..total_pages` into contiguous, ordered ranges.
///
/// Returns an empty plan for zero pages.
pub fn plan_batches(total_pages: usize, batch_size: usize, threshold: usize) -> Vec<Range<usize>> {
    if total_pages == 0 {
        return Vec::new();
    }
    if total_pages <= threshold || batch_size == 0 {
        return vec![0..total_pages];
    }
    (0..total_pages)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(total_pages))
        .collect()
}

/// Picks the selected pages out of `pages`, keeping the selection order.
///
/// # Errors
///
/// Returns `EngineError::InvalidJob` if the selection is empty, names more
/// than `MAX_SELECTED_PAGES` pages or a page twice, or holds numbers outside
/// `1..=pages.len()`.
pub fn select_pages(
    pages: Vec<PageInput>,
    selection: &[usize],
) -> Result<Vec<PageInput>, EngineError> {
    if selection.is_empty() {
        return Err(EngineError::InvalidJob("no pages selected".to_string()));
    }
    if selection.len() > MAX_SELECTED_PAGES {
        return Err(EngineError::InvalidJob(format!(
            "at most {} pages can be selected, got {}",
            MAX_SELECTED_PAGES,
            selection.len()
        )));
    }

    let max_page = pages.len();
    let invalid: Vec<usize> = selection
        .iter()
        .copied()
        .filter(|&n| n == 0 || n > max_page)
        .collect();
    if !invalid.is_empty() {
        return Err(EngineError::InvalidJob(format!(
            "invalid page numbers {:?}, valid range 1-{}",
            invalid, max_page
        )));
    }

    let mut seen = vec![false; max_page];
    for &n in selection {
        if std::mem::replace(&mut seen[n - 1], true) {
            return Err(EngineError::InvalidJob(format!("page {} selected twice", n)));
        }
    }

    let mut slots: Vec<Option<PageInput>> = pages.into_iter().map(Some).collect();
    Ok(selection
        .iter()
        .filter_map(|&n| slots[n - 1].take())
        .collect())
}

/// A decomposed job, ready to be registered and seeded.
#[derive(Debug)]
pub struct Decomposition {
    pub job: JobState,
    /// Initial work items. All of them are new admissions and can be
    /// rejected by backpressure.
    pub seeds: Vec<WorkItem>,
}

/// Turns submissions into job state and seed work.
#[derive(Debug, Clone)]
pub struct JobDecomposer {
    config: EngineConfig,
}

impl JobDecomposer {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Validates a submission and builds its job state and seed items.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidJob` if the submission has no pages and
    /// no fallback text, overrides the batch size with zero, or carries a
    /// page selection `select_pages` rejects.
    pub fn decompose(&self, submission: JobSubmission) -> Result<Decomposition, EngineError> {
        let batch_size = submission.batch_size.unwrap_or(self.config.batch_size);
        if batch_size == 0 {
            return Err(EngineError::InvalidJob(
                "batch size must be greater than 0".to_string(),
            ));
        }

        let (inputs, fallback_text) = if submission.pages.is_empty() {
            match submission.fallback_text {
                Some(text) if !text.trim().is_empty() => {
                    (vec![PageInput::Text(text.clone())], Some(text))
                }
                _ => {
                    return Err(EngineError::InvalidJob(
                        "job has no pages and no fallback text".to_string(),
                    ))
                }
            }
        } else {
            match &submission.selected_pages {
                Some(selection) => (select_pages(submission.pages, selection)?, None),
                None => (submission.pages, None),
            }
        };

        let text_only = fallback_text.is_some();
        let ranges = if text_only {
            vec![0..1]
        } else {
            plan_batches(inputs.len(), batch_size, self.config.batching_threshold)
        };

        let spec = JobSpec {
            id: submission.job_id.unwrap_or_else(Uuid::new_v4),
            owner_id: submission.owner_id,
            doc_type: submission.doc_type,
            total_pages: inputs.len(),
            batch_size,
            policy: submission.policy.unwrap_or(self.config.default_policy),
            created_at: Utc::now(),
            selected_pages: submission.selected_pages.filter(|_| fallback_text.is_none()),
            fallback_text,
            generate_audio: submission.generate_audio,
        };
        let priority = Priority::by_age(PriorityClass::Low, spec.created_at);
        let job_id = spec.id;
        let job = JobState::new(spec, ranges, inputs);

        // Text-only jobs skip batch dispatch: their single page goes
        // straight to the page channel.
        let seeds = if text_only {
            job.activate_batch(0);
            vec![WorkItem::new(
                WorkPayload::AnalyzePage {
                    job_id,
                    page_index: 0,
                },
                priority,
            )]
        } else {
            (0..job.batches().len())
                .map(|batch_index| {
                    WorkItem::new(
                        WorkPayload::DispatchBatch {
                            job_id,
                            batch_index,
                        },
                        priority,
                    )
                })
                .collect()
        };

        debug!(
            job_id = %job_id,
            total_pages = job.spec().total_pages,
            batches = job.batches().len(),
            text_only = text_only,
            selected = job.spec().selected_pages.is_some(),
            "Job decomposed"
        );

        Ok(Decomposition { job, seeds })
    }
}
