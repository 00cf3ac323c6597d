//! Polling job processor.
//!
//! Each cycle atomically claims up to `batch_size` jobs (queued, or running
//! but stale) and drives them one at a time through extraction. Jobs inside
//! a cycle never run concurrently.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::gateway::UsageSink;
use crate::job::{AnalysisJob, ContentKind, ContentPayload, FailureOutcome, TransitionError};
use crate::orchestrator::{ExtractError, ExtractionContext, FallbackOrchestrator};
use crate::repo_cache::RepoMetadataCache;
use crate::store::{ContentStore, JobStore, StoreError};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Attempts before a job is marked `failed`.
    pub max_retries: u32,
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// A `running` job older than this is presumed abandoned and reclaimed.
    pub stuck_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            poll_interval: Duration::from_millis(5_000),
            batch_size: 5,
            stuck_after: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to claim jobs: {0}")]
    Claim(#[source] StoreError),
    #[error("failed to persist job {job_id}: {source}")]
    Persistence {
        job_id: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("invalid worker setting: {0}")]
    Config(String),
}

impl WorkerError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkerError::Claim(_) => "claim_failed",
            WorkerError::Persistence { .. } => "job_persistence_failure",
            WorkerError::Transition(_) => "illegal_transition",
            WorkerError::Config(_) => "config_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Requeued,
    Failed,
    /// Another worker reclaimed the job first; this attempt was discarded.
    Superseded,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub claimed: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
    pub superseded: usize,
    /// Jobs left `running` because their final write failed.
    pub unsaved: usize,
}

/// Create a `queued` job for already-stored content.
pub async fn enqueue(jobs: &dyn JobStore, content_id: &str) -> Result<AnalysisJob, StoreError> {
    let job = AnalysisJob::new(content_id);
    jobs.insert_job(&job).await?;
    info!(job_id = %job.id, content_id, "job enqueued");
    Ok(job)
}

/// Store content and queue it for analysis.
pub async fn submit(
    contents: &dyn ContentStore,
    jobs: &dyn JobStore,
    content: &ContentPayload,
) -> Result<AnalysisJob, StoreError> {
    contents.insert_content(content).await?;
    enqueue(jobs, &content.id).await
}

/// What one processing attempt produced, before it is written back.
enum Attempt {
    Done {
        skills: Vec<crate::parser::SkillRecord>,
        no_signal: bool,
    },
    Retryable(String),
    Terminal(String),
}

pub struct JobProcessor<U: UsageSink> {
    jobs: Arc<dyn JobStore>,
    contents: Arc<dyn ContentStore>,
    orchestrator: Arc<FallbackOrchestrator<U>>,
    repo_cache: RepoMetadataCache,
    config: WorkerConfig,
}

impl<U: UsageSink> JobProcessor<U> {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        contents: Arc<dyn ContentStore>,
        orchestrator: Arc<FallbackOrchestrator<U>>,
        repo_cache: RepoMetadataCache,
        config: WorkerConfig,
    ) -> Result<Self, WorkerError> {
        if config.batch_size == 0 {
            return Err(WorkerError::Config("batch_size must be positive".into()));
        }
        if config.max_retries == 0 {
            return Err(WorkerError::Config("max_retries must be positive".into()));
        }
        Ok(Self {
            jobs,
            contents,
            orchestrator,
            repo_cache,
            config,
        })
    }

    /// Claim and process one batch.
    pub async fn run_cycle(&self) -> Result<CycleReport, WorkerError> {
        let now = Utc::now();
        let stuck_after = chrono::Duration::from_std(self.config.stuck_after)
            .map_err(|e| WorkerError::Config(format!("stuck_after out of range: {e}")))?;
        let claimed = self
            .jobs
            .claim_jobs(self.config.batch_size, now - stuck_after, now)
            .await
            .map_err(WorkerError::Claim)?;

        let mut report = CycleReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        for job in claimed {
            let job_id = job.id.clone();
            match self.process_job(job).await {
                Ok(JobOutcome::Completed) => report.completed += 1,
                Ok(JobOutcome::Requeued) => report.requeued += 1,
                Ok(JobOutcome::Failed) => report.failed += 1,
                Ok(JobOutcome::Superseded) => report.superseded += 1,
                Err(err) => {
                    error!(job_id = %job_id, code = err.code(), error = %err, "job left for a later poll");
                    report.unsaved += 1;
                }
            }
        }
        Ok(report)
    }

    /// Drive one claimed (`running`) job to its next state and persist it.
    pub async fn process_job(&self, mut job: AnalysisJob) -> Result<JobOutcome, WorkerError> {
        let Some(claimed_at) = job.started_at else {
            return Err(WorkerError::Persistence {
                source: StoreError::LostClaim(job.id.clone()),
                job_id: job.id,
            });
        };
        // Stale reclaims are counted by the store; stop once they use up the budget.
        let attempt = if job.retry_count >= self.config.max_retries {
            Attempt::Terminal("stalled_after_retries".to_string())
        } else {
            self.attempt(&job).await
        };
        let now = Utc::now();

        let outcome = match attempt {
            Attempt::Done { skills, no_signal } => {
                let count = skills.len();
                job.complete(skills, no_signal, now)?;
                info!(job_id = %job.id, skills = count, no_signal, "job done");
                JobOutcome::Completed
            }
            Attempt::Terminal(reason) => {
                job.fail_terminal(reason, now)?;
                warn!(job_id = %job.id, error = job.last_error.as_deref().unwrap_or(""), "job failed without retry");
                JobOutcome::Failed
            }
            Attempt::Retryable(reason) => {
                match job.record_failure(reason, self.config.max_retries, now)? {
                    FailureOutcome::Requeued => {
                        warn!(job_id = %job.id, retry_count = job.retry_count, "job requeued");
                        JobOutcome::Requeued
                    }
                    FailureOutcome::Failed => {
                        warn!(job_id = %job.id, retry_count = job.retry_count, "job failed after retries");
                        JobOutcome::Failed
                    }
                }
            }
        };

        match self.jobs.save_job(&job, claimed_at).await {
            Ok(()) => Ok(outcome),
            Err(StoreError::LostClaim(_)) => {
                warn!(job_id = %job.id, "claim lost to another worker, result discarded");
                Ok(JobOutcome::Superseded)
            }
            Err(source) => Err(WorkerError::Persistence {
                job_id: job.id.clone(),
                source,
            }),
        }
    }

    async fn attempt(&self, job: &AnalysisJob) -> Attempt {
        let content = match self.contents.get_content(&job.content_id).await {
            Ok(Some(content)) => content,
            Ok(None) => return Attempt::Retryable(format!("content {} not found", job.content_id)),
            Err(err) => return Attempt::Retryable(format!("{}: {err}", err.code())),
        };

        let text = match content.kind {
            ContentKind::Text | ContentKind::Code => content.body.clone(),
            ContentKind::RepoReference => {
                match self.repo_cache.repo_summary(&content.owner_id, &content.body).await {
                    Ok(Some(summary)) => summary,
                    Ok(None) => {
                        warn!(job_id = %job.id, url = %content.body, "unrecognized repository reference");
                        return Attempt::Done {
                            skills: Vec::new(),
                            no_signal: false,
                        };
                    }
                    Err(err) => return Attempt::Retryable(format!("{}: {err}", err.code())),
                }
            }
        };

        let ctx = ExtractionContext {
            content_id: Some(content.id.clone()),
            owner_id: Some(content.owner_id.clone()),
            job_id: Some(job.id.clone()),
        };
        match self.orchestrator.extract(&ctx, &text).await {
            Ok(extraction) => Attempt::Done {
                skills: extraction.skills,
                no_signal: extraction.no_signal,
            },
            Err(err @ ExtractError::GuardBlocked(_)) => Attempt::Terminal(err.code().to_string()),
        }
    }

    /// Poll until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            poll_ms = self.config.poll_interval.as_millis() as u64,
            batch = self.config.batch_size,
            max_retries = self.config.max_retries,
            "worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(report) if report.claimed > 0 => info!(?report, "cycle finished"),
                        Ok(_) => {}
                        Err(err) => error!(code = err.code(), error = %err, "cycle failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("worker stopped");
    }
}
