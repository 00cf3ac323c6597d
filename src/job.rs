//! Content payloads and the analysis-job state machine.
//!
//! Status lattice: `queued -> running -> done | failed`, with `running ->
//! queued` as the only backward edge (retry) and `running -> running` for
//! reclaiming a stale claim. `done` and `failed` are terminal.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::parser::SkillRecord;

// =============================================================================
// Content
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentKind {
    Text,
    Code,
    RepoReference,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Code => "code",
            Self::RepoReference => "repo-reference",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "code" => Some(Self::Code),
            "repo-reference" => Some(Self::RepoReference),
            _ => None,
        }
    }
}

/// Submitted content. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPayload {
    pub id: String,
    pub kind: ContentKind,
    pub body: String,
    pub owner_id: String,
}

impl ContentPayload {
    pub fn new(kind: ContentKind, body: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            body: body.into(),
            owner_id: owner_id.into(),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" | "processing" => Some(Self::Running),
            "done" | "completed" => Some(Self::Done),
            "failed" | "error" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running) | (Running, Running) | (Running, Queued) | (Running, Done) | (Running, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("illegal job transition for {job_id}: {from} -> {to}")]
pub struct TransitionError {
    pub job_id: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

// =============================================================================
// Job
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: String,
    pub content_id: String,
    pub status: JobStatus,
    pub retry_count: u32,
    pub result: Option<Vec<SkillRecord>>,
    /// Set when every provider failed and the empty result carries no signal.
    pub no_signal: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Outcome of [`AnalysisJob::record_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Requeued,
    Failed,
}

impl AnalysisJob {
    pub fn new(content_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content_id: content_id.into(),
            status: JobStatus::Queued,
            retry_count: 0,
            result: None,
            no_signal: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
        }
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                job_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Claim the job for processing.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn complete(
        &mut self,
        skills: Vec<SkillRecord>,
        no_signal: bool,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(JobStatus::Done)?;
        self.result = Some(skills);
        self.no_signal = no_signal;
        self.completed_at = Some(now);
        self.last_error = None;
        Ok(())
    }

    /// Count a failed attempt: back to `queued` while `retry_count < max_retries`
    /// after incrementing, otherwise `failed`.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, TransitionError> {
        let retry_count = self.retry_count.saturating_add(1);
        let outcome = if retry_count < max_retries {
            self.transition(JobStatus::Queued)?;
            FailureOutcome::Requeued
        } else {
            self.transition(JobStatus::Failed)?;
            self.completed_at = Some(now);
            FailureOutcome::Failed
        };
        self.retry_count = retry_count;
        self.last_error = Some(error.into());
        Ok(outcome)
    }

    /// Fail without consuming retries (e.g. a blocked secret).
    pub fn fail_terminal(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed)?;
        self.completed_at = Some(now);
        self.last_error = Some(error.into());
        Ok(())
    }
}
