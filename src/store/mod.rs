//! Durable storage seams.
//!
//! Components depend on these narrow traits and receive a store handle at
//! construction; [`SqliteStore`] implements all of them over one database.
//! A single SQLite file serves one host. Multi-host deployments need a
//! shared external store behind the same traits.

mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::experiment::{ExperimentAssignment, ExperimentConfig, ExperimentResult, Operation};
use crate::gateway::{CostLogEntry, ProviderKind};
use crate::job::{AnalysisJob, ContentPayload};
use crate::repo_cache::{CacheEntry, CacheStats};

pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task join error: {0}")]
    Join(String),
    #[error("store is shut down")]
    Closed,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("claim on job {0} was lost to another worker")]
    LostClaim(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Sqlite(_) => "sqlite_error",
            StoreError::Io(_) => "io_error",
            StoreError::Join(_) => "join_error",
            StoreError::Closed => "store_closed",
            StoreError::NotFound(_) => "not_found",
            StoreError::LostClaim(_) => "lost_claim",
        }
    }
}

// =============================================================================
// Traits
// =============================================================================

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn insert_content(&self, content: &ContentPayload) -> Result<(), StoreError>;
    async fn get_content(&self, id: &str) -> Result<Option<ContentPayload>, StoreError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &AnalysisJob) -> Result<(), StoreError>;

    /// Atomically move up to `limit` claimable jobs to `running`, stamping
    /// `started_at = now`, and return them oldest first.
    ///
    /// Claimable: `queued`, or `running` with `started_at < stale_before`.
    /// Reclaiming a stale job counts against its `retry_count`.
    /// Concurrent callers never receive the same job.
    async fn claim_jobs(
        &self,
        limit: usize,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<AnalysisJob>, StoreError>;

    async fn get_job(&self, id: &str) -> Result<Option<AnalysisJob>, StoreError>;

    /// Write back a job claimed at `claimed_at`.
    ///
    /// Only applies while the row is still `running` under that claim; a job
    /// reclaimed or finished by someone else yields [`StoreError::LostClaim`].
    async fn save_job(
        &self,
        job: &AnalysisJob,
        claimed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Spend for one provider/model pair over a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSpend {
    pub provider: ProviderKind,
    pub model: String,
    pub calls: u64,
    pub failed_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanodollars: i64,
}

#[async_trait]
pub trait CostLogStore: Send + Sync {
    async fn insert_cost_log(&self, entry: &CostLogEntry) -> Result<(), StoreError>;

    /// Total nanodollars charged to `owner_id` since `since`.
    async fn owner_spend_since(
        &self,
        owner_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64, StoreError>;

    async fn spend_by_provider(
        &self,
        owner_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProviderSpend>, StoreError>;

    async fn cost_logs_for_job(&self, job_id: &str) -> Result<Vec<CostLogEntry>, StoreError>;
}

#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Insert or replace an experiment. Activating it deactivates any other
    /// active experiment for the same operation.
    async fn upsert_experiment(&self, config: &ExperimentConfig) -> Result<(), StoreError>;

    /// Returns `false` when no experiment has that id.
    async fn set_experiment_active(&self, id: &str, active: bool) -> Result<bool, StoreError>;

    async fn get_experiment(&self, id: &str) -> Result<Option<ExperimentConfig>, StoreError>;

    async fn active_experiment(
        &self,
        operation: Operation,
    ) -> Result<Option<ExperimentConfig>, StoreError>;

    async fn get_assignment(
        &self,
        identity_hash: &str,
        test_id: &str,
    ) -> Result<Option<ExperimentAssignment>, StoreError>;

    /// Insert unless an assignment exists for the pair; return the stored one.
    async fn insert_assignment_if_absent(
        &self,
        assignment: &ExperimentAssignment,
    ) -> Result<ExperimentAssignment, StoreError>;

    async fn insert_result(&self, result: &ExperimentResult) -> Result<(), StoreError>;

    async fn results_for(&self, test_id: &str) -> Result<Vec<ExperimentResult>, StoreError>;
}

#[async_trait]
pub trait MetadataCacheStore: Send + Sync {
    async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;
    async fn put_entry(&self, entry: &CacheEntry) -> Result<(), StoreError>;
    async fn delete_entry(&self, key: &str) -> Result<(), StoreError>;
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
    async fn delete_owner(&self, owner_id: &str) -> Result<usize, StoreError>;
    async fn cache_stats(&self, now: DateTime<Utc>) -> Result<CacheStats, StoreError>;
}
