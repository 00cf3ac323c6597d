//! SQLite implementation of every store trait.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Semaphore;

use super::{
    ContentStore, CostLogStore, ExperimentStore, JobStore, MetadataCacheStore, ProviderSpend,
    StoreError,
};
use crate::experiment::{
    Arm, ExperimentAssignment, ExperimentConfig, ExperimentResult, ModelVariant, Operation,
    VariantPair,
};
use crate::gateway::{CallStatus, CostLogEntry, ProviderKind};
use crate::job::{AnalysisJob, ContentKind, ContentPayload, JobStatus};
use crate::parser::SkillRecord;
use crate::repo_cache::{CacheEntry, CacheStats};

#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    /// Only one blocking thread waits on the connection mutex at a time.
    sem: Arc<Semaphore>,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA busy_timeout=5000;",
        )?;
        Self::create_tables(&conn)?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock the connection, recovering from poisoning (the connection is
    /// still usable after a panicked holder).
    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let _permit = self.sem.acquire().await.map_err(|_| StoreError::Closed)?;
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS contents (\
               id TEXT PRIMARY KEY,\
               kind TEXT NOT NULL,\
               body TEXT NOT NULL,\
               owner_id TEXT NOT NULL,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS analysis_jobs (\
               id TEXT PRIMARY KEY,\
               content_id TEXT NOT NULL,\
               status TEXT NOT NULL,\
               retry_count INTEGER NOT NULL DEFAULT 0,\
               result TEXT,\
               no_signal INTEGER NOT NULL DEFAULT 0,\
               created_at INTEGER NOT NULL,\
               started_at INTEGER,\
               completed_at INTEGER,\
               last_error TEXT,\
               updated_at INTEGER NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS idx_jobs_status ON analysis_jobs(status, created_at);\
             CREATE TABLE IF NOT EXISTS cost_logs (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               provider TEXT NOT NULL,\
               model TEXT NOT NULL,\
               operation TEXT NOT NULL,\
               input_tokens INTEGER NOT NULL,\
               output_tokens INTEGER NOT NULL,\
               cost_nanodollars INTEGER NOT NULL,\
               duration_ms INTEGER NOT NULL,\
               status TEXT NOT NULL,\
               error_message TEXT,\
               owner_id TEXT,\
               content_id TEXT,\
               job_id TEXT,\
               caller TEXT NOT NULL,\
               created_at INTEGER NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS idx_cost_owner ON cost_logs(owner_id, created_at);\
             CREATE INDEX IF NOT EXISTS idx_cost_job ON cost_logs(job_id);\
             CREATE TABLE IF NOT EXISTS experiments (\
               id TEXT PRIMARY KEY,\
               name TEXT NOT NULL,\
               operation TEXT NOT NULL,\
               control_variant TEXT NOT NULL,\
               treatment_variant TEXT NOT NULL,\
               traffic_split INTEGER NOT NULL,\
               is_active INTEGER NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS experiment_assignments (\
               identity_hash TEXT NOT NULL,\
               test_id TEXT NOT NULL,\
               arm TEXT NOT NULL,\
               model_variant TEXT NOT NULL,\
               assigned_at INTEGER NOT NULL,\
               PRIMARY KEY (identity_hash, test_id)\
             );\
             CREATE TABLE IF NOT EXISTS experiment_results (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               test_id TEXT NOT NULL,\
               arm TEXT NOT NULL,\
               model_variant TEXT NOT NULL,\
               identity_hash TEXT NOT NULL,\
               cost_usd REAL NOT NULL,\
               latency_ms INTEGER NOT NULL,\
               success INTEGER NOT NULL,\
               quality_score REAL,\
               created_at INTEGER NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS idx_results_test ON experiment_results(test_id);\
             CREATE TABLE IF NOT EXISTS repo_metadata_cache (\
               key TEXT PRIMARY KEY,\
               url TEXT NOT NULL,\
               owner_id TEXT NOT NULL,\
               etag TEXT NOT NULL,\
               payload TEXT NOT NULL,\
               cached_at INTEGER NOT NULL,\
               expires_at INTEGER NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS idx_repo_cache_owner ON repo_metadata_cache(owner_id);",
        )?;
        Ok(())
    }
}

// =============================================================================
// Row helpers
// =============================================================================

fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn bad_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_col<T>(
    row: &Row<'_>,
    idx: usize,
    parse: impl FnOnce(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| bad_column(idx, format!("unexpected value {raw:?}")))
}

const JOB_COLUMNS: &str = "id, content_id, status, retry_count, result, no_signal, \
                           created_at, started_at, completed_at, last_error";

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<AnalysisJob> {
    let result = match row.get::<_, Option<String>>(4)? {
        Some(json) => Some(
            serde_json::from_str::<Vec<SkillRecord>>(&json)
                .map_err(|e| bad_column(4, e.to_string()))?,
        ),
        None => None,
    };
    Ok(AnalysisJob {
        id: row.get(0)?,
        content_id: row.get(1)?,
        status: parse_col(row, 2, JobStatus::from_str)?,
        retry_count: row.get::<_, i64>(3)?.max(0) as u32,
        result,
        no_signal: row.get::<_, i64>(5)? != 0,
        created_at: from_ms(row.get(6)?),
        started_at: row.get::<_, Option<i64>>(7)?.map(from_ms),
        completed_at: row.get::<_, Option<i64>>(8)?.map(from_ms),
        last_error: row.get(9)?,
    })
}

fn result_json(job: &AnalysisJob) -> Result<Option<String>, StoreError> {
    job.result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::Sqlite(rusqlite::Error::ToSqlConversionFailure(Box::new(e))))
}

fn row_to_cost_log(row: &Row<'_>) -> rusqlite::Result<CostLogEntry> {
    Ok(CostLogEntry {
        provider: parse_col(row, 0, ProviderKind::from_str)?,
        model: row.get(1)?,
        operation: row.get(2)?,
        input_tokens: row.get::<_, i64>(3)?.max(0) as u32,
        output_tokens: row.get::<_, i64>(4)?.max(0) as u32,
        cost_nanodollars: row.get(5)?,
        duration_ms: row.get::<_, i64>(6)?.max(0) as u64,
        status: CallStatus::from_str(&row.get::<_, String>(7)?),
        error_message: row.get(8)?,
        owner_id: row.get(9)?,
        content_id: row.get(10)?,
        job_id: row.get(11)?,
        caller: row.get(12)?,
        created_at: from_ms(row.get(13)?),
    })
}

fn row_to_experiment(row: &Row<'_>) -> rusqlite::Result<ExperimentConfig> {
    Ok(ExperimentConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        operation: parse_col(row, 2, Operation::from_str)?,
        variants: VariantPair {
            control: parse_col(row, 3, ModelVariant::from_str)?,
            treatment: parse_col(row, 4, ModelVariant::from_str)?,
        },
        traffic_split: row.get::<_, i64>(5)?.clamp(0, 100) as u8,
        is_active: row.get::<_, i64>(6)? != 0,
    })
}

fn row_to_assignment(row: &Row<'_>) -> rusqlite::Result<ExperimentAssignment> {
    Ok(ExperimentAssignment {
        identity_hash: row.get(0)?,
        test_id: row.get(1)?,
        arm: parse_col(row, 2, Arm::from_str)?,
        model_variant: parse_col(row, 3, ModelVariant::from_str)?,
        assigned_at: from_ms(row.get(4)?),
    })
}

fn row_to_cache_entry(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        key: row.get(0)?,
        url: row.get(1)?,
        owner_id: row.get(2)?,
        etag: row.get(3)?,
        payload: row.get(4)?,
        cached_at: from_ms(row.get(5)?),
        expires_at: from_ms(row.get(6)?),
    })
}

// =============================================================================
// Content
// =============================================================================

#[async_trait]
impl ContentStore for SqliteStore {
    async fn insert_content(&self, content: &ContentPayload) -> Result<(), StoreError> {
        let content = content.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO contents (id, kind, body, owner_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    content.id,
                    content.kind.as_str(),
                    content.body,
                    content.owner_id,
                    to_ms(Utc::now()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_content(&self, id: &str) -> Result<Option<ContentPayload>, StoreError> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let content = conn
                .query_row(
                    "SELECT id, kind, body, owner_id FROM contents WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(ContentPayload {
                            id: row.get(0)?,
                            kind: parse_col(row, 1, ContentKind::from_str)?,
                            body: row.get(2)?,
                            owner_id: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(content)
        })
        .await
    }
}

// =============================================================================
// Jobs
// =============================================================================

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert_job(&self, job: &AnalysisJob) -> Result<(), StoreError> {
        let job = job.clone();
        self.blocking(move |conn| {
            let result = result_json(&job)?;
            conn.execute(
                "INSERT INTO analysis_jobs (id, content_id, status, retry_count, result, no_signal, \
                 created_at, started_at, completed_at, last_error, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    job.id,
                    job.content_id,
                    job.status.as_str(),
                    job.retry_count as i64,
                    result,
                    job.no_signal as i64,
                    to_ms(job.created_at),
                    job.started_at.map(to_ms),
                    job.completed_at.map(to_ms),
                    job.last_error,
                    to_ms(Utc::now()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn claim_jobs(
        &self,
        limit: usize,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<AnalysisJob>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.blocking(move |conn| {
            // Single statement: the selection and the status flip commit together.
            let sql = format!(
                "UPDATE analysis_jobs SET status = 'running', started_at = ?1, updated_at = ?1, \
                 retry_count = retry_count + (CASE WHEN status = 'running' THEN 1 ELSE 0 END), \
                 last_error = CASE WHEN status = 'running' THEN 'stalled' ELSE last_error END \
                 WHERE id IN (\
                   SELECT id FROM analysis_jobs \
                   WHERE status = 'queued' \
                      OR (status = 'running' AND (started_at IS NULL OR started_at < ?2)) \
                   ORDER BY created_at, id LIMIT ?3\
                 ) RETURNING {JOB_COLUMNS}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![to_ms(now), to_ms(stale_before), limit as i64],
                row_to_job,
            )?;
            let mut jobs = rows.collect::<Result<Vec<_>, _>>()?;
            jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            Ok(jobs)
        })
        .await
    }

    async fn get_job(&self, id: &str) -> Result<Option<AnalysisJob>, StoreError> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let job = conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = ?1"),
                    params![id],
                    row_to_job,
                )
                .optional()?;
            Ok(job)
        })
        .await
    }

    async fn save_job(
        &self,
        job: &AnalysisJob,
        claimed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let job = job.clone();
        self.blocking(move |conn| {
            let result = result_json(&job)?;
            let rows = conn.execute(
                "UPDATE analysis_jobs SET status = ?1, retry_count = ?2, result = ?3, \
                 no_signal = ?4, started_at = ?5, completed_at = ?6, last_error = ?7, \
                 updated_at = ?8 \
                 WHERE id = ?9 AND status = 'running' AND started_at = ?10",
                params![
                    job.status.as_str(),
                    job.retry_count as i64,
                    result,
                    job.no_signal as i64,
                    job.started_at.map(to_ms),
                    job.completed_at.map(to_ms),
                    job.last_error,
                    to_ms(Utc::now()),
                    job.id,
                    to_ms(claimed_at),
                ],
            )?;
            if rows == 0 {
                let exists = conn
                    .query_row(
                        "SELECT 1 FROM analysis_jobs WHERE id = ?1",
                        params![job.id],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                return Err(if exists {
                    StoreError::LostClaim(job.id)
                } else {
                    StoreError::NotFound(format!("job {}", job.id))
                });
            }
            Ok(())
        })
        .await
    }
}

// =============================================================================
// Cost logs
// =============================================================================

const COST_COLUMNS: &str = "provider, model, operation, input_tokens, output_tokens, \
                            cost_nanodollars, duration_ms, status, error_message, owner_id, \
                            content_id, job_id, caller, created_at";

#[async_trait]
impl CostLogStore for SqliteStore {
    async fn insert_cost_log(&self, entry: &CostLogEntry) -> Result<(), StoreError> {
        let e = entry.clone();
        self.blocking(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO cost_logs ({COST_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    e.provider.as_str(),
                    e.model,
                    e.operation,
                    e.input_tokens as i64,
                    e.output_tokens as i64,
                    e.cost_nanodollars,
                    e.duration_ms as i64,
                    e.status.as_str(),
                    e.error_message,
                    e.owner_id,
                    e.content_id,
                    e.job_id,
                    e.caller,
                    to_ms(e.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn owner_spend_since(
        &self,
        owner_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64, StoreError> {
        let owner_id = owner_id.to_string();
        let since_ms = since.map(to_ms).unwrap_or(i64::MIN);
        self.blocking(move |conn| {
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(cost_nanodollars), 0) FROM cost_logs \
                 WHERE owner_id = ?1 AND created_at >= ?2",
                params![owner_id, since_ms],
                |row| row.get(0),
            )?;
            Ok(total)
        })
        .await
    }

    async fn spend_by_provider(
        &self,
        owner_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProviderSpend>, StoreError> {
        let owner_id = owner_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT provider, model, COUNT(*), \
                        SUM(CASE WHEN status = 'success' THEN 0 ELSE 1 END), \
                        SUM(input_tokens), SUM(output_tokens), SUM(cost_nanodollars) \
                 FROM cost_logs WHERE owner_id = ?1 AND created_at >= ?2 \
                 GROUP BY provider, model ORDER BY SUM(cost_nanodollars) DESC, provider, model",
            )?;
            let rows = stmt.query_map(params![owner_id, to_ms(since)], |row| {
                Ok(ProviderSpend {
                    provider: parse_col(row, 0, ProviderKind::from_str)?,
                    model: row.get(1)?,
                    calls: row.get::<_, i64>(2)?.max(0) as u64,
                    failed_calls: row.get::<_, i64>(3)?.max(0) as u64,
                    input_tokens: row.get::<_, i64>(4)?.max(0) as u64,
                    output_tokens: row.get::<_, i64>(5)?.max(0) as u64,
                    cost_nanodollars: row.get(6)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn cost_logs_for_job(&self, job_id: &str) -> Result<Vec<CostLogEntry>, StoreError> {
        let job_id = job_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COST_COLUMNS} FROM cost_logs WHERE job_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![job_id], row_to_cost_log)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

// =============================================================================
// Experiments
// =============================================================================

const EXPERIMENT_COLUMNS: &str =
    "id, name, operation, control_variant, treatment_variant, traffic_split, is_active";

#[async_trait]
impl ExperimentStore for SqliteStore {
    async fn upsert_experiment(&self, config: &ExperimentConfig) -> Result<(), StoreError> {
        let cfg = config.clone();
        self.blocking(move |conn| {
            let now = to_ms(Utc::now());
            let tx = conn.unchecked_transaction()?;
            if cfg.is_active {
                tx.execute(
                    "UPDATE experiments SET is_active = 0, updated_at = ?1 \
                     WHERE operation = ?2 AND id != ?3 AND is_active = 1",
                    params![now, cfg.operation.as_str(), cfg.id],
                )?;
            }
            tx.execute(
                "INSERT INTO experiments (id, name, operation, control_variant, treatment_variant, \
                 traffic_split, is_active, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) \
                 ON CONFLICT(id) DO UPDATE SET \
                   name = excluded.name, \
                   operation = excluded.operation, \
                   control_variant = excluded.control_variant, \
                   treatment_variant = excluded.treatment_variant, \
                   traffic_split = excluded.traffic_split, \
                   is_active = excluded.is_active, \
                   updated_at = excluded.updated_at",
                params![
                    cfg.id,
                    cfg.name,
                    cfg.operation.as_str(),
                    cfg.variants.control.as_str(),
                    cfg.variants.treatment.as_str(),
                    cfg.traffic_split as i64,
                    cfg.is_active as i64,
                    now,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn set_experiment_active(&self, id: &str, active: bool) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let now = to_ms(Utc::now());
            let tx = conn.unchecked_transaction()?;
            if active {
                tx.execute(
                    "UPDATE experiments SET is_active = 0, updated_at = ?1 \
                     WHERE is_active = 1 AND id != ?2 \
                       AND operation = (SELECT operation FROM experiments WHERE id = ?2)",
                    params![now, id],
                )?;
            }
            let rows = tx.execute(
                "UPDATE experiments SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                params![active as i64, now, id],
            )?;
            tx.commit()?;
            Ok(rows > 0)
        })
        .await
    }

    async fn get_experiment(&self, id: &str) -> Result<Option<ExperimentConfig>, StoreError> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let cfg = conn
                .query_row(
                    &format!("SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE id = ?1"),
                    params![id],
                    row_to_experiment,
                )
                .optional()?;
            Ok(cfg)
        })
        .await
    }

    async fn active_experiment(
        &self,
        operation: Operation,
    ) -> Result<Option<ExperimentConfig>, StoreError> {
        self.blocking(move |conn| {
            let cfg = conn
                .query_row(
                    &format!(
                        "SELECT {EXPERIMENT_COLUMNS} FROM experiments \
                         WHERE operation = ?1 AND is_active = 1 \
                         ORDER BY updated_at DESC LIMIT 1"
                    ),
                    params![operation.as_str()],
                    row_to_experiment,
                )
                .optional()?;
            Ok(cfg)
        })
        .await
    }

    async fn get_assignment(
        &self,
        identity_hash: &str,
        test_id: &str,
    ) -> Result<Option<ExperimentAssignment>, StoreError> {
        let identity_hash = identity_hash.to_string();
        let test_id = test_id.to_string();
        self.blocking(move |conn| {
            let assignment = conn
                .query_row(
                    "SELECT identity_hash, test_id, arm, model_variant, assigned_at \
                     FROM experiment_assignments WHERE identity_hash = ?1 AND test_id = ?2",
                    params![identity_hash, test_id],
                    row_to_assignment,
                )
                .optional()?;
            Ok(assignment)
        })
        .await
    }

    async fn insert_assignment_if_absent(
        &self,
        assignment: &ExperimentAssignment,
    ) -> Result<ExperimentAssignment, StoreError> {
        let a = assignment.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO experiment_assignments \
                 (identity_hash, test_id, arm, model_variant, assigned_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    a.identity_hash,
                    a.test_id,
                    a.arm.as_str(),
                    a.model_variant.as_str(),
                    to_ms(a.assigned_at),
                ],
            )?;
            let stored = conn.query_row(
                "SELECT identity_hash, test_id, arm, model_variant, assigned_at \
                 FROM experiment_assignments WHERE identity_hash = ?1 AND test_id = ?2",
                params![a.identity_hash, a.test_id],
                row_to_assignment,
            )?;
            Ok(stored)
        })
        .await
    }

    async fn insert_result(&self, result: &ExperimentResult) -> Result<(), StoreError> {
        let r = result.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO experiment_results (test_id, arm, model_variant, identity_hash, \
                 cost_usd, latency_ms, success, quality_score, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    r.test_id,
                    r.arm.as_str(),
                    r.model_variant.as_str(),
                    r.identity_hash,
                    r.cost_usd,
                    r.latency_ms as i64,
                    r.success as i64,
                    r.quality_score,
                    to_ms(r.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn results_for(&self, test_id: &str) -> Result<Vec<ExperimentResult>, StoreError> {
        let test_id = test_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT test_id, arm, model_variant, identity_hash, cost_usd, latency_ms, \
                        success, quality_score, created_at \
                 FROM experiment_results WHERE test_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![test_id], |row| {
                Ok(ExperimentResult {
                    test_id: row.get(0)?,
                    arm: parse_col(row, 1, Arm::from_str)?,
                    model_variant: parse_col(row, 2, ModelVariant::from_str)?,
                    identity_hash: row.get(3)?,
                    cost_usd: row.get(4)?,
                    latency_ms: row.get::<_, i64>(5)?.max(0) as u64,
                    success: row.get::<_, i64>(6)? != 0,
                    quality_score: row.get(7)?,
                    created_at: from_ms(row.get(8)?),
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

// =============================================================================
// Repository metadata cache
// =============================================================================

#[async_trait]
impl MetadataCacheStore for SqliteStore {
    async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let entry = conn
                .query_row(
                    "SELECT key, url, owner_id, etag, payload, cached_at, expires_at \
                     FROM repo_metadata_cache WHERE key = ?1",
                    params![key],
                    row_to_cache_entry,
                )
                .optional()?;
            Ok(entry)
        })
        .await
    }

    async fn put_entry(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let e = entry.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO repo_metadata_cache \
                 (key, url, owner_id, etag, payload, cached_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(key) DO UPDATE SET \
                   etag = excluded.etag, \
                   payload = excluded.payload, \
                   cached_at = excluded.cached_at, \
                   expires_at = excluded.expires_at",
                params![
                    e.key,
                    e.url,
                    e.owner_id,
                    e.etag,
                    e.payload,
                    to_ms(e.cached_at),
                    to_ms(e.expires_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_entry(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM repo_metadata_cache WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.blocking(move |conn| {
            let removed = conn.execute(
                "DELETE FROM repo_metadata_cache WHERE expires_at <= ?1",
                params![to_ms(now)],
            )?;
            Ok(removed)
        })
        .await
    }

    async fn delete_owner(&self, owner_id: &str) -> Result<usize, StoreError> {
        let owner_id = owner_id.to_string();
        self.blocking(move |conn| {
            let removed = conn.execute(
                "DELETE FROM repo_metadata_cache WHERE owner_id = ?1",
                params![owner_id],
            )?;
            Ok(removed)
        })
        .await
    }

    async fn cache_stats(&self, now: DateTime<Utc>) -> Result<CacheStats, StoreError> {
        self.blocking(move |conn| {
            let (total, expired, bytes): (i64, i64, i64) = conn.query_row(
                "SELECT COUNT(*), \
                        COALESCE(SUM(CASE WHEN expires_at <= ?1 THEN 1 ELSE 0 END), 0), \
                        COALESCE(SUM(LENGTH(payload) + LENGTH(etag) + LENGTH(url)), 0) \
                 FROM repo_metadata_cache",
                params![to_ms(now)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            Ok(CacheStats {
                total_entries: total.max(0) as u64,
                expired_entries: expired.max(0) as u64,
                approx_size_kb: (bytes.max(0) as u64).div_ceil(1024),
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn temp_store() -> SqliteStore {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("test_store.sqlite");
        // Leak the TempDir so it persists for the test
        std::mem::forget(dir);
        SqliteStore::new(path).expect("create store")
    }

    #[tokio::test]
    async fn job_roundtrip_preserves_result() {
        let store = temp_store();
        store.insert_job(&AnalysisJob::new("content-1")).await.unwrap();
        let now = Utc::now();
        let mut job = store
            .claim_jobs(1, now, now)
            .await
            .unwrap()
            .pop()
            .unwrap();
        let claimed_at = job.started_at.unwrap();
        job.complete(
            vec![SkillRecord {
                skill: "Rust".into(),
                level: 70,
                evidence: vec!["ownership".into()],
                confidence: 0.8,
            }],
            false,
            Utc::now(),
        )
        .unwrap();
        store.save_job(&job, claimed_at).await.unwrap();

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Done);
        assert_eq!(loaded.result.as_ref().unwrap()[0].skill, "Rust");
        assert!(!loaded.no_signal);
    }

    #[tokio::test]
    async fn save_unknown_job_is_not_found() {
        let store = temp_store();
        let err = store
            .save_job(&AnalysisJob::new("c"), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn late_save_from_superseded_claim_is_rejected() {
        let store = temp_store();
        let job = AnalysisJob::new("c");
        store.insert_job(&job).await.unwrap();

        let first_at = Utc::now() - Duration::minutes(10);
        let mut stale = store
            .claim_jobs(1, first_at, first_at)
            .await
            .unwrap()
            .pop()
            .unwrap();

        let now = Utc::now();
        let mut fresh = store
            .claim_jobs(1, now - Duration::minutes(5), now)
            .await
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(fresh.id, job.id);
        assert_eq!(fresh.retry_count, 1);
        assert_eq!(fresh.last_error.as_deref(), Some("stalled"));

        let fresh_at = fresh.started_at.unwrap();
        fresh.complete(Vec::new(), false, now).unwrap();
        store.save_job(&fresh, fresh_at).await.unwrap();

        let stale_at = stale.started_at.unwrap();
        stale.record_failure("timeout", 3, now).unwrap();
        let err = store.save_job(&stale, stale_at).await.unwrap_err();
        assert_eq!(err.code(), "lost_claim");

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn claim_takes_queued_and_stale_running_only() {
        let store = temp_store();
        let now = Utc::now();

        let queued = AnalysisJob::new("a");
        store.insert_job(&queued).await.unwrap();

        let mut fresh = AnalysisJob::new("b");
        fresh.start(now).unwrap();
        store.insert_job(&fresh).await.unwrap();

        let mut stale = AnalysisJob::new("c");
        stale.start(now - Duration::minutes(30)).unwrap();
        store.insert_job(&stale).await.unwrap();

        let mut done = AnalysisJob::new("d");
        done.start(now).unwrap();
        done.complete(Vec::new(), false, now).unwrap();
        store.insert_job(&done).await.unwrap();

        let claimed = store
            .claim_jobs(10, now - Duration::minutes(5), now)
            .await
            .unwrap();
        let ids: Vec<&str> = claimed.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(claimed.len(), 2);
        assert!(ids.contains(&queued.id.as_str()));
        assert!(ids.contains(&stale.id.as_str()));
        assert!(claimed.iter().all(|j| j.status == JobStatus::Running));

        let again = store
            .claim_jobs(10, now - Duration::minutes(5), now)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn claim_respects_limit() {
        let store = temp_store();
        for i in 0..4 {
            store
                .insert_job(&AnalysisJob::new(format!("c{i}")))
                .await
                .unwrap();
        }
        let now = Utc::now();
        let first = store.claim_jobs(3, now, now).await.unwrap();
        let second = store.claim_jobs(3, now - Duration::hours(1), now).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn owner_spend_sums_window() {
        let store = temp_store();
        let now = Utc::now();
        for (cost, at) in [(100, now), (50, now - Duration::days(2))] {
            let entry = CostLogEntry::new(ProviderKind::Anthropic, "m", "op", "test")
                .cost(cost)
                .owner(Some("u1".into()))
                .at(at);
            store.insert_cost_log(&entry).await.unwrap();
        }
        assert_eq!(
            store
                .owner_spend_since("u1", Some(now - Duration::days(1)))
                .await
                .unwrap(),
            100
        );
        assert_eq!(store.owner_spend_since("u1", None).await.unwrap(), 150);
        assert_eq!(store.owner_spend_since("u2", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn assignment_insert_keeps_first() {
        let store = temp_store();
        let first = ExperimentAssignment {
            identity_hash: "h".into(),
            test_id: "t".into(),
            arm: Arm::Treatment,
            model_variant: ModelVariant::ClaudeHaiku,
            assigned_at: Utc::now(),
        };
        let mut second = first.clone();
        second.arm = Arm::Control;
        second.model_variant = ModelVariant::ClaudeSonnet;

        store.insert_assignment_if_absent(&first).await.unwrap();
        let stored = store.insert_assignment_if_absent(&second).await.unwrap();
        assert_eq!(stored.arm, Arm::Treatment);
        assert_eq!(stored.model_variant, ModelVariant::ClaudeHaiku);
    }

    #[tokio::test]
    async fn activating_experiment_deactivates_siblings() {
        let store = temp_store();
        let mut a = ExperimentConfig::new(
            "a",
            "first",
            Operation::SkillExtraction,
            ModelVariant::ClaudeSonnet,
            ModelVariant::ClaudeHaiku,
            50,
        );
        store.upsert_experiment(&a).await.unwrap();
        a.id = "b".into();
        a.name = "second".into();
        store.upsert_experiment(&a).await.unwrap();

        let active = store
            .active_experiment(Operation::SkillExtraction)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, "b");
        assert!(!store.get_experiment("a").await.unwrap().unwrap().is_active);

        assert!(store.set_experiment_active("a", true).await.unwrap());
        assert!(!store.get_experiment("b").await.unwrap().unwrap().is_active);
        assert!(!store.set_experiment_active("missing", false).await.unwrap());
    }

    #[tokio::test]
    async fn cache_stats_and_expiry() {
        let store = temp_store();
        let now = Utc::now();
        for (key, expires) in [("k1", now + Duration::hours(1)), ("k2", now - Duration::seconds(1))] {
            store
                .put_entry(&CacheEntry {
                    key: key.into(),
                    url: "https://api.example/x".into(),
                    owner_id: "u".into(),
                    etag: "\"abc\"".into(),
                    payload: "{}".into(),
                    cached_at: now,
                    expires_at: expires,
                })
                .await
                .unwrap();
        }
        let stats = store.cache_stats(now).await.unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.expired_entries, 1);
        assert!(stats.approx_size_kb >= 1);

        assert_eq!(store.delete_expired(now).await.unwrap(), 1);
        assert_eq!(store.delete_owner("u").await.unwrap(), 1);
        assert!(store.get_entry("k1").await.unwrap().is_none());
    }
}
