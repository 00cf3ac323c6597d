#![forbid(unsafe_code)]

//! # skill-harness
//!
//! Turns work samples (prose, code, repository references) into structured
//! skill assessments by asking language models, and keeps that process safe,
//! cheap and measurable.
//!
//! - A secret guard refuses to ship credentials to any provider.
//! - Providers are tried in priority order (Ollama, Anthropic, HuggingFace);
//!   an exhausted chain yields an empty result rather than an error.
//! - Every provider call, failed or not, lands in the cost log.
//! - Jobs move through a persisted `queued → running → done | failed`
//!   lifecycle driven by a polling worker with bounded retries.
//! - Model variants can be A/B tested with sticky, hash-bucketed assignment.
//! - Repository metadata lookups are cached with ETag revalidation.

pub mod config;
pub mod cost;
pub mod experiment;
pub mod gateway;
pub mod guard;
pub mod job;
pub mod orchestrator;
pub mod parser;
pub mod prompts;
pub mod repo_cache;
pub mod store;
pub mod worker;

pub use config::Config;
pub use cost::{BudgetLimits, BudgetStatus, CostMeter, Tier};
pub use experiment::{ExperimentConfig, ModelSelector, ModelVariant, Operation};
pub use gateway::{
    build_chain, Attribution, CompletionProvider, ProviderError, ProviderGateway, ProviderKind,
    UsageSink,
};
pub use guard::{scan, GuardBlocked, ScanReport, SecretGuard, Severity};
pub use job::{AnalysisJob, ContentKind, ContentPayload, JobStatus};
pub use orchestrator::{ExtractError, Extraction, ExtractionContext, FallbackOrchestrator};
pub use parser::{parse_skills, SkillRecord};
pub use repo_cache::RepoMetadataCache;
pub use store::{SqliteStore, StoreError};
pub use worker::{enqueue, submit, CycleReport, JobProcessor, WorkerConfig, WorkerError};
