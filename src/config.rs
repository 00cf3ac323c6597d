//! Environment-level configuration.
//!
//! Absent variables fall back to defaults; present-but-malformed values are
//! errors rather than silently ignored.

use std::path::PathBuf;
use std::time::Duration;

use crate::cost::BudgetLimits;
use crate::experiment::ExperimentConfig;
use crate::gateway::{anthropic, huggingface};
use crate::guard::Severity;
use crate::worker::WorkerConfig;

pub const DEFAULT_OLLAMA_MODEL: &str = "llama3";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-sonnet-20240229";
pub const DEFAULT_HF_MODEL: &str = "microsoft/DialoGPT-medium";
pub const DEFAULT_REPO_API_BASE_URL: &str = "https://api.github.com";
pub const DEFAULT_DB_PATH: &str = ".skill_harness.sqlite";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid SKILL_EXPERIMENT definition: {0}")]
    Experiment(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Invalid { .. } => "invalid_config",
            ConfigError::Experiment(_) => "invalid_experiment",
        }
    }
}

/// Endpoint, credential and model per provider.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub ollama_url: Option<String>,
    pub ollama_model: String,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: String,
    pub anthropic_model: String,
    pub hf_token: Option<String>,
    pub hf_base_url: String,
    pub hf_model: String,
    pub timeout: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            ollama_url: None,
            ollama_model: DEFAULT_OLLAMA_MODEL.to_string(),
            anthropic_api_key: None,
            anthropic_base_url: anthropic::DEFAULT_BASE_URL.to_string(),
            anthropic_model: DEFAULT_ANTHROPIC_MODEL.to_string(),
            hf_token: None,
            hf_base_url: huggingface::DEFAULT_BASE_URL.to_string(),
            hf_model: DEFAULT_HF_MODEL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepoCacheSettings {
    pub ttl: Duration,
    pub base_url: String,
    pub token: Option<String>,
}

impl Default for RepoCacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            base_url: DEFAULT_REPO_API_BASE_URL.to_string(),
            token: None,
        }
    }
}

/// Full runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub providers: ProviderSettings,
    pub budgets: BudgetLimits,
    pub worker: WorkerConfig,
    pub repo_cache: RepoCacheSettings,
    pub experiment: Option<ExperimentConfig>,
    pub db_path: PathBuf,
    pub guard_block_at: Severity,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: ProviderSettings::default(),
            budgets: BudgetLimits::default(),
            worker: WorkerConfig::default(),
            repo_cache: RepoCacheSettings::default(),
            experiment: None,
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            guard_block_at: Severity::Critical,
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Config::default();

        let providers = ProviderSettings {
            ollama_url: get("OLLAMA_URL"),
            ollama_model: get("OLLAMA_MODEL").unwrap_or(defaults.providers.ollama_model),
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            anthropic_base_url: get("ANTHROPIC_BASE_URL")
                .unwrap_or(defaults.providers.anthropic_base_url),
            anthropic_model: get("ANTHROPIC_MODEL").unwrap_or(defaults.providers.anthropic_model),
            hf_token: get("HF_TOKEN"),
            hf_base_url: get("HF_BASE_URL").unwrap_or(defaults.providers.hf_base_url),
            hf_model: get("HF_MODEL").unwrap_or(defaults.providers.hf_model),
            timeout: parse_or(&get, "PROVIDER_TIMEOUT_SECONDS", 60u64).map(Duration::from_secs)?,
        };

        let budgets = BudgetLimits {
            free_usd: parse_usd(&get, "BUDGET_FREE_USD", defaults.budgets.free_usd)?,
            pro_usd: parse_usd(&get, "BUDGET_PRO_USD", defaults.budgets.pro_usd)?,
            enterprise_usd: parse_usd(
                &get,
                "BUDGET_ENTERPRISE_USD",
                defaults.budgets.enterprise_usd,
            )?,
        };

        let worker = WorkerConfig {
            max_retries: parse_or(&get, "WORKER_MAX_RETRIES", defaults.worker.max_retries)?,
            poll_interval: parse_or(
                &get,
                "WORKER_POLL_MS",
                defaults.worker.poll_interval.as_millis() as u64,
            )
            .map(Duration::from_millis)?,
            batch_size: parse_or(&get, "WORKER_BATCH", defaults.worker.batch_size)?,
            stuck_after: parse_or(
                &get,
                "WORKER_STUCK_AFTER_SECONDS",
                defaults.worker.stuck_after.as_secs(),
            )
            .map(Duration::from_secs)?,
        };
        if worker.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "WORKER_POLL_MS",
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }

        let ttl_minutes = parse_or(&get, "REPO_CACHE_TTL_MINUTES", 60u64)?;
        let ttl_secs = ttl_minutes.checked_mul(60).ok_or_else(|| ConfigError::Invalid {
            key: "REPO_CACHE_TTL_MINUTES",
            value: ttl_minutes.to_string(),
            reason: "too large".into(),
        })?;
        let repo_cache = RepoCacheSettings {
            ttl: Duration::from_secs(ttl_secs),
            base_url: get("REPO_API_BASE_URL").unwrap_or(defaults.repo_cache.base_url),
            token: get("REPO_API_TOKEN"),
        };

        let experiment = match get("SKILL_EXPERIMENT") {
            Some(raw) => Some(serde_json::from_str::<ExperimentConfig>(&raw)?),
            None => None,
        };
        if let Some(exp) = &experiment {
            if exp.traffic_split > 100 {
                return Err(ConfigError::Invalid {
                    key: "SKILL_EXPERIMENT",
                    value: exp.traffic_split.to_string(),
                    reason: "traffic_split must be within 0..=100".into(),
                });
            }
        }

        let guard_block_at = match get("SECRET_GUARD_BLOCK_AT") {
            Some(raw) => Severity::from_str(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "SECRET_GUARD_BLOCK_AT",
                value: raw.clone(),
                reason: "expected low, medium, high or critical".into(),
            })?,
            None => defaults.guard_block_at,
        };

        Ok(Self {
            providers,
            budgets,
            worker,
            repo_cache,
            experiment,
            db_path: get("SKILL_HARNESS_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            guard_block_at,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_usd<G>(get: &G, key: &'static str, default: f64) -> Result<f64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let value: f64 = parse_or(get, key, default)?;
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "budget must be a non-negative amount".into(),
        });
    }
    Ok(value)
}
