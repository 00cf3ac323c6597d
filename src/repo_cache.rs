//! ETag-validated cache in front of the repository metadata API.
//!
//! Each `(owner, url)` pair keeps the last body and its validator. Repeat
//! fetches send `If-None-Match`; a `304` replays the stored body verbatim.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, ETAG, IF_NONE_MATCH, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::RepoCacheSettings;
use crate::store::{MetadataCacheStore, StoreError};

const MAX_BODY_LEN: usize = 1_024 * 1_024;
const RECENT_COMMITS: usize = 20;
const USER_AGENT_VALUE: &str = concat!("skill-harness/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Digest of owner and url.
    pub key: String,
    pub url: String,
    pub owner_id: String,
    pub etag: String,
    /// Response body exactly as received.
    pub payload: String,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_entries: u64,
    pub expired_entries: u64,
    pub approx_size_kb: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("metadata API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response too large: {0} bytes")]
    TooLarge(usize),
    #[error("invalid metadata payload: {0}")]
    Malformed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(String),
}

impl CacheError {
    pub fn code(&self) -> &'static str {
        match self {
            CacheError::Http(_) => "http_error",
            CacheError::Status { .. } => "metadata_status",
            CacheError::TooLarge(_) => "response_too_large",
            CacheError::Malformed(_) => "malformed_metadata",
            CacheError::Store(e) => e.code(),
            CacheError::Config(_) => "config_error",
        }
    }
}

/// Result of a cached fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub payload: String,
    pub from_cache: bool,
    pub rate_limit_remaining: Option<u32>,
}

pub fn cache_key(owner_id: &str, url: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(owner_id.as_bytes());
    hasher.update(b"|");
    hasher.update(url.as_bytes());
    hasher.finalize().to_hex().to_string()
}

#[derive(Clone)]
pub struct RepoMetadataCache {
    client: reqwest::Client,
    store: Arc<dyn MetadataCacheStore>,
    ttl: Duration,
    base_url: String,
}

impl RepoMetadataCache {
    pub fn new(
        store: Arc<dyn MetadataCacheStore>,
        settings: &RepoCacheSettings,
    ) -> Result<Self, CacheError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        if let Some(token) = &settings.token {
            let value = HeaderValue::from_str(&format!("token {token}"))
                .map_err(|_| CacheError::Config("Invalid REPO_API_TOKEN format".into()))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| CacheError::Config(format!("Failed to create HTTP client: {e}")))?;
        let ttl = Duration::from_std(settings.ttl)
            .map_err(|e| CacheError::Config(format!("cache TTL out of range: {e}")))?;

        Ok(Self {
            client,
            store,
            ttl,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn fetch(&self, owner_id: &str, url: &str) -> Result<FetchOutcome, CacheError> {
        self.fetch_at(owner_id, url, Utc::now()).await
    }

    /// Conditional GET as of `now`.
    ///
    /// `304` with a live entry replays the cached body; `200` replaces the
    /// entry when the response carries an ETag. Any other status is an error.
    pub async fn fetch_at(
        &self,
        owner_id: &str,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<FetchOutcome, CacheError> {
        let key = cache_key(owner_id, url);
        let cached = self.live_entry(&key, now).await;

        let mut request = self.client.get(url);
        if let Some(entry) = &cached {
            request = request.header(IF_NONE_MATCH, entry.etag.as_str());
        }
        let mut response = request.send().await?;

        let status = response.status();
        let rate_limit_remaining = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u32>().ok());
        debug!(url, status = status.as_u16(), ?rate_limit_remaining, "metadata fetch");

        if status == StatusCode::NOT_MODIFIED {
            if let Some(entry) = cached {
                return Ok(FetchOutcome {
                    payload: entry.payload,
                    from_cache: true,
                    rate_limit_remaining,
                });
            }
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if bytes.len() + chunk.len() > MAX_BODY_LEN {
                return Err(CacheError::TooLarge(bytes.len() + chunk.len()));
            }
            bytes.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&bytes).into_owned();

        if !status.is_success() {
            return Err(CacheError::Status {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        if let Some(etag) = etag {
            let entry = CacheEntry {
                key,
                url: url.to_string(),
                owner_id: owner_id.to_string(),
                etag,
                payload: body.clone(),
                cached_at: now,
                expires_at: now
                    .checked_add_signed(self.ttl)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            };
            if let Err(err) = self.store.put_entry(&entry).await {
                warn!(url, error = %err, "failed to write metadata cache entry");
            }
        }

        Ok(FetchOutcome {
            payload: body,
            from_cache: false,
            rate_limit_remaining,
        })
    }

    /// Stored entry if present and unexpired. Expired entries are removed.
    async fn live_entry(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let entry = match self.store.get_entry(key).await {
            Ok(entry) => entry?,
            Err(err) => {
                warn!(error = %err, "metadata cache read failed; fetching without validator");
                return None;
            }
        };
        if entry.is_expired(now) {
            if let Err(err) = self.store.delete_entry(key).await {
                warn!(error = %err, "failed to drop expired metadata cache entry");
            }
            return None;
        }
        Some(entry)
    }

    pub async fn purge_expired(&self) -> Result<usize, CacheError> {
        Ok(self.store.delete_expired(Utc::now()).await?)
    }

    pub async fn clear_owner(&self, owner_id: &str) -> Result<usize, CacheError> {
        Ok(self.store.delete_owner(owner_id).await?)
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        Ok(self.store.cache_stats(Utc::now()).await?)
    }

    // -------------------------------------------------------------------------
    // Repository analysis
    // -------------------------------------------------------------------------

    /// Build a one-line summary of a repository's languages and recent commits.
    ///
    /// Returns `None` when `repo_url` does not name a repository.
    pub async fn repo_summary(
        &self,
        owner_id: &str,
        repo_url: &str,
    ) -> Result<Option<String>, CacheError> {
        let Some(repo) = parse_repo_url(repo_url) else {
            return Ok(None);
        };

        let languages_url = format!("{}/repos/{}/{}/languages", self.base_url, repo.owner, repo.name);
        let commits_url = format!(
            "{}/repos/{}/{}/commits?per_page={RECENT_COMMITS}",
            self.base_url, repo.owner, repo.name
        );

        let languages = self.fetch(owner_id, &languages_url).await?;
        let commits = self.fetch(owner_id, &commits_url).await?;

        let languages: Value = serde_json::from_str(&languages.payload)
            .map_err(|e| CacheError::Malformed(format!("languages: {e}")))?;
        let commits: Value = serde_json::from_str(&commits.payload)
            .map_err(|e| CacheError::Malformed(format!("commits: {e}")))?;

        Ok(Some(summarize(&languages, &commits)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

/// Extract `owner/name` from a GitHub-style repository URL.
pub fn parse_repo_url(url: &str) -> Option<RepoRef> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"(?i)github\.com/([^/\s]+)/([^/\s?#]+)").ok())
        .as_ref()?;
    let caps = re.captures(url.trim())?;
    let owner = caps.get(1)?.as_str().to_string();
    let name = caps.get(2)?.as_str().trim_end_matches(".git").to_string();
    if owner.is_empty() || name.is_empty() {
        return None;
    }
    Some(RepoRef { owner, name })
}

/// `Languages: a, b. Recent commits: m1; m2`, languages by byte count.
pub fn summarize(languages: &Value, commits: &Value) -> String {
    let mut langs: Vec<(&str, u64)> = languages
        .as_object()
        .map(|m| {
            m.iter()
                .map(|(k, v)| (k.as_str(), v.as_u64().unwrap_or(0)))
                .collect()
        })
        .unwrap_or_default();
    langs.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    let langs: Vec<&str> = langs.into_iter().map(|(k, _)| k).collect();

    let messages: Vec<&str> = commits
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|c| c.pointer("/commit/message").and_then(Value::as_str))
                .map(|m| m.lines().next().unwrap_or("").trim())
                .filter(|m| !m.is_empty())
                .collect()
        })
        .unwrap_or_default();

    format!(
        "Languages: {}. Recent commits: {}",
        langs.join(", "),
        messages.join("; ")
    )
}
