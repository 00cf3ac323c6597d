//! Usage tracking via the UsageSink trait.
//!
//! The gateway logs every provider attempt through a UsageSink. This decouples
//! the gateway from any specific storage backend:
//! - The worker uses `CostMeter` (writes to the cost_logs table)
//! - Tests use NoopUsageSink or a CostMeter over a temp database

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::pricing::nanos_to_usd;
use super::types::ProviderKind;

/// Status of a provider call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Error,
    Timeout,
    Unavailable,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
            CallStatus::Timeout => "timeout",
            CallStatus::Unavailable => "unavailable",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "success" => CallStatus::Success,
            "timeout" => CallStatus::Timeout,
            "unavailable" => CallStatus::Unavailable,
            _ => CallStatus::Error,
        }
    }
}

/// Cost-log row for one provider call attempt. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostLogEntry {
    /// Provider called.
    pub provider: ProviderKind,
    /// Model used.
    pub model: String,
    /// Logical operation, e.g. "skill-extraction".
    pub operation: String,
    /// Estimated input tokens.
    pub input_tokens: u32,
    /// Estimated output tokens (0 on failure).
    pub output_tokens: u32,
    /// Cost in nanodollars (1e-9 USD). Always 0 for failed attempts.
    pub cost_nanodollars: i64,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Call status.
    pub status: CallStatus,
    /// Error message if status is not success.
    pub error_message: Option<String>,
    /// Owner whose budget this call counts against.
    pub owner_id: Option<String>,
    /// Content analyzed.
    pub content_id: Option<String>,
    /// Job that triggered the call.
    pub job_id: Option<String>,
    /// Which code path made this call.
    pub caller: String,
    /// When the call was made.
    pub created_at: DateTime<Utc>,
}

impl CostLogEntry {
    /// Create a new entry with required fields, defaulting others.
    pub fn new(
        provider: ProviderKind,
        model: impl Into<String>,
        operation: impl Into<String>,
        caller: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            operation: operation.into(),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            duration_ms: 0,
            status: CallStatus::Success,
            error_message: None,
            owner_id: None,
            content_id: None,
            job_id: None,
            caller: caller.into(),
            created_at: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn cost(mut self, nanodollars: i64) -> Self {
        self.cost_nanodollars = nanodollars;
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }

    pub fn owner(mut self, owner_id: Option<String>) -> Self {
        self.owner_id = owner_id;
        self
    }

    pub fn content(mut self, content_id: Option<String>) -> Self {
        self.content_id = content_id;
        self
    }

    pub fn job(mut self, job_id: Option<String>) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Mark the attempt failed. Failed attempts never carry a cost.
    pub fn failed(mut self, status: CallStatus, message: impl Into<String>) -> Self {
        self.status = status;
        self.error_message = Some(message.into());
        self.cost_nanodollars = 0;
        self.output_tokens = 0;
        self
    }

    pub fn cost_usd(&self) -> f64 {
        nanos_to_usd(self.cost_nanodollars)
    }
}

/// Trait for recording provider call usage.
///
/// Implement this trait to customize where usage data is stored.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a provider call. This must be fire-and-forget:
    /// failures are logged but never propagated to the caller.
    async fn record(&self, entry: CostLogEntry);
}

/// No-op usage sink that discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _entry: CostLogEntry) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_entries_carry_no_cost() {
        let entry = CostLogEntry::new(ProviderKind::Anthropic, "claude-3-sonnet", "op", "test")
            .tokens(100, 50)
            .cost(1_000)
            .failed(CallStatus::Error, "HTTP 500");
        assert_eq!(entry.cost_nanodollars, 0);
        assert_eq!(entry.output_tokens, 0);
        assert_eq!(entry.input_tokens, 100);
        assert_eq!(entry.status, CallStatus::Error);
        assert_eq!(entry.cost_usd(), 0.0);
    }
}
