//! Error types for the provider clients.

use std::time::Duration;
use thiserror::Error;

/// Longest provider error body kept on an error value.
const MAX_BODY_PREVIEW: usize = 512;

/// Additional context from provider errors for debugging.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// HTTP status code from the provider.
    pub http_status: Option<u16>,
    /// Request ID from provider (x-request-id or request-id header).
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Errors that can occur when calling a completion provider.
///
/// Every variant is recoverable by the fallback chain: the orchestrator logs
/// the attempt and moves on to the next provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// No endpoint or API key is configured for this provider.
    #[error("{provider} unavailable: {reason}")]
    Unavailable {
        provider: &'static str,
        reason: String,
    },

    /// Provider answered with a non-success HTTP status.
    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
        context: Option<ErrorContext>,
    },

    /// Provider answered 2xx but the body carried no usable completion.
    #[error("{provider} error: {message}")]
    Malformed {
        provider: &'static str,
        message: String,
    },

    /// Call exceeded the per-provider timeout.
    #[error("{provider} timed out after {elapsed:?}")]
    Timeout {
        provider: &'static str,
        elapsed: Duration,
    },

    /// HTTP/network error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Client could not be constructed (bad header value, TLS init, ...).
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn unavailable(provider: &'static str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            provider,
            reason: reason.into(),
        }
    }

    /// Create a status error, truncating the body to a short preview.
    pub fn status(
        provider: &'static str,
        status: u16,
        body: impl AsRef<str>,
        context: Option<ErrorContext>,
    ) -> Self {
        let body: String = body.as_ref().chars().take(MAX_BODY_PREVIEW).collect();
        Self::Status {
            provider,
            status,
            body,
            context,
        }
    }

    pub fn malformed(provider: &'static str, message: impl Into<String>) -> Self {
        Self::Malformed {
            provider,
            message: message.into(),
        }
    }

    pub fn timeout(provider: &'static str, elapsed: Duration) -> Self {
        Self::Timeout { provider, elapsed }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Get a short error code for logging and cost-log rows.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "provider_unavailable",
            Self::Status { .. } => "provider_error",
            Self::Malformed { .. } => "malformed_response",
            Self::Timeout { .. } => "timeout",
            Self::Http(e) if e.is_timeout() => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    /// HTTP status of the failed call, if the provider answered at all.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether the provider was never contacted (misconfiguration).
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Get the error context if available.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Status { context, .. } => context.as_ref(),
            _ => None,
        }
    }

    /// Get the request ID if available.
    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_truncates_body() {
        let body = "x".repeat(2_000);
        let err = ProviderError::status("anthropic", 500, &body, None);
        match err {
            ProviderError::Status { body, status, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body.len(), MAX_BODY_PREVIEW);
            }
            other => panic!("expected Status, got {other:?}"),
        }
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            ProviderError::unavailable("ollama", "OLLAMA_URL not set").code(),
            "provider_unavailable"
        );
        assert_eq!(
            ProviderError::status("huggingface", 503, "", None).code(),
            "provider_error"
        );
        assert_eq!(
            ProviderError::timeout("ollama", Duration::from_secs(1)).code(),
            "timeout"
        );
    }
}
