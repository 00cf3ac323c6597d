//! Fallback orchestration: guard, then providers in priority order, then parse.
//!
//! Provider and parse failures are absorbed here. The only error a caller
//! sees is a blocked secret; an exhausted chain resolves to an empty list
//! flagged `no_signal`.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::experiment::{ModelSelector, Operation, VariantChoice};
use crate::gateway::{
    nanos_to_usd, Attribution, CompletionProvider, CompletionRequest, ProviderGateway,
    ProviderKind, UsageSink,
};
use crate::guard::{GuardBlocked, SecretGuard};
use crate::parser::{parse_skills, SkillRecord};
use crate::prompts::{PromptTemplate, DEFAULT_PROMPT};

const CALLER: &str = "orchestrator::extract";

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error(transparent)]
    GuardBlocked(#[from] GuardBlocked),
}

impl ExtractError {
    pub fn code(&self) -> &'static str {
        match self {
            ExtractError::GuardBlocked(_) => "guard_blocked",
        }
    }
}

/// Who an extraction is for; flows into cost-log attribution.
#[derive(Debug, Clone, Default)]
pub struct ExtractionContext {
    pub content_id: Option<String>,
    pub owner_id: Option<String>,
    pub job_id: Option<String>,
}

impl ExtractionContext {
    pub fn for_content(content_id: impl Into<String>) -> Self {
        Self {
            content_id: Some(content_id.into()),
            ..Default::default()
        }
    }
}

/// One failed provider attempt.
#[derive(Debug, Clone, Serialize)]
pub struct FailedAttempt {
    pub provider: ProviderKind,
    pub model: String,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Extraction {
    pub skills: Vec<SkillRecord>,
    /// Provider whose answer was parsed; `None` when none succeeded.
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
    /// Every provider failed; the empty result carries no signal.
    pub no_signal: bool,
    pub failures: Vec<FailedAttempt>,
}

impl Extraction {
    fn empty() -> Self {
        Self {
            skills: Vec::new(),
            provider: None,
            model: None,
            no_signal: false,
            failures: Vec::new(),
        }
    }

    /// Provider calls made, successful or not.
    pub fn attempts(&self) -> usize {
        self.failures.len() + usize::from(self.provider.is_some())
    }
}

pub struct FallbackOrchestrator<U: UsageSink> {
    chain: Vec<Arc<dyn CompletionProvider>>,
    gateway: ProviderGateway<U>,
    guard: SecretGuard,
    selector: Option<ModelSelector>,
    operation: Operation,
    prompt: PromptTemplate,
}

impl<U: UsageSink> FallbackOrchestrator<U> {
    /// `chain` is tried front to back.
    pub fn new(chain: Vec<Arc<dyn CompletionProvider>>, gateway: ProviderGateway<U>) -> Self {
        Self {
            chain,
            gateway,
            guard: SecretGuard::default(),
            selector: None,
            operation: Operation::SkillExtraction,
            prompt: DEFAULT_PROMPT,
        }
    }

    pub fn with_guard(mut self, guard: SecretGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_selector(mut self, selector: ModelSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    pub fn with_prompt(mut self, prompt: PromptTemplate) -> Self {
        self.prompt = prompt;
        self
    }

    /// Extract skills from `text` for a content id, discarding attempt detail.
    pub async fn extract_skills(
        &self,
        content_id: &str,
        text: &str,
    ) -> Result<Vec<SkillRecord>, ExtractError> {
        let extraction = self
            .extract(&ExtractionContext::for_content(content_id), text)
            .await?;
        Ok(extraction.skills)
    }

    pub async fn extract(
        &self,
        ctx: &ExtractionContext,
        text: &str,
    ) -> Result<Extraction, ExtractError> {
        if text.trim().is_empty() {
            return Ok(Extraction::empty());
        }

        if let Err(blocked) = self.guard.check(text) {
            warn!(
                content_id = ctx.content_id.as_deref().unwrap_or(""),
                kinds = %blocked.kinds,
                "secret guard blocked dispatch"
            );
            return Err(blocked.into());
        }

        let choice = match (&self.selector, &ctx.owner_id) {
            (Some(selector), Some(owner)) => Some(selector.choose(self.operation, owner).await),
            _ => None,
        };

        let prompt = self.prompt.render(text);
        let attribution = Attribution {
            owner_id: ctx.owner_id.clone(),
            content_id: ctx.content_id.clone(),
            job_id: ctx.job_id.clone(),
            caller: CALLER,
        };

        let mut failures = Vec::new();
        let mut variant_call: Option<VariantCall> = None;

        for provider in &self.chain {
            let kind = provider.kind();
            let model = model_for(provider.as_ref(), choice.as_ref());
            let serves_variant = choice
                .as_ref()
                .is_some_and(|c| c.variant.provider() == kind);
            let call_started = Instant::now();
            let request = CompletionRequest::new(
                prompt.text.clone(),
                model.clone(),
                self.operation.as_str(),
                attribution.clone(),
            );

            let completion = match self.gateway.complete(provider.as_ref(), &request).await {
                Ok(completion) => completion,
                Err(err) => {
                    warn!(provider = kind.as_str(), model = %model, error = %err, "provider attempt failed");
                    if serves_variant {
                        variant_call = Some(VariantCall::new(0, call_started, false));
                    }
                    failures.push(FailedAttempt {
                        provider: kind,
                        model,
                        code: err.code(),
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            let parsed = parse_skills(&completion.text);
            if serves_variant {
                variant_call = Some(VariantCall::new(
                    completion.cost_nanodollars,
                    call_started,
                    parsed.is_ok(),
                ));
            }

            match parsed {
                Ok(skills) => {
                    debug!(provider = kind.as_str(), skills = skills.len(), "extraction parsed");
                    self.log_experiment(choice.as_ref(), variant_call).await;
                    return Ok(Extraction {
                        skills,
                        provider: Some(kind),
                        model: Some(model),
                        no_signal: false,
                        failures,
                    });
                }
                Err(err) => {
                    warn!(provider = kind.as_str(), model = %model, error = %err, "unparseable provider response");
                    failures.push(FailedAttempt {
                        provider: kind,
                        model,
                        code: err.code(),
                        message: err.to_string(),
                    });
                }
            }
        }

        info!(
            content_id = ctx.content_id.as_deref().unwrap_or(""),
            attempts = failures.len(),
            "all providers failed; returning empty result"
        );
        self.log_experiment(choice.as_ref(), variant_call).await;
        Ok(Extraction {
            skills: Vec::new(),
            provider: None,
            model: None,
            no_signal: true,
            failures,
        })
    }

    /// Record the variant's own call. Skipped when another provider answered
    /// before the variant's provider was reached.
    async fn log_experiment(&self, choice: Option<&VariantChoice>, call: Option<VariantCall>) {
        let (Some(selector), Some(choice)) = (&self.selector, choice) else {
            return;
        };
        let Some(call) = call else {
            debug!(
                variant = choice.variant.as_str(),
                "variant provider not called; result not attributed"
            );
            return;
        };
        selector
            .log_result(
                choice,
                nanos_to_usd(call.cost_nanodollars),
                call.latency_ms,
                call.success,
                None,
            )
            .await;
    }
}

/// Cost and outcome of the call made to the experiment variant's provider.
#[derive(Debug, Clone, Copy)]
struct VariantCall {
    cost_nanodollars: i64,
    latency_ms: u64,
    success: bool,
}

impl VariantCall {
    fn new(cost_nanodollars: i64, started: Instant, success: bool) -> Self {
        Self {
            cost_nanodollars,
            latency_ms: started.elapsed().as_millis() as u64,
            success,
        }
    }
}

/// A variant only overrides the model of its own provider.
fn model_for(provider: &dyn CompletionProvider, choice: Option<&VariantChoice>) -> String {
    match choice {
        Some(choice) if choice.variant.provider() == provider.kind() => {
            choice.variant.model().to_string()
        }
        _ => provider.default_model().to_string(),
    }
}
