//! Model variant selection and A/B experiment analysis.
//!
//! Identities are bucketed by hash into control or treatment for the single
//! active experiment of an operation. The first assignment is persisted and
//! reused, so later edits to the traffic split never move existing users.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::gateway::ProviderKind;
use crate::store::{ExperimentStore, StoreError};

// =============================================================================
// Operations & variants
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    SkillExtraction,
    CodeAnalysis,
    Transcription,
    Summarization,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SkillExtraction => "skill-extraction",
            Self::CodeAnalysis => "code-analysis",
            Self::Transcription => "transcription",
            Self::Summarization => "summarization",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "skill-extraction" => Some(Self::SkillExtraction),
            "code-analysis" => Some(Self::CodeAnalysis),
            "transcription" => Some(Self::Transcription),
            "summarization" => Some(Self::Summarization),
            _ => None,
        }
    }

    /// Variant used when no experiment is active.
    pub fn default_variant(self) -> ModelVariant {
        match self {
            Self::SkillExtraction => ModelVariant::ClaudeSonnet,
            Self::CodeAnalysis => ModelVariant::ClaudeOpus,
            Self::Transcription => ModelVariant::OllamaMistral,
            Self::Summarization => ModelVariant::ClaudeHaiku,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named provider/model pairing that experiments route between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelVariant {
    #[serde(rename = "claude-opus")]
    ClaudeOpus,
    #[serde(rename = "claude-sonnet")]
    ClaudeSonnet,
    #[serde(rename = "claude-haiku")]
    ClaudeHaiku,
    #[serde(rename = "ollama-llama3")]
    OllamaLlama3,
    #[serde(rename = "ollama-mistral")]
    OllamaMistral,
    #[serde(rename = "hf-dialogpt")]
    HfDialoGpt,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 6] = [
        ModelVariant::ClaudeOpus,
        ModelVariant::ClaudeSonnet,
        ModelVariant::ClaudeHaiku,
        ModelVariant::OllamaLlama3,
        ModelVariant::OllamaMistral,
        ModelVariant::HfDialoGpt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClaudeOpus => "claude-opus",
            Self::ClaudeSonnet => "claude-sonnet",
            Self::ClaudeHaiku => "claude-haiku",
            Self::OllamaLlama3 => "ollama-llama3",
            Self::OllamaMistral => "ollama-mistral",
            Self::HfDialoGpt => "hf-dialogpt",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == s)
    }

    pub fn provider(self) -> ProviderKind {
        match self {
            Self::ClaudeOpus | Self::ClaudeSonnet | Self::ClaudeHaiku => ProviderKind::Anthropic,
            Self::OllamaLlama3 | Self::OllamaMistral => ProviderKind::Ollama,
            Self::HfDialoGpt => ProviderKind::HuggingFace,
        }
    }

    pub fn model(self) -> &'static str {
        match self {
            Self::ClaudeOpus => "claude-3-opus-20240229",
            Self::ClaudeSonnet => "claude-3-sonnet-20240229",
            Self::ClaudeHaiku => "claude-3-haiku-20240307",
            Self::OllamaLlama3 => "llama3",
            Self::OllamaMistral => "mistral",
            Self::HfDialoGpt => "microsoft/DialoGPT-medium",
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arm {
    Control,
    Treatment,
}

impl Arm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Treatment => "treatment",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "control" => Some(Self::Control),
            "treatment" => Some(Self::Treatment),
            _ => None,
        }
    }
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantPair {
    pub control: ModelVariant,
    pub treatment: ModelVariant,
}

impl VariantPair {
    pub fn for_arm(&self, arm: Arm) -> ModelVariant {
        match arm {
            Arm::Control => self.control,
            Arm::Treatment => self.treatment,
        }
    }
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub id: String,
    pub name: String,
    pub operation: Operation,
    pub variants: VariantPair,
    /// Percentage of identities routed to treatment, `0..=100`.
    pub traffic_split: u8,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl ExperimentConfig {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        operation: Operation,
        control: ModelVariant,
        treatment: ModelVariant,
        traffic_split: u8,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            operation,
            variants: VariantPair { control, treatment },
            traffic_split,
            is_active: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentAssignment {
    pub identity_hash: String,
    pub test_id: String,
    pub arm: Arm,
    pub model_variant: ModelVariant,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub test_id: String,
    pub arm: Arm,
    pub model_variant: ModelVariant,
    pub identity_hash: String,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub success: bool,
    pub quality_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("experiment not found: {0}")]
    NotFound(String),
    #[error("no results recorded for experiment {0}")]
    NoResults(String),
    #[error("traffic split must be within 0..=100, got {0}")]
    InvalidSplit(u8),
}

impl ExperimentError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.code(),
            Self::NotFound(_) => "experiment_not_found",
            Self::NoResults(_) => "no_results",
            Self::InvalidSplit(_) => "invalid_split",
        }
    }
}

// =============================================================================
// Selection
// =============================================================================

/// Identity enrolled in an active experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub test_id: String,
    pub arm: Arm,
    pub identity_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantChoice {
    pub variant: ModelVariant,
    /// `None` when the default variant was used.
    pub enrollment: Option<Enrollment>,
}

/// Stable hex digest of an identity; the raw identity is never stored.
pub fn identity_hash(identity: &str) -> String {
    blake3::hash(identity.as_bytes()).to_hex().to_string()
}

/// Bucket in `0..100`, fixed for a given identity.
pub fn bucket(identity: &str) -> u8 {
    let digest = blake3::hash(identity.as_bytes());
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest.as_bytes()[..8]);
    (u64::from_le_bytes(first) % 100) as u8
}

pub fn arm_for_bucket(bucket: u8, traffic_split: u8) -> Arm {
    if bucket < traffic_split {
        Arm::Treatment
    } else {
        Arm::Control
    }
}

#[derive(Clone)]
pub struct ModelSelector {
    store: Arc<dyn ExperimentStore>,
}

impl ModelSelector {
    pub fn new(store: Arc<dyn ExperimentStore>) -> Self {
        Self { store }
    }

    /// Pick the variant for `identity` under the active experiment, if any.
    ///
    /// Store failures fall back to the operation default so selection never
    /// blocks an extraction.
    pub async fn choose(&self, operation: Operation, identity: &str) -> VariantChoice {
        match self.try_choose(operation, identity).await {
            Ok(choice) => choice,
            Err(err) => {
                warn!(operation = operation.as_str(), error = %err, "variant selection failed; using default");
                VariantChoice {
                    variant: operation.default_variant(),
                    enrollment: None,
                }
            }
        }
    }

    async fn try_choose(
        &self,
        operation: Operation,
        identity: &str,
    ) -> Result<VariantChoice, StoreError> {
        let Some(test) = self.store.active_experiment(operation).await? else {
            return Ok(VariantChoice {
                variant: operation.default_variant(),
                enrollment: None,
            });
        };

        let hash = identity_hash(identity);
        let assignment = match self.store.get_assignment(&hash, &test.id).await? {
            Some(existing) => existing,
            None => {
                let arm = arm_for_bucket(bucket(identity), test.traffic_split);
                let fresh = ExperimentAssignment {
                    identity_hash: hash.clone(),
                    test_id: test.id.clone(),
                    arm,
                    model_variant: test.variants.for_arm(arm),
                    assigned_at: Utc::now(),
                };
                // A concurrent insert wins; we read back whichever was stored.
                self.store.insert_assignment_if_absent(&fresh).await?
            }
        };

        debug!(
            test_id = %test.id,
            arm = assignment.arm.as_str(),
            variant = assignment.model_variant.as_str(),
            "experiment assignment"
        );
        Ok(VariantChoice {
            variant: assignment.model_variant,
            enrollment: Some(Enrollment {
                test_id: test.id,
                arm: assignment.arm,
                identity_hash: hash,
            }),
        })
    }

    pub async fn select_variant(&self, operation: Operation, identity: &str) -> ModelVariant {
        self.choose(operation, identity).await.variant
    }

    /// Append a per-call result for an enrolled choice. Failures are logged only.
    pub async fn log_result(
        &self,
        choice: &VariantChoice,
        cost_usd: f64,
        latency_ms: u64,
        success: bool,
        quality_score: Option<f64>,
    ) {
        let Some(enrollment) = &choice.enrollment else {
            return;
        };
        let result = ExperimentResult {
            test_id: enrollment.test_id.clone(),
            arm: enrollment.arm,
            model_variant: choice.variant,
            identity_hash: enrollment.identity_hash.clone(),
            cost_usd,
            latency_ms,
            success,
            quality_score,
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.insert_result(&result).await {
            warn!(test_id = %result.test_id, error = %err, "failed to log experiment result");
        }
    }

    pub async fn create_experiment(&self, config: &ExperimentConfig) -> Result<(), ExperimentError> {
        if config.traffic_split > 100 {
            return Err(ExperimentError::InvalidSplit(config.traffic_split));
        }
        self.store.upsert_experiment(config).await?;
        Ok(())
    }

    pub async fn deactivate_experiment(&self, id: &str) -> Result<(), ExperimentError> {
        if !self.store.set_experiment_active(id, false).await? {
            return Err(ExperimentError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Per-arm metrics over every logged result for `test_id`.
    pub async fn aggregate(&self, test_id: &str) -> Result<ArmMetrics, ExperimentError> {
        let results = self.store.results_for(test_id).await?;
        if results.is_empty() {
            return Err(ExperimentError::NoResults(test_id.to_string()));
        }
        let config = self.store.get_experiment(test_id).await?;
        let variant_for = |arm: Arm| config.as_ref().map(|c| c.variants.for_arm(arm));
        Ok(ArmMetrics {
            control: VariantMetrics::from_results(Arm::Control, variant_for(Arm::Control), &results),
            treatment: VariantMetrics::from_results(
                Arm::Treatment,
                variant_for(Arm::Treatment),
                &results,
            ),
        })
    }
}

// =============================================================================
// Analysis
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantMetrics {
    pub arm: Arm,
    pub model_variant: Option<ModelVariant>,
    pub sample_count: usize,
    pub avg_cost_usd: f64,
    pub avg_latency_ms: f64,
    pub avg_quality_score: Option<f64>,
    pub error_rate: f64,
}

impl VariantMetrics {
    pub fn from_results(
        arm: Arm,
        configured: Option<ModelVariant>,
        results: &[ExperimentResult],
    ) -> Self {
        let rows: Vec<&ExperimentResult> = results.iter().filter(|r| r.arm == arm).collect();
        let model_variant = configured.or_else(|| rows.first().map(|r| r.model_variant));
        if rows.is_empty() {
            return Self {
                arm,
                model_variant,
                sample_count: 0,
                avg_cost_usd: 0.0,
                avg_latency_ms: 0.0,
                avg_quality_score: None,
                error_rate: 0.0,
            };
        }

        let n = rows.len() as f64;
        let qualities: Vec<f64> = rows.iter().filter_map(|r| r.quality_score).collect();
        Self {
            arm,
            model_variant,
            sample_count: rows.len(),
            avg_cost_usd: rows.iter().map(|r| r.cost_usd).sum::<f64>() / n,
            avg_latency_ms: rows.iter().map(|r| r.latency_ms as f64).sum::<f64>() / n,
            avg_quality_score: (!qualities.is_empty())
                .then(|| qualities.iter().sum::<f64>() / qualities.len() as f64),
            error_rate: rows.iter().filter(|r| !r.success).count() as f64 / n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArmMetrics {
    pub control: VariantMetrics,
    pub treatment: VariantMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Winner {
    Control,
    Treatment,
    NoDifference,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub winner: Winner,
    pub cost_savings_pct: f64,
    pub latency_improvement_pct: f64,
    pub quality_difference_pct: Option<f64>,
    pub recommendation: String,
}

fn relative_pct(baseline: f64, delta: f64) -> f64 {
    if baseline == 0.0 {
        0.0
    } else {
        delta / baseline * 100.0
    }
}

/// Decide a winner. Regressions are checked before any cost or latency win.
pub fn compare(control: &VariantMetrics, treatment: &VariantMetrics) -> Comparison {
    let cost_savings_pct = relative_pct(
        control.avg_cost_usd,
        control.avg_cost_usd - treatment.avg_cost_usd,
    );
    let latency_improvement_pct = relative_pct(
        control.avg_latency_ms,
        control.avg_latency_ms - treatment.avg_latency_ms,
    );
    let quality_difference_pct = match (control.avg_quality_score, treatment.avg_quality_score) {
        (Some(c), Some(t)) if c != 0.0 => Some((t - c) / c * 100.0),
        _ => None,
    };
    let quality_ok = quality_difference_pct.map_or(true, |q| q > -5.0);

    let (winner, recommendation) = if treatment.error_rate > control.error_rate * 1.5 {
        (
            Winner::Control,
            "Treatment has significantly higher error rate. Stick with control.".to_string(),
        )
    } else if quality_difference_pct.is_some_and(|q| q < -10.0) {
        (
            Winner::Control,
            "Treatment quality is significantly lower. Stick with control.".to_string(),
        )
    } else if cost_savings_pct > 20.0 && quality_ok {
        (
            Winner::Treatment,
            format!("Treatment saves {cost_savings_pct:.1}% on costs with acceptable quality."),
        )
    } else if latency_improvement_pct > 30.0 && quality_ok {
        (
            Winner::Treatment,
            format!("Treatment is {latency_improvement_pct:.1}% faster with acceptable quality."),
        )
    } else {
        (
            Winner::NoDifference,
            "No clear winner. Consider running test longer or adjusting criteria.".to_string(),
        )
    };

    Comparison {
        winner,
        cost_savings_pct,
        latency_improvement_pct,
        quality_difference_pct,
        recommendation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(cost: f64, latency: f64, quality: Option<f64>, error_rate: f64) -> VariantMetrics {
        VariantMetrics {
            arm: Arm::Control,
            model_variant: None,
            sample_count: 10,
            avg_cost_usd: cost,
            avg_latency_ms: latency,
            avg_quality_score: quality,
            error_rate,
        }
    }

    #[test]
    fn bucket_is_stable_and_bounded() {
        for id in ["alice", "bob", "", "user-123"] {
            let b = bucket(id);
            assert!(b < 100);
            assert_eq!(b, bucket(id));
        }
    }

    #[test]
    fn split_edges() {
        assert_eq!(arm_for_bucket(0, 0), Arm::Control);
        assert_eq!(arm_for_bucket(99, 100), Arm::Treatment);
        assert_eq!(arm_for_bucket(20, 20), Arm::Control);
        assert_eq!(arm_for_bucket(19, 20), Arm::Treatment);
    }

    #[test]
    fn variant_names_roundtrip() {
        for v in ModelVariant::ALL {
            assert_eq!(ModelVariant::from_str(v.as_str()), Some(v));
            let json = serde_json::to_string(&v).unwrap();
            assert_eq!(json, format!("\"{}\"", v.as_str()));
        }
        assert_eq!(ModelVariant::HfDialoGpt.provider(), ProviderKind::HuggingFace);
    }

    #[test]
    fn defaults_per_operation() {
        assert_eq!(
            Operation::SkillExtraction.default_variant(),
            ModelVariant::ClaudeSonnet
        );
        assert_eq!(Operation::CodeAnalysis.default_variant(), ModelVariant::ClaudeOpus);
        assert_eq!(Operation::Summarization.default_variant(), ModelVariant::ClaudeHaiku);
    }

    #[test]
    fn error_rate_regression_beats_cost_win() {
        let control = metrics(1.0, 100.0, None, 0.10);
        let treatment = metrics(0.1, 10.0, None, 0.20);
        let cmp = compare(&control, &treatment);
        assert_eq!(cmp.winner, Winner::Control);
        assert!(cmp.cost_savings_pct > 80.0);
    }

    #[test]
    fn quality_drop_loses() {
        let cmp = compare(
            &metrics(1.0, 100.0, Some(0.9), 0.0),
            &metrics(0.5, 100.0, Some(0.7), 0.0),
        );
        assert_eq!(cmp.winner, Winner::Control);
        assert!(cmp.quality_difference_pct.unwrap() < -10.0);
    }

    #[test]
    fn cost_win_requires_quality_within_five_percent() {
        let ok = compare(
            &metrics(1.0, 100.0, Some(1.0), 0.0),
            &metrics(0.7, 100.0, Some(0.97), 0.0),
        );
        assert_eq!(ok.winner, Winner::Treatment);
        assert!((ok.cost_savings_pct - 30.0).abs() < 1e-9);

        let borderline = compare(
            &metrics(1.0, 100.0, Some(1.0), 0.0),
            &metrics(0.7, 100.0, Some(0.93), 0.0),
        );
        assert_eq!(borderline.winner, Winner::NoDifference);
    }

    #[test]
    fn latency_win() {
        let cmp = compare(&metrics(1.0, 1000.0, None, 0.0), &metrics(1.0, 500.0, None, 0.0));
        assert_eq!(cmp.winner, Winner::Treatment);
        assert!((cmp.latency_improvement_pct - 50.0).abs() < 1e-9);
    }

    #[test]
    fn zero_control_baseline_yields_zero_pct() {
        let cmp = compare(&metrics(0.0, 0.0, None, 0.0), &metrics(0.0, 0.0, None, 0.0));
        assert_eq!(cmp.cost_savings_pct, 0.0);
        assert_eq!(cmp.latency_improvement_pct, 0.0);
        assert_eq!(cmp.winner, Winner::NoDifference);
    }

    #[test]
    fn metrics_average_per_arm() {
        let now = Utc::now();
        let row = |arm, cost, latency, success, quality| ExperimentResult {
            test_id: "t".into(),
            arm,
            model_variant: ModelVariant::ClaudeHaiku,
            identity_hash: "h".into(),
            cost_usd: cost,
            latency_ms: latency,
            success,
            quality_score: quality,
            created_at: now,
        };
        let results = vec![
            row(Arm::Treatment, 0.2, 100, true, Some(0.8)),
            row(Arm::Treatment, 0.4, 300, false, None),
            row(Arm::Control, 1.0, 50, true, None),
        ];
        let m = VariantMetrics::from_results(Arm::Treatment, None, &results);
        assert_eq!(m.sample_count, 2);
        assert!((m.avg_cost_usd - 0.3).abs() < 1e-9);
        assert_eq!(m.avg_latency_ms, 200.0);
        assert_eq!(m.avg_quality_score, Some(0.8));
        assert_eq!(m.error_rate, 0.5);
        assert_eq!(m.model_variant, Some(ModelVariant::ClaudeHaiku));
    }
}
