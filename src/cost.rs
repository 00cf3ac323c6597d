//! Cost metering and advisory budgets.
//!
//! Every provider attempt lands in the cost log through [`CostMeter`], which
//! is also the gateway's [`UsageSink`]. Log writes never fail the caller.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::gateway::{attempt_cost, nanos_to_usd, CostLogEntry, ProviderKind, UsageSink};
use crate::store::{CostLogStore, ProviderSpend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Tier::Free),
            "pro" => Some(Tier::Pro),
            "enterprise" => Some(Tier::Enterprise),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Daily spend ceilings per tier, in USD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetLimits {
    pub free_usd: f64,
    pub pro_usd: f64,
    pub enterprise_usd: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            free_usd: 0.50,
            pro_usd: 5.00,
            enterprise_usd: 50.00,
        }
    }
}

impl BudgetLimits {
    pub fn for_tier(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Free => self.free_usd,
            Tier::Pro => self.pro_usd,
            Tier::Enterprise => self.enterprise_usd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetStatus {
    /// `used_usd >= limit_usd`.
    pub exceeded: bool,
    pub used_usd: f64,
    pub limit_usd: f64,
}

impl BudgetStatus {
    pub fn remaining_usd(&self) -> f64 {
        (self.limit_usd - self.used_usd).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OwnerTotals {
    pub today_usd: f64,
    pub last_30_days_usd: f64,
    pub all_time_usd: f64,
}

/// Writes cost logs and answers spend queries.
#[derive(Clone)]
pub struct CostMeter {
    store: Arc<dyn CostLogStore>,
    limits: BudgetLimits,
}

impl CostMeter {
    pub fn new(store: Arc<dyn CostLogStore>, limits: BudgetLimits) -> Self {
        Self { store, limits }
    }

    /// Persist one attempt. Failures are logged and swallowed.
    pub async fn log_attempt(&self, entry: CostLogEntry) {
        if let Err(err) = self.store.insert_cost_log(&entry).await {
            warn!(
                provider = entry.provider.as_str(),
                model = %entry.model,
                operation = %entry.operation,
                error = %err,
                "failed to write cost log"
            );
        }
    }

    /// USD cost of a call. Self-hosted providers are free.
    pub fn estimate_cost(
        &self,
        provider: ProviderKind,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
    ) -> f64 {
        nanos_to_usd(attempt_cost(provider, model, input_tokens, output_tokens))
    }

    /// Compare today's (UTC) spend for `owner_id` against the tier ceiling.
    ///
    /// Advisory only. When the spend query fails the owner is reported as
    /// within budget with zero usage.
    pub async fn check_budget(&self, owner_id: &str, tier: Tier) -> BudgetStatus {
        let limit_usd = self.limits.for_tier(tier);
        let used_usd = match self
            .store
            .owner_spend_since(owner_id, Some(start_of_day(Utc::now())))
            .await
        {
            Ok(nanos) => nanos_to_usd(nanos),
            Err(err) => {
                warn!(owner_id, error = %err, "budget lookup failed; assuming within budget");
                return BudgetStatus {
                    exceeded: false,
                    used_usd: 0.0,
                    limit_usd,
                };
            }
        };
        BudgetStatus {
            exceeded: used_usd >= limit_usd,
            used_usd,
            limit_usd,
        }
    }

    /// Spend per provider/model over the trailing `days`.
    pub async fn cost_by_provider(
        &self,
        owner_id: &str,
        days: u32,
    ) -> Result<Vec<ProviderSpend>, crate::store::StoreError> {
        let since = Utc::now() - Duration::days(i64::from(days));
        self.store.spend_by_provider(owner_id, since).await
    }

    pub async fn owner_totals(
        &self,
        owner_id: &str,
    ) -> Result<OwnerTotals, crate::store::StoreError> {
        let now = Utc::now();
        let today = self
            .store
            .owner_spend_since(owner_id, Some(start_of_day(now)))
            .await?;
        let month = self
            .store
            .owner_spend_since(owner_id, Some(now - Duration::days(30)))
            .await?;
        let all_time = self.store.owner_spend_since(owner_id, None).await?;
        Ok(OwnerTotals {
            today_usd: nanos_to_usd(today),
            last_30_days_usd: nanos_to_usd(month),
            all_time_usd: nanos_to_usd(all_time),
        })
    }
}

#[async_trait]
impl UsageSink for CostMeter {
    async fn record(&self, entry: CostLogEntry) {
        self.log_attempt(entry).await;
    }
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}

/// Human-readable USD amount; sub-cent amounts keep four decimals.
pub fn format_cost(usd: f64) -> String {
    if usd == 0.0 {
        "$0.00".to_string()
    } else if usd.abs() < 0.01 {
        format!("${usd:.4}")
    } else {
        format!("${usd:.2}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryLog {
        entries: Mutex<Vec<CostLogEntry>>,
        fail: bool,
    }

    #[async_trait]
    impl CostLogStore for MemoryLog {
        async fn insert_cost_log(&self, entry: &CostLogEntry) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Closed);
            }
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }

        async fn owner_spend_since(
            &self,
            owner_id: &str,
            since: Option<DateTime<Utc>>,
        ) -> Result<i64, StoreError> {
            if self.fail {
                return Err(StoreError::Closed);
            }
            Ok(self
                .entries
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.owner_id.as_deref() == Some(owner_id))
                .filter(|e| since.map_or(true, |s| e.created_at >= s))
                .map(|e| e.cost_nanodollars)
                .sum())
        }

        async fn spend_by_provider(
            &self,
            _owner_id: &str,
            _since: DateTime<Utc>,
        ) -> Result<Vec<ProviderSpend>, StoreError> {
            Ok(Vec::new())
        }

        async fn cost_logs_for_job(&self, _job_id: &str) -> Result<Vec<CostLogEntry>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn entry(owner: &str, nanos: i64) -> CostLogEntry {
        CostLogEntry::new(ProviderKind::Anthropic, "claude-3-haiku", "skill-extraction", "test")
            .owner(Some(owner.to_string()))
            .cost(nanos)
    }

    #[tokio::test]
    async fn budget_exceeded_at_limit() {
        let meter = CostMeter::new(Arc::new(MemoryLog::default()), BudgetLimits::default());
        meter.log_attempt(entry("u1", 500_000_000)).await;

        let status = meter.check_budget("u1", Tier::Free).await;
        assert!(status.exceeded);
        assert_eq!(status.used_usd, 0.5);
        assert_eq!(status.limit_usd, 0.5);

        let pro = meter.check_budget("u1", Tier::Pro).await;
        assert!(!pro.exceeded);
        assert_eq!(pro.remaining_usd(), 4.5);
    }

    #[tokio::test]
    async fn failing_store_never_blocks() {
        let store = MemoryLog {
            fail: true,
            ..Default::default()
        };
        let meter = CostMeter::new(Arc::new(store), BudgetLimits::default());
        meter.log_attempt(entry("u1", 1)).await;

        let status = meter.check_budget("u1", Tier::Free).await;
        assert!(!status.exceeded);
        assert_eq!(status.used_usd, 0.0);
        assert_eq!(status.limit_usd, 0.5);
    }

    #[test]
    fn self_hosted_is_free() {
        let meter = CostMeter::new(Arc::new(MemoryLog::default()), BudgetLimits::default());
        assert_eq!(
            meter.estimate_cost(ProviderKind::Ollama, "llama3", 10_000, 10_000),
            0.0
        );
        let sonnet = meter.estimate_cost(ProviderKind::Anthropic, "claude-3-sonnet", 1_000, 1_000);
        assert!((sonnet - 0.018).abs() < 1e-9);
    }

    #[test]
    fn formats_costs() {
        assert_eq!(format_cost(0.0), "$0.00");
        assert_eq!(format_cost(0.0042), "$0.0042");
        assert_eq!(format_cost(1.5), "$1.50");
    }
}
