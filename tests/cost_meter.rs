use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use skill_harness::config::ProviderSettings;
use skill_harness::cost::{BudgetLimits, CostMeter, Tier};
use skill_harness::gateway::{
    build_chain, usd_to_nanos, CallStatus, CostLogEntry, ProviderGateway, ProviderKind,
};
use skill_harness::orchestrator::{ExtractionContext, FallbackOrchestrator};
use skill_harness::store::{CostLogStore, SqliteStore};
use tempfile::TempDir;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn meter() -> (TempDir, Arc<SqliteStore>, CostMeter) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::new(dir.path().join("cost.sqlite")).unwrap());
    let meter = CostMeter::new(store.clone(), BudgetLimits::default());
    (dir, store, meter)
}

fn spend(owner: &str, usd: f64, at: chrono::DateTime<Utc>) -> CostLogEntry {
    CostLogEntry::new(
        ProviderKind::Anthropic,
        "claude-3-sonnet-20240229",
        "skill-extraction",
        "test",
    )
    .tokens(1000, 200)
    .cost(usd_to_nanos(usd))
    .owner(Some(owner.to_string()))
    .at(at)
}

#[tokio::test]
async fn every_attempt_is_logged_with_job_attribution() {
    let (_dir, store, meter) = meter();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{ "type": "text", "text": "[{\"skill\":\"SQL\"}]" }]
        })))
        .mount(&server)
        .await;

    let settings = ProviderSettings {
        anthropic_api_key: Some("k".into()),
        anthropic_base_url: server.uri(),
        ..ProviderSettings::default()
    };
    let orch = FallbackOrchestrator::new(
        build_chain(&settings).unwrap(),
        ProviderGateway::new(Arc::new(meter)),
    );
    let ctx = ExtractionContext {
        content_id: Some("content-1".into()),
        owner_id: Some("owner-1".into()),
        job_id: Some("job-1".into()),
    };
    let out = orch.extract(&ctx, "SELECT * FROM users;").await.unwrap();
    assert_eq!(out.attempts(), 2);

    let logs = store.cost_logs_for_job("job-1").await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].provider, ProviderKind::Ollama);
    assert_eq!(logs[0].status, CallStatus::Unavailable);
    assert_eq!(logs[0].cost_nanodollars, 0);
    assert_eq!(logs[1].provider, ProviderKind::Anthropic);
    assert_eq!(logs[1].status, CallStatus::Success);
    assert!(logs[1].cost_nanodollars > 0);
    assert_eq!(logs[1].content_id.as_deref(), Some("content-1"));
    assert_eq!(logs[1].operation, "skill-extraction");
}

#[tokio::test]
async fn budget_counts_only_today() {
    let (_dir, store, meter) = meter();
    let now = Utc::now();
    store
        .insert_cost_log(&spend("o", 0.30, now))
        .await
        .unwrap();
    store
        .insert_cost_log(&spend("o", 5.00, now - Duration::days(2)))
        .await
        .unwrap();
    store
        .insert_cost_log(&spend("someone-else", 9.00, now))
        .await
        .unwrap();

    let status = meter.check_budget("o", Tier::Free).await;
    assert!(!status.exceeded);
    assert!((status.used_usd - 0.30).abs() < 1e-9);
    assert!((status.remaining_usd() - 0.20).abs() < 1e-9);

    store
        .insert_cost_log(&spend("o", 0.20, now))
        .await
        .unwrap();
    assert!(meter.check_budget("o", Tier::Free).await.exceeded);
    assert!(!meter.check_budget("o", Tier::Pro).await.exceeded);
}

#[tokio::test]
async fn totals_and_provider_breakdown() {
    let (_dir, store, meter) = meter();
    let now = Utc::now();
    store.insert_cost_log(&spend("o", 1.0, now)).await.unwrap();
    store
        .insert_cost_log(&spend("o", 2.0, now - Duration::days(10)))
        .await
        .unwrap();
    store
        .insert_cost_log(&spend("o", 4.0, now - Duration::days(60)))
        .await
        .unwrap();
    store
        .insert_cost_log(
            &CostLogEntry::new(ProviderKind::Ollama, "llama3", "skill-extraction", "test")
                .owner(Some("o".into()))
                .failed(CallStatus::Unavailable, "not configured"),
        )
        .await
        .unwrap();

    let totals = meter.owner_totals("o").await.unwrap();
    assert!((totals.today_usd - 1.0).abs() < 1e-9);
    assert!((totals.last_30_days_usd - 3.0).abs() < 1e-9);
    assert!((totals.all_time_usd - 7.0).abs() < 1e-9);

    let breakdown = meter.cost_by_provider("o", 30).await.unwrap();
    let anthropic = breakdown
        .iter()
        .find(|s| s.provider == ProviderKind::Anthropic)
        .unwrap();
    assert_eq!(anthropic.calls, 2);
    assert_eq!(anthropic.cost_nanodollars, usd_to_nanos(3.0));
    let ollama = breakdown
        .iter()
        .find(|s| s.provider == ProviderKind::Ollama)
        .unwrap();
    assert_eq!(ollama.failed_calls, 1);
    assert_eq!(ollama.cost_nanodollars, 0);
}
