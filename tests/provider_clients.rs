use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use skill_harness::config::ProviderSettings;
use skill_harness::gateway::{
    attempt_cost, build_chain, Attribution, CompletionProvider, CompletionRequest, GatewayConfig,
    NoopUsageSink, ProviderError, ProviderGateway, ProviderKind,
};
use skill_harness::gateway::{AnthropicClient, HuggingFaceClient, OllamaClient};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn ollama_reads_output_field() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/generate"))
        .and(body_partial_json(json!({ "model": "llama3", "stream": false })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "output": "[{\"skill\":\"Rust\",\"level\":70}]"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OllamaClient::with_config(Some(server.uri()), "llama3", TIMEOUT).unwrap();
    let text = client.complete("prompt", "llama3").await.unwrap();
    assert_eq!(text, "[{\"skill\":\"Rust\",\"level\":70}]");
}

#[tokio::test]
async fn ollama_passes_plain_text_bodies_through() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json at all"))
        .mount(&server)
        .await;

    let client = OllamaClient::with_config(Some(server.uri()), "llama3", TIMEOUT).unwrap();
    assert_eq!(client.complete("p", "llama3").await.unwrap(), "not json at all");
}

#[tokio::test]
async fn ollama_without_url_is_unavailable() {
    let client = OllamaClient::with_config(None, "llama3", TIMEOUT).unwrap();
    let err = client.complete("p", "llama3").await.unwrap_err();
    assert!(err.is_unavailable());
    assert_eq!(err.code(), "provider_unavailable");
}

#[tokio::test]
async fn anthropic_sends_key_and_joins_text_blocks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-ant-test"))
        .and(body_partial_json(json!({ "model": "claude-3-haiku-20240307" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [
                { "type": "text", "text": "[{\"skill\":" },
                { "type": "tool_use", "text": "ignored" },
                { "type": "text", "text": "\"SQL\"}]" }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = AnthropicClient::with_config(
        Some("sk-ant-test".into()),
        server.uri(),
        "claude-3-sonnet-20240229",
        TIMEOUT,
    )
    .unwrap();
    let text = client
        .complete("p", "claude-3-haiku-20240307")
        .await
        .unwrap();
    assert_eq!(text, "[{\"skill\":\"SQL\"}]");
}

#[tokio::test]
async fn anthropic_status_error_keeps_http_code() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let client =
        AnthropicClient::with_config(Some("k".into()), server.uri(), "m", TIMEOUT).unwrap();
    let err = client.complete("p", "m").await.unwrap_err();
    assert_eq!(err.http_status(), Some(529));
    assert_eq!(err.code(), "provider_error");
}

#[tokio::test]
async fn anthropic_without_key_is_unavailable() {
    let client = AnthropicClient::with_config(Some("  ".into()), "http://unused", "m", TIMEOUT)
        .unwrap();
    assert!(client.complete("p", "m").await.unwrap_err().is_unavailable());
}

#[tokio::test]
async fn huggingface_handles_list_shape() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/microsoft/DialoGPT-medium"))
        .and(header("authorization", "Bearer hf-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "generated_text": "[]" }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let client = HuggingFaceClient::with_config(
        Some("hf-test".into()),
        server.uri(),
        "microsoft/DialoGPT-medium",
        TIMEOUT,
    )
    .unwrap();
    let text = client
        .complete("p", "microsoft/DialoGPT-medium")
        .await
        .unwrap();
    assert_eq!(text, "[]");
}

#[tokio::test]
async fn huggingface_invalid_json_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let client =
        HuggingFaceClient::with_config(Some("t".into()), server.uri(), "m", TIMEOUT).unwrap();
    let err = client.complete("p", "m").await.unwrap_err();
    assert!(matches!(err, ProviderError::Malformed { .. }));
}

#[test]
fn chain_follows_priority_order() {
    let chain = build_chain(&ProviderSettings::default()).unwrap();
    let kinds: Vec<ProviderKind> = chain.iter().map(|p| p.kind()).collect();
    assert_eq!(kinds, ProviderKind::PRIORITY.to_vec());
}

struct Slow;

#[async_trait::async_trait]
impl CompletionProvider for Slow {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn default_model(&self) -> &str {
        "claude-3-haiku-20240307"
    }

    async fn complete(&self, _prompt: &str, _model: &str) -> Result<String, ProviderError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok("late".into())
    }
}

#[tokio::test]
async fn gateway_times_out_slow_provider() {
    let gateway = ProviderGateway::with_config(
        Arc::new(NoopUsageSink),
        GatewayConfig {
            timeout: Duration::from_millis(50),
        },
    );
    let req = CompletionRequest::new(
        "p",
        "claude-3-haiku-20240307",
        "skill-extraction",
        Attribution::new("test"),
    );
    let err = gateway.complete(&Slow, &req).await.unwrap_err();
    assert_eq!(err.code(), "timeout");
}

#[tokio::test]
async fn gateway_prices_successful_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{ "type": "text", "text": "[]" }]
        })))
        .mount(&server)
        .await;

    let client = AnthropicClient::with_config(
        Some("k".into()),
        server.uri(),
        "claude-3-sonnet-20240229",
        TIMEOUT,
    )
    .unwrap();
    let gateway = ProviderGateway::new(Arc::new(NoopUsageSink));
    let req = CompletionRequest::new(
        "x".repeat(400),
        "claude-3-sonnet-20240229",
        "skill-extraction",
        Attribution::new("test"),
    );
    let completion = gateway.complete(&client, &req).await.unwrap();
    assert_eq!(completion.provider, ProviderKind::Anthropic);
    assert_eq!(
        completion.cost_nanodollars,
        attempt_cost(
            ProviderKind::Anthropic,
            "claude-3-sonnet-20240229",
            completion.input_tokens,
            completion.output_tokens
        )
    );
    assert!(completion.cost_nanodollars > 0);
}
