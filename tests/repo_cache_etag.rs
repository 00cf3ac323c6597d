use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use skill_harness::config::RepoCacheSettings;
use skill_harness::repo_cache::{CacheError, RepoMetadataCache};
use skill_harness::store::SqliteStore;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn cache_for(server: &MockServer) -> (TempDir, RepoMetadataCache) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::new(dir.path().join("cache.sqlite")).unwrap());
    let settings = RepoCacheSettings {
        ttl: Duration::from_secs(3600),
        base_url: server.uri(),
        token: Some("gh-test".into()),
    };
    (dir, RepoMetadataCache::new(store, &settings).unwrap())
}

const BODY: &str = "{\"Rust\": 12000,  \"Shell\": 40}";

#[tokio::test]
async fn not_modified_replays_stored_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/languages"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304).insert_header("x-ratelimit-remaining", "41"))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/languages"))
        .and(header("authorization", "token gh-test"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"v1\"")
                .insert_header("x-ratelimit-remaining", "42")
                .set_body_string(BODY),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (_dir, cache) = cache_for(&server);
    let url = format!("{}/repos/acme/widgets/languages", server.uri());

    let first = cache.fetch("owner-1", &url).await.unwrap();
    assert!(!first.from_cache);
    assert_eq!(first.payload, BODY);
    assert_eq!(first.rate_limit_remaining, Some(42));

    let second = cache.fetch("owner-1", &url).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.payload.as_bytes(), BODY.as_bytes());
    assert_eq!(second.rate_limit_remaining, Some(41));
}

#[tokio::test]
async fn response_without_etag_is_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(2)
        .mount(&server)
        .await;

    let (_dir, cache) = cache_for(&server);
    let url = format!("{}/repos/a/b/commits", server.uri());
    cache.fetch("o", &url).await.unwrap();
    let again = cache.fetch("o", &url).await.unwrap();
    assert!(!again.from_cache);
    assert_eq!(cache.stats().await.unwrap().total_entries, 0);
}

#[tokio::test]
async fn error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403).set_body_string("rate limited"))
        .mount(&server)
        .await;

    let (_dir, cache) = cache_for(&server);
    let err = cache
        .fetch("o", &format!("{}/repos/a/b/languages", server.uri()))
        .await
        .unwrap_err();
    match err {
        CacheError::Status { status, body } => {
            assert_eq!(status, 403);
            assert_eq!(body, "rate limited");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn owners_do_not_share_entries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"x\"")
                .set_body_string("{}"),
        )
        .mount(&server)
        .await;

    let (_dir, cache) = cache_for(&server);
    let url = format!("{}/repos/a/b/languages", server.uri());
    cache.fetch("alice", &url).await.unwrap();
    cache.fetch("bob", &url).await.unwrap();
    assert_eq!(cache.stats().await.unwrap().total_entries, 2);

    assert_eq!(cache.clear_owner("alice").await.unwrap(), 1);
    assert_eq!(cache.stats().await.unwrap().total_entries, 1);
}

#[tokio::test]
async fn expired_entry_is_refetched_unconditionally() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .with_priority(1)
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"v1\"")
                .set_body_string("{}"),
        )
        .expect(2)
        .mount(&server)
        .await;

    let (_dir, cache) = cache_for(&server);
    let url = format!("{}/repos/a/b/languages", server.uri());
    let now = Utc::now();
    cache.fetch_at("o", &url, now).await.unwrap();
    let later = now + chrono::Duration::hours(2);
    let refreshed = cache.fetch_at("o", &url, later).await.unwrap();
    assert!(!refreshed.from_cache);
}

#[tokio::test]
async fn repo_summary_combines_languages_and_commits() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/languages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Shell": 10, "Rust": 900, "Python": 300
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/commits"))
        .and(query_param("per_page", "20"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "commit": { "message": "Add async worker\n\nLonger body" } },
            { "commit": { "message": "Fix parser bug" } }
        ])))
        .mount(&server)
        .await;

    let (_dir, cache) = cache_for(&server);
    let summary = cache
        .repo_summary("o", "https://github.com/acme/widgets")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        summary,
        "Languages: Rust, Python, Shell. Recent commits: Add async worker; Fix parser bug"
    );

    assert!(cache.repo_summary("o", "ftp://nowhere").await.unwrap().is_none());
}
