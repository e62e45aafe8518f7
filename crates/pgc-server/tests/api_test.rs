//! HTTP API tests against an in-process router

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use pgc_core::RawRule;
use pgc_policy::{RuleSource, StaticRuleSource};
use pgc_server::config::{UpstreamConfig, UpstreamKind};
use pgc_server::{build_source, create_router, AppState, PgcConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const ADMIN_RULE: &str = r#"permit(U, A, R) :- hasRole(U, "admin")."#;

fn app_with(source: Arc<StaticRuleSource>) -> (AppState, Router) {
    let state = AppState::with_source(PgcConfig::default(), source, None).unwrap();
    (state.clone(), create_router(state))
}

fn admin_source() -> Arc<StaticRuleSource> {
    Arc::new(StaticRuleSource::new(vec![RawRule::new("admins", ADMIN_RULE)]))
}

fn context(role: &str) -> Value {
    json!({
        "user": {"id": "alice", "role": role},
        "action": {"type": "delete"},
        "resource": {"id": "doc1"}
    })
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let body = match body {
        Some(value) => Body::from(value.to_string()),
        None => Body::empty(),
    };
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

async fn send_json(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, method, uri, body).await;
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_health_and_readiness() {
    let (state, app) = app_with(admin_source());

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");

    let (status, body) = send_json(&app, "GET", "/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], false);

    state.manager().refresh(true).await.unwrap();

    let (status, body) = send_json(&app, "GET", "/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ruleSetVersion"], 1);
}

#[tokio::test]
async fn test_evaluate_wrapped_and_bare_contexts() {
    let (_state, app) = app_with(admin_source());

    let (status, body) = send_json(
        &app,
        "POST",
        "/v1/evaluate",
        Some(json!({"context": context("admin")})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "permit");
    assert_eq!(body["ruleSetVersion"], 1);
    assert!(body["requestId"].as_str().is_some_and(|id| !id.is_empty()));

    let (status, body) = send_json(&app, "POST", "/v1/evaluate", Some(context("viewer"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "deny");
}

#[tokio::test]
async fn test_subject_alias_and_request_id_are_honored() {
    let (_state, app) = app_with(admin_source());

    let body = json!({
        "requestId": "req-42",
        "subject": {"id": "alice", "role": "admin"},
        "action": {"type": "delete"},
        "resource": {"id": "doc1"}
    });
    let (_, decision) = send_json(&app, "POST", "/v1/evaluate", Some(body)).await;
    assert_eq!(decision["requestId"], "req-42");
    assert_eq!(decision["outcome"], "permit");
}

#[tokio::test]
async fn test_malformed_context_is_rejected() {
    let (_state, app) = app_with(admin_source());

    let mut ctx = context("admin");
    ctx["user"]["groups"] = json!(["a", "b"]);

    let (status, body) = send_json(&app, "POST", "/v1/evaluate", Some(ctx)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let (status, _) = send_json(&app, "POST", "/v1/evaluate", Some(json!({"user": "alice"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_evaluation_failure_is_an_error_decision() {
    let source = admin_source();
    source.fail_with("rule store down");
    let (_state, app) = app_with(source);

    let (status, body) = send_json(&app, "POST", "/v1/evaluate", Some(context("admin"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "error");
    assert_eq!(body["ruleSetVersion"], 0);
}

#[tokio::test]
async fn test_batch_evaluation() {
    let (_state, app) = app_with(admin_source());

    let mut malformed = context("admin");
    malformed["environment"] = json!({"tags": {"nested": true}});

    let body = json!({
        "contexts": [context("admin"), context("viewer"), malformed],
        "realTime": true
    });
    let (status, body) = send_json(&app, "POST", "/v1/evaluate-batch", Some(body)).await;
    assert_eq!(status, StatusCode::OK);

    let outcomes: Vec<&str> = body["decisions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["outcome"].as_str().unwrap())
        .collect();
    assert_eq!(outcomes, vec!["permit", "deny", "error"]);

    let summary = &body["batchSummary"];
    assert_eq!(summary["total"], 3);
    assert_eq!(summary["permitCount"], 1);
    assert_eq!(summary["denyCount"], 1);
    assert_eq!(summary["errorCount"], 1);
    assert_eq!(summary["strategy"], "parallel");
}

#[tokio::test]
async fn test_oversized_batch_is_rejected() {
    let mut config = PgcConfig::default();
    config.server.max_batch_size = 2;
    let state = AppState::with_source(config, admin_source(), None).unwrap();
    let app = create_router(state);

    let body = json!({"contexts": [context("admin"), context("admin"), context("admin")]});
    let (status, _) = send_json(&app, "POST", "/v1/evaluate-batch", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cache_stats_and_clear() {
    let (_state, app) = app_with(admin_source());

    send_json(&app, "POST", "/v1/evaluate", Some(context("admin"))).await;
    let (_, decision) = send_json(&app, "POST", "/v1/evaluate", Some(context("admin"))).await;
    assert_eq!(decision["cacheHit"], true);

    let (status, stats) = send_json(&app, "GET", "/v1/cache/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["size"], 1);
    assert_eq!(stats["capacity"], 10_000);
    assert_eq!(stats["ttlSeconds"], 300);
    assert_eq!(stats["hits"], 1);

    let (status, cleared) = send_json(&app, "POST", "/v1/cache/clear", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared["cleared"], 1);

    let (_, stats) = send_json(&app, "GET", "/v1/cache/stats", None).await;
    assert_eq!(stats["size"], 0);
}

#[tokio::test]
async fn test_rules_summary_and_forced_refresh() {
    let source = admin_source();
    let (_state, app) = app_with(Arc::clone(&source));

    let (status, _) = send_json(&app, "GET", "/v1/rules", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, refreshed) = send_json(&app, "POST", "/v1/rules/refresh", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(refreshed["version"], 1);
    assert_eq!(refreshed["ruleCount"], 1);

    let (status, summary) = send_json(&app, "GET", "/v1/rules", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["version"], 1);
    assert_eq!(summary["rules"][0]["id"], "admins");
    assert_eq!(summary["rules"][0]["framework"], "canonical");
    assert_eq!(summary["lastRefresh"]["converted"], 1);

    source.fail_with("rule store down");
    let (status, body) = send_json(&app, "POST", "/v1/rules/refresh", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"]["message"].as_str().unwrap().contains("rule store down"));

    let (_, summary) = send_json(&app, "GET", "/v1/rules", None).await;
    assert_eq!(summary["version"], 1);
}

#[tokio::test]
async fn test_service_stats() {
    let (_state, app) = app_with(admin_source());
    send_json(&app, "POST", "/v1/evaluate", Some(context("admin"))).await;
    send_json(&app, "POST", "/v1/evaluate", Some(context("viewer"))).await;

    let (status, stats) = send_json(&app, "GET", "/v1/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["ruleSetVersion"], 1);
    assert_eq!(stats["decisions"]["decisions"], 2);
    assert_eq!(stats["decisions"]["permits"], 1);
    assert_eq!(stats["decisions"]["denies"], 1);
}

#[tokio::test]
async fn test_unknown_route() {
    let (_state, app) = app_with(admin_source());
    let (status, _) = send(&app, "GET", "/v2/nothing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_http_rule_source_fetches_with_bearer_token() {
    let rule_store = Router::new().route(
        "/v1/rules",
        get(|headers: axum::http::HeaderMap| async move {
            let authorized = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == "Bearer secret");
            if authorized {
                Ok(Json(json!({"rules": [{"id": "admins", "content": ADMIN_RULE}]})))
            } else {
                Err(StatusCode::UNAUTHORIZED)
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, rule_store).await.unwrap();
    });

    let config = UpstreamConfig {
        kind: UpstreamKind::Http,
        endpoint: Some(format!("http://{}/v1/rules", addr)),
        allow_insecure: true,
        ..UpstreamConfig::default()
    };
    let source = build_source(&config).unwrap();

    let rules = source.fetch_verified_rules("secret").await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].id, "admins");

    let denied = source.fetch_verified_rules("wrong").await;
    assert!(matches!(denied, Err(pgc_policy::SourceError::Unauthorized)));
}
