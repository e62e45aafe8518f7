//! HTTP routes and handlers

use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use pgc_core::{Framework, RequestContext, VerificationStatus};
use pgc_enforcement::{BatchStrategy, CacheStats};
use pgc_policy::RefreshStats;
use pgc_telemetry::MetricsSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{debug, info, warn};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let body_limit = state.config.server.max_body_bytes;

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness))
        .route("/metrics", get(metrics))
        .route("/v1/evaluate", post(evaluate))
        .route("/v1/evaluate-batch", post(evaluate_batch))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/clear", post(cache_clear))
        .route("/v1/rules", get(rules))
        .route("/v1/rules/refresh", post(refresh_rules))
        .route("/v1/stats", get(stats))
        .fallback(fallback)
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn readiness(State(state): State<AppState>) -> Response {
    match state.manager().active_rule_set() {
        Some(rule_set) => Json(json!({ "ready": true, "ruleSetVersion": rule_set.version() })).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false, "reason": "no rule set published yet" })),
        )
            .into_response(),
    }
}

async fn metrics(State(state): State<AppState>) -> String {
    state
        .metrics_handle
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

/// Single evaluation body: `{"context": {...}}` or a bare context
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EvaluateRequest {
    Wrapped { context: RequestContext },
    Bare(RequestContext),
}

impl EvaluateRequest {
    fn into_context(self) -> RequestContext {
        match self {
            EvaluateRequest::Wrapped { context } | EvaluateRequest::Bare(context) => context,
        }
    }
}

async fn evaluate(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, AppError> {
    let context = serde_json::from_value::<EvaluateRequest>(body)?.into_context();
    context
        .validate()
        .map_err(|e| AppError::InvalidRequest(format!("malformed context: {}", e)))?;

    let decision = state.coordinator.evaluate(context).await;
    debug!(
        request_id = %decision.request_id,
        outcome = %decision.outcome,
        cache_hit = decision.cache_hit,
        "Decision served"
    );
    Ok(Json(decision).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest {
    contexts: Vec<RequestContext>,

    /// Latency-sensitive callers: always fan out
    #[serde(default)]
    real_time: bool,

    #[serde(default)]
    strategy: Option<BatchStrategy>,

    #[serde(default)]
    deadline_ms: Option<u64>,
}

async fn evaluate_batch(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, AppError> {
    let request: BatchRequest = serde_json::from_value(body)?;

    let limit = state.config.server.max_batch_size;
    if request.contexts.len() > limit {
        return Err(AppError::InvalidRequest(format!(
            "batch of {} contexts exceeds the limit of {}",
            request.contexts.len(),
            limit
        )));
    }

    let strategy = if request.real_time {
        BatchStrategy::Parallel
    } else {
        request.strategy.unwrap_or_default()
    };
    let deadline = request.deadline_ms.map(Duration::from_millis);

    let response = state
        .coordinator
        .evaluate_batch(request.contexts, strategy, deadline)
        .await;

    info!(
        total = response.batch_summary.total,
        errors = response.batch_summary.error_count,
        strategy = response.batch_summary.strategy.as_str(),
        latency_ms = response.batch_summary.total_latency_ms,
        "Batch served"
    );
    Ok(Json(response).into_response())
}

async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.coordinator.cache().stats())
}

async fn cache_clear(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cache = state.coordinator.cache();
    let cleared = cache.len();
    cache.clear();
    info!(cleared, "Decision cache cleared");
    Json(json!({ "cleared": cleared }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RuleSummary {
    id: String,
    framework: Framework,
    version: u64,
    content_hash: String,
    verification_status: VerificationStatus,
    source_principle_ids: Vec<String>,
    imports: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RuleSetSummary {
    version: u64,
    generated_at: DateTime<Utc>,
    rules: Vec<RuleSummary>,
    last_refresh: Option<RefreshStats>,
}

async fn rules(State(state): State<AppState>) -> Result<Json<RuleSetSummary>, AppError> {
    let manager = state.manager();
    let rule_set = manager
        .active_rule_set()
        .ok_or_else(|| AppError::Unavailable("no rule set published yet".to_string()))?;

    let rules = rule_set
        .rules()
        .iter()
        .map(|rule| RuleSummary {
            id: rule.id.clone(),
            framework: rule.framework,
            version: rule.version,
            content_hash: rule.content_hash.clone(),
            verification_status: rule.verification_status,
            source_principle_ids: rule.source_principle_ids.iter().cloned().collect(),
            imports: rule.imports.clone(),
        })
        .collect();

    Ok(Json(RuleSetSummary {
        version: rule_set.version(),
        generated_at: rule_set.generated_at(),
        rules,
        last_refresh: manager.last_stats(),
    }))
}

async fn refresh_rules(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let manager = state.manager();
    let rule_set = manager.refresh(true).await.map_err(|e| {
        warn!("Forced refresh failed: {}", e);
        AppError::Unavailable(e.to_string())
    })?;

    Ok(Json(json!({
        "version": rule_set.version(),
        "ruleCount": rule_set.len(),
        "stats": manager.last_stats(),
    })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceStats {
    uptime_seconds: u64,
    rule_set_version: Option<u64>,
    decisions: MetricsSnapshot,
    average_latency_us: u64,
    cache_hit_rate: f64,
    cache: CacheStats,
}

async fn stats(State(state): State<AppState>) -> Json<ServiceStats> {
    let snapshot = state.coordinator.metrics().snapshot();

    Json(ServiceStats {
        uptime_seconds: state.started_at.elapsed().as_secs(),
        rule_set_version: state.manager().active_rule_set().map(|rs| rs.version()),
        average_latency_us: snapshot.avg_latency_us(),
        cache_hit_rate: snapshot.cache_hit_rate(),
        decisions: snapshot,
        cache: state.coordinator.cache().stats(),
    })
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not found")
}

/// Error handling
#[derive(Debug)]
pub enum AppError {
    InvalidRequest(String),
    Unavailable(String),
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidRequest(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            AppError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_request_error", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
        };

        let body = json!({
            "error": {
                "message": message,
                "type": kind,
            }
        });

        (status, Json(body)).into_response()
    }
}
