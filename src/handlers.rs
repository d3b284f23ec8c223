use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::error::ThrottlerError;
use crate::health::HealthChecker;
use crate::key_generator::KeyGenerator;
use crate::rate_limit_config::RateLimitRule;
use crate::response::{AcquireResponse, RuleResponse};
use crate::throttler::Throttler;
use crate::validation::{AcquireRequest, RequestValidator};

/// Shared application state
pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub throttler: Arc<Throttler>,
    pub key_generator: KeyGenerator,
    pub health: HealthChecker,
}

impl AppState {
    pub fn new(throttler: Arc<Throttler>) -> Self {
        Self {
            health: HealthChecker::new(throttler.clone()),
            key_generator: KeyGenerator::default(),
            throttler,
        }
    }

    /// Caller key from identity headers, else from `fallback` when the
    /// headers carry no usable identity.
    fn caller_key(&self, headers: &HeaderMap, fallback: Option<&str>) -> Result<String, ThrottlerError> {
        let from_headers = self
            .key_generator
            .generate_key(headers)
            .and_then(|key| RequestValidator::validate_key(&key));
        match (from_headers, fallback) {
            (Ok(key), _) => Ok(key),
            (Err(e), Some(fallback)) => {
                debug!(error = %e, "using request key");
                RequestValidator::validate_key(fallback)
            }
            (Err(e), None) => Err(e),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub format: Option<String>,
}

/// `POST /acquire`
pub async fn acquire(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<AcquireRequest>,
) -> Result<Response, ThrottlerError> {
    RequestValidator::validate_acquire(&payload)?;
    let key = state.caller_key(&headers, payload.key.as_deref())?;
    let algorithm = state.throttler.resolve_algorithm(payload.algorithm.as_deref());

    let outcome = state
        .throttler
        .admit(&key, payload.permits(), algorithm)
        .await?;

    if outcome.allowed {
        return Ok(Json(AcquireResponse::allowed()).into_response());
    }

    let period = state.throttler.limits_for(&key).await.period;
    let retry_after = period.as_secs() + u64::from(period.subsec_nanos() > 0);
    let retry_after = retry_after.max(1);
    debug!(key = %key, %algorithm, retry_after, "rate limited");

    let mut resp = (StatusCode::TOO_MANY_REQUESTS, Json(AcquireResponse::denied(retry_after))).into_response();
    resp.headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    Ok(resp)
}

/// `GET /status`
pub async fn status(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
) -> Result<impl IntoResponse, ThrottlerError> {
    let key = state.caller_key(&headers, query.key.as_deref())?;
    Ok(Json(state.throttler.get_status(&key).await))
}

/// `GET /metrics`: JSON by default, Prometheus text on request.
pub async fn metrics(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<MetricsQuery>,
) -> Response {
    let wants_text = query.format.as_deref() == Some("prometheus")
        || headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/plain"));

    if wants_text {
        match state.throttler.get_prometheus_metrics().await {
            Ok(body) => (
                [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
                .into_response(),
            Err(e) => e.into_response(),
        }
    } else {
        Json(state.throttler.get_metrics().await).into_response()
    }
}

/// `GET /rules`
pub async fn list_rules(State(state): State<SharedState>) -> Result<impl IntoResponse, ThrottlerError> {
    Ok(Json(state.throttler.get_all_rules().await?))
}

/// `PUT /rules/:key`
pub async fn set_rule(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    Json(rule): Json<RateLimitRule>,
) -> Result<impl IntoResponse, ThrottlerError> {
    let key = RequestValidator::validate_key(&key)?;
    state.throttler.set_rule(key.clone(), rule).await?;
    Ok(Json(RuleResponse::updated(key, rule)))
}

/// `DELETE /rules/:key`
pub async fn delete_rule(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ThrottlerError> {
    let key = RequestValidator::validate_key(&key)?;
    let removed = state.throttler.remove_rule(&key).await?;
    Ok(Json(RuleResponse::removed(key, removed)))
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.health.check_health().await)
}

/// Readiness check endpoint. Always ready: the fallback serves when
/// shards are down.
pub async fn readiness_check(State(state): State<SharedState>) -> impl IntoResponse {
    let shards = state.throttler.health_snapshot().await;
    let healthy = shards.values().filter(|&&h| h).count();

    let mode = if healthy == shards.len() {
        "distributed"
    } else if healthy == 0 {
        "local-only"
    } else {
        "partial"
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ready",
            "mode": mode,
            "redis": shards,
        })),
    )
}
