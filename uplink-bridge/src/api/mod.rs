//! # REST API for the Uplink Bridge
//!
//! ## Endpoints
//!
//! - `POST /api/v1/uplink` - Bridge one inbound device message
//! - `POST /api/v1/admin/cache/clear` - Drop every cached identity
//! - `DELETE /api/v1/admin/cache/:device_id` - Evict one device
//! - `GET /health` - Health check
//! - `GET /metrics` - Cache and request counters

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use shared::{
    constants::is_valid_device_id,
    error::BridgeError,
    types::*,
};

use crate::AppState;

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = DefaultBodyLimit::max(state.config.api.max_body_size);
    let enable_cors = state.config.api.enable_cors;

    let router = Router::new()
        // Health check
        .route("/health", get(health_check))
        // Message ingestion
        .route("/api/v1/uplink", post(ingest_uplink))
        // Cache management (admin)
        .route("/api/v1/admin/cache/clear", post(clear_cache))
        .route("/api/v1/admin/cache/:device_id", delete(evict_device))
        // Metrics
        .route("/metrics", get(get_metrics))
        .layer(body_limit)
        .with_state(state);

    if enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router.layer(cors)
    } else {
        router
    }
}

/// Request counters exposed on `/metrics`
#[derive(Debug, Default)]
pub struct RequestMetrics {
    /// Messages bridged successfully
    pub bridged: AtomicU64,
    /// Messages rejected by validation
    pub rejected: AtomicU64,
    /// Messages that failed downstream
    pub failed: AtomicU64,
}

impl RequestMetrics {
    fn record(&self, result: &Result<BridgeOutcome, BridgeError>) {
        let counter = match result {
            Ok(_) => &self.bridged,
            Err(BridgeError::Validation(_)) => &self.rejected,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": shared::VERSION,
    }))
}

/// Bridge one inbound message
///
/// # Request Body
/// ```json
/// {
///   "device": { "deviceId": "sensor-42" },
///   "measurements": { "temperature": 21.5 },
///   "reportedProperties": { "fw": "1.0" },
///   "desiredProperties": { "reportingInterval": 60 },
///   "timestamp": "2024-01-31T12:00:00.000Z"
/// }
/// ```
///
/// # Response
/// ```json
/// {
///   "device_id": "sensor-42",
///   "stage": "completed",
///   "telemetry_sent": true,
///   "twin": { "reported_updated": true, "desired_updated": false }
/// }
/// ```
///
/// A body that is not a JSON object is a validation failure, like any
/// other malformed message.
async fn ingest_uplink(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<UplinkMessage>, JsonRejection>,
) -> Result<Json<BridgeOutcome>, ApiError> {
    let request_id = Uuid::new_v4();

    let result = match payload {
        Ok(Json(message)) => {
            info!(
                request_id = %request_id,
                device_id = ?message.device.as_ref().and_then(|d| d["deviceId"].as_str()),
                "Uplink message received"
            );
            state.bridge.handle_message(message).await
        }
        Err(rejection) => {
            info!(request_id = %request_id, error = %rejection.body_text(), "Unreadable uplink body");
            Err(BridgeError::Validation(rejection.body_text()))
        }
    };
    state.metrics.record(&result);

    let outcome = result.map_err(ApiError::from)?;
    info!(request_id = %request_id, device_id = %outcome.device_id, "Uplink message bridged");

    Ok(Json(outcome))
}

/// Get service metrics
async fn get_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cache_stats = state.bridge.cache().stats();
    let metrics = &state.metrics;

    Json(serde_json::json!({
        "cache": {
            "identities": cache_stats.identities,
            "hits": cache_stats.hits,
            "misses": cache_stats.misses,
            "provisions": cache_stats.provisions,
            "hit_rate": cache_stats.hit_rate(),
        },
        "requests": {
            "bridged": metrics.bridged.load(Ordering::Relaxed),
            "rejected": metrics.rejected.load(Ordering::Relaxed),
            "failed": metrics.failed.load(Ordering::Relaxed),
        }
    }))
}

/// Clear the registration cache
async fn clear_cache(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.bridge.cache().clear_all().await;
    Json(serde_json::json!({
        "status": "ok",
        "message": "Registration cache cleared"
    }))
}

/// Evict one device so its next message re-provisions
async fn evict_device(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !is_valid_device_id(&device_id) {
        return Err(BridgeError::Validation("invalid deviceId".into()).into());
    }

    let cache = state.bridge.cache();
    let was_cached = cache.contains(&device_id);
    cache.invalidate(&device_id).await;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "device_id": device_id,
        "evicted": was_cached,
    })))
}

// =============================================================================
// ERROR HANDLING
// =============================================================================

/// API error type
#[derive(Debug)]
pub enum ApiError {
    BadRequest(ErrorResponse),
    NotFound(ErrorResponse),
    Conflict(ErrorResponse),
    BadGateway(ErrorResponse),
    Internal(ErrorResponse),
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        let body = ErrorResponse {
            error: err.to_string(),
            kind: err.category().to_string(),
            device_id: err.device_id().map(str::to_string),
        };

        match err {
            BridgeError::Validation(_) => ApiError::BadRequest(body),

            BridgeError::UnknownDevice { .. } => ApiError::NotFound(body),

            _ if err.is_conflict() => ApiError::Conflict(body),

            BridgeError::Provisioning { .. }
            | BridgeError::TelemetryForward { .. }
            | BridgeError::TwinFetch { .. }
            | BridgeError::TwinUpdate { .. } => ApiError::BadGateway(body),

            BridgeError::Configuration(_)
            | BridgeError::MissingEnvVar(_)
            | BridgeError::Internal(_) => ApiError::Internal(body),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match self {
            ApiError::BadRequest(body) => (StatusCode::BAD_REQUEST, body),
            ApiError::NotFound(body) => (StatusCode::NOT_FOUND, body),
            ApiError::Conflict(body) => (StatusCode::CONFLICT, body),
            ApiError::BadGateway(body) => {
                warn!(kind = %body.kind, error = %body.error, "Downstream call failed");
                (StatusCode::BAD_GATEWAY, body)
            }
            ApiError::Internal(body) => {
                error!(error = %body.error, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse {
                        error: "Internal server error".into(),
                        ..body
                    },
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use crate::mock::{identity_for, MockHub, MockProvisioning, GROUP_KEY, SCOPE_ID};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use base64::Engine;
    use serde_json::{json, Value};
    use shared::{config::BridgeConfig, error::HubError};
    use tower::ServiceExt;

    fn state_with(hub: MockHub) -> (Arc<AppState>, Arc<MockHub>) {
        let config = BridgeConfig {
            id_scope: SCOPE_ID.into(),
            group_key: Some(base64::engine::general_purpose::STANDARD.encode(GROUP_KEY)),
            ..BridgeConfig::default()
        };
        let hub = Arc::new(hub);
        let bridge = Bridge::with_collaborators(
            &config,
            Arc::new(MockProvisioning::new()),
            hub.clone(),
            hub.clone(),
        )
        .unwrap();

        (Arc::new(AppState::new(config, bridge)), hub)
    }

    async fn call(state: Arc<AppState>, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = create_router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[test]
    fn test_error_mapping() {
        let err: ApiError = BridgeError::Validation("bad".into()).into();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let err: ApiError = BridgeError::UnknownDevice {
            device_id: "d".into(),
            operation: "telemetry",
            cause: HubError::DeviceNotFound("d".into()),
        }
        .into();
        assert!(matches!(err, ApiError::NotFound(_)));

        let err: ApiError = BridgeError::TwinUpdate {
            device_id: "d".into(),
            cause: HubError::PreconditionFailed { etag: "v1".into() },
        }
        .into();
        assert!(matches!(err, ApiError::Conflict(_)));

        let err: ApiError = BridgeError::TwinUpdate {
            device_id: "d".into(),
            cause: HubError::Transport("reset".into()),
        }
        .into();
        assert!(matches!(err, ApiError::BadGateway(_)));

        let err: ApiError = BridgeError::Internal("boom".into()).into();
        assert!(matches!(err, ApiError::Internal(_)));
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = state_with(MockHub::new());
        let (status, body) = call(state, Method::GET, "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_uplink_success() {
        let (state, hub) = state_with(MockHub::new());
        let (status, body) = call(
            state.clone(),
            Method::POST,
            "/api/v1/uplink",
            Some(json!({
                "device": { "deviceId": "dev-1" },
                "measurements": { "temperature": 21.5 },
                "reportedProperties": { "fw": "1.0" }
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["device_id"], "dev-1");
        assert_eq!(body["stage"], "completed");
        assert_eq!(body["twin"]["reported_updated"], true);
        assert_eq!(hub.events().len(), 1);
        assert_eq!(state.metrics.bridged.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_uplink_validation_error() {
        let (state, hub) = state_with(MockHub::new());
        let (status, body) = call(
            state.clone(),
            Method::POST,
            "/api/v1/uplink",
            Some(json!({ "device": { "deviceId": "bad id" }, "measurements": {} })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
        assert!(body.get("device_id").is_none());
        assert!(hub.events().is_empty());
        assert_eq!(state.metrics.rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_uplink_mistyped_fields_are_validation_errors() {
        let (state, hub) = state_with(MockHub::new());
        let bodies = vec![
            json!({ "device": { "deviceId": 5 }, "measurements": { "t": 1 } }),
            json!({ "device": "dev-1", "measurements": { "t": 1 } }),
            json!({ "device": { "deviceId": "dev-1" }, "measurements": { "t": 1 }, "timestamp": 1700000000 }),
            json!(["not", "an", "object"]),
        ];

        for body in bodies {
            let (status, response) = call(state.clone(), Method::POST, "/api/v1/uplink", Some(body.clone())).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "for {}", body);
            assert_eq!(response["kind"], "validation", "for {}", body);
            assert!(response["error"].as_str().is_some_and(|e| !e.is_empty()));
        }

        assert!(hub.events().is_empty());
        assert_eq!(state.metrics.rejected.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_uplink_unreadable_body() {
        let (state, _) = state_with(MockHub::new());
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/uplink")
            .header("content-type", "application/json")
            .body(Body::from("{ not json"))
            .unwrap();

        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: ErrorResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.kind, "validation");
        assert_eq!(state.metrics.rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_uplink_unknown_device() {
        let hub = MockHub::new();
        hub.fail_telemetry(HubError::DeviceNotFound("dev-1".into()));
        let (state, _) = state_with(hub);

        let (status, body) = call(
            state,
            Method::POST,
            "/api/v1/uplink",
            Some(json!({ "device": { "deviceId": "dev-1" }, "measurements": { "t": 1 } })),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "unknown_device");
        assert_eq!(body["device_id"], "dev-1");
    }

    #[tokio::test]
    async fn test_uplink_conflict() {
        let hub = MockHub::new();
        hub.fail_desired(HubError::PreconditionFailed { etag: "v1".into() });
        let (state, _) = state_with(hub);

        let (status, body) = call(
            state,
            Method::POST,
            "/api/v1/uplink",
            Some(json!({
                "device": { "deviceId": "dev-1" },
                "measurements": { "t": 1 },
                "desiredProperties": { "mode": "alert" }
            })),
        )
        .await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "twin_update");
    }

    #[tokio::test]
    async fn test_cache_admin() {
        let (state, _) = state_with(MockHub::new());
        state.bridge.cache().put(identity_for("dev-1")).await;

        let (status, body) = call(state.clone(), Method::DELETE, "/api/v1/admin/cache/dev-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["evicted"], true);
        assert!(!state.bridge.cache().contains("dev-1"));

        let (status, _) = call(state.clone(), Method::DELETE, "/api/v1/admin/cache/bad.id", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        state.bridge.cache().put(identity_for("dev-2")).await;
        let (status, _) = call(state.clone(), Method::POST, "/api/v1/admin/cache/clear", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!state.bridge.cache().contains("dev-2"));
    }

    #[tokio::test]
    async fn test_metrics() {
        let (state, _) = state_with(MockHub::new());
        call(
            state.clone(),
            Method::POST,
            "/api/v1/uplink",
            Some(json!({ "device": { "deviceId": "dev-1" }, "measurements": { "t": 1 } })),
        )
        .await;

        let (status, body) = call(state, Method::GET, "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cache"]["provisions"], 1);
        assert_eq!(body["requests"]["bridged"], 1);
    }
}
