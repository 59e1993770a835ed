//! HTTP ingress gateway
//!
//! Accepts raw JSON bodies on configured routes, wraps each one in a fresh
//! envelope whose `source` is fixed by the route, and publishes it to the
//! router before answering. A `200` means the router accepted the event, not
//! that downstream processing has finished.
//!
//! A client that retries after a `503` should send an `Idempotency-Key`
//! header. The event id is then derived from the route and the key, so every
//! retry carries the same id and stages that already accepted the event drop
//! the repeat. Without a key each retry is a new event.

use crate::error::{PipelineError, Result};
use crate::router::EventRouter;
use crate::types::{derived_event_id, Envelope};
use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Default maximum accepted body size (256 KiB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 256 * 1024;

/// Header carrying the client's retry key
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Longest accepted idempotency key
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;

/// One HTTP entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRoute {
    /// URL path, e.g. `/events/public`
    pub path: String,
    /// Envelope `source` assigned to every event on this route
    pub source: String,
    /// Envelope `type` assigned to every event on this route
    #[serde(default = "default_event_type", rename = "type")]
    pub event_type: String,
}

fn default_event_type() -> String {
    "request".to_string()
}

impl IngressRoute {
    pub fn new(path: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
            event_type: default_event_type(),
        }
    }
}

/// Returned to the caller once the router accepted an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub event_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Validates submissions and hands them to the router
pub struct IngressGateway {
    router: Arc<EventRouter>,
    routes: HashMap<String, IngressRoute>,
    max_body_bytes: usize,
    closed: AtomicBool,
}

impl IngressGateway {
    pub fn new(router: Arc<EventRouter>, routes: Vec<IngressRoute>, max_body_bytes: usize) -> Self {
        Self {
            router,
            routes: routes.into_iter().map(|r| (r.path.clone(), r)).collect(),
            max_body_bytes,
            closed: AtomicBool::new(false),
        }
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Stop accepting submissions
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("Ingress closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Validate a raw body and publish it as a new envelope
    pub async fn submit(&self, path: &str, raw: &[u8]) -> Result<Receipt> {
        self.submit_with_key(path, raw, None).await
    }

    /// Like `submit`, with the event id derived from `idempotency_key` if given
    pub async fn submit_with_key(
        &self,
        path: &str,
        raw: &[u8],
        idempotency_key: Option<&str>,
    ) -> Result<Receipt> {
        if self.is_closed() {
            return Err(PipelineError::ShuttingDown);
        }
        let route = self
            .routes
            .get(path)
            .ok_or_else(|| PipelineError::NotFound(format!("ingress route {}", path)))?;

        let detail = self.validate(raw)?;
        let mut envelope = Envelope::new(route.source.clone(), route.event_type.clone(), detail);
        if let Some(key) = idempotency_key {
            if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(PipelineError::Validation(format!(
                    "idempotency key must be 1 to {} bytes",
                    MAX_IDEMPOTENCY_KEY_LEN
                )));
            }
            envelope = envelope.with_id(derived_event_id(&format!("{}:{}", path, key)));
        }
        let event_id = envelope.id().to_string();

        match self.router.publish(&envelope).await {
            Ok(report) => {
                tracing::debug!(
                    event_id = %event_id,
                    route = %path,
                    matched = report.matched,
                    "Event accepted"
                );
            }
            Err(e @ PipelineError::Publish { .. }) => return Err(e),
            Err(e) => {
                return Err(PipelineError::Publish {
                    event_id,
                    reason: e.to_string(),
                })
            }
        }

        Ok(Receipt {
            event_id,
            accepted_at: envelope.occurred_at(),
        })
    }

    fn validate(&self, raw: &[u8]) -> Result<String> {
        if raw.is_empty() {
            return Err(PipelineError::Validation("request body is empty".to_string()));
        }
        if raw.len() > self.max_body_bytes {
            return Err(PipelineError::Validation(format!(
                "request body is {} bytes; limit is {}",
                raw.len(),
                self.max_body_bytes
            )));
        }
        let text = std::str::from_utf8(raw)
            .map_err(|e| PipelineError::Validation(format!("request body is not UTF-8: {}", e)))?;
        serde_json::from_str::<serde_json::Value>(text)
            .map_err(|e| PipelineError::Validation(format!("request body is not valid JSON: {}", e)))?;
        // Stored verbatim; never interpreted downstream
        Ok(text.to_string())
    }

    /// Build the HTTP surface: `POST` on every route plus `GET /health`
    pub fn routes(self: &Arc<Self>) -> Router {
        let mut app = Router::new().route("/health", get(health_handler));
        for path in self.routes.keys() {
            app = app.route(path, post(submit_handler));
        }
        app.layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }
}

/// POST {route} - Accept one event.
async fn submit_handler(
    State(gateway): State<Arc<IngressGateway>>,
    path: MatchedPath,
    headers: HeaderMap,
    body: Body,
) -> std::result::Result<Json<Receipt>, PipelineError> {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .map(|value| {
            value.to_str().map_err(|_| {
                PipelineError::Validation("idempotency key must be visible ASCII".to_string())
            })
        })
        .transpose()?;

    // Read one byte past the limit so oversized bodies fail validation, not transport
    let limit = gateway.max_body_bytes().saturating_add(1);
    let raw = axum::body::to_bytes(body, limit).await.map_err(|_| {
        PipelineError::Validation(format!(
            "request body unreadable or larger than {} bytes",
            gateway.max_body_bytes()
        ))
    })?;

    gateway
        .submit_with_key(path.as_str(), &raw, key)
        .await
        .map(Json)
}

/// GET /health - Liveness; 503 once draining.
async fn health_handler(State(gateway): State<Arc<IngressGateway>>) -> Response {
    if gateway.is_closed() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "draining" })),
        )
            .into_response()
    } else {
        Json(serde_json::json!({ "status": "ok" })).into_response()
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = match &self {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Publish { .. }
            | PipelineError::ShuttingDown
            | PipelineError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "Request failed");
        }

        let mut body = serde_json::json!({ "error": self.to_string() });
        if let PipelineError::Publish { event_id, .. } = &self {
            // Lets the client retry under the same idempotency key knowingly
            body["eventId"] = serde_json::Value::String(event_id.clone());
        }
        (status, Json(body)).into_response()
    }
}
