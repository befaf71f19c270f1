//! HTTP endpoints.
//!
//! `POST /agent/query` runs the full pipeline and returns the RAG result as
//! JSON. `POST /agent/query/stream` returns the event stream as server-sent
//! events with proxy buffering disabled. `GET /health` reports service and
//! child statuses.

use axum::{
    extract::{Json, State},
    http::{header, HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use lagrum_agent::{AgentEvent, QueryRequest};
use lagrum_core::{Error, ResponseMode, Turn, TurnRole};
use lagrum_rag::RetrievalStrategy;

use crate::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = if state.settings.server.cors_enabled {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/agent/query", post(agent_query))
        .route("/agent/query/stream", post(agent_query_stream))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// A message in conversation history.
#[derive(Debug, Deserialize)]
struct ConversationMessage {
    role: String,
    content: String,
}

/// Agent query request body.
#[derive(Debug, Deserialize)]
struct AgentQueryRequest {
    question: String,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default)]
    history: Option<Vec<ConversationMessage>>,
    #[serde(default)]
    debug: Option<bool>,
}

fn default_mode() -> String {
    "auto".to_string()
}

/// JSON error body: `{error, type, status_code}`.
struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "type": self.0.kind(),
            "status_code": self.0.status_code(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

fn build_request(request: AgentQueryRequest, headers: &HeaderMap) -> Result<QueryRequest, Error> {
    if request.question.trim().is_empty() {
        return Err(Error::Validation("question must not be empty".to_string()));
    }

    let mode = match request.mode.as_str() {
        "auto" => None,
        other => match ResponseMode::parse(other) {
            Some(mode) => Some(mode),
            None => {
                return Err(Error::Validation(format!("Unknown mode: {other}")));
            }
        },
    };

    let strategy = match headers.get("x-retrieval-strategy").and_then(|v| v.to_str().ok()) {
        Some(name) => match RetrievalStrategy::parse(name) {
            Some(strategy) => Some(strategy),
            None => {
                return Err(Error::NotImplemented(format!("Unknown retrieval strategy: {name}")));
            }
        },
        None => None,
    };

    let history: Vec<Turn> = request
        .history
        .unwrap_or_default()
        .into_iter()
        .filter_map(|m| {
            let role = match m.role.as_str() {
                "user" => TurnRole::User,
                "assistant" => TurnRole::Assistant,
                _ => return None,
            };
            Some(Turn { role, content: m.content })
        })
        .collect();

    let mut query = QueryRequest::new(request.question);
    query.mode = mode;
    query.strategy = strategy;
    query.history = history;
    query.debug = request.debug.unwrap_or(false);
    Ok(query)
}

/// Full RAG pipeline, non-streaming.
async fn agent_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AgentQueryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let query = build_request(request, &headers)?;
    let result = state.orchestrator.process_query(query).await?;
    Ok(Json(result))
}

/// Streaming pipeline as server-sent events.
async fn agent_query_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AgentQueryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let query = build_request(request, &headers)?;
    let orchestrator = state.orchestrator.clone();

    let stream = orchestrator.stream_query(query).map(|event: AgentEvent| {
        Ok::<Event, std::convert::Infallible>(
            Event::default().data(serde_json::to_string(&event).unwrap_or_default()),
        )
    });

    let sse = Sse::new(stream).keep_alive(KeepAlive::default());

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            // Disable upstream proxy buffering
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    ))
}

/// Health check: orchestrator plus child service statuses.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let checks = state.orchestrator.health().await;
    let healthy = checks
        .get("vector_store")
        .and_then(|v| v.as_str())
        .map(|s| s == "ok")
        .unwrap_or(false);

    let status_code = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status_code,
        Json(serde_json::json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "checks": checks,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_deserialization() {
        let json = r#"{
            "question": "Vad säger GDPR?",
            "mode": "evidence",
            "history": [{"role": "user", "content": "Berätta om GDPR."}]
        }"#;
        let request: AgentQueryRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.question, "Vad säger GDPR?");
        assert_eq!(request.mode, "evidence");
        assert_eq!(request.history.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_mode_defaults_to_auto() {
        let request: AgentQueryRequest =
            serde_json::from_str(r#"{"question": "Hej"}"#).unwrap();
        assert_eq!(request.mode, "auto");
    }

    #[test]
    fn test_build_request_rejects_unknown_strategy() {
        let request: AgentQueryRequest =
            serde_json::from_str(r#"{"question": "Hej"}"#).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-retrieval-strategy", "hyde_v9".parse().unwrap());
        let err = build_request(request, &headers).unwrap_err();
        assert_eq!(err.status_code(), 501);
    }

    #[test]
    fn test_build_request_parses_strategy_header() {
        let request: AgentQueryRequest =
            serde_json::from_str(r#"{"question": "Hej"}"#).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-retrieval-strategy", "rag_fusion".parse().unwrap());
        let query = build_request(request, &headers).unwrap();
        assert_eq!(query.strategy, Some(RetrievalStrategy::RagFusion));
    }

    #[test]
    fn test_build_request_unknown_mode_rejected() {
        let request: AgentQueryRequest =
            serde_json::from_str(r#"{"question": "Hej", "mode": "turbo"}"#).unwrap();
        let err = build_request(request, &HeaderMap::new()).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_build_request_filters_bad_history_roles() {
        let request: AgentQueryRequest = serde_json::from_str(
            r#"{"question": "Hej", "history": [
                {"role": "user", "content": "a"},
                {"role": "system", "content": "b"}
            ]}"#,
        )
        .unwrap();
        let query = build_request(request, &HeaderMap::new()).unwrap();
        assert_eq!(query.history.len(), 1);
    }
}
