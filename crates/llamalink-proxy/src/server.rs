//! Axum HTTP server for the OpenAI-compatible proxy.
//!
//! This module provides the `serve()` function that runs the proxy on a
//! pre-bound `TcpListener` (from the supervisor) until the cancellation
//! token fires. Every route is also registered without the `/v1` prefix —
//! some clients omit it.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info};

use llamalink_core::{Config, ServiceState};

use crate::error::ProxyError;
use crate::models::{ChatCompletionRequest, CompletionRequest};
use crate::ollama_models::{OllamaChatResponse, OllamaGenerateResponse, OllamaTagsResponse};
use crate::ollama_stream;
use crate::translate;
use crate::upstream::{StreamKind, UpstreamClient};

/// Shared application state for the proxy server.
#[derive(Clone)]
struct AppState {
    /// Client for the upstream Ollama server, built from the Config this
    /// instance was started with.
    upstream: UpstreamClient,
    /// Live service state published by the supervisor; `/health` reads it
    /// without performing any upstream call.
    state_rx: watch::Receiver<ServiceState>,
}

/// Run the proxy server on a pre-bound listener.
///
/// Returns `Ok(())` on clean shutdown (cancellation), or an error if the
/// server fails.
pub async fn serve(
    listener: TcpListener,
    config: &Config,
    state_rx: watch::Receiver<ServiceState>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!("Proxy server starting on {addr}");

    let state = AppState {
        upstream: UpstreamClient::from_config(config)?,
        state_rx,
    };
    let app = router(state);

    info!("Proxy listening on {addr}, forwarding to {}", config.ollama_base_url);

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    info!("Proxy server shut down");
    Ok(())
}

/// Build the route tree with permissive CORS — this proxies a local
/// developer tool, so every origin is allowed.
fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/", get(health))
        .route("/v1/models", get(list_models))
        .route("/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/completions", post(completions))
        .layer(cors)
        .with_state(state)
}

/// Liveness of the embedded server. Depends only on the published
/// [`ServiceState`] — no upstream probe, no side effects.
async fn health(State(state): State<AppState>) -> Response {
    let current = *state.state_rx.borrow();
    if current.is_running() {
        Json(serde_json::json!({ "status": "ok" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": current.as_str() })),
        )
            .into_response()
    }
}

/// List models from the upstream catalog in OpenAI format.
async fn list_models(State(state): State<AppState>) -> Response {
    debug!("GET /v1/models");

    match state.upstream.get_json::<OllamaTagsResponse>("/api/tags").await {
        Ok(tags) => {
            Json(translate::models_from_tags(tags, translate::unix_timestamp())).into_response()
        }
        Err(e) => {
            error!("Failed to list models: {e}");
            e.into_response()
        }
    }
}

/// Chat completion endpoint; `stream` in the body toggles SSE.
async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    debug!("POST /v1/chat/completions");

    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            error!("Failed to parse request: {e}");
            return ProxyError::InvalidRequest(e.to_string()).into_response();
        }
    };

    let native = match translate::chat_to_ollama(&request) {
        Ok(native) => native,
        Err(e) => return e.into_response(),
    };

    info!(model = %request.model, streaming = %request.stream, "Processing chat completion request");

    let id = translate::chat_completion_id();
    let created = translate::unix_timestamp();

    if request.stream {
        match state
            .upstream
            .post_stream("/api/chat", &native, StreamKind::Chat)
            .await
        {
            Ok(chunks) => {
                ollama_stream::sse_response(chunks, StreamKind::Chat, id, created, request.model)
            }
            Err(e) => {
                error!("Chat completion stream failed: {e}");
                e.into_response()
            }
        }
    } else {
        match state
            .upstream
            .post_json::<OllamaChatResponse>("/api/chat", &native)
            .await
        {
            Ok(resp) => {
                Json(translate::chat_from_ollama(resp, id, created, &request.model)).into_response()
            }
            Err(e) => {
                error!("Chat completion failed: {e}");
                e.into_response()
            }
        }
    }
}

/// Text completion endpoint; `stream` in the body toggles SSE.
async fn completions(State(state): State<AppState>, body: Bytes) -> Response {
    debug!("POST /v1/completions");

    let request: CompletionRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            error!("Failed to parse request: {e}");
            return ProxyError::InvalidRequest(e.to_string()).into_response();
        }
    };

    let native = match translate::completion_to_ollama(&request) {
        Ok(native) => native,
        Err(e) => return e.into_response(),
    };

    info!(model = %request.model, streaming = %request.stream, "Processing completion request");

    let id = translate::completion_id();
    let created = translate::unix_timestamp();

    if request.stream {
        match state
            .upstream
            .post_stream("/api/generate", &native, StreamKind::Generate)
            .await
        {
            Ok(chunks) => ollama_stream::sse_response(
                chunks,
                StreamKind::Generate,
                id,
                created,
                request.model,
            ),
            Err(e) => {
                error!("Completion stream failed: {e}");
                e.into_response()
            }
        }
    } else {
        match state
            .upstream
            .post_json::<OllamaGenerateResponse>("/api/generate", &native)
            .await
        {
            Ok(resp) => Json(translate::completion_from_ollama(
                resp,
                id,
                created,
                &request.model,
            ))
            .into_response(),
            Err(e) => {
                error!("Completion failed: {e}");
                e.into_response()
            }
        }
    }
}
