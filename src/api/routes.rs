//! HTTP route handlers and server bootstrap.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::p2p;
use super::types::{HealthResponse, ResponsesRequest, ResponsesResponse};
use crate::config::Config;
use crate::session::SessionManager;

/// Which transports to expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    Http,
    P2p,
    Both,
}

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub manager: Arc<SessionManager>,
    /// Server-side default peer id announced on the data channel.
    pub peer_id: Option<String>,
}

impl AppState {
    /// The single dispatch path both transports share.
    pub async fn dispatch(
        &self,
        request: ResponsesRequest,
        header_session_id: Option<String>,
    ) -> ResponsesResponse {
        let run_request =
            match request.into_run_request(header_session_id, &self.config.trajectory_dir) {
                Ok(run_request) => run_request,
                Err(e) => return ResponsesResponse::rejected(&e),
            };

        match self.manager.execute(run_request).await {
            Ok(result) => ResponsesResponse {
                output: result.output,
                usage: result.usage,
                status: result.status,
                error: result.error,
            },
            Err(e) => ResponsesResponse::rejected(&e),
        }
    }
}

pub fn router(state: Arc<AppState>, mode: ServeMode) -> Router {
    let mut router = Router::new().route("/health", get(health));
    if matches!(mode, ServeMode::Http | ServeMode::Both) {
        router = router.route("/responses", post(responses));
    }
    if matches!(mode, ServeMode::P2p | ServeMode::Both) {
        router = router.route("/peer", get(p2p::peer_ws));
    }
    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start serving until ctrl-c, then shut the session manager down
/// gracefully.
pub async fn serve(state: Arc<AppState>, mode: ServeMode) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, ?mode, "proxy listening");

    let manager = Arc::clone(&state.manager);
    axum::serve(listener, router(state, mode))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            manager.shutdown().await;
        })
        .await?;
    Ok(())
}

async fn responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<ResponsesRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<ResponsesResponse>, (StatusCode, Json<serde_json::Value>)> {
    if let Some(expected) = &state.config.api_key {
        let presented = headers.get("x-api-key").and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "missing or invalid API key" })),
            ));
        }
    }

    let Json(request) = body.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("invalid request body: {e}") })),
        )
    })?;

    let header_session_id = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    Ok(Json(state.dispatch(request, header_session_id).await))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let healthy = state.manager.healthy().await;
    Json(HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
    })
}
