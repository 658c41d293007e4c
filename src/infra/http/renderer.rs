//! Renderer service surface: session lifecycle operations plus liveness.
//!
//! This API is internal plumbing between the relay and the renderer, so
//! error bodies carry the real error text; the relay is the privacy
//! boundary and never forwards it to clients.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use specchio_api_types::{
    ErrorResponse, HealthResponse, NavigateSessionRequest, SnapshotResponse, StartSessionRequest,
    StartSessionResponse, SubmitSessionRequest,
};

use crate::application::error::{AppError, ErrorReport};
use crate::application::renderer::RendererService;
use crate::domain::snapshot::Snapshot;

use super::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct RendererState {
    pub renderer: Arc<RendererService>,
}

pub fn build_renderer_router(state: RendererState) -> Router {
    Router::new()
        .route("/session/start", post(session_start))
        .route("/session/nav", post(session_nav))
        .route("/session/submit", post(session_submit))
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn session_start(
    State(state): State<RendererState>,
    Json(request): Json<StartSessionRequest>,
) -> Response {
    match state.renderer.start_session(&request.url).await {
        Ok(started) => Json(StartSessionResponse {
            session_id: started.session_id,
            url: started.snapshot.url.to_string(),
            html: started.snapshot.html,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn session_nav(
    State(state): State<RendererState>,
    Json(request): Json<NavigateSessionRequest>,
) -> Response {
    match state
        .renderer
        .navigate(&request.session_id, &request.href)
        .await
    {
        Ok(snapshot) => snapshot_response(snapshot),
        Err(err) => error_response(err),
    }
}

async fn session_submit(
    State(state): State<RendererState>,
    Json(request): Json<SubmitSessionRequest>,
) -> Response {
    match state
        .renderer
        .submit(&request.session_id, &request.fields)
        .await
    {
        Ok(snapshot) => snapshot_response(snapshot),
        Err(err) => error_response(err),
    }
}

async fn healthz(State(state): State<RendererState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        sessions: state.renderer.session_count(),
    })
}

fn snapshot_response(snapshot: Snapshot) -> Response {
    Json(SnapshotResponse {
        url: snapshot.url.to_string(),
        html: snapshot.html,
    })
    .into_response()
}

fn error_response(err: AppError) -> Response {
    let status = err.status_code();
    let report = ErrorReport::from_error("infra::http::renderer", status, &err);
    let mut response = (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response();
    report.attach(&mut response);
    response
}
