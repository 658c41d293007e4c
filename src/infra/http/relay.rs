//! Client-facing relay surface: bootstrap, the two action endpoints the
//! injected interceptor talks to, and liveness.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{
        HeaderMap, HeaderValue,
        header::{COOKIE, SET_COOKIE},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use specchio_api_types::{HealthResponse, NavIntent, SubmitIntent};

use crate::application::error::AppError;
use crate::application::relay::RelayService;
use crate::application::transform::TransformContext;
use crate::domain::session::SessionId;
use crate::domain::snapshot::Snapshot;

use super::html_response;
use super::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct RelayState {
    pub relay: Arc<RelayService>,
    pub cookie_name: Arc<str>,
}

pub fn build_relay_router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/__act/nav", post(act_nav))
        .route("/__act/submit", post(act_submit))
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn index(State(state): State<RelayState>, headers: HeaderMap) -> Response {
    let (sid, set_cookie) = bind_session(&state, &headers).await;
    let outcome = state.relay.bootstrap(&sid).await;
    respond(&state, outcome, set_cookie, "/", "GET")
}

async fn act_nav(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Json(intent): Json<NavIntent>,
) -> Response {
    let (sid, set_cookie) = bind_session(&state, &headers).await;
    let outcome = state.relay.navigate(&sid, &intent.href).await;
    respond(&state, outcome, set_cookie, "/__act/nav", "POST")
}

async fn act_submit(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Json(intent): Json<SubmitIntent>,
) -> Response {
    let (sid, set_cookie) = bind_session(&state, &headers).await;
    let outcome = state
        .relay
        .submit(
            &sid,
            &intent.fields,
            intent.method.as_deref(),
            intent.action.as_deref(),
        )
        .await;
    respond(&state, outcome, set_cookie, "/__act/submit", "POST")
}

async fn healthz(State(state): State<RelayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        sessions: state.relay.session_count().await,
    })
}

/// Bind the request to a client session; when a fresh sid is minted, also
/// build the `Set-Cookie` header that must accompany the response.
async fn bind_session(
    state: &RelayState,
    headers: &HeaderMap,
) -> (SessionId, Option<HeaderValue>) {
    let existing = cookie_value(headers, &state.cookie_name);
    let ensured = state.relay.ensure_session(existing.as_deref()).await;

    let set_cookie = ensured
        .minted
        .then(|| {
            HeaderValue::from_str(&format!(
                "{}={}; Path=/; HttpOnly; SameSite=Lax",
                state.cookie_name, ensured.sid
            ))
            .ok()
        })
        .flatten();

    (ensured.sid, set_cookie)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let header = headers.get(COOKIE)?.to_str().ok()?;
    header.split(';').find_map(|part| {
        let (key, value) = part.trim().split_once('=')?;
        (key.trim() == name).then(|| value.trim().to_string())
    })
}

fn respond(
    state: &RelayState,
    outcome: Result<Snapshot, AppError>,
    set_cookie: Option<HeaderValue>,
    path: &str,
    method: &str,
) -> Response {
    let mut response = match outcome {
        Ok(snapshot) => {
            let ctx = TransformContext {
                path,
                method,
                page_url: Some(snapshot.url.as_str()),
            };
            html_response(state.relay.deliver(&snapshot.html, &ctx))
        }
        // Generic body only; the detailed report rides along as an
        // extension for the logging middleware.
        Err(err) => err.into_response(),
    };

    if let Some(value) = set_cookie {
        response.headers_mut().insert(SET_COOKIE, value);
    }
    response
}
