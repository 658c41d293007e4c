mod middleware;
mod relay;
mod renderer;

pub use relay::{RelayState, build_relay_router};
pub use renderer::{RendererState, build_renderer_router};

use axum::body::Body;
use axum::http::{StatusCode, header::CONTENT_TYPE};
use axum::response::{IntoResponse, Response};

/// A 200 HTML response; the relay's only success shape.
pub(crate) fn html_response(html: String) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(html))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
