//! Shared request and response types for the specchio renderer API and the
//! relay's action endpoints.
//!
//! These are plain data types: every field is public, everything derives
//! serde, and no behavior lives here. The renderer service, the relay's HTTP
//! backend, and external consumers all speak these shapes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `POST /session/start` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSessionRequest {
    /// Absolute URL the new session should open first.
    pub url: String,
}

/// `POST /session/start` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSessionResponse {
    /// Opaque renderer session id to use for follow-up operations.
    pub session_id: String,
    /// Final URL after redirects.
    pub url: String,
    /// Self-contained snapshot of the opened page.
    pub html: String,
}

/// `POST /session/nav` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigateSessionRequest {
    pub session_id: String,
    /// Absolute or relative target; relative targets resolve against the
    /// session's last URL.
    pub href: String,
}

/// `POST /session/submit` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitSessionRequest {
    pub session_id: String,
    /// Flat field map applied to the page's form by element name.
    pub fields: BTreeMap<String, String>,
}

/// Snapshot payload returned by `/session/nav` and `/session/submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub url: String,
    pub html: String,
}

/// Navigation intent posted by the client interceptor to `/__act/nav`.
///
/// `href` is relay-relative: path, query, and fragment only — the
/// interceptor never sends scheme or host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavIntent {
    pub href: String,
}

/// Submission intent posted by the client interceptor to `/__act/submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitIntent {
    /// Flat name → value map collected from the form; for repeated names the
    /// last value wins.
    pub fields: BTreeMap<String, String>,
    /// Form method; anything other than GET is forwarded as a raw submit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Form action, relay-relative like `NavIntent::href`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// `GET /healthz` response body for both services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    /// Number of live sessions held by the answering service.
    pub sessions: usize,
}

/// Error body returned by the renderer API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
