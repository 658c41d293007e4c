//! `RenderBackend` implementations: the HTTP client used when relay and
//! renderer run as separate services, and an in-process adapter for
//! single-process `serve` mode.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use specchio_api_types::{
    NavigateSessionRequest, SnapshotResponse, StartSessionRequest, StartSessionResponse,
    SubmitSessionRequest,
};
use url::Url;

use crate::application::error::AppError;
use crate::application::relay::backend::{BackendError, RenderBackend, StartedSession};
use crate::application::renderer::RendererService;
use crate::domain::error::DomainError;
use crate::domain::snapshot::Snapshot;

pub struct HttpRenderBackend {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpRenderBackend {
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| BackendError::Transport(format!("cannot build client: {err}")))?;
        Ok(Self { client, base_url })
    }

    /// POST a request body and decode the JSON reply. A 404 with a known
    /// session id becomes `UnknownSession`, which the relay treats as
    /// "re-bootstrap" rather than a failure.
    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
        session_id: Option<&str>,
    ) -> Result<T, BackendError> {
        let endpoint = self
            .base_url
            .join(path)
            .map_err(|err| BackendError::Transport(format!("invalid endpoint `{path}`: {err}")))?;

        let response = self
            .client
            .post(endpoint)
            .json(body)
            .send()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|err| BackendError::Transport(format!("invalid renderer reply: {err}")));
        }

        if status == StatusCode::NOT_FOUND
            && let Some(session_id) = session_id
        {
            return Err(BackendError::UnknownSession(session_id.to_string()));
        }

        let detail = response.text().await.unwrap_or_default();
        Err(BackendError::Upstream {
            status: status.as_u16(),
            detail,
        })
    }
}

#[async_trait]
impl RenderBackend for HttpRenderBackend {
    async fn start(&self, url: &Url) -> Result<StartedSession, BackendError> {
        let reply: StartSessionResponse = self
            .post(
                "/session/start",
                &StartSessionRequest {
                    url: url.to_string(),
                },
                None,
            )
            .await?;

        Ok(StartedSession {
            session_id: reply.session_id,
            snapshot: parse_snapshot(reply.url, reply.html)?,
        })
    }

    async fn navigate(&self, session_id: &str, href: &str) -> Result<Snapshot, BackendError> {
        let reply: SnapshotResponse = self
            .post(
                "/session/nav",
                &NavigateSessionRequest {
                    session_id: session_id.to_string(),
                    href: href.to_string(),
                },
                Some(session_id),
            )
            .await?;
        parse_snapshot(reply.url, reply.html)
    }

    async fn submit(
        &self,
        session_id: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<Snapshot, BackendError> {
        let reply: SnapshotResponse = self
            .post(
                "/session/submit",
                &SubmitSessionRequest {
                    session_id: session_id.to_string(),
                    fields: fields.clone(),
                },
                Some(session_id),
            )
            .await?;
        parse_snapshot(reply.url, reply.html)
    }
}

fn parse_snapshot(url: String, html: String) -> Result<Snapshot, BackendError> {
    let url = Url::parse(&url)
        .map_err(|err| BackendError::Transport(format!("renderer returned invalid url: {err}")))?;
    Ok(Snapshot { url, html })
}

/// Backend that drives the renderer service in the same process. Used by
/// `serve` mode, where running two HTTP hops for one process buys nothing.
pub struct LocalRenderBackend {
    renderer: Arc<RendererService>,
}

impl LocalRenderBackend {
    pub fn new(renderer: Arc<RendererService>) -> Self {
        Self { renderer }
    }
}

#[async_trait]
impl RenderBackend for LocalRenderBackend {
    async fn start(&self, url: &Url) -> Result<StartedSession, BackendError> {
        let started = self
            .renderer
            .start_session(url.as_str())
            .await
            .map_err(|err| local_error(err, None))?;
        Ok(StartedSession {
            session_id: started.session_id,
            snapshot: started.snapshot,
        })
    }

    async fn navigate(&self, session_id: &str, href: &str) -> Result<Snapshot, BackendError> {
        self.renderer
            .navigate(session_id, href)
            .await
            .map_err(|err| local_error(err, Some(session_id)))
    }

    async fn submit(
        &self,
        session_id: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<Snapshot, BackendError> {
        self.renderer
            .submit(session_id, fields)
            .await
            .map_err(|err| local_error(err, Some(session_id)))
    }
}

fn local_error(err: AppError, session_id: Option<&str>) -> BackendError {
    if let (AppError::Domain(DomainError::NotFound { .. }), Some(session_id)) = (&err, session_id) {
        return BackendError::UnknownSession(session_id.to_string());
    }
    BackendError::Upstream {
        status: err.status_code().as_u16(),
        detail: err.to_string(),
    }
}
