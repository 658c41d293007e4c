//! The seam between the relay and the renderer.
//!
//! The relay only ever speaks to a `RenderBackend`; production wires in the
//! HTTP client, `serve` mode and tests wire in the in-process adapter.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::domain::snapshot::Snapshot;

#[derive(Debug, Error)]
pub enum BackendError {
    /// The renderer does not know the session id — it restarted, or the id
    /// is stale. The relay treats this as "re-bootstrap", never as fatal.
    #[error("renderer has no session `{0}`")]
    UnknownSession(String),
    #[error("renderer unreachable: {0}")]
    Transport(String),
    #[error("renderer returned status {status}: {detail}")]
    Upstream { status: u16, detail: String },
}

/// A freshly started renderer session plus its opening snapshot.
#[derive(Debug, Clone)]
pub struct StartedSession {
    pub session_id: String,
    pub snapshot: Snapshot,
}

#[async_trait]
pub trait RenderBackend: Send + Sync {
    async fn start(&self, url: &Url) -> Result<StartedSession, BackendError>;

    async fn navigate(&self, session_id: &str, href: &str) -> Result<Snapshot, BackendError>;

    async fn submit(
        &self,
        session_id: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<Snapshot, BackendError>;
}
