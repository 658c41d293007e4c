//! The rendering-engine boundary.
//!
//! The renderer service only ever talks to these traits; the production
//! implementation drives a headless Chromium over the DevTools protocol.
//! Reproducing what the engine itself does (fetch, script execution,
//! layout) is explicitly not this crate's business.

mod cdp;
pub mod chromium;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use crate::domain::assets::{ResourceRole, SubresourceResponse};
pub use chromium::ChromiumLauncher;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine launch failed: {0}")]
    Launch(String),
    #[error("engine connection failed: {0}")]
    Connection(String),
    #[error("engine protocol error: {0}")]
    Protocol(String),
    #[error("navigation did not complete within {timeout:?}")]
    NavigationTimeout { timeout: Duration },
    #[error("page script failed: {0}")]
    Script(String),
}

/// Launches the process-wide engine instance on first use.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn RenderingEngine>, EngineError>;
}

#[async_trait]
pub trait RenderingEngine: Send + Sync {
    /// Open an isolated cookie/storage scope dedicated to one session.
    async fn new_context(&self) -> Result<Box<dyn BrowsingContext>, EngineError>;
}

#[async_trait]
pub trait BrowsingContext: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>, EngineError>;
}

#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Navigate and block until the engine's network-quiescence heuristic
    /// fires or `timeout` expires. Returns the final URL after redirects.
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<String, EngineError>;

    /// Evaluate a script in the page context, returning its JSON value.
    async fn run_script(&self, source: &str) -> Result<serde_json::Value, EngineError>;

    /// Best-effort wait for the page to settle after a script-driven action
    /// (a form submission navigating the page). Never fails; returns at the
    /// deadline if the page stays busy.
    async fn wait_until_settled(&self, timeout: Duration);

    /// Start observing subresource responses. Dropping the subscription
    /// unsubscribes.
    async fn subscribe_responses(&self) -> ResponseSubscription;

    async fn snapshot_html(&self) -> Result<String, EngineError>;

    async fn current_url(&self) -> Result<String, EngineError>;
}

/// Receiving end of a page's subresource-response stream.
pub struct ResponseSubscription {
    rx: mpsc::UnboundedReceiver<SubresourceResponse>,
}

impl ResponseSubscription {
    pub fn new(rx: mpsc::UnboundedReceiver<SubresourceResponse>) -> Self {
        Self { rx }
    }

    /// Next observed response; `None` once the page is gone.
    pub async fn recv(&mut self) -> Option<SubresourceResponse> {
        self.rx.recv().await
    }
}
