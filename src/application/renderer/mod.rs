//! Renderer sessions: one isolated browsing context per logical session,
//! one operation at a time.
//!
//! The engine is a process-wide singleton launched lazily on the first
//! session start. Each session's async mutex covers the whole operation,
//! not just the state update — two operations against one session must
//! never interleave on the shared page, or the capture buffers and the
//! resulting snapshot would mix.

pub mod capture;
pub mod inline;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::application::error::AppError;
use crate::domain::error::DomainError;
use crate::domain::navigation::resolve_href;
use crate::domain::snapshot::Snapshot;
use crate::infra::engine::{BrowsingContext, EngineLauncher, PageHandle, RenderingEngine};

use capture::ResponseCapture;
use inline::inline_document;

/// A freshly started session plus its opening snapshot.
pub struct StartedRender {
    pub session_id: String,
    pub snapshot: Snapshot,
}

struct RenderSession {
    // Keeps the isolated cookie/storage jar alive for the session's lifetime.
    _context: Box<dyn BrowsingContext>,
    page: Box<dyn PageHandle>,
    state: Mutex<SessionState>,
}

struct SessionState {
    last_url: Url,
}

pub struct RendererService {
    launcher: Box<dyn EngineLauncher>,
    engine: OnceCell<Arc<dyn RenderingEngine>>,
    sessions: DashMap<String, Arc<RenderSession>>,
    nav_timeout: Duration,
    settle_grace: Duration,
}

impl RendererService {
    pub fn new(
        launcher: Box<dyn EngineLauncher>,
        nav_timeout: Duration,
        settle_grace: Duration,
    ) -> Self {
        Self {
            launcher,
            engine: OnceCell::new(),
            sessions: DashMap::new(),
            nav_timeout,
            settle_grace,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Open a new isolated session and navigate it to `url`.
    pub async fn start_session(&self, url: &str) -> Result<StartedRender, AppError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(AppError::validation("url is required"));
        }
        let target = Url::parse(url)
            .map_err(|err| AppError::validation(format!("invalid url `{url}`: {err}")))?;

        let engine = self.engine().await?;
        let context = engine.new_context().await?;
        let page = context.new_page().await?;

        let session_id = Uuid::new_v4().simple().to_string();
        let snapshot = self.render_navigation(page.as_ref(), &target).await?;

        let session = Arc::new(RenderSession {
            _context: context,
            page,
            state: Mutex::new(SessionState {
                last_url: snapshot.url.clone(),
            }),
        });
        self.sessions.insert(session_id.clone(), session);

        counter!("specchio_renderer_sessions_total").increment(1);
        info!(
            target = "specchio::renderer",
            session = %session_id,
            url = %snapshot.url,
            "session started"
        );
        Ok(StartedRender {
            session_id,
            snapshot,
        })
    }

    /// Resolve `href` against the session's last URL and navigate there.
    pub async fn navigate(&self, session_id: &str, href: &str) -> Result<Snapshot, AppError> {
        if href.trim().is_empty() {
            return Err(AppError::validation("href is required"));
        }
        let session = self.lookup(session_id)?;

        let mut state = session.state.lock().await;
        let target = resolve_href(href.trim(), &state.last_url)?;
        let snapshot = self.render_navigation(session.page.as_ref(), &target).await?;
        state.last_url = snapshot.url.clone();
        Ok(snapshot)
    }

    /// Fill and submit the page's form. Fields match form elements by name;
    /// unmatched fields are silently ignored. A page with no form returns
    /// its current snapshot unchanged — that is not an error.
    pub async fn submit(
        &self,
        session_id: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<Snapshot, AppError> {
        let session = self.lookup(session_id)?;

        let mut state = session.state.lock().await;
        let script = submit_script(fields)?;

        let capture = ResponseCapture::attach(session.page.as_ref()).await;
        let submitted = session
            .page
            .run_script(&script)
            .await?
            .as_bool()
            .unwrap_or(false);

        if submitted {
            session.page.wait_until_settled(self.nav_timeout).await;
        }
        let grace = if submitted {
            self.settle_grace
        } else {
            Duration::ZERO
        };
        let buffers = capture.finish(grace).await;

        let html = session.page.snapshot_html().await?;
        let url = self.page_url(session.page.as_ref()).await?;
        let html = inline_document(&html, &url, &buffers);

        if submitted {
            state.last_url = url.clone();
        }
        debug!(
            target = "specchio::renderer",
            session = session_id,
            submitted,
            url = %url,
            "form submission handled"
        );
        Ok(Snapshot { url, html })
    }

    /// One capture-wrapped navigation: subscribe, navigate (fatal on its own
    /// timeout), drain the trailing grace window (never fatal), snapshot,
    /// and fold the captured assets back in.
    async fn render_navigation(
        &self,
        page: &dyn PageHandle,
        target: &Url,
    ) -> Result<Snapshot, AppError> {
        let capture = ResponseCapture::attach(page).await;
        let final_url = page.navigate(target.as_str(), self.nav_timeout).await?;
        let buffers = capture.finish(self.settle_grace).await;

        let html = page.snapshot_html().await?;
        let url = Url::parse(&final_url).map_err(|err| {
            DomainError::invariant(format!("engine returned unparsable URL `{final_url}`: {err}"))
        })?;

        debug!(
            target = "specchio::renderer",
            url = %url,
            stylesheets = buffers.stylesheet_count(),
            images = buffers.image_count(),
            "navigation rendered"
        );
        Ok(Snapshot {
            url: url.clone(),
            html: inline_document(&html, &url, &buffers),
        })
    }

    async fn page_url(&self, page: &dyn PageHandle) -> Result<Url, AppError> {
        let current = page.current_url().await?;
        Url::parse(&current)
            .map_err(|err| {
                DomainError::invariant(format!("engine returned unparsable URL `{current}`: {err}"))
                    .into()
            })
    }

    fn lookup(&self, session_id: &str) -> Result<Arc<RenderSession>, AppError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DomainError::not_found("render session").into())
    }

    async fn engine(&self) -> Result<&Arc<dyn RenderingEngine>, AppError> {
        Ok(self
            .engine
            .get_or_try_init(|| self.launcher.launch())
            .await?)
    }
}

fn submit_script(fields: &BTreeMap<String, String>) -> Result<String, AppError> {
    let fields_json = serde_json::to_string(fields)
        .map_err(|err| AppError::unexpected(format!("cannot encode fields: {err}")))?;

    Ok(format!(
        r#"(() => {{
  const fields = {fields_json};
  const form = document.querySelector("form");
  if (!form) return false;
  for (const [name, value] of Object.entries(fields)) {{
    const el = form.elements.namedItem(name);
    if (el && "value" in el) el.value = value;
  }}
  form.submit();
  return true;
}})()"#
    ))
}
