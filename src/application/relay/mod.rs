//! Relay protocol: client sessions, bootstrap, navigation, and submission.
//!
//! Every operation updates the client session only on success, so a failed
//! navigation leaves the last known-good snapshot servable. Operations on
//! one client are serialized by a per-client lock; the bootstrap and
//! first-navigation paths therefore cannot race a second renderer session
//! into existence.

pub mod backend;
pub mod store;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use dashmap::DashMap;
use lol_html::{RewriteStrSettings, element, html_content::ContentType, rewrite_str};
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

use crate::application::error::AppError;
use crate::application::transform::{TransformContext, TransformPipeline};
use crate::domain::navigation::{merge_query_fields, resolve_href};
use crate::domain::session::{ClientSession, SessionId};
use crate::domain::snapshot::Snapshot;

use backend::{BackendError, RenderBackend, StartedSession};
use store::SessionStore;

const INTERCEPTOR_SOURCE: &str = include_str!("interceptor.js");

/// Outcome of binding a request to a client session.
pub struct EnsuredSession {
    pub sid: SessionId,
    /// True when a fresh sid was minted and a `Set-Cookie` must go out.
    pub minted: bool,
}

pub struct RelayService {
    store: Arc<dyn SessionStore>,
    backend: Arc<dyn RenderBackend>,
    target_url: Url,
    transforms: TransformPipeline,
    client_locks: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl RelayService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        backend: Arc<dyn RenderBackend>,
        target_url: Url,
        transforms: TransformPipeline,
    ) -> Self {
        Self {
            store,
            backend,
            target_url,
            transforms,
            client_locks: DashMap::new(),
        }
    }

    /// Bind a request to a client session. Always succeeds: a missing or
    /// invalid cookie just mints a fresh session.
    pub async fn ensure_session(&self, cookie_value: Option<&str>) -> EnsuredSession {
        if let Some(value) = cookie_value
            && let Some(sid) = SessionId::parse(value)
        {
            if self.store.get(&sid).await.is_none() {
                self.store.put(sid.clone(), ClientSession::new()).await;
            }
            return EnsuredSession { sid, minted: false };
        }

        let sid = SessionId::mint();
        self.store.put(sid.clone(), ClientSession::new()).await;
        counter!("specchio_relay_sessions_total").increment(1);
        info!(
            target = "specchio::relay",
            sid = &sid.as_str()[..8],
            "new client session"
        );
        EnsuredSession { sid, minted: true }
    }

    /// Serve the session's page: the cached snapshot when one exists,
    /// otherwise a fresh renderer session opened at the configured target.
    pub async fn bootstrap(&self, sid: &SessionId) -> Result<Snapshot, AppError> {
        let lock = self.lock_for(sid);
        let _guard = lock.lock().await;

        let mut session = self.session(sid).await;
        match session.render_session_id.clone() {
            None => {
                let started = self.start_renderer_session(sid, &mut session).await?;
                Ok(started.snapshot)
            }
            Some(render_session_id) => {
                if let (Some(url), Some(html)) =
                    (session.last_url.clone(), session.last_snapshot.clone())
                {
                    return Ok(Snapshot { url, html });
                }
                // Session without a cached snapshot; refresh it in place.
                let target = self.target_url.to_string();
                self.navigate_with_recovery(sid, &mut session, render_session_id, &target)
                    .await
            }
        }
    }

    /// Resolve `href` against the session's last URL and navigate there.
    pub async fn navigate(&self, sid: &SessionId, href: &str) -> Result<Snapshot, AppError> {
        let href = href.trim();
        if href.is_empty() {
            return Err(AppError::validation("href is required"));
        }

        let lock = self.lock_for(sid);
        let _guard = lock.lock().await;
        self.navigate_locked(sid, href).await
    }

    /// Apply a form submission. GET forms become plain navigations with the
    /// fields merged into the resolved action's query string (last value per
    /// name wins); everything else is forwarded to the renderer as a raw
    /// field map.
    pub async fn submit(
        &self,
        sid: &SessionId,
        fields: &BTreeMap<String, String>,
        method: Option<&str>,
        action: Option<&str>,
    ) -> Result<Snapshot, AppError> {
        if fields.is_empty() {
            return Err(AppError::validation("fields are required"));
        }

        let lock = self.lock_for(sid);
        let _guard = lock.lock().await;

        let is_get = method.is_some_and(|m| m.eq_ignore_ascii_case("get"));
        if is_get {
            let session = self.session(sid).await;
            let base = session
                .last_url
                .clone()
                .unwrap_or_else(|| self.target_url.clone());
            let resolved = resolve_href(action.unwrap_or(""), &base)?;
            let target = merge_query_fields(&resolved, fields);
            return self.navigate_locked(sid, target.as_str()).await;
        }

        let mut session = self.session(sid).await;
        let render_session_id = self.ensure_render_session(sid, &mut session).await?;

        let snapshot = match self.backend.submit(&render_session_id, fields).await {
            Ok(snapshot) => snapshot,
            Err(BackendError::UnknownSession(stale)) => {
                let restarted = self.rebootstrap(sid, &mut session, &stale).await?;
                self.backend
                    .submit(&restarted, fields)
                    .await
                    .map_err(AppError::from)?
            }
            Err(err) => return Err(err.into()),
        };

        self.record_snapshot(sid, &mut session, &snapshot).await;
        Ok(snapshot)
    }

    /// Run the configured transforms over a snapshot and inject the client
    /// interceptor. Applied per delivery; the stored snapshot stays raw.
    pub fn deliver(&self, html: &str, ctx: &TransformContext<'_>) -> String {
        let transformed = self.transforms.apply(html, ctx);
        inject_client_script(&transformed)
    }

    pub async fn session_count(&self) -> usize {
        self.store.len().await
    }

    async fn navigate_locked(&self, sid: &SessionId, href: &str) -> Result<Snapshot, AppError> {
        let mut session = self.session(sid).await;
        let render_session_id = self.ensure_render_session(sid, &mut session).await?;

        let base = session
            .last_url
            .clone()
            .unwrap_or_else(|| self.target_url.clone());
        let target = resolve_href(href, &base)?;

        self.navigate_with_recovery(sid, &mut session, render_session_id, target.as_str())
            .await
    }

    async fn navigate_with_recovery(
        &self,
        sid: &SessionId,
        session: &mut ClientSession,
        render_session_id: String,
        target: &str,
    ) -> Result<Snapshot, AppError> {
        let snapshot = match self.backend.navigate(&render_session_id, target).await {
            Ok(snapshot) => snapshot,
            Err(BackendError::UnknownSession(stale)) => {
                let restarted = self.rebootstrap(sid, session, &stale).await?;
                self.backend
                    .navigate(&restarted, target)
                    .await
                    .map_err(AppError::from)?
            }
            Err(err) => return Err(err.into()),
        };

        self.record_snapshot(sid, session, &snapshot).await;
        Ok(snapshot)
    }

    /// The renderer lost our session (restart, eviction). Start a fresh one
    /// at the configured target instead of wedging the client forever.
    async fn rebootstrap(
        &self,
        sid: &SessionId,
        session: &mut ClientSession,
        stale: &str,
    ) -> Result<String, AppError> {
        warn!(
            target = "specchio::relay",
            stale_session = stale,
            "renderer session vanished; re-bootstrapping"
        );
        counter!("specchio_relay_rebootstraps_total").increment(1);

        session.render_session_id = None;
        let started = self.start_renderer_session(sid, session).await?;
        Ok(started.session_id)
    }

    /// Idempotent ensure: reuse the bound renderer session or start one
    /// lazily. Callers must hold the client lock.
    async fn ensure_render_session(
        &self,
        sid: &SessionId,
        session: &mut ClientSession,
    ) -> Result<String, AppError> {
        if let Some(render_session_id) = session.render_session_id.clone() {
            return Ok(render_session_id);
        }
        let started = self.start_renderer_session(sid, session).await?;
        Ok(started.session_id)
    }

    async fn start_renderer_session(
        &self,
        sid: &SessionId,
        session: &mut ClientSession,
    ) -> Result<StartedSession, AppError> {
        let started = self.backend.start(&self.target_url).await?;
        session.render_session_id = Some(started.session_id.clone());
        session.last_url = Some(started.snapshot.url.clone());
        session.last_snapshot = Some(started.snapshot.html.clone());
        self.store.put(sid.clone(), session.clone()).await;
        counter!("specchio_render_sessions_started_total").increment(1);
        Ok(started)
    }

    async fn record_snapshot(
        &self,
        sid: &SessionId,
        session: &mut ClientSession,
        snapshot: &Snapshot,
    ) {
        session.last_url = Some(snapshot.url.clone());
        session.last_snapshot = Some(snapshot.html.clone());
        self.store.put(sid.clone(), session.clone()).await;
    }

    async fn session(&self, sid: &SessionId) -> ClientSession {
        self.store.get(sid).await.unwrap_or_default()
    }

    fn lock_for(&self, sid: &SessionId) -> Arc<Mutex<()>> {
        self.client_locks
            .entry(sid.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Inject the client interceptor at the end of `<body>`, or append it when
/// the document has no body element.
fn inject_client_script(html: &str) -> String {
    let script = format!("<script>\n{INTERCEPTOR_SOURCE}</script>");
    let injected = Rc::new(RefCell::new(false));

    let rewritten = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("body", {
                let injected = Rc::clone(&injected);
                let script = script.clone();
                move |el| {
                    el.append(&script, ContentType::Html);
                    *injected.borrow_mut() = true;
                    Ok(())
                }
            })],
            ..RewriteStrSettings::default()
        },
    );

    match rewritten {
        Ok(rewritten) if *injected.borrow() => rewritten,
        Ok(rewritten) => format!("{rewritten}{script}"),
        Err(err) => {
            warn!(
                target = "specchio::relay",
                error = %err,
                "interceptor injection failed; serving document untouched"
            );
            html.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interceptor_lands_inside_body() {
        let html = "<html><head></head><body><p>hi</p></body></html>";
        let injected = inject_client_script(html);
        let script_at = injected.find("<script>").expect("script present");
        let body_close = injected.find("</body>").expect("body close");
        assert!(script_at < body_close);
        assert!(injected.contains("__act/nav"));
    }

    #[test]
    fn interceptor_appends_when_body_is_missing() {
        let injected = inject_client_script("<p>bare fragment</p>");
        assert!(injected.starts_with("<p>bare fragment</p>"));
        assert!(injected.trim_end().ends_with("</script>"));
    }
}
