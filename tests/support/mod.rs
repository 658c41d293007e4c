//! Scripted rendering engine for driving the renderer without a browser.

// Each test binary uses a different slice of this module.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};

use specchio::domain::assets::{ResourceRole, SubresourceResponse};
use specchio::infra::engine::{
    BrowsingContext, EngineError, EngineLauncher, PageHandle, RenderingEngine,
    ResponseSubscription,
};

/// One scripted page the fake engine can serve.
#[derive(Clone, Default)]
pub struct ScriptedPage {
    pub html: String,
    /// URL reported after "redirects"; defaults to the requested URL.
    pub final_url: Option<String>,
    /// Subresource responses emitted while the page "loads".
    pub resources: Vec<SubresourceResponse>,
    /// Where a scripted form submission lands; `None` means the page has
    /// no form.
    pub form_target: Option<String>,
}

pub fn stylesheet_resource(url: &str, css: &str) -> SubresourceResponse {
    SubresourceResponse {
        url: url.to_string(),
        role: ResourceRole::Stylesheet,
        content_type: Some("text/css".to_string()),
        body: Bytes::copy_from_slice(css.as_bytes()),
        ok: true,
    }
}

pub fn image_resource(url: &str, content_type: &str, bytes: &[u8]) -> SubresourceResponse {
    SubresourceResponse {
        url: url.to_string(),
        role: ResourceRole::Image,
        content_type: Some(content_type.to_string()),
        body: Bytes::copy_from_slice(bytes),
        ok: true,
    }
}

/// The scripted site plus instrumentation: every page open bumps an
/// in-flight counter, so a broken per-session serialization shows up as
/// `max_concurrent_ops() > 1`.
#[derive(Default)]
pub struct ScriptedSite {
    pub pages: HashMap<String, ScriptedPage>,
    /// Sleep in the middle of each open, widening any interleaving window.
    pub op_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: &str, page: ScriptedPage) -> Self {
        self.pages.insert(url.to_string(), page);
        self
    }

    pub fn max_concurrent_ops(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeLauncher {
    pub site: Arc<ScriptedSite>,
}

#[async_trait]
impl EngineLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Arc<dyn RenderingEngine>, EngineError> {
        Ok(Arc::new(FakeEngine {
            site: self.site.clone(),
        }))
    }
}

struct FakeEngine {
    site: Arc<ScriptedSite>,
}

#[async_trait]
impl RenderingEngine for FakeEngine {
    async fn new_context(&self) -> Result<Box<dyn BrowsingContext>, EngineError> {
        Ok(Box::new(FakeContext {
            site: self.site.clone(),
        }))
    }
}

struct FakeContext {
    site: Arc<ScriptedSite>,
}

#[async_trait]
impl BrowsingContext for FakeContext {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>, EngineError> {
        Ok(Box::new(FakePageHandle {
            site: self.site.clone(),
            state: Mutex::new(PageState::default()),
            listeners: Mutex::new(Vec::new()),
        }))
    }
}

#[derive(Default, Clone)]
struct PageState {
    url: String,
    html: String,
}

struct FakePageHandle {
    site: Arc<ScriptedSite>,
    state: Mutex<PageState>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<SubresourceResponse>>>,
}

impl FakePageHandle {
    /// Load a scripted page the way a real engine would: URL moves first,
    /// resources stream in, the document arrives last. Interleaved opens
    /// therefore produce a snapshot whose html and url disagree.
    async fn open(&self, target: &str) -> Result<String, EngineError> {
        let page = self
            .site
            .pages
            .get(target)
            .ok_or_else(|| EngineError::Protocol(format!("scripted site has no page `{target}`")))?
            .clone();
        let final_url = page.final_url.clone().unwrap_or_else(|| target.to_string());

        self.site.enter();
        {
            let mut state = self.state.lock().await;
            state.url = final_url.clone();
            state.html.clear();
        }

        tokio::time::sleep(self.site.op_delay).await;

        {
            let mut listeners = self.listeners.lock().await;
            for resource in &page.resources {
                listeners.retain(|tx| tx.send(resource.clone()).is_ok());
            }
        }
        {
            let mut state = self.state.lock().await;
            state.html = page.html.clone();
        }
        self.site.exit();

        Ok(final_url)
    }
}

#[async_trait]
impl PageHandle for FakePageHandle {
    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<String, EngineError> {
        self.open(url).await
    }

    async fn run_script(&self, source: &str) -> Result<serde_json::Value, EngineError> {
        // The renderer only ever runs the form-filler script.
        if source.contains("form.submit()") {
            let current = self.state.lock().await.url.clone();
            let form_target = self
                .site
                .pages
                .get(&current)
                .and_then(|page| page.form_target.clone());
            return match form_target {
                Some(target) => {
                    self.open(&target).await?;
                    Ok(serde_json::Value::Bool(true))
                }
                None => Ok(serde_json::Value::Bool(false)),
            };
        }
        Ok(serde_json::Value::Null)
    }

    async fn wait_until_settled(&self, _timeout: Duration) {}

    async fn subscribe_responses(&self) -> ResponseSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().await.push(tx);
        ResponseSubscription::new(rx)
    }

    async fn snapshot_html(&self) -> Result<String, EngineError> {
        Ok(self.state.lock().await.html.clone())
    }

    async fn current_url(&self) -> Result<String, EngineError> {
        Ok(self.state.lock().await.url.clone())
    }
}
