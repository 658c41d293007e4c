//! Headless Chromium binding for the engine traits.
//!
//! Launches one browser process per engine instance, opens an isolated
//! browser context per session, and surfaces each page's network responses
//! through the subscription interface the capture layer consumes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde_json::{Value, json};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineSettings;
use crate::domain::assets::{ResourceRole, SubresourceResponse};

use super::cdp::CdpConnection;
use super::{
    BrowsingContext, EngineError, EngineLauncher, PageHandle, RenderingEngine,
    ResponseSubscription,
};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);
const TARGET_POLL_INTERVAL: Duration = Duration::from_millis(300);
const TARGET_POLL_ATTEMPTS: usize = 10;
const QUIET_WINDOW: Duration = Duration::from_millis(500);

const CHROMIUM_CANDIDATES: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

/// Launches the shared Chromium instance on first use.
pub struct ChromiumLauncher {
    settings: EngineSettings,
}

impl ChromiumLauncher {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl EngineLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Arc<dyn RenderingEngine>, EngineError> {
        Ok(Arc::new(ChromiumEngine::launch(&self.settings).await?))
    }
}

pub struct ChromiumEngine {
    conn: Arc<CdpConnection>,
    port: u16,
    // Held so the process dies with the engine (kill_on_drop).
    _child: std::sync::Mutex<Child>,
}

impl ChromiumEngine {
    pub async fn launch(settings: &EngineSettings) -> Result<Self, EngineError> {
        let binary = resolve_binary(settings.browser_path.as_deref());
        let port = free_port().await?;

        let profile_dir = std::env::temp_dir().join(format!("specchio-engine-{port}"));
        std::fs::create_dir_all(&profile_dir)
            .map_err(|err| EngineError::Launch(format!("cannot create profile dir: {err}")))?;

        let mut command = Command::new(&binary);
        command
            .args(browser_args(port, &profile_dir, settings.proxy.as_deref()))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|err| {
            EngineError::Launch(format!("cannot spawn `{}`: {err}", binary.display()))
        })?;

        let ws_url = wait_for_ready(port, settings.launch_timeout).await?;
        let conn = Arc::new(CdpConnection::connect(&ws_url).await?);

        info!(
            target = "specchio::engine",
            port,
            binary = %binary.display(),
            proxied = settings.proxy.is_some(),
            "headless engine started"
        );

        Ok(Self {
            conn,
            port,
            _child: std::sync::Mutex::new(child),
        })
    }
}

#[async_trait]
impl RenderingEngine for ChromiumEngine {
    async fn new_context(&self) -> Result<Box<dyn BrowsingContext>, EngineError> {
        let result = self
            .conn
            .command(
                "Target.createBrowserContext",
                json!({ "disposeOnDetach": true }),
            )
            .await?;
        let context_id = result
            .get("browserContextId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::Protocol("createBrowserContext returned no id".to_string())
            })?
            .to_string();

        Ok(Box::new(ChromiumContext {
            conn: self.conn.clone(),
            port: self.port,
            context_id,
        }))
    }
}

struct ChromiumContext {
    conn: Arc<CdpConnection>,
    port: u16,
    context_id: String,
}

#[async_trait]
impl BrowsingContext for ChromiumContext {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>, EngineError> {
        let created = self
            .conn
            .command(
                "Target.createTarget",
                json!({ "url": "about:blank", "browserContextId": self.context_id }),
            )
            .await?;
        let target_id = created
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Protocol("createTarget returned no targetId".to_string()))?;

        let ws_url = page_ws_url(self.port, target_id).await?;
        let conn = Arc::new(CdpConnection::connect(&ws_url).await?);
        for domain in ["Page", "Runtime", "Network"] {
            conn.enable(domain).await?;
        }

        Ok(Box::new(ChromiumPage::start(conn).await))
    }
}

/// Tracks when the page last produced network activity, as elapsed
/// milliseconds since the page opened.
struct ActivityClock {
    started: Instant,
    touched_ms: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            touched_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.touched_ms.store(
            self.started.elapsed().as_millis() as u64,
            Ordering::Release,
        );
    }

    fn idle(&self) -> Duration {
        let touched = Duration::from_millis(self.touched_ms.load(Ordering::Acquire));
        self.started.elapsed().saturating_sub(touched)
    }
}

struct ChromiumPage {
    conn: Arc<CdpConnection>,
    listeners: Arc<Mutex<Vec<mpsc::UnboundedSender<SubresourceResponse>>>>,
    activity: Arc<ActivityClock>,
    load_marks: watch::Receiver<u64>,
    pump: JoinHandle<()>,
}

impl ChromiumPage {
    async fn start(conn: Arc<CdpConnection>) -> Self {
        let responses = conn.subscribe("Network.responseReceived").await;
        let finished = conn.subscribe("Network.loadingFinished").await;
        let failed = conn.subscribe("Network.loadingFailed").await;
        let loads = conn.subscribe("Page.loadEventFired").await;

        let (load_tx, load_rx) = watch::channel(0u64);
        let listeners: Arc<Mutex<Vec<mpsc::UnboundedSender<SubresourceResponse>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let activity = Arc::new(ActivityClock::new());

        let pump = tokio::spawn(pump_events(PumpInputs {
            conn: conn.clone(),
            responses,
            finished,
            failed,
            loads,
            load_tx,
            listeners: listeners.clone(),
            activity: activity.clone(),
        }));

        Self {
            conn,
            listeners,
            activity,
            load_marks: load_rx,
            pump,
        }
    }

    /// Sleep until no network activity has been seen for the quiet window,
    /// giving up silently at the deadline.
    async fn wait_for_quiet(&self, deadline: Instant) {
        loop {
            let idle = self.activity.idle();
            if idle >= QUIET_WINDOW {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            tokio::time::sleep((QUIET_WINDOW - idle).min(remaining)).await;
        }
    }
}

#[async_trait]
impl PageHandle for ChromiumPage {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<String, EngineError> {
        let deadline = Instant::now() + timeout;
        let mut loads = self.load_marks.clone();
        let seen = *loads.borrow();
        self.activity.touch();

        let result = self.conn.command("Page.navigate", json!({ "url": url })).await?;
        if let Some(error_text) = result.get("errorText").and_then(Value::as_str)
            && !error_text.is_empty()
        {
            return Err(EngineError::Protocol(format!(
                "navigation to `{url}` failed: {error_text}"
            )));
        }

        // The load event is the hard requirement; missing it within the
        // caller's timeout fails the operation.
        loop {
            if *loads.borrow() > seen {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EngineError::NavigationTimeout { timeout });
            }
            match tokio::time::timeout(remaining, loads.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(EngineError::Connection(
                        "page event stream ended".to_string(),
                    ));
                }
                Err(_) => return Err(EngineError::NavigationTimeout { timeout }),
            }
        }

        // Late subresources keep arriving after load; stay until the network
        // goes quiet, still bounded by the same deadline.
        self.wait_for_quiet(deadline).await;

        self.current_url().await
    }

    async fn run_script(&self, source: &str) -> Result<Value, EngineError> {
        let result = self
            .conn
            .command(
                "Runtime.evaluate",
                json!({
                    "expression": source,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;

        if let Some(exception) = result.get("exceptionDetails") {
            let text = exception
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("uncaught exception");
            return Err(EngineError::Script(text.to_string()));
        }

        Ok(result
            .get("result")
            .and_then(|outcome| outcome.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn wait_until_settled(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        // Head start so a script-triggered navigation can register activity.
        tokio::time::sleep(Duration::from_millis(100).min(timeout)).await;
        self.wait_for_quiet(deadline).await;
    }

    async fn subscribe_responses(&self) -> ResponseSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().await.push(tx);
        ResponseSubscription::new(rx)
    }

    async fn snapshot_html(&self) -> Result<String, EngineError> {
        const EXPRESSION: &str = "(document.doctype ? '<!doctype ' + document.doctype.name + '>\\n' : '') + document.documentElement.outerHTML";
        let value = self.run_script(EXPRESSION).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| EngineError::Script("snapshot expression returned no string".to_string()))
    }

    async fn current_url(&self) -> Result<String, EngineError> {
        let value = self.run_script("location.href").await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| EngineError::Script("location.href returned no string".to_string()))
    }
}

impl Drop for ChromiumPage {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

struct PumpInputs {
    conn: Arc<CdpConnection>,
    responses: mpsc::Receiver<Value>,
    finished: mpsc::Receiver<Value>,
    failed: mpsc::Receiver<Value>,
    loads: mpsc::Receiver<Value>,
    load_tx: watch::Sender<u64>,
    listeners: Arc<Mutex<Vec<mpsc::UnboundedSender<SubresourceResponse>>>>,
    activity: Arc<ActivityClock>,
}

/// Response metadata held between `responseReceived` and `loadingFinished`.
struct PendingResponse {
    request_id: String,
    url: String,
    role: ResourceRole,
    content_type: Option<String>,
    ok: bool,
}

async fn pump_events(inputs: PumpInputs) {
    let PumpInputs {
        conn,
        mut responses,
        mut finished,
        mut failed,
        mut loads,
        load_tx,
        listeners,
        activity,
    } = inputs;

    let mut inflight: HashMap<String, PendingResponse> = HashMap::new();

    loop {
        tokio::select! {
            event = responses.recv() => {
                let Some(params) = event else { break };
                activity.touch();
                if let Some(meta) = parse_response_meta(&params) {
                    inflight.insert(meta.request_id.clone(), meta);
                }
            }
            event = finished.recv() => {
                let Some(params) = event else { break };
                activity.touch();
                let Some(request_id) = params.get("requestId").and_then(Value::as_str) else {
                    continue;
                };
                if let Some(meta) = inflight.remove(request_id) {
                    deliver_body(&conn, meta, &listeners).await;
                }
            }
            event = failed.recv() => {
                let Some(params) = event else { break };
                activity.touch();
                if let Some(request_id) = params.get("requestId").and_then(Value::as_str) {
                    inflight.remove(request_id);
                }
            }
            event = loads.recv() => {
                if event.is_none() { break };
                activity.touch();
                load_tx.send_modify(|marks| *marks += 1);
            }
        }
    }

    debug!(target = "specchio::engine", "page event pump stopped");
}

fn parse_response_meta(params: &Value) -> Option<PendingResponse> {
    let request_id = params.get("requestId")?.as_str()?.to_string();
    let response = params.get("response")?;
    let url = response.get("url")?.as_str()?.to_string();
    if url.starts_with("data:") {
        return None;
    }

    let status = response.get("status").and_then(Value::as_u64).unwrap_or(0);
    let content_type = response
        .get("mimeType")
        .and_then(Value::as_str)
        .filter(|mime| !mime.is_empty())
        .map(str::to_string);
    let role = match params.get("type").and_then(Value::as_str) {
        Some("Document") => ResourceRole::Document,
        Some("Stylesheet") => ResourceRole::Stylesheet,
        Some("Image") => ResourceRole::Image,
        Some("Script") => ResourceRole::Script,
        Some("Font") => ResourceRole::Font,
        _ => ResourceRole::Other,
    };

    Some(PendingResponse {
        request_id,
        url,
        role,
        content_type,
        ok: (200..400).contains(&status),
    })
}

async fn deliver_body(
    conn: &CdpConnection,
    meta: PendingResponse,
    listeners: &Mutex<Vec<mpsc::UnboundedSender<SubresourceResponse>>>,
) {
    let body = match conn
        .command(
            "Network.getResponseBody",
            json!({ "requestId": meta.request_id }),
        )
        .await
    {
        Ok(result) => {
            let text = result.get("body").and_then(Value::as_str).unwrap_or("");
            if result
                .get("base64Encoded")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                BASE64
                    .decode(text)
                    .map(Bytes::from)
                    .unwrap_or_else(|_| Bytes::new())
            } else {
                Bytes::copy_from_slice(text.as_bytes())
            }
        }
        Err(err) => {
            debug!(
                target = "specchio::engine",
                url = %meta.url,
                error = %err,
                "response body unavailable"
            );
            Bytes::new()
        }
    };

    let response = SubresourceResponse {
        url: meta.url,
        role: meta.role,
        content_type: meta.content_type,
        body,
        ok: meta.ok,
    };

    let mut guard = listeners.lock().await;
    guard.retain(|tx| tx.send(response.clone()).is_ok());
}

fn resolve_binary(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    for candidate in CHROMIUM_CANDIDATES {
        if Path::new(candidate).exists() {
            return PathBuf::from(candidate);
        }
    }
    // Let PATH resolution have the last word; spawn reports a clear error.
    PathBuf::from("chromium")
}

fn browser_args(port: u16, profile_dir: &Path, proxy: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "--headless=new".to_string(),
        format!("--remote-debugging-port={port}"),
        format!("--user-data-dir={}", profile_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--metrics-recording-only".to_string(),
        "--password-store=basic".to_string(),
        "--window-size=1280,720".to_string(),
    ];
    if let Some(proxy) = proxy {
        args.push(format!("--proxy-server={proxy}"));
    }
    args.push("about:blank".to_string());
    args
}

async fn free_port() -> Result<u16, EngineError> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|err| EngineError::Launch(format!("cannot probe for a free port: {err}")))?;
    let port = listener
        .local_addr()
        .map_err(|err| EngineError::Launch(format!("cannot read probe address: {err}")))?
        .port();
    drop(listener);
    Ok(port)
}

/// Poll the debug endpoint until the browser publishes its WebSocket URL.
async fn wait_for_ready(port: u16, timeout: Duration) -> Result<String, EngineError> {
    let deadline = Instant::now() + timeout;
    let version_url = format!("http://127.0.0.1:{port}/json/version");

    loop {
        if Instant::now() >= deadline {
            return Err(EngineError::Launch(format!(
                "debug endpoint on port {port} not ready after {}s",
                timeout.as_secs()
            )));
        }

        if let Ok(response) = reqwest::get(&version_url).await {
            if let Ok(body) = response.json::<Value>().await {
                if let Some(ws_url) = body.get("webSocketDebuggerUrl").and_then(Value::as_str) {
                    return Ok(ws_url.to_string());
                }
            }
        }

        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

/// Resolve a target id to its WebSocket URL; the target may take a moment
/// to appear in the listing.
async fn page_ws_url(port: u16, target_id: &str) -> Result<String, EngineError> {
    let list_url = format!("http://127.0.0.1:{port}/json/list");

    for attempt in 0..TARGET_POLL_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(TARGET_POLL_INTERVAL).await;
        }

        let Ok(response) = reqwest::get(&list_url).await else {
            continue;
        };
        let Ok(targets) = response.json::<Vec<Value>>().await else {
            continue;
        };

        for target in &targets {
            if target.get("id").and_then(Value::as_str) == Some(target_id)
                && let Some(ws_url) = target.get("webSocketDebuggerUrl").and_then(Value::as_str)
            {
                return Ok(ws_url.to_string());
            }
        }
    }

    warn!(
        target = "specchio::engine",
        target_id, "target never appeared in the debug listing"
    );
    Err(EngineError::Connection(format!(
        "no WebSocket URL for target `{target_id}`"
    )))
}
