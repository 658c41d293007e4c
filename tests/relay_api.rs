use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::json;
use std::sync::Mutex;
use tower::ServiceExt;
use url::Url;

use specchio::application::relay::backend::{BackendError, RenderBackend, StartedSession};
use specchio::application::relay::{RelayService, store::MemorySessionStore};
use specchio::application::transform::TransformPipeline;
use specchio::application::transform::steps::build_pipeline;
use specchio::config::TransformSettings;
use specchio::domain::snapshot::Snapshot;
use specchio::infra::http::{RelayState, build_relay_router};
use specchio_api_types::HealthResponse;

const COOKIE_NAME: &str = "specchio_sid";
const TARGET: &str = "https://upstream.example/";

/// Scripted backend: serves predictable snapshots, records every call, and
/// can be primed to fail.
#[derive(Default)]
struct ScriptedBackend {
    start_calls: AtomicUsize,
    nav_targets: Mutex<Vec<String>>,
    submits: Mutex<Vec<BTreeMap<String, String>>>,
    fail_next_nav_unknown: AtomicBool,
    fail_nav_upstream: AtomicBool,
    pages: HashMap<String, String>,
}

impl ScriptedBackend {
    fn new() -> Self {
        Self::default()
    }

    fn nav_targets(&self) -> Vec<String> {
        self.nav_targets.lock().expect("lock").clone()
    }

    fn submits(&self) -> Vec<BTreeMap<String, String>> {
        self.submits.lock().expect("lock").clone()
    }
}

#[async_trait]
impl RenderBackend for ScriptedBackend {
    async fn start(&self, url: &Url) -> Result<StartedSession, BackendError> {
        let n = self.start_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(StartedSession {
            session_id: format!("render-session-{n}"),
            snapshot: Snapshot {
                url: url.clone(),
                html: format!(
                    "<html><head><title>Start</title></head><body>opening #{n} of {url}</body></html>"
                ),
            },
        })
    }

    async fn navigate(&self, session_id: &str, href: &str) -> Result<Snapshot, BackendError> {
        if self.fail_next_nav_unknown.swap(false, Ordering::SeqCst) {
            return Err(BackendError::UnknownSession(session_id.to_string()));
        }
        if self.fail_nav_upstream.load(Ordering::SeqCst) {
            return Err(BackendError::Upstream {
                status: 500,
                detail: "secret upstream diagnostics".to_string(),
            });
        }

        self.nav_targets
            .lock()
            .expect("lock")
            .push(href.to_string());

        let url = Url::parse(href).map_err(|err| BackendError::Transport(err.to_string()))?;
        let html = self
            .pages
            .get(href)
            .cloned()
            .unwrap_or_else(|| format!("<html><body>page at {url}</body></html>"));
        Ok(Snapshot { url, html })
    }

    async fn submit(
        &self,
        _session_id: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<Snapshot, BackendError> {
        self.submits.lock().expect("lock").push(fields.clone());
        Ok(Snapshot {
            url: Url::parse(TARGET).expect("target url"),
            html: "<html><body>submitted</body></html>".to_string(),
        })
    }
}

fn relay_router_with(backend: Arc<ScriptedBackend>, transforms: TransformPipeline) -> Router {
    let relay = Arc::new(RelayService::new(
        Arc::new(MemorySessionStore::new()),
        backend,
        Url::parse(TARGET).expect("target url"),
        transforms,
    ));
    build_relay_router(RelayState {
        relay,
        cookie_name: Arc::from(COOKIE_NAME),
    })
}

fn relay_router(backend: Arc<ScriptedBackend>) -> Router {
    relay_router_with(backend, TransformPipeline::empty())
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Option<String>, String) {
    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let set_cookie = response
        .headers()
        .get(SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    (
        status,
        set_cookie,
        String::from_utf8(bytes.to_vec()).expect("utf8"),
    )
}

async fn bootstrap(router: &Router) -> (String, String) {
    let request = Request::builder()
        .uri("/")
        .body(Body::empty())
        .expect("request");
    let (status, set_cookie, body) = send(router, request).await;
    assert_eq!(status, StatusCode::OK);

    let set_cookie = set_cookie.expect("fresh session sets a cookie");
    let sid = set_cookie
        .split(';')
        .next()
        .and_then(|pair| pair.split_once('='))
        .map(|(_, value)| value.to_string())
        .expect("cookie value");
    (sid, body)
}

fn get_root(sid: &str) -> Request<Body> {
    Request::builder()
        .uri("/")
        .header(COOKIE, format!("{COOKIE_NAME}={sid}"))
        .body(Body::empty())
        .expect("request")
}

fn post_act(path: &str, sid: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(CONTENT_TYPE, "application/json")
        .header(COOKIE, format!("{COOKIE_NAME}={sid}"))
        .body(Body::from(body.to_string()))
        .expect("request")
}

#[tokio::test]
async fn bootstrap_mints_cookie_and_injects_interceptor() {
    let backend = Arc::new(ScriptedBackend::new());
    let router = relay_router(backend.clone());

    let (sid, body) = bootstrap(&router).await;

    assert_eq!(sid.len(), 64);
    assert!(body.contains("opening #1"));
    // The interceptor rides along inside the delivered document.
    assert!(body.contains("<script>"));
    assert!(body.contains("/__act/nav"));
    assert_eq!(backend.start_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cookie_attributes_match_the_session_contract() {
    let router = relay_router(Arc::new(ScriptedBackend::new()));

    let request = Request::builder()
        .uri("/")
        .body(Body::empty())
        .expect("request");
    let (_, set_cookie, _) = send(&router, request).await;
    let set_cookie = set_cookie.expect("cookie");

    assert!(set_cookie.starts_with(&format!("{COOKIE_NAME}=")));
    assert!(set_cookie.contains("Path=/"));
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("SameSite=Lax"));
}

#[tokio::test]
async fn repeated_bootstrap_serves_cached_snapshot_without_second_start() {
    let backend = Arc::new(ScriptedBackend::new());
    let router = relay_router(backend.clone());

    let (sid, first_body) = bootstrap(&router).await;

    let (status, set_cookie, second_body) = send(&router, get_root(&sid)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(set_cookie.is_none(), "known session must not re-mint");
    assert_eq!(first_body, second_body);
    assert_eq!(backend.start_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn navigate_resolves_relative_href_against_last_url() {
    let backend = Arc::new(ScriptedBackend::new());
    let router = relay_router(backend.clone());

    let (sid, _) = bootstrap(&router).await;

    let (status, _, _) = send(
        &router,
        post_act("/__act/nav", &sid, json!({ "href": "/articles/42?ref=top" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        backend.nav_targets(),
        vec!["https://upstream.example/articles/42?ref=top".to_string()]
    );
}

#[tokio::test]
async fn navigate_without_bootstrap_lazily_starts_a_session() {
    let backend = Arc::new(ScriptedBackend::new());
    let router = relay_router(backend.clone());

    // Cookie minted via bootstrap? No — go straight to the action endpoint
    // with no cookie at all.
    let request = Request::builder()
        .method("POST")
        .uri("/__act/nav")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "href": "/direct" }).to_string()))
        .expect("request");
    let (status, set_cookie, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert!(set_cookie.is_some());
    assert!(body.contains("page at https://upstream.example/direct"));
    assert_eq!(backend.start_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn navigate_with_missing_href_is_rejected() {
    let backend = Arc::new(ScriptedBackend::new());
    let router = relay_router(backend.clone());
    let (sid, _) = bootstrap(&router).await;

    let (status, _, _) = send(&router, post_act("/__act/nav", &sid, json!({ "href": " " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(backend.nav_targets().is_empty());
}

#[tokio::test]
async fn get_submit_becomes_navigation_with_merged_query() {
    let backend = Arc::new(ScriptedBackend::new());
    let router = relay_router(backend.clone());
    let (sid, _) = bootstrap(&router).await;

    let (status, _, _) = send(
        &router,
        post_act(
            "/__act/submit",
            &sid,
            json!({
                "fields": { "q": "cats", "page": "2" },
                "method": "GET",
                "action": "/search"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let targets = backend.nav_targets();
    assert_eq!(targets.len(), 1);
    let target = Url::parse(&targets[0]).expect("target url");
    assert_eq!(target.path(), "/search");

    let pairs: BTreeMap<String, String> = target
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    assert_eq!(
        pairs,
        BTreeMap::from([
            ("q".to_string(), "cats".to_string()),
            ("page".to_string(), "2".to_string()),
        ])
    );
    assert_eq!(target.query_pairs().count(), 2);
    assert!(backend.submits().is_empty(), "GET submit must not hit submit");
}

#[tokio::test]
async fn post_submit_forwards_the_raw_field_map() {
    let backend = Arc::new(ScriptedBackend::new());
    let router = relay_router(backend.clone());
    let (sid, _) = bootstrap(&router).await;

    let (status, _, body) = send(
        &router,
        post_act(
            "/__act/submit",
            &sid,
            json!({ "fields": { "user": "ada", "note": "hello" }, "method": "POST" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("submitted"));

    assert_eq!(
        backend.submits(),
        vec![BTreeMap::from([
            ("user".to_string(), "ada".to_string()),
            ("note".to_string(), "hello".to_string()),
        ])]
    );
}

#[tokio::test]
async fn submit_with_empty_fields_is_rejected() {
    let backend = Arc::new(ScriptedBackend::new());
    let router = relay_router(backend.clone());
    let (sid, _) = bootstrap(&router).await;

    let (status, _, _) = send(
        &router,
        post_act("/__act/submit", &sid, json!({ "fields": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_render_session_triggers_rebootstrap_not_permanent_failure() {
    let backend = Arc::new(ScriptedBackend::new());
    let router = relay_router(backend.clone());
    let (sid, _) = bootstrap(&router).await;

    // Simulate a renderer restart: the next navigate sees a stale id.
    backend.fail_next_nav_unknown.store(true, Ordering::SeqCst);

    let (status, _, body) = send(
        &router,
        post_act("/__act/nav", &sid, json!({ "href": "/after-restart" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("page at https://upstream.example/after-restart"));
    // One start for bootstrap, one for the recovery.
    assert_eq!(backend.start_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn upstream_error_bodies_never_leak_internal_detail() {
    let backend = Arc::new(ScriptedBackend::new());
    let router = relay_router(backend.clone());
    let (sid, first_body) = bootstrap(&router).await;

    backend.fail_nav_upstream.store(true, Ordering::SeqCst);
    let (status, _, body) = send(
        &router,
        post_act("/__act/nav", &sid, json!({ "href": "/boom" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(!body.contains("secret upstream diagnostics"));
    assert_eq!(body, "Renderer error");

    // The failure left the last-good snapshot in place.
    backend.fail_nav_upstream.store(false, Ordering::SeqCst);
    let (status, _, body) = send(&router, get_root(&sid)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, first_body);
}

#[tokio::test]
async fn configured_transforms_run_on_delivery() {
    let transforms = build_pipeline(&[TransformSettings {
        name: "append-title-suffix".to_string(),
        enabled: true,
        options: json!({ "suffix": " — mirrored" }),
    }])
    .expect("pipeline");

    let backend = Arc::new(ScriptedBackend::new());
    let router = relay_router_with(backend, transforms);

    let (_, body) = bootstrap(&router).await;
    assert!(body.contains("<title>Start — mirrored</title>"));
}

#[tokio::test]
async fn healthz_counts_live_sessions() {
    let backend = Arc::new(ScriptedBackend::new());
    let router = relay_router(backend);

    let (sid, _) = bootstrap(&router).await;
    let _ = sid;

    let request = Request::builder()
        .uri("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = router.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let health: HealthResponse = serde_json::from_slice(&bytes).expect("health");
    assert!(health.ok);
    assert_eq!(health.sessions, 1);
}
