//! HTTP surface tests
//!
//! Drives the router directly with tower's oneshot: page rendering,
//! partial content, health endpoints, metrics, webhook intake, theme and
//! auth flows, and atomic snapshot swaps.

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::routing::get;
use axum::Router;
use scry_core::app::{build_state, AppSnapshot, AppState};
use scry_core::config::{self, Loaded};
use scry_core::webhook::{WebhookDispatcher, SIGNATURE_HEADER};
use serial_test::serial;
use std::sync::Arc;
use tower::ServiceExt;

fn state_from_yaml(yaml: &str) -> AppState {
    let loaded = Loaded {
        document: config::parse_document(yaml).unwrap(),
        contents: yaml.to_string(),
        watch_paths: Vec::new(),
    };
    let snapshot = AppSnapshot::materialize(&loaded).unwrap();
    build_state(Arc::new(ArcSwap::from_pointee(snapshot)))
}

fn simple_state() -> AppState {
    state_from_yaml(
        "
pages:
  - name: Dash
    slug: dash
    columns:
      - size: full
        widgets:
          - type: html
            source: '<p id=\"greeting\">hello from dash</p>'
",
    )
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn get_path(router: &Router, path: &str) -> axum::response::Response {
    router
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

/// Bind a throwaway HTTP target for probe widgets.
async fn spawn_probe_target() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/", get(|| async { "ok" }));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/")
}

// =============================================================================
// Pages
// =============================================================================

#[tokio::test]
async fn renders_the_first_page_at_the_root() {
    let router = scry_core::http::router(simple_state());
    let response = get_path(&router, "/").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("hello from dash"));
    assert!(body.contains("data-slug=\"dash\""));
}

#[tokio::test]
async fn renders_named_pages_and_404s_unknown_slugs() {
    let router = scry_core::http::router(simple_state());

    let ok = get_path(&router, "/dash").await;
    assert_eq!(ok.status(), StatusCode::OK);

    let missing = get_path(&router, "/nope").await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn probe_widget_reports_up_for_a_healthy_target() {
    let target = spawn_probe_target().await;
    let state = state_from_yaml(&format!(
        "
pages:
  - name: Dash
    slug: dash
    columns:
      - size: full
        widgets:
          - type: probe
            url: {target}
"
    ));
    let router = scry_core::http::router(state);

    let response = get_path(&router, "/dash").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("probe-up"), "probe should be up: {body}");
    assert!(body.contains("ms"));
}

#[tokio::test]
async fn partial_content_returns_only_fragments() {
    let router = scry_core::http::router(simple_state());
    let response = get_path(&router, "/api/pages/dash/content").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("hello from dash"));
    assert!(!body.contains("<!DOCTYPE html>"));
}

#[tokio::test]
async fn snapshot_swap_is_atomic_for_new_requests() {
    let state = simple_state();
    let router = scry_core::http::router(state.clone());
    assert_eq!(get_path(&router, "/dash").await.status(), StatusCode::OK);

    // Rename the only page's slug, as a config reload would.
    let yaml = "
pages:
  - name: Dash
    slug: home
    columns:
      - size: full
        widgets:
          - type: html
            source: '<p>moved</p>'
";
    let loaded = Loaded {
        document: config::parse_document(yaml).unwrap(),
        contents: yaml.to_string(),
        watch_paths: Vec::new(),
    };
    state
        .snapshot
        .store(Arc::new(AppSnapshot::materialize(&loaded).unwrap()));

    assert_eq!(get_path(&router, "/home").await.status(), StatusCode::OK);
    assert_eq!(
        get_path(&router, "/dash").await.status(),
        StatusCode::NOT_FOUND
    );
}

// =============================================================================
// Health & metrics
// =============================================================================

#[tokio::test]
async fn health_endpoints_report_status() {
    let router = scry_core::http::router(simple_state());

    assert_eq!(get_path(&router, "/api/healthz").await.status(), StatusCode::OK);
    assert_eq!(get_path(&router, "/health/live").await.status(), StatusCode::OK);

    let ready = get_path(&router, "/health/ready").await;
    assert_eq!(ready.status(), StatusCode::OK);
    let body = body_string(ready).await;
    assert!(body.contains("\"ready\":true"));

    let full = get_path(&router, "/health").await;
    assert_eq!(full.status(), StatusCode::OK);
    let body = body_string(full).await;
    assert!(body.contains("\"checks\""));
    assert!(body.contains("upstream_pool"));
}

#[tokio::test]
async fn metrics_are_exposed_in_text_format() {
    let router = scry_core::http::router(simple_state());
    let response = get_path(&router, "/metrics").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let body = body_string(response).await;
    assert!(body.contains("# HELP scry_uptime_seconds"));
    assert!(body.contains("scry_widgets_total 1"));
}

#[tokio::test]
async fn manifest_is_served() {
    let router = scry_core::http::router(simple_state());
    let response = get_path(&router, "/manifest.json").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("\"start_url\":\"/\""));
}

// =============================================================================
// Theme & widget API
// =============================================================================

#[tokio::test]
async fn theme_endpoint_sets_the_cookie() {
    let router = scry_core::http::router(simple_state());
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/set-theme/dark")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let cookie = response.headers().get(header::SET_COOKIE).unwrap();
    assert!(cookie.to_str().unwrap().starts_with("scry_theme=dark"));
}

#[tokio::test]
async fn widget_api_dispatches_to_the_widget() {
    let target = spawn_probe_target().await;
    let state = state_from_yaml(&format!(
        "
pages:
  - name: Dash
    slug: dash
    columns:
      - size: full
        widgets:
          - type: probe
            url: {target}
"
    ));
    let id = *state.snapshot.load().widgets.keys().next().unwrap();
    let router = scry_core::http::router(state);

    let known = get_path(&router, &format!("/api/widgets/{id}/history")).await;
    assert_eq!(known.status(), StatusCode::OK);
    let body = body_string(known).await;
    assert!(body.contains("samples"));

    let unknown_path = get_path(&router, &format!("/api/widgets/{id}/nothing")).await;
    assert_eq!(unknown_path.status(), StatusCode::NOT_FOUND);

    let unknown_widget = get_path(&router, "/api/widgets/999999/history").await;
    assert_eq!(unknown_widget.status(), StatusCode::NOT_FOUND);
}

// =============================================================================
// Webhook intake
// =============================================================================

#[tokio::test]
#[serial]
async fn webhook_intake_verifies_and_acknowledges() {
    std::env::set_var("WEBHOOK_SECRET", "whsec_http_test");
    let router = scry_core::http::router(simple_state());
    std::env::remove_var("WEBHOOK_SECRET");

    let body = br#"{"id":"evt_42","type":"customer.subscription.created","livemode":false,"data":{"object":{"id":"sub_1","status":"active","created":1,"customer":"cus_1","items":{"data":[]}}}}"#;

    // Wrong method.
    let get_attempt = get_path(&router, "/webhook/billing").await;
    assert_eq!(get_attempt.status(), StatusCode::METHOD_NOT_ALLOWED);

    // Bad signature.
    let rejected = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/billing")
                .header(SIGNATURE_HEADER, "t=0,v1=deadbeef")
                .body(Body::from(&body[..]))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);

    // Valid signature.
    let signature = WebhookDispatcher::sign(
        "whsec_http_test",
        body,
        chrono::Utc::now().timestamp(),
    );
    let accepted = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/billing")
                .header(SIGNATURE_HEADER, signature)
                .body(Body::from(&body[..]))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::OK);
    let body = body_string(accepted).await;
    assert!(body.contains("\"received\":true"));
    assert!(body.contains("evt_42"));

    // The async handler records the event in the bounded log.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let events = get_path(&router, "/api/webhook-events").await;
    let body = body_string(events).await;
    assert!(body.contains("evt_42"), "event log should record the event: {body}");
}

// =============================================================================
// Auth
// =============================================================================

fn auth_state() -> AppState {
    let hash = bcrypt::hash("hunter42", 4).unwrap();
    state_from_yaml(&format!(
        "
auth:
  secret-key: a-long-session-secret-for-tests
  users:
    admin:
      password-hash: '{hash}'
pages:
  - name: Dash
    slug: dash
    columns:
      - size: full
        widgets:
          - type: html
            source: '<p>secret dashboard</p>'
"
    ))
}

#[tokio::test]
async fn unauthenticated_requests_redirect_to_login() {
    let router = scry_core::http::router(auth_state());

    for path in ["/", "/dash", "/api/pages/dash/content"] {
        let response = get_path(&router, path).await;
        assert_eq!(response.status(), StatusCode::FOUND, "{path}");
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/login",
            "{path}"
        );
    }

    // Health endpoints stay open for orchestrators.
    assert_eq!(get_path(&router, "/health/live").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn login_issues_a_session_cookie_that_unlocks_pages() {
    let router = scry_core::http::router(auth_state());

    let login = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/login")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("username=admin&password=hunter42"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(login.status(), StatusCode::SEE_OTHER);
    let cookie = login
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();

    let page = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/dash")
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(page.status(), StatusCode::OK);
    assert!(body_string(page).await.contains("secret dashboard"));
}

#[tokio::test]
async fn bad_credentials_are_rejected() {
    let router = scry_core::http::router(auth_state());
    let login = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/login")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("username=admin&password=wrong"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(login.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn tampered_session_cookies_are_rejected() {
    let router = scry_core::http::router(auth_state());
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/dash")
                .header(header::COOKIE, "scry_session=abc:123:def")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
}
