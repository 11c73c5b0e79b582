// HTTP surface
//
// Axum router over the active application snapshot: page rendering,
// partial-content refreshes, health and metrics endpoints, webhook intake,
// static assets, and the optional session-cookie login flow.

pub mod auth;

use crate::app::{AppSnapshot, AppState, ColumnSize, Page};
use crate::health::{HealthStatus, MetricsInput};
use crate::schedule::refresh_stale;
use crate::webhook::{WebhookError, SIGNATURE_HEADER};
use crate::widgets::escape_html;
use crate::ScryError;
use auth::{AuthError, SESSION_COOKIE};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Component;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::warn;

const THEME_COOKIE: &str = "scry_theme";
const STATIC_CACHE_CONTROL: &str = "public, max-age=86400";

/// Serve the router until the shutdown signal fires; in-flight requests
/// drain gracefully.
pub async fn serve(
    state: AppState,
    listener: tokio::net::TcpListener,
    shutdown: oneshot::Receiver<()>,
) -> crate::Result<()> {
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = shutdown.await;
    })
    .await
    .map_err(|e| ScryError::Server(e.to_string()))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/login", get(login_page_handler).post(login_submit_handler))
        .route("/logout", get(logout_handler))
        .route("/api/healthz", get(healthz_handler))
        .route("/health/live", get(health_live_handler))
        .route("/health/ready", get(health_ready_handler))
        .route("/health", get(health_full_handler))
        .route("/metrics", get(metrics_handler))
        .route("/manifest.json", get(manifest_handler))
        .route("/api/set-theme/:key", post(set_theme_handler))
        .route("/api/pages/:slug/content", get(page_content_handler))
        .route("/api/widgets/:id/*rest", get(widget_api_handler))
        .route("/api/webhook-events", get(webhook_events_handler))
        .route("/webhook/:provider", post(webhook_intake_handler))
        .route("/static/:hash/*path", get(static_asset_handler))
        .route("/:slug", get(page_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Auth plumbing
// ---------------------------------------------------------------------------

fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.split(';')
                .filter_map(|pair| {
                    let (name, value) = pair.trim().split_once('=')?;
                    Some((name.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// 302 to the login page, per the session-cookie contract.
fn login_redirect() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, "/login")]).into_response()
}

/// True when the request may see protected content.
fn authorized(snapshot: &AppSnapshot, headers: &HeaderMap) -> bool {
    match &snapshot.auth {
        None => true,
        Some(auth) => parse_cookies(headers)
            .get(SESSION_COOKIE)
            .map(|cookie| auth.verify_cookie(cookie, Utc::now()))
            .unwrap_or(false),
    }
}

fn client_ip(
    snapshot: &AppSnapshot,
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
) -> IpAddr {
    if snapshot.document.server.proxied {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok())
        {
            return forwarded;
        }
    }
    connect_info
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

// ---------------------------------------------------------------------------
// Pages
// ---------------------------------------------------------------------------

async fn index_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let snapshot = state.snapshot.load_full();
    if !authorized(&snapshot, &headers) {
        return login_redirect();
    }
    let Some(page) = snapshot.first_page().cloned() else {
        return (StatusCode::NOT_FOUND, "no pages configured").into_response();
    };
    render_page(&state, &snapshot, &page).await.into_response()
}

async fn page_handler(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> Response {
    let snapshot = state.snapshot.load_full();
    if !authorized(&snapshot, &headers) {
        return login_redirect();
    }
    let Some(page) = snapshot.slugs.get(&slug).cloned() else {
        return (StatusCode::NOT_FOUND, "page not found").into_response();
    };
    render_page(&state, &snapshot, &page).await.into_response()
}

async fn page_content_handler(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> Response {
    let snapshot = state.snapshot.load_full();
    if !authorized(&snapshot, &headers) {
        return login_redirect();
    }
    let Some(page) = snapshot.slugs.get(&slug).cloned() else {
        return (StatusCode::NOT_FOUND, "page not found").into_response();
    };

    let cells = page.widgets();
    refresh_stale(&cells, &state.cx).await;

    let mut fragments = String::new();
    for cell in &cells {
        fragments.push_str(&cell.render().await);
    }
    Html(fragments).into_response()
}

async fn render_page(state: &AppState, snapshot: &AppSnapshot, page: &Arc<Page>) -> Html<String> {
    let cells = page.widgets();
    refresh_stale(&cells, &state.cx).await;

    let theme = &snapshot.document.theme;
    let branding = &snapshot.document.branding;

    let mut css_vars = String::new();
    if let Some(color) = &theme.background_color {
        css_vars.push_str(&format!("--color-background: {};", color.css()));
    }
    if let Some(color) = &theme.primary_color {
        css_vars.push_str(&format!("--color-primary: {};", color.css()));
    }
    if let Some(color) = &theme.positive_color {
        css_vars.push_str(&format!("--color-positive: {};", color.css()));
    }
    if let Some(color) = &theme.negative_color {
        css_vars.push_str(&format!("--color-negative: {};", color.css()));
    }

    let mut out = String::from("<!DOCTYPE html><html lang=\"en\"");
    if theme.light {
        out.push_str(" data-scheme=\"light\"");
    }
    out.push_str("><head><meta charset=\"utf-8\">");
    out.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">");
    out.push_str(&format!("<title>{}</title>", escape_html(&page.name)));
    if let Some(favicon) = &branding.favicon_url {
        out.push_str(&format!(
            "<link rel=\"icon\" href=\"{}\">",
            escape_html(favicon)
        ));
    }
    out.push_str(&format!(
        "<link rel=\"stylesheet\" href=\"/static/{}/main.css\">",
        snapshot.content_hash
    ));
    if !css_vars.is_empty() {
        out.push_str(&format!("<style>:root{{{css_vars}}}</style>"));
    }
    if let Some(head_html) = &snapshot.document.document.head_html {
        out.push_str(head_html);
    }
    out.push_str("</head><body><header class=\"site-header\">");

    match (&branding.logo_url, &branding.logo_text) {
        (Some(url), _) => out.push_str(&format!(
            "<img class=\"logo\" src=\"{}\" alt=\"logo\">",
            escape_html(url)
        )),
        (None, Some(text)) => {
            out.push_str(&format!("<span class=\"logo\">{}</span>", escape_html(text)))
        }
        _ => {}
    }

    out.push_str("<nav>");
    for nav_page in &snapshot.pages {
        let class = if nav_page.slug == page.slug {
            " class=\"active\""
        } else {
            ""
        };
        out.push_str(&format!(
            "<a href=\"/{}\"{class}>{}</a>",
            escape_html(&nav_page.slug),
            escape_html(&nav_page.name)
        ));
    }
    out.push_str("</nav></header><main class=\"page\" data-slug=\"");
    out.push_str(&escape_html(&page.slug));
    out.push_str("\">");

    for column in &page.columns {
        let size = match column.size {
            ColumnSize::Small => "small",
            ColumnSize::Full => "full",
        };
        out.push_str(&format!("<div class=\"column column-{size}\">"));
        for cell in &column.widgets {
            out.push_str(&cell.render().await);
        }
        out.push_str("</div>");
    }

    out.push_str("</main>");
    if !branding.hide_footer {
        out.push_str(&format!(
            "<footer>scry v{}</footer>",
            crate::VERSION
        ));
    }
    out.push_str("</body></html>");
    Html(out)
}

// ---------------------------------------------------------------------------
// Health & metrics
// ---------------------------------------------------------------------------

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn health_live_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "alive": true,
        "uptime_seconds": state.started.elapsed().as_secs(),
    }))
}

async fn health_ready_handler(State(state): State<AppState>) -> Response {
    let document = state.health.run_checks().await;
    let ready = document.status == HealthStatus::Healthy;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({"ready": ready, "status": document.status})),
    )
        .into_response()
}

async fn health_full_handler(State(state): State<AppState>) -> Response {
    let document = state.health.run_checks().await;
    let status = if document.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(document)).into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.snapshot.load();
    let input = MetricsInput {
        uptime_seconds: state.started.elapsed().as_secs(),
        widget_count: snapshot.widgets.len(),
        pool: state.cx.pool.metrics(),
        store: state.cx.store.stats().await,
        webhook_events: state.webhooks.event_log().len(),
    };
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::health::render_metrics(&input),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Widget API, theme, manifest
// ---------------------------------------------------------------------------

async fn widget_api_handler(
    State(state): State<AppState>,
    Path((id, rest)): Path<(u64, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let snapshot = state.snapshot.load_full();
    if !authorized(&snapshot, &headers) {
        return login_redirect();
    }
    let Some(cell) = snapshot.widgets.get(&id) else {
        return (StatusCode::NOT_FOUND, "unknown widget").into_response();
    };
    match cell.handle_api(rest.trim_matches('/'), &query).await {
        Some(body) => Json(body).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown widget endpoint").into_response(),
    }
}

async fn set_theme_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    let snapshot = state.snapshot.load_full();
    if !authorized(&snapshot, &headers) {
        return login_redirect();
    }
    if key.is_empty() || key.len() > 32 || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return (StatusCode::BAD_REQUEST, "invalid theme key").into_response();
    }
    (
        StatusCode::NO_CONTENT,
        [(
            header::SET_COOKIE,
            format!("{THEME_COOKIE}={key}; Path=/; Max-Age=31536000; SameSite=Lax"),
        )],
    )
        .into_response()
}

async fn manifest_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.snapshot.load();
    let name = snapshot
        .document
        .branding
        .logo_text
        .clone()
        .unwrap_or_else(|| "Scry".to_string());
    Json(serde_json::json!({
        "name": name,
        "short_name": name,
        "start_url": "/",
        "display": "standalone",
        "background_color": "#151519",
        "theme_color": "#151519",
    }))
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

async fn webhook_intake_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match state.webhooks.ingest(signature, &body, Utc::now()) {
        Ok(event_id) => Json(serde_json::json!({
            "received": true,
            "event_id": event_id,
        }))
        .into_response(),
        Err(WebhookError::Signature) => {
            (StatusCode::UNAUTHORIZED, "invalid signature").into_response()
        }
        Err(WebhookError::Payload(reason)) => {
            warn!(target: "webhook", provider = %provider, reason = %reason, "bad webhook payload");
            (StatusCode::BAD_REQUEST, "unparseable event").into_response()
        }
    }
}

async fn webhook_events_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let snapshot = state.snapshot.load_full();
    if !authorized(&snapshot, &headers) {
        return login_redirect();
    }
    let events = state.webhooks.event_log();
    Json(serde_json::json!({
        "total_events": events.len(),
        "recent_events": events,
    }))
    .into_response()
}

// ---------------------------------------------------------------------------
// Static assets
// ---------------------------------------------------------------------------

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or_default() {
        "html" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

async fn static_asset_handler(
    State(state): State<AppState>,
    Path((_hash, path)): Path<(String, String)>,
) -> Response {
    let snapshot = state.snapshot.load_full();
    let Some(assets_path) = &snapshot.document.server.assets_path else {
        return (StatusCode::NOT_FOUND, "no assets directory configured").into_response();
    };

    let relative = std::path::Path::new(&path);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }

    match tokio::fs::read(assets_path.join(relative)).await {
        Ok(body) => (
            [
                (header::CONTENT_TYPE, content_type_for(&path)),
                (header::CACHE_CONTROL, STATIC_CACHE_CONTROL),
            ],
            body,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

fn login_page(error: Option<&str>) -> Html<String> {
    let notice = error
        .map(|e| format!("<p class=\"login-error\">{}</p>", escape_html(e)))
        .unwrap_or_default();
    Html(format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Sign in</title></head><body><form class=\"login\" method=\"post\" action=\"/login\">{notice}<label>Username <input name=\"username\" autocomplete=\"username\"></label><label>Password <input name=\"password\" type=\"password\" autocomplete=\"current-password\"></label><button type=\"submit\">Sign in</button></form></body></html>"
    ))
}

async fn login_page_handler(State(state): State<AppState>) -> Response {
    if state.snapshot.load().auth.is_none() {
        return Redirect::to("/").into_response();
    }
    login_page(None).into_response()
}

async fn login_submit_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    let snapshot = state.snapshot.load_full();
    let Some(auth) = &snapshot.auth else {
        return Redirect::to("/").into_response();
    };

    let remote = client_ip(&snapshot, &headers, connect_info.as_ref());
    match auth.check_login(&form.username, &form.password, remote, Utc::now()) {
        Ok(cookie) => (
            [(
                header::SET_COOKIE,
                format!("{SESSION_COOKIE}={cookie}; Path=/; HttpOnly; SameSite=Lax"),
            )],
            Redirect::to("/"),
        )
            .into_response(),
        Err(AuthError::RateLimited) => (
            StatusCode::TOO_MANY_REQUESTS,
            login_page(Some("Too many failed attempts, try again later")),
        )
            .into_response(),
        Err(AuthError::BadCredentials) => (
            StatusCode::UNAUTHORIZED,
            login_page(Some("Invalid username or password")),
        )
            .into_response(),
    }
}

async fn logout_handler() -> Response {
    (
        [(
            header::SET_COOKIE,
            format!("{SESSION_COOKIE}=; Path=/; HttpOnly; Max-Age=0"),
        )],
        Redirect::to("/login"),
    )
        .into_response()
}
