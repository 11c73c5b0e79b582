// Application assembly
//
// Materializes a validated config document into an immutable application
// snapshot, owns the composition-root singletons, and runs the serve loop
// with atomic snapshot swaps on config reload. In-flight requests keep the
// snapshot Arc they started with.

use crate::config::{self, ColumnSizeConfig, Document, Loaded};
use crate::health::HealthChecker;
use crate::http::auth::AuthRuntime;
use crate::schedule::{CacheInvalidator, RefreshContext, WidgetCell};
use crate::secrets::{SecretStore, SecretString};
use crate::snapshots::{MemorySnapshotStore, SnapshotStore};
use crate::upstream::ClientPool;
use crate::webhook::WebhookDispatcher;
use crate::{Result, ScryError};
use arc_swap::ArcSwap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const CLIENT_MAX_IDLE: Duration = Duration::from_secs(30 * 60);
const HEALTH_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const STORE_CLEANUP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
const STORE_RETENTION: Duration = Duration::from_secs(90 * 24 * 60 * 60);
const RELOAD_SETTLE: Duration = Duration::from_millis(300);

static NEXT_WIDGET_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnSize {
    Small,
    Full,
}

pub struct Column {
    pub size: ColumnSize,
    pub widgets: Vec<Arc<WidgetCell>>,
}

pub struct Page {
    pub name: String,
    pub slug: String,
    pub columns: Vec<Column>,
}

impl Page {
    pub fn widgets(&self) -> Vec<Arc<WidgetCell>> {
        self.columns
            .iter()
            .flat_map(|column| column.widgets.iter().cloned())
            .collect()
    }
}

/// Immutable product of one successful config load.
pub struct AppSnapshot {
    pub document: Document,
    pub pages: Vec<Arc<Page>>,
    pub slugs: HashMap<String, Arc<Page>>,
    pub widgets: HashMap<u64, Arc<WidgetCell>>,
    pub auth: Option<AuthRuntime>,
    pub content_hash: String,
}

impl AppSnapshot {
    /// Materialize a loaded document: construct widget instances, compose
    /// pages, and compute the static-asset content hash.
    pub fn materialize(loaded: &Loaded) -> Result<Self> {
        let document = loaded.document.clone();
        let mut pages = Vec::new();
        let mut slugs = HashMap::new();
        let mut widgets = HashMap::new();

        for page_config in &document.pages {
            let mut columns = Vec::new();
            for column_config in &page_config.columns {
                let mut cells = Vec::new();
                for widget_value in &column_config.widgets {
                    let node = config::widget_node(widget_value)?;
                    let id = NEXT_WIDGET_ID.fetch_add(1, Ordering::Relaxed);
                    let widget = crate::widgets::build_widget(
                        &node.kind,
                        id,
                        node.title,
                        node.title_url,
                        node.cache,
                        node.options,
                    )?;
                    let cell = Arc::new(WidgetCell::new(widget));
                    widgets.insert(id, cell.clone());
                    cells.push(cell);
                }
                columns.push(Column {
                    size: match column_config.size {
                        ColumnSizeConfig::Small => ColumnSize::Small,
                        ColumnSizeConfig::Full => ColumnSize::Full,
                    },
                    widgets: cells,
                });
            }

            let page = Arc::new(Page {
                name: page_config.name.clone(),
                slug: config::page_slug(page_config),
                columns,
            });
            slugs.insert(page.slug.clone(), page.clone());
            pages.push(page);
        }

        let mut hasher = Sha256::new();
        hasher.update(loaded.contents.as_bytes());
        let digest = hasher.finalize();
        let content_hash: String = digest.iter().take(5).map(|b| format!("{b:02x}")).collect();

        let auth = document.auth.as_ref().map(AuthRuntime::new);

        Ok(Self {
            document,
            pages,
            slugs,
            widgets,
            auth,
            content_hash,
        })
    }

    pub fn first_page(&self) -> Option<&Arc<Page>> {
        self.pages.first()
    }
}

/// Marks widget caches stale by kind against whatever snapshot is live.
pub struct SnapshotInvalidator {
    snapshot: Arc<ArcSwap<AppSnapshot>>,
}

impl CacheInvalidator for SnapshotInvalidator {
    fn invalidate(&self, kind: &str) {
        let snapshot = self.snapshot.load();
        let mut hit = 0usize;
        for cell in snapshot.widgets.values() {
            if cell.kind == kind {
                cell.invalidate();
                hit += 1;
            }
        }
        info!(target: "schedule", kind, widgets = hit, "invalidated widget caches");
    }
}

/// Shared handler state for the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub snapshot: Arc<ArcSwap<AppSnapshot>>,
    pub cx: Arc<RefreshContext>,
    pub health: Arc<HealthChecker>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub started: Instant,
}

/// Log configuration problems that only bite in production.
pub fn validate_environment(document: &Document) {
    match std::env::var("MASTER_KEY") {
        Ok(key) if key.len() >= 32 => {}
        Ok(key) => warn!(
            target: "app",
            length = key.len(),
            "MASTER_KEY is shorter than the recommended 32 characters"
        ),
        Err(_) => warn!(
            target: "app",
            "MASTER_KEY not set, encrypted credentials use an insecure development key"
        ),
    }

    let has_billing_widgets = document.pages.iter().any(|page| {
        page.columns.iter().any(|column| {
            column.widgets.iter().any(|widget| {
                config::widget_node(widget)
                    .map(|node| node.kind == "revenue" || node.kind == "customers")
                    .unwrap_or(false)
            })
        })
    });
    if has_billing_widgets && std::env::var("WEBHOOK_SECRET").is_err() {
        warn!(
            target: "app",
            "WEBHOOK_SECRET not set, real-time cache invalidation will not work"
        );
    }
}

fn listen_addr(document: &Document) -> String {
    format!("{}:{}", document.server.host, document.server.port)
}

/// Construct the composition-root singletons around a snapshot slot and
/// start their background tasks.
pub fn build_state(snapshot: Arc<ArcSwap<AppSnapshot>>) -> AppState {
    let secrets = Arc::new(SecretStore::from_env());
    let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::default());
    let pool = Arc::new(ClientPool::new());
    let http = reqwest::Client::builder()
        .user_agent(concat!("scry-dashboard/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    let cx = Arc::new(RefreshContext {
        pool: pool.clone(),
        store: store.clone(),
        secrets,
        http,
    });

    let invalidator = Arc::new(SnapshotInvalidator {
        snapshot: snapshot.clone(),
    });
    let webhook_secret = std::env::var("WEBHOOK_SECRET").ok().map(SecretString::new);
    let webhooks = Arc::new(WebhookDispatcher::with_default_handlers(
        webhook_secret,
        invalidator,
        store.clone(),
    ));

    let health = Arc::new(HealthChecker::with_defaults(pool.clone(), store.clone()));

    pool.spawn_idle_sweeper(SWEEP_INTERVAL, CLIENT_MAX_IDLE);
    health.spawn_periodic(HEALTH_SWEEP_INTERVAL);
    {
        let store = store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STORE_CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.cleanup(STORE_RETENTION).await;
            }
        });
    }

    AppState {
        snapshot,
        cx,
        health,
        webhooks,
        started: Instant::now(),
    }
}

struct ServerTask {
    shutdown: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

async fn spawn_server(state: AppState, addr: &str) -> Result<ServerTask> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ScryError::Server(format!("cannot bind {addr}: {e}")))?;
    info!(target: "app", addr, "dashboard server listening");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        if let Err(e) = crate::http::serve(state, listener, shutdown_rx).await {
            error!(target: "app", error = %e, "server exited with error");
        }
    });

    Ok(ServerTask {
        shutdown: shutdown_tx,
        task,
    })
}

/// Load the configuration, start serving, and keep reloading on changes.
/// The first load failing is fatal; later failures keep the running
/// snapshot in service.
pub async fn run(config_path: &Path) -> Result<()> {
    let loaded = config::load(config_path)?;
    validate_environment(&loaded.document);

    let snapshot = Arc::new(ArcSwap::from_pointee(AppSnapshot::materialize(&loaded)?));
    let state = build_state(snapshot.clone());

    let (reload_tx, mut reload_rx) = mpsc::channel::<()>(1);
    let mut watcher = match config::watch::watch_files(&loaded.watch_paths, reload_tx.clone()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(
                target: "app",
                error = %e,
                "config watcher unavailable, changes require a restart"
            );
            None
        }
    };

    let mut current_addr = listen_addr(&loaded.document);
    let mut server = spawn_server(state.clone(), &current_addr).await?;

    while reload_rx.recv().await.is_some() {
        // Let editors finish writing before re-reading the file set.
        tokio::time::sleep(RELOAD_SETTLE).await;
        while reload_rx.try_recv().is_ok() {}

        info!(target: "app", "config change detected, reloading");

        let loaded = match config::load(config_path) {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(target: "app", error = %e, "config reload failed, keeping running snapshot");
                continue;
            }
        };
        let new_snapshot = match AppSnapshot::materialize(&loaded) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(target: "app", error = %e, "config reload failed, keeping running snapshot");
                continue;
            }
        };

        snapshot.store(Arc::new(new_snapshot));

        // Re-arm the watcher: the include set may have changed.
        match config::watch::watch_files(&loaded.watch_paths, reload_tx.clone()) {
            Ok(new_watcher) => watcher = Some(new_watcher),
            Err(e) => warn!(target: "app", error = %e, "could not re-arm config watcher"),
        }

        let new_addr = listen_addr(&loaded.document);
        if new_addr != current_addr {
            info!(
                target: "app",
                from = %current_addr,
                to = %new_addr,
                "listen address changed, rebinding"
            );
            let _ = server.shutdown.send(());
            let _ = server.task.await;
            server = spawn_server(state.clone(), &new_addr).await?;
            current_addr = new_addr;
        }

        info!(target: "app", "configuration reloaded");
    }

    drop(watcher);
    let _ = server.shutdown.send(());
    let _ = server.task.await;
    Ok(())
}
