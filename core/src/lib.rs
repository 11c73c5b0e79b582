// Scry core library
// Self-hosted dashboard runtime: widgets, refresh scheduling, config pipeline

pub mod app;
pub mod billing;
pub mod config;
pub mod health;
pub mod http;
pub mod schedule;
pub mod secrets;
pub mod snapshots;
pub mod upstream;
pub mod webhook;
pub mod widgets;

// Export core types
pub use app::{AppSnapshot, AppState, Column, ColumnSize, Page};
pub use health::{HealthChecker, HealthStatus};
pub use schedule::{CacheInvalidator, RefreshContext, WidgetCell};
pub use secrets::{SecretStore, SecretString};
pub use snapshots::{CustomerRecord, MemorySnapshotStore, RevenueRecord, SnapshotStore};
pub use upstream::{ClientPool, UpstreamError};
pub use webhook::WebhookDispatcher;
pub use widgets::Widget;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScryError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("secret error: {0}")]
    Secret(#[from] secrets::SecretError),

    #[error("upstream error: {0}")]
    Upstream(#[from] upstream::UpstreamError),

    #[error("widget error: {0}")]
    Widget(String),

    #[error("render error: {0}")]
    Render(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ScryError>;
