// Configuration pipeline
//
// Read with includes -> interpolate -> strict parse -> validate. The
// resulting document is materialized into an application snapshot by the
// app module; the watch module re-runs this pipeline on file changes.

mod include;
mod interpolate;
pub mod watch;

pub use include::read_with_includes;
pub use interpolate::{interpolate, interpolate_with_secrets_dir};

use crate::widgets::WIDGET_TYPES;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("include error: {0}")]
    Include(String),

    #[error("interpolation error: {0}")]
    Interpolation(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("watch error: {0}")]
    Watch(String),
}

/// URL segments that page slugs may not shadow.
pub static RESERVED_SLUGS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "login",
        "logout",
        "api",
        "static",
        "health",
        "healthz",
        "metrics",
        "webhook",
        "manifest.json",
    ]
    .into_iter()
    .collect()
});

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub proxied: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub assets_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            proxied: false,
            base_url: None,
            assets_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct UserConfig {
    pub password_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct AuthConfig {
    pub secret_key: String,
    pub users: HashMap<String, UserConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DocumentOptions {
    #[serde(default)]
    pub head_html: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Branding {
    #[serde(default)]
    pub logo_text: Option<String>,
    #[serde(default)]
    pub logo_url: Option<String>,
    #[serde(default)]
    pub favicon_url: Option<String>,
    #[serde(default)]
    pub hide_footer: bool,
}

/// An `H S L` color triplet, accepted as `"240 8 9"` or `"hsl(240, 8%, 9%)"`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HslColor {
    pub h: u16,
    pub s: u8,
    pub l: u8,
}

impl HslColor {
    pub fn css(&self) -> String {
        format!("hsl({}, {}%, {}%)", self.h, self.s, self.l)
    }
}

impl FromStr for HslColor {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let stripped = raw
            .trim()
            .strip_prefix("hsl(")
            .and_then(|s| s.strip_suffix(')'))
            .unwrap_or(raw);
        let parts: Vec<&str> = stripped
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|p| !p.is_empty())
            .map(|p| p.trim_end_matches('%'))
            .collect();
        if parts.len() != 3 {
            return Err(format!("'{raw}' is not an 'H S L' triplet"));
        }

        let h: u16 = parts[0].parse().map_err(|_| format!("bad hue in '{raw}'"))?;
        let s: u8 = parts[1]
            .parse()
            .map_err(|_| format!("bad saturation in '{raw}'"))?;
        let l: u8 = parts[2]
            .parse()
            .map_err(|_| format!("bad lightness in '{raw}'"))?;
        if h > 360 || s > 100 || l > 100 {
            return Err(format!("'{raw}' is out of range"));
        }
        Ok(Self { h, s, l })
    }
}

impl<'de> Deserialize<'de> for HslColor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Theme {
    #[serde(default)]
    pub light: bool,
    #[serde(default)]
    pub background_color: Option<HslColor>,
    #[serde(default)]
    pub primary_color: Option<HslColor>,
    #[serde(default)]
    pub positive_color: Option<HslColor>,
    #[serde(default)]
    pub negative_color: Option<HslColor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnSizeConfig {
    Small,
    Full,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ColumnConfig {
    pub size: ColumnSizeConfig,
    #[serde(default)]
    pub widgets: Vec<serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct PageConfig {
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    pub columns: Vec<ColumnConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Document {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub document: DocumentOptions,
    #[serde(default)]
    pub branding: Branding,
    #[serde(default)]
    pub theme: Theme,
    pub pages: Vec<PageConfig>,
}

/// A parsed config document plus everything the watcher needs.
pub struct Loaded {
    pub document: Document,
    pub contents: String,
    pub watch_paths: Vec<PathBuf>,
}

/// Run the full pipeline against a root config path.
pub fn load(path: &Path) -> Result<Loaded, ConfigError> {
    let (raw, watch_paths) = read_with_includes(path)?;
    let contents = interpolate(&raw)?;
    let document = parse_document(&contents)?;
    Ok(Loaded {
        document,
        contents,
        watch_paths,
    })
}

/// Parse and validate an already-expanded document.
pub fn parse_document(contents: &str) -> Result<Document, ConfigError> {
    let document: Document =
        serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(&document)?;
    Ok(document)
}

fn validate(document: &Document) -> Result<(), ConfigError> {
    if document.pages.is_empty() {
        return Err(ConfigError::Invalid(
            "at least one page is required".to_string(),
        ));
    }

    if let Some(base_url) = &document.server.base_url {
        reqwest::Url::parse(base_url)
            .map_err(|e| ConfigError::Invalid(format!("server.base-url: {e}")))?;
    }

    if let Some(auth) = &document.auth {
        if auth.secret_key.is_empty() {
            return Err(ConfigError::Invalid(
                "auth.secret-key must not be empty".to_string(),
            ));
        }
        if auth.users.is_empty() {
            return Err(ConfigError::Invalid(
                "auth.users must not be empty when auth is enabled".to_string(),
            ));
        }
        for (name, user) in &auth.users {
            if user.password_hash.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "auth user '{name}' has an empty password-hash"
                )));
            }
        }
    }

    let mut seen_slugs = HashSet::new();
    for page in &document.pages {
        if page.name.trim().is_empty() {
            return Err(ConfigError::Invalid("page name must not be empty".to_string()));
        }

        let slug = page_slug(page);
        if slug.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "page '{}' produces an empty slug",
                page.name
            )));
        }
        if RESERVED_SLUGS.contains(slug.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "page slug '{slug}' is reserved"
            )));
        }
        if !seen_slugs.insert(slug.clone()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate page slug '{slug}'"
            )));
        }

        if page.columns.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "page '{}' has no columns",
                page.name
            )));
        }
        for column in &page.columns {
            for widget in &column.widgets {
                widget_node(widget)?;
            }
        }
    }

    Ok(())
}

/// The effective slug of a page: the explicit one, or its name slugified.
pub fn page_slug(page: &PageConfig) -> String {
    match &page.slug {
        Some(slug) if !slug.is_empty() => slug.clone(),
        _ => slugify(&page.name),
    }
}

fn slugify(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect()
}

/// Common widget keys split away from type-specific options.
pub struct WidgetNode {
    pub kind: String,
    pub title: Option<String>,
    pub title_url: Option<String>,
    pub cache: Option<Duration>,
    pub options: serde_yaml::Value,
}

/// Pull the common keys out of a widget's YAML mapping and check the type
/// tag against the closed set. The remaining mapping is the widget's
/// type-specific options.
pub fn widget_node(value: &serde_yaml::Value) -> Result<WidgetNode, ConfigError> {
    let mapping = value
        .as_mapping()
        .ok_or_else(|| ConfigError::Invalid("widget entry must be a mapping".to_string()))?;

    let mut options = mapping.clone();
    let take = |options: &mut serde_yaml::Mapping, key: &str| -> Option<serde_yaml::Value> {
        options.remove(&serde_yaml::Value::String(key.to_string()))
    };

    let kind = take(&mut options, "type")
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| ConfigError::Invalid("widget is missing a 'type' tag".to_string()))?;
    if !WIDGET_TYPES.contains(&kind.as_str()) {
        return Err(ConfigError::Invalid(format!(
            "unknown widget type '{kind}' (expected one of {})",
            WIDGET_TYPES.join(", ")
        )));
    }

    let title = take(&mut options, "title").and_then(|v| v.as_str().map(str::to_string));
    let title_url = take(&mut options, "title-url").and_then(|v| v.as_str().map(str::to_string));
    let cache = match take(&mut options, "cache") {
        Some(v) => {
            let raw = v
                .as_str()
                .map(str::to_string)
                .or_else(|| v.as_u64().map(|n| n.to_string()))
                .ok_or_else(|| {
                    ConfigError::Invalid("widget 'cache' must be a duration".to_string())
                })?;
            Some(parse_duration(&raw)?)
        }
        None => None,
    };

    Ok(WidgetNode {
        kind,
        title,
        title_url,
        cache,
        options: serde_yaml::Value::Mapping(options),
    })
}

/// Parse `30s` / `5m` / `12h` / `1d` durations; a bare number is seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ConfigError::Invalid("empty duration".to_string()));
    }

    let (number, unit) = match raw.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&raw[..idx], Some(c)),
        _ => (raw, None),
    };
    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid duration '{raw}'")))?;

    let seconds = match unit {
        None | Some('s') => value,
        Some('m') => value * 60,
        Some('h') => value * 60 * 60,
        Some('d') => value * 60 * 60 * 24,
        Some(other) => {
            return Err(ConfigError::Invalid(format!(
                "invalid duration unit '{other}' in '{raw}'"
            )))
        }
    };
    Ok(Duration::from_secs(seconds))
}
