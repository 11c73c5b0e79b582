// Code-forge releases widget
//
// Latest release per configured repository, fetched from the forge API
// through the upstream fabric. A token unlocks private repositories and
// higher rate limits.

use super::{escape_html, CachePolicy, RefreshContext, Widget, WidgetBase};
use crate::config::ConfigError;
use crate::upstream::CallError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

const DEFAULT_CACHE: Duration = Duration::from_secs(60 * 60);
const DEFAULT_API_URL: &str = "https://api.github.com";

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct ReleasesOptions {
    repositories: Vec<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default = "default_api_url")]
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseResponse {
    tag_name: String,
    html_url: String,
    published_at: Option<DateTime<Utc>>,
}

struct Release {
    repository: String,
    tag: String,
    url: String,
    published: Option<DateTime<Utc>>,
}

pub struct ReleasesWidget {
    base: WidgetBase,
    repositories: Vec<String>,
    token: Option<String>,
    api_url: String,
    releases: Vec<Release>,
}

impl ReleasesWidget {
    pub fn from_config(id: u64, options: serde_yaml::Value) -> Result<Self, ConfigError> {
        let options: ReleasesOptions = serde_yaml::from_value(options)
            .map_err(|e| ConfigError::Invalid(format!("releases widget: {e}")))?;

        if options.repositories.is_empty() {
            return Err(ConfigError::Invalid(
                "releases widget: at least one repository is required".to_string(),
            ));
        }
        for repo in &options.repositories {
            if repo.split('/').count() != 2 {
                return Err(ConfigError::Invalid(format!(
                    "releases widget: repository '{repo}' must be 'owner/name'"
                )));
            }
        }

        let mut base = WidgetBase::new(id, "releases");
        base.default_title("Releases");
        base.with_cache(CachePolicy::After(DEFAULT_CACHE));

        Ok(Self {
            base,
            repositories: options.repositories,
            token: options.token,
            api_url: options.api_url.trim_end_matches('/').to_string(),
            releases: Vec::new(),
        })
    }
}

#[async_trait]
impl Widget for ReleasesWidget {
    fn base(&self) -> &WidgetBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WidgetBase {
        &mut self.base
    }

    async fn refresh(&mut self, cx: &RefreshContext) {
        let token = match &self.token {
            Some(raw) => match cx.secrets.decrypt_if_needed(raw) {
                Ok(token) => Some(token),
                Err(e) => {
                    self.base.set_error(e.to_string());
                    return;
                }
            },
            None => None,
        };

        let credential = token.clone().unwrap_or_else(|| "anonymous".to_string());
        let handle = match cx.pool.handle("forge", &credential, "live") {
            Ok(handle) => handle,
            Err(e) => {
                self.base.set_error(e.to_string());
                return;
            }
        };

        let mut releases = Vec::new();
        let mut failures = 0usize;

        for repository in &self.repositories {
            let http = cx.http.clone();
            let url = format!("{}/repos/{repository}/releases/latest", self.api_url);
            let token = token.clone();

            let result = handle
                .execute("latest_release", || {
                    let http = http.clone();
                    let url = url.clone();
                    let token = token.clone();
                    async move {
                        let mut request = http.get(&url);
                        if let Some(token) = &token {
                            request = request.bearer_auth(token);
                        }
                        let response = request
                            .send()
                            .await
                            .map_err(|e| CallError::Transport(e.to_string()))?;
                        let status = response.status();
                        if !status.is_success() {
                            return Err(CallError::Status {
                                status: status.as_u16(),
                                message: "forge API request failed".to_string(),
                            });
                        }
                        response
                            .json::<ReleaseResponse>()
                            .await
                            .map_err(|e| CallError::Transport(format!("invalid response body: {e}")))
                    }
                })
                .await;

            match result {
                Ok(release) => releases.push(Release {
                    repository: repository.clone(),
                    tag: release.tag_name,
                    url: release.html_url,
                    published: release.published_at,
                }),
                Err(e) => {
                    failures += 1;
                    warn!(
                        target: "widgets",
                        repository = %repository,
                        error = %e,
                        "release lookup failed"
                    );
                }
            }
        }

        if failures == self.repositories.len() {
            self.base.set_error("all release lookups failed");
            return;
        }

        releases.sort_by(|a, b| b.published.cmp(&a.published));
        self.releases = releases;
        self.base.clear_error();
    }

    fn render(&self) -> String {
        let mut out = String::from("<ul class=\"releases\">");
        for release in &self.releases {
            out.push_str(&format!(
                "<li class=\"release\"><a href=\"{}\">{}</a><span class=\"release-tag\">{}</span>",
                escape_html(&release.url),
                escape_html(&release.repository),
                escape_html(&release.tag)
            ));
            if let Some(published) = release.published {
                out.push_str(&format!(
                    "<time datetime=\"{}\">{}</time>",
                    published.to_rfc3339(),
                    published.format("%b %e, %Y")
                ));
            }
            out.push_str("</li>");
        }
        out.push_str("</ul>");
        out
    }
}
