// HTTP probe widget
//
// Samples one target per refresh and keeps a rolling availability window.
// Probes do not retry: a failed sample is a data point, so the upstream
// handle is created with a zero retry budget and breaker trips reflect
// consecutive bad samples.

use super::{escape_html, CachePolicy, RefreshContext, Widget, WidgetBase};
use crate::config::ConfigError;
use crate::upstream::CallError;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const DEFAULT_CACHE: Duration = Duration::from_secs(60);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const WINDOW_LEN: usize = 50;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct ProbeOptions {
    url: String,
    /// Exact status to expect; any status below 400 passes when unset.
    #[serde(default)]
    expect_status: Option<u16>,
    #[serde(default)]
    timeout: Option<String>,
}

pub struct ProbeWidget {
    base: WidgetBase,
    url: String,
    expect_status: Option<u16>,
    timeout: Duration,
    up: Option<bool>,
    last_status: Option<u16>,
    response_ms: Option<u64>,
    window: VecDeque<bool>,
}

impl ProbeWidget {
    pub fn from_config(id: u64, options: serde_yaml::Value) -> Result<Self, ConfigError> {
        let options: ProbeOptions = serde_yaml::from_value(options)
            .map_err(|e| ConfigError::Invalid(format!("probe widget: {e}")))?;

        reqwest::Url::parse(&options.url)
            .map_err(|e| ConfigError::Invalid(format!("probe widget: invalid url: {e}")))?;

        let timeout = match &options.timeout {
            Some(raw) => crate::config::parse_duration(raw)
                .map_err(|e| ConfigError::Invalid(format!("probe widget: {e}")))?,
            None => DEFAULT_TIMEOUT,
        };

        let mut base = WidgetBase::new(id, "probe");
        base.default_title("Monitor");
        base.title_url = Some(options.url.clone());
        base.with_cache(CachePolicy::After(DEFAULT_CACHE));

        Ok(Self {
            base,
            url: options.url,
            expect_status: options.expect_status,
            timeout,
            up: None,
            last_status: None,
            response_ms: None,
            window: VecDeque::with_capacity(WINDOW_LEN),
        })
    }

    fn record_sample(&mut self, up: bool) {
        if self.window.len() == WINDOW_LEN {
            self.window.pop_front();
        }
        self.window.push_back(up);
    }

    fn uptime_percent(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let up = self.window.iter().filter(|s| **s).count();
        Some(up as f64 / self.window.len() as f64 * 100.0)
    }
}

#[async_trait]
impl Widget for ProbeWidget {
    fn base(&self) -> &WidgetBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WidgetBase {
        &mut self.base
    }

    async fn refresh(&mut self, cx: &RefreshContext) {
        let handle = match cx.pool.handle_with_retries("probe", &self.url, "live", 0) {
            Ok(handle) => handle,
            Err(e) => {
                self.base.set_error(e.to_string());
                return;
            }
        };

        let http = cx.http.clone();
        let url = self.url.clone();
        let timeout = self.timeout;
        let expect = self.expect_status;

        let result = handle
            .execute("probe", || {
                let http = http.clone();
                let url = url.clone();
                async move {
                    let started = Instant::now();
                    let response = http
                        .get(&url)
                        .timeout(timeout)
                        .send()
                        .await
                        .map_err(|e| CallError::Transport(e.to_string()))?;
                    let elapsed = started.elapsed().as_millis() as u64;
                    let status = response.status().as_u16();

                    let ok = match expect {
                        Some(expected) => status == expected,
                        None => status < 400,
                    };
                    if ok {
                        Ok((status, elapsed))
                    } else {
                        Err(CallError::Status {
                            status,
                            message: "unexpected probe status".to_string(),
                        })
                    }
                }
            })
            .await;

        match result {
            Ok((status, elapsed)) => {
                self.up = Some(true);
                self.last_status = Some(status);
                self.response_ms = Some(elapsed);
                self.record_sample(true);
                self.base.clear_error();
            }
            Err(e) => {
                self.up = Some(false);
                self.record_sample(false);
                self.base.set_error(e.to_string());
            }
        }
    }

    fn render(&self) -> String {
        let (class, label) = match self.up {
            Some(true) => ("up", "Up"),
            Some(false) => ("down", "Down"),
            None => ("unknown", "Pending"),
        };
        let mut out = format!(
            "<div class=\"probe probe-{class}\"><span class=\"probe-status\">{label}</span>"
        );
        if let Some(ms) = self.response_ms {
            out.push_str(&format!("<span class=\"probe-latency\">{ms} ms</span>"));
        }
        if let Some(uptime) = self.uptime_percent() {
            out.push_str(&format!(
                "<span class=\"probe-uptime\">{uptime:.1}% uptime</span>"
            ));
        }
        out.push_str(&format!(
            "<span class=\"probe-target\">{}</span></div>",
            escape_html(&self.url)
        ));
        out
    }

    async fn handle_api(
        &self,
        path: &str,
        _query: &HashMap<String, String>,
    ) -> Option<serde_json::Value> {
        match path {
            "history" => Some(serde_json::json!({
                "url": self.url,
                "samples": self.window.iter().collect::<Vec<_>>(),
                "uptime_percent": self.uptime_percent(),
                "response_ms": self.response_ms,
                "status": self.last_status,
            })),
            _ => None,
        }
    }
}
