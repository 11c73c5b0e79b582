// Static content widget
//
// Renders trusted inline HTML or an iframe verbatim. Never refreshes.

use super::{escape_html, RefreshContext, Widget, WidgetBase};
use crate::config::ConfigError;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct HtmlOptions {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    iframe_url: Option<String>,
    #[serde(default)]
    iframe_height: Option<u32>,
}

pub struct HtmlWidget {
    base: WidgetBase,
    fragment: String,
}

impl HtmlWidget {
    pub fn from_config(id: u64, options: serde_yaml::Value) -> Result<Self, ConfigError> {
        let options: HtmlOptions = serde_yaml::from_value(options)
            .map_err(|e| ConfigError::Invalid(format!("html widget: {e}")))?;

        let fragment = match (&options.source, &options.iframe_url) {
            (Some(source), None) => source.clone(),
            (None, Some(url)) => {
                reqwest::Url::parse(url)
                    .map_err(|e| ConfigError::Invalid(format!("html widget: invalid iframe url: {e}")))?;
                let height = options.iframe_height.unwrap_or(300);
                format!(
                    "<iframe src=\"{}\" height=\"{height}\" loading=\"lazy\"></iframe>",
                    escape_html(url)
                )
            }
            _ => {
                return Err(ConfigError::Invalid(
                    "html widget: exactly one of 'source' or 'iframe-url' is required".to_string(),
                ))
            }
        };

        let mut base = WidgetBase::new(id, "html");
        base.default_title("Custom");

        Ok(Self { base, fragment })
    }
}

#[async_trait]
impl Widget for HtmlWidget {
    fn base(&self) -> &WidgetBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WidgetBase {
        &mut self.base
    }

    async fn refresh(&mut self, _cx: &RefreshContext) {}

    fn render(&self) -> String {
        self.fragment.clone()
    }
}
