// Host statistics widget
//
// CPU, memory, and disk usage for the machine the dashboard runs on.

use super::{escape_html, CachePolicy, RefreshContext, Widget, WidgetBase};
use crate::config::ConfigError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use sysinfo::{Disks, System};

const DEFAULT_CACHE: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct HostOptions {
    /// Restrict disk reporting to these mountpoints; all when empty.
    #[serde(default)]
    mountpoints: Vec<String>,
}

struct DiskUsage {
    mountpoint: String,
    used: u64,
    total: u64,
}

pub struct HostWidget {
    base: WidgetBase,
    mountpoints: Vec<String>,
    system: System,
    cpu_percent: Option<f32>,
    memory_used: u64,
    memory_total: u64,
    disks: Vec<DiskUsage>,
}

impl HostWidget {
    pub fn from_config(id: u64, options: serde_yaml::Value) -> Result<Self, ConfigError> {
        let options: HostOptions = serde_yaml::from_value(options)
            .map_err(|e| ConfigError::Invalid(format!("host widget: {e}")))?;

        let mut base = WidgetBase::new(id, "host");
        base.default_title("Host");
        base.with_cache(CachePolicy::After(DEFAULT_CACHE));

        Ok(Self {
            base,
            mountpoints: options.mountpoints,
            system: System::new(),
            cpu_percent: None,
            memory_used: 0,
            memory_total: 0,
            disks: Vec::new(),
        })
    }
}

fn megabytes(bytes: u64) -> u64 {
    bytes / 1024 / 1024
}

#[async_trait]
impl Widget for HostWidget {
    fn base(&self) -> &WidgetBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WidgetBase {
        &mut self.base
    }

    async fn refresh(&mut self, _cx: &RefreshContext) {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        // CPU usage needs two samples; the first refresh reports memory only.
        if self.base.last_refresh.is_some() {
            self.cpu_percent = Some(self.system.global_cpu_info().cpu_usage());
        }
        self.memory_used = self.system.used_memory();
        self.memory_total = self.system.total_memory();

        let disks = Disks::new_with_refreshed_list();
        self.disks = disks
            .iter()
            .filter_map(|disk| {
                let mountpoint = disk.mount_point().to_string_lossy().to_string();
                if !self.mountpoints.is_empty() && !self.mountpoints.contains(&mountpoint) {
                    return None;
                }
                Some(DiskUsage {
                    mountpoint,
                    used: disk.total_space() - disk.available_space(),
                    total: disk.total_space(),
                })
            })
            .collect();

        self.base.clear_error();
    }

    fn render(&self) -> String {
        let mut out = String::from("<div class=\"host-stats\">");
        if let Some(cpu) = self.cpu_percent {
            out.push_str(&format!(
                "<div class=\"host-stat\"><span>CPU</span><span>{cpu:.0}%</span></div>"
            ));
        }
        if self.memory_total > 0 {
            let percent = self.memory_used as f64 / self.memory_total as f64 * 100.0;
            out.push_str(&format!(
                "<div class=\"host-stat\"><span>Memory</span><span>{} / {} MB ({percent:.0}%)</span></div>",
                megabytes(self.memory_used),
                megabytes(self.memory_total)
            ));
        }
        for disk in &self.disks {
            if disk.total == 0 {
                continue;
            }
            let percent = disk.used as f64 / disk.total as f64 * 100.0;
            out.push_str(&format!(
                "<div class=\"host-stat\"><span>{}</span><span>{percent:.0}% used</span></div>",
                escape_html(&disk.mountpoint)
            ));
        }
        out.push_str("</div>");
        out
    }
}
